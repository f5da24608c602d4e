use std::fs::{self, File, OpenOptions};
use std::io::{self, Write};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};

static SEQUENCE: AtomicU64 = AtomicU64::new(0);
const STAGING_PREFIX: &str = ".reconcile-staging.";

/// Staged file removed on drop unless it was renamed into place.
struct Staged {
    path: PathBuf,
    published: bool,
}

impl Drop for Staged {
    fn drop(&mut self) {
        if !self.published {
            let _ = fs::remove_file(&self.path);
        }
    }
}

/// Replaces `target` with `bytes` so readers never observe a half-written report.
pub fn write_report_file(target: &Path, bytes: &[u8]) -> io::Result<()> {
    let dir = match target.parent() {
        Some(dir) if !dir.as_os_str().is_empty() => dir,
        _ => Path::new("."),
    };
    fs::create_dir_all(dir)?;

    let file_name = target
        .file_name()
        .and_then(|name| name.to_str())
        .ok_or_else(|| io::Error::new(io::ErrorKind::InvalidInput, "report path has no file name"))?;
    let mut staged = Staged {
        path: dir.join(format!(
            "{STAGING_PREFIX}{file_name}.{}.{}",
            std::process::id(),
            SEQUENCE.fetch_add(1, Ordering::Relaxed)
        )),
        published: false,
    };

    let mut file = OpenOptions::new()
        .write(true)
        .create_new(true)
        .open(&staged.path)?;
    file.write_all(bytes)?;
    file.sync_all()?;
    drop(file);

    fs::rename(&staged.path, target)?;
    staged.published = true;
    sync_dir(dir)
}

#[cfg(unix)]
fn sync_dir(dir: &Path) -> io::Result<()> {
    File::open(dir)?.sync_all()
}

#[cfg(not(unix))]
fn sync_dir(_dir: &Path) -> io::Result<()> {
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::{STAGING_PREFIX, write_report_file};
    use std::fs;

    #[test]
    fn replaces_existing_report_and_leaves_no_staging_files() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("reports/conflicts.csv");

        write_report_file(&path, b"site_name\n").expect("first write");
        write_report_file(&path, b"site_name\nBird Creek\n").expect("second write");

        let content = fs::read_to_string(&path).expect("read report");
        assert_eq!(content, "site_name\nBird Creek\n");

        let leftovers = fs::read_dir(path.parent().expect("parent"))
            .expect("list dir")
            .filter_map(Result::ok)
            .map(|entry| entry.file_name().to_string_lossy().to_string())
            .filter(|name| name.starts_with(STAGING_PREFIX))
            .collect::<Vec<_>>();
        assert!(leftovers.is_empty(), "staging files left behind: {leftovers:?}");
    }
}
