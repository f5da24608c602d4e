use std::fs;
use std::io;
use std::path::{Path, PathBuf};

use serde::Serialize;
use tracing::info;

use crate::sites::{ConflictRecord, ConsolidatedSite, SiteField, SiteMetadata};
use crate::store::atomic::write_report_file;

pub const CONFLICT_REPORT: &str = "site_conflicts_for_review.csv";
pub const CONSOLIDATED_SITES: &str = "consolidated_sites.csv";

#[derive(Debug, thiserror::Error)]
pub enum ReportError {
    #[error("{0}")]
    Io(#[from] std::io::Error),
    #[error("{0}")]
    Csv(#[from] csv::Error),
    #[error("{0}")]
    Json(#[from] serde_json::Error),
}

fn render_record(metadata: &SiteMetadata) -> Result<String, ReportError> {
    Ok(serde_json::to_string(metadata)?)
}

fn render_conflicts(record: &ConflictRecord) -> String {
    record
        .conflicts
        .iter()
        .map(|conflict| {
            format!(
                "{}: '{}' vs '{}'",
                conflict.field.name(),
                conflict.existing,
                conflict.incoming
            )
        })
        .collect::<Vec<_>>()
        .join("; ")
}

pub fn conflict_csv(conflicts: &[ConflictRecord]) -> Result<Vec<u8>, ReportError> {
    let mut writer = csv::Writer::from_writer(Vec::new());
    writer.write_record([
        "site_name",
        "conflicts",
        "existing_source",
        "new_source",
        "existing_record",
        "new_record",
    ])?;
    for record in conflicts {
        writer.write_record([
            record.site_name.clone(),
            render_conflicts(record),
            record.existing_source.clone(),
            record.incoming_source.clone(),
            render_record(&record.existing)?,
            render_record(&record.incoming)?,
        ])?;
    }
    writer
        .into_inner()
        .map_err(|err| ReportError::Io(err.into_error()))
}

/// Writes the conflict report. A clean run removes any report left by an
/// earlier one.
pub fn write_conflict_report(
    report_dir: &Path,
    conflicts: &[ConflictRecord],
) -> Result<Option<PathBuf>, ReportError> {
    let path = report_dir.join(CONFLICT_REPORT);
    if conflicts.is_empty() {
        match fs::remove_file(&path) {
            Ok(()) => info!(path = %path.display(), "removed stale conflict report"),
            Err(err) if err.kind() == io::ErrorKind::NotFound => {}
            Err(err) => return Err(err.into()),
        }
        return Ok(None);
    }
    write_report_file(&path, &conflict_csv(conflicts)?)?;
    info!(path = %path.display(), conflicts = conflicts.len(), "wrote conflict report");
    Ok(Some(path))
}

pub fn consolidated_sites_csv(sites: &[ConsolidatedSite]) -> Result<Vec<u8>, ReportError> {
    let mut writer = csv::Writer::from_writer(Vec::new());
    let mut header = vec!["site_name"];
    header.extend(SiteField::ALL.iter().map(|field| field.name()));
    let provenance_columns: Vec<String> = SiteField::ALL
        .iter()
        .map(|field| format!("{}_source", field.name()))
        .collect();
    header.extend(provenance_columns.iter().map(String::as_str));
    header.push("source");
    writer.write_record(&header)?;
    for site in sites {
        let mut row = vec![site.site_name.clone()];
        row.extend(
            SiteField::ALL
                .iter()
                .map(|field| site.metadata.render(*field).unwrap_or_default()),
        );
        row.extend(
            SiteField::ALL
                .iter()
                .map(|field| site.provenance.get(field).cloned().unwrap_or_default()),
        );
        row.push(site.source_id.clone());
        writer.write_record(&row)?;
    }
    writer
        .into_inner()
        .map_err(|err| ReportError::Io(err.into_error()))
}

pub fn write_consolidated_sites(
    report_dir: &Path,
    sites: &[ConsolidatedSite],
) -> Result<PathBuf, ReportError> {
    let path = report_dir.join(CONSOLIDATED_SITES);
    write_report_file(&path, &consolidated_sites_csv(sites)?)?;
    Ok(path)
}

/// Persists a command's JSON result as `<command>-summary.json`.
pub fn write_run_summary<T: Serialize>(
    report_dir: &Path,
    command: &str,
    summary: &T,
) -> Result<PathBuf, ReportError> {
    let path = report_dir.join(format!("{command}-summary.json"));
    let mut bytes = serde_json::to_vec_pretty(summary)?;
    bytes.push(b'\n');
    write_report_file(&path, &bytes)?;
    Ok(path)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sites::FieldConflict;

    fn conflict() -> ConflictRecord {
        ConflictRecord {
            site_name: "Bird Creek".to_string(),
            conflicts: vec![FieldConflict {
                field: SiteField::County,
                existing: "Tulsa".to_string(),
                incoming: "Osage".to_string(),
            }],
            existing_source: "site_data".to_string(),
            incoming_source: "chemical".to_string(),
            existing: SiteMetadata {
                county: Some("Tulsa".to_string()),
                ..SiteMetadata::default()
            },
            incoming: SiteMetadata {
                county: Some("Osage".to_string()),
                ..SiteMetadata::default()
            },
        }
    }

    #[test]
    fn conflict_report_has_review_columns() {
        let bytes = conflict_csv(&[conflict()]).expect("csv");
        let mut reader = csv::Reader::from_reader(bytes.as_slice());
        let headers = reader.headers().expect("headers").clone();
        assert_eq!(
            headers.iter().collect::<Vec<_>>(),
            vec![
                "site_name",
                "conflicts",
                "existing_source",
                "new_source",
                "existing_record",
                "new_record"
            ]
        );
        let row = reader.records().next().expect("row").expect("record");
        assert_eq!(&row[1], "county: 'Tulsa' vs 'Osage'");
        assert_eq!(&row[3], "chemical");
        assert!(row[4].contains("Tulsa"));
    }

    #[test]
    fn clean_run_removes_stale_conflict_report() {
        let dir = tempfile::tempdir().expect("tempdir");
        assert_eq!(write_conflict_report(dir.path(), &[]).expect("write"), None);
        assert!(!dir.path().join(CONFLICT_REPORT).exists());

        let path = write_conflict_report(dir.path(), &[conflict()])
            .expect("write")
            .expect("path");
        assert!(fs::read_to_string(&path).expect("read").contains("Bird Creek"));

        assert_eq!(write_conflict_report(dir.path(), &[]).expect("clean run"), None);
        assert!(!path.exists());
    }

    #[test]
    fn consolidated_sites_carry_field_provenance() {
        let mut site = ConsolidatedSite {
            site_name: "Bird Creek".to_string(),
            metadata: SiteMetadata {
                latitude: Some(36.1234),
                county: Some("Tulsa".to_string()),
                river_basin: Some("Verdigris".to_string()),
                ..SiteMetadata::default()
            },
            source_id: "site_data".to_string(),
            source_priority: 1,
            provenance: Default::default(),
        };
        site.provenance.insert(SiteField::Latitude, "site_data".to_string());
        site.provenance.insert(SiteField::County, "site_data".to_string());
        site.provenance.insert(SiteField::RiverBasin, "chemical".to_string());

        let bytes = consolidated_sites_csv(&[site]).expect("csv");
        let mut reader = csv::Reader::from_reader(bytes.as_slice());
        let headers = reader.headers().expect("headers").clone();
        let row = reader.records().next().expect("row").expect("record");
        let column = |name: &str| {
            let index = headers
                .iter()
                .position(|header| header == name)
                .unwrap_or_else(|| panic!("missing column {name}"));
            row[index].to_string()
        };
        assert_eq!(column("latitude_source"), "site_data");
        assert_eq!(column("county_source"), "site_data");
        assert_eq!(column("river_basin_source"), "chemical");
        assert_eq!(column("longitude_source"), "");
        assert_eq!(column("ecoregion_source"), "");
        assert_eq!(column("source"), "site_data");
    }

    #[test]
    fn run_summary_is_pretty_json() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = write_run_summary(dir.path(), "average-habitat", &serde_json::json!({"groups": 2}))
            .expect("write");
        assert!(path.ends_with("average-habitat-summary.json"));
        let parsed: serde_json::Value =
            serde_json::from_str(&fs::read_to_string(path).expect("read")).expect("json");
        assert_eq!(parsed["groups"], 2);
    }
}
