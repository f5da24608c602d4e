use std::collections::HashSet;
use std::fs;
use std::io;
use std::path::Path;

use serde::Serialize;
use sha2::{Digest, Sha256};
use tracing::{debug, error, info, warn};

use crate::config::SourceSpec;
use crate::sites::{CandidateSite, SiteMetadata, normalize_site_name};

#[derive(Debug, thiserror::Error)]
pub enum ExtractError {
    #[error("{0}")]
    Io(#[from] io::Error),
    #[error("{0}")]
    Csv(#[from] csv::Error),
    #[error("source `{source_id}` has no `{column}` column")]
    MissingColumn { source_id: String, column: String },
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "state", content = "detail", rename_all = "snake_case")]
pub enum ExtractStatus {
    Loaded,
    Missing,
    Unreadable(String),
}

/// Candidates pulled from one source plus what happened while reading it.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ExtractedSource {
    pub source_id: String,
    pub priority: u32,
    pub status: ExtractStatus,
    /// SHA-256 of the file as read.
    pub fingerprint: Option<String>,
    pub candidates: Vec<CandidateSite>,
}

/// Reads one source file. Absent or unreadable files yield no candidates.
pub fn extract_source(spec: &SourceSpec, path: &Path) -> ExtractedSource {
    let mut extracted = ExtractedSource {
        source_id: spec.id.clone(),
        priority: spec.priority,
        status: ExtractStatus::Loaded,
        fingerprint: None,
        candidates: Vec::new(),
    };

    let bytes = match fs::read(path) {
        Ok(bytes) => bytes,
        Err(err) if err.kind() == io::ErrorKind::NotFound => {
            warn!(source = %spec.id, path = %path.display(), "source file not found, skipping");
            extracted.status = ExtractStatus::Missing;
            return extracted;
        }
        Err(err) => {
            error!(source = %spec.id, path = %path.display(), %err, "source file unreadable");
            extracted.status = ExtractStatus::Unreadable(err.to_string());
            return extracted;
        }
    };
    extracted.fingerprint = Some(sha256_hex(&bytes));

    match read_candidates(bytes.as_slice(), spec) {
        Ok(candidates) => {
            if candidates.is_empty() {
                warn!(source = %spec.id, "source produced no site names");
            } else {
                info!(source = %spec.id, sites = candidates.len(), "extracted candidate sites");
            }
            extracted.candidates = candidates;
        }
        Err(err) => {
            error!(source = %spec.id, %err, "failed to extract sites");
            extracted.status = ExtractStatus::Unreadable(err.to_string());
        }
    }
    extracted
}

/// Parses CSV rows into one candidate per normalized site name; the first row wins.
pub fn read_candidates<R: io::Read>(
    reader: R,
    spec: &SourceSpec,
) -> Result<Vec<CandidateSite>, ExtractError> {
    let mut csv_reader = csv::ReaderBuilder::new()
        .has_headers(true)
        .flexible(true)
        .from_reader(reader);
    let headers = csv_reader.headers()?.clone();
    let position = |column: &Option<String>| -> Option<usize> {
        let name = column.as_deref()?;
        let found = headers.iter().position(|header| header.trim() == name);
        if found.is_none() {
            debug!(source = %spec.id, column = name, "optional column absent");
        }
        found
    };

    let site_idx = headers
        .iter()
        .position(|header| header.trim() == spec.columns.site)
        .ok_or_else(|| ExtractError::MissingColumn {
            source_id: spec.id.clone(),
            column: spec.columns.site.clone(),
        })?;
    let lat_idx = position(&spec.columns.latitude);
    let lon_idx = position(&spec.columns.longitude);
    let county_idx = position(&spec.columns.county);
    let basin_idx = position(&spec.columns.river_basin);
    let eco_idx = position(&spec.columns.ecoregion);

    let mut seen = HashSet::new();
    let mut out = Vec::new();
    for record in csv_reader.records() {
        let record = record?;
        let site_name = normalize_site_name(record.get(site_idx).unwrap_or_default());
        if site_name.is_empty() || !seen.insert(site_name.clone()) {
            continue;
        }
        let cell = |idx: Option<usize>| text_cell(idx.and_then(|idx| record.get(idx)));
        out.push(CandidateSite {
            site_name,
            metadata: SiteMetadata {
                latitude: float_cell(lat_idx.and_then(|idx| record.get(idx))),
                longitude: float_cell(lon_idx.and_then(|idx| record.get(idx))),
                county: cell(county_idx),
                river_basin: cell(basin_idx),
                ecoregion: cell(eco_idx),
            },
            source_id: spec.id.clone(),
            source_priority: spec.priority,
        });
    }
    Ok(out)
}

/// Extracts every source, ordered by priority. Equal priorities keep config order.
pub fn extract_all<F>(specs: &[SourceSpec], resolve: F) -> Vec<ExtractedSource>
where
    F: Fn(&SourceSpec) -> std::path::PathBuf,
{
    let mut ordered: Vec<&SourceSpec> = specs.iter().collect();
    ordered.sort_by_key(|spec| spec.priority);
    ordered
        .into_iter()
        .map(|spec| extract_source(spec, &resolve(spec)))
        .collect()
}

fn text_cell(raw: Option<&str>) -> Option<String> {
    let trimmed = raw?.trim();
    if trimmed.is_empty() {
        None
    } else {
        Some(trimmed.to_string())
    }
}

fn float_cell(raw: Option<&str>) -> Option<f64> {
    raw?.trim().parse::<f64>().ok().filter(|value| value.is_finite())
}

pub fn sha256_hex(bytes: &[u8]) -> String {
    Sha256::digest(bytes)
        .iter()
        .map(|byte| format!("{byte:02x}"))
        .collect()
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::config::SourceColumns;

    pub(crate) fn spec(id: &str, priority: u32) -> SourceSpec {
        SourceSpec {
            id: id.to_string(),
            path: format!("{id}.csv"),
            description: id.to_string(),
            priority,
            columns: SourceColumns {
                site: "SiteName".to_string(),
                latitude: Some("Latitude".to_string()),
                longitude: Some("Longitude".to_string()),
                county: Some("County".to_string()),
                river_basin: Some("RiverBasin".to_string()),
                ecoregion: None,
            },
        }
    }

    #[test]
    fn keeps_first_row_per_normalized_name_and_drops_blank_names() {
        let csv = "SiteName,Latitude,Longitude,County,RiverBasin\n\
                   Bird  Creek ,36.51,-95.9,Osage,\n\
                   Bird Creek,40.0,-90.0,Tulsa,Verdigris\n\
                   \"   \",1,2,X,Y\n\
                   Coal Creek,n/a,-95.1,,Arkansas\n";
        let candidates = read_candidates(csv.as_bytes(), &spec("site_data", 1)).expect("parse");

        assert_eq!(candidates.len(), 2);
        assert_eq!(candidates[0].site_name, "Bird Creek");
        assert_eq!(candidates[0].metadata.latitude, Some(36.51));
        assert_eq!(candidates[0].metadata.county.as_deref(), Some("Osage"));
        assert_eq!(candidates[0].metadata.river_basin, None);
        assert_eq!(candidates[1].site_name, "Coal Creek");
        assert_eq!(candidates[1].metadata.latitude, None);
        assert_eq!(candidates[1].metadata.county, None);
        assert_eq!(candidates[1].source_priority, 1);
    }

    #[test]
    fn optional_columns_missing_from_file_are_absent_fields() {
        let csv = "SiteName,Latitude\nFlint Creek,36.2\n";
        let candidates = read_candidates(csv.as_bytes(), &spec("habitat", 6)).expect("parse");
        assert_eq!(candidates[0].metadata.latitude, Some(36.2));
        assert_eq!(candidates[0].metadata.longitude, None);
    }

    #[test]
    fn missing_site_column_is_an_error() {
        let csv = "Name,Latitude\nFlint Creek,36.2\n";
        let err = read_candidates(csv.as_bytes(), &spec("habitat", 6)).expect_err("no site column");
        assert!(matches!(err, ExtractError::MissingColumn { .. }));
    }

    #[test]
    fn missing_file_is_skipped_not_fatal() {
        let dir = tempfile::tempdir().expect("tempdir");
        let extracted = extract_source(&spec("fish", 3), &dir.path().join("absent.csv"));
        assert_eq!(extracted.status, ExtractStatus::Missing);
        assert!(extracted.candidates.is_empty());
        assert!(extracted.fingerprint.is_none());
    }

    #[test]
    fn extract_all_orders_by_priority_and_fingerprints_files() {
        let dir = tempfile::tempdir().expect("tempdir");
        std::fs::write(dir.path().join("low.csv"), "SiteName\nA\n").expect("write low");
        std::fs::write(dir.path().join("high.csv"), "SiteName\nB\n").expect("write high");

        let specs = vec![spec("low", 5), spec("high", 1)];
        let extracted = extract_all(&specs, |spec| dir.path().join(&spec.path));
        assert_eq!(extracted[0].source_id, "high");
        assert_eq!(extracted[1].source_id, "low");
        assert_eq!(
            extracted[0].fingerprint.as_deref(),
            Some(sha256_hex(b"SiteName\nB\n").as_str())
        );
    }
}
