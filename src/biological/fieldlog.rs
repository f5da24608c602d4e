use std::collections::BTreeSet;
use std::fs::File;
use std::io;
use std::path::Path;

use chrono::{Datelike, NaiveDate, NaiveDateTime};
use serde::Serialize;
use tracing::{debug, info, warn};

use crate::biological::Similarity;
use crate::config::FieldLogSpec;
use crate::sites::normalize_site_name;

const DATE_FORMATS: [&str; 3] = ["%Y-%m-%d", "%m/%d/%Y", "%m/%d/%y"];
const DATETIME_FORMATS: [&str; 2] = ["%Y-%m-%d %H:%M:%S", "%m/%d/%Y %H:%M"];

#[derive(Debug, thiserror::Error)]
pub enum FieldLogError {
    #[error("{0}")]
    Io(#[from] io::Error),
    #[error("{0}")]
    Csv(#[from] csv::Error),
    #[error("field log has no `{0}` column")]
    MissingColumn(String),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum EntryKind {
    Original,
    Replicate,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct FieldLogEntry {
    pub site_name: String,
    pub date: NaiveDate,
    pub kind: EntryKind,
}

/// The original and replicate collection dates for one site and year.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct ReplicatePair {
    pub year: i32,
    pub original: NaiveDate,
    pub replicate: NaiveDate,
}

impl ReplicatePair {
    /// (earlier, later)
    pub fn ordered(&self) -> (NaiveDate, NaiveDate) {
        if self.original <= self.replicate {
            (self.original, self.replicate)
        } else {
            (self.replicate, self.original)
        }
    }
}

/// Known field collections, used to tell replicates from duplicate entry.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct FieldLog {
    entries: Vec<FieldLogEntry>,
    sites: BTreeSet<String>,
}

impl FieldLog {
    pub fn new(entries: Vec<FieldLogEntry>) -> Self {
        let sites = entries.iter().map(|entry| entry.site_name.clone()).collect();
        Self { entries, sites }
    }

    /// Reads the log; a missing file is an empty log.
    pub fn load(spec: &FieldLogSpec, path: &Path) -> Result<Self, FieldLogError> {
        match File::open(path) {
            Ok(file) => {
                let log = Self::read(file, spec)?;
                info!(entries = log.entries.len(), sites = log.sites.len(), "loaded field log");
                Ok(log)
            }
            Err(err) if err.kind() == io::ErrorKind::NotFound => {
                warn!(path = %path.display(), "field log not found; every group will be averaged");
                Ok(Self::default())
            }
            Err(err) => Err(err.into()),
        }
    }

    pub fn read<R: io::Read>(reader: R, spec: &FieldLogSpec) -> Result<Self, FieldLogError> {
        let mut csv_reader = csv::ReaderBuilder::new()
            .has_headers(true)
            .flexible(true)
            .from_reader(reader);
        let headers = csv_reader.headers()?.clone();
        let column = |name: &str| {
            headers
                .iter()
                .position(|header| header.trim() == name)
                .ok_or_else(|| FieldLogError::MissingColumn(name.to_string()))
        };
        let site_idx = column(&spec.site_column)?;
        let date_idx = column(&spec.date_column)?;
        let marker_idx = headers
            .iter()
            .position(|header| header.trim() == spec.marker_column);

        let mut entries = Vec::new();
        for record in csv_reader.records() {
            let record = record?;
            let site_name = normalize_site_name(record.get(site_idx).unwrap_or_default());
            if site_name.is_empty() {
                continue;
            }
            let raw_date = record.get(date_idx).unwrap_or_default();
            let Some(date) = parse_log_date(raw_date) else {
                warn!(site = %site_name, date = raw_date, "dropping field log row with unparseable date");
                continue;
            };
            let marker = marker_idx
                .and_then(|idx| record.get(idx))
                .unwrap_or_default();
            entries.push(FieldLogEntry {
                site_name,
                date,
                kind: marker_kind(marker),
            });
        }
        Ok(Self::new(entries))
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn entries(&self) -> &[FieldLogEntry] {
        &self.entries
    }

    /// Exact name first, then the most similar log name scoring strictly above
    /// `threshold`. Equal scores go to the first name in sort order.
    pub fn match_site(
        &self,
        site_name: &str,
        similarity: &dyn Similarity,
        threshold: f64,
    ) -> Option<&str> {
        if let Some(exact) = self.sites.get(site_name) {
            return Some(exact.as_str());
        }
        let mut best: Option<(&str, f64)> = None;
        for candidate in &self.sites {
            let score = similarity.similarity(site_name, candidate);
            if score > threshold && best.is_none_or(|(_, top)| score > top) {
                best = Some((candidate.as_str(), score));
            }
        }
        if let Some((name, score)) = best {
            debug!(site = site_name, matched = name, score, "fuzzy field log match");
        }
        best.map(|(name, _)| name)
    }

    /// Searches the target year, then the year before, then the year after.
    pub fn replicate_pair(&self, log_site: &str, year: i32) -> Option<ReplicatePair> {
        [year, year - 1, year + 1]
            .into_iter()
            .find_map(|check_year| self.pair_in_year(log_site, check_year))
    }

    fn pair_in_year(&self, log_site: &str, year: i32) -> Option<ReplicatePair> {
        let in_year = move || {
            self.entries
                .iter()
                .filter(move |entry| entry.site_name == log_site && entry.date.year() == year)
        };
        let replicate = in_year()
            .filter(|entry| entry.kind == EntryKind::Replicate)
            .map(|entry| entry.date)
            .min()?;
        let originals = move || {
            in_year()
                .filter(|entry| entry.kind == EntryKind::Original)
                .map(|entry| entry.date)
        };
        let original = originals()
            .filter(|date| *date < replicate)
            .max()
            .or_else(|| originals().min())?;
        Some(ReplicatePair {
            year,
            original,
            replicate,
        })
    }
}

fn marker_kind(marker: &str) -> EntryKind {
    if marker.to_ascii_lowercase().contains("rep") {
        EntryKind::Replicate
    } else {
        EntryKind::Original
    }
}

pub fn parse_log_date(raw: &str) -> Option<NaiveDate> {
    let trimmed = raw.trim();
    DATE_FORMATS
        .iter()
        .find_map(|format| NaiveDate::parse_from_str(trimmed, format).ok())
        .or_else(|| {
            DATETIME_FORMATS
                .iter()
                .find_map(|format| NaiveDateTime::parse_from_str(trimmed, format).ok())
                .map(|datetime| datetime.date())
        })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::biological::NormalizedLevenshtein;

    fn spec() -> FieldLogSpec {
        FieldLogSpec {
            path: "log.csv".to_string(),
            site_column: "Name".to_string(),
            date_column: "Date".to_string(),
            marker_column: "M/F/H".to_string(),
        }
    }

    fn date(y: i32, m: u32, d: u32) -> NaiveDate {
        NaiveDate::from_ymd_opt(y, m, d).expect("valid date")
    }

    #[test]
    fn reads_markers_dates_and_drops_bad_rows() {
        let csv = "Name,Date,M/F/H\n\
                   Bird Creek,5/1/2020,fish\n\
                   Bird  Creek,2020-05-15,REP\n\
                   Bird Creek,not a date,fish\n\
                   ,2020-05-20,fish\n";
        let log = FieldLog::read(csv.as_bytes(), &spec()).expect("read log");
        assert_eq!(
            log.entries(),
            &[
                FieldLogEntry {
                    site_name: "Bird Creek".to_string(),
                    date: date(2020, 5, 1),
                    kind: EntryKind::Original,
                },
                FieldLogEntry {
                    site_name: "Bird Creek".to_string(),
                    date: date(2020, 5, 15),
                    kind: EntryKind::Replicate,
                },
            ]
        );
    }

    #[test]
    fn missing_marker_column_treats_rows_as_originals() {
        let csv = "Name,Date\nBird Creek,2020-05-01\n";
        let log = FieldLog::read(csv.as_bytes(), &spec()).expect("read log");
        assert_eq!(log.entries()[0].kind, EntryKind::Original);
    }

    #[test]
    fn missing_date_column_is_an_error() {
        let csv = "Name,When\nBird Creek,2020-05-01\n";
        assert!(matches!(
            FieldLog::read(csv.as_bytes(), &spec()),
            Err(FieldLogError::MissingColumn(_))
        ));
    }

    #[test]
    fn absent_file_loads_as_empty_log() {
        let dir = tempfile::tempdir().expect("tempdir");
        let log = FieldLog::load(&spec(), &dir.path().join("missing.csv")).expect("load");
        assert!(log.is_empty());
    }

    #[test]
    fn exact_match_beats_fuzzy_and_threshold_is_strict() {
        let log = FieldLog::new(vec![
            FieldLogEntry {
                site_name: "Spring Creek @ Hwy 10".to_string(),
                date: date(2020, 5, 1),
                kind: EntryKind::Original,
            },
            FieldLogEntry {
                site_name: "Spring Creek @ Hwy 1".to_string(),
                date: date(2020, 5, 1),
                kind: EntryKind::Original,
            },
        ]);
        let sim = NormalizedLevenshtein;
        assert_eq!(
            log.match_site("Spring Creek @ Hwy 1", &sim, 0.9),
            Some("Spring Creek @ Hwy 1")
        );
        assert_eq!(
            log.match_site("spring creek @ hwy 10", &sim, 0.9),
            Some("Spring Creek @ Hwy 10")
        );
        assert_eq!(log.match_site("Coal Creek", &sim, 0.9), None);

        let exactly_threshold = |_: &str, _: &str| 0.9;
        assert_eq!(log.match_site("Anything", &exactly_threshold, 0.9), None);
    }

    #[test]
    fn replicate_search_prefers_target_year_then_previous_then_next() {
        let entry = |y, m, d, kind| FieldLogEntry {
            site_name: "Bird Creek".to_string(),
            date: date(y, m, d),
            kind,
        };
        let log = FieldLog::new(vec![
            entry(2019, 6, 1, EntryKind::Original),
            entry(2019, 6, 20, EntryKind::Replicate),
            entry(2021, 6, 2, EntryKind::Original),
            entry(2021, 6, 21, EntryKind::Replicate),
            entry(2022, 7, 1, EntryKind::Original),
        ]);

        let pair = log.replicate_pair("Bird Creek", 2020).expect("previous year");
        assert_eq!(pair.year, 2019);
        assert_eq!(pair.ordered(), (date(2019, 6, 1), date(2019, 6, 20)));

        let pair = log.replicate_pair("Bird Creek", 2022).expect("previous year");
        assert_eq!(pair.year, 2021);

        let pair = log.replicate_pair("Bird Creek", 2018).expect("next year");
        assert_eq!(pair.year, 2019);
        assert_eq!(pair.ordered(), (date(2019, 6, 1), date(2019, 6, 20)));

        assert!(log.replicate_pair("Bird Creek", 2024).is_none());
        assert!(log.replicate_pair("Coal Creek", 2019).is_none());
    }

    #[test]
    fn original_closest_before_replicate_is_chosen() {
        let entry = |m, d, kind| FieldLogEntry {
            site_name: "Bird Creek".to_string(),
            date: date(2020, m, d),
            kind,
        };
        let log = FieldLog::new(vec![
            entry(4, 1, EntryKind::Original),
            entry(5, 1, EntryKind::Original),
            entry(5, 15, EntryKind::Replicate),
            entry(9, 1, EntryKind::Original),
        ]);
        let pair = log.replicate_pair("Bird Creek", 2020).expect("pair");
        assert_eq!(pair.original, date(2020, 5, 1));
        assert_eq!(pair.replicate, date(2020, 5, 15));

        let only_later = FieldLog::new(vec![
            entry(5, 15, EntryKind::Replicate),
            entry(9, 1, EntryKind::Original),
        ]);
        let pair = only_later.replicate_pair("Bird Creek", 2020).expect("pair");
        assert_eq!(pair.ordered(), (date(2020, 5, 15), date(2020, 9, 1)));
    }
}
