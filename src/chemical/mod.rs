pub mod replicates;

use std::collections::HashMap;

use chrono::NaiveDate;
use serde::Serialize;
use tracing::debug;

use crate::store::SqliteStore;

pub const NEUTRAL_PH: f64 = 7.0;

#[derive(Debug, thiserror::Error)]
pub enum ChemicalError {
    #[error("{0}")]
    Sqlite(#[from] rusqlite::Error),
    #[error("no reference values are loaded; statuses cannot be classified")]
    NoReferenceData,
    #[error("replicate group at site {site_id} on {collection_date} failed: {source}")]
    GroupFailed {
        site_id: i64,
        collection_date: NaiveDate,
        #[source]
        source: rusqlite::Error,
    },
    #[error("parameter `{parameter}` has no `{threshold}` reference value")]
    MissingReference {
        parameter: String,
        threshold: &'static str,
    },
}

/// How replicate readings of one parameter collapse to a single value.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum WorstCase {
    FurthestFromNeutral,
    Minimum,
    Maximum,
}

impl WorstCase {
    pub fn for_parameter(parameter_code: &str) -> Self {
        match parameter_code {
            "pH" => WorstCase::FurthestFromNeutral,
            "do_percent" => WorstCase::Minimum,
            _ => WorstCase::Maximum,
        }
    }

    fn is_worse(self, candidate: f64, current: f64) -> bool {
        match self {
            WorstCase::FurthestFromNeutral => {
                (candidate - NEUTRAL_PH).abs() > (current - NEUTRAL_PH).abs()
            }
            WorstCase::Minimum => candidate < current,
            WorstCase::Maximum => candidate > current,
        }
    }

    /// Nulls and NaN are skipped. On ties the earliest value is kept.
    pub fn select<I>(self, values: I) -> Option<f64>
    where
        I: IntoIterator<Item = Option<f64>>,
    {
        values
            .into_iter()
            .flatten()
            .filter(|value| !value.is_nan())
            .fold(None, |best, value| match best {
                Some(current) if !self.is_worse(value, current) => Some(current),
                _ => Some(value),
            })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum ChemicalStatus {
    Normal,
    Caution,
    Poor,
    BelowNormal,
    AboveNormal,
}

impl ChemicalStatus {
    pub fn label(self) -> &'static str {
        match self {
            ChemicalStatus::Normal => "Normal",
            ChemicalStatus::Caution => "Caution",
            ChemicalStatus::Poor => "Poor",
            ChemicalStatus::BelowNormal => "Below Normal",
            ChemicalStatus::AboveNormal => "Above Normal",
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct Thresholds {
    pub normal_min: Option<f64>,
    pub normal_max: Option<f64>,
    pub caution_min: Option<f64>,
    pub caution_max: Option<f64>,
    pub normal: Option<f64>,
    pub caution: Option<f64>,
}

impl Thresholds {
    fn set(&mut self, threshold_type: &str, value: f64) -> bool {
        let slot = match threshold_type {
            "normal_min" => &mut self.normal_min,
            "normal_max" => &mut self.normal_max,
            "caution_min" => &mut self.caution_min,
            "caution_max" => &mut self.caution_max,
            "normal" => &mut self.normal,
            "caution" => &mut self.caution,
            _ => return false,
        };
        *slot = Some(value);
        true
    }
}

/// Reference thresholds keyed by parameter code.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ReferenceTable {
    by_parameter: HashMap<String, Thresholds>,
}

impl ReferenceTable {
    pub fn load(store: &SqliteStore) -> rusqlite::Result<Self> {
        let mut stmt = store.conn().prepare(
            "SELECT p.parameter_code, r.threshold_type, r.value
             FROM chemical_reference_values r
             JOIN chemical_parameters p ON p.parameter_id = r.parameter_id",
        )?;
        let mut rows = stmt.query([])?;
        let mut table = Self::default();
        while let Some(row) = rows.next()? {
            let code: String = row.get(0)?;
            let threshold_type: String = row.get(1)?;
            table.insert(&code, &threshold_type, row.get(2)?);
        }
        Ok(table)
    }

    pub fn insert(&mut self, parameter_code: &str, threshold_type: &str, value: f64) {
        let known = self
            .by_parameter
            .entry(parameter_code.to_string())
            .or_default()
            .set(threshold_type, value);
        if !known {
            debug!(parameter = parameter_code, threshold_type, "ignoring unknown threshold type");
        }
    }

    pub fn is_empty(&self) -> bool {
        self.by_parameter.is_empty()
    }

    pub fn classify(
        &self,
        parameter_code: &str,
        value: f64,
    ) -> Result<ChemicalStatus, ChemicalError> {
        let thresholds = self.by_parameter.get(parameter_code).copied().unwrap_or_default();
        let need = |found: Option<f64>, threshold: &'static str| {
            found.ok_or_else(|| ChemicalError::MissingReference {
                parameter: parameter_code.to_string(),
                threshold,
            })
        };

        let status = match parameter_code {
            "do_percent" => {
                let caution_min = need(thresholds.caution_min, "caution_min")?;
                let caution_max = need(thresholds.caution_max, "caution_max")?;
                let normal_min = need(thresholds.normal_min, "normal_min")?;
                let normal_max = need(thresholds.normal_max, "normal_max")?;
                if value < caution_min || value > caution_max {
                    ChemicalStatus::Poor
                } else if value < normal_min || value > normal_max {
                    ChemicalStatus::Caution
                } else {
                    ChemicalStatus::Normal
                }
            }
            "pH" => {
                let normal_min = need(thresholds.normal_min, "normal_min")?;
                let normal_max = need(thresholds.normal_max, "normal_max")?;
                if value < normal_min {
                    ChemicalStatus::BelowNormal
                } else if value > normal_max {
                    ChemicalStatus::AboveNormal
                } else {
                    ChemicalStatus::Normal
                }
            }
            _ => {
                let caution = need(thresholds.caution, "caution")?;
                let normal = need(thresholds.normal, "normal")?;
                if value > caution {
                    ChemicalStatus::Poor
                } else if value > normal {
                    ChemicalStatus::Caution
                } else {
                    ChemicalStatus::Normal
                }
            }
        };
        Ok(status)
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;

    pub(crate) fn reference_table() -> ReferenceTable {
        let mut table = ReferenceTable::default();
        for (code, threshold_type, value) in [
            ("do_percent", "normal_min", 80.0),
            ("do_percent", "normal_max", 130.0),
            ("do_percent", "caution_min", 50.0),
            ("do_percent", "caution_max", 150.0),
            ("pH", "normal_min", 6.5),
            ("pH", "normal_max", 9.0),
            ("soluble_nitrogen", "normal", 0.8),
            ("soluble_nitrogen", "caution", 1.5),
            ("Phosphorus", "normal", 0.05),
            ("Phosphorus", "caution", 0.1),
            ("Chloride", "normal", 200.0),
            ("Chloride", "caution", 250.0),
        ] {
            table.insert(code, threshold_type, value);
        }
        table
    }

    #[test]
    fn worst_case_rules_pick_expected_values() {
        let ph = WorstCase::for_parameter("pH");
        assert_eq!(ph.select([Some(6.5), Some(8.2), Some(7.1)]), Some(8.2));

        let oxygen = WorstCase::for_parameter("do_percent");
        assert_eq!(oxygen.select([Some(85.0), Some(75.0), Some(90.0)]), Some(75.0));

        let nutrient = WorstCase::for_parameter("Phosphorus");
        assert_eq!(nutrient.select([Some(150.0), Some(200.0), Some(180.0)]), Some(200.0));
    }

    #[test]
    fn worst_case_skips_nulls_and_keeps_first_on_ties() {
        let ph = WorstCase::FurthestFromNeutral;
        assert_eq!(ph.select([None, Some(6.0), Some(8.0)]), Some(6.0));
        assert_eq!(ph.select([None, None]), None);
        assert_eq!(WorstCase::Maximum.select([Some(f64::NAN), Some(1.0)]), Some(1.0));
    }

    #[test]
    fn classifies_each_parameter_family() {
        let table = reference_table();
        assert_eq!(table.classify("do_percent", 40.0).expect("status"), ChemicalStatus::Poor);
        assert_eq!(table.classify("do_percent", 75.0).expect("status"), ChemicalStatus::Caution);
        assert_eq!(table.classify("do_percent", 100.0).expect("status"), ChemicalStatus::Normal);
        assert_eq!(table.classify("pH", 6.0).expect("status"), ChemicalStatus::BelowNormal);
        assert_eq!(table.classify("pH", 9.5).expect("status"), ChemicalStatus::AboveNormal);
        assert_eq!(table.classify("pH", 7.5).expect("status"), ChemicalStatus::Normal);
        assert_eq!(table.classify("Chloride", 260.0).expect("status"), ChemicalStatus::Poor);
        assert_eq!(table.classify("Chloride", 210.0).expect("status"), ChemicalStatus::Caution);
        assert_eq!(table.classify("Chloride", 200.0).expect("status"), ChemicalStatus::Normal);
        assert_eq!(ChemicalStatus::BelowNormal.label(), "Below Normal");
    }

    #[test]
    fn missing_thresholds_are_reported_not_defaulted() {
        let mut table = ReferenceTable::default();
        table.insert("pH", "normal_min", 6.5);
        let err = table.classify("pH", 7.0).expect_err("normal_max missing");
        assert!(matches!(
            err,
            ChemicalError::MissingReference { threshold: "normal_max", .. }
        ));
        assert!(matches!(
            table.classify("Chloride", 10.0),
            Err(ChemicalError::MissingReference { .. })
        ));
    }

    #[test]
    fn loads_thresholds_from_store() {
        let store = SqliteStore::open_in_memory().expect("open store");
        assert!(ReferenceTable::load(&store).expect("load").is_empty());
        store.set_reference_value("pH", "normal_min", 6.5).expect("set");
        store.set_reference_value("pH", "normal_max", 9.0).expect("set");
        let table = ReferenceTable::load(&store).expect("load");
        assert_eq!(table.classify("pH", 9.1).expect("status"), ChemicalStatus::AboveNormal);
    }
}
