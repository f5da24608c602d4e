use std::collections::HashMap;

use chrono::{Datelike, NaiveDate};
use rusqlite::{Connection, OptionalExtension, params};

use crate::biological::{BiologicalKind, GroupKey};
use crate::store::SqliteStore;

// Insert paths used by event loaders. The reconciliation passes only read,
// repoint, rewrite and delete these rows.
impl SqliteStore {
    pub fn insert_chemical_event(
        &self,
        site_id: i64,
        collection_date: NaiveDate,
    ) -> rusqlite::Result<i64> {
        self.conn().execute(
            "INSERT INTO chemical_collection_events (site_id, collection_date, year, month)
             VALUES (?1, ?2, ?3, ?4)",
            params![
                site_id,
                collection_date,
                collection_date.year(),
                collection_date.month()
            ],
        )?;
        Ok(self.conn().last_insert_rowid())
    }

    pub fn insert_chemical_measurement(
        &self,
        event_id: i64,
        parameter_code: &str,
        value: Option<f64>,
        status: Option<&str>,
    ) -> rusqlite::Result<()> {
        let parameter_id = Self::parameter_id_on(self.conn(), parameter_code)?;
        self.conn().execute(
            "INSERT INTO chemical_measurements (event_id, parameter_id, value, status)
             VALUES (?1, ?2, ?3, ?4)",
            params![event_id, parameter_id, value, status],
        )?;
        Ok(())
    }

    pub fn set_reference_value(
        &self,
        parameter_code: &str,
        threshold_type: &str,
        value: f64,
    ) -> rusqlite::Result<()> {
        let parameter_id = Self::parameter_id_on(self.conn(), parameter_code)?;
        self.conn().execute(
            "INSERT INTO chemical_reference_values (parameter_id, threshold_type, value)
             VALUES (?1, ?2, ?3)
             ON CONFLICT(parameter_id, threshold_type) DO UPDATE SET value = excluded.value",
            params![parameter_id, threshold_type, value],
        )?;
        Ok(())
    }

    fn parameter_id_on(conn: &Connection, parameter_code: &str) -> rusqlite::Result<i64> {
        conn.query_row(
            "SELECT parameter_id FROM chemical_parameters WHERE parameter_code = ?1",
            params![parameter_code],
            |row| row.get(0),
        )
        .optional()?
        .ok_or_else(|| {
            rusqlite::Error::InvalidParameterName(format!(
                "unknown chemical parameter `{parameter_code}`"
            ))
        })
    }

    pub fn insert_fish_event(
        &self,
        site_id: i64,
        sample_id: i64,
        collection_date: NaiveDate,
    ) -> rusqlite::Result<i64> {
        self.conn().execute(
            "INSERT INTO fish_collection_events (site_id, sample_id, collection_date, year)
             VALUES (?1, ?2, ?3, ?4)",
            params![site_id, sample_id, collection_date, collection_date.year()],
        )?;
        Ok(self.conn().last_insert_rowid())
    }

    pub fn insert_fish_metric(
        &self,
        event_id: i64,
        metric_name: &str,
        raw_value: Option<f64>,
        metric_score: Option<i64>,
    ) -> rusqlite::Result<()> {
        self.conn().execute(
            "INSERT INTO fish_metrics (event_id, metric_name, raw_value, metric_result, metric_score)
             VALUES (?1, ?2, ?3, ?3, ?4)",
            params![event_id, metric_name, raw_value, metric_score],
        )?;
        Ok(())
    }

    pub fn insert_fish_summary(
        &self,
        event_id: i64,
        total_score: Option<i64>,
        comparison_to_reference: Option<f64>,
        integrity_class: Option<&str>,
    ) -> rusqlite::Result<()> {
        self.conn().execute(
            "INSERT INTO fish_summary_scores
                (event_id, total_score, comparison_to_reference, integrity_class)
             VALUES (?1, ?2, ?3, ?4)",
            params![event_id, total_score, comparison_to_reference, integrity_class],
        )?;
        Ok(())
    }

    pub fn insert_macro_event(
        &self,
        site_id: i64,
        sample_id: i64,
        habitat: &str,
        season: Option<&str>,
        collection_date: NaiveDate,
    ) -> rusqlite::Result<i64> {
        self.conn().execute(
            "INSERT INTO macro_collection_events
                (site_id, sample_id, habitat, season, collection_date, year)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
            params![
                site_id,
                sample_id,
                habitat,
                season,
                collection_date,
                collection_date.year()
            ],
        )?;
        Ok(self.conn().last_insert_rowid())
    }

    pub fn insert_habitat_assessment(
        &self,
        site_id: i64,
        assessment_date: NaiveDate,
    ) -> rusqlite::Result<i64> {
        self.conn().execute(
            "INSERT INTO habitat_assessments (site_id, assessment_date, year)
             VALUES (?1, ?2, ?3)",
            params![site_id, assessment_date, assessment_date.year()],
        )?;
        Ok(self.conn().last_insert_rowid())
    }

    pub fn insert_habitat_metric(
        &self,
        assessment_id: i64,
        metric_name: &str,
        score: Option<f64>,
    ) -> rusqlite::Result<()> {
        self.conn().execute(
            "INSERT INTO habitat_metrics (assessment_id, metric_name, score) VALUES (?1, ?2, ?3)",
            params![assessment_id, metric_name, score],
        )?;
        Ok(())
    }

    pub fn insert_habitat_summary(
        &self,
        assessment_id: i64,
        total_score: Option<i64>,
        habitat_grade: Option<&str>,
    ) -> rusqlite::Result<()> {
        self.conn().execute(
            "INSERT INTO habitat_summary_scores (assessment_id, total_score, habitat_grade)
             VALUES (?1, ?2, ?3)",
            params![assessment_id, total_score, habitat_grade],
        )?;
        Ok(())
    }

    /// Resolves each biological event's identifying key to its event id.
    pub fn event_ids_by_key(&self, kind: BiologicalKind) -> rusqlite::Result<HashMap<GroupKey, i64>> {
        let sql = match kind {
            BiologicalKind::Fish => {
                "SELECT event_id, sample_id, NULL FROM fish_collection_events"
            }
            BiologicalKind::Macro => {
                "SELECT event_id, sample_id, habitat FROM macro_collection_events"
            }
        };
        let mut stmt = self.conn().prepare(sql)?;
        let mut rows = stmt.query([])?;
        let mut out = HashMap::new();
        while let Some(row) = rows.next()? {
            let event_id: i64 = row.get(0)?;
            let key = kind.group_key(row.get(1)?, row.get::<_, Option<String>>(2)?)?;
            out.insert(key, event_id);
        }
        Ok(out)
    }
}
