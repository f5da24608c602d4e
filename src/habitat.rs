use std::collections::BTreeMap;
use std::ops::Deref;

use chrono::NaiveDate;
use rusqlite::{Connection, params};
use serde::Serialize;
use tracing::{info, warn};

use crate::store::SqliteStore;

#[derive(Debug, Clone, PartialEq)]
pub struct HabitatAssessment {
    pub assessment_id: i64,
    pub site_id: i64,
    pub assessment_date: NaiveDate,
    pub metrics: BTreeMap<String, Option<f64>>,
    pub total_score: Option<i64>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum HabitatGrade {
    A,
    B,
    C,
    D,
    F,
}

impl HabitatGrade {
    pub fn from_total(total: i64) -> Self {
        match total {
            90.. => HabitatGrade::A,
            80..=89 => HabitatGrade::B,
            70..=79 => HabitatGrade::C,
            60..=69 => HabitatGrade::D,
            _ => HabitatGrade::F,
        }
    }

    pub fn label(self) -> &'static str {
        match self {
            HabitatGrade::A => "A",
            HabitatGrade::B => "B",
            HabitatGrade::C => "C",
            HabitatGrade::D => "D",
            HabitatGrade::F => "F",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct HabitatPlan {
    pub site_id: i64,
    pub assessment_date: NaiveDate,
    pub survivor: i64,
    pub removed: Vec<i64>,
    pub metrics: BTreeMap<String, Option<f64>>,
    pub total_score: Option<i64>,
    pub grade: Option<HabitatGrade>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct HabitatStats {
    pub groups_processed: usize,
    pub assessments_removed: usize,
    pub groups_failed: usize,
}

pub fn load_habitat_assessments(store: &SqliteStore) -> rusqlite::Result<Vec<HabitatAssessment>> {
    let conn = store.conn();
    let mut assessments: BTreeMap<i64, HabitatAssessment> = BTreeMap::new();

    let mut stmt = conn.prepare(
        "SELECT a.assessment_id, a.site_id, a.assessment_date, s.total_score
         FROM habitat_assessments a
         LEFT JOIN habitat_summary_scores s ON s.assessment_id = a.assessment_id",
    )?;
    let mut rows = stmt.query([])?;
    while let Some(row) = rows.next()? {
        let assessment_id: i64 = row.get(0)?;
        assessments.insert(
            assessment_id,
            HabitatAssessment {
                assessment_id,
                site_id: row.get(1)?,
                assessment_date: row.get(2)?,
                metrics: BTreeMap::new(),
                total_score: row.get(3)?,
            },
        );
    }

    let mut stmt = conn.prepare("SELECT assessment_id, metric_name, score FROM habitat_metrics")?;
    let mut rows = stmt.query([])?;
    while let Some(row) = rows.next()? {
        let assessment_id: i64 = row.get(0)?;
        if let Some(assessment) = assessments.get_mut(&assessment_id) {
            assessment.metrics.insert(row.get(1)?, row.get(2)?);
        }
    }
    Ok(assessments.into_values().collect())
}

fn mean(values: impl Iterator<Item = f64>) -> Option<f64> {
    let (sum, count) = values.fold((0.0, 0usize), |(sum, count), value| (sum + value, count + 1));
    (count > 0).then(|| sum / count as f64)
}

/// Rounds half to even, so 80.5 becomes 80 and 7.25 becomes 7.2.
fn round_to(value: f64, decimals: i32) -> f64 {
    let scale = 10f64.powi(decimals);
    (value * scale).round_ties_even() / scale
}

/// Groups assessments sharing a site and date. Each metric is averaged over
/// the assessments that scored it.
pub fn plan_habitat_averages(assessments: &[HabitatAssessment]) -> Vec<HabitatPlan> {
    let mut groups: BTreeMap<(i64, NaiveDate), Vec<&HabitatAssessment>> = BTreeMap::new();
    for assessment in assessments {
        groups
            .entry((assessment.site_id, assessment.assessment_date))
            .or_default()
            .push(assessment);
    }

    let mut plans = Vec::new();
    for ((site_id, assessment_date), mut members) in groups {
        if members.len() < 2 {
            continue;
        }
        members.sort_by_key(|assessment| assessment.assessment_id);

        let mut columns: BTreeMap<&str, Vec<f64>> = BTreeMap::new();
        for assessment in &members {
            for (name, score) in &assessment.metrics {
                let column = columns.entry(name.as_str()).or_default();
                column.extend(score.filter(|value| !value.is_nan()));
            }
        }
        let metrics = columns
            .into_iter()
            .map(|(name, values)| {
                let averaged = mean(values.into_iter()).map(|value| round_to(value, 1));
                (name.to_string(), averaged)
            })
            .collect();

        let total_score = mean(
            members
                .iter()
                .filter_map(|assessment| assessment.total_score)
                .map(|total| total as f64),
        )
        .map(|value| round_to(value, 0) as i64);

        plans.push(HabitatPlan {
            site_id,
            assessment_date,
            survivor: members[0].assessment_id,
            removed: members[1..].iter().map(|assessment| assessment.assessment_id).collect(),
            metrics,
            total_score,
            grade: total_score.map(HabitatGrade::from_total),
        });
    }
    plans
}

pub fn apply_habitat_averages(
    store: &SqliteStore,
    plans: &[HabitatPlan],
) -> rusqlite::Result<HabitatStats> {
    let mut stats = HabitatStats::default();
    let mut tx = store.conn().unchecked_transaction()?;
    for plan in plans {
        let savepoint = tx.savepoint()?;
        match apply_plan(savepoint.deref(), plan) {
            Ok(removed) => {
                savepoint.commit()?;
                stats.groups_processed += 1;
                stats.assessments_removed += removed;
            }
            Err(err) => {
                drop(savepoint);
                warn!(
                    site_id = plan.site_id,
                    date = %plan.assessment_date,
                    %err,
                    "habitat group rolled back"
                );
                stats.groups_failed += 1;
            }
        }
    }
    tx.commit()?;
    Ok(stats)
}

fn apply_plan(conn: &Connection, plan: &HabitatPlan) -> rusqlite::Result<usize> {
    conn.execute(
        "DELETE FROM habitat_metrics WHERE assessment_id = ?1",
        params![plan.survivor],
    )?;
    for (name, score) in &plan.metrics {
        conn.execute(
            "INSERT INTO habitat_metrics (assessment_id, metric_name, score) VALUES (?1, ?2, ?3)",
            params![plan.survivor, name, score],
        )?;
    }
    conn.execute(
        "INSERT INTO habitat_summary_scores (assessment_id, total_score, habitat_grade)
         VALUES (?1, ?2, ?3)
         ON CONFLICT(assessment_id) DO UPDATE SET
            total_score = excluded.total_score,
            habitat_grade = excluded.habitat_grade",
        params![plan.survivor, plan.total_score, plan.grade.map(HabitatGrade::label)],
    )?;

    let mut removed = 0;
    for assessment_id in &plan.removed {
        removed += conn.execute(
            "DELETE FROM habitat_assessments WHERE assessment_id = ?1",
            params![assessment_id],
        )?;
    }
    Ok(removed)
}

pub fn average_habitat_duplicates(store: &SqliteStore) -> rusqlite::Result<HabitatStats> {
    let assessments = load_habitat_assessments(store)?;
    let plans = plan_habitat_averages(&assessments);
    if plans.is_empty() {
        info!("no duplicate habitat assessments found");
        return Ok(HabitatStats::default());
    }
    let stats = apply_habitat_averages(store, &plans)?;
    info!(
        groups = stats.groups_processed,
        removed = stats.assessments_removed,
        failed = stats.groups_failed,
        "averaged habitat duplicates"
    );
    Ok(stats)
}
