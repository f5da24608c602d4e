use std::collections::{BTreeMap, HashMap};
use std::ops::Deref;

use chrono::{Datelike, NaiveDate};
use rusqlite::{Connection, params};
use serde::Serialize;
use tracing::{info, warn};

use crate::biological::fieldlog::{FieldLog, ReplicatePair};
use crate::biological::{BiologicalKind, GroupKey, IntegrityClass, Similarity};
use crate::store::SqliteStore;

#[derive(Debug, Clone, PartialEq)]
pub struct FishSample {
    pub event_id: i64,
    pub site_id: i64,
    pub site_name: String,
    pub sample_id: i64,
    pub collection_date: NaiveDate,
    pub year: i32,
    pub comparison_to_reference: Option<f64>,
}

impl FishSample {
    pub fn key(&self) -> GroupKey {
        GroupKey::BySample(self.sample_id)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct DateAssignment {
    pub key: GroupKey,
    pub collection_date: NaiveDate,
    pub year: i32,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum CorrectionSource {
    FieldLog,
    YearField,
}

/// A sample whose stored year disagreed with its collection date.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct DateCorrection {
    pub key: GroupKey,
    pub original: NaiveDate,
    pub collection_date: NaiveDate,
    pub year: i32,
    pub source: CorrectionSource,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct AveragedGroup {
    pub survivor: GroupKey,
    pub removed: Vec<GroupKey>,
    pub comparison_to_reference: Option<f64>,
    pub integrity_class: Option<IntegrityClass>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum GroupResolution {
    /// Field log confirms a replicate collection; samples get the logged dates.
    Replicates {
        pair: ReplicatePair,
        assignments: Vec<DateAssignment>,
        /// Samples beyond the first two, left for manual review.
        ambiguous: Vec<GroupKey>,
    },
    /// No replicate on record; the group collapses to one averaged sample.
    Averaged(AveragedGroup),
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct GroupDecision {
    pub site_name: String,
    pub year: i32,
    pub matched_log_site: Option<String>,
    pub resolution: GroupResolution,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct FishClassification {
    pub decisions: Vec<GroupDecision>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct AmbiguousSample {
    pub site_name: String,
    pub year: i32,
    pub key: GroupKey,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct FishReport {
    pub dates_corrected: usize,
    pub groups_found: usize,
    pub replicate_groups: usize,
    pub samples_redated: usize,
    pub averaged_groups: usize,
    pub events_removed: usize,
    pub ambiguous: Vec<AmbiguousSample>,
    pub groups_failed: usize,
}

pub fn load_fish_samples(store: &SqliteStore) -> rusqlite::Result<Vec<FishSample>> {
    let mut stmt = store.conn().prepare(
        "SELECT e.event_id, e.site_id, s.site_name, e.sample_id, e.collection_date, e.year,
                f.comparison_to_reference
         FROM fish_collection_events e
         JOIN sites s ON s.site_id = e.site_id
         LEFT JOIN fish_summary_scores f ON f.event_id = e.event_id
         ORDER BY s.site_name ASC, e.year ASC, e.sample_id ASC",
    )?;
    let mut rows = stmt.query([])?;
    let mut out = Vec::new();
    while let Some(row) = rows.next()? {
        out.push(FishSample {
            event_id: row.get(0)?,
            site_id: row.get(1)?,
            site_name: row.get(2)?,
            sample_id: row.get(3)?,
            collection_date: row.get(4)?,
            year: row.get(5)?,
            comparison_to_reference: row.get(6)?,
        });
    }
    Ok(out)
}

/// Reconciles samples whose `year` disagrees with the year of their collection
/// date. A field-log visit to the matched site in the stored year (else in the
/// date's year) wins; otherwise month and day are kept and the year replaced.
pub fn correct_dates(
    samples: &[FishSample],
    field_log: &FieldLog,
    similarity: &dyn Similarity,
    threshold: f64,
) -> Vec<DateCorrection> {
    let mut corrections = Vec::new();
    for sample in samples {
        let date_year = sample.collection_date.year();
        if date_year == sample.year {
            continue;
        }
        let logged = field_log
            .match_site(&sample.site_name, similarity, threshold)
            .and_then(|log_site| {
                let visit_in = |year: i32| {
                    field_log
                        .entries()
                        .iter()
                        .find(|entry| entry.site_name == log_site && entry.date.year() == year)
                        .map(|entry| entry.date)
                };
                visit_in(sample.year).or_else(|| visit_in(date_year))
            });
        let (collection_date, source) = match logged {
            Some(date) => (date, CorrectionSource::FieldLog),
            None => match sample.collection_date.with_year(sample.year) {
                Some(date) => (date, CorrectionSource::YearField),
                None => {
                    warn!(
                        site = %sample.site_name,
                        sample_id = sample.sample_id,
                        date = %sample.collection_date,
                        year = sample.year,
                        "collection date has no counterpart in stored year; left as is"
                    );
                    continue;
                }
            },
        };
        corrections.push(DateCorrection {
            key: sample.key(),
            original: sample.collection_date,
            collection_date,
            year: collection_date.year(),
            source,
        });
    }
    corrections
}

fn with_corrections(samples: &[FishSample], corrections: &[DateCorrection]) -> Vec<FishSample> {
    let by_key: HashMap<&GroupKey, &DateCorrection> = corrections
        .iter()
        .map(|correction| (&correction.key, correction))
        .collect();
    samples
        .iter()
        .map(|sample| {
            let mut sample = sample.clone();
            if let Some(correction) = by_key.get(&sample.key()) {
                sample.collection_date = correction.collection_date;
                sample.year = correction.year;
            }
            sample
        })
        .collect()
}

/// Decides, for every site/year with more than one sample, whether the samples
/// are logged replicates or duplicate entry. Touches nothing.
pub fn classify_fish(
    samples: &[FishSample],
    field_log: &FieldLog,
    similarity: &dyn Similarity,
    threshold: f64,
) -> FishClassification {
    let mut groups: BTreeMap<(&str, i32), Vec<&FishSample>> = BTreeMap::new();
    for sample in samples {
        groups
            .entry((sample.site_name.as_str(), sample.year))
            .or_default()
            .push(sample);
    }

    let mut decisions = Vec::new();
    for ((site_name, year), mut members) in groups {
        if members.len() < 2 {
            continue;
        }
        members.sort_by_key(|sample| sample.sample_id);

        let matched = field_log.match_site(site_name, similarity, threshold);
        let pair = matched.and_then(|log_site| field_log.replicate_pair(log_site, year));
        let resolution = match pair {
            Some(pair) => assign_replicate_dates(&members, pair),
            None => GroupResolution::Averaged(average_group(&members)),
        };
        decisions.push(GroupDecision {
            site_name: site_name.to_string(),
            year,
            matched_log_site: matched.map(str::to_string),
            resolution,
        });
    }
    FishClassification { decisions }
}

fn assign_replicate_dates(members: &[&FishSample], pair: ReplicatePair) -> GroupResolution {
    let (earlier, later) = pair.ordered();
    let assignments = members
        .iter()
        .zip([earlier, later])
        .map(|(sample, collection_date)| DateAssignment {
            key: sample.key(),
            collection_date,
            year: collection_date.year(),
        })
        .collect();
    GroupResolution::Replicates {
        pair,
        assignments,
        ambiguous: members.iter().skip(2).map(|sample| sample.key()).collect(),
    }
}

fn average_group(members: &[&FishSample]) -> AveragedGroup {
    let comparisons: Vec<f64> = members
        .iter()
        .filter_map(|sample| sample.comparison_to_reference)
        .collect();
    let comparison = if comparisons.is_empty() {
        None
    } else {
        Some(comparisons.iter().sum::<f64>() / comparisons.len() as f64)
    };
    AveragedGroup {
        survivor: members[0].key(),
        removed: members[1..].iter().map(|sample| sample.key()).collect(),
        comparison_to_reference: comparison,
        integrity_class: comparison.map(IntegrityClass::from_comparison),
    }
}

/// Writes date corrections and a classification back in one transaction,
/// one savepoint per group.
pub fn apply_fish_classification(
    store: &SqliteStore,
    corrections: &[DateCorrection],
    classification: &FishClassification,
) -> rusqlite::Result<FishReport> {
    let mut report = FishReport {
        groups_found: classification.decisions.len(),
        ..FishReport::default()
    };
    if corrections.is_empty() && classification.decisions.is_empty() {
        info!("no duplicate fish groups found");
        return Ok(report);
    }

    let event_ids = store.event_ids_by_key(BiologicalKind::Fish)?;
    let mut tx = store.conn().unchecked_transaction()?;
    for correction in corrections {
        report.dates_corrected += tx.execute(
            "UPDATE fish_collection_events SET collection_date = ?2, year = ?3
             WHERE event_id = ?1",
            params![
                resolve(&event_ids, &correction.key)?,
                correction.collection_date,
                correction.year
            ],
        )?;
    }
    for decision in &classification.decisions {
        let savepoint = tx.savepoint()?;
        match apply_decision(savepoint.deref(), &event_ids, &decision.resolution) {
            Ok(changed) => {
                savepoint.commit()?;
                match &decision.resolution {
                    GroupResolution::Replicates { ambiguous, .. } => {
                        report.replicate_groups += 1;
                        report.samples_redated += changed;
                        for key in ambiguous {
                            warn!(site = %decision.site_name, year = decision.year, ?key, "extra replicate sample left unassigned");
                            report.ambiguous.push(AmbiguousSample {
                                site_name: decision.site_name.clone(),
                                year: decision.year,
                                key: key.clone(),
                            });
                        }
                    }
                    GroupResolution::Averaged(_) => {
                        report.averaged_groups += 1;
                        report.events_removed += changed;
                    }
                }
            }
            Err(err) => {
                drop(savepoint);
                warn!(site = %decision.site_name, year = decision.year, %err, "fish group rolled back");
                report.groups_failed += 1;
            }
        }
    }
    tx.commit()?;

    info!(
        corrected = report.dates_corrected,
        replicates = report.replicate_groups,
        averaged = report.averaged_groups,
        removed = report.events_removed,
        ambiguous = report.ambiguous.len(),
        "classified fish duplicates"
    );
    Ok(report)
}

fn resolve(event_ids: &HashMap<GroupKey, i64>, key: &GroupKey) -> rusqlite::Result<i64> {
    event_ids.get(key).copied().ok_or_else(|| {
        rusqlite::Error::InvalidParameterName(format!("no fish event for {key:?}"))
    })
}

fn apply_decision(
    conn: &Connection,
    event_ids: &HashMap<GroupKey, i64>,
    resolution: &GroupResolution,
) -> rusqlite::Result<usize> {
    match resolution {
        GroupResolution::Replicates { assignments, .. } => {
            let mut redated = 0;
            for assignment in assignments {
                redated += conn.execute(
                    "UPDATE fish_collection_events SET collection_date = ?2, year = ?3
                     WHERE event_id = ?1",
                    params![
                        resolve(event_ids, &assignment.key)?,
                        assignment.collection_date,
                        assignment.year
                    ],
                )?;
            }
            Ok(redated)
        }
        GroupResolution::Averaged(group) => {
            let survivor = resolve(event_ids, &group.survivor)?;
            conn.execute(
                "INSERT INTO fish_summary_scores
                    (event_id, total_score, comparison_to_reference, integrity_class)
                 VALUES (?1, NULL, ?2, ?3)
                 ON CONFLICT(event_id) DO UPDATE SET
                    total_score = NULL,
                    comparison_to_reference = excluded.comparison_to_reference,
                    integrity_class = excluded.integrity_class",
                params![
                    survivor,
                    group.comparison_to_reference,
                    group.integrity_class.map(IntegrityClass::label)
                ],
            )?;
            conn.execute(
                "UPDATE fish_metrics SET metric_score = NULL WHERE event_id = ?1",
                params![survivor],
            )?;

            let mut removed = 0;
            for key in &group.removed {
                removed += conn.execute(
                    "DELETE FROM fish_collection_events WHERE event_id = ?1",
                    params![resolve(event_ids, key)?],
                )?;
            }
            Ok(removed)
        }
    }
}

pub fn classify_duplicates(
    store: &SqliteStore,
    field_log: &FieldLog,
    similarity: &dyn Similarity,
    threshold: f64,
) -> rusqlite::Result<FishReport> {
    let samples = load_fish_samples(store)?;
    if field_log.is_empty() {
        warn!("field log is empty; duplicate groups will be averaged");
    }
    let corrections = correct_dates(&samples, field_log, similarity, threshold);
    if !corrections.is_empty() {
        info!(count = corrections.len(), "correcting fish collection dates");
    }
    let samples = with_corrections(&samples, &corrections);
    let classification = classify_fish(&samples, field_log, similarity, threshold);
    apply_fish_classification(store, &corrections, &classification)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::biological::NormalizedLevenshtein;
    use crate::biological::fieldlog::{EntryKind, FieldLogEntry};
    use crate::store::tests::consolidated;

    fn date(y: i32, m: u32, d: u32) -> NaiveDate {
        NaiveDate::from_ymd_opt(y, m, d).expect("valid date")
    }

    fn sample(sample_id: i64, site: &str, collected: NaiveDate, comparison: Option<f64>) -> FishSample {
        FishSample {
            event_id: sample_id * 10,
            site_id: 1,
            site_name: site.to_string(),
            sample_id,
            collection_date: collected,
            year: collected.year(),
            comparison_to_reference: comparison,
        }
    }

    fn bird_creek_log() -> FieldLog {
        FieldLog::new(vec![
            FieldLogEntry {
                site_name: "Bird Creek".to_string(),
                date: date(2020, 5, 15),
                kind: EntryKind::Replicate,
            },
            FieldLogEntry {
                site_name: "Bird Creek".to_string(),
                date: date(2020, 5, 1),
                kind: EntryKind::Original,
            },
        ])
    }

    #[test]
    fn logged_replicates_receive_ordered_dates() {
        let samples = vec![
            sample(42, "Bird Creek", date(2020, 6, 1), Some(0.8)),
            sample(41, "Bird Creek", date(2020, 6, 1), Some(0.6)),
        ];
        let result = classify_fish(&samples, &bird_creek_log(), &NormalizedLevenshtein, 0.9);
        assert_eq!(result.decisions.len(), 1);
        let GroupResolution::Replicates {
            assignments,
            ambiguous,
            ..
        } = &result.decisions[0].resolution
        else {
            panic!("expected replicates");
        };
        assert_eq!(assignments[0].key, GroupKey::BySample(41));
        assert_eq!(assignments[0].collection_date, date(2020, 5, 1));
        assert_eq!(assignments[1].key, GroupKey::BySample(42));
        assert_eq!(assignments[1].collection_date, date(2020, 5, 15));
        assert!(ambiguous.is_empty());
    }

    #[test]
    fn third_replicate_sample_is_flagged_ambiguous() {
        let samples = vec![
            sample(1, "Bird Creek", date(2020, 6, 1), None),
            sample(2, "Bird Creek", date(2020, 6, 1), None),
            sample(3, "Bird Creek", date(2020, 6, 1), None),
        ];
        let result = classify_fish(&samples, &bird_creek_log(), &NormalizedLevenshtein, 0.9);
        let GroupResolution::Replicates {
            assignments,
            ambiguous,
            ..
        } = &result.decisions[0].resolution
        else {
            panic!("expected replicates");
        };
        assert_eq!(assignments.len(), 2);
        assert_eq!(ambiguous, &vec![GroupKey::BySample(3)]);
    }

    #[test]
    fn unlogged_group_is_averaged_with_recomputed_class() {
        let samples = vec![
            sample(7, "Coal Creek", date(2019, 7, 1), Some(0.85)),
            sample(8, "Coal Creek", date(2019, 7, 1), Some(0.65)),
            sample(9, "Coal Creek", date(2018, 7, 1), Some(0.9)),
        ];
        let result = classify_fish(&samples, &bird_creek_log(), &NormalizedLevenshtein, 0.9);
        assert_eq!(result.decisions.len(), 1);
        assert_eq!(result.decisions[0].matched_log_site, None);
        let GroupResolution::Averaged(group) = &result.decisions[0].resolution else {
            panic!("expected averaged group");
        };
        assert_eq!(group.survivor, GroupKey::BySample(7));
        assert_eq!(group.removed, vec![GroupKey::BySample(8)]);
        let comparison = group.comparison_to_reference.expect("comparison");
        assert!((comparison - 0.75).abs() < 1e-9);
        assert_eq!(group.integrity_class, Some(IntegrityClass::Fair));
    }

    #[test]
    fn empty_field_log_averages_every_group() {
        let samples = vec![
            sample(1, "Bird Creek", date(2020, 6, 1), Some(0.5)),
            sample(2, "Bird Creek", date(2020, 6, 1), None),
        ];
        let result = classify_fish(&samples, &FieldLog::default(), &NormalizedLevenshtein, 0.9);
        let GroupResolution::Averaged(group) = &result.decisions[0].resolution else {
            panic!("expected averaged group");
        };
        assert_eq!(group.comparison_to_reference, Some(0.5));
    }

    #[test]
    fn apply_redates_replicates_and_collapses_duplicates() {
        let store = SqliteStore::open_in_memory().expect("open store");
        store.upsert_site(&consolidated("Bird Creek", None, None)).expect("site");
        store.upsert_site(&consolidated("Coal Creek", None, None)).expect("site");
        let bird = store.site_by_name("Bird Creek").expect("lookup").expect("site").site_id;
        let coal = store.site_by_name("Coal Creek").expect("lookup").expect("site").site_id;

        for sample_id in [41, 42] {
            let event = store
                .insert_fish_event(bird, sample_id, date(2020, 6, 1))
                .expect("fish event");
            store
                .insert_fish_metric(event, "Total No. of species", Some(12.0), Some(5))
                .expect("metric");
            store
                .insert_fish_summary(event, Some(30), Some(0.8), Some("Good"))
                .expect("summary");
        }
        let mut coal_events = Vec::new();
        for (sample_id, comparison) in [(7, 0.85), (8, 0.65)] {
            let event = store
                .insert_fish_event(coal, sample_id, date(2019, 7, 1))
                .expect("fish event");
            store
                .insert_fish_metric(event, "Total No. of species", Some(9.0), Some(3))
                .expect("metric");
            store
                .insert_fish_summary(event, Some(25), Some(comparison), Some("Good"))
                .expect("summary");
            coal_events.push(event);
        }

        let report = classify_duplicates(&store, &bird_creek_log(), &NormalizedLevenshtein, 0.9)
            .expect("classify");
        assert_eq!(report.groups_found, 2);
        assert_eq!(report.replicate_groups, 1);
        assert_eq!(report.samples_redated, 2);
        assert_eq!(report.averaged_groups, 1);
        assert_eq!(report.events_removed, 1);
        assert_eq!(report.groups_failed, 0);

        let samples = load_fish_samples(&store).expect("samples");
        let bird_dates: Vec<NaiveDate> = samples
            .iter()
            .filter(|sample| sample.site_name == "Bird Creek")
            .map(|sample| sample.collection_date)
            .collect();
        assert_eq!(bird_dates, vec![date(2020, 5, 1), date(2020, 5, 15)]);

        let coal_samples: Vec<&FishSample> = samples
            .iter()
            .filter(|sample| sample.site_name == "Coal Creek")
            .collect();
        assert_eq!(coal_samples.len(), 1);
        assert_eq!(coal_samples[0].event_id, coal_events[0]);
        let comparison = coal_samples[0].comparison_to_reference.expect("comparison");
        assert!((comparison - 0.75).abs() < 1e-9);

        let (total, class): (Option<i64>, Option<String>) = store
            .conn()
            .query_row(
                "SELECT total_score, integrity_class FROM fish_summary_scores WHERE event_id = ?1",
                params![coal_events[0]],
                |row| Ok((row.get(0)?, row.get(1)?)),
            )
            .expect("summary");
        assert_eq!(total, None);
        assert_eq!(class.as_deref(), Some("Fair"));

        let nulled: i64 = store
            .conn()
            .query_row(
                "SELECT COUNT(*) FROM fish_metrics WHERE event_id = ?1 AND metric_score IS NULL",
                params![coal_events[0]],
                |row| row.get(0),
            )
            .expect("metrics");
        assert_eq!(nulled, 1);

        let kept_scores: i64 = store
            .conn()
            .query_row(
                "SELECT COUNT(*) FROM fish_metrics m
                 JOIN fish_collection_events e ON e.event_id = m.event_id
                 WHERE e.site_id = ?1 AND m.metric_score = 5",
                params![bird],
                |row| row.get(0),
            )
            .expect("metrics");
        assert_eq!(kept_scores, 2);

        let again = classify_duplicates(&store, &bird_creek_log(), &NormalizedLevenshtein, 0.9)
            .expect("second pass");
        assert_eq!(again.averaged_groups, 0);
    }

    #[test]
    fn mismatched_year_takes_the_logged_visit() {
        let mut stale = sample(5, "Bird Creek", date(2019, 6, 1), None);
        stale.year = 2020;
        let consistent = sample(6, "Bird Creek", date(2020, 6, 1), None);

        let corrections = correct_dates(
            &[stale, consistent],
            &bird_creek_log(),
            &NormalizedLevenshtein,
            0.9,
        );
        assert_eq!(
            corrections,
            vec![DateCorrection {
                key: GroupKey::BySample(5),
                original: date(2019, 6, 1),
                collection_date: date(2020, 5, 15),
                year: 2020,
                source: CorrectionSource::FieldLog,
            }]
        );
    }

    #[test]
    fn unlogged_mismatch_keeps_month_and_day() {
        let mut stale = sample(9, "Coal Creek", date(2018, 7, 12), None);
        stale.year = 2019;

        let corrections = correct_dates(&[stale], &bird_creek_log(), &NormalizedLevenshtein, 0.9);
        assert_eq!(corrections.len(), 1);
        assert_eq!(corrections[0].collection_date, date(2019, 7, 12));
        assert_eq!(corrections[0].year, 2019);
        assert_eq!(corrections[0].source, CorrectionSource::YearField);
    }

    #[test]
    fn corrected_dates_are_persisted_before_grouping() {
        let store = SqliteStore::open_in_memory().expect("open store");
        store.upsert_site(&consolidated("Coal Creek", None, None)).expect("site");
        let coal = store.site_by_name("Coal Creek").expect("lookup").expect("site").site_id;
        let keep = store
            .insert_fish_event(coal, 7, date(2019, 7, 1))
            .expect("fish event");
        let stale = store
            .insert_fish_event(coal, 8, date(2018, 7, 1))
            .expect("fish event");
        store
            .conn()
            .execute(
                "UPDATE fish_collection_events SET year = 2019 WHERE event_id = ?1",
                params![stale],
            )
            .expect("mismatch year");

        let report = classify_duplicates(&store, &FieldLog::default(), &NormalizedLevenshtein, 0.9)
            .expect("classify");
        assert_eq!(report.dates_corrected, 1);
        assert_eq!(report.averaged_groups, 1);
        assert_eq!(report.events_removed, 1);

        let samples = load_fish_samples(&store).expect("samples");
        assert_eq!(samples.len(), 1);
        assert_eq!(samples[0].event_id, keep);
        assert_eq!(samples[0].collection_date, date(2019, 7, 1));
    }
}
