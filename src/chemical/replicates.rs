use std::collections::BTreeMap;
use std::ops::Deref;

use chrono::NaiveDate;
use rusqlite::{Connection, params};
use serde::Serialize;
use tracing::{error, info};

use crate::chemical::{ChemicalError, ChemicalStatus, ReferenceTable, WorstCase};
use crate::store::SqliteStore;

#[derive(Debug, Clone, PartialEq)]
pub struct ChemicalMeasurement {
    pub parameter_id: i64,
    pub parameter_code: String,
    pub value: Option<f64>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct ChemicalEvent {
    pub event_id: i64,
    pub site_id: i64,
    pub collection_date: NaiveDate,
    pub measurements: Vec<ChemicalMeasurement>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ConsolidatedValue {
    pub parameter_id: i64,
    pub parameter_code: String,
    pub value: f64,
    pub status: ChemicalStatus,
}

/// One (site, date) group and the values its survivor will carry.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ReplicatePlan {
    pub site_id: i64,
    pub collection_date: NaiveDate,
    pub survivor: i64,
    pub removed: Vec<i64>,
    pub values: Vec<ConsolidatedValue>,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct ConsolidationStats {
    pub groups_processed: usize,
    pub events_removed: usize,
    pub measurements_updated: usize,
}

/// Every chemical event with its measurements, ordered by event id.
pub fn load_chemical_events(store: &SqliteStore) -> rusqlite::Result<Vec<ChemicalEvent>> {
    let mut stmt = store.conn().prepare(
        "SELECT e.event_id, e.site_id, e.collection_date, m.parameter_id, p.parameter_code, m.value
         FROM chemical_collection_events e
         LEFT JOIN chemical_measurements m ON m.event_id = e.event_id
         LEFT JOIN chemical_parameters p ON p.parameter_id = m.parameter_id
         ORDER BY e.event_id ASC, m.parameter_id ASC",
    )?;
    let mut rows = stmt.query([])?;
    let mut events: Vec<ChemicalEvent> = Vec::new();
    while let Some(row) = rows.next()? {
        let event_id: i64 = row.get(0)?;
        if events.last().map(|event| event.event_id) != Some(event_id) {
            events.push(ChemicalEvent {
                event_id,
                site_id: row.get(1)?,
                collection_date: row.get(2)?,
                measurements: Vec::new(),
            });
        }
        let parameter_id: Option<i64> = row.get(3)?;
        if let (Some(parameter_id), Some(event)) = (parameter_id, events.last_mut()) {
            event.measurements.push(ChemicalMeasurement {
                parameter_id,
                parameter_code: row.get(4)?,
                value: row.get(5)?,
            });
        }
    }
    Ok(events)
}

/// Groups events sharing a site and date and decides each group's survivor values.
///
/// Fails before any mutation when a chosen value cannot be given a status.
pub fn plan_consolidation(
    events: &[ChemicalEvent],
    references: &ReferenceTable,
) -> Result<Vec<ReplicatePlan>, ChemicalError> {
    let mut groups: BTreeMap<(i64, NaiveDate), Vec<&ChemicalEvent>> = BTreeMap::new();
    for event in events {
        groups
            .entry((event.site_id, event.collection_date))
            .or_default()
            .push(event);
    }
    groups.retain(|_, members| members.len() > 1);
    if groups.is_empty() {
        return Ok(Vec::new());
    }
    if references.is_empty() {
        return Err(ChemicalError::NoReferenceData);
    }

    let mut plans = Vec::with_capacity(groups.len());
    for ((site_id, collection_date), mut members) in groups {
        members.sort_by_key(|event| event.event_id);
        let survivor = members[0].event_id;

        let mut readings: BTreeMap<i64, (&str, Vec<Option<f64>>)> = BTreeMap::new();
        for event in &members {
            for measurement in &event.measurements {
                readings
                    .entry(measurement.parameter_id)
                    .or_insert_with(|| (measurement.parameter_code.as_str(), Vec::new()))
                    .1
                    .push(measurement.value);
            }
        }

        let mut values = Vec::new();
        for (parameter_id, (code, observed)) in readings {
            let Some(value) = WorstCase::for_parameter(code).select(observed) else {
                continue;
            };
            values.push(ConsolidatedValue {
                parameter_id,
                parameter_code: code.to_string(),
                value,
                status: references.classify(code, value)?,
            });
        }

        plans.push(ReplicatePlan {
            site_id,
            collection_date,
            survivor,
            removed: members[1..].iter().map(|event| event.event_id).collect(),
            values,
        });
    }
    Ok(plans)
}

/// Applies every plan in one transaction. The first failing group rolls back
/// the whole run, so a store is never left half consolidated.
pub fn apply_consolidation(
    store: &SqliteStore,
    plans: &[ReplicatePlan],
) -> Result<ConsolidationStats, ChemicalError> {
    let mut stats = ConsolidationStats::default();
    if plans.is_empty() {
        info!("no chemical replicate groups found");
        return Ok(stats);
    }

    let tx = store.conn().unchecked_transaction()?;
    for plan in plans {
        let (removed, updated) =
            apply_group(tx.deref(), plan).map_err(|source| {
                error!(
                    site_id = plan.site_id,
                    date = %plan.collection_date,
                    %source,
                    "replicate group failed; rolling back run"
                );
                ChemicalError::GroupFailed {
                    site_id: plan.site_id,
                    collection_date: plan.collection_date,
                    source,
                }
            })?;
        stats.groups_processed += 1;
        stats.events_removed += removed;
        stats.measurements_updated += updated;
    }
    tx.commit()?;

    info!(
        groups = stats.groups_processed,
        removed = stats.events_removed,
        updated = stats.measurements_updated,
        "consolidated chemical replicates"
    );
    Ok(stats)
}

fn apply_group(conn: &Connection, plan: &ReplicatePlan) -> rusqlite::Result<(usize, usize)> {
    let survivor_exists: bool = conn.query_row(
        "SELECT EXISTS(SELECT 1 FROM chemical_collection_events WHERE event_id = ?1)",
        params![plan.survivor],
        |row| row.get(0),
    )?;
    if !survivor_exists {
        return Err(rusqlite::Error::InvalidParameterName(format!(
            "chemical event {} no longer exists",
            plan.survivor
        )));
    }

    let mut updated = 0;
    for value in &plan.values {
        updated += conn.execute(
            "INSERT INTO chemical_measurements (event_id, parameter_id, value, status)
             VALUES (?1, ?2, ?3, ?4)
             ON CONFLICT(event_id, parameter_id) DO UPDATE SET
                value = excluded.value,
                status = excluded.status",
            params![plan.survivor, value.parameter_id, value.value, value.status.label()],
        )?;
    }

    let mut removed = 0;
    for event_id in &plan.removed {
        removed += conn.execute(
            "DELETE FROM chemical_collection_events WHERE event_id = ?1",
            params![event_id],
        )?;
    }
    Ok((removed, updated))
}

/// Collapses every same-site, same-date group of chemical events to its lowest id.
pub fn consolidate_replicates(store: &SqliteStore) -> Result<ConsolidationStats, ChemicalError> {
    let references = ReferenceTable::load(store)?;
    let events = load_chemical_events(store)?;
    let plans = plan_consolidation(&events, &references)?;
    apply_consolidation(store, &plans)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::chemical::tests::reference_table;
    use crate::store::tests::consolidated;

    fn date(y: i32, m: u32, d: u32) -> NaiveDate {
        NaiveDate::from_ymd_opt(y, m, d).expect("valid date")
    }

    fn seeded_store() -> (SqliteStore, i64) {
        let store = SqliteStore::open_in_memory().expect("open store");
        store
            .upsert_site(&consolidated("Little River", None, None))
            .expect("site");
        let site = store
            .site_by_name("Little River")
            .expect("lookup")
            .expect("site")
            .site_id;
        for (code, threshold_type, value) in [
            ("do_percent", "normal_min", 80.0),
            ("do_percent", "normal_max", 130.0),
            ("do_percent", "caution_min", 50.0),
            ("do_percent", "caution_max", 150.0),
            ("pH", "normal_min", 6.5),
            ("pH", "normal_max", 9.0),
            ("Chloride", "normal", 200.0),
            ("Chloride", "caution", 250.0),
        ] {
            store
                .set_reference_value(code, threshold_type, value)
                .expect("reference");
        }
        (store, site)
    }

    fn measurement(store: &SqliteStore, event: i64, code: &str, value: Option<f64>) {
        store
            .insert_chemical_measurement(event, code, value, Some("Normal"))
            .expect("measurement");
    }

    #[test]
    fn merges_worst_case_values_onto_lowest_event_id() {
        let (store, site) = seeded_store();
        let day = date(2023, 5, 10);
        let first = store.insert_chemical_event(site, day).expect("event");
        let second = store.insert_chemical_event(site, day).expect("event");
        let third = store.insert_chemical_event(site, day).expect("event");
        let other_day = store.insert_chemical_event(site, date(2023, 6, 10)).expect("event");

        measurement(&store, first, "pH", Some(6.5));
        measurement(&store, second, "pH", Some(8.2));
        measurement(&store, third, "pH", Some(7.1));
        measurement(&store, first, "do_percent", Some(85.0));
        measurement(&store, second, "do_percent", Some(75.0));
        measurement(&store, third, "do_percent", None);
        measurement(&store, second, "Chloride", Some(260.0));
        measurement(&store, other_day, "pH", Some(7.0));

        let stats = consolidate_replicates(&store).expect("consolidate");
        assert_eq!(
            stats,
            ConsolidationStats {
                groups_processed: 1,
                events_removed: 2,
                measurements_updated: 3,
            }
        );

        let events = load_chemical_events(&store).expect("events");
        assert_eq!(events.len(), 2);
        let survivor = events.iter().find(|event| event.event_id == first).expect("survivor");
        let value_of = |code: &str| {
            survivor
                .measurements
                .iter()
                .find(|m| m.parameter_code == code)
                .and_then(|m| m.value)
        };
        assert_eq!(value_of("pH"), Some(8.2));
        assert_eq!(value_of("do_percent"), Some(75.0));
        assert_eq!(value_of("Chloride"), Some(260.0));

        let status: String = store
            .conn()
            .query_row(
                "SELECT status FROM chemical_measurements WHERE event_id = ?1 AND parameter_id = 1",
                params![first],
                |row| row.get(0),
            )
            .expect("status");
        assert_eq!(status, "Caution");
    }

    #[test]
    fn second_run_is_a_no_op() {
        let (store, site) = seeded_store();
        let day = date(2023, 5, 10);
        let a = store.insert_chemical_event(site, day).expect("event");
        let b = store.insert_chemical_event(site, day).expect("event");
        measurement(&store, a, "pH", Some(7.2));
        measurement(&store, b, "pH", Some(6.1));

        let first = consolidate_replicates(&store).expect("first run");
        assert_eq!(first.groups_processed, 1);
        let second = consolidate_replicates(&store).expect("second run");
        assert_eq!(second, ConsolidationStats::default());
    }

    #[test]
    fn no_groups_needs_no_reference_data() {
        let store = SqliteStore::open_in_memory().expect("open store");
        store.upsert_site(&consolidated("Dry Creek", None, None)).expect("site");
        let site = store.site_by_name("Dry Creek").expect("lookup").expect("site").site_id;
        store.insert_chemical_event(site, date(2020, 1, 1)).expect("event");
        assert_eq!(
            consolidate_replicates(&store).expect("consolidate"),
            ConsolidationStats::default()
        );
    }

    #[test]
    fn missing_reference_aborts_before_any_change() {
        let store = SqliteStore::open_in_memory().expect("open store");
        store.upsert_site(&consolidated("Dry Creek", None, None)).expect("site");
        let site = store.site_by_name("Dry Creek").expect("lookup").expect("site").site_id;
        let day = date(2020, 1, 1);
        let a = store.insert_chemical_event(site, day).expect("event");
        let b = store.insert_chemical_event(site, day).expect("event");
        measurement(&store, a, "Phosphorus", Some(0.2));
        measurement(&store, b, "Phosphorus", Some(0.3));

        assert!(matches!(
            consolidate_replicates(&store),
            Err(ChemicalError::NoReferenceData)
        ));

        store.set_reference_value("pH", "normal_min", 6.5).expect("reference");
        assert!(matches!(
            consolidate_replicates(&store),
            Err(ChemicalError::MissingReference { .. })
        ));
        assert_eq!(load_chemical_events(&store).expect("events").len(), 2);
    }

    #[test]
    fn all_null_parameter_is_left_off_the_plan() {
        let events = vec![
            ChemicalEvent {
                event_id: 4,
                site_id: 1,
                collection_date: date(2021, 3, 3),
                measurements: vec![ChemicalMeasurement {
                    parameter_id: 4,
                    parameter_code: "Phosphorus".to_string(),
                    value: None,
                }],
            },
            ChemicalEvent {
                event_id: 2,
                site_id: 1,
                collection_date: date(2021, 3, 3),
                measurements: vec![ChemicalMeasurement {
                    parameter_id: 4,
                    parameter_code: "Phosphorus".to_string(),
                    value: None,
                }],
            },
        ];
        let plans = plan_consolidation(&events, &reference_table()).expect("plan");
        assert_eq!(plans.len(), 1);
        assert_eq!(plans[0].survivor, 2);
        assert_eq!(plans[0].removed, vec![4]);
        assert!(plans[0].values.is_empty());
    }

    #[test]
    fn failing_group_rolls_back_the_whole_run() {
        let (store, site) = seeded_store();
        let first_day = date(2023, 5, 10);
        let second_day = date(2023, 6, 10);
        let mut ids = Vec::new();
        for (day, value) in [(first_day, 7.2), (first_day, 8.4), (second_day, 6.9), (second_day, 6.0)] {
            let event = store.insert_chemical_event(site, day).expect("event");
            measurement(&store, event, "pH", Some(value));
            ids.push(event);
        }

        let events = load_chemical_events(&store).expect("events");
        let mut plans = plan_consolidation(&events, &reference_table()).expect("plan");
        assert_eq!(plans.len(), 2);
        plans[1].survivor = 9999;

        let err = apply_consolidation(&store, &plans).expect_err("stale plan fails");
        assert!(matches!(
            err,
            ChemicalError::GroupFailed { collection_date, .. } if collection_date == second_day
        ));

        let remaining = load_chemical_events(&store).expect("events");
        assert_eq!(remaining.len(), 4);
        let ph_of = |event_id: i64| {
            remaining
                .iter()
                .find(|event| event.event_id == event_id)
                .and_then(|event| event.measurements.first())
                .and_then(|m| m.value)
        };
        assert_eq!(ph_of(ids[0]), Some(7.2));
    }
}
