use std::collections::HashMap;

use chrono::{Duration, NaiveDate};
use serde::Serialize;
use tracing::{info, warn};

use crate::sites::ConsolidatedSite;
use crate::store::{SiteSnapshot, SqliteStore};

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct PersistReport {
    pub inserted: usize,
    pub updated: usize,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct ActivityReport {
    /// Most recent chemical reading across all sites.
    pub reference_date: Option<NaiveDate>,
    pub cutoff_date: Option<NaiveDate>,
    pub active: usize,
    pub historic: usize,
}

pub fn persist_sites(
    store: &SqliteStore,
    sites: &[ConsolidatedSite],
) -> rusqlite::Result<PersistReport> {
    let (inserted, updated) = store.upsert_sites(sites)?;
    info!(inserted, updated, "persisted consolidated sites");
    Ok(PersistReport { inserted, updated })
}

/// Deletes sites no event table references.
pub fn cleanup_unused_sites(store: &SqliteStore) -> rusqlite::Result<Vec<String>> {
    let removed = store.delete_unused_sites()?;
    for name in &removed {
        info!(site = %name, "removed unused site");
    }
    Ok(removed)
}

/// A site is active when its latest chemical reading falls within `window_days`
/// of the latest reading anywhere.
pub fn plan_activity(
    snapshot: &SiteSnapshot,
    latest: &[(i64, NaiveDate)],
    window_days: i64,
) -> (Option<NaiveDate>, Vec<(i64, bool, Option<NaiveDate>)>) {
    let Some(reference) = latest.iter().map(|(_, date)| *date).max() else {
        return (None, Vec::new());
    };
    let cutoff = reference - Duration::days(window_days);
    let by_site: HashMap<i64, NaiveDate> = latest.iter().copied().collect();
    let updates = snapshot
        .sites
        .iter()
        .map(|site| {
            let last = by_site.get(&site.site_id).copied();
            let active = last.is_some_and(|date| date >= cutoff);
            (site.site_id, active, last)
        })
        .collect();
    (Some(reference), updates)
}

pub fn classify_active_sites(
    store: &SqliteStore,
    window_days: i64,
) -> rusqlite::Result<ActivityReport> {
    let snapshot = store.site_snapshot()?;
    let latest = store.latest_chemical_dates()?;
    let (reference, updates) = plan_activity(&snapshot, &latest, window_days);
    let Some(reference) = reference else {
        warn!("no chemical readings; site activity left unchanged");
        return Ok(ActivityReport::default());
    };

    store.set_site_activity(&updates)?;
    let active = updates.iter().filter(|(_, active, _)| *active).count();
    let report = ActivityReport {
        reference_date: Some(reference),
        cutoff_date: Some(reference - Duration::days(window_days)),
        active,
        historic: updates.len() - active,
    };
    info!(active = report.active, historic = report.historic, %reference, "classified site activity");
    Ok(report)
}
