use std::collections::{BTreeMap, HashMap, HashSet};
use std::ops::Deref;

use rusqlite::Connection;
use serde::Serialize;
use tracing::{debug, error, info, warn};

use crate::sites::extract::ExtractedSource;
use crate::sites::{SiteField, SiteMetadata};
use crate::store::{PersistedSite, SiteSnapshot, SqliteStore};

#[derive(Debug, thiserror::Error)]
pub enum MergeError {
    #[error("{0}")]
    Sqlite(#[from] rusqlite::Error),
    #[error("site `{site_name}` still owns {remaining} rows in {table} after repointing")]
    IntegrityViolation {
        site_name: String,
        table: &'static str,
        remaining: i64,
    },
}

/// External lists that decide which member of a duplicate group survives.
#[derive(Debug, Clone, Default)]
pub struct MergePreferences {
    /// Authoritative name lists, highest priority first.
    pub name_lists: Vec<(String, HashSet<String>)>,
    /// Metadata for backfill, searched in order.
    pub metadata: Vec<HashMap<String, SiteMetadata>>,
}

impl MergePreferences {
    pub fn from_sources(names: &[ExtractedSource], metadata: &[ExtractedSource]) -> Self {
        Self {
            name_lists: names
                .iter()
                .map(|source| {
                    let listed = source
                        .candidates
                        .iter()
                        .map(|candidate| candidate.site_name.clone())
                        .collect();
                    (source.source_id.clone(), listed)
                })
                .collect(),
            metadata: metadata
                .iter()
                .map(|source| {
                    source
                        .candidates
                        .iter()
                        .map(|candidate| (candidate.site_name.clone(), candidate.metadata.clone()))
                        .collect()
                })
                .collect(),
        }
    }

    fn metadata_for(&self, site_name: &str) -> Option<&SiteMetadata> {
        self.metadata.iter().find_map(|lookup| lookup.get(site_name))
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum PreferenceReason {
    /// Chosen because its name is in the list at `rank` (0 is highest).
    /// `contested` means several members were listed and the longest name won.
    NameList {
        list: String,
        rank: usize,
        contested: bool,
    },
    /// No member is in any list; longest name wins, ties go to the first name
    /// in sort order.
    LongestName,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct GroupMember {
    pub site_id: i64,
    pub site_name: String,
}

impl From<&PersistedSite> for GroupMember {
    fn from(site: &PersistedSite) -> Self {
        Self {
            site_id: site.site_id,
            site_name: site.site_name.clone(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct MergePlan {
    pub latitude: f64,
    pub longitude: f64,
    pub preferred: GroupMember,
    pub reason: PreferenceReason,
    pub superseded: Vec<GroupMember>,
    /// Fields on the preferred site that backfill will populate.
    pub backfill_fields: Vec<SiteField>,
    #[serde(skip)]
    pub backfill: Option<SiteMetadata>,
    pub needs_review: bool,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct FailedGroup {
    pub preferred: String,
    pub error: String,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct MergeReport {
    pub groups_found: usize,
    pub groups_merged: usize,
    pub sites_deleted: usize,
    pub rows_repointed: BTreeMap<&'static str, usize>,
    pub fields_backfilled: usize,
    pub needs_review: Vec<String>,
    pub failed_groups: Vec<FailedGroup>,
    pub merges: Vec<MergePlan>,
}

#[derive(Debug, Default)]
struct GroupOutcome {
    sites_deleted: usize,
    rows_repointed: Vec<(&'static str, usize)>,
}

fn round_key(value: f64, precision: u32) -> i64 {
    (value * 10_f64.powi(precision as i32)).round() as i64
}

/// Sites whose coordinates round to the same point, groups of two or more only.
/// Groups are ordered by rounded coordinates, members by name.
pub fn duplicate_groups(snapshot: &SiteSnapshot, precision: u32) -> Vec<((i64, i64), Vec<&PersistedSite>)> {
    let mut groups: BTreeMap<(i64, i64), Vec<&PersistedSite>> = BTreeMap::new();
    for site in &snapshot.sites {
        if let Some((lat, lon)) = site.metadata.coordinates() {
            groups
                .entry((round_key(lat, precision), round_key(lon, precision)))
                .or_default()
                .push(site);
        }
    }
    groups
        .into_iter()
        .filter(|(_, members)| members.len() > 1)
        .map(|(key, mut members)| {
            members.sort_by(|a, b| a.site_name.cmp(&b.site_name));
            (key, members)
        })
        .collect()
}

fn longest_name<'a>(members: &[&'a PersistedSite]) -> Option<&'a PersistedSite> {
    members.iter().copied().min_by(|a, b| {
        b.site_name
            .chars()
            .count()
            .cmp(&a.site_name.chars().count())
            .then_with(|| a.site_name.cmp(&b.site_name))
    })
}

fn choose_preferred<'a>(
    members: &[&'a PersistedSite],
    preferences: &MergePreferences,
) -> Option<(&'a PersistedSite, PreferenceReason)> {
    for (rank, (list, names)) in preferences.name_lists.iter().enumerate() {
        let listed: Vec<&PersistedSite> = members
            .iter()
            .copied()
            .filter(|member| names.contains(&member.site_name))
            .collect();
        if listed.is_empty() {
            continue;
        }
        let reason = PreferenceReason::NameList {
            list: list.clone(),
            rank,
            contested: listed.len() > 1,
        };
        return longest_name(&listed).map(|site| (site, reason));
    }
    longest_name(members).map(|site| (site, PreferenceReason::LongestName))
}

/// Decides every merge without touching the store.
pub fn plan_merges(
    snapshot: &SiteSnapshot,
    preferences: &MergePreferences,
    precision: u32,
) -> Vec<MergePlan> {
    let scale = 10_f64.powi(precision as i32);
    let mut plans = Vec::new();
    for ((lat_key, lon_key), members) in duplicate_groups(snapshot, precision) {
        let Some((preferred, reason)) = choose_preferred(&members, preferences) else {
            continue;
        };
        let backfill = preferences.metadata_for(&preferred.site_name).cloned();
        let backfill_fields = backfill
            .as_ref()
            .map(|source| {
                SiteField::ALL
                    .into_iter()
                    .filter(|field| {
                        preferred.metadata.is_missing(*field) && !source.is_missing(*field)
                    })
                    .collect()
            })
            .unwrap_or_default();
        let needs_review = reason == PreferenceReason::LongestName;
        plans.push(MergePlan {
            latitude: lat_key as f64 / scale,
            longitude: lon_key as f64 / scale,
            preferred: GroupMember::from(preferred),
            reason,
            superseded: members
                .iter()
                .filter(|member| member.site_id != preferred.site_id)
                .map(|member| GroupMember::from(*member))
                .collect(),
            backfill_fields,
            backfill,
            needs_review,
        });
    }
    plans
}

/// Dry run: reports what `merge_duplicates` would do.
pub fn analyze_duplicates(
    store: &SqliteStore,
    preferences: &MergePreferences,
    precision: u32,
) -> rusqlite::Result<Vec<MergePlan>> {
    let snapshot = store.site_snapshot()?;
    Ok(plan_merges(&snapshot, preferences, precision))
}

pub fn merge_duplicates(
    store: &SqliteStore,
    preferences: &MergePreferences,
    precision: u32,
) -> Result<MergeReport, MergeError> {
    let snapshot = store.site_snapshot()?;
    let plans = plan_merges(&snapshot, preferences, precision);
    apply_merges(store, &plans)
}

/// Applies plans in one transaction. Each group commits or rolls back as a unit;
/// an integrity violation rolls back the whole run.
pub fn apply_merges(store: &SqliteStore, plans: &[MergePlan]) -> Result<MergeReport, MergeError> {
    let mut report = MergeReport {
        groups_found: plans.len(),
        ..MergeReport::default()
    };
    if plans.is_empty() {
        info!("no coordinate duplicates found");
        return Ok(report);
    }

    let mut tx = store.conn().unchecked_transaction()?;
    for plan in plans {
        let savepoint = tx.savepoint()?;
        match apply_group(savepoint.deref(), plan) {
            Ok(outcome) => {
                savepoint.commit()?;
                report.groups_merged += 1;
                report.sites_deleted += outcome.sites_deleted;
                for (table, moved) in outcome.rows_repointed {
                    *report.rows_repointed.entry(table).or_default() += moved;
                }
                report.fields_backfilled += plan.backfill_fields.len();
                if plan.needs_review {
                    report.needs_review.push(plan.preferred.site_name.clone());
                }
                report.merges.push(plan.clone());
            }
            Err(err @ MergeError::IntegrityViolation { .. }) => {
                error!(%err, "aborting merge run");
                return Err(err);
            }
            Err(err) => {
                drop(savepoint);
                warn!(preferred = %plan.preferred.site_name, %err, "merge group rolled back");
                report.failed_groups.push(FailedGroup {
                    preferred: plan.preferred.site_name.clone(),
                    error: err.to_string(),
                });
            }
        }
    }
    tx.commit()?;

    info!(
        groups = report.groups_merged,
        deleted = report.sites_deleted,
        failed = report.failed_groups.len(),
        "merged coordinate duplicates"
    );
    Ok(report)
}

fn apply_group(conn: &Connection, plan: &MergePlan) -> Result<GroupOutcome, MergeError> {
    let mut outcome = GroupOutcome::default();
    for source in &plan.superseded {
        for (table, expected) in SqliteStore::dependent_counts_on(conn, source.site_id)? {
            let moved = SqliteStore::repoint_dependents_on(
                conn,
                table,
                source.site_id,
                plan.preferred.site_id,
            )?;
            if moved as i64 != expected {
                warn!(table, site = %source.site_name, expected, moved, "repoint count mismatch");
            } else if moved == 0 {
                debug!(table, site = %source.site_name, "no rows to repoint");
            }
            outcome.rows_repointed.push((table, moved));
        }

        for (table, remaining) in SqliteStore::dependent_counts_on(conn, source.site_id)? {
            if remaining > 0 {
                return Err(MergeError::IntegrityViolation {
                    site_name: source.site_name.clone(),
                    table,
                    remaining,
                });
            }
        }

        let deleted = SqliteStore::delete_site_on(conn, source.site_id)?;
        if deleted == 0 {
            warn!(site = %source.site_name, "superseded site already gone");
        }
        outcome.sites_deleted += deleted;
        info!(kept = %plan.preferred.site_name, removed = %source.site_name, "merged site");
    }

    if let Some(backfill) = &plan.backfill {
        SqliteStore::fill_site_metadata_on(conn, plan.preferred.site_id, backfill)?;
    }
    Ok(outcome)
}
