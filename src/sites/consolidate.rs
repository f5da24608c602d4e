use std::collections::{BTreeMap, btree_map::Entry};

use serde::Serialize;
use tracing::{debug, info, warn};

use crate::sites::extract::ExtractedSource;
use crate::sites::{CandidateSite, ConflictRecord, ConsolidatedSite, FieldConflict, SiteField};

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct ConsolidationOutcome {
    /// Ordered by site name.
    pub sites: Vec<ConsolidatedSite>,
    pub conflicts: Vec<ConflictRecord>,
    pub fields_filled: usize,
}

/// Merges candidates across sources, most authoritative source first.
///
/// A field already populated is never overwritten by a later source. When two
/// sources disagree on a populated field the pair is reported for review and
/// nothing from the later source is merged.
pub fn consolidate_sites(sources: &[ExtractedSource]) -> ConsolidationOutcome {
    let mut ordered: Vec<&ExtractedSource> = sources.iter().collect();
    ordered.sort_by_key(|source| source.priority);

    let mut merged: BTreeMap<String, ConsolidatedSite> = BTreeMap::new();
    let mut conflicts = Vec::new();
    let mut fields_filled = 0;

    for source in ordered {
        if source.candidates.is_empty() {
            warn!(source = %source.source_id, "no candidates from source");
            continue;
        }
        for candidate in &source.candidates {
            match merged.entry(candidate.site_name.clone()) {
                Entry::Vacant(slot) => {
                    slot.insert(from_candidate(candidate));
                }
                Entry::Occupied(mut slot) => {
                    let (filled, conflict) = absorb(slot.get_mut(), candidate);
                    fields_filled += filled;
                    if let Some(conflict) = conflict {
                        debug!(site = %conflict.site_name, fields = conflict.conflicts.len(), "site conflict");
                        conflicts.push(conflict);
                    }
                }
            }
        }
    }

    info!(
        sites = merged.len(),
        conflicts = conflicts.len(),
        fields_filled,
        "consolidated sites"
    );
    ConsolidationOutcome {
        sites: merged.into_values().collect(),
        conflicts,
        fields_filled,
    }
}

fn from_candidate(candidate: &CandidateSite) -> ConsolidatedSite {
    let provenance = SiteField::ALL
        .into_iter()
        .filter(|field| !candidate.metadata.is_missing(*field))
        .map(|field| (field, candidate.source_id.clone()))
        .collect();
    ConsolidatedSite {
        site_name: candidate.site_name.clone(),
        metadata: candidate.metadata.clone(),
        source_id: candidate.source_id.clone(),
        source_priority: candidate.source_priority,
        provenance,
    }
}

fn absorb(site: &mut ConsolidatedSite, candidate: &CandidateSite) -> (usize, Option<ConflictRecord>) {
    let found: Vec<FieldConflict> = SiteField::ALL
        .into_iter()
        .filter(|field| site.metadata.conflicts_with(&candidate.metadata, *field))
        .map(|field| FieldConflict {
            field,
            existing: site.metadata.render(field).unwrap_or_default(),
            incoming: candidate.metadata.render(field).unwrap_or_default(),
        })
        .collect();
    if !found.is_empty() {
        // Conflicting pairs are left for review; nothing is merged from them.
        let conflict = ConflictRecord {
            site_name: site.site_name.clone(),
            conflicts: found,
            existing_source: site.source_id.clone(),
            incoming_source: candidate.source_id.clone(),
            existing: site.metadata.clone(),
            incoming: candidate.metadata.clone(),
        };
        return (0, Some(conflict));
    }

    let mut filled = 0;
    for field in SiteField::ALL {
        if site.metadata.is_missing(field) && !candidate.metadata.is_missing(field) {
            site.metadata.copy_field(&candidate.metadata, field);
            site.provenance.insert(field, candidate.source_id.clone());
            filled += 1;
        }
    }
    (filled, None)
}
