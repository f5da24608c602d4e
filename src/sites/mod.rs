pub mod consolidate;
pub mod extract;
pub mod lifecycle;
pub mod merge;

use std::collections::BTreeMap;

use serde::Serialize;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum SiteField {
    Latitude,
    Longitude,
    County,
    RiverBasin,
    Ecoregion,
}

impl SiteField {
    pub const ALL: [SiteField; 5] = [
        SiteField::Latitude,
        SiteField::Longitude,
        SiteField::County,
        SiteField::RiverBasin,
        SiteField::Ecoregion,
    ];

    pub fn name(self) -> &'static str {
        match self {
            SiteField::Latitude => "latitude",
            SiteField::Longitude => "longitude",
            SiteField::County => "county",
            SiteField::RiverBasin => "river_basin",
            SiteField::Ecoregion => "ecoregion",
        }
    }
}

/// Location and classification fields shared by every site representation.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct SiteMetadata {
    pub latitude: Option<f64>,
    pub longitude: Option<f64>,
    pub county: Option<String>,
    pub river_basin: Option<String>,
    pub ecoregion: Option<String>,
}

impl SiteMetadata {
    pub fn is_missing(&self, field: SiteField) -> bool {
        match field {
            SiteField::Latitude => self.latitude.is_none(),
            SiteField::Longitude => self.longitude.is_none(),
            SiteField::County => self.county.is_none(),
            SiteField::RiverBasin => self.river_basin.is_none(),
            SiteField::Ecoregion => self.ecoregion.is_none(),
        }
    }

    /// Both sides hold a value and the values differ.
    pub fn conflicts_with(&self, other: &Self, field: SiteField) -> bool {
        match field {
            SiteField::Latitude => {
                matches!((self.latitude, other.latitude), (Some(a), Some(b)) if a != b)
            }
            SiteField::Longitude => {
                matches!((self.longitude, other.longitude), (Some(a), Some(b)) if a != b)
            }
            SiteField::County => {
                matches!((&self.county, &other.county), (Some(a), Some(b)) if a != b)
            }
            SiteField::RiverBasin => {
                matches!((&self.river_basin, &other.river_basin), (Some(a), Some(b)) if a != b)
            }
            SiteField::Ecoregion => {
                matches!((&self.ecoregion, &other.ecoregion), (Some(a), Some(b)) if a != b)
            }
        }
    }

    pub fn copy_field(&mut self, other: &Self, field: SiteField) {
        match field {
            SiteField::Latitude => self.latitude = other.latitude,
            SiteField::Longitude => self.longitude = other.longitude,
            SiteField::County => self.county = other.county.clone(),
            SiteField::RiverBasin => self.river_basin = other.river_basin.clone(),
            SiteField::Ecoregion => self.ecoregion = other.ecoregion.clone(),
        }
    }

    pub fn render(&self, field: SiteField) -> Option<String> {
        match field {
            SiteField::Latitude => self.latitude.map(|value| value.to_string()),
            SiteField::Longitude => self.longitude.map(|value| value.to_string()),
            SiteField::County => self.county.clone(),
            SiteField::RiverBasin => self.river_basin.clone(),
            SiteField::Ecoregion => self.ecoregion.clone(),
        }
    }

    pub fn coordinates(&self) -> Option<(f64, f64)> {
        Some((self.latitude?, self.longitude?))
    }
}

/// One site as observed in one source, before cross-source merging.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct CandidateSite {
    pub site_name: String,
    pub metadata: SiteMetadata,
    pub source_id: String,
    pub source_priority: u32,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ConsolidatedSite {
    pub site_name: String,
    pub metadata: SiteMetadata,
    pub source_id: String,
    pub source_priority: u32,
    /// Source that last set each populated field.
    pub provenance: BTreeMap<SiteField, String>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct FieldConflict {
    pub field: SiteField,
    pub existing: String,
    pub incoming: String,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ConflictRecord {
    pub site_name: String,
    pub conflicts: Vec<FieldConflict>,
    pub existing_source: String,
    pub incoming_source: String,
    pub existing: SiteMetadata,
    pub incoming: SiteMetadata,
}

/// Trims and collapses internal whitespace runs to a single space.
pub fn normalize_site_name(raw: &str) -> String {
    raw.split_whitespace().collect::<Vec<_>>().join(" ")
}
