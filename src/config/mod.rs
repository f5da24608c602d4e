use std::collections::HashMap;
use std::fs;
use std::path::{Path, PathBuf};

use serde::Deserialize;

pub const DEFAULT_DATABASE: &str = ".reconcile/reconcile.sqlite";
pub const DEFAULT_REPORT_DIR: &str = ".reconcile/reports";
pub const DEFAULT_COORDINATE_PRECISION: u32 = 3;
pub const DEFAULT_SIMILARITY_THRESHOLD: f64 = 0.9;
pub const DEFAULT_ACTIVITY_WINDOW_DAYS: i64 = 365;
const MAX_COORDINATE_PRECISION: u32 = 8;

/// Column names a source uses for each site attribute.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SourceColumns {
    pub site: String,
    pub latitude: Option<String>,
    pub longitude: Option<String>,
    pub county: Option<String>,
    pub river_basin: Option<String>,
    pub ecoregion: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SourceSpec {
    pub id: String,
    pub path: String,
    pub description: String,
    /// Lower is more authoritative.
    pub priority: u32,
    pub columns: SourceColumns,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MergeSettings {
    pub precision: u32,
    pub preferred_name_sources: Vec<String>,
    pub metadata_sources: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FieldLogSpec {
    pub path: String,
    pub site_column: String,
    pub date_column: String,
    pub marker_column: String,
}

#[derive(Debug, Clone, PartialEq)]
pub struct EffectiveConfig {
    pub database: String,
    pub report_dir: String,
    pub sources: Vec<SourceSpec>,
    pub merge: MergeSettings,
    pub field_log: Option<FieldLogSpec>,
    pub similarity_threshold: f64,
    pub activity_window_days: i64,
}

impl Default for EffectiveConfig {
    fn default() -> Self {
        Self {
            database: DEFAULT_DATABASE.to_string(),
            report_dir: DEFAULT_REPORT_DIR.to_string(),
            sources: Vec::new(),
            merge: MergeSettings {
                precision: DEFAULT_COORDINATE_PRECISION,
                preferred_name_sources: Vec::new(),
                metadata_sources: Vec::new(),
            },
            field_log: None,
            similarity_threshold: DEFAULT_SIMILARITY_THRESHOLD,
            activity_window_days: DEFAULT_ACTIVITY_WINDOW_DAYS,
        }
    }
}

impl EffectiveConfig {
    pub fn source(&self, id: &str) -> Option<&SourceSpec> {
        self.sources.iter().find(|source| source.id == id)
    }
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
struct RawConfig {
    #[serde(default)]
    database: Option<String>,
    #[serde(default)]
    report_dir: Option<String>,
    #[serde(default)]
    sources: Option<Vec<RawSourceSpec>>,
    #[serde(default)]
    merge: Option<RawMerge>,
    #[serde(default)]
    field_log: Option<RawFieldLog>,
    #[serde(default)]
    matching: Option<RawMatching>,
    #[serde(default)]
    activity: Option<RawActivity>,
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
struct RawSourceSpec {
    #[serde(default)]
    id: Option<String>,
    path: String,
    #[serde(default)]
    description: Option<String>,
    priority: u32,
    site_column: String,
    #[serde(default)]
    latitude_column: Option<String>,
    #[serde(default)]
    longitude_column: Option<String>,
    #[serde(default)]
    county_column: Option<String>,
    #[serde(default)]
    river_basin_column: Option<String>,
    #[serde(default)]
    ecoregion_column: Option<String>,
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
struct RawMerge {
    #[serde(default)]
    precision: Option<u32>,
    #[serde(default)]
    preferred_name_sources: Option<Vec<String>>,
    #[serde(default)]
    metadata_sources: Option<Vec<String>>,
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
struct RawFieldLog {
    path: String,
    #[serde(default = "default_field_log_site_column")]
    site_column: String,
    #[serde(default = "default_field_log_date_column")]
    date_column: String,
    #[serde(default = "default_field_log_marker_column")]
    marker_column: String,
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
struct RawMatching {
    #[serde(default)]
    similarity_threshold: Option<f64>,
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
struct RawActivity {
    #[serde(default)]
    window_days: Option<i64>,
}

fn default_field_log_site_column() -> String {
    "Name".to_string()
}

fn default_field_log_date_column() -> String {
    "Date".to_string()
}

fn default_field_log_marker_column() -> String {
    "M/F/H".to_string()
}

impl RawSourceSpec {
    fn into_source(self) -> Result<SourceSpec, ConfigError> {
        let id = match self.id {
            Some(id) => id.trim().to_string(),
            None => Path::new(&self.path)
                .file_stem()
                .and_then(|stem| stem.to_str())
                .unwrap_or_default()
                .to_string(),
        };
        if id.is_empty() {
            return Err(ConfigError::Invalid(format!(
                "source `{}` needs an id",
                self.path
            )));
        }
        if self.site_column.trim().is_empty() {
            return Err(ConfigError::Invalid(format!(
                "source `{id}` has an empty site_column"
            )));
        }
        Ok(SourceSpec {
            description: self.description.unwrap_or_else(|| id.clone()),
            id,
            path: self.path,
            priority: self.priority,
            columns: SourceColumns {
                site: self.site_column,
                latitude: self.latitude_column,
                longitude: self.longitude_column,
                county: self.county_column,
                river_basin: self.river_basin_column,
                ecoregion: self.ecoregion_column,
            },
        })
    }
}

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("{0}")]
    Io(#[from] std::io::Error),
    #[error("{0}")]
    Yaml(#[from] serde_yaml::Error),
    #[error("invalid config: {0}")]
    Invalid(String),
}

#[derive(Debug, Default)]
struct ConfigLayer {
    database: Option<String>,
    report_dir: Option<String>,
    sources: Vec<SourceSpec>,
    precision: Option<u32>,
    preferred_name_sources: Option<Vec<String>>,
    metadata_sources: Option<Vec<String>>,
    field_log: Option<FieldLogSpec>,
    similarity_threshold: Option<f64>,
    activity_window_days: Option<i64>,
}

pub fn load_effective_config(
    cwd: &Path,
    repo_config: Option<&Path>,
    user_config: Option<&Path>,
) -> Result<EffectiveConfig, ConfigError> {
    let mut merged = EffectiveConfig::default();

    if let Some(path) = user_config.filter(|path| path.exists()) {
        merge_layer(&mut merged, load_config_layer(path)?);
    }

    if let Some(path) = find_nearest_project_config(cwd) {
        merge_layer(&mut merged, load_config_layer(&path)?);
    }

    if let Some(path) = repo_config.filter(|path| path.exists()) {
        merge_layer(&mut merged, load_config_layer(path)?);
    }

    validate(&merged)?;
    Ok(merged)
}

pub fn find_nearest_project_config(start: &Path) -> Option<PathBuf> {
    start
        .ancestors()
        .map(|dir| dir.join(".reconcile.project.yml"))
        .find(|candidate| candidate.is_file())
}

fn merge_layer(merged: &mut EffectiveConfig, layer: ConfigLayer) {
    merge_sources_by_id(&mut merged.sources, layer.sources);
    if let Some(database) = layer.database {
        merged.database = database;
    }
    if let Some(report_dir) = layer.report_dir {
        merged.report_dir = report_dir;
    }
    if let Some(precision) = layer.precision {
        merged.merge.precision = precision;
    }
    if let Some(names) = layer.preferred_name_sources {
        merged.merge.preferred_name_sources = names;
    }
    if let Some(names) = layer.metadata_sources {
        merged.merge.metadata_sources = names;
    }
    if let Some(field_log) = layer.field_log {
        merged.field_log = Some(field_log);
    }
    if let Some(threshold) = layer.similarity_threshold {
        merged.similarity_threshold = threshold;
    }
    if let Some(days) = layer.activity_window_days {
        merged.activity_window_days = days;
    }
}

fn merge_sources_by_id(existing: &mut Vec<SourceSpec>, incoming: Vec<SourceSpec>) {
    let mut positions: HashMap<String, usize> = existing
        .iter()
        .enumerate()
        .map(|(idx, source)| (source.id.clone(), idx))
        .collect();

    for source in incoming {
        match positions.get(&source.id).copied() {
            Some(idx) => existing[idx] = source,
            None => {
                positions.insert(source.id.clone(), existing.len());
                existing.push(source);
            }
        }
    }
}

fn validate(config: &EffectiveConfig) -> Result<(), ConfigError> {
    if !(0.0..=1.0).contains(&config.similarity_threshold) {
        return Err(ConfigError::Invalid(format!(
            "similarity_threshold {} is outside [0, 1]",
            config.similarity_threshold
        )));
    }
    if config.merge.precision > MAX_COORDINATE_PRECISION {
        return Err(ConfigError::Invalid(format!(
            "coordinate precision {} exceeds {MAX_COORDINATE_PRECISION}",
            config.merge.precision
        )));
    }
    if config.activity_window_days < 0 {
        return Err(ConfigError::Invalid(
            "activity window must not be negative".to_string(),
        ));
    }
    let referenced = config
        .merge
        .preferred_name_sources
        .iter()
        .chain(config.merge.metadata_sources.iter());
    for id in referenced {
        if config.source(id).is_none() {
            return Err(ConfigError::Invalid(format!(
                "merge settings reference unknown source `{id}`"
            )));
        }
    }
    Ok(())
}

fn load_config_layer(path: &Path) -> Result<ConfigLayer, ConfigError> {
    let content = fs::read_to_string(path)?;
    parse_config_layer(&content)
}

fn parse_config_layer(content: &str) -> Result<ConfigLayer, ConfigError> {
    let raw: RawConfig = serde_yaml::from_str(content)?;
    let sources = raw
        .sources
        .unwrap_or_default()
        .into_iter()
        .map(RawSourceSpec::into_source)
        .collect::<Result<Vec<_>, _>>()?;
    let (precision, preferred_name_sources, metadata_sources) = match raw.merge {
        Some(merge) => (
            merge.precision,
            merge.preferred_name_sources,
            merge.metadata_sources,
        ),
        None => (None, None, None),
    };
    Ok(ConfigLayer {
        database: raw.database,
        report_dir: raw.report_dir,
        sources,
        precision,
        preferred_name_sources,
        metadata_sources,
        field_log: raw.field_log.map(|log| FieldLogSpec {
            path: log.path,
            site_column: log.site_column,
            date_column: log.date_column,
            marker_column: log.marker_column,
        }),
        similarity_threshold: raw.matching.and_then(|matching| matching.similarity_threshold),
        activity_window_days: raw.activity.and_then(|activity| activity.window_days),
    })
}

pub fn load_config_file(path: &Path) -> Result<EffectiveConfig, ConfigError> {
    let mut config = EffectiveConfig::default();
    merge_layer(&mut config, load_config_layer(path)?);
    validate(&config)?;
    Ok(config)
}

pub fn default_repo_config_yaml() -> String {
    r#"database: .reconcile/reconcile.sqlite
report_dir: .reconcile/reports
sources:
  - id: site_data
    path: data/interim/cleaned_site_data.csv
    description: Master site data
    priority: 1
    site_column: SiteName
    latitude_column: Latitude
    longitude_column: Longitude
    county_column: County
    river_basin_column: RiverBasin
    ecoregion_column: Mod_Ecoregion
  - id: chemical
    path: data/interim/cleaned_chemical_data.csv
    description: Original chemical data
    priority: 2
    site_column: SiteName
    latitude_column: Latitude
    longitude_column: Longitude
    county_column: County
    river_basin_column: RiverBasin
  - id: fish
    path: data/interim/cleaned_fish_data.csv
    description: Fish data
    priority: 3
    site_column: SiteName
    latitude_column: Latitude
    longitude_column: Longitude
    river_basin_column: RiverBasin
    ecoregion_column: Mod_Ecoregion
  - id: updated_chemical
    path: data/interim/cleaned_updated_chemical_data.csv
    description: Updated chemical data
    priority: 4
    site_column: Site Name
    latitude_column: lat
    longitude_column: lon
    county_column: CountyName
  - id: macro
    path: data/interim/cleaned_macro_data.csv
    description: Macroinvertebrate data
    priority: 5
    site_column: SiteName
    latitude_column: Latitude
    longitude_column: Longitude
    ecoregion_column: Mod_Ecoregion
  - id: habitat
    path: data/interim/cleaned_habitat_data.csv
    description: Habitat data
    priority: 6
    site_column: SiteName
    river_basin_column: RiverBasin
merge:
  precision: 3
  preferred_name_sources: [updated_chemical, chemical]
  metadata_sources: [site_data]
field_log:
  path: data/raw/fish_collection_log.csv
  site_column: Name
  date_column: Date
  marker_column: M/F/H
matching:
  similarity_threshold: 0.9
activity:
  window_days: 365
"#
    .to_string()
}

pub fn expand_tilde(path: &str, home: &Path) -> PathBuf {
    match path.strip_prefix('~') {
        Some("") => home.to_path_buf(),
        Some(rest) if rest.starts_with('/') => home.join(&rest[1..]),
        _ => PathBuf::from(path),
    }
}

/// Expands `~` and anchors relative paths at `base`.
pub fn resolve_path(path: &str, base: &Path, home: &Path) -> PathBuf {
    let expanded = expand_tilde(path, home);
    if expanded.is_absolute() {
        expanded
    } else {
        base.join(expanded)
    }
}
