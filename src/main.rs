use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use std::process::ExitCode;

use clap::{Args, Parser, Subcommand};
use reconcile::biological::NormalizedLevenshtein;
use reconcile::biological::fieldlog::{FieldLog, FieldLogError};
use reconcile::biological::fish::classify_duplicates;
use reconcile::chemical::ChemicalError;
use reconcile::chemical::replicates::consolidate_replicates;
use reconcile::config::{
    ConfigError, EffectiveConfig, SourceSpec, default_repo_config_yaml, load_effective_config,
    resolve_path,
};
use reconcile::habitat::average_habitat_duplicates;
use reconcile::report::{
    ReportError, write_conflict_report, write_consolidated_sites, write_run_summary,
};
use reconcile::sites::consolidate::consolidate_sites;
use reconcile::sites::extract::{ExtractStatus, ExtractedSource, extract_all, extract_source};
use reconcile::sites::lifecycle::{classify_active_sites, cleanup_unused_sites, persist_sites};
use reconcile::sites::merge::{MergeError, MergePreferences, analyze_duplicates, merge_duplicates};
use reconcile::store::SqliteStore;
use serde_json::{Value, json};
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;

#[derive(Debug)]
struct CliError {
    code: &'static str,
    message: String,
}

impl CliError {
    fn new(code: &'static str, message: impl Into<String>) -> Self {
        Self {
            code,
            message: message.into(),
        }
    }

    fn io(code: &'static str, err: io::Error) -> Self {
        Self::new(code, err.to_string())
    }
}

impl From<rusqlite::Error> for CliError {
    fn from(value: rusqlite::Error) -> Self {
        Self::new("sqlite_error", value.to_string())
    }
}

impl From<serde_json::Error> for CliError {
    fn from(value: serde_json::Error) -> Self {
        Self::new("json_error", value.to_string())
    }
}

impl From<ConfigError> for CliError {
    fn from(value: ConfigError) -> Self {
        Self::new("config_error", value.to_string())
    }
}

impl From<ReportError> for CliError {
    fn from(value: ReportError) -> Self {
        Self::new("report_error", value.to_string())
    }
}

impl From<FieldLogError> for CliError {
    fn from(value: FieldLogError) -> Self {
        Self::new("field_log_error", value.to_string())
    }
}

impl From<MergeError> for CliError {
    fn from(value: MergeError) -> Self {
        match value {
            MergeError::Sqlite(err) => err.into(),
            err @ MergeError::IntegrityViolation { .. } => {
                Self::new("integrity_violation", err.to_string())
            }
        }
    }
}

impl From<ChemicalError> for CliError {
    fn from(value: ChemicalError) -> Self {
        match value {
            ChemicalError::Sqlite(err) => err.into(),
            err @ ChemicalError::NoReferenceData => Self::new("no_reference_data", err.to_string()),
            err @ ChemicalError::GroupFailed { .. } => {
                Self::new("replicate_group_failed", err.to_string())
            }
            err @ ChemicalError::MissingReference { .. } => {
                Self::new("missing_reference", err.to_string())
            }
        }
    }
}

#[derive(Parser, Debug)]
#[command(name = "reconcile")]
#[command(about = "Site identity resolution and sample deduplication for monitoring data")]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    Init,
    ConsolidateSites(ConsolidateArgs),
    AnalyzeDuplicates,
    MergeDuplicates,
    ConsolidateReplicates,
    ClassifyDuplicates,
    AverageHabitat,
    ClassifyActive,
    CleanupSites,
}

#[derive(Args, Debug)]
struct ConsolidateArgs {
    /// Extract and report without writing sites.
    #[arg(long)]
    dry_run: bool,
}

#[derive(Debug, Clone)]
struct RepoPaths {
    cwd: PathBuf,
    home: PathBuf,
    root: PathBuf,
    repo_config: PathBuf,
    user_config: PathBuf,
}

/// Loaded configuration with its paths resolved.
struct Workspace {
    paths: RepoPaths,
    config: EffectiveConfig,
    database: PathBuf,
    report_dir: PathBuf,
}

impl Workspace {
    fn load(paths: RepoPaths) -> Result<Self, CliError> {
        let config =
            load_effective_config(&paths.cwd, Some(&paths.repo_config), Some(&paths.user_config))?;
        let database = resolve_path(&config.database, &paths.cwd, &paths.home);
        let report_dir = resolve_path(&config.report_dir, &paths.cwd, &paths.home);
        Ok(Self {
            paths,
            config,
            database,
            report_dir,
        })
    }

    fn open_store(&self) -> Result<SqliteStore, CliError> {
        if !self.database.exists() {
            return Err(CliError::new(
                "not_initialized",
                "database does not exist; run `reconcile init`",
            ));
        }
        Ok(SqliteStore::open(&path_string(&self.database))?)
    }

    fn source_path(&self, spec: &SourceSpec) -> PathBuf {
        resolve_path(&spec.path, &self.paths.cwd, &self.paths.home)
    }

    fn extract_listed(&self, ids: &[String]) -> Vec<ExtractedSource> {
        ids.iter()
            .filter_map(|id| self.config.source(id))
            .map(|spec| extract_source(spec, &self.source_path(spec)))
            .collect()
    }

    fn merge_preferences(&self) -> MergePreferences {
        let merge = &self.config.merge;
        MergePreferences::from_sources(
            &self.extract_listed(&merge.preferred_name_sources),
            &self.extract_listed(&merge.metadata_sources),
        )
    }

    fn field_log(&self) -> Result<FieldLog, CliError> {
        let Some(spec) = &self.config.field_log else {
            warn!("no field log configured; every duplicate group will be averaged");
            return Ok(FieldLog::default());
        };
        let path = resolve_path(&spec.path, &self.paths.cwd, &self.paths.home);
        Ok(FieldLog::load(spec, &path)?)
    }

    /// Prints the result and keeps a copy beside the other reports.
    fn finish(&self, command: &str, partial: bool, mut result: Value) -> Result<(), CliError> {
        if let Some(object) = result.as_object_mut() {
            object.insert(
                "status".to_string(),
                Value::from(if partial { "partial" } else { "ok" }),
            );
            object.insert("command".to_string(), Value::from(command));
        }
        let summary = write_run_summary(&self.report_dir, command, &result)?;
        info!(path = %summary.display(), "wrote run summary");
        print_json(&result)
    }
}

fn main() -> ExitCode {
    tracing_subscriber::registry()
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .with(tracing_subscriber::fmt::layer().with_writer(io::stderr))
        .init();

    match run() {
        Ok(()) => ExitCode::SUCCESS,
        Err(err) => {
            let payload = json!({
                "error": {
                    "code": err.code,
                    "message": err.message,
                }
            });
            eprintln!("{payload}");
            ExitCode::FAILURE
        }
    }
}

fn run() -> Result<(), CliError> {
    let cli = Cli::parse();
    let cwd = std::env::current_dir().map_err(|err| CliError::io("cwd_error", err))?;
    let paths = repo_paths(&cwd)?;
    match cli.command {
        Command::Init => cmd_init(paths),
        Command::ConsolidateSites(args) => cmd_consolidate_sites(&Workspace::load(paths)?, args),
        Command::AnalyzeDuplicates => cmd_analyze_duplicates(&Workspace::load(paths)?),
        Command::MergeDuplicates => cmd_merge_duplicates(&Workspace::load(paths)?),
        Command::ConsolidateReplicates => cmd_consolidate_replicates(&Workspace::load(paths)?),
        Command::ClassifyDuplicates => cmd_classify_duplicates(&Workspace::load(paths)?),
        Command::AverageHabitat => cmd_average_habitat(&Workspace::load(paths)?),
        Command::ClassifyActive => cmd_classify_active(&Workspace::load(paths)?),
        Command::CleanupSites => cmd_cleanup_sites(&Workspace::load(paths)?),
    }
}

fn cmd_init(paths: RepoPaths) -> Result<(), CliError> {
    fs::create_dir_all(&paths.root).map_err(|err| CliError::io("mkdir_error", err))?;
    write_default_config(&paths)?;
    let workspace = Workspace::load(paths)?;
    fs::create_dir_all(&workspace.report_dir).map_err(|err| CliError::io("mkdir_error", err))?;
    if let Some(parent) = workspace.database.parent() {
        fs::create_dir_all(parent).map_err(|err| CliError::io("mkdir_error", err))?;
    }
    let _ = SqliteStore::open(&path_string(&workspace.database))?;

    print_json(&json!({
        "status": "ok",
        "config": workspace.paths.repo_config,
        "database": workspace.database,
        "report_dir": workspace.report_dir,
    }))
}

fn cmd_consolidate_sites(workspace: &Workspace, args: ConsolidateArgs) -> Result<(), CliError> {
    let sources = extract_all(&workspace.config.sources, |spec| workspace.source_path(spec));
    let outcome = consolidate_sites(&sources);
    if outcome.sites.is_empty() {
        return Err(CliError::new(
            "no_sites",
            "no sites could be extracted from any configured source",
        ));
    }

    let conflict_report = write_conflict_report(&workspace.report_dir, &outcome.conflicts)?;
    let sites_report = write_consolidated_sites(&workspace.report_dir, &outcome.sites)?;
    let persisted = if args.dry_run {
        None
    } else {
        let store = workspace.open_store()?;
        Some(persist_sites(&store, &outcome.sites)?)
    };

    let source_rows: Vec<Value> = sources
        .iter()
        .map(|source| {
            json!({
                "id": source.source_id,
                "priority": source.priority,
                "status": source.status,
                "fingerprint": source.fingerprint,
                "candidates": source.candidates.len(),
            })
        })
        .collect();
    let loaded = sources
        .iter()
        .filter(|source| source.status == ExtractStatus::Loaded)
        .count();

    workspace.finish(
        "consolidate-sites",
        !outcome.conflicts.is_empty(),
        json!({
            "dry_run": args.dry_run,
            "sources": source_rows,
            "sources_loaded": loaded,
            "sites": outcome.sites.len(),
            "conflicts": outcome.conflicts.len(),
            "fields_filled": outcome.fields_filled,
            "conflict_report": conflict_report,
            "sites_report": sites_report,
            "persisted": persisted,
        }),
    )
}

fn cmd_analyze_duplicates(workspace: &Workspace) -> Result<(), CliError> {
    let store = workspace.open_store()?;
    let plans = analyze_duplicates(
        &store,
        &workspace.merge_preferences(),
        workspace.config.merge.precision,
    )?;
    let needs_review = plans.iter().any(|plan| plan.needs_review);
    workspace.finish(
        "analyze-duplicates",
        needs_review,
        json!({
            "groups_found": plans.len(),
            "sites_to_delete": plans.iter().map(|plan| plan.superseded.len()).sum::<usize>(),
            "merges": plans,
        }),
    )
}

fn cmd_merge_duplicates(workspace: &Workspace) -> Result<(), CliError> {
    let store = workspace.open_store()?;
    let report = merge_duplicates(
        &store,
        &workspace.merge_preferences(),
        workspace.config.merge.precision,
    )?;
    let partial = !report.failed_groups.is_empty() || !report.needs_review.is_empty();
    workspace.finish("merge-duplicates", partial, serde_json::to_value(&report)?)
}

fn cmd_consolidate_replicates(workspace: &Workspace) -> Result<(), CliError> {
    let store = workspace.open_store()?;
    let stats = consolidate_replicates(&store)?;
    workspace.finish("consolidate-replicates", false, serde_json::to_value(stats)?)
}

fn cmd_classify_duplicates(workspace: &Workspace) -> Result<(), CliError> {
    let store = workspace.open_store()?;
    let field_log = workspace.field_log()?;
    let report = classify_duplicates(
        &store,
        &field_log,
        &NormalizedLevenshtein,
        workspace.config.similarity_threshold,
    )?;
    let partial = report.groups_failed > 0 || !report.ambiguous.is_empty();
    workspace.finish("classify-duplicates", partial, serde_json::to_value(&report)?)
}

fn cmd_average_habitat(workspace: &Workspace) -> Result<(), CliError> {
    let store = workspace.open_store()?;
    let stats = average_habitat_duplicates(&store)?;
    workspace.finish(
        "average-habitat",
        stats.groups_failed > 0,
        serde_json::to_value(stats)?,
    )
}

fn cmd_classify_active(workspace: &Workspace) -> Result<(), CliError> {
    let store = workspace.open_store()?;
    let report = classify_active_sites(&store, workspace.config.activity_window_days)?;
    workspace.finish(
        "classify-active",
        false,
        json!({
            "window_days": workspace.config.activity_window_days,
            "reference_date": report.reference_date,
            "cutoff_date": report.cutoff_date,
            "active": report.active,
            "historic": report.historic,
        }),
    )
}

fn cmd_cleanup_sites(workspace: &Workspace) -> Result<(), CliError> {
    let store = workspace.open_store()?;
    let removed = cleanup_unused_sites(&store)?;
    workspace.finish(
        "cleanup-sites",
        false,
        json!({
            "sites_removed": removed.len(),
            "removed": removed,
        }),
    )
}

fn repo_paths(cwd: &Path) -> Result<RepoPaths, CliError> {
    let home = home_dir()?;
    let root = cwd.join(".reconcile");
    Ok(RepoPaths {
        cwd: cwd.to_path_buf(),
        repo_config: root.join("config.yml"),
        user_config: home.join(".reconcile").join("config.yml"),
        home,
        root,
    })
}

fn write_default_config(paths: &RepoPaths) -> Result<(), CliError> {
    if paths.repo_config.exists() {
        return Ok(());
    }
    fs::write(&paths.repo_config, default_repo_config_yaml())
        .map_err(|err| CliError::io("write_error", err))
}

fn home_dir() -> Result<PathBuf, CliError> {
    std::env::var_os("HOME")
        .map(PathBuf::from)
        .ok_or_else(|| CliError::new("home_error", "HOME environment variable is not set"))
}

fn path_string(path: &Path) -> String {
    path.to_string_lossy().into_owned()
}

fn print_json(value: &Value) -> Result<(), CliError> {
    let rendered = serde_json::to_string(value)?;
    println!("{rendered}");
    Ok(())
}
