use std::fs::File;
use std::io::{BufRead, BufReader};
use std::path::{Path, PathBuf};

use anyhow::{anyhow, Context, Result};
use clap::{Args, Parser, Subcommand};
use labtat_core::{CompletionEvent, Identifier, RawRow};
use labtat_pipeline::{ingest_rows, match_batch, LinkPolicy};
use labtat_store_sqlite::{MetadataChange, SqliteStore};
use serde::de::DeserializeOwned;
use serde_json::Value;
use time::format_description::well_known::Rfc3339;
use time::OffsetDateTime;
use tracing_subscriber::EnvFilter;

const CLI_CONTRACT_VERSION: &str = "cli.v1";

#[derive(Debug, Parser)]
#[command(name = "labtat")]
#[command(about = "Lab TAT ingestion pipeline CLI")]
struct Cli {
    #[arg(long, default_value = "./labtat.sqlite3")]
    db: PathBuf,

    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Subcommand)]
enum Command {
    Db {
        #[command(subcommand)]
        command: Box<DbCommand>,
    },
    Ingest(IngestArgs),
    Complete(CompleteArgs),
    Meta {
        #[command(subcommand)]
        command: Box<MetaCommand>,
    },
    Unmatched {
        #[command(subcommand)]
        command: Box<UnmatchedCommand>,
    },
    Record {
        #[command(subcommand)]
        command: Box<RecordCommand>,
    },
}

#[derive(Debug, Subcommand)]
enum DbCommand {
    SchemaVersion,
    Migrate(DbMigrateArgs),
    Export(DbExportArgs),
    IntegrityCheck,
}

#[derive(Debug, Args)]
struct DbMigrateArgs {
    #[arg(long, default_value_t = false)]
    dry_run: bool,
}

#[derive(Debug, Args)]
struct DbExportArgs {
    #[arg(long)]
    out: PathBuf,
}

#[derive(Debug, Args)]
struct IngestArgs {
    /// NDJSON file of raw rows, one object per line.
    #[arg(long)]
    rows: PathBuf,
    /// Treat names with no covering interval as unmatched instead of
    /// falling back to the current projection.
    #[arg(long, default_value_t = false)]
    no_current_fallback: bool,
    /// Seed placeholder metadata (price 0, TAT 1440, section PENDING) for
    /// names that have none at all.
    #[arg(long, default_value_t = false)]
    seed_defaults: bool,
}

#[derive(Debug, Args)]
struct CompleteArgs {
    /// NDJSON file of completion events, one object per line.
    #[arg(long)]
    events: PathBuf,
}

#[derive(Debug, Subcommand)]
enum MetaCommand {
    Set(MetaSetArgs),
    Seed(MetaSeedArgs),
    Resolve(MetaResolveArgs),
    History(MetaHistoryArgs),
}

#[derive(Debug, Args)]
struct MetaSetArgs {
    #[arg(long)]
    test_name: String,
    #[arg(long)]
    price_cents: i64,
    #[arg(long)]
    tat_minutes: i64,
    #[arg(long)]
    section: String,
    /// RFC3339 effective instant; defaults to now.
    #[arg(long)]
    changed_at: Option<String>,
}

#[derive(Debug, Args)]
struct MetaSeedArgs {
    #[arg(long)]
    test_name: String,
}

#[derive(Debug, Args)]
struct MetaResolveArgs {
    #[arg(long)]
    test_name: String,
    /// RFC3339 resolution instant; defaults to now.
    #[arg(long)]
    as_of: Option<String>,
    #[arg(long, default_value_t = false)]
    no_current_fallback: bool,
}

#[derive(Debug, Args)]
struct MetaHistoryArgs {
    #[arg(long)]
    test_name: String,
}

#[derive(Debug, Subcommand)]
enum UnmatchedCommand {
    List,
}

#[derive(Debug, Subcommand)]
enum RecordCommand {
    Show(RecordShowArgs),
    List,
}

#[derive(Debug, Args)]
struct RecordShowArgs {
    #[arg(long)]
    identifier: String,
    #[arg(long)]
    test_name: String,
}

fn with_contract_version(value: Value) -> Value {
    match value {
        Value::Object(mut object) => {
            object.insert(
                "contract_version".to_string(),
                Value::String(CLI_CONTRACT_VERSION.to_string()),
            );
            Value::Object(object)
        }
        other => serde_json::json!({
            "contract_version": CLI_CONTRACT_VERSION,
            "payload": other
        }),
    }
}

fn emit_json(value: Value) -> Result<()> {
    println!("{}", serde_json::to_string_pretty(&with_contract_version(value))?);
    Ok(())
}

fn init_tracing() {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn")))
        .with_writer(std::io::stderr)
        .init();
}

fn main() -> Result<()> {
    init_tracing();
    let cli = Cli::parse();
    let mut store = SqliteStore::open(&cli.db)?;
    match cli.command {
        Command::Db { command } => run_db(*command, &mut store),
        Command::Ingest(args) => run_ingest(&args, &mut store),
        Command::Complete(args) => run_complete(&args, &mut store),
        Command::Meta { command } => run_meta(*command, &mut store),
        Command::Unmatched { command } => run_unmatched(*command, &mut store),
        Command::Record { command } => run_record(*command, &mut store),
    }
}

fn run_db(command: DbCommand, store: &mut SqliteStore) -> Result<()> {
    match command {
        DbCommand::SchemaVersion => run_db_schema_version(store),
        DbCommand::Migrate(args) => run_db_migrate(&args, store),
        DbCommand::Export(args) => run_db_export(&args, store),
        DbCommand::IntegrityCheck => run_db_integrity_check(store),
    }
}

fn run_db_schema_version(store: &SqliteStore) -> Result<()> {
    let status = store.schema_status()?;
    emit_json(serde_json::json!({
        "current_version": status.current_version,
        "target_version": status.target_version,
        "pending_versions": status.pending_versions,
        "up_to_date": status.pending_versions.is_empty()
    }))
}

fn run_db_migrate(args: &DbMigrateArgs, store: &mut SqliteStore) -> Result<()> {
    let before = store.schema_status()?;
    if args.dry_run {
        return emit_json(serde_json::json!({
            "dry_run": true,
            "current_version": before.current_version,
            "target_version": before.target_version,
            "would_apply_versions": before.pending_versions
        }));
    }

    store.migrate()?;
    let after = store.schema_status()?;
    emit_json(serde_json::json!({
        "dry_run": false,
        "before_version": before.current_version,
        "applied_versions": before.pending_versions,
        "after_version": after.current_version,
        "up_to_date": after.pending_versions.is_empty()
    }))
}

fn run_db_export(args: &DbExportArgs, store: &mut SqliteStore) -> Result<()> {
    store.migrate()?;
    let manifest = store.export_snapshot(&args.out)?;
    emit_json(serde_json::to_value(&manifest)?)
}

fn run_db_integrity_check(store: &SqliteStore) -> Result<()> {
    let report = store.integrity_check()?;
    emit_json(serde_json::to_value(&report)?)
}

fn run_ingest(args: &IngestArgs, store: &mut SqliteStore) -> Result<()> {
    store.migrate()?;
    let rows: Vec<RawRow> = read_ndjson(&args.rows)?;
    let policy = LinkPolicy {
        fallback_to_current: !args.no_current_fallback,
        seed_unknown: args.seed_defaults,
    };
    let summary = ingest_rows(store, &rows, policy)?;
    emit_json(serde_json::to_value(summary)?)
}

fn run_complete(args: &CompleteArgs, store: &mut SqliteStore) -> Result<()> {
    store.migrate()?;
    let events: Vec<CompletionEvent> = read_ndjson(&args.events)?;
    let summary = match_batch(store, &events)?;
    emit_json(serde_json::to_value(summary)?)
}

fn run_meta(command: MetaCommand, store: &mut SqliteStore) -> Result<()> {
    store.migrate()?;
    match command {
        MetaCommand::Set(args) => {
            let changed_at = parse_instant_or_now(args.changed_at.as_deref())?;
            let fact_id = store.set_current_metadata(&MetadataChange {
                test_name: args.test_name.clone(),
                price_cents: args.price_cents,
                tat_minutes: args.tat_minutes,
                section: args.section.clone(),
                changed_at,
            })?;
            emit_json(serde_json::json!({
                "test_name": args.test_name,
                "fact_id": fact_id.to_string(),
                "effective_from": changed_at.format(&Rfc3339)?
            }))
        }
        MetaCommand::Seed(args) => {
            let seeded = store.seed_default_metadata(&args.test_name)?;
            emit_json(serde_json::json!({
                "test_name": args.test_name,
                "seeded": seeded
            }))
        }
        MetaCommand::Resolve(args) => {
            let as_of = parse_instant_or_now(args.as_of.as_deref())?;
            let resolved =
                store.resolve_metadata(&args.test_name, as_of, !args.no_current_fallback)?;
            emit_json(serde_json::json!({
                "test_name": args.test_name,
                "as_of": as_of.format(&Rfc3339)?,
                "resolved": resolved.map(serde_json::to_value).transpose()?
            }))
        }
        MetaCommand::History(args) => {
            let facts = store.metadata_facts_for(&args.test_name)?;
            emit_json(serde_json::json!({
                "test_name": args.test_name,
                "facts": serde_json::to_value(&facts)?
            }))
        }
    }
}

fn run_unmatched(command: UnmatchedCommand, store: &mut SqliteStore) -> Result<()> {
    store.migrate()?;
    match command {
        UnmatchedCommand::List => {
            let unmatched = store.list_unmatched()?;
            emit_json(serde_json::json!({
                "count": unmatched.len(),
                "unmatched": serde_json::to_value(&unmatched)?
            }))
        }
    }
}

fn run_record(command: RecordCommand, store: &mut SqliteStore) -> Result<()> {
    store.migrate()?;
    match command {
        RecordCommand::Show(args) => {
            let identifier = Identifier::parse(&args.identifier)
                .map_err(|err| anyhow!("invalid identifier `{}`: {err}", args.identifier))?;
            let record = store.get_test_record(&identifier, &args.test_name)?;
            let outcome = record.as_ref().and_then(|record| record.tat_outcome());
            emit_json(serde_json::json!({
                "record": record.map(serde_json::to_value).transpose()?,
                "tat_outcome": outcome.map(labtat_core::TatOutcome::as_str)
            }))
        }
        RecordCommand::List => {
            let records = store.list_test_records()?;
            emit_json(serde_json::json!({
                "count": records.len(),
                "records": serde_json::to_value(&records)?
            }))
        }
    }
}

fn parse_instant_or_now(value: Option<&str>) -> Result<OffsetDateTime> {
    match value {
        Some(raw) => OffsetDateTime::parse(raw, &Rfc3339)
            .with_context(|| format!("invalid RFC3339 instant: {raw}")),
        None => Ok(OffsetDateTime::now_utc()),
    }
}

fn read_ndjson<T: DeserializeOwned>(path: &Path) -> Result<Vec<T>> {
    let file =
        File::open(path).with_context(|| format!("failed to open {}", path.display()))?;
    let reader = BufReader::new(file);
    let mut values = Vec::new();

    for (index, line) in reader.lines().enumerate() {
        let line = line.with_context(|| format!("failed to read {}", path.display()))?;
        if line.trim().is_empty() {
            continue;
        }
        let value = serde_json::from_str(&line).with_context(|| {
            format!("invalid NDJSON on line {} of {}", index + 1, path.display())
        })?;
        values.push(value);
    }

    Ok(values)
}
