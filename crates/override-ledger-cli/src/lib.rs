//! Command surface for the override ledger.
//!
//! The engine itself lives in `override-ledger-store-sqlite`; this crate is
//! the thin caller the engine is designed for. It resolves a module's
//! configuration, fetches the Active-row snapshot, applies row-indexed edits
//! to a copy, and submits both snapshots to the engine. Host processes can
//! embed behavior through [`run_cli`] or [`run_command`].

use std::path::PathBuf;

use anyhow::{anyhow, Context, Result};
use clap::{Args, Parser, Subcommand};
use override_ledger_core::{
    BatchOutcome, CellValue, ModuleConfig, OverrideError, TableSnapshot,
};
use override_ledger_store_sqlite::SqliteOverrideStore;

#[derive(Debug, Parser)]
#[command(name = "ovl")]
#[command(about = "Override Ledger CLI")]
pub struct Cli {
    #[arg(long, default_value = "./override_ledger.sqlite3")]
    db: PathBuf,

    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Subcommand)]
pub enum Command {
    Module {
        #[command(subcommand)]
        command: Box<ModuleCommand>,
    },
    Data {
        #[command(subcommand)]
        command: Box<DataCommand>,
    },
    Override {
        #[command(subcommand)]
        command: Box<OverrideCommand>,
    },
}

#[derive(Debug, Subcommand)]
pub enum ModuleCommand {
    Register(RegisterArgs),
    List,
    Show(ModuleRefArgs),
    Verify(ModuleRefArgs),
}

#[derive(Debug, Subcommand)]
pub enum DataCommand {
    Snapshot(ModuleRefArgs),
    History(ModuleRefArgs),
}

#[derive(Debug, Subcommand)]
pub enum OverrideCommand {
    Submit(SubmitArgs),
}

#[derive(Debug, Args)]
pub struct RegisterArgs {
    #[arg(long)]
    module: u32,
    #[arg(long)]
    name: String,
    #[arg(long)]
    source_table: String,
    #[arg(long)]
    target_table: String,
    #[arg(long)]
    editable_column: String,
    /// Natural-key columns, comma-separated, in order.
    #[arg(long)]
    joining_keys: String,
    #[arg(long, default_value = "")]
    description: String,
}

#[derive(Debug, Args)]
pub struct ModuleRefArgs {
    #[arg(long)]
    module: u32,
}

#[derive(Debug, Args)]
pub struct SubmitArgs {
    #[arg(long)]
    module: u32,
    /// One edit per flag, as `ROW=VALUE`, where ROW is the row index in the
    /// fetched Active snapshot and VALUE is a number or `null`.
    #[arg(long = "edit")]
    edits: Vec<String>,
}

/// Executes the parsed top-level CLI command graph.
///
/// # Errors
/// Returns an error when store open/migrate or command execution fails.
pub fn run_cli(cli: Cli) -> Result<()> {
    let mut store = SqliteOverrideStore::open(&cli.db)?;
    store.migrate()?;
    run_command(cli.command, &mut store)
}

/// Executes a parsed command against an existing store handle.
///
/// # Errors
/// Returns an error when configuration lookup, snapshot fetch, or the
/// override batch fails.
pub fn run_command(command: Command, store: &mut SqliteOverrideStore) -> Result<()> {
    match command {
        Command::Module { command } => run_module(*command, store),
        Command::Data { command } => run_data(*command, store),
        Command::Override { command } => run_override(*command, store),
    }
}

fn run_module(command: ModuleCommand, store: &SqliteOverrideStore) -> Result<()> {
    match command {
        ModuleCommand::Register(args) => {
            let config = ModuleConfig {
                module: args.module,
                module_name: args.name,
                source_table: args.source_table,
                target_table: args.target_table,
                editable_column: args.editable_column,
                joining_keys: ModuleConfig::parse_joining_keys(&args.joining_keys),
                description: args.description,
            };
            store.register_module(&config)?;
            println!("{}", serde_json::to_string_pretty(&config.normalized())?);
            Ok(())
        }
        ModuleCommand::List => {
            let modules = store.list_modules()?;
            println!("{}", serde_json::to_string_pretty(&modules)?);
            Ok(())
        }
        ModuleCommand::Show(args) => {
            let config = require_module(store, args.module)?;
            println!("{}", serde_json::to_string_pretty(&config)?);
            Ok(())
        }
        ModuleCommand::Verify(args) => {
            let config = require_module(store, args.module)?;
            store.verify_module(&config)?;
            println!(
                "{}",
                serde_json::to_string_pretty(&serde_json::json!({
                    "module": args.module,
                    "verified": true
                }))?
            );
            Ok(())
        }
    }
}

fn run_data(command: DataCommand, store: &SqliteOverrideStore) -> Result<()> {
    match command {
        DataCommand::Snapshot(args) => {
            let config = require_module(store, args.module)?;
            let snapshot = store.fetch_active_snapshot(&config)?;
            println!("{}", serde_json::to_string_pretty(&snapshot.to_json_rows())?);
            Ok(())
        }
        DataCommand::History(args) => {
            let config = require_module(store, args.module)?;
            let history = store.fetch_override_history(&config)?;
            println!("{}", serde_json::to_string_pretty(&history.to_json_rows())?);
            Ok(())
        }
    }
}

fn run_override(command: OverrideCommand, store: &mut SqliteOverrideStore) -> Result<()> {
    match command {
        OverrideCommand::Submit(args) => {
            let config = require_module(store, args.module)?;
            let original = store.fetch_active_snapshot(&config)?;
            let edited = apply_edits(&original, &config, &args.edits)?;

            let outcome = store.apply_overrides(&config, &original, &edited)?;
            let payload = build_submit_payload(store, &config, outcome)?;
            println!("{}", serde_json::to_string_pretty(&payload)?);
            Ok(())
        }
    }
}

fn require_module(store: &SqliteOverrideStore, module: u32) -> Result<ModuleConfig> {
    store.get_module(module)?.ok_or_else(|| {
        OverrideError::Configuration(format!("no configuration found for module {module}")).into()
    })
}

fn apply_edits(
    original: &TableSnapshot,
    config: &ModuleConfig,
    edits: &[String],
) -> Result<TableSnapshot> {
    let mut edited = original.clone();
    for raw in edits {
        let (row, value) = parse_edit(raw)?;
        if row >= original.row_count() {
            return Err(anyhow!(
                "edit row index {row} out of range: snapshot has {} rows",
                original.row_count()
            ));
        }
        edited.set_value(row, &config.editable_column, value)?;
    }
    Ok(edited)
}

fn parse_edit(raw: &str) -> Result<(usize, CellValue)> {
    let (row_part, value_part) = raw
        .split_once('=')
        .ok_or_else(|| anyhow!("edit must look like ROW=VALUE, got {raw:?}"))?;
    let row: usize = row_part
        .trim()
        .parse()
        .with_context(|| format!("invalid row index in edit {raw:?}"))?;
    Ok((row, CellValue::from_text(value_part)))
}

#[derive(Debug, serde::Serialize)]
struct SubmitJsonPayload {
    contract_version: String,
    module: u32,
    #[serde(flatten)]
    outcome: BatchOutcome,
    active_rows: Option<Vec<serde_json::Value>>,
    history_rows: Option<Vec<serde_json::Value>>,
}

fn build_submit_payload(
    store: &SqliteOverrideStore,
    config: &ModuleConfig,
    outcome: BatchOutcome,
) -> Result<SubmitJsonPayload> {
    let (active_rows, history_rows) = match outcome {
        BatchOutcome::Applied(_) => {
            let active = store.fetch_active_snapshot(config)?;
            let history = store.fetch_override_history(config)?;
            (Some(active.to_json_rows()), Some(history.to_json_rows()))
        }
        BatchOutcome::NoOp => (None, None),
    };

    Ok(SubmitJsonPayload {
        contract_version: "override_submit.v1".to_string(),
        module: config.module,
        outcome,
        active_rows,
        history_rows,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn must<T>(result: Result<T>) -> T {
        match result {
            Ok(value) => value,
            Err(err) => panic!("test failure: {err:#}"),
        }
    }

    #[test]
    fn parse_edit_accepts_row_and_value() {
        let (row, value) = must(parse_edit("3=150.5"));
        assert_eq!(row, 3);
        assert_eq!(value, CellValue::Real(150.5));

        let (row, value) = must(parse_edit("0=null"));
        assert_eq!(row, 0);
        assert_eq!(value, CellValue::Null);
    }

    #[test]
    fn parse_edit_rejects_malformed_input() {
        assert!(parse_edit("no-equals").is_err());
        assert!(parse_edit("x=1").is_err());
    }

    #[test]
    fn submit_payload_omits_snapshots_on_noop() {
        let value = match serde_json::to_value(SubmitJsonPayload {
            contract_version: "override_submit.v1".to_string(),
            module: 1,
            outcome: BatchOutcome::NoOp,
            active_rows: None,
            history_rows: None,
        }) {
            Ok(value) => value,
            Err(err) => panic!("serialization failed: {err}"),
        };
        assert_eq!(value["outcome"], serde_json::json!("no_op"));
        assert_eq!(value["active_rows"], serde_json::Value::Null);
    }
}
