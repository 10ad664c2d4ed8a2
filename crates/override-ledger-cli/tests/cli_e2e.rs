use std::fs;
use std::path::PathBuf;

use anyhow::Result;
use clap::Parser;
use override_ledger_cli::{run_cli, Cli};
use override_ledger_core::{CellValue, ModuleConfig};
use override_ledger_store_sqlite::SqliteOverrideStore;
use rusqlite::Connection;
use ulid::Ulid;

fn must<T>(result: Result<T>) -> T {
    match result {
        Ok(value) => value,
        Err(err) => panic!("test failure: {err:#}"),
    }
}

fn execute_cli(args: Vec<String>) -> Result<()> {
    let cli = Cli::try_parse_from(args)?;
    run_cli(cli)
}

fn seed_demo_db(path: &PathBuf) {
    let conn = must(Connection::open(path).map_err(Into::into));
    must(
        conn.execute_batch(
            "CREATE TABLE fact_portfolio_perf (
                PORTFOLIO_ID TEXT,
                REGION TEXT,
                PERF_VALUE REAL,
                AS_OF_DATE TEXT,
                RECORD_FLAG TEXT NOT NULL,
                AS_AT_DATE TEXT
             );
             CREATE TABLE fact_portfolio_perf_override (
                PORTFOLIO_ID TEXT,
                REGION TEXT,
                AS_OF_DATE TEXT,
                SRC_INS_TS TEXT,
                PERF_VALUE_OLD REAL,
                PERF_VALUE_NEW REAL,
                RECORD_FLAG TEXT,
                AS_AT_DATE TEXT
             );
             INSERT INTO fact_portfolio_perf VALUES
               ('P1', 'EMEA', 100.0, '2026-07-31', 'A', '2026-08-01T00:00:00Z'),
               ('P2', 'APAC', 200.0, '2026-07-31', 'A', '2026-08-01T00:00:00Z');",
        )
        .map_err(Into::into),
    );
}

fn fixture_config() -> ModuleConfig {
    ModuleConfig {
        module: 1,
        module_name: "Portfolio Performance".to_string(),
        source_table: "fact_portfolio_perf".to_string(),
        target_table: "fact_portfolio_perf_override".to_string(),
        editable_column: "perf_value".to_string(),
        joining_keys: vec!["portfolio_id".to_string(), "region".to_string()],
        description: String::new(),
    }
}

#[test]
fn cli_end_to_end_register_verify_submit_and_inspect() {
    let db_path = std::env::temp_dir().join(format!("ovl-cli-e2e-{}.sqlite3", Ulid::new()));
    let db = match db_path.to_str() {
        Some(value) => value.to_string(),
        None => panic!("temp db path must be valid UTF-8"),
    };
    seed_demo_db(&db_path);

    must(execute_cli(vec![
        "ovl".to_string(),
        "--db".to_string(),
        db.clone(),
        "module".to_string(),
        "register".to_string(),
        "--module".to_string(),
        "1".to_string(),
        "--name".to_string(),
        "Portfolio Performance".to_string(),
        "--source-table".to_string(),
        "fact_portfolio_perf".to_string(),
        "--target-table".to_string(),
        "fact_portfolio_perf_override".to_string(),
        "--editable-column".to_string(),
        "perf_value".to_string(),
        "--joining-keys".to_string(),
        "portfolio_id,region".to_string(),
        "--description".to_string(),
        "Monthly performance override".to_string(),
    ]));

    must(execute_cli(vec![
        "ovl".to_string(),
        "--db".to_string(),
        db.clone(),
        "module".to_string(),
        "verify".to_string(),
        "--module".to_string(),
        "1".to_string(),
    ]));

    must(execute_cli(vec![
        "ovl".to_string(),
        "--db".to_string(),
        db.clone(),
        "data".to_string(),
        "snapshot".to_string(),
        "--module".to_string(),
        "1".to_string(),
    ]));

    // Row 0 is P1 in snapshot order.
    must(execute_cli(vec![
        "ovl".to_string(),
        "--db".to_string(),
        db.clone(),
        "override".to_string(),
        "submit".to_string(),
        "--module".to_string(),
        "1".to_string(),
        "--edit".to_string(),
        "0=150.0".to_string(),
    ]));

    let store = must(SqliteOverrideStore::open(&db_path));
    let config = fixture_config();

    let active = must(store.fetch_active_snapshot(&config));
    assert_eq!(active.row_count(), 2);
    let mut p1_value = None;
    for row in 0..active.row_count() {
        if active.value(row, "PORTFOLIO_ID") == Some(&CellValue::Text("P1".to_string())) {
            p1_value = active.value(row, "PERF_VALUE").cloned();
        }
    }
    assert_eq!(p1_value, Some(CellValue::Real(150.0)));

    let history = must(store.fetch_override_history(&config));
    assert_eq!(history.row_count(), 1);
    assert_eq!(
        history.value(0, "PERF_VALUE_OLD"),
        Some(&CellValue::Real(100.0))
    );
    assert_eq!(
        history.value(0, "PERF_VALUE_NEW"),
        Some(&CellValue::Real(150.0))
    );

    // Submitting no edits is a no-op, not an error.
    must(execute_cli(vec![
        "ovl".to_string(),
        "--db".to_string(),
        db.clone(),
        "override".to_string(),
        "submit".to_string(),
        "--module".to_string(),
        "1".to_string(),
    ]));
    let history = must(store.fetch_override_history(&config));
    assert_eq!(history.row_count(), 1);

    must(execute_cli(vec![
        "ovl".to_string(),
        "--db".to_string(),
        db,
        "data".to_string(),
        "history".to_string(),
        "--module".to_string(),
        "1".to_string(),
    ]));

    let _ = fs::remove_file(&db_path);
}

#[test]
fn cli_submit_fails_for_unknown_module() {
    let db_path = std::env::temp_dir().join(format!("ovl-cli-missing-{}.sqlite3", Ulid::new()));
    let db = match db_path.to_str() {
        Some(value) => value.to_string(),
        None => panic!("temp db path must be valid UTF-8"),
    };

    let result = execute_cli(vec![
        "ovl".to_string(),
        "--db".to_string(),
        db,
        "override".to_string(),
        "submit".to_string(),
        "--module".to_string(),
        "42".to_string(),
        "--edit".to_string(),
        "0=1".to_string(),
    ]);
    assert!(result.is_err());

    let _ = fs::remove_file(&db_path);
}
