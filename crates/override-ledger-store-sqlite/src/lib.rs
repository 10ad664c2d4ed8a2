#![allow(clippy::missing_errors_doc)]
#![allow(clippy::uninlined_format_args)]

use std::path::Path;

use anyhow::{Context, Result};
use override_ledger_core::{
    detect_changes, format_rfc3339, is_safe_identifier, normalize_column, now_utc, BatchOutcome,
    BatchReport, CellValue, ModuleConfig, OverrideError, RecordFlag, RowChange, TableSnapshot,
};
use rusqlite::types::{Value as SqlValue, ValueRef};
use rusqlite::{params, params_from_iter, Connection, OptionalExtension, Transaction};
use tracing::{debug, info};
use ulid::Ulid;

const LEDGER_MIGRATION_VERSION: i64 = 1;

const COL_RECORD_FLAG: &str = "RECORD_FLAG";
const COL_AS_AT_DATE: &str = "AS_AT_DATE";
const COL_AS_OF_DATE: &str = "AS_OF_DATE";
const COL_SRC_INS_TS: &str = "SRC_INS_TS";

const SCHEMA_LEDGER_V1: &str = r"
CREATE TABLE IF NOT EXISTS override_ref (
  module INTEGER PRIMARY KEY,
  module_name TEXT NOT NULL,
  source_table TEXT NOT NULL,
  target_table TEXT NOT NULL,
  editable_column TEXT NOT NULL,
  joining_keys TEXT NOT NULL,
  description TEXT NOT NULL DEFAULT '',
  updated_at TEXT NOT NULL
);
";

/// SQLite-backed override engine.
///
/// The store owns the `override_ref` configuration table; the per-module
/// source and target tables are externally owned and only ever read or
/// appended to (plus the Active→Deprecated flag flip).
pub struct SqliteOverrideStore {
    conn: Connection,
}

impl SqliteOverrideStore {
    pub fn open(path: &Path) -> Result<Self> {
        let conn = Connection::open(path)
            .with_context(|| format!("failed to open sqlite database at {}", path.display()))?;

        conn.execute_batch(
            "PRAGMA journal_mode = WAL;
             PRAGMA foreign_keys = ON;
             PRAGMA busy_timeout = 5000;",
        )
        .context("failed to configure sqlite pragmas")?;

        Ok(Self { conn })
    }

    pub fn migrate(&self) -> Result<()> {
        self.conn
            .execute_batch(
                "CREATE TABLE IF NOT EXISTS schema_migrations (
                    version INTEGER PRIMARY KEY,
                    applied_at TEXT NOT NULL
                );",
            )
            .context("failed to ensure schema_migrations exists")?;

        self.conn
            .execute_batch(SCHEMA_LEDGER_V1)
            .context("failed to apply override ledger schema")?;

        let now = rfc3339_now()?;
        self.conn
            .execute(
                "INSERT OR IGNORE INTO schema_migrations(version, applied_at) VALUES (?1, ?2)",
                params![LEDGER_MIGRATION_VERSION, now],
            )
            .context("failed to register ledger schema migration")?;

        Ok(())
    }

    /// Registers or replaces a module configuration row.
    pub fn register_module(&self, config: &ModuleConfig) -> Result<()> {
        let config = config.normalized();
        config.validate()?;

        let now = rfc3339_now()?;
        self.conn
            .execute(
                "INSERT INTO override_ref(
                    module, module_name, source_table, target_table,
                    editable_column, joining_keys, description, updated_at
                 ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)
                 ON CONFLICT(module) DO UPDATE SET
                   module_name = excluded.module_name,
                   source_table = excluded.source_table,
                   target_table = excluded.target_table,
                   editable_column = excluded.editable_column,
                   joining_keys = excluded.joining_keys,
                   description = excluded.description,
                   updated_at = excluded.updated_at",
                params![
                    i64::from(config.module),
                    config.module_name,
                    config.source_table,
                    config.target_table,
                    config.editable_column,
                    config.joining_keys.join(","),
                    config.description,
                    now,
                ],
            )
            .context("failed to upsert module configuration")?;

        Ok(())
    }

    pub fn get_module(&self, module: u32) -> Result<Option<ModuleConfig>> {
        let row = self
            .conn
            .query_row(
                "SELECT module, module_name, source_table, target_table,
                        editable_column, joining_keys, description
                 FROM override_ref WHERE module = ?1",
                params![i64::from(module)],
                parse_module_row,
            )
            .optional()
            .context("failed to query module configuration")?;

        Ok(row)
    }

    pub fn list_modules(&self) -> Result<Vec<ModuleConfig>> {
        let mut stmt = self.conn.prepare(
            "SELECT module, module_name, source_table, target_table,
                    editable_column, joining_keys, description
             FROM override_ref ORDER BY module ASC",
        )?;

        let rows = stmt.query_map([], parse_module_row)?;
        collect_rows(rows)
    }

    /// Enumerates a table's column names, normalized upper-case.
    ///
    /// Tables vary per configured module, so the schema is discovered at
    /// call time rather than assumed statically.
    pub fn list_columns(&self, table: &str) -> Result<Vec<String>> {
        let mut stmt = self
            .conn
            .prepare("SELECT name FROM pragma_table_info(?1)")
            .context("failed to prepare schema introspection query")?;

        let rows = stmt.query_map(params![table], |row| row.get::<_, String>(0))?;
        let columns: Vec<String> = collect_rows(rows)?
            .into_iter()
            .map(|name| normalize_column(&name))
            .collect();

        if columns.is_empty() {
            return Err(OverrideError::SchemaIntrospection(format!(
                "no columns found for table {table:?} (does it exist?)"
            ))
            .into());
        }

        Ok(columns)
    }

    /// Validates a module configuration against the live schemas of its
    /// source and target tables.
    pub fn verify_module(&self, config: &ModuleConfig) -> Result<()> {
        let config = config.normalized();
        config.validate()?;

        let source_columns = self.list_columns(&config.source_table)?;
        let target_columns = self.list_columns(&config.target_table)?;
        verify_against_schemas(&config, &source_columns, &target_columns)?;
        Ok(())
    }

    /// Fetches the Active-row snapshot of the module's source table, in
    /// stable row order.
    pub fn fetch_active_snapshot(&self, config: &ModuleConfig) -> Result<TableSnapshot> {
        let config = config.normalized();
        self.fetch_snapshot(&config.source_table, true)
    }

    /// Fetches the full override-history snapshot of the module's target
    /// table.
    pub fn fetch_override_history(&self, config: &ModuleConfig) -> Result<TableSnapshot> {
        let config = config.normalized();
        self.fetch_snapshot(&config.target_table, false)
    }

    fn fetch_snapshot(&self, table: &str, active_only: bool) -> Result<TableSnapshot> {
        let columns = self.list_columns(table)?;
        let select_list = quote_idents(&columns)?.join(", ");
        let table_q = quote_ident(table)?;

        let mut sql = format!("SELECT {select_list} FROM {table_q}");
        if active_only {
            sql.push_str(" WHERE \"RECORD_FLAG\" = 'A'");
        }
        sql.push_str(" ORDER BY rowid ASC");

        let mut stmt = self.conn.prepare(&sql)?;
        let column_count = columns.len();
        let mut rows = stmt.query([])?;
        let mut grid = Vec::new();

        while let Some(row) = rows.next()? {
            let mut cells = Vec::with_capacity(column_count);
            for index in 0..column_count {
                cells.push(cell_from_sql(row.get_ref(index)?)?);
            }
            grid.push(cells);
        }

        Ok(TableSnapshot::new(columns, grid)?)
    }

    /// Applies one submitted edit batch: diff, record, flip — atomically.
    ///
    /// The three steps run in strict sequence inside a single transaction:
    /// the change detector diffs the snapshots, the recorder appends one
    /// audit row per change to the target table, and the mutator inserts a
    /// new Active source row per audit record and demotes the superseded
    /// one. Any failure rolls the whole batch back; a diff with no changes
    /// returns [`BatchOutcome::NoOp`] without issuing any write.
    pub fn apply_overrides(
        &mut self,
        config: &ModuleConfig,
        original: &TableSnapshot,
        edited: &TableSnapshot,
    ) -> Result<BatchOutcome> {
        let config = config.normalized();

        // Introspect both schemas once per batch.
        let source_columns = self.list_columns(&config.source_table)?;
        let target_columns = self.list_columns(&config.target_table)?;
        verify_against_schemas(&config, &source_columns, &target_columns)?;

        let changes = detect_changes(original, edited, &config.editable_column)?;
        if changes.is_empty() {
            debug!(module = config.module, "no changes detected, skipping batch");
            return Ok(BatchOutcome::NoOp);
        }

        let batch_id = Ulid::new();
        let applied_at = rfc3339_now()?;

        let recorder = RecorderPlan::build(&config, edited.columns(), &target_columns)?;
        let promote_sql = build_promote_sql(&config, &source_columns, &target_columns)?;
        let demote_sql = build_demote_sql(&config)?;
        let active_count_sql = build_active_count_sql(&config)?;
        let key_indexes = key_column_indexes(&config, edited)?;

        let tx = self
            .conn
            .transaction()
            .context("failed to start override batch transaction")?;

        // Recorder: one audit row per change, capturing OLD and NEW.
        let mut record_rowids = Vec::with_capacity(changes.len());
        for change in &changes {
            let values = recorder.params_for_change(change, &applied_at);
            tx.execute(&recorder.sql, params_from_iter(values.iter()))
                .with_context(|| {
                    format!(
                        "failed to insert override record for row {}",
                        change.row_index
                    )
                })?;
            record_rowids.push(tx.last_insert_rowid());
        }

        // Mutator: promote a new Active row and demote the superseded one,
        // per audit record just written.
        for (change, record_rowid) in changes.iter().zip(&record_rowids) {
            let promoted = tx
                .execute(&promote_sql, params![record_rowid, applied_at])
                .with_context(|| {
                    format!("failed to insert new active row for row {}", change.row_index)
                })?;
            if promoted == 0 {
                return Err(OverrideError::Write(format!(
                    "no active source row matched the recorded OLD value for row {} \
                     (superseded by a concurrent edit?)",
                    change.row_index
                ))
                .into());
            }

            let demoted = tx
                .execute(&demote_sql, params![record_rowid])
                .with_context(|| {
                    format!("failed to demote prior active row for row {}", change.row_index)
                })?;
            if demoted == 0 {
                return Err(OverrideError::Write(format!(
                    "no prior active row was demoted for row {}",
                    change.row_index
                ))
                .into());
            }
        }

        // Re-check the at-most-one-active invariant for every affected key
        // before committing.
        let mut affected_keys = Vec::with_capacity(changes.len());
        for change in &changes {
            let key_values: Vec<CellValue> = key_indexes
                .iter()
                .map(|index| change.values[*index].clone())
                .collect();
            assert_single_active(&tx, &active_count_sql, &key_values)?;
            affected_keys.push(key_values);
        }

        tx.commit().context("failed to commit override batch")?;

        info!(
            module = config.module,
            batch_id = %batch_id,
            rows = changes.len(),
            "override batch applied"
        );

        Ok(BatchOutcome::Applied(BatchReport {
            batch_id,
            rows_overridden: changes.len(),
            key_columns: config.joining_keys.clone(),
            affected_keys,
            applied_at,
        }))
    }
}

/// Audit-insert statement for one module, prepared once per batch.
struct RecorderPlan {
    sql: String,
    common_indexes: Vec<usize>,
    as_of_index: Option<usize>,
    as_at_index: Option<usize>,
}

impl RecorderPlan {
    fn build(
        config: &ModuleConfig,
        snapshot_columns: &[String],
        target_columns: &[String],
    ) -> Result<Self> {
        let common = common_columns(snapshot_columns, target_columns, config);

        let old_column = format!("{}_OLD", config.editable_column);
        let new_column = format!("{}_NEW", config.editable_column);

        let mut insert_columns: Vec<String> = common.clone();
        insert_columns.push(COL_AS_OF_DATE.to_string());
        insert_columns.push(COL_SRC_INS_TS.to_string());
        insert_columns.push(old_column);
        insert_columns.push(new_column);
        insert_columns.push(COL_RECORD_FLAG.to_string());
        insert_columns.push(COL_AS_AT_DATE.to_string());

        let column_list = quote_idents(&insert_columns)?.join(", ");
        let placeholders: Vec<String> = (1..=insert_columns.len())
            .map(|n| format!("?{n}"))
            .collect();
        let sql = format!(
            "INSERT INTO {} ({column_list}) VALUES ({})",
            quote_ident(&config.target_table)?,
            placeholders.join(", ")
        );

        let common_indexes = common
            .iter()
            .filter_map(|column| {
                snapshot_columns
                    .iter()
                    .position(|candidate| candidate == column)
            })
            .collect();

        Ok(Self {
            sql,
            common_indexes,
            as_of_index: position_of(snapshot_columns, COL_AS_OF_DATE),
            as_at_index: position_of(snapshot_columns, COL_AS_AT_DATE),
        })
    }

    fn params_for_change(&self, change: &RowChange, applied_at: &str) -> Vec<SqlValue> {
        let mut values: Vec<SqlValue> = self
            .common_indexes
            .iter()
            .map(|index| cell_to_sql(&change.values[*index]))
            .collect();

        // Bookkeeping columns carry the row's own dates when the source has
        // them, otherwise the batch timestamp keeps the audit row complete.
        values.push(date_or_batch(change, self.as_of_index, applied_at));
        values.push(SqlValue::Text(applied_at.to_string()));
        values.push(cell_to_sql(&change.old_value));
        values.push(cell_to_sql(&change.new_value));
        values.push(SqlValue::Text(RecordFlag::Override.as_str().to_string()));
        values.push(date_or_batch(change, self.as_at_index, applied_at));
        values
    }
}

fn date_or_batch(change: &RowChange, index: Option<usize>, applied_at: &str) -> SqlValue {
    match index {
        Some(i) if !change.values[i].is_null() => cell_to_sql(&change.values[i]),
        _ => SqlValue::Text(applied_at.to_string()),
    }
}

/// Columns present in both the source row and the target table's schema,
/// excluding the editable column and the bookkeeping columns.
fn common_columns(
    snapshot_columns: &[String],
    target_columns: &[String],
    config: &ModuleConfig,
) -> Vec<String> {
    snapshot_columns
        .iter()
        .filter(|column| target_columns.contains(column))
        .filter(|column| {
            let name = column.as_str();
            name != config.editable_column
                && name != COL_RECORD_FLAG
                && name != COL_AS_AT_DATE
                && name != COL_AS_OF_DATE
                && name != COL_SRC_INS_TS
        })
        .cloned()
        .collect()
}

/// INSERT..SELECT that materializes the new Active source row from one
/// override record, joined back to the current Active row on the natural
/// key to recover columns the record does not carry.
///
/// The join guards on `current.editable IS record.OLD` — the
/// compare-and-swap that refuses to act on a row already superseded by a
/// concurrent edit. Key comparison uses `IS` so NULL keys join to NULL.
fn build_promote_sql(
    config: &ModuleConfig,
    source_columns: &[String],
    target_columns: &[String],
) -> Result<String> {
    let source_q = quote_ident(&config.source_table)?;
    let target_q = quote_ident(&config.target_table)?;
    let editable_q = quote_ident(&config.editable_column)?;
    let new_q = quote_ident(&format!("{}_NEW", config.editable_column))?;

    let column_list = quote_idents(source_columns)?.join(", ");

    let mut select_exprs = Vec::with_capacity(source_columns.len());
    for column in source_columns {
        let column_q = quote_ident(column)?;
        let expr = if *column == config.editable_column {
            format!("ovr.{new_q}")
        } else if column == COL_RECORD_FLAG {
            "'A'".to_string()
        } else if column == COL_AS_AT_DATE {
            "?2".to_string()
        } else if target_columns.contains(column) {
            format!("ovr.{column_q}")
        } else {
            format!("cur.{column_q}")
        };
        select_exprs.push(expr);
    }

    Ok(format!(
        "INSERT INTO {source_q} ({column_list})
         SELECT {}
         FROM {target_q} ovr
         JOIN {source_q} cur
           ON {}
          AND cur.{editable_q} IS ovr.{}
          AND cur.\"RECORD_FLAG\" = 'A'
         WHERE ovr.rowid = ?1",
        select_exprs.join(", "),
        null_safe_key_join(config, "cur", "ovr")?,
        quote_ident(&format!("{}_OLD", config.editable_column))?,
    ))
}

/// Flags the superseded Active row(s) as Deprecated, scoped to one override
/// record and guarded on the recorded OLD value.
fn build_demote_sql(config: &ModuleConfig) -> Result<String> {
    let source_q = quote_ident(&config.source_table)?;
    let target_q = quote_ident(&config.target_table)?;
    let editable_q = quote_ident(&config.editable_column)?;
    let old_q = quote_ident(&format!("{}_OLD", config.editable_column))?;

    Ok(format!(
        "UPDATE {source_q} SET \"RECORD_FLAG\" = 'D'
         WHERE rowid IN (
           SELECT cur.rowid
           FROM {source_q} cur
           JOIN {target_q} ovr
             ON {}
            AND cur.{editable_q} IS ovr.{old_q}
           WHERE ovr.rowid = ?1
             AND cur.\"RECORD_FLAG\" = 'A'
         )",
        null_safe_key_join(config, "cur", "ovr")?,
    ))
}

fn build_active_count_sql(config: &ModuleConfig) -> Result<String> {
    let source_q = quote_ident(&config.source_table)?;
    let mut predicates = Vec::with_capacity(config.joining_keys.len() + 1);
    for (index, key) in config.joining_keys.iter().enumerate() {
        predicates.push(format!("{} IS ?{}", quote_ident(key)?, index + 1));
    }
    predicates.push("\"RECORD_FLAG\" = 'A'".to_string());

    Ok(format!(
        "SELECT COUNT(*) FROM {source_q} WHERE {}",
        predicates.join(" AND ")
    ))
}

fn null_safe_key_join(config: &ModuleConfig, left: &str, right: &str) -> Result<String> {
    let mut clauses = Vec::with_capacity(config.joining_keys.len());
    for key in &config.joining_keys {
        let key_q = quote_ident(key)?;
        clauses.push(format!("{left}.{key_q} IS {right}.{key_q}"));
    }
    Ok(clauses.join(" AND "))
}

fn assert_single_active(
    tx: &Transaction<'_>,
    active_count_sql: &str,
    key_values: &[CellValue],
) -> Result<()> {
    let params: Vec<SqlValue> = key_values.iter().map(cell_to_sql).collect();
    let count: i64 = tx
        .query_row(active_count_sql, params_from_iter(params.iter()), |row| {
            row.get(0)
        })
        .context("failed to re-check active-row invariant")?;

    if count != 1 {
        let rendered: Vec<String> = key_values.iter().map(ToString::to_string).collect();
        return Err(OverrideError::Write(format!(
            "expected exactly one active row for key ({}), found {count}",
            rendered.join(", ")
        ))
        .into());
    }

    Ok(())
}

fn verify_against_schemas(
    config: &ModuleConfig,
    source_columns: &[String],
    target_columns: &[String],
) -> Result<()> {
    let require = |columns: &[String], name: &str, table: &str| -> Result<()> {
        if columns.iter().any(|column| column == name) {
            Ok(())
        } else {
            Err(OverrideError::Configuration(format!(
                "column {name} not present in table {table}"
            ))
            .into())
        }
    };

    require(
        source_columns,
        &config.editable_column,
        &config.source_table,
    )?;
    require(source_columns, COL_RECORD_FLAG, &config.source_table)?;
    require(source_columns, COL_AS_AT_DATE, &config.source_table)?;

    for key in &config.joining_keys {
        require(source_columns, key, &config.source_table)?;
        require(target_columns, key, &config.target_table)?;
    }

    for bookkeeping in [
        format!("{}_OLD", config.editable_column),
        format!("{}_NEW", config.editable_column),
        COL_RECORD_FLAG.to_string(),
        COL_AS_AT_DATE.to_string(),
        COL_AS_OF_DATE.to_string(),
        COL_SRC_INS_TS.to_string(),
    ] {
        require(target_columns, &bookkeeping, &config.target_table)?;
    }

    Ok(())
}

fn key_column_indexes(config: &ModuleConfig, snapshot: &TableSnapshot) -> Result<Vec<usize>> {
    config
        .joining_keys
        .iter()
        .map(|key| {
            snapshot.column_index(key).ok_or_else(|| {
                OverrideError::Configuration(format!(
                    "joining key {key} not present in snapshot"
                ))
                .into()
            })
        })
        .collect()
}

fn position_of(columns: &[String], name: &str) -> Option<usize> {
    columns.iter().position(|column| column == name)
}

/// Quotes a configuration-derived name for an identifier position, after
/// the charset allow-list check.
fn quote_ident(name: &str) -> Result<String, OverrideError> {
    if !is_safe_identifier(name) {
        return Err(OverrideError::Configuration(format!(
            "unsafe identifier rejected: {name:?}"
        )));
    }
    Ok(format!("\"{name}\""))
}

fn quote_idents(names: &[String]) -> Result<Vec<String>, OverrideError> {
    names.iter().map(|name| quote_ident(name)).collect()
}

fn cell_to_sql(value: &CellValue) -> SqlValue {
    match value {
        CellValue::Null => SqlValue::Null,
        CellValue::Integer(v) => SqlValue::Integer(*v),
        CellValue::Real(v) => SqlValue::Real(*v),
        CellValue::Text(v) => SqlValue::Text(v.clone()),
    }
}

fn cell_from_sql(value: ValueRef<'_>) -> Result<CellValue> {
    match value {
        ValueRef::Null => Ok(CellValue::Null),
        ValueRef::Integer(v) => Ok(CellValue::Integer(v)),
        ValueRef::Real(v) => Ok(CellValue::Real(v)),
        ValueRef::Text(bytes) => {
            let text = std::str::from_utf8(bytes).context("non-UTF8 text cell")?;
            Ok(CellValue::Text(text.to_string()))
        }
        ValueRef::Blob(_) => Err(OverrideError::Snapshot(
            "BLOB columns are not supported in snapshots".to_string(),
        )
        .into()),
    }
}

fn parse_module_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<ModuleConfig> {
    let module_i64: i64 = row.get(0)?;
    let module = u32::try_from(module_i64).map_err(|_| {
        rusqlite::Error::FromSqlConversionFailure(
            0,
            rusqlite::types::Type::Integer,
            Box::new(std::io::Error::new(
                std::io::ErrorKind::InvalidData,
                format!("invalid module value: {module_i64}"),
            )),
        )
    })?;
    let joining_keys_raw: String = row.get(5)?;

    Ok(ModuleConfig {
        module,
        module_name: row.get(1)?,
        source_table: row.get(2)?,
        target_table: row.get(3)?,
        editable_column: row.get(4)?,
        joining_keys: ModuleConfig::parse_joining_keys(&joining_keys_raw),
        description: row.get(6)?,
    })
}

fn collect_rows<T>(
    rows: impl Iterator<Item = rusqlite::Result<T>>,
) -> Result<Vec<T>> {
    let mut items = Vec::new();
    for row in rows {
        items.push(row.context("failed to read row")?);
    }
    Ok(items)
}

fn rfc3339_now() -> Result<String> {
    Ok(format_rfc3339(now_utc())?)
}
