use std::collections::BTreeSet;
use std::fmt::{Display, Formatter};

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use time::{OffsetDateTime, UtcOffset};
use ulid::Ulid;

#[derive(Debug, Clone, thiserror::Error, Eq, PartialEq)]
pub enum OverrideError {
    #[error("configuration error: {0}")]
    Configuration(String),
    #[error("schema introspection error: {0}")]
    SchemaIntrospection(String),
    #[error("snapshot error: {0}")]
    Snapshot(String),
    #[error("write error: {0}")]
    Write(String),
}

/// SCD Type-2 status of a physical row.
///
/// `Active`/`Deprecated` mark which version of a natural-key row is current
/// vs. historical in the source table; `Override` marks audit rows in the
/// override table, distinct from either.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, Eq, PartialEq, Ord, PartialOrd, Hash)]
#[serde(rename_all = "snake_case")]
pub enum RecordFlag {
    Active,
    Deprecated,
    Override,
}

impl RecordFlag {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Active => "A",
            Self::Deprecated => "D",
            Self::Override => "O",
        }
    }

    #[must_use]
    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "A" => Some(Self::Active),
            "D" => Some(Self::Deprecated),
            "O" => Some(Self::Override),
            _ => None,
        }
    }
}

/// A single scalar cell of a tabular snapshot.
///
/// The variant set mirrors what the backing store can hold for a fact-table
/// attribute. Equality used by the change detector is *loose*: see
/// [`CellValue::loosely_equals`].
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(untagged)]
pub enum CellValue {
    Null,
    Integer(i64),
    Real(f64),
    Text(String),
}

impl CellValue {
    /// Value equality for change detection.
    ///
    /// Two missing values are equal (no spurious change), `NaN` counts as
    /// missing-like and equals itself, and numerics compare by value so that
    /// `5` vs `5.0` is not a change.
    #[must_use]
    pub fn loosely_equals(&self, other: &Self) -> bool {
        match (self, other) {
            (Self::Null, Self::Null) => true,
            (Self::Integer(a), Self::Integer(b)) => a == b,
            (Self::Text(a), Self::Text(b)) => a == b,
            (Self::Real(a), Self::Real(b)) => (a.is_nan() && b.is_nan()) || a == b,
            (Self::Integer(a), Self::Real(b)) | (Self::Real(b), Self::Integer(a)) => {
                #[allow(clippy::cast_precision_loss)]
                let widened = *a as f64;
                widened == *b
            }
            _ => false,
        }
    }

    #[must_use]
    pub fn is_null(&self) -> bool {
        matches!(self, Self::Null)
    }

    /// Parses a cell from its command-line textual form.
    ///
    /// `null` (any case) is missing, integers and reals parse numerically,
    /// anything else is text.
    #[must_use]
    pub fn from_text(raw: &str) -> Self {
        let trimmed = raw.trim();
        if trimmed.eq_ignore_ascii_case("null") {
            return Self::Null;
        }
        if let Ok(value) = trimmed.parse::<i64>() {
            return Self::Integer(value);
        }
        if let Ok(value) = trimmed.parse::<f64>() {
            return Self::Real(value);
        }
        Self::Text(trimmed.to_string())
    }
}

impl Display for CellValue {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Null => write!(f, "null"),
            Self::Integer(value) => write!(f, "{value}"),
            Self::Real(value) => write!(f, "{value}"),
            Self::Text(value) => write!(f, "{value}"),
        }
    }
}

/// Trims and upper-cases a column name.
///
/// Configuration-declared names and introspected schema names are always
/// compared in this normalized form.
#[must_use]
pub fn normalize_column(name: &str) -> String {
    name.trim().to_ascii_uppercase()
}

/// Whether a name is acceptable in an identifier position.
///
/// Identifiers derived from configuration must pass this check before they
/// are quoted into generated SQL; values never go through identifier
/// positions at all.
#[must_use]
pub fn is_safe_identifier(name: &str) -> bool {
    let mut chars = name.chars();
    let Some(first) = chars.next() else {
        return false;
    };
    if !(first.is_ascii_alphabetic() || first == '_') {
        return false;
    }
    chars.all(|c| c.is_ascii_alphanumeric() || c == '_')
}

/// One configured module: which fact table is editable, where its override
/// audit rows go, and the natural key joining the two.
#[derive(Debug, Clone, Serialize, Deserialize, Eq, PartialEq)]
pub struct ModuleConfig {
    pub module: u32,
    pub module_name: String,
    pub source_table: String,
    pub target_table: String,
    pub editable_column: String,
    pub joining_keys: Vec<String>,
    pub description: String,
}

impl ModuleConfig {
    /// Returns a copy with table and column names trimmed and upper-cased.
    #[must_use]
    pub fn normalized(&self) -> Self {
        Self {
            module: self.module,
            module_name: self.module_name.trim().to_string(),
            source_table: normalize_column(&self.source_table),
            target_table: normalize_column(&self.target_table),
            editable_column: normalize_column(&self.editable_column),
            joining_keys: self
                .joining_keys
                .iter()
                .map(|key| normalize_column(key))
                .collect(),
            description: self.description.clone(),
        }
    }

    /// Splits a stored comma-separated key list into individual names.
    #[must_use]
    pub fn parse_joining_keys(raw: &str) -> Vec<String> {
        raw.split(',')
            .map(normalize_column)
            .filter(|key| !key.is_empty())
            .collect()
    }

    /// Validates the parts of the configuration that do not require schema
    /// introspection.
    ///
    /// # Errors
    /// Returns [`OverrideError::Configuration`] when a table or column name
    /// is empty or unsafe, the joining-key set is empty or duplicated, or
    /// the editable column doubles as a joining key.
    pub fn validate(&self) -> Result<(), OverrideError> {
        for (label, name) in [
            ("source_table", &self.source_table),
            ("target_table", &self.target_table),
            ("editable_column", &self.editable_column),
        ] {
            if !is_safe_identifier(&normalize_column(name)) {
                return Err(OverrideError::Configuration(format!(
                    "{label} is not a valid identifier: {name:?}"
                )));
            }
        }

        if self.joining_keys.is_empty() {
            return Err(OverrideError::Configuration(
                "joining_keys MUST be non-empty".to_string(),
            ));
        }

        let mut seen = BTreeSet::new();
        for key in &self.joining_keys {
            let normalized = normalize_column(key);
            if !is_safe_identifier(&normalized) {
                return Err(OverrideError::Configuration(format!(
                    "joining key is not a valid identifier: {key:?}"
                )));
            }
            if !seen.insert(normalized.clone()) {
                return Err(OverrideError::Configuration(format!(
                    "duplicate joining key: {normalized}"
                )));
            }
            if normalized == normalize_column(&self.editable_column) {
                return Err(OverrideError::Configuration(format!(
                    "editable column {normalized} cannot also be a joining key"
                )));
            }
        }

        Ok(())
    }
}

/// An aligned tabular snapshot: upper-cased column names plus a row-major
/// grid of cells. Both the original and the edited view of a table use this
/// shape, identified by stable row index.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct TableSnapshot {
    columns: Vec<String>,
    rows: Vec<Vec<CellValue>>,
}

impl TableSnapshot {
    /// Builds a snapshot, normalizing column names and checking row widths.
    ///
    /// # Errors
    /// Returns [`OverrideError::Snapshot`] on duplicate columns or a row
    /// whose width differs from the column list.
    pub fn new(columns: Vec<String>, rows: Vec<Vec<CellValue>>) -> Result<Self, OverrideError> {
        let columns: Vec<String> = columns
            .into_iter()
            .map(|name| normalize_column(&name))
            .collect();

        let mut seen = BTreeSet::new();
        for column in &columns {
            if !seen.insert(column.clone()) {
                return Err(OverrideError::Snapshot(format!(
                    "duplicate column name: {column}"
                )));
            }
        }

        for (index, row) in rows.iter().enumerate() {
            if row.len() != columns.len() {
                return Err(OverrideError::Snapshot(format!(
                    "row {index} has {} cells, expected {}",
                    row.len(),
                    columns.len()
                )));
            }
        }

        Ok(Self { columns, rows })
    }

    #[must_use]
    pub fn columns(&self) -> &[String] {
        &self.columns
    }

    #[must_use]
    pub fn rows(&self) -> &[Vec<CellValue>] {
        &self.rows
    }

    #[must_use]
    pub fn row_count(&self) -> usize {
        self.rows.len()
    }

    #[must_use]
    pub fn column_index(&self, name: &str) -> Option<usize> {
        let normalized = normalize_column(name);
        self.columns.iter().position(|column| *column == normalized)
    }

    #[must_use]
    pub fn value(&self, row: usize, column: &str) -> Option<&CellValue> {
        let index = self.column_index(column)?;
        self.rows.get(row).and_then(|cells| cells.get(index))
    }

    /// Replaces one cell, addressed by row index and column name.
    ///
    /// # Errors
    /// Returns [`OverrideError::Snapshot`] when the row or column does not
    /// exist.
    pub fn set_value(
        &mut self,
        row: usize,
        column: &str,
        value: CellValue,
    ) -> Result<(), OverrideError> {
        let index = self.column_index(column).ok_or_else(|| {
            OverrideError::Snapshot(format!("column not present in snapshot: {column}"))
        })?;
        let cells = self
            .rows
            .get_mut(row)
            .ok_or_else(|| OverrideError::Snapshot(format!("row index out of range: {row}")))?;
        cells[index] = value;
        Ok(())
    }

    /// Renders rows as JSON objects keyed by column name, for display.
    #[must_use]
    pub fn to_json_rows(&self) -> Vec<Value> {
        self.rows
            .iter()
            .map(|cells| {
                let mut object = Map::new();
                for (column, cell) in self.columns.iter().zip(cells) {
                    let encoded = match serde_json::to_value(cell) {
                        Ok(value) => value,
                        Err(_) => Value::Null,
                    };
                    object.insert(column.clone(), encoded);
                }
                Value::Object(object)
            })
            .collect()
    }
}

/// One row whose editable column differs between the original and edited
/// snapshots, in original row order.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct RowChange {
    pub row_index: usize,
    pub old_value: CellValue,
    pub new_value: CellValue,
    pub values: Vec<CellValue>,
}

/// Diffs an edited snapshot against the original snapshot of the same rows.
///
/// Row identity is positional: both snapshots must carry the same columns in
/// the same order and the same number of rows. Cells compare with
/// [`CellValue::loosely_equals`], so null-vs-null and `5`-vs-`5.0` are not
/// changes. An empty result means the batch is a no-op and no write step
/// should run.
///
/// # Errors
/// Returns [`OverrideError::Snapshot`] on misaligned snapshots and
/// [`OverrideError::Configuration`] when the editable column is absent.
pub fn detect_changes(
    original: &TableSnapshot,
    edited: &TableSnapshot,
    editable_column: &str,
) -> Result<Vec<RowChange>, OverrideError> {
    if original.columns() != edited.columns() {
        return Err(OverrideError::Snapshot(
            "original and edited snapshots carry different columns".to_string(),
        ));
    }

    if original.row_count() != edited.row_count() {
        return Err(OverrideError::Snapshot(format!(
            "row count mismatch: original has {}, edited has {}",
            original.row_count(),
            edited.row_count()
        )));
    }

    let column = normalize_column(editable_column);
    let index = original.column_index(&column).ok_or_else(|| {
        OverrideError::Configuration(format!("editable column not present in snapshot: {column}"))
    })?;

    let mut changes = Vec::new();
    for (row_index, (before, after)) in original.rows().iter().zip(edited.rows()).enumerate() {
        let old_value = &before[index];
        let new_value = &after[index];
        if !old_value.loosely_equals(new_value) {
            changes.push(RowChange {
                row_index,
                old_value: old_value.clone(),
                new_value: new_value.clone(),
                values: after.clone(),
            });
        }
    }

    Ok(changes)
}

/// Structured result of one applied override batch, returned to the caller
/// instead of any shared mutable "last updated" state.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct BatchReport {
    pub batch_id: Ulid,
    pub rows_overridden: usize,
    pub key_columns: Vec<String>,
    pub affected_keys: Vec<Vec<CellValue>>,
    pub applied_at: String,
}

/// Outcome of a submitted batch. A no-change submission is a distinct,
/// non-error outcome: no SQL writes were issued at all.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum BatchOutcome {
    NoOp,
    Applied(BatchReport),
}

/// Parses an RFC3339 timestamp and requires UTC (`Z`) offset.
///
/// # Errors
/// Returns [`OverrideError::Snapshot`] when parsing fails or the input is
/// not UTC.
pub fn parse_rfc3339_utc(value: &str) -> Result<OffsetDateTime, OverrideError> {
    let parsed = OffsetDateTime::parse(value, &time::format_description::well_known::Rfc3339)
        .map_err(|err| OverrideError::Snapshot(format!("invalid RFC3339 timestamp: {err}")))?;

    if parsed.offset() != UtcOffset::UTC {
        return Err(OverrideError::Snapshot(
            "timestamp MUST use UTC offset Z".to_string(),
        ));
    }

    Ok(parsed)
}

/// Formats a timestamp as RFC3339 after normalizing to UTC.
///
/// # Errors
/// Returns [`OverrideError::Snapshot`] when formatting fails.
pub fn format_rfc3339(value: OffsetDateTime) -> Result<String, OverrideError> {
    value
        .to_offset(UtcOffset::UTC)
        .format(&time::format_description::well_known::Rfc3339)
        .map_err(|err| OverrideError::Snapshot(format!("failed to format timestamp: {err}")))
}

#[must_use]
pub fn now_utc() -> OffsetDateTime {
    OffsetDateTime::now_utc().to_offset(UtcOffset::UTC)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn must_ok<T, E: std::fmt::Display>(result: Result<T, E>) -> T {
        match result {
            Ok(value) => value,
            Err(err) => panic!("expected Ok(..), got error: {err}"),
        }
    }

    fn fixture_snapshot(values: &[CellValue]) -> TableSnapshot {
        let rows = values
            .iter()
            .enumerate()
            .map(|(index, value)| {
                vec![
                    CellValue::Text(format!("P{index}")),
                    value.clone(),
                    CellValue::Text("A".to_string()),
                ]
            })
            .collect();
        must_ok(TableSnapshot::new(
            vec![
                "portfolio_id".to_string(),
                "perf_value".to_string(),
                "record_flag".to_string(),
            ],
            rows,
        ))
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
    fn null_equals_null() {
        assert!(CellValue::Null.loosely_equals(&CellValue::Null));
        assert!(!CellValue::Null.loosely_equals(&CellValue::Integer(0)));
    }

    #[test]
    fn integer_and_real_compare_by_value() {
        assert!(CellValue::Integer(5).loosely_equals(&CellValue::Real(5.0)));
        assert!(CellValue::Real(5.0).loosely_equals(&CellValue::Integer(5)));
        assert!(!CellValue::Integer(5).loosely_equals(&CellValue::Integer(6)));
    }

    #[test]
    fn nan_equals_nan() {
        assert!(CellValue::Real(f64::NAN).loosely_equals(&CellValue::Real(f64::NAN)));
        assert!(!CellValue::Real(f64::NAN).loosely_equals(&CellValue::Real(1.0)));
    }

    #[test]
    fn from_text_parses_null_numbers_and_text() {
        assert_eq!(CellValue::from_text("null"), CellValue::Null);
        assert_eq!(CellValue::from_text("NULL"), CellValue::Null);
        assert_eq!(CellValue::from_text("42"), CellValue::Integer(42));
        assert_eq!(CellValue::from_text("1.5"), CellValue::Real(1.5));
        assert_eq!(
            CellValue::from_text("emea"),
            CellValue::Text("emea".to_string())
        );
    }

    #[test]
    fn record_flag_round_trips() {
        for flag in [
            RecordFlag::Active,
            RecordFlag::Deprecated,
            RecordFlag::Override,
        ] {
            assert_eq!(RecordFlag::parse(flag.as_str()), Some(flag));
        }
        assert_eq!(RecordFlag::parse("X"), None);
    }

    #[test]
    fn safe_identifiers() {
        assert!(is_safe_identifier("PERF_VALUE"));
        assert!(is_safe_identifier("_private"));
        assert!(!is_safe_identifier(""));
        assert!(!is_safe_identifier("1col"));
        assert!(!is_safe_identifier("drop table"));
        assert!(!is_safe_identifier("a;b"));
    }

    #[test]
    fn config_validation_rejects_empty_keys() {
        let mut config = fixture_config();
        config.joining_keys.clear();
        let err = config.validate();
        assert_eq!(
            err,
            Err(OverrideError::Configuration(
                "joining_keys MUST be non-empty".to_string()
            ))
        );
    }

    #[test]
    fn config_validation_rejects_editable_key_overlap() {
        let mut config = fixture_config();
        config.joining_keys.push("PERF_VALUE".to_string());
        assert!(config.validate().is_err());
    }

    #[test]
    fn config_validation_rejects_unsafe_table_name() {
        let mut config = fixture_config();
        config.source_table = "fact; DROP TABLE x".to_string();
        assert!(config.validate().is_err());
    }

    #[test]
    fn normalized_uppercases_names() {
        let config = fixture_config().normalized();
        assert_eq!(config.source_table, "FACT_PORTFOLIO_PERF");
        assert_eq!(config.editable_column, "PERF_VALUE");
        assert_eq!(config.joining_keys, vec!["PORTFOLIO_ID", "REGION"]);
    }

    #[test]
    fn parse_joining_keys_trims_and_drops_empties() {
        let keys = ModuleConfig::parse_joining_keys(" portfolio_id , region ,,");
        assert_eq!(keys, vec!["PORTFOLIO_ID", "REGION"]);
    }

    #[test]
    fn snapshot_rejects_ragged_rows() {
        let result = TableSnapshot::new(
            vec!["A".to_string(), "B".to_string()],
            vec![vec![CellValue::Null]],
        );
        assert!(result.is_err());
    }

    #[test]
    fn snapshot_rejects_duplicate_columns() {
        let result = TableSnapshot::new(
            vec!["a".to_string(), "A".to_string()],
            Vec::new(),
        );
        assert!(result.is_err());
    }

    #[test]
    fn snapshot_lookup_is_case_insensitive() {
        let snapshot = fixture_snapshot(&[CellValue::Integer(100)]);
        assert_eq!(
            snapshot.value(0, "perf_value"),
            Some(&CellValue::Integer(100))
        );
        assert_eq!(
            snapshot.value(0, "PERF_VALUE"),
            Some(&CellValue::Integer(100))
        );
    }

    #[test]
    fn detect_changes_reports_only_differing_rows() {
        let original = fixture_snapshot(&[
            CellValue::Integer(100),
            CellValue::Integer(200),
            CellValue::Null,
        ]);
        let mut edited = original.clone();
        must_ok(edited.set_value(1, "perf_value", CellValue::Real(250.0)));

        let changes = must_ok(detect_changes(&original, &edited, "perf_value"));
        assert_eq!(changes.len(), 1);
        assert_eq!(changes[0].row_index, 1);
        assert_eq!(changes[0].old_value, CellValue::Integer(200));
        assert_eq!(changes[0].new_value, CellValue::Real(250.0));
    }

    #[test]
    fn detect_changes_treats_equal_numerics_as_unchanged() {
        let original = fixture_snapshot(&[CellValue::Integer(5)]);
        let mut edited = original.clone();
        must_ok(edited.set_value(0, "perf_value", CellValue::Real(5.0)));

        let changes = must_ok(detect_changes(&original, &edited, "perf_value"));
        assert!(changes.is_empty());
    }

    #[test]
    fn detect_changes_treats_null_pair_as_unchanged() {
        let original = fixture_snapshot(&[CellValue::Null]);
        let edited = original.clone();
        let changes = must_ok(detect_changes(&original, &edited, "perf_value"));
        assert!(changes.is_empty());
    }

    #[test]
    fn identical_snapshots_yield_empty_change_set() {
        let original = fixture_snapshot(&[CellValue::Integer(1), CellValue::Integer(2)]);
        let changes = must_ok(detect_changes(&original, &original.clone(), "perf_value"));
        assert!(changes.is_empty());
    }

    #[test]
    fn detect_changes_rejects_misaligned_snapshots() {
        let original = fixture_snapshot(&[CellValue::Integer(1), CellValue::Integer(2)]);
        let edited = fixture_snapshot(&[CellValue::Integer(1)]);
        assert!(detect_changes(&original, &edited, "perf_value").is_err());
    }

    #[test]
    fn detect_changes_requires_editable_column() {
        let original = fixture_snapshot(&[CellValue::Integer(1)]);
        let err = detect_changes(&original, &original.clone(), "missing_col");
        assert!(matches!(err, Err(OverrideError::Configuration(_))));
    }

    #[test]
    fn batch_outcome_json_shape() {
        let noop = must_ok(serde_json::to_value(BatchOutcome::NoOp));
        assert_eq!(noop, serde_json::json!({ "outcome": "no_op" }));

        let report = BatchOutcome::Applied(BatchReport {
            batch_id: must_ok(Ulid::from_string("01J0SQQP7M70P6Y3R4T8D8G8M2")),
            rows_overridden: 1,
            key_columns: vec!["PORTFOLIO_ID".to_string()],
            affected_keys: vec![vec![CellValue::Text("P1".to_string())]],
            applied_at: "2026-08-23T12:00:00Z".to_string(),
        });
        let value = must_ok(serde_json::to_value(report));
        assert_eq!(value["outcome"], serde_json::json!("applied"));
        assert_eq!(value["rows_overridden"], serde_json::json!(1));
        assert_eq!(value["affected_keys"][0][0], serde_json::json!("P1"));
    }

    #[test]
    fn rfc3339_requires_utc() {
        assert!(parse_rfc3339_utc("2026-08-23T12:00:00Z").is_ok());
        assert!(parse_rfc3339_utc("2026-08-23T12:00:00+02:00").is_err());
        assert!(parse_rfc3339_utc("not a timestamp").is_err());
    }
}
