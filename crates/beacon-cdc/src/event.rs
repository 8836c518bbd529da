//! Typed change records.
//!
//! Each variant carries exactly the row images its operation guarantees:
//! inserts have a new row, updates have a new row plus an optional old
//! image (key-only under `REPLICA IDENTITY DEFAULT`), deletes have only the
//! key. The shape is enforced at decode time so downstream code never
//! probes for missing halves.

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

/// A decoded row image: column name to value. Values are the textual
/// representations pgoutput ships; unchanged TOAST columns are omitted.
pub type Row = Map<String, Value>;

/// Operation kind, for logging and dispatch.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ChangeOp {
    Insert,
    Update,
    Delete,
}

impl std::fmt::Display for ChangeOp {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ChangeOp::Insert => write!(f, "INSERT"),
            ChangeOp::Update => write!(f, "UPDATE"),
            ChangeOp::Delete => write!(f, "DELETE"),
        }
    }
}

/// One row-level change captured from the replication stream.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "op", rename_all = "snake_case")]
pub enum RowChange {
    /// A new row; `row` is the full image.
    Insert { table: String, row: Row },
    /// A changed row; `old` is present only when the publication sends it.
    Update {
        table: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        old: Option<Row>,
        row: Row,
    },
    /// A removed row; `key` holds the replica-identity columns.
    Delete { table: String, key: Row },
}

impl RowChange {
    /// Source table name.
    pub fn table(&self) -> &str {
        match self {
            RowChange::Insert { table, .. }
            | RowChange::Update { table, .. }
            | RowChange::Delete { table, .. } => table,
        }
    }

    /// Operation kind.
    pub fn op(&self) -> ChangeOp {
        match self {
            RowChange::Insert { .. } => ChangeOp::Insert,
            RowChange::Update { .. } => ChangeOp::Update,
            RowChange::Delete { .. } => ChangeOp::Delete,
        }
    }

    /// Resolve the row identifier from whichever image carries it: the new
    /// row for inserts/updates, the key for deletes. pgoutput ships values
    /// as text, so both JSON numbers and numeric strings are accepted.
    pub fn id(&self) -> Option<i64> {
        let image = match self {
            RowChange::Insert { row, .. } | RowChange::Update { row, .. } => row,
            RowChange::Delete { key, .. } => key,
        };
        parse_id(image.get("id")?)
    }
}

fn parse_id(value: &Value) -> Option<i64> {
    match value {
        Value::Number(n) => n.as_i64(),
        Value::String(s) => s.parse().ok(),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn row(pairs: &[(&str, Value)]) -> Row {
        pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.clone()))
            .collect()
    }

    #[test]
    fn test_insert_id_from_text_value() {
        let change = RowChange::Insert {
            table: "users".into(),
            row: row(&[("id", json!("42")), ("name", json!("Alice"))]),
        };
        assert_eq!(change.id(), Some(42));
        assert_eq!(change.op(), ChangeOp::Insert);
        assert_eq!(change.table(), "users");
    }

    #[test]
    fn test_delete_id_from_key() {
        let change = RowChange::Delete {
            table: "users".into(),
            key: row(&[("id", json!(7))]),
        };
        assert_eq!(change.id(), Some(7));
    }

    #[test]
    fn test_update_id_prefers_new_row() {
        let change = RowChange::Update {
            table: "users".into(),
            old: Some(row(&[("id", json!("7"))])),
            row: row(&[("id", json!("8"))]),
        };
        assert_eq!(change.id(), Some(8));
    }

    #[test]
    fn test_missing_id_is_none() {
        let change = RowChange::Insert {
            table: "users".into(),
            row: row(&[("email", json!("a@b.c"))]),
        };
        assert_eq!(change.id(), None);
    }

    #[test]
    fn test_non_numeric_id_is_none() {
        let change = RowChange::Delete {
            table: "users".into(),
            key: row(&[("id", json!("abc"))]),
        };
        assert_eq!(change.id(), None);
    }

    #[test]
    fn test_serde_tagged_by_op() {
        let change = RowChange::Delete {
            table: "users".into(),
            key: row(&[("id", json!("1"))]),
        };
        let encoded = serde_json::to_string(&change).unwrap();
        assert!(encoded.contains("\"op\":\"delete\""));
        assert!(!encoded.contains("\"row\""));
    }

    #[test]
    fn test_op_display() {
        assert_eq!(ChangeOp::Insert.to_string(), "INSERT");
        assert_eq!(ChangeOp::Delete.to_string(), "DELETE");
    }
}
