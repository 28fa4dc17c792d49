//! Envelope formatter (C8): converts a decoded row-change event plus its
//! relation and transaction context into the canonical Debezium-shaped CDC
//! envelope, as a structured value and as JSON text.
//!
//! Grounded on the source checker's `event_sink/event_formatter.rs`
//! (`EventFormatter`/`EventBuilder`, tuple-to-object conversion distinguishing
//! null from unchanged-TOAST), restructured around the typed [`Value`] the
//! full type registry (C2) now produces instead of raw strings.

use serde::Serialize;
use serde_json::{Map, Value as JsonValue};

use crate::event::{ChangeEvent, ColumnSlot, Tuple};
use crate::relation::RelationSchema;
use crate::utils::PG_EPOCH_OFFSET_SECS;

/// The canonical envelope shape (V): op/before/after/source/ts_ms[,ts_us,ts_ns].
/// Field order is fixed and preserved through serialization to aid
/// diff-based testing.
#[derive(Debug, Clone, Serialize)]
pub struct Envelope {
    pub op: char,
    pub before: Option<Map<String, JsonValue>>,
    pub after: Option<Map<String, JsonValue>>,
    pub source: Source,
    pub ts_ms: i64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub ts_us: Option<i64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub ts_ns: Option<i64>,
}

#[derive(Debug, Clone, Serialize)]
pub struct Source {
    pub schema: String,
    pub table: String,
    pub lsn: u64,
    #[serde(rename = "txId")]
    pub tx_id: u32,
    pub ts_ms: i64,
}

/// Pretty-print width for [`Envelope::to_json`]; `Compact` omits all
/// whitespace, the rest use the named number of spaces per indent level.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum JsonIndent {
    Compact,
    Spaces(u8),
}

impl Envelope {
    /// Build the envelope for a user-visible row-change event (Insert,
    /// Update, Delete). Returns `None` for event kinds with no envelope
    /// representation (Truncate, Message, Origin, Type, Begin, Commit).
    pub fn from_event(event: &ChangeEvent, relation: &RelationSchema) -> Option<Envelope> {
        let (op, before, after, tx) = match event {
            ChangeEvent::Insert { after, tx, .. } => ('c', None, Some(after), *tx),
            ChangeEvent::Update {
                before, after, tx, ..
            } => ('u', before.as_ref(), Some(after), *tx),
            ChangeEvent::Delete { before, tx, .. } => ('d', before.as_ref(), None, *tx),
            _ => return None,
        };

        let ts_ms = pg_micros_to_unix_millis(tx.commit_timestamp_us);
        let ts_us = pg_micros_to_unix_micros(tx.commit_timestamp_us);

        Some(Envelope {
            op,
            before: before.map(|t| tuple_to_object(t, relation)),
            after: after.map(|t| tuple_to_object(t, relation)),
            source: Source {
                schema: relation.namespace.clone(),
                table: relation.name.clone(),
                lsn: tx.commit_lsn,
                tx_id: tx.xid,
                ts_ms,
            },
            ts_ms,
            ts_us: Some(ts_us),
            ts_ns: Some(ts_us * 1000),
        })
    }

    /// Serialise to JSON text. `indent` of `Spaces(0)` and `Compact` both
    /// produce the same minified output; `Spaces(2)`/`Spaces(4)` pretty-print
    /// at that width. Keys preserve insertion (schema) order.
    pub fn to_json(&self, indent: JsonIndent) -> serde_json::Result<String> {
        match indent {
            JsonIndent::Compact => serde_json::to_string(self),
            JsonIndent::Spaces(0) => serde_json::to_string(self),
            JsonIndent::Spaces(width) => {
                let spaces = " ".repeat(width as usize);
                let formatter = serde_json::ser::PrettyFormatter::with_indent(spaces.as_bytes());
                let mut buf = Vec::new();
                let mut serializer = serde_json::Serializer::with_formatter(&mut buf, formatter);
                self.serialize(&mut serializer)?;
                Ok(String::from_utf8(buf).expect("serde_json always emits valid UTF-8"))
            }
        }
    }
}

/// Tuple columns are serialised keyed by column name, in schema order.
/// Unchanged-TOAST slots are omitted entirely (absent key), distinct from an
/// explicit JSON `null` for a genuinely-null column.
fn tuple_to_object(tuple: &Tuple, relation: &RelationSchema) -> Map<String, JsonValue> {
    let mut object = Map::new();
    for (index, slot) in tuple.slots.iter().enumerate() {
        let Some(column) = relation.column(index) else {
            continue;
        };
        match slot {
            ColumnSlot::Present(value) => {
                let json = serde_json::to_value(value).unwrap_or(JsonValue::Null);
                object.insert(column.name.clone(), json);
            }
            ColumnSlot::Null => {
                object.insert(column.name.clone(), JsonValue::Null);
            }
            ColumnSlot::UnchangedToast => {
                // Key intentionally absent.
            }
        }
    }
    object
}

fn pg_micros_to_unix_millis(pg_micros: i64) -> i64 {
    pg_micros / 1000 + PG_EPOCH_OFFSET_SECS * 1000
}

fn pg_micros_to_unix_micros(pg_micros: i64) -> i64 {
    pg_micros + PG_EPOCH_OFFSET_SECS * 1_000_000
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::event::TransactionContext;
    use crate::relation::{Column, ReplicaIdentity};
    use crate::value::Value;

    fn customers_relation() -> RelationSchema {
        RelationSchema {
            relation_id: 1,
            namespace: "public".into(),
            name: "customers".into(),
            replica_identity: ReplicaIdentity::Full,
            columns: vec![
                Column {
                    name: "_id".into(),
                    type_oid: 1043,
                    type_modifier: -1,
                    is_key: true,
                },
                Column {
                    name: "name".into(),
                    type_oid: 1043,
                    type_modifier: -1,
                    is_key: false,
                },
                Column {
                    name: "credit_limit".into(),
                    type_oid: 23,
                    type_modifier: -1,
                    is_key: false,
                },
                Column {
                    name: "_deleted".into(),
                    type_oid: 16,
                    type_modifier: -1,
                    is_key: false,
                },
            ],
        }
    }

    fn tx() -> TransactionContext {
        TransactionContext {
            xid: 501,
            commit_lsn: 1000,
            commit_timestamp_us: 0,
        }
    }

    #[test]
    fn insert_round_trip_scenario() {
        let relation = customers_relation();
        let after = Tuple::new(vec![
            ColumnSlot::Present(Value::Text("CUST001".into())),
            ColumnSlot::Present(Value::Text("Alice Johnson".into())),
            ColumnSlot::Present(Value::Int(5000)),
            ColumnSlot::Present(Value::Bool(false)),
        ]);
        let event = ChangeEvent::Insert {
            relation_id: 1,
            after,
            tx: tx(),
        };

        let envelope = Envelope::from_event(&event, &relation).unwrap();
        assert_eq!(envelope.op, 'c');
        assert!(envelope.before.is_none());
        let after = envelope.after.unwrap();
        assert_eq!(after["_id"], JsonValue::String("CUST001".into()));
        assert_eq!(after["name"], JsonValue::String("Alice Johnson".into()));
        assert_eq!(after["_deleted"], JsonValue::Bool(false));
        assert_eq!(envelope.source.table, "customers");
    }

    #[test]
    fn unchanged_toast_key_is_absent_not_null() {
        let relation = customers_relation();
        let before = Tuple::new(vec![
            ColumnSlot::Present(Value::Text("CUST001".into())),
            ColumnSlot::UnchangedToast,
            ColumnSlot::Present(Value::Int(5000)),
            ColumnSlot::Present(Value::Bool(false)),
        ]);
        let object = tuple_to_object(&before, &relation);
        assert!(!object.contains_key("name"));
        assert!(object.contains_key("_id"));
    }

    #[test]
    fn update_captures_old_and_new_under_replica_identity_full() {
        let relation = customers_relation();
        let before = Tuple::new(vec![
            ColumnSlot::Present(Value::Text("CUST001".into())),
            ColumnSlot::Present(Value::Text("Alice Johnson".into())),
            ColumnSlot::Present(Value::Int(5000)),
            ColumnSlot::Present(Value::Bool(false)),
        ]);
        let after = Tuple::new(vec![
            ColumnSlot::Present(Value::Text("CUST001".into())),
            ColumnSlot::Present(Value::Text("Alice Johnson".into())),
            ColumnSlot::Present(Value::Int(7500)),
            ColumnSlot::Present(Value::Bool(false)),
        ]);
        let event = ChangeEvent::Update {
            relation_id: 1,
            before: Some(before),
            after,
            tx: tx(),
        };

        let envelope = Envelope::from_event(&event, &relation).unwrap();
        assert_eq!(envelope.op, 'u');
        let before = envelope.before.unwrap();
        let after = envelope.after.unwrap();
        assert_eq!(before["credit_limit"], JsonValue::from(5000));
        assert_eq!(after["credit_limit"], JsonValue::from(7500));
        assert_eq!(before["_id"], after["_id"]);
        assert_eq!(before["name"], after["name"]);
    }

    #[test]
    fn delete_has_null_after() {
        let relation = customers_relation();
        let before = Tuple::new(vec![
            ColumnSlot::Present(Value::Text("CUST001".into())),
            ColumnSlot::Present(Value::Text("Alice Johnson".into())),
            ColumnSlot::Present(Value::Int(5000)),
            ColumnSlot::Present(Value::Bool(false)),
        ]);
        let event = ChangeEvent::Delete {
            relation_id: 1,
            before: Some(before),
            tx: tx(),
        };
        let envelope = Envelope::from_event(&event, &relation).unwrap();
        assert_eq!(envelope.op, 'd');
        assert!(envelope.after.is_none());
        assert!(envelope.before.is_some());
    }

    #[test]
    fn key_order_is_op_before_after_source_ts_ms() {
        let relation = customers_relation();
        let after = Tuple::new(vec![
            ColumnSlot::Present(Value::Text("CUST001".into())),
            ColumnSlot::Present(Value::Text("Alice Johnson".into())),
            ColumnSlot::Present(Value::Int(5000)),
            ColumnSlot::Present(Value::Bool(false)),
        ]);
        let event = ChangeEvent::Insert {
            relation_id: 1,
            after,
            tx: tx(),
        };
        let envelope = Envelope::from_event(&event, &relation).unwrap();
        let json = envelope.to_json(JsonIndent::Compact).unwrap();
        let op_pos = json.find("\"op\"").unwrap();
        let before_pos = json.find("\"before\"").unwrap();
        let after_pos = json.find("\"after\"").unwrap();
        let source_pos = json.find("\"source\"").unwrap();
        let ts_ms_pos = json.find("\"ts_ms\"").unwrap();
        assert!(op_pos < before_pos);
        assert!(before_pos < after_pos);
        assert!(after_pos < source_pos);
        assert!(source_pos < ts_ms_pos);
    }

    #[test]
    fn source_serialises_tx_id_as_tx_id_camel_case() {
        let relation = customers_relation();
        let after = Tuple::new(vec![
            ColumnSlot::Present(Value::Text("CUST001".into())),
            ColumnSlot::Present(Value::Text("Alice Johnson".into())),
            ColumnSlot::Present(Value::Int(5000)),
            ColumnSlot::Present(Value::Bool(false)),
        ]);
        let event = ChangeEvent::Insert {
            relation_id: 1,
            after,
            tx: tx(),
        };
        let envelope = Envelope::from_event(&event, &relation).unwrap();
        let json = envelope.to_json(JsonIndent::Compact).unwrap();
        assert!(json.contains("\"txId\""));
        assert!(!json.contains("\"tx_id\""));
    }

    #[test]
    fn ts_us_and_ts_ns_share_ts_ms_epoch() {
        let relation = customers_relation();
        let mut tx = tx();
        tx.commit_timestamp_us = 123_456_789;
        let after = Tuple::new(vec![
            ColumnSlot::Present(Value::Text("CUST001".into())),
            ColumnSlot::Present(Value::Text("Alice Johnson".into())),
            ColumnSlot::Present(Value::Int(5000)),
            ColumnSlot::Present(Value::Bool(false)),
        ]);
        let event = ChangeEvent::Insert {
            relation_id: 1,
            after,
            tx,
        };
        let envelope = Envelope::from_event(&event, &relation).unwrap();
        let ts_us = envelope.ts_us.unwrap();
        let ts_ns = envelope.ts_ns.unwrap();
        assert_eq!(ts_us / 1000, envelope.ts_ms);
        assert_eq!(ts_ns / 1000, ts_us);
    }
}
