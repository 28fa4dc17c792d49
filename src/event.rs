//! Tuple (T), Change event (E) and Transaction context (X) from the data model.

use crate::utils::{Oid, Xid};
use crate::value::Value;

/// A single column slot in a decoded tuple — exactly one of three states.
/// The third state is distinct from `Null`: it means "value not transmitted,
/// treat as unknown" (a TOAST-ed column the server elided because it did not
/// change), and it must round-trip to an *absent* envelope key rather than a
/// `null` one.
#[derive(Debug, Clone, PartialEq)]
pub enum ColumnSlot {
    Present(Value),
    Null,
    UnchangedToast,
}

/// An ordered list of column slots, one per column in the owning relation's
/// schema, in schema column order.
#[derive(Debug, Clone, Default)]
pub struct Tuple {
    pub slots: Vec<ColumnSlot>,
}

impl Tuple {
    pub fn new(slots: Vec<ColumnSlot>) -> Self {
        Self { slots }
    }
}

/// Transaction context (X), established on Begin and closed on Commit. Every
/// row event between the two inherits this context.
#[derive(Debug, Clone, Copy)]
pub struct TransactionContext {
    pub xid: Xid,
    pub commit_lsn: u64,
    pub commit_timestamp_us: i64,
}

/// Change event (E): the sum type the decoder emits, over the message kinds
/// the wire protocol carries. `Insert`/`Update`/`Delete` are the row-change
/// events a consumer sees in the envelope; the rest are either internal
/// bookkeeping (`Begin`/`Commit`) or surfaced advisory-only.
#[derive(Debug, Clone)]
pub enum ChangeEvent {
    Insert {
        relation_id: Oid,
        after: Tuple,
        tx: TransactionContext,
    },
    Update {
        relation_id: Oid,
        before: Option<Tuple>,
        after: Tuple,
        tx: TransactionContext,
    },
    Delete {
        relation_id: Oid,
        before: Option<Tuple>,
        tx: TransactionContext,
    },
    Truncate {
        relation_ids: Vec<Oid>,
        tx: TransactionContext,
    },
    /// Generic logical message (`M`), surfaced as an opaque event.
    Message {
        prefix: String,
        content: Vec<u8>,
        transactional: bool,
        lsn: u64,
    },
    /// Advisory-only: replication origin metadata (`O`).
    Origin { name: String, commit_lsn: u64 },
    /// Advisory-only: custom type metadata (`Y`).
    Type {
        type_oid: Oid,
        namespace: String,
        name: String,
    },
}

impl ChangeEvent {
    pub fn commit_lsn(&self) -> Option<u64> {
        match self {
            Self::Insert { tx, .. } | Self::Update { tx, .. } | Self::Delete { tx, .. } => {
                Some(tx.commit_lsn)
            }
            Self::Truncate { tx, .. } => Some(tx.commit_lsn),
            Self::Message { lsn, .. } => Some(*lsn),
            _ => None,
        }
    }
}
