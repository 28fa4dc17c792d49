//! Relation cache (C3): per-relation-id schema, as announced by `Relation`
//! protocol messages.
//!
//! Single-writer, single-reader by construction — the decoder owns the cache
//! exclusively and nothing else touches it, so no locking is needed. A fresh
//! session gets a fresh cache; restarting a session invalidates the old one.

use std::collections::HashMap;

use crate::errors::{ReplicationError, ReplicationResult};
use crate::utils::Oid;

/// How much of the old row a table's replica identity setting transmits.
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ReplicaIdentity {
    /// Old row limited to the primary key, unless it is unchanged.
    Default,
    /// No old row ever sent.
    Nothing,
    /// Old row identified via a unique index other than the primary key.
    Index,
    /// Entire old row sent on every update/delete.
    Full,
}

impl ReplicaIdentity {
    pub fn from_wire_char(c: char) -> ReplicationResult<Self> {
        match c {
            'd' => Ok(Self::Default),
            'n' => Ok(Self::Nothing),
            'i' => Ok(Self::Index),
            'f' => Ok(Self::Full),
            other => Err(ReplicationError::malformed(format!(
                "unrecognised replica identity byte {other:?}"
            ))),
        }
    }
}

/// A single column's schema as announced in a Relation message.
#[derive(Debug, Clone, serde::Serialize)]
pub struct Column {
    pub name: String,
    pub type_oid: Oid,
    pub type_modifier: i32,
    /// Whether this column participates in the replica-identity key.
    pub is_key: bool,
}

/// Cached schema for one relation (table), keyed by relation-id.
#[derive(Debug, Clone, serde::Serialize)]
pub struct RelationSchema {
    pub relation_id: Oid,
    pub namespace: String,
    pub name: String,
    pub replica_identity: ReplicaIdentity,
    pub columns: Vec<Column>,
}

impl RelationSchema {
    pub fn qualified_name(&self) -> String {
        format!("{}.{}", self.namespace, self.name)
    }

    pub fn column(&self, index: usize) -> Option<&Column> {
        self.columns.get(index)
    }
}

/// Stores the latest Relation message per relation-id. Reading is lock-free
/// on the hot path; writes happen only when a Relation message arrives.
#[derive(Debug, Default)]
pub struct RelationCache {
    relations: HashMap<Oid, RelationSchema>,
}

impl RelationCache {
    pub fn new() -> Self {
        Self {
            relations: HashMap::new(),
        }
    }

    /// Upsert a relation's schema, replacing any prior announcement in place.
    pub fn upsert(&mut self, schema: RelationSchema) {
        self.relations.insert(schema.relation_id, schema);
    }

    pub fn get(&self, relation_id: Oid) -> Option<&RelationSchema> {
        self.relations.get(&relation_id)
    }

    /// Look up a relation or fail `UnknownRelation` — the protocol violation
    /// case for an Insert/Update/Delete whose relation-id was never announced.
    pub fn require(&self, relation_id: Oid) -> ReplicationResult<&RelationSchema> {
        self.relations
            .get(&relation_id)
            .ok_or(ReplicationError::UnknownRelation { relation_id })
    }

    pub fn len(&self) -> usize {
        self.relations.len()
    }

    pub fn is_empty(&self) -> bool {
        self.relations.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_schema(id: Oid) -> RelationSchema {
        RelationSchema {
            relation_id: id,
            namespace: "public".into(),
            name: "customers".into(),
            replica_identity: ReplicaIdentity::Full,
            columns: vec![Column {
                name: "_id".into(),
                type_oid: 1043,
                type_modifier: -1,
                is_key: true,
            }],
        }
    }

    #[test]
    fn unannounced_relation_is_unknown_relation() {
        let cache = RelationCache::new();
        match cache.require(42) {
            Err(ReplicationError::UnknownRelation { relation_id }) => assert_eq!(relation_id, 42),
            other => panic!("expected UnknownRelation, got {other:?}"),
        }
    }

    #[test]
    fn upsert_replaces_in_place() {
        let mut cache = RelationCache::new();
        cache.upsert(sample_schema(7));
        assert_eq!(cache.get(7).unwrap().name, "customers");

        let mut replacement = sample_schema(7);
        replacement.name = "customers_v2".into();
        cache.upsert(replacement);

        assert_eq!(cache.len(), 1);
        assert_eq!(cache.get(7).unwrap().name, "customers_v2");
    }
}
