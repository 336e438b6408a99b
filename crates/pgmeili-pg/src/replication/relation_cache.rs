//! Cache for PostgreSQL relation metadata.
//!
//! pgoutput sends a Relation message before the first DML on each table
//! (and again after any schema change). Insert/Update/Delete only carry the
//! relation OID, so the cache resolves names, column names and types.

use std::collections::HashMap;

use super::pgoutput::{ColumnInfo, RelationMessage, ReplicaIdentity};

/// Cached information about a PostgreSQL relation (table).
#[derive(Debug, Clone)]
pub struct RelationInfo {
    pub namespace: String,
    pub name: String,
    pub columns: Vec<ColumnInfo>,
    pub replica_identity: ReplicaIdentity,
}

impl RelationInfo {
    /// Positions of the replica identity key columns.
    pub fn key_positions(&self) -> Vec<usize> {
        self.columns
            .iter()
            .enumerate()
            .filter(|(_, c)| c.is_key())
            .map(|(i, _)| i)
            .collect()
    }
}

impl From<&RelationMessage> for RelationInfo {
    fn from(msg: &RelationMessage) -> Self {
        Self {
            namespace: msg.namespace.clone(),
            name: msg.name.clone(),
            columns: msg.columns.clone(),
            replica_identity: msg.replica_identity,
        }
    }
}

/// Cache of relation OID to table metadata mappings.
#[derive(Debug, Default)]
pub struct RelationCache {
    relations: HashMap<u32, RelationInfo>,
}

impl RelationCache {
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert or replace the entry for a Relation message.
    pub fn update(&mut self, msg: &RelationMessage) {
        self.relations.insert(msg.relation_id, msg.into());
    }

    /// Look up relation info by OID.
    pub fn get(&self, relation_id: u32) -> Option<&RelationInfo> {
        self.relations.get(&relation_id)
    }

    pub fn len(&self) -> usize {
        self.relations.len()
    }

    pub fn is_empty(&self) -> bool {
        self.relations.is_empty()
    }
}
