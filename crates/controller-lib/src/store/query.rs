//! Named record queries
//!
//! Callers pick one of a closed set of selections instead of passing SQL
//! fragments through the store interface.

use crate::models::ResourceKind;
use chrono::{DateTime, Utc};
use rusqlite::types::Value;

/// A named, parameterised selection over resource records.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RecordQuery {
    /// Every record
    All,
    /// The record with this logical identity, if any
    Identity {
        kind: ResourceKind,
        name: String,
        namespace: Option<String>,
    },
    /// Records not yet confirmed delivered since their last mutation
    PendingDelivery,
    /// Delivered records whose timestamps are all older than `cutoff`
    Reclaimable { cutoff: DateTime<Utc> },
}

impl RecordQuery {
    pub fn identity(kind: ResourceKind, name: impl Into<String>, namespace: Option<&str>) -> Self {
        RecordQuery::Identity {
            kind,
            name: name.into(),
            namespace: namespace.map(str::to_string),
        }
    }

    /// WHERE clause and its positional parameters
    pub(crate) fn predicate(&self) -> (&'static str, Vec<Value>) {
        match self {
            RecordQuery::All => ("1 = 1", Vec::new()),
            RecordQuery::Identity {
                kind,
                name,
                namespace,
            } => (
                "kind = ?1 AND name = ?2 AND namespace_key = ?3",
                vec![
                    Value::Integer(kind.code()),
                    Value::Text(name.clone()),
                    Value::Text(namespace.clone().unwrap_or_default()),
                ],
            ),
            RecordQuery::PendingDelivery => ("sent_at IS NULL OR record_updated > sent_at", Vec::new()),
            RecordQuery::Reclaimable { cutoff } => (
                "sent_at IS NOT NULL AND sent_at < ?1 AND record_created < ?1 AND record_updated < ?1",
                vec![Value::Integer(cutoff.timestamp_micros())],
            ),
        }
    }

    /// Label used in logs
    pub fn name(&self) -> &'static str {
        match self {
            RecordQuery::All => "all",
            RecordQuery::Identity { .. } => "identity",
            RecordQuery::PendingDelivery => "pending_delivery",
            RecordQuery::Reclaimable { .. } => "reclaimable",
        }
    }
}
