//! Change events published on the pub-sub port

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::types::MemoryId;

/// Pub-sub topics the engine publishes on
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Topic {
    MemoryCreated,
    MemoryDeprecated,
    MemoryConflicted,
    MemoryExpired,
    CacheInvalidated,
    CompensationFailed,
}

impl Topic {
    pub fn as_str(&self) -> &'static str {
        match self {
            Topic::MemoryCreated => "memory.created",
            Topic::MemoryDeprecated => "memory.deprecated",
            Topic::MemoryConflicted => "memory.conflicted",
            Topic::MemoryExpired => "memory.expired",
            Topic::CacheInvalidated => "cache.invalidated",
            Topic::CompensationFailed => "memory.compensation_failed",
        }
    }
}

impl std::fmt::Display for Topic {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A change event; the transport layer chooses the wire encoding
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChangeEvent {
    pub topic: Topic,
    /// Affected record, when the event concerns a single record
    pub id: Option<MemoryId>,
    pub scope_hash: String,
    pub timestamp: DateTime<Utc>,
    /// Topic-specific extras (category, conflict ids, failure reason)
    #[serde(default, skip_serializing_if = "serde_json::Value::is_null")]
    pub extra: serde_json::Value,
}

impl ChangeEvent {
    pub fn new(topic: Topic, scope_hash: impl Into<String>, timestamp: DateTime<Utc>) -> Self {
        Self {
            topic,
            id: None,
            scope_hash: scope_hash.into(),
            timestamp,
            extra: serde_json::Value::Null,
        }
    }

    pub fn with_id(mut self, id: impl Into<MemoryId>) -> Self {
        self.id = Some(id.into());
        self
    }

    pub fn with_extra(mut self, extra: serde_json::Value) -> Self {
        self.extra = extra;
        self
    }
}
