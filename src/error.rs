//! Error types for Memoria

use thiserror::Error;

/// Result type alias for Memoria operations
pub type Result<T> = std::result::Result<T, MemoriaError>;

/// Main error type for Memoria
#[derive(Error, Debug)]
pub enum MemoriaError {
    #[error("Invalid input: {0}")]
    InvalidInput(String),

    #[error("Memory not found: {0}")]
    NotFound(String),

    #[error("Lock contended: {0}")]
    Contended(String),

    #[error("Embedder unavailable: {0}")]
    EmbedderUnavailable(String),

    #[error("Extractor unavailable: {0}")]
    ExtractorUnavailable(String),

    #[error("Vector store unavailable: {0}")]
    VectorStoreUnavailable(String),

    #[error("Graph store unavailable: {0}")]
    GraphStoreUnavailable(String),

    #[error("Lock manager unavailable: {0}")]
    LockManagerUnavailable(String),

    #[error("Cache unavailable: {0}")]
    CacheUnavailable(String),

    #[error("Pub/sub unavailable: {0}")]
    PubSubUnavailable(String),

    #[error("Operation timed out: {0}")]
    Timeout(String),

    #[error("Conflict cannot be resolved: {0}")]
    ConflictUnresolved(String),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("Internal error: {0}")]
    Internal(String),
}

impl MemoriaError {
    /// Check if the error is retryable by the transport layer
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            MemoriaError::Contended(_)
                | MemoriaError::Timeout(_)
                | MemoriaError::EmbedderUnavailable(_)
                | MemoriaError::ExtractorUnavailable(_)
                | MemoriaError::VectorStoreUnavailable(_)
                | MemoriaError::GraphStoreUnavailable(_)
                | MemoriaError::LockManagerUnavailable(_)
                | MemoriaError::CacheUnavailable(_)
                | MemoriaError::PubSubUnavailable(_)
        )
    }

    /// Stable error code for the transport layer
    pub fn code(&self) -> i64 {
        match self {
            MemoriaError::NotFound(_) => -32001,
            MemoriaError::Contended(_) => -32002,
            MemoriaError::ConflictUnresolved(_) => -32005,
            MemoriaError::Timeout(_) => -32008,
            MemoriaError::EmbedderUnavailable(_)
            | MemoriaError::ExtractorUnavailable(_)
            | MemoriaError::VectorStoreUnavailable(_)
            | MemoriaError::GraphStoreUnavailable(_)
            | MemoriaError::LockManagerUnavailable(_)
            | MemoriaError::CacheUnavailable(_)
            | MemoriaError::PubSubUnavailable(_) => -32010,
            MemoriaError::InvalidInput(_) => -32602,
            _ => -32000,
        }
    }

    /// Short stable kind tag carried in error payloads
    pub fn kind(&self) -> &'static str {
        match self {
            MemoriaError::InvalidInput(_) => "invalid_input",
            MemoriaError::NotFound(_) => "not_found",
            MemoriaError::Contended(_) => "contended",
            MemoriaError::EmbedderUnavailable(_) => "embedder_unavailable",
            MemoriaError::ExtractorUnavailable(_) => "extractor_unavailable",
            MemoriaError::VectorStoreUnavailable(_) => "vector_store_unavailable",
            MemoriaError::GraphStoreUnavailable(_) => "graph_store_unavailable",
            MemoriaError::LockManagerUnavailable(_) => "lock_manager_unavailable",
            MemoriaError::CacheUnavailable(_) => "cache_unavailable",
            MemoriaError::PubSubUnavailable(_) => "pubsub_unavailable",
            MemoriaError::Timeout(_) => "timeout",
            MemoriaError::ConflictUnresolved(_) => "conflict_unresolved",
            MemoriaError::Serialization(_) => "serialization",
            MemoriaError::Internal(_) => "internal",
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn retryable_classification() {
        assert!(MemoriaError::Contended("busy".into()).is_retryable());
        assert!(MemoriaError::Timeout("slow".into()).is_retryable());
        assert!(MemoriaError::VectorStoreUnavailable("down".into()).is_retryable());
        assert!(!MemoriaError::InvalidInput("bad".into()).is_retryable());
        assert!(!MemoriaError::NotFound("x".into()).is_retryable());
        assert!(!MemoriaError::ConflictUnresolved("y".into()).is_retryable());
    }

    #[test]
    fn stable_codes() {
        assert_eq!(MemoriaError::NotFound("x".into()).code(), -32001);
        assert_eq!(MemoriaError::InvalidInput("x".into()).code(), -32602);
        assert_eq!(
            MemoriaError::GraphStoreUnavailable("x".into()).code(),
            -32010
        );
    }
}
