//! Memoria - memory orchestration for AI agents
//!
//! Persists each atomic memory across a vector index and a knowledge graph,
//! serves ranked, quality-filtered context, and tracks project milestones,
//! versioning, confidence, and conflicts over time.
//!
//! The engine talks to the outside world only through the port traits in
//! [`ports`]; the in-process adapters there make single-node deployments and
//! tests fully self-contained.

pub mod config;
pub mod engine;
pub mod error;
pub mod events;
pub mod fingerprint;
pub mod ports;
pub mod project;
pub mod quality;
pub mod search;
pub mod types;

pub use config::EngineConfig;
pub use engine::MemoryEngine;
pub use error::{MemoriaError, Result};
pub use types::*;

/// Library version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
