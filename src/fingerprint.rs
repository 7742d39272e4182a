//! Fingerprint and key service
//!
//! Memory IDs are content-addressed: the same scope and normalized content
//! always produce the same 128-bit ID, which is what makes `save`
//! idempotent. Cache and lock keys are all derived here so that every key in
//! the system is scope-prefixed.

use sha2::{Digest, Sha256};
use unicode_normalization::UnicodeNormalization;

use crate::types::{MemoryId, Scope, SearchFilter};

/// Separator between scope and content in the hash input
const FIELD_SEPARATOR: char = '\u{1F}';

/// Normalize content for hashing: trim, NFKC fold, lowercase.
/// Stored content stays verbatim; this form exists only for addressing.
pub fn normalize_content(content: &str) -> String {
    content.trim().nfkc().collect::<String>().to_lowercase()
}

/// Canonical string form of a scope, stable across field reordering
pub fn canonical_scope(scope: &Scope) -> String {
    let mut out = String::with_capacity(64);
    out.push_str("t=");
    out.push_str(&scope.tenant);
    out.push(FIELD_SEPARATOR);
    out.push_str("u=");
    out.push_str(&scope.user);
    for (tag, value) in [
        ("a", scope.agent.as_deref()),
        ("s", scope.session.as_deref()),
        ("p", scope.project.as_deref()),
    ] {
        if let Some(value) = value {
            out.push(FIELD_SEPARATOR);
            out.push_str(tag);
            out.push('=');
            out.push_str(value);
        }
    }
    out
}

/// 128-bit content-addressed memory ID as 32 lowercase hex chars
pub fn fingerprint(scope: &Scope, content: &str) -> MemoryId {
    let mut hasher = Sha256::new();
    hasher.update(canonical_scope(scope).as_bytes());
    hasher.update([0x1F]);
    hasher.update(normalize_content(content).as_bytes());
    let digest = hasher.finalize();
    hex_encode(&digest[..16])
}

/// Short scope hash used as the prefix of every cache and lock key
pub fn scope_hash(scope: &Scope) -> String {
    let digest = Sha256::digest(canonical_scope(scope).as_bytes());
    hex_encode(&digest[..8])
}

/// Hash of an arbitrary query payload for cache keys
pub fn query_hash(parts: &[&str]) -> String {
    let mut hasher = Sha256::new();
    for part in parts {
        hasher.update(part.as_bytes());
        hasher.update([0x1F]);
    }
    hex_encode(&hasher.finalize()[..8])
}

fn hex_encode(bytes: &[u8]) -> String {
    let mut out = String::with_capacity(bytes.len() * 2);
    for b in bytes {
        out.push_str(&format!("{:02x}", b));
    }
    out
}

/// Key-space version prefix; bump on incompatible cache layout changes
const KEY_VERSION: &str = "mem:v1";

/// Cache key for a search result set
pub fn search_cache_key(scope: &Scope, query: &str, k: usize, filter: &SearchFilter) -> String {
    let filter_json = serde_json::to_string(filter).unwrap_or_default();
    let hash = query_hash(&[query, &k.to_string(), &filter_json]);
    format!("{}:{}:search:{}", KEY_VERSION, scope_hash(scope), hash)
}

/// Cache key for a `get_context` result set
pub fn context_cache_key(scope: &Scope, query: &str, k: usize, min_confidence: u8) -> String {
    let hash = query_hash(&[query, &k.to_string(), &min_confidence.to_string()]);
    format!("{}:{}:context:{}", KEY_VERSION, scope_hash(scope), hash)
}

/// Cache key for a single record lookup
pub fn id_cache_key(scope: &Scope, id: &str) -> String {
    format!("{}:{}:id:{}", KEY_VERSION, scope_hash(scope), id)
}

/// Invalidation prefix covering every cached read in a scope
pub fn scope_cache_prefix(scope: &Scope) -> String {
    format!("{}:{}:", KEY_VERSION, scope_hash(scope))
}

/// Lock key serializing writes to one (scope, id) pair
pub fn write_lock_key(scope: &Scope, id: &str) -> String {
    format!("lock:mem:{}:{}", scope_hash(scope), id)
}

/// Lock key serializing conflict resolution over one id set
pub fn resolve_lock_key(scope: &Scope, ids: &[MemoryId]) -> String {
    let mut sorted: Vec<&str> = ids.iter().map(|s| s.as_str()).collect();
    sorted.sort_unstable();
    let hash = query_hash(&sorted);
    format!("lock:resolve:{}:{}", scope_hash(scope), hash)
}
