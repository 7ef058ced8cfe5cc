// ⚠️ Error Types - One enum per subsystem
// Orchestration code uses anyhow; these cover the places where callers
// need to match on what went wrong.

use std::path::PathBuf;

// ============================================================================
// VERIFICATION GATEWAY
// ============================================================================

/// Errors raised while talking to the name-verification oracle.
///
/// Only `Unavailable` escapes the gateway. Everything else is logged and
/// degraded to placeholder results for the affected batch.
#[derive(Debug, thiserror::Error)]
pub enum GatewayError {
    #[error("verification gateway unavailable: {0}")]
    Unavailable(String),

    #[error("failed to spawn verifier process: {0}")]
    Spawn(#[from] std::io::Error),

    #[error("verifier timed out after {0}s")]
    Timeout(u64),

    #[error("verifier exited with status {code:?}: {stderr}")]
    NonZeroExit { code: Option<i32>, stderr: String },
}

// ============================================================================
// STRATEGY ENGINE
// ============================================================================

/// Errors raised while a strategy interprets a verification result.
/// Converted into a FAILED attempt by the strategy manager.
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum StrategyError {
    #[error("missing expected field: {0}")]
    MissingField(&'static str),

    #[error("malformed classification: {taxa} taxa vs {ranks} ranks")]
    MalformedClassification { taxa: usize, ranks: usize },

    #[error("no candidate results to select from")]
    NoCandidates,
}

// ============================================================================
// CACHE
// ============================================================================

#[derive(Debug, thiserror::Error)]
pub enum CacheError {
    #[error("cache store error: {0}")]
    Store(#[from] rusqlite::Error),

    #[error("cache serialization error: {0}")]
    Serde(#[from] serde_json::Error),

    #[error("cache io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("invalid cache timestamp: {0}")]
    Timestamp(String),
}

// ============================================================================
// CONFIGURATION
// ============================================================================

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("failed to read config {path:?}: {source}")]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to parse config {path}: {message}")]
    Parse { path: String, message: String },

    #[error("invalid config value for {field}: {message}")]
    Validation { field: String, message: String },
}
