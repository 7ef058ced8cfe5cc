// Taxon Resolver - Core Library
// Exposes the resolution engine for the CLI and tests

pub mod attempts;     // Attempt chains + head pointers
pub mod cache;        // Content-addressed SQLite cache
pub mod config;
pub mod entry;        // Input entries + CSV loading
pub mod error;
pub mod grouping;     // Fingerprint index
pub mod output;
pub mod pipeline;     // Resolver: grouping → planning → verification → strategies
pub mod planner;      // Query planning
pub mod strategies;
pub mod trace;        // Follow one entry through the run
pub mod verification; // GNVerifier gateway + batch execution

// Re-export commonly used types
pub use attempts::{
    AttemptDraft, AttemptManager, AttemptStatistics, ResolutionAttempt, ResolutionStatus,
};
pub use cache::{CacheArg, CacheClient, CacheStats, CachedFn};
pub use config::{CacheConfig, GatewayConfig, ResolutionConfig, SynonymPolicy};
pub use entry::{load_entries, Entry, InputBatch, Rank, Taxonomy};
pub use error::{CacheError, ConfigError, GatewayError, StrategyError};
pub use grouping::{group_entries, EntryGroup};
pub use output::{OutputFiles, OutputRecord, RunStatistics};
pub use pipeline::{ResolutionRun, Resolver};
pub use planner::{plan_queries, QueryGroup, QueryParameters, QueryPlan};
pub use strategies::{ResolutionStrategy, StrategyContext, StrategyManager};
pub use trace::{trace_entry, trace_from_input, EntryTrace};
pub use verification::{
    GnverifierClient, StaticGateway, VerificationGateway, VerificationResult,
};

pub const VERSION: &str = env!("CARGO_PKG_VERSION");
