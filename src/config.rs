// ⚙️ Resolution Configuration - Settings as Data
// JSON file → environment overrides → CLI overrides → validation

use crate::error::ConfigError;
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

/// GBIF Backbone Taxonomy in the verifier's data-source catalogue.
pub const GBIF_DATA_SOURCE: u32 = 11;

// ============================================================================
// SYNONYM POLICY
// ============================================================================

/// What to do when every exact candidate the oracle returns is a synonym.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SynonymPolicy {
    /// Take the synonym's classification as-is
    Accept,

    /// Treat the query as unmatched
    Reject,

    /// Re-query using the accepted (current) name
    ResolveToAccepted,
}

impl Default for SynonymPolicy {
    fn default() -> Self {
        SynonymPolicy::Accept
    }
}

// ============================================================================
// GATEWAY SETTINGS
// ============================================================================

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct GatewayConfig {
    /// Container image used when docker is available
    pub image: String,

    /// Local binary used when docker is not available
    pub binary: String,

    /// Try docker before the local binary
    pub prefer_docker: bool,

    /// Parallel verifier jobs (1 keeps output order stable)
    pub jobs: u32,

    pub all_matches: bool,
    pub capitalize: bool,
    pub species_group: bool,
    pub fuzzy_uninomial: bool,
    pub fuzzy_relaxed: bool,

    /// Per-batch timeout in seconds
    pub timeout_secs: u64,
}

impl Default for GatewayConfig {
    fn default() -> Self {
        GatewayConfig {
            image: "gnames/gnverifier:v1.2.3".to_string(),
            binary: "gnverifier".to_string(),
            prefer_docker: true,
            jobs: 1,
            all_matches: true,
            capitalize: true,
            species_group: false,
            fuzzy_uninomial: false,
            fuzzy_relaxed: false,
            timeout_secs: 600,
        }
    }
}

// ============================================================================
// CACHE SETTINGS
// ============================================================================

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CacheConfig {
    /// Root directory; each run namespace lives in a subdirectory
    pub base_dir: PathBuf,

    /// Entries older than this are treated as misses (None = never expire)
    pub max_age_secs: Option<u64>,
}

impl Default for CacheConfig {
    fn default() -> Self {
        CacheConfig {
            base_dir: PathBuf::from(".taxon-resolver-cache"),
            max_age_secs: None,
        }
    }
}

impl CacheConfig {
    pub fn max_age(&self) -> Option<Duration> {
        self.max_age_secs.map(Duration::from_secs)
    }
}

// ============================================================================
// RESOLUTION CONFIG
// ============================================================================

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ResolutionConfig {
    /// Data source every query group starts against
    pub primary_data_source: u32,

    /// Terms per verifier invocation
    pub batch_size: usize,

    /// Upper bound on retry rounds per query group
    pub max_retry_attempts: u32,

    pub synonym_policy: SynonymPolicy,

    /// Name endings that mark a subfamily (e.g. "Diapriinae")
    pub subfamily_suffixes: Vec<String>,

    /// Minimum sequence-similarity ratio for subfamily → family fallback
    pub similarity_cutoff: f64,

    /// Leading characters that must agree for subfamily → family fallback
    pub common_prefix_len: usize,

    /// On NoMatch, retry with the next valid, less specific rank
    pub rank_fallback: bool,

    /// Abort the run when an entry group has no usable query term
    pub fail_on_empty_taxonomy: bool,

    pub gateway: GatewayConfig,
    pub cache: CacheConfig,
}

impl Default for ResolutionConfig {
    fn default() -> Self {
        ResolutionConfig {
            primary_data_source: GBIF_DATA_SOURCE,
            batch_size: 10_000,
            max_retry_attempts: 3,
            synonym_policy: SynonymPolicy::default(),
            subfamily_suffixes: vec!["inae".to_string()],
            similarity_cutoff: 0.5,
            common_prefix_len: 5,
            rank_fallback: false,
            fail_on_empty_taxonomy: false,
            gateway: GatewayConfig::default(),
            cache: CacheConfig::default(),
        }
    }
}

impl ResolutionConfig {
    /// Defaults, then optional JSON file, then `TAXON_*` environment variables.
    pub fn load(path: Option<&Path>) -> Result<Self, ConfigError> {
        let mut config = match path {
            Some(p) => Self::from_file(p)?,
            None => Self::default(),
        };
        config.apply_env_overrides();
        config.validate()?;
        Ok(config)
    }

    /// Load configuration from a JSON file (missing keys fall back to defaults)
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let content = fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.to_path_buf(),
            source,
        })?;

        Self::from_json(&content).map_err(|e| match e {
            ConfigError::Parse { message, .. } => ConfigError::Parse {
                path: path.display().to_string(),
                message,
            },
            other => other,
        })
    }

    pub fn from_json(json: &str) -> Result<Self, ConfigError> {
        serde_json::from_str(json).map_err(|e| ConfigError::Parse {
            path: "<string>".to_string(),
            message: e.to_string(),
        })
    }

    pub fn apply_env_overrides(&mut self) {
        self.apply_overrides_from(|key| std::env::var(key).ok());
    }

    /// Apply overrides from any key lookup (the environment in production).
    /// Unparseable values are ignored with a warning.
    pub fn apply_overrides_from<F>(&mut self, lookup: F)
    where
        F: Fn(&str) -> Option<String>,
    {
        if let Some(dir) = lookup("TAXON_CACHE_DIR") {
            self.cache.base_dir = PathBuf::from(dir);
        }
        if let Some(raw) = lookup("TAXON_CACHE_MAX_AGE") {
            match raw.parse::<u64>() {
                Ok(secs) => self.cache.max_age_secs = Some(secs),
                Err(_) => tracing::warn!("Ignoring TAXON_CACHE_MAX_AGE={:?}: not a number", raw),
            }
        }
        if let Some(raw) = lookup("TAXON_BATCH_SIZE") {
            match raw.parse::<usize>() {
                Ok(size) => self.batch_size = size,
                Err(_) => tracing::warn!("Ignoring TAXON_BATCH_SIZE={:?}: not a number", raw),
            }
        }
        if let Some(raw) = lookup("TAXON_PRIMARY_SOURCE") {
            match raw.parse::<u32>() {
                Ok(id) => self.primary_data_source = id,
                Err(_) => tracing::warn!("Ignoring TAXON_PRIMARY_SOURCE={:?}: not a number", raw),
            }
        }
        if let Some(image) = lookup("TAXON_GNVERIFIER_IMAGE") {
            self.gateway.image = image;
        }
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.batch_size == 0 {
            return Err(ConfigError::Validation {
                field: "batch_size".to_string(),
                message: "must be at least 1".to_string(),
            });
        }
        if !(0.0..=1.0).contains(&self.similarity_cutoff) {
            return Err(ConfigError::Validation {
                field: "similarity_cutoff".to_string(),
                message: "must be between 0.0 and 1.0".to_string(),
            });
        }
        if self.gateway.timeout_secs == 0 {
            return Err(ConfigError::Validation {
                field: "gateway.timeout_secs".to_string(),
                message: "must be at least 1".to_string(),
            });
        }
        Ok(())
    }
}

// ============================================================================
// TESTS
// ============================================================================
