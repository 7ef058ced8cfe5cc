// 💾 Content-Addressed Cache - Re-entrant runs without recomputation
// Values live in a SQLite file per namespace. An entry is served only when
// its checksum matches and it is younger than the configured max age.

use crate::error::CacheError;
use chrono::{DateTime, Utc};
use rusqlite::{params, Connection, OptionalExtension};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::collections::BTreeMap;
use std::fs::{self, File};
use std::io::Read;
use std::path::{Path, PathBuf};
use std::sync::{Mutex, MutexGuard};
use std::time::{Duration, Instant, UNIX_EPOCH};
use tracing::{debug, info, warn};
use walkdir::WalkDir;

/// Bumped when the stored layout changes; older entries become misses
pub const SCHEMA_VERSION: i64 = 1;

const STORE_FILE: &str = "cache.sqlite";

// ============================================================================
// CHECKSUMS
// ============================================================================

fn sha256_hex(data: &[u8]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(data);
    format!("{:x}", hasher.finalize())
}

/// Every regular file under `path` (or `path` itself), sorted
pub fn expand_paths(path: &Path) -> Vec<PathBuf> {
    if path.is_file() {
        return vec![path.to_path_buf()];
    }
    let mut files: Vec<PathBuf> = WalkDir::new(path)
        .into_iter()
        .filter_map(|entry| entry.ok())
        .filter(|entry| entry.file_type().is_file())
        .map(|entry| entry.into_path())
        .collect();
    files.sort();
    files
}

/// SHA-256 over the contents of every file, in sorted path order.
/// Unreadable files are skipped with a warning. Empty input gives "".
pub fn compute_checksum(paths: &[PathBuf]) -> String {
    if paths.is_empty() {
        return String::new();
    }

    let mut sorted = paths.to_vec();
    sorted.sort();

    let mut hasher = Sha256::new();
    let mut buffer = [0u8; 8192];
    for path in &sorted {
        let mut file = match File::open(path) {
            Ok(f) => f,
            Err(e) => {
                warn!("Could not include {:?} in checksum: {}", path, e);
                continue;
            }
        };
        loop {
            match file.read(&mut buffer) {
                Ok(0) => break,
                Ok(n) => hasher.update(&buffer[..n]),
                Err(e) => {
                    warn!("Error reading {:?} for checksum: {}", path, e);
                    break;
                }
            }
        }
    }
    format!("{:x}", hasher.finalize())
}

/// SHA-256 over (path, size, mtime in ns) of every file; cheap input fingerprint
pub fn compute_file_metadata_hash(paths: &[PathBuf]) -> String {
    if paths.is_empty() {
        return String::new();
    }

    let mut sorted = paths.to_vec();
    sorted.sort();

    let mut hasher = Sha256::new();
    for path in &sorted {
        let meta = match fs::metadata(path) {
            Ok(m) => m,
            Err(e) => {
                warn!("Could not stat {:?} for fingerprint: {}", path, e);
                continue;
            }
        };
        let mtime_ns = meta
            .modified()
            .ok()
            .and_then(|t| t.duration_since(UNIX_EPOCH).ok())
            .map_or(0, |d| d.as_nanos());
        hasher.update(path.to_string_lossy().as_bytes());
        hasher.update(meta.len().to_string().as_bytes());
        hasher.update(mtime_ns.to_string().as_bytes());
    }
    format!("{:x}", hasher.finalize())
}

// ============================================================================
// STATS
// ============================================================================

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct CacheStats {
    pub namespace: PathBuf,
    pub total_size_bytes: u64,
    pub db_file_count: usize,
    pub entry_count: usize,

    /// Entries per cached-function prefix
    pub prefix_counts: BTreeMap<String, usize>,
}

/// Prefix of a `{prefix}_{argument digest}` key
fn key_prefix(key: &str) -> &str {
    match key.rsplit_once('_') {
        Some((prefix, digest)) if digest.len() == ARG_DIGEST_LEN => prefix,
        _ => key,
    }
}

// ============================================================================
// CACHE CLIENT
// ============================================================================

struct CacheState {
    /// Directory the next operation should use
    target: PathBuf,

    /// Open connection and the directory it belongs to
    open: Option<(PathBuf, Connection)>,
}

/// Owns the single SQLite connection; reopened only when the namespace moves
pub struct CacheClient {
    base_dir: PathBuf,
    state: Mutex<CacheState>,
}

fn setup_store(conn: &Connection) -> Result<(), CacheError> {
    conn.pragma_update(None, "journal_mode", "WAL")?;
    conn.execute(
        "CREATE TABLE IF NOT EXISTS cache_entries (
            key TEXT PRIMARY KEY,
            value TEXT NOT NULL,
            checksum TEXT NOT NULL,
            created_at TEXT NOT NULL,
            schema_version INTEGER NOT NULL,
            metadata TEXT
        )",
        [],
    )?;
    Ok(())
}

impl CacheClient {
    pub fn new(base_dir: impl Into<PathBuf>) -> Self {
        let base_dir = base_dir.into();
        CacheClient {
            state: Mutex::new(CacheState {
                target: base_dir.clone(),
                open: None,
            }),
            base_dir,
        }
    }

    fn lock(&self) -> MutexGuard<'_, CacheState> {
        self.state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    pub fn base_dir(&self) -> &Path {
        &self.base_dir
    }

    /// Directory the cache currently reads and writes
    pub fn directory(&self) -> PathBuf {
        self.lock().target.clone()
    }

    /// Point the cache at `base_dir/namespace`
    pub fn set_namespace(&self, namespace: &str) -> PathBuf {
        let target = self.base_dir.join(namespace);
        let mut state = self.lock();
        if state.target != target {
            debug!("Cache namespace -> {:?}", target);
            state.target = target.clone();
        }
        target
    }

    /// Namespace `{command}_v{version}_{fingerprint[..16]}` from the input files
    pub fn configure_namespace(&self, command: &str, version: &str, files: &[PathBuf]) -> PathBuf {
        let fingerprint = compute_file_metadata_hash(files);
        let suffix = if fingerprint.is_empty() {
            "default"
        } else {
            &fingerprint[..16]
        };
        let namespace = format!("{}_v{}_{}", command, version, suffix);
        let dir = self.set_namespace(&namespace);
        info!("Using cache namespace {:?}", dir);
        dir
    }

    /// Run `f` on a connection for the current target, opening it if needed
    fn with_connection<T>(
        &self,
        f: impl FnOnce(&Connection) -> Result<T, CacheError>,
    ) -> Result<T, CacheError> {
        let mut state = self.lock();
        let target = state.target.clone();

        let stale = match &state.open {
            Some((dir, _)) => *dir != target,
            None => true,
        };
        if stale {
            // Drop the old connection before opening the new one
            state.open = None;
            fs::create_dir_all(&target)?;
            let conn = Connection::open(target.join(STORE_FILE))?;
            setup_store(&conn)?;
            debug!("Opened cache store in {:?}", target);
            state.open = Some((target, conn));
        }

        match &state.open {
            Some((_, conn)) => f(conn),
            None => Err(CacheError::Store(rusqlite::Error::InvalidQuery)),
        }
    }

    // ========================================================================
    // SAVE / LOAD
    // ========================================================================

    pub fn save_cache<T: Serialize>(&self, key: &str, value: &T, checksum: &str) -> Result<(), CacheError> {
        self.save_cache_with_metadata(key, value, checksum, serde_json::Value::Null)
    }

    /// Store value and metadata in one row, replacing any previous entry
    pub fn save_cache_with_metadata<T: Serialize>(
        &self,
        key: &str,
        value: &T,
        checksum: &str,
        metadata: serde_json::Value,
    ) -> Result<(), CacheError> {
        let value = serde_json::to_string(value)?;
        let metadata = serde_json::to_string(&metadata)?;
        let created_at = Utc::now().to_rfc3339();

        self.with_connection(|conn| {
            conn.execute(
                "INSERT OR REPLACE INTO cache_entries
                    (key, value, checksum, created_at, schema_version, metadata)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
                params![key, value, checksum, created_at, SCHEMA_VERSION, metadata],
            )?;
            Ok(())
        })?;
        debug!("Saved cache entry {}", key);
        Ok(())
    }

    /// Stored value if checksum and age allow; every problem is a logged miss
    pub fn load_cache<T: DeserializeOwned>(
        &self,
        key: &str,
        checksum: &str,
        max_age: Option<Duration>,
    ) -> Option<T> {
        match self.try_load(key, checksum, max_age) {
            Ok(value) => value,
            Err(e) => {
                warn!("Cache read failed for {}: {}", key, e);
                None
            }
        }
    }

    fn try_load<T: DeserializeOwned>(
        &self,
        key: &str,
        checksum: &str,
        max_age: Option<Duration>,
    ) -> Result<Option<T>, CacheError> {
        let row: Option<(String, String, String, i64)> = self.with_connection(|conn| {
            Ok(conn
                .query_row(
                    "SELECT value, checksum, created_at, schema_version
                     FROM cache_entries WHERE key = ?1",
                    params![key],
                    |row| Ok((row.get(0)?, row.get(1)?, row.get(2)?, row.get(3)?)),
                )
                .optional()?)
        })?;

        let Some((value, stored_checksum, created_at, schema_version)) = row else {
            debug!("Cache miss (not found): {}", key);
            return Ok(None);
        };

        if schema_version != SCHEMA_VERSION {
            debug!("Cache miss (schema v{}): {}", schema_version, key);
            return Ok(None);
        }
        if stored_checksum != checksum {
            debug!("Cache miss (checksum mismatch): {}", key);
            return Ok(None);
        }
        if let Some(max_age) = max_age {
            let created = DateTime::parse_from_rfc3339(&created_at)
                .map_err(|e| CacheError::Timestamp(format!("{}: {}", created_at, e)))?
                .with_timezone(&Utc);
            let age = (Utc::now() - created).to_std().unwrap_or(Duration::ZERO);
            if age > max_age {
                debug!("Cache miss (expired after {:.1}s): {}", age.as_secs_f64(), key);
                return Ok(None);
            }
        }

        debug!("Cache hit: {}", key);
        Ok(Some(serde_json::from_str(&value)?))
    }

    // ========================================================================
    // MAINTENANCE
    // ========================================================================

    /// Remove entries whose key contains `pattern` (all entries when None)
    pub fn clear_cache(&self, pattern: Option<&str>) -> Result<usize, CacheError> {
        let removed = self.with_connection(|conn| {
            let n = match pattern {
                Some(p) => conn.execute(
                    "DELETE FROM cache_entries WHERE instr(key, ?1) > 0",
                    params![p],
                )?,
                None => conn.execute("DELETE FROM cache_entries", [])?,
            };
            Ok(n)
        })?;
        info!(
            "Cleared {} cache entries{}",
            removed,
            pattern.map(|p| format!(" matching '{}'", p)).unwrap_or_default()
        );
        Ok(removed)
    }

    /// Remove the entries of one cached function
    pub fn clear_prefix(&self, prefix: &str) -> Result<usize, CacheError> {
        let keys: Vec<String> = self.with_connection(|conn| {
            let mut stmt = conn.prepare("SELECT key FROM cache_entries")?;
            let keys = stmt
                .query_map([], |row| row.get::<_, String>(0))?
                .collect::<Result<Vec<_>, _>>()?;
            Ok(keys)
        })?;

        let doomed: Vec<&String> = keys.iter().filter(|k| key_prefix(k) == prefix).collect();
        self.with_connection(|conn| {
            for key in &doomed {
                conn.execute("DELETE FROM cache_entries WHERE key = ?1", params![key])?;
            }
            Ok(())
        })?;
        info!("Cleared {} cache entries for {}", doomed.len(), prefix);
        Ok(doomed.len())
    }

    pub fn cache_stats(&self) -> Result<CacheStats, CacheError> {
        let keys: Vec<String> = self.with_connection(|conn| {
            let mut stmt = conn.prepare("SELECT key FROM cache_entries")?;
            let keys = stmt
                .query_map([], |row| row.get::<_, String>(0))?
                .collect::<Result<Vec<_>, _>>()?;
            Ok(keys)
        })?;

        let namespace = self.directory();
        let mut stats = CacheStats {
            namespace: namespace.clone(),
            entry_count: keys.len(),
            ..CacheStats::default()
        };
        for file in expand_paths(&namespace) {
            stats.db_file_count += 1;
            stats.total_size_bytes += fs::metadata(&file).map(|m| m.len()).unwrap_or(0);
        }
        for key in &keys {
            *stats.prefix_counts.entry(key_prefix(key).to_string()).or_insert(0) += 1;
        }
        Ok(stats)
    }
}

// ============================================================================
// CACHED FUNCTIONS
// ============================================================================

/// Hex characters of the argument digest kept in keys
const ARG_DIGEST_LEN: usize = 32;

/// One argument of a cached computation
#[derive(Debug, Clone)]
pub enum CacheArg {
    /// Part of the key as-is
    Value(serde_json::Value),

    /// Key holds `__PATH__:<basename>`; file contents drive the checksum
    Path(PathBuf),
}

/// A pure computation whose result is cached under `{prefix}_{args digest}`
#[derive(Debug, Clone)]
pub struct CachedFn {
    pub prefix: String,
    pub max_age: Option<Duration>,
}

impl CachedFn {
    pub fn new(prefix: &str) -> Self {
        CachedFn {
            prefix: prefix.to_string(),
            max_age: None,
        }
    }

    pub fn with_max_age(mut self, max_age: Option<Duration>) -> Self {
        self.max_age = max_age;
        self
    }

    /// (cache key, checksum) for a set of named arguments
    pub fn key_and_checksum(&self, args: &[(&str, CacheArg)]) -> (String, String) {
        if args.is_empty() {
            return (self.prefix.clone(), sha256_hex(self.prefix.as_bytes()));
        }

        let mut named: BTreeMap<&str, serde_json::Value> = BTreeMap::new();
        let mut files = Vec::new();
        for (name, arg) in args {
            let value = match arg {
                CacheArg::Value(v) => v.clone(),
                CacheArg::Path(p) if p.exists() => {
                    files.extend(expand_paths(p));
                    let base = p
                        .file_name()
                        .map(|n| n.to_string_lossy().into_owned())
                        .unwrap_or_default();
                    serde_json::Value::String(format!("__PATH__:{}", base))
                }
                CacheArg::Path(p) => serde_json::Value::String(p.display().to_string()),
            };
            named.insert(*name, value);
        }

        let arg_repr = serde_json::Value::Object(
            named
                .into_iter()
                .map(|(k, v)| (k.to_string(), v))
                .collect(),
        )
        .to_string();
        let digest = sha256_hex(arg_repr.as_bytes());
        let key = format!("{}_{}", self.prefix, &digest[..ARG_DIGEST_LEN]);

        // Without files the arguments themselves are the content
        let checksum = if files.is_empty() {
            digest
        } else {
            compute_checksum(&files)
        };
        (key, checksum)
    }

    /// Cached value when valid, otherwise run `compute` and store its result
    pub fn call<T, F>(
        &self,
        client: &CacheClient,
        args: &[(&str, CacheArg)],
        refresh: bool,
        compute: F,
    ) -> anyhow::Result<T>
    where
        T: Serialize + DeserializeOwned,
        F: FnOnce() -> anyhow::Result<T>,
    {
        let (key, checksum) = self.key_and_checksum(args);

        if !refresh {
            if let Some(value) = client.load_cache(&key, &checksum, self.max_age) {
                info!("Using cached {}", self.prefix);
                return Ok(value);
            }
        }

        let start = Instant::now();
        let value = compute()?;
        let elapsed = start.elapsed().as_secs_f64();

        let metadata = serde_json::json!({
            "function": self.prefix,
            "execution_time": elapsed,
        });
        match client.save_cache_with_metadata(&key, &value, &checksum, metadata) {
            Ok(()) => debug!("Cached {} (took {:.2}s)", self.prefix, elapsed),
            Err(e) => warn!("Failed to cache {}: {}", self.prefix, e),
        }
        Ok(value)
    }

    pub fn clear(&self, client: &CacheClient) -> Result<usize, CacheError> {
        client.clear_prefix(&self.prefix)
    }
}

// ============================================================================
// TESTS
// ============================================================================
