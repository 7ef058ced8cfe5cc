// 🔎 Verification Gateway - Name verification via gnverifier
// One result per submitted term, in order. Anything that goes wrong inside a
// batch degrades to placeholder results so the run can continue.

use crate::attempts::{AttemptDraft, AttemptManager, ResolutionStatus};
use crate::config::GatewayConfig;
use crate::error::GatewayError;
use crate::planner::QueryParameters;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::io::{Read, Write};
use std::process::{Command, Stdio};
use std::thread;
use std::time::{Duration, Instant};
use tracing::{debug, error, info, warn};

// ============================================================================
// VERIFIER OUTPUT TYPES
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum MatchType {
    NoMatch,
    PartialFuzzy,
    PartialExact,
    Fuzzy,
    Exact,
    Virus,
    FacetedSearch,
    #[serde(other)]
    Unknown,
}

/// One candidate record from a data source
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct ResultData {
    pub data_source_id: u32,
    pub data_source_title_short: String,
    pub curation: String,
    pub record_id: String,
    pub matched_name: String,
    pub matched_canonical_simple: String,
    pub current_name: String,
    pub current_canonical_simple: String,
    pub is_synonym: bool,
    pub taxonomic_status: String,
    pub classification_path: Option<String>,
    pub classification_ranks: Option<String>,
    pub match_type: Option<MatchType>,
    pub sort_score: f64,
    pub edit_distance: u32,
}

impl ResultData {
    pub fn is_accepted(&self) -> bool {
        self.taxonomic_status == "Accepted" && !self.is_synonym
    }

    pub fn has_classification(&self) -> bool {
        self.classification_path.is_some() && self.classification_ranks.is_some()
    }
}

/// Verifier response for one submitted name
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct VerificationResult {
    pub name: String,
    pub match_type: Option<MatchType>,
    pub best_result: Option<ResultData>,
    pub results: Vec<ResultData>,
    pub data_sources_num: u32,
    pub curation: String,
    pub error: String,
}

impl VerificationResult {
    /// Stand-in for a term the verifier produced nothing for
    pub fn placeholder() -> Self {
        Self::default()
    }

    pub fn is_placeholder(&self) -> bool {
        self.name.is_empty() && self.match_type.is_none()
    }

    pub fn is_no_match(&self) -> bool {
        self.match_type == Some(MatchType::NoMatch)
    }

    /// Every candidate; falls back to `bestResult` when `results` is empty
    pub fn candidates(&self) -> Vec<&ResultData> {
        if self.results.is_empty() {
            self.best_result.iter().collect()
        } else {
            self.results.iter().collect()
        }
    }
}

/// Parse compact gnverifier output: one JSON object per line.
/// Log lines are skipped, unparseable objects become placeholders, and the
/// list is padded (or cut) to `expected`.
pub fn parse_output(output: &str, expected: usize) -> Vec<VerificationResult> {
    let mut results = Vec::with_capacity(expected);

    for (i, line) in output.lines().enumerate() {
        let line = line.trim();
        if !line.starts_with('{') {
            if !line.is_empty() {
                debug!("Skipping non-JSON line: {}", line);
            }
            continue;
        }
        match serde_json::from_str::<VerificationResult>(line) {
            Ok(result) => results.push(result),
            Err(e) => {
                error!("Failed to parse verifier output line {}: {}", i + 1, e);
                results.push(VerificationResult::placeholder());
            }
        }
    }

    if results.len() != expected {
        warn!("Expected {} results but got {}", expected, results.len());
        results.resize_with(expected, VerificationResult::placeholder);
    }
    results
}

// ============================================================================
// GATEWAY TRAIT
// ============================================================================

pub trait VerificationGateway {
    /// Exactly one result per term, positionally aligned
    fn execute(&self, terms: &[String]) -> Vec<VerificationResult>;
}

// ============================================================================
// GNVERIFIER CLIENT
// ============================================================================

#[derive(Debug, Clone, PartialEq, Eq)]
enum ExecutionMode {
    Docker,
    Local,
}

pub struct GnverifierClient {
    config: GatewayConfig,
    sources: Vec<u32>,
    mode: ExecutionMode,
}

fn command_succeeds(program: &str, args: &[&str]) -> bool {
    Command::new(program)
        .args(args)
        .stdout(Stdio::null())
        .stderr(Stdio::null())
        .status()
        .map(|s| s.success())
        .unwrap_or(false)
}

/// Drain a child pipe. Read failures and invalid UTF-8 are logged; whatever
/// was read is kept (lossily decoded).
fn read_pipe<R: Read>(pipe: Option<R>, name: &str) -> String {
    let Some(mut pipe) = pipe else {
        return String::new();
    };
    let mut bytes = Vec::new();
    if let Err(e) = pipe.read_to_end(&mut bytes) {
        warn!("Failed to read verifier {}: {}", name, e);
    }
    match String::from_utf8(bytes) {
        Ok(text) => text,
        Err(e) => {
            warn!("Verifier {} is not valid UTF-8: {}", name, e.utf8_error());
            String::from_utf8_lossy(e.as_bytes()).into_owned()
        }
    }
}

impl GnverifierClient {
    /// Probe docker (pulling the image if needed), then the local binary.
    /// Neither being available is the one gateway error that stops a run.
    pub fn new(config: &GatewayConfig, sources: Vec<u32>) -> Result<Self, GatewayError> {
        let mode = Self::detect_mode(config)?;
        Ok(GnverifierClient {
            config: config.clone(),
            sources,
            mode,
        })
    }

    fn detect_mode(config: &GatewayConfig) -> Result<ExecutionMode, GatewayError> {
        if config.prefer_docker && command_succeeds("docker", &["--version"]) {
            let image_present = Command::new("docker")
                .args(["images", "-q", config.image.as_str()])
                .output()
                .map(|out| !out.stdout.trim_ascii().is_empty())
                .unwrap_or(false);

            if image_present {
                info!("Using gnverifier via docker image {}", config.image);
                return Ok(ExecutionMode::Docker);
            }

            info!("Pulling docker image {}", config.image);
            if command_succeeds("docker", &["pull", config.image.as_str()]) {
                info!("Pulled gnverifier image {}", config.image);
                return Ok(ExecutionMode::Docker);
            }
            error!("Failed to pull docker image {}", config.image);
        }

        if command_succeeds(&config.binary, &["--version"]) {
            info!("Using local gnverifier binary {}", config.binary);
            return Ok(ExecutionMode::Local);
        }

        Err(GatewayError::Unavailable(format!(
            "neither docker image {} nor local binary {} is usable",
            config.image, config.binary
        )))
    }

    /// gnverifier flags shared by both execution modes
    pub fn verifier_args(&self) -> Vec<String> {
        let mut args = vec![
            "-j".to_string(),
            self.config.jobs.to_string(),
            "--format".to_string(),
            "compact".to_string(),
        ];
        if !self.sources.is_empty() {
            let sources: Vec<String> = self.sources.iter().map(|s| s.to_string()).collect();
            args.push("--sources".to_string());
            args.push(sources.join(","));
        }
        let flags = [
            (self.config.all_matches, "--all_matches"),
            (self.config.capitalize, "--capitalize"),
            (self.config.species_group, "--species_group"),
            (self.config.fuzzy_uninomial, "--fuzzy_uninomial"),
            (self.config.fuzzy_relaxed, "--fuzzy_relaxed"),
        ];
        args.extend(
            flags
                .iter()
                .filter(|(enabled, _)| *enabled)
                .map(|(_, flag)| flag.to_string()),
        );
        args
    }

    fn command(&self) -> Command {
        match self.mode {
            ExecutionMode::Docker => {
                let mut cmd = Command::new("docker");
                cmd.args(["run", "--rm", "-i", self.config.image.as_str()]);
                cmd.args(self.verifier_args());
                cmd
            }
            ExecutionMode::Local => {
                let mut cmd = Command::new(&self.config.binary);
                cmd.args(self.verifier_args());
                cmd
            }
        }
    }

    /// Run one batch with a deadline; the child is killed on timeout
    fn run(&self, input: String) -> Result<String, GatewayError> {
        let mut child = self
            .command()
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .spawn()?;

        let mut stdin = child.stdin.take();
        let writer = thread::spawn(move || {
            if let Some(stdin) = stdin.as_mut() {
                if let Err(e) = stdin.write_all(input.as_bytes()) {
                    warn!("Failed to write terms to verifier: {}", e);
                }
            }
            // Dropping stdin closes the pipe so the verifier sees EOF
        });

        let stdout = child.stdout.take();
        let stdout_reader = thread::spawn(move || read_pipe(stdout, "stdout"));
        let stderr = child.stderr.take();
        let stderr_reader = thread::spawn(move || read_pipe(stderr, "stderr"));

        let deadline = Instant::now() + Duration::from_secs(self.config.timeout_secs);
        let status = loop {
            if let Some(status) = child.try_wait()? {
                break status;
            }
            if Instant::now() >= deadline {
                let _ = child.kill();
                let _ = child.wait();
                return Err(GatewayError::Timeout(self.config.timeout_secs));
            }
            thread::sleep(Duration::from_millis(50));
        };

        let _ = writer.join();
        let stdout = stdout_reader.join().unwrap_or_default();
        let stderr = stderr_reader.join().unwrap_or_default();

        if !status.success() {
            return Err(GatewayError::NonZeroExit {
                code: status.code(),
                stderr: stderr.trim().to_string(),
            });
        }
        Ok(stdout)
    }
}

impl VerificationGateway for GnverifierClient {
    fn execute(&self, terms: &[String]) -> Vec<VerificationResult> {
        if terms.is_empty() {
            return Vec::new();
        }
        match self.run(terms.join("\n")) {
            Ok(output) => parse_output(&output, terms.len()),
            Err(e) => {
                error!("Verifier batch of {} terms failed: {}", terms.len(), e);
                vec![VerificationResult::placeholder(); terms.len()]
            }
        }
    }
}

// ============================================================================
// STATIC GATEWAY
// ============================================================================

/// In-memory gateway answering from a fixed term → result table.
/// Unknown terms get placeholders; used by tests and dry runs.
#[derive(Debug, Clone, Default)]
pub struct StaticGateway {
    responses: HashMap<String, VerificationResult>,
}

impl StaticGateway {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_response(mut self, term: &str, result: VerificationResult) -> Self {
        self.responses.insert(term.to_string(), result);
        self
    }
}

impl VerificationGateway for StaticGateway {
    fn execute(&self, terms: &[String]) -> Vec<VerificationResult> {
        terms
            .iter()
            .map(|term| {
                self.responses
                    .get(term)
                    .cloned()
                    .unwrap_or_else(VerificationResult::placeholder)
            })
            .collect()
    }
}

// ============================================================================
// BATCH EXECUTION
// ============================================================================

/// A query waiting to be sent to the verifier
#[derive(Debug, Clone, PartialEq)]
pub struct PendingQuery {
    pub query_group_key: String,
    pub query: QueryParameters,
}

/// Send queries in batches and record a PROCESSING attempt per query group.
/// Returns the new attempt keys in input order.
pub fn execute_batches(
    gateway: &dyn VerificationGateway,
    queries: &[PendingQuery],
    batch_size: usize,
    manager: &mut AttemptManager,
) -> Vec<String> {
    let batch_size = batch_size.max(1);
    let total_batches = queries.len().div_ceil(batch_size);
    let mut keys = Vec::with_capacity(queries.len());

    for (index, batch) in queries.chunks(batch_size).enumerate() {
        info!(
            "Verifying batch {}/{} ({} terms)",
            index + 1,
            total_batches,
            batch.len()
        );
        let terms: Vec<String> = batch.iter().map(|q| q.query.term.clone()).collect();
        let results = gateway.execute(&terms);

        // A gateway that breaks the one-per-term contract gets placeholders
        let results = if results.len() == batch.len() {
            results
        } else {
            error!(
                "Gateway returned {} results for {} terms",
                results.len(),
                batch.len()
            );
            vec![VerificationResult::placeholder(); batch.len()]
        };

        for (pending, result) in batch.iter().zip(results) {
            let mut draft = AttemptDraft::new(
                pending.query_group_key.clone(),
                pending.query.clone(),
                ResolutionStatus::Processing,
            )
            .with_metadata("created_at", chrono::Utc::now().to_rfc3339())
            .with_metadata("data_source_id", pending.query.data_source_id);

            if result.is_placeholder() {
                draft = draft.with_metadata("error", "no verification result");
            } else {
                draft = draft.with_result(result);
            }

            keys.push(manager.create_attempt(draft).key.clone());
        }
    }

    keys
}

// ============================================================================
// TESTS
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::entry::Rank;

    const CANIS_LINE: &str = r#"{"id":"1","name":"Canis lupus","matchType":"Exact","results":[{"dataSourceId":11,"dataSourceTitleShort":"GBIF Backbone Taxonomy","curation":"Curated","matchedName":"Canis lupus Linnaeus, 1758","matchedCanonicalSimple":"Canis lupus","currentName":"Canis lupus Linnaeus, 1758","currentCanonicalSimple":"Canis lupus","isSynonym":false,"taxonomicStatus":"Accepted","classificationPath":"Animalia|Chordata|Mammalia|Carnivora|Canidae|Canis|Canis lupus","classificationRanks":"kingdom|phylum|class|order|family|genus|species","matchType":"Exact","sortScore":9.5,"editDistance":0}],"dataSourcesNum":1,"curation":"Curated","error":""}"#;

    #[test]
    fn test_read_pipe_keeps_invalid_utf8_output() {
        let mut bytes = CANIS_LINE.as_bytes().to_vec();
        bytes.extend_from_slice(b"\n\xff\xfe\n");

        let text = read_pipe(Some(bytes.as_slice()), "stdout");
        let results = parse_output(&text, 1);
        assert_eq!(results[0].name, "Canis lupus");

        assert_eq!(read_pipe(None::<&[u8]>, "stderr"), "");
    }

    #[test]
    fn test_parse_compact_line() {
        let results = parse_output(CANIS_LINE, 1);
        assert_eq!(results.len(), 1);

        let result = &results[0];
        assert_eq!(result.name, "Canis lupus");
        assert_eq!(result.match_type, Some(MatchType::Exact));
        assert_eq!(result.results.len(), 1);
        assert_eq!(result.results[0].data_source_id, 11);
        assert!(result.results[0].is_accepted());
        assert!(result.results[0].has_classification());
        assert!(!result.is_placeholder());
    }

    #[test]
    fn test_parse_skips_log_lines_and_pads() {
        let output = format!(
            "2025/01/01 10:00:00 INFO starting\n{}\n{{not json}}\n",
            CANIS_LINE
        );
        let results = parse_output(&output, 3);

        assert_eq!(results.len(), 3);
        assert_eq!(results[0].name, "Canis lupus");
        assert!(results[1].is_placeholder());
        assert!(results[2].is_placeholder());
    }

    #[test]
    fn test_unknown_match_type() {
        let results = parse_output(r#"{"name":"X","matchType":"SomethingNew"}"#, 1);
        assert_eq!(results[0].match_type, Some(MatchType::Unknown));
    }

    #[test]
    fn test_verifier_args() {
        let client = GnverifierClient {
            config: GatewayConfig {
                fuzzy_relaxed: true,
                ..GatewayConfig::default()
            },
            sources: vec![11],
            mode: ExecutionMode::Local,
        };
        let args = client.verifier_args();
        assert_eq!(
            args,
            vec![
                "-j",
                "1",
                "--format",
                "compact",
                "--sources",
                "11",
                "--all_matches",
                "--capitalize",
                "--fuzzy_relaxed"
            ]
        );
    }

    #[test]
    fn test_unavailable_gateway_is_error() {
        let config = GatewayConfig {
            prefer_docker: false,
            binary: "definitely-not-a-real-gnverifier-binary".to_string(),
            ..GatewayConfig::default()
        };
        let result = GnverifierClient::new(&config, vec![11]);
        assert!(matches!(result, Err(GatewayError::Unavailable(_))));
    }

    #[test]
    fn test_execute_batches_records_processing_attempts() {
        let canis = parse_output(CANIS_LINE, 1).remove(0);
        let gateway = StaticGateway::new().with_response("Canis lupus", canis);

        let queries: Vec<PendingQuery> = ["Canis lupus", "Felis", "Ursus"]
            .iter()
            .enumerate()
            .map(|(i, term)| PendingQuery {
                query_group_key: format!("g{}", i),
                query: QueryParameters {
                    term: term.to_string(),
                    rank: Rank::Species,
                    data_source_id: 11,
                },
            })
            .collect();

        let mut manager = AttemptManager::new();
        let keys = execute_batches(&gateway, &queries, 2, &mut manager);
        assert_eq!(keys.len(), 3);

        let first = manager.get_attempt(&keys[0]).unwrap();
        assert_eq!(first.status, ResolutionStatus::Processing);
        assert_eq!(first.query_group_key, "g0");
        assert!(first.raw_result.is_some());
        assert_eq!(first.metadata.get("data_source_id"), Some(&serde_json::json!(11)));
        assert!(first.metadata.contains_key("created_at"));

        let missing = manager.get_attempt(&keys[1]).unwrap();
        assert!(missing.raw_result.is_none());
        assert_eq!(missing.metadata_str("error"), Some("no verification result"));
    }
}
