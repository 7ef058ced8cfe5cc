// 🔗 Resolution Attempt Chains - Insert-only history per query group
// Every decision becomes a new attempt linked to the group's previous head.
// Attempts are never mutated; the head pointer is the only thing that moves.

use crate::planner::QueryParameters;
use crate::verification::VerificationResult;
use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::collections::{BTreeMap, HashMap, HashSet};
use std::fs;
use std::path::Path;
use tracing::{debug, info, warn};

// ============================================================================
// RESOLUTION STATUS
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ResolutionStatus {
    /// Raw verifier response recorded, no strategy applied yet
    Processing,

    // Success
    ExactMatch,
    SingularExactMatch,
    ForceAccepted,

    // Failure
    NoMatch,
    EmptyInputTaxonomy,
    Failed,
    InvalidInput,

    // Retry
    RetryScheduled,
    NoMatchNonemptyQuery,

    // Disambiguation
    MultipleExactMatches,
}

impl ResolutionStatus {
    pub const ALL: [ResolutionStatus; 11] = [
        ResolutionStatus::Processing,
        ResolutionStatus::ExactMatch,
        ResolutionStatus::SingularExactMatch,
        ResolutionStatus::ForceAccepted,
        ResolutionStatus::NoMatch,
        ResolutionStatus::EmptyInputTaxonomy,
        ResolutionStatus::Failed,
        ResolutionStatus::InvalidInput,
        ResolutionStatus::RetryScheduled,
        ResolutionStatus::NoMatchNonemptyQuery,
        ResolutionStatus::MultipleExactMatches,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            ResolutionStatus::Processing => "PROCESSING",
            ResolutionStatus::ExactMatch => "EXACT_MATCH",
            ResolutionStatus::SingularExactMatch => "SINGULAR_EXACT_MATCH",
            ResolutionStatus::ForceAccepted => "FORCE_ACCEPTED",
            ResolutionStatus::NoMatch => "NO_MATCH",
            ResolutionStatus::EmptyInputTaxonomy => "EMPTY_INPUT_TAXONOMY",
            ResolutionStatus::Failed => "FAILED",
            ResolutionStatus::InvalidInput => "INVALID_INPUT",
            ResolutionStatus::RetryScheduled => "RETRY_SCHEDULED",
            ResolutionStatus::NoMatchNonemptyQuery => "NO_MATCH_NONEMPTY_QUERY",
            ResolutionStatus::MultipleExactMatches => "MULTIPLE_EXACT_MATCHES",
        }
    }

    pub fn is_successful(&self) -> bool {
        matches!(
            self,
            ResolutionStatus::ExactMatch
                | ResolutionStatus::SingularExactMatch
                | ResolutionStatus::ForceAccepted
        )
    }

    pub fn is_failure(&self) -> bool {
        matches!(
            self,
            ResolutionStatus::NoMatch
                | ResolutionStatus::EmptyInputTaxonomy
                | ResolutionStatus::Failed
                | ResolutionStatus::InvalidInput
        )
    }

    pub fn is_terminal(&self) -> bool {
        self.is_successful() || self.is_failure()
    }

    pub fn needs_retry(&self) -> bool {
        matches!(
            self,
            ResolutionStatus::RetryScheduled | ResolutionStatus::NoMatchNonemptyQuery
        )
    }

    pub fn needs_disambiguation(&self) -> bool {
        matches!(self, ResolutionStatus::MultipleExactMatches)
    }
}

impl std::fmt::Display for ResolutionStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

// ============================================================================
// RESOLUTION ATTEMPT
// ============================================================================

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ResolutionAttempt {
    /// Content hash; see `attempt_key`
    pub key: String,

    /// Query group this attempt belongs to (entry-group key for EMPTY_INPUT_TAXONOMY)
    pub query_group_key: String,

    /// Query that produced `raw_result`
    pub query: QueryParameters,

    pub status: ResolutionStatus,

    pub raw_result: Option<VerificationResult>,

    /// Rank field name → canonical name
    pub resolved_classification: Option<BTreeMap<String, String>>,

    /// Parameters for the next query (retry statuses only)
    pub scheduled_query: Option<QueryParameters>,

    /// Strategy that produced this attempt (None for executor/resolver records)
    pub strategy: Option<String>,

    pub metadata: BTreeMap<String, serde_json::Value>,

    pub previous_key: Option<String>,

    /// Not part of the key
    pub created_at: DateTime<Utc>,
}

impl ResolutionAttempt {
    pub fn metadata_str(&self, field: &str) -> Option<&str> {
        self.metadata.get(field).and_then(|v| v.as_str())
    }

    pub fn is_retry(&self) -> bool {
        self.previous_key.is_some()
    }
}

/// Everything needed to create an attempt except its key and predecessor
#[derive(Debug, Clone, PartialEq)]
pub struct AttemptDraft {
    pub query_group_key: String,
    pub query: QueryParameters,
    pub status: ResolutionStatus,
    pub raw_result: Option<VerificationResult>,
    pub resolved_classification: Option<BTreeMap<String, String>>,
    pub scheduled_query: Option<QueryParameters>,
    pub strategy: Option<String>,
    pub metadata: BTreeMap<String, serde_json::Value>,
}

impl AttemptDraft {
    pub fn new(query_group_key: impl Into<String>, query: QueryParameters, status: ResolutionStatus) -> Self {
        AttemptDraft {
            query_group_key: query_group_key.into(),
            query,
            status,
            raw_result: None,
            resolved_classification: None,
            scheduled_query: None,
            strategy: None,
            metadata: BTreeMap::new(),
        }
    }

    /// Successor of `attempt` with the same query and verifier response
    pub fn follow(attempt: &ResolutionAttempt, status: ResolutionStatus) -> Self {
        AttemptDraft {
            raw_result: attempt.raw_result.clone(),
            ..AttemptDraft::new(attempt.query_group_key.clone(), attempt.query.clone(), status)
        }
    }

    pub fn with_result(mut self, result: VerificationResult) -> Self {
        self.raw_result = Some(result);
        self
    }

    pub fn with_classification(mut self, classification: BTreeMap<String, String>) -> Self {
        self.resolved_classification = Some(classification);
        self
    }

    pub fn with_scheduled_query(mut self, query: QueryParameters) -> Self {
        self.scheduled_query = Some(query);
        self
    }

    pub fn with_strategy(mut self, name: &str) -> Self {
        self.strategy = Some(name.to_string());
        self
    }

    pub fn with_metadata(mut self, field: &str, value: impl Into<serde_json::Value>) -> Self {
        self.metadata.insert(field.to_string(), value.into());
        self
    }
}

/// SHA-256 over group, query, status, serialized result and predecessor
pub fn attempt_key(draft: &AttemptDraft, previous_key: Option<&str>) -> String {
    let mut hasher = Sha256::new();
    hasher.update(draft.query_group_key.as_bytes());
    hasher.update(b"|");
    hasher.update(draft.query.term.as_bytes());
    hasher.update(b"|");
    hasher.update(draft.query.rank.as_str().as_bytes());
    hasher.update(b"|");
    hasher.update(draft.query.data_source_id.to_string().as_bytes());
    hasher.update(b"|");
    hasher.update(draft.status.as_str().as_bytes());
    hasher.update(b"|");
    // Serializing plain data with ordered maps does not fail
    let result = serde_json::to_string(&draft.raw_result).unwrap_or_default();
    hasher.update(result.as_bytes());
    hasher.update(b"|");
    hasher.update(previous_key.unwrap_or("").as_bytes());
    format!("{:x}", hasher.finalize())
}

// ============================================================================
// STATISTICS
// ============================================================================

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct AttemptStatistics {
    pub total_attempts: usize,
    pub total_query_groups: usize,

    /// Attempts with a predecessor
    pub retry_attempts: usize,

    /// Every attempt, by status
    pub status_counts: BTreeMap<String, usize>,

    /// Latest attempt per group, by status
    pub final_status_counts: BTreeMap<String, usize>,
}

// ============================================================================
// ATTEMPT MANAGER
// ============================================================================

#[derive(Debug, Default, Serialize, Deserialize)]
struct AttemptState {
    attempts: Vec<ResolutionAttempt>,
    heads: BTreeMap<String, String>,
}

/// Arena of attempts plus a head pointer per query group
#[derive(Debug, Default)]
pub struct AttemptManager {
    attempts: HashMap<String, ResolutionAttempt>,

    /// Insertion order, for stable iteration
    order: Vec<String>,

    /// Query group key → latest attempt key
    heads: HashMap<String, String>,
}

impl AttemptManager {
    pub fn new() -> Self {
        Self::default()
    }

    /// Store a new attempt after the group's current head and advance the head
    pub fn create_attempt(&mut self, draft: AttemptDraft) -> &ResolutionAttempt {
        let previous_key = self.heads.get(&draft.query_group_key).cloned();
        let key = attempt_key(&draft, previous_key.as_deref());

        if self.attempts.contains_key(&key) {
            debug!("Attempt {} already recorded, reusing", &key[..12]);
        } else {
            debug!(
                "Attempt {} for group {}: {} ({})",
                &key[..12],
                &draft.query_group_key[..draft.query_group_key.len().min(12)],
                draft.status,
                draft.strategy.as_deref().unwrap_or("-")
            );
            let attempt = ResolutionAttempt {
                key: key.clone(),
                query_group_key: draft.query_group_key,
                query: draft.query,
                status: draft.status,
                raw_result: draft.raw_result,
                resolved_classification: draft.resolved_classification,
                scheduled_query: draft.scheduled_query,
                strategy: draft.strategy,
                metadata: draft.metadata,
                previous_key,
                created_at: Utc::now(),
            };
            self.order.push(key.clone());
            self.attempts.insert(key.clone(), attempt);
        }

        let attempt = &self.attempts[&key];
        self.heads
            .insert(attempt.query_group_key.clone(), key.clone());
        attempt
    }

    pub fn get_attempt(&self, key: &str) -> Option<&ResolutionAttempt> {
        self.attempts.get(key)
    }

    pub fn latest_attempt(&self, query_group_key: &str) -> Option<&ResolutionAttempt> {
        self.heads
            .get(query_group_key)
            .and_then(|key| self.attempts.get(key))
    }

    /// Ancestry of `key`, oldest first. Truncates at a missing predecessor.
    pub fn attempt_chain(&self, key: &str) -> Vec<&ResolutionAttempt> {
        let mut chain = Vec::new();
        let mut visited = HashSet::new();
        let mut current = Some(key);

        while let Some(k) = current {
            if !visited.insert(k) {
                warn!("Attempt chain revisits {}, stopping", k);
                break;
            }
            match self.attempts.get(k) {
                Some(attempt) => {
                    chain.push(attempt);
                    current = attempt.previous_key.as_deref();
                }
                None => break,
            }
        }

        chain.reverse();
        chain
    }

    pub fn group_chain(&self, query_group_key: &str) -> Vec<&ResolutionAttempt> {
        match self.heads.get(query_group_key) {
            Some(head) => self.attempt_chain(head),
            None => Vec::new(),
        }
    }

    /// Attempts in this group's chain after the first one
    pub fn retry_count(&self, query_group_key: &str) -> usize {
        self.group_chain(query_group_key)
            .iter()
            .filter(|a| a.status == ResolutionStatus::Processing)
            .count()
            .saturating_sub(1)
    }

    /// Groups whose latest attempt asks for another query, sorted
    pub fn groups_needing_retry(&self) -> Vec<String> {
        let mut groups: Vec<String> = self
            .heads
            .iter()
            .filter(|(_, key)| {
                self.attempts
                    .get(*key)
                    .map_or(false, |a| a.status.needs_retry())
            })
            .map(|(group, _)| group.clone())
            .collect();
        groups.sort();
        groups
    }

    pub fn successful_attempts(&self) -> Vec<&ResolutionAttempt> {
        self.iter().filter(|a| a.status.is_successful()).collect()
    }

    /// All attempts in creation order
    pub fn iter(&self) -> impl Iterator<Item = &ResolutionAttempt> {
        self.order.iter().filter_map(|key| self.attempts.get(key))
    }

    pub fn group_keys(&self) -> impl Iterator<Item = &String> {
        self.heads.keys()
    }

    pub fn len(&self) -> usize {
        self.attempts.len()
    }

    pub fn is_empty(&self) -> bool {
        self.attempts.is_empty()
    }

    pub fn statistics(&self) -> AttemptStatistics {
        let mut stats = AttemptStatistics {
            total_attempts: self.attempts.len(),
            total_query_groups: self.heads.len(),
            ..AttemptStatistics::default()
        };

        for attempt in self.iter() {
            if attempt.is_retry() {
                stats.retry_attempts += 1;
            }
            *stats
                .status_counts
                .entry(attempt.status.as_str().to_string())
                .or_insert(0) += 1;
        }

        for key in self.heads.values() {
            if let Some(attempt) = self.attempts.get(key) {
                *stats
                    .final_status_counts
                    .entry(attempt.status.as_str().to_string())
                    .or_insert(0) += 1;
            }
        }

        stats
    }

    // ========================================================================
    // PERSISTENCE
    // ========================================================================

    /// Write every attempt plus head pointers as JSON
    pub fn save_state(&self, path: &Path) -> Result<()> {
        let state = AttemptState {
            attempts: self.iter().cloned().collect(),
            heads: self
                .heads
                .iter()
                .map(|(k, v)| (k.clone(), v.clone()))
                .collect(),
        };
        let json = serde_json::to_string_pretty(&state).context("Failed to serialize attempt state")?;
        fs::write(path, json).with_context(|| format!("Failed to write attempt state to {:?}", path))?;
        info!("Saved {} attempts to {:?}", state.attempts.len(), path);
        Ok(())
    }

    pub fn load_state(path: &Path) -> Result<Self> {
        let json = fs::read_to_string(path)
            .with_context(|| format!("Failed to read attempt state from {:?}", path))?;
        let state: AttemptState =
            serde_json::from_str(&json).context("Failed to parse attempt state")?;

        let mut manager = AttemptManager::new();
        for attempt in state.attempts {
            manager.order.push(attempt.key.clone());
            manager.attempts.insert(attempt.key.clone(), attempt);
        }
        for (group, head) in state.heads {
            if manager.attempts.contains_key(&head) {
                manager.heads.insert(group, head);
            } else {
                warn!("Dropping head for group {}: attempt {} not in state", group, head);
            }
        }
        info!("Loaded {} attempts from {:?}", manager.len(), path);
        Ok(manager)
    }
}

// ============================================================================
// TESTS
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::entry::Rank;

    fn create_test_query(term: &str) -> QueryParameters {
        QueryParameters {
            term: term.to_string(),
            rank: Rank::Species,
            data_source_id: 11,
        }
    }

    fn create_test_draft(group: &str, status: ResolutionStatus) -> AttemptDraft {
        AttemptDraft::new(group, create_test_query("Canis lupus"), status)
    }

    #[test]
    fn test_status_tags() {
        for status in ResolutionStatus::ALL {
            // No status is both success and failure
            assert!(!(status.is_successful() && status.is_failure()));
        }
        assert!(ResolutionStatus::ExactMatch.is_terminal());
        assert!(ResolutionStatus::EmptyInputTaxonomy.is_failure());
        assert!(ResolutionStatus::NoMatchNonemptyQuery.needs_retry());
        assert!(!ResolutionStatus::NoMatchNonemptyQuery.is_terminal());
        assert!(ResolutionStatus::MultipleExactMatches.needs_disambiguation());
        assert!(!ResolutionStatus::Processing.is_terminal());

        let json = serde_json::to_string(&ResolutionStatus::NoMatchNonemptyQuery).unwrap();
        assert_eq!(json, "\"NO_MATCH_NONEMPTY_QUERY\"");
    }

    #[test]
    fn test_chain_links_to_previous_head() {
        let mut manager = AttemptManager::new();

        let first = manager
            .create_attempt(create_test_draft("g1", ResolutionStatus::Processing))
            .key
            .clone();
        let second = manager
            .create_attempt(
                create_test_draft("g1", ResolutionStatus::ExactMatch).with_strategy("SingularExactMatch"),
            )
            .clone();

        assert_eq!(second.previous_key.as_deref(), Some(first.as_str()));
        assert_eq!(manager.latest_attempt("g1").unwrap().key, second.key);

        let chain: Vec<_> = manager.group_chain("g1").iter().map(|a| a.status).collect();
        assert_eq!(
            chain,
            vec![ResolutionStatus::Processing, ResolutionStatus::ExactMatch]
        );
        // The first attempt is never modified
        assert_eq!(manager.get_attempt(&first).unwrap().status, ResolutionStatus::Processing);
    }

    #[test]
    fn test_unknown_group_is_empty() {
        let manager = AttemptManager::new();
        assert!(manager.latest_attempt("missing").is_none());
        assert!(manager.group_chain("missing").is_empty());
        assert!(manager.attempt_chain("missing").is_empty());
    }

    #[test]
    fn test_chain_truncates_at_missing_predecessor() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("state.json");

        let mut manager = AttemptManager::new();
        let first = manager
            .create_attempt(create_test_draft("g1", ResolutionStatus::Processing))
            .key
            .clone();
        manager.create_attempt(create_test_draft("g1", ResolutionStatus::NoMatch));
        manager.save_state(&path).unwrap();

        // Remove the first attempt from the persisted state
        let mut state: serde_json::Value =
            serde_json::from_str(&fs::read_to_string(&path).unwrap()).unwrap();
        state["attempts"]
            .as_array_mut()
            .unwrap()
            .retain(|a| a["key"] != serde_json::Value::String(first.clone()));
        fs::write(&path, state.to_string()).unwrap();

        let loaded = AttemptManager::load_state(&path).unwrap();
        let chain = loaded.group_chain("g1");
        assert_eq!(chain.len(), 1);
        assert_eq!(chain[0].status, ResolutionStatus::NoMatch);
    }

    #[test]
    fn test_chain_length_bounded_by_attempts() {
        let mut manager = AttemptManager::new();
        for i in 0..5 {
            let status = if i % 2 == 0 {
                ResolutionStatus::Processing
            } else {
                ResolutionStatus::RetryScheduled
            };
            manager.create_attempt(create_test_draft("g1", status));
        }
        manager.create_attempt(create_test_draft("g2", ResolutionStatus::Processing));

        assert_eq!(manager.group_chain("g1").len(), 5);
        assert!(manager.group_chain("g1").len() <= manager.len());
        assert_eq!(manager.retry_count("g1"), 2);
    }

    #[test]
    fn test_groups_needing_retry_and_successes() {
        let mut manager = AttemptManager::new();
        manager.create_attempt(create_test_draft("b", ResolutionStatus::RetryScheduled));
        manager.create_attempt(create_test_draft("a", ResolutionStatus::NoMatchNonemptyQuery));
        manager.create_attempt(create_test_draft("c", ResolutionStatus::SingularExactMatch));
        manager.create_attempt(create_test_draft("d", ResolutionStatus::NoMatch));

        assert_eq!(manager.groups_needing_retry(), vec!["a".to_string(), "b".to_string()]);

        let successes = manager.successful_attempts();
        assert_eq!(successes.len(), 1);
        assert_eq!(successes[0].query_group_key, "c");
    }

    #[test]
    fn test_statistics() {
        let mut manager = AttemptManager::new();
        manager.create_attempt(create_test_draft("g1", ResolutionStatus::Processing));
        manager.create_attempt(create_test_draft("g1", ResolutionStatus::ExactMatch));
        manager.create_attempt(create_test_draft("g2", ResolutionStatus::Processing));

        let stats = manager.statistics();
        assert_eq!(stats.total_attempts, 3);
        assert_eq!(stats.total_query_groups, 2);
        assert_eq!(stats.retry_attempts, 1);
        assert_eq!(stats.status_counts.get("PROCESSING"), Some(&2));
        assert_eq!(stats.final_status_counts.get("EXACT_MATCH"), Some(&1));
        assert_eq!(stats.final_status_counts.get("PROCESSING"), Some(&1));
    }

    #[test]
    fn test_key_depends_on_predecessor() {
        let draft = create_test_draft("g1", ResolutionStatus::Processing);
        let a = attempt_key(&draft, None);
        let b = attempt_key(&draft, Some(&a));
        assert_ne!(a, b);
        assert_eq!(a, attempt_key(&draft, None));

        // Metadata does not affect the key
        let with_meta = draft.clone().with_metadata("created_at", "2025-01-01");
        assert_eq!(attempt_key(&with_meta, None), a);
    }

    #[test]
    fn test_state_round_trip_preserves_heads() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("attempts.json");

        let mut manager = AttemptManager::new();
        manager.create_attempt(create_test_draft("g1", ResolutionStatus::Processing));
        let head = manager
            .create_attempt(create_test_draft("g1", ResolutionStatus::NoMatch))
            .key
            .clone();
        manager.save_state(&path).unwrap();

        let loaded = AttemptManager::load_state(&path).unwrap();
        assert_eq!(loaded.len(), 2);
        assert_eq!(loaded.latest_attempt("g1").unwrap().key, head);
        assert_eq!(loaded.statistics(), manager.statistics());
    }
}
