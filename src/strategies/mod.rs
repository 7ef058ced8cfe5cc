// 🧭 Strategy Engine - Ordered decision rules over verifier responses
// Like classification rules: the first strategy that can handle an attempt
// decides what happens next. Order is explicit, most specific first.

pub mod exact;
pub mod fallback;
pub mod profile;
pub mod terminal;

pub use exact::{ExactMatchStrategy, SingularExactMatchStrategy, SynonymPolicyStrategy};
pub use fallback::{sequence_ratio, RankFallbackStrategy, SubfamilyToFamilyFallbackStrategy};
pub use profile::{ProfileCheck, ProfileStrategy};
pub use terminal::{EmptyResponseStrategy, NoMatchStrategy};

use crate::attempts::{AttemptDraft, AttemptManager, ResolutionAttempt, ResolutionStatus};
use crate::config::ResolutionConfig;
use crate::entry::Rank;
use crate::error::StrategyError;
use crate::grouping::EntryGroup;
use crate::verification::{MatchType, ResultData, VerificationResult};
use std::collections::BTreeMap;
use tracing::{debug, warn};

// ============================================================================
// STRATEGY TRAIT
// ============================================================================

/// What a strategy may look at besides the attempt itself
pub struct StrategyContext<'a> {
    /// Entry groups served by the attempt's query group
    pub entry_groups: Vec<&'a EntryGroup>,
    pub config: &'a ResolutionConfig,
}

impl<'a> StrategyContext<'a> {
    pub fn new(entry_groups: Vec<&'a EntryGroup>, config: &'a ResolutionConfig) -> Self {
        StrategyContext {
            entry_groups,
            config,
        }
    }
}

pub trait ResolutionStrategy {
    fn name(&self) -> &'static str;

    fn can_handle(&self, attempt: &ResolutionAttempt, ctx: &StrategyContext) -> bool;

    /// Draft of the attempt that follows `attempt`
    fn resolve(
        &self,
        attempt: &ResolutionAttempt,
        ctx: &StrategyContext,
    ) -> Result<AttemptDraft, StrategyError>;
}

// ============================================================================
// SHARED HELPERS
// ============================================================================

/// Zip `classificationPath` with `classificationRanks`, keeping the seven
/// Linnaean ranks (`class` becomes `class_`).
pub fn extract_classification(result: &ResultData) -> Result<BTreeMap<String, String>, StrategyError> {
    let path = result
        .classification_path
        .as_deref()
        .ok_or(StrategyError::MissingField("classificationPath"))?;
    let ranks = result
        .classification_ranks
        .as_deref()
        .ok_or(StrategyError::MissingField("classificationRanks"))?;

    let taxa: Vec<&str> = path.split('|').collect();
    let rank_labels: Vec<&str> = ranks.split('|').collect();
    if taxa.len() != rank_labels.len() {
        return Err(StrategyError::MalformedClassification {
            taxa: taxa.len(),
            ranks: rank_labels.len(),
        });
    }

    Ok(rank_labels
        .iter()
        .zip(taxa.iter())
        .filter_map(|(label, taxon)| {
            let rank = Rank::from_label(label).filter(Rank::is_linnaean)?;
            let taxon = taxon.trim();
            if taxon.is_empty() {
                None
            } else {
                Some((rank.field_name().to_string(), taxon.to_string()))
            }
        })
        .collect())
}

const CURATION_LEVELS: [&str; 3] = ["Curated", "AutoCurated", "NotCurated"];

/// Candidates still in contention after the accepted and curation filters,
/// sorted by descending sort score
pub fn ranked_candidates<'r>(candidates: &[&'r ResultData]) -> Vec<&'r ResultData> {
    let accepted: Vec<&ResultData> = candidates.iter().copied().filter(|r| r.is_accepted()).collect();
    let pool = if accepted.is_empty() {
        candidates.to_vec()
    } else {
        accepted
    };

    let tier: Option<Vec<&ResultData>> = if pool.len() > 1 {
        CURATION_LEVELS
            .iter()
            .map(|level| pool.iter().copied().filter(|r| r.curation == *level).collect::<Vec<_>>())
            .find(|tier| !tier.is_empty())
    } else {
        None
    };
    let mut pool = tier.unwrap_or(pool);

    pool.sort_by(|a, b| {
        b.sort_score
            .partial_cmp(&a.sort_score)
            .unwrap_or(std::cmp::Ordering::Equal)
    });
    pool
}

/// Accepted non-synonyms first, then curation level, then highest sort score
pub fn select_best_result<'r>(candidates: &[&'r ResultData]) -> Option<&'r ResultData> {
    ranked_candidates(candidates).into_iter().next()
}

/// Candidates whose own match type is Exact (or unset); all of them if none are
pub fn exact_candidates(result: &VerificationResult) -> Vec<&ResultData> {
    let all = result.candidates();
    let exact: Vec<&ResultData> = all
        .iter()
        .copied()
        .filter(|r| r.match_type.map_or(true, |m| m == MatchType::Exact))
        .collect();
    if exact.is_empty() {
        all
    } else {
        exact
    }
}

/// The attempt's response, if it is an Exact match with at least one candidate
pub(crate) fn exact_response(attempt: &ResolutionAttempt) -> Option<&VerificationResult> {
    attempt
        .raw_result
        .as_ref()
        .filter(|r| r.match_type == Some(MatchType::Exact) && !r.candidates().is_empty())
}

pub(crate) fn same_name(a: &str, b: &str) -> bool {
    a.trim().to_lowercase() == b.trim().to_lowercase()
}

// ============================================================================
// STRATEGY MANAGER
// ============================================================================

pub struct StrategyManager {
    strategies: Vec<Box<dyn ResolutionStrategy>>,
}

impl StrategyManager {
    /// Manager with no strategies; every attempt ends FAILED
    pub fn new() -> Self {
        StrategyManager {
            strategies: Vec::new(),
        }
    }

    /// The standard catalogue, most specific first
    pub fn with_defaults() -> Self {
        let mut manager = StrategyManager::new();
        manager.register(ProfileStrategy::exact_match_primary_source_accepted());
        manager.register(SingularExactMatchStrategy);
        manager.register(SynonymPolicyStrategy);
        manager.register(ExactMatchStrategy);
        manager.register(SubfamilyToFamilyFallbackStrategy);
        manager.register(RankFallbackStrategy);
        manager.register(NoMatchStrategy);
        manager.register(EmptyResponseStrategy);
        manager
    }

    /// Append a strategy; it runs after everything registered before it
    pub fn register<S: ResolutionStrategy + 'static>(&mut self, strategy: S) {
        self.strategies.push(Box::new(strategy));
    }

    pub fn strategy_names(&self) -> Vec<&'static str> {
        self.strategies.iter().map(|s| s.name()).collect()
    }

    /// First strategy whose predicate holds
    pub fn select(&self, attempt: &ResolutionAttempt, ctx: &StrategyContext) -> Option<&dyn ResolutionStrategy> {
        self.strategies
            .iter()
            .find(|s| s.can_handle(attempt, ctx))
            .map(|s| s.as_ref())
    }

    /// Resolution draft for `attempt`. Strategy errors and unhandled attempts
    /// become FAILED drafts.
    pub fn resolve(&self, attempt: &ResolutionAttempt, ctx: &StrategyContext) -> AttemptDraft {
        let Some(strategy) = self.select(attempt, ctx) else {
            warn!(
                "No strategy could resolve '{}' ({})",
                attempt.query.term, attempt.query.rank
            );
            return AttemptDraft::follow(attempt, ResolutionStatus::Failed)
                .with_metadata("failure_reason", "no strategy could resolve");
        };

        debug!("Applying {} to '{}'", strategy.name(), attempt.query.term);
        match strategy.resolve(attempt, ctx) {
            Ok(mut draft) => {
                if draft.strategy.is_none() {
                    draft.strategy = Some(strategy.name().to_string());
                }
                draft
            }
            Err(e) => {
                warn!("{} failed on '{}': {}", strategy.name(), attempt.query.term, e);
                AttemptDraft::follow(attempt, ResolutionStatus::Failed)
                    .with_strategy(strategy.name())
                    .with_metadata("failure_reason", "strategy error")
                    .with_metadata("error", e.to_string())
            }
        }
    }

    /// Resolve the attempt stored under `attempt_key` and record the outcome.
    /// Returns the new attempt's key.
    pub fn apply(
        &self,
        attempt_key: &str,
        ctx: &StrategyContext,
        manager: &mut AttemptManager,
    ) -> Option<String> {
        let draft = {
            let attempt = manager.get_attempt(attempt_key)?;
            self.resolve(attempt, ctx)
        };
        Some(manager.create_attempt(draft).key.clone())
    }
}

impl Default for StrategyManager {
    fn default() -> Self {
        Self::with_defaults()
    }
}

// ============================================================================
// TEST SUPPORT
// ============================================================================


// ============================================================================
// TESTS
// ============================================================================
