// ✅ Exact Match Strategies - Single hit, synonym policy, best of many

use super::{
    exact_candidates, exact_response, extract_classification, ranked_candidates, same_name,
    ResolutionStrategy, StrategyContext,
};
use crate::attempts::{AttemptDraft, ResolutionAttempt, ResolutionStatus};
use crate::config::SynonymPolicy;
use crate::error::StrategyError;
use crate::planner::QueryParameters;
use crate::verification::ResultData;
use serde_json::json;

// ============================================================================
// SINGULAR EXACT MATCH
// ============================================================================

/// Exactly one non-synonym Exact candidate with a classification
pub struct SingularExactMatchStrategy;

impl SingularExactMatchStrategy {
    fn single(attempt: &ResolutionAttempt) -> Option<&ResultData> {
        let candidates = exact_response(attempt)?.candidates();
        if candidates.len() == 1 {
            Some(candidates[0])
        } else {
            None
        }
    }
}

impl ResolutionStrategy for SingularExactMatchStrategy {
    fn name(&self) -> &'static str {
        "SingularExactMatch"
    }

    fn can_handle(&self, attempt: &ResolutionAttempt, _ctx: &StrategyContext) -> bool {
        Self::single(attempt).map_or(false, |r| r.has_classification() && !r.is_synonym)
    }

    fn resolve(
        &self,
        attempt: &ResolutionAttempt,
        _ctx: &StrategyContext,
    ) -> Result<AttemptDraft, StrategyError> {
        let result = Self::single(attempt).ok_or(StrategyError::NoCandidates)?;
        let classification = extract_classification(result)?;

        Ok(AttemptDraft::follow(attempt, ResolutionStatus::SingularExactMatch)
            .with_classification(classification)
            .with_metadata("confidence", "high")
            .with_metadata("curation", result.curation.clone())
            .with_metadata("data_source", result.data_source_title_short.clone())
            .with_metadata("current_name", result.current_name.clone()))
    }
}

// ============================================================================
// SYNONYM POLICY
// ============================================================================

/// Every exact candidate is a synonym; the configured policy decides
pub struct SynonymPolicyStrategy;

fn is_synonym(result: &ResultData) -> bool {
    result.is_synonym || result.taxonomic_status == "Synonym"
}

impl ResolutionStrategy for SynonymPolicyStrategy {
    fn name(&self) -> &'static str {
        "SynonymPolicy"
    }

    fn can_handle(&self, attempt: &ResolutionAttempt, _ctx: &StrategyContext) -> bool {
        exact_response(attempt).map_or(false, |response| {
            exact_candidates(response).iter().all(|r| is_synonym(r))
        })
    }

    fn resolve(
        &self,
        attempt: &ResolutionAttempt,
        ctx: &StrategyContext,
    ) -> Result<AttemptDraft, StrategyError> {
        let response = exact_response(attempt).ok_or(StrategyError::NoCandidates)?;
        let candidates = exact_candidates(response);
        let best = ranked_candidates(&candidates)
            .into_iter()
            .next()
            .ok_or(StrategyError::NoCandidates)?;

        let accepted_name = if best.current_canonical_simple.is_empty() {
            best.current_name.clone()
        } else {
            best.current_canonical_simple.clone()
        };

        let policy = ctx.config.synonym_policy;
        let accept = || -> Result<AttemptDraft, StrategyError> {
            Ok(AttemptDraft::follow(attempt, ResolutionStatus::ExactMatch)
                .with_classification(extract_classification(best)?)
                .with_metadata("synonym_policy", "accept")
                .with_metadata("accepted_name", accepted_name.clone()))
        };

        match policy {
            SynonymPolicy::Accept => accept(),
            SynonymPolicy::Reject => Ok(AttemptDraft::follow(attempt, ResolutionStatus::NoMatch)
                .with_metadata("synonym_policy", "reject")
                .with_metadata("failure_reason", "only synonyms matched")
                .with_metadata("result_count", candidates.len())),
            SynonymPolicy::ResolveToAccepted => {
                // Nothing new to ask for: keep the synonym's classification
                if accepted_name.is_empty() || same_name(&accepted_name, &attempt.query.term) {
                    return accept();
                }
                Ok(AttemptDraft::follow(attempt, ResolutionStatus::RetryScheduled)
                    .with_scheduled_query(QueryParameters {
                        term: accepted_name.clone(),
                        rank: attempt.query.rank,
                        data_source_id: ctx.config.primary_data_source,
                    })
                    .with_metadata("synonym_policy", "resolve_to_accepted")
                    .with_metadata("reason_for_retry", "query matched a synonym, retrying with the accepted name")
                    .with_metadata("synonym_term", attempt.query.term.clone())
                    .with_metadata("accepted_name", accepted_name))
            }
        }
    }
}

// ============================================================================
// EXACT MATCH
// ============================================================================

/// Several Exact candidates: pick the best one, or flag an unbreakable tie
pub struct ExactMatchStrategy;

impl ResolutionStrategy for ExactMatchStrategy {
    fn name(&self) -> &'static str {
        "ExactMatch"
    }

    fn can_handle(&self, attempt: &ResolutionAttempt, _ctx: &StrategyContext) -> bool {
        exact_response(attempt).is_some()
    }

    fn resolve(
        &self,
        attempt: &ResolutionAttempt,
        _ctx: &StrategyContext,
    ) -> Result<AttemptDraft, StrategyError> {
        let response = exact_response(attempt).ok_or(StrategyError::NoCandidates)?;
        let candidates = exact_candidates(response);
        let ranked = ranked_candidates(&candidates);
        let best = *ranked.first().ok_or(StrategyError::NoCandidates)?;
        let classification = extract_classification(best)?;

        // Top-scoring candidates that disagree on classification cannot be ranked
        let conflicting: Vec<&ResultData> = ranked
            .iter()
            .copied()
            .skip(1)
            .take_while(|r| r.sort_score == best.sort_score)
            .filter(|r| {
                extract_classification(r).map_or(false, |other| other != classification)
            })
            .collect();

        if !conflicting.is_empty() {
            let tied: Vec<serde_json::Value> = std::iter::once(best)
                .chain(conflicting.iter().copied())
                .map(|r| {
                    json!({
                        "name": r.matched_name,
                        "score": r.sort_score,
                        "source": r.data_source_title_short,
                        "classification_path": r.classification_path,
                    })
                })
                .collect();
            return Ok(AttemptDraft::follow(attempt, ResolutionStatus::MultipleExactMatches)
                .with_metadata("candidates", tied));
        }

        let mut draft = AttemptDraft::follow(attempt, ResolutionStatus::ExactMatch)
            .with_classification(classification)
            .with_metadata("confidence", "high")
            .with_metadata(
                "decision_factors",
                json!([
                    {"criteria": "match_type", "value": "Exact"},
                    {"criteria": "taxonomic_status", "value": best.taxonomic_status},
                    {"criteria": "source_quality", "value": best.curation},
                    {"criteria": "score", "value": best.sort_score},
                ]),
            );

        if candidates.len() > 1 {
            let alternatives: Vec<serde_json::Value> = candidates
                .iter()
                .filter(|r| !std::ptr::eq(**r, best))
                .map(|r| {
                    json!({
                        "name": r.matched_name,
                        "score": r.sort_score,
                        "source": r.data_source_title_short,
                    })
                })
                .collect();
            draft = draft.with_metadata("alternatives", alternatives);
        }

        Ok(draft)
    }
}

// ============================================================================
// TESTS
// ============================================================================
