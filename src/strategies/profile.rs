// 🎯 Profile Strategies - Independent checks that must all hold

use super::{exact_response, extract_classification, same_name, ResolutionStrategy, StrategyContext};
use crate::attempts::{AttemptDraft, ResolutionAttempt, ResolutionStatus};
use crate::error::StrategyError;
use crate::verification::{MatchType, ResultData};
use tracing::debug;

// ============================================================================
// PROFILE CHECKS
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProfileCheck {
    /// The response holds exactly one candidate
    SingleResult,

    /// That candidate's match type is Exact
    MatchTypeExact,

    /// Taxonomic status Accepted and not a synonym
    StatusAccepted,

    /// Candidate comes from the configured primary data source
    PrimarySource,

    /// Candidate carries a classification path and ranks
    HasClassification,

    /// Extracted classification agrees with every rank each entry group knows
    ClassificationAgrees,

    /// Query term equals each entry group's most specific term
    QueryTermIsMostSpecific,
}

impl ProfileCheck {
    fn holds(&self, attempt: &ResolutionAttempt, result: &ResultData, ctx: &StrategyContext) -> bool {
        match self {
            // Counted by the profile before any check runs
            ProfileCheck::SingleResult => true,
            ProfileCheck::MatchTypeExact => result.match_type.map_or(true, |m| m == MatchType::Exact),
            ProfileCheck::StatusAccepted => result.is_accepted(),
            ProfileCheck::PrimarySource => result.data_source_id == ctx.config.primary_data_source,
            ProfileCheck::HasClassification => result.has_classification(),
            ProfileCheck::ClassificationAgrees => {
                let Ok(classification) = extract_classification(result) else {
                    return false;
                };
                !ctx.entry_groups.is_empty()
                    && ctx.entry_groups.iter().all(|group| {
                        group.known_ranks().iter().all(|(field, expected)| {
                            classification
                                .get(*field)
                                .map_or(false, |actual| same_name(actual, expected))
                        })
                    })
            }
            ProfileCheck::QueryTermIsMostSpecific => {
                !ctx.entry_groups.is_empty()
                    && ctx.entry_groups.iter().all(|group| {
                        group
                            .most_specific_term()
                            .map_or(false, |(_, term)| same_name(term, &attempt.query.term))
                    })
            }
        }
    }
}

// ============================================================================
// PROFILE STRATEGY
// ============================================================================

pub struct ProfileStrategy {
    name: &'static str,
    checks: Vec<ProfileCheck>,
    status: ResolutionStatus,
}

impl ProfileStrategy {
    pub fn new(name: &'static str, checks: Vec<ProfileCheck>, status: ResolutionStatus) -> Self {
        ProfileStrategy {
            name,
            checks,
            status,
        }
    }

    /// Single, Exact, Accepted, primary-source match agreeing with the input
    pub fn exact_match_primary_source_accepted() -> Self {
        ProfileStrategy::new(
            "ExactMatchPrimarySourceAccepted",
            vec![
                ProfileCheck::SingleResult,
                ProfileCheck::MatchTypeExact,
                ProfileCheck::StatusAccepted,
                ProfileCheck::PrimarySource,
                ProfileCheck::HasClassification,
                ProfileCheck::ClassificationAgrees,
                ProfileCheck::QueryTermIsMostSpecific,
            ],
            ResolutionStatus::ExactMatch,
        )
    }

    pub fn checks(&self) -> &[ProfileCheck] {
        &self.checks
    }

    fn single_result(attempt: &ResolutionAttempt) -> Option<&ResultData> {
        let candidates = exact_response(attempt)?.candidates();
        if candidates.len() == 1 {
            Some(candidates[0])
        } else {
            None
        }
    }
}

impl ResolutionStrategy for ProfileStrategy {
    fn name(&self) -> &'static str {
        self.name
    }

    fn can_handle(&self, attempt: &ResolutionAttempt, ctx: &StrategyContext) -> bool {
        let Some(result) = Self::single_result(attempt) else {
            return false;
        };
        match self.checks.iter().find(|check| !check.holds(attempt, result, ctx)) {
            Some(failed) => {
                debug!(
                    "Profile {} mismatch on '{}': {:?}",
                    self.name, attempt.query.term, failed
                );
                false
            }
            None => true,
        }
    }

    fn resolve(
        &self,
        attempt: &ResolutionAttempt,
        _ctx: &StrategyContext,
    ) -> Result<AttemptDraft, StrategyError> {
        let result = Self::single_result(attempt).ok_or(StrategyError::NoCandidates)?;
        let classification = extract_classification(result)?;

        Ok(AttemptDraft::follow(attempt, self.status)
            .with_classification(classification)
            .with_metadata("profile", self.name)
            .with_metadata("data_source", result.data_source_title_short.clone()))
    }
}

// ============================================================================
// TESTS
// ============================================================================
