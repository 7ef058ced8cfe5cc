// ⛔ Terminal Strategies - Close out attempts nothing else could use

use super::{ResolutionStrategy, StrategyContext};
use crate::attempts::{AttemptDraft, ResolutionAttempt, ResolutionStatus};
use crate::error::StrategyError;

/// The verifier answered and found nothing
pub struct NoMatchStrategy;

impl ResolutionStrategy for NoMatchStrategy {
    fn name(&self) -> &'static str {
        "NoMatch"
    }

    fn can_handle(&self, attempt: &ResolutionAttempt, _ctx: &StrategyContext) -> bool {
        attempt.raw_result.as_ref().map_or(false, |r| {
            !r.is_placeholder() && (r.is_no_match() || r.candidates().is_empty())
        })
    }

    fn resolve(
        &self,
        attempt: &ResolutionAttempt,
        _ctx: &StrategyContext,
    ) -> Result<AttemptDraft, StrategyError> {
        let result_count = attempt
            .raw_result
            .as_ref()
            .map_or(0, |r| r.candidates().len());

        Ok(AttemptDraft::follow(attempt, ResolutionStatus::NoMatch)
            .with_metadata("failure_reason", "no match")
            .with_metadata("result_count", result_count))
    }
}

/// No usable response at all (gateway error, timeout, missing line)
pub struct EmptyResponseStrategy;

impl ResolutionStrategy for EmptyResponseStrategy {
    fn name(&self) -> &'static str {
        "EmptyResponse"
    }

    fn can_handle(&self, attempt: &ResolutionAttempt, _ctx: &StrategyContext) -> bool {
        attempt.raw_result.as_ref().map_or(true, |r| r.is_placeholder())
    }

    fn resolve(
        &self,
        attempt: &ResolutionAttempt,
        _ctx: &StrategyContext,
    ) -> Result<AttemptDraft, StrategyError> {
        let mut draft = AttemptDraft::follow(attempt, ResolutionStatus::Failed)
            .with_metadata("failure_reason", "empty verifier response");
        if let Some(error) = attempt.metadata.get("error") {
            draft = draft.with_metadata("error", error.clone());
        }
        Ok(draft)
    }
}

#[cfg(test)]
mod tests {
    use super::super::test_support::*;
    use super::*;
    use crate::attempts::AttemptManager;
    use crate::config::ResolutionConfig;
    use crate::entry::Rank;
    use crate::verification::MatchType;
    use serde_json::json;

    #[test]
    fn test_no_match_records_result_count() {
        let config = ResolutionConfig::default();
        let ctx = StrategyContext::new(vec![], &config);
        let mut attempts = AttemptManager::new();
        let attempt = create_test_attempt(
            &mut attempts,
            "Felis",
            Rank::Genus,
            Some(create_test_response("Felis", MatchType::NoMatch, vec![])),
        );

        assert!(NoMatchStrategy.can_handle(&attempt, &ctx));
        assert!(!EmptyResponseStrategy.can_handle(&attempt, &ctx));

        let draft = NoMatchStrategy.resolve(&attempt, &ctx).unwrap();
        assert_eq!(draft.status, ResolutionStatus::NoMatch);
        assert_eq!(draft.metadata.get("result_count"), Some(&json!(0)));
    }

    #[test]
    fn test_missing_response_fails() {
        let config = ResolutionConfig::default();
        let ctx = StrategyContext::new(vec![], &config);
        let mut attempts = AttemptManager::new();
        let attempt = create_test_attempt(&mut attempts, "Felis", Rank::Genus, None);

        assert!(!NoMatchStrategy.can_handle(&attempt, &ctx));
        assert!(EmptyResponseStrategy.can_handle(&attempt, &ctx));
        let draft = EmptyResponseStrategy.resolve(&attempt, &ctx).unwrap();
        assert_eq!(draft.status, ResolutionStatus::Failed);
    }
}
