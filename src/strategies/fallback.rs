// ↩️ Fallback Strategies - Schedule a new query when the first one found nothing

use super::{same_name, ResolutionStrategy, StrategyContext};
use crate::attempts::{AttemptDraft, ResolutionAttempt, ResolutionStatus};
use crate::entry::Rank;
use crate::error::StrategyError;
use crate::planner::QueryParameters;
use tracing::debug;

/// True when the verifier answered but found nothing usable
fn found_nothing(attempt: &ResolutionAttempt) -> bool {
    match &attempt.raw_result {
        None => true,
        Some(result) => result.is_no_match() || result.candidates().is_empty(),
    }
}

// ============================================================================
// SEQUENCE SIMILARITY
// ============================================================================

/// Ratcliff/Obershelp similarity: 2 * matched characters / total characters
pub fn sequence_ratio(a: &str, b: &str) -> f64 {
    let a: Vec<char> = a.chars().collect();
    let b: Vec<char> = b.chars().collect();
    let total = a.len() + b.len();
    if total == 0 {
        return 1.0;
    }
    2.0 * matching_chars(&a, &b) as f64 / total as f64
}

fn matching_chars(a: &[char], b: &[char]) -> usize {
    let (i, j, size) = longest_common_block(a, b);
    if size == 0 {
        return 0;
    }
    size + matching_chars(&a[..i], &b[..j]) + matching_chars(&a[i + size..], &b[j + size..])
}

/// (start in a, start in b, length) of the longest common substring
fn longest_common_block(a: &[char], b: &[char]) -> (usize, usize, usize) {
    let mut best = (0, 0, 0);
    let mut prev = vec![0usize; b.len() + 1];

    for i in 0..a.len() {
        let mut current = vec![0usize; b.len() + 1];
        for j in 0..b.len() {
            if a[i] == b[j] {
                let run = prev[j] + 1;
                current[j + 1] = run;
                if run > best.2 {
                    best = (i + 1 - run, j + 1 - run, run);
                }
            }
        }
        prev = current;
    }
    best
}

// ============================================================================
// SUBFAMILY → FAMILY
// ============================================================================

/// A scientific name that looks like a subfamily ("Diapriinae") found nothing,
/// but the input also names a closely related family ("Diapriidae")
pub struct SubfamilyToFamilyFallbackStrategy;

impl SubfamilyToFamilyFallbackStrategy {
    /// (family term, similarity ratio) when the fallback applies
    fn family_candidate(attempt: &ResolutionAttempt, ctx: &StrategyContext) -> Option<(String, f64)> {
        if attempt.query.rank != Rank::ScientificName || !found_nothing(attempt) {
            return None;
        }

        let term = attempt.query.term.trim().to_lowercase();
        let looks_like_subfamily = ctx
            .config
            .subfamily_suffixes
            .iter()
            .any(|suffix| term.ends_with(&suffix.to_lowercase()));
        if !looks_like_subfamily {
            return None;
        }

        let family = ctx
            .entry_groups
            .iter()
            .find_map(|group| group.taxonomy.valid(Rank::Family))?;
        let family_lower = family.to_lowercase();

        let prefix_len = ctx
            .config
            .common_prefix_len
            .min(term.chars().count())
            .min(family_lower.chars().count());
        let common_prefix = term
            .chars()
            .take(prefix_len)
            .eq(family_lower.chars().take(prefix_len));

        let ratio = sequence_ratio(&term, &family_lower);
        if !common_prefix || ratio < ctx.config.similarity_cutoff {
            debug!(
                "'{}' and family '{}' are not similar enough ({:.2})",
                attempt.query.term, family, ratio
            );
            return None;
        }

        Some((family.to_string(), ratio))
    }
}

impl ResolutionStrategy for SubfamilyToFamilyFallbackStrategy {
    fn name(&self) -> &'static str {
        "SubfamilyToFamilyFallback"
    }

    fn can_handle(&self, attempt: &ResolutionAttempt, ctx: &StrategyContext) -> bool {
        Self::family_candidate(attempt, ctx).is_some()
    }

    fn resolve(
        &self,
        attempt: &ResolutionAttempt,
        ctx: &StrategyContext,
    ) -> Result<AttemptDraft, StrategyError> {
        let (family, ratio) =
            Self::family_candidate(attempt, ctx).ok_or(StrategyError::MissingField("family"))?;

        Ok(AttemptDraft::follow(attempt, ResolutionStatus::RetryScheduled)
            .with_scheduled_query(QueryParameters {
                term: family.clone(),
                rank: Rank::Family,
                data_source_id: ctx.config.primary_data_source,
            })
            .with_metadata(
                "reason_for_retry",
                "scientific name appears to be a subfamily, trying the family term instead",
            )
            .with_metadata("subfamily_term", attempt.query.term.clone())
            .with_metadata("family_term", family)
            .with_metadata("similarity_ratio", format!("{:.2}", ratio)))
    }
}

// ============================================================================
// RANK FALLBACK
// ============================================================================

/// Opt-in: after a NoMatch, retry with the next less specific valid rank
pub struct RankFallbackStrategy;

impl RankFallbackStrategy {
    fn next_query(attempt: &ResolutionAttempt, ctx: &StrategyContext) -> Option<(Rank, String)> {
        Rank::QUERY_PRECEDENCE
            .iter()
            .skip_while(|rank| **rank != attempt.query.rank)
            .skip(1)
            .find_map(|rank| {
                ctx.entry_groups
                    .iter()
                    .find_map(|group| group.taxonomy.valid(*rank))
                    .filter(|term| !same_name(term, &attempt.query.term))
                    .map(|term| (*rank, term.to_string()))
            })
    }
}

impl ResolutionStrategy for RankFallbackStrategy {
    fn name(&self) -> &'static str {
        "RankFallback"
    }

    fn can_handle(&self, attempt: &ResolutionAttempt, ctx: &StrategyContext) -> bool {
        ctx.config.rank_fallback
            && attempt.raw_result.as_ref().map_or(false, |r| !r.is_placeholder())
            && found_nothing(attempt)
            && Self::next_query(attempt, ctx).is_some()
    }

    fn resolve(
        &self,
        attempt: &ResolutionAttempt,
        ctx: &StrategyContext,
    ) -> Result<AttemptDraft, StrategyError> {
        let (rank, term) = Self::next_query(attempt, ctx).ok_or(StrategyError::MissingField("rank"))?;

        Ok(AttemptDraft::follow(attempt, ResolutionStatus::NoMatchNonemptyQuery)
            .with_scheduled_query(QueryParameters {
                term: term.clone(),
                rank,
                data_source_id: ctx.config.primary_data_source,
            })
            .with_metadata("reason_for_retry", "no match, retrying at a less specific rank")
            .with_metadata("from_rank", attempt.query.rank.as_str())
            .with_metadata("to_rank", rank.as_str())
            .with_metadata("next_term", term))
    }
}

// ============================================================================
// TESTS
// ============================================================================

#[cfg(test)]
mod tests {
    use super::super::test_support::*;
    use super::*;
    use crate::attempts::AttemptManager;
    use crate::config::ResolutionConfig;
    use crate::entry::Taxonomy;
    use crate::verification::MatchType;

    fn diapriinae_group() -> crate::grouping::EntryGroup {
        create_test_group(Taxonomy {
            kingdom: Some("Animalia".to_string()),
            order: Some("Hymenoptera".to_string()),
            family: Some("Diapriidae".to_string()),
            scientific_name: Some("Diapriinae".to_string()),
            ..Taxonomy::default()
        })
    }

    fn no_match_attempt(term: &str, rank: Rank) -> ResolutionAttempt {
        let mut attempts = AttemptManager::new();
        create_test_attempt(
            &mut attempts,
            term,
            rank,
            Some(create_test_response(term, MatchType::NoMatch, vec![])),
        )
    }

    #[test]
    fn test_sequence_ratio() {
        assert_eq!(sequence_ratio("abcd", "abcd"), 1.0);
        assert_eq!(sequence_ratio("abc", "xyz"), 0.0);
        assert_eq!(sequence_ratio("", ""), 1.0);
        // 9 of 10 characters line up
        assert!((sequence_ratio("diapriinae", "diapriidae") - 0.9).abs() < 1e-9);
    }

    #[test]
    fn test_subfamily_schedules_family_retry() {
        let config = ResolutionConfig::default();
        let group = diapriinae_group();
        let ctx = StrategyContext::new(vec![&group], &config);
        let attempt = no_match_attempt("Diapriinae", Rank::ScientificName);

        assert!(SubfamilyToFamilyFallbackStrategy.can_handle(&attempt, &ctx));
        let draft = SubfamilyToFamilyFallbackStrategy.resolve(&attempt, &ctx).unwrap();

        assert_eq!(draft.status, ResolutionStatus::RetryScheduled);
        assert_eq!(
            draft.scheduled_query,
            Some(QueryParameters {
                term: "Diapriidae".to_string(),
                rank: Rank::Family,
                data_source_id: 11,
            })
        );
        assert_eq!(draft.metadata.get("similarity_ratio"), Some(&serde_json::json!("0.90")));
        assert_eq!(draft.metadata.get("subfamily_term"), Some(&serde_json::json!("Diapriinae")));
    }

    #[test]
    fn test_subfamily_requires_similar_family() {
        let config = ResolutionConfig::default();
        let group = create_test_group(Taxonomy {
            family: Some("Formicidae".to_string()),
            scientific_name: Some("Diapriinae".to_string()),
            ..Taxonomy::default()
        });
        let ctx = StrategyContext::new(vec![&group], &config);
        let attempt = no_match_attempt("Diapriinae", Rank::ScientificName);
        assert!(!SubfamilyToFamilyFallbackStrategy.can_handle(&attempt, &ctx));

        // Wrong query rank
        let group = diapriinae_group();
        let ctx = StrategyContext::new(vec![&group], &config);
        let attempt = no_match_attempt("Diapriinae", Rank::Genus);
        assert!(!SubfamilyToFamilyFallbackStrategy.can_handle(&attempt, &ctx));
    }

    #[test]
    fn test_rank_fallback_is_opt_in() {
        let mut config = ResolutionConfig::default();
        let group = create_test_group(Taxonomy {
            kingdom: Some("Animalia".to_string()),
            family: Some("Felidae".to_string()),
            genus: Some("Felis".to_string()),
            ..Taxonomy::default()
        });
        let attempt = no_match_attempt("Felis", Rank::Genus);

        let ctx = StrategyContext::new(vec![&group], &config);
        assert!(!RankFallbackStrategy.can_handle(&attempt, &ctx));

        config.rank_fallback = true;
        let ctx = StrategyContext::new(vec![&group], &config);
        assert!(RankFallbackStrategy.can_handle(&attempt, &ctx));

        let draft = RankFallbackStrategy.resolve(&attempt, &ctx).unwrap();
        assert_eq!(draft.status, ResolutionStatus::NoMatchNonemptyQuery);
        let next = draft.scheduled_query.unwrap();
        assert_eq!(next.term, "Felidae");
        assert_eq!(next.rank, Rank::Family);
    }

    #[test]
    fn test_rank_fallback_stops_at_kingdom() {
        let mut config = ResolutionConfig::default();
        config.rank_fallback = true;
        let group = create_test_group(Taxonomy {
            kingdom: Some("Animalia".to_string()),
            ..Taxonomy::default()
        });
        let ctx = StrategyContext::new(vec![&group], &config);
        let attempt = no_match_attempt("Animalia", Rank::Kingdom);
        assert!(!RankFallbackStrategy.can_handle(&attempt, &ctx));
    }
}
