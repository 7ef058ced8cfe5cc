// 🔄 Resolver - Entries → groups → queries → attempts → per-entry status
// Grouping and planning go through the cache when one is attached; verification
// and strategy rounds repeat until no query group asks for a retry.

use crate::attempts::{AttemptDraft, AttemptManager, ResolutionAttempt, ResolutionStatus};
use crate::cache::{CacheArg, CacheClient, CachedFn};
use crate::config::ResolutionConfig;
use crate::entry::{load_entries, Entry, Rank};
use crate::grouping::{group_entries, EntryGroup};
use crate::output::{map_entries_to_attempts, map_entry_to_output, write_outputs, OutputFiles, OutputRecord, RunStatistics};
use crate::planner::{plan_queries, QueryGroup, QueryParameters, QueryPlan};
use crate::strategies::{StrategyContext, StrategyManager};
use crate::trace::{trace_entry, EntryTrace};
use crate::verification::{execute_batches, PendingQuery, VerificationGateway};
use anyhow::{bail, Result};
use serde_json::json;
use std::collections::{HashMap, HashSet};
use std::path::{Path, PathBuf};
use tracing::{info, warn};

// ============================================================================
// RUN RESULT
// ============================================================================

/// Everything one resolution run produced
#[derive(Debug)]
pub struct ResolutionRun {
    pub entries: Vec<Entry>,
    pub entry_groups: Vec<EntryGroup>,
    pub plan: QueryPlan,
    pub attempts: AttemptManager,

    /// Entry uuid → latest attempt of its query group
    pub entry_attempts: HashMap<String, ResolutionAttempt>,

    /// Input files that could not be read, with the reason
    pub skipped_files: Vec<(PathBuf, String)>,

    /// Verification rounds executed (first pass included)
    pub rounds: usize,
}

impl ResolutionRun {
    pub fn attempt_for(&self, uuid: &str) -> Option<&ResolutionAttempt> {
        self.entry_attempts.get(uuid)
    }

    /// One output record per entry, in input order
    pub fn records(&self) -> Vec<OutputRecord> {
        self.entries
            .iter()
            .map(|entry| map_entry_to_output(entry, self.entry_attempts.get(&entry.uuid)))
            .collect()
    }

    pub fn statistics(&self) -> RunStatistics {
        let resolved_entries = self
            .entries
            .iter()
            .filter(|e| {
                self.entry_attempts
                    .get(&e.uuid)
                    .map_or(false, |a| a.status.is_successful())
            })
            .count();

        RunStatistics {
            total_entries: self.entries.len(),
            entry_groups: self.entry_groups.len(),
            query_groups: self.plan.query_groups.len(),
            skipped_entry_groups: self.plan.skipped.len(),
            resolved_entries,
            unsolved_entries: self.entries.len() - resolved_entries,
            attempts: self.attempts.statistics(),
        }
    }

    pub fn trace(&self, uuid: &str) -> Option<EntryTrace> {
        trace_entry(uuid, &self.entries, &self.entry_groups, &self.plan, Some(&self.attempts))
    }

    pub fn write_outputs(&self, output_dir: &Path) -> Result<OutputFiles> {
        write_outputs(output_dir, &self.records(), &self.statistics())
    }
}

/// True when every entry uuid belongs to some group
fn covers_entries(groups: &[EntryGroup], entries: &[Entry]) -> bool {
    let members: HashSet<&str> = groups
        .iter()
        .flat_map(|g| g.entry_uuids.iter().map(String::as_str))
        .collect();
    entries.iter().all(|e| members.contains(e.uuid.as_str()))
}

// ============================================================================
// RESOLVER
// ============================================================================

pub struct Resolver<'a> {
    config: &'a ResolutionConfig,
    gateway: &'a dyn VerificationGateway,
    strategies: StrategyManager,
    cache: Option<&'a CacheClient>,
    refresh_cache: bool,
}

impl<'a> Resolver<'a> {
    pub fn new(config: &'a ResolutionConfig, gateway: &'a dyn VerificationGateway) -> Self {
        Resolver {
            config,
            gateway,
            strategies: StrategyManager::with_defaults(),
            cache: None,
            refresh_cache: false,
        }
    }

    /// Cache grouping and planning; `refresh` recomputes and overwrites
    pub fn with_cache(mut self, cache: &'a CacheClient, refresh: bool) -> Self {
        self.cache = Some(cache);
        self.refresh_cache = refresh;
        self
    }

    pub fn with_strategies(mut self, strategies: StrategyManager) -> Self {
        self.strategies = strategies;
        self
    }

    /// Load entries from a CSV file or directory and resolve them
    pub fn resolve_path(&self, input: &Path) -> Result<ResolutionRun> {
        let batch = load_entries(input)?;
        info!(
            "Loaded {} entries from {} files",
            batch.total_count(),
            batch.files.len()
        );

        let (entry_groups, plan) = match self.cache {
            Some(cache) => self.cached_groups_and_plan(cache, input, &batch.entries)?,
            None => {
                let groups = group_entries(&batch.entries);
                let plan = plan_queries(&groups, self.config.primary_data_source);
                (groups, plan)
            }
        };

        let mut run = self.resolve_groups(batch.entries, entry_groups, plan)?;
        run.skipped_files = batch.skipped;
        Ok(run)
    }

    /// Resolve entries that are already in memory, without caching
    pub fn resolve_entries(&self, entries: Vec<Entry>) -> Result<ResolutionRun> {
        let groups = group_entries(&entries);
        let plan = plan_queries(&groups, self.config.primary_data_source);
        self.resolve_groups(entries, groups, plan)
    }

    fn cached_groups_and_plan(
        &self,
        cache: &CacheClient,
        input: &Path,
        entries: &[Entry],
    ) -> Result<(Vec<EntryGroup>, QueryPlan)> {
        let cached = self.load_groups_and_plan(cache, input, entries, self.refresh_cache)?;
        if covers_entries(&cached.0, entries) {
            return Ok(cached);
        }

        // Cached membership no longer matches the loaded entries
        warn!("Cached entry groups do not cover the current entries, recomputing");
        self.load_groups_and_plan(cache, input, entries, true)
    }

    fn load_groups_and_plan(
        &self,
        cache: &CacheClient,
        input: &Path,
        entries: &[Entry],
        refresh: bool,
    ) -> Result<(Vec<EntryGroup>, QueryPlan)> {
        let max_age = self.config.cache.max_age();

        let groups: Vec<EntryGroup> = CachedFn::new("entry_groups")
            .with_max_age(max_age)
            .call(
                cache,
                &[("input", CacheArg::Path(input.to_path_buf()))],
                refresh,
                || Ok(group_entries(entries)),
            )?;

        let source = self.config.primary_data_source;
        let plan: QueryPlan = CachedFn::new("query_plan")
            .with_max_age(max_age)
            .call(
                cache,
                &[
                    ("input", CacheArg::Path(input.to_path_buf())),
                    ("data_source_id", CacheArg::Value(json!(source))),
                ],
                refresh,
                || Ok(plan_queries(&groups, source)),
            )?;

        Ok((groups, plan))
    }

    fn resolve_groups(
        &self,
        entries: Vec<Entry>,
        entry_groups: Vec<EntryGroup>,
        plan: QueryPlan,
    ) -> Result<ResolutionRun> {
        info!(
            "{} entries → {} entry groups → {} query groups",
            entries.len(),
            entry_groups.len(),
            plan.query_groups.len()
        );

        let group_map: HashMap<&str, &EntryGroup> =
            entry_groups.iter().map(|g| (g.key.as_str(), g)).collect();
        let query_index = plan.index();
        let mut attempts = AttemptManager::new();

        self.record_empty_groups(&plan, &group_map, &mut attempts)?;

        // 1. First pass over every planned query group
        let mut pending: Vec<PendingQuery> = plan
            .query_groups
            .iter()
            .map(|qg| PendingQuery {
                query_group_key: qg.key.clone(),
                query: qg.query.clone(),
            })
            .collect();

        // 2. Retry rounds until nothing is scheduled
        let mut rounds = 0;
        while !pending.is_empty() {
            rounds += 1;
            info!("Round {}: verifying {} queries", rounds, pending.len());

            let keys = execute_batches(
                self.gateway,
                &pending,
                self.config.batch_size,
                &mut attempts,
            );
            for key in keys {
                let Some(query_group_key) = attempts.get_attempt(&key).map(|a| a.query_group_key.clone())
                else {
                    continue;
                };
                let ctx = self.context_for(&query_index, &group_map, &query_group_key);
                self.strategies.apply(&key, &ctx, &mut attempts);
            }

            pending = self.schedule_retries(&mut attempts);
        }

        let entry_attempts = map_entries_to_attempts(&entry_groups, &plan.query_groups, &attempts);

        Ok(ResolutionRun {
            entries,
            entry_groups,
            plan,
            attempts,
            entry_attempts,
            skipped_files: Vec::new(),
            rounds,
        })
    }

    /// Entry groups the planner skipped get an EMPTY_INPUT_TAXONOMY attempt
    /// under their own key
    fn record_empty_groups(
        &self,
        plan: &QueryPlan,
        group_map: &HashMap<&str, &EntryGroup>,
        attempts: &mut AttemptManager,
    ) -> Result<()> {
        if plan.skipped.is_empty() {
            return Ok(());
        }
        if self.config.fail_on_empty_taxonomy {
            bail!(
                "{} entry groups have no usable taxonomic data",
                plan.skipped.len()
            );
        }

        for key in &plan.skipped {
            let Some(group) = group_map.get(key.as_str()) else {
                warn!("Skipped entry group {} not found", key);
                continue;
            };
            let query = QueryParameters {
                term: String::new(),
                rank: group.most_specific_term().map_or(Rank::Kingdom, |(rank, _)| rank),
                data_source_id: self.config.primary_data_source,
            };
            let draft = AttemptDraft::new(key.clone(), query, ResolutionStatus::EmptyInputTaxonomy)
                .with_metadata("failure_reason", "no valid taxonomic data")
                .with_metadata("entry_count", group.group_count());
            attempts.create_attempt(draft);
        }
        Ok(())
    }

    fn context_for<'g>(
        &'g self,
        query_index: &HashMap<&str, &QueryGroup>,
        group_map: &HashMap<&str, &'g EntryGroup>,
        query_group_key: &str,
    ) -> StrategyContext<'g> {
        let entry_groups = query_index
            .get(query_group_key)
            .map(|qg| {
                qg.entry_group_keys
                    .iter()
                    .filter_map(|k| group_map.get(k.as_str()).copied())
                    .collect()
            })
            .unwrap_or_default();
        StrategyContext::new(entry_groups, self.config)
    }

    /// Pending queries for groups that asked for a retry; groups over the
    /// retry limit are closed as FAILED
    fn schedule_retries(&self, attempts: &mut AttemptManager) -> Vec<PendingQuery> {
        let mut pending = Vec::new();

        for group_key in attempts.groups_needing_retry() {
            let Some(latest) = attempts.latest_attempt(&group_key).cloned() else {
                continue;
            };

            let retries = attempts.retry_count(&group_key);
            if retries >= self.config.max_retry_attempts as usize {
                warn!(
                    "Query group '{}' reached the retry limit ({})",
                    latest.query.term, retries
                );
                attempts.create_attempt(
                    AttemptDraft::follow(&latest, ResolutionStatus::Failed)
                        .with_metadata("failure_reason", "retry limit reached")
                        .with_metadata("retry_count", retries),
                );
                continue;
            }

            match latest.scheduled_query {
                Some(query) => pending.push(PendingQuery {
                    query_group_key: group_key,
                    query,
                }),
                None => {
                    attempts.create_attempt(
                        AttemptDraft::follow(&latest, ResolutionStatus::Failed)
                            .with_metadata("failure_reason", "retry without scheduled query"),
                    );
                }
            }
        }

        pending
    }
}

// ============================================================================
// TESTS
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::entry::Taxonomy;
    use crate::strategies::test_support::{create_test_response, create_test_result, CANIS_PATH, CANIS_RANKS};
    use crate::verification::{MatchType, StaticGateway, VerificationResult};
    use std::fs;

    fn canis_taxonomy(species: &str) -> Taxonomy {
        Taxonomy {
            kingdom: Some("Animalia".to_string()),
            phylum: Some("Chordata".to_string()),
            class_: Some("Mammalia".to_string()),
            order: Some("Carnivora".to_string()),
            family: Some("Canidae".to_string()),
            genus: Some("Canis".to_string()),
            species: Some(species.to_string()),
            scientific_name: None,
        }
    }

    fn felis_taxonomy() -> Taxonomy {
        Taxonomy {
            kingdom: Some("Animalia".to_string()),
            family: Some("Felidae".to_string()),
            genus: Some("Felis".to_string()),
            ..Taxonomy::default()
        }
    }

    fn create_test_entries() -> Vec<Entry> {
        vec![
            Entry::new("1", canis_taxonomy("Canis lupus")),
            Entry::new("2", canis_taxonomy("Canis lupus")),
            Entry::new("3", felis_taxonomy()),
        ]
    }

    fn canis_gateway() -> StaticGateway {
        StaticGateway::new()
            .with_response(
                "Canis lupus",
                create_test_response(
                    "Canis lupus",
                    MatchType::Exact,
                    vec![create_test_result("Canis lupus", CANIS_PATH, CANIS_RANKS)],
                ),
            )
            .with_response("Felis", create_test_response("Felis", MatchType::NoMatch, vec![]))
    }

    #[test]
    fn test_canis_felis_scenario() {
        let config = ResolutionConfig::default();
        let gateway = canis_gateway();
        let run = Resolver::new(&config, &gateway)
            .resolve_entries(create_test_entries())
            .unwrap();

        assert_eq!(run.entry_groups.len(), 2);
        assert_eq!(run.plan.query_groups.len(), 2);
        assert_eq!(run.rounds, 1);

        let wolf = run.attempt_for("1").unwrap();
        assert_eq!(wolf.status, ResolutionStatus::ExactMatch);
        let classification = wolf.resolved_classification.as_ref().unwrap();
        assert_eq!(classification.len(), 7);
        assert_eq!(classification.get("class_").map(String::as_str), Some("Mammalia"));
        assert_eq!(run.attempt_for("2").unwrap().key, wolf.key);

        let cat = run.attempt_for("3").unwrap();
        assert_eq!(cat.status, ResolutionStatus::NoMatch);
        assert_eq!(cat.metadata.get("result_count"), Some(&json!(0)));

        let trace = run.trace("3").unwrap();
        assert_eq!(trace.attempts.last().map(|a| a.status), Some(ResolutionStatus::NoMatch));

        let stats = run.statistics();
        assert_eq!(stats.resolved_entries, 2);
        assert_eq!(stats.unsolved_entries, 1);
        assert_eq!(stats.attempts.total_query_groups, 2);
    }

    #[test]
    fn test_subfamily_retry_round() {
        let config = ResolutionConfig::default();
        let entries = vec![Entry::new(
            "1",
            Taxonomy {
                kingdom: Some("Animalia".to_string()),
                family: Some("Diapriidae".to_string()),
                scientific_name: Some("Diapriinae".to_string()),
                ..Taxonomy::default()
            },
        )];
        let gateway = StaticGateway::new()
            .with_response(
                "Diapriinae",
                create_test_response("Diapriinae", MatchType::NoMatch, vec![]),
            )
            .with_response(
                "Diapriidae",
                create_test_response(
                    "Diapriidae",
                    MatchType::Exact,
                    vec![create_test_result(
                        "Diapriidae",
                        "Animalia|Arthropoda|Insecta|Hymenoptera|Diapriidae",
                        "kingdom|phylum|class|order|family",
                    )],
                ),
            );

        let run = Resolver::new(&config, &gateway).resolve_entries(entries).unwrap();
        assert_eq!(run.rounds, 2);

        let attempt = run.attempt_for("1").unwrap();
        assert!(attempt.status.is_successful());
        assert_eq!(attempt.query.term, "Diapriidae");
        assert_eq!(attempt.query.rank, Rank::Family);

        // PROCESSING → RETRY_SCHEDULED → PROCESSING → success
        let chain = run.attempts.group_chain(&attempt.query_group_key);
        let statuses: Vec<ResolutionStatus> = chain.iter().map(|a| a.status).collect();
        assert_eq!(
            statuses[..3],
            [
                ResolutionStatus::Processing,
                ResolutionStatus::RetryScheduled,
                ResolutionStatus::Processing,
            ]
        );
        assert_eq!(chain.len(), 4);
    }

    #[test]
    fn test_retry_limit_closes_group() {
        let mut config = ResolutionConfig::default();
        config.rank_fallback = true;
        config.max_retry_attempts = 1;

        // Every rank comes back empty
        let gateway = ["Felis", "Felidae", "Animalia"]
            .into_iter()
            .fold(StaticGateway::new(), |gateway, term| {
                gateway.with_response(term, create_test_response(term, MatchType::NoMatch, vec![]))
            });
        let run = Resolver::new(&config, &gateway)
            .resolve_entries(vec![Entry::new("3", felis_taxonomy())])
            .unwrap();

        let attempt = run.attempt_for("3").unwrap();
        assert_eq!(attempt.status, ResolutionStatus::Failed);
        assert_eq!(attempt.metadata_str("failure_reason"), Some("retry limit reached"));
        assert_eq!(run.rounds, 2);
    }

    #[test]
    fn test_empty_taxonomy_entries_are_recorded() {
        let config = ResolutionConfig::default();
        let gateway = canis_gateway();
        let mut entries = create_test_entries();
        entries.push(Entry::new(
            "4",
            Taxonomy {
                genus: Some("unknown".to_string()),
                ..Taxonomy::default()
            },
        ));

        let run = Resolver::new(&config, &gateway).resolve_entries(entries.clone()).unwrap();
        assert_eq!(run.plan.skipped.len(), 1);
        let attempt = run.attempt_for("4").unwrap();
        assert_eq!(attempt.status, ResolutionStatus::EmptyInputTaxonomy);
        assert_eq!(attempt.query_group_key, run.plan.skipped[0]);

        let mut strict = ResolutionConfig::default();
        strict.fail_on_empty_taxonomy = true;
        assert!(Resolver::new(&strict, &gateway).resolve_entries(entries).is_err());
    }

    #[test]
    fn test_no_strategies_fails_every_group() {
        let config = ResolutionConfig::default();
        let gateway = canis_gateway();
        let run = Resolver::new(&config, &gateway)
            .with_strategies(StrategyManager::new())
            .resolve_entries(create_test_entries())
            .unwrap();

        for uuid in ["1", "2", "3"] {
            let attempt = run.attempt_for(uuid).unwrap();
            assert_eq!(attempt.status, ResolutionStatus::Failed);
            assert_eq!(attempt.metadata_str("failure_reason"), Some("no strategy could resolve"));
        }
    }

    #[test]
    fn test_resolve_path_with_cache() {
        let dir = tempfile::tempdir().unwrap();
        let input = dir.path().join("input");
        fs::create_dir_all(&input).unwrap();
        fs::write(
            input.join("entries.csv"),
            "uuid,scientific_name,common_name,kingdom,phylum,class,order,family,genus,species,source_dataset,source_id\n\
             1,,wolf,Animalia,Chordata,Mammalia,Carnivora,Canidae,Canis,Canis lupus,test,a\n\
             2,,wolf,Animalia,Chordata,Mammalia,Carnivora,Canidae,Canis,Canis lupus,test,b\n\
             3,,cat,Animalia,,,,Felidae,Felis,,test,c\n",
        )
        .unwrap();

        let cache = CacheClient::new(dir.path().join("cache"));
        cache.set_namespace("test");
        let config = ResolutionConfig::default();
        let gateway = canis_gateway();
        let resolver = Resolver::new(&config, &gateway).with_cache(&cache, false);

        let first = resolver.resolve_path(&input).unwrap();
        let second = resolver.resolve_path(&input).unwrap();
        assert_eq!(first.entry_groups, second.entry_groups);
        assert_eq!(cache.cache_stats().unwrap().entry_count, 2);

        let files = second.write_outputs(&dir.path().join("out")).unwrap();
        let resolved = fs::read_to_string(&files.resolved).unwrap();
        assert_eq!(resolved.lines().count(), 3);
        assert!(resolved.contains("EXACT_MATCH"));
        let unsolved = fs::read_to_string(&files.unsolved).unwrap();
        assert!(unsolved.contains("NO_MATCH"));
    }

    #[test]
    fn test_rerun_without_uuid_column_keeps_resolutions() {
        let dir = tempfile::tempdir().unwrap();
        let input = dir.path().join("entries.csv");
        fs::write(
            &input,
            "kingdom,genus,species\n\
             Animalia,Canis,Canis lupus\n\
             Animalia,Canis,Canis lupus\n",
        )
        .unwrap();

        let cache = CacheClient::new(dir.path().join("cache"));
        cache.set_namespace("test");
        let config = ResolutionConfig::default();
        let gateway = canis_gateway();
        let resolver = Resolver::new(&config, &gateway).with_cache(&cache, false);

        let first = resolver.resolve_path(&input).unwrap();
        let second = resolver.resolve_path(&input).unwrap();

        assert_eq!(first.statistics().resolved_entries, 2);
        assert_eq!(second.statistics().resolved_entries, 2);
        for entry in &second.entries {
            assert!(second.attempt_for(&entry.uuid).is_some());
        }
    }

    #[test]
    fn test_stale_cached_groups_are_recomputed() {
        let dir = tempfile::tempdir().unwrap();
        let input = dir.path().join("entries.csv");
        fs::write(&input, "uuid,genus,species\n1,Canis,Canis lupus\n").unwrap();

        let cache = CacheClient::new(dir.path().join("cache"));
        cache.set_namespace("test");
        let config = ResolutionConfig::default();
        let gateway = canis_gateway();
        let resolver = Resolver::new(&config, &gateway).with_cache(&cache, false);

        // Same file contents, but the cache holds groups for other ids
        let entries = vec![Entry::new("other", canis_taxonomy("Canis lupus"))];
        let stale = group_entries(&entries);
        let (key, checksum) = CachedFn::new("entry_groups")
            .key_and_checksum(&[("input", CacheArg::Path(input.clone()))]);
        cache.save_cache(&key, &stale, &checksum).unwrap();

        let run = resolver.resolve_path(&input).unwrap();
        assert!(run.attempt_for("1").is_some());
        assert!(run.entry_groups[0].entry_uuids.contains("1"));
    }

    #[test]
    fn test_gateway_placeholders_fail_groups() {
        struct BrokenGateway;
        impl VerificationGateway for BrokenGateway {
            fn execute(&self, terms: &[String]) -> Vec<VerificationResult> {
                vec![VerificationResult::placeholder(); terms.len()]
            }
        }

        let config = ResolutionConfig::default();
        let run = Resolver::new(&config, &BrokenGateway)
            .resolve_entries(create_test_entries())
            .unwrap();
        let attempt = run.attempt_for("1").unwrap();
        assert_eq!(attempt.status, ResolutionStatus::Failed);
        assert_eq!(attempt.metadata_str("failure_reason"), Some("empty verifier response"));
    }
}
