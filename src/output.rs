// 📤 Output - Per-entry resolution records + run statistics
// resolved.csv / unsolved.csv carry the input fields with resolved ranks
// substituted; resolution_stats.json summarizes the attempt history.

use crate::attempts::{AttemptManager, AttemptStatistics, ResolutionAttempt};
use crate::entry::{Entry, Rank};
use crate::grouping::EntryGroup;
use crate::planner::QueryGroup;
use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fs;
use std::path::{Path, PathBuf};
use tracing::{info, warn};

pub const RESOLVED_FILE: &str = "resolved.csv";
pub const UNSOLVED_FILE: &str = "unsolved.csv";
pub const STATS_FILE: &str = "resolution_stats.json";

// ============================================================================
// ENTRY → ATTEMPT MAPPING
// ============================================================================

/// Latest attempt for every entry, through its entry group and query group.
/// Entry groups that never got a query fall back to attempts keyed by their
/// own key (EMPTY_INPUT_TAXONOMY).
pub fn map_entries_to_attempts(
    entry_groups: &[EntryGroup],
    query_groups: &[QueryGroup],
    manager: &AttemptManager,
) -> HashMap<String, ResolutionAttempt> {
    let group_map: HashMap<&str, &EntryGroup> =
        entry_groups.iter().map(|g| (g.key.as_str(), g)).collect();
    let mut uuid_to_attempt = HashMap::new();

    for query_group in query_groups {
        let Some(latest) = manager.latest_attempt(&query_group.key) else {
            warn!("No resolution attempt for query group '{}'", query_group.term());
            continue;
        };
        for entry_group_key in &query_group.entry_group_keys {
            match group_map.get(entry_group_key.as_str()) {
                Some(group) => {
                    for uuid in &group.entry_uuids {
                        uuid_to_attempt.insert(uuid.clone(), latest.clone());
                    }
                }
                None => warn!("Entry group {} not found", entry_group_key),
            }
        }
    }

    for group in entry_groups {
        if let Some(attempt) = manager.latest_attempt(&group.key) {
            for uuid in &group.entry_uuids {
                uuid_to_attempt
                    .entry(uuid.clone())
                    .or_insert_with(|| attempt.clone());
            }
        }
    }

    info!("Mapped resolution results to {} entries", uuid_to_attempt.len());
    uuid_to_attempt
}

// ============================================================================
// OUTPUT RECORD
// ============================================================================

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OutputRecord {
    pub uuid: String,
    pub scientific_name: String,
    pub common_name: String,
    pub kingdom: String,
    pub phylum: String,
    #[serde(rename = "class")]
    pub class_: String,
    pub order: String,
    pub family: String,
    pub genus: String,
    pub species: String,
    pub source_dataset: String,
    pub source_id: String,
    pub resolution_status: String,
    /// RESOLVED or UNSOLVED
    pub resolution_path: String,
    pub resolution_strategy: String,
}

impl OutputRecord {
    pub fn is_resolved(&self) -> bool {
        self.resolution_path == "RESOLVED"
    }
}

/// Input fields, with ranks from a resolved classification taking precedence
pub fn map_entry_to_output(entry: &Entry, attempt: Option<&ResolutionAttempt>) -> OutputRecord {
    let resolved = attempt.and_then(|a| a.resolved_classification.as_ref());
    let rank_value = |rank: Rank| -> String {
        resolved
            .and_then(|c| c.get(rank.field_name()))
            .cloned()
            .or_else(|| entry.taxonomy.get(rank).map(str::to_string))
            .unwrap_or_default()
    };

    let successful = attempt.map_or(false, |a| a.status.is_successful());

    OutputRecord {
        uuid: entry.uuid.clone(),
        scientific_name: entry.taxonomy.scientific_name.clone().unwrap_or_default(),
        common_name: entry.common_name.clone().unwrap_or_default(),
        kingdom: rank_value(Rank::Kingdom),
        phylum: rank_value(Rank::Phylum),
        class_: rank_value(Rank::Class),
        order: rank_value(Rank::Order),
        family: rank_value(Rank::Family),
        genus: rank_value(Rank::Genus),
        species: rank_value(Rank::Species),
        source_dataset: entry.source_dataset.clone().unwrap_or_default(),
        source_id: entry.source_id.clone().unwrap_or_default(),
        resolution_status: attempt.map(|a| a.status.as_str().to_string()).unwrap_or_default(),
        resolution_path: if successful { "RESOLVED" } else { "UNSOLVED" }.to_string(),
        resolution_strategy: attempt
            .and_then(|a| a.strategy.clone())
            .unwrap_or_default(),
    }
}

// ============================================================================
// RUN STATISTICS
// ============================================================================

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct RunStatistics {
    pub total_entries: usize,
    pub entry_groups: usize,
    pub query_groups: usize,

    /// Entry groups with no usable query term
    pub skipped_entry_groups: usize,

    pub resolved_entries: usize,
    pub unsolved_entries: usize,
    pub attempts: AttemptStatistics,
}

// ============================================================================
// WRITERS
// ============================================================================

#[derive(Debug, Clone)]
pub struct OutputFiles {
    pub resolved: PathBuf,
    pub unsolved: PathBuf,
    pub stats: PathBuf,
}

fn write_records(path: &Path, records: &[&OutputRecord]) -> Result<()> {
    let mut writer = csv::Writer::from_path(path)
        .with_context(|| format!("Failed to create {:?}", path))?;
    for record in records {
        writer
            .serialize(record)
            .with_context(|| format!("Failed to write record to {:?}", path))?;
    }
    writer.flush().with_context(|| format!("Failed to flush {:?}", path))?;
    Ok(())
}

/// Split records into resolved / unsolved CSV files and write the statistics
pub fn write_outputs(
    output_dir: &Path,
    records: &[OutputRecord],
    stats: &RunStatistics,
) -> Result<OutputFiles> {
    fs::create_dir_all(output_dir)
        .with_context(|| format!("Failed to create output directory {:?}", output_dir))?;

    let files = OutputFiles {
        resolved: output_dir.join(RESOLVED_FILE),
        unsolved: output_dir.join(UNSOLVED_FILE),
        stats: output_dir.join(STATS_FILE),
    };

    let (resolved, unsolved): (Vec<&OutputRecord>, Vec<&OutputRecord>) =
        records.iter().partition(|r| r.is_resolved());

    write_records(&files.resolved, &resolved)?;
    write_records(&files.unsolved, &unsolved)?;

    let json = serde_json::to_string_pretty(stats).context("Failed to serialize statistics")?;
    fs::write(&files.stats, json)
        .with_context(|| format!("Failed to write statistics to {:?}", files.stats))?;

    info!(
        "Wrote {} resolved and {} unsolved entries to {:?}",
        resolved.len(),
        unsolved.len(),
        output_dir
    );
    Ok(files)
}

// ============================================================================
// TESTS
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::attempts::{AttemptDraft, ResolutionStatus};
    use crate::entry::Taxonomy;
    use crate::planner::QueryParameters;
    use std::collections::BTreeMap;

    fn create_test_entry(uuid: &str) -> Entry {
        Entry::new(
            uuid,
            Taxonomy {
                kingdom: Some("Animalia".to_string()),
                genus: Some("canis".to_string()),
                species: Some("Canis lupus".to_string()),
                ..Taxonomy::default()
            },
        )
    }

    fn create_test_attempt(status: ResolutionStatus, classification: Option<BTreeMap<String, String>>) -> ResolutionAttempt {
        let mut manager = AttemptManager::new();
        let mut draft = AttemptDraft::new(
            "qg",
            QueryParameters {
                term: "Canis lupus".to_string(),
                rank: Rank::Species,
                data_source_id: 11,
            },
            status,
        )
        .with_strategy("SingularExactMatch");
        draft.resolved_classification = classification;
        manager.create_attempt(draft).clone()
    }

    #[test]
    fn test_resolved_ranks_override_input() {
        let classification: BTreeMap<String, String> = [
            ("class_", "Mammalia"),
            ("genus", "Canis"),
        ]
        .into_iter()
        .map(|(k, v)| (k.to_string(), v.to_string()))
        .collect();
        let attempt = create_test_attempt(ResolutionStatus::SingularExactMatch, Some(classification));

        let record = map_entry_to_output(&create_test_entry("1"), Some(&attempt));
        assert_eq!(record.class_, "Mammalia");
        assert_eq!(record.genus, "Canis");
        // Not in the classification: keeps the input value
        assert_eq!(record.kingdom, "Animalia");
        assert_eq!(record.resolution_status, "SINGULAR_EXACT_MATCH");
        assert_eq!(record.resolution_strategy, "SingularExactMatch");
        assert!(record.is_resolved());
    }

    #[test]
    fn test_unresolved_entries() {
        let attempt = create_test_attempt(ResolutionStatus::NoMatch, None);
        let record = map_entry_to_output(&create_test_entry("1"), Some(&attempt));
        assert_eq!(record.resolution_path, "UNSOLVED");
        assert_eq!(record.genus, "canis");

        let record = map_entry_to_output(&create_test_entry("2"), None);
        assert_eq!(record.resolution_status, "");
        assert!(!record.is_resolved());
    }

    #[test]
    fn test_write_outputs() {
        let dir = tempfile::tempdir().unwrap();
        let resolved = create_test_attempt(ResolutionStatus::ExactMatch, Some(BTreeMap::new()));
        let records = vec![
            map_entry_to_output(&create_test_entry("1"), Some(&resolved)),
            map_entry_to_output(&create_test_entry("2"), None),
            map_entry_to_output(&create_test_entry("3"), None),
        ];
        let stats = RunStatistics {
            total_entries: 3,
            resolved_entries: 1,
            unsolved_entries: 2,
            ..RunStatistics::default()
        };

        let files = write_outputs(&dir.path().join("out"), &records, &stats).unwrap();

        let mut rdr = csv::Reader::from_path(&files.unsolved).unwrap();
        let unsolved: Vec<OutputRecord> = rdr.deserialize().map(|r| r.unwrap()).collect();
        assert_eq!(unsolved.len(), 2);

        let headers = csv::Reader::from_path(&files.resolved)
            .unwrap()
            .headers()
            .unwrap()
            .clone();
        assert!(headers.iter().any(|h| h == "class"));

        let written: RunStatistics =
            serde_json::from_str(&fs::read_to_string(&files.stats).unwrap()).unwrap();
        assert_eq!(written, stats);
    }
}
