// 🗺️ Query Planner - One query term per entry group, merged into query groups
// Entry groups that would send the same (term, rank, source) to the verifier
// share a single QueryGroup.

use crate::entry::Rank;
use crate::grouping::EntryGroup;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::collections::{BTreeMap, BTreeSet, HashMap};
use tracing::{info, warn};

// ============================================================================
// QUERY PARAMETERS
// ============================================================================

/// What gets sent to the verifier for one query group
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct QueryParameters {
    pub term: String,
    pub rank: Rank,
    pub data_source_id: u32,
}

// ============================================================================
// QUERY GROUP
// ============================================================================

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct QueryGroup {
    pub key: String,

    /// Entry groups served by this query
    pub entry_group_keys: BTreeSet<String>,

    pub query: QueryParameters,
}

impl QueryGroup {
    pub fn term(&self) -> &str {
        &self.query.term
    }

    pub fn rank(&self) -> Rank {
        self.query.rank
    }
}

/// SHA-256 over sorted entry-group keys, term, rank and data source
pub fn query_group_key(entry_group_keys: &BTreeSet<String>, query: &QueryParameters) -> String {
    let mut hasher = Sha256::new();
    for key in entry_group_keys {
        hasher.update(key.as_bytes());
        hasher.update(b",");
    }
    hasher.update(b"|");
    hasher.update(query.term.as_bytes());
    hasher.update(b"|");
    hasher.update(query.rank.as_str().as_bytes());
    hasher.update(b"|");
    hasher.update(query.data_source_id.to_string().as_bytes());
    format!("{:x}", hasher.finalize())
}

// ============================================================================
// PLANNING
// ============================================================================

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct QueryPlan {
    /// Sorted by key
    pub query_groups: Vec<QueryGroup>,

    /// Entry groups with no usable term at any rank
    pub skipped: Vec<String>,
}

impl QueryPlan {
    pub fn find(&self, key: &str) -> Option<&QueryGroup> {
        self.query_groups
            .binary_search_by(|g| g.key.as_str().cmp(key))
            .ok()
            .map(|i| &self.query_groups[i])
    }

    /// Query group by key, for lookups inside a resolution run
    pub fn index(&self) -> HashMap<&str, &QueryGroup> {
        self.query_groups.iter().map(|g| (g.key.as_str(), g)).collect()
    }

    /// Query group that contains an entry group
    pub fn group_for_entry_group(&self, entry_group_key: &str) -> Option<&QueryGroup> {
        self.query_groups
            .iter()
            .find(|g| g.entry_group_keys.contains(entry_group_key))
    }
}

pub fn plan_queries(entry_groups: &[EntryGroup], data_source_id: u32) -> QueryPlan {
    let mut merged: BTreeMap<(String, Rank), BTreeSet<String>> = BTreeMap::new();
    let mut skipped = Vec::new();

    for group in entry_groups {
        match group.most_specific_term() {
            Some((rank, term)) => {
                merged
                    .entry((term.to_string(), rank))
                    .or_default()
                    .insert(group.key.clone());
            }
            None => {
                warn!(
                    "Entry group {} has no valid taxonomic data ({} entries), skipping",
                    &group.key[..group.key.len().min(12)],
                    group.group_count()
                );
                skipped.push(group.key.clone());
            }
        }
    }

    let mut query_groups: Vec<QueryGroup> = merged
        .into_iter()
        .map(|((term, rank), entry_group_keys)| {
            let query = QueryParameters {
                term,
                rank,
                data_source_id,
            };
            QueryGroup {
                key: query_group_key(&entry_group_keys, &query),
                entry_group_keys,
                query,
            }
        })
        .collect();
    query_groups.sort_by(|a, b| a.key.cmp(&b.key));

    info!(
        "Planned {} query groups from {} entry groups ({} skipped)",
        query_groups.len(),
        entry_groups.len(),
        skipped.len()
    );

    QueryPlan {
        query_groups,
        skipped,
    }
}

// ============================================================================
// TESTS
// ============================================================================
