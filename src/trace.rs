// 🔎 Entry Trace - Follow one uuid through grouping, planning and resolution

use crate::attempts::{AttemptManager, ResolutionAttempt};
use crate::entry::{load_entries, Entry, Rank};
use crate::grouping::{group_entries, EntryGroup};
use crate::planner::{plan_queries, QueryGroup, QueryPlan};
use anyhow::{bail, Result};
use serde::{Deserialize, Serialize};
use std::fmt::Write;
use std::path::Path;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EntryTrace {
    pub entry: Entry,
    pub entry_group: Option<EntryGroup>,

    /// None when the entry group had no usable query term
    pub query_group: Option<QueryGroup>,

    /// Attempt chain, oldest first (empty without a saved attempt state)
    pub attempts: Vec<ResolutionAttempt>,

    pub note: Option<String>,
}

/// Trace `uuid` through already computed groups, plan and attempts
pub fn trace_entry(
    uuid: &str,
    entries: &[Entry],
    entry_groups: &[EntryGroup],
    plan: &QueryPlan,
    attempts: Option<&AttemptManager>,
) -> Option<EntryTrace> {
    let entry = entries.iter().find(|e| e.uuid == uuid)?.clone();

    let Some(entry_group) = entry_groups.iter().find(|g| g.entry_uuids.contains(uuid)) else {
        return Some(EntryTrace {
            entry,
            entry_group: None,
            query_group: None,
            attempts: Vec::new(),
            note: Some("entry group not found, trace stops at the raw entry".to_string()),
        });
    };

    let query_group = plan.group_for_entry_group(&entry_group.key).cloned();
    // Skipped entry groups carry their attempts under their own key
    let chain_key = query_group
        .as_ref()
        .map_or(entry_group.key.as_str(), |qg| qg.key.as_str());
    let chain: Vec<ResolutionAttempt> = attempts
        .map(|manager| manager.group_chain(chain_key).into_iter().cloned().collect())
        .unwrap_or_default();

    let note = match (&query_group, attempts) {
        (None, _) => Some("entry group has no usable query term".to_string()),
        (Some(_), None) => Some("no attempt state loaded".to_string()),
        (Some(_), Some(_)) if chain.is_empty() => {
            Some("no resolution attempts recorded for this query group".to_string())
        }
        _ => None,
    };

    Some(EntryTrace {
        entry,
        entry_group: Some(entry_group.clone()),
        query_group,
        attempts: chain,
        note,
    })
}

/// Load, group and plan `input`, then trace `uuid`
pub fn trace_from_input(
    input: &Path,
    uuid: &str,
    data_source_id: u32,
    attempts: Option<&AttemptManager>,
) -> Result<EntryTrace> {
    let batch = load_entries(input)?;
    let groups = group_entries(&batch.entries);
    let plan = plan_queries(&groups, data_source_id);

    match trace_entry(uuid, &batch.entries, &groups, &plan, attempts) {
        Some(trace) => Ok(trace),
        None => bail!("No entry found with uuid {}", uuid),
    }
}

fn or_dash(value: Option<&str>) -> &str {
    value.unwrap_or("-")
}

impl EntryTrace {
    pub fn render_text(&self) -> String {
        let mut out = String::new();

        let _ = writeln!(out, "--- ENTRY ---");
        let _ = writeln!(out, "uuid: {}", self.entry.uuid);
        let _ = writeln!(out, "common_name: {}", or_dash(self.entry.common_name.as_deref()));
        for rank in Rank::LINNAEAN.iter().chain([Rank::ScientificName].iter()) {
            let _ = writeln!(out, "{}: {}", rank, or_dash(self.entry.taxonomy.get(*rank)));
        }

        let _ = writeln!(out, "\n--- ENTRY GROUP ---");
        match &self.entry_group {
            Some(group) => {
                let _ = writeln!(out, "key: {}", group.key);
                let _ = writeln!(out, "entries: {}", group.group_count());
            }
            None => {
                let _ = writeln!(out, "No group found for this entry.");
            }
        }

        if let Some(query_group) = &self.query_group {
            let _ = writeln!(out, "\n--- QUERY GROUP ---");
            let _ = writeln!(out, "key: {}", query_group.key);
            let _ = writeln!(out, "term: {}", query_group.term());
            let _ = writeln!(out, "rank: {}", query_group.rank());
            let _ = writeln!(out, "data_source_id: {}", query_group.query.data_source_id);
            let _ = writeln!(out, "entry_groups: {}", query_group.entry_group_keys.len());
        }

        if !self.attempts.is_empty() {
            let _ = writeln!(out, "\n--- ATTEMPTS ---");
            for (i, attempt) in self.attempts.iter().enumerate() {
                let _ = writeln!(
                    out,
                    "{}. {} '{}' ({}) via {}",
                    i + 1,
                    attempt.status,
                    attempt.query.term,
                    attempt.query.rank,
                    attempt.strategy.as_deref().unwrap_or("-")
                );
                if let Some(reason) = attempt
                    .metadata_str("failure_reason")
                    .or_else(|| attempt.metadata_str("reason_for_retry"))
                {
                    let _ = writeln!(out, "   {}", reason);
                }
            }
        }

        if let Some(note) = &self.note {
            let _ = writeln!(out, "\nNote: {}", note);
        }
        out
    }
}
