// 🧮 Fingerprint Index - Group entries by normalized taxonomy
// One pass over the entries; identical signatures collapse into one EntryGroup.

use crate::entry::{Entry, Rank, Taxonomy};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::collections::{BTreeMap, BTreeSet};
use tracing::info;

// ============================================================================
// ENTRY GROUP
// ============================================================================

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EntryGroup {
    /// SHA-256 hex digest of the normalized taxonomy signature
    pub key: String,

    /// Member entry UUIDs
    pub entry_uuids: BTreeSet<String>,

    /// Taxonomy of the first entry seen with this signature
    pub taxonomy: Taxonomy,
}

impl EntryGroup {
    pub fn group_count(&self) -> usize {
        self.entry_uuids.len()
    }

    /// Most specific usable (rank, term), if any
    pub fn most_specific_term(&self) -> Option<(Rank, &str)> {
        self.taxonomy.most_specific()
    }

    /// Linnaean ranks the input knows, keyed by classification field name
    pub fn known_ranks(&self) -> BTreeMap<&'static str, &str> {
        self.taxonomy.known_ranks()
    }
}

/// Deterministic content key for a taxonomy
pub fn group_key(taxonomy: &Taxonomy) -> String {
    let mut hasher = Sha256::new();
    hasher.update(taxonomy.signature().as_bytes());
    format!("{:x}", hasher.finalize())
}

/// Build entry groups, sorted by key
pub fn group_entries(entries: &[Entry]) -> Vec<EntryGroup> {
    let mut groups: BTreeMap<String, EntryGroup> = BTreeMap::new();

    for entry in entries {
        let key = group_key(&entry.taxonomy);
        groups
            .entry(key.clone())
            .or_insert_with(|| EntryGroup {
                key,
                entry_uuids: BTreeSet::new(),
                taxonomy: entry.taxonomy.clone(),
            })
            .entry_uuids
            .insert(entry.uuid.clone());
    }

    info!(
        "Grouped {} entries into {} entry groups",
        entries.len(),
        groups.len()
    );
    groups.into_values().collect()
}

// ============================================================================
// TESTS
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    fn create_test_entry(uuid: &str, genus: &str, species: &str) -> Entry {
        Entry::new(
            uuid,
            Taxonomy {
                kingdom: Some("Animalia".to_string()),
                genus: Some(genus.to_string()),
                species: Some(species.to_string()),
                ..Taxonomy::default()
            },
        )
    }

    #[test]
    fn test_identical_taxonomy_collapses() {
        let entries = vec![
            create_test_entry("1", "Canis", "Canis lupus"),
            create_test_entry("2", "CANIS", "canis lupus"),
            create_test_entry("3", "Felis", "Felis catus"),
        ];

        let groups = group_entries(&entries);
        assert_eq!(groups.len(), 2);

        let canis = groups
            .iter()
            .find(|g| g.entry_uuids.contains("1"))
            .unwrap();
        assert_eq!(canis.group_count(), 2);
        assert!(canis.entry_uuids.contains("2"));
        // First entry seen is the representative
        assert_eq!(canis.taxonomy.genus.as_deref(), Some("Canis"));
        assert_eq!(
            canis.most_specific_term(),
            Some((Rank::Species, "Canis lupus"))
        );
    }

    #[test]
    fn test_groups_sorted_by_key() {
        let entries = vec![
            create_test_entry("1", "Canis", "Canis lupus"),
            create_test_entry("2", "Felis", "Felis catus"),
            create_test_entry("3", "Ursus", "Ursus arctos"),
        ];
        let groups = group_entries(&entries);
        let keys: Vec<_> = groups.iter().map(|g| g.key.clone()).collect();
        let mut sorted = keys.clone();
        sorted.sort();
        assert_eq!(keys, sorted);
    }

    #[test]
    fn test_group_key_is_sha256_of_signature() {
        let taxonomy = Taxonomy::default();
        // sha256("|||||||")
        let mut hasher = Sha256::new();
        hasher.update(b"|||||||");
        assert_eq!(group_key(&taxonomy), format!("{:x}", hasher.finalize()));
        assert_eq!(group_key(&taxonomy).len(), 64);
    }

    #[test]
    fn test_empty_input() {
        assert!(group_entries(&[]).is_empty());
    }

    fn arb_entries() -> impl Strategy<Value = Vec<Entry>> {
        let genus = prop::sample::select(vec!["Canis", "canis", "Felis", "Ursus", "unknown"]);
        let species = prop::sample::select(vec!["lupus", "catus", "arctos", ""]);
        prop::collection::vec((genus, species), 0..40).prop_map(|pairs| {
            pairs
                .into_iter()
                .enumerate()
                .map(|(i, (g, s))| create_test_entry(&i.to_string(), g, s))
                .collect()
        })
    }

    proptest! {
        #[test]
        fn prop_grouping_is_order_independent(entries in arb_entries(), seed in any::<u64>()) {
            let mut shuffled = entries.clone();
            // Deterministic rotation stands in for a shuffle
            if !shuffled.is_empty() {
                let k = (seed as usize) % shuffled.len();
                shuffled.rotate_left(k);
                shuffled.reverse();
            }

            let a: Vec<_> = group_entries(&entries)
                .into_iter()
                .map(|g| (g.key, g.entry_uuids))
                .collect();
            let b: Vec<_> = group_entries(&shuffled)
                .into_iter()
                .map(|g| (g.key, g.entry_uuids))
                .collect();
            prop_assert_eq!(a, b);
        }

        #[test]
        fn prop_groups_partition_entries(entries in arb_entries()) {
            let groups = group_entries(&entries);

            let mut seen = BTreeSet::new();
            for group in &groups {
                for uuid in &group.entry_uuids {
                    // Disjoint: no uuid appears in two groups
                    prop_assert!(seen.insert(uuid.clone()));
                }
            }
            let all: BTreeSet<_> = entries.iter().map(|e| e.uuid.clone()).collect();
            prop_assert_eq!(seen, all);
        }
    }
}
