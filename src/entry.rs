// 🧬 Taxonomic Entries - Raw input records + CSV loading
// An Entry is created once while parsing and never mutated afterwards.

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use tracing::{debug, info, warn};
use walkdir::WalkDir;

/// Values that mean "no data" in source datasets (compared case-insensitively)
pub const PLACEHOLDER_VALUES: [&str; 5] = ["unknown", "null", "none", "", "n/a"];

/// True when a field carries a usable taxonomic name
pub fn is_valid_value(value: &str) -> bool {
    let normalized = value.trim().to_lowercase();
    !PLACEHOLDER_VALUES.contains(&normalized.as_str())
}

// ============================================================================
// RANK
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Rank {
    Kingdom,
    Phylum,
    Class,
    Order,
    Family,
    Genus,
    Species,
    /// Free-text name; only ever a query rank, never a classification rank
    ScientificName,
}

impl Rank {
    /// The seven standard Linnaean ranks, broadest first
    pub const LINNAEAN: [Rank; 7] = [
        Rank::Kingdom,
        Rank::Phylum,
        Rank::Class,
        Rank::Order,
        Rank::Family,
        Rank::Genus,
        Rank::Species,
    ];

    /// Query term precedence, most specific first
    pub const QUERY_PRECEDENCE: [Rank; 8] = [
        Rank::Species,
        Rank::ScientificName,
        Rank::Genus,
        Rank::Family,
        Rank::Order,
        Rank::Class,
        Rank::Phylum,
        Rank::Kingdom,
    ];

    /// Label used by the verifier and in query plans
    pub fn as_str(&self) -> &'static str {
        match self {
            Rank::Kingdom => "kingdom",
            Rank::Phylum => "phylum",
            Rank::Class => "class",
            Rank::Order => "order",
            Rank::Family => "family",
            Rank::Genus => "genus",
            Rank::Species => "species",
            Rank::ScientificName => "scientific_name",
        }
    }

    /// Key used in resolved classifications ("class" is reserved downstream)
    pub fn field_name(&self) -> &'static str {
        match self {
            Rank::Class => "class_",
            other => other.as_str(),
        }
    }

    /// Parse a verifier rank label; accepts both "class" and "class_"
    pub fn from_label(label: &str) -> Option<Rank> {
        match label.trim().to_lowercase().as_str() {
            "kingdom" => Some(Rank::Kingdom),
            "phylum" => Some(Rank::Phylum),
            "class" | "class_" => Some(Rank::Class),
            "order" => Some(Rank::Order),
            "family" => Some(Rank::Family),
            "genus" => Some(Rank::Genus),
            "species" => Some(Rank::Species),
            "scientific_name" => Some(Rank::ScientificName),
            _ => None,
        }
    }

    pub fn is_linnaean(&self) -> bool {
        !matches!(self, Rank::ScientificName)
    }
}

impl std::fmt::Display for Rank {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

// ============================================================================
// TAXONOMY
// ============================================================================

/// The eight taxonomic fields shared by entries and entry groups
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Taxonomy {
    pub kingdom: Option<String>,
    pub phylum: Option<String>,
    pub class_: Option<String>,
    pub order: Option<String>,
    pub family: Option<String>,
    pub genus: Option<String>,
    pub species: Option<String>,
    pub scientific_name: Option<String>,
}

impl Taxonomy {
    pub fn get(&self, rank: Rank) -> Option<&str> {
        let value = match rank {
            Rank::Kingdom => &self.kingdom,
            Rank::Phylum => &self.phylum,
            Rank::Class => &self.class_,
            Rank::Order => &self.order,
            Rank::Family => &self.family,
            Rank::Genus => &self.genus,
            Rank::Species => &self.species,
            Rank::ScientificName => &self.scientific_name,
        };
        value.as_deref()
    }

    /// Value at `rank` if it is a usable name, trimmed
    pub fn valid(&self, rank: Rank) -> Option<&str> {
        self.get(rank)
            .filter(|v| is_valid_value(v))
            .map(|v| v.trim())
    }

    /// Normalized signature: seven ranks + scientific name, pipe-joined, lowercase
    pub fn signature(&self) -> String {
        Rank::LINNAEAN
            .iter()
            .chain(std::iter::once(&Rank::ScientificName))
            .map(|rank| self.get(*rank).unwrap_or(""))
            .collect::<Vec<_>>()
            .join("|")
            .to_lowercase()
    }

    /// First valid field in query precedence order
    pub fn most_specific(&self) -> Option<(Rank, &str)> {
        Rank::QUERY_PRECEDENCE
            .iter()
            .find_map(|rank| self.valid(*rank).map(|v| (*rank, v)))
    }

    /// Next valid field strictly less specific than `after`
    pub fn next_less_specific(&self, after: Rank) -> Option<(Rank, &str)> {
        Rank::QUERY_PRECEDENCE
            .iter()
            .skip_while(|rank| **rank != after)
            .skip(1)
            .find_map(|rank| self.valid(*rank).map(|v| (*rank, v)))
    }

    /// Linnaean ranks the input already knows, keyed by classification field name
    pub fn known_ranks(&self) -> BTreeMap<&'static str, &str> {
        Rank::LINNAEAN
            .iter()
            .filter_map(|rank| self.valid(*rank).map(|v| (rank.field_name(), v)))
            .collect()
    }

    pub fn has_taxonomic_data(&self) -> bool {
        Rank::LINNAEAN.iter().any(|rank| self.valid(*rank).is_some())
    }
}

// ============================================================================
// ENTRY
// ============================================================================

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Entry {
    /// Stable identity carried through to the output
    pub uuid: String,

    pub common_name: Option<String>,

    pub taxonomy: Taxonomy,

    // Provenance
    pub source_dataset: Option<String>,
    pub source_id: Option<String>,
}

impl Entry {
    pub fn new(uuid: impl Into<String>, taxonomy: Taxonomy) -> Self {
        Entry {
            uuid: uuid.into(),
            common_name: None,
            taxonomy,
            source_dataset: None,
            source_id: None,
        }
    }
}

/// Row layout of input CSV files
#[derive(Debug, Deserialize)]
struct EntryRecord {
    #[serde(default)]
    uuid: Option<String>,
    #[serde(default)]
    scientific_name: Option<String>,
    #[serde(default)]
    common_name: Option<String>,
    #[serde(default)]
    kingdom: Option<String>,
    #[serde(default)]
    phylum: Option<String>,
    #[serde(default, rename = "class")]
    class_: Option<String>,
    #[serde(default)]
    order: Option<String>,
    #[serde(default)]
    family: Option<String>,
    #[serde(default)]
    genus: Option<String>,
    #[serde(default)]
    species: Option<String>,
    #[serde(default)]
    source_dataset: Option<String>,
    #[serde(default)]
    source_id: Option<String>,
}

fn clean(value: Option<String>) -> Option<String> {
    value.and_then(|v| {
        let trimmed = v.trim();
        if trimmed.is_empty() {
            None
        } else {
            Some(trimmed.to_string())
        }
    })
}

/// Id for a row that has none. A v5 UUID over (file scope, row), so reloading
/// the same file yields the same ids and cached groups stay valid.
pub fn generated_uuid(scope: &str, row: usize) -> String {
    uuid::Uuid::new_v5(&uuid::Uuid::NAMESPACE_URL, format!("{}#{}", scope, row).as_bytes())
        .to_string()
}

impl EntryRecord {
    fn into_entry(self, scope: &str, row: usize) -> Entry {
        Entry {
            uuid: clean(self.uuid).unwrap_or_else(|| generated_uuid(scope, row)),
            common_name: clean(self.common_name),
            taxonomy: Taxonomy {
                kingdom: clean(self.kingdom),
                phylum: clean(self.phylum),
                class_: clean(self.class_),
                order: clean(self.order),
                family: clean(self.family),
                genus: clean(self.genus),
                species: clean(self.species),
                scientific_name: clean(self.scientific_name),
            },
            source_dataset: clean(self.source_dataset),
            source_id: clean(self.source_id),
        }
    }
}

// ============================================================================
// INPUT PARSING
// ============================================================================

/// Everything the parser produced for one input path
#[derive(Debug, Default)]
pub struct InputBatch {
    pub entries: Vec<Entry>,

    /// Files that loaded successfully
    pub files: Vec<PathBuf>,

    /// Files skipped because they failed to parse, with the reason
    pub skipped: Vec<(PathBuf, String)>,
}

impl InputBatch {
    pub fn total_count(&self) -> usize {
        self.entries.len()
    }
}

/// A single CSV file, or every CSV file under a directory (sorted)
pub fn find_input_files(input: &Path) -> Result<Vec<PathBuf>> {
    if input.is_file() {
        return Ok(vec![input.to_path_buf()]);
    }
    if !input.is_dir() {
        anyhow::bail!("Input path does not exist: {:?}", input);
    }

    let mut files = Vec::new();
    for entry in WalkDir::new(input).follow_links(true) {
        let entry = entry.with_context(|| format!("Failed to walk input directory {:?}", input))?;
        let path = entry.path();
        if path.is_file()
            && path
                .extension()
                .map_or(false, |ext| ext.eq_ignore_ascii_case("csv"))
        {
            files.push(path.to_path_buf());
        }
    }
    files.sort();
    Ok(files)
}

pub fn load_entries_from_file(path: &Path) -> Result<Vec<Entry>> {
    let scope = path
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_default();
    load_scoped(path, &scope)
}

/// `scope` names the file in generated ids (path relative to the input root)
fn load_scoped(path: &Path, scope: &str) -> Result<Vec<Entry>> {
    let mut rdr = csv::Reader::from_path(path)
        .with_context(|| format!("Failed to open CSV file {:?}", path))?;

    let mut entries = Vec::new();
    for (line, result) in rdr.deserialize::<EntryRecord>().enumerate() {
        let record = result
            .with_context(|| format!("Failed to deserialize entry at row {} of {:?}", line + 1, path))?;
        entries.push(record.into_entry(scope, line));
    }
    Ok(entries)
}

/// Load every input file; a file that fails to parse is skipped, not fatal
pub fn load_entries(input: &Path) -> Result<InputBatch> {
    let files = find_input_files(input)?;
    let mut batch = InputBatch::default();

    for file in files {
        let scope = match file.strip_prefix(input) {
            Ok(rel) if !rel.as_os_str().is_empty() => rel.to_string_lossy().into_owned(),
            _ => file
                .file_name()
                .map(|n| n.to_string_lossy().into_owned())
                .unwrap_or_default(),
        };
        match load_scoped(&file, &scope) {
            Ok(entries) => {
                debug!("Loaded {} entries from {:?}", entries.len(), file);
                batch.entries.extend(entries);
                batch.files.push(file);
            }
            Err(e) => {
                warn!("Skipping input file {:?}: {:#}", file, e);
                batch.skipped.push((file, format!("{:#}", e)));
            }
        }
    }

    info!(
        "Loaded {} entries from {} file(s) ({} skipped)",
        batch.total_count(),
        batch.files.len(),
        batch.skipped.len()
    );
    Ok(batch)
}

// ============================================================================
// TESTS
// ============================================================================
