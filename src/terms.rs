use std::collections::{BTreeMap, HashMap, HashSet};
use std::path::Path;

use regex::Regex;

use crate::error::BatchError;

/// Normalize a term variant for lookup: trimmed, underscores as spaces, lowercase.
pub fn normalize_variant(s: &str) -> String {
    s.trim().replace('_', " ").to_lowercase()
}

fn snake_lower(s: &str) -> String {
    normalize_variant(s).replace(' ', "_")
}

/// One dictionary entry as written by users.
#[derive(Debug, Clone, PartialEq)]
pub struct TermEntry {
    pub term: String,
    pub weight: f64,
    pub synonyms: Vec<String>,
}

#[derive(Debug, Clone, PartialEq)]
struct Variant {
    snake: String,
    weight: f64,
}

/// Immutable lookup of weighted terms and their synonyms.
///
/// Built once and handed to whatever needs it; there is no global table.
#[derive(Debug, Clone)]
pub struct TermDictionary {
    entries: Vec<TermEntry>,
    lookup: HashMap<String, Variant>,
    pattern: Option<Regex>,
}

impl TermDictionary {
    pub fn from_entries(entries: Vec<TermEntry>) -> Result<Self, BatchError> {
        let mut lookup: HashMap<String, Variant> = HashMap::new();
        for entry in &entries {
            let variants = std::iter::once(&entry.term).chain(entry.synonyms.iter());
            for raw in variants {
                let key = normalize_variant(raw);
                if key.is_empty() {
                    continue;
                }
                let candidate = Variant {
                    snake: key.replace(' ', "_"),
                    weight: entry.weight,
                };
                let keep_existing = lookup
                    .get(&key)
                    .is_some_and(|existing| existing.weight >= candidate.weight);
                if !keep_existing {
                    lookup.insert(key, candidate);
                }
            }
        }

        let pattern = if lookup.is_empty() {
            None
        } else {
            let mut keys: Vec<&String> = lookup.keys().collect();
            keys.sort_by(|a, b| b.len().cmp(&a.len()).then_with(|| a.cmp(b)));
            let alternation = keys
                .iter()
                .map(|k| regex::escape(k))
                .collect::<Vec<_>>()
                .join("|");
            let re = Regex::new(&format!(r"(?i)\b({alternation})\b"))
                .map_err(|e| BatchError::Config(format!("invalid term dictionary: {e}")))?;
            Some(re)
        };

        Ok(Self {
            entries,
            lookup,
            pattern,
        })
    }

    /// Parse `{"Term": [weight, ["synonym", ...]], ...}`.
    pub fn from_json(json: &str) -> Result<Self, BatchError> {
        let raw: BTreeMap<String, (f64, Vec<String>)> = serde_json::from_str(json)
            .map_err(|e| BatchError::Config(format!("invalid term dictionary JSON: {e}")))?;
        let entries = raw
            .into_iter()
            .map(|(term, (weight, synonyms))| TermEntry {
                term,
                weight,
                synonyms,
            })
            .collect();
        Self::from_entries(entries)
    }

    pub fn load(path: &Path) -> Result<Self, BatchError> {
        let json = std::fs::read_to_string(path).map_err(|e| BatchError::Discovery {
            path: path.to_path_buf(),
            reason: e.to_string(),
        })?;
        Self::from_json(&json)
    }

    pub fn empty() -> Self {
        Self {
            entries: Vec::new(),
            lookup: HashMap::new(),
            pattern: None,
        }
    }

    pub fn entries(&self) -> &[TermEntry] {
        &self.entries
    }

    pub fn is_empty(&self) -> bool {
        self.lookup.is_empty()
    }

    /// Weight for a variant in any spelling, if known.
    pub fn weight_of(&self, variant: &str) -> Option<f64> {
        self.lookup.get(&normalize_variant(variant)).map(|v| v.weight)
    }

    /// Whether any known variant occurs as a whole word.
    pub fn contains_any(&self, text: &str) -> bool {
        self.pattern.as_ref().is_some_and(|re| re.is_match(text))
    }

    /// Keep every match verbatim and append `(snake_case:W.W)` after the
    /// first occurrence of each variant.
    pub fn apply_weighting(&self, text: &str) -> String {
        let Some(re) = &self.pattern else {
            return text.to_string();
        };

        let mut out = String::with_capacity(text.len() + 32);
        let mut seen: HashSet<String> = HashSet::new();
        let mut last = 0;
        for m in re.find_iter(text) {
            out.push_str(&text[last..m.start()]);
            let matched = m.as_str();
            out.push_str(matched);

            let key = normalize_variant(matched);
            let (snake, weight) = match self.lookup.get(&key) {
                Some(v) => (v.snake.clone(), v.weight),
                None => (snake_lower(matched), 1.0),
            };
            if seen.insert(snake.clone()) {
                out.push_str(&format!(" ({snake}:{weight:.1})"));
            }
            last = m.end();
        }
        out.push_str(&text[last..]);
        out
    }
}
