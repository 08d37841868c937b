//! LoRA dataset preparation.
//!
//! Turns a metadata CSV (one row per image, with human and model
//! descriptions plus tag-like columns) into `caption.txt` + image pairs.
//! Captions are built by a [`CaptionComposer`] from explicit
//! [`CaptionRules`] and a [`TermDictionary`]; nothing is read from globals.

use std::collections::{HashMap, HashSet};
use std::fs;
use std::path::{Component, Path, PathBuf};

use regex::Regex;
use serde::Serialize;

use crate::error::BatchError;
use crate::terms::{normalize_variant, TermDictionary};

/// One metadata row, keyed by column name.
pub type MetadataRow = HashMap<String, String>;

/// What goes into a training caption and what gets scrubbed out.
#[derive(Debug, Clone)]
pub struct CaptionRules {
    /// Description columns, first non-empty one wins.
    pub primary_fields: Vec<String>,
    /// Columns holding `;` or `,` separated terms appended after the description.
    pub term_source_fields: Vec<String>,
    /// Sentences mentioning any of these are dropped.
    pub issue_terms: Vec<String>,
    /// Phrases removed wherever they appear.
    pub junk_phrases: Vec<String>,
    /// Activation token placed at the start of every caption.
    pub trigger_word: Option<String>,
    /// Appended when the caption does not already mention it.
    pub mandatory_concept: Option<String>,
}

fn strings(items: &[&str]) -> Vec<String> {
    items.iter().map(|s| s.to_string()).collect()
}

impl Default for CaptionRules {
    fn default() -> Self {
        Self {
            primary_fields: strings(&["llm_description", "human_description"]),
            term_source_fields: strings(&[
                "category",
                "attributes",
                "tags",
                "composition",
                "mood",
                "palette",
                "notes",
            ]),
            issue_terms: strings(&[
                "blur",
                "blurry",
                "blurred",
                "blur_noise",
                "noise",
                "noisy",
                "artifact",
                "artifacts",
                "artifacting",
                "watermark",
                "watermarked",
                "watermark_text",
                "cropped",
                "crop",
                "duplicate",
                "duplicated",
                "jpeg",
                "compression",
                "banding",
                "pixelation",
                "pixelated",
            ]),
            junk_phrases: strings(&[
                "other category",
                "other tags",
                "other attributes",
                "other mood",
                "other palette",
                "other composition",
                "misc",
                "miscellaneous",
                "bad quality",
            ]),
            trigger_word: None,
            mandatory_concept: None,
        }
    }
}

// ── Text helpers ──

/// Trim, unquote, collapse whitespace, capitalize, and end with punctuation.
/// Placeholder values such as `nan` or `None` become empty.
pub fn sanitize_text(text: &str) -> String {
    let s = text.trim();
    if matches!(s.to_lowercase().as_str(), "" | "nan" | "none") {
        return String::new();
    }
    let s = s.strip_prefix('"').unwrap_or(s);
    let s = s.strip_suffix('"').unwrap_or(s);
    let s = crate::parser::collapse_whitespace(s);

    let mut chars = s.chars();
    let mut out = match chars.next() {
        Some(first) => first.to_uppercase().chain(chars).collect::<String>(),
        None => return String::new(),
    };
    if !out.ends_with(['.', '!', '?']) {
        out.push('.');
    }
    out
}

/// Split after `.`, `!` or `?` followed by whitespace.
fn split_sentences(text: &str) -> Vec<&str> {
    let mut out = Vec::new();
    let mut start = 0;
    let mut chars = text.char_indices().peekable();
    while let Some((_, c)) = chars.next() {
        if !matches!(c, '.' | '!' | '?') {
            continue;
        }
        let Some(&(end, next)) = chars.peek() else {
            break;
        };
        if !next.is_whitespace() {
            continue;
        }
        out.push(&text[start..end]);
        while chars.peek().is_some_and(|&(_, w)| w.is_whitespace()) {
            chars.next();
        }
        start = chars.peek().map_or(text.len(), |&(i, _)| i);
    }
    if start < text.len() {
        out.push(&text[start..]);
    }
    out
}

fn compile(pattern: &str) -> Result<Regex, BatchError> {
    Regex::new(pattern).map_err(|e| BatchError::Config(format!("invalid pattern {pattern:?}: {e}")))
}

// ── Composer ──

/// Builds training captions from metadata rows.
#[derive(Debug, Clone)]
pub struct CaptionComposer {
    rules: CaptionRules,
    dictionary: TermDictionary,
    issue_terms: Vec<String>,
    junk: Vec<Regex>,
    term_split: Regex,
    polish: Vec<(Regex, &'static str)>,
}

impl CaptionComposer {
    pub fn new(rules: CaptionRules, dictionary: TermDictionary) -> Result<Self, BatchError> {
        let junk = rules
            .junk_phrases
            .iter()
            .filter(|p| !p.trim().is_empty())
            .map(|p| compile(&format!(r"(?i)\b{}\b(?:,\s*)?", regex::escape(p.trim()))))
            .collect::<Result<Vec<_>, _>>()?;
        let issue_terms = rules
            .issue_terms
            .iter()
            .map(|t| t.trim().to_lowercase())
            .filter(|t| !t.is_empty())
            .collect();
        let polish = vec![
            (compile(r",\s*,")?, ","),
            (compile(r",\s+\.")?, "."),
            (compile(r"\s+\.\s+")?, " "),
            (compile(r"\s+\.")?, "."),
            (compile(r"\.\.+")?, "."),
            (compile(r"\s+")?, " "),
        ];

        Ok(Self {
            rules,
            dictionary,
            issue_terms,
            junk,
            term_split: compile(r"[;,]\s*")?,
            polish,
        })
    }

    pub fn dictionary(&self) -> &TermDictionary {
        &self.dictionary
    }

    pub fn rules(&self) -> &CaptionRules {
        &self.rules
    }

    fn mentions_issue(&self, text: &str) -> bool {
        let lower = text.to_lowercase();
        self.issue_terms.iter().any(|t| lower.contains(t.as_str()))
    }

    /// Terms from the tag-like columns, deduplicated, issue terms dropped.
    pub fn extract_terms(&self, row: &MetadataRow) -> String {
        let mut seen = HashSet::new();
        let mut bucket = Vec::new();
        for field in &self.rules.term_source_fields {
            let Some(value) = row.get(field) else {
                continue;
            };
            for raw in self.term_split.split(value) {
                let human = raw.trim().replace('_', " ");
                if human.is_empty() {
                    continue;
                }
                let key = normalize_variant(&human);
                if self.mentions_issue(&key) {
                    continue;
                }
                if seen.insert(key) {
                    bucket.push(human);
                }
            }
        }
        bucket.join(" ")
    }

    fn primary_description(&self, row: &MetadataRow) -> String {
        self.rules
            .primary_fields
            .iter()
            .filter_map(|f| row.get(f))
            .map(|v| sanitize_text(v))
            .find(|d| !d.is_empty())
            .unwrap_or_default()
    }

    fn scrub_issue_sentences(&self, text: &str) -> String {
        split_sentences(text)
            .into_iter()
            .map(str::trim)
            .filter(|s| !s.is_empty() && !self.mentions_issue(s))
            .collect::<Vec<_>>()
            .join(" ")
    }

    fn scrub_junk(&self, text: &str) -> String {
        let mut out = text.to_string();
        for re in &self.junk {
            out = re.replace_all(&out, "").into_owned();
        }
        crate::parser::collapse_whitespace(&out)
    }

    fn polish(&self, text: &str) -> String {
        let mut out = text.to_string();
        for (re, with) in &self.polish {
            out = re.replace_all(&out, *with).into_owned();
        }
        out.trim().to_string()
    }

    /// Build the caption for one row, or `None` if nothing usable is left.
    pub fn compose(&self, row: &MetadataRow) -> Option<String> {
        let description = self.primary_description(row);
        let terms = self.extract_terms(row);
        let combined = format!("{description} {terms}");

        let weighted = self.dictionary.apply_weighting(combined.trim());
        let scrubbed = self.scrub_junk(&self.scrub_issue_sentences(&weighted));
        if scrubbed.is_empty() {
            return None;
        }

        let mut caption = scrubbed;
        if let Some(trigger) = self.rules.trigger_word.as_deref().filter(|t| !t.is_empty()) {
            if !caption.contains(trigger) {
                caption = format!("{trigger} {caption}");
            }
        }
        if let Some(concept) = self
            .rules
            .mandatory_concept
            .as_deref()
            .filter(|c| !c.is_empty())
        {
            if !caption.to_lowercase().contains(&concept.to_lowercase()) {
                caption = format!("{} {}", caption.trim_end(), concept);
            }
        }

        Some(self.polish(&caption))
    }
}

// ── Dataset preparation ──

/// Inputs and filters for [`prepare`].
#[derive(Debug, Clone)]
pub struct PrepareOptions {
    pub input_csv: PathBuf,
    /// Root the CSV's file paths are relative to.
    pub images_dir: PathBuf,
    pub output_dir: PathBuf,
    pub file_column: String,
    pub triage_column: String,
    pub min_style: f64,
    pub min_quality: f64,
    /// Per-column allowed values. A row passes a column when its cell
    /// contains any of the values, ignoring case. Empty lists are ignored.
    pub extra_filters: Vec<(String, Vec<String>)>,
    /// Only keep rows mentioning at least one dictionary term.
    pub require_match: bool,
    pub dry_run: bool,
}

impl PrepareOptions {
    pub fn new(
        input_csv: impl Into<PathBuf>,
        images_dir: impl Into<PathBuf>,
        output_dir: impl Into<PathBuf>,
    ) -> Self {
        Self {
            input_csv: input_csv.into(),
            images_dir: images_dir.into(),
            output_dir: output_dir.into(),
            file_column: "file_name".to_string(),
            triage_column: "triage".to_string(),
            min_style: 1.0,
            min_quality: 1.0,
            extra_filters: Vec::new(),
            require_match: false,
            dry_run: false,
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct PrepareCounts {
    pub total_rows: usize,
    pub skipped_triage: usize,
    pub below_threshold: usize,
    pub filtered_out: usize,
    pub no_term_match: usize,
    pub passed_filters: usize,
    pub invalid_paths: usize,
    pub missing_images: usize,
    pub empty_descriptions: usize,
    pub annotations_written: usize,
    pub images_copied: usize,
    pub copy_errors: usize,
}

#[derive(Debug, Clone, Serialize)]
pub struct PrepareExample {
    pub source_img: PathBuf,
    pub out_txt: PathBuf,
    pub out_img: PathBuf,
    pub description_preview: String,
}

/// Machine-readable summary, also written to `report.json`.
#[derive(Debug, Clone, Serialize)]
pub struct PrepareReport {
    pub counts: PrepareCounts,
    pub output_dir: PathBuf,
    pub examples: Vec<PrepareExample>,
    pub min_style: f64,
    pub min_quality: f64,
    pub file_column: String,
    pub triage_column: String,
    pub dry_run: bool,
}

const MAX_EXAMPLES: usize = 3;
const PREVIEW_CHARS: usize = 180;

/// Missing column counts as 0; a present but unparseable score fails.
fn score(row: &MetadataRow, column: &str) -> Option<f64> {
    match row.get(column) {
        None => Some(0.0),
        Some(v) => v.trim().parse().ok(),
    }
}

fn passes_thresholds(row: &MetadataRow, min_style: f64, min_quality: f64) -> bool {
    let style = score(row, "style_match");
    let quality = score(row, "quality");
    matches!((style, quality), (Some(s), Some(q)) if s >= min_style && q >= min_quality)
}

fn passes_extra_filters(row: &MetadataRow, filters: &[(String, Vec<String>)]) -> bool {
    filters
        .iter()
        .filter(|(_, allowed)| !allowed.is_empty())
        .all(|(column, allowed)| {
            let cell = row.get(column).map(|v| v.to_lowercase()).unwrap_or_default();
            allowed.iter().any(|v| cell.contains(&v.to_lowercase()))
        })
}

/// A relative path that stays inside its root, or `None`.
fn safe_relative(raw: &str) -> Option<PathBuf> {
    let mut clean = PathBuf::new();
    for component in Path::new(&raw.replace('\\', "/")).components() {
        match component {
            Component::Normal(part) => clean.push(part),
            Component::CurDir => {}
            _ => return None,
        }
    }
    if clean.as_os_str().is_empty() {
        None
    } else {
        Some(clean)
    }
}

fn io_err(path: &Path) -> impl FnOnce(std::io::Error) -> BatchError + '_ {
    move |source| BatchError::Io {
        path: path.to_path_buf(),
        source,
    }
}

fn read_rows(path: &Path) -> Result<Vec<MetadataRow>, BatchError> {
    let metadata_err = |source| BatchError::Metadata {
        path: path.to_path_buf(),
        source,
    };
    let mut rdr = csv::ReaderBuilder::new()
        .flexible(true)
        .from_path(path)
        .map_err(metadata_err)?;
    let headers: Vec<String> = rdr
        .headers()
        .map_err(metadata_err)?
        .iter()
        .map(|h| h.trim_start_matches('\u{feff}').trim().to_string())
        .collect();

    let mut rows = Vec::new();
    for record in rdr.records() {
        let record = record.map_err(metadata_err)?;
        rows.push(
            headers
                .iter()
                .cloned()
                .zip(record.iter().map(str::to_string))
                .collect(),
        );
    }
    Ok(rows)
}

/// Filter the metadata CSV and write caption/image pairs under `output_dir`.
pub fn prepare(
    options: &PrepareOptions,
    composer: &CaptionComposer,
) -> Result<PrepareReport, BatchError> {
    let rows = read_rows(&options.input_csv)?;
    let mut counts = PrepareCounts::default();
    let mut examples = Vec::new();

    if !options.dry_run {
        fs::create_dir_all(&options.output_dir).map_err(io_err(&options.output_dir))?;
    }

    for row in &rows {
        counts.total_rows += 1;

        let triage = row.get(&options.triage_column).map(|t| t.trim().to_lowercase());
        if triage.as_deref() == Some("skip") {
            counts.skipped_triage += 1;
            continue;
        }
        if !passes_thresholds(row, options.min_style, options.min_quality) {
            counts.below_threshold += 1;
            continue;
        }
        if !passes_extra_filters(row, &options.extra_filters) {
            counts.filtered_out += 1;
            continue;
        }
        if options.require_match {
            let haystack = std::iter::once(&options.file_column)
                .chain(composer.rules().primary_fields.iter())
                .chain(composer.rules().term_source_fields.iter())
                .filter_map(|f| row.get(f))
                .map(|v| v.replace('_', " "))
                .collect::<Vec<_>>()
                .join(" ");
            if !composer.dictionary().contains_any(&haystack) {
                counts.no_term_match += 1;
                continue;
            }
        }
        counts.passed_filters += 1;

        let raw_path = row.get(&options.file_column).map(|s| s.trim()).unwrap_or("");
        let Some(relative) = safe_relative(raw_path) else {
            tracing::warn!("Skipping row {} with unusable path {:?}", counts.total_rows, raw_path);
            counts.invalid_paths += 1;
            continue;
        };

        let source = options.images_dir.join(&relative);
        if !source.is_file() {
            tracing::warn!("Missing image: {}", source.display());
            counts.missing_images += 1;
            continue;
        }

        let Some(caption) = composer.compose(row) else {
            tracing::warn!("Empty description for: {}", relative.display());
            counts.empty_descriptions += 1;
            continue;
        };

        let out_txt = options.output_dir.join(&relative).with_extension("txt");
        let out_img = match source.extension() {
            Some(ext) => out_txt.with_extension(ext),
            None => out_txt.with_extension(""),
        };

        if !options.dry_run {
            if let Some(parent) = out_txt.parent() {
                fs::create_dir_all(parent).map_err(io_err(parent))?;
            }
            fs::write(&out_txt, &caption).map_err(io_err(&out_txt))?;
            counts.annotations_written += 1;

            match fs::copy(&source, &out_img) {
                Ok(_) => counts.images_copied += 1,
                Err(e) => {
                    tracing::warn!(
                        "Copy failed for {} -> {}: {}",
                        source.display(),
                        out_img.display(),
                        e
                    );
                    counts.copy_errors += 1;
                }
            }
        }

        if examples.len() < MAX_EXAMPLES {
            examples.push(PrepareExample {
                source_img: source,
                out_txt,
                out_img,
                description_preview: caption.chars().take(PREVIEW_CHARS).collect(),
            });
        }
    }

    let report = PrepareReport {
        counts,
        output_dir: options.output_dir.clone(),
        examples,
        min_style: options.min_style,
        min_quality: options.min_quality,
        file_column: options.file_column.clone(),
        triage_column: options.triage_column.clone(),
        dry_run: options.dry_run,
    };

    if !options.dry_run {
        let path = options.output_dir.join("report.json");
        let json = serde_json::to_string_pretty(&report)
            .map_err(|e| BatchError::Config(format!("cannot serialize report: {e}")))?;
        fs::write(&path, json).map_err(io_err(&path))?;
    }

    tracing::info!(
        "Prepared {} of {} rows into {}{}",
        report.counts.annotations_written,
        report.counts.total_rows,
        report.output_dir.display(),
        if options.dry_run { " (dry run)" } else { "" }
    );
    Ok(report)
}
