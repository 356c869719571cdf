//! Token pool definitions: loading and mode-blended merging.
//!
//! The pool document has top-level keys `sets` (blend-mode name → per-section
//! subcategory → token list), `negative_base`, `negative_optional`, and
//! `style_presets`. Merging a list of modes is order-stable: the first mode to
//! introduce a token for a (section, subcategory) pair fixes its position, and
//! later modes only append tokens not already present. Provenance records
//! which mode contributed which tokens so sampling can prefer non-default
//! modes.
use std::fmt;
use std::fs;
use std::path::Path;

use serde::Deserialize;
use serde_json::{Map, Value};

use crate::error::{AppError, AppResult};

/// The mode blended in when the caller requests none.
pub const DEFAULT_MODE: &str = "general";

/// The four positive-prompt sections, in rendering and sampling order.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Section {
    Composition,
    Action,
    Subject,
    Environment,
}

impl Section {
    pub const ALL: [Section; 4] = [
        Section::Composition,
        Section::Action,
        Section::Subject,
        Section::Environment,
    ];

    /// Key used in the pool document and on the CLI.
    pub fn key(self) -> &'static str {
        match self {
            Section::Composition => "composition",
            Section::Action => "action",
            Section::Subject => "subject",
            Section::Environment => "environment",
        }
    }

    /// Label used when rendering labeled prompt lines.
    pub fn label(self) -> &'static str {
        match self {
            Section::Composition => "Composition",
            Section::Action => "Action",
            Section::Subject => "Subject",
            Section::Environment => "Environment",
        }
    }

    fn index(self) -> usize {
        match self {
            Section::Composition => 0,
            Section::Action => 1,
            Section::Subject => 2,
            Section::Environment => 3,
        }
    }
}

impl fmt::Display for Section {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.key())
    }
}

/// Extra tokens a named style preset contributes per section, plus negatives.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct StylePreset {
    #[serde(default)]
    pub composition: Vec<String>,
    #[serde(default)]
    pub action: Vec<String>,
    #[serde(default)]
    pub subject: Vec<String>,
    #[serde(default)]
    pub environment: Vec<String>,
    #[serde(default)]
    pub negative: Vec<String>,
}

impl StylePreset {
    pub fn section(&self, section: Section) -> &[String] {
        match section {
            Section::Composition => &self.composition,
            Section::Action => &self.action,
            Section::Subject => &self.subject,
            Section::Environment => &self.environment,
        }
    }
}

#[derive(Debug, Deserialize)]
struct PoolsDoc {
    sets: Map<String, Value>,
    #[serde(default)]
    negative_base: Vec<String>,
    #[serde(default)]
    negative_optional: Map<String, Value>,
    #[serde(default)]
    style_presets: Map<String, Value>,
}

/// Parsed pool definitions, ready to be merged per blend-mode selection.
#[derive(Debug)]
pub struct PoolStore {
    doc: PoolsDoc,
    negative_optional: Vec<(String, Vec<String>)>,
    style_presets: Vec<(String, StylePreset)>,
    origin: String,
}

impl PoolStore {
    /// Load and validate the pool document at `path`.
    pub fn from_path(path: &Path) -> AppResult<Self> {
        let text = fs::read_to_string(path).map_err(|e| {
            AppError::Configuration(format!("cannot read pool file {}: {}", path.display(), e))
        })?;
        let value: Value = serde_json::from_str(&text).map_err(|e| {
            AppError::Configuration(format!("cannot parse pool file {}: {}", path.display(), e))
        })?;
        Self::parse(value, path.display().to_string())
    }

    /// Build a store from an already-parsed document. Used by callers that
    /// assemble pools programmatically and by tests.
    pub fn from_value(value: Value) -> AppResult<Self> {
        Self::parse(value, "<inline pools>".to_string())
    }

    fn parse(value: Value, origin: String) -> AppResult<Self> {
        let doc: PoolsDoc = serde_json::from_value(value).map_err(|e| {
            AppError::Configuration(format!("invalid pool document {}: {}", origin, e))
        })?;
        let mut negative_optional = Vec::new();
        for (group, tokens) in doc.negative_optional.iter() {
            let tokens = string_list(tokens).ok_or_else(|| {
                AppError::Configuration(format!(
                    "negative group '{}' in {} must be a list of strings",
                    group, origin
                ))
            })?;
            negative_optional.push((group.clone(), tokens));
        }
        let mut style_presets = Vec::new();
        for (name, preset) in doc.style_presets.iter() {
            let preset: StylePreset = serde_json::from_value(preset.clone()).map_err(|e| {
                AppError::Configuration(format!(
                    "style preset '{}' in {} is malformed: {}",
                    name, origin, e
                ))
            })?;
            style_presets.push((name.clone(), preset));
        }
        Ok(PoolStore {
            doc,
            negative_optional,
            style_presets,
            origin,
        })
    }

    pub fn mode_names(&self) -> Vec<&str> {
        self.doc.sets.keys().map(String::as_str).collect()
    }

    /// Merge the requested blend modes into a sampling-ready pool. An empty
    /// mode list implies `["general"]`.
    pub fn merge(&self, modes: &[String]) -> AppResult<MergedPool> {
        let selected: Vec<String> = if modes.is_empty() {
            vec![DEFAULT_MODE.to_string()]
        } else {
            modes.to_vec()
        };

        let mut sections = Section::ALL.map(MergedSection::new);
        for mode in &selected {
            let additions = self.doc.sets.get(mode).ok_or_else(|| {
                AppError::Configuration(format!(
                    "pool mode '{}' not found in {}",
                    mode, self.origin
                ))
            })?;
            let additions = additions.as_object().ok_or_else(|| {
                AppError::Configuration(format!(
                    "pool mode '{}' in {} must be an object of sections",
                    mode, self.origin
                ))
            })?;
            for merged in sections.iter_mut() {
                let Some(section_value) = additions.get(merged.section.key()) else {
                    continue;
                };
                let subcategories = section_value.as_object().ok_or_else(|| {
                    AppError::Configuration(format!(
                        "section '{}' of mode '{}' in {} must be an object",
                        merged.section, mode, self.origin
                    ))
                })?;
                for (key, tokens) in subcategories.iter() {
                    let tokens = string_list(tokens).ok_or_else(|| {
                        AppError::Configuration(format!(
                            "subcategory '{}.{}' of mode '{}' in {} must be a list of strings",
                            merged.section, key, mode, self.origin
                        ))
                    })?;
                    merged.add(key, &tokens, mode);
                }
            }
        }

        Ok(MergedPool {
            modes: selected,
            sections,
            negative_base: self.doc.negative_base.clone(),
            negative_optional: self.negative_optional.clone(),
            style_presets: self.style_presets.clone(),
        })
    }
}

fn string_list(value: &Value) -> Option<Vec<String>> {
    let items = value.as_array()?;
    let mut out = Vec::with_capacity(items.len());
    for item in items {
        out.push(item.as_str()?.to_string());
    }
    Some(out)
}

/// One subcategory of a merged section: the ordered token union plus the
/// per-mode provenance used to bias sampling.
#[derive(Debug, Clone)]
pub struct Subcategory {
    pub key: String,
    tokens: Vec<String>,
    contributions: Vec<(String, Vec<String>)>,
}

impl Subcategory {
    fn new(key: &str) -> Self {
        Subcategory {
            key: key.to_string(),
            tokens: Vec::new(),
            contributions: Vec::new(),
        }
    }

    fn add_tokens(&mut self, mode: &str, tokens: &[String]) {
        let idx = match self.contributions.iter().position(|(m, _)| m == mode) {
            Some(i) => i,
            None => {
                self.contributions.push((mode.to_string(), Vec::new()));
                self.contributions.len() - 1
            }
        };
        let contribution = &mut self.contributions[idx].1;
        for token in tokens {
            if !contribution.contains(token) {
                contribution.push(token.clone());
            }
        }
        for token in tokens {
            if !self.tokens.contains(token) {
                self.tokens.push(token.clone());
            }
        }
    }

    pub fn tokens(&self) -> &[String] {
        &self.tokens
    }

    /// Tokens contributed by any of `modes`, first-seen order, deduplicated
    /// across modes so a draw can never contain the same token twice.
    pub fn preferred_tokens(&self, modes: &[&str]) -> Vec<String> {
        let mut preferred = Vec::new();
        for mode in modes {
            if let Some((_, tokens)) = self.contributions.iter().find(|(m, _)| m == mode) {
                for token in tokens {
                    if !preferred.contains(token) {
                        preferred.push(token.clone());
                    }
                }
            }
        }
        preferred
    }

    /// The tokens a single mode contributed, if it contributed at all.
    pub fn contribution(&self, mode: &str) -> Option<&[String]> {
        self.contributions
            .iter()
            .find(|(m, _)| m == mode)
            .map(|(_, tokens)| tokens.as_slice())
    }
}

#[derive(Debug, Clone)]
pub struct MergedSection {
    section: Section,
    subcategories: Vec<Subcategory>,
}

impl MergedSection {
    fn new(section: Section) -> Self {
        MergedSection {
            section,
            subcategories: Vec::new(),
        }
    }

    fn add(&mut self, key: &str, tokens: &[String], mode: &str) {
        let idx = match self.subcategories.iter().position(|s| s.key == key) {
            Some(i) => i,
            None => {
                self.subcategories.push(Subcategory::new(key));
                self.subcategories.len() - 1
            }
        };
        self.subcategories[idx].add_tokens(mode, tokens);
    }

    pub fn subcategories(&self) -> &[Subcategory] {
        &self.subcategories
    }
}

/// The union of the selected blend modes, ready for sampling.
#[derive(Debug)]
pub struct MergedPool {
    modes: Vec<String>,
    sections: [MergedSection; 4],
    negative_base: Vec<String>,
    negative_optional: Vec<(String, Vec<String>)>,
    style_presets: Vec<(String, StylePreset)>,
}

impl MergedPool {
    pub fn modes(&self) -> &[String] {
        &self.modes
    }

    pub fn section(&self, section: Section) -> &MergedSection {
        &self.sections[section.index()]
    }

    pub fn subcategory_keys(&self, section: Section) -> Vec<String> {
        self.section(section)
            .subcategories
            .iter()
            .map(|s| s.key.clone())
            .collect()
    }

    pub fn negative_base(&self) -> &[String] {
        &self.negative_base
    }

    pub fn negative_group(&self, group: &str) -> Option<&[String]> {
        self.negative_optional
            .iter()
            .find(|(name, _)| name == group)
            .map(|(_, tokens)| tokens.as_slice())
    }

    pub fn negative_group_names(&self) -> Vec<&str> {
        self.negative_optional
            .iter()
            .map(|(name, _)| name.as_str())
            .collect()
    }

    pub fn style_preset(&self, name: &str) -> Option<&StylePreset> {
        self.style_presets
            .iter()
            .find(|(preset, _)| preset == name)
            .map(|(_, preset)| preset)
    }

    pub fn style_preset_names(&self) -> Vec<&str> {
        self.style_presets
            .iter()
            .map(|(name, _)| name.as_str())
            .collect()
    }
}
