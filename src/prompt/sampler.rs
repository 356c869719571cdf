//! Deterministic CASE prompt sampling over a merged token pool.
//!
//! For each section and each subcategory, draws a bounded number of distinct
//! tokens without replacement, preferring tokens contributed by requested
//! non-default blend modes before falling back to the full candidate list. A
//! supplied seed makes the entire draw sequence reproducible: one
//! sampler-local RNG is created before any draw, and iteration follows the
//! merged pool's section-then-subcategory order.
use std::collections::HashMap;

use rand::rngs::StdRng;
use rand::seq::SliceRandom;
use rand::SeedableRng;

use crate::error::{AppError, AppResult};
use crate::pools::store::{MergedPool, Section, DEFAULT_MODE};

/// Per-subcategory draw-count overrides, one map per section.
#[derive(Debug, Clone, Default)]
pub struct SectionOverrides {
    pub composition: HashMap<String, usize>,
    pub action: HashMap<String, usize>,
    pub subject: HashMap<String, usize>,
    pub environment: HashMap<String, usize>,
}

impl SectionOverrides {
    pub fn for_section(&self, section: Section) -> &HashMap<String, usize> {
        match section {
            Section::Composition => &self.composition,
            Section::Action => &self.action,
            Section::Subject => &self.subject,
            Section::Environment => &self.environment,
        }
    }

    pub fn set(&mut self, section: Section, overrides: HashMap<String, usize>) {
        match section {
            Section::Composition => self.composition = overrides,
            Section::Action => self.action = overrides,
            Section::Subject => self.subject = overrides,
            Section::Environment => self.environment = overrides,
        }
    }
}

#[derive(Debug, Clone)]
pub struct SampleOptions {
    /// Seed for reproducible sampling. `None` draws from entropy.
    pub seed: Option<u64>,
    /// Tokens drawn per subcategory unless overridden.
    pub default_count: usize,
    pub overrides: SectionOverrides,
    /// Optional negative groups, appended in caller order.
    pub negative_groups: Vec<String>,
    pub style_preset: Option<String>,
}

impl Default for SampleOptions {
    fn default() -> Self {
        SampleOptions {
            seed: None,
            default_count: 1,
            overrides: SectionOverrides::default(),
            negative_groups: Vec::new(),
            style_preset: None,
        }
    }
}

/// An immutable CASE prompt: four positive sections plus the negative list.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CasePrompt {
    composition: Vec<String>,
    action: Vec<String>,
    subject: Vec<String>,
    environment: Vec<String>,
    negatives: Vec<String>,
}

impl CasePrompt {
    pub fn section(&self, section: Section) -> &[String] {
        match section {
            Section::Composition => &self.composition,
            Section::Action => &self.action,
            Section::Subject => &self.subject,
            Section::Environment => &self.environment,
        }
    }

    pub fn negatives(&self) -> &[String] {
        &self.negatives
    }

    /// Render the five prompt lines (composition, action, subject,
    /// environment, negative). Labeled mode prefixes each with its section
    /// label; flat mode omits labels entirely.
    pub fn as_lines(&self, flat: bool, delimiter: &str) -> Vec<String> {
        let mut lines: Vec<String> = Section::ALL
            .iter()
            .map(|&s| format_line(s.label(), self.section(s), flat, delimiter))
            .collect();
        lines.push(format_line("Negative Prompt", &self.negatives, flat, delimiter));
        lines
    }

    /// The four positive sections as unlabeled lines joined by newlines,
    /// ready for a text-encoder node.
    pub fn positive_block(&self, delimiter: &str) -> String {
        Section::ALL
            .iter()
            .map(|&s| self.section(s).join(delimiter))
            .collect::<Vec<_>>()
            .join("\n")
    }

    /// The negative list as one unlabeled line.
    pub fn negative_line(&self, delimiter: &str) -> String {
        self.negatives.join(delimiter)
    }
}

fn format_line(label: &str, tokens: &[String], flat: bool, delimiter: &str) -> String {
    let joined = tokens.join(delimiter);
    if flat {
        joined
    } else {
        format!("{}: {}", label, joined)
    }
}

/// Sample a CASE prompt from `pool` according to `options`.
pub fn sample(pool: &MergedPool, options: &SampleOptions) -> AppResult<CasePrompt> {
    let mut rng = match options.seed {
        Some(seed) => StdRng::seed_from_u64(seed),
        None => StdRng::from_entropy(),
    };
    let preferred_modes: Vec<&str> = pool
        .modes()
        .iter()
        .filter(|m| m.as_str() != DEFAULT_MODE)
        .map(String::as_str)
        .collect();

    let mut sections: Vec<Vec<String>> = Vec::with_capacity(Section::ALL.len());
    for section in Section::ALL {
        let overrides = options.overrides.for_section(section);
        let mut selections = Vec::new();
        for subcategory in pool.section(section).subcategories() {
            let count = overrides
                .get(&subcategory.key)
                .copied()
                .unwrap_or(options.default_count);
            if count == 0 {
                continue;
            }
            let preferred = subcategory.preferred_tokens(&preferred_modes);
            selections.extend(pick_tokens(subcategory.tokens(), count, &preferred, &mut rng));
        }
        sections.push(selections);
    }

    let preset = match &options.style_preset {
        Some(name) => Some(
            pool.style_preset(name)
                .ok_or_else(|| AppError::UnknownPreset(name.clone()))?,
        ),
        None => None,
    };
    if let Some(preset) = preset {
        for (section, selections) in Section::ALL.iter().zip(sections.iter_mut()) {
            extend_unique(selections, preset.section(*section));
        }
    }

    let mut negatives = pool.negative_base().to_vec();
    for group in &options.negative_groups {
        let extra = pool
            .negative_group(group)
            .ok_or_else(|| AppError::UnknownGroup(group.clone()))?;
        negatives.extend_from_slice(extra);
    }
    if let Some(preset) = preset {
        extend_unique(&mut negatives, &preset.negative);
    }

    let mut sections = sections.into_iter();
    Ok(CasePrompt {
        composition: sections.next().unwrap_or_default(),
        action: sections.next().unwrap_or_default(),
        subject: sections.next().unwrap_or_default(),
        environment: sections.next().unwrap_or_default(),
        negatives,
    })
}

/// Draw up to `count` distinct tokens: the preference pass first, then a
/// uniform fill from the remainder. A pool smaller than the request
/// under-fills silently; when the fill request covers the whole remainder,
/// the remainder is taken in pool order.
fn pick_tokens(
    pool: &[String],
    count: usize,
    preferred: &[String],
    rng: &mut StdRng,
) -> Vec<String> {
    if count == 0 {
        return Vec::new();
    }
    let mut chosen: Vec<String> = Vec::new();
    let mut needed = count;

    let available: Vec<&String> = preferred.iter().filter(|t| pool.contains(*t)).collect();
    if !available.is_empty() {
        let take = needed.min(available.len());
        chosen.extend(available.choose_multiple(rng, take).map(|t| (*t).clone()));
        needed -= take;
    }
    if needed == 0 {
        return chosen;
    }

    let remaining: Vec<&String> = pool.iter().filter(|t| !chosen.contains(*t)).collect();
    if remaining.is_empty() {
        return chosen;
    }
    if needed >= remaining.len() {
        chosen.extend(remaining.into_iter().cloned());
    } else {
        chosen.extend(remaining.choose_multiple(rng, needed).map(|t| (*t).clone()));
    }
    chosen
}

fn extend_unique(target: &mut Vec<String>, additions: &[String]) {
    for token in additions {
        if !target.contains(token) {
            target.push(token.clone());
        }
    }
}
