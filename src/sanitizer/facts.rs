//! Numeric fact extraction.
//!
//! Canonical facts come from a `CANONICAL VALUES` block in the prompt:
//!
//! ```text
//! CANONICAL VALUES
//! * GOLD: $4300
//! * DXY: 104.2
//! ```
//!
//! Claims are found in generated text by matching a label (or one of its
//! aliases) followed closely by a number. Label aliases live in an
//! [`AliasTable`] so the matching vocabulary stays data.

use regex::Regex;
use std::collections::HashMap;
use std::ops::Range;
use std::sync::LazyLock;

const CANONICAL_HEADER: &str = "canonical values";

/// Characters after a label mention within which its number must start.
const MAX_LABEL_GAP: usize = 40;

static FACT_LINE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(
        r"^\s*(?:[*\-•]\s*)?([A-Za-z][A-Za-z0-9 /&._-]*?)\s*[:=]\s*(\$)?\s*(-?\d[\d,]*(?:\.\d+)?)(?:\s*(%)|\s*((?i:usd))\b)?",
    )
    .unwrap()
});

static NUMBER: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(\$)?\s*(-?\d[\d,]*(?:\.\d+)?)(?:\s*(%)|\s*((?i:usd))\b)?").unwrap()
});

/// Built-in aliases for common market labels.
const DEFAULT_ALIASES: &[(&str, &[&str])] = &[
    ("GOLD", &["gold", "xau", "xau/usd", "xauusd"]),
    ("SILVER", &["silver", "xag", "xag/usd", "xagusd"]),
    ("DXY", &["dxy", "dollar index", "us dollar index"]),
    ("VIX", &["vix", "volatility index"]),
    ("SPX", &["spx", "s&p 500", "s&p500", "sp500"]),
    ("US10Y", &["us10y", "10-year yield", "10y yield", "ten-year yield"]),
    ("OIL", &["oil", "wti", "crude"]),
    ("BTC", &["btc", "bitcoin"]),
];

/// A labelled number found in text.
#[derive(Debug, Clone, PartialEq)]
pub struct Fact {
    /// Upper-cased label.
    pub label: String,
    pub value: f64,
    /// The number as written.
    pub raw: String,
    pub unit: Unit,
    /// Byte range of `raw` in the source text.
    pub span: Range<usize>,
}

/// How a number was written. A `$` prefix or `USD` suffix is currency.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Unit {
    Currency,
    Percent,
    Plain,
}

impl Unit {
    /// Whether a claim written as `other` can contradict a fact in `self`.
    /// Percentages only compare with percentages.
    pub fn accepts(self, other: Unit) -> bool {
        match (self, other) {
            (Unit::Percent, o) | (o, Unit::Percent) => o == Unit::Percent,
            _ => true,
        }
    }

    fn from_marks(dollar: bool, percent: bool) -> Self {
        match (dollar, percent) {
            (_, true) => Unit::Percent,
            (true, false) => Unit::Currency,
            _ => Unit::Plain,
        }
    }
}

/// Label -> alternative spellings used when searching generated text.
#[derive(Debug, Clone)]
pub struct AliasTable {
    aliases: HashMap<String, Vec<String>>,
}

impl Default for AliasTable {
    fn default() -> Self {
        let aliases = DEFAULT_ALIASES
            .iter()
            .map(|(label, names)| {
                (
                    label.to_string(),
                    names.iter().map(|n| n.to_string()).collect(),
                )
            })
            .collect();
        Self { aliases }
    }
}

impl AliasTable {
    pub fn empty() -> Self {
        Self {
            aliases: HashMap::new(),
        }
    }

    pub fn with_alias(mut self, label: &str, alias: &str) -> Self {
        self.aliases
            .entry(label.to_uppercase())
            .or_default()
            .push(alias.to_lowercase());
        self
    }

    /// The label itself (with `_` read as a space) plus its aliases.
    pub fn names_for(&self, label: &str) -> Vec<String> {
        let mut names = vec![label.to_lowercase(), label.replace('_', " ").to_lowercase()];
        if let Some(extra) = self.aliases.get(label) {
            names.extend(extra.iter().cloned());
        }
        names.sort_by(|a, b| b.len().cmp(&a.len()).then_with(|| a.cmp(b)));
        names.dedup();
        names
    }
}

/// Compiled matcher for one canonical label.
#[derive(Debug, Clone)]
pub struct ClaimPattern {
    pub label: String,
    pub unit: Unit,
    regex: Regex,
}

impl ClaimPattern {
    pub fn new(label: &str, unit: Unit, aliases: &AliasTable) -> Result<Self, regex::Error> {
        let names: Vec<String> = aliases
            .names_for(label)
            .iter()
            .map(|n| regex::escape(n))
            .collect();
        let pattern = format!(r"(?i)(?:^|[^A-Za-z0-9])(?:{})\b", names.join("|"));
        Ok(Self {
            label: label.to_string(),
            unit,
            regex: Regex::new(&pattern)?,
        })
    }

    pub fn for_fact(fact: &Fact, aliases: &AliasTable) -> Result<Self, regex::Error> {
        Self::new(&fact.label, fact.unit, aliases)
    }

    /// For each mention of the label, the first number written in the same
    /// unit within the gap window on the same line, or failing that the
    /// first number of a compatible unit.
    fn find_all(&self, text: &str) -> Vec<Fact> {
        let mut out = Vec::new();
        for mention in self.regex.find_iter(text) {
            let start = mention.end();
            let line_end = text[start..].find('\n').map_or(text.len(), |i| start + i);
            let window_end = text[start..line_end]
                .char_indices()
                .nth(MAX_LABEL_GAP)
                .map_or(line_end, |(i, _)| start + i);

            let mut compatible: Option<Fact> = None;
            let mut exact: Option<Fact> = None;
            for caps in NUMBER.captures_iter(&text[start..line_end]) {
                let (Some(whole), Some(number)) = (caps.get(0), caps.get(2)) else {
                    continue;
                };
                if start + whole.start() > window_end {
                    break;
                }
                let unit = Unit::from_marks(
                    caps.get(1).is_some() || caps.get(4).is_some(),
                    caps.get(3).is_some(),
                );
                if !self.unit.accepts(unit) {
                    continue;
                }
                let Some(value) = parse_number(number.as_str()) else {
                    continue;
                };
                let fact = Fact {
                    label: self.label.clone(),
                    value,
                    raw: number.as_str().to_string(),
                    unit,
                    span: start + number.start()..start + number.end(),
                };
                if unit == self.unit {
                    exact = Some(fact);
                    break;
                }
                compatible.get_or_insert(fact);
            }
            out.extend(exact.or(compatible));
        }
        out
    }
}

/// `"4,300.50"` -> `4300.5`.
pub fn parse_number(raw: &str) -> Option<f64> {
    raw.replace(',', "").parse().ok()
}

/// Facts listed under the `CANONICAL VALUES` header, in order.
///
/// The block ends at the first blank line or line that is not a fact.
pub fn parse_canonical(prompt: &str) -> Vec<Fact> {
    let mut facts = Vec::new();
    let mut in_block = false;
    let mut offset = 0;

    for line in prompt.split_inclusive('\n') {
        let line_start = offset;
        offset += line.len();
        let content = line.trim_end_matches(['\r', '\n']);

        if !in_block {
            in_block = content.to_lowercase().contains(CANONICAL_HEADER);
            continue;
        }
        if content.trim().is_empty() {
            break;
        }
        let Some(caps) = FACT_LINE.captures(content) else {
            break;
        };
        let (Some(label), Some(number)) = (caps.get(1), caps.get(3)) else {
            break;
        };
        if let Some(value) = parse_number(number.as_str()) {
            facts.push(Fact {
                label: label.as_str().trim().to_uppercase(),
                value,
                raw: number.as_str().to_string(),
                unit: Unit::from_marks(
                    caps.get(2).is_some() || caps.get(5).is_some(),
                    caps.get(4).is_some(),
                ),
                span: line_start + number.start()..line_start + number.end(),
            });
        }
    }
    facts
}

/// Every claim about any canonical label, ordered by position.
///
/// When two labels match the same number the earlier pattern wins.
pub fn extract_claims(text: &str, patterns: &[ClaimPattern]) -> Vec<Fact> {
    let mut claims: Vec<Fact> = Vec::new();
    for pattern in patterns {
        for fact in pattern.find_all(text) {
            if !claims.iter().any(|c| c.span == fact.span) {
                claims.push(fact);
            }
        }
    }
    claims.sort_by_key(|c| c.span.start);
    claims
}
