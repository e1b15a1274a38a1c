//! Heuristic quality score for generated digests.
//!
//! | Component | Weight | Signal |
//! |-----------|--------|--------|
//! | Structure | 0.3 | required section headings present |
//! | Detail    | 0.4 | density of prices, percentages, pairs, decimals |
//! | Length    | 0.3 | word count inside the target band |

use regex::Regex;
use serde::Serialize;
use std::ops::RangeInclusive;
use std::sync::LazyLock;

/// Texts shorter than this (trimmed) score zero.
pub const MIN_SCORABLE_CHARS: usize = 50;

static DETAIL_PATTERNS: LazyLock<Vec<Regex>> = LazyLock::new(|| {
    [
        r"\$\s*\d{1,3}(?:,\d{3})*(?:\.\d+)?",
        r"\d+(?:\.\d+)?\s*%",
        r"\b[A-Z]{3}/[A-Z]{3}\b",
        r"\d+\.\d{2,}",
    ]
    .iter()
    .map(|p| Regex::new(p).unwrap())
    .collect()
});

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct QualityReport {
    /// In [0, 1], rounded to two decimals.
    pub score: f64,
    pub feedback: Vec<String>,
}

#[derive(Debug, Clone)]
pub struct QualityScorer {
    sections: Vec<String>,
    /// Full-credit word band.
    target_words: RangeInclusive<usize>,
    /// Half-credit word band.
    tolerated_words: RangeInclusive<usize>,
}

impl Default for QualityScorer {
    fn default() -> Self {
        Self {
            sections: vec![
                "Key Takeaways".to_string(),
                "Actionable Next Steps".to_string(),
                "Rationale".to_string(),
            ],
            target_words: 100..=400,
            tolerated_words: 50..=500,
        }
    }
}

impl QualityScorer {
    pub fn score(&self, text: &str) -> QualityReport {
        let trimmed = text.trim();
        if trimmed.chars().count() < MIN_SCORABLE_CHARS {
            return QualityReport {
                score: 0.0,
                feedback: vec!["Response is empty or critically short".to_string()],
            };
        }

        let mut score = 0.0;
        let mut feedback = Vec::new();

        let lowered = trimmed.to_lowercase();
        let per_section = 0.3 / self.sections.len().max(1) as f64;
        let present = self
            .sections
            .iter()
            .filter(|s| lowered.contains(&s.to_lowercase()))
            .count();
        score += per_section * present as f64;
        if present < self.sections.len() {
            feedback.push(format!(
                "Missing required sections ({})",
                self.sections.join(", ")
            ));
        }

        let details: usize = DETAIL_PATTERNS
            .iter()
            .map(|re| re.find_iter(trimmed).count())
            .sum();
        if details >= 5 {
            score += 0.4;
        } else if details >= 2 {
            score += 0.2;
            feedback.push("Suggest more specific price levels or data points".to_string());
        } else {
            feedback.push("Critically low on specific financial data/levels".to_string());
        }

        let words = trimmed.split_whitespace().count();
        if self.target_words.contains(&words) {
            score += 0.3;
        } else if self.tolerated_words.contains(&words) {
            score += 0.15;
            feedback.push(format!(
                "Length is slightly outside optimal range ({}-{} words)",
                self.target_words.start(),
                self.target_words.end()
            ));
        } else {
            feedback.push(format!("Length issue: {} words is too short/long", words));
        }

        QualityReport {
            score: (score * 100.0).round() / 100.0,
            feedback,
        }
    }
}

#[cfg(test)]
pub(crate) fn sample_digest() -> String {
    let mut text = String::from(
        "## Key Takeaways\nGold held $2,345.50 while XAU/USD firmed 1.2% and silver added 0.8%.\n\
         ## Actionable Next Steps\nWatch 2350.75 resistance and the $2,300 floor.\n\
         ## Rationale\n",
    );
    for _ in 0..12 {
        text.push_str("Momentum and positioning both point to a measured continuation this week. ");
    }
    text
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn short_text_scores_zero() {
        let report = QualityScorer::default().score("too short");
        assert_eq!(report.score, 0.0);
        assert_eq!(report.feedback.len(), 1);
    }

    #[test]
    fn structured_detailed_digest_scores_full_marks() {
        let text = sample_digest();
        let words = text.split_whitespace().count();
        assert!((100..=400).contains(&words), "{} words", words);

        let report = QualityScorer::default().score(&text);
        assert_eq!(report.score, 1.0);
        assert!(report.feedback.is_empty());
    }

    #[test]
    fn unstructured_prose_falls_below_acceptance() {
        let text = "The market moved a little today and people talked about it. ".repeat(10);
        let report = QualityScorer::default().score(&text);
        assert!(report.score < 0.5);
        assert!(report
            .feedback
            .iter()
            .any(|f| f.starts_with("Missing required sections")));
    }

    #[test]
    fn section_match_is_case_insensitive() {
        let text = format!("KEY TAKEAWAYS rationale actionable next steps {}", "word ".repeat(20));
        let report = QualityScorer::default().score(&text);
        assert!(!report
            .feedback
            .iter()
            .any(|f| f.starts_with("Missing required sections")));
    }
}
