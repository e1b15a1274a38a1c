//! Post-generation numeric fact checking.
//!
//! The flow is parse -> diff -> correct:
//! 1. [`facts::parse_canonical`] reads authoritative `(label, value)` facts
//!    from the prompt.
//! 2. [`facts::extract_claims`] finds the same labels in the generated text.
//! 3. [`diff`] compares claims against canonical values deterministically.
//! 4. [`apply_corrections`] rewrites mismatched numbers in place.
//!
//! [`Sanitizer::validate`] ties this to the store: one audit row per attempt
//! and the completed/flagged decision from cumulative corrections.

pub mod facts;

pub use facts::{AliasTable, ClaimPattern, Fact, Unit};

use serde::Serialize;
use std::ops::Range;

use crate::store::{JobStore, StoreError, TaskStatus};

/// A claim that disagreed with its canonical value.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Correction {
    pub label: String,
    pub claimed: f64,
    pub canonical: f64,
    pub claimed_raw: String,
    pub replacement: String,
    #[serde(skip)]
    pub span: Range<usize>,
}

impl std::fmt::Display for Correction {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}: {} -> {}", self.label, self.claimed_raw, self.replacement)
    }
}

/// Claims whose relative difference from the canonical value exceeds
/// `tolerance`. Claims without a canonical fact are ignored.
pub fn diff(canonical: &[Fact], claims: &[Fact], tolerance: f64) -> Vec<Correction> {
    claims
        .iter()
        .filter_map(|claim| {
            let truth = canonical
                .iter()
                .find(|f| f.label == claim.label && f.unit.accepts(claim.unit))?;
            if within_tolerance(claim.value, truth.value, tolerance) {
                return None;
            }
            Some(Correction {
                label: claim.label.clone(),
                claimed: claim.value,
                canonical: truth.value,
                claimed_raw: claim.raw.clone(),
                replacement: truth.raw.clone(),
                span: claim.span.clone(),
            })
        })
        .collect()
}

fn within_tolerance(claimed: f64, canonical: f64, tolerance: f64) -> bool {
    if canonical == 0.0 {
        return claimed == 0.0;
    }
    ((claimed - canonical) / canonical).abs() <= tolerance
}

/// Replace each correction's span with its canonical text.
///
/// Spans must come from the same `text` and must not overlap.
pub fn apply_corrections(text: &str, corrections: &[Correction]) -> String {
    let mut ordered: Vec<&Correction> = corrections.iter().collect();
    ordered.sort_by_key(|c| c.span.start);

    let mut out = String::with_capacity(text.len());
    let mut cursor = 0;
    for c in ordered {
        if c.span.start < cursor || c.span.end > text.len() {
            continue;
        }
        out.push_str(&text[cursor..c.span.start]);
        out.push_str(&c.replacement);
        cursor = c.span.end;
    }
    out.push_str(&text[cursor..]);
    out
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SanitizeOutcome {
    pub text: String,
    pub corrections: Vec<Correction>,
}

impl SanitizeOutcome {
    /// Audit note: one `label: claimed -> canonical` entry per correction.
    pub fn notes(&self) -> String {
        self.corrections
            .iter()
            .map(|c| c.to_string())
            .collect::<Vec<_>>()
            .join("; ")
    }
}

/// Result of validating one attempt against the store.
#[derive(Debug, Clone)]
pub struct Validation {
    pub outcome: SanitizeOutcome,
    /// Corrections across every attempt of the task, including this one.
    pub cumulative: u64,
    /// `Completed` or `Flagged`.
    pub status: TaskStatus,
}

#[derive(Debug, Clone)]
pub struct SanitizerConfig {
    /// Relative difference tolerated before a claim counts as wrong.
    pub tolerance: f64,
    /// Cumulative corrections at which a task is flagged. At least 1.
    pub flag_threshold: u32,
}

impl Default for SanitizerConfig {
    fn default() -> Self {
        Self {
            tolerance: 0.005,
            flag_threshold: 1,
        }
    }
}

#[derive(Debug, Clone)]
pub struct Sanitizer {
    config: SanitizerConfig,
    aliases: AliasTable,
}

impl Sanitizer {
    pub fn new(config: SanitizerConfig) -> Self {
        Self {
            config,
            aliases: AliasTable::default(),
        }
    }

    pub fn with_aliases(mut self, aliases: AliasTable) -> Self {
        self.aliases = aliases;
        self
    }

    pub fn config(&self) -> &SanitizerConfig {
        &self.config
    }

    /// Check `text` against `canonical` and correct mismatches.
    pub fn sanitize(&self, text: &str, canonical: &[Fact]) -> SanitizeOutcome {
        let mut patterns = Vec::with_capacity(canonical.len());
        for fact in canonical {
            match ClaimPattern::for_fact(fact, &self.aliases) {
                Ok(p) => patterns.push(p),
                Err(e) => tracing::warn!(label = %fact.label, "Skipping fact pattern: {}", e),
            }
        }

        let claims = facts::extract_claims(text, &patterns);
        let corrections = diff(canonical, &claims, self.config.tolerance);
        SanitizeOutcome {
            text: apply_corrections(text, &corrections),
            corrections,
        }
    }

    /// Sanitize a response using the canonical facts embedded in its prompt.
    pub fn sanitize_response(&self, prompt: &str, response: &str) -> SanitizeOutcome {
        self.sanitize(response, &facts::parse_canonical(prompt))
    }

    /// Sanitize, write this attempt's audit row, and decide the final status.
    pub async fn validate(
        &self,
        store: &dyn JobStore,
        task_id: i64,
        prompt: &str,
        response: &str,
    ) -> Result<Validation, StoreError> {
        let outcome = self.sanitize_response(prompt, response);
        let count = outcome.corrections.len() as u32;
        store
            .record_sanitizer_audit(task_id, count, &outcome.notes())
            .await?;
        let cumulative = store.sanitizer_total(task_id).await?;

        let status = if cumulative >= u64::from(self.config.flag_threshold.max(1)) {
            TaskStatus::Flagged
        } else {
            TaskStatus::Completed
        };

        if count > 0 {
            tracing::warn!(
                task_id,
                corrections = count,
                cumulative,
                flagged = (status == TaskStatus::Flagged),
                "Sanitizer corrected numeric claims: {}",
                outcome.notes()
            );
        }

        Ok(Validation {
            outcome,
            cumulative,
            status,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::{ClaimFilter, NewTask, SqliteJobStore};
    use tempfile::TempDir;

    const PROMPT: &str = "Write the digest.\nCANONICAL VALUES\n* GOLD: $4300\n";

    #[test]
    fn corrects_mismatched_gold_price() {
        let sanitizer = Sanitizer::new(SanitizerConfig::default());
        let outcome = sanitizer.sanitize_response(PROMPT, "Current Gold Price: $2345");
        assert!(!outcome.corrections.is_empty());
        assert_eq!(outcome.text, "Current Gold Price: $4300");
        assert_eq!(outcome.notes(), "GOLD: 2345 -> 4300");
    }

    #[test]
    fn values_within_tolerance_are_left_alone() {
        let sanitizer = Sanitizer::new(SanitizerConfig::default());
        let outcome = sanitizer.sanitize_response(PROMPT, "Gold at $4,310 today.");
        assert!(outcome.corrections.is_empty());
        assert_eq!(outcome.text, "Gold at $4,310 today.");
    }

    #[test]
    fn claims_without_a_dollar_sign_are_corrected() {
        let sanitizer = Sanitizer::new(SanitizerConfig::default());
        let outcome = sanitizer.sanitize_response(PROMPT, "Gold closed at 2345 today.");
        assert_eq!(outcome.corrections.len(), 1);
        assert_eq!(outcome.text, "Gold closed at 4300 today.");

        let outcome = sanitizer.sanitize_response(PROMPT, "Gold is trading at 2,345 USD");
        assert_eq!(outcome.corrections.len(), 1);
        assert_eq!(outcome.text, "Gold is trading at 4300 USD");
    }

    #[test]
    fn diff_is_deterministic_and_ignores_unknown_labels() {
        let canonical = facts::parse_canonical(PROMPT);
        let claims = vec![
            Fact {
                label: "GOLD".to_string(),
                value: 2345.0,
                raw: "2345".to_string(),
                unit: Unit::Currency,
                span: 0..4,
            },
            Fact {
                label: "SILVER".to_string(),
                value: 30.0,
                raw: "30".to_string(),
                unit: Unit::Currency,
                span: 10..12,
            },
        ];
        let first = diff(&canonical, &claims, 0.005);
        assert_eq!(first, diff(&canonical, &claims, 0.005));
        assert_eq!(first.len(), 1);
        assert_eq!(first[0].canonical, 4300.0);
    }

    #[test]
    fn apply_corrections_keeps_surrounding_text() {
        let text = "A $1 and B $22 end";
        let corrections = vec![
            Correction {
                label: "B".to_string(),
                claimed: 22.0,
                canonical: 7.0,
                claimed_raw: "22".to_string(),
                replacement: "7".to_string(),
                span: 12..14,
            },
            Correction {
                label: "A".to_string(),
                claimed: 1.0,
                canonical: 100.0,
                claimed_raw: "1".to_string(),
                replacement: "100".to_string(),
                span: 3..4,
            },
        ];
        assert_eq!(apply_corrections(text, &corrections), "A $100 and B $7 end");
    }

    #[tokio::test]
    async fn mismatch_at_threshold_one_flags_the_task() {
        let dir = TempDir::new().unwrap();
        let store = SqliteJobStore::open(dir.path().join("t.db")).await.unwrap();
        let id = store.add(NewTask::generate("doc", PROMPT)).await.unwrap();
        store.claim(1, &ClaimFilter::any()).await.unwrap();

        let sanitizer = Sanitizer::new(SanitizerConfig {
            flag_threshold: 1,
            ..SanitizerConfig::default()
        });
        let validation = sanitizer
            .validate(&store, id, PROMPT, "Current Gold Price: $2345")
            .await
            .unwrap();

        assert!(validation.outcome.corrections.len() >= 1);
        assert_eq!(validation.status, TaskStatus::Flagged);
        let audits = store.sanitizer_audits(id).await.unwrap();
        assert_eq!(audits.len(), 1);
        assert_eq!(audits[0].corrections, 1);
    }

    #[tokio::test]
    async fn clean_attempts_are_audited_and_completed() {
        let dir = TempDir::new().unwrap();
        let store = SqliteJobStore::open(dir.path().join("t.db")).await.unwrap();
        let id = store.add(NewTask::generate("doc", PROMPT)).await.unwrap();

        let sanitizer = Sanitizer::new(SanitizerConfig {
            flag_threshold: 2,
            ..SanitizerConfig::default()
        });
        let first = sanitizer
            .validate(&store, id, PROMPT, "Gold closed at $4300.")
            .await
            .unwrap();
        assert_eq!(first.status, TaskStatus::Completed);

        // One correction now, below the threshold of two.
        let second = sanitizer
            .validate(&store, id, PROMPT, "Gold closed at $2345.")
            .await
            .unwrap();
        assert_eq!(second.cumulative, 1);
        assert_eq!(second.status, TaskStatus::Completed);

        let third = sanitizer
            .validate(&store, id, PROMPT, "Gold closed at $2345.")
            .await
            .unwrap();
        assert_eq!(third.cumulative, 2);
        assert_eq!(third.status, TaskStatus::Flagged);
        assert_eq!(store.sanitizer_audits(id).await.unwrap().len(), 3);
    }
}
