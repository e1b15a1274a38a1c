//! Threshold checks over queue length and recent sanitizer corrections.

use chrono::Utc;
use serde::Serialize;
use std::time::Duration;

use crate::store::{JobStore, StoreError};

#[derive(Debug, Clone)]
pub struct AlertThresholds {
    /// Pending tasks at which the backlog alert fires.
    pub queue_length: u64,
    /// Corrections within `window` at which the sanitizer alert fires.
    pub sanitizer_corrections: u64,
    pub window: Duration,
}

impl Default for AlertThresholds {
    fn default() -> Self {
        Self {
            queue_length: 10,
            sanitizer_corrections: 1,
            window: Duration::from_secs(3600),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Alert {
    QueueBacklog { pending: u64, threshold: u64 },
    SanitizerCorrections { total: u64, threshold: u64, window_secs: u64 },
}

impl std::fmt::Display for Alert {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Alert::QueueBacklog { pending, threshold } => {
                write!(f, "LLM queue backlog: {} pending (threshold {})", pending, threshold)
            }
            Alert::SanitizerCorrections {
                total,
                threshold,
                window_secs,
            } => write!(
                f,
                "Sanitizer made {} correction(s) in the last {}s (threshold {})",
                total, window_secs, threshold
            ),
        }
    }
}

/// Alerts whose thresholds are currently met. A zero threshold disables
/// that check.
pub async fn check_alerts(
    store: &dyn JobStore,
    thresholds: &AlertThresholds,
) -> Result<Vec<Alert>, StoreError> {
    let mut alerts = Vec::new();

    if thresholds.queue_length > 0 {
        let pending = store.queue_length().await?;
        if pending >= thresholds.queue_length {
            alerts.push(Alert::QueueBacklog {
                pending,
                threshold: thresholds.queue_length,
            });
        }
    }

    if thresholds.sanitizer_corrections > 0 {
        let window = chrono::Duration::from_std(thresholds.window)
            .unwrap_or_else(|_| chrono::Duration::hours(1));
        let total = store.recent_sanitizer_total(Utc::now() - window).await?;
        if total >= thresholds.sanitizer_corrections {
            alerts.push(Alert::SanitizerCorrections {
                total,
                threshold: thresholds.sanitizer_corrections,
                window_secs: thresholds.window.as_secs(),
            });
        }
    }

    for alert in &alerts {
        tracing::warn!("{}", alert);
    }
    Ok(alerts)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::{NewTask, SqliteJobStore};
    use tempfile::TempDir;

    #[tokio::test]
    async fn quiet_store_raises_nothing() {
        let dir = TempDir::new().unwrap();
        let store = SqliteJobStore::open(dir.path().join("t.db")).await.unwrap();
        store.add(NewTask::generate("doc", "p")).await.unwrap();
        assert!(check_alerts(&store, &AlertThresholds::default())
            .await
            .unwrap()
            .is_empty());
    }

    #[tokio::test]
    async fn thresholds_trigger_both_alerts() {
        let dir = TempDir::new().unwrap();
        let store = SqliteJobStore::open(dir.path().join("t.db")).await.unwrap();
        let mut last = 0;
        for _ in 0..3 {
            last = store.add(NewTask::generate("doc", "p")).await.unwrap();
        }
        store.record_sanitizer_audit(last, 2, "GOLD: 1 -> 2").await.unwrap();

        let thresholds = AlertThresholds {
            queue_length: 3,
            sanitizer_corrections: 2,
            ..AlertThresholds::default()
        };
        let alerts = check_alerts(&store, &thresholds).await.unwrap();
        assert_eq!(
            alerts,
            vec![
                Alert::QueueBacklog {
                    pending: 3,
                    threshold: 3
                },
                Alert::SanitizerCorrections {
                    total: 2,
                    threshold: 2,
                    window_secs: 3600
                },
            ]
        );
    }

    #[test]
    fn alerts_serialize_with_a_kind_tag() {
        let json = serde_json::to_value(Alert::QueueBacklog {
            pending: 12,
            threshold: 10,
        })
        .unwrap();
        assert_eq!(json["kind"], "queue_backlog");
        assert_eq!(json["pending"], 12);
    }
}
