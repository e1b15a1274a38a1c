//! Global per-provider call spacing.
//!
//! Every caller of a given provider shares one [`ProviderThrottle`], so the
//! minimum interval holds across tasks and workers, not just within one call
//! chain. The lock is held while sleeping, which serializes calls.

use std::collections::HashMap;
use std::sync::{Arc, LazyLock, Mutex as StdMutex};
use std::time::{Duration, Instant};
use tokio::sync::Mutex;

static THROTTLES: LazyLock<StdMutex<HashMap<String, Arc<ProviderThrottle>>>> =
    LazyLock::new(|| StdMutex::new(HashMap::new()));

pub struct ProviderThrottle {
    min_interval: Duration,
    last_call: Mutex<Option<Instant>>,
}

impl ProviderThrottle {
    pub fn new(min_interval: Duration) -> Self {
        Self {
            min_interval,
            last_call: Mutex::new(None),
        }
    }

    /// Shared throttle for `provider`. The interval of the first registration wins.
    pub fn shared(provider: &str, min_interval: Duration) -> Arc<Self> {
        let mut map = THROTTLES.lock().unwrap_or_else(|e| e.into_inner());
        map.entry(provider.to_string())
            .or_insert_with(|| Arc::new(Self::new(min_interval)))
            .clone()
    }

    pub fn min_interval(&self) -> Duration {
        self.min_interval
    }

    /// Wait until `min_interval` has passed since the previous call, then
    /// stamp this call. Returns how long it slept.
    pub async fn acquire(&self) -> Duration {
        let mut last = self.last_call.lock().await;
        let mut waited = Duration::ZERO;
        if let Some(previous) = *last {
            let elapsed = previous.elapsed();
            if elapsed < self.min_interval {
                waited = self.min_interval - elapsed;
                tracing::debug!(wait_ms = waited.as_millis() as u64, "Throttling provider call");
                tokio::time::sleep(waited).await;
            }
        }
        *last = Some(Instant::now());
        waited
    }
}
