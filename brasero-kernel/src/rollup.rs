use crate::cache::CacheHub;
use crate::models::fmt_rfc3339;
use crate::state::{new_state, Shared};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Arc;
use time::OffsetDateTime;

/// Agrégat min/max/avg pré-calculé sur la fenêtre écoulée, poussé dans le
/// namespace rollups à une cadence plus lente que les lectures brutes.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RollupSnapshot {
    pub min: f64,
    pub max: f64,
    pub avg: f64,
    pub count: usize,
    pub window_secs: u64,
    pub computed_at: String,
}

/// Accumulateur par channel entre deux flushes. Les échantillons ne vivent
/// qu'une fenêtre : pas d'historique ici, c'est le rôle du store externe.
pub struct RollupTracker {
    windows: Shared<HashMap<String, Vec<f64>>>,
    window_secs: u64,
}

impl RollupTracker {
    pub fn new(window_secs: u64) -> Arc<Self> {
        Arc::new(Self {
            windows: new_state(HashMap::new()),
            window_secs: window_secs.max(1),
        })
    }

    pub fn record(&self, device_id: &str, channel_id: &str, temperature: f64) {
        self.windows
            .lock()
            .entry(CacheHub::live_key(device_id, channel_id))
            .or_default()
            .push(temperature);
    }

    /// Calcule et cache un snapshot par channel, puis vide les fenêtres.
    pub fn flush(&self, cache: &CacheHub, now: OffsetDateTime) -> usize {
        let drained: HashMap<String, Vec<f64>> = std::mem::take(&mut *self.windows.lock());
        let mut flushed = 0;
        for (key, samples) in drained {
            if samples.is_empty() {
                continue;
            }
            let min = samples.iter().cloned().fold(f64::INFINITY, f64::min);
            let max = samples.iter().cloned().fold(f64::NEG_INFINITY, f64::max);
            let avg = samples.iter().sum::<f64>() / samples.len() as f64;
            cache.rollups.set_t(
                &key,
                &RollupSnapshot {
                    min,
                    max,
                    avg,
                    count: samples.len(),
                    window_secs: self.window_secs,
                    computed_at: fmt_rfc3339(now),
                },
            );
            flushed += 1;
        }
        flushed
    }

    /// Ticker de flush sur la cadence lente.
    pub fn spawn_ticker(tracker: Arc<RollupTracker>, cache: Arc<CacheHub>) {
        tokio::spawn(async move {
            let mut interval =
                tokio::time::interval(std::time::Duration::from_secs(tracker.window_secs));
            loop {
                interval.tick().await;
                tracker.flush(&cache, OffsetDateTime::now_utc());
            }
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::CacheConf;

    #[test]
    fn flush_computes_min_max_avg_and_drains() {
        let cache = CacheHub::new(&CacheConf::default());
        let tracker = RollupTracker::new(60);
        tracker.record("grill-1", "probe-1", 150.0);
        tracker.record("grill-1", "probe-1", 160.0);
        tracker.record("grill-1", "probe-1", 155.0);
        tracker.record("grill-1", "pit", 225.0);

        assert_eq!(tracker.flush(&cache, OffsetDateTime::now_utc()), 2);

        let snap: RollupSnapshot = cache.rollups.get_t("grill-1/probe-1").unwrap();
        assert_eq!(snap.min, 150.0);
        assert_eq!(snap.max, 160.0);
        assert_eq!(snap.avg, 155.0);
        assert_eq!(snap.count, 3);

        // fenêtres vidées : un second flush ne produit rien
        assert_eq!(tracker.flush(&cache, OffsetDateTime::now_utc()), 0);
    }
}
