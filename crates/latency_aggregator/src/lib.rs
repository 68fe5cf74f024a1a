use std::collections::HashMap;

use core_types::{Collision, SourceName};
use parking_lot::RwLock;
use serde::Serialize;

/// Histogram fed with accepted latency magnitudes, labeled by winner/loser.
pub const LATENCY_METRIC: &str = "txrace_feed_latency_ms";

/// Default Prometheus bucket boundaries for [`LATENCY_METRIC`], in ms.
pub const DEFAULT_BUCKETS_MS: [f64; 10] =
    [0.0, 5.0, 10.0, 25.0, 50.0, 100.0, 250.0, 500.0, 1000.0, 2500.0];

#[derive(Debug, Clone)]
pub struct FilterConfig {
    /// Warm-up/batching window: only every `warmup_window`-th collision is
    /// even evaluated for recording.
    pub warmup_window: u32,
    /// Millisecond values at or below this bound are extreme negative
    /// outliers (clock skew, garbage correlations) and are discarded.
    pub lower_bound_ms: f64,
}

impl Default for FilterConfig {
    fn default() -> Self {
        Self {
            warmup_window: 10,
            lower_bound_ms: -500.0,
        }
    }
}

/// Subsampling outlier filter in front of the latency distribution.
///
/// One counter, shared across all label pairs. Each collision increments it;
/// until the counter reaches the window the sample is swallowed. At the
/// window, a value above the lower bound is accepted and resets the counter;
/// a value at or below the bound is discarded *without* resetting, so the
/// very next collision is evaluated again. Runs of outliers therefore skip
/// through without consuming the warm-up quota, which keeps the sampling
/// density at roughly one recorded sample per `warmup_window` collisions
/// even under bursty skew.
pub struct OutlierFilter {
    cfg: FilterConfig,
    count: u32,
}

/// A sample that passed the filter; the recorded magnitude is always
/// non-negative, the labels alone say who won.
#[derive(Debug, Clone, PartialEq)]
pub struct AcceptedSample {
    pub winner: SourceName,
    pub loser: SourceName,
    pub magnitude_ms: f64,
}

impl OutlierFilter {
    pub fn new(cfg: FilterConfig) -> Self {
        Self { cfg, count: 0 }
    }

    pub fn offer(&mut self, collision: &Collision) -> Option<AcceptedSample> {
        self.count = self.count.saturating_add(1);
        if self.count < self.cfg.warmup_window {
            return None;
        }
        let millis = collision.diff_us as f64 / 1000.0;
        if millis <= self.cfg.lower_bound_ms {
            return None;
        }
        self.count = 0;
        Some(AcceptedSample {
            winner: collision.winner.clone(),
            loser: collision.loser.clone(),
            magnitude_ms: millis.abs(),
        })
    }
}

/// Record an accepted sample into the Prometheus histogram.
pub fn record(sample: &AcceptedSample) {
    metrics::histogram!(
        LATENCY_METRIC,
        "winner" => sample.winner.to_string(),
        "loser" => sample.loser.to_string(),
    )
    .record(sample.magnitude_ms);
}

#[derive(Debug, Clone, Serialize, PartialEq)]
pub struct PairSamples {
    pub winner: SourceName,
    pub loser: SourceName,
    pub samples: u64,
}

/// Accepted-sample counts per (winner, loser), served by the control API.
/// Written by the single drain task, read concurrently by HTTP handlers.
#[derive(Default)]
pub struct PairTally {
    counts: RwLock<HashMap<(SourceName, SourceName), u64>>,
}

impl PairTally {
    pub fn increment(&self, winner: &SourceName, loser: &SourceName) {
        let mut counts = self.counts.write();
        *counts
            .entry((winner.clone(), loser.clone()))
            .or_default() += 1;
    }

    pub fn snapshot(&self) -> Vec<PairSamples> {
        let mut out = self
            .counts
            .read()
            .iter()
            .map(|((winner, loser), samples)| PairSamples {
                winner: winner.clone(),
                loser: loser.clone(),
                samples: *samples,
            })
            .collect::<Vec<_>>();
        out.sort_by(|a, b| (&a.winner, &a.loser).cmp(&(&b.winner, &b.loser)));
        out
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use smol_str::SmolStr;

    fn collision(winner: &str, loser: &str, diff_us: i64) -> Collision {
        Collision {
            winner: SmolStr::new(winner),
            loser: SmolStr::new(loser),
            diff_us,
            hash: "0xAA".to_string(),
        }
    }

    #[test]
    fn warm_up_swallows_until_window() {
        let mut filter = OutlierFilter::new(FilterConfig::default());
        for _ in 0..9 {
            assert!(filter.offer(&collision("fiber", "web3", 50_000)).is_none());
        }
        let sample = filter
            .offer(&collision("fiber", "web3", 50_000))
            .expect("10th collision is evaluated");
        assert_eq!(sample.magnitude_ms, 50.0);
        assert_eq!(sample.winner, "fiber");
        assert_eq!(sample.loser, "web3");

        // Counter was reset: the next nine are swallowed again.
        for _ in 0..9 {
            assert!(filter.offer(&collision("fiber", "web3", 50_000)).is_none());
        }
        assert!(filter.offer(&collision("fiber", "web3", 50_000)).is_some());
    }

    #[test]
    fn rejected_outlier_does_not_reset_the_counter() {
        let mut filter = OutlierFilter::new(FilterConfig::default());
        for _ in 0..9 {
            assert!(filter.offer(&collision("web3", "fiber", 10_000)).is_none());
        }
        // 10th is an extreme negative outlier: discarded, counter untouched.
        assert!(filter.offer(&collision("web3", "fiber", -600_000)).is_none());
        // So the very next collision is immediately re-evaluated.
        let sample = filter
            .offer(&collision("web3", "fiber", 10_000))
            .expect("first in-bound value after the outlier run");
        assert_eq!(sample.magnitude_ms, 10.0);
    }

    #[test]
    fn magnitude_is_absolute_and_labels_are_preserved() {
        let mut filter = OutlierFilter::new(FilterConfig {
            warmup_window: 1,
            lower_bound_ms: -500.0,
        });
        let sample = filter
            .offer(&collision("web3", "bloxroute", -200_000))
            .expect("reference win is in bound");
        assert_eq!(sample.magnitude_ms, 200.0);
        assert_eq!(sample.winner, "web3");
        assert_eq!(sample.loser, "bloxroute");
    }

    #[test]
    fn counter_is_shared_across_label_pairs() {
        let mut filter = OutlierFilter::new(FilterConfig::default());
        for i in 0..9 {
            let c = if i % 2 == 0 {
                collision("fiber", "web3", 1_000)
            } else {
                collision("web3", "bloxroute", -1_000)
            };
            assert!(filter.offer(&c).is_none());
        }
        // The 10th collision is evaluated no matter which pair it belongs to.
        assert!(filter.offer(&collision("web3", "fiber", 2_000)).is_some());
    }

    #[test]
    fn bound_is_strictly_greater_than() {
        let mut filter = OutlierFilter::new(FilterConfig {
            warmup_window: 1,
            lower_bound_ms: -500.0,
        });
        assert!(filter.offer(&collision("web3", "fiber", -500_000)).is_none());
        assert!(filter.offer(&collision("web3", "fiber", -499_999)).is_some());
    }

    #[test]
    fn tally_counts_per_pair() {
        let tally = PairTally::default();
        let fiber = SmolStr::new("fiber");
        let web3 = SmolStr::new("web3");
        tally.increment(&fiber, &web3);
        tally.increment(&fiber, &web3);
        tally.increment(&web3, &fiber);

        let snapshot = tally.snapshot();
        assert_eq!(snapshot.len(), 2);
        assert_eq!(snapshot[0].winner, "fiber");
        assert_eq!(snapshot[0].samples, 2);
        assert_eq!(snapshot[1].winner, "web3");
        assert_eq!(snapshot[1].samples, 1);
    }
}
