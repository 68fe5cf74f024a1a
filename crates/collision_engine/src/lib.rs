use core_types::{Collision, SourceName, TxHash};
use infra_cache::FifoShardMap;

/// Correlates hash arrivals across per-source FIFO caches.
///
/// Each source owns one cache; only the detector mutates them. Every
/// secondary is compared against the single reference source, never against
/// another secondary. Reads are non-destructive, so a genuine near-tie can
/// be reported once from each side before the entries age out; that bounded
/// double-report is accepted in exchange for keeping probes lock-step free.
///
/// A correlation is only found while both entries coexist in their caches.
/// Once FIFO eviction drops an unmatched entry, that pair is lost for good.
pub struct CollisionDetector {
    reference: SourceName,
    ref_cache: FifoShardMap<TxHash, i64>,
    secondaries: Vec<SecondarySlot>,
}

struct SecondarySlot {
    name: SourceName,
    cache: FifoShardMap<TxHash, i64>,
}

impl CollisionDetector {
    /// Probe order over secondaries is fixed to the order given here.
    pub fn new(
        reference: SourceName,
        secondaries: impl IntoIterator<Item = SourceName>,
        cache_capacity: usize,
        cache_shards: usize,
    ) -> Self {
        Self {
            reference,
            ref_cache: FifoShardMap::new(cache_capacity, cache_shards),
            secondaries: secondaries
                .into_iter()
                .map(|name| SecondarySlot {
                    name,
                    cache: FifoShardMap::new(cache_capacity, cache_shards),
                })
                .collect(),
        }
    }

    pub fn reference(&self) -> &SourceName {
        &self.reference
    }

    /// Record one arrival and probe the opposite side for a match.
    ///
    /// The arrival is cached first (duplicates overwrite harmlessly), then:
    /// a reference arrival probes each secondary cache in order and stops at
    /// the first hit; a secondary arrival probes only the reference cache.
    /// `diff_us` is `reference_ts - secondary_ts` in both directions.
    pub fn observe(&self, source: &SourceName, hash: &str, ts_us: i64) -> Option<Collision> {
        if *source == self.reference {
            self.ref_cache.put(hash.to_string(), ts_us);
            for slot in &self.secondaries {
                if let Some(sec_ts) = slot.cache.get(hash) {
                    return Some(Collision {
                        winner: slot.name.clone(),
                        loser: self.reference.clone(),
                        diff_us: ts_us - sec_ts,
                        hash: hash.to_string(),
                    });
                }
            }
            return None;
        }

        let Some(slot) = self.secondaries.iter().find(|s| s.name == *source) else {
            tracing::warn!(%source, "observation from unconfigured source dropped");
            return None;
        };
        slot.cache.put(hash.to_string(), ts_us);
        self.ref_cache.get(hash).map(|ref_ts| Collision {
            winner: self.reference.clone(),
            loser: slot.name.clone(),
            diff_us: ref_ts - ts_us,
            hash: hash.to_string(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use smol_str::SmolStr;

    fn detector(secondaries: &[&str]) -> CollisionDetector {
        CollisionDetector::new(
            SmolStr::new("web3"),
            secondaries.iter().map(SmolStr::new),
            16,
            1,
        )
    }

    #[test]
    fn reference_first_then_secondary() {
        let det = detector(&["bloxroute"]);
        assert!(det.observe(&SmolStr::new("web3"), "0xAA", 1_000).is_none());
        let collision = det
            .observe(&SmolStr::new("bloxroute"), "0xAA", 1_200)
            .expect("match");
        assert_eq!(collision.winner, "web3");
        assert_eq!(collision.loser, "bloxroute");
        assert_eq!(collision.diff_us, -200);
        assert_eq!(collision.hash, "0xAA");
    }

    #[test]
    fn secondary_first_then_reference() {
        let det = detector(&["bloxroute"]);
        assert!(det.observe(&SmolStr::new("bloxroute"), "0xAA", 800).is_none());
        let collision = det
            .observe(&SmolStr::new("web3"), "0xAA", 1_000)
            .expect("match");
        assert_eq!(collision.winner, "bloxroute");
        assert_eq!(collision.loser, "web3");
        assert_eq!(collision.diff_us, 200);
    }

    #[test]
    fn unmatched_hashes_stay_pending() {
        let det = detector(&["bloxroute", "fiber"]);
        assert!(det.observe(&SmolStr::new("web3"), "0x01", 100).is_none());
        assert!(det.observe(&SmolStr::new("bloxroute"), "0x02", 110).is_none());
        assert!(det.observe(&SmolStr::new("fiber"), "0x03", 120).is_none());
    }

    #[test]
    fn eviction_permanently_loses_the_correlation() {
        let det = CollisionDetector::new(
            SmolStr::new("web3"),
            [SmolStr::new("bloxroute")],
            2,
            1,
        );
        let blx = SmolStr::new("bloxroute");
        assert!(det.observe(&blx, "0xAA", 100).is_none());
        // Two newer hashes push "0xAA" out of the secondary's cache.
        assert!(det.observe(&blx, "0xBB", 200).is_none());
        assert!(det.observe(&blx, "0xCC", 300).is_none());

        assert!(det.observe(&SmolStr::new("web3"), "0xAA", 400).is_none());
    }

    #[test]
    fn reference_probes_secondaries_in_config_order_and_stops() {
        let det = detector(&["bloxroute", "fiber"]);
        assert!(det.observe(&SmolStr::new("fiber"), "0xAA", 700).is_none());
        assert!(det.observe(&SmolStr::new("bloxroute"), "0xAA", 900).is_none());

        let collision = det
            .observe(&SmolStr::new("web3"), "0xAA", 1_000)
            .expect("match");
        // Both secondaries hold the hash; only the first configured one wins.
        assert_eq!(collision.winner, "bloxroute");
        assert_eq!(collision.diff_us, 100);
    }

    #[test]
    fn duplicate_delivery_overwrites_without_matching_itself() {
        let det = detector(&["bloxroute"]);
        let blx = SmolStr::new("bloxroute");
        assert!(det.observe(&blx, "0xAA", 500).is_none());
        assert!(det.observe(&blx, "0xAA", 600).is_none());

        let collision = det
            .observe(&SmolStr::new("web3"), "0xAA", 1_000)
            .expect("match");
        assert_eq!(collision.diff_us, 400);
    }

    #[test]
    fn unknown_source_is_dropped() {
        let det = detector(&["bloxroute"]);
        assert!(det.observe(&SmolStr::new("nope"), "0xAA", 100).is_none());
        assert!(det.observe(&SmolStr::new("web3"), "0xAA", 200).is_none());
    }
}
