//! Sliding-window duplicate request detection.
//!
//! Non-idempotent submissions are retried by clients and may arrive out of
//! order. The detector keeps a bounded, age-aware window of recently seen
//! sequence numbers: exact repeats are rejected, and arrivals older than the
//! whole retained window are treated as *potential* duplicates, with a policy
//! switch deciding whether to accept them. `max_age` must exceed the expected
//! network and backlog latency or legitimate submissions get rejected.

use std::collections::BTreeMap;
use std::sync::Mutex;
use std::time::{Duration, Instant};

use serde::Deserialize;

use crate::config::ConfigError;

/// Tuning for the [`DuplicateRequestDetector`].
#[derive(Debug, Clone, Copy, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct DetectorConfig {
    /// The number of sequence numbers the window tries to retain.
    ///
    /// The window never shrinks below this, and housekeeping only starts once
    /// it holds more than twice as many entries.
    pub cache_size_guide: usize,

    /// Entries older than this may be evicted during housekeeping. At any time
    /// the window holds at least every sequence number seen within `max_age`.
    #[serde(with = "humantime_serde")]
    pub max_age: Duration,

    /// What to do with a sequence number older than the whole retained window:
    /// `false` rejects it, `true` accepts it with a logged warning.
    pub accept_potential_duplicates: bool,
}

impl Default for DetectorConfig {
    fn default() -> Self {
        Self {
            cache_size_guide: 100,
            max_age: Duration::from_secs(60),
            accept_potential_duplicates: false,
        }
    }
}

/// Rejects replayed submissions while tolerating bounded reordering.
///
/// Every operation takes the detector lock; nothing slower than map access
/// happens under it, so it is cheap enough for the per-request call frequency
/// it is intended for.
#[derive(Debug)]
pub struct DuplicateRequestDetector {
    config: DetectorConfig,
    window: Mutex<BTreeMap<u64, Instant>>,
}

impl DuplicateRequestDetector {
    pub fn new(config: DetectorConfig) -> Result<Self, ConfigError> {
        if config.cache_size_guide == 0 {
            return Err(ConfigError::InvalidDetector(
                "cache_size_guide must be positive".into(),
            ));
        }
        if config.max_age.is_zero() {
            return Err(ConfigError::InvalidDetector(
                "max_age must be positive".into(),
            ));
        }
        Ok(Self {
            config,
            window: Mutex::default(),
        })
    }

    /// Decides whether the submission with the given sequence number is new.
    ///
    /// Returns `false` for definite duplicates, and for potential duplicates
    /// unless the policy accepts them.
    pub fn accept(&self, n: u64) -> bool {
        let mut window = self.window.lock().unwrap();

        if window.contains_key(&n) {
            tracing::debug!(sequence = n, "rejecting duplicate submission");
            return false;
        }

        if window.len() >= self.config.cache_size_guide {
            // The window is full and `n` is older than everything we retained,
            // so we cannot tell whether it was seen before.
            if let Some((&min, _)) = window.first_key_value() {
                if n < min {
                    if !self.config.accept_potential_duplicates {
                        tracing::debug!(sequence = n, "rejecting potential duplicate submission");
                        return false;
                    }
                    tracing::warn!(
                        sequence = n,
                        window_min = min,
                        "accepting potential duplicate submission",
                    );
                }
            }
        }

        let now = Instant::now();
        window.insert(n, now);

        // Housekeeping is batched: trimming on every insert would tighten the
        // acceptance boundary for late arrivals.
        if window.len() > self.config.cache_size_guide * 2 {
            while window.len() > self.config.cache_size_guide {
                let Some((&oldest, &seen_at)) = window.first_key_value() else {
                    break;
                };
                if now.duration_since(seen_at) <= self.config.max_age {
                    break;
                }
                window.remove(&oldest);
            }
        }

        true
    }

    /// Current number of retained sequence numbers.
    pub fn window_len(&self) -> usize {
        self.window.lock().unwrap().len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn detector(size_guide: usize, max_age: Duration, accept_potential: bool) -> DuplicateRequestDetector {
        DuplicateRequestDetector::new(DetectorConfig {
            cache_size_guide: size_guide,
            max_age,
            accept_potential_duplicates: accept_potential,
        })
        .unwrap()
    }

    #[test]
    fn invalid_config_is_rejected() {
        let result = DuplicateRequestDetector::new(DetectorConfig {
            cache_size_guide: 0,
            ..Default::default()
        });
        assert!(matches!(result, Err(ConfigError::InvalidDetector(_))));

        let result = DuplicateRequestDetector::new(DetectorConfig {
            max_age: Duration::ZERO,
            ..Default::default()
        });
        assert!(matches!(result, Err(ConfigError::InvalidDetector(_))));
    }

    #[test]
    fn exact_repeat_is_rejected() {
        let detector = detector(10, Duration::from_secs(60), false);
        assert!(detector.accept(5));
        assert!(!detector.accept(5));
    }

    #[test]
    fn reordered_arrivals_within_the_window_are_accepted() {
        let detector = detector(10, Duration::from_secs(60), false);
        for n in [3, 1, 4, 2, 7, 5] {
            assert!(detector.accept(n), "sequence {n} should be accepted");
        }
    }

    #[test]
    fn late_arrival_below_full_window_follows_policy() {
        let rejecting = detector(5, Duration::from_secs(60), false);
        for n in 10..15 {
            assert!(rejecting.accept(n));
        }
        assert!(!rejecting.accept(2));

        let accepting = detector(5, Duration::from_secs(60), true);
        for n in 10..15 {
            assert!(accepting.accept(n));
        }
        assert!(accepting.accept(2));
    }

    #[test]
    fn late_arrival_with_room_in_the_window_is_accepted() {
        let detector = detector(10, Duration::from_secs(60), false);
        assert!(detector.accept(100));
        // window not full, a smaller number is fine
        assert!(detector.accept(1));
    }

    #[test]
    fn young_entries_survive_housekeeping() {
        let size_guide = 5;
        let detector = detector(size_guide, Duration::from_secs(60), false);
        for n in 0..(size_guide as u64 * 2 + 1) {
            assert!(detector.accept(n));
        }
        // all entries are younger than max_age, none may be evicted
        assert!(detector.window_len() > size_guide);
    }

    #[test]
    fn old_entries_are_trimmed_back_to_the_size_guide() {
        let size_guide = 5;
        let detector = detector(size_guide, Duration::from_millis(10), false);
        for n in 0..(size_guide as u64 * 2) {
            assert!(detector.accept(n));
        }
        std::thread::sleep(Duration::from_millis(30));

        // crossing the 2x threshold triggers housekeeping, and everything
        // inserted above has aged out
        assert!(detector.accept(100));
        assert_eq!(detector.window_len(), size_guide);
    }

    #[test]
    fn housekeeping_waits_for_the_batch_threshold() {
        let size_guide = 5;
        let detector = detector(size_guide, Duration::from_millis(10), false);
        for n in 0..(size_guide as u64 + 2) {
            assert!(detector.accept(n));
        }
        std::thread::sleep(Duration::from_millis(30));

        // size_guide + 3 entries is below 2x size_guide, nothing is trimmed yet
        assert!(detector.accept(100));
        assert_eq!(detector.window_len(), size_guide + 3);
    }
}
