use std::hash::{DefaultHasher, Hash, Hasher};
use std::time::Duration;

/// Bounded retry loop for non-blocking lock attempts. Sleeps between attempts, doubling the
/// interval up to `max_wait`, and never blocks on the lock itself.
#[derive(Debug, Clone, Copy)]
pub struct Backoff {
    attempts: u32,
    initial_wait: Duration,
    max_wait: Duration,
}

impl Backoff {
    pub fn new(attempts: u32, initial_wait: Duration) -> Self {
        Self {
            attempts,
            initial_wait,
            max_wait: initial_wait * 16,
        }
    }

    pub fn retry<F>(&self, mut attempt: F) -> bool
    where
        F: FnMut() -> bool,
    {
        let mut wait = self.initial_wait;
        for round in 0..self.attempts {
            if attempt() {
                return true;
            }

            // No point in sleeping after the last failed attempt.
            if round + 1 < self.attempts {
                std::thread::sleep(wait);
                wait = (wait * 2).min(self.max_wait);
            }
        }
        false
    }
}

/// Derives the path id of the `child_index`th child of an occurrence. Instanced subtrees reached
/// through different parents thus end up with different path ids (splitmix64 finaliser).
pub fn child_path_id(parent_path_id: u64, child_index: usize) -> u64 {
    let mut z = parent_path_id
        .wrapping_add(0x9E37_79B9_7F4A_7C15)
        .wrapping_add((child_index as u64).wrapping_mul(0xBF58_476D_1CE4_E5B9));
    z = (z ^ (z >> 30)).wrapping_mul(0xBF58_476D_1CE4_E5B9);
    z = (z ^ (z >> 27)).wrapping_mul(0x94D0_49BB_1331_11EB);
    z ^ (z >> 31)
}

/// Stable (per process) path id for the root occurrence of a map.
pub fn root_path_id(url: &str) -> u64 {
    let mut hasher = DefaultHasher::new();
    url.hash(&mut hasher);
    child_path_id(hasher.finish(), 0)
}
