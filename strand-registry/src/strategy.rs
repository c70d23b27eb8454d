//! Wire-identifier generation strategies.

use rand::{distributions::Alphanumeric, Rng};
use std::collections::hash_map::DefaultHasher;
use std::hash::Hasher;
use std::sync::atomic::{AtomicU64, Ordering};

/// Produces a wire identifier for a `(service, method)` pair.
pub trait IdStrategy: Send + Sync {
    fn generate(&self, service: &str, method: &str) -> String;

    /// Whether repeated generation for the same pair yields the same id.
    /// Deterministic strategies cannot resolve collisions by retrying.
    fn is_deterministic(&self) -> bool;
}

/// Uniform alphanumeric draw. Non-deterministic, so collisions are resolved
/// by the registry retrying against its id set.
pub struct RandomIds {
    length: usize,
}

impl RandomIds {
    pub fn new(length: usize) -> Self {
        Self { length }
    }
}

impl IdStrategy for RandomIds {
    fn generate(&self, _service: &str, _method: &str) -> String {
        rand::thread_rng()
            .sample_iter(&Alphanumeric)
            .take(self.length)
            .map(char::from)
            .collect()
    }

    fn is_deterministic(&self) -> bool {
        false
    }
}

/// Stable hash of `service.method`, rendered in base 36 and truncated or
/// padded to the configured length. Independently built peers that share a
/// generation pass produce identical ids.
pub struct HashIds {
    length: usize,
}

impl HashIds {
    pub fn new(length: usize) -> Self {
        Self { length }
    }
}

impl IdStrategy for HashIds {
    fn generate(&self, service: &str, method: &str) -> String {
        let mut hasher = DefaultHasher::new();
        hasher.write(service.as_bytes());
        hasher.write(b".");
        hasher.write(method.as_bytes());
        let mut value = hasher.finish();

        let mut id = String::with_capacity(self.length);
        while id.len() < self.length {
            id.push_str(&to_base36(value));
            let mut chain = DefaultHasher::new();
            chain.write_u64(value);
            value = chain.finish();
        }
        id.truncate(self.length);
        id
    }

    fn is_deterministic(&self) -> bool {
        true
    }
}

/// Monotonic counter with a fixed prefix. Deterministic only within one
/// generation run.
pub struct SequentialIds {
    prefix: String,
    counter: AtomicU64,
}

impl SequentialIds {
    pub fn new(prefix: impl Into<String>) -> Self {
        Self {
            prefix: prefix.into(),
            counter: AtomicU64::new(0),
        }
    }
}

impl IdStrategy for SequentialIds {
    fn generate(&self, _service: &str, _method: &str) -> String {
        let n = self.counter.fetch_add(1, Ordering::Relaxed);
        format!("{}{}", self.prefix, n)
    }

    fn is_deterministic(&self) -> bool {
        // each draw advances the counter
        false
    }
}

fn to_base36(mut value: u64) -> String {
    const DIGITS: &[u8] = b"0123456789abcdefghijklmnopqrstuvwxyz";
    if value == 0 {
        return "0".to_string();
    }
    let mut out = Vec::new();
    while value > 0 {
        out.push(DIGITS[(value % 36) as usize]);
        value /= 36;
    }
    out.reverse();
    String::from_utf8(out).unwrap_or_default()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn hash_ids_are_deterministic_and_sized() {
        let strategy = HashIds::new(6);
        let a = strategy.generate("UserService", "getUserById");
        let b = strategy.generate("UserService", "getUserById");
        assert_eq!(a, b);
        assert_eq!(a.len(), 6);
        assert!(a.chars().all(|c| c.is_ascii_alphanumeric()));

        // a fresh strategy instance reproduces the same id
        let c = HashIds::new(6).generate("UserService", "getUserById");
        assert_eq!(a, c);
    }

    #[test]
    fn hash_ids_differ_across_methods() {
        let strategy = HashIds::new(8);
        let a = strategy.generate("UserService", "getUserById");
        let b = strategy.generate("UserService", "deleteUser");
        assert_ne!(a, b);
    }

    #[test]
    fn hash_ids_pad_to_long_lengths() {
        let id = HashIds::new(24).generate("S", "m");
        assert_eq!(id.len(), 24);
    }

    #[test]
    fn random_ids_have_the_requested_length() {
        let strategy = RandomIds::new(10);
        let id = strategy.generate("a", "b");
        assert_eq!(id.len(), 10);
        assert!(id.chars().all(|c| c.is_ascii_alphanumeric()));
    }

    #[test]
    fn sequential_ids_are_prefixed_and_monotonic() {
        let strategy = SequentialIds::new("m");
        assert_eq!(strategy.generate("a", "b"), "m0");
        assert_eq!(strategy.generate("a", "c"), "m1");
        assert_eq!(strategy.generate("a", "d"), "m2");
    }
}
