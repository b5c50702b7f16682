//! Message and subscription id generation.
//!
//! The only contract is uniqueness within the process lifetime.

use std::sync::atomic::{AtomicU64, Ordering};

/// Source of unique ids for messages and subscriptions.
pub trait IdGenerator: Send + Sync {
    fn next_id(&self) -> String;
}

/// Random UUID v4 ids. The default generator.
#[derive(Debug, Clone, Copy, Default)]
pub struct UuidGenerator;

impl IdGenerator for UuidGenerator {
    fn next_id(&self) -> String {
        uuid::Uuid::new_v4().to_string()
    }
}

/// Monotonic `"<prefix>-<n>"` ids scoped to one node.
///
/// Counting starts at 1. Deterministic, which makes it the generator of
/// choice for tests that assert on ids.
#[derive(Debug)]
pub struct SequentialGenerator {
    prefix: String,
    next: AtomicU64,
}

impl SequentialGenerator {
    #[must_use]
    pub fn new(prefix: impl Into<String>) -> Self {
        Self {
            prefix: prefix.into(),
            next: AtomicU64::new(1),
        }
    }
}

impl IdGenerator for SequentialGenerator {
    fn next_id(&self) -> String {
        let n = self.next.fetch_add(1, Ordering::Relaxed);
        format!("{}-{n}", self.prefix)
    }
}

#[cfg(test)]
mod tests {
    use std::collections::HashSet;

    use super::*;

    #[test]
    fn sequential_ids_count_from_one() {
        let ids = SequentialGenerator::new("node-a");
        assert_eq!(ids.next_id(), "node-a-1");
        assert_eq!(ids.next_id(), "node-a-2");
    }

    #[test]
    fn uuid_ids_do_not_repeat() {
        let seen: HashSet<String> = (0..1000).map(|_| UuidGenerator.next_id()).collect();
        assert_eq!(seen.len(), 1000);
    }
}
