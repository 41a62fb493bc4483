//! Counters for monotonically increasing values.

use dashmap::DashMap;
use std::sync::atomic::{AtomicU64, Ordering};

/// A monotonically increasing counter.
#[derive(Debug)]
pub struct Counter {
    name: &'static str,
    help: &'static str,
    value: AtomicU64,
}

impl Counter {
    pub const fn new(name: &'static str, help: &'static str) -> Self {
        Self {
            name,
            help,
            value: AtomicU64::new(0),
        }
    }

    pub fn name(&self) -> &'static str {
        self.name
    }

    pub fn help(&self) -> &'static str {
        self.help
    }

    pub fn inc(&self) {
        self.inc_by(1);
    }

    pub fn inc_by(&self, n: u64) {
        self.value.fetch_add(n, Ordering::Relaxed);
    }

    pub fn get(&self) -> u64 {
        self.value.load(Ordering::Relaxed)
    }
}

/// A counter keyed by a single label value, e.g. abort kind.
#[derive(Debug)]
pub struct LabeledCounter {
    name: &'static str,
    label: &'static str,
    values: DashMap<String, u64>,
}

impl LabeledCounter {
    pub fn new(name: &'static str, label: &'static str) -> Self {
        Self {
            name,
            label,
            values: DashMap::new(),
        }
    }

    pub fn name(&self) -> &'static str {
        self.name
    }

    /// Name of the label dimension.
    pub fn label(&self) -> &'static str {
        self.label
    }

    pub fn inc(&self, value: &str) {
        *self.values.entry(value.to_string()).or_insert(0) += 1;
    }

    pub fn get(&self, value: &str) -> u64 {
        self.values.get(value).map(|v| *v).unwrap_or(0)
    }

    /// All label values with their counts, sorted by label.
    pub fn get_all(&self) -> Vec<(String, u64)> {
        let mut all: Vec<_> = self
            .values
            .iter()
            .map(|entry| (entry.key().clone(), *entry.value()))
            .collect();
        all.sort();
        all
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_counter() {
        let counter = Counter::new("commands_sent", "Participant commands sent");
        counter.inc();
        counter.inc_by(4);
        assert_eq!(counter.get(), 5);
        assert_eq!(counter.name(), "commands_sent");
    }

    #[test]
    fn test_labeled_counter() {
        let counter = LabeledCounter::new("aborts", "kind");
        counter.inc("user-abort");
        counter.inc("user-abort");
        counter.inc("unreachable");
        assert_eq!(counter.get("user-abort"), 2);
        assert_eq!(counter.get("routing-conflict"), 0);
        assert_eq!(
            counter.get_all(),
            vec![("unreachable".to_string(), 1), ("user-abort".to_string(), 2)]
        );
    }
}
