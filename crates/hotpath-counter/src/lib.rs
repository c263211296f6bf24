//! Execution counter store for hotpath probes.
//!
//! Every line probe injected by `hotpath` ends in a call to
//! [`CounterStore::record`] with the dotted unit identifier and the source line
//! that is about to execute. This crate holds nothing else, so the code that
//! runs inside the profiled program stays small and has no dependency on the
//! rewriter or the report machinery.
//!
//! # Usage
//!
//! ```rust
//! use hotpath_counter::CounterStore;
//! use std::sync::Arc;
//!
//! let store = Arc::new(CounterStore::new());
//! store.record("com.example.Service", 42);
//! store.record("com.example.Service", 42);
//! assert_eq!(store.get("com.example.Service", 42), 2);
//! ```
//!
//! The store is a plain value. Hosts construct one, share it behind an `Arc`,
//! and hand the same instance to the report generator.

use dashmap::DashMap;
use parking_lot::RwLock;
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicU64, Ordering};

/// Owner name that instrumented code invokes for every line probe.
pub const PROBE_OWNER: &str = "hotpath/CounterStore";

/// Method name of the probe call.
pub const PROBE_METHOD: &str = "record";

/// Number of arguments the probe call consumes (unit id, line).
pub const PROBE_ARITY: u8 = 2;

/// Line number -> execution count for a single unit.
pub type LineCounts = BTreeMap<u32, u64>;

/// Unit identifier -> line counts. Ordered so reports built from it are stable.
pub type Snapshot = BTreeMap<String, LineCounts>;

type UnitLines = DashMap<u32, AtomicU64>;

/// Concurrent `(unit, line) -> count` table.
///
/// `record` and `snapshot` share the outer read lock, so readers never stall
/// writers. The per-line cell is an atomic, so an increment is never torn or
/// lost. Only `reset` takes the write lock, which makes the clear atomic with
/// respect to every in-flight `record`.
#[derive(Default)]
pub struct CounterStore {
    table: RwLock<DashMap<Box<str>, UnitLines>>,
}

impl CounterStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Count one execution of `line` in `unit`.
    #[inline]
    pub fn record(&self, unit: &str, line: u32) {
        let table = self.table.read();

        if let Some(lines) = table.get(unit) {
            if let Some(counter) = lines.get(&line) {
                counter.fetch_add(1, Ordering::Relaxed);
                return;
            }
            lines
                .entry(line)
                .or_insert_with(|| AtomicU64::new(0))
                .fetch_add(1, Ordering::Relaxed);
            return;
        }

        table
            .entry(Box::from(unit))
            .or_default()
            .entry(line)
            .or_insert_with(|| AtomicU64::new(0))
            .fetch_add(1, Ordering::Relaxed);
    }

    /// Current count for a key, 0 when it was never recorded.
    pub fn get(&self, unit: &str, line: u32) -> u64 {
        let table = self.table.read();
        table
            .get(unit)
            .and_then(|lines| lines.get(&line).map(|c| c.load(Ordering::Relaxed)))
            .unwrap_or(0)
    }

    /// Deep copy of every counter.
    pub fn snapshot(&self) -> Snapshot {
        let table = self.table.read();
        table
            .iter()
            .map(|unit| {
                let lines = unit
                    .value()
                    .iter()
                    .map(|cell| (*cell.key(), cell.value().load(Ordering::Relaxed)))
                    .collect();
                (unit.key().to_string(), lines)
            })
            .collect()
    }

    /// Drop every counter.
    pub fn reset(&self) {
        self.table.write().clear();
    }

    pub fn is_empty(&self) -> bool {
        self.table.read().is_empty()
    }

    /// Number of distinct units with at least one recorded line.
    pub fn unit_count(&self) -> usize {
        self.table.read().len()
    }
}

impl std::fmt::Debug for CounterStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CounterStore")
            .field("units", &self.unit_count())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;
    use std::sync::Arc;

    #[test]
    fn test_record_and_get() {
        let store = CounterStore::new();
        store.record("com.example.Test", 10);
        store.record("com.example.Test", 10);
        store.record("com.example.Test", 20);

        assert_eq!(store.get("com.example.Test", 10), 2);
        assert_eq!(store.get("com.example.Test", 20), 1);
        assert_eq!(store.get("com.example.Test", 30), 0);
        assert_eq!(store.get("NonExistent", 10), 0);
    }

    #[test]
    fn test_snapshot_is_a_copy() {
        let store = CounterStore::new();
        store.record("A", 1);
        store.record("B", 2);

        let mut snapshot = store.snapshot();
        assert_eq!(snapshot.len(), 2);
        assert_eq!(snapshot["A"][&1], 1);
        assert_eq!(snapshot["B"][&2], 1);

        snapshot.get_mut("A").unwrap().insert(1, 100);
        snapshot.remove("B");
        assert_eq!(store.get("A", 1), 1);
        assert_eq!(store.get("B", 2), 1);
    }

    #[test]
    fn test_reset() {
        let store = CounterStore::new();
        store.record("A", 1);
        store.record("B", 7);
        store.reset();

        assert_eq!(store.get("A", 1), 0);
        assert_eq!(store.get("B", 7), 0);
        assert!(store.snapshot().is_empty());
        assert!(store.is_empty());
    }

    fn hammer(threads: usize, per_thread: u64) {
        let store = Arc::new(CounterStore::new());
        std::thread::scope(|s| {
            for t in 0..threads {
                let store = &store;
                s.spawn(move || {
                    for _ in 0..per_thread {
                        store.record("ThreadSafeTest", 1);
                        store.record(&format!("Unit{}", t % 7), (t % 3) as u32);
                    }
                });
            }
        });

        assert_eq!(store.get("ThreadSafeTest", 1), threads as u64 * per_thread);
        let spread: u64 = store
            .snapshot()
            .iter()
            .filter(|(unit, _)| unit.starts_with("Unit"))
            .flat_map(|(_, lines)| lines.values())
            .sum();
        assert_eq!(spread, threads as u64 * per_thread);
    }

    #[test]
    fn test_concurrent_single_writer() {
        hammer(1, 5_000);
    }

    #[test]
    fn test_concurrent_ten_writers() {
        hammer(10, 1_000);
    }

    #[test]
    fn test_concurrent_many_writers() {
        hammer(128, 200);
    }

    #[test]
    fn test_reset_racing_records_keeps_structure_valid() {
        let store = Arc::new(CounterStore::new());
        std::thread::scope(|s| {
            for _ in 0..8 {
                let store = &store;
                s.spawn(move || {
                    for i in 0..2_000u32 {
                        store.record("Race", i % 5);
                    }
                });
            }
            let store = &store;
            s.spawn(move || {
                for _ in 0..50 {
                    store.reset();
                    let _ = store.snapshot();
                }
            });
        });

        let snapshot = store.snapshot();
        let total: u64 = snapshot.values().flat_map(|l| l.values()).sum();
        assert!(total <= 8 * 2_000);
        for lines in snapshot.values() {
            assert!(!lines.is_empty());
            assert!(lines.values().all(|&count| count > 0));
        }
    }

    proptest! {
        #[test]
        fn prop_counts_equal_multiplicity(
            calls in proptest::collection::vec((0usize..4, 0u32..6), 0..200)
        ) {
            let units = ["a.A", "a.A$Inner", "b.B", "c.C"];
            let store = CounterStore::new();
            let mut expected: BTreeMap<(usize, u32), u64> = BTreeMap::new();
            for &(unit, line) in &calls {
                store.record(units[unit], line);
                *expected.entry((unit, line)).or_default() += 1;
            }
            for ((unit, line), count) in expected {
                prop_assert_eq!(store.get(units[unit], line), count);
            }
        }
    }
}
