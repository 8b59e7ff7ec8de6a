//! The two-generation, version-partitioned work queue shared by all workers.
//!
//! Workers pop from the *current* generation and push results into the
//! *next* one; [`VersionedWorkQueue::rotate`] promotes *next* to *current*
//! between stages. Exactly one key of the current generation is active at a
//! time. When its sub-queue drains, the successor is picked uniformly at
//! random from the remaining keys.

use std::collections::{BTreeMap, HashMap, VecDeque};
use std::path::{Path, PathBuf};
use std::sync::MutexGuard;
use std::time::{Duration, Instant};

use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use serde::Serialize;
use tracing::{debug, info};

use crate::config::QueueSection;
use crate::error::ErrorCode;
use crate::item::WorkItem;
use crate::lock::{LockTimeout, lock_with_timeout};
use crate::persist::{self, PersistError, Staging};
use crate::version::VersionKey;
use crate::watchdog::Watchdog;

const TEST_PROGRESS_EVERY: usize = 100;
const OUTPUT_PROGRESS_EVERY: usize = 20;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct QueueConfig {
    /// Global item limit; see [`VersionedWorkQueue::insert`] and [`VersionedWorkQueue::pop`].
    pub limit: usize,
    pub enforce_limit: bool,
    pub lock_timeout: Duration,
    /// Seed for active-key selection.
    pub seed: u64,
}

impl Default for QueueConfig {
    fn default() -> Self {
        Self::from_section(&QueueSection::default(), 0)
    }
}

impl QueueConfig {
    #[must_use]
    pub const fn from_section(section: &QueueSection, seed: u64) -> Self {
        Self {
            limit: section.limit,
            enforce_limit: section.enforce_limit,
            lock_timeout: section.lock_timeout(),
            seed,
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum QueueError {
    #[error(transparent)]
    LockTimeout(#[from] LockTimeout),

    #[error(transparent)]
    Persist(#[from] PersistError),
}

impl QueueError {
    #[must_use]
    pub const fn code(&self) -> ErrorCode {
        match self {
            Self::LockTimeout(err) => err.code(),
            Self::Persist(err) => err.code(),
        }
    }

    /// Transient failures are retried by the caller.
    #[must_use]
    pub const fn is_transient(&self) -> bool {
        matches!(self, Self::LockTimeout(_))
    }
}

/// Per-pass counters, reset by [`VersionedWorkQueue::rotate`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct QueueCounters {
    /// Items inserted into the current generation.
    pub inputs: usize,
    /// Items popped this pass.
    pub tests: usize,
    /// Items advanced into the next generation.
    pub outputs: usize,
    /// Items pushed back into the current generation.
    pub requeued: usize,
    /// Tests that produced a usable verdict.
    pub valid: usize,
}

/// Key → FIFO map plus an arena of the keys it holds.
#[derive(Debug, Default)]
struct Generation {
    queues: HashMap<VersionKey, VecDeque<WorkItem>>,
    keys: Vec<VersionKey>,
    len: usize,
}

impl Generation {
    fn push(&mut self, key: VersionKey, item: WorkItem) {
        let queue = self.queues.entry(key).or_default();
        if queue.is_empty() && !self.keys.contains(&key) {
            self.keys.push(key);
        }
        queue.push_back(item);
        self.len += 1;
    }

    fn pop(&mut self, key: VersionKey) -> Option<WorkItem> {
        let item = self.queues.get_mut(&key)?.pop_front()?;
        self.len -= 1;
        Some(item)
    }

    fn has_items(&self, key: VersionKey) -> bool {
        self.queues.get(&key).is_some_and(|q| !q.is_empty())
    }

    fn remove_key(&mut self, key: VersionKey) {
        if let Some(queue) = self.queues.remove(&key) {
            self.len -= queue.len();
        }
        if let Some(pos) = self.keys.iter().position(|k| *k == key) {
            self.keys.swap_remove(pos);
        }
    }

    fn pick(&self, rng: &mut StdRng) -> Option<VersionKey> {
        if self.keys.is_empty() {
            return None;
        }
        Some(self.keys[rng.gen_range(0..self.keys.len())])
    }

    fn sorted_keys(&self) -> Vec<VersionKey> {
        let mut keys = self.keys.clone();
        keys.sort_unstable();
        keys
    }

    /// Copy the items of `keys` through `staging`, in key order, and repoint
    /// them at the copies.
    fn stage(&mut self, keys: &[VersionKey], staging: &mut Staging) -> Result<usize, PersistError> {
        for key in keys {
            for item in self.queues.get(key).into_iter().flatten() {
                staging.reserve(item);
            }
        }
        let mut written = 0;
        for key in keys {
            let Some(queue) = self.queues.get_mut(key) else {
                continue;
            };
            for item in queue.iter_mut() {
                *item = staging.copy(item)?;
                written += 1;
            }
        }
        Ok(written)
    }

    fn clear(&mut self) {
        self.queues.clear();
        self.keys.clear();
        self.len = 0;
    }
}

#[derive(Debug)]
struct State {
    current: Generation,
    next: Generation,
    active: Option<VersionKey>,
    counters: QueueCounters,
    rng: StdRng,
    started: Instant,
}

impl State {
    fn select_active(&mut self) {
        self.active = self.current.pick(&mut self.rng);
    }

    fn minutes(&self) -> f64 {
        self.started.elapsed().as_secs_f64() / 60.0
    }

    #[allow(clippy::cast_precision_loss)]
    fn throughput(&self) -> f64 {
        let minutes = self.minutes();
        if minutes > 0.0 {
            self.counters.tests as f64 / minutes
        } else {
            0.0
        }
    }
}

/// Thread-safe two-generation queue. Every operation holds one mutex for
/// its whole duration and gives up after the configured lock timeout.
#[derive(Debug)]
pub struct VersionedWorkQueue {
    config: QueueConfig,
    state: std::sync::Mutex<State>,
    watchdog: Watchdog,
}

impl VersionedWorkQueue {
    #[must_use]
    pub fn new(config: QueueConfig, watchdog: Watchdog) -> Self {
        Self {
            config,
            state: std::sync::Mutex::new(State {
                current: Generation::default(),
                next: Generation::default(),
                active: None,
                counters: QueueCounters::default(),
                rng: StdRng::seed_from_u64(config.seed),
                started: Instant::now(),
            }),
            watchdog,
        }
    }

    /// Queue with every seed item inserted under `key`.
    ///
    /// # Errors
    ///
    /// Returns [`QueueError::LockTimeout`] if the queue lock is unavailable.
    pub fn seeded(
        config: QueueConfig,
        watchdog: Watchdog,
        key: VersionKey,
        items: impl IntoIterator<Item = WorkItem>,
    ) -> Result<Self, QueueError> {
        let queue = Self::new(config, watchdog);
        for item in items {
            queue.insert(key, item)?;
        }
        Ok(queue)
    }

    #[must_use]
    pub const fn config(&self) -> &QueueConfig {
        &self.config
    }

    #[must_use]
    pub const fn watchdog(&self) -> &Watchdog {
        &self.watchdog
    }

    fn state(&self) -> Result<MutexGuard<'_, State>, QueueError> {
        Ok(lock_with_timeout(&self.state, self.config.lock_timeout)?)
    }

    /// Append `item` to the current generation under `key`.
    ///
    /// Returns `false` without inserting when the limit is enforced and the
    /// current generation already holds `limit` items.
    ///
    /// # Errors
    ///
    /// Returns [`QueueError::LockTimeout`] if the queue lock is unavailable.
    pub fn insert(&self, key: VersionKey, item: WorkItem) -> Result<bool, QueueError> {
        let mut state = self.state()?;
        if self.config.enforce_limit && state.current.len >= self.config.limit {
            return Ok(false);
        }
        state.current.push(key, item);
        state.counters.inputs += 1;
        if state.active.is_none() {
            state.active = Some(key);
        }
        Ok(true)
    }

    /// Pop the head item of the active key.
    ///
    /// Returns `None` once the current generation is exhausted, or, with the
    /// limit enforced, once `limit` items have been advanced this pass (the
    /// rest of the current generation is discarded).
    ///
    /// # Errors
    ///
    /// Returns [`QueueError::LockTimeout`] if the queue lock is unavailable.
    pub fn pop(&self) -> Result<Option<(WorkItem, VersionKey)>, QueueError> {
        let mut state = self.state()?;

        if self.config.enforce_limit && state.counters.outputs >= self.config.limit {
            if state.current.len > 0 {
                info!(
                    limit = self.config.limit,
                    discarded = state.current.len,
                    "output limit reached; discarding remaining items"
                );
            }
            state.current.clear();
            state.active = None;
            return Ok(None);
        }

        loop {
            let Some(key) = state.active else {
                return Ok(None);
            };
            let Some(item) = state.current.pop(key) else {
                state.current.remove_key(key);
                state.select_active();
                continue;
            };
            if !state.current.has_items(key) {
                state.current.remove_key(key);
                state.select_active();
            }

            state.counters.tests += 1;
            if state.counters.tests % TEST_PROGRESS_EVERY == 0 {
                info!(
                    tests = state.counters.tests,
                    outputs = state.counters.outputs,
                    valid = state.counters.valid,
                    minutes = %format!("{:.3}", state.minutes()),
                    per_minute = %format!("{:.3}", state.throughput()),
                    "queue progress"
                );
            }
            return Ok(Some((item, key)));
        }
    }

    /// The active key, if any.
    ///
    /// # Errors
    ///
    /// Returns [`QueueError::LockTimeout`] if the queue lock is unavailable.
    pub fn current_key(&self) -> Result<Option<VersionKey>, QueueError> {
        Ok(self.state()?.active)
    }

    /// Append an output item to the next generation.
    ///
    /// # Errors
    ///
    /// Returns [`QueueError::LockTimeout`] if the queue lock is unavailable.
    pub fn advance(&self, key: VersionKey, item: WorkItem) -> Result<(), QueueError> {
        let mut state = self.state()?;
        state.next.push(key, item);
        state.counters.outputs += 1;
        if state.counters.outputs % OUTPUT_PROGRESS_EVERY == 0 {
            info!(
                tests = state.counters.tests,
                outputs = state.counters.outputs,
                valid = state.counters.valid,
                minutes = %format!("{:.3}", state.minutes()),
                per_minute = %format!("{:.3}", state.throughput()),
                "stage output progress"
            );
        }
        Ok(())
    }

    /// Append to the current generation, bypassing rotation and the limit.
    ///
    /// # Errors
    ///
    /// Returns [`QueueError::LockTimeout`] if the queue lock is unavailable.
    pub fn reinsert(&self, key: VersionKey, item: WorkItem) -> Result<(), QueueError> {
        let mut state = self.state()?;
        state.current.push(key, item);
        state.counters.requeued += 1;
        if state.active.is_none() {
            state.active = Some(key);
        }
        debug!(%key, "item reinserted into current generation");
        Ok(())
    }

    /// Record a test that produced a usable verdict.
    ///
    /// # Errors
    ///
    /// Returns [`QueueError::LockTimeout`] if the queue lock is unavailable.
    pub fn count_valid(&self) -> Result<(), QueueError> {
        self.state()?.counters.valid += 1;
        Ok(())
    }

    /// Promote the next generation to current and start a new pass.
    ///
    /// # Errors
    ///
    /// Returns [`QueueError::LockTimeout`] if the queue lock is unavailable.
    pub fn rotate(&self) -> Result<(), QueueError> {
        let mut state = self.state()?;
        state.current = std::mem::take(&mut state.next);
        state.select_active();
        state.counters = QueueCounters {
            inputs: state.counters.outputs,
            ..QueueCounters::default()
        };
        Ok(())
    }

    /// Items remaining in the current generation.
    ///
    /// # Errors
    ///
    /// Returns [`QueueError::LockTimeout`] if the queue lock is unavailable.
    pub fn pending(&self) -> Result<usize, QueueError> {
        Ok(self.state()?.current.len)
    }

    /// Counters for the running pass.
    ///
    /// # Errors
    ///
    /// Returns [`QueueError::LockTimeout`] if the queue lock is unavailable.
    pub fn counters(&self) -> Result<QueueCounters, QueueError> {
        Ok(self.state()?.counters)
    }

    /// Every item of the current generation, sorted by key then item.
    ///
    /// # Errors
    ///
    /// Returns [`QueueError::LockTimeout`] if the queue lock is unavailable.
    pub fn items(&self) -> Result<Vec<(VersionKey, WorkItem)>, QueueError> {
        let state = self.state()?;
        let mut rows: Vec<(VersionKey, WorkItem)> = state
            .current
            .queues
            .iter()
            .flat_map(|(key, queue)| queue.iter().map(|item| (*key, item.clone())))
            .collect();
        rows.sort();
        Ok(rows)
    }

    /// Copy every current item into `dir` and repoint the queued items at the
    /// copies. Returns the number of items written.
    ///
    /// # Errors
    ///
    /// Returns an error if the lock is unavailable or a file cannot be written.
    pub fn snapshot(&self, dir: &Path) -> Result<usize, QueueError> {
        let mut state = self.state()?;
        let keys = state.current.sorted_keys();
        Ok(state.current.stage(&keys, &mut Staging::new(dir)?)?)
    }

    /// Write `result.csv` for the current generation into `dir`.
    ///
    /// # Errors
    ///
    /// Returns an error if the lock is unavailable or the file cannot be written.
    pub fn snapshot_csv(&self, dir: &Path) -> Result<PathBuf, QueueError> {
        let mut rows = self.items()?;
        Ok(persist::write_result_csv(dir, &mut rows)?)
    }

    /// Report layout: one subdirectory per target revision holding the
    /// items and one changelog line per distinct note produced by `changelog`
    /// for the keys ending there.
    ///
    /// # Errors
    ///
    /// Returns an error if the lock is unavailable or a file cannot be written.
    pub fn snapshot_grouped(
        &self,
        dir: &Path,
        changelog: impl Fn(VersionKey) -> String,
    ) -> Result<usize, QueueError> {
        let mut state = self.state()?;
        let mut groups: BTreeMap<u64, Vec<VersionKey>> = BTreeMap::new();
        for key in state.current.sorted_keys() {
            groups.entry(key.endpoints().1).or_default().push(key);
        }

        let mut written = 0;
        for (target, keys) in groups {
            let group_dir = dir.join(target.to_string());
            let mut notes: Vec<String> = Vec::new();
            for &key in &keys {
                let mut note = changelog(key);
                if !note.ends_with('\n') {
                    note.push('\n');
                }
                if !notes.contains(&note) {
                    notes.push(note);
                }
            }
            persist::write_changelog(&group_dir, &notes.concat())?;
            written += state.current.stage(&keys, &mut Staging::new(&group_dir)?)?;
        }
        Ok(written)
    }

    /// Periodic hook for the orchestrator: sweep for hung browsers.
    pub fn monitor(&self) -> usize {
        self.watchdog.sweep()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;

    fn queue_with(limit: usize) -> VersionedWorkQueue {
        VersionedWorkQueue::new(
            QueueConfig {
                limit,
                enforce_limit: true,
                lock_timeout: Duration::from_millis(200),
                seed: 7,
            },
            Watchdog::new(Duration::from_secs(30)),
        )
    }

    fn item(name: &str) -> WorkItem {
        WorkItem::new(format!("/cases/{name}.html"))
    }

    const PAIR: VersionKey = VersionKey::Pair { base: 1, target: 9 };

    #[test]
    fn pops_in_fifo_order_within_key() {
        let queue = queue_with(100);
        for name in ["a", "b", "c"] {
            assert!(queue.insert(PAIR, item(name)).unwrap());
        }
        assert_eq!(queue.current_key().unwrap(), Some(PAIR));

        let popped: Vec<_> = std::iter::from_fn(|| queue.pop().unwrap())
            .map(|(item, key)| {
                assert_eq!(key, PAIR);
                item.file_name()
            })
            .collect();
        assert_eq!(popped, vec!["a.html", "b.html", "c.html"]);
        assert_eq!(queue.current_key().unwrap(), None);
        assert_eq!(queue.counters().unwrap().tests, 3);
    }

    #[test]
    fn drained_key_hands_over_to_another_key() {
        let queue = queue_with(100);
        let other = VersionKey::Single(4);
        queue.insert(PAIR, item("a")).unwrap();
        queue.insert(other, item("b")).unwrap();

        let (_, first) = queue.pop().unwrap().unwrap();
        assert_eq!(first, PAIR);
        assert_eq!(queue.current_key().unwrap(), Some(other));
        let (_, second) = queue.pop().unwrap().unwrap();
        assert_eq!(second, other);
        assert!(queue.pop().unwrap().is_none());
    }

    #[test]
    fn insert_respects_limit() {
        let queue = queue_with(2);
        assert!(queue.insert(PAIR, item("a")).unwrap());
        assert!(queue.insert(PAIR, item("b")).unwrap());
        assert!(!queue.insert(PAIR, item("c")).unwrap());
        assert_eq!(queue.pending().unwrap(), 2);
    }

    #[test]
    fn pop_stops_once_outputs_reach_limit() {
        let queue = queue_with(1);
        queue.insert(PAIR, item("a")).unwrap();
        queue.reinsert(PAIR, item("b")).unwrap();

        let (first, key) = queue.pop().unwrap().unwrap();
        queue.advance(key, first).unwrap();
        assert!(queue.pop().unwrap().is_none());
        assert_eq!(queue.pending().unwrap(), 0);
    }

    #[test]
    fn unenforced_limit_is_ignored() {
        let queue = VersionedWorkQueue::new(
            QueueConfig {
                limit: 1,
                enforce_limit: false,
                ..QueueConfig::default()
            },
            Watchdog::new(Duration::from_secs(30)),
        );
        assert!(queue.insert(PAIR, item("a")).unwrap());
        assert!(queue.insert(PAIR, item("b")).unwrap());
        assert_eq!(queue.pending().unwrap(), 2);
    }

    #[test]
    fn reinserted_items_are_popped_in_same_pass() {
        let queue = queue_with(100);
        let narrowed = VersionKey::Bracket {
            low: 1,
            high: 5,
            reference: 9,
        };
        queue.insert(PAIR, item("a")).unwrap();
        let (popped, _) = queue.pop().unwrap().unwrap();
        assert_eq!(queue.current_key().unwrap(), None);

        queue.reinsert(narrowed, popped).unwrap();
        assert_eq!(queue.current_key().unwrap(), Some(narrowed));
        let (again, key) = queue.pop().unwrap().unwrap();
        assert_eq!(key, narrowed);
        assert_eq!(again.file_name(), "a.html");
        assert_eq!(queue.counters().unwrap().requeued, 1);
    }

    #[test]
    fn rotate_promotes_next_generation() {
        let queue = queue_with(100);
        queue.insert(PAIR, item("a")).unwrap();
        let (popped, key) = queue.pop().unwrap().unwrap();
        queue.advance(key, popped).unwrap();
        assert!(queue.pop().unwrap().is_none());

        queue.rotate().unwrap();
        let counters = queue.counters().unwrap();
        assert_eq!(counters.inputs, 1);
        assert_eq!(counters.outputs, 0);
        assert_eq!(queue.current_key().unwrap(), Some(PAIR));
        assert_eq!(queue.pending().unwrap(), 1);
    }

    #[test]
    fn rotating_empty_next_leaves_queue_empty() {
        let queue = queue_with(100);
        queue.insert(PAIR, item("a")).unwrap();
        queue.rotate().unwrap();
        assert_eq!(queue.current_key().unwrap(), None);
        assert_eq!(queue.pending().unwrap(), 0);
        assert!(queue.pop().unwrap().is_none());

        queue.rotate().unwrap();
        assert_eq!(queue.current_key().unwrap(), None);
    }

    #[test]
    fn held_lock_surfaces_as_transient_timeout() {
        let queue = queue_with(100);
        let _held = queue.state.lock().unwrap();
        let err = queue.pop().unwrap_err();
        assert!(err.is_transient());
        assert_eq!(err.code(), ErrorCode::LockContention);
    }

    #[test]
    fn snapshot_copies_and_repoints_items() {
        let src = tempfile::tempdir().unwrap();
        let out = tempfile::tempdir().unwrap();
        let html = src.path().join("a.html");
        fs::write(&html, "<p>a</p>").unwrap();

        let queue = queue_with(100);
        queue
            .insert(PAIR, WorkItem::with_mutations(&html, vec!["m();".into()]))
            .unwrap();

        let stage = out.path().join("Generate");
        assert_eq!(queue.snapshot(&stage).unwrap(), 1);
        let csv = queue.snapshot_csv(&stage).unwrap();

        let (item, _) = queue.pop().unwrap().unwrap();
        assert_eq!(item.test_case, stage.join("a.html"));
        assert_eq!(fs::read_to_string(stage.join("a.js")).unwrap(), "m();");
        let content = fs::read_to_string(csv).unwrap();
        assert!(content.starts_with("base,target,ref,file\n1, 9, 9, "));
    }

    #[test]
    fn grouped_snapshot_splits_by_target_revision() {
        let src = tempfile::tempdir().unwrap();
        let out = tempfile::tempdir().unwrap();
        for name in ["a", "b"] {
            fs::write(src.path().join(format!("{name}.html")), name).unwrap();
        }

        let queue = queue_with(100);
        let first = VersionKey::Bracket {
            low: 5,
            high: 6,
            reference: 9,
        };
        let second = VersionKey::Bracket {
            low: 6,
            high: 7,
            reference: 9,
        };
        queue
            .insert(first, WorkItem::new(src.path().join("a.html")))
            .unwrap();
        queue
            .insert(second, WorkItem::new(src.path().join("b.html")))
            .unwrap();

        let written = queue
            .snapshot_grouped(out.path(), |key| {
                let (low, high) = key.endpoints();
                format!("{low}..{high}")
            })
            .unwrap();
        assert_eq!(written, 2);
        assert_eq!(
            fs::read_to_string(out.path().join("6/changelog.txt")).unwrap(),
            "5..6\n"
        );
        assert!(out.path().join("6/a.html").exists());
        assert!(out.path().join("7/b.html").exists());
    }

    #[test]
    fn snapshot_keeps_same_named_seeds_apart() {
        let src = tempfile::tempdir().unwrap();
        let out = tempfile::tempdir().unwrap();
        for (sub, body) in [("one", "<p>FIRST</p>"), ("two", "<p>SECOND</p>")] {
            fs::create_dir_all(src.path().join(sub)).unwrap();
            fs::write(src.path().join(sub).join("case.html"), body).unwrap();
        }

        let queue = queue_with(100);
        for seed in crate::item::discover_seeds(src.path()).unwrap() {
            queue.insert(VersionKey::Single(1), seed).unwrap();
        }
        let stage = out.path().join("Generate");
        assert_eq!(queue.snapshot(&stage).unwrap(), 2);

        let mut contents: Vec<String> = std::iter::from_fn(|| queue.pop().unwrap())
            .map(|(item, _)| fs::read_to_string(item.test_case).unwrap())
            .collect();
        contents.sort();
        assert_eq!(contents, ["<p>FIRST</p>", "<p>SECOND</p>"]);
    }

    #[test]
    fn grouped_snapshot_keeps_every_changelog_of_a_target() {
        let src = tempfile::tempdir().unwrap();
        let out = tempfile::tempdir().unwrap();
        for name in ["a", "b"] {
            fs::write(src.path().join(format!("{name}.html")), name).unwrap();
        }

        let queue = queue_with(100);
        let narrow = VersionKey::Bracket {
            low: 6,
            high: 7,
            reference: 9,
        };
        let wide = VersionKey::Bracket {
            low: 4,
            high: 7,
            reference: 9,
        };
        queue
            .insert(narrow, WorkItem::new(src.path().join("a.html")))
            .unwrap();
        queue
            .insert(wide, WorkItem::new(src.path().join("b.html")))
            .unwrap();

        queue
            .snapshot_grouped(out.path(), |key| {
                let (low, high) = key.endpoints();
                format!("{low}..{high}")
            })
            .unwrap();
        let changelog = fs::read_to_string(out.path().join("7/changelog.txt")).unwrap();
        assert_eq!(changelog, "4..7\n6..7\n");
        assert!(out.path().join("7/a.html").exists());
        assert!(out.path().join("7/b.html").exists());
    }
}
