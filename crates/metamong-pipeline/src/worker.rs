//! One worker abstraction for every stage.
//!
//! A [`Worker`] pops items, hands them to the routine selected by its
//! [`Role`], and applies the returned [`Disposition`] to the queue. Browsers
//! are owned by the worker's [`Session`] and never shared between threads.

use std::borrow::Cow;
use std::collections::{BTreeMap, HashSet};
use std::fmt;
use std::path::Path;
use std::thread;
use std::time::Duration;

use metamong_core::oracle::{
    Browser, BrowserError, BrowserFactory, DomEdit, DomSnapshot, ElementOutline, MutationGenerator,
    RevisionOracle,
};
use metamong_core::provision::{BinaryCache, Provisioning};
use metamong_core::queue::{QueueError, VersionedWorkQueue};
use metamong_core::verdict::Verdict;
use metamong_core::version::{Revision, RevisionList, VersionKey};
use metamong_core::watchdog::Watchdog;
use metamong_core::WorkItem;
use serde::Serialize;
use tracing::{debug, error, warn};

use crate::{bisect, confirm, generate, minimize};

/// What a worker does with each item it pops.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Role {
    Generate,
    CrossVersionConfirm,
    Minimize,
    Bisect(Provisioning),
}

impl Role {
    /// Whether items of one key can reuse the browsers bound for it.
    const fn binds_per_key(self) -> bool {
        !matches!(self, Self::Bisect(_))
    }

    const fn provisioning(self) -> Provisioning {
        match self {
            Self::Bisect(strategy) => strategy,
            _ => Provisioning::Download,
        }
    }
}

impl fmt::Display for Role {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Generate => f.write_str("generate"),
            Self::CrossVersionConfirm => f.write_str("cross-version"),
            Self::Minimize => f.write_str("minimize"),
            Self::Bisect(strategy) => write!(f, "bisect({strategy})"),
        }
    }
}

/// Immutable per-stage worker settings.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WorkerConfig {
    pub save_screenshots: bool,
    /// Trials per revision; all must agree.
    pub iteration_count: usize,
    /// Require the base revision to be clean, not just the target to be buggy.
    pub cross_version_mode: bool,
    /// Empty-mutation differential runs a seed must pass in Generate.
    pub self_check_runs: usize,
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self {
            save_screenshots: false,
            iteration_count: 4,
            cross_version_mode: true,
            self_check_runs: 1,
        }
    }
}

impl WorkerConfig {
    /// Settings for the final re-render into the report directory.
    #[must_use]
    pub const fn report() -> Self {
        Self {
            save_screenshots: true,
            iteration_count: 1,
            cross_version_mode: true,
            self_check_runs: 1,
        }
    }
}

/// Why an item left the pipeline.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum DropReason {
    /// The seed is not self-consistent without mutations.
    Flaky,
    /// The predicate evaluated cleanly to "no bug".
    NotReproduced,
    /// A crash or hang prevented a verdict.
    Indeterminate,
    /// A required browser could not be provisioned or started.
    SetupFailed,
    /// A bracket with `low >= high`, or one whose endpoints left the list.
    InvalidBracket,
    /// The scratch files of a reduction could not be written.
    MinimizeFailed,
    /// The mutation sidecar could not be written next to the test case.
    PersistFailed,
}

impl fmt::Display for DropReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Flaky => "flaky",
            Self::NotReproduced => "not-reproduced",
            Self::Indeterminate => "indeterminate",
            Self::SetupFailed => "setup-failed",
            Self::InvalidBracket => "invalid-bracket",
            Self::MinimizeFailed => "minimize-failed",
            Self::PersistFailed => "persist-failed",
        })
    }
}

impl DropReason {
    #[must_use]
    pub const fn from_verdict(verdict: Verdict) -> Self {
        match verdict {
            Verdict::Indeterminate => Self::Indeterminate,
            Verdict::Bug | Verdict::NoBug => Self::NotReproduced,
        }
    }
}

/// The outcome of processing one popped item.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Disposition {
    /// Hand to the next stage.
    Advance(VersionKey, WorkItem),
    /// Push back into the current pass under new keys.
    Requeue(Vec<(VersionKey, WorkItem)>),
    Drop(DropReason),
}

/// Per-worker accounting. `popped == advanced + requeued + dropped`.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct WorkerStats {
    pub popped: usize,
    pub advanced: usize,
    pub requeued: usize,
    pub dropped: BTreeMap<DropReason, usize>,
    /// Items that reached a verdict, whatever it was.
    pub valid: usize,
}

impl WorkerStats {
    #[must_use]
    pub fn dropped_total(&self) -> usize {
        self.dropped.values().sum()
    }

    pub fn merge(&mut self, other: &Self) {
        self.popped += other.popped;
        self.advanced += other.advanced;
        self.requeued += other.requeued;
        self.valid += other.valid;
        for (reason, count) in &other.dropped {
            *self.dropped.entry(*reason).or_default() += count;
        }
    }
}

/// Browsers bound to the revisions of the key being processed.
pub struct Session<'a> {
    cache: &'a BinaryCache,
    factory: &'a dyn BrowserFactory,
    watchdog: &'a Watchdog,
    strategy: Provisioning,
    browsers: Vec<Box<dyn Browser>>,
    failed: HashSet<Revision>,
}

impl fmt::Debug for Session<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Session")
            .field("strategy", &self.strategy)
            .field("bound", &self.bound())
            .field("failed", &self.failed)
            .finish_non_exhaustive()
    }
}

impl<'a> Session<'a> {
    #[must_use]
    pub fn new(
        cache: &'a BinaryCache,
        factory: &'a dyn BrowserFactory,
        watchdog: &'a Watchdog,
        strategy: Provisioning,
    ) -> Self {
        Self {
            cache,
            factory,
            watchdog,
            strategy,
            browsers: Vec::new(),
            failed: HashSet::new(),
        }
    }

    /// Revisions of the currently running browsers.
    #[must_use]
    pub fn bound(&self) -> Vec<Revision> {
        self.browsers.iter().map(|b| b.revision()).collect()
    }

    /// Make sure exactly `revisions` are running, restarting dead browsers.
    ///
    /// Returns `false` if any of them cannot be provisioned or started; such
    /// revisions are not retried for the rest of this session.
    pub fn bind(&mut self, revisions: &[Revision]) -> bool {
        if self.bound() == revisions && self.browsers.iter_mut().all(|b| b.is_alive()) {
            return true;
        }
        self.release();

        for &revision in revisions {
            if self.failed.contains(&revision) {
                self.release();
                return false;
            }
            let binary = match self.cache.acquire(revision, self.strategy) {
                Ok(binary) => binary,
                Err(err) => {
                    warn!(revision, error = %err, "no browser binary; skipping revision");
                    self.failed.insert(revision);
                    self.release();
                    return false;
                }
            };
            let mut browser = self.factory.create(revision, &binary);
            if !browser.setup() {
                warn!(revision, "browser failed to start; skipping revision");
                browser.teardown();
                self.failed.insert(revision);
                self.release();
                return false;
            }
            self.browsers.push(browser);
        }
        true
    }

    /// Tear down every bound browser.
    pub fn release(&mut self) {
        for mut browser in self.browsers.drain(..) {
            browser.teardown();
        }
    }

    fn browser(&mut self, revision: Revision) -> Option<&mut Box<dyn Browser>> {
        self.browsers.iter_mut().find(|b| b.revision() == revision)
    }

    /// One differential run under the watchdog. A killed run is indeterminate.
    pub fn differential(
        &mut self,
        revision: Revision,
        test_case: &Path,
        mutations: &[String],
        save_screenshots: bool,
    ) -> Verdict {
        let watchdog = self.watchdog;
        let Some(browser) = self.browser(revision) else {
            return Verdict::Indeterminate;
        };
        let guard = watchdog.track(revision, test_case, browser.kill_switch());
        let verdict = browser.run_differential(test_case, mutations, save_screenshots);
        if guard.was_killed() {
            return Verdict::Indeterminate;
        }
        verdict
    }

    /// `trials` differential runs folded unanimously; stops at the first
    /// disagreement.
    pub fn trials(
        &mut self,
        revision: Revision,
        test_case: &Path,
        mutations: &[String],
        save_screenshots: bool,
        trials: usize,
    ) -> Verdict {
        let mut agreed: Option<Verdict> = None;
        for _ in 0..trials.max(1) {
            let verdict = self.differential(revision, test_case, mutations, save_screenshots);
            match agreed {
                _ if verdict == Verdict::Indeterminate => return Verdict::Indeterminate,
                Some(prev) if prev != verdict => return Verdict::Indeterminate,
                _ => agreed = Some(verdict),
            }
        }
        Verdict::unanimous(agreed)
    }

    fn guarded<T>(
        &mut self,
        revision: Revision,
        test_case: &Path,
        call: impl FnOnce(&mut dyn Browser) -> Result<T, BrowserError>,
    ) -> Result<T, BrowserError> {
        let watchdog = self.watchdog;
        let browser = self
            .browser(revision)
            .ok_or(BrowserError::NotRunning { revision })?;
        let guard = watchdog.track(revision, test_case, browser.kill_switch());
        let result = call(browser.as_mut());
        if guard.was_killed() {
            return Err(BrowserError::Crashed {
                revision,
                reason: "killed by watchdog".to_string(),
            });
        }
        result
    }

    /// Inspect the page for mutation generation.
    ///
    /// # Errors
    ///
    /// Returns an error if the browser is not bound or the page cannot be read.
    pub fn snapshot_dom(
        &mut self,
        revision: Revision,
        test_case: &Path,
    ) -> Result<DomSnapshot, BrowserError> {
        self.guarded(revision, test_case, |b| b.snapshot_dom(test_case))
    }

    /// Element outline of the page.
    ///
    /// # Errors
    ///
    /// Returns an error if the browser is not bound or the page cannot be read.
    pub fn outline(
        &mut self,
        revision: Revision,
        test_case: &Path,
    ) -> Result<Vec<ElementOutline>, BrowserError> {
        self.guarded(revision, test_case, |b| b.outline(test_case))
    }

    /// Apply a DOM edit and return the serialized result.
    ///
    /// # Errors
    ///
    /// Returns an error if the browser is not bound or the edit fails.
    pub fn apply_edit(
        &mut self,
        revision: Revision,
        test_case: &Path,
        edit: &DomEdit,
    ) -> Result<String, BrowserError> {
        self.guarded(revision, test_case, |b| b.apply_edit(test_case, edit))
    }
}

impl Drop for Session<'_> {
    fn drop(&mut self) {
        self.release();
    }
}

/// Answers bisection checks by binding a single browser per revision.
pub struct SessionOracle<'s, 'a> {
    pub session: &'s mut Session<'a>,
    pub config: WorkerConfig,
}

impl RevisionOracle for SessionOracle<'_, '_> {
    fn judge(&mut self, revision: Revision, item: &WorkItem) -> Verdict {
        if !self.session.bind(&[revision]) {
            return Verdict::Indeterminate;
        }
        self.session.trials(
            revision,
            &item.test_case,
            &item.mutations,
            self.config.save_screenshots,
            self.config.iteration_count,
        )
    }
}

/// Everything a worker borrows from the stage.
#[derive(Clone, Copy)]
pub struct StageContext<'a> {
    pub queue: &'a VersionedWorkQueue,
    pub cache: &'a BinaryCache,
    pub factory: &'a dyn BrowserFactory,
    pub revisions: &'a RevisionList,
}

const RETRY_PAUSE: Duration = Duration::from_millis(5);
/// Lock timeouts tolerated before a worker stops asking for work.
const MAX_RETRIES: usize = 1_000;
const RETRY_WARN_EVERY: usize = 1_000;

/// Retry `op` while it fails with a lock timeout, at most `limit` times.
fn retry_transient<T>(
    limit: Option<usize>,
    pause: Duration,
    mut op: impl FnMut() -> Result<T, QueueError>,
) -> Result<T, QueueError> {
    let mut attempts = 0usize;
    loop {
        match op() {
            Err(err) if err.is_transient() && limit.is_none_or(|limit| attempts < limit) => {
                attempts += 1;
                if attempts % RETRY_WARN_EVERY == 0 {
                    warn!(attempts, error = %err, "queue lock still contended");
                }
                thread::sleep(pause);
            }
            other => return other,
        }
    }
}

fn with_retry<T>(op: impl FnMut() -> Result<T, QueueError>) -> Result<T, QueueError> {
    retry_transient(Some(MAX_RETRIES), RETRY_PAUSE, op)
}

/// Results already taken off the queue are retried until stored.
fn until_stored<T>(op: impl FnMut() -> Result<T, QueueError>) -> Result<T, QueueError> {
    retry_transient(None, RETRY_PAUSE, op)
}

pub struct Worker<'a> {
    id: usize,
    role: Role,
    config: WorkerConfig,
    ctx: StageContext<'a>,
    session: Session<'a>,
    mutator: Box<dyn MutationGenerator>,
    /// Index space for bisection: the run's list, or every revision in it for builds.
    bisect_list: Cow<'a, RevisionList>,
    stats: WorkerStats,
}

impl<'a> Worker<'a> {
    #[must_use]
    pub fn new(
        id: usize,
        role: Role,
        config: WorkerConfig,
        ctx: StageContext<'a>,
        mutator: Box<dyn MutationGenerator>,
    ) -> Self {
        Self {
            id,
            role,
            config,
            session: Session::new(
                ctx.cache,
                ctx.factory,
                ctx.queue.watchdog(),
                role.provisioning(),
            ),
            bisect_list: match role {
                Role::Bisect(Provisioning::Build) => Cow::Owned(dense_range(ctx.revisions)),
                _ => Cow::Borrowed(ctx.revisions),
            },
            ctx,
            mutator,
            stats: WorkerStats::default(),
        }
    }

    /// Pop and process until the queue reports empty.
    pub fn run(mut self) -> WorkerStats {
        loop {
            let popped = match with_retry(|| self.ctx.queue.pop()) {
                Ok(Some(popped)) => popped,
                Ok(None) => break,
                Err(err) => {
                    error!(worker = self.id, error = %err, "giving up on the queue");
                    break;
                }
            };
            let (item, key) = popped;
            self.stats.popped += 1;

            let disposition = self.process(key, item);
            if let Err(err) = self.apply(disposition) {
                error!(worker = self.id, %key, error = %err, "lost an item while re-queueing");
            }

            if self.role.binds_per_key() {
                let next = with_retry(|| self.ctx.queue.current_key()).ok().flatten();
                if next != Some(key) {
                    self.session.release();
                }
            }
        }
        self.session.release();
        self.stats
    }

    fn process(&mut self, key: VersionKey, item: WorkItem) -> Disposition {
        debug!(worker = self.id, role = %self.role, %key, test_case = %item.test_case.display(), "processing");
        let disposition = match self.role {
            Role::Generate => generate::process(
                &mut self.session,
                self.mutator.as_mut(),
                &self.config,
                key,
                item,
            ),
            Role::CrossVersionConfirm => confirm::process(&mut self.session, &self.config, key, item),
            Role::Minimize => minimize::process(&mut self.session, &self.config, key, item),
            Role::Bisect(_) => {
                let mut oracle = SessionOracle {
                    session: &mut self.session,
                    config: self.config,
                };
                bisect::process(&mut oracle, &self.bisect_list, key, item)
            }
        };

        if !matches!(
            disposition,
            Disposition::Drop(DropReason::Indeterminate | DropReason::SetupFailed)
        ) {
            self.stats.valid += 1;
            if let Err(err) = with_retry(|| self.ctx.queue.count_valid()) {
                debug!(worker = self.id, error = %err, "valid-test counter not updated");
            }
        }
        disposition
    }

    fn apply(&mut self, disposition: Disposition) -> Result<(), QueueError> {
        match disposition {
            Disposition::Advance(key, item) => {
                self.stats.advanced += 1;
                until_stored(|| self.ctx.queue.advance(key, item.clone()))
            }
            Disposition::Requeue(items) => {
                self.stats.requeued += 1;
                for (key, item) in items {
                    until_stored(|| self.ctx.queue.reinsert(key, item.clone()))?;
                }
                Ok(())
            }
            Disposition::Drop(reason) => {
                *self.stats.dropped.entry(reason).or_default() += 1;
                debug!(worker = self.id, %reason, "item dropped");
                Ok(())
            }
        }
    }
}

/// Every revision between the first and last of `list`, for build bisection.
#[must_use]
pub fn dense_range(list: &RevisionList) -> RevisionList {
    match (list.first(), list.last()) {
        (Some(first), Some(last)) => RevisionList::dense(first, last),
        _ => RevisionList::default(),
    }
}
