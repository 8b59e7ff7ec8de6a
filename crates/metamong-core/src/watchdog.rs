//! Hang detection for in-flight browser calls.
//!
//! Workers register each test before handing it to a browser and the
//! returned [`InFlight`] guard unregisters it. The orchestrator calls
//! [`Watchdog::sweep`] periodically; any test running past the deadline has
//! its browser process killed, which makes the worker's blocked call fail
//! and surface as an indeterminate verdict.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use std::thread::{self, ThreadId};
use std::time::{Duration, Instant};

use tracing::warn;

use crate::lock::lock_unpoisoned;
use crate::oracle::KillSwitch;
use crate::version::Revision;

type TestId = (ThreadId, Revision, PathBuf);

struct Entry {
    kill: Option<Arc<dyn KillSwitch>>,
    started: Instant,
    killed: bool,
}

/// Registry of tests currently running in some browser.
pub struct Watchdog {
    deadline: Duration,
    running: Mutex<HashMap<TestId, Entry>>,
}

impl std::fmt::Debug for Watchdog {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Watchdog")
            .field("deadline", &self.deadline)
            .field("in_flight", &self.in_flight())
            .finish()
    }
}

impl Watchdog {
    #[must_use]
    pub fn new(deadline: Duration) -> Self {
        Self {
            deadline,
            running: Mutex::new(HashMap::new()),
        }
    }

    #[must_use]
    pub const fn deadline(&self) -> Duration {
        self.deadline
    }

    /// Record that the calling thread started `test_case` on `revision`.
    #[must_use = "dropping the guard immediately unregisters the test"]
    pub fn track(
        &self,
        revision: Revision,
        test_case: &Path,
        kill: Option<Arc<dyn KillSwitch>>,
    ) -> InFlight<'_> {
        let id = (thread::current().id(), revision, test_case.to_path_buf());
        lock_unpoisoned(&self.running).insert(
            id.clone(),
            Entry {
                kill,
                started: Instant::now(),
                killed: false,
            },
        );
        InFlight { watchdog: self, id }
    }

    /// Number of tests currently registered.
    #[must_use]
    pub fn in_flight(&self) -> usize {
        lock_unpoisoned(&self.running).len()
    }

    /// Kill every browser whose test has exceeded the deadline.
    ///
    /// Returns how many kill switches were pulled.
    pub fn sweep(&self) -> usize {
        self.sweep_at(Instant::now())
    }

    /// [`Self::sweep`] against an explicit clock reading.
    pub fn sweep_at(&self, now: Instant) -> usize {
        let mut overdue = Vec::new();
        {
            let mut running = lock_unpoisoned(&self.running);
            for ((thread_id, revision, test_case), entry) in running.iter_mut() {
                if entry.killed || now.saturating_duration_since(entry.started) <= self.deadline
                {
                    continue;
                }
                entry.killed = true;
                warn!(
                    thread = ?thread_id,
                    revision = *revision,
                    test_case = %test_case.display(),
                    "browser is hanging; killing it"
                );
                if let Some(kill) = &entry.kill {
                    overdue.push(Arc::clone(kill));
                }
            }
        }

        // Killing can block on process reaping; keep it outside the lock.
        overdue.iter().filter(|kill| kill.kill()).count()
    }

    fn release(&self, id: &TestId) {
        lock_unpoisoned(&self.running).remove(id);
    }
}

/// Unregisters its test from the [`Watchdog`] on drop.
pub struct InFlight<'a> {
    watchdog: &'a Watchdog,
    id: TestId,
}

impl InFlight<'_> {
    /// Whether the watchdog killed the browser running this test.
    #[must_use]
    pub fn was_killed(&self) -> bool {
        lock_unpoisoned(&self.watchdog.running)
            .get(&self.id)
            .is_some_and(|entry| entry.killed)
    }
}

impl Drop for InFlight<'_> {
    fn drop(&mut self) {
        self.watchdog.release(&self.id);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[derive(Default)]
    struct CountingSwitch {
        kills: AtomicUsize,
    }

    impl KillSwitch for CountingSwitch {
        fn pid(&self) -> Option<u32> {
            None
        }

        fn kill(&self) -> bool {
            self.kills.fetch_add(1, Ordering::SeqCst);
            true
        }
    }

    #[test]
    fn guard_unregisters_on_drop() {
        let dog = Watchdog::new(Duration::from_secs(30));
        {
            let _guard = dog.track(7, Path::new("a.html"), None);
            assert_eq!(dog.in_flight(), 1);
        }
        assert_eq!(dog.in_flight(), 0);
    }

    #[test]
    fn sweep_kills_only_overdue_tests_once() {
        let dog = Watchdog::new(Duration::from_secs(30));
        let switch = Arc::new(CountingSwitch::default());
        let guard = dog.track(7, Path::new("a.html"), Some(switch.clone()));

        assert_eq!(dog.sweep(), 0);
        assert!(!guard.was_killed());

        let later = Instant::now() + Duration::from_secs(31);
        assert_eq!(dog.sweep_at(later), 1);
        assert!(guard.was_killed());
        assert_eq!(dog.sweep_at(later), 0);
        assert_eq!(switch.kills.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn entries_are_per_thread() {
        let dog = Watchdog::new(Duration::from_secs(30));
        let _mine = dog.track(1, Path::new("a.html"), None);
        thread::scope(|scope| {
            scope.spawn(|| {
                let _theirs = dog.track(1, Path::new("a.html"), None);
                assert_eq!(dog.in_flight(), 2);
            });
        });
        assert_eq!(dog.in_flight(), 1);
    }
}
