//! Memoized, concurrency-bounded acquisition of browser binaries.

use std::collections::HashMap;
use std::fmt;
use std::io;
use std::path::PathBuf;
use std::sync::{Arc, Condvar, Mutex};

use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use crate::error::ErrorCode;
use crate::lock::lock_unpoisoned;
use crate::version::Revision;

#[derive(Debug, thiserror::Error)]
pub enum ProvisionError {
    #[error("no binary available for revision {revision}: {reason}")]
    Unavailable { revision: Revision, reason: String },

    #[error("building revision {revision} failed: {reason}")]
    BuildFailed { revision: Revision, reason: String },

    #[error("provisioning I/O error: {0}")]
    Io(#[from] io::Error),
}

impl ProvisionError {
    #[must_use]
    pub const fn code(&self) -> ErrorCode {
        match self {
            Self::Unavailable { .. } | Self::Io(_) => ErrorCode::NoBrowserBinary,
            Self::BuildFailed { .. } => ErrorCode::BrowserSetupFailed,
        }
    }
}

/// Where a browser binary for a revision comes from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Provisioning {
    Download,
    Build,
}

impl fmt::Display for Provisioning {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Download => "download",
            Self::Build => "build",
        })
    }
}

/// Locating or producing browser binaries.
///
/// Both calls must be idempotent and safe to run concurrently for different
/// revisions; [`BinaryCache`] serializes calls for the same revision.
pub trait BinaryProvisioner: Send + Sync {
    /// Fetch a prebuilt binary.
    ///
    /// # Errors
    ///
    /// Returns an error if no binary exists for `revision`.
    fn ensure_binary(&self, revision: Revision) -> Result<PathBuf, ProvisionError>;

    /// Compile a binary from source.
    ///
    /// # Errors
    ///
    /// Returns an error if the build fails.
    fn build_binary(&self, revision: Revision) -> Result<PathBuf, ProvisionError>;
}

/// Counting semaphore over a mutex and condition variable.
#[derive(Debug)]
struct Semaphore {
    permits: Mutex<usize>,
    available: Condvar,
}

impl Semaphore {
    fn new(permits: usize) -> Self {
        Self {
            permits: Mutex::new(permits.max(1)),
            available: Condvar::new(),
        }
    }

    fn acquire(&self) -> Permit<'_> {
        let mut permits = lock_unpoisoned(&self.permits);
        while *permits == 0 {
            permits = self
                .available
                .wait(permits)
                .unwrap_or_else(std::sync::PoisonError::into_inner);
        }
        *permits -= 1;
        Permit { semaphore: self }
    }
}

struct Permit<'a> {
    semaphore: &'a Semaphore,
}

impl Drop for Permit<'_> {
    fn drop(&mut self) {
        *lock_unpoisoned(&self.semaphore.permits) += 1;
        self.semaphore.available.notify_one();
    }
}

type Slot = Arc<Mutex<Option<PathBuf>>>;

/// Shares provisioned binaries between workers.
///
/// Each `(revision, strategy)` pair is acquired at most once; concurrent
/// callers for the same pair wait on its slot. Downloads run at most
/// `download_concurrency` at a time and builds one at a time. Failures are
/// not memoized, so a later stage may retry.
pub struct BinaryCache {
    provisioner: Arc<dyn BinaryProvisioner>,
    downloads: Semaphore,
    build_gate: Mutex<()>,
    slots: Mutex<HashMap<(Revision, Provisioning), Slot>>,
}

impl fmt::Debug for BinaryCache {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("BinaryCache")
            .field("downloads", &self.downloads)
            .field("slots", &lock_unpoisoned(&self.slots).len())
            .finish_non_exhaustive()
    }
}

impl BinaryCache {
    #[must_use]
    pub fn new(provisioner: Arc<dyn BinaryProvisioner>, download_concurrency: usize) -> Self {
        Self {
            provisioner,
            downloads: Semaphore::new(download_concurrency),
            build_gate: Mutex::new(()),
            slots: Mutex::new(HashMap::new()),
        }
    }

    /// Path to the binary for `revision`, provisioning it on first use.
    ///
    /// # Errors
    ///
    /// Propagates the provisioner's failure.
    pub fn acquire(
        &self,
        revision: Revision,
        strategy: Provisioning,
    ) -> Result<PathBuf, ProvisionError> {
        let slot = Arc::clone(
            lock_unpoisoned(&self.slots)
                .entry((revision, strategy))
                .or_default(),
        );

        let mut cached = lock_unpoisoned(&slot);
        if let Some(path) = cached.as_ref() {
            return Ok(path.clone());
        }

        let path = match strategy {
            Provisioning::Download => {
                let _permit = self.downloads.acquire();
                debug!(revision, "downloading browser binary");
                self.provisioner.ensure_binary(revision)?
            }
            Provisioning::Build => {
                let _gate = lock_unpoisoned(&self.build_gate);
                info!(revision, "building browser binary");
                self.provisioner.build_binary(revision)?
            }
        };

        *cached = Some(path.clone());
        Ok(path)
    }

    /// Number of `(revision, strategy)` pairs successfully provisioned.
    #[must_use]
    pub fn provisioned(&self) -> usize {
        let slots: Vec<Slot> = lock_unpoisoned(&self.slots).values().cloned().collect();
        slots
            .iter()
            .filter(|slot| lock_unpoisoned(slot).is_some())
            .count()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::thread;
    use std::time::Duration;

    #[derive(Default)]
    struct Counting {
        downloads: AtomicUsize,
        builds: AtomicUsize,
        active: AtomicUsize,
        peak: AtomicUsize,
    }

    impl BinaryProvisioner for Counting {
        fn ensure_binary(&self, revision: Revision) -> Result<PathBuf, ProvisionError> {
            if revision == 0 {
                return Err(ProvisionError::Unavailable {
                    revision,
                    reason: "not published".into(),
                });
            }
            let now = self.active.fetch_add(1, Ordering::SeqCst) + 1;
            self.peak.fetch_max(now, Ordering::SeqCst);
            thread::sleep(Duration::from_millis(5));
            self.active.fetch_sub(1, Ordering::SeqCst);
            self.downloads.fetch_add(1, Ordering::SeqCst);
            Ok(PathBuf::from(format!("/bin/{revision}/chrome")))
        }

        fn build_binary(&self, revision: Revision) -> Result<PathBuf, ProvisionError> {
            self.builds.fetch_add(1, Ordering::SeqCst);
            Ok(PathBuf::from(format!("/build/{revision}/chrome")))
        }
    }

    #[test]
    fn same_revision_is_provisioned_once() {
        let counting = Arc::new(Counting::default());
        let cache = BinaryCache::new(counting.clone(), 8);

        thread::scope(|scope| {
            for _ in 0..6 {
                scope.spawn(|| {
                    let path = cache.acquire(42, Provisioning::Download).unwrap();
                    assert_eq!(path, PathBuf::from("/bin/42/chrome"));
                });
            }
        });

        assert_eq!(counting.downloads.load(Ordering::SeqCst), 1);
        assert_eq!(cache.provisioned(), 1);
    }

    #[test]
    fn strategies_are_cached_separately() {
        let counting = Arc::new(Counting::default());
        let cache = BinaryCache::new(counting.clone(), 8);

        let downloaded = cache.acquire(7, Provisioning::Download).unwrap();
        let built = cache.acquire(7, Provisioning::Build).unwrap();
        assert_ne!(downloaded, built);
        cache.acquire(7, Provisioning::Build).unwrap();
        assert_eq!(counting.builds.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn downloads_respect_concurrency_bound() {
        let counting = Arc::new(Counting::default());
        let cache = BinaryCache::new(counting.clone(), 2);

        thread::scope(|scope| {
            for revision in 1..=8 {
                let cache = &cache;
                scope.spawn(move || cache.acquire(revision, Provisioning::Download).unwrap());
            }
        });

        assert_eq!(counting.downloads.load(Ordering::SeqCst), 8);
        assert!(counting.peak.load(Ordering::SeqCst) <= 2);
    }

    #[test]
    fn failures_are_not_memoized() {
        let cache = BinaryCache::new(Arc::new(Counting::default()), 1);
        let err = cache.acquire(0, Provisioning::Download).unwrap_err();
        assert_eq!(err.code(), ErrorCode::NoBrowserBinary);
        assert!(cache.acquire(0, Provisioning::Download).is_err());
        assert_eq!(cache.provisioned(), 0);
    }
}
