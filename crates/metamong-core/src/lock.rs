use crate::error::ErrorCode;
use fs2::FileExt;
use std::{
    fs::{self, File, OpenOptions},
    io,
    path::{Path, PathBuf},
    sync::{Mutex, MutexGuard, TryLockError},
    thread,
    time::{Duration, Instant},
};

const POLL_INTERVAL: Duration = Duration::from_millis(1);

/// A bounded-time lock acquisition gave up.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LockTimeout {
    pub waited: Duration,
}

impl LockTimeout {
    /// Machine-readable code associated with a lock timeout.
    #[must_use]
    pub const fn code(&self) -> ErrorCode {
        ErrorCode::LockContention
    }
}

impl std::fmt::Display for LockTimeout {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "{}: lock not acquired within {:?}",
            self.code().code(),
            self.waited
        )
    }
}

impl std::error::Error for LockTimeout {}

/// Acquire `mutex`, polling until `timeout` elapses.
///
/// A poisoned mutex is recovered rather than reported: the guarded maps stay
/// structurally valid even if a holder panicked mid-operation.
pub fn lock_with_timeout<T>(
    mutex: &Mutex<T>,
    timeout: Duration,
) -> Result<MutexGuard<'_, T>, LockTimeout> {
    let start = Instant::now();
    loop {
        match mutex.try_lock() {
            Ok(guard) => return Ok(guard),
            Err(TryLockError::Poisoned(poisoned)) => return Ok(poisoned.into_inner()),
            Err(TryLockError::WouldBlock) => {}
        }

        if start.elapsed() >= timeout {
            return Err(LockTimeout {
                waited: start.elapsed(),
            });
        }

        thread::sleep(POLL_INTERVAL);
    }
}

/// Acquire `mutex` without a deadline, recovering from poisoning.
pub fn lock_unpoisoned<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex
        .lock()
        .unwrap_or_else(std::sync::PoisonError::into_inner)
}

/// Errors from the output-directory run lock.
#[derive(Debug)]
pub enum RunLockError {
    Busy { path: PathBuf },
    IoError(io::Error),
}

impl From<io::Error> for RunLockError {
    fn from(err: io::Error) -> Self {
        Self::IoError(err)
    }
}

impl RunLockError {
    /// Machine-readable code associated with this lock error.
    #[must_use]
    pub const fn code(&self) -> ErrorCode {
        match self {
            Self::Busy { .. } => ErrorCode::OutputLocked,
            Self::IoError(_) => ErrorCode::SnapshotWriteFailed,
        }
    }

    /// Optional remediation hint for operators.
    #[must_use]
    pub const fn hint(&self) -> Option<&'static str> {
        self.code().hint()
    }
}

impl std::fmt::Display for RunLockError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Busy { path } => {
                write!(
                    f,
                    "{}: another run holds {}",
                    self.code().code(),
                    path.display()
                )
            }
            Self::IoError(err) => write!(f, "{}: {}", self.code().code(), err),
        }
    }
}

impl std::error::Error for RunLockError {}

/// RAII guard for the exclusive advisory lock on an output directory.
#[derive(Debug)]
pub struct RunLock {
    file: File,
    path: PathBuf,
}

impl RunLock {
    /// Lock file name placed inside the output directory.
    pub const FILE_NAME: &'static str = ".metamong.lock";

    /// Take the exclusive lock for `output_dir`, failing fast if held.
    pub fn acquire(output_dir: &Path) -> Result<Self, RunLockError> {
        fs::create_dir_all(output_dir)?;
        let path = output_dir.join(Self::FILE_NAME);
        let file = OpenOptions::new()
            .create(true)
            .read(true)
            .write(true)
            .truncate(false)
            .open(&path)?;

        if file.try_lock_exclusive().is_err() {
            return Err(RunLockError::Busy { path });
        }

        Ok(Self { file, path })
    }

    /// Explicitly release the lock. Release also happens automatically on drop.
    pub fn release(self) {
        let _ = self.file.unlock();
    }

    /// Return the lock file path.
    #[must_use]
    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl Drop for RunLock {
    fn drop(&mut self) {
        let _ = self.file.unlock();
    }
}
