//! Interfaces to the collaborators the pipeline drives but does not own:
//! the browser driver, the mutation generator and per-revision oracles.

use std::collections::BTreeMap;
use std::io;
use std::path::Path;
use std::sync::Arc;

use serde::{Deserialize, Serialize};

use crate::error::ErrorCode;
use crate::item::WorkItem;
use crate::verdict::{RenderHash, Verdict};
use crate::version::Revision;

/// Failures reported by a browser driver.
#[derive(Debug, thiserror::Error)]
pub enum BrowserError {
    #[error("browser {revision} is not running")]
    NotRunning { revision: Revision },

    #[error("browser {revision} crashed: {reason}")]
    Crashed { revision: Revision, reason: String },

    #[error("driver protocol error: {0}")]
    Protocol(String),

    #[error("driver I/O error: {0}")]
    Io(#[from] io::Error),
}

impl BrowserError {
    #[must_use]
    pub const fn code(&self) -> ErrorCode {
        match self {
            Self::NotRunning { .. } | Self::Crashed { .. } => ErrorCode::BrowserSetupFailed,
            Self::Protocol(_) | Self::Io(_) => ErrorCode::DriverProtocol,
        }
    }
}

/// Handle the watchdog uses to force-terminate a wedged browser process.
pub trait KillSwitch: Send + Sync {
    /// OS process id, when the browser runs out of process.
    fn pid(&self) -> Option<u32>;

    /// Kill the process tree. Returns `false` if it was already gone.
    fn kill(&self) -> bool;
}

/// Focus, scroll and animation state captured around a re-render.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct PageState {
    pub focused: Option<String>,
    pub scroll: Vec<(String, i64, i64)>,
    pub running_animations: u32,
}

/// What the mutation generator needs to know about a rendered page.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct DomSnapshot {
    pub ids: Vec<String>,
    pub attributes: BTreeMap<String, Vec<String>>,
    pub css_rule_count: usize,
}

/// Attribute names of one element, in `querySelectorAll('*')` order under body.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct ElementOutline {
    pub attributes: Vec<String>,
}

/// A single structural reduction applied to a loaded page.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum DomEdit {
    RemoveElement { index: usize },
    RemoveAttribute { index: usize, name: String },
    ClearText { index: usize },
    Unwrap { index: usize },
}

impl DomEdit {
    /// The in-page script performing this edit.
    #[must_use]
    pub fn to_script(&self) -> String {
        const PICK: &str = "document.body.querySelectorAll('*')";
        match self {
            Self::RemoveElement { index } => format!("{PICK}[{index}].remove();"),
            Self::RemoveAttribute { index, name } => {
                format!("{PICK}[{index}].removeAttribute('{name}');")
            }
            Self::ClearText { index } => format!("{PICK}[{index}].textContent = '';"),
            Self::Unwrap { index } => format!(
                "const el = {PICK}[{index}]; el.replaceWith(...el.childNodes);"
            ),
        }
    }

    #[must_use]
    pub const fn index(&self) -> usize {
        match self {
            Self::RemoveElement { index }
            | Self::RemoveAttribute { index, .. }
            | Self::ClearText { index }
            | Self::Unwrap { index } => *index,
        }
    }
}

/// One browser instance pinned to one revision, exclusively owned by a worker.
pub trait Browser: Send {
    fn revision(&self) -> Revision;

    /// Start the browser process. `false` means this revision is unusable.
    fn setup(&mut self) -> bool;

    fn teardown(&mut self);

    /// Whether the process is still alive (it may have been killed by the watchdog).
    fn is_alive(&mut self) -> bool {
        true
    }

    /// Load `test_case`, replay `mutations`, screenshot and hash.
    ///
    /// # Errors
    ///
    /// Returns an error if the page cannot be loaded or captured.
    fn render_and_hash(
        &mut self,
        test_case: &Path,
        mutations: &[String],
    ) -> Result<RenderHash, BrowserError>;

    /// Render live-mutated and re-serialized-then-reloaded, compare the two.
    fn run_differential(
        &mut self,
        test_case: &Path,
        mutations: &[String],
        save_screenshots: bool,
    ) -> Verdict;

    /// Equality of the state snapshots taken before and after a re-render.
    fn compare_states(&self, before: &PageState, after: &PageState) -> bool {
        before == after
    }

    /// Collect ids, attributes and stylesheet size for mutation generation.
    ///
    /// # Errors
    ///
    /// Returns an error if the page cannot be loaded or inspected.
    fn snapshot_dom(&mut self, test_case: &Path) -> Result<DomSnapshot, BrowserError>;

    /// Attribute names of every element under body, in document order.
    ///
    /// # Errors
    ///
    /// Returns an error if the page cannot be loaded or inspected.
    fn outline(&mut self, test_case: &Path) -> Result<Vec<ElementOutline>, BrowserError>;

    /// Load `test_case`, apply `edit`, and return the re-serialized document.
    ///
    /// # Errors
    ///
    /// Returns an error if the page cannot be loaded or serialized.
    fn apply_edit(&mut self, test_case: &Path, edit: &DomEdit) -> Result<String, BrowserError>;

    fn kill_switch(&self) -> Option<Arc<dyn KillSwitch>>;
}

/// Creates browsers for a revision whose binary has already been provisioned.
pub trait BrowserFactory: Send + Sync {
    fn create(&self, revision: Revision, binary: &Path) -> Box<dyn Browser>;
}

/// Produces metamorphic mutation commands for a rendered page.
pub trait MutationGenerator: Send {
    fn generate(&mut self, snapshot: &DomSnapshot) -> Vec<String>;
}

/// Builds one generator per worker so each worker owns its RNG stream.
pub trait MutatorFactory: Send + Sync {
    fn create(&self, worker: usize) -> Box<dyn MutationGenerator>;
}

/// "Is the bug present at this revision?"
pub trait RevisionOracle {
    fn judge(&mut self, revision: Revision, item: &WorkItem) -> Verdict;
}
