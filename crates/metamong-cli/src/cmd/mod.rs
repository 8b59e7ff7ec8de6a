pub mod revisions;
pub mod run;
pub mod sim;

use std::path::{Path, PathBuf};

use clap::{Args, ValueEnum};
use metamong_core::RevisionList;
use metamong_core::error::ErrorCode;
use metamong_core::version::{BrowserKind, VersionError};

/// Browser family selectable on the command line.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, ValueEnum)]
pub enum BrowserArg {
    #[default]
    Chrome,
    Firefox,
}

impl From<BrowserArg> for BrowserKind {
    fn from(arg: BrowserArg) -> Self {
        match arg {
            BrowserArg::Chrome => Self::Chrome,
            BrowserArg::Firefox => Self::Firefox,
        }
    }
}

/// Milestone selection shared by `run` and `revisions`.
#[derive(Args, Debug, Clone)]
pub struct MilestoneArgs {
    /// Browser type.
    #[arg(short = 't', long = "browser", value_enum, default_value = "chrome")]
    pub browser: BrowserArg,

    /// Base milestone, expected to render correctly.
    #[arg(short = 'p', long = "pre")]
    pub pre: u32,

    /// Target milestone, expected to show the regression.
    #[arg(short = 'n', long = "new")]
    pub new: u32,

    /// Downloadable build list (`", "`-separated revisions).
    ///
    /// Defaults to `bisect-builds-cache.csv` under the provisioning
    /// `browser_dir`.
    #[arg(long, value_name = "FILE")]
    pub revisions: Option<PathBuf>,
}

/// Name of the build list inside the browser directory.
pub const BUILD_LIST_FILE: &str = "bisect-builds-cache.csv";

impl MilestoneArgs {
    /// Load the build list for the selected browser.
    ///
    /// Firefox revisions are built on demand, so a missing default list is
    /// an empty one rather than an error.
    pub fn load_builds(&self, browser_dir: &Path) -> anyhow::Result<RevisionList> {
        let path = self
            .revisions
            .clone()
            .unwrap_or_else(|| browser_dir.join(BUILD_LIST_FILE));
        match (self.browser, self.revisions.is_some()) {
            (BrowserArg::Firefox, false) if !path.exists() => Ok(RevisionList::new(Vec::new())),
            _ => RevisionList::load(&path).map_err(version_error),
        }
    }
}

/// Prefix an error with its stable code and message.
pub fn coded(code: ErrorCode, detail: impl std::fmt::Display) -> String {
    format!("{}: {}: {detail}", code.code(), code.message())
}

/// Wrap a [`VersionError`] so its code survives into the CLI error report.
pub fn version_error(err: VersionError) -> anyhow::Error {
    let code = err.code();
    anyhow::Error::new(err).context(format!("{}: {}", code.code(), code.message()))
}
