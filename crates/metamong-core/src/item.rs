//! Work items: a test case on disk plus the mutation commands replayed on it.

use std::fs;
use std::io;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

/// One unit of work flowing through the pipeline.
///
/// `mutations` grows during Generate, is replaced wholesale by Minimize, and
/// is passed through untouched by Bisect.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct WorkItem {
    pub test_case: PathBuf,
    pub mutations: Vec<String>,
}

impl WorkItem {
    #[must_use]
    pub fn new(test_case: impl Into<PathBuf>) -> Self {
        Self {
            test_case: test_case.into(),
            mutations: Vec::new(),
        }
    }

    #[must_use]
    pub fn with_mutations(test_case: impl Into<PathBuf>, mutations: Vec<String>) -> Self {
        Self {
            test_case: test_case.into(),
            mutations,
        }
    }

    /// Load a test case together with its sidecar mutation file, if any.
    ///
    /// # Errors
    ///
    /// Returns an error if the sidecar exists but cannot be read.
    pub fn load(test_case: impl Into<PathBuf>) -> io::Result<Self> {
        let test_case = test_case.into();
        let sidecar = sidecar_path(&test_case);
        let mutations = if sidecar.exists() {
            read_mutations(&sidecar)?
        } else {
            Vec::new()
        };
        Ok(Self {
            test_case,
            mutations,
        })
    }

    /// Path of the `.js` sidecar holding the mutation list.
    #[must_use]
    pub fn sidecar(&self) -> PathBuf {
        sidecar_path(&self.test_case)
    }

    /// Write the mutation list next to the test case.
    ///
    /// # Errors
    ///
    /// Returns an error if the sidecar cannot be written.
    pub fn persist_mutations(&self) -> io::Result<()> {
        fs::write(self.sidecar(), self.mutations.join("\n"))
    }

    /// File name of the test case, for copying into stage directories.
    #[must_use]
    pub fn file_name(&self) -> String {
        self.test_case
            .file_name()
            .map(|name| name.to_string_lossy().into_owned())
            .unwrap_or_default()
    }
}

/// `foo.html` -> `foo.js`.
#[must_use]
pub fn sidecar_path(test_case: &Path) -> PathBuf {
    test_case.with_extension("js")
}

/// Read a newline-separated mutation list.
///
/// # Errors
///
/// Returns an error if the file cannot be read.
pub fn read_mutations(path: &Path) -> io::Result<Vec<String>> {
    let content = fs::read_to_string(path)?;
    Ok(content.lines().map(str::to_string).collect())
}

/// Recursively collect every `.html` seed under `root`, sorted by path.
///
/// Minimizer leftovers (`*-orig.html`) are skipped.
///
/// # Errors
///
/// Returns an error if a directory cannot be read.
pub fn discover_seeds(root: &Path) -> io::Result<Vec<WorkItem>> {
    let mut paths = Vec::new();
    collect_html(root, &mut paths)?;
    paths.sort();
    paths.into_iter().map(WorkItem::load).collect()
}

fn collect_html(dir: &Path, out: &mut Vec<PathBuf>) -> io::Result<()> {
    for entry in fs::read_dir(dir)? {
        let path = entry?.path();
        if path.is_dir() {
            collect_html(&path, out)?;
            continue;
        }
        let is_html = path.extension().is_some_and(|ext| ext == "html");
        let is_leftover = path
            .file_stem()
            .is_some_and(|stem| stem.to_string_lossy().ends_with("-orig"));
        if is_html && !is_leftover {
            out.push(path);
        }
    }
    Ok(())
}
