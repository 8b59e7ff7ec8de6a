//! On-disk stage dumps: copied test cases, mutation sidecars and `result.csv`.

use std::collections::HashMap;
use std::ffi::OsString;
use std::fmt::Write as _;
use std::fs;
use std::io;
use std::path::{Path, PathBuf};

use crate::error::ErrorCode;
use crate::item::{WorkItem, sidecar_path};
use crate::version::VersionKey;

/// Name of the CSV index written next to a stage dump.
pub const RESULT_CSV: &str = "result.csv";

/// Name of the per-revision note in the grouped report layout.
pub const CHANGELOG: &str = "changelog.txt";

#[derive(Debug, thiserror::Error)]
#[error("failed to write {path}: {source}")]
pub struct PersistError {
    pub path: PathBuf,
    #[source]
    pub source: io::Error,
}

impl PersistError {
    fn at(path: &Path) -> impl FnOnce(io::Error) -> Self + '_ {
        move |source| Self {
            path: path.to_path_buf(),
            source,
        }
    }

    #[must_use]
    pub const fn code(&self) -> ErrorCode {
        ErrorCode::SnapshotWriteFailed
    }
}

/// Copies items into one dump directory under distinct file names.
///
/// Seeds discovered in sibling directories can share a file name. The first
/// item keeps the name; later items with a different source or mutation
/// list get `<stem>-<n>.<ext>`. Items that already live in the directory
/// should be [`reserve`](Self::reserve)d first so nothing is copied over them.
#[derive(Debug)]
pub struct Staging {
    dir: PathBuf,
    claims: HashMap<OsString, (PathBuf, Vec<String>)>,
}

impl Staging {
    /// # Errors
    ///
    /// Returns an error if the directory cannot be created.
    pub fn new(dir: &Path) -> Result<Self, PersistError> {
        fs::create_dir_all(dir).map_err(PersistError::at(dir))?;
        Ok(Self {
            dir: dir.to_path_buf(),
            claims: HashMap::new(),
        })
    }

    /// Claim the name of an item whose test case is already in the directory.
    pub fn reserve(&mut self, item: &WorkItem) {
        if item.test_case.parent() != Some(self.dir.as_path()) {
            return;
        }
        if let Some(name) = item.test_case.file_name() {
            self.claims
                .entry(name.to_os_string())
                .or_insert_with(|| (item.test_case.clone(), item.mutations.clone()));
        }
    }

    /// Copy `item`'s test case into the directory, write its sidecar there,
    /// and return the item relocated to the copy.
    ///
    /// # Errors
    ///
    /// Returns an error if a file cannot be copied or written.
    pub fn copy(&mut self, item: &WorkItem) -> Result<WorkItem, PersistError> {
        let name = self.claim(item);
        let target = self.dir.join(name);
        if target != item.test_case {
            fs::copy(&item.test_case, &target).map_err(PersistError::at(&target))?;
        }
        let relocated = WorkItem::with_mutations(target, item.mutations.clone());
        let sidecar = sidecar_path(&relocated.test_case);
        relocated
            .persist_mutations()
            .map_err(PersistError::at(&sidecar))?;
        Ok(relocated)
    }

    fn claim(&mut self, item: &WorkItem) -> OsString {
        let source = item.test_case.as_path();
        let stem = source.file_stem().unwrap_or_default().to_string_lossy();
        let ext = source.extension().map(|ext| ext.to_string_lossy());
        let mut n = 0usize;
        loop {
            let name: OsString = match (n, &ext) {
                (0, _) => source.file_name().unwrap_or_default().to_os_string(),
                (_, Some(ext)) => format!("{stem}-{n}.{ext}").into(),
                (_, None) => format!("{stem}-{n}").into(),
            };
            if let Some((owner, mutations)) = self.claims.get(&name) {
                if owner == source && *mutations == item.mutations {
                    return name;
                }
                n += 1;
                continue;
            }
            self.claims
                .insert(name.clone(), (source.to_path_buf(), item.mutations.clone()));
            return name;
        }
    }
}

/// Write `result.csv` with one `base, target, ref, file` row per item,
/// sorted by key then by item.
///
/// # Errors
///
/// Returns an error if the file cannot be written.
pub fn write_result_csv(
    dir: &Path,
    rows: &mut [(VersionKey, WorkItem)],
) -> Result<PathBuf, PersistError> {
    fs::create_dir_all(dir).map_err(PersistError::at(dir))?;
    rows.sort();

    let mut csv = String::from("base,target,ref,file\n");
    for (key, item) in rows.iter() {
        let (base, target, reference) = key.csv_columns();
        let _ = writeln!(
            csv,
            "{base}, {target}, {reference}, {}",
            item.test_case.display()
        );
    }

    let path = dir.join(RESULT_CSV);
    fs::write(&path, csv).map_err(PersistError::at(&path))?;
    Ok(path)
}

/// Write the changelog note naming the culprit ranges of a report group.
///
/// # Errors
///
/// Returns an error if the file cannot be written.
pub fn write_changelog(dir: &Path, text: &str) -> Result<(), PersistError> {
    fs::create_dir_all(dir).map_err(PersistError::at(dir))?;
    let path = dir.join(CHANGELOG);
    fs::write(&path, text).map_err(PersistError::at(&path))
}
