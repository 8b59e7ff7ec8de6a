//! Predicate-guarded reduction of a bug-reproducing test case.
//!
//! Passes run in a fixed order: mutation commands, style declarations, whole
//! elements (falling back to their attributes), text content, and finally
//! element unwrapping. A candidate is kept only if it still reproduces and
//! is no larger than the current best.
//!
//! Candidates are written to a `trim` scratch file; the best accepted
//! document lives in a `temp` scratch file next to the original. Both are
//! removed when the reduction ends, whatever the outcome.

pub mod style;

use std::fs;
use std::io;
use std::path::{Path, PathBuf};

use metamong_core::oracle::{BrowserError, DomEdit, ElementOutline};
use metamong_core::verdict::Verdict;
use metamong_core::version::VersionKey;
use metamong_core::WorkItem;
use serde::Serialize;
use thiserror::Error;
use tracing::{debug, info, warn};

use crate::confirm;
use crate::worker::{Disposition, DropReason, Session, WorkerConfig};
use style::{StyleSheet, chunk_sizes};

/// The browser-facing side of a reduction.
pub trait ReductionOracle {
    /// Whether `test_case` replayed with `mutations` still shows the bug.
    fn reproduces(&mut self, test_case: &Path, mutations: &[String]) -> Verdict;

    /// # Errors
    ///
    /// Returns an error if the page cannot be loaded.
    fn outline(&mut self, test_case: &Path) -> Result<Vec<ElementOutline>, BrowserError>;

    /// Serialized document after applying `edit` to `test_case`.
    ///
    /// # Errors
    ///
    /// Returns an error if the page cannot be loaded or the edit fails.
    fn apply_edit(&mut self, test_case: &Path, edit: &DomEdit) -> Result<String, BrowserError>;
}

#[derive(Debug, Error)]
pub enum MinimizeError {
    #[error("minimizer could not write {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
}

impl MinimizeError {
    fn at(path: &Path) -> impl FnOnce(io::Error) -> Self + '_ {
        move |source| Self::Io {
            path: path.to_path_buf(),
            source,
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct MinimizeStats {
    pub predicate_calls: usize,
    pub accepted: usize,
    pub mutations_before: usize,
    pub mutations_after: usize,
    pub bytes_before: usize,
    pub bytes_after: usize,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Reduction {
    /// The original was replaced in place; the pre-reduction copy is kept as
    /// `<stem>-orig.html`.
    Reduced { item: WorkItem, stats: MinimizeStats },
    /// The item did not reproduce, before or after reduction.
    Lost(Verdict),
}

/// Scratch files beside the test case; removed on drop.
struct Scratch {
    trim: PathBuf,
    temp: PathBuf,
}

impl Scratch {
    fn create(test_case: &Path, html: &str) -> Result<Self, MinimizeError> {
        let dir = test_case.parent().unwrap_or_else(|| Path::new("."));
        let name = test_case
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_default();
        let scratch = Self {
            trim: dir.join(format!("trim{name}")),
            temp: dir.join(format!("temp{name}")),
        };
        fs::write(&scratch.temp, html).map_err(MinimizeError::at(&scratch.temp))?;
        Ok(scratch)
    }
}

impl Drop for Scratch {
    fn drop(&mut self) {
        for path in [&self.trim, &self.temp] {
            match fs::remove_file(path) {
                Err(err) if err.kind() != io::ErrorKind::NotFound => {
                    debug!(path = %path.display(), error = %err, "could not remove scratch file");
                }
                _ => {}
            }
        }
    }
}

struct Minimizer<'o, O: ReductionOracle + ?Sized> {
    oracle: &'o mut O,
    scratch: Scratch,
    best: String,
    mutations: Vec<String>,
    stats: MinimizeStats,
}

impl<O: ReductionOracle + ?Sized> Minimizer<'_, O> {
    fn check(&mut self, test_case: &Path, mutations: &[String]) -> Verdict {
        self.stats.predicate_calls += 1;
        self.oracle.reproduces(test_case, mutations)
    }

    /// Keep `html` as the new best if it is no larger and still reproduces.
    fn try_candidate(&mut self, html: String) -> Result<bool, MinimizeError> {
        if html.len() > self.best.len() {
            return Ok(false);
        }
        let trim = self.scratch.trim.clone();
        fs::write(&trim, &html).map_err(MinimizeError::at(&trim))?;
        let mutations = self.mutations.clone();
        if self.check(&trim, &mutations) != Verdict::Bug {
            return Ok(false);
        }
        fs::write(&self.scratch.temp, &html).map_err(MinimizeError::at(&self.scratch.temp))?;
        self.best = html;
        self.stats.accepted += 1;
        Ok(true)
    }

    fn reduce_mutations(&mut self) {
        let temp = self.scratch.temp.clone();
        for index in (0..self.mutations.len()).rev() {
            let mut candidate = self.mutations.clone();
            candidate.remove(index);
            if self.check(&temp, &candidate) == Verdict::Bug {
                self.mutations = candidate;
                self.stats.accepted += 1;
            }
        }
    }

    fn reduce_style(&mut self) -> Result<(), MinimizeError> {
        let Some(mut sheet) = StyleSheet::parse(&self.best) else {
            return Ok(());
        };
        for rule in sheet.reducible_rules() {
            let declarations = sheet.declarations(rule).to_vec();
            let count = declarations.len();
            let mut removed = vec![false; count];

            for size in chunk_sizes(count) {
                let mut offset = 0;
                while offset < count {
                    let chunk = offset..(offset + size).min(count);
                    if removed[chunk.clone()].iter().all(|r| *r) {
                        offset += size;
                        continue;
                    }
                    let kept: Vec<String> = declarations
                        .iter()
                        .enumerate()
                        .filter(|(i, _)| !removed[*i] && !chunk.contains(i))
                        .map(|(_, decl)| decl.clone())
                        .collect();
                    let candidate = sheet.with_declarations(rule, kept);
                    if self.try_candidate(candidate.render())? {
                        removed[chunk].fill(true);
                        sheet = candidate;
                    }
                    offset += size;
                }
            }
        }
        Ok(())
    }

    fn outline(&mut self) -> Option<Vec<ElementOutline>> {
        match self.oracle.outline(&self.scratch.temp) {
            Ok(outline) => Some(outline),
            Err(err) => {
                warn!(error = %err, "could not outline page; skipping pass");
                None
            }
        }
    }

    fn try_edit(&mut self, edit: &DomEdit) -> Result<bool, MinimizeError> {
        match self.oracle.apply_edit(&self.scratch.temp, edit) {
            Ok(html) => self.try_candidate(html),
            Err(err) => {
                debug!(?edit, error = %err, "edit failed");
                Ok(false)
            }
        }
    }

    /// Remove elements back to front; an element that must stay loses what
    /// attributes it can.
    fn reduce_elements(&mut self) -> Result<(), MinimizeError> {
        let Some(outline) = self.outline() else {
            return Ok(());
        };
        for (index, element) in outline.iter().enumerate().rev() {
            if self.try_edit(&DomEdit::RemoveElement { index })? {
                continue;
            }
            for name in &element.attributes {
                self.try_edit(&DomEdit::RemoveAttribute {
                    index,
                    name: name.clone(),
                })?;
            }
        }
        Ok(())
    }

    fn reduce_each(&mut self, edit: impl Fn(usize) -> DomEdit) -> Result<(), MinimizeError> {
        let Some(outline) = self.outline() else {
            return Ok(());
        };
        for index in (0..outline.len()).rev() {
            self.try_edit(&edit(index))?;
        }
        Ok(())
    }
}

/// Reduce `item` in place.
///
/// # Errors
///
/// Returns an error if the test case cannot be read or a scratch file or the
/// final result cannot be written.
pub fn minimize<O: ReductionOracle + ?Sized>(
    oracle: &mut O,
    item: &WorkItem,
) -> Result<Reduction, MinimizeError> {
    let test_case = item.test_case.as_path();
    let html = fs::read_to_string(test_case).map_err(MinimizeError::at(test_case))?;
    let scratch = Scratch::create(test_case, &html)?;

    let mut m = Minimizer {
        oracle,
        scratch,
        stats: MinimizeStats {
            mutations_before: item.mutations.len(),
            bytes_before: html.len(),
            ..MinimizeStats::default()
        },
        best: html,
        mutations: item.mutations.clone(),
    };

    let initial = m.check(test_case, &item.mutations);
    if initial != Verdict::Bug {
        return Ok(Reduction::Lost(initial));
    }

    m.reduce_mutations();
    m.reduce_style()?;
    m.reduce_elements()?;
    m.reduce_each(|index| DomEdit::ClearText { index })?;
    m.reduce_each(|index| DomEdit::Unwrap { index })?;

    let temp = m.scratch.temp.clone();
    let mutations = m.mutations.clone();
    let last = m.check(&temp, &mutations);
    if last != Verdict::Bug {
        warn!(test_case = %test_case.display(), verdict = %last, "reduced case stopped reproducing");
        return Ok(Reduction::Lost(last));
    }

    let stem = test_case
        .file_stem()
        .map(|s| s.to_string_lossy().into_owned())
        .unwrap_or_default();
    let original = test_case.with_file_name(format!("{stem}-orig.html"));
    fs::rename(test_case, &original).map_err(MinimizeError::at(&original))?;
    fs::write(test_case, &m.best).map_err(MinimizeError::at(test_case))?;

    let reduced = WorkItem::with_mutations(test_case, m.mutations);
    reduced
        .persist_mutations()
        .map_err(MinimizeError::at(&reduced.sidecar()))?;

    let mut stats = m.stats;
    stats.mutations_after = reduced.mutations.len();
    stats.bytes_after = m.best.len();
    Ok(Reduction::Reduced {
        item: reduced,
        stats,
    })
}

/// Cross-version predicate over a bound session.
struct CrossVersionReducer<'s, 'a> {
    session: &'s mut Session<'a>,
    config: WorkerConfig,
    key: VersionKey,
}

impl ReductionOracle for CrossVersionReducer<'_, '_> {
    fn reproduces(&mut self, test_case: &Path, mutations: &[String]) -> Verdict {
        confirm::cross_version(
            self.session,
            &self.config,
            self.key.endpoints(),
            test_case,
            mutations,
        )
    }

    fn outline(&mut self, test_case: &Path) -> Result<Vec<ElementOutline>, BrowserError> {
        self.session.outline(self.key.newest(), test_case)
    }

    fn apply_edit(&mut self, test_case: &Path, edit: &DomEdit) -> Result<String, BrowserError> {
        self.session.apply_edit(self.key.newest(), test_case, edit)
    }
}

/// Minimize role.
pub fn process(
    session: &mut Session<'_>,
    config: &WorkerConfig,
    key: VersionKey,
    item: WorkItem,
) -> Disposition {
    if !confirm::bind_endpoints(session, key, config) {
        return Disposition::Drop(DropReason::SetupFailed);
    }
    let mut oracle = CrossVersionReducer {
        session,
        config: *config,
        key,
    };
    match minimize(&mut oracle, &item) {
        Ok(Reduction::Reduced { item, stats }) => {
            info!(
                test_case = %item.test_case.display(),
                calls = stats.predicate_calls,
                bytes_before = stats.bytes_before,
                bytes_after = stats.bytes_after,
                mutations_before = stats.mutations_before,
                mutations_after = stats.mutations_after,
                "minimized"
            );
            Disposition::Advance(key, item)
        }
        Ok(Reduction::Lost(verdict)) => Disposition::Drop(DropReason::from_verdict(verdict)),
        Err(err) => {
            warn!(test_case = %item.test_case.display(), error = %err, "minimization failed");
            Disposition::Drop(DropReason::MinimizeFailed)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    /// Pages are one element per line inside `<body>`; the bug needs the
    /// `#bug` element, the `will-change` declaration and the `MetaScroll`
    /// mutation.
    struct LineDom {
        calls: usize,
    }

    fn body_lines(html: &str) -> Vec<String> {
        let start = html.find("<body>").map_or(0, |i| i + "<body>".len());
        let end = html.find("</body>").unwrap_or(html.len());
        html[start..end]
            .lines()
            .filter(|l| !l.trim().is_empty())
            .map(str::to_string)
            .collect()
    }

    fn with_body(html: &str, lines: &[String]) -> String {
        let start = html.find("<body>").map_or(0, |i| i + "<body>".len());
        let end = html.find("</body>").unwrap_or(html.len());
        let mut body = String::from("\n");
        for line in lines {
            body.push_str(line);
            body.push('\n');
        }
        format!("{}{}{}", &html[..start], body, &html[end..])
    }

    impl ReductionOracle for LineDom {
        fn reproduces(&mut self, test_case: &Path, mutations: &[String]) -> Verdict {
            self.calls += 1;
            let html = fs::read_to_string(test_case).unwrap();
            let hit = html.contains("will-change: transform")
                && html.contains("id=\"bug\"")
                && mutations.iter().any(|m| m.contains("MetaScroll"));
            Verdict::from_bool(hit)
        }

        fn outline(&mut self, test_case: &Path) -> Result<Vec<ElementOutline>, BrowserError> {
            let html = fs::read_to_string(test_case)?;
            Ok(body_lines(&html)
                .iter()
                .map(|line| ElementOutline {
                    attributes: line
                        .split_whitespace()
                        .filter_map(|tok| tok.split_once('=').map(|(k, _)| k.to_string()))
                        .collect(),
                })
                .collect())
        }

        fn apply_edit(&mut self, test_case: &Path, edit: &DomEdit) -> Result<String, BrowserError> {
            let html = fs::read_to_string(test_case)?;
            let mut lines = body_lines(&html);
            match edit {
                DomEdit::RemoveElement { index } => {
                    lines.remove(*index);
                }
                DomEdit::RemoveAttribute { index, name } => {
                    let line = &lines[*index];
                    let kept: Vec<&str> = line
                        .split_whitespace()
                        .filter(|tok| !tok.starts_with(&format!("{name}=")))
                        .collect();
                    lines[*index] = kept.join(" ");
                }
                DomEdit::ClearText { .. } | DomEdit::Unwrap { .. } => {
                    return Err(BrowserError::Protocol("unsupported".into()));
                }
            }
            Ok(with_body(&html, &lines))
        }
    }

    const PAGE: &str = "<html><head><style>\n\
        #bug { color: red; will-change: transform; margin: 0; padding: 1px; }\n\
        #other { display: block; }\n\
        </style></head><body>\n\
        <div id=\"a\" class=\"x\" />\n\
        <div id=\"bug\" class=\"y\" />\n\
        <p id=\"c\" />\n\
        </body></html>";

    fn seed(dir: &Path) -> WorkItem {
        let path = dir.join("case.html");
        fs::write(&path, PAGE).unwrap();
        WorkItem::with_mutations(
            &path,
            vec![
                "window.Mut = new window.DelNode('a');".into(),
                "MetaScroll('bug', 0, 10);".into(),
                "MetaWScroll(0, 5);".into(),
            ],
        )
    }

    #[test]
    fn reduces_to_the_essential_parts() {
        let dir = tempfile::tempdir().unwrap();
        let item = seed(dir.path());
        let mut oracle = LineDom { calls: 0 };

        let Reduction::Reduced { item: reduced, stats } = minimize(&mut oracle, &item).unwrap() else {
            panic!("expected a reduction");
        };

        assert_eq!(reduced.mutations, vec!["MetaScroll('bug', 0, 10);".to_string()]);
        let html = fs::read_to_string(&reduced.test_case).unwrap();
        assert!(html.contains("#bug { will-change: transform; }"));
        assert!(!html.contains("id=\"a\""));
        assert!(!html.contains("id=\"c\""));
        assert!(!html.contains("class=\"y\""));
        assert!(html.contains("id=\"bug\""));
        assert!(stats.bytes_after < stats.bytes_before);
        assert_eq!(stats.predicate_calls, oracle.calls);

        let original = fs::read_to_string(dir.path().join("case-orig.html")).unwrap();
        assert_eq!(original, PAGE);
        let sidecar = fs::read_to_string(dir.path().join("case.js")).unwrap();
        assert_eq!(sidecar, "MetaScroll('bug', 0, 10);");
    }

    #[test]
    fn scratch_files_are_cleaned_up() {
        let dir = tempfile::tempdir().unwrap();
        let item = seed(dir.path());
        minimize(&mut LineDom { calls: 0 }, &item).unwrap();
        assert!(!dir.path().join("trimcase.html").exists());
        assert!(!dir.path().join("tempcase.html").exists());
    }

    #[test]
    fn non_reproducing_input_is_left_alone() {
        let dir = tempfile::tempdir().unwrap();
        let mut item = seed(dir.path());
        item.mutations.retain(|m| !m.contains("MetaScroll"));
        let outcome = minimize(&mut LineDom { calls: 0 }, &item).unwrap();
        assert_eq!(outcome, Reduction::Lost(Verdict::NoBug));
        assert_eq!(fs::read_to_string(&item.test_case).unwrap(), PAGE);
        assert!(!dir.path().join("case-orig.html").exists());
        assert!(!dir.path().join("tempcase.html").exists());
    }

    #[test]
    fn protected_rules_survive() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("keep.html");
        let page = PAGE.replace("#other", "/* DO NOT REMOVE */\n#other");
        fs::write(&path, &page).unwrap();
        let item = WorkItem::with_mutations(&path, vec!["MetaScroll('bug', 0, 1);".into()]);

        minimize(&mut LineDom { calls: 0 }, &item).unwrap();
        let html = fs::read_to_string(&path).unwrap();
        assert!(html.contains("#other { display: block; }"));
    }
}
