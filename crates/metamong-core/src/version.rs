//! Revisions, queue version keys, revision lists and milestone tables.

use std::fmt;
use std::fs;
use std::path::Path;

use serde::{Deserialize, Serialize};

use crate::error::ErrorCode;

/// A browser build identifier (Chromium commit position, Firefox build number).
pub type Revision = u64;

/// Key partitioning the work queue.
///
/// A key never changes once created; narrowing a bisection bracket produces a
/// new key.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum VersionKey {
    /// One revision under test.
    Single(Revision),
    /// A base revision expected to render correctly and a target expected not to.
    Pair { base: Revision, target: Revision },
    /// A bisection bracket plus the target revision the finding was confirmed on.
    Bracket {
        low: Revision,
        high: Revision,
        reference: Revision,
    },
}

impl VersionKey {
    /// The revision a single-browser stage should run.
    #[must_use]
    pub const fn newest(self) -> Revision {
        match self {
            Self::Single(rev) => rev,
            Self::Pair { target, .. } => target,
            Self::Bracket { high, .. } => high,
        }
    }

    /// The (expected-good, expected-bad) revision pair.
    #[must_use]
    pub const fn endpoints(self) -> (Revision, Revision) {
        match self {
            Self::Single(rev) => (rev, rev),
            Self::Pair { base, target } => (base, target),
            Self::Bracket { low, high, .. } => (low, high),
        }
    }

    /// The revision the finding was originally confirmed against.
    #[must_use]
    pub const fn reference(self) -> Revision {
        match self {
            Self::Single(rev) => rev,
            Self::Pair { target, .. } => target,
            Self::Bracket { reference, .. } => reference,
        }
    }

    /// `(base, target, ref)` columns for `result.csv`.
    #[must_use]
    pub const fn csv_columns(self) -> (Revision, Revision, Revision) {
        let (base, target) = self.endpoints();
        (base, target, self.reference())
    }
}

impl fmt::Display for VersionKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Single(rev) => write!(f, "{rev}"),
            Self::Pair { base, target } => write!(f, "{base}..{target}"),
            Self::Bracket {
                low,
                high,
                reference,
            } => write!(f, "{low}..{high}@{reference}"),
        }
    }
}

/// Errors raised while loading or resolving revisions.
#[derive(Debug, thiserror::Error)]
pub enum VersionError {
    #[error("failed to read revision list {path}: {source}")]
    Read {
        path: String,
        #[source]
        source: std::io::Error,
    },

    #[error("invalid revision {token:?} in revision list")]
    Parse { token: String },

    #[error("revision list is empty")]
    Empty,

    #[error("no revision table entry for {browser} milestone {milestone}")]
    UnknownMilestone { browser: BrowserKind, milestone: u32 },

    #[error("milestone {milestone} starts before the first known revision")]
    BeforeFirstRevision { milestone: u32 },

    #[error("revision {revision} is not in the revision list")]
    NotListed { revision: Revision },
}

impl VersionError {
    /// Machine-readable code for this error.
    #[must_use]
    pub const fn code(&self) -> ErrorCode {
        match self {
            Self::Read { .. } | Self::Parse { .. } | Self::Empty => {
                ErrorCode::RevisionListUnreadable
            }
            Self::UnknownMilestone { .. } => ErrorCode::UnknownMilestone,
            Self::BeforeFirstRevision { .. } | Self::NotListed { .. } => {
                ErrorCode::RevisionOutOfRange
            }
        }
    }
}

/// Sorted, deduplicated sequence of revisions. Immutable for a run.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct RevisionList {
    revisions: Vec<Revision>,
}

impl RevisionList {
    #[must_use]
    pub fn new(mut revisions: Vec<Revision>) -> Self {
        revisions.sort_unstable();
        revisions.dedup();
        Self { revisions }
    }

    /// Every revision in `first..=last`, used when builds can be made on demand.
    #[must_use]
    pub fn dense(first: Revision, last: Revision) -> Self {
        Self {
            revisions: (first..=last).collect(),
        }
    }

    /// Parse a `", "`-separated build list (the bisect-builds cache format).
    ///
    /// # Errors
    ///
    /// Returns an error on a non-numeric token or an empty list.
    pub fn parse(content: &str) -> Result<Self, VersionError> {
        let mut revisions = Vec::new();
        for token in content.split([',', '\n']) {
            let token = token.trim();
            if token.is_empty() {
                continue;
            }
            let revision = token.parse::<Revision>().map_err(|_| VersionError::Parse {
                token: token.to_string(),
            })?;
            revisions.push(revision);
        }

        if revisions.is_empty() {
            return Err(VersionError::Empty);
        }
        Ok(Self::new(revisions))
    }

    /// Load a build list from disk.
    ///
    /// # Errors
    ///
    /// Returns an error if the file cannot be read or parsed.
    pub fn load(path: &Path) -> Result<Self, VersionError> {
        let content = fs::read_to_string(path).map_err(|source| VersionError::Read {
            path: path.display().to_string(),
            source,
        })?;
        Self::parse(&content)
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.revisions.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.revisions.is_empty()
    }

    #[must_use]
    pub fn get(&self, index: usize) -> Option<Revision> {
        self.revisions.get(index).copied()
    }

    #[must_use]
    pub fn first(&self) -> Option<Revision> {
        self.revisions.first().copied()
    }

    #[must_use]
    pub fn last(&self) -> Option<Revision> {
        self.revisions.last().copied()
    }

    /// Index of an exact revision.
    #[must_use]
    pub fn index_of(&self, revision: Revision) -> Option<usize> {
        self.revisions.binary_search(&revision).ok()
    }

    /// Number of revisions strictly below `revision` (Python's `bisect_left`).
    #[must_use]
    pub fn lower_bound(&self, revision: Revision) -> usize {
        self.revisions.partition_point(|r| *r < revision)
    }

    /// Revisions within `low..=high`.
    #[must_use]
    pub fn between(&self, low: Revision, high: Revision) -> Self {
        Self {
            revisions: self
                .revisions
                .iter()
                .copied()
                .filter(|r| (low..=high).contains(r))
                .collect(),
        }
    }

    #[must_use]
    pub fn as_slice(&self) -> &[Revision] {
        &self.revisions
    }
}

/// Browser families the pipeline knows how to drive.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum BrowserKind {
    #[default]
    Chrome,
    Firefox,
}

impl BrowserKind {
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Chrome => "chrome",
            Self::Firefox => "firefox",
        }
    }

    /// First revision of each milestone, in milestone order.
    #[must_use]
    pub const fn milestones(self) -> &'static [(u32, Revision)] {
        match self {
            Self::Chrome => CHROME_MILESTONES,
            Self::Firefox => FIREFOX_MILESTONES,
        }
    }

    fn milestone_start(self, milestone: u32) -> Result<Revision, VersionError> {
        self.milestones()
            .iter()
            .find(|(m, _)| *m == milestone)
            .map(|(_, rev)| *rev)
            .ok_or(VersionError::UnknownMilestone {
                browser: self,
                milestone,
            })
    }
}

impl fmt::Display for BrowserKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

const CHROME_MILESTONES: &[(u32, Revision)] = &[
    (79, 706_915),
    (80, 722_274),
    (81, 737_173),
    (82, 749_737),
    (83, 756_066),
    (84, 768_962),
    (85, 782_793),
    (86, 800_218),
    (87, 812_852),
    (88, 827_102),
    (89, 843_830),
    (90, 857_950),
    (91, 870_763),
    (92, 885_287),
    (93, 902_210),
    (94, 911_515),
    (95, 920_003),
    (96, 929_512),
    (97, 938_553),
    (98, 950_365),
    (99, 961_656),
    (100, 972_766),
    (101, 982_481),
    (102, 992_738),
    (103, 1_002_911),
    (104, 1_012_729),
    (105, 1_027_018),
    (106, 1_036_826),
    (107, 1_047_731),
    (108, 1_058_933),
    (109, 1_070_088),
];

const FIREFOX_MILESTONES: &[(u32, Revision)] = &[
    (100, 613_239),
    (101, 615_744),
    (102, 619_134),
    (103, 622_119),
    (104, 624_997),
    (105, 627_802),
    (106, 635_720),
];

/// Maps milestone numbers onto concrete revisions.
///
/// Chrome milestones resolve through the list of downloadable builds; Firefox
/// revisions are built locally, so every number in a range is addressable.
#[derive(Debug, Clone)]
pub struct VersionManager {
    browser: BrowserKind,
    builds: RevisionList,
}

impl VersionManager {
    #[must_use]
    pub const fn new(browser: BrowserKind, builds: RevisionList) -> Self {
        Self { browser, builds }
    }

    #[must_use]
    pub const fn browser(&self) -> BrowserKind {
        self.browser
    }

    /// Last build before `milestone` branched from trunk.
    ///
    /// # Errors
    ///
    /// Returns an error for unknown milestones or builds before the list start.
    pub fn revision(&self, milestone: u32) -> Result<Revision, VersionError> {
        match self.browser {
            BrowserKind::Chrome => {
                let start = self.browser.milestone_start(milestone.saturating_sub(1))?;
                self.last_build_before(start, milestone)
            }
            BrowserKind::Firefox => self.browser.milestone_start(milestone),
        }
    }

    /// Last revision belonging to `milestone`.
    ///
    /// # Errors
    ///
    /// Returns an error for unknown milestones or builds before the list start.
    pub fn end_revision(&self, milestone: u32) -> Result<Revision, VersionError> {
        match self.browser {
            BrowserKind::Chrome => {
                let start = self.browser.milestone_start(milestone)?;
                self.last_build_before(start, milestone)
            }
            BrowserKind::Firefox => Ok(self
                .browser
                .milestone_start(milestone + 1)?
                .saturating_sub(1)),
        }
    }

    /// Every testable revision between two milestones, inclusive.
    ///
    /// # Errors
    ///
    /// Returns an error when either milestone cannot be resolved.
    pub fn revision_range(&self, from: u32, to: u32) -> Result<RevisionList, VersionError> {
        let low = self.revision(from)?;
        let high = self.revision(to)?;
        let range = match self.browser {
            BrowserKind::Chrome => self.builds.between(low, high),
            BrowserKind::Firefox => RevisionList::dense(low, high),
        };
        if range.is_empty() {
            return Err(VersionError::Empty);
        }
        Ok(range)
    }

    fn last_build_before(&self, start: Revision, milestone: u32) -> Result<Revision, VersionError> {
        let idx = self.builds.lower_bound(start);
        idx.checked_sub(1)
            .and_then(|i| self.builds.get(i))
            .ok_or(VersionError::BeforeFirstRevision { milestone })
    }
}
