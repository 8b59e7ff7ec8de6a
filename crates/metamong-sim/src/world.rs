//! Seeded description of a simulated browser history and its test pages.

use std::collections::BTreeSet;
use std::fmt::Write as _;

use metamong_core::version::{Revision, RevisionList};
use serde::{Deserialize, Serialize};

use crate::rng::DeterministicRng;

/// Style declaration the regression depends on.
pub const TRIGGER_DECLARATION: &str = "will-change: transform";
/// Element the regression depends on.
pub const TRIGGER_ELEMENT: &str = "id=\"hot\"";
/// Mutation command the regression depends on.
pub const TRIGGER_COMMAND: &str = "MetaScroll(";
/// Pages carrying this attribute differ between renders even unmutated.
pub const UNSTABLE_MARKER: &str = "data-unstable";

const FILLER_DECLARATIONS: &[&str] = &[
    "color: red",
    "margin: 3px",
    "padding: 1px 2px",
    "display: block",
    "opacity: 0.5",
    "border: 1px solid black",
    "font-size: 12px",
    "position: relative",
    "z-index: 4",
    "overflow: auto",
    "line-height: 1.5",
    "background: blue",
];

const FILLER_TAGS: &[&str] = &["div", "span", "p", "section", "b"];

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct WorldConfig {
    /// Length of the download revision list.
    pub revision_count: usize,
    /// Largest gap between consecutive listed revisions.
    pub max_gap: u64,
    /// Chance that an interior listed revision fails to start.
    pub crash_percent: u8,
    /// Chance that an interior listed revision hangs on every test.
    pub hang_percent: u8,
    /// Chance that an interior listed revision has no published binary.
    pub missing_percent: u8,
}

impl Default for WorldConfig {
    fn default() -> Self {
        Self {
            revision_count: 24,
            max_gap: 3,
            crash_percent: 8,
            hang_percent: 4,
            missing_percent: 4,
        }
    }
}

/// A browser history with one regression.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SimWorld {
    pub seed: u64,
    /// Sorted download list; the first entry is the base, the last the target.
    pub revisions: Vec<Revision>,
    /// First revision that shows the bug.
    pub regression: Revision,
    pub crashing: BTreeSet<Revision>,
    pub hanging: BTreeSet<Revision>,
    pub unpublished: BTreeSet<Revision>,
}

impl SimWorld {
    #[must_use]
    pub fn generate(seed: u64, config: &WorldConfig) -> Self {
        let root = DeterministicRng::new(seed);
        let mut layout = root.fork(1);
        let mut faults = root.fork(2);

        let count = config.revision_count.max(2);
        let mut revisions = Vec::with_capacity(count);
        let mut current = 1_000 + layout.below(1_000);
        for _ in 0..count {
            revisions.push(current);
            current += layout.between(1, config.max_gap.max(1));
        }

        let first = revisions[0];
        let last = revisions[count - 1];
        let regression = layout.between(first + 1, last);

        let mut crashing = BTreeSet::new();
        let mut hanging = BTreeSet::new();
        let mut unpublished = BTreeSet::new();
        for &revision in &revisions[1..count - 1] {
            if faults.percent(config.crash_percent) {
                crashing.insert(revision);
            } else if faults.percent(config.hang_percent) {
                hanging.insert(revision);
            } else if faults.percent(config.missing_percent) {
                unpublished.insert(revision);
            }
        }

        Self {
            seed,
            revisions,
            regression,
            crashing,
            hanging,
            unpublished,
        }
    }

    #[must_use]
    pub fn revision_list(&self) -> RevisionList {
        RevisionList::new(self.revisions.clone())
    }

    #[must_use]
    pub fn base(&self) -> Revision {
        self.revisions.first().copied().unwrap_or_default()
    }

    #[must_use]
    pub fn target(&self) -> Revision {
        self.revisions.last().copied().unwrap_or_default()
    }

    #[must_use]
    pub fn is_broken(&self, revision: Revision) -> bool {
        self.crashing.contains(&revision)
            || self.hanging.contains(&revision)
            || self.unpublished.contains(&revision)
    }

    /// No listed revision misbehaves, so every regression is bracketable.
    #[must_use]
    pub fn is_pristine(&self) -> bool {
        self.crashing.is_empty() && self.hanging.is_empty() && self.unpublished.is_empty()
    }

    /// Ground truth for one differential run.
    #[must_use]
    pub fn reproduces(&self, revision: Revision, html: &str, mutations: &[String]) -> bool {
        revision >= self.regression
            && html.contains(TRIGGER_DECLARATION)
            && html.contains(TRIGGER_ELEMENT)
            && mutations.iter().any(|m| m.contains(TRIGGER_COMMAND))
    }

    /// The culprit bracket a bisection over `list` must report.
    #[must_use]
    pub fn expected_bracket(&self, list: &RevisionList) -> Option<(Revision, Revision)> {
        let slice = list.as_slice();
        let high_index = slice.partition_point(|r| *r < self.regression);
        let high = *slice.get(high_index)?;
        let low = *slice.get(high_index.checked_sub(1)?)?;
        Some((low, high))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PageKind {
    /// Exhibits the regression; ships with a mutation sidecar.
    Trigger,
    /// Never reproduces; mutations come from the generator.
    Quiet,
    /// Fails the self-consistency check.
    Unstable,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SeedPage {
    pub name: String,
    pub kind: PageKind,
    pub html: String,
    /// Empty when the page should go through mutation generation.
    pub mutations: Vec<String>,
}

/// Lay out one seed page. Bodies hold one element per line, and every
/// element has a matching one-line style rule.
#[must_use]
pub fn seed_page(rng: &mut DeterministicRng, kind: PageKind, index: usize) -> SeedPage {
    let elements = 3 + rng.index(5);
    let hot = rng.index(elements);

    let mut style = String::new();
    let mut body = String::new();
    for e in 0..elements {
        let id = if e == hot && kind != PageKind::Quiet {
            "hot".to_string()
        } else {
            format!("e{e}")
        };
        let mut declarations: Vec<&str> = (0..1 + rng.index(4))
            .map(|_| FILLER_DECLARATIONS[rng.index(FILLER_DECLARATIONS.len())])
            .collect();
        if id == "hot" {
            let at = rng.index(declarations.len() + 1);
            declarations.insert(at, TRIGGER_DECLARATION);
        }
        let _ = writeln!(style, "#{id} {{ {}; }}", declarations.join("; "));

        let tag = FILLER_TAGS[rng.index(FILLER_TAGS.len())];
        let mut attrs = format!(" id=\"{id}\" class=\"c{e}\"");
        if rng.percent(50) {
            let _ = write!(attrs, " title=\"t{e}\"");
        }
        if kind == PageKind::Unstable && e == 0 {
            let _ = write!(attrs, " {UNSTABLE_MARKER}=\"1\"");
        }
        let _ = writeln!(body, "<{tag}{attrs}>text {e}</{tag}>");
    }

    let html = format!(
        "<!DOCTYPE html>\n<html><head><style>\n{style}</style></head><body>\n{body}</body></html>\n"
    );

    let mutations = if kind == PageKind::Trigger {
        let mut commands = vec![
            "window.Mut = new window.DelCSS(0);".to_string(),
            format!("window.Mut = new MetaWScroll({}, {});", rng.below(500), rng.below(500)),
            "window.Mut.restore();".to_string(),
        ];
        let at = rng.index(commands.len() + 1);
        commands.insert(
            at,
            format!("window.Mut = new MetaScroll('hot', {}, {});", rng.below(500), rng.below(500)),
        );
        commands
    } else {
        Vec::new()
    };

    let prefix = match kind {
        PageKind::Trigger => "trigger",
        PageKind::Quiet => "quiet",
        PageKind::Unstable => "unstable",
    };
    SeedPage {
        name: format!("{prefix}-{index:03}.html"),
        kind,
        html,
        mutations,
    }
}
