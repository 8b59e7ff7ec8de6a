//! Bisection over a revision list with three-way midpoint outcomes.
//!
//! A bracket `(low, high)` indexes the revision list; `low` is believed
//! clean and `high` buggy. Each [`step`] checks one midpoint:
//!
//! - bug at mid: continue with `(low, mid)`
//! - no bug at mid: continue with `(mid, high)`
//! - indeterminate at mid: split into the disjoint `(low, mid - 1)` and
//!   `(mid + 1, high)`, keeping each only if its new endpoint checks the
//!   way the bracket invariant requires
//!
//! Brackets with `high - low == 1` are terminal and are re-confirmed at both
//! endpoints before being reported.

use metamong_core::oracle::RevisionOracle;
use metamong_core::verdict::Verdict;
use metamong_core::version::{Revision, RevisionList, VersionKey};
use metamong_core::WorkItem;
use tracing::{debug, info, warn};

use crate::worker::{Disposition, DropReason};

/// Index bracket into a [`RevisionList`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct IndexBracket {
    pub low: usize,
    pub high: usize,
}

impl IndexBracket {
    #[must_use]
    pub const fn new(low: usize, high: usize) -> Self {
        Self { low, high }
    }

    #[must_use]
    pub const fn is_terminal(self) -> bool {
        self.low < self.high && self.high - self.low == 1
    }

    #[must_use]
    pub const fn is_degenerate(self) -> bool {
        self.low >= self.high
    }

    /// `ceil((low + high) / 2)`; strictly inside non-terminal brackets.
    #[must_use]
    pub const fn midpoint(self) -> usize {
        (self.low + self.high).div_ceil(2)
    }
}

/// Result of one bisection step.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Step {
    Narrowed(IndexBracket),
    /// Survivors of an indeterminate midpoint; possibly none.
    Split(Vec<IndexBracket>),
    /// A terminal bracket whose endpoints re-confirmed.
    Confirmed(IndexBracket),
    /// A terminal bracket whose endpoints did not re-confirm.
    Rejected(Verdict),
    /// Degenerate, or outside the list.
    Invalid,
}

fn judge_at(
    oracle: &mut dyn RevisionOracle,
    revisions: &RevisionList,
    index: usize,
    item: &WorkItem,
) -> Verdict {
    revisions
        .get(index)
        .map_or(Verdict::Indeterminate, |revision| oracle.judge(revision, item))
}

/// Advance `bracket` by one check (or by the two re-confirmation checks of a
/// terminal bracket).
pub fn step(
    oracle: &mut dyn RevisionOracle,
    revisions: &RevisionList,
    bracket: IndexBracket,
    item: &WorkItem,
) -> Step {
    if bracket.is_degenerate() || bracket.high >= revisions.len() {
        return Step::Invalid;
    }

    if bracket.is_terminal() {
        let low = judge_at(oracle, revisions, bracket.low, item);
        if low != Verdict::NoBug {
            return Step::Rejected(if low == Verdict::Bug { Verdict::NoBug } else { low });
        }
        return match judge_at(oracle, revisions, bracket.high, item) {
            Verdict::Bug => Step::Confirmed(bracket),
            other => Step::Rejected(other),
        };
    }

    let mid = bracket.midpoint();
    match judge_at(oracle, revisions, mid, item) {
        Verdict::Bug => Step::Narrowed(IndexBracket::new(bracket.low, mid)),
        Verdict::NoBug => Step::Narrowed(IndexBracket::new(mid, bracket.high)),
        Verdict::Indeterminate => Step::Split(split(oracle, revisions, bracket, mid, item)),
    }
}

fn split(
    oracle: &mut dyn RevisionOracle,
    revisions: &RevisionList,
    bracket: IndexBracket,
    mid: usize,
    item: &WorkItem,
) -> Vec<IndexBracket> {
    let mut survivors = Vec::with_capacity(2);

    let left = IndexBracket::new(bracket.low, mid - 1);
    if left.is_degenerate() {
        debug!(?left, "dropping degenerate sub-bracket");
    } else if judge_at(oracle, revisions, left.high, item) == Verdict::Bug {
        survivors.push(left);
    }

    let right = IndexBracket::new(mid + 1, bracket.high);
    if right.is_degenerate() {
        debug!(?right, "dropping degenerate sub-bracket");
    } else if judge_at(oracle, revisions, right.low, item) == Verdict::NoBug {
        survivors.push(right);
    }

    survivors
}

/// Translate a queue key into an index bracket plus the reference revision.
fn resolve(revisions: &RevisionList, key: VersionKey) -> Option<(IndexBracket, Revision)> {
    let (low, high, reference) = match key {
        VersionKey::Pair { base, target } => (base, target, target),
        VersionKey::Bracket {
            low,
            high,
            reference,
        } => (low, high, reference),
        VersionKey::Single(_) => return None,
    };
    let bracket = IndexBracket::new(revisions.index_of(low)?, revisions.index_of(high)?);
    Some((bracket, reference))
}

fn key_for(revisions: &RevisionList, bracket: IndexBracket, reference: Revision) -> Option<VersionKey> {
    Some(VersionKey::Bracket {
        low: revisions.get(bracket.low)?,
        high: revisions.get(bracket.high)?,
        reference,
    })
}

/// Bisect role: one step per popped item.
pub fn process(
    oracle: &mut dyn RevisionOracle,
    revisions: &RevisionList,
    key: VersionKey,
    item: WorkItem,
) -> Disposition {
    let Some((bracket, reference)) = resolve(revisions, key) else {
        warn!(%key, test_case = %item.test_case.display(), "bracket endpoints are not in the revision list");
        return Disposition::Drop(DropReason::InvalidBracket);
    };

    match step(oracle, revisions, bracket, &item) {
        Step::Narrowed(next) => match key_for(revisions, next, reference) {
            Some(next_key) => Disposition::Requeue(vec![(next_key, item)]),
            None => Disposition::Drop(DropReason::InvalidBracket),
        },
        Step::Split(survivors) => {
            if survivors.is_empty() {
                info!(%key, test_case = %item.test_case.display(), "indeterminate midpoint; no sub-bracket survived");
                return Disposition::Drop(DropReason::Indeterminate);
            }
            let requeue: Vec<(VersionKey, WorkItem)> = survivors
                .into_iter()
                .filter_map(|b| key_for(revisions, b, reference))
                .map(|k| (k, item.clone()))
                .collect();
            Disposition::Requeue(requeue)
        }
        Step::Confirmed(found) => match key_for(revisions, found, reference) {
            Some(found_key) => {
                info!(bracket = %found_key, test_case = %item.test_case.display(), "regression bracketed");
                Disposition::Advance(found_key, item)
            }
            None => Disposition::Drop(DropReason::InvalidBracket),
        },
        Step::Rejected(verdict) => {
            debug!(%key, %verdict, "terminal bracket did not re-confirm");
            Disposition::Drop(DropReason::from_verdict(verdict))
        }
        Step::Invalid => {
            warn!(%key, test_case = %item.test_case.display(), "degenerate bracket dropped");
            Disposition::Drop(DropReason::InvalidBracket)
        }
    }
}

/// Run [`step`] to completion on a worklist, as the queue would across
/// re-insertions. Returns the confirmed terminal brackets, sorted.
pub fn bisect(
    oracle: &mut dyn RevisionOracle,
    revisions: &RevisionList,
    start: IndexBracket,
    item: &WorkItem,
) -> Vec<IndexBracket> {
    let mut pending = vec![start];
    let mut found = Vec::new();
    while let Some(bracket) = pending.pop() {
        match step(oracle, revisions, bracket, item) {
            Step::Narrowed(next) => pending.push(next),
            Step::Split(survivors) => pending.extend(survivors),
            Step::Confirmed(done) => found.push(done),
            Step::Rejected(_) | Step::Invalid => {}
        }
    }
    found.sort_unstable();
    found
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn midpoint_rounds_up_and_stays_inside() {
        assert_eq!(IndexBracket::new(0, 3).midpoint(), 2);
        assert_eq!(IndexBracket::new(0, 2).midpoint(), 1);
        assert_eq!(IndexBracket::new(4, 9).midpoint(), 7);
        for low in 0..20 {
            for high in low + 2..25 {
                let mid = IndexBracket::new(low, high).midpoint();
                assert!(low < mid && mid < high);
            }
        }
    }

    #[test]
    fn terminal_and_degenerate_shapes() {
        assert!(IndexBracket::new(3, 4).is_terminal());
        assert!(!IndexBracket::new(3, 5).is_terminal());
        assert!(IndexBracket::new(4, 4).is_degenerate());
        assert!(IndexBracket::new(5, 4).is_degenerate());
    }

    #[test]
    fn pair_keys_resolve_with_target_as_reference() {
        let list = RevisionList::new(vec![5, 6, 7, 9]);
        let (bracket, reference) = resolve(&list, VersionKey::Pair { base: 5, target: 9 }).unwrap();
        assert_eq!(bracket, IndexBracket::new(0, 3));
        assert_eq!(reference, 9);
        assert!(resolve(&list, VersionKey::Pair { base: 4, target: 9 }).is_none());
        assert!(resolve(&list, VersionKey::Single(5)).is_none());
    }
}
