use std::collections::HashMap;

use metamong_core::oracle::RevisionOracle;
use metamong_core::verdict::Verdict;
use metamong_core::version::{Revision, RevisionList, VersionKey};
use metamong_core::WorkItem;
use metamong_pipeline::bisect::{self, IndexBracket, Step};
use metamong_pipeline::{Disposition, DropReason};
use proptest::prelude::*;

/// Verdicts fixed per revision; unscripted revisions are clean.
struct Scripted {
    verdicts: HashMap<Revision, Verdict>,
    checks: Vec<Revision>,
}

impl Scripted {
    fn new(bug: &[Revision], crash: &[Revision]) -> Self {
        let mut verdicts = HashMap::new();
        for &rev in bug {
            verdicts.insert(rev, Verdict::Bug);
        }
        for &rev in crash {
            verdicts.insert(rev, Verdict::Indeterminate);
        }
        Self {
            verdicts,
            checks: Vec::new(),
        }
    }
}

impl RevisionOracle for Scripted {
    fn judge(&mut self, revision: Revision, _item: &WorkItem) -> Verdict {
        self.checks.push(revision);
        self.verdicts.get(&revision).copied().unwrap_or(Verdict::NoBug)
    }
}

fn item() -> WorkItem {
    WorkItem::with_mutations("case.html", vec!["MetaWScroll(0, 1);".into()])
}

fn revisions(list: &[Revision]) -> RevisionList {
    RevisionList::new(list.to_vec())
}

#[test]
fn narrows_to_first_buggy_revision() {
    let list = revisions(&[5, 6, 7, 9]);
    let mut oracle = Scripted::new(&[7, 9], &[]);
    let found = bisect::bisect(&mut oracle, &list, IndexBracket::new(0, 3), &item());
    assert_eq!(found, vec![IndexBracket::new(1, 2)]);
    // Midpoints 7 and 6, then the terminal re-confirmation of both ends.
    assert_eq!(oracle.checks, vec![7, 6, 6, 7]);
}

#[test]
fn regression_right_after_base() {
    let list = revisions(&[5, 6, 7, 9]);
    let mut oracle = Scripted::new(&[6, 7, 9], &[]);
    let found = bisect::bisect(&mut oracle, &list, IndexBracket::new(0, 3), &item());
    assert_eq!(found, vec![IndexBracket::new(0, 1)]);
    assert_eq!(list.get(0), Some(5));
    assert_eq!(list.get(1), Some(6));
}

#[test]
fn crashing_midpoint_splits_around_itself() {
    let list = revisions(&[5, 7, 8, 9]);
    let mut oracle = Scripted::new(&[7, 9], &[8]);
    let step = bisect::step(&mut oracle, &list, IndexBracket::new(0, 3), &item());
    // The right half (3, 3) is degenerate and never checked.
    assert_eq!(step, Step::Split(vec![IndexBracket::new(0, 1)]));
    assert_eq!(oracle.checks, vec![8, 7]);
    if let Step::Split(survivors) = step {
        for bracket in survivors {
            assert!(!(bracket.low..=bracket.high).contains(&2));
        }
    }
}

#[test]
fn split_halves_that_do_not_hold_are_dropped() {
    let list = revisions(&[5, 7, 8, 9]);
    let mut oracle = Scripted::new(&[9], &[8]);
    let found = bisect::bisect(&mut oracle, &list, IndexBracket::new(0, 3), &item());
    assert!(found.is_empty());
}

#[test]
fn both_split_halves_can_survive() {
    let list = revisions(&[1, 2, 3, 4, 5, 6, 7]);
    // Index 3 crashes; 2 is buggy and 4 is clean, so both halves stay.
    let mut oracle = Scripted::new(&[2, 3, 6, 7], &[4]);
    let step = bisect::step(&mut oracle, &list, IndexBracket::new(0, 6), &item());
    assert_eq!(
        step,
        Step::Split(vec![IndexBracket::new(0, 2), IndexBracket::new(4, 6)])
    );
}

#[test]
fn terminal_bracket_that_fails_reconfirmation_is_rejected() {
    let list = revisions(&[5, 6]);
    let mut clean_high = Scripted::new(&[], &[]);
    assert_eq!(
        bisect::step(&mut clean_high, &list, IndexBracket::new(0, 1), &item()),
        Step::Rejected(Verdict::NoBug)
    );

    let mut buggy_low = Scripted::new(&[5, 6], &[]);
    assert_eq!(
        bisect::step(&mut buggy_low, &list, IndexBracket::new(0, 1), &item()),
        Step::Rejected(Verdict::NoBug)
    );
    assert_eq!(buggy_low.checks, vec![5]);
}

#[test]
fn degenerate_bracket_is_invalid() {
    let list = revisions(&[5, 6, 7]);
    let mut oracle = Scripted::new(&[], &[]);
    assert_eq!(
        bisect::step(&mut oracle, &list, IndexBracket::new(2, 2), &item()),
        Step::Invalid
    );
    assert!(oracle.checks.is_empty());
}

#[test]
fn process_turns_pair_keys_into_brackets() {
    let list = revisions(&[5, 6, 7, 9]);
    let mut oracle = Scripted::new(&[7, 9], &[]);
    let key = VersionKey::Pair { base: 5, target: 9 };
    let disposition = bisect::process(&mut oracle, &list, key, item());
    assert_eq!(
        disposition,
        Disposition::Requeue(vec![(
            VersionKey::Bracket {
                low: 5,
                high: 7,
                reference: 9
            },
            item()
        )])
    );
}

#[test]
fn process_advances_confirmed_brackets_and_drops_singles() {
    let list = revisions(&[5, 6, 7, 9]);
    let mut oracle = Scripted::new(&[7, 9], &[]);
    let key = VersionKey::Bracket {
        low: 6,
        high: 7,
        reference: 9,
    };
    assert_eq!(
        bisect::process(&mut oracle, &list, key, item()),
        Disposition::Advance(key, item())
    );
    assert_eq!(
        bisect::process(&mut oracle, &list, VersionKey::Single(7), item()),
        Disposition::Drop(DropReason::InvalidBracket)
    );
}

#[test]
fn crash_at_terminal_endpoint_is_indeterminate() {
    let list = revisions(&[5, 6]);
    let mut oracle = Scripted::new(&[], &[6]);
    let key = VersionKey::Bracket {
        low: 5,
        high: 6,
        reference: 6,
    };
    assert_eq!(
        bisect::process(&mut oracle, &list, key, item()),
        Disposition::Drop(DropReason::Indeterminate)
    );
}

fn sorted_revisions() -> impl Strategy<Value = Vec<Revision>> {
    prop::collection::btree_set(0u64..10_000, 2..64).prop_map(|set| set.into_iter().collect())
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(256))]

    #[test]
    fn monotone_oracle_finds_the_regression(
        list in sorted_revisions(),
        pick in any::<prop::sample::Index>(),
    ) {
        let regression = 1 + pick.index(list.len() - 1);
        let first_bad = list[regression];
        let buggy: Vec<Revision> = list.iter().copied().filter(|r| *r >= first_bad).collect();
        let revisions = RevisionList::new(list.clone());
        let mut oracle = Scripted::new(&buggy, &[]);

        let found = bisect::bisect(
            &mut oracle,
            &revisions,
            IndexBracket::new(0, list.len() - 1),
            &item(),
        );

        prop_assert_eq!(found, vec![IndexBracket::new(regression - 1, regression)]);
        // One check per halving plus the two re-confirmations.
        let halvings = usize::BITS - (list.len() - 1).leading_zeros();
        prop_assert!(oracle.checks.len() <= halvings as usize + 2);
    }

    #[test]
    fn split_brackets_never_contain_the_failed_index(
        list in sorted_revisions(),
        regression_pick in any::<prop::sample::Index>(),
    ) {
        let revisions = RevisionList::new(list.clone());
        let bracket = IndexBracket::new(0, list.len() - 1);
        let mid = bracket.midpoint();
        let regression = 1 + regression_pick.index(list.len() - 1);
        let buggy: Vec<Revision> = list[regression..].to_vec();
        let crash = if bracket.is_terminal() { Vec::new() } else { vec![list[mid]] };
        let mut oracle = Scripted::new(&buggy, &crash);

        if let Step::Split(survivors) = bisect::step(&mut oracle, &revisions, bracket, &item()) {
            for sub in survivors {
                prop_assert!(!sub.is_degenerate());
                prop_assert!(!(sub.low..=sub.high).contains(&mid));
                prop_assert!(sub.low >= bracket.low && sub.high <= bracket.high);
            }
        }
    }
}
