//! CrossVersionConfirm role and the cross-version predicate it is built on.

use std::path::Path;

use metamong_core::verdict::Verdict;
use metamong_core::version::{Revision, VersionKey};
use metamong_core::WorkItem;

use crate::worker::{Disposition, DropReason, Session, WorkerConfig};

/// The cross-version predicate: `Bug` iff the target shows the differential
/// bug and (in cross-version mode) the base does not, with every trial in
/// agreement.
///
/// The session must already be bound to `base` and `target`.
pub fn cross_version(
    session: &mut Session<'_>,
    config: &WorkerConfig,
    (base, target): (Revision, Revision),
    test_case: &Path,
    mutations: &[String],
) -> Verdict {
    let trials = config.iteration_count;
    let shots = config.save_screenshots;

    match session.trials(target, test_case, mutations, shots, trials) {
        Verdict::Bug => {}
        other => return other,
    }
    if !config.cross_version_mode {
        return Verdict::Bug;
    }
    match session.trials(base, test_case, mutations, shots, trials) {
        Verdict::NoBug => Verdict::Bug,
        Verdict::Bug => Verdict::NoBug,
        Verdict::Indeterminate => Verdict::Indeterminate,
    }
}

/// Bind the key's endpoint browsers.
pub fn bind_endpoints(session: &mut Session<'_>, key: VersionKey, config: &WorkerConfig) -> bool {
    let (base, target) = key.endpoints();
    if config.cross_version_mode {
        session.bind(&[base, target])
    } else {
        session.bind(&[target])
    }
}

pub fn process(
    session: &mut Session<'_>,
    config: &WorkerConfig,
    key: VersionKey,
    item: WorkItem,
) -> Disposition {
    if !bind_endpoints(session, key, config) {
        return Disposition::Drop(DropReason::SetupFailed);
    }
    match cross_version(session, config, key.endpoints(), &item.test_case, &item.mutations) {
        Verdict::Bug => Disposition::Advance(key, item),
        other => Disposition::Drop(DropReason::from_verdict(other)),
    }
}
