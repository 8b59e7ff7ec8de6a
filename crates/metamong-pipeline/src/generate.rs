//! Generate role: vet a seed and attach a mutation list to it.

use metamong_core::oracle::MutationGenerator;
use metamong_core::verdict::Verdict;
use metamong_core::version::VersionKey;
use metamong_core::WorkItem;
use tracing::{debug, warn};

use crate::worker::{Disposition, DropReason, Session, WorkerConfig};

/// Run the self-consistency check on the key's newest revision, then generate
/// and persist mutations for seeds that do not carry any yet.
pub fn process(
    session: &mut Session<'_>,
    mutator: &mut dyn MutationGenerator,
    config: &WorkerConfig,
    key: VersionKey,
    mut item: WorkItem,
) -> Disposition {
    let revision = key.newest();
    if !session.bind(&[revision]) {
        return Disposition::Drop(DropReason::SetupFailed);
    }

    // Re-serializing an unmutated page must not change its rendering.
    let baseline = session.trials(
        revision,
        &item.test_case,
        &[],
        false,
        config.self_check_runs,
    );
    if baseline != Verdict::NoBug {
        debug!(test_case = %item.test_case.display(), %baseline, "seed is not self-consistent");
        return Disposition::Drop(DropReason::Flaky);
    }

    if item.mutations.is_empty() {
        let snapshot = match session.snapshot_dom(revision, &item.test_case) {
            Ok(snapshot) => snapshot,
            Err(err) => {
                warn!(test_case = %item.test_case.display(), error = %err, "could not inspect seed");
                return Disposition::Drop(DropReason::Indeterminate);
            }
        };
        item.mutations = mutator.generate(&snapshot);
        if let Err(err) = item.persist_mutations() {
            warn!(test_case = %item.test_case.display(), error = %err, "could not write mutation sidecar");
            return Disposition::Drop(DropReason::PersistFailed);
        }
    }

    Disposition::Advance(key, item)
}
