use metamong_sim::campaign::{replay_seed, run_campaign};
use metamong_sim::rng::DeterministicRng;
use metamong_sim::world::{PageKind, seed_page};
use metamong_sim::{CampaignConfig, SimWorld, WorldConfig};
use proptest::prelude::*;

#[test]
fn default_campaign_passes() {
    let config = CampaignConfig {
        seed_range: 0..6,
        ..CampaignConfig::default()
    };
    let report = run_campaign(&config).expect("campaign should not error");
    assert_eq!(report.seeds_run, 6);
    assert!(
        report.all_passed(),
        "campaign failed: {} failures, first at seed {:?}: {:?}",
        report.failures.len(),
        report.first_failure,
        report.failures,
    );
    assert!(report.findings > 0);
}

#[test]
fn replay_is_deterministic() {
    let config = CampaignConfig {
        world: WorldConfig {
            crash_percent: 0,
            hang_percent: 0,
            missing_percent: 0,
            ..WorldConfig::default()
        },
        ..CampaignConfig::default()
    };
    let first = replay_seed(11, &config).expect("replay 1");
    let second = replay_seed(11, &config).expect("replay 2");

    assert_eq!(first.world, second.world);
    let keys = |trace: &metamong_sim::SeedTrace| -> Vec<_> {
        let mut keys: Vec<_> = trace
            .report
            .as_ref()
            .expect("pipeline ran")
            .findings
            .iter()
            .map(|f| (f.key, f.test_case.file_name().map(ToOwned::to_owned)))
            .collect();
        keys.sort();
        keys
    };
    assert_eq!(keys(&first), keys(&second));
    assert_eq!(first.finding_count(), config.trigger_pages);
}

#[test]
fn hanging_revisions_are_killed_and_skipped() {
    // Every interior build hangs, so bisection can only report nothing.
    let config = CampaignConfig {
        seed_range: 0..1,
        world: WorldConfig {
            revision_count: 4,
            crash_percent: 0,
            hang_percent: 100,
            missing_percent: 0,
            ..WorldConfig::default()
        },
        trigger_pages: 1,
        quiet_pages: 0,
        unstable_pages: 0,
        deadline_ms: 100,
        ..CampaignConfig::default()
    };
    let trace = replay_seed(0, &config).expect("replay should not error");
    assert!(trace.passed(), "violations: {:?}", trace.violations);
    assert!(!trace.world.hanging.is_empty());
    assert_eq!(trace.finding_count(), 0);
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(128))]

    #[test]
    fn worlds_keep_endpoints_usable(seed in any::<u64>(), count in 2usize..64) {
        let config = WorldConfig {
            revision_count: count,
            crash_percent: 30,
            hang_percent: 30,
            missing_percent: 30,
            ..WorldConfig::default()
        };
        let world = SimWorld::generate(seed, &config);
        prop_assert_eq!(world.revisions.len(), count);
        prop_assert!(world.revisions.windows(2).all(|w| w[0] < w[1]));
        prop_assert!(!world.is_broken(world.base()));
        prop_assert!(!world.is_broken(world.target()));

        let (low, high) = world
            .expected_bracket(&world.revision_list())
            .expect("regression lies inside the list");
        prop_assert!(low < world.regression && world.regression <= high);
    }

    #[test]
    fn only_trigger_pages_reproduce(seed in any::<u64>(), index in 0usize..100) {
        let world = SimWorld::generate(seed, &WorldConfig::default());
        let mut rng = DeterministicRng::new(seed);
        let trigger = seed_page(&mut rng, PageKind::Trigger, index);
        let quiet = seed_page(&mut rng, PageKind::Quiet, index);

        prop_assert!(world.reproduces(world.target(), &trigger.html, &trigger.mutations));
        prop_assert!(!world.reproduces(world.base(), &trigger.html, &trigger.mutations));
        prop_assert!(!world.reproduces(world.target(), &quiet.html, &trigger.mutations));
    }
}
