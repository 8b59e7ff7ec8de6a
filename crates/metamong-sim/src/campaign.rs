//! Campaign runner for deterministic pipeline simulations.
//!
//! Each seed lays out a [`SimWorld`], writes its seed pages to a scratch
//! directory, runs the full pipeline against the simulated fleet and checks
//! the findings against the world's ground truth.

use std::collections::BTreeMap;
use std::fmt;
use std::fs;
use std::ops::Range;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result, bail};
use metamong_core::config::MetamongConfig;
use metamong_core::provision::BinaryCache;
use metamong_core::queue::{QueueConfig, VersionedWorkQueue};
use metamong_core::version::{Revision, RevisionList, VersionKey};
use metamong_core::watchdog::Watchdog;
use metamong_core::WorkItem;
use metamong_pipeline::stage::discover;
use metamong_pipeline::{Collaborators, MetaMutatorFactory, Pipeline, PipelineOptions, PipelineReport};
use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use crate::browser::{SimFactory, SimProvisioner};
use crate::rng::DeterministicRng;
use crate::world::{PageKind, SimWorld, WorldConfig, seed_page};

/// Upper bound on a simulated hang when nothing kills it.
const HANG_LIMIT: Duration = Duration::from_secs(10);
const MONITOR_INTERVAL: Duration = Duration::from_millis(20);

/// Campaign-level configuration controlling how many seeds to run and what
/// each simulated world looks like.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CampaignConfig {
    /// Range of seeds to execute, e.g., `0..20`.
    pub seed_range: Range<u64>,
    pub world: WorldConfig,
    /// Seed pages exhibiting the regression.
    pub trigger_pages: usize,
    /// Seed pages that never reproduce.
    pub quiet_pages: usize,
    /// Seed pages failing the self-consistency check.
    pub unstable_pages: usize,
    pub workers: usize,
    /// Differential runs per verdict.
    pub iteration_count: usize,
    /// Follow download bisection with a build bisection over every revision.
    pub refine_with_build: bool,
    /// Watchdog deadline for a single browser operation.
    pub deadline_ms: u64,
}

impl Default for CampaignConfig {
    fn default() -> Self {
        Self {
            seed_range: 0..20,
            world: WorldConfig::default(),
            trigger_pages: 2,
            quiet_pages: 2,
            unstable_pages: 1,
            workers: 2,
            iteration_count: 2,
            refine_with_build: false,
            deadline_ms: 400,
        }
    }
}

impl CampaignConfig {
    /// Validate configuration before running.
    ///
    /// # Errors
    ///
    /// Returns an error if any parameter is out of valid range.
    pub fn validate(&self) -> Result<()> {
        if self.seed_range.is_empty() {
            bail!("seed_range must not be empty");
        }
        if self.world.revision_count < 2 {
            bail!("revision_count must be >= 2");
        }
        if self.workers == 0 {
            bail!("workers must be > 0");
        }
        if self.iteration_count == 0 {
            bail!("iteration_count must be > 0");
        }
        if self.deadline_ms == 0 {
            bail!("deadline_ms must be > 0");
        }
        Ok(())
    }

    /// The revision list a finding's bracket is expressed in.
    fn bracket_list(&self, world: &SimWorld) -> RevisionList {
        if self.refine_with_build {
            RevisionList::dense(world.base(), world.target())
        } else {
            world.revision_list()
        }
    }
}

/// A pipeline outcome that contradicts the world's ground truth.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Violation {
    /// The pipeline itself returned an error.
    PipelineFailed { error: String },
    /// A stage lost track of items it popped.
    LostItems {
        stage: String,
        popped: usize,
        accounted: usize,
    },
    /// A finding is keyed by something other than a culprit bracket.
    NotBracketed { test_case: String, key: String },
    WrongBracket {
        test_case: String,
        found: (Revision, Revision),
        expected: Option<(Revision, Revision)>,
    },
    /// The reduced test case no longer separates the bracket endpoints.
    NotReproducing {
        test_case: String,
        revision: Revision,
        expected_bug: bool,
    },
    /// Minimization made a test case bigger.
    Grew {
        test_case: String,
        before: usize,
        after: usize,
    },
    /// A clean world lost some of its trigger pages.
    Missed { expected: usize, found: usize },
}

impl fmt::Display for Violation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::PipelineFailed { error } => write!(f, "PipelineFailed: {error}"),
            Self::LostItems {
                stage,
                popped,
                accounted,
            } => write!(
                f,
                "LostItems: {stage} popped {popped} items but accounted for {accounted}"
            ),
            Self::NotBracketed { test_case, key } => {
                write!(f, "NotBracketed: {test_case} finished under key {key}")
            }
            Self::WrongBracket {
                test_case,
                found,
                expected,
            } => write!(
                f,
                "WrongBracket: {test_case} bracketed {}..{} (expected {expected:?})",
                found.0, found.1
            ),
            Self::NotReproducing {
                test_case,
                revision,
                expected_bug,
            } => write!(
                f,
                "NotReproducing: {test_case} at {revision} should {}reproduce",
                if *expected_bug { "" } else { "not " }
            ),
            Self::Grew {
                test_case,
                before,
                after,
            } => write!(f, "Grew: {test_case} went from {before} to {after} bytes"),
            Self::Missed { expected, found } => {
                write!(f, "Missed: expected {expected} findings, got {found}")
            }
        }
    }
}

/// Failure details for a single seed.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SeedFailure {
    pub seed: u64,
    pub violations: Vec<String>,
}

/// Aggregate report produced by a campaign run.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CampaignReport {
    pub seeds_run: usize,
    pub seeds_passed: usize,
    /// First seed that failed (for prioritized replay).
    pub first_failure: Option<u64>,
    pub failures: Vec<SeedFailure>,
    /// Total findings across all seeds.
    pub findings: usize,
    /// Seeds whose world had at least one misbehaving revision.
    pub faulty_worlds: usize,
}

impl CampaignReport {
    #[must_use]
    pub fn all_passed(&self) -> bool {
        self.failures.is_empty()
    }
}

/// Everything observed while running one seed.
#[derive(Debug, Clone)]
pub struct SeedTrace {
    pub world: SimWorld,
    /// `None` when the pipeline failed outright.
    pub report: Option<PipelineReport>,
    pub violations: Vec<Violation>,
    /// Binary provisioning calls made by the cache.
    pub provisioned: usize,
}

impl SeedTrace {
    #[must_use]
    pub fn passed(&self) -> bool {
        self.violations.is_empty()
    }

    #[must_use]
    pub fn finding_count(&self) -> usize {
        self.report.as_ref().map_or(0, |r| r.findings.len())
    }
}

/// Run a full campaign across all seeds in the config.
///
/// # Errors
///
/// Returns an error if config validation fails or a seed's scratch space
/// cannot be prepared.
pub fn run_campaign(config: &CampaignConfig) -> Result<CampaignReport> {
    config.validate()?;

    let mut report = CampaignReport {
        seeds_run: 0,
        seeds_passed: 0,
        first_failure: None,
        failures: Vec::new(),
        findings: 0,
        faulty_worlds: 0,
    };

    for seed in config.seed_range.clone() {
        let trace = simulate(seed, config)?;
        report.seeds_run += 1;
        report.findings += trace.finding_count();
        if !trace.world.is_pristine() {
            report.faulty_worlds += 1;
        }
        if trace.passed() {
            report.seeds_passed += 1;
        } else {
            report.first_failure.get_or_insert(seed);
            report.failures.push(SeedFailure {
                seed,
                violations: trace.violations.iter().map(ToString::to_string).collect(),
            });
        }
    }

    info!(
        seeds = report.seeds_run,
        passed = report.seeds_passed,
        findings = report.findings,
        "campaign finished"
    );
    Ok(report)
}

/// Run a single seed and return Ok(()) on pass, Err(violations) on failure.
///
/// # Errors
///
/// Returns an error if the seed's scratch space cannot be prepared. The
/// inner `Result` distinguishes pass from invariant violations.
pub fn run_single_seed(
    seed: u64,
    config: &CampaignConfig,
) -> Result<std::result::Result<(), Vec<Violation>>> {
    let trace = simulate(seed, config)?;
    if trace.passed() {
        Ok(Ok(()))
    } else {
        Ok(Err(trace.violations))
    }
}

/// Replay a single seed with full details for debugging.
///
/// # Errors
///
/// Returns an error when config validation fails or the seed's scratch space
/// cannot be prepared.
pub fn replay_seed(seed: u64, config: &CampaignConfig) -> Result<SeedTrace> {
    config.validate()?;
    simulate(seed, config)
}

fn simulate(seed: u64, config: &CampaignConfig) -> Result<SeedTrace> {
    let world = Arc::new(SimWorld::generate(seed, &config.world));
    let scratch = tempfile::tempdir().context("creating simulation scratch directory")?;
    let input = scratch.path().join("input");
    let output = scratch.path().join("output");
    fs::create_dir_all(&input).context("creating simulated input directory")?;

    let originals = write_seed_pages(seed, config, &input)?;
    let seeds = discover(&input)?;
    debug!(seed, pages = seeds.len(), regression = world.regression, "simulating seed");

    let provisioner = Arc::new(SimProvisioner::new(
        scratch.path().join("browsers"),
        world.unpublished.iter().copied().collect(),
    ));
    let cache = BinaryCache::new(Arc::clone(&provisioner) as _, config.workers);
    let factory = SimFactory::new(Arc::clone(&world), HANG_LIMIT);
    let mutators = MetaMutatorFactory::new(seed);
    let revisions = world.revision_list();

    let mut options = PipelineOptions::from_config(
        &MetamongConfig::default(),
        world.base(),
        world.target(),
        &output,
    );
    options.workers = config.workers;
    options.worker.iteration_count = config.iteration_count;
    options.refine_with_build = config.refine_with_build;
    options.report_pass = true;
    options.monitor_interval = MONITOR_INTERVAL;

    let queue = VersionedWorkQueue::new(
        QueueConfig {
            seed,
            ..QueueConfig::default()
        },
        Watchdog::new(Duration::from_millis(config.deadline_ms)),
    );
    let pipeline = Pipeline::new(
        options,
        queue,
        Collaborators {
            cache: &cache,
            browsers: &factory,
            mutators: &mutators,
            revisions: &revisions,
        },
    );

    let (report, violations) = match pipeline.run(seeds) {
        Ok(report) => {
            let violations = check(config, &world, &report, &originals);
            (Some(report), violations)
        }
        Err(err) => (
            None,
            vec![Violation::PipelineFailed {
                error: format!("{err:#}"),
            }],
        ),
    };

    Ok(SeedTrace {
        world: Arc::unwrap_or_clone(world),
        report,
        violations,
        provisioned: provisioner.calls(),
    })
}

/// Write the seed pages and return each page's original size by file name.
fn write_seed_pages(
    seed: u64,
    config: &CampaignConfig,
    input: &Path,
) -> Result<BTreeMap<String, usize>> {
    let mut rng = DeterministicRng::new(seed).fork(3);
    let kinds = [
        (PageKind::Trigger, config.trigger_pages),
        (PageKind::Quiet, config.quiet_pages),
        (PageKind::Unstable, config.unstable_pages),
    ];

    let mut sizes = BTreeMap::new();
    for (kind, count) in kinds {
        for index in 0..count {
            let page = seed_page(&mut rng, kind, index);
            let path = input.join(&page.name);
            fs::write(&path, &page.html)
                .with_context(|| format!("writing {}", path.display()))?;
            if !page.mutations.is_empty() {
                WorkItem::with_mutations(&path, page.mutations)
                    .persist_mutations()
                    .with_context(|| format!("writing sidecar for {}", path.display()))?;
            }
            sizes.insert(page.name, page.html.len());
        }
    }
    Ok(sizes)
}

fn check(
    config: &CampaignConfig,
    world: &SimWorld,
    report: &PipelineReport,
    originals: &BTreeMap<String, usize>,
) -> Vec<Violation> {
    let mut violations = Vec::new();

    for stage in &report.stages {
        let stats = &stage.stats;
        let accounted = stats.advanced + stats.requeued + stats.dropped_total();
        if stats.popped != accounted {
            violations.push(Violation::LostItems {
                stage: stage.stage.clone(),
                popped: stats.popped,
                accounted,
            });
        }
    }

    let expected = world.expected_bracket(&config.bracket_list(world));
    for finding in &report.findings {
        let test_case = finding.test_case.display().to_string();
        let VersionKey::Bracket { low, high, .. } = finding.key else {
            violations.push(Violation::NotBracketed {
                test_case,
                key: finding.key.to_string(),
            });
            continue;
        };
        if expected != Some((low, high)) {
            violations.push(Violation::WrongBracket {
                test_case: test_case.clone(),
                found: (low, high),
                expected,
            });
        }

        let (html, mutations) = match (
            fs::read_to_string(&finding.test_case),
            WorkItem::load(&finding.test_case),
        ) {
            (Ok(html), Ok(item)) => (html, item.mutations),
            _ => {
                violations.push(Violation::NotReproducing {
                    test_case,
                    revision: high,
                    expected_bug: true,
                });
                continue;
            }
        };
        for (revision, expected_bug) in [(high, true), (low, false)] {
            if world.reproduces(revision, &html, &mutations) != expected_bug {
                violations.push(Violation::NotReproducing {
                    test_case: test_case.clone(),
                    revision,
                    expected_bug,
                });
            }
        }

        let name = finding
            .test_case
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_default();
        match originals.get(&name) {
            Some(&before) if html.len() > before => violations.push(Violation::Grew {
                test_case,
                before,
                after: html.len(),
            }),
            _ => {}
        }
    }

    if world.is_pristine() && report.findings.len() != config.trigger_pages {
        violations.push(Violation::Missed {
            expected: config.trigger_pages,
            found: report.findings.len(),
        });
    }

    violations
}

#[cfg(test)]
mod tests {
    use super::*;

    fn quick() -> CampaignConfig {
        CampaignConfig {
            seed_range: 0..4,
            trigger_pages: 1,
            quiet_pages: 1,
            unstable_pages: 1,
            ..CampaignConfig::default()
        }
    }

    fn pristine() -> CampaignConfig {
        CampaignConfig {
            world: WorldConfig {
                crash_percent: 0,
                hang_percent: 0,
                missing_percent: 0,
                ..WorldConfig::default()
            },
            ..quick()
        }
    }

    #[test]
    fn campaign_config_default_is_valid() {
        assert!(CampaignConfig::default().validate().is_ok());
    }

    #[test]
    fn campaign_config_empty_seed_range_rejected() {
        let config = CampaignConfig {
            seed_range: 5..5,
            ..CampaignConfig::default()
        };
        assert!(config.validate().is_err());
    }

    #[test]
    fn campaign_config_zero_workers_rejected() {
        let config = CampaignConfig {
            workers: 0,
            ..CampaignConfig::default()
        };
        assert!(config.validate().is_err());
    }

    #[test]
    fn campaign_config_single_revision_rejected() {
        let config = CampaignConfig {
            world: WorldConfig {
                revision_count: 1,
                ..WorldConfig::default()
            },
            ..CampaignConfig::default()
        };
        assert!(config.validate().is_err());
    }

    #[test]
    fn pristine_seed_finds_every_trigger() {
        let trace = replay_seed(3, &pristine()).expect("replay should not error");
        assert!(trace.passed(), "violations: {:?}", trace.violations);
        assert_eq!(trace.finding_count(), 1);
        assert!(trace.provisioned > 0);
    }

    #[test]
    fn run_single_seed_passes() {
        let result = run_single_seed(0, &pristine()).expect("sim should not error");
        assert!(result.is_ok(), "seed 0 should pass: {result:?}");
    }

    #[test]
    fn faulty_worlds_stay_sound() {
        let config = CampaignConfig {
            world: WorldConfig {
                crash_percent: 20,
                hang_percent: 5,
                missing_percent: 10,
                ..WorldConfig::default()
            },
            ..quick()
        };
        let report = run_campaign(&config).expect("campaign should not error");
        assert_eq!(report.seeds_run, 4);
        assert!(report.faulty_worlds > 0);
        assert!(
            report.all_passed(),
            "campaign failed: {:?}",
            report.failures
        );
    }

    #[test]
    fn build_refinement_narrows_to_adjacent_revisions() {
        let config = CampaignConfig {
            refine_with_build: true,
            ..pristine()
        };
        let trace = replay_seed(1, &config).expect("replay should not error");
        assert!(trace.passed(), "violations: {:?}", trace.violations);
        let report = trace.report.expect("pipeline ran");
        for finding in &report.findings {
            let (low, high) = finding.key.endpoints();
            assert_eq!(high, trace.world.regression);
            assert_eq!(low + 1, high);
        }
    }

    #[test]
    fn campaign_report_serializes_to_json() {
        let report = CampaignReport {
            seeds_run: 10,
            seeds_passed: 9,
            first_failure: Some(7),
            failures: vec![SeedFailure {
                seed: 7,
                violations: vec!["Missed: expected 2 findings, got 1".into()],
            }],
            findings: 17,
            faulty_worlds: 4,
        };
        let json = serde_json::to_string(&report).expect("serialize");
        assert!(json.contains("\"seeds_run\":10"));
        assert!(json.contains("\"first_failure\":7"));
    }

    #[test]
    fn violations_read_as_sentences() {
        let v = Violation::WrongBracket {
            test_case: "trigger-000.html".into(),
            found: (10, 14),
            expected: Some((12, 14)),
        };
        let s = v.to_string();
        assert!(s.starts_with("WrongBracket"));
        assert!(s.contains("10..14"));
    }
}
