//! Stage orchestration.
//!
//! A stage runs one [`Role`] over the whole current generation with a pool
//! of workers, waits for all of them, rotates the queue and snapshots the
//! survivors into a directory named after the stage. Stages never overlap.

use std::fmt;
use std::path::{Path, PathBuf};
use std::thread;
use std::time::{Duration, Instant};

use anyhow::{Context, Result};
use metamong_core::config::{MetamongConfig, ReportConfig};
use metamong_core::error::ErrorCode;
use metamong_core::oracle::{BrowserFactory, MutatorFactory};
use metamong_core::provision::{BinaryCache, Provisioning};
use metamong_core::queue::VersionedWorkQueue;
use metamong_core::version::{Revision, RevisionList, VersionKey};
use metamong_core::WorkItem;
use serde::Serialize;
use tracing::{error, info, warn};

use crate::worker::{Role, StageContext, Worker, WorkerConfig, WorkerStats};

const JOIN_POLL: Duration = Duration::from_millis(10);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Stage {
    Generate,
    CrossVersion,
    Minimizer,
    Bisecter,
    BisecterBuild,
    Report,
}

impl Stage {
    /// Output directory name under the run's output root.
    #[must_use]
    pub const fn dir_name(self) -> &'static str {
        match self {
            Self::Generate => "Generate",
            Self::CrossVersion => "CrossVersion",
            Self::Minimizer => "Minimizer",
            Self::Bisecter => "Bisecter",
            Self::BisecterBuild => "BisecterBuild",
            Self::Report => "Report",
        }
    }

    #[must_use]
    pub const fn role(self) -> Role {
        match self {
            Self::Generate => Role::Generate,
            Self::CrossVersion | Self::Report => Role::CrossVersionConfirm,
            Self::Minimizer => Role::Minimize,
            Self::Bisecter => Role::Bisect(Provisioning::Download),
            Self::BisecterBuild => Role::Bisect(Provisioning::Build),
        }
    }
}

impl fmt::Display for Stage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.dir_name())
    }
}

/// Run-level knobs, usually derived from [`MetamongConfig`] plus CLI flags.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PipelineOptions {
    pub base: Revision,
    pub target: Revision,
    pub output_dir: PathBuf,
    pub workers: usize,
    pub worker: WorkerConfig,
    pub skip_minimizer: bool,
    pub skip_bisection: bool,
    pub refine_with_build: bool,
    pub report_pass: bool,
    pub monitor_interval: Duration,
    pub report: ReportConfig,
}

impl PipelineOptions {
    #[must_use]
    pub fn from_config(
        config: &MetamongConfig,
        base: Revision,
        target: Revision,
        output_dir: impl Into<PathBuf>,
    ) -> Self {
        let pipeline = &config.pipeline;
        Self {
            base,
            target,
            output_dir: output_dir.into(),
            workers: pipeline.workers.max(1),
            worker: WorkerConfig {
                iteration_count: pipeline.iteration_count,
                self_check_runs: pipeline.self_check_runs,
                ..WorkerConfig::default()
            },
            skip_minimizer: pipeline.skip_minimizer,
            skip_bisection: pipeline.skip_bisection,
            refine_with_build: pipeline.refine_with_build,
            report_pass: pipeline.report_pass,
            monitor_interval: config.watchdog.monitor_interval(),
            report: config.report.clone(),
        }
    }

    /// Stages that run before the report, in order.
    #[must_use]
    pub fn stages(&self) -> Vec<Stage> {
        let mut stages = vec![Stage::Generate, Stage::CrossVersion];
        if !self.skip_minimizer {
            stages.push(Stage::Minimizer);
        }
        if !self.skip_bisection {
            stages.push(Stage::Bisecter);
            if self.refine_with_build {
                stages.push(Stage::BisecterBuild);
            }
        }
        stages
    }
}

/// What the pipeline borrows from its caller.
#[derive(Clone, Copy)]
pub struct Collaborators<'a> {
    pub cache: &'a BinaryCache,
    pub browsers: &'a dyn BrowserFactory,
    pub mutators: &'a dyn MutatorFactory,
    pub revisions: &'a RevisionList,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct StageReport {
    pub stage: String,
    pub inputs: usize,
    pub outputs: usize,
    pub stats: WorkerStats,
    pub elapsed_secs: f64,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Finding {
    pub key: VersionKey,
    pub test_case: PathBuf,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct PipelineReport {
    pub stages: Vec<StageReport>,
    pub findings: Vec<Finding>,
    pub result_csv: PathBuf,
    pub elapsed_secs: f64,
}

pub struct Pipeline<'a> {
    options: PipelineOptions,
    queue: VersionedWorkQueue,
    with: Collaborators<'a>,
}

impl fmt::Debug for Pipeline<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Pipeline")
            .field("options", &self.options)
            .field("queue", &self.queue)
            .finish_non_exhaustive()
    }
}

impl<'a> Pipeline<'a> {
    #[must_use]
    pub const fn new(
        options: PipelineOptions,
        queue: VersionedWorkQueue,
        with: Collaborators<'a>,
    ) -> Self {
        Self {
            options,
            queue,
            with,
        }
    }

    #[must_use]
    pub const fn queue(&self) -> &VersionedWorkQueue {
        &self.queue
    }

    #[must_use]
    pub const fn options(&self) -> &PipelineOptions {
        &self.options
    }

    /// Fail fast when the endpoints cannot run at all.
    ///
    /// # Errors
    ///
    /// Returns an error if the base or target browser cannot be provisioned,
    /// or bisection is enabled and an endpoint is missing from the revision
    /// list.
    pub fn preflight(&self) -> Result<()> {
        for revision in [self.options.base, self.options.target] {
            self.with
                .cache
                .acquire(revision, Provisioning::Download)
                .with_context(|| {
                    format!(
                        "{}: {} for revision {revision}",
                        ErrorCode::NoBrowserBinary.code(),
                        ErrorCode::NoBrowserBinary.message()
                    )
                })?;
            if !self.options.skip_bisection && self.with.revisions.index_of(revision).is_none() {
                anyhow::bail!(
                    "{}: {} ({revision})",
                    ErrorCode::RevisionOutOfRange.code(),
                    ErrorCode::RevisionOutOfRange.message()
                );
            }
        }
        Ok(())
    }

    /// Seed the queue and run every stage, then the report.
    ///
    /// # Errors
    ///
    /// Returns an error on preflight failure or when a stage snapshot cannot
    /// be written. Per-item failures never abort the run.
    pub fn run(&self, seeds: Vec<WorkItem>) -> Result<PipelineReport> {
        let started = Instant::now();
        self.preflight()?;

        let key = VersionKey::Pair {
            base: self.options.base,
            target: self.options.target,
        };
        let mut accepted = 0;
        for seed in seeds {
            if self.queue.insert(key, seed).context("seeding queue")? {
                accepted += 1;
            }
        }
        info!(seeds = accepted, %key, "pipeline starting");

        let mut stages = Vec::new();
        for stage in self.options.stages() {
            stages.push(self.run_stage(stage, self.options.worker)?);
        }
        stages.push(self.report()?);

        let findings = self
            .queue
            .items()
            .context("reading findings")?
            .into_iter()
            .map(|(key, item)| Finding {
                key,
                test_case: item.test_case,
            })
            .collect();

        Ok(PipelineReport {
            stages,
            findings,
            result_csv: self.stage_dir(Stage::Report).join(metamong_core::persist::RESULT_CSV),
            elapsed_secs: started.elapsed().as_secs_f64(),
        })
    }

    fn stage_dir(&self, stage: Stage) -> PathBuf {
        self.options.output_dir.join(stage.dir_name())
    }

    /// Run one stage and snapshot its output.
    ///
    /// # Errors
    ///
    /// Returns an error if the queue cannot be rotated or snapshotted.
    pub fn run_stage(&self, stage: Stage, config: WorkerConfig) -> Result<StageReport> {
        let started = Instant::now();
        let (inputs, stats) = self.run_workers(stage, config)?;
        self.queue.rotate().context("rotating queue")?;

        let dir = self.stage_dir(stage);
        let outputs = self
            .queue
            .snapshot(&dir)
            .with_context(|| format!("snapshotting {stage}"))?;
        self.queue
            .snapshot_csv(&dir)
            .with_context(|| format!("writing {stage} result table"))?;

        Ok(self.finish(stage, inputs, outputs, stats, started))
    }

    /// Group findings per target revision, re-render them once more with
    /// screenshots, and write the final result table.
    fn report(&self) -> Result<StageReport> {
        let started = Instant::now();
        let dir = self.stage_dir(Stage::Report);
        let report = &self.options.report;
        let grouped = self
            .queue
            .snapshot_grouped(&dir, |key| {
                let (low, high) = key.endpoints();
                format!("{}\n", report.changelog_for(low, high))
            })
            .context("writing report directories")?;

        let (inputs, stats) = if self.options.report_pass {
            let run = self.run_workers(Stage::Report, WorkerConfig::report())?;
            self.queue.rotate().context("rotating queue")?;
            run
        } else {
            (grouped, WorkerStats::default())
        };

        self.queue
            .snapshot_csv(&dir)
            .context("writing report result table")?;
        let outputs = self.queue.pending().context("counting findings")?;
        Ok(self.finish(Stage::Report, inputs, outputs, stats, started))
    }

    fn finish(
        &self,
        stage: Stage,
        inputs: usize,
        outputs: usize,
        stats: WorkerStats,
        started: Instant,
    ) -> StageReport {
        let elapsed = started.elapsed();
        info!(
            %stage,
            inputs,
            outputs,
            dropped = stats.dropped_total(),
            requeued = stats.requeued,
            valid = stats.valid,
            elapsed = %format!("{:.3}s", elapsed.as_secs_f64()),
            dir = %self.stage_dir(stage).display(),
            "stage finished"
        );
        StageReport {
            stage: stage.to_string(),
            inputs,
            outputs,
            stats,
            elapsed_secs: elapsed.as_secs_f64(),
        }
    }

    /// Spawn the worker pool and block until every worker has drained the
    /// queue, sweeping the watchdog while waiting.
    fn run_workers(&self, stage: Stage, config: WorkerConfig) -> Result<(usize, WorkerStats)> {
        let inputs = self.queue.pending().context("counting stage inputs")?;
        let role = stage.role();
        let ctx = StageContext {
            queue: &self.queue,
            cache: self.with.cache,
            factory: self.with.browsers,
            revisions: self.with.revisions,
        };
        info!(%stage, %role, inputs, workers = self.options.workers, "stage starting");

        let stats = thread::scope(|scope| {
            let handles: Vec<_> = (0..self.options.workers.max(1))
                .map(|id| {
                    let mutator = self.with.mutators.create(id);
                    scope.spawn(move || Worker::new(id, role, config, ctx, mutator).run())
                })
                .collect();

            let mut last_sweep = Instant::now();
            while !handles.iter().all(thread::ScopedJoinHandle::is_finished) {
                thread::sleep(JOIN_POLL);
                if last_sweep.elapsed() >= self.options.monitor_interval {
                    let killed = self.queue.monitor();
                    if killed > 0 {
                        warn!(%stage, killed, "watchdog killed hung browsers");
                    }
                    last_sweep = Instant::now();
                }
            }

            let mut total = WorkerStats::default();
            for handle in handles {
                match handle.join() {
                    Ok(stats) => total.merge(&stats),
                    Err(_) => error!(%stage, "worker thread panicked"),
                }
            }
            total
        });

        Ok((inputs, stats))
    }
}

/// Load and seed a run from an input directory.
///
/// # Errors
///
/// Returns an error if the input directory cannot be walked.
pub fn discover(input_dir: &Path) -> Result<Vec<WorkItem>> {
    anyhow::ensure!(
        input_dir.is_dir(),
        "{}: {} ({})",
        ErrorCode::InputNotFound.code(),
        ErrorCode::InputNotFound.message(),
        input_dir.display()
    );
    metamong_core::item::discover_seeds(input_dir)
        .with_context(|| format!("reading seeds under {}", input_dir.display()))
}
