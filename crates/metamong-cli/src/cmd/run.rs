//! `metamong run`: hunt for rendering regressions between two milestones.

use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::Args;
use metamong_core::config::{MetamongConfig, resolve_config};
use metamong_core::error::ErrorCode;
use metamong_core::lock::RunLock;
use metamong_core::provision::BinaryCache;
use metamong_core::queue::QueueConfig;
use metamong_core::version::{BrowserKind, Revision, VersionManager};
use metamong_core::watchdog::Watchdog;
use metamong_core::VersionedWorkQueue;
use metamong_pipeline::stage::discover;
use metamong_pipeline::{
    Collaborators, MetaMutatorFactory, Pipeline, PipelineOptions, PipelineReport,
};
use serde::Serialize;
use tracing::info;

use super::{MilestoneArgs, coded, version_error};
use crate::driver::DriverFactory;
use crate::output::{OutputMode, pretty_kv, pretty_section, render_mode, resolve_output_mode};
use crate::provision::CommandProvisioner;

#[derive(Args, Debug)]
pub struct RunArgs {
    /// Directory of seed test cases (`*.html`, optional `*.js` sidecars).
    #[arg(short = 'i', long = "input")]
    pub input: PathBuf,

    /// Directory receiving per-stage snapshots and `result.csv`.
    #[arg(short = 'o', long = "output")]
    pub output: PathBuf,

    /// Worker threads per stage (overrides `pipeline.workers`).
    #[arg(short = 'j', long = "jobs")]
    pub jobs: Option<usize>,

    #[command(flatten)]
    pub milestones: MilestoneArgs,

    /// Configuration file (default: `<input>/metamong.toml`, then the user config).
    #[arg(long, value_name = "FILE")]
    pub config: Option<PathBuf>,

    /// Skip the delta-debugging minimizer stage.
    #[arg(long)]
    pub skip_minimizer: bool,

    /// Skip bisection; findings keep their base/target pair.
    #[arg(long)]
    pub skip_bisection: bool,

    /// Refine download brackets with a build bisection over every revision.
    #[arg(long)]
    pub refine_with_build: bool,

    /// Do not re-render findings into the Report directory.
    #[arg(long)]
    pub no_report_pass: bool,

    /// Seed for mutation generation and queue key selection.
    #[arg(long)]
    pub seed: Option<u64>,
}

impl RunArgs {
    /// Fold command-line overrides into the loaded configuration.
    fn apply(&self, config: &mut MetamongConfig) {
        let pipeline = &mut config.pipeline;
        if let Some(jobs) = self.jobs {
            pipeline.workers = jobs;
        }
        if let Some(seed) = self.seed {
            pipeline.seed = seed;
        }
        pipeline.skip_minimizer |= self.skip_minimizer;
        pipeline.skip_bisection |= self.skip_bisection;
        pipeline.refine_with_build |= self.refine_with_build;
        pipeline.report_pass &= !self.no_report_pass;
    }
}

/// Milestones resolved against the build list.
#[derive(Debug)]
struct Plan {
    browser: BrowserKind,
    base: Revision,
    target: Revision,
    revisions: metamong_core::RevisionList,
}

fn plan(args: &MilestoneArgs, browser_dir: &Path) -> Result<Plan> {
    let browser = BrowserKind::from(args.browser);
    let versions = VersionManager::new(browser, args.load_builds(browser_dir)?);
    let base = versions.revision(args.pre).map_err(version_error)?;
    let target = versions.revision(args.new).map_err(version_error)?;
    let revisions = versions
        .revision_range(args.pre, args.new)
        .map_err(version_error)?;
    Ok(Plan {
        browser,
        base,
        target,
        revisions,
    })
}

#[derive(Debug, Serialize)]
struct StageRow {
    stage: String,
    inputs: usize,
    outputs: usize,
    dropped: usize,
    elapsed_secs: f64,
}

#[derive(Debug, Serialize)]
struct FindingRow {
    base: Revision,
    target: Revision,
    reference: Revision,
    file: PathBuf,
}

/// Summary printed when a run completes.
#[derive(Debug, Serialize)]
struct RunSummary {
    browser: BrowserKind,
    base: Revision,
    target: Revision,
    revisions: usize,
    seeds: usize,
    stages: Vec<StageRow>,
    findings: Vec<FindingRow>,
    result_csv: PathBuf,
    elapsed_secs: f64,
}

impl RunSummary {
    fn new(plan: &Plan, seeds: usize, report: &PipelineReport) -> Self {
        Self {
            browser: plan.browser,
            base: plan.base,
            target: plan.target,
            revisions: plan.revisions.len(),
            seeds,
            stages: report
                .stages
                .iter()
                .map(|s| StageRow {
                    stage: s.stage.clone(),
                    inputs: s.inputs,
                    outputs: s.outputs,
                    dropped: s.stats.dropped_total(),
                    elapsed_secs: s.elapsed_secs,
                })
                .collect(),
            findings: report
                .findings
                .iter()
                .map(|f| {
                    let (base, target, reference) = f.key.csv_columns();
                    FindingRow {
                        base,
                        target,
                        reference,
                        file: f.test_case.clone(),
                    }
                })
                .collect(),
            result_csv: report.result_csv.clone(),
            elapsed_secs: report.elapsed_secs,
        }
    }
}

fn write_text(summary: &RunSummary, w: &mut dyn Write) -> std::io::Result<()> {
    writeln!(
        w,
        "run browser={} base={} target={} revisions={} seeds={}",
        summary.browser, summary.base, summary.target, summary.revisions, summary.seeds
    )?;
    for stage in &summary.stages {
        writeln!(
            w,
            "stage name={} inputs={} outputs={} dropped={} elapsed_secs={:.1}",
            stage.stage, stage.inputs, stage.outputs, stage.dropped, stage.elapsed_secs
        )?;
    }
    for finding in &summary.findings {
        writeln!(
            w,
            "finding base={} target={} ref={} file={}",
            finding.base,
            finding.target,
            finding.reference,
            finding.file.display()
        )?;
    }
    writeln!(
        w,
        "result findings={} csv={} elapsed_secs={:.1}",
        summary.findings.len(),
        summary.result_csv.display(),
        summary.elapsed_secs
    )
}

fn write_pretty(summary: &RunSummary, w: &mut dyn Write) -> std::io::Result<()> {
    pretty_section(w, "Metamong Run")?;
    pretty_kv(w, "Browser", summary.browser.as_str())?;
    pretty_kv(w, "Base", summary.base.to_string())?;
    pretty_kv(w, "Target", summary.target.to_string())?;
    pretty_kv(w, "Revisions", summary.revisions.to_string())?;
    pretty_kv(w, "Seeds", summary.seeds.to_string())?;
    writeln!(w)?;

    pretty_section(w, "Stages")?;
    writeln!(w, "{:<14} {:>8} {:>8} {:>8} {:>10}", "stage", "in", "out", "dropped", "elapsed")?;
    for stage in &summary.stages {
        writeln!(
            w,
            "{:<14} {:>8} {:>8} {:>8} {:>9.1}s",
            stage.stage, stage.inputs, stage.outputs, stage.dropped, stage.elapsed_secs
        )?;
    }
    writeln!(w)?;

    pretty_section(w, "Findings")?;
    if summary.findings.is_empty() {
        writeln!(w, "none")?;
    }
    for finding in &summary.findings {
        writeln!(
            w,
            "{}..{} (ref {})  {}",
            finding.base,
            finding.target,
            finding.reference,
            finding.file.display()
        )?;
    }
    writeln!(w)?;
    pretty_kv(w, "Results", summary.result_csv.display().to_string())?;
    pretty_kv(w, "Elapsed", format!("{:.1}s", summary.elapsed_secs))
}

/// Execute `metamong run`.
pub fn run_run(args: &RunArgs, format: Option<OutputMode>, json: bool) -> Result<()> {
    let seeds = discover(&args.input)?;

    let mut config = resolve_config(args.config.as_deref(), &args.input)
        .with_context(|| coded(ErrorCode::ConfigParseError, args.input.display()))?;
    args.apply(&mut config);
    let output = resolve_output_mode(format, json, config.output.clone());

    let plan = plan(&args.milestones, &config.provisioning.browser_dir)?;
    info!(
        browser = %plan.browser,
        base = plan.base,
        target = plan.target,
        revisions = plan.revisions.len(),
        seeds = seeds.len(),
        "resolved milestones"
    );

    let lock = RunLock::acquire(&args.output)?;

    let provisioner = CommandProvisioner::new(&config.provisioning, plan.browser);
    info!(browser_dir = %provisioner.browser_dir().display(), "provisioning browsers");
    let cache = BinaryCache::new(
        Arc::new(provisioner),
        config.provisioning.download_concurrency,
    );
    let browsers = DriverFactory::new(config.driver.clone(), plan.browser);
    let mutators = MetaMutatorFactory::new(config.pipeline.seed);
    let queue = VersionedWorkQueue::new(
        QueueConfig::from_section(&config.queue, config.pipeline.seed),
        Watchdog::new(config.watchdog.deadline()),
    );

    let options = PipelineOptions::from_config(&config, plan.base, plan.target, &args.output);
    let pipeline = Pipeline::new(
        options,
        queue,
        Collaborators {
            cache: &cache,
            browsers: &browsers,
            mutators: &mutators,
            revisions: &plan.revisions,
        },
    );
    let seed_count = seeds.len();
    let report = pipeline.run(seeds)?;
    lock.release();

    let summary = RunSummary::new(&plan, seed_count, &report);
    render_mode(output, &summary, write_text, write_pretty)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cmd::BrowserArg;
    use metamong_core::VersionKey;
    use metamong_pipeline::stage::{Finding, StageReport};
    use metamong_pipeline::WorkerStats;
    use std::fs;

    fn run_args(extra: &[&str]) -> RunArgs {
        use clap::Parser;

        #[derive(Parser)]
        struct Harness {
            #[command(flatten)]
            run: RunArgs,
        }

        let mut argv = vec!["run", "-i", "in", "-o", "out", "-p", "86", "-n", "87"];
        argv.extend_from_slice(extra);
        Harness::parse_from(argv).run
    }

    #[test]
    fn flags_override_config() {
        let args = run_args(&["-j", "7", "--skip-minimizer", "--no-report-pass", "--seed", "9"]);
        let mut config = MetamongConfig::default();
        args.apply(&mut config);
        assert_eq!(config.pipeline.workers, 7);
        assert_eq!(config.pipeline.seed, 9);
        assert!(config.pipeline.skip_minimizer);
        assert!(!config.pipeline.skip_bisection);
        assert!(!config.pipeline.report_pass);
    }

    #[test]
    fn absent_flags_keep_config() {
        let args = run_args(&[]);
        let mut config = MetamongConfig::default();
        config.pipeline.workers = 3;
        config.pipeline.skip_bisection = true;
        args.apply(&mut config);
        assert_eq!(config.pipeline.workers, 3);
        assert!(config.pipeline.skip_bisection);
        assert!(config.pipeline.report_pass);
        assert_eq!(args.milestones.browser, BrowserArg::Chrome);
    }

    #[test]
    fn plan_resolves_chrome_milestones() {
        let dir = tempfile::tempdir().unwrap();
        let list = dir.path().join("builds.csv");
        fs::write(&list, "782000, 790000, 795000, 800000, 805000").unwrap();
        let args = MilestoneArgs {
            browser: BrowserArg::Chrome,
            pre: 86,
            new: 87,
            revisions: Some(list),
        };
        let plan = plan(&args, dir.path()).unwrap();
        assert_eq!((plan.base, plan.target), (782_000, 800_000));
        assert_eq!(plan.revisions.len(), 4);
    }

    #[test]
    fn unknown_milestone_is_coded() {
        let dir = tempfile::tempdir().unwrap();
        let list = dir.path().join("builds.csv");
        fs::write(&list, "782000, 800000").unwrap();
        let args = MilestoneArgs {
            browser: BrowserArg::Chrome,
            pre: 1,
            new: 87,
            revisions: Some(list),
        };
        let err = plan(&args, dir.path()).unwrap_err();
        assert_eq!(
            ErrorCode::find_in(&format!("{err:#}")),
            Some(ErrorCode::UnknownMilestone)
        );
    }

    #[test]
    fn summary_lists_stages_and_findings() {
        let plan = Plan {
            browser: BrowserKind::Chrome,
            base: 10,
            target: 20,
            revisions: metamong_core::RevisionList::dense(10, 20),
        };
        let report = PipelineReport {
            stages: vec![StageReport {
                stage: "Generate".into(),
                inputs: 4,
                outputs: 1,
                stats: WorkerStats::default(),
                elapsed_secs: 2.5,
            }],
            findings: vec![Finding {
                key: VersionKey::Bracket {
                    low: 14,
                    high: 15,
                    reference: 20,
                },
                test_case: PathBuf::from("out/Report/a.html"),
            }],
            result_csv: PathBuf::from("out/result.csv"),
            elapsed_secs: 3.0,
        };
        let summary = RunSummary::new(&plan, 4, &report);
        assert_eq!(summary.revisions, 11);

        let mut buf = Vec::new();
        write_text(&summary, &mut buf).unwrap();
        let text = String::from_utf8(buf).unwrap();
        assert!(text.contains("stage name=Generate inputs=4 outputs=1 dropped=0"));
        assert!(text.contains("finding base=14 target=15 ref=20 file=out/Report/a.html"));

        let mut buf = Vec::new();
        write_pretty(&summary, &mut buf).unwrap();
        assert!(String::from_utf8(buf).unwrap().contains("14..15 (ref 20)"));
    }
}
