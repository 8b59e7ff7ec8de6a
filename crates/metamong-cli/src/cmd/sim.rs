//! `metamong sim`: deterministic simulation campaign commands.
//!
//! `metamong sim run`: drive the pipeline over many simulated worlds.
//! `metamong sim replay`: replay a single seed with detailed trace output.

use std::process;

use anyhow::Result;
use clap::{Args, Subcommand};
use metamong_sim::campaign::{replay_seed, run_campaign};
use metamong_sim::{CampaignConfig, WorldConfig};
use serde::Serialize;

use crate::output::{OutputMode, pretty_kv, pretty_section};

/// Top-level arguments for `metamong sim`.
#[derive(Args, Debug)]
pub struct SimArgs {
    #[command(subcommand)]
    pub command: SimCommand,
}

/// Simulation subcommands.
#[derive(Subcommand, Debug)]
pub enum SimCommand {
    /// Run a campaign across multiple seeds.
    #[command(
        about = "Run a simulation campaign across multiple seeds",
        long_about = "Run the full pipeline against simulated browsers whose revision history\n\
                      hides one regression among crashing, hanging and unpublished builds.\n\
                      Every finding is checked against the planted regression.",
        after_help = "EXAMPLES:\n    # Run 50 seeds with defaults\n    metamong sim run --seeds 50\n\n\
                      # Hostile revision history\n    metamong sim run --seeds 20 --crash 25 --hang 10 --missing 10\n\n\
                      # Machine-readable output\n    metamong sim run --seeds 50 --format json"
    )]
    Run(SimRunArgs),

    /// Replay a single seed with full trace.
    #[command(
        about = "Replay a single seed with detailed trace output",
        long_about = "Replay a specific seed to see its world, every stage's counters,\n\
                      the findings and any violated property. Use after a campaign failure.",
        after_help = "EXAMPLES:\n    # Replay seed 42\n    metamong sim replay --seed 42\n\n\
                      # Replay with the parameters of the failing campaign\n    metamong sim replay --seed 42 --crash 25 --hang 10\n\n\
                      # Machine-readable output\n    metamong sim replay --seed 42 --format json"
    )]
    Replay(SimReplayArgs),
}

/// World and pipeline knobs shared by `run` and `replay`.
#[derive(Args, Debug, Clone)]
pub struct WorldArgs {
    /// Length of the simulated download revision list.
    #[arg(long, default_value = "24")]
    pub revisions: usize,

    /// Percent of interior revisions that fail to start.
    #[arg(long = "crash", default_value = "8", value_parser = clap::value_parser!(u8).range(0..=100))]
    pub crash_percent: u8,

    /// Percent of interior revisions that hang until killed.
    #[arg(long = "hang", default_value = "4", value_parser = clap::value_parser!(u8).range(0..=100))]
    pub hang_percent: u8,

    /// Percent of interior revisions with no published binary.
    #[arg(long = "missing", default_value = "4", value_parser = clap::value_parser!(u8).range(0..=100))]
    pub missing_percent: u8,

    /// Seed pages that exhibit the regression.
    #[arg(long, default_value = "2")]
    pub trigger_pages: usize,

    /// Pipeline worker threads.
    #[arg(long, default_value = "2")]
    pub workers: usize,

    /// Refine each bracket with a build bisection over every revision.
    #[arg(long)]
    pub refine_with_build: bool,
}

/// Arguments for `metamong sim run`.
#[derive(Args, Debug)]
pub struct SimRunArgs {
    /// Number of seeds to run.
    #[arg(long, default_value = "20")]
    pub seeds: u64,

    /// Starting seed value.
    #[arg(long, default_value = "0")]
    pub seed_start: u64,

    #[command(flatten)]
    pub world: WorldArgs,
}

/// Arguments for `metamong sim replay`.
#[derive(Args, Debug)]
pub struct SimReplayArgs {
    /// Seed to replay.
    #[arg(long)]
    pub seed: u64,

    #[command(flatten)]
    pub world: WorldArgs,
}

/// JSON output for `metamong sim run`.
#[derive(Debug, Serialize)]
struct RunOutput {
    seeds_run: usize,
    seeds_passed: usize,
    seeds_failed: usize,
    first_failure: Option<u64>,
    findings: usize,
    faulty_worlds: usize,
    all_passed: bool,
    failures: Vec<FailureOutput>,
}

#[derive(Debug, Serialize)]
struct FailureOutput {
    seed: u64,
    violations: Vec<String>,
}

/// JSON output for `metamong sim replay`.
#[derive(Debug, Serialize)]
struct ReplayOutput {
    seed: u64,
    revisions: usize,
    regression: u64,
    crashing: Vec<u64>,
    hanging: Vec<u64>,
    unpublished: Vec<u64>,
    provisioned: usize,
    stages: Vec<StageOutput>,
    findings: Vec<String>,
    passed: bool,
    violations: Vec<String>,
}

#[derive(Debug, Serialize)]
struct StageOutput {
    stage: String,
    inputs: usize,
    outputs: usize,
    dropped: usize,
}

fn build_campaign_config(seed_start: u64, seeds: u64, world: &WorldArgs) -> CampaignConfig {
    CampaignConfig {
        seed_range: seed_start..seed_start.saturating_add(seeds),
        world: WorldConfig {
            revision_count: world.revisions,
            crash_percent: world.crash_percent,
            hang_percent: world.hang_percent,
            missing_percent: world.missing_percent,
            ..WorldConfig::default()
        },
        trigger_pages: world.trigger_pages,
        workers: world.workers,
        refine_with_build: world.refine_with_build,
        ..CampaignConfig::default()
    }
}

fn fault_summary(world: &WorldArgs) -> String {
    format!(
        "crash={}% hang={}% missing={}%",
        world.crash_percent, world.hang_percent, world.missing_percent
    )
}

/// Execute `metamong sim run`.
pub fn run_sim_run(args: &SimRunArgs, output: OutputMode) -> Result<()> {
    let config = build_campaign_config(args.seed_start, args.seeds, &args.world);
    let report = run_campaign(&config)?;

    let out = RunOutput {
        seeds_run: report.seeds_run,
        seeds_passed: report.seeds_passed,
        seeds_failed: report.failures.len(),
        first_failure: report.first_failure,
        findings: report.findings,
        faulty_worlds: report.faulty_worlds,
        all_passed: report.all_passed(),
        failures: report
            .failures
            .iter()
            .map(|f| FailureOutput {
                seed: f.seed,
                violations: f.violations.clone(),
            })
            .collect(),
    };

    match output {
        OutputMode::Json => {
            println!("{}", serde_json::to_string_pretty(&out)?);
        }
        OutputMode::Text => {
            println!(
                "campaign seeds_run={} revisions={} {}",
                out.seeds_run,
                args.world.revisions,
                fault_summary(&args.world)
            );
            println!(
                "results passed={} failed={} findings={} faulty_worlds={} all_passed={}",
                out.seeds_passed, out.seeds_failed, out.findings, out.faulty_worlds, out.all_passed
            );
            if !out.all_passed {
                for failure in out.failures.iter().take(5) {
                    println!(
                        "failure seed={} violations={}",
                        failure.seed,
                        failure.violations.len()
                    );
                }
                if out.failures.len() > 5 {
                    println!("failures_truncated count={}", out.failures.len() - 5);
                }
                println!("hint replay_seed={}", out.first_failure.unwrap_or(0));
            }
        }
        OutputMode::Pretty => {
            let stdout = std::io::stdout();
            let mut w = stdout.lock();
            pretty_section(&mut w, "Simulation Campaign")?;
            pretty_kv(&mut w, "Seeds", out.seeds_run.to_string())?;
            pretty_kv(&mut w, "Revisions", args.world.revisions.to_string())?;
            pretty_kv(&mut w, "Faults", fault_summary(&args.world))?;
            pretty_kv(
                &mut w,
                "Results",
                format!(
                    "{} passed / {} failed ({} findings, {} faulty worlds)",
                    out.seeds_passed, out.seeds_failed, out.findings, out.faulty_worlds
                ),
            )?;

            if out.all_passed {
                pretty_kv(&mut w, "Status", "all seeds passed")?;
            } else {
                pretty_kv(
                    &mut w,
                    "Status",
                    format!(
                        "{} failures (first at seed {})",
                        out.seeds_failed,
                        out.first_failure.unwrap_or(0)
                    ),
                )?;
                println!();
                pretty_section(&mut w, "Failure Samples")?;
                for failure in out.failures.iter().take(5) {
                    println!("seed {:<8} violations={}", failure.seed, failure.violations.len());
                    for violation in &failure.violations {
                        println!("  - {violation}");
                    }
                }
                if out.failures.len() > 5 {
                    println!("... and {} more failures", out.failures.len() - 5);
                }
                println!();
                pretty_kv(
                    &mut w,
                    "Replay",
                    format!("metamong sim replay --seed {}", out.first_failure.unwrap_or(0)),
                )?;
            }
        }
    }

    // Exit code 1 on any failure for CI integration
    if !report.all_passed() {
        process::exit(1);
    }

    Ok(())
}

/// Execute `metamong sim replay`.
pub fn run_sim_replay(args: &SimReplayArgs, output: OutputMode) -> Result<()> {
    let config = build_campaign_config(args.seed, 1, &args.world);
    let trace = replay_seed(args.seed, &config)?;

    let world = &trace.world;
    let out = ReplayOutput {
        seed: args.seed,
        revisions: world.revisions.len(),
        regression: world.regression,
        crashing: world.crashing.iter().copied().collect(),
        hanging: world.hanging.iter().copied().collect(),
        unpublished: world.unpublished.iter().copied().collect(),
        provisioned: trace.provisioned,
        stages: trace
            .report
            .iter()
            .flat_map(|r| &r.stages)
            .map(|s| StageOutput {
                stage: s.stage.clone(),
                inputs: s.inputs,
                outputs: s.outputs,
                dropped: s.stats.dropped_total(),
            })
            .collect(),
        findings: trace
            .report
            .iter()
            .flat_map(|r| &r.findings)
            .map(|f| format!("{} {}", f.key, f.test_case.display()))
            .collect(),
        passed: trace.passed(),
        violations: trace.violations.iter().map(ToString::to_string).collect(),
    };

    match output {
        OutputMode::Json => {
            println!("{}", serde_json::to_string_pretty(&out)?);
        }
        OutputMode::Text => {
            println!(
                "replay seed={} revisions={} regression={} {}",
                out.seed,
                out.revisions,
                out.regression,
                fault_summary(&args.world)
            );
            println!(
                "world crashing={} hanging={} unpublished={} provisioned={}",
                out.crashing.len(),
                out.hanging.len(),
                out.unpublished.len(),
                out.provisioned
            );
            for stage in &out.stages {
                println!(
                    "stage name={} inputs={} outputs={} dropped={}",
                    stage.stage, stage.inputs, stage.outputs, stage.dropped
                );
            }
            for finding in &out.findings {
                println!("finding {finding}");
            }
            println!("result passed={}", out.passed);
            for violation in &out.violations {
                println!("violation={violation}");
            }
        }
        OutputMode::Pretty => {
            let stdout = std::io::stdout();
            let mut w = stdout.lock();
            pretty_section(&mut w, &format!("Replay Seed {}", out.seed))?;
            pretty_kv(&mut w, "Revisions", out.revisions.to_string())?;
            pretty_kv(&mut w, "Regression", out.regression.to_string())?;
            pretty_kv(&mut w, "Crashing", format!("{:?}", out.crashing))?;
            pretty_kv(&mut w, "Hanging", format!("{:?}", out.hanging))?;
            pretty_kv(&mut w, "Unpublished", format!("{:?}", out.unpublished))?;
            pretty_kv(&mut w, "Provisioned", out.provisioned.to_string())?;
            pretty_kv(&mut w, "Passed", out.passed.to_string())?;

            println!();
            pretty_section(&mut w, "Stages")?;
            for stage in &out.stages {
                println!(
                    "{:<12} in={:<4} out={:<4} dropped={}",
                    stage.stage, stage.inputs, stage.outputs, stage.dropped
                );
            }

            if !out.findings.is_empty() {
                println!();
                pretty_section(&mut w, "Findings")?;
                for finding in &out.findings {
                    println!("- {finding}");
                }
            }

            if !out.passed {
                println!();
                pretty_section(&mut w, "Violations")?;
                for violation in &out.violations {
                    println!("- {violation}");
                }
            }
        }
    }

    if !trace.passed() {
        process::exit(1);
    }

    Ok(())
}

/// Dispatch `metamong sim` subcommands.
pub fn run_sim(args: &SimArgs, output: OutputMode) -> Result<()> {
    match &args.command {
        SimCommand::Run(run_args) => run_sim_run(run_args, output),
        SimCommand::Replay(replay_args) => run_sim_replay(replay_args, output),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn world() -> WorldArgs {
        WorldArgs {
            revisions: 12,
            crash_percent: 10,
            hang_percent: 0,
            missing_percent: 5,
            trigger_pages: 3,
            workers: 4,
            refine_with_build: true,
        }
    }

    #[test]
    fn campaign_config_carries_world_args() {
        let config = build_campaign_config(5, 10, &world());
        assert_eq!(config.seed_range, 5..15);
        assert_eq!(config.world.revision_count, 12);
        assert_eq!(config.world.missing_percent, 5);
        assert_eq!(config.trigger_pages, 3);
        assert_eq!(config.workers, 4);
        assert!(config.refine_with_build);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn seed_range_saturates() {
        let config = build_campaign_config(u64::MAX, 10, &world());
        assert!(config.seed_range.is_empty());
    }

    #[test]
    fn fault_summary_lists_percents() {
        assert_eq!(fault_summary(&world()), "crash=10% hang=0% missing=5%");
    }
}
