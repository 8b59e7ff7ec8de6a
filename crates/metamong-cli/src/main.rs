#![forbid(unsafe_code)]

mod cmd;
mod driver;
mod output;
mod provision;

use clap::{Parser, Subcommand};
use output::{CliError, OutputMode, render_error, resolve_output_mode};
use std::env;
use std::process;
use tracing::debug;
use tracing_subscriber::{EnvFilter, fmt, prelude::*};

#[cfg(feature = "mimalloc")]
#[global_allocator]
static GLOBAL: mimalloc::MiMalloc = mimalloc::MiMalloc;

#[derive(Parser, Debug)]
#[command(
    author,
    version,
    about = "metamong: metamorphic rendering-regression hunter",
    long_about = None
)]
struct Cli {
    /// Enable verbose logging.
    #[arg(short, long)]
    verbose: bool,

    /// Emit JSON output instead of human-readable text.
    #[arg(long, global = true)]
    json: bool,

    /// Output format (overrides `--json`, `FORMAT` and the config file).
    #[arg(long, global = true, value_enum)]
    format: Option<OutputMode>,

    #[command(subcommand)]
    command: Commands,
}

impl Cli {
    /// Output mode for reports that precede loading any configuration.
    fn output_mode(&self) -> OutputMode {
        resolve_output_mode(self.format, self.json, None)
    }
}

#[derive(Subcommand, Debug)]
enum Commands {
    #[command(
        about = "Hunt for rendering regressions between two milestones",
        long_about = "Generate metamorphic test cases from seed pages, confirm them across the\n\
                      base and target builds, minimize them and bisect each one to the\n\
                      revision range that introduced it.",
        after_help = "EXAMPLES:\n    # Chrome M86 against M87 with 8 workers\n    metamong run -i seeds -o out -j 8 -p 86 -n 87\n\n\
                      # Firefox, no minimization\n    metamong run -i seeds -o out -t firefox -p 80 -n 81 --skip-minimizer\n\n\
                      # Machine-readable summary\n    metamong run -i seeds -o out -p 86 -n 87 --json"
    )]
    Run(cmd::run::RunArgs),

    #[command(
        about = "Show the revisions a milestone pair resolves to",
        long_about = "Resolve base and target milestones against the build list and report\n\
                      the revision range a run would bisect over.",
        after_help = "EXAMPLES:\n    # Chrome milestones from the default build list\n    metamong revisions -p 86 -n 87\n\n\
                      # Explicit build list\n    metamong revisions -p 86 -n 87 --revisions builds.csv"
    )]
    Revisions(cmd::revisions::RevisionsArgs),

    #[command(
        about = "Deterministic simulation campaigns",
        long_about = "Run the pipeline against simulated browsers to check that every finding\n\
                      is bracketed and minimized correctly.",
        after_help = "EXAMPLES:\n    # Run 50 seeds\n    metamong sim run --seeds 50\n\n\
                      # Replay a failing seed\n    metamong sim replay --seed 7"
    )]
    Sim(cmd::sim::SimArgs),
}

fn init_tracing() {
    let filter = EnvFilter::try_from_env("METAMONG_LOG").unwrap_or_else(|_| {
        EnvFilter::new(if env::var("DEBUG").is_ok() {
            "metamong=debug,info"
        } else {
            "metamong=info,warn"
        })
    });

    let format = env::var("METAMONG_LOG_FORMAT").unwrap_or_else(|_| "compact".to_string());

    let registry = tracing_subscriber::registry().with(filter);

    match format.as_str() {
        "json" => {
            registry
                .with(fmt::layer().json().with_ansi(false).with_writer(std::io::stderr))
                .init();
        }
        _ => {
            registry
                .with(fmt::layer().compact().with_writer(std::io::stderr))
                .init();
        }
    }
}

fn main() {
    init_tracing();

    let cli = Cli::parse();
    if cli.verbose {
        debug!("Verbose mode enabled");
    }

    let result = match &cli.command {
        Commands::Run(args) => cmd::run::run_run(args, cli.format, cli.json),
        Commands::Revisions(args) => cmd::revisions::run_revisions(args, cli.format, cli.json),
        Commands::Sim(args) => cmd::sim::run_sim(args, cli.output_mode()),
    };

    if let Err(err) = result {
        let error = CliError::from_anyhow(&err);
        if render_error(cli.output_mode(), &error).is_err() {
            eprintln!("error: {err:#}");
        }
        process::exit(1);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::CommandFactory;

    #[test]
    fn cli_definition_is_valid() {
        Cli::command().debug_assert();
    }

    #[test]
    fn run_accepts_short_flags() {
        let cli = Cli::parse_from([
            "metamong", "run", "-i", "seeds", "-o", "out", "-j", "8", "-t", "firefox", "-p", "80",
            "-n", "81",
        ]);
        let Commands::Run(args) = cli.command else {
            panic!("expected run");
        };
        assert_eq!(args.jobs, Some(8));
        assert_eq!(args.milestones.browser, cmd::BrowserArg::Firefox);
        assert_eq!((args.milestones.pre, args.milestones.new), (80, 81));
    }

    #[test]
    fn json_flag_after_subcommand() {
        let cli = Cli::parse_from(["metamong", "sim", "run", "--json"]);
        assert!(cli.json);
        assert!(cli.output_mode().is_json());
    }

    #[test]
    fn format_flag_wins_over_json() {
        let cli = Cli::parse_from(["metamong", "--json", "--format", "text", "sim", "replay", "--seed", "3"]);
        assert_eq!(cli.output_mode(), OutputMode::Text);
    }

    #[test]
    fn run_requires_milestones() {
        let err = Cli::try_parse_from(["metamong", "run", "-i", "seeds", "-o", "out"]);
        assert!(err.is_err());
    }

    #[test]
    fn sim_crash_percent_is_bounded() {
        let err = Cli::try_parse_from(["metamong", "sim", "run", "--crash", "150"]);
        assert!(err.is_err());
    }
}
