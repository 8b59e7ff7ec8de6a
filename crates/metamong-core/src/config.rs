use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::env;
use std::io::IsTerminal;
use std::path::{Path, PathBuf};
use std::time::Duration;

/// File name looked up inside the input directory.
pub const PROJECT_FILE: &str = "metamong.toml";

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct MetamongConfig {
    #[serde(default)]
    pub pipeline: PipelineConfig,
    #[serde(default)]
    pub queue: QueueSection,
    #[serde(default)]
    pub watchdog: WatchdogConfig,
    #[serde(default)]
    pub provisioning: ProvisioningConfig,
    #[serde(default)]
    pub driver: DriverConfig,
    #[serde(default)]
    pub report: ReportConfig,
    #[serde(default)]
    pub output: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PipelineConfig {
    #[serde(default = "default_workers")]
    pub workers: usize,
    #[serde(default = "default_iteration_count")]
    pub iteration_count: usize,
    #[serde(default = "default_self_check_runs")]
    pub self_check_runs: usize,
    #[serde(default)]
    pub skip_minimizer: bool,
    #[serde(default)]
    pub skip_bisection: bool,
    #[serde(default)]
    pub refine_with_build: bool,
    #[serde(default = "default_true")]
    pub report_pass: bool,
    #[serde(default)]
    pub seed: u64,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            workers: default_workers(),
            iteration_count: default_iteration_count(),
            self_check_runs: default_self_check_runs(),
            skip_minimizer: false,
            skip_bisection: false,
            refine_with_build: false,
            report_pass: default_true(),
            seed: 0,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct QueueSection {
    #[serde(default = "default_limit")]
    pub limit: usize,
    #[serde(default = "default_true")]
    pub enforce_limit: bool,
    #[serde(default = "default_lock_timeout_ms")]
    pub lock_timeout_ms: u64,
}

impl Default for QueueSection {
    fn default() -> Self {
        Self {
            limit: default_limit(),
            enforce_limit: default_true(),
            lock_timeout_ms: default_lock_timeout_ms(),
        }
    }
}

impl QueueSection {
    #[must_use]
    pub const fn lock_timeout(&self) -> Duration {
        Duration::from_millis(self.lock_timeout_ms)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WatchdogConfig {
    #[serde(default = "default_deadline_secs")]
    pub deadline_secs: u64,
    #[serde(default = "default_monitor_interval_secs")]
    pub monitor_interval_secs: u64,
}

impl Default for WatchdogConfig {
    fn default() -> Self {
        Self {
            deadline_secs: default_deadline_secs(),
            monitor_interval_secs: default_monitor_interval_secs(),
        }
    }
}

impl WatchdogConfig {
    #[must_use]
    pub const fn deadline(&self) -> Duration {
        Duration::from_secs(self.deadline_secs)
    }

    #[must_use]
    pub const fn monitor_interval(&self) -> Duration {
        Duration::from_secs(self.monitor_interval_secs)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProvisioningConfig {
    #[serde(default = "default_browser_dir")]
    pub browser_dir: PathBuf,
    #[serde(default = "default_download_concurrency")]
    pub download_concurrency: usize,
    /// Shell template run to download a revision; `{revision}` is substituted.
    #[serde(default)]
    pub fetch_command: Option<String>,
    /// Shell template run to build a revision from source.
    #[serde(default)]
    pub build_command: Option<String>,
}

impl Default for ProvisioningConfig {
    fn default() -> Self {
        Self {
            browser_dir: default_browser_dir(),
            download_concurrency: default_download_concurrency(),
            fetch_command: None,
            build_command: None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DriverConfig {
    #[serde(default = "default_driver_command")]
    pub command: String,
    #[serde(default)]
    pub args: Vec<String>,
}

impl Default for DriverConfig {
    fn default() -> Self {
        Self {
            command: default_driver_command(),
            args: Vec::new(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReportConfig {
    /// Template with `{low}` and `{high}` placeholders.
    #[serde(default = "default_changelog_url")]
    pub changelog_url: String,
}

impl Default for ReportConfig {
    fn default() -> Self {
        Self {
            changelog_url: default_changelog_url(),
        }
    }
}

impl ReportConfig {
    #[must_use]
    pub fn changelog_for(&self, low: u64, high: u64) -> String {
        self.changelog_url
            .replace("{low}", &low.to_string())
            .replace("{high}", &high.to_string())
    }
}

fn load_file(path: &Path) -> Result<MetamongConfig> {
    let content = std::fs::read_to_string(path)
        .with_context(|| format!("Failed to read {}", path.display()))?;

    toml::from_str::<MetamongConfig>(&content)
        .with_context(|| format!("Failed to parse {}", path.display()))
}

/// Find the configuration file to use, if any.
///
/// An explicit path must exist; the input-directory and user-level files are
/// optional.
pub fn locate_config(explicit: Option<&Path>, input_dir: &Path) -> Result<Option<PathBuf>> {
    if let Some(path) = explicit {
        anyhow::ensure!(path.exists(), "config file {} not found", path.display());
        return Ok(Some(path.to_path_buf()));
    }

    let project = input_dir.join(PROJECT_FILE);
    if project.exists() {
        return Ok(Some(project));
    }

    Ok(dirs::config_dir()
        .map(|dir| dir.join("metamong/config.toml"))
        .filter(|path| path.exists()))
}

/// Load the effective configuration for a run rooted at `input_dir`.
pub fn resolve_config(explicit: Option<&Path>, input_dir: &Path) -> Result<MetamongConfig> {
    let mut config = match locate_config(explicit, input_dir)? {
        Some(path) => load_file(&path)?,
        None => MetamongConfig::default(),
    };

    if let Some(limit) = env_limit(env::var("METAMONG_LIMIT").ok())? {
        config.queue.limit = limit;
    }

    Ok(config)
}

fn env_limit(raw: Option<String>) -> Result<Option<usize>> {
    raw.map(|value| {
        value
            .trim()
            .parse::<usize>()
            .with_context(|| format!("METAMONG_LIMIT must be an integer, got {value:?}"))
    })
    .transpose()
}

/// Decide between `pretty`, `text` and `json` summary output.
pub fn resolve_output(
    cli_json: bool,
    config_output: Option<String>,
    env_format: Option<String>,
) -> String {
    fn normalize_output_mode(raw: &str) -> Option<&'static str> {
        match raw.trim().to_ascii_lowercase().as_str() {
            "pretty" | "table" => Some("pretty"),
            "text" | "plain" => Some("text"),
            "json" => Some("json"),
            _ => None,
        }
    }

    if cli_json {
        return "json".to_string();
    }

    if let Some(mode) = env_format.as_deref().and_then(normalize_output_mode) {
        return mode.to_string();
    }

    if let Some(mode) = config_output.as_deref().and_then(normalize_output_mode) {
        return mode.to_string();
    }

    if std::io::stdout().is_terminal() {
        "pretty".to_string()
    } else {
        "text".to_string()
    }
}

const fn default_true() -> bool {
    true
}

fn default_workers() -> usize {
    std::thread::available_parallelism().map_or(4, std::num::NonZeroUsize::get)
}

const fn default_iteration_count() -> usize {
    4
}

const fn default_self_check_runs() -> usize {
    1
}

const fn default_limit() -> usize {
    100_000
}

const fn default_lock_timeout_ms() -> u64 {
    5_000
}

const fn default_deadline_secs() -> u64 {
    60
}

const fn default_monitor_interval_secs() -> u64 {
    1
}

fn default_browser_dir() -> PathBuf {
    PathBuf::from("browsers")
}

const fn default_download_concurrency() -> usize {
    8
}

fn default_driver_command() -> String {
    "metamong-driver".to_string()
}

fn default_changelog_url() -> String {
    "https://chromium.googlesource.com/chromium/src/+log/{low}..{high}".to_string()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn missing_config_uses_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let path = locate_config(None, dir.path()).unwrap();
        let cfg = path.map_or_else(MetamongConfig::default, |p| load_file(&p).unwrap());
        assert_eq!(cfg.pipeline.iteration_count, 4);
        assert_eq!(cfg.pipeline.self_check_runs, 1);
        assert!(cfg.pipeline.report_pass);
        assert_eq!(cfg.queue.limit, 100_000);
        assert!(cfg.queue.enforce_limit);
        assert_eq!(cfg.watchdog.deadline(), Duration::from_secs(60));
        assert_eq!(cfg.provisioning.download_concurrency, 8);
    }

    #[test]
    fn project_file_in_input_dir_is_found() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(
            dir.path().join(PROJECT_FILE),
            r#"
[pipeline]
workers = 3
skip_minimizer = true

[queue]
limit = 12

[report]
changelog_url = "https://example.test/{low}/{high}"
"#,
        )
        .unwrap();

        let path = locate_config(None, dir.path()).unwrap().unwrap();
        let cfg = load_file(&path).unwrap();
        assert_eq!(cfg.pipeline.workers, 3);
        assert!(cfg.pipeline.skip_minimizer);
        assert_eq!(cfg.pipeline.iteration_count, 4);
        assert_eq!(cfg.queue.limit, 12);
        assert_eq!(cfg.report.changelog_for(5, 9), "https://example.test/5/9");
    }

    #[test]
    fn explicit_path_must_exist() {
        let dir = tempfile::tempdir().unwrap();
        let missing = dir.path().join("nope.toml");
        assert!(locate_config(Some(&missing), dir.path()).is_err());
    }

    #[test]
    fn malformed_file_is_an_error() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("bad.toml");
        std::fs::write(&path, "[pipeline\nworkers = ").unwrap();
        assert!(load_file(&path).is_err());
    }

    #[test]
    fn env_limit_parses_or_rejects() {
        assert_eq!(env_limit(None).unwrap(), None);
        assert_eq!(env_limit(Some(" 25 ".into())).unwrap(), Some(25));
        assert!(env_limit(Some("many".into())).is_err());
    }

    #[test]
    fn cli_json_overrides_env_and_config() {
        let output = resolve_output(true, Some("pretty".into()), Some("text".into()));
        assert_eq!(output, "json");
    }

    #[test]
    fn aliases_are_normalized() {
        assert_eq!(resolve_output(false, Some("table".into()), None), "pretty");
        assert_eq!(resolve_output(false, None, Some("plain".into())), "text");
    }
}
