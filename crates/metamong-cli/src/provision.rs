//! Browser binaries from a directory tree, filled on demand by shell commands.
//!
//! A revision's binary lives at `<browser_dir>/<revision>/<browser>`. When it
//! is missing, the configured fetch (or build) command is run with
//! `{revision}`, `{browser}` and `{dir}` substituted and is expected to place
//! the binary there.

use std::path::{Path, PathBuf};
use std::process::Command;

use metamong_core::config::ProvisioningConfig;
use metamong_core::provision::{BinaryProvisioner, ProvisionError, Provisioning};
use metamong_core::version::{BrowserKind, Revision};
use tracing::{debug, info};

/// Trailing stderr kept in a failure reason.
const STDERR_TAIL: usize = 400;

#[derive(Debug, Clone)]
pub struct CommandProvisioner {
    browser: BrowserKind,
    browser_dir: PathBuf,
    fetch_command: Option<String>,
    build_command: Option<String>,
}

impl CommandProvisioner {
    pub fn new(config: &ProvisioningConfig, browser: BrowserKind) -> Self {
        Self {
            browser,
            browser_dir: config.browser_dir.clone(),
            fetch_command: config.fetch_command.clone(),
            build_command: config.build_command.clone(),
        }
    }

    pub fn binary_path(&self, revision: Revision) -> PathBuf {
        self.browser_dir
            .join(revision.to_string())
            .join(self.browser.as_str())
    }

    fn expand(&self, template: &str, revision: Revision) -> String {
        template
            .replace("{revision}", &revision.to_string())
            .replace("{browser}", self.browser.as_str())
            .replace("{dir}", &self.browser_dir.display().to_string())
    }

    fn provision(
        &self,
        revision: Revision,
        strategy: Provisioning,
    ) -> Result<PathBuf, ProvisionError> {
        let path = self.binary_path(revision);
        if path.exists() {
            debug!(revision, path = %path.display(), "binary already present");
            return Ok(path);
        }

        let template = match strategy {
            Provisioning::Download => self.fetch_command.as_deref(),
            Provisioning::Build => self.build_command.as_deref(),
        };
        let Some(template) = template else {
            return Err(ProvisionError::Unavailable {
                revision,
                reason: format!("{} is missing and no {strategy} command is configured", path.display()),
            });
        };

        let command = self.expand(template, revision);
        info!(revision, %strategy, %command, "provisioning browser binary");
        let output = Command::new("sh").arg("-c").arg(&command).output()?;
        if !output.status.success() {
            let reason = format!(
                "`{command}` exited with {}: {}",
                output.status,
                stderr_tail(&output.stderr)
            );
            return Err(match strategy {
                Provisioning::Download => ProvisionError::Unavailable { revision, reason },
                Provisioning::Build => ProvisionError::BuildFailed { revision, reason },
            });
        }

        if !path.exists() {
            return Err(ProvisionError::Unavailable {
                revision,
                reason: format!("`{command}` succeeded but {} was not created", path.display()),
            });
        }
        Ok(path)
    }

    pub fn browser_dir(&self) -> &Path {
        &self.browser_dir
    }
}

fn stderr_tail(stderr: &[u8]) -> String {
    let text = String::from_utf8_lossy(stderr);
    let text = text.trim();
    let start = text
        .char_indices()
        .rev()
        .nth(STDERR_TAIL)
        .map_or(0, |(at, _)| at);
    text[start..].to_string()
}

impl BinaryProvisioner for CommandProvisioner {
    fn ensure_binary(&self, revision: Revision) -> Result<PathBuf, ProvisionError> {
        self.provision(revision, Provisioning::Download)
    }

    fn build_binary(&self, revision: Revision) -> Result<PathBuf, ProvisionError> {
        self.provision(revision, Provisioning::Build)
    }
}
