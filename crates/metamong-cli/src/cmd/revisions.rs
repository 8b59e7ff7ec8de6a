//! `metamong revisions`: show what a milestone pair resolves to.

use std::io::Write;
use std::path::PathBuf;

use anyhow::{Context, Result};
use clap::Args;
use metamong_core::config::resolve_config;
use metamong_core::error::ErrorCode;
use metamong_core::version::{BrowserKind, Revision, VersionManager};
use serde::Serialize;

use super::{MilestoneArgs, coded, version_error};
use crate::output::{OutputMode, pretty_kv, pretty_section, render_mode, resolve_output_mode};

#[derive(Args, Debug)]
pub struct RevisionsArgs {
    #[command(flatten)]
    pub milestones: MilestoneArgs,

    /// Configuration file supplying `provisioning.browser_dir`.
    #[arg(long, value_name = "FILE")]
    pub config: Option<PathBuf>,
}

#[derive(Debug, Serialize)]
struct RevisionsOutput {
    browser: BrowserKind,
    pre: u32,
    new: u32,
    base: Revision,
    target: Revision,
    target_end: Revision,
    count: usize,
    first: Option<Revision>,
    last: Option<Revision>,
}

fn write_text(out: &RevisionsOutput, w: &mut dyn Write) -> std::io::Result<()> {
    writeln!(
        w,
        "revisions browser={} pre={} new={} base={} target={} target_end={} count={}",
        out.browser, out.pre, out.new, out.base, out.target, out.target_end, out.count
    )
}

fn write_pretty(out: &RevisionsOutput, w: &mut dyn Write) -> std::io::Result<()> {
    pretty_section(w, &format!("{} M{}..M{}", out.browser, out.pre, out.new))?;
    pretty_kv(w, "Base", out.base.to_string())?;
    pretty_kv(w, "Target", out.target.to_string())?;
    pretty_kv(w, "Target end", out.target_end.to_string())?;
    pretty_kv(w, "Revisions", out.count.to_string())?;
    if let (Some(first), Some(last)) = (out.first, out.last) {
        pretty_kv(w, "Range", format!("{first}..={last}"))?;
    }
    Ok(())
}

/// Execute `metamong revisions`.
pub fn run_revisions(args: &RevisionsArgs, format: Option<OutputMode>, json: bool) -> Result<()> {
    let cwd = std::env::current_dir()?;
    let config = resolve_config(args.config.as_deref(), &cwd)
        .with_context(|| coded(ErrorCode::ConfigParseError, cwd.display()))?;
    let output = resolve_output_mode(format, json, config.output.clone());

    let m = &args.milestones;
    let browser = BrowserKind::from(m.browser);
    let versions = VersionManager::new(browser, m.load_builds(&config.provisioning.browser_dir)?);
    let range = versions.revision_range(m.pre, m.new).map_err(version_error)?;

    let out = RevisionsOutput {
        browser,
        pre: m.pre,
        new: m.new,
        base: versions.revision(m.pre).map_err(version_error)?,
        target: versions.revision(m.new).map_err(version_error)?,
        target_end: versions.end_revision(m.new).map_err(version_error)?,
        count: range.len(),
        first: range.first(),
        last: range.last(),
    };
    render_mode(output, &out, write_text, write_pretty)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn text_is_one_line() {
        let out = RevisionsOutput {
            browser: BrowserKind::Firefox,
            pre: 80,
            new: 81,
            base: 1,
            target: 5,
            target_end: 9,
            count: 5,
            first: Some(1),
            last: Some(5),
        };
        let mut buf = Vec::new();
        write_text(&out, &mut buf).unwrap();
        assert_eq!(
            String::from_utf8(buf).unwrap(),
            "revisions browser=firefox pre=80 new=81 base=1 target=5 target_end=9 count=5\n"
        );

        let mut buf = Vec::new();
        write_pretty(&out, &mut buf).unwrap();
        assert!(String::from_utf8(buf).unwrap().contains("1..=5"));
    }
}
