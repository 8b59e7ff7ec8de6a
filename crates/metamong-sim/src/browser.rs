//! In-process browser fleet answering from a [`SimWorld`].
//!
//! Page bodies are one element per line (`<tag attrs>text</tag>`), which is
//! all the DOM the simulated outline and edits need.

use std::collections::BTreeMap;
use std::collections::hash_map::DefaultHasher;
use std::fs;
use std::hash::{Hash, Hasher};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::thread;
use std::time::{Duration, Instant};

use metamong_core::oracle::{
    Browser, BrowserError, BrowserFactory, DomEdit, DomSnapshot, ElementOutline, KillSwitch,
};
use metamong_core::provision::{BinaryProvisioner, ProvisionError};
use metamong_core::verdict::{PerceptualHash, RenderHash, Verdict};
use metamong_core::version::Revision;
use tracing::debug;

use crate::world::{SimWorld, UNSTABLE_MARKER};

const HANG_POLL: Duration = Duration::from_millis(5);

#[derive(Debug, Default)]
pub struct SimKillSwitch {
    killed: AtomicBool,
}

impl SimKillSwitch {
    #[must_use]
    pub fn is_killed(&self) -> bool {
        self.killed.load(Ordering::SeqCst)
    }
}

impl KillSwitch for SimKillSwitch {
    fn pid(&self) -> Option<u32> {
        None
    }

    fn kill(&self) -> bool {
        !self.killed.swap(true, Ordering::SeqCst)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
struct Element {
    tag: String,
    attrs: Vec<(String, String)>,
    text: String,
}

impl Element {
    fn parse(line: &str) -> Option<Self> {
        let line = line.trim();
        let rest = line.strip_prefix('<')?;
        let open_end = rest.find('>')?;
        let close = rest.rfind("</")?;
        if close < open_end {
            return None;
        }
        let mut tokens = rest[..open_end].split_whitespace();
        let tag = tokens.next()?.to_string();
        let attrs = tokens
            .map(|token| match token.split_once('=') {
                Some((name, value)) => (name.to_string(), value.trim_matches('"').to_string()),
                None => (token.to_string(), String::new()),
            })
            .collect();
        Some(Self {
            tag,
            attrs,
            text: rest[open_end + 1..close].to_string(),
        })
    }

    fn render(&self) -> String {
        let mut out = format!("<{}", self.tag);
        for (name, value) in &self.attrs {
            out.push_str(&format!(" {name}=\"{value}\""));
        }
        out.push_str(&format!(">{}</{}>", self.text, self.tag));
        out
    }
}

/// A page split around its body, with the body kept line by line.
struct Page {
    head: String,
    lines: Vec<String>,
    tail: String,
}

impl Page {
    fn parse(html: &str) -> Result<Self, BrowserError> {
        let start = html
            .find("<body>")
            .map(|i| i + "<body>".len())
            .ok_or_else(|| BrowserError::Protocol("page has no <body>".into()))?;
        let end = html[start..]
            .find("</body>")
            .map_or(html.len(), |i| start + i);
        Ok(Self {
            head: html[..start].to_string(),
            lines: html[start..end]
                .lines()
                .filter(|l| !l.trim().is_empty())
                .map(str::to_string)
                .collect(),
            tail: html[end..].to_string(),
        })
    }

    fn load(test_case: &Path) -> Result<Self, BrowserError> {
        Self::parse(&fs::read_to_string(test_case)?)
    }

    /// Line index of every element, in document order.
    fn element_lines(&self) -> Vec<usize> {
        self.lines
            .iter()
            .enumerate()
            .filter(|(_, line)| Element::parse(line).is_some())
            .map(|(i, _)| i)
            .collect()
    }

    fn serialize(&self) -> String {
        let mut out = self.head.clone();
        out.push('\n');
        for line in &self.lines {
            out.push_str(line);
            out.push('\n');
        }
        out.push_str(&self.tail);
        out
    }

    fn apply(&mut self, edit: &DomEdit) -> Result<(), BrowserError> {
        let line = *self
            .element_lines()
            .get(edit.index())
            .ok_or_else(|| BrowserError::Protocol(format!("no element {}", edit.index())))?;
        let mut element = Element::parse(&self.lines[line])
            .ok_or_else(|| BrowserError::Protocol("not an element".into()))?;
        match edit {
            DomEdit::RemoveElement { .. } => {
                self.lines.remove(line);
            }
            DomEdit::RemoveAttribute { name, .. } => {
                element.attrs.retain(|(attr, _)| attr != name);
                self.lines[line] = element.render();
            }
            DomEdit::ClearText { .. } => {
                element.text.clear();
                self.lines[line] = element.render();
            }
            DomEdit::Unwrap { .. } => {
                if element.text.is_empty() {
                    self.lines.remove(line);
                } else {
                    self.lines[line] = element.text;
                }
            }
        }
        Ok(())
    }
}

pub struct SimBrowser {
    world: Arc<SimWorld>,
    revision: Revision,
    kill: Arc<SimKillSwitch>,
    running: bool,
    hang_limit: Duration,
}

impl SimBrowser {
    #[must_use]
    pub fn new(world: Arc<SimWorld>, revision: Revision, hang_limit: Duration) -> Self {
        Self {
            world,
            revision,
            kill: Arc::new(SimKillSwitch::default()),
            running: false,
            hang_limit,
        }
    }

    /// Block like a wedged renderer until the watchdog kills us.
    fn hang(&self) {
        let started = Instant::now();
        while !self.kill.is_killed() && started.elapsed() < self.hang_limit {
            thread::sleep(HANG_POLL);
        }
    }
}

impl Browser for SimBrowser {
    fn revision(&self) -> Revision {
        self.revision
    }

    fn setup(&mut self) -> bool {
        self.running = !self.world.crashing.contains(&self.revision);
        self.running
    }

    fn teardown(&mut self) {
        self.running = false;
    }

    fn is_alive(&mut self) -> bool {
        self.running && !self.kill.is_killed()
    }

    fn render_and_hash(
        &mut self,
        test_case: &Path,
        mutations: &[String],
    ) -> Result<RenderHash, BrowserError> {
        if !self.is_alive() {
            return Err(BrowserError::NotRunning {
                revision: self.revision,
            });
        }
        let html = fs::read_to_string(test_case)?;
        let mut hasher = DefaultHasher::new();
        html.hash(&mut hasher);
        if self.world.reproduces(self.revision, &html, mutations) {
            mutations.hash(&mut hasher);
        }
        let word = hasher.finish();
        Ok(RenderHash {
            hash: PerceptualHash::from_words([word; 9]),
            width: 800,
            height: 600,
        })
    }

    fn run_differential(
        &mut self,
        test_case: &Path,
        mutations: &[String],
        _save_screenshots: bool,
    ) -> Verdict {
        if !self.is_alive() {
            return Verdict::Indeterminate;
        }
        if self.world.hanging.contains(&self.revision) {
            self.hang();
            return Verdict::Indeterminate;
        }
        let Ok(html) = fs::read_to_string(test_case) else {
            return Verdict::Indeterminate;
        };
        if html.contains(UNSTABLE_MARKER) {
            return Verdict::Bug;
        }
        Verdict::from_bool(self.world.reproduces(self.revision, &html, mutations))
    }

    fn snapshot_dom(&mut self, test_case: &Path) -> Result<DomSnapshot, BrowserError> {
        let page = Page::load(test_case)?;
        let mut ids = Vec::new();
        let mut attributes = BTreeMap::new();
        for line in &page.lines {
            let Some(element) = Element::parse(line) else {
                continue;
            };
            let Some((_, id)) = element.attrs.iter().find(|(name, _)| name == "id") else {
                continue;
            };
            ids.push(id.clone());
            attributes.insert(
                id.clone(),
                element.attrs.iter().map(|(name, _)| name.clone()).collect(),
            );
        }
        let css_rule_count = page.head.lines().filter(|l| l.trim_end().ends_with('}')).count();
        Ok(DomSnapshot {
            ids,
            attributes,
            css_rule_count,
        })
    }

    fn outline(&mut self, test_case: &Path) -> Result<Vec<ElementOutline>, BrowserError> {
        let page = Page::load(test_case)?;
        Ok(page
            .lines
            .iter()
            .filter_map(|line| Element::parse(line))
            .map(|element| ElementOutline {
                attributes: element.attrs.into_iter().map(|(name, _)| name).collect(),
            })
            .collect())
    }

    fn apply_edit(&mut self, test_case: &Path, edit: &DomEdit) -> Result<String, BrowserError> {
        let mut page = Page::load(test_case)?;
        page.apply(edit)?;
        Ok(page.serialize())
    }

    fn kill_switch(&self) -> Option<Arc<dyn KillSwitch>> {
        Some(self.kill.clone())
    }
}

#[derive(Debug, Clone)]
pub struct SimFactory {
    world: Arc<SimWorld>,
    hang_limit: Duration,
}

impl SimFactory {
    #[must_use]
    pub const fn new(world: Arc<SimWorld>, hang_limit: Duration) -> Self {
        Self { world, hang_limit }
    }
}

impl BrowserFactory for SimFactory {
    fn create(&self, revision: Revision, binary: &Path) -> Box<dyn Browser> {
        debug!(revision, binary = %binary.display(), "starting simulated browser");
        Box::new(SimBrowser::new(
            Arc::clone(&self.world),
            revision,
            self.hang_limit,
        ))
    }
}

/// Hands out fake binary paths, counting every provisioning call.
#[derive(Debug)]
pub struct SimProvisioner {
    root: PathBuf,
    unavailable: Vec<Revision>,
    calls: AtomicUsize,
}

impl SimProvisioner {
    #[must_use]
    pub fn new(root: impl Into<PathBuf>, unavailable: Vec<Revision>) -> Self {
        Self {
            root: root.into(),
            unavailable,
            calls: AtomicUsize::new(0),
        }
    }

    #[must_use]
    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }

    fn binary(&self, revision: Revision, kind: &str) -> Result<PathBuf, ProvisionError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        if self.unavailable.contains(&revision) {
            return Err(ProvisionError::Unavailable {
                revision,
                reason: "no simulated build".into(),
            });
        }
        Ok(self.root.join(kind).join(revision.to_string()).join("chrome"))
    }
}

impl BinaryProvisioner for SimProvisioner {
    fn ensure_binary(&self, revision: Revision) -> Result<PathBuf, ProvisionError> {
        self.binary(revision, "download")
    }

    fn build_binary(&self, revision: Revision) -> Result<PathBuf, ProvisionError> {
        self.binary(revision, "build")
    }
}
