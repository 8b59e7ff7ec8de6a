//! Browser driver running as a child process.
//!
//! The driver reads one JSON request per line on stdin and answers each with
//! one JSON line on stdout: `{"ok": true, "result": ...}` or
//! `{"ok": false, "error": "..."}`. Requests are tagged by `op`:
//! `setup`, `render`, `differential`, `snapshot`, `outline`, `edit`, `quit`.
//!
//! On Unix the driver leads its own process group, so killing it also takes
//! down any browser it launched and closes the pipes those held open.

use std::io::{BufRead, BufReader, Write};
use std::path::{Path, PathBuf};
use std::process::{Child, ChildStdin, ChildStdout, Command, Stdio};
use std::sync::{Arc, Mutex};
use std::thread;
use std::time::{Duration, Instant};

use metamong_core::config::DriverConfig;
use metamong_core::lock::lock_unpoisoned;
use metamong_core::oracle::{
    Browser, BrowserError, BrowserFactory, DomEdit, DomSnapshot, ElementOutline, KillSwitch,
    PageState,
};
use metamong_core::verdict::{PerceptualHash, RenderHash, Verdict, differential_verdict};
use metamong_core::version::{BrowserKind, Revision};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

#[derive(Debug, Serialize)]
#[serde(tag = "op", rename_all = "snake_case")]
enum Request<'a> {
    Setup {
        browser: BrowserKind,
        revision: Revision,
        binary: &'a Path,
    },
    Render {
        test_case: &'a Path,
        mutations: &'a [String],
    },
    Differential {
        test_case: &'a Path,
        mutations: &'a [String],
        save_screenshots: bool,
    },
    Snapshot {
        test_case: &'a Path,
    },
    Outline {
        test_case: &'a Path,
    },
    Edit {
        test_case: &'a Path,
        script: String,
    },
    Quit,
}

#[derive(Debug, Deserialize)]
struct Reply {
    ok: bool,
    #[serde(default)]
    error: Option<String>,
    #[serde(default)]
    result: Option<serde_json::Value>,
}

#[derive(Debug, Deserialize)]
struct WireRender {
    hash: String,
    width: u32,
    height: u32,
}

impl WireRender {
    fn decode(&self) -> Result<RenderHash, BrowserError> {
        let hash = PerceptualHash::from_hex(&self.hash)
            .ok_or_else(|| BrowserError::Protocol(format!("bad hash {:?}", self.hash)))?;
        Ok(RenderHash {
            hash,
            width: self.width,
            height: self.height,
        })
    }
}

/// Both renders of one differential plus the page state around the reload.
#[derive(Debug, Deserialize)]
struct WireDifferential {
    live: Option<WireRender>,
    reloaded: Option<WireRender>,
    #[serde(default)]
    before: PageState,
    #[serde(default)]
    after: PageState,
}

/// How long a driver gets to exit on its own after `quit`.
const QUIT_GRACE: Duration = Duration::from_millis(500);
const EXIT_POLL: Duration = Duration::from_millis(10);

/// Kill the driver and everything in its process group, falling back to the
/// driver alone.
fn kill_tree(pid: u32, child: &mut Child) -> bool {
    #[cfg(unix)]
    if kill_group(pid) {
        return true;
    }
    #[cfg(not(unix))]
    let _ = pid;
    matches!(child.try_wait(), Ok(None)) && child.kill().is_ok()
}

#[cfg(unix)]
fn kill_group(pid: u32) -> bool {
    use nix::sys::signal::{Signal, killpg};
    use nix::unistd::Pid;

    i32::try_from(pid).is_ok_and(|pid| killpg(Pid::from_raw(pid), Signal::SIGKILL).is_ok())
}

/// Kills the driver's process tree from the watchdog thread.
#[derive(Debug)]
struct ChildKill {
    pid: u32,
    child: Arc<Mutex<Child>>,
}

impl KillSwitch for ChildKill {
    fn pid(&self) -> Option<u32> {
        Some(self.pid)
    }

    fn kill(&self) -> bool {
        kill_tree(self.pid, &mut lock_unpoisoned(&self.child))
    }
}

struct DriverProcess {
    child: Arc<Mutex<Child>>,
    stdin: ChildStdin,
    stdout: BufReader<ChildStdout>,
    kill: Arc<ChildKill>,
}

impl DriverProcess {
    fn spawn(command: &str, args: &[String]) -> std::io::Result<Self> {
        let mut command = Command::new(command);
        command
            .args(args)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::inherit());
        #[cfg(unix)]
        std::os::unix::process::CommandExt::process_group(&mut command, 0);

        let mut child = command.spawn()?;
        let pid = child.id();
        let (Some(stdin), Some(stdout)) = (child.stdin.take(), child.stdout.take()) else {
            kill_tree(pid, &mut child);
            let _ = child.wait();
            return Err(std::io::Error::other("driver pipes unavailable"));
        };
        let child = Arc::new(Mutex::new(child));
        Ok(Self {
            kill: Arc::new(ChildKill {
                pid,
                child: Arc::clone(&child),
            }),
            child,
            stdin,
            stdout: BufReader::new(stdout),
        })
    }

    fn send(&mut self, request: &Request<'_>) -> Result<(), BrowserError> {
        let mut line = serde_json::to_string(request)
            .map_err(|err| BrowserError::Protocol(err.to_string()))?;
        line.push('\n');
        self.stdin.write_all(line.as_bytes())?;
        self.stdin.flush()?;
        Ok(())
    }

    fn exchange(&mut self, revision: Revision, request: &Request<'_>) -> Result<Reply, BrowserError> {
        self.send(request)?;
        let mut answer = String::new();
        if self.stdout.read_line(&mut answer)? == 0 {
            return Err(BrowserError::Crashed {
                revision,
                reason: "driver closed its output".to_string(),
            });
        }
        serde_json::from_str(&answer)
            .map_err(|err| BrowserError::Protocol(format!("unreadable reply {answer:?}: {err}")))
    }

    fn is_running(&self) -> bool {
        running(&self.child)
    }

    /// Ask the driver to quit without waiting for a reply, then kill its
    /// process group once the grace period is over. Never blocks on the
    /// driver.
    fn shutdown(mut self, revision: Revision) {
        if self.is_running() && self.send(&Request::Quit).is_err() {
            debug!(revision, "driver did not take quit");
        }
        let Self {
            child, stdin, kill, ..
        } = self;
        drop(stdin);

        let deadline = Instant::now() + QUIT_GRACE;
        while running(&child) && Instant::now() < deadline {
            thread::sleep(EXIT_POLL);
        }
        if running(&child) {
            debug!(revision, pid = kill.pid, "driver ignored quit; killing");
        }
        let mut child = lock_unpoisoned(&child);
        kill_tree(kill.pid, &mut child);
        let _ = child.wait();
    }
}

fn running(child: &Mutex<Child>) -> bool {
    matches!(lock_unpoisoned(child).try_wait(), Ok(None))
}

/// A browser driven through a [`DriverProcess`].
pub struct ProcessBrowser {
    command: String,
    args: Vec<String>,
    browser: BrowserKind,
    revision: Revision,
    binary: PathBuf,
    process: Option<DriverProcess>,
}

impl ProcessBrowser {
    pub fn new(config: &DriverConfig, browser: BrowserKind, revision: Revision, binary: &Path) -> Self {
        Self {
            command: config.command.clone(),
            args: config.args.clone(),
            browser,
            revision,
            binary: binary.to_path_buf(),
            process: None,
        }
    }

    fn call<T: DeserializeOwned>(&mut self, request: &Request<'_>) -> Result<T, BrowserError> {
        let revision = self.revision;
        let process = self
            .process
            .as_mut()
            .ok_or(BrowserError::NotRunning { revision })?;
        let reply = process.exchange(revision, request)?;
        if !reply.ok {
            return Err(BrowserError::Protocol(
                reply.error.unwrap_or_else(|| "driver reported failure".to_string()),
            ));
        }
        serde_json::from_value(reply.result.unwrap_or(serde_json::Value::Null))
            .map_err(|err| BrowserError::Protocol(err.to_string()))
    }
}

impl Browser for ProcessBrowser {
    fn revision(&self) -> Revision {
        self.revision
    }

    fn setup(&mut self) -> bool {
        self.teardown();
        match DriverProcess::spawn(&self.command, &self.args) {
            Ok(process) => self.process = Some(process),
            Err(err) => {
                warn!(revision = self.revision, command = %self.command, error = %err, "could not start driver");
                return false;
            }
        }
        let binary = self.binary.clone();
        let request = Request::Setup {
            browser: self.browser,
            revision: self.revision,
            binary: &binary,
        };
        match self.call::<()>(&request) {
            Ok(()) => true,
            Err(err) => {
                warn!(revision = self.revision, error = %err, "driver setup failed");
                self.teardown();
                false
            }
        }
    }

    fn teardown(&mut self) {
        if let Some(process) = self.process.take() {
            process.shutdown(self.revision);
        }
    }

    fn is_alive(&mut self) -> bool {
        self.process.as_ref().is_some_and(DriverProcess::is_running)
    }

    fn render_and_hash(
        &mut self,
        test_case: &Path,
        mutations: &[String],
    ) -> Result<RenderHash, BrowserError> {
        self.call::<WireRender>(&Request::Render {
            test_case,
            mutations,
        })?
        .decode()
    }

    fn run_differential(
        &mut self,
        test_case: &Path,
        mutations: &[String],
        save_screenshots: bool,
    ) -> Verdict {
        let reply = self.call::<WireDifferential>(&Request::Differential {
            test_case,
            mutations,
            save_screenshots,
        });
        let wire = match reply {
            Ok(wire) => wire,
            Err(err) => {
                debug!(revision = self.revision, test_case = %test_case.display(), error = %err, "differential failed");
                return Verdict::Indeterminate;
            }
        };
        let live = wire.live.as_ref().map(WireRender::decode).transpose();
        let reloaded = wire.reloaded.as_ref().map(WireRender::decode).transpose();
        match (live, reloaded) {
            (Ok(live), Ok(reloaded)) => differential_verdict(
                live.as_ref(),
                reloaded.as_ref(),
                self.compare_states(&wire.before, &wire.after),
            ),
            _ => Verdict::Indeterminate,
        }
    }

    fn snapshot_dom(&mut self, test_case: &Path) -> Result<DomSnapshot, BrowserError> {
        self.call(&Request::Snapshot { test_case })
    }

    fn outline(&mut self, test_case: &Path) -> Result<Vec<ElementOutline>, BrowserError> {
        self.call(&Request::Outline { test_case })
    }

    fn apply_edit(&mut self, test_case: &Path, edit: &DomEdit) -> Result<String, BrowserError> {
        self.call(&Request::Edit {
            test_case,
            script: edit.to_script(),
        })
    }

    fn kill_switch(&self) -> Option<Arc<dyn KillSwitch>> {
        self.process
            .as_ref()
            .map(|p| Arc::clone(&p.kill) as Arc<dyn KillSwitch>)
    }
}

impl Drop for ProcessBrowser {
    fn drop(&mut self) {
        self.teardown();
    }
}

#[derive(Debug, Clone)]
pub struct DriverFactory {
    config: DriverConfig,
    browser: BrowserKind,
}

impl DriverFactory {
    pub const fn new(config: DriverConfig, browser: BrowserKind) -> Self {
        Self { config, browser }
    }
}

impl BrowserFactory for DriverFactory {
    fn create(&self, revision: Revision, binary: &Path) -> Box<dyn Browser> {
        Box::new(ProcessBrowser::new(
            &self.config,
            self.browser,
            revision,
            binary,
        ))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::thread;
    use std::time::{Duration, Instant};

    const SAME: &str = r#"{"hash":"HASH","width":800,"height":600}"#;

    /// A shell driver answering every op with canned replies.
    fn script(differential: &str) -> DriverConfig {
        script_quitting(differential, r#"echo '{"ok":true}'; exit 0"#)
    }

    fn script_quitting(differential: &str, quit: &str) -> DriverConfig {
        let zero = "0".repeat(144);
        let same = SAME.replace("HASH", &zero);
        let body = format!(
            r#"while IFS= read -r line; do
  case "$line" in
    *'"op":"quit"'*) {quit};;
    *'"op":"differential"'*) {differential};;
    *'"op":"render"'*) echo '{{"ok":true,"result":{same}}}';;
    *'"op":"outline"'*) echo '{{"ok":true,"result":[{{"attributes":["id","class"]}}]}}';;
    *'"op":"snapshot"'*) echo '{{"ok":true,"result":{{"ids":["a"],"attributes":{{"a":["id"]}},"css_rule_count":3}}}}';;
    *'"op":"edit"'*) echo '{{"ok":true,"result":"<p></p>"}}';;
    *) echo '{{"ok":true}}';;
  esac
done"#
        );
        DriverConfig {
            command: "sh".to_string(),
            args: vec!["-c".to_string(), body],
        }
    }

    fn same_renders() -> String {
        let zero = "0".repeat(144);
        let same = SAME.replace("HASH", &zero);
        format!(r#"echo '{{"ok":true,"result":{{"live":{same},"reloaded":{same}}}}}'"#)
    }

    fn started(config: &DriverConfig) -> ProcessBrowser {
        let mut browser = ProcessBrowser::new(config, BrowserKind::Chrome, 812_852, Path::new("/bin/chrome"));
        assert!(browser.setup());
        browser
    }

    #[test]
    fn requests_are_tagged_json_lines() {
        let json = serde_json::to_string(&Request::Outline {
            test_case: Path::new("a.html"),
        })
        .unwrap();
        assert_eq!(json, r#"{"op":"outline","test_case":"a.html"}"#);
    }

    #[test]
    fn identical_renders_are_no_bug() {
        let mut browser = started(&script(&same_renders()));
        assert!(browser.is_alive());
        assert_eq!(
            browser.run_differential(Path::new("a.html"), &[], false),
            Verdict::NoBug
        );
        let render = browser.render_and_hash(Path::new("a.html"), &[]).unwrap();
        assert_eq!(render.width, 800);
        browser.teardown();
        assert!(!browser.is_alive());
    }

    #[test]
    fn resized_render_is_a_bug() {
        let zero = "0".repeat(144);
        let differential = format!(
            r#"echo '{{"ok":true,"result":{{"live":{{"hash":"{zero}","width":800,"height":600}},"reloaded":{{"hash":"{zero}","width":800,"height":900}}}}}}'"#
        );
        let mut browser = started(&script(&differential));
        assert_eq!(
            browser.run_differential(Path::new("a.html"), &["m".into()], false),
            Verdict::Bug
        );
    }

    #[test]
    fn driver_failure_is_indeterminate() {
        let mut browser = started(&script(r#"echo '{"ok":false,"error":"page crashed"}'"#));
        assert_eq!(
            browser.run_differential(Path::new("a.html"), &[], false),
            Verdict::Indeterminate
        );
        assert!(browser.is_alive());
    }

    #[test]
    fn inspection_calls_decode_results() {
        let mut browser = started(&script(&same_renders()));
        let outline = browser.outline(Path::new("a.html")).unwrap();
        assert_eq!(outline[0].attributes, ["id", "class"]);
        let snapshot = browser.snapshot_dom(Path::new("a.html")).unwrap();
        assert_eq!(snapshot.css_rule_count, 3);
        let html = browser
            .apply_edit(Path::new("a.html"), &DomEdit::ClearText { index: 0 })
            .unwrap();
        assert_eq!(html, "<p></p>");
    }

    #[test]
    fn kill_switch_unblocks_a_hung_call() {
        let mut browser = started(&script("exec sleep 30"));
        let switch = browser.kill_switch().unwrap();
        assert!(switch.pid().is_some());

        let started_at = Instant::now();
        let killer = thread::spawn(move || {
            thread::sleep(Duration::from_millis(100));
            switch.kill()
        });
        assert_eq!(
            browser.run_differential(Path::new("a.html"), &[], false),
            Verdict::Indeterminate
        );
        assert!(killer.join().unwrap());
        assert!(started_at.elapsed() < Duration::from_secs(10));
        assert!(!browser.is_alive());
    }

    #[test]
    fn kill_switch_takes_down_grandchildren() {
        // `sleep` runs as a child of the shell and inherits its stdout.
        let mut browser = started(&script("sleep 20"));
        let switch = browser.kill_switch().unwrap();

        let started_at = Instant::now();
        let killer = thread::spawn(move || {
            thread::sleep(Duration::from_millis(200));
            switch.kill()
        });
        assert_eq!(
            browser.run_differential(Path::new("a.html"), &[], false),
            Verdict::Indeterminate
        );
        assert!(killer.join().unwrap());
        assert!(started_at.elapsed() < Duration::from_secs(5));
        assert!(!browser.is_alive());
    }

    #[test]
    fn teardown_does_not_wait_for_a_silent_quit() {
        let mut browser = started(&script_quitting(&same_renders(), "sleep 600"));
        assert!(browser.is_alive());

        let started_at = Instant::now();
        browser.teardown();
        assert!(started_at.elapsed() < Duration::from_secs(5));
        assert!(!browser.is_alive());
        assert!(browser.kill_switch().is_none());
    }

    #[test]
    fn teardown_after_clean_quit_is_prompt() {
        let mut browser = started(&script(&same_renders()));
        let started_at = Instant::now();
        browser.teardown();
        assert!(started_at.elapsed() < Duration::from_secs(5));
    }

    #[test]
    fn missing_driver_fails_setup() {
        let config = DriverConfig {
            command: "/nonexistent/metamong-driver".to_string(),
            args: Vec::new(),
        };
        let mut browser = ProcessBrowser::new(&config, BrowserKind::Firefox, 1, Path::new("/x"));
        assert!(!browser.setup());
        assert!(browser.kill_switch().is_none());
        assert!(matches!(
            browser.outline(Path::new("a.html")),
            Err(BrowserError::NotRunning { revision: 1 })
        ));
    }
}
