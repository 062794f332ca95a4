//! End-to-end tests through the execution engine
//!
//! Tests that spawn a sandbox need unprivileged user namespaces and seccomp.
//! They probe the host first and return early when isolation is unavailable.

use serde_json::{Map, Value, json};
use std::os::unix::fs::PermissionsExt;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};
use tempfile::TempDir;
use tool_sandbox::{
    CancellationToken, DisplayBackend, DisplayError, EngineConfig, EntryPoint, ErrorKind,
    ExecutionEngine, ExecutionRequest, MemoryAuditSink, MouseButton, RunAs, StaticPolicy,
    StaticRegistry, SystemCapabilities, ToolManifest, utils,
};

static ENGINE_TEST_LOCK: Mutex<()> = Mutex::new(());

const TOOLS: &[(&str, &str)] = &[
    ("report", "echo hello\nprintf '%0123d' 0 > out.csv\n"),
    ("spin", "while :; do :; done\n"),
    ("signal", "kill -0 $$\necho unreachable\n"),
    ("marker", "if [ -e marker ]; then echo seen; fi\necho x > marker\n"),
    ("fail", "echo oops >&2\nexit 4\n"),
    ("noisy", "i=0\nwhile [ $i -lt 3000 ]; do echo 0123456789abcdef; i=$((i+1)); done\n"),
    (
        "echo_args",
        "while read -r l || [ -n \"$l\" ]; do echo \"$l\"; done < \"$TOOL_ARGS\"\n",
    ),
    (
        "escape",
        "if echo data > /escape; then echo wrote-root; fi\n\
         if echo data > /tmp/scratch; then echo wrote-tmp; fi\n",
    ),
    (
        "bloat",
        "i=0\nwhile [ $i -lt 128 ]; do printf '%01024d' 0 >> big.bin || exit 3; i=$((i+1)); done\n\
         exit 5\n",
    ),
];

const FILE_LIMIT: u64 = 64 * 1024;

/// argv marker of a staged tool as seen from the host
const ENTRY_MARKER: &[u8] = b"/workspace/.tool_entry";

#[derive(Default)]
struct RecordingDisplay {
    calls: Mutex<Vec<String>>,
}

impl RecordingDisplay {
    fn calls(&self) -> Vec<String> {
        self.calls.lock().unwrap().clone()
    }
}

impl DisplayBackend for RecordingDisplay {
    fn capture(&self, dest: &Path, _deadline: Instant) -> Result<(), DisplayError> {
        self.calls.lock().unwrap().push("capture".to_string());
        std::fs::write(dest, b"png")?;
        Ok(())
    }

    fn move_pointer(&self, x: i32, y: i32, _deadline: Instant) -> Result<(), DisplayError> {
        self.calls.lock().unwrap().push(format!("move {} {}", x, y));
        Ok(())
    }

    fn click(&self, button: MouseButton, _deadline: Instant) -> Result<(), DisplayError> {
        self.calls.lock().unwrap().push(format!("click {:?}", button));
        Ok(())
    }

    fn key_press(&self, keys: &str, _deadline: Instant) -> Result<(), DisplayError> {
        self.calls.lock().unwrap().push(format!("key {}", keys));
        Ok(())
    }
}

struct Harness {
    _scripts: TempDir,
    base: TempDir,
    engine: ExecutionEngine,
    audit: Arc<MemoryAuditSink>,
    display: Arc<RecordingDisplay>,
}

impl Harness {
    fn new(policy: StaticPolicy) -> Self {
        let scripts = tempfile::tempdir().unwrap();
        let base = tempfile::tempdir().unwrap();
        // Under root the tool's host uid is the unprivileged run-as uid,
        // which must be able to reach the instance root
        std::fs::set_permissions(base.path(), std::fs::Permissions::from_mode(0o755)).unwrap();

        let mut registry = StaticRegistry::new();
        for (id, body) in TOOLS {
            let script = scripts.path().join(format!("{}.sh", id));
            std::fs::write(&script, body).unwrap();
            registry
                .register(ToolManifest::plugin(
                    *id,
                    EntryPoint {
                        interpreter: PathBuf::from("/bin/sh"),
                        interpreter_args: Vec::new(),
                        script,
                    },
                ))
                .unwrap();
        }
        registry.register(ToolManifest::display("desktop")).unwrap();
        let guarded = ToolManifest::plugin(
            "guarded",
            EntryPoint {
                interpreter: PathBuf::from("/bin/sh"),
                interpreter_args: Vec::new(),
                script: scripts.path().join("report.sh"),
            },
        )
        .require("fs.write");
        registry.register(guarded).unwrap();

        let config = EngineConfig::builder()
            .base_dir(base.path())
            .output_limit(16 * 1024)
            .max_file_size(FILE_LIMIT)
            .grace_period(Duration::from_millis(300))
            .build()
            .unwrap();
        let audit = Arc::new(MemoryAuditSink::new());
        let display = Arc::new(RecordingDisplay::default());
        let engine = ExecutionEngine::builder(config)
            .gate(Arc::new(policy))
            .audit(audit.clone())
            .registry(Arc::new(registry))
            .display_backend(display.clone())
            .build()
            .unwrap();

        Self {
            _scripts: scripts,
            base,
            engine,
            audit,
            display,
        }
    }

    fn request(&self, tool: &str) -> ExecutionRequest {
        ExecutionRequest::new(tool, "agent", Map::new())
    }

    fn base_is_empty(&self) -> bool {
        std::fs::read_dir(self.base.path())
            .map(|mut d| d.next().is_none())
            .unwrap_or(true)
    }
}

fn open_policy() -> StaticPolicy {
    StaticPolicy::new().grant("agent", ["*"])
}

/// A harness when the host can run sandboxes, otherwise None
fn live_harness() -> Option<Harness> {
    if !SystemCapabilities::detect().can_sandbox() {
        eprintln!("skipping: host lacks user namespaces or seccomp");
        return None;
    }
    let harness = Harness::new(open_policy());
    let probe = harness.engine.execute(&harness.request("report"), None);
    if probe.error_kind == Some(ErrorKind::SetupFailure) {
        eprintln!("skipping: sandbox setup unavailable: {}", probe.diagnostic_message);
        return None;
    }
    Some(harness)
}

/// `/proc/<pid>/status` of the first running staged tool
fn running_tool_status() -> Option<String> {
    for entry in std::fs::read_dir("/proc").ok()?.flatten() {
        let Ok(cmdline) = std::fs::read(entry.path().join("cmdline")) else {
            continue;
        };
        if cmdline
            .windows(ENTRY_MARKER.len())
            .any(|window| window == ENTRY_MARKER)
        {
            if let Ok(status) = std::fs::read_to_string(entry.path().join("status")) {
                return Some(status);
            }
        }
    }
    None
}

fn status_ids(status: &str, field: &str) -> Vec<u32> {
    status
        .lines()
        .find(|line| line.starts_with(field))
        .map(|line| {
            line.split_whitespace()
                .skip(1)
                .filter_map(|id| id.parse().ok())
                .collect()
        })
        .unwrap_or_default()
}

#[test]
fn missing_capability_spawns_nothing() {
    let _lock = ENGINE_TEST_LOCK.lock();
    let harness = Harness::new(StaticPolicy::new().grant("agent", ["fs.read"]));

    let result = harness.engine.execute(&harness.request("guarded"), None);

    assert!(!result.success);
    assert_eq!(result.error_kind, Some(ErrorKind::PermissionDenied));
    assert!(result.instance_id.is_none());
    assert_eq!(harness.engine.spawn_count(), 0);
    assert!(harness.base_is_empty());

    let records = harness.audit.records();
    assert_eq!(records.len(), 1);
    assert_eq!(records[0].principal_id, "agent");
    assert_eq!(records[0].resource, "guarded");
    assert!(!records[0].success);
}

#[test]
fn unknown_tool_reports_setup_failure() {
    let _lock = ENGINE_TEST_LOCK.lock();
    let harness = Harness::new(open_policy());
    let result = harness.engine.execute(&harness.request("missing"), None);
    assert_eq!(result.error_kind, Some(ErrorKind::SetupFailure));
    assert_eq!(harness.engine.spawn_count(), 0);
}

#[test]
fn denied_click_stops_the_sequence() {
    let _lock = ENGINE_TEST_LOCK.lock();
    let harness = Harness::new(StaticPolicy::new().grant("agent", ["display.capture"]));

    let mut args = Map::new();
    args.insert(
        "actions".to_string(),
        json!([
            {"action": "screenshot"},
            {"action": "click", "button": "left"},
            {"action": "move_pointer", "x": 100, "y": 100},
            {"action": "screenshot"}
        ]),
    );
    let result = harness
        .engine
        .execute(&ExecutionRequest::new("desktop", "agent", args), None);

    assert!(!result.success);
    assert_eq!(result.error_kind, Some(ErrorKind::PermissionDenied));
    assert_eq!(harness.display.calls(), vec!["capture".to_string()]);
    assert_eq!(result.artifacts.len(), 1);
    assert!(harness.base_is_empty());

    let actions: Vec<String> = harness
        .audit
        .records()
        .into_iter()
        .map(|r| r.action)
        .collect();
    assert_eq!(
        actions,
        vec!["tool.execute", "display.screenshot", "display.click"]
    );
}

#[test]
fn artifact_is_reported_and_workspace_removed() {
    let _lock = ENGINE_TEST_LOCK.lock();
    let Some(harness) = live_harness() else {
        return;
    };

    let result = harness.engine.execute(&harness.request("report"), None);

    assert!(result.success, "{:?}", result);
    assert_eq!(result.exit_code, Some(0));
    assert_eq!(result.stdout, "hello\n");
    assert_eq!(result.artifacts.len(), 1);
    assert_eq!(result.artifacts[0].name, "out.csv");
    assert_eq!(result.artifacts[0].size, 123);
    assert!(harness.base_is_empty());
}

#[test]
fn runaway_tool_times_out() {
    let _lock = ENGINE_TEST_LOCK.lock();
    let Some(harness) = live_harness() else {
        return;
    };

    let request = harness.request("spin").with_timeout_s(2);
    let result = harness.engine.execute(&request, None);

    assert!(!result.success);
    assert_eq!(result.error_kind, Some(ErrorKind::ExecutionTimeout));
    assert!(result.wall_time_ms >= 2000);
    // timeout + grace + polling slack
    assert!(result.wall_time_ms < 2000 + 300 + 1000, "{}", result.wall_time_ms);
    assert!(harness.base_is_empty());
}

#[test]
fn disallowed_syscall_is_killed() {
    let _lock = ENGINE_TEST_LOCK.lock();
    let Some(harness) = live_harness() else {
        return;
    };

    let result = harness.engine.execute(&harness.request("signal"), None);

    assert!(!result.success);
    assert_eq!(result.error_kind, Some(ErrorKind::ExecutionCrash));
    assert!(result.killed_by_seccomp());
    assert!(result.diagnostic_message.contains("syscall filter"));
    assert!(!result.stdout.contains("unreachable"));
}

#[test]
fn nonzero_exit_is_a_crash_with_stderr() {
    let _lock = ENGINE_TEST_LOCK.lock();
    let Some(harness) = live_harness() else {
        return;
    };

    let result = harness.engine.execute(&harness.request("fail"), None);

    assert_eq!(result.error_kind, Some(ErrorKind::ExecutionCrash));
    assert_eq!(result.exit_code, Some(4));
    assert_eq!(result.stderr, "oops\n");
}

#[test]
fn identical_requests_get_disjoint_workspaces() {
    let _lock = ENGINE_TEST_LOCK.lock();
    let Some(harness) = live_harness() else {
        return;
    };

    let first = harness.engine.execute(&harness.request("marker"), None);
    let second = harness.engine.execute(&harness.request("marker"), None);

    assert!(first.success && second.success);
    assert_ne!(first.instance_id, second.instance_id);
    assert!(!second.stdout.contains("seen"));
}

#[test]
fn output_beyond_cap_is_truncated() {
    let _lock = ENGINE_TEST_LOCK.lock();
    let Some(harness) = live_harness() else {
        return;
    };

    let result = harness.engine.execute(&harness.request("noisy"), None);

    assert!(result.success);
    assert!(result.stdout.contains("[... output truncated:"));
    assert!(result.stdout.len() < 17 * 1024);
}

#[test]
fn cancellation_terminates_the_run() {
    let _lock = ENGINE_TEST_LOCK.lock();
    let Some(harness) = live_harness() else {
        return;
    };

    let token = CancellationToken::new();
    let trigger = token.clone();
    let canceller = std::thread::spawn(move || {
        std::thread::sleep(Duration::from_millis(300));
        trigger.cancel();
    });

    let request = harness.request("spin").with_timeout_s(20);
    let result = harness.engine.execute(&request, Some(&token));
    canceller.join().unwrap();

    assert_eq!(result.error_kind, Some(ErrorKind::Cancelled));
    assert!(result.wall_time_ms < 5000);
    assert!(harness.base_is_empty());
}

#[test]
fn arguments_reach_the_tool() {
    let _lock = ENGINE_TEST_LOCK.lock();
    let Some(harness) = live_harness() else {
        return;
    };

    let mut args = Map::new();
    args.insert("rows".to_string(), Value::from(7));
    let result = harness
        .engine
        .execute(&ExecutionRequest::new("echo_args", "agent", args), None);

    assert!(result.success, "{:?}", result);
    assert!(result.stdout.contains("\"rows\": 7"), "{}", result.stdout);
    assert!(result.artifacts.is_empty());
}

#[test]
fn tool_runs_as_the_unprivileged_identity() {
    let _lock = ENGINE_TEST_LOCK.lock();
    let Some(harness) = live_harness() else {
        return;
    };

    let token = CancellationToken::new();
    let trigger = token.clone();
    let watcher = std::thread::spawn(move || {
        let give_up = Instant::now() + Duration::from_secs(5);
        let mut status = None;
        while status.is_none() && Instant::now() < give_up {
            status = running_tool_status();
            std::thread::sleep(Duration::from_millis(20));
        }
        trigger.cancel();
        status
    });

    let request = harness.request("spin").with_timeout_s(20);
    let result = harness.engine.execute(&request, Some(&token));
    let status = watcher.join().unwrap().expect("running tool not found in /proc");

    assert_eq!(result.error_kind, Some(ErrorKind::Cancelled));
    let (uid, gid) = if utils::is_root() {
        let run_as = RunAs::default();
        (run_as.uid, run_as.gid)
    } else {
        (utils::get_uid(), utils::get_gid())
    };
    assert_eq!(status_ids(&status, "Uid:"), vec![uid; 4], "{}", status);
    assert_eq!(status_ids(&status, "Gid:"), vec![gid; 4], "{}", status);
    if utils::is_root() {
        assert!(status_ids(&status, "Groups:").is_empty(), "{}", status);
    }
}

#[test]
fn root_filesystem_is_read_only() {
    let _lock = ENGINE_TEST_LOCK.lock();
    let Some(harness) = live_harness() else {
        return;
    };

    let result = harness.engine.execute(&harness.request("escape"), None);

    assert!(result.success, "{:?}", result);
    assert!(!result.stdout.contains("wrote-root"), "{}", result.stdout);
    assert!(result.stdout.contains("wrote-tmp"), "{}", result.stdout);
}

#[test]
fn oversized_file_exhausts_resources() {
    let _lock = ENGINE_TEST_LOCK.lock();
    let Some(harness) = live_harness() else {
        return;
    };

    let result = harness.engine.execute(&harness.request("bloat"), None);

    assert!(!result.success);
    assert_eq!(result.error_kind, Some(ErrorKind::ResourceExhausted), "{:?}", result);
    assert!(result.diagnostic_message.contains("file size limit"));
    assert!(harness.base_is_empty());
}
