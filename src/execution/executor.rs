//! Sandbox instances and the executor that runs them
//!
//! A [`SandboxInstance`] owns one ephemeral directory tree and tracks its
//! lifecycle. [`SandboxExecutor`] prepares the instance, spawns the tool,
//! supervises it against the wall-clock budget and cancellation, and
//! classifies how it ended.

use chrono::{DateTime, Utc};
use log::{debug, info, warn};
use nix::sys::signal::Signal;
use serde_json::{Map, Value};
use std::path::Path;
use std::thread;
use std::time::{Duration, Instant};
use walkdir::WalkDir;

use super::CancellationToken;
use super::output::{BoundedBuffer, spawn_fd_reader};
use super::process::{
    self, ChildExit, ProcessConfig, SpawnPlan, has_exited, reap, signal_group,
};
use super::state::SandboxState;
use crate::config::{EngineConfig, ResourceLimits};
use crate::errors::{Result, SandboxError};
use crate::isolation::{IdMapping, seccomp_bpf};
use crate::profile::{SandboxProfile, TEMP_MOUNT, WORKSPACE_MOUNT};
use crate::registry::EntryPoint;
use crate::resources::RlimitConfig;
use crate::result::ErrorKind;
use crate::storage::{ARGS_FILE, ENTRY_FILE, InstanceDir, MountPlan};
use crate::utils;

/// One isolated execution environment, used for exactly one request
#[derive(Debug)]
pub struct SandboxInstance {
    id: String,
    state: SandboxState,
    created_at: DateTime<Utc>,
    profile: SandboxProfile,
    dir: Option<InstanceDir>,
}

impl SandboxInstance {
    /// Allocate a fresh id and directory tree for `profile`
    pub fn create(base_dir: &Path, profile: SandboxProfile) -> Result<Self> {
        let id = uuid::Uuid::new_v4().to_string();
        let dir = InstanceDir::create(base_dir, &id)?;
        debug!("Sandbox instance {} created at {}", id, dir.path().display());
        Ok(Self {
            id,
            state: SandboxState::Created,
            created_at: Utc::now(),
            profile,
            dir: Some(dir),
        })
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn state(&self) -> SandboxState {
        self.state
    }

    pub fn created_at(&self) -> DateTime<Utc> {
        self.created_at
    }

    pub fn profile(&self) -> &SandboxProfile {
        &self.profile
    }

    /// Host path of the writable workspace, until cleanup
    pub fn workspace(&self) -> Option<&Path> {
        self.dir.as_ref().map(|d| d.workspace())
    }

    fn dir(&self) -> Result<&InstanceDir> {
        self.dir
            .as_ref()
            .ok_or_else(|| SandboxError::InvalidState(format!("instance {} already cleaned", self.id)))
    }

    /// Move to `next`, refusing edges the lifecycle does not allow
    pub fn transition(&mut self, next: SandboxState) -> Result<()> {
        if !self.state.can_transition_to(next) {
            return Err(SandboxError::InvalidState(format!(
                "{} -> {} for instance {}",
                self.state, next, self.id
            )));
        }
        debug!("Instance {}: {} -> {}", self.id, self.state, next);
        self.state = next;
        Ok(())
    }

    /// Remove the directory tree and move to `Cleaned`.
    ///
    /// Idempotent. The state still advances when removal fails.
    pub fn cleanup(&mut self) -> Result<()> {
        if self.state == SandboxState::Cleaned {
            return Ok(());
        }
        if self.state == SandboxState::Running {
            return Err(SandboxError::InvalidState(format!(
                "instance {} is still running",
                self.id
            )));
        }
        let removed = match self.dir.take() {
            Some(dir) => dir.close(),
            None => Ok(()),
        };
        self.transition(SandboxState::Cleaned)?;
        removed
    }
}

impl Drop for SandboxInstance {
    fn drop(&mut self) {
        if let Some(dir) = self.dir.take() {
            if let Err(e) = dir.close() {
                warn!("Instance {} left behind: {}", self.id, e);
            }
        }
    }
}

/// Everything resolved on the host side before the child is cloned
pub struct PreparedLaunch {
    process: ProcessConfig,
    mounts: MountPlan,
    filter: seccompiler::BpfProgram,
    mapping: IdMapping,
    rlimits: RlimitConfig,
}

impl PreparedLaunch {
    pub fn process(&self) -> &ProcessConfig {
        &self.process
    }
}

/// Why the executor ended the process itself
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Termination {
    Timeout,
    Cancelled,
}

/// How a run ended, before artifacts and cleanup
#[derive(Debug, Clone, PartialEq)]
pub struct RunOutcome {
    pub state: SandboxState,
    pub error_kind: Option<ErrorKind>,
    pub diagnostic: String,
    pub exit_code: Option<i32>,
    pub signal: Option<i32>,
    pub stdout: String,
    pub stderr: String,
    pub wall_time: Duration,
    pub cpu_time: Duration,
}

/// Final state and error classification for a finished process
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Classification {
    pub state: SandboxState,
    pub error_kind: Option<ErrorKind>,
    pub diagnostic: String,
}

/// Runs prepared instances
#[derive(Debug, Clone)]
pub struct SandboxExecutor {
    grace_period: Duration,
    poll_interval: Duration,
    output_limit: usize,
}

impl SandboxExecutor {
    pub fn new(config: &EngineConfig) -> Self {
        Self {
            grace_period: config.grace_period,
            poll_interval: config.poll_interval,
            output_limit: config.output_limit_bytes,
        }
    }

    /// Stage the bootstrap files and resolve the launch.
    ///
    /// Moves the instance to `Prepared`, or to `SetupFailed` on error.
    pub fn prepare(
        &self,
        instance: &mut SandboxInstance,
        entry: &EntryPoint,
        arguments: &Map<String, Value>,
    ) -> Result<PreparedLaunch> {
        match self.resolve(instance, entry, arguments) {
            Ok(launch) => {
                instance.transition(SandboxState::Prepared)?;
                Ok(launch)
            }
            Err(e) => {
                warn!("Preparing instance {} failed: {}", instance.id, e);
                instance.transition(SandboxState::SetupFailed)?;
                Err(e)
            }
        }
    }

    fn resolve(
        &self,
        instance: &SandboxInstance,
        entry: &EntryPoint,
        arguments: &Map<String, Value>,
    ) -> Result<PreparedLaunch> {
        let dir = instance.dir()?;
        let profile = &instance.profile;

        dir.stage_bootstrap(&entry.script, arguments)?;
        let filter = seccomp_bpf::compile(profile.syscalls())?;
        let mounts = MountPlan::prepare(profile, dir)?;

        let host_root = utils::is_root();
        let run_as = profile.run_as();
        if host_root {
            dir.hand_over(run_as)?;
        }

        Ok(PreparedLaunch {
            process: launch_command(entry),
            mounts,
            filter,
            mapping: IdMapping::for_run_as(run_as.uid, run_as.gid, host_root),
            rlimits: RlimitConfig::from(profile.limits()),
        })
    }

    /// Spawn the tool and supervise it to the end.
    ///
    /// A spawn failure moves the instance to `SetupFailed` and is returned as
    /// an error. Otherwise the instance ends in one of the terminal run
    /// states and the process group is gone.
    pub fn run(
        &self,
        instance: &mut SandboxInstance,
        launch: &PreparedLaunch,
        timeout: Duration,
        cancel: Option<&CancellationToken>,
    ) -> Result<RunOutcome> {
        if instance.state != SandboxState::Prepared {
            return Err(SandboxError::InvalidState(format!(
                "instance {} is {}, not prepared",
                instance.id, instance.state
            )));
        }

        let profile = &instance.profile;
        let plan = SpawnPlan {
            process: &launch.process,
            namespaces: *profile.namespaces(),
            mapping: launch.mapping,
            mounts: &launch.mounts,
            hostname: profile.hostname(),
            rlimits: launch.rlimits,
            filter: &launch.filter,
        };

        let started = Instant::now();
        let child = match process::spawn(&plan) {
            Ok(child) => child,
            Err(e) => {
                warn!("Instance {} failed to start: {}", instance.id, e);
                instance.transition(SandboxState::SetupFailed)?;
                return Err(e);
            }
        };
        instance.transition(SandboxState::Running)?;
        info!("Instance {} running as pid {}", instance.id, child.pid);

        let pid = child.pid;
        let stdout = spawn_fd_reader(child.stdout, self.output_limit, "stdout");
        let stderr = spawn_fd_reader(child.stderr, self.output_limit, "stderr");

        let termination = self.supervise(pid, started + timeout, cancel);

        signal_group(pid, Signal::SIGKILL);
        let reaped = match reap(pid) {
            Ok(reaped) => reaped,
            Err(e) => {
                instance.transition(SandboxState::Crashed)?;
                return Err(e);
            }
        };
        let wall_time = started.elapsed();

        let stdout = join_reader(stdout, "stdout");
        let stderr = join_reader(stderr, "stderr");

        let limits = instance.profile.limits().clone();
        let file_limit_hit = match instance.dir.as_ref() {
            Some(dir) => file_limit_reached(&[dir.workspace(), dir.temp()], limits.file_size_bytes),
            None => false,
        };
        let classification = classify(
            termination,
            reaped.exit,
            reaped.cpu_time,
            &limits,
            file_limit_hit,
            timeout,
        );
        instance.transition(classification.state)?;

        info!(
            "Instance {} finished: {} after {}ms",
            instance.id,
            classification.state,
            wall_time.as_millis()
        );

        let (exit_code, signal) = match reaped.exit {
            ChildExit::Exited(code) => (Some(code), None),
            ChildExit::Signaled(sig) => (None, Some(sig)),
        };

        Ok(RunOutcome {
            state: classification.state,
            error_kind: classification.error_kind,
            diagnostic: classification.diagnostic,
            exit_code,
            signal,
            stdout,
            stderr,
            wall_time,
            cpu_time: reaped.cpu_time,
        })
    }

    /// Poll until the child exits, escalating SIGTERM to SIGKILL once the
    /// deadline passes or cancellation is requested
    fn supervise(
        &self,
        pid: nix::unistd::Pid,
        deadline: Instant,
        cancel: Option<&CancellationToken>,
    ) -> Option<Termination> {
        let mut termination = None;
        let mut terminated_at: Option<Instant> = None;
        let mut killed = false;

        loop {
            match has_exited(pid) {
                Ok(true) => break,
                Ok(false) => {}
                Err(e) => {
                    warn!("Lost track of pid {}: {}", pid, e);
                    break;
                }
            }

            let now = Instant::now();
            match terminated_at {
                None => {
                    let reason = if cancel.is_some_and(|c| c.is_cancelled()) {
                        Some(Termination::Cancelled)
                    } else if now >= deadline {
                        Some(Termination::Timeout)
                    } else {
                        None
                    };
                    if let Some(reason) = reason {
                        debug!("Terminating pid {} ({:?})", pid, reason);
                        signal_group(pid, Signal::SIGTERM);
                        termination = Some(reason);
                        terminated_at = Some(now);
                    }
                }
                Some(at) if !killed && now >= at + self.grace_period => {
                    debug!("Grace period over, killing group {}", pid);
                    signal_group(pid, Signal::SIGKILL);
                    killed = true;
                }
                Some(_) => {}
            }

            thread::sleep(self.poll_interval);
        }

        termination
    }
}

/// Interpreter invocation for a staged entry script
pub fn launch_command(entry: &EntryPoint) -> ProcessConfig {
    let workspace = Path::new(WORKSPACE_MOUNT);
    let mut args = entry.interpreter_args.clone();
    args.push(workspace.join(ENTRY_FILE).to_string_lossy().into_owned());
    args.push(workspace.join(ARGS_FILE).to_string_lossy().into_owned());

    ProcessConfig {
        program: entry.interpreter.clone(),
        args,
        env: vec![
            ("PATH".to_string(), "/usr/local/bin:/usr/bin:/bin".to_string()),
            ("HOME".to_string(), WORKSPACE_MOUNT.to_string()),
            ("TMPDIR".to_string(), TEMP_MOUNT.to_string()),
            (
                "TOOL_ARGS".to_string(),
                workspace.join(ARGS_FILE).to_string_lossy().into_owned(),
            ),
            ("LANG".to_string(), "C.UTF-8".to_string()),
        ],
    }
}

/// Decide the terminal state for a finished process.
///
/// The tool runs as init of its pid namespace, where default-action
/// signals such as SIGXCPU and SIGXFSZ are not delivered. Limits then show
/// up as SIGKILL at the CPU hard limit, or as a failed exit after EFBIG.
/// RLIMIT_FSIZE sits one byte above the limit, so only a file longer than
/// the limit counts as hitting it.
pub fn classify(
    termination: Option<Termination>,
    exit: ChildExit,
    cpu_time: Duration,
    limits: &ResourceLimits,
    file_limit_hit: bool,
    timeout: Duration,
) -> Classification {
    let crashed = |kind: ErrorKind, diagnostic: String| Classification {
        state: SandboxState::Crashed,
        error_kind: Some(kind),
        diagnostic,
    };

    match termination {
        Some(Termination::Timeout) => {
            return Classification {
                state: SandboxState::TimedOut,
                error_kind: Some(ErrorKind::ExecutionTimeout),
                diagnostic: format!("timed out after {}s", timeout.as_secs_f64()),
            };
        }
        Some(Termination::Cancelled) => {
            return Classification {
                state: SandboxState::Cancelled,
                error_kind: Some(ErrorKind::Cancelled),
                diagnostic: "execution cancelled".to_string(),
            };
        }
        None => {}
    }

    let cpu_limit = Duration::from_secs(limits.cpu_time_secs);
    match exit {
        ChildExit::Exited(0) => Classification {
            state: SandboxState::Completed,
            error_kind: None,
            diagnostic: String::new(),
        },
        ChildExit::Exited(code) if file_limit_hit => crashed(
            ErrorKind::ResourceExhausted,
            format!(
                "exited with status {} after reaching the file size limit of {} bytes",
                code, limits.file_size_bytes
            ),
        ),
        ChildExit::Exited(code) => {
            crashed(ErrorKind::ExecutionCrash, format!("exited with status {}", code))
        }
        ChildExit::Signaled(libc::SIGXCPU) => crashed(
            ErrorKind::ResourceExhausted,
            format!("CPU time limit of {}s exceeded", limits.cpu_time_secs),
        ),
        ChildExit::Signaled(libc::SIGXFSZ) => crashed(
            ErrorKind::ResourceExhausted,
            format!("file size limit of {} bytes exceeded", limits.file_size_bytes),
        ),
        ChildExit::Signaled(libc::SIGKILL) if cpu_time >= cpu_limit => crashed(
            ErrorKind::ResourceExhausted,
            format!("CPU time limit of {}s exceeded", limits.cpu_time_secs),
        ),
        ChildExit::Signaled(libc::SIGSYS) => crashed(
            ErrorKind::ExecutionCrash,
            "killed by syscall filter (SIGSYS): the tool made a disallowed system call"
                .to_string(),
        ),
        ChildExit::Signaled(sig) => {
            let name = Signal::try_from(sig)
                .map(|s| s.as_str().to_string())
                .unwrap_or_else(|_| sig.to_string());
            crashed(ErrorKind::ExecutionCrash, format!("killed by signal {}", name))
        }
    }
}

fn file_limit_reached(dirs: &[&Path], limit: u64) -> bool {
    dirs.iter().any(|dir| {
        WalkDir::new(dir)
            .follow_links(false)
            .into_iter()
            .filter_map(|e| e.ok())
            .filter(|e| e.file_type().is_file())
            .any(|e| e.metadata().map(|m| m.len() > limit).unwrap_or(false))
    })
}

fn join_reader(handle: std::io::Result<thread::JoinHandle<BoundedBuffer>>, name: &str) -> String {
    match handle {
        Ok(handle) => match handle.join() {
            Ok(buffer) => buffer.into_string(),
            Err(_) => {
                warn!("{} reader panicked", name);
                String::new()
            }
        },
        Err(e) => {
            warn!("Could not start {} reader: {}", name, e);
            String::new()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::capability::Authorization;
    use crate::config::DefaultPolicy;
    use crate::profile::SandboxConfigBuilder;
    use crate::registry::ToolManifest;
    use crate::request::ExecutionRequest;
    use std::path::PathBuf;

    fn limits() -> ResourceLimits {
        ResourceLimits::default()
    }

    fn entry() -> EntryPoint {
        EntryPoint {
            interpreter: PathBuf::from("/bin/sh"),
            interpreter_args: vec!["-e".to_string()],
            script: PathBuf::from("/opt/tools/t.sh"),
        }
    }

    fn profile() -> SandboxProfile {
        let policy = DefaultPolicy::default();
        let manifest = ToolManifest::plugin("t", entry());
        let request = ExecutionRequest::new("t", "alice", Map::new());
        let auth = Authorization::for_testing("alice", &[]);
        SandboxConfigBuilder::new(&policy)
            .build(&manifest, &request, &auth)
            .unwrap()
    }

    fn run_classify(termination: Option<Termination>, exit: ChildExit) -> Classification {
        classify(
            termination,
            exit,
            Duration::ZERO,
            &limits(),
            false,
            Duration::from_secs(1),
        )
    }

    #[test]
    fn clean_exit_completes() {
        let c = run_classify(None, ChildExit::Exited(0));
        assert_eq!(c.state, SandboxState::Completed);
        assert!(c.error_kind.is_none());
    }

    #[test]
    fn timeout_wins_over_exit_status() {
        let c = run_classify(Some(Termination::Timeout), ChildExit::Signaled(libc::SIGTERM));
        assert_eq!(c.state, SandboxState::TimedOut);
        assert_eq!(c.error_kind, Some(ErrorKind::ExecutionTimeout));

        let c = run_classify(Some(Termination::Timeout), ChildExit::Exited(0));
        assert_eq!(c.state, SandboxState::TimedOut);
    }

    #[test]
    fn cancellation_is_its_own_outcome() {
        let c = run_classify(Some(Termination::Cancelled), ChildExit::Signaled(libc::SIGKILL));
        assert_eq!(c.state, SandboxState::Cancelled);
        assert_eq!(c.error_kind, Some(ErrorKind::Cancelled));
    }

    #[test]
    fn nonzero_exit_is_a_crash() {
        let c = run_classify(None, ChildExit::Exited(3));
        assert_eq!(c.state, SandboxState::Crashed);
        assert_eq!(c.error_kind, Some(ErrorKind::ExecutionCrash));
        assert!(c.diagnostic.contains('3'));
    }

    #[test]
    fn seccomp_kill_is_named() {
        let c = run_classify(None, ChildExit::Signaled(libc::SIGSYS));
        assert_eq!(c.error_kind, Some(ErrorKind::ExecutionCrash));
        assert!(c.diagnostic.contains("syscall filter"));
    }

    #[test]
    fn limit_signals_are_resource_exhaustion() {
        for sig in [libc::SIGXCPU, libc::SIGXFSZ] {
            let c = run_classify(None, ChildExit::Signaled(sig));
            assert_eq!(c.error_kind, Some(ErrorKind::ResourceExhausted));
        }
    }

    #[test]
    fn sigkill_at_cpu_limit_is_resource_exhaustion() {
        let limits = limits();
        let spent = Duration::from_secs(limits.cpu_time_secs);
        let c = classify(
            None,
            ChildExit::Signaled(libc::SIGKILL),
            spent,
            &limits,
            false,
            Duration::from_secs(60),
        );
        assert_eq!(c.error_kind, Some(ErrorKind::ResourceExhausted));

        let c = run_classify(None, ChildExit::Signaled(libc::SIGKILL));
        assert_eq!(c.error_kind, Some(ErrorKind::ExecutionCrash));
        assert!(c.diagnostic.contains("SIGKILL"));
    }

    #[test]
    fn failed_exit_after_file_limit_is_resource_exhaustion() {
        let c = classify(
            None,
            ChildExit::Exited(1),
            Duration::ZERO,
            &limits(),
            true,
            Duration::from_secs(1),
        );
        assert_eq!(c.error_kind, Some(ErrorKind::ResourceExhausted));
    }

    #[test]
    fn launch_command_runs_staged_entry() {
        let cmd = launch_command(&entry());
        assert_eq!(cmd.program, PathBuf::from("/bin/sh"));
        assert_eq!(
            cmd.args,
            vec!["-e", "/workspace/.tool_entry", "/workspace/.tool_args.json"]
        );
        assert!(cmd.env.iter().any(|(k, v)| k == "HOME" && v == "/workspace"));
        assert!(!cmd.env.iter().any(|(k, _)| k == "USER"));
    }

    #[test]
    fn instance_lifecycle_and_cleanup() {
        let base = tempfile::tempdir().unwrap();
        let mut instance = SandboxInstance::create(base.path(), profile()).unwrap();
        assert_eq!(instance.state(), SandboxState::Created);
        let workspace = instance.workspace().unwrap().to_path_buf();
        assert!(workspace.is_dir());

        assert!(instance.transition(SandboxState::Running).is_err());
        instance.transition(SandboxState::SetupFailed).unwrap();
        instance.cleanup().unwrap();
        assert_eq!(instance.state(), SandboxState::Cleaned);
        assert!(!workspace.exists());
        // Idempotent
        instance.cleanup().unwrap();
    }

    #[test]
    fn instances_get_distinct_ids_and_trees() {
        let base = tempfile::tempdir().unwrap();
        let a = SandboxInstance::create(base.path(), profile()).unwrap();
        let b = SandboxInstance::create(base.path(), profile()).unwrap();
        assert_ne!(a.id(), b.id());
        assert_ne!(a.workspace(), b.workspace());
    }

    #[test]
    fn drop_removes_tree() {
        let base = tempfile::tempdir().unwrap();
        let instance = SandboxInstance::create(base.path(), profile()).unwrap();
        let workspace = instance.workspace().unwrap().to_path_buf();
        drop(instance);
        assert!(!workspace.exists());
    }

    #[test]
    fn prepare_with_missing_script_fails_setup() {
        let base = tempfile::tempdir().unwrap();
        let executor = SandboxExecutor::new(&EngineConfig::default());
        let mut instance = SandboxInstance::create(base.path(), profile()).unwrap();
        let err = executor
            .prepare(&mut instance, &entry(), &Map::new())
            .err()
            .unwrap();
        assert_eq!(err.kind(), ErrorKind::SetupFailure);
        assert_eq!(instance.state(), SandboxState::SetupFailed);
    }

    #[test]
    fn run_requires_prepared_instance() {
        let base = tempfile::tempdir().unwrap();
        let script = base.path().join("t.sh");
        std::fs::write(&script, "exit 0\n").unwrap();
        let entry = EntryPoint {
            script,
            ..entry()
        };
        let executor = SandboxExecutor::new(&EngineConfig::default());
        let mut instance = SandboxInstance::create(base.path(), profile()).unwrap();
        let launch = executor.prepare(&mut instance, &entry, &Map::new()).unwrap();
        assert_eq!(instance.state(), SandboxState::Prepared);
        assert_eq!(launch.process().args.len(), 3);

        instance.transition(SandboxState::SetupFailed).unwrap();
        assert!(matches!(
            executor.run(&mut instance, &launch, Duration::from_secs(1), None),
            Err(SandboxError::InvalidState(_))
        ));
    }

    #[test]
    fn file_limit_detection() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("small"), vec![0u8; 10]).unwrap();
        assert!(!file_limit_reached(&[dir.path()], 100));
        // Exactly at the limit is a legitimate write
        std::fs::write(dir.path().join("full"), vec![0u8; 100]).unwrap();
        assert!(!file_limit_reached(&[dir.path()], 100));
        std::fs::write(dir.path().join("big"), vec![0u8; 101]).unwrap();
        assert!(file_limit_reached(&[dir.path()], 100));
    }
}
