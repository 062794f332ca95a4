//! Process spawning inside fresh namespaces
//!
//! The child is created with `clone(2)`, parked on a sync pipe until the
//! parent has written its uid/gid maps, then walks a setup sequence built
//! entirely in the parent:
//!
//! 1. `setsid` and parent-death signal
//! 2. stdio wiring (stdin from `/dev/null`)
//! 3. bind mounts, read-only remounts, `chroot`
//! 4. hostname
//! 5. switch to the run-as uid/gid
//! 6. resource limits
//! 7. seccomp filter (last, irreversible)
//! 8. `execve`
//!
//! Nothing in the child allocates. A failed step is written to the
//! close-on-exec status pipe and the child exits with 127.

use log::{debug, warn};
use nix::errno::Errno;
use nix::fcntl::OFlag;
use nix::sched::clone;
use nix::sys::signal::{Signal, kill, killpg};
use nix::unistd::{Pid, pipe2};
use seccompiler::BpfProgram;
use std::ffi::CString;
use std::os::fd::{AsFd, AsRawFd, OwnedFd, RawFd};
use std::os::unix::ffi::OsStrExt;
use std::path::PathBuf;
use std::time::Duration;

use super::status::{ChildFault, ExecReport};
use crate::errors::{Result, SandboxError};
use crate::isolation::{IdMapping, NamespaceConfig, seccomp_bpf, setup_user_namespace};
use crate::resources::RlimitConfig;
use crate::storage::MountPlan;

const CHILD_STACK_SIZE: usize = 128 * 1024;

/// What to execute once the sandbox is in place
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ProcessConfig {
    /// Program path as seen inside the sandbox
    pub program: PathBuf,
    /// Arguments after argv[0]
    pub args: Vec<String>,
    /// Complete environment; nothing is inherited from the engine
    pub env: Vec<(String, String)>,
}

/// Everything the child needs, resolved before clone
pub struct SpawnPlan<'a> {
    pub process: &'a ProcessConfig,
    pub namespaces: NamespaceConfig,
    pub mapping: IdMapping,
    pub mounts: &'a MountPlan,
    pub hostname: &'a str,
    pub rlimits: RlimitConfig,
    pub filter: &'a BpfProgram,
}

/// A child that has passed its setup and exec'd the tool program
#[derive(Debug)]
pub struct SpawnedChild {
    pub pid: Pid,
    pub stdout: OwnedFd,
    pub stderr: OwnedFd,
}

/// Pointers into owned CStrings, ready for execve
struct ExecArgs {
    _storage: Vec<CString>,
    program: *const libc::c_char,
    argv: Vec<*const libc::c_char>,
    envp: Vec<*const libc::c_char>,
}

impl ExecArgs {
    fn new(process: &ProcessConfig) -> Result<Self> {
        let to_cstring = |value: &[u8]| {
            CString::new(value)
                .map_err(|_| SandboxError::InvalidArguments("argument contains NUL".to_string()))
        };

        let program = to_cstring(process.program.as_os_str().as_bytes())?;
        let mut storage = vec![program];
        for arg in &process.args {
            storage.push(to_cstring(arg.as_bytes())?);
        }
        let argc = storage.len();
        for (key, value) in &process.env {
            storage.push(to_cstring(format!("{}={}", key, value).as_bytes())?);
        }

        let mut argv: Vec<*const libc::c_char> =
            storage[..argc].iter().map(|s| s.as_ptr()).collect();
        argv.push(std::ptr::null());
        let mut envp: Vec<*const libc::c_char> =
            storage[argc..].iter().map(|s| s.as_ptr()).collect();
        envp.push(std::ptr::null());

        Ok(Self {
            program: storage[0].as_ptr(),
            _storage: storage,
            argv,
            envp,
        })
    }
}

struct ChildFds {
    sync_read: RawFd,
    sync_write: RawFd,
    stdout: RawFd,
    stderr: RawFd,
    status: RawFd,
}

fn pipe_cloexec() -> Result<(OwnedFd, OwnedFd)> {
    pipe2(OFlag::O_CLOEXEC).map_err(|e| SandboxError::Syscall(format!("pipe2: {}", e)))
}

/// Clone the child, map its ids, release it and wait for the exec report.
///
/// Returns only once the tool program is running. A setup failure inside the
/// child is reaped here and returned as [`SandboxError::ChildSetup`].
pub fn spawn(plan: &SpawnPlan<'_>) -> Result<SpawnedChild> {
    let exec = ExecArgs::new(plan.process)?;
    let hostname = CString::new(plan.hostname)
        .map_err(|_| SandboxError::InvalidConfig("hostname contains NUL".to_string()))?;

    let (sync_read, sync_write) = pipe_cloexec()?;
    let (stdout_read, stdout_write) = pipe_cloexec()?;
    let (stderr_read, stderr_write) = pipe_cloexec()?;
    let (status_read, status_write) = pipe_cloexec()?;

    let fds = ChildFds {
        sync_read: sync_read.as_raw_fd(),
        sync_write: sync_write.as_raw_fd(),
        stdout: stdout_write.as_raw_fd(),
        stderr: stderr_write.as_raw_fd(),
        status: status_write.as_raw_fd(),
    };
    let set_hostname = plan.namespaces.uts;

    let mut stack = vec![0u8; CHILD_STACK_SIZE];
    let child_fn = Box::new(|| -> isize {
        let fault = child_setup(plan, &exec, &hostname, set_hostname, &fds);
        // SAFETY: status fd is open in the child until exec
        fault.report(unsafe { std::os::fd::BorrowedFd::borrow_raw(fds.status) });
        unsafe { libc::_exit(127) }
    });

    // SAFETY: the child runs only allocation-free code before execve or _exit
    let pid = unsafe {
        clone(
            child_fn,
            &mut stack,
            plan.namespaces.to_clone_flags(),
            Some(Signal::SIGCHLD as i32),
        )
    }
    .map_err(|e| SandboxError::Namespace(format!("clone failed: {}", e)))?;

    drop(sync_read);
    drop(stdout_write);
    drop(stderr_write);
    drop(status_write);

    if let Err(e) = setup_user_namespace(pid, &plan.mapping) {
        warn!("User namespace setup for pid {} failed: {}", pid, e);
        // Closing the sync pipe without a byte makes the child exit
        drop(sync_write);
        let _ = kill(pid, Signal::SIGKILL);
        reap_quietly(pid);
        return Err(e);
    }

    let released = nix::unistd::write(sync_write.as_fd(), &[1u8]);
    drop(sync_write);
    if let Err(e) = released {
        let _ = kill(pid, Signal::SIGKILL);
        reap_quietly(pid);
        return Err(SandboxError::Syscall(format!("release child: {}", e)));
    }

    let report = ExecReport::read_from(std::fs::File::from(status_read))?;
    if let Some(err) = report.into_error() {
        debug!("Child {} failed setup: {}", pid, err);
        reap_quietly(pid);
        return Err(err);
    }

    debug!("Child {} exec'd {}", pid, plan.process.program.display());
    Ok(SpawnedChild {
        pid,
        stdout: stdout_read,
        stderr: stderr_read,
    })
}

/// Child side. Returns only on failure; success ends in execve.
fn child_setup(
    plan: &SpawnPlan<'_>,
    exec: &ExecArgs,
    hostname: &CString,
    set_hostname: bool,
    fds: &ChildFds,
) -> ChildFault {
    // SAFETY: raw syscalls on descriptors and buffers prepared by the parent
    unsafe {
        libc::close(fds.sync_write);
        let mut byte = [0u8; 1];
        if libc::read(fds.sync_read, byte.as_mut_ptr() as *mut libc::c_void, 1) != 1 {
            return ChildFault::new("sync", libc::ECANCELED);
        }
        libc::close(fds.sync_read);

        if libc::setsid() < 0 {
            return ChildFault::last_os_error("setsid");
        }
        if libc::prctl(libc::PR_SET_PDEATHSIG, libc::SIGKILL, 0, 0, 0) != 0 {
            return ChildFault::last_os_error("prctl(PR_SET_PDEATHSIG)");
        }

        let null = libc::open(c"/dev/null".as_ptr(), libc::O_RDONLY);
        if null < 0 {
            return ChildFault::last_os_error("open(/dev/null)");
        }
        if libc::dup2(null, 0) < 0 || libc::dup2(fds.stdout, 1) < 0 || libc::dup2(fds.stderr, 2) < 0
        {
            return ChildFault::last_os_error("dup2");
        }
        libc::close(null);
    }

    if let Err(fault) = plan.mounts.apply_in_child() {
        return fault;
    }

    if set_hostname {
        let bytes = hostname.as_bytes();
        // SAFETY: bytes outlives the call
        if unsafe { libc::sethostname(bytes.as_ptr() as *const libc::c_char, bytes.len()) } != 0 {
            return ChildFault::last_os_error("sethostname");
        }
    }

    if let Err(fault) = assume_identity(&plan.mapping) {
        return fault;
    }

    if let Err(fault) = plan.rlimits.apply_in_child() {
        return fault;
    }

    if let Err(errno) = seccomp_bpf::install(plan.filter) {
        return ChildFault::new("seccomp", errno);
    }

    // SAFETY: argv and envp are NUL-terminated arrays of valid C strings
    unsafe {
        libc::execve(exec.program, exec.argv.as_ptr(), exec.envp.as_ptr());
    }
    ChildFault::last_os_error("execve")
}

/// Take on the mapped run-as ids inside the user namespace.
///
/// Must run before the resource limits: RLIMIT_NPROC is checked against
/// the uid in force at setresuid time.
fn assume_identity(mapping: &IdMapping) -> std::result::Result<(), ChildFault> {
    let uid = mapping.inside_uid as libc::uid_t;
    let gid = mapping.inside_gid as libc::gid_t;
    // SAFETY: plain credential syscalls, no pointers except the empty list
    unsafe {
        if mapping.drop_groups && libc::setgroups(0, std::ptr::null()) != 0 {
            return Err(ChildFault::last_os_error("setgroups"));
        }
        if libc::setresgid(gid, gid, gid) != 0 {
            return Err(ChildFault::last_os_error("setresgid"));
        }
        if libc::setresuid(uid, uid, uid) != 0 {
            return Err(ChildFault::last_os_error("setresuid"));
        }
        // Credential changes clear the parent-death signal
        if libc::prctl(libc::PR_SET_PDEATHSIG, libc::SIGKILL, 0, 0, 0) != 0 {
            return Err(ChildFault::last_os_error("prctl(PR_SET_PDEATHSIG)"));
        }
    }
    Ok(())
}

/// How the tool's top process ended
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChildExit {
    Exited(i32),
    Signaled(i32),
}

/// Exit status and accumulated CPU time of a reaped child
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Reaped {
    pub exit: ChildExit,
    pub cpu_time: Duration,
}

/// Non-blocking check for exit. Leaves the zombie in place so its pid,
/// and with it the process group, stays reserved.
pub fn has_exited(pid: Pid) -> Result<bool> {
    // SAFETY: zeroed siginfo is a valid out-parameter for waitid
    let mut info: libc::siginfo_t = unsafe { std::mem::zeroed() };
    loop {
        let ret = unsafe {
            libc::waitid(
                libc::P_PID,
                pid.as_raw() as libc::id_t,
                &mut info,
                libc::WEXITED | libc::WNOHANG | libc::WNOWAIT,
            )
        };
        if ret == 0 {
            // SAFETY: si_pid is filled in for child state changes
            return Ok(unsafe { info.si_pid() } != 0);
        }
        let err = std::io::Error::last_os_error();
        if err.raw_os_error() != Some(libc::EINTR) {
            return Err(SandboxError::Syscall(format!("waitid({}): {}", pid, err)));
        }
    }
}

/// Send `signal` to every process in the child's group
pub fn signal_group(pid: Pid, signal: Signal) {
    if let Err(e) = killpg(pid, signal) {
        if e != Errno::ESRCH {
            warn!("killpg({}, {}) failed: {}", pid, signal, e);
        }
    }
}

/// Reap the child, blocking, and collect its CPU time
pub fn reap(pid: Pid) -> Result<Reaped> {
    let mut status = 0;
    // SAFETY: zeroed rusage is a valid out-parameter for wait4
    let mut usage: libc::rusage = unsafe { std::mem::zeroed() };
    loop {
        let ret = unsafe { libc::wait4(pid.as_raw(), &mut status, 0, &mut usage) };
        if ret == pid.as_raw() {
            break;
        }
        let err = std::io::Error::last_os_error();
        if err.raw_os_error() != Some(libc::EINTR) {
            return Err(SandboxError::Syscall(format!("wait4({}): {}", pid, err)));
        }
    }

    let exit = if libc::WIFSIGNALED(status) {
        ChildExit::Signaled(libc::WTERMSIG(status))
    } else {
        ChildExit::Exited(libc::WEXITSTATUS(status))
    };
    Ok(Reaped {
        exit,
        cpu_time: timeval_to_duration(usage.ru_utime) + timeval_to_duration(usage.ru_stime),
    })
}

fn timeval_to_duration(tv: libc::timeval) -> Duration {
    Duration::from_secs(tv.tv_sec.max(0) as u64) + Duration::from_micros(tv.tv_usec.max(0) as u64)
}

fn reap_quietly(pid: Pid) {
    let mut status = 0;
    loop {
        // SAFETY: waiting on our own child
        let ret = unsafe { libc::waitpid(pid.as_raw(), &mut status, 0) };
        if ret >= 0 || std::io::Error::last_os_error().raw_os_error() != Some(libc::EINTR) {
            break;
        }
    }
}
