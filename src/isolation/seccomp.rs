//! Default-deny syscall allowlists

use std::collections::BTreeSet;

use super::syscall_table::syscall_number;
use crate::errors::{Result, SandboxError};

/// Syscalls that no grant can ever add
pub const HARD_DENY: &[&str] = &[
    "ptrace",
    "process_vm_readv",
    "process_vm_writev",
    "perf_event_open",
    "bpf",
    "seccomp",
    "mount",
    "umount2",
    "pivot_root",
    "chroot",
    "setns",
    "unshare",
    "reboot",
    "swapon",
    "swapoff",
    "kexec_load",
    "init_module",
    "finit_module",
    "delete_module",
    "keyctl",
    "add_key",
    "request_key",
    "userfaultfd",
    "open_by_handle_at",
    "name_to_handle_at",
    "quotactl",
    "acct",
    "settimeofday",
    "clock_settime",
    "adjtimex",
    "capset",
    "iopl",
    "ioperm",
];

/// Process bootstrap: dynamic linker, libc init, exit
const ESSENTIAL: &[&str] = &[
    "exit",
    "exit_group",
    "execve",
    "execveat",
    "brk",
    "mmap",
    "munmap",
    "mprotect",
    "madvise",
    "openat",
    "open",
    "read",
    "write",
    "close",
    "close_range",
    "fstat",
    "stat",
    "lstat",
    "newfstatat",
    "statx",
    "access",
    "faccessat",
    "faccessat2",
    "lseek",
    "readlink",
    "readlinkat",
    "arch_prctl",
    "set_tid_address",
    "set_robust_list",
    "futex",
    "getrandom",
    "rseq",
    "prlimit64",
    "prctl",
    "getcwd",
    "getpid",
    "gettid",
    "getuid",
    "geteuid",
    "getgid",
    "getegid",
    "fcntl",
];

/// What an interpreter needs once running. No signal delivery to other
/// processes and no process creation.
const RUNTIME: &[&str] = &[
    "rt_sigaction",
    "rt_sigprocmask",
    "rt_sigpending",
    "rt_sigtimedwait",
    "rt_sigsuspend",
    "rt_sigreturn",
    "sigaltstack",
    "wait4",
    "waitid",
    "readv",
    "writev",
    "pread64",
    "pwrite64",
    "ioctl",
    "flock",
    "dup",
    "dup2",
    "dup3",
    "pipe",
    "pipe2",
    "eventfd2",
    "clock_gettime",
    "clock_getres",
    "gettimeofday",
    "time",
    "nanosleep",
    "clock_nanosleep",
    "timer_create",
    "timer_settime",
    "timer_gettime",
    "timer_getoverrun",
    "timer_delete",
    "getppid",
    "getresuid",
    "getresgid",
    "getgroups",
    "uname",
    "umask",
    "sysinfo",
    "getpgrp",
    "getpgid",
    "getsid",
    "sched_getaffinity",
    "sched_yield",
    "getrlimit",
    "getrusage",
    "pselect6",
    "ppoll",
    "epoll_create1",
    "epoll_ctl",
    "epoll_wait",
    "epoll_pwait",
    "poll",
    "select",
    "chdir",
    "fchdir",
    "getdents",
    "getdents64",
    "mremap",
    "memfd_create",
    "get_robust_list",
];

/// File manipulation inside the writable areas
const FILE_IO: &[&str] = &[
    "mkdir",
    "mkdirat",
    "rmdir",
    "unlink",
    "unlinkat",
    "rename",
    "renameat",
    "link",
    "linkat",
    "symlink",
    "symlinkat",
    "creat",
    "chmod",
    "fchmod",
    "fchmodat",
    "utimes",
    "utimensat",
    "truncate",
    "ftruncate",
    "fallocate",
    "sendfile",
    "splice",
    "tee",
    "statfs",
    "fstatfs",
    "fsync",
    "fdatasync",
];

/// Socket calls added by the network grant
pub const NETWORK: &[&str] = &[
    "socket",
    "socketpair",
    "bind",
    "listen",
    "accept",
    "accept4",
    "connect",
    "shutdown",
    "sendto",
    "recvfrom",
    "sendmsg",
    "recvmsg",
    "sendmmsg",
    "recvmmsg",
    "setsockopt",
    "getsockopt",
    "getsockname",
    "getpeername",
];

/// Allowlist for one instance. Anything not listed kills the process.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SyscallFilter {
    allowed: BTreeSet<String>,
}

impl SyscallFilter {
    /// Minimal allowlist sufficient to run an interpreter over a script.
    ///
    /// Names that do not exist on the build architecture are left out.
    pub fn baseline() -> Self {
        let allowed = ESSENTIAL
            .iter()
            .chain(RUNTIME)
            .chain(FILE_IO)
            .filter(|name| syscall_number(name).is_some())
            .map(|name| name.to_string())
            .collect();
        Self { allowed }
    }

    /// Add one syscall. Hard-denied and unknown names are refused.
    pub fn allow(&mut self, name: &str) -> Result<()> {
        if HARD_DENY.contains(&name) {
            return Err(SandboxError::Seccomp(format!(
                "Syscall '{}' can never be granted",
                name
            )));
        }
        if syscall_number(name).is_none() {
            return Err(SandboxError::Seccomp(format!(
                "Unknown syscall '{}' on this architecture",
                name
            )));
        }
        self.allowed.insert(name.to_string());
        Ok(())
    }

    /// Add the socket family
    pub fn allow_network(&mut self) -> Result<()> {
        for name in NETWORK {
            self.allow(name)?;
        }
        Ok(())
    }

    pub fn is_allowed(&self, name: &str) -> bool {
        self.allowed.contains(name)
    }

    pub fn allowed_syscalls(&self) -> &BTreeSet<String> {
        &self.allowed
    }

    pub fn allowed_count(&self) -> usize {
        self.allowed.len()
    }

    /// Check the allowlist still honors default-deny
    pub fn validate(&self) -> Result<()> {
        if self.allowed.is_empty() {
            return Err(SandboxError::Seccomp(
                "Filter has no allowed syscalls".to_string(),
            ));
        }
        if let Some(name) = HARD_DENY.iter().find(|name| self.allowed.contains(**name)) {
            return Err(SandboxError::Seccomp(format!(
                "Filter allows hard-denied syscall '{}'",
                name
            )));
        }
        Ok(())
    }
}
