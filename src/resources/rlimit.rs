//! setrlimit-based resource limits (no privileges needed)
//!
//! Limits are applied inside the cloned child right before the syscall
//! filter is installed, so they are already in force when the tool starts.

use crate::config::ResourceLimits;
use crate::execution::status::ChildFault;

/// Resource limits applied with setrlimit
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RlimitConfig {
    /// Maximum address space size in bytes (RLIMIT_AS)
    pub max_memory: u64,
    /// CPU seconds before SIGXCPU (RLIMIT_CPU soft limit)
    pub max_cpu_seconds: u64,
    /// Maximum number of processes (RLIMIT_NPROC)
    pub max_processes: u64,
    /// Maximum file size in bytes (RLIMIT_FSIZE)
    pub max_file_size: u64,
    /// Maximum number of open files (RLIMIT_NOFILE)
    pub max_open_files: u64,
}

impl From<&ResourceLimits> for RlimitConfig {
    fn from(limits: &ResourceLimits) -> Self {
        Self {
            max_memory: limits.address_space_bytes,
            max_cpu_seconds: limits.cpu_time_secs,
            max_processes: limits.max_processes,
            max_file_size: limits.file_size_bytes,
            max_open_files: limits.max_open_files,
        }
    }
}

impl RlimitConfig {
    /// Apply limits to the calling process.
    ///
    /// Allocation-free so it is safe between clone and execve.
    pub fn apply_in_child(&self) -> std::result::Result<(), ChildFault> {
        set_rlimit(libc::RLIMIT_AS, self.max_memory, self.max_memory)
            .map_err(|errno| ChildFault::new("setrlimit(RLIMIT_AS)", errno))?;
        // Hard limit one second past the soft limit so SIGXCPU comes first
        set_rlimit(
            libc::RLIMIT_CPU,
            self.max_cpu_seconds,
            self.max_cpu_seconds.saturating_add(1),
        )
        .map_err(|errno| ChildFault::new("setrlimit(RLIMIT_CPU)", errno))?;
        set_rlimit(libc::RLIMIT_NPROC, self.max_processes, self.max_processes)
            .map_err(|errno| ChildFault::new("setrlimit(RLIMIT_NPROC)", errno))?;
        // One byte past the limit so a file longer than the limit shows the
        // tool ran into it
        let fsize = self.max_file_size.saturating_add(1);
        set_rlimit(libc::RLIMIT_FSIZE, fsize, fsize)
            .map_err(|errno| ChildFault::new("setrlimit(RLIMIT_FSIZE)", errno))?;
        set_rlimit(libc::RLIMIT_NOFILE, self.max_open_files, self.max_open_files)
            .map_err(|errno| ChildFault::new("setrlimit(RLIMIT_NOFILE)", errno))?;
        Ok(())
    }
}

fn set_rlimit(
    resource: libc::__rlimit_resource_t,
    soft: u64,
    hard: u64,
) -> std::result::Result<(), i32> {
    let rlim = libc::rlimit {
        rlim_cur: soft,
        rlim_max: hard,
    };

    // SAFETY: rlim is a valid rlimit struct on the stack
    let ret = unsafe { libc::setrlimit(resource, &rlim) };
    if ret != 0 {
        return Err(std::io::Error::last_os_error()
            .raw_os_error()
            .unwrap_or(libc::EINVAL));
    }
    Ok(())
}
