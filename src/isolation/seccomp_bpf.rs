//! Seccomp BPF filter compilation and loading using seccompiler

use seccompiler::{BpfProgram, SeccompAction, SeccompFilter, TargetArch, apply_filter};
use std::collections::BTreeMap;
use std::convert::TryInto;

use super::seccomp::SyscallFilter;
use super::syscall_table::syscall_number;
use crate::errors::{Result, SandboxError};

#[cfg(target_arch = "x86_64")]
const TARGET_ARCH: TargetArch = TargetArch::x86_64;
#[cfg(target_arch = "aarch64")]
const TARGET_ARCH: TargetArch = TargetArch::aarch64;

/// Compile an allowlist into a kill-on-mismatch BPF program.
///
/// Runs in the parent so the child only has to install the result.
pub fn compile(filter: &SyscallFilter) -> Result<BpfProgram> {
    filter.validate()?;

    let mut rules: BTreeMap<i64, Vec<seccompiler::SeccompRule>> = BTreeMap::new();
    for name in filter.allowed_syscalls() {
        match syscall_number(name) {
            Some(nr) => {
                rules.entry(nr).or_default();
            }
            None => {
                return Err(SandboxError::Seccomp(format!(
                    "Unknown syscall to allow: '{}'",
                    name
                )));
            }
        }
    }

    let compiled = SeccompFilter::new(
        rules,
        SeccompAction::KillProcess,
        SeccompAction::Allow,
        TARGET_ARCH,
    )
    .map_err(|e| SandboxError::Seccomp(format!("Failed to create filter: {}", e)))?;

    compiled
        .try_into()
        .map_err(|e| SandboxError::Seccomp(format!("Failed to compile filter: {}", e)))
}

/// Set `PR_SET_NO_NEW_PRIVS` and install `program` on the calling thread.
///
/// Returns the raw errno on failure; called in the cloned child where
/// nothing may allocate.
pub fn install(program: &BpfProgram) -> std::result::Result<(), i32> {
    // SAFETY: prctl with constant arguments
    if unsafe { libc::prctl(libc::PR_SET_NO_NEW_PRIVS, 1, 0, 0, 0) } != 0 {
        return Err(last_errno());
    }
    apply_filter(program).map_err(|_| last_errno())
}

fn last_errno() -> i32 {
    std::io::Error::last_os_error()
        .raw_os_error()
        .unwrap_or(libc::EINVAL)
}
