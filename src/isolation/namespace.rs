//! Namespace management for sandbox isolation

use nix::sched::CloneFlags;
use nix::unistd::Pid;
use serde::{Deserialize, Serialize};
use std::fs;

use crate::errors::{Result, SandboxError};

/// Namespaces unshared for one instance.
///
/// A user namespace is always created on top of these so the rest can be
/// set up without host privileges.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct NamespaceConfig {
    pub network: bool,
    pub mount: bool,
    pub pid: bool,
    pub ipc: bool,
    pub uts: bool,
}

impl Default for NamespaceConfig {
    fn default() -> Self {
        Self::isolated()
    }
}

impl NamespaceConfig {
    /// Every namespace private, network disconnected
    pub fn isolated() -> Self {
        Self {
            network: true,
            mount: true,
            pid: true,
            ipc: true,
            uts: true,
        }
    }

    /// Same as [`isolated`](Self::isolated) but sharing the host network stack
    pub fn with_host_network(mut self) -> Self {
        self.network = false;
        self
    }

    /// Convert to clone flags, user namespace included
    pub fn to_clone_flags(&self) -> CloneFlags {
        let mut flags = CloneFlags::CLONE_NEWUSER;
        if self.network {
            flags |= CloneFlags::CLONE_NEWNET;
        }
        if self.mount {
            flags |= CloneFlags::CLONE_NEWNS;
        }
        if self.pid {
            flags |= CloneFlags::CLONE_NEWPID;
        }
        if self.ipc {
            flags |= CloneFlags::CLONE_NEWIPC;
        }
        if self.uts {
            flags |= CloneFlags::CLONE_NEWUTS;
        }
        flags
    }

    pub fn enabled_count(&self) -> usize {
        [self.network, self.mount, self.pid, self.ipc, self.uts]
            .iter()
            .filter(|&&x| x)
            .count()
    }
}

/// One-entry uid/gid mapping for a child's user namespace
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct IdMapping {
    pub inside_uid: u32,
    pub outside_uid: u32,
    pub inside_gid: u32,
    pub outside_gid: u32,
    /// Supplementary groups can be cleared in the child. Only a privileged
    /// parent may leave setgroups(2) enabled while writing gid_map.
    pub drop_groups: bool,
}

impl IdMapping {
    /// Map the run-as identity onto the calling user.
    ///
    /// An unprivileged caller can only map its own ids. Root maps the
    /// run-as identity onto itself so the tool never holds host uid 0.
    pub fn for_run_as(uid: u32, gid: u32, host_root: bool) -> Self {
        if host_root {
            Self {
                inside_uid: uid,
                outside_uid: uid,
                inside_gid: gid,
                outside_gid: gid,
                drop_groups: true,
            }
        } else {
            Self {
                inside_uid: uid,
                outside_uid: crate::utils::get_uid(),
                inside_gid: gid,
                outside_gid: crate::utils::get_gid(),
                drop_groups: false,
            }
        }
    }

    fn uid_map(&self) -> String {
        format!("{} {} 1\n", self.inside_uid, self.outside_uid)
    }

    fn gid_map(&self) -> String {
        format!("{} {} 1\n", self.inside_gid, self.outside_gid)
    }
}

/// Write uid_map, setgroups and gid_map for `child_pid`.
///
/// Must run in the parent while the child is parked on its sync pipe.
pub fn setup_user_namespace(child_pid: Pid, mapping: &IdMapping) -> Result<()> {
    let pid = child_pid.as_raw();

    fs::write(format!("/proc/{}/uid_map", pid), mapping.uid_map()).map_err(|e| {
        SandboxError::Namespace(format!("Failed to write uid_map for pid {}: {}", pid, e))
    })?;

    // Required before an unprivileged gid_map write
    if !mapping.drop_groups {
        fs::write(format!("/proc/{}/setgroups", pid), "deny\n").map_err(|e| {
            SandboxError::Namespace(format!("Failed to write setgroups for pid {}: {}", pid, e))
        })?;
    }

    fs::write(format!("/proc/{}/gid_map", pid), mapping.gid_map()).map_err(|e| {
        SandboxError::Namespace(format!("Failed to write gid_map for pid {}: {}", pid, e))
    })?;

    Ok(())
}
