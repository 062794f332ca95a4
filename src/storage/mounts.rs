//! Bind-mount plan for an instance root
//!
//! The parent resolves every path and flag up front; the child only walks
//! the prepared list with raw `mount(2)` calls before `chroot`. The instance
//! root is bound onto itself and ends up read-only, so the workspace and
//! temp binds are the only writable places.

use log::debug;
use nix::sys::statvfs::{FsFlags, statvfs};
use std::ffi::CString;
use std::fs;
use std::os::unix::ffi::OsStrExt;
use std::path::{Path, PathBuf};

use crate::errors::{Result, SandboxError};
use crate::execution::status::ChildFault;
use crate::profile::{MountSource, SandboxProfile, WORKSPACE_MOUNT};
use crate::storage::workspace::InstanceDir;

#[derive(Debug)]
struct PreparedMount {
    source: CString,
    target: CString,
    remount_flags: libc::c_ulong,
}

/// Mounts resolved against one instance directory
#[derive(Debug)]
pub struct MountPlan {
    mounts: Vec<PreparedMount>,
    root: CString,
    root_flags: libc::c_ulong,
    workdir: CString,
}

impl MountPlan {
    /// Resolve sources, create mountpoints under the instance root and
    /// compute remount flags.
    pub fn prepare(profile: &SandboxProfile, instance: &InstanceDir) -> Result<Self> {
        let mut mounts = Vec::with_capacity(profile.mounts().len());

        for entry in profile.mounts() {
            let source: PathBuf = match entry.source() {
                MountSource::Host(path) => path.clone(),
                MountSource::Workspace => instance.workspace().to_path_buf(),
                MountSource::Temp => instance.temp().to_path_buf(),
            };
            let relative = entry
                .destination()
                .strip_prefix("/")
                .map_err(|_| {
                    SandboxError::Mount(format!(
                        "Destination not absolute: {}",
                        entry.destination().display()
                    ))
                })?;
            let target = instance.root().join(relative);
            create_mountpoint(&source, &target)?;

            let mut flags = libc::MS_BIND
                | libc::MS_REMOUNT
                | libc::MS_NOSUID
                | locked_flags(&source)?;
            if entry.read_only() {
                flags |= libc::MS_RDONLY;
            } else {
                flags |= libc::MS_NODEV | libc::MS_NOEXEC;
            }

            debug!(
                "mount {} -> {} ({})",
                source.display(),
                entry.destination().display(),
                if entry.read_only() { "ro" } else { "rw" }
            );
            mounts.push(PreparedMount {
                source: path_cstring(&source)?,
                target: path_cstring(&target)?,
                remount_flags: flags,
            });
        }

        let root_flags = libc::MS_BIND
            | libc::MS_REMOUNT
            | libc::MS_RDONLY
            | libc::MS_NOSUID
            | libc::MS_NODEV
            | locked_flags(instance.root())?;

        Ok(Self {
            mounts,
            root: path_cstring(instance.root())?,
            root_flags,
            workdir: CString::new(WORKSPACE_MOUNT)
                .map_err(|e| SandboxError::Mount(e.to_string()))?,
        })
    }

    pub fn len(&self) -> usize {
        self.mounts.len()
    }

    pub fn is_empty(&self) -> bool {
        self.mounts.is_empty()
    }

    /// Make propagation private, bind the root onto itself, bind every entry
    /// and remount it with final flags, seal the root read-only, then chroot.
    /// Runs in the cloned child.
    pub fn apply_in_child(&self) -> std::result::Result<(), ChildFault> {
        // SAFETY: every pointer comes from a CString owned by self
        unsafe {
            if libc::mount(
                std::ptr::null(),
                c"/".as_ptr(),
                std::ptr::null(),
                libc::MS_REC | libc::MS_PRIVATE,
                std::ptr::null(),
            ) != 0
            {
                return Err(ChildFault::last_os_error("mount(make-private)"));
            }

            if libc::mount(
                self.root.as_ptr(),
                self.root.as_ptr(),
                std::ptr::null(),
                libc::MS_BIND,
                std::ptr::null(),
            ) != 0
            {
                return Err(ChildFault::last_os_error("mount(bind root)"));
            }

            for mount in &self.mounts {
                if libc::mount(
                    mount.source.as_ptr(),
                    mount.target.as_ptr(),
                    std::ptr::null(),
                    libc::MS_BIND | libc::MS_REC,
                    std::ptr::null(),
                ) != 0
                {
                    return Err(ChildFault::last_os_error("mount(bind)"));
                }
                if libc::mount(
                    std::ptr::null(),
                    mount.target.as_ptr(),
                    std::ptr::null(),
                    mount.remount_flags,
                    std::ptr::null(),
                ) != 0
                {
                    return Err(ChildFault::last_os_error("mount(remount)"));
                }
            }

            // Only the top mount; the binds beneath keep their own flags
            if libc::mount(
                std::ptr::null(),
                self.root.as_ptr(),
                std::ptr::null(),
                self.root_flags,
                std::ptr::null(),
            ) != 0
            {
                return Err(ChildFault::last_os_error("mount(remount root)"));
            }

            if libc::chroot(self.root.as_ptr()) != 0 {
                return Err(ChildFault::last_os_error("chroot"));
            }
            if libc::chdir(self.workdir.as_ptr()) != 0 {
                return Err(ChildFault::last_os_error("chdir(/workspace)"));
            }
        }
        Ok(())
    }
}

/// Flags a user namespace may not clear on a remount
fn locked_flags(source: &Path) -> Result<libc::c_ulong> {
    let stat = statvfs(source).map_err(|e| {
        SandboxError::Mount(format!("statvfs {}: {}", source.display(), e))
    })?;
    let flags = stat.flags();
    let mut locked = 0;
    for (fs_flag, ms_flag) in [
        (FsFlags::ST_NOSUID, libc::MS_NOSUID),
        (FsFlags::ST_NODEV, libc::MS_NODEV),
        (FsFlags::ST_NOEXEC, libc::MS_NOEXEC),
        (FsFlags::ST_NOATIME, libc::MS_NOATIME),
        (FsFlags::ST_NODIRATIME, libc::MS_NODIRATIME),
        (FsFlags::ST_RELATIME, libc::MS_RELATIME),
        (FsFlags::ST_RDONLY, libc::MS_RDONLY),
    ] {
        if flags.contains(fs_flag) {
            locked |= ms_flag;
        }
    }
    Ok(locked)
}

fn create_mountpoint(source: &Path, target: &Path) -> Result<()> {
    let metadata = fs::metadata(source).map_err(|e| {
        SandboxError::Mount(format!("mount source {}: {}", source.display(), e))
    })?;
    if metadata.is_dir() {
        fs::create_dir_all(target)?;
    } else {
        if let Some(parent) = target.parent() {
            fs::create_dir_all(parent)?;
        }
        fs::File::create(target)?;
    }
    Ok(())
}

fn path_cstring(path: &Path) -> Result<CString> {
    CString::new(path.as_os_str().as_bytes())
        .map_err(|_| SandboxError::Mount(format!("Path contains NUL: {}", path.display())))
}
