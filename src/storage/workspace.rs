//! Per-instance directory lifecycle
//!
//! Layout under the engine's base directory:
//!
//! ```text
//! <base>/<instance-id>-XXXXXX/
//!     root/        mountpoint skeleton, becomes "/" after chroot
//!     workspace/   writable, bound at /workspace
//!     tmp/         writable, bound at /tmp
//! ```

use log::{debug, warn};
use serde_json::{Map, Value};
use std::fs;
use std::os::unix::fs::PermissionsExt;
use std::path::{Path, PathBuf};
use tempfile::TempDir;
use walkdir::WalkDir;

use crate::config::RunAs;
use crate::errors::{Result, SandboxError};

/// Injected copy of the tool's entry script
pub const ENTRY_FILE: &str = ".tool_entry";
/// Injected request arguments as JSON
pub const ARGS_FILE: &str = ".tool_args.json";

/// Ephemeral directory tree owned by one sandbox instance
#[derive(Debug)]
pub struct InstanceDir {
    dir: TempDir,
    root: PathBuf,
    workspace: PathBuf,
    temp: PathBuf,
}

impl InstanceDir {
    /// Create a fresh, uniquely named instance directory under `base_dir`
    pub fn create(base_dir: &Path, instance_id: &str) -> Result<Self> {
        fs::create_dir_all(base_dir)?;
        let dir = tempfile::Builder::new()
            .prefix(&format!("{}-", instance_id))
            .tempdir_in(base_dir)?;

        let root = dir.path().join("root");
        let workspace = dir.path().join("workspace");
        let temp = dir.path().join("tmp");
        for path in [&root, &workspace, &temp] {
            fs::create_dir(path)?;
        }

        debug!("Created instance directory {}", dir.path().display());
        Ok(Self {
            dir,
            root,
            workspace,
            temp,
        })
    }

    pub fn path(&self) -> &Path {
        self.dir.path()
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn workspace(&self) -> &Path {
        &self.workspace
    }

    pub fn temp(&self) -> &Path {
        &self.temp
    }

    /// Copy the entry script and write the argument file into the workspace
    pub fn stage_bootstrap(&self, script: &Path, arguments: &Map<String, Value>) -> Result<()> {
        let entry = self.workspace.join(ENTRY_FILE);
        fs::copy(script, &entry).map_err(|e| {
            SandboxError::InvalidConfig(format!(
                "Cannot stage entry script {}: {}",
                script.display(),
                e
            ))
        })?;
        fs::set_permissions(&entry, fs::Permissions::from_mode(0o444))?;

        let args = serde_json::to_vec_pretty(arguments)
            .map_err(|e| SandboxError::InvalidArguments(e.to_string()))?;
        let args_path = self.workspace.join(ARGS_FILE);
        fs::write(&args_path, args)?;
        fs::set_permissions(&args_path, fs::Permissions::from_mode(0o444))?;
        Ok(())
    }

    /// Give the tree to the run-as identity.
    ///
    /// Only needed when the engine runs as root: the tool's host uid is then
    /// `run_as.uid` instead of the caller's, and must own its writable areas.
    pub fn hand_over(&self, run_as: RunAs) -> Result<()> {
        for entry in WalkDir::new(self.path()).follow_links(false) {
            let entry = entry.map_err(|e| SandboxError::Io(e.into()))?;
            nix::unistd::chown(
                entry.path(),
                Some(nix::unistd::Uid::from_raw(run_as.uid)),
                Some(nix::unistd::Gid::from_raw(run_as.gid)),
            )
            .map_err(|e| {
                SandboxError::Syscall(format!("chown {}: {}", entry.path().display(), e))
            })?;
        }
        Ok(())
    }

    /// Remove the tree. A failed removal is retried once after restoring
    /// owner permissions the tool may have taken away.
    pub fn close(self) -> Result<()> {
        let path = self.dir.path().to_path_buf();
        match self.dir.close() {
            Ok(()) => {
                debug!("Removed instance directory {}", path.display());
                Ok(())
            }
            Err(first) => {
                warn!(
                    "Removing {} failed ({}), retrying",
                    path.display(),
                    first
                );
                relax_permissions(&path);
                fs::remove_dir_all(&path).map_err(|e| {
                    SandboxError::Cleanup(format!(
                        "could not remove {}: {}",
                        path.display(),
                        e
                    ))
                })
            }
        }
    }
}

fn relax_permissions(path: &Path) {
    for entry in WalkDir::new(path)
        .follow_links(false)
        .into_iter()
        .filter_map(|e| e.ok())
        .filter(|e| e.file_type().is_dir())
    {
        let _ = fs::set_permissions(entry.path(), fs::Permissions::from_mode(0o700));
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn create_lays_out_private_areas() {
        let base = tempfile::tempdir().unwrap();
        let instance = InstanceDir::create(base.path(), "abc").unwrap();
        assert!(instance.root().is_dir());
        assert!(instance.workspace().is_dir());
        assert!(instance.temp().is_dir());
        assert!(instance.path().starts_with(base.path()));
        let name = instance.path().file_name().unwrap().to_string_lossy();
        assert!(name.starts_with("abc-"));
    }

    #[test]
    fn same_id_gets_distinct_directories() {
        let base = tempfile::tempdir().unwrap();
        let a = InstanceDir::create(base.path(), "same").unwrap();
        let b = InstanceDir::create(base.path(), "same").unwrap();
        assert_ne!(a.path(), b.path());
    }

    #[test]
    fn bootstrap_files_are_staged() {
        let base = tempfile::tempdir().unwrap();
        let script = base.path().join("tool.sh");
        fs::write(&script, "echo hi\n").unwrap();

        let instance = InstanceDir::create(base.path(), "boot").unwrap();
        let mut args = Map::new();
        args.insert("rows".to_string(), json!(3));
        instance.stage_bootstrap(&script, &args).unwrap();

        let entry = fs::read_to_string(instance.workspace().join(ENTRY_FILE)).unwrap();
        assert_eq!(entry, "echo hi\n");
        let staged: Value =
            serde_json::from_slice(&fs::read(instance.workspace().join(ARGS_FILE)).unwrap())
                .unwrap();
        assert_eq!(staged, json!({"rows": 3}));
    }

    #[test]
    fn missing_script_is_a_setup_error() {
        let base = tempfile::tempdir().unwrap();
        let instance = InstanceDir::create(base.path(), "x").unwrap();
        let err = instance
            .stage_bootstrap(Path::new("/nonexistent/tool.sh"), &Map::new())
            .unwrap_err();
        assert!(matches!(err, SandboxError::InvalidConfig(_)));
    }

    #[test]
    fn close_removes_everything() {
        let base = tempfile::tempdir().unwrap();
        let instance = InstanceDir::create(base.path(), "gone").unwrap();
        let path = instance.path().to_path_buf();
        fs::write(instance.workspace().join("out.csv"), "a,b\n").unwrap();
        instance.close().unwrap();
        assert!(!path.exists());
    }

    #[test]
    fn close_recovers_from_locked_directory() {
        let base = tempfile::tempdir().unwrap();
        let instance = InstanceDir::create(base.path(), "locked").unwrap();
        let path = instance.path().to_path_buf();
        let locked = instance.workspace().join("locked");
        fs::create_dir(&locked).unwrap();
        fs::write(locked.join("file"), "x").unwrap();
        fs::set_permissions(&locked, fs::Permissions::from_mode(0o500)).unwrap();

        instance.close().unwrap();
        assert!(!path.exists());
    }
}
