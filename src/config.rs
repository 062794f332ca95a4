//! Engine configuration and the global default isolation policy
//!
//! Both values are built once when the engine starts and passed explicitly
//! into every profile build. Nothing here is read from ambient global state.

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::errors::{Result, SandboxError};
use crate::utils::parse_memory_size;

/// Kernel-enforced per-instance resource ceilings
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResourceLimits {
    /// CPU time in seconds (RLIMIT_CPU)
    pub cpu_time_secs: u64,
    /// Address space in bytes (RLIMIT_AS)
    pub address_space_bytes: u64,
    /// Largest file the tool may write, in bytes (RLIMIT_FSIZE)
    pub file_size_bytes: u64,
    /// Process count (RLIMIT_NPROC)
    pub max_processes: u64,
    /// Open file descriptors (RLIMIT_NOFILE)
    pub max_open_files: u64,
}

impl Default for ResourceLimits {
    fn default() -> Self {
        Self {
            cpu_time_secs: 30,
            address_space_bytes: 256 * 1024 * 1024,
            file_size_bytes: 16 * 1024 * 1024,
            max_processes: 1,
            max_open_files: 64,
        }
    }
}

impl ResourceLimits {
    pub fn validate(&self) -> Result<()> {
        let zero = [
            ("cpu_time_secs", self.cpu_time_secs),
            ("address_space_bytes", self.address_space_bytes),
            ("file_size_bytes", self.file_size_bytes),
            ("max_processes", self.max_processes),
            ("max_open_files", self.max_open_files),
        ]
        .into_iter()
        .find(|(_, value)| *value == 0);

        match zero {
            Some((name, _)) => Err(SandboxError::InvalidConfig(format!(
                "Resource limit {} must be greater than zero",
                name
            ))),
            None => Ok(()),
        }
    }
}

/// Unprivileged identity the tool runs as inside its namespace
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct RunAs {
    pub uid: u32,
    pub gid: u32,
}

impl Default for RunAs {
    fn default() -> Self {
        // nobody:nogroup
        Self {
            uid: 65534,
            gid: 65534,
        }
    }
}

/// Immutable baseline policy every profile starts from
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DefaultPolicy {
    pub limits: ResourceLimits,
    /// Host paths bound read-only at the same location inside the sandbox.
    /// Paths missing on the host are skipped.
    pub runtime_mounts: Vec<PathBuf>,
    pub run_as: RunAs,
    pub hostname: String,
}

impl Default for DefaultPolicy {
    fn default() -> Self {
        Self {
            limits: ResourceLimits::default(),
            runtime_mounts: [
                "/bin",
                "/usr",
                "/lib",
                "/lib64",
                "/etc/alternatives",
                "/etc/ld.so.cache",
                "/dev/null",
                "/dev/zero",
                "/dev/urandom",
            ]
            .iter()
            .map(PathBuf::from)
            .collect(),
            run_as: RunAs::default(),
            hostname: "sandbox".to_string(),
        }
    }
}

impl DefaultPolicy {
    pub fn validate(&self) -> Result<()> {
        self.limits.validate()?;
        if let Some(path) = self.runtime_mounts.iter().find(|p| !p.is_absolute()) {
            return Err(SandboxError::InvalidConfig(format!(
                "Runtime mount must be absolute: {}",
                path.display()
            )));
        }
        if self.run_as.uid == 0 || self.run_as.gid == 0 {
            return Err(SandboxError::InvalidConfig(
                "Tools cannot run as uid/gid 0".to_string(),
            ));
        }
        if self.hostname.is_empty() || self.hostname.len() > 64 {
            return Err(SandboxError::InvalidConfig(
                "Hostname must be 1-64 bytes".to_string(),
            ));
        }
        Ok(())
    }
}

/// Engine-wide settings
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    /// Directory under which per-instance directories are created
    pub base_dir: PathBuf,
    pub policy: DefaultPolicy,
    /// Per-stream capture cap in bytes
    pub output_limit_bytes: usize,
    /// Time between SIGTERM and SIGKILL for the process group
    #[serde(with = "millis")]
    pub grace_period: Duration,
    /// Wait-loop checkpoint interval
    #[serde(with = "millis")]
    pub poll_interval: Duration,
    /// Artifacts are copied here before cleanup when set
    pub artifact_export_dir: Option<PathBuf>,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            base_dir: std::env::temp_dir().join("tool-sandbox"),
            policy: DefaultPolicy::default(),
            output_limit_bytes: 64 * 1024,
            grace_period: Duration::from_millis(500),
            poll_interval: Duration::from_millis(10),
            artifact_export_dir: None,
        }
    }
}

impl EngineConfig {
    pub fn builder() -> EngineConfigBuilder {
        EngineConfigBuilder::new()
    }

    /// Load configuration from a JSON file; missing fields take defaults
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let content = std::fs::read_to_string(path)?;
        let config: EngineConfig = serde_json::from_str(&content).map_err(|e| {
            SandboxError::InvalidConfig(format!(
                "Invalid engine config {}: {}",
                path.display(),
                e
            ))
        })?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        self.policy.validate()?;
        if !self.base_dir.is_absolute() {
            return Err(SandboxError::InvalidConfig(format!(
                "Base directory must be absolute: {}",
                self.base_dir.display()
            )));
        }
        if self.output_limit_bytes == 0 {
            return Err(SandboxError::InvalidConfig(
                "Output limit must be greater than zero".to_string(),
            ));
        }
        if self.poll_interval.is_zero() {
            return Err(SandboxError::InvalidConfig(
                "Poll interval must be greater than zero".to_string(),
            ));
        }
        Ok(())
    }
}

/// Builder pattern for engine configuration
#[derive(Debug, Default)]
pub struct EngineConfigBuilder {
    config: EngineConfig,
}

impl EngineConfigBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    /// Set base directory for instance workspaces
    pub fn base_dir(mut self, path: impl AsRef<Path>) -> Self {
        self.config.base_dir = path.as_ref().to_path_buf();
        self
    }

    /// Set the address-space ceiling
    pub fn memory_limit(mut self, bytes: u64) -> Self {
        self.config.policy.limits.address_space_bytes = bytes;
        self
    }

    /// Set the address-space ceiling from string (e.g., "256M")
    pub fn memory_limit_str(self, s: &str) -> Result<Self> {
        let bytes = parse_memory_size(s)?;
        Ok(self.memory_limit(bytes))
    }

    pub fn cpu_time_secs(mut self, secs: u64) -> Self {
        self.config.policy.limits.cpu_time_secs = secs;
        self
    }

    pub fn max_file_size(mut self, bytes: u64) -> Self {
        self.config.policy.limits.file_size_bytes = bytes;
        self
    }

    pub fn max_processes(mut self, count: u64) -> Self {
        self.config.policy.limits.max_processes = count;
        self
    }

    pub fn max_open_files(mut self, count: u64) -> Self {
        self.config.policy.limits.max_open_files = count;
        self
    }

    pub fn runtime_mounts<I, P>(mut self, paths: I) -> Self
    where
        I: IntoIterator<Item = P>,
        P: Into<PathBuf>,
    {
        self.config.policy.runtime_mounts = paths.into_iter().map(Into::into).collect();
        self
    }

    pub fn run_as(mut self, uid: u32, gid: u32) -> Self {
        self.config.policy.run_as = RunAs { uid, gid };
        self
    }

    pub fn output_limit(mut self, bytes: usize) -> Self {
        self.config.output_limit_bytes = bytes;
        self
    }

    pub fn grace_period(mut self, grace: Duration) -> Self {
        self.config.grace_period = grace;
        self
    }

    pub fn poll_interval(mut self, interval: Duration) -> Self {
        self.config.poll_interval = interval;
        self
    }

    pub fn artifact_export_dir(mut self, path: impl AsRef<Path>) -> Self {
        self.config.artifact_export_dir = Some(path.as_ref().to_path_buf());
        self
    }

    pub fn build(self) -> Result<EngineConfig> {
        self.config.validate()?;
        Ok(self.config)
    }
}

mod millis {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S: Serializer>(value: &Duration, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_u64(value.as_millis() as u64)
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Duration, D::Error> {
        u64::deserialize(deserializer).map(Duration::from_millis)
    }
}
