//! Isolation profiles and the builder that derives them
//!
//! A [`SandboxProfile`] is built fresh for each request from the engine's
//! [`DefaultPolicy`], the tool manifest and the request, and is never
//! modified afterwards. Building one requires an [`Authorization`], so a
//! profile cannot exist for a request that has not passed the gate.

use log::debug;
use std::collections::HashSet;
use std::path::{Component, Path, PathBuf};

use crate::capability::Authorization;
use crate::config::{DefaultPolicy, ResourceLimits, RunAs};
use crate::errors::{Result, SandboxError};
use crate::isolation::{NamespaceConfig, SyscallFilter};
use crate::registry::{Grant, ToolManifest};
use crate::request::{ExecutionRequest, TrustTier};

/// Where the writable workspace appears inside the sandbox
pub const WORKSPACE_MOUNT: &str = "/workspace";
/// Where the private temp area appears inside the sandbox
pub const TEMP_MOUNT: &str = "/tmp";

/// Backing store for a mount.
///
/// Host paths are only ever bound read-only. The only writable sources are
/// the instance's own workspace and temp directories.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MountSource {
    Host(PathBuf),
    Workspace,
    Temp,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MountEntry {
    source: MountSource,
    destination: PathBuf,
}

impl MountEntry {
    /// Bind a host path read-only
    pub fn host(source: impl Into<PathBuf>, destination: impl Into<PathBuf>) -> Self {
        Self {
            source: MountSource::Host(source.into()),
            destination: destination.into(),
        }
    }

    pub fn workspace() -> Self {
        Self {
            source: MountSource::Workspace,
            destination: PathBuf::from(WORKSPACE_MOUNT),
        }
    }

    pub fn temp() -> Self {
        Self {
            source: MountSource::Temp,
            destination: PathBuf::from(TEMP_MOUNT),
        }
    }

    pub fn source(&self) -> &MountSource {
        &self.source
    }

    pub fn destination(&self) -> &Path {
        &self.destination
    }

    pub fn read_only(&self) -> bool {
        matches!(self.source, MountSource::Host(_))
    }
}

/// Everything the executor needs to isolate one instance
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SandboxProfile {
    namespaces: NamespaceConfig,
    mounts: Vec<MountEntry>,
    limits: ResourceLimits,
    syscalls: SyscallFilter,
    run_as: RunAs,
    hostname: String,
}

impl SandboxProfile {
    pub fn namespaces(&self) -> &NamespaceConfig {
        &self.namespaces
    }

    /// Mount entries in the order they are applied
    pub fn mounts(&self) -> &[MountEntry] {
        &self.mounts
    }

    pub fn limits(&self) -> &ResourceLimits {
        &self.limits
    }

    pub fn syscalls(&self) -> &SyscallFilter {
        &self.syscalls
    }

    pub fn run_as(&self) -> RunAs {
        self.run_as
    }

    pub fn hostname(&self) -> &str {
        &self.hostname
    }

    /// Reject profiles whose mounts could expose or shadow the wrong paths
    pub fn validate(&self) -> Result<()> {
        let mut seen = HashSet::new();
        let mut workspace = 0;
        let mut temp = 0;

        for mount in &self.mounts {
            let dest = mount.destination();
            if !dest.is_absolute() || dest == Path::new("/") {
                return Err(SandboxError::Mount(format!(
                    "Invalid mount destination: {}",
                    dest.display()
                )));
            }
            if dest.components().any(|c| matches!(c, Component::ParentDir)) {
                return Err(SandboxError::Mount(format!(
                    "Mount destination escapes root: {}",
                    dest.display()
                )));
            }
            if !seen.insert(dest.to_path_buf()) {
                return Err(SandboxError::Mount(format!(
                    "Duplicate mount destination: {}",
                    dest.display()
                )));
            }

            match mount.source() {
                MountSource::Host(source) => {
                    if !source.is_absolute() {
                        return Err(SandboxError::Mount(format!(
                            "Host mount source must be absolute: {}",
                            source.display()
                        )));
                    }
                    if dest.starts_with(WORKSPACE_MOUNT) || dest.starts_with(TEMP_MOUNT) {
                        return Err(SandboxError::Mount(format!(
                            "Host mount cannot shadow a private area: {}",
                            dest.display()
                        )));
                    }
                }
                MountSource::Workspace => workspace += 1,
                MountSource::Temp => temp += 1,
            }
        }

        // Mountpoints are created on the host before any bind, so a mount
        // cannot sit inside another one
        if let Some(nested) = self.mounts.iter().find(|inner| {
            self.mounts.iter().any(|outer| {
                outer.destination() != inner.destination()
                    && inner.destination().starts_with(outer.destination())
            })
        }) {
            return Err(SandboxError::Mount(format!(
                "Mount destination nested inside another mount: {}",
                nested.destination().display()
            )));
        }

        if workspace != 1 || temp != 1 {
            return Err(SandboxError::Mount(
                "Profile needs exactly one workspace and one temp mount".to_string(),
            ));
        }

        self.syscalls.validate()
    }
}

/// Derives a [`SandboxProfile`] from the default policy
#[derive(Debug, Clone, Copy)]
pub struct SandboxConfigBuilder<'a> {
    policy: &'a DefaultPolicy,
}

impl<'a> SandboxConfigBuilder<'a> {
    pub fn new(policy: &'a DefaultPolicy) -> Self {
        Self { policy }
    }

    /// Build the profile for `request` running `manifest`.
    ///
    /// Elevated grants are applied only when the effective tier is elevated
    /// and `authorization` covers each grant's capability.
    pub fn build(
        &self,
        manifest: &ToolManifest,
        request: &ExecutionRequest,
        authorization: &Authorization,
    ) -> Result<SandboxProfile> {
        if authorization.principal_id() != request.principal_id() {
            return Err(SandboxError::InvalidConfig(format!(
                "Authorization for '{}' used for request by '{}'",
                authorization.principal_id(),
                request.principal_id()
            )));
        }

        let tier = effective_tier(request, manifest);
        let mut namespaces = NamespaceConfig::isolated();
        let mut syscalls = SyscallFilter::baseline();
        let mut mounts: Vec<MountEntry> = self
            .policy
            .runtime_mounts
            .iter()
            .filter(|path| path.exists())
            .map(|path| MountEntry::host(path, path))
            .collect();

        if tier.is_elevated() {
            for grant in &manifest.grants {
                let capability = grant.capability();
                if !authorization.covers(&capability) {
                    return Err(SandboxError::InvalidConfig(format!(
                        "Grant for tool '{}' needs capability '{}' which was not authorized",
                        manifest.id, capability
                    )));
                }

                match grant {
                    Grant::ReadOnlyMount {
                        source,
                        destination,
                    } => {
                        if !source.exists() {
                            return Err(SandboxError::Mount(format!(
                                "Granted mount source does not exist: {}",
                                source.display()
                            )));
                        }
                        mounts.retain(|m| m.destination() != destination.as_path());
                        mounts.push(MountEntry::host(source, destination));
                    }
                    Grant::Syscalls { names } => {
                        for name in names {
                            syscalls.allow(name)?;
                        }
                    }
                    Grant::Network => {
                        namespaces = namespaces.with_host_network();
                        syscalls.allow_network()?;
                    }
                }
            }
        }

        mounts.push(MountEntry::workspace());
        mounts.push(MountEntry::temp());

        let profile = SandboxProfile {
            namespaces,
            mounts,
            limits: tightened_limits(&self.policy.limits, request),
            syscalls,
            run_as: self.policy.run_as,
            hostname: self.policy.hostname.clone(),
        };
        profile.validate()?;

        debug!(
            "Built profile for '{}': tier={} mounts={} syscalls={} namespaces={}",
            manifest.id,
            tier,
            profile.mounts.len(),
            profile.syscalls.allowed_count(),
            profile.namespaces.enabled_count()
        );
        Ok(profile)
    }
}

/// The lower of the requested and the declared tier
pub fn effective_tier(request: &ExecutionRequest, manifest: &ToolManifest) -> TrustTier {
    request.trust_tier().min(manifest.trust_tier)
}

/// Request values may only lower the policy ceilings
fn tightened_limits(policy: &ResourceLimits, request: &ExecutionRequest) -> ResourceLimits {
    let mut limits = policy.clone();
    limits.address_space_bytes = limits.address_space_bytes.min(request.memory_limit_bytes());
    limits.cpu_time_secs = limits
        .cpu_time_secs
        .min(request.timeout_s().saturating_add(1));
    limits
}
