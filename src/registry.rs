//! Tool manifests and the registry that hands them out

use log::debug;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeSet, HashMap};
use std::path::{Path, PathBuf};

use crate::capability::{
    CAP_SANDBOX_MOUNT_READ, CAP_SANDBOX_NETWORK, CAP_SANDBOX_SYSCALL, Capability,
};
use crate::errors::{Result, SandboxError};
use crate::request::TrustTier;

/// How the tool is launched inside the sandbox
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EntryPoint {
    /// Interpreter path as seen inside the sandbox (e.g. `/usr/bin/python3`)
    pub interpreter: PathBuf,
    /// Extra interpreter flags placed before the script
    #[serde(default)]
    pub interpreter_args: Vec<String>,
    /// Host path of the script copied into the workspace
    pub script: PathBuf,
}

/// Which execution path a tool takes
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ToolClass {
    /// Plugin code run inside a namespaced sandbox
    #[default]
    Plugin,
    /// Host-display actions run directly, gated per action
    Display,
}

/// An additive privilege a tool may receive at elevated tier
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Grant {
    /// Bind an extra host path read-only
    ReadOnlyMount {
        source: PathBuf,
        destination: PathBuf,
    },
    /// Allow specific syscalls beyond the baseline
    Syscalls { names: Vec<String> },
    /// Keep the host network namespace and allow socket syscalls
    Network,
}

impl Grant {
    /// Capability that must pass the gate before this grant is applied
    pub fn capability(&self) -> Capability {
        match self {
            Grant::ReadOnlyMount { .. } => Capability::new(CAP_SANDBOX_MOUNT_READ),
            Grant::Syscalls { .. } => Capability::new(CAP_SANDBOX_SYSCALL),
            Grant::Network => Capability::new(CAP_SANDBOX_NETWORK),
        }
    }
}

/// Registry description of a tool
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ToolManifest {
    pub id: String,
    #[serde(default)]
    pub required_capabilities: BTreeSet<Capability>,
    #[serde(default)]
    pub trust_tier: TrustTier,
    #[serde(default)]
    pub class: ToolClass,
    /// Absent for display tools
    #[serde(default)]
    pub entry_point: Option<EntryPoint>,
    #[serde(default)]
    pub grants: Vec<Grant>,
}

impl ToolManifest {
    pub fn plugin(id: impl Into<String>, entry_point: EntryPoint) -> Self {
        Self {
            id: id.into(),
            required_capabilities: BTreeSet::new(),
            trust_tier: TrustTier::Baseline,
            class: ToolClass::Plugin,
            entry_point: Some(entry_point),
            grants: Vec::new(),
        }
    }

    pub fn display(id: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            required_capabilities: BTreeSet::new(),
            trust_tier: TrustTier::Baseline,
            class: ToolClass::Display,
            entry_point: None,
            grants: Vec::new(),
        }
    }

    pub fn require(mut self, capability: &str) -> Self {
        self.required_capabilities.insert(Capability::new(capability));
        self
    }

    pub fn with_trust_tier(mut self, tier: TrustTier) -> Self {
        self.trust_tier = tier;
        self
    }

    pub fn with_grant(mut self, grant: Grant) -> Self {
        self.grants.push(grant);
        self
    }

    /// Capabilities to check for a request running at `effective` tier
    pub fn capabilities_for(&self, effective: TrustTier) -> BTreeSet<Capability> {
        let mut caps = self.required_capabilities.clone();
        if effective.is_elevated() {
            caps.extend(self.grants.iter().map(Grant::capability));
        }
        caps
    }

    pub fn validate(&self) -> Result<()> {
        if self.id.trim().is_empty() {
            return Err(SandboxError::InvalidConfig(
                "Tool id cannot be empty".to_string(),
            ));
        }
        match self.class {
            ToolClass::Plugin if self.entry_point.is_none() => Err(SandboxError::InvalidConfig(
                format!("Plugin tool '{}' has no entry point", self.id),
            )),
            ToolClass::Display if !self.grants.is_empty() => Err(SandboxError::InvalidConfig(
                format!("Display tool '{}' cannot declare sandbox grants", self.id),
            )),
            _ => Ok(()),
        }
    }
}

/// Tool lookup collaborator
pub trait ToolRegistry: Send + Sync {
    fn lookup(&self, tool_id: &str) -> Option<ToolManifest>;
}

/// Registry backed by a map, optionally loaded from `*.json` manifests
#[derive(Debug, Clone, Default)]
pub struct StaticRegistry {
    tools: HashMap<String, ToolManifest>,
}

impl StaticRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&mut self, manifest: ToolManifest) -> Result<()> {
        manifest.validate()?;
        debug!("Registering tool '{}'", manifest.id);
        self.tools.insert(manifest.id.clone(), manifest);
        Ok(())
    }

    pub fn with_tool(mut self, manifest: ToolManifest) -> Result<Self> {
        self.register(manifest)?;
        Ok(self)
    }

    /// Load every `*.json` file in `dir` as a manifest
    pub fn from_dir(dir: impl AsRef<Path>) -> Result<Self> {
        let mut registry = Self::new();
        let mut paths: Vec<PathBuf> = std::fs::read_dir(dir.as_ref())?
            .filter_map(|entry| entry.ok().map(|e| e.path()))
            .filter(|path| path.extension().is_some_and(|ext| ext == "json"))
            .collect();
        paths.sort();

        for path in paths {
            let content = std::fs::read_to_string(&path)?;
            let manifest: ToolManifest = serde_json::from_str(&content).map_err(|e| {
                SandboxError::InvalidConfig(format!(
                    "Invalid manifest {}: {}",
                    path.display(),
                    e
                ))
            })?;
            registry.register(manifest)?;
        }
        Ok(registry)
    }

    pub fn tool_ids(&self) -> Vec<&str> {
        let mut ids: Vec<&str> = self.tools.keys().map(String::as_str).collect();
        ids.sort_unstable();
        ids
    }
}

impl ToolRegistry for StaticRegistry {
    fn lookup(&self, tool_id: &str) -> Option<ToolManifest> {
        self.tools.get(tool_id).cloned()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn entry() -> EntryPoint {
        EntryPoint {
            interpreter: PathBuf::from("/bin/sh"),
            interpreter_args: Vec::new(),
            script: PathBuf::from("/opt/tools/echo.sh"),
        }
    }

    #[test]
    fn grant_capabilities_only_checked_when_elevated() {
        let manifest = ToolManifest::plugin("fetch", entry())
            .require("net.http")
            .with_trust_tier(TrustTier::Elevated)
            .with_grant(Grant::Network);

        let baseline = manifest.capabilities_for(TrustTier::Baseline);
        assert_eq!(baseline.len(), 1);

        let elevated = manifest.capabilities_for(TrustTier::Elevated);
        assert!(elevated.contains(&Capability::new(CAP_SANDBOX_NETWORK)));
        assert!(elevated.contains(&Capability::new("net.http")));
    }

    #[test]
    fn plugin_without_entry_point_is_invalid() {
        let mut manifest = ToolManifest::plugin("x", entry());
        manifest.entry_point = None;
        assert!(manifest.validate().is_err());
    }

    #[test]
    fn display_tool_rejects_grants() {
        let manifest = ToolManifest::display("screen").with_grant(Grant::Network);
        assert!(manifest.validate().is_err());
    }

    #[test]
    fn registry_lookup() {
        let registry = StaticRegistry::new()
            .with_tool(ToolManifest::plugin("echo", entry()))
            .unwrap();
        assert!(registry.lookup("echo").is_some());
        assert!(registry.lookup("missing").is_none());
    }

    #[test]
    fn registry_loads_manifest_directory() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(
            dir.path().join("echo.json"),
            r#"{
                "id": "echo",
                "required_capabilities": ["fs.read"],
                "entry_point": {"interpreter": "/bin/sh", "script": "/opt/echo.sh"},
                "grants": [{"kind": "syscalls", "names": ["kill"]}]
            }"#,
        )
        .unwrap();
        std::fs::write(dir.path().join("README.txt"), "ignored").unwrap();

        let registry = StaticRegistry::from_dir(dir.path()).unwrap();
        assert_eq!(registry.tool_ids(), vec!["echo"]);
        let manifest = registry.lookup("echo").unwrap();
        assert_eq!(manifest.class, ToolClass::Plugin);
        assert_eq!(
            manifest.grants,
            vec![Grant::Syscalls {
                names: vec!["kill".to_string()]
            }]
        );
    }
}
