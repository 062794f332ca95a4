//! tool-sandbox: secure execution of untrusted tool plugins
//!
//! Runs third-party plugin code on behalf of an agent inside a per-request
//! Linux sandbox: user/mount/pid/ipc/uts/network namespaces, a chroot of
//! read-only runtime binds plus a private workspace, setrlimit ceilings and a
//! default-deny seccomp filter. A narrow host-display path serves tools that
//! need the screen, with every action authorized and audited on its own.
//!
//! # Modules
//!
//! - **capability**: capability gate, audit sink, static policy store
//! - **registry**: tool manifests and lookup
//! - **profile**: isolation profile derived per request
//! - **isolation**: namespaces and seccomp filtering
//! - **resources**: setrlimit ceilings
//! - **storage**: instance directories, mount plans, artifact collection
//! - **execution**: spawn, supervision, lifecycle states
//! - **gui**: per-action host display execution
//! - **controller**: the request-to-result facade
//!
//! # Example
//!
//! ```ignore
//! use std::sync::Arc;
//! use tool_sandbox::{EngineConfig, ExecutionEngine, ExecutionRequest, StaticPolicy, StaticRegistry};
//!
//! let engine = ExecutionEngine::builder(EngineConfig::default())
//!     .gate(Arc::new(StaticPolicy::from_file("policy.json")?))
//!     .registry(Arc::new(StaticRegistry::from_dir("tools/")?))
//!     .build()?;
//!
//! let request = ExecutionRequest::new("csv_report", "agent-7", serde_json::Map::new());
//! let result = engine.execute(&request, None);
//! println!("{}: {}", result.success, result.stdout);
//! ```

// Core modules
pub mod config;
pub mod errors;
pub mod request;
pub mod result;
pub mod system;
pub mod utils;

// Policy and lookup
pub mod capability;
pub mod profile;
pub mod registry;

// Layered modules
pub mod execution;
pub mod gui;
pub mod isolation;
pub mod resources;
pub mod storage;

// Main controller
pub mod controller;

// Public API
pub use capability::{
    AuditRecord, AuditSink, Capability, CapabilityGate, Decision, GateError, LogAuditSink,
    MemoryAuditSink, StaticPolicy,
};
pub use config::{DefaultPolicy, EngineConfig, EngineConfigBuilder, ResourceLimits, RunAs};
pub use controller::{ExecutionEngine, ExecutionEngineBuilder, ExecutionStrategy};
pub use errors::{Result, SandboxError};
pub use execution::{CancellationToken, SandboxState};
pub use gui::{CommandBackend, DisplayBackend, DisplayError, GuiAction, MouseButton};
pub use registry::{EntryPoint, Grant, StaticRegistry, ToolClass, ToolManifest, ToolRegistry};
pub use request::{ExecutionRequest, TrustTier};
pub use result::{Artifact, ErrorKind, ExecutionResult};
pub use system::SystemCapabilities;
