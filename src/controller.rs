//! Execution engine facade
//!
//! Turns one [`ExecutionRequest`] into one [`ExecutionResult`]:
//! registry lookup, capability check, then either the namespaced sandbox
//! path or the per-action display path. Every internal error is folded
//! into the result; callers never see a raw fault.

use log::{debug, info, warn};
use std::path::Path;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use crate::capability::{AuditSink, CapabilityGate, Denial, LogAuditSink, authorize};
use crate::config::EngineConfig;
use crate::errors::{Result, SandboxError};
use crate::execution::{
    CancellationToken, RunOutcome, SandboxExecutor, SandboxInstance, SandboxState,
};
use crate::gui::{CommandBackend, DisplayBackend, GuiExecutor, parse_actions};
use crate::profile::{SandboxConfigBuilder, effective_tier};
use crate::registry::{ToolClass, ToolManifest, ToolRegistry};
use crate::request::ExecutionRequest;
use crate::result::{ErrorKind, ExecutionResult};
use crate::storage::ArtifactCollector;
use crate::system::SystemCapabilities;

/// Audit action recorded for the invocation-level check
pub const EXECUTE_ACTION: &str = "tool.execute";

/// How a tool is run, chosen from its manifest class
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExecutionStrategy {
    /// Namespaced, rlimited, seccomp-filtered child process
    Sandboxed,
    /// Host display actions, each authorized on its own
    DirectDisplay,
}

impl ExecutionStrategy {
    pub fn for_manifest(manifest: &ToolManifest) -> Self {
        match manifest.class {
            ToolClass::Plugin => ExecutionStrategy::Sandboxed,
            ToolClass::Display => ExecutionStrategy::DirectDisplay,
        }
    }
}

/// The request-to-result facade. `Send + Sync`; share it across workers.
pub struct ExecutionEngine {
    config: EngineConfig,
    gate: Arc<dyn CapabilityGate>,
    audit: Arc<dyn AuditSink>,
    registry: Arc<dyn ToolRegistry>,
    display: Arc<dyn DisplayBackend>,
    executor: SandboxExecutor,
    collector: ArtifactCollector,
    spawn_count: AtomicU64,
}

impl ExecutionEngine {
    pub fn builder(config: EngineConfig) -> ExecutionEngineBuilder {
        ExecutionEngineBuilder::new(config)
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    /// Sandboxed processes spawned so far
    pub fn spawn_count(&self) -> u64 {
        self.spawn_count.load(Ordering::SeqCst)
    }

    /// Run one request to completion. Always returns a complete result.
    pub fn execute(
        &self,
        request: &ExecutionRequest,
        cancel: Option<&CancellationToken>,
    ) -> ExecutionResult {
        if let Err(e) = request.validate() {
            return ExecutionResult::rejected(e.kind(), e.to_string());
        }

        let Some(manifest) = self.registry.lookup(request.tool_id()) else {
            let err = SandboxError::UnknownTool(request.tool_id().to_string());
            return ExecutionResult::rejected(err.kind(), err.to_string());
        };

        let strategy = ExecutionStrategy::for_manifest(&manifest);
        let required = match strategy {
            ExecutionStrategy::Sandboxed => {
                manifest.capabilities_for(effective_tier(request, &manifest))
            }
            // Display capabilities are checked per action
            ExecutionStrategy::DirectDisplay => manifest.required_capabilities.clone(),
        };

        let authorization = match authorize(
            self.gate.as_ref(),
            self.audit.as_ref(),
            request.principal_id(),
            &required,
            EXECUTE_ACTION,
            &manifest.id,
        ) {
            Ok(authorization) => authorization,
            Err(denial) => {
                info!(
                    "Request by '{}' for '{}' rejected: {}",
                    request.principal_id(),
                    manifest.id,
                    denial
                );
                return ExecutionResult::rejected(
                    ErrorKind::PermissionDenied,
                    denial_message(&denial),
                );
            }
        };

        let result = match strategy {
            ExecutionStrategy::Sandboxed => {
                self.run_sandboxed(request, &manifest, &authorization, cancel)
            }
            ExecutionStrategy::DirectDisplay => self.run_display(request, &manifest, cancel),
        };

        info!(
            "Tool '{}' for '{}': success={} kind={} wall={}ms",
            manifest.id,
            request.principal_id(),
            result.success,
            result
                .error_kind
                .map(|k| k.as_str())
                .unwrap_or("none"),
            result.wall_time_ms
        );
        result
    }

    fn run_sandboxed(
        &self,
        request: &ExecutionRequest,
        manifest: &ToolManifest,
        authorization: &crate::capability::Authorization,
        cancel: Option<&CancellationToken>,
    ) -> ExecutionResult {
        let profile = match SandboxConfigBuilder::new(&self.config.policy).build(
            manifest,
            request,
            authorization,
        ) {
            Ok(profile) => profile,
            Err(e) => return ExecutionResult::rejected(ErrorKind::SetupFailure, e.to_string()),
        };
        let Some(entry) = manifest.entry_point.as_ref() else {
            return ExecutionResult::rejected(
                ErrorKind::SetupFailure,
                format!("Tool '{}' has no entry point", manifest.id),
            );
        };

        let mut instance = match SandboxInstance::create(&self.config.base_dir, profile) {
            Ok(instance) => instance,
            Err(e) => return ExecutionResult::rejected(ErrorKind::SetupFailure, e.to_string()),
        };

        let mut result = match self.executor.prepare(&mut instance, entry, request.arguments()) {
            Ok(launch) => {
                self.spawn_count.fetch_add(1, Ordering::SeqCst);
                match self
                    .executor
                    .run(&mut instance, &launch, request.timeout(), cancel)
                {
                    Ok(outcome) => self.finish(&instance, outcome),
                    Err(e) => {
                        ExecutionResult::rejected(run_failure_kind(instance.state()), e.to_string())
                    }
                }
            }
            Err(e) => ExecutionResult::rejected(ErrorKind::SetupFailure, e.to_string()),
        };
        result.instance_id = Some(instance.id().to_string());

        if let Err(e) = instance.cleanup() {
            warn!("Cleanup of instance {} failed: {}", instance.id(), e);
            result.note_cleanup_failure(e.to_string());
        }
        result
    }

    /// Merge the run outcome with the artifacts left in the workspace
    fn finish(&self, instance: &SandboxInstance, outcome: RunOutcome) -> ExecutionResult {
        let collection = match instance.workspace() {
            Some(workspace) => self.collector.collect(workspace, instance.id()),
            None => Default::default(),
        };
        debug!(
            "Instance {} produced {} artifact(s)",
            instance.id(),
            collection.artifacts.len()
        );

        ExecutionResult {
            success: outcome.error_kind.is_none(),
            stdout: outcome.stdout,
            stderr: outcome.stderr,
            exit_code: outcome.exit_code,
            signal: outcome.signal,
            artifacts: collection.artifacts,
            error_kind: outcome.error_kind,
            diagnostic_message: outcome.diagnostic,
            instance_id: Some(instance.id().to_string()),
            wall_time_ms: outcome.wall_time.as_millis() as u64,
            cpu_time_ms: outcome.cpu_time.as_millis() as u64,
            warnings: collection.warnings,
        }
    }

    fn run_display(
        &self,
        request: &ExecutionRequest,
        manifest: &ToolManifest,
        cancel: Option<&CancellationToken>,
    ) -> ExecutionResult {
        let actions = match parse_actions(request.arguments()) {
            Ok(actions) => actions,
            Err(e) => return ExecutionResult::rejected(ErrorKind::SetupFailure, e.to_string()),
        };

        let call_id = uuid::Uuid::new_v4().to_string();
        let capture_dir = match capture_dir(&self.config.base_dir, &call_id) {
            Ok(dir) => dir,
            Err(e) => return ExecutionResult::rejected(ErrorKind::SetupFailure, e.to_string()),
        };

        let started = std::time::Instant::now();
        let run = GuiExecutor::new(self.gate.as_ref(), self.audit.as_ref(), self.display.as_ref())
            .run(
                request.principal_id(),
                &manifest.id,
                &actions,
                capture_dir.path(),
                started + request.timeout(),
                cancel,
            );
        let collection = self.collector.collect(capture_dir.path(), &call_id);

        let (error_kind, diagnostic_message) = match &run.failure {
            Some((kind, message)) => (Some(*kind), message.clone()),
            None => (None, String::new()),
        };
        let mut result = ExecutionResult {
            success: run.succeeded(),
            stdout: run.log.iter().map(|line| format!("{}\n", line)).collect(),
            stderr: String::new(),
            exit_code: None,
            signal: None,
            artifacts: collection.artifacts,
            error_kind,
            diagnostic_message,
            instance_id: Some(call_id),
            wall_time_ms: started.elapsed().as_millis() as u64,
            cpu_time_ms: 0,
            warnings: collection.warnings,
        };

        if let Err(e) = capture_dir.close() {
            warn!("Removing display capture directory failed: {}", e);
            result.note_cleanup_failure(e.to_string());
        }
        result
    }
}

/// A run error is a setup failure only while no tool process existed
fn run_failure_kind(state: SandboxState) -> ErrorKind {
    match state {
        SandboxState::Created | SandboxState::Prepared | SandboxState::SetupFailed => {
            ErrorKind::SetupFailure
        }
        _ => ErrorKind::ExecutionCrash,
    }
}

fn capture_dir(base_dir: &Path, call_id: &str) -> Result<tempfile::TempDir> {
    std::fs::create_dir_all(base_dir)?;
    Ok(tempfile::Builder::new()
        .prefix(&format!("display-{}-", call_id))
        .tempdir_in(base_dir)?)
}

fn denial_message(denial: &Denial) -> String {
    match denial {
        Denial::Denied(reason) => format!("Permission denied: {}", reason),
        Denial::Undecidable(err) => format!("Permission denied (policy undecidable): {}", err),
    }
}

/// Wires collaborators into an [`ExecutionEngine`]
pub struct ExecutionEngineBuilder {
    config: EngineConfig,
    gate: Option<Arc<dyn CapabilityGate>>,
    audit: Arc<dyn AuditSink>,
    registry: Option<Arc<dyn ToolRegistry>>,
    display: Option<Arc<dyn DisplayBackend>>,
}

impl ExecutionEngineBuilder {
    pub fn new(config: EngineConfig) -> Self {
        Self {
            config,
            gate: None,
            audit: Arc::new(LogAuditSink),
            registry: None,
            display: None,
        }
    }

    pub fn gate(mut self, gate: Arc<dyn CapabilityGate>) -> Self {
        self.gate = Some(gate);
        self
    }

    pub fn audit(mut self, audit: Arc<dyn AuditSink>) -> Self {
        self.audit = audit;
        self
    }

    pub fn registry(mut self, registry: Arc<dyn ToolRegistry>) -> Self {
        self.registry = Some(registry);
        self
    }

    pub fn display_backend(mut self, backend: Arc<dyn DisplayBackend>) -> Self {
        self.display = Some(backend);
        self
    }

    pub fn build(self) -> Result<ExecutionEngine> {
        self.config.validate()?;
        let gate = self
            .gate
            .ok_or_else(|| SandboxError::InvalidConfig("No capability gate configured".into()))?;
        let registry = self
            .registry
            .ok_or_else(|| SandboxError::InvalidConfig("No tool registry configured".into()))?;
        let display = self
            .display
            .unwrap_or_else(|| Arc::new(CommandBackend::from_env()));

        let host = SystemCapabilities::detect();
        if !host.can_sandbox() {
            warn!(
                "Host cannot sandbox tools; plugin requests will fail setup:\n{}",
                host.summary()
            );
        }

        let mut collector = ArtifactCollector::new();
        if let Some(dir) = &self.config.artifact_export_dir {
            collector = collector.with_export_dir(dir);
        }

        debug!("Execution engine ready, instances under {}", self.config.base_dir.display());
        Ok(ExecutionEngine {
            executor: SandboxExecutor::new(&self.config),
            config: self.config,
            gate,
            audit: self.audit,
            registry,
            display,
            collector,
            spawn_count: AtomicU64::new(0),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::capability::{
        CAP_DISPLAY_POINTER, CAP_SANDBOX_NETWORK, Capability, Decision, GateError,
        MemoryAuditSink, StaticPolicy,
    };
    use crate::gui::testing::RecordingBackend;
    use crate::registry::{EntryPoint, Grant, StaticRegistry};
    use crate::request::TrustTier;
    use serde_json::{Map, json};
    use std::collections::BTreeSet;
    use std::path::PathBuf;

    struct UnreachableGate;

    impl CapabilityGate for UnreachableGate {
        fn check(
            &self,
            _principal_id: &str,
            _required: &BTreeSet<Capability>,
        ) -> std::result::Result<Decision, GateError> {
            Err(GateError::Unavailable("connection refused".to_string()))
        }
    }

    fn plugin() -> ToolManifest {
        plugin_named("csv")
    }

    fn plugin_named(id: &str) -> ToolManifest {
        ToolManifest::plugin(
            id,
            EntryPoint {
                interpreter: PathBuf::from("/bin/sh"),
                interpreter_args: Vec::new(),
                script: PathBuf::from("/nonexistent/csv.sh"),
            },
        )
        .require("fs.write")
    }

    struct Fixture {
        base: tempfile::TempDir,
        audit: Arc<MemoryAuditSink>,
        backend: Arc<RecordingBackend>,
        engine: ExecutionEngine,
    }

    fn fixture(gate: Arc<dyn CapabilityGate>) -> Fixture {
        let base = tempfile::tempdir().unwrap();
        let config = EngineConfig::builder()
            .base_dir(base.path())
            .build()
            .unwrap();
        let registry = StaticRegistry::new()
            .with_tool(plugin())
            .unwrap()
            .with_tool(
                plugin_named("csv-net")
                    .with_trust_tier(TrustTier::Elevated)
                    .with_grant(Grant::Network),
            )
            .unwrap()
            .with_tool(ToolManifest::display("desk"))
            .unwrap();
        let audit = Arc::new(MemoryAuditSink::new());
        let backend = Arc::new(RecordingBackend::default());
        let engine = ExecutionEngine::builder(config)
            .gate(gate)
            .audit(audit.clone())
            .registry(Arc::new(registry))
            .display_backend(backend.clone())
            .build()
            .unwrap();
        Fixture {
            base,
            audit,
            backend,
            engine,
        }
    }

    fn leftover_entries(base: &Path) -> usize {
        std::fs::read_dir(base).map(|d| d.count()).unwrap_or(0)
    }

    #[test]
    fn engine_is_shareable_across_workers() {
        fn assert_send_sync<T: Send + Sync>() {}
        assert_send_sync::<ExecutionEngine>();
    }

    #[test]
    fn strategy_follows_tool_class() {
        assert_eq!(
            ExecutionStrategy::for_manifest(&plugin()),
            ExecutionStrategy::Sandboxed
        );
        assert_eq!(
            ExecutionStrategy::for_manifest(&ToolManifest::display("d")),
            ExecutionStrategy::DirectDisplay
        );
    }

    #[test]
    fn builder_requires_gate_and_registry() {
        assert!(ExecutionEngine::builder(EngineConfig::default()).build().is_err());
    }

    #[test]
    fn missing_capability_never_spawns() {
        let f = fixture(Arc::new(StaticPolicy::new().grant("alice", ["fs.read"])));
        let request = ExecutionRequest::new("csv", "alice", Map::new());
        let result = f.engine.execute(&request, None);

        assert!(!result.success);
        assert_eq!(result.error_kind, Some(ErrorKind::PermissionDenied));
        assert!(result.diagnostic_message.contains("fs.write"));
        assert_eq!(f.engine.spawn_count(), 0);
        assert_eq!(leftover_entries(f.base.path()), 0);

        let records = f.audit.records();
        assert_eq!(records.len(), 1);
        assert_eq!(records[0].action, EXECUTE_ACTION);
        assert!(!records[0].success);
    }

    #[test]
    fn unreachable_gate_fails_closed() {
        let f = fixture(Arc::new(UnreachableGate));
        let request = ExecutionRequest::new("csv", "alice", Map::new());
        let result = f.engine.execute(&request, None);
        assert_eq!(result.error_kind, Some(ErrorKind::PermissionDenied));
        assert!(result.diagnostic_message.contains("undecidable"));
        assert_eq!(f.engine.spawn_count(), 0);
    }

    #[test]
    fn unknown_tool_is_a_setup_failure() {
        let f = fixture(Arc::new(StaticPolicy::new()));
        let request = ExecutionRequest::new("nope", "alice", Map::new());
        let result = f.engine.execute(&request, None);
        assert_eq!(result.error_kind, Some(ErrorKind::SetupFailure));
        assert!(f.audit.records().is_empty());
    }

    #[test]
    fn invalid_request_is_rejected_before_the_gate() {
        let f = fixture(Arc::new(StaticPolicy::new()));
        let request = ExecutionRequest::new("csv", "alice", Map::new()).with_timeout_s(0);
        let result = f.engine.execute(&request, None);
        assert_eq!(result.error_kind, Some(ErrorKind::SetupFailure));
        assert!(f.audit.records().is_empty());
    }

    #[test]
    fn setup_failure_cleans_up_and_does_not_spawn() {
        let f = fixture(Arc::new(StaticPolicy::new().grant("alice", ["fs.*"])));
        let request = ExecutionRequest::new("csv", "alice", Map::new());
        let result = f.engine.execute(&request, None);

        assert_eq!(result.error_kind, Some(ErrorKind::SetupFailure));
        assert!(result.diagnostic_message.contains("entry script"));
        assert!(result.instance_id.is_some());
        assert_eq!(f.engine.spawn_count(), 0);
        assert_eq!(leftover_entries(f.base.path()), 0);
    }

    #[test]
    fn errors_after_spawn_are_crashes() {
        assert_eq!(run_failure_kind(SandboxState::SetupFailed), ErrorKind::SetupFailure);
        assert_eq!(run_failure_kind(SandboxState::Prepared), ErrorKind::SetupFailure);
        assert_eq!(run_failure_kind(SandboxState::Crashed), ErrorKind::ExecutionCrash);
        assert_eq!(run_failure_kind(SandboxState::Running), ErrorKind::ExecutionCrash);
    }

    #[test]
    fn elevated_grant_needs_its_capability() {
        let f = fixture(Arc::new(StaticPolicy::new().grant("alice", ["fs.write"])));
        let request = ExecutionRequest::new("csv-net", "alice", Map::new())
            .with_trust_tier(TrustTier::Elevated);
        let result = f.engine.execute(&request, None);
        assert_eq!(result.error_kind, Some(ErrorKind::PermissionDenied));
        assert!(result.diagnostic_message.contains(CAP_SANDBOX_NETWORK));
    }

    #[test]
    fn display_denial_stops_before_pointer_event() {
        let f = fixture(Arc::new(
            StaticPolicy::new().grant("alice", ["display.capture"]),
        ));
        let mut args = Map::new();
        args.insert(
            "actions".to_string(),
            json!([
                {"action": "screenshot"},
                {"action": "click"},
                {"action": "key_press", "keys": "Return"}
            ]),
        );
        let request = ExecutionRequest::new("desk", "alice", args);
        let result = f.engine.execute(&request, None);

        assert!(!result.success);
        assert_eq!(result.error_kind, Some(ErrorKind::PermissionDenied));
        assert_eq!(f.backend.calls(), vec!["capture"]);
        assert_eq!(result.artifacts.len(), 1);
        assert_eq!(result.artifacts[0].name, "capture-0.png");
        assert_eq!(result.stdout, "screenshot -> capture-0.png\n");
        assert_eq!(f.engine.spawn_count(), 0);
        assert_eq!(leftover_entries(f.base.path()), 0);

        // invocation check plus one per attempted action
        let records = f.audit.records();
        assert_eq!(records.len(), 3);
        assert_eq!(records[2].action, "display.click");
        assert!(!records[2].success);
    }

    #[test]
    fn display_sequence_runs_when_fully_granted() {
        let f = fixture(Arc::new(StaticPolicy::new().grant("alice", [CAP_DISPLAY_POINTER])));
        let mut args = Map::new();
        args.insert(
            "actions".to_string(),
            json!([
                {"action": "move_pointer", "x": 5, "y": 5},
                {"action": "click", "button": "left"}
            ]),
        );
        let result = f
            .engine
            .execute(&ExecutionRequest::new("desk", "alice", args), None);
        assert!(result.success, "{}", result.diagnostic_message);
        assert_eq!(f.backend.calls(), vec!["move_pointer", "click"]);
        assert_eq!(result.stdout.lines().count(), 2);
    }

    #[test]
    fn malformed_display_actions_are_setup_failures() {
        let f = fixture(Arc::new(StaticPolicy::new().grant("alice", ["display.*"])));
        let mut args = Map::new();
        args.insert("actions".to_string(), json!([{"action": "format_disk"}]));
        let result = f
            .engine
            .execute(&ExecutionRequest::new("desk", "alice", args), None);
        assert_eq!(result.error_kind, Some(ErrorKind::SetupFailure));
        assert!(f.backend.calls().is_empty());
    }
}
