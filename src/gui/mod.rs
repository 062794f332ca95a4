//! Direct host-display execution path
//!
//! Display tools cannot work inside the namespace sandbox, so they run on
//! the host. In exchange every single action is authorized and audited on
//! its own against a `display.*` capability, and the first denial or
//! failure stops the sequence. The request's wall-clock budget and its
//! cancellation token bound the whole sequence.

pub mod backend;

pub use backend::{CommandBackend, DisplayBackend, DisplayError};

use log::{info, warn};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::collections::BTreeSet;
use std::path::{Path, PathBuf};
use std::time::Instant;

use crate::capability::{
    AuditSink, CAP_DISPLAY_CAPTURE, CAP_DISPLAY_KEYBOARD, CAP_DISPLAY_POINTER, Capability,
    CapabilityGate, authorize,
};
use crate::errors::{Result, SandboxError};
use crate::execution::CancellationToken;
use crate::result::ErrorKind;

/// Argument key holding the action list
pub const ACTIONS_KEY: &str = "actions";

const MAX_KEYS_LEN: usize = 64;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MouseButton {
    #[default]
    Left,
    Middle,
    Right,
}

impl MouseButton {
    pub fn xdotool_code(self) -> u8 {
        match self {
            MouseButton::Left => 1,
            MouseButton::Middle => 2,
            MouseButton::Right => 3,
        }
    }
}

/// One allow-listed display action
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "action", rename_all = "snake_case")]
pub enum GuiAction {
    Screenshot,
    MovePointer {
        x: i32,
        y: i32,
    },
    Click {
        #[serde(default)]
        button: MouseButton,
    },
    KeyPress {
        keys: String,
    },
}

impl GuiAction {
    /// The capability class this action is checked against
    pub fn capability(&self) -> &'static str {
        match self {
            GuiAction::Screenshot => CAP_DISPLAY_CAPTURE,
            GuiAction::MovePointer { .. } | GuiAction::Click { .. } => CAP_DISPLAY_POINTER,
            GuiAction::KeyPress { .. } => CAP_DISPLAY_KEYBOARD,
        }
    }

    pub fn name(&self) -> &'static str {
        match self {
            GuiAction::Screenshot => "screenshot",
            GuiAction::MovePointer { .. } => "move_pointer",
            GuiAction::Click { .. } => "click",
            GuiAction::KeyPress { .. } => "key_press",
        }
    }

    fn validate(&self) -> Result<()> {
        if let GuiAction::KeyPress { keys } = self {
            let valid = !keys.is_empty()
                && keys.len() <= MAX_KEYS_LEN
                && keys
                    .chars()
                    .all(|c| c.is_ascii_alphanumeric() || matches!(c, '+' | '_' | '-'));
            if !valid {
                return Err(SandboxError::InvalidArguments(format!(
                    "Invalid key chord: {:?}",
                    keys
                )));
            }
        }
        if let GuiAction::MovePointer { x, y } = self {
            if *x < 0 || *y < 0 {
                return Err(SandboxError::InvalidArguments(format!(
                    "Pointer position must be non-negative: {},{}",
                    x, y
                )));
            }
        }
        Ok(())
    }
}

/// Parse `arguments.actions` completely before anything runs
pub fn parse_actions(arguments: &Map<String, Value>) -> Result<Vec<GuiAction>> {
    let raw = arguments.get(ACTIONS_KEY).ok_or_else(|| {
        SandboxError::InvalidArguments(format!("Display tools need an '{}' list", ACTIONS_KEY))
    })?;
    let actions: Vec<GuiAction> = serde_json::from_value(raw.clone())
        .map_err(|e| SandboxError::InvalidArguments(format!("Invalid action list: {}", e)))?;
    if actions.is_empty() {
        return Err(SandboxError::InvalidArguments(
            "Action list is empty".to_string(),
        ));
    }
    for action in &actions {
        action.validate()?;
    }
    Ok(actions)
}

/// What happened to an action sequence
#[derive(Debug, Default)]
pub struct GuiRun {
    /// One line per executed action
    pub log: Vec<String>,
    /// Files written by capture actions
    pub captures: Vec<PathBuf>,
    /// Set when the sequence was aborted
    pub failure: Option<(ErrorKind, String)>,
}

impl GuiRun {
    pub fn succeeded(&self) -> bool {
        self.failure.is_none()
    }
}

/// Runs action sequences against a [`DisplayBackend`]
pub struct GuiExecutor<'a> {
    gate: &'a dyn CapabilityGate,
    audit: &'a dyn AuditSink,
    backend: &'a dyn DisplayBackend,
}

impl<'a> GuiExecutor<'a> {
    pub fn new(
        gate: &'a dyn CapabilityGate,
        audit: &'a dyn AuditSink,
        backend: &'a dyn DisplayBackend,
    ) -> Self {
        Self {
            gate,
            audit,
            backend,
        }
    }

    /// Authorize and execute each action in order, stopping at the first
    /// denial or failure, at `deadline`, or on cancellation. Captures are
    /// written into `capture_dir`.
    pub fn run(
        &self,
        principal_id: &str,
        tool_id: &str,
        actions: &[GuiAction],
        capture_dir: &Path,
        deadline: Instant,
        cancel: Option<&CancellationToken>,
    ) -> GuiRun {
        let mut run = GuiRun::default();

        for (index, action) in actions.iter().enumerate() {
            let interrupted = if cancel.is_some_and(|c| c.is_cancelled()) {
                Some((ErrorKind::Cancelled, "cancelled"))
            } else if Instant::now() >= deadline {
                Some((ErrorKind::ExecutionTimeout, "timed out"))
            } else {
                None
            };
            if let Some((kind, reason)) = interrupted {
                warn!("Display tool '{}' {} at action {}", tool_id, reason, index);
                run.failure = Some((
                    kind,
                    format!(
                        "{} before action {} ({}); {} remaining action(s) skipped",
                        reason,
                        index,
                        action.name(),
                        actions.len() - index
                    ),
                ));
                return run;
            }

            let required: BTreeSet<Capability> =
                [Capability::new(action.capability())].into_iter().collect();
            let audit_action = format!("display.{}", action.name());

            if let Err(denial) = authorize(
                self.gate,
                self.audit,
                principal_id,
                &required,
                &audit_action,
                tool_id,
            ) {
                warn!(
                    "Display action {} ({}) for '{}' {}",
                    index,
                    action.name(),
                    principal_id,
                    denial
                );
                run.failure = Some((
                    ErrorKind::PermissionDenied,
                    format!(
                        "action {} ({}) {}; {} remaining action(s) skipped",
                        index,
                        action.name(),
                        denial,
                        actions.len() - index - 1
                    ),
                ));
                return run;
            }

            let outcome = match action {
                GuiAction::Screenshot => {
                    let name = format!("capture-{}.png", index);
                    let dest = capture_dir.join(&name);
                    self.backend.capture(&dest, deadline).map(|()| {
                        run.captures.push(dest);
                        format!("screenshot -> {}", name)
                    })
                }
                GuiAction::MovePointer { x, y } => self
                    .backend
                    .move_pointer(*x, *y, deadline)
                    .map(|()| format!("move_pointer {},{}", x, y)),
                GuiAction::Click { button } => self
                    .backend
                    .click(*button, deadline)
                    .map(|()| format!("click {:?}", button).to_lowercase()),
                GuiAction::KeyPress { keys } => self
                    .backend
                    .key_press(keys, deadline)
                    .map(|()| format!("key_press {}", keys)),
            };

            match outcome {
                Ok(line) => run.log.push(line),
                Err(e) => {
                    let e = SandboxError::from(e);
                    warn!("Display action {} ({}) failed: {}", index, action.name(), e);
                    run.failure = Some((
                        e.kind(),
                        format!(
                            "action {} ({}) failed: {}; {} remaining action(s) skipped",
                            index,
                            action.name(),
                            e,
                            actions.len() - index - 1
                        ),
                    ));
                    return run;
                }
            }
        }

        info!(
            "Display tool '{}' ran {} action(s) for '{}'",
            tool_id,
            run.log.len(),
            principal_id
        );
        run
    }
}
