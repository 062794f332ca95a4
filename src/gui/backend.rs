//! Host display backends

use log::{debug, warn};
use std::io::Read;
use std::path::Path;
use std::process::{Command, Stdio};
use std::thread;
use std::time::{Duration, Instant};
use thiserror::Error;

use super::MouseButton;

/// Environment forwarded to display helpers. Nothing else is inherited.
const DESKTOP_ENV_KEYS: &[&str] = &[
    "DBUS_SESSION_BUS_ADDRESS",
    "DISPLAY",
    "WAYLAND_DISPLAY",
    "XDG_RUNTIME_DIR",
    "XAUTHORITY",
];

const HELPER_POLL: Duration = Duration::from_millis(10);

#[derive(Error, Debug)]
pub enum DisplayError {
    #[error("display backend unavailable: {0}")]
    Unavailable(String),

    #[error("{program} failed: {message}")]
    CommandFailed { program: String, message: String },

    #[error("{program} did not finish in time")]
    TimedOut { program: String },

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// Primitive host-display operations.
///
/// Each call must give up by `deadline`.
pub trait DisplayBackend: Send + Sync {
    /// Write a PNG of the whole screen to `dest`
    fn capture(&self, dest: &Path, deadline: Instant) -> Result<(), DisplayError>;

    fn move_pointer(&self, x: i32, y: i32, deadline: Instant) -> Result<(), DisplayError>;

    fn click(&self, button: MouseButton, deadline: Instant) -> Result<(), DisplayError>;

    /// Inject a key chord such as `ctrl+c` or `Return`
    fn key_press(&self, keys: &str, deadline: Instant) -> Result<(), DisplayError>;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum CaptureTool {
    Grim,
    ImageMagickImport,
}

/// Drives the display through `xdotool` and `grim` or ImageMagick `import`
#[derive(Debug, Clone)]
pub struct CommandBackend {
    env: Vec<(String, String)>,
}

impl CommandBackend {
    /// Forward the caller's desktop session variables
    pub fn from_env() -> Self {
        let mut env: Vec<(String, String)> = DESKTOP_ENV_KEYS
            .iter()
            .filter_map(|key| std::env::var(key).ok().map(|v| (key.to_string(), v)))
            .collect();
        if let Ok(path) = std::env::var("PATH") {
            env.push(("PATH".to_string(), path));
        }
        Self { env }
    }

    fn path_var(&self) -> Option<&str> {
        self.env
            .iter()
            .find(|(k, _)| k == "PATH")
            .map(|(_, v)| v.as_str())
    }

    fn command_exists(&self, name: &str) -> bool {
        self.path_var()
            .map(|paths| std::env::split_paths(paths).any(|dir| dir.join(name).is_file()))
            .unwrap_or(false)
    }

    fn capture_tool(&self) -> Result<CaptureTool, DisplayError> {
        if self.command_exists("grim") {
            return Ok(CaptureTool::Grim);
        }
        if self.command_exists("import") {
            return Ok(CaptureTool::ImageMagickImport);
        }
        Err(DisplayError::Unavailable(
            "screen capture needs 'grim' (Wayland) or 'import' (ImageMagick/X11)".to_string(),
        ))
    }

    /// Run a helper to completion, killing it once `deadline` passes
    fn run(&self, program: &str, args: &[String], deadline: Instant) -> Result<(), DisplayError> {
        if !self.command_exists(program) {
            return Err(DisplayError::Unavailable(format!("'{}' not found in PATH", program)));
        }
        debug!("display: {} {:?}", program, args);

        let mut child = Command::new(program)
            .args(args)
            .env_clear()
            .envs(self.env.iter().map(|(k, v)| (k.as_str(), v.as_str())))
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::piped())
            .spawn()?;

        let status = loop {
            if let Some(status) = child.try_wait()? {
                break status;
            }
            if Instant::now() >= deadline {
                warn!("display helper {} (pid {}) overran its deadline", program, child.id());
                let _ = child.kill();
                let _ = child.wait();
                return Err(DisplayError::TimedOut {
                    program: program.to_string(),
                });
            }
            thread::sleep(HELPER_POLL);
        };

        if !status.success() {
            let mut stderr = String::new();
            if let Some(mut pipe) = child.stderr.take() {
                let _ = pipe.read_to_string(&mut stderr);
            }
            return Err(DisplayError::CommandFailed {
                program: program.to_string(),
                message: format!("{}: {}", status, stderr.trim()),
            });
        }
        Ok(())
    }
}

impl DisplayBackend for CommandBackend {
    fn capture(&self, dest: &Path, deadline: Instant) -> Result<(), DisplayError> {
        let dest = dest.to_string_lossy().into_owned();
        match self.capture_tool()? {
            CaptureTool::Grim => self.run("grim", &[dest], deadline),
            CaptureTool::ImageMagickImport => self.run(
                "import",
                &["-window".to_string(), "root".to_string(), format!("png:{}", dest)],
                deadline,
            ),
        }
    }

    fn move_pointer(&self, x: i32, y: i32, deadline: Instant) -> Result<(), DisplayError> {
        self.run(
            "xdotool",
            &["mousemove".to_string(), x.to_string(), y.to_string()],
            deadline,
        )
    }

    fn click(&self, button: MouseButton, deadline: Instant) -> Result<(), DisplayError> {
        self.run(
            "xdotool",
            &["click".to_string(), button.xdotool_code().to_string()],
            deadline,
        )
    }

    fn key_press(&self, keys: &str, deadline: Instant) -> Result<(), DisplayError> {
        self.run(
            "xdotool",
            &["key".to_string(), "--".to_string(), keys.to_string()],
            deadline,
        )
    }
}
