//! Runtime detection of the host features the sandbox relies on
//!
//! Probes the running kernel so the CLI can explain why isolation is
//! unavailable instead of failing every request with a setup error.

use std::path::Path;

/// Detected host capabilities for sandboxing
#[derive(Debug, Clone)]
pub struct SystemCapabilities {
    /// Running as root (euid == 0)
    pub has_root: bool,
    /// Unprivileged user namespaces are available
    pub has_user_namespaces: bool,
    /// Seccomp BPF filtering is available
    pub has_seccomp: bool,
    /// Desktop session variables are present (display tools)
    pub has_display: bool,
}

impl SystemCapabilities {
    /// Detect all available capabilities on the current system
    pub fn detect() -> Self {
        Self {
            has_root: detect_root(),
            has_user_namespaces: detect_user_namespaces(),
            has_seccomp: detect_seccomp(),
            has_display: detect_display(),
        }
    }

    /// Sandboxed execution needs both user namespaces and seccomp
    pub fn can_sandbox(&self) -> bool {
        self.has_user_namespaces && self.has_seccomp
    }

    /// Get a human-readable summary of capabilities
    pub fn summary(&self) -> String {
        let check = |available: bool| if available { "[ok]" } else { "[--]" };

        [
            format!("{} Root privileges", check(self.has_root)),
            format!("{} User namespaces", check(self.has_user_namespaces)),
            format!("{} Seccomp BPF", check(self.has_seccomp)),
            format!("{} Desktop session", check(self.has_display)),
        ]
        .join("\n")
    }
}

fn detect_root() -> bool {
    unsafe { libc::geteuid() == 0 }
}

fn detect_user_namespaces() -> bool {
    // Debian/Ubuntu knob
    if read_flag("/proc/sys/kernel/unprivileged_userns_clone") == Some(false) {
        return false;
    }

    // Ubuntu 24.04+ confines unprivileged user namespaces through AppArmor
    if !detect_root()
        && read_flag("/proc/sys/kernel/apparmor_restrict_unprivileged_userns") == Some(true)
    {
        return false;
    }

    if let Ok(content) = std::fs::read_to_string("/proc/sys/user/max_user_namespaces")
        && let Ok(max) = content.trim().parse::<u64>()
    {
        return max > 0;
    }

    Path::new("/proc/self/ns/user").exists()
}

fn read_flag(path: &str) -> Option<bool> {
    let content = std::fs::read_to_string(path).ok()?;
    Some(content.trim() != "0")
}

fn detect_seccomp() -> bool {
    // 0 when available but not active, -1/EINVAL when not built in
    let ret = unsafe { libc::prctl(libc::PR_GET_SECCOMP, 0, 0, 0, 0) };
    ret >= 0
}

fn detect_display() -> bool {
    std::env::var_os("DISPLAY").is_some() || std::env::var_os("WAYLAND_DISPLAY").is_some()
}
