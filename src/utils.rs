//! Host identity and size parsing helpers

use crate::errors::{Result, SandboxError};

/// Whether the engine runs with an effective uid of 0
pub fn is_root() -> bool {
    get_uid() == 0
}

/// Get current UID
pub fn get_uid() -> u32 {
    unsafe { libc::geteuid() }
}

/// Get current GID
pub fn get_gid() -> u32 {
    unsafe { libc::getegid() }
}

/// Parse memory size string (e.g., "100M", "1G")
pub fn parse_memory_size(s: &str) -> Result<u64> {
    let s = s.trim().to_uppercase();

    let (num_str, multiplier) = if let Some(num) = s.strip_suffix('G') {
        (num, 1024u64 * 1024 * 1024)
    } else if let Some(num) = s.strip_suffix('M') {
        (num, 1024u64 * 1024)
    } else if let Some(num) = s.strip_suffix('K') {
        (num, 1024u64)
    } else if let Some(num) = s.strip_suffix('B') {
        (num, 1u64)
    } else {
        (s.as_str(), 1u64)
    };

    let num: u64 = num_str
        .parse()
        .map_err(|_| SandboxError::InvalidConfig(format!("Invalid memory size: {}", s)))?;

    num.checked_mul(multiplier)
        .ok_or_else(|| SandboxError::InvalidConfig(format!("Memory size overflow: {}", s)))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_memory_size_bytes() {
        assert_eq!(parse_memory_size("100").unwrap(), 100);
        assert_eq!(parse_memory_size("100B").unwrap(), 100);
    }

    #[test]
    fn test_parse_memory_size_megabytes() {
        assert_eq!(parse_memory_size("1M").unwrap(), 1024 * 1024);
        assert_eq!(parse_memory_size("256m").unwrap(), 256 * 1024 * 1024);
    }

    #[test]
    fn test_parse_memory_size_gigabytes() {
        assert_eq!(parse_memory_size("2G").unwrap(), 2 * 1024 * 1024 * 1024);
    }

    #[test]
    fn test_parse_memory_size_kilobytes() {
        assert_eq!(parse_memory_size("64K").unwrap(), 64 * 1024);
    }

    #[test]
    fn test_parse_memory_size_whitespace() {
        assert_eq!(parse_memory_size("  16M  ").unwrap(), 16 * 1024 * 1024);
    }

    #[test]
    fn test_parse_memory_size_invalid() {
        assert!(parse_memory_size("not_a_number").is_err());
        assert!(parse_memory_size("10X").is_err());
    }

    #[test]
    fn test_parse_memory_size_overflow() {
        assert!(parse_memory_size("99999999999999G").is_err());
    }

    #[test]
    fn test_is_root() {
        assert_eq!(is_root(), get_uid() == 0);
    }
}
