//! Child setup reporting over a close-on-exec pipe
//!
//! The child writes one fixed-size record and exits when a setup step fails.
//! A successful `execve` closes the pipe, so the parent reads zero bytes.

use std::io::Read;
use std::os::fd::{AsRawFd, BorrowedFd};

use crate::errors::SandboxError;

const STAGE_CAPACITY: usize = 60;

/// A failed setup step inside the child: which stage and its errno
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ChildFault {
    pub stage: &'static str,
    pub errno: i32,
}

impl ChildFault {
    pub fn new(stage: &'static str, errno: i32) -> Self {
        Self { stage, errno }
    }

    /// Capture errno right after a failed libc call
    pub fn last_os_error(stage: &'static str) -> Self {
        let errno = std::io::Error::last_os_error()
            .raw_os_error()
            .unwrap_or(libc::EIO);
        Self { stage, errno }
    }

    fn encode(&self) -> ([u8; 4 + STAGE_CAPACITY], usize) {
        let mut buf = [0u8; 4 + STAGE_CAPACITY];
        buf[..4].copy_from_slice(&self.errno.to_le_bytes());
        let stage = self.stage.as_bytes();
        let len = stage.len().min(STAGE_CAPACITY);
        buf[4..4 + len].copy_from_slice(&stage[..len]);
        (buf, 4 + len)
    }

    /// Write the record to the status pipe. Async-signal-safe.
    pub fn report(&self, fd: BorrowedFd<'_>) {
        let (buf, len) = self.encode();
        // SAFETY: writing a stack buffer to an open descriptor
        unsafe {
            libc::write(fd.as_raw_fd(), buf.as_ptr() as *const libc::c_void, len);
        }
    }
}

/// What the parent learned from the status pipe
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ExecReport {
    /// Pipe closed by exec: the tool program is running
    Started,
    /// Setup failed before exec
    Failed { stage: String, errno: i32 },
}

impl ExecReport {
    pub fn decode(bytes: &[u8]) -> Self {
        if bytes.len() < 4 {
            if bytes.is_empty() {
                return ExecReport::Started;
            }
            return ExecReport::Failed {
                stage: "status".to_string(),
                errno: libc::EIO,
            };
        }
        let errno = i32::from_le_bytes([bytes[0], bytes[1], bytes[2], bytes[3]]);
        let stage = String::from_utf8_lossy(&bytes[4..]).into_owned();
        ExecReport::Failed { stage, errno }
    }

    /// Block until the child execs or reports a failure
    pub fn read_from(mut reader: impl Read) -> std::io::Result<Self> {
        let mut bytes = Vec::with_capacity(4 + STAGE_CAPACITY);
        reader.read_to_end(&mut bytes)?;
        Ok(Self::decode(&bytes))
    }

    pub fn into_error(self) -> Option<SandboxError> {
        match self {
            ExecReport::Started => None,
            ExecReport::Failed { stage, errno } => Some(SandboxError::ChildSetup {
                stage,
                message: std::io::Error::from_raw_os_error(errno).to_string(),
            }),
        }
    }
}
