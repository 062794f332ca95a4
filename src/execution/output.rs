//! Bounded capture of process output

use std::io::Read;
use std::os::fd::OwnedFd;
use std::thread;

/// Keeps the first `limit` bytes of a stream and counts the rest
#[derive(Debug, Clone)]
pub struct BoundedBuffer {
    data: Vec<u8>,
    limit: usize,
    omitted: u64,
}

impl BoundedBuffer {
    pub fn new(limit: usize) -> Self {
        Self {
            data: Vec::with_capacity(limit.min(8192)),
            limit,
            omitted: 0,
        }
    }

    pub fn push(&mut self, chunk: &[u8]) {
        let room = self.limit.saturating_sub(self.data.len());
        let take = room.min(chunk.len());
        self.data.extend_from_slice(&chunk[..take]);
        self.omitted += (chunk.len() - take) as u64;
    }

    pub fn omitted(&self) -> u64 {
        self.omitted
    }

    pub fn is_truncated(&self) -> bool {
        self.omitted > 0
    }

    /// Lossy UTF-8 text, with a truncation marker when bytes were dropped
    pub fn into_string(self) -> String {
        let mut text = String::from_utf8_lossy(&self.data).into_owned();
        if self.omitted > 0 {
            text.push_str(&format!(
                "\n[... output truncated: {} bytes omitted]\n",
                self.omitted
            ));
        }
        text
    }
}

/// Drain `fd` on a reader thread until EOF.
///
/// Keeps reading past the cap so the writer never blocks on a full pipe.
pub fn spawn_fd_reader(
    fd: OwnedFd,
    limit: usize,
    name: &str,
) -> std::io::Result<thread::JoinHandle<BoundedBuffer>> {
    thread::Builder::new()
        .name(format!("sandbox-{}", name))
        .spawn(move || {
            let mut file = std::fs::File::from(fd);
            let mut buffer = BoundedBuffer::new(limit);
            let mut chunk = vec![0u8; 4096];

            loop {
                match file.read(&mut chunk) {
                    Ok(0) => break,
                    Ok(n) => buffer.push(&chunk[..n]),
                    Err(e) if e.kind() == std::io::ErrorKind::Interrupted => continue,
                    Err(_) => break,
                }
            }
            buffer
        })
}
