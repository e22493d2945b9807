//! Mock guest channel for functional tests.
//!
//! Simulates the in-guest view the coordinator reads over SSH in
//! production: a kernel log whose "new size" lines are the resize counter.
//! Tests adjust the counter while a wait is in flight to exercise the
//! tolerance band.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use vm_storage_coordinator::guest::{GuestError, GuestExec, GuestRef};

/// In-memory guest. Clone shares the underlying state.
#[derive(Clone, Default)]
pub struct MockGuest {
    resize_count: Arc<AtomicU64>,
    unreachable: Arc<AtomicBool>,
    /// Path to sha256 digest, the guest filesystem as checksums see it.
    file_hashes: Arc<Mutex<HashMap<String, String>>>,
}

impl MockGuest {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_resize_count(count: u64) -> Self {
        let guest = Self::default();
        guest.resize_count.store(count, Ordering::SeqCst);
        guest
    }

    /// Record one completed block-device resize in the guest.
    pub fn acknowledge_resize(&self) {
        self.resize_count.fetch_add(1, Ordering::SeqCst);
    }

    pub fn set_resize_count(&self, count: u64) {
        self.resize_count.store(count, Ordering::SeqCst);
    }

    pub fn resize_count(&self) -> u64 {
        self.resize_count.load(Ordering::SeqCst)
    }

    /// Simulate a guest that cannot be reached (stopped, agent down).
    pub fn set_unreachable(&self, unreachable: bool) {
        self.unreachable.store(unreachable, Ordering::SeqCst);
    }

    /// Set the digest a `sha256sum` of `path` reports. Called again, it
    /// simulates the file's content changing (or being rolled back).
    pub fn set_file_hash(&self, path: &str, digest: &str) {
        if let Ok(mut hashes) = self.file_hashes.lock() {
            hashes.insert(path.to_string(), digest.to_string());
        }
    }

    fn kernel_log(&self) -> String {
        let count = self.resize_count();
        let mut lines = vec!["[    0.000000] Linux version 5.14.0".to_string()];
        for i in 0..count {
            lines.push(format!(
                "[  {}.000000] virtio_blk vda: new size: {} 512-byte logical blocks",
                100 + i,
                41943040 + i
            ));
        }
        lines.join("\n")
    }
}

#[async_trait]
impl GuestExec for MockGuest {
    async fn run(&self, guest: &GuestRef, command: &str) -> Result<String, GuestError> {
        if self.unreachable.load(Ordering::SeqCst) {
            return Err(GuestError::Unreachable {
                guest: guest.to_string(),
                detail: "connection refused".to_string(),
            });
        }

        if command.contains("grep -c") {
            return Ok(format!("{}\n", self.resize_count()));
        }
        if command.contains("dmesg") {
            return Ok(self.kernel_log());
        }
        if let Some(path) = command.strip_prefix("sha256sum ") {
            let digest = self
                .file_hashes
                .lock()
                .ok()
                .and_then(|hashes| hashes.get(path).cloned());
            return match digest {
                Some(digest) => Ok(format!("{}  {}\n", digest, path)),
                None => Err(GuestError::CommandFailed {
                    guest: guest.to_string(),
                    command: command.to_string(),
                    stderr: format!("sha256sum: {}: No such file or directory", path),
                }),
            };
        }
        Err(GuestError::CommandFailed {
            guest: guest.to_string(),
            command: command.to_string(),
            stderr: "command not mocked".to_string(),
        })
    }
}
