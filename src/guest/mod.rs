//! Guest command channel.
//!
//! The coordinator reads in-guest state (block-device resize
//! acknowledgments, file checksums) through a remote command channel. The
//! channel is a consumed collaborator behind the `GuestExec` trait so the
//! coordinator can be driven against an in-memory guest in tests; the
//! production implementation shells out over SSH.

mod ssh;

pub use ssh::SshGuestExec;

use async_trait::async_trait;
use thiserror::Error;

/// Kernel log line emitted once per completed block-device resize.
/// The count of these lines since boot is the guest's resize counter.
const RESIZE_LOG_PATTERN: &str = "new size";

/// Addresses a guest for command execution.
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub struct GuestRef {
    pub namespace: String,
    pub name: String,
}

impl GuestRef {
    pub fn new(namespace: &str, name: &str) -> Self {
        Self {
            namespace: namespace.to_string(),
            name: name.to_string(),
        }
    }
}

impl std::fmt::Display for GuestRef {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}/{}", self.namespace, self.name)
    }
}

/// Errors from the guest command channel.
#[derive(Error, Debug)]
pub enum GuestError {
    /// The channel could not be established (guest down, agent not ready).
    #[error("guest {guest} unreachable: {detail}")]
    Unreachable { guest: String, detail: String },

    /// The command ran but exited nonzero.
    #[error("command '{command}' failed in guest {guest}: {stderr}")]
    CommandFailed {
        guest: String,
        command: String,
        stderr: String,
    },

    /// The command output did not parse as expected.
    #[error("unexpected output from guest {guest}: {detail}")]
    UnexpectedOutput { guest: String, detail: String },
}

impl GuestError {
    /// Connectivity problems are worth retrying; a failed or garbled
    /// command is not going to fix itself.
    pub fn is_retryable(&self) -> bool {
        matches!(self, GuestError::Unreachable { .. })
    }
}

/// Executes shell commands inside a guest and returns stdout.
#[async_trait]
pub trait GuestExec: Send + Sync {
    async fn run(&self, guest: &GuestRef, command: &str) -> Result<String, GuestError>;
}

/// Count completed block-device resize acknowledgments since guest boot.
///
/// Monotonic for the lifetime of one guest kernel; restarts at zero with a
/// new VirtualMachineInstance.
pub async fn resize_event_count(
    exec: &dyn GuestExec,
    guest: &GuestRef,
) -> Result<u64, GuestError> {
    // `grep -c` exits nonzero on zero matches, hence the `|| true`
    let command = format!("sudo dmesg | grep -c '{}' || true", RESIZE_LOG_PATTERN);
    let out = exec.run(guest, &command).await?;
    out.trim()
        .parse()
        .map_err(|_| GuestError::UnexpectedOutput {
            guest: guest.to_string(),
            detail: format!("resize count not an integer: '{}'", out.trim()),
        })
}

/// Capture the guest kernel log for timeout postmortems.
pub async fn kernel_log(exec: &dyn GuestExec, guest: &GuestRef) -> Result<String, GuestError> {
    exec.run(guest, "sudo dmesg").await
}

/// SHA-256 checksum of a file in the guest.
pub async fn file_sha256(
    exec: &dyn GuestExec,
    guest: &GuestRef,
    path: &str,
) -> Result<String, GuestError> {
    let out = exec.run(guest, &format!("sha256sum {}", path)).await?;
    out.split_whitespace()
        .next()
        .map(str::to_string)
        .ok_or_else(|| GuestError::UnexpectedOutput {
            guest: guest.to_string(),
            detail: format!("empty sha256sum output for '{}'", path),
        })
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used, clippy::indexing_slicing)]
mod tests {
    use super::*;
    use std::collections::HashMap;
    use std::sync::Mutex;

    struct ScriptedGuest {
        responses: Mutex<HashMap<&'static str, String>>,
    }

    #[async_trait]
    impl GuestExec for ScriptedGuest {
        async fn run(&self, guest: &GuestRef, command: &str) -> Result<String, GuestError> {
            let responses = self.responses.lock().unwrap();
            responses
                .iter()
                .find(|(k, _)| command.contains(*k))
                .map(|(_, v)| v.clone())
                .ok_or_else(|| GuestError::CommandFailed {
                    guest: guest.to_string(),
                    command: command.to_string(),
                    stderr: "not scripted".to_string(),
                })
        }
    }

    fn scripted(entries: &[(&'static str, &str)]) -> ScriptedGuest {
        ScriptedGuest {
            responses: Mutex::new(
                entries
                    .iter()
                    .map(|(k, v)| (*k, v.to_string()))
                    .collect(),
            ),
        }
    }

    #[tokio::test]
    async fn test_resize_event_count_parses_grep_output() {
        let exec = scripted(&[("grep -c", "3\n")]);
        let guest = GuestRef::new("default", "guest");
        assert_eq!(resize_event_count(&exec, &guest).await.unwrap(), 3);
    }

    #[tokio::test]
    async fn test_resize_event_count_rejects_garbage() {
        let exec = scripted(&[("grep -c", "not-a-number\n")]);
        let guest = GuestRef::new("default", "guest");
        assert!(matches!(
            resize_event_count(&exec, &guest).await,
            Err(GuestError::UnexpectedOutput { .. })
        ));
    }

    #[tokio::test]
    async fn test_file_sha256_takes_first_token() {
        let exec = scripted(&[("sha256sum", "abc123  /root/random_data_file\n")]);
        let guest = GuestRef::new("default", "guest");
        assert_eq!(
            file_sha256(&exec, &guest, "/root/random_data_file")
                .await
                .unwrap(),
            "abc123"
        );
    }

    #[test]
    fn test_only_unreachable_is_retryable() {
        let unreachable = GuestError::Unreachable {
            guest: "default/guest".to_string(),
            detail: "connection refused".to_string(),
        };
        assert!(unreachable.is_retryable());
        let failed = GuestError::CommandFailed {
            guest: "default/guest".to_string(),
            command: "dmesg".to_string(),
            stderr: "permission denied".to_string(),
        };
        assert!(!failed.is_retryable());
    }
}
