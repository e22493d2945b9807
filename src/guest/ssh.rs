//! SSH-backed guest command execution.
//!
//! Reaches guests through the platform's SSH proxy: each guest is
//! addressable as `<name>.<namespace>` behind a jump host configured in the
//! coordinator's SSH config. Commands run with a bounded timeout so a hung
//! guest cannot wedge a reconcile.

use std::time::Duration;

use async_trait::async_trait;
use tokio::process::Command;
use tracing::debug;

use super::{GuestError, GuestExec, GuestRef};

/// Per-command wall clock budget.
const COMMAND_TIMEOUT: Duration = Duration::from_secs(60);

/// Guest command execution over SSH.
pub struct SshGuestExec {
    /// Login user inside the guest.
    user: String,
    /// Extra options, e.g. ProxyJump for the cluster ingress.
    options: Vec<String>,
}

impl SshGuestExec {
    pub fn new(user: &str, options: Vec<String>) -> Self {
        Self {
            user: user.to_string(),
            options,
        }
    }

    fn host_for(&self, guest: &GuestRef) -> String {
        format!("{}@{}.{}", self.user, guest.name, guest.namespace)
    }
}

#[async_trait]
impl GuestExec for SshGuestExec {
    async fn run(&self, guest: &GuestRef, command: &str) -> Result<String, GuestError> {
        let host = self.host_for(guest);
        debug!(guest = %guest, command = %command, "Running guest command over SSH");

        let mut cmd = Command::new("ssh");
        cmd.arg("-o")
            .arg("BatchMode=yes")
            .arg("-o")
            .arg("StrictHostKeyChecking=no");
        for opt in &self.options {
            cmd.arg("-o").arg(opt);
        }
        cmd.arg(&host).arg(command);

        let output = tokio::time::timeout(COMMAND_TIMEOUT, cmd.output())
            .await
            .map_err(|_| GuestError::Unreachable {
                guest: guest.to_string(),
                detail: format!("command timed out after {:?}", COMMAND_TIMEOUT),
            })?
            .map_err(|e| GuestError::Unreachable {
                guest: guest.to_string(),
                detail: e.to_string(),
            })?;

        if !output.status.success() {
            // ssh exit 255 means the transport failed, not the command
            if output.status.code() == Some(255) {
                return Err(GuestError::Unreachable {
                    guest: guest.to_string(),
                    detail: String::from_utf8_lossy(&output.stderr).into_owned(),
                });
            }
            return Err(GuestError::CommandFailed {
                guest: guest.to_string(),
                command: command.to_string(),
                stderr: String::from_utf8_lossy(&output.stderr).into_owned(),
            });
        }

        Ok(String::from_utf8_lossy(&output.stdout).into_owned())
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used, clippy::indexing_slicing)]
mod tests {
    use super::*;

    #[test]
    fn test_host_addressing() {
        let exec = SshGuestExec::new("cloud-user", vec![]);
        let guest = GuestRef::new("storage-tests", "rhel-guest");
        assert_eq!(exec.host_for(&guest), "cloud-user@rhel-guest.storage-tests");
    }
}
