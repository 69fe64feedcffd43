//! Shell transport
//!
//! The lowest layer of the remote driver: run one command over the network
//! shell and report its output. The production transport spawns a configured
//! argv prefix (typically `ssh -T user@host`) per command; spawn failures and
//! ssh's connection-failure exit code surface as
//! [`SiteError::TransientConnection`] so the session layer can apply its
//! re-login-and-retry policy.

use std::process::Stdio;

use async_trait::async_trait;
use tokio::process::Command;

use gantry_core::error::{SiteError, SiteResult};

/// ssh reports connection-level failures with this exit code.
const CONNECTION_FAILURE_EXIT: i32 = 255;

/// Captured output of one remote command.
#[derive(Debug, Clone)]
pub struct ShellOutput {
    pub stdout: String,
    pub stderr: String,
    pub exit_code: i32,
}

impl ShellOutput {
    pub fn success(&self) -> bool {
        self.exit_code == 0
    }
}

/// One-command execution over an established channel.
#[async_trait]
pub trait ShellTransport: Send + Sync {
    async fn exec(&self, command: &str) -> SiteResult<ShellOutput>;
}

/// Transport that spawns `program args.. command` per call.
pub struct ProcessTransport {
    program: String,
    args: Vec<String>,
}

impl ProcessTransport {
    pub fn new(program: impl Into<String>, args: Vec<String>) -> Self {
        Self {
            program: program.into(),
            args,
        }
    }

    /// Build from a shell prefix plus the target machine, e.g.
    /// `["ssh", "-T"]` and `"jdoe@hpc.example.gov"`.
    pub fn for_machine(shell_prefix: &[String], machine: &str) -> Self {
        let program = shell_prefix
            .first()
            .cloned()
            .unwrap_or_else(|| "ssh".to_string());
        let mut args: Vec<String> = shell_prefix.iter().skip(1).cloned().collect();
        args.push(machine.to_string());
        Self { program, args }
    }
}

#[async_trait]
impl ShellTransport for ProcessTransport {
    async fn exec(&self, command: &str) -> SiteResult<ShellOutput> {
        let output = Command::new(&self.program)
            .args(&self.args)
            .arg(command)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .output()
            .await
            .map_err(|err| {
                SiteError::TransientConnection(format!("spawn {}: {}", self.program, err))
            })?;

        let exit_code = output.status.code().unwrap_or(-1);
        let stdout = String::from_utf8_lossy(&output.stdout).to_string();
        let stderr = String::from_utf8_lossy(&output.stderr).to_string();

        if exit_code == CONNECTION_FAILURE_EXIT {
            let reason = if stderr.trim().is_empty() {
                format!("connection failure (exit {})", exit_code)
            } else {
                stderr.trim().to_string()
            };
            return Err(SiteError::TransientConnection(reason));
        }

        Ok(ShellOutput {
            stdout,
            stderr,
            exit_code,
        })
    }
}
