//! Remote command execution over SSH
//!
//! Runs the system `ssh` client. With a configured password the client is
//! wrapped in `sshpass -e`, which reads the password from `SSHPASS`.

use std::process::Stdio;
use thiserror::Error;
use tokio::process::Command;
use tracing::{info, instrument};

use crate::cluster::{ClientError, RemoteShell};

/// Shell errors
#[derive(Error, Debug)]
pub enum ShellError {
    #[error("Failed to spawn ssh: {0}")]
    Spawn(#[from] std::io::Error),

    #[error("Command exited with {code:?}: {stderr}")]
    Exit { code: Option<i32>, stderr: String },
}

/// SSH access to one host
pub struct SshShell {
    host: String,
    user: String,
    port: u16,
    password: Option<String>,
}

impl SshShell {
    pub fn new(host: &str, user: &str, port: u16, password: Option<String>) -> Self {
        Self {
            host: host.to_string(),
            user: user.to_string(),
            port,
            password,
        }
    }

    /// Program and arguments for running `remote` on the host
    fn invocation(&self, remote: &str) -> (String, Vec<String>) {
        let mut args = Vec::new();

        let program = if self.password.is_some() {
            args.push("-e".to_string());
            args.push("ssh".to_string());
            "sshpass"
        } else {
            args.push("-o".to_string());
            args.push("BatchMode=yes".to_string());
            "ssh"
        };

        args.extend([
            "-p".to_string(),
            self.port.to_string(),
            "-o".to_string(),
            "StrictHostKeyChecking=accept-new".to_string(),
            format!("{}@{}", self.user, self.host),
            remote.to_string(),
        ]);

        (program.to_string(), args)
    }
}

#[async_trait::async_trait]
impl RemoteShell for SshShell {
    #[instrument(skip(self), fields(host = %self.host))]
    async fn run(&self, command: &str) -> Result<(), ClientError> {
        let (program, args) = self.invocation(command);

        let mut cmd = Command::new(program);
        cmd.args(&args)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped());
        if let Some(password) = &self.password {
            cmd.env("SSHPASS", password);
        }

        info!(host = %self.host, command = command, "Running remote command");

        let output = cmd.output().await.map_err(ShellError::Spawn)?;
        if !output.status.success() {
            return Err(ShellError::Exit {
                code: output.status.code(),
                stderr: String::from_utf8_lossy(&output.stderr).trim().to_string(),
            }
            .into());
        }

        Ok(())
    }
}
