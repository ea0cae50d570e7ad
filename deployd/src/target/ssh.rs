//! Transport target over the OpenSSH client

use std::path::Path;
use std::process::Stdio;

use async_trait::async_trait;
use tokio::io::AsyncWriteExt;
use tokio::process::Command;
use tracing::debug;

use crate::errors::DeployError;
use crate::storage::settings::ServerConfig;
use crate::target::TransportTarget;

/// Output of one remote command
#[derive(Debug)]
struct CommandOutput {
    stdout: String,
    stderr: String,
    success: bool,
    exit_code: i32,
}

/// Remote server reached through `ssh` in batch mode (key authentication)
#[derive(Debug, Clone)]
pub struct SshTarget {
    host: String,
    user: String,
    port: u16,
    identity_file: Option<String>,
    root_path: String,
}

/// What to feed the remote command on stdin
#[derive(Clone, Copy)]
enum Input<'a> {
    None,
    File(&'a Path),
    Bytes(&'a [u8]),
}

impl SshTarget {
    pub fn new(config: &ServerConfig) -> Result<Self, DeployError> {
        if config.host.trim().is_empty() {
            return Err(DeployError::ConfigError(format!(
                "Server {} has no host",
                config.id
            )));
        }
        Ok(Self {
            host: config.host.clone(),
            user: config.user.clone(),
            port: config.port,
            identity_file: config.identity_file.clone(),
            root_path: config.root_path.clone(),
        })
    }

    fn build_ssh_args(&self, command: &str) -> Vec<String> {
        let mut args = Vec::new();

        if let Some(identity_file) = &self.identity_file {
            args.push("-i".to_string());
            args.push(identity_file.clone());
        }

        if self.port != 22 {
            args.push("-p".to_string());
            args.push(self.port.to_string());
        }

        // Fail fast instead of prompting or hanging on stalled connections
        for option in [
            "BatchMode=yes",
            "ConnectTimeout=10",
            "ServerAliveInterval=15",
            "ServerAliveCountMax=3",
        ] {
            args.push("-o".to_string());
            args.push(option.to_string());
        }

        args.push(format!("{}@{}", self.user, self.host));
        args.push(command.to_string());
        args
    }

    async fn run(&self, command: &str, input: Input<'_>) -> Result<CommandOutput, DeployError> {
        debug!("ssh {}@{}: {}", self.user, self.host, command);
        let mut cmd = Command::new("ssh");
        cmd.args(self.build_ssh_args(command))
            .stdout(Stdio::piped())
            .stderr(Stdio::piped());

        match input {
            Input::None => {
                cmd.stdin(Stdio::null());
            }
            Input::File(path) => {
                let file = tokio::fs::File::open(path).await?.into_std().await;
                cmd.stdin(Stdio::from(file));
            }
            Input::Bytes(_) => {
                cmd.stdin(Stdio::piped());
            }
        }

        let mut child = cmd
            .spawn()
            .map_err(|e| DeployError::ConnectivityError(format!("Failed to run ssh: {}", e)))?;

        if let Input::Bytes(bytes) = input {
            if let Some(mut stdin) = child.stdin.take() {
                stdin.write_all(bytes).await?;
                stdin.shutdown().await?;
            }
        }

        let output = child.wait_with_output().await?;
        Ok(CommandOutput {
            stdout: String::from_utf8_lossy(&output.stdout).into_owned(),
            stderr: String::from_utf8_lossy(&output.stderr).into_owned(),
            success: output.status.success(),
            exit_code: output.status.code().unwrap_or(-1),
        })
    }

    /// Run `command`, mapping a non-zero exit to an error built by `on_error`
    async fn run_checked(
        &self,
        command: &str,
        input: Input<'_>,
        on_error: fn(String) -> DeployError,
    ) -> Result<String, DeployError> {
        let output = self.run(command, input).await?;
        if output.success {
            return Ok(output.stdout);
        }
        if is_connection_failure(&output) {
            return Err(DeployError::ConnectivityError(output.stderr.trim().to_string()));
        }
        Err(on_error(format!(
            "exit {}: {}",
            output.exit_code,
            output.stderr.trim()
        )))
    }
}

#[async_trait]
impl TransportTarget for SshTarget {
    async fn check_connectivity(&self) -> Result<(), DeployError> {
        let command = format!("test -d {}", quote_path(&self.root_path));
        self.run_checked(&command, Input::None, DeployError::ConnectivityError)
            .await
            .map(|_| ())
    }

    async fn read_file(&self, path: &str) -> Result<String, DeployError> {
        let command = format!("cat {}", quote_path(path));
        self.run_checked(&command, Input::None, DeployError::RemoteError)
            .await
    }

    async fn list_dir(&self, path: &str) -> Result<Vec<String>, DeployError> {
        let command = format!("ls -A1 {}", quote_path(path));
        let stdout = self
            .run_checked(&command, Input::None, DeployError::RemoteError)
            .await?;
        Ok(stdout
            .lines()
            .filter(|line| !line.is_empty())
            .map(str::to_string)
            .collect())
    }

    async fn upload(&self, local_path: &Path, remote_path: &str) -> Result<(), DeployError> {
        let command = write_command(remote_path);
        self.run_checked(&command, Input::File(local_path), DeployError::TransferError)
            .await
            .map(|_| ())
    }

    async fn delete(&self, remote_path: &str) -> Result<(), DeployError> {
        let command = format!("rm -f {}", quote_path(remote_path));
        self.run_checked(&command, Input::None, DeployError::TransferError)
            .await
            .map(|_| ())
    }

    async fn put_content(&self, content: &str, remote_path: &str) -> Result<(), DeployError> {
        let command = write_command(remote_path);
        self.run_checked(&command, Input::Bytes(content.as_bytes()), DeployError::RemoteError)
            .await
            .map(|_| ())
    }

    async fn execute(&self, command: &str, cwd: &str) -> Result<String, DeployError> {
        let command = format!("cd {} && {}", quote_path(cwd), command);
        self.run_checked(&command, Input::None, DeployError::RemoteError)
            .await
    }

    fn root_path(&self) -> &str {
        &self.root_path
    }
}

/// `mkdir -p <dir> && cat > <path>`
fn write_command(remote_path: &str) -> String {
    let quoted = quote_path(remote_path);
    match remote_path.rsplit_once('/') {
        Some((dir, _)) if !dir.is_empty() => {
            format!("mkdir -p {} && cat > {}", quote_path(dir), quoted)
        }
        _ => format!("cat > {}", quoted),
    }
}

/// Single-quote a path for the remote shell
pub fn quote_path(path: &str) -> String {
    format!("'{}'", path.replace('\'', "'\\''"))
}

/// SSH exits with 255 when the connection itself failed
fn is_connection_failure(output: &CommandOutput) -> bool {
    let stderr = output.stderr.to_lowercase();
    output.exit_code == 255
        || [
            "connection refused",
            "connection timed out",
            "no route to host",
            "could not resolve hostname",
            "permission denied (publickey",
        ]
        .iter()
        .any(|p| stderr.contains(p))
}
