//! Agent subprocess ownership
//!
//! Spawns the agent with piped stdio, drains stderr into the log, and
//! publishes the exit status on a watch channel once the child is reaped.

use crate::error::{ConnectError, Result};
use std::collections::HashMap;
use std::process::Stdio;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::process::{Child, ChildStderr, ChildStdin, ChildStdout, Command};
use tokio::sync::watch;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

/// How the agent process ended
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ProcessExit {
    pub code: Option<i32>,
    pub signal: Option<i32>,
}

impl ProcessExit {
    fn from_status(status: std::process::ExitStatus) -> Self {
        #[cfg(unix)]
        let signal = {
            use std::os::unix::process::ExitStatusExt;
            status.signal()
        };
        #[cfg(not(unix))]
        let signal = None;

        Self {
            code: status.code(),
            signal,
        }
    }
}

/// Handle to a running agent subprocess
pub struct AgentProcess {
    kill: CancellationToken,
    exit_rx: watch::Receiver<Option<ProcessExit>>,
}

impl AgentProcess {
    /// Spawn the agent. Returns the handle plus its stdin and stdout, which
    /// the caller hands to the transport.
    pub fn spawn(
        command: &str,
        args: &[String],
        env: &HashMap<String, String>,
        cwd: Option<&str>,
    ) -> Result<(Self, ChildStdin, ChildStdout)> {
        debug!("Spawning agent: {} {:?} (cwd: {:?})", command, args, cwd);

        let mut cmd = Command::new(command);
        cmd.args(args)
            .envs(env)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);

        if let Some(dir) = cwd {
            cmd.current_dir(dir);
        }

        let mut child = cmd.spawn().map_err(|e| ConnectError::SpawnFailed {
            command: command.to_string(),
            reason: e.to_string(),
        })?;

        let stdin = child.stdin.take().ok_or(ConnectError::MissingPipe("stdin"))?;
        let stdout = child.stdout.take().ok_or(ConnectError::MissingPipe("stdout"))?;
        let stderr = child.stderr.take().ok_or(ConnectError::MissingPipe("stderr"))?;

        let pid = child.id();
        info!("Agent process started (pid: {:?})", pid);

        tokio::spawn(drain_stderr(stderr));

        let kill = CancellationToken::new();
        let (exit_tx, exit_rx) = watch::channel(None);
        tokio::spawn(wait_for_child(child, kill.clone(), exit_tx));

        Ok((Self { kill, exit_rx }, stdin, stdout))
    }

    /// Kill the process. Safe to call repeatedly or after exit.
    pub fn kill(&self) {
        self.kill.cancel();
    }

    /// Exit status, if the process has been reaped
    pub fn exit_status(&self) -> Option<ProcessExit> {
        self.exit_rx.borrow().clone()
    }

    /// Wait until the process has exited
    pub async fn wait(&self) -> ProcessExit {
        let mut rx = self.exit_rx.clone();
        let exit = match rx.wait_for(|exit| exit.is_some()).await {
            Ok(exit) => exit.clone().unwrap_or_default(),
            // Sender gone without a value; treat as exited
            Err(_) => ProcessExit::default(),
        };
        exit
    }
}

impl Drop for AgentProcess {
    fn drop(&mut self) {
        self.kill.cancel();
    }
}

async fn wait_for_child(
    mut child: Child,
    kill: CancellationToken,
    exit_tx: watch::Sender<Option<ProcessExit>>,
) {
    let status = tokio::select! {
        status = child.wait() => status,
        _ = kill.cancelled() => {
            debug!("Killing agent process");
            if let Err(e) = child.start_kill() {
                // Already exited between the select arms
                debug!("Agent kill: {}", e);
            }
            child.wait().await
        }
    };

    let exit = match status {
        Ok(status) => ProcessExit::from_status(status),
        Err(e) => {
            error!("Failed to wait for agent process: {}", e);
            ProcessExit::default()
        }
    };
    info!("Agent process exited (code: {:?}, signal: {:?})", exit.code, exit.signal);
    let _ = exit_tx.send(Some(exit));
}

/// Drain stderr so the agent can't deadlock on a full pipe.
async fn drain_stderr(stderr: ChildStderr) {
    let mut lines = BufReader::new(stderr).lines();
    loop {
        match lines.next_line().await {
            Ok(Some(line)) => {
                let trimmed = line.trim();
                if !trimmed.is_empty() {
                    warn!(target: "agent_stderr", "{}", trimmed);
                }
            }
            Ok(None) => {
                debug!("Agent stderr closed");
                break;
            }
            Err(e) => {
                error!("Error reading agent stderr: {}", e);
                break;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::Error;

    #[tokio::test]
    async fn test_spawn_invalid_command() {
        let result = AgentProcess::spawn("nonexistent_command_12345", &[], &HashMap::new(), None);

        match result {
            Err(Error::Connect(ConnectError::SpawnFailed { command, .. })) => {
                assert_eq!(command, "nonexistent_command_12345");
            }
            Err(other) => panic!("Expected SpawnFailed, got {other}"),
            Ok(_) => panic!("Expected SpawnFailed"),
        }
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_exit_code_is_published() {
        let args = vec!["-c".to_string(), "exit 3".to_string()];
        let (process, _stdin, _stdout) =
            AgentProcess::spawn("sh", &args, &HashMap::new(), None).unwrap();

        let exit = process.wait().await;
        assert_eq!(exit.code, Some(3));
        assert_eq!(process.exit_status(), Some(exit));
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_kill_is_idempotent() {
        let args = vec!["-c".to_string(), "sleep 30".to_string()];
        let (process, _stdin, _stdout) =
            AgentProcess::spawn("sh", &args, &HashMap::new(), None).unwrap();

        process.kill();
        process.kill();
        let exit = process.wait().await;
        assert!(exit.code.is_none());
        assert_eq!(exit.signal, Some(9));

        process.kill();
    }
}
