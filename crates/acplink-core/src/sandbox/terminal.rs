//! Terminal handles spawned on behalf of the agent
//!
//! Each handle owns one child process. Its stdout and stderr are merged into
//! a single buffer, optionally capped at `outputByteLimit` bytes by dropping
//! the oldest output. The exit status is captured once and cached.

use crate::error::{Result, TerminalError};
use crate::types::{CreateTerminalParams, TerminalExitStatus, TerminalOutputResponse};
use parking_lot::Mutex;
use std::collections::HashMap;
use std::path::PathBuf;
use std::process::Stdio;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, AsyncRead, BufReader};
use tokio::process::{Child, Command};
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// How long to keep reading output after the process exits. Grandchildren
/// can hold the pipes open indefinitely.
const OUTPUT_DRAIN_TIMEOUT: Duration = Duration::from_secs(2);

#[derive(Debug, Default)]
struct OutputBuffer {
    data: String,
    limit: Option<usize>,
    truncated: bool,
}

impl OutputBuffer {
    fn with_limit(limit: Option<usize>) -> Self {
        Self {
            limit,
            ..Default::default()
        }
    }

    fn push(&mut self, chunk: &str) {
        self.data.push_str(chunk);
        if let Some(limit) = self.limit {
            if self.data.len() > limit {
                let mut cut = self.data.len() - limit;
                while !self.data.is_char_boundary(cut) {
                    cut += 1;
                }
                self.data.drain(..cut);
                self.truncated = true;
            }
        }
    }
}

/// One spawned terminal process
#[derive(Debug)]
pub struct TerminalHandle {
    id: String,
    output: Arc<Mutex<OutputBuffer>>,
    exit_rx: watch::Receiver<Option<TerminalExitStatus>>,
    kill: CancellationToken,
}

impl TerminalHandle {
    fn spawn(id: String, params: &CreateTerminalParams, default_cwd: Option<&PathBuf>) -> Result<Self> {
        let mut cmd = Command::new(&params.command);
        cmd.args(&params.args)
            .envs(params.env.iter().map(|v| (v.name.as_str(), v.value.as_str())))
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);

        match params.cwd.as_deref() {
            Some(dir) => {
                cmd.current_dir(dir);
            }
            None => {
                if let Some(dir) = default_cwd {
                    cmd.current_dir(dir);
                }
            }
        }

        let mut child = cmd.spawn().map_err(|e| TerminalError::SpawnFailed {
            command: params.command.clone(),
            reason: e.to_string(),
        })?;

        let limit = params.output_byte_limit.map(|l| l as usize);
        let output = Arc::new(Mutex::new(OutputBuffer::with_limit(limit)));

        let mut readers = Vec::with_capacity(2);
        if let Some(stdout) = child.stdout.take() {
            readers.push(tokio::spawn(collect_output(stdout, Arc::clone(&output))));
        }
        if let Some(stderr) = child.stderr.take() {
            readers.push(tokio::spawn(collect_output(stderr, Arc::clone(&output))));
        }

        let kill = CancellationToken::new();
        let (exit_tx, exit_rx) = watch::channel(None);
        tokio::spawn(wait_for_exit(id.clone(), child, readers, kill.clone(), exit_tx));

        info!("Terminal {} started: {} {:?}", id, params.command, params.args);

        Ok(Self {
            id,
            output,
            exit_rx,
            kill,
        })
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    /// Output captured so far plus the exit status if the process is done
    pub fn output(&self) -> TerminalOutputResponse {
        let buffer = self.output.lock();
        TerminalOutputResponse {
            output: buffer.data.clone(),
            truncated: buffer.truncated,
            exit_status: self.exit_status(),
        }
    }

    pub fn exit_status(&self) -> Option<TerminalExitStatus> {
        self.exit_rx.borrow().clone()
    }

    /// Resolves once the process has exited; later callers get the cached status
    pub async fn wait_for_exit(&self) -> TerminalExitStatus {
        let mut rx = self.exit_rx.clone();
        let status = match rx.wait_for(|status| status.is_some()).await {
            Ok(status) => status.clone().unwrap_or_default(),
            Err(_) => TerminalExitStatus::default(),
        };
        status
    }

    /// Kill the process. Idempotent.
    pub fn kill(&self) {
        self.kill.cancel();
    }
}

impl Drop for TerminalHandle {
    fn drop(&mut self) {
        self.kill.cancel();
    }
}

async fn collect_output<R>(reader: R, output: Arc<Mutex<OutputBuffer>>)
where
    R: AsyncRead + Unpin,
{
    let mut reader = BufReader::new(reader);
    let mut line = Vec::new();
    loop {
        line.clear();
        match reader.read_until(b'\n', &mut line).await {
            Ok(0) => break,
            Ok(_) => output.lock().push(&String::from_utf8_lossy(&line)),
            Err(e) => {
                warn!("Error reading terminal output: {}", e);
                break;
            }
        }
    }
}

async fn wait_for_exit(
    id: String,
    mut child: Child,
    readers: Vec<JoinHandle<()>>,
    kill: CancellationToken,
    exit_tx: watch::Sender<Option<TerminalExitStatus>>,
) {
    let status = tokio::select! {
        status = child.wait() => status,
        _ = kill.cancelled() => {
            debug!("Killing terminal {}", id);
            if let Err(e) = child.start_kill() {
                debug!("Terminal {} kill: {}", id, e);
            }
            child.wait().await
        }
    };

    for reader in readers {
        if tokio::time::timeout(OUTPUT_DRAIN_TIMEOUT, reader).await.is_err() {
            warn!("Terminal {} output still open after exit; not waiting", id);
        }
    }

    let exit = match status {
        Ok(status) => exit_status_of(status),
        Err(e) => {
            warn!("Failed to wait for terminal {}: {}", id, e);
            TerminalExitStatus::default()
        }
    };
    info!("Terminal {} exited: {:?}", id, exit);
    let _ = exit_tx.send(Some(exit));
}

fn exit_status_of(status: std::process::ExitStatus) -> TerminalExitStatus {
    #[cfg(unix)]
    let signal = {
        use std::os::unix::process::ExitStatusExt;
        status.signal().map(signal_name)
    };
    #[cfg(not(unix))]
    let signal = None;

    TerminalExitStatus {
        exit_code: status.code().and_then(|c| u32::try_from(c).ok()),
        signal,
    }
}

#[cfg(unix)]
fn signal_name(signal: i32) -> String {
    match signal {
        1 => "SIGHUP".to_string(),
        2 => "SIGINT".to_string(),
        9 => "SIGKILL".to_string(),
        13 => "SIGPIPE".to_string(),
        15 => "SIGTERM".to_string(),
        other => format!("SIG{}", other),
    }
}

/// Owner of every terminal spawned during one connection
#[derive(Debug)]
pub struct TerminalRegistry {
    next_id: AtomicU64,
    terminals: Mutex<HashMap<String, Arc<TerminalHandle>>>,
    default_cwd: Option<PathBuf>,
}

impl TerminalRegistry {
    pub fn new(default_cwd: Option<PathBuf>) -> Self {
        Self {
            next_id: AtomicU64::new(1),
            terminals: Mutex::new(HashMap::new()),
            default_cwd,
        }
    }

    /// Spawn a terminal. Ids are never reused.
    pub fn create(&self, params: &CreateTerminalParams) -> Result<Arc<TerminalHandle>> {
        let id = format!("term-{}", self.next_id.fetch_add(1, Ordering::SeqCst));
        let handle = Arc::new(TerminalHandle::spawn(id.clone(), params, self.default_cwd.as_ref())?);
        self.terminals.lock().insert(id, Arc::clone(&handle));
        Ok(handle)
    }

    pub fn get(&self, terminal_id: &str) -> Result<Arc<TerminalHandle>> {
        self.terminals
            .lock()
            .get(terminal_id)
            .cloned()
            .ok_or_else(|| TerminalError::NotFound(terminal_id.to_string()).into())
    }

    pub fn output(&self, terminal_id: &str) -> Result<TerminalOutputResponse> {
        Ok(self.get(terminal_id)?.output())
    }

    pub async fn wait_for_exit(&self, terminal_id: &str) -> Result<TerminalExitStatus> {
        let handle = self.get(terminal_id)?;
        Ok(handle.wait_for_exit().await)
    }

    pub fn kill(&self, terminal_id: &str) -> Result<()> {
        self.get(terminal_id)?.kill();
        Ok(())
    }

    /// Kill and forget a terminal
    pub fn release(&self, terminal_id: &str) -> Result<()> {
        let handle = self
            .terminals
            .lock()
            .remove(terminal_id)
            .ok_or_else(|| TerminalError::NotFound(terminal_id.to_string()))?;
        handle.kill();
        debug!("Released terminal {}", terminal_id);
        Ok(())
    }

    /// Kill and forget every terminal
    pub fn release_all(&self) {
        let handles: Vec<_> = self.terminals.lock().drain().map(|(_, h)| h).collect();
        if !handles.is_empty() {
            info!("Releasing {} terminal(s)", handles.len());
        }
        for handle in handles {
            handle.kill();
        }
    }

    pub fn len(&self) -> usize {
        self.terminals.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[cfg(all(test, unix))]
mod tests {
    use super::*;
    use crate::error::Error;
    use crate::types::EnvVariable;

    fn sh(script: &str) -> CreateTerminalParams {
        CreateTerminalParams {
            session_id: "s1".to_string(),
            command: "sh".to_string(),
            args: vec!["-c".to_string(), script.to_string()],
            ..Default::default()
        }
    }

    #[test]
    fn test_output_buffer_truncates_from_front() {
        let mut buffer = OutputBuffer::with_limit(Some(5));
        buffer.push("abc");
        assert!(!buffer.truncated);
        buffer.push("defg");
        assert_eq!(buffer.data, "cdefg");
        assert!(buffer.truncated);
    }

    #[test]
    fn test_output_buffer_respects_char_boundaries() {
        let mut buffer = OutputBuffer::with_limit(Some(4));
        buffer.push("aé€");
        // "é€" is 5 bytes; cutting inside "é" moves forward to "€"
        assert_eq!(buffer.data, "€");
        assert!(buffer.truncated);
    }

    #[tokio::test]
    async fn test_output_and_exit_status() {
        let registry = TerminalRegistry::new(None);
        let handle = registry.create(&sh("echo out; echo err 1>&2; exit 2")).unwrap();

        let status = registry.wait_for_exit(handle.id()).await.unwrap();
        assert_eq!(status.exit_code, Some(2));

        let output = registry.output(handle.id()).unwrap();
        assert!(output.output.contains("out\n"));
        assert!(output.output.contains("err\n"));
        assert!(!output.truncated);
        assert_eq!(output.exit_status, Some(status.clone()));

        // Cached for later callers
        assert_eq!(handle.wait_for_exit().await, status);
    }

    #[tokio::test]
    async fn test_env_and_cwd() {
        let dir = tempfile::tempdir().unwrap();
        let registry = TerminalRegistry::new(Some(dir.path().to_path_buf()));
        let mut params = sh("echo $GREETING; pwd");
        params.env = vec![EnvVariable::new("GREETING", "hi")];

        let handle = registry.create(&params).unwrap();
        handle.wait_for_exit().await;

        let output = handle.output().output;
        let canonical = dir.path().canonicalize().unwrap();
        assert!(output.starts_with("hi\n"));
        assert!(output.contains(canonical.to_str().unwrap()));
    }

    #[tokio::test]
    async fn test_ids_are_monotonic_and_release_kills() {
        let registry = TerminalRegistry::new(None);
        let first = registry.create(&sh("sleep 30")).unwrap();
        let second = registry.create(&sh("sleep 30")).unwrap();
        assert_eq!(first.id(), "term-1");
        assert_eq!(second.id(), "term-2");

        registry.release(first.id()).unwrap();
        let status = first.wait_for_exit().await;
        assert_eq!(status.signal.as_deref(), Some("SIGKILL"));
        assert!(matches!(
            registry.output("term-1"),
            Err(Error::Terminal(TerminalError::NotFound(_)))
        ));

        let third = registry.create(&sh("true")).unwrap();
        assert_eq!(third.id(), "term-3");

        registry.release_all();
        assert!(registry.is_empty());
        second.wait_for_exit().await;
    }

    #[tokio::test]
    async fn test_kill_is_idempotent() {
        let registry = TerminalRegistry::new(None);
        let handle = registry.create(&sh("sleep 30")).unwrap();
        registry.kill(handle.id()).unwrap();
        registry.kill(handle.id()).unwrap();
        assert!(handle.wait_for_exit().await.exit_code.is_none());
        registry.kill(handle.id()).unwrap();
    }

    #[tokio::test]
    async fn test_spawn_failure() {
        let registry = TerminalRegistry::new(None);
        let params = CreateTerminalParams {
            command: "nonexistent_command_12345".to_string(),
            ..Default::default()
        };
        assert!(matches!(
            registry.create(&params),
            Err(Error::Terminal(TerminalError::SpawnFailed { .. }))
        ));
    }
}
