//! PTY bridge: the duplex byte channel behind one session.
//!
//! A bridge owns a pseudo-terminal with a shell process. Input bytes from any
//! number of attached clients funnel through a single writer; output bytes
//! fan out through a broadcast channel. The bridge survives with zero
//! subscribers, which is what makes detach-and-reattach work.

use std::io::{Read, Write};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use portable_pty::{native_pty_system, Child, CommandBuilder, MasterPty, PtySize};
use protocol::SessionId;
use thiserror::Error;
use tokio::sync::broadcast;
use tokio::sync::Mutex;
use tokio_util::sync::CancellationToken;

/// Errors that can occur during session operations.
#[derive(Error, Debug)]
pub enum SessionError {
    /// The session was not found.
    #[error("session not found: {0}")]
    NotFound(SessionId),

    /// The session has already been terminated.
    #[error("session already terminated: {0}")]
    AlreadyTerminated(SessionId),

    /// The session-count ceiling has been reached.
    #[error("session limit reached: {limit} sessions")]
    LimitReached {
        /// Configured ceiling.
        limit: usize,
    },

    /// Failed to spawn the PTY.
    #[error("failed to spawn PTY: {0}")]
    SpawnFailed(String),

    /// Failed to write to the PTY.
    #[error("failed to write to PTY: {0}")]
    WriteFailed(String),

    /// Failed to resize the PTY.
    #[error("failed to resize PTY: {0}")]
    ResizeFailed(String),

    /// Failed to kill the session.
    #[error("failed to kill session: {0}")]
    KillFailed(String),

    /// I/O error.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl SessionError {
    /// Maps this error onto the wire taxonomy.
    pub fn wire_kind(&self) -> protocol::ErrorKind {
        match self {
            SessionError::NotFound(_) => protocol::ErrorKind::NotFound,
            SessionError::AlreadyTerminated(_) => protocol::ErrorKind::Gone,
            SessionError::LimitReached { .. } => protocol::ErrorKind::ResourceExhausted,
            SessionError::SpawnFailed(_)
            | SessionError::WriteFailed(_)
            | SessionError::ResizeFailed(_)
            | SessionError::KillFailed(_)
            | SessionError::Io(_) => protocol::ErrorKind::ProtocolError,
        }
    }
}

/// Buffer size for reading from the PTY.
const READ_BUFFER_SIZE: usize = 4096;

/// Channel capacity for broadcast output.
const BROADCAST_CAPACITY: usize = 256;

/// Parameters for spawning a terminal process.
#[derive(Debug, Clone)]
pub struct SpawnSpec {
    /// Shell command. If None, uses $SHELL or /bin/sh.
    pub shell: Option<String>,
    /// Terminal width in columns.
    pub cols: u16,
    /// Terminal height in rows.
    pub rows: u16,
    /// Additional environment variables to set.
    pub env: Vec<(String, String)>,
    /// Working directory for the process.
    pub cwd: Option<String>,
}

impl Default for SpawnSpec {
    fn default() -> Self {
        Self {
            shell: None,
            cols: 80,
            rows: 24,
            env: Vec::new(),
            cwd: None,
        }
    }
}

/// Duplex access to one session's terminal byte stream.
///
/// The registry holds bridges behind this trait so tests can substitute an
/// in-memory implementation for a real PTY.
#[async_trait]
pub trait TerminalBridge: Send + Sync {
    /// Writes input bytes to the terminal.
    async fn write(&self, data: &[u8]) -> Result<(), SessionError>;

    /// Resizes the terminal. Last writer wins.
    async fn resize(&self, rows: u16, cols: u16) -> Result<(), SessionError>;

    /// Subscribes to the output broadcast.
    fn subscribe(&self) -> broadcast::Receiver<Vec<u8>>;

    /// Whether the underlying process is still alive.
    fn is_running(&self) -> bool;

    /// Token cancelled when the underlying process exits or is killed.
    fn terminated(&self) -> CancellationToken;

    /// Process ID of the shell, if available.
    fn pid(&self) -> Option<u32>;

    /// Kills the process and releases terminal resources. Idempotent.
    async fn shutdown(&self) -> Result<(), SessionError>;
}

/// Spawns bridges. Seam for swapping the terminal layer out in tests.
pub trait BridgeFactory: Send + Sync {
    /// Spawns a new bridge. Must be called from within a Tokio runtime.
    fn spawn(&self, id: &SessionId, spec: &SpawnSpec) -> Result<Arc<dyn TerminalBridge>, SessionError>;
}

/// A PTY-backed bridge with a shell process.
pub struct PtyBridge {
    /// Session this bridge belongs to; used for log context only.
    id: SessionId,

    /// The PTY master handle.
    master: Arc<Mutex<Box<dyn MasterPty + Send>>>,

    /// The writer for the PTY. Single-writer funnel for all input.
    writer: Arc<Mutex<Box<dyn Write + Send>>>,

    /// The child process.
    child: Arc<Mutex<Box<dyn Child + Send + Sync>>>,

    /// Broadcast sender for output data.
    output_tx: broadcast::Sender<Vec<u8>>,

    /// Flag indicating if the process is still running.
    running: Arc<AtomicBool>,

    /// Cancelled once the process has exited.
    terminated: CancellationToken,

    /// Process ID.
    pid: Option<u32>,
}

impl PtyBridge {
    /// Spawns a new PTY with a shell process and starts the read loop.
    pub fn spawn(id: &SessionId, spec: &SpawnSpec) -> Result<Arc<Self>, SessionError> {
        let shell_cmd = detect_shell(spec.shell.clone());

        let pty_system = native_pty_system();

        let pair = pty_system
            .openpty(PtySize {
                rows: spec.rows,
                cols: spec.cols,
                pixel_width: 0,
                pixel_height: 0,
            })
            .map_err(|e| SessionError::SpawnFailed(e.to_string()))?;

        let mut cmd = CommandBuilder::new(&shell_cmd);

        if let Some(ref dir) = spec.cwd {
            cmd.cwd(dir);
        }

        for (key, value) in &spec.env {
            cmd.env(key, value);
        }

        let child = pair
            .slave
            .spawn_command(cmd)
            .map_err(|e| SessionError::SpawnFailed(e.to_string()))?;

        let pid = child.process_id();

        let writer = pair
            .master
            .take_writer()
            .map_err(|e| SessionError::SpawnFailed(e.to_string()))?;

        let (output_tx, _) = broadcast::channel(BROADCAST_CAPACITY);

        let bridge = Arc::new(PtyBridge {
            id: id.clone(),
            master: Arc::new(Mutex::new(pair.master)),
            writer: Arc::new(Mutex::new(writer)),
            child: Arc::new(Mutex::new(child)),
            output_tx,
            running: Arc::new(AtomicBool::new(true)),
            terminated: CancellationToken::new(),
            pid,
        });

        bridge.start_read_loop();

        tracing::info!(
            session_id = %id,
            shell = %shell_cmd,
            pid = ?pid,
            "Spawned PTY session"
        );

        Ok(bridge)
    }

    /// Starts the read loop for capturing output.
    ///
    /// This spawns a blocking task that reads from the PTY and broadcasts
    /// the output to all subscribers. The loop continues until the process
    /// exits or an error occurs; either way the terminated token fires.
    fn start_read_loop(self: &Arc<Self>) {
        let master = Arc::clone(&self.master);
        let output_tx = self.output_tx.clone();
        let running = Arc::clone(&self.running);
        let terminated = self.terminated.clone();
        let session_id = self.id.clone();

        tokio::spawn(async move {
            let reader = {
                let master = master.lock().await;
                match master.try_clone_reader() {
                    Ok(reader) => reader,
                    Err(e) => {
                        tracing::error!(
                            session_id = %session_id,
                            error = %e,
                            "Failed to get PTY reader"
                        );
                        running.store(false, Ordering::SeqCst);
                        terminated.cancel();
                        return;
                    }
                }
            };

            // Wrap reader in Arc<Mutex> for the blocking task
            let reader = Arc::new(std::sync::Mutex::new(reader));

            loop {
                if !running.load(Ordering::SeqCst) {
                    tracing::debug!(session_id = %session_id, "Read loop stopping: session not running");
                    break;
                }

                let reader_clone = Arc::clone(&reader);

                let result = tokio::task::spawn_blocking(move || {
                    let mut buffer = vec![0u8; READ_BUFFER_SIZE];
                    let mut reader = match reader_clone.lock() {
                        Ok(reader) => reader,
                        Err(poisoned) => poisoned.into_inner(),
                    };
                    match reader.read(&mut buffer) {
                        Ok(0) => Ok(None), // EOF
                        Ok(n) => {
                            buffer.truncate(n);
                            Ok(Some(buffer))
                        }
                        Err(e) => Err(e),
                    }
                })
                .await;

                match result {
                    Ok(Ok(Some(data))) => {
                        // No receivers is fine: the session may be detached.
                        if output_tx.send(data).is_err() {
                            tracing::trace!(
                                session_id = %session_id,
                                "No receivers for output"
                            );
                        }
                    }
                    Ok(Ok(None)) => {
                        tracing::info!(session_id = %session_id, "PTY EOF - process exited");
                        running.store(false, Ordering::SeqCst);
                        break;
                    }
                    Ok(Err(e)) => {
                        if running.load(Ordering::SeqCst) {
                            tracing::error!(
                                session_id = %session_id,
                                error = %e,
                                "Error reading from PTY"
                            );
                        }
                        running.store(false, Ordering::SeqCst);
                        break;
                    }
                    Err(e) => {
                        tracing::error!(
                            session_id = %session_id,
                            error = %e,
                            "Read task panicked"
                        );
                        running.store(false, Ordering::SeqCst);
                        break;
                    }
                }
            }

            terminated.cancel();
        });
    }
}

#[async_trait]
impl TerminalBridge for PtyBridge {
    async fn write(&self, data: &[u8]) -> Result<(), SessionError> {
        if !self.is_running() {
            return Err(SessionError::AlreadyTerminated(self.id.clone()));
        }

        let mut writer = self.writer.lock().await;
        writer
            .write_all(data)
            .map_err(|e| SessionError::WriteFailed(e.to_string()))?;
        writer
            .flush()
            .map_err(|e| SessionError::WriteFailed(e.to_string()))?;

        Ok(())
    }

    async fn resize(&self, rows: u16, cols: u16) -> Result<(), SessionError> {
        if !self.is_running() {
            return Err(SessionError::AlreadyTerminated(self.id.clone()));
        }

        let master = self.master.lock().await;
        master
            .resize(PtySize {
                rows,
                cols,
                pixel_width: 0,
                pixel_height: 0,
            })
            .map_err(|e| SessionError::ResizeFailed(e.to_string()))?;

        tracing::debug!(
            session_id = %self.id,
            cols = cols,
            rows = rows,
            "Resized PTY"
        );

        Ok(())
    }

    fn subscribe(&self) -> broadcast::Receiver<Vec<u8>> {
        self.output_tx.subscribe()
    }

    fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }

    fn terminated(&self) -> CancellationToken {
        self.terminated.clone()
    }

    fn pid(&self) -> Option<u32> {
        self.pid
    }

    async fn shutdown(&self) -> Result<(), SessionError> {
        if !self.running.swap(false, Ordering::SeqCst) {
            // Already stopped; shutdown is idempotent.
            return Ok(());
        }

        let mut child = self.child.lock().await;

        child
            .kill()
            .map_err(|e| SessionError::KillFailed(e.to_string()))?;

        let status = child
            .wait()
            .map_err(|e| SessionError::KillFailed(e.to_string()))?;

        self.terminated.cancel();

        tracing::info!(
            session_id = %self.id,
            exit_code = status.exit_code(),
            "Session killed"
        );

        Ok(())
    }
}

/// Factory producing real PTY bridges.
pub struct PtyBridgeFactory;

impl BridgeFactory for PtyBridgeFactory {
    fn spawn(&self, id: &SessionId, spec: &SpawnSpec) -> Result<Arc<dyn TerminalBridge>, SessionError> {
        Ok(PtyBridge::spawn(id, spec)? as Arc<dyn TerminalBridge>)
    }
}

/// Detects the shell to use.
///
/// Returns the shell in this order of preference:
/// 1. The provided shell if Some
/// 2. The $SHELL environment variable
/// 3. /bin/sh as fallback
fn detect_shell(shell: Option<String>) -> String {
    if let Some(s) = shell {
        return s;
    }

    std::env::var("SHELL").unwrap_or_else(|_| "/bin/sh".to_string())
}


#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;
    use tokio::time::timeout;

    #[test]
    fn test_detect_shell_with_provided() {
        let shell = detect_shell(Some("/bin/bash".to_string()));
        assert_eq!(shell, "/bin/bash");
    }

    #[test]
    fn test_detect_shell_from_env() {
        // This test depends on the environment
        let shell = detect_shell(None);
        assert!(!shell.is_empty());
    }

    fn sh_spec() -> SpawnSpec {
        SpawnSpec {
            shell: Some("/bin/sh".to_string()),
            ..SpawnSpec::default()
        }
    }

    #[tokio::test]
    async fn test_bridge_spawn() {
        let bridge = PtyBridge::spawn(&"sess-1".to_string(), &sh_spec()).unwrap();
        assert!(bridge.is_running());
        assert!(bridge.pid().is_some());

        let _ = bridge.shutdown().await;
    }

    #[tokio::test]
    async fn test_bridge_write_and_output() {
        let bridge = PtyBridge::spawn(&"sess-1".to_string(), &sh_spec()).unwrap();
        let mut rx = bridge.subscribe();

        bridge.write(b"echo test_output_marker\n").await.unwrap();

        let mut found_output = false;
        for _ in 0..50 {
            match timeout(Duration::from_millis(100), rx.recv()).await {
                Ok(Ok(data)) => {
                    let output = String::from_utf8_lossy(&data);
                    if output.contains("test_output_marker") {
                        found_output = true;
                        break;
                    }
                }
                _ => {}
            }
        }

        assert!(found_output, "Did not receive expected output");

        let _ = bridge.shutdown().await;
    }

    #[tokio::test]
    async fn test_bridge_resize() {
        let bridge = PtyBridge::spawn(&"sess-1".to_string(), &sh_spec()).unwrap();

        let result = bridge.resize(40, 120).await;
        assert!(result.is_ok(), "Failed to resize: {:?}", result.err());

        let _ = bridge.shutdown().await;
    }

    #[tokio::test]
    async fn test_bridge_write_after_shutdown() {
        let bridge = PtyBridge::spawn(&"sess-1".to_string(), &sh_spec()).unwrap();

        bridge.shutdown().await.unwrap();

        let result = bridge.write(b"hello\n").await;
        assert!(matches!(result, Err(SessionError::AlreadyTerminated(_))));
    }

    #[tokio::test]
    async fn test_bridge_shutdown_is_idempotent() {
        let bridge = PtyBridge::spawn(&"sess-1".to_string(), &sh_spec()).unwrap();

        bridge.shutdown().await.unwrap();
        bridge.shutdown().await.unwrap();
        assert!(!bridge.is_running());
    }

    #[tokio::test]
    async fn test_bridge_terminated_token_fires_on_exit() {
        let bridge = PtyBridge::spawn(&"sess-1".to_string(), &sh_spec()).unwrap();
        let token = bridge.terminated();

        bridge.write(b"exit 0\n").await.unwrap();

        timeout(Duration::from_secs(5), token.cancelled())
            .await
            .expect("terminated token did not fire");
        assert!(!bridge.is_running());
    }

    #[tokio::test]
    async fn test_bridge_env_vars() {
        let spec = SpawnSpec {
            shell: Some("/bin/sh".to_string()),
            env: vec![("TEST_VAR".to_string(), "test_value".to_string())],
            ..SpawnSpec::default()
        };
        let bridge = PtyBridge::spawn(&"sess-1".to_string(), &spec).unwrap();
        let mut rx = bridge.subscribe();

        bridge.write(b"echo $TEST_VAR\n").await.unwrap();

        let mut found_value = false;
        for _ in 0..50 {
            match timeout(Duration::from_millis(100), rx.recv()).await {
                Ok(Ok(data)) => {
                    let output = String::from_utf8_lossy(&data);
                    if output.contains("test_value") {
                        found_value = true;
                        break;
                    }
                }
                _ => {}
            }
        }

        assert!(found_value, "Did not receive expected environment variable value");

        let _ = bridge.shutdown().await;
    }

    #[tokio::test]
    async fn test_bridge_multiple_subscribers() {
        let bridge = PtyBridge::spawn(&"sess-1".to_string(), &sh_spec()).unwrap();

        let _rx1 = bridge.subscribe();
        let _rx2 = bridge.subscribe();
        assert_eq!(bridge.output_tx.receiver_count(), 2);

        let _ = bridge.shutdown().await;
    }
}
