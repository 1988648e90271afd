use std::collections::HashMap;
use std::io::{Read, Write};
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::thread;
use std::time::Duration;

use portable_pty::{native_pty_system, Child, CommandBuilder, MasterPty, PtySize};
use tokio::sync::mpsc;
use tracing::{debug, warn};

use panemux_types::{Config, Error, PaneId, PaneSize, Result};

use crate::scrollback::Scrollback;
use crate::transcript::TranscriptLogger;
use crate::READ_BUF_SIZE;

/// What to spawn inside the pane's PTY.
#[derive(Debug, Clone)]
pub struct PtyCommand {
    pub program: String,
    pub args: Vec<String>,
    pub env: HashMap<String, String>,
    pub cwd: Option<PathBuf>,
    pub size: PaneSize,
}

impl PtyCommand {
    pub fn new(program: impl Into<String>) -> Self {
        Self {
            program: program.into(),
            args: Vec::new(),
            env: HashMap::new(),
            cwd: None,
            size: PaneSize::default(),
        }
    }

    /// The user's default shell (`$SHELL`, falling back to `/bin/sh`).
    pub fn default_shell() -> Self {
        Self::new(std::env::var("SHELL").unwrap_or_else(|_| "/bin/sh".to_string()))
    }

    pub fn arg(mut self, arg: impl Into<String>) -> Self {
        self.args.push(arg.into());
        self
    }

    pub fn env(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.env.insert(key.into(), value.into());
        self
    }

    pub fn cwd(mut self, dir: impl Into<PathBuf>) -> Self {
        self.cwd = Some(dir.into());
        self
    }

    pub fn size(mut self, size: PaneSize) -> Self {
        self.size = size;
        self
    }
}

enum InputMsg {
    Data(Vec<u8>),
    /// Close the PTY writer, delivering EOF to the child.
    Shutdown,
}

/// One spawned process and its PTY.
///
/// The reader thread forwards raw output chunks into a bounded channel; the
/// channel is the pane's finite output stream and ends at process exit or
/// close. The writer thread drains a bounded input queue. Both threads exit
/// on their own once the process is gone, so no join is required.
pub struct PtyProcess {
    pane_id: PaneId,
    master: Mutex<Box<dyn MasterPty + Send>>,
    child: Arc<Mutex<Box<dyn Child + Send + Sync>>>,
    input_tx: mpsc::Sender<InputMsg>,
    output_rx: Option<mpsc::Receiver<Vec<u8>>>,
    scrollback: Arc<Mutex<Scrollback>>,
    transcript: Arc<Mutex<Option<TranscriptLogger>>>,
    alive: Arc<AtomicBool>,
    size: Mutex<PaneSize>,
    max_dimension: u16,
}

impl PtyProcess {
    /// Spawn a process on a fresh PTY.
    ///
    /// Fails with `Error::Spawn` when the PTY cannot be opened or the
    /// executable cannot be started; nothing is left behind on failure.
    pub fn spawn(
        pane_id: PaneId,
        command: &PtyCommand,
        config: &Config,
        transcript: Option<TranscriptLogger>,
    ) -> Result<Self> {
        command.size.validate(config.max_dimension)?;

        let pty_system = native_pty_system();
        let pair = pty_system
            .openpty(PtySize {
                rows: command.size.rows,
                cols: command.size.cols,
                pixel_width: 0,
                pixel_height: 0,
            })
            .map_err(|e| Error::spawn(format!("failed to open PTY: {e}")))?;

        let mut cmd = CommandBuilder::new(&command.program);
        cmd.args(&command.args);
        for (key, value) in &command.env {
            cmd.env(key, value);
        }
        if let Some(dir) = &command.cwd {
            cmd.cwd(dir);
        }

        let child = pair
            .slave
            .spawn_command(cmd)
            .map_err(|e| Error::spawn(format!("failed to spawn '{}': {e}", command.program)))?;

        let mut reader = pair
            .master
            .try_clone_reader()
            .map_err(|e| Error::spawn(format!("failed to clone PTY reader: {e}")))?;
        let mut writer = pair
            .master
            .take_writer()
            .map_err(|e| Error::spawn(format!("failed to take PTY writer: {e}")))?;

        let (input_tx, mut input_rx) = mpsc::channel::<InputMsg>(config.input_queue_depth);
        let (output_tx, output_rx) = mpsc::channel::<Vec<u8>>(config.output_queue_depth);

        let scrollback = Arc::new(Mutex::new(Scrollback::new(config.scrollback_lines)));
        let transcript = Arc::new(Mutex::new(transcript));
        let alive = Arc::new(AtomicBool::new(true));

        // Reader thread: PTY output -> scrollback + bounded output channel.
        // A full channel backpressures the read loop, which in turn lets the
        // kernel PTY buffer absorb bursts; a slow consumer never loses bytes.
        {
            let scrollback = Arc::clone(&scrollback);
            let transcript = Arc::clone(&transcript);
            let alive = Arc::clone(&alive);
            thread::spawn(move || {
                let mut buf = [0u8; READ_BUF_SIZE];
                loop {
                    match reader.read(&mut buf) {
                        Ok(0) => break,
                        Ok(n) => {
                            let chunk = buf[..n].to_vec();
                            scrollback.lock().unwrap().push_bytes(&chunk);
                            if let Some(logger) = transcript.lock().unwrap().as_mut() {
                                let _ = logger.log_output(&chunk);
                            }
                            if output_tx.blocking_send(chunk).is_err() {
                                // Consumer dropped the stream; stop pulling.
                                break;
                            }
                        }
                        Err(_) => break,
                    }
                }
                alive.store(false, Ordering::SeqCst);
                debug!(pane_id = %pane_id, "pty reader finished");
            });
        }

        // Writer thread: bounded input queue -> PTY.
        thread::spawn(move || {
            while let Some(msg) = input_rx.blocking_recv() {
                match msg {
                    InputMsg::Data(bytes) => {
                        if writer.write_all(&bytes).and_then(|_| writer.flush()).is_err() {
                            break;
                        }
                    }
                    InputMsg::Shutdown => break,
                }
            }
            // Dropping the writer closes the PTY input stream (EOF).
        });

        Ok(Self {
            pane_id,
            master: Mutex::new(pair.master),
            child: Arc::new(Mutex::new(child)),
            input_tx,
            output_rx: Some(output_rx),
            scrollback,
            transcript,
            alive,
            size: Mutex::new(command.size),
            max_dimension: config.max_dimension,
        })
    }

    pub fn pane_id(&self) -> PaneId {
        self.pane_id
    }

    /// Take the pane's output stream. Yields raw chunks in production order
    /// and ends when the process exits or the pane is closed. Can only be
    /// taken once; the stream belongs to a single forwarder.
    pub fn take_output(&mut self) -> Option<mpsc::Receiver<Vec<u8>>> {
        self.output_rx.take()
    }

    /// Enqueue input bytes. Suspends while the bounded queue is full and
    /// fails fast once the process has exited.
    pub async fn write(&self, bytes: &[u8]) -> Result<()> {
        if !self.is_alive() {
            return Err(Error::ChannelClosed {
                id: self.pane_id,
                channel: "input",
            });
        }
        if let Some(logger) = self.transcript.lock().unwrap().as_mut() {
            let _ = logger.log_input(bytes);
        }
        self.input_tx
            .send(InputMsg::Data(bytes.to_vec()))
            .await
            .map_err(|_| Error::ChannelClosed {
                id: self.pane_id,
                channel: "input",
            })
    }

    /// Propagate a size change to the PTY.
    pub fn resize(&self, size: PaneSize) -> Result<()> {
        size.validate(self.max_dimension)?;
        if !self.is_alive() {
            return Err(Error::ChannelClosed {
                id: self.pane_id,
                channel: "resize",
            });
        }
        self.master
            .lock()
            .unwrap()
            .resize(PtySize {
                rows: size.rows,
                cols: size.cols,
                pixel_width: 0,
                pixel_height: 0,
            })
            .map_err(|e| Error::backend("resize_pane", "pty", e))?;
        *self.size.lock().unwrap() = size;
        if let Some(logger) = self.transcript.lock().unwrap().as_mut() {
            let _ = logger.log_resize(size);
        }
        Ok(())
    }

    pub fn size(&self) -> PaneSize {
        *self.size.lock().unwrap()
    }

    /// Last `max_lines` of decoded output, oldest first.
    pub fn capture_tail(&self, max_lines: usize) -> Vec<String> {
        self.scrollback.lock().unwrap().tail(max_lines)
    }

    /// Check whether the child process is still running.
    pub fn is_alive(&self) -> bool {
        if !self.alive.load(Ordering::SeqCst) {
            return false;
        }
        let mut child = self.child.lock().unwrap();
        match child.try_wait() {
            Ok(Some(_)) => {
                self.alive.store(false, Ordering::SeqCst);
                false
            }
            _ => true,
        }
    }

    /// Exit code, if the process has exited.
    pub fn exit_code(&self) -> Option<u32> {
        let mut child = self.child.lock().unwrap();
        match child.try_wait() {
            Ok(Some(status)) => Some(status.exit_code()),
            _ => None,
        }
    }

    /// Request graceful termination (EOF on the input stream), escalate to a
    /// forced kill after the grace period, and return the exit code when one
    /// is available. Process and descriptors are released on every path.
    pub async fn close(&self, grace: Duration) -> Result<Option<u32>> {
        // Closing the writer is the graceful request: interactive shells
        // exit on EOF, and well-behaved filters finish their input.
        let _ = self.input_tx.send(InputMsg::Shutdown).await;

        let poll = Duration::from_millis(50);
        let deadline = tokio::time::Instant::now() + grace;
        loop {
            if let Some(code) = self.exit_code() {
                self.alive.store(false, Ordering::SeqCst);
                return Ok(Some(code));
            }
            if tokio::time::Instant::now() >= deadline {
                break;
            }
            tokio::time::sleep(poll).await;
        }

        warn!(pane_id = %self.pane_id, "grace period elapsed, killing process");
        {
            let mut child = self.child.lock().unwrap();
            let _ = child.kill();
        }
        self.alive.store(false, Ordering::SeqCst);
        Ok(self.exit_code())
    }
}

impl Drop for PtyProcess {
    fn drop(&mut self) {
        // The reader thread exits on EOF from the killed PTY; never join it
        // here, it may be blocked in read().
        self.alive.store(false, Ordering::SeqCst);
        if let Ok(mut child) = self.child.lock() {
            let _ = child.kill();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Instant;

    fn test_config() -> Config {
        Config::default()
    }

    async fn collect_until(
        rx: &mut mpsc::Receiver<Vec<u8>>,
        needle: &str,
        timeout: Duration,
    ) -> String {
        let mut out = Vec::new();
        let deadline = Instant::now() + timeout;
        while Instant::now() < deadline {
            match tokio::time::timeout(Duration::from_millis(200), rx.recv()).await {
                Ok(Some(chunk)) => {
                    out.extend_from_slice(&chunk);
                    if String::from_utf8_lossy(&out).contains(needle) {
                        break;
                    }
                }
                Ok(None) => break,
                Err(_) => {}
            }
        }
        String::from_utf8_lossy(&out).to_string()
    }

    #[tokio::test]
    async fn spawn_write_and_stream_output() {
        let command = PtyCommand::new("/bin/sh");
        let mut pty =
            PtyProcess::spawn(PaneId::new(), &command, &test_config(), None).unwrap();
        let mut rx = pty.take_output().unwrap();

        pty.write(b"echo PANEMUX_OK\n").await.unwrap();
        let text = collect_until(&mut rx, "PANEMUX_OK", Duration::from_secs(5)).await;
        assert!(text.contains("PANEMUX_OK"), "got: {text}");
    }

    #[tokio::test]
    async fn output_stream_can_only_be_taken_once() {
        let command = PtyCommand::new("/bin/sh");
        let mut pty =
            PtyProcess::spawn(PaneId::new(), &command, &test_config(), None).unwrap();
        assert!(pty.take_output().is_some());
        assert!(pty.take_output().is_none());
    }

    #[tokio::test]
    async fn spawn_failure_is_typed() {
        let command = PtyCommand::new("/nonexistent/binary/panemux-test");
        let result = PtyProcess::spawn(PaneId::new(), &command, &test_config(), None);
        // Some platforms report the failure at first I/O instead of spawn;
        // accept either a typed error or a process that dies immediately.
        if let Err(err) = result {
            assert!(matches!(err, Error::Spawn { .. }));
        }
    }

    #[tokio::test]
    async fn invalid_resize_is_rejected_without_mutation() {
        let command = PtyCommand::new("/bin/sh");
        let pty = PtyProcess::spawn(PaneId::new(), &command, &test_config(), None).unwrap();
        let before = pty.size();

        let err = pty.resize(PaneSize::new(0, 80)).unwrap_err();
        assert!(matches!(err, Error::InvalidSize { .. }));
        assert_eq!(pty.size(), before);

        let err = pty.resize(PaneSize::new(24, 5000)).unwrap_err();
        assert!(matches!(err, Error::InvalidSize { .. }));
        assert_eq!(pty.size(), before);

        pty.resize(PaneSize::new(40, 120)).unwrap();
        assert_eq!(pty.size(), PaneSize::new(40, 120));
    }

    #[tokio::test]
    async fn write_after_exit_fails_fast() {
        let command = PtyCommand::new("/bin/sh");
        let mut pty =
            PtyProcess::spawn(PaneId::new(), &command, &test_config(), None).unwrap();
        let mut rx = pty.take_output().unwrap();

        pty.write(b"exit 0\n").await.unwrap();
        // Drain until the stream ends, which marks the process dead.
        while let Some(_chunk) = rx.recv().await {}

        let err = pty.write(b"echo too late\n").await.unwrap_err();
        assert!(matches!(
            err,
            Error::ChannelClosed {
                channel: "input",
                ..
            }
        ));
    }

    #[tokio::test]
    async fn close_escalates_to_kill_within_grace() {
        // `sleep` ignores EOF on stdin, forcing the kill path.
        let command = PtyCommand::new("/bin/sh").arg("-c").arg("sleep 600");
        let pty = PtyProcess::spawn(PaneId::new(), &command, &test_config(), None).unwrap();

        let start = Instant::now();
        pty.close(Duration::from_millis(200)).await.unwrap();
        assert!(start.elapsed() < Duration::from_secs(5));
        assert!(!pty.is_alive());
    }

    #[tokio::test]
    async fn capture_tail_returns_recent_lines() {
        let command = PtyCommand::new("/bin/sh");
        let mut pty =
            PtyProcess::spawn(PaneId::new(), &command, &test_config(), None).unwrap();
        let mut rx = pty.take_output().unwrap();

        pty.write(b"echo CAPTURE_LINE\n").await.unwrap();
        collect_until(&mut rx, "CAPTURE_LINE", Duration::from_secs(5)).await;

        let tail = pty.capture_tail(50).join("\n");
        assert!(tail.contains("CAPTURE_LINE"), "got: {tail}");
    }
}
