//! Interactive shells under a pseudo-terminal.
//!
//! Each shell gets a dedicated OS reader thread feeding a bounded channel,
//! an async pump that decodes chunks and hands them to the owner's `on_data`
//! callback, and a blocking waiter that fires `on_exit` exactly once. The
//! PTY merges stdout and stderr into a single stream.

use std::io::{Read, Write};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Mutex;
use std::time::Duration;

use portable_pty::{native_pty_system, CommandBuilder, MasterPty, PtySize};

use super::error::PtyError;

/// Terminal size is fixed at spawn; resize is out of scope.
const PTY_ROWS: u16 = 30;
const PTY_COLS: u16 = 80;
/// Read granularity of the PTY reader thread.
const READ_CHUNK: usize = 4096;
/// Bounded output channel between the reader thread and the async pump.
const OUTPUT_CHANNEL_SLOTS: usize = 256;
/// Grace period between SIGTERM and SIGKILL.
#[cfg(unix)]
const KILL_GRACE: Duration = Duration::from_secs(3);

fn shell_program() -> &'static str {
    #[cfg(unix)]
    {
        "bash"
    }
    #[cfg(windows)]
    {
        "powershell.exe"
    }
}

/// Exit notification for a shell. `portable-pty` folds a terminating signal
/// into the exit code, so no separate signal field is carried.
#[derive(Debug, Clone, Copy)]
pub struct PtyExit {
    pub exit_code: u32,
}

/// Stateful UTF-8 decoder for PTY chunks.
///
/// A multi-byte sequence can straddle a read boundary; decoding each chunk
/// independently would mangle it into replacement characters. Incomplete
/// trailing bytes are buffered and prepended to the next chunk instead.
#[derive(Debug, Default)]
pub(crate) struct ChunkDecoder {
    incomplete: Vec<u8>,
}

impl ChunkDecoder {
    pub(crate) fn new() -> Self {
        Self::default()
    }

    /// Decodes a chunk, carrying any trailing partial sequence over to the
    /// next call. Invalid bytes (not merely incomplete) are dropped.
    pub(crate) fn decode(&mut self, input: &[u8]) -> String {
        let mut data = std::mem::take(&mut self.incomplete);
        data.extend_from_slice(input);

        let mut out = String::with_capacity(data.len());
        let mut rest = data.as_slice();
        loop {
            match std::str::from_utf8(rest) {
                Ok(valid) => {
                    out.push_str(valid);
                    break;
                }
                Err(e) => {
                    let valid_up_to = e.valid_up_to();
                    // Safe split: everything before the error is valid UTF-8.
                    out.push_str(std::str::from_utf8(&rest[..valid_up_to]).unwrap_or(""));
                    match e.error_len() {
                        // Truncated sequence at the end of the chunk.
                        None => {
                            self.incomplete = rest[valid_up_to..].to_vec();
                            break;
                        }
                        // Genuinely invalid bytes: skip them.
                        Some(len) => rest = &rest[valid_up_to + len..],
                    }
                }
            }
        }
        out
    }
}

/// A live shell under a pseudo-terminal.
///
/// Owned exclusively by the registry; dropping it closes the master side,
/// which EOFs the reader thread.
pub struct PtyShell {
    pid: u32,
    writer: Mutex<Box<dyn Write + Send>>,
    /// Keeps the PTY open for the lifetime of the shell.
    _master: Mutex<Box<dyn MasterPty + Send>>,
    #[cfg(unix)]
    pgid: i32,
    killed: AtomicBool,
}

impl PtyShell {
    /// Spawns an interactive shell (80×30) inheriting the agent's environment
    /// and working directory.
    ///
    /// `on_data` receives decoded output chunks from the async pump;
    /// `on_exit` fires exactly once when the child is reaped. Both receive
    /// the child pid so callers can route by shell id without capturing the
    /// shell itself.
    pub fn spawn<D, E>(on_data: D, on_exit: E) -> Result<Self, PtyError>
    where
        D: Fn(u32, String) + Send + Sync + 'static,
        E: FnOnce(u32, PtyExit) + Send + 'static,
    {
        let pty_system = native_pty_system();
        let pair = pty_system
            .openpty(PtySize {
                rows: PTY_ROWS,
                cols: PTY_COLS,
                pixel_width: 0,
                pixel_height: 0,
            })
            .map_err(|e| PtyError::SpawnFailed(format!("failed to open PTY: {e}")))?;

        let mut cmd = CommandBuilder::new(shell_program());
        if let Ok(cwd) = std::env::current_dir() {
            cmd.cwd(cwd);
        }

        let mut child = pair
            .slave
            .spawn_command(cmd)
            .map_err(|e| PtyError::SpawnFailed(format!("failed to spawn {}: {e}", shell_program())))?;

        let pid = child
            .process_id()
            .ok_or_else(|| PtyError::SpawnFailed("could not obtain child pid".to_string()))?;

        // portable-pty calls setsid() on spawn, so the child leads its own
        // process group; capture it for group-wide signal delivery.
        #[cfg(unix)]
        let pgid = pair.master.process_group_leader().unwrap_or(pid as i32);

        let writer = pair
            .master
            .take_writer()
            .map_err(|e| PtyError::SpawnFailed(format!("failed to take PTY writer: {e}")))?;
        let mut reader = pair
            .master
            .try_clone_reader()
            .map_err(|e| PtyError::SpawnFailed(format!("failed to clone PTY reader: {e}")))?;

        let (tx, mut rx) = tokio::sync::mpsc::channel::<Vec<u8>>(OUTPUT_CHANNEL_SLOTS);

        // Dropping the master/writer closes the PTY fd, which makes the
        // blocking read below return Ok(0); that EOF is how this thread ends.
        std::thread::Builder::new()
            .name(format!("pty-reader-{pid}"))
            .spawn(move || {
                let mut buf = [0u8; READ_CHUNK];
                loop {
                    match reader.read(&mut buf) {
                        Ok(0) => break,
                        Ok(n) => {
                            if tx.blocking_send(buf[..n].to_vec()).is_err() {
                                break;
                            }
                        }
                        Err(e) => {
                            #[cfg(unix)]
                            {
                                let raw = e.raw_os_error().unwrap_or(0);
                                if raw == libc::EAGAIN || raw == libc::EINTR {
                                    continue;
                                }
                            }
                            log::debug!("PTY reader {pid} error: {e}");
                            break;
                        }
                    }
                }
                log::debug!("PTY reader {pid} exited");
            })
            .map_err(|e| PtyError::SpawnFailed(format!("failed to spawn reader thread: {e}")))?;

        // Async pump: decode chunks and hand them to the owner.
        tokio::spawn(async move {
            let mut decoder = ChunkDecoder::new();
            while let Some(bytes) = rx.recv().await {
                let text = decoder.decode(&bytes);
                if !text.is_empty() {
                    on_data(pid, text);
                }
            }
            log::debug!("PTY pump {pid} exited");
        });

        // Blocking waiter: reaps the child and fires the exit notification.
        tokio::spawn(async move {
            let status = tokio::task::spawn_blocking(move || child.wait()).await;
            let exit = match status {
                Ok(Ok(status)) => PtyExit {
                    exit_code: status.exit_code(),
                },
                Ok(Err(e)) => {
                    log::debug!("Wait on shell {pid} failed: {e}");
                    PtyExit { exit_code: 1 }
                }
                Err(e) => {
                    log::debug!("Waiter for shell {pid} did not finish: {e}");
                    PtyExit { exit_code: 1 }
                }
            };
            on_exit(pid, exit);
        });

        // The master keeps the PTY alive; the slave is no longer needed.
        drop(pair.slave);

        log::info!("Spawned shell pid={pid} ({})", shell_program());

        Ok(Self {
            pid,
            writer: Mutex::new(writer),
            _master: Mutex::new(pair.master),
            #[cfg(unix)]
            pgid,
            killed: AtomicBool::new(false),
        })
    }

    pub fn pid(&self) -> u32 {
        self.pid
    }

    /// Writes raw bytes to the shell's stdin and flushes immediately.
    pub fn write(&self, data: &[u8]) -> Result<(), PtyError> {
        let mut writer = self
            .writer
            .lock()
            .map_err(|e| PtyError::WriteFailed(format!("writer lock poisoned: {e}")))?;
        writer
            .write_all(data)
            .map_err(|e| PtyError::WriteFailed(format!("write failed: {e}")))?;
        writer
            .flush()
            .map_err(|e| PtyError::WriteFailed(format!("flush failed: {e}")))
    }

    /// Sends termination to the shell's process group. Idempotent; the first
    /// call wins and later calls are no-ops.
    ///
    /// Unix: SIGTERM to the group, escalating to SIGKILL after the grace
    /// period if the leader is still alive. Windows: `taskkill /T /F`.
    pub fn kill(&self) {
        if self.killed.swap(true, Ordering::SeqCst) {
            return;
        }

        #[cfg(unix)]
        {
            let pid = self.pid as i32;
            let pgid = self.pgid;

            // Negative pgid targets the whole group.
            if unsafe { libc::kill(-pgid, libc::SIGTERM) } != 0 {
                log::warn!(
                    "Failed to SIGTERM shell {pid} (pgid={pgid}): {}",
                    std::io::Error::last_os_error()
                );
            }

            tokio::spawn(async move {
                let exited = tokio::time::timeout(KILL_GRACE, async {
                    loop {
                        if unsafe { libc::kill(pid, 0) } != 0 {
                            return;
                        }
                        tokio::time::sleep(Duration::from_millis(100)).await;
                    }
                })
                .await;

                if exited.is_err() {
                    if unsafe { libc::kill(-pgid, libc::SIGKILL) } != 0 {
                        log::warn!(
                            "Failed to SIGKILL shell {pid} (pgid={pgid}): {}",
                            std::io::Error::last_os_error()
                        );
                    }
                    log::warn!("Shell {pid} (pgid={pgid}) required SIGKILL");
                }
            });
        }

        #[cfg(windows)]
        {
            let result = std::process::Command::new("taskkill")
                .args(["/PID", &self.pid.to_string(), "/T", "/F"])
                .output();
            if let Err(e) = result {
                log::warn!("Failed to taskkill shell {}: {e}", self.pid);
            }
        }
    }
}
