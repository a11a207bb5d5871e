//! Lifecycle authority for managed shells.
//!
//! The registry owns every PTY handle; stream and exit callbacks capture only
//! a weak registry handle plus the shell id, look the entry up on each event,
//! and skip silently when it is gone. A shell is removed on the first
//! observed exit — an eager removal by `kill` makes the later exit callback a
//! no-op.

use std::sync::{Arc, OnceLock, Weak};
use std::time::{Duration, Instant};

use dashmap::DashMap;
use sysinfo::System;

use crate::core::ack_ledger::AckLedger;
use crate::core::error::{AgentError, PtyError};
use crate::core::output_ring::OutputRing;
use crate::core::protocol::{ProcessOutput, ShellState};
use crate::core::pty_shell::{PtyExit, PtyShell};
use crate::core::scheduler::COMMAND_RESPONSE_DELAY;

/// A shell counts as `Active` if it produced output this recently.
const ACTIVE_WINDOW: Duration = Duration::from_secs(5);

/// Injected scheduler nudge; `None` lets the scheduler pick its default
/// interval.
pub type NudgeFn = Arc<dyn Fn(Option<Duration>) + Send + Sync>;

struct ManagedShell {
    pty: PtyShell,
    ring: OutputRing,
    /// Last known working directory (absolute path).
    cwd: String,
    /// True from a command write until the server confirms execution.
    command_pending: bool,
    /// True when the next path-looking output line should become the cwd.
    expect_pwd: bool,
    last_output_at: Instant,
    spawned_at: Instant,
}

/// Thread-safe shell registry keyed by shell id (the child pid as decimal).
pub struct ShellRegistry {
    shells: DashMap<String, ManagedShell>,
    ledger: Arc<AckLedger>,
    nudge: OnceLock<NudgeFn>,
    user: String,
    host: String,
}

impl ShellRegistry {
    pub fn new(ledger: Arc<AckLedger>) -> Arc<Self> {
        let user = std::env::var("USER")
            .or_else(|_| std::env::var("USERNAME"))
            .unwrap_or_else(|_| "unknown".to_string());
        let host = System::host_name().unwrap_or_else(|| "localhost".to_string());
        Arc::new(Self {
            shells: DashMap::new(),
            ledger,
            nudge: OnceLock::new(),
            user,
            host,
        })
    }

    /// Wires the scheduler nudge. Set once during startup; a registry without
    /// a nudge (tests) simply never wakes the scheduler.
    pub fn set_nudge(&self, nudge: NudgeFn) {
        if self.nudge.set(nudge).is_err() {
            log::debug!("Scheduler nudge already wired");
        }
    }

    fn nudge(&self, delay: Option<Duration>) {
        if let Some(nudge) = self.nudge.get() {
            nudge(delay);
        }
    }

    /// Spawns a new managed shell and publishes its creation notice.
    pub fn spawn(self: &Arc<Self>) -> Result<String, PtyError> {
        let data_registry = Arc::downgrade(self);
        let exit_registry = Arc::downgrade(self);

        let pty = PtyShell::spawn(
            move |pid, text| {
                if let Some(registry) = Weak::upgrade(&data_registry) {
                    registry.handle_output(&pid.to_string(), &text);
                }
            },
            move |pid, exit| {
                if let Some(registry) = Weak::upgrade(&exit_registry) {
                    registry.handle_exit(&pid.to_string(), exit);
                }
            },
        )?;

        let id = pty.pid().to_string();
        let cwd = std::env::current_dir()
            .map(|p| p.to_string_lossy().into_owned())
            .unwrap_or_else(|_| "/".to_string());

        let now = Instant::now();
        // A reused pid must not sit in both the registry and the death set.
        self.ledger.absolve(&id);
        self.shells.insert(
            id.clone(),
            ManagedShell {
                pty,
                ring: OutputRing::new(),
                cwd,
                command_pending: false,
                expect_pwd: false,
                last_output_at: now,
                spawned_at: now,
            },
        );
        self.ledger.record_created(&id);
        self.nudge(None);
        Ok(id)
    }

    /// Writes an already-normalized command to a shell and arms the pending
    /// and cwd-capture flags. Nudges the scheduler to report back soon.
    pub fn write(&self, id: &str, command: &str) -> Result<(), AgentError> {
        let mut shell = self
            .shells
            .get_mut(id)
            .ok_or_else(|| AgentError::UnknownShell(id.to_string()))?;
        shell.pty.write(command.as_bytes())?;
        shell.command_pending = true;
        shell.expect_pwd = true;
        drop(shell);

        self.nudge(Some(COMMAND_RESPONSE_DELAY));
        Ok(())
    }

    /// Kills and eagerly removes a shell. Returns false when the id is not
    /// registered. The PTY's own exit callback finds the slot empty later.
    pub fn kill(&self, id: &str) -> bool {
        match self.shells.remove(id) {
            Some((id, shell)) => {
                shell.pty.kill();
                self.ledger.record_death(&id);
                log::info!("Killed shell {id}");
                self.nudge(None);
                true
            }
            None => false,
        }
    }

    /// Best-effort teardown of every live shell; used on shutdown.
    pub fn kill_all(&self) {
        let ids: Vec<String> = self.shells.iter().map(|e| e.key().clone()).collect();
        for id in ids {
            self.kill(&id);
        }
    }

    /// Stream callback: stamps activity, runs the cwd-capture heuristic, and
    /// appends to the shell's ring. Skips silently for unknown ids.
    pub(crate) fn handle_output(&self, id: &str, text: &str) {
        let Some(mut shell) = self.shells.get_mut(id) else {
            return;
        };
        shell.last_output_at = Instant::now();

        if shell.expect_pwd {
            if let Some((cwd, elided)) = extract_cwd(text) {
                log::debug!("Shell {id} cwd is now {cwd}");
                shell.cwd = cwd;
                shell.expect_pwd = false;
                shell.ring.append(elided.as_bytes());
                return;
            }
        }
        shell.ring.append(text.as_bytes());
    }

    /// Exit callback: removes the shell and records its death. A slot already
    /// emptied by `kill` (or by a respawn of the same pid) is left alone.
    pub(crate) fn handle_exit(&self, id: &str, exit: PtyExit) {
        if self.shells.remove(id).is_some() {
            log::info!("Shell {id} exited (code={})", exit.exit_code);
            self.ledger.record_death(id);
            self.nudge(None);
        } else {
            log::debug!("Exit for shell {id} ignored (already removed)");
        }
    }

    /// Clears `command_pending` for every listed shell still present.
    pub fn confirm_commands(&self, ids: &[String]) {
        for id in ids {
            if let Some(mut shell) = self.shells.get_mut(id) {
                shell.command_pending = false;
            }
        }
    }

    /// Empties the ring of every listed shell still present.
    pub fn clear_rings(&self, ids: &[String]) {
        for id in ids {
            if let Some(mut shell) = self.shells.get_mut(id) {
                shell.ring.clear();
            }
        }
    }

    /// Renders the per-shell slice of the heartbeat payload.
    pub fn snapshot(&self) -> Vec<ProcessOutput> {
        self.shells
            .iter()
            .map(|entry| {
                let shell = entry.value();
                ProcessOutput {
                    pid: entry.key().clone(),
                    temp: shell.ring.read(),
                    cwd: self.prompt(&shell.cwd),
                    if_command_executed: shell.command_pending as u8,
                    status: derive_state(
                        shell.command_pending,
                        shell.last_output_at,
                        shell.ring.is_empty(),
                    ),
                }
            })
            .collect()
    }

    pub fn contains(&self, id: &str) -> bool {
        self.shells.contains_key(id)
    }

    pub fn len(&self) -> usize {
        self.shells.len()
    }

    pub fn is_empty(&self) -> bool {
        self.shells.is_empty()
    }

    /// How long a shell has been alive; `None` for unknown ids.
    pub fn uptime(&self, id: &str) -> Option<Duration> {
        self.shells.get(id).map(|shell| shell.spawned_at.elapsed())
    }

    fn prompt(&self, cwd: &str) -> String {
        format!("{}@{}:{}# ", self.user, self.host, cwd)
    }
}

/// Derives the reported shell state. `Terminated` is never derived here; dead
/// shells leave the registry and surface through the death callback instead.
fn derive_state(command_pending: bool, last_output_at: Instant, ring_empty: bool) -> ShellState {
    if command_pending {
        ShellState::Executing
    } else if last_output_at.elapsed() <= ACTIVE_WINDOW && !ring_empty {
        ShellState::Active
    } else {
        ShellState::Idle
    }
}

/// Cwd-capture heuristic: if the last non-empty line of a chunk looks like an
/// absolute path, returns it plus the chunk with that path substring elided.
///
/// Parsing the stream for the `pwd` echo is inherently fragile (prompts,
/// colors, interleaved output); a chunk that does not match simply leaves the
/// previous cwd in place.
fn extract_cwd(chunk: &str) -> Option<(String, String)> {
    let line = chunk
        .lines()
        .rev()
        .map(str::trim)
        .find(|line| !line.is_empty())?;
    if !looks_like_path(line) {
        return None;
    }

    let path = line.to_string();
    let elided = match chunk.rfind(&path) {
        Some(pos) => {
            let mut out = String::with_capacity(chunk.len() - path.len());
            out.push_str(&chunk[..pos]);
            out.push_str(&chunk[pos + path.len()..]);
            out
        }
        None => chunk.to_string(),
    };
    Some((path, elided))
}

/// `/`-rooted, or a Windows drive like `C:\`.
fn looks_like_path(line: &str) -> bool {
    if line.starts_with('/') {
        return true;
    }
    let bytes = line.as_bytes();
    bytes.len() >= 3 && bytes[0].is_ascii_uppercase() && bytes[1] == b':' && bytes[2] == b'\\'
}
