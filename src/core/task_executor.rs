//! Applies one server task batch against the registry.
//!
//! Steps run in a fixed order: death confirmations, spawn, commands, kills.
//! A failing step is logged and the batch carries on; the server retries
//! through the ack protocol rather than through batch-level errors.

use std::sync::Arc;

use serde_json::Value;

use crate::core::ack_ledger::AckLedger;
use crate::core::protocol::TaskBatch;
use crate::core::registry::ShellRegistry;

/// Interprets task batches delivered by heartbeat responses.
pub struct TaskExecutor {
    registry: Arc<ShellRegistry>,
    ledger: Arc<AckLedger>,
}

impl TaskExecutor {
    pub fn new(registry: Arc<ShellRegistry>, ledger: Arc<AckLedger>) -> Self {
        Self { registry, ledger }
    }

    /// Runs a batch. Returns true if at least one command was written, which
    /// the caller turns into a fire-soon scheduling hint.
    pub fn apply(&self, tasks: &TaskBatch) -> bool {
        // Death confirmations: make sure a shell the server believes dead and
        // that is indeed absent stays acknowledged until a heartbeat ships it.
        for id in &tasks.confirm_process_death {
            if !self.registry.contains(id) {
                self.ledger.record_death(id);
            }
        }

        if tasks.if_require_new_process == 1 {
            match self.registry.spawn() {
                Ok(id) => log::info!("Server requested a shell; spawned {id}"),
                Err(e) => log::error!("Server requested a shell but spawn failed: {e}"),
            }
        }

        let mut wrote_command = false;
        for task in &tasks.command {
            let command = normalize_command(&task.command);
            match self.registry.write(&task.pid, &command) {
                Ok(()) => {
                    log::info!("Wrote command to shell {}", task.pid);
                    wrote_command = true;
                }
                Err(e) => log::warn!("Command for shell {} not written: {e}", task.pid),
            }
        }

        for id in &tasks.kill_process {
            if !self.registry.kill(id) {
                log::debug!("Kill requested for unknown shell {id}");
            }
        }

        wrote_command
    }
}

/// Normalizes a server-sent command into the line written to the shell.
///
/// The server sometimes sends pre-escaped strings; the transforms below are
/// wire-compatibility accommodations and must be kept byte-for-byte:
/// JSON-decode a quoted payload, unescape `\"`/`\'`, pad un-escaped `>` in
/// `echo` redirections, collapse embedded newlines into `; `-joined segments.
/// The trailing `; pwd` lets the registry recapture the working directory
/// after every command.
pub fn normalize_command(raw: &Value) -> String {
    let mut command = match raw {
        Value::String(s) => s.clone(),
        other => other.to_string(),
    };

    if command.starts_with('"') {
        if let Ok(decoded) = serde_json::from_str::<String>(&command) {
            command = decoded;
        }
    }

    if command.contains("\\\"") || command.contains("\\'") {
        command = command.replace("\\\"", "\"").replace("\\'", "'");
    }

    if command.starts_with("echo") && command.contains('>') {
        command = space_redirections(&command);
    }

    if command.contains('\n') {
        command = command
            .lines()
            .map(str::trim)
            .filter(|line| !line.is_empty())
            .collect::<Vec<_>>()
            .join("; ");
    }

    command.push_str("; pwd\n");
    command
}

/// Ensures whitespace around every un-escaped `>` run (`>` or `>>`).
fn space_redirections(command: &str) -> String {
    let mut out = String::with_capacity(command.len() + 4);
    let mut prev: Option<char> = None;
    let mut chars = command.chars().peekable();

    while let Some(c) = chars.next() {
        if c == '>' && prev != Some('\\') {
            if !(out.is_empty() || out.ends_with(' ') || out.ends_with('>')) {
                out.push(' ');
            }
            out.push('>');
            if chars.peek().is_some_and(|&next| next != ' ' && next != '>') {
                out.push(' ');
            }
        } else {
            out.push(c);
        }
        prev = Some(c);
    }
    out
}
