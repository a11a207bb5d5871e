//! Wire types for the heartbeat exchange.
//!
//! The server side of the protocol is only partially typed: any field may be
//! missing, and unknown fields must be ignored. Everything inbound therefore
//! carries `#[serde(default)]`, and `command` values arrive as arbitrary JSON
//! that the task executor coerces to a string.

use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Outbound heartbeat body, POSTed to `SERVER_URL`.
#[derive(Debug, Clone, Serialize)]
pub struct HeartbeatPayload {
    pub cli_token: String,
    pub system_info: SystemInfo,
    pub process_output: Vec<ProcessOutput>,
    pub callback: CallbackState,
}

/// Host telemetry. Every section is optional; a provider that cannot fill a
/// section sends `null` rather than omitting the key.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct SystemInfo {
    pub os: Option<Value>,
    pub cpu: Option<Value>,
    pub load: Option<Value>,
    pub memory: Option<Value>,
    pub disks: Option<Value>,
}

/// One managed shell's slice of the heartbeat.
#[derive(Debug, Clone, Serialize)]
pub struct ProcessOutput {
    #[serde(rename = "PID")]
    pub pid: String,
    /// Unshipped output drained from the shell's ring.
    pub temp: String,
    /// Prompt string rendered as `user@host:cwd# `.
    pub cwd: String,
    pub if_command_executed: u8,
    pub status: ShellState,
}

/// Derived shell state. `Terminated` never appears in the registry snapshot;
/// it is only observable through the death callback.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum ShellState {
    Idle,
    Active,
    Executing,
    Terminated,
}

/// Acks the agent owes the server, snapshotted from the ledger.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct CallbackState {
    pub process_death: Vec<String>,
    pub process_created: Option<String>,
}

/// Heartbeat response. `statusCode != 1` means the acks and tasks must be
/// ignored wholesale.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct HeartbeatResponse {
    #[serde(rename = "statusCode", default)]
    pub status_code: i64,
    #[serde(default)]
    pub callback: ResponseCallback,
    #[serde(default)]
    pub tasks: TaskBatch,
}

/// Server acknowledgements for state the agent shipped earlier.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct ResponseCallback {
    #[serde(default)]
    pub command_executed_confirmed: Vec<String>,
    #[serde(default)]
    pub process_output_update_succeed: Vec<String>,
}

/// Instructions delivered in one heartbeat response.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct TaskBatch {
    #[serde(default)]
    pub confirm_process_death: Vec<String>,
    #[serde(default)]
    pub if_require_new_process: i64,
    #[serde(default)]
    pub command: Vec<CommandTask>,
    #[serde(default)]
    pub kill_process: Vec<String>,
}

/// A command to run inside an existing shell.
#[derive(Debug, Clone, Deserialize)]
pub struct CommandTask {
    #[serde(rename = "PID")]
    pub pid: String,
    #[serde(default)]
    pub command: Value,
}
