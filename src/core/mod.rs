pub mod ack_ledger;
pub mod error;
pub mod heartbeat;
pub mod inspector;
pub mod output_ring;
pub mod protocol;
pub mod pty_shell;
pub mod registry;
pub mod scheduler;
pub mod task_executor;
pub mod telemetry;

pub use ack_ledger::AckLedger;
pub use error::{AgentError, PtyError};
pub use heartbeat::{DeliveryReport, DeliveryStatus, EngineFlags, HeartbeatEngine};
pub use inspector::{Inspector, InspectorSnapshot};
pub use output_ring::{OutputRing, RING_CAPACITY};
pub use protocol::{
    CallbackState, CommandTask, HeartbeatPayload, HeartbeatResponse, ProcessOutput,
    ResponseCallback, ShellState, SystemInfo, TaskBatch,
};
pub use pty_shell::{PtyExit, PtyShell};
pub use registry::{NudgeFn, ShellRegistry};
pub use scheduler::{FireFn, Scheduler};
pub use task_executor::{normalize_command, TaskExecutor};
pub use telemetry::{SysinfoTelemetry, TelemetryProvider};
