use thiserror::Error;

/// Errors raised by the PTY layer.
#[derive(Debug, Error)]
pub enum PtyError {
    /// PTY or shell process could not be created.
    #[error("failed to spawn shell: {0}")]
    SpawnFailed(String),
    /// Writing to the shell's stdin failed (lock poison or I/O error).
    #[error("failed to write to shell: {0}")]
    WriteFailed(String),
}

/// Errors raised by the control loop.
///
/// None of these abort the agent: heartbeats record the failure and keep
/// scheduling, task batches log the failing step and continue.
#[derive(Debug, Error)]
pub enum AgentError {
    /// `CLI_TOKEN` or `SERVER_URL` is missing; heartbeats cannot be sent.
    #[error("agent is not configured: {0}")]
    NotConfigured(&'static str),
    /// The heartbeat POST failed at the transport level (including timeouts
    /// and non-2xx statuses).
    #[error("heartbeat transport failed: {0}")]
    Transport(#[from] reqwest::Error),
    /// The server answered, but with an unusable body or a refusing
    /// `statusCode`.
    #[error("server returned an unusable response: {0}")]
    BadResponse(String),
    /// A task referenced a shell id that is not in the registry.
    #[error("no managed shell with id {0}")]
    UnknownShell(String),
    #[error(transparent)]
    Pty(#[from] PtyError),
}
