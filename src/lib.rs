//! Tetherd keeps a heartbeat control channel to a remote orchestration
//! server and runs interactive shells on its behalf.
//!
//! Each heartbeat ships host telemetry, output drained from every managed
//! shell, and acknowledgements for earlier events; the response carries new
//! task instructions (spawn a shell, run a command, kill a shell, confirm a
//! death). The pieces live under [`core`]: the PTY pool and registry, the
//! per-shell output rings, the ack ledger, the heartbeat engine, and the
//! adaptive scheduler that ties them together.

pub mod config;
pub mod core;
