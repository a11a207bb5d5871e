//! Local read-only inspector.
//!
//! Assembles an immutable snapshot of the agent (last delivery, per-shell
//! summary, pending acks) and optionally serves it as JSON on a loopback
//! address. The inspector never mutates control-loop state.

use std::net::SocketAddr;
use std::sync::Arc;

use axum::extract::State;
use axum::routing::get;
use axum::{Json, Router};
use serde::Serialize;
use serde_json::Value;

use crate::core::ack_ledger::AckLedger;
use crate::core::heartbeat::{DeliveryStatus, HeartbeatEngine};
use crate::core::protocol::{CallbackState, ProcessOutput};
use crate::core::registry::ShellRegistry;

/// Point-in-time view of the agent for an external status consumer.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct InspectorSnapshot {
    pub status: DeliveryStatus,
    pub last_sent: Option<String>,
    pub response: Option<Value>,
    pub error: Option<String>,
    pub processes: Vec<ProcessOutput>,
    pub pending_callbacks: CallbackState,
}

/// Read-only snapshot provider.
pub struct Inspector {
    registry: Arc<ShellRegistry>,
    ledger: Arc<AckLedger>,
    engine: Arc<HeartbeatEngine>,
}

impl Inspector {
    pub fn new(
        registry: Arc<ShellRegistry>,
        ledger: Arc<AckLedger>,
        engine: Arc<HeartbeatEngine>,
    ) -> Self {
        Self {
            registry,
            ledger,
            engine,
        }
    }

    pub fn snapshot(&self) -> InspectorSnapshot {
        let report = self.engine.report();
        InspectorSnapshot {
            status: report.status,
            last_sent: report.last_sent,
            response: report.response,
            error: report.error,
            processes: self.registry.snapshot(),
            pending_callbacks: self.ledger.snapshot(),
        }
    }

    /// Binds `addr` and serves `GET /status` from a background task. Returns
    /// the bound address (useful with port 0).
    pub async fn serve(self: &Arc<Self>, addr: &str) -> std::io::Result<SocketAddr> {
        let listener = tokio::net::TcpListener::bind(addr).await?;
        let local_addr = listener.local_addr()?;

        let app = Router::new()
            .route("/status", get(handle_status))
            .with_state(self.clone());
        tokio::spawn(async move {
            if let Err(e) = axum::serve(listener, app).await {
                log::error!("Inspector server error: {e}");
            }
        });

        log::info!("Inspector listening on http://{local_addr}/status");
        Ok(local_addr)
    }
}

async fn handle_status(State(inspector): State<Arc<Inspector>>) -> Json<InspectorSnapshot> {
    Json(inspector.snapshot())
}

#[cfg(test)]
mod tests {
    use super::*;

    use crate::config::AgentConfig;
    use crate::core::heartbeat::EngineFlags;
    use crate::core::protocol::SystemInfo;
    use crate::core::scheduler::Scheduler;
    use crate::core::telemetry::TelemetryProvider;

    struct NullTelemetry;

    #[async_trait::async_trait]
    impl TelemetryProvider for NullTelemetry {
        async fn collect(&self) -> SystemInfo {
            SystemInfo::default()
        }
    }

    fn test_inspector() -> Arc<Inspector> {
        let ledger = Arc::new(AckLedger::new());
        let registry = ShellRegistry::new(ledger.clone());
        let flags = Arc::new(EngineFlags::default());
        let scheduler = Scheduler::new(registry.clone(), flags.clone());
        let engine = Arc::new(HeartbeatEngine::new(
            AgentConfig::default(),
            registry.clone(),
            ledger.clone(),
            Arc::new(NullTelemetry),
            flags,
            scheduler,
        ));
        Arc::new(Inspector::new(registry, ledger, engine))
    }

    #[tokio::test]
    async fn fresh_agent_snapshot_is_empty_and_idle() {
        let inspector = test_inspector();
        let snapshot = inspector.snapshot();

        assert_eq!(snapshot.status, DeliveryStatus::Idle);
        assert!(snapshot.last_sent.is_none());
        assert!(snapshot.processes.is_empty());
        assert!(snapshot.pending_callbacks.process_death.is_empty());
        assert!(snapshot.pending_callbacks.process_created.is_none());
    }

    #[tokio::test]
    async fn snapshot_serializes_with_camel_case_keys() {
        let inspector = test_inspector();
        let wire = serde_json::to_value(inspector.snapshot()).unwrap();

        assert_eq!(wire["status"], "idle");
        assert!(wire.get("lastSent").is_some());
        assert!(wire.get("pendingCallbacks").is_some());
        assert_eq!(wire["processes"], serde_json::json!([]));
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn status_endpoint_serves_the_snapshot() {
        let inspector = test_inspector();
        let addr = inspector
            .serve("127.0.0.1:0")
            .await
            .expect("bind inspector");

        let body: Value = reqwest::get(format!("http://{addr}/status"))
            .await
            .expect("request status")
            .json()
            .await
            .expect("parse status");
        assert_eq!(body["status"], "idle");
        assert_eq!(body["pendingCallbacks"]["process_death"], serde_json::json!([]));
    }
}
