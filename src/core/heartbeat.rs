//! The heartbeat engine: builds the outbound payload, performs the POST,
//! applies response acks, and hands the task batch to the executor.
//!
//! At most one heartbeat is in flight and at most one batch is executing;
//! both exclusions live in [`EngineFlags`] so the scheduler can observe them.
//! The ledger is drained only after a successful exchange, giving the ack
//! protocol its at-least-once guarantee.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use serde::Serialize;
use serde_json::Value;

use crate::config::AgentConfig;
use crate::core::ack_ledger::AckLedger;
use crate::core::error::AgentError;
use crate::core::protocol::{HeartbeatPayload, HeartbeatResponse};
use crate::core::registry::ShellRegistry;
use crate::core::scheduler::{Scheduler, COMMAND_RESPONSE_DELAY};
use crate::core::task_executor::TaskExecutor;
use crate::core::telemetry::TelemetryProvider;

/// Per-request timeout; must not undercut the idle heartbeat interval.
const REQUEST_TIMEOUT: Duration = Duration::from_secs(10);

/// Mutual-exclusion flags shared between the engine and the scheduler.
#[derive(Debug, Default)]
pub struct EngineFlags {
    heartbeat_in_progress: AtomicBool,
    tasks_in_progress: AtomicBool,
}

impl EngineFlags {
    pub fn busy(&self) -> bool {
        self.heartbeat_in_progress.load(Ordering::SeqCst)
            || self.tasks_in_progress.load(Ordering::SeqCst)
    }

    /// Claims the heartbeat slot; both flags must be clear.
    pub(crate) fn try_begin_heartbeat(&self) -> Option<HeartbeatGuard<'_>> {
        if self.tasks_in_progress.load(Ordering::SeqCst) {
            return None;
        }
        self.heartbeat_in_progress
            .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .ok()
            .map(|_| HeartbeatGuard { flags: self })
    }

    fn begin_tasks(&self) -> TasksGuard<'_> {
        self.tasks_in_progress.store(true, Ordering::SeqCst);
        TasksGuard { flags: self }
    }
}

pub(crate) struct HeartbeatGuard<'a> {
    flags: &'a EngineFlags,
}

impl Drop for HeartbeatGuard<'_> {
    fn drop(&mut self) {
        self.flags.heartbeat_in_progress.store(false, Ordering::SeqCst);
    }
}

struct TasksGuard<'a> {
    flags: &'a EngineFlags,
}

impl Drop for TasksGuard<'_> {
    fn drop(&mut self) {
        self.flags.tasks_in_progress.store(false, Ordering::SeqCst);
    }
}

/// Outcome of the most recent heartbeat, read by the inspector.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum DeliveryStatus {
    /// No heartbeat has been attempted yet.
    #[default]
    Idle,
    Success,
    Failed,
}

#[derive(Debug, Clone, Default, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct DeliveryReport {
    pub status: DeliveryStatus,
    pub last_sent: Option<String>,
    pub response: Option<Value>,
    pub error: Option<String>,
}

pub struct HeartbeatEngine {
    config: AgentConfig,
    client: reqwest::Client,
    registry: Arc<ShellRegistry>,
    ledger: Arc<AckLedger>,
    telemetry: Arc<dyn TelemetryProvider>,
    executor: TaskExecutor,
    flags: Arc<EngineFlags>,
    scheduler: Arc<Scheduler>,
    report: Mutex<DeliveryReport>,
}

impl HeartbeatEngine {
    pub fn new(
        config: AgentConfig,
        registry: Arc<ShellRegistry>,
        ledger: Arc<AckLedger>,
        telemetry: Arc<dyn TelemetryProvider>,
        flags: Arc<EngineFlags>,
        scheduler: Arc<Scheduler>,
    ) -> Self {
        let executor = TaskExecutor::new(registry.clone(), ledger.clone());
        Self {
            config,
            client: reqwest::Client::new(),
            registry,
            ledger,
            telemetry,
            executor,
            flags,
            scheduler,
            report: Mutex::new(DeliveryReport::default()),
        }
    }

    /// Runs one heartbeat round and schedules the next one.
    ///
    /// Returns immediately when a heartbeat or task batch is already running;
    /// the pending timer retries shortly after.
    pub async fn send_once(&self) {
        let Some(guard) = self.flags.try_begin_heartbeat() else {
            log::debug!("Heartbeat skipped: a round is already in flight");
            return;
        };
        let hint = match self.run_round().await {
            Ok(hint) => hint,
            Err(e) => {
                self.record_failure(&e);
                None
            }
        };
        drop(guard);
        self.scheduler.schedule(hint);
    }

    async fn run_round(&self) -> Result<Option<Duration>, AgentError> {
        let (token, url) = match (&self.config.cli_token, &self.config.server_url) {
            (Some(token), Some(url)) => (token.clone(), url.clone()),
            _ => return Err(AgentError::NotConfigured("CLI_TOKEN or SERVER_URL missing")),
        };

        let payload = HeartbeatPayload {
            cli_token: token,
            system_info: self.telemetry.collect().await,
            process_output: self.registry.snapshot(),
            callback: self.ledger.snapshot(),
        };
        // Remember exactly what shipped: only those entries may be cleared.
        let shipped = payload.callback.clone();

        let response = self
            .client
            .post(url)
            .json(&payload)
            .timeout(REQUEST_TIMEOUT)
            .send()
            .await?
            .error_for_status()?;

        let body: Value = response
            .json()
            .await
            .map_err(|e| AgentError::BadResponse(format!("unreadable response body: {e}")))?;

        let reply: HeartbeatResponse = serde_json::from_value(body.clone())
            .map_err(|e| AgentError::BadResponse(format!("malformed response: {e}")))?;

        if reply.status_code != 1 {
            return Err(AgentError::BadResponse(format!(
                "server refused heartbeat (statusCode {})",
                reply.status_code
            )));
        }

        // Response acks land before the batch: a ring cleared or a command
        // confirmed by this response must not touch anything the batch is
        // about to write.
        self.registry
            .confirm_commands(&reply.callback.command_executed_confirmed);
        self.registry
            .clear_rings(&reply.callback.process_output_update_succeed);
        self.ledger.clear_shipped(&shipped);

        let hint = {
            let _tasks = self.flags.begin_tasks();
            if self.executor.apply(&reply.tasks) {
                Some(COMMAND_RESPONSE_DELAY)
            } else {
                None
            }
        };

        self.record_success(body);
        Ok(hint)
    }

    /// Copy of the latest delivery report for the inspector.
    pub fn report(&self) -> DeliveryReport {
        self.report
            .lock()
            .map(|report| report.clone())
            .unwrap_or_default()
    }

    fn record_success(&self, body: Value) {
        if let Ok(mut report) = self.report.lock() {
            report.status = DeliveryStatus::Success;
            report.last_sent = Some(chrono::Utc::now().to_rfc3339());
            report.response = Some(body);
            report.error = None;
        }
    }

    fn record_failure(&self, error: &AgentError) {
        log::warn!("Heartbeat failed: {error}");
        if let Ok(mut report) = self.report.lock() {
            report.status = DeliveryStatus::Failed;
            report.error = Some(error.to_string());
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::VecDeque;
    use std::net::SocketAddr;
    use std::sync::Mutex as StdMutex;

    use axum::routing::post;
    use axum::{Json, Router};
    use serde_json::json;
    use url::Url;

    use crate::core::protocol::SystemInfo;

    struct NullTelemetry;

    #[async_trait::async_trait]
    impl TelemetryProvider for NullTelemetry {
        async fn collect(&self) -> SystemInfo {
            SystemInfo::default()
        }
    }

    type Received = Arc<StdMutex<Vec<Value>>>;

    /// Mock orchestration server: records every heartbeat body and answers
    /// from a scripted queue (falling back to a bare success).
    async fn start_mock_server(replies: Vec<Value>) -> (SocketAddr, Received) {
        let received: Received = Arc::new(StdMutex::new(Vec::new()));
        let queue = Arc::new(StdMutex::new(VecDeque::from(replies)));

        let received_handle = received.clone();
        let app = Router::new().route(
            "/heartbeat",
            post(move |Json(body): Json<Value>| {
                let received = received_handle.clone();
                let queue = queue.clone();
                async move {
                    received.lock().unwrap().push(body);
                    let reply = queue
                        .lock()
                        .unwrap()
                        .pop_front()
                        .unwrap_or_else(|| json!({"statusCode": 1}));
                    Json(reply)
                }
            }),
        );

        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            axum::serve(listener, app).await.unwrap();
        });
        (addr, received)
    }

    struct TestAgent {
        engine: Arc<HeartbeatEngine>,
        registry: Arc<ShellRegistry>,
        ledger: Arc<AckLedger>,
    }

    fn test_agent(server: Option<SocketAddr>) -> TestAgent {
        let ledger = Arc::new(AckLedger::new());
        let registry = ShellRegistry::new(ledger.clone());
        let flags = Arc::new(EngineFlags::default());
        let scheduler = Scheduler::new(registry.clone(), flags.clone());
        let config = AgentConfig {
            cli_token: server.map(|_| "tok".to_string()),
            server_url: server
                .map(|addr| Url::parse(&format!("http://{addr}/heartbeat")).unwrap()),
            inspector_addr: None,
        };
        let engine = Arc::new(HeartbeatEngine::new(
            config,
            registry.clone(),
            ledger.clone(),
            Arc::new(NullTelemetry),
            flags,
            scheduler,
        ));
        TestAgent {
            engine,
            registry,
            ledger,
        }
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn missing_configuration_records_a_failure_without_sending() {
        let agent = test_agent(None);
        agent.engine.send_once().await;

        let report = agent.engine.report();
        assert_eq!(report.status, DeliveryStatus::Failed);
        assert!(report.error.unwrap().contains("not configured"));
        assert!(report.last_sent.is_none());
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn cold_start_heartbeat_has_the_empty_shape() {
        let (addr, received) = start_mock_server(vec![]).await;
        let agent = test_agent(Some(addr));

        agent.engine.send_once().await;

        let bodies = received.lock().unwrap();
        assert_eq!(bodies.len(), 1);
        let body = &bodies[0];
        assert_eq!(body["cli_token"], "tok");
        assert_eq!(body["process_output"], json!([]));
        assert_eq!(body["callback"]["process_death"], json!([]));
        assert_eq!(body["callback"]["process_created"], Value::Null);
        drop(bodies);

        let report = agent.engine.report();
        assert_eq!(report.status, DeliveryStatus::Success);
        assert!(report.last_sent.is_some());
        assert!(report.error.is_none());
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn transport_failure_preserves_the_ledger() {
        // Bind then drop a listener so the port refuses connections.
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        drop(listener);

        let agent = test_agent(Some(addr));
        agent.ledger.record_death("77");
        agent.ledger.record_created("78");

        agent.engine.send_once().await;

        assert_eq!(agent.engine.report().status, DeliveryStatus::Failed);
        assert!(agent.ledger.contains_death("77"));
        assert_eq!(
            agent.ledger.snapshot().process_created.as_deref(),
            Some("78")
        );
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn refusing_status_code_ignores_acks_and_tasks() {
        let (addr, _received) = start_mock_server(vec![json!({
            "statusCode": 0,
            "tasks": {"if_require_new_process": 1}
        })])
        .await;
        let agent = test_agent(Some(addr));
        agent.ledger.record_death("5");

        agent.engine.send_once().await;

        assert_eq!(agent.engine.report().status, DeliveryStatus::Failed);
        assert!(agent.registry.is_empty(), "tasks must be ignored");
        assert!(agent.ledger.contains_death("5"), "acks must be retried");
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn successful_heartbeat_drains_the_shipped_ledger() {
        let (addr, received) = start_mock_server(vec![]).await;
        let agent = test_agent(Some(addr));
        agent.ledger.record_death("31");

        agent.engine.send_once().await;
        assert!(agent.ledger.is_empty());

        agent.engine.send_once().await;
        let bodies = received.lock().unwrap();
        assert_eq!(bodies[0]["callback"]["process_death"], json!(["31"]));
        assert_eq!(bodies[1]["callback"]["process_death"], json!([]));
    }

    #[cfg(unix)]
    #[tokio::test(flavor = "multi_thread")]
    async fn spawn_task_creates_a_shell_and_ships_its_creation() {
        let (addr, received) = start_mock_server(vec![json!({
            "statusCode": 1,
            "tasks": {"if_require_new_process": 1}
        })])
        .await;
        let agent = test_agent(Some(addr));

        agent.engine.send_once().await;
        assert_eq!(agent.registry.len(), 1);

        agent.engine.send_once().await;
        {
            let bodies = received.lock().unwrap();
            let second = &bodies[1];
            let id = second["callback"]["process_created"]
                .as_str()
                .expect("creation notice")
                .to_string();
            assert_eq!(second["process_output"][0]["PID"], Value::String(id));
            assert_eq!(second["process_output"][0]["if_command_executed"], 0);
        }

        // The creation shipped successfully; the third heartbeat is clean.
        agent.engine.send_once().await;
        {
            let bodies = received.lock().unwrap();
            assert_eq!(bodies[2]["callback"]["process_created"], Value::Null);
        }

        agent.registry.kill_all();
    }

    /// Builds an engine against an already-populated registry.
    fn engine_for(
        addr: SocketAddr,
        registry: Arc<ShellRegistry>,
        ledger: Arc<AckLedger>,
    ) -> HeartbeatEngine {
        let flags = Arc::new(EngineFlags::default());
        let scheduler = Scheduler::new(registry.clone(), flags.clone());
        HeartbeatEngine::new(
            AgentConfig {
                cli_token: Some("tok".to_string()),
                server_url: Some(Url::parse(&format!("http://{addr}/heartbeat")).unwrap()),
                inspector_addr: None,
            },
            registry,
            ledger,
            Arc::new(NullTelemetry),
            flags,
            scheduler,
        )
    }

    #[cfg(unix)]
    #[tokio::test(flavor = "multi_thread")]
    async fn command_pending_follows_write_then_confirmation() {
        let ledger = Arc::new(AckLedger::new());
        let registry = ShellRegistry::new(ledger.clone());
        let id = registry.spawn().expect("spawn shell");

        let (addr, received) = start_mock_server(vec![
            json!({
                "statusCode": 1,
                "tasks": {"command": [{"PID": id.clone(), "command": "echo ack-check"}]}
            }),
            json!({
                "statusCode": 1,
                "callback": {"command_executed_confirmed": [id.clone()]}
            }),
        ])
        .await;
        let engine = engine_for(addr, registry.clone(), ledger);

        // Round 1 delivers the command; round 2 ships it pending and receives
        // the confirmation; round 3 ships it cleared.
        engine.send_once().await;
        engine.send_once().await;
        engine.send_once().await;

        let bodies = received.lock().unwrap();
        assert_eq!(bodies[1]["process_output"][0]["if_command_executed"], 1);
        assert_eq!(bodies[1]["process_output"][0]["status"], "executing");
        assert_eq!(bodies[2]["process_output"][0]["if_command_executed"], 0);
        drop(bodies);

        registry.kill_all();
    }

    #[cfg(unix)]
    #[tokio::test(flavor = "multi_thread")]
    async fn kill_task_empties_the_registry_and_ships_the_death() {
        let ledger = Arc::new(AckLedger::new());
        let registry = ShellRegistry::new(ledger.clone());
        let id = registry.spawn().expect("spawn shell");

        let (addr, received) = start_mock_server(vec![json!({
            "statusCode": 1,
            "tasks": {"kill_process": [id.clone()]}
        })])
        .await;
        let engine = engine_for(addr, registry.clone(), ledger.clone());

        engine.send_once().await;
        assert!(registry.is_empty());
        assert!(ledger.contains_death(&id));

        // The next heartbeat carries the death; its success drains it.
        engine.send_once().await;
        assert!(ledger.is_empty());

        let bodies = received.lock().unwrap();
        assert_eq!(bodies[1]["process_output"], json!([]));
        assert_eq!(bodies[1]["callback"]["process_death"], json!([id]));
    }

    #[cfg(unix)]
    #[tokio::test(flavor = "multi_thread")]
    async fn output_ack_clears_the_ring_before_the_next_round() {
        let ledger = Arc::new(AckLedger::new());
        let registry = ShellRegistry::new(ledger.clone());
        let id = registry.spawn().expect("spawn shell");

        let (addr, received) = start_mock_server(vec![json!({
            "statusCode": 1,
            "callback": {"process_output_update_succeed": [id.clone()]}
        })])
        .await;
        let engine = engine_for(addr, registry.clone(), ledger);

        registry.handle_output(&id, "stale scrollback");
        engine.send_once().await;
        engine.send_once().await;

        let bodies = received.lock().unwrap();
        assert!(bodies[0]["process_output"][0]["temp"]
            .as_str()
            .unwrap()
            .contains("stale scrollback"));
        // The ack in response 1 cleared the ring; only output produced in the
        // interim (the shell's own prompt noise, if any) may remain.
        assert!(!bodies[1]["process_output"][0]["temp"]
            .as_str()
            .unwrap()
            .contains("stale scrollback"));
        drop(bodies);

        registry.kill_all();
    }
}
