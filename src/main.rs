use std::sync::Arc;

use tetherd::config::AgentConfig;
use tetherd::core::{
    AckLedger, EngineFlags, HeartbeatEngine, Inspector, Scheduler, ShellRegistry,
    SysinfoTelemetry, TelemetryProvider,
};

#[tokio::main]
async fn main() {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();
    log::info!("tetherd {} starting", env!("CARGO_PKG_VERSION"));

    let config = AgentConfig::from_env();

    let ledger = Arc::new(AckLedger::new());
    let registry = ShellRegistry::new(ledger.clone());
    let flags = Arc::new(EngineFlags::default());
    let scheduler = Scheduler::new(registry.clone(), flags.clone());

    // Registry events (spawn, kill, exit, command write) wake the scheduler.
    {
        let scheduler = scheduler.clone();
        registry.set_nudge(Arc::new(move |delay| scheduler.schedule(delay)));
    }

    let telemetry: Arc<dyn TelemetryProvider> = Arc::new(SysinfoTelemetry::new());
    let engine = Arc::new(HeartbeatEngine::new(
        config.clone(),
        registry.clone(),
        ledger.clone(),
        telemetry,
        flags,
        scheduler.clone(),
    ));

    // The timer holds only a weak engine handle; firing spawns one round.
    {
        let engine = Arc::downgrade(&engine);
        scheduler.set_fire(Arc::new(move || {
            if let Some(engine) = engine.upgrade() {
                tokio::spawn(async move { engine.send_once().await });
            }
        }));
    }

    if let Some(addr) = config.inspector_addr.clone() {
        let inspector = Arc::new(Inspector::new(registry.clone(), ledger, engine.clone()));
        if let Err(e) = inspector.serve(&addr).await {
            log::error!("Failed to start inspector on {addr}: {e}");
        }
    }

    if !config.is_configured() {
        log::warn!("Agent is not fully configured; heartbeats will be recorded as failed");
    }

    scheduler.schedule(None);

    wait_for_shutdown().await;
    log::info!(
        "Shutdown signal received; terminating {} managed shell(s)",
        registry.len()
    );
    registry.kill_all();
}

/// Completes on Ctrl-C everywhere, or SIGTERM on Unix.
async fn wait_for_shutdown() {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{signal, SignalKind};
        match signal(SignalKind::terminate()) {
            Ok(mut term) => {
                tokio::select! {
                    _ = tokio::signal::ctrl_c() => {}
                    _ = term.recv() => {}
                }
            }
            Err(e) => {
                log::error!("Failed to install SIGTERM handler: {e}");
                let _ = tokio::signal::ctrl_c().await;
            }
        }
    }
    #[cfg(not(unix))]
    {
        let _ = tokio::signal::ctrl_c().await;
    }
}
