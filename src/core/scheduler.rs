//! Heartbeat timing.
//!
//! At most one timer is pending at a time; every `schedule` call replaces the
//! previous timer, so bursts of spawn/kill/output events coalesce into a
//! single wakeup. The actual firing action is injected at startup.

use std::sync::{Arc, Mutex, OnceLock};
use std::time::Duration;

use tokio::task::JoinHandle;

use crate::core::heartbeat::EngineFlags;
use crate::core::registry::ShellRegistry;

/// Interval while no shells are managed.
pub const IDLE_INTERVAL: Duration = Duration::from_millis(5000);
/// Interval while at least one shell is managed.
pub const MANAGED_INTERVAL: Duration = Duration::from_millis(2000);
/// Retry delay when the timer fires mid-heartbeat or mid-batch.
pub const BUSY_RETRY_DELAY: Duration = Duration::from_millis(1000);
/// Delay for the report-back heartbeat after a command write.
pub const COMMAND_RESPONSE_DELAY: Duration = Duration::from_millis(1000);

/// Injected firing action; spawns one `send_once` round.
pub type FireFn = Arc<dyn Fn() + Send + Sync>;

/// Single-slot heartbeat timer.
pub struct Scheduler {
    registry: Arc<ShellRegistry>,
    flags: Arc<EngineFlags>,
    fire: OnceLock<FireFn>,
    pending: Mutex<Option<JoinHandle<()>>>,
}

impl Scheduler {
    pub fn new(registry: Arc<ShellRegistry>, flags: Arc<EngineFlags>) -> Arc<Self> {
        Arc::new(Self {
            registry,
            flags,
            fire: OnceLock::new(),
            pending: Mutex::new(None),
        })
    }

    /// Wires the firing action. Set once during startup.
    pub fn set_fire(&self, fire: FireFn) {
        if self.fire.set(fire).is_err() {
            log::debug!("Scheduler firing action already wired");
        }
    }

    /// Arms the timer, replacing any pending one.
    ///
    /// Without an explicit delay the interval adapts to the registry: 2 s
    /// while shells are managed, 5 s otherwise. A timer that fires while a
    /// heartbeat or task batch is still running defers itself by 1 s.
    pub fn schedule(self: &Arc<Self>, delay: Option<Duration>) {
        let delay = delay.unwrap_or_else(|| self.default_delay());

        let scheduler = Arc::clone(self);
        let timer = tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            if scheduler.flags.busy() {
                scheduler.schedule(Some(BUSY_RETRY_DELAY));
            } else if let Some(fire) = scheduler.fire.get() {
                fire();
            }
        });

        let Ok(mut pending) = self.pending.lock() else {
            timer.abort();
            return;
        };
        if let Some(previous) = pending.replace(timer) {
            previous.abort();
        }
    }

    fn default_delay(&self) -> Duration {
        if self.registry.is_empty() {
            IDLE_INTERVAL
        } else {
            MANAGED_INTERVAL
        }
    }
}
