//! Host telemetry for the heartbeat payload.
//!
//! The engine depends only on the [`TelemetryProvider`] trait; the default
//! implementation samples the host through `sysinfo`. Collection failures
//! degrade to `null` sections rather than failing the heartbeat.

use async_trait::async_trait;
use serde_json::{json, Value};
use sysinfo::{Disks, System};
use tokio::sync::Mutex;

use crate::core::protocol::SystemInfo;

/// Source of the `system_info` heartbeat section.
#[async_trait]
pub trait TelemetryProvider: Send + Sync {
    async fn collect(&self) -> SystemInfo;
}

/// `sysinfo`-backed provider. Holds one [`System`] so CPU usage deltas are
/// computed against the previous refresh.
pub struct SysinfoTelemetry {
    system: Mutex<System>,
}

impl SysinfoTelemetry {
    pub fn new() -> Self {
        Self {
            system: Mutex::new(System::new()),
        }
    }
}

impl Default for SysinfoTelemetry {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl TelemetryProvider for SysinfoTelemetry {
    async fn collect(&self) -> SystemInfo {
        let mut system = self.system.lock().await;
        system.refresh_memory();
        system.refresh_cpu_usage();

        let os = json!({
            "name": System::name(),
            "version": System::os_version(),
            "kernel": System::kernel_version(),
            "hostname": System::host_name(),
        });

        let cpu = json!({
            "count": system.cpus().len(),
            "brand": system.cpus().first().map(|cpu| cpu.brand().to_string()),
            "usage_percent": system.global_cpu_usage(),
        });

        let load_avg = System::load_average();
        let load = json!({
            "one": load_avg.one,
            "five": load_avg.five,
            "fifteen": load_avg.fifteen,
        });

        let memory = json!({
            "total": system.total_memory(),
            "used": system.used_memory(),
            "free": system.free_memory(),
            "swap_total": system.total_swap(),
            "swap_used": system.used_swap(),
        });

        let disks: Vec<Value> = Disks::new_with_refreshed_list()
            .list()
            .iter()
            .map(|disk| {
                json!({
                    "name": disk.name().to_string_lossy(),
                    "mount": disk.mount_point().to_string_lossy(),
                    "total": disk.total_space(),
                    "available": disk.available_space(),
                })
            })
            .collect();

        SystemInfo {
            os: Some(os),
            cpu: Some(cpu),
            load: Some(load),
            memory: Some(memory),
            disks: Some(Value::Array(disks)),
        }
    }
}
