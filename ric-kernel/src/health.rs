use crate::config::MqttConf;
use crate::dispatcher::DispatchStats;
use crate::scheduler::LoopStats;
use crate::state::Kernel;
use parking_lot::Mutex;
use rumqttc::{AsyncClient, MqttOptions, QoS};
use serde::Serialize;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::task::{self, JoinHandle};
use tracing::{debug, warn};

pub const HEALTH_TOPIC: &str = "ric/kernel/health@v1";

#[derive(Debug, Serialize)]
pub struct KernelHealth {
    pub uptime_seconds: u64,
    pub devices_known: usize,
    pub devices_active: usize,
    pub sessions: usize,
    pub slices: usize,
    pub rules: usize,
    pub policy_generation: u64,
    pub telemetry_slots: usize,
    pub control_loop: LoopStats,
    pub dispatch: DispatchStats,
    pub memory_usage_mb: f32,
    pub mqtt_status: String,
    pub mqtt_reconnects: u32,
}

#[derive(Clone)]
pub struct HealthTracker {
    start_time: Instant,
    mqtt_reconnects: Arc<AtomicU32>,
    mqtt_status: Arc<Mutex<String>>,
}

impl HealthTracker {
    pub fn new() -> Self {
        Self {
            start_time: Instant::now(),
            mqtt_reconnects: Arc::new(AtomicU32::new(0)),
            mqtt_status: Arc::new(Mutex::new("disabled".to_string())),
        }
    }

    fn set_mqtt_status(&self, status: &str) {
        *self.mqtt_status.lock() = status.to_string();
    }

    fn increment_reconnects(&self) {
        self.mqtt_reconnects.fetch_add(1, Ordering::Relaxed);
        self.set_mqtt_status("reconnecting");
    }

    pub fn get_health(&self, kernel: &Kernel) -> KernelHealth {
        let snapshot = kernel.slices.snapshot();
        KernelHealth {
            uptime_seconds: self.start_time.elapsed().as_secs(),
            devices_known: kernel.registry.len(),
            devices_active: kernel.registry.list_active().len(),
            sessions: kernel.dispatcher.session_count(),
            slices: snapshot.slices().count(),
            rules: snapshot.rules().count(),
            policy_generation: snapshot.generation(),
            telemetry_slots: kernel.telemetry.len(),
            control_loop: kernel.control.stats(),
            dispatch: kernel.dispatcher.stats(),
            memory_usage_mb: get_memory_usage_mb(),
            mqtt_status: self.mqtt_status.lock().clone(),
            mqtt_reconnects: self.mqtt_reconnects.load(Ordering::Relaxed),
        }
    }

    /// Publication périodique du health sur MQTT (toutes les 30s)
    pub fn spawn_health_publisher(&self, kernel: Kernel, mqtt: MqttConf) -> JoinHandle<()> {
        let tracker = self.clone();
        tracker.set_mqtt_status("connecting");

        task::spawn(async move {
            let mut opts = MqttOptions::new("ric-kernel-health", &mqtt.host, mqtt.port);
            opts.set_keep_alive(Duration::from_secs(15));
            let (client, mut eventloop) = AsyncClient::new(opts, 10);
            let mut interval = tokio::time::interval(Duration::from_secs(30));

            loop {
                tokio::select! {
                    _ = interval.tick() => {
                        let health = tracker.get_health(&kernel);
                        match serde_json::to_string(&health) {
                            Ok(payload) => {
                                if let Err(e) = client.publish(HEALTH_TOPIC, QoS::AtLeastOnce, false, payload).await {
                                    warn!("[health] failed to publish: {:?}", e);
                                } else {
                                    debug!(
                                        "[health] published (uptime: {}s, active devices: {})",
                                        health.uptime_seconds, health.devices_active
                                    );
                                }
                            }
                            Err(e) => warn!("[health] cannot serialize health: {}", e),
                        }
                    },
                    event = eventloop.poll() => {
                        match event {
                            Ok(_) => tracker.set_mqtt_status("connected"),
                            Err(e) => {
                                warn!("[health] MQTT error: {:?}", e);
                                tracker.increment_reconnects();
                                tokio::time::sleep(Duration::from_secs(2)).await;
                            }
                        }
                    }
                }
            }
        })
    }
}

impl Default for HealthTracker {
    fn default() -> Self {
        Self::new()
    }
}

fn get_memory_usage_mb() -> f32 {
    #[cfg(target_os = "linux")]
    {
        if let Ok(status) = std::fs::read_to_string("/proc/self/status") {
            let rss_kb = status
                .lines()
                .find(|line| line.starts_with("VmRSS:"))
                .and_then(|line| line.split_whitespace().nth(1))
                .and_then(|kb| kb.parse::<u64>().ok());
            if let Some(kb) = rss_kb {
                return kb as f32 / 1024.0;
            }
        }
    }
    0.0
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::KernelConfig;
    use crate::models::Dscp;
    use crate::slices::SlicePolicy;

    #[test]
    fn test_health_reflects_kernel_state() {
        let kernel = Kernel::new(KernelConfig::default());
        kernel
            .slices
            .create_slice(SlicePolicy::new(1000, 5000, 1).admitting([Dscp::new(46).unwrap()]))
            .unwrap();

        let health = kernel.health.get_health(&kernel);
        assert_eq!(health.slices, 1);
        assert_eq!(health.devices_active, 0);
        assert_eq!(health.policy_generation, 1);
        assert_eq!(health.mqtt_status, "disabled");
        assert_eq!(health.control_loop.skipped, 0);
    }
}
