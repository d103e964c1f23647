use crate::autoslice::AutoSlicingConfig;
use crate::models::{Dscp, SliceId};
use crate::session::SessionConfig;
use crate::slices::{RuleScope, SlicePolicy};
use serde::{Deserialize, Serialize};
use std::net::SocketAddr;
use std::path::Path;
use std::time::Duration;
use tokio::fs;
use tracing::warn;

#[derive(Debug, Serialize, Deserialize, Clone, Default)]
#[serde(default)]
pub struct KernelConfig {
    pub control: ControlConf,
    pub session: SessionConf,
    pub registry: RegistryConf,
    pub telemetry: TelemetryConf,
    pub scheduler: SchedulerConf,
    pub http: Option<HttpConf>,
    pub mqtt: Option<MqttConf>,
    pub auto_slicing: AutoSlicingConfig,
    pub policy: PolicyConf,
}

#[derive(Debug, Serialize, Deserialize, Clone)]
#[serde(default)]
pub struct ControlConf {
    pub listen: SocketAddr,
    pub max_frame_bytes: usize,
}

impl Default for ControlConf {
    fn default() -> Self {
        Self { listen: SocketAddr::from(([0, 0, 0, 0], 4433)), max_frame_bytes: crate::wire::DEFAULT_MAX_FRAME }
    }
}

#[derive(Debug, Serialize, Deserialize, Clone)]
#[serde(default)]
pub struct SessionConf {
    pub handshake_timeout_ms: u64,
    pub liveness_timeout_ms: u64,
    /// Violations de protocole tolérées avant fermeture de la session
    pub violation_threshold: u32,
    pub outbound_queue: usize,
}

impl Default for SessionConf {
    fn default() -> Self {
        Self { handshake_timeout_ms: 5_000, liveness_timeout_ms: 10_000, violation_threshold: 16, outbound_queue: 256 }
    }
}

#[derive(Debug, Serialize, Deserialize, Clone)]
#[serde(default)]
pub struct RegistryConf {
    pub purge_grace_secs: u64,
    pub sweep_secs: u64,
}

impl Default for RegistryConf {
    fn default() -> Self {
        Self { purge_grace_secs: 300, sweep_secs: 30 }
    }
}

#[derive(Debug, Serialize, Deserialize, Clone)]
#[serde(default)]
pub struct TelemetryConf {
    pub freshness_ms: u64,
}

impl Default for TelemetryConf {
    fn default() -> Self {
        Self { freshness_ms: 3_000 }
    }
}

#[derive(Debug, Serialize, Deserialize, Clone)]
#[serde(default)]
pub struct SchedulerConf {
    pub tick_ms: u64,
}

impl Default for SchedulerConf {
    fn default() -> Self {
        Self { tick_ms: 1_000 }
    }
}

#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct HttpConf {
    pub listen: SocketAddr,
}

#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct MqttConf {
    pub host: String,
    pub port: u16,
}

/// Slices et règles posés au démarrage via l'interface de politique
#[derive(Debug, Serialize, Deserialize, Clone, Default)]
#[serde(default)]
pub struct PolicyConf {
    pub slices: Vec<SliceConf>,
    pub rules: Vec<RuleConf>,
}

#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct SliceConf {
    pub id: SliceId,
    #[serde(flatten)]
    pub policy: SlicePolicy,
}

#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct RuleConf {
    /// `wildcard` ou `{device: "aa:bb:cc:dd:ee:ff"}`
    #[serde(default = "wildcard", with = "serde_yaml::with::singleton_map")]
    pub scope: RuleScope,
    pub dscp: Dscp,
    pub slice: SliceId,
}

fn wildcard() -> RuleScope {
    RuleScope::Wildcard
}

impl KernelConfig {
    pub fn session_config(&self) -> SessionConfig {
        SessionConfig {
            handshake_timeout: Duration::from_millis(self.session.handshake_timeout_ms),
            liveness_timeout: Duration::from_millis(self.session.liveness_timeout_ms),
            max_frame: self.control.max_frame_bytes,
            queue_depth: self.session.outbound_queue,
        }
    }

    pub fn tick_period(&self) -> Duration {
        Duration::from_millis(self.scheduler.tick_ms.max(1))
    }

    pub fn freshness(&self) -> Duration {
        Duration::from_millis(self.telemetry.freshness_ms)
    }

    pub fn purge_grace(&self) -> Duration {
        Duration::from_secs(self.registry.purge_grace_secs)
    }

    pub fn sweep_period(&self) -> Duration {
        Duration::from_secs(self.registry.sweep_secs.max(1))
    }
}

pub fn parse_config(txt: &str) -> Result<KernelConfig, serde_yaml::Error> {
    if txt.trim().is_empty() {
        return Ok(KernelConfig::default());
    }
    serde_yaml::from_str(txt)
}

pub async fn load_config() -> KernelConfig {
    let path = std::env::var("RIC_KERNEL_CONFIG").unwrap_or_else(|_| "kernel.yaml".into());
    if Path::new(&path).exists() {
        let txt = fs::read_to_string(&path).await.unwrap_or_default();
        parse_config(&txt).unwrap_or_else(|e| {
            warn!("[kernel] invalid config {}: {}", path, e);
            KernelConfig::default()
        })
    } else {
        warn!("[kernel] no {}, using default config", path);
        KernelConfig::default()
    }
}
