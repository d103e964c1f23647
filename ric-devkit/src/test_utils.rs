/*!
Test Harness pour le contrôleur RIC

Facilite l'écriture de tests de bout en bout avec:
- Un `Kernel` complet aux timeouts courts
- Des agents simulés branchés sur le vrai worker de session (flux mémoire)
- Des ticks de contrôle déclenchés à la main
*/

use crate::builders::WireMessageBuilder;
use crate::mock_agent::MockAgent;
use anyhow::{bail, Result};
use ric_kernel::config::KernelConfig;
use ric_kernel::models::{ConnectionState, DeviceId, Element, WtpAddr};
use ric_kernel::scheduler::TickSummary;
use ric_kernel::server;
use ric_kernel::Kernel;
use std::time::Duration;

const DUPLEX_BUFFER: usize = 64 * 1024;

/// Harness de test complet pour le contrôleur
pub struct TestHarness {
    pub kernel: Kernel,
}

impl TestHarness {
    /// Contrôleur par défaut, timeouts réduits pour les tests
    pub fn new() -> Self {
        Self::with_config(Self::test_config())
    }

    pub fn with_config(config: KernelConfig) -> Self {
        env_logger::try_init().ok();
        Self { kernel: Kernel::new(config) }
    }

    pub fn test_config() -> KernelConfig {
        let mut config = KernelConfig::default();
        config.session.handshake_timeout_ms = 1_000;
        config.session.liveness_timeout_ms = 2_000;
        config.telemetry.freshness_ms = 3_000;
        config
    }

    /// Ouvre une session sans handshake (pour les tests de protocole)
    pub fn open_transport(&self) -> MockAgent {
        let (client, server_side) = tokio::io::duplex(DUPLEX_BUFFER);
        tokio::spawn(server::serve_connection(server_side, self.kernel.clone()));
        MockAgent::new(client)
    }

    /// Agent avec les trois éléments, handshake fait, session attachée
    pub async fn connect_agent(&self, n: u8) -> Result<MockAgent> {
        self.connect_agent_with(WireMessageBuilder::addr(n), WireMessageBuilder::full_elements()).await
    }

    pub async fn connect_agent_with(&self, addr: WtpAddr, elements: Vec<Element>) -> Result<MockAgent> {
        let mut agent = self.open_transport();
        let id = agent.hello(addr, elements, None).await?;

        // le HelloAck part avant l'activation et l'attache au dispatcher
        let kernel = self.kernel.clone();
        let ready = self
            .wait_until(Duration::from_secs(2), move || {
                kernel.dispatcher.session(id).is_some()
                    && kernel.registry.lookup(id).map(|d| d.state) == Some(ConnectionState::Active)
            })
            .await;
        if !ready {
            bail!("{} never became active", id);
        }
        log::info!("✅ [HARNESS] agent {} connected as {}", addr, id);
        Ok(agent)
    }

    /// Tick immédiat de la boucle de contrôle
    pub fn tick(&self) -> TickSummary {
        self.kernel.control.try_tick().unwrap_or_default()
    }

    /// Attend que la télémétrie de `class` soit fraîche pour `device`
    pub async fn wait_for_telemetry(&self, device: DeviceId, class: u8) -> bool {
        let kernel = self.kernel.clone();
        let Some(class) = ric_kernel::models::Dscp::new(class) else {
            return false;
        };
        self.wait_until(Duration::from_secs(2), move || kernel.telemetry.read(device, class).is_fresh())
            .await
    }

    pub async fn wait_for_state(&self, device: DeviceId, state: ConnectionState, within: Duration) -> bool {
        let kernel = self.kernel.clone();
        self.wait_until(within, move || kernel.registry.lookup(device).map(|d| d.state) == Some(state))
            .await
    }

    /// Évalue `predicate` toutes les 10ms jusqu'à `within`
    pub async fn wait_until<F>(&self, within: Duration, predicate: F) -> bool
    where
        F: Fn() -> bool,
    {
        let deadline = tokio::time::Instant::now() + within;
        loop {
            if predicate() {
                return true;
            }
            if tokio::time::Instant::now() >= deadline {
                log::warn!("⏰ [HARNESS] condition not met within {:?}", within);
                return false;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    }
}

impl Default for TestHarness {
    fn default() -> Self {
        Self::new()
    }
}
