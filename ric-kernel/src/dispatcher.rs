/**
 * DISPATCHER - Routage des messages entre sessions et stores
 *
 * RÔLE :
 * Entrant : route chaque message d'agent par type vers la télémétrie ou le
 * registre. Sortant : livre les commandes d'enforcement à la session du WTP
 * visé, sans attendre d'acquittement.
 *
 * FONCTIONNEMENT :
 * - une session par DeviceId ; une nouvelle session du même WTP remplace
 *   l'ancienne (fermée) et le détachement est gardé par l'époque
 * - commande vers un WTP déconnecté ou sans l'élément requis : écartée et comptée
 * - file sortante pleine : échec signalé au tick (plan du WTP oublié)
 */

use crate::models::{DeviceId, ElementKind};
use crate::registry::SharedDeviceRegistry;
use crate::session::{SendError, SessionHandle};
use crate::telemetry::{SharedTelemetryCache, TelemetrySample};
use crate::wire::{AgentMessage, ControllerMessage, EnforcementCommand, WireError};
use parking_lot::RwLock;
use serde::Serialize;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tracing::{debug, info};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Delivery {
    Delivered,
    DroppedDisconnected,
    DroppedUnsupported,
    Failed,
}

/// Suite à donner à la session après un message entrant
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Flow {
    Continue,
    Close,
}

#[derive(Debug, Default)]
struct Counters {
    commands_delivered: AtomicU64,
    commands_dropped: AtomicU64,
    delivery_failures: AtomicU64,
    stats_requests: AtomicU64,
    telemetry_samples: AtomicU64,
    protocol_violations: AtomicU64,
}

#[derive(Debug, Clone, Copy, Default, Serialize)]
pub struct DispatchStats {
    pub commands_delivered: u64,
    pub commands_dropped: u64,
    pub delivery_failures: u64,
    pub stats_requests: u64,
    pub telemetry_samples: u64,
    pub protocol_violations: u64,
}

pub struct Dispatcher {
    sessions: RwLock<HashMap<DeviceId, SessionHandle>>,
    registry: SharedDeviceRegistry,
    telemetry: SharedTelemetryCache,
    counters: Counters,
}

pub type SharedDispatcher = Arc<Dispatcher>;

impl Dispatcher {
    pub fn new(registry: SharedDeviceRegistry, telemetry: SharedTelemetryCache) -> Self {
        Self { sessions: RwLock::new(HashMap::new()), registry, telemetry, counters: Counters::default() }
    }

    pub fn attach(&self, session: SessionHandle) {
        let previous = self.sessions.write().insert(session.device_id(), session.clone());
        if let Some(old) = previous.filter(|old| old.epoch() != session.epoch()) {
            info!("[dispatch] {} reconnected, closing superseded session", session.device_id());
            old.close(Some("superseded by a new session".into()));
        }
    }

    /// Détache la session si elle est toujours la session courante du WTP
    pub fn detach(&self, device: DeviceId, epoch: u64) -> bool {
        let mut sessions = self.sessions.write();
        match sessions.get(&device) {
            Some(current) if current.epoch() == epoch => {
                sessions.remove(&device);
                true
            }
            _ => false,
        }
    }

    pub fn session(&self, device: DeviceId) -> Option<SessionHandle> {
        self.sessions.read().get(&device).cloned()
    }

    pub fn session_count(&self) -> usize {
        self.sessions.read().len()
    }

    /// Route un message déjà admis par la FSM de la session
    pub fn handle_inbound(&self, session: &SessionHandle, message: AgentMessage) -> Result<Flow, WireError> {
        let device = session.device_id();
        match message {
            AgentMessage::Heartbeat { capacity } => {
                if capacity.is_some() {
                    self.registry.touch(device, session.epoch(), capacity);
                }
                if let Err(e) = session.send(ControllerMessage::Heartbeat) {
                    debug!("[dispatch] heartbeat reply to {} not sent: {}", device, e);
                }
                Ok(Flow::Continue)
            }
            AgentMessage::TelemetryReport { window_ms, entries } => {
                if !self.registry.supports(device, ElementKind::DscpStats) {
                    return Err(WireError::OutOfOrder("telemetry_report"));
                }
                for entry in &entries {
                    self.telemetry.record(
                        device,
                        entry.code,
                        TelemetrySample {
                            bytes: entry.bytes,
                            packets: entry.packets,
                            avg_packet_size: entry.avg_packet_size,
                            window_ms,
                        },
                    );
                }
                self.counters.telemetry_samples.fetch_add(entries.len() as u64, Ordering::Relaxed);
                debug!("[dispatch] {} telemetry entries from {}", entries.len(), device);
                Ok(Flow::Continue)
            }
            AgentMessage::SessionClose { reason } => {
                info!("[dispatch] {} closed its session ({})", device, reason.as_deref().unwrap_or("no reason"));
                Ok(Flow::Close)
            }
            AgentMessage::Hello { .. } => Err(WireError::OutOfOrder("hello")),
        }
    }

    pub fn record_violation(&self) {
        self.counters.protocol_violations.fetch_add(1, Ordering::Relaxed);
    }

    pub fn deliver(&self, device: DeviceId, command: EnforcementCommand) -> Delivery {
        let delivery = self.route(device, command.required_element(), ControllerMessage::Enforcement { command });
        let counter = match delivery {
            Delivery::Delivered => &self.counters.commands_delivered,
            Delivery::DroppedDisconnected | Delivery::DroppedUnsupported => &self.counters.commands_dropped,
            Delivery::Failed => &self.counters.delivery_failures,
        };
        counter.fetch_add(1, Ordering::Relaxed);
        delivery
    }

    pub fn request_stats(&self, device: DeviceId) -> Delivery {
        let delivery = self.route(device, ElementKind::DscpStats, ControllerMessage::DscpStatsRequest);
        if delivery == Delivery::Delivered {
            self.counters.stats_requests.fetch_add(1, Ordering::Relaxed);
        }
        delivery
    }

    fn route(&self, device: DeviceId, element: ElementKind, message: ControllerMessage) -> Delivery {
        let Some(session) = self.session(device) else {
            debug!("[dispatch] dropping {} for {}: no session", message.kind(), device);
            return Delivery::DroppedDisconnected;
        };
        if !self.registry.supports(device, element) {
            debug!("[dispatch] dropping {} for {}: {:?} not advertised", message.kind(), device, element);
            return Delivery::DroppedUnsupported;
        }
        match session.send(message) {
            Ok(()) => Delivery::Delivered,
            Err(SendError::QueueFull) => Delivery::Failed,
            Err(e) => {
                debug!("[dispatch] dropping command for {}: {}", device, e);
                Delivery::DroppedDisconnected
            }
        }
    }

    pub fn stats(&self) -> DispatchStats {
        let c = &self.counters;
        DispatchStats {
            commands_delivered: c.commands_delivered.load(Ordering::Relaxed),
            commands_dropped: c.commands_dropped.load(Ordering::Relaxed),
            delivery_failures: c.delivery_failures.load(Ordering::Relaxed),
            stats_requests: c.stats_requests.load(Ordering::Relaxed),
            telemetry_samples: c.telemetry_samples.load(Ordering::Relaxed),
            protocol_violations: c.protocol_violations.load(Ordering::Relaxed),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{Dscp, Element, SliceId, WtpAddr};
    use crate::registry::DeviceRegistry;
    use crate::session::{connect, SessionConfig};
    use crate::telemetry::TelemetryCache;
    use crate::wire::{read_frame, write_frame, DscpMapEntry, Envelope};
    use std::time::Duration;

    async fn session_with(
        registry: &SharedDeviceRegistry,
        kinds: &[ElementKind],
    ) -> (SessionHandle, tokio::io::DuplexStream) {
        let (mut agent, controller) = tokio::io::duplex(16 * 1024);
        let hello = AgentMessage::Hello {
            addr: WtpAddr([0, 1, 2, 3, 4, 5]),
            elements: kinds.iter().map(|k| Element::new(*k, 1)).collect(),
            capacity: None,
        };
        write_frame(&mut agent, &Envelope::new(1, hello)).await.unwrap();
        let (session, _inbound) = connect(controller, registry.clone(), &SessionConfig::default()).await.unwrap();
        let _ack: Envelope<ControllerMessage> = read_frame(&mut agent, 16 * 1024).await.unwrap();
        (session, agent)
    }

    fn dispatcher() -> (Dispatcher, SharedDeviceRegistry, SharedTelemetryCache) {
        let registry = Arc::new(DeviceRegistry::new());
        let telemetry = Arc::new(TelemetryCache::new(Duration::from_secs(3)));
        (Dispatcher::new(registry.clone(), telemetry.clone()), registry, telemetry)
    }

    #[tokio::test]
    async fn test_telemetry_is_recorded_only_with_dscp_stats() {
        let (dispatcher, registry, telemetry) = dispatcher();
        let (session, _agent) = session_with(&registry, &[ElementKind::DscpStats]).await;
        let report = AgentMessage::TelemetryReport {
            window_ms: 1000,
            entries: vec![DscpMapEntry { code: Dscp::new(46).unwrap(), packets: 10, bytes: 1200, avg_packet_size: 120 }],
        };
        assert_eq!(dispatcher.handle_inbound(&session, report.clone()).unwrap(), Flow::Continue);
        assert!(telemetry.read(session.device_id(), Dscp::new(46).unwrap()).is_fresh());

        let (dispatcher, registry, _) = self::dispatcher();
        let (session, _agent) = session_with(&registry, &[ElementKind::TrafficRules]).await;
        assert!(dispatcher.handle_inbound(&session, report).is_err());
    }

    #[tokio::test]
    async fn test_deliver_checks_session_and_elements() {
        let (dispatcher, registry, _) = dispatcher();
        let (session, mut agent) = session_with(&registry, &[ElementKind::SliceQuantum]).await;
        let device = session.device_id();
        let set_share = EnforcementCommand::SetShare { slice: SliceId(1), share: 5000 };
        let rule = EnforcementCommand::RemoveRule { dscp: Dscp::BEST_EFFORT };

        assert_eq!(dispatcher.deliver(device, set_share), Delivery::DroppedDisconnected);
        dispatcher.attach(session.clone());
        assert_eq!(dispatcher.deliver(device, set_share), Delivery::Delivered);
        assert_eq!(dispatcher.deliver(device, rule), Delivery::DroppedUnsupported);

        let got: Envelope<ControllerMessage> = read_frame(&mut agent, 16 * 1024).await.unwrap();
        assert_eq!(got.body, ControllerMessage::Enforcement { command: set_share });

        let stats = dispatcher.stats();
        assert_eq!(stats.commands_delivered, 1);
        assert_eq!(stats.commands_dropped, 2);

        assert!(!dispatcher.detach(device, session.epoch() + 1));
        assert!(dispatcher.detach(device, session.epoch()));
        assert_eq!(dispatcher.session_count(), 0);
    }
}
