/**
 * DEVICE REGISTRY - Registre des WTP connus et de leurs éléments
 *
 * RÔLE : Enregistrement, cycle de vie et capacités des WTP connectés au contrôleur.
 * Source de vérité des états de connexion consommée par la boucle de contrôle.
 *
 * ARCHITECTURE : Table en mémoire derrière un RwLock + notifications broadcast
 * (ajout, reconnexion, changement de capacités, changement d'état, purge).
 * UTILITÉ : La boucle de contrôle ne planifie que les WTP actifs, l'API
 * d'observabilité liste les WTP sans jamais toucher aux sessions.
 *
 * INVARIANTS :
 * - un DeviceId par adresse WTP, conservé sur reconnexion jusqu'à la purge
 * - les capacités d'une reconnexion remplacent les précédentes (jamais fusionnées)
 * - chaque enregistrement incrémente l'époque de session : un événement portant
 *   une époque périmée (ancienne session) est ignoré
 */

use crate::models::{ConnectionState, DeviceId, Element, ElementKind, WtpAddr, FULL_SHARE};
use crate::telemetry::SharedTelemetryCache;
use parking_lot::RwLock;
use serde::Serialize;
use std::collections::{BTreeSet, HashMap};
use std::sync::Arc;
use std::time::Duration;
use time::OffsetDateTime;
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{debug, info};

#[derive(Debug, Clone, Serialize)]
pub struct Device {
    pub id: DeviceId,
    pub addr: WtpAddr,
    pub elements: Vec<Element>,
    pub state: ConnectionState,
    /// Capacité utilisable annoncée par le WTP (points de base)
    pub capacity: u32,
    pub epoch: u64,
    #[serde(with = "time::serde::rfc3339")]
    pub last_seen: OffsetDateTime,
    #[serde(with = "time::serde::rfc3339")]
    pub registered_at: OffsetDateTime,
    #[serde(skip)]
    seen_at: Instant,
    #[serde(skip)]
    disconnected_at: Option<Instant>,
}

impl Device {
    pub fn supports(&self, kind: ElementKind) -> bool {
        self.elements.iter().any(|e| e.kind == kind)
    }

    pub fn is_active(&self) -> bool {
        self.state == ConnectionState::Active
    }

    /// Temps écoulé depuis le dernier trafic reçu
    pub fn idle_for(&self) -> Duration {
        self.seen_at.elapsed()
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RegistryEvent {
    Added(DeviceId),
    Reconnected(DeviceId),
    CapabilitiesChanged(DeviceId),
    StateChanged(DeviceId, ConnectionState),
    Removed(DeviceId),
}

impl RegistryEvent {
    pub fn device(&self) -> DeviceId {
        match self {
            RegistryEvent::Added(id)
            | RegistryEvent::Reconnected(id)
            | RegistryEvent::CapabilitiesChanged(id)
            | RegistryEvent::StateChanged(id, _)
            | RegistryEvent::Removed(id) => *id,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Registration {
    pub id: DeviceId,
    pub epoch: u64,
}

#[derive(Default)]
struct RegistryState {
    devices: HashMap<DeviceId, Device>,
    by_addr: HashMap<WtpAddr, DeviceId>,
    next_id: u32,
    next_epoch: u64,
}

pub struct DeviceRegistry {
    inner: RwLock<RegistryState>,
    events: broadcast::Sender<RegistryEvent>,
}

pub type SharedDeviceRegistry = Arc<DeviceRegistry>;

const EVENT_BUFFER: usize = 1024;

impl DeviceRegistry {
    pub fn new() -> Self {
        let (events, _) = broadcast::channel(EVENT_BUFFER);
        Self {
            inner: RwLock::new(RegistryState { next_id: 1, next_epoch: 1, ..Default::default() }),
            events,
        }
    }

    /// Abonnement aux changements du registre (moteur de slicing, API)
    pub fn subscribe(&self) -> broadcast::Receiver<RegistryEvent> {
        self.events.subscribe()
    }

    /// Enregistre un WTP à la fin de son handshake.
    /// Idempotent par adresse : une reconnexion remplace l'entrée et garde le DeviceId.
    pub fn register(&self, addr: WtpAddr, elements: Vec<Element>, capacity: Option<u32>) -> Registration {
        let now = OffsetDateTime::now_utc();
        let mut events = Vec::new();

        let registration = {
            let mut guard = self.inner.write();
            let state = &mut *guard;
            let epoch = state.next_epoch;
            state.next_epoch += 1;

            let known = state.by_addr.get(&addr).copied();
            match known.and_then(|id| state.devices.get_mut(&id)) {
                Some(device) => {
                    let id = device.id;
                    if device.elements != elements {
                        events.push(RegistryEvent::CapabilitiesChanged(id));
                    }
                    device.elements = elements;
                    device.capacity = clamp_capacity(capacity);
                    device.state = ConnectionState::Handshaking;
                    device.epoch = epoch;
                    device.last_seen = now;
                    device.seen_at = Instant::now();
                    device.disconnected_at = None;
                    events.insert(0, RegistryEvent::Reconnected(id));
                    Registration { id, epoch }
                }
                None => {
                    let id = DeviceId(state.next_id);
                    state.next_id += 1;
                    state.devices.insert(
                        id,
                        Device {
                            id,
                            addr,
                            elements,
                            state: ConnectionState::Handshaking,
                            capacity: clamp_capacity(capacity),
                            epoch,
                            last_seen: now,
                            registered_at: now,
                            seen_at: Instant::now(),
                            disconnected_at: None,
                        },
                    );
                    state.by_addr.insert(addr, id);
                    events.push(RegistryEvent::Added(id));
                    Registration { id, epoch }
                }
            }
        };

        info!("[registry] registered {} ({}) epoch {}", registration.id, addr, registration.epoch);
        self.emit(events);
        registration
    }

    /// Change l'état d'un WTP si l'époque correspond toujours à la session courante
    pub fn set_state(&self, id: DeviceId, epoch: u64, new_state: ConnectionState) -> bool {
        let changed = {
            let mut state = self.inner.write();
            match state.devices.get_mut(&id) {
                Some(device) if device.epoch == epoch && device.state != new_state => {
                    device.state = new_state;
                    device.disconnected_at =
                        (new_state == ConnectionState::Disconnected).then(Instant::now);
                    true
                }
                _ => false,
            }
        };
        if changed {
            debug!("[registry] {} -> {}", id, new_state);
            self.emit(vec![RegistryEvent::StateChanged(id, new_state)]);
        }
        changed
    }

    pub fn activate(&self, id: DeviceId, epoch: u64) -> bool {
        self.set_state(id, epoch, ConnectionState::Active)
    }

    pub fn mark_disconnected(&self, id: DeviceId, epoch: u64) -> bool {
        let changed = self.set_state(id, epoch, ConnectionState::Disconnected);
        if changed {
            info!("[registry] marked {} as disconnected", id);
        }
        changed
    }

    /// Met à jour last_seen (et la capacité si annoncée) sur trafic entrant
    pub fn touch(&self, id: DeviceId, epoch: u64, capacity: Option<u32>) {
        let mut state = self.inner.write();
        if let Some(device) = state.devices.get_mut(&id) {
            if device.epoch != epoch {
                return;
            }
            device.last_seen = OffsetDateTime::now_utc();
            device.seen_at = Instant::now();
            if let Some(cap) = capacity {
                device.capacity = clamp_capacity(Some(cap));
            }
        }
    }

    pub fn lookup(&self, id: DeviceId) -> Option<Device> {
        self.inner.read().devices.get(&id).cloned()
    }

    pub fn lookup_addr(&self, addr: &WtpAddr) -> Option<Device> {
        let state = self.inner.read();
        state.by_addr.get(addr).and_then(|id| state.devices.get(id)).cloned()
    }

    pub fn list_active(&self) -> BTreeSet<DeviceId> {
        self.inner
            .read()
            .devices
            .values()
            .filter(|d| d.is_active())
            .map(|d| d.id)
            .collect()
    }

    /// Copie cohérente des WTP actifs, triée par DeviceId
    pub fn active_devices(&self) -> Vec<Device> {
        let mut out: Vec<Device> =
            self.inner.read().devices.values().filter(|d| d.is_active()).cloned().collect();
        out.sort_by_key(|d| d.id);
        out
    }

    pub fn list_devices(&self) -> Vec<Device> {
        let mut out: Vec<Device> = self.inner.read().devices.values().cloned().collect();
        out.sort_by_key(|d| d.id);
        out
    }

    pub fn supports(&self, id: DeviceId, kind: ElementKind) -> bool {
        self.inner.read().devices.get(&id).map(|d| d.supports(kind)).unwrap_or(false)
    }

    pub fn len(&self) -> usize {
        self.inner.read().devices.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Supprime les WTP déconnectés depuis plus de `grace`
    pub fn purge_disconnected(&self, grace: Duration) -> Vec<DeviceId> {
        let removed: Vec<DeviceId> = {
            let mut state = self.inner.write();
            let expired: Vec<(DeviceId, WtpAddr)> = state
                .devices
                .values()
                .filter(|d| {
                    d.state == ConnectionState::Disconnected
                        && d.disconnected_at.map(|t| t.elapsed() >= grace).unwrap_or(false)
                })
                .map(|d| (d.id, d.addr))
                .collect();
            for (id, addr) in &expired {
                state.devices.remove(id);
                state.by_addr.remove(addr);
            }
            expired.into_iter().map(|(id, _)| id).collect()
        };

        if !removed.is_empty() {
            info!("[registry] purged {} stale device(s)", removed.len());
            self.emit(removed.iter().map(|id| RegistryEvent::Removed(*id)).collect());
        }
        removed
    }

    /// Balayage périodique : purge des WTP disparus et oubli de leur télémétrie
    pub fn start_purge_monitor(
        registry: SharedDeviceRegistry,
        telemetry: SharedTelemetryCache,
        grace: Duration,
        sweep: Duration,
    ) -> JoinHandle<()> {
        info!("[registry] starting purge monitor (grace: {}s)", grace.as_secs());

        tokio::spawn(async move {
            let mut interval = tokio::time::interval(sweep);
            loop {
                interval.tick().await;
                for id in registry.purge_disconnected(grace) {
                    let forgotten = telemetry.forget_device(id);
                    debug!("[registry] dropped {} telemetry slot(s) of {}", forgotten, id);
                }
            }
        })
    }

    fn emit(&self, events: Vec<RegistryEvent>) {
        for event in events {
            // aucun abonné n'est pas une erreur
            let _ = self.events.send(event);
        }
    }
}

impl Default for DeviceRegistry {
    fn default() -> Self {
        Self::new()
    }
}

fn clamp_capacity(capacity: Option<u32>) -> u32 {
    capacity.unwrap_or(FULL_SHARE).min(FULL_SHARE)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn addr(last: u8) -> WtpAddr {
        WtpAddr([0, 0x0d, 0xb9, 0, 0, last])
    }

    fn elements(kinds: &[ElementKind]) -> Vec<Element> {
        kinds.iter().map(|k| Element::new(*k, 1)).collect()
    }

    #[test]
    fn test_register_is_idempotent_and_replaces_capabilities() {
        let registry = DeviceRegistry::new();
        let first = registry.register(addr(1), elements(&[ElementKind::DscpStats, ElementKind::TrafficRules]), None);
        assert!(registry.activate(first.id, first.epoch));

        let second = registry.register(addr(1), elements(&[ElementKind::SliceQuantum]), Some(8000));
        assert_eq!(first.id, second.id);
        assert!(second.epoch > first.epoch);

        let device = registry.lookup(first.id).unwrap();
        assert_eq!(device.elements, elements(&[ElementKind::SliceQuantum]));
        assert!(!device.supports(ElementKind::DscpStats));
        assert_eq!(device.state, ConnectionState::Handshaking);
        assert_eq!(device.capacity, 8000);
        assert_eq!(registry.len(), 1);
    }

    #[test]
    fn test_stale_epoch_cannot_disconnect_new_session() {
        let registry = DeviceRegistry::new();
        let old = registry.register(addr(2), vec![], None);
        registry.activate(old.id, old.epoch);
        let new = registry.register(addr(2), vec![], None);
        registry.activate(new.id, new.epoch);

        assert!(!registry.mark_disconnected(old.id, old.epoch));
        assert_eq!(registry.list_active(), BTreeSet::from([new.id]));
        assert!(registry.mark_disconnected(new.id, new.epoch));
        assert!(registry.list_active().is_empty());
    }

    #[test]
    fn test_events_are_emitted() {
        let registry = DeviceRegistry::new();
        let mut rx = registry.subscribe();
        let r = registry.register(addr(3), vec![], None);
        registry.activate(r.id, r.epoch);
        registry.register(addr(3), elements(&[ElementKind::DscpStats]), None);

        assert_eq!(rx.try_recv().unwrap(), RegistryEvent::Added(r.id));
        assert_eq!(rx.try_recv().unwrap(), RegistryEvent::StateChanged(r.id, ConnectionState::Active));
        assert_eq!(rx.try_recv().unwrap(), RegistryEvent::Reconnected(r.id));
        assert_eq!(rx.try_recv().unwrap(), RegistryEvent::CapabilitiesChanged(r.id));
    }

    #[tokio::test(start_paused = true)]
    async fn test_purge_after_grace_only() {
        let registry = DeviceRegistry::new();
        let r = registry.register(addr(4), vec![], None);
        registry.activate(r.id, r.epoch);
        registry.mark_disconnected(r.id, r.epoch);

        assert!(registry.purge_disconnected(Duration::from_secs(60)).is_empty());
        tokio::time::advance(Duration::from_secs(61)).await;
        assert_eq!(registry.purge_disconnected(Duration::from_secs(60)), vec![r.id]);
        assert!(registry.lookup(r.id).is_none());

        // nouvelle identité après purge
        let again = registry.register(addr(4), vec![], None);
        assert_ne!(again.id, r.id);
    }

    #[test]
    fn test_active_devices_never_includes_disconnected() {
        let registry = DeviceRegistry::new();
        let a = registry.register(addr(5), vec![], None);
        let b = registry.register(addr(6), vec![], None);
        registry.activate(a.id, a.epoch);
        registry.activate(b.id, b.epoch);
        registry.mark_disconnected(b.id, b.epoch);

        let active: Vec<DeviceId> = registry.active_devices().iter().map(|d| d.id).collect();
        assert_eq!(active, vec![a.id]);
    }
}
