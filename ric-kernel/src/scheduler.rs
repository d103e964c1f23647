/**
 * CONTROL LOOP - Boucle de contrôle périodique du contrôleur
 *
 * RÔLE :
 * Cadence les ticks : ingestion des changements du registre, auto-slicing
 * optionnel, calcul du moteur de slicing, diffusion des commandes et des
 * requêtes de statistiques DSCP.
 *
 * FONCTIONNEMENT :
 * - période fixe (1 s par défaut), tâche annulable via un canal watch
 * - non réentrante : un tick dû pendant qu'un autre tourne est sauté
 *   (jamais mis en file) et compté
 * - le tick ne fait que déposer les commandes dans les files des sessions,
 *   aucun acquittement n'est attendu
 */

use crate::autoslice::AutoSlicer;
use crate::dispatcher::{Delivery, SharedDispatcher};
use crate::engine::SlicingEngine;
use crate::models::{Dscp, ElementKind};
use crate::registry::{Device, RegistryEvent, SharedDeviceRegistry};
use crate::slices::SharedSliceTable;
use crate::telemetry::{Reading, SharedTelemetryCache};
use parking_lot::Mutex;
use serde::Serialize;
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::broadcast::{self, error::TryRecvError};
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tracing::{debug, info, warn};

#[derive(Debug, Default)]
struct LoopCounters {
    ticks: AtomicU64,
    skipped: AtomicU64,
    last_tick_us: AtomicU64,
    commands_sent: AtomicU64,
    device_failures: AtomicU64,
}

#[derive(Debug, Clone, Copy, Default, Serialize)]
pub struct LoopStats {
    pub ticks: u64,
    pub skipped: u64,
    pub last_tick_us: u64,
    pub commands_sent: u64,
    pub device_failures: u64,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct TickSummary {
    pub devices_planned: usize,
    pub devices_failed: usize,
    pub commands_sent: usize,
    pub stats_requests: usize,
}

/// Jeton d'exclusion d'un tick : libéré à la destruction
pub struct TickGuard {
    busy: Arc<AtomicBool>,
}

impl Drop for TickGuard {
    fn drop(&mut self) {
        self.busy.store(false, Ordering::Release);
    }
}

pub struct ControlLoop {
    registry: SharedDeviceRegistry,
    telemetry: SharedTelemetryCache,
    slices: SharedSliceTable,
    dispatcher: SharedDispatcher,
    engine: Mutex<SlicingEngine>,
    auto: Option<Mutex<AutoSlicer>>,
    events: Mutex<broadcast::Receiver<RegistryEvent>>,
    busy: Arc<AtomicBool>,
    counters: LoopCounters,
}

pub type SharedControlLoop = Arc<ControlLoop>;

impl ControlLoop {
    pub fn new(
        registry: SharedDeviceRegistry,
        telemetry: SharedTelemetryCache,
        slices: SharedSliceTable,
        dispatcher: SharedDispatcher,
        auto: Option<AutoSlicer>,
    ) -> Self {
        let events = registry.subscribe();
        Self {
            registry,
            telemetry,
            slices,
            dispatcher,
            engine: Mutex::new(SlicingEngine::new()),
            auto: auto.map(Mutex::new),
            events: Mutex::new(events),
            busy: Arc::new(AtomicBool::new(false)),
            counters: LoopCounters::default(),
        }
    }

    pub fn stats(&self) -> LoopStats {
        let c = &self.counters;
        LoopStats {
            ticks: c.ticks.load(Ordering::Relaxed),
            skipped: c.skipped.load(Ordering::Relaxed),
            last_tick_us: c.last_tick_us.load(Ordering::Relaxed),
            commands_sent: c.commands_sent.load(Ordering::Relaxed),
            device_failures: c.device_failures.load(Ordering::Relaxed),
        }
    }

    /// Réserve le tick ; None si un tick est déjà en cours
    pub fn begin_tick(&self) -> Option<TickGuard> {
        self.busy
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .ok()
            .map(|_| TickGuard { busy: self.busy.clone() })
    }

    /// Tick immédiat, sauté (et compté) si un autre tick tourne
    pub fn try_tick(&self) -> Option<TickSummary> {
        match self.begin_tick() {
            Some(guard) => Some(self.execute(guard)),
            None => {
                self.record_skip();
                None
            }
        }
    }

    fn record_skip(&self) {
        let skipped = self.counters.skipped.fetch_add(1, Ordering::Relaxed) + 1;
        warn!("[loop] tick skipped, previous tick still running ({} skipped so far)", skipped);
    }

    pub fn execute(&self, _guard: TickGuard) -> TickSummary {
        let started = Instant::now();
        let mut summary = TickSummary::default();

        self.drain_registry_events();

        let devices = self.registry.active_devices();
        if let Some(auto) = &self.auto {
            let counts = fresh_packet_counts(&self.telemetry, &devices);
            let report = auto.lock().step(&self.slices, &counts);
            if report.errors > 0 {
                debug!("[loop] auto-slicing step had {} error(s)", report.errors);
            }
        }

        let snapshot = self.slices.snapshot();
        let report = self.engine.lock().tick(&devices, &snapshot, &self.telemetry);
        summary.devices_planned = report.planned;
        summary.devices_failed = report.failed.len();

        for (device, commands) in report.commands {
            for command in commands {
                match self.dispatcher.deliver(device, command) {
                    Delivery::Delivered => summary.commands_sent += 1,
                    Delivery::DroppedUnsupported => {}
                    Delivery::DroppedDisconnected | Delivery::Failed => {
                        // état du WTP inconnu : renvoi complet au prochain tick
                        self.engine.lock().forget(device);
                        break;
                    }
                }
            }
        }

        for device in devices.iter().filter(|d| d.supports(ElementKind::DscpStats)) {
            if self.dispatcher.request_stats(device.id) == Delivery::Delivered {
                summary.stats_requests += 1;
            }
        }

        let elapsed = started.elapsed();
        let c = &self.counters;
        c.ticks.fetch_add(1, Ordering::Relaxed);
        c.last_tick_us.store(elapsed.as_micros() as u64, Ordering::Relaxed);
        c.commands_sent.fetch_add(summary.commands_sent as u64, Ordering::Relaxed);
        c.device_failures.fetch_add(summary.devices_failed as u64, Ordering::Relaxed);
        debug!(
            "[loop] tick: {} device(s), {} command(s), {} failure(s) in {:?}",
            summary.devices_planned, summary.commands_sent, summary.devices_failed, elapsed
        );
        summary
    }

    fn drain_registry_events(&self) {
        let mut events = self.events.lock();
        let mut engine = self.engine.lock();
        loop {
            match events.try_recv() {
                Ok(event) => engine.observe(&event),
                Err(TryRecvError::Lagged(missed)) => {
                    warn!("[loop] missed {} registry event(s), resetting enforcement state", missed);
                    engine.reset();
                }
                Err(TryRecvError::Empty) | Err(TryRecvError::Closed) => break,
            }
        }
    }

    /// Démarre la tâche périodique ; chaque tick s'exécute hors du runtime async
    pub fn spawn(control: SharedControlLoop, period: Duration) -> ControlLoopHandle {
        let (stop, mut stopped) = watch::channel(false);
        info!("[loop] starting control loop (period: {}ms)", period.as_millis());

        let task = tokio::spawn(async move {
            let mut interval = tokio::time::interval(period);
            interval.set_missed_tick_behavior(MissedTickBehavior::Skip);
            loop {
                tokio::select! {
                    _ = interval.tick() => {
                        match control.begin_tick() {
                            Some(guard) => {
                                let control = control.clone();
                                tokio::task::spawn_blocking(move || control.execute(guard));
                            }
                            None => control.record_skip(),
                        }
                    }
                    _ = stopped.changed() => {
                        info!("[loop] control loop stopped");
                        break;
                    }
                }
            }
        });
        ControlLoopHandle { stop, task }
    }
}

pub struct ControlLoopHandle {
    stop: watch::Sender<bool>,
    task: JoinHandle<()>,
}

impl ControlLoopHandle {
    pub async fn shutdown(self) {
        let _ = self.stop.send(true);
        let _ = self.task.await;
    }
}

/// Paquets par classe DSCP sur les échantillons frais des WTP donnés
pub fn fresh_packet_counts(telemetry: &SharedTelemetryCache, devices: &[Device]) -> BTreeMap<Dscp, u64> {
    let mut counts = BTreeMap::new();
    for device in devices {
        for (class, reading) in telemetry.readings_for(device.id) {
            if let Reading::Fresh { current, .. } = reading {
                *counts.entry(class).or_insert(0u64) += current.sample.packets;
            }
        }
    }
    counts
}
