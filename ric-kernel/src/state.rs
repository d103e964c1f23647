/**
 * KERNEL STATE - Assemblage des stores partagés du contrôleur
 *
 * RÔLE : Construit registre, télémétrie, table de slices, dispatcher et boucle
 * de contrôle à partir de la configuration ; clonable vers chaque tâche
 * (serveur de contrôle, API d'observabilité, publication health).
 */

use crate::autoslice::AutoSlicer;
use crate::config::KernelConfig;
use crate::dispatcher::{Dispatcher, SharedDispatcher};
use crate::health::HealthTracker;
use crate::registry::{DeviceRegistry, SharedDeviceRegistry};
use crate::scheduler::{ControlLoop, SharedControlLoop};
use crate::slices::{PolicyError, SharedSliceTable, SliceTable, TrafficRule};
use crate::telemetry::{SharedTelemetryCache, TelemetryCache};
use std::sync::Arc;
use tracing::info;

#[derive(Clone)]
pub struct Kernel {
    pub config: Arc<KernelConfig>,
    pub registry: SharedDeviceRegistry,
    pub telemetry: SharedTelemetryCache,
    pub slices: SharedSliceTable,
    pub dispatcher: SharedDispatcher,
    pub control: SharedControlLoop,
    pub health: HealthTracker,
}

impl Kernel {
    pub fn new(config: KernelConfig) -> Self {
        let registry: SharedDeviceRegistry = Arc::new(DeviceRegistry::new());
        let telemetry: SharedTelemetryCache = Arc::new(TelemetryCache::new(config.freshness()));
        let slices: SharedSliceTable = Arc::new(SliceTable::new());
        let dispatcher: SharedDispatcher = Arc::new(Dispatcher::new(registry.clone(), telemetry.clone()));
        let auto = config.auto_slicing.enabled.then(|| AutoSlicer::new(config.auto_slicing.clone()));
        let control: SharedControlLoop = Arc::new(ControlLoop::new(
            registry.clone(),
            telemetry.clone(),
            slices.clone(),
            dispatcher.clone(),
            auto,
        ));

        Self {
            config: Arc::new(config),
            registry,
            telemetry,
            slices,
            dispatcher,
            control,
            health: HealthTracker::new(),
        }
    }

    /// Applique la section `policy` de la configuration ; s'arrête à la première erreur
    pub fn apply_bootstrap_policy(&self) -> Result<(), PolicyError> {
        let policy = &self.config.policy;
        for slice in &policy.slices {
            self.slices.create_slice_with_id(slice.id, slice.policy.clone())?;
        }
        for rule in &policy.rules {
            self.slices.add_rule(TrafficRule { scope: rule.scope, dscp: rule.dscp, slice: rule.slice })?;
        }
        if !policy.slices.is_empty() || !policy.rules.is_empty() {
            info!(
                "[kernel] bootstrap policy: {} slice(s), {} rule(s)",
                policy.slices.len(),
                policy.rules.len()
            );
        }
        Ok(())
    }
}
