/**
 * SLICING ENGINE - Calcul des parts par WTP et diff des commandes
 *
 * RÔLE :
 * À chaque tick, transforme la demande agrégée par slice (télémétrie fraîche)
 * en parts de capacité et règles DSCP → slice pour chaque WTP actif, puis
 * n'émet que les commandes qui diffèrent du plan appliqué au tick précédent.
 *
 * ALLOCATION (points de base) :
 * 1. chaque slice reçoit son minimum
 * 2. le reste est réparti au prorata de la demande fraîche, plafonné au max
 *    (remplissage itératif : l'excédent d'un slice plafonné est redistribué)
 * 3. la capacité encore libre est répartie à parts égales entre les slices
 *    sous leur max (demande inconnue ou nulle comprise)
 * 4. si Σ min dépasse la capacité du WTP : dégradation proportionnelle aux minima
 * Arrondi à l'entier inférieur, puis les points restants sont distribués un par
 * un par priorité décroissante puis identifiant croissant.
 *
 * Une erreur de calcul sur un WTP est isolée : son plan précédent reste en place.
 */

use crate::models::{ConnectionState, DeviceId, Dscp, ElementKind, SliceId};
use crate::registry::{Device, RegistryEvent};
use crate::slices::SliceSnapshot;
use crate::telemetry::{RateError, TelemetryCache};
use crate::wire::EnforcementCommand;
use std::collections::{BTreeMap, BTreeSet, HashMap};
use tracing::{debug, warn};

const EPSILON: f64 = 1e-6;

#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum ComputeError {
    #[error("telemetry for class {class}: {source}")]
    Telemetry {
        class: Dscp,
        #[source]
        source: RateError,
    },
    #[error("allocation of {allocated} bp exceeds capacity {capacity} bp")]
    Overcommitted { allocated: u32, capacity: u32 },
}

/// Entrée de l'allocateur pour un slice présent sur un WTP
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct SliceDemand {
    pub id: SliceId,
    pub min: u32,
    pub max: u32,
    pub priority: u8,
    /// Débit agrégé des classes fraîches (octets/s), None = inconnu
    pub demand: Option<f64>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RulePlan {
    pub slice: SliceId,
    pub tos: Option<u8>,
}

/// État d'enforcement voulu sur un WTP
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DevicePlan {
    pub rules: BTreeMap<Dscp, RulePlan>,
    pub shares: BTreeMap<SliceId, u32>,
}

#[derive(Debug, Default)]
pub struct TickReport {
    pub commands: Vec<(DeviceId, Vec<EnforcementCommand>)>,
    pub planned: usize,
    pub failed: Vec<(DeviceId, ComputeError)>,
}

impl TickReport {
    pub fn command_count(&self) -> usize {
        self.commands.iter().map(|(_, c)| c.len()).sum()
    }
}

/// Répartit `capacity` points de base entre les slices
pub fn allocate(slices: &[SliceDemand], capacity: u32) -> BTreeMap<SliceId, u32> {
    if slices.is_empty() {
        return BTreeMap::new();
    }
    let cap = capacity as f64;
    let sum_min: f64 = slices.iter().map(|s| s.min as f64).sum();

    let mut alloc: Vec<f64>;
    if sum_min > cap {
        alloc = slices.iter().map(|s| s.min as f64 * cap / sum_min).collect();
    } else {
        alloc = slices.iter().map(|s| s.min as f64).collect();
        let mut remaining = cap - sum_min;

        // remplissage au prorata de la demande fraîche
        let demand_of = |i: usize| slices[i].demand.filter(|d| *d > 0.0);
        let by_demand: Vec<usize> = (0..slices.len()).filter(|&i| demand_of(i).is_some()).collect();
        remaining = water_fill(slices, &mut alloc, by_demand, remaining, |i| demand_of(i).unwrap_or(0.0));

        // conservation du travail : le reste à parts égales
        let everyone: Vec<usize> = (0..slices.len()).collect();
        water_fill(slices, &mut alloc, everyone, remaining, |_| 1.0);
    }

    let total = alloc.iter().sum::<f64>();
    let mut floored: Vec<u32> = alloc.iter().map(|a| (a + EPSILON).floor() as u32).collect();
    let target = ((total + EPSILON).floor() as u32).min(capacity);
    let mut leftover = target.saturating_sub(floored.iter().sum());

    let mut order: Vec<usize> = (0..slices.len()).collect();
    order.sort_by(|&a, &b| {
        slices[b].priority.cmp(&slices[a].priority).then(slices[a].id.cmp(&slices[b].id))
    });
    while leftover > 0 {
        let mut given = false;
        for &i in &order {
            if leftover == 0 {
                break;
            }
            if floored[i] < slices[i].max {
                floored[i] += 1;
                leftover -= 1;
                given = true;
            }
        }
        if !given {
            break;
        }
    }

    slices.iter().zip(floored).map(|(s, share)| (s.id, share)).collect()
}

/// Distribue `remaining` entre `eligible` au prorata de `weight`, plafonné au max.
/// Renvoie ce qui n'a pas pu être placé.
fn water_fill(
    slices: &[SliceDemand],
    alloc: &mut [f64],
    mut eligible: Vec<usize>,
    mut remaining: f64,
    weight: impl Fn(usize) -> f64,
) -> f64 {
    eligible.retain(|&i| alloc[i] + EPSILON < slices[i].max as f64);
    while remaining > EPSILON && !eligible.is_empty() {
        let total_weight: f64 = eligible.iter().map(|&i| weight(i)).sum();
        if total_weight <= 0.0 {
            break;
        }
        let capped: Vec<usize> = eligible
            .iter()
            .copied()
            .filter(|&i| alloc[i] + remaining * weight(i) / total_weight >= slices[i].max as f64)
            .collect();

        if capped.is_empty() {
            for &i in &eligible {
                alloc[i] += remaining * weight(i) / total_weight;
            }
            return 0.0;
        }
        for &i in &capped {
            remaining -= slices[i].max as f64 - alloc[i];
            alloc[i] = slices[i].max as f64;
        }
        eligible.retain(|i| !capped.contains(i));
    }
    remaining.max(0.0)
}

/// Plan d'un WTP à partir de l'instantané de politique et de sa télémétrie
pub fn plan_device(
    device: &Device,
    snapshot: &SliceSnapshot,
    telemetry: &TelemetryCache,
) -> Result<DevicePlan, ComputeError> {
    let bindings = snapshot.bindings_for(device.addr);
    let readings: BTreeMap<Dscp, _> = telemetry.readings_for(device.id).into_iter().collect();

    let mut demand: BTreeMap<SliceId, Option<f64>> = BTreeMap::new();
    for (class, slice) in &bindings {
        let rate = match readings.get(class) {
            Some(reading) => reading
                .rate()
                .map_err(|source| ComputeError::Telemetry { class: *class, source })?,
            None => None,
        };
        let entry = demand.entry(*slice).or_insert(None);
        if let Some(rate) = rate {
            *entry = Some(entry.unwrap_or(0.0) + rate);
        }
    }

    let inputs: Vec<SliceDemand> = demand
        .iter()
        .filter_map(|(id, demand)| {
            snapshot.slice(*id).map(|slice| SliceDemand {
                id: *id,
                min: slice.policy.min_share,
                max: slice.policy.max_share,
                priority: slice.policy.priority,
                demand: *demand,
            })
        })
        .collect();

    let shares = allocate(&inputs, device.capacity);
    let allocated: u32 = shares.values().sum();
    if allocated > device.capacity {
        return Err(ComputeError::Overcommitted { allocated, capacity: device.capacity });
    }

    let mut plan = DevicePlan::default();
    if device.supports(ElementKind::SliceQuantum) {
        plan.shares = shares;
    }
    if device.supports(ElementKind::TrafficRules) {
        plan.rules = bindings
            .iter()
            .map(|(class, slice)| {
                let tos = snapshot.slice(*slice).and_then(|s| s.rewrite_tos());
                (*class, RulePlan { slice: *slice, tos })
            })
            .collect();
    }
    Ok(plan)
}

/// Commandes menant de `previous` à `next` : parts d'abord (baisses avant
/// hausses), puis installation des règles, retrait des règles, retrait des parts
pub fn diff(previous: Option<&DevicePlan>, next: &DevicePlan) -> Vec<EnforcementCommand> {
    let empty = DevicePlan::default();
    let previous = previous.unwrap_or(&empty);
    let mut out = Vec::new();

    let mut share_changes: Vec<(bool, SliceId, u32)> = next
        .shares
        .iter()
        .filter(|(id, share)| previous.shares.get(*id) != Some(*share))
        .map(|(id, share)| {
            let increase = previous.shares.get(id).map(|old| share > old).unwrap_or(true);
            (increase, *id, *share)
        })
        .collect();
    share_changes.sort();
    out.extend(
        share_changes
            .into_iter()
            .map(|(_, slice, share)| EnforcementCommand::SetShare { slice, share }),
    );

    for (dscp, rule) in &next.rules {
        if previous.rules.get(dscp) != Some(rule) {
            out.push(EnforcementCommand::InstallRule { dscp: *dscp, slice: rule.slice, tos: rule.tos });
        }
    }
    for dscp in previous.rules.keys().filter(|d| !next.rules.contains_key(*d)) {
        out.push(EnforcementCommand::RemoveRule { dscp: *dscp });
    }
    for slice in previous.shares.keys().filter(|s| !next.shares.contains_key(*s)) {
        out.push(EnforcementCommand::RemoveShare { slice: *slice });
    }
    out
}

/// Mémoire des plans appliqués, base du diff du tick suivant
#[derive(Debug, Default)]
pub struct SlicingEngine {
    applied: HashMap<DeviceId, DevicePlan>,
}

impl SlicingEngine {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn tick(
        &mut self,
        devices: &[Device],
        snapshot: &SliceSnapshot,
        telemetry: &TelemetryCache,
    ) -> TickReport {
        let active: BTreeSet<DeviceId> = devices.iter().filter(|d| d.is_active()).map(|d| d.id).collect();
        self.applied.retain(|id, _| active.contains(id));

        let mut report = TickReport::default();
        for device in devices.iter().filter(|d| d.is_active()) {
            match plan_device(device, snapshot, telemetry) {
                Ok(plan) => {
                    report.planned += 1;
                    let commands = diff(self.applied.get(&device.id), &plan);
                    if !commands.is_empty() {
                        debug!("[engine] {} command(s) for {}", commands.len(), device.id);
                        report.commands.push((device.id, commands));
                    }
                    self.applied.insert(device.id, plan);
                }
                Err(e) => {
                    warn!("[engine] skipping {} this tick: {}", device.id, e);
                    report.failed.push((device.id, e));
                }
            }
        }
        report
    }

    /// Réagit aux changements du registre : l'agent repart d'un état vierge
    pub fn observe(&mut self, event: &RegistryEvent) {
        match event {
            RegistryEvent::Reconnected(id)
            | RegistryEvent::CapabilitiesChanged(id)
            | RegistryEvent::Removed(id)
            | RegistryEvent::StateChanged(id, ConnectionState::Disconnected) => {
                self.forget(*id);
            }
            RegistryEvent::Added(_) | RegistryEvent::StateChanged(..) => {}
        }
    }

    /// Oublie le plan d'un WTP : le prochain tick renverra l'état complet
    pub fn forget(&mut self, id: DeviceId) {
        self.applied.remove(&id);
    }

    pub fn reset(&mut self) {
        self.applied.clear();
    }

    pub fn applied(&self, id: DeviceId) -> Option<&DevicePlan> {
        self.applied.get(&id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn demand(id: u32, min: u32, max: u32, priority: u8, demand: Option<f64>) -> SliceDemand {
        SliceDemand { id: SliceId(id), min, max, priority, demand }
    }

    #[test]
    fn test_caps_at_max_and_redistributes() {
        let shares = allocate(
            &[demand(1, 3000, 6000, 0, Some(80.0)), demand(2, 2000, 5000, 0, Some(20.0))],
            10_000,
        );
        assert_eq!(shares[&SliceId(1)], 6000);
        assert_eq!(shares[&SliceId(2)], 4000);
    }

    #[test]
    fn test_unknown_demand_shifts_remainder_to_fresh_slices() {
        let fresh = allocate(
            &[demand(1, 3000, 10_000, 0, Some(80.0)), demand(2, 2000, 10_000, 0, Some(20.0))],
            10_000,
        );
        assert_eq!((fresh[&SliceId(1)], fresh[&SliceId(2)]), (7000, 3000));

        let stale = allocate(
            &[demand(1, 3000, 10_000, 0, Some(80.0)), demand(2, 2000, 10_000, 0, None)],
            10_000,
        );
        assert_eq!((stale[&SliceId(1)], stale[&SliceId(2)]), (8000, 2000));
    }

    #[test]
    fn test_degrades_proportionally_to_minima() {
        let shares = allocate(
            &[demand(1, 6000, 8000, 0, Some(1.0)), demand(2, 3000, 8000, 0, Some(1.0))],
            6000,
        );
        assert_eq!(shares[&SliceId(1)], 4000);
        assert_eq!(shares[&SliceId(2)], 2000);
    }

    #[test]
    fn test_leftover_goes_to_priority_then_lowest_id() {
        let shares = allocate(
            &[demand(1, 0, 10_000, 1, None), demand(2, 0, 10_000, 5, None), demand(3, 0, 10_000, 1, None)],
            10_000,
        );
        // 3333.33 chacun, 1 point restant
        assert_eq!(shares[&SliceId(2)], 3334);
        assert_eq!(shares[&SliceId(1)], 3333);
        assert_eq!(shares[&SliceId(3)], 3333);
        assert_eq!(shares.values().sum::<u32>(), 10_000);
    }

    #[test]
    fn test_minimum_guarantee_and_capacity_bound() {
        let inputs = [
            demand(1, 1500, 2000, 2, Some(1e9)),
            demand(2, 2500, 9000, 1, Some(3.0)),
            demand(3, 1000, 1000, 0, None),
            demand(4, 0, 500, 9, Some(0.0)),
        ];
        for capacity in [5000, 7777, 10_000] {
            let shares = allocate(&inputs, capacity);
            assert!(shares.values().sum::<u32>() <= capacity);
            for slice in &inputs {
                assert!(shares[&slice.id] >= slice.min, "{:?} starved at {}", slice.id, capacity);
                assert!(shares[&slice.id] <= slice.max);
            }
        }
    }

    #[test]
    fn test_diff_orders_and_is_empty_when_unchanged() {
        let mut before = DevicePlan::default();
        before.shares.insert(SliceId(1), 6000);
        before.shares.insert(SliceId(2), 4000);
        before.rules.insert(Dscp::new(10).unwrap(), RulePlan { slice: SliceId(1), tos: None });

        let mut after = DevicePlan::default();
        after.shares.insert(SliceId(1), 7000);
        after.shares.insert(SliceId(3), 3000);
        after.rules.insert(Dscp::new(46).unwrap(), RulePlan { slice: SliceId(3), tos: None });

        let cmds = diff(Some(&before), &after);
        assert_eq!(
            cmds,
            vec![
                EnforcementCommand::SetShare { slice: SliceId(1), share: 7000 },
                EnforcementCommand::SetShare { slice: SliceId(3), share: 3000 },
                EnforcementCommand::InstallRule { dscp: Dscp::new(46).unwrap(), slice: SliceId(3), tos: None },
                EnforcementCommand::RemoveRule { dscp: Dscp::new(10).unwrap() },
                EnforcementCommand::RemoveShare { slice: SliceId(2) },
            ]
        );
        assert!(diff(Some(&after), &after).is_empty());
    }

    #[test]
    fn test_device_error_keeps_previous_plan_and_spares_others() {
        use crate::models::{Element, WtpAddr};
        use crate::registry::DeviceRegistry;
        use crate::slices::{SlicePolicy, SliceTable};
        use crate::telemetry::TelemetrySample;
        use std::time::Duration;

        let elements: Vec<Element> = [ElementKind::DscpStats, ElementKind::TrafficRules, ElementKind::SliceQuantum]
            .iter()
            .map(|k| Element::new(*k, 1))
            .collect();
        let registry = DeviceRegistry::new();
        let a = registry.register(WtpAddr([2, 0, 0, 0, 0, 1]), elements.clone(), None);
        let b = registry.register(WtpAddr([2, 0, 0, 0, 0, 2]), elements, None);
        registry.activate(a.id, a.epoch);
        registry.activate(b.id, b.epoch);

        let ef = Dscp::new(46).unwrap();
        let cumulative = |bytes: u64| TelemetrySample { bytes, packets: bytes / 100, avg_packet_size: 100, window_ms: 0 };
        let telemetry = TelemetryCache::new(Duration::from_secs(5));
        let table = SliceTable::new();
        let slice = table.create_slice(SlicePolicy::new(2000, 10_000, 0).admitting([ef])).unwrap();
        telemetry.record(a.id, ef, cumulative(5_000));

        let mut engine = SlicingEngine::new();
        let first = engine.tick(&registry.active_devices(), &table.snapshot(), &telemetry);
        assert_eq!(first.planned, 2);
        assert!(first.failed.is_empty());
        let plan_a = engine.applied(a.id).cloned().unwrap();

        // compteur cumulatif qui recule sur `a`, nouvelle politique pour tous
        telemetry.record(a.id, ef, cumulative(1_000));
        table.update_slice(slice, SlicePolicy::new(2000, 6000, 0).admitting([ef])).unwrap();
        let second = engine.tick(&registry.active_devices(), &table.snapshot(), &telemetry);

        assert_eq!(second.planned, 1);
        assert_eq!(second.failed.len(), 1);
        assert_eq!(second.failed[0].0, a.id);
        assert!(matches!(
            second.failed[0].1,
            ComputeError::Telemetry { source: RateError::CounterReset { previous: 5_000, current: 1_000 }, .. }
        ));
        assert_eq!(second.commands, vec![(b.id, vec![EnforcementCommand::SetShare { slice, share: 6000 }])]);
        assert_eq!(engine.applied(a.id), Some(&plan_a));
    }

    #[test]
    fn test_diff_applies_share_decreases_first() {
        let mut before = DevicePlan::default();
        before.shares.insert(SliceId(1), 3000);
        before.shares.insert(SliceId(2), 7000);
        let mut after = DevicePlan::default();
        after.shares.insert(SliceId(1), 7000);
        after.shares.insert(SliceId(2), 3000);

        let cmds = diff(Some(&before), &after);
        assert_eq!(cmds[0], EnforcementCommand::SetShare { slice: SliceId(2), share: 3000 });
        assert_eq!(cmds[1], EnforcementCommand::SetShare { slice: SliceId(1), share: 7000 });
    }
}
