/**
 * AUTO SLICING - Création automatique de slices par groupe DSCP
 *
 * RÔLE :
 * Client de l'interface de politique (jamais de contournement) qui sort du
 * best effort les classes DSCP actives : au-dessus du seuil d'activation une
 * classe rejoint le slice de son groupe, au-dessus du seuil individuel elle
 * obtient son propre slice.
 *
 * FONCTIONNEMENT :
 * - compte les paquets des échantillons frais, tous WTP actifs confondus
 * - slices indexés par DSCP (id = DSCP cible, TOS de réécriture = id << 2)
 * - part minimale = unité du groupe / Σ unités × réserve ; max = 100 %
 * - baisses de minima appliquées avant les hausses et les créations
 * - une règle joker DSCP → slice est ajoutée, ou remplacée si elle pointe ailleurs
 */

use crate::models::{Dscp, SliceId, FULL_SHARE};
use crate::slices::{PolicyError, RuleScope, SlicePolicy, SliceTable, TrafficRule};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};
use tracing::{debug, info, warn};

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct AutoSlicingConfig {
    pub enabled: bool,
    /// Paquets par rapport au-delà desquels une classe quitte le best effort
    pub activation_threshold: u64,
    /// Paquets au-delà desquels une classe obtient son propre slice
    pub individual_threshold: u64,
    /// Part de capacité répartie en minima entre les slices automatiques
    pub min_pool: u32,
}

impl Default for AutoSlicingConfig {
    fn default() -> Self {
        Self { enabled: false, activation_threshold: 200, individual_threshold: 600, min_pool: FULL_SHARE / 2 }
    }
}

/// Groupe de rattachement d'une valeur DSCP
pub fn dscp_group(code: Dscp) -> Dscp {
    let group = match code.value() {
        8 => 8,
        24 | 40 | 26 | 28 | 30 => 24,
        32 | 34 | 36 | 38 => 32,
        46 | 44 => 46,
        48 | 56 => 48,
        // BE, CS2, AF1x, AF2x et inconnus
        _ => 0,
    };
    Dscp::new(group).unwrap_or(Dscp::BEST_EFFORT)
}

/// Poids relatif d'un groupe dans la réserve de minima
pub fn group_unit(code: Dscp) -> f64 {
    match dscp_group(code).value() {
        8 => 0.5,
        24 => 1.5,
        32 => 2.0,
        46 => 3.0,
        48 => 4.0,
        _ => 1.0,
    }
}

fn priority_of(code: Dscp) -> u8 {
    (group_unit(code) * 2.0).round() as u8
}

#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct AutoStepReport {
    pub created: Vec<SliceId>,
    pub updated: Vec<SliceId>,
    pub rules_changed: Vec<Dscp>,
    pub errors: usize,
}

#[derive(Debug)]
pub struct AutoSlicer {
    config: AutoSlicingConfig,
    /// Slices créés par l'auto-slicer
    managed: BTreeSet<SliceId>,
    /// Dernier refus par cible : un refus répété n'est journalisé qu'une fois en warn
    rejected: BTreeMap<String, PolicyError>,
}

impl AutoSlicer {
    pub fn new(config: AutoSlicingConfig) -> Self {
        Self { config, managed: BTreeSet::new(), rejected: BTreeMap::new() }
    }

    pub fn managed(&self) -> &BTreeSet<SliceId> {
        &self.managed
    }

    /// Slice cible d'une classe selon son volume, None = reste en best effort
    pub fn target_for(&self, code: Dscp, packets: u64) -> Option<Dscp> {
        if packets <= self.config.activation_threshold {
            None
        } else if packets > self.config.individual_threshold {
            Some(code)
        } else {
            Some(dscp_group(code))
        }
    }

    pub fn step(&mut self, table: &SliceTable, packets: &BTreeMap<Dscp, u64>) -> AutoStepReport {
        let mut report = AutoStepReport::default();
        let targets: BTreeMap<Dscp, Dscp> = packets
            .iter()
            .filter_map(|(code, count)| self.target_for(*code, *count).map(|t| (*code, t)))
            .collect();
        if targets.is_empty() {
            return report;
        }

        let wanted: BTreeSet<SliceId> = targets
            .values()
            .map(|t| SliceId(t.value() as u32))
            .chain(self.managed.iter().copied())
            .collect();
        let total_units: f64 = wanted.iter().filter_map(|id| slice_dscp(*id)).map(group_unit).sum();
        let pool = self.config.min_pool.min(FULL_SHARE) as f64;
        let policy_for = |id: SliceId| -> Option<SlicePolicy> {
            let code = slice_dscp(id)?;
            let min = (group_unit(code) * pool / total_units + 1e-9).floor() as u32;
            Some(SlicePolicy::new(min, FULL_SHARE, priority_of(code)))
        };

        let snapshot = table.snapshot();
        let mut decreases = Vec::new();
        let mut increases = Vec::new();
        for id in &wanted {
            let Some(policy) = policy_for(*id) else { continue };
            match snapshot.slice(*id) {
                // slice posé par l'opérateur : sa politique reste la sienne
                Some(_) if !self.managed.contains(id) => {}
                Some(existing) if existing.policy.min_share > policy.min_share => decreases.push((*id, policy)),
                Some(existing) if existing.policy != policy => increases.push((*id, policy, false)),
                Some(_) => {}
                None => increases.push((*id, policy, true)),
            }
        }

        for (id, policy) in decreases {
            let result = table.update_slice(id, policy);
            self.apply(id, result, &mut report.updated, &mut report.errors);
        }
        for (id, policy, create) in increases {
            if create {
                let created = table.create_slice_with_id(id, policy);
                if created.is_ok() {
                    self.managed.insert(id);
                }
                self.apply(id, created.map(|_| ()), &mut report.created, &mut report.errors);
            } else {
                let result = table.update_slice(id, policy);
                self.apply(id, result, &mut report.updated, &mut report.errors);
            }
        }

        let snapshot = table.snapshot();
        for (code, target) in targets {
            let slice = SliceId(target.value() as u32);
            if snapshot.slice(slice).is_none() {
                continue;
            }
            let current = snapshot.rule(RuleScope::Wildcard, code).map(|r| r.slice);
            if current == Some(slice) {
                continue;
            }
            match table.replace_rule(TrafficRule { scope: RuleScope::Wildcard, dscp: code, slice }) {
                Ok(_) => {
                    info!("[auto] dscp {} -> slice {}", code, slice);
                    self.rejected.remove(&format!("rule {}", code));
                    report.rules_changed.push(code);
                }
                Err(e) => {
                    self.note_rejection(format!("rule {}", code), e);
                    report.errors += 1;
                }
            }
        }
        report
    }

    fn apply(&mut self, id: SliceId, result: Result<(), PolicyError>, done: &mut Vec<SliceId>, errors: &mut usize) {
        match result {
            Ok(()) => {
                self.rejected.remove(&format!("slice {}", id));
                done.push(id);
            }
            Err(e) => {
                *errors += 1;
                self.note_rejection(format!("slice {}", id), e);
            }
        }
    }

    fn note_rejection(&mut self, target: String, error: PolicyError) {
        if self.rejected.get(&target) == Some(&error) {
            debug!("[auto] {} still rejected: {}", target, error);
        } else {
            warn!("[auto] {} not applied: {}", target, error);
            self.rejected.insert(target, error);
        }
    }
}

fn slice_dscp(id: SliceId) -> Option<Dscp> {
    u8::try_from(id.0).ok().and_then(Dscp::new)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn dscp(v: u8) -> Dscp {
        Dscp::new(v).unwrap()
    }

    #[test]
    fn test_group_table() {
        assert_eq!(dscp_group(dscp(26)), dscp(24));
        assert_eq!(dscp_group(dscp(44)), dscp(46));
        assert_eq!(dscp_group(dscp(56)), dscp(48));
        assert_eq!(dscp_group(dscp(18)), dscp(0));
        assert_eq!(dscp_group(dscp(63)), dscp(0));
        assert_eq!(group_unit(dscp(36)), 2.0);
    }

    #[test]
    fn test_thresholds() {
        let slicer = AutoSlicer::new(AutoSlicingConfig { enabled: true, ..Default::default() });
        assert_eq!(slicer.target_for(dscp(26), 150), None);
        assert_eq!(slicer.target_for(dscp(26), 300), Some(dscp(24)));
        assert_eq!(slicer.target_for(dscp(26), 900), Some(dscp(26)));
    }

    #[test]
    fn test_step_creates_group_slices_and_wildcard_rules() {
        let table = SliceTable::new();
        let mut slicer = AutoSlicer::new(AutoSlicingConfig { enabled: true, ..Default::default() });
        let counts = BTreeMap::from([(dscp(46), 900), (dscp(34), 300), (dscp(10), 50)]);

        let report = slicer.step(&table, &counts);
        assert_eq!(report.created, vec![SliceId(32), SliceId(46)]);
        assert_eq!(report.errors, 0);

        let snap = table.snapshot();
        // unités 2 et 3 sur une réserve de 5000
        assert_eq!(snap.slice(SliceId(32)).unwrap().policy.min_share, 2000);
        assert_eq!(snap.slice(SliceId(46)).unwrap().policy.min_share, 3000);
        assert_eq!(snap.rule(RuleScope::Wildcard, dscp(34)).unwrap().slice, SliceId(32));
        assert_eq!(snap.rule(RuleScope::Wildcard, dscp(46)).unwrap().slice, SliceId(46));
        assert!(snap.rule(RuleScope::Wildcard, dscp(10)).is_none());

        // second passage identique : rien à faire
        assert_eq!(slicer.step(&table, &counts), AutoStepReport::default());
    }

    #[test]
    fn test_promotion_shrinks_existing_minima_first() {
        let table = SliceTable::new();
        let mut slicer = AutoSlicer::new(AutoSlicingConfig { enabled: true, ..Default::default() });
        slicer.step(&table, &BTreeMap::from([(dscp(34), 300)]));
        assert_eq!(table.get_slice(SliceId(32)).unwrap().policy.min_share, 5000);

        let report = slicer.step(&table, &BTreeMap::from([(dscp(34), 700)]));
        assert_eq!(report.updated, vec![SliceId(32)]);
        assert_eq!(report.created, vec![SliceId(34)]);
        assert_eq!(table.get_slice(SliceId(32)).unwrap().policy.min_share, 2500);
        assert_eq!(table.snapshot().rule(RuleScope::Wildcard, dscp(34)).unwrap().slice, SliceId(34));
    }

    #[test]
    fn test_repeated_rejection_is_remembered_once() {
        let table = SliceTable::new();
        table.create_slice(SlicePolicy::new(FULL_SHARE, FULL_SHARE, 0).admitting([dscp(10)])).unwrap();
        let mut slicer = AutoSlicer::new(AutoSlicingConfig { enabled: true, ..Default::default() });
        let counts = BTreeMap::from([(dscp(46), 900)]);

        let first = slicer.step(&table, &counts);
        assert_eq!(first.errors, 1);
        assert!(first.created.is_empty());
        assert!(matches!(slicer.rejected.get("slice 46"), Some(PolicyError::CapacityExceeded { .. })));

        // même refus : compté, mais pas de nouvelle entrée
        let second = slicer.step(&table, &counts);
        assert_eq!(second.errors, 1);
        assert_eq!(slicer.rejected.len(), 1);
        assert!(slicer.managed().is_empty());

        // la capacité libérée, le refus est oublié
        let operator = table.list_slices()[0].id;
        table.update_slice(operator, SlicePolicy::new(0, FULL_SHARE, 0).admitting([dscp(10)])).unwrap();
        let third = slicer.step(&table, &counts);
        assert_eq!(third.created, vec![SliceId(46)]);
        assert!(slicer.rejected.is_empty());
    }
}
