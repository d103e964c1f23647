/**
 * SLICE TABLE - Interface de politique : slices et règles de trafic
 *
 * RÔLE :
 * Source de vérité unique des slices (parts min/max, priorité, classes admises)
 * et des règles DSCP → slice. Le moteur de slicing ne fait que la lire.
 *
 * FONCTIONNEMENT :
 * - chaque mutation construit un nouvel instantané, le valide entièrement
 *   (conflits, intégrité référentielle, admission de capacité) puis le publie ;
 *   en cas d'erreur l'état publié est inchangé
 * - lecture par instantané Arc : un tick voit une table cohérente
 * - identifiants < 64 réservés aux slices indexés par DSCP (auto-slicing,
 *   réécriture TOS) ; les slices créés dynamiquement commencent à 64
 *
 * ADMISSION :
 * Un slice est global s'il admet des classes, s'il est ciblé par une règle
 * joker ou s'il n'est lié à aucun WTP ; sinon son empreinte est l'ensemble des
 * WTP de ses règles. Dans chaque contexte (global + un WTP), Σ min ≤ 100 %.
 */

use crate::models::{Dscp, SliceId, WtpAddr, FULL_SHARE};
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};
use std::fmt;
use std::sync::Arc;
use tracing::info;

/// Premier identifiant attribué par create_slice
pub const FIRST_DYNAMIC_SLICE: u32 = 64;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RuleScope {
    Wildcard,
    Device(WtpAddr),
}

impl fmt::Display for RuleScope {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RuleScope::Wildcard => f.write_str("*"),
            RuleScope::Device(addr) => write!(f, "{}", addr),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SlicePolicy {
    /// Part garantie (points de base)
    pub min_share: u32,
    /// Plafond (points de base)
    pub max_share: u32,
    #[serde(default)]
    pub priority: u8,
    #[serde(default)]
    pub classes: BTreeSet<Dscp>,
}

impl SlicePolicy {
    pub fn new(min_share: u32, max_share: u32, priority: u8) -> Self {
        Self { min_share, max_share, priority, classes: BTreeSet::new() }
    }

    pub fn admitting(mut self, classes: impl IntoIterator<Item = Dscp>) -> Self {
        self.classes.extend(classes);
        self
    }

    fn validate(&self) -> Result<(), PolicyError> {
        if self.max_share > FULL_SHARE {
            return Err(PolicyError::InvalidPolicy(format!(
                "max share {} above {}",
                self.max_share, FULL_SHARE
            )));
        }
        if self.min_share > self.max_share {
            return Err(PolicyError::InvalidPolicy(format!(
                "min share {} above max share {}",
                self.min_share, self.max_share
            )));
        }
        Ok(())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Slice {
    pub id: SliceId,
    #[serde(flatten)]
    pub policy: SlicePolicy,
}

impl Slice {
    /// Octet TOS de réécriture pour les slices indexés par DSCP
    pub fn rewrite_tos(&self) -> Option<u8> {
        u8::try_from(self.id.0).ok().and_then(Dscp::new).map(Dscp::tos)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct TrafficRule {
    pub scope: RuleScope,
    pub dscp: Dscp,
    pub slice: SliceId,
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum PolicyError {
    #[error("capacity exceeded on {context}: minimum shares would sum to {requested} bp")]
    CapacityExceeded { context: String, requested: u32 },
    #[error("rule conflict on ({scope}, dscp {dscp}): already bound to slice {existing}")]
    RuleConflict { scope: RuleScope, dscp: Dscp, existing: SliceId },
    #[error("not found: {0}")]
    NotFound(String),
    #[error("slice {slice} is still referenced by {rules} rule(s)")]
    ReferentialIntegrityViolation { slice: SliceId, rules: usize },
    #[error("invalid policy: {0}")]
    InvalidPolicy(String),
}

/// Vue immuable de la table, partagée avec le tick en cours
#[derive(Debug, Clone, Default)]
pub struct SliceSnapshot {
    slices: BTreeMap<SliceId, Slice>,
    rules: BTreeMap<(RuleScope, Dscp), TrafficRule>,
    generation: u64,
    next_id: u32,
}

enum Footprint {
    Global,
    Devices(BTreeSet<WtpAddr>),
}

impl SliceSnapshot {
    pub fn generation(&self) -> u64 {
        self.generation
    }

    pub fn slice(&self, id: SliceId) -> Option<&Slice> {
        self.slices.get(&id)
    }

    pub fn slices(&self) -> impl Iterator<Item = &Slice> {
        self.slices.values()
    }

    pub fn rules(&self) -> impl Iterator<Item = &TrafficRule> {
        self.rules.values()
    }

    pub fn rule(&self, scope: RuleScope, dscp: Dscp) -> Option<&TrafficRule> {
        self.rules.get(&(scope, dscp))
    }

    /// Liaisons effectives classe → slice sur un WTP :
    /// règle du WTP > règle joker > slice admettant la classe
    pub fn bindings_for(&self, addr: WtpAddr) -> BTreeMap<Dscp, SliceId> {
        let mut out = BTreeMap::new();
        for slice in self.slices.values() {
            for class in &slice.policy.classes {
                out.insert(*class, slice.id);
            }
        }
        for rule in self.rules.values() {
            if rule.scope == RuleScope::Wildcard {
                out.insert(rule.dscp, rule.slice);
            }
        }
        for rule in self.rules.values() {
            if rule.scope == RuleScope::Device(addr) {
                out.insert(rule.dscp, rule.slice);
            }
        }
        out
    }

    fn footprint(&self, id: SliceId) -> Footprint {
        let Some(slice) = self.slices.get(&id) else {
            return Footprint::Devices(BTreeSet::new());
        };
        if !slice.policy.classes.is_empty() {
            return Footprint::Global;
        }
        let mut devices = BTreeSet::new();
        for rule in self.rules.values().filter(|r| r.slice == id) {
            match rule.scope {
                RuleScope::Wildcard => return Footprint::Global,
                RuleScope::Device(addr) => {
                    devices.insert(addr);
                }
            }
        }
        if devices.is_empty() {
            Footprint::Global
        } else {
            Footprint::Devices(devices)
        }
    }

    fn check_admission(&self) -> Result<(), PolicyError> {
        let mut global = 0u32;
        let mut per_device: BTreeMap<WtpAddr, u32> = BTreeMap::new();
        for slice in self.slices.values() {
            match self.footprint(slice.id) {
                Footprint::Global => global = global.saturating_add(slice.policy.min_share),
                Footprint::Devices(devices) => {
                    for addr in devices {
                        let sum = per_device.entry(addr).or_default();
                        *sum = sum.saturating_add(slice.policy.min_share);
                    }
                }
            }
        }

        if global > FULL_SHARE {
            return Err(PolicyError::CapacityExceeded { context: "all devices".into(), requested: global });
        }
        for (addr, sum) in per_device {
            let requested = global.saturating_add(sum);
            if requested > FULL_SHARE {
                return Err(PolicyError::CapacityExceeded { context: addr.to_string(), requested });
            }
        }
        Ok(())
    }

    /// Une classe n'est admise que par un seul slice
    fn check_class_overlap(&self, candidate: &Slice) -> Result<(), PolicyError> {
        for other in self.slices.values().filter(|s| s.id != candidate.id) {
            if let Some(class) = other.policy.classes.intersection(&candidate.policy.classes).next() {
                return Err(PolicyError::RuleConflict {
                    scope: RuleScope::Wildcard,
                    dscp: *class,
                    existing: other.id,
                });
            }
        }
        Ok(())
    }

    fn allocate_id(&mut self) -> SliceId {
        let mut next = self.next_id.max(FIRST_DYNAMIC_SLICE);
        while self.slices.contains_key(&SliceId(next)) {
            next += 1;
        }
        self.next_id = next + 1;
        SliceId(next)
    }

    fn insert_slice(&mut self, slice: Slice) -> Result<SliceId, PolicyError> {
        slice.policy.validate()?;
        self.check_class_overlap(&slice)?;
        let id = slice.id;
        self.slices.insert(id, slice);
        self.check_admission()?;
        Ok(id)
    }

    fn insert_rule(&mut self, rule: TrafficRule) -> Result<(), PolicyError> {
        if !self.slices.contains_key(&rule.slice) {
            return Err(PolicyError::NotFound(format!("slice {}", rule.slice)));
        }
        self.rules.insert((rule.scope, rule.dscp), rule);
        self.check_admission()
    }
}

pub struct SliceTable {
    current: RwLock<Arc<SliceSnapshot>>,
}

pub type SharedSliceTable = Arc<SliceTable>;

impl SliceTable {
    pub fn new() -> Self {
        Self { current: RwLock::new(Arc::new(SliceSnapshot::default())) }
    }

    /// Instantané cohérent pour un tick
    pub fn snapshot(&self) -> Arc<SliceSnapshot> {
        self.current.read().clone()
    }

    pub fn create_slice(&self, policy: SlicePolicy) -> Result<SliceId, PolicyError> {
        let id = self.mutate(|next| {
            let id = next.allocate_id();
            next.insert_slice(Slice { id, policy })
        })?;
        info!("[slices] created slice {}", id);
        Ok(id)
    }

    /// Création avec identifiant imposé (bootstrap, slices indexés par DSCP)
    pub fn create_slice_with_id(&self, id: SliceId, policy: SlicePolicy) -> Result<SliceId, PolicyError> {
        self.mutate(|next| {
            if next.slices.contains_key(&id) {
                return Err(PolicyError::InvalidPolicy(format!("slice {} already exists", id)));
            }
            next.insert_slice(Slice { id, policy })
        })?;
        info!("[slices] created slice {}", id);
        Ok(id)
    }

    pub fn update_slice(&self, id: SliceId, policy: SlicePolicy) -> Result<(), PolicyError> {
        self.mutate(|next| {
            if !next.slices.contains_key(&id) {
                return Err(PolicyError::NotFound(format!("slice {}", id)));
            }
            next.insert_slice(Slice { id, policy }).map(|_| ())
        })
    }

    pub fn delete_slice(&self, id: SliceId) -> Result<Slice, PolicyError> {
        let removed = self.mutate(|next| {
            let rules = next.rules.values().filter(|r| r.slice == id).count();
            if rules > 0 {
                return Err(PolicyError::ReferentialIntegrityViolation { slice: id, rules });
            }
            next.slices.remove(&id).ok_or_else(|| PolicyError::NotFound(format!("slice {}", id)))
        })?;
        info!("[slices] deleted slice {}", id);
        Ok(removed)
    }

    pub fn add_rule(&self, rule: TrafficRule) -> Result<(), PolicyError> {
        self.mutate(|next| {
            if let Some(existing) = next.rules.get(&(rule.scope, rule.dscp)) {
                return Err(PolicyError::RuleConflict {
                    scope: rule.scope,
                    dscp: rule.dscp,
                    existing: existing.slice,
                });
            }
            next.insert_rule(rule)
        })?;
        info!("[slices] rule ({}, dscp {}) -> slice {}", rule.scope, rule.dscp, rule.slice);
        Ok(())
    }

    /// Remplace (ou crée) la règle (scope, DSCP) en une seule mutation
    pub fn replace_rule(&self, rule: TrafficRule) -> Result<Option<TrafficRule>, PolicyError> {
        self.mutate(|next| {
            let previous = next.rules.get(&(rule.scope, rule.dscp)).copied();
            next.insert_rule(rule)?;
            Ok(previous)
        })
    }

    /// Retirer la dernière règle d'un slice le rend global : l'admission est revérifiée
    pub fn remove_rule(&self, scope: RuleScope, dscp: Dscp) -> Result<TrafficRule, PolicyError> {
        self.mutate(|next| {
            let removed = next
                .rules
                .remove(&(scope, dscp))
                .ok_or_else(|| PolicyError::NotFound(format!("rule ({}, dscp {})", scope, dscp)))?;
            next.check_admission()?;
            Ok(removed)
        })
    }

    pub fn get_slice(&self, id: SliceId) -> Option<Slice> {
        self.current.read().slice(id).cloned()
    }

    pub fn list_slices(&self) -> Vec<Slice> {
        self.current.read().slices().cloned().collect()
    }

    pub fn list_rules(&self) -> Vec<TrafficRule> {
        self.current.read().rules().copied().collect()
    }

    /// Copie l'instantané courant, applique `f`, publie si tout est valide.
    /// Le verrou d'écriture est tenu pendant toute la mutation (écrivain unique).
    fn mutate<T>(&self, f: impl FnOnce(&mut SliceSnapshot) -> Result<T, PolicyError>) -> Result<T, PolicyError> {
        let mut current = self.current.write();
        let mut next = SliceSnapshot::clone(&current);
        let out = f(&mut next)?;
        next.generation += 1;
        *current = Arc::new(next);
        Ok(out)
    }
}

impl Default for SliceTable {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn dscp(v: u8) -> Dscp {
        Dscp::new(v).unwrap()
    }

    fn addr(last: u8) -> WtpAddr {
        WtpAddr([0, 0x0d, 0xb9, 0, 0, last])
    }

    #[test]
    fn test_capacity_exceeded_creates_nothing() {
        let table = SliceTable::new();
        table.create_slice(SlicePolicy::new(6000, 10000, 1).admitting([dscp(10)])).unwrap();
        let before = table.snapshot();

        let err = table.create_slice(SlicePolicy::new(5000, 10000, 1).admitting([dscp(46)])).unwrap_err();
        assert!(matches!(err, PolicyError::CapacityExceeded { requested: 11000, .. }));
        assert_eq!(table.list_slices().len(), 1);
        assert_eq!(table.snapshot().generation(), before.generation());
    }

    #[test]
    fn test_rule_conflict_leaves_state_unchanged() {
        let table = SliceTable::new();
        let a = table.create_slice(SlicePolicy::new(1000, 5000, 1)).unwrap();
        let b = table.create_slice(SlicePolicy::new(1000, 5000, 1)).unwrap();
        table.add_rule(TrafficRule { scope: RuleScope::Wildcard, dscp: dscp(46), slice: a }).unwrap();
        let before = table.list_rules();

        let err = table
            .add_rule(TrafficRule { scope: RuleScope::Wildcard, dscp: dscp(46), slice: b })
            .unwrap_err();
        assert_eq!(err, PolicyError::RuleConflict { scope: RuleScope::Wildcard, dscp: dscp(46), existing: a });
        assert_eq!(table.list_rules(), before);

        // même DSCP, autre portée : accepté
        table.add_rule(TrafficRule { scope: RuleScope::Device(addr(1)), dscp: dscp(46), slice: b }).unwrap();
    }

    #[test]
    fn test_delete_blocked_while_rules_reference_slice() {
        let table = SliceTable::new();
        let s = table.create_slice(SlicePolicy::new(0, 10000, 0)).unwrap();
        table.add_rule(TrafficRule { scope: RuleScope::Device(addr(2)), dscp: dscp(0), slice: s }).unwrap();

        assert_eq!(
            table.delete_slice(s).unwrap_err(),
            PolicyError::ReferentialIntegrityViolation { slice: s, rules: 1 }
        );
        table.remove_rule(RuleScope::Device(addr(2)), dscp(0)).unwrap();
        assert_eq!(table.delete_slice(s).unwrap().id, s);
        assert!(matches!(table.delete_slice(s), Err(PolicyError::NotFound(_))));
    }

    #[test]
    fn test_device_scoped_slices_are_admitted_per_device() {
        let table = SliceTable::new();
        let global = table.create_slice(SlicePolicy::new(4000, 10000, 0).admitting([dscp(0)])).unwrap();
        let a = table.create_slice(SlicePolicy::new(0, 10000, 0)).unwrap();
        let b = table.create_slice(SlicePolicy::new(0, 10000, 0)).unwrap();
        table.add_rule(TrafficRule { scope: RuleScope::Device(addr(1)), dscp: dscp(46), slice: a }).unwrap();
        table.add_rule(TrafficRule { scope: RuleScope::Device(addr(2)), dscp: dscp(46), slice: b }).unwrap();

        // 4000 + 6000 sur chaque WTP : admis séparément
        table.update_slice(a, SlicePolicy::new(6000, 10000, 0)).unwrap();
        table.update_slice(b, SlicePolicy::new(6000, 10000, 0)).unwrap();

        let err = table.update_slice(global, SlicePolicy::new(4500, 10000, 0).admitting([dscp(0)])).unwrap_err();
        assert!(matches!(err, PolicyError::CapacityExceeded { requested: 10500, .. }));
    }

    #[test]
    fn test_bindings_prefer_device_rules_over_wildcard_and_classes() {
        let table = SliceTable::new();
        let by_class = table.create_slice(SlicePolicy::new(0, 10000, 0).admitting([dscp(10), dscp(46)])).unwrap();
        let wild = table.create_slice(SlicePolicy::new(0, 10000, 0)).unwrap();
        let local = table.create_slice(SlicePolicy::new(0, 10000, 0)).unwrap();
        table.add_rule(TrafficRule { scope: RuleScope::Wildcard, dscp: dscp(46), slice: wild }).unwrap();
        table.add_rule(TrafficRule { scope: RuleScope::Device(addr(1)), dscp: dscp(10), slice: local }).unwrap();

        let snap = table.snapshot();
        let on_1 = snap.bindings_for(addr(1));
        assert_eq!(on_1[&dscp(10)], local);
        assert_eq!(on_1[&dscp(46)], wild);
        let on_2 = snap.bindings_for(addr(2));
        assert_eq!(on_2[&dscp(10)], by_class);
    }

    #[test]
    fn test_invalid_policy_and_overlapping_classes() {
        let table = SliceTable::new();
        assert!(matches!(
            table.create_slice(SlicePolicy::new(6000, 5000, 0)),
            Err(PolicyError::InvalidPolicy(_))
        ));
        let first = table.create_slice(SlicePolicy::new(0, 10000, 0).admitting([dscp(8)])).unwrap();
        assert!(first.0 >= FIRST_DYNAMIC_SLICE);
        assert!(matches!(
            table.create_slice(SlicePolicy::new(0, 10000, 0).admitting([dscp(8)])),
            Err(PolicyError::RuleConflict { existing, .. }) if existing == first
        ));
    }

    #[test]
    fn test_remove_last_device_rule_is_admission_checked() {
        let table = SliceTable::new();
        let a = table.create_slice(SlicePolicy::new(6000, 10000, 0)).unwrap();
        table.add_rule(TrafficRule { scope: RuleScope::Device(addr(1)), dscp: dscp(10), slice: a }).unwrap();
        let b = table.create_slice(SlicePolicy::new(0, 10000, 0)).unwrap();
        table.add_rule(TrafficRule { scope: RuleScope::Device(addr(2)), dscp: dscp(10), slice: b }).unwrap();
        table.update_slice(b, SlicePolicy::new(6000, 10000, 0)).unwrap();
        let before = table.snapshot().generation();

        // sans règle, `a` deviendrait global et s'ajouterait au budget de addr(2)
        assert!(matches!(
            table.remove_rule(RuleScope::Device(addr(1)), dscp(10)),
            Err(PolicyError::CapacityExceeded { requested: 12000, .. })
        ));
        assert_eq!(table.snapshot().generation(), before);
        assert!(table.snapshot().rule(RuleScope::Device(addr(1)), dscp(10)).is_some());

        // la table reste admissible : les mutations suivantes passent
        table.create_slice(SlicePolicy::new(0, 10000, 0).admitting([dscp(0)])).unwrap();
        table.remove_rule(RuleScope::Device(addr(2)), dscp(10)).unwrap_err();
        table.delete_slice(a).unwrap_err();
    }

    #[test]
    fn test_rewrite_tos_only_for_dscp_keyed_slices() {
        let table = SliceTable::new();
        let ef = table.create_slice_with_id(SliceId(46), SlicePolicy::new(0, 10000, 0)).unwrap();
        let dynamic = table.create_slice(SlicePolicy::new(0, 10000, 0)).unwrap();
        assert_eq!(table.get_slice(ef).unwrap().rewrite_tos(), Some(184));
        assert_eq!(table.get_slice(dynamic).unwrap().rewrite_tos(), None);
        assert!(table.create_slice_with_id(SliceId(46), SlicePolicy::new(0, 10000, 0)).is_err());
    }
}
