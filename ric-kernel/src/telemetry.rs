/**
 * TELEMETRY CACHE - Derniers échantillons DSCP par (WTP, classe)
 *
 * RÔLE :
 * Conserve l'échantillon courant et le précédent de chaque classe de trafic
 * remontée par l'élément DSCP-Stat, horodatés à l'ingestion.
 *
 * FONCTIONNEMENT :
 * - record() écrase l'échantillon courant et garde le précédent (calcul de débit)
 * - read() renvoie Stale au-delà de la borne de fraîcheur : demande inconnue,
 *   jamais demande nulle
 * - indexé par DeviceId uniquement (aucune référence vers le registre)
 * - rien n'est persisté : un redémarrage repart d'un cache vide
 */

use crate::models::{DeviceId, Dscp};
use parking_lot::RwLock;
use serde::Serialize;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use time::OffsetDateTime;
use tokio::time::Instant;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct TelemetrySample {
    pub bytes: u64,
    pub packets: u64,
    pub avg_packet_size: u32,
    /// Fenêtre de mesure côté agent ; 0 = compteurs cumulatifs
    pub window_ms: u64,
}

#[derive(Debug, Clone, Copy)]
pub struct StampedSample {
    pub sample: TelemetrySample,
    pub ingested: Instant,
    pub ingested_at: OffsetDateTime,
}

#[derive(Debug, Clone, Copy)]
struct Slot {
    current: StampedSample,
    previous: Option<StampedSample>,
}

#[derive(Debug, Clone, Copy)]
pub enum Reading {
    Fresh {
        current: StampedSample,
        previous: Option<StampedSample>,
    },
    Stale {
        last: StampedSample,
        age: Duration,
    },
    Missing,
}

impl Reading {
    pub fn is_fresh(&self) -> bool {
        matches!(self, Reading::Fresh { .. })
    }

    /// Débit de la classe en octets/s, None si la demande est inconnue
    /// (y compris le premier échantillon d'un compteur cumulatif)
    pub fn rate(&self) -> Result<Option<f64>, RateError> {
        match self {
            Reading::Fresh { current, previous: None } if current.sample.window_ms == 0 => Ok(None),
            Reading::Fresh { current, previous } => demand_rate(current, previous.as_ref()).map(Some),
            Reading::Stale { .. } | Reading::Missing => Ok(None),
        }
    }
}

#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum RateError {
    #[error("byte counter went backwards ({previous} -> {current})")]
    CounterReset { previous: u64, current: u64 },
    #[error("no sampling window and no previous sample")]
    NoWindow,
    #[error("non-finite rate")]
    NonFinite,
}

/// Débit = octets / fenêtre ; en mode cumulatif, delta sur l'échantillon précédent
pub fn demand_rate(current: &StampedSample, previous: Option<&StampedSample>) -> Result<f64, RateError> {
    let rate = if current.sample.window_ms > 0 {
        current.sample.bytes as f64 * 1000.0 / current.sample.window_ms as f64
    } else {
        let prev = previous.ok_or(RateError::NoWindow)?;
        if current.sample.bytes < prev.sample.bytes {
            return Err(RateError::CounterReset {
                previous: prev.sample.bytes,
                current: current.sample.bytes,
            });
        }
        let dt = current.ingested.saturating_duration_since(prev.ingested).as_secs_f64();
        if dt <= 0.0 {
            return Err(RateError::NoWindow);
        }
        (current.sample.bytes - prev.sample.bytes) as f64 / dt
    };

    if rate.is_finite() {
        Ok(rate)
    } else {
        Err(RateError::NonFinite)
    }
}

/// Vue d'observabilité d'une classe (dernier échantillon + fraîcheur)
#[derive(Debug, Clone, Serialize)]
pub struct ClassView {
    pub class: Dscp,
    pub sample: TelemetrySample,
    #[serde(with = "time::serde::rfc3339")]
    pub ingested_at: OffsetDateTime,
    pub age_ms: u64,
    pub fresh: bool,
}

pub struct TelemetryCache {
    slots: RwLock<HashMap<(DeviceId, Dscp), Slot>>,
    freshness: Duration,
}

pub type SharedTelemetryCache = Arc<TelemetryCache>;

impl TelemetryCache {
    pub fn new(freshness: Duration) -> Self {
        Self { slots: RwLock::new(HashMap::new()), freshness }
    }

    pub fn freshness(&self) -> Duration {
        self.freshness
    }

    pub fn record(&self, device: DeviceId, class: Dscp, sample: TelemetrySample) {
        let stamped = StampedSample {
            sample,
            ingested: Instant::now(),
            ingested_at: OffsetDateTime::now_utc(),
        };
        let mut slots = self.slots.write();
        slots
            .entry((device, class))
            .and_modify(|slot| {
                slot.previous = Some(slot.current);
                slot.current = stamped;
            })
            .or_insert(Slot { current: stamped, previous: None });
    }

    pub fn read(&self, device: DeviceId, class: Dscp) -> Reading {
        match self.slots.read().get(&(device, class)) {
            Some(slot) => self.classify(slot),
            None => Reading::Missing,
        }
    }

    /// Lecture cohérente de toutes les classes d'un WTP (un seul verrou)
    pub fn readings_for(&self, device: DeviceId) -> Vec<(Dscp, Reading)> {
        let slots = self.slots.read();
        let mut out: Vec<(Dscp, Reading)> = slots
            .iter()
            .filter(|((d, _), _)| *d == device)
            .map(|((_, class), slot)| (*class, self.classify(slot)))
            .collect();
        out.sort_by_key(|(class, _)| *class);
        out
    }

    pub fn views_for(&self, device: DeviceId) -> Vec<ClassView> {
        self.readings_for(device)
            .into_iter()
            .filter_map(|(class, reading)| {
                let (last, fresh) = match reading {
                    Reading::Fresh { current, .. } => (current, true),
                    Reading::Stale { last, .. } => (last, false),
                    Reading::Missing => return None,
                };
                Some(ClassView {
                    class,
                    sample: last.sample,
                    ingested_at: last.ingested_at,
                    age_ms: last.ingested.elapsed().as_millis() as u64,
                    fresh,
                })
            })
            .collect()
    }

    pub fn forget_device(&self, device: DeviceId) -> usize {
        let mut slots = self.slots.write();
        let before = slots.len();
        slots.retain(|(d, _), _| *d != device);
        before - slots.len()
    }

    pub fn len(&self) -> usize {
        self.slots.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn classify(&self, slot: &Slot) -> Reading {
        let age = slot.current.ingested.elapsed();
        if age > self.freshness {
            Reading::Stale { last: slot.current, age }
        } else {
            Reading::Fresh { current: slot.current, previous: slot.previous }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn dscp(v: u8) -> Dscp {
        Dscp::new(v).unwrap()
    }

    fn sample(bytes: u64, window_ms: u64) -> TelemetrySample {
        TelemetrySample { bytes, packets: bytes / 100, avg_packet_size: 100, window_ms }
    }

    #[tokio::test(start_paused = true)]
    async fn test_read_marks_stale_after_freshness_bound() {
        let cache = TelemetryCache::new(Duration::from_secs(3));
        cache.record(DeviceId(1), dscp(46), sample(8000, 1000));
        assert!(cache.read(DeviceId(1), dscp(46)).is_fresh());

        tokio::time::advance(Duration::from_millis(3100)).await;
        match cache.read(DeviceId(1), dscp(46)) {
            Reading::Stale { age, last } => {
                assert!(age >= Duration::from_secs(3));
                assert_eq!(last.sample.bytes, 8000);
            }
            other => panic!("expected stale reading, got {:?}", other),
        }
        // stale = inconnu, pas zéro
        assert_eq!(cache.read(DeviceId(1), dscp(46)).rate().unwrap(), None);
        assert!(matches!(cache.read(DeviceId(1), dscp(0)), Reading::Missing));
    }

    #[tokio::test(start_paused = true)]
    async fn test_record_keeps_previous_for_cumulative_rate() {
        let cache = TelemetryCache::new(Duration::from_secs(5));
        cache.record(DeviceId(1), dscp(0), sample(1_000, 0));
        tokio::time::advance(Duration::from_secs(2)).await;
        cache.record(DeviceId(1), dscp(0), sample(5_000, 0));

        let rate = cache.read(DeviceId(1), dscp(0)).rate().unwrap().unwrap();
        assert!((rate - 2_000.0).abs() < 1e-6);

        tokio::time::advance(Duration::from_secs(1)).await;
        cache.record(DeviceId(1), dscp(0), sample(10, 0));
        assert!(matches!(
            cache.read(DeviceId(1), dscp(0)).rate(),
            Err(RateError::CounterReset { previous: 5_000, current: 10 })
        ));
    }

    #[test]
    fn test_windowed_rate_and_missing_window() {
        let cache = TelemetryCache::new(Duration::from_secs(5));
        cache.record(DeviceId(2), dscp(10), sample(500, 250));
        let rate = cache.read(DeviceId(2), dscp(10)).rate().unwrap().unwrap();
        assert!((rate - 2_000.0).abs() < 1e-6);

        cache.record(DeviceId(3), dscp(10), sample(500, 0));
        assert_eq!(cache.read(DeviceId(3), dscp(10)).rate(), Ok(None));
        let Reading::Fresh { current, .. } = cache.read(DeviceId(3), dscp(10)) else {
            panic!("expected fresh reading");
        };
        assert_eq!(demand_rate(&current, None), Err(RateError::NoWindow));
    }

    #[test]
    fn test_forget_device_only_drops_its_slots() {
        let cache = TelemetryCache::new(Duration::from_secs(5));
        cache.record(DeviceId(1), dscp(0), sample(1, 1));
        cache.record(DeviceId(1), dscp(8), sample(1, 1));
        cache.record(DeviceId(2), dscp(0), sample(1, 1));

        assert_eq!(cache.forget_device(DeviceId(1)), 2);
        assert!(cache.readings_for(DeviceId(1)).is_empty());
        assert_eq!(cache.readings_for(DeviceId(2)).len(), 1);
    }
}
