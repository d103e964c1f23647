/*!
Constructeurs de messages et de politiques pour les tests du contrôleur
*/

use ric_kernel::models::{Dscp, Element, ElementKind, WtpAddr};
use ric_kernel::slices::SlicePolicy;
use ric_kernel::wire::{AgentMessage, DscpMapEntry};

pub struct WireMessageBuilder;

impl WireMessageBuilder {
    /// Adresse de test déterministe : 02:00:00:00:00:<n>
    pub fn addr(n: u8) -> WtpAddr {
        WtpAddr([0x02, 0, 0, 0, 0, n])
    }

    pub fn elements(kinds: &[ElementKind]) -> Vec<Element> {
        kinds.iter().map(|k| Element::new(*k, 1)).collect()
    }

    /// Les trois éléments : DSCP-Stat, règles de trafic, quantum de slice
    pub fn full_elements() -> Vec<Element> {
        Self::elements(&[ElementKind::DscpStats, ElementKind::TrafficRules, ElementKind::SliceQuantum])
    }

    pub fn hello(addr: WtpAddr, elements: Vec<Element>) -> AgentMessage {
        AgentMessage::Hello { addr, elements, capacity: None }
    }

    /// Rapport DSCP ; codes hors 0..=63 ignorés
    pub fn report(window_ms: u64, entries: &[(u8, u64, u64)]) -> AgentMessage {
        let entries = entries
            .iter()
            .filter_map(|&(code, packets, bytes)| {
                let code = Dscp::new(code)?;
                let avg_packet_size = if packets > 0 { (bytes / packets) as u32 } else { 0 };
                Some(DscpMapEntry { code, packets, bytes, avg_packet_size })
            })
            .collect();
        AgentMessage::TelemetryReport { window_ms, entries }
    }
}

/// Politique de slice admettant les classes données
pub fn slice_policy(min_share: u32, max_share: u32, priority: u8, classes: &[u8]) -> SlicePolicy {
    SlicePolicy::new(min_share, max_share, priority).admitting(classes.iter().filter_map(|c| Dscp::new(*c)))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_report_builder() {
        let msg = WireMessageBuilder::report(500, &[(10, 4, 4000), (99, 1, 1)]);
        match msg {
            AgentMessage::TelemetryReport { window_ms, entries } => {
                assert_eq!(window_ms, 500);
                assert_eq!(entries.len(), 1);
                assert_eq!(entries[0].avg_packet_size, 1000);
            }
            other => panic!("unexpected {:?}", other),
        }
    }

    #[test]
    fn test_slice_policy_builder() {
        let policy = slice_policy(1000, 4000, 2, &[10, 46, 64]);
        assert_eq!(policy.classes.len(), 2);
        assert_eq!(WireMessageBuilder::addr(7).to_string(), "02:00:00:00:00:07");
    }
}
