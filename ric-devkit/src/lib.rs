/*!
# RIC DevKit - Agents simulés et utilitaires de test

Bibliothèque facilitant les tests du contrôleur avec:
- Agent WTP simulé sur flux mémoire (sans réseau)
- Constructeurs de messages du canal de contrôle et de politiques
- Harness de bout en bout autour d'un `Kernel` réel
*/

pub mod builders;
pub mod mock_agent;
pub mod test_utils;

pub use builders::{slice_policy, WireMessageBuilder};
pub use mock_agent::MockAgent;
pub use test_utils::TestHarness;
