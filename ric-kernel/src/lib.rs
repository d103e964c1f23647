/**
 * RIC KERNEL - Cœur du contrôleur RAN quasi temps réel avec slicing QoS
 *
 * RÔLE : Sessions des agents WTP, registre des WTP, cache de télémétrie DSCP,
 * table de slices (interface de politique), moteur de slicing et boucle de
 * contrôle périodique qui diffuse les commandes d'enforcement.
 *
 * ARCHITECTURE : stores synchrones derrière des verrous internes, une tâche
 * tokio par session agent, une tâche périodique pour la boucle de contrôle.
 */

pub mod autoslice;
pub mod config;
pub mod dispatcher;
pub mod engine;
pub mod health;
pub mod http;
pub mod models;
pub mod registry;
pub mod scheduler;
pub mod server;
pub mod session;
pub mod slices;
pub mod state;
pub mod telemetry;
pub mod wire;

pub use state::Kernel;
