/**
 * RIC KERNEL - Point d'entrée du contrôleur
 *
 * RÔLE : Bootstrap complet : config, politique initiale, purge du registre,
 * boucle de contrôle, API d'observabilité, health MQTT, canal de contrôle.
 * Seul l'échec du bind du canal de contrôle termine le processus.
 */

use anyhow::Context;
use ric_kernel::config::load_config;
use ric_kernel::registry::DeviceRegistry;
use ric_kernel::scheduler::ControlLoop;
use ric_kernel::{http, server, Kernel};
use tokio::net::TcpListener;
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Charger les variables d'environnement depuis .env (si présent)
    dotenvy::dotenv().ok();

    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("ric_kernel=info")))
        .init();

    let config = load_config().await;
    let kernel = Kernel::new(config);

    if let Err(e) = kernel.apply_bootstrap_policy() {
        warn!("[kernel] bootstrap policy rejected: {}", e);
    }

    // purge des WTP disparus
    DeviceRegistry::start_purge_monitor(
        kernel.registry.clone(),
        kernel.telemetry.clone(),
        kernel.config.purge_grace(),
        kernel.config.sweep_period(),
    );

    // bind avant de démarrer quoi que ce soit d'autre : échec = arrêt
    let listener = server::bind(kernel.config.control.listen)
        .await
        .with_context(|| format!("cannot bind control channel on {}", kernel.config.control.listen))?;

    let control = ControlLoop::spawn(kernel.control.clone(), kernel.config.tick_period());

    if let Some(mqtt) = kernel.config.mqtt.clone() {
        kernel.health.spawn_health_publisher(kernel.clone(), mqtt);
    }

    if let Some(http_conf) = kernel.config.http.clone() {
        let app = http::build_router(kernel.clone());
        match TcpListener::bind(http_conf.listen).await {
            Ok(http_listener) => {
                info!("[kernel] observability API on http://{}", http_conf.listen);
                tokio::spawn(async move {
                    if let Err(e) = axum::serve(http_listener, app).await {
                        error!("[kernel] observability API stopped: {}", e);
                    }
                });
            }
            Err(e) => warn!("[kernel] observability API disabled, bind failed: {}", e),
        }
    }

    tokio::select! {
        _ = server::serve(listener, kernel.clone()) => {}
        _ = tokio::signal::ctrl_c() => info!("[kernel] shutting down"),
    }
    control.shutdown().await;
    Ok(())
}
