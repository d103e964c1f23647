/**
 * API D'OBSERVABILITÉ - Serveur HTTP en lecture seule du contrôleur
 *
 * RÔLE :
 * Expose l'état courant du contrôleur aux outils d'exploitation : WTP actifs,
 * dernière télémétrie par classe avec indicateur de fraîcheur, slices, règles,
 * compteurs de la boucle de contrôle.
 *
 * FONCTIONNEMENT :
 * - routes GET uniquement : /health, /system/health, /devices, /devices/{id},
 *   /devices/{id}/telemetry, /slices, /rules
 * - aucune mutation : la politique passe par l'interface de la table de slices
 * - sérialisation JSON des vues, 404 sur WTP inconnu
 */

use crate::health::KernelHealth;
use crate::models::{ConnectionState, DeviceId, Element};
use crate::registry::Device;
use crate::slices::{Slice, TrafficRule};
use crate::state::Kernel;
use crate::telemetry::ClassView;
use axum::extract::{Path, State};
use axum::http::StatusCode;
use axum::routing::get;
use axum::{Json, Router};
use serde::{Deserialize, Serialize};
use time::format_description::well_known::Rfc3339;

#[derive(Serialize)]
pub struct DeviceView {
    pub id: DeviceId,
    pub addr: String,
    pub state: ConnectionState,
    pub elements: Vec<Element>,
    pub capacity: u32,
    pub last_seen: String,
    pub idle_ms: u64,
    /// true si aucun trafic depuis plus longtemps que la borne de fraîcheur
    pub stale: bool,
}

fn to_view(device: &Device, kernel: &Kernel) -> DeviceView {
    let idle = device.idle_for();
    DeviceView {
        id: device.id,
        addr: device.addr.to_string(),
        state: device.state,
        elements: device.elements.clone(),
        capacity: device.capacity,
        last_seen: device.last_seen.format(&Rfc3339).unwrap_or_default(),
        idle_ms: idle.as_millis() as u64,
        stale: idle > kernel.telemetry.freshness(),
    }
}

#[derive(Debug, Deserialize)]
struct DeviceFilter {
    #[serde(default)]
    all: bool,
}

pub fn build_router(kernel: Kernel) -> Router {
    Router::new()
        .route("/health", get(|| async { "ok" }))
        .route("/system/health", get(get_system_health))
        .route("/devices", get(list_devices))
        .route("/devices/{id}", get(get_device))
        .route("/devices/{id}/telemetry", get(get_device_telemetry))
        .route("/slices", get(list_slices))
        .route("/rules", get(list_rules))
        .with_state(kernel)
}

// GET /devices (actifs ; ?all=true pour tous les WTP connus)
async fn list_devices(
    State(kernel): State<Kernel>,
    axum::extract::Query(filter): axum::extract::Query<DeviceFilter>,
) -> Json<Vec<DeviceView>> {
    let devices = if filter.all { kernel.registry.list_devices() } else { kernel.registry.active_devices() };
    Json(devices.iter().map(|d| to_view(d, &kernel)).collect())
}

// GET /devices/{id}
async fn get_device(State(kernel): State<Kernel>, Path(id): Path<u32>) -> Result<Json<DeviceView>, StatusCode> {
    let device = kernel.registry.lookup(DeviceId(id)).ok_or(StatusCode::NOT_FOUND)?;
    Ok(Json(to_view(&device, &kernel)))
}

// GET /devices/{id}/telemetry (dernier échantillon par classe + fraîcheur)
async fn get_device_telemetry(
    State(kernel): State<Kernel>,
    Path(id): Path<u32>,
) -> Result<Json<Vec<ClassView>>, StatusCode> {
    let id = DeviceId(id);
    if kernel.registry.lookup(id).is_none() {
        return Err(StatusCode::NOT_FOUND);
    }
    Ok(Json(kernel.telemetry.views_for(id)))
}

async fn list_slices(State(kernel): State<Kernel>) -> Json<Vec<Slice>> {
    Json(kernel.slices.list_slices())
}

async fn list_rules(State(kernel): State<Kernel>) -> Json<Vec<TrafficRule>> {
    Json(kernel.slices.list_rules())
}

// GET /system/health (compteurs de la boucle, sessions, MQTT)
async fn get_system_health(State(kernel): State<Kernel>) -> Json<KernelHealth> {
    Json(kernel.health.get_health(&kernel))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::KernelConfig;
    use crate::models::{Element, ElementKind, WtpAddr};

    #[tokio::test]
    async fn test_device_views_and_not_found() {
        let kernel = Kernel::new(KernelConfig::default());
        let reg = kernel.registry.register(WtpAddr([0, 1, 2, 3, 4, 5]), vec![Element::new(ElementKind::DscpStats, 1)], None);
        kernel.registry.activate(reg.id, reg.epoch);

        let Json(list) = list_devices(State(kernel.clone()), axum::extract::Query(DeviceFilter { all: false })).await;
        assert_eq!(list.len(), 1);
        assert_eq!(list[0].addr, "00:01:02:03:04:05");
        assert!(!list[0].stale);

        let missing = get_device(State(kernel.clone()), Path(999)).await;
        assert_eq!(missing.err(), Some(StatusCode::NOT_FOUND));
        let Json(telemetry) = get_device_telemetry(State(kernel), Path(reg.id.0)).await.unwrap();
        assert!(telemetry.is_empty());
    }
}
