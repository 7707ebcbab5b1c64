use std::net::IpAddr;
use axum::{
    extract::{Path, Query, State},
    http::StatusCode,
    routing::get,
    Json, Router,
};
use chrono::{DateTime, Utc};
use serde::Deserialize;
use crate::store_manager::StoreHandle;
use shared::protocol::API_PREFIX;
use shared::types::{HostRecord, Liveness, PortState, Protocol, ServiceKey, ServiceRecord};

#[derive(Clone)]
pub struct AppState {
    pub store: StoreHandle,
}

#[derive(Deserialize)]
pub struct HostQuery {
    pub liveness: Option<Liveness>,
}

#[derive(Deserialize)]
pub struct ServiceQuery {
    pub state: Option<PortState>,
}

/// Read-only inventory API. Check timestamps still holding a claim lease are
/// reported as null.
pub fn router(state: AppState) -> Router {
    Router::new()
        .route(&format!("{API_PREFIX}/hosts"), get(get_hosts))
        .route(&format!("{API_PREFIX}/hosts/:address"), get(get_host))
        .route(&format!("{API_PREFIX}/hosts/:address/services"), get(get_host_services))
        .route(&format!("{API_PREFIX}/services"), get(get_services))
        .route(&format!("{API_PREFIX}/services/:address/:protocol/:port"), get(get_service))
        .with_state(state)
}

async fn get_hosts(
    State(state): State<AppState>,
    Query(params): Query<HostQuery>,
) -> Result<Json<Vec<HostRecord>>, StatusCode> {
    state
        .store
        .hosts(params.liveness)
        .await
        .map(|hosts| Json(hosts.into_iter().map(settled_host).collect()))
        .map_err(|e| {
            tracing::error!("Failed to query hosts: {}", e);
            StatusCode::INTERNAL_SERVER_ERROR
        })
}

async fn get_host(
    State(state): State<AppState>,
    Path(address): Path<String>,
) -> Result<Json<HostRecord>, StatusCode> {
    let address = parse_address(&address)?;
    state
        .store
        .get_host(address)
        .await
        .map_err(|e| {
            tracing::error!("Failed to query host {}: {}", address, e);
            StatusCode::INTERNAL_SERVER_ERROR
        })?
        .map(|host| Json(settled_host(host)))
        .ok_or(StatusCode::NOT_FOUND)
}

async fn get_host_services(
    State(state): State<AppState>,
    Path(address): Path<String>,
) -> Result<Json<Vec<ServiceRecord>>, StatusCode> {
    let address = parse_address(&address)?;
    state
        .store
        .services(Some(address), None)
        .await
        .map(settled_services)
        .map_err(|e| {
            tracing::error!("Failed to query services of {}: {}", address, e);
            StatusCode::INTERNAL_SERVER_ERROR
        })
}

async fn get_services(
    State(state): State<AppState>,
    Query(params): Query<ServiceQuery>,
) -> Result<Json<Vec<ServiceRecord>>, StatusCode> {
    state
        .store
        .services(None, params.state)
        .await
        .map(settled_services)
        .map_err(|e| {
            tracing::error!("Failed to query services: {}", e);
            StatusCode::INTERNAL_SERVER_ERROR
        })
}

async fn get_service(
    State(state): State<AppState>,
    Path((address, protocol, port)): Path<(String, String, u16)>,
) -> Result<Json<ServiceRecord>, StatusCode> {
    let protocol: Protocol = protocol.parse().map_err(|_| StatusCode::BAD_REQUEST)?;
    let key = ServiceKey::new(parse_address(&address)?, port, protocol);
    state
        .store
        .get_service(key)
        .await
        .map_err(|e| {
            tracing::error!("Failed to query service {}: {}", key, e);
            StatusCode::INTERNAL_SERVER_ERROR
        })?
        .map(|service| Json(settled_service(service)))
        .ok_or(StatusCode::NOT_FOUND)
}

fn parse_address(raw: &str) -> Result<IpAddr, StatusCode> {
    raw.parse().map_err(|_| StatusCode::BAD_REQUEST)
}

/// A timestamp later than now is a claim lease held by a running or failed
/// check, not an observation. Responses report it as never checked.
fn observed(at: Option<DateTime<Utc>>) -> Option<DateTime<Utc>> {
    at.filter(|at| *at <= Utc::now())
}

fn settled_host(host: HostRecord) -> HostRecord {
    HostRecord {
        liveness_checked_at: observed(host.liveness_checked_at),
        ports_checked_at: observed(host.ports_checked_at),
        ..host
    }
}

fn settled_service(service: ServiceRecord) -> ServiceRecord {
    ServiceRecord {
        observed_at: observed(service.observed_at),
        ..service
    }
}

fn settled_services(services: Vec<ServiceRecord>) -> Json<Vec<ServiceRecord>> {
    Json(services.into_iter().map(settled_service).collect())
}
