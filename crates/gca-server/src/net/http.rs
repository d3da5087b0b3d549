//! §4.5 HTTP API: JSON over HTTP, keys/signatures hex-encoded, numeric
//! fields plain JSON integers in base units. Built the same way as the
//! ingest server's router — `axum::Router` with a shared `AppState`,
//! `tower_http::TraceLayer` for request logging — just with this
//! protocol's seven endpoints instead of one.

use std::sync::atomic::Ordering;

use axum::extract::{Query, State};
use axum::http::StatusCode;
use axum::response::IntoResponse;
use axum::routing::{get, post};
use axum::{Json, Router};
use serde::{Deserialize, Serialize};
use tower::ServiceBuilder;
use tower_http::trace::TraceLayer;
use tracing::instrument;

use gca_core::error::Error;
use gca_core::timeslot;
use gca_core::wire::auth::EquipmentAuthorization;
use gca_core::wire::migration::EquipmentMigration;
use gca_core::wire::server::AuthorizedServer;

use crate::state::AppState;
use crate::store::gca_identity::RegisterGcaRequest;

pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/api/v1/register-gca", post(register_gca))
        .route("/api/v1/authorize-equipment", post(authorize_equipment))
        .route("/api/v1/authorized-servers", post(authorized_servers).get(list_authorized_servers))
        .route("/api/v1/equipment-migrate", post(equipment_migrate).get(pending_migration))
        .route("/api/v1/recent-reports", get(recent_reports))
        .route("/api/v1/all-device-stats", get(all_device_stats))
        .route("/api/v1/equipment", get(equipment))
        .route("/metrics", get(metrics))
        .with_state(state)
        .layer(ServiceBuilder::new().layer(TraceLayer::new_for_http()))
}

fn error_status(e: &Error) -> StatusCode {
    match e {
        Error::BadSignature | Error::UnknownEquipment | Error::BannedEquipment => StatusCode::FORBIDDEN,
        Error::GcaAlreadyRegistered => StatusCode::CONFLICT,
        Error::MalformedInput | Error::SlotOutOfRange => StatusCode::BAD_REQUEST,
        Error::IoFailure(_) => StatusCode::INTERNAL_SERVER_ERROR,
        _ => StatusCode::BAD_REQUEST,
    }
}

pub(crate) fn parse_hex<const N: usize>(s: &str) -> Result<[u8; N], StatusCode> {
    let bytes = hex::decode(s).map_err(|_| StatusCode::BAD_REQUEST)?;
    bytes.try_into().map_err(|_| StatusCode::BAD_REQUEST)
}

// ---- register-gca ----------------------------------------------------

#[derive(Deserialize)]
struct RegisterGcaBody {
    gca_key: String,
    signature: String,
}

#[derive(Serialize)]
struct RegisterGcaResponse {
    server_public_key: String,
}

#[instrument(skip_all)]
async fn register_gca(State(state): State<AppState>, Json(body): Json<RegisterGcaBody>) -> impl IntoResponse {
    state.metrics.http_requests.fetch_add(1, Ordering::Relaxed);
    let gca_public_key = match parse_hex::<32>(&body.gca_key) {
        Ok(k) => k,
        Err(status) => return status.into_response(),
    };
    let signature = match parse_hex::<64>(&body.signature) {
        Ok(s) => s,
        Err(status) => return status.into_response(),
    };

    let request = RegisterGcaRequest { gca_public_key, signature };
    match state.gca_identity.register(request) {
        Ok(_) => Json(RegisterGcaResponse {
            server_public_key: hex::encode(state.server_keys.public_bytes()),
        })
        .into_response(),
        Err(e) => error_status(&e).into_response(),
    }
}

// ---- authorize-equipment ----------------------------------------------

#[derive(Deserialize)]
struct AuthorizeEquipmentBody {
    short_id: u32,
    public_key: String,
    latitude: i32,
    longitude: i32,
    capacity: u64,
    debt: u64,
    expiration: u32,
    signature: String,
}

#[instrument(skip_all)]
async fn authorize_equipment(
    State(state): State<AppState>,
    Json(body): Json<AuthorizeEquipmentBody>,
) -> impl IntoResponse {
    state.metrics.http_requests.fetch_add(1, Ordering::Relaxed);
    let public_key = match parse_hex::<32>(&body.public_key) {
        Ok(k) => k,
        Err(status) => return status.into_response(),
    };
    let signature = match parse_hex::<64>(&body.signature) {
        Ok(s) => s,
        Err(status) => return status.into_response(),
    };
    let auth = EquipmentAuthorization {
        short_id: body.short_id,
        public_key,
        latitude: body.latitude,
        longitude: body.longitude,
        capacity: body.capacity,
        debt: body.debt,
        expiration: body.expiration,
        signature,
    };
    match state.auth_store.authorize(auth, timeslot::now()) {
        Ok(()) => {
            state.metrics.auths_accepted.fetch_add(1, Ordering::Relaxed);
            StatusCode::OK.into_response()
        }
        Err(e) => {
            if state.auth_store.is_public_key_banned(&public_key) {
                state.metrics.auths_banned.fetch_add(1, Ordering::Relaxed);
            } else {
                state.metrics.auths_rejected.fetch_add(1, Ordering::Relaxed);
            }
            error_status(&e).into_response()
        }
    }
}

// ---- authorized-servers -------------------------------------------------

#[derive(Deserialize, Serialize)]
struct AuthorizedServerBody {
    public_key: String,
    banned: bool,
    location: String,
    http_port: u16,
    tcp_port: u16,
    udp_port: u16,
    gca_authorization: String,
}

impl AuthorizedServerBody {
    fn into_wire(self) -> Result<AuthorizedServer, StatusCode> {
        Ok(AuthorizedServer {
            public_key: parse_hex::<32>(&self.public_key)?,
            banned: self.banned,
            location: self.location,
            http_port: self.http_port,
            tcp_port: self.tcp_port,
            udp_port: self.udp_port,
            gca_authorization: parse_hex::<64>(&self.gca_authorization)?,
        })
    }

    fn from_wire(s: AuthorizedServer) -> Self {
        AuthorizedServerBody {
            public_key: hex::encode(s.public_key),
            banned: s.banned,
            location: s.location,
            http_port: s.http_port,
            tcp_port: s.tcp_port,
            udp_port: s.udp_port,
            gca_authorization: hex::encode(s.gca_authorization),
        }
    }
}

#[derive(Serialize)]
struct AuthorizedServersListResponse {
    servers: Vec<AuthorizedServerBody>,
}

#[instrument(skip_all)]
async fn list_authorized_servers(State(state): State<AppState>) -> impl IntoResponse {
    state.metrics.http_requests.fetch_add(1, Ordering::Relaxed);
    let servers = state.directory_store.servers().into_iter().map(AuthorizedServerBody::from_wire).collect();
    Json(AuthorizedServersListResponse { servers })
}

#[instrument(skip_all)]
async fn authorized_servers(
    State(state): State<AppState>,
    Json(body): Json<AuthorizedServerBody>,
) -> impl IntoResponse {
    state.metrics.http_requests.fetch_add(1, Ordering::Relaxed);
    let server = match body.into_wire() {
        Ok(s) => s,
        Err(status) => return status.into_response(),
    };
    match state.directory_store.upsert_server(server) {
        Ok(()) => StatusCode::OK.into_response(),
        Err(e) => error_status(&e).into_response(),
    }
}

// ---- equipment-migrate --------------------------------------------------

#[derive(Deserialize)]
struct EquipmentMigrationBody {
    equipment_public_key: String,
    new_gca_public_key: String,
    new_short_id: u32,
    new_servers: Vec<AuthorizedServerBody>,
    signature: String,
}

#[instrument(skip_all)]
async fn equipment_migrate(
    State(state): State<AppState>,
    Json(body): Json<EquipmentMigrationBody>,
) -> impl IntoResponse {
    state.metrics.http_requests.fetch_add(1, Ordering::Relaxed);
    let equipment_public_key = match parse_hex::<32>(&body.equipment_public_key) {
        Ok(k) => k,
        Err(status) => return status.into_response(),
    };
    let new_gca_public_key = match parse_hex::<32>(&body.new_gca_public_key) {
        Ok(k) => k,
        Err(status) => return status.into_response(),
    };
    let signature = match parse_hex::<64>(&body.signature) {
        Ok(s) => s,
        Err(status) => return status.into_response(),
    };
    let mut new_servers = Vec::with_capacity(body.new_servers.len());
    for s in body.new_servers {
        match s.into_wire() {
            Ok(s) => new_servers.push(s),
            Err(status) => return status.into_response(),
        }
    }
    let migration = EquipmentMigration {
        equipment_public_key,
        new_gca_public_key,
        new_short_id: body.new_short_id,
        new_servers,
        signature,
    };
    match state.directory_store.record_migration(migration) {
        Ok(()) => StatusCode::OK.into_response(),
        Err(e) => error_status(&e).into_response(),
    }
}

#[derive(Deserialize)]
struct PendingMigrationQuery {
    #[serde(rename = "publicKey")]
    public_key: String,
}

#[derive(Serialize)]
struct MigrationDto {
    equipment_public_key: String,
    new_gca_public_key: String,
    new_short_id: u32,
    new_servers: Vec<AuthorizedServerBody>,
    signature: String,
}

#[derive(Serialize)]
struct PendingMigrationResponse {
    migration: Option<MigrationDto>,
}

/// §4.7 step 4: a device polls this for an order to move to a new GCA
/// and/or server set. Devices pick this up by their own public key, not
/// their (possibly about-to-change) ShortID.
#[instrument(skip_all)]
async fn pending_migration(State(state): State<AppState>, Query(q): Query<PendingMigrationQuery>) -> impl IntoResponse {
    state.metrics.http_requests.fetch_add(1, Ordering::Relaxed);
    let public_key = match parse_hex::<32>(&q.public_key) {
        Ok(k) => k,
        Err(status) => return status.into_response(),
    };
    let migration = state.directory_store.pending_migration(&public_key).map(|m| MigrationDto {
        equipment_public_key: hex::encode(m.equipment_public_key),
        new_gca_public_key: hex::encode(m.new_gca_public_key),
        new_short_id: m.new_short_id,
        new_servers: m.new_servers.into_iter().map(AuthorizedServerBody::from_wire).collect(),
        signature: hex::encode(m.signature),
    });
    Json(PendingMigrationResponse { migration }).into_response()
}

// ---- recent-reports -------------------------------------------------------

#[derive(Deserialize)]
struct RecentReportsQuery {
    #[serde(rename = "publicKey")]
    public_key: String,
}

#[derive(Serialize)]
struct ReportDto {
    timeslot: u32,
    power_output: u64,
    signature: String,
}

#[derive(Serialize)]
struct RecentReportsResponse {
    reports: Vec<ReportDto>,
    server_signature: String,
}

#[instrument(skip_all)]
async fn recent_reports(State(state): State<AppState>, Query(q): Query<RecentReportsQuery>) -> impl IntoResponse {
    state.metrics.http_requests.fetch_add(1, Ordering::Relaxed);
    let public_key = match parse_hex::<32>(&q.public_key) {
        Ok(k) => k,
        Err(status) => return status.into_response(),
    };
    let Some(short_id) = state.auth_store.short_id_for_public_key(&public_key) else {
        return StatusCode::FORBIDDEN.into_response();
    };
    let week = state.report_store.last_week(short_id).unwrap_or_default();
    let reports: Vec<ReportDto> = week
        .iter()
        .map(|r| ReportDto {
            timeslot: r.timeslot,
            power_output: r.power_output,
            signature: hex::encode(r.signature),
        })
        .collect();
    let body_bytes = serde_json::to_vec(&reports).unwrap_or_default();
    let server_signature = hex::encode(state.server_keys.sign(&body_bytes));
    Json(RecentReportsResponse { reports, server_signature }).into_response()
}

// ---- all-device-stats ------------------------------------------------------

#[derive(Deserialize)]
struct AllDeviceStatsQuery {
    timeslot_offset: u32,
}

#[derive(Serialize)]
struct DeviceStatsDto {
    short_id: u32,
    values: Vec<u64>,
}

#[derive(Serialize)]
struct AllDeviceStatsResponse {
    devices: Vec<DeviceStatsDto>,
    server_signature: String,
}

#[instrument(skip_all)]
async fn all_device_stats(State(state): State<AppState>, Query(q): Query<AllDeviceStatsQuery>) -> impl IntoResponse {
    state.metrics.http_requests.fetch_add(1, Ordering::Relaxed);
    let stats = state.report_store.stats_for_offset(q.timeslot_offset);
    let devices: Vec<DeviceStatsDto> = stats
        .into_iter()
        .map(|(short_id, reports)| DeviceStatsDto {
            short_id,
            values: reports.iter().map(|r| r.power_output).collect(),
        })
        .collect();
    let body_bytes = serde_json::to_vec(&devices).unwrap_or_default();
    let server_signature = hex::encode(state.server_keys.sign(&body_bytes));
    Json(AllDeviceStatsResponse { devices, server_signature })
}

// ---- equipment --------------------------------------------------------

#[derive(Serialize)]
struct AuthorizationDto {
    short_id: u32,
    public_key: String,
    latitude: i32,
    longitude: i32,
    capacity: u64,
    debt: u64,
    expiration: u32,
    signature: String,
}

#[derive(Serialize)]
struct EquipmentResponse {
    authorizations: Vec<AuthorizationDto>,
    server_signature: String,
}

#[instrument(skip_all)]
async fn equipment(State(state): State<AppState>) -> impl IntoResponse {
    state.metrics.http_requests.fetch_add(1, Ordering::Relaxed);
    let authorizations: Vec<AuthorizationDto> = state
        .auth_store
        .all_active()
        .iter()
        .map(|a| AuthorizationDto {
            short_id: a.short_id,
            public_key: hex::encode(a.public_key),
            latitude: a.latitude,
            longitude: a.longitude,
            capacity: a.capacity,
            debt: a.debt,
            expiration: a.expiration,
            signature: hex::encode(a.signature),
        })
        .collect();
    let body_bytes = serde_json::to_vec(&authorizations).unwrap_or_default();
    let server_signature = hex::encode(state.server_keys.sign(&body_bytes));
    Json(EquipmentResponse {
        authorizations,
        server_signature,
    })
}

// ---- metrics ------------------------------------------------------------

#[instrument(skip_all)]
async fn metrics(State(state): State<AppState>) -> impl IntoResponse {
    Json(state.metrics.snapshot())
}
