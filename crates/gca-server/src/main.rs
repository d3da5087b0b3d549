//! GCA energy-reporting server entry point (§4). Brings up a TOFU
//! registration phase, then the UDP ingest listener, TCP sync responder,
//! HTTP API and hourly ring-rotation task, tearing all of them down
//! together on Ctrl-C the way the ingest server does with `ctrl_c()`,
//! just fanned out across more than one listener via a shared
//! `CancellationToken`.

mod archive;
mod config;
mod metrics;
mod net;
mod persist;
mod shutdown;
mod state;
mod store;

use std::sync::Arc;
use std::time::Duration;

use clap::Parser;
use gca_core::keys::KeyPair;
use gca_core::timeslot;
use tokio::net::{TcpListener, UdpSocket};
use tracing::{error, info, warn};

use config::{Cli, Config};
use metrics::Metrics;
use shutdown::Shutdown;
use state::{AppState, Inner};
use store::gca_identity::RegisterGcaRequest;
use store::{AuthStore, DirectoryStore, GcaIdentity, ReportStore};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(std::env::var("RUST_LOG").unwrap_or_else(|_| "gca_server=info,tower_http=info".into()))
        .json()
        .init();

    let cli = Cli::parse();
    let config = Config::load(&cli.config)?.apply_cli(&cli);
    info!(version = env!("CARGO_PKG_VERSION"), data_dir = %config.data_dir.display(), "gca-server starting");

    std::fs::create_dir_all(&config.data_dir)?;

    let server_keys = load_or_create_server_keys(&config.data_dir.join("server-keys.dat"))?;
    info!(public_key = %hex::encode(server_keys.public_bytes()), "server identity ready");

    let temp_key_path = config.data_dir.join("gca.tempkey");
    if !temp_key_path.exists() {
        error!(
            path = %temp_key_path.display(),
            "missing gca.tempkey; place the preinstalled bootstrap public key there before starting"
        );
        anyhow::bail!("gca.tempkey not found at {}", temp_key_path.display());
    }
    let gca_identity = GcaIdentity::open(&temp_key_path, &config.data_dir.join("gca.pubkey"))?;

    let gca_public_key = match gca_identity.current() {
        Some(key) => key,
        None => await_gca_registration(&config, gca_identity, &server_keys).await?,
    };

    let auth_store = AuthStore::open(&config.data_dir.join("equipment-authorizations.dat"), gca_public_key)?;
    let report_store = ReportStore::open(&config.data_dir.join("reports"), timeslot::now())?;
    let directory_store = DirectoryStore::open(&config.data_dir.join("directory"), gca_public_key)?;
    let gca_identity = GcaIdentity::open(&temp_key_path, &config.data_dir.join("gca.pubkey"))?;

    let state = AppState(Arc::new(Inner {
        server_keys,
        gca_identity,
        auth_store,
        report_store,
        directory_store,
        metrics: Metrics::new(),
    }));

    let mut shutdown = Shutdown::new();
    let token = shutdown.token();

    let udp_socket = UdpSocket::bind(("0.0.0.0", config.udp_port)).await?;
    info!(port = config.udp_port, "udp ingest listening");
    {
        let state = state.clone();
        let token = token.clone();
        shutdown.spawn(async move { net::udp::run(udp_socket, state, token).await });
    }

    let tcp_listener = TcpListener::bind(("0.0.0.0", config.tcp_port)).await?;
    info!(port = config.tcp_port, "tcp sync listening");
    {
        let state = state.clone();
        let token = token.clone();
        shutdown.spawn(async move { net::tcp_sync::run(tcp_listener, state, token).await });
    }

    let http_listener = TcpListener::bind(("0.0.0.0", config.http_port)).await?;
    info!(port = config.http_port, "http api listening");
    {
        let router = net::http::router(state.clone());
        let token = token.clone();
        shutdown.spawn(async move {
            if let Err(e) = axum::serve(http_listener, router)
                .with_graceful_shutdown(async move { token.cancelled().await })
                .await
            {
                warn!(error = %e, "http server exited with error");
            }
        });
    }

    {
        let state = state.clone();
        let token = token.clone();
        let interval = Duration::from_secs(config.rotation_interval_secs);
        shutdown.spawn(async move { rotation_task(state, token, interval).await });
    }

    {
        let state = state.clone();
        let token = token.clone();
        let interval = Duration::from_secs(config.rotation_interval_secs);
        let data_dir = config.data_dir.clone();
        shutdown.spawn(async move { snapshot_task(state, token, interval, data_dir).await });
    }

    tokio::signal::ctrl_c().await.ok();
    info!("shutdown signal received");
    shutdown.shutdown().await;
    Ok(())
}

/// §4.3 background rotation: once per `interval`, check every known
/// device's ring and retire its oldest week once the ring has drifted
/// past the threshold (`ReportStore::rotate_if_due` is the no-op check).
async fn rotation_task(state: AppState, token: tokio_util::sync::CancellationToken, interval: Duration) {
    let mut ticker = tokio::time::interval(interval);
    loop {
        tokio::select! {
            _ = token.cancelled() => {
                info!("rotation task observed shutdown signal");
                break;
            }
            _ = ticker.tick() => {
                let now = timeslot::now();
                let short_ids: Vec<u32> = state.auth_store.all_active().iter().map(|a| a.short_id).collect();
                for short_id in short_ids {
                    if let Err(e) = state.report_store.rotate_if_due(short_id, now) {
                        warn!(error = %e, short_id, "ring rotation failed");
                        continue;
                    }
                    state.metrics.rotations.fetch_add(1, std::sync::atomic::Ordering::Relaxed);
                }
            }
        }
    }
}

/// §4.8 snapshot archive: once per `interval`, bundle every public file
/// into `snapshot.zip` in `data_dir`, read-consistent without locking
/// because every source file is append-only (`archive::write_snapshot`'s
/// doc comment explains why the ordering matters).
async fn snapshot_task(state: AppState, token: tokio_util::sync::CancellationToken, interval: Duration, data_dir: std::path::PathBuf) {
    let mut ticker = tokio::time::interval(interval);
    loop {
        tokio::select! {
            _ = token.cancelled() => {
                info!("snapshot task observed shutdown signal");
                break;
            }
            _ = ticker.tick() => {
                let now = timeslot::now().week_start().0;
                let stats = state.report_store.stats_for_offset(now);
                let device_stats: Vec<serde_json::Value> = stats
                    .into_iter()
                    .map(|(short_id, reports)| {
                        serde_json::json!({
                            "short_id": short_id,
                            "values": reports.iter().map(|r| r.power_output).collect::<Vec<_>>(),
                        })
                    })
                    .collect();
                let device_stats_json = serde_json::to_vec(&device_stats).unwrap_or_default();

                let reports_path = state.report_store.log_path();
                let auths_path = data_dir.join("equipment-authorizations.dat");
                let pubkey_path = data_dir.join("gca.pubkey");
                let servers_path = data_dir.join("directory").join("authorized-servers.dat");
                let out_path = data_dir.join("snapshot.zip");

                let inputs = archive::SnapshotInputs {
                    device_stats: &device_stats_json,
                    equipment_reports_path: &reports_path,
                    equipment_authorizations_path: &auths_path,
                    gca_pubkey_path: &pubkey_path,
                    authorized_servers_path: &servers_path,
                };
                if let Err(e) = archive::write_snapshot(&out_path, inputs) {
                    warn!(error = %e, "snapshot archive failed");
                }
            }
        }
    }
}

fn load_or_create_server_keys(path: &std::path::Path) -> anyhow::Result<KeyPair> {
    if path.exists() {
        Ok(KeyPair::load_client_keys(path)?)
    } else {
        let keys = KeyPair::generate();
        keys.save_client_keys(path)?;
        Ok(keys)
    }
}

/// Serves only `/api/v1/register-gca` until the one-shot TOFU handshake
/// completes, then hands back the now-known GCA public key so the rest
/// of the stores (which need it to verify signatures) can be opened.
async fn await_gca_registration(
    config: &Config,
    gca_identity: GcaIdentity,
    server_keys: &KeyPair,
) -> anyhow::Result<[u8; 32]> {
    use axum::extract::State as AxumState;
    use axum::http::StatusCode;
    use axum::response::IntoResponse;
    use axum::routing::post;
    use axum::{Json, Router};
    use serde::{Deserialize, Serialize};

    #[derive(Deserialize)]
    struct Body {
        gca_key: String,
        signature: String,
    }
    #[derive(Serialize)]
    struct Resp {
        server_public_key: String,
    }

    #[derive(Clone)]
    struct BootstrapState {
        identity: Arc<GcaIdentity>,
        server_public_key: [u8; 32],
    }

    async fn handler(AxumState(state): AxumState<BootstrapState>, Json(body): Json<Body>) -> impl IntoResponse {
        let Ok(gca_public_key) = net::http::parse_hex::<32>(&body.gca_key) else {
            return StatusCode::BAD_REQUEST.into_response();
        };
        let Ok(signature) = net::http::parse_hex::<64>(&body.signature) else {
            return StatusCode::BAD_REQUEST.into_response();
        };
        let request = RegisterGcaRequest { gca_public_key, signature };
        match state.identity.register(request) {
            Ok(_) => Json(Resp {
                server_public_key: hex::encode(state.server_public_key),
            })
            .into_response(),
            Err(gca_core::error::Error::GcaAlreadyRegistered) => StatusCode::CONFLICT.into_response(),
            Err(_) => StatusCode::FORBIDDEN.into_response(),
        }
    }

    let identity = Arc::new(gca_identity);
    let bootstrap_state = BootstrapState {
        identity: identity.clone(),
        server_public_key: server_keys.public_bytes(),
    };
    let router = Router::new()
        .route("/api/v1/register-gca", post(handler))
        .with_state(bootstrap_state);

    let listener = TcpListener::bind(("0.0.0.0", config.http_port)).await?;
    warn!(port = config.http_port, "gca not yet registered; serving register-gca only until it is");

    let token = tokio_util::sync::CancellationToken::new();
    let server_token = token.clone();
    let server = tokio::spawn(async move {
        let _ = axum::serve(listener, router)
            .with_graceful_shutdown(async move { server_token.cancelled().await })
            .await;
    });

    let mut poll = tokio::time::interval(Duration::from_millis(500));
    let gca_public_key = loop {
        poll.tick().await;
        if let Some(key) = identity.current() {
            break key;
        }
    };

    token.cancel();
    let _ = server.await;
    info!("gca registered, proceeding to full startup");
    Ok(gca_public_key)
}
