//! GCA energy-reporting client entry point (§4.6/§4.7). Loads identity,
//! GCA directory and history, then runs the tick-driven reporting loop
//! until Ctrl-C, mirroring the server's single-`CancellationToken`
//! shutdown story but with one task instead of several.

mod config;
mod csv_source;
mod directory;
mod history;
mod identity;
mod reporting;
mod sync;
mod watchdog;

use clap::Parser;
use gca_core::timeslot;
use tracing::info;

use config::{Cli, Config};
use directory::ClientState;
use history::HistoryFile;
use identity::{CtSettings, Identity};
use reporting::ReportingLoop;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(std::env::var("RUST_LOG").unwrap_or_else(|_| "gca_client=info".into()))
        .json()
        .init();

    let cli = Cli::parse();
    let config = Config::load(&cli.config)?.apply_cli(&cli);
    info!(
        version = env!("CARGO_PKG_VERSION"),
        data_dir = %config.data_dir.display(),
        csv_path = %config.csv_path.display(),
        "gca-client starting"
    );

    std::fs::create_dir_all(&config.data_dir)?;

    // §4.6 startup: keypair, GCA public key, server directory and
    // ShortID are all fatal if missing/malformed except the keypair,
    // which self-bootstraps on first run.
    let identity = Identity::load_or_create(&config.data_dir.join("clientKeys.dat"))?;
    let state = ClientState::open(&config.data_dir)?;

    let history = HistoryFile::open(&config.data_dir.join("history.dat"), timeslot::now())?;

    // §4.6: optional ct-settings.txt; present-but-malformed is fatal,
    // absent falls back to the 1000/1000 default.
    let ct_settings = CtSettings::load(&CtSettings::default_path(&config.data_dir))?;

    info!(
        public_key = %hex::encode(identity.keys.public_bytes()),
        short_id = state.short_id(),
        gca_public_key = %hex::encode(state.gca_public_key()),
        servers = state.servers().len(),
        "client identity ready"
    );

    let report_loop = ReportingLoop::new(config, identity, state, history, ct_settings).await?;

    let token = tokio_util::sync::CancellationToken::new();
    let run_token = token.clone();
    let handle = tokio::spawn(async move { report_loop.run(run_token).await });

    tokio::signal::ctrl_c().await.ok();
    info!("shutdown signal received");
    token.cancel();
    handle.await.ok();
    Ok(())
}
