//! §4.6 client reporting loop: once per tick, read the CSV, bin rows to
//! timeslots, save them into history (write-once), transmit anything
//! newer than the last-sent high-water mark by UDP, and every
//! `ticks_per_sync` ticks kick off a sync cycle (§4.7).

use std::path::PathBuf;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Mutex;
use std::time::Duration;

use gca_core::wire::report::EquipmentReport;
use tokio::net::UdpSocket;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use crate::config::Config;
use crate::csv_source;
use crate::directory::ClientState;
use crate::history::{HistoryFile, SaveOutcome};
use crate::identity::{CtSettings, Identity};
use crate::sync;
use crate::watchdog::Watchdog;

pub struct ReportingLoop {
    config: Config,
    identity: Identity,
    state: ClientState,
    history: Mutex<HistoryFile>,
    ct_settings: CtSettings,
    watchdog: Watchdog,
    udp_socket: UdpSocket,
    http_client: reqwest::Client,
    /// §4.6 step 3's high-water mark: the lowest slot not yet
    /// transmitted. `0` means nothing has been sent yet. Slots below
    /// this are assumed already on the primary server (or will be
    /// reconciled by the next sync's gap-fill).
    next_unsent_slot: AtomicU32,
}

impl ReportingLoop {
    pub async fn new(
        config: Config,
        identity: Identity,
        state: ClientState,
        history: HistoryFile,
        ct_settings: CtSettings,
    ) -> std::io::Result<Self> {
        let udp_socket = UdpSocket::bind(("0.0.0.0", 0)).await?;
        let watchdog = Watchdog::new(&config.data_dir);
        Ok(ReportingLoop {
            config,
            identity,
            state,
            history: Mutex::new(history),
            ct_settings,
            watchdog,
            udp_socket,
            http_client: reqwest::Client::new(),
            next_unsent_slot: AtomicU32::new(0),
        })
    }

    /// Runs until `token` is cancelled. Never returns an error: every
    /// failure on this path is absorbed per §7 ("client sync treats
    /// `ServerUnreachable`/`StaleResponse` as try-next-server"), except
    /// history-file I/O failure, which is fatal and triggers a restart
    /// request rather than propagating out of the loop.
    pub async fn run(self, token: CancellationToken) {
        let tick_period = self.config.tick_period();
        let ticks_per_sync = self.config.ticks_per_sync();
        let mut tick_count: u64 = self.config.initial_tick_bias();

        let mut ticker = tokio::time::interval(tick_period);
        loop {
            tokio::select! {
                _ = token.cancelled() => {
                    info!("reporting loop observed shutdown signal");
                    break;
                }
                _ = ticker.tick() => {
                    self.tick().await;
                    tick_count += 1;
                    if tick_count % ticks_per_sync == 0 {
                        self.run_sync_cycle().await;
                    }
                    if let Err(e) = self.watchdog.check(Duration::from_secs(self.config.watchdog_timeout_secs)) {
                        warn!(error = %e, "watchdog check failed");
                    }
                }
            }
        }
    }

    /// §4.6 steps 1-3: parse the CSV, save new readings into history,
    /// and transmit anything past the high-water mark.
    async fn tick(&self) {
        let contents = match std::fs::read_to_string(&self.config.csv_path) {
            Ok(c) => c,
            Err(e) => {
                warn!(error = %e, path = %self.config.csv_path.display(), "failed to read energy csv this tick");
                return;
            }
        };
        let rows = csv_source::parse(&contents);

        let mut to_send: Vec<(u32, u32)> = Vec::new();
        {
            let mut history = self.history.lock().expect("history mutex poisoned");
            for row in rows {
                let (slot, value) = csv_source::slot_and_value(row, self.ct_settings.multiplier, self.ct_settings.divider);
                if value < 3 {
                    continue;
                }
                match history.save_reading(slot.0, value) {
                    Ok(SaveOutcome::Stored) => to_send.push((slot.0, value)),
                    Ok(SaveOutcome::NoOp) => {}
                    Ok(SaveOutcome::Conflict) => {
                        warn!(slot = slot.0, value, "conflicting history write, skipping (will be banned upstream)");
                    }
                    Err(e) => {
                        warn!(error = %e, "history file io failure, requesting restart");
                        if let Err(e) = self.watchdog.request_restart_now("history io failure") {
                            warn!(error = %e, "failed to write restart-request marker");
                        }
                        return;
                    }
                }
            }
        }

        to_send.sort_by_key(|(slot, _)| *slot);
        let next_unsent = self.next_unsent_slot.load(Ordering::Relaxed);
        let short_id = self.state.short_id();
        let Some(server) = self.state.pick_primary() else {
            warn!("no non-banned server available, skipping this tick's transmission");
            return;
        };

        for (slot, value) in to_send {
            if slot < next_unsent {
                continue;
            }
            let report = EquipmentReport::new_signed(short_id, slot, value as u64, &self.identity.keys);
            let addr = ("127.0.0.1", server.udp_port);
            if let Err(e) = self.udp_socket.send_to(&report.to_bytes(), addr).await {
                warn!(error = %e, slot, "udp send failed");
                continue;
            }
            self.next_unsent_slot.store(slot + 1, Ordering::Relaxed);
            // §4.6 step 3: sleep between packets to avoid saturating
            // cellular uplinks.
            tokio::time::sleep(Duration::from_millis(1)).await;
        }
    }

    /// §4.7: pick a fresh primary, gap-fill via the bitfield sync, then
    /// refresh the server directory and apply any pending migration.
    async fn run_sync_cycle(&self) {
        match sync::run_sync(&self.identity, &self.state, &self.history, &self.http_client, &self.udp_socket).await {
            Ok(outcome) => {
                info!(resent = outcome.resent, migrated = outcome.migrated, "sync cycle complete");
                if let Err(e) = self.watchdog.record_success() {
                    warn!(error = %e, "failed to record successful sync");
                }
            }
            Err(e) => {
                warn!(error = %e, "sync cycle failed");
            }
        }
    }

    pub fn csv_path(&self) -> PathBuf {
        self.config.csv_path.clone()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use gca_core::keys::KeyPair;
    use gca_core::signing::SigningBytes;
    use gca_core::timeslot::Timeslot;
    use gca_core::wire::server::AuthorizedServer;

    fn make_server(gca: &KeyPair, udp_port: u16) -> AuthorizedServer {
        let mut s = AuthorizedServer {
            public_key: KeyPair::generate().public_bytes(),
            banned: false,
            location: "dc1".to_string(),
            http_port: 0,
            tcp_port: 0,
            udp_port,
            gca_authorization: [0u8; 64],
        };
        s.gca_authorization = gca.sign(&s.signing_bytes());
        s
    }

    async fn build_loop(dir: &std::path::Path, csv_path: PathBuf, udp_port: u16) -> ReportingLoop {
        let gca = KeyPair::generate();
        crate::identity::write_gca_public_key(&dir.join("gcaPubKey.dat"), &gca.public_bytes()).unwrap();
        crate::identity::write_short_id(&dir.join("shortID.dat"), 1).unwrap();
        let state = ClientState::open(dir).unwrap();
        state.merge_servers(vec![make_server(&gca, udp_port)]).unwrap();

        let identity = Identity::load_or_create(&dir.join("clientKeys.dat")).unwrap();
        let history = HistoryFile::open(&dir.join("history.dat"), Timeslot(0)).unwrap();
        let mut config = Config::default();
        config.data_dir = dir.to_path_buf();
        config.csv_path = csv_path;
        ReportingLoop::new(config, identity, state, history, CtSettings::default())
            .await
            .unwrap()
    }

    #[tokio::test]
    async fn tick_saves_and_sends_a_fresh_reading() {
        gca_core::timeslot::set_test_timeslot(Some(0));
        let dir = tempfile::tempdir().unwrap();
        let csv_path = dir.path().join("energy.csv");
        let unix = gca_core::timeslot::GENESIS_UNIX_SECS;
        std::fs::write(&csv_path, format!("{unix},3000\n")).unwrap();

        let listener = UdpSocket::bind(("127.0.0.1", 0)).await.unwrap();
        let udp_port = listener.local_addr().unwrap().port();

        let report_loop = build_loop(dir.path(), csv_path, udp_port).await;
        report_loop.tick().await;

        let mut buf = [0u8; 80];
        let (n, _) = tokio::time::timeout(Duration::from_secs(1), listener.recv_from(&mut buf))
            .await
            .expect("expected a udp packet")
            .unwrap();
        assert_eq!(n, 80);
        let report = EquipmentReport::from_bytes(&buf[..n]).unwrap();
        assert_eq!(report.timeslot, 0);
        assert_eq!(report.power_output, 2999);

        gca_core::timeslot::set_test_timeslot(None);
    }

    #[tokio::test]
    async fn tick_does_not_resend_an_already_transmitted_slot() {
        gca_core::timeslot::set_test_timeslot(Some(0));
        let dir = tempfile::tempdir().unwrap();
        let csv_path = dir.path().join("energy.csv");
        let unix = gca_core::timeslot::GENESIS_UNIX_SECS;
        std::fs::write(&csv_path, format!("{unix},3000\n")).unwrap();

        let listener = UdpSocket::bind(("127.0.0.1", 0)).await.unwrap();
        let udp_port = listener.local_addr().unwrap().port();
        let report_loop = build_loop(dir.path(), csv_path, udp_port).await;

        report_loop.tick().await;
        let mut buf = [0u8; 80];
        tokio::time::timeout(Duration::from_secs(1), listener.recv_from(&mut buf)).await.unwrap().unwrap();

        report_loop.tick().await;
        assert!(tokio::time::timeout(Duration::from_millis(100), listener.recv_from(&mut buf))
            .await
            .is_err());

        gca_core::timeslot::set_test_timeslot(None);
    }
}
