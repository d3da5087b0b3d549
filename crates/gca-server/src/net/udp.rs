//! §4.3 / §6 UDP listener: fixed 80-byte datagrams only; anything else
//! is dropped and counted. Suspension point is the socket read itself,
//! unblocked on shutdown by racing it against the cancellation token
//! rather than by closing the socket out from under the task (UDP
//! sockets in tokio don't support that the way a TCP listener's accept
//! loop would).

use std::sync::atomic::Ordering;

use gca_core::timeslot;
use gca_core::wire::report::EquipmentReport;
use tokio::net::UdpSocket;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::state::AppState;
use crate::store::report_store::IntegrateOutcome;

pub async fn run(socket: UdpSocket, state: AppState, token: CancellationToken) {
    let mut buf = [0u8; 80];
    loop {
        tokio::select! {
            _ = token.cancelled() => {
                debug!("udp listener observed shutdown signal");
                break;
            }
            result = socket.recv_from(&mut buf) => {
                match result {
                    Ok((n, _peer)) => handle_datagram(&buf[..n], &state),
                    Err(e) => warn!(error = %e, "udp recv_from failed"),
                }
            }
        }
    }
}

fn handle_datagram(datagram: &[u8], state: &AppState) {
    if datagram.len() != 80 {
        state.metrics.reports_dropped.fetch_add(1, Ordering::Relaxed);
        return;
    }
    let Ok(report) = EquipmentReport::from_bytes(datagram) else {
        state.metrics.reports_dropped.fetch_add(1, Ordering::Relaxed);
        return;
    };

    // §4.3 step 1: look up ShortID; drop if banned or unknown. This read
    // goes through the auth store's own mutex, never held alongside the
    // report store's (§5: mutexes do not stack).
    let (auth, banned) = state.auth_store.lookup(report.short_id);
    let Some(auth) = auth else {
        state.metrics.reports_dropped.fetch_add(1, Ordering::Relaxed);
        return;
    };
    if banned {
        state.metrics.reports_dropped.fetch_add(1, Ordering::Relaxed);
        return;
    }

    let outcome = match state.report_store.integrate(report, &auth.public_key, timeslot::now()) {
        Ok(outcome) => outcome,
        Err(e) => {
            warn!(error = %e, short_id = report.short_id, "report persistence failed");
            return;
        }
    };

    match outcome {
        IntegrateOutcome::Stored => state.metrics.reports_stored.fetch_add(1, Ordering::Relaxed),
        IntegrateOutcome::Idempotent => state.metrics.reports_idempotent.fetch_add(1, Ordering::Relaxed),
        IntegrateOutcome::Banned => state.metrics.reports_banned.fetch_add(1, Ordering::Relaxed),
        IntegrateOutcome::Dropped => state.metrics.reports_dropped.fetch_add(1, Ordering::Relaxed),
    };
}
