//! §4.4 TCP sync endpoint: client sends a 4-byte big-endian `ShortID`,
//! server answers with a fixed signed 612-byte bitfield response.

use std::sync::atomic::Ordering;

use byteorder::{BigEndian, ByteOrder};
use gca_core::timeslot;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::state::AppState;

pub const RESPONSE_LEN: usize = 612;
const SIGNED_PREFIX_LEN: usize = 548;

pub async fn run(listener: TcpListener, state: AppState, token: CancellationToken) {
    loop {
        tokio::select! {
            _ = token.cancelled() => {
                debug!("tcp sync listener observed shutdown signal");
                break;
            }
            accepted = listener.accept() => {
                match accepted {
                    Ok((stream, _peer)) => {
                        let state = state.clone();
                        tokio::spawn(async move {
                            if let Err(e) = handle_connection(stream, &state).await {
                                warn!(error = %e, "tcp sync connection failed");
                            }
                        });
                    }
                    Err(e) => warn!(error = %e, "tcp accept failed"),
                }
            }
        }
    }
}

async fn handle_connection(mut stream: TcpStream, state: &AppState) -> std::io::Result<()> {
    let mut request = [0u8; 4];
    stream.read_exact(&mut request).await?;
    let short_id = BigEndian::read_u32(&request);

    let response = build_response(state, short_id);
    stream.write_all(&response).await?;
    state.metrics.tcp_syncs.fetch_add(1, Ordering::Relaxed);
    Ok(())
}

fn build_response(state: &AppState, short_id: u32) -> [u8; RESPONSE_LEN] {
    let now = timeslot::now();
    let (offset, bitfield) = state
        .report_store
        .sync_bitfield(short_id)
        .unwrap_or_else(|| (default_offset_for(now), [0u8; 504]));
    let (auth, _banned) = state.auth_store.lookup(short_id);
    let equipment_public_key = auth.map(|a| a.public_key).unwrap_or([0u8; 32]);

    let mut out = [0u8; RESPONSE_LEN];
    out[0..32].copy_from_slice(&equipment_public_key);
    BigEndian::write_u32(&mut out[32..36], offset);
    out[36..540].copy_from_slice(&bitfield);
    BigEndian::write_u64(&mut out[540..548], timeslot::slot_to_unix(now));

    let signature = state.server_keys.sign(&out[0..SIGNED_PREFIX_LEN]);
    out[548..612].copy_from_slice(&signature);
    out
}

fn default_offset_for(now: timeslot::Timeslot) -> u32 {
    now.week_start().0.saturating_sub(gca_core::timeslot::WEEK_SLOTS)
}

/// Client-side acceptance rule (§4.4): the signature verifies under the
/// selected server's key and the signing timestamp is within 24h of now.
/// The first 32 bytes are the equipment public key (diagnostic binding
/// only, per spec.md:106) and play no part in acceptance — the signature
/// still covers them, so tampering with that field invalidates it.
pub fn verify_response(response: &[u8; RESPONSE_LEN], server_public_key: &[u8; 32], now_unix: u64) -> bool {
    let signing_time = BigEndian::read_u64(&response[540..548]);
    let mut signature = [0u8; 64];
    signature.copy_from_slice(&response[548..612]);
    if now_unix.abs_diff(signing_time) > 24 * 3600 {
        return false;
    }
    gca_core::keys::verify(server_public_key, &response[0..SIGNED_PREFIX_LEN], &signature)
}

#[cfg(test)]
mod tests {
    use super::*;
    use gca_core::keys::KeyPair;
    use gca_core::signing::SigningBytes;
    use gca_core::timeslot::Timeslot;

    fn test_state(dir: &std::path::Path) -> AppState {
        let gca = KeyPair::generate();
        let server_keys = KeyPair::generate();
        let temp_path = dir.join("gca.tempkey");
        gca_core::keys::write_public_key_file(&temp_path, &gca.public_bytes()).unwrap();
        let identity = crate::store::GcaIdentity::open(&temp_path, &dir.join("gca.pubkey")).unwrap();
        let auth_store = crate::store::AuthStore::open(&dir.join("auths.dat"), gca.public_bytes()).unwrap();
        let report_store = crate::store::ReportStore::open(&dir.join("reports"), Timeslot(0)).unwrap();
        let directory_store = crate::store::DirectoryStore::open(&dir.join("directory"), gca.public_bytes()).unwrap();
        AppState(std::sync::Arc::new(crate::state::Inner {
            server_keys,
            gca_identity: identity,
            auth_store,
            report_store,
            directory_store,
            metrics: crate::metrics::Metrics::new(),
        }))
    }

    fn authorize_device(state: &AppState, gca: &KeyPair, short_id: u32, device: &KeyPair) {
        let mut a = gca_core::wire::EquipmentAuthorization {
            short_id,
            public_key: device.public_bytes(),
            latitude: 0,
            longitude: 0,
            capacity: 1,
            debt: 0,
            expiration: 1_000_000,
            signature: [0u8; 64],
        };
        a.signature = gca.sign(&a.signing_bytes());
        state.auth_store.authorize(a, Timeslot(0)).unwrap();
    }

    #[test]
    fn response_is_612_bytes_and_verifies() {
        timeslot::set_test_timeslot(Some(100));
        let dir = tempfile::tempdir().unwrap();
        let state = test_state(dir.path());
        let response = build_response(&state, 1);
        assert_eq!(response.len(), RESPONSE_LEN);
        let now_unix = timeslot::slot_to_unix(Timeslot(100));
        assert!(verify_response(&response, &state.server_keys.public_bytes(), now_unix));
        timeslot::set_test_timeslot(None);
    }

    #[test]
    fn response_carries_the_equipment_key_not_the_server_key() {
        timeslot::set_test_timeslot(Some(100));
        let dir = tempfile::tempdir().unwrap();
        let state = test_state(dir.path());
        let gca = gca_core::keys::KeyPair::generate();
        let device = gca_core::keys::KeyPair::generate();
        authorize_device(&state, &gca, 1, &device);

        let response = build_response(&state, 1);
        assert_eq!(&response[0..32], &device.public_bytes()[..]);
        assert_ne!(&response[0..32], &state.server_keys.public_bytes()[..]);
        let now_unix = timeslot::slot_to_unix(Timeslot(100));
        assert!(verify_response(&response, &state.server_keys.public_bytes(), now_unix));
        timeslot::set_test_timeslot(None);
    }

    #[test]
    fn tampered_bitfield_fails_verification() {
        timeslot::set_test_timeslot(Some(100));
        let dir = tempfile::tempdir().unwrap();
        let state = test_state(dir.path());
        let mut response = build_response(&state, 1);
        response[40] ^= 0xFF;
        let now_unix = timeslot::slot_to_unix(Timeslot(100));
        assert!(!verify_response(&response, &state.server_keys.public_bytes(), now_unix));
        timeslot::set_test_timeslot(None);
    }

    #[test]
    fn tampered_equipment_key_field_fails_verification() {
        timeslot::set_test_timeslot(Some(100));
        let dir = tempfile::tempdir().unwrap();
        let state = test_state(dir.path());
        let mut response = build_response(&state, 1);
        response[0] ^= 0xFF;
        let now_unix = timeslot::slot_to_unix(Timeslot(100));
        assert!(!verify_response(&response, &state.server_keys.public_bytes(), now_unix));
        timeslot::set_test_timeslot(None);
    }

    #[test]
    fn stale_signing_time_is_rejected() {
        timeslot::set_test_timeslot(Some(100));
        let dir = tempfile::tempdir().unwrap();
        let state = test_state(dir.path());
        let response = build_response(&state, 1);
        let far_future_unix = timeslot::slot_to_unix(Timeslot(100)) + 48 * 3600;
        assert!(!verify_response(&response, &state.server_keys.public_bytes(), far_future_unix));
        timeslot::set_test_timeslot(None);
    }
}
