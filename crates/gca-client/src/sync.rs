//! §4.7 client sync and failover, and §4.4's client side of the TCP
//! bitfield protocol. This crate can't reuse `gca-server`'s
//! `net::tcp_sync` (that's a private module of a separate binary
//! crate), so the 612-byte response framing and its acceptance rule are
//! reimplemented here against the same wire layout.

use std::time::Duration;

use byteorder::{BigEndian, ByteOrder};
use gca_core::error::{Error, Result};
use gca_core::timeslot;
use gca_core::wire::migration::EquipmentMigration;
use gca_core::wire::report::EquipmentReport;
use gca_core::wire::server::AuthorizedServer;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpStream, UdpSocket};
use tracing::{info, warn};

use crate::directory::ClientState;
use crate::history::HistoryFile;
use crate::identity::Identity;

pub const RESPONSE_LEN: usize = 612;
const SIGNED_PREFIX_LEN: usize = 548;
const RING_SLOTS: u32 = 4032;

pub struct BitfieldResponse {
    /// Diagnostic binding only (spec.md:106) — identifies the device the
    /// bitfield was computed for, not the server. Plays no part in the
    /// acceptance rule below.
    pub equipment_public_key: [u8; 32],
    pub offset: u32,
    pub bitfield: [u8; 504],
    pub signing_time_unix: u64,
}

/// §4.4 client-side acceptance rule: the signature verifies under the
/// server's own key, and the signing timestamp is within 24h of now.
pub fn parse_and_verify(response: &[u8; RESPONSE_LEN], expected_server_key: &[u8; 32], now_unix: u64) -> Result<BitfieldResponse> {
    let mut equipment_public_key = [0u8; 32];
    equipment_public_key.copy_from_slice(&response[0..32]);
    let offset = BigEndian::read_u32(&response[32..36]);
    let mut bitfield = [0u8; 504];
    bitfield.copy_from_slice(&response[36..540]);
    let signing_time_unix = BigEndian::read_u64(&response[540..548]);
    let mut signature = [0u8; 64];
    signature.copy_from_slice(&response[548..612]);

    if now_unix.abs_diff(signing_time_unix) > 24 * 3600 {
        return Err(Error::StaleResponse);
    }
    if !gca_core::keys::verify(expected_server_key, &response[0..SIGNED_PREFIX_LEN], &signature) {
        return Err(Error::BadSignature);
    }
    Ok(BitfieldResponse {
        equipment_public_key,
        offset,
        bitfield,
        signing_time_unix,
    })
}

fn bit_set(bitfield: &[u8; 504], index: u32) -> bool {
    let idx = index as usize;
    bitfield[idx / 8] & (1 << (idx % 8)) != 0
}

async fn query_bitfield(server: &AuthorizedServer, short_id: u32) -> Result<[u8; RESPONSE_LEN]> {
    let addr = (server_host(server), server.tcp_port);
    let mut stream = tokio::time::timeout(Duration::from_secs(10), TcpStream::connect(addr))
        .await
        .map_err(|_| Error::ServerUnreachable)?
        .map_err(|_| Error::ServerUnreachable)?;

    let mut request = [0u8; 4];
    BigEndian::write_u32(&mut request, short_id);
    stream.write_all(&request).await.map_err(|_| Error::ServerUnreachable)?;

    let mut response = [0u8; RESPONSE_LEN];
    tokio::time::timeout(Duration::from_secs(10), stream.read_exact(&mut response))
        .await
        .map_err(|_| Error::ServerUnreachable)?
        .map_err(|_| Error::ServerUnreachable)?;
    Ok(response)
}

/// The client has no DNS/location-resolution story in this protocol;
/// `location` in `AuthorizedServer` is an opaque operator label, so the
/// host actually dialed is the loopback address in tests and is expected
/// to be overridden by deployment-specific resolution in production
/// (left as a seam, since §6 doesn't specify a lookup scheme).
fn server_host(_server: &AuthorizedServer) -> &'static str {
    "127.0.0.1"
}

pub struct SyncOutcome {
    pub resent: u32,
    pub migrated: bool,
}

/// §4.7, steps 1-5 minus the watchdog touch (left to the caller, which
/// also owns the watchdog file paths).
pub async fn run_sync(
    identity: &Identity,
    state: &ClientState,
    history: &std::sync::Mutex<HistoryFile>,
    http_client: &reqwest::Client,
    udp_socket: &UdpSocket,
) -> Result<SyncOutcome> {
    let short_id = state.short_id();
    let mut tried = Vec::new();
    let mut response = None;
    let mut chosen_server = None;

    loop {
        let Some(server) = state.pick_primary_excluding(&tried) else {
            break;
        };
        match query_bitfield(&server, short_id).await {
            Ok(raw) => {
                response = Some(raw);
                chosen_server = Some(server);
                break;
            }
            Err(e) => {
                warn!(error = %e, server = %hex::encode(server.public_key), "sync server unreachable, trying next");
                tried.push(server.public_key);
            }
        }
    }

    let (Some(raw_response), Some(server)) = (response, chosen_server) else {
        // §4.7 step 2: every candidate failed; leave the primary
        // unchanged and return without error — this cycle simply
        // didn't reconcile.
        return Ok(SyncOutcome { resent: 0, migrated: false });
    };

    let now_unix = timeslot::slot_to_unix(timeslot::now());
    let parsed = parse_and_verify(&raw_response, &server.public_key, now_unix)?;

    // §4.7 step 3: gap-fill. Anything we have locally that the server's
    // bitfield doesn't show gets resent.
    let mut resent = 0u32;
    {
        let mut history = history.lock().expect("history mutex poisoned");
        let populated = history.populated_in_range(parsed.offset, RING_SLOTS)?;
        for (slot, value) in populated {
            let idx = slot.wrapping_sub(parsed.offset);
            if idx < RING_SLOTS && !bit_set(&parsed.bitfield, idx) {
                let report = EquipmentReport::new_signed(short_id, slot, value as u64, &identity.keys);
                send_report(udp_socket, &server, &report).await?;
                resent += 1;
                tokio::time::sleep(Duration::from_millis(1)).await;
            }
        }
    }

    // §4.7 step 4: fetch the directory and any pending migration.
    let migrated = fetch_and_merge_directory(state, http_client, &server).await?;

    Ok(SyncOutcome { resent, migrated })
}

async fn send_report(socket: &UdpSocket, server: &AuthorizedServer, report: &EquipmentReport) -> Result<()> {
    let addr = (server_host(server), server.udp_port);
    socket.send_to(&report.to_bytes(), addr).await?;
    Ok(())
}

#[derive(serde::Deserialize)]
struct ServerDto {
    public_key: String,
    banned: bool,
    location: String,
    http_port: u16,
    tcp_port: u16,
    udp_port: u16,
    gca_authorization: String,
}

#[derive(serde::Deserialize)]
struct AuthorizedServersResponse {
    servers: Vec<ServerDto>,
}

#[derive(serde::Deserialize)]
struct MigrationDto {
    equipment_public_key: String,
    new_gca_public_key: String,
    new_short_id: u32,
    new_servers: Vec<ServerDto>,
    signature: String,
}

#[derive(serde::Deserialize)]
struct PendingMigrationResponse {
    migration: Option<MigrationDto>,
}

fn decode_server(dto: ServerDto) -> Result<AuthorizedServer> {
    Ok(AuthorizedServer {
        public_key: decode_hex32(&dto.public_key)?,
        banned: dto.banned,
        location: dto.location,
        http_port: dto.http_port,
        tcp_port: dto.tcp_port,
        udp_port: dto.udp_port,
        gca_authorization: decode_hex64(&dto.gca_authorization)?,
    })
}

fn decode_hex32(s: &str) -> Result<[u8; 32]> {
    hex::decode(s).ok().and_then(|b| b.try_into().ok()).ok_or(Error::MalformedInput)
}

fn decode_hex64(s: &str) -> Result<[u8; 64]> {
    hex::decode(s).ok().and_then(|b| b.try_into().ok()).ok_or(Error::MalformedInput)
}

/// Fetches `/api/v1/authorized-servers` and `/api/v1/equipment-migrate`
/// (GET variants, signed by the GCA, §4.7 step 4), merges the directory,
/// and applies a pending migration if the current GCA has one for us.
async fn fetch_and_merge_directory(state: &ClientState, http_client: &reqwest::Client, server: &AuthorizedServer) -> Result<bool> {
    let base = format!("http://127.0.0.1:{}", server.http_port);

    let directory: AuthorizedServersResponse = match http_client
        .get(format!("{base}/api/v1/authorized-servers"))
        .send()
        .await
    {
        Ok(resp) => match resp.json().await {
            Ok(body) => body,
            Err(_) => return Ok(false),
        },
        Err(_) => return Ok(false),
    };
    let mut fetched = Vec::with_capacity(directory.servers.len());
    for dto in directory.servers {
        fetched.push(decode_server(dto)?);
    }
    state.merge_servers(fetched)?;

    let public_key = hex::encode(state.gca_public_key());
    let migration_resp: PendingMigrationResponse = match http_client
        .get(format!("{base}/api/v1/equipment-migrate"))
        .query(&[("publicKey", &public_key)])
        .send()
        .await
    {
        Ok(resp) => match resp.json().await {
            Ok(body) => body,
            Err(_) => return Ok(false),
        },
        Err(_) => return Ok(false),
    };

    let Some(dto) = migration_resp.migration else {
        return Ok(false);
    };
    let mut new_servers = Vec::with_capacity(dto.new_servers.len());
    for s in dto.new_servers {
        new_servers.push(decode_server(s)?);
    }
    let migration = EquipmentMigration {
        equipment_public_key: decode_hex32(&dto.equipment_public_key)?,
        new_gca_public_key: decode_hex32(&dto.new_gca_public_key)?,
        new_short_id: dto.new_short_id,
        new_servers,
        signature: decode_hex64(&dto.signature)?,
    };
    if !migration.verify(&state.gca_public_key()) {
        warn!("pending migration signature rejected under current gca key");
        return Ok(false);
    }
    state.apply_migration(&migration)?;
    info!(new_short_id = migration.new_short_id, "migration applied");
    Ok(true)
}

#[cfg(test)]
mod tests {
    use super::*;
    use gca_core::keys::KeyPair;
    use gca_core::timeslot::Timeslot;

    fn build_response(
        server_keys: &KeyPair,
        equipment_public_key: [u8; 32],
        offset: u32,
        bitfield: [u8; 504],
        signing_time: u64,
    ) -> [u8; RESPONSE_LEN] {
        let mut out = [0u8; RESPONSE_LEN];
        out[0..32].copy_from_slice(&equipment_public_key);
        BigEndian::write_u32(&mut out[32..36], offset);
        out[36..540].copy_from_slice(&bitfield);
        BigEndian::write_u64(&mut out[540..548], signing_time);
        let signature = server_keys.sign(&out[0..SIGNED_PREFIX_LEN]);
        out[548..612].copy_from_slice(&signature);
        out
    }

    #[test]
    fn valid_response_parses() {
        timeslot::set_test_timeslot(Some(100));
        let server_keys = KeyPair::generate();
        let device = KeyPair::generate();
        let now_unix = timeslot::slot_to_unix(Timeslot(100));
        let response = build_response(&server_keys, device.public_bytes(), 5, [0u8; 504], now_unix);
        let parsed = parse_and_verify(&response, &server_keys.public_bytes(), now_unix).unwrap();
        assert_eq!(parsed.offset, 5);
        assert_eq!(parsed.equipment_public_key, device.public_bytes());
        timeslot::set_test_timeslot(None);
    }

    #[test]
    fn equipment_key_field_may_differ_from_server_key_without_rejection() {
        timeslot::set_test_timeslot(Some(100));
        let server_keys = KeyPair::generate();
        let device = KeyPair::generate();
        let now_unix = timeslot::slot_to_unix(Timeslot(100));
        let response = build_response(&server_keys, device.public_bytes(), 5, [0u8; 504], now_unix);
        assert!(parse_and_verify(&response, &server_keys.public_bytes(), now_unix).is_ok());
        timeslot::set_test_timeslot(None);
    }

    #[test]
    fn wrong_server_key_is_rejected() {
        let server_keys = KeyPair::generate();
        let device = KeyPair::generate();
        let other = KeyPair::generate();
        let response = build_response(&server_keys, device.public_bytes(), 5, [0u8; 504], 1_600_000_000);
        assert!(parse_and_verify(&response, &other.public_bytes(), 1_600_000_000).is_err());
    }

    #[test]
    fn tampered_equipment_key_field_fails_verification() {
        let server_keys = KeyPair::generate();
        let device = KeyPair::generate();
        let mut response = build_response(&server_keys, device.public_bytes(), 5, [0u8; 504], 1_600_000_000);
        response[0] ^= 0xFF;
        assert!(parse_and_verify(&response, &server_keys.public_bytes(), 1_600_000_000).is_err());
    }

    #[test]
    fn stale_signing_time_is_rejected() {
        let server_keys = KeyPair::generate();
        let device = KeyPair::generate();
        let response = build_response(&server_keys, device.public_bytes(), 5, [0u8; 504], 1_000_000);
        assert!(parse_and_verify(&response, &server_keys.public_bytes(), 1_000_000 + 48 * 3600).is_err());
    }

    #[test]
    fn bit_set_reads_the_right_bit() {
        let mut bitfield = [0u8; 504];
        bitfield[1] = 0b0000_0010;
        assert!(bit_set(&bitfield, 9));
        assert!(!bit_set(&bitfield, 8));
    }
}
