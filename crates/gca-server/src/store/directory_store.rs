//! Authorized-server directory and pending migration orders (§4.5).
//!
//! Both records are variable-length, so unlike the auth/report stores
//! this doesn't use `AppendLog`'s fixed-width framing: each file is a
//! concatenation of length-prefixed records, rewritten wholesale (via
//! tmp-file-then-rename) on every mutation. Update frequency here is low
//! (operator-driven directory/migration changes, not per-report ingest),
//! so a whole-file rewrite per write is the right trade rather than
//! another bespoke log format.

use std::collections::HashMap;
use std::path::{Path, PathBuf};

use byteorder::{ByteOrder, LittleEndian};

use gca_core::error::{Error, Result};
use gca_core::wire::migration::EquipmentMigration;
use gca_core::wire::server::{self, AuthorizedServer};

struct Inner {
    servers: HashMap<[u8; 32], AuthorizedServer>,
    migrations: HashMap<[u8; 32], EquipmentMigration>,
    servers_path: PathBuf,
    migrations_path: PathBuf,
}

impl Inner {
    fn persist_servers(&self) -> Result<()> {
        let mut out = Vec::new();
        for server in self.servers.values() {
            out.extend_from_slice(&server.to_bytes());
        }
        atomic_write(&self.servers_path, &out)
    }

    fn persist_migrations(&self) -> Result<()> {
        let mut out = Vec::new();
        for migration in self.migrations.values() {
            encode_migration(migration, &mut out);
        }
        atomic_write(&self.migrations_path, &out)
    }
}

fn atomic_write(path: &Path, bytes: &[u8]) -> Result<()> {
    let tmp_path = path.with_extension("rewrite.tmp");
    std::fs::write(&tmp_path, bytes)?;
    std::fs::rename(&tmp_path, path)?;
    Ok(())
}

fn encode_migration(m: &EquipmentMigration, out: &mut Vec<u8>) {
    out.extend_from_slice(&m.equipment_public_key);
    out.extend_from_slice(&m.new_gca_public_key);
    let mut buf = [0u8; 4];
    LittleEndian::write_u32(&mut buf, m.new_short_id);
    out.extend_from_slice(&buf);
    LittleEndian::write_u32(&mut buf, m.new_servers.len() as u32);
    out.extend_from_slice(&buf);
    for s in &m.new_servers {
        let encoded = s.to_bytes();
        LittleEndian::write_u32(&mut buf, encoded.len() as u32);
        out.extend_from_slice(&buf);
        out.extend_from_slice(&encoded);
    }
    out.extend_from_slice(&m.signature);
}

fn decode_migration(bytes: &[u8]) -> Result<(EquipmentMigration, usize)> {
    if bytes.len() < 32 + 32 + 4 + 4 {
        return Err(Error::MalformedInput);
    }
    let mut equipment_public_key = [0u8; 32];
    equipment_public_key.copy_from_slice(&bytes[0..32]);
    let mut new_gca_public_key = [0u8; 32];
    new_gca_public_key.copy_from_slice(&bytes[32..64]);
    let new_short_id = LittleEndian::read_u32(&bytes[64..68]);
    let server_count = LittleEndian::read_u32(&bytes[68..72]) as usize;

    let mut cursor = 72;
    let mut new_servers = Vec::with_capacity(server_count);
    for _ in 0..server_count {
        if bytes.len() < cursor + 4 {
            return Err(Error::MalformedInput);
        }
        let len = LittleEndian::read_u32(&bytes[cursor..cursor + 4]) as usize;
        cursor += 4;
        if bytes.len() < cursor + len {
            return Err(Error::MalformedInput);
        }
        let (server, consumed) = AuthorizedServer::from_bytes(&bytes[cursor..cursor + len])?;
        if consumed != len {
            return Err(Error::MalformedInput);
        }
        new_servers.push(server);
        cursor += len;
    }
    if bytes.len() < cursor + 64 {
        return Err(Error::MalformedInput);
    }
    let mut signature = [0u8; 64];
    signature.copy_from_slice(&bytes[cursor..cursor + 64]);
    cursor += 64;
    Ok((
        EquipmentMigration {
            equipment_public_key,
            new_gca_public_key,
            new_short_id,
            new_servers,
            signature,
        },
        cursor,
    ))
}

pub struct DirectoryStore {
    gca_public_key: [u8; 32],
    inner: std::sync::Mutex<Inner>,
}

impl DirectoryStore {
    pub fn open(dir: &Path, gca_public_key: [u8; 32]) -> Result<Self> {
        std::fs::create_dir_all(dir)?;
        let servers_path = dir.join("authorized-servers.dat");
        let migrations_path = dir.join("equipment-migrations.dat");

        let mut servers = HashMap::new();
        if servers_path.exists() {
            let bytes = std::fs::read(&servers_path)?;
            for s in server::decode_all(&bytes)? {
                servers.insert(s.public_key, s);
            }
        }

        let mut migrations = HashMap::new();
        if migrations_path.exists() {
            let bytes = std::fs::read(&migrations_path)?;
            let mut cursor = 0usize;
            while cursor < bytes.len() {
                let (migration, consumed) = decode_migration(&bytes[cursor..])?;
                cursor += consumed;
                migrations.insert(migration.equipment_public_key, migration);
            }
        }

        Ok(DirectoryStore {
            gca_public_key,
            inner: std::sync::Mutex::new(Inner {
                servers,
                migrations,
                servers_path,
                migrations_path,
            }),
        })
    }

    /// §4.5 `/authorized-servers`: add/update a directory entry, or ban
    /// it in place when `Banned=true`.
    pub fn upsert_server(&self, server: AuthorizedServer) -> Result<()> {
        if !server.verify(&self.gca_public_key) {
            return Err(Error::BadSignature);
        }
        let mut inner = self.inner.lock().expect("directory store mutex poisoned");
        inner.servers.insert(server.public_key, server);
        inner.persist_servers()
    }

    pub fn servers(&self) -> Vec<AuthorizedServer> {
        let inner = self.inner.lock().expect("directory store mutex poisoned");
        inner.servers.values().cloned().collect()
    }

    /// §4.5 `/equipment-migrate`: record a pending order, served to the
    /// named device during its next sync.
    pub fn record_migration(&self, migration: EquipmentMigration) -> Result<()> {
        if !migration.verify(&self.gca_public_key) {
            return Err(Error::BadSignature);
        }
        let mut inner = self.inner.lock().expect("directory store mutex poisoned");
        inner.migrations.insert(migration.equipment_public_key, migration);
        inner.persist_migrations()
    }

    pub fn pending_migration(&self, device_public_key: &[u8; 32]) -> Option<EquipmentMigration> {
        let inner = self.inner.lock().expect("directory store mutex poisoned");
        inner.migrations.get(device_public_key).cloned()
    }

    /// Clears a migration order once the device has picked it up,
    /// keeping the pending set from growing without bound.
    pub fn clear_migration(&self, device_public_key: &[u8; 32]) -> Result<()> {
        let mut inner = self.inner.lock().expect("directory store mutex poisoned");
        if inner.migrations.remove(device_public_key).is_some() {
            inner.persist_migrations()?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use gca_core::keys::KeyPair;
    use gca_core::signing::SigningBytes;

    fn signed_server(gca: &KeyPair, server_key: &KeyPair, banned: bool) -> AuthorizedServer {
        let mut s = AuthorizedServer {
            public_key: server_key.public_bytes(),
            banned,
            location: "us-east-1".to_string(),
            http_port: 35000,
            tcp_port: 35010,
            udp_port: 35030,
            gca_authorization: [0u8; 64],
        };
        let sb = s.signing_bytes();
        s.gca_authorization = gca.sign(&sb);
        s
    }

    #[test]
    fn upsert_then_list_round_trips() {
        let dir = tempfile::tempdir().unwrap();
        let gca = KeyPair::generate();
        let server_key = KeyPair::generate();
        let store = DirectoryStore::open(dir.path(), gca.public_bytes()).unwrap();
        let s = signed_server(&gca, &server_key, false);
        store.upsert_server(s.clone()).unwrap();
        assert_eq!(store.servers(), vec![s]);
    }

    #[test]
    fn ban_flag_updates_in_place() {
        let dir = tempfile::tempdir().unwrap();
        let gca = KeyPair::generate();
        let server_key = KeyPair::generate();
        let store = DirectoryStore::open(dir.path(), gca.public_bytes()).unwrap();
        store.upsert_server(signed_server(&gca, &server_key, false)).unwrap();
        store.upsert_server(signed_server(&gca, &server_key, true)).unwrap();
        let servers = store.servers();
        assert_eq!(servers.len(), 1);
        assert!(servers[0].banned);
    }

    #[test]
    fn directory_survives_restart() {
        let dir = tempfile::tempdir().unwrap();
        let gca = KeyPair::generate();
        let server_key = KeyPair::generate();
        let path_holder;
        {
            let store = DirectoryStore::open(dir.path(), gca.public_bytes()).unwrap();
            store.upsert_server(signed_server(&gca, &server_key, false)).unwrap();
            path_holder = dir.path().to_path_buf();
        }
        let reopened = DirectoryStore::open(&path_holder, gca.public_bytes()).unwrap();
        assert_eq!(reopened.servers().len(), 1);
    }

    #[test]
    fn migration_recorded_then_cleared() {
        let dir = tempfile::tempdir().unwrap();
        let gca = KeyPair::generate();
        let new_gca = KeyPair::generate();
        let device = KeyPair::generate();
        let new_server_key = KeyPair::generate();
        let store = DirectoryStore::open(dir.path(), gca.public_bytes()).unwrap();

        let mut m = EquipmentMigration {
            equipment_public_key: device.public_bytes(),
            new_gca_public_key: new_gca.public_bytes(),
            new_short_id: 42,
            new_servers: vec![signed_server(&new_gca, &new_server_key, false)],
            signature: [0u8; 64],
        };
        m.signature = gca.sign(&m.signing_bytes());
        store.record_migration(m.clone()).unwrap();

        assert_eq!(store.pending_migration(&device.public_bytes()), Some(m));
        store.clear_migration(&device.public_bytes()).unwrap();
        assert_eq!(store.pending_migration(&device.public_bytes()), None);
    }
}
