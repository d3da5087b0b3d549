//! §4.7 server directory and GCA identity, held behind one mutex because
//! a migration order replaces all three together (new GCA key, new
//! `ShortID`, new server list) and nothing else may observe a partial
//! update (§5's "mutexes guard every related mutable field together").
//!
//! Server selection for sync uses a cryptographic RNG (`rand::rngs::OsRng`,
//! the same CSPRNG the server's own key generation uses), not a
//! statistical PRNG — §9 calls this out explicitly, since a predictable
//! primary-server choice would let an attacker pre-position a
//! man-in-the-middle on the next sync.

use std::collections::HashMap;
use std::path::{Path, PathBuf};

use gca_core::error::Result;
use gca_core::wire::migration::EquipmentMigration;
use gca_core::wire::server::{self, AuthorizedServer};
use rand::seq::SliceRandom;

use crate::identity;

struct Inner {
    gca_public_key: [u8; 32],
    short_id: u32,
    servers: HashMap<[u8; 32], AuthorizedServer>,
}

pub struct ClientState {
    gca_pubkey_path: PathBuf,
    short_id_path: PathBuf,
    servers_path: PathBuf,
    inner: std::sync::Mutex<Inner>,
}

impl ClientState {
    pub fn open(data_dir: &Path) -> Result<Self> {
        std::fs::create_dir_all(data_dir)?;
        let gca_pubkey_path = data_dir.join("gcaPubKey.dat");
        let short_id_path = data_dir.join("shortID.dat");
        let servers_path = data_dir.join("gcaServers.dat");

        let gca_public_key = identity::read_gca_public_key(&gca_pubkey_path)?;
        let short_id = identity::read_short_id(&short_id_path)?;

        let mut servers = HashMap::new();
        if servers_path.exists() {
            let bytes = std::fs::read(&servers_path)?;
            for s in server::decode_all(&bytes)? {
                servers.insert(s.public_key, s);
            }
        }

        Ok(ClientState {
            gca_pubkey_path,
            short_id_path,
            servers_path,
            inner: std::sync::Mutex::new(Inner {
                gca_public_key,
                short_id,
                servers,
            }),
        })
    }

    pub fn gca_public_key(&self) -> [u8; 32] {
        self.inner.lock().expect("client state mutex poisoned").gca_public_key
    }

    pub fn short_id(&self) -> u32 {
        self.inner.lock().expect("client state mutex poisoned").short_id
    }

    pub fn servers(&self) -> Vec<AuthorizedServer> {
        self.inner
            .lock()
            .expect("client state mutex poisoned")
            .servers
            .values()
            .cloned()
            .collect()
    }

    /// §4.7 step 1: shuffle the non-banned servers with a cryptographic
    /// RNG and take the first. Picks a fresh server on every call, which
    /// is the point — the primary changes on every sync cycle.
    pub fn pick_primary(&self) -> Option<AuthorizedServer> {
        let mut candidates: Vec<AuthorizedServer> = self
            .servers()
            .into_iter()
            .filter(|s| !s.banned)
            .collect();
        candidates.shuffle(&mut rand::rngs::OsRng);
        candidates.into_iter().next()
    }

    /// Same as [`pick_primary`], but skips servers already tried and
    /// failed this sync cycle (§4.7 step 2: "try the next candidate").
    pub fn pick_primary_excluding(&self, tried: &[[u8; 32]]) -> Option<AuthorizedServer> {
        let mut candidates: Vec<AuthorizedServer> = self
            .servers()
            .into_iter()
            .filter(|s| !s.banned && !tried.contains(&s.public_key))
            .collect();
        candidates.shuffle(&mut rand::rngs::OsRng);
        candidates.into_iter().next()
    }

    /// §4.7 step 4: merge a freshly-fetched directory into the local
    /// one — add servers we didn't know about, update the ban flag on
    /// ones we did.
    pub fn merge_servers(&self, fetched: Vec<AuthorizedServer>) -> Result<()> {
        let mut inner = self.inner.lock().expect("client state mutex poisoned");
        for server in fetched {
            inner.servers.insert(server.public_key, server);
        }
        persist_servers(&self.servers_path, &inner.servers)
    }

    /// §4.7 step 4: a migration order replaces the GCA key, `ShortID`
    /// and server directory in one step, then persists all three.
    pub fn apply_migration(&self, migration: &EquipmentMigration) -> Result<()> {
        let mut inner = self.inner.lock().expect("client state mutex poisoned");
        inner.gca_public_key = migration.new_gca_public_key;
        inner.short_id = migration.new_short_id;
        inner.servers = migration
            .new_servers
            .iter()
            .cloned()
            .map(|s| (s.public_key, s))
            .collect();

        identity::write_gca_public_key(&self.gca_pubkey_path, &inner.gca_public_key)?;
        identity::write_short_id(&self.short_id_path, inner.short_id)?;
        persist_servers(&self.servers_path, &inner.servers)
    }
}

fn persist_servers(path: &Path, servers: &HashMap<[u8; 32], AuthorizedServer>) -> Result<()> {
    let mut out = Vec::new();
    for server in servers.values() {
        out.extend_from_slice(&server.to_bytes());
    }
    let tmp_path = path.with_extension("rewrite.tmp");
    std::fs::write(&tmp_path, &out)?;
    std::fs::rename(&tmp_path, path)?;
    Ok(())
}
