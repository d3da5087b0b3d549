//! Shared application state, handed to the UDP listener, TCP responder
//! and HTTP router alike (mirrors the ingest server's `AppState`, with
//! this protocol's stores instead of `DashMap`s — each store already
//! owns its own mutex, so there's nothing left for `AppState` itself to
//! guard).

use std::sync::Arc;

use gca_core::keys::KeyPair;

use crate::metrics::Metrics;
use crate::store::{AuthStore, DirectoryStore, GcaIdentity, ReportStore};

#[derive(Clone)]
pub struct AppState(pub Arc<Inner>);

pub struct Inner {
    pub server_keys: KeyPair,
    pub gca_identity: GcaIdentity,
    pub auth_store: AuthStore,
    pub report_store: ReportStore,
    pub directory_store: DirectoryStore,
    pub metrics: Metrics,
}

impl std::ops::Deref for AppState {
    type Target = Inner;
    fn deref(&self) -> &Inner {
        &self.0
    }
}
