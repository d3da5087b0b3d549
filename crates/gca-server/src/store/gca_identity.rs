//! GCA identity bootstrap (§4.5 `register-gca`): trust-on-first-use.
//! A preinstalled temporary key (`gca.tempkey`) signs the real GCA's
//! public key exactly once; the server persists it to `gca.pubkey` and
//! refuses every subsequent registration attempt.

use std::path::{Path, PathBuf};

use gca_core::error::{Error, Result};
use gca_core::keys::{self, SIGNATURE_LEN};
use gca_core::signing::SigningBytes;

/// The one-shot registration payload. Not part of the core wire set
/// (§3 doesn't name it), but it still gets a domain-tagged signing
/// encoding so it can't be confused with any other signed struct.
#[derive(Debug, Clone, Copy)]
pub struct RegisterGcaRequest {
    pub gca_public_key: [u8; 32],
    pub signature: [u8; SIGNATURE_LEN],
}

impl SigningBytes for RegisterGcaRequest {
    const TAG: &'static str = "RegisterGca";

    fn append_signing_fields(&self, out: &mut Vec<u8>) {
        out.extend_from_slice(&self.gca_public_key);
    }
}

impl RegisterGcaRequest {
    pub fn verify(&self, temp_public_key: &[u8; 32]) -> bool {
        keys::verify(temp_public_key, &self.signing_bytes(), &self.signature)
    }
}

pub struct GcaIdentity {
    temp_public_key: [u8; 32],
    pubkey_path: PathBuf,
    registered: std::sync::Mutex<Option<[u8; 32]>>,
}

impl GcaIdentity {
    pub fn open(temp_key_path: &Path, pubkey_path: &Path) -> Result<Self> {
        let temp_public_key = keys::read_public_key_file(temp_key_path)?;
        let registered = if pubkey_path.exists() {
            Some(keys::read_public_key_file(pubkey_path)?)
        } else {
            None
        };
        Ok(GcaIdentity {
            temp_public_key,
            pubkey_path: pubkey_path.to_path_buf(),
            registered: std::sync::Mutex::new(registered),
        })
    }

    /// `Some(pubkey)` once a GCA has registered, `None` before that.
    pub fn current(&self) -> Option<[u8; 32]> {
        *self.registered.lock().expect("gca identity mutex poisoned")
    }

    /// Accepts the registration exactly once. A second call, even with
    /// an identical payload, fails with `GcaAlreadyRegistered`.
    pub fn register(&self, request: RegisterGcaRequest) -> Result<[u8; 32]> {
        let mut registered = self.registered.lock().expect("gca identity mutex poisoned");
        if registered.is_some() {
            return Err(Error::GcaAlreadyRegistered);
        }
        if !request.verify(&self.temp_public_key) {
            return Err(Error::BadSignature);
        }
        keys::write_public_key_file(&self.pubkey_path, &request.gca_public_key)?;
        *registered = Some(request.gca_public_key);
        Ok(request.gca_public_key)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use gca_core::keys::KeyPair;

    fn write_temp_key(dir: &std::path::Path, temp: &KeyPair) -> PathBuf {
        let path = dir.join("gca.tempkey");
        keys::write_public_key_file(&path, &temp.public_bytes()).unwrap();
        path
    }

    #[test]
    fn first_registration_succeeds() {
        let dir = tempfile::tempdir().unwrap();
        let temp = KeyPair::generate();
        let gca = KeyPair::generate();
        let temp_path = write_temp_key(dir.path(), &temp);
        let identity = GcaIdentity::open(&temp_path, &dir.path().join("gca.pubkey")).unwrap();

        let mut req = RegisterGcaRequest {
            gca_public_key: gca.public_bytes(),
            signature: [0u8; 64],
        };
        req.signature = temp.sign(&req.signing_bytes());
        let accepted = identity.register(req).unwrap();
        assert_eq!(accepted, gca.public_bytes());
        assert_eq!(identity.current(), Some(gca.public_bytes()));
    }

    #[test]
    fn second_registration_is_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let temp = KeyPair::generate();
        let gca_a = KeyPair::generate();
        let gca_b = KeyPair::generate();
        let temp_path = write_temp_key(dir.path(), &temp);
        let identity = GcaIdentity::open(&temp_path, &dir.path().join("gca.pubkey")).unwrap();

        let mut req_a = RegisterGcaRequest {
            gca_public_key: gca_a.public_bytes(),
            signature: [0u8; 64],
        };
        req_a.signature = temp.sign(&req_a.signing_bytes());
        identity.register(req_a).unwrap();

        let mut req_b = RegisterGcaRequest {
            gca_public_key: gca_b.public_bytes(),
            signature: [0u8; 64],
        };
        req_b.signature = temp.sign(&req_b.signing_bytes());
        assert_eq!(identity.register(req_b).unwrap_err(), Error::GcaAlreadyRegistered);
        assert_eq!(identity.current(), Some(gca_a.public_bytes()));
    }

    #[test]
    fn bad_signature_is_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let temp = KeyPair::generate();
        let impostor = KeyPair::generate();
        let gca = KeyPair::generate();
        let temp_path = write_temp_key(dir.path(), &temp);
        let identity = GcaIdentity::open(&temp_path, &dir.path().join("gca.pubkey")).unwrap();

        let mut req = RegisterGcaRequest {
            gca_public_key: gca.public_bytes(),
            signature: [0u8; 64],
        };
        req.signature = impostor.sign(&req.signing_bytes());
        assert_eq!(identity.register(req).unwrap_err(), Error::BadSignature);
        assert_eq!(identity.current(), None);
    }

    #[test]
    fn registration_survives_restart() {
        let dir = tempfile::tempdir().unwrap();
        let temp = KeyPair::generate();
        let gca = KeyPair::generate();
        let temp_path = write_temp_key(dir.path(), &temp);
        let pubkey_path = dir.path().join("gca.pubkey");
        {
            let identity = GcaIdentity::open(&temp_path, &pubkey_path).unwrap();
            let mut req = RegisterGcaRequest {
                gca_public_key: gca.public_bytes(),
                signature: [0u8; 64],
            };
            req.signature = temp.sign(&req.signing_bytes());
            identity.register(req).unwrap();
        }
        let reopened = GcaIdentity::open(&temp_path, &pubkey_path).unwrap();
        assert_eq!(reopened.current(), Some(gca.public_bytes()));
    }
}
