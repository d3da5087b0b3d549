//! Ed25519 identity helpers: raw 32/64-byte key and signature framing, as
//! used on disk and over the wire throughout the protocol.

use ed25519_dalek::{Signature, Signer, SigningKey, Verifier, VerifyingKey};

use crate::error::{Error, Result};

pub const PUBLIC_KEY_LEN: usize = 32;
pub const SIGNATURE_LEN: usize = 64;

/// A keypair capable of signing; the counterpart `VerifyingKey` is derived
/// from it and kept alongside for convenience.
pub struct KeyPair {
    pub signing_key: SigningKey,
    pub verifying_key: VerifyingKey,
}

impl KeyPair {
    pub fn generate() -> Self {
        let signing_key = SigningKey::generate(&mut rand::rngs::OsRng);
        let verifying_key = signing_key.verifying_key();
        KeyPair {
            signing_key,
            verifying_key,
        }
    }

    pub fn from_signing_bytes(bytes: &[u8; 32]) -> Self {
        let signing_key = SigningKey::from_bytes(bytes);
        let verifying_key = signing_key.verifying_key();
        KeyPair {
            signing_key,
            verifying_key,
        }
    }

    pub fn public_bytes(&self) -> [u8; PUBLIC_KEY_LEN] {
        self.verifying_key.to_bytes()
    }

    pub fn sign(&self, message: &[u8]) -> [u8; SIGNATURE_LEN] {
        self.signing_key.sign(message).to_bytes()
    }

    /// Load a 32-byte raw private key plus 32-byte raw public key
    /// (`clientKeys.dat` format: 32 B pub ‖ 32 B priv) from disk.
    pub fn load_client_keys(path: &std::path::Path) -> Result<Self> {
        let bytes = std::fs::read(path)?;
        if bytes.len() != 64 {
            return Err(Error::MalformedInput);
        }
        let mut priv_bytes = [0u8; 32];
        priv_bytes.copy_from_slice(&bytes[32..64]);
        Ok(Self::from_signing_bytes(&priv_bytes))
    }

    /// Persist as `32 B pub ‖ 32 B priv`, matching §6's `clientKeys.dat`.
    pub fn save_client_keys(&self, path: &std::path::Path) -> Result<()> {
        let mut out = Vec::with_capacity(64);
        out.extend_from_slice(&self.public_bytes());
        out.extend_from_slice(self.signing_key.as_bytes());
        std::fs::write(path, out)?;
        Ok(())
    }
}

/// Verify a raw 64-byte signature over `message` under `public_key`.
pub fn verify(public_key: &[u8; PUBLIC_KEY_LEN], message: &[u8], signature: &[u8; SIGNATURE_LEN]) -> bool {
    let Ok(vk) = VerifyingKey::from_bytes(public_key) else {
        return false;
    };
    let sig = Signature::from_bytes(signature);
    vk.verify(message, &sig).is_ok()
}

/// Read a raw 32-byte public key file (`gca.tempkey`, `gca.pubkey`).
pub fn read_public_key_file(path: &std::path::Path) -> Result<[u8; PUBLIC_KEY_LEN]> {
    let bytes = std::fs::read(path)?;
    bytes
        .as_slice()
        .try_into()
        .map_err(|_| Error::MalformedInput)
}

pub fn write_public_key_file(path: &std::path::Path, key: &[u8; PUBLIC_KEY_LEN]) -> Result<()> {
    std::fs::write(path, key)?;
    Ok(())
}
