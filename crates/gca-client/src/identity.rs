//! Client identity: the device's own keypair (`clientKeys.dat`), the GCA
//! it currently reports to (`gcaPubKey.dat`), and its `ShortID`
//! (`shortID.dat`, §6). The latter two change together, exactly once,
//! when a migration order lands (§4.7 step 4) — that's why they share
//! one mutex with the server directory in [`crate::directory::ClientState`]
//! rather than living here as independently-locked fields.

use std::path::{Path, PathBuf};

use byteorder::{ByteOrder, LittleEndian};
use gca_core::error::{Error, Result};
use gca_core::keys::KeyPair;

pub struct Identity {
    pub keys: KeyPair,
}

impl Identity {
    pub fn load_or_create(path: &Path) -> Result<Self> {
        let keys = if path.exists() {
            KeyPair::load_client_keys(path)?
        } else {
            let keys = KeyPair::generate();
            keys.save_client_keys(path)?;
            keys
        };
        Ok(Identity { keys })
    }
}

pub fn read_short_id(path: &Path) -> Result<u32> {
    let bytes = std::fs::read(path)?;
    if bytes.len() != 4 {
        return Err(Error::MalformedInput);
    }
    Ok(LittleEndian::read_u32(&bytes))
}

pub fn write_short_id(path: &Path, short_id: u32) -> Result<()> {
    let mut buf = [0u8; 4];
    LittleEndian::write_u32(&mut buf, short_id);
    std::fs::write(path, buf)?;
    Ok(())
}

pub fn read_gca_public_key(path: &Path) -> Result<[u8; 32]> {
    gca_core::keys::read_public_key_file(path)
}

pub fn write_gca_public_key(path: &Path, key: &[u8; 32]) -> Result<()> {
    gca_core::keys::write_public_key_file(path, key)
}

/// §4.6 optional `ct-settings.txt`: two numeric lines, energy multiplier
/// and divider. Present-but-malformed is a fatal startup error; absent
/// falls back to the 1000/1000 default.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct CtSettings {
    pub multiplier: f64,
    pub divider: f64,
}

impl Default for CtSettings {
    fn default() -> Self {
        CtSettings {
            multiplier: 1000.0,
            divider: 1000.0,
        }
    }
}

impl CtSettings {
    pub fn load(path: &Path) -> Result<Self> {
        if !path.exists() {
            return Ok(CtSettings::default());
        }
        let raw = std::fs::read_to_string(path)?;
        let mut lines = raw.lines().filter(|l| !l.trim().is_empty());
        let multiplier: f64 = lines
            .next()
            .ok_or(Error::MalformedInput)?
            .trim()
            .parse()
            .map_err(|_| Error::MalformedInput)?;
        let divider: f64 = lines
            .next()
            .ok_or(Error::MalformedInput)?
            .trim()
            .parse()
            .map_err(|_| Error::MalformedInput)?;
        if lines.next().is_some() {
            return Err(Error::MalformedInput);
        }
        Ok(CtSettings { multiplier, divider })
    }

    pub fn default_path(data_dir: &Path) -> PathBuf {
        data_dir.join("ct-settings.txt")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn keys_roundtrip_through_disk() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("clientKeys.dat");
        let identity = Identity::load_or_create(&path).unwrap();
        let reopened = Identity::load_or_create(&path).unwrap();
        assert_eq!(identity.keys.public_bytes(), reopened.keys.public_bytes());
    }

    #[test]
    fn short_id_roundtrips() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("shortID.dat");
        write_short_id(&path, 135).unwrap();
        assert_eq!(read_short_id(&path).unwrap(), 135);
    }

    #[test]
    fn missing_ct_settings_falls_back_to_default() {
        let dir = tempfile::tempdir().unwrap();
        let settings = CtSettings::load(&dir.path().join("missing.txt")).unwrap();
        assert_eq!(settings, CtSettings::default());
    }

    #[test]
    fn two_line_ct_settings_parse() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("ct-settings.txt");
        std::fs::write(&path, "1200\n800\n").unwrap();
        let settings = CtSettings::load(&path).unwrap();
        assert_eq!(settings.multiplier, 1200.0);
        assert_eq!(settings.divider, 800.0);
    }

    #[test]
    fn short_or_malformed_ct_settings_is_fatal() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("ct-settings.txt");
        std::fs::write(&path, "1200\n").unwrap();
        assert!(CtSettings::load(&path).is_err());

        std::fs::write(&path, "not-a-number\n800\n").unwrap();
        assert!(CtSettings::load(&path).is_err());
    }
}
