//! `EquipmentAuthorization`: the append-log record authorizing a device.
//!
//! Persisted and hashed little-endian, per §9 ("LE for persisted files");
//! unlike `EquipmentReport` this never crosses the 80-byte UDP/TCP hot
//! path, so the endianness pitfall doesn't apply to it.
//!
//! Note on wire size: §3 states "120 bytes on wire" but the field list it
//! gives (`u32 + [u8;32] + i32 + i32 + u64 + u64 + u32 + [u8;64]`) sums to
//! 128 bytes. The fields are normative; the implementation uses the size
//! implied by them (see DESIGN.md).

use byteorder::{ByteOrder, LittleEndian};

use crate::error::{Error, Result};
use crate::keys::{self, SIGNATURE_LEN};
use crate::signing::SigningBytes;

pub const EQUIPMENT_AUTH_WIRE_SIZE: usize = 128;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct EquipmentAuthorization {
    pub short_id: u32,
    pub public_key: [u8; 32],
    /// 1e-3 degrees.
    pub latitude: i32,
    /// 1e-3 degrees.
    pub longitude: i32,
    /// mW.
    pub capacity: u64,
    /// cents.
    pub debt: u64,
    /// timeslot after which this authorization is no longer valid.
    pub expiration: u32,
    pub signature: [u8; SIGNATURE_LEN],
}

impl SigningBytes for EquipmentAuthorization {
    const TAG: &'static str = "EquipmentAuthorization";

    fn append_signing_fields(&self, out: &mut Vec<u8>) {
        let mut buf = [0u8; 4 + 32 + 4 + 4 + 8 + 8 + 4];
        LittleEndian::write_u32(&mut buf[0..4], self.short_id);
        buf[4..36].copy_from_slice(&self.public_key);
        LittleEndian::write_i32(&mut buf[36..40], self.latitude);
        LittleEndian::write_i32(&mut buf[40..44], self.longitude);
        LittleEndian::write_u64(&mut buf[44..52], self.capacity);
        LittleEndian::write_u64(&mut buf[52..60], self.debt);
        LittleEndian::write_u32(&mut buf[60..64], self.expiration);
        out.extend_from_slice(&buf);
    }
}

impl EquipmentAuthorization {
    pub fn verify(&self, gca_public_key: &[u8; 32]) -> bool {
        keys::verify(gca_public_key, &self.signing_bytes(), &self.signature)
    }

    pub fn is_expired(&self, now: crate::timeslot::Timeslot) -> bool {
        now.0 >= self.expiration
    }

    pub fn to_bytes(&self) -> [u8; EQUIPMENT_AUTH_WIRE_SIZE] {
        let mut out = [0u8; EQUIPMENT_AUTH_WIRE_SIZE];
        LittleEndian::write_u32(&mut out[0..4], self.short_id);
        out[4..36].copy_from_slice(&self.public_key);
        LittleEndian::write_i32(&mut out[36..40], self.latitude);
        LittleEndian::write_i32(&mut out[40..44], self.longitude);
        LittleEndian::write_u64(&mut out[44..52], self.capacity);
        LittleEndian::write_u64(&mut out[52..60], self.debt);
        LittleEndian::write_u32(&mut out[60..64], self.expiration);
        out[64..128].copy_from_slice(&self.signature);
        out
    }

    pub fn from_bytes(bytes: &[u8]) -> Result<Self> {
        if bytes.len() != EQUIPMENT_AUTH_WIRE_SIZE {
            return Err(Error::MalformedInput);
        }
        let short_id = LittleEndian::read_u32(&bytes[0..4]);
        let mut public_key = [0u8; 32];
        public_key.copy_from_slice(&bytes[4..36]);
        let latitude = LittleEndian::read_i32(&bytes[36..40]);
        let longitude = LittleEndian::read_i32(&bytes[40..44]);
        let capacity = LittleEndian::read_u64(&bytes[44..52]);
        let debt = LittleEndian::read_u64(&bytes[52..60]);
        let expiration = LittleEndian::read_u32(&bytes[60..64]);
        let mut signature = [0u8; SIGNATURE_LEN];
        signature.copy_from_slice(&bytes[64..128]);
        Ok(EquipmentAuthorization {
            short_id,
            public_key,
            latitude,
            longitude,
            capacity,
            debt,
            expiration,
            signature,
        })
    }
}
