//! `EquipmentReport`: the 80-byte big-endian UDP/TCP wire record.
//!
//! §9's endianness pitfall: this struct's wire framing is big-endian
//! despite the rest of the protocol's persisted files being little-endian
//! — that is the observed, preserved wire behavior of the live peers this
//! spec is grounded on, not an oversight.

use byteorder::{BigEndian, ByteOrder};

use crate::error::{Error, Result};
use crate::keys::{self, SIGNATURE_LEN};
use crate::signing::SigningBytes;

pub const EQUIPMENT_REPORT_WIRE_SIZE: usize = 80;

/// `PowerOutput == 0`: slot has never been written.
pub const POWER_OUTPUT_EMPTY: u64 = 0;
/// `PowerOutput == 1`: slot received two differently-signed valid reports
/// and is permanently frozen.
pub const POWER_OUTPUT_BANNED: u64 = 1;
/// Values below this are reserved/near-sentinel; a raw reading whose
/// adjusted value would land here is skipped by the client (§3).
pub const POWER_OUTPUT_MIN_REAL: u64 = 2;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct EquipmentReport {
    pub short_id: u32,
    pub timeslot: u32,
    pub power_output: u64,
    pub signature: [u8; SIGNATURE_LEN],
}

impl SigningBytes for EquipmentReport {
    const TAG: &'static str = "EquipmentReport";

    fn append_signing_fields(&self, out: &mut Vec<u8>) {
        let mut buf = [0u8; 4 + 4 + 8];
        BigEndian::write_u32(&mut buf[0..4], self.short_id);
        BigEndian::write_u32(&mut buf[4..8], self.timeslot);
        BigEndian::write_u64(&mut buf[8..16], self.power_output);
        out.extend_from_slice(&buf);
    }
}

impl EquipmentReport {
    pub fn new_signed(short_id: u32, timeslot: u32, power_output: u64, key: &keys::KeyPair) -> Self {
        let mut report = EquipmentReport {
            short_id,
            timeslot,
            power_output,
            signature: [0u8; SIGNATURE_LEN],
        };
        let signing_bytes = report.signing_bytes();
        report.signature = key.sign(&signing_bytes);
        report
    }

    pub fn verify(&self, public_key: &[u8; 32]) -> bool {
        keys::verify(public_key, &self.signing_bytes(), &self.signature)
    }

    /// A sentinel record marking a banned slot, carrying no real signature
    /// (the ban itself is recorded in the persistence log, not re-signed).
    pub fn banned_sentinel(short_id: u32, timeslot: u32) -> Self {
        EquipmentReport {
            short_id,
            timeslot,
            power_output: POWER_OUTPUT_BANNED,
            signature: [0u8; SIGNATURE_LEN],
        }
    }

    pub fn is_empty_slot(&self) -> bool {
        self.power_output == POWER_OUTPUT_EMPTY
    }

    pub fn is_banned_slot(&self) -> bool {
        self.power_output == POWER_OUTPUT_BANNED
    }

    pub fn to_bytes(&self) -> [u8; EQUIPMENT_REPORT_WIRE_SIZE] {
        let mut out = [0u8; EQUIPMENT_REPORT_WIRE_SIZE];
        BigEndian::write_u32(&mut out[0..4], self.short_id);
        BigEndian::write_u32(&mut out[4..8], self.timeslot);
        BigEndian::write_u64(&mut out[8..16], self.power_output);
        out[16..80].copy_from_slice(&self.signature);
        out
    }

    pub fn from_bytes(bytes: &[u8]) -> Result<Self> {
        if bytes.len() != EQUIPMENT_REPORT_WIRE_SIZE {
            return Err(Error::MalformedInput);
        }
        let short_id = BigEndian::read_u32(&bytes[0..4]);
        let timeslot = BigEndian::read_u32(&bytes[4..8]);
        let power_output = BigEndian::read_u64(&bytes[8..16]);
        let mut signature = [0u8; SIGNATURE_LEN];
        signature.copy_from_slice(&bytes[16..80]);
        Ok(EquipmentReport {
            short_id,
            timeslot,
            power_output,
            signature,
        })
    }
}
