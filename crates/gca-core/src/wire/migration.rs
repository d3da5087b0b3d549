//! `EquipmentMigration`: an order, signed by a device's *current* GCA,
//! moving that device to a new GCA with a new `ShortID` and server
//! directory.

use byteorder::{ByteOrder, LittleEndian};

use crate::error::{Error, Result};
use crate::keys::{self, SIGNATURE_LEN};
use crate::signing::SigningBytes;
use crate::wire::server::AuthorizedServer;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EquipmentMigration {
    pub equipment_public_key: [u8; 32],
    pub new_gca_public_key: [u8; 32],
    pub new_short_id: u32,
    /// Each entry independently GCA-signed for the new GCA's directory.
    pub new_servers: Vec<AuthorizedServer>,
    /// Signed by the device's *current* GCA, authorizing the move.
    pub signature: [u8; SIGNATURE_LEN],
}

impl SigningBytes for EquipmentMigration {
    const TAG: &'static str = "EquipmentMigration";

    fn append_signing_fields(&self, out: &mut Vec<u8>) {
        out.extend_from_slice(&self.equipment_public_key);
        out.extend_from_slice(&self.new_gca_public_key);
        let mut buf = [0u8; 4];
        LittleEndian::write_u32(&mut buf, self.new_short_id);
        out.extend_from_slice(&buf);
        LittleEndian::write_u32(&mut buf, self.new_servers.len() as u32);
        out.extend_from_slice(&buf);
        for server in &self.new_servers {
            let encoded = server.to_bytes();
            LittleEndian::write_u32(&mut buf, encoded.len() as u32);
            out.extend_from_slice(&buf);
            out.extend_from_slice(&encoded);
        }
    }
}

impl EquipmentMigration {
    pub fn verify(&self, current_gca_public_key: &[u8; 32]) -> bool {
        keys::verify(current_gca_public_key, &self.signing_bytes(), &self.signature)
    }

    pub fn applies_to(&self, device_public_key: &[u8; 32]) -> bool {
        &self.equipment_public_key == device_public_key
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::keys::KeyPair;

    fn one_server(gca: &KeyPair, server: &KeyPair) -> AuthorizedServer {
        let mut s = AuthorizedServer {
            public_key: server.public_bytes(),
            banned: false,
            location: "new-gca-dc".to_string(),
            http_port: 1,
            tcp_port: 2,
            udp_port: 3,
            gca_authorization: [0u8; 64],
        };
        let sb = s.signing_bytes();
        s.gca_authorization = gca.sign(&sb);
        s
    }

    #[test]
    fn verifies_under_current_gca() {
        let old_gca = KeyPair::generate();
        let new_gca = KeyPair::generate();
        let device = KeyPair::generate();
        let server = KeyPair::generate();
        let mut m = EquipmentMigration {
            equipment_public_key: device.public_bytes(),
            new_gca_public_key: new_gca.public_bytes(),
            new_short_id: 135,
            new_servers: vec![one_server(&new_gca, &server)],
            signature: [0u8; 64],
        };
        let sb = m.signing_bytes();
        m.signature = old_gca.sign(&sb);
        assert!(m.verify(&old_gca.public_bytes()));
        assert!(!m.verify(&new_gca.public_bytes()));
        assert!(m.applies_to(&device.public_bytes()));
    }
}
