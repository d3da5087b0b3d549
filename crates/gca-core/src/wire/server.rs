//! `AuthorizedServer`: a GCA-signed directory entry. Variable-length
//! (the location label has no fixed width), so unlike the report/auth
//! structs this has no single wire-size constant; it is framed with a
//! length-prefixed encoding matching the client's `gcaServers.dat` file
//! layout described in §6 (32 B key, 1 B banned, 2 B len, location bytes,
//! 2+2+2 B ports).

use byteorder::{ByteOrder, LittleEndian};

use crate::error::{Error, Result};
use crate::keys::{self, SIGNATURE_LEN};
use crate::signing::SigningBytes;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AuthorizedServer {
    pub public_key: [u8; 32],
    pub banned: bool,
    pub location: String,
    pub http_port: u16,
    pub tcp_port: u16,
    pub udp_port: u16,
    pub gca_authorization: [u8; SIGNATURE_LEN],
}

impl SigningBytes for AuthorizedServer {
    const TAG: &'static str = "AuthorizedServer";

    fn append_signing_fields(&self, out: &mut Vec<u8>) {
        out.extend_from_slice(&self.public_key);
        out.push(self.banned as u8);
        let loc = self.location.as_bytes();
        let mut len_buf = [0u8; 2];
        LittleEndian::write_u16(&mut len_buf, loc.len() as u16);
        out.extend_from_slice(&len_buf);
        out.extend_from_slice(loc);
        let mut port_buf = [0u8; 6];
        LittleEndian::write_u16(&mut port_buf[0..2], self.http_port);
        LittleEndian::write_u16(&mut port_buf[2..4], self.tcp_port);
        LittleEndian::write_u16(&mut port_buf[4..6], self.udp_port);
        out.extend_from_slice(&port_buf);
    }
}

impl AuthorizedServer {
    pub fn verify(&self, gca_public_key: &[u8; 32]) -> bool {
        keys::verify(gca_public_key, &self.signing_bytes(), &self.gca_authorization)
    }

    /// Encode as `fields-without-signature ‖ signature`, the record
    /// layout used in `authorized-servers.dat` / `gcaServers.dat`.
    pub fn to_bytes(&self) -> Vec<u8> {
        let mut out = Vec::new();
        self.append_signing_fields(&mut out);
        out.extend_from_slice(&self.gca_authorization);
        out
    }

    /// Decode one record from the front of `bytes`, returning the record
    /// and the number of bytes consumed.
    pub fn from_bytes(bytes: &[u8]) -> Result<(Self, usize)> {
        if bytes.len() < 32 + 1 + 2 {
            return Err(Error::MalformedInput);
        }
        let mut public_key = [0u8; 32];
        public_key.copy_from_slice(&bytes[0..32]);
        let banned = bytes[32] != 0;
        let loc_len = LittleEndian::read_u16(&bytes[33..35]) as usize;
        let loc_start = 35;
        let loc_end = loc_start
            .checked_add(loc_len)
            .ok_or(Error::MalformedInput)?;
        let tail_end = loc_end.checked_add(6 + SIGNATURE_LEN).ok_or(Error::MalformedInput)?;
        if bytes.len() < tail_end {
            return Err(Error::MalformedInput);
        }
        let location = String::from_utf8(bytes[loc_start..loc_end].to_vec())
            .map_err(|_| Error::MalformedInput)?;
        let http_port = LittleEndian::read_u16(&bytes[loc_end..loc_end + 2]);
        let tcp_port = LittleEndian::read_u16(&bytes[loc_end + 2..loc_end + 4]);
        let udp_port = LittleEndian::read_u16(&bytes[loc_end + 4..loc_end + 6]);
        let mut gca_authorization = [0u8; SIGNATURE_LEN];
        gca_authorization.copy_from_slice(&bytes[loc_end + 6..tail_end]);
        Ok((
            AuthorizedServer {
                public_key,
                banned,
                location,
                http_port,
                tcp_port,
                udp_port,
                gca_authorization,
            },
            tail_end,
        ))
    }
}

/// Decode a concatenation of variable-length records, as found in
/// `authorized-servers.dat` / `gcaServers.dat`.
pub fn decode_all(mut bytes: &[u8]) -> Result<Vec<AuthorizedServer>> {
    let mut out = Vec::new();
    while !bytes.is_empty() {
        let (server, consumed) = AuthorizedServer::from_bytes(bytes)?;
        out.push(server);
        bytes = &bytes[consumed..];
    }
    Ok(out)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::keys::KeyPair;

    fn signed(gca: &KeyPair, server: &KeyPair, location: &str) -> AuthorizedServer {
        let mut s = AuthorizedServer {
            public_key: server.public_bytes(),
            banned: false,
            location: location.to_string(),
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
    fn wire_roundtrip_is_identity() {
        let gca = KeyPair::generate();
        let server = KeyPair::generate();
        let s = signed(&gca, &server, "us-east-1");
        let bytes = s.to_bytes();
        let (back, consumed) = AuthorizedServer::from_bytes(&bytes).unwrap();
        assert_eq!(consumed, bytes.len());
        assert_eq!(back, s);
    }

    #[test]
    fn decode_all_concatenated_records() {
        let gca = KeyPair::generate();
        let a = signed(&gca, &KeyPair::generate(), "a");
        let b = signed(&gca, &KeyPair::generate(), "bb");
        let mut blob = a.to_bytes();
        blob.extend_from_slice(&b.to_bytes());
        let decoded = decode_all(&blob).unwrap();
        assert_eq!(decoded, vec![a, b]);
    }

    #[test]
    fn verifies_under_gca_key() {
        let gca = KeyPair::generate();
        let s = signed(&gca, &KeyPair::generate(), "loc");
        assert!(s.verify(&gca.public_bytes()));
    }

    #[test]
    fn truncated_record_is_malformed() {
        let gca = KeyPair::generate();
        let s = signed(&gca, &KeyPair::generate(), "loc");
        let bytes = s.to_bytes();
        assert!(AuthorizedServer::from_bytes(&bytes[..bytes.len() - 1]).is_err());
    }
}
