//! Deterministic, domain-tagged byte encodings that back every signature
//! in the protocol. Every signable struct is encoded as
//! `tag ‖ fields-without-signature`, so a signature over one struct kind
//! can never be replayed as a signature over another.

/// Implemented by every struct that carries a signature over its own
/// canonical encoding.
pub trait SigningBytes {
    /// The domain-separation tag prepended to the encoding, e.g.
    /// `"EquipmentAuthorization"`.
    const TAG: &'static str;

    /// Append this struct's fields (excluding its own signature) to `out`.
    fn append_signing_fields(&self, out: &mut Vec<u8>);

    /// `TAG ‖ fields-without-signature`, byte-for-byte deterministic.
    fn signing_bytes(&self) -> Vec<u8> {
        let mut out = Vec::new();
        out.extend_from_slice(Self::TAG.as_bytes());
        self.append_signing_fields(&mut out);
        out
    }
}
