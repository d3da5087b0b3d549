//! Shared primitives for the GCA energy-reporting protocol: monotonic
//! timeslots, Ed25519 identity helpers, domain-tagged signing byte
//! encodings, and the fixed/length-prefixed wire formats of every
//! signable struct in the protocol.

pub mod error;
pub mod keys;
pub mod signing;
pub mod timeslot;
pub mod wire;

pub use error::{Error, Result};
pub use signing::SigningBytes;
pub use timeslot::Timeslot;
