use thiserror::Error;

/// Error kinds shared by the ingest path, the store layer and the sync
/// protocol. Ingest-path errors are absorbed by the caller (§7); HTTP
/// handlers map these to status codes; nothing here carries internal
/// detail that would leak across a trust boundary.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum Error {
    #[error("malformed input")]
    MalformedInput,

    #[error("bad signature")]
    BadSignature,

    #[error("unknown equipment")]
    UnknownEquipment,

    #[error("banned equipment")]
    BannedEquipment,

    #[error("timeslot out of range")]
    SlotOutOfRange,

    #[error("slot is banned")]
    SlotBanned,

    #[error("slot conflict, banning")]
    SlotConflict,

    #[error("duplicate authorization, banning short id")]
    DuplicateAuthorization,

    #[error("gca already registered")]
    GcaAlreadyRegistered,

    #[error("server unreachable")]
    ServerUnreachable,

    #[error("stale response")]
    StaleResponse,

    #[error("io failure: {0}")]
    IoFailure(String),
}

impl From<std::io::Error> for Error {
    fn from(e: std::io::Error) -> Self {
        Error::IoFailure(e.to_string())
    }
}

pub type Result<T> = std::result::Result<T, Error>;
