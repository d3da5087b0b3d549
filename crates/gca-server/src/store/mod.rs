pub mod auth_store;
pub mod directory_store;
pub mod gca_identity;
pub mod report_store;

pub use auth_store::AuthStore;
pub use directory_store::DirectoryStore;
pub use gca_identity::GcaIdentity;
pub use report_store::ReportStore;
