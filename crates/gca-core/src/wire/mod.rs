pub mod auth;
pub mod migration;
pub mod report;
pub mod server;

pub use auth::EquipmentAuthorization;
pub use migration::EquipmentMigration;
pub use report::EquipmentReport;
pub use server::AuthorizedServer;
