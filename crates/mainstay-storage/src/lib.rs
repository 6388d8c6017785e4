// PostgreSQL storage layer with sqlx

pub mod catalog;
pub mod contexts;
pub mod database;
pub mod encryption;
pub mod payload;
pub mod schedules;
pub mod secrets;
pub mod workers;

pub use catalog::PostgresWorkflowCatalog;
pub use contexts::PostgresContextStore;
pub use database::Database;
pub use encryption::{EncryptionError, EncryptionService};
pub use schedules::PostgresScheduleStore;
pub use secrets::PostgresSecretStore;
pub use workers::PostgresWorkerRegistry;
