//! Database models, schema management and maintenance primitives

pub mod init;
pub mod migration_log;
pub mod migrations;
pub mod models;
pub mod rebuild;
pub mod schema_sync;
pub mod snapshot;
pub mod table_schemas;

pub use init::*;
pub use migration_log::*;
pub use migrations::*;
pub use models::*;
pub use rebuild::*;
pub use schema_sync::*;
pub use snapshot::*;
pub use table_schemas::*;
