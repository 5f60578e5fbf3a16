pub mod error;
pub mod executor;
pub mod migrations;
pub mod quote_store;
pub mod runner;
pub mod schema;

pub use error::{MigrationError, StatementError};
pub use executor::{Executor, SchemaVersionRecord, SqliteExecutor};
pub use migrations::{Migration, Phase};
pub use quote_store::{QuoteRecord, QuoteStore};
pub use runner::{ApplyReport, MigrationRunner, MigrationStatus, RollbackReport};
