// PostgreSQL adapters for the storage seams

pub mod pool;
pub mod repositories;

pub use pool::DbPool;
pub use repositories::{PgEventStore, PgIdentityDirectory, PgLedgerStore};
