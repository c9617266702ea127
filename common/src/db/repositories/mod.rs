// PostgreSQL repositories backing the storage seams

pub mod deliveries;
pub mod events;
pub mod identities;

pub use deliveries::PgLedgerStore;
pub use events::PgEventStore;
pub use identities::PgIdentityDirectory;
