pub mod connection;
pub mod ledger;
pub mod migrations;
pub mod readonly;
pub mod repositories;

pub use connection::{connect, connect_with_settings, DbPool};
pub use ledger::{AppliedEntry, LeadLedger};
pub use readonly::{QueryRows, ReadOnlyError, ReadOnlyExecutor};
