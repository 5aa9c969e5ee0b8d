//! Database access: connection management and the audit ledger

pub mod connection;
pub mod ledger;

pub use connection::Db;
pub use ledger::{ChangeType, ImportRecord, SchemaRevertPlan, StatusReport};
