//! Domain types shared by the ledger clients and the facade.

pub mod actor;
pub mod entry;

pub use actor::ActorId;
pub use entry::{AccessLogEntry, RecordEntry};
