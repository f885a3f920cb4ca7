pub mod access;
pub mod memory;
pub mod pg;
pub mod store;

pub use access::ScopeAccessChecker;
pub use memory::{InMemoryEventLog, InMemoryStore};
pub use pg::PgStore;
pub use store::{AccessChecker, DocumentStore, EventLog};
