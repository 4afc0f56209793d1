//! Primary store: the durable, strongly consistent system of record.
//!
//! Every successful commit assigns the next revision for its key. Commits for
//! the same key are serialized, and a replayed idempotency token returns the
//! entity its first commit produced instead of writing again.

pub mod memory;
pub mod postgres;
pub mod store;

pub use memory::MemoryPrimaryStore;
pub use postgres::PgPrimaryStore;
pub use store::{CommitOutcome, PrimaryStore};
