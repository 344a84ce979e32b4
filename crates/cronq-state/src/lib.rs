// Storage backends for the cronq engine: PostgreSQL (the production store)
// and an in-process memory store with the same observable semantics.

mod memory;
mod postgres;

pub use memory::MemoryStore;
pub use postgres::PostgresStore;
