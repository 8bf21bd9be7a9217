//! Infrastructure layer - Storage engines
//!
//! - `memory_store`: in-process engine (`memory:`)
//! - `sqlite_store`: file-backed engine (`sqlite:<path>`, `sqlite` feature)

pub mod eval;
pub mod memory_store;

#[cfg(feature = "sqlite")]
pub mod sqlite_store;

pub use memory_store::{MemoryEngine, MemoryTransaction};

#[cfg(feature = "sqlite")]
pub use sqlite_store::{SqliteEngine, SqliteTransaction};
