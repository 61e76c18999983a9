//! SQLite storage: connection pool and the workflow repository.

pub mod pool;
pub mod workflow;
