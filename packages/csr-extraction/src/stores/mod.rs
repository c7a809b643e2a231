//! Storage implementations for the pipeline's collaborators.
//!
//! Available backends:
//! - `MemoryWarehouse` / `MemoryLineage` / `MemoryObjectStore` - in-memory
//!   (always available; used by tests and `--dry-run`)
//! - `HttpObjectStore` - HTTP object store gateway
//! - `PostgresWarehouse` / `PostgresLineage` - PostgreSQL (requires the
//!   `postgres` feature)

pub mod http;
pub mod memory;

#[cfg(feature = "postgres")]
pub mod postgres;

pub use http::HttpObjectStore;
pub use memory::{MemoryLineage, MemoryObjectStore, MemoryWarehouse};

#[cfg(feature = "postgres")]
pub use postgres::{PostgresLineage, PostgresWarehouse};
