//! Metadata store for file records.
//!
//! `FileRepository` is the contract the orchestrator depends on. Postgres is
//! the production implementation; the in-memory one backs the test suites and
//! scratch runs.

pub mod memory;
pub mod postgres;
pub mod repository;
pub mod setup;

pub use memory::InMemoryFileRepository;
pub use postgres::PgFileRepository;
pub use repository::{FileRepository, FileTransaction};
pub use setup::setup_database;
