//! Domain models

pub mod file;

pub use file::{File, FileStatus, NewFile};
