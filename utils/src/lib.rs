//! Shared infrastructure utilities for the cona bridge.
//!
//! - **`atomic_file`**: crash-safe whole-file replacement (temp + rename)

pub mod atomic_file;

pub use atomic_file::{AtomicFile, PersistMode};
