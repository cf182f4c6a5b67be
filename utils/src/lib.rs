//! Shared infrastructure utilities for triage.
//!
//! - **`atomic_write`**: Crash-safe source file replacement (temp + rename)
//! - **`diff`**: Unified diff rendering and stats for fix previews

pub mod atomic_write;
pub mod diff;

pub use atomic_write::{
    AtomicWriteOptions, FileSyncPolicy, PersistMode, atomic_write, atomic_write_with_options,
};
pub use diff::{DiffStats, compute_diff_stats, format_unified_diff};
