//! Diagnostic record model for triage.
//!
//! This crate contains pure domain types with no IO, no async, and minimal dependencies.
//! Every backend's output is translated into these types at the adapter boundary;
//! the aggregation, cache, and query layers only ever see [`Diagnostic`].

#![allow(clippy::missing_errors_doc)]
#![allow(clippy::missing_panics_doc)]

mod collection;
mod diagnostic;
mod error;
mod filter;
mod ids;

pub use collection::{DiagnosticSet, ErrorCollection, FileErrorCount, SummaryStats};
pub use diagnostic::{
    Category, Diagnostic, DiagnosticDraft, FixDescriptor, Position, Severity, SourceKind, TextEdit,
};
pub use error::SourceError;
pub use filter::DiagnosticFilter;
pub use ids::{DiagnosticId, SnapshotVersion};
