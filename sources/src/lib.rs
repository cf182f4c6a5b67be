//! Diagnostic sources for triage.
//!
//! Three backend families feed the aggregation path:
//!
//! - [`LspSource`]: a long-running language server behind the shared session manager.
//! - [`LinterSource`]: a one-shot subprocess linter, run per file.
//! - [`InProcessSource`]: an incremental analyzer memoized by content hash.
//!
//! Each family has exactly one adapter translating its native output into
//! [`triage_types::Diagnostic`]. Severity and category inference live here
//! too, so nothing downstream branches on backend-specific shapes.

#![allow(clippy::missing_errors_doc)]

mod adapter;
pub mod category;
mod in_process;
mod linter;
mod lsp;
mod python;
pub mod severity;
mod source;

pub use adapter::{SourceAdapter, TranslateContext, Translation};
pub use in_process::{Analyzer, Finding, InProcessAdapter, InProcessSource, RuleSpec};
pub use linter::{LinterAdapter, LinterConfig, LinterSource, OutputFormat};
pub use lsp::{LspAdapter, LspSource};
pub use python::PythonAnalyzer;
pub use source::{CollectFut, DiagnosticSource, FileSnapshot, ForgetFut, SharedSource};
