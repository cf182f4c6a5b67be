//! LSP client and Backend Session Manager for language server diagnostics.

pub mod codec;
pub mod types;

pub(crate) mod protocol;
pub(crate) mod server;

mod manager;
mod session;

#[cfg(any(test, feature = "test-support"))]
pub mod fake;

pub use manager::{LaunchFut, ProcessLauncher, ServerLauncher, SessionManager};
pub use protocol::{PathToUriError, file_uri_to_path, path_to_file_uri};
pub use server::ServerTransport;
pub use session::SessionHandle;
pub use types::{ServerConfig, SessionError, SessionSettings, SessionState, SessionStatus};
