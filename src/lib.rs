//! Remote development agent.
//!
//! Exposes one working directory to a remote client over HTTP: sandboxed file
//! operations, name search, one-shot commands and interactive pty terminals
//! over websockets, all behind a shared bearer token.

pub mod auth;
pub mod config;
pub mod error;
pub mod exec;
pub mod files;
pub mod http_server;
pub mod protocol;
pub mod pty;
pub mod sandbox;
pub mod search;
pub mod state;
pub mod terminal;

pub use config::AgentConfig;
pub use error::AgentError;
pub use state::AppState;
