//! Server module - Unix socket front end
//!
//! Clients connect to the agent's socket and exchange newline-delimited JSON:
//! one [`AssessRequest`] per line in, one [`AssessResponse`] or
//! [`ErrorResponse`] per line out.

mod handler;
mod listener;
mod protocol;

pub use handler::{AssessError, RequestHandler};
pub use listener::SocketListener;
pub use protocol::{AssessRequest, AssessResponse, ErrorResponse};

use std::path::PathBuf;

use thiserror::Error;

/// Errors raised by the socket listener
#[derive(Debug, Error)]
pub enum ServerError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Failed to bind {path}: {source}")]
    Bind {
        path: PathBuf,
        source: std::io::Error,
    },

    /// Another process is accepting connections on the socket
    #[error("Socket {0} is already in use by another agent")]
    AlreadyInUse(PathBuf),

    #[error("Path {0} exists but is not a socket")]
    NotASocket(PathBuf),
}
