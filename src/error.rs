use std::io;
use std::path::PathBuf;

use thiserror::Error;

pub type Result<T, E = Error> = std::result::Result<T, E>;

/// Error taxonomy for the launcher.  Worker threads own their connections'
/// errors and never propagate them past the connection; everything else
/// bubbles up through these kinds.
#[derive(Debug, Error)]
pub enum Error {
    #[error("configuration: {0}")]
    Config(String),

    #[error("sandbox build: {0}")]
    SandboxBuild(String),

    #[error("malformed loader cache: {0}")]
    MalformedCache(&'static str),

    #[error("malformed object: {}: {reason}", .path.display())]
    MalformedObject { path: PathBuf, reason: &'static str },

    #[error("unresolved library: {0}")]
    UnresolvedLibrary(String),

    #[error("library rejected by filter: {}", .0.display())]
    RejectedByFilter(PathBuf),

    #[error("unsupported ELF class: {}", .0.display())]
    UnsupportedClass(PathBuf),

    #[error("protocol violation: {0}")]
    Protocol(String),

    #[error("upstream i/o: {0}")]
    Upstream(#[from] io::Error),

    #[error("operation canceled")]
    Canceled,

    #[error("fatal: {0}")]
    Fatal(String),
}

impl Error {
    /// True when the error is a user-initiated cancellation, so front ends
    /// can suppress the failure dialog.
    pub fn is_canceled(&self) -> bool {
        matches!(self, Error::Canceled)
    }
}
