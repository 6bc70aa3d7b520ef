//! Error taxonomy shared by the session layer and the CLI.

use std::io;

use thiserror::Error;

pub type Result<T> = std::result::Result<T, Error>;

#[derive(Debug, Error)]
pub enum Error {
    #[error("invalid detach key: {0:?} (use e.g. \"~.\", \"ctrl-a\" or \"^a\")")]
    DetachKey(String),

    #[error("invalid session name: {0:?}")]
    InvalidName(String),

    #[error("session {0:?} already exists")]
    AlreadyExists(String),

    #[error("session {0:?} does not exist")]
    NotFound(String),

    #[error("already inside session {0:?} (unset ROOST_SESSION to override)")]
    Nested(String),

    #[error("failed to start {command:?}: {source}")]
    Spawn {
        command: String,
        #[source]
        source: io::Error,
    },

    #[error("could not determine a data directory for session files")]
    NoDataDir,

    #[error("protocol error: {0}")]
    Protocol(String),

    #[error(transparent)]
    Io(#[from] io::Error),
}
