use std::io;

use thiserror::Error;

pub type Result<T> = std::result::Result<T, Error>;

#[derive(Debug, Error)]
pub enum Error {
    /// Returned by `write` when the pane has no live session. `resize` and
    /// `signal` never return this; they log and no-op instead.
    #[error("session {0} not found or not alive")]
    SessionNotFound(String),

    #[error("failed to spawn pty process: {0}")]
    Spawn(#[source] io::Error),

    #[error("history store: {0}")]
    History(#[source] io::Error),

    #[error(transparent)]
    Io(#[from] io::Error),
}
