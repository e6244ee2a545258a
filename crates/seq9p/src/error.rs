//! Client error type.

use std::{io, sync::Arc};

use thiserror::Error;

/// Errors surfaced by connections, fids and sequencers.
///
/// The type is `Clone` because a transport failure is sticky: the same error is
/// handed to every request waiting on the connection and to every later caller.
#[derive(Debug, Clone, Error)]
pub enum Error {
    /// I/O failure on the underlying byte stream.
    #[error("i/o error: {0}")]
    Io(Arc<io::Error>),

    /// Malformed message, unexpected reply type or an impossible reply.
    #[error("protocol error: {0}")]
    Protocol(String),

    /// Error text carried by an `Rerror`.
    #[error("{0}")]
    Server(String),

    /// A sequence was cancelled, or another operation in its tree failed.
    #[error("sequence aborted")]
    Aborted,

    #[error("out of tags")]
    OutOfTags,

    #[error("out of fids")]
    OutOfFids,

    /// The connection was closed locally.
    #[error("connection hung up")]
    Hungup,

    /// A fid handed out as the target of a clone is already in use.
    #[error("fid in use")]
    FidInUse,

    /// The fid is owned by a live sequence, or a request creating it is in flight.
    #[error("fid is owned by a sequence")]
    FidBusy,

    /// The fid does not refer to anything on the server.
    #[error("fid is not allocated")]
    BadFid,

    #[error("file is not open")]
    NotOpen,

    #[error("not a directory")]
    NotDir,

    #[error("file is already open")]
    AlreadyOpen,

    /// A request was submitted to a sequence that has already ended.
    #[error("sequence has terminated")]
    Terminated,

    #[error("empty path")]
    EmptyPath,

    /// A walk stopped short of its last element.
    #[error("file '{0}' not found")]
    NotFound(String),

    #[error("invalid argument: {0}")]
    InvalidInput(String),
}

impl From<io::Error> for Error {
    fn from(e: io::Error) -> Self {
        Error::Io(Arc::new(e))
    }
}

impl Error {
    /// True for errors that leave the whole connection unusable.
    pub fn is_fatal(&self) -> bool {
        matches!(self, Error::Io(_) | Error::Protocol(_) | Error::Hungup)
    }
}
