//! Error type shared by every layer of the reader.

use std::io;

pub type Result<T> = std::result::Result<T, Error>;

#[derive(Debug, thiserror::Error)]
pub enum Error
{
    #[error("remote unavailable: {url}: {message}")]
    RemoteUnavailable { url: String, message: String },

    #[error("not found: {0}")]
    NotFound(String),

    #[error("range request not satisfied for {url} (HTTP status {status})")]
    RangeUnsupported { url: String, status: u16 },

    #[error("corrupt BGZF block at compressed offset {offset}: {message}")]
    CorruptBlock { offset: u64, message: String },

    #[error("truncated record: expected {expected} bytes, {available} available")]
    TruncatedRecord { expected: usize, available: usize },

    #[error("malformed record: {0}")]
    MalformedRecord(String),

    #[error("invalid BAM header: {0}")]
    InvalidHeader(String),

    #[error("corrupt index: {0}")]
    CorruptIndex(String),

    #[error("unknown reference sequence: {0}")]
    UnknownReference(String),

    #[error("iterator has been closed")]
    IteratorClosed,

    #[error("reader has been closed")]
    ReaderClosed,

    #[error("io error: {0}")]
    Io(io::Error),
}

impl Error
{
    /// Whether a retry of the failed operation may succeed.
    pub fn is_transient(&self) -> bool
    {
        matches!(self, Error::RemoteUnavailable { .. })
    }

    /// Wrap this error so it can travel through `std::io::Read` implementations.
    pub(crate) fn into_io(self) -> io::Error
    {
        match self
        {
            Error::Io(e) => e,
            other => io::Error::new(io::ErrorKind::Other, other),
        }
    }
}

impl From<io::Error> for Error
{
    /// Recovers a crate error that was wrapped by [`Error::into_io`].
    fn from(e: io::Error) -> Self
    {
        let wrapped = e.get_ref().map(|inner| inner.is::<Error>()).unwrap_or(false);
        if !wrapped
        {
            return Error::Io(e);
        }

        let kind = e.kind();
        match e.into_inner().map(|inner| inner.downcast::<Error>())
        {
            Some(Ok(err)) => *err,
            Some(Err(other)) => Error::Io(io::Error::new(kind, other)),
            None => Error::Io(io::Error::from(kind)),
        }
    }
}
