use std::fmt::Display;

/// EmberDB errors.
///
/// The enum is `Clone + PartialEq` so a failure recorded on the write path
/// (a poisoned store) can be handed back verbatim to every later writer.
#[derive(Clone, Debug, PartialEq)]
pub enum Error {
    /// On-disk data failed an integrity check: bad magic, bad CRC, framing
    /// that does not decode, or level metadata that contradicts itself.
    Corruption(String),
    /// An IO error from the filesystem.
    Io(String),
    /// Caller misuse: bad options, oversized keys, operations on a closed
    /// store.
    InvalidArgument(String),
    /// The requested behavior is not implemented by this build.
    NotSupported(String),
    /// A write was attempted on a sealed memtable.
    Sealed,
}

impl std::error::Error for Error {}

impl Display for Error {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        match self {
            Error::Corruption(msg) => write!(f, "corruption: {msg}"),
            Error::Io(msg) => write!(f, "io error: {msg}"),
            Error::InvalidArgument(msg) => write!(f, "invalid argument: {msg}"),
            Error::NotSupported(msg) => write!(f, "not supported: {msg}"),
            Error::Sealed => write!(f, "write attempted on sealed memtable"),
        }
    }
}

/// An EmberDB Result.
pub type Result<T> = std::result::Result<T, Error>;

impl From<std::io::Error> for Error {
    fn from(err: std::io::Error) -> Self {
        Error::Io(err.to_string())
    }
}

impl<T> From<std::sync::PoisonError<T>> for Error {
    fn from(err: std::sync::PoisonError<T>) -> Self {
        Error::Io(err.to_string())
    }
}
