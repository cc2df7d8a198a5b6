use std::fmt::Display;

/// GuardDB errors.
///
/// Every boundary operation returns one of these kinds together with a
/// message naming the failing site. Key absence is not an error: point
/// lookups return `Ok(None)`.
#[derive(Clone, Debug, PartialEq)]
pub enum Error {
    /// An IO error from the underlying file system.
    Io(String),
    /// On-disk data failed validation: bad checksums, truncated records,
    /// unparseable manifest or `CURRENT` contents.
    Corruption(String),
    /// The requested operation is not supported by this build.
    NotSupported(String),
    /// Invalid user input: bad options, mismatched comparator, malformed
    /// timestamps.
    InvalidArgument(String),
}

impl std::error::Error for Error {}

impl Display for Error {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        match self {
            Error::Io(msg) => write!(f, "io error: {msg}"),
            Error::Corruption(msg) => write!(f, "corruption: {msg}"),
            Error::NotSupported(msg) => write!(f, "not supported: {msg}"),
            Error::InvalidArgument(msg) => write!(f, "invalid argument: {msg}"),
        }
    }
}

impl Error {
    pub fn corruption(msg: impl Into<String>) -> Self {
        Error::Corruption(msg.into())
    }

    pub fn is_corruption(&self) -> bool {
        matches!(self, Error::Corruption(_))
    }
}

/// A GuardDB Result returning Error.
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

impl From<snap::Error> for Error {
    fn from(err: snap::Error) -> Self {
        Error::Corruption(err.to_string())
    }
}
