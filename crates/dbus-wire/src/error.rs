use std::fmt;

/// Result alias using an [`Error`] as the error type by default.
pub type Result<T, E = Error> = std::result::Result<T, E>;

/// An error raised while decoding or validating a piece of the wire format.
#[derive(Debug)]
pub struct Error {
    kind: ErrorKind,
}

impl Error {
    /// Construct a new error from its kind.
    #[inline]
    pub fn new(kind: ErrorKind) -> Self {
        Self { kind }
    }

    /// The kind of error that occurred.
    #[inline]
    pub fn kind(&self) -> &ErrorKind {
        &self.kind
    }
}

impl From<ErrorKind> for Error {
    #[inline]
    fn from(kind: ErrorKind) -> Self {
        Self::new(kind)
    }
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.kind.fmt(f)
    }
}

impl std::error::Error for Error {}

/// The specific reason a wire-format value was rejected.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[non_exhaustive]
pub enum ErrorKind {
    /// A byte did not match either of the two defined endianness markers.
    InvalidEndianness(u8),
    /// An object path failed validation (see [`ObjectPath`][crate::ObjectPath]).
    InvalidObjectPath,
    /// A type signature used a type code outside of the supported subset,
    /// or was malformed.
    InvalidSignature,
    /// A string field was missing its mandatory nul terminator.
    NotNullTerminated,
    /// A string was not valid UTF-8.
    InvalidUtf8,
    /// A length-prefixed field claimed a length larger than the buffer
    /// actually contains, or larger than the protocol maximum.
    LengthOutOfBounds,
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ErrorKind::InvalidEndianness(byte) => {
                write!(f, "invalid endianness marker `{byte:#x}`")
            }
            ErrorKind::InvalidObjectPath => write!(f, "invalid object path"),
            ErrorKind::InvalidSignature => write!(f, "invalid type signature"),
            ErrorKind::NotNullTerminated => write!(f, "string is not nul terminated"),
            ErrorKind::InvalidUtf8 => write!(f, "string is not valid utf-8"),
            ErrorKind::LengthOutOfBounds => write!(f, "length-prefixed field out of bounds"),
        }
    }
}
