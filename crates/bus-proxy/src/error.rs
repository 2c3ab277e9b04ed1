//! Error types for the bus proxy.
//!
//! Wire-format errors bubble up from `dbus_wire`; everything above that
//! (malformed framing in context, serial regression, fd-count mismatch,
//! CLI parsing) gets its own variant here so callers can tell "close the
//! connection" apart from "exit the process".

use thiserror::Error;

/// Errors raised while handling a single client/bus connection pair.
///
/// Every variant here corresponds to a connection-closing condition in
/// spec §7; there is no variant that is merely logged and ignored, those
/// cases are handled by returning `Ok` with a dropped frame instead.
#[derive(Debug, Error)]
pub enum ProxyError {
    /// The frame codec could not parse a message from the peer.
    #[error("malformed frame: {0}")]
    MalformedFrame(String),

    /// A client-to-bus serial did not strictly increase.
    #[error("serial regression: saw {got}, expected > {last}")]
    SerialRegression {
        /// The serial that violated monotonicity.
        got: u32,
        /// The last serial accepted from this client.
        last: u32,
    },

    /// The number of ancillary descriptors attached to a frame did not
    /// match its `unix_fds` header field.
    #[error("unix_fds mismatch: header says {expected}, received {got}")]
    FdCountMismatch {
        /// The count declared in the header.
        expected: u32,
        /// The count actually received via `SCM_RIGHTS`.
        got: u32,
    },

    /// Underlying I/O failure on a client or bus socket.
    #[error("i/o error: {0}")]
    Io(#[from] std::io::Error),

    /// A wire-format primitive rejected its input.
    #[error("wire format error: {0}")]
    Wire(#[from] dbus_wire::Error),
}

/// Result alias used throughout connection handling.
pub type Result<T> = std::result::Result<T, ProxyError>;

/// Errors raised while parsing the process command line (spec §6).
#[derive(Debug, Error)]
pub enum CliError {
    /// A flag or positional argument was missing, malformed, or out of
    /// place.
    #[error("{0}")]
    Usage(String),
}
