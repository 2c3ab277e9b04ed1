//! Error types for the host-filesystem exposer.
//!
//! Most failure modes in spec §7 (missing path, autofs timeout) are
//! silently-skip cases handled by returning `Ok(())` with nothing
//! recorded; the variants here cover the ones that must propagate:
//! symlink escape out of a host-root, and lower-level I/O failure that
//! isn't one of the "not present" cases.

use thiserror::Error;

/// Errors raised while resolving or emitting an exposure request.
#[derive(Debug, Error)]
pub enum ExposerError {
    /// A symlink resolved outside of a configured host-root (spec §4.9).
    /// Only possible when operating in host-root mode; escaping the real
    /// root is not meaningful since there is nothing to escape from.
    #[error("symlink resolution for {path} escaped the host root")]
    SymlinkEscape {
        /// The original path whose resolution escaped.
        path: String,
    },

    /// The bounded recursion depth (40, the kernel `ELOOP` bound) was
    /// exceeded while walking symlinks.
    #[error("symlink depth exceeded while resolving {path}")]
    DepthExceeded {
        /// The original path whose resolution looped.
        path: String,
    },

    /// Underlying I/O failure other than "not present" (permission
    /// denied, I/O error from the filesystem, etc).
    #[error("i/o error resolving {path}: {source}")]
    Io {
        /// The path being resolved when the failure occurred.
        path: String,
        /// The underlying I/O error.
        #[source]
        source: std::io::Error,
    },
}

/// Result alias used throughout path resolution and emission.
pub type Result<T> = std::result::Result<T, ExposerError>;
