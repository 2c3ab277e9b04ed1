//! Host-root indirection (spec §4.9): every stat/readlink/open the
//! resolver performs goes through here so tests can point the whole
//! exposer at a throwaway directory instead of the real `/`.

use std::ffi::CString;
use std::os::unix::io::RawFd;

use crate::error::{ExposerError, Result};

/// Where filesystem lookups are rooted.
///
/// `Real` issues plain absolute-path syscalls. `Mock` translates every
/// absolute path into an `*at()` call relative to a held directory file
/// descriptor, so a test can stand up a scratch directory tree and
/// exercise the resolver against it without touching the real host.
pub enum HostRoot {
    Real,
    Mock { fd: RawFd },
}

impl HostRoot {
    /// Open `path` for use as a host root in [`HostRoot::Mock`] mode.
    pub fn open_mock(path: &std::path::Path) -> std::io::Result<Self> {
        let c_path = path_to_cstring(path)?;
        let fd = unsafe { libc::open(c_path.as_ptr(), libc::O_PATH | libc::O_DIRECTORY) };
        if fd < 0 {
            return Err(std::io::Error::last_os_error());
        }
        Ok(HostRoot::Mock { fd })
    }

    /// Resolve an absolute path to the `(dirfd, relative_path)` pair that
    /// an `*at()` syscall should use. Under [`HostRoot::Real`] this is
    /// `(AT_FDCWD, path)` unchanged; under [`HostRoot::Mock`], `/` maps to
    /// a zero-length relative lookup on the root fd itself, and every
    /// other absolute path has its leading slash stripped.
    pub fn resolve<'a>(&self, path: &'a str) -> (RawFd, &'a str) {
        match self {
            HostRoot::Real => (libc::AT_FDCWD, path),
            HostRoot::Mock { fd } => {
                if path == "/" {
                    (*fd, "")
                } else {
                    (*fd, path.trim_start_matches('/'))
                }
            }
        }
    }

    /// Confirm that `resolved` (an absolute path produced by following a
    /// symlink) still lives inside this host root. Always true for
    /// [`HostRoot::Real`]; for [`HostRoot::Mock`] any caller is expected
    /// to have already constrained `resolved` to start with `/`, so the
    /// only possible escape is a `..`-laden target, which lexical
    /// canonicalization removes before this is called.
    pub fn check_contains(&self, original: &str, resolved: &str) -> Result<()> {
        if resolved.starts_with('/') && !resolved.contains("..") {
            Ok(())
        } else {
            Err(ExposerError::SymlinkEscape { path: original.to_owned() })
        }
    }
}

fn path_to_cstring(path: &std::path::Path) -> std::io::Result<CString> {
    use std::os::unix::ffi::OsStrExt;
    CString::new(path.as_os_str().as_bytes())
        .map_err(|e| std::io::Error::new(std::io::ErrorKind::InvalidInput, e))
}

impl Drop for HostRoot {
    fn drop(&mut self) {
        if let HostRoot::Mock { fd } = self {
            unsafe {
                libc::close(*fd);
            }
        }
    }
}
