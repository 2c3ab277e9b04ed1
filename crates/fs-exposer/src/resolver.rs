//! Path Resolver (spec §4.7): turns one requested `(mode, path)` exposure
//! into zero or more [`ExportEntry`](crate::export_table::ExportEntry)
//! records, following non-terminal symlinks and bailing out (silently,
//! per spec §7) the moment the path turns out not to exist, sit under a
//! reserved directory, or block behind an autofs mount longer than the
//! probe allows.

use std::collections::VecDeque;
use std::ffi::CString;
use std::os::unix::io::RawFd;

use crate::autofs;
use crate::error::{ExposerError, Result};
use crate::export_table::{ExportTable, ExposeMode};
use crate::hostroot::HostRoot;

/// Kernel `ELOOP` bound (spec §4.7): at most this many symlinks are
/// followed while resolving a single exposure request.
const MAX_SYMLINK_DEPTH: u32 = 40;

/// The fixed reserved-path prefixes from spec §4.7, plus whatever
/// usrmerged directories the caller has configured.
#[derive(Debug, Clone, Default)]
pub struct ReservedPaths {
    usrmerged: Vec<String>,
}

const FIXED_RESERVED: &[&str] = &["/usr", "/etc", "/app", "/dev", "/proc"];

impl ReservedPaths {
    pub fn new(usrmerged: Vec<String>) -> Self {
        Self { usrmerged }
    }

    pub fn usrmerged(&self) -> &[String] {
        &self.usrmerged
    }

    /// True if `path` is exactly, or nested under, a reserved directory.
    pub fn contains(&self, path: &str) -> bool {
        FIXED_RESERVED.iter().any(|r| is_under(path, r)) || self.usrmerged.iter().any(|r| is_under(path, r))
    }
}

fn is_under(path: &str, root: &str) -> bool {
    path == root || path.starts_with(&format!("{root}/"))
}

/// Resolve and record `path` at `mode` into `table`. Relative paths and
/// paths under a reserved directory are rejected quietly, as is any path
/// that turns out not to exist or to sit behind an unresponsive autofs
/// mount (spec §7). Only a genuine host-root escape or a pathological
/// symlink loop is surfaced as an `Err`.
pub fn expose(table: &mut ExportTable, host_root: &HostRoot, reserved: &ReservedPaths, path: &str, mode: ExposeMode) -> Result<()> {
    if !path.starts_with('/') {
        return Ok(());
    }
    let canonical = lexical_canonicalize(path);
    if reserved.contains(&canonical) {
        return Ok(());
    }

    walk(table, host_root, reserved, &canonical, mode)
}

/// Walk `canonical`'s segments left to right, substituting in symlink
/// targets as they're found, and record an entry for the terminal
/// segment once reached.
fn walk(table: &mut ExportTable, host_root: &HostRoot, reserved: &ReservedPaths, canonical: &str, mode: ExposeMode) -> Result<()> {
    let mut remaining: VecDeque<String> = segments(canonical);
    let mut current = String::new();
    let mut depth = 0u32;

    while let Some(segment) = remaining.pop_front() {
        let candidate = join(&current, &segment);
        let is_terminal = remaining.is_empty();

        let fd = match open_path_nofollow(host_root, &candidate) {
            Ok(fd) => fd,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(()),
            Err(e) => return Err(ExposerError::Io { path: candidate, source: e }),
        };

        let kind = match fstat_kind(fd) {
            Ok(kind) => kind,
            Err(e) => {
                close(fd);
                return Err(ExposerError::Io { path: candidate, source: e });
            }
        };

        if !matches!(kind, FileKind::Dir | FileKind::Regular | FileKind::Symlink | FileKind::Socket) {
            close(fd);
            return Ok(());
        }

        match autofs::fstatfs(fd) {
            Ok(statfs) if autofs::is_autofs(&statfs) => {
                let (dir_fd, relative) = host_root.resolve(&candidate);
                if !autofs::probe(dir_fd, relative) {
                    close(fd);
                    return Ok(());
                }
            }
            Ok(_) => {}
            Err(e) => {
                close(fd);
                return Err(ExposerError::Io { path: candidate, source: e });
            }
        }

        if kind == FileKind::Symlink && !is_terminal && candidate != "/tmp" {
            depth += 1;
            if depth > MAX_SYMLINK_DEPTH {
                close(fd);
                return Err(ExposerError::DepthExceeded { path: canonical.to_owned() });
            }

            let target = match readlink_via_fd(fd) {
                Ok(target) => target,
                Err(e) => {
                    close(fd);
                    return Err(ExposerError::Io { path: candidate, source: e });
                }
            };
            close(fd);

            let resolved_target = resolve_symlink_target(&current, &target);
            host_root.check_contains(&candidate, &resolved_target)?;

            if reserved.contains(&resolved_target) {
                return Ok(());
            }

            table.merge(&candidate, ExposeMode::Symlink, Some(resolved_target.trim_start_matches('/')));

            let mut new_remaining = segments(&resolved_target);
            new_remaining.extend(remaining.drain(..));
            remaining = new_remaining;
            current = String::new();
            continue;
        }

        close(fd);
        current = candidate;

        if is_terminal {
            table.merge(&current, mode, None);
        }
    }

    Ok(())
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum FileKind {
    Dir,
    Regular,
    Symlink,
    Socket,
    Other,
}

/// Look up `path` at emission time: its kind, and, if it's a symlink,
/// the absolute canonical path it resolves to. Returns `None` if `path`
/// doesn't exist. Used by the emitter to decide real-host-directory and
/// symlink-vs-bind questions (spec §4.8) without re-running the full
/// exposure walk.
pub(crate) fn lookup(host_root: &HostRoot, path: &str) -> Option<(FileKind, Option<String>)> {
    let fd = open_path_nofollow(host_root, path).ok()?;
    let kind = fstat_kind(fd).ok();
    let target = match kind {
        Some(FileKind::Symlink) => readlink_via_fd(fd).ok().map(|t| resolve_symlink_target(&parent_dir(path), &t)),
        _ => None,
    };
    close(fd);
    kind.map(|kind| (kind, target))
}

fn parent_dir(path: &str) -> String {
    match path.rfind('/') {
        Some(0) => String::new(),
        Some(idx) => path[..idx].to_owned(),
        None => String::new(),
    }
}

fn classify(mode: libc::mode_t) -> FileKind {
    match mode & libc::S_IFMT {
        libc::S_IFDIR => FileKind::Dir,
        libc::S_IFREG => FileKind::Regular,
        libc::S_IFLNK => FileKind::Symlink,
        libc::S_IFSOCK => FileKind::Socket,
        _ => FileKind::Other,
    }
}

fn open_path_nofollow(host_root: &HostRoot, path: &str) -> std::io::Result<RawFd> {
    let (dir_fd, relative) = host_root.resolve(path);
    let c_relative = CString::new(relative).map_err(|e| std::io::Error::new(std::io::ErrorKind::InvalidInput, e))?;
    let fd = unsafe { libc::openat(dir_fd, c_relative.as_ptr(), libc::O_PATH | libc::O_NOFOLLOW | libc::O_CLOEXEC) };
    if fd < 0 {
        return Err(std::io::Error::last_os_error());
    }
    Ok(fd)
}

fn fstat_kind(fd: RawFd) -> std::io::Result<FileKind> {
    let mut stat: libc::stat = unsafe { std::mem::zeroed() };
    let rc = unsafe { libc::fstat(fd, &mut stat) };
    if rc < 0 {
        return Err(std::io::Error::last_os_error());
    }
    Ok(classify(stat.st_mode))
}

fn readlink_via_fd(fd: RawFd) -> std::io::Result<String> {
    let proc_path = CString::new(format!("/proc/self/fd/{fd}")).expect("no interior nul");
    let mut buf = vec![0u8; libc::PATH_MAX as usize];
    let n = unsafe { libc::readlink(proc_path.as_ptr(), buf.as_mut_ptr() as *mut libc::c_char, buf.len()) };
    if n < 0 {
        return Err(std::io::Error::last_os_error());
    }
    buf.truncate(n as usize);
    Ok(String::from_utf8_lossy(&buf).into_owned())
}

fn close(fd: RawFd) {
    unsafe {
        libc::close(fd);
    }
}

/// Resolve a symlink's `target` against the directory that contains it
/// (`parent`, `""` meaning root), then lexically canonicalize the result.
fn resolve_symlink_target(parent: &str, target: &str) -> String {
    if target.starts_with('/') {
        lexical_canonicalize(target)
    } else {
        lexical_canonicalize(&join(parent, target))
    }
}

fn join(parent: &str, segment: &str) -> String {
    if parent.is_empty() {
        format!("/{segment}")
    } else {
        format!("{parent}/{segment}")
    }
}

/// Split an absolute path into its non-empty segments.
fn segments(path: &str) -> VecDeque<String> {
    path.split('/').filter(|s| !s.is_empty()).map(str::to_owned).collect()
}

/// Resolve `.` and `..` and collapse repeated slashes, purely lexically
/// (no filesystem access): the canonicalization step of spec §4.7.3.
fn lexical_canonicalize(path: &str) -> String {
    let mut stack: Vec<&str> = Vec::new();
    for segment in path.split('/') {
        match segment {
            "" | "." => continue,
            ".." => {
                stack.pop();
            }
            other => stack.push(other),
        }
    }
    if stack.is_empty() {
        "/".to_owned()
    } else {
        format!("/{}", stack.join("/"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn lexical_canonicalize_collapses_dot_and_dotdot() {
        assert_eq!(lexical_canonicalize("/a/./b/../c"), "/a/c");
        assert_eq!(lexical_canonicalize("/a//b///c"), "/a/b/c");
        assert_eq!(lexical_canonicalize("/"), "/");
        assert_eq!(lexical_canonicalize("/.."), "/");
    }

    #[test]
    fn reserved_paths_match_exact_and_nested() {
        let reserved = ReservedPaths::new(vec!["/lib".to_owned()]);
        assert!(reserved.contains("/usr"));
        assert!(reserved.contains("/usr/bin"));
        assert!(reserved.contains("/lib/x86_64-linux-gnu"));
        assert!(!reserved.contains("/usrlocal"));
        assert!(!reserved.contains("/home"));
    }

    #[test]
    fn resolve_symlink_target_handles_relative_and_absolute() {
        assert_eq!(resolve_symlink_target("/home", "/var/home"), "/var/home");
        assert_eq!(resolve_symlink_target("", "var/home"), "/var/home");
        assert_eq!(resolve_symlink_target("/a/b", "../c"), "/a/c");
    }

    #[test]
    fn expose_rejects_relative_paths_quietly() {
        let mut table = ExportTable::new();
        let host_root = HostRoot::Real;
        let reserved = ReservedPaths::default();
        expose(&mut table, &host_root, &reserved, "relative/path", ExposeMode::ReadOnlyBind).unwrap();
        assert!(table.is_empty());
    }

    #[test]
    fn expose_rejects_reserved_paths_quietly() {
        let mut table = ExportTable::new();
        let host_root = HostRoot::Real;
        let reserved = ReservedPaths::default();
        expose(&mut table, &host_root, &reserved, "/usr/bin/env", ExposeMode::ReadOnlyBind).unwrap();
        assert!(table.is_empty());
    }

    #[test]
    fn expose_skips_missing_path_quietly() {
        let mut table = ExportTable::new();
        let host_root = HostRoot::Real;
        let reserved = ReservedPaths::default();
        expose(&mut table, &host_root, &reserved, "/no/such/path/at/all", ExposeMode::ReadOnlyBind).unwrap();
        assert!(table.is_empty());
    }

    #[test]
    fn expose_records_ordinary_file() {
        let mut table = ExportTable::new();
        let host_root = HostRoot::Real;
        let reserved = ReservedPaths::default();
        expose(&mut table, &host_root, &reserved, "/dev/null", ExposeMode::ReadOnlyBind).unwrap();
        // /dev is reserved, so nothing should be recorded.
        assert!(table.is_empty());
    }
}
