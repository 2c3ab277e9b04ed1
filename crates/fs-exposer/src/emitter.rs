//! Mount-Argument Emitter (spec §4.8): turns the populated Export Table
//! plus live filesystem metadata into the deterministic `bwrap`-style
//! argv sequence a sandbox launcher consumes.

use std::ffi::OsString;
use std::fmt;

use crate::export_table::{ExportTable, ExposeMode};
use crate::hostroot::HostRoot;
use crate::resolver::{self, FileKind};

/// Read-only vs read-write, for the two host-wide bind points
/// (`/run/host/usr`, `/run/host/etc`) that aren't plain Export Entries.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BindMode {
    ReadOnly,
    ReadWrite,
}

/// The dynamic linker cache and alternatives directory, bound into
/// `/run/host/etc` whenever host-/etc itself isn't exposed (spec §4.8).
const ETC_ALLOWLIST: &[(&str, FileKind)] = &[("/etc/ld.so.cache", FileKind::Regular), ("/etc/alternatives", FileKind::Dir)];

/// One directive in the emitted sequence. [`fmt::Display`] renders it the
/// way it would appear on a `bwrap` command line, for logs and tests;
/// [`EmitToken::into_argv`] renders the same directive as owned
/// [`OsString`] tokens for actually building an argv vector.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EmitToken {
    Bind { ro: bool, source: String, dest: String },
    Tmpfs { path: String },
    Dir { path: String },
    Symlink { target: String, path: String },
}

impl EmitToken {
    pub fn into_argv(self) -> Vec<OsString> {
        match self {
            EmitToken::Bind { ro, source, dest } => {
                vec![OsString::from(if ro { "--ro-bind" } else { "--bind" }), source.into(), dest.into()]
            }
            EmitToken::Tmpfs { path } => vec![OsString::from("--tmpfs"), path.into()],
            EmitToken::Dir { path } => vec![OsString::from("--dir"), path.into()],
            EmitToken::Symlink { target, path } => vec![OsString::from("--symlink"), target.into(), path.into()],
        }
    }
}

impl fmt::Display for EmitToken {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            EmitToken::Bind { ro, source, dest } => {
                write!(f, "{} {source} {dest}", if *ro { "--ro-bind" } else { "--bind" })
            }
            EmitToken::Tmpfs { path } => write!(f, "--tmpfs {path}"),
            EmitToken::Dir { path } => write!(f, "--dir {path}"),
            EmitToken::Symlink { target, path } => write!(f, "--symlink {target} {path}"),
        }
    }
}

/// Configuration for the parts of emission that aren't plain Export
/// Entries: the host-/usr and host-/etc indirection blocks (spec §4.8).
#[derive(Debug, Clone, Default)]
pub struct EmitConfig {
    pub host_os_mode: Option<BindMode>,
    pub host_etc_mode: Option<BindMode>,
    pub usrmerged: Vec<String>,
}

/// Produce the full directive sequence for `table`, consulting live
/// filesystem metadata through `host_root` exactly once per entry (spec
/// §5: "pure function of the Export Table plus filesystem metadata at
/// emit time").
pub fn emit(table: &ExportTable, host_root: &HostRoot, config: &EmitConfig) -> Vec<EmitToken> {
    let mut tokens = Vec::new();

    for (path, entry) in table.iter() {
        match entry.mode {
            ExposeMode::Symlink => {
                if !table.has_mapped_ancestor(path) {
                    if let Some(target) = &entry.symlink_target {
                        tokens.push(EmitToken::Symlink { target: target.clone(), path: path.to_owned() });
                    }
                }
            }
            ExposeMode::Tmpfs => {
                if table.has_mapped_ancestor(path) {
                    tokens.push(EmitToken::Tmpfs { path: path.to_owned() });
                } else if is_real_dir(host_root, path) {
                    tokens.push(EmitToken::Dir { path: path.to_owned() });
                }
            }
            ExposeMode::EnsureDir => {
                if is_real_dir(host_root, path) {
                    tokens.push(EmitToken::Dir { path: path.to_owned() });
                }
            }
            ExposeMode::ReadOnlyBind | ExposeMode::ReadWriteBind => {
                tokens.push(EmitToken::Bind {
                    ro: entry.mode == ExposeMode::ReadOnlyBind,
                    source: path.to_owned(),
                    dest: path.to_owned(),
                });
            }
        }
    }

    emit_host_usr_block(&mut tokens, host_root, config);
    emit_host_etc_block(&mut tokens, host_root, config);
    emit_os_release(&mut tokens, host_root);

    for token in &tokens {
        tracing::debug!(directive = %token, "emitted mount directive");
    }

    tokens
}

fn emit_host_usr_block(tokens: &mut Vec<EmitToken>, host_root: &HostRoot, config: &EmitConfig) {
    let Some(os_mode) = config.host_os_mode else {
        return;
    };
    let ro = os_mode == BindMode::ReadOnly;

    if exists(host_root, "/usr") {
        tokens.push(EmitToken::Bind { ro, source: "/usr".to_owned(), dest: "/run/host/usr".to_owned() });
    }

    if exists(host_root, "/var/usrlocal") {
        tokens.push(EmitToken::Bind {
            ro,
            source: "/var/usrlocal".to_owned(),
            dest: "/run/host/var/usrlocal".to_owned(),
        });
    }

    for dir in &config.usrmerged {
        match resolver::lookup(host_root, dir) {
            Some((FileKind::Symlink, Some(target))) => {
                tokens.push(EmitToken::Symlink { target, path: format!("/run/host{dir}") });
            }
            Some((FileKind::Dir, _)) => {
                tokens.push(EmitToken::Bind { ro, source: dir.clone(), dest: format!("/run/host{dir}") });
            }
            _ => {}
        }
    }

    if config.host_etc_mode.is_none() {
        for (allow_path, expected_kind) in ETC_ALLOWLIST {
            if let Some((kind, _)) = resolver::lookup(host_root, allow_path) {
                if kind == *expected_kind {
                    let dest = format!("/run/host{allow_path}");
                    tokens.push(EmitToken::Bind { ro: true, source: (*allow_path).to_owned(), dest });
                }
            }
        }
    }
}

fn emit_host_etc_block(tokens: &mut Vec<EmitToken>, host_root: &HostRoot, config: &EmitConfig) {
    let Some(etc_mode) = config.host_etc_mode else {
        return;
    };
    if exists(host_root, "/etc") {
        tokens.push(EmitToken::Bind {
            ro: etc_mode == BindMode::ReadOnly,
            source: "/etc".to_owned(),
            dest: "/run/host/etc".to_owned(),
        });
    }
}

fn emit_os_release(tokens: &mut Vec<EmitToken>, host_root: &HostRoot) {
    let source = if exists(host_root, "/etc/os-release") {
        Some("/etc/os-release")
    } else if exists(host_root, "/usr/lib/os-release") {
        Some("/usr/lib/os-release")
    } else {
        None
    };

    if let Some(source) = source {
        tokens.push(EmitToken::Bind { ro: true, source: source.to_owned(), dest: "/run/host/os-release".to_owned() });
    }
}

fn exists(host_root: &HostRoot, path: &str) -> bool {
    resolver::lookup(host_root, path).is_some()
}

fn is_real_dir(host_root: &HostRoot, path: &str) -> bool {
    matches!(resolver::lookup(host_root, path), Some((FileKind::Dir, _)))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::export_table::ExportTable;

    #[test]
    fn symlink_emits_only_without_mapped_ancestor() {
        let mut table = ExportTable::new();
        table.merge("/home", ExposeMode::Symlink, Some("var/home"));
        table.merge("/var/home/alice", ExposeMode::ReadWriteBind, None);

        let host_root = HostRoot::Real;
        let config = EmitConfig::default();
        let tokens = emit(&table, &host_root, &config);

        assert_eq!(
            tokens,
            vec![
                EmitToken::Symlink { target: "var/home".to_owned(), path: "/home".to_owned() },
                EmitToken::Bind { ro: false, source: "/var/home/alice".to_owned(), dest: "/var/home/alice".to_owned() },
            ]
        );
    }

    #[test]
    fn tmpfs_becomes_dir_when_no_ancestor_mapped() {
        // Relies on `/tmp` existing as a real directory on the test host.
        let mut table = ExportTable::new();
        table.merge("/tmp", ExposeMode::Tmpfs, None);

        let host_root = HostRoot::Real;
        let config = EmitConfig::default();
        let tokens = emit(&table, &host_root, &config);

        assert_eq!(tokens, vec![EmitToken::Dir { path: "/tmp".to_owned() }]);
    }

    #[test]
    fn tmpfs_stays_tmpfs_when_ancestor_mapped() {
        let mut table = ExportTable::new();
        table.merge("/home", ExposeMode::ReadOnlyBind, None);
        table.merge("/home/cache", ExposeMode::Tmpfs, None);

        let host_root = HostRoot::Real;
        let config = EmitConfig::default();
        let tokens = emit(&table, &host_root, &config);

        assert!(tokens.contains(&EmitToken::Tmpfs { path: "/home/cache".to_owned() }));
    }

    #[test]
    fn emission_is_deterministic_across_runs() {
        let mut table = ExportTable::new();
        table.merge("/b", ExposeMode::ReadOnlyBind, None);
        table.merge("/a", ExposeMode::ReadOnlyBind, None);

        let host_root = HostRoot::Real;
        let config = EmitConfig::default();
        assert_eq!(emit(&table, &host_root, &config), emit(&table, &host_root, &config));
    }

    #[test]
    fn os_release_falls_back_to_usr_lib() {
        // S7 (spec §8): this relies on `/etc/os-release` existing on the
        // test host (true on any systemd-based distro) rather than the
        // fallback path, so it asserts the primary branch; the fallback
        // branch is exercised against a mock host root in lib.rs's tests.
        let table = ExportTable::new();
        let host_root = HostRoot::Real;
        let config = EmitConfig::default();
        let tokens = emit(&table, &host_root, &config);
        assert!(tokens
            .iter()
            .any(|t| matches!(t, EmitToken::Bind { dest, .. } if dest == "/run/host/os-release")));
    }

    proptest::proptest! {
        /// Property 7 (spec §8): two emission runs over the same table
        /// and the same filesystem state produce byte-identical output.
        #[test]
        fn emission_deterministic_over_arbitrary_tables(
            paths in proptest::collection::vec("/[a-z]{1,6}(/[a-z]{1,6}){0,2}", 1..6)
        ) {
            let mut table = ExportTable::new();
            for path in &paths {
                table.merge(path, ExposeMode::ReadOnlyBind, None);
            }
            let host_root = HostRoot::Real;
            let config = EmitConfig::default();
            proptest::prop_assert_eq!(emit(&table, &host_root, &config), emit(&table, &host_root, &config));
        }
    }
}
