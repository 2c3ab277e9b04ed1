//! Host-filesystem exposer.
//!
//! Translates a set of requested filesystem visibilities into an ordered
//! sequence of `bwrap`-style mount directives (spec §2, §4.7-§4.9).
//! Pure computation over host filesystem metadata: nothing here talks to
//! a bus or a launcher, it only produces the argv the launcher consumes.

pub use self::error::{ExposerError, Result};
mod error;

pub use self::export_table::{ExportEntry, ExportTable, ExposeMode};
mod export_table;

pub use self::hostroot::HostRoot;
mod hostroot;

mod autofs;

pub use self::resolver::ReservedPaths;
mod resolver;

pub use self::emitter::{BindMode, EmitConfig, EmitToken};
mod emitter;

/// Modes accepted by [`Exposer::add_expose`] (spec §4.7: "Modes accepted
/// by `add_expose` are `ReadOnlyBind` or `ReadWriteBind`").
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Access {
    ReadOnly,
    ReadWrite,
}

impl From<Access> for ExposeMode {
    fn from(access: Access) -> Self {
        match access {
            Access::ReadOnly => ExposeMode::ReadOnlyBind,
            Access::ReadWrite => ExposeMode::ReadWriteBind,
        }
    }
}

/// Entry point for the Exposer (spec §4.7, §4.8, §4.9): accumulates
/// exposure requests into an [`ExportTable`], then renders them plus the
/// host-/usr and host-/etc indirection blocks into a directive sequence.
pub struct Exposer {
    table: ExportTable,
    host_root: HostRoot,
    reserved: ReservedPaths,
    host_etc_mode: Option<Access>,
    host_os_mode: Option<Access>,
}

impl Exposer {
    /// A fresh Exposer rooted at the real host filesystem.
    pub fn new(usrmerged: Vec<String>) -> Self {
        Self {
            table: ExportTable::new(),
            host_root: HostRoot::Real,
            reserved: ReservedPaths::new(usrmerged),
            host_etc_mode: None,
            host_os_mode: None,
        }
    }

    /// An Exposer whose filesystem lookups are confined to `root`, for
    /// hermetic tests (spec §4.9).
    pub fn with_host_root(usrmerged: Vec<String>, root: &std::path::Path) -> std::io::Result<Self> {
        Ok(Self {
            table: ExportTable::new(),
            host_root: HostRoot::open_mock(root)?,
            reserved: ReservedPaths::new(usrmerged),
            host_etc_mode: None,
            host_os_mode: None,
        })
    }

    /// Request that `path` be bound into the sandbox with the given
    /// [`Access`] (spec §4.7).
    pub fn add_expose(&mut self, access: Access, path: &str) -> Result<()> {
        resolver::expose(&mut self.table, &self.host_root, &self.reserved, path, access.into())
    }

    /// Request that `path` be backed by a tmpfs (or, if unnecessary, just
    /// ensured to exist as a directory — spec §4.8 scenario S6).
    pub fn add_tmpfs(&mut self, path: &str) -> Result<()> {
        resolver::expose(&mut self.table, &self.host_root, &self.reserved, path, ExposeMode::Tmpfs)
    }

    /// Request that `path` merely exist as a directory in the sandbox.
    pub fn add_ensure_dir(&mut self, path: &str) -> Result<()> {
        resolver::expose(&mut self.table, &self.host_root, &self.reserved, path, ExposeMode::EnsureDir)
    }

    pub fn set_host_etc_mode(&mut self, access: Access) {
        self.host_etc_mode = Some(access);
    }

    pub fn set_host_os_mode(&mut self, access: Access) {
        self.host_os_mode = Some(access);
    }

    /// Render the accumulated requests into the deterministic directive
    /// sequence of spec §4.8.
    pub fn emit(&self) -> Vec<EmitToken> {
        let config = EmitConfig {
            host_os_mode: self.host_os_mode.map(to_bind_mode),
            host_etc_mode: self.host_etc_mode.map(to_bind_mode),
            usrmerged: self.reserved.usrmerged().to_vec(),
        };
        emitter::emit(&self.table, &self.host_root, &config)
    }

    /// Direct access to the accumulated table, mostly for tests that
    /// check property 4/5 without going through emission.
    pub fn table(&self) -> &ExportTable {
        &self.table
    }
}

fn to_bind_mode(access: Access) -> BindMode {
    match access {
        Access::ReadOnly => BindMode::ReadOnly,
        Access::ReadWrite => BindMode::ReadWrite,
    }
}
