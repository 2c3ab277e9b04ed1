//! Export Table (spec §3, §4.7): an ordered map from absolute host path to
//! the strongest exposure mode ever requested for it.

use std::collections::BTreeMap;

/// How a single host path is exposed to the sandbox.
///
/// Declaration order is the mode ordering from spec §3
/// (`Tmpfs < EnsureDir < Symlink < ReadOnlyBind < ReadWriteBind`); the
/// derived [`Ord`] is used directly by [`ExportTable::merge`] to compute
/// the max of two requested modes for the same path.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum ExposeMode {
    Tmpfs,
    EnsureDir,
    Symlink,
    ReadOnlyBind,
    ReadWriteBind,
}

/// One entry recorded against an absolute host path.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExportEntry {
    /// The mode this path is currently recorded at.
    pub mode: ExposeMode,
    /// For [`ExposeMode::Symlink`] entries, the link's target, relative
    /// to `/` the way `readlink` returns it. Unused for every other mode.
    pub symlink_target: Option<String>,
}

/// Ordered map from absolute host path to its [`ExportEntry`].
///
/// Iteration order is lexicographic by path (spec §4.8 "sorted list of
/// all Export Entries"), which falls out of using a [`BTreeMap`] keyed
/// on the path string directly.
#[derive(Debug, Clone, Default)]
pub struct ExportTable {
    entries: BTreeMap<String, ExportEntry>,
}

impl ExportTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record `mode` at `path`, keeping the maximum of any mode already
    /// stored there (spec §3 invariant, property 4). `symlink_target` is
    /// only consulted when the *winning* mode is [`ExposeMode::Symlink`].
    pub fn merge(&mut self, path: &str, mode: ExposeMode, symlink_target: Option<&str>) {
        match self.entries.get_mut(path) {
            Some(existing) => {
                if mode > existing.mode {
                    existing.mode = mode;
                    if mode == ExposeMode::Symlink {
                        existing.symlink_target = symlink_target.map(str::to_owned);
                    }
                } else if existing.mode == ExposeMode::Symlink && existing.symlink_target.is_none() {
                    existing.symlink_target = symlink_target.map(str::to_owned);
                }
            }
            None => {
                self.entries.insert(
                    path.to_owned(),
                    ExportEntry { mode, symlink_target: symlink_target.map(str::to_owned) },
                );
            }
        }
    }

    /// The entry stored at `path`, if any.
    pub fn get(&self, path: &str) -> Option<&ExportEntry> {
        self.entries.get(path)
    }

    /// All entries, sorted lexicographically by path.
    pub fn iter(&self) -> impl Iterator<Item = (&str, &ExportEntry)> {
        self.entries.iter().map(|(path, entry)| (path.as_str(), entry))
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// True if some strict ancestor directory of `path` already has an
    /// entry in the table (spec §4.8 "ancestor is mapped"). An
    /// [`ExposeMode::EnsureDir`] ancestor is transparent: it defers to
    /// *its own* ancestor rather than counting as "mapped" on its own.
    pub fn has_mapped_ancestor(&self, path: &str) -> bool {
        for ancestor in ancestors(path) {
            match self.entries.get(ancestor) {
                Some(entry) if entry.mode == ExposeMode::EnsureDir => continue,
                Some(_) => return true,
                None => continue,
            }
        }
        false
    }
}

/// Yield every strict ancestor directory of `path` (an absolute,
/// slash-separated path), nearest first, stopping before `/`.
fn ancestors(path: &str) -> impl Iterator<Item = &str> {
    let mut current = path;
    std::iter::from_fn(move || {
        let slash = current.rfind('/')?;
        if slash == 0 {
            if current.len() > 1 {
                current = "/";
                return Some("/");
            }
            return None;
        }
        current = &current[..slash];
        Some(current)
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn merge_keeps_maximum_mode() {
        let mut table = ExportTable::new();
        table.merge("/a", ExposeMode::ReadOnlyBind, None);
        table.merge("/a", ExposeMode::Tmpfs, None);
        table.merge("/a", ExposeMode::ReadWriteBind, None);
        assert_eq!(table.get("/a").unwrap().mode, ExposeMode::ReadWriteBind);
    }

    #[test]
    fn merge_order_independent() {
        let mut forward = ExportTable::new();
        forward.merge("/a", ExposeMode::EnsureDir, None);
        forward.merge("/a", ExposeMode::Symlink, Some("target"));

        let mut backward = ExportTable::new();
        backward.merge("/a", ExposeMode::Symlink, Some("target"));
        backward.merge("/a", ExposeMode::EnsureDir, None);

        assert_eq!(forward.get("/a"), backward.get("/a"));
    }

    #[test]
    fn iter_is_lexicographic() {
        let mut table = ExportTable::new();
        table.merge("/b", ExposeMode::EnsureDir, None);
        table.merge("/a", ExposeMode::EnsureDir, None);
        table.merge("/a/c", ExposeMode::EnsureDir, None);
        let paths: Vec<&str> = table.iter().map(|(p, _)| p).collect();
        assert_eq!(paths, vec!["/a", "/a/c", "/b"]);
    }

    #[test]
    fn ancestor_detection_skips_transparent_ensure_dir() {
        let mut table = ExportTable::new();
        table.merge("/home", ExposeMode::EnsureDir, None);
        assert!(!table.has_mapped_ancestor("/home/alice"));

        table.merge("/home", ExposeMode::ReadOnlyBind, None);
        assert!(table.has_mapped_ancestor("/home/alice"));
    }

    #[test]
    fn no_ancestor_for_top_level_path() {
        let table = ExportTable::new();
        assert!(!table.has_mapped_ancestor("/home"));
    }

    fn mode_strategy() -> impl proptest::strategy::Strategy<Value = ExposeMode> {
        use proptest::prelude::*;
        prop_oneof![
            Just(ExposeMode::Tmpfs),
            Just(ExposeMode::EnsureDir),
            Just(ExposeMode::Symlink),
            Just(ExposeMode::ReadOnlyBind),
            Just(ExposeMode::ReadWriteBind),
        ]
    }

    proptest::proptest! {
        /// Property 4 (spec §8): whatever order a path's modes arrive in,
        /// the stored mode is their maximum.
        #[test]
        fn merge_max_is_order_independent(modes in proptest::collection::vec(mode_strategy(), 1..8)) {
            let max = modes.iter().copied().max().unwrap();

            let mut forward = ExportTable::new();
            for mode in &modes {
                forward.merge("/p", *mode, None);
            }
            proptest::prop_assert_eq!(forward.get("/p").unwrap().mode, max);

            let mut reversed = ExportTable::new();
            for mode in modes.iter().rev() {
                reversed.merge("/p", *mode, None);
            }
            proptest::prop_assert_eq!(reversed.get("/p").unwrap().mode, max);
        }
    }
}
