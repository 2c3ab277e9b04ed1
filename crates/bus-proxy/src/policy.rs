//! Policy Store and filter matching (spec §3, §4.2).

use std::collections::HashSet;

/// Totally ordered access level granted to a name.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum PolicyLevel {
    /// No access at all; the name is invisible.
    None,
    /// The name's existence and owner may be queried.
    See,
    /// Method calls and broadcasts may be exchanged with the name.
    Talk,
    /// The client may additionally own (request/release) the name.
    Own,
}

impl Default for PolicyLevel {
    fn default() -> Self {
        PolicyLevel::None
    }
}

/// Which message kinds a detailed filter applies to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum FilterType {
    /// A method call (`--call=`).
    Call,
    /// A broadcast signal (`--broadcast=`).
    Broadcast,
}

/// One entry in the Policy Store (spec §3).
#[derive(Debug, Clone)]
pub struct Filter {
    /// The well-known name or subtree prefix this filter matches.
    pub name: String,
    /// Whether `name` also matches dot-extended descendants.
    pub name_is_subtree: bool,
    /// The access level granted when this filter matches.
    pub policy_level: PolicyLevel,
    /// Restriction to specific message kinds; `None` means all kinds.
    pub type_mask: Option<HashSet<FilterType>>,
    /// Restriction to a specific object path (and whether it is a subtree).
    pub object_path: Option<(String, bool)>,
    /// Restriction to a specific interface.
    pub interface: Option<String>,
    /// Restriction to a specific member.
    pub member: Option<String>,
}

impl Filter {
    /// A plain `--see=`/`--talk=`/`--own=` filter with no detailed
    /// restriction: it grants `policy_level` unconditionally for `name`.
    pub fn plain(name: String, name_is_subtree: bool, policy_level: PolicyLevel) -> Self {
        Filter {
            name,
            name_is_subtree,
            policy_level,
            type_mask: None,
            object_path: None,
            interface: None,
            member: None,
        }
    }

    /// Whether this filter's optional type/path/interface/member
    /// restrictions match the given call or broadcast shape. A filter
    /// with no restriction on a given axis matches anything on that axis.
    pub fn matches_operation(
        &self,
        kind: FilterType,
        path: Option<&str>,
        interface: Option<&str>,
        member: Option<&str>,
    ) -> bool {
        if let Some(mask) = &self.type_mask {
            if !mask.contains(&kind) {
                return false;
            }
        }

        if let Some((want_path, is_subtree)) = &self.object_path {
            match path {
                Some(p) if *is_subtree => {
                    if !(p == want_path || p.starts_with(&format!("{want_path}/"))) {
                        return false;
                    }
                }
                Some(p) if p != want_path => return false,
                None => return false,
                _ => {}
            }
        }

        if let Some(want_iface) = &self.interface {
            if interface != Some(want_iface.as_str()) {
                return false;
            }
        }

        if let Some(want_member) = &self.member {
            if member != Some(want_member.as_str()) {
                return false;
            }
        }

        true
    }
}

/// The bus's own name; always implicitly TALK for every session (spec §4.2).
pub const BUS_NAME: &str = "org.freedesktop.DBus";

/// Immutable, process-lifetime mapping from well-known names to access
/// policy, filled by configuration before the proxy starts accepting
/// connections.
#[derive(Debug, Default)]
pub struct PolicyStore {
    filters: Vec<Filter>,
}

impl PolicyStore {
    /// An empty store.
    pub fn new() -> Self {
        PolicyStore { filters: Vec::new() }
    }

    /// Add one filter, as parsed from a `--see=`/`--talk=`/`--own=`/
    /// `--call=`/`--broadcast=` CLI option.
    pub fn add(&mut self, filter: Filter) {
        self.filters.push(filter);
    }

    /// All filters, in configuration order. Used by the startup
    /// synthesizer (spec §4.5) to walk every configured name.
    pub fn filters(&self) -> &[Filter] {
        &self.filters
    }

    /// Resolve the policy level granted to well-known `name` by walking
    /// it and its dot-truncated ancestors (spec §4.2): the exact name is
    /// checked first, then each ancestor obtained by dropping the last
    /// dot-component, where only subtree filters may match an ancestor.
    ///
    /// Returns the maximum level found, plus the filters that
    /// contributed to it (for detailed-rule checks downstream).
    pub fn lookup(&self, name: &str) -> (PolicyLevel, Vec<&Filter>) {
        if name == BUS_NAME {
            return (PolicyLevel::Talk, Vec::new());
        }

        let mut best = PolicyLevel::None;
        let mut matched = Vec::new();

        let mut candidate = name;
        let mut first_pass = true;

        loop {
            for filter in &self.filters {
                let hit = if first_pass {
                    filter.name == candidate
                } else {
                    filter.name_is_subtree && filter.name == candidate
                };

                if hit {
                    if filter.policy_level > best {
                        best = filter.policy_level;
                    }
                    matched.push(filter);
                }
            }

            first_pass = false;

            match candidate.rfind('.') {
                Some(idx) if idx > 0 => candidate = &candidate[..idx],
                _ => break,
            }
        }

        (best, matched)
    }

    /// Whether any filter of `kind` on `destination` matches the given
    /// operation shape (spec §4.4, "some filter on that destination
    /// matches").
    pub fn matches_detailed(
        &self,
        destination: &str,
        kind: FilterType,
        path: Option<&str>,
        interface: Option<&str>,
        member: Option<&str>,
    ) -> bool {
        let (_, matched) = self.lookup(destination);
        matched
            .into_iter()
            .any(|f| f.matches_operation(kind, path, interface, member))
    }
}
