//! Name Tracker: per-client unique-id policy and owned-name bookkeeping
//! (spec §3, §4.2, §4.4).
//!
//! Entries are intentionally sticky: a unique id's granted policy level
//! never drops, even once its owned names are all released (spec §9,
//! Open Questions — preserved deliberately to avoid a race where a
//! `NameLost` signal could race a still-outstanding call from that id).

use std::collections::HashMap;

use crate::policy::PolicyLevel;

/// Tracks policy levels and owned well-known names keyed by bus unique id
/// (`:N.M`), scoped to a single client session.
#[derive(Debug, Default)]
pub struct NameTracker {
    unique_id_policy: HashMap<String, PolicyLevel>,
    unique_id_owned_names: HashMap<String, Vec<String>>,
}

impl NameTracker {
    /// A tracker with no entries.
    pub fn new() -> Self {
        NameTracker::default()
    }

    /// Raise `id`'s granted policy to at least `level`. Never lowers an
    /// existing, higher grant.
    pub fn raise_policy(&mut self, id: &str, level: PolicyLevel) {
        let entry = self.unique_id_policy.entry(id.to_string()).or_insert(PolicyLevel::None);
        if level > *entry {
            *entry = level;
        }
    }

    /// Record that `id` has owned `name` at some point. Idempotent.
    pub fn record_owned_name(&mut self, id: &str, name: &str) {
        let names = self.unique_id_owned_names.entry(id.to_string()).or_default();
        if !names.iter().any(|n| n == name) {
            names.push(name.to_string());
        }
    }

    /// The directly-granted policy level for unique id `id`, ignoring
    /// names it owns.
    pub fn direct_policy(&self, id: &str) -> PolicyLevel {
        self.unique_id_policy.get(id).copied().unwrap_or(PolicyLevel::None)
    }

    /// The well-known names `id` has ever owned, most-recent last.
    pub fn owned_names(&self, id: &str) -> &[String] {
        self.unique_id_owned_names.get(id).map(Vec::as_slice).unwrap_or(&[])
    }

    /// Resolve the effective policy for a source name: if it is a unique
    /// id, the direct grant folded with the maximum policy of any
    /// well-known name it has owned, looked up in `policy_for_name`
    /// (spec §4.2). Non-unique names are returned unchanged by the
    /// caller, which should consult the Policy Store directly instead.
    pub fn effective_unique_id_policy(
        &self,
        id: &str,
        policy_for_name: impl Fn(&str) -> PolicyLevel,
    ) -> PolicyLevel {
        let mut best = self.direct_policy(id);

        for name in self.owned_names(id) {
            let level = policy_for_name(name);
            if level > best {
                best = level;
            }
        }

        best
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn raise_policy_never_lowers() {
        let mut tracker = NameTracker::new();
        tracker.raise_policy(":1.1", PolicyLevel::Talk);
        tracker.raise_policy(":1.1", PolicyLevel::See);
        assert_eq!(tracker.direct_policy(":1.1"), PolicyLevel::Talk);
    }

    #[test]
    fn owned_names_accumulate_and_dedupe() {
        let mut tracker = NameTracker::new();
        tracker.record_owned_name(":1.1", "org.example.Foo");
        tracker.record_owned_name(":1.1", "org.example.Foo");
        tracker.record_owned_name(":1.1", "org.example.Bar");
        assert_eq!(tracker.owned_names(":1.1"), &["org.example.Foo", "org.example.Bar"]);
    }

    #[test]
    fn effective_policy_folds_owned_names() {
        let mut tracker = NameTracker::new();
        tracker.record_owned_name(":1.1", "org.example.Foo");
        let level = tracker.effective_unique_id_policy(":1.1", |name| {
            if name == "org.example.Foo" {
                PolicyLevel::Own
            } else {
                PolicyLevel::None
            }
        });
        assert_eq!(level, PolicyLevel::Own);
    }
}
