//! Expected-Reply Tracker (spec §3, §4.4, §4.6): a per-direction map from
//! an outstanding bus-assigned serial to a disposition for when (and if)
//! its reply comes back. Every entry is consumed at most once — that is
//! testable property 2, "reply exclusivity".

use std::collections::HashMap;

use dbus_wire::Signature;

/// What to do with the reply to a call the proxy itself issued or
/// rewrote, keyed by the serial the reply will carry `reply_serial` set
/// to.
#[derive(Debug, Clone)]
pub enum ExpectedReply {
    /// An ordinary client call; forward the reply through unchanged.
    Normal,
    /// The client's `Hello`; on success, raise the session's own unique
    /// id to TALK.
    Hello,
    /// A reply the router itself synthesized and is dropping; used when
    /// a denied or hidden call still needs *a* reply consumed so the
    /// bus's serial bookkeeping stays consistent. Distinct from
    /// `Rewrite`, which replaces a real reply's body.
    Filter,
    /// A `GetNameOwner` issued by the startup synthesizer for `name`;
    /// drop from the client's view, and on success record `name` as
    /// owned by the returned unique id.
    FakeGetNameOwner {
        /// The well-known name this lookup was for.
        name: String,
    },
    /// The synthesized `ListNames` issued at startup for subtree
    /// filters; drop from the client's view, and walk the returned names
    /// to issue follow-up `FakeGetNameOwner` lookups.
    FakeListNames,
    /// The client's own `ListNames`/`ListActivatableNames`; filter the
    /// returned array to names at policy ≥ SEE before forwarding.
    ListNames,
    /// A round-trip `Ping` placeholder (spec §4.6): replace the reply's
    /// body with the stored synthetic reply, keep the bus-assigned
    /// serial.
    Rewrite {
        /// The message type to stamp on the delivered reply (usually
        /// `ERROR`, sometimes `METHOD_RETURN` for boolean-false style
        /// replies).
        message_type: dbus_wire::MessageType,
        /// For an error reply, the `ERROR_NAME` to stamp.
        error_name: Option<String>,
        /// The body bytes and their signature, pre-serialized by the
        /// caller that created this entry.
        body: Vec<u8>,
        /// Signature string describing `body`.
        body_signature: String,
    },
}

/// Per-direction table of outstanding serials awaiting a reply.
#[derive(Debug, Default)]
pub struct ReplyTracker {
    entries: HashMap<u32, ExpectedReply>,
}

impl ReplyTracker {
    /// An empty tracker.
    pub fn new() -> Self {
        ReplyTracker::default()
    }

    /// Record that a reply to `serial` is expected, tagged `tag`.
    pub fn expect(&mut self, serial: u32, tag: ExpectedReply) {
        self.entries.insert(serial, tag);
    }

    /// Atomically consume and return the tag for `reply_serial`, if any
    /// is outstanding. Each call can only ever succeed once per serial —
    /// this is the mechanism behind testable property 2.
    pub fn consume(&mut self, reply_serial: u32) -> Option<ExpectedReply> {
        self.entries.remove(&reply_serial)
    }

    /// Number of outstanding entries; mostly useful for tests and
    /// diagnostics.
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Whether the tracker has no outstanding entries.
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

/// Helper to build the body+signature pair for a `Rewrite` entry whose
/// body is a single string argument (the common case: error messages,
/// `NameHasOwner` booleans use [`bool_body`] instead).
pub fn string_body(value: &str) -> (Vec<u8>, String) {
    let mut buf = Vec::with_capacity(value.len() + 5);
    buf.extend_from_slice(&(value.len() as u32).to_le_bytes());
    buf.extend_from_slice(value.as_bytes());
    buf.push(0);
    (buf, Signature::new("s").expect("\"s\" is valid").as_str().to_string())
}

/// Helper to build the body+signature pair for a single boolean argument.
pub fn bool_body(value: bool) -> (Vec<u8>, String) {
    let buf = (value as u32).to_le_bytes().to_vec();
    (buf, Signature::new("b").expect("\"b\" is valid").as_str().to_string())
}
