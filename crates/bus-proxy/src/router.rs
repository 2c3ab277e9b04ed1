//! Router (spec §4.4, §4.5, §4.6): classifies every framed message,
//! applies policy, and decides whether to forward, drop, or synthesize a
//! reply.

use dbus_wire::{Endianness, Flags, MessageType};

use crate::body::{read_string_arg0, read_string_array, write_string_array};
use crate::builder::{build_frame, single_string_body, OutgoingFields};
use crate::frame::Header;
use crate::name_tracker::NameTracker;
use crate::policy::{Filter, FilterType, PolicyLevel, PolicyStore, BUS_NAME};
use crate::reply_tracker::{bool_body, string_body, ExpectedReply};
use crate::session::Session;

const ERR_SERVICE_UNKNOWN: &str = "org.freedesktop.DBus.Error.ServiceUnknown";
const ERR_NAME_HAS_NO_OWNER: &str = "org.freedesktop.DBus.Error.NameHasNoOwner";
const ERR_ACCESS_DENIED: &str = "org.freedesktop.DBus.Error.AccessDenied";

const DENYLIST_BUS_METHODS: &[&str] = &["UpdateActivationEnvironment", "BecomeMonitor"];
const OWN_REQUIRED_METHODS: &[&str] = &["RequestName", "ReleaseName", "ListQueuedOwners"];
const SEE_REQUIRED_METHODS: &[&str] = &[
    "GetConnectionUnixProcessID",
    "GetConnectionCredentials",
    "GetAdtAuditSessionData",
    "GetConnectionSELinuxSecurityContext",
    "GetConnectionUnixUser",
];
const LIST_NAMES_METHODS: &[&str] = &["ListNames", "ListActivatableNames"];
const INTROSPECTABLE_INTERFACE: &str = "org.freedesktop.DBus.Introspectable";

/// Outcome of classifying a client-to-bus frame.
pub enum ClientDecision {
    /// Forward the frame (with its serial already adjusted) to the bus,
    /// registering `tag` if a reply is expected.
    Forward { tag: Option<ExpectedReply> },
    /// The frame is denied or hidden. If the caller expects a reply (no
    /// `NO_REPLY_EXPECTED` flag), a round-trip `Ping` must be sent to the
    /// bus with this synthetic reply queued for when it comes back
    /// (spec §4.6); otherwise the frame is silently dropped.
    Synthesize {
        /// `Some(name)` for an error reply, `None` for a plain boolean
        /// `false` return (the `NameHasOwner` case).
        error_name: Option<&'static str>,
        /// For the boolean case.
        as_bool: Option<bool>,
    },
}

/// Resolve the effective policy level for `name`: unique ids fold their
/// direct grant with every well-known name they have owned; well-known
/// names are looked up directly in the Policy Store.
pub fn resolve_name_policy(policy: &PolicyStore, names: &NameTracker, name: &str) -> PolicyLevel {
    if name.starts_with(':') {
        names.effective_unique_id_policy(name, |owned| policy.lookup(owned).0)
    } else {
        policy.lookup(name).0
    }
}

/// Classify one client-to-bus `METHOD_CALL` (spec §4.4). `header.serial`
/// must already be the *client's* serial (pre-offset-adjustment); the
/// caller applies `session.accept_client_serial` separately.
pub fn classify_client_call(
    policy: &PolicyStore,
    session: &Session,
    header: &Header,
    body: &[u8],
) -> ClientDecision {
    let destination = header.fields.destination.as_deref().unwrap_or(BUS_NAME);
    let member = header.fields.member.as_deref().unwrap_or("");
    let interface = header.fields.interface.as_deref();
    let path = header.fields.path.as_deref();

    let dest_policy = resolve_name_policy(policy, &session.name_tracker, destination);

    if dest_policy < PolicyLevel::See {
        let is_unique_dest = destination.starts_with(':');
        let no_auto_start = header.flags & Flags::NO_AUTO_START;
        return if is_unique_dest || no_auto_start {
            ClientDecision::Synthesize { error_name: Some(ERR_NAME_HAS_NO_OWNER), as_bool: None }
        } else {
            ClientDecision::Synthesize { error_name: Some(ERR_SERVICE_UNKNOWN), as_bool: None }
        };
    }

    if dest_policy < PolicyLevel::Talk && destination != BUS_NAME {
        return ClientDecision::Synthesize { error_name: Some(ERR_ACCESS_DENIED), as_bool: None };
    }

    if destination == BUS_NAME {
        if DENYLIST_BUS_METHODS.contains(&member) {
            return ClientDecision::Synthesize { error_name: Some(ERR_ACCESS_DENIED), as_bool: None };
        }

        if interface == Some(INTROSPECTABLE_INTERFACE) {
            return ClientDecision::Forward { tag: Some(ExpectedReply::Normal) };
        }

        if member == "AddMatch" {
            let rule = read_string_arg0(body, header.endianness).unwrap_or_default();
            if rule.contains("eavesdrop=") {
                return ClientDecision::Synthesize { error_name: Some(ERR_ACCESS_DENIED), as_bool: None };
            }
            return ClientDecision::Forward { tag: Some(ExpectedReply::Normal) };
        }

        if OWN_REQUIRED_METHODS.contains(&member) {
            let arg0 = read_string_arg0(body, header.endianness).unwrap_or_default();
            let arg0_policy = resolve_name_policy(policy, &session.name_tracker, &arg0);
            return if arg0_policy >= PolicyLevel::Own {
                ClientDecision::Forward { tag: Some(ExpectedReply::Normal) }
            } else {
                ClientDecision::Synthesize { error_name: Some(ERR_ACCESS_DENIED), as_bool: None }
            };
        }

        if member == "StartServiceByName" {
            let arg0 = read_string_arg0(body, header.endianness).unwrap_or_default();
            let arg0_policy = resolve_name_policy(policy, &session.name_tracker, &arg0);
            return if arg0_policy >= PolicyLevel::Talk {
                ClientDecision::Forward { tag: Some(ExpectedReply::Normal) }
            } else {
                ClientDecision::Synthesize { error_name: Some(ERR_ACCESS_DENIED), as_bool: None }
            };
        }

        if SEE_REQUIRED_METHODS.contains(&member) {
            let arg0 = read_string_arg0(body, header.endianness).unwrap_or_default();
            let arg0_policy = resolve_name_policy(policy, &session.name_tracker, &arg0);
            return if arg0_policy >= PolicyLevel::See {
                ClientDecision::Forward { tag: Some(ExpectedReply::Normal) }
            } else {
                ClientDecision::Synthesize { error_name: Some(ERR_ACCESS_DENIED), as_bool: None }
            };
        }

        if member == "NameHasOwner" || member == "GetNameOwner" {
            let arg0 = read_string_arg0(body, header.endianness).unwrap_or_default();
            let arg0_policy = resolve_name_policy(policy, &session.name_tracker, &arg0);
            if arg0_policy < PolicyLevel::See {
                return if member == "GetNameOwner" {
                    ClientDecision::Synthesize { error_name: Some(ERR_NAME_HAS_NO_OWNER), as_bool: None }
                } else {
                    ClientDecision::Synthesize { error_name: None, as_bool: Some(false) }
                };
            }
            return ClientDecision::Forward { tag: Some(ExpectedReply::Normal) };
        }

        if LIST_NAMES_METHODS.contains(&member) {
            return ClientDecision::Forward { tag: Some(ExpectedReply::ListNames) };
        }

        return ClientDecision::Synthesize { error_name: Some(ERR_ACCESS_DENIED), as_bool: None };
    }

    let allowed = dest_policy >= PolicyLevel::Own
        || policy.matches_detailed(destination, FilterType::Call, path, interface, Some(member));

    if allowed {
        ClientDecision::Forward { tag: Some(ExpectedReply::Normal) }
    } else {
        ClientDecision::Synthesize { error_name: Some(ERR_ACCESS_DENIED), as_bool: None }
    }
}

/// Build the frames needed to carry out a [`ClientDecision::Synthesize`]
/// outcome when the client's message does expect a reply: the `Ping`
/// placeholder to send to the bus (preserving the client's serial and
/// flags), and the [`ExpectedReply::Rewrite`] entry to register for its
/// reply (spec §4.6).
pub fn build_ping_placeholder(
    adjusted_serial: u32,
    error_name: Option<&'static str>,
    as_bool: Option<bool>,
) -> (Vec<u8>, ExpectedReply) {
    let ping = build_frame(
        MessageType::METHOD_CALL,
        Flags::EMPTY,
        adjusted_serial,
        &OutgoingFields {
            path: Some("/org/freedesktop/DBus"),
            interface: Some(BUS_NAME),
            member: Some("Ping"),
            destination: Some(BUS_NAME),
            ..Default::default()
        },
        &[],
    );

    let (message_type, body, sig) = if let Some(name) = error_name {
        let (body, sig) = string_body(name);
        (MessageType::ERROR, body, sig)
    } else {
        let (body, sig) = bool_body(as_bool.unwrap_or(false));
        (MessageType::METHOD_RETURN, body, sig)
    };

    let tag = ExpectedReply::Rewrite { message_type, error_name: error_name.map(str::to_string), body, body_signature: sig };

    (ping, tag)
}

/// Rewrite a bus reply to the stored synthetic payload (spec §4.6): the
/// bus-assigned serial and `reply_serial` are preserved, but message
/// type, error name, and body are replaced wholesale.
pub fn rewrite_as_synthetic(
    bus_serial: u32,
    reply_serial: u32,
    message_type: MessageType,
    error_name: Option<&str>,
    body: &[u8],
    body_signature: &str,
) -> Vec<u8> {
    build_frame(
        message_type,
        Flags::EMPTY,
        bus_serial,
        &OutgoingFields {
            error_name,
            reply_serial: Some(reply_serial),
            signature: Some(body_signature),
            ..Default::default()
        },
        body,
    )
}

/// Synthesize the startup sequence sent right after the client's `Hello`
/// is forwarded (spec §4.5). Returns the frames to send (in order) and
/// their reply tags to register, keyed by the serial embedded in each
/// frame.
pub fn build_startup_ops(policy: &PolicyStore, session: &mut Session, bus_serial_hint: u32) -> Vec<(Vec<u8>, ExpectedReply)> {
    let mut ops = Vec::new();

    let filters: Vec<Filter> = policy.filters().iter().filter(|f| f.name != BUS_NAME).cloned().collect();
    let mut has_subtree = false;

    for filter in &filters {
        let serial = session.next_synthetic_serial(bus_serial_hint);
        let arg0_form = if filter.name_is_subtree {
            has_subtree = true;
            format!(
                "type='signal',sender='{BUS_NAME}',interface='{BUS_NAME}',member='NameOwnerChanged',arg0namespace='{}'",
                filter.name
            )
        } else {
            format!(
                "type='signal',sender='{BUS_NAME}',interface='{BUS_NAME}',member='NameOwnerChanged',arg0='{}'",
                filter.name
            )
        };

        let frame = build_frame(
            MessageType::METHOD_CALL,
            Flags::EMPTY,
            serial,
            &OutgoingFields {
                path: Some("/org/freedesktop/DBus"),
                interface: Some(BUS_NAME),
                member: Some("AddMatch"),
                destination: Some(BUS_NAME),
                signature: Some("s"),
            },
            &single_string_body(&arg0_form),
        );
        ops.push((frame, ExpectedReply::Filter));

        if !filter.name_is_subtree {
            let serial = session.next_synthetic_serial(bus_serial_hint);
            let frame = build_frame(
                MessageType::METHOD_CALL,
                Flags::EMPTY,
                serial,
                &OutgoingFields {
                    path: Some("/org/freedesktop/DBus"),
                    interface: Some(BUS_NAME),
                    member: Some("GetNameOwner"),
                    destination: Some(BUS_NAME),
                    signature: Some("s"),
                },
                &single_string_body(&filter.name),
            );
            ops.push((frame, ExpectedReply::FakeGetNameOwner { name: filter.name.clone() }));
        }
    }

    if has_subtree {
        let serial = session.next_synthetic_serial(bus_serial_hint);
        let frame = build_frame(
            MessageType::METHOD_CALL,
            Flags::EMPTY,
            serial,
            &OutgoingFields {
                path: Some("/org/freedesktop/DBus"),
                interface: Some(BUS_NAME),
                member: Some("ListNames"),
                destination: Some(BUS_NAME),
                ..Default::default()
            },
            &[],
        );
        ops.push((frame, ExpectedReply::FakeListNames));
        session.reads_suspended = true;
    }

    ops
}

/// Given the body of the synthesized startup `ListNames` reply, build
/// the follow-up `GetNameOwner` calls for every returned non-unique name
/// known to the Policy Store (spec §4.5).
pub fn build_followup_owner_queries(
    policy: &PolicyStore,
    session: &mut Session,
    body: &[u8],
    endianness: Endianness,
    bus_serial_hint: u32,
) -> Vec<(Vec<u8>, ExpectedReply)> {
    let Some(names) = read_string_array(body, endianness) else {
        return Vec::new();
    };

    let mut ops = Vec::new();

    for name in names {
        if name.starts_with(':') {
            continue;
        }
        if policy.lookup(&name).0 == PolicyLevel::None {
            continue;
        }

        let serial = session.next_synthetic_serial(bus_serial_hint);
        let frame = build_frame(
            MessageType::METHOD_CALL,
            Flags::EMPTY,
            serial,
            &OutgoingFields {
                path: Some("/org/freedesktop/DBus"),
                interface: Some(BUS_NAME),
                member: Some("GetNameOwner"),
                destination: Some(BUS_NAME),
                signature: Some("s"),
            },
            &single_string_body(&name),
        );
        ops.push((frame, ExpectedReply::FakeGetNameOwner { name: name.clone() }));
    }

    ops
}

/// Filter a `ListNames`/`ListActivatableNames` reply body down to names
/// at policy ≥ SEE (spec §4.4, tag `LIST_NAMES`).
pub fn filter_list_names(policy: &PolicyStore, names: &NameTracker, body: &[u8], endianness: Endianness) -> Option<Vec<u8>> {
    let items = read_string_array(body, endianness)?;
    let filtered: Vec<String> = items
        .into_iter()
        .filter(|name| resolve_name_policy(policy, names, name) >= PolicyLevel::See)
        .collect();
    Some(write_string_array(&filtered))
}

/// Whether a broadcast signal should be delivered to the client (spec
/// §4.4): sender policy OWN, or TALK with a matching `--broadcast=`
/// filter.
pub fn broadcast_allowed(
    policy: &PolicyStore,
    names: &NameTracker,
    sender: &str,
    path: Option<&str>,
    interface: Option<&str>,
    member: Option<&str>,
) -> bool {
    let sender_policy = resolve_name_policy(policy, names, sender);
    sender_policy == PolicyLevel::Own
        || (sender_policy == PolicyLevel::Talk
            && policy.matches_detailed(sender, FilterType::Broadcast, path, interface, member))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::frame::parse_header;
    use crate::policy::{Filter, PolicyLevel};

    fn call_header(destination: &str, member: &str, serial: u32, no_auto_start: bool) -> (Header, Vec<u8>) {
        let flags = if no_auto_start { Flags::NO_AUTO_START } else { Flags::EMPTY };
        let frame = build_frame(
            MessageType::METHOD_CALL,
            flags,
            serial,
            &OutgoingFields {
                path: Some("/x"),
                interface: Some("I"),
                member: Some(member),
                destination: Some(destination),
                ..Default::default()
            },
            &[],
        );
        let header = parse_header(&frame).unwrap();
        let body = frame[header.header_end..].to_vec();
        (header, body)
    }

    #[test]
    fn hidden_destination_yields_service_unknown() {
        let mut policy = PolicyStore::new();
        policy.add(Filter::plain("org.example.Foo".into(), false, PolicyLevel::Own));
        let session = Session::new(false);
        let (header, body) = call_header("org.example.Bar", "M", 2, false);
        match classify_client_call(&policy, &session, &header, &body) {
            ClientDecision::Synthesize { error_name: Some(ERR_SERVICE_UNKNOWN), .. } => {}
            _ => panic!("expected ServiceUnknown"),
        }
    }

    #[test]
    fn hidden_destination_with_no_auto_start_yields_name_has_no_owner() {
        let policy = PolicyStore::new();
        let session = Session::new(false);
        let (header, body) = call_header("org.example.Bar", "M", 2, true);
        match classify_client_call(&policy, &session, &header, &body) {
            ClientDecision::Synthesize { error_name: Some(ERR_NAME_HAS_NO_OWNER), .. } => {}
            _ => panic!("expected NameHasNoOwner"),
        }
    }

    #[test]
    fn addmatch_eavesdrop_denied() {
        let policy = PolicyStore::new();
        let session = Session::new(false);
        let body = single_string_body("type='signal',eavesdrop=true");
        let frame = build_frame(
            MessageType::METHOD_CALL,
            Flags::EMPTY,
            3,
            &OutgoingFields {
                path: Some("/org/freedesktop/DBus"),
                interface: Some(BUS_NAME),
                member: Some("AddMatch"),
                destination: Some(BUS_NAME),
                signature: Some("s"),
            },
            &body,
        );
        let header = parse_header(&frame).unwrap();
        let body = frame[header.header_end..].to_vec();
        match classify_client_call(&policy, &session, &header, &body) {
            ClientDecision::Synthesize { error_name: Some(ERR_ACCESS_DENIED), .. } => {}
            _ => panic!("expected AccessDenied"),
        }
    }

    #[test]
    fn list_names_filters_by_policy() {
        let mut policy = PolicyStore::new();
        policy.add(Filter::plain("org.example.Foo".into(), false, PolicyLevel::Talk));
        let names = NameTracker::new();
        let body = write_string_array(&[
            BUS_NAME.to_string(),
            ":1.7".to_string(),
            "org.example.Foo".to_string(),
            "org.example.Bar".to_string(),
        ]);
        let filtered = filter_list_names(&policy, &names, &body, Endianness::LITTLE).unwrap();
        let items = read_string_array(&filtered, Endianness::LITTLE).unwrap();
        assert_eq!(items, vec![BUS_NAME.to_string(), "org.example.Foo".to_string()]);
    }
}
