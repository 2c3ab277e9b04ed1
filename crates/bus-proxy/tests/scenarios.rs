//! End-to-end scenarios, driving the proxy's real connection loop over
//! a pair of in-process `UnixStream`s standing in for the sandboxed
//! client and the real message bus.
//!
//! Frames are built and parsed by hand here rather than through the
//! crate's own (private) frame/body modules, so these tests exercise
//! the public `connection::run` entry point the way an external driver
//! would, not the internals behind it.

use std::sync::Arc;

use bus_proxy::{connection, Filter, PolicyLevel, PolicyStore, BUS_NAME};
use dbus_wire::{Endianness, Flags, HeaderField, MessageType};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::UnixStream;

const SASL_GREETING: &[u8] = b"\0AUTH EXTERNAL 31303030\r\nBEGIN\r\n";

async fn spawn_proxy(policy: PolicyStore) -> (UnixStream, UnixStream) {
    let (client_side, client_proxy_end) = UnixStream::pair().unwrap();
    let (bus_proxy_end, bus_side) = UnixStream::pair().unwrap();
    tokio::spawn(connection::run(client_proxy_end, bus_proxy_end, Arc::new(policy), true, false));
    (client_side, bus_side)
}

/// Send the client's SASL greeting and drain what the proxy forwards
/// to the bus: its own credentialed nul byte, then the auth line
/// verbatim (spec §4.3).
async fn handshake(client: &mut UnixStream, bus: &mut UnixStream) {
    client.write_all(SASL_GREETING).await.unwrap();

    let want = 1 + (SASL_GREETING.len() - 1);
    let mut seen = Vec::new();
    let mut buf = [0u8; 256];
    while seen.len() < want {
        let n = bus.read(&mut buf).await.unwrap();
        assert!(n > 0, "bus side closed during handshake");
        seen.extend_from_slice(&buf[..n]);
    }
    assert_eq!(seen[0], 0, "leading byte should be the proxy's own SASL nul");
    assert_eq!(&seen[1..want], &SASL_GREETING[1..]);
}

#[derive(Debug)]
struct FrameSpec<'a> {
    message_type: MessageType,
    flags: Flags,
    serial: u32,
    path: Option<&'a str>,
    interface: Option<&'a str>,
    member: Option<&'a str>,
    error_name: Option<&'a str>,
    reply_serial: Option<u32>,
    destination: Option<&'a str>,
    signature: Option<&'a str>,
    body: Vec<u8>,
}

impl<'a> Default for FrameSpec<'a> {
    fn default() -> Self {
        FrameSpec {
            message_type: MessageType::METHOD_CALL,
            flags: Flags::EMPTY,
            serial: 0,
            path: None,
            interface: None,
            member: None,
            error_name: None,
            reply_serial: None,
            destination: None,
            signature: None,
            body: Vec::new(),
        }
    }
}

fn pad(pos: usize, align: usize) -> usize {
    (align - (pos % align)) % align
}

fn push_string_field(out: &mut Vec<u8>, code: u8, type_code: u8, value: &str) {
    out.resize(out.len() + pad(out.len(), 8), 0);
    out.push(code);
    out.push(1);
    out.push(type_code);
    out.push(0);
    out.resize(out.len() + pad(out.len(), 4), 0);
    out.extend_from_slice(&(value.len() as u32).to_le_bytes());
    out.extend_from_slice(value.as_bytes());
    out.push(0);
}

fn push_u32_field(out: &mut Vec<u8>, code: u8, value: u32) {
    out.resize(out.len() + pad(out.len(), 8), 0);
    out.push(code);
    out.push(1);
    out.push(b'u');
    out.push(0);
    out.resize(out.len() + pad(out.len(), 4), 0);
    out.extend_from_slice(&value.to_le_bytes());
}

fn push_signature_field(out: &mut Vec<u8>, code: u8, value: &str) {
    out.resize(out.len() + pad(out.len(), 8), 0);
    out.push(code);
    out.push(1);
    out.push(b'g');
    out.push(0);
    out.push(value.len() as u8);
    out.extend_from_slice(value.as_bytes());
    out.push(0);
}

/// A hand-rolled, little-endian, protocol-version-1 frame encoder --
/// deliberately independent of the crate's own internal builder, so a
/// bug there wouldn't be masked by reusing it here.
fn build_frame(spec: &FrameSpec<'_>) -> Vec<u8> {
    let mut out = vec![0u8; 16];
    out[0] = Endianness::LITTLE.raw();
    out[1] = spec.message_type.raw();
    out[2] = spec.flags.0;
    out[3] = 1;

    let mut fields = Vec::new();
    if let Some(p) = spec.path {
        push_string_field(&mut fields, HeaderField::PATH.raw(), b'o', p);
    }
    if let Some(i) = spec.interface {
        push_string_field(&mut fields, HeaderField::INTERFACE.raw(), b's', i);
    }
    if let Some(m) = spec.member {
        push_string_field(&mut fields, HeaderField::MEMBER.raw(), b's', m);
    }
    if let Some(e) = spec.error_name {
        push_string_field(&mut fields, HeaderField::ERROR_NAME.raw(), b's', e);
    }
    if let Some(rs) = spec.reply_serial {
        push_u32_field(&mut fields, HeaderField::REPLY_SERIAL.raw(), rs);
    }
    if let Some(d) = spec.destination {
        push_string_field(&mut fields, HeaderField::DESTINATION.raw(), b's', d);
    }
    if let Some(sig) = spec.signature {
        push_signature_field(&mut fields, HeaderField::SIGNATURE.raw(), sig);
    }

    out[12..16].copy_from_slice(&(fields.len() as u32).to_le_bytes());
    out.extend_from_slice(&fields);
    out.resize(out.len() + pad(out.len(), 8), 0);

    out[4..8].copy_from_slice(&(spec.body.len() as u32).to_le_bytes());
    out[8..12].copy_from_slice(&spec.serial.to_le_bytes());
    out.extend_from_slice(&spec.body);
    out
}

fn single_string_body(value: &str) -> Vec<u8> {
    let mut buf = Vec::with_capacity(value.len() + 5);
    buf.extend_from_slice(&(value.len() as u32).to_le_bytes());
    buf.extend_from_slice(value.as_bytes());
    buf.push(0);
    buf
}

fn write_string_array(items: &[&str]) -> Vec<u8> {
    let mut elems = Vec::new();
    for item in items {
        elems.resize(elems.len() + pad(elems.len(), 4), 0);
        elems.extend_from_slice(&(item.len() as u32).to_le_bytes());
        elems.extend_from_slice(item.as_bytes());
        elems.push(0);
    }
    let mut out = Vec::with_capacity(elems.len() + 4);
    out.extend_from_slice(&(elems.len() as u32).to_le_bytes());
    out.extend_from_slice(&elems);
    out
}

fn read_string_array(body: &[u8]) -> Vec<String> {
    let mut pos = 0;
    let array_len = u32::from_le_bytes(body[0..4].try_into().unwrap()) as usize;
    pos += 4;
    let end = pos + array_len;
    let mut items = Vec::new();
    while pos < end {
        pos += pad(pos, 4);
        let len = u32::from_le_bytes(body[pos..pos + 4].try_into().unwrap()) as usize;
        pos += 4;
        items.push(std::str::from_utf8(&body[pos..pos + len]).unwrap().to_string());
        pos += len + 1;
    }
    items
}

#[derive(Debug)]
struct ParsedFrame {
    message_type: MessageType,
    serial: u32,
    reply_serial: Option<u32>,
    error_name: Option<String>,
    member: Option<String>,
    body: Vec<u8>,
}

fn parse_frame(buf: &[u8]) -> ParsedFrame {
    let endianness = Endianness::from_marker(buf[0]).unwrap();
    let message_type = MessageType::from_raw(buf[1]).unwrap();
    let body_len = dbus_wire::read_u32(buf, 4, endianness) as usize;
    let serial = dbus_wire::read_u32(buf, 8, endianness);
    let fields_len = dbus_wire::read_u32(buf, 12, endianness) as usize;

    let mut pos = 16usize;
    let end = 16 + fields_len;
    let mut reply_serial = None;
    let mut error_name = None;
    let mut member = None;

    while pos < end {
        pos += pad(pos, 8);
        if pos >= end {
            break;
        }
        let code = buf[pos];
        pos += 1;
        let sig_len = buf[pos] as usize;
        pos += 1;
        let contained = buf[pos];
        pos += sig_len + 1;

        match contained {
            b's' | b'o' => {
                pos += pad(pos, 4);
                let len = dbus_wire::read_u32(buf, pos, endianness) as usize;
                pos += 4;
                let text = std::str::from_utf8(&buf[pos..pos + len]).unwrap().to_string();
                pos += len + 1;
                if code == HeaderField::MEMBER.raw() {
                    member = Some(text);
                } else if code == HeaderField::ERROR_NAME.raw() {
                    error_name = Some(text);
                }
            }
            b'g' => {
                let len = buf[pos] as usize;
                pos += 1 + len + 1;
            }
            b'u' => {
                pos += pad(pos, 4);
                let value = dbus_wire::read_u32(buf, pos, endianness);
                pos += 4;
                if code == HeaderField::REPLY_SERIAL.raw() {
                    reply_serial = Some(value);
                }
            }
            _ => {}
        }
    }

    let header_end = end + pad(end, 8);
    let body = buf[header_end..header_end + body_len].to_vec();

    ParsedFrame { message_type, serial, reply_serial, error_name, member, body }
}

async fn read_frame(stream: &mut UnixStream) -> ParsedFrame {
    let mut prelude = [0u8; 16];
    stream.read_exact(&mut prelude).await.unwrap();
    let endianness = Endianness::from_marker(prelude[0]).unwrap();
    let body_len = dbus_wire::read_u32(&prelude, 4, endianness) as usize;
    let fields_len = dbus_wire::read_u32(&prelude, 12, endianness) as usize;
    let header_end = 16 + fields_len + pad(16 + fields_len, 8);

    let mut rest = vec![0u8; header_end - 16 + body_len];
    stream.read_exact(&mut rest).await.unwrap();

    let mut buf = prelude.to_vec();
    buf.extend_from_slice(&rest);
    parse_frame(&buf)
}

/// S1 (spec §8): a call to a destination the session has no policy
/// for round-trips through a synthetic `Ping` and comes back as
/// `ServiceUnknown`, with the client's own serial preserved.
#[tokio::test]
async fn hidden_destination_yields_service_unknown() {
    let mut policy = PolicyStore::new();
    policy.add(Filter::plain("org.example.Foo".into(), false, PolicyLevel::Own));

    let (mut client, mut bus) = spawn_proxy(policy).await;
    handshake(&mut client, &mut bus).await;

    let call = build_frame(&FrameSpec {
        serial: 2,
        path: Some("/x"),
        interface: Some("I"),
        member: Some("M"),
        destination: Some("org.example.Bar"),
        ..Default::default()
    });
    client.write_all(&call).await.unwrap();

    let ping = read_frame(&mut bus).await;
    assert_eq!(ping.member.as_deref(), Some("Ping"));

    let reply = build_frame(&FrameSpec {
        message_type: MessageType::METHOD_RETURN,
        serial: 100,
        reply_serial: Some(ping.serial),
        ..Default::default()
    });
    bus.write_all(&reply).await.unwrap();

    let delivered = read_frame(&mut client).await;
    assert_eq!(delivered.message_type, MessageType::ERROR);
    assert_eq!(delivered.reply_serial, Some(2));
    assert_eq!(delivered.error_name.as_deref(), Some("org.freedesktop.DBus.Error.ServiceUnknown"));
}

/// S2 (spec §8): an `AddMatch` rule containing `eavesdrop=` is denied
/// and never reaches the bus; only the `Ping` placeholder does.
#[tokio::test]
async fn addmatch_eavesdrop_rejected() {
    let (mut client, mut bus) = spawn_proxy(PolicyStore::new()).await;
    handshake(&mut client, &mut bus).await;

    let call = build_frame(&FrameSpec {
        serial: 3,
        path: Some("/org/freedesktop/DBus"),
        interface: Some(BUS_NAME),
        member: Some("AddMatch"),
        destination: Some(BUS_NAME),
        signature: Some("s"),
        body: single_string_body("type='signal',eavesdrop=true"),
        ..Default::default()
    });
    client.write_all(&call).await.unwrap();

    let forwarded = read_frame(&mut bus).await;
    assert_eq!(forwarded.member.as_deref(), Some("Ping"), "the AddMatch itself must never reach the bus");

    let reply = build_frame(&FrameSpec {
        message_type: MessageType::METHOD_RETURN,
        serial: 101,
        reply_serial: Some(forwarded.serial),
        ..Default::default()
    });
    bus.write_all(&reply).await.unwrap();

    let delivered = read_frame(&mut client).await;
    assert_eq!(delivered.message_type, MessageType::ERROR);
    assert_eq!(delivered.reply_serial, Some(3));
    assert_eq!(delivered.error_name.as_deref(), Some("org.freedesktop.DBus.Error.AccessDenied"));
}

/// S3 (spec §8): forwarding `Hello` triggers the `AddMatch` +
/// `GetNameOwner` startup sync; once `GetNameOwner` resolves a unique
/// id as the owner of a SEE-policy name, that id is treated as SEE for
/// the rest of the session.
#[tokio::test]
async fn hello_triggers_name_sync_and_grants_see() {
    let mut policy = PolicyStore::new();
    policy.add(Filter::plain("com.acme".into(), false, PolicyLevel::See));

    let (mut client, mut bus) = spawn_proxy(policy).await;
    handshake(&mut client, &mut bus).await;

    let see_call = |serial: u32| {
        build_frame(&FrameSpec {
            serial,
            path: Some("/org/freedesktop/DBus"),
            interface: Some(BUS_NAME),
            member: Some("GetConnectionUnixProcessID"),
            destination: Some(BUS_NAME),
            signature: Some("s"),
            body: single_string_body(":1.42"),
            ..Default::default()
        })
    };

    // Before the unique id owns anything the Policy Store knows about,
    // a SEE-gated bus method naming it directly is denied.
    client.write_all(&see_call(2)).await.unwrap();
    let ping = read_frame(&mut bus).await;
    assert_eq!(ping.member.as_deref(), Some("Ping"));
    let reply = build_frame(&FrameSpec {
        message_type: MessageType::METHOD_RETURN,
        serial: 200,
        reply_serial: Some(ping.serial),
        ..Default::default()
    });
    bus.write_all(&reply).await.unwrap();
    let denied = read_frame(&mut client).await;
    assert_eq!(denied.message_type, MessageType::ERROR);
    assert_eq!(denied.reply_serial, Some(2));

    // Forward Hello.
    let hello = build_frame(&FrameSpec {
        serial: 3,
        path: Some("/org/freedesktop/DBus"),
        interface: Some(BUS_NAME),
        member: Some("Hello"),
        destination: Some(BUS_NAME),
        ..Default::default()
    });
    client.write_all(&hello).await.unwrap();

    let forwarded_hello = read_frame(&mut bus).await;
    assert_eq!(forwarded_hello.member.as_deref(), Some("Hello"));
    let add_match = read_frame(&mut bus).await;
    assert_eq!(add_match.member.as_deref(), Some("AddMatch"));
    let get_name_owner = read_frame(&mut bus).await;
    assert_eq!(get_name_owner.member.as_deref(), Some("GetNameOwner"));

    // Answer Hello with the session's own unique id.
    let hello_reply = build_frame(&FrameSpec {
        message_type: MessageType::METHOD_RETURN,
        serial: 201,
        reply_serial: Some(forwarded_hello.serial),
        signature: Some("s"),
        body: single_string_body(":1.99"),
        ..Default::default()
    });
    bus.write_all(&hello_reply).await.unwrap();
    let delivered_hello = read_frame(&mut client).await;
    assert_eq!(delivered_hello.reply_serial, Some(3));

    // AddMatch's own reply is swallowed, never forwarded.
    let add_match_reply = build_frame(&FrameSpec {
        message_type: MessageType::METHOD_RETURN,
        serial: 202,
        reply_serial: Some(add_match.serial),
        ..Default::default()
    });
    bus.write_all(&add_match_reply).await.unwrap();

    // GetNameOwner resolves com.acme to ":1.42".
    let owner_reply = build_frame(&FrameSpec {
        message_type: MessageType::METHOD_RETURN,
        serial: 203,
        reply_serial: Some(get_name_owner.serial),
        signature: Some("s"),
        body: single_string_body(":1.42"),
        ..Default::default()
    });
    bus.write_all(&owner_reply).await.unwrap();

    // Now the same SEE-gated call naming ":1.42" is forwarded: its
    // owned name folds in the Policy Store's SEE grant for com.acme.
    client.write_all(&see_call(10)).await.unwrap();
    let forwarded_see_call = read_frame(&mut bus).await;
    assert_eq!(forwarded_see_call.member.as_deref(), Some("GetConnectionUnixProcessID"));

    let final_reply = build_frame(&FrameSpec {
        message_type: MessageType::METHOD_RETURN,
        serial: 204,
        reply_serial: Some(forwarded_see_call.serial),
        ..Default::default()
    });
    bus.write_all(&final_reply).await.unwrap();
    let allowed = read_frame(&mut client).await;
    assert_eq!(allowed.message_type, MessageType::METHOD_RETURN);
    assert_eq!(allowed.reply_serial, Some(10));
}

/// S4 (spec §8): a `ListNames` reply is filtered down to names the
/// session may see before being delivered to the client.
#[tokio::test]
async fn list_names_is_filtered_to_visible_names() {
    let mut policy = PolicyStore::new();
    policy.add(Filter::plain("org.example.Foo".into(), false, PolicyLevel::Talk));

    let (mut client, mut bus) = spawn_proxy(policy).await;
    handshake(&mut client, &mut bus).await;

    let call = build_frame(&FrameSpec {
        serial: 2,
        path: Some("/org/freedesktop/DBus"),
        interface: Some(BUS_NAME),
        member: Some("ListNames"),
        destination: Some(BUS_NAME),
        ..Default::default()
    });
    client.write_all(&call).await.unwrap();

    let forwarded = read_frame(&mut bus).await;
    assert_eq!(forwarded.member.as_deref(), Some("ListNames"));

    let names = [BUS_NAME, ":1.7", "org.example.Foo", "org.example.Bar"];
    let reply = build_frame(&FrameSpec {
        message_type: MessageType::METHOD_RETURN,
        serial: 300,
        reply_serial: Some(forwarded.serial),
        signature: Some("as"),
        body: write_string_array(&names),
        ..Default::default()
    });
    bus.write_all(&reply).await.unwrap();

    let delivered = read_frame(&mut client).await;
    assert_eq!(delivered.reply_serial, Some(2));
    let filtered = read_string_array(&delivered.body);
    assert_eq!(filtered, vec![BUS_NAME.to_string(), "org.example.Foo".to_string()]);
}
