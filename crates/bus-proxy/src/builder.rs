//! Building outgoing frames the proxy itself originates: synthesized
//! calls toward the bus (`AddMatch`, `GetNameOwner`, `ListNames`, the
//! round-trip `Ping`) and synthesized replies rewritten into a real
//! reply's slot (spec §4.5, §4.6).
//!
//! Everything built here is little-endian; the proxy has no reason to
//! match the client's or bus's own endianness for messages it
//! originates itself.

use dbus_wire::{Endianness, Flags, HeaderField, MessageType};

/// Header fields an outgoing, proxy-originated frame may carry.
#[derive(Debug, Default)]
pub struct OutgoingFields<'a> {
    /// `PATH`.
    pub path: Option<&'a str>,
    /// `INTERFACE`.
    pub interface: Option<&'a str>,
    /// `MEMBER`.
    pub member: Option<&'a str>,
    /// `ERROR_NAME`.
    pub error_name: Option<&'a str>,
    /// `REPLY_SERIAL`.
    pub reply_serial: Option<u32>,
    /// `DESTINATION`.
    pub destination: Option<&'a str>,
    /// `SIGNATURE`, required iff `body` is non-empty.
    pub signature: Option<&'a str>,
}

/// Serialize one complete, little-endian frame with the given fields and
/// raw (already-encoded) body bytes.
pub fn build_frame(
    message_type: MessageType,
    flags: Flags,
    serial: u32,
    fields: &OutgoingFields<'_>,
    body: &[u8],
) -> Vec<u8> {
    let mut out = vec![0u8; 16];
    out[0] = Endianness::LITTLE.raw();
    out[1] = message_type.raw();
    out[2] = flags.0;
    out[3] = 1; // protocol version

    let mut field_bytes = Vec::new();
    if let Some(p) = fields.path {
        push_string_field(&mut field_bytes, HeaderField::PATH.raw(), true, p);
    }
    if let Some(i) = fields.interface {
        push_string_field(&mut field_bytes, HeaderField::INTERFACE.raw(), false, i);
    }
    if let Some(m) = fields.member {
        push_string_field(&mut field_bytes, HeaderField::MEMBER.raw(), false, m);
    }
    if let Some(e) = fields.error_name {
        push_string_field(&mut field_bytes, HeaderField::ERROR_NAME.raw(), false, e);
    }
    if let Some(rs) = fields.reply_serial {
        push_u32_field(&mut field_bytes, HeaderField::REPLY_SERIAL.raw(), rs);
    }
    if let Some(d) = fields.destination {
        push_string_field(&mut field_bytes, HeaderField::DESTINATION.raw(), false, d);
    }
    if let Some(sig) = fields.signature {
        push_signature_field(&mut field_bytes, HeaderField::SIGNATURE.raw(), sig);
    }

    out[12..16].copy_from_slice(&(field_bytes.len() as u32).to_le_bytes());
    out.extend_from_slice(&field_bytes);
    while out.len() % 8 != 0 {
        out.push(0);
    }

    out[4..8].copy_from_slice(&(body.len() as u32).to_le_bytes());
    out[8..12].copy_from_slice(&serial.to_le_bytes());
    out.extend_from_slice(body);

    out
}

fn pad_to(out: &mut Vec<u8>, align: usize) {
    while out.len() % align != 0 {
        out.push(0);
    }
}

fn push_string_field(out: &mut Vec<u8>, code: u8, is_path: bool, value: &str) {
    pad_to(out, 8);
    out.push(code);
    out.push(1);
    out.push(if is_path { b'o' } else { b's' });
    out.push(0);
    pad_to(out, 4);
    out.extend_from_slice(&(value.len() as u32).to_le_bytes());
    out.extend_from_slice(value.as_bytes());
    out.push(0);
}

fn push_signature_field(out: &mut Vec<u8>, code: u8, value: &str) {
    pad_to(out, 8);
    out.push(code);
    out.push(1);
    out.push(b'g');
    out.push(0);
    out.push(value.len() as u8);
    out.extend_from_slice(value.as_bytes());
    out.push(0);
}

fn push_u32_field(out: &mut Vec<u8>, code: u8, value: u32) {
    pad_to(out, 8);
    out.push(code);
    out.push(1);
    out.push(b'u');
    out.push(0);
    pad_to(out, 4);
    out.extend_from_slice(&value.to_le_bytes());
}

/// Encode a single string argument as a method-call/signal body.
pub fn single_string_body(value: &str) -> Vec<u8> {
    let mut buf = Vec::with_capacity(value.len() + 5);
    buf.extend_from_slice(&(value.len() as u32).to_le_bytes());
    buf.extend_from_slice(value.as_bytes());
    buf.push(0);
    buf
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::frame::parse_header;

    #[test]
    fn builds_parseable_get_name_owner_call() {
        let body = single_string_body("com.acme");
        let fields = OutgoingFields {
            path: Some("/org/freedesktop/DBus"),
            interface: Some("org.freedesktop.DBus"),
            member: Some("GetNameOwner"),
            destination: Some("org.freedesktop.DBus"),
            signature: Some("s"),
            ..Default::default()
        };
        let frame = build_frame(MessageType::METHOD_CALL, Flags::EMPTY, 7, &fields, &body);
        let header = parse_header(&frame).unwrap();
        assert_eq!(header.serial, 7);
        assert_eq!(header.fields.member.as_deref(), Some("GetNameOwner"));
        assert_eq!(header.fields.signature.as_deref(), Some("s"));
        assert_eq!(&frame[header.header_end..], body.as_slice());
    }

    #[test]
    fn builds_parseable_error_reply() {
        let fields = OutgoingFields {
            error_name: Some("org.freedesktop.DBus.Error.ServiceUnknown"),
            reply_serial: Some(2),
            ..Default::default()
        };
        let frame = build_frame(MessageType::ERROR, Flags::EMPTY, 99, &fields, &[]);
        let header = parse_header(&frame).unwrap();
        assert_eq!(header.fields.reply_serial, Some(2));
        assert_eq!(header.fields.error_name.as_deref(), Some("org.freedesktop.DBus.Error.ServiceUnknown"));
    }
}
