//! Frame Codec: parsing a single message header plus tracking the byte
//! offsets the Router needs to rewrite `serial`/`reply_serial` in place
//! (spec §4.1).
//!
//! The wire layout (protocol version 1) is:
//!
//! ```text
//! byte 0       endianness marker ('l' or 'B')
//! byte 1       message type
//! byte 2       flags
//! byte 3       protocol version (must be 1)
//! bytes 4..8   body length (u32)
//! bytes 8..12  serial (u32) -- always at this fixed offset
//! bytes 12..16 header fields array length (u32)
//! bytes 16..   header fields array, then padding to an 8-byte boundary,
//!              then the body
//! ```

use dbus_wire::{Endianness, Flags, HeaderField, MessageType};

use crate::error::{ProxyError, Result};

/// Size of the fixed prelude every message begins with.
pub const PRELUDE_LEN: usize = 16;
/// Fixed byte offset of the `serial` field within every message.
pub const SERIAL_OFFSET: usize = 8;
/// Only protocol version this proxy understands (spec §6).
pub const PROTOCOL_VERSION: u8 = 1;

/// The subset of header fields the router inspects, plus the byte
/// offsets of the ones it may need to rewrite in place.
#[derive(Debug, Default, Clone)]
pub struct HeaderFields {
    /// `PATH`.
    pub path: Option<String>,
    /// `INTERFACE`.
    pub interface: Option<String>,
    /// `MEMBER`.
    pub member: Option<String>,
    /// `ERROR_NAME`.
    pub error_name: Option<String>,
    /// `REPLY_SERIAL`.
    pub reply_serial: Option<u32>,
    /// Byte offset of `REPLY_SERIAL`'s 4-byte value, if present, for
    /// in-place rewriting.
    pub reply_serial_offset: Option<usize>,
    /// `DESTINATION`.
    pub destination: Option<String>,
    /// `SENDER`.
    pub sender: Option<String>,
    /// `SIGNATURE`, as raw text (validity already checked while parsing).
    pub signature: Option<String>,
    /// `UNIX_FDS`: declared count of ancillary descriptors attached.
    pub unix_fds: Option<u32>,
}

/// A fully parsed message header. The body itself is left untouched in
/// the original buffer; callers needing body contents (e.g. `arg0`) parse
/// it directly out of `buf[header_end..]`.
#[derive(Debug, Clone)]
pub struct Header {
    /// Endianness this entire frame (header and body) is encoded in.
    pub endianness: Endianness,
    /// Message type.
    pub message_type: MessageType,
    /// Message flags.
    pub flags: Flags,
    /// Declared body length.
    pub body_len: u32,
    /// The message serial.
    pub serial: u32,
    /// Parsed header fields.
    pub fields: HeaderFields,
    /// Offset where the header (incl. trailing alignment padding) ends
    /// and the body begins.
    pub header_end: usize,
    /// Total frame length: `header_end + body_len`.
    pub total_len: usize,
}

/// Prelude-only information, enough to size the rest of the frame before
/// it has fully arrived (spec §4.1's two-phase buffer).
#[derive(Debug, Clone, Copy)]
pub struct PreludeInfo {
    /// Parsed endianness.
    pub endianness: Endianness,
    /// Byte offset the header fields array (and its trailing padding)
    /// ends at, i.e. where the body begins.
    pub header_end: usize,
    /// Total frame length including the body.
    pub total_len: usize,
}

/// Inspect the first [`PRELUDE_LEN`] bytes of `buf` to compute how many
/// total bytes the frame needs. `buf` must be at least `PRELUDE_LEN`
/// bytes long.
pub fn peek_prelude(buf: &[u8]) -> Result<PreludeInfo> {
    debug_assert!(buf.len() >= PRELUDE_LEN);

    let endianness = Endianness::from_marker(buf[0])
        .map_err(|_| ProxyError::MalformedFrame("invalid endianness marker".into()))?;

    if buf[3] != PROTOCOL_VERSION {
        return Err(ProxyError::MalformedFrame(format!("unsupported protocol version {}", buf[3])));
    }

    let body_len = read_u32(buf, 4, endianness);
    let fields_len = read_u32(buf, 12, endianness);

    let fields_end = PRELUDE_LEN
        .checked_add(fields_len as usize)
        .ok_or_else(|| ProxyError::MalformedFrame("header fields length overflow".into()))?;
    let header_end = fields_end + padding_to_align8(fields_end);
    let total_len = header_end
        .checked_add(body_len as usize)
        .ok_or_else(|| ProxyError::MalformedFrame("body length overflow".into()))?;

    Ok(PreludeInfo { endianness, header_end, total_len })
}

/// Fully parse a complete frame's header. `buf` must be at least
/// `total_len` (from [`peek_prelude`]) bytes long.
pub fn parse_header(buf: &[u8]) -> Result<Header> {
    let prelude = peek_prelude(buf)?;
    let endianness = prelude.endianness;

    let message_type = MessageType::from_raw(buf[1])
        .ok_or_else(|| ProxyError::MalformedFrame(format!("invalid message type {}", buf[1])))?;
    let flags = Flags(buf[2]);
    let body_len = read_u32(buf, 4, endianness);
    let serial = read_u32(buf, SERIAL_OFFSET, endianness);

    if serial == 0 {
        return Err(ProxyError::MalformedFrame("serial must be nonzero".into()));
    }

    let fields_len = read_u32(buf, 12, endianness) as usize;
    let fields = parse_fields(buf, PRELUDE_LEN, PRELUDE_LEN + fields_len, endianness)?;

    validate_required_fields(message_type, &fields)?;

    Ok(Header {
        endianness,
        message_type,
        flags,
        body_len,
        serial,
        fields,
        header_end: prelude.header_end,
        total_len: prelude.total_len,
    })
}

fn validate_required_fields(message_type: MessageType, fields: &HeaderFields) -> Result<()> {
    use dbus_wire::validate_object_path;

    let reject_reserved = |path: &Option<String>, interface: &Option<String>| -> Result<()> {
        if let Some(p) = path {
            if p.as_str() == dbus_wire::LOCAL_PATH {
                return Err(ProxyError::MalformedFrame("message targets reserved local path".into()));
            }
            if !validate_object_path(p.as_bytes()) {
                return Err(ProxyError::MalformedFrame("invalid object path".into()));
            }
        }
        if let Some(i) = interface {
            if i == "org.freedesktop.DBus.Local" {
                return Err(ProxyError::MalformedFrame("message targets reserved local interface".into()));
            }
        }
        Ok(())
    };

    match message_type {
        MessageType::METHOD_CALL => {
            if fields.path.is_none() || fields.member.is_none() {
                return Err(ProxyError::MalformedFrame("method call missing path/member".into()));
            }
            reject_reserved(&fields.path, &fields.interface)?;
        }
        MessageType::METHOD_RETURN => {
            if fields.reply_serial.is_none() {
                return Err(ProxyError::MalformedFrame("method return missing reply_serial".into()));
            }
        }
        MessageType::ERROR => {
            if fields.error_name.is_none() || fields.reply_serial.is_none() {
                return Err(ProxyError::MalformedFrame("error missing error_name/reply_serial".into()));
            }
        }
        MessageType::SIGNAL => {
            if fields.path.is_none() || fields.interface.is_none() || fields.member.is_none() {
                return Err(ProxyError::MalformedFrame("signal missing path/interface/member".into()));
            }
            reject_reserved(&fields.path, &fields.interface)?;
        }
    }

    Ok(())
}

fn parse_fields(buf: &[u8], start: usize, end: usize, endianness: Endianness) -> Result<HeaderFields> {
    let mut fields = HeaderFields::default();
    let mut pos = start;

    while pos < end {
        pos += padding_to_align8(pos);
        if pos >= end {
            break;
        }

        let code = *buf.get(pos).ok_or_else(|| truncated())?;
        pos += 1;

        let sig_len = *buf.get(pos).ok_or_else(|| truncated())? as usize;
        pos += 1;
        let sig_bytes = buf.get(pos..pos + sig_len).ok_or_else(|| truncated())?;
        pos += sig_len;
        if *buf.get(pos).ok_or_else(|| truncated())? != 0 {
            return Err(ProxyError::MalformedFrame("header field signature not nul-terminated".into()));
        }
        pos += 1;

        let contained = *sig_bytes.first().ok_or_else(|| {
            ProxyError::MalformedFrame("header field variant has empty signature".into())
        })?;

        let field = HeaderField::from_raw(code);
        if field.is_none() {
            return Err(ProxyError::MalformedFrame(format!("unrecognized header field code {code}")));
        }
        let field = field.unwrap();

        match contained {
            b's' | b'o' => {
                pos += padding_to_align4(pos);
                let len = read_u32(buf, pos, endianness) as usize;
                pos += 4;
                let text = buf.get(pos..pos + len).ok_or_else(|| truncated())?;
                pos += len;
                if *buf.get(pos).ok_or_else(|| truncated())? != 0 {
                    return Err(ProxyError::MalformedFrame("header field string not nul-terminated".into()));
                }
                pos += 1;
                let text = std::str::from_utf8(text)
                    .map_err(|_| ProxyError::MalformedFrame("header field string not utf-8".into()))?
                    .to_string();
                assign_string_field(&mut fields, field, text);
            }
            b'g' => {
                let len = *buf.get(pos).ok_or_else(|| truncated())? as usize;
                pos += 1;
                let text = buf.get(pos..pos + len).ok_or_else(|| truncated())?;
                pos += len;
                if *buf.get(pos).ok_or_else(|| truncated())? != 0 {
                    return Err(ProxyError::MalformedFrame("header field signature not nul-terminated".into()));
                }
                pos += 1;
                let text = std::str::from_utf8(text)
                    .map_err(|_| ProxyError::MalformedFrame("header field signature not utf-8".into()))?
                    .to_string();
                if field == HeaderField::SIGNATURE {
                    fields.signature = Some(text);
                }
            }
            b'u' => {
                pos += padding_to_align4(pos);
                let value_offset = pos;
                let value = read_u32(buf, pos, endianness);
                pos += 4;
                match field {
                    HeaderField::REPLY_SERIAL => {
                        fields.reply_serial = Some(value);
                        fields.reply_serial_offset = Some(value_offset);
                    }
                    HeaderField::UNIX_FDS => {
                        fields.unix_fds = Some(value);
                    }
                    _ => {
                        return Err(ProxyError::MalformedFrame("unexpected u32 header field".into()));
                    }
                }
            }
            other => {
                return Err(ProxyError::MalformedFrame(format!(
                    "unsupported header field value type {other}"
                )));
            }
        }
    }

    Ok(fields)
}

fn assign_string_field(fields: &mut HeaderFields, field: HeaderField, text: String) {
    match field {
        HeaderField::PATH => fields.path = Some(text),
        HeaderField::INTERFACE => fields.interface = Some(text),
        HeaderField::MEMBER => fields.member = Some(text),
        HeaderField::ERROR_NAME => fields.error_name = Some(text),
        HeaderField::DESTINATION => fields.destination = Some(text),
        HeaderField::SENDER => fields.sender = Some(text),
        _ => {}
    }
}

fn truncated() -> ProxyError {
    ProxyError::MalformedFrame("truncated header field".into())
}

fn read_u32(buf: &[u8], offset: usize, endianness: Endianness) -> u32 {
    dbus_wire::read_u32(buf, offset, endianness)
}

fn padding_to_align8(pos: usize) -> usize {
    (8 - (pos % 8)) % 8
}

fn padding_to_align4(pos: usize) -> usize {
    (4 - (pos % 4)) % 4
}

/// Rewrite the 4-byte `serial` field of a complete frame in place,
/// respecting its parsed endianness (spec §4.1, §9: never assume
/// platform byte order).
pub fn rewrite_serial(buf: &mut [u8], endianness: Endianness, new_serial: u32) {
    dbus_wire::write_u32(buf, SERIAL_OFFSET, endianness, new_serial);
}

/// Rewrite the 4-byte `reply_serial` field at `offset` in place.
pub fn rewrite_reply_serial(buf: &mut [u8], offset: usize, endianness: Endianness, new_value: u32) {
    dbus_wire::write_u32(buf, offset, endianness, new_value);
}

#[cfg(test)]
mod tests {
    use super::*;

    fn build_hello(serial: u32) -> Vec<u8> {
        // A minimal METHOD_CALL to org.freedesktop.DBus/Hello with no body.
        let mut buf = Vec::new();
        buf.push(b'l');
        buf.push(MessageType::METHOD_CALL.raw());
        buf.push(0);
        buf.push(PROTOCOL_VERSION);
        buf.extend_from_slice(&0u32.to_le_bytes()); // body_len
        buf.extend_from_slice(&serial.to_le_bytes());

        let mut fields = Vec::new();
        push_field(&mut fields, HeaderField::PATH.raw(), b'o', b"/org/freedesktop/DBus");
        push_field(&mut fields, HeaderField::MEMBER.raw(), b's', b"Hello");
        push_field(&mut fields, HeaderField::INTERFACE.raw(), b's', b"org.freedesktop.DBus");
        push_field(&mut fields, HeaderField::DESTINATION.raw(), b's', b"org.freedesktop.DBus");

        buf.extend_from_slice(&(fields.len() as u32).to_le_bytes());
        buf.extend_from_slice(&fields);
        while buf.len() % 8 != 0 {
            buf.push(0);
        }
        buf
    }

    fn push_field(out: &mut Vec<u8>, code: u8, type_code: u8, value: &[u8]) {
        while out.len() % 8 != 0 {
            out.push(0);
        }
        out.push(code);
        out.push(1);
        out.push(type_code);
        out.push(0);
        while out.len() % 4 != 0 {
            out.push(0);
        }
        out.extend_from_slice(&(value.len() as u32).to_le_bytes());
        out.extend_from_slice(value);
        out.push(0);
    }

    #[test]
    fn parses_minimal_hello() {
        let buf = build_hello(1);
        let prelude = peek_prelude(&buf).unwrap();
        assert_eq!(prelude.total_len, buf.len());
        let header = parse_header(&buf).unwrap();
        assert_eq!(header.serial, 1);
        assert_eq!(header.message_type, MessageType::METHOD_CALL);
        assert_eq!(header.fields.member.as_deref(), Some("Hello"));
        assert_eq!(header.fields.path.as_deref(), Some("/org/freedesktop/DBus"));
    }

    #[test]
    fn rejects_reserved_local_path() {
        let mut buf = build_hello(1);
        // Corrupt nothing; build a call to the reserved path directly.
        let mut fields = Vec::new();
        push_field(&mut fields, HeaderField::PATH.raw(), b'o', dbus_wire::LOCAL_PATH.as_bytes());
        push_field(&mut fields, HeaderField::MEMBER.raw(), b's', b"Ping");
        buf.truncate(16);
        buf.extend_from_slice(&(fields.len() as u32).to_le_bytes());
        buf.extend_from_slice(&fields);
        while buf.len() % 8 != 0 {
            buf.push(0);
        }
        assert!(parse_header(&buf).is_err());
    }

    #[test]
    fn serial_is_zero_rejected() {
        let buf = build_hello(0);
        assert!(parse_header(&buf).is_err());
    }

    #[test]
    fn rewrites_serial_in_place_little_endian() {
        let mut buf = build_hello(1);
        rewrite_serial(&mut buf, Endianness::LITTLE, 42);
        let header = parse_header(&buf).unwrap();
        assert_eq!(header.serial, 42);
    }
}
