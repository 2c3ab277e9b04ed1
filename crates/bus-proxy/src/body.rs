//! Minimal body-argument readers. The router only ever needs to pull a
//! handful of shapes out of a message body: a leading string (`arg0` of
//! most name-taking bus methods) or an array of strings (`ListNames`'s
//! return value). Nothing here attempts to parse an arbitrary signature.

use dbus_wire::Endianness;

fn align(pos: usize, to: usize) -> usize {
    (to - (pos % to)) % to
}

/// Read the first argument of a body as a string (covers `s` and `o`
/// leading arguments alike: `GetNameOwner`, `RequestName`,
/// `StartServiceByName`, `AddMatch`'s rule, etc).
pub fn read_string_arg0(body: &[u8], endianness: Endianness) -> Option<String> {
    let mut pos = 0;
    pos += align(pos, 4);
    let len = read_u32(body, pos, endianness)? as usize;
    pos += 4;
    let bytes = body.get(pos..pos + len)?;
    std::str::from_utf8(bytes).ok().map(str::to_string)
}

/// Read a body whose sole argument is `as` (array of strings), as
/// returned by `ListNames`/`ListActivatableNames`.
pub fn read_string_array(body: &[u8], endianness: Endianness) -> Option<Vec<String>> {
    let mut pos = 0;
    pos += align(pos, 4);
    let array_len = read_u32(body, pos, endianness)? as usize;
    pos += 4;
    pos += align(pos, 4);

    let end = pos.checked_add(array_len)?;
    let mut items = Vec::new();

    while pos < end {
        pos += align(pos, 4);
        let slen = read_u32(body, pos, endianness)? as usize;
        pos += 4;
        let bytes = body.get(pos..pos + slen)?;
        items.push(std::str::from_utf8(bytes).ok()?.to_string());
        pos += slen + 1; // payload + nul terminator
    }

    Some(items)
}

/// Re-encode a list of strings as an `as` body, little-endian, for a
/// filtered `ListNames` reply (spec §4.4, tag `LIST_NAMES`).
pub fn write_string_array(items: &[String]) -> Vec<u8> {
    let mut elems = Vec::new();
    for item in items {
        while elems.len() % 4 != 0 {
            elems.push(0);
        }
        elems.extend_from_slice(&(item.len() as u32).to_le_bytes());
        elems.extend_from_slice(item.as_bytes());
        elems.push(0);
    }

    let mut out = Vec::with_capacity(elems.len() + 4);
    out.extend_from_slice(&(elems.len() as u32).to_le_bytes());
    out.extend_from_slice(&elems);
    out
}

fn read_u32(buf: &[u8], offset: usize, endianness: Endianness) -> Option<u32> {
    if offset + 4 > buf.len() {
        return None;
    }
    Some(dbus_wire::read_u32(buf, offset, endianness))
}
