use std::fmt;

use crate::{Error, ErrorKind};

/// Maximum nesting depth of containers in a signature (matches the D-Bus
/// specification's limit on array/struct nesting).
const MAX_DEPTH: usize = 32;
/// Maximum length of a signature in bytes, per the D-Bus specification.
const MAX_LEN: usize = 255;

/// A validated D-Bus type signature, e.g. `"s"`, `"as"`, `"a{sv}"`.
#[derive(PartialEq, Eq)]
#[repr(transparent)]
pub struct Signature(str);

impl Signature {
    /// The empty signature, used for bodies with no arguments.
    pub const EMPTY: &'static Signature = {
        // SAFETY: the empty string is a valid (empty) signature.
        unsafe { &*("" as *const str as *const Signature) }
    };

    /// Validate and wrap a string as a signature.
    pub fn new(value: &str) -> Result<&Signature, Error> {
        if value.len() > MAX_LEN || !validate(value.as_bytes()) {
            return Err(ErrorKind::InvalidSignature.into());
        }

        // SAFETY: `Signature` is `repr(transparent)` over `str`, just
        // validated above.
        Ok(unsafe { &*(value as *const str as *const Signature) })
    }

    /// Borrow the signature as a plain string.
    #[inline]
    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Borrow the signature as raw bytes.
    #[inline]
    pub fn as_bytes(&self) -> &[u8] {
        self.0.as_bytes()
    }

    /// Whether this signature is exactly a single basic type code, e.g. `"s"`
    /// or `"u"`. Used to validate D-Bus header fields, whose value type must
    /// be a single complete type, not a container.
    pub fn single_code(&self) -> Option<u8> {
        let bytes = self.as_bytes();

        if bytes.len() == 1 {
            Some(bytes[0])
        } else {
            None
        }
    }
}

impl fmt::Debug for Signature {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Debug::fmt(&self.0, f)
    }
}

impl fmt::Display for Signature {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Display::fmt(&self.0, f)
    }
}

/// Validate a full signature string: it must be zero or more complete types
/// back to back, each well formed, with dict entries appearing only
/// directly inside an array and nesting never exceeding [`MAX_DEPTH`].
pub fn validate(bytes: &[u8]) -> bool {
    let mut pos = 0;

    while pos < bytes.len() {
        match parse_complete_type(bytes, pos, 0) {
            Some(next) => pos = next,
            None => return false,
        }
    }

    true
}

/// Parse one complete type starting at `pos`, returning the offset just
/// past it, or `None` if `bytes[pos..]` does not start with a valid type.
fn parse_complete_type(bytes: &[u8], pos: usize, depth: usize) -> Option<usize> {
    if depth > MAX_DEPTH {
        return None;
    }

    let byte = *bytes.get(pos)?;

    match byte {
        b'y' | b'b' | b'n' | b'q' | b'i' | b'u' | b'x' | b't' | b'd' | b's' | b'o' | b'g'
        | b'v' | b'h' => Some(pos + 1),
        b'a' => {
            let after_elem = bytes.get(pos + 1).copied();

            if after_elem == Some(b'{') {
                parse_dict_entry(bytes, pos + 1, depth + 1)
            } else {
                parse_complete_type(bytes, pos + 1, depth + 1)
            }
        }
        b'(' => {
            let mut cursor = pos + 1;

            loop {
                if bytes.get(cursor).copied() == Some(b')') {
                    return Some(cursor + 1);
                }

                cursor = parse_complete_type(bytes, cursor, depth + 1)?;

                if cursor >= bytes.len() {
                    return None;
                }
            }
        }
        _ => None,
    }
}

/// Parse `{kv}` starting at the `{`, where the key must be a basic
/// (non-container) type and exactly one value type follows.
fn parse_dict_entry(bytes: &[u8], open_brace: usize, depth: usize) -> Option<usize> {
    debug_assert_eq!(bytes.get(open_brace).copied(), Some(b'{'));

    let key_start = open_brace + 1;
    let key = *bytes.get(key_start)?;

    if !is_basic_type(key) {
        return None;
    }

    let value_start = parse_complete_type(bytes, key_start, depth)?;
    let value_end = parse_complete_type(bytes, value_start, depth)?;

    if bytes.get(value_end).copied() != Some(b'}') {
        return None;
    }

    Some(value_end + 1)
}

fn is_basic_type(byte: u8) -> bool {
    matches!(
        byte,
        b'y' | b'b' | b'n' | b'q' | b'i' | b'u' | b'x' | b't' | b'd' | b's' | b'o' | b'g' | b'h'
    )
}
