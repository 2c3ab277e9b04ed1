//! Shared SASL line grammar.
//!
//! D-Bus authentication is a line-oriented text protocol that runs before
//! the binary message format begins. This module only covers the bits that
//! are generic across any SASL-speaking peer: the EXTERNAL auth-id
//! encoding, and validating/splitting `\r\n`-terminated command lines.
//! Session-specific handling of which lines to accept or how to react to
//! `BEGIN` lives in the proxy crate.

/// Encode a uid as the ASCII-hex-of-decimal-digits payload used by
/// `AUTH EXTERNAL`, e.g. uid `1000` becomes `b"31303030"`.
pub fn external_from_uid(buf: &mut [u8; 32], mut id: u32) -> &[u8] {
    const HEX: [u8; 16] = *b"0123456789abcdef";

    let mut n = 0;

    if id == 0 {
        buf[0] = b'0';
        buf[1] = b'0';
        n = 2;
    } else {
        while id > 0 {
            let byte = (id % 10) as u8 + b'0';
            buf[n] = HEX[(byte & 0xf) as usize];
            n += 1;
            buf[n] = HEX[(byte >> 4) as usize];
            n += 1;
            id /= 10;
        }
    }

    buf[..n].reverse();
    &buf[..n]
}

/// Validate one SASL command line (without its trailing `\r\n`): ASCII
/// only, no control characters, and the first token must begin with an
/// uppercase letter.
pub fn validate_line(line: &[u8]) -> bool {
    if line.is_empty() || !line[0].is_ascii_uppercase() {
        return false;
    }

    line.iter().all(|&b| b.is_ascii() && !b.is_ascii_control())
}

/// Split the first whitespace-delimited token off of a line, returning
/// `(token, rest)`. Used to recognize `BEGIN` and its trailing
/// space/tab/end-of-line per the historical upstream grammar.
pub fn first_token(line: &[u8]) -> (&[u8], &[u8]) {
    match line.iter().position(|&b| b == b' ' || b == b'\t') {
        Some(idx) => (&line[..idx], &line[idx..]),
        None => (line, &[]),
    }
}

/// Whether `line`'s first token is exactly `BEGIN`, followed only by
/// end-of-line, a space, or a tab (spec §4.3; the trailing-whitespace
/// allowance is preserved deliberately, see DESIGN.md Open Questions).
pub fn is_begin_line(line: &[u8]) -> bool {
    let (token, _rest) = first_token(line);
    token == b"BEGIN"
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn encodes_uid_zero() {
        let mut buf = [0u8; 32];
        assert_eq!(external_from_uid(&mut buf, 0), b"30");
    }

    #[test]
    fn encodes_uid_1000() {
        let mut buf = [0u8; 32];
        // "1000" -> hex digits of each ASCII decimal digit '1' '0' '0' '0'
        assert_eq!(external_from_uid(&mut buf, 1000), b"31303030");
    }

    #[test]
    fn rejects_lowercase_first_letter() {
        assert!(!validate_line(b"auth EXTERNAL"));
    }

    #[test]
    fn rejects_control_characters() {
        assert!(!validate_line(b"AUTH\x01EXTERNAL"));
    }

    #[test]
    fn accepts_plain_command() {
        assert!(validate_line(b"AUTH EXTERNAL 31303030"));
    }

    #[test]
    fn begin_with_trailing_space_is_begin() {
        assert!(is_begin_line(b"BEGIN "));
        assert!(is_begin_line(b"BEGIN\t"));
        assert!(is_begin_line(b"BEGIN"));
        assert!(!is_begin_line(b"BEGINNER"));
    }
}
