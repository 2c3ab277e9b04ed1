//! Session State Machine (spec §4.3) and per-client session state
//! (spec §3).

use crate::name_tracker::NameTracker;
use crate::reply_tracker::ReplyTracker;

/// Cap on accumulated, not-yet-terminated auth-line bytes (spec §4.3).
pub const AUTH_LINE_CAP: usize = 16 * 1024;

/// Where a client connection currently sits in the handshake.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    /// Waiting for the first byte (the SASL leading nul) from the client.
    PreAuthFirstByte,
    /// Accumulating and validating SASL auth lines until `BEGIN`.
    PreAuth,
    /// Authenticated, but filtering is disabled: plain byte forwarding.
    AuthenticatedUnfiltered,
    /// Authenticated, filtering enabled: the Router processes every frame.
    AuthenticatedFiltered,
}

/// All state the Router and Session driver need for one client
/// connection (spec §3, "Client Session").
pub struct Session {
    /// Current handshake state.
    pub state: SessionState,
    /// Bytes accumulated toward the current (not yet `\r\n`-terminated)
    /// auth line.
    pub auth_buf: Vec<u8>,
    /// Count of synthesized messages the proxy has injected toward the
    /// bus; added to every client serial before forwarding.
    pub serial_offset: u32,
    /// The client's own `Hello` serial, or 0 before it has sent one.
    pub hello_serial: u32,
    /// Last serial accepted from the client; enforces monotonicity.
    pub last_client_serial: u32,
    /// This session's own bus unique id, once known (from the `Hello`
    /// reply).
    pub unique_id: Option<String>,
    /// Outstanding replies expected from the bus, keyed by bus-assigned
    /// serial.
    pub reply_tracker: ReplyTracker,
    /// Per-session unique-id policy and owned-name bookkeeping.
    pub name_tracker: NameTracker,
    /// Serials awaited for a pending `GetNameOwner` issued on behalf of a
    /// name, so the reply can record ownership (spec §4.5).
    pub pending_owner_query: std::collections::HashMap<u32, String>,
    /// Whether reads from the client are currently suspended while the
    /// startup `ListNames` round trip is outstanding (spec §4.5).
    pub reads_suspended: bool,
    /// `--sloppy-names`: treat unique ids named directly in
    /// `NameOwnerChanged` as policy-relevant even without an owned
    /// well-known name (spec §4.4).
    pub sloppy_names: bool,
}

impl Session {
    /// A fresh session immediately after accept, before any bytes have
    /// been exchanged.
    pub fn new(sloppy_names: bool) -> Self {
        Session {
            state: SessionState::PreAuthFirstByte,
            auth_buf: Vec::new(),
            serial_offset: 0,
            hello_serial: 0,
            last_client_serial: 0,
            unique_id: None,
            reply_tracker: ReplyTracker::new(),
            name_tracker: NameTracker::new(),
            pending_owner_query: std::collections::HashMap::new(),
            reads_suspended: false,
            sloppy_names,
        }
    }

    /// Validate and accept the next client-assigned serial, per
    /// testable property 1 (serial monotonicity). Returns the serial to
    /// forward to the bus (`client_serial + serial_offset`) on success.
    pub fn accept_client_serial(&mut self, client_serial: u32) -> Result<u32, crate::error::ProxyError> {
        if client_serial <= self.last_client_serial {
            return Err(crate::error::ProxyError::SerialRegression {
                got: client_serial,
                last: self.last_client_serial,
            });
        }

        self.last_client_serial = client_serial;
        Ok(client_serial + self.serial_offset)
    }

    /// Adjust a bus-assigned `reply_serial` back to the client's own
    /// numbering space, per spec §4.4: only serials issued after the
    /// client's `Hello` and within the synthesized range are shifted.
    pub fn adjust_reply_serial(&self, reply_serial: u32) -> u32 {
        if reply_serial > self.hello_serial.wrapping_add(self.serial_offset) {
            reply_serial.wrapping_sub(self.serial_offset)
        } else {
            reply_serial
        }
    }

    /// Allocate the next serial the proxy itself will use to synthesize
    /// a message toward the bus, bumping `serial_offset`.
    pub fn next_synthetic_serial(&mut self, current_bus_serial_hint: u32) -> u32 {
        self.serial_offset += 1;
        current_bus_serial_hint + self.serial_offset
    }
}

/// Process one fully accumulated auth line (without its trailing
/// `\r\n`). Returns `Ok(true)` if this line was `BEGIN` (handshake
/// complete), `Ok(false)` to keep accumulating, or `Err` if the line is
/// invalid and the connection must close (spec §4.3).
pub fn accept_auth_line(line: &[u8]) -> Result<bool, ()> {
    if !dbus_wire::sasl::validate_line(line) {
        return Err(());
    }

    Ok(dbus_wire::sasl::is_begin_line(line))
}

/// Split newly-received client bytes on `\r\n`, feeding complete lines to
/// the auth-line validator and leaving any trailing partial line (or, if
/// `BEGIN` was seen, the bytes following it) in `session.auth_buf`.
///
/// Returns `Ok(Some(rest))` once `BEGIN` has been seen, where `rest` is
/// whatever followed it in the same read (early framed input per spec
/// §4.3); `Ok(None)` if authentication is still in progress.
pub fn feed_auth_bytes(session: &mut Session, incoming: &[u8]) -> Result<Option<Vec<u8>>, ()> {
    session.auth_buf.extend_from_slice(incoming);

    if session.auth_buf.len() > AUTH_LINE_CAP {
        return Err(());
    }

    loop {
        let Some(pos) = find_crlf(&session.auth_buf) else {
            return Ok(None);
        };

        let line = session.auth_buf[..pos].to_vec();
        let rest_start = pos + 2;

        if accept_auth_line(&line)? {
            let rest = session.auth_buf[rest_start..].to_vec();
            session.auth_buf.clear();
            return Ok(Some(rest));
        }

        session.auth_buf.drain(..rest_start);
    }
}

fn find_crlf(buf: &[u8]) -> Option<usize> {
    buf.windows(2).position(|w| w == b"\r\n")
}
