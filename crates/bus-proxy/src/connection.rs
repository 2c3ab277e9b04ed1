//! Wires the Frame Codec, Router, and Session State Machine together
//! into the per-client cooperative loop (spec §4.3, §5).
//!
//! One task per accepted client; nothing here is shared with any other
//! client's task, matching spec §5 ("no shared mutable state across
//! clients"). The two socket halves (client, bus) are driven with plain
//! non-blocking reads/writes reacting to readiness, which is the
//! single-threaded cooperative model spec §5 describes.

use std::os::unix::io::{AsRawFd, RawFd};
use std::sync::Arc;

use tokio::net::UnixStream;
use tracing::debug;

use crate::builder::{build_frame, OutgoingFields};
use crate::creds::send_nul_with_own_credentials;
use crate::error::{ProxyError, Result};
use crate::fds::{check_fd_count, close_all, recv_with_fds, send_with_fds};
use crate::frame::{parse_header, peek_prelude, rewrite_reply_serial, rewrite_serial, Header, PRELUDE_LEN};
use crate::policy::{PolicyLevel, PolicyStore, BUS_NAME};
use crate::reply_tracker::ExpectedReply;
use crate::router::{self, ClientDecision};
use crate::session::{self, Session, SessionState};
use dbus_wire::{Endianness, Flags, MessageType};

/// A received, fully framed message: its header, its raw bytes
/// (header + body, unedited), and any ancillary descriptors attached.
struct Frame {
    header: Header,
    buf: Vec<u8>,
    fds: Vec<RawFd>,
}

/// Accumulates bytes from one non-blocking socket until full frames can
/// be split off (spec §4.1's two-phase buffer, generalized into a small
/// read loop).
#[derive(Default)]
struct FrameReader {
    buf: Vec<u8>,
    pending_fds: Vec<RawFd>,
}

impl FrameReader {
    fn fill_from(&mut self, fd: RawFd) -> std::io::Result<usize> {
        let mut scratch = [0u8; 16 * 1024];
        let (n, fds) = recv_with_fds(fd, &mut scratch)?;
        self.buf.extend_from_slice(&scratch[..n]);
        self.pending_fds.extend(fds);
        Ok(n)
    }

    /// Pull the next complete frame out of the buffer, if any.
    fn next_frame(&mut self) -> Result<Option<Frame>> {
        if self.buf.len() < PRELUDE_LEN {
            return Ok(None);
        }

        let prelude = peek_prelude(&self.buf)?;
        if self.buf.len() < prelude.total_len {
            return Ok(None);
        }

        let frame_bytes: Vec<u8> = self.buf.drain(..prelude.total_len).collect();
        let header = parse_header(&frame_bytes)?;

        let expected_fds = header.fields.unix_fds.unwrap_or(0);
        let taken: Vec<RawFd> = if expected_fds == 0 {
            Vec::new()
        } else {
            let n = (expected_fds as usize).min(self.pending_fds.len());
            self.pending_fds.drain(..n).collect()
        };
        check_fd_count(expected_fds, &taken)?;

        Ok(Some(Frame { header, buf: frame_bytes, fds: taken }))
    }
}

/// Drive one accepted client end to end: pre-auth passthrough, then
/// either plain forwarding or the filtering Router loop, until either
/// side closes.
pub async fn run(client: UnixStream, bus: UnixStream, policy: Arc<PolicyStore>, filtering: bool, sloppy_names: bool) -> Result<()> {
    let mut session = Session::new(sloppy_names);

    let leftover = run_preauth(&client, &bus, &mut session, filtering).await?;

    if filtering {
        run_filtered(client, bus, &policy, &mut session, leftover).await
    } else {
        if !leftover.is_empty() {
            bus_write_all(&bus, &leftover).await?;
        }
        run_unfiltered(client, bus).await
    }
}

/// Drive the SASL handshake to completion. Returns whatever client bytes
/// arrived past `BEGIN` in the same read (spec §4.3, "early framed
/// input") — these were never part of the auth-line grammar and so are
/// never written to the bus here; the caller feeds them into whichever
/// post-auth path (filtered Router or raw passthrough) it is about to
/// run.
async fn run_preauth(client: &UnixStream, bus: &UnixStream, session: &mut Session, filtering: bool) -> Result<Vec<u8>> {
    let bus_fd = bus.as_raw_fd();
    let authenticated_state =
        if filtering { SessionState::AuthenticatedFiltered } else { SessionState::AuthenticatedUnfiltered };

    loop {
        client.readable().await?;
        let mut buf = [0u8; 4096];
        let n = match client.try_read(&mut buf) {
            Ok(0) => return Err(ProxyError::Io(std::io::Error::new(std::io::ErrorKind::UnexpectedEof, "client closed during auth"))),
            Ok(n) => n,
            Err(e) if e.kind() == std::io::ErrorKind::WouldBlock => continue,
            Err(e) => return Err(e.into()),
        };

        let mut chunk = &buf[..n];

        if session.state == SessionState::PreAuthFirstByte {
            send_nul_with_own_credentials(bus_fd)?;
            session.state = SessionState::PreAuth;
            if chunk.is_empty() {
                continue;
            }
            chunk = &chunk[1..];
            if chunk.is_empty() {
                continue;
            }
        }

        match feed_auth_chunk(session, bus, chunk).await? {
            Some(rest) => {
                session.state = authenticated_state;
                return Ok(rest);
            }
            None => continue,
        }
    }
}

/// Feed one chunk of client bytes through the auth-line accumulator,
/// forwarding exactly the auth-protocol bytes it consumed (never any
/// trailing early framed input) to the bus.
async fn feed_auth_chunk(session: &mut Session, bus: &UnixStream, chunk: &[u8]) -> Result<Option<Vec<u8>>> {
    match session::feed_auth_bytes(session, chunk) {
        Ok(Some(rest)) => {
            let consumed = &chunk[..chunk.len() - rest.len()];
            bus_write_all(bus, consumed).await?;
            Ok(Some(rest))
        }
        Ok(None) => {
            bus_write_all(bus, chunk).await?;
            Ok(None)
        }
        Err(()) => Err(ProxyError::MalformedFrame("invalid SASL auth line".into())),
    }
}

async fn bus_write_all(bus: &UnixStream, buf: &[u8]) -> Result<()> {
    let mut off = 0;
    while off < buf.len() {
        bus.writable().await?;
        match bus.try_write(&buf[off..]) {
            Ok(n) => off += n,
            Err(e) if e.kind() == std::io::ErrorKind::WouldBlock => continue,
            Err(e) => return Err(e.into()),
        }
    }
    Ok(())
}

async fn run_unfiltered(client: UnixStream, bus: UnixStream) -> Result<()> {
    let to_bus = pump_bytes(&client, &bus);
    let to_client = pump_bytes(&bus, &client);
    tokio::select! {
        r = to_bus => r,
        r = to_client => r,
    }
}

async fn pump_bytes(from: &UnixStream, to: &UnixStream) -> Result<()> {
    loop {
        from.readable().await?;
        let mut buf = [0u8; 16 * 1024];
        let n = match from.try_read(&mut buf) {
            Ok(0) => return Ok(()),
            Ok(n) => n,
            Err(e) if e.kind() == std::io::ErrorKind::WouldBlock => continue,
            Err(e) => return Err(e.into()),
        };
        bus_write_all(to, &buf[..n]).await?;
    }
}

async fn run_filtered(
    client: UnixStream,
    bus: UnixStream,
    policy: &PolicyStore,
    session: &mut Session,
    leftover: Vec<u8>,
) -> Result<()> {
    let client_fd = client.as_raw_fd();
    let bus_fd = bus.as_raw_fd();
    let mut from_client = FrameReader { buf: leftover, pending_fds: Vec::new() };
    let mut from_bus = FrameReader::default();

    while let Some(frame) = from_client.next_frame()? {
        handle_client_frame(policy, session, &client, &bus, frame).await?;
        if session.reads_suspended {
            break;
        }
    }

    loop {
        if session.reads_suspended {
            bus.readable().await?;
            from_bus.fill_from(bus_fd).ok();
            while let Some(frame) = from_bus.next_frame()? {
                handle_bus_frame(policy, session, &bus, &client, frame).await?;
            }
            continue;
        }

        tokio::select! {
            r = client.readable() => {
                r?;
                match from_client.fill_from(client_fd) {
                    Ok(0) => return Ok(()),
                    Ok(_) => {}
                    Err(e) if e.kind() == std::io::ErrorKind::WouldBlock => {}
                    Err(e) => return Err(e.into()),
                }
                while let Some(frame) = from_client.next_frame()? {
                    handle_client_frame(policy, session, &client, &bus, frame).await?;
                    if session.reads_suspended {
                        break;
                    }
                }
            }
            r = bus.readable() => {
                r?;
                match from_bus.fill_from(bus_fd) {
                    Ok(0) => return Ok(()),
                    Ok(_) => {}
                    Err(e) if e.kind() == std::io::ErrorKind::WouldBlock => {}
                    Err(e) => return Err(e.into()),
                }
                while let Some(frame) = from_bus.next_frame()? {
                    handle_bus_frame(policy, session, &bus, &client, frame).await?;
                }
            }
        }
    }
}

async fn handle_client_frame(
    policy: &PolicyStore,
    session: &mut Session,
    client: &UnixStream,
    bus: &UnixStream,
    frame: Frame,
) -> Result<()> {
    let Frame { header, mut buf, fds } = frame;

    if header.message_type != MessageType::METHOD_CALL {
        // Signals/replies originated by the client are forwarded as-is
        // after serial adjustment; the bus enforces its own broadcast
        // rules on anything the client itself emits.
        let adjusted = session.accept_client_serial(header.serial)?;
        rewrite_serial(&mut buf, header.endianness, adjusted);
        send_fd_checked(bus.as_raw_fd(), &buf, &fds)?;
        return Ok(());
    }

    let is_hello = header.fields.destination.as_deref() == Some(BUS_NAME) && header.fields.member.as_deref() == Some("Hello");

    let adjusted_serial = session.accept_client_serial(header.serial)?;
    let body = &buf[header.header_end..];
    let decision = router::classify_client_call(policy, session, &header, body);
    let no_reply_expected = header.flags & Flags::NO_REPLY_EXPECTED;

    match decision {
        ClientDecision::Forward { tag } => {
            let mut out = buf.clone();
            rewrite_serial(&mut out, header.endianness, adjusted_serial);
            send_fd_checked(bus.as_raw_fd(), &out, &fds)?;

            if let Some(tag) = tag {
                if !no_reply_expected {
                    if is_hello {
                        session.hello_serial = header.serial;
                        session.reply_tracker.expect(adjusted_serial, ExpectedReply::Hello);
                    } else {
                        session.reply_tracker.expect(adjusted_serial, tag);
                    }
                }
            }

            if is_hello {
                debug!(serial = adjusted_serial, "forwarded client Hello, queuing startup ops");
                let ops = router::build_startup_ops(policy, session, adjusted_serial);
                for (op_buf, op_tag) in ops {
                    let op_header = parse_header(&op_buf)?;
                    session.reply_tracker.expect(op_header.serial, op_tag);
                    bus_write_all(bus, &op_buf).await?;
                }
            }
        }
        ClientDecision::Synthesize { error_name, as_bool } => {
            close_all(&fds);

            if no_reply_expected {
                debug!(member = header.fields.member.as_deref().unwrap_or(""), "denied call with no reply expected, dropping");
                return Ok(());
            }

            let (ping, tag) = router::build_ping_placeholder(adjusted_serial, error_name, as_bool);
            session.reply_tracker.expect(adjusted_serial, tag);
            bus_write_all(bus, &ping).await?;
        }
    }

    let _ = client;
    Ok(())
}

async fn handle_bus_frame(
    policy: &PolicyStore,
    session: &mut Session,
    bus: &UnixStream,
    client: &UnixStream,
    frame: Frame,
) -> Result<()> {
    let Frame { header, mut buf, fds } = frame;

    match header.message_type {
        MessageType::METHOD_RETURN | MessageType::ERROR => {
            let reply_serial = header.fields.reply_serial.unwrap_or(0);
            let Some(tag) = session.reply_tracker.consume(reply_serial) else {
                debug!(reply_serial, "dropping untagged reply");
                close_all(&fds);
                return Ok(());
            };

            handle_tagged_reply(policy, session, bus, client, header, buf, fds, tag).await
        }
        MessageType::SIGNAL => {
            handle_signal(policy, session, client, header, &mut buf, fds).await
        }
        MessageType::METHOD_CALL => {
            // The bus does not normally call back into a client through
            // this proxy outside of replies/signals; forward
            // conservatively with serial passthrough.
            send_fd_checked(client.as_raw_fd(), &buf, &fds)?;
            Ok(())
        }
    }
}

async fn handle_tagged_reply(
    policy: &PolicyStore,
    session: &mut Session,
    bus: &UnixStream,
    client: &UnixStream,
    header: Header,
    mut buf: Vec<u8>,
    fds: Vec<RawFd>,
    tag: ExpectedReply,
) -> Result<()> {
    let client_reply_serial = session.adjust_reply_serial(header.fields.reply_serial.unwrap_or(0));

    match tag {
        ExpectedReply::Normal => {
            if let Some(offset) = header.fields.reply_serial_offset {
                rewrite_reply_serial(&mut buf, offset, header.endianness, client_reply_serial);
            }
            send_fd_checked(client.as_raw_fd(), &buf, &fds)?;
        }
        ExpectedReply::Hello => {
            close_all(&fds);
            if header.message_type == MessageType::METHOD_RETURN {
                let body = &buf[header.header_end..];
                if let Some(id) = crate::body::read_string_arg0(body, header.endianness) {
                    session.unique_id = Some(id.clone());
                    session.name_tracker.raise_policy(&id, PolicyLevel::Talk);
                }
            }
            if let Some(offset) = header.fields.reply_serial_offset {
                rewrite_reply_serial(&mut buf, offset, header.endianness, client_reply_serial);
            }
            // Re-attach fds intentionally dropped above (Hello never
            // carries any); forward the actual Hello reply through.
            send_fd_checked(client.as_raw_fd(), &buf, &[])?;
        }
        ExpectedReply::Filter => {
            close_all(&fds);
        }
        ExpectedReply::FakeGetNameOwner { name } => {
            close_all(&fds);
            if header.message_type == MessageType::METHOD_RETURN {
                let body = &buf[header.header_end..];
                if let Some(owner) = crate::body::read_string_arg0(body, header.endianness) {
                    session.name_tracker.record_owned_name(&owner, &name);
                }
            }
        }
        ExpectedReply::FakeListNames => {
            close_all(&fds);
            if header.message_type == MessageType::METHOD_RETURN {
                let body = &buf[header.header_end..];
                let followups = router::build_followup_owner_queries(policy, session, body, header.endianness, header.serial);
                for (op_buf, op_tag) in followups {
                    let op_header = parse_header(&op_buf)?;
                    session.reply_tracker.expect(op_header.serial, op_tag);
                    bus_write_all(bus, &op_buf).await?;
                }
            }
            session.reads_suspended = false;
        }
        ExpectedReply::ListNames => {
            close_all(&fds);
            if header.message_type == MessageType::METHOD_RETURN {
                let body = &buf[header.header_end..];
                if let Some(filtered_body) = router::filter_list_names(policy, &session.name_tracker, body, header.endianness) {
                    let out = build_frame(
                        MessageType::METHOD_RETURN,
                        Flags::EMPTY,
                        header.serial,
                        &OutgoingFields { reply_serial: Some(client_reply_serial), signature: Some("as"), ..Default::default() },
                        &filtered_body,
                    );
                    send_fd_checked(client.as_raw_fd(), &out, &[])?;
                }
            } else {
                send_fd_checked(client.as_raw_fd(), &buf, &[])?;
            }
        }
        ExpectedReply::Rewrite { message_type, error_name, body, body_signature } => {
            close_all(&fds);
            let rewritten = router::rewrite_as_synthetic(
                header.serial,
                client_reply_serial,
                message_type,
                error_name.as_deref(),
                &body,
                &body_signature,
            );
            send_fd_checked(client.as_raw_fd(), &rewritten, &[])?;
        }
    }

    Ok(())
}

async fn handle_signal(
    policy: &PolicyStore,
    session: &mut Session,
    client: &UnixStream,
    header: Header,
    buf: &mut [u8],
    fds: Vec<RawFd>,
) -> Result<()> {
    let sender = header.fields.sender.clone().unwrap_or_default();
    if sender.starts_with(':') {
        session.name_tracker.raise_policy(&sender, PolicyLevel::See);
    }

    let is_name_owner_changed = header.fields.interface.as_deref() == Some(BUS_NAME)
        && header.fields.member.as_deref() == Some("NameOwnerChanged");

    if is_name_owner_changed {
        return handle_name_owner_changed(policy, session, client, header, buf, fds).await;
    }

    if header.fields.destination.is_some() {
        // Targeted signal; treat like any other traffic addressed to
        // the client.
        send_fd_checked(client.as_raw_fd(), buf, &fds)?;
        return Ok(());
    }

    let delivered = router::broadcast_allowed(
        policy,
        &session.name_tracker,
        &sender,
        header.fields.path.as_deref(),
        header.fields.interface.as_deref(),
        header.fields.member.as_deref(),
    );

    if delivered {
        send_fd_checked(client.as_raw_fd(), buf, &fds)?;
    } else {
        close_all(&fds);
    }

    Ok(())
}

async fn handle_name_owner_changed(
    policy: &PolicyStore,
    session: &mut Session,
    client: &UnixStream,
    header: Header,
    buf: &mut [u8],
    fds: Vec<RawFd>,
) -> Result<()> {
    let body = &buf[header.header_end..];
    let Some(name) = crate::body::read_string_arg0(body, header.endianness) else {
        close_all(&fds);
        return Ok(());
    };

    let policy_level = policy.lookup(&name).0;
    let sloppy_unique = session.sloppy_names && name.starts_with(':');

    if policy_level < PolicyLevel::See && !sloppy_unique {
        close_all(&fds);
        return Ok(());
    }

    if !name.starts_with(':') {
        if let Some(new_owner) = read_third_arg_string(body, header.endianness) {
            if !new_owner.is_empty() {
                session.name_tracker.record_owned_name(&new_owner, &name);
            }
        }
    }

    send_fd_checked(client.as_raw_fd(), buf, &fds)?;
    Ok(())
}

/// `NameOwnerChanged(name, old_owner, new_owner)`: read the third
/// string argument without re-parsing the first two structurally (all
/// three are plain `s` arguments back to back).
fn read_third_arg_string(body: &[u8], endianness: Endianness) -> Option<String> {
    let mut pos = 0usize;
    for _ in 0..2 {
        pos += (4 - (pos % 4)) % 4;
        let len = dbus_wire::read_u32(body.get(pos..pos + 4)?, 0, endianness) as usize;
        pos += 4 + len + 1;
    }
    pos += (4 - (pos % 4)) % 4;
    let len = dbus_wire::read_u32(body.get(pos..pos + 4)?, 0, endianness) as usize;
    pos += 4;
    let bytes = body.get(pos..pos + len)?;
    std::str::from_utf8(bytes).ok().map(str::to_string)
}

fn send_fd_checked(fd: RawFd, buf: &[u8], fds: &[RawFd]) -> Result<()> {
    send_with_fds(fd, buf, fds).map_err(ProxyError::Io)?;
    Ok(())
}
