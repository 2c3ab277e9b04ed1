//! Ancillary file-descriptor transport via `SCM_RIGHTS` (spec §4.1, §5):
//! descriptors attached to a frame must cross the proxy 1:1 with the
//! header's declared `unix_fds` count.

use std::io;
use std::mem::size_of;
use std::os::unix::io::RawFd;

use crate::error::{ProxyError, Result};

/// Maximum descriptors accepted per `recvmsg` call. The bus protocol caps
/// `unix_fds` well below this in practice; this is a hard backstop
/// against a hostile peer trying to exhaust the control buffer.
const MAX_FDS: usize = 64;

/// Bytes of ancillary control-message space needed to carry `MAX_FDS`
/// descriptors, rounded up as `CMSG_SPACE` would.
fn cmsg_space(count: usize) -> usize {
    unsafe { libc::CMSG_SPACE((count * size_of::<RawFd>()) as u32) as usize }
}

/// Receive up to one frame's worth of plain bytes plus any attached
/// descriptors from `fd`. Returns `(bytes_read, fds)`; `bytes_read == 0`
/// means the peer closed the connection.
pub fn recv_with_fds(fd: RawFd, buf: &mut [u8]) -> io::Result<(usize, Vec<RawFd>)> {
    let mut iov = libc::iovec { iov_base: buf.as_mut_ptr() as *mut _, iov_len: buf.len() };

    let control_len = cmsg_space(MAX_FDS);
    let mut control = vec![0u8; control_len];

    let mut msg: libc::msghdr = unsafe { std::mem::zeroed() };
    msg.msg_iov = &mut iov;
    msg.msg_iovlen = 1;
    msg.msg_control = control.as_mut_ptr() as *mut _;
    msg.msg_controllen = control.len() as _;

    let n = unsafe { libc::recvmsg(fd, &mut msg, 0) };
    if n < 0 {
        return Err(io::Error::last_os_error());
    }

    let mut fds = Vec::new();
    let mut cmsg = unsafe { libc::CMSG_FIRSTHDR(&msg) };

    while !cmsg.is_null() {
        let header = unsafe { &*cmsg };
        if header.cmsg_level == libc::SOL_SOCKET && header.cmsg_type == libc::SCM_RIGHTS {
            let data_ptr = unsafe { libc::CMSG_DATA(cmsg) } as *const RawFd;
            let payload_len = header.cmsg_len as usize - cmsg_hdr_len();
            let count = payload_len / size_of::<RawFd>();

            for i in 0..count {
                let raw_fd = unsafe { std::ptr::read_unaligned(data_ptr.add(i)) };
                fds.push(raw_fd);
            }
        }

        cmsg = unsafe { libc::CMSG_NXTHDR(&msg, cmsg) };
    }

    Ok((n as usize, fds))
}

fn cmsg_hdr_len() -> usize {
    unsafe { libc::CMSG_LEN(0) as usize }
}

/// Send `buf` on `fd`, attaching `fds` as an `SCM_RIGHTS` ancillary
/// message. The descriptors are not closed by this call; the caller owns
/// them both before and after.
pub fn send_with_fds(fd: RawFd, buf: &[u8], fds: &[RawFd]) -> io::Result<usize> {
    let mut iov = libc::iovec { iov_base: buf.as_ptr() as *mut _, iov_len: buf.len() };

    let mut control = if fds.is_empty() {
        Vec::new()
    } else {
        vec![0u8; cmsg_space(fds.len())]
    };

    let mut msg: libc::msghdr = unsafe { std::mem::zeroed() };
    msg.msg_iov = &mut iov;
    msg.msg_iovlen = 1;

    if !fds.is_empty() {
        msg.msg_control = control.as_mut_ptr() as *mut _;
        msg.msg_controllen = control.len() as _;

        unsafe {
            let cmsg = libc::CMSG_FIRSTHDR(&msg);
            (*cmsg).cmsg_level = libc::SOL_SOCKET;
            (*cmsg).cmsg_type = libc::SCM_RIGHTS;
            (*cmsg).cmsg_len = libc::CMSG_LEN((fds.len() * size_of::<RawFd>()) as u32) as _;

            let data_ptr = libc::CMSG_DATA(cmsg) as *mut RawFd;
            for (i, &raw_fd) in fds.iter().enumerate() {
                std::ptr::write_unaligned(data_ptr.add(i), raw_fd);
            }
        }
    }

    let n = unsafe { libc::sendmsg(fd, &msg, 0) };
    if n < 0 {
        return Err(io::Error::last_os_error());
    }

    Ok(n as usize)
}

/// Close every descriptor in `fds`, ignoring errors (the descriptor may
/// already have been consumed).
pub fn close_all(fds: &[RawFd]) {
    for &raw_fd in fds {
        unsafe {
            libc::close(raw_fd);
        }
    }
}

/// Enforce the 1:1 descriptor-count invariant (spec §4.1, §5): if the
/// header declares `expected` descriptors but `received.len()` differs,
/// the connection must close. The caller is responsible for closing
/// `received` first.
pub fn check_fd_count(expected: u32, received: &[RawFd]) -> Result<()> {
    if received.len() as u32 != expected {
        close_all(received);
        return Err(ProxyError::FdCountMismatch { expected, got: received.len() as u32 });
    }
    Ok(())
}
