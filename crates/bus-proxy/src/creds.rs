//! Peer credentials (spec §1, §4.3): the proxy forwards its *own*
//! kernel-supplied credentials to the upstream bus rather than
//! impersonating the client it is proxying for.

use std::io;
use std::mem::size_of;
use std::os::unix::io::RawFd;

/// The uid the proxy process itself runs as, used for the upstream
/// `AUTH EXTERNAL` handshake.
pub fn own_uid() -> u32 {
    // SAFETY: getuid takes no arguments and cannot fail.
    unsafe { libc::getuid() }
}

/// Send the single leading SASL nul byte to `fd`, attached to an
/// `SCM_CREDENTIALS` ancillary message carrying the proxy's own
/// `(pid, uid, gid)` rather than the client's (spec §1, §4.3: "the proxy
/// does not impersonate the client").
pub fn send_nul_with_own_credentials(fd: RawFd) -> io::Result<()> {
    let cred = libc::ucred {
        pid: unsafe { libc::getpid() },
        uid: unsafe { libc::getuid() },
        gid: unsafe { libc::getgid() },
    };

    let byte = [0u8];
    let mut iov = libc::iovec { iov_base: byte.as_ptr() as *mut _, iov_len: 1 };

    let control_len = unsafe { libc::CMSG_SPACE(size_of::<libc::ucred>() as u32) as usize };
    let mut control = vec![0u8; control_len];

    let mut msg: libc::msghdr = unsafe { std::mem::zeroed() };
    msg.msg_iov = &mut iov;
    msg.msg_iovlen = 1;
    msg.msg_control = control.as_mut_ptr() as *mut _;
    msg.msg_controllen = control.len() as _;

    unsafe {
        let cmsg = libc::CMSG_FIRSTHDR(&msg);
        (*cmsg).cmsg_level = libc::SOL_SOCKET;
        (*cmsg).cmsg_type = libc::SCM_CREDENTIALS;
        (*cmsg).cmsg_len = libc::CMSG_LEN(size_of::<libc::ucred>() as u32) as _;
        std::ptr::write_unaligned(libc::CMSG_DATA(cmsg) as *mut libc::ucred, cred);
    }

    let n = unsafe { libc::sendmsg(fd, &msg, 0) };
    if n < 0 {
        return Err(io::Error::last_os_error());
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn own_uid_matches_libc() {
        let uid = own_uid();
        assert_eq!(uid, unsafe { libc::getuid() });
    }
}
