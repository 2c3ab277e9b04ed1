//! Autofs Probe (spec §4.7 step 2, §9): detect whether a path lives under
//! an automounter that might block for a long time on open, without
//! actually blocking the caller for more than 200 ms.
//!
//! The probe forks a throwaway child to attempt the open; the child is
//! kept to async-signal-safe calls only (`openat`, `close`, `_exit`) by
//! doing every other bit of setup — building the `CString`, opening the
//! pipe — before the `fork()`.

use std::ffi::CString;
use std::os::unix::io::RawFd;
use std::time::Duration;

/// Linux `AUTOFS_SUPER_MAGIC`, from `linux/auto_fs.h`.
const AUTOFS_SUPER_MAGIC: i64 = 0x0187;

/// Probe timeout (spec §4.7, §5): "200 ms select timeout".
const PROBE_TIMEOUT: Duration = Duration::from_millis(200);

/// Whether `fstatfs`'s filesystem-type magic identifies an autofs mount.
pub fn is_autofs(statfs: &libc::statfs) -> bool {
    statfs.f_type as i64 == AUTOFS_SUPER_MAGIC
}

/// `fstatfs` on an already-open descriptor.
pub fn fstatfs(fd: RawFd) -> std::io::Result<libc::statfs> {
    let mut buf: libc::statfs = unsafe { std::mem::zeroed() };
    let rc = unsafe { libc::fstatfs(fd, &mut buf) };
    if rc < 0 {
        return Err(std::io::Error::last_os_error());
    }
    Ok(buf)
}

/// Attempt to open `(dir_fd, relative)` in a forked child, reporting
/// success only if the child exits zero within [`PROBE_TIMEOUT`].
/// Timeout or any probe-setup failure both count as "do not expose this
/// path" (spec §7: "Autofs probe timeout ⇒ silently skip").
pub fn probe(dir_fd: RawFd, relative: &str) -> bool {
    let Ok(c_relative) = CString::new(relative) else {
        return false;
    };

    let mut pipe_fds = [0i32; 2];
    if unsafe { libc::pipe(pipe_fds.as_mut_ptr()) } != 0 {
        return false;
    }
    let (read_fd, write_fd) = (pipe_fds[0], pipe_fds[1]);

    let pid = unsafe { libc::fork() };
    if pid < 0 {
        unsafe {
            libc::close(read_fd);
            libc::close(write_fd);
        }
        return false;
    }

    if pid == 0 {
        // Child: async-signal-safe operations only from here on.
        unsafe {
            libc::close(read_fd);
            let fd = libc::openat(dir_fd, c_relative.as_ptr(), libc::O_RDONLY | libc::O_NONBLOCK);
            let status = if fd >= 0 {
                libc::close(fd);
                0
            } else {
                1
            };
            libc::_exit(status);
        }
    }

    // Parent: close our copy of the write end so that EOF on `read_fd`
    // fires the moment the child exits, whatever its exit status.
    unsafe {
        libc::close(write_fd);
    }

    let ok = wait_with_timeout(pid, read_fd, PROBE_TIMEOUT);
    unsafe {
        libc::close(read_fd);
    }
    ok
}

fn wait_with_timeout(pid: libc::pid_t, read_fd: RawFd, timeout: Duration) -> bool {
    let mut read_set: libc::fd_set = unsafe { std::mem::zeroed() };
    unsafe {
        libc::FD_ZERO(&mut read_set);
        libc::FD_SET(read_fd, &mut read_set);
    }
    let mut tv = libc::timeval { tv_sec: 0, tv_usec: timeout.as_micros() as libc::suseconds_t };

    let ready = unsafe { libc::select(read_fd + 1, &mut read_set, std::ptr::null_mut(), std::ptr::null_mut(), &mut tv) };

    if ready > 0 {
        reap(pid, 0)
    } else {
        unsafe {
            libc::kill(pid, libc::SIGKILL);
        }
        reap(pid, 0);
        false
    }
}

fn reap(pid: libc::pid_t, _flags: libc::c_int) -> bool {
    let mut status: libc::c_int = 0;
    let rc = unsafe { libc::waitpid(pid, &mut status, 0) };
    rc == pid && unsafe { libc::WIFEXITED(status) } && unsafe { libc::WEXITSTATUS(status) } == 0
}
