/*
Copyright (c) 2022 VMware, Inc.
SPDX-License-Identifier: MIT
Permission is hereby granted, free of charge, to any person obtaining a copy
of this software and associated documentation files (the "Software"), to deal
in the Software without restriction, including without limitation the rights
to use, copy, modify, merge, publish, distribute, sublicense, and/or sell
copies of the Software, and to permit persons to whom the Software is
furnished to do so, subject to the following conditions:
The above copyright notice and this permission notice shall be included in all
copies or substantial portions of the Software.
THE SOFTWARE IS PROVIDED "AS IS", WITHOUT WARRANTY OF ANY KIND, EXPRESS OR
IMPLIED, INCLUDING BUT NOT LIMITED TO THE WARRANTIES OF MERCHANTABILITY,
FITNESS FOR A PARTICULAR PURPOSE AND NONINFRINGEMENT. IN NO EVENT SHALL THE
AUTHORS OR COPYRIGHT HOLDERS BE LIABLE FOR ANY CLAIM, DAMAGES OR OTHER
LIABILITY, WHETHER IN AN ACTION OF CONTRACT, TORT OR OTHERWISE, ARISING FROM,
OUT OF OR IN CONNECTION WITH THE SOFTWARE OR THE USE OR OTHER DEALINGS IN THE
SOFTWARE.
 */

//! System call wrappers.
//!
//! Thin wrappers around the `libc` calls the supervisor needs, reporting
//! failures as `std::io::Error` and retrying `EINTR` where a retry is the
//! only sensible response.

use libc::c_int;
use std::ffi::CString;
use std::fs::File;
use std::io::{Error, ErrorKind};
use std::os::unix::prelude::*;
use std::path::Path;

pub fn pipe() -> Result<(OwnedFd, OwnedFd), Error> {
    let mut fds: [RawFd; 2] = [0; 2];
    if unsafe { libc::pipe(fds.as_mut_ptr()) } < 0 {
        Err(Error::last_os_error())?;
    }
    Ok((unsafe { OwnedFd::from_raw_fd(fds[0]) },
        unsafe { OwnedFd::from_raw_fd(fds[1]) }))
}

pub fn set_nonblocking(fd: RawFd) -> Result<(), Error> {
    let flags = unsafe { libc::fcntl(fd, libc::F_GETFL) };
    if flags < 0 {
        return Err(Error::last_os_error());
    }
    if unsafe { libc::fcntl(fd, libc::F_SETFL, flags | libc::O_NONBLOCK) } < 0 {
        return Err(Error::last_os_error());
    }
    Ok(())
}

pub fn set_cloexec(fd: RawFd) -> Result<(), Error> {
    let flags = unsafe { libc::fcntl(fd, libc::F_GETFD) };
    if flags < 0 {
        return Err(Error::last_os_error());
    }
    if unsafe { libc::fcntl(fd, libc::F_SETFD, flags | libc::FD_CLOEXEC) } < 0 {
        return Err(Error::last_os_error());
    }
    Ok(())
}

/// # Safety
///
/// Forking is only safe while the process is single-threaded; any other
/// thread is dead in the child.  The supervisor never starts threads.
pub unsafe fn fork() -> Result<Option<libc::pid_t>, Error> {
    let pid = libc::fork();
    if pid < 0 {
        Err(Error::last_os_error())
    } else if pid == 0 {
        Ok(None)
    } else {
        Ok(Some(pid))
    }
}

/// Reaps one exited child without blocking.  Returns `Ok(None)` when no
/// child is ready, including when there are no children at all.
pub fn waitpid_nohang() -> Result<Option<(libc::pid_t, c_int)>, Error> {
    loop {
        let mut status = 0;
        let pid = unsafe { libc::waitpid(-1, &mut status as *mut c_int, libc::WNOHANG) };
        if pid > 0 {
            return Ok(Some((pid, status)));
        }
        if pid == 0 {
            return Ok(None);
        }
        let err = Error::last_os_error();
        match err.raw_os_error() {
            Some(libc::EINTR) => continue,
            Some(libc::ECHILD) => return Ok(None),
            _ => return Err(err),
        }
    }
}

pub fn kill(pid: libc::pid_t, signal: c_int) -> Result<(), Error> {
    if unsafe { libc::kill(pid, signal) } < 0 {
        Err(Error::last_os_error())
    } else {
        Ok(())
    }
}

/// Waits for input on `fds` with no timeout, retrying `EINTR`.
pub fn poll(fds: &mut [libc::pollfd]) -> Result<(), Error> {
    loop {
        let retval = unsafe { libc::poll(fds.as_mut_ptr(), fds.len() as libc::nfds_t, -1) };
        if retval >= 0 {
            return Ok(());
        }
        let err = Error::last_os_error();
        if err.kind() != ErrorKind::Interrupted {
            return Err(err);
        }
    }
}

/// Creates a FIFO at `path`.  An existing FIFO is tolerated; it may be left
/// over from an earlier supervisor of the same service.
pub fn mkfifo(path: &Path, mode: libc::mode_t) -> Result<(), Error> {
    let path = cstring(path)?;
    if unsafe { libc::mkfifo(path.as_ptr(), mode) } < 0 {
        let err = Error::last_os_error();
        if err.kind() != ErrorKind::AlreadyExists {
            return Err(err);
        }
    }
    Ok(())
}

pub fn fchdir(fd: RawFd) -> Result<(), Error> {
    if unsafe { libc::fchdir(fd) } < 0 {
        Err(Error::last_os_error())
    } else {
        Ok(())
    }
}

pub fn dup2(oldfd: RawFd, newfd: RawFd) -> Result<(), Error> {
    if unsafe { libc::dup2(oldfd, newfd) } != newfd {
        Err(Error::last_os_error())
    } else {
        Ok(())
    }
}

fn fcntl_lock_op(file: &File, command: c_int) -> Result<libc::flock, Error> {
    let mut lck = libc::flock {
        l_type: libc::F_WRLCK as i16,
        l_whence: libc::SEEK_SET as i16,
        l_start: 0,
        l_len: 0,
        l_pid: 0
    };

    loop {
        let retval = unsafe { libc::fcntl(file.as_raw_fd(), command, &mut lck as *mut libc::flock) };
        if retval != -1 {
            return Ok(lck)
        }
        let err = Error::last_os_error();
        if err.kind() != ErrorKind::Interrupted {
            return Err(err);
        }
    }
}

pub fn fcntl_set_lock(file: &File) -> Result<(), Error> {
    let _ = fcntl_lock_op(file, libc::F_SETLK)?;
    Ok(())
}

/// Check whether `file` is locked.  Returns `Ok(Some(pid))` if it's locked by process `pid` or
/// Ok(None) if it's not locked.
pub fn fcntl_get_lock(file: &File) -> Result<Option<c_int>, Error> {
    let lck = fcntl_lock_op(file, libc::F_GETLK)?;
    if lck.l_type == libc::F_UNLCK as i16 {
        Ok(None)
    } else {
        Ok(Some(lck.l_pid))
    }
}

pub fn cstring(path: &Path) -> Result<CString, Error> {
    CString::new(path.as_os_str().as_bytes())
        .map_err(|_| Error::new(ErrorKind::InvalidInput, "path contains a NUL byte"))
}

/// Symbolic name for a signal number, as passed to reset run scripts.
pub fn signal_name(signal: c_int) -> &'static str {
    match signal {
        libc::SIGHUP => "SIGHUP",
        libc::SIGINT => "SIGINT",
        libc::SIGQUIT => "SIGQUIT",
        libc::SIGILL => "SIGILL",
        libc::SIGTRAP => "SIGTRAP",
        libc::SIGABRT => "SIGABRT",
        libc::SIGBUS => "SIGBUS",
        libc::SIGFPE => "SIGFPE",
        libc::SIGKILL => "SIGKILL",
        libc::SIGUSR1 => "SIGUSR1",
        libc::SIGSEGV => "SIGSEGV",
        libc::SIGUSR2 => "SIGUSR2",
        libc::SIGPIPE => "SIGPIPE",
        libc::SIGALRM => "SIGALRM",
        libc::SIGTERM => "SIGTERM",
        libc::SIGCHLD => "SIGCHLD",
        libc::SIGCONT => "SIGCONT",
        libc::SIGSTOP => "SIGSTOP",
        libc::SIGTSTP => "SIGTSTP",
        libc::SIGTTIN => "SIGTTIN",
        libc::SIGTTOU => "SIGTTOU",
        libc::SIGURG => "SIGURG",
        libc::SIGXCPU => "SIGXCPU",
        libc::SIGXFSZ => "SIGXFSZ",
        libc::SIGVTALRM => "SIGVTALRM",
        libc::SIGPROF => "SIGPROF",
        libc::SIGWINCH => "SIGWINCH",
        libc::SIGIO => "SIGIO",
        libc::SIGSYS => "SIGSYS",
        _ => "SIGUNKNOWN",
    }
}
