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

//! Signal-safe doorbell for the event loop.
//!
//! A `SelfPipe` converts asynchronous signal delivery into a file descriptor
//! that `poll` can wait on.  `SIGCHLD` and `SIGTERM` each write one byte to
//! the pipe from the signal handler; `SIGTERM` additionally latches an exit
//! flag.  A signal delivered between reaping children and entering `poll`
//! leaves its byte in the pipe, so the wait cannot sleep through it.

use anyhow::Result;
use signal_hook::consts::signal::{SIGCHLD, SIGTERM};
use std::io::ErrorKind;
use std::os::unix::prelude::*;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use crate::sys;

pub struct SelfPipe {
    read: OwnedFd,
    // Held open for the life of the process; the signal handlers write to it.
    _write: OwnedFd,
    exiting: Arc<AtomicBool>,
}

impl SelfPipe {
    /// Creates the pipe and installs the signal hooks.  Both ends are
    /// nonblocking and close-on-exec: a full pipe drops the wake byte (one
    /// pending byte already guarantees a wake), and children never see the
    /// descriptors.
    pub fn new() -> Result<SelfPipe> {
        let (read, write) = sys::pipe()?;
        for fd in [read.as_raw_fd(), write.as_raw_fd()] {
            sys::set_cloexec(fd)?;
            sys::set_nonblocking(fd)?;
        }

        let exiting = Arc::new(AtomicBool::new(false));
        signal_hook::flag::register(SIGTERM, Arc::clone(&exiting))?;
        signal_hook::low_level::pipe::register_raw(SIGTERM, write.as_raw_fd())?;
        signal_hook::low_level::pipe::register_raw(SIGCHLD, write.as_raw_fd())?;

        Ok(SelfPipe { read, _write: write, exiting })
    }

    /// The descriptor the event loop polls for input.
    pub fn fd(&self) -> RawFd {
        self.read.as_raw_fd()
    }

    /// True once `SIGTERM` has been delivered or `set_exiting` called.
    pub fn is_exiting(&self) -> bool {
        self.exiting.load(Ordering::SeqCst)
    }

    /// Latches the exit flag from the event loop (the `X` control command).
    pub fn set_exiting(&self) {
        self.exiting.store(true, Ordering::SeqCst);
    }

    /// Consumes pending wake bytes until the pipe is empty.
    pub fn drain(&self) {
        let mut byte = [0u8; 1];
        loop {
            let n = unsafe {
                libc::read(self.read.as_raw_fd(), byte.as_mut_ptr() as *mut libc::c_void, 1)
            };
            if n == 1 {
                continue;
            }
            if n < 0 {
                let err = std::io::Error::last_os_error();
                if err.kind() == ErrorKind::Interrupted {
                    continue;
                }
            }
            break;
        }
    }
}
