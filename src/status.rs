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

//! The binary status record and its atomic publication.
//!
//! The supervisor maintains a fixed-size binary snapshot of its state,
//! mutated in place as pids and flags change and written out to the control
//! directory as `status` via a temporary file and `rename`, so an external
//! observer always reads either the old record or the new one in full.
//!
//! Record layout (all integers big-endian; timestamps are 8 bytes of Unix
//! epoch seconds followed by 4 bytes of nanoseconds):
//!
//! | offset | bytes | field                         |
//! |--------|-------|-------------------------------|
//! | 0      | 4     | supervisor pid                |
//! | 4      | 12    | supervisor start time         |
//! | 16     | 1     | supervisor flags              |
//! | 18     | 4     | main pid (0 if none)          |
//! | 22     | 12    | main transition time          |
//! | 34     | 1     | main flags                    |
//! | 36     | 4     | log pid                       |
//! | 40     | 12    | log transition time           |
//! | 52     | 1     | log flags                     |

use bitflags::bitflags;
use std::fs::{self, OpenOptions};
use std::io::{Error, ErrorKind, Write};
use std::os::unix::fs::OpenOptionsExt;
use std::path::Path;
use std::time::{SystemTime, UNIX_EPOCH};

use crate::supervisor::SlotId;

/// Size of the status record, and therefore of the on-disk status file.
pub const STATUS_SIZE: usize = 70;

pub const STATUS_FILE: &str = "status";
pub const STATUS_TMP: &str = "status.tmp";

bitflags! {
    /// Supervisor flags byte, offset 16.
    pub struct SuperFlags: u8 {
        const EXITING = 1 << 0;
        const HASLOG = 1 << 1;
    }
}

bitflags! {
    /// Per-slot flags byte, offsets 34 and 52.
    pub struct SlotFlags: u8 {
        const UP = 1 << 0;
        const RESET = 1 << 1;
        const PAUSE = 1 << 2;
        /// The slot is transitioning: its current state differs from the
        /// state the operator wants it in.
        const WANT = 1 << 3;
        const ONCE = 1 << 4;
    }
}

const OFF_SUPER_PID: usize = 0;
const OFF_SUPER_WHEN: usize = 4;
const OFF_SUPER_FLAGS: usize = 16;
const OFF_MAIN_PID: usize = 18;
const OFF_MAIN_WHEN: usize = 22;
const OFF_MAIN_FLAGS: usize = 34;
const OFF_LOG_PID: usize = 36;
const OFF_LOG_WHEN: usize = 40;
const OFF_LOG_FLAGS: usize = 52;

pub struct StatusRecord {
    buf: [u8; STATUS_SIZE],
}

impl StatusRecord {
    /// A fresh record for a supervisor started at `when`.  Both slot
    /// transition times start out as the supervisor's own start time.
    pub fn new(pid: libc::pid_t, when: SystemTime) -> StatusRecord {
        let mut record = StatusRecord { buf: [0; STATUS_SIZE] };
        pack_u32(&mut record.buf[OFF_SUPER_PID..], pid as u32);
        pack_timestamp(&mut record.buf[OFF_SUPER_WHEN..], when);
        pack_timestamp(&mut record.buf[OFF_MAIN_WHEN..], when);
        pack_timestamp(&mut record.buf[OFF_LOG_WHEN..], when);
        record
    }

    pub fn set_super_flags(&mut self, flags: SuperFlags) {
        self.buf[OFF_SUPER_FLAGS] = flags.bits();
    }

    /// Records a pid transition for a slot.
    pub fn set_slot_pid(&mut self, which: SlotId, pid: libc::pid_t, when: SystemTime) {
        let (pid_off, when_off) = match which {
            SlotId::Main => (OFF_MAIN_PID, OFF_MAIN_WHEN),
            SlotId::Log => (OFF_LOG_PID, OFF_LOG_WHEN),
        };
        pack_u32(&mut self.buf[pid_off..], pid as u32);
        pack_timestamp(&mut self.buf[when_off..], when);
    }

    pub fn set_slot_flags(&mut self, which: SlotId, flags: SlotFlags) {
        let off = match which {
            SlotId::Main => OFF_MAIN_FLAGS,
            SlotId::Log => OFF_LOG_FLAGS,
        };
        self.buf[off] = flags.bits();
    }

    pub fn bytes(&self) -> &[u8] {
        &self.buf
    }
}

fn pack_u32(buf: &mut [u8], value: u32) {
    buf[..4].copy_from_slice(&value.to_be_bytes());
}

fn pack_timestamp(buf: &mut [u8], when: SystemTime) {
    // A time before the epoch packs as zero.
    let since_epoch = when.duration_since(UNIX_EPOCH).unwrap_or_default();
    buf[..8].copy_from_slice(&since_epoch.as_secs().to_be_bytes());
    buf[8..12].copy_from_slice(&since_epoch.subsec_nanos().to_be_bytes());
}

/// Publishes `record` by writing `tmp` and renaming it over `dest`.
///
/// A short write is reported as `ErrorKind::WriteZero` so the initial
/// publication can distinguish it; every error here is a warning in steady
/// state.
pub fn post(record: &StatusRecord, tmp: &Path, dest: &Path) -> Result<(), Error> {
    let mut file = OpenOptions::new()
        .write(true)
        .create(true)
        .truncate(true)
        .mode(0o644)
        .open(tmp)?;
    let written = loop {
        match file.write(record.bytes()) {
            Ok(n) => break n,
            Err(e) if e.kind() == ErrorKind::Interrupted => continue,
            Err(e) => return Err(e),
        }
    };
    drop(file);
    if written < STATUS_SIZE {
        return Err(Error::new(ErrorKind::WriteZero, "short write on status file"));
    }
    fs::rename(tmp, dest)?;
    Ok(())
}
