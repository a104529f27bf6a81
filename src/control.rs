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

//! Serving the control FIFOs: one request packet in, one reply packet out,
//! and the command dispatcher behind them.

use libc::c_int;
use std::io::ErrorKind;
use tracing::{event, Level};

use crate::packet::{Packet, PROTO_VERSION, TYPE_COMMAND, TYPE_QUERY};
use crate::supervisor::{RunTarget, SlotId, Supervisor};
use crate::sys;

/// Command bytes above this select the log slot.
const LOG_SHIFT: u8 = 0x7f;

impl Supervisor {
    /// Reads one request from the input FIFO and replies on the output FIFO.
    /// Each packet is a complete transaction; nothing is remembered between
    /// requests.
    pub(crate) fn check_control(&mut self) {
        let packet = match Packet::read_from(&self.fifo_in) {
            Ok(packet) => packet,
            // The poll can report readable for a packet a previous read
            // already consumed; nothing to do.
            Err(e) if e.kind() == ErrorKind::WouldBlock => return,
            Err(e) if e.kind() == ErrorKind::InvalidData => {
                event!(Level::WARN, "malformed packet on the control fifo ({e})");
                self.proto_error(libc::EPROTO as u32);
                return;
            }
            Err(e) => {
                event!(Level::WARN, "read failed on the control fifo ({e})");
                self.proto_error(e.raw_os_error().unwrap_or(libc::EIO) as u32);
                return;
            }
        };

        if packet.version != PROTO_VERSION {
            event!(Level::WARN, "protocol version mismatch on the control fifo");
            self.proto_error(libc::EPROTO as u32);
            return;
        }

        match packet.typ {
            TYPE_COMMAND => {
                // Just one command per packet please.
                if packet.payload.len() != 1 {
                    self.proto_error(libc::EPROTO as u32);
                    return;
                }
                let mut command = packet.payload[0];
                let mut which = SlotId::Main;
                if command > LOG_SHIFT {
                    command -= LOG_SHIFT;
                    which = SlotId::Log;
                }
                event!(
                    Level::DEBUG,
                    "processing control command '{}' for the {} service",
                    char::from(command),
                    which.name()
                );
                let recognized = self.apply_command(which, command);
                self.proto_error(if recognized { 0 } else { libc::EPROTO as u32 });
            }
            TYPE_QUERY => self.proto_status(),
            _ => {
                event!(Level::WARN, "unknown packet type on the control fifo");
                self.proto_error(libc::EPROTO as u32);
            }
        }
    }

    /// Replies with an `E` packet.  Reply failures are not the client's
    /// problem; the client may simply have gone away.
    fn proto_error(&self, code: u32) {
        if code != 0 {
            event!(Level::WARN, "sending error reply {code} on the control fifo");
        }
        if let Err(e) = Packet::error_reply(code).write_to(&self.fifo_out) {
            event!(Level::DEBUG, "could not write the reply packet ({e})");
        }
    }

    /// Replies with an `S` packet carrying the current status record.
    fn proto_status(&mut self) {
        self.update_flags();
        if let Err(e) = Packet::status_reply(&self.record).write_to(&self.fifo_out) {
            event!(Level::DEBUG, "could not write the status reply ({e})");
        }
    }

    /// Applies one command byte to a slot.  Returns false for a command the
    /// protocol does not know, which the caller answers with `EPROTO`.
    pub(crate) fn apply_command(&mut self, which: SlotId, command: u8) -> bool {
        let pid = self.slot(which).pid;

        match command {
            // Meta-commands act on the supervisor or on both slots and are
            // ignored when addressed to the log slot.
            b'X' => {
                if which != SlotId::Log {
                    self.selfpipe.set_exiting();
                }
            }
            b'D' => {
                if which != SlotId::Log {
                    self.apply_command(SlotId::Main, b'd');
                    self.apply_command(SlotId::Log, b'd');
                }
            }
            b'U' => {
                if which != SlotId::Log {
                    self.apply_command(SlotId::Log, b'u');
                    self.apply_command(SlotId::Main, b'u');
                }
            }
            b'd' => {
                self.slot_mut(which).wantdown = true;
                if pid != 0 {
                    // Terminate, then continue in case the child is stopped.
                    self.apply_command(which, b't');
                    self.apply_command(which, b'c');
                }
                self.statchange += 1;
            }
            b'u' => {
                let slot = self.slot_mut(which);
                slot.isonce = false;
                slot.wantdown = false;
                if pid == 0 {
                    self.exec(which, RunTarget::Start);
                } else {
                    self.statchange += 1;
                }
            }
            b'o' => {
                let slot = self.slot_mut(which);
                slot.isonce = true;
                slot.wantdown = false;
                if pid == 0 {
                    self.exec(which, RunTarget::Start);
                } else {
                    self.statchange += 1;
                }
            }
            b'a' => {
                if pid != 0 {
                    self.deliver(which, libc::SIGALRM);
                }
            }
            b'c' => {
                self.slot_mut(which).ispaused = false;
                if pid != 0 {
                    self.deliver(which, libc::SIGCONT);
                }
                self.statchange += 1;
            }
            b'h' => {
                if pid != 0 {
                    self.deliver(which, libc::SIGHUP);
                }
            }
            b'i' => {
                if pid != 0 {
                    self.deliver(which, libc::SIGINT);
                }
            }
            b'k' => {
                if pid != 0 {
                    self.deliver(which, libc::SIGKILL);
                }
            }
            b'p' => {
                // A resetting child may not be paused.
                if pid != 0 && !self.slot(which).isreset {
                    self.deliver(which, libc::SIGSTOP);
                    self.slot_mut(which).ispaused = true;
                    self.statchange += 1;
                }
            }
            b'q' => {
                if pid != 0 {
                    self.deliver(which, libc::SIGQUIT);
                }
            }
            b't' => {
                if pid != 0 {
                    self.deliver(which, libc::SIGTERM);
                }
            }
            b'w' => {
                if pid != 0 {
                    self.deliver(which, libc::SIGWINCH);
                }
            }
            b'1' => {
                if pid != 0 {
                    self.deliver(which, libc::SIGUSR1);
                }
            }
            b'2' => {
                if pid != 0 {
                    self.deliver(which, libc::SIGUSR2);
                }
            }
            _ => return false,
        }

        true
    }

    /// Delivers a signal to a slot's child.  A resetting child is shielded
    /// from everything except CONT and KILL.  Delivery failures are ignored;
    /// the child may have exited between the decision and the kill.
    fn deliver(&self, which: SlotId, signal: c_int) {
        let slot = self.slot(which);
        if !slot.isreset {
            let _ = sys::kill(slot.pid, signal);
            return;
        }

        match signal {
            libc::SIGCONT | libc::SIGKILL => {
                event!(
                    Level::WARN,
                    "sending {} to the resetting {} service",
                    sys::signal_name(signal),
                    which.name()
                );
                let _ = sys::kill(slot.pid, signal);
            }
            _ => {
                event!(
                    Level::WARN,
                    "dropping {} to the resetting {} service",
                    sys::signal_name(signal),
                    which.name()
                );
            }
        }
    }
}
