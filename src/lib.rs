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

//! A persistent process supervisor for a single service directory.
//!
//! The supervisor runs a pair of child processes, the **main** service and an
//! optional **log** service, and keeps them alive across exits.  A service is
//! defined by a directory on disk containing an executable `rc.main` (and
//! optionally `rc.log`); the supervisor runs the script with a `start`
//! argument, and when that child exits it runs the script again with a
//! `reset` argument describing how the start exited, then starts it once
//! more.  Restarts are throttled to at most one per second.
//!
//! Alongside the service directory the supervisor owns a *control directory*,
//! keyed on the service directory's device and inode so that at most one
//! supervisor can attach to a given service.  The control directory holds a
//! pidlock, a pair of named FIFOs speaking a small framed request/reply
//! protocol (see [`packet`]), and a binary status file that is atomically
//! replaced whenever the supervised state changes (see [`status`]).
//!
//! Everything runs on a single thread around one `poll`: signal delivery is
//! converted to a readable file descriptor by [`selfpipe`], and the event
//! loop multiplexes that with the control FIFO.

pub mod packet;
pub mod selfpipe;
pub mod status;
pub mod supervisor;
pub mod sys;

mod control;
