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

//! The supervisor itself: two subservice slots, their start/reset state
//! machine, setup of the control directory, and the event loop.

use anyhow::{bail, Context, Result};
use std::ffi::CString;
use std::fs::{self, File, OpenOptions};
use std::io::{Error, ErrorKind, Write};
use std::os::unix::prelude::*;
use std::path::{Path, PathBuf};
use std::process;
use std::thread;
use std::time::{Duration, Instant, SystemTime};
use tracing::{event, Level};

use crate::selfpipe::SelfPipe;
use crate::status::{self, StatusRecord, SlotFlags, SuperFlags, STATUS_FILE, STATUS_TMP};
use crate::sys;

/// Base directory for control directories, a sibling of the supervised
/// service directories.
pub const CONTROL_BASE: &str = ".control";

pub const LOCK_PID: &str = "lock.pid";
pub const LOCK_CONTROL: &str = "lock.control";
pub const CTL_IN: &str = "ctl.in";
pub const CTL_OUT: &str = "ctl.out";

const FORK_RETRY: Duration = Duration::from_secs(9);
const RESPAWN_INTERVAL: Duration = Duration::from_secs(1);

/// The two subservice positions.  The pair is deliberately fixed: the log
/// slot has asymmetric rules (it ignores meta-commands, its stdin is wired
/// to the main service's stdout, and it is shut down last).
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum SlotId {
    Main,
    Log,
}

impl SlotId {
    pub fn name(self) -> &'static str {
        match self {
            SlotId::Main => "main",
            SlotId::Log => "log",
        }
    }

    fn index(self) -> usize {
        match self {
            SlotId::Main => 0,
            SlotId::Log => 1,
        }
    }
}

/// The two run-script targets.  `start` is the service body; `reset` is the
/// bookkeeping pass run after every start exit, told how the start went.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum RunTarget {
    Start,
    Reset,
}

/// Per-slot child state.
pub(crate) struct Slot {
    /// 0 when no child, else the pid of the running start or reset.
    pub(crate) pid: libc::pid_t,
    /// Meaningful only while `pid != 0`.
    pub(crate) isreset: bool,
    /// Wall-clock time of the most recent pid transition.
    pub(crate) when: SystemTime,
    /// Earliest time the next start may run (respawn governor).
    pub(crate) when_ok: Option<Instant>,
    /// Wait status of the last exited start, consumed by the next reset.
    pub(crate) wstat: libc::c_int,
    pub(crate) wantdown: bool,
    pub(crate) isonce: bool,
    pub(crate) ispaused: bool,
    pub(crate) islog: bool,
}

impl Slot {
    fn new(which: SlotId, when: SystemTime) -> Slot {
        Slot {
            pid: 0,
            isreset: false,
            when,
            when_ok: None,
            wstat: 0,
            wantdown: false,
            isonce: false,
            ispaused: false,
            islog: which == SlotId::Log,
        }
    }
}

pub(crate) struct LogPipe {
    pub(crate) read: OwnedFd,
    /// Taken (closed) during shutdown so the logger sees EOF on stdin.
    pub(crate) write: Option<OwnedFd>,
}

pub struct Supervisor {
    /// Service directory path as given on the command line; passed through
    /// to run scripts as their third argument.
    pub(crate) svdir_arg: CString,
    /// Open handle on the service directory, for `fchdir` in children.
    pub(crate) svdir_fd: File,
    /// Held for the life of the process: the lock is the singleton guarantee.
    _pidlock: File,
    /// Created for clients to serialize themselves; the supervisor only
    /// keeps it open.
    _ctllock: File,
    pub(crate) fifo_in: File,
    pub(crate) fifo_out: File,
    pub(crate) haslog: bool,
    pub(crate) logpipe: Option<LogPipe>,
    pub(crate) flagdown: bool,
    pub(crate) flagonce: bool,
    pub(crate) selfpipe: SelfPipe,
    pub(crate) record: StatusRecord,
    /// Non-zero means the on-disk status file is stale.
    pub(crate) statchange: u32,
    pub(crate) status_file: PathBuf,
    pub(crate) status_tmp: PathBuf,
    pub(crate) slots: [Slot; 2],
}

/// Control directory name for the service directory with this identity.
fn control_dir_for(metadata: &fs::Metadata) -> PathBuf {
    Path::new(CONTROL_BASE).join(format!("sv.{:x}.{:x}", metadata.dev(), metadata.ino()))
}

fn create_dir_idempotent(path: &Path) -> Result<(), Error> {
    match fs::create_dir(path) {
        Err(e) if e.kind() != ErrorKind::AlreadyExists => Err(e),
        _ => Ok(()),
    }
}

/// Takes the advisory write lock on `path` and writes our pid as its body.
/// A held lock means another supervisor already owns this service.
fn acquire_pidlock(path: &Path, pid: libc::pid_t) -> Result<File> {
    let file = OpenOptions::new()
        .write(true)
        .create(true)
        .open(path)
        .with_context(|| format!("{}: create failed", path.display()))?;

    if let Err(e) = sys::fcntl_set_lock(&file) {
        if let Ok(Some(holder)) = sys::fcntl_get_lock(&file) {
            bail!("{}: already running as pid {holder}", path.display());
        }
        return Err(e).with_context(|| format!("{}: fcntl(F_SETLK) failed", path.display()));
    }

    file.set_len(0).with_context(|| format!("{}: truncate failed", path.display()))?;
    (&file)
        .write_all(format!("{pid}\n").as_bytes())
        .with_context(|| format!("{}: write failed", path.display()))?;
    sys::set_cloexec(file.as_raw_fd())?;
    Ok(file)
}

fn open_fifo(name: &str) -> Result<File> {
    sys::mkfifo(Path::new(name), 0o600)
        .with_context(|| format!("{name}: mkfifo failed"))?;
    let file = OpenOptions::new()
        .read(true)
        .write(true)
        .custom_flags(libc::O_NONBLOCK)
        .open(name)
        .with_context(|| format!("{name}: open failed"))?;
    sys::set_cloexec(file.as_raw_fd())?;
    Ok(file)
}

impl Supervisor {
    /// Performs all of the supervisor's one-time setup: the signal pipe, the
    /// control directory (pidlock, initial status, client lock, FIFOs), and
    /// the service directory (boot flags, logger detection, log pipe).
    /// Every failure here is fatal; after `new` returns, runtime errors
    /// degrade to warnings.
    pub fn new(svdir: &Path, once: bool) -> Result<Supervisor> {
        let pid = process::id() as libc::pid_t;
        let started = SystemTime::now();

        let selfpipe = SelfPipe::new().context("could not set up the signal pipe")?;
        let record = StatusRecord::new(pid, started);

        event!(Level::DEBUG, "initializing service control directory ...");
        let base = File::open(".").context("could not open the base directory")?;

        let metadata = fs::metadata(svdir)
            .with_context(|| format!("{}: stat failed", svdir.display()))?;
        if !metadata.is_dir() {
            bail!("{}: not a directory", svdir.display());
        }

        let ctldir = control_dir_for(&metadata);
        create_dir_idempotent(Path::new(CONTROL_BASE))
            .with_context(|| format!("{CONTROL_BASE}: mkdir failed"))?;
        create_dir_idempotent(&ctldir)
            .with_context(|| format!("{}: mkdir failed", ctldir.display()))?;

        let pidlock = acquire_pidlock(&ctldir.join(LOCK_PID), pid)
            .context("could not acquire the pidlock in the service control directory")?;

        // First status publication.  This one must succeed cleanly; a short
        // write is the one failure with its own exit code.
        let status_file = ctldir.join(STATUS_FILE);
        let status_tmp = ctldir.join(STATUS_TMP);
        match status::post(&record, &status_tmp, &status_file) {
            Ok(()) => (),
            Err(e) if e.kind() == ErrorKind::WriteZero => {
                event!(Level::ERROR, "short write initializing the status file");
                process::exit(111);
            }
            Err(e) => {
                return Err(e).with_context(|| {
                    format!("{}: could not write the initial status file", status_file.display())
                })
            }
        }

        // Populate the rest of the control directory from inside it.  The
        // input FIFO comes last: clients probe it to see a live supervisor.
        std::env::set_current_dir(&ctldir)
            .with_context(|| format!("{}: chdir failed", ctldir.display()))?;
        let ctllock = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .mode(0o600)
            .custom_flags(libc::O_NONBLOCK)
            .open(LOCK_CONTROL)
            .with_context(|| format!("{LOCK_CONTROL}: open failed"))?;
        sys::set_cloexec(ctllock.as_raw_fd())?;
        let fifo_out = open_fifo(CTL_OUT)?;
        let fifo_in = open_fifo(CTL_IN)?;
        sys::fchdir(base.as_raw_fd())
            .context("could not return to the base directory from the control directory")?;

        event!(Level::DEBUG, "initializing service definition directory ...");
        std::env::set_current_dir(svdir)
            .with_context(|| format!("{}: chdir failed", svdir.display()))?;
        let svdir_fd = File::open(".")
            .with_context(|| format!("{}: open failed", svdir.display()))?;
        sys::set_cloexec(svdir_fd.as_raw_fd())?;

        let flagdown = Path::new("flag.down").exists();
        let flagonce = once || Path::new("flag.once").exists();

        let mut haslog = false;
        if let Ok(st) = fs::metadata("rc.log") {
            if st.permissions().mode() & 0o100 != 0 {
                event!(Level::DEBUG, "rc.log exists and is executable, enabling the log service");
                haslog = true;
            } else {
                event!(Level::WARN, "rc.log exists but is not executable");
            }
        }

        let logpipe = if haslog {
            let (read, write) = sys::pipe().context("could not create the log pipe")?;
            sys::set_cloexec(read.as_raw_fd())?;
            sys::set_cloexec(write.as_raw_fd())?;
            Some(LogPipe { read, write: Some(write) })
        } else {
            None
        };

        sys::fchdir(base.as_raw_fd())
            .context("could not return to the base directory from the service directory")?;

        let svdir_arg = sys::cstring(svdir)
            .with_context(|| format!("{}: invalid path", svdir.display()))?;

        event!(Level::INFO, "supervising {} as pid {pid}", svdir.display());
        Ok(Supervisor {
            svdir_arg,
            svdir_fd,
            _pidlock: pidlock,
            _ctllock: ctllock,
            fifo_in,
            fifo_out,
            haslog,
            logpipe,
            flagdown,
            flagonce,
            selfpipe,
            record,
            statchange: 0,
            status_file,
            status_tmp,
            slots: [Slot::new(SlotId::Main, started), Slot::new(SlotId::Log, started)],
        })
    }

    pub(crate) fn slot(&self, which: SlotId) -> &Slot {
        &self.slots[which.index()]
    }

    pub(crate) fn slot_mut(&mut self, which: SlotId) -> &mut Slot {
        &mut self.slots[which.index()]
    }

    /// First-time startup.  The logger starts irrespective of the boot
    /// flags; those only govern the main service.
    pub fn boot(&mut self) {
        if self.haslog {
            self.exec(SlotId::Log, RunTarget::Start);
        }
        if self.flagdown {
            self.slot_mut(SlotId::Main).wantdown = true;
        } else {
            if self.flagonce {
                self.slot_mut(SlotId::Main).isonce = true;
            }
            self.exec(SlotId::Main, RunTarget::Start);
        }
    }

    /// Fork/exec the run script of slot `which` with the given target.
    /// A busy slot, or the log slot without a logger, is a silent no-op.
    pub(crate) fn exec(&mut self, which: SlotId, target: RunTarget) {
        if which == SlotId::Log && !self.haslog {
            return;
        }
        if self.slot(which).pid != 0 {
            return;
        }

        let argv = self.build_argv(which, target);

        // Respawn governor: only starts are throttled, and the child, not
        // the supervisor, sleeps off the delay.
        let mut delay = Duration::ZERO;
        if target == RunTarget::Start {
            if let Some(when_ok) = self.slot(which).when_ok {
                let now = Instant::now();
                if now < when_ok {
                    event!(
                        Level::WARN,
                        "respawn governor engaged on 'start' of the {} service",
                        which.name()
                    );
                    delay = when_ok - now;
                }
            }
        }

        let pid = loop {
            match unsafe { sys::fork() } {
                Ok(Some(pid)) => break pid,
                Ok(None) => self.exec_child(which, target, &argv, delay),
                Err(e) => {
                    event!(Level::WARN, "fork failed for the {} service ({e})", which.name());
                    event!(Level::WARN, "wedging for retry in 9 seconds ...");
                    thread::sleep(FORK_RETRY);
                }
            }
        };

        let now = SystemTime::now();
        let slot = self.slot_mut(which);
        slot.pid = pid;
        slot.isreset = target == RunTarget::Reset;
        slot.wstat = 0;
        slot.when = now;
        if target == RunTarget::Start {
            slot.when_ok = Some(Instant::now() + RESPAWN_INTERVAL + delay);
        }
        self.pid_change(which);
    }

    /// argv for a run-script invocation: the script, the target keyword, and
    /// the service directory; a reset additionally learns how the previous
    /// start went.
    fn build_argv(&self, which: SlotId, target: RunTarget) -> Vec<CString> {
        let slot = self.slot(which);
        let script = if slot.islog { "./rc.log" } else { "./rc.main" };
        let target_arg = match target {
            RunTarget::Start => "start",
            RunTarget::Reset => "reset",
        };

        let mut argv = vec![
            CString::new(script).unwrap(),
            CString::new(target_arg).unwrap(),
            self.svdir_arg.clone(),
        ];

        if target == RunTarget::Reset {
            let wstat = slot.wstat;
            if libc::WIFEXITED(wstat) {
                argv.push(CString::new("exit").unwrap());
                argv.push(CString::new(libc::WEXITSTATUS(wstat).to_string()).unwrap());
            } else {
                let signaled = libc::WIFSIGNALED(wstat);
                let signal = if signaled { libc::WTERMSIG(wstat) } else { libc::WSTOPSIG(wstat) };
                argv.push(CString::new(if signaled { "signal" } else { "stopped" }).unwrap());
                argv.push(CString::new(signal.to_string()).unwrap());
                argv.push(CString::new(sys::signal_name(signal)).unwrap());
            }
        }

        argv
    }

    /// The forked child: enter the service directory, wire the log pipe,
    /// restore default signal dispositions, sleep off any governor delay,
    /// and exec.  Failure anywhere here is fatal to the child only.
    fn exec_child(&self, which: SlotId, target: RunTarget, argv: &[CString], delay: Duration) -> ! {
        if let Err(e) = sys::fchdir(self.svdir_fd.as_raw_fd()) {
            event!(Level::ERROR, "(in child) fchdir to the service directory failed ({e})");
            process::exit(111);
        }

        if let Some(ref logpipe) = self.logpipe {
            let wire = match which {
                SlotId::Main => Some((logpipe.write.as_ref().map(|fd| fd.as_raw_fd()), 1)),
                // The logger reads the pipe only when starting; a resetting
                // logger inherits nothing from it.
                SlotId::Log if target == RunTarget::Start => {
                    Some((Some(logpipe.read.as_raw_fd()), 0))
                }
                SlotId::Log => None,
            };
            if let Some((fd, stdio)) = wire {
                let result = match fd {
                    Some(fd) => sys::dup2(fd, stdio),
                    None => Err(Error::from_raw_os_error(libc::EBADF)),
                };
                if let Err(e) = result {
                    event!(Level::ERROR, "(in child) dup2 on the log pipe failed ({e})");
                    process::exit(111);
                }
            }
            // Both pipe ends are close-on-exec; the dup onto stdio survives.
        }

        unsafe {
            libc::signal(libc::SIGTERM, libc::SIG_DFL);
            libc::signal(libc::SIGCHLD, libc::SIG_DFL);
            libc::signal(libc::SIGPIPE, libc::SIG_DFL);
            let mut sigset: libc::sigset_t = std::mem::zeroed();
            libc::sigemptyset(&mut sigset);
            libc::sigprocmask(libc::SIG_SETMASK, &sigset, std::ptr::null_mut());
        }

        if !delay.is_zero() {
            thread::sleep(delay);
        }

        let mut ptrs: Vec<*const libc::c_char> = argv.iter().map(|arg| arg.as_ptr()).collect();
        ptrs.push(std::ptr::null());
        unsafe {
            libc::execv(argv[0].as_ptr(), ptrs.as_ptr());
        }
        event!(Level::ERROR, "(in child) exec failed ({})", Error::last_os_error());
        process::exit(111);
    }

    /// Folds a slot's pid transition into the status record.
    pub(crate) fn pid_change(&mut self, which: SlotId) {
        let (pid, when) = {
            let slot = self.slot(which);
            (slot.pid, slot.when)
        };
        self.record.set_slot_pid(which, pid, when);
        self.statchange += 1;
    }

    /// Recomputes both flag bytes in the status record from current state.
    pub(crate) fn update_flags(&mut self) {
        let mut flags = SuperFlags::empty();
        if self.selfpipe.is_exiting() {
            flags |= SuperFlags::EXITING;
        }
        if self.haslog {
            flags |= SuperFlags::HASLOG;
        }
        self.record.set_super_flags(flags);

        for which in [SlotId::Main, SlotId::Log] {
            if which == SlotId::Log && !self.haslog {
                break;
            }
            let slot = self.slot(which);
            let mut flags = SlotFlags::empty();
            if slot.pid != 0 {
                flags |= SlotFlags::UP;
                if slot.isreset {
                    flags |= SlotFlags::RESET;
                }
                if slot.ispaused {
                    flags |= SlotFlags::PAUSE;
                }
                // Transitioning: a reset headed back up, or a start headed
                // down.
                if slot.isreset != slot.wantdown {
                    flags |= SlotFlags::WANT;
                }
            } else if !slot.wantdown {
                // Down, but not wanted down.
                flags |= SlotFlags::WANT;
            }
            if slot.isonce {
                flags |= SlotFlags::ONCE;
            }
            self.record.set_slot_flags(which, flags);
        }
    }

    /// Publishes the status record to the control directory.  Failures are
    /// warnings: the dirty counter stays set and the next wake retries.
    pub(crate) fn post_status(&mut self) {
        self.update_flags();
        match status::post(&self.record, &self.status_tmp, &self.status_file) {
            Ok(()) => self.statchange = 0,
            Err(e) => event!(Level::WARN, "could not publish the status file ({e})"),
        }
    }

    /// Reaps every exited child and drives the per-slot state machine:
    /// a start exit runs the reset immediately; a reset exit runs the next
    /// start unless the slot is wanted down.
    pub(crate) fn check_children(&mut self) {
        let mut exited = [false; 2];

        loop {
            let (pid, wstat) = match sys::waitpid_nohang() {
                Ok(Some(reaped)) => reaped,
                Ok(None) => break,
                Err(e) => {
                    event!(Level::WARN, "waitpid failed ({e})");
                    break;
                }
            };

            let which = if pid == self.slot(SlotId::Main).pid {
                SlotId::Main
            } else if pid == self.slot(SlotId::Log).pid {
                SlotId::Log
            } else {
                event!(Level::TRACE, "reaped pid {pid} that is not a supervised child");
                continue;
            };
            exited[which.index()] = true;

            let from = if self.slot(which).isreset { "reset" } else { "start" };
            if libc::WIFEXITED(wstat) {
                event!(
                    Level::DEBUG,
                    "{} service exited from {from} with status {}",
                    which.name(),
                    libc::WEXITSTATUS(wstat)
                );
            } else if libc::WIFSIGNALED(wstat) {
                let signal = libc::WTERMSIG(wstat);
                event!(
                    Level::DEBUG,
                    "{} service exited from {from} on signal {signal} ({})",
                    which.name(),
                    sys::signal_name(signal)
                );
            }

            let slot = self.slot_mut(which);
            slot.pid = 0;
            slot.wstat = wstat;
            slot.ispaused = false;
            if slot.isonce {
                slot.wantdown = true;
            }
            self.pid_change(which);
        }

        for which in [SlotId::Main, SlotId::Log] {
            if which == SlotId::Log && !self.haslog {
                continue;
            }
            let (pid, isreset, wantdown) = {
                let slot = self.slot(which);
                (slot.pid, slot.isreset, slot.wantdown)
            };
            if pid != 0 || !exited[which.index()] {
                continue;
            }
            if !isreset {
                self.exec(which, RunTarget::Reset);
            } else if !wantdown {
                self.exec(which, RunTarget::Start);
            }
        }
    }

    /// Advances the ordered teardown, main service first, and reports
    /// whether both slots are quiescently down.
    pub(crate) fn shut_down(&mut self) -> bool {
        if self.slot(SlotId::Main).pid != 0 {
            if self.slot(SlotId::Main).isreset {
                // Let the reset finish: pin it down and unpause it.
                self.slot_mut(SlotId::Main).wantdown = true;
                self.apply_command(SlotId::Main, b'c');
            } else {
                self.apply_command(SlotId::Main, b'd');
            }
            return false;
        }

        // Main is down; cancel any pending restart.  (A start exit cannot be
        // pending here: check_children runs the reset before we can observe
        // the slot empty.)
        if !self.slot(SlotId::Main).wantdown {
            self.slot_mut(SlotId::Main).wantdown = true;
            self.statchange += 1;
        }

        if !self.haslog {
            return true;
        }

        if self.slot(SlotId::Log).pid != 0 {
            if self.slot(SlotId::Log).isreset {
                self.slot_mut(SlotId::Log).wantdown = true;
                self.apply_command(SlotId::Log, b'c');
            } else {
                // EOF on the logger's stdin before asking it to leave.
                event!(Level::DEBUG, "closing the log pipe to the logging service ...");
                if let Some(logpipe) = self.logpipe.as_mut() {
                    logpipe.write.take();
                }
                self.apply_command(SlotId::Log, b'd');
            }
            return false;
        }

        if !self.slot(SlotId::Log).wantdown {
            self.slot_mut(SlotId::Log).wantdown = true;
            self.statchange += 1;
        }

        true
    }

    /// The event loop: publish status when dirty, wait for a signal wake or
    /// a control request, reap before serving control so a query in the same
    /// wake observes the exit.
    pub fn main_loop(&mut self) {
        loop {
            if self.selfpipe.is_exiting() && self.shut_down() {
                break;
            }

            if self.statchange != 0 {
                self.post_status();
            }

            let mut pfd = [
                libc::pollfd { fd: self.selfpipe.fd(), events: libc::POLLIN, revents: 0 },
                libc::pollfd { fd: self.fifo_in.as_raw_fd(), events: libc::POLLIN, revents: 0 },
            ];
            if let Err(e) = sys::poll(&mut pfd) {
                event!(Level::WARN, "poll failed in the event loop ({e})");
                continue;
            }

            if pfd[0].revents & libc::POLLIN != 0 {
                self.selfpipe.drain();
                self.check_children();
            }

            if pfd[1].revents & libc::POLLIN != 0 {
                self.check_control();
            }
        }
    }
}
