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

use anyhow::{anyhow, Context, Result};
use std::fs::{self, File, OpenOptions};
use std::os::raw::c_int;
use std::os::unix::prelude::*;
use std::path::PathBuf;
use std::process::{Child, Command, ExitStatus};
use std::sync::Mutex;
use std::time::Duration;

use supervise::packet::{Packet, TYPE_COMMAND, TYPE_ERROR, TYPE_QUERY, TYPE_STATUS};
use supervise::status::{SlotFlags, SuperFlags, STATUS_SIZE};

enum Completion<T> {
    Incomplete,
    Complete(T)
}
use Completion::*;

/// Repeatedly evaluates `condition`, sleeping a bit between calls, until it yields
/// Complete(value), then returns Ok(value).  After a while, however, give up and return an error
/// instead.
fn wait_until<T, F>(mut condition: F) -> Result<T>
    where F: FnMut() -> Completion<T>
{
    for i in 0..60 {
        if let Complete(result) = condition() {
            return Ok(result)
        }
        let ms = match i {
            0 => 10,
            1 => 100,
            _ => 250,
        };
        std::thread::sleep(Duration::from_millis(ms));
    }
    Err(anyhow!("wait_until timed out"))
}

fn send_signal(pid: libc::pid_t, signal: c_int) -> Result<(), std::io::Error> {
    if unsafe { libc::kill(pid, signal) } < 0 {
        Err(std::io::Error::last_os_error())?
    } else {
        Ok(())
    }
}

fn process_exists(pid: libc::pid_t) -> Result<(), std::io::Error> {
    send_signal(pid, 0)
}

fn wait_for_process_to_die(pid: libc::pid_t) -> Result<()> {
    wait_until(|| match process_exists(pid) {
        Ok(()) => Incomplete,
        Err(_) => Complete(())
    })
}

/// Waits for `child` to die, and returns:
///    - `Ok(Ok(status))`: Child exited with `status`.
///    - `Ok(Err(e))`: System reported error waiting for `child` (e.g. we already waited for it).
///    - `Err(e)`: Timeout.
fn wait_for_child_to_die(child: &mut Child) -> Result<Result<ExitStatus>> {
    match wait_until(|| match child.try_wait() {
        Ok(Some(status)) => Complete(Ok(status)),
        Ok(None) => Incomplete,
        Err(e) => Complete(Err(e)),
    }) {
        Ok(Ok(result)) => Ok(Ok(result)),
        Ok(Err(error)) => Ok(Err(error.into())),
        Err(error) => Err(error),
    }
}

/// A scratch base directory holding one service directory, in the layout the
/// supervisor expects: the supervisor runs with the base as its working
/// directory, `svc/` inside it is the service, and `.control/` appears as a
/// sibling of `svc/`.
struct TestDir {
    base: PathBuf,
}

impl TestDir {
    fn new() -> Result<TestDir> {
        static COUNTER: Mutex<usize> = Mutex::new(0);
        let count = match *COUNTER.lock().unwrap() {
            ref mut counter => { *counter += 1; *counter }
        };
        let base = std::env::temp_dir()
            .join(format!("supervise-test{}.{count}", std::process::id()));
        fs::create_dir_all(base.join("svc"))?;
        Ok(TestDir { base })
    }

    fn svdir(&self) -> PathBuf {
        self.base.join("svc")
    }

    /// Installs an executable run script in the service directory.
    fn write_script(&self, name: &str, body: &str) -> Result<()> {
        let path = self.svdir().join(name);
        fs::write(&path, format!("#!/bin/sh\n{body}"))?;
        fs::set_permissions(&path, fs::Permissions::from_mode(0o755))?;
        Ok(())
    }

    fn control_dir(&self) -> Result<PathBuf> {
        let metadata = fs::metadata(self.svdir())?;
        Ok(self.base.join(".control")
            .join(format!("sv.{:x}.{:x}", metadata.dev(), metadata.ino())))
    }

    fn status_path(&self) -> Result<PathBuf> {
        Ok(self.control_dir()?.join("status"))
    }

    fn read_status(&self) -> Result<Vec<u8>> {
        let bytes = fs::read(self.status_path()?)?;
        assert_eq!(bytes.len(), STATUS_SIZE);
        Ok(bytes)
    }
}

/// A running supervisor.  Dropping it terminates the supervisor (and with it
/// the supervised children) so a failing test does not leak processes.
struct Running {
    child: Child,
}

impl Running {
    fn spawn(dir: &TestDir, args: &[&str]) -> Result<Running> {
        let child = Command::new(env!("CARGO_BIN_EXE_supervise"))
            .args(args)
            .arg("svc")
            .current_dir(&dir.base)
            .spawn()?;
        Ok(Running { child })
    }

    fn pid(&self) -> libc::pid_t {
        self.child.id() as libc::pid_t
    }

    /// Opens the control FIFO pair.  The supervisor holds both ends open
    /// read/write, so neither open blocks.
    fn control(&self, dir: &TestDir) -> Result<ControlClient> {
        let ctl = dir.control_dir()?;
        let input = OpenOptions::new().write(true).open(ctl.join("ctl.in"))
            .context("opening ctl.in")?;
        let output = OpenOptions::new().read(true).open(ctl.join("ctl.out"))
            .context("opening ctl.out")?;
        Ok(ControlClient { input, output })
    }
}

impl Drop for Running {
    fn drop(&mut self) {
        if matches!(self.child.try_wait(), Ok(None)) {
            let _ = send_signal(self.pid(), libc::SIGTERM);
            let _ = wait_for_child_to_die(&mut self.child);
        }
    }
}

struct ControlClient {
    input: File,
    output: File,
}

impl ControlClient {
    fn send(&mut self, packet: &Packet) -> Result<Packet> {
        packet.write_to(&self.input)?;
        self.read_reply()
    }

    /// Sends one command byte and returns the `E` reply's error code.
    fn command(&mut self, command: u8) -> Result<u32> {
        let reply = self.send(&Packet::new(TYPE_COMMAND, vec![command]))?;
        assert_eq!(reply.typ, TYPE_ERROR);
        assert_eq!(reply.payload.len(), 4);
        Ok(u32::from_be_bytes(reply.payload[..4].try_into().unwrap()))
    }

    fn query(&mut self) -> Result<Vec<u8>> {
        let reply = self.send(&Packet::new(TYPE_QUERY, vec![]))?;
        assert_eq!(reply.typ, TYPE_STATUS);
        Ok(reply.payload)
    }

    fn read_reply(&mut self) -> Result<Packet> {
        let mut pfd = libc::pollfd {
            fd: self.output.as_raw_fd(),
            events: libc::POLLIN,
            revents: 0,
        };
        if unsafe { libc::poll(&mut pfd, 1, 10_000) } <= 0 {
            return Err(anyhow!("timed out waiting for a reply packet"));
        }
        Ok(Packet::read_from(&self.output)?)
    }
}

fn be_u32(bytes: &[u8], offset: usize) -> u32 {
    u32::from_be_bytes(bytes[offset..offset + 4].try_into().unwrap())
}

fn main_pid(status: &[u8]) -> u32 {
    be_u32(status, 18)
}

fn log_pid(status: &[u8]) -> u32 {
    be_u32(status, 36)
}

fn super_flags(status: &[u8]) -> SuperFlags {
    SuperFlags::from_bits_truncate(status[16])
}

fn main_flags(status: &[u8]) -> SlotFlags {
    SlotFlags::from_bits_truncate(status[34])
}

fn log_flags(status: &[u8]) -> SlotFlags {
    SlotFlags::from_bits_truncate(status[52])
}

/// Waits until the published status satisfies `condition` and returns it.
fn wait_for_status<F>(dir: &TestDir, mut condition: F) -> Result<Vec<u8>>
    where F: FnMut(&[u8]) -> bool
{
    wait_until(|| match dir.read_status() {
        Ok(status) if condition(&status) => Complete(status),
        _ => Incomplete
    })
}

#[cfg(target_os = "linux")]
fn process_state(pid: u32) -> Result<char> {
    // The state is the third field of /proc/<pid>/stat, right after the
    // parenthesized command name (which may itself contain spaces).
    let stat = fs::read_to_string(format!("/proc/{pid}/stat"))?;
    stat.rsplit(')')
        .next()
        .and_then(|rest| rest.split_whitespace().next())
        .and_then(|field| field.chars().next())
        .ok_or_else(|| anyhow!("unparseable /proc/{pid}/stat"))
}

const SLEEP_SCRIPT: &str = "case \"$1\" in\n\
                            start) exec sleep 600 ;;\n\
                            *) exit 0 ;;\n\
                            esac\n";

#[test]
fn cold_boot_without_log() -> Result<()> {
    let dir = TestDir::new()?;
    dir.write_script("rc.main", SLEEP_SCRIPT)?;
    let supervisor = Running::spawn(&dir, &[])?;

    let status = wait_for_status(&dir, |status| main_pid(status) != 0)?;
    assert!(main_flags(&status).contains(SlotFlags::UP));
    assert!(!super_flags(&status).contains(SuperFlags::HASLOG));
    assert_eq!(log_pid(&status), 0);
    assert_eq!(be_u32(&status, 0), supervisor.pid() as u32);
    Ok(())
}

#[test]
fn status_query_is_a_pure_observation() -> Result<()> {
    let dir = TestDir::new()?;
    dir.write_script("rc.main", SLEEP_SCRIPT)?;
    let supervisor = Running::spawn(&dir, &[])?;
    wait_for_status(&dir, |status| main_pid(status) != 0)?;

    let mut control = supervisor.control(&dir)?;
    let first = control.query()?;
    let second = control.query()?;
    assert_eq!(first.len(), STATUS_SIZE);
    assert_eq!(first, second);
    assert_ne!(main_pid(&first), 0);
    Ok(())
}

#[test]
fn protocol_errors_get_eproto_replies() -> Result<()> {
    let dir = TestDir::new()?;
    dir.write_script("rc.main", SLEEP_SCRIPT)?;
    let supervisor = Running::spawn(&dir, &[])?;
    wait_for_status(&dir, |status| main_pid(status) != 0)?;
    let mut control = supervisor.control(&dir)?;

    // Wrong protocol version.
    let mut bad_version = Packet::new(TYPE_QUERY, vec![]);
    bad_version.version = 2;
    let reply = control.send(&bad_version)?;
    assert_eq!(reply.typ, TYPE_ERROR);
    assert_eq!(be_u32(&reply.payload, 0), libc::EPROTO as u32);

    // Unknown packet type.
    let reply = control.send(&Packet::new(b'B', vec![]))?;
    assert_eq!(be_u32(&reply.payload, 0), libc::EPROTO as u32);

    // A command packet must carry exactly one byte.
    let reply = control.send(&Packet::new(TYPE_COMMAND, vec![b'u', b'u']))?;
    assert_eq!(be_u32(&reply.payload, 0), libc::EPROTO as u32);

    // Unknown command byte.
    assert_eq!(control.command(b'z')?, libc::EPROTO as u32);

    // None of that perturbed the supervised state.
    let status = dir.read_status()?;
    assert_ne!(main_pid(&status), 0);
    Ok(())
}

#[test]
fn once_mode_runs_reset_and_stays_down() -> Result<()> {
    let dir = TestDir::new()?;
    dir.write_script(
        "rc.main",
        "if [ \"$1\" = reset ]; then echo \"$@\" >> reset.log; fi\nexit 0\n",
    )?;
    let _supervisor = Running::spawn(&dir, &["-o"])?;

    let status = wait_for_status(&dir, |status| {
        let flags = main_flags(status);
        main_pid(status) == 0
            && flags.contains(SlotFlags::ONCE)
            && !flags.contains(SlotFlags::WANT)
    })?;
    assert!(!main_flags(&status).contains(SlotFlags::UP));

    // The reset was told how the start went.
    let reset_log = wait_until(|| match fs::read_to_string(dir.svdir().join("reset.log")) {
        Ok(contents) if !contents.is_empty() => Complete(contents),
        _ => Incomplete
    })?;
    assert_eq!(reset_log.lines().next(), Some("reset svc exit 0"));
    Ok(())
}

#[test]
fn pause_and_continue() -> Result<()> {
    let dir = TestDir::new()?;
    dir.write_script("rc.main", SLEEP_SCRIPT)?;
    let supervisor = Running::spawn(&dir, &[])?;
    let status = wait_for_status(&dir, |status| main_pid(status) != 0)?;
    let child_pid = main_pid(&status);
    let mut control = supervisor.control(&dir)?;

    assert_eq!(control.command(b'p')?, 0);
    let status = wait_for_status(&dir, |status| {
        main_flags(status).contains(SlotFlags::PAUSE)
    })?;
    assert_eq!(main_pid(&status), child_pid);
    #[cfg(target_os = "linux")]
    wait_until(|| match process_state(child_pid) {
        Ok('T') => Complete(()),
        _ => Incomplete
    })?;

    assert_eq!(control.command(b'c')?, 0);
    wait_for_status(&dir, |status| !main_flags(status).contains(SlotFlags::PAUSE))?;
    #[cfg(target_os = "linux")]
    wait_until(|| match process_state(child_pid) {
        Ok('S') | Ok('R') => Complete(()),
        _ => Incomplete
    })?;
    Ok(())
}

#[test]
fn down_then_up() -> Result<()> {
    let dir = TestDir::new()?;
    dir.write_script("rc.main", SLEEP_SCRIPT)?;
    let supervisor = Running::spawn(&dir, &[])?;
    let status = wait_for_status(&dir, |status| main_pid(status) != 0)?;
    let first_pid = main_pid(&status);
    let mut control = supervisor.control(&dir)?;

    assert_eq!(control.command(b'd')?, 0);
    let status = wait_for_status(&dir, |status| {
        main_pid(status) == 0 && !main_flags(status).contains(SlotFlags::WANT)
    })?;
    assert!(!main_flags(&status).contains(SlotFlags::UP));

    assert_eq!(control.command(b'u')?, 0);
    let status = wait_for_status(&dir, |status| main_pid(status) != 0)?;
    assert_ne!(main_pid(&status), first_pid);
    assert!(main_flags(&status).contains(SlotFlags::UP));
    Ok(())
}

#[test]
fn exit_command_tears_everything_down() -> Result<()> {
    let dir = TestDir::new()?;
    dir.write_script("rc.main", SLEEP_SCRIPT)?;
    let mut supervisor = Running::spawn(&dir, &[])?;
    let status = wait_for_status(&dir, |status| main_pid(status) != 0)?;
    let child_pid = main_pid(&status) as libc::pid_t;

    let mut control = supervisor.control(&dir)?;
    assert_eq!(control.command(b'X')?, 0);

    let status = wait_for_child_to_die(&mut supervisor.child)??;
    assert!(status.success());
    wait_for_process_to_die(child_pid)?;
    Ok(())
}

#[test]
fn respawn_governor_spaces_starts() -> Result<()> {
    let dir = TestDir::new()?;
    // Each start stamps its own exec time in nanoseconds.
    dir.write_script(
        "rc.main",
        "if [ \"$1\" = start ]; then date +%s%N >> starts.log; fi\nexit 0\n",
    )?;
    let _supervisor = Running::spawn(&dir, &[])?;

    let starts = wait_until(|| {
        match fs::read_to_string(dir.svdir().join("starts.log")) {
            Ok(contents) if contents.lines().count() >= 3 => Complete(contents),
            _ => Incomplete
        }
    })?;
    let times: Vec<u128> = starts.lines().map(|line| line.trim().parse().unwrap()).collect();
    for pair in times.windows(2) {
        let elapsed = Duration::from_nanos((pair[1] - pair[0]) as u64);
        // The governor promises one second; leave a little room for the skew
        // between the wall clock the script reads and the supervisor's
        // monotonic clock.
        assert!(elapsed >= Duration::from_millis(900),
                "starts only {elapsed:?} apart");
    }
    Ok(())
}

#[test]
fn pidlock_is_exclusive() -> Result<()> {
    let dir = TestDir::new()?;
    dir.write_script("rc.main", SLEEP_SCRIPT)?;
    let _supervisor = Running::spawn(&dir, &[])?;
    wait_for_status(&dir, |status| main_pid(status) != 0)?;

    let mut second = Command::new(env!("CARGO_BIN_EXE_supervise"))
        .arg("svc")
        .current_dir(&dir.base)
        .spawn()?;
    let status = wait_for_child_to_die(&mut second)??;
    assert_eq!(status.code(), Some(100));
    Ok(())
}

#[test]
fn log_service_receives_main_stdout() -> Result<()> {
    let dir = TestDir::new()?;
    dir.write_script(
        "rc.main",
        "case \"$1\" in\nstart) echo hello; exec sleep 600 ;;\n*) exit 0 ;;\nesac\n",
    )?;
    dir.write_script(
        "rc.log",
        "case \"$1\" in\nstart) exec cat > log.out ;;\n*) exit 0 ;;\nesac\n",
    )?;
    let mut supervisor = Running::spawn(&dir, &[])?;

    let status = wait_for_status(&dir, |status| {
        main_pid(status) != 0 && log_pid(status) != 0
    })?;
    assert!(super_flags(&status).contains(SuperFlags::HASLOG));
    assert!(log_flags(&status).contains(SlotFlags::UP));

    // Main's stdout flows through the pipe into the logger.
    wait_until(|| match fs::read_to_string(dir.svdir().join("log.out")) {
        Ok(contents) if contents.contains("hello") => Complete(()),
        _ => Incomplete
    })?;

    // Shutdown closes the pipe so the logger sees EOF and exits too.
    let logger_pid = log_pid(&status) as libc::pid_t;
    send_signal(supervisor.pid(), libc::SIGTERM)?;
    let status = wait_for_child_to_die(&mut supervisor.child)??;
    assert!(status.success());
    wait_for_process_to_die(logger_pid)?;
    Ok(())
}

#[test]
fn high_command_bytes_route_to_the_log_slot() -> Result<()> {
    let dir = TestDir::new()?;
    dir.write_script("rc.main", SLEEP_SCRIPT)?;
    dir.write_script("rc.log", SLEEP_SCRIPT)?;
    let mut supervisor = Running::spawn(&dir, &[])?;
    let status = wait_for_status(&dir, |status| {
        main_pid(status) != 0 && log_pid(status) != 0
    })?;
    let main_before = main_pid(&status);
    let mut control = supervisor.control(&dir)?;

    // 'd' shifted into the log range brings down only the logger.
    assert_eq!(control.command(b'd' + 0x7f)?, 0);
    let status = wait_for_status(&dir, |status| {
        log_pid(status) == 0 && !log_flags(status).contains(SlotFlags::WANT)
    })?;
    assert_eq!(main_pid(&status), main_before);

    // Meta-commands addressed to the log slot are ignored but succeed.
    assert_eq!(control.command(b'X' + 0x7f)?, 0);
    std::thread::sleep(Duration::from_millis(200));
    assert!(matches!(supervisor.child.try_wait(), Ok(None)));

    // 'u' shifted brings the logger back.
    assert_eq!(control.command(b'u' + 0x7f)?, 0);
    wait_for_status(&dir, |status| log_pid(status) != 0)?;
    Ok(())
}
