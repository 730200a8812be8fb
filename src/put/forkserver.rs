//! The fork-server side of the AFL protocol.
//!
//! The instrumented target is spawned once; its runtime keeps a control pipe
//! on FD 198 and a status pipe on FD 199 and forks one child per request.
//! See AFL's `llvm_mode/afl-llvm-rt.o.c` for the wire contract.

use std::{
    ffi::OsString,
    io::{self, prelude::*, ErrorKind},
    os::{fd::{AsRawFd, BorrowedFd}, unix::process::CommandExt},
    path::Path,
    process::{Child, Command, Stdio},
    time::Duration,
};

use nix::{
    libc,
    sys::{
        select::{pselect, FdSet},
        signal::{kill, SigSet, Signal},
        time::TimeSpec,
        wait::waitpid,
    },
    unistd::Pid,
};

use crate::{bolts::pipes::Pipe, Error};

/// The control FD the AFL runtime expects; status is `FORKSRV_FD + 1`.
const FORKSRV_FD: i32 = 198;

/// How long the initial handshake may take.
const HANDSHAKE_TIMEOUT: Duration = Duration::from_secs(1);

/// The default signal used to kill child processes.
const KILL_SIGNAL_DEFAULT: Signal = Signal::SIGKILL;

/// Target process setup run between `fork` and `exec`.
trait ConfigTarget {
    /// Detach from our process group so a kill of the session does not take
    /// the fuzzer down with it.
    fn setsid(&mut self) -> &mut Self;
    /// Bind `fd` to the child's stdin.
    fn setstdin(&mut self, fd: i32, use_stdin: bool) -> &mut Self;
    /// Install the fork-server pipes on the fixed descriptors.
    fn setpipe(&mut self, st_read: i32, st_write: i32, ctl_read: i32, ctl_write: i32)
        -> &mut Self;
}

impl ConfigTarget for Command {
    fn setsid(&mut self) -> &mut Self {
        let func = move || {
            unsafe {
                libc::setsid();
            };
            Ok(())
        };
        unsafe { self.pre_exec(func) }
    }

    fn setstdin(&mut self, fd: i32, use_stdin: bool) -> &mut Self {
        if !use_stdin {
            return self;
        }
        let func = move || {
            if unsafe { libc::dup2(fd, libc::STDIN_FILENO) } < 0 {
                return Err(io::Error::last_os_error());
            }
            Ok(())
        };
        unsafe { self.pre_exec(func) }
    }

    fn setpipe(
        &mut self,
        st_read: i32,
        st_write: i32,
        ctl_read: i32,
        ctl_write: i32,
    ) -> &mut Self {
        let func = move || {
            if unsafe { libc::dup2(ctl_read, FORKSRV_FD) } < 0 {
                return Err(io::Error::last_os_error());
            }
            if unsafe { libc::dup2(st_write, FORKSRV_FD + 1) } < 0 {
                return Err(io::Error::last_os_error());
            }
            unsafe {
                libc::close(st_read);
                libc::close(st_write);
                libc::close(ctl_read);
                libc::close(ctl_write);
            }
            Ok(())
        };
        unsafe { self.pre_exec(func) }
    }
}

/// A running fork server plus the parent ends of its pipes.
#[derive(Debug)]
pub struct Forkserver {
    handle: Child,
    st_pipe: Pipe,
    ctl_pipe: Pipe,
    child_pid: Option<Pid>,
    kill_signal: Signal,
}

impl Forkserver {
    /// Spawn the target and complete the startup handshake.
    ///
    /// `stdin_fd` carries the test-case file for stdin-input targets;
    /// file-argument targets read /dev/null instead.
    pub fn start(
        target: &Path,
        args: &[OsString],
        envs: &[(OsString, OsString)],
        stdin_fd: Option<i32>,
        debug_child: bool,
    ) -> Result<Self, Error> {
        let mut st_pipe = Pipe::new()?;
        let mut ctl_pipe = Pipe::new()?;

        let (stdout, stderr) = if debug_child {
            (Stdio::inherit(), Stdio::inherit())
        } else {
            (Stdio::null(), Stdio::null())
        };

        let mut command = Command::new(target);
        command
            .args(args)
            .stdin(Stdio::null())
            .stdout(stdout)
            .stderr(stderr)
            .env("LD_BIND_NOW", "1");
        for (key, val) in envs {
            command.env(key, val);
        }

        let handle = command
            .setsid()
            .setstdin(stdin_fd.unwrap_or(-1), stdin_fd.is_some())
            .setpipe(
                st_pipe.read_end().unwrap(),
                st_pipe.write_end().unwrap(),
                ctl_pipe.read_end().unwrap(),
                ctl_pipe.write_end().unwrap(),
            )
            .spawn()
            .map_err(|err| {
                Error::illegal_state(format!("could not spawn the fork server: {err}"))
            })?;

        // The child duplicated what it needs; drop our copies of its ends
        // and hide the remaining ones from everything we exec later.
        ctl_pipe.close_read_end();
        st_pipe.close_write_end();
        ctl_pipe.set_cloexec()?;
        st_pipe.set_cloexec()?;

        let mut forkserver = Self {
            handle,
            st_pipe,
            ctl_pipe,
            child_pid: None,
            kill_signal: KILL_SIGNAL_DEFAULT,
        };

        // First status read doubles as the handshake.
        match forkserver.read_status_timed(&TimeSpec::from_duration(HANDSHAKE_TIMEOUT))? {
            Some(status) if libc::WIFSIGNALED(status) => {
                return Err(Error::illegal_state(format!(
                    "fork server died during startup (signal {})",
                    libc::WTERMSIG(status)
                )));
            }
            Some(_) => log::info!("All right - fork server is up."),
            None => {
                return Err(Error::timeout(format!(
                    "fork server (pid={}) hung during the startup handshake",
                    forkserver.handle.id()
                )));
            }
        }

        Ok(forkserver)
    }

    /// Pid of the child currently executing a test case, if any.
    #[must_use]
    pub fn child_pid(&self) -> Option<Pid> {
        self.child_pid
    }

    pub fn set_child_pid(&mut self, pid: Pid) {
        self.child_pid = Some(pid);
    }

    pub fn reset_child_pid(&mut self) {
        self.child_pid = None;
    }

    /// Kill the currently running child, if any. The fork server survives.
    pub fn kill_child(&mut self) {
        if let Some(pid) = self.child_pid {
            if let Err(err) = kill(pid, self.kill_signal) {
                log::warn!("could not kill child (pid={pid}): {err}");
            }
        }
    }

    /// Blocking 4-byte read from the status pipe.
    pub fn read_status(&mut self) -> Result<i32, Error> {
        let mut buf = [0u8; 4];
        self.st_pipe.read_exact(&mut buf).map_err(Error::put_io)?;
        Ok(i32::from_le_bytes(buf))
    }

    /// 4-byte read from the status pipe, bounded by `timeout`.
    /// `Ok(None)` means the timeout expired.
    pub fn read_status_timed(&mut self, timeout: &TimeSpec) -> Result<Option<i32>, Error> {
        let Some(st_read) = self.st_pipe.read_end() else {
            return Err(Error::put_io(io::Error::new(
                ErrorKind::BrokenPipe,
                "status pipe read end was already closed",
            )));
        };
        // Validity: the pipe outlives this call and is not closed below.
        let st_read = unsafe { BorrowedFd::borrow_raw(st_read) };

        let mut readfds = FdSet::new();
        readfds.insert(&st_read);
        let sret = pselect(
            Some(readfds.highest().unwrap().as_raw_fd() + 1),
            &mut readfds,
            None,
            None,
            Some(timeout),
            Some(&SigSet::empty()),
        )?;
        if sret == 0 {
            return Ok(None);
        }

        let mut buf = [0u8; 4];
        self.st_pipe.read_exact(&mut buf).map_err(Error::put_io)?;
        Ok(Some(i32::from_le_bytes(buf)))
    }

    /// Write the 4-byte "go" message on the control pipe.
    pub fn write_ctl(&mut self, val: i32) -> Result<(), Error> {
        self.ctl_pipe
            .write_all(&val.to_le_bytes())
            .map_err(Error::put_io)
    }
}

impl Drop for Forkserver {
    fn drop(&mut self) {
        log::debug!("Dropping fork server");

        // The fork server may have spawned helpers of its own; take the
        // whole tree down before the server itself.
        kill_descendants(self.handle.id() as i32);

        self.kill_child();

        let server_pid = Pid::from_raw(self.handle.id() as i32);
        if let Err(err) = kill(server_pid, self.kill_signal) {
            log::warn!("could not deliver kill signal to fork server {server_pid}: {err}");
        } else if let Err(err) = waitpid(server_pid, None) {
            log::warn!("waitpid on fork server {server_pid} failed: {err}");
        }
    }
}

/// Recursively kill every descendant of `pid`, leaves first.
fn kill_descendants(pid: i32) {
    for child in list_children(pid) {
        kill_descendants(child);
        // Failures are expected, the process may already be gone.
        let _ = kill(Pid::from_raw(child), Signal::SIGKILL);
    }
}

fn list_children(pid: i32) -> Vec<i32> {
    let path = format!("/proc/{pid}/task/{pid}/children");
    match std::fs::read_to_string(path) {
        Ok(content) => content
            .split_whitespace()
            .filter_map(|p| p.parse().ok())
            .collect(),
        Err(_) => Vec::new(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn list_children_of_leaf_process_is_empty() {
        // Our own children file exists and is empty unless a test spawned
        // something concurrently; a bogus pid yields an empty list too.
        assert!(list_children(-1).is_empty());
    }
}
