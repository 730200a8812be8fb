//! The program-under-test runner: one fork server, one shared trace map,
//! one execution per [`AflPut::run`] call.

pub mod forkserver;
pub mod input;
pub mod probe;

use std::{path::Path, time::Duration};

use nix::{libc, sys::time::TimeSpec};

use crate::{
    bolts::shmem::SysvShMem,
    trace::{hash_trace, MAP_SIZE},
    Error,
};

use forkserver::Forkserver;
use input::TestcaseSink;
use probe::MSAN_ERROR_CODE;

/// After killing a hung child, how long we wait for the fork server to
/// report the (now signal-terminated) wait status.
const POST_KILL_GRACE: Duration = Duration::from_secs(2);

/// Decoded outcome of one execution.
#[derive(Debug, Clone, Copy, Default)]
pub struct RunStatus {
    /// Raw wait status as reported by the fork server.
    pub status: i32,
    /// Terminating signal, when the child was signaled.
    pub signal: i32,
    pub crashed: bool,
    pub hanged: bool,
}

/// One execution result with an owned trace, as shipped across channels.
#[derive(Debug, Clone, Default)]
pub struct RunRecord {
    pub input: Vec<u8>,
    pub status: RunStatus,
    /// Owned copy of the post-run trace map. Only populated for runs some
    /// fitness judged interesting; empty otherwise.
    pub trace: Vec<u8>,
    pub hash: u64,
}

impl RunRecord {
    /// Wrap an initial seed input that has not been executed yet.
    #[must_use]
    pub fn from_input(input: Vec<u8>) -> Self {
        RunRecord {
            input,
            ..RunRecord::default()
        }
    }

    /// Borrow as the view fitness functions consume.
    #[must_use]
    pub fn view(&self) -> RunView<'_> {
        RunView {
            input: &self.input,
            status: self.status,
            trace: &self.trace,
            hash: self.hash,
        }
    }
}

/// A run result whose trace still lives in the shared map. Valid only until
/// the next execution on the same runner; fitness functions must copy what
/// they keep.
#[derive(Debug, Clone, Copy)]
pub struct RunView<'a> {
    pub input: &'a [u8],
    pub status: RunStatus,
    pub trace: &'a [u8],
    pub hash: u64,
}

impl RunView<'_> {
    /// Promote to an owned record, copying the trace.
    #[must_use]
    pub fn to_record(&self) -> RunRecord {
        RunRecord {
            input: self.input.to_vec(),
            status: self.status,
            trace: self.trace.to_vec(),
            hash: self.hash,
        }
    }
}

/// One instance of the target in fork-server mode.
///
/// Field order is drop order: the fork server dies before its trace map and
/// test-case file disappear.
#[derive(Debug)]
pub struct AflPut {
    forkserver: Forkserver,
    shmem: SysvShMem,
    sink: TestcaseSink,
    timeout: Duration,
    uses_msan: bool,
}

impl AflPut {
    /// Probe the binary, allocate the trace map, rewrite the command line
    /// and bring up the fork server.
    pub fn start(
        bin_path: &Path,
        args: &[String],
        timeout: Duration,
        workdir: &Path,
        debug_child: bool,
    ) -> Result<Self, Error> {
        let probe = probe::probe_binary(bin_path)?;

        let shmem = SysvShMem::new(MAP_SIZE)?;
        let envs = probe::put_environment(&probe, shmem.id())?;

        let (args, sink) = input::prepare_cmdline(args, workdir)?;

        let forkserver =
            Forkserver::start(bin_path, &args, &envs, sink.stdin_fd(), debug_child)?;

        Ok(Self {
            forkserver,
            shmem,
            sink,
            timeout,
            uses_msan: probe.uses_msan,
        })
    }

    /// The shared trace map, as filled by the most recent run.
    #[must_use]
    pub fn trace(&self) -> &[u8] {
        self.shmem.as_slice()
    }

    /// Execute one test case through the fork server.
    ///
    /// Pipe failures abort the run with a transient error; a timeout kills
    /// the child (never the fork server) and reports `hanged`.
    pub fn run(&mut self, testcase: &[u8]) -> Result<RunStatus, Error> {
        self.shmem.zero();
        self.sink.write(testcase)?;

        self.forkserver.write_ctl(0)?;

        let pid = self.forkserver.read_status()?;
        if pid <= 0 {
            return Err(Error::put_io(std::io::Error::new(
                std::io::ErrorKind::InvalidData,
                format!("fork server reported nonsense child pid {pid}"),
            )));
        }
        self.forkserver.set_child_pid(nix::unistd::Pid::from_raw(pid));

        let mut run = RunStatus::default();
        let status = match self
            .forkserver
            .read_status_timed(&TimeSpec::from_duration(self.timeout))?
        {
            Some(status) => status,
            None => {
                run.hanged = true;
                self.forkserver.kill_child();
                // The fork server still reports the killed child's status;
                // consume it so the pipe stays in sync for the next run.
                match self
                    .forkserver
                    .read_status_timed(&TimeSpec::from_duration(POST_KILL_GRACE))?
                {
                    Some(status) => status,
                    None => {
                        return Err(Error::timeout(
                            "fork server unresponsive after killing a hung child",
                        ))
                    }
                }
            }
        };

        self.forkserver.reset_child_pid();

        run.status = status;
        if libc::WIFSIGNALED(status) {
            if !run.hanged {
                run.crashed = true;
            }
            run.signal = libc::WTERMSIG(status);
        } else if self.uses_msan
            && libc::WIFEXITED(status)
            && libc::WEXITSTATUS(status) == MSAN_ERROR_CODE
        {
            run.crashed = true;
        }

        Ok(run)
    }

    /// Hash of the current trace map content.
    #[must_use]
    pub fn trace_hash(&self) -> u64 {
        hash_trace(self.trace())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn record_view_round_trip() {
        let mut record = RunRecord::from_input(vec![1, 2, 3]);
        record.trace = vec![0u8; 16];
        record.trace[3] = 9;
        record.hash = 77;
        let view = record.view();
        assert_eq!(view.input, &[1, 2, 3]);
        assert_eq!(view.trace[3], 9);
        let owned = view.to_record();
        assert_eq!(owned.hash, 77);
        assert_eq!(owned.trace, record.trace);
    }
}
