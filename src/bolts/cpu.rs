//! CPU reservation for worker threads.
//!
//! Each worker wants a logical CPU of its own, and ideally one that no other
//! fuzzer instance on the machine already claimed. A process that narrowed
//! its affinity mask below the full machine is treated as having claimed its
//! CPUs; kernel tasks (no `VmSize` in their status) are ignored.

use std::{
    collections::HashSet,
    fs,
    sync::Mutex,
};

use nix::{
    sched::{sched_getaffinity, sched_setaffinity, CpuSet},
    unistd::Pid,
};

use crate::Error;

/// Number of logical CPUs on this machine.
#[must_use]
pub fn num_cpus() -> usize {
    let n = unsafe { libc::sysconf(libc::_SC_NPROCESSORS_ONLN) };
    if n < 1 {
        1
    } else {
        n as usize
    }
}

/// Pin the calling thread to one logical CPU.
pub fn pin_current_thread(cpu: usize) -> Result<(), Error> {
    let mut set = CpuSet::new();
    set.set(cpu)?;
    sched_setaffinity(Pid::from_raw(0), &set)?;
    Ok(())
}

/// Process-wide CPU accounting, shared by all workers.
#[derive(Debug)]
pub struct CpuPool {
    exclude_hyperthread: bool,
    taken: Mutex<HashSet<usize>>,
}

impl CpuPool {
    #[must_use]
    pub fn new(exclude_hyperthread: bool) -> Self {
        Self {
            exclude_hyperthread,
            taken: Mutex::new(HashSet::new()),
        }
    }

    /// Reserve a CPU that neither this process nor (as far as `/proc` tells)
    /// any other pinned process is using.
    pub fn reserve(&self) -> Result<usize, Error> {
        let mut taken = self.taken.lock().unwrap();
        let busy = busy_cpus();
        let n = num_cpus();
        for cpu in 0..n {
            if self.exclude_hyperthread && cpu % 2 == 1 {
                continue;
            }
            if busy.contains(&cpu) || taken.contains(&cpu) {
                continue;
            }
            taken.insert(cpu);
            return Ok(cpu);
        }
        Err(Error::illegal_state("no CPU available"))
    }

    pub fn release(&self, cpu: usize) {
        self.taken.lock().unwrap().remove(&cpu);
    }
}

/// CPUs appearing in the (narrowed) affinity mask of some userspace process.
fn busy_cpus() -> HashSet<usize> {
    let mut busy = HashSet::new();
    let n = num_cpus();

    let entries = match fs::read_dir("/proc") {
        Ok(entries) => entries,
        Err(err) => {
            log::warn!("could not read /proc: {err}");
            return busy;
        }
    };

    for entry in entries.flatten() {
        let name = entry.file_name();
        let Some(pid) = name.to_str().and_then(|s| s.parse::<i32>().ok()) else {
            continue;
        };

        let Ok(set) = sched_getaffinity(Pid::from_raw(pid)) else {
            continue;
        };
        let count = (0..n).filter(|&c| set.is_set(c).unwrap_or(false)).count();
        if count == n {
            // Unrestricted mask, not a claim.
            continue;
        }

        // Kernel threads have no VmSize; they pin themselves all the time.
        let Ok(status) = fs::read_to_string(format!("/proc/{pid}/status")) else {
            continue;
        };
        if !status.contains("VmSize") {
            continue;
        }

        for cpu in 0..n {
            if set.is_set(cpu).unwrap_or(false) {
                busy.insert(cpu);
            }
        }
    }

    busy
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn reservations_are_exclusive() {
        let pool = CpuPool::new(false);
        let first = match pool.reserve() {
            Ok(cpu) => cpu,
            // A busy CI box may legitimately have nothing free.
            Err(_) => return,
        };
        if let Ok(second) = pool.reserve() {
            assert_ne!(first, second);
            pool.release(second);
        }
        pool.release(first);
        // After release the same CPU can be handed out again.
        assert_eq!(pool.reserve().unwrap(), first);
    }
}
