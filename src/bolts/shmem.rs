//! Scoped owner of a SysV shared-memory segment.
//!
//! The AFL runtime inside the target attaches the segment whose id it finds
//! in `__AFL_SHM_ID`, so this has to be SysV shared memory, not POSIX. The
//! segment is detached and removed on drop, on every exit path.

use std::{io, ptr, slice};

use crate::Error;

/// A private SysV segment, attached read/write for the lifetime of the value.
#[derive(Debug)]
pub struct SysvShMem {
    id: i32,
    map: *mut u8,
    len: usize,
}

// The mapping is owned by this value alone; the child process writes into it
// through its own attach.
unsafe impl Send for SysvShMem {}

impl SysvShMem {
    /// Allocate and attach a new private segment of `len` bytes, mode 0600.
    pub fn new(len: usize) -> Result<Self, Error> {
        let id = unsafe {
            libc::shmget(
                libc::IPC_PRIVATE,
                len,
                libc::IPC_CREAT | libc::IPC_EXCL | 0o600,
            )
        };
        if id < 0 {
            return Err(Error::File(io::Error::last_os_error()));
        }

        let map = unsafe { libc::shmat(id, ptr::null(), 0) };
        if map as isize == -1 {
            let err = io::Error::last_os_error();
            unsafe { libc::shmctl(id, libc::IPC_RMID, ptr::null_mut()) };
            return Err(Error::File(err));
        }
        let map = map.cast::<u8>();

        // The trace hash walks the buffer in 8-byte strides; shmat returns
        // page-aligned memory, but the contract lives here.
        if map as usize % 8 != 0 {
            unsafe {
                libc::shmdt(map.cast());
                libc::shmctl(id, libc::IPC_RMID, ptr::null_mut());
            }
            return Err(Error::illegal_state(
                "shared memory attach is not 8-byte aligned",
            ));
        }

        Ok(Self { id, map, len })
    }

    /// The segment id, to be advertised to the child via the environment.
    #[must_use]
    pub fn id(&self) -> i32 {
        self.id
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.len
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    #[must_use]
    pub fn as_slice(&self) -> &[u8] {
        unsafe { slice::from_raw_parts(self.map, self.len) }
    }

    #[must_use]
    pub fn as_mut_slice(&mut self) -> &mut [u8] {
        unsafe { slice::from_raw_parts_mut(self.map, self.len) }
    }

    /// Clear the map before a run.
    pub fn zero(&mut self) {
        self.as_mut_slice().fill(0);
    }
}

impl Drop for SysvShMem {
    fn drop(&mut self) {
        unsafe {
            if libc::shmdt(self.map.cast()) != 0 {
                log::warn!(
                    "could not detach shared memory segment {}: {}",
                    self.id,
                    io::Error::last_os_error()
                );
            }
            if libc::shmctl(self.id, libc::IPC_RMID, ptr::null_mut()) != 0 {
                log::warn!(
                    "could not remove shared memory segment {}: {}",
                    self.id,
                    io::Error::last_os_error()
                );
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn alloc_write_read() {
        let mut shmem = SysvShMem::new(4096).unwrap();
        assert_eq!(shmem.len(), 4096);
        shmem.as_mut_slice()[7] = 0xaa;
        assert_eq!(shmem.as_slice()[7], 0xaa);
        shmem.zero();
        assert!(shmem.as_slice().iter().all(|&b| b == 0));
    }
}
