//! A unix pipe pair with explicitly closable ends.
//!
//! The fork-server protocol needs to hand one end of each pipe to the child
//! and close it locally afterwards, so both ends are individually owned and
//! droppable.

use std::{
    io::{self, Read, Write},
    os::fd::{AsRawFd, FromRawFd, OwnedFd, RawFd},
};

use nix::{
    fcntl::{fcntl, FcntlArg, FdFlag},
    unistd,
};

use crate::Error;

/// An anonymous pipe. Ends are closed on drop, or earlier via
/// [`Pipe::close_read_end`] / [`Pipe::close_write_end`].
#[derive(Debug)]
pub struct Pipe {
    read_end: Option<OwnedFd>,
    write_end: Option<OwnedFd>,
}

impl Pipe {
    pub fn new() -> Result<Self, Error> {
        let (read_end, write_end) = unistd::pipe()?;
        Ok(Self {
            read_end: Some(unsafe { OwnedFd::from_raw_fd(read_end) }),
            write_end: Some(unsafe { OwnedFd::from_raw_fd(write_end) }),
        })
    }

    #[must_use]
    pub fn read_end(&self) -> Option<RawFd> {
        self.read_end.as_ref().map(AsRawFd::as_raw_fd)
    }

    #[must_use]
    pub fn write_end(&self) -> Option<RawFd> {
        self.write_end.as_ref().map(AsRawFd::as_raw_fd)
    }

    pub fn close_read_end(&mut self) {
        self.read_end.take();
    }

    pub fn close_write_end(&mut self) {
        self.write_end.take();
    }

    /// Mark both remaining ends close-on-exec so they stay invisible to any
    /// process spawned afterwards.
    pub fn set_cloexec(&self) -> Result<(), Error> {
        for fd in [self.read_end(), self.write_end()].into_iter().flatten() {
            fcntl(fd, FcntlArg::F_SETFD(FdFlag::FD_CLOEXEC))?;
        }
        Ok(())
    }
}

impl Read for Pipe {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        match &self.read_end {
            Some(fd) => unistd::read(fd.as_raw_fd(), buf).map_err(io::Error::from),
            None => Err(io::Error::new(
                io::ErrorKind::BrokenPipe,
                "read end was already closed",
            )),
        }
    }
}

impl Write for Pipe {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        match &self.write_end {
            Some(fd) => unistd::write(fd.as_raw_fd(), buf).map_err(io::Error::from),
            None => Err(io::Error::new(
                io::ErrorKind::BrokenPipe,
                "write end was already closed",
            )),
        }
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn round_trip() {
        let mut pipe = Pipe::new().unwrap();
        pipe.write_all(b"ping").unwrap();
        let mut buf = [0u8; 4];
        pipe.read_exact(&mut buf).unwrap();
        assert_eq!(&buf, b"ping");
    }

    #[test]
    fn closed_end_reports_broken_pipe() {
        let mut pipe = Pipe::new().unwrap();
        pipe.close_write_end();
        assert_eq!(
            pipe.write(b"x").unwrap_err().kind(),
            io::ErrorKind::BrokenPipe
        );
    }
}
