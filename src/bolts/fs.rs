//! The reusable test-case file handed to the target.
//!
//! Stdin-mode targets keep one file descriptor open across the whole
//! campaign (rewind, write, truncate before every run); file-argument
//! targets get the path rewritten atomically instead, since some parsers
//! mmap their input and must never observe a half-written file.

use std::{
    fs::{File, OpenOptions},
    io::{Seek, SeekFrom, Write},
    os::fd::{AsRawFd, RawFd},
    path::{Path, PathBuf},
    process,
    sync::atomic::{AtomicUsize, Ordering},
};

use crate::Error;

static FILE_COUNTER: AtomicUsize = AtomicUsize::new(0);

/// A process-unique path for a test-case file under `dir`.
#[must_use]
pub fn unique_input_path(dir: &Path) -> PathBuf {
    let n = FILE_COUNTER.fetch_add(1, Ordering::Relaxed);
    dir.join(format!(".cur_input_{}_{n}", process::id()))
}

/// A test-case file that stays open so its descriptor can be bound to the
/// child's stdin. Removed from disk on drop.
#[derive(Debug)]
pub struct InputFile {
    path: PathBuf,
    file: File,
}

impl InputFile {
    pub fn create(path: PathBuf) -> Result<Self, Error> {
        let file = OpenOptions::new()
            .create(true)
            .truncate(true)
            .read(true)
            .write(true)
            .open(&path)?;
        Ok(Self { path, file })
    }

    #[must_use]
    pub fn path(&self) -> &Path {
        &self.path
    }

    #[must_use]
    pub fn as_raw_fd(&self) -> RawFd {
        self.file.as_raw_fd()
    }

    /// Replace the file content, leaving the read head at the start so the
    /// child sees exactly `buf`.
    pub fn write_buf(&mut self, buf: &[u8]) -> Result<(), Error> {
        self.file.seek(SeekFrom::Start(0))?;
        self.file.write_all(buf)?;
        self.file.set_len(buf.len() as u64)?;
        self.file.seek(SeekFrom::Start(0))?;
        Ok(())
    }
}

impl Drop for InputFile {
    fn drop(&mut self) {
        if let Err(err) = std::fs::remove_file(&self.path) {
            log::warn!("could not remove input file {}: {err}", self.path.display());
        }
    }
}

/// Atomically replace the file at `path` with `buf` via unlink-and-create.
pub fn rewrite_file(path: &Path, buf: &[u8]) -> Result<(), Error> {
    // Fails on the very first run, when nothing exists yet.
    let _ = std::fs::remove_file(path);
    let mut file = OpenOptions::new().write(true).create_new(true).open(path)?;
    file.write_all(buf)?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn write_buf_truncates_previous_content() {
        let path = unique_input_path(&std::env::temp_dir());
        let mut input = InputFile::create(path.clone()).unwrap();
        input.write_buf(b"a long first test case").unwrap();
        input.write_buf(b"tiny").unwrap();
        assert_eq!(std::fs::read(&path).unwrap(), b"tiny");
        drop(input);
        assert!(!path.exists());
    }

    #[test]
    fn rewrite_replaces_whole_file() {
        let path = unique_input_path(&std::env::temp_dir());
        rewrite_file(&path, b"first").unwrap();
        rewrite_file(&path, b"second").unwrap();
        assert_eq!(std::fs::read(&path).unwrap(), b"second");
        std::fs::remove_file(&path).unwrap();
    }
}
