//! How a test case reaches the target: stdin, or a file named on the
//! command line via the `@@` marker.

use std::{
    ffi::OsString,
    os::fd::RawFd,
    path::{Path, PathBuf},
};

use crate::{
    bolts::fs::{rewrite_file, unique_input_path, InputFile},
    Error,
};

/// Where each generated test case is written before a run.
#[derive(Debug)]
pub enum TestcaseSink {
    /// The target reads stdin, which is bound to this file.
    Stdin(InputFile),
    /// The target opens the file at this path (substituted for `@@`).
    File(PathBuf),
}

impl TestcaseSink {
    pub fn write(&mut self, testcase: &[u8]) -> Result<(), Error> {
        match self {
            TestcaseSink::Stdin(file) => file.write_buf(testcase),
            TestcaseSink::File(path) => rewrite_file(path, testcase),
        }
    }

    /// File descriptor to bind to the child's stdin, if any.
    #[must_use]
    pub fn stdin_fd(&self) -> Option<RawFd> {
        match self {
            TestcaseSink::Stdin(file) => Some(file.as_raw_fd()),
            TestcaseSink::File(_) => None,
        }
    }
}

impl Drop for TestcaseSink {
    fn drop(&mut self) {
        if let TestcaseSink::File(path) = self {
            let _ = std::fs::remove_file(path);
        }
    }
}

/// Rewrite the PUT command line for fuzzing.
///
/// The first argument whose tail matches `@@` selects file-input mode; its
/// last `@@` occurrence is replaced with the absolute temp path. Without a
/// marker the target is fed through stdin.
pub fn prepare_cmdline(
    args: &[String],
    workdir: &Path,
) -> Result<(Vec<OsString>, TestcaseSink), Error> {
    let input_path = unique_input_path(workdir);

    for (i, arg) in args.iter().enumerate() {
        if let Some(pos) = arg.rfind("@@") {
            let mut rewritten: Vec<OsString> =
                args.iter().map(OsString::from).collect();
            let mut new_arg = String::with_capacity(arg.len());
            new_arg.push_str(&arg[..pos]);
            new_arg.push_str(&input_path.to_string_lossy());
            new_arg.push_str(&arg[pos + 2..]);
            rewritten[i] = OsString::from(new_arg);

            // Created empty so the very first run finds something to unlink.
            rewrite_file(&input_path, b"")?;
            return Ok((rewritten, TestcaseSink::File(input_path)));
        }
    }

    let file = InputFile::create(input_path)?;
    Ok((
        args.iter().map(OsString::from).collect(),
        TestcaseSink::Stdin(file),
    ))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn no_marker_means_stdin() {
        let (args, sink) =
            prepare_cmdline(&["-v".into(), "--fast".into()], &std::env::temp_dir()).unwrap();
        assert_eq!(args.len(), 2);
        assert!(matches!(sink, TestcaseSink::Stdin(_)));
        assert!(sink.stdin_fd().is_some());
    }

    #[test]
    fn marker_is_rewritten_in_place() {
        let (args, sink) =
            prepare_cmdline(&["--in=@@".into(), "x".into()], &std::env::temp_dir()).unwrap();
        let arg0 = args[0].to_string_lossy().into_owned();
        assert!(arg0.starts_with("--in="));
        assert!(!arg0.contains("@@"));
        assert!(matches!(sink, TestcaseSink::File(_)));
        assert!(sink.stdin_fd().is_none());
    }

    #[test]
    fn last_marker_wins() {
        let (args, _sink) =
            prepare_cmdline(&["@@-@@".into()], &std::env::temp_dir()).unwrap();
        let arg0 = args[0].to_string_lossy().into_owned();
        // The leading marker stays, only the trailing one is substituted.
        assert!(arg0.starts_with("@@-"));
        assert!(!arg0.ends_with("@@"));
    }

    #[test]
    fn file_sink_rewrites_atomically() {
        let (_args, mut sink) =
            prepare_cmdline(&["@@".into()], &std::env::temp_dir()).unwrap();
        sink.write(b"one").unwrap();
        sink.write(b"two").unwrap();
        if let TestcaseSink::File(path) = &sink {
            assert_eq!(std::fs::read(path).unwrap(), b"two");
        } else {
            unreachable!();
        }
    }
}
