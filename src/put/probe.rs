//! One-time inspection of the target binary.
//!
//! The instrumentation markers are literal byte strings baked into the AFL
//! runtime, so a plain subsequence scan over the binary is enough.

use std::{env, ffi::OsString, fs, path::Path};

use crate::Error;

pub const SHM_ENV_VAR: &str = "__AFL_SHM_ID";
pub const PERSISTENT_ENV_VAR: &str = "__AFL_PERSISTENT";
pub const DEFER_ENV_VAR: &str = "__AFL_DEFER_FORKSRV";
const ASAN_VAR: &str = "ASAN_OPTIONS";
const MSAN_VAR: &str = "MSAN_OPTIONS";

const PERSISTENT_SIG: &[u8] = b"##SIG_AFL_PERSISTENT##";
const DEFER_SIG: &[u8] = b"##SIG_AFL_DEFER_FORKSRV##";
const ASAN_DETECT: &[u8] = b"libasan.so";
const MSAN_DETECT: &[u8] = b"__msan_init";

/// MSAN cannot abort on error, so its policy violations surface as this
/// exit code instead (AFL's convention).
pub const MSAN_ERROR_CODE: i32 = 86;

/// What the byte scan found in the target.
#[derive(Debug, Clone, Copy, Default)]
pub struct BinaryProbe {
    pub persistent: bool,
    pub deferred: bool,
    pub uses_asan: bool,
    pub uses_msan: bool,
}

/// Scan the binary once. Missing instrumentation is fatal.
pub fn probe_binary(bin_path: &Path) -> Result<BinaryProbe, Error> {
    let content = fs::read(bin_path)?;

    if !contains(&content, SHM_ENV_VAR.as_bytes()) {
        return Err(Error::illegal_argument(format!(
            "{} was not instrumented for fork-server fuzzing",
            bin_path.display()
        )));
    }

    let probe = BinaryProbe {
        persistent: contains(&content, PERSISTENT_SIG),
        deferred: contains(&content, DEFER_SIG),
        uses_asan: contains(&content, ASAN_DETECT),
        uses_msan: contains(&content, MSAN_DETECT),
    };

    if probe.persistent {
        println!("Persistent mode detected.");
    }
    if probe.deferred {
        println!("Deferred fork server detected.");
    }

    Ok(probe)
}

/// Environment the child needs: shm id, mode flags and sanitizer options.
///
/// User-supplied sanitizer options are honored but validated: without
/// `abort_on_error=1` and `symbolize=0` (and the MSAN exit code) crashes
/// would be miscounted, which is a configuration error, not something to
/// paper over at runtime.
pub fn put_environment(probe: &BinaryProbe, shm_id: i32) -> Result<Vec<(OsString, OsString)>, Error> {
    let mut envs: Vec<(OsString, OsString)> = vec![(
        OsString::from(SHM_ENV_VAR),
        OsString::from(shm_id.to_string()),
    )];

    if probe.persistent {
        envs.push((OsString::from(PERSISTENT_ENV_VAR), OsString::from("1")));
    }
    if probe.deferred {
        envs.push((OsString::from(DEFER_ENV_VAR), OsString::from("1")));
    }

    if probe.uses_asan {
        match env::var(ASAN_VAR) {
            Ok(user) => {
                check_sanitizer_opts(ASAN_VAR, &user, &["abort_on_error=1", "symbolize=0"])?;
            }
            Err(_) => envs.push((
                OsString::from(ASAN_VAR),
                OsString::from(
                    "abort_on_error=1:detect_leaks=0:symbolize=0:allocator_may_return_null=1",
                ),
            )),
        }
    }

    if probe.uses_msan {
        let exit_code = format!("exit_code={MSAN_ERROR_CODE}");
        match env::var(MSAN_VAR) {
            Ok(user) => {
                check_sanitizer_opts(MSAN_VAR, &user, &[&exit_code, "symbolize=0"])?;
            }
            Err(_) => envs.push((
                OsString::from(MSAN_VAR),
                OsString::from(format!(
                    "{exit_code}:symbolize=0:abort_on_error=1:allocator_may_return_null=1:msan_track_origins=0"
                )),
            )),
        }
    }

    Ok(envs)
}

fn check_sanitizer_opts(var: &str, value: &str, required: &[&str]) -> Result<(), Error> {
    for flag in required {
        if !value.contains(flag) {
            return Err(Error::illegal_argument(format!(
                "custom {var} set without {flag} - please fix"
            )));
        }
    }
    Ok(())
}

fn contains(haystack: &[u8], needle: &[u8]) -> bool {
    haystack.windows(needle.len()).any(|w| w == needle)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    fn fake_binary(markers: &[&[u8]]) -> std::path::PathBuf {
        let path = crate::bolts::fs::unique_input_path(&std::env::temp_dir());
        let mut f = std::fs::File::create(&path).unwrap();
        f.write_all(b"\x7fELF filler ").unwrap();
        for m in markers {
            f.write_all(m).unwrap();
            f.write_all(b" ").unwrap();
        }
        path
    }

    #[test]
    fn uninstrumented_binary_is_fatal() {
        let path = fake_binary(&[]);
        assert!(matches!(
            probe_binary(&path),
            Err(Error::IllegalArgument(_))
        ));
        std::fs::remove_file(path).unwrap();
    }

    #[test]
    fn markers_are_detected() {
        let path = fake_binary(&[SHM_ENV_VAR.as_bytes(), PERSISTENT_SIG, MSAN_DETECT]);
        let probe = probe_binary(&path).unwrap();
        assert!(probe.persistent);
        assert!(!probe.deferred);
        assert!(!probe.uses_asan);
        assert!(probe.uses_msan);
        std::fs::remove_file(path).unwrap();
    }

    #[test]
    fn environment_carries_shm_id_and_msan_exit_code() {
        let probe = BinaryProbe {
            uses_msan: true,
            ..BinaryProbe::default()
        };
        let envs = put_environment(&probe, 1234).unwrap();
        assert!(envs
            .iter()
            .any(|(k, v)| k.to_str() == Some(SHM_ENV_VAR) && v.to_str() == Some("1234")));
        let msan = envs
            .iter()
            .find(|(k, _)| k.to_str() == Some(MSAN_VAR))
            .unwrap();
        assert!(msan.1.to_str().unwrap().contains("exit_code=86"));
    }
}
