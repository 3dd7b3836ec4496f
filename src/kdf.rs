//! Key derivation parameters for new keyslots.
//!
//! The recovery key gets an Argon2i memory cost derived from the usable
//! system memory instead of an empirical benchmark, which is slow and
//! unreliable on small devices. Keys added while rotating the volume key only
//! need to survive until the next protocol step, so they use a short target
//! duration.

use std::fs;
use std::io;
use std::path::Path;
use std::time::Duration;
use thiserror::Error;

pub const PROC_MEMINFO: &str = "/proc/meminfo";

const KIB: i64 = 1024;
const MIB: i64 = 1024 * KIB;
const GIB: i64 = 1024 * MIB;

/// Memory left to the rest of the system while the KDF runs.
pub const RESERVED_MEMORY: i64 = 384 * MIB;
pub const MIN_KDF_MEMORY: i64 = 32 * KIB;
pub const MAX_KDF_MEMORY: i64 = GIB;
pub const RECOVERY_KDF_ITERATIONS: u32 = 4;
pub const TEMPORARY_KEY_KDF_TIME: Duration = Duration::from_millis(100);

#[derive(Error, Debug)]
pub enum MemInfoError {
    #[error(transparent)]
    Io(#[from] io::Error),
    #[error("no MemTotal entry found")]
    MissingTotal,
    #[error("invalid meminfo entry `{0}`")]
    InvalidEntry(String),
}

#[derive(Error, Debug)]
pub enum KdfError {
    #[error("cannot get usable memory for KDF parameters when adding the recovery key: {0}")]
    ResourceQuery(#[from] MemInfoError),
}

pub type Result<T, E = KdfError> = core::result::Result<T, E>;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum KdfOptions {
    /// Fixed Argon2i cost, skips benchmarking.
    MemoryCost {
        memory_kib: u32,
        force_iterations: u32,
    },
    /// Let the volume tool benchmark towards a target unlock time.
    TargetDuration(Duration),
}

impl KdfOptions {
    pub fn temporary_key() -> Self {
        KdfOptions::TargetDuration(TEMPORARY_KEY_KDF_TIME)
    }
}

fn parse_kb(line: &str, value: &str) -> Result<u64, MemInfoError> {
    let value = value.trim();
    let number = value.strip_suffix("kB").unwrap_or(value).trim();
    number
        .parse::<u64>()
        .map_err(|_| MemInfoError::InvalidEntry(line.to_string()))
}

/// Parses `/proc/meminfo` formatted text and returns the usable memory in bytes.
///
/// Memory reserved for the contiguous memory allocator cannot be used by the
/// KDF and is subtracted from the total.
pub fn parse_usable_memory(meminfo: &str) -> Result<u64, MemInfoError> {
    let mut total = None;
    let mut cma = 0;
    for line in meminfo.lines() {
        let Some((key, value)) = line.split_once(':') else {
            continue;
        };
        match key.trim() {
            "MemTotal" => total = Some(parse_kb(line, value)?),
            "CmaTotal" => cma = parse_kb(line, value)?,
            _ => {}
        }
    }
    let total = total.ok_or(MemInfoError::MissingTotal)?;
    Ok(total.saturating_sub(cma) * 1024)
}

pub fn usable_memory(meminfo: &Path) -> Result<u64> {
    let content = fs::read_to_string(meminfo).map_err(MemInfoError::from)?;
    Ok(parse_usable_memory(&content)?)
}

/// Heuristic recovery key KDF: half of what remains once the system
/// reservation is taken out, clamped to `[32 KiB, 1 GiB]`.
pub fn recovery_kdf_for_memory(usable_bytes: u64) -> KdfOptions {
    let usable = i64::try_from(usable_bytes).unwrap_or(i64::MAX);
    let memory = ((usable - RESERVED_MEMORY) / 2).clamp(MIN_KDF_MEMORY, MAX_KDF_MEMORY);
    KdfOptions::MemoryCost {
        memory_kib: (memory / KIB) as u32,
        force_iterations: RECOVERY_KDF_ITERATIONS,
    }
}

pub fn recovery_kdf(meminfo: &Path) -> Result<KdfOptions> {
    let usable = usable_memory(meminfo)?;
    let opts = recovery_kdf_for_memory(usable);
    log::debug!("recovery key KDF options for {} usable bytes: {:?}", usable, opts);
    Ok(opts)
}

#[cfg(test)]
mod tests {
    use super::*;
    use eyre::Result;
    use std::fs;

    const MOCKED_MEMINFO: &str = "MemTotal:         929956 kB\nCmaTotal:         131072 kB\n";

    fn memory_kib(opts: KdfOptions) -> u32 {
        match opts {
            KdfOptions::MemoryCost { memory_kib, .. } => memory_kib,
            KdfOptions::TargetDuration(_) => panic!("unexpected target duration"),
        }
    }

    #[test]
    fn recovery_kdf_from_meminfo() -> Result<()> {
        let dir = tempfile::tempdir()?;
        let meminfo = dir.path().join("meminfo");

        let err = recovery_kdf(&meminfo).unwrap_err();
        assert!(err
            .to_string()
            .starts_with("cannot get usable memory for KDF parameters when adding the recovery key: "));

        fs::write(&meminfo, MOCKED_MEMINFO)?;
        assert_eq!(
            recovery_kdf(&meminfo)?,
            KdfOptions::MemoryCost {
                memory_kib: 202834,
                force_iterations: 4
            }
        );

        fs::write(&meminfo, "MemTotal:         2097152 kB\nCmaTotal:         131072 kB\n")?;
        assert_eq!(memory_kib(recovery_kdf(&meminfo)?), 786432);

        fs::write(&meminfo, "MemTotal:         262144 kB\nCmaTotal:         131072 kB\n")?;
        assert_eq!(memory_kib(recovery_kdf(&meminfo)?), 32);
        Ok(())
    }

    #[test]
    fn meminfo_without_cma() -> Result<()> {
        assert_eq!(parse_usable_memory("MemTotal: 1024 kB\nMemFree: 12 kB\n")?, 1024 * 1024);
        Ok(())
    }

    #[test]
    fn meminfo_without_total() {
        assert!(matches!(
            parse_usable_memory("MemFree: 12 kB\n"),
            Err(MemInfoError::MissingTotal)
        ));
        assert!(matches!(
            parse_usable_memory("MemTotal: lots kB\n"),
            Err(MemInfoError::InvalidEntry(_))
        ));
    }

    #[test]
    fn clamps_at_boundaries() {
        let reserved = RESERVED_MEMORY as u64;
        assert_eq!(memory_kib(recovery_kdf_for_memory(0)), 32);
        assert_eq!(memory_kib(recovery_kdf_for_memory(reserved)), 32);
        assert_eq!(memory_kib(recovery_kdf_for_memory(reserved + 64 * 1024)), 32);
        assert_eq!(memory_kib(recovery_kdf_for_memory(reserved + 128 * 1024)), 64);
        assert_eq!(
            memory_kib(recovery_kdf_for_memory(reserved + 2 * (1 << 30))),
            1048576
        );
        assert_eq!(memory_kib(recovery_kdf_for_memory(u64::MAX)), 1048576);
    }

    #[test]
    fn temporary_key_uses_short_target() {
        assert_eq!(
            KdfOptions::temporary_key(),
            KdfOptions::TargetDuration(Duration::from_millis(100))
        );
    }

    mod proptest_suite {
        use super::super::*;
        use proptest::prelude::*;

        const LOW: u64 = RESERVED_MEMORY as u64 + 64 * 1024;
        const HIGH: u64 = 2 * ((1 << 30) + RESERVED_MEMORY as u64);

        fn kib(opts: KdfOptions) -> u32 {
            match opts {
                KdfOptions::MemoryCost { memory_kib, .. } => memory_kib,
                KdfOptions::TargetDuration(_) => 0,
            }
        }

        proptest! {
            #[test]
            fn memory_within_bounds(usable in LOW..=HIGH) {
                let memory = kib(recovery_kdf_for_memory(usable));
                prop_assert!((32..=1048576).contains(&memory));
            }

            #[test]
            fn memory_monotonic(a in LOW..=HIGH, b in LOW..=HIGH) {
                let (lo, hi) = if a <= b { (a, b) } else { (b, a) };
                prop_assert!(kib(recovery_kdf_for_memory(lo)) <= kib(recovery_kdf_for_memory(hi)));
            }

            #[test]
            fn always_four_iterations(usable in any::<u64>()) {
                let iterations = match recovery_kdf_for_memory(usable) {
                    KdfOptions::MemoryCost { force_iterations, .. } => force_iterations,
                    KdfOptions::TargetDuration(_) => 0,
                };
                prop_assert_eq!(iterations, 4);
            }
        }
    }
}
