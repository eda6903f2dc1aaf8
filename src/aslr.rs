//! ASLR policy detection, no-randomize child spawning, and text-base
//! detection used to compute a single global restore-time shift.

use crate::error::{RdError, Result};
use crate::proc_reader;
use libc::pid_t;
use nix::sys::personality::{self, Persona};
use nix::unistd::{execvp, fork, ForkResult};
use std::ffi::CString;
use std::fs;
use std::path::Path;

#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum AslrPolicy {
    Disabled,
    Conservative,
    Full,
}

impl AslrPolicy {
    pub fn to_u8(self) -> u8 {
        match self {
            AslrPolicy::Disabled => 0,
            AslrPolicy::Conservative => 1,
            AslrPolicy::Full => 2,
        }
    }

    pub fn from_u8(b: u8) -> AslrPolicy {
        match b {
            0 => AslrPolicy::Disabled,
            1 => AslrPolicy::Conservative,
            _ => AslrPolicy::Full,
        }
    }
}

/// Read `/proc/sys/kernel/randomize_va_space` and classify the kernel's
/// ASLR policy.
pub fn detect_policy() -> Result<AslrPolicy> {
    let text = fs::read_to_string("/proc/sys/kernel/randomize_va_space")?;
    let value: u8 = text.trim().parse().unwrap_or(2);
    Ok(match value {
        0 => AslrPolicy::Disabled,
        1 => AslrPolicy::Conservative,
        _ => AslrPolicy::Full,
    })
}

/// Fork and exec `path` with `argv`, disabling address-space randomization
/// in the child via `personality(ADDR_NO_RANDOMIZE)` before the exec. This
/// produces a target whose load addresses exactly match a future restart
/// with the same flag, enabling deterministic restore without needing to
/// compute an ASLR shift at all.
pub fn spawn_no_randomize(path: &Path, argv: &[String]) -> Result<pid_t> {
    let c_path = CString::new(path.to_string_lossy().as_bytes()).map_err(|_| {
        RdError::NotFound(format!("invalid path {}", path.display()))
    })?;
    let mut c_argv: Vec<CString> = Vec::with_capacity(argv.len() + 1);
    c_argv.push(c_path.clone());
    for a in argv {
        c_argv.push(CString::new(a.as_bytes()).unwrap_or_default());
    }

    // Safety: fork() is unsafe because the child may only call
    // async-signal-safe functions until exec; we restrict the child path to
    // personality() and execvp(), both of which are safe in that sense.
    match unsafe { fork() }.map_err(RdError::from)? {
        ForkResult::Parent { child } => Ok(child.as_raw()),
        ForkResult::Child => {
            let current = personality::get().unwrap_or_else(|_| Persona::empty());
            let _ = personality::set(current | Persona::ADDR_NO_RANDOMIZE);
            let _ = execvp(&c_path, &c_argv);
            // execvp only returns on failure.
            std::process::exit(127);
        }
    }
}

/// Find the first executable region whose pathname equals `exe_path`; its
/// `start` is the effective text base for that process.
pub fn text_base(pid: pid_t, exe_path: &str) -> Result<u64> {
    let maps = proc_reader::read_maps(pid)?;
    maps.iter()
        .find(|r| r.perms.executable && r.pathname == exe_path)
        .map(|r| r.start)
        .ok_or_else(|| RdError::NotFound(format!("no executable text mapping for {}", exe_path)))
}

/// A single signed address delta explaining the difference between where a
/// mapping was at capture time versus restore time.
pub fn compute_shift(captured_base: u64, live_base: u64) -> i64 {
    live_base as i64 - captured_base as i64
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn policy_round_trip() {
        for p in [AslrPolicy::Disabled, AslrPolicy::Conservative, AslrPolicy::Full] {
            assert_eq!(AslrPolicy::from_u8(p.to_u8()), p);
        }
    }

    #[test]
    fn shift_is_signed_delta() {
        assert_eq!(compute_shift(0x1000, 0x1000), 0);
        assert_eq!(compute_shift(0x1000, 0x2000), 0x1000);
        assert_eq!(compute_shift(0x2000, 0x1000), -0x1000);
    }
}
