//! Orchestrates the other components into the two operations the rest of
//! the crate exists to support: `create_checkpoint` and `restore_checkpoint`.
//! Both are ordinary functions rather than methods on a stateful object --
//! the only process-wide state is the checkpoint-id allocator below.

use crate::aslr::{self, AslrPolicy};
use crate::checkpoint::{Checkpoint, RestoreOutcome};
use crate::error::{RdError, Result};
use crate::fd_manager;
use crate::memory::{self, select_regions};
use crate::memory_region::MemoryRegion;
use crate::options::{CheckpointOptions, RestoreOptions};
use crate::proc_reader;
use crate::target::TargetController;
use libc::pid_t;
use once_cell::sync::Lazy;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, SystemTime, UNIX_EPOCH};

const ATTACH_TIMEOUT: Duration = Duration::from_secs(2);

static NEXT_CHECKPOINT_ID: Lazy<AtomicU64> = Lazy::new(|| {
    let seed = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs())
        .unwrap_or(0);
    AtomicU64::new(seed)
});

fn allocate_checkpoint_id() -> u64 {
    NEXT_CHECKPOINT_ID.fetch_add(1, Ordering::Relaxed)
}

/// Find the start address of the executable region backed by `exe_path` in
/// `regions`, used on both sides of an ASLR shift calculation.
fn text_base_in(regions: &[MemoryRegion], exe_path: &str) -> Option<u64> {
    regions
        .iter()
        .find(|r| r.perms.executable && r.pathname == exe_path)
        .map(|r| r.start)
}

/// Attach to `pid`, capture its register file, selected memory regions and
/// fd table, then detach. Steps: attach, sample process/maps/fds, read
/// registers, select and dump memory, capture fd metadata, detach, compose.
pub fn create_checkpoint(
    pid: pid_t,
    name: &str,
    opts: &CheckpointOptions,
    mut progress: Option<&mut dyn FnMut(&str, f32)>,
) -> Result<Checkpoint> {
    let mut ctl = TargetController::new(pid);
    ctl.attach(ATTACH_TIMEOUT)?;

    let result = (|| {
        if let Some(cb) = progress.as_deref_mut() {
            cb("attach", 0.0);
        }

        let maps = proc_reader::read_maps(pid)?;
        let all_fds = proc_reader::read_fds(pid)?;

        // Registers are always captured: restoring memory without a register
        // file to restore alongside it would leave the target's rip/rsp
        // pointing nowhere, so `save_registers` only gates whether restore
        // writes them back, not whether they are recorded here.
        let registers = ctl.read_registers()?;

        if let Some(cb) = progress.as_deref_mut() {
            cb("read_registers", 0.1);
        }

        let memory_dumps = if opts.save_memory {
            let selected = select_regions(&maps, opts);
            let (dumps, warnings) = memory::dump_regions(&ctl, &selected, progress.as_deref_mut());
            for w in &warnings {
                log::warn!("create_checkpoint: {}", w);
            }
            dumps
        } else {
            Vec::new()
        };

        let fds = if opts.save_file_descriptors {
            fd_manager::capture_fds(all_fds)
        } else {
            Vec::new()
        };

        let aslr_policy = aslr::detect_policy().unwrap_or(AslrPolicy::Full);

        Ok(Checkpoint {
            checkpoint_id: allocate_checkpoint_id(),
            name: name.to_string(),
            created_at: SystemTime::now()
                .duration_since(UNIX_EPOCH)
                .map(|d| d.as_secs() as i64)
                .unwrap_or(0),
            pid,
            registers,
            memory_map: maps,
            memory_dumps,
            fds,
            aslr_policy,
        })
    })();

    ctl.force_detach();
    result
}

/// Attach to `pid`, reconcile ASLR shift against the live process, then
/// write back registers, memory and fds in that order -- fds last, because
/// reopening them injects and restores syscall-clobbered registers around
/// each one, and those restores must land on top of the already-written
/// register file rather than the other way around.
pub fn restore_checkpoint(pid: pid_t, checkpoint: &Checkpoint, opts: &RestoreOptions) -> Result<RestoreOutcome> {
    let mut ctl = TargetController::new(pid);
    ctl.attach(ATTACH_TIMEOUT)?;

    let result = (|| {
        let mut outcome = RestoreOutcome::default();

        let live_maps = proc_reader::read_maps(pid)?;

        let shift = match proc_reader::exe_path(pid) {
            Some(live_exe) => {
                match (
                    text_base_in(&checkpoint.memory_map, &live_exe),
                    text_base_in(&live_maps, &live_exe),
                ) {
                    (Some(captured_base), Some(live_base)) => aslr::compute_shift(captured_base, live_base),
                    _ if opts.strict => return Err(RdError::AslrMismatch),
                    _ => 0,
                }
            }
            None if opts.strict => return Err(RdError::AslrMismatch),
            None => 0,
        };
        outcome.aslr_shift = Some(shift);

        if opts.restore_registers {
            let regs = checkpoint.registers.shifted(shift);
            ctl.write_registers(&regs)?;
            outcome.registers_restored = true;
        }

        if opts.restore_memory {
            let mem_result = memory::restore_regions(&mut ctl, &checkpoint.memory_dumps, &live_maps, shift, opts);
            outcome.regions_restored = mem_result.regions_restored;
            outcome.regions_failed = mem_result.regions_failed;
            outcome.regions_skipped = mem_result.regions_skipped;
            outcome.warnings.extend(mem_result.warnings);
        }

        if opts.restore_fds && !(opts.stop_on_error && outcome.regions_failed > 0) {
            let fd_result = fd_manager::restore_fds(&mut ctl, &live_maps, &checkpoint.fds);
            outcome.fds_restored = fd_result.restored;
            outcome.fds_failed = fd_result.failed;
            outcome.warnings.extend(fd_result.warnings);
        }

        // Reaching this point means the restore ran to completion. Per-region
        // and per-fd failures are recorded in the counters/warnings above but
        // don't themselves make the restore a failure -- that's the
        // partial-success outcome callers are expected to inspect and act on.
        outcome.success = true;
        Ok(outcome)
    })();

    match &result {
        Ok(_) if opts.continue_after_restore => {
            // Leaves the target running and untraced; detach() itself
            // performs the resume (PTRACE_DETACH), so no separate cont().
            let _ = ctl.detach();
        }
        Ok(_) => {
            // Leave the target stopped and attached for further inspection;
            // the caller is responsible for deciding what happens next.
        }
        Err(_) => ctl.force_detach(),
    }

    result
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::memory_region::Perms;

    fn exe_region(path: &str, start: u64) -> MemoryRegion {
        MemoryRegion {
            start,
            end: start + 0x1000,
            perms: Perms {
                readable: true,
                writable: false,
                executable: true,
                shared: false,
            },
            pathname: path.to_string(),
            inode: 1,
            offset: 0,
        }
    }

    #[test]
    fn text_base_in_finds_matching_executable_region() {
        let regions = vec![exe_region("/usr/bin/foo", 0x5000), exe_region("/usr/bin/bar", 0x9000)];
        assert_eq!(text_base_in(&regions, "/usr/bin/foo"), Some(0x5000));
        assert_eq!(text_base_in(&regions, "/usr/bin/missing"), None);
    }

    #[test]
    fn checkpoint_ids_are_monotonically_allocated() {
        let a = allocate_checkpoint_id();
        let b = allocate_checkpoint_id();
        assert!(b > a);
    }
}
