//! The `Checkpoint` artifact value and the `RestoreOutcome` report produced
//! by restoring one. Immutable after construction; owned exclusively by the
//! caller that created it.

use crate::aslr::AslrPolicy;
use crate::fd_entry::FileDescriptorEntry;
use crate::memory_region::{MemoryDump, MemoryRegion};
use crate::registers::RegisterFile;
use libc::pid_t;

#[derive(Debug)]
pub struct Checkpoint {
    pub checkpoint_id: u64,
    pub name: String,
    pub created_at: i64,
    pub pid: pid_t,
    pub registers: RegisterFile,
    pub memory_map: Vec<MemoryRegion>,
    pub memory_dumps: Vec<MemoryDump>,
    pub fds: Vec<FileDescriptorEntry>,
    pub aslr_policy: AslrPolicy,
}

impl Checkpoint {
    /// Total bytes captured across all valid dumps -- the invariant
    /// `total bytes = Σ dump lengths` stated in the data model.
    pub fn total_bytes(&self) -> u64 {
        self.memory_dumps
            .iter()
            .filter(|d| d.valid())
            .map(|d| d.region.len())
            .sum()
    }
}

/// A structured report returned by `restore_checkpoint`. Callers
/// pattern-match on it rather than relying on exceptions; a partially
/// successful restore still has `success == true` with non-zero failure
/// counters and warnings.
#[derive(Clone, Debug, Default)]
pub struct RestoreOutcome {
    pub registers_restored: bool,
    pub regions_restored: u32,
    pub regions_failed: u32,
    pub regions_skipped: u32,
    pub fds_restored: u32,
    pub fds_failed: u32,
    pub warnings: Vec<String>,
    pub success: bool,
    pub aslr_shift: Option<i64>,
}
