//! Given a stopped target and its `MemoryRegion` list, classifies which
//! regions to dump, reads them into `MemoryDump`s, and later writes valid
//! dumps back during restore.

use crate::memory_region::{MemoryDump, MemoryRegion};
use crate::options::{CheckpointOptions, RestoreOptions};
use crate::target::TargetController;

/// Apply the selection rules: heap/stack/anonymous/file-backed flags,
/// `skip_read_only`, and the permanent exclusions (kernel pseudo-mappings,
/// shared regions -- writing those would silently affect other processes).
pub fn select_regions<'a>(maps: &'a [MemoryRegion], opts: &CheckpointOptions) -> Vec<&'a MemoryRegion> {
    maps.iter()
        .filter(|r| !r.is_kernel_owned())
        .filter(|r| !r.perms.shared)
        .filter(|r| !(opts.skip_read_only && !r.perms.writable))
        .filter(|r| {
            (opts.dump_heap && r.is_heap())
                || (opts.dump_stack && r.is_stack())
                || (opts.dump_anonymous && r.is_anonymous() && r.perms.writable)
                || (opts.include_file_backed && r.is_file_backed() && r.perms.writable)
        })
        .collect()
}

/// Read each selected region in map order. A region whose read fails
/// midway yields an `invalid` dump so its metadata is still recorded in the
/// artifact; the caller is responsible for turning that into a warning.
pub fn dump_regions(
    ctl: &TargetController,
    regions: &[&MemoryRegion],
    mut progress: Option<&mut dyn FnMut(&str, f32)>,
) -> (Vec<MemoryDump>, Vec<String>) {
    let total_bytes: u64 = regions.iter().map(|r| r.len()).sum::<u64>().max(1);
    let mut done_bytes = 0u64;
    let mut dumps = Vec::with_capacity(regions.len());
    let mut warnings = Vec::new();

    for region in regions {
        match ctl.read_memory(region.start, region.len() as usize) {
            Ok(bytes) => dumps.push(MemoryDump::captured((*region).clone(), bytes)),
            Err(e) => {
                warnings.push(format!("region 0x{:x}-0x{:x}: read failed: {}", region.start, region.end, e));
                dumps.push(MemoryDump::invalid((*region).clone()));
            }
        }
        done_bytes += region.len();
        if let Some(cb) = progress.as_deref_mut() {
            cb("dump_memory", done_bytes as f32 / total_bytes as f32);
        }
    }

    (dumps, warnings)
}

pub struct RestoreResult {
    pub regions_restored: u32,
    pub regions_failed: u32,
    pub regions_skipped: u32,
    pub warnings: Vec<String>,
}

/// Write each valid dump back to `region.start + shift`. Does not `mmap`
/// new regions in the target: if the live map doesn't already cover the
/// range being written, that region is skipped with a warning rather than
/// attempting to pre-allocate a matching VMA.
pub fn restore_regions(
    ctl: &mut TargetController,
    dumps: &[MemoryDump],
    live_maps: &[MemoryRegion],
    shift: i64,
    opts: &RestoreOptions,
) -> RestoreResult {
    let mut restored = 0;
    let mut failed = 0;
    let mut skipped = 0;
    let mut warnings = Vec::new();

    for dump in dumps {
        if !dump.valid() {
            skipped += 1;
            continue;
        }
        let target_start = (dump.region.start as i64 + shift) as u64;
        let target_end = (dump.region.end as i64 + shift) as u64;

        if !live_maps.iter().any(|m| m.start <= target_start && m.end >= target_end) {
            skipped += 1;
            warnings.push(format!(
                "region 0x{:x}-0x{:x}: no matching live mapping at shifted address, skipped",
                target_start, target_end
            ));
            continue;
        }

        match ctl.write_memory(target_start, dump.bytes().unwrap_or(&[])) {
            Ok(()) => restored += 1,
            Err(e) => {
                failed += 1;
                warnings.push(format!("region 0x{:x}-0x{:x}: write failed: {}", target_start, target_end, e));
                if !opts.ignore_memory_errors {
                    break;
                }
            }
        }
    }

    RestoreResult {
        regions_restored: restored,
        regions_failed: failed,
        regions_skipped: skipped,
        warnings,
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::memory_region::Perms;

    fn region(pathname: &str, writable: bool, shared: bool) -> MemoryRegion {
        MemoryRegion {
            start: 0x1000,
            end: 0x2000,
            perms: Perms {
                readable: true,
                writable,
                executable: false,
                shared,
            },
            pathname: pathname.to_string(),
            inode: 0,
            offset: 0,
        }
    }

    #[test]
    fn selects_heap_and_stack_by_default() {
        let maps = vec![region("[heap]", true, false), region("[stack]", true, false)];
        let selected = select_regions(&maps, &CheckpointOptions::default());
        assert_eq!(selected.len(), 2);
    }

    #[test]
    fn excludes_kernel_pseudo_mappings_always() {
        let maps = vec![region("[vdso]", true, false), region("[vvar]", true, false)];
        let selected = select_regions(&maps, &CheckpointOptions::full());
        assert!(selected.is_empty());
    }

    #[test]
    fn excludes_shared_regions_always() {
        let maps = vec![region("", true, true)];
        let selected = select_regions(&maps, &CheckpointOptions::full());
        assert!(selected.is_empty());
    }

    #[test]
    fn skip_read_only_excludes_non_writable_by_default() {
        let maps = vec![region("[heap]", false, false)];
        let selected = select_regions(&maps, &CheckpointOptions::default());
        assert!(selected.is_empty());
    }

    #[test]
    fn file_backed_requires_explicit_flag() {
        let maps = vec![region("/usr/lib/libc.so", true, false)];
        assert!(select_regions(&maps, &CheckpointOptions::default()).is_empty());
        assert_eq!(select_regions(&maps, &CheckpointOptions::full()).len(), 1);
    }
}
