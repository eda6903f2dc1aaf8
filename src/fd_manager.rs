//! Captures the fd table (metadata only) and, at restore time, reopens
//! restorable fds in the target via syscall injection.

use crate::fd_entry::{FdType, FileDescriptorEntry};
use crate::memory_region::MemoryRegion;
use crate::target::TargetController;
use std::ffi::CString;

const STDIO_FDS: [i32; 3] = [0, 1, 2];

/// Mark each entry restorable or not. The standard streams are retained but
/// never reopened by value -- restore keeps whatever the hosting process
/// already has. Non-regular types are captured metadata-only.
pub fn capture_fds(entries: Vec<FileDescriptorEntry>) -> Vec<FileDescriptorEntry> {
    entries
        .into_iter()
        .map(|mut e| {
            if STDIO_FDS.contains(&e.fd) {
                e.restorable = false;
            } else if e.file_type != FdType::Regular && e.file_type != FdType::Directory {
                e.restorable = false;
                log::warn!(
                    "fd_manager: fd {} ({:?}) at '{}' is not restorable, capturing metadata only",
                    e.fd,
                    e.file_type,
                    e.path
                );
            } else {
                e.restorable = true;
            }
            e
        })
        .collect()
}

pub struct FdRestoreResult {
    pub restored: u32,
    pub failed: u32,
    pub warnings: Vec<String>,
}

/// Reopen every restorable fd in the target: `openat` the recorded path
/// with the recorded flags, `dup2`+`close` to renumber if the kernel handed
/// back a different fd, then `lseek` to the recorded offset. Any failing
/// step skips that entry with a warning and moves on to the next.
pub fn restore_fds(
    ctl: &mut TargetController,
    regions: &[MemoryRegion],
    entries: &[FileDescriptorEntry],
) -> FdRestoreResult {
    let mut restored = 0;
    let mut failed = 0;
    let mut warnings = Vec::new();

    for entry in entries.iter().filter(|e| e.restorable) {
        match restore_one_fd(ctl, regions, entry) {
            Ok(()) => restored += 1,
            Err(msg) => {
                failed += 1;
                warnings.push(format!("fd {}: {}", entry.fd, msg));
            }
        }
    }

    FdRestoreResult {
        restored,
        failed,
        warnings,
    }
}

fn restore_one_fd(
    ctl: &mut TargetController,
    regions: &[MemoryRegion],
    entry: &FileDescriptorEntry,
) -> Result<(), String> {
    let path_addr = push_path_into_scratch(ctl, regions, &entry.path)?;

    let opened = ctl
        .inject_syscall(
            regions,
            libc::SYS_openat,
            [libc::AT_FDCWD as u64, path_addr, entry.flags as u64, 0, 0, 0],
        )
        .map_err(|e| format!("openat failed: {}", e))? as i32;

    if opened != entry.fd {
        ctl.inject_syscall(regions, libc::SYS_dup2, [opened as u64, entry.fd as u64, 0, 0, 0, 0])
            .map_err(|e| format!("dup2 failed: {}", e))?;
        ctl.inject_syscall(regions, libc::SYS_close, [opened as u64, 0, 0, 0, 0, 0])
            .map_err(|e| format!("close of temporary fd failed: {}", e))?;
    }

    ctl.inject_syscall(
        regions,
        libc::SYS_lseek,
        [entry.fd as u64, entry.offset as u64, libc::SEEK_SET as u64, 0, 0, 0],
    )
    .map_err(|e| format!("lseek failed: {}", e))?;

    Ok(())
}

/// Write the path string (NUL-terminated) into the target's stack, just
/// below the current `rsp`, so an injected syscall can take its address as
/// an argument. This mirrors how syscall injection elsewhere in the crate
/// avoids needing a dedicated scratch allocation.
fn push_path_into_scratch(
    ctl: &mut TargetController,
    regions: &[MemoryRegion],
    path: &str,
) -> Result<u64, String> {
    let c_path = CString::new(path).map_err(|_| "path contains NUL byte".to_string())?;
    let bytes = c_path.as_bytes_with_nul();

    let regs = ctl.read_registers().map_err(|e| e.to_string())?;
    let scratch_len = ((bytes.len() + 15) / 16 * 16) as u64;
    let addr = regs.rsp - 512 - scratch_len;

    ctl.write_memory(addr, bytes).map_err(|e| e.to_string())?;
    let _ = regions;
    Ok(addr)
}

#[cfg(test)]
mod test {
    use super::*;

    fn entry(fd: i32, path: &str, file_type: FdType) -> FileDescriptorEntry {
        FileDescriptorEntry {
            fd,
            path: path.to_string(),
            flags: 0,
            offset: 0,
            file_type,
            restorable: false,
        }
    }

    #[test]
    fn stdio_never_restorable() {
        let entries = vec![
            entry(0, "/dev/pts/0", FdType::CharDevice),
            entry(1, "/dev/pts/0", FdType::CharDevice),
            entry(2, "/dev/pts/0", FdType::CharDevice),
        ];
        let captured = capture_fds(entries);
        assert!(captured.iter().all(|e| !e.restorable));
    }

    #[test]
    fn regular_files_are_restorable() {
        let entries = vec![entry(5, "/tmp/data.bin", FdType::Regular)];
        let captured = capture_fds(entries);
        assert!(captured[0].restorable);
    }

    #[test]
    fn sockets_and_pipes_are_not_restorable() {
        let entries = vec![
            entry(5, "socket:[123]", FdType::Socket),
            entry(6, "pipe:[456]", FdType::Pipe),
        ];
        let captured = capture_fds(entries);
        assert!(captured.iter().all(|e| !e.restorable));
    }
}
