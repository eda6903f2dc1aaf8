//! Parses the kernel-exposed pseudo-filesystem rooted at `/proc/<pid>` into
//! typed memory maps, fd tables and process status. Every function here is
//! read-only and side-effect free: safe to call on a running target, since
//! the kernel guarantees each pseudo-file is point-in-time consistent within
//! a single read.

use crate::error::{RdError, Result};
use crate::memory_region::{MemoryRegion, Perms};
use crate::fd_entry::{FdType, FileDescriptorEntry};
use libc::pid_t;
use std::fs;
use std::path::PathBuf;

pub const PAGE_SIZE: u64 = 4096;

#[derive(Debug, Clone)]
pub struct ProcessInfo {
    pub pid: pid_t,
    pub ppid: pid_t,
    pub state: char,
    pub command: String,
    pub uid: u32,
}

fn proc_path(pid: pid_t, rest: &str) -> PathBuf {
    PathBuf::from(format!("/proc/{}/{}", pid, rest))
}

/// Parse `/proc/<pid>/maps` into the process's `MemoryRegion` list. A line
/// that fails to parse is skipped with a warning; the whole read never
/// fails just because one VMA line is malformed.
pub fn read_maps(pid: pid_t) -> Result<Vec<MemoryRegion>> {
    let path = proc_path(pid, "maps");
    let text = fs::read_to_string(&path).map_err(|e| map_not_found(pid, e))?;

    let mut regions = Vec::new();
    for line in text.lines() {
        match parse_maps_line(line) {
            Some(region) => regions.push(region),
            None => log::warn!("proc_reader: could not parse maps line for pid {}: {}", pid, line),
        }
    }
    Ok(regions)
}

fn parse_maps_line(line: &str) -> Option<MemoryRegion> {
    // 00400000-00452000 r-xp 00000000 08:02 173521  /usr/bin/cat
    let mut fields = line.splitn(6, char::is_whitespace);
    let range = fields.next()?;
    let perms = fields.next()?;
    let offset = fields.next()?;
    let _dev = fields.next()?;
    let inode = fields.next()?;
    let pathname = fields.next().unwrap_or("").trim_start().to_string();

    let mut range_parts = range.splitn(2, '-');
    let start = u64::from_str_radix(range_parts.next()?, 16).ok()?;
    let end = u64::from_str_radix(range_parts.next()?, 16).ok()?;
    if start >= end {
        return None;
    }

    let perm_bytes = perms.as_bytes();
    if perm_bytes.len() < 4 {
        return None;
    }
    let permissions = Perms {
        readable: perm_bytes[0] == b'r',
        writable: perm_bytes[1] == b'w',
        executable: perm_bytes[2] == b'x',
        shared: perm_bytes[3] == b's',
    };

    let offset = u64::from_str_radix(offset, 16).ok()?;
    let inode: u64 = inode.parse().ok()?;

    Some(MemoryRegion {
        start,
        end,
        perms: permissions,
        pathname,
        inode,
        offset,
    })
}

/// Parse `/proc/<pid>/status` and `/proc/<pid>/stat` into a `ProcessInfo`.
pub fn read_process_info(pid: pid_t) -> Result<ProcessInfo> {
    let status = fs::read_to_string(proc_path(pid, "status")).map_err(|e| map_not_found(pid, e))?;

    let mut command = String::new();
    let mut ppid = 0;
    let mut uid = 0;
    for line in status.lines() {
        if let Some(rest) = line.strip_prefix("Name:") {
            command = rest.trim().to_string();
        } else if let Some(rest) = line.strip_prefix("PPid:") {
            ppid = rest.trim().parse().unwrap_or(0);
        } else if let Some(rest) = line.strip_prefix("Uid:") {
            uid = rest.split_whitespace().next().and_then(|s| s.parse().ok()).unwrap_or(0);
        }
    }

    let stat = fs::read_to_string(proc_path(pid, "stat")).map_err(|e| map_not_found(pid, e))?;
    // pid (comm) state ppid ...  -- comm may itself contain spaces/parens.
    let state = stat
        .rfind(')')
        .and_then(|close| stat[close + 1..].trim_start().chars().next())
        .unwrap_or('?');

    Ok(ProcessInfo {
        pid,
        ppid,
        state,
        command,
        uid,
    })
}

/// Parse `/proc/<pid>/fd` and `/proc/<pid>/fdinfo` into `FileDescriptorEntry`
/// values. Fds 0, 1 and 2 are included but the caller (FD Manager) marks
/// them non-restorable.
pub fn read_fds(pid: pid_t) -> Result<Vec<FileDescriptorEntry>> {
    let fd_dir = proc_path(pid, "fd");
    let entries = fs::read_dir(&fd_dir).map_err(|e| map_not_found(pid, e))?;

    let mut out = Vec::new();
    for entry in entries {
        let entry = match entry {
            Ok(e) => e,
            Err(e) => {
                log::warn!("proc_reader: error enumerating fds for pid {}: {}", pid, e);
                continue;
            }
        };
        let fd_num: i32 = match entry.file_name().to_str().and_then(|s| s.parse().ok()) {
            Some(n) => n,
            None => continue,
        };

        let link = match fs::read_link(entry.path()) {
            Ok(l) => l,
            Err(_) => continue, // fd closed between readdir and readlink
        };
        let link_str = link.to_string_lossy().to_string();
        let file_type = classify_fd(&link_str);

        let (flags, offset) = read_fdinfo(pid, fd_num).unwrap_or((0, 0));

        out.push(FileDescriptorEntry {
            fd: fd_num,
            path: link_str,
            flags,
            offset,
            file_type,
            restorable: false, // FD Manager decides restorability
        });
    }
    out.sort_by_key(|e| e.fd);
    Ok(out)
}

fn read_fdinfo(pid: pid_t, fd: i32) -> Option<(i32, i64)> {
    let text = fs::read_to_string(proc_path(pid, &format!("fdinfo/{}", fd))).ok()?;
    let mut flags = 0;
    let mut offset = 0;
    for line in text.lines() {
        if let Some(rest) = line.strip_prefix("flags:") {
            flags = i32::from_str_radix(rest.trim(), 8).unwrap_or(0);
        } else if let Some(rest) = line.strip_prefix("pos:") {
            offset = rest.trim().parse().unwrap_or(0);
        }
    }
    Some((flags, offset))
}

fn classify_fd(link: &str) -> FdType {
    if link.starts_with("socket:[") {
        FdType::Socket
    } else if link.starts_with("pipe:[") {
        FdType::Pipe
    } else if link.starts_with("/dev/") {
        FdType::CharDevice
    } else if link.starts_with("anon_inode:") {
        FdType::Unknown
    } else {
        FdType::Regular
    }
}

/// Opportunistic metadata: the executable path backing `pid`.
pub fn exe_path(pid: pid_t) -> Option<String> {
    fs::read_link(proc_path(pid, "exe"))
        .ok()
        .map(|p| p.to_string_lossy().to_string())
}

/// Opportunistic metadata: the current working directory of `pid`.
pub fn cwd(pid: pid_t) -> Option<String> {
    fs::read_link(proc_path(pid, "cwd"))
        .ok()
        .map(|p| p.to_string_lossy().to_string())
}

/// Opportunistic metadata: the argv vector of `pid`, NUL-split.
pub fn cmdline(pid: pid_t) -> Option<Vec<String>> {
    let raw = fs::read(proc_path(pid, "cmdline")).ok()?;
    Some(
        raw.split(|&b| b == 0)
            .filter(|s| !s.is_empty())
            .map(|s| String::from_utf8_lossy(s).to_string())
            .collect(),
    )
}

fn map_not_found(pid: pid_t, e: std::io::Error) -> RdError {
    if e.kind() == std::io::ErrorKind::NotFound {
        RdError::NotFound(format!("pid {}", pid))
    } else {
        RdError::Io(e)
    }
}
