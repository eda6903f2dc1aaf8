//! Wraps the kernel's process-tracing primitives (attach/detach/peek/poke/
//! get-regs/set-regs/continue/single-step/syscall injection) behind a small
//! state machine. Every mutating operation checks the current state first
//! and returns `RdError::InvalidState` otherwise -- a tagged enum carried by
//! the controller, not an inheritance hierarchy of attached/detached types.

use crate::error::{RdError, Result};
use crate::registers::RegisterFile;
use libc::{c_void, pid_t};
use nix::sys::ptrace;
use nix::sys::wait::{waitpid, WaitPidFlag, WaitStatus};
use nix::unistd::Pid;
use std::time::{Duration, Instant};

/// Where a `TargetController` is in the attach/stop/run lifecycle. The
/// terminal state is `Detached` (either by explicit `detach()` or because
/// the target exited, which is reported separately as `RdError::NotFound`
/// from whichever operation observed it).
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum TargetState {
    Detached,
    Stopped,
    Running,
}

impl std::fmt::Display for TargetState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{:?}", self)
    }
}

pub struct TargetController {
    pid: pid_t,
    state: TargetState,
    /// Address of a `syscall` instruction inside the target, found once per
    /// attach and reused by every `inject_syscall` call.
    syscall_insn: Option<u64>,
}

const WORD: usize = std::mem::size_of::<u64>();

impl TargetController {
    pub fn new(pid: pid_t) -> TargetController {
        TargetController {
            pid,
            state: TargetState::Detached,
            syscall_insn: None,
        }
    }

    pub fn pid(&self) -> pid_t {
        self.pid
    }

    pub fn state(&self) -> TargetState {
        self.state
    }

    fn require(&self, expected: TargetState) -> Result<()> {
        if self.state != expected {
            return Err(RdError::InvalidState {
                state: format!("expected {:?}, found {:?}", expected, self.state),
            });
        }
        Ok(())
    }

    /// Attach to `pid`, waiting up to `timeout` for the stop to land.
    pub fn attach(&mut self, timeout: Duration) -> Result<()> {
        self.require(TargetState::Detached)?;

        ptrace::attach(Pid::from_raw(self.pid)).map_err(|e| match e {
            nix::Error::Sys(nix::errno::Errno::EPERM) => {
                RdError::PermissionDenied { pid: self.pid }
            }
            nix::Error::Sys(nix::errno::Errno::ESRCH) => {
                RdError::NotFound(format!("pid {}", self.pid))
            }
            other => RdError::Ptrace(other),
        })?;

        let deadline = Instant::now() + timeout;
        loop {
            match waitpid(Pid::from_raw(self.pid), Some(WaitPidFlag::WNOHANG)) {
                Ok(WaitStatus::Stopped(_, _)) => {
                    self.state = TargetState::Stopped;
                    self.syscall_insn = None;
                    return Ok(());
                }
                Ok(WaitStatus::Exited(_, _)) | Ok(WaitStatus::Signaled(_, _, _)) => {
                    return Err(RdError::NotFound(format!("pid {} exited", self.pid)));
                }
                Ok(_) => {}
                Err(nix::Error::Sys(nix::errno::Errno::EINTR)) => {}
                Err(e) => return Err(RdError::Ptrace(e)),
            }
            if Instant::now() >= deadline {
                return Err(RdError::Timeout { pid: self.pid });
            }
            std::thread::sleep(Duration::from_millis(1));
        }
    }

    /// Detach, leaving the target running. Only legal from `Stopped`.
    pub fn detach(&mut self) -> Result<()> {
        self.require(TargetState::Stopped)?;
        ptrace::detach(Pid::from_raw(self.pid)).map_err(RdError::from)?;
        self.state = TargetState::Detached;
        Ok(())
    }

    /// Detach unconditionally, used on timeout/cancellation paths where the
    /// controller may be in any state; never leaves the target half-stopped.
    pub fn force_detach(&mut self) {
        if self.state != TargetState::Detached {
            let _ = ptrace::detach(Pid::from_raw(self.pid));
            self.state = TargetState::Detached;
        }
    }

    pub fn read_registers(&self) -> Result<RegisterFile> {
        self.require(TargetState::Stopped)?;
        let regs = ptrace::getregs(Pid::from_raw(self.pid)).map_err(RdError::RegistersFailed)?;
        Ok(RegisterFile::from_ptrace(&regs))
    }

    /// Writes are atomic: the kernel either installs the complete register
    /// file or rejects the call outright, so there is no partial-write state
    /// to guard against here.
    pub fn write_registers(&mut self, regs: &RegisterFile) -> Result<()> {
        self.require(TargetState::Stopped)?;
        ptrace::setregs(Pid::from_raw(self.pid), regs.to_ptrace()).map_err(RdError::RegistersFailed)
    }

    /// Read `len` bytes at `addr`. Tries a bulk `process_vm_readv` first;
    /// falls back to word-at-a-time `PTRACE_PEEKDATA` when the bulk call is
    /// refused (e.g. `EPERM` under restrictive yama settings) or unsupported.
    pub fn read_memory(&self, addr: u64, len: usize) -> Result<Vec<u8>> {
        self.require(TargetState::Stopped)?;
        if len == 0 {
            return Ok(Vec::new());
        }
        match process_vm_readv(self.pid, addr, len) {
            Ok(buf) => Ok(buf),
            Err(_) => self.read_memory_ptrace(addr, len),
        }
    }

    fn read_memory_ptrace(&self, addr: u64, len: usize) -> Result<Vec<u8>> {
        let mut out = Vec::with_capacity(len);
        let mut offset = 0usize;
        while offset < len {
            let word_addr = addr + offset as u64;
            let word = ptrace::read(Pid::from_raw(self.pid), word_addr as *mut c_void).map_err(|e| {
                RdError::MemoryReadFailed {
                    addr: word_addr,
                    len,
                    source: e,
                }
            })?;
            let bytes = (word as u64).to_ne_bytes();
            let take = std::cmp::min(WORD, len - offset);
            out.extend_from_slice(&bytes[..take]);
            offset += take;
        }
        Ok(out)
    }

    /// Write `bytes` at `addr`. Tries a bulk `process_vm_writev` first,
    /// falling back to word-aligned `PTRACE_POKEDATA`.
    pub fn write_memory(&mut self, addr: u64, bytes: &[u8]) -> Result<()> {
        self.require(TargetState::Stopped)?;
        if bytes.is_empty() {
            return Ok(());
        }
        if process_vm_writev(self.pid, addr, bytes).is_ok() {
            return Ok(());
        }
        self.write_memory_ptrace(addr, bytes)
    }

    fn write_memory_ptrace(&mut self, addr: u64, bytes: &[u8]) -> Result<()> {
        let mut offset = 0usize;
        while offset < bytes.len() {
            let word_addr = addr + offset as u64;
            let remaining = bytes.len() - offset;
            let word = if remaining >= WORD {
                u64::from_ne_bytes(bytes[offset..offset + WORD].try_into().unwrap())
            } else {
                // Partial trailing word: preserve the existing high bytes by
                // reading the word first, then overlaying our bytes.
                let existing = ptrace::read(Pid::from_raw(self.pid), word_addr as *mut c_void)
                    .map_err(|e| RdError::MemoryWriteFailed {
                        addr: word_addr,
                        len: bytes.len(),
                        source: e,
                    })? as u64;
                let mut buf = existing.to_ne_bytes();
                buf[..remaining].copy_from_slice(&bytes[offset..]);
                u64::from_ne_bytes(buf)
            };
            unsafe {
                ptrace::write(
                    Pid::from_raw(self.pid),
                    word_addr as *mut c_void,
                    word as *mut c_void,
                )
            }
            .map_err(|e| RdError::MemoryWriteFailed {
                addr: word_addr,
                len: bytes.len(),
                source: e,
            })?;
            offset += WORD;
        }
        Ok(())
    }

    pub fn single_step(&mut self) -> Result<()> {
        self.require(TargetState::Stopped)?;
        ptrace::step(Pid::from_raw(self.pid), None).map_err(RdError::from)?;
        self.state = TargetState::Running;
        Ok(())
    }

    pub fn cont(&mut self) -> Result<()> {
        self.require(TargetState::Stopped)?;
        ptrace::cont(Pid::from_raw(self.pid), None).map_err(RdError::from)?;
        self.state = TargetState::Running;
        Ok(())
    }

    /// Block until the next stop, then transition back to `Stopped`.
    pub fn wait_for_stop(&mut self, timeout: Duration) -> Result<()> {
        let deadline = Instant::now() + timeout;
        loop {
            match waitpid(Pid::from_raw(self.pid), Some(WaitPidFlag::WNOHANG)) {
                Ok(WaitStatus::Stopped(_, _)) => {
                    self.state = TargetState::Stopped;
                    return Ok(());
                }
                Ok(WaitStatus::Exited(_, _)) | Ok(WaitStatus::Signaled(_, _, _)) => {
                    return Err(RdError::NotFound(format!("pid {} exited", self.pid)));
                }
                Ok(_) => {}
                Err(nix::Error::Sys(nix::errno::Errno::EINTR)) => {}
                Err(e) => return Err(RdError::Ptrace(e)),
            }
            if Instant::now() >= deadline {
                self.force_detach();
                return Err(RdError::Timeout { pid: self.pid });
            }
            std::thread::sleep(Duration::from_millis(1));
        }
    }

    /// Mount a `syscall` instruction already present in the target's text
    /// and remember it for subsequent injections within this attach window.
    fn ensure_syscall_site(&mut self, regions: &[crate::memory_region::MemoryRegion]) -> Result<u64> {
        if let Some(addr) = self.syscall_insn {
            return Ok(addr);
        }
        // `0f 05` is the x86-64 SYSCALL opcode. Scan the first executable
        // region for it; real targets always contain one (libc's syscall
        // stubs, the vdso, ...).
        for region in regions.iter().filter(|r| r.perms.executable && !r.is_kernel_owned()) {
            let len = std::cmp::min(region.len(), 4096) as usize;
            if let Ok(bytes) = self.read_memory(region.start, len) {
                if let Some(pos) = bytes.windows(2).position(|w| w == [0x0f, 0x05]) {
                    let addr = region.start + pos as u64;
                    self.syscall_insn = Some(addr);
                    return Ok(addr);
                }
            }
        }
        Err(RdError::SyscallInjectionFailed { nr: -1, errno: libc::ENOEXEC })
    }

    /// Temporarily overwrite the target's registers so that a single kernel
    /// call runs on its behalf: saves registers, rewrites `rip`/`rax`/
    /// argument registers to mount a `syscall` at `regions`-located site,
    /// single-steps across it, reads the return value, restores the saved
    /// registers. Kernel errors propagate as the raw (negative) return
    /// value's errno.
    pub fn inject_syscall(
        &mut self,
        regions: &[crate::memory_region::MemoryRegion],
        nr: i64,
        args: [u64; 6],
    ) -> Result<i64> {
        self.require(TargetState::Stopped)?;
        let site = self.ensure_syscall_site(regions)?;
        let saved = self.read_registers()?;

        let mut regs = saved;
        regs.rip = site;
        regs.orig_rax = nr as u64;
        regs.rax = nr as u64;
        regs.rdi = args[0];
        regs.rsi = args[1];
        regs.rdx = args[2];
        regs.r10 = args[3];
        regs.r8 = args[4];
        regs.r9 = args[5];
        self.write_registers(&regs)?;

        self.single_step()?;
        self.wait_for_stop(Duration::from_secs(5))?;

        let result_regs = self.read_registers()?;
        let result = result_regs.rax as i64;

        self.write_registers(&saved)?;

        if result < 0 && result > -4096 {
            return Err(RdError::SyscallInjectionFailed {
                nr,
                errno: (-result) as i32,
            });
        }
        Ok(result)
    }
}

/// `process_vm_readv(2)` via a raw syscall -- the `nix` version pinned by
/// this crate predates its safe wrapper for this call.
fn process_vm_readv(pid: pid_t, addr: u64, len: usize) -> std::result::Result<Vec<u8>, ()> {
    let mut buf = vec![0u8; len];
    let local = libc::iovec {
        iov_base: buf.as_mut_ptr() as *mut c_void,
        iov_len: len,
    };
    let remote = libc::iovec {
        iov_base: addr as *mut c_void,
        iov_len: len,
    };
    let n = unsafe {
        libc::syscall(
            libc::SYS_process_vm_readv,
            pid,
            &local as *const libc::iovec,
            1usize,
            &remote as *const libc::iovec,
            1usize,
            0usize,
        )
    };
    if n < 0 || n as usize != len {
        return Err(());
    }
    Ok(buf)
}

/// `process_vm_writev(2)` via a raw syscall, mirroring `process_vm_readv`
/// above.
fn process_vm_writev(pid: pid_t, addr: u64, bytes: &[u8]) -> std::result::Result<(), ()> {
    let local = libc::iovec {
        iov_base: bytes.as_ptr() as *mut c_void,
        iov_len: bytes.len(),
    };
    let remote = libc::iovec {
        iov_base: addr as *mut c_void,
        iov_len: bytes.len(),
    };
    let n = unsafe {
        libc::syscall(
            libc::SYS_process_vm_writev,
            pid,
            &local as *const libc::iovec,
            1usize,
            &remote as *const libc::iovec,
            1usize,
            0usize,
        )
    };
    if n < 0 || n as usize != bytes.len() {
        return Err(());
    }
    Ok(())
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn fresh_controller_is_detached() {
        let ctl = TargetController::new(1);
        assert_eq!(ctl.state(), TargetState::Detached);
    }

    #[test]
    fn ops_reject_wrong_state() {
        let ctl = TargetController::new(1);
        assert!(matches!(
            ctl.read_registers(),
            Err(RdError::InvalidState { .. })
        ));
    }
}
