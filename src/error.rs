use thiserror::Error;

/// Everything that can go wrong while inspecting, checkpointing or restoring
/// a target process. One kind per failure mode named in the design doc; no
/// exceptional control flow anywhere else in the crate.
#[derive(Debug, Error)]
pub enum RdError {
    #[error("no such process or file: {0}")]
    NotFound(String),

    #[error("ptrace refused for pid {pid} (yama ptrace_scope or missing capability)")]
    PermissionDenied { pid: i32 },

    #[error("timed out waiting for pid {pid} to stop")]
    Timeout { pid: i32 },

    #[error("corrupt checkpoint artifact: {0}")]
    Corrupted(String),

    #[error("operation invalid in target state {state}")]
    InvalidState { state: String },

    #[error("aslr mismatch: no consistent base-address shift between captured and live maps")]
    AslrMismatch,

    #[error("failed to read {len} bytes at 0x{addr:x}")]
    MemoryReadFailed {
        addr: u64,
        len: usize,
        #[source]
        source: nix::Error,
    },

    #[error("failed to write {len} bytes at 0x{addr:x}")]
    MemoryWriteFailed {
        addr: u64,
        len: usize,
        #[source]
        source: nix::Error,
    },

    #[error("failed to read or write registers")]
    RegistersFailed(#[source] nix::Error),

    #[error("injected syscall {nr} failed with errno {errno}")]
    SyscallInjectionFailed { nr: i64, errno: i32 },

    #[error("failed to restore fd: {0}")]
    FdRestoreFailed(String),

    #[error(transparent)]
    Io(#[from] std::io::Error),

    #[error(transparent)]
    Ptrace(#[from] nix::Error),
}

pub type Result<T> = std::result::Result<T, RdError>;
