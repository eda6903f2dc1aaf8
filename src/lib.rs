//! `rdcheckpoint`: ptrace-based checkpoint and restore of a running Linux
//! process's registers, selected memory regions and open file descriptors.
//!
//! The crate is organized the way the pipeline runs: `proc_reader` and
//! `target` talk to the kernel, `memory_region`/`fd_entry`/`registers`/
//! `checkpoint` hold the data model, `memory`/`fd_manager`/`aslr` implement
//! the per-concern logic, `checkpointer` wires it all into
//! `create_checkpoint`/`restore_checkpoint`, and `codec` serializes the
//! result to and from the on-disk artifact format.

pub mod aslr;
pub mod checkpoint;
pub mod checkpointer;
pub mod codec;
pub mod error;
pub mod fd_entry;
pub mod fd_manager;
pub mod memory;
pub mod memory_region;
pub mod options;
pub mod proc_reader;
pub mod registers;
pub mod target;

pub use checkpoint::{Checkpoint, RestoreOutcome};
pub use checkpointer::{create_checkpoint, restore_checkpoint};
pub use error::{RdError, Result};
pub use options::{CheckpointOptions, RestoreOptions};
