//! Flag sets controlling what a checkpoint captures and how a restore is
//! carried out. Plain data, defaults per the design doc.

#[derive(Copy, Clone, Debug)]
pub struct CheckpointOptions {
    pub save_registers: bool,
    pub save_memory: bool,
    pub dump_heap: bool,
    pub dump_stack: bool,
    pub dump_anonymous: bool,
    pub include_file_backed: bool,
    pub skip_read_only: bool,
    pub save_file_descriptors: bool,
}

impl Default for CheckpointOptions {
    fn default() -> CheckpointOptions {
        CheckpointOptions {
            save_registers: true,
            save_memory: true,
            dump_heap: true,
            dump_stack: true,
            dump_anonymous: true,
            include_file_backed: false,
            skip_read_only: true,
            save_file_descriptors: true,
        }
    }
}

impl CheckpointOptions {
    pub fn full() -> CheckpointOptions {
        CheckpointOptions {
            include_file_backed: true,
            skip_read_only: false,
            ..CheckpointOptions::default()
        }
    }
}

#[derive(Copy, Clone, Debug)]
pub struct RestoreOptions {
    pub restore_registers: bool,
    pub restore_memory: bool,
    pub restore_fds: bool,
    pub validate_before_restore: bool,
    pub stop_on_error: bool,
    pub ignore_memory_errors: bool,
    pub continue_after_restore: bool,
    pub strict: bool,
}

impl Default for RestoreOptions {
    fn default() -> RestoreOptions {
        RestoreOptions {
            restore_registers: true,
            restore_memory: true,
            restore_fds: true,
            validate_before_restore: false,
            stop_on_error: false,
            ignore_memory_errors: true,
            continue_after_restore: true,
            strict: false,
        }
    }
}

impl RestoreOptions {
    /// Conservative preset: never continues the target on our behalf and
    /// aborts on the first region-write failure rather than limping on.
    pub fn safe() -> RestoreOptions {
        RestoreOptions {
            ignore_memory_errors: false,
            continue_after_restore: false,
            ..RestoreOptions::default()
        }
    }
}
