//! Command-line front end over the `rdcheckpoint` library: `checkpoint`,
//! `restore` and `inspect` subcommands. Thin by design -- all the real work
//! happens in the library; this binary only parses flags, drives the calls,
//! and renders results.

use rdcheckpoint::{checkpointer, codec, CheckpointOptions, RestoreOptions};
use serde::Serialize;
use std::fs;
use std::path::PathBuf;
use std::process::exit;
use structopt::StructOpt;

#[derive(StructOpt)]
#[structopt(name = "rdcp", about = "Checkpoint and restore a running process's state")]
enum Opt {
    /// Capture a process's registers, memory and file descriptors to disk.
    Checkpoint {
        #[structopt(long)]
        pid: i32,
        #[structopt(long)]
        name: String,
        #[structopt(long, parse(from_os_str))]
        out: PathBuf,
        #[structopt(long)]
        no_dump_heap: bool,
        #[structopt(long)]
        no_dump_stack: bool,
        #[structopt(long)]
        no_dump_anonymous: bool,
        #[structopt(long)]
        include_file_backed: bool,
        #[structopt(long)]
        no_save_fds: bool,
    },
    /// Restore a previously captured checkpoint into a live process.
    Restore {
        #[structopt(long = "in", parse(from_os_str))]
        input: PathBuf,
        #[structopt(long)]
        pid: i32,
        #[structopt(long = "continue")]
        cont: bool,
        #[structopt(long)]
        strict: bool,
    },
    /// Print a summary of a checkpoint artifact as JSON.
    Inspect {
        #[structopt(long = "in", parse(from_os_str))]
        input: PathBuf,
    },
}

#[derive(Serialize)]
struct InspectSummary {
    name: String,
    pid: i32,
    created_at: i64,
    aslr_policy: &'static str,
    region_count: usize,
    valid_region_count: usize,
    total_bytes: u64,
    fd_count: usize,
    restorable_fd_count: usize,
}

fn checkpoint_options_from_flags(
    no_dump_heap: bool,
    no_dump_stack: bool,
    no_dump_anonymous: bool,
    include_file_backed: bool,
    no_save_fds: bool,
) -> CheckpointOptions {
    let mut opts = CheckpointOptions::default();
    opts.dump_heap = !no_dump_heap;
    opts.dump_stack = !no_dump_stack;
    opts.dump_anonymous = !no_dump_anonymous;
    opts.include_file_backed = include_file_backed;
    opts.save_file_descriptors = !no_save_fds;
    opts
}

fn run() -> Result<(), String> {
    match Opt::from_args() {
        Opt::Checkpoint {
            pid,
            name,
            out,
            no_dump_heap,
            no_dump_stack,
            no_dump_anonymous,
            include_file_backed,
            no_save_fds,
        } => {
            let opts = checkpoint_options_from_flags(
                no_dump_heap,
                no_dump_stack,
                no_dump_anonymous,
                include_file_backed,
                no_save_fds,
            );
            log::info!("checkpointing pid {} as '{}'", pid, name);
            let checkpoint = checkpointer::create_checkpoint(pid, &name, &opts, None)
                .map_err(|e| format!("checkpoint failed: {}", e))?;
            let bytes = codec::encode(&checkpoint);
            fs::write(&out, &bytes).map_err(|e| format!("writing {}: {}", out.display(), e))?;
            println!(
                "wrote checkpoint '{}' ({} bytes, {} regions, {} fds) to {}",
                checkpoint.name,
                bytes.len(),
                checkpoint.memory_dumps.len(),
                checkpoint.fds.len(),
                out.display()
            );
            Ok(())
        }
        Opt::Restore { input, pid, cont, strict } => {
            let bytes = fs::read(&input).map_err(|e| format!("reading {}: {}", input.display(), e))?;
            let checkpoint = codec::decode(&bytes).map_err(|e| format!("decoding {}: {}", input.display(), e))?;

            let mut opts = RestoreOptions::default();
            opts.continue_after_restore = cont;
            opts.strict = strict;

            log::info!("restoring '{}' into pid {}", checkpoint.name, pid);
            let outcome = checkpointer::restore_checkpoint(pid, &checkpoint, &opts)
                .map_err(|e| format!("restore failed: {}", e))?;

            println!(
                "restore {}: {} regions restored, {} failed, {} skipped; {} fds restored, {} failed",
                if outcome.success { "succeeded" } else { "completed with errors" },
                outcome.regions_restored,
                outcome.regions_failed,
                outcome.regions_skipped,
                outcome.fds_restored,
                outcome.fds_failed,
            );
            for w in &outcome.warnings {
                log::warn!("restore: {}", w);
            }
            Ok(())
        }
        Opt::Inspect { input } => {
            let bytes = fs::read(&input).map_err(|e| format!("reading {}: {}", input.display(), e))?;
            let checkpoint = codec::decode(&bytes).map_err(|e| format!("decoding {}: {}", input.display(), e))?;

            let summary = InspectSummary {
                name: checkpoint.name.clone(),
                pid: checkpoint.pid,
                created_at: checkpoint.created_at,
                aslr_policy: match checkpoint.aslr_policy {
                    rdcheckpoint::aslr::AslrPolicy::Disabled => "disabled",
                    rdcheckpoint::aslr::AslrPolicy::Conservative => "conservative",
                    rdcheckpoint::aslr::AslrPolicy::Full => "full",
                },
                region_count: checkpoint.memory_dumps.len(),
                valid_region_count: checkpoint.memory_dumps.iter().filter(|d| d.valid()).count(),
                total_bytes: checkpoint.total_bytes(),
                fd_count: checkpoint.fds.len(),
                restorable_fd_count: checkpoint.fds.iter().filter(|f| f.restorable).count(),
            };
            println!(
                "{}",
                serde_json::to_string(&summary).map_err(|e| format!("serializing summary: {}", e))?
            );
            Ok(())
        }
    }
}

fn main() {
    env_logger::init();
    if let Err(msg) = run() {
        eprintln!("rdcp: {}", msg);
        exit(1);
    }
}
