//! Shared scaffolding for the integration tests: spawning the counter
//! harness fixture and probing whether this environment actually allows
//! `ptrace` (sandboxed/containerized CI commonly disables it).

use std::io::{BufRead, BufReader};
use std::process::{Child, Command, Stdio};

pub struct Harness {
    pub child: Child,
    pub pid: i32,
    pub counter_addr: u64,
}

impl Harness {
    pub fn spawn() -> Harness {
        let mut child = Command::new(env!("CARGO_BIN_EXE_counter_harness"))
            .stdout(Stdio::piped())
            .spawn()
            .expect("failed to spawn counter_harness fixture");

        let pid = child.id() as i32;
        let stdout = child.stdout.take().expect("harness stdout not piped");
        let mut reader = BufReader::new(stdout);
        let mut line = String::new();
        reader.read_line(&mut line).expect("failed to read harness address line");
        let counter_addr: u64 = line.trim().parse().expect("harness did not print a valid address");

        // Give the harness a moment to get into its steady-state loop before
        // a test attaches to it.
        std::thread::sleep(std::time::Duration::from_millis(20));

        Harness { child, pid, counter_addr }
    }
}

impl Drop for Harness {
    fn drop(&mut self) {
        let _ = self.child.kill();
        let _ = self.child.wait();
    }
}

/// Returns `true` if this process can actually `ptrace` a child of its own,
/// i.e. the test environment doesn't have Yama's `ptrace_scope` (or a
/// container seccomp profile) blocking it outright.
pub fn ptrace_available() -> bool {
    use nix::sys::ptrace;
    use nix::sys::wait::{waitpid, WaitPidFlag};
    use nix::unistd::{fork, ForkResult};

    match unsafe { fork() } {
        Ok(ForkResult::Child) => {
            // Keep the child alive long enough for the parent's probe.
            std::thread::sleep(std::time::Duration::from_millis(200));
            std::process::exit(0);
        }
        Ok(ForkResult::Parent { child }) => {
            std::thread::sleep(std::time::Duration::from_millis(5));
            let attached = ptrace::attach(child).is_ok();
            if attached {
                let _ = waitpid(child, Some(WaitPidFlag::WNOHANG));
                let _ = ptrace::detach(child);
            }
            let _ = nix::sys::signal::kill(child, nix::sys::signal::Signal::SIGKILL);
            let _ = waitpid(child, None);
            attached
        }
        Err(_) => false,
    }
}

macro_rules! skip_unless_ptrace {
    () => {
        if !common::ptrace_available() {
            eprintln!("skipping: ptrace is not available in this environment");
            return;
        }
    };
}

pub(crate) use skip_unless_ptrace;
