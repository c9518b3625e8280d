//! Subprocess and signal supervision.
//!
//! The harness launches two kinds of children: the stimulus engine and
//! the reference simulator. Both are watched by a supervisor thread
//! that reaps them and reports abnormal exits. For the harness
//! lifetime SIGPIPE is ignored and SIGINT routes into the shutdown
//! path; the dispositions that were in place before are restored when
//! the harness is finalised.

use std::env;
use std::path::{Path, PathBuf};
use std::process::Command;
use std::sync::{Arc, Mutex, PoisonError};

use log::{debug, error, info};
use nix::sys::signal::{self, SaFlags, SigAction, SigHandler, SigSet, Signal};
use nix::unistd::Pid;

use crate::harness::{Core, HarnessOptions, ReferenceOptions};

/// Root of the reference simulator build tree, when the environment
/// names one.
pub(crate) fn sail_root_env() -> Option<PathBuf> {
    env::var_os("SAIL_RISCV").map(PathBuf::from)
}

/// Command line for the stimulus engine, connecting back to the given
/// harness port.
pub(crate) fn engine_command(options: &HarnessOptions, port: u16) -> Command {
    let mut command = Command::new(&options.engine_program);
    command
        .arg("--implementation-B-port")
        .arg(port.to_string())
        .arg("--no-shrink")
        .arg("--no-save")
        .arg("--test-len")
        .arg(options.test_len.to_string());
    if options.num_tests != 0 {
        command.arg("-n").arg(options.num_tests.to_string());
    }
    if let Some(root) = sail_root_env() {
        command
            .arg("--path-to-sail-riscv-dir")
            .arg(root.join("build").join("c_emulator"));
    }
    command
}

/// Command line for the reference simulator, emitting its trace on the
/// given port.
pub(crate) fn reference_command(options: &ReferenceOptions, port: u16, elf: &Path) -> Command {
    let program = match &options.simulator {
        Some(path) => path.clone(),
        None => sail_root_env()
            .unwrap_or_else(|| PathBuf::from("../sail-riscv"))
            .join("build")
            .join("c_emulator")
            .join("riscv_sim_rv32d"),
    };
    let mut command = Command::new(program);
    command
        // disable compressed, writable misa, F and the vector extension
        .args(&["-C", "-I", "-F", "-W"])
        .args(&["-Vinstr", "-Vreg", "-Vmem", "-Vplatform"])
        .arg("-e")
        .arg(port.to_string())
        .arg("-p")
        .arg(elf);
    command
}

/// Spawns `command`, records its pid through `record_pid`, and reaps
/// it. Returns whether the child exited cleanly.
pub(crate) fn supervise<F>(mut command: Command, name: &str, record_pid: F) -> bool
where
    F: Fn(Option<Pid>),
{
    info!("starting {}: {:?}", name, command);
    let mut child = match command.spawn() {
        Ok(child) => child,
        Err(e) => {
            error!("failed to start {}: {}", name, e);
            return false;
        }
    };
    record_pid(Some(Pid::from_raw(child.id() as i32)));
    let status = child.wait();
    record_pid(None);
    match status {
        Ok(status) if status.success() => {
            info!("{} exited cleanly", name);
            true
        }
        Ok(status) => {
            error!(
                "{} exited abnormally ({}); attempting graceful shutdown",
                name, status
            );
            false
        }
        Err(e) => {
            error!("failed to reap {}: {}", name, e);
            false
        }
    }
}

pub(crate) fn kill_process(pid: Pid) {
    info!("killing subprocess {}", pid);
    if let Err(e) = signal::kill(pid, Signal::SIGKILL) {
        debug!("failed to kill subprocess {}: {}", pid, e);
    }
}

// The harness instance the SIGINT handler routes into.
static SHUTDOWN_TARGET: Mutex<Option<Arc<Core>>> = Mutex::new(None);

pub(crate) fn register_shutdown_target(core: &Arc<Core>) {
    *SHUTDOWN_TARGET
        .lock()
        .unwrap_or_else(PoisonError::into_inner) = Some(Arc::clone(core));
}

pub(crate) fn clear_shutdown_target(core: &Arc<Core>) {
    let mut target = SHUTDOWN_TARGET
        .lock()
        .unwrap_or_else(PoisonError::into_inner);
    if let Some(active) = target.as_ref() {
        if Arc::ptr_eq(active, core) {
            *target = None;
        }
    }
}

extern "C" fn handle_sigint(signum: nix::libc::c_int) {
    let target = SHUTDOWN_TARGET
        .lock()
        .unwrap_or_else(PoisonError::into_inner)
        .clone();
    if let Some(core) = target {
        error!(
            "interrupt signal ({}) received; shutting down the harness threads",
            signum
        );
        core.shutdown();
    }
}

/// Holds the signal dispositions that were active before the harness
/// installed its own, so `restore` can put them back.
pub(crate) struct SignalGuard {
    previous_pipe: SigAction,
    previous_int: SigAction,
}

impl SignalGuard {
    pub fn install() -> nix::Result<SignalGuard> {
        // Socket writes to a vanished peer must return EPIPE rather
        // than terminate the host simulator.
        let ignore = SigAction::new(SigHandler::SigIgn, SaFlags::empty(), SigSet::empty());
        let handler = SigAction::new(
            SigHandler::Handler(handle_sigint),
            SaFlags::empty(),
            SigSet::empty(),
        );
        let previous_pipe = unsafe { signal::sigaction(Signal::SIGPIPE, &ignore)? };
        let previous_int = match unsafe { signal::sigaction(Signal::SIGINT, &handler) } {
            Ok(previous) => previous,
            Err(e) => {
                unsafe {
                    let _ = signal::sigaction(Signal::SIGPIPE, &previous_pipe);
                }
                return Err(e);
            }
        };
        Ok(SignalGuard {
            previous_pipe,
            previous_int,
        })
    }

    pub fn restore(self) {
        unsafe {
            let _ = signal::sigaction(Signal::SIGPIPE, &self.previous_pipe);
            let _ = signal::sigaction(Signal::SIGINT, &self.previous_int);
        }
    }
}
