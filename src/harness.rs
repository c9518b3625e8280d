//! Harness orchestration: thread lifecycle, the DUT-shim interface and
//! the current packet under construction.

use std::io;
use std::net::{Shutdown, TcpStream};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Condvar, Mutex, MutexGuard, PoisonError};
use std::thread::{self, JoinHandle};
use std::time::Duration;

use log::info;
use nix::unistd::Pid;

use crate::buffers::TraceBuffers;
use crate::compare;
use crate::error::HarnessError;
use crate::packet::{ExecutionPacketV2, IntegerExtension, MemAccessExtension};
use crate::process::{self, SignalGuard};
use crate::reference;
use crate::server;

/// Callbacks into the host simulator, invoked by the engine-side
/// server and the reference drain.
pub trait DutControl: Send + Sync {
    /// Stop the DUT from fetching. Issued on reset commands and after
    /// version negotiation (a session starts halted).
    fn halt(&self);

    /// Resume fetching; issued on the first injection after a halt.
    fn unhalt(&self);

    /// The engine has disconnected and no further instructions will
    /// arrive.
    fn queue_finish(&self);

    /// Seed the DUT's retirement order counter so that both sides
    /// number instructions identically after the boot preamble.
    fn set_rvfi_order(&self, order: u64);
}

/// Settings for [`Harness::initialize`].
#[derive(Debug, Clone)]
pub struct HarnessOptions {
    /// Port the engine-side server listens on; 0 picks an ephemeral
    /// port.
    pub port: u16,

    /// Whether to launch the stimulus engine as a subprocess. When
    /// false an external engine is expected to connect.
    pub spawn_engine: bool,

    /// Test count handed to the engine; 0 leaves the engine's default.
    pub num_tests: u32,

    /// Instructions per generated test, handed to the engine.
    pub test_len: u32,

    /// Engine executable.
    pub engine_program: PathBuf,

    /// Reference-side settings.
    pub reference: ReferenceOptions,
}

impl Default for HarnessOptions {
    fn default() -> HarnessOptions {
        HarnessOptions {
            port: 0,
            spawn_engine: true,
            num_tests: 0,
            test_len: 10_000,
            engine_program: PathBuf::from("runTestRIG"),
            reference: ReferenceOptions::default(),
        }
    }
}

/// Settings for the reference simulator connection.
#[derive(Debug, Clone)]
pub struct ReferenceOptions {
    /// Simulator executable; defaults to
    /// `$SAIL_RISCV/build/c_emulator/riscv_sim_rv32d`.
    pub simulator: Option<PathBuf>,

    /// PC value that marks the end of the boot preamble.
    pub entry_pc: u64,

    /// How often to retry the trace-port connection while the
    /// simulator starts up.
    pub connect_attempts: u32,

    /// Delay between connection attempts.
    pub connect_retry: Duration,
}

impl Default for ReferenceOptions {
    fn default() -> ReferenceOptions {
        ReferenceOptions {
            simulator: None,
            entry_pc: 0x8000_0000,
            connect_attempts: 20,
            connect_retry: Duration::from_micros(500),
        }
    }
}

/// The execution packet currently under construction by the DUT shim's
/// field setters, with both extensions kept alongside. Overwritten
/// between commits, never reset.
#[derive(Debug, Clone, Copy, Default)]
pub(crate) struct DutPacket {
    pub exec: ExecutionPacketV2,
    pub integer: IntegerExtension,
    pub memory: MemAccessExtension,
}

/// Startup/shutdown flags guarded by the coordination lock.
pub(crate) struct SyncState {
    /// Listener outcome, published once by the server thread. The
    /// bound port on success, the bind error otherwise.
    pub server_up: Option<Result<u16, io::Error>>,

    /// Bound port, for introspection after `server_up` is consumed.
    pub port: u16,

    pub engine_connected_or_dead: bool,
    pub ref_connected_or_dead: bool,
    pub time_to_exit: bool,
}

/// Thread handles, child pids and the reference socket, guarded by the
/// dedicated shutdown lock.
#[derive(Default)]
pub(crate) struct ShutdownState {
    pub engine_pid: Option<Pid>,
    pub reference_pid: Option<Pid>,
    pub server: Option<JoinHandle<()>>,
    pub engine_launcher: Option<JoinHandle<()>>,
    pub ref_supervisor: Option<JoinHandle<()>>,
    pub ref_drain: Option<JoinHandle<()>>,
    pub ref_stream: Option<TcpStream>,
}

/// Shared state behind a [`Harness`]; also reachable from the SIGINT
/// handler.
pub(crate) struct Core {
    pub(crate) options: HarnessOptions,
    pub(crate) dut: Arc<dyn DutControl>,
    pub(crate) buffers: TraceBuffers,
    pub(crate) engine_halted: AtomicBool,
    retire_order: AtomicU64,
    dut_packet: Mutex<DutPacket>,
    sync: Mutex<SyncState>,
    cond: Condvar,
    engine: Mutex<Option<TcpStream>>,
    shutdown: Mutex<ShutdownState>,
    signals: Mutex<Option<SignalGuard>>,
}

impl Core {
    pub(crate) fn new(options: HarnessOptions, dut: Arc<dyn DutControl>) -> Core {
        Core {
            options,
            dut,
            buffers: TraceBuffers::new(),
            engine_halted: AtomicBool::new(true),
            retire_order: AtomicU64::new(0),
            dut_packet: Mutex::new(DutPacket::default()),
            sync: Mutex::new(SyncState {
                server_up: None,
                port: 0,
                engine_connected_or_dead: false,
                ref_connected_or_dead: false,
                time_to_exit: false,
            }),
            cond: Condvar::new(),
            engine: Mutex::new(None),
            shutdown: Mutex::new(ShutdownState::default()),
            signals: Mutex::new(None),
        }
    }

    pub(crate) fn lock_sync(&self) -> MutexGuard<SyncState> {
        self.sync.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub(crate) fn wait_sync<'a>(
        &self,
        guard: MutexGuard<'a, SyncState>,
    ) -> MutexGuard<'a, SyncState> {
        self.cond
            .wait(guard)
            .unwrap_or_else(PoisonError::into_inner)
    }

    /// Mutates the coordination flags and wakes every waiter.
    pub(crate) fn notify_sync<F>(&self, update: F)
    where
        F: FnOnce(&mut SyncState),
    {
        let mut sync = self.lock_sync();
        update(&mut sync);
        drop(sync);
        self.cond.notify_all();
    }

    pub(crate) fn time_to_exit(&self) -> bool {
        self.lock_sync().time_to_exit
    }

    fn lock_shutdown(&self) -> MutexGuard<ShutdownState> {
        self.shutdown.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn lock_dut_packet(&self) -> MutexGuard<DutPacket> {
        self.dut_packet
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
    }

    pub(crate) fn set_engine_stream(&self, stream: TcpStream) {
        *self.engine.lock().unwrap_or_else(PoisonError::into_inner) = Some(stream);
    }

    pub(crate) fn clear_engine_stream(&self) {
        self.engine
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
    }

    /// A per-use duplicate of the engine connection, so no lock is held
    /// across socket I/O.
    pub(crate) fn engine_stream(&self) -> Option<TcpStream> {
        self.engine
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .as_ref()
            .and_then(|stream| stream.try_clone().ok())
    }

    pub(crate) fn set_engine_pid(&self, pid: Option<Pid>) {
        self.lock_shutdown().engine_pid = pid;
    }

    pub(crate) fn set_reference_pid(&self, pid: Option<Pid>) {
        self.lock_shutdown().reference_pid = pid;
    }

    pub(crate) fn set_reference_stream(&self, stream: Option<TcpStream>) {
        self.lock_shutdown().ref_stream = stream;
    }

    /// Seeds the retirement order counter with the reference's discard
    /// count and mirrors it to the DUT shim.
    pub(crate) fn seed_order(&self, discarded: u64) {
        self.retire_order.store(discarded, Ordering::SeqCst);
        self.dut.set_rvfi_order(discarded);
    }

    /// The shutdown path: kill both children, raise the exit flag,
    /// wake every waiter, join the harness threads. Serialised by the
    /// shutdown lock; a second call finds nothing left to do.
    pub(crate) fn shutdown(&self) {
        let handles = {
            let mut state = self.lock_shutdown();
            if let Some(pid) = state.engine_pid.take() {
                process::kill_process(pid);
            }
            if let Some(pid) = state.reference_pid.take() {
                process::kill_process(pid);
            }
            if let Some(stream) = state.ref_stream.take() {
                let _ = stream.shutdown(Shutdown::Both);
            }
            [
                state.server.take(),
                state.engine_launcher.take(),
                state.ref_supervisor.take(),
                state.ref_drain.take(),
            ]
        };
        self.notify_sync(|sync| sync.time_to_exit = true);
        // Joins happen with no lock held: the exiting threads may still
        // need the coordination or shutdown locks on their way out.
        for handle in handles {
            if let Some(handle) = handle {
                let _ = handle.join();
            }
        }
    }
}

fn run_engine_launcher(core: Arc<Core>, port: u16) {
    let command = process::engine_command(&core.options, port);
    let clean = process::supervise(command, "the stimulus engine", |pid| {
        core.set_engine_pid(pid)
    });
    if !clean {
        core.notify_sync(|sync| {
            sync.time_to_exit = true;
            sync.engine_connected_or_dead = true;
        });
    }
}

/// The RVFI-DII harness: an engine-side server, an optional
/// reference-side client, and the comparator between them.
///
/// One instance drives one verification session. The host simulator
/// calls [`initialize`](Harness::initialize) once, the field setters
/// and [`commit_v2`](Harness::commit_v2)/[`compare`](Harness::compare)
/// once per retired instruction, and [`finalize`](Harness::finalize)
/// at the end (also run on drop).
pub struct Harness {
    core: Arc<Core>,
}

impl Harness {
    /// Starts the engine-side server (and optionally the engine
    /// subprocess), then blocks until the engine has connected and
    /// negotiated the v2 trace format, or died trying.
    pub fn initialize(
        options: HarnessOptions,
        dut: Arc<dyn DutControl>,
    ) -> Result<Harness, HarnessError> {
        let core = Arc::new(Core::new(options, dut));

        let guard = SignalGuard::install().map_err(HarnessError::Signals)?;
        *core.signals.lock().unwrap_or_else(PoisonError::into_inner) = Some(guard);
        process::register_shutdown_target(&core);

        let server_core = Arc::clone(&core);
        let server = thread::Builder::new()
            .name("dii-engine-server".into())
            .spawn(move || server::run_server(&server_core))
            .map_err(|e| abort_initialize(&core, HarnessError::Thread(e)))?;
        core.lock_shutdown().server = Some(server);

        // Wait for the listener to come up and learn the bound port.
        let port = {
            let mut sync = core.lock_sync();
            while sync.server_up.is_none() {
                sync = core.wait_sync(sync);
            }
            match sync.server_up.take() {
                Some(Ok(port)) => port,
                Some(Err(e)) => {
                    drop(sync);
                    return Err(abort_initialize(&core, HarnessError::Listen(e)));
                }
                None => unreachable!(),
            }
        };

        if core.options.spawn_engine {
            let launcher_core = Arc::clone(&core);
            let launcher = thread::Builder::new()
                .name("dii-engine-launcher".into())
                .spawn(move || run_engine_launcher(launcher_core, port))
                .map_err(|e| abort_initialize(&core, HarnessError::Thread(e)))?;
            core.lock_shutdown().engine_launcher = Some(launcher);
        }

        // Wait for the engine to connect, or for its launcher to give
        // up.
        let mut sync = core.lock_sync();
        while !sync.engine_connected_or_dead && !sync.time_to_exit {
            sync = core.wait_sync(sync);
        }
        drop(sync);

        Ok(Harness { core })
    }

    /// Shuts the harness down: children killed, threads joined, signal
    /// dispositions restored. Safe to call more than once.
    pub fn finalize(&self) {
        info!("finalizing the harness");
        self.core.shutdown();
        process::clear_shutdown_target(&self.core);
        if let Some(guard) = self
            .core
            .signals
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take()
        {
            guard.restore();
        }
        self.core.buffers.finish();
    }

    /// The port the engine-side server is listening on.
    pub fn engine_port(&self) -> u16 {
        self.core.lock_sync().port
    }

    /// Populates the metadata block of the current packet. The order
    /// field is managed by the harness and stamped at commit.
    pub fn set_inst_meta(
        &self,
        insn: u64,
        trap: u8,
        halt: u8,
        intr: u8,
        mode: u8,
        ixl: u8,
        valid: u8,
    ) {
        let mut packet = self.core.lock_dut_packet();
        packet.exec.meta.insn = insn;
        packet.exec.meta.trap = trap;
        packet.exec.meta.halt = halt;
        packet.exec.meta.intr = intr;
        packet.exec.meta.mode = mode;
        packet.exec.meta.ixl = ixl;
        packet.exec.meta.valid = valid;
    }

    /// Populates the PC block of the current packet.
    pub fn set_pc(&self, pc_rdata: u64, pc_wdata: u64) {
        let mut packet = self.core.lock_dut_packet();
        packet.exec.pc.pc_rdata = pc_rdata;
        packet.exec.pc.pc_wdata = pc_wdata;
    }

    /// Populates the integer extension of the current packet.
    pub fn set_integer_ext(
        &self,
        rd_wdata: u64,
        rs1_rdata: u64,
        rs2_rdata: u64,
        rd_addr: u8,
        rs1_addr: u8,
        rs2_addr: u8,
    ) {
        let mut packet = self.core.lock_dut_packet();
        packet.integer = IntegerExtension {
            // x0 is hardwired to zero; a write to it must not report a
            // value.
            rd_wdata: if rd_addr == 0 { 0 } else { rd_wdata },
            rs1_rdata,
            rs2_rdata,
            rd_addr,
            rs1_addr,
            rs2_addr,
        };
    }

    /// Populates the memory extension of the current packet.
    pub fn set_mem_ext(&self, rdata: [u64; 4], wdata: [u64; 4], rmask: u32, wmask: u32, addr: u64) {
        let mut packet = self.core.lock_dut_packet();
        packet.memory = MemAccessExtension {
            rdata,
            wdata,
            rmask,
            wmask,
            addr,
        };
    }

    /// Finalises the current packet (order stamp, availability flags,
    /// trace size) and sends it to the engine.
    pub fn commit_v2(&self, int_avail: bool, mem_avail: bool) {
        let mut packet = self.core.lock_dut_packet();
        packet.exec.meta.order = self.core.retire_order.fetch_add(1, Ordering::SeqCst);
        packet.exec.set_available(int_avail, mem_avail);
        packet.exec.trace_size = ExecutionPacketV2::wire_size(int_avail, mem_avail);
        server::send_execution_packet(&self.core, &packet);
    }

    /// Blocks for the next injection from the engine; returns 0 once
    /// the engine has disconnected.
    pub fn next_instr(&self) -> u32 {
        server::next_instr(&self.core)
    }

    /// Compares the current packet against the head of the reference
    /// queue. `time` is a host timestamp used in diagnostics only.
    pub fn compare(&self, time: u64) {
        let packet = self.core.lock_dut_packet();
        compare::compare_retirement(&self.core.buffers, &packet, time);
    }

    /// Number of field disagreements observed so far.
    pub fn mismatch_count(&self) -> i32 {
        self.core.buffers.mismatch_count() as i32
    }

    /// Launches the reference simulator for `elf` and blocks until its
    /// trace is aligned past the boot preamble and flowing, or the
    /// simulator has died.
    pub fn init_ref_model(&self, elf: &Path) -> Result<(), HarnessError> {
        {
            let state = self.core.lock_shutdown();
            if state.ref_supervisor.is_some() || state.ref_drain.is_some() {
                return Err(HarnessError::RefAlreadyRunning);
            }
        }
        let port = reference::find_available_port().map_err(HarnessError::PortDiscovery)?;
        self.core
            .notify_sync(|sync| sync.ref_connected_or_dead = false);

        let command = process::reference_command(&self.core.options.reference, port, elf);
        let supervisor_core = Arc::clone(&self.core);
        let supervisor = thread::Builder::new()
            .name("dii-ref-supervisor".into())
            .spawn(move || reference::run_supervisor(supervisor_core, command))
            .map_err(HarnessError::Thread)?;
        let drain_core = Arc::clone(&self.core);
        let drain = thread::Builder::new()
            .name("dii-ref-drain".into())
            .spawn(move || reference::run_drain(drain_core, port))
            .map_err(HarnessError::Thread)?;
        {
            let mut state = self.core.lock_shutdown();
            state.ref_supervisor = Some(supervisor);
            state.ref_drain = Some(drain);
        }

        let mut sync = self.core.lock_sync();
        while !sync.ref_connected_or_dead && !sync.time_to_exit {
            sync = self.core.wait_sync(sync);
        }
        Ok(())
    }

    /// Tears the reference side down: unblocks and joins both threads,
    /// kills the simulator if it is still alive, and clears the
    /// queues.
    pub fn finalize_ref_model(&self) {
        let (supervisor, drain, stream, pid) = {
            let mut state = self.core.lock_shutdown();
            (
                state.ref_supervisor.take(),
                state.ref_drain.take(),
                state.ref_stream.take(),
                state.reference_pid.take(),
            )
        };
        if let Some(stream) = stream {
            let _ = stream.shutdown(Shutdown::Both);
        }
        if let Some(pid) = pid {
            process::kill_process(pid);
        }
        if let Some(handle) = drain {
            let _ = handle.join();
        }
        if let Some(handle) = supervisor {
            let _ = handle.join();
        }
        self.core.buffers.finish();
    }
}

impl Drop for Harness {
    fn drop(&mut self) {
        self.finalize();
    }
}

// Undoes the partial setup of a failed `initialize`.
fn abort_initialize(core: &Arc<Core>, error: HarnessError) -> HarnessError {
    core.shutdown();
    process::clear_shutdown_target(core);
    if let Some(guard) = core
        .signals
        .lock()
        .unwrap_or_else(PoisonError::into_inner)
        .take()
    {
        guard.restore();
    }
    error
}
