//! Engine-side server: listen for the stimulus engine, negotiate the
//! trace version, then serve one injection command per request.
//!
//! The handshake runs on the server thread. Steady-state traffic is
//! driven from the host simulator's thread through [`next_instr`] and
//! [`send_execution_packet`]; the server thread parks until shutdown
//! once the connection is up.

use std::io::{self, ErrorKind, Read, Write};
use std::net::{Ipv4Addr, SocketAddr, TcpStream};
use std::process;
use std::sync::atomic::Ordering;
use std::time::Duration;

use log::{debug, error, info};
use socket2::{Domain, Protocol, Socket, Type};

use crate::decoder::read_wire;
use crate::harness::{Core, DutControl, DutPacket};
use crate::packet::{
    version_select_reply, ExecutionPacketV1, ExecutionPacketV2, InstructionPacket,
    CMD_INSTRUCTION, CMD_RESET, CMD_VERSION_SELECT, VERSION_NEGOTIATE_INSN,
};

// How long an `accept` attempt may block before the loop polls the
// exit flag again.
const ACCEPT_TIMEOUT: Duration = Duration::from_secs(2);

#[derive(Debug)]
enum HandshakeError {
    Io(io::Error),
    UnexpectedPacket {
        stage: &'static str,
        packet: InstructionPacket,
    },
}

fn bind_listener(port: u16) -> io::Result<(Socket, u16)> {
    let socket = Socket::new(Domain::IPV4, Type::STREAM, Some(Protocol::TCP))?;
    socket.set_reuse_address(true)?;
    socket.set_reuse_port(true)?;
    socket.set_read_timeout(Some(ACCEPT_TIMEOUT))?;
    let address = SocketAddr::from((Ipv4Addr::UNSPECIFIED, port));
    socket.bind(&address.into())?;
    socket.listen(3)?;
    let bound = socket
        .local_addr()?
        .as_socket()
        .map(|address| address.port())
        .unwrap_or(port);
    Ok((socket, bound))
}

/// Body of the engine-server thread.
pub(crate) fn run_server(core: &Core) {
    let (listener, port) = match bind_listener(core.options.port) {
        Ok(bound) => bound,
        Err(e) => {
            core.notify_sync(|sync| sync.server_up = Some(Err(e)));
            return;
        }
    };
    core.notify_sync(|sync| {
        sync.port = port;
        sync.server_up = Some(Ok(port));
    });
    info!("ready for an engine connection on port {}", port);

    let stream: TcpStream = loop {
        match listener.accept() {
            Ok((socket, _)) => break socket.into(),
            Err(e) if e.kind() == ErrorKind::WouldBlock || e.kind() == ErrorKind::TimedOut => {
                if core.time_to_exit() {
                    return;
                }
            }
            Err(e) => {
                error!("accept failed: {}", e);
                process::exit(1);
            }
        }
    };
    // Accepted sockets inherit the listener's receive timeout; the
    // injection stream must block indefinitely instead.
    if let Err(e) = stream.set_read_timeout(None) {
        debug!("could not clear the receive timeout: {}", e);
    }
    info!("engine connection established");

    match negotiate(&mut &stream, &*core.dut) {
        Ok(()) => {}
        Err(HandshakeError::Io(e)) => {
            error!("engine connection failed during the handshake: {}", e);
            process::exit(1);
        }
        Err(HandshakeError::UnexpectedPacket { stage, packet }) => {
            error!(
                "unexpected packet during {}:\n  padding: {:#x}\n  cmd: {:#x}\n  time: {:#x}\n  insn: {:#x}",
                stage, packet.padding, packet.cmd, packet.time, packet.insn
            );
            process::exit(1);
        }
    }

    core.set_engine_stream(stream);
    core.notify_sync(|sync| sync.engine_connected_or_dead = true);

    // Nothing left to do on this thread until shutdown; steady-state
    // traffic runs on the host simulator's thread.
    let mut sync = core.lock_sync();
    while !sync.time_to_exit {
        sync = core.wait_sync(sync);
    }
    drop(sync);

    info!("engine server thread exiting");
    core.clear_engine_stream();
}

/// Runs the two-step version handshake: a reset carrying `"VERS"`
/// answered with the byte-reversed v1 record, then a v2 selection
/// answered with the 16-byte version reply.
fn negotiate<S>(stream: &mut S, dut: &dyn DutControl) -> Result<(), HandshakeError>
where
    S: Read + Write,
{
    let mut buf = [0; InstructionPacket::WIRE_SIZE];
    stream.read_exact(&mut buf).map_err(HandshakeError::Io)?;
    let command = InstructionPacket::from_bytes(&buf);
    if command.cmd != CMD_RESET || command.insn != VERSION_NEGOTIATE_INSN {
        return Err(HandshakeError::UnexpectedPacket {
            stage: "version negotiation",
            packet: command,
        });
    }
    info!("received the version negotiation packet");
    let reply = ExecutionPacketV1 {
        halt: 0x3,
        ..Default::default()
    };
    stream
        .write_all(&reply.to_reversed_bytes())
        .map_err(HandshakeError::Io)?;
    dut.halt();

    stream.read_exact(&mut buf).map_err(HandshakeError::Io)?;
    let command = InstructionPacket::from_bytes(&buf);
    if command.cmd != CMD_VERSION_SELECT || command.insn != 2 {
        return Err(HandshakeError::UnexpectedPacket {
            stage: "v2 trace selection",
            packet: command,
        });
    }
    info!("engine requested the v2 trace format");
    stream
        .write_all(&version_select_reply(command.insn.into()))
        .map_err(HandshakeError::Io)?;
    Ok(())
}

/// Blocks for the next injection command from the engine.
///
/// Reset commands are answered with a halt packet and consumed here;
/// the call only returns for an instruction (the word to inject) or a
/// disconnect (zero, after signalling `queue_finish`).
pub(crate) fn next_instr(core: &Core) -> u32 {
    loop {
        let received = core.engine_stream().and_then(|stream| {
            let mut buf = [0; InstructionPacket::WIRE_SIZE];
            match read_wire(&mut &stream, &mut buf) {
                Ok(true) => Some(InstructionPacket::from_bytes(&buf)),
                Ok(false) | Err(_) => None,
            }
        });
        let command = match received {
            Some(command) => command,
            None => {
                info!("engine disconnected; finishing the instruction queue");
                core.dut.queue_finish();
                return 0;
            }
        };

        match command.cmd {
            CMD_RESET => {
                let mut exec = ExecutionPacketV2::default();
                exec.trace_size = ExecutionPacketV2::wire_size(false, false);
                exec.meta.halt = 1;
                send_bytes(core, &exec.to_bytes());
                core.dut.halt();
                core.engine_halted.store(true, Ordering::SeqCst);
            }
            CMD_INSTRUCTION => {
                if core.engine_halted.swap(false, Ordering::SeqCst) {
                    core.dut.unhalt();
                }
                return command.insn;
            }
            _ => return command.insn,
        }
    }
}

/// Sends the committed DUT packet, extensions included, back to the
/// engine.
pub(crate) fn send_execution_packet(core: &Core, dut: &DutPacket) {
    let mut buf = Vec::with_capacity(dut.exec.trace_size as usize);
    buf.extend_from_slice(&dut.exec.to_bytes());
    if dut.exec.integer_data_available() {
        buf.extend_from_slice(&dut.integer.to_bytes());
    }
    if dut.exec.memory_access_data_available() {
        buf.extend_from_slice(&dut.memory.to_bytes());
    }
    send_bytes(core, &buf);
}

fn send_bytes(core: &Core, bytes: &[u8]) {
    let stream = match core.engine_stream() {
        Some(stream) => stream,
        None => {
            debug!("dropping a {}-byte send: no engine connection", bytes.len());
            return;
        }
    };
    if let Err(e) = (&stream).write_all(bytes) {
        // The peer is gone; shutdown is imminent.
        debug!(
            "dropping a {}-byte send after engine disconnect: {}",
            bytes.len(),
            e
        );
    }
}
