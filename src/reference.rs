//! Reference-side client: launch the golden simulator, connect to its
//! trace port, discard the boot preamble, and drain retirement records
//! into the shared buffers.

use std::io::{self, Read};
use std::net::{Ipv4Addr, SocketAddr, TcpListener, TcpStream};
use std::sync::Arc;
use std::thread;

use log::{error, info, warn};

use crate::decoder::TraceDecoder;
use crate::error::DecoderError;
use crate::harness::{Core, ReferenceOptions};
use crate::process;

/// Picks a free port by binding port 0 and reading the assignment
/// back; the socket is released so the simulator can take the port.
pub(crate) fn find_available_port() -> io::Result<u16> {
    let listener = TcpListener::bind((Ipv4Addr::LOCALHOST, 0))?;
    Ok(listener.local_addr()?.port())
}

fn connect_with_retry(port: u16, options: &ReferenceOptions) -> io::Result<TcpStream> {
    let address = SocketAddr::from((Ipv4Addr::LOCALHOST, port));
    let mut attempts = 0;
    loop {
        match TcpStream::connect(address) {
            Ok(stream) => return Ok(stream),
            Err(e) => {
                attempts += 1;
                if attempts > options.connect_attempts {
                    return Err(e);
                }
                thread::sleep(options.connect_retry);
            }
        }
    }
}

// Consumes records up to and including the one whose next-PC is the
// ELF entry point, returning how many were discarded. `Ok(None)` means
// the stream ended first.
fn discard_until_entry<R>(
    decoder: &mut TraceDecoder<R>,
    entry_pc: u64,
) -> Result<Option<u64>, DecoderError>
where
    R: Read,
{
    let mut discarded = 0u64;
    loop {
        match decoder.read_record()? {
            Some(record) => {
                discarded += 1;
                if record.exec.pc.pc_wdata == entry_pc {
                    return Ok(Some(discarded));
                }
            }
            None => return Ok(None),
        }
    }
}

/// Body of the reference supervisor thread: runs the simulator to
/// completion and flags the peer dead on an abnormal exit.
pub(crate) fn run_supervisor(core: Arc<Core>, command: std::process::Command) {
    let clean = process::supervise(command, "the reference simulator", |pid| {
        core.set_reference_pid(pid)
    });
    if !clean {
        core.notify_sync(|sync| sync.ref_connected_or_dead = true);
    }
}

/// Body of the reference drain thread.
pub(crate) fn run_drain(core: Arc<Core>, port: u16) {
    let options = core.options.reference.clone();

    let stream = match connect_with_retry(port, &options) {
        Ok(stream) => stream,
        Err(e) => {
            error!(
                "could not connect to the reference simulator on port {}: {}",
                port, e
            );
            core.notify_sync(|sync| sync.ref_connected_or_dead = true);
            return;
        }
    };
    info!("connected to the reference simulator on port {}", port);
    // The shutdown path uses this handle to unblock the reads below.
    core.set_reference_stream(stream.try_clone().ok());

    let mut decoder = TraceDecoder::new(stream);
    let discarded = match discard_until_entry(&mut decoder, options.entry_pc) {
        Ok(Some(discarded)) => discarded,
        Ok(None) => {
            warn!("reference trace ended before the entry point");
            core.notify_sync(|sync| sync.ref_connected_or_dead = true);
            return;
        }
        Err(e) => {
            error!("reference trace stream failed during alignment: {}", e);
            core.notify_sync(|sync| sync.ref_connected_or_dead = true);
            return;
        }
    };
    info!(
        "reference trace aligned at {:#x} after discarding {} instructions",
        options.entry_pc, discarded
    );
    core.seed_order(discarded);

    let mut announced = false;
    loop {
        match decoder.read_record() {
            Ok(Some(record)) => {
                core.buffers.push_record(record);
                if !announced {
                    announced = true;
                    core.notify_sync(|sync| sync.ref_connected_or_dead = true);
                }
            }
            Ok(None) => {
                info!("reference trace stream closed");
                break;
            }
            Err(e) => {
                error!("reference trace stream error: {}", e);
                break;
            }
        }
    }
    core.notify_sync(|sync| sync.ref_connected_or_dead = true);
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::packet::{ExecutionPacketV2, PcData};

    fn record_bytes(pc_wdata: u64) -> Vec<u8> {
        let mut exec = ExecutionPacketV2::default();
        exec.pc = PcData {
            pc_rdata: pc_wdata.wrapping_sub(4),
            pc_wdata,
        };
        exec.trace_size = ExecutionPacketV2::wire_size(false, false);
        exec.to_bytes().to_vec()
    }

    #[test]
    fn discard_counts_through_the_entry_packet() {
        let mut stream = Vec::new();
        for pc in &[0x1004u64, 0x1008, 0x8000_0000, 0x8000_0004] {
            stream.extend(record_bytes(*pc));
        }
        let mut decoder = TraceDecoder::new(stream.as_slice());
        let discarded = discard_until_entry(&mut decoder, 0x8000_0000).unwrap();
        assert_eq!(discarded, Some(3));
        // The post-entry record is still in the stream.
        let next = decoder.read_record().unwrap().unwrap();
        assert_eq!(next.exec.pc.pc_wdata, 0x8000_0004);
    }

    #[test]
    fn discard_reports_a_stream_that_never_reaches_entry() {
        let mut stream = Vec::new();
        stream.extend(record_bytes(0x1004));
        stream.extend(record_bytes(0x1008));
        let mut decoder = TraceDecoder::new(stream.as_slice());
        assert_eq!(discard_until_entry(&mut decoder, 0x8000_0000).unwrap(), None);
    }

    #[test]
    fn available_port_is_nonzero_and_bindable() {
        let port = find_available_port().unwrap();
        assert_ne!(port, 0);
        TcpListener::bind((Ipv4Addr::LOCALHOST, port)).unwrap();
    }

    #[test]
    fn drain_aligns_seeds_the_order_counter_and_queues() {
        use crate::harness::{DutControl, HarnessOptions};
        use std::io::Write;
        use std::sync::atomic::{AtomicU64, Ordering};

        #[derive(Default)]
        struct RecordingDut {
            seeded: AtomicU64,
        }

        impl DutControl for RecordingDut {
            fn halt(&self) {}
            fn unhalt(&self) {}
            fn queue_finish(&self) {}
            fn set_rvfi_order(&self, order: u64) {
                self.seeded.store(order, Ordering::SeqCst);
            }
        }

        let listener = TcpListener::bind((Ipv4Addr::LOCALHOST, 0)).unwrap();
        let port = listener.local_addr().unwrap().port();
        let feeder = thread::spawn(move || {
            let (mut stream, _) = listener.accept().unwrap();
            // One boot record, the entry record, then two aligned
            // records; closing the socket ends the drain.
            for pc in &[0x100cu64, 0x8000_0000, 0x8000_0004, 0x8000_0008] {
                stream.write_all(&record_bytes(*pc)).unwrap();
            }
        });

        let dut = Arc::new(RecordingDut::default());
        let core = Arc::new(Core::new(
            HarnessOptions::default(),
            Arc::clone(&dut) as Arc<dyn DutControl>,
        ));
        run_drain(Arc::clone(&core), port);
        feeder.join().unwrap();

        assert_eq!(dut.seeded.load(Ordering::SeqCst), 2);
        assert_eq!(core.buffers.depths(), (2, 0, 0));
        assert!(!core.buffers.lock().trace_done);
        assert!(core.lock_sync().ref_connected_or_dead);
    }
}
