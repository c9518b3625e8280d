//! Per-retired-instruction comparison of the DUT trace against the
//! reference trace.

use log::{error, warn};

use crate::buffers::TraceBuffers;
use crate::harness::DutPacket;

// Expands the low 8 bits of an access mask so that mask bit i selects
// byte i of a 64-bit word.
fn byte_select(mask: u32) -> u64 {
    let mut out = 0u64;
    for i in 0..8 {
        if mask & (1 << i) != 0 {
            out |= 0xff << (8 * i);
        }
    }
    out
}

fn report_mismatch(kind: &str, time: u64, pc: u64, dut: u64, reference: u64) {
    error!(
        "reference model mismatch: {}\n  at t={}\n  DUT PC = {:#x}\n  DUT: {:#x}\n  ref: {:#x}",
        kind, time, pc, dut, reference
    );
}

/// Compares the current DUT packet against the head of the reference
/// queue, consuming the head (and its extension entries) and accounting
/// one mismatch per disagreeing field.
///
/// `rvfi_valid` and the rs1/rs2 fields of the integer extension are
/// not compared: the reference model does not report them
/// consistently. Memory extension values are not compared when the DUT
/// trapped, but the queue entry is still consumed.
pub(crate) fn compare_retirement(buffers: &TraceBuffers, dut: &DutPacket, time: u64) {
    let mut inner = buffers.lock();

    let reference = match inner.exec.front() {
        Some(packet) => *packet,
        None => {
            // The reference drain has not caught up yet; the caller
            // retries on a later cycle.
            warn!("no reference trace queued at t={}", time);
            return;
        }
    };

    if inner.trace_done {
        return;
    }

    let pc = dut.exec.pc.pc_rdata;
    let mut mismatches = 0u32;
    let mut check = |kind: &str, dut_value: u64, ref_value: u64| {
        if dut_value != ref_value {
            report_mismatch(kind, time, pc, dut_value, ref_value);
            mismatches += 1;
        }
    };

    check("order", dut.exec.meta.order, reference.meta.order);
    check("current PC", dut.exec.pc.pc_rdata, reference.pc.pc_rdata);
    check("next PC", dut.exec.pc.pc_wdata, reference.pc.pc_wdata);
    check("insn", dut.exec.meta.insn, reference.meta.insn);
    check("trap", dut.exec.meta.trap.into(), reference.meta.trap.into());
    check("halt", dut.exec.meta.halt.into(), reference.meta.halt.into());
    check("intr", dut.exec.meta.intr.into(), reference.meta.intr.into());
    check("mode", dut.exec.meta.mode.into(), reference.meta.mode.into());
    check("ixl", dut.exec.meta.ixl.into(), reference.meta.ixl.into());

    let dut_integer = dut.exec.integer_data_available();
    let ref_integer = reference.integer_data_available();
    if dut_integer != ref_integer {
        check(
            "integer data available",
            dut_integer.into(),
            ref_integer.into(),
        );
    }

    let dut_memory = dut.exec.memory_access_data_available();
    let ref_memory = reference.memory_access_data_available();
    if dut_memory != ref_memory {
        check(
            "memory access data available",
            dut_memory.into(),
            ref_memory.into(),
        );
    }

    if ref_integer {
        if let Some(ref_ext) = inner.integer.pop_front() {
            if dut_integer {
                check("rd_wdata", dut.integer.rd_wdata, ref_ext.rd_wdata);
                check("rd_addr", dut.integer.rd_addr.into(), ref_ext.rd_addr.into());
            }
        }
    }

    if ref_memory {
        if let Some(ref_ext) = inner.memory.pop_front() {
            // A trapped access reports no dependable memory values.
            if dut_memory && dut.exec.meta.trap == 0 {
                let read_mask = byte_select(ref_ext.rmask);
                let write_mask = byte_select(ref_ext.wmask);
                check(
                    "mem_rdata",
                    dut.memory.rdata[0] & read_mask,
                    ref_ext.rdata[0] & read_mask,
                );
                check(
                    "mem_wdata",
                    dut.memory.wdata[0] & write_mask,
                    ref_ext.wdata[0] & write_mask,
                );
                check("mem_rmask", dut.memory.rmask.into(), ref_ext.rmask.into());
                check("mem_wmask", dut.memory.wmask.into(), ref_ext.wmask.into());
                check("mem_addr", dut.memory.addr, ref_ext.addr);
            }
        }
    }

    drop(check);
    inner.exec.pop_front();
    inner.mismatches += mismatches;
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::decoder::TraceRecord;
    use crate::packet::{
        ExecutionPacketV2, InstMetadata, IntegerExtension, MemAccessExtension, PcData,
    };

    fn dut_packet(pc_rdata: u64, pc_wdata: u64) -> DutPacket {
        let mut dut = DutPacket::default();
        dut.exec.pc = PcData { pc_rdata, pc_wdata };
        dut.exec.meta = InstMetadata {
            insn: 0x13,
            mode: 3,
            ixl: 1,
            ..Default::default()
        };
        dut
    }

    fn reference(pc_rdata: u64, pc_wdata: u64) -> TraceRecord {
        let mut exec = ExecutionPacketV2::default();
        exec.pc = PcData { pc_rdata, pc_wdata };
        exec.meta = InstMetadata {
            insn: 0x13,
            mode: 3,
            ixl: 1,
            ..Default::default()
        };
        exec.trace_size = ExecutionPacketV2::wire_size(false, false);
        TraceRecord {
            exec,
            integer: None,
            memory: None,
        }
    }

    #[test]
    fn matching_packets_account_nothing() {
        let buffers = TraceBuffers::new();
        buffers.push_record(reference(0x8000_0000, 0x8000_0004));
        compare_retirement(&buffers, &dut_packet(0x8000_0000, 0x8000_0004), 1);
        assert_eq!(buffers.mismatch_count(), 0);
        assert_eq!(buffers.depths(), (0, 0, 0));
    }

    #[test]
    fn next_pc_disagreement_counts_one_mismatch() {
        let buffers = TraceBuffers::new();
        buffers.push_record(reference(0x8000_0000, 0x8000_0008));
        compare_retirement(&buffers, &dut_packet(0x8000_0000, 0x8000_0004), 2);
        assert_eq!(buffers.mismatch_count(), 1);
        assert_eq!(buffers.depths(), (0, 0, 0));
    }

    #[test]
    fn empty_reference_queue_is_not_accounted() {
        let buffers = TraceBuffers::new();
        compare_retirement(&buffers, &dut_packet(0x8000_0000, 0x8000_0004), 3);
        assert_eq!(buffers.mismatch_count(), 0);
    }

    #[test]
    fn valid_bit_is_ignored() {
        let buffers = TraceBuffers::new();
        // The reference model leaves `valid` unset.
        buffers.push_record(reference(0x8000_0000, 0x8000_0004));
        let mut dut = dut_packet(0x8000_0000, 0x8000_0004);
        dut.exec.meta.valid = 1;
        compare_retirement(&buffers, &dut, 4);
        assert_eq!(buffers.mismatch_count(), 0);
    }

    #[test]
    fn availability_disagreement_counts_once_and_stays_aligned() {
        let buffers = TraceBuffers::new();
        let mut record = reference(0x8000_0000, 0x8000_0004);
        record.exec.set_available(true, false);
        record.integer = Some(IntegerExtension {
            rd_wdata: 15,
            rd_addr: 1,
            ..Default::default()
        });
        buffers.push_record(record);

        // DUT reported no integer data; the reference extension entry
        // must still be consumed so later packets stay aligned.
        compare_retirement(&buffers, &dut_packet(0x8000_0000, 0x8000_0004), 5);
        assert_eq!(buffers.mismatch_count(), 1);
        assert_eq!(buffers.depths(), (0, 0, 0));
    }

    #[test]
    fn integer_values_compared_when_both_sides_flag() {
        let buffers = TraceBuffers::new();
        let mut record = reference(0x8000_0000, 0x8000_0004);
        record.exec.set_available(true, false);
        record.integer = Some(IntegerExtension {
            rd_wdata: 15,
            rs1_rdata: 0x1111,
            rs2_rdata: 0x2222,
            rd_addr: 1,
            ..Default::default()
        });
        buffers.push_record(record);

        let mut dut = dut_packet(0x8000_0000, 0x8000_0004);
        dut.exec.set_available(true, false);
        dut.integer = IntegerExtension {
            rd_wdata: 16,
            // rs1/rs2 differences are not compared.
            rs1_rdata: 0x9999,
            rs2_rdata: 0x8888,
            rd_addr: 1,
            ..Default::default()
        };
        compare_retirement(&buffers, &dut, 6);
        assert_eq!(buffers.mismatch_count(), 1);
    }

    #[test]
    fn trap_suppresses_memory_values_but_consumes_the_entry() {
        let buffers = TraceBuffers::new();
        let mut record = reference(0x8000_0000, 0x8000_0004);
        record.exec.set_available(false, true);
        record.memory = Some(MemAccessExtension {
            rdata: [0x1234, 0, 0, 0],
            rmask: 0xf,
            addr: 0x8000_1000,
            ..Default::default()
        });
        buffers.push_record(record);

        let mut dut = dut_packet(0x8000_0000, 0x8000_0004);
        dut.exec.meta.trap = 1;
        dut.exec.set_available(false, true);
        dut.memory = MemAccessExtension {
            rdata: [0x9999, 0, 0, 0],
            rmask: 0xf,
            addr: 0x8000_2000,
            ..Default::default()
        };
        compare_retirement(&buffers, &dut, 7);
        // Only the trap field itself disagrees.
        assert_eq!(buffers.mismatch_count(), 1);
        assert_eq!(buffers.depths(), (0, 0, 0));
    }

    #[test]
    fn memory_comparison_respects_access_masks() {
        let buffers = TraceBuffers::new();
        let mut record = reference(0x8000_0000, 0x8000_0004);
        record.exec.set_available(false, true);
        record.memory = Some(MemAccessExtension {
            rdata: [0x0000_0000_1234_5678, 0, 0, 0],
            rmask: 0xf,
            addr: 0x8000_1000,
            ..Default::default()
        });
        buffers.push_record(record);

        let mut dut = dut_packet(0x8000_0000, 0x8000_0004);
        dut.exec.set_available(false, true);
        dut.memory = MemAccessExtension {
            // Differs only above the masked four bytes.
            rdata: [0xffff_0000_1234_5678, 0, 0, 0],
            rmask: 0xf,
            addr: 0x8000_1000,
            ..Default::default()
        };
        compare_retirement(&buffers, &dut, 8);
        assert_eq!(buffers.mismatch_count(), 0);
    }

    #[test]
    fn mismatch_count_is_monotonic() {
        let buffers = TraceBuffers::new();
        let mut last = 0;
        for i in 0..4 {
            buffers.push_record(reference(0x8000_0000, 0x8000_0008));
            compare_retirement(&buffers, &dut_packet(0x8000_0000, 0x8000_0004), i);
            let count = buffers.mismatch_count();
            assert!(count >= last);
            last = count;
        }
        assert_eq!(last, 4);
    }

    #[test]
    fn byte_select_expands_mask_bits() {
        assert_eq!(byte_select(0), 0);
        assert_eq!(byte_select(0x1), 0xff);
        assert_eq!(byte_select(0xf), 0xffff_ffff);
        assert_eq!(byte_select(0xff), u64::MAX);
        // Bits beyond the first word select nothing here.
        assert_eq!(byte_select(0x100), 0);
    }
}
