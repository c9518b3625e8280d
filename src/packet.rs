//! Wire-level definitions for the RVFI-DII v2 protocol.
//!
//! Every multi-byte field is little-endian and every record is packed;
//! the `WIRE_SIZE` constants below are the exact on-the-wire lengths.
//! Packet boundaries are implicit: a reader always knows how many bytes
//! the next record occupies from its kind, except for the two optional
//! v2 extensions which are announced by the flags byte of the header
//! that precedes them.

use byteorder::{ByteOrder, LE};

/// Little-endian reading of the ASCII bytes `"trace-v2"`.
pub const V2_TRACE_MAGIC: u64 = 0x32762d6563617274;
/// Little-endian reading of the ASCII bytes `"int-data"`.
pub const INT_DATA_MAGIC: u64 = 0x617461642d746e69;
/// Little-endian reading of the ASCII bytes `"mem-data"`.
pub const MEM_DATA_MAGIC: u64 = 0x617461642d6d656d;

/// Command byte of an [`InstructionPacket`]: halt/reset, or version
/// negotiation when the instruction word is [`VERSION_NEGOTIATE_INSN`].
pub const CMD_RESET: u8 = 0;
/// Command byte of an [`InstructionPacket`]: inject one instruction.
pub const CMD_INSTRUCTION: u8 = 1;
/// Command byte of an [`InstructionPacket`]: select a trace version.
pub const CMD_VERSION_SELECT: u8 = b'v';

/// Instruction word carried by a reset command that asks for version
/// negotiation instead of an actual reset (ASCII `"VERS"`).
pub const VERSION_NEGOTIATE_INSN: u32 = 0x5645_5253;

/// Flags bit announcing a trailing [`IntegerExtension`].
const FLAG_INTEGER_DATA: u8 = 1 << 0;
/// Flags bit announcing a trailing [`MemAccessExtension`].
const FLAG_MEMORY_DATA: u8 = 1 << 1;

/// One 8-byte command sent by the stimulus engine.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct InstructionPacket {
    /// Instruction word to inject (or a negotiation sentinel).
    pub insn: u32,

    /// Engine-side timestamp, carried for diagnostics only.
    pub time: u16,

    /// Command discriminator; see the `CMD_*` constants.
    pub cmd: u8,

    /// Explicit pad byte, zero on every valid packet.
    pub padding: u8,
}

impl InstructionPacket {
    pub const WIRE_SIZE: usize = 8;

    pub fn from_bytes(buf: &[u8; Self::WIRE_SIZE]) -> Self {
        InstructionPacket {
            insn: LE::read_u32(&buf[0..4]),
            time: LE::read_u16(&buf[4..6]),
            cmd: buf[6],
            padding: buf[7],
        }
    }

    pub fn to_bytes(&self) -> [u8; Self::WIRE_SIZE] {
        let mut buf = [0; Self::WIRE_SIZE];
        LE::write_u32(&mut buf[0..4], self.insn);
        LE::write_u16(&mut buf[4..6], self.time);
        buf[6] = self.cmd;
        buf[7] = self.padding;
        buf
    }
}

/// The fixed 88-byte v1 execution record.
///
/// Only ever emitted as the version-negotiation reply, and then with
/// every byte of the record reversed end to end before transmission;
/// see [`Self::to_reversed_bytes`]. The struct keeps the complete field
/// set in its historical declaration order, which is the *reverse* of
/// the documented v1 wire order. The reversal restores the wire order
/// (while also flipping the bytes within each word; a protocol quirk to
/// be preserved, not repaired).
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct ExecutionPacketV1 {
    pub intr: u8,
    pub halt: u8,
    pub trap: u8,
    pub rd_addr: u8,
    pub rs2_addr: u8,
    pub rs1_addr: u8,
    pub mem_wmask: u8,
    pub mem_rmask: u8,
    pub mem_wdata: u64,
    pub mem_rdata: u64,
    pub mem_addr: u64,
    pub rd_wdata: u64,
    pub rs2_rdata: u64,
    pub rs1_rdata: u64,
    pub insn: u64,
    pub pc_wdata: u64,
    pub pc_rdata: u64,
    pub order: u64,
}

impl ExecutionPacketV1 {
    pub const WIRE_SIZE: usize = 88;

    pub fn to_bytes(&self) -> [u8; Self::WIRE_SIZE] {
        let mut buf = [0; Self::WIRE_SIZE];
        buf[0] = self.intr;
        buf[1] = self.halt;
        buf[2] = self.trap;
        buf[3] = self.rd_addr;
        buf[4] = self.rs2_addr;
        buf[5] = self.rs1_addr;
        buf[6] = self.mem_wmask;
        buf[7] = self.mem_rmask;
        LE::write_u64(&mut buf[8..16], self.mem_wdata);
        LE::write_u64(&mut buf[16..24], self.mem_rdata);
        LE::write_u64(&mut buf[24..32], self.mem_addr);
        LE::write_u64(&mut buf[32..40], self.rd_wdata);
        LE::write_u64(&mut buf[40..48], self.rs2_rdata);
        LE::write_u64(&mut buf[48..56], self.rs1_rdata);
        LE::write_u64(&mut buf[56..64], self.insn);
        LE::write_u64(&mut buf[64..72], self.pc_wdata);
        LE::write_u64(&mut buf[72..80], self.pc_rdata);
        LE::write_u64(&mut buf[80..88], self.order);
        buf
    }

    /// Encoding followed by the end-to-end byte reversal applied before
    /// the record goes on the wire.
    pub fn to_reversed_bytes(&self) -> [u8; Self::WIRE_SIZE] {
        let mut buf = self.to_bytes();
        buf.reverse();
        buf
    }
}

/// Retirement metadata block of a v2 execution packet (24 bytes).
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct InstMetadata {
    pub order: u64,
    pub insn: u64,
    pub trap: u8,
    pub halt: u8,
    pub intr: u8,
    pub mode: u8,
    pub ixl: u8,
    pub valid: u8,
}

impl InstMetadata {
    pub const WIRE_SIZE: usize = 24;

    pub fn from_bytes(buf: &[u8; Self::WIRE_SIZE]) -> Self {
        InstMetadata {
            order: LE::read_u64(&buf[0..8]),
            insn: LE::read_u64(&buf[8..16]),
            trap: buf[16],
            halt: buf[17],
            intr: buf[18],
            mode: buf[19],
            ixl: buf[20],
            valid: buf[21],
        }
    }

    pub fn to_bytes(&self) -> [u8; Self::WIRE_SIZE] {
        let mut buf = [0; Self::WIRE_SIZE];
        LE::write_u64(&mut buf[0..8], self.order);
        LE::write_u64(&mut buf[8..16], self.insn);
        buf[16] = self.trap;
        buf[17] = self.halt;
        buf[18] = self.intr;
        buf[19] = self.mode;
        buf[20] = self.ixl;
        buf[21] = self.valid;
        buf
    }
}

/// Program-counter block of a v2 execution packet (16 bytes).
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct PcData {
    /// PC of the retired instruction.
    pub pc_rdata: u64,

    /// PC after the retired instruction.
    pub pc_wdata: u64,
}

impl PcData {
    pub const WIRE_SIZE: usize = 16;

    pub fn from_bytes(buf: &[u8; Self::WIRE_SIZE]) -> Self {
        PcData {
            pc_rdata: LE::read_u64(&buf[0..8]),
            pc_wdata: LE::read_u64(&buf[8..16]),
        }
    }

    pub fn to_bytes(&self) -> [u8; Self::WIRE_SIZE] {
        let mut buf = [0; Self::WIRE_SIZE];
        LE::write_u64(&mut buf[0..8], self.pc_rdata);
        LE::write_u64(&mut buf[8..16], self.pc_wdata);
        buf
    }
}

/// 64-byte header of a v2 execution packet.
///
/// The magic is validated on decode and regenerated on encode rather
/// than stored. The raw flags byte is kept as read so that a packet
/// advertising extensions this crate does not interpret still
/// round-trips byte for byte; only bits 0 and 1 are given meaning.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct ExecutionPacketV2 {
    /// Total wire size of this packet including its extensions.
    pub trace_size: u64,

    pub meta: InstMetadata,
    pub pc: PcData,

    /// Extension-availability flags, raw.
    pub flags: u8,
}

impl ExecutionPacketV2 {
    pub const WIRE_SIZE: usize = 64;

    pub fn integer_data_available(&self) -> bool {
        self.flags & FLAG_INTEGER_DATA != 0
    }

    pub fn memory_access_data_available(&self) -> bool {
        self.flags & FLAG_MEMORY_DATA != 0
    }

    pub fn set_available(&mut self, integer: bool, memory: bool) {
        self.flags = if integer { FLAG_INTEGER_DATA } else { 0 }
            | if memory { FLAG_MEMORY_DATA } else { 0 };
    }

    /// Wire size of a packet carrying the given extensions.
    pub fn wire_size(integer: bool, memory: bool) -> u64 {
        Self::WIRE_SIZE as u64
            + if integer { IntegerExtension::WIRE_SIZE as u64 } else { 0 }
            + if memory { MemAccessExtension::WIRE_SIZE as u64 } else { 0 }
    }

    /// Decodes a header whose magic has already been read and checked.
    pub(crate) fn from_bytes_unchecked(buf: &[u8; Self::WIRE_SIZE]) -> Self {
        let mut meta = [0; InstMetadata::WIRE_SIZE];
        meta.copy_from_slice(&buf[16..40]);
        let mut pc = [0; PcData::WIRE_SIZE];
        pc.copy_from_slice(&buf[40..56]);
        ExecutionPacketV2 {
            trace_size: LE::read_u64(&buf[8..16]),
            meta: InstMetadata::from_bytes(&meta),
            pc: PcData::from_bytes(&pc),
            flags: buf[56],
        }
    }

    pub fn to_bytes(&self) -> [u8; Self::WIRE_SIZE] {
        let mut buf = [0; Self::WIRE_SIZE];
        LE::write_u64(&mut buf[0..8], V2_TRACE_MAGIC);
        LE::write_u64(&mut buf[8..16], self.trace_size);
        buf[16..40].copy_from_slice(&self.meta.to_bytes());
        buf[40..56].copy_from_slice(&self.pc.to_bytes());
        buf[56] = self.flags;
        buf
    }
}

/// Integer register extension of a v2 execution packet (40 bytes).
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct IntegerExtension {
    pub rd_wdata: u64,
    pub rs1_rdata: u64,
    pub rs2_rdata: u64,
    pub rd_addr: u8,
    pub rs1_addr: u8,
    pub rs2_addr: u8,
}

impl IntegerExtension {
    pub const WIRE_SIZE: usize = 40;

    pub(crate) fn from_bytes_unchecked(buf: &[u8; Self::WIRE_SIZE]) -> Self {
        IntegerExtension {
            rd_wdata: LE::read_u64(&buf[8..16]),
            rs1_rdata: LE::read_u64(&buf[16..24]),
            rs2_rdata: LE::read_u64(&buf[24..32]),
            rd_addr: buf[32],
            rs1_addr: buf[33],
            rs2_addr: buf[34],
        }
    }

    pub fn to_bytes(&self) -> [u8; Self::WIRE_SIZE] {
        let mut buf = [0; Self::WIRE_SIZE];
        LE::write_u64(&mut buf[0..8], INT_DATA_MAGIC);
        LE::write_u64(&mut buf[8..16], self.rd_wdata);
        LE::write_u64(&mut buf[16..24], self.rs1_rdata);
        LE::write_u64(&mut buf[24..32], self.rs2_rdata);
        buf[32] = self.rd_addr;
        buf[33] = self.rs1_addr;
        buf[34] = self.rs2_addr;
        buf
    }
}

/// Memory access extension of a v2 execution packet (88 bytes).
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct MemAccessExtension {
    pub rdata: [u64; 4],
    pub wdata: [u64; 4],
    pub rmask: u32,
    pub wmask: u32,
    pub addr: u64,
}

impl MemAccessExtension {
    pub const WIRE_SIZE: usize = 88;

    pub(crate) fn from_bytes_unchecked(buf: &[u8; Self::WIRE_SIZE]) -> Self {
        let mut ext = MemAccessExtension::default();
        for i in 0..4 {
            ext.rdata[i] = LE::read_u64(&buf[8 + 8 * i..16 + 8 * i]);
            ext.wdata[i] = LE::read_u64(&buf[40 + 8 * i..48 + 8 * i]);
        }
        ext.rmask = LE::read_u32(&buf[72..76]);
        ext.wmask = LE::read_u32(&buf[76..80]);
        ext.addr = LE::read_u64(&buf[80..88]);
        ext
    }

    pub fn to_bytes(&self) -> [u8; Self::WIRE_SIZE] {
        let mut buf = [0; Self::WIRE_SIZE];
        LE::write_u64(&mut buf[0..8], MEM_DATA_MAGIC);
        for i in 0..4 {
            LE::write_u64(&mut buf[8 + 8 * i..16 + 8 * i], self.rdata[i]);
            LE::write_u64(&mut buf[40 + 8 * i..48 + 8 * i], self.wdata[i]);
        }
        LE::write_u32(&mut buf[72..76], self.rmask);
        LE::write_u32(&mut buf[76..80], self.wmask);
        LE::write_u64(&mut buf[80..88], self.addr);
        buf
    }
}

/// The 16-byte reply to a v2 version-select command.
pub fn version_select_reply(version: u64) -> [u8; 16] {
    let mut buf = [0; 16];
    buf[0..8].copy_from_slice(b"version=");
    LE::write_u64(&mut buf[8..16], version);
    buf
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn magics_spell_their_ascii_names() {
        assert_eq!(&V2_TRACE_MAGIC.to_le_bytes(), b"trace-v2");
        assert_eq!(&INT_DATA_MAGIC.to_le_bytes(), b"int-data");
        assert_eq!(&MEM_DATA_MAGIC.to_le_bytes(), b"mem-data");
    }

    #[test]
    fn instruction_packet_round_trip() {
        let bytes = [0x93, 0x00, 0xf0, 0x00, 0x34, 0x12, 0x01, 0x00];
        let packet = InstructionPacket::from_bytes(&bytes);
        assert_eq!(packet.insn, 0x00f0_0093);
        assert_eq!(packet.time, 0x1234);
        assert_eq!(packet.cmd, CMD_INSTRUCTION);
        assert_eq!(packet.to_bytes(), bytes);
    }

    #[test]
    fn version_negotiation_command_bytes() {
        let packet = InstructionPacket::from_bytes(&[0x53, 0x52, 0x45, 0x56, 0, 0, 0, 0]);
        assert_eq!(packet.cmd, CMD_RESET);
        assert_eq!(packet.insn, VERSION_NEGOTIATE_INSN);
    }

    #[test]
    fn v1_reply_reversal_places_halt_at_byte_86() {
        let packet = ExecutionPacketV1 {
            halt: 0x3,
            ..Default::default()
        };
        let wire = packet.to_reversed_bytes();
        assert_eq!(wire.len(), 88);
        for (i, &b) in wire.iter().enumerate() {
            assert_eq!(b, if i == 86 { 0x3 } else { 0 }, "byte {}", i);
        }
    }

    #[test]
    fn v1_reversal_flips_word_bytes_too() {
        let packet = ExecutionPacketV1 {
            order: 0x0102_0304_0506_0708,
            ..Default::default()
        };
        let wire = packet.to_reversed_bytes();
        // order is the last field of the declaration, so it lands first
        // on the wire, big-endian after the whole-record reversal.
        assert_eq!(&wire[0..8], &[0x01, 0x02, 0x03, 0x04, 0x05, 0x06, 0x07, 0x08]);
    }

    #[test]
    fn v2_header_round_trip() {
        let mut exec = ExecutionPacketV2::default();
        exec.meta = InstMetadata {
            order: 7,
            insn: 0x00f0_0093,
            trap: 0,
            halt: 0,
            intr: 0,
            mode: 3,
            ixl: 1,
            valid: 1,
        };
        exec.pc = PcData {
            pc_rdata: 0x8000_0000,
            pc_wdata: 0x8000_0004,
        };
        exec.set_available(true, false);
        exec.trace_size = ExecutionPacketV2::wire_size(true, false);

        let wire = exec.to_bytes();
        assert_eq!(&wire[0..8], b"trace-v2");
        assert_eq!(
            ExecutionPacketV2::from_bytes_unchecked(&wire),
            exec
        );
    }

    #[test]
    fn v2_reserved_flag_bits_survive_a_round_trip() {
        let mut wire = ExecutionPacketV2::default().to_bytes();
        wire[56] = 0b0100_0011;
        let exec = ExecutionPacketV2::from_bytes_unchecked(&wire);
        assert!(exec.integer_data_available());
        assert!(exec.memory_access_data_available());
        assert_eq!(exec.to_bytes()[56], 0b0100_0011);
    }

    #[test]
    fn trace_size_matches_extension_set() {
        assert_eq!(ExecutionPacketV2::wire_size(false, false), 64);
        assert_eq!(ExecutionPacketV2::wire_size(true, false), 104);
        assert_eq!(ExecutionPacketV2::wire_size(false, true), 152);
        assert_eq!(ExecutionPacketV2::wire_size(true, true), 192);
    }

    #[test]
    fn integer_extension_round_trip() {
        let ext = IntegerExtension {
            rd_wdata: 15,
            rs1_rdata: 0xdead_beef,
            rs2_rdata: 0xcafe,
            rd_addr: 1,
            rs1_addr: 2,
            rs2_addr: 3,
        };
        let wire = ext.to_bytes();
        assert_eq!(&wire[0..8], b"int-data");
        assert_eq!(IntegerExtension::from_bytes_unchecked(&wire), ext);
    }

    #[test]
    fn mem_extension_round_trip() {
        let ext = MemAccessExtension {
            rdata: [1, 2, 3, 4],
            wdata: [5, 6, 7, 8],
            rmask: 0xf,
            wmask: 0x3,
            addr: 0x8000_1000,
        };
        let wire = ext.to_bytes();
        assert_eq!(&wire[0..8], b"mem-data");
        assert_eq!(MemAccessExtension::from_bytes_unchecked(&wire), ext);
    }

    #[test]
    fn version_select_reply_bytes() {
        assert_eq!(
            version_select_reply(2),
            [0x76, 0x65, 0x72, 0x73, 0x69, 0x6f, 0x6e, 0x3d, 0x02, 0, 0, 0, 0, 0, 0, 0]
        );
    }
}
