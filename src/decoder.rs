//! Streaming decode of v2 execution traces.

use std::io::{ErrorKind, Read};

use byteorder::{ByteOrder, LE};

use crate::error::DecoderError;
use crate::packet::{
    ExecutionPacketV2, IntegerExtension, MemAccessExtension, INT_DATA_MAGIC, MEM_DATA_MAGIC,
    V2_TRACE_MAGIC,
};

/// One decoded execution packet together with whichever extensions its
/// flags announced.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TraceRecord {
    pub exec: ExecutionPacketV2,
    pub integer: Option<IntegerExtension>,
    pub memory: Option<MemAccessExtension>,
}

// Like `Read::read_exact`, but reports whether the stream ended cleanly
// before the first byte (`Ok(false)`) instead of folding that case into
// an error.
pub(crate) fn read_wire<R: Read>(reader: &mut R, buf: &mut [u8]) -> Result<bool, DecoderError> {
    let mut filled = 0;
    while filled < buf.len() {
        match reader.read(&mut buf[filled..]) {
            Ok(0) if filled == 0 => return Ok(false),
            Ok(0) => return Err(DecoderError::EofDuringPacket),
            Ok(n) => filled += n,
            Err(ref e) if e.kind() == ErrorKind::Interrupted => {}
            Err(e) => return Err(e.into()),
        }
    }
    Ok(true)
}

fn check_magic(buf: &[u8], kind: &'static str, expected: u64) -> Result<(), DecoderError> {
    let found = LE::read_u64(&buf[0..8]);
    if found != expected {
        return Err(DecoderError::BadMagic {
            kind,
            found,
            expected,
        });
    }
    Ok(())
}

/// Reads v2 execution records from a byte stream.
///
/// The reader is consumed record by record: a 64-byte header first,
/// then 40 and/or 88 further bytes when the header's flags call for
/// them. Magics are validated as they are read.
pub struct TraceDecoder<R>
where
    R: Read,
{
    inner: R,
}

impl<R> TraceDecoder<R>
where
    R: Read,
{
    pub fn new(inner: R) -> TraceDecoder<R> {
        TraceDecoder { inner }
    }

    /// Returns a reference to the underlying [`Read`](Read).
    pub fn get_ref(&self) -> &R {
        &self.inner
    }

    /// Returns a mutable reference to the underlying [`Read`](Read).
    pub fn get_mut(&mut self) -> &mut R {
        &mut self.inner
    }

    /// Reads the next record. `Ok(None)` means the stream ended cleanly
    /// on a record boundary.
    pub fn read_record(&mut self) -> Result<Option<TraceRecord>, DecoderError> {
        let mut header = [0; ExecutionPacketV2::WIRE_SIZE];
        if !read_wire(&mut self.inner, &mut header)? {
            return Ok(None);
        }
        check_magic(&header, "execution header", V2_TRACE_MAGIC)?;
        let exec = ExecutionPacketV2::from_bytes_unchecked(&header);

        let integer = if exec.integer_data_available() {
            let mut buf = [0; IntegerExtension::WIRE_SIZE];
            if !read_wire(&mut self.inner, &mut buf)? {
                return Err(DecoderError::EofDuringPacket);
            }
            check_magic(&buf, "integer extension", INT_DATA_MAGIC)?;
            Some(IntegerExtension::from_bytes_unchecked(&buf))
        } else {
            None
        };

        let memory = if exec.memory_access_data_available() {
            let mut buf = [0; MemAccessExtension::WIRE_SIZE];
            if !read_wire(&mut self.inner, &mut buf)? {
                return Err(DecoderError::EofDuringPacket);
            }
            check_magic(&buf, "memory extension", MEM_DATA_MAGIC)?;
            Some(MemAccessExtension::from_bytes_unchecked(&buf))
        } else {
            None
        };

        Ok(Some(TraceRecord {
            exec,
            integer,
            memory,
        }))
    }

    /// Returns an iterator over [`TraceRecord`](TraceRecord)s.
    pub fn records(&mut self) -> Records<R> {
        Records { decoder: self }
    }
}

/// Iterator that yields [`TraceRecord`](TraceRecord)s until the stream
/// ends cleanly.
pub struct Records<'a, R>
where
    R: Read,
{
    decoder: &'a mut TraceDecoder<R>,
}

impl<'a, R> Iterator for Records<'a, R>
where
    R: Read,
{
    type Item = Result<TraceRecord, DecoderError>;

    fn next(&mut self) -> Option<Self::Item> {
        self.decoder.read_record().transpose()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::packet::{InstMetadata, PcData};

    fn record_bytes(pc_wdata: u64, integer: Option<IntegerExtension>) -> Vec<u8> {
        let mut exec = ExecutionPacketV2::default();
        exec.pc = PcData {
            pc_rdata: pc_wdata.wrapping_sub(4),
            pc_wdata,
        };
        exec.meta = InstMetadata {
            insn: 0x13,
            ..Default::default()
        };
        exec.set_available(integer.is_some(), false);
        exec.trace_size = ExecutionPacketV2::wire_size(integer.is_some(), false);

        let mut bytes = exec.to_bytes().to_vec();
        if let Some(ext) = integer {
            bytes.extend_from_slice(&ext.to_bytes());
        }
        bytes
    }

    #[test]
    fn empty_stream_yields_no_records() {
        let empty: &[u8] = &[];
        let mut decoder = TraceDecoder::new(empty);
        assert!(decoder.records().next().is_none());
    }

    #[test]
    fn decodes_header_and_flagged_extension() {
        let ext = IntegerExtension {
            rd_wdata: 15,
            rd_addr: 1,
            ..Default::default()
        };
        let bytes = record_bytes(0x8000_0004, Some(ext));
        let mut decoder = TraceDecoder::new(bytes.as_slice());

        let record = decoder.read_record().unwrap().unwrap();
        assert_eq!(record.exec.pc.pc_wdata, 0x8000_0004);
        assert_eq!(record.exec.trace_size, 104);
        assert_eq!(record.integer, Some(ext));
        assert_eq!(record.memory, None);
        assert!(decoder.read_record().unwrap().is_none());
    }

    #[test]
    fn truncated_header_is_an_error() {
        let bytes = record_bytes(0x8000_0004, None);
        let mut decoder = TraceDecoder::new(&bytes[..32]);
        match decoder.read_record() {
            Err(DecoderError::EofDuringPacket) => {}
            other => panic!("expected EofDuringPacket, got {:?}", other),
        }
    }

    #[test]
    fn missing_announced_extension_is_an_error() {
        let bytes = record_bytes(0x8000_0004, Some(IntegerExtension::default()));
        let mut decoder = TraceDecoder::new(&bytes[..ExecutionPacketV2::WIRE_SIZE]);
        match decoder.read_record() {
            Err(DecoderError::EofDuringPacket) => {}
            other => panic!("expected EofDuringPacket, got {:?}", other),
        }
    }

    #[test]
    fn wrong_magic_is_rejected() {
        let mut bytes = record_bytes(0x8000_0004, None);
        bytes[0] = b'x';
        let mut decoder = TraceDecoder::new(bytes.as_slice());
        match decoder.read_record() {
            Err(DecoderError::BadMagic { kind, .. }) => assert_eq!(kind, "execution header"),
            other => panic!("expected BadMagic, got {:?}", other),
        }
    }

    #[test]
    fn multiple_records_via_iterator() {
        let mut bytes = record_bytes(0x8000_0004, None);
        bytes.extend(record_bytes(0x8000_0008, None));
        let mut decoder = TraceDecoder::new(bytes.as_slice());
        let records: Vec<_> = decoder.records().collect::<Result<_, _>>().unwrap();
        assert_eq!(records.len(), 2);
        assert_eq!(records[1].exec.pc.pc_wdata, 0x8000_0008);
    }
}
