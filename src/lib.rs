//! # `rvfi-dii`
//!
//! Protocol adapters for RVFI-DII v2 (RISC-V Formal Interface — Direct
//! Instruction Injection), driving continuous trace comparison between
//! a device under test and a golden reference simulator.
//!
//! Two peers are served by one [`Harness`](Harness):
//!
//! - On the **engine side** the harness is a server. A stimulus engine
//! connects, negotiates the trace version, then streams one
//! instruction-injection command at a time and receives one execution
//! packet per retired instruction.
//!
//! - On the **reference side** the harness is a client. It launches
//! the reference simulator, drains its trace socket, discards the boot
//! preamble up to the ELF entry point, and queues the rest for
//! comparison.
//!
//! The host simulator's shim drives everything through the harness:
//!
//! ```no_run
//! use std::sync::Arc;
//! use rvfi_dii::{DutControl, Harness, HarnessOptions};
//!
//! struct Shim;
//!
//! impl DutControl for Shim {
//!     fn halt(&self) {}
//!     fn unhalt(&self) {}
//!     fn queue_finish(&self) {}
//!     fn set_rvfi_order(&self, _order: u64) {}
//! }
//!
//! # fn main() -> Result<(), rvfi_dii::HarnessError> {
//! let harness = Harness::initialize(HarnessOptions::default(), Arc::new(Shim))?;
//! harness.init_ref_model("prog.elf".as_ref())?;
//! loop {
//!     let insn = harness.next_instr();
//!     if insn == 0 {
//!         break;
//!     }
//!     // ... retire `insn` in the DUT, then report the retirement:
//!     harness.set_pc(0x8000_0000, 0x8000_0004);
//!     harness.set_inst_meta(insn.into(), 0, 0, 0, 3, 1, 1);
//!     harness.commit_v2(false, false);
//!     harness.compare(0);
//! }
//! let _mismatches = harness.mismatch_count();
//! harness.finalize();
//! # Ok(())
//! # }
//! ```
//!
//! The wire formats live in [`packet`](packet); raw v2 trace streams
//! can be replayed offline with [`TraceDecoder`](TraceDecoder).

mod buffers;
mod compare;
pub mod decoder;
mod error;
mod harness;
pub mod packet;
mod process;
mod reference;
mod server;

pub use decoder::{Records, TraceDecoder, TraceRecord};
pub use error::{DecoderError, HarnessError};
pub use harness::{DutControl, Harness, HarnessOptions, ReferenceOptions};
