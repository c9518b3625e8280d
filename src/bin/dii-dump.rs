use anyhow::{Context, Result};
use rvfi_dii::TraceDecoder;
use std::fs::File;
use std::io::{self, Read};
use std::path::PathBuf;
use structopt::StructOpt;

#[derive(StructOpt, Debug)]
#[structopt(
    about = "Decodes a raw RVFI-DII v2 execution trace stream and prints one line per retired instruction. Stops at the first malformed record, like the harness drain does."
)]
struct Opt {
    #[structopt(
        name = "FILE",
        parse(from_os_str),
        help = "Raw trace input file. Reads from standard input when omitted."
    )]
    file: Option<PathBuf>,
}

fn main() -> Result<()> {
    env_logger::init();
    let opt = Opt::from_args();

    let reader: Box<dyn Read> = match &opt.file {
        Some(path) => Box::new(
            File::open(path).with_context(|| format!("failed to open {}", path.display()))?,
        ),
        None => Box::new(io::stdin()),
    };
    let mut decoder = TraceDecoder::new(reader);

    for record in decoder.records() {
        let record = record.context("decoder error")?;
        let meta = &record.exec.meta;
        let pc = &record.exec.pc;
        print!(
            "order={:<6} pc={:#010x} -> {:#010x} insn={:#010x} trap={} halt={} intr={} mode={} ixl={}",
            meta.order, pc.pc_rdata, pc.pc_wdata, meta.insn, meta.trap, meta.halt, meta.intr,
            meta.mode, meta.ixl
        );
        if let Some(ext) = &record.integer {
            print!(" | x{} <= {:#x}", ext.rd_addr, ext.rd_wdata);
        }
        if let Some(ext) = &record.memory {
            print!(
                " | mem addr={:#x} rmask={:#x} wmask={:#x}",
                ext.addr, ext.rmask, ext.wmask
            );
        }
        println!();
    }

    Ok(())
}
