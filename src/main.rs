// Copyright (C) 2025 FZI Forschungszentrum Informatik
// SPDX-License-Identifier: Apache-2.0

//! Command line trace decoder
//!
//!     Usage: rv-tracer-decoder <packets.bin> <compiled.riscv>
//!
//! Reconstructs the retired instruction stream of a traced program. The
//! packet file is a sequence of 40 byte encapsulated records, the program
//! a 64-bit RISC-V ELF whose executable sections are listed in
//! `disassembler_config.yaml`. Every retired instruction is appended to
//! the `execution_trace` file in the working directory, one line per
//! instruction.

use std::fs::{self, File};
use std::io::{self, BufWriter, Write};
use std::path::Path;
use std::process;

use anyhow::Context;

use rv_tracer_decoder::config::{self, Config};
use rv_tracer_decoder::decoder::payload::Trap;
use rv_tracer_decoder::decoder::{Decoder, Packet, CHUNK_SIZE};
use rv_tracer_decoder::disassembler::InstructionMap;
use rv_tracer_decoder::tracer::{Flow, ReportTrace, Tracer};
use rv_tracer_decoder::DiscoveryResponse;

/// Output file holding one retired instruction per line.
const TRACE_PATH: &str = "execution_trace";

fn main() -> anyhow::Result<()> {
    env_logger::init();

    let mut args = std::env::args().skip(1);
    let (Some(packets_path), Some(compiled_path), None) = (args.next(), args.next(), args.next())
    else {
        println!("Usage: rv-tracer-decoder <packets.bin> <compiled.riscv>");
        process::exit(1);
    };

    if !Path::new(&packets_path).exists() {
        println!("Error: the file {packets_path} does not exist.");
        process::exit(1);
    }
    if !Path::new(&compiled_path).exists() {
        println!("Error: the file {compiled_path} does not exist.");
        process::exit(1);
    }
    if !packets_path.ends_with(".bin") {
        println!("Error: the file {packets_path} must be a binary file.");
        process::exit(1);
    }
    if !compiled_path.ends_with(".riscv") {
        println!("Error: the file {compiled_path} must be RISC-V compiled file.");
        process::exit(1);
    }

    if Path::new(TRACE_PATH).exists() {
        fs::remove_file(TRACE_PATH).context("Could not remove previous execution trace")?;
    }

    let config = Config::load(config::DEFAULT_PATH).context("Could not load configuration")?;
    let discovery = DiscoveryResponse::default();

    let map = InstructionMap::from_elf(&compiled_path, &config.disassemble.sections)
        .context("Could not disassemble program")?;
    log::info!("Disassembled {} instructions", map.len());

    let data = fs::read(&packets_path).context("Could not read packet file")?;
    let packets = parse_packets(discovery, &data).context("Could not parse packets")?;
    log::info!("Parsed {} packets", packets.len());

    let mut writer = TraceWriter::create(TRACE_PATH, &map).context("Could not open output")?;
    let mut tracer = Tracer::new(discovery, &map, &mut writer);
    for (index, packet) in packets.iter().enumerate() {
        log::debug!("Processing packet {index}: {:?}", packet.payload);
        match tracer.process_te_inst(&packet.payload) {
            Ok(Flow::Continue) => {}
            Ok(Flow::EndOfTrace) => {
                log::info!("End of trace reached after packet {index}");
                break;
            }
            Err(err) => return Err(err).context(format!("While processing packet {index}")),
        }
    }
    drop(tracer);
    writer.finish().context("Could not write execution trace")?;
    Ok(())
}

fn parse_packets(
    discovery: DiscoveryResponse,
    data: &[u8],
) -> Result<Vec<Packet>, rv_tracer_decoder::decoder::Error> {
    let mut decoder = Decoder::new(discovery).with_data(data);
    let mut packets = Vec::with_capacity(data.len() / CHUNK_SIZE);
    while decoder.bytes_left() >= CHUNK_SIZE {
        packets.push(decoder.decode_packet()?);
    }
    if decoder.bytes_left() > 0 {
        log::warn!(
            "Ignoring {} trailing bytes, not a whole record",
            decoder.bytes_left()
        );
    }
    Ok(packets)
}

/// Appends retired instructions to the execution trace file
struct TraceWriter<'m> {
    map: &'m InstructionMap,
    out: BufWriter<File>,
    result: io::Result<()>,
}

impl<'m> TraceWriter<'m> {
    fn create(path: &str, map: &'m InstructionMap) -> io::Result<Self> {
        Ok(TraceWriter {
            map,
            out: BufWriter::new(File::create(path)?),
            result: Ok(()),
        })
    }

    /// Surface the first deferred write error, flushing the output
    fn finish(self) -> io::Result<()> {
        let TraceWriter {
            mut out, result, ..
        } = self;
        result?;
        out.flush()
    }
}

impl ReportTrace for TraceWriter<'_> {
    fn report_pc(&mut self, pc: u64) {
        if self.result.is_err() {
            return;
        }
        // reported PCs are validated by the tracer, the lookup cannot miss
        if let Some((mnemonic, op_str)) = self.map.listing(pc) {
            self.result = writeln!(self.out, "{pc:#x} {mnemonic} {op_str}");
        }
    }

    fn report_epc(&mut self, epc: u64) {
        log::info!("Exception program counter: {epc:#x}");
    }

    fn report_trap(&mut self, trap: &Trap) {
        log::info!(
            "Trap: ecause={} interrupt={} tval={:#x}",
            trap.ecause,
            trap.interrupt,
            trap.tval
        );
    }
}
