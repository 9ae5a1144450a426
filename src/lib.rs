// Copyright (C) 2025 FZI Forschungszentrum Informatik
// SPDX-License-Identifier: Apache-2.0

//! # Branch-trace reconstruction for RISC-V efficient instruction tracing
//!
//! This crate reconstructs the complete sequence of retired instruction
//! program counters of a traced RISC-V program. It combines two inputs: a
//! stream of `te_inst` packets emitted by an
//! [Efficient Trace](https://github.com/riscv-non-isa/riscv-trace-spec/)
//! encoder, which reports only control-flow discontinuities, and the static
//! disassembly of the traced binary.
//!
//! See [decoder] for the packet parser, [disassembler] for the construction
//! of the address to instruction mapping and [tracer] for the
//! reconstruction algorithm. Retired PCs are delivered through the
//! [`ReportTrace`][tracer::ReportTrace] callbacks.
//!
//! # Example
//!
//! The following example traces a two instruction program from a
//! synchronization packet:
//!
//! ```
//! use rv_tracer_decoder::decoder::payload::{Payload, Start, Synchronization};
//! use rv_tracer_decoder::disassembler::InstructionMap;
//! use rv_tracer_decoder::tracer::{Flow, ReportTrace, Tracer};
//! use rv_tracer_decoder::types::Privilege;
//! use rv_tracer_decoder::DiscoveryResponse;
//!
//! #[derive(Default)]
//! struct Collect(Vec<u64>);
//!
//! impl ReportTrace for Collect {
//!     fn report_pc(&mut self, pc: u64) {
//!         self.0.push(pc);
//!     }
//! }
//!
//! let map = InstructionMap::from_pairs([
//!     (0x1000, ("addi", "x1, x0, 1")),
//!     (0x1004, ("addi", "x2, x0, 2")),
//! ]);
//! let mut sink = Collect::default();
//! let mut tracer = Tracer::new(DiscoveryResponse::default(), &map, &mut sink);
//!
//! let start = Payload::Synchronization(Synchronization::Start(Start {
//!     branch: true,
//!     privilege: Privilege::Machine,
//!     address: 0x1000,
//! }));
//! assert_eq!(tracer.process_te_inst(&start).unwrap(), Flow::Continue);
//! drop(tracer);
//! assert_eq!(sink.0, [0x1000]);
//! ```

pub mod config;
pub mod decoder;
pub mod disassembler;
pub mod instruction;
pub mod tracer;
pub mod types;


pub use instruction::Instruction;

/// Width of instruction addresses, `ecause` and `tval` fields in bits.
pub const XLEN: usize = 64;

/// Fixed encoder parameters communicated out of band.
///
/// A real trace unit reports these through its discovery ROM; this decoder
/// treats them as compile-time constants. They are used by the [decoder]
/// to size the `irdepth` field and by the [tracer] to scale reported
/// addresses and to bound the implicit return stack.
#[derive(Copy, Clone, Debug, Default)]
pub struct DiscoveryResponse {
    /// Left-shift applied to every reported address.
    pub iaddress_lsb: u8,
    /// Exponent of the nested call counter size.
    pub call_counter_size: u8,
    /// Exponent of the implicit return stack size.
    pub return_stack_size: u8,
}

impl DiscoveryResponse {
    /// Width of the `irdepth` packet field in bits.
    pub fn irdepth_width(&self) -> usize {
        1 << self.call_counter_size
    }

    /// Maximum depth of the implicit return stack.
    pub fn irstack_capacity(&self) -> usize {
        if self.return_stack_size > 0 {
            1 << self.return_stack_size
        } else {
            1 << self.call_counter_size
        }
    }
}
