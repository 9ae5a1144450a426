// Copyright (C) 2025 FZI Forschungszentrum Informatik
// SPDX-License-Identifier: Apache-2.0

//! Implements the instruction tracing algorithm.
//!
//! A [Tracer] consumes the [payloads][crate::decoder::payload::Payload] of
//! one hart's packet stream in order and walks the program image one
//! instruction at a time, resolving branches against the buffered branch
//! map, following inferable jumps, consulting the implicit return stack
//! and jumping to reported addresses on uninferable discontinuities.
//! Every retired PC is delivered through the [ReportTrace] callbacks.

pub mod error;
pub mod stack;

#[cfg(test)]
mod tests;

use std::fmt;

use crate::decoder::payload::{IOptions, Payload, QualStatus, Support, Synchronization, Trap};
use crate::disassembler::InstructionMap;
use crate::instruction::Instruction;
use crate::types::Privilege;
use crate::DiscoveryResponse;

use error::Kind;
use stack::ReturnStack;

pub use error::Error;

/// Outcome of processing a single packet.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum Flow {
    /// The packet was processed; feed the next one.
    Continue,
    /// The end-of-trace sentinel was reached; the stream is exhausted.
    EndOfTrace,
}

/// Collects the callbacks which report the tracing output.
pub trait ReportTrace {
    /// Called for every retired program counter, in retirement order.
    fn report_pc(&mut self, _pc: u64) {}
    /// Called with the exception program counter when a trap packet
    /// reports an exception.
    fn report_epc(&mut self, _epc: u64) {}
    /// Called when a trap packet is received, before any PC it retires.
    fn report_trap(&mut self, _trap: &Trap) {}
}

/// The `notify`, `updiscon` and `irreport` bits of the preceding packet
///
/// Several stop conditions compare bits of the current packet against the
/// packet immediately before it in the stream. A field is [`None`] if the
/// preceding packet had no such field; a comparison against [`None`]
/// never matches.
#[derive(Copy, Clone, Debug, Default, PartialEq, Eq)]
pub struct PrecedingBits {
    pub notify: Option<bool>,
    pub updiscon: Option<bool>,
    pub irreport: Option<bool>,
}

impl PrecedingBits {
    fn of(payload: &Payload) -> Self {
        match payload {
            // the short form of format 1 carries the fields' defaults
            Payload::Branch(branch) if branch.address.is_none() => PrecedingBits {
                notify: Some(false),
                updiscon: Some(false),
                irreport: Some(false),
            },
            Payload::Synchronization(_) => PrecedingBits::default(),
            _ => {
                let info = payload.address_info();
                PrecedingBits {
                    notify: info.map(|i| i.notify),
                    updiscon: info.map(|i| i.updiscon),
                    irreport: info.map(|i| i.irreport),
                }
            }
        }
    }
}

/// Branch outcomes buffered for resolution
///
/// Bit 0 of the buffer is the outcome of the next branch to resolve: an
/// unset bit means taken, a set bit not taken. Outcomes are consumed
/// LSB-first and the buffer shifts right on every resolution.
#[derive(Copy, Clone, Debug, Default, Eq, PartialEq)]
pub struct BranchMap {
    pending: u8,
    outcomes: u64,
}

impl BranchMap {
    /// Outcomes carried by a full branch map.
    const FULL: u8 = 31;

    /// Buffer the outcome of a single branch
    pub fn record(&mut self, taken: bool) {
        if !taken {
            self.outcomes |= 1u64.checked_shl(self.pending.into()).unwrap_or_default();
        }
        self.pending = self.pending.saturating_add(1);
    }

    /// Buffer the outcomes reported by a branch packet
    ///
    /// A reported count of 0 stands for a full map. The reported outcomes
    /// are newer than anything already buffered; bits beyond the count are
    /// undefined on the wire and ignored.
    pub fn extend(&mut self, reported: u8, outcomes: u64) {
        let count = if reported == 0 { Self::FULL } else { reported };
        let outcomes = outcomes & !u64::MAX.checked_shl(count.into()).unwrap_or_default();
        self.outcomes |= outcomes.checked_shl(self.pending.into()).unwrap_or_default();
        self.pending = self.pending.saturating_add(count);
    }

    /// Resolve the oldest buffered branch, reporting whether it was taken
    ///
    /// Returns [`None`] if no outcome is buffered.
    pub fn resolve(&mut self) -> Option<bool> {
        self.pending = self.pending.checked_sub(1)?;
        let taken = self.outcomes & 1 == 0;
        self.outcomes >>= 1;
        Some(taken)
    }

    /// Number of outcomes still buffered
    pub fn pending(&self) -> u8 {
        self.pending
    }

    /// Raw outcome bits, oldest in bit 0
    pub fn raw(&self) -> u64 {
        self.outcomes
    }
}

/// The mutable state carried through the reconstruction
///
/// `pc` is always the address of the next instruction to be retired;
/// `last_pc` the previously retired one, initially equal to `pc` so that
/// sequential jump detection is well-defined at trace start.
#[derive(Clone)]
pub struct TraceState {
    pub pc: u64,
    pub last_pc: u64,
    /// Address reconstructed from the most recent packet.
    pub address: u64,
    /// Buffered, unresolved branch outcomes.
    pub branch_map: BranchMap,
    /// Set between an F1 with branches == 0 and resolving that branch.
    pub stop_at_last_branch: bool,
    /// The reported address was reached once but may not be the final
    /// retirement; a second pass is expected.
    pub inferred_address: bool,
    /// True until the first start or trap packet has been processed.
    pub start_of_trace: bool,
    pub privilege: Privilege,
    /// The currently active encoder options.
    pub options: IOptions,
    pub return_stack: ReturnStack,
    pub preceding: PrecedingBits,
}

impl TraceState {
    fn new(discovery: &DiscoveryResponse) -> Self {
        TraceState {
            pc: 0,
            last_pc: 0,
            address: 0,
            branch_map: BranchMap::default(),
            stop_at_last_branch: false,
            inferred_address: false,
            start_of_trace: true,
            privilege: Privilege::default(),
            options: IOptions::default(),
            return_stack: ReturnStack::new(discovery.irstack_capacity()),
            preceding: PrecedingBits::default(),
        }
    }
}

impl fmt::Debug for TraceState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_fmt(format_args!(
            "TraceState {{ pc: {:#x}, last_pc: {:#x}, address: {:#x}, branches: {}, \
             branch_map: {:#b}, stop_at_last_branch: {}, inferred_address: {}, \
             start_of_trace: {}, privilege: {:?}, irstack_depth: {} }}",
            self.pc,
            self.last_pc,
            self.address,
            self.branch_map.pending(),
            self.branch_map.raw(),
            self.stop_at_last_branch,
            self.inferred_address,
            self.start_of_trace,
            self.privilege,
            self.return_stack.depth(),
        ))
    }
}

/// Drives the tracing algorithm over a packet stream
pub struct Tracer<'a> {
    state: TraceState,
    discovery: DiscoveryResponse,
    map: &'a InstructionMap,
    report: &'a mut dyn ReportTrace,
}

impl<'a> Tracer<'a> {
    pub fn new(
        discovery: DiscoveryResponse,
        map: &'a InstructionMap,
        report: &'a mut dyn ReportTrace,
    ) -> Self {
        Tracer {
            state: TraceState::new(&discovery),
            discovery,
            map,
            report,
        }
    }

    /// The current tracing state
    pub fn state(&self) -> &TraceState {
        &self.state
    }

    /// Process a single packet payload
    ///
    /// Payloads must be fed in stream order; stop conditions depend on
    /// field comparisons against the immediately preceding packet.
    pub fn process_te_inst(&mut self, payload: &Payload) -> Result<Flow, Error> {
        let result = self.dispatch(payload);
        self.state.preceding = PrecedingBits::of(payload);
        match result {
            Ok(()) => Ok(Flow::Continue),
            Err(Kind::EndOfTrace) => Ok(Flow::EndOfTrace),
            Err(kind) => Err(Error {
                state: self.state.clone(),
                kind,
            }),
        }
    }

    fn dispatch(&mut self, payload: &Payload) -> Result<(), Kind> {
        match payload {
            Payload::Synchronization(sync) => self.process_sync(sync, payload),
            _ if self.state.start_of_trace => Err(Kind::StartOfTrace),
            Payload::Address(info) => {
                self.state.stop_at_last_branch = false;
                self.update_address(info.address);
                self.follow_execution_path(payload)
            }
            Payload::Branch(branch) => {
                if branch.branches != 0 {
                    self.state.stop_at_last_branch = false;
                    if let Some(info) = &branch.address {
                        self.update_address(info.address);
                    }
                }
                self.state.stop_at_last_branch = branch.branches == 0;
                self.state
                    .branch_map
                    .extend(branch.branches, branch.branch_map);
                self.follow_execution_path(payload)
            }
        }
    }

    fn process_sync(&mut self, sync: &Synchronization, payload: &Payload) -> Result<(), Kind> {
        match sync {
            Synchronization::Support(support) => self.process_support(support, payload),
            // context tracking is out of scope for this decoder
            Synchronization::Context(_) => Ok(()),
            Synchronization::Trap(trap) => {
                self.report.report_trap(trap);
                if !trap.interrupt {
                    let epc = self.exception_address(trap, payload)?;
                    self.report.report_epc(epc);
                }
                if !trap.thaddr {
                    // the trap retires no instruction
                    return Ok(());
                }
                self.sync_intake(trap.address, trap.branch, trap.privilege, true, payload)
            }
            Synchronization::Start(start) => {
                self.sync_intake(start.address, start.branch, start.privilege, false, payload)
            }
        }
    }

    /// Common intake of start and trap packets carrying a retirement
    fn sync_intake(
        &mut self,
        address: u64,
        branch: bool,
        privilege: Privilege,
        is_trap: bool,
        payload: &Payload,
    ) -> Result<(), Kind> {
        self.state.inferred_address = false;
        self.state.address = address << self.discovery.iaddress_lsb;
        if is_trap || self.state.start_of_trace {
            self.state.branch_map = BranchMap::default();
        }
        if self.get_instr(self.state.address)?.is_branch() {
            // the branch bit reports 0 for taken, 1 for not taken
            self.state.branch_map.record(!branch);
        }
        if !is_trap && !self.state.start_of_trace {
            self.follow_execution_path(payload)
        } else {
            self.state.pc = self.state.address;
            self.report.report_pc(self.state.pc);
            self.state.last_pc = self.state.pc;
            self.state.privilege = privilege;
            self.state.start_of_trace = false;
            self.state.return_stack.clear();
            Ok(())
        }
    }

    fn process_support(&mut self, support: &Support, payload: &Payload) -> Result<(), Kind> {
        self.state.options = support.ioptions;
        if support.qual_status != QualStatus::NoChange {
            // trace ended, get ready to start again
            self.state.start_of_trace = true;
        }
        if support.qual_status == QualStatus::EndedNtr && self.state.inferred_address {
            // re-drive the pending second pass up to the inferred address
            let previous_address = self.state.pc;
            self.state.inferred_address = false;
            loop {
                let stop_here = self.next_pc(previous_address, payload)?;
                self.report.report_pc(self.state.pc);
                if stop_here {
                    return Ok(());
                }
            }
        }
        Ok(())
    }

    /// Advance the PC, emitting every retired address, until a termination
    /// condition fires
    fn follow_execution_path(&mut self, payload: &Payload) -> Result<(), Kind> {
        let previous_address = self.state.pc;
        loop {
            if self.state.inferred_address {
                // iterate again from the previously reported address to
                // find the second occurrence
                let stop_here = self.next_pc(previous_address, payload)?;
                self.report.report_pc(self.state.pc);
                if stop_here {
                    self.state.inferred_address = false;
                }
                continue;
            }

            let stop_here = self.next_pc(self.state.address, payload)?;
            self.report.report_pc(self.state.pc);

            if self.state.branch_map.pending() == 1
                && self.get_instr(self.state.pc)?.is_branch()
                && self.state.stop_at_last_branch
            {
                // the final branch's retirement is not known yet
                self.state.stop_at_last_branch = false;
                return Ok(());
            }
            if stop_here {
                // reached the reported address via an uninferable
                // discontinuity
                if self.unprocessed_branches(self.state.pc)? {
                    return Err(Kind::UnprocessedBranches(self.state.branch_map.pending()));
                }
                return Ok(());
            }

            if payload.is_synchronization() {
                if self.state.pc == self.state.address
                    && !self.unprocessed_branches(self.state.pc)?
                    && (payload.privilege() == Some(self.state.privilege)
                        || self.get_instr(self.state.last_pc)?.is_return_from_trap())
                {
                    return Ok(());
                }
            } else if self.state.pc == self.state.address && !self.state.stop_at_last_branch {
                let info = payload.address_info();
                let notify = info.map(|i| i.notify).unwrap_or_default();
                let updiscon = info.map(|i| i.updiscon).unwrap_or_default();
                let irreport = info.map(|i| i.irreport).unwrap_or_default();

                if Some(notify) != self.state.preceding.notify
                    && !self.unprocessed_branches(self.state.pc)?
                {
                    // reached the reported address due to a notification,
                    // not as an uninferable jump target
                    return Ok(());
                }
                if !self.get_instr(self.state.last_pc)?.is_uninferable_discon()
                    && Some(updiscon) == self.state.preceding.updiscon
                    && !self.unprocessed_branches(self.state.pc)?
                    && (Some(irreport) == self.state.preceding.irreport
                        || info.map(|i| i.irdepth)
                            == Some(self.state.return_stack.depth() as u64))
                {
                    // reached the reported address, but this may not be
                    // the final retirement of it
                    self.state.inferred_address = true;
                    return Ok(());
                }
            }
        }
    }

    /// Compute the next PC
    ///
    /// Returns true if the reported address was reached via an
    /// uninferable discontinuity, i.e. no further instruction can be
    /// traced from the current packet. The computed PC is rejected here
    /// if it does not map to an instruction, so it is validated before
    /// any caller reports it.
    fn next_pc(&mut self, address: u64, payload: &Payload) -> Result<bool, Kind> {
        let instr = self.get_instr(self.state.pc)?;
        let this_pc = self.state.pc;
        let mut stop_here = false;

        if instr.is_inferable_jump() {
            self.state.pc = this_pc.wrapping_add_signed(self.immediate(instr)?);
        } else if self.is_sequential_jump(instr)? {
            // lui/auipc followed by a jump through the same register
            self.state.pc = self.sequential_jump_target(this_pc, self.state.last_pc)?;
        } else if self.is_implicit_return(instr, payload) {
            self.state.pc = self.state.return_stack.pop().ok_or(Kind::EmptyReturnStack)?;
        } else if instr.is_uninferable_discon() {
            if self.state.stop_at_last_branch {
                return Err(Kind::UnexpectedUninferableDiscon);
            }
            self.state.pc = address;
            stop_here = true;
        } else if self.is_taken_branch(instr)? {
            let offset = if instr.is_compressed_branch() || instr.is_pseudo_branch() {
                // two-operand forms carry the target in the rs1 slot
                instr
                    .rs1_value()
                    .ok_or_else(|| Kind::MissingImmediate(instr.clone()))?
            } else {
                self.immediate(instr)?
            };
            self.state.pc = this_pc.wrapping_add_signed(offset);
        } else {
            self.state.pc = this_pc.wrapping_add(instr.size());
        }

        if self.state.options.implicit_return && instr.is_call() {
            self.state
                .return_stack
                .push(this_pc.wrapping_add(instr.size()));
        }
        self.state.last_pc = this_pc;
        // plain lookup rather than get_instr: the sentinel instruction's
        // own retirement is still reported
        self.map
            .instr(self.state.pc)
            .ok_or(Kind::UnknownAddress(self.state.pc))?;
        Ok(stop_here)
    }

    /// Determine the address to report for an exception
    fn exception_address(&mut self, trap: &Trap, payload: &Payload) -> Result<u64, Kind> {
        let instr = self.get_instr(self.state.pc)?;
        if instr.is_uninferable_discon() && !trap.thaddr {
            return Ok(trap.address);
        }
        if instr.is_ecall_or_ebreak() {
            return Ok(self.state.pc);
        }
        self.next_pc(self.state.pc, payload)?;
        Ok(self.state.pc)
    }

    fn get_instr(&self, address: u64) -> Result<&'a Instruction, Kind> {
        let instr = self
            .map
            .instr(address)
            .ok_or(Kind::UnknownAddress(address))?;
        if instr.is_end_of_trace() {
            return Err(Kind::EndOfTrace);
        }
        Ok(instr)
    }

    fn immediate(&self, instr: &Instruction) -> Result<i64, Kind> {
        instr
            .imm_value()
            .ok_or_else(|| Kind::MissingImmediate(instr.clone()))
    }

    /// Check whether branches are left unresolved at `address`
    ///
    /// One buffered outcome is expected if the instruction at `address`
    /// is itself a branch.
    fn unprocessed_branches(&self, address: u64) -> Result<bool, Kind> {
        let limit = if self.get_instr(address)?.is_branch() {
            1
        } else {
            0
        };
        Ok(self.state.branch_map.pending() != limit)
    }

    #[allow(clippy::wrong_self_convention)]
    fn is_taken_branch(&mut self, instr: &Instruction) -> Result<bool, Kind> {
        if !instr.is_branch() {
            return Ok(false);
        }
        self.state
            .branch_map
            .resolve()
            .ok_or(Kind::UnresolvableBranch)
    }

    fn is_sequential_jump(&self, instr: &Instruction) -> Result<bool, Kind> {
        if !(instr.is_uninferable_jump() && self.state.options.sijump) {
            return Ok(false);
        }
        let prev = self.get_instr(self.state.last_pc)?;
        if matches!(prev.opcode.as_str(), "auipc" | "lui" | "c.lui") {
            return Ok(match (instr.rs1_index(), prev.rd_index()) {
                (Some(rs1), Some(rd)) => rs1 == rd,
                _ => false,
            });
        }
        Ok(false)
    }

    /// Find the target of a sequentially inferable jump
    fn sequential_jump_target(&self, address: u64, prev_address: u64) -> Result<u64, Kind> {
        let instr = self.get_instr(address)?;
        let prev = self.get_instr(prev_address)?;
        let mut target = if prev.opcode == "auipc" {
            prev_address
        } else {
            0
        };
        // the upper immediate occupies bits 31:12
        target = target.wrapping_add_signed(self.immediate(prev)?.wrapping_shl(12));
        if instr.opcode == "jalr" {
            target = target.wrapping_add_signed(self.immediate(instr)?);
        }
        Ok(target)
    }

    fn is_implicit_return(&self, instr: &Instruction, payload: &Payload) -> bool {
        if !self.state.options.implicit_return || !instr.is_return() {
            return false;
        }
        if let Some(info) = payload.address_info() {
            // an explicit irreport/irdepth pair disconfirms the return
            if Some(info.irreport) != self.state.preceding.irreport
                && info.irdepth == self.state.return_stack.depth() as u64
            {
                return false;
            }
        }
        self.state.return_stack.depth() > 0
    }

    fn update_address(&mut self, address: u64) {
        let address = address << self.discovery.iaddress_lsb;
        if self.state.options.full_address {
            self.state.address = address;
        } else {
            // deltas arrive sign-extended in wrapped representation
            self.state.address = self.state.address.wrapping_add(address);
        }
    }
}
