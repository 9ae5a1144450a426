// Copyright (C) 2025 FZI Forschungszentrum Informatik
// SPDX-License-Identifier: Apache-2.0

use super::*;

use crate::decoder::payload::{AddressInfo, Branch, Start};

#[derive(Default)]
struct Collector {
    pcs: Vec<u64>,
    epcs: Vec<u64>,
    traps: usize,
}

impl ReportTrace for Collector {
    fn report_pc(&mut self, pc: u64) {
        self.pcs.push(pc);
    }

    fn report_epc(&mut self, epc: u64) {
        self.epcs.push(epc);
    }

    fn report_trap(&mut self, _trap: &Trap) {
        self.traps += 1;
    }
}

fn support(qual_status: QualStatus, ioptions: IOptions) -> Payload {
    Payload::Synchronization(Synchronization::Support(Support {
        ienable: true,
        encoder_mode: 0,
        qual_status,
        ioptions,
    }))
}

fn start(address: u64, branch: bool) -> Payload {
    Payload::Synchronization(Synchronization::Start(Start {
        branch,
        privilege: Privilege::Machine,
        address,
    }))
}

fn address(delta: u64) -> Payload {
    Payload::Address(AddressInfo {
        address: delta,
        notify: false,
        updiscon: false,
        irreport: false,
        irdepth: 0,
    })
}

fn branches(branches: u8, branch_map: u64, delta: Option<u64>) -> Payload {
    Payload::Branch(Branch {
        branches,
        branch_map,
        address: delta.map(|address| AddressInfo {
            address,
            notify: false,
            updiscon: false,
            irreport: false,
            irdepth: 0,
        }),
    })
}

/// Feed payloads in order, collecting every reported PC
fn trace(
    map: &InstructionMap,
    payloads: &[Payload],
) -> (Vec<u64>, Result<Flow, error::Kind>) {
    let mut sink = Collector::default();
    let mut tracer = Tracer::new(DiscoveryResponse::default(), map, &mut sink);
    for payload in payloads {
        match tracer.process_te_inst(payload) {
            Ok(Flow::Continue) => {}
            Ok(Flow::EndOfTrace) => {
                drop(tracer);
                return (sink.pcs, Ok(Flow::EndOfTrace));
            }
            Err(err) => {
                let kind = err.kind;
                drop(tracer);
                return (sink.pcs, Err(kind));
            }
        }
    }
    drop(tracer);
    (sink.pcs, Ok(Flow::Continue))
}

#[test]
fn linear_fragment() {
    let map = InstructionMap::from_pairs([
        (0x1000, ("addi", "x1, x0, 1")),
        (0x1004, ("addi", "x2, x0, 2")),
    ]);
    let payloads = [
        support(QualStatus::NoChange, IOptions::default()),
        start(0x1000, true),
    ];
    let (pcs, flow) = trace(&map, &payloads);
    assert_eq!(flow, Ok(Flow::Continue));
    assert_eq!(pcs, [0x1000]);
}

#[test]
fn inferable_jump() {
    let map = InstructionMap::from_pairs([
        (0x1000, ("jal", "0x8")),
        (0x1008, ("addi", "x3, x0, 3")),
        (0x100c, ("addi", "x4, x0, 4")),
    ]);
    let payloads = [
        support(QualStatus::NoChange, IOptions::default()),
        start(0x1000, true),
        address(0x8),
    ];
    let (pcs, flow) = trace(&map, &payloads);
    assert_eq!(flow, Ok(Flow::Continue));
    assert_eq!(pcs, [0x1000, 0x1008]);
}

#[test]
fn single_branch_taken() {
    let map = InstructionMap::from_pairs([
        (0x1000, ("beq", "a4, a5, 0x10")),
        (0x1010, ("addi", "x5, x0, 5")),
    ]);
    let payloads = [
        support(QualStatus::NoChange, IOptions::default()),
        // branch bit 0 reports the branch at the start address as taken
        start(0x1000, false),
        address(0x10),
    ];
    let (pcs, flow) = trace(&map, &payloads);
    assert_eq!(flow, Ok(Flow::Continue));
    assert_eq!(pcs, [0x1000, 0x1010]);
}

#[test]
fn single_branch_not_taken() {
    let map = InstructionMap::from_pairs([
        (0x1000, ("beq", "a4, a5, 0x10")),
        (0x1004, ("addi", "x5, x0, 5")),
        (0x1010, ("addi", "x6, x0, 6")),
    ]);
    let payloads = [
        support(QualStatus::NoChange, IOptions::default()),
        start(0x1000, true),
        address(0x4),
    ];
    let (pcs, flow) = trace(&map, &payloads);
    assert_eq!(flow, Ok(Flow::Continue));
    assert_eq!(pcs, [0x1000, 0x1004]);
}

#[test]
fn uninferable_jump_target_from_packet() {
    let map = InstructionMap::from_pairs([
        (0x1000, ("jalr", "x0, x5, 0")),
        (0x1020, ("addi", "x6, x0, 6")),
    ]);
    let payloads = [
        support(QualStatus::NoChange, IOptions::default()),
        start(0x1000, true),
        address(0x20),
    ];
    let (pcs, flow) = trace(&map, &payloads);
    assert_eq!(flow, Ok(Flow::Continue));
    assert_eq!(pcs, [0x1000, 0x1020]);
}

#[test]
fn branch_packet_resolves_later_branch() {
    let map = InstructionMap::from_pairs([
        (0x1000, ("addi", "x1, x0, 1")),
        (0x1004, ("beq", "a4, a5, 0x10")),
        (0x1014, ("addi", "x2, x0, 2")),
    ]);
    let payloads = [
        support(QualStatus::NoChange, IOptions::default()),
        start(0x1000, true),
        branches(1, 0, Some(0x14)),
    ];
    let (pcs, flow) = trace(&map, &payloads);
    assert_eq!(flow, Ok(Flow::Continue));
    assert_eq!(pcs, [0x1000, 0x1004, 0x1014]);
}

#[test]
fn full_branch_map_stops_at_last_branch() {
    // a loop of one branch and one compressed jump; every outcome is taken
    let map = InstructionMap::from_pairs([
        (0x1000, ("beq", "a0, a1, 0x8")),
        (0x1008, ("c.j", "-8")),
    ]);
    let mut sink = Collector::default();
    let mut tracer = Tracer::new(DiscoveryResponse::default(), &map, &mut sink);

    let payloads = [
        support(QualStatus::NoChange, IOptions::default()),
        start(0x1000, false),
        branches(0, 0, None),
    ];
    for payload in &payloads {
        assert_eq!(tracer.process_te_inst(payload).unwrap(), Flow::Continue);
    }
    // 32 outcomes buffered, 31 of them resolved before the stop
    assert!(!tracer.state().stop_at_last_branch);
    assert_eq!(tracer.state().branch_map.pending(), 1);
    assert_eq!(tracer.state().pc, 0x1000);

    // each resolved outcome retires the branch target and the jump back
    let mut expected = vec![0x1000];
    for _ in 0..31 {
        expected.push(0x1008);
        expected.push(0x1000);
    }
    drop(tracer);
    assert_eq!(sink.pcs, expected);
}

#[test]
fn natural_arrival_and_ended_ntr_second_pass() {
    let map = InstructionMap::from_pairs([
        (0x1000, ("addi", "x1, x0, 1")),
        (0x1004, ("addi", "x2, x0, 2")),
        (0x1008, ("jalr", "x0, x5, 0")),
    ]);
    let mut sink = Collector::default();
    let mut tracer = Tracer::new(DiscoveryResponse::default(), &map, &mut sink);

    for payload in [
        support(QualStatus::NoChange, IOptions::default()),
        start(0x1000, true),
        // stops via notification, the preceding sync packet has no notify
        address(0x4),
        // arrives naturally, retirement not final yet
        address(0x4),
    ] {
        assert_eq!(tracer.process_te_inst(&payload).unwrap(), Flow::Continue);
    }
    assert!(tracer.state().inferred_address);

    // qualification ended without the address being retired again
    let ended = support(QualStatus::EndedNtr, IOptions::default());
    assert_eq!(tracer.process_te_inst(&ended).unwrap(), Flow::Continue);
    assert!(!tracer.state().inferred_address);
    assert!(tracer.state().start_of_trace);
    drop(tracer);
    assert_eq!(sink.pcs, [0x1000, 0x1004, 0x1008, 0x1008]);
}

#[test]
fn implicit_return_pops_call_stack() {
    let ioptions = IOptions {
        implicit_return: true,
        ..IOptions::default()
    };
    let map = InstructionMap::from_pairs([
        (0x1000, ("jal", "ra, 0x1000")),
        (0x2000, ("addi", "x6, x0, 6")),
        (0x2004, ("jalr", "x0, x1, 0")),
        (0x1004, ("addi", "x7, x0, 7")),
    ]);
    let payloads = [
        support(QualStatus::NoChange, ioptions),
        start(0x1000, true),
        address(0x4),
    ];
    let (pcs, flow) = trace(&map, &payloads);
    assert_eq!(flow, Ok(Flow::Continue));
    assert_eq!(pcs, [0x1000, 0x2000, 0x2004, 0x1004]);
}

#[test]
fn return_stack_eviction_at_capacity() {
    // default discovery parameters bound the stack to one entry
    let ioptions = IOptions {
        implicit_return: true,
        ..IOptions::default()
    };
    let map = InstructionMap::from_pairs([
        (0x1000, ("jal", "ra, 0x100")),
        (0x1100, ("jal", "ra, 0x100")),
        (0x1200, ("jalr", "x0, x1, 0")),
        (0x1104, ("addi", "x7, x0, 7")),
    ]);
    let mut sink = Collector::default();
    let mut tracer = Tracer::new(DiscoveryResponse::default(), &map, &mut sink);
    for payload in [
        support(QualStatus::NoChange, ioptions),
        start(0x1000, true),
        address(0x104),
    ] {
        assert_eq!(tracer.process_te_inst(&payload).unwrap(), Flow::Continue);
    }
    // the first call's link address was evicted by the second
    assert_eq!(tracer.state().return_stack.depth(), 0);
    drop(tracer);
    assert_eq!(sink.pcs, [0x1000, 0x1100, 0x1200, 0x1104]);
}

#[test]
fn sequential_jump_inference() {
    let ioptions = IOptions {
        sijump: true,
        ..IOptions::default()
    };
    let map = InstructionMap::from_pairs([
        (0x1000, ("auipc", "a5, 0x2")),
        (0x1004, ("jalr", "x0, a5, 0x10")),
        (0x3010, ("addi", "x1, x0, 1")),
    ]);
    let payloads = [
        support(QualStatus::NoChange, ioptions),
        start(0x1000, true),
        address(0x2010),
    ];
    let (pcs, flow) = trace(&map, &payloads);
    assert_eq!(flow, Ok(Flow::Continue));
    assert_eq!(pcs, [0x1000, 0x1004, 0x3010]);
}

#[test]
fn end_of_trace_sentinel() {
    let map = InstructionMap::from_pairs([
        (0x1000, ("addi", "x1, x0, 1")),
        (0x1004, ("c.j", "0")),
    ]);
    let payloads = [
        support(QualStatus::NoChange, IOptions::default()),
        start(0x1000, true),
        address(0x4),
    ];
    let (pcs, flow) = trace(&map, &payloads);
    assert_eq!(flow, Ok(Flow::EndOfTrace));
    assert_eq!(pcs, [0x1000, 0x1004]);
}

#[test]
fn trap_packet_reports_and_resynchronizes() {
    let map = InstructionMap::from_pairs([
        (0x1000, ("addi", "x1, x0, 1")),
        (0x1004, ("ecall", "")),
        (0x8000, ("addi", "x2, x0, 2")),
    ]);
    let mut sink = Collector::default();
    let mut tracer = Tracer::new(DiscoveryResponse::default(), &map, &mut sink);
    for payload in [
        support(QualStatus::NoChange, IOptions::default()),
        start(0x1000, true),
        Payload::Synchronization(Synchronization::Trap(Trap {
            branch: true,
            privilege: Privilege::Machine,
            ecause: 8,
            interrupt: false,
            thaddr: true,
            address: 0x8000,
            tval: 0,
        })),
    ] {
        assert_eq!(tracer.process_te_inst(&payload).unwrap(), Flow::Continue);
    }
    drop(tracer);
    assert_eq!(sink.traps, 1);
    assert_eq!(sink.epcs, [0x1004]);
    assert_eq!(sink.pcs, [0x1000, 0x8000]);
}

#[test]
fn second_start_packet_follows_to_address() {
    let map = InstructionMap::from_pairs([
        (0x1000, ("addi", "x1, x0, 1")),
        (0x1004, ("addi", "x2, x0, 2")),
        (0x1008, ("addi", "x3, x0, 3")),
    ]);
    let payloads = [
        support(QualStatus::NoChange, IOptions::default()),
        start(0x1000, true),
        start(0x1008, true),
    ];
    let (pcs, flow) = trace(&map, &payloads);
    assert_eq!(flow, Ok(Flow::Continue));
    assert_eq!(pcs, [0x1000, 0x1004, 0x1008]);
}

#[test]
fn full_address_mode() {
    let ioptions = IOptions {
        delta_address: false,
        full_address: true,
        ..IOptions::default()
    };
    let map = InstructionMap::from_pairs([
        (0x1000, ("jalr", "x0, x5, 0")),
        (0x4000, ("addi", "x1, x0, 1")),
    ]);
    let payloads = [
        support(QualStatus::NoChange, ioptions),
        start(0x1000, true),
        address(0x4000),
    ];
    let (pcs, flow) = trace(&map, &payloads);
    assert_eq!(flow, Ok(Flow::Continue));
    assert_eq!(pcs, [0x1000, 0x4000]);
}

#[test]
fn packet_before_synchronization_is_fatal() {
    let map = InstructionMap::from_pairs([(0x1000, ("addi", "x1, x0, 1"))]);
    let payloads = [address(0x1000)];
    let (pcs, flow) = trace(&map, &payloads);
    assert_eq!(flow, Err(error::Kind::StartOfTrace));
    assert!(pcs.is_empty());
}

#[test]
fn unknown_address_is_fatal() {
    let map = InstructionMap::from_pairs([(0x1000, ("addi", "x1, x0, 1"))]);
    let payloads = [
        support(QualStatus::NoChange, IOptions::default()),
        start(0x2000, true),
    ];
    let (pcs, flow) = trace(&map, &payloads);
    assert_eq!(flow, Err(error::Kind::UnknownAddress(0x2000)));
    assert!(pcs.is_empty());
}

#[test]
fn unprocessed_branches_are_fatal() {
    let map = InstructionMap::from_pairs([
        (0x1000, ("jalr", "x0, x5, 0")),
        (0x1010, ("addi", "x1, x0, 1")),
    ]);
    let payloads = [
        support(QualStatus::NoChange, IOptions::default()),
        start(0x1000, true),
        // one outcome buffered, but the walk ends on a non-branch
        branches(1, 1, Some(0x10)),
    ];
    let (pcs, flow) = trace(&map, &payloads);
    assert_eq!(flow, Err(error::Kind::UnprocessedBranches(1)));
    assert_eq!(pcs, [0x1000, 0x1010]);
}

#[test]
fn branch_map_resolves_oldest_first() {
    let mut map = BranchMap::default();
    map.extend(3, 0b010);
    assert_eq!(map.resolve(), Some(true));
    assert_eq!(map.resolve(), Some(false));
    assert_eq!(map.resolve(), Some(true));
    assert_eq!(map.resolve(), None);
}

#[test]
fn branch_map_records_newest_last() {
    let mut map = BranchMap::default();
    map.record(true);
    map.record(false);
    assert_eq!(map.pending(), 2);
    assert_eq!(map.raw(), 0b10);
    assert_eq!(map.resolve(), Some(true));
    assert_eq!(map.resolve(), Some(false));
}

#[test]
fn branch_map_extension_is_newer() {
    let mut map = BranchMap::default();
    map.record(false);
    map.extend(2, 0b01);
    assert_eq!(map.pending(), 3);
    assert_eq!(map.resolve(), Some(false));
    assert_eq!(map.resolve(), Some(false));
    assert_eq!(map.resolve(), Some(true));
}

#[test]
fn branch_map_full_report_masks_undefined_bits() {
    let mut map = BranchMap::default();
    map.extend(0, u64::MAX);
    assert_eq!(map.pending(), 31);
    assert_eq!(map.raw(), 0x7fff_ffff);

    let mut map = BranchMap::default();
    map.extend(2, 0b111);
    assert_eq!(map.pending(), 2);
    assert_eq!(map.raw(), 0b11);
}

#[test]
fn discontinuity_while_stopping_at_last_branch_is_fatal() {
    let map = InstructionMap::from_pairs([
        (0x1000, ("beq", "a0, a1, 0x8")),
        (0x1004, ("jalr", "x0, x5, 0")),
        (0x1008, ("addi", "x1, x0, 1")),
    ]);
    let payloads = [
        support(QualStatus::NoChange, IOptions::default()),
        start(0x1000, true),
        branches(0, u64::MAX, None),
    ];
    let (pcs, flow) = trace(&map, &payloads);
    assert_eq!(flow, Err(error::Kind::UnexpectedUninferableDiscon));
    assert_eq!(pcs, [0x1000, 0x1004]);
}
