// Copyright (C) 2025 FZI Forschungszentrum Informatik
// SPDX-License-Identifier: Apache-2.0

//! Instruction model and control flow classification
//!
//! The tracer never decodes instruction bits itself; it works on the
//! mnemonic and operand strings produced by the disassembler. An
//! [Instruction] captures the operand tokens relevant for control flow
//! reconstruction, and its predicate methods classify the instruction the
//! way the tracing algorithm needs it.

/// Opcodes resolving a branch, including pseudo and alias forms.
const BRANCH_OPCODES: &[&str] = &[
    "beq", "bne", "blt", "bge", "bltu", "bgeu", "bgt", "ble", "bgtu", "bleu", "c.beqz", "c.bnez",
    "beqz", "bnez", "blez", "bgez", "bltz", "bgtz",
];

/// Two-operand branch forms whose target token lands in the `rs1` slot.
const PSEUDO_BRANCH_OPCODES: &[&str] = &["beqz", "bnez", "blez", "bgez", "bltz", "bgtz"];

const COMPRESSED_BRANCH_OPCODES: &[&str] = &["c.beqz", "c.bnez"];

const RETURN_FROM_TRAP_OPCODES: &[&str] = &["uret", "sret", "mret", "dret"];

const TRAP_OPCODES: &[&str] = &["ecall", "ebreak", "c.ebreak"];

/// Jump opcodes whose literal `0` immediate ends the trace.
const SENTINEL_OPCODES: &[&str] = &["jal", "c.j", "c.jal", "c.jr", "c.jalr", "j"];

/// A decoded RISC-V instruction as seen through the disassembler
///
/// Only the operand tokens needed by the tracing algorithm are assigned;
/// instructions outside the control flow sets keep all operands unset.
/// Tokens carry the textual form found in the disassembly.
#[derive(Clone, Debug, Default, Eq, PartialEq)]
pub struct Instruction {
    /// Lowercase mnemonic.
    pub opcode: String,
    pub rd: Option<String>,
    pub rs1: Option<String>,
    pub rs2: Option<String>,
    pub imm: Option<String>,
}

impl Instruction {
    /// Build an instruction from a mnemonic and its operand string
    ///
    /// The operand string is split on commas, with `imm(rs)` memory forms
    /// first rewritten to `imm, rs`. Which token lands in which slot
    /// depends on the opcode; single-operand jump-and-link forms take the
    /// ISA-implicit `ra` as link register.
    pub fn decode(mnemonic: &str, op_str: &str) -> Self {
        let opcode = mnemonic.to_lowercase();
        let ops = split_operands(op_str);
        let token = |index: usize| ops.get(index).cloned();

        let mut instr = Instruction {
            opcode,
            ..Default::default()
        };
        match instr.opcode.as_str() {
            "jalr" => match ops.len() {
                0 | 1 => {
                    instr.rd = Some("ra".into());
                    instr.rs1 = token(0);
                    instr.imm = Some("0".into());
                }
                2 => {
                    instr.rd = token(0);
                    instr.rs1 = token(1);
                    instr.imm = Some("0".into());
                }
                _ => {
                    instr.rd = token(0);
                    instr.rs1 = token(1);
                    instr.imm = token(2);
                }
            },
            "jal" | "c.jal" => {
                if ops.len() >= 2 {
                    instr.rd = token(0);
                    instr.imm = token(1);
                } else {
                    instr.rd = Some("ra".into());
                    instr.imm = token(0);
                }
            }
            "c.j" | "j" => {
                instr.rd = Some("zero".into());
                instr.imm = token(0);
            }
            "c.jr" => {
                instr.rd = Some("zero".into());
                instr.rs1 = token(0);
                instr.imm = token(0);
            }
            "c.jalr" => {
                instr.rd = Some("ra".into());
                instr.rs1 = token(0);
                instr.imm = token(0);
            }
            "jr" => {
                instr.rd = Some("zero".into());
                instr.rs1 = token(0);
            }
            "ret" => {
                instr.rd = Some("zero".into());
                instr.rs1 = Some("ra".into());
            }
            "beq" | "bne" | "blt" | "bge" | "bltu" | "bgeu" | "bgt" | "ble" | "bgtu" | "bleu" => {
                instr.rs1 = token(0);
                instr.rs2 = token(1);
                instr.imm = token(2);
            }
            "c.beqz" | "c.bnez" | "beqz" | "bnez" | "blez" | "bgez" | "bltz" | "bgtz" => {
                instr.rd = token(0);
                instr.rs1 = token(1);
            }
            "lui" | "auipc" | "c.lui" => {
                instr.rd = token(0);
                instr.imm = token(1);
            }
            _ => {}
        }
        instr
    }

    /// Size of the instruction in bytes
    pub fn size(&self) -> u64 {
        if self.opcode.starts_with("c.") {
            2
        } else {
            4
        }
    }

    pub fn is_branch(&self) -> bool {
        BRANCH_OPCODES.contains(&self.opcode.as_str())
    }

    pub fn is_pseudo_branch(&self) -> bool {
        PSEUDO_BRANCH_OPCODES.contains(&self.opcode.as_str())
    }

    pub fn is_compressed_branch(&self) -> bool {
        COMPRESSED_BRANCH_OPCODES.contains(&self.opcode.as_str())
    }

    /// Whether the jump target is computable from the instruction alone
    pub fn is_inferable_jump(&self) -> bool {
        matches!(self.opcode.as_str(), "jal" | "c.j" | "c.jal" | "j")
            || (self.opcode == "jalr" && self.rs1_index() == Some(0))
    }

    /// Whether the jump target depends on a register value
    pub fn is_uninferable_jump(&self) -> bool {
        matches!(self.opcode.as_str(), "c.jr" | "c.jalr" | "jr" | "ret")
            || (self.opcode == "jalr" && self.rs1_index() != Some(0))
    }

    pub fn is_return_from_trap(&self) -> bool {
        RETURN_FROM_TRAP_OPCODES.contains(&self.opcode.as_str())
    }

    pub fn is_ecall_or_ebreak(&self) -> bool {
        TRAP_OPCODES.contains(&self.opcode.as_str())
    }

    /// Whether the next PC cannot be reconstructed from the disassembly
    pub fn is_uninferable_discon(&self) -> bool {
        self.is_uninferable_jump() || self.is_return_from_trap() || self.is_ecall_or_ebreak()
    }

    /// Whether the instruction pushes a return address
    ///
    /// Tail calls do not link and are excluded.
    pub fn is_call(&self) -> bool {
        matches!(self.opcode.as_str(), "c.jal" | "c.jalr")
            || (matches!(self.opcode.as_str(), "jal" | "jalr") && self.rd_index() == Some(1))
    }

    /// Whether the instruction is a function return by calling convention
    pub fn is_return(&self) -> bool {
        match self.opcode.as_str() {
            "ret" => true,
            "jalr" => self.rs1_index() == Some(1) && self.rd_index() == Some(0),
            "c.jr" => self.rs1_index() == Some(1),
            _ => false,
        }
    }

    /// Whether this instruction is the end-of-trace sentinel
    ///
    /// A jump with a literal `0` immediate spins in place; the encoder
    /// flow uses it to mark the end of the traced program.
    pub fn is_end_of_trace(&self) -> bool {
        SENTINEL_OPCODES.contains(&self.opcode.as_str()) && self.imm.as_deref() == Some("0")
    }

    pub fn rd_index(&self) -> Option<u8> {
        self.rd.as_deref().and_then(register_index)
    }

    pub fn rs1_index(&self) -> Option<u8> {
        self.rs1.as_deref().and_then(register_index)
    }

    /// The immediate operand as a signed value
    pub fn imm_value(&self) -> Option<i64> {
        self.imm.as_deref().and_then(parse_int)
    }

    /// The `rs1` token as a signed value
    ///
    /// Pseudo and compressed branch forms carry their target offset in
    /// this slot.
    pub fn rs1_value(&self) -> Option<i64> {
        self.rs1.as_deref().and_then(parse_int)
    }
}

fn split_operands(op_str: &str) -> Vec<String> {
    let rewritten = op_str.replace('(', ", ").replace(')', "");
    rewritten
        .split(',')
        .map(str::trim)
        .filter(|token| !token.is_empty())
        .map(str::to_owned)
        .collect()
}

/// Resolve a register token to its index
///
/// Accepts both ABI names and plain `xN` names. Anything else, including
/// numeric immediates, resolves to [`None`].
pub fn register_index(name: &str) -> Option<u8> {
    const ABI_NAMES: [&str; 32] = [
        "zero", "ra", "sp", "gp", "tp", "t0", "t1", "t2", "s0", "s1", "a0", "a1", "a2", "a3", "a4",
        "a5", "a6", "a7", "s2", "s3", "s4", "s5", "s6", "s7", "s8", "s9", "s10", "s11", "t3", "t4",
        "t5", "t6",
    ];
    if name == "fp" {
        return Some(8);
    }
    if let Some(rest) = name.strip_prefix('x') {
        let index: u8 = rest.parse().ok()?;
        return (index < 32).then_some(index);
    }
    ABI_NAMES.iter().position(|n| *n == name).map(|i| i as u8)
}

/// Parse an immediate token, accepting decimal and `0x` forms
pub(crate) fn parse_int(token: &str) -> Option<i64> {
    let (negative, rest) = match token.strip_prefix('-') {
        Some(rest) => (true, rest),
        None => (false, token),
    };
    let value = if let Some(hex) = rest.strip_prefix("0x") {
        i64::from_str_radix(hex, 16).ok()?
    } else {
        rest.parse().ok()?
    };
    Some(if negative { -value } else { value })
}
