// Copyright (C) 2025 FZI Forschungszentrum Informatik
// SPDX-License-Identifier: Apache-2.0

//! Construction of the address to instruction mapping
//!
//! The traced binary is disassembled once up front: every configured ELF
//! section is fed linearly through capstone in RISC-V 64 mode with the
//! compressed extension, and each decoded instruction is stored under its
//! virtual address. The mapping is immutable afterwards; the [tracer]
//! consults it for every reconstructed PC.
//!
//! [tracer]: crate::tracer

use std::collections::HashMap;
use std::fmt;
use std::fs;
use std::path::Path;

use capstone::arch::riscv::{ArchExtraMode, ArchMode};
use capstone::prelude::*;

use elf::endian::LittleEndian;
use elf::ElfBytes;

use crate::instruction::Instruction;

/// A single disassembled instruction
#[derive(Clone, Debug)]
pub struct Listing {
    /// Mnemonic as printed by the disassembler.
    pub mnemonic: String,
    /// Operand string as printed by the disassembler.
    pub op_str: String,
    /// The decoded operand view used by the tracer.
    pub instr: Instruction,
}

/// Immutable mapping from virtual addresses to instructions
#[derive(Clone, Debug, Default)]
pub struct InstructionMap {
    entries: HashMap<u64, Listing>,
}

impl InstructionMap {
    /// Disassemble the named sections of an ELF file
    pub fn from_elf(path: impl AsRef<Path>, sections: &[String]) -> Result<Self, Error> {
        let data = fs::read(path).map_err(Error::Io)?;
        let elf = ElfBytes::<LittleEndian>::minimal_parse(&data).map_err(Error::Elf)?;
        if elf.ehdr.e_machine != elf::abi::EM_RISCV {
            return Err(Error::NotRiscv(elf.ehdr.e_machine));
        }

        let capstone = Capstone::new()
            .riscv()
            .mode(ArchMode::RiscV64)
            .extra_mode([ArchExtraMode::RiscVC].iter().copied())
            .build()
            .map_err(Error::Capstone)?;

        let mut map = Self::default();
        for name in sections {
            let header = elf
                .section_header_by_name(name)
                .map_err(Error::Elf)?
                .ok_or_else(|| Error::SectionNotFound(name.clone()))?;
            let (code, compression) = elf.section_data(&header).map_err(Error::Elf)?;
            if compression.is_some() {
                return Err(Error::CompressedSection(name.clone()));
            }
            let instructions = capstone
                .disasm_all(code, header.sh_addr)
                .map_err(Error::Capstone)?;
            log::debug!(
                "Disassembled {} instructions from {name} at {:#x}",
                instructions.len(),
                header.sh_addr
            );
            for insn in instructions.iter() {
                let mnemonic = insn.mnemonic().unwrap_or_default();
                let op_str = insn.op_str().unwrap_or_default();
                map.insert(insn.address(), mnemonic, op_str);
            }
        }
        Ok(map)
    }

    /// Build a mapping from `(address, (mnemonic, operands))` pairs
    ///
    /// Intended for feeding hand-written disassembly, mostly in tests.
    pub fn from_pairs<M, O>(pairs: impl IntoIterator<Item = (u64, (M, O))>) -> Self
    where
        M: AsRef<str>,
        O: AsRef<str>,
    {
        let mut map = Self::default();
        for (address, (mnemonic, op_str)) in pairs {
            map.insert(address, mnemonic.as_ref(), op_str.as_ref());
        }
        map
    }

    fn insert(&mut self, address: u64, mnemonic: &str, op_str: &str) {
        let listing = Listing {
            mnemonic: mnemonic.to_owned(),
            op_str: op_str.to_owned(),
            instr: Instruction::decode(mnemonic, op_str),
        };
        self.entries.insert(address, listing);
    }

    /// Retrieve the decoded instruction at the given address
    pub fn instr(&self, address: u64) -> Option<&Instruction> {
        self.entries.get(&address).map(|listing| &listing.instr)
    }

    /// Retrieve the printed form of the instruction at the given address
    pub fn listing(&self, address: u64) -> Option<(&str, &str)> {
        self.entries
            .get(&address)
            .map(|listing| (listing.mnemonic.as_str(), listing.op_str.as_str()))
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

/// Disassembly errors
#[derive(Debug)]
pub enum Error {
    /// The ELF file could not be read
    Io(std::io::Error),
    /// The ELF file could not be parsed
    Elf(elf::ParseError),
    /// The ELF file is not a RISC-V binary
    NotRiscv(u16),
    /// A configured section does not exist
    SectionNotFound(String),
    /// A configured section is compressed
    CompressedSection(String),
    /// The disassembler reported an error
    Capstone(capstone::Error),
}

impl std::error::Error for Error {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Self::Io(err) => Some(err),
            Self::Elf(err) => Some(err),
            Self::Capstone(err) => Some(err),
            _ => None,
        }
    }
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Io(err) => write!(f, "Could not read ELF file: {err}"),
            Self::Elf(err) => write!(f, "Could not parse ELF file: {err}"),
            Self::NotRiscv(machine) => write!(f, "Not a RISC-V ELF (machine type {machine})"),
            Self::SectionNotFound(name) => write!(f, "Section not found: {name}"),
            Self::CompressedSection(name) => write!(f, "Section is compressed: {name}"),
            Self::Capstone(err) => write!(f, "Disassembler error: {err}"),
        }
    }
}
