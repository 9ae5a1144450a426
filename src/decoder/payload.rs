// Copyright (C) 2025 FZI Forschungszentrum Informatik
// SPDX-License-Identifier: Apache-2.0

//! Implements all different payloads and their decoding.

use crate::types::Privilege;
use crate::{DiscoveryResponse, XLEN};

use super::{util, Cursor, Decode, Error};

/// Width of the privilege field in bits.
const PRIV_LEN: usize = 2;

/// Top level enum for all possible payload formats.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Payload {
    /// Format 1
    Branch(Branch),
    /// Format 2
    Address(AddressInfo),
    /// Format 3, further dispatched by subformat
    Synchronization(Synchronization),
}

impl Payload {
    /// Retrieve the address block of a format 1 or 2 payload
    ///
    /// Returns [`None`] for synchronization payloads and for the short,
    /// map-only form of format 1.
    pub fn address_info(&self) -> Option<&AddressInfo> {
        match self {
            Self::Address(info) => Some(info),
            Self::Branch(branch) => branch.address.as_ref(),
            Self::Synchronization(_) => None,
        }
    }

    pub fn is_synchronization(&self) -> bool {
        matches!(self, Self::Synchronization(_))
    }

    /// Retrieve the privilege level reported by this payload, if any
    pub fn privilege(&self) -> Option<Privilege> {
        match self {
            Self::Synchronization(sync) => sync.privilege(),
            _ => None,
        }
    }
}

/// #### Format 1
///
/// Reports branch outcomes, and optionally the address of an instruction
/// if one must be reported and at least one branch occurred since the
/// previous packet. The short form carries only the branch map; a reported
/// count of 0 means a full map of 31 outcomes.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Branch {
    /// Number of valid bits in `branch_map`. 0 reports a full map.
    pub branches: u8,
    /// Outcome bits, oldest in the lowest bit. 0 is taken, 1 is not taken.
    pub branch_map: u64,
    pub address: Option<AddressInfo>,
}

impl Branch {
    pub(crate) fn decode(
        cursor: &mut Cursor,
        ioptions: &IOptions,
        discovery: &DiscoveryResponse,
    ) -> Result<Self, Error> {
        let branches = cursor.read_bits(5)? as u8;
        let map_len = util::branch_map_len(branches);
        let mut branch_map = cursor.read_bits(map_len)?;
        if branches != 0 {
            // Map bits beyond the reported count are undefined.
            branch_map &= (1u64 << branches) - 1;
        }

        // A payload of exactly the map-only length has no address block.
        let map_only_bits = util::round_up_byte(2 + 5 + map_len);
        let address = if map_only_bits == cursor.total_bits() {
            None
        } else {
            let known_bits = 10 + map_len + discovery.irdepth_width();
            Some(AddressInfo::decode(cursor, known_bits, ioptions, discovery)?)
        };
        Ok(Branch {
            branches,
            branch_map,
            address,
        })
    }
}

/// #### Format 2, and the address block of long format 1 payloads
///
/// Carries an instruction address in differential form unless full address
/// mode is active, followed by the notification and discontinuity status
/// bits and the implicit return report.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub struct AddressInfo {
    /// Reported address. In delta mode this is a sign-extended difference
    /// in wrapped two's complement representation.
    pub address: u64,
    pub notify: bool,
    pub updiscon: bool,
    pub irreport: bool,
    /// Number of entries on the implicit return stack.
    pub irdepth: u64,
}

impl AddressInfo {
    fn decode(
        cursor: &mut Cursor,
        known_bits: usize,
        ioptions: &IOptions,
        discovery: &DiscoveryResponse,
    ) -> Result<Self, Error> {
        let address = if ioptions.delta_address {
            let (address_len, _) = util::address_len(cursor.total_bits(), known_bits);
            cursor.read_compressed(address_len)?
        } else {
            cursor.read_bits(XLEN)?
        };
        let notify = cursor.read_bit()?;
        let updiscon = cursor.read_bit()?;
        let irreport = cursor.read_bit()?;
        let irdepth = cursor.read_bits(discovery.irdepth_width())?;
        Ok(AddressInfo {
            address,
            notify,
            updiscon,
            irreport,
            irdepth,
        })
    }

    pub(crate) fn decode_format2(
        cursor: &mut Cursor,
        ioptions: &IOptions,
        discovery: &DiscoveryResponse,
    ) -> Result<Self, Error> {
        // format, notify, updiscon, irreport and irdepth are known.
        let known_bits = 5 + discovery.irdepth_width();
        Self::decode(cursor, known_bits, ioptions, discovery)
    }
}

/// #### Format 3
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Synchronization {
    Start(Start),
    Trap(Trap),
    Context(Context),
    Support(Support),
}

impl Synchronization {
    pub(crate) fn decode(cursor: &mut Cursor) -> Result<Self, Error> {
        Ok(match cursor.read_bits(2)? {
            0b00 => Self::Start(Start::decode(cursor)?),
            0b01 => Self::Trap(Trap::decode(cursor)?),
            0b10 => Self::Context(Context::decode(cursor)?),
            _ => Self::Support(Support::decode(cursor)?),
        })
    }

    pub fn privilege(&self) -> Option<Privilege> {
        match self {
            Self::Start(start) => Some(start.privilege),
            Self::Trap(trap) => Some(trap.privilege),
            Self::Context(context) => Some(context.privilege),
            Self::Support(_) => None,
        }
    }
}

/// #### Format 3, subformat 0
///
/// Sent for the first traced instruction and on resynchronization.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub struct Start {
    /// False, if the address points to a taken branch. True, if the branch
    /// was not taken or the instruction is not a branch.
    pub branch: bool,
    pub privilege: Privilege,
    /// Full address of the instruction.
    pub address: u64,
}

impl Decode for Start {
    fn decode(cursor: &mut Cursor) -> Result<Self, Error> {
        let branch = cursor.read_bit()?;
        let privilege = Privilege::decode(cursor)?;
        // format, subformat and branch are known besides the privilege.
        let (address_len, _) = util::address_len(cursor.total_bits(), 5 + PRIV_LEN);
        let address = cursor.read_wide(address_len)?;
        Ok(Start {
            branch,
            privilege,
            address,
        })
    }
}

/// #### Format 3, subformat 1
///
/// Sent following an exception or interrupt.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub struct Trap {
    pub branch: bool,
    pub privilege: Privilege,
    pub ecause: u64,
    pub interrupt: bool,
    /// True, if the address points to the trap handler. False, if it
    /// points to the EPC of an exception at the target of an updiscon.
    pub thaddr: bool,
    pub address: u64,
    /// Value from the appropriate `*tval` CSR.
    pub tval: u64,
}

impl Decode for Trap {
    fn decode(cursor: &mut Cursor) -> Result<Self, Error> {
        let branch = cursor.read_bit()?;
        let privilege = Privilege::decode(cursor)?;
        let ecause = cursor.read_bits(XLEN)?;
        let interrupt = cursor.read_bit()?;
        let thaddr = cursor.read_bit()?;
        // All fixed fields: format, subformat, branch, privilege, ecause,
        // interrupt, thaddr and tval. The padding eats into tval.
        let known_bits = 7 + PRIV_LEN + 2 * XLEN;
        let (address_len, padding) = util::address_len(cursor.total_bits(), known_bits);
        let address = cursor.read_wide(address_len)?;
        let tval = cursor.read_bits(XLEN.saturating_sub(padding))?;
        Ok(Trap {
            branch,
            privilege,
            ecause,
            interrupt,
            thaddr,
            address,
            tval,
        })
    }
}

/// #### Format 3, subformat 2
///
/// Reports a context change. Time and context fields are absent in this
/// build of the protocol.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub struct Context {
    pub privilege: Privilege,
}

impl Decode for Context {
    fn decode(cursor: &mut Cursor) -> Result<Self, Error> {
        Ok(Context {
            privilege: Privilege::decode(cursor)?,
        })
    }
}

/// #### Format 3, subformat 3
///
/// Supporting information for the decoder.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub struct Support {
    pub ienable: bool,
    pub encoder_mode: u8,
    pub qual_status: QualStatus,
    pub ioptions: IOptions,
}

impl Decode for Support {
    fn decode(cursor: &mut Cursor) -> Result<Self, Error> {
        let ienable = cursor.read_bit()?;
        let encoder_mode = cursor.read_bits(1)? as u8;
        let qual_status = QualStatus::decode(cursor)?;
        let ioptions = IOptions::decode(cursor)?;
        Ok(Support {
            ienable,
            encoder_mode,
            qual_status,
            ioptions,
        })
    }
}

/// Reports how or if the filter qualification changed.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum QualStatus {
    /// No change to filter qualification.
    NoChange,
    /// Qualification ended, preceding packet sent explicitly to indicate
    /// the last qualified instruction.
    EndedRep,
    /// One or more instruction trace packets lost.
    TraceLost,
    /// Qualification ended, preceding packet would have been sent anyway
    /// due to an updiscon.
    EndedNtr,
}

impl Decode for QualStatus {
    fn decode(cursor: &mut Cursor) -> Result<Self, Error> {
        Ok(match cursor.read_bits(2)? {
            0b00 => QualStatus::NoChange,
            0b01 => QualStatus::EndedRep,
            0b10 => QualStatus::TraceLost,
            _ => QualStatus::EndedNtr,
        })
    }
}

/// The operating mode of the encoder, reported via support packets.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub struct IOptions {
    pub delta_address: bool,
    pub full_address: bool,
    pub implicit_exception: bool,
    pub sijump: bool,
    pub implicit_return: bool,
    pub branch_prediction: bool,
    pub jump_target_cache: bool,
}

impl Default for IOptions {
    fn default() -> Self {
        IOptions {
            delta_address: true,
            full_address: false,
            implicit_exception: false,
            sijump: false,
            implicit_return: false,
            branch_prediction: false,
            jump_target_cache: false,
        }
    }
}

impl Decode for IOptions {
    fn decode(cursor: &mut Cursor) -> Result<Self, Error> {
        // The flags are packed most-significant-first starting with
        // delta_address, so tail-first reads yield them in reverse.
        let jump_target_cache = cursor.read_bit()?;
        let branch_prediction = cursor.read_bit()?;
        let implicit_return = cursor.read_bit()?;
        let sijump = cursor.read_bit()?;
        let implicit_exception = cursor.read_bit()?;
        let full_address = cursor.read_bit()?;
        let delta_address = cursor.read_bit()?;
        Ok(IOptions {
            delta_address,
            full_address,
            implicit_exception,
            sijump,
            implicit_return,
            branch_prediction,
            jump_target_cache,
        })
    }
}

impl Decode for Privilege {
    fn decode(cursor: &mut Cursor) -> Result<Self, Error> {
        cursor.read_bits(PRIV_LEN).map(|raw| (raw as u8).into())
    }
}
