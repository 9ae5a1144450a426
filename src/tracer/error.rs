// Copyright (C) 2025 FZI Forschungszentrum Informatik
// SPDX-License-Identifier: Apache-2.0
//! Tracer-specific error types

use std::fmt;

use crate::instruction::Instruction;

use super::TraceState;

/// Captures a tracing algorithm error together with the tracing context
/// in which it occurred.
///
/// Tracing errors are not recoverable: one violation invalidates all
/// subsequent PCs.
#[derive(Clone, Debug)]
pub struct Error {
    pub state: TraceState,
    pub kind: Kind,
}

impl std::error::Error for Error {}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} ({:?})", self.kind, self.state)
    }
}

/// Possible errors which can occur during the tracing algorithm.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Kind {
    /// A format 1 or 2 packet arrived before the first synchronization.
    StartOfTrace,
    /// Branches that should have been resolved are still buffered at a
    /// stop point. The number of unresolved branches is given.
    UnprocessedBranches(u8),
    /// A branch has to be resolved but no outcomes are buffered.
    UnresolvableBranch,
    /// An uninferable discontinuity while stopping at the last branch.
    UnexpectedUninferableDiscon,
    /// The address does not map to an instruction.
    UnknownAddress(u64),
    /// The instruction has no usable immediate operand.
    MissingImmediate(Instruction),
    /// An implicit return was taken with no buffered return address.
    EmptyReturnStack,
    /// The end-of-trace sentinel instruction was reached.
    ///
    /// Not a failure; translated to [`Flow::EndOfTrace`][super::Flow] at
    /// the public boundary.
    EndOfTrace,
}

impl fmt::Display for Kind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::StartOfTrace => write!(f, "Expecting trace to start with a format 3 packet"),
            Self::UnprocessedBranches(count) => {
                write!(f, "{count} branches left unprocessed at a stop point")
            }
            Self::UnresolvableBranch => write!(f, "Cannot resolve branch, no outcomes buffered"),
            Self::UnexpectedUninferableDiscon => {
                write!(f, "Unexpected uninferable discontinuity")
            }
            Self::UnknownAddress(address) => {
                write!(f, "Address {address:#x} is not an instruction")
            }
            Self::MissingImmediate(instr) => {
                write!(f, "No usable immediate in {instr:?}")
            }
            Self::EmptyReturnStack => write!(f, "Implicit return with an empty return stack"),
            Self::EndOfTrace => write!(f, "End of trace"),
        }
    }
}
