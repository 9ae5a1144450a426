// Copyright (C) 2025 FZI Forschungszentrum Informatik
// SPDX-License-Identifier: Apache-2.0

/// RISC-V privilege levels
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum Privilege {
    User,
    Supervisor,
    Hypervisor,
    Machine,
}

impl Default for Privilege {
    fn default() -> Self {
        Self::User
    }
}

impl From<u8> for Privilege {
    fn from(num: u8) -> Self {
        match num & 0b11 {
            0b00 => Self::User,
            0b01 => Self::Supervisor,
            0b10 => Self::Hypervisor,
            _ => Self::Machine,
        }
    }
}
