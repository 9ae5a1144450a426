// Copyright (C) 2025 FZI Forschungszentrum Informatik
// SPDX-License-Identifier: Apache-2.0
//! Disassembler configuration

use std::fmt;
use std::fs;
use std::path::Path;

use serde::Deserialize;

/// Default location of the configuration file
pub const DEFAULT_PATH: &str = "disassembler_config.yaml";

/// Top level configuration as found in `disassembler_config.yaml`
#[derive(Clone, Debug, Deserialize)]
pub struct Config {
    pub disassemble: Disassemble,
}

/// Selection of ELF sections to disassemble
#[derive(Clone, Debug, Deserialize)]
pub struct Disassemble {
    /// Names of the executable sections to feed to the disassembler
    pub sections: Vec<String>,
}

impl Config {
    /// Load a configuration from a YAML file
    pub fn load(path: impl AsRef<Path>) -> Result<Self, Error> {
        let text = fs::read_to_string(path).map_err(Error::Io)?;
        serde_yaml::from_str(&text).map_err(Error::Parse)
    }
}

/// Configuration loading errors
#[derive(Debug)]
pub enum Error {
    /// The configuration file could not be read
    Io(std::io::Error),
    /// The configuration file is not valid YAML of the expected shape
    Parse(serde_yaml::Error),
}

impl std::error::Error for Error {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Self::Io(err) => Some(err),
            Self::Parse(err) => Some(err),
        }
    }
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Io(err) => write!(f, "Could not read configuration: {err}"),
            Self::Parse(err) => write!(f, "Could not parse configuration: {err}"),
        }
    }
}
