//! Diagnostic Trouble Codes
//!
//! A trouble code is a system letter plus four hex digits, packed on the
//! wire into two bytes. The top two bits of the first byte select the
//! system and the remaining fourteen bits are the numeric suffix.

use crate::error::DecodeError;
use crate::mode;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// Which retrieval pass produced a code
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DtcStatus {
    /// Stored codes, Mode 03
    Active,
    /// Pending codes, Mode 07
    Pending,
    /// Permanent codes, Mode 0A
    Permanent,
}

impl DtcStatus {
    /// Retrieval order used when de-duplicating across passes
    pub const PRIORITY: [DtcStatus; 3] =
        [DtcStatus::Active, DtcStatus::Pending, DtcStatus::Permanent];

    /// OBD-II request for this pass
    pub fn command(&self) -> &'static str {
        match self {
            DtcStatus::Active => "03",
            DtcStatus::Pending => "07",
            DtcStatus::Permanent => "0A",
        }
    }

    /// OBD-II mode of this pass
    pub fn mode(&self) -> u8 {
        match self {
            DtcStatus::Active => mode::READ_DTC,
            DtcStatus::Pending => mode::PENDING_DTC,
            DtcStatus::Permanent => mode::PERMANENT_DTC,
        }
    }

    /// Mode echo byte the ECU puts in front of the code list
    pub fn response_marker(&self) -> u8 {
        0x40 | self.mode()
    }
}

/// Vehicle system selected by the code prefix
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum DtcSystem {
    Powertrain,
    Chassis,
    Body,
    Network,
}

impl DtcSystem {
    fn from_bits(bits: u8) -> Self {
        match bits & 0x03 {
            0 => DtcSystem::Powertrain,
            1 => DtcSystem::Chassis,
            2 => DtcSystem::Body,
            _ => DtcSystem::Network,
        }
    }

    fn from_letter(letter: char) -> Option<Self> {
        match letter {
            'P' => Some(DtcSystem::Powertrain),
            'C' => Some(DtcSystem::Chassis),
            'B' => Some(DtcSystem::Body),
            'U' => Some(DtcSystem::Network),
            _ => None,
        }
    }

    fn bits(&self) -> u8 {
        match self {
            DtcSystem::Powertrain => 0,
            DtcSystem::Chassis => 1,
            DtcSystem::Body => 2,
            DtcSystem::Network => 3,
        }
    }

    /// Code prefix letter
    pub fn letter(&self) -> char {
        match self {
            DtcSystem::Powertrain => 'P',
            DtcSystem::Chassis => 'C',
            DtcSystem::Body => 'B',
            DtcSystem::Network => 'U',
        }
    }

    /// Human category name
    pub fn category(&self) -> &'static str {
        match self {
            DtcSystem::Powertrain => "Powertrain (Engine/Transmission)",
            DtcSystem::Chassis => "Chassis (Brakes/Steering/Suspension)",
            DtcSystem::Body => "Body (Interior/Exterior)",
            DtcSystem::Network => "Network/Communication",
        }
    }
}

/// Estimated urgency of a code
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub enum Severity {
    Low,
    Moderate,
    Critical,
}

const CRITICAL_CODES: [&str; 7] = ["P0300", "P0301", "P0302", "P0303", "P0304", "P0562", "P0563"];
const EMISSIONS_CODES: [&str; 5] = ["P0420", "P0430", "P0441", "P0442", "P0455"];

/// A decoded trouble code such as `P0300`
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct TroubleCode {
    code: String,
    status: DtcStatus,
}

impl TroubleCode {
    /// The 5-character code string
    pub fn code(&self) -> &str {
        &self.code
    }

    /// Which pass reported this code
    pub fn status(&self) -> DtcStatus {
        self.status
    }

    /// Same code, reported by a different pass
    pub fn with_status(mut self, status: DtcStatus) -> Self {
        self.status = status;
        self
    }

    /// System selected by the prefix letter
    pub fn system(&self) -> DtcSystem {
        self.code
            .chars()
            .next()
            .and_then(DtcSystem::from_letter)
            .unwrap_or(DtcSystem::Powertrain)
    }

    /// Estimated severity
    pub fn severity(&self) -> Severity {
        let code = self.code.as_str();
        if CRITICAL_CODES.contains(&code) {
            Severity::Critical
        } else if EMISSIONS_CODES.contains(&code) || self.system() == DtcSystem::Network {
            Severity::Moderate
        } else {
            Severity::Low
        }
    }

    /// Pack back into the two wire bytes
    pub fn to_bytes(&self) -> [u8; 2] {
        // Suffix is validated at construction
        let suffix = u16::from_str_radix(&self.code[1..], 16).unwrap_or(0);
        let b0 = (self.system().bits() << 6) | ((suffix >> 8) as u8 & 0x3F);
        [b0, (suffix & 0xFF) as u8]
    }
}

impl fmt::Display for TroubleCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.code)
    }
}

impl FromStr for TroubleCode {
    type Err = DecodeError;

    /// Parse an externally supplied code string.
    ///
    /// Strings that are not exactly a system letter plus four hex digits
    /// are rejected; miscounted digit streams are not repaired.
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let code = s.trim().to_ascii_uppercase();
        let mut chars = code.chars();
        let system = chars
            .next()
            .and_then(DtcSystem::from_letter)
            .ok_or_else(|| DecodeError::MalformedCode(s.to_string()))?;
        let suffix = chars.as_str();
        if suffix.len() != 4 || !suffix.chars().all(|c| c.is_ascii_hexdigit()) {
            return Err(DecodeError::MalformedCode(s.to_string()));
        }
        // The first suffix digit only has two bits on the wire
        let high = u8::from_str_radix(&suffix[..1], 16)
            .map_err(|_| DecodeError::MalformedCode(s.to_string()))?;
        if high > 3 {
            return Err(DecodeError::MalformedCode(s.to_string()));
        }
        Ok(TroubleCode {
            code: format!("{}{}", system.letter(), suffix),
            status: DtcStatus::Active,
        })
    }
}

/// Decode two raw bytes into a trouble code.
///
/// `00 00` is the padding sentinel and decodes to `None`.
pub fn decode_dtc(b0: u8, b1: u8) -> Option<TroubleCode> {
    if b0 == 0 && b1 == 0 {
        return None;
    }
    let system = DtcSystem::from_bits(b0 >> 6);
    let suffix = (((b0 & 0x3F) as u16) << 8) | b1 as u16;
    Some(TroubleCode {
        code: format!("{}{:04X}", system.letter(), suffix),
        status: DtcStatus::Active,
    })
}

/// Decode a run of code byte pairs, stopping at the first padding pair.
pub fn decode_dtc_list(bytes: &[u8], status: DtcStatus) -> Vec<TroubleCode> {
    bytes
        .chunks_exact(2)
        .map_while(|pair| decode_dtc(pair[0], pair[1]))
        .map(|code| code.with_status(status))
        .collect()
}
