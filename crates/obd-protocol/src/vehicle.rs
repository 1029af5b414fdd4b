//! Vehicle Identification and Freeze Frames

use crate::dtc::TroubleCode;
use crate::error::DecodeError;
use crate::pid::SensorReading;
use serde::{Deserialize, Serialize};

/// VIN length per ISO 3779
pub const VIN_LENGTH: usize = 17;

/// Width of one calibration ID slot in a `0904` reply
const CALIBRATION_ID_WIDTH: usize = 16;

/// Identity data read through Mode 09
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct VehicleIdentity {
    pub vin: Option<String>,
    pub calibration_ids: Vec<String>,
}

/// Result of reading every Mode 09 field, with the reason for each one
/// that could not be read
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct VehicleInfoReport {
    pub identity: VehicleIdentity,
    pub vin_error: Option<String>,
    pub calibration_error: Option<String>,
}

/// Sensor snapshot stored when a trouble code was first set (Mode 02)
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FreezeFrame {
    /// Frame index used in the request
    pub frame: u8,
    /// Code that caused the frame to be stored, if the ECU reports it
    pub trigger: Option<TroubleCode>,
    pub readings: Vec<SensorReading>,
}

fn printable(bytes: &[u8]) -> Result<String, DecodeError> {
    if let Some(bad) = bytes.iter().find(|b| !(0x20..=0x7E).contains(*b)) {
        return Err(DecodeError::NonAscii(*bad));
    }
    Ok(bytes.iter().map(|b| *b as char).collect())
}

/// Decode the concatenated `0902` data bytes into a VIN.
///
/// Legacy protocols pad the first frame with NUL bytes; those are dropped.
pub fn decode_vin(bytes: &[u8]) -> Result<String, DecodeError> {
    let start = bytes.iter().position(|b| *b != 0).unwrap_or(bytes.len());
    let text = printable(&bytes[start..])?;
    let text = text.trim();
    let count = text.chars().count();
    if count < VIN_LENGTH {
        return Err(DecodeError::IncompleteVin(count));
    }
    Ok(text[text.len() - VIN_LENGTH..].to_string())
}

/// Decode the concatenated `0904` data bytes into calibration IDs
pub fn decode_calibration_ids(bytes: &[u8]) -> Result<Vec<String>, DecodeError> {
    let mut ids = Vec::new();
    for slot in bytes.chunks(CALIBRATION_ID_WIDTH) {
        let end = slot.iter().position(|b| *b == 0).unwrap_or(slot.len());
        let id = printable(&slot[..end])?;
        let id = id.trim();
        if !id.is_empty() {
            ids.push(id.to_string());
        }
    }
    Ok(ids)
}
