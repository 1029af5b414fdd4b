//! Readiness Monitors (Mode 01 PID 01)
//!
//! Four bytes A B C D. A carries the MIL lamp and stored code count, B the
//! continuous monitors and the ignition type, C/D the non-continuous
//! monitors (available / incomplete bits).

use serde::{Deserialize, Serialize};

/// Engine ignition type, selects the meaning of bytes C and D
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum IgnitionType {
    Spark,
    Compression,
}

/// Self-test state of one emissions monitor
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MonitorStatus {
    pub name: String,
    /// The vehicle implements this monitor
    pub available: bool,
    /// The self-test finished since the last code clear
    pub complete: bool,
}

/// Decoded reply to `0101`
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReadinessStatus {
    /// Check-engine lamp is lit
    pub mil_on: bool,
    /// Number of stored trouble codes reported by the ECU
    pub dtc_count: u8,
    pub ignition: IgnitionType,
    pub monitors: Vec<MonitorStatus>,
}

const CONTINUOUS: [&str; 3] = ["Misfire", "Fuel System", "Components"];

// `None` marks reserved bits
const SPARK: [Option<&str>; 8] = [
    Some("Catalyst"),
    Some("Heated Catalyst"),
    Some("Evaporative System"),
    Some("Secondary Air System"),
    Some("A/C Refrigerant"),
    Some("Oxygen Sensor"),
    Some("Oxygen Sensor Heater"),
    Some("EGR System"),
];

const COMPRESSION: [Option<&str>; 8] = [
    Some("NMHC Catalyst"),
    Some("NOx/SCR Monitor"),
    None,
    Some("Boost Pressure"),
    None,
    Some("Exhaust Gas Sensor"),
    Some("PM Filter"),
    Some("EGR/VVT System"),
];

fn bit(byte: u8, n: usize) -> bool {
    byte & (1 << n) != 0
}

impl ReadinessStatus {
    /// Decode the four data bytes of a `41 01` reply
    pub fn decode(bytes: [u8; 4]) -> Self {
        let [a, b, c, d] = bytes;
        let ignition = if bit(b, 3) {
            IgnitionType::Compression
        } else {
            IgnitionType::Spark
        };

        let mut monitors: Vec<MonitorStatus> = CONTINUOUS
            .iter()
            .enumerate()
            .map(|(i, name)| MonitorStatus {
                name: name.to_string(),
                available: bit(b, i),
                complete: bit(b, i) && !bit(b, i + 4),
            })
            .collect();

        let table = match ignition {
            IgnitionType::Spark => &SPARK,
            IgnitionType::Compression => &COMPRESSION,
        };
        monitors.extend(table.iter().enumerate().filter_map(|(i, name)| {
            name.map(|name| MonitorStatus {
                name: name.to_string(),
                available: bit(c, i),
                complete: bit(c, i) && !bit(d, i),
            })
        }));

        Self {
            mil_on: bit(a, 7),
            dtc_count: a & 0x7F,
            ignition,
            monitors,
        }
    }

    /// Available monitors whose self-test has not finished
    pub fn incomplete(&self) -> impl Iterator<Item = &MonitorStatus> {
        self.monitors.iter().filter(|m| m.available && !m.complete)
    }

    /// Every available monitor has completed
    pub fn ready(&self) -> bool {
        self.incomplete().next().is_none()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_spark_engine_with_mil() {
        // MIL on, 2 codes; misfire+fuel+components available, components incomplete;
        // catalyst, evap, O2, O2 heater available; evap incomplete
        let status = ReadinessStatus::decode([0x82, 0x47, 0x65, 0x04]);
        assert!(status.mil_on);
        assert_eq!(status.dtc_count, 2);
        assert_eq!(status.ignition, IgnitionType::Spark);
        assert_eq!(status.monitors.len(), 11);

        let incomplete: Vec<_> = status.incomplete().map(|m| m.name.as_str()).collect();
        assert_eq!(incomplete, vec!["Components", "Evaporative System"]);
        assert!(!status.ready());
    }

    #[test]
    fn test_compression_engine_skips_reserved_bits() {
        let status = ReadinessStatus::decode([0x00, 0x0F, 0xFF, 0x00]);
        assert_eq!(status.ignition, IgnitionType::Compression);
        assert_eq!(status.monitors.len(), 3 + 6);
        assert!(status.monitors.iter().any(|m| m.name == "PM Filter" && m.complete));
        assert!(status.ready());
    }

    #[test]
    fn test_unavailable_monitor_is_never_complete() {
        let status = ReadinessStatus::decode([0x00, 0x00, 0x00, 0x00]);
        assert!(status.monitors.iter().all(|m| !m.available && !m.complete));
        assert!(status.ready());
    }
}
