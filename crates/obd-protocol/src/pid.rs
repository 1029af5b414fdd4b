//! OBD-II PID Definitions and Conversion Formulas
//!
//! A read-only registry of the standard Mode 01 Parameter IDs (PIDs): the
//! number of data bytes each one carries, its unit, a human description and
//! the formula that turns the raw big-endian integer into a physical value.
//! PIDs outside the table fall back to an identity formula with an empty
//! unit and description.

use serde::{Deserialize, Serialize};

/// Standard OBD-II PIDs for Mode 01 (current data)
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[repr(u8)]
pub enum Pid {
    /// Monitor status since DTCs cleared (0x01)
    MonitorStatus = 0x01,
    /// Calculated engine load (0x04)
    EngineLoad = 0x04,
    /// Engine coolant temperature (0x05)
    CoolantTemp = 0x05,
    /// Short-term fuel trim bank 1 (0x06)
    ShortFuelTrimBank1 = 0x06,
    /// Long-term fuel trim bank 1 (0x07)
    LongFuelTrimBank1 = 0x07,
    /// Short-term fuel trim bank 2 (0x08)
    ShortFuelTrimBank2 = 0x08,
    /// Long-term fuel trim bank 2 (0x09)
    LongFuelTrimBank2 = 0x09,
    /// Fuel pressure, gauge (0x0A)
    FuelPressure = 0x0A,
    /// Intake manifold absolute pressure (0x0B)
    IntakeManifoldPressure = 0x0B,
    /// Engine RPM (0x0C)
    Rpm = 0x0C,
    /// Vehicle speed (0x0D)
    Speed = 0x0D,
    /// Timing advance before TDC (0x0E)
    TimingAdvance = 0x0E,
    /// Intake air temperature (0x0F)
    IntakeAirTemp = 0x0F,
    /// Mass air flow rate (0x10)
    Maf = 0x10,
    /// Throttle position (0x11)
    ThrottlePosition = 0x11,
    /// Oxygen sensor voltage bank 1, sensor 1 (0x14)
    O2Voltage = 0x14,
    /// Run time since engine start (0x1F)
    RunTime = 0x1F,
    /// Distance traveled with MIL on (0x21)
    DistanceWithMil = 0x21,
    /// Fuel tank level input (0x2F)
    FuelLevel = 0x2F,
    /// Distance traveled since codes cleared (0x31)
    DistanceSinceClear = 0x31,
    /// Absolute barometric pressure (0x33)
    BarometricPressure = 0x33,
    /// Control module voltage (0x42)
    ControlModuleVoltage = 0x42,
    /// Relative throttle position (0x45)
    RelativeThrottle = 0x45,
    /// Ambient air temperature (0x46)
    AmbientAirTemp = 0x46,
    /// Engine oil temperature (0x5C)
    OilTemp = 0x5C,
    /// Engine fuel rate (0x5E)
    FuelRate = 0x5E,
}

/// Conversion from the raw data integer to a physical value.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub enum Formula {
    /// Value is the raw integer
    Identity,
    /// raw - 40, used by every temperature PID
    TemperatureOffset,
    /// raw * 100 / 255
    Percent,
    /// (raw - 128) * 100 / 128, fuel trims
    SignedPercent,
    /// raw / 4
    Quarter,
    /// raw / 100
    Hundredth,
    /// raw / 1000
    Thousandth,
    /// raw / 2 - 64
    TimingAdvance,
    /// raw * factor
    Scaled(f64),
}

impl Formula {
    /// Apply the formula to a raw big-endian integer
    pub fn apply(&self, raw: u32) -> f64 {
        let x = raw as f64;
        match self {
            Formula::Identity => x,
            Formula::TemperatureOffset => x - 40.0,
            Formula::Percent => x * 100.0 / 255.0,
            Formula::SignedPercent => (x - 128.0) * 100.0 / 128.0,
            Formula::Quarter => x / 4.0,
            Formula::Hundredth => x / 100.0,
            Formula::Thousandth => x / 1000.0,
            Formula::TimingAdvance => x / 2.0 - 64.0,
            Formula::Scaled(factor) => x * factor,
        }
    }
}

/// Registry entry for a PID
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct PidSpec {
    /// Number of data bytes following the PID echo
    pub data_bytes: usize,
    /// Physical unit, empty when unknown
    pub unit: &'static str,
    /// Human description, empty when unknown
    pub description: &'static str,
    /// Raw-to-physical conversion
    pub formula: Formula,
}

impl PidSpec {
    /// Fallback entry for PIDs the registry does not know
    pub const UNKNOWN: PidSpec = PidSpec {
        data_bytes: 1,
        unit: "",
        description: "",
        formula: Formula::Identity,
    };

    /// Convert data bytes into a physical value.
    ///
    /// Returns `None` when fewer than `data_bytes` bytes are available.
    pub fn decode(&self, bytes: &[u8]) -> Option<f64> {
        if bytes.len() < self.data_bytes {
            return None;
        }
        let raw = bytes[..self.data_bytes]
            .iter()
            .fold(0u32, |acc, b| (acc << 8) | *b as u32);
        Some(self.formula.apply(raw))
    }
}

impl Pid {
    /// Every PID known to the registry
    pub const ALL: [Pid; 26] = [
        Pid::MonitorStatus,
        Pid::EngineLoad,
        Pid::CoolantTemp,
        Pid::ShortFuelTrimBank1,
        Pid::LongFuelTrimBank1,
        Pid::ShortFuelTrimBank2,
        Pid::LongFuelTrimBank2,
        Pid::FuelPressure,
        Pid::IntakeManifoldPressure,
        Pid::Rpm,
        Pid::Speed,
        Pid::TimingAdvance,
        Pid::IntakeAirTemp,
        Pid::Maf,
        Pid::ThrottlePosition,
        Pid::O2Voltage,
        Pid::RunTime,
        Pid::DistanceWithMil,
        Pid::FuelLevel,
        Pid::DistanceSinceClear,
        Pid::BarometricPressure,
        Pid::ControlModuleVoltage,
        Pid::RelativeThrottle,
        Pid::AmbientAirTemp,
        Pid::OilTemp,
        Pid::FuelRate,
    ];

    /// Get the PID hex value
    pub fn as_hex(&self) -> u8 {
        *self as u8
    }

    /// Look up a known PID by its numeric code
    pub fn from_code(code: u8) -> Option<Pid> {
        Pid::ALL.iter().copied().find(|p| p.as_hex() == code)
    }

    /// Mode 01 request string, e.g. `010C`
    pub fn command(&self) -> String {
        format!("01{:02X}", self.as_hex())
    }

    /// Registry entry for this PID
    pub fn spec(&self) -> PidSpec {
        let (data_bytes, unit, description, formula) = match self {
            Pid::MonitorStatus => (4, "", "Monitor Status Since DTCs Cleared", Formula::Identity),
            Pid::EngineLoad => (1, "%", "Calculated Engine Load", Formula::Percent),
            Pid::CoolantTemp => (1, "°C", "Engine Coolant Temperature", Formula::TemperatureOffset),
            Pid::ShortFuelTrimBank1 => {
                (1, "%", "Short Term Fuel Trim Bank 1", Formula::SignedPercent)
            }
            Pid::LongFuelTrimBank1 => {
                (1, "%", "Long Term Fuel Trim Bank 1", Formula::SignedPercent)
            }
            Pid::ShortFuelTrimBank2 => {
                (1, "%", "Short Term Fuel Trim Bank 2", Formula::SignedPercent)
            }
            Pid::LongFuelTrimBank2 => {
                (1, "%", "Long Term Fuel Trim Bank 2", Formula::SignedPercent)
            }
            Pid::FuelPressure => (1, "kPa", "Fuel Pressure", Formula::Scaled(3.0)),
            Pid::IntakeManifoldPressure => {
                (1, "kPa", "Intake Manifold Absolute Pressure", Formula::Identity)
            }
            Pid::Rpm => (2, "RPM", "Engine RPM", Formula::Quarter),
            Pid::Speed => (1, "km/h", "Vehicle Speed", Formula::Identity),
            Pid::TimingAdvance => (1, "°", "Timing Advance", Formula::TimingAdvance),
            Pid::IntakeAirTemp => (1, "°C", "Intake Air Temperature", Formula::TemperatureOffset),
            Pid::Maf => (2, "g/s", "Mass Air Flow Rate", Formula::Hundredth),
            Pid::ThrottlePosition => (1, "%", "Throttle Position", Formula::Percent),
            Pid::O2Voltage => {
                (1, "V", "Oxygen Sensor Voltage Bank 1 Sensor 1", Formula::Scaled(0.005))
            }
            Pid::RunTime => (2, "s", "Run Time Since Engine Start", Formula::Identity),
            Pid::DistanceWithMil => (2, "km", "Distance Traveled With MIL On", Formula::Identity),
            Pid::FuelLevel => (1, "%", "Fuel Tank Level", Formula::Percent),
            Pid::DistanceSinceClear => (2, "km", "Distance Since Codes Cleared", Formula::Identity),
            Pid::BarometricPressure => {
                (1, "kPa", "Absolute Barometric Pressure", Formula::Identity)
            }
            Pid::ControlModuleVoltage => (2, "V", "Control Module Voltage", Formula::Thousandth),
            Pid::RelativeThrottle => (1, "%", "Relative Throttle Position", Formula::Percent),
            Pid::AmbientAirTemp => (1, "°C", "Ambient Air Temperature", Formula::TemperatureOffset),
            Pid::OilTemp => (1, "°C", "Engine Oil Temperature", Formula::TemperatureOffset),
            Pid::FuelRate => (2, "L/h", "Engine Fuel Rate", Formula::Scaled(0.05)),
        };
        PidSpec {
            data_bytes,
            unit,
            description,
            formula,
        }
    }
}

/// Registry lookup by numeric PID, with identity fallback
pub fn lookup(code: u8) -> PidSpec {
    Pid::from_code(code)
        .map(|p| p.spec())
        .unwrap_or(PidSpec::UNKNOWN)
}

/// Decoded live reading for one PID
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SensorReading {
    /// The PID that was queried
    pub pid: u8,
    /// Physical value
    pub value: f64,
    /// Unit from the registry
    pub unit: String,
    /// Description from the registry
    pub description: String,
}

impl SensorReading {
    /// Decode data bytes for `pid` through the registry
    pub fn decode(pid: u8, bytes: &[u8]) -> Option<Self> {
        let spec = lookup(pid);
        let value = spec.decode(bytes)?;
        Some(Self {
            pid,
            value,
            unit: spec.unit.to_string(),
            description: spec.description.to_string(),
        })
    }
}

/// Expand a supported-PID bitmap (reply to `0100`, `0120`, ...) into PIDs.
///
/// `base` is the PID that was requested; bit 31 of the bitmap is `base + 1`.
pub fn supported_from_bitmap(base: u8, bitmap: [u8; 4]) -> Vec<u8> {
    let bits = u32::from_be_bytes(bitmap);
    (0..32u32)
        .filter(|i| bits & (1 << (31 - i)) != 0)
        .map(|i| base.wrapping_add(i as u8 + 1))
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    #[test]
    fn test_rpm_decode() {
        // 1A 2B => ((0x1A * 256) + 0x2B) / 4 = 6699/4 = 1674.75
        let reading = SensorReading::decode(0x0C, &[0x1A, 0x2B]).unwrap();
        assert!((reading.value - 1674.75).abs() < 0.01);
        assert_eq!(reading.unit, "RPM");
    }

    #[test]
    fn test_coolant_temp_lower_bound() {
        let reading = SensorReading::decode(0x05, &[0x00]).unwrap();
        assert!((reading.value + 40.0).abs() < f64::EPSILON);
        assert_eq!(reading.unit, "°C");
    }

    #[test]
    fn test_throttle_full_scale() {
        let reading = SensorReading::decode(0x11, &[0xFF]).unwrap();
        assert!((reading.value - 100.0).abs() < 1e-9);
    }

    #[test]
    fn test_fuel_trim_decode() {
        let zero = SensorReading::decode(0x06, &[0x80]).unwrap();
        assert!(zero.value.abs() < 0.01);

        // 0x90 = 144, so trim = (144-128)*100/128 = 12.5%
        let lean = SensorReading::decode(0x06, &[0x90]).unwrap();
        assert!((lean.value - 12.5).abs() < 0.01);
    }

    #[test]
    fn test_maf_and_module_voltage() {
        let maf = SensorReading::decode(0x10, &[0x01, 0xF4]).unwrap();
        assert!((maf.value - 5.0).abs() < 1e-9);

        let volts = SensorReading::decode(0x42, &[0x36, 0xB0]).unwrap();
        assert!((volts.value - 14.0).abs() < 1e-9);
    }

    #[test]
    fn test_unknown_pid_uses_identity() {
        let reading = SensorReading::decode(0xA6, &[0x2A]).unwrap();
        assert_eq!(reading.value, 42.0);
        assert!(reading.unit.is_empty());
        assert!(reading.description.is_empty());
    }

    #[test]
    fn test_short_payload_yields_nothing() {
        assert!(SensorReading::decode(0x0C, &[0x1A]).is_none());
    }

    #[test]
    fn test_every_known_pid_round_trips_code() {
        for pid in Pid::ALL {
            assert_eq!(Pid::from_code(pid.as_hex()), Some(pid));
            assert!(!pid.spec().description.is_empty());
        }
        assert_eq!(Pid::Rpm.command(), "010C");
    }

    #[test]
    fn test_supported_bitmap() {
        // BE 3F A8 13: the classic ELM327 demo reply
        let pids = supported_from_bitmap(0x00, [0xBE, 0x3F, 0xA8, 0x13]);
        assert_eq!(&pids[..5], &[0x01, 0x03, 0x04, 0x05, 0x06]);
        assert!(pids.contains(&0x0C));
        assert!(pids.contains(&0x20));
    }

    proptest! {
        #[test]
        fn temperature_formula_is_offset(raw in 0u8..=255) {
            let value = SensorReading::decode(0x05, &[raw]).unwrap().value;
            prop_assert!((value - (raw as f64 - 40.0)).abs() < 1e-9);
        }

        #[test]
        fn percent_formula_stays_in_range(raw in 0u8..=255) {
            let value = SensorReading::decode(0x04, &[raw]).unwrap().value;
            prop_assert!((0.0..=100.0).contains(&value));
        }
    }
}
