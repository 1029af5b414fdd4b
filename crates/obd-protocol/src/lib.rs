//! OBD-II Protocol Implementation
//!
//! This crate provides async serial communication with ELM327-compatible
//! OBD-II adapters: endpoint discovery, the adapter handshake, a
//! request/reply command channel, and decoders for sensor readings,
//! trouble codes, readiness monitors, freeze frames and vehicle identity.
//! It supports ISO 15765-4 (CAN) and legacy protocols.

mod channel;
mod client;
mod discovery;
mod dtc;
mod error;
pub mod mock;
mod pid;
mod protocol;
mod readiness;
pub mod response;
mod vehicle;

pub use channel::{CommandChannel, Link, RawResponse, MAX_COMMAND_TIMEOUT};
pub use client::{
    select_endpoint, ConnectOptions, ConnectionState, ConnectionStatus, HandshakeProfile,
    HandshakeReport, ObdClient, ScannerHandle, DEFAULT_BAUD_RATE,
};
pub use discovery::{
    classify_port, classify_ports, parse_bluetoothctl, parse_pnp_devices, parse_system_profiler,
    platform_bluetooth, BluetoothDiscovery, Bluetoothctl, Discovery, EndpointSource, NoBluetooth,
    PairedDevice, PnpEnumeration, PortFacts, SerialEndpoint, SystemProfiler, TransportKind,
    TOOL_TIMEOUT,
};
pub use dtc::{decode_dtc, decode_dtc_list, DtcStatus, DtcSystem, Severity, TroubleCode};
pub use error::{DecodeError, ObdError};
pub use pid::{lookup, supported_from_bitmap, Formula, Pid, PidSpec, SensorReading};
pub use protocol::ObdProtocol;
pub use readiness::{IgnitionType, MonitorStatus, ReadinessStatus};
pub use vehicle::{
    decode_calibration_ids, decode_vin, FreezeFrame, VehicleIdentity, VehicleInfoReport, VIN_LENGTH,
};

/// OBD-II mode constants
pub mod mode {
    /// Current data
    pub const CURRENT_DATA: u8 = 0x01;
    /// Freeze frame data
    pub const FREEZE_FRAME: u8 = 0x02;
    /// Stored diagnostic trouble codes
    pub const READ_DTC: u8 = 0x03;
    /// Pending trouble codes
    pub const PENDING_DTC: u8 = 0x07;
    /// Vehicle information
    pub const VEHICLE_INFO: u8 = 0x09;
    /// Permanent trouble codes
    pub const PERMANENT_DTC: u8 = 0x0A;
}
