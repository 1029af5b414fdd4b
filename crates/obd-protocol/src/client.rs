//! OBD-II Client for ELM327 Adapters
//!
//! Owns the connection lifecycle: endpoint selection, the AT handshake, the
//! liveness probe, and the typed reads built on top of the command channel.

use crate::channel::{CommandChannel, Link, RawResponse};
use crate::discovery::{Discovery, SerialEndpoint};
use crate::dtc::{DtcStatus, TroubleCode};
use crate::error::ObdError;
use crate::mode;
use crate::pid::SensorReading;
use crate::protocol::ObdProtocol;
use crate::readiness::ReadinessStatus;
use crate::response::{
    parse_dtcs, parse_freeze_sensor, parse_freeze_trigger, parse_pid_bytes, parse_sensor,
    parse_supported_pids, parse_vehicle_info, reply_lines, reply_status, ReplyStatus,
};
use crate::vehicle::{decode_calibration_ids, decode_vin, FreezeFrame, VehicleInfoReport};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{Mutex, MutexGuard};
use tracing::{debug, error, info, warn};

/// Default timeout for OBD commands
const DEFAULT_TIMEOUT_MS: u64 = 5000;

/// Default baud rate of ELM327 clones
pub const DEFAULT_BAUD_RATE: u32 = 38400;

const RESET: &str = "ATZ";

/// Echo off, headers on, automatic protocol, spaces off, memory off,
/// adaptive timing, long messages, max response wait
const INIT_SEQUENCE: [&str; 8] = [
    "ATE0", "ATH1", "ATSP0", "ATS0", "ATM0", "ATAT1", "ATAL", "ATST64",
];

/// Supported-PID request doubling as the vehicle liveness probe
const PROBE: &str = "0100";

/// Lifecycle of the adapter connection
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ConnectionState {
    Disconnected,
    Handshaking,
    Ready,
    Failed,
}

/// Timing of the adapter handshake
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct HandshakeProfile {
    /// Pause after `ATZ` while the adapter reboots
    pub reset_settle: Duration,
    /// Pause between initialization commands
    pub command_delay: Duration,
    pub command_timeout: Duration,
    /// Wait for the `0100` probe; the first request triggers the bus search
    pub probe_timeout: Duration,
}

impl HandshakeProfile {
    pub fn standard() -> Self {
        Self {
            reset_settle: Duration::from_millis(1000),
            command_delay: Duration::from_millis(100),
            command_timeout: Duration::from_millis(DEFAULT_TIMEOUT_MS),
            probe_timeout: Duration::from_secs(10),
        }
    }

    /// Collapsed delays and a 3 s ceiling per command
    pub fn fast() -> Self {
        Self {
            reset_settle: Duration::from_millis(100),
            command_delay: Duration::ZERO,
            command_timeout: Duration::from_secs(3),
            probe_timeout: Duration::from_secs(3),
        }
    }
}

impl Default for HandshakeProfile {
    fn default() -> Self {
        Self::standard()
    }
}

/// How to open and initialize a connection
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConnectOptions {
    pub baud_rate: u32,
    /// Use [`HandshakeProfile::fast`]
    pub fast_init: bool,
}

impl Default for ConnectOptions {
    fn default() -> Self {
        Self {
            baud_rate: DEFAULT_BAUD_RATE,
            fast_init: false,
        }
    }
}

impl ConnectOptions {
    pub fn profile(&self) -> HandshakeProfile {
        if self.fast_init {
            HandshakeProfile::fast()
        } else {
            HandshakeProfile::standard()
        }
    }
}

/// Outcome of a successful handshake
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HandshakeReport {
    /// Banner printed on reset, e.g. `ELM327 v1.5`
    pub adapter: Option<String>,
    /// The vehicle answered the probe
    pub verified: bool,
    /// PIDs 01-20 from the probe reply
    pub supported_pids: Vec<u8>,
    /// Why the probe failed, when it did
    pub warning: Option<String>,
}

/// Snapshot of the connection for callers and logs
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConnectionStatus {
    pub state: ConnectionState,
    pub endpoint: Option<SerialEndpoint>,
    pub baud_rate: u32,
    pub protocol: ObdProtocol,
    pub verified: bool,
    pub last_activity: Option<DateTime<Utc>>,
}

/// Pick the endpoint to open when the caller names none.
///
/// Known OBD adapters win over other ports; paired Bluetooth devices
/// without a bound serial port cannot be opened.
pub fn select_endpoint(endpoints: Vec<SerialEndpoint>) -> Result<SerialEndpoint, ObdError> {
    let (openable, paired): (Vec<_>, Vec<_>) =
        endpoints.into_iter().partition(|e| e.is_openable());

    if let Some(endpoint) = openable
        .iter()
        .find(|e| e.obd_compatible)
        .or_else(|| openable.first())
    {
        return Ok(endpoint.clone());
    }
    match paired.iter().find(|e| e.obd_compatible).or_else(|| paired.first()) {
        Some(device) => Err(ObdError::ConnectionFailed(format!(
            "{} ({}) is paired but has no serial port bound to it",
            device.description, device.id
        ))),
        None => Err(ObdError::NoDeviceFound),
    }
}

fn open_serial(endpoint: &SerialEndpoint, baud_rate: u32) -> Result<Box<dyn Link>, ObdError> {
    use tokio_serial::SerialPortBuilderExt;

    if !endpoint.is_openable() {
        return Err(ObdError::ConnectionFailed(format!(
            "{} is not a serial port",
            endpoint.id
        )));
    }
    let port = tokio_serial::new(&endpoint.id, baud_rate)
        .timeout(endpoint.kind.io_timeout())
        .open_native_async()
        .map_err(|e| ObdError::ConnectionFailed(format!("{}: {}", endpoint.id, e)))?;
    Ok(Box::new(port))
}

/// Adapter banner from the `ATZ` reply
fn banner(raw: &str) -> Option<String> {
    raw.split(['\r', '\n'])
        .map(|line| line.trim().trim_end_matches('>').trim())
        .find(|line| line.to_ascii_uppercase().contains("ELM"))
        .map(str::to_string)
}

/// Send an AT command, retrying once if the adapter stays silent
async fn send_at(
    channel: &mut CommandChannel,
    command: &str,
    timeout: Duration,
) -> Result<RawResponse, ObdError> {
    let response = channel.send(command, timeout).await?;
    if !response.is_empty() {
        return Ok(response);
    }
    debug!("No reply to {}, retrying", command);
    let response = channel.send(command, timeout).await?;
    if response.is_empty() {
        warn!("Adapter did not answer {}", command);
    }
    Ok(response)
}

async fn handshake(
    channel: &mut CommandChannel,
    profile: &HandshakeProfile,
) -> Result<HandshakeReport, ObdError> {
    let reset = send_at(channel, RESET, profile.command_timeout).await?;
    let adapter = banner(&reset.text);
    match &adapter {
        Some(name) => info!("Adapter reports {}", name),
        None => warn!("No ELM327 banner after reset"),
    }
    tokio::time::sleep(profile.reset_settle).await;

    for command in INIT_SEQUENCE {
        send_at(channel, command, profile.command_timeout).await?;
        if !profile.command_delay.is_zero() {
            tokio::time::sleep(profile.command_delay).await;
        }
    }

    let probe = channel.send(PROBE, profile.probe_timeout).await?;
    let supported_pids = parse_supported_pids(&probe.text, 0x00).unwrap_or_else(|e| {
        debug!("Unreadable probe reply: {}", e);
        Vec::new()
    });

    if !supported_pids.is_empty() {
        return Ok(HandshakeReport {
            adapter,
            verified: true,
            supported_pids,
            warning: None,
        });
    }

    let reason = match reply_status(&probe.text) {
        ReplyStatus::Empty => "no reply to 0100".to_string(),
        ReplyStatus::NoData => "NO DATA".to_string(),
        ReplyStatus::Error(line) => line,
        ReplyStatus::Data => "unrecognized reply to 0100".to_string(),
    };
    let degraded = ObdError::HandshakeDegraded(format!("vehicle probe: {reason}"));
    warn!("{}; adapter left open", degraded);
    Ok(HandshakeReport {
        adapter,
        verified: false,
        supported_pids,
        warning: Some(degraded.to_string()),
    })
}

/// OBD-II client for communicating with ELM327-compatible adapters
pub struct ObdClient {
    discovery: Discovery,
    options: ConnectOptions,
    state: ConnectionState,
    endpoint: Option<SerialEndpoint>,
    channel: Option<CommandChannel>,
    /// OBD protocol in use
    protocol: ObdProtocol,
    /// Command timeout
    timeout: Duration,
    /// Vehicle answered the last probe
    verified: bool,
    last_activity: Option<DateTime<Utc>>,
}

impl ObdClient {
    /// Create a disconnected client using platform discovery
    pub fn new(options: ConnectOptions) -> Self {
        Self::with_discovery(Discovery::platform(), options)
    }

    pub fn with_discovery(discovery: Discovery, options: ConnectOptions) -> Self {
        let timeout =
            Duration::from_millis(DEFAULT_TIMEOUT_MS).min(options.profile().command_timeout);
        Self {
            discovery,
            options,
            state: ConnectionState::Disconnected,
            endpoint: None,
            channel: None,
            protocol: ObdProtocol::Auto,
            timeout,
            verified: false,
            last_activity: None,
        }
    }

    /// Candidate endpoints, see [`Discovery::list_endpoints`]
    pub async fn list_endpoints(&self) -> Vec<SerialEndpoint> {
        self.discovery.list_endpoints().await
    }

    /// Open `endpoint` (or the best discovered one) and run the handshake.
    ///
    /// A probe the vehicle does not answer still leaves the client `Ready`;
    /// the report carries the warning and `verified` is false.
    pub async fn connect(
        &mut self,
        endpoint: Option<SerialEndpoint>,
    ) -> Result<HandshakeReport, ObdError> {
        if self.channel.is_some() {
            self.disconnect().await;
        }

        let endpoint = match endpoint {
            Some(endpoint) => endpoint,
            None => {
                let found = self.discovery.list_endpoints().await;
                select_endpoint(found)?
            }
        };

        info!("Connecting to {} ({:?})", endpoint.id, endpoint.kind);
        let link = match open_serial(&endpoint, self.options.baud_rate) {
            Ok(link) => link,
            Err(e) => {
                error!("{}", e);
                self.state = ConnectionState::Failed;
                return Err(e);
            }
        };
        self.connect_with_link(endpoint, link).await
    }

    /// Run the handshake over an already open link
    pub async fn connect_with_link(
        &mut self,
        endpoint: SerialEndpoint,
        link: Box<dyn Link>,
    ) -> Result<HandshakeReport, ObdError> {
        self.channel = None;
        self.state = ConnectionState::Handshaking;
        self.verified = false;
        self.protocol = ObdProtocol::Auto;

        let mut channel = CommandChannel::new(link, endpoint.kind.io_timeout());
        let profile = self.options.profile();
        let outcome = handshake(&mut channel, &profile).await;
        self.endpoint = Some(endpoint);

        match outcome {
            Ok(report) => {
                self.channel = Some(channel);
                self.state = ConnectionState::Ready;
                self.verified = report.verified;
                self.last_activity = Some(Utc::now());
                info!("OBD adapter initialized successfully (verified: {})", report.verified);
                Ok(report)
            }
            Err(e) => {
                error!("Handshake failed: {}", e);
                self.state = ConnectionState::Failed;
                Err(e)
            }
        }
    }

    /// Close the handle. Safe to call in any state.
    pub async fn disconnect(&mut self) {
        if self.channel.take().is_some() {
            info!("Disconnecting OBD client");
        }
        self.state = ConnectionState::Disconnected;
        self.verified = false;
    }

    /// Send one raw command. Only valid while `Ready`.
    pub async fn send(
        &mut self,
        command: &str,
        timeout: Duration,
    ) -> Result<RawResponse, ObdError> {
        let channel = match (self.state, self.channel.as_mut()) {
            (ConnectionState::Ready, Some(channel)) => channel,
            _ => return Err(ObdError::DeviceNotConnected),
        };
        match channel.send(command, timeout).await {
            Ok(response) => {
                self.last_activity = Some(Utc::now());
                Ok(response)
            }
            Err(ObdError::LinkClosed(reason)) => {
                error!("Lost adapter link: {}", reason);
                self.channel = None;
                self.state = ConnectionState::Failed;
                self.verified = false;
                Err(ObdError::LinkClosed(reason))
            }
            Err(e) => Err(e),
        }
    }

    async fn command(&mut self, command: &str) -> Result<RawResponse, ObdError> {
        self.send(command, self.timeout).await
    }

    /// Like `command`, but silence is a timeout error
    async fn command_with_reply(&mut self, command: &str) -> Result<RawResponse, ObdError> {
        let response = self.command(command).await?;
        if response.is_empty() {
            return Err(ObdError::Timeout(self.timeout.as_millis() as u64));
        }
        Ok(response)
    }

    /// Read one Mode 01 PID.
    ///
    /// `None` when the vehicle does not answer, answers `NO DATA`, or sends
    /// something that does not decode.
    pub async fn read_sensor(&mut self, pid: u8) -> Result<Option<SensorReading>, ObdError> {
        debug!("Querying PID {:02X}", pid);
        let response = self
            .command(&format!("{:02X}{pid:02X}", mode::CURRENT_DATA))
            .await?;
        match parse_sensor(&response.text, pid) {
            Ok(reading) => Ok(reading),
            Err(e) => {
                warn!("Discarding reply for PID {:02X}: {}", pid, e);
                Ok(None)
            }
        }
    }

    /// Read trouble codes for one pass (Mode 03, 07 or 0A)
    pub async fn read_dtcs(&mut self, status: DtcStatus) -> Result<Vec<TroubleCode>, ObdError> {
        let response = self.command_with_reply(status.command()).await?;
        if let ReplyStatus::Error(line) = reply_status(&response.text) {
            warn!("Mode {} rejected: {}", status.command(), line);
            return Ok(Vec::new());
        }
        let codes = parse_dtcs(&response.text, status)?;
        debug!("Mode {} returned {} codes", status.command(), codes.len());
        Ok(codes)
    }

    /// Read the VIN (`0902`)
    pub async fn read_vin(&mut self) -> Result<String, ObdError> {
        let response = self
            .command_with_reply(&format!("{:02X}02", mode::VEHICLE_INFO))
            .await?;
        let bytes = parse_vehicle_info(&response.text, 0x02)?;
        Ok(decode_vin(&bytes)?)
    }

    /// Read calibration IDs (`0904`)
    pub async fn read_calibration_ids(&mut self) -> Result<Vec<String>, ObdError> {
        let response = self
            .command_with_reply(&format!("{:02X}04", mode::VEHICLE_INFO))
            .await?;
        let bytes = parse_vehicle_info(&response.text, 0x04)?;
        Ok(decode_calibration_ids(&bytes)?)
    }

    /// Read every Mode 09 field, catching failures per field instead of
    /// failing the whole read. Only a lost connection is returned as an error.
    pub async fn read_vehicle_info(&mut self) -> Result<VehicleInfoReport, ObdError> {
        let mut report = VehicleInfoReport::default();

        match self.read_vin().await {
            Ok(vin) => report.identity.vin = Some(vin),
            Err(e) if e.is_connection_loss() => return Err(e),
            Err(e) => {
                warn!("VIN unavailable: {}", e);
                report.vin_error = Some(e.to_string());
            }
        }
        match self.read_calibration_ids().await {
            Ok(ids) => report.identity.calibration_ids = ids,
            Err(e) if e.is_connection_loss() => return Err(e),
            Err(e) => {
                debug!("Calibration IDs unavailable: {}", e);
                report.calibration_error = Some(e.to_string());
            }
        }
        Ok(report)
    }

    /// Read emissions monitor readiness (`0101`)
    pub async fn read_readiness(&mut self) -> Result<Option<ReadinessStatus>, ObdError> {
        let response = self.command("0101").await?;
        match parse_pid_bytes::<4>(&response.text, 0x01) {
            Ok(bytes) => Ok(bytes.map(ReadinessStatus::decode)),
            Err(e) => {
                warn!("Discarding readiness reply: {}", e);
                Ok(None)
            }
        }
    }

    /// Read freeze frame `frame`: the trigger code, then each PID in `pids`.
    ///
    /// `None` when no frame is stored under that index.
    pub async fn read_freeze_frame(
        &mut self,
        frame: u8,
        pids: &[u8],
    ) -> Result<Option<FreezeFrame>, ObdError> {
        let response = self
            .command(&format!("{:02X}02{frame:02X}", mode::FREEZE_FRAME))
            .await?;
        let trigger = parse_freeze_trigger(&response.text, frame).unwrap_or_else(|e| {
            warn!("Discarding freeze frame {} trigger: {}", frame, e);
            None
        });
        let Some(trigger) = trigger else {
            debug!("No freeze frame stored at index {}", frame);
            return Ok(None);
        };

        let mut readings = Vec::new();
        for &pid in pids.iter().filter(|p| **p != 0x02) {
            let response = self
                .command(&format!("{:02X}{pid:02X}{frame:02X}", mode::FREEZE_FRAME))
                .await?;
            match parse_freeze_sensor(&response.text, pid, frame) {
                Ok(Some(reading)) => readings.push(reading),
                Ok(None) => {}
                Err(e) => warn!("Discarding freeze frame PID {:02X}: {}", pid, e),
            }
        }

        Ok(Some(FreezeFrame {
            frame,
            trigger: Some(trigger),
            readings,
        }))
    }

    /// All Mode 01 PIDs the vehicle supports, following the `0120`, `0140`
    /// ... chain while each bitmap announces the next one
    pub async fn supported_pids(&mut self) -> Result<Vec<u8>, ObdError> {
        let mut supported = Vec::new();
        let mut base = 0x00u8;
        loop {
            let response = self.command(&format!("01{base:02X}")).await?;
            let pids = parse_supported_pids(&response.text, base).unwrap_or_default();
            let next = base.checked_add(0x20);
            let more = next.is_some_and(|n| pids.contains(&n));
            supported.extend(pids);
            match next {
                Some(n) if more => base = n,
                _ => break,
            }
        }
        Ok(supported)
    }

    /// Set the OBD protocol
    pub async fn set_protocol(&mut self, protocol: ObdProtocol) -> Result<(), ObdError> {
        info!("Setting OBD protocol to {:?}", protocol);
        let response = self.command_with_reply(&protocol.to_elm_command()).await?;
        if let ReplyStatus::Error(line) = reply_status(&response.text) {
            return Err(ObdError::UnsupportedProtocol(format!("{protocol:?}: {line}")));
        }
        self.protocol = protocol;
        Ok(())
    }

    /// Try each protocol in turn until the vehicle answers the probe
    pub async fn negotiate_protocol(
        &mut self,
        candidates: &[ObdProtocol],
    ) -> Result<ObdProtocol, ObdError> {
        let profile = self.options.profile();
        for &protocol in candidates {
            let response = self
                .send(&protocol.to_elm_command(), profile.command_timeout)
                .await?;
            if matches!(reply_status(&response.text), ReplyStatus::Error(_)) {
                debug!("Adapter rejected {:?}", protocol);
                continue;
            }
            let probe = self.send(PROBE, profile.probe_timeout).await?;
            if !parse_supported_pids(&probe.text, 0x00)
                .unwrap_or_default()
                .is_empty()
            {
                info!("Vehicle answers on {:?}", protocol);
                self.protocol = protocol;
                self.verified = true;
                return Ok(protocol);
            }
            debug!("No answer on {:?}", protocol);
        }
        Err(ObdError::UnsupportedProtocol(format!(
            "none of {} candidate protocols answered",
            candidates.len()
        )))
    }

    /// Protocol the adapter settled on (`ATDPN`)
    pub async fn detected_protocol(&mut self) -> Result<Option<ObdProtocol>, ObdError> {
        let response = self.command_with_reply("ATDPN").await?;
        let detected = reply_lines(&response.text)
            .last()
            .and_then(|line| ObdProtocol::from_describe_number(line));
        if let Some(protocol) = detected {
            self.protocol = protocol;
        }
        Ok(detected)
    }

    /// Set command timeout
    pub fn set_timeout(&mut self, timeout: Duration) {
        self.timeout = timeout;
    }

    pub fn state(&self) -> ConnectionState {
        self.state
    }

    /// Check if client is connected
    pub fn is_connected(&self) -> bool {
        self.state == ConnectionState::Ready && self.channel.is_some()
    }

    /// Get current protocol
    pub fn protocol(&self) -> ObdProtocol {
        self.protocol
    }

    pub fn status(&self) -> ConnectionStatus {
        ConnectionStatus {
            state: self.state,
            endpoint: self.endpoint.clone(),
            baud_rate: self.options.baud_rate,
            protocol: self.protocol,
            verified: self.verified,
            last_activity: self.last_activity,
        }
    }
}

/// Shared handle to the one client of a process.
///
/// The mutex serializes every exchange with the adapter; hold the guard
/// across a whole multi-command sequence to keep it uninterrupted.
#[derive(Clone)]
pub struct ScannerHandle(Arc<Mutex<ObdClient>>);

impl ScannerHandle {
    pub fn new(client: ObdClient) -> Self {
        Self(Arc::new(Mutex::new(client)))
    }

    /// Wait for exclusive use of the client
    pub async fn lock(&self) -> MutexGuard<'_, ObdClient> {
        self.0.lock().await
    }

    pub async fn status(&self) -> ConnectionStatus {
        self.0.lock().await.status()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::discovery::{EndpointSource, TransportKind};
    use crate::mock::MockElm327;

    fn endpoint() -> SerialEndpoint {
        SerialEndpoint::manual("/dev/ttyUSB0")
    }

    async fn connected(mock: MockElm327) -> (ObdClient, HandshakeReport) {
        let mut client = ObdClient::with_discovery(
            Discovery::platform().without_serial_ports(),
            ConnectOptions::default(),
        );
        let report = client
            .connect_with_link(endpoint(), Box::new(mock))
            .await
            .unwrap();
        (client, report)
    }

    #[tokio::test(start_paused = true)]
    async fn test_handshake_sequence() {
        let mock = MockElm327::new();
        let log = mock.command_log();
        let (client, report) = connected(mock).await;

        assert_eq!(client.state(), ConnectionState::Ready);
        assert!(report.verified);
        assert_eq!(report.adapter.as_deref(), Some("ELM327 v1.5"));
        assert!(report.supported_pids.contains(&0x0C));
        assert_eq!(
            log.commands(),
            vec!["ATZ", "ATE0", "ATH1", "ATSP0", "ATS0", "ATM0", "ATAT1", "ATAL", "ATST64", "0100"]
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_degraded_probe_stays_ready() {
        let (mut client, report) = connected(MockElm327::new().reply("0100", "NO DATA")).await;
        assert!(!report.verified);
        assert!(report.warning.unwrap().contains("NO DATA"));
        assert!(client.is_connected());
        assert!(!client.status().verified);
        assert!(client.read_sensor(0x0C).await.unwrap().is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn test_silent_probe_with_fast_init() {
        let mut client = ObdClient::with_discovery(
            Discovery::platform().without_serial_ports(),
            ConnectOptions {
                fast_init: true,
                ..Default::default()
            },
        );
        let started = tokio::time::Instant::now();
        let report = client
            .connect_with_link(endpoint(), Box::new(MockElm327::new().silent("0100")))
            .await
            .unwrap();
        assert!(report.warning.unwrap().contains("no reply"));
        assert!(started.elapsed() < Duration::from_secs(4));
        assert_eq!(client.state(), ConnectionState::Ready);
    }

    #[tokio::test(start_paused = true)]
    async fn test_handshake_io_failure() {
        let mut client = ObdClient::with_discovery(
            Discovery::platform().without_serial_ports(),
            ConnectOptions::default(),
        );
        let mock = MockElm327::new().fail_with("ATE0", std::io::ErrorKind::BrokenPipe);
        let err = client
            .connect_with_link(endpoint(), Box::new(mock))
            .await
            .unwrap_err();
        assert!(matches!(err, ObdError::LinkClosed(_)));
        assert_eq!(client.state(), ConnectionState::Failed);
        assert!(matches!(
            client.read_sensor(0x0C).await,
            Err(ObdError::DeviceNotConnected)
        ));
    }

    #[tokio::test]
    async fn test_send_requires_connection() {
        let mut client = ObdClient::new(ConnectOptions::default());
        assert_eq!(client.state(), ConnectionState::Disconnected);
        assert!(matches!(
            client.send("0100", Duration::from_secs(1)).await,
            Err(ObdError::DeviceNotConnected)
        ));
    }

    #[tokio::test(start_paused = true)]
    async fn test_read_sensor() {
        let mock = MockElm327::new()
            .reply("010C", "7E8 04 41 0C 1A F8")
            .silent("0105");
        let (mut client, _) = connected(mock).await;

        let rpm = client.read_sensor(0x0C).await.unwrap().unwrap();
        assert!((rpm.value - 1726.0).abs() < 1e-9);
        assert_eq!(rpm.unit, "RPM");
        assert!(client.read_sensor(0x05).await.unwrap().is_none());
        assert!(client.status().last_activity.is_some());
    }

    #[tokio::test(start_paused = true)]
    async fn test_read_dtcs() {
        let mock = MockElm327::new()
            .reply("03", "7E8 06 43 02 03 00 01 71")
            .silent("07");
        let (mut client, _) = connected(mock).await;

        let codes = client.read_dtcs(DtcStatus::Active).await.unwrap();
        let names: Vec<_> = codes.iter().map(|c| c.code()).collect();
        assert_eq!(names, vec!["P0300", "P0171"]);

        assert!(matches!(
            client.read_dtcs(DtcStatus::Pending).await,
            Err(ObdError::Timeout(_))
        ));
        assert!(client.read_dtcs(DtcStatus::Permanent).await.unwrap().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_read_vehicle_info() {
        let mock = MockElm327::new().reply(
            "0902",
            "7E8 10 14 49 02 01 31 47 31\r7E8 21 4A 43 35 34 34 34 52\r7E8 22 37 32 35 32 33 36 37",
        );
        let (mut client, _) = connected(mock).await;

        let report = client.read_vehicle_info().await.unwrap();
        assert_eq!(report.identity.vin.as_deref(), Some("1G1JC5444R7252367"));
        assert!(report.vin_error.is_none());
        assert!(report.identity.calibration_ids.is_empty());
        assert!(report.calibration_error.unwrap().contains("4904"));
    }

    #[tokio::test(start_paused = true)]
    async fn test_transient_error_keeps_connection() {
        let (mut client, _) = connected(MockElm327::new().fail("03")).await;
        assert!(matches!(
            client.read_dtcs(DtcStatus::Active).await,
            Err(ObdError::Serial(_))
        ));
        assert!(client.is_connected());
    }

    #[tokio::test(start_paused = true)]
    async fn test_link_loss_drops_connection() {
        let mock = MockElm327::new().fail_with("03", std::io::ErrorKind::BrokenPipe);
        let (mut client, _) = connected(mock).await;
        assert!(client.read_dtcs(DtcStatus::Active).await.is_err());
        assert_eq!(client.state(), ConnectionState::Failed);
        assert!(!client.is_connected());
    }

    #[tokio::test(start_paused = true)]
    async fn test_supported_pid_chain() {
        let (mut client, _) = connected(MockElm327::new()).await;
        let pids = client.supported_pids().await.unwrap();
        assert!(pids.contains(&0x0C));
        assert!(pids.contains(&0x20));
        assert!(pids.iter().all(|p| *p <= 0x20));
    }

    #[tokio::test(start_paused = true)]
    async fn test_negotiate_protocol() {
        let mock = MockElm327::new()
            .replies("0100", &["NO DATA", "NO DATA", "7E8 06 41 00 BE 3F A8 13"]);
        let (mut client, report) = connected(mock).await;
        assert!(!report.verified);

        let protocol = client
            .negotiate_protocol(&[
                ObdProtocol::Iso15765_4Can11bit500,
                ObdProtocol::Iso15765_4Can29bit500,
            ])
            .await
            .unwrap();
        assert_eq!(protocol, ObdProtocol::Iso15765_4Can29bit500);
        assert!(client.status().verified);
    }

    #[tokio::test(start_paused = true)]
    async fn test_detected_protocol() {
        let (mut client, _) = connected(MockElm327::new()).await;
        assert_eq!(
            client.detected_protocol().await.unwrap(),
            Some(ObdProtocol::Iso15765_4Can11bit500)
        );
        assert_eq!(client.protocol(), ObdProtocol::Iso15765_4Can11bit500);
    }

    #[tokio::test(start_paused = true)]
    async fn test_freeze_frame() {
        let mock = MockElm327::new()
            .reply("020200", "7E8 05 42 02 00 03 00")
            .reply("020C00", "7E8 05 42 0C 00 0F A0")
            .reply("020201", "7E8 05 42 02 01 00 00");
        let (mut client, _) = connected(mock).await;

        let frame = client.read_freeze_frame(0, &[0x0C, 0x0D]).await.unwrap().unwrap();
        assert_eq!(frame.trigger.unwrap().code(), "P0300");
        assert_eq!(frame.readings.len(), 1);
        assert!(client.read_freeze_frame(1, &[0x0C]).await.unwrap().is_none());
    }

    #[test]
    fn test_select_endpoint() {
        let usb = |id: &str, obd: bool| SerialEndpoint {
            id: id.to_string(),
            kind: TransportKind::Usb,
            description: id.to_string(),
            manufacturer: None,
            obd_compatible: obd,
            source: EndpointSource::SerialPort,
        };
        let chosen =
            select_endpoint(vec![usb("/dev/ttyACM0", false), usb("/dev/ttyUSB1", true)]).unwrap();
        assert_eq!(chosen.id, "/dev/ttyUSB1");
        assert_eq!(
            select_endpoint(vec![usb("/dev/ttyACM0", false)]).unwrap().id,
            "/dev/ttyACM0"
        );
        assert!(matches!(select_endpoint(vec![]), Err(ObdError::NoDeviceFound)));

        let paired = SerialEndpoint {
            source: EndpointSource::PairedDevice,
            kind: TransportKind::Bluetooth,
            ..usb("00:1D:A5:68:98:8B", true)
        };
        assert!(matches!(
            select_endpoint(vec![paired]),
            Err(ObdError::ConnectionFailed(_))
        ));
    }

    #[tokio::test]
    async fn test_connect_without_devices() {
        let mut client = ObdClient::with_discovery(
            Discovery::platform()
                .without_serial_ports()
                .with_bluetooth(Arc::new(crate::discovery::NoBluetooth)),
            ConnectOptions::default(),
        );
        assert!(matches!(client.connect(None).await, Err(ObdError::NoDeviceFound)));
    }

    fn fresh_client() -> ObdClient {
        ObdClient::with_discovery(
            Discovery::platform().without_serial_ports(),
            ConnectOptions::default(),
        )
    }

    #[tokio::test(start_paused = true)]
    async fn test_bluetooth_link_gets_longer_write_timeout() {
        let slow = || MockElm327::new().stall_writes(Duration::from_secs(2));

        let mut client = fresh_client();
        let bluetooth = SerialEndpoint::manual("/dev/rfcomm0");
        assert_eq!(bluetooth.kind, TransportKind::Bluetooth);
        let report = client
            .connect_with_link(bluetooth, Box::new(slow()))
            .await
            .unwrap();
        assert!(report.verified);
        assert_eq!(client.state(), ConnectionState::Ready);

        let mut client = fresh_client();
        let err = client
            .connect_with_link(endpoint(), Box::new(slow()))
            .await
            .unwrap_err();
        assert!(matches!(err, ObdError::Timeout(1000)));
        assert_eq!(client.state(), ConnectionState::Failed);
    }

    #[tokio::test(start_paused = true)]
    async fn test_set_timeout_bounds_reads() {
        let (mut client, _) = connected(MockElm327::new().silent("03")).await;
        client.set_timeout(Duration::from_millis(750));

        let started = tokio::time::Instant::now();
        let err = client.read_dtcs(DtcStatus::Active).await.unwrap_err();
        assert!(matches!(err, ObdError::Timeout(750)));
        assert!(started.elapsed() < Duration::from_secs(1));
        assert!(client.is_connected());
    }

    #[tokio::test(start_paused = true)]
    async fn test_scanner_handle_status() {
        let handle = ScannerHandle::new(fresh_client());
        assert_eq!(handle.status().await.state, ConnectionState::Disconnected);

        let (client, _) = connected(MockElm327::new()).await;
        let handle = ScannerHandle::new(client);
        let status = handle.status().await;
        assert_eq!(status.state, ConnectionState::Ready);
        assert_eq!(status.baud_rate, DEFAULT_BAUD_RATE);
        assert_eq!(status.endpoint.map(|e| e.id), Some("/dev/ttyUSB0".to_string()));
        assert!(status.verified);

        handle.lock().await.disconnect().await;
        assert_eq!(handle.status().await.state, ConnectionState::Disconnected);
    }
}
