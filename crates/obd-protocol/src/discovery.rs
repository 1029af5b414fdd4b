//! Port Discovery
//!
//! Lists serial endpoints an ELM327 adapter could sit behind: USB serial
//! ports and Bluetooth SPP ports, plus paired Bluetooth devices reported by
//! the platform's own tooling. Discovery never fails; anything that goes
//! wrong while enumerating is logged and contributes an empty list.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::io;
use std::sync::Arc;
use std::time::Duration;
use tokio::process::Command;
use tracing::{debug, warn};

/// Upper bound for one platform tool invocation
pub const TOOL_TIMEOUT: Duration = Duration::from_secs(10);

/// Name fragments of well-known ELM327 clones and OBD dongles
const OBD_MARKERS: [&str; 10] = [
    "obd", "elm", "vlink", "v-link", "vgate", "icar", "obdlink", "konnwei", "veepeak", "scantool",
];

/// Physical transport behind an endpoint
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TransportKind {
    Usb,
    Bluetooth,
}

impl TransportKind {
    /// Read/write timeout for a port of this kind
    pub fn io_timeout(&self) -> Duration {
        match self {
            TransportKind::Usb => Duration::from_secs(1),
            TransportKind::Bluetooth => Duration::from_secs(3),
        }
    }
}

/// Where an endpoint was found
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EndpointSource {
    /// Operating system serial port, can be opened directly
    SerialPort,
    /// Paired Bluetooth device with no serial port bound to it
    PairedDevice,
}

/// A candidate adapter location
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SerialEndpoint {
    /// Port path (`/dev/ttyUSB0`, `COM3`) or device address
    pub id: String,
    pub kind: TransportKind,
    pub description: String,
    pub manufacturer: Option<String>,
    /// Name matches a known OBD adapter
    pub obd_compatible: bool,
    pub source: EndpointSource,
}

impl SerialEndpoint {
    /// Endpoint for a port path given by the user
    pub fn manual(id: impl Into<String>) -> Self {
        let id = id.into();
        let lower = id.to_lowercase();
        let kind = if lower.contains("rfcomm") || lower.contains("bluetooth") {
            TransportKind::Bluetooth
        } else {
            TransportKind::Usb
        };
        Self {
            description: id.clone(),
            id,
            kind,
            manufacturer: None,
            obd_compatible: true,
            source: EndpointSource::SerialPort,
        }
    }

    /// Can be opened as a serial port
    pub fn is_openable(&self) -> bool {
        self.source == EndpointSource::SerialPort
    }
}

/// What the OS reports about one serial port
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PortFacts {
    pub name: String,
    pub usb: bool,
    pub bluetooth: bool,
    pub description: String,
    pub manufacturer: Option<String>,
}

impl From<tokio_serial::SerialPortInfo> for PortFacts {
    fn from(info: tokio_serial::SerialPortInfo) -> Self {
        use tokio_serial::SerialPortType;
        let mut facts = PortFacts {
            name: info.port_name,
            ..Default::default()
        };
        match info.port_type {
            SerialPortType::UsbPort(usb) => {
                facts.usb = true;
                facts.description = usb.product.unwrap_or_default();
                facts.manufacturer = usb.manufacturer;
            }
            SerialPortType::BluetoothPort => facts.bluetooth = true,
            SerialPortType::PciPort | SerialPortType::Unknown => {}
        }
        facts
    }
}

fn looks_like_obd(text: &str) -> bool {
    let text = text.to_lowercase();
    OBD_MARKERS.iter().any(|m| text.contains(m))
}

/// Decide whether a port may host an adapter, and over which transport.
///
/// Legacy on-board UARTs and anything else that is neither USB nor
/// Bluetooth is skipped.
pub fn classify_port(facts: &PortFacts) -> Option<SerialEndpoint> {
    let name = facts.name.to_lowercase();
    let text = format!(
        "{} {} {}",
        name,
        facts.description.to_lowercase(),
        facts.manufacturer.as_deref().unwrap_or_default().to_lowercase()
    );

    let bluetooth = facts.bluetooth
        || text.contains("bluetooth")
        || name.contains("rfcomm")
        || (name.starts_with("/dev/cu.") && !name.contains("usb"));
    let usb = facts.usb
        || name.contains("ttyusb")
        || name.contains("ttyacm")
        || name.contains("usbserial")
        || name.contains("usbmodem");

    let kind = if bluetooth {
        TransportKind::Bluetooth
    } else if usb {
        TransportKind::Usb
    } else {
        return None;
    };

    let description = if facts.description.is_empty() {
        facts.name.clone()
    } else {
        facts.description.clone()
    };

    Some(SerialEndpoint {
        id: facts.name.clone(),
        kind,
        description,
        manufacturer: facts.manufacturer.clone(),
        obd_compatible: looks_like_obd(&text),
        source: EndpointSource::SerialPort,
    })
}

/// Classify every port, dropping macOS `tty.` twins of `cu.` ports
pub fn classify_ports(ports: &[PortFacts]) -> Vec<SerialEndpoint> {
    ports
        .iter()
        .filter(|p| match p.name.strip_prefix("/dev/tty.") {
            Some(rest) => !ports.iter().any(|o| o.name == format!("/dev/cu.{rest}")),
            None => true,
        })
        .filter_map(classify_port)
        .collect()
}

/// A paired Bluetooth device as reported by the OS
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PairedDevice {
    pub name: String,
    pub address: String,
}

impl PairedDevice {
    fn into_endpoint(self) -> SerialEndpoint {
        SerialEndpoint {
            obd_compatible: looks_like_obd(&self.name),
            id: self.address,
            kind: TransportKind::Bluetooth,
            description: self.name,
            manufacturer: None,
            source: EndpointSource::PairedDevice,
        }
    }
}

/// Platform source of paired Bluetooth devices
#[async_trait]
pub trait BluetoothDiscovery: Send + Sync {
    /// Paired devices; errors are absorbed by [`Discovery`]
    async fn paired_devices(&self) -> io::Result<Vec<PairedDevice>>;

    fn name(&self) -> &'static str;
}

/// Run a platform tool and capture stdout, bounded by [`TOOL_TIMEOUT`]
async fn run_tool(program: &str, args: &[&str]) -> io::Result<String> {
    let output = tokio::time::timeout(
        TOOL_TIMEOUT,
        Command::new(program).args(args).kill_on_drop(true).output(),
    )
    .await
    .map_err(|_| io::Error::new(io::ErrorKind::TimedOut, format!("{program} timed out")))??;

    if !output.status.success() {
        return Err(io::Error::new(
            io::ErrorKind::Other,
            format!("{program} exited with {}", output.status),
        ));
    }
    Ok(String::from_utf8_lossy(&output.stdout).into_owned())
}

/// Linux, BlueZ `bluetoothctl`
#[derive(Debug, Default, Clone, Copy)]
pub struct Bluetoothctl;

/// Parse `Device AA:BB:CC:DD:EE:FF Name` lines
pub fn parse_bluetoothctl(output: &str) -> Vec<PairedDevice> {
    output
        .lines()
        .filter_map(|line| {
            let rest = line.trim().strip_prefix("Device ")?;
            let (address, name) = rest.split_once(' ').unwrap_or((rest, ""));
            Some(PairedDevice {
                name: if name.trim().is_empty() {
                    address.to_string()
                } else {
                    name.trim().to_string()
                },
                address: address.to_string(),
            })
        })
        .collect()
}

#[async_trait]
impl BluetoothDiscovery for Bluetoothctl {
    async fn paired_devices(&self) -> io::Result<Vec<PairedDevice>> {
        // BlueZ 5.65+ filters `devices`; older releases have `paired-devices`
        let output = match run_tool("bluetoothctl", &["devices", "Paired"]).await {
            Ok(out) if !out.trim().is_empty() => out,
            _ => run_tool("bluetoothctl", &["paired-devices"]).await?,
        };
        Ok(parse_bluetoothctl(&output))
    }

    fn name(&self) -> &'static str {
        "bluetoothctl"
    }
}

/// macOS, `system_profiler SPBluetoothDataType -json`
#[derive(Debug, Default, Clone, Copy)]
pub struct SystemProfiler;

/// Parse the profiler's JSON; both the current and pre-Monterey layouts
pub fn parse_system_profiler(json: &str) -> io::Result<Vec<PairedDevice>> {
    let root: serde_json::Value = serde_json::from_str(json)?;
    let mut devices = Vec::new();
    let controllers = root["SPBluetoothDataType"].as_array().cloned().unwrap_or_default();
    for controller in controllers {
        for key in ["device_connected", "device_not_connected", "device_title"] {
            let Some(entries) = controller[key].as_array() else {
                continue;
            };
            for entry in entries {
                let Some(map) = entry.as_object() else {
                    continue;
                };
                for (name, props) in map {
                    let address = props["device_address"]
                        .as_str()
                        .or_else(|| props["device_addr"].as_str())
                        .unwrap_or(name);
                    devices.push(PairedDevice {
                        name: name.clone(),
                        address: address.to_string(),
                    });
                }
            }
        }
    }
    Ok(devices)
}

#[async_trait]
impl BluetoothDiscovery for SystemProfiler {
    async fn paired_devices(&self) -> io::Result<Vec<PairedDevice>> {
        let output = run_tool("system_profiler", &["SPBluetoothDataType", "-json"]).await?;
        parse_system_profiler(&output)
    }

    fn name(&self) -> &'static str {
        "system_profiler"
    }
}

/// Windows, PnP device enumeration through PowerShell
#[derive(Debug, Default, Clone, Copy)]
pub struct PnpEnumeration;

const PNP_QUERY: &str = "Get-PnpDevice -Class Bluetooth -PresentOnly | \
                         Select-Object FriendlyName,InstanceId | ConvertTo-Json";

/// Parse `ConvertTo-Json` output, which is an object for a single device
pub fn parse_pnp_devices(json: &str) -> io::Result<Vec<PairedDevice>> {
    if json.trim().is_empty() {
        return Ok(Vec::new());
    }
    let root: serde_json::Value = serde_json::from_str(json)?;
    let items = match root {
        serde_json::Value::Array(items) => items,
        other => vec![other],
    };
    Ok(items
        .iter()
        .filter_map(|item| {
            let name = item["FriendlyName"].as_str()?;
            let address = item["InstanceId"].as_str().unwrap_or(name);
            Some(PairedDevice {
                name: name.to_string(),
                address: address.to_string(),
            })
        })
        .collect())
}

#[async_trait]
impl BluetoothDiscovery for PnpEnumeration {
    async fn paired_devices(&self) -> io::Result<Vec<PairedDevice>> {
        let output = run_tool("powershell", &["-NoProfile", "-Command", PNP_QUERY]).await?;
        parse_pnp_devices(&output)
    }

    fn name(&self) -> &'static str {
        "pnp"
    }
}

/// No Bluetooth tooling on this platform
#[derive(Debug, Default, Clone, Copy)]
pub struct NoBluetooth;

#[async_trait]
impl BluetoothDiscovery for NoBluetooth {
    async fn paired_devices(&self) -> io::Result<Vec<PairedDevice>> {
        Ok(Vec::new())
    }

    fn name(&self) -> &'static str {
        "none"
    }
}

/// Bluetooth source for the platform this binary was built for
pub fn platform_bluetooth() -> Arc<dyn BluetoothDiscovery> {
    #[cfg(target_os = "linux")]
    {
        Arc::new(Bluetoothctl)
    }
    #[cfg(target_os = "macos")]
    {
        Arc::new(SystemProfiler)
    }
    #[cfg(target_os = "windows")]
    {
        Arc::new(PnpEnumeration)
    }
    #[cfg(not(any(target_os = "linux", target_os = "macos", target_os = "windows")))]
    {
        Arc::new(NoBluetooth)
    }
}

/// Endpoint enumeration over serial ports and paired devices
#[derive(Clone)]
pub struct Discovery {
    bluetooth: Arc<dyn BluetoothDiscovery>,
    scan_ports: bool,
}

impl Default for Discovery {
    fn default() -> Self {
        Self::platform()
    }
}

impl std::fmt::Debug for Discovery {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Discovery")
            .field("bluetooth", &self.bluetooth.name())
            .field("scan_ports", &self.scan_ports)
            .finish()
    }
}

impl Discovery {
    /// OS serial ports plus the platform Bluetooth source
    pub fn platform() -> Self {
        Self {
            bluetooth: platform_bluetooth(),
            scan_ports: true,
        }
    }

    /// Replace the Bluetooth source
    pub fn with_bluetooth(mut self, bluetooth: Arc<dyn BluetoothDiscovery>) -> Self {
        self.bluetooth = bluetooth;
        self
    }

    /// Skip OS serial port enumeration, leaving only the Bluetooth source
    pub fn without_serial_ports(mut self) -> Self {
        self.scan_ports = false;
        self
    }

    fn serial_ports(&self) -> Vec<SerialEndpoint> {
        if !self.scan_ports {
            return Vec::new();
        }
        match tokio_serial::available_ports() {
            Ok(ports) => {
                let facts: Vec<PortFacts> = ports.into_iter().map(PortFacts::from).collect();
                classify_ports(&facts)
            }
            Err(e) => {
                warn!("Serial port enumeration failed: {}", e);
                Vec::new()
            }
        }
    }

    /// All candidate endpoints. Paired devices already visible as a serial
    /// port (same name) are not listed twice.
    pub async fn list_endpoints(&self) -> Vec<SerialEndpoint> {
        let mut endpoints = self.serial_ports();

        let paired = match self.bluetooth.paired_devices().await {
            Ok(devices) => devices,
            Err(e) => {
                warn!("Bluetooth discovery via {} failed: {}", self.bluetooth.name(), e);
                Vec::new()
            }
        };

        for device in paired {
            let name = device.name.to_lowercase();
            let known = endpoints.iter().any(|e| {
                e.id.to_lowercase().contains(&name) || e.description.to_lowercase() == name
            });
            if !known {
                endpoints.push(device.into_endpoint());
            }
        }

        debug!("Discovered {} endpoints", endpoints.len());
        endpoints
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn facts(name: &str) -> PortFacts {
        PortFacts {
            name: name.to_string(),
            ..Default::default()
        }
    }

    #[test]
    fn test_classify_usb_adapter() {
        let port = PortFacts {
            name: "/dev/ttyUSB0".to_string(),
            usb: true,
            description: "OBDLink SX".to_string(),
            manufacturer: Some("ScanTool.net".to_string()),
            ..Default::default()
        };
        let endpoint = classify_port(&port).unwrap();
        assert_eq!(endpoint.kind, TransportKind::Usb);
        assert!(endpoint.obd_compatible);
        assert_eq!(endpoint.kind.io_timeout(), Duration::from_secs(1));
    }

    #[test]
    fn test_classify_bluetooth_ports() {
        assert_eq!(
            classify_port(&facts("/dev/rfcomm0")).unwrap().kind,
            TransportKind::Bluetooth
        );
        let mac = classify_port(&facts("/dev/cu.OBDII-SPPDev")).unwrap();
        assert_eq!(mac.kind, TransportKind::Bluetooth);
        assert!(mac.obd_compatible);
        assert_eq!(mac.kind.io_timeout(), Duration::from_secs(3));
        assert_eq!(
            classify_port(&facts("/dev/cu.usbserial-1420")).unwrap().kind,
            TransportKind::Usb
        );
    }

    #[test]
    fn test_classify_skips_legacy_uart() {
        assert!(classify_port(&facts("/dev/ttyS0")).is_none());
        assert!(classify_port(&facts("COM1")).is_none());
    }

    #[test]
    fn test_unknown_usb_device_not_obd() {
        let port = PortFacts {
            name: "COM4".to_string(),
            usb: true,
            description: "USB-SERIAL CH340".to_string(),
            ..Default::default()
        };
        let endpoint = classify_port(&port).unwrap();
        assert_eq!(endpoint.kind, TransportKind::Usb);
        assert!(!endpoint.obd_compatible);
    }

    #[test]
    fn test_macos_tty_twin_dropped() {
        let ports = vec![facts("/dev/cu.OBDII"), facts("/dev/tty.OBDII")];
        let endpoints = classify_ports(&ports);
        assert_eq!(endpoints.len(), 1);
        assert_eq!(endpoints[0].id, "/dev/cu.OBDII");
    }

    #[test]
    fn test_parse_bluetoothctl() {
        let out = "Device 00:1D:A5:68:98:8B OBDII\nDevice 11:22:33:44:55:66 Pixel 7\njunk\n";
        let devices = parse_bluetoothctl(out);
        assert_eq!(devices.len(), 2);
        assert_eq!(devices[0].address, "00:1D:A5:68:98:8B");
        assert_eq!(devices[1].name, "Pixel 7");
    }

    #[test]
    fn test_parse_system_profiler() {
        let json = r#"{"SPBluetoothDataType":[{
            "controller_properties":{"controller_address":"AA:BB"},
            "device_connected":[{"Vgate iCar Pro":{"device_address":"00:1D:A5:00:00:01"}}],
            "device_not_connected":[{"AirPods":{"device_address":"00:1D:A5:00:00:02"}}]
        }]}"#;
        let devices = parse_system_profiler(json).unwrap();
        assert_eq!(devices.len(), 2);
        assert_eq!(devices[0].name, "Vgate iCar Pro");
        assert_eq!(devices[0].address, "00:1D:A5:00:00:01");
        assert!(parse_system_profiler("not json").is_err());
    }

    #[test]
    fn test_parse_pnp_single_and_list() {
        let one = r#"{"FriendlyName":"OBDII","InstanceId":"BTHENUM\\DEV_001DA568988B"}"#;
        assert_eq!(parse_pnp_devices(one).unwrap().len(), 1);

        let many = r#"[
            {"FriendlyName":"OBDII","InstanceId":"A"},
            {"FriendlyName":null,"InstanceId":"B"}
        ]"#;
        let devices = parse_pnp_devices(many).unwrap();
        assert_eq!(devices.len(), 1);
        assert_eq!(devices[0].address, "A");
        assert!(parse_pnp_devices("").unwrap().is_empty());
    }

    struct Failing;

    #[async_trait]
    impl BluetoothDiscovery for Failing {
        async fn paired_devices(&self) -> io::Result<Vec<PairedDevice>> {
            Err(io::Error::new(io::ErrorKind::NotFound, "bluetoothctl not installed"))
        }

        fn name(&self) -> &'static str {
            "failing"
        }
    }

    struct Fixed(Vec<PairedDevice>);

    #[async_trait]
    impl BluetoothDiscovery for Fixed {
        async fn paired_devices(&self) -> io::Result<Vec<PairedDevice>> {
            Ok(self.0.clone())
        }

        fn name(&self) -> &'static str {
            "fixed"
        }
    }

    #[tokio::test]
    async fn test_discovery_degrades_to_empty() {
        let discovery = Discovery::platform()
            .without_serial_ports()
            .with_bluetooth(Arc::new(Failing));
        assert!(discovery.list_endpoints().await.is_empty());
    }

    #[tokio::test]
    async fn test_paired_devices_become_endpoints() {
        let discovery = Discovery::platform()
            .without_serial_ports()
            .with_bluetooth(Arc::new(Fixed(vec![PairedDevice {
                name: "OBDII".to_string(),
                address: "00:1D:A5:68:98:8B".to_string(),
            }])));
        let endpoints = discovery.list_endpoints().await;
        assert_eq!(endpoints.len(), 1);
        assert_eq!(endpoints[0].source, EndpointSource::PairedDevice);
        assert!(endpoints[0].obd_compatible);
        assert!(!endpoints[0].is_openable());
    }
}
