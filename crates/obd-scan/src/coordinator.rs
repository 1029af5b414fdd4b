//! Full Diagnostic Scan
//!
//! Runs the enabled steps in order over one locked client. A failing step
//! is recorded and the scan moves on; only losing the connection ends it
//! early.

use crate::codes::{HealthStatus, TroubleCodeSet};
use chrono::{DateTime, Utc};
use obd_protocol::{
    DtcStatus, FreezeFrame, ObdClient, ObdError, Pid, ReadinessStatus, ScannerHandle,
    SensorReading, VehicleIdentity,
};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use thiserror::Error;
use tokio::time::Instant;
use tracing::{debug, info, warn};

/// Live parameters read when no list is configured
pub const DEFAULT_LIVE_PIDS: [Pid; 8] = [
    Pid::CoolantTemp,
    Pid::Rpm,
    Pid::Speed,
    Pid::IntakeAirTemp,
    Pid::ThrottlePosition,
    Pid::EngineLoad,
    Pid::Maf,
    Pid::ControlModuleVoltage,
];

/// Freeze frames read when not configured
pub const DEFAULT_MAX_FREEZE_FRAMES: usize = 3;

/// Which steps a scan runs
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ScanOptions {
    pub include_vin: bool,
    pub include_dtcs: bool,
    pub include_readiness: bool,
    pub include_freeze_frames: bool,
    /// Mode 01 PIDs for the live data step; empty skips it
    pub live_pids: Vec<u8>,
    /// Upper bound on freeze frames, one per trouble code
    pub max_freeze_frames: usize,
}

impl Default for ScanOptions {
    fn default() -> Self {
        Self {
            include_vin: true,
            include_dtcs: true,
            include_readiness: true,
            include_freeze_frames: true,
            live_pids: DEFAULT_LIVE_PIDS.iter().map(|p| p.as_hex()).collect(),
            max_freeze_frames: DEFAULT_MAX_FREEZE_FRAMES,
        }
    }
}

/// Outcome of a whole scan
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ScanStatus {
    /// Every step succeeded
    Completed,
    /// Some steps failed, or the scan was cancelled
    Partial,
    /// Not connected, or nothing succeeded
    Failed,
}

/// Cooperative cancellation, checked between scan steps
#[derive(Debug, Clone, Default)]
pub struct CancelFlag(Arc<AtomicBool>);

impl CancelFlag {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }
}

/// Everything a scan retrieved, plus what went wrong
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ScanResult {
    pub status: ScanStatus,
    pub health: HealthStatus,
    pub vehicle: VehicleIdentity,
    pub trouble_codes: TroubleCodeSet,
    pub sensors: Vec<SensorReading>,
    pub readiness: Option<ReadinessStatus>,
    pub freeze_frames: Vec<FreezeFrame>,
    /// One message per failed step
    pub error_messages: Vec<String>,
    /// Data the vehicle did not provide that does not count as a failure
    pub notes: Vec<String>,
    pub started_at: DateTime<Utc>,
    pub duration_ms: u64,
}

impl ScanResult {
    fn new(started_at: DateTime<Utc>) -> Self {
        Self {
            status: ScanStatus::Completed,
            health: HealthStatus::Good,
            vehicle: VehicleIdentity::default(),
            trouble_codes: TroubleCodeSet::new(),
            sensors: Vec::new(),
            readiness: None,
            freeze_frames: Vec::new(),
            error_messages: Vec::new(),
            notes: Vec::new(),
            started_at,
            duration_ms: 0,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Step {
    Vehicle,
    TroubleCodes(DtcStatus),
    Readiness,
    LiveData,
    FreezeFrames,
}

impl fmt::Display for Step {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Step::Vehicle => write!(f, "vehicle info"),
            Step::TroubleCodes(status) => write!(f, "{:?} trouble codes", status),
            Step::Readiness => write!(f, "readiness monitors"),
            Step::LiveData => write!(f, "live data"),
            Step::FreezeFrames => write!(f, "freeze frames"),
        }
    }
}

fn plan(options: &ScanOptions) -> Vec<Step> {
    let mut steps = Vec::new();
    if options.include_vin {
        steps.push(Step::Vehicle);
    }
    if options.include_dtcs {
        steps.extend(DtcStatus::PRIORITY.iter().map(|s| Step::TroubleCodes(*s)));
    }
    if options.include_readiness {
        steps.push(Step::Readiness);
    }
    if !options.live_pids.is_empty() {
        steps.push(Step::LiveData);
    }
    if options.include_freeze_frames && options.include_dtcs && options.max_freeze_frames > 0 {
        steps.push(Step::FreezeFrames);
    }
    steps
}

#[derive(Debug, Error)]
enum StepError {
    #[error(transparent)]
    Obd(#[from] ObdError),

    #[error("{0}")]
    Unavailable(String),
}

impl StepError {
    fn is_connection_loss(&self) -> bool {
        matches!(self, StepError::Obd(e) if e.is_connection_loss())
    }
}

async fn run_step(
    client: &mut ObdClient,
    step: Step,
    options: &ScanOptions,
    result: &mut ScanResult,
) -> Result<(), StepError> {
    match step {
        Step::Vehicle => {
            let report = client.read_vehicle_info().await?;
            result.vehicle = report.identity;
            if let Some(e) = report.calibration_error {
                result.notes.push(format!("calibration IDs unavailable: {e}"));
            }
            if let Some(e) = report.vin_error {
                return Err(StepError::Unavailable(format!("VIN unavailable: {e}")));
            }
        }
        Step::TroubleCodes(status) => {
            let codes = client.read_dtcs(status).await?;
            let found = codes.len();
            let added = result.trouble_codes.extend(codes);
            debug!("{} {:?} codes, {} new", found, status, added);
        }
        Step::Readiness => match client.read_readiness().await? {
            Some(readiness) => result.readiness = Some(readiness),
            None => result.notes.push("readiness monitors not reported".to_string()),
        },
        Step::LiveData => {
            let mut last_error = None;
            let mut failures = 0;
            for &pid in &options.live_pids {
                match client.read_sensor(pid).await {
                    Ok(Some(reading)) => result.sensors.push(reading),
                    Ok(None) => result.notes.push(format!("PID {pid:02X} not reported")),
                    Err(e) if e.is_connection_loss() => return Err(e.into()),
                    Err(e) => {
                        warn!("PID {:02X} read failed: {}", pid, e);
                        failures += 1;
                        last_error = Some(e);
                    }
                }
            }
            if failures == options.live_pids.len() {
                if let Some(e) = last_error {
                    return Err(e.into());
                }
            }
        }
        Step::FreezeFrames => {
            let frames = result.trouble_codes.len().min(options.max_freeze_frames);
            for frame in 0..frames {
                let Ok(index) = u8::try_from(frame) else {
                    break;
                };
                if let Some(snapshot) = client.read_freeze_frame(index, &options.live_pids).await? {
                    result.freeze_frames.push(snapshot);
                }
            }
        }
    }
    Ok(())
}

/// Run a full scan on an already locked client
pub async fn scan_client(
    client: &mut ObdClient,
    options: &ScanOptions,
    cancel: &CancelFlag,
) -> ScanResult {
    let started = Instant::now();
    let mut result = ScanResult::new(Utc::now());

    if !client.is_connected() {
        warn!("Scan requested without a connected adapter");
        result.status = ScanStatus::Failed;
        result.error_messages.push(ObdError::DeviceNotConnected.to_string());
        result.duration_ms = started.elapsed().as_millis() as u64;
        return result;
    }

    let steps = plan(options);
    info!("Starting full scan with {} steps", steps.len());
    let mut attempted = 0usize;
    let mut failed = 0usize;
    let mut cancelled = false;

    for step in steps {
        if cancel.is_cancelled() {
            info!("Scan cancelled before {}", step);
            result.error_messages.push(format!("scan cancelled before {step}"));
            cancelled = true;
            break;
        }

        attempted += 1;
        if let Err(e) = run_step(client, step, options, &mut result).await {
            failed += 1;
            warn!("Scan step {} failed: {}", step, e);
            result.error_messages.push(format!("{step}: {e}"));
            if e.is_connection_loss() {
                break;
            }
        }
    }

    result.health = result.trouble_codes.health();
    result.status = if cancelled {
        ScanStatus::Partial
    } else if attempted > 0 && failed == attempted {
        ScanStatus::Failed
    } else if result.error_messages.is_empty() {
        ScanStatus::Completed
    } else {
        ScanStatus::Partial
    };
    result.duration_ms = started.elapsed().as_millis() as u64;

    info!(
        "Scan finished: {:?}, {} codes, {} readings, {} errors in {} ms",
        result.status,
        result.trouble_codes.len(),
        result.sensors.len(),
        result.error_messages.len(),
        result.duration_ms
    );
    result
}

/// Lock the scanner for the whole scan and run it
pub async fn run_full_scan(
    scanner: &ScannerHandle,
    options: &ScanOptions,
    cancel: &CancelFlag,
) -> ScanResult {
    let mut client = scanner.lock().await;
    scan_client(&mut client, options, cancel).await
}
