//! Diagnostic Scan Coordination
//!
//! Sequences VIN, trouble code, readiness, live data and freeze frame reads
//! into one [`ScanResult`], tolerating per-step failures, and runs scans in
//! the background as [`ScanSessions`].

mod codes;
mod coordinator;
mod sessions;

pub use codes::{HealthStatus, TroubleCodeSet};
pub use coordinator::{
    run_full_scan, scan_client, CancelFlag, ScanOptions, ScanResult, ScanStatus,
    DEFAULT_LIVE_PIDS, DEFAULT_MAX_FREEZE_FRAMES,
};
pub use sessions::{
    ScanSessions, SessionError, SessionInfo, SessionState, DEFAULT_RETAINED_SESSIONS,
};
