//! Background scan sessions
//!
//! A scan takes seconds to minutes of serial round-trips, so callers start
//! it here and poll for the result by id instead of awaiting it inline.

use crate::coordinator::{run_full_scan, CancelFlag, ScanOptions, ScanResult, ScanStatus};
use chrono::{DateTime, Utc};
use obd_protocol::ScannerHandle;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use thiserror::Error;
use tokio::sync::{watch, RwLock};
use tracing::{debug, info};
use uuid::Uuid;

/// Session lookup errors
#[derive(Debug, Error, PartialEq, Eq)]
pub enum SessionError {
    #[error("no scan session {0}")]
    NotFound(Uuid),

    #[error("scan session {0} already finished")]
    AlreadyFinished(Uuid),

    #[error("scan session {0} is still running")]
    StillRunning(Uuid),
}

/// Finished sessions kept by default before the oldest are dropped
pub const DEFAULT_RETAINED_SESSIONS: usize = 16;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SessionState {
    Running,
    Completed,
    Failed,
}

/// Public view of one session
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SessionInfo {
    pub id: Uuid,
    pub state: SessionState,
    pub started_at: DateTime<Utc>,
    pub finished_at: Option<DateTime<Utc>>,
    pub result: Option<ScanResult>,
}

struct Session {
    /// Start order, unique within one registry
    order: u64,
    info: SessionInfo,
    cancel: CancelFlag,
    state_rx: watch::Receiver<SessionState>,
}

/// Registry of scans run on one scanner
#[derive(Clone)]
pub struct ScanSessions {
    scanner: ScannerHandle,
    sessions: Arc<RwLock<HashMap<Uuid, Session>>>,
    started: Arc<AtomicU64>,
    retain: usize,
}

impl ScanSessions {
    pub fn new(scanner: ScannerHandle) -> Self {
        Self {
            scanner,
            sessions: Arc::new(RwLock::new(HashMap::new())),
            started: Arc::new(AtomicU64::new(0)),
            retain: DEFAULT_RETAINED_SESSIONS,
        }
    }

    /// Keep at most `retain` finished sessions; running ones are never dropped
    pub fn with_retention(mut self, retain: usize) -> Self {
        self.retain = retain;
        self
    }

    /// Start a scan on a background task and return its id
    pub async fn start(&self, options: ScanOptions) -> Uuid {
        let id = Uuid::new_v4();
        let cancel = CancelFlag::new();
        let (state_tx, state_rx) = watch::channel(SessionState::Running);

        let mut sessions = self.sessions.write().await;
        prune_finished(&mut sessions, self.retain);
        sessions.insert(
            id,
            Session {
                order: self.started.fetch_add(1, Ordering::Relaxed),
                info: SessionInfo {
                    id,
                    state: SessionState::Running,
                    started_at: Utc::now(),
                    finished_at: None,
                    result: None,
                },
                cancel: cancel.clone(),
                state_rx,
            },
        );
        drop(sessions);
        info!("Scan session {} started", id);

        let scanner = self.scanner.clone();
        let sessions = self.sessions.clone();
        tokio::spawn(async move {
            let result = run_full_scan(&scanner, &options, &cancel).await;
            let state = match result.status {
                ScanStatus::Failed => SessionState::Failed,
                ScanStatus::Completed | ScanStatus::Partial => SessionState::Completed,
            };
            if let Some(session) = sessions.write().await.get_mut(&id) {
                session.info.state = state;
                session.info.finished_at = Some(Utc::now());
                session.info.result = Some(result);
            }
            info!("Scan session {} finished: {:?}", id, state);
            state_tx.send_replace(state);
        });

        id
    }

    pub async fn get(&self, id: Uuid) -> Option<SessionInfo> {
        self.sessions.read().await.get(&id).map(|s| s.info.clone())
    }

    /// All sessions, oldest first
    pub async fn list(&self) -> Vec<SessionInfo> {
        let sessions = self.sessions.read().await;
        let mut all: Vec<_> = sessions.values().collect();
        all.sort_by_key(|s| s.order);
        all.into_iter().map(|s| s.info.clone()).collect()
    }

    /// Ask a running scan to stop before its next step
    pub async fn cancel(&self, id: Uuid) -> Result<(), SessionError> {
        let sessions = self.sessions.read().await;
        let session = sessions.get(&id).ok_or(SessionError::NotFound(id))?;
        if session.info.state != SessionState::Running {
            return Err(SessionError::AlreadyFinished(id));
        }
        info!("Cancelling scan session {}", id);
        session.cancel.cancel();
        Ok(())
    }

    /// Drop a finished session and hand back its result
    pub async fn remove(&self, id: Uuid) -> Result<SessionInfo, SessionError> {
        let mut sessions = self.sessions.write().await;
        let session = sessions.get(&id).ok_or(SessionError::NotFound(id))?;
        if session.info.state == SessionState::Running {
            return Err(SessionError::StillRunning(id));
        }
        sessions
            .remove(&id)
            .map(|s| s.info)
            .ok_or(SessionError::NotFound(id))
    }

    /// Wait until the session leaves `Running`
    pub async fn wait(&self, id: Uuid) -> Result<SessionInfo, SessionError> {
        let mut state_rx = {
            let sessions = self.sessions.read().await;
            let session = sessions.get(&id).ok_or(SessionError::NotFound(id))?;
            session.state_rx.clone()
        };
        // A closed channel means the task is gone; the stored info is final
        let _ = state_rx.wait_for(|s| *s != SessionState::Running).await;
        self.get(id).await.ok_or(SessionError::NotFound(id))
    }
}

/// Drop the oldest finished sessions until at most `retain` remain
fn prune_finished(sessions: &mut HashMap<Uuid, Session>, retain: usize) {
    let mut finished: Vec<_> = sessions
        .values()
        .filter(|s| s.info.state != SessionState::Running)
        .map(|s| (s.order, s.info.id))
        .collect();
    if finished.len() <= retain {
        return;
    }
    finished.sort();
    let excess = finished.len() - retain;
    for (_, id) in finished.into_iter().take(excess) {
        debug!("Dropping finished scan session {}", id);
        sessions.remove(&id);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use obd_protocol::mock::MockElm327;
    use obd_protocol::{ConnectOptions, Discovery, ObdClient, SerialEndpoint};

    async fn scanner() -> ScannerHandle {
        let mut client = ObdClient::with_discovery(
            Discovery::platform().without_serial_ports(),
            ConnectOptions {
                fast_init: true,
                ..Default::default()
            },
        );
        let mock = MockElm327::new()
            .reply("03", "7E8 04 43 01 03 01")
            .reply("010C", "7E8 04 41 0C 1A F8");
        client
            .connect_with_link(SerialEndpoint::manual("/dev/ttyUSB0"), Box::new(mock))
            .await
            .unwrap();
        ScannerHandle::new(client)
    }

    fn idle_sessions() -> ScanSessions {
        ScanSessions::new(ScannerHandle::new(ObdClient::new(ConnectOptions::default())))
    }

    fn quick() -> ScanOptions {
        ScanOptions {
            include_vin: false,
            include_readiness: false,
            include_freeze_frames: false,
            live_pids: vec![0x0C],
            ..Default::default()
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_session_runs_to_completion() {
        let sessions = ScanSessions::new(scanner().await);
        let id = sessions.start(quick()).await;

        let info = sessions.wait(id).await.unwrap();
        assert_eq!(info.state, SessionState::Completed);
        assert!(info.finished_at.is_some());

        let result = info.result.unwrap();
        assert_eq!(result.status, ScanStatus::Completed);
        assert_eq!(result.trouble_codes.active[0].code(), "P0301");
        assert_eq!(result.sensors.len(), 1);

        assert_eq!(
            sessions.cancel(id).await,
            Err(SessionError::AlreadyFinished(id))
        );
        assert_eq!(sessions.list().await.len(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_cancel_before_first_step() {
        let handle = scanner().await;
        let sessions = ScanSessions::new(handle.clone());

        // Holding the client keeps the scan from starting
        let guard = handle.lock().await;
        let id = sessions.start(quick()).await;
        sessions.cancel(id).await.unwrap();
        assert_eq!(sessions.get(id).await.unwrap().state, SessionState::Running);
        drop(guard);

        let info = sessions.wait(id).await.unwrap();
        let result = info.result.unwrap();
        assert_eq!(result.status, ScanStatus::Partial);
        assert!(result.error_messages[0].contains("cancelled"));
        assert!(result.trouble_codes.is_empty());
    }

    #[tokio::test]
    async fn test_unknown_session() {
        let sessions = idle_sessions();
        let id = Uuid::new_v4();
        assert!(sessions.get(id).await.is_none());
        assert_eq!(sessions.cancel(id).await, Err(SessionError::NotFound(id)));
        assert_eq!(sessions.wait(id).await, Err(SessionError::NotFound(id)));
    }

    #[tokio::test]
    async fn test_scan_without_adapter_fails_session() {
        let sessions = idle_sessions();
        let id = sessions.start(ScanOptions::default()).await;
        let info = sessions.wait(id).await.unwrap();
        assert_eq!(info.state, SessionState::Failed);
    }

    #[tokio::test]
    async fn test_remove_finished_session() {
        let sessions = idle_sessions();
        let id = sessions.start(ScanOptions::default()).await;
        sessions.wait(id).await.unwrap();

        let removed = sessions.remove(id).await.unwrap();
        assert_eq!(removed.state, SessionState::Failed);
        assert!(removed.result.is_some());
        assert!(sessions.get(id).await.is_none());
        assert_eq!(sessions.remove(id).await, Err(SessionError::NotFound(id)));
    }

    #[tokio::test(start_paused = true)]
    async fn test_running_session_cannot_be_removed() {
        let handle = scanner().await;
        let sessions = ScanSessions::new(handle.clone());

        let guard = handle.lock().await;
        let id = sessions.start(quick()).await;
        assert_eq!(sessions.remove(id).await, Err(SessionError::StillRunning(id)));
        drop(guard);

        sessions.wait(id).await.unwrap();
        assert!(sessions.remove(id).await.is_ok());
    }

    #[tokio::test]
    async fn test_oldest_finished_sessions_pruned() {
        let sessions = idle_sessions().with_retention(2);
        let mut ids = Vec::new();
        for _ in 0..4 {
            let id = sessions.start(ScanOptions::default()).await;
            sessions.wait(id).await.unwrap();
            ids.push(id);
        }

        // Pruning happens on start, so the newest finished one rides along
        let kept: Vec<_> = sessions.list().await.into_iter().map(|s| s.id).collect();
        assert_eq!(kept.len(), 3);
        assert!(sessions.get(ids[0]).await.is_none());
        assert!(kept.contains(&ids[3]));
    }
}
