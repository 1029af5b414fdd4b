//! Trouble code aggregation across retrieval passes

use obd_protocol::{DtcStatus, Severity, TroubleCode};
use serde::{Deserialize, Serialize};

/// Overall vehicle health derived from the retrieved codes
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum HealthStatus {
    Good,
    Warning,
    Critical,
}

impl HealthStatus {
    /// Critical if any code is critical, warning if any code exists
    pub fn classify<'a>(codes: impl IntoIterator<Item = &'a TroubleCode>) -> Self {
        let mut health = HealthStatus::Good;
        for code in codes {
            if code.severity() == Severity::Critical {
                return HealthStatus::Critical;
            }
            health = HealthStatus::Warning;
        }
        health
    }
}

fn rank(status: DtcStatus) -> usize {
    DtcStatus::PRIORITY
        .iter()
        .position(|s| *s == status)
        .unwrap_or(DtcStatus::PRIORITY.len())
}

/// Codes from the active, pending and permanent passes, each code listed
/// once under the highest-priority pass that reported it
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TroubleCodeSet {
    pub active: Vec<TroubleCode>,
    pub pending: Vec<TroubleCode>,
    pub permanent: Vec<TroubleCode>,
}

impl TroubleCodeSet {
    pub fn new() -> Self {
        Self::default()
    }

    fn list_mut(&mut self, status: DtcStatus) -> &mut Vec<TroubleCode> {
        match status {
            DtcStatus::Active => &mut self.active,
            DtcStatus::Pending => &mut self.pending,
            DtcStatus::Permanent => &mut self.permanent,
        }
    }

    fn find(&self, code: &str) -> Option<&TroubleCode> {
        self.iter().find(|c| c.code() == code)
    }

    /// Add a code; returns false when it is already held under the same or
    /// a higher-priority pass. A code seen again under a higher-priority
    /// pass moves there.
    pub fn insert(&mut self, code: TroubleCode) -> bool {
        if let Some(existing) = self.find(code.code()) {
            let held = existing.status();
            if rank(held) <= rank(code.status()) {
                return false;
            }
            self.list_mut(held).retain(|c| c.code() != code.code());
        }
        self.list_mut(code.status()).push(code);
        true
    }

    /// Add every code of one pass; returns how many were new
    pub fn extend(&mut self, codes: impl IntoIterator<Item = TroubleCode>) -> usize {
        let mut added = 0;
        for code in codes {
            if self.insert(code) {
                added += 1;
            }
        }
        added
    }

    /// All codes, active first
    pub fn iter(&self) -> impl Iterator<Item = &TroubleCode> {
        self.active
            .iter()
            .chain(self.pending.iter())
            .chain(self.permanent.iter())
    }

    pub fn len(&self) -> usize {
        self.active.len() + self.pending.len() + self.permanent.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn health(&self) -> HealthStatus {
        HealthStatus::classify(self.iter())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn code(text: &str, status: DtcStatus) -> TroubleCode {
        text.parse::<TroubleCode>().unwrap().with_status(status)
    }

    #[test]
    fn test_same_code_twice_in_active() {
        let mut set = TroubleCodeSet::new();
        assert!(set.insert(code("P0420", DtcStatus::Active)));
        assert!(!set.insert(code("P0420", DtcStatus::Active)));
        assert_eq!(set.active.len(), 1);
    }

    #[test]
    fn test_active_wins_over_later_passes() {
        let mut set = TroubleCodeSet::new();
        set.extend(vec![code("P0420", DtcStatus::Active)]);
        let added = set.extend(vec![
            code("P0420", DtcStatus::Pending),
            code("P0171", DtcStatus::Pending),
        ]);
        assert_eq!(added, 1);
        set.extend(vec![code("P0420", DtcStatus::Permanent)]);

        assert_eq!(set.active.len(), 1);
        assert_eq!(set.pending.len(), 1);
        assert_eq!(set.pending[0].code(), "P0171");
        assert!(set.permanent.is_empty());
        assert_eq!(set.len(), 2);
    }

    #[test]
    fn test_code_moves_to_higher_priority_pass() {
        let mut set = TroubleCodeSet::new();
        set.insert(code("P0300", DtcStatus::Permanent));
        assert!(set.insert(code("P0300", DtcStatus::Active)));
        assert!(set.permanent.is_empty());
        assert_eq!(set.active[0].status(), DtcStatus::Active);
    }

    #[test]
    fn test_health_classification() {
        let mut set = TroubleCodeSet::new();
        assert_eq!(set.health(), HealthStatus::Good);

        set.insert(code("P0171", DtcStatus::Pending));
        assert_eq!(set.health(), HealthStatus::Warning);

        set.insert(code("P0420", DtcStatus::Active));
        assert_eq!(set.health(), HealthStatus::Warning);

        set.insert(code("P0302", DtcStatus::Permanent));
        assert_eq!(set.health(), HealthStatus::Critical);
    }
}
