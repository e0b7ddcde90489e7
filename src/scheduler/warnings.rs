//! Pre-restart warnings broadcast to players.

use std::collections::HashSet;

use serde::Serialize;

/// Warning thresholds, largest first.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
pub enum WarningKey {
    #[serde(rename = "1h")]
    OneHour,
    #[serde(rename = "30m")]
    ThirtyMinutes,
    #[serde(rename = "15m")]
    FifteenMinutes,
    #[serde(rename = "1m")]
    OneMinute,
}

pub const WARNING_KEYS: [WarningKey; 4] = [
    WarningKey::OneHour,
    WarningKey::ThirtyMinutes,
    WarningKey::FifteenMinutes,
    WarningKey::OneMinute,
];

impl WarningKey {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::OneHour => "1h",
            Self::ThirtyMinutes => "30m",
            Self::FifteenMinutes => "15m",
            Self::OneMinute => "1m",
        }
    }

    pub fn threshold_secs(&self) -> f64 {
        match self {
            Self::OneHour => 3600.0,
            Self::ThirtyMinutes => 1800.0,
            Self::FifteenMinutes => 900.0,
            Self::OneMinute => 60.0,
        }
    }

    pub fn message(&self) -> &'static str {
        match self {
            Self::OneHour => "Server will restart in 1 hour!",
            Self::ThirtyMinutes => "Server will restart in 30 minutes!",
            Self::FifteenMinutes => "Server will restart in 15 minutes!",
            Self::OneMinute => "Server will restart in 1 minute!",
        }
    }

    /// Console command that broadcasts the warning in-game.
    pub fn command(&self) -> String {
        format!("say {}", self.message())
    }
}

/// Warnings already sent during the current restart cycle.
#[derive(Debug, Default, Clone)]
pub struct WarningLedger {
    sent: HashSet<WarningKey>,
}

impl WarningLedger {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn contains(&self, key: WarningKey) -> bool {
        self.sent.contains(&key)
    }

    pub fn mark(&mut self, key: WarningKey) {
        self.sent.insert(key);
    }

    pub fn clear(&mut self) {
        self.sent.clear();
    }

    pub fn is_empty(&self) -> bool {
        self.sent.is_empty()
    }

    pub fn sent_keys(&self) -> Vec<WarningKey> {
        WARNING_KEYS.iter().copied().filter(|k| self.sent.contains(k)).collect()
    }
}

/// The warning to send now, if any.
///
/// A threshold fires while `threshold <= remaining <= threshold + grace`,
/// so a poll landing anywhere in that window catches it exactly once.
pub fn warning_due(remaining: Option<f64>, ledger: &WarningLedger, grace_secs: f64) -> Option<WarningKey> {
    let remaining = remaining?;
    if remaining <= 0.0 {
        return None;
    }
    WARNING_KEYS.iter().copied().find(|key| {
        let threshold = key.threshold_secs();
        !ledger.contains(*key) && remaining >= threshold && remaining <= threshold + grace_secs
    })
}
