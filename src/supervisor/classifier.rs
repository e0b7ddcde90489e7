//! Output classifiers — turn raw console lines into typed events.
//!
//! Each supervised process owns one classifier. Rules are evaluated in a
//! fixed order per line; a line may yield zero or more events.
//!
//! Server (Minecraft-style output):
//!   1. readiness: `Done (` together with `For help, type` → `Ready`
//!   2. `joined the game` → player count +1
//!   3. `left the game` → player count -1 (floored at 0)
//!
//! Tunnel (playit agent output):
//!   1. claim URL → `ClaimUrlDetected` (first occurrence only)
//!   2. `*.ply.gg` address → `AddressAssigned` (every occurrence)
//!   3. an `ERROR` level token or `error:` prefix → `Error`

use regex::Regex;

use crate::events::{Event, ProcessRole, ServerEvent, TunnelEvent};

/// Process-specific rule set plugged into a `SupervisedProcess`.
pub trait OutputClassifier: Send + 'static {
    fn role(&self) -> ProcessRole;

    /// Event announced right after a successful launch.
    fn on_start(&mut self) -> Event;

    /// Terminal event, emitted exactly once after the process is gone.
    fn on_exit(&mut self) -> Event;

    /// Inspect one clean line of output.
    fn classify(&mut self, line: &str) -> Vec<Event>;
}

// ─── Server ──────────────────────────────────────────────────

const READY_MARKER: &str = "Done (";
const HELP_MARKER: &str = "For help, type";
const JOINED_MARKER: &str = "joined the game";
const LEFT_MARKER: &str = "left the game";

#[derive(Debug, Default)]
pub struct ServerClassifier {
    players: u32,
}

impl ServerClassifier {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn player_count(&self) -> u32 {
        self.players
    }
}

impl OutputClassifier for ServerClassifier {
    fn role(&self) -> ProcessRole {
        ProcessRole::Server
    }

    fn on_start(&mut self) -> Event {
        self.players = 0;
        Event::Server(ServerEvent::Starting)
    }

    fn on_exit(&mut self) -> Event {
        Event::Server(ServerEvent::Stopped)
    }

    fn classify(&mut self, line: &str) -> Vec<Event> {
        let mut events = Vec::new();

        if line.contains(READY_MARKER) && line.contains(HELP_MARKER) {
            events.push(Event::Server(ServerEvent::Ready));
        }

        if line.contains(JOINED_MARKER) {
            self.players += 1;
            events.push(Event::Server(ServerEvent::PlayerCountChanged(self.players)));
        } else if line.contains(LEFT_MARKER) {
            self.players = self.players.saturating_sub(1);
            events.push(Event::Server(ServerEvent::PlayerCountChanged(self.players)));
        }

        events
    }
}

// ─── Tunnel ──────────────────────────────────────────────────

pub const CLAIM_URL_PATTERN: &str = r"https://playit\.gg/claim/[a-zA-Z0-9]+";
pub const ADDRESS_PATTERN: &str = r"[a-z0-9-]+\.ply\.gg";
/// Log level token, not prose like "0 errors"
pub const ERROR_PATTERN: &str = r"\bERROR\b|(?i:\berror:)";

#[derive(Debug)]
pub struct TunnelClassifier {
    claim_re: Regex,
    address_re: Regex,
    error_re: Regex,
    claim_seen: bool,
}

impl TunnelClassifier {
    pub fn new() -> Self {
        Self {
            claim_re: Regex::new(CLAIM_URL_PATTERN).expect("static claim pattern"),
            address_re: Regex::new(ADDRESS_PATTERN).expect("static address pattern"),
            error_re: Regex::new(ERROR_PATTERN).expect("static error pattern"),
            claim_seen: false,
        }
    }
}

impl Default for TunnelClassifier {
    fn default() -> Self {
        Self::new()
    }
}

impl OutputClassifier for TunnelClassifier {
    fn role(&self) -> ProcessRole {
        ProcessRole::Tunnel
    }

    fn on_start(&mut self) -> Event {
        self.claim_seen = false;
        Event::Tunnel(TunnelEvent::Starting)
    }

    fn on_exit(&mut self) -> Event {
        Event::Tunnel(TunnelEvent::Offline)
    }

    fn classify(&mut self, line: &str) -> Vec<Event> {
        let mut events = Vec::new();

        if let Some(m) = self.claim_re.find(line) {
            if !self.claim_seen {
                self.claim_seen = true;
                events.push(Event::Tunnel(TunnelEvent::ClaimUrlDetected(m.as_str().to_string())));
            }
        }

        // The claim URL itself never matches: `playit.gg` is not `ply.gg`
        if let Some(m) = self.address_re.find(line) {
            events.push(Event::Tunnel(TunnelEvent::AddressAssigned(m.as_str().to_string())));
        }

        if self.error_re.is_match(line) {
            events.push(Event::Tunnel(TunnelEvent::Error(line.to_string())));
        }

        events
    }
}
