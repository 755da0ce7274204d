use serde::Serialize;
use std::collections::VecDeque;
use std::sync::Arc;
use std::time::Instant;
use time::OffsetDateTime;
use tokio::sync::RwLock;

use crate::controller::{ControllerState, Mode, PumpEvent, PumpType, Reading};
use crate::crops::{OptimalRange, PhStatus};

/// Maximum number of events retained in the ring buffer.
const MAX_EVENTS: usize = 200;

// ---------------------------------------------------------------------------
// Public type alias
// ---------------------------------------------------------------------------

pub type SharedState = Arc<RwLock<SystemState>>;

// ---------------------------------------------------------------------------
// Core types
// ---------------------------------------------------------------------------

pub struct SystemState {
    pub started_at: Instant,
    /// Serial or MQTT sensor link is up (false = demo mode).
    pub link_connected: bool,
    pub user_id: Option<String>,
    pub mode: Mode,
    pub current_value: Option<f64>,
    pub optimal_range: OptimalRange,
    pub crop: Option<String>,
    pub pump_status: PumpStatus,
    pub last_update: Option<OffsetDateTime>,
    pub events: VecDeque<SystemEvent>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum PumpStatus {
    Idle,
    Basic,
    Acidic,
}

#[derive(Debug, Clone, Serialize)]
pub struct SystemEvent {
    #[serde(with = "time::serde::rfc3339")]
    pub ts: OffsetDateTime,
    pub kind: EventKind,
    pub detail: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum EventKind {
    Reading,
    Pump,
    Mode,
    Error,
    System,
}

// ---------------------------------------------------------------------------
// JSON response (what the API returns)
// ---------------------------------------------------------------------------

#[derive(Serialize)]
pub struct StatusResponse {
    pub uptime_secs: u64,
    pub link_connected: bool,
    pub user_id: Option<String>,
    pub mode: Mode,
    pub current_value: Option<f64>,
    pub ph_status: Option<PhStatus>,
    pub optimal_range: OptimalRange,
    pub crop: Option<String>,
    pub pump_status: PumpStatus,
    #[serde(with = "time::serde::rfc3339::option")]
    pub last_update: Option<OffsetDateTime>,
    /// Live controller state of the active session, filled in by the API.
    pub controller: Option<ControllerState>,
    pub events: Vec<SystemEvent>,
}

impl From<PumpType> for PumpStatus {
    fn from(p: PumpType) -> Self {
        match p {
            PumpType::Basic => Self::Basic,
            PumpType::Acidic => Self::Acidic,
        }
    }
}

// ---------------------------------------------------------------------------
// Construction & mutation
// ---------------------------------------------------------------------------

impl SystemState {
    pub fn new() -> Self {
        Self {
            started_at: Instant::now(),
            link_connected: false,
            user_id: None,
            mode: Mode::Live,
            current_value: None,
            optimal_range: OptimalRange::DEFAULT,
            crop: None,
            pump_status: PumpStatus::Idle,
            last_update: None,
            events: VecDeque::with_capacity(MAX_EVENTS),
        }
    }

    pub fn shared() -> SharedState {
        Arc::new(RwLock::new(Self::new()))
    }

    /// Record a reading accepted by the controller.
    pub fn record_reading(&mut self, reading: &Reading) {
        self.current_value = Some(reading.value);
        self.last_update = Some(OffsetDateTime::now_utc());
        self.push_event(
            EventKind::Reading,
            format!("pH {:.2} ({})", reading.value, reading.source.as_str()),
        );
    }

    /// Record a pump event emitted by the decision engine.
    pub fn record_pump(&mut self, event: &PumpEvent) {
        self.push_event(
            EventKind::Pump,
            format!(
                "{} pump: {} {} at pH {:.2}",
                event.pump_type, event.reagent, event.concentration, event.ph_before
            ),
        );
    }

    /// Record a pump relay changing state (actuation or hardware report).
    pub fn record_pump_status(&mut self, status: PumpStatus) {
        self.pump_status = status;
    }

    /// Record a live/simulated mode switch.
    pub fn record_mode(&mut self, mode: Mode) {
        self.mode = mode;
        let detail = match mode {
            Mode::Simulated => "sensor silent, switched to simulated data",
            Mode::Live => "sensor data resumed, switched to live data",
        };
        self.push_event(EventKind::Mode, detail.to_string());
    }

    pub fn record_range(&mut self, crop: Option<String>, range: OptimalRange) {
        self.push_event(
            EventKind::System,
            format!(
                "optimal range set to {range} ({})",
                crop.as_deref().unwrap_or("default")
            ),
        );
        self.crop = crop;
        self.optimal_range = range;
    }

    pub fn record_link(&mut self, connected: bool, detail: String) {
        self.link_connected = connected;
        self.push_event(EventKind::System, detail);
    }

    /// Record an error event.
    pub fn record_error(&mut self, detail: String) {
        self.push_event(EventKind::Error, detail);
    }

    /// Record a generic system event.
    pub fn record_system(&mut self, detail: String) {
        self.push_event(EventKind::System, detail);
    }

    /// Build the JSON-serialisable status snapshot.
    pub fn to_status(&self) -> StatusResponse {
        StatusResponse {
            uptime_secs: self.started_at.elapsed().as_secs(),
            link_connected: self.link_connected,
            user_id: self.user_id.clone(),
            mode: self.mode,
            current_value: self.current_value,
            ph_status: self.current_value.map(|v| self.optimal_range.classify(v)),
            optimal_range: self.optimal_range,
            crop: self.crop.clone(),
            pump_status: self.pump_status,
            last_update: self.last_update,
            controller: None,
            events: self.events.iter().rev().cloned().collect(),
        }
    }

    fn push_event(&mut self, kind: EventKind, detail: String) {
        if self.events.len() >= MAX_EVENTS {
            self.events.pop_front();
        }
        self.events.push_back(SystemEvent {
            ts: OffsetDateTime::now_utc(),
            kind,
            detail,
        });
    }
}

impl Default for SystemState {
    fn default() -> Self {
        Self::new()
    }
}

// ===========================================================================
// Tests
// ===========================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::controller::Source;

    #[test]
    fn ring_buffer_is_bounded() {
        let mut st = SystemState::new();
        for i in 0..(MAX_EVENTS + 25) {
            st.record_system(format!("e{i}"));
        }
        assert_eq!(st.events.len(), MAX_EVENTS);
        assert_eq!(st.events.front().unwrap().detail, "e25");
    }

    #[test]
    fn status_lists_newest_event_first() {
        let mut st = SystemState::new();
        st.record_system("first".into());
        st.record_error("second".into());
        let status = st.to_status();
        assert_eq!(status.events[0].detail, "second");
        assert_eq!(status.events[0].kind, EventKind::Error);
    }

    #[test]
    fn reading_updates_value_and_classification() {
        let mut st = SystemState::new();
        st.record_reading(&Reading {
            value: 8.1,
            timestamp: 1,
            source: Source::Sensor,
        });
        let status = st.to_status();
        assert_eq!(status.current_value, Some(8.1));
        assert_eq!(status.ph_status, Some(PhStatus::TooBasic));
        assert!(status.last_update.is_some());
    }

    #[test]
    fn mode_and_range_are_tracked() {
        let mut st = SystemState::new();
        st.record_mode(Mode::Simulated);
        st.record_range(Some("potato".into()), OptimalRange { min: 5.0, max: 6.0 });
        let status = st.to_status();
        assert_eq!(status.mode, Mode::Simulated);
        assert_eq!(status.crop.as_deref(), Some("potato"));
        assert_eq!(status.optimal_range.max, 6.0);
        assert!(status.events.iter().any(|e| e.kind == EventKind::Mode));
    }

    #[test]
    fn status_serializes() {
        let mut st = SystemState::new();
        st.record_pump_status(PumpType::Acidic.into());
        let json = serde_json::to_value(st.to_status()).unwrap();
        assert_eq!(json["pump_status"], "acidic");
        assert_eq!(json["mode"], "live");
        assert!(json["last_update"].is_null());
    }
}
