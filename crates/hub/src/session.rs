//! A monitoring session: one [`PhController`] driven by real time.
//!
//! The session owns the two periodic tasks (staleness watch, simulator),
//! forwards controller outcomes to the shared status, the event stream, the
//! pump board and the store. Local state is always updated first; store
//! writes and pump doses run as detached tasks whose failures are logged and
//! never rolled back.
//!
//! Status and event updates are applied while the session lock is held, so
//! observers see them in the order the controller decided them. Lock order is
//! session, then status.

use serde::Serialize;
use std::future::Future;
use std::sync::{Arc, Weak};
use time::OffsetDateTime;
use tokio::sync::{broadcast, Mutex, RwLock};

use crate::config::ControllerSettings;
use crate::controller::{
    ControllerState, IngestOutcome, Mode, ModeChange, PhController, PumpEvent, PumpType, Reading,
    Reagents, Source,
};
use crate::crops::{self, Crop, OptimalRange};
use crate::db::Db;
use crate::history::{self, PhStats, TimeRange};
use crate::pump::PumpBoard;
use crate::scheduler::ScheduledTask;
use crate::simulator::PhSimulator;
use crate::state::{PumpStatus, SharedState};
use crate::transport::PumpReport;

const RESTORE_READINGS: i64 = 500;
const RESTORE_PUMP_LOGS: i64 = 100;
const EVENT_CAPACITY: usize = 64;

pub(crate) type SharedPumps = Arc<Mutex<PumpBoard>>;

// ---------------------------------------------------------------------------
// Clock
// ---------------------------------------------------------------------------

/// Source of "now" in milliseconds since the Unix epoch.
pub trait Clock: Send + Sync {
    fn now_ms(&self) -> i64;
}

pub struct SystemClock;

impl Clock for SystemClock {
    fn now_ms(&self) -> i64 {
        (OffsetDateTime::now_utc().unix_timestamp_nanos() / 1_000_000) as i64
    }
}

// ---------------------------------------------------------------------------
// Errors & events
// ---------------------------------------------------------------------------

#[derive(Debug, thiserror::Error)]
pub enum ControlError {
    #[error("no monitoring session is active")]
    NoSession,
    #[error("unknown crop: {0}")]
    UnknownCrop(String),
    #[error(transparent)]
    Store(#[from] anyhow::Error),
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum SessionEvent {
    Reading(Reading),
    ModeChanged { mode: Mode },
    Pump(PumpEvent),
}

/// Readings in a time window with their statistics.
#[derive(Debug, Clone, Serialize)]
pub struct ReadingsView {
    pub range: TimeRange,
    pub readings: Vec<Reading>,
    pub stats: PhStats,
}

pub struct SessionOptions {
    pub user_id: String,
    pub settings: ControllerSettings,
    pub reagents: Reagents,
    pub catalog: Vec<Crop>,
    /// Overrides the crop saved in the user's profile.
    pub crop: Option<String>,
}

// ---------------------------------------------------------------------------
// Session
// ---------------------------------------------------------------------------

#[derive(Clone)]
pub struct Session {
    inner: Arc<Inner>,
}

struct Inner {
    user_id: String,
    settings: ControllerSettings,
    catalog: Vec<Crop>,
    core: Mutex<Core>,
    db: Option<Db>,
    pumps: SharedPumps,
    state: SharedState,
    events: broadcast::Sender<SessionEvent>,
    clock: Arc<dyn Clock>,
}

/// Everything serialised behind the session lock.
struct Core {
    controller: PhController,
    simulator: PhSimulator,
    sim_task: ScheduledTask,
    watch_task: ScheduledTask,
    /// Oldest first.
    pump_log: Vec<PumpEvent>,
}

impl Session {
    /// Start monitoring `opts.user_id`. History is restored from `db` when
    /// one is given; a failed restore is logged and the session starts empty.
    pub(crate) async fn start(
        opts: SessionOptions,
        db: Option<Db>,
        pumps: SharedPumps,
        state: SharedState,
        clock: Arc<dyn Clock>,
    ) -> Self {
        let now = clock.now_ms();
        let user_id = opts.user_id;

        let (readings, pump_log, profile) = match &db {
            Some(db) => restore(db, &user_id).await,
            None => (Vec::new(), Vec::new(), None),
        };

        let saved_crop = profile.and_then(|p| p.current_crop);
        let crop = opts
            .crop
            .or(saved_crop)
            .and_then(|value| crops::find(&opts.catalog, &value).cloned());
        let range = crop
            .as_ref()
            .map(Crop::optimal_range)
            .unwrap_or(OptimalRange::DEFAULT);

        let mut controller = PhController::new(opts.settings.timing, range, opts.reagents, now);
        controller.restore(&readings, pump_log.last().map(|e| e.timestamp));

        tracing::info!(
            user = %user_id,
            readings = readings.len(),
            pump_logs = pump_log.len(),
            range = %range,
            "session started"
        );

        {
            let mut st = state.write().await;
            st.user_id = Some(user_id.clone());
            st.mode = Mode::Live;
            st.current_value = controller.series().last().map(|r| r.value);
            st.pump_status = PumpStatus::Idle;
            st.record_range(crop.map(|c| c.value), range);
            st.record_system(format!("session started for {user_id}"));
        }

        let (events, _) = broadcast::channel(EVENT_CAPACITY);
        let session = Self {
            inner: Arc::new(Inner {
                user_id,
                settings: opts.settings,
                catalog: opts.catalog,
                core: Mutex::new(Core {
                    controller,
                    simulator: PhSimulator::new(),
                    sim_task: ScheduledTask::idle("simulator"),
                    watch_task: ScheduledTask::idle("staleness-watch"),
                    pump_log,
                }),
                db,
                pumps,
                state,
                events,
                clock,
            }),
        };

        let weak = Arc::downgrade(&session.inner);
        session.inner.core.lock().await.watch_task.restart(
            session.inner.settings.staleness_check,
            on_tick(weak, |s| async move {
                s.check_staleness().await;
                s.prune().await;
            }),
        );

        let user = session.inner.user_id.clone();
        session.persist("touch_last_visited", move |db| async move {
            db.touch_last_visited(&user, now).await
        });

        session
    }

    pub fn user_id(&self) -> &str {
        &self.inner.user_id
    }

    pub fn subscribe(&self) -> broadcast::Receiver<SessionEvent> {
        self.inner.events.subscribe()
    }

    pub async fn snapshot(&self) -> ControllerState {
        *self.inner.core.lock().await.controller.state()
    }

    #[cfg(test)]
    pub async fn optimal_range(&self) -> OptimalRange {
        self.inner.core.lock().await.controller.optimal_range()
    }

    // -- Ingestion ---------------------------------------------------------

    /// Feed a sensor sample. Returns the stored reading, or `None` when the
    /// value was dropped as malformed.
    pub async fn ingest_sensor(&self, value: f64) -> Option<Reading> {
        let now = self.inner.clock.now_ms();
        let reading = Reading {
            value,
            timestamp: now,
            source: Source::Sensor,
        };

        let mut core = self.inner.core.lock().await;
        let outcome = core.controller.ingest(reading, now);
        if outcome.mode_change == Some(ModeChange::ToLive) {
            core.sim_task.stop();
            tracing::info!(user = %self.inner.user_id, "sensor data resumed, simulator stopped");
        }
        if let Some(event) = &outcome.pump {
            core.pump_log.push(event.clone());
        }

        self.dispatch(&outcome).await;
        outcome.accepted
    }

    /// One simulator step. Does nothing unless the session is simulated.
    pub async fn sim_tick(&self) -> Option<Reading> {
        let now = self.inner.clock.now_ms();

        let mut core = self.inner.core.lock().await;
        if core.controller.mode() != Mode::Simulated {
            return None;
        }
        let current = core.controller.state().current_value;
        let value = core.simulator.next(current);
        let outcome = core.controller.ingest(
            Reading {
                value,
                timestamp: now,
                source: Source::Simulated,
            },
            now,
        );
        if let Some(event) = &outcome.pump {
            core.pump_log.push(event.clone());
        }

        self.dispatch(&outcome).await;
        outcome.accepted
    }

    /// Switch to simulated data if the sensor has gone quiet. The simulator
    /// task is (re)started and the switch published under the same lock that
    /// flips the mode.
    pub async fn check_staleness(&self) -> Option<ModeChange> {
        let now = self.inner.clock.now_ms();

        let mut core = self.inner.core.lock().await;
        let change = core.controller.check_staleness(now)?;
        let weak = Arc::downgrade(&self.inner);
        core.sim_task.restart(
            self.inner.settings.sim_interval,
            on_tick(weak, |s| async move {
                s.sim_tick().await;
            }),
        );

        tracing::warn!(
            user = %self.inner.user_id,
            threshold_ms = self.inner.settings.timing.stale_threshold_ms,
            "no sensor data, switching to simulated readings"
        );
        self.inner.state.write().await.record_mode(Mode::Simulated);
        let _ = self.inner.events.send(SessionEvent::ModeChanged {
            mode: Mode::Simulated,
        });
        drop(core);

        Some(change)
    }

    /// Apply a pump state reported by the controller hardware. Only the
    /// displayed pump status changes.
    pub(crate) async fn report_pump(&self, report: PumpReport) {
        let status = match report {
            PumpReport::On(pump) => PumpStatus::from(pump),
            PumpReport::Off => PumpStatus::Idle,
        };
        tracing::debug!(?status, "pump status reported by hardware");
        self.inner.state.write().await.record_pump_status(status);
    }

    // -- Crop selection ----------------------------------------------------

    /// Replace the optimal range with the selected crop's. Unknown values
    /// leave the range untouched.
    pub async fn select_crop(&self, value: &str) -> Result<Crop, ControlError> {
        let crop = crops::find(&self.inner.catalog, value)
            .cloned()
            .ok_or_else(|| ControlError::UnknownCrop(value.to_string()))?;
        let range = crop.optimal_range();

        {
            let mut core = self.inner.core.lock().await;
            core.controller.set_optimal_range(range);
            self.inner
                .state
                .write()
                .await
                .record_range(Some(crop.value.clone()), range);
        }
        tracing::info!(user = %self.inner.user_id, crop = %crop.value, range = %range, "crop selected");

        let user = self.inner.user_id.clone();
        let saved = crop.clone();
        self.persist("save_crop_selection", move |db| async move {
            db.save_crop_selection(&user, &saved).await
        });

        Ok(crop)
    }

    // -- History -----------------------------------------------------------

    pub async fn readings(&self, range: TimeRange) -> ReadingsView {
        let cutoff = range.cutoff(self.inner.clock.now_ms());
        let core = self.inner.core.lock().await;
        let readings = core.controller.readings_since(cutoff).to_vec();
        let pumps: Vec<PumpEvent> = core
            .pump_log
            .iter()
            .filter(|e| e.timestamp > cutoff)
            .cloned()
            .collect();

        ReadingsView {
            range,
            stats: history::summarize(&readings, &pumps),
            readings,
        }
    }

    /// In-memory pump events, newest first.
    pub async fn pump_log(&self, limit: usize) -> Vec<PumpEvent> {
        let core = self.inner.core.lock().await;
        core.pump_log.iter().rev().take(limit).cloned().collect()
    }

    /// Pump events from the store, newest first. Sessions without a store
    /// answer from memory.
    pub async fn stored_pump_logs(&self, limit: usize) -> Result<Vec<PumpEvent>, ControlError> {
        match &self.inner.db {
            Some(db) => Ok(db
                .recent_pump_logs(&self.inner.user_id, limit as i64)
                .await?),
            None => Ok(self.pump_log(limit).await),
        }
    }

    /// Drop in-memory history older than the retention horizon.
    pub async fn prune(&self) {
        let cutoff = self.inner.clock.now_ms() - self.inner.settings.retention_ms;
        let mut core = self.inner.core.lock().await;
        let readings = core.controller.prune_before(cutoff);
        let before = core.pump_log.len();
        core.pump_log.retain(|e| e.timestamp >= cutoff);
        let pumps = before - core.pump_log.len();
        if readings + pumps > 0 {
            tracing::debug!(readings, pumps, "pruned in-memory history");
        }
    }

    /// Cancel both timers. Safe to call more than once.
    pub async fn stop(&self) {
        {
            let mut core = self.inner.core.lock().await;
            core.sim_task.stop();
            core.watch_task.stop();
        }
        tracing::info!(user = %self.inner.user_id, "session stopped");
        self.inner
            .state
            .write()
            .await
            .record_system(format!("session stopped for {}", self.inner.user_id));
    }

    // -- Side effects ------------------------------------------------------

    /// Publish an ingest outcome. Callers hold the session lock.
    async fn dispatch(&self, outcome: &IngestOutcome) {
        let inner = &self.inner;

        if let Some(reading) = outcome.accepted {
            {
                let mut st = inner.state.write().await;
                st.record_reading(&reading);
                if outcome.mode_change == Some(ModeChange::ToLive) {
                    st.record_mode(Mode::Live);
                }
            }
            let _ = inner.events.send(SessionEvent::Reading(reading));
            if outcome.mode_change == Some(ModeChange::ToLive) {
                let _ = inner.events.send(SessionEvent::ModeChanged { mode: Mode::Live });
            }

            let user = inner.user_id.clone();
            self.persist("add_reading", move |db| async move {
                db.add_reading(&user, &reading).await.map(|_| ())
            });
        }

        if let Some(event) = &outcome.pump {
            tracing::info!(
                user = %inner.user_id,
                pump = %event.pump_type,
                ph = event.ph_before,
                reagent = %event.reagent,
                "pump triggered"
            );
            inner.state.write().await.record_pump(event);
            let _ = inner.events.send(SessionEvent::Pump(event.clone()));

            // Only sensor readings actuate relays.
            if outcome.accepted.is_some_and(|r| r.source == Source::Sensor) {
                self.dose(event.pump_type);
            } else {
                tracing::info!(pump = %event.pump_type, "dose skipped, triggered by simulated data");
            }

            let user = inner.user_id.clone();
            let logged = event.clone();
            self.persist("log_activity", move |db| async move {
                db.log_activity(&user, &logged).await.map(|_| ())
            });
        }
    }

    /// Hold the pump's relay on for the dose duration in a detached task.
    fn dose(&self, pump: PumpType) {
        let pumps = Arc::clone(&self.inner.pumps);
        let state = Arc::clone(&self.inner.state);
        let duration = self.inner.settings.dose;

        tokio::spawn(async move {
            pumps.lock().await.set(pump, true);
            state.write().await.record_pump_status(pump.into());

            tokio::time::sleep(duration).await;

            pumps.lock().await.set(pump, false);
            state.write().await.record_pump_status(PumpStatus::Idle);
        });
    }

    /// Fire-and-forget store write. Failures are logged and recorded in the
    /// status event ring.
    fn persist<F, Fut>(&self, op: &'static str, write: F)
    where
        F: FnOnce(Db) -> Fut + Send + 'static,
        Fut: Future<Output = anyhow::Result<()>> + Send + 'static,
    {
        let Some(db) = self.inner.db.clone() else {
            return;
        };
        let state = Arc::clone(&self.inner.state);

        tokio::spawn(async move {
            if let Err(e) = write(db).await {
                tracing::error!(op, error = %format!("{e:#}"), "store write failed");
                state
                    .write()
                    .await
                    .record_error(format!("{op} failed: {e:#}"));
            }
        });
    }
}

/// Adapt a session callback into a timer tick that holds only a weak
/// reference, so a dropped session ends its own timers.
fn on_tick<F, Fut>(
    weak: Weak<Inner>,
    f: F,
) -> impl FnMut() -> std::pin::Pin<Box<dyn Future<Output = ()> + Send>> + Send + 'static
where
    F: Fn(Session) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = ()> + Send + 'static,
{
    let f = Arc::new(f);
    move || {
        let weak = weak.clone();
        let f = Arc::clone(&f);
        Box::pin(async move {
            if let Some(inner) = weak.upgrade() {
                f(Session { inner }).await;
            }
        })
    }
}

async fn restore(
    db: &Db,
    user_id: &str,
) -> (Vec<Reading>, Vec<PumpEvent>, Option<crate::db::Profile>) {
    let readings = db
        .recent_readings(user_id, RESTORE_READINGS)
        .await
        .unwrap_or_else(|e| {
            tracing::error!(user = %user_id, error = %format!("{e:#}"), "failed to restore readings");
            Vec::new()
        });

    let mut pump_log = db
        .recent_pump_logs(user_id, RESTORE_PUMP_LOGS)
        .await
        .unwrap_or_else(|e| {
            tracing::error!(user = %user_id, error = %format!("{e:#}"), "failed to restore pump log");
            Vec::new()
        });
    pump_log.reverse();

    let profile = db.get_profile(user_id).await.unwrap_or_else(|e| {
        tracing::error!(user = %user_id, error = %format!("{e:#}"), "failed to load profile");
        None
    });

    (readings, pump_log, profile)
}

// ---------------------------------------------------------------------------
// Session slot
// ---------------------------------------------------------------------------

/// Holds the active session, if any. Operations without one fail with
/// [`ControlError::NoSession`].
#[derive(Clone, Default)]
pub struct Monitor {
    slot: Arc<RwLock<Option<Session>>>,
}

impl Monitor {
    pub fn new() -> Self {
        Self::default()
    }

    /// Install `session`, stopping any session it replaces.
    pub async fn begin(&self, session: Session) {
        let previous = self.slot.write().await.replace(session);
        if let Some(previous) = previous {
            previous.stop().await;
        }
    }

    /// Stop and remove the active session. Returns whether there was one.
    pub async fn end(&self) -> bool {
        let previous = self.slot.write().await.take();
        match previous {
            Some(session) => {
                session.stop().await;
                true
            }
            None => false,
        }
    }

    pub async fn current(&self) -> Result<Session, ControlError> {
        self.slot.read().await.clone().ok_or(ControlError::NoSession)
    }

    pub async fn ingest_sensor(&self, value: f64) -> Result<Option<Reading>, ControlError> {
        Ok(self.current().await?.ingest_sensor(value).await)
    }

    pub(crate) async fn report_pump(&self, report: PumpReport) -> Result<(), ControlError> {
        self.current().await?.report_pump(report).await;
        Ok(())
    }

    pub async fn select_crop(&self, value: &str) -> Result<Crop, ControlError> {
        self.current().await?.select_crop(value).await
    }
}

// ===========================================================================
// Tests
// ===========================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ControllerEntry;
    use crate::pump::PumpPins;
    use crate::state::{EventKind, SystemState};
    use std::time::Duration;
    use tokio::time::{sleep, Instant};

    const EPOCH_MS: i64 = 1_700_000_000_000;

    /// Wall clock that follows tokio's (pausable) clock.
    struct TokioClock {
        base: Instant,
    }

    impl Clock for TokioClock {
        fn now_ms(&self) -> i64 {
            EPOCH_MS + self.base.elapsed().as_millis() as i64
        }
    }

    fn options(crop: Option<&str>) -> SessionOptions {
        SessionOptions {
            user_id: "farm-1".into(),
            settings: ControllerEntry::default().settings(),
            reagents: Reagents::default(),
            catalog: crops::default_catalog(),
            crop: crop.map(str::to_string),
        }
    }

    fn pumps() -> SharedPumps {
        Arc::new(Mutex::new(
            PumpBoard::new(PumpPins { basic: 23, acidic: 24 }, true).unwrap(),
        ))
    }

    async fn start_in_memory(crop: Option<&str>) -> (Session, SharedState) {
        let state = SystemState::shared();
        let clock = Arc::new(TokioClock {
            base: Instant::now(),
        });
        let session = Session::start(options(crop), None, pumps(), Arc::clone(&state), clock).await;
        (session, state)
    }

    fn drain(rx: &mut broadcast::Receiver<SessionEvent>) -> Vec<SessionEvent> {
        let mut out = Vec::new();
        while let Ok(ev) = rx.try_recv() {
            out.push(ev);
        }
        out
    }

    // -- Mode switching ---------------------------------------------------

    #[tokio::test(start_paused = true)]
    async fn regular_sensor_readings_stay_live() {
        let (session, _) = start_in_memory(None).await;
        for _ in 0..10 {
            sleep(Duration::from_secs(9)).await;
            session.ingest_sensor(7.0).await;
        }
        assert_eq!(session.snapshot().await.mode, Mode::Live);
    }

    #[tokio::test(start_paused = true)]
    async fn silence_switches_to_simulated_once_and_simulates() {
        let (session, state) = start_in_memory(None).await;
        let mut rx = session.subscribe();

        sleep(Duration::from_millis(10_500)).await;
        assert_eq!(session.snapshot().await.mode, Mode::Live);

        sleep(Duration::from_millis(1_000)).await;
        assert_eq!(session.snapshot().await.mode, Mode::Simulated);
        assert_eq!(state.read().await.mode, Mode::Simulated);

        // One simulator interval later a simulated reading exists.
        sleep(Duration::from_millis(2_000)).await;
        let view = session.readings(TimeRange::Day).await;
        assert!(!view.readings.is_empty());
        assert!(view.readings.iter().all(|r| r.source == Source::Simulated));
        assert!(view
            .readings
            .iter()
            .all(|r| (6.2..=7.8).contains(&r.value)));

        sleep(Duration::from_secs(10)).await;
        let mode_events = drain(&mut rx)
            .into_iter()
            .filter(|e| matches!(e, SessionEvent::ModeChanged { .. }))
            .count();
        assert_eq!(mode_events, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn sensor_reading_returns_to_live_and_stops_simulator() {
        let (session, _) = start_in_memory(None).await;
        sleep(Duration::from_secs(16)).await;
        assert_eq!(session.snapshot().await.mode, Mode::Simulated);

        let mut rx = session.subscribe();
        session.ingest_sensor(7.1).await.unwrap();
        assert_eq!(session.snapshot().await.mode, Mode::Live);

        let events = drain(&mut rx);
        assert!(events.contains(&SessionEvent::ModeChanged { mode: Mode::Live }));

        // Within the staleness window no simulated reading may follow.
        sleep(Duration::from_secs(8)).await;
        let view = session.readings(TimeRange::Day).await;
        let last = view.readings.last().unwrap();
        assert_eq!(last.source, Source::Sensor);
        assert_eq!(last.value, 7.1);
    }

    #[tokio::test(start_paused = true)]
    async fn sim_tick_is_ignored_while_live() {
        let (session, _) = start_in_memory(None).await;
        assert!(session.sim_tick().await.is_none());
        assert!(session.readings(TimeRange::Day).await.readings.is_empty());
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn concurrent_updates_publish_in_controller_order() {
        let state = SystemState::shared();
        let mut opts = options(None);
        opts.settings = ControllerEntry {
            stale_threshold_ms: 0,
            sim_interval_ms: 1,
            staleness_check_ms: 3_600_000,
            ..ControllerEntry::default()
        }
        .settings();
        let session = Session::start(opts, None, pumps(), Arc::clone(&state), Arc::new(SystemClock)).await;
        let mut rx = session.subscribe();

        let feeder = {
            let s = session.clone();
            tokio::spawn(async move {
                for i in 0..300 {
                    s.ingest_sensor(6.6 + f64::from(i % 10) * 0.1).await;
                    tokio::task::yield_now().await;
                }
            })
        };
        let watcher = {
            let s = session.clone();
            tokio::spawn(async move {
                for _ in 0..300 {
                    s.check_staleness().await;
                    tokio::task::yield_now().await;
                }
            })
        };
        feeder.await.unwrap();
        watcher.await.unwrap();
        session.stop().await;

        let snap = session.snapshot().await;
        {
            let st = state.read().await;
            assert_eq!(st.mode, snap.mode);
            assert_eq!(st.current_value, Some(snap.current_value));
        }

        // Mode switches alternate; a reordered publish shows up as a repeat.
        let mut last_mode = None;
        loop {
            match rx.try_recv() {
                Ok(SessionEvent::ModeChanged { mode }) => {
                    assert_ne!(Some(mode), last_mode, "mode switch published twice in a row");
                    last_mode = Some(mode);
                }
                Ok(_) => {}
                Err(broadcast::error::TryRecvError::Lagged(_)) => last_mode = None,
                Err(_) => break,
            }
        }
    }

    // -- Decisions & dosing -----------------------------------------------

    #[tokio::test(start_paused = true)]
    async fn out_of_range_reading_doses_once_per_cooldown() {
        let (session, state) = start_in_memory(None).await;
        let mut rx = session.subscribe();

        session.ingest_sensor(6.0).await;
        sleep(Duration::from_secs(1)).await;
        session.ingest_sensor(5.9).await;

        let log = session.pump_log(10).await;
        assert_eq!(log.len(), 1);
        assert_eq!(log[0].pump_type, PumpType::Basic);
        assert_eq!(log[0].ph_before, 6.0);

        let pumps: Vec<_> = drain(&mut rx)
            .into_iter()
            .filter(|e| matches!(e, SessionEvent::Pump(_)))
            .collect();
        assert_eq!(pumps.len(), 1);
        assert_eq!(state.read().await.pump_status, PumpStatus::Basic);

        // Relay released after the dose.
        sleep(Duration::from_secs(2)).await;
        assert_eq!(state.read().await.pump_status, PumpStatus::Idle);

        // After the cooldown a new out-of-range value doses again.
        sleep(Duration::from_secs(8)).await;
        session.ingest_sensor(8.2).await;
        let log = session.pump_log(10).await;
        assert_eq!(log.len(), 2);
        assert_eq!(log[0].pump_type, PumpType::Acidic);
    }

    #[tokio::test(start_paused = true)]
    async fn simulated_pump_events_never_drive_relays() {
        let state = SystemState::shared();
        let board = pumps();
        let clock = Arc::new(TokioClock {
            base: Instant::now(),
        });
        let session = Session::start(
            options(Some("potato")),
            None,
            Arc::clone(&board),
            Arc::clone(&state),
            clock,
        )
        .await;
        board.lock().await.all_off();

        sleep(Duration::from_secs(12)).await;
        assert_eq!(session.snapshot().await.mode, Mode::Simulated);

        for _ in 0..60 {
            sleep(Duration::from_millis(250)).await;
            let relays = board.lock().await;
            assert!(!relays.is_on(PumpType::Acidic));
            assert!(!relays.is_on(PumpType::Basic));
            drop(relays);
            assert_eq!(state.read().await.pump_status, PumpStatus::Idle);
        }

        // Every simulated value sits above potato's band, so events are still
        // logged; they just never reach the relays.
        let log = session.pump_log(10).await;
        assert!(!log.is_empty());
        assert!(log.iter().all(|e| e.pump_type == PumpType::Acidic));
    }

    #[tokio::test(start_paused = true)]
    async fn ingest_round_trips_current_value() {
        let (session, state) = start_in_memory(None).await;
        session.ingest_sensor(6.87).await;
        assert_eq!(session.snapshot().await.current_value, 6.87);
        assert_eq!(state.read().await.current_value, Some(6.87));
    }

    #[tokio::test(start_paused = true)]
    async fn nan_reading_is_dropped() {
        let (session, _) = start_in_memory(None).await;
        assert!(session.ingest_sensor(f64::NAN).await.is_none());
        assert!(session.readings(TimeRange::Day).await.readings.is_empty());
    }

    // -- Crop selection ---------------------------------------------------

    #[tokio::test(start_paused = true)]
    async fn select_crop_replaces_range() {
        let (session, state) = start_in_memory(None).await;
        assert_eq!(session.optimal_range().await, OptimalRange::DEFAULT);

        let crop = session.select_crop("potato").await.unwrap();
        assert_eq!(session.optimal_range().await, crop.optimal_range());
        assert_eq!(state.read().await.crop.as_deref(), Some("potato"));

        // 6.0 is fine for potato (5.0 - 6.0), so nothing is dosed.
        session.ingest_sensor(6.0).await;
        assert!(session.pump_log(10).await.is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn unknown_crop_leaves_range_unchanged() {
        let (session, _) = start_in_memory(Some("wheat")).await;
        let before = session.optimal_range().await;
        let err = session.select_crop("kiwi").await.unwrap_err();
        assert!(matches!(err, ControlError::UnknownCrop(ref v) if v == "kiwi"));
        assert_eq!(session.optimal_range().await, before);
    }

    // -- Lifecycle --------------------------------------------------------

    #[tokio::test(start_paused = true)]
    async fn stop_cancels_timers() {
        let (session, _) = start_in_memory(None).await;
        session.stop().await;
        session.stop().await;
        sleep(Duration::from_secs(30)).await;
        assert_eq!(session.snapshot().await.mode, Mode::Live);
    }

    #[tokio::test(start_paused = true)]
    async fn monitor_without_session_fails() {
        let monitor = Monitor::new();
        assert!(matches!(
            monitor.ingest_sensor(7.0).await,
            Err(ControlError::NoSession)
        ));
        assert!(matches!(
            monitor.select_crop("rice").await,
            Err(ControlError::NoSession)
        ));
        assert!(!monitor.end().await);

        let (session, _) = start_in_memory(None).await;
        monitor.begin(session).await;
        assert!(monitor.ingest_sensor(7.0).await.unwrap().is_some());
        assert!(monitor.end().await);
        assert!(matches!(
            monitor.current().await,
            Err(ControlError::NoSession)
        ));
    }

    #[tokio::test(start_paused = true)]
    async fn hardware_pump_report_updates_status_only() {
        let (session, state) = start_in_memory(None).await;
        session.report_pump(PumpReport::On(PumpType::Acidic)).await;
        assert_eq!(state.read().await.pump_status, PumpStatus::Acidic);
        assert!(session.pump_log(10).await.is_empty());
        session.report_pump(PumpReport::Off).await;
        assert_eq!(state.read().await.pump_status, PumpStatus::Idle);
    }

    // -- Store integration ------------------------------------------------

    #[tokio::test]
    async fn restores_history_and_cooldown_from_store() {
        let db = Db::connect("sqlite::memory:").await.unwrap();
        db.migrate().await.unwrap();

        let now = SystemClock.now_ms();
        for (i, v) in [6.9, 7.0, 7.2].into_iter().enumerate() {
            db.add_reading(
                "farm-1",
                &Reading {
                    value: v,
                    timestamp: now - 60_000 + i as i64 * 1_000,
                    source: Source::Sensor,
                },
            )
            .await
            .unwrap();
        }
        db.log_activity(
            "farm-1",
            &PumpEvent {
                pump_type: PumpType::Acidic,
                reagent: "r".into(),
                concentration: "1%".into(),
                ph_before: 7.9,
                timestamp: now - 2_000,
            },
        )
        .await
        .unwrap();
        db.save_crop_selection("farm-1", crops::find(&crops::default_catalog(), "maize").unwrap())
            .await
            .unwrap();

        let state = SystemState::shared();
        let session = Session::start(
            options(None),
            Some(db.clone()),
            pumps(),
            Arc::clone(&state),
            Arc::new(SystemClock),
        )
        .await;

        let snap = session.snapshot().await;
        assert_eq!(snap.current_value, 7.2);
        assert_eq!(snap.last_real_sample_at, None);
        assert_eq!(snap.last_pump_at, Some(now - 2_000));
        assert_eq!(session.readings(TimeRange::Day).await.readings.len(), 3);
        assert_eq!(state.read().await.crop.as_deref(), Some("maize"));

        // Still inside the restored cooldown: no new pump event.
        session.ingest_sensor(9.0).await;
        assert_eq!(session.pump_log(10).await.len(), 1);

        let stored = session.stored_pump_logs(10).await.unwrap();
        assert_eq!(stored.len(), 1);
        session.stop().await;
    }

    #[tokio::test]
    async fn failed_store_write_keeps_local_state() {
        let db = Db::connect("sqlite::memory:").await.unwrap();
        db.migrate().await.unwrap();
        sqlx::query("DROP TABLE ph_readings")
            .execute(db.pool())
            .await
            .unwrap();

        let state = SystemState::shared();
        let session = Session::start(
            options(None),
            Some(db),
            pumps(),
            Arc::clone(&state),
            Arc::new(SystemClock),
        )
        .await;

        let reading = session.ingest_sensor(6.9).await.unwrap();
        assert_eq!(reading.value, 6.9);
        assert_eq!(session.snapshot().await.current_value, 6.9);
        assert_eq!(state.read().await.current_value, Some(6.9));

        let mut recorded = false;
        for _ in 0..200 {
            let failed = state.read().await.events.iter().any(|e| {
                e.kind == EventKind::Error && e.detail.starts_with("add_reading failed")
            });
            if failed {
                recorded = true;
                break;
            }
            sleep(Duration::from_millis(10)).await;
        }
        assert!(recorded, "store failure was not recorded");

        // Nothing rolled back.
        let view = session.readings(TimeRange::Day).await;
        assert_eq!(view.readings.len(), 1);
        assert_eq!(view.readings[0].value, 6.9);
        assert_eq!(session.snapshot().await.last_real_sample_at, Some(reading.timestamp));
        session.stop().await;
    }
}
