mod state;


use bytes::Bytes;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, Weak};
use std::time::Duration;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::config::Config;
use crate::error::ClientError;
use crate::source::{EventLogQuery, HistoricalQuery, TelemetrySource};
use crate::stats::compute_series_stats;
use crate::telemetry::{ControlRequest, SnapshotPayload};
use crate::types::{ControlAction, ControlState, Mode, Window};

use state::{PollerState, Ticket};
pub use state::{AnalyticsState, DashboardView, Freshness};

/// Whether a response made it into state or was dropped as superseded.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Outcome {
    Applied,
    Discarded,
}

impl Outcome {
    fn either(self, other: Outcome) -> Outcome {
        if self == Outcome::Applied || other == Outcome::Applied {
            Outcome::Applied
        } else {
            Outcome::Discarded
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Cycle {
    Snapshot,
    Historical,
    Analytics,
}

impl Cycle {
    pub(crate) fn as_str(self) -> &'static str {
        match self {
            Cycle::Snapshot => "snapshot",
            Cycle::Historical => "historical",
            Cycle::Analytics => "analytics",
        }
    }
}

#[derive(Debug, Clone)]
pub struct PollerSettings {
    pub snapshot_interval: Duration,
    pub historical_interval: Duration,
    pub analytics_interval: Duration,
    pub sensor_ids: Vec<String>,
    pub initial_window: Window,
    pub event_page_size: u32,
}

impl PollerSettings {
    pub fn from_config(config: &Config) -> Self {
        Self {
            snapshot_interval: config.snapshot_interval(),
            historical_interval: config.historical_interval(),
            analytics_interval: config.analytics_interval(),
            sensor_ids: config.sensor_ids.clone(),
            initial_window: config.default_window,
            event_page_size: config.event_page_size,
        }
    }
}

impl Default for PollerSettings {
    fn default() -> Self {
        Self {
            snapshot_interval: Duration::from_secs(5),
            historical_interval: Duration::from_secs(60),
            analytics_interval: Duration::from_secs(60),
            sensor_ids: vec![
                crate::types::SENSOR_1.to_string(),
                crate::types::SENSOR_2.to_string(),
                crate::types::SENSOR_AVERAGE.to_string(),
            ],
            initial_window: Window::Day,
            event_page_size: 15,
        }
    }
}

struct PollTasks {
    cancel: CancellationToken,
    handles: Vec<JoinHandle<()>>,
}

impl PollTasks {
    fn shutdown(self) -> Vec<JoinHandle<()>> {
        self.cancel.cancel();
        for handle in &self.handles {
            handle.abort();
        }
        self.handles
    }
}

struct Inner<S> {
    source: S,
    settings: PollerSettings,
    state: Mutex<PollerState>,
    view_tx: watch::Sender<Arc<DashboardView>>,
    tasks: Mutex<Option<PollTasks>>,
}

/// Owns dashboard state and keeps it in sync with a [`TelemetrySource`].
///
/// Cheap to clone; every clone drives the same state. Readers take immutable
/// [`DashboardView`]s via [`TelemetryPoller::view`] or
/// [`TelemetryPoller::subscribe`]. Polling cycles hold only a weak reference,
/// so dropping the last handle also ends them.
pub struct TelemetryPoller<S> {
    inner: Arc<Inner<S>>,
}

impl<S> Clone for TelemetryPoller<S> {
    fn clone(&self) -> Self {
        Self {
            inner: self.inner.clone(),
        }
    }
}

impl<S: TelemetrySource> TelemetryPoller<S> {
    pub fn new(source: S, settings: PollerSettings) -> Self {
        let state = PollerState::new(settings.initial_window, settings.event_page_size);
        let (view_tx, _) = watch::channel(Arc::new(state.view()));
        Self {
            inner: Arc::new(Inner {
                source,
                settings,
                state: Mutex::new(state),
                view_tx,
                tasks: Mutex::new(None),
            }),
        }
    }

    pub fn source(&self) -> &S {
        &self.inner.source
    }

    pub fn settings(&self) -> &PollerSettings {
        &self.inner.settings
    }

    pub fn view(&self) -> Arc<DashboardView> {
        self.inner.view_tx.borrow().clone()
    }

    pub fn subscribe(&self) -> watch::Receiver<Arc<DashboardView>> {
        self.inner.view_tx.subscribe()
    }

    pub fn is_polling(&self) -> bool {
        lock(&self.inner.tasks).is_some()
    }

    /// Starts the snapshot, historical and analytics cycles. Each fires
    /// immediately and then on its own interval. Calling this while already
    /// polling replaces the running cycles rather than adding to them.
    pub fn start_polling(&self) {
        let mut tasks = lock(&self.inner.tasks);
        if let Some(previous) = tasks.take() {
            drop(previous.shutdown());
            debug!("restarting telemetry polling");
        }

        let settings = &self.inner.settings;
        let cancel = CancellationToken::new();
        let handles = [
            (Cycle::Snapshot, settings.snapshot_interval),
            (Cycle::Historical, settings.historical_interval),
            (Cycle::Analytics, settings.analytics_interval),
        ]
        .into_iter()
        .map(|(cycle, period)| self.spawn_cycle(cycle, period, cancel.clone()))
        .collect();
        *tasks = Some(PollTasks { cancel, handles });

        info!(
            snapshot_ms = settings.snapshot_interval.as_millis() as u64,
            historical_ms = settings.historical_interval.as_millis() as u64,
            analytics_ms = settings.analytics_interval.as_millis() as u64,
            "telemetry polling started"
        );
    }

    /// Cancels every cycle. Responses still in flight when this returns are
    /// discarded, including their error bookkeeping.
    ///
    /// A cycle caught mid-poll on another worker thread only observes the
    /// abort at its next await; use [`TelemetryPoller::stop_polling_and_wait`]
    /// when no request may leave after the call returns.
    pub fn stop_polling(&self) {
        drop(self.halt_cycles());
        self.lock_state().epoch += 1;
    }

    /// Like [`TelemetryPoller::stop_polling`], but also waits until every
    /// cycle task has exited.
    pub async fn stop_polling_and_wait(&self) {
        let handles = self.halt_cycles();
        for handle in handles {
            if let Err(err) = handle.await {
                if !err.is_cancelled() {
                    warn!(error = %err, "poll cycle ended abnormally");
                }
            }
        }
        self.lock_state().epoch += 1;
    }

    /// Cancels and aborts the running cycles. Must run before the epoch bump
    /// so no cycle can pick up a ticket for the new epoch.
    fn halt_cycles(&self) -> Vec<JoinHandle<()>> {
        let Some(tasks) = lock(&self.inner.tasks).take() else {
            return Vec::new();
        };
        info!("telemetry polling stopped");
        tasks.shutdown()
    }

    fn spawn_cycle(
        &self,
        cycle: Cycle,
        period: Duration,
        cancel: CancellationToken,
    ) -> JoinHandle<()> {
        let weak: Weak<Inner<S>> = Arc::downgrade(&self.inner);
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(period);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
            loop {
                tokio::select! {
                    biased;
                    _ = cancel.cancelled() => break,
                    _ = ticker.tick() => {}
                }
                let Some(inner) = weak.upgrade() else {
                    break;
                };
                let poller = TelemetryPoller { inner };
                tokio::select! {
                    biased;
                    _ = cancel.cancelled() => break,
                    _ = poller.run_cycle(cycle) => {}
                }
            }
            debug!(cycle = cycle.as_str(), "poll cycle exited");
        })
    }

    async fn run_cycle(&self, cycle: Cycle) {
        let result = match cycle {
            Cycle::Snapshot => self.fetch_snapshot().await,
            Cycle::Historical => {
                let window = self.lock_state().window;
                self.fetch_historical(window).await
            }
            Cycle::Analytics => self.fetch_analytics().await,
        };
        if let Err(err) = result {
            warn!(
                cycle = cycle.as_str(),
                kind = err.kind(),
                error = %err,
                "poll cycle failed; keeping last known state"
            );
        }
    }

    pub async fn fetch_snapshot(&self) -> Result<Outcome, ClientError> {
        let ticket = self.issue();
        match self.inner.source.fetch_snapshot().await {
            Ok(payload) => Ok(self.settle_snapshot(ticket, payload)),
            Err(err) => {
                self.record_failure(ticket, Cycle::Snapshot, &err);
                Err(err)
            }
        }
    }

    /// Merges a snapshot that arrived without being requested, e.g. over MQTT.
    pub fn apply_pushed_snapshot(&self, payload: SnapshotPayload) -> Outcome {
        let ticket = self.issue();
        self.settle_snapshot(ticket, payload)
    }

    fn settle_snapshot(&self, ticket: Ticket, payload: SnapshotPayload) -> Outcome {
        self.apply(ticket, |state| {
            if ticket.id < state.snapshot_applied {
                return false;
            }
            state.snapshot_applied = ticket.id;
            state.merge_snapshot(payload);
            state.record_success(Cycle::Snapshot);
            true
        })
    }

    /// Fetches history for `window`. The result is applied only while
    /// `window` is still the selected one and no newer history has landed.
    pub async fn fetch_historical(&self, window: Window) -> Result<Outcome, ClientError> {
        let ticket = self.issue();
        let query = HistoricalQuery {
            limit: window.sample_limit(),
            sensor_ids: self.inner.settings.sensor_ids.clone(),
        };
        let series = match self.inner.source.fetch_historical(&query).await {
            Ok(series) => series,
            Err(err) => {
                self.record_failure(ticket, Cycle::Historical, &err);
                return Err(err);
            }
        };

        let outcome = self.apply(ticket, |state| {
            if state.window != window || ticket.id < state.historical_applied {
                return false;
            }
            state.historical_applied = ticket.id;
            state.stats = Arc::new(compute_series_stats(&series));
            state.series = Arc::new(series);
            state.series_window = Some(window);
            state.record_success(Cycle::Historical);
            true
        });
        if outcome == Outcome::Discarded {
            debug!(window = %window, "dropping superseded historical response");
        }
        Ok(outcome)
    }

    /// Refreshes the misting summary and the current event-log page. Both
    /// requests are made even if the first fails; the first error is returned.
    pub async fn fetch_analytics(&self) -> Result<Outcome, ClientError> {
        let (window, page) = {
            let state = self.lock_state();
            (state.window, state.analytics.page)
        };
        let summary = self.fetch_summary(window).await;
        let events = self.fetch_events(window, page).await;
        match (summary, events) {
            (Ok(summary), Ok(events)) => Ok(summary.either(events)),
            (Err(err), _) | (Ok(_), Err(err)) => Err(err),
        }
    }

    pub async fn fetch_summary(&self, window: Window) -> Result<Outcome, ClientError> {
        let ticket = self.issue();
        let summary = match self.inner.source.fetch_summary(window.hours()).await {
            Ok(summary) => summary,
            Err(err) => {
                self.record_failure(ticket, Cycle::Analytics, &err);
                return Err(err);
            }
        };
        Ok(self.apply(ticket, |state| {
            if state.window != window || ticket.id < state.summary_applied {
                return false;
            }
            state.summary_applied = ticket.id;
            state.analytics.summary = Some(summary);
            state.record_success(Cycle::Analytics);
            true
        }))
    }

    pub async fn fetch_events(&self, window: Window, page: u32) -> Result<Outcome, ClientError> {
        let ticket = self.issue();
        let query = EventLogQuery {
            time_range_hours: window.hours(),
            page: page.max(1),
            page_size: self.inner.settings.event_page_size,
        };
        let log = match self.inner.source.fetch_events(query).await {
            Ok(log) => log,
            Err(err) => {
                self.record_failure(ticket, Cycle::Analytics, &err);
                return Err(err);
            }
        };
        Ok(self.apply(ticket, |state| {
            if state.window != window
                || state.analytics.page != query.page
                || ticket.id < state.events_applied
            {
                return false;
            }
            state.events_applied = ticket.id;
            state.analytics.events = log.events;
            state.analytics.total_pages = log.total_pages.max(1);
            state.record_success(Cycle::Analytics);
            true
        }))
    }

    /// Selects a new window, resets the event log to its first page and
    /// refreshes history and analytics for it. Returns the history outcome;
    /// analytics failures are logged.
    pub async fn set_window(&self, window: Window) -> Result<Outcome, ClientError> {
        {
            let mut state = self.lock_state();
            state.window = window;
            state.analytics.page = 1;
            self.publish(&state);
        }
        debug!(window = %window, "window selected");

        let outcome = self.fetch_historical(window).await;
        if let Err(err) = self.fetch_analytics().await {
            warn!(window = %window, error = %err, "analytics refresh after window change failed");
        }
        outcome
    }

    /// Moves the event log to `page`, clamped to the known page range.
    pub async fn set_page(&self, page: u32) -> Result<Outcome, ClientError> {
        let (window, page) = {
            let mut state = self.lock_state();
            let page = page.clamp(1, state.analytics.total_pages.max(1));
            state.analytics.page = page;
            self.publish(&state);
            (state.window, page)
        };
        self.fetch_events(window, page).await
    }

    /// Sends a control command: ON/OFF, or a switch to AUTO/CONTINUOUS.
    /// `mode` defaults to the current control mode.
    ///
    /// On success the acknowledged state is merged and exactly one snapshot
    /// re-sync follows. On failure nothing changes and no re-sync is made.
    /// An acknowledgement that lands after `stop_polling` is reported as
    /// [`Outcome::Discarded`] together with the unchanged control state.
    pub async fn send_control(
        &self,
        action: ControlAction,
        mode: Option<Mode>,
    ) -> Result<(Outcome, ControlState), ClientError> {
        let (ticket, mode) = {
            let mut state = self.lock_state();
            let mode = mode
                .filter(|mode| mode.is_known())
                .unwrap_or(state.control.mode);
            (state.issue(), mode)
        };
        let request = ControlRequest { action, mode };

        let ack = match self.inner.source.send_control(&request).await {
            Ok(ack) => ack,
            Err(err) => {
                warn!(
                    ?action,
                    ?mode,
                    detail = err.detail().as_deref().unwrap_or(""),
                    error = %err,
                    "control request rejected"
                );
                return Err(err);
            }
        };
        if let Some(message) = ack.message.as_deref() {
            info!(?action, reply = message, "control acknowledged");
        }

        let mut acknowledged = None;
        let outcome = self.apply(ticket, |state| {
            state.control.misting_status = ack.current_status.unwrap_or(action.as_status());
            if let Some(mode) = ack.current_mode.filter(|mode| mode.is_known()) {
                state.control.mode = mode;
            }
            acknowledged = Some(state.control.clone());
            true
        });

        match outcome {
            Outcome::Applied => {
                if let Err(err) = self.fetch_snapshot().await {
                    warn!(error = %err, "snapshot re-sync after control failed");
                }
            }
            Outcome::Discarded => {
                warn!(?action, "control acknowledged after polling stopped; result discarded");
            }
        }
        let control = acknowledged.unwrap_or_else(|| self.lock_state().control.clone());
        Ok((outcome, control))
    }

    pub fn set_mist_duration(&self, secs: u32) {
        self.update_control(|control| control.mist_duration_secs = secs);
    }

    /// Clamped to 0..=100; non-finite input is ignored.
    pub fn set_humidity_threshold(&self, percent: f64) {
        if !percent.is_finite() {
            return;
        }
        self.update_control(|control| control.humidity_threshold = percent.clamp(0.0, 100.0));
    }

    pub fn set_auto_mode(&self, enabled: bool) {
        self.update_control(|control| control.auto_mode = enabled);
    }

    pub async fn export_data(&self, window: Window) -> Result<Bytes, ClientError> {
        self.inner.source.export_data(window).await
    }

    fn update_control(&self, update: impl FnOnce(&mut ControlState)) {
        let mut state = self.lock_state();
        update(&mut state.control);
        self.publish(&state);
    }

    fn issue(&self) -> Ticket {
        self.lock_state().issue()
    }

    fn apply<F>(&self, ticket: Ticket, update: F) -> Outcome
    where
        F: FnOnce(&mut PollerState) -> bool,
    {
        let mut state = self.lock_state();
        if state.epoch != ticket.epoch || !update(&mut *state) {
            return Outcome::Discarded;
        }
        self.publish(&state);
        Outcome::Applied
    }

    fn record_failure(&self, ticket: Ticket, cycle: Cycle, err: &ClientError) {
        let mut state = self.lock_state();
        if state.epoch != ticket.epoch {
            return;
        }
        state.record_failure(cycle, err);
        self.publish(&state);
    }

    fn publish(&self, state: &PollerState) {
        self.inner.view_tx.send_replace(Arc::new(state.view()));
    }

    fn lock_state(&self) -> MutexGuard<'_, PollerState> {
        lock(&self.inner.state)
    }
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}
