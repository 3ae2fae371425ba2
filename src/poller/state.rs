use chrono::{DateTime, Utc};
use serde::Serialize;
use std::sync::Arc;
use std::time::Duration;

use super::Cycle;
use crate::error::ClientError;
use crate::stats::{SensorStats, SeriesStats};
use crate::telemetry::SnapshotPayload;
use crate::types::{
    ControlState, HistoricalSeries, MistingEvent, MistingSummary, SensorSnapshot, Window,
};

/// Request stamp: the poller epoch it was issued under plus a monotonically
/// increasing id used for last-writer-wins between responses.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(in crate::poller) struct Ticket {
    pub(in crate::poller) epoch: u64,
    pub(in crate::poller) id: u64,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct Freshness {
    pub last_snapshot_at: Option<DateTime<Utc>>,
    pub last_historical_at: Option<DateTime<Utc>>,
    pub last_analytics_at: Option<DateTime<Utc>>,
    pub last_error: Option<String>,
    pub consecutive_failures: u32,
}

impl Freshness {
    fn record_success(&mut self, cycle: Cycle) {
        let now = Some(Utc::now());
        match cycle {
            Cycle::Snapshot => self.last_snapshot_at = now,
            Cycle::Historical => self.last_historical_at = now,
            Cycle::Analytics => self.last_analytics_at = now,
        }
        self.last_error = None;
        self.consecutive_failures = 0;
    }

    fn record_failure(&mut self, cycle: Cycle, err: &ClientError) {
        self.last_error = Some(format!("{}: {err}", cycle.as_str()));
        self.consecutive_failures = self.consecutive_failures.saturating_add(1);
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct AnalyticsState {
    pub summary: Option<MistingSummary>,
    pub events: Vec<MistingEvent>,
    pub page: u32,
    pub total_pages: u32,
    pub page_size: u32,
}

/// Immutable picture of everything the poller owns, handed to readers after
/// every state change.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct DashboardView {
    pub window: Window,
    /// Window the displayed series was fetched for; lags `window` until the
    /// first fetch after a switch lands.
    pub series_window: Option<Window>,
    pub snapshot: SensorSnapshot,
    pub control: ControlState,
    pub series: Arc<HistoricalSeries>,
    pub stats: Arc<SeriesStats>,
    pub analytics: AnalyticsState,
    pub freshness: Freshness,
}

impl DashboardView {
    pub fn sensor_stats(&self, sensor_id: &str) -> Option<&SensorStats> {
        self.stats.get(sensor_id)
    }

    pub fn last_updated(&self) -> Option<DateTime<Utc>> {
        self.series.last_updated()
    }

    /// True until a snapshot has landed, or once the last one is older than
    /// `stale_after`.
    pub fn is_stale(&self, now: DateTime<Utc>, stale_after: Duration) -> bool {
        match self.freshness.last_snapshot_at {
            None => true,
            Some(ts) => now
                .signed_duration_since(ts)
                .to_std()
                .map(|age| age > stale_after)
                .unwrap_or(false),
        }
    }
}

#[derive(Debug)]
pub(in crate::poller) struct PollerState {
    pub(in crate::poller) epoch: u64,
    next_request_id: u64,
    pub(in crate::poller) snapshot_applied: u64,
    pub(in crate::poller) historical_applied: u64,
    pub(in crate::poller) summary_applied: u64,
    pub(in crate::poller) events_applied: u64,
    pub(in crate::poller) window: Window,
    pub(in crate::poller) series_window: Option<Window>,
    pub(in crate::poller) snapshot: SensorSnapshot,
    pub(in crate::poller) control: ControlState,
    pub(in crate::poller) series: Arc<HistoricalSeries>,
    pub(in crate::poller) stats: Arc<SeriesStats>,
    pub(in crate::poller) analytics: AnalyticsState,
    pub(in crate::poller) freshness: Freshness,
}

impl PollerState {
    pub(in crate::poller) fn new(window: Window, page_size: u32) -> Self {
        Self {
            epoch: 0,
            next_request_id: 0,
            snapshot_applied: 0,
            historical_applied: 0,
            summary_applied: 0,
            events_applied: 0,
            window,
            series_window: None,
            snapshot: SensorSnapshot::default(),
            control: ControlState::default(),
            series: Arc::new(HistoricalSeries::default()),
            stats: Arc::new(SeriesStats::new()),
            analytics: AnalyticsState {
                summary: None,
                events: Vec::new(),
                page: 1,
                total_pages: 1,
                page_size,
            },
            freshness: Freshness::default(),
        }
    }

    pub(in crate::poller) fn issue(&mut self) -> Ticket {
        self.next_request_id += 1;
        Ticket {
            epoch: self.epoch,
            id: self.next_request_id,
        }
    }

    pub(in crate::poller) fn merge_snapshot(&mut self, payload: SnapshotPayload) {
        if let Some(status) = payload.misting_status {
            self.control.misting_status = status;
        }
        if let Some(mode) = payload.mode.filter(|mode| mode.is_known()) {
            self.control.mode = mode;
        }
        payload.merge_into(&mut self.snapshot);
    }

    pub(in crate::poller) fn record_success(&mut self, cycle: Cycle) {
        self.freshness.record_success(cycle);
    }

    pub(in crate::poller) fn record_failure(&mut self, cycle: Cycle, err: &ClientError) {
        self.freshness.record_failure(cycle, err);
    }

    pub(in crate::poller) fn view(&self) -> DashboardView {
        DashboardView {
            window: self.window,
            series_window: self.series_window,
            snapshot: self.snapshot.clone(),
            control: self.control.clone(),
            series: self.series.clone(),
            stats: self.stats.clone(),
            analytics: self.analytics.clone(),
            freshness: self.freshness.clone(),
        }
    }
}
