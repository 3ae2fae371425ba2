use async_trait::async_trait;
use bytes::Bytes;
use reqwest::{Client, RequestBuilder};
use std::time::Duration;

use crate::config::Config;
use crate::error::ClientError;
use crate::telemetry::{
    decode, decode_event_log, decode_historical, ControlAck, ControlRequest, SnapshotPayload,
};
use crate::types::{EventLogPage, HistoricalSeries, MistingSummary, Window};

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HistoricalQuery {
    pub limit: u32,
    pub sensor_ids: Vec<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct EventLogQuery {
    pub time_range_hours: u32,
    pub page: u32,
    pub page_size: u32,
}

/// Remote side of the dashboard: current readings, history, analytics and
/// the actuator control endpoint.
#[async_trait]
pub trait TelemetrySource: Send + Sync + 'static {
    async fn fetch_snapshot(&self) -> Result<SnapshotPayload, ClientError>;

    async fn fetch_historical(&self, query: &HistoricalQuery)
        -> Result<HistoricalSeries, ClientError>;

    async fn fetch_summary(&self, time_range_hours: u32) -> Result<MistingSummary, ClientError>;

    async fn fetch_events(&self, query: EventLogQuery) -> Result<EventLogPage, ClientError>;

    async fn send_control(&self, request: &ControlRequest) -> Result<ControlAck, ClientError>;

    async fn export_data(&self, window: Window) -> Result<Bytes, ClientError>;
}

#[derive(Clone)]
pub struct HttpSource {
    base_url: String,
    http: Client,
    timeout: Duration,
}

impl HttpSource {
    pub fn new(base_url: &str, http: Client, timeout: Duration) -> Self {
        Self {
            base_url: base_url.trim().trim_end_matches('/').to_string(),
            http,
            timeout,
        }
    }

    pub fn from_config(config: &Config) -> Self {
        Self::new(&config.api_url, Client::new(), config.request_timeout())
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    fn url(&self, path: &str) -> String {
        format!("{}{}", self.base_url, path)
    }

    async fn execute(
        &self,
        endpoint: &'static str,
        request: RequestBuilder,
    ) -> Result<Bytes, ClientError> {
        let response = request
            .timeout(self.timeout)
            .send()
            .await
            .map_err(|err| ClientError::transport(endpoint, err))?;
        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(ClientError::status(endpoint, status, body));
        }
        let body = response
            .bytes()
            .await
            .map_err(|err| ClientError::transport(endpoint, err))?;
        tracing::trace!(endpoint, bytes = body.len(), "backend response");
        Ok(body)
    }
}

#[async_trait]
impl TelemetrySource for HttpSource {
    async fn fetch_snapshot(&self) -> Result<SnapshotPayload, ClientError> {
        let request = self.http.get(self.url("/sensor-data"));
        let body = self.execute("sensor-data", request).await?;
        decode("sensor-data", &body)
    }

    async fn fetch_historical(
        &self,
        query: &HistoricalQuery,
    ) -> Result<HistoricalSeries, ClientError> {
        let request = self.http.get(self.url("/historical-data")).query(&[
            ("limit", query.limit.to_string()),
            ("sensor_ids", query.sensor_ids.join(",")),
        ]);
        let body = self.execute("historical-data", request).await?;
        decode_historical(&body)
    }

    async fn fetch_summary(&self, time_range_hours: u32) -> Result<MistingSummary, ClientError> {
        let request = self
            .http
            .get(self.url("/analytics/misting_summary"))
            .query(&[("time_range_hours", time_range_hours)]);
        let body = self.execute("misting_summary", request).await?;
        decode("misting_summary", &body)
    }

    async fn fetch_events(&self, query: EventLogQuery) -> Result<EventLogPage, ClientError> {
        let request = self
            .http
            .get(self.url("/analytics/misting_events_log"))
            .query(&[
                ("time_range_hours", query.time_range_hours),
                ("page", query.page),
                ("page_size", query.page_size),
            ]);
        let body = self.execute("misting_events_log", request).await?;
        decode_event_log(&body)
    }

    async fn send_control(&self, request: &ControlRequest) -> Result<ControlAck, ClientError> {
        let builder = self.http.post(self.url("/control-misting")).json(request);
        let body = self.execute("control-misting", builder).await?;
        if body.iter().all(u8::is_ascii_whitespace) {
            return Ok(ControlAck::default());
        }
        decode("control-misting", &body)
    }

    async fn export_data(&self, window: Window) -> Result<Bytes, ClientError> {
        let request = self
            .http
            .get(self.url("/export-data"))
            .query(&[("range", window.as_str())]);
        self.execute("export-data", request).await
    }
}
