use anyhow::{anyhow, bail, Context, Result};
use dotenvy::dotenv;
use std::env;
use std::time::Duration;
use url::Url;

use crate::types::Window;

const DEFAULT_API_URL: &str = "http://localhost:8000";
const DEFAULT_SENSOR_IDS: &str = "sensor1,sensor2,average";

#[derive(Debug, Clone)]
pub struct Config {
    pub api_url: String,
    pub snapshot_interval_ms: u64,
    pub historical_interval_ms: u64,
    pub analytics_interval_ms: u64,
    pub request_timeout_ms: u64,
    pub sensor_ids: Vec<String>,
    pub default_window: Window,
    pub event_page_size: u32,
    pub stale_after_ms: u64,

    pub enable_mqtt: bool,
    pub mqtt_host: String,
    pub mqtt_port: u16,
    pub mqtt_username: Option<String>,
    pub mqtt_password: Option<String>,
    pub mqtt_topic_prefix: String,
    pub mqtt_client_id: String,
    pub mqtt_keepalive_secs: u64,
}

impl Config {
    pub fn from_env() -> Result<Self> {
        dotenv().ok();
        Self::from_lookup(|key| env::var(key).ok())
    }

    pub fn from_lookup<F>(lookup: F) -> Result<Self>
    where
        F: Fn(&str) -> Option<String>,
    {
        let vars = Vars { lookup };

        let api_url = vars
            .string("MISTING_API_URL", DEFAULT_API_URL)
            .trim_end_matches('/')
            .to_string();
        Url::parse(&api_url).context("invalid MISTING_API_URL")?;

        let snapshot_interval_ms = vars.interval_ms("MISTING_SNAPSHOT_INTERVAL_MS", 5_000)?;
        let historical_interval_ms = vars.interval_ms("MISTING_HISTORICAL_INTERVAL_MS", 60_000)?;
        let analytics_interval_ms = vars.interval_ms("MISTING_ANALYTICS_INTERVAL_MS", 60_000)?;
        let request_timeout_ms = vars.interval_ms("MISTING_REQUEST_TIMEOUT_MS", 10_000)?;
        let stale_after_ms = vars.interval_ms("MISTING_STALE_AFTER_MS", 15_000)?;

        let sensor_ids: Vec<String> = vars
            .string("MISTING_SENSOR_IDS", DEFAULT_SENSOR_IDS)
            .split(',')
            .map(str::trim)
            .filter(|id| !id.is_empty())
            .map(str::to_string)
            .collect();
        if sensor_ids.is_empty() {
            bail!("MISTING_SENSOR_IDS must name at least one sensor");
        }

        let default_window = vars
            .string("MISTING_DEFAULT_WINDOW", Window::Day.as_str())
            .parse::<Window>()
            .map_err(|err| anyhow!(err))
            .context("invalid MISTING_DEFAULT_WINDOW")?;

        let event_page_size = vars.u64("MISTING_EVENT_PAGE_SIZE", 15)?;
        let event_page_size = u32::try_from(event_page_size)
            .ok()
            .filter(|size| *size > 0)
            .ok_or_else(|| anyhow!("MISTING_EVENT_PAGE_SIZE must be between 1 and {}", u32::MAX))?;

        let enable_mqtt = vars
            .optional("MISTING_ENABLE_MQTT")
            .map(|v| v == "1" || v.eq_ignore_ascii_case("true"))
            .unwrap_or(false);

        let mqtt_url = vars.string("MISTING_MQTT_URL", "mqtt://127.0.0.1:1883");
        let url = Url::parse(&mqtt_url).context("invalid MISTING_MQTT_URL")?;
        let mqtt_host = url
            .host_str()
            .ok_or_else(|| anyhow!("MISTING_MQTT_URL missing host"))?
            .to_string();
        let mqtt_port = url.port().unwrap_or(1883);
        let mqtt_username = vars.optional("MISTING_MQTT_USERNAME");
        let mqtt_password = vars.optional("MISTING_MQTT_PASSWORD");
        let mqtt_topic_prefix = vars
            .string("MISTING_MQTT_TOPIC_PREFIX", "smart-misting")
            .trim_end_matches('/')
            .to_string();
        let mqtt_client_id = vars
            .optional("MISTING_MQTT_CLIENT_ID")
            .unwrap_or_else(|| format!("smart-misting-{}", std::process::id()));
        let mqtt_keepalive_secs = vars.u64("MISTING_MQTT_KEEPALIVE_SECS", 30)?;

        Ok(Self {
            api_url,
            snapshot_interval_ms,
            historical_interval_ms,
            analytics_interval_ms,
            request_timeout_ms,
            sensor_ids,
            default_window,
            event_page_size,
            stale_after_ms,
            enable_mqtt,
            mqtt_host,
            mqtt_port,
            mqtt_username,
            mqtt_password,
            mqtt_topic_prefix,
            mqtt_client_id,
            mqtt_keepalive_secs,
        })
    }

    pub fn snapshot_interval(&self) -> Duration {
        Duration::from_millis(self.snapshot_interval_ms)
    }

    pub fn historical_interval(&self) -> Duration {
        Duration::from_millis(self.historical_interval_ms)
    }

    pub fn analytics_interval(&self) -> Duration {
        Duration::from_millis(self.analytics_interval_ms)
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_millis(self.request_timeout_ms)
    }

    pub fn stale_after(&self) -> Duration {
        Duration::from_millis(self.stale_after_ms)
    }

    pub fn mqtt_keepalive(&self) -> Duration {
        Duration::from_secs(self.mqtt_keepalive_secs)
    }
}

struct Vars<F> {
    lookup: F,
}

impl<F> Vars<F>
where
    F: Fn(&str) -> Option<String>,
{
    fn optional(&self, key: &str) -> Option<String> {
        (self.lookup)(key)
            .map(|v| v.trim().to_string())
            .filter(|v| !v.is_empty())
    }

    fn string(&self, key: &str, default: &str) -> String {
        self.optional(key).unwrap_or_else(|| default.to_string())
    }

    fn u64(&self, key: &str, default: u64) -> Result<u64> {
        match self.optional(key) {
            Some(value) => value
                .parse::<u64>()
                .with_context(|| format!("invalid {key}")),
            None => Ok(default),
        }
    }

    fn interval_ms(&self, key: &str, default: u64) -> Result<u64> {
        let value = self.u64(key, default)?;
        if value == 0 {
            bail!("{key} must be greater than zero");
        }
        Ok(value)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn config_from(pairs: &[(&str, &str)]) -> Result<Config> {
        let vars: HashMap<String, String> = pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        Config::from_lookup(move |key| vars.get(key).cloned())
    }

    #[test]
    fn defaults_match_dashboard_cadence() {
        let config = config_from(&[]).unwrap();
        assert_eq!(config.api_url, "http://localhost:8000");
        assert_eq!(config.snapshot_interval(), Duration::from_secs(5));
        assert_eq!(config.historical_interval(), Duration::from_secs(60));
        assert_eq!(config.sensor_ids, vec!["sensor1", "sensor2", "average"]);
        assert_eq!(config.default_window, Window::Day);
        assert_eq!(config.event_page_size, 15);
        assert!(!config.enable_mqtt);
        assert_eq!(config.mqtt_host, "127.0.0.1");
        assert_eq!(config.mqtt_port, 1883);
        assert_eq!(config.mqtt_topic_prefix, "smart-misting");
    }

    #[test]
    fn overrides_are_trimmed_and_parsed() {
        let config = config_from(&[
            ("MISTING_API_URL", " http://greenhouse.local:9000/ "),
            ("MISTING_HISTORICAL_INTERVAL_MS", "5000"),
            ("MISTING_SENSOR_IDS", "sensor1, average,,"),
            ("MISTING_DEFAULT_WINDOW", "30d"),
            ("MISTING_ENABLE_MQTT", "TRUE"),
            ("MISTING_MQTT_URL", "mqtt://broker.lan:1884"),
            ("MISTING_MQTT_USERNAME", "   "),
        ])
        .unwrap();
        assert_eq!(config.api_url, "http://greenhouse.local:9000");
        assert_eq!(config.historical_interval_ms, 5000);
        assert_eq!(config.sensor_ids, vec!["sensor1", "average"]);
        assert_eq!(config.default_window, Window::Month);
        assert!(config.enable_mqtt);
        assert_eq!(config.mqtt_host, "broker.lan");
        assert_eq!(config.mqtt_port, 1884);
        assert!(config.mqtt_username.is_none());
    }

    #[test]
    fn invalid_values_are_rejected() {
        let err = config_from(&[("MISTING_SNAPSHOT_INTERVAL_MS", "soon")]).unwrap_err();
        assert!(err.to_string().contains("MISTING_SNAPSHOT_INTERVAL_MS"));

        let err = config_from(&[("MISTING_SNAPSHOT_INTERVAL_MS", "0")]).unwrap_err();
        assert!(err.to_string().contains("greater than zero"));

        assert!(config_from(&[("MISTING_DEFAULT_WINDOW", "1y")]).is_err());
        assert!(config_from(&[("MISTING_SENSOR_IDS", ",")]).is_err());
        assert!(config_from(&[("MISTING_API_URL", "not a url")]).is_err());
        assert!(config_from(&[("MISTING_EVENT_PAGE_SIZE", "0")]).is_err());
    }
}
