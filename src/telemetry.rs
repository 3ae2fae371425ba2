use chrono::{DateTime, NaiveDateTime, TimeZone, Utc};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Deserializer, Serialize};
use serde_json::Value as JsonValue;
use std::collections::BTreeMap;

use crate::error::ClientError;
use crate::types::{
    ControlAction, EventLogPage, HistoricalSeries, MistingEvent, MistingStatus, Mode, Reading,
    SensorSnapshot, SENSOR_AVERAGE,
};

const NAIVE_TIMESTAMP_FORMATS: [&str; 2] = ["%Y-%m-%d %H:%M:%S%.f", "%Y-%m-%dT%H:%M:%S%.f"];

/// Body of `/sensor-data` and of the MQTT sensor/status topics.
///
/// Every field is optional: whatever the payload omits (or sends as null) keeps
/// its previous value when merged.
#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
pub struct SnapshotPayload {
    #[serde(default, deserialize_with = "de_reading")]
    pub sensor1: Option<Reading>,
    #[serde(default, deserialize_with = "de_reading")]
    pub sensor2: Option<Reading>,
    #[serde(default, deserialize_with = "de_reading")]
    pub average: Option<Reading>,
    #[serde(default)]
    pub misting_status: Option<MistingStatus>,
    #[serde(default)]
    pub mode: Option<Mode>,
    #[serde(default, deserialize_with = "de_flag")]
    pub human_detected: Option<bool>,
    #[serde(default)]
    pub person_detection_status: Option<String>,
    #[serde(default, deserialize_with = "de_timestamp")]
    pub person_detection_timestamp: Option<DateTime<Utc>>,
    #[serde(default, deserialize_with = "de_number")]
    pub water_level: Option<f64>,
}

impl SnapshotPayload {
    pub fn merge_into(self, snapshot: &mut SensorSnapshot) {
        if let Some(reading) = self.sensor1 {
            snapshot.sensor1 = reading;
        }
        if let Some(reading) = self.sensor2 {
            snapshot.sensor2 = reading;
        }
        if let Some(reading) = self.average {
            snapshot.average = reading;
        }
        if let Some(status) = self.misting_status {
            snapshot.misting_status = status;
        }
        if let Some(mode) = self.mode {
            snapshot.mode = mode;
        }
        if let Some(detected) = self.human_detected {
            snapshot.human_detected = detected;
        }
        if let Some(status) = self.person_detection_status {
            snapshot.person_detection_status = Some(status);
        }
        if let Some(ts) = self.person_detection_timestamp {
            snapshot.person_detection_timestamp = Some(ts);
        }
        if let Some(level) = self.water_level {
            snapshot.water_level = Some(level);
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct ControlRequest {
    pub action: ControlAction,
    pub mode: Mode,
}

#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
pub struct ControlAck {
    #[serde(default)]
    pub current_status: Option<MistingStatus>,
    #[serde(default)]
    pub current_mode: Option<Mode>,
    #[serde(default)]
    pub message: Option<String>,
}

#[derive(Debug, Deserialize)]
struct EventLogPayload {
    #[serde(default)]
    events: Option<Vec<MistingEvent>>,
    #[serde(default)]
    total_pages: Option<u32>,
}

pub fn decode<T: DeserializeOwned>(what: &'static str, body: &[u8]) -> Result<T, ClientError> {
    serde_json::from_slice(body).map_err(|err| ClientError::decode(what, err))
}

/// Decodes `/historical-data`.
///
/// The current backend answers with one array per sensor id; older backends
/// answer with a single flat array, which is taken as the average series.
/// Non-array members (null, error strings) are skipped.
pub fn decode_historical(body: &[u8]) -> Result<HistoricalSeries, ClientError> {
    let value: JsonValue = decode("historical-data", body)?;
    let mut raw: BTreeMap<String, Vec<Reading>> = BTreeMap::new();
    match value {
        JsonValue::Array(_) => {
            let readings = serde_json::from_value(value)
                .map_err(|err| ClientError::decode("historical-data", err))?;
            raw.insert(SENSOR_AVERAGE.to_string(), readings);
        }
        JsonValue::Object(map) => {
            for (sensor_id, member) in map {
                if !member.is_array() {
                    continue;
                }
                let readings = serde_json::from_value(member)
                    .map_err(|err| ClientError::decode("historical-data", err))?;
                raw.insert(sensor_id, readings);
            }
        }
        other => {
            return Err(ClientError::decode(
                "historical-data",
                serde::de::Error::custom(format!("expected array or object, got {other}")),
            ));
        }
    }
    Ok(HistoricalSeries::from_newest_first(raw))
}

pub fn decode_event_log(body: &[u8]) -> Result<EventLogPage, ClientError> {
    let payload: EventLogPayload = decode("misting_events_log", body)?;
    Ok(EventLogPage {
        events: payload.events.unwrap_or_default(),
        total_pages: payload.total_pages.unwrap_or(1).max(1),
    })
}

/// Accepts JSON numbers and numeric strings; anything else becomes `None`.
pub fn de_number<'de, D>(deserializer: D) -> Result<Option<f64>, D::Error>
where
    D: Deserializer<'de>,
{
    let value = Option::<JsonValue>::deserialize(deserializer)?;
    Ok(value.as_ref().and_then(number_from_value))
}

pub fn de_timestamp<'de, D>(deserializer: D) -> Result<Option<DateTime<Utc>>, D::Error>
where
    D: Deserializer<'de>,
{
    let value = Option::<JsonValue>::deserialize(deserializer)?;
    Ok(value.as_ref().and_then(timestamp_from_value))
}

/// Booleans, 0/1 and "true"/"false" style strings; anything else is `None`.
pub fn de_flag<'de, D>(deserializer: D) -> Result<Option<bool>, D::Error>
where
    D: Deserializer<'de>,
{
    let value = Option::<JsonValue>::deserialize(deserializer)?;
    Ok(value.as_ref().and_then(flag_from_value))
}

/// A sensor block that is not an object (e.g. `"offline"`) reads as missing
/// instead of failing the whole payload.
pub fn de_reading<'de, D>(deserializer: D) -> Result<Option<Reading>, D::Error>
where
    D: Deserializer<'de>,
{
    let value = Option::<JsonValue>::deserialize(deserializer)?;
    Ok(value
        .filter(JsonValue::is_object)
        .and_then(|value| serde_json::from_value(value).ok()))
}

fn flag_from_value(value: &JsonValue) -> Option<bool> {
    match value {
        JsonValue::Bool(flag) => Some(*flag),
        JsonValue::Number(n) => n.as_f64().map(|v| v != 0.0),
        JsonValue::String(s) => match s.trim().to_ascii_lowercase().as_str() {
            "true" | "1" | "yes" => Some(true),
            "false" | "0" | "no" => Some(false),
            _ => None,
        },
        _ => None,
    }
}

pub fn number_from_value(value: &JsonValue) -> Option<f64> {
    let number = match value {
        JsonValue::Number(n) => n.as_f64(),
        JsonValue::String(s) => s.trim().parse::<f64>().ok(),
        _ => None,
    };
    number.filter(|v| v.is_finite())
}

fn timestamp_from_value(value: &JsonValue) -> Option<DateTime<Utc>> {
    match value {
        JsonValue::String(s) => parse_timestamp(s),
        JsonValue::Number(n) => {
            if let Some(ms) = n.as_i64() {
                millis_to_dt(ms)
            } else {
                n.as_f64()
                    .filter(|secs| secs.is_finite())
                    .and_then(|secs| millis_to_dt((secs * 1000.0) as i64))
            }
        }
        _ => None,
    }
}

/// RFC 3339, or a naive `YYYY-MM-DD HH:MM:SS` style stamp read as UTC.
pub fn parse_timestamp(raw: &str) -> Option<DateTime<Utc>> {
    let raw = raw.trim();
    if raw.is_empty() {
        return None;
    }
    if let Ok(ts) = DateTime::parse_from_rfc3339(raw) {
        return Some(ts.with_timezone(&Utc));
    }
    NAIVE_TIMESTAMP_FORMATS
        .iter()
        .find_map(|format| NaiveDateTime::parse_from_str(raw, format).ok())
        .map(|naive| naive.and_utc())
}

fn millis_to_dt(ms: i64) -> Option<DateTime<Utc>> {
    Utc.timestamp_millis_opt(ms).single()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{SENSOR_1, SENSOR_2};

    #[test]
    fn snapshot_merge_keeps_absent_fields() {
        let mut snapshot = SensorSnapshot::default();
        snapshot.water_level = Some(42.0);
        snapshot.mode = Mode::Manual;
        snapshot.sensor2.temperature = Some(30.5);

        let payload: SnapshotPayload = decode(
            "sensor-data",
            br#"{"sensor1":{"temperature":"27.5","humidity":61,"timestamp":"2024-05-01 08:00:00"},
                "misting_status":"ON","water_level":null}"#,
        )
        .unwrap();
        payload.merge_into(&mut snapshot);

        assert_eq!(snapshot.sensor1.temperature, Some(27.5));
        assert_eq!(snapshot.sensor1.humidity, Some(61.0));
        assert!(snapshot.sensor1.timestamp.is_some());
        assert_eq!(snapshot.sensor2.temperature, Some(30.5));
        assert_eq!(snapshot.misting_status, MistingStatus::On);
        assert_eq!(snapshot.mode, Mode::Manual);
        assert_eq!(snapshot.water_level, Some(42.0));
    }

    #[test]
    fn malformed_sensor_block_or_flag_does_not_fail_the_snapshot() {
        let payload: SnapshotPayload = decode(
            "sensor-data",
            br#"{"sensor1":{"temperature":25},"sensor2":"offline","average":[1,2],
                "human_detected":1,"water_level":70}"#,
        )
        .unwrap();
        assert_eq!(payload.sensor1.unwrap().temperature, Some(25.0));
        assert_eq!(payload.sensor2, None);
        assert_eq!(payload.average, None);
        assert_eq!(payload.human_detected, Some(true));
        assert_eq!(payload.water_level, Some(70.0));

        let payload: SnapshotPayload =
            decode("sensor-data", br#"{"human_detected":"maybe"}"#).unwrap();
        assert_eq!(payload.human_detected, None);
        let payload: SnapshotPayload =
            decode("sensor-data", br#"{"human_detected":"false"}"#).unwrap();
        assert_eq!(payload.human_detected, Some(false));
    }

    #[test]
    fn non_numeric_metrics_decode_as_missing() {
        let reading: Reading = serde_json::from_str(
            r#"{"temperature":"n/a","humidity":{"value":3},"timestamp":"garbage"}"#,
        )
        .unwrap();
        assert_eq!(reading.temperature, None);
        assert_eq!(reading.humidity, None);
        assert_eq!(reading.timestamp, None);
    }

    #[test]
    fn timestamps_accept_rfc3339_naive_and_epoch_forms() {
        let expected = Utc.with_ymd_and_hms(2024, 5, 1, 8, 0, 0).single();
        assert_eq!(parse_timestamp("2024-05-01T08:00:00Z"), expected);
        assert_eq!(parse_timestamp("2024-05-01T10:00:00+02:00"), expected);
        assert_eq!(parse_timestamp("2024-05-01 08:00:00"), expected);
        assert_eq!(parse_timestamp("2024-05-01T08:00:00.000"), expected);
        assert_eq!(
            timestamp_from_value(&serde_json::json!(1_714_550_400_000i64)),
            expected
        );
        assert_eq!(
            timestamp_from_value(&serde_json::json!(1_714_550_400.0)),
            expected
        );
    }

    #[test]
    fn historical_per_sensor_payload_skips_non_arrays() {
        let series = decode_historical(
            br#"{"sensor1":[{"timestamp":"2024-05-01 09:00:00","temperature":25},
                            {"timestamp":"2024-05-01 08:00:00","temperature":24}],
                "sensor2":null,
                "average":[]}"#,
        )
        .unwrap();
        let temps: Vec<_> = series
            .get(SENSOR_1)
            .iter()
            .map(|r| r.temperature)
            .collect();
        assert_eq!(temps, vec![Some(24.0), Some(25.0)]);
        assert!(series.get(SENSOR_2).is_empty());
    }

    #[test]
    fn historical_flat_payload_becomes_average_series() {
        let series =
            decode_historical(br#"[{"timestamp":"2024-05-01 08:00:00","humidity":70.5}]"#)
                .unwrap();
        assert_eq!(series.get(SENSOR_AVERAGE).len(), 1);
        assert_eq!(series.get(SENSOR_AVERAGE)[0].humidity, Some(70.5));
    }

    #[test]
    fn historical_scalar_payload_is_a_decode_error() {
        let err = decode_historical(b"42").unwrap_err();
        assert_eq!(err.kind(), "decode");
    }

    #[test]
    fn event_log_defaults_total_pages_to_one() {
        let page = decode_event_log(br#"{"events":[{"id":1,"trigger_type":"humidity_low","duration":"12"}]}"#)
            .unwrap();
        assert_eq!(page.total_pages, 1);
        assert_eq!(page.events[0].duration, Some(12.0));

        let empty = decode_event_log(br#"{"total_pages":0}"#).unwrap();
        assert!(empty.events.is_empty());
        assert_eq!(empty.total_pages, 1);
    }

    #[test]
    fn control_request_serializes_uppercase() {
        let body = serde_json::to_value(ControlRequest {
            action: ControlAction::On,
            mode: Mode::Auto,
        })
        .unwrap();
        assert_eq!(body, serde_json::json!({"action": "ON", "mode": "AUTO"}));
    }
}
