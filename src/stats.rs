use chrono::{DateTime, Utc};
use serde::Serialize;
use std::collections::BTreeMap;

use crate::types::{HistoricalSeries, Metric, MistingStatus, Reading};

/// Summary statistics of one metric over one series. All fields are `None`
/// when the series holds no usable value.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize)]
pub struct DerivedStats {
    pub avg: Option<f64>,
    pub max: Option<f64>,
    pub min: Option<f64>,
    pub median: Option<f64>,
    pub std_dev: Option<f64>,
    pub max_time: Option<DateTime<Utc>>,
    pub min_time: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct SensorStats {
    pub temperature: DerivedStats,
    pub humidity: DerivedStats,
    pub misting_cycles: usize,
    pub samples: usize,
}

/// Stats keyed by sensor id, always rebuilt from a whole series.
pub type SeriesStats = BTreeMap<String, SensorStats>;

pub fn compute_statistics(series: &[Reading], metric: Metric) -> DerivedStats {
    let values: Vec<f64> = series.iter().filter_map(|r| metric.value_of(r)).collect();
    if values.is_empty() {
        return DerivedStats::default();
    }

    let count = values.len() as f64;
    let avg = values.iter().sum::<f64>() / count;
    let max = values.iter().copied().fold(f64::NEG_INFINITY, f64::max);
    let min = values.iter().copied().fold(f64::INFINITY, f64::min);

    let variance = values
        .iter()
        .map(|value| {
            let delta = *value - avg;
            delta * delta
        })
        .sum::<f64>()
        / count;

    DerivedStats {
        avg: Some(avg),
        max: Some(max),
        min: Some(min),
        median: median(&values),
        std_dev: Some(variance.max(0.0).sqrt()),
        max_time: first_time_of(series, metric, max),
        min_time: first_time_of(series, metric, min),
    }
}

pub fn compute_series_stats(series: &HistoricalSeries) -> SeriesStats {
    series
        .iter()
        .map(|(sensor_id, readings)| {
            let stats = SensorStats {
                temperature: compute_statistics(readings, Metric::Temperature),
                humidity: compute_statistics(readings, Metric::Humidity),
                misting_cycles: count_misting_cycles(readings),
                samples: readings.len(),
            };
            (sensor_id.to_string(), stats)
        })
        .collect()
}

/// Readings taken while the mister was running.
pub fn count_misting_cycles(series: &[Reading]) -> usize {
    series
        .iter()
        .filter(|r| r.misting_status == Some(MistingStatus::On))
        .count()
}

fn median(values: &[f64]) -> Option<f64> {
    if values.is_empty() {
        return None;
    }
    let mut ordered = values.to_vec();
    ordered.sort_by(|a, b| a.total_cmp(b));
    let middle = ordered.len() / 2;
    if ordered.len() % 2 == 0 {
        Some((ordered[middle - 1] + ordered[middle]) / 2.0)
    } else {
        Some(ordered[middle])
    }
}

fn first_time_of(series: &[Reading], metric: Metric, target: f64) -> Option<DateTime<Utc>> {
    series
        .iter()
        .find(|r| metric.value_of(r) == Some(target))
        .and_then(|r| r.timestamp)
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn at(minute: u32) -> Option<DateTime<Utc>> {
        Utc.with_ymd_and_hms(2024, 5, 1, 12, minute, 0).single()
    }

    fn temps(values: &[Option<f64>]) -> Vec<Reading> {
        values
            .iter()
            .enumerate()
            .map(|(idx, value)| Reading {
                timestamp: at(idx as u32),
                temperature: *value,
                humidity: None,
                misting_status: None,
            })
            .collect()
    }

    #[test]
    fn all_missing_values_yield_empty_stats() {
        let series = temps(&[None, None, Some(f64::NAN)]);
        let stats = compute_statistics(&series, Metric::Temperature);
        assert_eq!(stats, DerivedStats::default());
        assert_eq!(compute_statistics(&[], Metric::Humidity), DerivedStats::default());
    }

    #[test]
    fn odd_series_uses_population_std_dev() {
        let series = temps(&[Some(10.0), Some(20.0), Some(30.0)]);
        let stats = compute_statistics(&series, Metric::Temperature);
        assert_eq!(stats.avg, Some(20.0));
        assert_eq!(stats.median, Some(20.0));
        assert_eq!(stats.max, Some(30.0));
        assert_eq!(stats.min, Some(10.0));
        let std_dev = stats.std_dev.unwrap();
        assert!((std_dev - 8.1649658).abs() < 1e-6, "std_dev = {std_dev}");
        assert_eq!(stats.max_time, at(2));
        assert_eq!(stats.min_time, at(0));
    }

    #[test]
    fn even_series_median_averages_middle_pair() {
        let series = temps(&[Some(15.0), Some(5.0)]);
        let stats = compute_statistics(&series, Metric::Temperature);
        assert_eq!(stats.median, Some(10.0));
        assert_eq!(stats.std_dev, Some(5.0));
    }

    #[test]
    fn missing_values_are_excluded_not_zeroed() {
        let series = temps(&[Some(4.0), None, Some(8.0)]);
        let stats = compute_statistics(&series, Metric::Temperature);
        assert_eq!(stats.avg, Some(6.0));
        assert_eq!(stats.min, Some(4.0));
    }

    #[test]
    fn extreme_times_use_first_match_in_series_order() {
        let series = temps(&[Some(1.0), Some(9.0), Some(9.0), Some(1.0)]);
        let stats = compute_statistics(&series, Metric::Temperature);
        assert_eq!(stats.max_time, at(1));
        assert_eq!(stats.min_time, at(0));
    }

    #[test]
    fn series_stats_cover_every_sensor_and_count_cycles() {
        let mut raw = BTreeMap::new();
        let mut readings = temps(&[Some(20.0), Some(22.0)]);
        readings[0].misting_status = Some(MistingStatus::On);
        readings[1].misting_status = Some(MistingStatus::Off);
        readings[1].humidity = Some(55.0);
        raw.insert("sensor1".to_string(), readings);
        raw.insert("average".to_string(), Vec::new());
        let series = HistoricalSeries::from_newest_first(raw);

        let stats = compute_series_stats(&series);
        assert_eq!(stats.len(), 2);
        let sensor1 = &stats["sensor1"];
        assert_eq!(sensor1.temperature.avg, Some(21.0));
        assert_eq!(sensor1.humidity.avg, Some(55.0));
        assert_eq!(sensor1.misting_cycles, 1);
        assert_eq!(sensor1.samples, 2);
        assert_eq!(stats["average"].temperature, DerivedStats::default());
    }
}
