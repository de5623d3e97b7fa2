//! Query client for the brightness history HTTP endpoint.
//!
//! The logger service next to the broker stores every brightness sample
//! and serves the recent window as JSON under `/brightness/{minutes}`.
//! This is a plain request/response client, deliberately outside the MQTT
//! protocol core: no retries, no streaming, one typed response.

use serde::Deserialize;
use thiserror::Error;
use tracing::debug;

/// Port the history service listens on next to the broker.
pub const DEFAULT_HISTORY_PORT: u16 = 4567;

#[derive(Debug, Error)]
pub enum HistoryError {
    #[error("history request failed: {0}")]
    Request(#[from] reqwest::Error),
}

/// Response envelope of `GET /brightness/{minutes}`.
#[derive(Debug, Clone, Deserialize)]
pub struct BrightnessHistory {
    pub status: String,
    pub count: usize,
    pub time_range: Option<TimeRange>,
    pub data: Vec<BrightnessRecord>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct TimeRange {
    pub start: String,
    pub end: String,
    pub minutes: u32,
}

/// One stored sample as the service returns it.
#[derive(Debug, Clone, Deserialize)]
pub struct BrightnessRecord {
    pub id: String,
    pub topic: String,
    pub brightness: f64,
    pub timestamp: String,
    pub received_at: String,
}

pub struct HistoryClient {
    base_url: String,
    http: reqwest::Client,
}

impl HistoryClient {
    pub fn new(base_url: impl Into<String>) -> Self {
        Self {
            base_url: base_url.into(),
            http: reqwest::Client::new(),
        }
    }

    /// Convenience constructor pointing at the history service on the
    /// broker host.
    pub fn for_host(host: &str) -> Self {
        Self::new(format!("http://{}:{}", host, DEFAULT_HISTORY_PORT))
    }

    /// Fetches the samples of the last `minutes` minutes, oldest first.
    /// Records whose timestamp does not parse are dropped.
    pub async fn fetch(&self, minutes: u32) -> Result<BrightnessHistory, HistoryError> {
        let url = format!("{}/brightness/{}", self.base_url, minutes);
        debug!("fetching brightness history: {}", url);

        let response = self.http.get(&url).send().await?.error_for_status()?;
        let history: BrightnessHistory = response.json().await?;
        Ok(normalize(history))
    }
}

/// Sorts the records by parsed timestamp ascending and drops the ones
/// with unparseable timestamps, mirroring how the charts consume them.
fn normalize(mut history: BrightnessHistory) -> BrightnessHistory {
    let mut parsed: Vec<(chrono::DateTime<chrono::FixedOffset>, BrightnessRecord)> = history
        .data
        .drain(..)
        .filter_map(|record| {
            chrono::DateTime::parse_from_rfc3339(&record.timestamp)
                .ok()
                .map(|ts| (ts, record))
        })
        .collect();
    parsed.sort_by_key(|(ts, _)| *ts);
    history.data = parsed.into_iter().map(|(_, record)| record).collect();
    history
}

#[cfg(test)]
mod tests {
    use super::*;

    const SAMPLE_RESPONSE: &str = r#"{
        "status": "ok",
        "count": 3,
        "time_range": {
            "start": "2025-10-26T06:00:00+09:00",
            "end": "2025-10-26T12:00:00+09:00",
            "minutes": 360
        },
        "data": [
            {
                "id": "b2",
                "topic": "env/1/brightness",
                "brightness": 512.0,
                "timestamp": "2025-10-26T11:00:00+09:00",
                "received_at": "2025-10-26T11:00:01+09:00"
            },
            {
                "id": "b1",
                "topic": "env/1/brightness",
                "brightness": 120.5,
                "timestamp": "2025-10-26T09:30:00+09:00",
                "received_at": "2025-10-26T09:30:01+09:00"
            },
            {
                "id": "broken",
                "topic": "env/1/brightness",
                "brightness": 1.0,
                "timestamp": "yesterday-ish",
                "received_at": "2025-10-26T10:00:00+09:00"
            }
        ]
    }"#;

    #[test]
    fn response_parses_and_normalizes() {
        let history: BrightnessHistory = serde_json::from_str(SAMPLE_RESPONSE).unwrap();
        assert_eq!(history.status, "ok");
        assert_eq!(history.count, 3);
        assert_eq!(history.time_range.as_ref().unwrap().minutes, 360);

        let history = normalize(history);
        // Unparseable timestamp dropped, remainder oldest first.
        assert_eq!(history.data.len(), 2);
        assert_eq!(history.data[0].id, "b1");
        assert_eq!(history.data[1].id, "b2");
    }

    #[test]
    fn missing_time_range_is_accepted() {
        let history: BrightnessHistory =
            serde_json::from_str(r#"{"status":"ok","count":0,"data":[]}"#).unwrap();
        assert!(history.time_range.is_none());
        assert!(history.data.is_empty());
    }

    #[test]
    fn for_host_builds_the_service_url() {
        let client = HistoryClient::for_host("192.168.1.34");
        assert_eq!(client.base_url, "http://192.168.1.34:4567");
    }
}
