//! Telemetry buffers and running statistics.
//!
//! The manager is the single writer of the observable telemetry state: it
//! folds worker events into two bounded logs and the brightness window
//! statistics, and produces immutable snapshots for the outside world.

use std::collections::VecDeque;
use std::fmt;

use chrono::{DateTime, Local};
use serde::{Deserialize, Serialize};
use tracing::debug;

use super::classifier::{classify, Classified};
use super::TelemetrySnapshot;
use crate::mqtt::{ConnectionState, MqttEvent};

/// Retained entries per log; the oldest entry is evicted on overflow.
pub const LOG_CAPACITY: usize = 50;

/// One pump/device log line as received.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PumpLogEntry {
    pub timestamp: DateTime<Local>,
    pub topic: String,
    pub raw_message: String,
}

impl fmt::Display for PumpLogEntry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "[{}] {} {}",
            self.timestamp.format("%Y-%m-%d %H:%M:%S"),
            self.topic,
            self.raw_message
        )
    }
}

/// One parsed brightness reading.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BrightnessSample {
    pub timestamp: DateTime<Local>,
    pub brightness: f64,
    pub description: String,
}

impl fmt::Display for BrightnessSample {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "[{}] {:.2} ({})",
            self.timestamp.format("%Y-%m-%d %H:%M:%S"),
            self.brightness,
            self.description
        )
    }
}

/// Aggregates over the retained brightness window. The average is a
/// window average: it drifts as old samples are evicted, it is not an
/// all-time mean.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct BrightnessStats {
    pub min: f64,
    pub max: f64,
    pub average: f64,
}

impl BrightnessStats {
    /// Recomputes the aggregates from the retained window. Returns `None`
    /// for an empty window, so `min <= average <= max` holds whenever the
    /// stats exist at all.
    pub fn from_window<'a>(samples: impl Iterator<Item = &'a BrightnessSample>) -> Option<Self> {
        let mut count = 0usize;
        let mut min = f64::INFINITY;
        let mut max = f64::NEG_INFINITY;
        let mut sum = 0.0;
        for sample in samples {
            count += 1;
            min = min.min(sample.brightness);
            max = max.max(sample.brightness);
            sum += sample.brightness;
        }
        if count == 0 {
            return None;
        }
        Some(Self {
            min,
            max,
            average: sum / count as f64,
        })
    }
}

/// Insertion-ordered buffer holding the most recent [`LOG_CAPACITY`]
/// entries.
#[derive(Debug, Clone)]
pub struct BoundedLog<T> {
    entries: VecDeque<T>,
}

impl<T> BoundedLog<T> {
    pub fn new() -> Self {
        Self {
            entries: VecDeque::with_capacity(LOG_CAPACITY),
        }
    }

    pub fn push(&mut self, entry: T) {
        if self.entries.len() == LOG_CAPACITY {
            self.entries.pop_front();
        }
        self.entries.push_back(entry);
    }

    pub fn iter(&self) -> impl Iterator<Item = &T> {
        self.entries.iter()
    }

    pub fn last(&self) -> Option<&T> {
        self.entries.back()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

impl<T> Default for BoundedLog<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T: Clone> BoundedLog<T> {
    pub fn to_vec(&self) -> Vec<T> {
        self.entries.iter().cloned().collect()
    }
}

/// Folds worker events into the telemetry state. Owned by the aggregator
/// task; the presentation layer only ever sees cloned snapshots.
#[derive(Debug, Default)]
pub struct MessageManager {
    connection_state: ConnectionState,
    pump_logs: BoundedLog<PumpLogEntry>,
    brightness_logs: BoundedLog<BrightnessSample>,
    stats: Option<BrightnessStats>,
    messages_received: usize,
    messages_sent: usize,
    last_activity: Option<DateTime<Local>>,
}

impl MessageManager {
    pub fn new() -> Self {
        Self::default()
    }

    /// Applies one worker event in arrival order.
    pub fn apply(&mut self, event: MqttEvent) {
        match event {
            MqttEvent::StateChanged(state) => {
                self.connection_state = state;
            }
            MqttEvent::MessageReceived(message) => {
                self.messages_received += 1;
                self.last_activity = Some(message.received_at);
                match classify(&message) {
                    Classified::PumpLog(entry) => self.pump_logs.push(entry),
                    Classified::Brightness(sample) => self.record_sample(sample),
                    Classified::Unrecognized => {
                        debug!("unrecognized message on {} dropped", message.topic);
                    }
                }
            }
            MqttEvent::MessageSent => {
                self.messages_sent += 1;
                self.last_activity = Some(Local::now());
            }
        }
    }

    /// Appends a sample and recomputes the window aggregates.
    fn record_sample(&mut self, sample: BrightnessSample) {
        self.brightness_logs.push(sample);
        self.stats = BrightnessStats::from_window(self.brightness_logs.iter());
    }

    pub fn snapshot(&self) -> TelemetrySnapshot {
        TelemetrySnapshot {
            status_text: self.connection_state.status_text(),
            connection_state: self.connection_state.clone(),
            pump_logs: self.pump_logs.to_vec(),
            brightness_logs: self.brightness_logs.to_vec(),
            current_brightness: self.brightness_logs.last().cloned(),
            stats: self.stats,
            messages_received: self.messages_received,
            messages_sent: self.messages_sent,
            last_activity: self.last_activity,
        }
    }
}
