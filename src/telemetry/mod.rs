//! # Telemetry Module
//!
//! Turns the raw PUBLISH stream into the two domains this tool actually
//! watches: pump activity logs and brightness readings with running
//! statistics.
//!
//! ## Module Architecture
//!
//! ```text
//! telemetry/
//! ├── classifier.rs       - Topic/payload routing rules
//! └── message_manager.rs  - Bounded logs, window statistics, snapshots
//! ```
//!
//! The classifier is a pure function over one message; the manager holds
//! the only mutable copy of the telemetry state and hands out snapshots.
//! Both logs keep the latest 50 entries in arrival order, and the
//! brightness aggregates are recomputed over that window on every append,
//! so the average slides with the window rather than converging on an
//! all-time mean.

pub mod classifier;
pub mod message_manager;

use chrono::{DateTime, Local};

use crate::mqtt::ConnectionState;

pub use classifier::{classify, Classified};
pub use message_manager::{
    BrightnessSample, BrightnessStats, MessageManager, PumpLogEntry, LOG_CAPACITY,
};

/// Read-only view of the engine state, published over a watch channel.
/// This is the only surface the presentation layer observes.
#[derive(Debug, Clone)]
pub struct TelemetrySnapshot {
    pub connection_state: ConnectionState,
    /// One-line status matching exactly one state at a time.
    pub status_text: String,
    pub pump_logs: Vec<PumpLogEntry>,
    pub brightness_logs: Vec<BrightnessSample>,
    /// Most recent brightness reading, if any arrived yet.
    pub current_brightness: Option<BrightnessSample>,
    /// Window aggregates; `None` until the first sample.
    pub stats: Option<BrightnessStats>,
    pub messages_received: usize,
    pub messages_sent: usize,
    pub last_activity: Option<DateTime<Local>>,
}

impl Default for TelemetrySnapshot {
    fn default() -> Self {
        let connection_state = ConnectionState::default();
        Self {
            status_text: connection_state.status_text(),
            connection_state,
            pump_logs: Vec::new(),
            brightness_logs: Vec::new(),
            current_brightness: None,
            stats: None,
            messages_received: 0,
            messages_sent: 0,
            last_activity: None,
        }
    }
}
