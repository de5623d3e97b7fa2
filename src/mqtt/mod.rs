//! # MQTT Protocol Module
//!
//! Implements the MQTT 3.1.1 subset pumpwatch speaks with the pump
//! controller's broker, from raw bytes up to the connection lifecycle.
//! No MQTT crate is involved: the wire format the device firmware expects
//! is narrow enough that the packets are built and parsed by hand.
//!
//! ## Why This Module Exists
//!
//! The pump controller publishes its system log and environment readings
//! over plain MQTT, and accepts retained configuration values the same
//! way. This module keeps one persistent session to that broker alive:
//! - CONNECT/CONNACK handshake with optional credentials
//! - QoS 0 subscriptions to the device log and environment wildcards
//! - Streaming PUBLISH reception for the telemetry layer
//! - Outgoing retained publishes for device configuration
//! - Bounded reconnection with a fixed delay after transport failures
//!
//! ## Module Architecture
//!
//! The protocol stack is organized into four focused submodules:
//!
//! ```text
//! mqtt/
//! ├── codec.rs         - Pure packet encoding/decoding, no I/O
//! ├── frame_reader.rs  - Byte stream -> complete frames
//! ├── connection.rs    - Pure lifecycle state machine
//! └── mqtt_handler.rs  - Worker task owning the transport
//! ```
//!
//! ## Design Philosophy
//!
//! - **Pure core, impure shell**: packet layout and lifecycle rules live
//!   in functions that never touch a socket, so the protocol behavior is
//!   tested without a broker
//! - **One owner**: a single worker task holds the transport and the
//!   state value; everything else observes through channels
//! - **Tolerant reader**: frames the client does not act on (SUBACK,
//!   PINGRESP) are ignored, never treated as errors
//! - **Known limitations kept on purpose**: single-byte remaining length,
//!   fire-and-forget subscriptions; both are properties of the original
//!   installation this tool monitors

pub mod codec;
pub mod connection;
pub mod frame_reader;
pub mod mqtt_handler;

pub use connection::{ConnectionState, FailureReason};
pub use mqtt_handler::{MqttError, MqttEvent, MqttHandle, PublishMessage};
