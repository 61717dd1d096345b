//! # Piccolo Client
//!
//! Host-side clients for Piccolo instrument servers.
//!
//! ## Overview
//!
//! A Piccolo server exposes four TCP services. This crate provides one client role for
//! each of them, every role being a persistent connection served by a background thread:
//!
//! - **[`streaming::BufferStreamClient`]**: requests raw two-channel sample buffers
//! - **[`streaming::StateStreamClient`]**: receives register snapshots pushed by the server
//! - **[`command::CommandClient`]**: sends queued register writes in FIFO order
//! - **[`command::ControlClient`]**: sends the shutdown command once
//!
//! [`instrument::Instrument`] composes the roles of one device, converts register values to
//! physical units using a [`calibration::Calibration`] and records recent events in a
//! [`history::History`].
//!
//! For details of the wire format, see the [`piccolo_protocol`] crate.
//!
//! ## Basic Usage
//!
//! ```ignore
//! use piccolo_client::{ClientConfig, command::CommandClient};
//!
//! let config = ClientConfig::default();
//! let mut commands = CommandClient::new("192.168.1.100:5003".parse()?, &config);
//! commands.enqueue("low_intensity_thresh[0]", 1234i64);
//! commands.start()?;
//! ```
//!
//! ## Failure Handling
//!
//! A receive or send error ends the worker of that role and releases its socket; the
//! other roles keep running. Only the command client outlives write timeouts.
use std::time::Duration;

use piccolo_protocol::{DEFAULT_MAX_PAYLOAD_LEN, DEFAULT_SAMPLES_PER_CHANNEL, Ports};

pub mod calibration;
pub mod command;
pub mod error;
pub mod history;
pub mod instrument;
pub mod session;
pub mod streaming;

/// Settings shared by all clients of one instrument.
#[derive(Clone, Debug, PartialEq)]
pub struct ClientConfig {
    pub ports: Ports,
    /// Applies to connecting, and to every single read and write.
    pub timeout: Duration,
    /// Cadence at which queued register writes are sent.
    pub poll_interval: Duration,
    /// Must match the buffer length of the server.
    pub samples_per_channel: usize,
    pub max_payload_len: usize,
    /// Register identifying the current event; a row is recorded once two consecutive
    /// snapshots agree on it and it is greater than the last recorded id.
    pub event_id_register: String,
    pub history_capacity: usize,
}

impl Default for ClientConfig {
    fn default() -> Self {
        ClientConfig {
            ports: Ports::default(),
            timeout: Duration::from_secs(5),
            poll_interval: Duration::from_millis(100),
            samples_per_channel: DEFAULT_SAMPLES_PER_CHANNEL,
            max_payload_len: DEFAULT_MAX_PAYLOAD_LEN,
            event_id_register: "droplet_id".to_string(),
            history_capacity: history::DEFAULT_CAPACITY,
        }
    }
}
