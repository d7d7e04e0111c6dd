//! Virtual tuner definitions for chrometuner.
//!
//! This crate defines the channel lineup and the subset of the HDHomeRun
//! HTTP surface that DVR software uses to discover a network tuner and
//! enumerate its channels.
//!
//! # Example
//!
//! ```rust
//! use chrometuner_protocol::{Channel, DeviceIdentity, Lineup, lineup_entries, m3u_playlist};
//!
//! let lineup = Lineup::new(vec![
//!     Channel::new("espn", "ESPN", "1001", "https://example.com/guide", "espn"),
//! ])
//! .unwrap();
//!
//! let identity = DeviceIdentity {
//!     friendly_name: "chrometuner".to_string(),
//!     device_id: "12345678".to_string(),
//!     tuner_count: 2,
//! };
//!
//! let discover = identity.discover("http://127.0.0.1:5589");
//! assert_eq!(discover.lineup_url, "http://127.0.0.1:5589/lineup.json");
//!
//! let entries = lineup_entries(&lineup, "http://127.0.0.1:5589");
//! assert_eq!(entries[0].url, "http://127.0.0.1:5589/stream/espn");
//!
//! assert!(m3u_playlist(&lineup, "http://127.0.0.1:5589").starts_with("#EXTM3U"));
//! ```

pub mod error;
pub mod render;
pub mod types;

pub use error::ProtocolError;
pub use render::{device_xml, escape_xml, m3u_playlist};
pub use types::{
    compare_guide_numbers, lineup_entries, Channel, DeviceIdentity, DiscoverResponse, Lineup,
    LineupEntry, LineupStatus, StreamStatus, DEVICE_AUTH, FIRMWARE_NAME, FIRMWARE_VERSION,
    MANUFACTURER, MODEL_NUMBER,
};
