//! Channel lineup and HDHomeRun-compatible discovery types.

use std::cmp::Ordering;
use std::collections::HashMap;

use serde::{Deserialize, Serialize};

use crate::error::ProtocolError;

/// Manufacturer string DVR clients expect from an HDHomeRun device.
pub const MANUFACTURER: &str = "Silicondust";

/// Model number advertised in discovery documents.
pub const MODEL_NUMBER: &str = "HDTC-2US";

/// Firmware name advertised in discovery documents.
pub const FIRMWARE_NAME: &str = "hdhomeruntc_atsc";

/// Firmware version advertised in discovery documents.
pub const FIRMWARE_VERSION: &str = "20170930";

/// Device auth token. DVR clients only check that it is present.
pub const DEVICE_AUTH: &str = "chrometuner";

/// A channel presented by the virtual tuner.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Channel {
    /// Lookup key used in `/stream/:key`.
    pub key: String,
    /// Display name shown in the DVR guide.
    pub name: String,
    /// Guide number (e.g. `"1001"` or `"7.1"`).
    pub number: String,
    /// Page that renders the channel grid or player.
    pub url: String,
    /// Fragment matched against tile image sources on the page.
    pub slug: String,
}

impl Channel {
    /// Create a new channel.
    pub fn new(
        key: impl Into<String>,
        name: impl Into<String>,
        number: impl Into<String>,
        url: impl Into<String>,
        slug: impl Into<String>,
    ) -> Self {
        Self {
            key: key.into(),
            name: name.into(),
            number: number.into(),
            url: url.into(),
            slug: slug.into(),
        }
    }

    /// Stream URL for this channel relative to the given base URL.
    pub fn stream_url(&self, base_url: &str) -> String {
        format!("{}/stream/{}", base_url.trim_end_matches('/'), self.key)
    }
}

/// Compare two guide numbers the way DVR guides order them.
///
/// Dotted components compare numerically when both sides are numeric, so
/// `"9"` sorts before `"10"` and `"7.2"` before `"7.10"`.
pub fn compare_guide_numbers(a: &str, b: &str) -> Ordering {
    let mut left = a.split('.');
    let mut right = b.split('.');
    loop {
        match (left.next(), right.next()) {
            (None, None) => return Ordering::Equal,
            (None, Some(_)) => return Ordering::Less,
            (Some(_), None) => return Ordering::Greater,
            (Some(l), Some(r)) => {
                let ord = match (l.trim().parse::<u64>(), r.trim().parse::<u64>()) {
                    (Ok(ln), Ok(rn)) => ln.cmp(&rn),
                    _ => l.cmp(r),
                };
                if ord != Ordering::Equal {
                    return ord;
                }
            }
        }
    }
}

/// Ordered, validated set of channels keyed by `Channel::key`.
///
/// Iteration order is declaration order; use [`Lineup::sorted_by_number`]
/// for guide order.
#[derive(Debug, Clone, Default)]
pub struct Lineup {
    channels: Vec<Channel>,
    index: HashMap<String, usize>,
}

impl Lineup {
    /// Build a lineup, rejecting empty or duplicate keys and duplicate numbers.
    pub fn new(channels: Vec<Channel>) -> Result<Self, ProtocolError> {
        let mut index = HashMap::with_capacity(channels.len());
        let mut numbers: HashMap<&str, &str> = HashMap::with_capacity(channels.len());

        for (i, channel) in channels.iter().enumerate() {
            if channel.key.trim().is_empty() {
                return Err(ProtocolError::EmptyKey(i));
            }
            if channel.url.trim().is_empty() {
                return Err(ProtocolError::InvalidChannel {
                    key: channel.key.clone(),
                    reason: "missing url".to_string(),
                });
            }
            if index.insert(channel.key.clone(), i).is_some() {
                return Err(ProtocolError::DuplicateKey(channel.key.clone()));
            }
            if let Some(first) = numbers.insert(channel.number.as_str(), channel.key.as_str()) {
                return Err(ProtocolError::DuplicateNumber {
                    number: channel.number.clone(),
                    first: first.to_string(),
                    second: channel.key.clone(),
                });
            }
        }

        Ok(Self { channels, index })
    }

    /// Look up a channel by key.
    pub fn get(&self, key: &str) -> Option<&Channel> {
        self.index.get(key).map(|&i| &self.channels[i])
    }

    /// Channels in declaration order.
    pub fn channels(&self) -> &[Channel] {
        &self.channels
    }

    /// Channel keys in declaration order.
    pub fn keys(&self) -> impl Iterator<Item = &str> {
        self.channels.iter().map(|c| c.key.as_str())
    }

    /// Channels ordered ascending by guide number.
    pub fn sorted_by_number(&self) -> Vec<&Channel> {
        let mut sorted: Vec<&Channel> = self.channels.iter().collect();
        sorted.sort_by(|a, b| compare_guide_numbers(&a.number, &b.number));
        sorted
    }

    pub fn len(&self) -> usize {
        self.channels.len()
    }

    pub fn is_empty(&self) -> bool {
        self.channels.is_empty()
    }
}

/// Identity of the virtual tuner device.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeviceIdentity {
    /// Name shown by DVR software.
    pub friendly_name: String,
    /// Eight hex digit device ID.
    pub device_id: String,
    /// Number of tuners advertised (the admission capacity).
    pub tuner_count: usize,
}

impl DeviceIdentity {
    /// Build the `/discover.json` document for the given base URL.
    pub fn discover(&self, base_url: &str) -> DiscoverResponse {
        let base_url = base_url.trim_end_matches('/').to_string();
        DiscoverResponse {
            friendly_name: self.friendly_name.clone(),
            manufacturer: MANUFACTURER.to_string(),
            model_number: MODEL_NUMBER.to_string(),
            firmware_name: FIRMWARE_NAME.to_string(),
            firmware_version: FIRMWARE_VERSION.to_string(),
            tuner_count: self.tuner_count,
            device_id: self.device_id.clone(),
            device_auth: DEVICE_AUTH.to_string(),
            lineup_url: format!("{}/lineup.json", base_url),
            base_url,
        }
    }
}

/// `/discover.json` response body.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct DiscoverResponse {
    pub friendly_name: String,
    pub manufacturer: String,
    pub model_number: String,
    pub firmware_name: String,
    pub firmware_version: String,
    pub tuner_count: usize,
    #[serde(rename = "DeviceID")]
    pub device_id: String,
    pub device_auth: String,
    #[serde(rename = "BaseURL")]
    pub base_url: String,
    #[serde(rename = "LineupURL")]
    pub lineup_url: String,
}

/// One `/lineup.json` item.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct LineupEntry {
    pub guide_number: String,
    pub guide_name: String,
    #[serde(rename = "URL")]
    pub url: String,
}

impl LineupEntry {
    pub fn for_channel(channel: &Channel, base_url: &str) -> Self {
        Self {
            guide_number: channel.number.clone(),
            guide_name: channel.name.clone(),
            url: channel.stream_url(base_url),
        }
    }
}

/// Build the `/lineup.json` body in lineup order.
pub fn lineup_entries(lineup: &Lineup, base_url: &str) -> Vec<LineupEntry> {
    lineup
        .channels()
        .iter()
        .map(|c| LineupEntry::for_channel(c, base_url))
        .collect()
}

/// `/lineup_status.json` response body.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct LineupStatus {
    pub scan_in_progress: u8,
    pub scan_possible: u8,
    pub source: String,
    pub source_list: Vec<String>,
}

impl Default for LineupStatus {
    fn default() -> Self {
        Self {
            scan_in_progress: 0,
            scan_possible: 1,
            source: "Cable".to_string(),
            source_list: vec!["Cable".to_string()],
        }
    }
}

/// `/status.json` response body.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct StreamStatus {
    pub active_streams: usize,
    pub max_streams: usize,
}
