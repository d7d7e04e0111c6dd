//! Channel lineup: the built-in default and configured channels.

use chrometuner_protocol::{Channel, Lineup, ProtocolError};

use crate::config::ChannelSection;

/// Grid guide page the built-in channels are selected from.
pub const DEFAULT_GUIDE_URL: &str = "https://watch.sling.com/dashboard/grid_guide/grid_guide_a_z";

/// Built-in channels: (key, name, number, slug).
const BUILTIN_CHANNELS: &[(&str, &str, &str, &str)] = &[
    ("espn", "ESPN", "1001", "/espn."),
    ("espn2", "ESPN2", "1002", "/espn2."),
    ("cnn", "CNN", "1003", "/cnn."),
    ("foxnews", "Fox News", "1004", "/foxnews."),
    ("tnt", "TNT", "1005", "/tnt."),
    ("tbs", "TBS", "1006", "/tbs."),
    ("hgtv", "HGTV", "1007", "/hgtv."),
    ("food", "Food Network", "1008", "/foodnetwork."),
];

/// The lineup used when no channels are configured.
pub fn builtin_lineup() -> Lineup {
    let channels = BUILTIN_CHANNELS
        .iter()
        .map(|&(key, name, number, slug)| Channel::new(key, name, number, DEFAULT_GUIDE_URL, slug))
        .collect();
    // Built-in keys and numbers are unique.
    Lineup::new(channels).unwrap_or_default()
}

/// Build the lineup from `[[channels]]` entries, or the built-in one if there are none.
pub fn lineup_from_config(entries: &[ChannelSection]) -> Result<Lineup, ProtocolError> {
    if entries.is_empty() {
        return Ok(builtin_lineup());
    }

    let channels = entries
        .iter()
        .map(|entry| {
            Channel::new(
                entry.key.clone(),
                entry.name.clone().unwrap_or_else(|| entry.key.clone()),
                entry.number.clone(),
                entry
                    .url
                    .clone()
                    .unwrap_or_else(|| DEFAULT_GUIDE_URL.to_string()),
                entry.slug.clone().unwrap_or_else(|| entry.key.clone()),
            )
        })
        .collect();
    Lineup::new(channels)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_builtin_lineup() {
        let lineup = builtin_lineup();
        assert_eq!(lineup.len(), BUILTIN_CHANNELS.len());
        assert_eq!(lineup.get("espn").unwrap().url, DEFAULT_GUIDE_URL);
    }

    #[test]
    fn test_config_lineup_defaults() {
        let entries = vec![ChannelSection {
            key: "nbc".to_string(),
            number: "4".to_string(),
            name: None,
            url: Some("https://example.com/live".to_string()),
            slug: None,
        }];
        let lineup = lineup_from_config(&entries).unwrap();
        let nbc = lineup.get("nbc").unwrap();

        assert_eq!(lineup.len(), 1);
        assert_eq!(nbc.name, "nbc");
        assert_eq!(nbc.slug, "nbc");
        assert_eq!(nbc.url, "https://example.com/live");
    }

    #[test]
    fn test_empty_config_uses_builtin() {
        assert_eq!(lineup_from_config(&[]).unwrap().len(), builtin_lineup().len());
    }
}
