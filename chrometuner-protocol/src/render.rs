//! Text renderings of the tuner surface: UPnP device description and M3U playlist.

use crate::types::{DeviceIdentity, Lineup, MANUFACTURER, MODEL_NUMBER};

/// Escape the five XML special characters.
pub fn escape_xml(input: &str) -> String {
    let mut out = String::with_capacity(input.len());
    for c in input.chars() {
        match c {
            '&' => out.push_str("&amp;"),
            '<' => out.push_str("&lt;"),
            '>' => out.push_str("&gt;"),
            '"' => out.push_str("&quot;"),
            '\'' => out.push_str("&apos;"),
            _ => out.push(c),
        }
    }
    out
}

/// Render the `/device.xml` discovery document.
pub fn device_xml(identity: &DeviceIdentity, base_url: &str) -> String {
    let base_url = escape_xml(base_url.trim_end_matches('/'));
    format!(
        r#"<?xml version="1.0" encoding="UTF-8"?>
<root xmlns="urn:schemas-upnp-org:device-1-0">
  <specVersion>
    <major>1</major>
    <minor>0</minor>
  </specVersion>
  <URLBase>{base_url}</URLBase>
  <device>
    <deviceType>urn:schemas-upnp-org:device:MediaServer:1</deviceType>
    <friendlyName>{name}</friendlyName>
    <manufacturer>{manufacturer}</manufacturer>
    <modelName>{model}</modelName>
    <modelNumber>{model}</modelNumber>
    <serialNumber>{device_id}</serialNumber>
    <UDN>uuid:{device_id}</UDN>
  </device>
</root>
"#,
        base_url = base_url,
        name = escape_xml(&identity.friendly_name),
        manufacturer = MANUFACTURER,
        model = MODEL_NUMBER,
        device_id = escape_xml(&identity.device_id),
    )
}

/// Render the lineup as an extended M3U playlist, sorted by guide number.
pub fn m3u_playlist(lineup: &Lineup, base_url: &str) -> String {
    let mut out = String::from("#EXTM3U\n");
    for channel in lineup.sorted_by_number() {
        let name = channel.name.replace(',', " ");
        out.push_str(&format!(
            "#EXTINF:-1 channel-id=\"{key}\" channel-number=\"{number}\" tvg-chno=\"{number}\" tvg-name=\"{name}\",{name}\n",
            key = channel.key,
            number = channel.number,
            name = name,
        ));
        out.push_str(&channel.stream_url(base_url));
        out.push('\n');
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::Channel;

    #[test]
    fn test_escape_xml() {
        assert_eq!(escape_xml("A&B <\"x\">"), "A&amp;B &lt;&quot;x&quot;&gt;");
    }

    #[test]
    fn test_device_xml_contains_identity() {
        let identity = DeviceIdentity {
            friendly_name: "Den & Kitchen".to_string(),
            device_id: "CAFE0001".to_string(),
            tuner_count: 2,
        };
        let xml = device_xml(&identity, "http://192.168.1.2:5589/");

        assert!(xml.contains("<URLBase>http://192.168.1.2:5589</URLBase>"));
        assert!(xml.contains("<friendlyName>Den &amp; Kitchen</friendlyName>"));
        assert!(xml.contains("<UDN>uuid:CAFE0001</UDN>"));
    }

    #[test]
    fn test_m3u_sorted_by_number() {
        let lineup = Lineup::new(vec![
            Channel::new("cnn", "CNN", "120", "https://example.com", "cnn"),
            Channel::new("espn", "ESPN", "20", "https://example.com", "espn"),
            Channel::new("nbc", "NBC, East", "100", "https://example.com", "nbc"),
        ])
        .unwrap();

        let m3u = m3u_playlist(&lineup, "http://host:5589");
        let lines: Vec<&str> = m3u.lines().collect();

        assert_eq!(lines[0], "#EXTM3U");
        assert_eq!(lines.len(), 7);
        assert!(lines[1].contains("tvg-chno=\"20\""));
        assert_eq!(lines[2], "http://host:5589/stream/espn");
        assert!(lines[3].ends_with(",NBC  East"));
        assert_eq!(lines[6], "http://host:5589/stream/cnn");
    }
}
