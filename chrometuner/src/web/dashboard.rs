//! Index page listing channels and live sessions.

use std::sync::Arc;

use axum::{
    extract::State,
    http::HeaderMap,
    response::Html,
};

use chrometuner_protocol::escape_xml;

use crate::web::state::AppState;

/// Serve the index page.
pub async fn index(State(state): State<Arc<AppState>>, headers: HeaderMap) -> Html<String> {
    let base_url = state.base_url(&headers);

    let mut channels = String::new();
    for channel in state.lineup.sorted_by_number() {
        let url = channel.stream_url(&base_url);
        channels.push_str(&format!(
            "<tr><td>{}</td><td>{}</td><td><a href=\"{url}\">{url}</a></td></tr>\n",
            escape_xml(&channel.number),
            escape_xml(&channel.name),
            url = escape_xml(&url),
        ));
    }

    let mut sessions = String::new();
    for session in state.sessions.get_all().await {
        sessions.push_str(&format!(
            "<tr><td>{}</td><td>{}</td><td>{}</td><td>{}</td><td>{}s</td></tr>\n",
            session.id,
            escape_xml(session.client.as_deref().unwrap_or("-")),
            escape_xml(&session.target),
            session.state,
            session.connected_seconds(),
        ));
    }
    if sessions.is_empty() {
        sessions.push_str("<tr><td colspan=\"5\">No active streams</td></tr>\n");
    }

    Html(format!(
        r#"<!DOCTYPE html>
<html lang="en">
<head>
    <meta charset="UTF-8">
    <title>{name}</title>
    <style>
        body {{ font-family: -apple-system, BlinkMacSystemFont, "Segoe UI", Roboto, sans-serif; margin: 24px; color: #333; }}
        table {{ border-collapse: collapse; margin-bottom: 24px; }}
        th, td {{ border: 1px solid #ddd; padding: 6px 12px; text-align: left; }}
        th {{ background: #f3f3f8; }}
        .subtitle {{ color: #666; font-size: 13px; }}
    </style>
</head>
<body>
    <h1>{name}</h1>
    <p class="subtitle">Device {device_id} &middot; {active}/{capacity} tuners in use &middot;
        <a href="{base}/discover.json">discover.json</a> &middot;
        <a href="{base}/lineup.json">lineup.json</a> &middot;
        <a href="{base}/playlist.m3u">playlist.m3u</a></p>
    <h2>Active streams</h2>
    <table>
        <tr><th>Session</th><th>Client</th><th>Target</th><th>State</th><th>Age</th></tr>
{sessions}    </table>
    <h2>Channels</h2>
    <table>
        <tr><th>Number</th><th>Name</th><th>Stream</th></tr>
{channels}    </table>
</body>
</html>
"#,
        name = escape_xml(&state.identity.friendly_name),
        device_id = escape_xml(&state.identity.device_id),
        active = state.admission.active(),
        capacity = state.admission.capacity(),
        base = escape_xml(&base_url),
        sessions = sessions,
        channels = channels,
    ))
}
