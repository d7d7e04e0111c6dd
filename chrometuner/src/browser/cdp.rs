//! [`CapturePage`] over a chromiumoxide page.

use std::io;

use async_trait::async_trait;
use base64::engine::general_purpose::STANDARD;
use base64::Engine;
use bytes::Bytes;
use chromiumoxide::cdp::browser_protocol::browser::{
    Bounds, GetWindowForTargetParams, SetWindowBoundsParams, WindowState,
};
use chromiumoxide::cdp::browser_protocol::input::{
    DispatchMouseEventParams, DispatchMouseEventType, MouseButton,
};
use chromiumoxide::cdp::browser_protocol::page::{
    AddScriptToEvaluateOnNewDocumentParams, SetBypassCspParams,
};
use chromiumoxide::cdp::js_protocol::runtime::{
    AddBindingParams, EvaluateParams, EventBindingCalled,
};
use chromiumoxide::error::CdpError;
use chromiumoxide::Page;
use futures::StreamExt;
use log::{debug, warn};
use serde::de::DeserializeOwned;
use serde::Deserialize;
use tokio::sync::mpsc;

use super::capture::{CaptureConstraints, CaptureGeometry, CaptureHandle, CaptureStream};
use super::dom::{Point, TargetRef, TileCandidate, VideoState, VisibleBox};
use super::{BrowserError, CapturePage, PageId};

/// Name of the binding the recorder uses to hand chunks back.
const CAPTURE_BINDING: &str = "__chrometunerChunk";

/// Chunks buffered between the page and the session before backpressure.
const CAPTURE_BUFFER: usize = 256;

impl From<CdpError> for BrowserError {
    fn from(e: CdpError) -> Self {
        match e {
            CdpError::ChannelSendError(_) => BrowserError::Disconnected,
            other => BrowserError::Cdp(other.to_string()),
        }
    }
}

/// A page of the shared browser.
pub struct CdpPage {
    id: PageId,
    page: Page,
}

impl CdpPage {
    pub fn new(id: PageId, page: Page) -> Self {
        Self { id, page }
    }

    /// Evaluate an expression with a user gesture and deserialize its result.
    async fn eval<T: DeserializeOwned>(&self, expression: String) -> Result<T, BrowserError> {
        let params = EvaluateParams::builder()
            .expression(expression)
            .await_promise(true)
            .return_by_value(true)
            .user_gesture(true)
            .build()
            .map_err(BrowserError::Script)?;
        let result = self.page.evaluate(params).await?;
        result
            .into_value()
            .map_err(|e| BrowserError::Script(e.to_string()))
    }

    async fn set_window_bounds(&self, bounds: Bounds) -> Result<(), BrowserError> {
        let window = self
            .page
            .execute(
                GetWindowForTargetParams::builder()
                    .target_id(self.page.target_id().clone())
                    .build(),
            )
            .await?;
        self.page
            .execute(SetWindowBoundsParams::new(window.window_id.clone(), bounds))
            .await?;
        Ok(())
    }

    async fn mouse(&self, kind: DispatchMouseEventType, point: Point) -> Result<(), BrowserError> {
        let params = DispatchMouseEventParams::builder()
            .r#type(kind)
            .x(point.x)
            .y(point.y)
            .button(MouseButton::Left)
            .click_count(1)
            .build()
            .map_err(BrowserError::Cdp)?;
        self.page.execute(params).await?;
        Ok(())
    }
}

/// Reply of the capture start script.
#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct CaptureStarted {
    #[serde(default)]
    mime_type: Option<String>,
    #[serde(default)]
    error: Option<String>,
}

/// Reply of scripts that may find nothing.
#[derive(Debug, Deserialize)]
struct Found<T> {
    found: bool,
    #[serde(default = "Option::default")]
    value: Option<T>,
}

impl<T> Found<T> {
    fn into_option(self) -> Option<T> {
        if self.found {
            self.value
        } else {
            None
        }
    }
}

/// One binding payload decoded into a chunk or a terminal error.
fn decode_payload(payload: &str) -> Option<io::Result<Bytes>> {
    if let Some(data) = payload.strip_prefix('d') {
        return match STANDARD.decode(data) {
            Ok(bytes) if bytes.is_empty() => None,
            Ok(bytes) => Some(Ok(Bytes::from(bytes))),
            Err(e) => Some(Err(io::Error::new(io::ErrorKind::InvalidData, e))),
        };
    }
    let message = payload.strip_prefix('e').unwrap_or(payload);
    Some(Err(io::Error::new(io::ErrorKind::Other, message.to_string())))
}

#[async_trait]
impl CapturePage for CdpPage {
    fn id(&self) -> PageId {
        self.id
    }

    async fn harden(&self, stylesheet: &str) -> Result<(), BrowserError> {
        self.page.execute(SetBypassCspParams::new(true)).await?;
        self.page
            .execute(AddScriptToEvaluateOnNewDocumentParams::new(
                scripts::inject_stylesheet(stylesheet),
            ))
            .await?;
        Ok(())
    }

    async fn navigate(&self, url: &str) -> Result<(), BrowserError> {
        self.page.goto(url).await?;
        Ok(())
    }

    async fn apply_geometry(&self, geometry: &CaptureGeometry) -> Result<(), BrowserError> {
        let bounds = Bounds::builder()
            .width(i64::from(geometry.window_width))
            .height(i64::from(geometry.window_height))
            .window_state(WindowState::Normal)
            .build();
        self.set_window_bounds(bounds).await?;
        let _: bool = self.eval(scripts::set_zoom(geometry.zoom)).await?;
        Ok(())
    }

    async fn start_capture(
        &self,
        constraints: &CaptureConstraints,
    ) -> Result<CaptureStream, BrowserError> {
        self.page.execute(AddBindingParams::new(CAPTURE_BINDING)).await?;
        // Subscribe before starting so the first (header) chunk is not missed.
        let mut events = self.page.event_listener::<EventBindingCalled>().await?;

        let started: CaptureStarted = self
            .eval(scripts::start_capture(constraints, CAPTURE_BINDING))
            .await?;
        if let Some(error) = started.error {
            return Err(BrowserError::Script(error));
        }
        let mime_type = started.mime_type.unwrap_or_default();
        debug!("[{}] Capture started ({})", self.id, mime_type);

        let (tx, rx) = mpsc::channel(CAPTURE_BUFFER);
        let page_id = self.id;
        let task = tokio::spawn(async move {
            while let Some(event) = events.next().await {
                if event.name != CAPTURE_BINDING {
                    continue;
                }
                let Some(item) = decode_payload(&event.payload) else {
                    continue;
                };
                let terminal = item.is_err();
                if tx.send(item).await.is_err() || terminal {
                    break;
                }
            }
            debug!("[{}] Capture forwarder finished", page_id);
        });

        Ok(CaptureStream::new(mime_type, rx, CaptureHandle::new(task)))
    }

    async fn slug_image_present(&self, slug: &str) -> Result<bool, BrowserError> {
        self.eval(scripts::slug_image_present(slug)).await
    }

    async fn tile_candidates(&self, slug: &str) -> Result<Vec<TileCandidate>, BrowserError> {
        self.eval(scripts::tile_candidates(slug)).await
    }

    async fn reveal_target(
        &self,
        slug: &str,
        target: TargetRef,
    ) -> Result<Option<VisibleBox>, BrowserError> {
        let found: Found<VisibleBox> = self.eval(scripts::reveal_target(slug, target)).await?;
        Ok(found.into_option())
    }

    async fn click(&self, point: Point) -> Result<(), BrowserError> {
        self.mouse(DispatchMouseEventType::MouseMoved, point).await?;
        self.mouse(DispatchMouseEventType::MousePressed, point).await?;
        self.mouse(DispatchMouseEventType::MouseReleased, point).await
    }

    async fn video_state(&self) -> Result<Option<VideoState>, BrowserError> {
        let found: Found<VideoState> = self.eval(scripts::video_state()).await?;
        Ok(found.into_option())
    }

    async fn enter_fullscreen(&self) -> Result<(), BrowserError> {
        let entered: bool = self.eval(scripts::enter_fullscreen()).await?;
        if !entered {
            warn!("[{}] Fullscreen request was refused", self.id);
        }
        Ok(())
    }

    async fn minimize_window(&self) -> Result<(), BrowserError> {
        let bounds = Bounds::builder()
            .window_state(WindowState::Minimized)
            .build();
        self.set_window_bounds(bounds).await
    }

    async fn close(&self) -> Result<(), BrowserError> {
        self.page.clone().close().await?;
        Ok(())
    }
}

/// Page scripts. Every script evaluates to a JSON-serializable value.
mod scripts {
    use super::super::capture::CaptureConstraints;
    use super::super::dom::TargetRef;

    /// JSON string literal for embedding in a script.
    fn literal(value: &str) -> String {
        serde_json::Value::String(value.to_string()).to_string()
    }

    /// Expression selecting every image whose source contains the slug.
    fn matching_images(slug: &str) -> String {
        format!(
            "Array.from(document.images).filter((img) => (img.currentSrc || img.src || '').includes({}))",
            literal(slug)
        )
    }

    pub fn inject_stylesheet(css: &str) -> String {
        format!(
            r#"(() => {{
  const install = () => {{
    const style = document.createElement('style');
    style.setAttribute('data-chrometuner', '');
    style.textContent = {css};
    (document.head || document.documentElement).appendChild(style);
  }};
  if (document.documentElement) {{ install(); }}
  else {{ document.addEventListener('DOMContentLoaded', install, {{ once: true }}); }}
}})();"#,
            css = literal(css)
        )
    }

    pub fn set_zoom(zoom: f64) -> String {
        format!(
            "(() => {{ document.documentElement.style.zoom = '{}'; return true; }})()",
            zoom
        )
    }

    pub fn slug_image_present(slug: &str) -> String {
        format!("({}).length > 0", matching_images(slug))
    }

    pub fn tile_candidates(slug: &str) -> String {
        format!(
            r#"(() => {{
  const describe = (el) => {{
    const r = el.getBoundingClientRect();
    return {{
      tag: el.tagName.toLowerCase(),
      role: el.getAttribute('role'),
      hasClickHandler: el.hasAttribute('onclick') || typeof el.onclick === 'function',
      cursor: getComputedStyle(el).cursor,
      rect: {{ x: r.left, y: r.top, width: r.width, height: r.height }},
    }};
  }};
  return ({images}).map((img) => {{
    const ancestors = [];
    for (let el = img.parentElement; el && el !== document.documentElement; el = el.parentElement) {{
      ancestors.push(describe(el));
    }}
    return {{ ancestors }};
  }});
}})()"#,
            images = matching_images(slug)
        )
    }

    pub fn reveal_target(slug: &str, target: TargetRef) -> String {
        format!(
            r#"(async () => {{
  const img = ({images})[{tile}];
  if (!img) return {{ found: false }};
  let el = img.parentElement;
  for (let i = 0; el && i < {depth}; i++) el = el.parentElement;
  if (!el) return {{ found: false }};
  el.scrollIntoView({{ block: 'center', inline: 'center' }});
  await new Promise((resolve) => requestAnimationFrame(() => resolve()));
  const r = el.getBoundingClientRect();
  return {{
    found: true,
    value: {{
      rect: {{ x: r.left, y: r.top, width: r.width, height: r.height }},
      viewportWidth: window.innerWidth,
      viewportHeight: window.innerHeight,
    }},
  }};
}})()"#,
            images = matching_images(slug),
            tile = target.tile,
            depth = target.depth
        )
    }

    pub fn video_state() -> String {
        r#"(() => {
  const video = document.querySelector('video');
  if (!video) return { found: false };
  return { found: true, value: { readyState: video.readyState, currentTime: video.currentTime } };
})()"#
            .to_string()
    }

    pub fn enter_fullscreen() -> String {
        r#"(async () => {
  const video = document.querySelector('video');
  const target = video || document.documentElement;
  try {
    await target.requestFullscreen();
    return true;
  } catch (e) {
    return false;
  }
})()"#
            .to_string()
    }

    pub fn start_capture(constraints: &CaptureConstraints, binding: &str) -> String {
        let options = serde_json::to_string(constraints).unwrap_or_else(|_| "{}".to_string());
        format!(
            r#"(async () => {{
  const opts = {options};
  const send = window[{binding}];
  if (typeof send !== 'function') return {{ error: 'capture binding missing' }};
  if (window.__chrometunerRecorder) return {{ error: 'capture already running' }};
  let stream;
  try {{
    stream = await navigator.mediaDevices.getDisplayMedia({{
      video: {{
        width: {{ ideal: opts.width }},
        height: {{ ideal: opts.height }},
        frameRate: {{ min: opts.minFrameRate, max: opts.maxFrameRate }},
      }},
      audio: true,
      preferCurrentTab: true,
      selfBrowserSurface: 'include',
      systemAudio: 'include',
    }});
  }} catch (e) {{
    return {{ error: 'getDisplayMedia failed: ' + e.message }};
  }}
  const types = ['video/webm;codecs=h264,opus', 'video/webm;codecs=vp8,opus', 'video/webm'];
  const mimeType = types.find((t) => MediaRecorder.isTypeSupported(t)) || '';
  const recorder = new MediaRecorder(stream, {{
    mimeType,
    videoBitsPerSecond: opts.videoBitrate,
    audioBitsPerSecond: opts.audioBitrate,
  }});
  let chain = Promise.resolve();
  recorder.ondataavailable = (event) => {{
    if (!event.data || event.data.size === 0) return;
    chain = chain.then(async () => {{
      const bytes = new Uint8Array(await event.data.arrayBuffer());
      let binary = '';
      for (let i = 0; i < bytes.length; i += 0x8000) {{
        binary += String.fromCharCode.apply(null, bytes.subarray(i, i + 0x8000));
      }}
      send('d' + btoa(binary));
    }});
  }};
  recorder.onerror = (event) => {{
    chain = chain.then(() => send('e' + ((event.error && event.error.message) || 'recorder error')));
  }};
  recorder.onstop = () => {{
    chain = chain.then(() => send('e' + 'recorder stopped'));
  }};
  recorder.start(opts.timesliceMs);
  window.__chrometunerRecorder = recorder;
  return {{ mimeType: recorder.mimeType || mimeType }};
}})()"#,
            options = options,
            binding = literal(binding)
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::browser::dom::TargetKind;

    #[test]
    fn test_decode_data_payload() {
        let payload = format!("d{}", STANDARD.encode(b"\x1a\x45\xdf\xa3"));
        let chunk = decode_payload(&payload).unwrap().unwrap();
        assert_eq!(&chunk[..], b"\x1a\x45\xdf\xa3");
    }

    #[test]
    fn test_decode_error_payload() {
        let err = decode_payload("erecorder stopped").unwrap().unwrap_err();
        assert_eq!(err.to_string(), "recorder stopped");
        assert!(decode_payload("d").is_none());
    }

    #[test]
    fn test_scripts_quote_slug() {
        let script = scripts::slug_image_present("it's \"espn\"");
        assert!(script.contains(r#""it's \"espn\"""#));

        let reveal = scripts::reveal_target(
            "espn",
            TargetRef {
                tile: 2,
                depth: 3,
                kind: TargetKind::Fallback,
            },
        );
        assert!(reveal.contains("[2]"));
        assert!(reveal.contains("i < 3"));
    }

    #[test]
    fn test_found_into_option() {
        let missing: Found<VideoState> = serde_json::from_str(r#"{"found":false}"#).unwrap();
        assert!(missing.into_option().is_none());

        let present: Found<VideoState> =
            serde_json::from_str(r#"{"found":true,"value":{"readyState":4,"currentTime":1.5}}"#)
                .unwrap();
        assert!(present.into_option().unwrap().is_playing());
    }
}
