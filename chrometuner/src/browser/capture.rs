//! Tab capture: constraints, window geometry, and the captured media stream.

use std::io;

use bytes::Bytes;
use serde::Serialize;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

/// Height reserved for the browser's own UI above the page viewport.
pub const BROWSER_UI_HEIGHT: u32 = 88;

/// Recorder timeslice: one chunk roughly every 100 ms.
pub const CAPTURE_TIMESLICE_MS: u32 = 100;

/// Media constraints handed to the page capture script.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct CaptureConstraints {
    pub width: u32,
    pub height: u32,
    pub video_bitrate: u32,
    pub audio_bitrate: u32,
    pub min_frame_rate: u32,
    pub max_frame_rate: u32,
    pub timeslice_ms: u32,
}

impl Default for CaptureConstraints {
    fn default() -> Self {
        Self {
            width: 1280,
            height: 720,
            video_bitrate: 6_000_000,
            audio_bitrate: 256_000,
            min_frame_rate: 30,
            max_frame_rate: 60,
            timeslice_ms: CAPTURE_TIMESLICE_MS,
        }
    }
}

/// Window size and page zoom used while capturing.
///
/// The page lays out at `layout_width` CSS pixels and is scaled down to the
/// capture width, so sites render their large-screen layout.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct CaptureGeometry {
    pub window_width: u32,
    pub window_height: u32,
    pub zoom: f64,
}

impl CaptureGeometry {
    pub fn for_resolution(width: u32, height: u32, layout_width: u32) -> Self {
        let zoom = if layout_width == 0 {
            1.0
        } else {
            f64::from(width) / f64::from(layout_width)
        };
        Self {
            window_width: width,
            window_height: height + BROWSER_UI_HEIGHT,
            zoom,
        }
    }
}

/// Owns the task that forwards capture chunks out of the page.
///
/// Destroying (or dropping) the handle stops forwarding.
#[derive(Debug, Default)]
pub struct CaptureHandle {
    task: Option<JoinHandle<()>>,
}

impl CaptureHandle {
    pub fn new(task: JoinHandle<()>) -> Self {
        Self { task: Some(task) }
    }

    /// A handle with nothing to stop.
    pub fn detached() -> Self {
        Self { task: None }
    }

    pub fn destroy(mut self) {
        self.stop();
    }

    fn stop(&mut self) {
        if let Some(task) = self.task.take() {
            task.abort();
        }
    }
}

impl Drop for CaptureHandle {
    fn drop(&mut self) {
        self.stop();
    }
}

/// A live capture: container MIME type plus a channel of media chunks.
#[derive(Debug)]
pub struct CaptureStream {
    mime_type: String,
    chunks: mpsc::Receiver<io::Result<Bytes>>,
    handle: CaptureHandle,
}

impl CaptureStream {
    pub fn new(
        mime_type: impl Into<String>,
        chunks: mpsc::Receiver<io::Result<Bytes>>,
        handle: CaptureHandle,
    ) -> Self {
        Self {
            mime_type: mime_type.into(),
            chunks,
            handle,
        }
    }

    pub fn into_parts(self) -> (String, mpsc::Receiver<io::Result<Bytes>>, CaptureHandle) {
        (self.mime_type, self.chunks, self.handle)
    }
}

/// Strip codec parameters: `video/webm;codecs=h264,opus` becomes `video/webm`.
pub fn container_type(mime_type: &str) -> &str {
    let base = mime_type.split(';').next().unwrap_or_default().trim();
    if base.is_empty() {
        "video/webm"
    } else {
        base
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_geometry_scales_layout() {
        let geometry = CaptureGeometry::for_resolution(1280, 720, 1920);
        assert_eq!(geometry.window_width, 1280);
        assert_eq!(geometry.window_height, 720 + BROWSER_UI_HEIGHT);
        assert!((geometry.zoom - 2.0 / 3.0).abs() < 1e-9);
    }

    #[test]
    fn test_container_type() {
        assert_eq!(container_type("video/webm;codecs=h264,opus"), "video/webm");
        assert_eq!(container_type("video/mp4"), "video/mp4");
        assert_eq!(container_type(""), "video/webm");
    }

    #[tokio::test]
    async fn test_destroy_aborts_forwarder() {
        let task = tokio::spawn(async {
            tokio::time::sleep(std::time::Duration::from_secs(60)).await;
        });
        let abort = task.abort_handle();
        CaptureHandle::new(task).destroy();
        tokio::task::yield_now().await;
        tokio::time::sleep(std::time::Duration::from_millis(10)).await;
        assert!(abort.is_finished());
    }

    #[test]
    fn test_constraints_serialize_camel_case() {
        let json = serde_json::to_value(CaptureConstraints::default()).unwrap();
        assert_eq!(json["videoBitrate"], 6_000_000);
        assert_eq!(json["maxFrameRate"], 60);
    }
}
