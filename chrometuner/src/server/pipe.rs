//! Piping a live capture into the HTTP response body.
//!
//! Native output forwards capture chunks as they arrive. MPEG-TS output runs
//! the chunks through ffmpeg: a feeder writes its stdin, a drainer reads its
//! stdout into the body, and a supervisor waits for whichever side ends
//! first. Either way the first termination event cleans up the session.

use std::io;
use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use futures::StreamExt;
use log::{debug, info};
use tokio::io::AsyncWriteExt;
use tokio::process::{ChildStdin, ChildStdout};
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio_util::io::ReaderStream;

use crate::browser::capture::container_type;
use crate::server::session::{Session, TerminationReason};
use crate::server::transcode::{self, TranscodeConfig, TranscodeError};

/// Chunks buffered towards the client.
const BODY_BUFFER: usize = 64;

/// How long to wait for ffmpeg's exit status after its stdout closes.
const EXIT_STATUS_WAIT: Duration = Duration::from_secs(2);

/// MIME type of transcoded output.
pub const MPEG_TS_MIME: &str = "video/mp2t";

/// Output container served to clients.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OutputFormat {
    /// The recorder's own container (WebM).
    Native,
    /// MPEG-TS through ffmpeg.
    MpegTs,
}

impl OutputFormat {
    pub fn parse(value: &str) -> Option<Self> {
        match value.trim().to_ascii_lowercase().as_str() {
            "native" | "webm" => Some(OutputFormat::Native),
            "mpegts" | "ts" | "mp2t" => Some(OutputFormat::MpegTs),
            _ => None,
        }
    }
}

/// Capture output after setup succeeded.
pub struct LiveCapture {
    pub mime_type: String,
    pub chunks: mpsc::Receiver<io::Result<Bytes>>,
}

/// What the HTTP layer streams back.
pub struct PipedBody {
    pub content_type: String,
    pub body: mpsc::Receiver<io::Result<Bytes>>,
}

/// Start forwarding `live` to a new body channel.
///
/// The session is cleaned up when the stream ends for any reason.
pub fn start_piping(
    session: Arc<Session>,
    live: LiveCapture,
    format: OutputFormat,
    transcode_config: &TranscodeConfig,
) -> Result<PipedBody, TranscodeError> {
    match format {
        OutputFormat::Native => Ok(pipe_direct(session, live)),
        OutputFormat::MpegTs => pipe_transcoded(session, live, transcode_config),
    }
}

fn pipe_direct(session: Arc<Session>, live: LiveCapture) -> PipedBody {
    let (tx, rx) = mpsc::channel(BODY_BUFFER);
    let content_type = container_type(&live.mime_type).to_string();
    let chunks = live.chunks;

    tokio::spawn(async move {
        let reason = forward_direct(chunks, tx).await;
        session.cleanup(reason).await;
    });

    PipedBody {
        content_type,
        body: rx,
    }
}

async fn forward_direct(
    mut chunks: mpsc::Receiver<io::Result<Bytes>>,
    tx: mpsc::Sender<io::Result<Bytes>>,
) -> TerminationReason {
    loop {
        tokio::select! {
            _ = tx.closed() => return TerminationReason::ClientClosed,
            chunk = chunks.recv() => match chunk {
                Some(Ok(data)) => {
                    if tx.send(Ok(data)).await.is_err() {
                        return TerminationReason::ClientClosed;
                    }
                }
                Some(Err(e)) => return TerminationReason::CaptureError(e.to_string()),
                None => return TerminationReason::CaptureEnded,
            },
        }
    }
}

fn pipe_transcoded(
    session: Arc<Session>,
    live: LiveCapture,
    config: &TranscodeConfig,
) -> Result<PipedBody, TranscodeError> {
    let transcoder = transcode::spawn(config, session.id())?;
    if let Err(handle) = session.attach_transcoder(transcoder.handle) {
        handle.terminate();
        info!(
            "[Session {}] Session ended before the transcoder started",
            session.id()
        );
    }

    let (tx, rx) = mpsc::channel(BODY_BUFFER);
    let watch = tx.clone();
    let feeder = tokio::spawn(feed(live.chunks, transcoder.stdin));
    let drainer = tokio::spawn(drain(transcoder.stdout, tx));

    tokio::spawn(async move {
        let reason = supervise(feeder, drainer, transcoder.exit, watch).await;
        session.cleanup(reason).await;
    });

    Ok(PipedBody {
        content_type: MPEG_TS_MIME.to_string(),
        body: rx,
    })
}

/// Capture chunks into ffmpeg's stdin.
async fn feed(
    mut chunks: mpsc::Receiver<io::Result<Bytes>>,
    mut stdin: ChildStdin,
) -> TerminationReason {
    while let Some(chunk) = chunks.recv().await {
        match chunk {
            Ok(data) => {
                if let Err(e) = stdin.write_all(&data).await {
                    return TerminationReason::TranscoderFailed(format!("stdin write: {}", e));
                }
            }
            Err(e) => return TerminationReason::CaptureError(e.to_string()),
        }
    }
    TerminationReason::CaptureEnded
}

/// ffmpeg's stdout into the response body.
async fn drain(stdout: ChildStdout, tx: mpsc::Sender<io::Result<Bytes>>) -> TerminationReason {
    let mut stream = ReaderStream::new(stdout);
    while let Some(item) = stream.next().await {
        match item {
            Ok(data) => {
                if tx.send(Ok(data)).await.is_err() {
                    return TerminationReason::ClientClosed;
                }
            }
            Err(e) => return TerminationReason::TranscoderFailed(format!("stdout read: {}", e)),
        }
    }
    TerminationReason::TranscoderExited
}

fn exit_reason(
    status: Result<Result<(), TranscodeError>, oneshot::error::RecvError>,
) -> TerminationReason {
    match status {
        Ok(Ok(())) => TerminationReason::TranscoderExited,
        Ok(Err(e)) => TerminationReason::TranscoderFailed(e.to_string()),
        Err(_) => TerminationReason::TranscoderFailed("reaper gone".to_string()),
    }
}

/// stdout closing means ffmpeg is exiting; its status decides the reason.
async fn exit_after_eof(
    exit: &mut oneshot::Receiver<Result<(), TranscodeError>>,
) -> TerminationReason {
    match tokio::time::timeout(EXIT_STATUS_WAIT, exit).await {
        Ok(status) => exit_reason(status),
        Err(_) => {
            debug!("Transcoder closed stdout but is still running");
            TerminationReason::TranscoderExited
        }
    }
}

async fn supervise(
    mut feeder: JoinHandle<TerminationReason>,
    mut drainer: JoinHandle<TerminationReason>,
    mut exit: oneshot::Receiver<Result<(), TranscodeError>>,
    watch: mpsc::Sender<io::Result<Bytes>>,
) -> TerminationReason {
    let reason = tokio::select! {
        result = &mut feeder => result.unwrap_or_else(|e| {
            TerminationReason::StageFailed(format!("feeder task: {}", e))
        }),
        result = &mut drainer => match result {
            Ok(TerminationReason::TranscoderExited) => exit_after_eof(&mut exit).await,
            Ok(reason) => reason,
            Err(e) => TerminationReason::StageFailed(format!("drainer task: {}", e)),
        },
        status = &mut exit => exit_reason(status),
        _ = watch.closed() => TerminationReason::ClientClosed,
    };
    debug!("Pipe supervisor finished: {}", reason);
    feeder.abort();
    drainer.abort();
    reason
}
