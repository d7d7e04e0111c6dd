//! ffmpeg subprocess that remuxes the captured WebM into MPEG-TS.
//!
//! Video is copied, audio is re-encoded to AAC. The process reads the
//! capture on stdin and writes the transport stream to stdout.

use std::path::PathBuf;
use std::process::{ExitStatus, Stdio};
use std::time::Duration;

use log::{debug, info, trace, warn};
use thiserror::Error;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::process::{Child, ChildStderr, ChildStdin, ChildStdout, Command};
use tokio::sync::oneshot;

/// How long ffmpeg gets to exit after SIGTERM before it is killed.
const TERMINATE_GRACE: Duration = Duration::from_secs(3);

/// SIGTERM signal number.
const SIGTERM: i32 = 15;

/// Transcoder errors.
#[derive(Debug, Error)]
pub enum TranscodeError {
    /// The executable could not be started.
    #[error("Failed to spawn '{path}': {source}")]
    Spawn {
        path: String,
        #[source]
        source: std::io::Error,
    },

    /// A stdio pipe was not available after spawning.
    #[error("Transcoder {0} pipe unavailable")]
    MissingPipe(&'static str),

    /// Non-zero exit.
    #[error("Transcoder exited with code {0}")]
    ExitCode(i32),

    /// Killed by a signal other than SIGTERM.
    #[error("Transcoder killed by signal {0}")]
    Signal(i32),

    /// Waiting on the process failed.
    #[error("Failed to wait for transcoder: {0}")]
    Wait(#[source] std::io::Error),
}

/// Transcoder settings.
#[derive(Debug, Clone)]
pub struct TranscodeConfig {
    pub ffmpeg: PathBuf,
    pub audio_bitrate: u32,
}

impl Default for TranscodeConfig {
    fn default() -> Self {
        Self {
            ffmpeg: PathBuf::from("ffmpeg"),
            audio_bitrate: 256_000,
        }
    }
}

impl TranscodeConfig {
    pub fn args(&self) -> Vec<String> {
        vec![
            "-hide_banner".to_string(),
            "-fflags".to_string(),
            "+genpts".to_string(),
            "-i".to_string(),
            "pipe:0".to_string(),
            "-c:v".to_string(),
            "copy".to_string(),
            "-c:a".to_string(),
            "aac".to_string(),
            "-b:a".to_string(),
            format!("{}k", self.audio_bitrate / 1000),
            "-f".to_string(),
            "mpegts".to_string(),
            "pipe:1".to_string(),
        ]
    }
}

/// Decide whether an exit status is an error.
///
/// Exit code 0 and termination by SIGTERM are normal.
pub fn classify_exit(status: ExitStatus) -> Result<(), TranscodeError> {
    if status.success() {
        return Ok(());
    }
    if let Some(code) = status.code() {
        return Err(TranscodeError::ExitCode(code));
    }
    match exit_signal(status) {
        Some(SIGTERM) => Ok(()),
        Some(signal) => Err(TranscodeError::Signal(signal)),
        None => Err(TranscodeError::ExitCode(-1)),
    }
}

#[cfg(unix)]
fn exit_signal(status: ExitStatus) -> Option<i32> {
    use std::os::unix::process::ExitStatusExt;
    status.signal()
}

#[cfg(not(unix))]
fn exit_signal(_status: ExitStatus) -> Option<i32> {
    None
}

/// Whether an ffmpeg stderr line is routine progress output.
pub fn is_progress_noise(line: &str) -> bool {
    let line = line.trim();
    line.is_empty()
        || line.starts_with("frame=")
        || line.starts_with("size=")
        || (line.contains("time=") && line.contains("speed="))
        || line.starts_with("Last message repeated")
        || line.contains("Past duration")
        || line.contains("non monotonically increasing dts")
        || line.contains("Non-monotonous DTS")
}

/// A running transcoder.
pub struct Transcoder {
    pub stdin: ChildStdin,
    pub stdout: ChildStdout,
    pub handle: TranscodeHandle,
    /// Resolves once the process has exited.
    pub exit: oneshot::Receiver<Result<(), TranscodeError>>,
}

/// Requests termination of a running transcoder.
///
/// Termination is requested at most once; dropping the handle also requests it.
#[derive(Debug)]
pub struct TranscodeHandle {
    terminate_tx: Option<oneshot::Sender<()>>,
    pid: Option<u32>,
}

impl TranscodeHandle {
    pub fn pid(&self) -> Option<u32> {
        self.pid
    }

    pub fn terminate(mut self) {
        self.request_terminate();
    }

    fn request_terminate(&mut self) {
        if let Some(tx) = self.terminate_tx.take() {
            let _ = tx.send(());
        }
    }
}

impl Drop for TranscodeHandle {
    fn drop(&mut self) {
        self.request_terminate();
    }
}

/// Spawn ffmpeg for a session.
pub fn spawn(config: &TranscodeConfig, session_id: u64) -> Result<Transcoder, TranscodeError> {
    let mut child = Command::new(&config.ffmpeg)
        .args(config.args())
        .stdin(Stdio::piped())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .kill_on_drop(true)
        .spawn()
        .map_err(|source| TranscodeError::Spawn {
            path: config.ffmpeg.display().to_string(),
            source,
        })?;

    let stdin = child.stdin.take().ok_or(TranscodeError::MissingPipe("stdin"))?;
    let stdout = child.stdout.take().ok_or(TranscodeError::MissingPipe("stdout"))?;
    if let Some(stderr) = child.stderr.take() {
        tokio::spawn(log_stderr(stderr, session_id));
    }

    let pid = child.id();
    info!("[Session {}] Transcoder started (pid {:?})", session_id, pid);

    let (terminate_tx, terminate_rx) = oneshot::channel();
    let (exit_tx, exit_rx) = oneshot::channel();
    tokio::spawn(reap(child, terminate_rx, exit_tx, session_id));

    Ok(Transcoder {
        stdin,
        stdout,
        handle: TranscodeHandle {
            terminate_tx: Some(terminate_tx),
            pid,
        },
        exit: exit_rx,
    })
}

async fn log_stderr(stderr: ChildStderr, session_id: u64) {
    let mut lines = BufReader::new(stderr).lines();
    loop {
        match lines.next_line().await {
            Ok(Some(line)) if is_progress_noise(&line) => trace!("[Session {}] ffmpeg: {}", session_id, line),
            Ok(Some(line)) => info!("[Session {}] ffmpeg: {}", session_id, line),
            Ok(None) => break,
            Err(e) => {
                debug!("[Session {}] ffmpeg stderr closed: {}", session_id, e);
                break;
            }
        }
    }
}

enum ReapEvent {
    Exited(std::io::Result<ExitStatus>),
    Terminate,
}

/// Own the child until it exits or termination is requested.
async fn reap(
    mut child: Child,
    terminate_rx: oneshot::Receiver<()>,
    exit_tx: oneshot::Sender<Result<(), TranscodeError>>,
    session_id: u64,
) {
    let event = tokio::select! {
        status = child.wait() => ReapEvent::Exited(status),
        // A dropped sender also counts as a request.
        _ = terminate_rx => ReapEvent::Terminate,
    };

    let result = match event {
        ReapEvent::Exited(Ok(status)) => classify_exit(status),
        ReapEvent::Exited(Err(e)) => Err(TranscodeError::Wait(e)),
        ReapEvent::Terminate => {
            terminate_child(&mut child, session_id).await;
            Ok(())
        }
    };

    match &result {
        Ok(()) => debug!("[Session {}] Transcoder exited", session_id),
        Err(e) => warn!("[Session {}] {}", session_id, e),
    }
    let _ = exit_tx.send(result);
}

/// SIGTERM, then kill if the process outlives the grace period.
async fn terminate_child(child: &mut Child, session_id: u64) {
    #[cfg(unix)]
    {
        if let Some(pid) = child.id() {
            use nix::sys::signal::{kill, Signal};
            use nix::unistd::Pid;

            match kill(Pid::from_raw(pid as i32), Signal::SIGTERM) {
                Ok(()) => {
                    if tokio::time::timeout(TERMINATE_GRACE, child.wait()).await.is_ok() {
                        debug!("[Session {}] Transcoder terminated", session_id);
                        return;
                    }
                    warn!(
                        "[Session {}] Transcoder ignored SIGTERM for {:?}, killing",
                        session_id, TERMINATE_GRACE
                    );
                }
                Err(e) => debug!("[Session {}] SIGTERM failed: {}", session_id, e),
            }
        }
    }

    if let Err(e) = child.kill().await {
        debug!("[Session {}] Kill failed: {}", session_id, e);
    }
}

/// Transcoder config running a shell script in place of ffmpeg.
#[cfg(all(test, unix))]
pub fn script_config(dir: &tempfile::TempDir, body: &str) -> TranscodeConfig {
    use std::os::unix::fs::PermissionsExt;

    let path = dir.path().join("fake-ffmpeg");
    std::fs::write(&path, format!("#!/bin/sh\n{}\n", body)).unwrap();
    std::fs::set_permissions(&path, std::fs::Permissions::from_mode(0o755)).unwrap();
    TranscodeConfig {
        ffmpeg: path,
        audio_bitrate: 128_000,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[cfg(unix)]
    #[test]
    fn test_classify_exit() {
        use std::os::unix::process::ExitStatusExt;

        assert!(classify_exit(ExitStatus::from_raw(0)).is_ok());
        assert!(classify_exit(ExitStatus::from_raw(SIGTERM)).is_ok());
        assert!(matches!(
            classify_exit(ExitStatus::from_raw(9)),
            Err(TranscodeError::Signal(9))
        ));
        assert!(matches!(
            classify_exit(ExitStatus::from_raw(1 << 8)),
            Err(TranscodeError::ExitCode(1))
        ));
    }

    #[test]
    fn test_progress_noise() {
        assert!(is_progress_noise(
            "frame=  120 fps= 30 q=-1.0 size=    1024kB time=00:00:04.00 bitrate=2097.2kbits/s speed=1.0x"
        ));
        assert!(is_progress_noise("size=     512kB time=00:00:02.00 bitrate=2000kbits/s speed=1x"));
        assert!(is_progress_noise("   "));
        assert!(!is_progress_noise("[matroska,webm @ 0x55] Invalid EBML header"));
    }

    #[test]
    fn test_args_copy_video_and_encode_audio() {
        let config = TranscodeConfig {
            ffmpeg: PathBuf::from("/usr/bin/ffmpeg"),
            audio_bitrate: 192_000,
        };
        let args = config.args().join(" ");
        assert!(args.contains("-i pipe:0"));
        assert!(args.contains("-c:v copy"));
        assert!(args.contains("-c:a aac -b:a 192k"));
        assert!(args.ends_with("-f mpegts pipe:1"));
    }

    #[tokio::test]
    async fn test_spawn_missing_executable() {
        let config = TranscodeConfig {
            ffmpeg: PathBuf::from("/nonexistent/ffmpeg-for-tests"),
            audio_bitrate: 128_000,
        };
        let err = spawn(&config, 1).err().unwrap();
        assert!(matches!(err, TranscodeError::Spawn { .. }));
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_nonzero_exit_is_reported() {
        let dir = tempfile::tempdir().unwrap();
        let transcoder = spawn(&script_config(&dir, "exit 3"), 1).ok().unwrap();

        let status = tokio::time::timeout(Duration::from_secs(2), transcoder.exit)
            .await
            .unwrap()
            .unwrap();
        assert!(matches!(status, Err(TranscodeError::ExitCode(3))));
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_terminate_is_not_an_error() {
        let dir = tempfile::tempdir().unwrap();
        let transcoder = spawn(&script_config(&dir, "exec sleep 30"), 1).ok().unwrap();
        assert!(transcoder.handle.pid().is_some());

        transcoder.handle.terminate();
        // Well inside the kill grace period, so SIGTERM did it.
        let status = tokio::time::timeout(Duration::from_secs(2), transcoder.exit)
            .await
            .unwrap()
            .unwrap();
        assert!(status.is_ok());
    }
}
