//! Stream sessions: setup stages, piping and cleanup.

pub mod pipe;
pub mod pipeline;
pub mod session;
pub mod transcode;

pub use pipe::{OutputFormat, PipedBody};
pub use pipeline::{CapturePipeline, PipelineConfig, PipelineError, StreamTarget};
pub use session::{AbortGuard, Session, SessionState, TerminationReason};
