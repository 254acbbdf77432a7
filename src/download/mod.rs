//! Download side: queue, workers, extraction engine and progress

pub mod completion;
pub mod engine;
pub mod pipeline;
pub mod progress;
pub mod queue;
pub mod workspace;
pub mod ytdlp;

// Re-exports for convenience
pub use completion::{CompletionHandle, CompletionRegistry, DownloadOutcome};
pub use engine::{ExtractionEngine, MediaFormat, MediaInfo};
pub use pipeline::{CompletedDownloadHandler, DownloadContext, DownloadPipeline, DownloadRequest, DownloadedMedia};
pub use progress::{ProgressCallback, ProgressEvent, ProgressPhase, ProgressReporter, ProgressSample, ProgressTracker};
pub use queue::WorkQueue;
pub use workspace::TempWorkspace;
pub use ytdlp::YtDlpEngine;
