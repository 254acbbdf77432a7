//! Upload side: strategy selection, transports and the upload worker pool

pub mod caption;
pub mod pipeline;
pub mod probe;
pub mod strategy;
pub mod transport;

pub use pipeline::{UploadContext, UploadPipeline, UploadTask};
pub use probe::{FfprobeProbe, MediaProbe, ProbeResult};
pub use strategy::{select_strategy, UploadStrategy};
pub use transport::{LocalDirTransport, MediaKind, MediaMetadata, RemoteFile, Transport};
