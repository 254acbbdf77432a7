//! Size-based choice between the direct and chunked upload paths.

use sysinfo::System;

/// Largest file sent in a single transport call (inclusive).
pub const DIRECT_UPLOAD_LIMIT: u64 = 2 * 1024 * 1024 * 1024;

/// Absolute ceiling on a chunk.
pub const MAX_CHUNK_SIZE: u64 = 100 * 1024 * 1024;

/// Floor for the halved chunk size used after a direct-path fallback.
pub const MIN_FALLBACK_CHUNK_SIZE: u64 = 512 * 1024;

/// Attempts per chunk, including the first.
pub const CHUNK_ATTEMPTS: usize = 3;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UploadStrategy {
    Direct,
    Chunked { chunk_size: u64 },
}

impl UploadStrategy {
    pub fn label(&self) -> &'static str {
        match self {
            UploadStrategy::Direct => "direct",
            UploadStrategy::Chunked { .. } => "chunked",
        }
    }
}

/// Direct up to and including [`DIRECT_UPLOAD_LIMIT`], chunked above it.
pub fn select_strategy(file_size: u64, configured_chunk: u64, available_memory: u64) -> UploadStrategy {
    if file_size <= DIRECT_UPLOAD_LIMIT {
        UploadStrategy::Direct
    } else {
        UploadStrategy::Chunked {
            chunk_size: adaptive_chunk_size(configured_chunk, available_memory),
        }
    }
}

/// The smallest of the configured size, a tenth of available memory and
/// [`MAX_CHUNK_SIZE`]. Unknown memory (`0`) is ignored.
pub fn adaptive_chunk_size(configured: u64, available_memory: u64) -> u64 {
    let mut size = configured.min(MAX_CHUNK_SIZE);
    if available_memory > 0 {
        size = size.min(available_memory / 10);
    }
    size.max(1)
}

/// Chunk size for the one-time direct-to-chunked fallback.
pub fn fallback_chunk_size(configured: u64) -> u64 {
    (configured / 2).max(MIN_FALLBACK_CHUNK_SIZE)
}

/// Memory currently available to the process, in bytes.
pub fn available_memory() -> u64 {
    let mut system = System::new();
    system.refresh_memory();
    system.available_memory()
}
