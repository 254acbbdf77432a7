//! mediagate - admission-controlled download/upload pipeline for a Telegram media bot
//!
//! A request is admitted against the user's plan, downloaded by a bounded
//! pool of extraction workers, charged, and handed to a separate bounded pool
//! of upload workers that pick a direct or chunked transfer by file size.
//!
//! # Module Structure
//!
//! - `core`: configuration, errors, logging, metrics, plans, rate limiting
//! - `storage`: persistence and cache collaborators
//! - `admission`: may this user start a download?
//! - `ledger`: credits and per-download cost
//! - `download`: download queue, workers, progress and completion signals
//! - `upload`: upload strategy, transports and workers
//! - `service`: the calling layer tying it all together
//! - `telegram`: teloxide collaborators (feature `telegram`)

pub mod admission;
pub mod cli;
pub mod core;
pub mod download;
pub mod ledger;
pub mod service;
pub mod storage;
#[cfg(feature = "telegram")]
pub mod telegram;
pub mod testing;
pub mod upload;

// Re-export commonly used types for convenience
pub use core::{config, AppError, AppResult, Settings};
pub use service::{Collaborators, FetchRequest, MediaService, Submission};
