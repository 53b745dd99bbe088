#![forbid(unsafe_code)]

//! Building blocks for the batch downloader: manifest reading, the yt-dlp
//! fetch wrapper, the run log, metrics sinks and the retrying orchestrator.

pub mod config;
pub mod error;
pub mod fetch;
pub mod log_sink;
pub mod manifest;
pub mod metrics;
pub mod orchestrator;
