//! Append-only run log.
//!
//! Every line is timestamped, flushed immediately and, when a metrics sink is
//! attached, mirrored as a [`EventStatus::Log`] event. The file handle lives
//! as long as the sink, so it is released on every exit path.

use crate::metrics::{EventStatus, MetricsEvent, MetricsSink};
use anyhow::{Context, Result};
use chrono::Utc;
use std::fs::{self, File, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::warn;

pub struct LogSink {
    path: PathBuf,
    file: File,
    metrics: Option<Arc<dyn MetricsSink>>,
}

impl LogSink {
    pub fn open(path: &Path) -> Result<Self> {
        if let Some(parent) = path.parent()
            && !parent.as_os_str().is_empty()
        {
            fs::create_dir_all(parent)
                .with_context(|| format!("creating log directory {}", parent.display()))?;
        }
        let file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(path)
            .with_context(|| format!("opening log file {}", path.display()))?;
        Ok(Self {
            path: path.to_path_buf(),
            file,
            metrics: None,
        })
    }

    /// Mirrors every subsequent line to `metrics`.
    pub fn with_metrics(mut self, metrics: Arc<dyn MetricsSink>) -> Self {
        self.metrics = Some(metrics);
        self
    }

    /// Prints the line to stdout and appends it to the log file.
    pub fn log(&mut self, message: &str) {
        println!("{message}");
        self.log_silent(message);
    }

    /// Appends the line to the log file only.
    pub fn log_silent(&mut self, message: &str) {
        let stamp = Utc::now().format("%Y-%m-%dT%H:%M:%SZ");
        if let Err(err) = writeln!(self.file, "[{stamp}] {message}").and_then(|_| self.file.flush())
        {
            warn!(path = %self.path.display(), "could not append to log: {err}");
        }
        if let Some(metrics) = &self.metrics {
            metrics.emit(&MetricsEvent::new(EventStatus::Log, message));
        }
    }
}
