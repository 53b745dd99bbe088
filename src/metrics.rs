//! Structured status events for dashboards and progress files.
//!
//! The orchestrator only sees [`MetricsSink`]. Swapping in [`NoopMetrics`]
//! never changes what gets downloaded.

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::Serialize;
use std::fs;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tracing::warn;

const HTTP_TIMEOUT: Duration = Duration::from_secs(10);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum EventStatus {
    /// A line mirrored from the run log.
    Log,
    Started,
    Downloaded,
    AlreadyPresent,
    AttemptFailed,
    Skipped,
    GivenUp,
    FatalAbort,
    BudgetExhausted,
    Finished,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct MetricsEvent {
    pub status: EventStatus,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub video_id: Option<String>,
    /// Fraction of the queue resolved so far, `0.0..=1.0`.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub progress: Option<f64>,
    pub message: String,
    pub timestamp: DateTime<Utc>,
}

impl MetricsEvent {
    pub fn new(status: EventStatus, message: impl Into<String>) -> Self {
        Self {
            status,
            video_id: None,
            progress: None,
            message: message.into(),
            timestamp: Utc::now(),
        }
    }

    pub fn with_video(mut self, video_id: impl Into<String>) -> Self {
        self.video_id = Some(video_id.into());
        self
    }

    pub fn with_progress(mut self, progress: f64) -> Self {
        self.progress = Some(progress.clamp(0.0, 1.0));
        self
    }
}

/// Receives every status event. Delivery problems must never surface as
/// errors; implementations log and move on.
pub trait MetricsSink: Send + Sync {
    fn emit(&self, event: &MetricsEvent);
}

pub struct NoopMetrics;

impl MetricsSink for NoopMetrics {
    fn emit(&self, _event: &MetricsEvent) {}
}

/// Keeps every event in memory. Handy for embedding and for tests.
#[derive(Default)]
pub struct MemoryMetrics {
    events: Mutex<Vec<MetricsEvent>>,
}

impl MemoryMetrics {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn events(&self) -> Vec<MetricsEvent> {
        self.events.lock().clone()
    }

    pub fn statuses(&self) -> Vec<EventStatus> {
        self.events.lock().iter().map(|event| event.status).collect()
    }
}

impl MetricsSink for MemoryMetrics {
    fn emit(&self, event: &MetricsEvent) {
        self.events.lock().push(event.clone());
    }
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct ProgressReport<'a> {
    progress: u8,
    message: &'a str,
}

/// Rewrites a small JSON file (`{"progress": 0-100, "message": ...}`) every
/// time an event carries a progress fraction. Writes go through a temp file
/// and a rename so readers never see a torn report.
pub struct ProgressFileMetrics {
    path: PathBuf,
}

impl ProgressFileMetrics {
    pub fn new(path: PathBuf) -> Self {
        Self { path }
    }
}

impl MetricsSink for ProgressFileMetrics {
    fn emit(&self, event: &MetricsEvent) {
        let Some(progress) = event.progress else {
            return;
        };
        let report = ProgressReport {
            progress: (progress * 100.0).round().min(100.0) as u8,
            message: &event.message,
        };

        if let Some(parent) = self.path.parent()
            && !parent.as_os_str().is_empty()
            && let Err(err) = fs::create_dir_all(parent)
        {
            warn!("could not create progress dir: {err}");
            return;
        }

        let tmp_path = self.path.with_extension("tmp");
        match serde_json::to_vec(&report) {
            Ok(payload) => {
                if let Err(err) = fs::write(&tmp_path, payload) {
                    warn!("could not write progress file: {err}");
                    return;
                }
                if let Err(err) = fs::rename(&tmp_path, &self.path) {
                    warn!("could not finalize progress file: {err}");
                }
            }
            Err(err) => {
                warn!("could not serialize progress report: {err}");
            }
        }
    }
}

/// POSTs each event as JSON to a dashboard endpoint.
pub struct HttpMetrics {
    agent: ureq::Agent,
    url: String,
}

impl HttpMetrics {
    pub fn new(url: impl Into<String>) -> Self {
        let agent = ureq::AgentBuilder::new().timeout(HTTP_TIMEOUT).build();
        Self {
            agent,
            url: url.into(),
        }
    }
}

impl MetricsSink for HttpMetrics {
    fn emit(&self, event: &MetricsEvent) {
        if let Err(err) = self.agent.post(&self.url).send_json(event) {
            warn!(url = %self.url, "metrics delivery failed: {err}");
        }
    }
}

/// Forwards every event to each inner sink in order.
#[derive(Default)]
pub struct FanoutMetrics {
    sinks: Vec<Arc<dyn MetricsSink>>,
}

impl FanoutMetrics {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, sink: Arc<dyn MetricsSink>) {
        self.sinks.push(sink);
    }

    pub fn is_empty(&self) -> bool {
        self.sinks.is_empty()
    }
}

impl MetricsSink for FanoutMetrics {
    fn emit(&self, event: &MetricsEvent) {
        for sink in &self.sinks {
            sink.emit(event);
        }
    }
}
