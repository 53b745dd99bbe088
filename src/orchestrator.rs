//! The download loop.
//!
//! Videos are handled strictly one after another. For each id the
//! destination file is checked first; missing files are fetched with a
//! bounded number of attempts. What happens after a failure depends only on
//! the [`ErrorKind`] the fetcher reports:
//!
//! * `Transient` retries after [`RetryPolicy::backoff`] until
//!   [`RetryPolicy::max_attempts`] is used up, then gives the video up.
//! * `NonRetriableItem` skips the video at once.
//! * `FatalBlock` ends the whole run.
//!
//! Too many given-up videos also end the run (see
//! [`RetryPolicy::give_up_budget`]).

use crate::error::ErrorKind;
use crate::fetch::Fetcher;
use crate::log_sink::LogSink;
use crate::manifest::VideoId;
use crate::metrics::{EventStatus, MetricsEvent, MetricsSink};
use serde::Serialize;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::thread;
use std::time::Duration;

pub const DEFAULT_MAX_ATTEMPTS: u32 = 5;
pub const DEFAULT_BACKOFF: Duration = Duration::from_secs(60);
pub const DEFAULT_POLITE_DELAY: Duration = Duration::from_secs(10);
pub const DEFAULT_GIVE_UP_BUDGET: u32 = 10;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    /// Fetch calls allowed per video, including the first one.
    pub max_attempts: u32,
    /// Pause between attempts after a transient failure.
    pub backoff: Duration,
    /// Pause after a successful download before the next video starts.
    pub polite_delay: Duration,
    /// Given-up videos tolerated before the run is aborted. `0` disables it.
    pub give_up_budget: u32,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: DEFAULT_MAX_ATTEMPTS,
            backoff: DEFAULT_BACKOFF,
            polite_delay: DEFAULT_POLITE_DELAY,
            give_up_budget: DEFAULT_GIVE_UP_BUDGET,
        }
    }
}

/// Blocking wait used for backoff and polite delays.
pub trait Sleeper {
    fn sleep(&self, duration: Duration);
}

pub struct ThreadSleeper;

impl Sleeper for ThreadSleeper {
    fn sleep(&self, duration: Duration) {
        if !duration.is_zero() {
            thread::sleep(duration);
        }
    }
}

impl<T: Sleeper + ?Sized> Sleeper for &T {
    fn sleep(&self, duration: Duration) {
        (**self).sleep(duration)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DownloadTask {
    pub video_id: VideoId,
    pub destination: PathBuf,
}

impl DownloadTask {
    pub fn new(video_id: VideoId, destination_root: &Path, extension: &str) -> Self {
        let destination = destination_root.join(format!("{video_id}.{extension}"));
        Self {
            video_id,
            destination,
        }
    }
}

/// Per-video attempt bookkeeping. A fresh one is made for every task.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct RetryState {
    pub attempt_count: u32,
    pub max_attempts: u32,
    pub last_error: Option<ErrorKind>,
}

impl RetryState {
    pub fn new(max_attempts: u32) -> Self {
        Self {
            attempt_count: 0,
            max_attempts: max_attempts.max(1),
            last_error: None,
        }
    }

    pub fn exhausted(&self) -> bool {
        self.attempt_count >= self.max_attempts
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskOutcome {
    Downloaded,
    AlreadyPresent,
    Skipped,
    GivenUp,
    Fatal,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct TaskReport {
    pub video_id: VideoId,
    pub outcome: TaskOutcome,
    pub retry: RetryState,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum AbortReason {
    FatalBlock,
    GiveUpBudget,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RunResult {
    /// Videos for which the fetcher was called at least once.
    pub attempted_count: usize,
    pub succeeded_count: usize,
    pub already_present_count: usize,
    /// Videos skipped because they can never be downloaded.
    pub skipped_count: usize,
    pub given_up_count: usize,
    pub terminated_early: bool,
    pub abort_reason: Option<AbortReason>,
    #[serde(skip)]
    pub tasks: Vec<TaskReport>,
}

pub struct Orchestrator<F, S = ThreadSleeper> {
    fetcher: F,
    sleeper: S,
    log: LogSink,
    metrics: Arc<dyn MetricsSink>,
    policy: RetryPolicy,
}

impl<F: Fetcher, S: Sleeper> Orchestrator<F, S> {
    pub fn new(
        fetcher: F,
        sleeper: S,
        log: LogSink,
        metrics: Arc<dyn MetricsSink>,
        policy: RetryPolicy,
    ) -> Self {
        Self {
            fetcher,
            sleeper,
            log,
            metrics,
            policy,
        }
    }

    pub fn run(
        &mut self,
        video_ids: &[VideoId],
        destination_root: &Path,
        credentials: Option<&Path>,
    ) -> RunResult {
        let total = video_ids.len();
        let mut result = RunResult::default();

        let message = format!("Number of videos to download: {total}");
        self.log.log(&message);
        self.emit(MetricsEvent::new(EventStatus::Started, message).with_progress(0.0));

        for (index, video_id) in video_ids.iter().enumerate() {
            let position = index + 1;
            let progress = position as f64 / total as f64;
            let task = DownloadTask::new(
                video_id.clone(),
                destination_root,
                self.fetcher.output_extension(),
            );

            // Checked fresh for every id; files may appear while we run.
            let (outcome, retry) = if task.destination.exists() {
                let message = format!(
                    "Video with ID {} already exists in the specified output path.",
                    task.video_id
                );
                self.log.log(&message);
                self.emit(
                    MetricsEvent::new(EventStatus::AlreadyPresent, message)
                        .with_video(task.video_id.as_str())
                        .with_progress(progress),
                );
                (TaskOutcome::AlreadyPresent, RetryState::new(self.policy.max_attempts))
            } else {
                result.attempted_count += 1;
                self.download(&task, destination_root, credentials, position, total)
            };

            result.tasks.push(TaskReport {
                video_id: task.video_id.clone(),
                outcome,
                retry,
            });

            match outcome {
                TaskOutcome::Downloaded => {
                    result.succeeded_count += 1;
                    if position < total {
                        self.sleeper.sleep(self.policy.polite_delay);
                    }
                }
                TaskOutcome::AlreadyPresent => result.already_present_count += 1,
                TaskOutcome::Skipped => result.skipped_count += 1,
                TaskOutcome::GivenUp => {
                    result.given_up_count += 1;
                    let budget = self.policy.give_up_budget;
                    if budget > 0 && result.given_up_count >= budget as usize {
                        let message = format!(
                            "Gave up on {} videos (budget {budget}). Terminating the run.",
                            result.given_up_count
                        );
                        self.log.log(&message);
                        self.emit(
                            MetricsEvent::new(EventStatus::BudgetExhausted, message)
                                .with_progress(progress),
                        );
                        result.terminated_early = true;
                        result.abort_reason = Some(AbortReason::GiveUpBudget);
                        break;
                    }
                }
                TaskOutcome::Fatal => {
                    result.terminated_early = true;
                    result.abort_reason = Some(AbortReason::FatalBlock);
                    break;
                }
            }
        }

        let message = format!(
            "Run finished: {} downloaded, {} already present, {} skipped, {} given up{}",
            result.succeeded_count,
            result.already_present_count,
            result.skipped_count,
            result.given_up_count,
            if result.terminated_early {
                " (terminated early)"
            } else {
                ""
            }
        );
        self.log.log(&message);
        let finished = MetricsEvent::new(EventStatus::Finished, message);
        self.emit(if result.terminated_early {
            finished
        } else {
            finished.with_progress(1.0)
        });

        result
    }

    /// Fetches one missing video, retrying transient failures.
    fn download(
        &mut self,
        task: &DownloadTask,
        destination_root: &Path,
        credentials: Option<&Path>,
        position: usize,
        total: usize,
    ) -> (TaskOutcome, RetryState) {
        let mut state = RetryState::new(self.policy.max_attempts);
        let progress = position as f64 / total as f64;
        let video_id = task.video_id.as_str();
        self.log
            .log(&format!("[{position}/{total}] Downloading video with ID {video_id}"));

        loop {
            state.attempt_count += 1;
            let err = match self
                .fetcher
                .fetch(&task.video_id, destination_root, credentials)
            {
                Ok(()) => {
                    if !task.destination.exists() {
                        self.log.log(&format!(
                            "Warning: download of {video_id} reported success but {} is missing",
                            task.destination.display()
                        ));
                    }
                    let message = format!("Downloaded video with ID {video_id}");
                    self.log.log(&message);
                    self.emit(
                        MetricsEvent::new(EventStatus::Downloaded, message)
                            .with_video(video_id)
                            .with_progress(progress),
                    );
                    return (TaskOutcome::Downloaded, state);
                }
                Err(err) => err,
            };

            state.last_error = Some(err.kind());
            match err.kind() {
                ErrorKind::FatalBlock => {
                    let message = format!(
                        "IP is blocked while downloading {video_id}: {}. Terminating the run.",
                        err.message()
                    );
                    self.log.log(&message);
                    self.emit(
                        MetricsEvent::new(EventStatus::FatalAbort, message)
                            .with_video(video_id)
                            .with_progress(progress),
                    );
                    return (TaskOutcome::Fatal, state);
                }
                ErrorKind::NonRetriableItem => {
                    let message = format!("Skipping video with ID {video_id}: {}", err.message());
                    self.log.log(&message);
                    self.emit(
                        MetricsEvent::new(EventStatus::Skipped, message)
                            .with_video(video_id)
                            .with_progress(progress),
                    );
                    return (TaskOutcome::Skipped, state);
                }
                ErrorKind::Transient => {
                    let message = format!(
                        "Error downloading video with ID {video_id} (attempt {}/{}): {}",
                        state.attempt_count,
                        state.max_attempts,
                        err.message()
                    );
                    self.log.log(&message);
                    self.emit(
                        MetricsEvent::new(EventStatus::AttemptFailed, message)
                            .with_video(video_id),
                    );

                    if state.exhausted() {
                        let message = format!(
                            "Giving up on video with ID {video_id} after {} attempts",
                            state.attempt_count
                        );
                        self.log.log(&message);
                        self.emit(
                            MetricsEvent::new(EventStatus::GivenUp, message)
                                .with_video(video_id)
                                .with_progress(progress),
                        );
                        return (TaskOutcome::GivenUp, state);
                    }

                    self.log.log_silent(&format!(
                        "Retrying {video_id} in {}s",
                        self.policy.backoff.as_secs()
                    ));
                    self.sleeper.sleep(self.policy.backoff);
                }
            }
        }
    }

    fn emit(&self, event: MetricsEvent) {
        self.metrics.emit(&event);
    }
}
