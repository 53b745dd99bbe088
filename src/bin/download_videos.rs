#![forbid(unsafe_code)]

//! Batch downloader: reads video ids from a JSONL manifest and fetches each
//! one with yt-dlp into a flat output directory (`<root>/<id>.mp4`).
//!
//! Re-running over the same manifest only fetches what is still missing.
//! Progress goes to stdout, to the log file, and optionally to a progress
//! file and a metrics endpoint.

use anyhow::{Context, Result};
use clap::Parser;
use newtube_batch::config::{SettingsOverrides, resolve_settings};
use newtube_batch::error::ManifestError;
use newtube_batch::fetch::{DEFAULT_CONTAINER, DEFAULT_FORMAT, FetchOptions, YtDlpFetcher};
use newtube_batch::log_sink::LogSink;
use newtube_batch::manifest::{ManifestFilter, read_manifest};
use newtube_batch::metrics::{
    FanoutMetrics, HttpMetrics, MetricsSink, NoopMetrics, ProgressFileMetrics,
};
use newtube_batch::orchestrator::{Orchestrator, ThreadSleeper};
use std::fs;
use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;
use tracing_subscriber::EnvFilter;

/// Exit status when the manifest yields nothing to download.
const EXIT_EMPTY_MANIFEST: u8 = 1;

#[derive(Debug, Parser)]
#[command(
    name = "download_videos",
    about = "Download the videos listed in a JSONL manifest with yt-dlp"
)]
struct Cli {
    /// Index of the first video to download.
    #[arg(long, default_value_t = 0)]
    start: usize,

    /// Index one past the last video to download; -1 means the end of the list
    /// and other negative values drop that many videos from the end.
    #[arg(long, default_value_t = -1, allow_negative_numbers = true)]
    end: i64,

    /// Directory the videos are saved to (falls back to DOWNLOAD_ROOT).
    #[arg(long, alias = "output_root")]
    output_root: Option<PathBuf>,

    /// JSONL file listing the video ids.
    #[arg(long, alias = "id_file_path")]
    id_file_path: PathBuf,

    /// Netscape cookie file handed to yt-dlp.
    #[arg(long, alias = "cookie_path")]
    cookie_path: Option<PathBuf>,

    /// Run log (defaults to <output root>/download.log).
    #[arg(long, alias = "log_path")]
    log_path: Option<PathBuf>,

    /// Skip `videos` entries of this category. Repeatable.
    #[arg(long = "exclude-category", value_name = "NAME")]
    exclude_categories: Vec<String>,

    /// Keep only records whose title contains one of these words.
    #[arg(long, num_args = 1..)]
    keywords_title: Vec<String>,

    /// Keep only records whose description contains one of these words.
    #[arg(long, num_args = 1..)]
    keywords_description: Vec<String>,

    #[arg(long)]
    max_attempts: Option<u32>,

    #[arg(long)]
    backoff_secs: Option<u64>,

    #[arg(long)]
    polite_delay_secs: Option<u64>,

    /// Given-up videos tolerated before the run stops; 0 disables the limit.
    #[arg(long)]
    give_up_budget: Option<u32>,

    /// yt-dlp format selector.
    #[arg(long, default_value = DEFAULT_FORMAT)]
    format: String,

    /// Container yt-dlp merges streams into.
    #[arg(long, default_value = DEFAULT_CONTAINER)]
    merge_output_format: String,

    /// Show yt-dlp's own output.
    #[arg(long)]
    verbose_fetch: bool,

    /// Dashboard endpoint receiving one JSON POST per event.
    #[arg(long)]
    metrics_url: Option<String>,

    /// JSON file rewritten with the current progress.
    #[arg(long)]
    progress_file: Option<PathBuf>,

    #[arg(long)]
    env_file: Option<PathBuf>,
}

impl Cli {
    fn overrides(&self) -> SettingsOverrides {
        SettingsOverrides {
            download_root: self.output_root.clone(),
            cookies_path: self.cookie_path.clone(),
            log_path: self.log_path.clone(),
            metrics_url: self.metrics_url.clone(),
            max_attempts: self.max_attempts,
            backoff_secs: self.backoff_secs,
            polite_delay_secs: self.polite_delay_secs,
            give_up_budget: self.give_up_budget,
            env_path: self.env_file.clone(),
        }
    }

    fn filter(&self) -> ManifestFilter {
        ManifestFilter {
            excluded_categories: self.exclude_categories.clone(),
            title_keywords: self.keywords_title.clone(),
            description_keywords: self.keywords_description.clone(),
        }
    }

    fn fetch_options(&self) -> FetchOptions {
        FetchOptions {
            format: self.format.clone(),
            container: self.merge_output_format.clone(),
            verbose: self.verbose_fetch,
        }
    }
}

fn main() -> Result<ExitCode> {
    init_tracing();
    let code = run(Cli::parse())?;
    Ok(ExitCode::from(code))
}

fn init_tracing() {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn")),
        )
        .with_writer(std::io::stderr)
        .init();
}

fn build_metrics(metrics_url: Option<&str>, progress_file: Option<PathBuf>) -> Arc<dyn MetricsSink> {
    let mut fanout = FanoutMetrics::new();
    if let Some(url) = metrics_url {
        fanout.push(Arc::new(HttpMetrics::new(url)));
    }
    if let Some(path) = progress_file {
        fanout.push(Arc::new(ProgressFileMetrics::new(path)));
    }
    if fanout.is_empty() {
        Arc::new(NoopMetrics)
    } else {
        Arc::new(fanout)
    }
}

fn run(cli: Cli) -> Result<u8> {
    let settings = resolve_settings(cli.overrides())?;
    fs::create_dir_all(&settings.download_root)
        .with_context(|| format!("creating {}", settings.download_root.display()))?;

    let metrics = build_metrics(settings.metrics_url.as_deref(), cli.progress_file.clone());
    let mut log = LogSink::open(&settings.log_path)?.with_metrics(metrics.clone());

    let manifest = read_manifest(&cli.id_file_path, &cli.filter())
        .with_context(|| format!("loading video ids from {}", cli.id_file_path.display()))?;
    manifest.log_warnings(&mut log);
    log.log_silent(&format!(
        "Read {} manifest records from {}: {} ids, {} filtered, {} malformed",
        manifest.records,
        cli.id_file_path.display(),
        manifest.ids.len(),
        manifest.filtered,
        manifest.warnings.len()
    ));

    let manifest = manifest.slice(cli.start, cli.end);
    if manifest.ids.is_empty() {
        let err = ManifestError::Empty {
            path: cli.id_file_path.clone(),
        };
        log.log(&format!("Error: {err}"));
        return Ok(EXIT_EMPTY_MANIFEST);
    }

    let fetcher = YtDlpFetcher::new(cli.fetch_options());
    fetcher.ensure_available()?;

    let cookies = match settings.cookies_path.as_deref() {
        Some(path) if path.exists() => Some(path),
        Some(path) => {
            log.log(&format!(
                "Warning: cookie file {} not found; downloading without cookies",
                path.display()
            ));
            None
        }
        None => None,
    };

    let mut orchestrator = Orchestrator::new(fetcher, ThreadSleeper, log, metrics, settings.retry);
    let result = orchestrator.run(&manifest.ids, &settings.download_root, cookies);

    println!(
        "{}",
        serde_json::to_string_pretty(&result).context("serializing run summary")?
    );
    Ok(0)
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::CommandFactory;
    use newtube_batch::metrics::{EventStatus, MetricsEvent};
    use tempfile::tempdir;

    #[test]
    fn cli_definition_is_valid() {
        Cli::command().debug_assert();
    }

    #[test]
    fn cli_uses_defaults() {
        let cli = Cli::try_parse_from(["download_videos", "--id-file-path", "ids.jsonl"]).unwrap();
        assert_eq!(cli.start, 0);
        assert_eq!(cli.end, -1);
        assert_eq!(cli.id_file_path, PathBuf::from("ids.jsonl"));
        assert_eq!(cli.format, DEFAULT_FORMAT);
        assert_eq!(cli.merge_output_format, "mp4");
        assert!(!cli.verbose_fetch);
        assert!(cli.exclude_categories.is_empty());
        let overrides = cli.overrides();
        assert!(overrides.download_root.is_none());
        assert!(overrides.max_attempts.is_none());
    }

    #[test]
    fn cli_accepts_legacy_flag_names_and_tuning() {
        let cli = Cli::try_parse_from([
            "download_videos",
            "--id_file_path",
            "ids.jsonl",
            "--output_root",
            "/data/videos",
            "--cookie_path",
            "/data/cookies.txt",
            "--start",
            "10",
            "--end",
            "-2",
            "--exclude-category",
            "Music",
            "--exclude-category",
            "Gaming",
            "--keywords-title",
            "slow",
            "motion",
            "--max-attempts",
            "3",
            "--give-up-budget",
            "0",
        ])
        .unwrap();
        assert_eq!(cli.start, 10);
        assert_eq!(cli.end, -2);
        assert_eq!(cli.output_root, Some(PathBuf::from("/data/videos")));
        assert_eq!(cli.exclude_categories, vec!["Music", "Gaming"]);
        assert_eq!(cli.keywords_title, vec!["slow", "motion"]);

        let overrides = cli.overrides();
        assert_eq!(overrides.cookies_path, Some(PathBuf::from("/data/cookies.txt")));
        assert_eq!(overrides.max_attempts, Some(3));
        assert_eq!(overrides.give_up_budget, Some(0));

        let filter = cli.filter();
        assert_eq!(filter.excluded_categories.len(), 2);
        assert!(filter.description_keywords.is_empty());
    }

    #[test]
    fn cli_requires_manifest_path() {
        assert!(Cli::try_parse_from(["download_videos"]).is_err());
    }

    #[test]
    fn empty_manifest_exits_with_one() -> Result<()> {
        let dir = tempdir()?;
        let manifest = dir.path().join("ids.jsonl");
        fs::write(&manifest, "{\"kind\": \"youtube#video\"}\n")?;
        let log_path = dir.path().join("run.log");
        let progress_path = dir.path().join("progress.json");

        let cli = Cli::try_parse_from([
            "download_videos".to_string(),
            "--id-file-path".to_string(),
            manifest.display().to_string(),
            "--output-root".to_string(),
            dir.path().join("videos").display().to_string(),
            "--log-path".to_string(),
            log_path.display().to_string(),
            "--progress-file".to_string(),
            progress_path.display().to_string(),
            "--env-file".to_string(),
            dir.path().join("missing.env").display().to_string(),
        ])?;

        assert_eq!(run(cli)?, EXIT_EMPTY_MANIFEST);
        let log = fs::read_to_string(&log_path)?;
        assert!(log.contains("malformed manifest line 1"));
        assert!(log.contains("yielded no video ids"));
        assert!(dir.path().join("videos").is_dir());
        Ok(())
    }

    #[test]
    fn slicing_past_the_end_counts_as_empty() -> Result<()> {
        let dir = tempdir()?;
        let manifest = dir.path().join("ids.jsonl");
        fs::write(&manifest, "{\"id\": \"a\"}\n{\"id\": \"b\"}\n")?;

        let cli = Cli::try_parse_from([
            "download_videos".to_string(),
            "--id-file-path".to_string(),
            manifest.display().to_string(),
            "--output-root".to_string(),
            dir.path().join("videos").display().to_string(),
            "--start".to_string(),
            "5".to_string(),
            "--env-file".to_string(),
            dir.path().join("missing.env").display().to_string(),
        ])?;

        assert_eq!(run(cli)?, EXIT_EMPTY_MANIFEST);
        assert!(dir.path().join("videos").join("download.log").exists());
        Ok(())
    }

    #[test]
    fn missing_manifest_is_an_error() {
        let dir = tempdir().unwrap();
        let cli = Cli::try_parse_from([
            "download_videos".to_string(),
            "--id-file-path".to_string(),
            dir.path().join("nope.jsonl").display().to_string(),
            "--output-root".to_string(),
            dir.path().display().to_string(),
            "--env-file".to_string(),
            dir.path().join("missing.env").display().to_string(),
        ])
        .unwrap();
        let err = run(cli).unwrap_err();
        assert!(err.to_string().contains("loading video ids"));
    }

    #[test]
    fn build_metrics_wires_progress_file() {
        let dir = tempdir().unwrap();
        let progress = dir.path().join("progress.json");
        let sink = build_metrics(None, Some(progress.clone()));
        sink.emit(&MetricsEvent::new(EventStatus::Started, "go").with_progress(0.0));
        assert!(progress.exists());

        let noop = build_metrics(None, None);
        noop.emit(&MetricsEvent::new(EventStatus::Finished, "done"));
    }
}
