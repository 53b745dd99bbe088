//! Fetch collaborator: hands a video id to `yt-dlp` and reports the result as
//! a classified [`FetchError`].
//!
//! yt-dlp only tells us what went wrong through its stderr text, so that text
//! is inspected here, once, and nowhere else.

use crate::error::FetchError;
use crate::manifest::VideoId;
use anyhow::{Result, bail};
use std::io;
use std::path::Path;
use std::process::{Command, Stdio};
use tracing::debug;

#[cfg(test)]
use parking_lot::{Mutex, MutexGuard, const_mutex};
#[cfg(test)]
use std::path::PathBuf;

/// H.264 video with AAC audio so the merged file plays everywhere.
pub const DEFAULT_FORMAT: &str =
    "bestvideo[vcodec^=avc1]+bestaudio[ext=m4a]/bestvideo[vcodec^=avc1]+bestaudio/best[vcodec^=avc1]";
pub const DEFAULT_CONTAINER: &str = "mp4";

/// Markers of an account or IP level block. Seeing one means every following
/// request will fail too.
const FATAL_MARKERS: &[&str] = &[
    "not a bot",
    "http error 429",
    "too many requests",
    "rate-limited",
    "rate limited",
    "your account has been terminated",
    "content isn't available, try again later",
];

/// Markers of a video that will never download, no matter how often we ask.
const NON_RETRIABLE_MARKERS: &[&str] = &[
    "confirm your age",
    "age-restricted",
    "inappropriate for some users",
    "private video",
    "video unavailable",
    "has been removed",
    "members-only",
    "join this channel",
    "copyright",
    "not available in your country",
    "geo restriction",
    "premieres in",
    "live event will begin",
];

#[cfg(test)]
static YT_DLP_STUB: Mutex<Option<PathBuf>> = const_mutex(None);
#[cfg(test)]
static STUB_USE_LOCK: Mutex<()> = const_mutex(());

fn yt_dlp_command() -> Command {
    #[cfg(test)]
    {
        if let Some(path) = YT_DLP_STUB.lock().clone() {
            return Command::new(path);
        }
    }
    Command::new("yt-dlp")
}

#[cfg(test)]
pub(crate) fn set_ytdlp_stub_path(path: PathBuf) -> YtDlpStubGuard {
    let guard = STUB_USE_LOCK.lock();
    *YT_DLP_STUB.lock() = Some(path);
    YtDlpStubGuard { lock: Some(guard) }
}

#[cfg(test)]
pub(crate) struct YtDlpStubGuard {
    lock: Option<MutexGuard<'static, ()>>,
}

#[cfg(test)]
impl Drop for YtDlpStubGuard {
    fn drop(&mut self) {
        *YT_DLP_STUB.lock() = None;
        self.lock.take();
    }
}

/// Downloads one video into a destination directory.
pub trait Fetcher {
    /// Container the downloaded file ends up in; decides the destination
    /// file name `<id>.<ext>`.
    fn output_extension(&self) -> &str;

    fn fetch(
        &self,
        video_id: &VideoId,
        destination_root: &Path,
        credentials: Option<&Path>,
    ) -> Result<(), FetchError>;
}

impl<T: Fetcher + ?Sized> Fetcher for &T {
    fn output_extension(&self) -> &str {
        (**self).output_extension()
    }

    fn fetch(
        &self,
        video_id: &VideoId,
        destination_root: &Path,
        credentials: Option<&Path>,
    ) -> Result<(), FetchError> {
        (**self).fetch(video_id, destination_root, credentials)
    }
}

/// Knobs passed straight through to yt-dlp.
#[derive(Debug, Clone)]
pub struct FetchOptions {
    /// yt-dlp `--format` selector.
    pub format: String,
    /// yt-dlp `--merge-output-format`.
    pub container: String,
    /// Let yt-dlp print its own progress and warnings.
    pub verbose: bool,
}

impl Default for FetchOptions {
    fn default() -> Self {
        Self {
            format: DEFAULT_FORMAT.to_string(),
            container: DEFAULT_CONTAINER.to_string(),
            verbose: false,
        }
    }
}

#[derive(Debug, Clone, Default)]
pub struct YtDlpFetcher {
    options: FetchOptions,
}

impl YtDlpFetcher {
    pub fn new(options: FetchOptions) -> Self {
        Self { options }
    }

    /// Runs `yt-dlp --version` to fail loudly before the first download when
    /// the program is missing.
    pub fn ensure_available(&self) -> Result<()> {
        let status = yt_dlp_command()
            .arg("--version")
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .status();

        match status {
            Ok(status) if status.success() => Ok(()),
            Ok(_) => bail!("yt-dlp is installed but returned a failure status"),
            Err(err) => bail!("yt-dlp is not installed or not in PATH: {}", err),
        }
    }

    fn build_command(
        &self,
        video_id: &VideoId,
        destination_root: &Path,
        credentials: Option<&Path>,
    ) -> Command {
        let output_pattern = destination_root.join("%(id)s.%(ext)s");
        let mut command = yt_dlp_command();
        command
            .arg("--format")
            .arg(&self.options.format)
            .arg("--merge-output-format")
            .arg(&self.options.container)
            .arg("--output")
            .arg(output_pattern)
            .arg("--no-playlist")
            .arg("--no-progress");

        if !self.options.verbose {
            command.arg("--quiet").arg("--no-warnings");
        }

        if let Some(cookies) = credentials {
            command.arg("--cookies").arg(cookies);
        }

        command
            .arg(video_url(video_id))
            .stdin(Stdio::null())
            .stdout(if self.options.verbose {
                Stdio::inherit()
            } else {
                Stdio::null()
            })
            .stderr(Stdio::piped());
        command
    }
}

impl Fetcher for YtDlpFetcher {
    fn output_extension(&self) -> &str {
        &self.options.container
    }

    fn fetch(
        &self,
        video_id: &VideoId,
        destination_root: &Path,
        credentials: Option<&Path>,
    ) -> Result<(), FetchError> {
        let mut command = self.build_command(video_id, destination_root, credentials);
        debug!(video_id = %video_id, ?command, "running yt-dlp");

        let output = command.output().map_err(|err| spawn_failure(&err))?;
        let stderr = String::from_utf8_lossy(&output.stderr);
        if self.options.verbose && !stderr.trim().is_empty() {
            eprint!("{stderr}");
        }

        if output.status.success() {
            return Ok(());
        }

        let status = output.status;
        Err(classify_failure(&stderr, &format!("yt-dlp exited with {status}")))
    }
}

pub fn video_url(video_id: &VideoId) -> String {
    format!("https://www.youtube.com/watch?v={video_id}")
}

fn spawn_failure(err: &io::Error) -> FetchError {
    FetchError::transient(format!("could not run yt-dlp: {err}"))
}

/// Maps yt-dlp's stderr onto an error kind. Only `ERROR` lines are inspected;
/// warnings can mention a marker without the download having failed for
/// that reason. Unknown failures are treated as transient so they are
/// retried a bounded number of times.
pub fn classify_failure(stderr: &str, fallback: &str) -> FetchError {
    let errors = error_lines(stderr)
        .map(str::to_lowercase)
        .collect::<Vec<_>>()
        .join("\n");
    let message = last_error_line(stderr).unwrap_or_else(|| fallback.to_string());

    // Rate limiting is reported as "Video unavailable ... try again later",
    // so block markers must win over item markers.
    if FATAL_MARKERS.iter().any(|marker| errors.contains(marker)) {
        return FetchError::fatal_block(message);
    }
    if NON_RETRIABLE_MARKERS
        .iter()
        .any(|marker| errors.contains(marker))
    {
        return FetchError::non_retriable(message);
    }
    FetchError::transient(message)
}

fn error_lines(stderr: &str) -> impl Iterator<Item = &str> {
    stderr
        .lines()
        .map(str::trim)
        .filter(|line| line.to_ascii_lowercase().starts_with("error"))
}

fn last_error_line(stderr: &str) -> Option<String> {
    let line = error_lines(stderr).last()?;
    let message = line
        .strip_prefix("ERROR: ")
        .or_else(|| line.strip_prefix("ERROR:"))
        .unwrap_or(line)
        .trim();
    if message.is_empty() {
        None
    } else {
        Some(message.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ErrorKind;
    use std::fs;
    #[cfg(unix)]
    use std::os::unix::fs::PermissionsExt;
    use tempfile::tempdir;

    fn id(raw: &str) -> VideoId {
        VideoId::new(raw).unwrap()
    }

    fn install_ytdlp_stub(dir: &Path) -> anyhow::Result<PathBuf> {
        let script_path = dir.join("yt-dlp");
        let script = r#"#!/usr/bin/env bash
set -euo pipefail

echo "$*" >> "$(dirname "$0")/calls.log"

output=""
url=""
while [[ $# -gt 0 ]]; do
  case "$1" in
    --version) echo "2025.01.01"; exit 0 ;;
    --output) output="$2"; shift 2 ;;
    --format|--merge-output-format|--cookies) shift 2 ;;
    -*) shift ;;
    *) url="$1"; shift ;;
  esac
done

id="${url##*v=}"
case "$id" in
  ok*)
    target="${output//%(id)s/$id}"
    target="${target//%(ext)s/mp4}"
    mkdir -p "$(dirname "$target")"
    echo "video" > "$target"
    exit 0
    ;;
  bot*)
    echo "ERROR: [youtube] $id: Sign in to confirm you're not a bot. Use --cookies-from-browser or --cookies for the authentication." >&2
    exit 1
    ;;
  age*)
    echo "ERROR: [youtube] $id: Sign in to confirm your age. This video may be inappropriate for some users." >&2
    exit 1
    ;;
  *)
    echo "WARNING: [youtube] $id: copyright claim on audio track; retrying fragment" >&2
    echo "ERROR: unable to download video data: Connection reset by peer" >&2
    exit 1
    ;;
esac
"#;
        fs::write(&script_path, script)?;
        #[cfg(unix)]
        {
            let mut perms = fs::metadata(&script_path)?.permissions();
            perms.set_mode(0o755);
            fs::set_permissions(&script_path, perms)?;
        }
        Ok(script_path)
    }

    #[test]
    fn classify_failure_detects_bot_checks() {
        let err = classify_failure(
            "ERROR: [youtube] abc: Sign in to confirm you’re not a bot. This helps protect our community.",
            "fallback",
        );
        assert_eq!(err.kind(), ErrorKind::FatalBlock);
        assert!(err.message().starts_with("[youtube] abc"));

        let err = classify_failure("ERROR: unable to download webpage: HTTP Error 429: Too Many Requests", "x");
        assert_eq!(err.kind(), ErrorKind::FatalBlock);

        let err = classify_failure(
            "ERROR: [youtube] abc: Video unavailable. This content isn't available, try again later.",
            "x",
        );
        assert_eq!(err.kind(), ErrorKind::FatalBlock);
    }

    #[test]
    fn classify_failure_detects_unavailable_items() {
        for stderr in [
            "ERROR: [youtube] abc: Sign in to confirm your age. This video may be inappropriate for some users.",
            "ERROR: [youtube] abc: Private video. Sign in if you've been granted access to this video",
            "ERROR: [youtube] abc: Video unavailable. This video has been removed by the uploader",
            "ERROR: [youtube] abc: Join this channel to get access to members-only content like this video",
        ] {
            assert_eq!(
                classify_failure(stderr, "x").kind(),
                ErrorKind::NonRetriableItem,
                "{stderr}"
            );
        }
    }

    #[test]
    fn classify_failure_defaults_to_transient() {
        let err = classify_failure(
            "WARNING: something\nERROR: unable to download video data: <urlopen error [Errno 104] Connection reset by peer>\n",
            "x",
        );
        assert_eq!(err.kind(), ErrorKind::Transient);
        assert!(err.message().contains("Connection reset by peer"));

        let err = classify_failure(
            "WARNING: [youtube] abc: copyright claim on audio track\n\
             WARNING: [youtube] abc: HTTP Error 429 on thumbnail, skipping\n\
             ERROR: unable to download video data: Connection reset by peer\n",
            "x",
        );
        assert_eq!(err.kind(), ErrorKind::Transient);

        let err = classify_failure("WARNING: Private video playlist entry ignored\n", "exit 1");
        assert_eq!(err.kind(), ErrorKind::Transient);
        assert_eq!(err.message(), "exit 1");

        let err = classify_failure("", "yt-dlp exited with exit status: 1");
        assert_eq!(err.kind(), ErrorKind::Transient);
        assert_eq!(err.message(), "yt-dlp exited with exit status: 1");
    }

    #[test]
    fn default_fetcher_targets_mp4() {
        let fetcher = YtDlpFetcher::default();
        assert_eq!(fetcher.output_extension(), "mp4");
        assert_eq!(video_url(&id("abc")), "https://www.youtube.com/watch?v=abc");

        fn extension_of<F: Fetcher>(fetcher: F) -> String {
            fetcher.output_extension().to_string()
        }
        let boxed: Box<dyn Fetcher> = Box::new(YtDlpFetcher::default());
        assert_eq!(extension_of(&fetcher), "mp4");
        assert_eq!(extension_of(boxed.as_ref()), "mp4");
    }

    #[test]
    fn fetch_writes_file_and_passes_cookies() -> anyhow::Result<()> {
        let temp = tempdir()?;
        let stub = install_ytdlp_stub(temp.path())?;
        let _guard = set_ytdlp_stub_path(stub);
        let out = temp.path().join("videos");
        let cookies = temp.path().join("cookies.txt");

        let fetcher = YtDlpFetcher::default();
        fetcher.ensure_available()?;
        fetcher.fetch(&id("ok123"), &out, Some(&cookies))?;

        assert!(out.join("ok123.mp4").exists());
        let calls = fs::read_to_string(temp.path().join("calls.log"))?;
        let fetch_call = calls.lines().last().unwrap();
        assert!(fetch_call.contains("--merge-output-format mp4"));
        assert!(fetch_call.contains("--quiet"));
        assert!(fetch_call.contains(&format!("--cookies {}", cookies.display())));
        assert!(fetch_call.ends_with("https://www.youtube.com/watch?v=ok123"));
        Ok(())
    }

    #[test]
    fn fetch_classifies_stub_failures() -> anyhow::Result<()> {
        let temp = tempdir()?;
        let stub = install_ytdlp_stub(temp.path())?;
        let _guard = set_ytdlp_stub_path(stub);
        let fetcher = YtDlpFetcher::default();

        let bot = fetcher.fetch(&id("bot1"), temp.path(), None).unwrap_err();
        assert_eq!(bot.kind(), ErrorKind::FatalBlock);

        let age = fetcher.fetch(&id("age1"), temp.path(), None).unwrap_err();
        assert_eq!(age.kind(), ErrorKind::NonRetriableItem);

        let flaky = fetcher.fetch(&id("flaky1"), temp.path(), None).unwrap_err();
        assert_eq!(flaky.kind(), ErrorKind::Transient);
        assert_eq!(
            flaky.message(),
            "unable to download video data: Connection reset by peer"
        );

        let calls = fs::read_to_string(temp.path().join("calls.log"))?;
        assert!(!calls.contains("--cookies"));
        Ok(())
    }

    #[test]
    fn ensure_available_reports_missing_program() {
        let temp = tempdir().unwrap();
        let _guard = set_ytdlp_stub_path(temp.path().join("does-not-exist"));
        let err = YtDlpFetcher::default().ensure_available().unwrap_err();
        assert!(err.to_string().contains("not installed"));
    }
}
