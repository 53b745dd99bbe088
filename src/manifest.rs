//! Reads the newline-delimited JSON manifests that list the videos to fetch.
//!
//! Two record shapes are accepted per line:
//!
//! * `{"id": "<video id>", "snippet": {...}}`, either a bare id or a full
//!   YouTube Data API video resource.
//! * `{"videos": [{"videoId": "<video id>", "categoryName": "..."}]}`, the
//!   per-channel dumps produced by the crawler.
//!
//! Lines that match neither shape are reported back as warnings and skipped.

use crate::error::ManifestError;
use crate::log_sink::LogSink;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::fmt;
use std::fs::File;
use std::io::{self, BufRead, BufReader};
use std::path::Path;

/// Opaque identifier understood by the fetch collaborator.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct VideoId(String);

impl VideoId {
    /// Returns `None` for ids that are empty once trimmed.
    pub fn new(raw: &str) -> Option<Self> {
        let trimmed = raw.trim();
        if trimmed.is_empty() {
            None
        } else {
            Some(Self(trimmed.to_owned()))
        }
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for VideoId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Filters applied while reading. Everything is matched case-insensitively.
#[derive(Debug, Clone, Default)]
pub struct ManifestFilter {
    /// Drops `videos` entries whose `categoryName` is listed here.
    pub excluded_categories: Vec<String>,
    /// Keeps `id` records whose `snippet.title` contains one of these.
    pub title_keywords: Vec<String>,
    /// Keeps `id` records whose `snippet.description` contains one of these.
    pub description_keywords: Vec<String>,
}

impl ManifestFilter {
    fn has_keywords(&self) -> bool {
        !self.title_keywords.is_empty() || !self.description_keywords.is_empty()
    }

    fn category_excluded(&self, category: Option<&str>) -> bool {
        let Some(category) = category.map(str::trim) else {
            return false;
        };
        self.excluded_categories
            .iter()
            .any(|excluded| excluded.trim().eq_ignore_ascii_case(category))
    }

    fn keywords_match(&self, snippet: Option<&Snippet>) -> bool {
        if !self.has_keywords() {
            return true;
        }
        let Some(snippet) = snippet else {
            return false;
        };
        contains_any(snippet.title.as_deref(), &self.title_keywords)
            || contains_any(snippet.description.as_deref(), &self.description_keywords)
    }
}

fn contains_any(haystack: Option<&str>, keywords: &[String]) -> bool {
    let Some(haystack) = haystack else {
        return false;
    };
    let haystack = haystack.to_lowercase();
    keywords
        .iter()
        .map(|keyword| keyword.trim().to_lowercase())
        .filter(|keyword| !keyword.is_empty())
        .any(|keyword| haystack.contains(&keyword))
}

#[derive(Debug, Deserialize)]
struct Snippet {
    #[serde(default)]
    title: Option<String>,
    #[serde(default)]
    description: Option<String>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct ChannelVideo {
    video_id: String,
    #[serde(default)]
    category_name: Option<String>,
}

/// Ordered ids plus what was dropped along the way.
#[derive(Debug, Default)]
pub struct Manifest {
    pub ids: Vec<VideoId>,
    /// Non-blank lines seen.
    pub records: usize,
    /// Entries removed by the category or keyword filters.
    pub filtered: usize,
    pub warnings: Vec<ManifestError>,
}

impl Manifest {
    /// Writes one warning line per malformed manifest line.
    pub fn log_warnings(&self, log: &mut LogSink) {
        for warning in &self.warnings {
            log.log(&format!("Warning: skipping {warning}"));
        }
    }

    /// Applies the `--start`/`--end` window. `end == -1` means "to the end";
    /// other negative values drop that many ids from the end, so `-2` leaves
    /// off the last two. Out-of-range bounds clamp instead of failing.
    pub fn slice(mut self, start: usize, end: i64) -> Self {
        let len = self.ids.len();
        let end = if end == -1 {
            len
        } else if end < 0 {
            len.saturating_sub(end.unsigned_abs() as usize)
        } else {
            (end as usize).min(len)
        };
        let start = start.min(end);
        self.ids = self.ids.drain(start..end).collect();
        self
    }
}

pub fn read_manifest(path: &Path, filter: &ManifestFilter) -> Result<Manifest, ManifestError> {
    let file = File::open(path).map_err(|source| ManifestError::Io {
        path: path.to_path_buf(),
        source,
    })?;
    parse_manifest(BufReader::new(file), path, filter)
}

fn parse_manifest<R: BufRead>(
    reader: R,
    path: &Path,
    filter: &ManifestFilter,
) -> Result<Manifest, ManifestError> {
    let mut manifest = Manifest::default();

    for (index, line) in reader.lines().enumerate() {
        let line_number = index + 1;
        let line = match line {
            Ok(line) => line,
            Err(err) if err.kind() == io::ErrorKind::InvalidData => {
                manifest.records += 1;
                manifest.warnings.push(ManifestError::Malformed {
                    line: line_number,
                    reason: "line is not valid UTF-8".into(),
                });
                continue;
            }
            Err(source) => {
                return Err(ManifestError::Io {
                    path: path.to_path_buf(),
                    source,
                });
            }
        };
        if line.trim().is_empty() {
            continue;
        }
        manifest.records += 1;

        if let Err(reason) = parse_record(&line, filter, &mut manifest) {
            manifest.warnings.push(ManifestError::Malformed {
                line: line_number,
                reason,
            });
        }
    }

    Ok(manifest)
}

fn parse_record(line: &str, filter: &ManifestFilter, manifest: &mut Manifest) -> Result<(), String> {
    let value: Value = serde_json::from_str(line).map_err(|err| err.to_string())?;

    if let Some(id) = value.get("id") {
        let id = id
            .as_str()
            .and_then(VideoId::new)
            .ok_or_else(|| "`id` is not a non-empty string".to_string())?;
        let snippet = value
            .get("snippet")
            .map(|raw| Snippet::deserialize(raw).map_err(|err| format!("bad snippet: {err}")))
            .transpose()?;
        if filter.keywords_match(snippet.as_ref()) {
            manifest.ids.push(id);
        } else {
            manifest.filtered += 1;
        }
        return Ok(());
    }

    if let Some(videos) = value.get("videos") {
        let videos = Vec::<ChannelVideo>::deserialize(videos)
            .map_err(|err| format!("bad `videos` list: {err}"))?;
        // Validate the whole line before keeping any of it.
        let mut kept = Vec::with_capacity(videos.len());
        let mut filtered = 0;
        for video in videos {
            let id = VideoId::new(&video.video_id)
                .ok_or_else(|| "empty `videoId` in `videos` list".to_string())?;
            if filter.category_excluded(video.category_name.as_deref()) {
                filtered += 1;
            } else {
                kept.push(id);
            }
        }
        manifest.ids.extend(kept);
        manifest.filtered += filtered;
        return Ok(());
    }

    Err("record has neither `id` nor `videos`".into())
}
