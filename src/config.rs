#![forbid(unsafe_code)]

use crate::orchestrator::RetryPolicy;
use anyhow::{Context, Result, anyhow};
use std::{
    collections::HashMap,
    env, fs,
    path::{Path, PathBuf},
    time::Duration,
};

pub const DEFAULT_ENV_PATH: &str = ".env";
pub const DEFAULT_LOG_FILE: &str = "download.log";

/// Everything the downloader needs once the `.env` file, the process
/// environment and the command line have been merged.
#[derive(Debug, Clone)]
pub struct Settings {
    pub download_root: PathBuf,
    pub cookies_path: Option<PathBuf>,
    pub log_path: PathBuf,
    pub metrics_url: Option<String>,
    pub retry: RetryPolicy,
}

/// Values supplied on the command line. They win over both the environment
/// and the `.env` file.
#[derive(Debug, Clone, Default)]
pub struct SettingsOverrides {
    pub download_root: Option<PathBuf>,
    pub cookies_path: Option<PathBuf>,
    pub log_path: Option<PathBuf>,
    pub metrics_url: Option<String>,
    pub max_attempts: Option<u32>,
    pub backoff_secs: Option<u64>,
    pub polite_delay_secs: Option<u64>,
    pub give_up_budget: Option<u32>,
    pub env_path: Option<PathBuf>,
}

pub fn resolve_settings(overrides: SettingsOverrides) -> Result<Settings> {
    let env_path = overrides
        .env_path
        .as_deref()
        .unwrap_or_else(|| Path::new(DEFAULT_ENV_PATH));
    let file_vars = read_env_file(env_path)?;
    build_settings(&file_vars, env_var_string, overrides)
}

fn build_settings(
    file_vars: &HashMap<String, String>,
    env_lookup: impl Fn(&str) -> Option<String>,
    overrides: SettingsOverrides,
) -> Result<Settings> {
    let download_root = overrides
        .download_root
        .or_else(|| lookup_value("DOWNLOAD_ROOT", file_vars, &env_lookup).map(PathBuf::from))
        .ok_or_else(|| anyhow!("DOWNLOAD_ROOT not set; pass --output-root"))?;
    let cookies_path = overrides
        .cookies_path
        .or_else(|| lookup_value("COOKIES_PATH", file_vars, &env_lookup).map(PathBuf::from));
    let log_path = overrides
        .log_path
        .or_else(|| lookup_value("LOG_PATH", file_vars, &env_lookup).map(PathBuf::from))
        .unwrap_or_else(|| download_root.join(DEFAULT_LOG_FILE));
    let metrics_url = overrides
        .metrics_url
        .map(|value| value.trim().to_string())
        .filter(|value| !value.is_empty())
        .or_else(|| lookup_value("METRICS_URL", file_vars, &env_lookup));

    let defaults = RetryPolicy::default();
    let max_attempts = overrides
        .max_attempts
        .or_else(|| lookup_number("MAX_ATTEMPTS", file_vars, &env_lookup))
        .filter(|value| *value > 0)
        .unwrap_or(defaults.max_attempts);
    let backoff = overrides
        .backoff_secs
        .or_else(|| lookup_number("BACKOFF_SECS", file_vars, &env_lookup))
        .map(Duration::from_secs)
        .unwrap_or(defaults.backoff);
    let polite_delay = overrides
        .polite_delay_secs
        .or_else(|| lookup_number("POLITE_DELAY_SECS", file_vars, &env_lookup))
        .map(Duration::from_secs)
        .unwrap_or(defaults.polite_delay);
    let give_up_budget = overrides
        .give_up_budget
        .or_else(|| lookup_number("GIVE_UP_BUDGET", file_vars, &env_lookup))
        .unwrap_or(defaults.give_up_budget);

    Ok(Settings {
        download_root,
        cookies_path,
        log_path,
        metrics_url,
        retry: RetryPolicy {
            max_attempts,
            backoff,
            polite_delay,
            give_up_budget,
        },
    })
}

fn env_var_string(key: &str) -> Option<String> {
    env::var(key).ok().and_then(|value| {
        let trimmed = value.trim();
        if trimmed.is_empty() {
            None
        } else {
            Some(trimmed.to_string())
        }
    })
}

fn lookup_value(
    key: &str,
    file_vars: &HashMap<String, String>,
    env_lookup: &impl Fn(&str) -> Option<String>,
) -> Option<String> {
    env_lookup(key)
        .or_else(|| file_vars.get(key).cloned())
        .filter(|value| !value.trim().is_empty())
}

fn lookup_number<T: std::str::FromStr>(
    key: &str,
    file_vars: &HashMap<String, String>,
    env_lookup: &impl Fn(&str) -> Option<String>,
) -> Option<T> {
    lookup_value(key, file_vars, env_lookup).and_then(|value| value.trim().parse::<T>().ok())
}

pub fn read_env_file(path: &Path) -> Result<HashMap<String, String>> {
    let mut vars = HashMap::new();
    if !path.exists() {
        return Ok(vars);
    }
    let content =
        fs::read_to_string(path).with_context(|| format!("Reading {}", path.display()))?;
    for line in content.lines() {
        let trimmed = line.trim();
        if trimmed.is_empty() || trimmed.starts_with('#') {
            continue;
        }
        let line = trimmed.strip_prefix("export ").unwrap_or(trimmed);
        let Some((key, value_raw)) = line.split_once('=') else {
            continue;
        };
        let key = key.trim();
        if key.is_empty() {
            continue;
        }
        let value = value_raw.trim();
        let value = value
            .strip_prefix('"')
            .and_then(|value| value.strip_suffix('"'))
            .or_else(|| {
                value
                    .strip_prefix('\'')
                    .and_then(|value| value.strip_suffix('\''))
            })
            .unwrap_or(value);
        vars.insert(key.to_string(), value.to_string());
    }
    Ok(vars)
}
