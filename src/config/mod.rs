//! Application configuration management

use std::env;
use std::time::Duration;

use anyhow::{Context, Result, bail};

/// Which upstream media manager the service talks to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MediaManagerKind {
    Radarr,
    Sonarr,
}

impl MediaManagerKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            MediaManagerKind::Radarr => "radarr",
            MediaManagerKind::Sonarr => "sonarr",
        }
    }

    /// Library root used when `LIBRARY_PATH` is not set
    pub fn default_library_path(&self) -> &'static str {
        match self {
            MediaManagerKind::Radarr => "/movies",
            MediaManagerKind::Sonarr => "/tv",
        }
    }
}

/// Where free space for the library path is read from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DiskSpaceSource {
    /// Stat the host filesystem the process runs on
    Local,
    /// Ask the media manager's `diskspace` endpoint
    Upstream,
}

/// Application configuration loaded from environment variables
#[derive(Debug, Clone)]
pub struct Config {
    /// Bind host
    pub host: String,

    /// Bind port
    pub port: u16,

    /// Upstream flavour (radarr or sonarr)
    pub media_manager: MediaManagerKind,

    /// Media manager base URL, without trailing slash
    pub media_manager_url: String,

    /// Media manager API key (sent as `X-Api-Key`)
    pub media_manager_api_key: String,

    /// Minimum free space in GB before the search phase runs
    pub min_free_space_gb: f64,

    /// Hours after which a queued download counts as stalled
    pub stalled_threshold_hours: f64,

    /// Minutes to wait between two consecutive searches
    pub search_delay_minutes: u64,

    /// Run the background scheduler
    pub enable_scheduler: bool,

    /// Hours between scheduled sweeps
    pub scheduler_interval_hours: u64,

    /// Run the first sweep as soon as the scheduler starts
    pub scheduler_run_on_startup: bool,

    /// Library path whose free space gates the search phase
    pub library_path: String,

    /// Free-space source for the library path
    pub disk_space_source: DiskSpaceSource,

    /// Timeout for each media manager request
    pub http_timeout: Duration,

    /// Timeout for each disk space probe
    pub disk_probe_timeout: Duration,

    /// Minimum log level when `RUST_LOG` is not set
    pub log_level: String,

    /// Optional file that receives a copy of the logs
    pub log_file: Option<String>,

    /// Deprecated variables that were set; logged once tracing is up
    pub deprecated_vars: Vec<&'static str>,
}

impl Config {
    /// Load configuration from environment variables
    pub fn from_env() -> Result<Self> {
        Self::from_lookup(|key| env::var(key).ok())
    }

    /// Load configuration from an arbitrary key lookup.
    ///
    /// Empty values are treated as unset.
    pub fn from_lookup<F>(lookup: F) -> Result<Self>
    where
        F: Fn(&str) -> Option<String>,
    {
        let get = |key: &str| lookup(key).filter(|v| !v.trim().is_empty());

        let media_manager = match get("MEDIA_MANAGER").as_deref().map(str::to_lowercase) {
            None => MediaManagerKind::Radarr,
            Some(v) if v == "radarr" => MediaManagerKind::Radarr,
            Some(v) if v == "sonarr" => MediaManagerKind::Sonarr,
            Some(other) => bail!("MEDIA_MANAGER must be radarr or sonarr, got {other}"),
        };

        let (url_key, api_key_key) = match media_manager {
            MediaManagerKind::Radarr => ("RADARR_URL", "RADARR_API_KEY"),
            MediaManagerKind::Sonarr => ("SONARR_URL", "SONARR_API_KEY"),
        };
        let media_manager_url = validate_base_url(
            url_key,
            &get(url_key).with_context(|| format!("{url_key} is required"))?,
        )?;
        let media_manager_api_key = get(api_key_key)
            .with_context(|| format!("{api_key_key} is required"))?;

        let mut deprecated_vars = Vec::new();
        if get("SEARCH_INTERVAL_HOURS").is_some() {
            deprecated_vars.push("SEARCH_INTERVAL_HOURS");
        }
        if get("MAX_CONCURRENT_SEARCHES").is_some() {
            deprecated_vars.push("MAX_CONCURRENT_SEARCHES");
        }

        let disk_space_source = match get("DISK_SPACE_SOURCE").as_deref().map(str::to_lowercase) {
            None => DiskSpaceSource::Local,
            Some(v) if v == "local" => DiskSpaceSource::Local,
            Some(v) if v == "upstream" => DiskSpaceSource::Upstream,
            Some(other) => bail!("DISK_SPACE_SOURCE must be local or upstream, got {other}"),
        };

        Ok(Self {
            host: get("HOST").unwrap_or_else(|| "0.0.0.0".to_string()),

            port: get("PORT")
                .unwrap_or_else(|| "5001".to_string())
                .parse()
                .context("Invalid PORT")?,

            media_manager,
            media_manager_url,
            media_manager_api_key,

            min_free_space_gb: in_range(
                get("MIN_FREE_SPACE_GB"),
                "MIN_FREE_SPACE_GB",
                20,
                MAX_FREE_SPACE_GB,
            )? as f64,

            stalled_threshold_hours: in_range(
                get("STALLED_DOWNLOAD_HOURS"),
                "STALLED_DOWNLOAD_HOURS",
                4,
                HOURS_PER_YEAR,
            )? as f64,

            search_delay_minutes: in_range(
                get("SEARCH_DELAY_MINUTES"),
                "SEARCH_DELAY_MINUTES",
                5,
                MINUTES_PER_DAY,
            )?,

            enable_scheduler: parse_bool(get("ENABLE_SCHEDULER"), "ENABLE_SCHEDULER", true)?,

            scheduler_interval_hours: in_range(
                get("SCHEDULER_INTERVAL_HOURS"),
                "SCHEDULER_INTERVAL_HOURS",
                6,
                HOURS_PER_YEAR,
            )?,

            scheduler_run_on_startup: parse_bool(
                get("SCHEDULER_RUN_ON_STARTUP"),
                "SCHEDULER_RUN_ON_STARTUP",
                true,
            )?,

            library_path: get("LIBRARY_PATH")
                .unwrap_or_else(|| media_manager.default_library_path().to_string()),

            disk_space_source,

            http_timeout: Duration::from_secs(in_range(
                get("HTTP_TIMEOUT_SECONDS"),
                "HTTP_TIMEOUT_SECONDS",
                30,
                MAX_TIMEOUT_SECONDS,
            )?),

            disk_probe_timeout: Duration::from_secs(in_range(
                get("DISK_PROBE_TIMEOUT_SECONDS"),
                "DISK_PROBE_TIMEOUT_SECONDS",
                10,
                MAX_TIMEOUT_SECONDS,
            )?),

            log_level: get("LOG_LEVEL")
                .map(|v| v.to_lowercase())
                .unwrap_or_else(|| "info".to_string()),

            log_file: get("LOG_FILE"),

            deprecated_vars,
        })
    }

    pub fn search_delay(&self) -> Duration {
        Duration::from_secs(self.search_delay_minutes.saturating_mul(60))
    }

    pub fn scheduler_interval(&self) -> Duration {
        Duration::from_secs(self.scheduler_interval_hours.saturating_mul(3600))
    }
}

fn validate_base_url(key: &str, raw: &str) -> Result<String> {
    if !raw.starts_with("http://") && !raw.starts_with("https://") {
        bail!("{key} must start with http:// or https://");
    }
    url::Url::parse(raw).with_context(|| format!("{key} is not a valid URL"))?;
    Ok(raw.trim_end_matches('/').to_string())
}

const HOURS_PER_YEAR: u64 = 24 * 365;
const MINUTES_PER_DAY: u64 = 24 * 60;
const MAX_TIMEOUT_SECONDS: u64 = 3600;
const MAX_FREE_SPACE_GB: u64 = 1_000_000;

/// Parse an integer in `1..=max`, falling back to `default` when unset
fn in_range(value: Option<String>, key: &str, default: u64, max: u64) -> Result<u64> {
    let parsed = match value {
        Some(v) => v
            .trim()
            .parse::<u64>()
            .with_context(|| format!("Invalid {key}"))?,
        None => default,
    };
    if parsed < 1 {
        bail!("{key} must be at least 1");
    }
    if parsed > max {
        bail!("{key} must be at most {max}");
    }
    Ok(parsed)
}

fn parse_bool(value: Option<String>, key: &str, default: bool) -> Result<bool> {
    match value.as_deref().map(|v| v.trim().to_lowercase()) {
        None => Ok(default),
        Some(v) => match v.as_str() {
            "true" | "1" | "yes" | "on" => Ok(true),
            "false" | "0" | "no" | "off" => Ok(false),
            _ => bail!("Invalid {key}: expected true or false"),
        },
    }
}
