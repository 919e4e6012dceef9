//! Configuration management with serde serialization/deserialization
//!
//! This module provides the configuration surface of the prerender service:
//! render budget, power and bandwidth tiers, run mode, browser pool sizing,
//! cache policy, and the request/result types exchanged with callers.

use crate::RenderError;
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::path::{Path, PathBuf};
use std::time::{Duration, SystemTime};

/// Main configuration structure for the prerender service
///
/// Every field has a default, so a configuration file only needs to list the
/// values it overrides.
///
/// # Examples
///
/// ```rust
/// use prerender_service::{Config, PowerLevel};
///
/// let config = Config {
///     power_level: PowerLevel::Three,
///     isolated_profiles: true,
///     ..Default::default()
/// };
/// assert!(config.validate().is_ok());
/// ```
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct Config {
    /// Overall wall-clock budget for one render (default: 20 seconds)
    pub render_timeout: Duration,

    /// Reservation subtracted from the budget before navigation starts (default: 1.5 seconds)
    pub gap_duration: Duration,

    /// How aggressively captured markup is rewritten (default: two)
    pub power_level: PowerLevel,

    /// Network tier; level two caps the navigation timeout (default: one)
    pub bandwidth_level: BandwidthLevel,

    /// Navigation timeout ceiling used under bandwidth level two (default: 3 seconds)
    pub constrained_navigation_ceiling: Duration,

    /// Upper bound of the idle-debounce wait after navigation (default: 3 seconds)
    pub idle_hard_ceiling: Duration,

    /// Development mode lengthens debounce intervals and disables minification
    pub run_mode: RunMode,

    /// Number of transform worker threads (default: CPU count)
    pub max_workers: usize,

    /// HTTP statuses whose renders are written to the content cache
    pub cacheable_status_codes: BTreeSet<u16>,

    /// Pattern identifying a rendered "not found" page
    pub not_found_marker: String,

    /// Number of long-lived browser processes (default: 1)
    pub browser_pool_size: usize,

    /// Ceiling on simultaneously open pages across the pool (default: 20)
    pub max_open_pages: usize,

    /// Launch a dedicated browser with a fresh user-data directory per page
    pub isolated_profiles: bool,

    /// Parent directory for browser user-data directories
    pub user_data_root: PathBuf,

    /// Path to Chrome/Chromium executable (default: auto-detect)
    pub chrome_path: Option<String>,

    /// Custom User-Agent string for rendered pages
    pub user_agent: Option<String>,

    /// Browser window size used while rendering
    pub viewport: Viewport,

    /// Store cache entries gzip-compressed (default: true)
    pub compress_cache_entries: bool,

    /// Run compress + full optimize on cached renders in the background (default: false)
    pub deferred_optimization: bool,

    /// Concurrency limit for batch rendering (default: 10)
    pub max_concurrent_renders: usize,

    /// Browser instances older than this are recycled by the health task (default: 1 hour)
    pub max_instance_age: Duration,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            render_timeout: Duration::from_secs(20),
            gap_duration: Duration::from_millis(1500),
            power_level: PowerLevel::Two,
            bandwidth_level: BandwidthLevel::One,
            constrained_navigation_ceiling: Duration::from_secs(3),
            idle_hard_ceiling: Duration::from_secs(3),
            run_mode: RunMode::Production,
            max_workers: num_cpus::get().max(1),
            cacheable_status_codes: [200, 302].into_iter().collect(),
            not_found_marker: DEFAULT_NOT_FOUND_MARKER.to_string(),
            browser_pool_size: 1,
            max_open_pages: 20,
            isolated_profiles: false,
            user_data_root: std::env::temp_dir().join("prerender-user-data"),
            chrome_path: None,
            user_agent: None,
            viewport: Viewport::default(),
            compress_cache_entries: true,
            deferred_optimization: false,
            max_concurrent_renders: 10,
            max_instance_age: Duration::from_secs(3600),
        }
    }
}

/// Element id the rendered application uses for its "not found" view.
pub const DEFAULT_NOT_FOUND_MARKER: &str = r#"<[^>]+id=["']?404-page["']?"#;

impl Config {
    pub fn validate(&self) -> Result<(), RenderError> {
        if self.render_timeout.is_zero() {
            return Err(RenderError::ConfigurationError(
                "Render timeout must be greater than 0".to_string(),
            ));
        }
        if self.browser_pool_size == 0 {
            return Err(RenderError::ConfigurationError(
                "Browser pool size must be greater than 0".to_string(),
            ));
        }
        if self.max_open_pages == 0 {
            return Err(RenderError::ConfigurationError(
                "Max open pages must be greater than 0".to_string(),
            ));
        }
        if self.max_workers == 0 {
            return Err(RenderError::ConfigurationError(
                "Max workers must be greater than 0".to_string(),
            ));
        }
        if self.max_concurrent_renders == 0 {
            return Err(RenderError::ConfigurationError(
                "Max concurrent renders must be greater than 0".to_string(),
            ));
        }
        if self.cacheable_status_codes.is_empty() {
            return Err(RenderError::ConfigurationError(
                "At least one cacheable status code is required".to_string(),
            ));
        }
        regex::Regex::new(&self.not_found_marker)?;
        Ok(())
    }

    /// Ceiling applied to the navigation timeout for the configured bandwidth tier.
    pub fn navigation_ceiling(&self) -> Duration {
        match self.bandwidth_level {
            BandwidthLevel::Two => self.constrained_navigation_ceiling,
            BandwidthLevel::One => self.render_timeout,
        }
    }

    pub fn idle_settings(&self) -> IdleSettings {
        let (first_interval, interval) = match self.run_mode {
            RunMode::Development => (Duration::from_millis(1500), Duration::from_millis(500)),
            RunMode::Production => (Duration::from_millis(250), Duration::from_millis(150)),
        };

        IdleSettings {
            first_interval,
            interval,
            hard_ceiling: self.idle_hard_ceiling,
        }
    }

    pub fn is_cacheable(&self, status: u16) -> bool {
        self.cacheable_status_codes.contains(&status)
    }

    pub async fn load(path: &Path) -> Result<Self, RenderError> {
        let content = tokio::fs::read_to_string(path).await?;
        let config: Config = serde_json::from_str(&content)?;
        config.validate()?;
        Ok(config)
    }
}

/// Tiered setting controlling how aggressively markup is rewritten
///
/// Tier one disables all rewriting except script stripping.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum PowerLevel {
    One,
    Two,
    Three,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum BandwidthLevel {
    One,
    Two,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum RunMode {
    Development,
    Production,
}

impl std::str::FromStr for PowerLevel {
    type Err = RenderError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "1" | "one" => Ok(PowerLevel::One),
            "2" | "two" => Ok(PowerLevel::Two),
            "3" | "three" => Ok(PowerLevel::Three),
            other => Err(RenderError::ConfigurationError(format!(
                "Unknown power level: {other}"
            ))),
        }
    }
}

impl std::str::FromStr for RunMode {
    type Err = RenderError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "development" | "dev" => Ok(RunMode::Development),
            "production" | "prod" => Ok(RunMode::Production),
            other => Err(RenderError::ConfigurationError(format!(
                "Unknown run mode: {other}"
            ))),
        }
    }
}

/// Timers of the idle-debounce wait that follows navigation
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct IdleSettings {
    /// Idle interval armed before any network event was seen
    pub first_interval: Duration,
    /// Idle interval re-armed after each network event
    pub interval: Duration,
    /// The wait never exceeds this, whatever budget remains
    pub hard_ceiling: Duration,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct Viewport {
    pub width: u32,
    pub height: u32,
}

impl Default for Viewport {
    fn default() -> Self {
        Self {
            width: 1366,
            height: 768,
        }
    }
}

/// One orchestration run
#[derive(Debug, Clone)]
pub struct RenderRequest {
    pub id: String,
    pub url: String,
    pub is_first_request: bool,
    pub requested_at: SystemTime,
}

impl RenderRequest {
    pub fn new(url: impl Into<String>, is_first_request: bool) -> Self {
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            url: url.into(),
            is_first_request,
            requested_at: SystemTime::now(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RenderResult {
    pub html: String,
    pub status: u16,
    pub served_from_cache: bool,
}

/// Generate Chrome command-line arguments for a headless render browser
///
/// `user_data_dir` isolates browser storage; pool instances each get their own.
pub fn get_chrome_args(config: &Config, user_data_dir: &Path) -> Vec<String> {
    let mut args = vec![
        "--headless".to_string(),
        "--no-sandbox".to_string(),
        "--disable-dev-shm-usage".to_string(),
        "--disable-gpu".to_string(),
        "--disable-background-timer-throttling".to_string(),
        "--disable-backgrounding-occluded-windows".to_string(),
        "--disable-renderer-backgrounding".to_string(),
        "--disable-features=TranslateUI".to_string(),
        "--disable-extensions".to_string(),
        "--disable-default-apps".to_string(),
        "--disable-sync".to_string(),
        "--no-first-run".to_string(),
        "--mute-audio".to_string(),
        "--ignore-certificate-errors".to_string(),
        format!(
            "--window-size={},{}",
            config.viewport.width, config.viewport.height
        ),
        format!("--user-data-dir={}", user_data_dir.display()),
    ];

    if config.power_level == PowerLevel::One {
        // lowest tier: keep the browser as light as possible
        args.push("--single-process".to_string());
        args.push("--no-zygote".to_string());
    }

    if let Some(user_agent) = &config.user_agent {
        args.push(format!("--user-agent={user_agent}"));
    }

    args
}

pub fn create_browser_config(
    config: &Config,
    user_data_dir: &Path,
) -> Result<chromiumoxide::browser::BrowserConfig, RenderError> {
    use chromiumoxide::browser::BrowserConfig;

    let mut builder = BrowserConfig::builder()
        .window_size(config.viewport.width, config.viewport.height)
        .request_timeout(config.render_timeout)
        .args(get_chrome_args(config, user_data_dir));

    if let Some(chrome_path) = &config.chrome_path {
        builder = builder.chrome_executable(chrome_path);
    }

    builder.build().map_err(RenderError::BrowserLaunchFailed)
}
