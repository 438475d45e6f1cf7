use serde::Deserialize;
use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing::{debug, warn};

/// Minimum fraction of the frame area a detected symbol must cover.
pub const DEFAULT_MIN_AREA_FRACTION: f64 = 0.001;

/// Cool-down applied to the submission gate after a new code is accepted.
pub const DEFAULT_COOLDOWN_MS: u64 = 500;

#[derive(Debug, Clone, Default, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub source: SourceConfig,
    #[serde(default)]
    pub pipeline: PipelineConfig,
    #[serde(default)]
    pub gate: GateConfig,
    #[serde(default)]
    pub filter: FilterConfig,
    #[serde(default)]
    pub history: HistoryConfig,
    #[serde(default)]
    pub export: ExportConfig,
    #[serde(default)]
    pub logging: LoggingConfig,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SourceMode {
    /// Multipart MJPEG stream over HTTP.
    Mjpeg,
    /// Periodic single-JPEG snapshots over HTTP.
    Polling,
    /// Replays still images from a local directory.
    Directory,
}

#[derive(Debug, Clone, Deserialize)]
pub struct SourceConfig {
    #[serde(default = "default_source_mode")]
    pub mode: SourceMode,
    #[serde(default = "default_source_url")]
    pub url: String,
    #[serde(default)]
    pub path: Option<PathBuf>,
    #[serde(default = "default_fps")]
    pub fps: f64,
}

#[derive(Debug, Clone, Deserialize)]
pub struct PipelineConfig {
    #[serde(default = "default_tick_interval")]
    pub tick_interval_ms: u64,
    /// Minimum spacing between two decode submissions. 0 disables the limiter.
    #[serde(default = "default_min_submit_interval")]
    pub min_submit_interval_ms: u64,
    /// Watchdog for a hung decode. 0 keeps the no-timeout behavior.
    #[serde(default)]
    pub decode_timeout_ms: u64,
}

#[derive(Debug, Clone, Deserialize)]
pub struct GateConfig {
    #[serde(default = "default_cooldown")]
    pub cooldown_ms: u64,
}

#[derive(Debug, Clone, Deserialize)]
pub struct FilterConfig {
    #[serde(default = "default_min_area_fraction")]
    pub min_area_fraction: f64,
}

#[derive(Debug, Clone, Deserialize)]
pub struct HistoryConfig {
    #[serde(default = "default_true")]
    pub enabled: bool,
    #[serde(default = "default_history_path")]
    pub path: PathBuf,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ExportFormat {
    /// One code per line.
    Text,
    /// Single `code` column with a header row.
    Csv,
}

impl ExportFormat {
    pub fn extension(self) -> &'static str {
        match self {
            ExportFormat::Text => "txt",
            ExportFormat::Csv => "csv",
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct ExportConfig {
    #[serde(default = "default_export_dir")]
    pub dir: PathBuf,
    #[serde(default = "default_export_format")]
    pub format: ExportFormat,
    #[serde(default = "default_true")]
    pub on_exit: bool,
}

#[derive(Debug, Clone, Deserialize)]
pub struct LoggingConfig {
    #[serde(default = "default_log_level")]
    pub level: String,
}

impl Default for SourceConfig {
    fn default() -> Self {
        Self {
            mode: default_source_mode(),
            url: default_source_url(),
            path: None,
            fps: default_fps(),
        }
    }
}

impl SourceConfig {
    /// Spacing between frames for polling and directory replay.
    ///
    /// Non-finite or non-positive `fps` falls back to the default rate; the
    /// result is never below 1 ms.
    pub fn frame_interval(&self) -> Duration {
        let fps = if self.fps.is_finite() && self.fps > 0.0 {
            self.fps
        } else {
            warn!(fps = self.fps, fallback = default_fps(), "invalid fps, using default");
            default_fps()
        };
        Duration::from_secs_f64(1.0 / fps).max(Duration::from_millis(1))
    }
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            tick_interval_ms: default_tick_interval(),
            min_submit_interval_ms: default_min_submit_interval(),
            decode_timeout_ms: 0,
        }
    }
}

impl PipelineConfig {
    pub fn tick_interval(&self) -> Duration {
        Duration::from_millis(self.tick_interval_ms.max(1))
    }

    pub fn min_submit_interval(&self) -> Duration {
        Duration::from_millis(self.min_submit_interval_ms)
    }

    pub fn decode_timeout(&self) -> Option<Duration> {
        (self.decode_timeout_ms > 0).then(|| Duration::from_millis(self.decode_timeout_ms))
    }
}

impl Default for GateConfig {
    fn default() -> Self {
        Self {
            cooldown_ms: default_cooldown(),
        }
    }
}

impl GateConfig {
    pub fn cooldown(&self) -> Duration {
        Duration::from_millis(self.cooldown_ms)
    }
}

impl Default for FilterConfig {
    fn default() -> Self {
        Self {
            min_area_fraction: default_min_area_fraction(),
        }
    }
}

impl Default for HistoryConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            path: default_history_path(),
        }
    }
}

impl Default for ExportConfig {
    fn default() -> Self {
        Self {
            dir: default_export_dir(),
            format: default_export_format(),
            on_exit: true,
        }
    }
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
        }
    }
}

impl Config {
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path)
            .map_err(|e| ConfigError::ReadFile(path.display().to_string(), e))?;
        let config = Self::parse(&content)?;
        debug!(path = path.display().to_string(), "config loaded");
        Ok(config)
    }

    pub fn parse(content: &str) -> Result<Self, ConfigError> {
        toml::from_str(content).map_err(|e| ConfigError::Parse(e.to_string()))
    }
}

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("failed to read config file {0}: {1}")]
    ReadFile(String, std::io::Error),
    #[error("failed to parse config: {0}")]
    Parse(String),
}

// Default value functions
fn default_source_mode() -> SourceMode {
    SourceMode::Mjpeg
}
fn default_source_url() -> String {
    "http://127.0.0.1:8080/stream".into()
}
fn default_fps() -> f64 {
    10.0
}
fn default_tick_interval() -> u64 {
    16
}
fn default_min_submit_interval() -> u64 {
    100
}
fn default_cooldown() -> u64 {
    DEFAULT_COOLDOWN_MS
}
fn default_min_area_fraction() -> f64 {
    DEFAULT_MIN_AREA_FRACTION
}
fn default_true() -> bool {
    true
}
fn default_history_path() -> PathBuf {
    PathBuf::from("history/scanned.db")
}
fn default_export_dir() -> PathBuf {
    PathBuf::from("exports")
}
fn default_export_format() -> ExportFormat {
    ExportFormat::Text
}
fn default_log_level() -> String {
    "info".into()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_config_uses_defaults() {
        let config = Config::parse("").unwrap();
        assert_eq!(config.source.mode, SourceMode::Mjpeg);
        assert_eq!(config.gate.cooldown_ms, DEFAULT_COOLDOWN_MS);
        assert_eq!(config.filter.min_area_fraction, DEFAULT_MIN_AREA_FRACTION);
        assert_eq!(config.pipeline.min_submit_interval_ms, 100);
        assert!(config.pipeline.decode_timeout().is_none());
        assert!(config.history.enabled);
        assert_eq!(config.export.format, ExportFormat::Text);
        assert_eq!(config.logging.level, "info");
    }

    #[test]
    fn sections_override_defaults() {
        let config = Config::parse(
            r#"
            [source]
            mode = "directory"
            path = "/tmp/frames"
            fps = 4.0

            [pipeline]
            decode_timeout_ms = 2000

            [gate]
            cooldown_ms = 700

            [filter]
            min_area_fraction = 0.002

            [export]
            format = "csv"
            "#,
        )
        .unwrap();
        assert_eq!(config.source.mode, SourceMode::Directory);
        assert_eq!(config.source.path, Some(PathBuf::from("/tmp/frames")));
        assert_eq!(
            config.pipeline.decode_timeout(),
            Some(Duration::from_millis(2000))
        );
        assert_eq!(config.gate.cooldown(), Duration::from_millis(700));
        assert_eq!(config.filter.min_area_fraction, 0.002);
        assert_eq!(config.export.format.extension(), "csv");
    }

    #[test]
    fn frame_interval_follows_fps() {
        let config = Config::parse("[source]\nfps = 4.0").unwrap();
        assert_eq!(config.source.frame_interval(), Duration::from_millis(250));
    }

    #[test]
    fn frame_interval_is_never_zero() {
        let config = Config::parse("[source]\nfps = inf").unwrap();
        assert_eq!(config.source.frame_interval(), Duration::from_millis(100));

        let config = Config::parse("[source]\nfps = 1e12").unwrap();
        assert_eq!(config.source.frame_interval(), Duration::from_millis(1));

        for fps in [0.0, -5.0, f64::NAN] {
            let source = SourceConfig {
                fps,
                ..SourceConfig::default()
            };
            assert_eq!(source.frame_interval(), Duration::from_millis(100));
        }
    }

    #[test]
    fn unknown_mode_is_a_parse_error() {
        let err = Config::parse("[source]\nmode = \"webrtc\"\n").unwrap_err();
        assert!(matches!(err, ConfigError::Parse(_)));
    }

    #[test]
    fn missing_file_is_read_error() {
        let err = Config::load(Path::new("/nonexistent/qrscan.toml")).unwrap_err();
        assert!(matches!(err, ConfigError::ReadFile(..)));
    }
}
