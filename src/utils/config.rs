//! Recorder configuration
//!
//! Sources, later ones overriding earlier ones:
//!
//! 1. built-in defaults
//! 2. `latest-trace.toml` (or an explicit file), if present
//! 3. `LATEST_TRACE_*` environment variables
//!
//! [`TracerConfig::from_agent_args`] accepts the agent-style
//! `size=32,trim=16,json=true,...` string instead.

use crate::recording::budget::TieBreak;
use crate::recording::compressor::CompressionLevel;
use crate::recording::exporter::ExportFormat;
use crate::recording::registry::RegistryConfig;
use crate::recording::retention::RetentionPolicy;
use crate::utils::errors::{Result, TraceError};
use chrono::{DateTime, Local};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use tracing::debug;

/// Default configuration file name, without extension
pub const CONFIG_FILE: &str = "latest-trace";

/// Prefix of configuration environment variables
pub const ENV_PREFIX: &str = "LATEST_TRACE";

/// Smallest accepted per-site buffer size
pub const MIN_BUFFER_SIZE: usize = 4;

const DEFAULT_TRACE_STEM: &str = "trace";
const DEFAULT_TIME_FORMAT: &str = "%Y%m%d-%H%M%S%3f";

/// When partial traces are written during a run
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PartialSaveStrategy {
    /// Only the final trace on close
    #[default]
    No,
    /// Write a trace and start over from empty buffers
    WriteAndReset,
    /// Write a point-in-time trace and keep accumulating
    WriteSnapshot,
}

impl PartialSaveStrategy {
    /// Parse the `logsave=` agent option
    pub fn parse(s: &str) -> Self {
        match s.to_ascii_lowercase().as_str() {
            "partial" => PartialSaveStrategy::WriteAndReset,
            "snapshot" => PartialSaveStrategy::WriteSnapshot,
            _ => PartialSaveStrategy::No,
        }
    }

    /// Whether saves under this strategy clear the buffers
    pub fn resets(&self) -> bool {
        matches!(self, PartialSaveStrategy::WriteAndReset)
    }
}

/// Trace recorder configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct TracerConfig {
    /// Initial per-site ceiling and number of slot columns in text traces
    pub buffer_size: usize,

    /// Retained events allowed across all sites
    pub global_capacity: usize,

    /// Events removed per budget step
    pub eviction_unit: usize,

    pub format: ExportFormat,

    pub retention: RetentionPolicy,

    /// Final trace path; defaults to `trace.<ext>` in `output_dir`
    pub trace_file: Option<PathBuf>,

    pub output_dir: Option<PathBuf>,

    /// zstd-compress artifacts
    pub compress: bool,

    pub compression_level: CompressionLevel,

    pub partial_save: PartialSaveStrategy,

    /// Period of background partial saves
    pub save_interval_ms: u64,

    /// Log the final ceiling and budget counters on close
    pub show_buffer_size: bool,

    pub tie_break: TieBreak,
}

impl Default for TracerConfig {
    fn default() -> Self {
        Self {
            buffer_size: 32,
            global_capacity: 1 << 16,
            eviction_unit: 16,
            format: ExportFormat::Json,
            retention: RetentionPolicy::Strong,
            trace_file: None,
            output_dir: None,
            compress: false,
            compression_level: CompressionLevel::Balanced,
            partial_save: PartialSaveStrategy::No,
            save_interval_ms: 10_000,
            show_buffer_size: false,
            tie_break: TieBreak::SiteOrder,
        }
    }
}

impl TracerConfig {
    /// Load from `path` (or `latest-trace.*` in the working directory) and the
    /// environment
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let file = match path {
            Some(p) => config::File::from(p).required(true),
            None => config::File::with_name(CONFIG_FILE).required(false),
        };

        let loaded: TracerConfig = config::Config::builder()
            .add_source(file)
            .add_source(
                config::Environment::with_prefix(ENV_PREFIX)
                    .prefix_separator("_")
                    .try_parsing(true),
            )
            .build()?
            .try_deserialize()?;

        loaded.validate()?;
        debug!(?loaded, "Loaded tracer configuration");
        Ok(loaded)
    }

    /// Parse an agent option string such as `size=64,trim=8,json=false`
    ///
    /// Unknown keys are ignored. `size` is raised to at least 4 and `trim` to
    /// at least 1. `output` and `trace` accept `{time}` / `{time:FORMAT}`.
    pub fn from_agent_args(args: &str) -> Result<Self> {
        let now = Local::now();
        let mut cfg = TracerConfig::default();

        for arg in args.split(',').map(str::trim).filter(|a| !a.is_empty()) {
            let (key, value) = arg.split_once('=').unwrap_or((arg, ""));
            match key {
                "size" => cfg.buffer_size = parse_number(key, value)?.max(MIN_BUFFER_SIZE),
                "trim" => cfg.eviction_unit = parse_number(key, value)?.max(1),
                "capacity" => cfg.global_capacity = parse_number(key, value)?.max(1),
                "json" => {
                    cfg.format = if value.eq_ignore_ascii_case("true") {
                        ExportFormat::Json
                    } else {
                        ExportFormat::Text
                    }
                }
                "keepobj" => {
                    if let Some(policy) = RetentionPolicy::parse(value) {
                        cfg.retention = policy;
                    }
                }
                "logsave" => cfg.partial_save = PartialSaveStrategy::parse(value),
                "saveinterval" => cfg.save_interval_ms = parse_number(key, value)? as u64,
                "showbuffersize" => cfg.show_buffer_size = value.eq_ignore_ascii_case("true"),
                "compress" => cfg.compress = value.eq_ignore_ascii_case("true"),
                "output" => cfg.output_dir = Some(PathBuf::from(fill_time_pattern(value, now))),
                "trace" => cfg.trace_file = Some(PathBuf::from(fill_time_pattern(value, now))),
                other => debug!(option = other, "Ignoring unknown agent option"),
            }
        }

        cfg.validate()?;
        Ok(cfg)
    }

    /// Validate configuration
    pub fn validate(&self) -> Result<()> {
        if self.buffer_size < MIN_BUFFER_SIZE {
            return Err(TraceError::Config(format!(
                "buffer_size must be at least {}, got {}",
                MIN_BUFFER_SIZE, self.buffer_size
            )));
        }

        if self.eviction_unit == 0 {
            return Err(TraceError::Config(
                "eviction_unit must be at least 1".to_string(),
            ));
        }

        if self.global_capacity == 0 {
            return Err(TraceError::Config(
                "global_capacity must be at least 1".to_string(),
            ));
        }

        if self.partial_save != PartialSaveStrategy::No && self.save_interval_ms == 0 {
            return Err(TraceError::Config(
                "save_interval_ms must be positive when partial saves are enabled".to_string(),
            ));
        }

        Ok(())
    }

    /// Final trace path
    pub fn trace_file_path(&self) -> PathBuf {
        match &self.trace_file {
            Some(path) => path.clone(),
            None => {
                let name = format!("{}.{}", DEFAULT_TRACE_STEM, self.format.extension());
                match &self.output_dir {
                    Some(dir) => dir.join(name),
                    None => PathBuf::from(name),
                }
            }
        }
    }

    /// Compression level to apply, if compression is on
    pub fn compression(&self) -> Option<CompressionLevel> {
        self.compress.then_some(self.compression_level)
    }

    /// Limits for the buffer registry
    pub fn registry_config(&self) -> RegistryConfig {
        RegistryConfig {
            buffer_size: self.buffer_size,
            global_capacity: self.global_capacity,
            eviction_unit: self.eviction_unit,
            retention: self.retention,
            tie_break: self.tie_break,
        }
    }
}

fn parse_number(key: &str, value: &str) -> Result<usize> {
    value
        .parse()
        .map_err(|e| TraceError::Config(format!("invalid {}={:?}: {}", key, value, e)))
}

/// Replace `{time}` or the first `{time:FORMAT}` in `s` with `now`
///
/// `FORMAT` uses `strftime` syntax; `{time}` renders as `%Y%m%d-%H%M%S%3f`.
pub fn fill_time_pattern(s: &str, now: DateTime<Local>) -> String {
    if s.contains("{time}") {
        return s.replace("{time}", &now.format(DEFAULT_TIME_FORMAT).to_string());
    }

    if let Some(start) = s.find("{time:") {
        if let Some(len) = s[start..].find('}') {
            let pattern = &s[start..start + len + 1];
            let format = &pattern["{time:".len()..pattern.len() - 1];
            return s.replacen(pattern, &now.format(format).to_string(), 1);
        }
    }

    s.to_string()
}
