use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::time::Duration;

use crate::exiftool::TimeoutPolicy;

/// Top-level configuration for exif-stamp.
///
/// Controls where exiftool lives, how the fragile RAW format is written,
/// and how long a batch may take before the process is restarted.
///
/// # Loading
///
/// ```rust,no_run
/// use exif_stamp::config::{Config, WriteMode};
///
/// // From a JSON file
/// let config = Config::load(Some("config.json".as_ref())).unwrap();
///
/// // Or use defaults and customize
/// let mut config = Config::default();
/// config.write.fragile_write_mode = WriteMode::Auto;
/// ```
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Location and probing of the exiftool executable.
    pub exiftool: ExifToolConfig,
    /// Write strategy and batching.
    pub write: WriteConfig,
    /// Adaptive batch timeout.
    pub timeouts: TimeoutConfig,
}

/// exiftool executable settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ExifToolConfig {
    /// Explicit path. When unset, `PATH` is searched, then the bundled copy.
    pub path: Option<PathBuf>,
    /// How long the `-ver` probe may take at startup.
    pub probe_timeout_secs: u64,
}

/// Controls how updates reach the files.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct WriteConfig {
    /// Strategy for the fragile RAW format (Sony ARW).
    pub fragile_write_mode: WriteMode,
    /// Files per reset chunk.
    pub reset_chunk_size: usize,
    /// Where caption/title scratch files go. System temp dir when unset.
    pub scratch_dir: Option<PathBuf>,
}

/// Batch timeout: `max(floor, units * per_unit)`.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct TimeoutConfig {
    pub floor_ms: u64,
    pub per_unit_ms: u64,
}

/// How the fragile RAW format is written.
///
/// `Embedded`, `InPlace` and `Sidecar` are forced strategies; `Auto` writes a
/// copy, verifies its structural signature and falls back to a sidecar on
/// drift.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum WriteMode {
    #[default]
    Embedded,
    #[serde(rename = "inplace")]
    InPlace,
    Sidecar,
    Auto,
}

impl WriteMode {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Embedded => "embedded",
            Self::InPlace => "inplace",
            Self::Sidecar => "sidecar",
            Self::Auto => "auto",
        }
    }
}

impl fmt::Display for WriteMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for WriteMode {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "embedded" => Ok(Self::Embedded),
            "inplace" | "in-place" => Ok(Self::InPlace),
            "sidecar" => Ok(Self::Sidecar),
            "auto" => Ok(Self::Auto),
            other => Err(format!(
                "unknown write mode '{other}' (expected embedded, inplace, sidecar or auto)"
            )),
        }
    }
}

impl Default for ExifToolConfig {
    fn default() -> Self {
        Self {
            path: None,
            probe_timeout_secs: 5,
        }
    }
}

impl Default for WriteConfig {
    fn default() -> Self {
        Self {
            fragile_write_mode: WriteMode::Embedded,
            reset_chunk_size: 50,
            scratch_dir: None,
        }
    }
}

impl Default for TimeoutConfig {
    fn default() -> Self {
        Self {
            floor_ms: 30_000,
            per_unit_ms: 2_000,
        }
    }
}

impl TimeoutConfig {
    pub fn policy(&self) -> TimeoutPolicy {
        TimeoutPolicy {
            floor: Duration::from_millis(self.floor_ms),
            per_unit: Duration::from_millis(self.per_unit_ms),
        }
    }
}

impl ExifToolConfig {
    pub fn probe_timeout(&self) -> Duration {
        Duration::from_secs(self.probe_timeout_secs)
    }

    /// Resolve the exiftool executable.
    ///
    /// Order: configured path, `PATH`, bundled copy next to the running
    /// binary (`exiftools_mac/exiftool` or `exiftools_win/exiftool.exe`),
    /// and finally the bare name so the startup probe reports it.
    pub fn resolve(&self) -> PathBuf {
        if let Some(ref path) = self.path {
            return path.clone();
        }

        let exe_name = if cfg!(windows) { "exiftool.exe" } else { "exiftool" };

        if let Some(paths) = std::env::var_os("PATH") {
            for dir in std::env::split_paths(&paths) {
                let candidate = dir.join(exe_name);
                if candidate.is_file() {
                    log::debug!("Using exiftool from PATH: {}", candidate.display());
                    return candidate;
                }
            }
        }

        let bundle_dir = if cfg!(windows) { "exiftools_win" } else { "exiftools_mac" };
        if let Some(exe_dir) = std::env::current_exe()
            .ok()
            .and_then(|exe| exe.parent().map(Path::to_path_buf))
        {
            let bundled = exe_dir.join(bundle_dir).join(exe_name);
            if bundled.is_file() {
                log::debug!("Using bundled exiftool: {}", bundled.display());
                return bundled;
            }
        }

        PathBuf::from(exe_name)
    }
}

impl Config {
    /// Resolve the config file path — same directory as the executable.
    pub fn config_path() -> Result<PathBuf> {
        let exe_path = std::env::current_exe().context("Failed to get executable path")?;
        let exe_dir = exe_path
            .parent()
            .context("Failed to get executable directory")?;
        Ok(exe_dir.join("config.json"))
    }

    /// Load config from the given path, or from the default location.
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let config_path = match path {
            Some(p) => p.to_path_buf(),
            None => Self::config_path()?,
        };

        if !config_path.exists() {
            log::warn!(
                "Config file not found at {}. Using defaults.",
                config_path.display()
            );
            return Ok(Self::default());
        }

        let contents =
            std::fs::read_to_string(&config_path).context("Failed to read config file")?;
        let config: Config =
            serde_json::from_str(&contents).context("Failed to parse config file")?;
        if config.write.reset_chunk_size == 0 {
            anyhow::bail!("write.reset_chunk_size must be at least 1");
        }
        Ok(config)
    }

    /// Save config to the given path, or to the default location.
    pub fn save(&self, path: Option<&Path>) -> Result<()> {
        let config_path = match path {
            Some(p) => p.to_path_buf(),
            None => Self::config_path()?,
        };

        let contents = serde_json::to_string_pretty(self).context("Failed to serialize config")?;
        std::fs::write(&config_path, contents).context("Failed to write config file")?;
        log::info!("Config saved to {}", config_path.display());
        Ok(())
    }
}
