//! Startup configuration.
//!
//! Precedence: CLI arguments > environment variables > config file >
//! defaults. The core consumes the device path, terminal geometry and
//! refresh pacing; model, preset and data directory belong to the
//! response-generation collaborators.

use std::env;
use std::fs;
use std::path::PathBuf;

use clap::Parser;
use log::warn;
use serde::Deserialize;
use thiserror::Error;

/// CLI arguments.
#[derive(Parser, Debug, Clone)]
#[command(name = "ttychat")]
#[command(version)]
#[command(about = "LLM chat over a raw serial link to a real terminal", long_about = None)]
pub struct CliArgs {
    /// Serial device or PTY endpoint (e.g. /dev/ttyUSB0, /dev/pts/3)
    #[arg(long, value_name = "PATH")]
    pub device: PathBuf,

    /// Path to a custom config file
    #[arg(long, value_name = "FILE")]
    pub config: Option<PathBuf>,

    /// Terminal columns
    #[arg(long, value_name = "COLS")]
    pub cols: Option<usize>,

    /// Terminal rows
    #[arg(long, value_name = "ROWS")]
    pub rows: Option<usize>,

    /// Refresh pacing interval in milliseconds
    #[arg(long, value_name = "MS")]
    pub refresh_ms: Option<u64>,

    /// Model name passed to the text-generation service
    #[arg(long, value_name = "MODEL")]
    pub model: Option<String>,

    /// Prompt preset name
    #[arg(long, value_name = "NAME")]
    pub preset: Option<String>,

    /// Directory holding system_prompt.txt, presets.toml and kb.toml
    #[arg(long, value_name = "DIR")]
    pub data_dir: Option<PathBuf>,
}

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("config error in '{field}': {message}")]
    Invalid {
        field: &'static str,
        message: String,
    },
}

/// Resolved configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct Config {
    /// Device path; CLI-only, never read from the file.
    #[serde(skip)]
    pub device: PathBuf,

    #[serde(default = "default_cols")]
    pub cols: usize,

    #[serde(default = "default_rows")]
    pub rows: usize,

    #[serde(default = "default_refresh_ms")]
    pub refresh_ms: u64,

    #[serde(default = "default_model")]
    pub model: String,

    #[serde(default)]
    pub preset: Option<String>,

    #[serde(default = "default_data_dir")]
    pub data_dir: PathBuf,
}

fn default_cols() -> usize {
    80
}
fn default_rows() -> usize {
    24
}
fn default_refresh_ms() -> u64 {
    100
}
fn default_model() -> String {
    "gpt-4o-mini".to_string()
}
fn default_data_dir() -> PathBuf {
    PathBuf::from("data")
}

impl Default for Config {
    fn default() -> Self {
        Config {
            device: PathBuf::new(),
            cols: default_cols(),
            rows: default_rows(),
            refresh_ms: default_refresh_ms(),
            model: default_model(),
            preset: None,
            data_dir: default_data_dir(),
        }
    }
}

impl Config {
    /// Load configuration with full precedence:
    /// CLI args > environment variables > config file > defaults.
    pub fn load_with_args(args: &CliArgs) -> Result<Self, ConfigError> {
        let mut config = Config::default();

        let config_path = args.config.clone().or_else(Self::default_config_path);
        if let Some(path) = &config_path {
            if path.exists() {
                match Self::load_from_file(path) {
                    Ok(file_config) => config = file_config,
                    Err(message) => {
                        warn!("ignoring config file {}: {message}", path.display());
                    }
                }
            }
        }

        config.apply_env_vars();
        config.apply_cli_args(args);
        config.validate()?;
        Ok(config)
    }

    fn load_from_file(path: &PathBuf) -> Result<Self, String> {
        let content = fs::read_to_string(path).map_err(|e| e.to_string())?;
        toml::from_str(&content).map_err(|e| e.to_string())
    }

    fn apply_env_vars(&mut self) {
        if let Ok(val) = env::var("TTYCHAT_COLS") {
            if let Ok(cols) = val.parse() {
                self.cols = cols;
            }
        }
        if let Ok(val) = env::var("TTYCHAT_ROWS") {
            if let Ok(rows) = val.parse() {
                self.rows = rows;
            }
        }
        if let Ok(val) = env::var("TTYCHAT_REFRESH_MS") {
            if let Ok(ms) = val.parse() {
                self.refresh_ms = ms;
            }
        }
        if let Ok(val) = env::var("TTYCHAT_PRESET") {
            self.preset = Some(val);
        }
        if let Ok(val) = env::var("TTYCHAT_DATA_DIR") {
            self.data_dir = PathBuf::from(val);
        }
        if let Ok(val) = env::var("OPENAI_MODEL") {
            self.model = val;
        }
    }

    fn apply_cli_args(&mut self, args: &CliArgs) {
        self.device = args.device.clone();
        if let Some(cols) = args.cols {
            self.cols = cols;
        }
        if let Some(rows) = args.rows {
            self.rows = rows;
        }
        if let Some(ms) = args.refresh_ms {
            self.refresh_ms = ms;
        }
        if let Some(model) = &args.model {
            self.model = model.clone();
        }
        if let Some(preset) = &args.preset {
            self.preset = Some(preset.clone());
        }
        if let Some(dir) = &args.data_dir {
            self.data_dir = dir.clone();
        }
    }

    fn validate(&self) -> Result<(), ConfigError> {
        if !(20..=132).contains(&self.cols) {
            return Err(ConfigError::Invalid {
                field: "cols",
                message: format!("{} is outside 20..=132", self.cols),
            });
        }
        if !(4..=60).contains(&self.rows) {
            return Err(ConfigError::Invalid {
                field: "rows",
                message: format!("{} is outside 4..=60", self.rows),
            });
        }
        if !(10..=2000).contains(&self.refresh_ms) {
            return Err(ConfigError::Invalid {
                field: "refresh_ms",
                message: format!("{} is outside 10..=2000", self.refresh_ms),
            });
        }
        Ok(())
    }

    /// Default config file location.
    pub fn default_config_path() -> Option<PathBuf> {
        dirs::config_dir().map(|p| p.join("ttychat").join("config.toml"))
    }
}
