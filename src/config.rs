use crate::qr::ErrorCorrection;
use crate::utils::escape;
use directories_next::ProjectDirs;
use serde_derive::{Deserialize, Serialize};
use std::fmt;
use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use std::time::Duration;
use thiserror::Error;

pub const DEFAULT_ICE_SERVERS: &[&str] = &["stun:stun.l.google.com:19302"];

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
#[serde(default)]
pub struct Config {
    /// stun: and turn: urls; empty for host candidates only
    pub ice_servers: Vec<String>,
    /// Label of a data channel the offerer declares, if any.
    pub data_channel: Option<String>,
    pub qr_error_correction: ErrorCorrection,
    pub show_qr: bool,
    pub teardown_timeout_ms: u64,
}

impl Default for Config {
    fn default() -> Self {
        Config {
            ice_servers: DEFAULT_ICE_SERVERS.iter().map(|s| s.to_string()).collect(),
            data_channel: None,
            qr_error_correction: ErrorCorrection::default(),
            show_qr: true,
            teardown_timeout_ms: 5000,
        }
    }
}

#[derive(Error, Debug)]
pub struct ParseError {
    pub filename: String,
    pub message: String,
}

impl fmt::Display for ParseError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Failed to parse {}: {}", self.filename, self.message)
    }
}

#[derive(Error, Debug)]
pub enum Error {
    #[error(transparent)]
    ParseError(ParseError),

    #[error(transparent)]
    TomlDeError(#[from] toml::de::Error),

    #[error(transparent)]
    IOError(#[from] io::Error),

    #[error("Failure to process path: {}", .0)]
    UnsupportedPath(String),
}

pub static FILENAME: &str = "rtcsession.toml";

impl Config {
    pub fn new() -> Config {
        Config {
            ..Default::default()
        }
    }

    // If no file is found, returns default config instead of error
    pub fn load(filename: &str) -> Result<Config, Error> {
        let contents = match fs::read_to_string(filename) {
            Ok(contents) => contents,
            Err(error) if error.kind() == io::ErrorKind::NotFound => return Ok(Config::new()),
            Err(error) => return Err(Error::IOError(error)),
        };
        let config = match toml::from_str(&contents) {
            Ok(contents) => contents,
            Err(error) if error.line_col().is_some() => {
                return Err(Error::ParseError(ParseError {
                    filename: String::from(filename),
                    message: format!("{}", error),
                }));
            }
            Err(error) => return Err(Error::TomlDeError(error)),
        };
        log::debug!("Loaded config from {}", escape(filename));
        Ok(config)
    }

    pub fn teardown_timeout(&self) -> Duration {
        Duration::from_millis(self.teardown_timeout_ms)
    }
}

fn project_dir() -> Option<ProjectDirs> {
    ProjectDirs::from("", "Erkki Seppälä", "rtcsession")
}

/// The argument wins; then `rtcsession.toml` in the current directory if it
/// exists; then the per-user config directory.
pub fn get_config_file(config_file_arg: Option<&str>) -> Result<String, Error> {
    let path: PathBuf = match config_file_arg {
        Some(path) => PathBuf::from(path),
        None => {
            let local = Path::new(FILENAME);
            if local.exists() {
                local.to_path_buf()
            } else {
                project_dir()
                    .map(|dirs| dirs.config_dir().join(FILENAME))
                    .unwrap_or_else(|| local.to_path_buf())
            }
        }
    };
    match path.to_str() {
        Some(path) => Ok(path.to_string()),
        None => Err(Error::UnsupportedPath(
            "Sorry, unsupported config file path (needs to be legal UTF8)".to_string(),
        )),
    }
}
