//! User configuration persisted at `~/.yank/config.json` (component M).

use crate::error::Result;
use serde::{Deserialize, Serialize};
use std::path::PathBuf;

/// Default poll interval for the clipboard watcher, in milliseconds.
pub const DEFAULT_POLL_INTERVAL_MS: u64 = 300;
/// Default size threshold above which files go through the announce/request
/// path instead of inline.
pub const DEFAULT_LAZY_THRESHOLD: u64 = 10 * 1024 * 1024;
/// Default chunk size for the chunked reader/writer.
pub const DEFAULT_CHUNK_SIZE: u64 = 1024 * 1024;
/// Default transfer TTL in seconds.
pub const DEFAULT_TRANSFER_EXPIRY: u64 = 300;

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct Config {
    pub sync_files: bool,
    pub sync_text: bool,
    pub sync_images: bool,
    pub max_file_size: u64,
    pub max_total_size: u64,
    pub ignored_extensions: Vec<String>,
    pub lazy_threshold: u64,
    pub chunk_size: u64,
    pub transfer_expiry: u64,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            sync_files: true,
            sync_text: true,
            sync_images: true,
            max_file_size: 512 * 1024 * 1024,
            max_total_size: 1024 * 1024 * 1024,
            ignored_extensions: Vec::new(),
            lazy_threshold: DEFAULT_LAZY_THRESHOLD,
            chunk_size: DEFAULT_CHUNK_SIZE,
            transfer_expiry: DEFAULT_TRANSFER_EXPIRY,
        }
    }
}

impl Config {
    pub fn load_or_default(path: &std::path::Path) -> Result<Self> {
        if !path.exists() {
            return Ok(Self::default());
        }
        let data = std::fs::read_to_string(path)?;
        Ok(serde_json::from_str(&data)?)
    }

    pub fn save(&self, path: &std::path::Path) -> Result<()> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        std::fs::write(path, serde_json::to_string_pretty(self)?)?;
        Ok(())
    }

    /// Applies a `--set KEY VALUE` mutation from the `config` CLI verb.
    /// Returns an error describing the bad key/value rather than panicking
    /// on user input.
    pub fn set_field(&mut self, key: &str, value: &str) -> Result<()> {
        use crate::error::Error;
        let bad = |msg: String| Error::ProtocolError(msg);
        match key {
            "sync_files" => self.sync_files = parse_bool(value).map_err(bad)?,
            "sync_text" => self.sync_text = parse_bool(value).map_err(bad)?,
            "sync_images" => self.sync_images = parse_bool(value).map_err(bad)?,
            "max_file_size" => self.max_file_size = parse_u64(value).map_err(bad)?,
            "max_total_size" => self.max_total_size = parse_u64(value).map_err(bad)?,
            "lazy_threshold" => self.lazy_threshold = parse_u64(value).map_err(bad)?,
            "chunk_size" => self.chunk_size = parse_u64(value).map_err(bad)?,
            "transfer_expiry" => self.transfer_expiry = parse_u64(value).map_err(bad)?,
            "ignored_extensions" => {
                self.ignored_extensions = value.split(',').map(|s| s.trim().to_string()).filter(|s| !s.is_empty()).collect()
            }
            other => return Err(bad(format!("unknown config key '{other}'"))),
        }
        Ok(())
    }
}

fn parse_bool(value: &str) -> std::result::Result<bool, String> {
    value.parse().map_err(|_| format!("expected true/false, got '{value}'"))
}

fn parse_u64(value: &str) -> std::result::Result<u64, String> {
    value.parse().map_err(|_| format!("expected an integer, got '{value}'"))
}

/// The user's home directory, or `$YANK_HOME`'s parent if set (tests set
/// `YANK_HOME` to avoid touching the real home directory).
pub fn home_dir() -> PathBuf {
    if let Ok(dir) = std::env::var("YANK_HOME") {
        return PathBuf::from(dir);
    }
    std::env::var_os("HOME").map(PathBuf::from).unwrap_or_else(|| PathBuf::from("."))
}

/// `~/.yank`.
pub fn yank_home() -> PathBuf {
    home_dir().join(".yank")
}

pub fn default_config_path() -> PathBuf {
    yank_home().join("config.json")
}

pub fn default_ignore_path() -> PathBuf {
    home_dir().join(".syncignore")
}
