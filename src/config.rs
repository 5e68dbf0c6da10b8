//! Persistent key/value configuration, stored as a single JSON document.

use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use log::warn;
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Allow high-quality transcodings to be considered at all.
    pub high_quality: bool,
    /// Remux worker pool size; clamped to [1, 10] by the pool.
    pub max_concurrent_remux: usize,
    /// Fixed pause between HLS segment downloads, 0 to disable.
    pub segment_delay_ms: u64,
    /// Whether a long-silent download may be assumed complete.
    pub assume_completion: bool,
    pub download_dir: PathBuf,
    pub api_base: String,
    pub client_id: String,
    /// Global download rate limit in bytes per second.
    pub rate_limit: Option<u32>,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            high_quality: false,
            max_concurrent_remux: num_cpus::get().min(4),
            segment_delay_ms: 0,
            assume_completion: true,
            download_dir: PathBuf::from("downloads"),
            api_base: "https://api.example.com/v2".to_string(),
            client_id: String::new(),
            rate_limit: None,
        }
    }
}

impl Config {
    pub fn load(path: &Path) -> Self {
        match std::fs::read_to_string(path) {
            Ok(content) => match serde_json::from_str(&content) {
                Ok(config) => config,
                Err(e) => {
                    warn!("config file {:?} is malformed ({}); using defaults", path, e);
                    Config::default()
                }
            },
            Err(_) => Config::default(),
        }
    }

    pub fn save(&self, path: &Path) -> Result<()> {
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent).context("creating config directory")?;
            }
        }
        let content = serde_json::to_string_pretty(self).context("serializing config")?;
        std::fs::write(path, content).context("writing config file")?;
        Ok(())
    }

    /// Generic key access for the settings surface.
    pub fn get(&self, key: &str) -> Option<serde_json::Value> {
        match serde_json::to_value(self) {
            Ok(serde_json::Value::Object(map)) => map.get(key).cloned(),
            _ => None,
        }
    }

    /// Set one key by name; unknown keys or mismatched types are rejected.
    pub fn set(&mut self, key: &str, value: serde_json::Value) -> bool {
        let Ok(serde_json::Value::Object(mut map)) = serde_json::to_value(&*self) else {
            return false;
        };
        if !map.contains_key(key) {
            return false;
        }
        map.insert(key.to_string(), value);
        match serde_json::from_value(serde_json::Value::Object(map)) {
            Ok(updated) => {
                *self = updated;
                true
            }
            Err(_) => false,
        }
    }
}
