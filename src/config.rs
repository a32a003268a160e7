// ===============================
// src/config.rs
// ===============================
//
// User configuration file: one "key:value" entry per line, the first ':'
// separating key from value. Keys the session needs to log on are
// mandatory; everything else is read on demand by whoever consumes it.

use std::fs;
use std::path::Path;

use ahash::AHashMap as HashMap;
use thiserror::Error;

const REQUIRED_KEYS: [&str; 3] = ["AccessKey", "AccessSecret", "FIXConfigurationFile"];

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("impossible to read the configuration file {path}: {source}")]
    Unreadable {
        path: String,
        source: std::io::Error,
    },
    #[error("user configuration file is missing the key: {0}")]
    MissingKey(String),
    #[error("configuration key {key} holds an unparseable number: {value}")]
    InvalidNumber { key: String, value: String },
}

#[derive(Debug, Clone, Default)]
pub struct Config {
    entries: HashMap<String, String>,
}

impl Config {
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let contents = fs::read_to_string(path).map_err(|source| ConfigError::Unreadable {
            path: path.display().to_string(),
            source,
        })?;
        let config = Self::parse(&contents);

        for key in REQUIRED_KEYS {
            if !config.entries.contains_key(key) {
                return Err(ConfigError::MissingKey(key.to_string()));
            }
        }

        Ok(config)
    }

    fn parse(contents: &str) -> Self {
        let mut entries = HashMap::new();
        for line in contents.lines() {
            if let Some((key, value)) = line.split_once(':') {
                entries.insert(key.to_string(), value.to_string());
            }
        }
        Self { entries }
    }

    pub fn get(&self, key: &str) -> Option<&str> {
        self.entries.get(key).map(String::as_str)
    }

    pub fn require(&self, key: &str) -> Result<&str, ConfigError> {
        self.get(key).ok_or_else(|| ConfigError::MissingKey(key.to_string()))
    }

    pub fn require_f64(&self, key: &str) -> Result<f64, ConfigError> {
        let value = self.require(key)?;
        value.trim().parse().map_err(|_| ConfigError::InvalidNumber {
            key: key.to_string(),
            value: value.to_string(),
        })
    }

    pub fn get_u16(&self, key: &str) -> Result<Option<u16>, ConfigError> {
        match self.get(key) {
            None => Ok(None),
            Some(value) => value.trim().parse().map(Some).map_err(|_| ConfigError::InvalidNumber {
                key: key.to_string(),
                value: value.to_string(),
            }),
        }
    }

    #[cfg(test)]
    pub fn from_pairs(pairs: &[(&str, &str)]) -> Self {
        let mut entries = HashMap::new();
        for (key, value) in pairs {
            entries.insert(key.to_string(), value.to_string());
        }
        Self { entries }
    }
}
