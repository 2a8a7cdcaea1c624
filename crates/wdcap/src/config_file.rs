//! Minimal line-oriented `key=value` configuration file loader.
//!
//! File format parsing is explicitly out of scope for this pipeline's core design;
//! this loader exists only to bridge a config file on disk to the typed
//! [`wdcap_core::Config`] record the rest of the program consumes.

use std::fs;
use std::path::{Path, PathBuf};

use wdcap_core::config::{Config, ConfigError, TraceFormat};

#[derive(Debug)]
pub enum ConfigFileError {
    Io(std::io::Error),
    MissingKey(&'static str),
    InvalidValue { key: String, value: String },
    Invalid(ConfigError),
}

impl std::fmt::Display for ConfigFileError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ConfigFileError::Io(e) => write!(f, "I/O error: {}", e),
            ConfigFileError::MissingKey(k) => write!(f, "missing required key: {}", k),
            ConfigFileError::InvalidValue { key, value } => {
                write!(f, "invalid value for {}: {}", key, value)
            }
            ConfigFileError::Invalid(e) => write!(f, "{}", e),
        }
    }
}

impl std::error::Error for ConfigFileError {}

impl From<std::io::Error> for ConfigFileError {
    fn from(e: std::io::Error) -> Self {
        ConfigFileError::Io(e)
    }
}

impl From<ConfigError> for ConfigFileError {
    fn from(e: ConfigError) -> Self {
        ConfigFileError::Invalid(e)
    }
}

pub fn load(path: &Path) -> Result<Config, ConfigFileError> {
    let content = fs::read_to_string(path)?;

    let mut input_uri = None;
    let mut output_template = None;
    let mut interval_secs = None;
    let mut thread_count = None;
    let mut monitor_id = None;
    let mut vlan_strip = false;
    let mut write_stats = true;
    let mut pidfile_path = PathBuf::from("/var/run/wdcap.pid");

    for line in content.lines() {
        let line = line.trim();
        if line.is_empty() || line.starts_with('#') {
            continue;
        }
        let Some((key, value)) = line.split_once('=') else {
            continue;
        };
        let (key, value) = (key.trim(), value.trim());
        match key {
            "input" => input_uri = Some(value.to_string()),
            "output_template" => output_template = Some(value.to_string()),
            "interval" => {
                interval_secs = Some(value.parse().map_err(|_| ConfigFileError::InvalidValue {
                    key: key.to_string(),
                    value: value.to_string(),
                })?)
            }
            "threads" => {
                thread_count = Some(value.parse().map_err(|_| ConfigFileError::InvalidValue {
                    key: key.to_string(),
                    value: value.to_string(),
                })?)
            }
            "monitor" => monitor_id = Some(value.to_string()),
            "vlan_strip" => vlan_strip = value == "true" || value == "1",
            "stats" => write_stats = value == "true" || value == "1",
            "pidfile" => pidfile_path = PathBuf::from(value),
            _ => tracing::warn!(key, "ignoring unrecognized configuration key"),
        }
    }

    let config = Config::new(
        input_uri.ok_or(ConfigFileError::MissingKey("input"))?,
        output_template.ok_or(ConfigFileError::MissingKey("output_template"))?,
        interval_secs.ok_or(ConfigFileError::MissingKey("interval"))?,
        thread_count.ok_or(ConfigFileError::MissingKey("threads"))?,
        monitor_id,
        TraceFormat::PcapFile,
        vlan_strip,
        write_stats,
        pidfile_path,
    )?;
    Ok(config)
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn loads_a_minimal_config() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("wdcap.conf");
        fs::write(
            &path,
            "input=eth0\noutput_template=/tmp/trace-%s\ninterval=60\nthreads=4\n",
        )
        .unwrap();
        let cfg = load(&path).unwrap();
        assert_eq!(cfg.interval_secs, 60);
        assert_eq!(cfg.thread_count, 4);
    }

    #[test]
    fn missing_required_key_is_an_error() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("wdcap.conf");
        fs::write(&path, "input=eth0\n").unwrap();
        assert!(load(&path).is_err());
    }
}
