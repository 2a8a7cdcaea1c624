//! Shared, read-only configuration for a capture run.

use std::path::PathBuf;

/// Trace file format understood by the writer/reader pair.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TraceFormat {
    PcapFile,
}

impl TraceFormat {
    /// The `%X` filename token and the format prefix used when
    /// `need_format_prefix` is set (see [`crate::template`]).
    pub fn extension(self) -> &'static str {
        match self {
            TraceFormat::PcapFile => "pcap",
        }
    }

    pub fn uri_prefix(self) -> &'static str {
        match self {
            TraceFormat::PcapFile => "pcapfile",
        }
    }
}

#[derive(Debug)]
pub enum ConfigError {
    ZeroInterval,
    ZeroThreads,
    EmptyInputUri,
    EmptyTemplate,
}

impl std::fmt::Display for ConfigError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ConfigError::ZeroInterval => write!(f, "interval length must be > 0 seconds"),
            ConfigError::ZeroThreads => write!(f, "processing thread count must be > 0"),
            ConfigError::EmptyInputUri => write!(f, "input source URI must not be empty"),
            ConfigError::EmptyTemplate => write!(f, "output filename template must not be empty"),
        }
    }
}

impl std::error::Error for ConfigError {}

/// Immutable-after-init configuration, shared read-only across every thread via `Arc`.
#[derive(Debug, Clone)]
pub struct Config {
    pub input_uri: String,
    pub output_template: String,
    pub interval_secs: u32,
    pub thread_count: usize,
    pub monitor_id: Option<String>,
    pub trace_format: TraceFormat,
    pub vlan_strip: bool,
    pub write_stats: bool,
    pub pidfile_path: PathBuf,
}

impl Config {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        input_uri: String,
        output_template: String,
        interval_secs: u32,
        thread_count: usize,
        monitor_id: Option<String>,
        trace_format: TraceFormat,
        vlan_strip: bool,
        write_stats: bool,
        pidfile_path: PathBuf,
    ) -> Result<Self, ConfigError> {
        if interval_secs == 0 {
            return Err(ConfigError::ZeroInterval);
        }
        if thread_count == 0 {
            return Err(ConfigError::ZeroThreads);
        }
        if input_uri.is_empty() {
            return Err(ConfigError::EmptyInputUri);
        }
        if output_template.is_empty() {
            return Err(ConfigError::EmptyTemplate);
        }
        Ok(Config {
            input_uri,
            output_template,
            interval_secs,
            thread_count,
            monitor_id,
            trace_format,
            vlan_strip,
            write_stats,
            pidfile_path,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn base() -> (String, String, u32, usize, Option<String>, TraceFormat, bool, bool, PathBuf) {
        (
            "eth0".to_string(),
            "trace-%s".to_string(),
            60,
            4,
            None,
            TraceFormat::PcapFile,
            false,
            true,
            PathBuf::from("/tmp/wdcap.pid"),
        )
    }

    #[test]
    fn rejects_zero_interval() {
        let (uri, tmpl, _i, t, mon, fmt, vlan, stats, pid) = base();
        let err = Config::new(uri, tmpl, 0, t, mon, fmt, vlan, stats, pid).unwrap_err();
        assert!(matches!(err, ConfigError::ZeroInterval));
    }

    #[test]
    fn rejects_zero_threads() {
        let (uri, tmpl, i, _t, mon, fmt, vlan, stats, pid) = base();
        let err = Config::new(uri, tmpl, i, 0, mon, fmt, vlan, stats, pid).unwrap_err();
        assert!(matches!(err, ConfigError::ZeroThreads));
    }

    #[test]
    fn accepts_valid_config() {
        let (uri, tmpl, i, t, mon, fmt, vlan, stats, pid) = base();
        assert!(Config::new(uri, tmpl, i, t, mon, fmt, vlan, stats, pid).is_ok());
    }
}
