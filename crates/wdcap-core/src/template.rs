//! Two-pass filename rendering.
//!
//! Custom tokens (`%m`, `%P`, `%X`, `%s`) are substituted first so that any `%`
//! characters they introduce are not mistaken for strftime specifiers in the
//! second pass, which formats the result against the interval's start time.

use crate::config::TraceFormat;
use chrono::{DateTime, Utc};

const MAX_LEN: usize = 10_000;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExtKind {
    None,
    Done,
    Stats,
}

#[derive(Debug)]
pub enum TemplateError {
    TooLong,
    InvalidTimestamp(u32),
}

impl std::fmt::Display for TemplateError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            TemplateError::TooLong => {
                write!(f, "rendered filename exceeds {} bytes", MAX_LEN)
            }
            TemplateError::InvalidTimestamp(ts) => {
                write!(f, "interval start {} is not a valid unix timestamp", ts)
            }
        }
    }
}

impl std::error::Error for TemplateError {}

/// `writer_id >= 0` renders an interim filename for that processing thread;
/// `writer_id < 0` renders the merged filename, whose suffix is governed by `ext_kind`.
#[allow(clippy::too_many_arguments)]
pub fn render_filename(
    template: &str,
    interval_start: u32,
    writer_id: i64,
    monitor_id: Option<&str>,
    trace_format: TraceFormat,
    need_format_prefix: bool,
    ext_kind: ExtKind,
) -> Result<String, TemplateError> {
    let mut first_pass = String::new();
    if need_format_prefix {
        first_pass.push_str(trace_format.uri_prefix());
        first_pass.push(':');
    }

    let mut chars = template.chars().peekable();
    while let Some(c) = chars.next() {
        if c != '%' {
            first_pass.push(c);
            continue;
        }
        match chars.next() {
            Some('m') => {
                // Escaped so a literal '%' in the monitor id survives the second,
                // strftime-style pass instead of being read as a time specifier.
                first_pass.push_str(&monitor_id.unwrap_or("").replace('%', "%%"))
            }
            Some('P') => first_pass.push_str("wdcap"),
            Some('X') => first_pass.push_str(trace_format.extension()),
            Some('s') => first_pass.push_str(&interval_start.to_string()),
            Some(other) => {
                first_pass.push('%');
                first_pass.push(other);
            }
            None => first_pass.push('%'),
        }
    }

    if writer_id >= 0 {
        first_pass.push_str(&format!("--{}", writer_id));
    } else {
        match ext_kind {
            ExtKind::None => {}
            ExtKind::Done => first_pass.push_str(".done"),
            ExtKind::Stats => first_pass.push_str(".stats"),
        }
    }

    let ts = DateTime::<Utc>::from_timestamp(interval_start as i64, 0)
        .ok_or(TemplateError::InvalidTimestamp(interval_start))?;
    let rendered = ts.format(&first_pass).to_string();

    if rendered.len() > MAX_LEN {
        return Err(TemplateError::TooLong);
    }
    Ok(rendered)
}
