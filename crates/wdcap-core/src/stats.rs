//! The per-interval stats file, one key per line, matching the schema recorded at
//! the side of the merged output file.

use std::fs;
use std::io;
use std::path::Path;
use std::time::Duration;

use crate::message::{SourceStatsSnapshot, ThreadId};

const FIELDS: [(&str, fn(&SourceStatsSnapshot) -> Option<u64>); 7] = [
    ("accepted", |s| s.accepted),
    ("filtered", |s| s.filtered),
    ("received", |s| s.received),
    ("dropped", |s| s.dropped),
    ("captured", |s| s.captured),
    ("missing", |s| s.missing),
    ("errors", |s| s.errors),
];

fn write_thread_block(out: &mut String, id: i64, stats: &SourceStatsSnapshot) {
    for (name, get) in FIELDS {
        let value = get(stats).map(|v| v as i64).unwrap_or(-1);
        out.push_str(&format!("thread:{} {}_pkts:{}\n", id, name, value));
    }
}

pub fn render_stats_file(
    interval_start: u32,
    per_thread: &[(ThreadId, SourceStatsSnapshot)],
    merge_duration: Duration,
) -> String {
    let mut out = String::new();
    out.push_str(&format!("time:{}\n", interval_start));
    for (id, stats) in per_thread {
        write_thread_block(&mut out, *id as i64, stats);
    }
    let snapshots: Vec<SourceStatsSnapshot> = per_thread.iter().map(|(_, s)| *s).collect();
    let aggregate = SourceStatsSnapshot::merge(&snapshots);
    write_thread_block(&mut out, -1, &aggregate);
    out.push_str(&format!(
        "merge_duration_msec:{}\n",
        merge_duration.as_millis()
    ));
    out
}

pub fn write_stats_file(
    path: &Path,
    interval_start: u32,
    per_thread: &[(ThreadId, SourceStatsSnapshot)],
    merge_duration: Duration,
) -> io::Result<()> {
    fs::write(path, render_stats_file(interval_start, per_thread, merge_duration))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn schema_has_time_header_and_aggregate_block() {
        let stats = SourceStatsSnapshot {
            accepted: Some(10),
            missing: Some(1),
            ..Default::default()
        };
        let rendered = render_stats_file(100, &[(0, stats)], Duration::from_millis(5));
        assert!(rendered.starts_with("time:100\n"));
        assert!(rendered.contains("thread:0 accepted_pkts:10\n"));
        assert!(rendered.contains("thread:0 dropped_pkts:-1\n"));
        assert!(rendered.contains("thread:-1 accepted_pkts:10\n"));
        assert!(rendered.contains("merge_duration_msec:5\n"));
    }

    #[test]
    fn aggregate_sums_across_threads() {
        let a = SourceStatsSnapshot { accepted: Some(3), ..Default::default() };
        let b = SourceStatsSnapshot { accepted: Some(4), ..Default::default() };
        let rendered = render_stats_file(0, &[(0, a), (1, b)], Duration::from_millis(0));
        assert!(rendered.contains("thread:-1 accepted_pkts:7\n"));
    }
}
