//! The merge thread: folds per-thread interim files for one interval into a single
//! chronologically-ordered output file, a `.done` sentinel, and (if enabled) a
//! stats file.

use std::cmp::Ordering;
use std::collections::BinaryHeap;
use std::fs::File;
use std::os::fd::OwnedFd;
use std::path::Path;
use std::sync::Arc;
use std::time::{Duration, Instant};

use crossbeam_channel::Receiver;

use crate::config::Config;
use crate::message::{ControlMessage, SourceStatsSnapshot, ThreadId};
use crate::stats;
use crate::template::{self, ExtKind};
use crate::trace_io::{InterimReader, MergeWriter, Packet, TraceIoError};

#[derive(Debug)]
pub enum MergeError {
    Trace(TraceIoError),
    Template(template::TemplateError),
}

impl std::fmt::Display for MergeError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            MergeError::Trace(e) => write!(f, "{}", e),
            MergeError::Template(e) => write!(f, "{}", e),
        }
    }
}

impl std::error::Error for MergeError {}

impl From<TraceIoError> for MergeError {
    fn from(e: TraceIoError) -> Self {
        MergeError::Trace(e)
    }
}

impl From<template::TemplateError> for MergeError {
    fn from(e: template::TemplateError) -> Self {
        MergeError::Template(e)
    }
}

struct PendingInterval {
    timestamp: u32,
    thread_stats: Vec<(ThreadId, SourceStatsSnapshot)>,
}

impl PendingInterval {
    fn new(timestamp: u32) -> Self {
        PendingInterval {
            timestamp,
            thread_stats: Vec::new(),
        }
    }
}

pub fn run_merge_thread(config: Arc<Config>, receiver: Receiver<ControlMessage>) -> Result<(), MergeError> {
    let mut pending: Vec<PendingInterval> = Vec::new();

    loop {
        let message = match receiver.recv() {
            Ok(m) => m,
            Err(_) => break,
        };

        match message {
            ControlMessage::Stop => break,
            ControlMessage::IntervalDone {
                sender_thread_id,
                interval_start,
                detached_fd,
                source_stats,
                ..
            } => {
                if let Some(fd) = detached_fd {
                    close_detached_fd(fd);
                }

                let idx = match pending.iter().position(|p| p.timestamp == interval_start) {
                    Some(i) => i,
                    None => {
                        pending.push(PendingInterval::new(interval_start));
                        pending.len() - 1
                    }
                };
                pending[idx]
                    .thread_stats
                    .push((sender_thread_id, source_stats.unwrap_or_default()));

                if pending[idx].thread_stats.len() == config.thread_count {
                    if idx != 0 {
                        tracing::warn!(
                            head = pending[0].timestamp,
                            completed = interval_start,
                            "interval completed out of arrival order"
                        );
                    }
                    let entry = pending.remove(idx);
                    if let Err(e) = perform_merge(&config, entry) {
                        tracing::error!(error = %e, "merge failed; interim files left on disk");
                    }
                }
            }
        }
    }

    Ok(())
}

/// Blocking close of a descriptor detached by a processing thread's `reset()`.
/// Safe to block here: the merge thread is never on the packet path.
fn close_detached_fd(fd: OwnedFd) {
    drop(File::from(fd));
}

struct HeapEntry {
    timestamp: u64,
    slot: usize,
    packet: Packet,
}

impl PartialEq for HeapEntry {
    fn eq(&self, other: &Self) -> bool {
        self.timestamp == other.timestamp && self.slot == other.slot
    }
}
impl Eq for HeapEntry {}

impl PartialOrd for HeapEntry {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for HeapEntry {
    fn cmp(&self, other: &Self) -> Ordering {
        // Reversed so `BinaryHeap` (a max-heap) pops the smallest timestamp first,
        // breaking ties by the lowest originating thread index.
        other
            .timestamp
            .cmp(&self.timestamp)
            .then_with(|| other.slot.cmp(&self.slot))
    }
}

fn perform_merge(config: &Config, entry: PendingInterval) -> Result<(), MergeError> {
    let start = Instant::now();
    let mut readers: Vec<Option<(InterimReader, String)>> = Vec::with_capacity(config.thread_count);
    for t in 0..config.thread_count {
        let uri = template::render_filename(
            &config.output_template,
            entry.timestamp,
            t as i64,
            config.monitor_id.as_deref(),
            config.trace_format,
            false,
            ExtKind::None,
        )?;
        match InterimReader::open(Path::new(&uri)) {
            Ok(reader) => readers.push(Some((reader, uri))),
            Err(_) => readers.push(None),
        }
    }

    let merged_uri = template::render_filename(
        &config.output_template,
        entry.timestamp,
        -1,
        config.monitor_id.as_deref(),
        config.trace_format,
        false,
        ExtKind::None,
    )?;
    let mut writer = MergeWriter::open(Path::new(&merged_uri))?;

    let mut heap: BinaryHeap<HeapEntry> = BinaryHeap::new();
    for (slot, reader) in readers.iter_mut().enumerate() {
        if let Some((r, _)) = reader
            && let Some(packet) = r.next()?
        {
            heap.push(HeapEntry {
                timestamp: packet.erf_timestamp(),
                slot,
                packet,
            });
        }
    }

    while let Some(HeapEntry { slot, packet, .. }) = heap.pop() {
        writer.append(&packet)?;
        if let Some((r, _)) = &mut readers[slot]
            && let Some(next) = r.next()?
        {
            heap.push(HeapEntry {
                timestamp: next.erf_timestamp(),
                slot,
                packet: next,
            });
        }
    }

    writer.close()?;

    let done_uri = template::render_filename(
        &config.output_template,
        entry.timestamp,
        -1,
        config.monitor_id.as_deref(),
        config.trace_format,
        false,
        ExtKind::Done,
    )?;
    if let Err(e) = File::create(&done_uri) {
        tracing::error!(error = %e, path = %done_uri, "failed to create done sentinel");
    }

    if config.write_stats {
        let stats_uri = template::render_filename(
            &config.output_template,
            entry.timestamp,
            -1,
            config.monitor_id.as_deref(),
            config.trace_format,
            false,
            ExtKind::Stats,
        )?;
        if let Err(e) = stats::write_stats_file(
            Path::new(&stats_uri),
            entry.timestamp,
            &entry.thread_stats,
            start.elapsed(),
        ) {
            tracing::error!(error = %e, path = %stats_uri, "failed to write stats file");
        }
    }

    for reader in readers.into_iter().flatten() {
        let (reader, uri) = reader;
        if let Err(e) = reader.close_and_remove(&uri) {
            tracing::warn!(error = %e, path = %uri, "failed to remove interim file");
        }
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::TraceFormat;
    use crate::trace_io::FastWriter;
    use std::path::PathBuf;
    use tempfile::tempdir;

    fn config(dir: &Path, threads: usize) -> Config {
        Config::new(
            "offline".to_string(),
            dir.join("trace-%s").to_string_lossy().to_string(),
            60,
            threads,
            None,
            TraceFormat::PcapFile,
            false,
            true,
            PathBuf::from("/tmp/wdcap-test.pid"),
        )
        .unwrap()
    }

    fn write_interim(path: &Path, packets: &[(u32, u32)]) {
        let mut w = FastWriter::open(path).unwrap();
        for &(sec, usec) in packets {
            w.append(&Packet {
                ts_sec: sec,
                ts_usec: usec,
                data: vec![0xAB],
            })
            .unwrap();
        }
        w.destroy();
    }

    #[test]
    fn merges_two_threads_in_chronological_order() {
        let dir = tempdir().unwrap();
        let cfg = config(dir.path(), 2);

        let p0 = template::render_filename(
            &cfg.output_template, 60, 0, None, cfg.trace_format, false, ExtKind::None,
        )
        .unwrap();
        let p1 = template::render_filename(
            &cfg.output_template, 60, 1, None, cfg.trace_format, false, ExtKind::None,
        )
        .unwrap();
        write_interim(Path::new(&p0), &[(100, 0), (100, 500_000), (101, 200_000)]);
        write_interim(Path::new(&p1), &[(100, 100_000), (101, 0)]);

        let entry = PendingInterval {
            timestamp: 60,
            thread_stats: vec![(0, SourceStatsSnapshot::default()), (1, SourceStatsSnapshot::default())],
        };
        perform_merge(&cfg, entry).unwrap();

        let merged_uri = template::render_filename(
            &cfg.output_template, 60, -1, None, cfg.trace_format, false, ExtKind::None,
        )
        .unwrap();
        let mut reader = InterimReader::open(Path::new(&merged_uri)).unwrap();
        let mut order = Vec::new();
        while let Some(p) = reader.next().unwrap() {
            order.push((p.ts_sec, p.ts_usec));
        }
        assert_eq!(
            order,
            vec![(100, 0), (100, 100_000), (100, 500_000), (101, 0), (101, 200_000)]
        );

        assert!(!Path::new(&p0).exists());
        assert!(!Path::new(&p1).exists());

        let done_uri = template::render_filename(
            &cfg.output_template, 60, -1, None, cfg.trace_format, false, ExtKind::Done,
        )
        .unwrap();
        assert!(Path::new(&done_uri).exists());
    }

    #[test]
    fn empty_thread_slot_is_skipped() {
        let dir = tempdir().unwrap();
        let cfg = config(dir.path(), 2);

        let p0 = template::render_filename(
            &cfg.output_template, 60, 0, None, cfg.trace_format, false, ExtKind::None,
        )
        .unwrap();
        write_interim(Path::new(&p0), &[(100, 0)]);
        // Thread 1 wrote nothing: no interim file exists for it.

        let entry = PendingInterval {
            timestamp: 60,
            thread_stats: vec![(0, SourceStatsSnapshot::default()), (1, SourceStatsSnapshot::default())],
        };
        perform_merge(&cfg, entry).unwrap();

        let merged_uri = template::render_filename(
            &cfg.output_template, 60, -1, None, cfg.trace_format, false, ExtKind::None,
        )
        .unwrap();
        let mut reader = InterimReader::open(Path::new(&merged_uri)).unwrap();
        let mut count = 0;
        while reader.next().unwrap().is_some() {
            count += 1;
        }
        assert_eq!(count, 1);
    }
}
