//! The processing thread: fan-out consumer of the packet source.
//!
//! Must never block on disk I/O, `close()`, or cross-thread locks in the packet
//! path; a rotated interim file's descriptor is handed to the merge thread via
//! [`crate::message::ControlMessage::IntervalDone`] rather than closed here.

use std::path::Path;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Condvar, Mutex};
use std::time::Duration;

use crossbeam_channel::Sender;

use crate::config::Config;
use crate::filter::PacketFilter;
use crate::interval::{IntervalTracker, RotationAction};
use crate::message::{ControlMessage, ThreadId};
use crate::run_state::RunState;
use crate::source::PacketSource;
use crate::template::{self, ExtKind};
use crate::trace_io::{FastWriter, Packet, TraceIoError};

#[derive(Debug)]
pub enum ProcessingError {
    Trace(TraceIoError),
    Template(template::TemplateError),
    ChannelClosed,
}

impl std::fmt::Display for ProcessingError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ProcessingError::Trace(e) => write!(f, "{}", e),
            ProcessingError::Template(e) => write!(f, "{}", e),
            ProcessingError::ChannelClosed => write!(f, "control channel closed"),
        }
    }
}

impl std::error::Error for ProcessingError {}

impl From<TraceIoError> for ProcessingError {
    fn from(e: TraceIoError) -> Self {
        ProcessingError::Trace(e)
    }
}

impl From<template::TemplateError> for ProcessingError {
    fn from(e: template::TemplateError) -> Self {
        ProcessingError::Template(e)
    }
}

/// Rendezvous used to align every processing thread on the same first interval
/// boundary. Each thread calls `resolve` with the timestamp of the first packet
/// *it* observed; once every thread has proposed a value, all of them unblock
/// with the minimum across all proposals, matching the invariant that every
/// thread agrees on `current_interval_start` for its first active interval.
pub struct FirstPacketSync {
    thread_count: usize,
    state: Mutex<FirstPacketState>,
    cvar: Condvar,
}

#[derive(Default)]
struct FirstPacketState {
    proposals: Vec<u32>,
    resolved: Option<u32>,
}

impl FirstPacketSync {
    pub fn new(thread_count: usize) -> Self {
        FirstPacketSync {
            thread_count,
            state: Mutex::new(FirstPacketState::default()),
            cvar: Condvar::new(),
        }
    }

    pub fn resolve(&self, own_first_ts: u32) -> u32 {
        let mut guard = self.state.lock().unwrap();
        guard.proposals.push(own_first_ts);
        if guard.proposals.len() >= self.thread_count {
            let min = *guard.proposals.iter().min().unwrap();
            guard.resolved = Some(min);
            self.cvar.notify_all();
            min
        } else {
            while guard.resolved.is_none() {
                guard = self.cvar.wait(guard).unwrap();
            }
            guard.resolved.unwrap()
        }
    }
}

/// Strips an 802.1Q VLAN tag from an Ethernet frame, if present. A no-op on
/// anything shorter than a tagged Ethernet header.
fn strip_vlan_tag(data: &[u8]) -> Vec<u8> {
    const VLAN_ETHERTYPE: [u8; 2] = [0x81, 0x00];
    if data.len() < 18 || data[12..14] != VLAN_ETHERTYPE {
        return data.to_vec();
    }
    let mut out = Vec::with_capacity(data.len() - 4);
    out.extend_from_slice(&data[0..12]);
    out.extend_from_slice(&data[16..]);
    out
}

#[allow(clippy::too_many_arguments)]
pub fn run_processing_thread(
    thread_id: ThreadId,
    config: Arc<Config>,
    mut source: Box<dyn PacketSource>,
    filter: Arc<dyn PacketFilter>,
    first_sync: Arc<FirstPacketSync>,
    sender: Sender<ControlMessage>,
    run_state: Arc<RunState>,
) -> Result<(), ProcessingError> {
    let tick_due = Arc::new(AtomicBool::new(false));
    let tick_thread = {
        let tick_due = Arc::clone(&tick_due);
        let run_state = Arc::clone(&run_state);
        std::thread::spawn(move || {
            while !run_state.is_halted() {
                std::thread::sleep(Duration::from_secs(1));
                tick_due.store(true, Ordering::Relaxed);
            }
        })
    };

    let mut tracker = IntervalTracker::new(config.interval_secs);
    let mut writer: Option<FastWriter> = None;
    let mut sequence_no: u64 = 0;

    let result = (|| -> Result<(), ProcessingError> {
        loop {
            if tick_due.swap(false, Ordering::Relaxed) {
                tracing::debug!(thread_id, "tick");
            }

            let Some(packet) = source.next_packet().map_err(|_| ProcessingError::ChannelClosed)?
            else {
                break;
            };

            if tracker.state() == crate::interval::IntervalState::Unstarted {
                let first = first_sync.resolve(packet.ts_sec);
                tracker.start(first);
            }

            // A packet arriving after an idle gap spanning multiple intervals must
            // rotate once per crossed boundary, each emitting its own
            // `IntervalDone`, before the packet is filed into the interval its
            // timestamp actually belongs to.
            loop {
                let action = tracker.observe(packet.ts_sec, run_state.is_restart_requested());
                let ending = matches!(action, RotationAction::RotateAndEnd { .. });
                let closed_interval_start = match action {
                    RotationAction::None => break,
                    RotationAction::Rotate {
                        closed_interval_start,
                    }
                    | RotationAction::RotateAndEnd {
                        closed_interval_start,
                    } => closed_interval_start,
                };

                let detached_fd = writer.take().and_then(|mut w| w.reset());
                sequence_no += 1;
                sender
                    .send(ControlMessage::IntervalDone {
                        sender_thread_id: thread_id,
                        interval_start: closed_interval_start,
                        detached_fd,
                        source_stats: Some(source.stats()),
                        sequence_no,
                    })
                    .map_err(|_| ProcessingError::ChannelClosed)?;

                if ending {
                    let ended = run_state.mark_thread_ended();
                    if ended == config.thread_count {
                        run_state.set_halted();
                    }
                    return Ok(());
                }
            }

            if writer.is_none() {
                let uri = template::render_filename(
                    &config.output_template,
                    tracker.current_interval_start(),
                    thread_id as i64,
                    config.monitor_id.as_deref(),
                    config.trace_format,
                    false,
                    ExtKind::None,
                )?;
                writer = Some(FastWriter::open(Path::new(&uri))?);
            }

            if filter.accept(&packet) {
                let packet = if config.vlan_strip {
                    Packet {
                        data: strip_vlan_tag(&packet.data),
                        ..packet
                    }
                } else {
                    packet
                };
                writer.as_mut().unwrap().append(&packet)?;
            }
        }
        Ok(())
    })();

    run_state.set_halted();
    let _ = tick_thread;
    result
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::TraceFormat;
    use crate::filter::AcceptAll;
    use crate::source::VecPacketSource;
    use crossbeam_channel::unbounded;
    use std::path::PathBuf;
    use tempfile::tempdir;

    fn config(dir: &Path, interval: u32) -> Arc<Config> {
        Arc::new(
            Config::new(
                "offline".to_string(),
                dir.join("trace-%s").to_string_lossy().to_string(),
                interval,
                1,
                None,
                TraceFormat::PcapFile,
                false,
                true,
                PathBuf::from("/tmp/wdcap-test.pid"),
            )
            .unwrap(),
        )
    }

    #[test]
    fn single_thread_emits_interval_done_on_rotation() {
        let dir = tempdir().unwrap();
        let cfg = config(dir.path(), 10);
        let packets = vec![
            Packet { ts_sec: 95, ts_usec: 0, data: vec![1] },
            Packet { ts_sec: 101, ts_usec: 0, data: vec![2] },
        ];
        let source = Box::new(VecPacketSource::new(packets));
        let (tx, rx) = unbounded();
        let run_state = Arc::new(RunState::new());
        let first_sync = Arc::new(FirstPacketSync::new(1));

        run_processing_thread(
            0,
            cfg,
            source,
            Arc::new(AcceptAll),
            first_sync,
            tx,
            run_state,
        )
        .unwrap();

        let msg = rx.try_recv().unwrap();
        match msg {
            ControlMessage::IntervalDone { interval_start, .. } => assert_eq!(interval_start, 95),
            _ => panic!("expected IntervalDone"),
        }
    }

    #[test]
    fn idle_gap_spanning_multiple_intervals_emits_one_interval_done_per_boundary() {
        let dir = tempdir().unwrap();
        let cfg = config(dir.path(), 10);
        // First packet at 100 opens interval 100 (next_report=110). The second
        // packet, at 125, has crossed two boundaries (110 and 120) while idle;
        // each must get its own IntervalDone before the packet is filed into
        // interval 120.
        let packets = vec![
            Packet { ts_sec: 100, ts_usec: 0, data: vec![1] },
            Packet { ts_sec: 125, ts_usec: 0, data: vec![2] },
        ];
        let source = Box::new(VecPacketSource::new(packets));
        let (tx, rx) = unbounded();
        let run_state = Arc::new(RunState::new());
        let first_sync = Arc::new(FirstPacketSync::new(1));

        run_processing_thread(0, cfg, source, Arc::new(AcceptAll), first_sync, tx, run_state)
            .unwrap();

        let mut closed = Vec::new();
        while let Ok(ControlMessage::IntervalDone { interval_start, .. }) = rx.try_recv() {
            closed.push(interval_start);
        }
        assert_eq!(closed, vec![100, 110]);
    }

    #[test]
    fn strip_vlan_tag_removes_four_bytes_when_tagged() {
        let mut frame = vec![0u8; 18];
        frame[12] = 0x81;
        frame[13] = 0x00;
        assert_eq!(strip_vlan_tag(&frame).len(), 14);
        let untagged = vec![0u8; 14];
        assert_eq!(strip_vlan_tag(&untagged).len(), 14);
    }

    #[test]
    fn first_packet_sync_resolves_to_minimum_across_threads() {
        let sync = Arc::new(FirstPacketSync::new(2));
        let s1 = Arc::clone(&sync);
        let h = std::thread::spawn(move || s1.resolve(103));
        let resolved = sync.resolve(95);
        assert_eq!(resolved, 95);
        assert_eq!(h.join().unwrap(), 95);
    }
}
