//! The fixed set of messages carried over the processing-thread-to-merge-thread channel.

use std::os::fd::OwnedFd;

pub type ThreadId = usize;

/// Cumulative per-thread counters as reported by the packet source at interval close.
/// A value of `None` means the source does not populate that counter.
#[derive(Debug, Clone, Copy, Default)]
pub struct SourceStatsSnapshot {
    pub accepted: Option<u64>,
    pub filtered: Option<u64>,
    pub received: Option<u64>,
    pub dropped: Option<u64>,
    pub captured: Option<u64>,
    pub missing: Option<u64>,
    pub errors: Option<u64>,
}

impl SourceStatsSnapshot {
    /// Field-wise sum, treating `None` as absent rather than zero: the aggregate
    /// field is `None` only if every contributing snapshot left it `None`.
    pub fn merge(accumulated: &[SourceStatsSnapshot]) -> SourceStatsSnapshot {
        fn sum(values: impl Iterator<Item = Option<u64>>) -> Option<u64> {
            let mut total = None;
            for v in values {
                if let Some(v) = v {
                    total = Some(total.unwrap_or(0) + v);
                }
            }
            total
        }
        SourceStatsSnapshot {
            accepted: sum(accumulated.iter().map(|s| s.accepted)),
            filtered: sum(accumulated.iter().map(|s| s.filtered)),
            received: sum(accumulated.iter().map(|s| s.received)),
            dropped: sum(accumulated.iter().map(|s| s.dropped)),
            captured: sum(accumulated.iter().map(|s| s.captured)),
            missing: sum(accumulated.iter().map(|s| s.missing)),
            errors: sum(accumulated.iter().map(|s| s.errors)),
        }
    }
}

/// Fixed-size control message sent from a processing thread (or the main thread,
/// for `Stop`) to the merge thread.
pub enum ControlMessage {
    IntervalDone {
        sender_thread_id: ThreadId,
        interval_start: u32,
        /// Ownership of the rotated interim file's descriptor, transferred here so
        /// the merge thread can perform the (possibly blocking) close.
        detached_fd: Option<OwnedFd>,
        source_stats: Option<SourceStatsSnapshot>,
        sequence_no: u64,
    },
    Stop,
}

impl std::fmt::Debug for ControlMessage {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ControlMessage::IntervalDone {
                sender_thread_id,
                interval_start,
                detached_fd,
                sequence_no,
                ..
            } => f
                .debug_struct("IntervalDone")
                .field("sender_thread_id", sender_thread_id)
                .field("interval_start", interval_start)
                .field("has_fd", &detached_fd.is_some())
                .field("sequence_no", sequence_no)
                .finish(),
            ControlMessage::Stop => write!(f, "Stop"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn merge_treats_absent_counters_as_absent_not_zero() {
        let a = SourceStatsSnapshot {
            accepted: Some(10),
            ..Default::default()
        };
        let b = SourceStatsSnapshot {
            accepted: Some(5),
            missing: Some(2),
            ..Default::default()
        };
        let merged = SourceStatsSnapshot::merge(&[a, b]);
        assert_eq!(merged.accepted, Some(15));
        assert_eq!(merged.missing, Some(2));
        assert_eq!(merged.dropped, None);
    }
}
