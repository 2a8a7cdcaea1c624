//! Trace file I/O: the fast interim writer, the sequential interim reader, and the
//! synchronous merge writer, all built on top of the `pcap-file` crate.

use std::borrow::Cow;
use std::fs::{self, File};
use std::os::fd::OwnedFd;
use std::path::Path;
use std::time::Duration;

use pcap_file::pcap::{PcapPacket, PcapReader, PcapWriter};

#[derive(Debug)]
pub enum TraceIoError {
    Io(std::io::Error),
    Format(pcap_file::PcapError),
}

impl std::fmt::Display for TraceIoError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            TraceIoError::Io(e) => write!(f, "I/O error: {}", e),
            TraceIoError::Format(e) => write!(f, "trace format error: {}", e),
        }
    }
}

impl std::error::Error for TraceIoError {}

impl From<std::io::Error> for TraceIoError {
    fn from(e: std::io::Error) -> Self {
        TraceIoError::Io(e)
    }
}

impl From<pcap_file::PcapError> for TraceIoError {
    fn from(e: pcap_file::PcapError) -> Self {
        TraceIoError::Format(e)
    }
}

/// A captured packet, timestamped with the capture device's native resolution.
#[derive(Debug, Clone)]
pub struct Packet {
    pub ts_sec: u32,
    pub ts_usec: u32,
    pub data: Vec<u8>,
}

impl Packet {
    /// A monotone 64-bit key combining seconds and sub-second units, used for the
    /// merge thread's ordering comparisons.
    pub fn erf_timestamp(&self) -> u64 {
        ((self.ts_sec as u64) << 32) | self.ts_usec as u64
    }

    fn to_pcap_packet(&self) -> PcapPacket<'_> {
        PcapPacket {
            timestamp: Duration::new(self.ts_sec as u64, self.ts_usec * 1000),
            orig_len: self.data.len() as u32,
            data: Cow::Borrowed(&self.data),
        }
    }

    fn from_pcap_packet(p: PcapPacket<'_>) -> Packet {
        Packet {
            ts_sec: p.timestamp.as_secs() as u32,
            ts_usec: p.timestamp.subsec_micros(),
            data: p.data.into_owned(),
        }
    }
}

/// Strips the `<format>:` URI prefix templated filenames may carry, as stored paths
/// on disk never include it.
pub fn strip_format_prefix(uri: &str) -> &str {
    uri.split_once(':').map(|(_, rest)| rest).unwrap_or(uri)
}

/// Write-only handle to one interim trace file, owned exclusively by one processing
/// thread. Never calls the blocking variant of close on the hot path: `reset()`
/// detaches the descriptor for the merge thread to close instead.
pub struct FastWriter {
    writer: Option<PcapWriter<File>>,
}

impl FastWriter {
    pub fn open(path: &Path) -> Result<Self, TraceIoError> {
        let file = File::create(path)?;
        let writer = PcapWriter::new(file)?;
        Ok(FastWriter {
            writer: Some(writer),
        })
    }

    pub fn append(&mut self, packet: &Packet) -> Result<(), TraceIoError> {
        let writer = self
            .writer
            .as_mut()
            .expect("append called after reset/destroy");
        writer.write_packet(&packet.to_pcap_packet())?;
        Ok(())
    }

    /// Detaches the underlying file descriptor without closing it. The caller
    /// forwards the returned `OwnedFd` to the merge thread, which performs the
    /// actual (possibly blocking) close.
    pub fn reset(&mut self) -> Option<OwnedFd> {
        let writer = self.writer.take()?;
        let file = writer.into_writer();
        Some(OwnedFd::from(file))
    }

    pub fn destroy(self) {}
}

/// Sequential reader over one finished interim file.
pub struct InterimReader {
    reader: PcapReader<File>,
}

impl InterimReader {
    pub fn open(path: &Path) -> Result<Self, TraceIoError> {
        let file = File::open(path)?;
        let reader = PcapReader::new(file)?;
        Ok(InterimReader { reader })
    }

    pub fn next(&mut self) -> Result<Option<Packet>, TraceIoError> {
        match self.reader.next_packet() {
            Some(result) => Ok(Some(Packet::from_pcap_packet(result?))),
            None => Ok(None),
        }
    }

    /// `uri` is the path as recorded when the interim writer was opened, which may
    /// carry a `<format>:` prefix if `need_format_prefix` was set; the prefix is
    /// stripped before unlinking.
    pub fn close_and_remove(self, uri: &str) -> Result<(), TraceIoError> {
        drop(self.reader);
        fs::remove_file(strip_format_prefix(uri))?;
        Ok(())
    }
}

/// Synchronous writer for the final merged output.
pub struct MergeWriter {
    writer: PcapWriter<File>,
}

impl MergeWriter {
    pub fn open(path: &Path) -> Result<Self, TraceIoError> {
        let file = File::create(path)?;
        let writer = PcapWriter::new(file)?;
        Ok(MergeWriter { writer })
    }

    pub fn append(&mut self, packet: &Packet) -> Result<(), TraceIoError> {
        self.writer.write_packet(&packet.to_pcap_packet())?;
        Ok(())
    }

    pub fn close(self) -> Result<(), TraceIoError> {
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    fn pkt(ts_sec: u32, ts_usec: u32) -> Packet {
        Packet {
            ts_sec,
            ts_usec,
            data: vec![1, 2, 3],
        }
    }

    #[test]
    fn write_then_read_round_trips_packet_count() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("interim.pcap");
        let mut w = FastWriter::open(&path).unwrap();
        w.append(&pkt(100, 0)).unwrap();
        w.append(&pkt(100, 500)).unwrap();
        w.destroy();

        let mut r = InterimReader::open(&path).unwrap();
        let mut count = 0;
        while r.next().unwrap().is_some() {
            count += 1;
        }
        assert_eq!(count, 2);
    }

    #[test]
    fn erf_timestamp_orders_by_seconds_then_microseconds() {
        let a = pkt(100, 999_000);
        let b = pkt(101, 0);
        assert!(a.erf_timestamp() < b.erf_timestamp());
    }

    #[test]
    fn strip_format_prefix_removes_leading_scheme() {
        assert_eq!(strip_format_prefix("pcapfile:/tmp/x"), "/tmp/x");
        assert_eq!(strip_format_prefix("/tmp/x"), "/tmp/x");
    }
}
