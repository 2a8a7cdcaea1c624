//! Single-line PID file used by the supervisor to locate the running worker.

use std::fs;
use std::io;
use std::path::Path;

pub fn write_pid(path: &Path, pid: u32) -> io::Result<()> {
    fs::write(path, format!("{}\n", pid))
}

pub fn read_pid(path: &Path) -> io::Result<u32> {
    let content = fs::read_to_string(path)?;
    content
        .trim()
        .parse()
        .map_err(|_| io::Error::new(io::ErrorKind::InvalidData, "pidfile does not contain a PID"))
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn round_trips_a_pid() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("wdcap.pid");
        write_pid(&path, 4242).unwrap();
        assert_eq!(read_pid(&path).unwrap(), 4242);
    }

    #[test]
    fn rejects_garbage_content() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("wdcap.pid");
        fs::write(&path, "not a pid\n").unwrap();
        assert!(read_pid(&path).is_err());
    }
}
