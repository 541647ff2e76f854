//! Append-only write-ahead log for admitted mempool entries.
//!
//! The file is a sequence of `u32` big-endian length prefixes, each followed
//! by one RLP-encoded record. The WAL append is the admission commit point:
//! a record is written (and synced per the configured cadence) before the
//! entry becomes visible to pool readers.

use std::{
    fs::{File, OpenOptions},
    io::{Read, Write},
    path::{Path, PathBuf},
    time::{Duration, Instant},
};

use alloy_rlp::{RlpDecodable, RlpEncodable};

use crate::errors::FatalError;

/// How often appended records are forced to disk.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FsyncPolicy {
    /// `fdatasync` after every record.
    EveryRecord,
    /// `fdatasync` at most once per interval; the tail of the interval can
    /// be lost on a crash.
    Interval(Duration),
}

/// One durable admission record: the raw wire bytes plus the conditional
/// predicate bounds, absent bounds masked out of `flags`.
#[derive(Debug, Clone, PartialEq, Eq, RlpEncodable, RlpDecodable)]
pub struct WalRecord {
    /// Raw transaction wire bytes
    pub raw: Vec<u8>,
    /// Bit i set means predicate field i is present:
    /// 0 = block_number_min, 1 = block_number_max,
    /// 2 = timestamp_min, 3 = timestamp_max
    pub flags: u8,
    /// Inclusive lower block bound, valid when bit 0 is set
    pub block_number_min: u64,
    /// Inclusive upper block bound, valid when bit 1 is set
    pub block_number_max: u64,
    /// Inclusive lower timestamp bound, valid when bit 2 is set
    pub timestamp_min: u64,
    /// Inclusive upper timestamp bound, valid when bit 3 is set
    pub timestamp_max: u64,
}

/// What replay found in an existing log.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct ReplayReport {
    /// Records decoded in order.
    pub replayed: usize,
    /// Bytes truncated from a torn tail record, if any.
    pub truncated_bytes: usize,
}

/// The open log handle.
#[derive(Debug)]
pub struct Wal {
    file: File,
    path: PathBuf,
    policy: FsyncPolicy,
    last_sync: Instant,
}

impl Wal {
    /// Opens (creating if needed) the log for appending.
    pub fn open(path: impl AsRef<Path>, policy: FsyncPolicy) -> std::io::Result<Self> {
        if let Some(parent) = path.as_ref().parent() {
            std::fs::create_dir_all(parent)?;
        }
        let file = OpenOptions::new()
            .create(true)
            .read(true)
            .append(true)
            .open(path.as_ref())?;
        Ok(Self {
            file,
            path: path.as_ref().to_path_buf(),
            policy,
            last_sync: Instant::now(),
        })
    }

    /// The log file path.
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Appends one record and syncs per the configured cadence.
    pub fn append(&mut self, record: &WalRecord) -> std::io::Result<()> {
        let payload = alloy_rlp::encode(record);
        let len = u32::try_from(payload.len())
            .map_err(|_| std::io::Error::new(std::io::ErrorKind::InvalidInput, "record too large"))?;
        self.file.write_all(&len.to_be_bytes())?;
        self.file.write_all(&payload)?;

        match self.policy {
            FsyncPolicy::EveryRecord => self.file.sync_data()?,
            FsyncPolicy::Interval(interval) => {
                if self.last_sync.elapsed() >= interval {
                    self.file.sync_data()?;
                    self.last_sync = Instant::now();
                }
            }
        }
        Ok(())
    }

    /// Forces buffered records to disk.
    pub fn flush(&mut self) -> std::io::Result<()> {
        self.file.sync_data()
    }

    /// Reads all records in order, truncating a torn tail record. Corrupt
    /// records before the tail are fatal.
    pub fn replay(
        path: impl AsRef<Path>,
    ) -> Result<(Vec<WalRecord>, ReplayReport), FatalError> {
        let path = path.as_ref();
        let mut report = ReplayReport::default();
        let mut records = Vec::new();

        if !path.exists() {
            return Ok((records, report));
        }

        let mut file = File::open(path)
            .map_err(|e| FatalError::WalCorruption(format!("open {}: {e}", path.display())))?;
        let mut data = Vec::new();
        file.read_to_end(&mut data)
            .map_err(|e| FatalError::WalCorruption(format!("read {}: {e}", path.display())))?;

        let mut offset = 0usize;
        while offset < data.len() {
            let remaining = data.len() - offset;
            if remaining < 4 {
                report.truncated_bytes = remaining;
                break;
            }
            let len = u32::from_be_bytes(data[offset..offset + 4].try_into().unwrap()) as usize;
            if remaining - 4 < len {
                report.truncated_bytes = remaining;
                break;
            }
            let payload = &data[offset + 4..offset + 4 + len];
            let record: WalRecord = crate::codec::decode_exact(payload).map_err(|e| {
                FatalError::WalCorruption(format!(
                    "record at byte {offset} of {}: {e}",
                    path.display()
                ))
            })?;
            records.push(record);
            report.replayed += 1;
            offset += 4 + len;
        }

        if report.truncated_bytes > 0 {
            tracing::warn!(
                "truncating {} torn tail bytes from {}",
                report.truncated_bytes,
                path.display()
            );
            let keep = (data.len() - report.truncated_bytes) as u64;
            let file = OpenOptions::new().write(true).open(path).map_err(|e| {
                FatalError::WalCorruption(format!("reopen {}: {e}", path.display()))
            })?;
            file.set_len(keep)
                .map_err(|e| FatalError::WalCorruption(format!("truncate: {e}")))?;
        }

        Ok((records, report))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn temp_wal_path(name: &str) -> PathBuf {
        let mut path = std::env::temp_dir();
        path.push(format!("tempo-wal-test-{name}-{}", std::process::id()));
        let _ = std::fs::remove_file(&path);
        path
    }

    fn record(byte: u8) -> WalRecord {
        WalRecord {
            raw: vec![byte; 16],
            flags: 0b0010,
            block_number_min: 0,
            block_number_max: 100,
            timestamp_min: 0,
            timestamp_max: 0,
        }
    }

    #[test]
    fn append_then_replay() {
        let path = temp_wal_path("roundtrip");
        let mut wal = Wal::open(&path, FsyncPolicy::EveryRecord).unwrap();
        wal.append(&record(1)).unwrap();
        wal.append(&record(2)).unwrap();
        drop(wal);

        let (records, report) = Wal::replay(&path).unwrap();
        assert_eq!(report.replayed, 2);
        assert_eq!(report.truncated_bytes, 0);
        assert_eq!(records, vec![record(1), record(2)]);
        std::fs::remove_file(&path).unwrap();
    }

    #[test]
    fn torn_tail_is_truncated() {
        let path = temp_wal_path("torn");
        let mut wal = Wal::open(&path, FsyncPolicy::EveryRecord).unwrap();
        wal.append(&record(1)).unwrap();
        drop(wal);

        // simulate a crash mid-append
        let mut file = OpenOptions::new().append(true).open(&path).unwrap();
        file.write_all(&[0x00, 0x00, 0x00, 0xff, 0x01]).unwrap();
        drop(file);

        let (records, report) = Wal::replay(&path).unwrap();
        assert_eq!(report.replayed, 1);
        assert_eq!(report.truncated_bytes, 5);
        assert_eq!(records.len(), 1);

        // after truncation a second replay is clean
        let (records, report) = Wal::replay(&path).unwrap();
        assert_eq!(records.len(), 1);
        assert_eq!(report.truncated_bytes, 0);
        std::fs::remove_file(&path).unwrap();
    }

    #[test]
    fn corrupt_record_is_fatal() {
        let path = temp_wal_path("corrupt");
        // a full-length record that is not valid RLP, followed by a valid one
        let mut file = File::create(&path).unwrap();
        file.write_all(&4u32.to_be_bytes()).unwrap();
        file.write_all(&[0xff, 0xff, 0xff, 0xff]).unwrap();
        drop(file);

        assert!(matches!(
            Wal::replay(&path),
            Err(FatalError::WalCorruption(_))
        ));
        std::fs::remove_file(&path).unwrap();
    }

    #[test]
    fn replay_of_missing_file_is_empty() {
        let path = temp_wal_path("missing");
        let (records, report) = Wal::replay(&path).unwrap();
        assert!(records.is_empty());
        assert_eq!(report.replayed, 0);
    }
}
