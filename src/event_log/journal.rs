//! Per-stream journal file
//!
//! Append-only file of framed [`JournalOp`] records at
//! `<data_dir>/streams/<stream>.journal`. An append is only acknowledged
//! after the write (and fsync, when enabled) returns.
//!
//! On open the whole journal is replayed:
//! - A checksum or decode failure is corruption and fails the open
//! - A record cut short at the end of the file is a torn write that was
//!   never acknowledged; it is truncated away

use std::fs::{self, File, OpenOptions};
use std::io::{self, Write};
use std::path::{Path, PathBuf};

use tracing::{error, warn};

use super::errors::{EventLogError, EventLogResult};
use super::record::{decode, encode, Decoded, EncodeError, JournalOp};

/// File extension of stream journals
pub const JOURNAL_EXTENSION: &str = "journal";

/// Journal directory below the data directory
pub fn journal_dir(data_dir: &Path) -> PathBuf {
    data_dir.join("streams")
}

/// Append handle for one stream journal
#[derive(Debug)]
pub struct Journal {
    path: PathBuf,
    file: File,
    sync_on_append: bool,
    /// Set when a failed write could not be rolled back
    poisoned: bool,
}

impl Journal {
    /// Open (creating if missing) the journal for `stream` and replay it
    pub fn open(
        data_dir: &Path,
        stream: &str,
        sync_on_append: bool,
    ) -> EventLogResult<(Self, Vec<JournalOp>)> {
        let dir = journal_dir(data_dir);
        fs::create_dir_all(&dir).map_err(|e| {
            EventLogError::unavailable(
                format!("failed to create journal directory {}", dir.display()),
                e,
            )
        })?;

        let path = dir.join(format!("{}.{}", stream, JOURNAL_EXTENSION));
        let ops = Self::replay(&path)?;

        let file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&path)
            .map_err(|e| {
                EventLogError::unavailable(format!("failed to open journal {}", path.display()), e)
            })?;

        Ok((
            Self {
                path,
                file,
                sync_on_append,
                poisoned: false,
            },
            ops,
        ))
    }

    /// Read every record of an existing journal, truncating a torn tail
    fn replay(path: &Path) -> EventLogResult<Vec<JournalOp>> {
        let bytes = match fs::read(path) {
            Ok(bytes) => bytes,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => {
                return Err(EventLogError::unavailable(
                    format!("failed to read journal {}", path.display()),
                    e,
                ))
            }
        };

        let mut ops = Vec::new();
        let mut position = 0usize;

        while position < bytes.len() {
            match decode(&bytes[position..]) {
                Decoded::Record(op, used) => {
                    ops.push(op);
                    position += used;
                }
                Decoded::Incomplete => {
                    warn!(
                        journal = %path.display(),
                        valid_bytes = position,
                        torn_bytes = bytes.len() - position,
                        "truncating torn journal tail"
                    );
                    let file = OpenOptions::new().write(true).open(path).map_err(|e| {
                        EventLogError::unavailable("failed to open journal for truncation", e)
                    })?;
                    file.set_len(position as u64).map_err(|e| {
                        EventLogError::unavailable("failed to truncate torn journal tail", e)
                    })?;
                    break;
                }
                Decoded::Corrupt(reason) => {
                    return Err(EventLogError::Corruption {
                        path: path.display().to_string(),
                        offset: position as u64,
                        reason,
                    })
                }
            }
        }

        Ok(ops)
    }

    /// Path of the journal file
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Durably append one op
    ///
    /// A failed write or fsync truncates the file back to its length before
    /// the call, so a partial frame never ends up in front of later records.
    pub fn append(&mut self, op: &JournalOp) -> EventLogResult<()> {
        if self.poisoned {
            return Err(EventLogError::unavailable(
                format!("journal {} needs recovery", self.path.display()),
                io::Error::new(io::ErrorKind::Other, "earlier write could not be rolled back"),
            ));
        }

        let record = encode(op).map_err(|e| match e {
            EncodeError::TooLarge { .. } => EventLogError::InvalidArgument(e.to_string()),
            EncodeError::Serialize(_) => EventLogError::Internal(e.to_string()),
        })?;

        let start = self.file.metadata().map_err(|e| {
            EventLogError::unavailable(format!("failed to stat journal {}", self.path.display()), e)
        })?;
        let start = start.len();

        if let Err(e) = self.write_record(&record) {
            self.rollback(start);
            return Err(EventLogError::unavailable(
                format!("failed to write journal {}", self.path.display()),
                e,
            ));
        }
        Ok(())
    }

    fn write_record(&mut self, record: &[u8]) -> io::Result<()> {
        self.file.write_all(record)?;
        if self.sync_on_append {
            self.file.sync_data()?;
        }
        Ok(())
    }

    /// Cut the file back to `len` bytes after a failed write
    fn rollback(&mut self, len: u64) {
        if let Err(e) = self.file.set_len(len) {
            error!(
                journal = %self.path.display(),
                error = %e,
                "failed to roll back partial journal write"
            );
            self.poisoned = true;
        }
    }
}

/// Stream names that have a journal in `data_dir`
pub fn discover_streams(data_dir: &Path) -> EventLogResult<Vec<String>> {
    let dir = journal_dir(data_dir);
    let entries = match fs::read_dir(&dir) {
        Ok(entries) => entries,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
        Err(e) => {
            return Err(EventLogError::unavailable(
                format!("failed to list {}", dir.display()),
                e,
            ))
        }
    };

    let mut streams = Vec::new();
    for entry in entries {
        let entry = entry.map_err(|e| EventLogError::unavailable("failed to list journals", e))?;
        let path = entry.path();
        if path.extension().and_then(|e| e.to_str()) != Some(JOURNAL_EXTENSION) {
            continue;
        }
        if let Some(stem) = path.file_stem().and_then(|s| s.to_str()) {
            streams.push(stem.to_string());
        }
    }
    streams.sort();
    Ok(streams)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::event_log::event::Event;
    use serde_json::json;
    use tempfile::TempDir;

    fn append_op(offset: u64) -> JournalOp {
        JournalOp::Append {
            offset,
            event: Event::with_id(format!("e{}", offset), "finbot.tx.created", "finbot", json!({})),
        }
    }

    #[test]
    fn test_reopen_replays_ops() {
        let dir = TempDir::new().unwrap();
        {
            let (mut journal, ops) = Journal::open(dir.path(), "finbot.events", true).unwrap();
            assert!(ops.is_empty());
            journal.append(&append_op(1)).unwrap();
            journal.append(&append_op(2)).unwrap();
        }

        let (_, ops) = Journal::open(dir.path(), "finbot.events", true).unwrap();
        assert_eq!(ops, vec![append_op(1), append_op(2)]);
    }

    #[test]
    fn test_torn_tail_is_truncated() {
        let dir = TempDir::new().unwrap();
        let path;
        {
            let (mut journal, _) = Journal::open(dir.path(), "finbot.events", false).unwrap();
            journal.append(&append_op(1)).unwrap();
            path = journal.path().to_path_buf();
        }

        let valid_len = fs::metadata(&path).unwrap().len();
        let mut file = OpenOptions::new().append(true).open(&path).unwrap();
        let torn = encode(&append_op(2)).unwrap();
        file.write_all(&torn[..torn.len() / 2]).unwrap();
        drop(file);

        let (_, ops) = Journal::open(dir.path(), "finbot.events", false).unwrap();
        assert_eq!(ops, vec![append_op(1)]);
        assert_eq!(fs::metadata(&path).unwrap().len(), valid_len);
    }

    #[test]
    fn test_corruption_fails_open() {
        let dir = TempDir::new().unwrap();
        let path;
        {
            let (mut journal, _) = Journal::open(dir.path(), "finbot.events", false).unwrap();
            journal.append(&append_op(1)).unwrap();
            journal.append(&append_op(2)).unwrap();
            path = journal.path().to_path_buf();
        }

        let mut bytes = fs::read(&path).unwrap();
        bytes[12] ^= 0xFF;
        fs::write(&path, bytes).unwrap();

        let result = Journal::open(dir.path(), "finbot.events", false);
        assert!(matches!(result, Err(EventLogError::Corruption { offset: 0, .. })));
    }

    #[test]
    fn test_oversized_op_is_rejected_and_journal_stays_readable() {
        let dir = TempDir::new().unwrap();
        {
            let (mut journal, _) = Journal::open(dir.path(), "finbot.events", false).unwrap();
            journal.append(&append_op(1)).unwrap();

            let big = JournalOp::Append {
                offset: 2,
                event: Event::with_id(
                    "big",
                    "finbot.tx.created",
                    "finbot",
                    json!({"blob": "x".repeat(17 * 1024 * 1024)}),
                ),
            };
            assert!(matches!(
                journal.append(&big),
                Err(EventLogError::InvalidArgument(_))
            ));
            journal.append(&append_op(3)).unwrap();
        }

        let (_, ops) = Journal::open(dir.path(), "finbot.events", false).unwrap();
        assert_eq!(ops, vec![append_op(1), append_op(3)]);
    }

    #[test]
    fn test_rollback_removes_partial_frame() {
        let dir = TempDir::new().unwrap();
        {
            let (mut journal, _) = Journal::open(dir.path(), "finbot.events", false).unwrap();
            journal.append(&append_op(1)).unwrap();

            // Half a frame lands before the write fails
            let start = journal.file.metadata().unwrap().len();
            let record = encode(&append_op(2)).unwrap();
            journal.file.write_all(&record[..record.len() / 2]).unwrap();
            journal.rollback(start);
            assert!(!journal.poisoned);

            journal.append(&append_op(3)).unwrap();
        }

        let (_, ops) = Journal::open(dir.path(), "finbot.events", false).unwrap();
        assert_eq!(ops, vec![append_op(1), append_op(3)]);
    }

    #[test]
    fn test_discover_streams() {
        let dir = TempDir::new().unwrap();
        assert!(discover_streams(dir.path()).unwrap().is_empty());

        Journal::open(dir.path(), "mubot.events", false).unwrap();
        Journal::open(dir.path(), "finbot.events", false).unwrap();

        assert_eq!(
            discover_streams(dir.path()).unwrap(),
            vec!["finbot.events".to_string(), "mubot.events".to_string()]
        );
    }
}
