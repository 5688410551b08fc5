//! Durable commit log
//!
//! One line per active transaction, rewritten as a whole on every flush:
//!
//! ```text
//! <transaction-id>\t<State>\t<participant>,<participant>,\r
//! ```
//!
//! A transaction's line carries its latest aggregate state. Once it reaches Done (or
//! Rollbacked) the line is written one last time and then disappears from the next
//! flush.

use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Mutex;

use super::state::CommitState;
use crate::error::{BedrockError, Result};
use crate::fsutil;
use crate::types::TxnId;

/// One committed-transaction record
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LogEntry {
    pub txn: TxnId,
    pub state: CommitState,
    pub participants: Vec<String>,
}

impl LogEntry {
    pub fn to_line(&self) -> String {
        let names: String = self
            .participants
            .iter()
            .map(|name| format!("{},", name))
            .collect();
        format!("{}\t{}\t{}\r", self.txn, self.state, names)
    }

    pub fn parse(line: &str) -> Result<Self> {
        let mut fields = line.split('\t');
        let (txn, state, names) = match (fields.next(), fields.next(), fields.next()) {
            (Some(txn), Some(state), Some(names)) => (txn, state, names),
            _ => {
                return Err(BedrockError::corrupt(format!(
                    "commit log line has too few fields: {:?}",
                    line
                )))
            }
        };
        Ok(Self {
            txn: txn.parse()?,
            state: state.parse()?,
            participants: names
                .split(',')
                .filter(|name| !name.is_empty())
                .map(str::to_string)
                .collect(),
        })
    }
}

/// Is `name` safe to embed in a log line?
pub fn valid_participant_name(name: &str) -> bool {
    !name.is_empty() && !name.contains([',', '\t', '\r', '\n'])
}

/// The commit log file
pub struct CommitLog {
    path: PathBuf,
    /// Serializes snapshot-and-write so an older snapshot never overwrites a newer one
    write_lock: Mutex<()>,
}

impl CommitLog {
    pub fn open(path: PathBuf) -> Result<Self> {
        if let Some(dir) = path.parent() {
            if !dir.as_os_str().is_empty() {
                fs::create_dir_all(dir)?;
            }
        }
        Ok(Self {
            path,
            write_lock: Mutex::new(()),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Read every entry. Malformed lines are logged and skipped.
    pub fn load(&self) -> Result<Vec<LogEntry>> {
        if !self.path.exists() {
            return Ok(Vec::new());
        }
        let text = fs::read_to_string(&self.path)?;
        let mut entries = Vec::new();
        for line in text.split(['\r', '\n']) {
            if line.trim().is_empty() {
                continue;
            }
            match LogEntry::parse(line) {
                Ok(entry) => entries.push(entry),
                Err(e) => log::warn!("Skipping malformed commit log line: {}", e),
            }
        }
        Ok(entries)
    }

    /// Take a snapshot and rewrite the file with it, atomically.
    pub fn flush_with<F>(&self, snapshot: F) -> Result<()>
    where
        F: FnOnce() -> Vec<LogEntry>,
    {
        let _guard = self.write_lock.lock().unwrap();
        let entries = snapshot();
        let text: String = entries.iter().map(LogEntry::to_line).collect();
        fsutil::write_atomic(&self.path, text.as_bytes())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    fn entry(state: CommitState) -> LogEntry {
        LogEntry {
            txn: TxnId::from_u128(42),
            state,
            participants: vec!["flights".into(), "cars".into()],
        }
    }

    #[test]
    fn test_line_format() {
        assert_eq!(
            entry(CommitState::Done).to_line(),
            "0000000000000000000000000000002a\tDone\tflights,cars,\r"
        );
    }

    #[test]
    fn test_parse_line() {
        let parsed = LogEntry::parse("0000000000000000000000000000002a\tPrepared\tflights,cars,").unwrap();
        assert_eq!(parsed, entry(CommitState::Prepared));
        assert!(LogEntry::parse("garbage").is_err());
    }

    #[test]
    fn test_flush_rewrites_file() {
        let dir = tempdir().unwrap();
        let log = CommitLog::open(dir.path().join("commit.log")).unwrap();
        log.flush_with(|| vec![entry(CommitState::Committed)]).unwrap();
        log.flush_with(|| vec![entry(CommitState::Prepared)]).unwrap();

        let entries = log.load().unwrap();
        assert_eq!(entries, vec![entry(CommitState::Prepared)]);

        log.flush_with(Vec::new).unwrap();
        assert!(log.load().unwrap().is_empty());
    }

    #[test]
    fn test_load_skips_bad_lines() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("commit.log");
        let good = entry(CommitState::Committed).to_line();
        fs::write(&path, format!("nonsense\r{}", good)).unwrap();

        let log = CommitLog::open(path).unwrap();
        assert_eq!(log.load().unwrap(), vec![entry(CommitState::Committed)]);
    }

    #[test]
    fn test_participant_names() {
        assert!(valid_participant_name("rm-flights"));
        assert!(!valid_participant_name("a,b"));
        assert!(!valid_participant_name(""));
    }
}
