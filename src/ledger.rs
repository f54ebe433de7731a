//! File-backed retry ledger: the last ten verdicts observed per check.

use std::fs;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::constants::LEDGER_CAPACITY;
use crate::error::ApolloError;
use crate::status::Verdict;

/// One recorded check outcome.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct LedgerEntry {
    /// Wall-clock seconds when the verdict was recorded.
    pub timestamp: i64,
    /// The verdict that was recorded.
    pub verdict: Verdict,
}

/// Bounded history of verdicts for one check, newest first.
#[derive(Debug, Default, Clone, Serialize, Deserialize)]
pub struct Ledger {
    entries: Vec<LedgerEntry>,
}

impl Ledger {
    /// Reads the ledger for `check_id` from `dir`. A missing file is an
    /// empty ledger; anything unreadable beyond that is an error.
    pub fn load(dir: &Path, check_id: &str) -> Result<Self, ApolloError> {
        let path = Self::path(dir, check_id);
        let content = match fs::read_to_string(&path) {
            Ok(content) => content,
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => {
                return Ok(Self::default());
            }
            Err(err) => {
                return Err(ApolloError::LedgerIoError {
                    check: check_id.to_string(),
                    source: err,
                });
            }
        };

        serde_json::from_str(&content).map_err(|err| ApolloError::LedgerFormatError {
            check: check_id.to_string(),
            source: err,
        })
    }

    /// Prepends a verdict, truncating the history to its capacity.
    pub fn record(&mut self, verdict: Verdict, timestamp: i64) {
        self.entries.insert(0, LedgerEntry { timestamp, verdict });
        self.entries.truncate(LEDGER_CAPACITY);
    }

    /// Atomically replaces the on-disk ledger: the new contents are written
    /// to a temp file in the same directory and renamed over the old one.
    pub fn save(&self, dir: &Path, check_id: &str) -> Result<(), ApolloError> {
        let io_err = |source| ApolloError::LedgerIoError {
            check: check_id.to_string(),
            source,
        };

        fs::create_dir_all(dir).map_err(io_err)?;
        let body = serde_json::to_string(self).map_err(|err| {
            ApolloError::LedgerFormatError {
                check: check_id.to_string(),
                source: err,
            }
        })?;

        let tmp = dir.join(format!(".{check_id}.tmp"));
        fs::write(&tmp, body).map_err(io_err)?;
        fs::rename(&tmp, Self::path(dir, check_id)).map_err(io_err)?;
        debug!("Ledger for '{check_id}' updated ({} entries)", self.entries.len());
        Ok(())
    }

    /// The recorded entries, newest first.
    pub fn entries(&self) -> &[LedgerEntry] {
        &self.entries
    }

    /// True when the `retries` most recent entries exist and are all BAD.
    /// A shorter history means the check is still within its retry budget.
    pub fn hard_failing(&self, retries: u32) -> bool {
        let retries = retries.max(1) as usize;
        self.entries.len() >= retries
            && self.entries[..retries]
                .iter()
                .all(|entry| entry.verdict == Verdict::Bad)
    }

    fn path(dir: &Path, check_id: &str) -> PathBuf {
        dir.join(check_id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn missing_file_reads_as_empty_ledger() {
        let dir = tempdir().unwrap();
        let ledger = Ledger::load(dir.path(), "httpok").unwrap();
        assert!(ledger.entries().is_empty());
    }

    #[test]
    fn entries_are_newest_first_and_capped() {
        let mut ledger = Ledger::default();
        for i in 0..14 {
            ledger.record(Verdict::Ok, i);
        }

        assert_eq!(ledger.entries().len(), LEDGER_CAPACITY);
        assert_eq!(ledger.entries()[0].timestamp, 13);
        assert_eq!(ledger.entries()[LEDGER_CAPACITY - 1].timestamp, 4);
    }

    #[test]
    fn save_and_load_round_trip() {
        let dir = tempdir().unwrap();
        let mut ledger = Ledger::default();
        ledger.record(Verdict::Bad, 100);
        ledger.record(Verdict::Warn, 101);
        ledger.save(dir.path(), "httpok").unwrap();

        let loaded = Ledger::load(dir.path(), "httpok").unwrap();
        assert_eq!(loaded.entries(), ledger.entries());
        assert_eq!(loaded.entries()[0].verdict, Verdict::Warn);
    }

    #[test]
    fn save_replaces_previous_contents() {
        let dir = tempdir().unwrap();
        let mut ledger = Ledger::default();
        ledger.record(Verdict::Bad, 100);
        ledger.save(dir.path(), "httpok").unwrap();

        ledger.record(Verdict::Ok, 101);
        ledger.save(dir.path(), "httpok").unwrap();

        let loaded = Ledger::load(dir.path(), "httpok").unwrap();
        assert_eq!(loaded.entries().len(), 2);
        assert_eq!(loaded.entries()[0].verdict, Verdict::Ok);
        assert!(!dir.path().join(".httpok.tmp").exists());
    }

    #[test]
    fn hard_failing_requires_a_full_run_of_bad() {
        let mut ledger = Ledger::default();
        ledger.record(Verdict::Bad, 1);
        assert!(ledger.hard_failing(1));
        assert!(!ledger.hard_failing(3));

        ledger.record(Verdict::Bad, 2);
        ledger.record(Verdict::Bad, 3);
        assert!(ledger.hard_failing(3));

        ledger.record(Verdict::Ok, 4);
        assert!(!ledger.hard_failing(3));
        assert!(!ledger.hard_failing(1));
    }

    #[test]
    fn malformed_ledger_surfaces_as_format_error() {
        let dir = tempdir().unwrap();
        std::fs::write(dir.path().join("httpok"), "not json").unwrap();
        assert!(matches!(
            Ledger::load(dir.path(), "httpok"),
            Err(ApolloError::LedgerFormatError { .. })
        ));
    }
}
