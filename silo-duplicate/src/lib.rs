//! Duplicate-delivery and vacation-reply suppression.
//!
//! Keyed by `(message-id, scope)`, where `scope` is either an absolute
//! mailbox name (plain delivery dedup) or `.{user}.sieve.{tag}`
//! (a Sieve-generated auxiliary record — forward trail, vacation
//! reply). Backed directly by [`silo_skiplist::Db`]; this crate only
//! owns the key/value encoding and the expiry policy.

use std::time::{SystemTime, UNIX_EPOCH};

use silo_skiplist::{Db, Selector};
use thiserror::Error;
use tracing::debug;

#[derive(Debug, Error)]
pub enum DuplicateError {
    #[error(transparent)]
    Db(#[from] silo_skiplist::DbError),
}

pub type Result<T> = std::result::Result<T, DuplicateError>;

pub struct DuplicateTable {
    db: Db,
}

/// Seconds since the Unix epoch, for callers that don't want to thread
/// their own clock through `check`/`mark`.
pub fn now_unix() -> u32 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs() as u32)
        .unwrap_or(0)
}

fn encode_key(message_id: &str, scope: &str) -> Vec<u8> {
    let mut key = Vec::with_capacity(message_id.len() + scope.len() + 1);
    key.extend_from_slice(message_id.as_bytes());
    key.push(0);
    key.extend_from_slice(scope.as_bytes());
    key
}

fn decode_expiry(data: &[u8]) -> u32 {
    let mut buf = [0u8; 4];
    let n = data.len().min(4);
    buf[..n].copy_from_slice(&data[..n]);
    u32::from_be_bytes(buf)
}

impl DuplicateTable {
    pub fn create(path: impl AsRef<std::path::Path>) -> Result<()> {
        Db::create(path)?;
        Ok(())
    }

    pub fn open(path: impl AsRef<std::path::Path>) -> Result<Self> {
        Ok(Self { db: Db::open(path)? })
    }

    /// `true` iff an unexpired record for `(message_id, scope)` exists
    /// as of `now`.
    pub fn check(&mut self, message_id: &str, scope: &str, now: u32) -> Result<bool> {
        let key = encode_key(message_id, scope);
        match self.db.fetch(&key)? {
            Some(data) => Ok(decode_expiry(&data) > now),
            None => Ok(false),
        }
    }

    /// Record `(message_id, scope)` as delivered, expiring at `expiry`
    /// (an absolute unix-seconds timestamp). Overwrites any existing
    /// record for the same key.
    pub fn mark(&mut self, message_id: &str, scope: &str, expiry: u32) -> Result<()> {
        let key = encode_key(message_id, scope);
        let mut txn = self.db.begin_write()?;
        txn.insert(&key, &expiry.to_be_bytes())?;
        txn.commit()?;
        Ok(())
    }

    /// Remove every record whose expiry is `<= now`. Returns the
    /// number of records removed.
    pub fn prune(&mut self, now: u32) -> Result<usize> {
        let mut stale = Vec::new();
        self.db.foreach(
            Selector::Prefix(b""),
            |k, v| {
                if decode_expiry(v) <= now {
                    stale.push(k.to_vec());
                }
                true
            },
        )?;

        if stale.is_empty() {
            return Ok(0);
        }

        let mut txn = self.db.begin_write()?;
        for key in &stale {
            txn.delete(key)?;
        }
        txn.commit()?;
        debug!(removed = stale.len(), "pruned expired duplicate records");
        Ok(stale.len())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn temp_table() -> (tempfile::TempDir, DuplicateTable) {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("duplicate.db");
        DuplicateTable::create(&path).unwrap();
        let table = DuplicateTable::open(&path).unwrap();
        (dir, table)
    }

    #[test]
    fn unmarked_message_is_not_a_duplicate() {
        let (_dir, mut table) = temp_table();
        assert!(!table
            .check("<abc@example.com>", "user.alice", 1_000)
            .unwrap());
    }

    #[test]
    fn marked_message_is_a_duplicate_until_expiry() {
        let (_dir, mut table) = temp_table();
        table
            .mark("<abc@example.com>", "user.alice", 2_000)
            .unwrap();

        assert!(table
            .check("<abc@example.com>", "user.alice", 1_000)
            .unwrap());
        assert!(!table
            .check("<abc@example.com>", "user.alice", 2_000)
            .unwrap());
        assert!(!table
            .check("<abc@example.com>", "user.alice", 3_000)
            .unwrap());
    }

    #[test]
    fn scope_distinguishes_plain_delivery_from_sieve_records() {
        let (_dir, mut table) = temp_table();
        table
            .mark("<abc@example.com>", "user.alice", 5_000)
            .unwrap();

        assert!(table
            .check("<abc@example.com>", "user.alice", 1_000)
            .unwrap());
        assert!(!table
            .check("<abc@example.com>", ".alice.sieve.vacation", 1_000)
            .unwrap());
    }

    #[test]
    fn prune_removes_only_expired_records() {
        let (_dir, mut table) = temp_table();
        table.mark("<old@x>", "user.alice", 100).unwrap();
        table.mark("<fresh@x>", "user.alice", 10_000).unwrap();

        let removed = table.prune(5_000).unwrap();
        assert_eq!(removed, 1);
        assert!(!table.check("<old@x>", "user.alice", 0).unwrap());
        assert!(table.check("<fresh@x>", "user.alice", 0).unwrap());
    }
}
