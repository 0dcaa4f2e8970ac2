//! Per-quota-root used/limit accounting. One file per quota root,
//! shared by every mailbox that names it in its header; writers take
//! the quota lock and read-modify-write, rewriting the whole file via
//! temp+rename (it is small and changes on every append/expunge).

use std::fs;
use std::io;
use std::path::{Path, PathBuf};

use crate::error::MailboxError;

const MAGIC: [u8; 4] = *b"SIQF";

#[derive(Debug, Clone)]
pub struct QuotaFile {
    path: PathBuf,
    used: u64,
    limit: Option<u64>,
}

impl QuotaFile {
    pub fn create(path: impl AsRef<Path>, limit: Option<u64>) -> io::Result<Self> {
        let file = QuotaFile {
            path: path.as_ref().to_path_buf(),
            used: 0,
            limit,
        };
        file.save()?;
        Ok(file)
    }

    pub fn open(path: impl AsRef<Path>) -> Result<Self, MailboxError> {
        let path = path.as_ref().to_path_buf();
        let raw = fs::read(&path)?;
        if raw.len() < 13 || raw[0..4] != MAGIC {
            return Err(MailboxError::MailboxBadFormat(format!(
                "quota file {} is corrupt",
                path.display()
            )));
        }
        let used = u64::from_be_bytes(raw[4..12].try_into().unwrap());
        let has_limit = raw[12] != 0;
        let limit = if has_limit {
            if raw.len() < 21 {
                return Err(MailboxError::MailboxBadFormat(format!(
                    "quota file {} is corrupt",
                    path.display()
                )));
            }
            Some(u64::from_be_bytes(raw[13..21].try_into().unwrap()))
        } else {
            None
        };
        Ok(QuotaFile { path, used, limit })
    }

    pub fn used(&self) -> u64 {
        self.used
    }

    pub fn limit(&self) -> Option<u64> {
        self.limit
    }

    /// `true` if charging `additional` more bytes would exceed the
    /// configured limit. A root with no limit never refuses.
    pub fn would_exceed(&self, additional: u64) -> bool {
        match self.limit {
            Some(limit) => self.used.saturating_add(additional) > limit,
            None => false,
        }
    }

    pub fn charge(&mut self, delta: i64) -> io::Result<()> {
        self.used = if delta >= 0 {
            self.used.saturating_add(delta as u64)
        } else {
            self.used.saturating_sub((-delta) as u64)
        };
        self.save()
    }

    pub fn save(&self) -> io::Result<()> {
        let mut buf = Vec::with_capacity(21);
        buf.extend_from_slice(&MAGIC);
        buf.extend_from_slice(&self.used.to_be_bytes());
        match self.limit {
            Some(limit) => {
                buf.push(1);
                buf.extend_from_slice(&limit.to_be_bytes());
            }
            None => buf.push(0),
        }

        let tmp = self.path.with_extension("tmp");
        fs::write(&tmp, &buf)?;
        fs::rename(&tmp, &self.path)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn charge_and_reload_roundtrips() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("quota");

        let mut quota = QuotaFile::create(&path, Some(1000)).unwrap();
        quota.charge(400).unwrap();
        assert_eq!(quota.used(), 400);
        assert!(!quota.would_exceed(500));
        assert!(quota.would_exceed(700));

        let reloaded = QuotaFile::open(&path).unwrap();
        assert_eq!(reloaded.used(), 400);
        assert_eq!(reloaded.limit(), Some(1000));
    }

    #[test]
    fn unlimited_root_never_exceeds() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("quota");
        let quota = QuotaFile::create(&path, None).unwrap();
        assert!(!quota.would_exceed(u64::MAX / 2));
    }

    #[test]
    fn charge_does_not_underflow_on_over_decrement() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("quota");
        let mut quota = QuotaFile::create(&path, Some(1000)).unwrap();
        quota.charge(100).unwrap();
        quota.charge(-500).unwrap();
        assert_eq!(quota.used(), 0);
    }
}
