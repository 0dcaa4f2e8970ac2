//! Per-user `\Seen` state: one file per user (`<user>.seen`), holding
//! every mailbox that user has opened, keyed by internal mailbox
//! name. Each mailbox entry carries which UIDs are seen plus the two
//! timestamps IMAP's `STATUS`/`SELECT` responses need (`lastread`,
//! `lastchange`). Rewritten wholesale via temp+rename on every
//! read/unread toggle — it stays small even with many mailboxes,
//! since ranges compress long runs of seen UIDs to one pair.

use std::collections::BTreeMap;
use std::fs;
use std::io;
use std::path::{Path, PathBuf};

use crate::error::MailboxError;

const MAGIC: [u8; 4] = *b"SISN";

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct MailboxSeenState {
    ranges: Vec<(u32, u32)>,
    last_read: u32,
    last_change: u32,
    recent_uid: u32,
}

impl MailboxSeenState {
    pub fn is_seen(&self, uid: u32) -> bool {
        self.ranges.iter().any(|(lo, hi)| *lo <= uid && uid <= *hi)
    }

    pub fn last_read(&self) -> u32 {
        self.last_read
    }

    pub fn last_change(&self) -> u32 {
        self.last_change
    }

    pub fn recent_uid(&self) -> u32 {
        self.recent_uid
    }

    fn mark_seen(&mut self, uid: u32, now: u32) {
        let mut merged = false;
        for (lo, hi) in self.ranges.iter_mut() {
            if uid + 1 == *lo {
                *lo = uid;
                merged = true;
                break;
            }
            if *hi + 1 == uid {
                *hi = uid;
                merged = true;
                break;
            }
            if *lo <= uid && uid <= *hi {
                merged = true;
                break;
            }
        }
        if !merged {
            self.ranges.push((uid, uid));
        }
        self.ranges.sort_unstable();
        self.coalesce();
        self.last_read = now;
        self.last_change = now;
    }

    fn coalesce(&mut self) {
        let mut merged: Vec<(u32, u32)> = Vec::with_capacity(self.ranges.len());
        for (lo, hi) in self.ranges.drain(..) {
            match merged.last_mut() {
                Some((_, last_hi)) if lo <= last_hi.saturating_add(1) => {
                    *last_hi = (*last_hi).max(hi);
                }
                _ => merged.push((lo, hi)),
            }
        }
        self.ranges = merged;
    }
}

/// The whole per-user seen file: every mailbox that user has opened,
/// keyed by internal mailbox name.
#[derive(Debug, Clone, Default)]
pub struct SeenStore {
    path: PathBuf,
    mailboxes: BTreeMap<String, MailboxSeenState>,
}

impl SeenStore {
    pub fn create(path: impl AsRef<Path>) -> io::Result<Self> {
        let store = SeenStore {
            path: path.as_ref().to_path_buf(),
            mailboxes: BTreeMap::new(),
        };
        store.save()?;
        Ok(store)
    }

    pub fn open(path: impl AsRef<Path>) -> Result<Self, MailboxError> {
        let path = path.as_ref().to_path_buf();
        let raw = fs::read(&path)?;
        if raw.len() < 8 || raw[0..4] != MAGIC {
            return Err(malformed(&path));
        }
        let count = u32::from_be_bytes(raw[4..8].try_into().unwrap()) as usize;
        let mut pos = 8;
        let mut mailboxes = BTreeMap::new();
        for _ in 0..count {
            let name_len = *raw.get(pos).ok_or_else(|| malformed(&path))? as usize;
            pos += 1;
            let name_bytes = raw.get(pos..pos + name_len).ok_or_else(|| malformed(&path))?;
            let name = String::from_utf8_lossy(name_bytes).into_owned();
            pos += name_len;

            let header = raw.get(pos..pos + 12).ok_or_else(|| malformed(&path))?;
            let last_read = u32::from_be_bytes(header[0..4].try_into().unwrap());
            let last_change = u32::from_be_bytes(header[4..8].try_into().unwrap());
            let recent_uid = u32::from_be_bytes(header[8..12].try_into().unwrap());
            pos += 12;

            let range_count = u32::from_be_bytes(
                raw.get(pos..pos + 4).ok_or_else(|| malformed(&path))?.try_into().unwrap(),
            ) as usize;
            pos += 4;
            let mut ranges = Vec::with_capacity(range_count);
            for _ in 0..range_count {
                let chunk = raw.get(pos..pos + 8).ok_or_else(|| malformed(&path))?;
                let lo = u32::from_be_bytes(chunk[0..4].try_into().unwrap());
                let hi = u32::from_be_bytes(chunk[4..8].try_into().unwrap());
                ranges.push((lo, hi));
                pos += 8;
            }

            mailboxes.insert(
                name,
                MailboxSeenState {
                    ranges,
                    last_read,
                    last_change,
                    recent_uid,
                },
            );
        }

        Ok(SeenStore { path, mailboxes })
    }

    pub fn mailbox(&self, internal_name: &str) -> MailboxSeenState {
        self.mailboxes.get(internal_name).cloned().unwrap_or_default()
    }

    pub fn mark_seen(&mut self, internal_name: &str, uid: u32, now: u32) -> io::Result<()> {
        self.mailboxes
            .entry(internal_name.to_string())
            .or_default()
            .mark_seen(uid, now);
        self.save()
    }

    pub fn note_delivered(&mut self, internal_name: &str, uid: u32) -> io::Result<()> {
        let entry = self.mailboxes.entry(internal_name.to_string()).or_default();
        entry.recent_uid = entry.recent_uid.max(uid);
        self.save()
    }

    /// Drops all state for a mailbox, called when it is deleted.
    pub fn forget(&mut self, internal_name: &str) -> io::Result<()> {
        self.mailboxes.remove(internal_name);
        self.save()
    }

    pub fn save(&self) -> io::Result<()> {
        let mut buf = Vec::new();
        buf.extend_from_slice(&MAGIC);
        buf.extend_from_slice(&(self.mailboxes.len() as u32).to_be_bytes());
        for (name, state) in &self.mailboxes {
            buf.push(name.len().min(255) as u8);
            buf.extend_from_slice(&name.as_bytes()[..name.len().min(255)]);
            buf.extend_from_slice(&state.last_read.to_be_bytes());
            buf.extend_from_slice(&state.last_change.to_be_bytes());
            buf.extend_from_slice(&state.recent_uid.to_be_bytes());
            buf.extend_from_slice(&(state.ranges.len() as u32).to_be_bytes());
            for (lo, hi) in &state.ranges {
                buf.extend_from_slice(&lo.to_be_bytes());
                buf.extend_from_slice(&hi.to_be_bytes());
            }
        }

        let tmp = self.path.with_extension("tmp");
        fs::write(&tmp, &buf)?;
        fs::rename(&tmp, &self.path)
    }
}

fn malformed(path: &Path) -> MailboxError {
    MailboxError::MailboxBadFormat(format!("seen file {} is corrupt", path.display()))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn mark_seen_and_reload_roundtrips() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("alice.seen");

        let mut store = SeenStore::create(&path).unwrap();
        store.mark_seen("user.alice", 3, 1_000).unwrap();
        store.mark_seen("user.alice", 4, 1_001).unwrap();
        store.mark_seen("user.alice.Drafts", 7, 1_002).unwrap();

        assert!(store.mailbox("user.alice").is_seen(3));
        assert!(store.mailbox("user.alice").is_seen(4));
        assert!(!store.mailbox("user.alice").is_seen(5));
        assert!(store.mailbox("user.alice.Drafts").is_seen(7));
        assert!(!store.mailbox("user.alice.Drafts").is_seen(3));

        let reloaded = SeenStore::open(&path).unwrap();
        assert!(reloaded.mailbox("user.alice").is_seen(4));
        assert_eq!(reloaded.mailbox("user.alice").last_change(), 1_001);
    }

    #[test]
    fn adjacent_marks_coalesce_into_one_range() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("alice.seen");
        let mut store = SeenStore::create(&path).unwrap();

        store.mark_seen("user.alice", 1, 1).unwrap();
        store.mark_seen("user.alice", 2, 2).unwrap();
        store.mark_seen("user.alice", 3, 3).unwrap();

        assert_eq!(store.mailbox("user.alice").ranges, vec![(1, 3)]);
    }

    #[test]
    fn note_delivered_tracks_recent_without_marking_seen() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("alice.seen");
        let mut store = SeenStore::create(&path).unwrap();

        store.note_delivered("user.alice", 9).unwrap();
        assert_eq!(store.mailbox("user.alice").recent_uid(), 9);
        assert!(!store.mailbox("user.alice").is_seen(9));
    }

    #[test]
    fn forget_drops_mailbox_state() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("alice.seen");
        let mut store = SeenStore::create(&path).unwrap();
        store.mark_seen("user.alice", 1, 1).unwrap();
        store.forget("user.alice").unwrap();
        assert_eq!(store.mailbox("user.alice"), MailboxSeenState::default());
    }
}
