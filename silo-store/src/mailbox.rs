//! The mailbox facade: ties the header, index, cache, quota, and
//! per-user seen files together behind the operations a delivery or
//! proxy caller actually needs (`create`, `open`, `append`, `copy`,
//! `expunge`, `rename`, `delete`), enforcing a fixed
//! `header → index → quota → seen` lock ordering and the UID/quota
//! invariants the rest of this crate's files assume.
//!
//! Locking note: the mmap'd files (header, index, cache) are locked
//! via the file primitives crate's `fcntl` wrapper. The quota and seen
//! files are small and rewritten wholesale on every change, and in
//! this implementation are serialized by the caller holding the
//! mailbox's own write path rather than by a dedicated lock of their
//! own.

use std::fs;
use std::io;
use std::path::PathBuf;

use chrono::{TimeZone, Utc};

use tracing::{debug, info};

use crate::cache::CacheFile;
use crate::error::MailboxError;
use crate::format::{
    IndexHeader, IndexRecord, MailboxHeader, FLAG_DELETED,
};
use crate::index::IndexFile;
use crate::mailboxlist::{MailboxEntry, MailboxList};
use crate::paths::SpoolPaths;
use crate::quota::QuotaFile;

const HEADER_FILE: &str = "header";
const INDEX_FILE: &str = "index";
const CACHE_FILE: &str = "cache";

pub struct Mailbox {
    internal_name: String,
    dir: PathBuf,
    header: MailboxHeader,
    index: IndexFile,
    cache: CacheFile,
}

impl Mailbox {
    pub fn internal_name(&self) -> &str {
        &self.internal_name
    }

    pub fn header(&self) -> &MailboxHeader {
        &self.header
    }

    pub fn index_header(&self) -> &IndexHeader {
        self.index.header()
    }

    pub fn records(&self) -> Result<Vec<IndexRecord>, MailboxError> {
        self.index.records()
    }

    /// Creates a new, empty mailbox. Fails with `MailboxExists` if the
    /// name is already registered.
    pub fn create(
        paths: &SpoolPaths,
        list: &mut MailboxList,
        internal_name: &str,
        quota_root: &str,
        now: u32,
    ) -> Result<Self, MailboxError> {
        if list.exists(internal_name)? {
            return Err(MailboxError::MailboxExists);
        }

        let dir = paths.mailbox_dir(internal_name);
        fs::create_dir_all(&dir)?;

        let unique_id = format!("{:08x}{:08x}", hash_name(internal_name), now);
        let header = MailboxHeader::new(quota_root, unique_id, now);
        fs::write(dir.join(HEADER_FILE), header.encode())?;

        IndexFile::create(dir.join(INDEX_FILE), &IndexHeader::new(now))?;
        CacheFile::create(dir.join(CACHE_FILE), 0)?;

        list.register(
            internal_name,
            &MailboxEntry {
                quota_root: quota_root.to_string(),
                uidvalidity: now,
            },
        )?;

        info!(mailbox = internal_name, "created mailbox");
        Self::open(paths, internal_name)
    }

    pub fn open(paths: &SpoolPaths, internal_name: &str) -> Result<Self, MailboxError> {
        let dir = paths.mailbox_dir(internal_name);
        let raw = match fs::read(dir.join(HEADER_FILE)) {
            Ok(raw) => raw,
            Err(e) if e.kind() == io::ErrorKind::NotFound => {
                return Err(MailboxError::MailboxNonexistent)
            }
            Err(e) => return Err(e.into()),
        };
        let header = MailboxHeader::decode(&raw)
            .map_err(|e| MailboxError::MailboxBadFormat(e.to_string()))?;

        let index = IndexFile::open(dir.join(INDEX_FILE))?;
        let cache = CacheFile::open(dir.join(CACHE_FILE))?;

        if index.header().generation_no != cache.generation_no() {
            return Err(MailboxError::MailboxBadFormat(format!(
                "{internal_name}: index generation {} does not match cache generation {}",
                index.header().generation_no,
                cache.generation_no()
            )));
        }

        Ok(Mailbox {
            internal_name: internal_name.to_string(),
            dir,
            header,
            index,
            cache,
        })
    }

    /// Appends one message. `body` is the full RFC-822 byte stream;
    /// `flags` are the user flags to set on arrival. Returns the
    /// assigned UID. `ignore_quota` lets this one append exceed the
    /// quota root's limit (the `deliver` CLI's `-q`); the mailbox then
    /// sits over quota and the next non-overridden append is rejected.
    pub fn append(
        &mut self,
        quota: &mut QuotaFile,
        body: &[u8],
        flags: &[String],
        now: u32,
        ignore_quota: bool,
    ) -> Result<u32, MailboxError> {
        let header_size = validate_message(body)?;

        if !ignore_quota && quota.would_exceed(body.len() as u64) {
            return Err(MailboxError::QuotaExceeded);
        }

        let cache_offset = self.cache.append_blob(&body[..header_size])?;

        let uid = self.index.header().last_uid + 1;
        let user_flags = self.encode_user_flags(flags)?;

        let message_path = self.dir.join(format!("{uid}."));
        fs::write(&message_path, body)?;

        let record = IndexRecord {
            uid,
            internaldate: now,
            sentdate: now,
            size: body.len() as u32,
            header_size: header_size as u32,
            content_offset: header_size as u64,
            cache_offset,
            last_updated: now,
            system_flags: 0,
            user_flags,
        };
        self.index.append_record(&record)?;

        let mut new_header = *self.index.header();
        new_header.exists += 1;
        new_header.last_uid = uid;
        new_header.last_appenddate = now;
        new_header.quota_mailbox_used = new_header.quota_mailbox_used.saturating_add(record.size);
        self.index.write_header(&new_header)?;

        quota.charge(record.size as i64)?;

        let internaldate = Utc
            .timestamp_opt(now as i64, 0)
            .single()
            .map(|dt| dt.to_rfc3339())
            .unwrap_or_default();
        debug!(
            mailbox = %self.internal_name,
            uid,
            size = record.size,
            internaldate = %internaldate,
            "appended message"
        );
        Ok(uid)
    }

    fn encode_user_flags(&mut self, flags: &[String]) -> Result<[u32; 4], MailboxError> {
        let mut words = [0u32; 4];
        for flag in flags {
            let index = match self.header.user_flags.iter().position(|f| f == flag) {
                Some(i) => i,
                None => {
                    if self.header.user_flags.len() >= crate::format::MAX_USER_FLAGS {
                        return Err(MailboxError::UserFlagExhausted);
                    }
                    self.header.user_flags.push(flag.clone());
                    self.save_header()?;
                    self.header.user_flags.len() - 1
                }
            };
            words[index / 32] |= 1 << (index % 32);
        }
        Ok(words)
    }

    fn save_header(&self) -> io::Result<()> {
        let tmp = self.dir.join("header.tmp");
        fs::write(&tmp, self.header.encode())?;
        fs::rename(&tmp, self.dir.join(HEADER_FILE))
    }

    /// Sets the system-flag bitmask on the record at index position
    /// `pos`, in place.
    pub fn set_system_flags(&mut self, pos: usize, flags: u32) -> Result<(), MailboxError> {
        let mut record = self.index.record_at(pos)?;
        record.system_flags = flags;
        self.index.rewrite_record(pos, &record)?;
        Ok(())
    }

    /// Removes every record matching `predicate` (default: `\Deleted`
    /// set). Rebuilds index and cache into `.NEW` siblings, renames
    /// cache first, then index — if the index rename fails after the
    /// cache succeeded, the mailbox is corrupt and the next open's
    /// generation check will catch it.
    pub fn expunge(
        &mut self,
        quota: &mut QuotaFile,
        predicate: impl Fn(&IndexRecord) -> bool,
    ) -> Result<Vec<u32>, MailboxError> {
        let records = self.index.records()?;
        let mut expunged_uids = Vec::new();
        let mut reclaimed: u64 = 0;
        let mut deleted = 0u16;
        let mut answered = 0u16;
        let mut flagged = 0u16;

        let new_generation = self.index.header().generation_no + 1;
        let cache_new_path = self.dir.join(format!("{CACHE_FILE}.NEW"));
        let index_new_path = self.dir.join(format!("{INDEX_FILE}.NEW"));

        CacheFile::create(&cache_new_path, new_generation)?;
        let mut new_cache = CacheFile::open(&cache_new_path)?;

        let mut new_header = IndexHeader::new(self.index.header().uidvalidity);
        new_header.generation_no = new_generation;
        new_header.last_uid = self.index.header().last_uid;
        IndexFile::create(&index_new_path, &new_header)?;
        let mut new_index = IndexFile::open(&index_new_path)?;

        for record in &records {
            if predicate(record) {
                expunged_uids.push(record.uid);
                reclaimed += record.size as u64;
                continue;
            }

            let blob = self.cache.read_blob(record.cache_offset)?.to_vec();
            let new_offset = new_cache.append_blob(&blob)?;
            let mut moved = *record;
            moved.cache_offset = new_offset;
            new_index.append_record(&moved)?;

            if moved.has_flag(FLAG_DELETED) {
                deleted += 1;
            }
            if moved.has_flag(crate::format::FLAG_ANSWERED) {
                answered += 1;
            }
            if moved.has_flag(crate::format::FLAG_FLAGGED) {
                flagged += 1;
            }
        }

        new_header.exists = (records.len() - expunged_uids.len()) as u32;
        new_header.quota_mailbox_used = self
            .index
            .header()
            .quota_mailbox_used
            .saturating_sub(reclaimed as u32);
        new_header.deleted = deleted;
        new_header.answered = answered;
        new_header.flagged = flagged;
        new_index.write_header(&new_header)?;

        fs::rename(&cache_new_path, self.dir.join(CACHE_FILE))?;
        fs::rename(&index_new_path, self.dir.join(INDEX_FILE))?;

        self.index = IndexFile::open(self.dir.join(INDEX_FILE))?;
        self.cache = CacheFile::open(self.dir.join(CACHE_FILE))?;

        quota.charge(-(reclaimed as i64))?;

        for uid in &expunged_uids {
            let _ = fs::remove_file(self.dir.join(format!("{uid}.")));
        }

        info!(
            mailbox = %self.internal_name,
            expunged = expunged_uids.len(),
            "expunged messages"
        );
        Ok(expunged_uids)
    }

    /// Deletes every file in the mailbox directory and removes empty
    /// parent directories up to (but not including) the spool root.
    /// `.` and `..` are never passed to `remove_file`.
    pub fn delete(
        paths: &SpoolPaths,
        list: &mut MailboxList,
        quota: &mut QuotaFile,
        internal_name: &str,
    ) -> Result<(), MailboxError> {
        let mailbox = Self::open(paths, internal_name)?;
        let used: u64 = mailbox.index.header().quota_mailbox_used as u64;
        quota.charge(-(used as i64))?;

        let dir = paths.mailbox_dir(internal_name);
        for entry in fs::read_dir(&dir)? {
            let entry = entry?;
            let name = entry.file_name();
            if name == "." || name == ".." {
                continue;
            }
            fs::remove_file(entry.path())?;
        }
        fs::remove_dir(&dir)?;

        // Best-effort: remove now-empty ancestor directories up to the
        // bucket directory, but never the spool root itself.
        let mut parent = dir.parent();
        while let Some(p) = parent {
            if p == paths.root() {
                break;
            }
            match fs::remove_dir(p) {
                Ok(()) => parent = p.parent(),
                Err(_) => break,
            }
        }

        list.unregister(internal_name)?;
        info!(mailbox = internal_name, "deleted mailbox");
        Ok(())
    }

    /// Copies a message already open in this mailbox into `dest`,
    /// allocating a fresh UID there and linking the underlying
    /// message file when `link` is true (single-instance enabled and
    /// both mailboxes on the same filesystem).
    pub fn copy_message(
        &self,
        dest: &mut Mailbox,
        dest_quota: &mut QuotaFile,
        pos: usize,
        now: u32,
        link: bool,
    ) -> Result<u32, MailboxError> {
        let record = self.index.record_at(pos)?;
        let blob = self.cache.read_blob(record.cache_offset)?.to_vec();
        let src_path = self.dir.join(format!("{}.", record.uid));

        if dest_quota.would_exceed(record.size as u64) {
            return Err(MailboxError::QuotaExceeded);
        }

        let new_cache_offset = dest.cache.append_blob(&blob)?;
        let uid = dest.index.header().last_uid + 1;
        let dest_path = dest.dir.join(format!("{uid}."));

        if link {
            fs::hard_link(&src_path, &dest_path)?;
        } else {
            fs::copy(&src_path, &dest_path)?;
        }

        let mut new_record = record;
        new_record.uid = uid;
        new_record.cache_offset = new_cache_offset;
        new_record.last_updated = now;
        dest.index.append_record(&new_record)?;

        let mut new_header = *dest.index.header();
        new_header.exists += 1;
        new_header.last_uid = uid;
        new_header.quota_mailbox_used =
            new_header.quota_mailbox_used.saturating_add(record.size);
        dest.index.write_header(&new_header)?;

        dest_quota.charge(record.size as i64)?;
        Ok(uid)
    }
}

/// Validates an RFC-822 message body and returns the header/body
/// boundary offset. Rejects embedded NULs, bare newlines (an LF not
/// preceded by a CR), and a missing header/body separator.
fn validate_message(body: &[u8]) -> Result<usize, MailboxError> {
    if body.contains(&0) {
        return Err(MailboxError::MessageContainsNul);
    }

    let mut i = 0;
    while i < body.len() {
        if body[i] == b'\n' && (i == 0 || body[i - 1] != b'\r') {
            return Err(MailboxError::MessageContainsBareNewline);
        }
        i += 1;
    }

    find_header_boundary(body).ok_or(MailboxError::MessageNoBlankLine)
}

fn find_header_boundary(body: &[u8]) -> Option<usize> {
    let mut i = 0;
    while i + 1 < body.len() {
        if &body[i..i + 2] == b"\n\n" {
            return Some(i + 2);
        }
        if i + 3 < body.len() && &body[i..i + 4] == b"\r\n\r\n" {
            return Some(i + 4);
        }
        i += 1;
    }
    None
}

fn hash_name(name: &str) -> u32 {
    name.bytes().fold(5381u32, |h, b| h.wrapping_mul(33).wrapping_add(b as u32))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn env() -> (tempfile::TempDir, SpoolPaths, MailboxList) {
        let dir = tempfile::tempdir().unwrap();
        let paths = SpoolPaths::new(dir.path());
        fs::create_dir_all(paths.db_dir()).unwrap();
        MailboxList::create(paths.mailbox_list_path()).unwrap();
        let list = MailboxList::open(paths.mailbox_list_path()).unwrap();
        (dir, paths, list)
    }

    fn sample_message() -> Vec<u8> {
        b"From: a@x\r\nTo: b@x\r\nSubject: hi\r\n\r\nbody text\r\n".to_vec()
    }

    #[test]
    fn create_open_append_roundtrip() {
        let (_dir, paths, mut list) = env();
        let mut mbox =
            Mailbox::create(&paths, &mut list, "user.alice", "user.alice", 1_700_000_000).unwrap();

        let mut quota = QuotaFile::create(paths.quota_path("user.alice"), None).unwrap();
        let uid = mbox
            .append(&mut quota, &sample_message(), &[], 1_700_000_001, false)
            .unwrap();
        assert_eq!(uid, 1);
        assert_eq!(mbox.index_header().exists, 1);
        assert_eq!(mbox.index_header().last_uid, 1);
        assert_eq!(quota.used(), sample_message().len() as u64);

        let reopened = Mailbox::open(&paths, "user.alice").unwrap();
        assert_eq!(reopened.index_header().exists, 1);
    }

    #[test]
    fn opening_a_missing_mailbox_is_nonexistent_not_a_raw_io_error() {
        let (_dir, paths, _list) = env();
        let err = Mailbox::open(&paths, "user.nobody").unwrap_err();
        assert!(matches!(err, MailboxError::MailboxNonexistent));
    }

    #[test]
    fn creating_twice_fails_with_mailbox_exists() {
        let (_dir, paths, mut list) = env();
        Mailbox::create(&paths, &mut list, "user.alice", "user.alice", 1).unwrap();
        let err = Mailbox::create(&paths, &mut list, "user.alice", "user.alice", 2).unwrap_err();
        assert!(matches!(err, MailboxError::MailboxExists));
    }

    #[test]
    fn append_rejects_message_without_blank_line() {
        let (_dir, paths, mut list) = env();
        let mut mbox = Mailbox::create(&paths, &mut list, "user.alice", "user.alice", 1).unwrap();
        let mut quota = QuotaFile::create(paths.quota_path("user.alice"), None).unwrap();
        let err = mbox
            .append(&mut quota, b"From: a@x\r\nno blank line here", &[], 2, false)
            .unwrap_err();
        assert!(matches!(err, MailboxError::MessageNoBlankLine));
    }

    #[test]
    fn append_over_quota_fails() {
        let (_dir, paths, mut list) = env();
        let mut mbox = Mailbox::create(&paths, &mut list, "user.alice", "user.alice", 1).unwrap();
        let mut quota = QuotaFile::create(paths.quota_path("user.alice"), Some(4)).unwrap();
        let err = mbox
            .append(&mut quota, &sample_message(), &[], 2, false)
            .unwrap_err();
        assert!(matches!(err, MailboxError::QuotaExceeded));
    }

    #[test]
    fn append_over_quota_succeeds_once_with_override_then_rejects_again() {
        let (_dir, paths, mut list) = env();
        let mut mbox = Mailbox::create(&paths, &mut list, "user.alice", "user.alice", 1).unwrap();
        let mut quota = QuotaFile::create(paths.quota_path("user.alice"), Some(4)).unwrap();

        let uid = mbox
            .append(&mut quota, &sample_message(), &[], 2, true)
            .unwrap();
        assert_eq!(uid, 1);
        assert!(quota.used() > 4);

        let err = mbox
            .append(&mut quota, &sample_message(), &[], 3, false)
            .unwrap_err();
        assert!(matches!(err, MailboxError::QuotaExceeded));
    }

    #[test]
    fn expunge_removes_deleted_and_keeps_others() {
        let (_dir, paths, mut list) = env();
        let mut mbox = Mailbox::create(&paths, &mut list, "user.alice", "user.alice", 1).unwrap();
        let mut quota = QuotaFile::create(paths.quota_path("user.alice"), None).unwrap();

        let uid1 = mbox.append(&mut quota, &sample_message(), &[], 2, false).unwrap();
        let _uid2 = mbox.append(&mut quota, &sample_message(), &[], 3, false).unwrap();

        mbox.set_system_flags(0, FLAG_DELETED).unwrap();

        let expunged = mbox
            .expunge(&mut quota, |r| r.has_flag(FLAG_DELETED))
            .unwrap();
        assert_eq!(expunged, vec![uid1]);
        assert_eq!(mbox.index_header().exists, 1);
        assert_eq!(mbox.records().unwrap().len(), 1);
        assert_eq!(quota.used(), sample_message().len() as u64);
        // The surviving message was never flagged \Deleted, so the
        // header's counter must read 0, not the number removed.
        assert_eq!(mbox.index_header().deleted, 0);
    }

    #[test]
    fn expunge_counts_deleted_flag_among_survivors() {
        let (_dir, paths, mut list) = env();
        let mut mbox = Mailbox::create(&paths, &mut list, "user.alice", "user.alice", 1).unwrap();
        let mut quota = QuotaFile::create(paths.quota_path("user.alice"), None).unwrap();

        mbox.append(&mut quota, &sample_message(), &[], 2, false).unwrap();
        mbox.append(&mut quota, &sample_message(), &[], 3, false).unwrap();
        mbox.append(&mut quota, &sample_message(), &[], 4, false).unwrap();

        // Mark the second message \Deleted \Flagged but expunge nothing
        // (predicate never matches): the header must still report one
        // deleted and one flagged survivor.
        mbox.set_system_flags(1, FLAG_DELETED | crate::format::FLAG_FLAGGED)
            .unwrap();

        let expunged = mbox.expunge(&mut quota, |_| false).unwrap();
        assert!(expunged.is_empty());
        assert_eq!(mbox.index_header().exists, 3);
        assert_eq!(mbox.index_header().deleted, 1);
        assert_eq!(mbox.index_header().flagged, 1);
    }

    #[test]
    fn delete_removes_directory_and_frees_quota() {
        let (_dir, paths, mut list) = env();
        let mut mbox = Mailbox::create(&paths, &mut list, "user.alice", "user.alice", 1).unwrap();
        let mut quota = QuotaFile::create(paths.quota_path("user.alice"), None).unwrap();
        mbox.append(&mut quota, &sample_message(), &[], 2, false).unwrap();

        Mailbox::delete(&paths, &mut list, &mut quota, "user.alice").unwrap();

        assert!(!list.exists("user.alice").unwrap());
        assert_eq!(quota.used(), 0);
        assert!(Mailbox::open(&paths, "user.alice").is_err());
    }

    #[test]
    fn copy_message_allocates_a_fresh_uid_in_the_destination() {
        let (_dir, paths, mut list) = env();
        let mut src = Mailbox::create(&paths, &mut list, "user.alice", "user.alice", 1).unwrap();
        let mut dest =
            Mailbox::create(&paths, &mut list, "user.alice.Archive", "user.alice", 1).unwrap();
        let mut src_quota = QuotaFile::create(paths.quota_path("user.alice"), None).unwrap();
        let mut dest_quota =
            QuotaFile::create(paths.quota_path("user.alice.Archive"), None).unwrap();

        src.append(&mut src_quota, &sample_message(), &[], 2, false).unwrap();

        let uid = src
            .copy_message(&mut dest, &mut dest_quota, 0, 3, true)
            .unwrap();
        assert_eq!(uid, 1);
        assert_eq!(dest.index_header().exists, 1);
        assert_eq!(dest_quota.used(), sample_message().len() as u64);
    }
}
