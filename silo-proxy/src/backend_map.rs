//! Mailbox-to-backend location cache: a skiplist-backed TTL cache in
//! front of the mupdate client. Shared by the proxy's pipe-vs-refer
//! decision and, via [`silo_discovery::LocationResolver`], by the
//! discovery daemon's own local-vs-proxy decision — both need the
//! same answer to "who owns this mailbox right now."

use std::sync::Mutex;
use std::time::{SystemTime, UNIX_EPOCH};

use silo_discovery::{LocationResolver, MailboxLocation as DiscoveryLocation};
use silo_skiplist::{Db, DbError};

use crate::mupdate::MailboxLocation;

const DEFAULT_TTL_SECS: u64 = 300;

pub fn now_unix() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs())
        .unwrap_or(0)
}

#[derive(Debug, Clone, PartialEq, Eq)]
struct CachedEntry {
    server: String,
    acl: String,
    cached_at: u64,
}

impl CachedEntry {
    fn encode(&self) -> Vec<u8> {
        let mut buf = Vec::with_capacity(self.server.len() + self.acl.len() + 12);
        buf.extend_from_slice(&self.cached_at.to_be_bytes());
        buf.extend_from_slice(&(self.server.len() as u32).to_be_bytes());
        buf.extend_from_slice(self.server.as_bytes());
        buf.extend_from_slice(self.acl.as_bytes());
        buf
    }

    fn decode(data: &[u8]) -> Option<Self> {
        if data.len() < 12 {
            return None;
        }
        let cached_at = u64::from_be_bytes(data[0..8].try_into().ok()?);
        let server_len = u32::from_be_bytes(data[8..12].try_into().ok()?) as usize;
        let server = String::from_utf8_lossy(data.get(12..12 + server_len)?).into_owned();
        let acl = String::from_utf8_lossy(data.get(12 + server_len..)?).into_owned();
        Some(CachedEntry {
            server,
            acl,
            cached_at,
        })
    }
}

pub struct BackendMap {
    db: Mutex<Db>,
    local_server: String,
    ttl_secs: u64,
}

impl BackendMap {
    pub fn create(path: impl AsRef<std::path::Path>) -> Result<(), DbError> {
        Db::create(path)?;
        Ok(())
    }

    pub fn open(path: impl AsRef<std::path::Path>, local_server: impl Into<String>) -> Result<Self, DbError> {
        Ok(BackendMap {
            db: Mutex::new(Db::open(path)?),
            local_server: local_server.into(),
            ttl_secs: DEFAULT_TTL_SECS,
        })
    }

    pub fn with_ttl(mut self, ttl_secs: u64) -> Self {
        self.ttl_secs = ttl_secs;
        self
    }

    /// Records a resolved `(mailbox, server, acl)` triple, learned
    /// either from a fresh `LFIND` or an unsolicited mupdate push.
    pub fn remember(&self, mailbox: &str, server: &str, acl: &str, now: u64) -> Result<(), DbError> {
        let entry = CachedEntry {
            server: server.to_string(),
            acl: acl.to_string(),
            cached_at: now,
        };
        let mut db = self.db.lock().unwrap();
        let mut txn = db.begin_write()?;
        txn.insert(mailbox.as_bytes(), &entry.encode())?;
        txn.commit()
    }

    pub fn forget(&self, mailbox: &str) -> Result<(), DbError> {
        let mut db = self.db.lock().unwrap();
        let mut txn = db.begin_write()?;
        txn.delete_if_present(mailbox.as_bytes())?;
        txn.commit()
    }

    /// Looks up a cached entry, returning `None` if absent or expired
    /// — a caller should then issue a fresh `LFIND` and `remember` the
    /// result.
    pub fn lookup(&self, mailbox: &str, now: u64) -> Result<Option<MailboxLocation>, DbError> {
        let raw = {
            let mut db = self.db.lock().unwrap();
            db.fetch(mailbox.as_bytes())?
        };
        let Some(raw) = raw else { return Ok(None) };
        let Some(entry) = CachedEntry::decode(&raw) else {
            return Ok(None);
        };
        if now.saturating_sub(entry.cached_at) > self.ttl_secs {
            return Ok(None);
        }
        Ok(Some(MailboxLocation {
            mailbox: mailbox.to_string(),
            server: entry.server,
            acl: entry.acl,
        }))
    }

    pub fn is_local(&self, server: &str) -> bool {
        server == self.local_server
    }
}

/// A cache miss or an expired entry reads as "local" here: the
/// resolver's job is only to short-circuit the *known-remote* case
/// for the discovery daemon and the proxy. An absent/stale entry
/// falls through to the caller's own existence check, which will
/// correctly say "not found" for a mailbox that truly isn't ours.
impl LocationResolver for BackendMap {
    fn locate(&self, internal_name: &str) -> DiscoveryLocation {
        match self.lookup(internal_name, now_unix()) {
            Ok(Some(entry)) if !self.is_local(&entry.server) => DiscoveryLocation::Remote(entry.server),
            _ => DiscoveryLocation::Local,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn temp_map(local_server: &str) -> (tempfile::TempDir, BackendMap) {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("backends.db");
        BackendMap::create(&path).unwrap();
        (dir, BackendMap::open(&path, local_server).unwrap())
    }

    #[test]
    fn remembered_entry_round_trips_until_expiry() {
        let (_dir, map) = temp_map("server1");
        map.remember("user.alice", "server2", "alice\tlrs\t", 1_000).unwrap();

        let found = map.lookup("user.alice", 1_100).unwrap().unwrap();
        assert_eq!(found.server, "server2");

        let map = map.with_ttl(50);
        assert_eq!(map.lookup("user.alice", 1_100).unwrap(), None);
    }

    #[test]
    fn locate_reports_remote_only_for_a_different_server() {
        let (_dir, map) = temp_map("server1");
        map.remember("user.bob", "server2", "", 1_000).unwrap();
        map.remember("user.alice", "server1", "", 1_000).unwrap();

        assert!(matches!(map.locate("user.bob"), DiscoveryLocation::Remote(s) if s == "server2"));
        assert!(matches!(map.locate("user.alice"), DiscoveryLocation::Local));
        assert!(matches!(map.locate("user.nobody"), DiscoveryLocation::Local));
    }

    #[test]
    fn forget_drops_the_cached_entry() {
        let (_dir, map) = temp_map("server1");
        map.remember("user.alice", "server2", "", 1_000).unwrap();
        map.forget("user.alice").unwrap();
        assert_eq!(map.lookup("user.alice", 1_000).unwrap(), None);
    }
}
