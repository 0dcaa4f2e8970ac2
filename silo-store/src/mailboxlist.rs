//! The mailbox list: a skiplist table keyed by internal mailbox name,
//! recording each mailbox's quota root and uidvalidity so the store
//! can answer "does this mailbox exist" and "what quota root does it
//! use" without opening its header file. The mailbox's own header is
//! still the source of truth for everything else; this is an index.

use silo_skiplist::{Db, DbError, Selector};

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MailboxEntry {
    pub quota_root: String,
    pub uidvalidity: u32,
}

impl MailboxEntry {
    fn encode(&self) -> Vec<u8> {
        let mut buf = Vec::with_capacity(self.quota_root.len() + 5);
        buf.extend_from_slice(&self.uidvalidity.to_be_bytes());
        buf.extend_from_slice(self.quota_root.as_bytes());
        buf
    }

    fn decode(data: &[u8]) -> Self {
        let uidvalidity = if data.len() >= 4 {
            u32::from_be_bytes(data[0..4].try_into().unwrap())
        } else {
            0
        };
        let quota_root = String::from_utf8_lossy(data.get(4..).unwrap_or(&[])).into_owned();
        MailboxEntry {
            quota_root,
            uidvalidity,
        }
    }
}

pub struct MailboxList {
    db: Db,
}

impl MailboxList {
    pub fn create(path: impl AsRef<std::path::Path>) -> Result<(), DbError> {
        Db::create(path)?;
        Ok(())
    }

    pub fn open(path: impl AsRef<std::path::Path>) -> Result<Self, DbError> {
        Ok(MailboxList { db: Db::open(path)? })
    }

    pub fn exists(&mut self, internal_name: &str) -> Result<bool, DbError> {
        Ok(self.db.fetch(internal_name.as_bytes())?.is_some())
    }

    pub fn lookup(&mut self, internal_name: &str) -> Result<Option<MailboxEntry>, DbError> {
        Ok(self
            .db
            .fetch(internal_name.as_bytes())?
            .map(|data| MailboxEntry::decode(&data)))
    }

    pub fn register(&mut self, internal_name: &str, entry: &MailboxEntry) -> Result<(), DbError> {
        let mut txn = self.db.begin_write()?;
        txn.insert(internal_name.as_bytes(), &entry.encode())?;
        txn.commit()
    }

    pub fn unregister(&mut self, internal_name: &str) -> Result<(), DbError> {
        let mut txn = self.db.begin_write()?;
        txn.delete_if_present(internal_name.as_bytes())?;
        txn.commit()
    }

    pub fn rename(&mut self, old_name: &str, new_name: &str) -> Result<(), DbError> {
        let entry = self.lookup(old_name)?;
        let mut txn = self.db.begin_write()?;
        txn.delete_if_present(old_name.as_bytes())?;
        if let Some(entry) = entry {
            txn.insert(new_name.as_bytes(), &entry.encode())?;
        }
        txn.commit()
    }

    pub fn list_prefix(&mut self, prefix: &str) -> Result<Vec<String>, DbError> {
        let mut names = Vec::new();
        self.db.foreach(Selector::Prefix(prefix.as_bytes()), |k, _| {
            names.push(String::from_utf8_lossy(k).into_owned());
            true
        })?;
        Ok(names)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn temp_list() -> (tempfile::TempDir, MailboxList) {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("mailboxes.db");
        MailboxList::create(&path).unwrap();
        (dir, MailboxList::open(&path).unwrap())
    }

    #[test]
    fn register_lookup_and_unregister() {
        let (_dir, mut list) = temp_list();
        let entry = MailboxEntry {
            quota_root: "user.alice".into(),
            uidvalidity: 5,
        };
        list.register("user.alice", &entry).unwrap();

        assert!(list.exists("user.alice").unwrap());
        assert_eq!(list.lookup("user.alice").unwrap(), Some(entry));

        list.unregister("user.alice").unwrap();
        assert!(!list.exists("user.alice").unwrap());
    }

    #[test]
    fn rename_moves_the_entry() {
        let (_dir, mut list) = temp_list();
        let entry = MailboxEntry {
            quota_root: "user.alice".into(),
            uidvalidity: 1,
        };
        list.register("user.alice.Drafts", &entry).unwrap();
        list.rename("user.alice.Drafts", "user.alice.Sent").unwrap();

        assert!(!list.exists("user.alice.Drafts").unwrap());
        assert_eq!(list.lookup("user.alice.Sent").unwrap(), Some(entry));
    }

    #[test]
    fn list_prefix_finds_every_child_mailbox() {
        let (_dir, mut list) = temp_list();
        for name in ["user.alice", "user.alice.Drafts", "user.alice.Sent", "user.bob"] {
            list.register(
                name,
                &MailboxEntry {
                    quota_root: "user.alice".into(),
                    uidvalidity: 1,
                },
            )
            .unwrap();
        }

        let mut names = list.list_prefix("user.alice").unwrap();
        names.sort();
        assert_eq!(
            names,
            vec!["user.alice", "user.alice.Drafts", "user.alice.Sent"]
        );
    }
}
