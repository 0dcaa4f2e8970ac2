//! A crash-recoverable, ordered key/value store backed by a single
//! memory-mapped file: a probabilistic skiplist with an append-mostly
//! log, in-place forward-pointer patches, and checkpoint-via-rename
//! compaction. One [`Db`] instance corresponds to one on-disk table
//! (a mailbox list, a duplicate-delivery table, a subscription list).

mod db;
mod format;

pub use db::{Db, DbError, Result, Selector, Txn};
pub use format::MAX_LEVEL;

#[cfg(test)]
mod tests {
    use super::*;
    use std::path::PathBuf;

    fn temp_db() -> (tempfile::TempDir, PathBuf) {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("table.db");
        Db::create(&path).unwrap();
        (dir, path)
    }

    #[test]
    fn insert_and_fetch_roundtrip() {
        let (_dir, path) = temp_db();
        let mut db = Db::open(&path).unwrap();

        {
            let mut txn = db.begin_write().unwrap();
            txn.insert(b"alice", b"one").unwrap();
            txn.insert(b"bob", b"two").unwrap();
            txn.insert(b"carol", b"three").unwrap();
            txn.commit().unwrap();
        }

        assert_eq!(db.fetch(b"alice").unwrap(), Some(b"one".to_vec()));
        assert_eq!(db.fetch(b"bob").unwrap(), Some(b"two".to_vec()));
        assert_eq!(db.fetch(b"carol").unwrap(), Some(b"three".to_vec()));
        assert_eq!(db.fetch(b"dave").unwrap(), None);
    }

    #[test]
    fn overwrite_replaces_value() {
        let (_dir, path) = temp_db();
        let mut db = Db::open(&path).unwrap();

        let mut txn = db.begin_write().unwrap();
        txn.insert(b"k", b"v1").unwrap();
        txn.commit().unwrap();

        let mut txn = db.begin_write().unwrap();
        txn.insert(b"k", b"v2").unwrap();
        txn.commit().unwrap();

        assert_eq!(db.fetch(b"k").unwrap(), Some(b"v2".to_vec()));
        assert_eq!(db.len_entries(), 1);
    }

    #[test]
    fn delete_removes_key() {
        let (_dir, path) = temp_db();
        let mut db = Db::open(&path).unwrap();

        let mut txn = db.begin_write().unwrap();
        txn.insert(b"k1", b"v1").unwrap();
        txn.insert(b"k2", b"v2").unwrap();
        txn.commit().unwrap();

        let mut txn = db.begin_write().unwrap();
        assert!(txn.delete(b"k1").unwrap());
        assert!(!txn.delete(b"missing").unwrap());
        txn.commit().unwrap();

        assert_eq!(db.fetch(b"k1").unwrap(), None);
        assert_eq!(db.fetch(b"k2").unwrap(), Some(b"v2".to_vec()));
    }

    #[test]
    fn abort_rolls_back_inserts() {
        let (_dir, path) = temp_db();
        let mut db = Db::open(&path).unwrap();

        let mut txn = db.begin_write().unwrap();
        txn.insert(b"persisted", b"yes").unwrap();
        txn.commit().unwrap();

        let mut txn = db.begin_write().unwrap();
        txn.insert(b"ghost", b"no").unwrap();
        txn.abort().unwrap();

        assert_eq!(db.fetch(b"ghost").unwrap(), None);
        assert_eq!(db.fetch(b"persisted").unwrap(), Some(b"yes".to_vec()));
    }

    #[test]
    fn foreach_prefix_and_range() {
        let (_dir, path) = temp_db();
        let mut db = Db::open(&path).unwrap();

        let mut txn = db.begin_write().unwrap();
        for k in ["mbox.a", "mbox.b", "mbox.c", "user.z"] {
            txn.insert(k.as_bytes(), b"x").unwrap();
        }
        txn.commit().unwrap();

        let mut seen = Vec::new();
        db.foreach(Selector::Prefix(b"mbox."), |k, _| {
            seen.push(k.to_vec());
            true
        })
        .unwrap();
        assert_eq!(
            seen,
            vec![b"mbox.a".to_vec(), b"mbox.b".to_vec(), b"mbox.c".to_vec()]
        );

        let mut seen = Vec::new();
        db.foreach(
            Selector::Range {
                start: b"mbox.b",
                end: b"mbox.z",
            },
            |k, _| {
                seen.push(k.to_vec());
                true
            },
        )
        .unwrap();
        assert_eq!(seen, vec![b"mbox.b".to_vec(), b"mbox.c".to_vec()]);
    }

    #[test]
    fn checkpoint_preserves_live_entries_and_drops_tombstones() {
        let (_dir, path) = temp_db();
        let mut db = Db::open(&path).unwrap();

        let mut txn = db.begin_write().unwrap();
        for i in 0..50 {
            txn.insert(format!("key{:03}", i).as_bytes(), b"v").unwrap();
        }
        txn.commit().unwrap();

        let mut txn = db.begin_write().unwrap();
        for i in 0..25 {
            txn.delete(format!("key{:03}", i).as_bytes()).unwrap();
        }
        txn.commit().unwrap();

        db.checkpoint().unwrap();
        assert_eq!(db.len_entries(), 25);

        for i in 0..25 {
            assert_eq!(db.fetch(format!("key{:03}", i).as_bytes()).unwrap(), None);
        }
        for i in 25..50 {
            assert_eq!(
                db.fetch(format!("key{:03}", i).as_bytes()).unwrap(),
                Some(b"v".to_vec())
            );
        }
    }

    #[test]
    fn reopen_recovers_committed_state() {
        let (_dir, path) = temp_db();
        {
            let mut db = Db::open(&path).unwrap();
            let mut txn = db.begin_write().unwrap();
            txn.insert(b"durable", b"value").unwrap();
            txn.commit().unwrap();
        }
        let mut db = Db::open(&path).unwrap();
        assert_eq!(db.fetch(b"durable").unwrap(), Some(b"value".to_vec()));
    }

    #[test]
    fn recovery_truncates_uncommitted_tail() {
        let (_dir, path) = temp_db();
        {
            let mut db = Db::open(&path).unwrap();
            let mut txn = db.begin_write().unwrap();
            txn.insert(b"good", b"1").unwrap();
            txn.commit().unwrap();
        }

        // Simulate a crash mid-transaction: append a well-formed node
        // record with no trailing COMMIT marker.
        {
            use std::fs::OpenOptions;
            use std::io::Write;
            let mut f = OpenOptions::new().append(true).open(&path).unwrap();
            let partial = format::Node {
                rtype: format::RecordType::Add,
                key: b"orphan".to_vec(),
                data: b"2".to_vec(),
                forward: vec![0],
            };
            f.write_all(&partial.encode()).unwrap();
        }

        let mut db = Db::open(&path).unwrap();
        assert_eq!(db.fetch(b"good").unwrap(), Some(b"1".to_vec()));
        assert_eq!(db.fetch(b"orphan").unwrap(), None);
    }

    #[test]
    fn recovery_restores_predecessor_pointer_after_uncommitted_mid_list_insert() {
        let (_dir, path) = temp_db();
        {
            let mut db = Db::open(&path).unwrap();
            let mut txn = db.begin_write().unwrap();
            txn.insert(b"a", b"1").unwrap();
            txn.insert(b"c", b"3").unwrap();
            txn.commit().unwrap();
        }

        // Crash mid-transaction: "b" is spliced between the committed
        // "a" and "c", patching "a"'s forward pointer in place, but the
        // transaction never reaches COMMIT. mem::forget suppresses the
        // Drop-triggered in-memory abort so only the on-disk recovery
        // path is exercised.
        {
            let mut db = Db::open(&path).unwrap();
            let mut txn = db.begin_write().unwrap();
            txn.insert(b"b", b"2").unwrap();
            std::mem::forget(txn);
        }

        let mut db = Db::open(&path).unwrap();
        assert_eq!(db.fetch(b"a").unwrap(), Some(b"1".to_vec()));
        assert_eq!(db.fetch(b"c").unwrap(), Some(b"3".to_vec()));
        assert_eq!(db.fetch(b"b").unwrap(), None);

        // "a" must still reach "c" directly; a naively-nulled forward
        // pointer would sever the list here instead.
        let mut seen = Vec::new();
        db.foreach(Selector::Prefix(b""), |k, _| {
            seen.push(k.to_vec());
            true
        })
        .unwrap();
        assert_eq!(seen, vec![b"a".to_vec(), b"c".to_vec()]);
    }

    #[test]
    fn recovery_undoes_uncommitted_delete_splice_against_committed_predecessor() {
        let (_dir, path) = temp_db();
        {
            let mut db = Db::open(&path).unwrap();
            let mut txn = db.begin_write().unwrap();
            txn.insert(b"a", b"1").unwrap();
            txn.insert(b"b", b"2").unwrap();
            txn.insert(b"c", b"3").unwrap();
            txn.commit().unwrap();
        }

        // Crash mid-delete: removing "b" patches "a"'s forward pointer
        // (already committed) to target "c" directly, but the
        // transaction never commits.
        {
            let mut db = Db::open(&path).unwrap();
            let mut txn = db.begin_write().unwrap();
            assert!(txn.delete(b"b").unwrap());
            std::mem::forget(txn);
        }

        let mut db = Db::open(&path).unwrap();
        assert_eq!(db.fetch(b"a").unwrap(), Some(b"1".to_vec()));
        assert_eq!(db.fetch(b"b").unwrap(), Some(b"2".to_vec()));
        assert_eq!(db.fetch(b"c").unwrap(), Some(b"3".to_vec()));

        let mut seen = Vec::new();
        db.foreach(Selector::Prefix(b""), |k, _| {
            seen.push(k.to_vec());
            true
        })
        .unwrap();
        assert_eq!(seen, vec![b"a".to_vec(), b"b".to_vec(), b"c".to_vec()]);
    }
}
