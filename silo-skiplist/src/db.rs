use std::path::Path;

use rand::Rng;
use tracing::{debug, warn};

use crate::format::{
    self, DeleteRecord, FormatError, Header, Node, PatchRecord, RecordType, COMMIT_ENCODED_LEN,
    DUMMY_OFFSET, HEADER_SIZE, MAX_LEVEL,
};
use silo_io::{retry_write, LockOutcome, MappedFile};

#[derive(Debug, thiserror::Error)]
pub enum DbError {
    #[error(transparent)]
    Format(#[from] FormatError),
    #[error(transparent)]
    Io(#[from] silo_io::IoError),
    #[error("std io error: {0}")]
    StdIo(#[from] std::io::Error),
    #[error("key not found")]
    NotFound,
    #[error("corrupt skiplist: {0}")]
    Corrupt(String),
}

pub type Result<T> = std::result::Result<T, DbError>;

/// How to select a slice of the ordered key space. Mirrors the
/// range/prefix/single/list split used by other in-memory keyed
/// stores in this codebase, just driven off an on-disk ordered list
/// instead of a `BTreeMap`.
pub enum Selector<'a> {
    Single(&'a [u8]),
    Range { start: &'a [u8], end: &'a [u8] },
    Prefix(&'a [u8]),
    List(&'a [Vec<u8>]),
}

/// A single-writer, multi-reader ordered byte-string map backed by one
/// memory-mapped, append-mostly file. Forward-pointer slots in
/// already-written nodes are patched in place; keys/values/tombstones
/// are append-only until a checkpoint compacts them away.
pub struct Db {
    mapped: MappedFile,
    header: Header,
    len: u64,
}

/// Snapshot taken at the start of a write transaction, restored verbatim
/// on abort.
struct TxnSnapshot {
    curlevel: u32,
    listsize: u32,
    file_len: u64,
}

/// A handle to an in-progress write transaction. Only one can exist at a
/// time (it borrows `Db` mutably), matching the single-writer invariant.
pub struct Txn<'db> {
    db: &'db mut Db,
    snapshot: TxnSnapshot,
    /// reverse-apply log for in-place pointer patches: (offset, old 8 bytes)
    undo: Vec<(u64, [u8; 8])>,
    committed: bool,
}

impl Db {
    /// Create a new, empty database file at `path`. Fails if the file
    /// already exists.
    pub fn create(path: impl AsRef<Path>) -> Result<()> {
        let path = path.as_ref();
        let mut file = std::fs::OpenOptions::new()
            .create_new(true)
            .read(true)
            .write(true)
            .open(path)?;

        let header = Header {
            version: format::VERSION,
            maxlevel: MAX_LEVEL as u32,
            curlevel: 1,
            listsize: 0,
            logstart: HEADER_SIZE,
            last_recovery: 0,
        };
        let dummy = Node {
            rtype: RecordType::Dummy,
            key: Vec::new(),
            data: Vec::new(),
            forward: vec![0u64; MAX_LEVEL],
        };

        retry_write(&mut file, &header.encode())?;
        retry_write(&mut file, &dummy.encode())?;
        file.sync_all()?;
        Ok(())
    }

    /// Open an existing database file, running crash recovery: the log
    /// tail is truncated back to the last well-formed `COMMIT`, and any
    /// forward pointer left dangling into the truncated region is
    /// cleared.
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        let mut mapped = MappedFile::open(path)?;
        mapped.lock_reopen(true)?;
        let header = Header::decode(mapped.as_slice())?;
        let len = mapped.len();

        let mut db = Db { mapped, header, len };
        db.recover()?;
        db.mapped.unlock()?;
        Ok(db)
    }

    fn raw(&self) -> &[u8] {
        self.mapped.as_slice()
    }

    fn node_at(&self, offset: u64) -> Result<Node> {
        if offset == 0 || offset >= self.len {
            return Err(DbError::Corrupt(format!(
                "forward pointer {} out of bounds (len {})",
                offset, self.len
            )));
        }
        let (node, _) = Node::decode(&self.raw()[offset as usize..])?;
        Ok(node)
    }

    /// Scan the log from `header.logstart` to current EOF. Any record
    /// run that isn't terminated by a `COMMIT` before EOF belongs to a
    /// transaction that never finished; it's dropped by truncating the
    /// file to the offset right after the last full `COMMIT`. Before
    /// truncating, every `PATCH` record seen in that unfinished run is
    /// replayed in reverse (write its `old` value back to its `slot`),
    /// undoing the in-place forward-pointer splices that transaction
    /// made — those slots often live in already-committed nodes well
    /// before the truncation point, so truncation alone never touches
    /// them.
    fn recover(&mut self) -> Result<()> {
        let mut pos = self.header.logstart;
        let mut last_good = self.header.logstart;
        let raw_len = self.len;
        let mut pending_patches: Vec<(u64, u64)> = Vec::new();

        while pos < raw_len {
            let buf = &self.raw()[pos as usize..];
            let rtype = match format::peek_type(buf) {
                Ok(t) => t,
                Err(_) => break,
            };
            let advanced = match rtype {
                RecordType::Dummy | RecordType::Add | RecordType::Inorder => {
                    match Node::decode(buf) {
                        Ok((_, n)) => n,
                        Err(_) => break,
                    }
                }
                RecordType::Delete => match DeleteRecord::decode(buf) {
                    Ok(_) => DeleteRecord::ENCODED_LEN,
                    Err(_) => break,
                },
                RecordType::Patch => match PatchRecord::decode(buf) {
                    Ok(p) => {
                        pending_patches.push((p.slot, p.old));
                        PatchRecord::ENCODED_LEN
                    }
                    Err(_) => break,
                },
                RecordType::Commit => {
                    pos += COMMIT_ENCODED_LEN;
                    last_good = pos;
                    pending_patches.clear();
                    continue;
                }
            };
            pos += advanced;
        }

        if last_good < raw_len {
            warn!(
                truncating_bytes = raw_len - last_good,
                patches_undone = pending_patches.len(),
                "skiplist recovery: dropping uncommitted log tail"
            );
            for (slot, old) in pending_patches.into_iter().rev() {
                self.patch_u64(slot, old)?;
            }
            self.mapped.file().set_len(last_good)?;
            self.len = last_good;
            self.mapped.map_refresh()?;
        }

        self.revalidate_pointers()?;
        Ok(())
    }

    /// Defensive consistency check run after every recovery: every
    /// forward pointer in the (now truncated) file must target a node
    /// that still exists. The write-ahead patch log replayed above
    /// should already guarantee this; a pointer still dangling here
    /// means a patch went unlogged (an on-disk format predating
    /// `PATCH` records, or genuine corruption), not an ordinary crash,
    /// so it's reported rather than silently severed — nulling it
    /// would orphan every node after the splice point instead of
    /// surfacing the problem.
    fn revalidate_pointers(&mut self) -> Result<()> {
        let mut pos = DUMMY_OFFSET;
        let len = self.len;
        while pos < len {
            let buf = self.raw()[pos as usize..].to_vec();
            let rtype = match format::peek_type(&buf) {
                Ok(t) => t,
                Err(_) => break,
            };
            match rtype {
                RecordType::Dummy | RecordType::Add | RecordType::Inorder => {
                    let (node, advance) = Node::decode(&buf)?;
                    for &fwd in node.forward.iter() {
                        if fwd != 0 && fwd >= len {
                            return Err(DbError::Corrupt(format!(
                                "forward pointer at offset {} targets {} past EOF {} after recovery",
                                pos, fwd, len
                            )));
                        }
                    }
                    pos += advance;
                }
                RecordType::Delete | RecordType::Patch => {
                    pos += match rtype {
                        RecordType::Delete => DeleteRecord::ENCODED_LEN,
                        _ => PatchRecord::ENCODED_LEN,
                    }
                }
                RecordType::Commit => pos += COMMIT_ENCODED_LEN,
            }
        }
        Ok(())
    }

    fn patch_u64(&mut self, offset: u64, value: u64) -> Result<()> {
        use std::os::unix::fs::FileExt;
        self.mapped.file().write_at(&value.to_be_bytes(), offset)?;
        self.mapped.map_refresh()?;
        Ok(())
    }

    fn write_header(&mut self) -> Result<()> {
        use std::os::unix::fs::FileExt;
        self.mapped.file().write_at(&self.header.encode(), 0)?;
        self.mapped.map_refresh()?;
        Ok(())
    }

    fn random_level(&self) -> usize {
        let mut level = 1;
        let mut rng = rand::thread_rng();
        while level < self.header.maxlevel as usize && rng.gen_bool(0.5) {
            level += 1;
        }
        level
    }

    /// Find, at every level, the last node whose key is `< key` (or, for
    /// lookup, the node the search path would splice after). Returns
    /// `preds[level]` = offset of that predecessor, for `level` in
    /// `0..maxlevel`.
    fn find_preds(&self, key: &[u8]) -> Result<Vec<u64>> {
        let maxlevel = self.header.maxlevel as usize;
        let mut preds = vec![DUMMY_OFFSET; maxlevel];
        let mut cur = DUMMY_OFFSET;
        let mut cur_node = self.node_at_or_dummy(cur)?;

        for level in (0..self.header.curlevel as usize).rev() {
            loop {
                let fwd = cur_node.forward.get(level).copied().unwrap_or(0);
                if fwd == 0 {
                    break;
                }
                let candidate = self.node_at(fwd)?;
                if candidate.key.as_slice() < key {
                    cur = fwd;
                    cur_node = candidate;
                } else {
                    break;
                }
            }
            preds[level] = cur;
        }
        Ok(preds)
    }

    fn node_at_or_dummy(&self, offset: u64) -> Result<Node> {
        if offset == DUMMY_OFFSET {
            let (node, _) = Node::decode(&self.raw()[DUMMY_OFFSET as usize..])?;
            Ok(node)
        } else {
            self.node_at(offset)
        }
    }

    /// Point lookup. Takes a brief shared lock so a concurrent
    /// checkpoint-and-rename is detected and the mapping refreshed
    /// before the search runs.
    pub fn fetch(&mut self, key: &[u8]) -> Result<Option<Vec<u8>>> {
        if self.mapped.lock_reopen(false)? == LockOutcome::NeedsRefresh {
            self.header = Header::decode(self.raw())?;
            self.len = self.mapped.len();
        }
        let result = self.fetch_locked(key);
        self.mapped.unlock()?;
        result
    }

    fn fetch_locked(&self, key: &[u8]) -> Result<Option<Vec<u8>>> {
        let preds = self.find_preds(key)?;
        let candidate_off = self.node_at_or_dummy(preds[0])?.forward.first().copied().unwrap_or(0);
        if candidate_off == 0 {
            return Ok(None);
        }
        let candidate = self.node_at(candidate_off)?;
        if candidate.key == key {
            Ok(Some(candidate.data))
        } else {
            Ok(None)
        }
    }

    /// Iterate keys/values matching `selector` in ascending key order,
    /// calling `f(key, data)` for each; stop early if `f` returns
    /// `false`.
    pub fn foreach(
        &mut self,
        selector: Selector<'_>,
        mut f: impl FnMut(&[u8], &[u8]) -> bool,
    ) -> Result<()> {
        if self.mapped.lock_reopen(false)? == LockOutcome::NeedsRefresh {
            self.header = Header::decode(self.raw())?;
            self.len = self.mapped.len();
        }

        let start_key: Option<Vec<u8>> = match &selector {
            Selector::Single(k) => Some(k.to_vec()),
            Selector::Range { start, .. } => Some(start.to_vec()),
            Selector::Prefix(p) => Some(p.to_vec()),
            Selector::List(_) => None,
        };

        let result = (|| -> Result<()> {
            match &selector {
                Selector::List(keys) => {
                    for k in keys.iter() {
                        if let Some(v) = self.fetch_locked(k)? {
                            if !f(k, &v) {
                                break;
                            }
                        }
                    }
                    return Ok(());
                }
                _ => {}
            }

            let start_key = start_key.unwrap();
            let preds = self.find_preds(&start_key)?;
            let mut cur = self.node_at_or_dummy(preds[0])?.forward.first().copied().unwrap_or(0);

            while cur != 0 {
                let node = self.node_at(cur)?;
                let keep = match &selector {
                    Selector::Single(k) => node.key.as_slice() == *k,
                    Selector::Range { end, .. } => node.key.as_slice() < *end,
                    Selector::Prefix(p) => node.key.starts_with(p),
                    Selector::List(_) => unreachable!(),
                };
                if !keep {
                    break;
                }
                if !f(&node.key, &node.data) {
                    break;
                }
                cur = node.forward.first().copied().unwrap_or(0);
            }
            Ok(())
        })();

        self.mapped.unlock()?;
        result
    }

    /// Begin a write transaction. Acquires the exclusive lock for the
    /// lifetime of the transaction.
    pub fn begin_write(&mut self) -> Result<Txn<'_>> {
        if self.mapped.lock_reopen(true)? == LockOutcome::NeedsRefresh {
            self.header = Header::decode(self.raw())?;
            self.len = self.mapped.len();
        }
        let snapshot = TxnSnapshot {
            curlevel: self.header.curlevel,
            listsize: self.header.listsize,
            file_len: self.len,
        };
        Ok(Txn {
            db: self,
            snapshot,
            undo: Vec::new(),
            committed: false,
        })
    }

    /// Rewrite the live set of key/value pairs into a fresh file and
    /// atomically rename it over the original, discarding deleted
    /// tombstones and the transaction log accumulated so far. Must be
    /// called with no other transaction in progress.
    pub fn checkpoint(&mut self) -> Result<()> {
        self.mapped.lock_reopen(true)?;

        let tmp_path = {
            let mut p = self.mapped.path().to_path_buf();
            let name = format!(
                "{}.checkpoint",
                p.file_name().unwrap_or_default().to_string_lossy()
            );
            p.set_file_name(name);
            p
        };

        let mut live: Vec<(Vec<u8>, Vec<u8>)> = Vec::with_capacity(self.header.listsize as usize);
        self.foreach_all(|k, v| {
            live.push((k.to_vec(), v.to_vec()));
            true
        })?;

        let mut tmp = std::fs::OpenOptions::new()
            .create(true)
            .truncate(true)
            .read(true)
            .write(true)
            .open(&tmp_path)?;

        let maxlevel = self.header.maxlevel;
        let mut header = Header {
            version: format::VERSION,
            maxlevel,
            curlevel: 1,
            listsize: live.len() as u32,
            logstart: 0,
            last_recovery: self.header.last_recovery,
        };
        retry_write(&mut tmp, &header.encode())?;

        // Lay nodes out back to front so each node's forward pointers
        // (computed before we know its own offset) can reference
        // already-placed successors.
        let mut levels: Vec<usize> = (0..live.len()).map(|_| self.random_level()).collect();
        let max_used = levels.iter().copied().max().unwrap_or(1).max(1);
        header.curlevel = max_used as u32;

        let mut offsets = vec![0u64; live.len()];
        let dummy_offset = HEADER_SIZE;

        // First pass: lay nodes out in key order, recording each one's
        // offset so the second pass can wire up forward pointers.
        let mut cursor = dummy_offset
            + Node {
                rtype: RecordType::Dummy,
                key: vec![],
                data: vec![],
                forward: vec![0u64; maxlevel as usize],
            }
            .encoded_len();
        for (i, (k, v)) in live.iter().enumerate() {
            offsets[i] = cursor;
            let n = Node {
                rtype: RecordType::Inorder,
                key: k.clone(),
                data: v.clone(),
                forward: vec![0u64; levels[i]],
            };
            cursor += n.encoded_len();
        }

        // Second pass: for each level, scan right to left so every
        // node's forward[level] is the offset of the next node to its
        // right whose own level is tall enough, or 0 at the tail. The
        // dummy head node gets the same treatment, its "predecessor"
        // position being the start of the list.
        let mut forwards: Vec<Vec<u64>> = levels.iter().map(|&l| vec![0u64; l]).collect();
        let mut dummy_forward = vec![0u64; maxlevel as usize];
        for level in 0..max_used {
            let mut next = 0u64;
            for i in (0..live.len()).rev() {
                if levels[i] > level {
                    forwards[i][level] = next;
                    next = offsets[i];
                }
            }
            dummy_forward[level] = next;
        }

        let dummy = Node {
            rtype: RecordType::Dummy,
            key: vec![],
            data: vec![],
            forward: dummy_forward,
        };
        retry_write(&mut tmp, &dummy.encode())?;
        for (i, (k, v)) in live.iter().enumerate() {
            let n = Node {
                rtype: RecordType::Inorder,
                key: k.clone(),
                data: v.clone(),
                forward: forwards[i].clone(),
            };
            retry_write(&mut tmp, &n.encode())?;
        }
        header.logstart = cursor;
        tmp.sync_all()?;
        use std::os::unix::fs::FileExt;
        tmp.write_at(&header.encode(), 0)?;
        tmp.sync_all()?;

        std::fs::rename(&tmp_path, self.mapped.path())?;
        self.mapped.map_refresh()?;
        self.header = Header::decode(self.raw())?;
        self.len = self.mapped.len();
        self.mapped.unlock()?;
        debug!(entries = live.len(), "skiplist checkpoint complete");
        Ok(())
    }

    fn foreach_all(&mut self, mut f: impl FnMut(&[u8], &[u8]) -> bool) -> Result<()> {
        let mut cur = self.node_at_or_dummy(DUMMY_OFFSET)?.forward.first().copied().unwrap_or(0);
        while cur != 0 {
            let node = self.node_at(cur)?;
            if !f(&node.key, &node.data) {
                break;
            }
            cur = node.forward.first().copied().unwrap_or(0);
        }
        Ok(())
    }

    pub fn len_entries(&self) -> u32 {
        self.header.listsize
    }
}

impl<'db> Txn<'db> {
    /// Patches one forward-pointer slot in place. Write-ahead logs the
    /// slot's old value as a `PATCH` record before touching it, so a
    /// crash before `commit` can be undone by recovery even though the
    /// slot itself usually lives in an already-committed node, well
    /// outside the region truncation would drop.
    fn patch_forward(&mut self, record_offset: u64, level: usize, new_target: u64) -> Result<()> {
        use std::os::unix::fs::FileExt;
        let node = self.db.node_at(record_offset)?;
        let slot = record_offset + node.forward_slot_offset(level);
        let mut old = [0u8; 8];
        self.db.mapped.file().read_exact_at(&mut old, slot)?;
        let old_value = u64::from_be_bytes(old);

        let patch = PatchRecord {
            slot,
            old: old_value,
        };
        self.append(&patch.encode())?;

        self.undo.push((slot, old));
        self.db
            .mapped
            .file()
            .write_at(&new_target.to_be_bytes(), slot)?;
        self.db.mapped.map_refresh()?;
        Ok(())
    }

    fn append(&mut self, bytes: &[u8]) -> Result<u64> {
        use std::io::{Seek, SeekFrom};
        let offset = self.db.mapped.file().metadata()?.len();
        let mut file = self.db.mapped.file().try_clone()?;
        file.seek(SeekFrom::End(0))?;
        retry_write(&mut file, bytes)?;
        self.db.mapped.map_refresh()?;
        self.db.len = self.db.mapped.len();
        Ok(offset)
    }

    /// Insert or overwrite `key`. If a node with this key already
    /// exists, it is spliced out first (as if deleted) before the new
    /// value is linked in, so point lookups always see at most one
    /// live node per key.
    pub fn insert(&mut self, key: &[u8], data: &[u8]) -> Result<()> {
        self.delete_if_present(key)?;

        let preds = self.db.find_preds(key)?;
        let level = self.db.random_level();

        let mut forward = Vec::with_capacity(level);
        for l in 0..level {
            let pred_node = self.db.node_at_or_dummy(preds[l])?;
            forward.push(pred_node.forward.get(l).copied().unwrap_or(0));
        }

        let node = Node {
            rtype: RecordType::Add,
            key: key.to_vec(),
            data: data.to_vec(),
            forward,
        };
        let new_offset = self.append(&node.encode())?;

        for l in 0..level {
            self.patch_forward(preds[l], l, new_offset)?;
        }

        if level as u32 > self.db.header.curlevel {
            self.db.header.curlevel = level as u32;
        }
        self.db.header.listsize += 1;
        Ok(())
    }

    /// Remove `key` if present. Returns whether it was found.
    pub fn delete(&mut self, key: &[u8]) -> Result<bool> {
        Ok(self.delete_if_present(key)?.is_some())
    }

    fn delete_if_present(&mut self, key: &[u8]) -> Result<Option<()>> {
        let preds = self.db.find_preds(key)?;
        let candidate_off = self
            .db
            .node_at_or_dummy(preds[0])?
            .forward
            .first()
            .copied()
            .unwrap_or(0);
        if candidate_off == 0 {
            return Ok(None);
        }
        let candidate = self.db.node_at(candidate_off)?;
        if candidate.key != key {
            return Ok(None);
        }

        let del = DeleteRecord {
            target: candidate_off,
        };
        self.append(&del.encode())?;

        for (l, &fwd) in candidate.forward.iter().enumerate() {
            self.patch_forward(preds[l], l, fwd)?;
        }
        self.db.header.listsize = self.db.header.listsize.saturating_sub(1);
        Ok(Some(()))
    }

    /// Commit: append a `COMMIT` marker, fsync the data, then write the
    /// updated header (curlevel/listsize/logstart) and fsync again.
    pub fn commit(mut self) -> Result<()> {
        self.append(&format::encode_commit())?;
        self.db.mapped.file().sync_data()?;
        self.db.write_header()?;
        self.db.mapped.file().sync_data()?;
        self.committed = true;
        self.db.mapped.unlock()?;
        Ok(())
    }

    /// Abort: truncate the file back to its pre-transaction length and
    /// replay the pointer-patch undo log in reverse, then restore the
    /// in-memory header snapshot.
    pub fn abort(mut self) -> Result<()> {
        self.do_abort()
    }

    fn do_abort(&mut self) -> Result<()> {
        for (offset, old) in self.undo.drain(..).rev() {
            use std::os::unix::fs::FileExt;
            self.db.mapped.file().write_at(&old, offset)?;
        }
        self.db.mapped.file().set_len(self.snapshot.file_len)?;
        self.db.header.curlevel = self.snapshot.curlevel;
        self.db.header.listsize = self.snapshot.listsize;
        self.db.len = self.snapshot.file_len;
        self.db.mapped.map_refresh()?;
        self.committed = true; // prevent Drop from aborting twice
        self.db.mapped.unlock()?;
        Ok(())
    }
}

impl<'db> Drop for Txn<'db> {
    fn drop(&mut self) {
        if !self.committed {
            let _ = self.do_abort();
        }
    }
}
