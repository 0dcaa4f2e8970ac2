//! File-backed memory mapping, retrying writes, and advisory locking with
//! stale-inode detection. These are the primitives every higher layer
//! (skiplist database, mailbox file set) builds its crash-safety on.

use std::fs::{File, OpenOptions};
use std::io::{self, IoSlice, Write};
use std::os::unix::io::AsRawFd;
use std::path::{Path, PathBuf};

use memmap2::{Mmap, MmapOptions};
use nix::libc;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum IoError {
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),
    #[error("lock error: {0}")]
    Lock(#[from] nix::Error),
}

pub type Result<T> = std::result::Result<T, IoError>;

/// Outcome of a lock acquisition. A caller that receives `NeedsRefresh`
/// MUST drop any cached metadata read from the file before continuing:
/// the path was replaced (e.g. by a skiplist checkpoint or a mailbox
/// index rename) while we were blocked waiting for the lock.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LockOutcome {
    Fresh,
    NeedsRefresh,
}

/// A scoped read-only memory mapping over a file, re-mappable when the
/// underlying file grows. Release is guaranteed by `Drop` on `Mmap`.
pub struct MappedFile {
    file: File,
    path: PathBuf,
    map: Mmap,
    len: u64,
}

impl MappedFile {
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref().to_path_buf();
        let file = OpenOptions::new().read(true).write(true).open(&path)?;
        let len = file.metadata()?.len();
        let map = unsafe { MmapOptions::new().map(&file)? };
        Ok(Self {
            file,
            path,
            map,
            len,
        })
    }

    pub fn as_slice(&self) -> &[u8] {
        &self.map[..]
    }

    pub fn len(&self) -> u64 {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn file(&self) -> &File {
        &self.file
    }

    /// Re-map if the file has grown since the last map. mmap offers no
    /// portable in-place extend, so this drops the old mapping and
    /// creates a fresh one; callers must not hold slices from the old
    /// mapping across this call.
    pub fn map_refresh(&mut self) -> Result<bool> {
        let new_len = self.file.metadata()?.len();
        if new_len == self.len {
            return Ok(false);
        }
        self.map = unsafe { MmapOptions::new().map(&self.file)? };
        self.len = new_len;
        Ok(true)
    }

    fn ino(&self) -> Result<(u64, u64)> {
        use std::os::unix::fs::MetadataExt;
        let md = self.file.metadata()?;
        Ok((md.dev(), md.ino()))
    }

    /// Acquire an exclusive (write) lock, or a shared (read) lock, via
    /// advisory open-file-description locking. If the path's inode
    /// changed while we were blocked (some other process replaced the
    /// file, e.g. a checkpoint rename), close and reopen the path and
    /// report `NeedsRefresh`.
    pub fn lock_reopen(&mut self, exclusive: bool) -> Result<LockOutcome> {
        let before = self.ino()?;
        ofd_lock_wait(&self.file, exclusive)?;

        let reopened = File::open(&self.path).and_then(|f| f.metadata()).ok();
        let after = match reopened {
            Some(md) => {
                use std::os::unix::fs::MetadataExt;
                (md.dev(), md.ino())
            }
            None => before,
        };

        if after != before {
            // release the stale lock, reopen, and re-acquire on the fresh file
            ofd_unlock(&self.file)?;
            self.file = OpenOptions::new().read(true).write(true).open(&self.path)?;
            ofd_lock_wait(&self.file, exclusive)?;
            self.map_refresh()?;
            Ok(LockOutcome::NeedsRefresh)
        } else {
            Ok(LockOutcome::Fresh)
        }
    }

    pub fn unlock(&self) -> Result<()> {
        ofd_unlock(&self.file)
    }
}

/// Acquire an open-file-description lock (`F_OFD_SETLKW`), blocking
/// until available. Whole-file range (`l_len == 0`), matching the
/// skiplist/mailbox lock discipline of whole-file exclusivity.
fn ofd_lock_wait(file: &File, exclusive: bool) -> Result<()> {
    let mut fl: libc::flock = unsafe { std::mem::zeroed() };
    fl.l_type = if exclusive {
        libc::F_WRLCK as libc::c_short
    } else {
        libc::F_RDLCK as libc::c_short
    };
    fl.l_whence = libc::SEEK_SET as libc::c_short;
    fl.l_start = 0;
    fl.l_len = 0;

    let fd = file.as_raw_fd();
    loop {
        let ret = unsafe { libc::fcntl(fd, libc::F_OFD_SETLKW, &mut fl as *mut libc::flock) };
        if ret == 0 {
            return Ok(());
        }
        let errno = io::Error::last_os_error();
        if errno.kind() != io::ErrorKind::Interrupted {
            return Err(IoError::Io(errno));
        }
    }
}

fn ofd_unlock(file: &File) -> Result<()> {
    let mut fl: libc::flock = unsafe { std::mem::zeroed() };
    fl.l_type = libc::F_UNLCK as libc::c_short;
    fl.l_whence = libc::SEEK_SET as libc::c_short;
    fl.l_start = 0;
    fl.l_len = 0;

    let fd = file.as_raw_fd();
    let ret = unsafe { libc::fcntl(fd, libc::F_OFD_SETLK, &mut fl as *mut libc::flock) };
    if ret != 0 {
        return Err(IoError::Io(io::Error::last_os_error()));
    }
    Ok(())
}

/// Writes the whole buffer, looping on short writes. Short-circuits
/// only on a hard error (anything but `Interrupted`/`WouldBlock`).
pub fn retry_write(file: &mut File, mut buf: &[u8]) -> Result<()> {
    while !buf.is_empty() {
        match file.write(buf) {
            Ok(0) => return Err(IoError::Io(io::Error::from(io::ErrorKind::WriteZero))),
            Ok(n) => buf = &buf[n..],
            Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
            Err(e) => return Err(IoError::Io(e)),
        }
    }
    Ok(())
}

/// Vectored variant of [`retry_write`]; loops until every slice has been
/// fully consumed, re-slicing the partially written head on a short
/// write.
pub fn retry_writev(file: &mut File, bufs: &[&[u8]]) -> Result<()> {
    let mut owned: Vec<Vec<u8>> = bufs.iter().map(|b| b.to_vec()).collect();
    let mut start = 0usize;
    while start < owned.len() {
        let slices: Vec<IoSlice> = owned[start..]
            .iter()
            .map(|v| IoSlice::new(v.as_slice()))
            .collect();
        match file.write_vectored(&slices) {
            Ok(0) => return Err(IoError::Io(io::Error::from(io::ErrorKind::WriteZero))),
            Ok(mut n) => {
                // consume n bytes from the front of owned[start..]
                while n > 0 && start < owned.len() {
                    if n >= owned[start].len() {
                        n -= owned[start].len();
                        start += 1;
                    } else {
                        owned[start].drain(0..n);
                        n = 0;
                    }
                }
            }
            Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
            Err(e) => return Err(IoError::Io(e)),
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Read;

    #[test]
    fn retry_write_writes_whole_buffer() {
        let mut f = tempfile::tempfile().unwrap();
        retry_write(&mut f, b"hello world").unwrap();
        let mut back = Vec::new();
        use std::io::{Seek, SeekFrom};
        f.seek(SeekFrom::Start(0)).unwrap();
        f.read_to_end(&mut back).unwrap();
        assert_eq!(back, b"hello world");
    }

    #[test]
    fn retry_writev_writes_all_slices() {
        let mut f = tempfile::tempfile().unwrap();
        retry_writev(&mut f, &[b"ab", b"cd", b"ef"]).unwrap();
        let mut back = Vec::new();
        use std::io::{Seek, SeekFrom};
        f.seek(SeekFrom::Start(0)).unwrap();
        f.read_to_end(&mut back).unwrap();
        assert_eq!(back, b"abcdef");
    }

    #[test]
    fn lock_reopen_reports_fresh_when_inode_unchanged() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("f");
        std::fs::write(&path, b"0123").unwrap();
        let mut mf = MappedFile::open(&path).unwrap();
        let outcome = mf.lock_reopen(true).unwrap();
        assert_eq!(outcome, LockOutcome::Fresh);
        mf.unlock().unwrap();
    }

    #[test]
    fn lock_reopen_detects_replaced_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("f");
        std::fs::write(&path, b"0123").unwrap();
        let mut mf = MappedFile::open(&path).unwrap();

        // simulate a checkpoint: someone else replaces the path
        let tmp = dir.path().join("f.new");
        std::fs::write(&tmp, b"new-content").unwrap();
        std::fs::rename(&tmp, &path).unwrap();

        let outcome = mf.lock_reopen(true).unwrap();
        assert_eq!(outcome, LockOutcome::NeedsRefresh);
        assert_eq!(mf.as_slice(), b"new-content");
        mf.unlock().unwrap();
    }
}
