//! The per-mailbox cache file: a leading 4-byte generation number
//! (which must match the index's own generation number outside a
//! write critical section) followed by variable-length blobs, each
//! prefixed by a 4-byte big-endian length. One blob per message,
//! addressed by the `cache_offset` field of its index record.

use std::fs::OpenOptions;
use std::io;
use std::path::{Path, PathBuf};

use silo_io::{retry_write, MappedFile};

use crate::error::MailboxError;

const GENERATION_SIZE: u64 = 4;

pub struct CacheFile {
    mapped: MappedFile,
    path: PathBuf,
}

impl CacheFile {
    pub fn create(path: impl AsRef<Path>, generation_no: u32) -> io::Result<()> {
        let mut file = OpenOptions::new()
            .create_new(true)
            .write(true)
            .open(path)?;
        retry_write(&mut file, &generation_no.to_be_bytes())?;
        file.sync_all()
    }

    pub fn open(path: impl AsRef<Path>) -> Result<Self, MailboxError> {
        let path = path.as_ref().to_path_buf();
        let mapped = MappedFile::open(&path).map_err(|e| match e {
            silo_io::IoError::Io(source) => MailboxError::Io(source),
            silo_io::IoError::Lock(source) => {
                MailboxError::Io(io::Error::new(io::ErrorKind::Other, source))
            }
        })?;
        if mapped.len() < GENERATION_SIZE {
            return Err(MailboxError::MailboxBadFormat(format!(
                "cache file {} is corrupt",
                path.display()
            )));
        }
        Ok(CacheFile { mapped, path })
    }

    pub fn generation_no(&self) -> u32 {
        u32::from_be_bytes(self.mapped.as_slice()[0..4].try_into().unwrap())
    }

    /// Appends `blob` and returns the offset a caller should record in
    /// the index record's `cache_offset` field to retrieve it later.
    pub fn append_blob(&mut self, blob: &[u8]) -> io::Result<u64> {
        let offset = self.mapped.len();
        let mut file = OpenOptions::new().append(true).open(&self.path)?;
        retry_write(&mut file, &(blob.len() as u32).to_be_bytes())?;
        retry_write(&mut file, blob)?;
        file.sync_data()?;
        self.mapped.map_refresh()?;
        Ok(offset)
    }

    pub fn read_blob(&self, offset: u64) -> Result<&[u8], MailboxError> {
        let offset = offset as usize;
        let slice = self.mapped.as_slice();
        let len_bytes = slice
            .get(offset..offset + 4)
            .ok_or_else(|| MailboxError::MailboxBadFormat("cache offset out of range".into()))?;
        let len = u32::from_be_bytes(len_bytes.try_into().unwrap()) as usize;
        let start = offset + 4;
        slice
            .get(start..start + len)
            .ok_or_else(|| MailboxError::MailboxBadFormat("cache blob truncated".into()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn append_and_read_back_blobs() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("cache");
        CacheFile::create(&path, 1).unwrap();

        let mut cache = CacheFile::open(&path).unwrap();
        assert_eq!(cache.generation_no(), 1);

        let offset_a = cache.append_blob(b"envelope-a").unwrap();
        let offset_b = cache.append_blob(b"envelope-bb").unwrap();

        assert_eq!(cache.read_blob(offset_a).unwrap(), b"envelope-a");
        assert_eq!(cache.read_blob(offset_b).unwrap(), b"envelope-bb");
    }

    #[test]
    fn opening_a_truncated_file_is_an_error() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("cache");
        std::fs::write(&path, b"\x00").unwrap();
        assert!(CacheFile::open(&path).is_err());
    }
}
