//! The per-mailbox index file: a header block followed by one
//! fixed-width [`IndexRecord`] per live message. New records are
//! appended; flag changes and expunge rewrite records in place or
//! rebuild the file wholesale (see [`crate::mailbox`]).

use std::fs::OpenOptions;
use std::io::{self, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};

use silo_io::{retry_write, MappedFile};

use crate::error::MailboxError;
use crate::format::{IndexHeader, IndexRecord, INDEX_HEADER_SIZE, INDEX_RECORD_SIZE};

pub struct IndexFile {
    mapped: MappedFile,
    path: PathBuf,
    header: IndexHeader,
}

impl IndexFile {
    pub fn create(path: impl AsRef<Path>, header: &IndexHeader) -> io::Result<()> {
        let path = path.as_ref();
        let mut file = OpenOptions::new()
            .create_new(true)
            .write(true)
            .open(path)?;
        retry_write(&mut file, &header.encode())?;
        file.sync_all()
    }

    pub fn open(path: impl AsRef<Path>) -> Result<Self, MailboxError> {
        let path = path.as_ref().to_path_buf();
        let mapped = MappedFile::open(&path).map_err(map_io_error)?;
        let header = IndexHeader::decode(mapped.as_slice())
            .map_err(|e| MailboxError::MailboxBadFormat(e.to_string()))?;
        Ok(IndexFile {
            mapped,
            path,
            header,
        })
    }

    pub fn header(&self) -> &IndexHeader {
        &self.header
    }

    pub fn record_count(&self) -> usize {
        let body = self.mapped.len().saturating_sub(self.header.start_offset as u64);
        (body / self.header.record_size as u64) as usize
    }

    fn record_offset(&self, index: usize) -> u64 {
        self.header.start_offset as u64 + index as u64 * self.header.record_size as u64
    }

    pub fn record_at(&self, index: usize) -> Result<IndexRecord, MailboxError> {
        let offset = self.record_offset(index) as usize;
        let end = offset + INDEX_RECORD_SIZE;
        let slice = self
            .mapped
            .as_slice()
            .get(offset..end)
            .ok_or_else(|| MailboxError::MailboxBadFormat("index record out of range".into()))?;
        IndexRecord::decode(slice).map_err(|e| MailboxError::MailboxBadFormat(e.to_string()))
    }

    pub fn records(&self) -> Result<Vec<IndexRecord>, MailboxError> {
        (0..self.record_count()).map(|i| self.record_at(i)).collect()
    }

    /// Appends one record to the end of the file and refreshes the
    /// mapping so subsequent reads see it.
    pub fn append_record(&mut self, record: &IndexRecord) -> io::Result<()> {
        let mut file = OpenOptions::new().append(true).open(&self.path)?;
        retry_write(&mut file, &record.encode())?;
        file.sync_data()?;
        self.refresh()
    }

    /// Rewrites the record at `index` in place (flag changes; the
    /// record's position in the file does not move).
    pub fn rewrite_record(&mut self, index: usize, record: &IndexRecord) -> io::Result<()> {
        let offset = self.record_offset(index);
        let mut file = OpenOptions::new().write(true).open(&self.path)?;
        file.seek(SeekFrom::Start(offset))?;
        file.write_all(&record.encode())?;
        file.sync_data()?;
        self.refresh()
    }

    pub fn write_header(&mut self, header: &IndexHeader) -> io::Result<()> {
        let mut file = OpenOptions::new().write(true).open(&self.path)?;
        file.seek(SeekFrom::Start(0))?;
        file.write_all(&header.encode())?;
        file.sync_data()?;
        self.header = *header;
        self.refresh()
    }

    fn refresh(&mut self) -> io::Result<()> {
        self.mapped.map_refresh()?;
        if let Ok(header) = IndexHeader::decode(self.mapped.as_slice()) {
            self.header = header;
        }
        Ok(())
    }
}

fn map_io_error(e: silo_io::IoError) -> MailboxError {
    match e {
        silo_io::IoError::Io(source) => MailboxError::Io(source),
        silo_io::IoError::Lock(source) => {
            MailboxError::Io(io::Error::new(io::ErrorKind::Other, source))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_record(uid: u32) -> IndexRecord {
        IndexRecord {
            uid,
            internaldate: 1_700_000_000,
            sentdate: 1_699_999_000,
            size: 128,
            header_size: 32,
            content_offset: INDEX_HEADER_SIZE as u64,
            cache_offset: 0,
            last_updated: 1_700_000_000,
            system_flags: 0,
            user_flags: [0; 4],
        }
    }

    #[test]
    fn append_and_read_back_records() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("index");
        IndexFile::create(&path, &IndexHeader::new(1)).unwrap();

        let mut index = IndexFile::open(&path).unwrap();
        index.append_record(&sample_record(1)).unwrap();
        index.append_record(&sample_record(2)).unwrap();

        assert_eq!(index.record_count(), 2);
        assert_eq!(index.record_at(0).unwrap().uid, 1);
        assert_eq!(index.record_at(1).unwrap().uid, 2);
    }

    #[test]
    fn rewrite_record_changes_flags_in_place() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("index");
        IndexFile::create(&path, &IndexHeader::new(1)).unwrap();

        let mut index = IndexFile::open(&path).unwrap();
        index.append_record(&sample_record(1)).unwrap();

        let mut updated = index.record_at(0).unwrap();
        updated.system_flags = crate::format::FLAG_DELETED;
        index.rewrite_record(0, &updated).unwrap();

        assert_eq!(index.record_count(), 1);
        assert!(index.record_at(0).unwrap().has_flag(crate::format::FLAG_DELETED));
    }

    #[test]
    fn write_header_updates_exists_counter() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("index");
        let header = IndexHeader::new(1);
        IndexFile::create(&path, &header).unwrap();

        let mut index = IndexFile::open(&path).unwrap();
        let mut new_header = *index.header();
        new_header.exists = 3;
        new_header.last_uid = 3;
        index.write_header(&new_header).unwrap();

        assert_eq!(index.header().exists, 3);
        assert_eq!(index.header().last_uid, 3);

        let reopened = IndexFile::open(&path).unwrap();
        assert_eq!(reopened.header().exists, 3);
    }
}
