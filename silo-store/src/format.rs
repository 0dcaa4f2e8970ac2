//! On-disk layout for the header, index, and cache files that make up
//! one mailbox directory. All multi-byte integers are network byte
//! order (big-endian), per the wire format described for the on-disk
//! formats in this system.

use thiserror::Error;

pub const HEADER_MAGIC: [u8; 20] = *b"SILO MAILBOX HDR001\n";
pub const INDEX_MAGIC: [u8; 4] = *b"SIDX";

pub const INDEX_HEADER_SIZE: usize = 50;
pub const INDEX_RECORD_SIZE: usize = 80;
pub const USER_FLAG_WORDS: usize = 4;
pub const MAX_USER_FLAGS: usize = USER_FLAG_WORDS * 32;

pub const FLAG_DELETED: u32 = 1 << 0;
pub const FLAG_ANSWERED: u32 = 1 << 1;
pub const FLAG_FLAGGED: u32 = 1 << 2;
pub const FLAG_DRAFT: u32 = 1 << 3;

#[derive(Debug, Error)]
pub enum FormatError {
    #[error("truncated {what}: need {need} bytes, have {have}")]
    Truncated {
        what: &'static str,
        need: usize,
        have: usize,
    },
    #[error("bad magic in {what}")]
    BadMagic { what: &'static str },
    #[error("unsupported format version {0}")]
    BadVersion(u16),
}

fn read_u16(buf: &[u8], off: usize) -> u16 {
    u16::from_be_bytes([buf[off], buf[off + 1]])
}

fn read_u32(buf: &[u8], off: usize) -> u32 {
    u32::from_be_bytes([buf[off], buf[off + 1], buf[off + 2], buf[off + 3]])
}

fn read_u64(buf: &[u8], off: usize) -> u64 {
    let mut raw = [0u8; 8];
    raw.copy_from_slice(&buf[off..off + 8]);
    u64::from_be_bytes(raw)
}

/// Mailbox header: quota root, unique id, user-flag name table, ACL.
/// Rewritten wholesale (temp file + rename) rather than patched in
/// place, since every field can change independently and the file is
/// small.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MailboxHeader {
    pub version: u16,
    pub quota_root: String,
    pub unique_id: String,
    pub uidvalidity: u32,
    pub user_flags: Vec<String>,
    pub acl: Vec<(String, String)>,
}

const HEADER_VERSION: u16 = 1;

impl MailboxHeader {
    pub fn new(quota_root: impl Into<String>, unique_id: impl Into<String>, uidvalidity: u32) -> Self {
        MailboxHeader {
            version: HEADER_VERSION,
            quota_root: quota_root.into(),
            unique_id: unique_id.into(),
            uidvalidity,
            user_flags: Vec::new(),
            acl: Vec::new(),
        }
    }

    pub fn encode(&self) -> Vec<u8> {
        let mut buf = Vec::with_capacity(256);
        buf.extend_from_slice(&HEADER_MAGIC);
        buf.extend_from_slice(&self.version.to_be_bytes());
        buf.extend_from_slice(&self.uidvalidity.to_be_bytes());
        write_string(&mut buf, &self.quota_root);
        write_string(&mut buf, &self.unique_id);
        buf.extend_from_slice(&(self.user_flags.len() as u16).to_be_bytes());
        for flag in &self.user_flags {
            write_string(&mut buf, flag);
        }
        buf.extend_from_slice(&(self.acl.len() as u16).to_be_bytes());
        for (identifier, rights) in &self.acl {
            write_string(&mut buf, identifier);
            write_string(&mut buf, rights);
        }
        buf
    }

    pub fn decode(buf: &[u8]) -> Result<Self, FormatError> {
        if buf.len() < HEADER_MAGIC.len() + 6 {
            return Err(FormatError::Truncated {
                what: "mailbox header",
                need: HEADER_MAGIC.len() + 6,
                have: buf.len(),
            });
        }
        if buf[..HEADER_MAGIC.len()] != HEADER_MAGIC {
            return Err(FormatError::BadMagic {
                what: "mailbox header",
            });
        }
        let mut pos = HEADER_MAGIC.len();
        let version = read_u16(buf, pos);
        pos += 2;
        if version != HEADER_VERSION {
            return Err(FormatError::BadVersion(version));
        }
        let uidvalidity = read_u32(buf, pos);
        pos += 4;
        let (quota_root, next) = read_string(buf, pos, "quota root")?;
        pos = next;
        let (unique_id, next) = read_string(buf, pos, "unique id")?;
        pos = next;

        let flag_count = read_u16(buf, pos) as usize;
        pos += 2;
        let mut user_flags = Vec::with_capacity(flag_count);
        for _ in 0..flag_count {
            let (flag, next) = read_string(buf, pos, "user flag")?;
            user_flags.push(flag);
            pos = next;
        }

        let acl_count = read_u16(buf, pos) as usize;
        pos += 2;
        let mut acl = Vec::with_capacity(acl_count);
        for _ in 0..acl_count {
            let (identifier, next) = read_string(buf, pos, "acl identifier")?;
            pos = next;
            let (rights, next) = read_string(buf, pos, "acl rights")?;
            pos = next;
            acl.push((identifier, rights));
        }

        Ok(MailboxHeader {
            version,
            quota_root,
            unique_id,
            uidvalidity,
            user_flags,
            acl,
        })
    }
}

fn write_string(buf: &mut Vec<u8>, s: &str) {
    let bytes = s.as_bytes();
    buf.extend_from_slice(&(bytes.len() as u16).to_be_bytes());
    buf.extend_from_slice(bytes);
}

fn read_string(buf: &[u8], pos: usize, what: &'static str) -> Result<(String, usize), FormatError> {
    if pos + 2 > buf.len() {
        return Err(FormatError::Truncated {
            what,
            need: pos + 2,
            have: buf.len(),
        });
    }
    let len = read_u16(buf, pos) as usize;
    let start = pos + 2;
    let end = start + len;
    if end > buf.len() {
        return Err(FormatError::Truncated {
            what,
            need: end,
            have: buf.len(),
        });
    }
    let s = String::from_utf8_lossy(&buf[start..end]).into_owned();
    Ok((s, end))
}

/// The 14-field index header block: generation number, format/minor
/// version, start offset, record size, live-message count, and the
/// counters that must stay in sync with the live records.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct IndexHeader {
    pub generation_no: u32,
    pub format: u16,
    pub minor_version: u16,
    pub start_offset: u32,
    pub record_size: u32,
    pub exists: u32,
    pub last_appenddate: u32,
    pub last_uid: u32,
    pub quota_mailbox_used: u32,
    pub pop3_last_login: u32,
    pub uidvalidity: u32,
    pub deleted: u16,
    pub answered: u16,
    pub flagged: u16,
}

const INDEX_FORMAT: u16 = 1;
const INDEX_MINOR_VERSION: u16 = 0;

impl IndexHeader {
    pub fn new(uidvalidity: u32) -> Self {
        IndexHeader {
            generation_no: 0,
            format: INDEX_FORMAT,
            minor_version: INDEX_MINOR_VERSION,
            start_offset: INDEX_HEADER_SIZE as u32,
            record_size: INDEX_RECORD_SIZE as u32,
            exists: 0,
            last_appenddate: 0,
            last_uid: 0,
            quota_mailbox_used: 0,
            pop3_last_login: 0,
            uidvalidity,
            deleted: 0,
            answered: 0,
            flagged: 0,
        }
    }

    pub fn encode(&self) -> [u8; INDEX_HEADER_SIZE] {
        let mut buf = [0u8; INDEX_HEADER_SIZE];
        buf[0..4].copy_from_slice(&INDEX_MAGIC);
        buf[4..8].copy_from_slice(&self.generation_no.to_be_bytes());
        buf[8..10].copy_from_slice(&self.format.to_be_bytes());
        buf[10..12].copy_from_slice(&self.minor_version.to_be_bytes());
        buf[12..16].copy_from_slice(&self.start_offset.to_be_bytes());
        buf[16..20].copy_from_slice(&self.record_size.to_be_bytes());
        buf[20..24].copy_from_slice(&self.exists.to_be_bytes());
        buf[24..28].copy_from_slice(&self.last_appenddate.to_be_bytes());
        buf[28..32].copy_from_slice(&self.last_uid.to_be_bytes());
        buf[32..36].copy_from_slice(&self.quota_mailbox_used.to_be_bytes());
        buf[36..40].copy_from_slice(&self.pop3_last_login.to_be_bytes());
        buf[40..44].copy_from_slice(&self.uidvalidity.to_be_bytes());
        buf[44..46].copy_from_slice(&self.deleted.to_be_bytes());
        buf[46..48].copy_from_slice(&self.answered.to_be_bytes());
        buf[48..50].copy_from_slice(&self.flagged.to_be_bytes());
        buf
    }

    pub fn decode(buf: &[u8]) -> Result<Self, FormatError> {
        if buf.len() < INDEX_HEADER_SIZE {
            return Err(FormatError::Truncated {
                what: "index header",
                need: INDEX_HEADER_SIZE,
                have: buf.len(),
            });
        }
        if buf[0..4] != INDEX_MAGIC {
            return Err(FormatError::BadMagic { what: "index header" });
        }
        Ok(IndexHeader {
            generation_no: read_u32(buf, 4),
            format: read_u16(buf, 8),
            minor_version: read_u16(buf, 10),
            start_offset: read_u32(buf, 12),
            record_size: read_u32(buf, 16),
            exists: read_u32(buf, 20),
            last_appenddate: read_u32(buf, 24),
            last_uid: read_u32(buf, 28),
            quota_mailbox_used: read_u32(buf, 32),
            pop3_last_login: read_u32(buf, 36),
            uidvalidity: read_u32(buf, 40),
            deleted: read_u16(buf, 44),
            answered: read_u16(buf, 46),
            flagged: read_u16(buf, 48),
        })
    }
}

/// One fixed-width record per live message.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct IndexRecord {
    pub uid: u32,
    pub internaldate: u32,
    pub sentdate: u32,
    pub size: u32,
    pub header_size: u32,
    pub content_offset: u64,
    pub cache_offset: u64,
    pub last_updated: u32,
    pub system_flags: u32,
    pub user_flags: [u32; USER_FLAG_WORDS],
}

impl IndexRecord {
    pub fn has_flag(&self, flag: u32) -> bool {
        self.system_flags & flag != 0
    }

    pub fn encode(&self) -> [u8; INDEX_RECORD_SIZE] {
        let mut buf = [0u8; INDEX_RECORD_SIZE];
        buf[0..4].copy_from_slice(&self.uid.to_be_bytes());
        buf[4..8].copy_from_slice(&self.internaldate.to_be_bytes());
        buf[8..12].copy_from_slice(&self.sentdate.to_be_bytes());
        buf[12..16].copy_from_slice(&self.size.to_be_bytes());
        buf[16..20].copy_from_slice(&self.header_size.to_be_bytes());
        buf[20..28].copy_from_slice(&self.content_offset.to_be_bytes());
        buf[28..36].copy_from_slice(&self.cache_offset.to_be_bytes());
        buf[36..40].copy_from_slice(&self.last_updated.to_be_bytes());
        buf[40..44].copy_from_slice(&self.system_flags.to_be_bytes());
        for (i, word) in self.user_flags.iter().enumerate() {
            let off = 44 + i * 4;
            buf[off..off + 4].copy_from_slice(&word.to_be_bytes());
        }
        buf
    }

    pub fn decode(buf: &[u8]) -> Result<Self, FormatError> {
        if buf.len() < INDEX_RECORD_SIZE {
            return Err(FormatError::Truncated {
                what: "index record",
                need: INDEX_RECORD_SIZE,
                have: buf.len(),
            });
        }
        let mut user_flags = [0u32; USER_FLAG_WORDS];
        for (i, word) in user_flags.iter_mut().enumerate() {
            *word = read_u32(buf, 44 + i * 4);
        }
        Ok(IndexRecord {
            uid: read_u32(buf, 0),
            internaldate: read_u32(buf, 4),
            sentdate: read_u32(buf, 8),
            size: read_u32(buf, 12),
            header_size: read_u32(buf, 16),
            content_offset: read_u64(buf, 20),
            cache_offset: read_u64(buf, 28),
            last_updated: read_u32(buf, 36),
            system_flags: read_u32(buf, 40),
            user_flags,
        })
    }
}
