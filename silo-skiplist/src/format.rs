//! On-disk record layout. One file per table: a fixed header, a DUMMY
//! head node, then an append-only log of ADD / DELETE / COMMIT records.
//! Forward-pointer slots inside an already-written node are patched in
//! place (fixed width, 8 bytes each); everything else is append-only.

use std::convert::TryInto;

pub const MAGIC: &[u8; 16] = b"silo-skiplist-1\0";
pub const VERSION: u32 = 1;
pub const MAX_LEVEL: usize = 24;

pub const HEADER_SIZE: u64 = 16 + 4 + 4 + 4 + 4 + 8 + 8;
pub const DUMMY_OFFSET: u64 = HEADER_SIZE;

#[derive(Debug, Clone, Copy)]
pub struct Header {
    pub version: u32,
    pub maxlevel: u32,
    pub curlevel: u32,
    pub listsize: u32,
    pub logstart: u64,
    pub last_recovery: u64,
}

impl Header {
    pub fn encode(&self) -> [u8; HEADER_SIZE as usize] {
        let mut buf = [0u8; HEADER_SIZE as usize];
        buf[0..16].copy_from_slice(MAGIC);
        buf[16..20].copy_from_slice(&self.version.to_be_bytes());
        buf[20..24].copy_from_slice(&self.maxlevel.to_be_bytes());
        buf[24..28].copy_from_slice(&self.curlevel.to_be_bytes());
        buf[28..32].copy_from_slice(&self.listsize.to_be_bytes());
        buf[32..40].copy_from_slice(&self.logstart.to_be_bytes());
        buf[40..48].copy_from_slice(&self.last_recovery.to_be_bytes());
        buf
    }

    pub fn decode(buf: &[u8]) -> Result<Self, FormatError> {
        if buf.len() < HEADER_SIZE as usize {
            return Err(FormatError::Truncated);
        }
        if &buf[0..16] != MAGIC {
            return Err(FormatError::BadMagic);
        }
        Ok(Self {
            version: u32::from_be_bytes(buf[16..20].try_into().unwrap()),
            maxlevel: u32::from_be_bytes(buf[20..24].try_into().unwrap()),
            curlevel: u32::from_be_bytes(buf[24..28].try_into().unwrap()),
            listsize: u32::from_be_bytes(buf[28..32].try_into().unwrap()),
            logstart: u64::from_be_bytes(buf[32..40].try_into().unwrap()),
            last_recovery: u64::from_be_bytes(buf[40..48].try_into().unwrap()),
        })
    }
}

#[derive(Debug, thiserror::Error)]
pub enum FormatError {
    #[error("file too short to hold a header")]
    Truncated,
    #[error("bad magic header")]
    BadMagic,
    #[error("unsupported record type byte {0}")]
    BadRecordType(u8),
    #[error("record extends past end of file")]
    RecordTruncated,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RecordType {
    Dummy,
    Add,
    /// A compacted node written out during a checkpoint; semantically
    /// identical to `Add` for traversal, distinguished only so a
    /// checkpoint's output is recognizable from a live transaction log.
    Inorder,
    Delete,
    Commit,
    /// Write-ahead record of an in-place forward-pointer patch: logged
    /// before the patch is applied, so recovery can restore the slot's
    /// pre-patch value if the transaction that made the patch never
    /// reaches a `COMMIT`. Needed because the patched slot itself often
    /// lives in an already-committed node and is never touched by the
    /// truncate-the-uncommitted-tail step.
    Patch,
}

impl RecordType {
    fn tag(self) -> u8 {
        match self {
            RecordType::Dummy => 1,
            RecordType::Add => 2,
            RecordType::Inorder => 3,
            RecordType::Delete => 4,
            RecordType::Commit => 5,
            RecordType::Patch => 6,
        }
    }

    fn from_tag(tag: u8) -> Result<Self, FormatError> {
        Ok(match tag {
            1 => RecordType::Dummy,
            2 => RecordType::Add,
            3 => RecordType::Inorder,
            4 => RecordType::Delete,
            5 => RecordType::Commit,
            6 => RecordType::Patch,
            other => return Err(FormatError::BadRecordType(other)),
        })
    }
}

/// A parsed view of a node record (`Dummy`/`Add`/`Inorder`): key, data,
/// and its forward-pointer array. `forward[i]` is the absolute file
/// offset of the next node at level `i`, or `0` for end-of-list.
#[derive(Debug, Clone)]
pub struct Node {
    pub rtype: RecordType,
    pub key: Vec<u8>,
    pub data: Vec<u8>,
    pub forward: Vec<u64>,
}

impl Node {
    pub fn level(&self) -> usize {
        self.forward.len()
    }

    /// Byte length of the encoded record.
    pub fn encoded_len(&self) -> u64 {
        (1 + 4 + self.key.len() + 4 + self.data.len() + 1 + 8 * self.forward.len()) as u64
    }

    pub fn encode(&self) -> Vec<u8> {
        let mut buf = Vec::with_capacity(self.encoded_len() as usize);
        buf.push(self.rtype.tag());
        buf.extend_from_slice(&(self.key.len() as u32).to_be_bytes());
        buf.extend_from_slice(&self.key);
        buf.extend_from_slice(&(self.data.len() as u32).to_be_bytes());
        buf.extend_from_slice(&self.data);
        buf.push(self.forward.len() as u8);
        for p in &self.forward {
            buf.extend_from_slice(&p.to_be_bytes());
        }
        buf
    }

    /// Offset, relative to the start of the record, of forward pointer
    /// slot `level`. Used to patch a single 8-byte slot in place.
    pub fn forward_slot_offset(&self, level: usize) -> u64 {
        (1 + 4 + self.key.len() + 4 + self.data.len() + 1 + 8 * level) as u64
    }

    pub fn decode(buf: &[u8]) -> Result<(Self, u64), FormatError> {
        let mut pos = 0usize;
        if buf.len() < 1 {
            return Err(FormatError::RecordTruncated);
        }
        let rtype = RecordType::from_tag(buf[pos])?;
        pos += 1;
        let need = |end: usize| -> Result<(), FormatError> {
            if buf.len() < end {
                Err(FormatError::RecordTruncated)
            } else {
                Ok(())
            }
        };
        need(pos + 4)?;
        let key_len = u32::from_be_bytes(buf[pos..pos + 4].try_into().unwrap()) as usize;
        pos += 4;
        need(pos + key_len)?;
        let key = buf[pos..pos + key_len].to_vec();
        pos += key_len;
        need(pos + 4)?;
        let data_len = u32::from_be_bytes(buf[pos..pos + 4].try_into().unwrap()) as usize;
        pos += 4;
        need(pos + data_len)?;
        let data = buf[pos..pos + data_len].to_vec();
        pos += data_len;
        need(pos + 1)?;
        let level = buf[pos] as usize;
        pos += 1;
        need(pos + 8 * level)?;
        let mut forward = Vec::with_capacity(level);
        for i in 0..level {
            let off = pos + 8 * i;
            forward.push(u64::from_be_bytes(buf[off..off + 8].try_into().unwrap()));
        }
        pos += 8 * level;
        Ok((
            Node {
                rtype,
                key,
                data,
                forward,
            },
            pos as u64,
        ))
    }
}

/// A `DELETE` log record: marks `target` (the file offset of a node)
/// as logically removed. Kept purely for recovery/replay bookkeeping;
/// the splice of predecessor pointers happens in-place at delete time.
#[derive(Debug, Clone, Copy)]
pub struct DeleteRecord {
    pub target: u64,
}

impl DeleteRecord {
    pub const ENCODED_LEN: u64 = 1 + 8;

    pub fn encode(&self) -> [u8; Self::ENCODED_LEN as usize] {
        let mut buf = [0u8; Self::ENCODED_LEN as usize];
        buf[0] = RecordType::Delete.tag();
        buf[1..9].copy_from_slice(&self.target.to_be_bytes());
        buf
    }

    pub fn decode(buf: &[u8]) -> Result<Self, FormatError> {
        if buf.len() < Self::ENCODED_LEN as usize {
            return Err(FormatError::RecordTruncated);
        }
        if RecordType::from_tag(buf[0])? != RecordType::Delete {
            return Err(FormatError::BadRecordType(buf[0]));
        }
        Ok(DeleteRecord {
            target: u64::from_be_bytes(buf[1..9].try_into().unwrap()),
        })
    }
}

/// A write-ahead log of one in-place forward-pointer patch: `slot` is
/// the absolute file offset of the 8-byte pointer being overwritten,
/// `old` is the value it held immediately before the patch. Appended
/// before the patch is applied; recovery replays these in reverse
/// order, against the slot directly, to undo an uncommitted
/// transaction's splices that landed outside the truncated tail.
#[derive(Debug, Clone, Copy)]
pub struct PatchRecord {
    pub slot: u64,
    pub old: u64,
}

impl PatchRecord {
    pub const ENCODED_LEN: u64 = 1 + 8 + 8;

    pub fn encode(&self) -> [u8; Self::ENCODED_LEN as usize] {
        let mut buf = [0u8; Self::ENCODED_LEN as usize];
        buf[0] = RecordType::Patch.tag();
        buf[1..9].copy_from_slice(&self.slot.to_be_bytes());
        buf[9..17].copy_from_slice(&self.old.to_be_bytes());
        buf
    }

    pub fn decode(buf: &[u8]) -> Result<Self, FormatError> {
        if buf.len() < Self::ENCODED_LEN as usize {
            return Err(FormatError::RecordTruncated);
        }
        if RecordType::from_tag(buf[0])? != RecordType::Patch {
            return Err(FormatError::BadRecordType(buf[0]));
        }
        Ok(PatchRecord {
            slot: u64::from_be_bytes(buf[1..9].try_into().unwrap()),
            old: u64::from_be_bytes(buf[9..17].try_into().unwrap()),
        })
    }
}

pub const COMMIT_ENCODED_LEN: u64 = 1;

pub fn encode_commit() -> [u8; COMMIT_ENCODED_LEN as usize] {
    [RecordType::Commit.tag()]
}

/// Peek at just the record type tag at `buf[0]`, without decoding the
/// rest; callers use this to dispatch between node/delete/commit
/// decoding during a linear log scan.
pub fn peek_type(buf: &[u8]) -> Result<RecordType, FormatError> {
    if buf.is_empty() {
        return Err(FormatError::RecordTruncated);
    }
    RecordType::from_tag(buf[0])
}
