//! Mailbox file set: the on-disk layout of one mailbox (header, index,
//! cache), per-quota-root usage tracking, per-user `\Seen` state, the
//! mailbox-list skiplist table, and single-instance message staging.

mod cache;
mod error;
mod format;
mod index;
mod mailbox;
mod mailboxlist;
mod paths;
mod quota;
mod seen;
mod single_instance;

pub use cache::CacheFile;
pub use error::{MailboxError, EX_DATAERR, EX_IOERR, EX_NOPERM, EX_NOUSER, EX_OK, EX_SOFTWARE, EX_TEMPFAIL};
pub use format::{
    FormatError, IndexHeader, IndexRecord, MailboxHeader, FLAG_ANSWERED, FLAG_DELETED,
    FLAG_DRAFT, FLAG_FLAGGED, INDEX_HEADER_SIZE, INDEX_RECORD_SIZE, MAX_USER_FLAGS,
};
pub use index::IndexFile;
pub use mailbox::Mailbox;
pub use mailboxlist::{MailboxEntry, MailboxList};
pub use paths::SpoolPaths;
pub use quota::QuotaFile;
pub use seen::{MailboxSeenState, SeenStore};
pub use single_instance::StagedMessage;
