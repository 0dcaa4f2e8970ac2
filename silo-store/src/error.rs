//! The closed error taxonomy surfaced at every store-crate boundary.
//! Other crates in this workspace propagate `anyhow::Error` and, at
//! their own boundary (an LMTP status line, a CLI exit code),
//! `downcast_ref::<MailboxError>()` to recover a specific cause.

use thiserror::Error;

#[derive(Debug, Error)]
pub enum MailboxError {
    #[error("i/o error: {0}")]
    Io(#[from] std::io::Error),

    #[error("permission denied")]
    PermissionDenied,

    #[error("mailbox is corrupt: {0}")]
    MailboxBadFormat(String),

    #[error("operation not supported on this mailbox")]
    MailboxNotSupported,

    #[error("quota exceeded")]
    QuotaExceeded,

    #[error("message contains a NUL byte")]
    MessageContainsNul,

    #[error("message contains a bare newline")]
    MessageContainsBareNewline,

    #[error("message contains an unencoded 8-bit byte")]
    MessageContains8bit,

    #[error("message has a malformed header: {0}")]
    MessageBadHeader(String),

    #[error("message has no blank line separating header and body")]
    MessageNoBlankLine,

    #[error("mailbox does not exist")]
    MailboxNonexistent,

    #[error("mailbox already exists")]
    MailboxExists,

    #[error("server unavailable")]
    ServerUnavailable,

    #[error("invalid identifier: {0}")]
    InvalidIdentifier(String),

    #[error("user flag table is full")]
    UserFlagExhausted,

    /// Sentinel success value for code paths (notably Sieve's
    /// `Reject`/`Discard` actions) that need to thread a taxonomy
    /// value through the same `Result` as a real failure without
    /// being one.
    #[error("ok")]
    OkCompleted,
}

impl From<silo_skiplist::DbError> for MailboxError {
    fn from(err: silo_skiplist::DbError) -> Self {
        match err {
            silo_skiplist::DbError::StdIo(source) => MailboxError::Io(source),
            other => MailboxError::MailboxBadFormat(other.to_string()),
        }
    }
}

/// `sysexits`-style process exit code for this error, per the
/// `deliver` CLI's exit-code contract.
pub const EX_OK: i32 = 0;
pub const EX_DATAERR: i32 = 65;
pub const EX_NOUSER: i32 = 67;
pub const EX_SOFTWARE: i32 = 70;
pub const EX_TEMPFAIL: i32 = 75;
pub const EX_NOPERM: i32 = 77;
pub const EX_IOERR: i32 = 74;

impl MailboxError {
    pub fn exit_code(&self) -> i32 {
        match self {
            MailboxError::OkCompleted => EX_OK,
            MailboxError::Io(source) => io_exit_code(source),
            MailboxError::PermissionDenied => EX_NOPERM,
            MailboxError::MailboxBadFormat(_) => EX_TEMPFAIL,
            MailboxError::MailboxNotSupported => EX_SOFTWARE,
            MailboxError::QuotaExceeded => EX_TEMPFAIL,
            MailboxError::MessageContainsNul
            | MailboxError::MessageContainsBareNewline
            | MailboxError::MessageContains8bit
            | MailboxError::MessageBadHeader(_)
            | MailboxError::MessageNoBlankLine => EX_DATAERR,
            MailboxError::MailboxNonexistent => EX_NOUSER,
            MailboxError::MailboxExists => EX_SOFTWARE,
            MailboxError::ServerUnavailable => EX_TEMPFAIL,
            MailboxError::InvalidIdentifier(_) => EX_DATAERR,
            MailboxError::UserFlagExhausted => EX_TEMPFAIL,
        }
    }

    /// `true` for conditions a retry might resolve (disk full, quota,
    /// a backend that's momentarily unavailable) as opposed to a
    /// permanent rejection of the message itself.
    pub fn is_transient(&self) -> bool {
        self.exit_code() == EX_TEMPFAIL
    }
}

/// `EDQUOT`/`ENOSPC` are disk-full conditions dressed up as I/O
/// errors; §7 requires they map to a transient code rather than the
/// permanent `ioerr` a generic I/O failure gets.
fn io_exit_code(err: &std::io::Error) -> i32 {
    use nix::libc;
    match err.raw_os_error() {
        Some(code) if code == libc::ENOSPC || code == libc::EDQUOT => EX_TEMPFAIL,
        _ => EX_IOERR,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn quota_and_format_errors_are_transient() {
        assert!(MailboxError::QuotaExceeded.is_transient());
        assert!(MailboxError::MailboxBadFormat("bad magic".into()).is_transient());
        assert!(!MailboxError::MailboxNonexistent.is_transient());
    }

    #[test]
    fn enospc_maps_to_tempfail_not_ioerr() {
        let err = std::io::Error::from_raw_os_error(nix::libc::ENOSPC);
        assert_eq!(MailboxError::Io(err).exit_code(), EX_TEMPFAIL);
    }

    #[test]
    fn plain_io_error_maps_to_ioerr() {
        let err = std::io::Error::new(std::io::ErrorKind::Other, "disk melted");
        assert_eq!(MailboxError::Io(err).exit_code(), EX_IOERR);
    }
}
