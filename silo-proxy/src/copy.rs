//! Cross-server COPY: when the destination mailbox lives on a
//! different back end than the source, there is no single-server COPY
//! command to issue. The proxy does it itself — read the message
//! straight off the source mailbox's spool (it's local, so no FETCH
//! round trip is needed) and `APPEND` it to the destination over a
//! pooled connection, preserving flags and internaldate — and rewrites
//! the `APPENDUID` the destination reports into the `COPYUID` the
//! client actually asked for.

use std::fs;

use chrono::{TimeZone, Utc};

use silo_store::{IndexRecord, Mailbox, SpoolPaths, FLAG_ANSWERED, FLAG_DELETED, FLAG_DRAFT, FLAG_FLAGGED};

use crate::literal::to_sync;
use crate::pool::BackendConn;

#[derive(Debug, thiserror::Error)]
pub enum CrossCopyError {
    #[error("i/o error reading source message: {0}")]
    Io(#[from] std::io::Error),
    #[error("back end connection error: {0}")]
    Backend(String),
    #[error("back end rejected the APPEND: {0}")]
    Rejected(String),
    #[error("could not parse APPENDUID out of the back end's response")]
    NoAppendUid,
}

/// `COPYUID <uidvalidity> <source-uid> <dest-uid>`, the response the
/// client expects in place of a same-server COPY's tagged OK.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CopyUid {
    pub uidvalidity: u32,
    pub source_uid: u32,
    pub dest_uid: u32,
}

/// Copies one message from `source` (a mailbox this proxy has open
/// locally) to `dest_mailbox` over `conn`, an already-authenticated
/// connection to the destination's back end.
pub async fn copy_one(
    paths: &SpoolPaths,
    source: &Mailbox,
    record: &IndexRecord,
    conn: &mut BackendConn,
    dest_mailbox: &str,
) -> Result<CopyUid, CrossCopyError> {
    let body = fs::read(paths.message_path(source.internal_name(), record.uid))?;

    let command = format!(
        "PX1 APPEND {dest_mailbox} ({flags}) \"{date}\" {{{len}}}",
        flags = flag_names(record).join(" "),
        date = format_internaldate(record.internaldate),
        len = body.len(),
    );
    conn.send_line(&to_sync(&command))
        .await
        .map_err(|e| CrossCopyError::Backend(e.to_string()))?;

    let continuation = conn
        .read_line()
        .await
        .map_err(|e| CrossCopyError::Backend(e.to_string()))?;
    if !continuation.starts_with('+') {
        return Err(CrossCopyError::Rejected(continuation));
    }

    conn.send_raw(&body)
        .await
        .map_err(|e| CrossCopyError::Backend(e.to_string()))?;
    conn.send_raw(b"\r\n")
        .await
        .map_err(|e| CrossCopyError::Backend(e.to_string()))?;

    let response = conn
        .read_line()
        .await
        .map_err(|e| CrossCopyError::Backend(e.to_string()))?;
    if !response.contains("OK") {
        return Err(CrossCopyError::Rejected(response));
    }

    let (uidvalidity, dest_uid) = parse_appenduid(&response).ok_or(CrossCopyError::NoAppendUid)?;
    Ok(CopyUid {
        uidvalidity,
        source_uid: record.uid,
        dest_uid,
    })
}

fn flag_names(record: &IndexRecord) -> Vec<&'static str> {
    let mut flags = Vec::new();
    if record.has_flag(FLAG_ANSWERED) {
        flags.push("\\Answered");
    }
    if record.has_flag(FLAG_FLAGGED) {
        flags.push("\\Flagged");
    }
    if record.has_flag(FLAG_DELETED) {
        flags.push("\\Deleted");
    }
    if record.has_flag(FLAG_DRAFT) {
        flags.push("\\Draft");
    }
    flags
}

fn format_internaldate(unix_time: u32) -> String {
    Utc.timestamp_opt(unix_time as i64, 0)
        .single()
        .map(|dt| dt.format("%d-%b-%Y %H:%M:%S +0000").to_string())
        .unwrap_or_default()
}

/// Pulls `<uidvalidity> <uid>` out of a response containing
/// `[APPENDUID <uidvalidity> <uid>]`.
fn parse_appenduid(response: &str) -> Option<(u32, u32)> {
    let start = response.find("APPENDUID")? + "APPENDUID".len();
    let rest = response[start..].trim_start();
    let mut parts = rest.split(|c: char| c.is_whitespace() || c == ']');
    let uidvalidity: u32 = parts.next()?.parse().ok()?;
    let uid: u32 = parts.next()?.parse().ok()?;
    Some((uidvalidity, uid))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn appenduid_is_extracted_from_a_response_line() {
        let line = "PX1 OK [APPENDUID 1700000000 42] APPEND completed\r\n";
        assert_eq!(parse_appenduid(line), Some((1_700_000_000, 42)));
    }

    #[test]
    fn missing_appenduid_is_none() {
        assert_eq!(parse_appenduid("PX1 OK APPEND completed\r\n"), None);
    }

    #[test]
    fn internaldate_matches_imap_format() {
        assert_eq!(format_internaldate(1_700_000_000), "14-Nov-2023 22:13:20 +0000");
    }

    #[test]
    fn flag_names_lists_every_set_system_flag() {
        let record = IndexRecord {
            uid: 1,
            internaldate: 0,
            sentdate: 0,
            size: 0,
            header_size: 0,
            content_offset: 0,
            cache_offset: 0,
            last_updated: 0,
            system_flags: FLAG_ANSWERED | FLAG_DELETED,
            user_flags: [0; 4],
        };
        assert_eq!(flag_names(&record), vec!["\\Answered", "\\Deleted"]);
    }
}
