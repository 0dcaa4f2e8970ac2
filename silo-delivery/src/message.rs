//! The message and recipient shapes `dispatch_recipient` works on,
//! independent of whether they arrived over LMTP or the one-shot
//! `deliver` CLI.

use std::collections::BTreeMap;

/// One envelope recipient, already split into the parts Sieve tests
/// and mailbox resolution need.
#[derive(Debug, Clone)]
pub struct RecipientAddress {
    pub local_part: String,
    /// The `+detail` portion of `local+detail@domain`, if present.
    pub detail: Option<String>,
    pub domain: String,
    /// `-q`: this delivery may push the mailbox's quota root over its
    /// limit (a postmaster bounce, for instance). Independent of
    /// `suppress_duplicates` — conflating the two inverted the `-e`
    /// scenario, since passing `-q` alone used to silently disable
    /// dedup.
    pub ignore_quota: bool,
    /// `-e`: check and record this message's `Message-Id` in the
    /// duplicate-suppression table. Off by default, matching the
    /// reference LMTP daemon's `dupelim` opt-in.
    pub suppress_duplicates: bool,
}

impl RecipientAddress {
    pub fn parse(addr: &str, ignore_quota: bool, suppress_duplicates: bool) -> Self {
        let (local, domain) = addr.split_once('@').unwrap_or((addr, ""));
        let (local_part, detail) = match local.split_once('+') {
            Some((l, d)) => (l.to_string(), Some(d.to_string())),
            None => (local.to_string(), None),
        };
        RecipientAddress {
            local_part,
            detail,
            domain: domain.to_string(),
            ignore_quota,
            suppress_duplicates,
        }
    }
}

/// A message body plus the envelope and header metadata the delivery
/// pipeline needs, parsed once up front.
pub struct DeliveryMessage {
    pub return_path: Option<String>,
    pub body: Vec<u8>,
    pub size: u64,
    pub message_id: Option<String>,
    headers: BTreeMap<String, Vec<String>>,
}

impl DeliveryMessage {
    /// `body` is the full RFC-822 byte stream, dot-unstuffed and with
    /// bare LFs already canonicalized to CRLF by the caller (the LMTP
    /// `DATA` reader or the `deliver` CLI's stdin reader).
    pub fn new(return_path: Option<String>, body: Vec<u8>) -> Self {
        let headers = parse_headers(&body);
        let message_id = headers
            .get("message-id")
            .and_then(|v| v.first())
            .cloned()
            .or_else(|| headers.get("resent-message-id").and_then(|v| v.first()).cloned());
        let size = body.len() as u64;
        DeliveryMessage {
            return_path,
            body,
            size,
            message_id,
            headers,
        }
    }

    /// All values of header `name`, in the order they appear. Lookup
    /// is case-insensitive, per RFC 5322.
    pub fn header(&self, name: &str) -> Vec<&str> {
        self.headers
            .get(&name.to_ascii_lowercase())
            .map(|values| values.iter().map(String::as_str).collect())
            .unwrap_or_default()
    }

    /// The message with a synthesized `Return-Path:` header prepended,
    /// as `LOCAL_DELIVER`-style local delivery does before handing the
    /// bytes to the mailbox store.
    pub fn with_return_path_header(&self) -> Vec<u8> {
        let path = self.return_path.as_deref().unwrap_or("");
        let mut out = Vec::with_capacity(self.body.len() + path.len() + 16);
        out.extend_from_slice(format!("Return-Path: <{path}>\r\n").as_bytes());
        out.extend_from_slice(&self.body);
        out
    }
}

/// Split `body` into lowercased-name -> values, honoring RFC 5322
/// header folding (a continuation line starts with space or tab).
fn parse_headers(body: &[u8]) -> BTreeMap<String, Vec<String>> {
    let mut headers: BTreeMap<String, Vec<String>> = BTreeMap::new();
    let header_bytes = match find_header_end(body) {
        Some(end) => &body[..end],
        None => body,
    };
    let text = String::from_utf8_lossy(header_bytes);

    let mut name: Option<String> = None;
    let mut value = String::new();
    for line in text.split("\r\n") {
        if line.is_empty() {
            continue;
        }
        if (line.starts_with(' ') || line.starts_with('\t')) && name.is_some() {
            value.push(' ');
            value.push_str(line.trim());
            continue;
        }
        if let Some(n) = name.take() {
            headers.entry(n).or_default().push(value.trim().to_string());
        }
        match line.split_once(':') {
            Some((n, v)) => {
                name = Some(n.trim().to_ascii_lowercase());
                value = v.trim().to_string();
            }
            None => {
                name = None;
                value.clear();
            }
        }
    }
    if let Some(n) = name {
        headers.entry(n).or_default().push(value.trim().to_string());
    }
    headers
}

/// Rewrites any LF not preceded by a CR into CRLF. Applied once at the
/// transport boundary (LMTP `DATA`, or the `deliver` CLI's stdin
/// reader) so a client's line-ending mistakes don't surface as a
/// mailbox-format rejection further down the pipeline.
pub fn canonicalize_line_endings(body: &[u8]) -> Vec<u8> {
    let mut out = Vec::with_capacity(body.len());
    for (i, &b) in body.iter().enumerate() {
        if b == b'\n' && (i == 0 || body[i - 1] != b'\r') {
            out.push(b'\r');
        }
        out.push(b);
    }
    out
}

fn find_header_end(body: &[u8]) -> Option<usize> {
    let mut i = 0;
    while i + 1 < body.len() {
        if &body[i..i + 2] == b"\n\n" {
            return Some(i);
        }
        if i + 3 < body.len() && &body[i..i + 4] == b"\r\n\r\n" {
            return Some(i);
        }
        i += 1;
    }
    None
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn recipient_splits_detail_and_domain() {
        let addr = RecipientAddress::parse("alice+lists@example.com", false, false);
        assert_eq!(addr.local_part, "alice");
        assert_eq!(addr.detail.as_deref(), Some("lists"));
        assert_eq!(addr.domain, "example.com");
    }

    #[test]
    fn recipient_without_detail_has_none() {
        let addr = RecipientAddress::parse("alice@example.com", false, false);
        assert_eq!(addr.local_part, "alice");
        assert_eq!(addr.detail, None);
    }

    #[test]
    fn message_id_is_extracted_case_insensitively() {
        let body = b"From: a@x\r\nMessage-Id: <abc@x>\r\nSubject: hi\r\n\r\nbody\r\n".to_vec();
        let msg = DeliveryMessage::new(Some("a@x".into()), body);
        assert_eq!(msg.message_id.as_deref(), Some("<abc@x>"));
    }

    #[test]
    fn folded_header_continuation_is_joined() {
        let body = b"Subject: hello\r\n world\r\nFrom: a@x\r\n\r\nbody\r\n".to_vec();
        let msg = DeliveryMessage::new(None, body);
        assert_eq!(msg.header("subject"), vec!["hello world"]);
    }

    #[test]
    fn repeated_headers_are_all_kept() {
        let body = b"Received: one\r\nReceived: two\r\nFrom: a@x\r\n\r\nbody\r\n".to_vec();
        let msg = DeliveryMessage::new(None, body);
        assert_eq!(msg.header("received"), vec!["one", "two"]);
    }

    #[test]
    fn canonicalize_line_endings_fixes_bare_lf_only() {
        let input = b"a\r\nb\nc\r\n";
        let out = canonicalize_line_endings(input);
        assert_eq!(out, b"a\r\nb\r\nc\r\n");
    }

    #[test]
    fn with_return_path_header_prepends_it() {
        let body = b"From: a@x\r\n\r\nbody\r\n".to_vec();
        let msg = DeliveryMessage::new(Some("a@x".into()), body);
        let out = msg.with_return_path_header();
        assert!(out.starts_with(b"Return-Path: <a@x>\r\n"));
    }
}
