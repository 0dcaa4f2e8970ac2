//! Internal/external mailbox name resolution and spool hashing.
//!
//! Internally, every mailbox name uses `.` as its hierarchy separator
//! (`user.alice.Drafts`). Externally, a deployment may expose either
//! that same separator or `/` (the "unix hierarchy separator"); when it
//! does, literal `.` characters in a name must round-trip, so they are
//! escaped to [`DOT_CHAR`] on the way in and restored on the way out.

use thiserror::Error;

/// A control character that can never appear in a client-supplied
/// external name, used to escape literal `.` characters when the
/// external separator is `/`.
pub const DOT_CHAR: char = '\u{1e}';

const USER_PREFIX: &str = "user";
const SHARED_PREFIX: &str = "shared";
const MAX_MAILBOX_NAME: usize = 490;

/// Names that can never denote a real mailbox, independent of charset
/// validity: the empty name, control characters, a bare path
/// separator, a name beginning or ending with `.`, a run of `..`, and
/// the bare word `user` (reserved as the personal-namespace root).
const DENYLIST: &[&str] = &["", "user"];

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HierSep {
    Dot,
    Slash,
}

impl HierSep {
    fn as_char(self) -> char {
        match self {
            HierSep::Dot => '.',
            HierSep::Slash => '/',
        }
    }
}

#[derive(Debug, Clone, Copy)]
pub struct Namespace {
    pub external_sep: HierSep,
}

impl Default for Namespace {
    fn default() -> Self {
        Namespace {
            external_sep: HierSep::Dot,
        }
    }
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum NameError {
    #[error("mailbox name is empty")]
    Empty,
    #[error("mailbox name exceeds the {0}-byte limit")]
    TooLong(usize),
    #[error("mailbox name contains a disallowed character")]
    BadCharacter,
    #[error("mailbox name matches a denylisted pattern")]
    Denylisted,
    #[error("name requires a userid but none was supplied")]
    MissingUserid,
}

/// Classification of an internal mailbox name's namespace.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Namespace_ {
    /// `user.<id>` or `user.<id>.<...>` — the owning user's personal tree.
    Personal,
    /// `user.<id>.<...>` belonging to someone other than the caller.
    OtherUsers,
    /// Any other top-level name — the shared namespace.
    Shared,
}

/// Validate `name` (an internal, dot-separated name) against the
/// denylist and the allowed-character set. Every internal name must
/// pass this before any filesystem operation is attempted on it.
pub fn validate(name: &str) -> Result<(), NameError> {
    if name.is_empty() {
        return Err(NameError::Empty);
    }
    if name.len() > MAX_MAILBOX_NAME {
        return Err(NameError::TooLong(MAX_MAILBOX_NAME));
    }
    if DENYLIST.contains(&name) {
        return Err(NameError::Denylisted);
    }
    if name.starts_with('.') || name.ends_with('.') || name.contains("..") {
        return Err(NameError::Denylisted);
    }
    for c in name.chars() {
        if (c.is_control() && c != DOT_CHAR) || c == '/' || c == '*' || c == '%' {
            return Err(NameError::BadCharacter);
        }
    }
    Ok(())
}

/// Convert a client-supplied external name to its internal form.
/// `userid` is the identity of the connected user, used to resolve a
/// bare `INBOX` to `user.<userid>`.
pub fn to_internal(
    ns: &Namespace,
    name: &str,
    userid: Option<&str>,
) -> Result<String, NameError> {
    if name.is_empty() {
        return Err(NameError::Empty);
    }

    let unescaped = name;

    let internal = if unescaped.eq_ignore_ascii_case("inbox")
        || unescaped
            .to_ascii_lowercase()
            .starts_with(&format!("inbox{}", ns.external_sep.as_char()))
    {
        let userid = userid.ok_or(NameError::MissingUserid)?;
        let rest = if unescaped.len() > 5 {
            &unescaped[6..] // skip "INBOX" and the one-byte separator
        } else {
            ""
        };
        join("user", userid, rest, ns)
    } else if let Some(rest) = strip_prefix_component(&unescaped, SHARED_PREFIX, ns) {
        convert_sep(ns, rest)
    } else if let Some(rest) = strip_prefix_component(&unescaped, USER_PREFIX, ns) {
        let mut parts = rest.splitn(2, ns.external_sep.as_char());
        let owner = parts.next().unwrap_or("");
        let tail = parts.next().unwrap_or("");
        join("user", owner, tail, ns)
    } else {
        convert_sep(ns, &unescaped)
    };

    validate(&internal)?;
    Ok(internal)
}

/// Build `"<prefix>.<mid><.converted-tail>"`, omitting the tail
/// separator entirely when `tail` is empty.
fn join(prefix: &str, mid: &str, tail: &str, ns: &Namespace) -> String {
    if tail.is_empty() {
        format!("{}.{}", prefix, mid)
    } else {
        format!("{}.{}.{}", prefix, mid, convert_sep(ns, tail))
    }
}

/// Convert an internal dotted name back to the client-facing external
/// form, restoring the configured separator and un-escaping any
/// [`DOT_CHAR`] sentinels.
pub fn to_external(ns: &Namespace, internal: &str, userid: Option<&str>) -> String {
    let sep = ns.external_sep.as_char();

    // `tail_after(owner)` strips "user.<owner>" and its following
    // separator, returning `Some("")` for an exact match, `Some(tail)`
    // for a proper sub-mailbox, or `None` if `owner` isn't actually a
    // whole path component (e.g. "alice" against "user.alicesecret").
    let tail_after = |owner: &str| -> Option<&str> {
        let rest = internal.strip_prefix("user.")?.strip_prefix(owner)?;
        if rest.is_empty() {
            Some("")
        } else {
            rest.strip_prefix('.')
        }
    };

    if let Some(tail) = userid.and_then(tail_after) {
        if tail.is_empty() {
            "INBOX".to_string()
        } else {
            format!("INBOX{}{}", sep, convert_sep_back(ns, tail))
        }
    } else if let Some(rest) = internal.strip_prefix("user.") {
        let mut parts = rest.splitn(2, '.');
        let owner = parts.next().unwrap_or("");
        match parts.next() {
            Some(tail) => format!("user{}{}{}{}", sep, owner, sep, convert_sep_back(ns, tail)),
            None => format!("user{}{}", sep, owner),
        }
    } else {
        convert_sep_back(ns, internal)
    }
}

/// `true` iff `internal` names a mailbox owned by `userid`: it is
/// exactly `user.<userid>` or starts with `user.<userid>.`.
pub fn user_owns_mailbox(userid: &str, internal: &str) -> bool {
    let prefix = format!("user.{}", userid);
    internal == prefix || internal.starts_with(&format!("{}.", prefix))
}

/// Classify an internal name's namespace relative to `userid`.
pub fn classify(userid: &str, internal: &str) -> Namespace_ {
    if let Some(rest) = internal.strip_prefix("user.") {
        let owner = rest.split('.').next().unwrap_or(rest);
        if owner == userid {
            Namespace_::Personal
        } else {
            Namespace_::OtherUsers
        }
    } else {
        Namespace_::Shared
    }
}

/// Deterministically choose a single-character spool bucket for
/// `internal`, from the first character of its first hierarchy
/// component after the `user.` prefix (if any). Spreads mailbox
/// directories for a large install across subdirectories instead of
/// one flat directory.
pub fn hash_mbox(internal: &str) -> char {
    let significant = internal
        .strip_prefix("user.")
        .unwrap_or(internal)
        .chars()
        .next()
        .unwrap_or('q');
    significant.to_ascii_lowercase()
}

fn strip_prefix_component<'a>(name: &'a str, prefix: &str, ns: &Namespace) -> Option<&'a str> {
    let sep = ns.external_sep.as_char();
    if let Some(rest) = name.strip_prefix(prefix) {
        if rest.is_empty() {
            return Some("");
        }
        if rest.starts_with(sep) {
            return Some(&rest[sep.len_utf8()..]);
        }
    }
    None
}

/// External hierarchy separators and literal dots -> internal dots and
/// [`DOT_CHAR`] escapes. A no-op when the external separator already
/// is `.`.
fn convert_sep(ns: &Namespace, s: &str) -> String {
    match ns.external_sep {
        HierSep::Dot => s.to_string(),
        HierSep::Slash => s
            .chars()
            .map(|c| match c {
                '/' => '.',
                '.' => DOT_CHAR,
                other => other,
            })
            .collect(),
    }
}

/// The inverse of [`convert_sep`]: internal dots and [`DOT_CHAR`]
/// escapes -> the external hierarchy separator and literal dots.
fn convert_sep_back(ns: &Namespace, internal_tail: &str) -> String {
    match ns.external_sep {
        HierSep::Dot => internal_tail.to_string(),
        HierSep::Slash => internal_tail
            .chars()
            .map(|c| match c {
                '.' => '/',
                c if c == DOT_CHAR => '.',
                other => other,
            })
            .collect(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn inbox_maps_to_personal_user_tree() {
        let ns = Namespace::default();
        assert_eq!(
            to_internal(&ns, "INBOX", Some("alice")).unwrap(),
            "user.alice"
        );
        assert_eq!(
            to_internal(&ns, "INBOX.Drafts", Some("alice")).unwrap(),
            "user.alice.Drafts"
        );
    }

    #[test]
    fn inbox_without_userid_is_an_error() {
        let ns = Namespace::default();
        assert_eq!(
            to_internal(&ns, "INBOX", None),
            Err(NameError::MissingUserid)
        );
    }

    #[test]
    fn user_prefixed_name_maps_to_other_users_tree() {
        let ns = Namespace::default();
        assert_eq!(
            to_internal(&ns, "user.bob.Archive", Some("alice")).unwrap(),
            "user.bob.Archive"
        );
    }

    #[test]
    fn shared_prefixed_name_drops_the_shared_marker() {
        let ns = Namespace::default();
        assert_eq!(
            to_internal(&ns, "shared.Lists.rust", Some("alice")).unwrap(),
            "Lists.rust"
        );
    }

    #[test]
    fn to_external_restores_inbox_for_owner() {
        let ns = Namespace::default();
        assert_eq!(to_external(&ns, "user.alice", Some("alice")), "INBOX");
        assert_eq!(
            to_external(&ns, "user.alice.Drafts", Some("alice")),
            "INBOX.Drafts"
        );
        assert_eq!(
            to_external(&ns, "user.bob.Archive", Some("alice")),
            "user.bob.Archive"
        );
    }

    #[test]
    fn slash_separator_escapes_literal_dots() {
        let ns = Namespace {
            external_sep: HierSep::Slash,
        };
        let internal = to_internal(&ns, "INBOX/a.b/c", Some("alice")).unwrap();
        assert_eq!(internal, format!("user.alice.a{}b.c", DOT_CHAR));
        assert_eq!(to_external(&ns, &internal, Some("alice")), "INBOX/a.b/c");
    }

    #[test]
    fn user_owns_mailbox_is_prefix_bounded() {
        assert!(user_owns_mailbox("alice", "user.alice"));
        assert!(user_owns_mailbox("alice", "user.alice.Drafts"));
        assert!(!user_owns_mailbox("alice", "user.alicesecret"));
        assert!(!user_owns_mailbox("alice", "user.bob"));
    }

    #[test]
    fn classify_distinguishes_personal_other_and_shared() {
        assert_eq!(classify("alice", "user.alice.Drafts"), Namespace_::Personal);
        assert_eq!(classify("alice", "user.bob"), Namespace_::OtherUsers);
        assert_eq!(classify("alice", "Lists.rust"), Namespace_::Shared);
    }

    #[test]
    fn validate_rejects_denylisted_and_malformed_names() {
        assert_eq!(validate(""), Err(NameError::Empty));
        assert_eq!(validate("user"), Err(NameError::Denylisted));
        assert_eq!(validate(".leading"), Err(NameError::Denylisted));
        assert_eq!(validate("trailing."), Err(NameError::Denylisted));
        assert_eq!(validate("a..b"), Err(NameError::Denylisted));
        assert_eq!(validate("a/b"), Err(NameError::BadCharacter));
        assert!(validate("user.alice.Drafts").is_ok());
    }

    #[test]
    fn hash_mbox_picks_first_significant_char() {
        assert_eq!(hash_mbox("user.alice.Drafts"), 'a');
        assert_eq!(hash_mbox("Lists.rust"), 'l');
    }
}
