//! Translates IMAP literal markers between the synchronizing `{N}`
//! form (the client waits for a `+ OK` continuation before sending the
//! literal bytes) and the non-synchronizing `{N+}` form (the client
//! sends them immediately). The proxy downgrades `{N+}` to `{N}` when
//! piping to a back end it isn't confident will accept the command —
//! it then has to relay the back end's continuation request itself —
//! and upgrades `{N}` to `{N+}` when it already knows the command will
//! succeed, to avoid the extra round trip.

/// Rewrites every trailing literal marker on `line` (an IMAP command
/// line with the CRLF already stripped) to non-synchronizing form.
pub fn to_nonsync(line: &str) -> String {
    rewrite_literals(line, true)
}

/// Rewrites every trailing literal marker on `line` to synchronizing
/// form.
pub fn to_sync(line: &str) -> String {
    rewrite_literals(line, false)
}

fn rewrite_literals(line: &str, nonsync: bool) -> String {
    match find_literal(line) {
        Some((start, end, len)) => {
            let marker = if nonsync {
                format!("{{{len}+}}")
            } else {
                format!("{{{len}}}")
            };
            format!("{}{}{}", &line[..start], marker, &line[end..])
        }
        None => line.to_string(),
    }
}

/// Finds the last `{<digits>}` or `{<digits>+}` in `line`, returning
/// its byte range and the parsed length. IMAP literals are only
/// meaningful at the end of a command line, so the last one found is
/// the one that matters even if an earlier argument happens to
/// contain brace characters.
fn find_literal(line: &str) -> Option<(usize, usize, u64)> {
    let open = line.rfind('{')?;
    let rest = &line[open + 1..];
    let close_rel = rest.find('}')?;
    let inner = &rest[..close_rel];
    let digits = inner.strip_suffix('+').unwrap_or(inner);
    if digits.is_empty() || !digits.bytes().all(|b| b.is_ascii_digit()) {
        return None;
    }
    let len: u64 = digits.parse().ok()?;
    Some((open, open + 1 + close_rel + 1, len))
}

/// `true` if `line` ends in a non-synchronizing literal marker.
pub fn is_nonsync(line: &str) -> bool {
    line.trim_end().ends_with("+}")
}
