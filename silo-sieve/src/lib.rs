//! Evaluates a pre-parsed Sieve instruction tree against a message
//! environment, producing an ordered action list. Building the
//! instruction tree from Sieve source text is out of scope for this
//! crate — callers construct [`Command`] trees directly (typically
//! deserialized from a compiled form stored alongside the user's
//! mailbox).

use thiserror::Error;
use tracing::warn;

/// How a string test compares its target against the candidate
/// values.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MatchKind {
    Is,
    Contains,
    Matches,
}

/// Which part of an address a test inspects.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AddressPart {
    All,
    LocalPart,
    Domain,
}

/// A leaf or combinator test from the base Sieve test set.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Test {
    Header {
        names: Vec<String>,
        kind: MatchKind,
        values: Vec<String>,
    },
    Address {
        header: String,
        part: AddressPart,
        kind: MatchKind,
        values: Vec<String>,
    },
    Envelope {
        part: AddressPart,
        name: String,
        kind: MatchKind,
        values: Vec<String>,
    },
    Size {
        over: bool,
        limit: u64,
    },
    Exists(Vec<String>),
    AnyOf(Vec<Test>),
    AllOf(Vec<Test>),
    Not(Box<Test>),
    True,
    False,
}

/// One action a Sieve script can request. Mirrors the base actions
/// plus the `imapflags`/`vacation`/`notify` extensions.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Action {
    Keep { flags: Vec<String>, copy: bool },
    FileInto { mailbox: String, flags: Vec<String>, copy: bool },
    Redirect { address: String, copy: bool },
    Reject { reason: String },
    Discard,
    Vacation {
        address: Option<String>,
        from: Option<String>,
        subject: Option<String>,
        body: String,
        days: u32,
        mime: bool,
        handle: Option<String>,
    },
    SetFlag(Vec<String>),
    AddFlag(Vec<String>),
    RemoveFlag(Vec<String>),
    Mark,
    Unmark,
    Notify {
        method: String,
        id: Option<String>,
        options: Vec<String>,
        priority: Option<String>,
        message: Option<String>,
    },
    Denotify {
        matches: Option<String>,
        priority: Option<String>,
    },
}

impl Action {
    /// `true` if this action delivers, forwards, or rewrites the
    /// message — the set `Reject` may not coexist with.
    fn delivers_or_rewrites(&self) -> bool {
        matches!(
            self,
            Action::Keep { .. }
                | Action::FileInto { .. }
                | Action::Redirect { .. }
                | Action::Vacation { .. }
                | Action::SetFlag(_)
                | Action::AddFlag(_)
                | Action::RemoveFlag(_)
                | Action::Mark
                | Action::Unmark
        )
    }

    fn is_reject(&self) -> bool {
        matches!(self, Action::Reject { .. })
    }

    fn is_vacation(&self) -> bool {
        matches!(self, Action::Vacation { .. })
    }
}

/// One statement in the instruction tree: either a conditional with
/// an ordered `if`/`elsif`/`else` branch list, or a leaf action.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Command {
    If {
        branches: Vec<(Test, Vec<Command>)>,
        otherwise: Vec<Command>,
    },
    Do(Action),
}

#[derive(Debug, Error)]
pub enum SieveError {
    #[error("action {new:?} conflicts with a prior {existing:?} action")]
    ActionConflict { existing: &'static str, new: &'static str },

    #[error("vacation action may appear at most once in a script")]
    DuplicateVacation,
}

/// Everything the evaluator needs to know about the message and
/// recipient being filtered. Implemented by the delivery pipeline
/// against its in-flight message and envelope state.
pub trait Environment {
    /// Header values (already split on commas for multi-valued
    /// headers), in file order, lowercased-name lookup.
    fn header(&self, name: &str) -> Vec<&str>;
    fn size(&self) -> u64;
    /// Envelope `from`/`to` (the two names Sieve's `envelope` test
    /// exposes).
    fn envelope(&self, name: &str) -> Option<&str>;
}

/// Runs `program` against `env`, returning the ordered action list.
/// Logs and continues past any `if` branch whose test cannot be
/// evaluated usefully (no-op), matching Sieve's error-tolerant
/// execution model; a true action conflict aborts with `Err`, which
/// callers handle with a fallback `Keep` into `INBOX`.
pub fn evaluate(program: &[Command], env: &dyn Environment) -> Result<Vec<Action>, SieveError> {
    let mut actions = Vec::new();
    run_block(program, env, &mut actions)?;
    Ok(actions)
}

fn run_block(
    block: &[Command],
    env: &dyn Environment,
    actions: &mut Vec<Action>,
) -> Result<(), SieveError> {
    for command in block {
        match command {
            Command::Do(action) => push_action(actions, action.clone())?,
            Command::If { branches, otherwise } => {
                let mut matched = false;
                for (test, body) in branches {
                    if eval_test(test, env) {
                        run_block(body, env, actions)?;
                        matched = true;
                        break;
                    }
                }
                if !matched {
                    run_block(otherwise, env, actions)?;
                }
            }
        }
    }
    Ok(())
}

fn push_action(actions: &mut Vec<Action>, action: Action) -> Result<(), SieveError> {
    let has_reject = actions.iter().any(|a: &Action| a.is_reject());
    let has_delivering = actions.iter().any(|a: &Action| a.delivers_or_rewrites());

    if action.is_reject() && has_delivering {
        return Err(SieveError::ActionConflict {
            existing: "delivering action",
            new: "reject",
        });
    }
    if action.delivers_or_rewrites() && has_reject {
        return Err(SieveError::ActionConflict {
            existing: "reject",
            new: "delivering action",
        });
    }
    if action.is_vacation() && actions.iter().any(|a: &Action| a.is_vacation()) {
        return Err(SieveError::DuplicateVacation);
    }

    actions.push(action);
    Ok(())
}

fn eval_test(test: &Test, env: &dyn Environment) -> bool {
    match test {
        Test::True => true,
        Test::False => false,
        Test::Not(inner) => !eval_test(inner, env),
        Test::AnyOf(tests) => tests.iter().any(|t| eval_test(t, env)),
        Test::AllOf(tests) => tests.iter().all(|t| eval_test(t, env)),
        Test::Exists(names) => names.iter().all(|name| !env.header(name).is_empty()),
        Test::Size { over, limit } => {
            if *over {
                env.size() > *limit
            } else {
                env.size() < *limit
            }
        }
        Test::Header { names, kind, values } => names
            .iter()
            .flat_map(|name| env.header(name))
            .any(|candidate| values.iter().any(|v| string_test(candidate, v, *kind))),
        Test::Address { header, part, kind, values } => env
            .header(header)
            .into_iter()
            .filter_map(|raw| address_part(raw, *part))
            .any(|candidate| values.iter().any(|v| string_test(&candidate, v, *kind))),
        Test::Envelope { part, name, kind, values } => match env.envelope(name) {
            Some(raw) => match address_part(raw, *part) {
                Some(candidate) => {
                    values.iter().any(|v| string_test(&candidate, v, *kind))
                }
                None => false,
            },
            None => false,
        },
    }
}

fn address_part(raw: &str, part: AddressPart) -> Option<String> {
    let addr = raw.trim();
    match part {
        AddressPart::All => Some(addr.to_string()),
        AddressPart::LocalPart => addr.split_once('@').map(|(local, _)| local.to_string()),
        AddressPart::Domain => addr.split_once('@').map(|(_, domain)| domain.to_string()),
    }
}

fn string_test(candidate: &str, value: &str, kind: MatchKind) -> bool {
    match kind {
        MatchKind::Is => candidate.eq_ignore_ascii_case(value),
        MatchKind::Contains => candidate.to_ascii_lowercase().contains(&value.to_ascii_lowercase()),
        MatchKind::Matches => glob_match(&candidate.to_ascii_lowercase(), &value.to_ascii_lowercase()),
    }
}

/// `*`/`?` glob matching, the wildcard grammar `:matches` uses. No
/// character classes — Sieve's base comparator doesn't need them.
fn glob_match(text: &str, pattern: &str) -> bool {
    let text: Vec<char> = text.chars().collect();
    let pattern: Vec<char> = pattern.chars().collect();
    glob_match_at(&text, &pattern)
}

fn glob_match_at(text: &[char], pattern: &[char]) -> bool {
    match pattern.first() {
        None => text.is_empty(),
        Some('*') => {
            glob_match_at(text, &pattern[1..])
                || (!text.is_empty() && glob_match_at(&text[1..], pattern))
        }
        Some('?') => !text.is_empty() && glob_match_at(&text[1..], &pattern[1..]),
        Some(c) => text.first() == Some(c) && glob_match_at(&text[1..], &pattern[1..]),
    }
}

/// Logged in place of aborting delivery, per Sieve's error-tolerant
/// execution model: a script that fails to parse or fails mid-run
/// still lets the message through via a fallback Keep.
pub fn log_parse_error(line: u32, message: &str) {
    warn!(line, message, "sieve parse error");
}

pub fn log_execute_error(line: u32, message: &str) {
    warn!(line, message, "sieve execute error");
}
