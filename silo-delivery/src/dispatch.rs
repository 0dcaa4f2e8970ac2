//! The shared delivery pipeline: resolve a recipient to a mailbox,
//! check for a duplicate, run the user's Sieve script (if any), and
//! execute the resulting actions against the mailbox store. Both the
//! LMTP server and the one-shot `deliver` CLI drive this same function
//! so their behavior never drifts apart.

use silo_mboxname::Namespace;
use silo_sieve::{Action, Command, Environment};
use silo_store::{MailboxError, QuotaFile, SpoolPaths};

use crate::message::{DeliveryMessage, RecipientAddress};
use crate::outbound::MailTransport;

/// What happened to one recipient, independent of which front end is
/// reporting it.
#[derive(Debug)]
pub enum DeliveryOutcome {
    Delivered { mailbox: String, uid: u32 },
    Discarded,
    Rejected { reason: String },
    Failed(MailboxError),
}

impl DeliveryOutcome {
    /// The LMTP per-recipient status line this outcome maps to, per
    /// the failure taxonomy every recipient is evaluated against.
    pub fn lmtp_status(&self) -> (u16, &'static str, String) {
        match self {
            DeliveryOutcome::Delivered { mailbox, uid } => {
                (250, "2.1.5", format!("delivered to {mailbox} as UID {uid}"))
            }
            DeliveryOutcome::Discarded => (250, "2.1.5", "discarded".to_string()),
            DeliveryOutcome::Rejected { reason } => (550, "5.7.1", reason.clone()),
            DeliveryOutcome::Failed(err) => lmtp_status_for_error(err),
        }
    }

    /// The `sysexits` code the `deliver` CLI reports for this outcome.
    pub fn exit_code(&self) -> i32 {
        match self {
            DeliveryOutcome::Delivered { .. } | DeliveryOutcome::Discarded => silo_store::EX_OK,
            DeliveryOutcome::Rejected { .. } => silo_store::EX_DATAERR,
            DeliveryOutcome::Failed(err) => err.exit_code(),
        }
    }
}

fn lmtp_status_for_error(err: &MailboxError) -> (u16, &'static str, String) {
    match err {
        MailboxError::Io(_) => (451, "4.3.0", err.to_string()),
        MailboxError::PermissionDenied => (550, "5.7.1", err.to_string()),
        MailboxError::QuotaExceeded => (452, "4.2.2", err.to_string()),
        MailboxError::MailboxBadFormat(_) | MailboxError::MailboxNotSupported => {
            (451, "4.2.0", err.to_string())
        }
        MailboxError::MessageContainsNul
        | MailboxError::MessageContainsBareNewline
        | MailboxError::MessageContains8bit
        | MailboxError::MessageBadHeader(_)
        | MailboxError::MessageNoBlankLine => (554, "5.6.0", err.to_string()),
        MailboxError::MailboxNonexistent => (550, "5.1.1", "user unknown".to_string()),
        MailboxError::MailboxExists
        | MailboxError::ServerUnavailable
        | MailboxError::InvalidIdentifier(_)
        | MailboxError::UserFlagExhausted
        | MailboxError::OkCompleted => (451, "4.3.0", err.to_string()),
    }
}

/// The pieces of the store every call to [`dispatch_recipient`] needs.
/// Bundled so the function signature doesn't grow a parameter per
/// store concern. Recipient acceptance (does the mailbox exist, is it
/// over quota) is checked earlier, against the mailbox list, by the
/// caller — this context only needs what delivery itself touches.
pub struct DispatchContext<'a> {
    pub paths: &'a SpoolPaths,
    pub namespace: &'a Namespace,
    pub duplicates: &'a mut silo_duplicate::DuplicateTable,
    /// Where `Vacation`/`Redirect` hand messages off to leave the
    /// spool. `&dyn` rather than generic so `DispatchContext` stays
    /// object-shaped across the LMTP server's per-connection state and
    /// the `deliver` CLI's one-shot call.
    pub transport: &'a dyn MailTransport,
    /// Used as the domain part of a generated vacation reply's
    /// `Message-Id`.
    pub hostname: &'a str,
}

/// How long a delivered message's duplicate-suppression record stays
/// valid: three days, matching the window a retrying MTA is expected
/// to give up in.
const DUPLICATE_SUPPRESSION_WINDOW: u32 = 3 * 24 * 3600;

/// Scope for Sieve-generated auxiliary duplicate records (forward
/// trails, vacation replies) — distinct from the absolute-mailbox-name
/// scope plain delivery dedup uses, so a script-generated record never
/// collides with the mailbox's own delivery history.
fn sieve_scope(local_part: &str, tag: &str) -> String {
    format!(".{local_part}.sieve.{tag}")
}

struct MessageEnvironment<'a> {
    message: &'a DeliveryMessage,
    envelope_from: Option<&'a str>,
    envelope_to: &'a str,
}

impl<'a> Environment for MessageEnvironment<'a> {
    fn header(&self, name: &str) -> Vec<&str> {
        self.message.header(name)
    }

    fn size(&self) -> u64 {
        self.message.size
    }

    fn envelope(&self, name: &str) -> Option<&str> {
        match name {
            "from" => self.envelope_from,
            "to" => Some(self.envelope_to),
            _ => None,
        }
    }
}

/// Runs the full delivery pipeline for one recipient of one message.
/// `sieve_program` is `None` when the recipient has no active script,
/// in which case the recipient's default is a plain `Keep`, or a
/// `FileInto` the plus-detail subfolder when the address carries one.
pub fn dispatch_recipient(
    ctx: &mut DispatchContext,
    recipient: &RecipientAddress,
    message: &DeliveryMessage,
    sieve_program: Option<&[Command]>,
    now: u32,
) -> DeliveryOutcome {
    let inbox = match silo_mboxname::to_internal(ctx.namespace, "INBOX", Some(&recipient.local_part))
    {
        Ok(name) => name,
        Err(e) => return DeliveryOutcome::Failed(MailboxError::InvalidIdentifier(e.to_string())),
    };

    if recipient.suppress_duplicates {
        if let Some(message_id) = &message.message_id {
            match ctx.duplicates.check(message_id, &inbox, now) {
                Ok(true) => return DeliveryOutcome::Discarded,
                Ok(false) => {}
                Err(e) => {
                    tracing::warn!(error = %e, "duplicate check failed, delivering anyway");
                }
            }
        }
    }

    let actions = resolve_actions(recipient, message, sieve_program, &inbox);

    let mut last = None;
    for action in actions {
        match action {
            Action::Discard => return DeliveryOutcome::Discarded,
            Action::Reject { reason } => return DeliveryOutcome::Rejected { reason },
            Action::Keep { .. } => {
                match append_to(ctx, &inbox, message, now, recipient.ignore_quota) {
                    Ok(uid) => last = Some((inbox.clone(), uid)),
                    Err(e) => return DeliveryOutcome::Failed(e),
                }
            }
            Action::FileInto { mailbox, .. } => {
                match append_to(ctx, &mailbox, message, now, recipient.ignore_quota) {
                    Ok(uid) => last = Some((mailbox, uid)),
                    Err(MailboxError::MailboxNonexistent) => {
                        match append_to(ctx, &inbox, message, now, recipient.ignore_quota) {
                            Ok(uid) => last = Some((inbox.clone(), uid)),
                            Err(e) => return DeliveryOutcome::Failed(e),
                        }
                    }
                    Err(e) => return DeliveryOutcome::Failed(e),
                }
            }
            Action::Redirect { address, .. } => {
                redirect(ctx, recipient, message, &address, now);
            }
            Action::Vacation {
                address,
                from,
                subject,
                body,
                days,
                mime,
                handle: _,
            } => {
                vacation(ctx, recipient, message, &address, &from, &subject, &body, days, mime, now);
            }
            // SetFlag/AddFlag/RemoveFlag/Mark/Unmark/Notify/Denotify affect
            // only messages already delivered by a prior Keep/FileInto in
            // this same run, which this pipeline doesn't yet retroactively
            // apply.
            Action::SetFlag(_)
            | Action::AddFlag(_)
            | Action::RemoveFlag(_)
            | Action::Mark
            | Action::Unmark
            | Action::Notify { .. }
            | Action::Denotify { .. } => {}
        }
    }

    if recipient.suppress_duplicates {
        if let Some(message_id) = &message.message_id {
            let _ = ctx
                .duplicates
                .mark(message_id, &inbox, now + DUPLICATE_SUPPRESSION_WINDOW);
        }
    }

    match last {
        Some((mailbox, uid)) => DeliveryOutcome::Delivered { mailbox, uid },
        None => DeliveryOutcome::Discarded,
    }
}

fn resolve_actions(
    recipient: &RecipientAddress,
    message: &DeliveryMessage,
    sieve_program: Option<&[Command]>,
    inbox: &str,
) -> Vec<Action> {
    if let Some(program) = sieve_program {
        let env = MessageEnvironment {
            message,
            envelope_from: message.return_path.as_deref(),
            envelope_to: &recipient.local_part,
        };
        match silo_sieve::evaluate(program, &env) {
            Ok(actions) if !actions.is_empty() => return actions,
            Ok(_) => return vec![Action::Keep { flags: vec![], copy: false }],
            Err(e) => {
                silo_sieve::log_execute_error(0, &e.to_string());
                return vec![Action::Keep { flags: vec![], copy: false }];
            }
        }
    }

    match &recipient.detail {
        Some(detail) if !detail.is_empty() => vec![Action::FileInto {
            mailbox: format!("{inbox}.{detail}"),
            flags: vec![],
            copy: false,
        }],
        _ => vec![Action::Keep { flags: vec![], copy: false }],
    }
}

fn append_to(
    ctx: &mut DispatchContext,
    mailbox_name: &str,
    message: &DeliveryMessage,
    now: u32,
    ignore_quota: bool,
) -> Result<u32, MailboxError> {
    let mut mbox = silo_store::Mailbox::open(ctx.paths, mailbox_name)?;
    let quota_root = mbox.header().quota_root.clone();
    let quota_path = ctx.paths.quota_path(&quota_root);

    let mut quota = match QuotaFile::open(&quota_path) {
        Ok(q) => q,
        Err(MailboxError::Io(e)) if e.kind() == std::io::ErrorKind::NotFound => {
            QuotaFile::create(&quota_path, None)?
        }
        Err(e) => return Err(e),
    };

    let body = message.with_return_path_header();
    let uid = mbox.append(&mut quota, &body, &[], now, ignore_quota)?;
    Ok(uid)
}

/// Forwards the original message verbatim to `address`. Tracked the
/// same way the reference daemon's `sieve_redirect` does: keyed by
/// `{message-id}-{address}` under the Sieve auxiliary scope, so a
/// script re-run against the same message (a requeue, a later
/// redelivery) doesn't forward it twice. Messages with no `Message-Id`
/// can't be deduplicated this way and are forwarded unconditionally.
fn redirect(
    ctx: &mut DispatchContext,
    recipient: &RecipientAddress,
    message: &DeliveryMessage,
    address: &str,
    now: u32,
) {
    let scope = sieve_scope(&recipient.local_part, "");
    let dedup_key = message.message_id.as_ref().map(|id| format!("{id}-{address}"));

    if let Some(key) = &dedup_key {
        match ctx.duplicates.check(key, &scope, now) {
            Ok(true) => return,
            Ok(false) => {}
            Err(e) => {
                tracing::warn!(error = %e, "redirect duplicate check failed, forwarding anyway");
            }
        }
    }

    let from = message.return_path.as_deref().unwrap_or("");
    if ctx.transport.send(from, address, &message.body) {
        if let Some(key) = &dedup_key {
            let _ = ctx
                .duplicates
                .mark(key, &scope, now + DUPLICATE_SUPPRESSION_WINDOW);
        }
    } else {
        tracing::warn!(
            recipient = %recipient.local_part,
            address,
            "redirect: sendmail did not accept the message"
        );
    }
}

/// Sends at most one vacation auto-reply per sender per `days` window,
/// per the reference daemon's `autorespond`/`send_response` pair: the
/// window is tracked by sender address rather than by message-id,
/// since the point is suppressing a flood from one sender, not
/// deduplicating one particular message.
#[allow(clippy::too_many_arguments)]
fn vacation(
    ctx: &mut DispatchContext,
    recipient: &RecipientAddress,
    message: &DeliveryMessage,
    address: &Option<String>,
    from: &Option<String>,
    subject: &Option<String>,
    body: &str,
    days: u32,
    mime: bool,
    now: u32,
) {
    let reply_to = match address.clone().or_else(|| message.return_path.clone()) {
        Some(addr) if !addr.is_empty() => addr,
        _ => {
            tracing::warn!(recipient = %recipient.local_part, "vacation: no address to reply to");
            return;
        }
    };

    let scope = sieve_scope(&recipient.local_part, "vacation");
    let sender_key = reply_to.to_ascii_lowercase();
    match ctx.duplicates.check(&sender_key, &scope, now) {
        Ok(true) => return,
        Ok(false) => {}
        Err(e) => {
            tracing::warn!(error = %e, "vacation duplicate check failed, replying anyway");
        }
    }

    let reply_from = from
        .clone()
        .unwrap_or_else(|| format!("{}@{}", recipient.local_part, recipient.domain));
    let reply_subject = subject.clone().unwrap_or_else(|| "Automated reply".to_string());
    let reply = compose_vacation_reply(
        ctx.hostname,
        &reply_from,
        &reply_to,
        &reply_subject,
        body,
        mime,
        message.message_id.as_deref(),
        now,
    );

    if ctx.transport.send(&reply_from, &reply_to, reply.as_bytes()) {
        let window = (days.max(1) as u64) * 24 * 3600;
        let expiry = now.saturating_add(window as u32);
        let _ = ctx.duplicates.mark(&sender_key, &scope, expiry);
    } else {
        tracing::warn!(
            recipient = %recipient.local_part,
            address = %reply_to,
            "vacation: sendmail did not accept the reply"
        );
    }
}

/// Builds the RFC-822 auto-reply, mirroring the headers the reference
/// daemon's `send_response` writes: a fresh `Message-ID`, `Date`,
/// `From`/`To`, an `In-Reply-To` back to the triggering message, and
/// `Auto-Submitted` so downstream filters can recognize it.
#[allow(clippy::too_many_arguments)]
fn compose_vacation_reply(
    hostname: &str,
    from: &str,
    to: &str,
    subject: &str,
    body: &str,
    mime: bool,
    in_reply_to: Option<&str>,
    now: u32,
) -> String {
    let date = chrono::DateTime::from_timestamp(now as i64, 0)
        .map(|dt| dt.to_rfc2822())
        .unwrap_or_default();
    let message_id = format!("<silo-vacation-{now}@{hostname}>");
    let subject = match subject.find(|c: char| c.is_control()) {
        Some(idx) => &subject[..idx],
        None => subject,
    };

    let mut out = String::new();
    out.push_str(&format!("Message-ID: {message_id}\r\n"));
    out.push_str(&format!("Date: {date}\r\n"));
    out.push_str(&format!("From: <{from}>\r\n"));
    out.push_str(&format!("To: <{to}>\r\n"));
    out.push_str(&format!("Subject: {subject}\r\n"));
    if let Some(id) = in_reply_to {
        out.push_str(&format!("In-Reply-To: {id}\r\n"));
    }
    out.push_str("Auto-Submitted: auto-replied (vacation)\r\n");
    if mime {
        out.push_str("MIME-Version: 1.0\r\n");
        out.push_str(&format!(
            "Content-Type: multipart/mixed; boundary=\"{message_id}\"\r\n\r\n"
        ));
        out.push_str(&format!("--{message_id}\r\n\r\n"));
        out.push_str(body);
        out.push_str(&format!("\r\n--{message_id}--\r\n"));
    } else {
        out.push_str("\r\n");
        out.push_str(body);
        out.push_str("\r\n");
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::outbound::RecordingTransport;
    use silo_mboxname::Namespace;
    use silo_store::{Mailbox, MailboxList};
    use std::fs;

    struct Env {
        _dir: tempfile::TempDir,
        paths: SpoolPaths,
        list: MailboxList,
        duplicates: silo_duplicate::DuplicateTable,
        namespace: Namespace,
        transport: RecordingTransport,
        hostname: String,
    }

    fn setup() -> Env {
        let dir = tempfile::tempdir().unwrap();
        let paths = SpoolPaths::new(dir.path());
        fs::create_dir_all(paths.db_dir()).unwrap();
        MailboxList::create(paths.mailbox_list_path()).unwrap();
        let mut list = MailboxList::open(paths.mailbox_list_path()).unwrap();

        let dup_path = paths.db_dir().join("duplicate.db");
        silo_duplicate::DuplicateTable::create(&dup_path).unwrap();
        let duplicates = silo_duplicate::DuplicateTable::open(&dup_path).unwrap();

        Mailbox::create(&paths, &mut list, "user.alice", "user.alice", 1).unwrap();

        Env {
            _dir: dir,
            paths,
            list,
            duplicates,
            namespace: Namespace::default(),
            transport: RecordingTransport::new(true),
            hostname: "mail01.example.com".to_string(),
        }
    }

    fn sample_message(message_id: &str) -> DeliveryMessage {
        let body = format!(
            "From: bob@example.com\r\nMessage-Id: {message_id}\r\nSubject: hi\r\n\r\nbody text\r\n"
        );
        DeliveryMessage::new(Some("bob@example.com".to_string()), body.into_bytes())
    }

    #[test]
    fn plain_recipient_with_no_sieve_is_kept_into_inbox() {
        let mut env = setup();
        let mut ctx = DispatchContext {
            paths: &env.paths,
            namespace: &env.namespace,
            duplicates: &mut env.duplicates,
            transport: &env.transport,
            hostname: &env.hostname,
        };
        let recipient = RecipientAddress::parse("alice@example.com", false, false);
        let message = sample_message("<m1@x>");

        let outcome = dispatch_recipient(&mut ctx, &recipient, &message, None, 100);
        match outcome {
            DeliveryOutcome::Delivered { mailbox, uid } => {
                assert_eq!(mailbox, "user.alice");
                assert_eq!(uid, 1);
            }
            other => panic!("expected delivery, got {other:?}"),
        }
    }

    #[test]
    fn duplicate_message_id_is_discarded_on_second_delivery() {
        let mut env = setup();
        let recipient = RecipientAddress::parse("alice@example.com", false, true);

        {
            let mut ctx = DispatchContext {
                paths: &env.paths,
                namespace: &env.namespace,
                duplicates: &mut env.duplicates,
                transport: &env.transport,
                hostname: &env.hostname,
            };
            let message = sample_message("<dup@x>");
            dispatch_recipient(&mut ctx, &recipient, &message, None, 100);
        }

        let mut ctx = DispatchContext {
            paths: &env.paths,
            namespace: &env.namespace,
            duplicates: &mut env.duplicates,
            transport: &env.transport,
            hostname: &env.hostname,
        };
        let message = sample_message("<dup@x>");
        let outcome = dispatch_recipient(&mut ctx, &recipient, &message, None, 200);
        assert!(matches!(outcome, DeliveryOutcome::Discarded));
    }

    #[test]
    fn unknown_user_maps_to_user_unknown_lmtp_status() {
        let mut env = setup();
        let mut ctx = DispatchContext {
            paths: &env.paths,
            namespace: &env.namespace,
            duplicates: &mut env.duplicates,
            transport: &env.transport,
            hostname: &env.hostname,
        };
        let recipient = RecipientAddress::parse("nobody@example.com", false, false);
        let message = sample_message("<m2@x>");

        let outcome = dispatch_recipient(&mut ctx, &recipient, &message, None, 100);
        let (code, enhanced, _) = outcome.lmtp_status();
        assert!(matches!(outcome, DeliveryOutcome::Failed(MailboxError::MailboxNonexistent)));
        assert_eq!(code, 550);
        assert_eq!(enhanced, "5.1.1");
    }

    #[test]
    fn fileinto_falls_back_to_inbox_when_target_mailbox_is_missing() {
        let mut env = setup();
        let mut ctx = DispatchContext {
            paths: &env.paths,
            namespace: &env.namespace,
            duplicates: &mut env.duplicates,
            transport: &env.transport,
            hostname: &env.hostname,
        };
        let recipient = RecipientAddress::parse("alice@example.com", false, false);
        let message = sample_message("<m3@x>");

        let program = vec![Command::Do(Action::FileInto {
            mailbox: "user.alice.Nonexistent".into(),
            flags: vec![],
            copy: false,
        })];

        let outcome = dispatch_recipient(&mut ctx, &recipient, &message, Some(&program), 100);
        match outcome {
            DeliveryOutcome::Delivered { mailbox, .. } => assert_eq!(mailbox, "user.alice"),
            other => panic!("expected fallback delivery, got {other:?}"),
        }
    }

    #[test]
    fn reject_action_surfaces_as_rejected_outcome() {
        let mut env = setup();
        let mut ctx = DispatchContext {
            paths: &env.paths,
            namespace: &env.namespace,
            duplicates: &mut env.duplicates,
            transport: &env.transport,
            hostname: &env.hostname,
        };
        let recipient = RecipientAddress::parse("alice@example.com", false, false);
        let message = sample_message("<m4@x>");

        let program = vec![Command::Do(Action::Reject { reason: "spam".into() })];
        let outcome = dispatch_recipient(&mut ctx, &recipient, &message, Some(&program), 100);
        assert!(matches!(outcome, DeliveryOutcome::Rejected { .. }));
    }

    #[test]
    fn plus_detail_fallback_files_into_the_named_subfolder() {
        let mut env = setup();
        Mailbox::create(&env.paths, &mut env.list, "user.alice.lists", "user.alice", 1).unwrap();
        let mut ctx = DispatchContext {
            paths: &env.paths,
            namespace: &env.namespace,
            duplicates: &mut env.duplicates,
            transport: &env.transport,
            hostname: &env.hostname,
        };
        let recipient = RecipientAddress::parse("alice+lists@example.com", false, false);
        let message = sample_message("<m5@x>");

        let outcome = dispatch_recipient(&mut ctx, &recipient, &message, None, 100);
        match outcome {
            DeliveryOutcome::Delivered { mailbox, .. } => assert_eq!(mailbox, "user.alice.lists"),
            other => panic!("expected delivery into detail subfolder, got {other:?}"),
        }
    }

    #[test]
    fn vacation_sends_a_reply_and_suppresses_a_second_one_within_the_window() {
        let mut env = setup();
        let recipient = RecipientAddress::parse("alice@example.com", false, false);
        let program = vec![Command::Do(Action::Vacation {
            address: None,
            from: None,
            subject: None,
            body: "I'm out".to_string(),
            days: 7,
            mime: false,
            handle: None,
        })];

        {
            let mut ctx = DispatchContext {
                paths: &env.paths,
                namespace: &env.namespace,
                duplicates: &mut env.duplicates,
                transport: &env.transport,
                hostname: &env.hostname,
            };
            let message = sample_message("<m1@x>");
            let outcome = dispatch_recipient(&mut ctx, &recipient, &message, Some(&program), 100);
            assert!(matches!(outcome, DeliveryOutcome::Discarded));
        }
        assert_eq!(env.transport.sent.lock().unwrap().len(), 1);

        {
            let mut ctx = DispatchContext {
                paths: &env.paths,
                namespace: &env.namespace,
                duplicates: &mut env.duplicates,
                transport: &env.transport,
                hostname: &env.hostname,
            };
            // Same sender, different message: no second reply inside the
            // 7-day window.
            let message = sample_message("<m2@x>");
            dispatch_recipient(&mut ctx, &recipient, &message, Some(&program), 200);
        }
        assert_eq!(env.transport.sent.lock().unwrap().len(), 1);

        let (from, to, body) = env.transport.sent.lock().unwrap()[0].clone();
        assert_eq!(to, "bob@example.com");
        assert!(from.contains("alice"));
        assert!(String::from_utf8(body).unwrap().contains("I'm out"));
    }

    #[test]
    fn redirect_forwards_to_the_sieve_supplied_address() {
        let mut env = setup();
        let mut ctx = DispatchContext {
            paths: &env.paths,
            namespace: &env.namespace,
            duplicates: &mut env.duplicates,
            transport: &env.transport,
            hostname: &env.hostname,
        };
        let recipient = RecipientAddress::parse("alice@example.com", false, false);
        let program = vec![Command::Do(Action::Redirect {
            address: "carol@example.net".to_string(),
            copy: false,
        })];
        let message = sample_message("<m6@x>");

        let outcome = dispatch_recipient(&mut ctx, &recipient, &message, Some(&program), 100);
        assert!(matches!(outcome, DeliveryOutcome::Discarded));

        let sent = env.transport.sent.lock().unwrap();
        assert_eq!(sent.len(), 1);
        assert_eq!(sent[0].1, "carol@example.net");
    }

    #[test]
    fn redirect_does_not_forward_the_same_message_twice() {
        let mut env = setup();
        let recipient = RecipientAddress::parse("alice@example.com", false, false);
        let program = vec![Command::Do(Action::Redirect {
            address: "carol@example.net".to_string(),
            copy: false,
        })];

        for now in [100, 200] {
            let mut ctx = DispatchContext {
                paths: &env.paths,
                namespace: &env.namespace,
                duplicates: &mut env.duplicates,
                transport: &env.transport,
                hostname: &env.hostname,
            };
            let message = sample_message("<m7@x>");
            dispatch_recipient(&mut ctx, &recipient, &message, Some(&program), now);
        }

        assert_eq!(env.transport.sent.lock().unwrap().len(), 1);
    }
}
