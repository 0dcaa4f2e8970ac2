//! The one-shot `deliver` tool's dispatch core, shared with the LMTP
//! server via [`dispatch_recipient`]. The `silo` binary's `deliver`
//! subcommand owns argument parsing and wiring up the store/duplicate
//! handles; this module only owns "given a parsed request, what exit
//! code comes out."

use silo_mboxname::Namespace;
use silo_store::SpoolPaths;

use crate::dispatch::{dispatch_recipient, DeliveryOutcome, DispatchContext};
use crate::message::{canonicalize_line_endings, DeliveryMessage, RecipientAddress};
use crate::outbound::MailTransport;
use crate::server::SieveProvider;

/// A single invocation of `deliver`: one message, one or more
/// recipients, delivered synchronously in argument order.
pub struct DeliverRequest {
    pub recipients: Vec<String>,
    pub return_path: Option<String>,
    /// `-q`: let this delivery push a mailbox's quota root over its
    /// limit.
    pub ignore_quota: bool,
    /// `-e`: check and record this delivery's `Message-Id` in the
    /// duplicate-suppression table. Independent of `ignore_quota` —
    /// they used to be the same flag, which meant passing `-q` alone
    /// silently turned dedup off.
    pub suppress_duplicates: bool,
}

/// Delivers `body` to every recipient in `request`, returning the
/// `sysexits` code to exit with: `EX_OK` if every recipient accepted
/// the message, otherwise the code from the first recipient that
/// didn't (later, worse failures after it don't override it — the
/// caller's retry logic only needs to know whether *any* part of the
/// message failed and the first reason why).
#[allow(clippy::too_many_arguments)]
pub fn run_deliver(
    paths: &SpoolPaths,
    namespace: &Namespace,
    duplicates: &mut silo_duplicate::DuplicateTable,
    sieve: &dyn SieveProvider,
    transport: &dyn MailTransport,
    hostname: &str,
    request: &DeliverRequest,
    body: &[u8],
    now: u32,
) -> i32 {
    let canonical = canonicalize_line_endings(body);
    let message = DeliveryMessage::new(request.return_path.clone(), canonical);

    let mut exit_code = silo_store::EX_OK;
    for addr in &request.recipients {
        let recipient =
            RecipientAddress::parse(addr, request.ignore_quota, request.suppress_duplicates);
        let program = sieve.program_for(&recipient.local_part);

        let mut ctx = DispatchContext {
            paths,
            namespace,
            duplicates,
            transport,
            hostname,
        };
        let outcome = dispatch_recipient(&mut ctx, &recipient, &message, program.as_deref(), now);

        match &outcome {
            DeliveryOutcome::Delivered { mailbox, uid } => {
                tracing::info!(recipient = %addr, mailbox, uid, "delivered");
            }
            DeliveryOutcome::Discarded => {
                tracing::info!(recipient = %addr, "discarded");
            }
            DeliveryOutcome::Rejected { reason } => {
                tracing::warn!(recipient = %addr, reason, "delivery rejected");
            }
            DeliveryOutcome::Failed(e) => {
                tracing::error!(recipient = %addr, error = %e, "delivery failed");
            }
        }

        let code = outcome.exit_code();
        if code != silo_store::EX_OK && exit_code == silo_store::EX_OK {
            exit_code = code;
        }
    }
    exit_code
}
