//! Local delivery: the LMTP state machine, the one-shot `deliver` CLI
//! core, and the dispatch pipeline both front ends share — resolve a
//! recipient to a mailbox, check for a duplicate, run Sieve, and
//! execute the resulting actions against the mailbox store.

mod cli;
mod dispatch;
mod message;
mod outbound;
mod server;

pub use cli::{run_deliver, DeliverRequest};
pub use dispatch::{dispatch_recipient, DeliveryOutcome, DispatchContext};
pub use message::{canonicalize_line_endings, DeliveryMessage, RecipientAddress};
pub use outbound::{MailTransport, Sendmail};
pub use server::{LmtpServer, NoSieve, SieveProvider};
