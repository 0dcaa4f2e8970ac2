//! Mailbox status discovery: a small UDP service that answers "how
//! many recent messages, when was it last read, when did the last one
//! arrive" for a mailbox, without requiring a full IMAP login. Used by
//! front-end proxies to annotate a `LIST`/login-time mailbox summary,
//! and by monitoring tools that just want a liveness probe.

mod protocol;
mod server;

pub use protocol::{RequestParseError, StatusRequest, StatusResponse, DEFAULT_PORT};
pub use server::{FudServer, LocalOnly, LocationResolver, MailboxLocation};
