//! The murder/proxy layer: resolving which back end owns a mailbox,
//! pooling connections to those back ends, translating IMAP literal
//! markers between synchronizing and non-synchronizing form, and
//! doing cross-server `COPY` by hand when source and destination
//! disagree on which server that is.

mod backend_map;
mod copy;
mod literal;
mod mupdate;
mod pool;

pub use backend_map::{now_unix, BackendMap};
pub use copy::{copy_one, CopyUid, CrossCopyError};
pub use literal::{is_nonsync, to_nonsync, to_sync};
pub use mupdate::{MailboxLocation, MupdateClient, MupdateError, PushUpdate};
pub use pool::{BackendConn, BackendPool};
