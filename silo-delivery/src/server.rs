//! LMTP front end. Adapts the generic `smtp_server::Config` machinery
//! (accept loop, per-connection protocol state machine) to local
//! mailbox delivery via [`dispatch_recipient`]. The accept loop, the
//! connection/mail metadata shape, and the `Config` method surface
//! below are carried over from an existing LMTP-over-S3 front end;
//! only the body of `filter_to`/`handle_mail` changes.

use std::net::SocketAddr;
use std::pin::Pin;
use std::sync::Arc;

use anyhow::Result;
use async_trait::async_trait;
use duplexify::Duplex;
use futures::{io, stream, stream::FuturesUnordered, AsyncRead, AsyncReadExt, AsyncWrite, StreamExt};
use tokio::net::TcpListener;
use tokio::select;
use tokio::sync::{watch, Mutex};
use tokio_util::compat::*;
use tracing::{info, warn};

use smtp_message::{Email, EscapedDataReader, Reply, ReplyCode};
use smtp_server::{reply, Config, ConnectionMetadata, Decision, MailMetadata};

use silo_mboxname::Namespace;
use silo_sieve::Command;
use silo_store::{MailboxList, SpoolPaths};

use crate::dispatch::{dispatch_recipient, DeliveryOutcome, DispatchContext};
use crate::message::{canonicalize_line_endings, DeliveryMessage, RecipientAddress};
use crate::outbound::MailTransport;

/// Looks up a user's compiled Sieve program, if they have one active.
pub trait SieveProvider {
    fn program_for(&self, userid: &str) -> Option<Vec<Command>>;
}

/// The default when no script store is wired up: every recipient
/// falls back to `Keep`, or a plus-detail `FileInto`.
pub struct NoSieve;

impl SieveProvider for NoSieve {
    fn program_for(&self, _userid: &str) -> Option<Vec<Command>> {
        None
    }
}

struct ServerState {
    list: MailboxList,
    duplicates: silo_duplicate::DuplicateTable,
}

pub struct LmtpServer {
    bind_addr: SocketAddr,
    hostname: String,
    paths: SpoolPaths,
    namespace: Namespace,
    sieve: Arc<dyn SieveProvider + Send + Sync>,
    transport: Arc<dyn MailTransport + Send + Sync>,
    state: Mutex<ServerState>,
}

impl LmtpServer {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        bind_addr: SocketAddr,
        hostname: String,
        paths: SpoolPaths,
        namespace: Namespace,
        list: MailboxList,
        duplicates: silo_duplicate::DuplicateTable,
        sieve: Arc<dyn SieveProvider + Send + Sync>,
        transport: Arc<dyn MailTransport + Send + Sync>,
    ) -> Arc<Self> {
        Arc::new(Self {
            bind_addr,
            hostname,
            paths,
            namespace,
            sieve,
            transport,
            state: Mutex::new(ServerState { list, duplicates }),
        })
    }

    pub async fn run(self: &Arc<Self>, mut must_exit: watch::Receiver<bool>) -> Result<()> {
        let tcp = TcpListener::bind(self.bind_addr).await?;
        info!(addr = %self.bind_addr, "LMTP server listening");

        let mut connections = FuturesUnordered::new();

        while !*must_exit.borrow() {
            let wait_conn_finished = async {
                if connections.is_empty() {
                    futures::future::pending().await
                } else {
                    connections.next().await
                }
            };
            let (socket, remote_addr) = select! {
                a = tcp.accept() => a?,
                _ = wait_conn_finished => continue,
                _ = must_exit.changed() => continue,
            };

            let conn = tokio::spawn(smtp_server::interact(
                socket.compat(),
                smtp_server::IsAlreadyTls::No,
                Conn { remote_addr },
                self.clone(),
            ));

            connections.push(conn);
        }
        drop(tcp);

        info!("LMTP server shutting down, draining remaining connections");
        while connections.next().await.is_some() {}

        Ok(())
    }
}

pub struct Conn {
    #[allow(dead_code)]
    remote_addr: SocketAddr,
}

pub struct Message {
    to: Vec<RecipientAddress>,
}

fn email_to_string(email: &Email) -> String {
    match email.hostname.as_ref() {
        Some(h) => format!("{}@{}", email.localpart, h),
        None => email.localpart.to_string(),
    }
}

/// Every rejection uses the same base reply code the upstream
/// `smtp-server` crate exposes; the true LMTP status/enhanced code
/// from the delivery taxonomy is carried in the reply text instead of
/// a per-case `ReplyCode` variant, since the protocol crate only
/// exposes a small fixed set of named codes.
fn policy_reject(text: impl Into<String>) -> Reply {
    Reply {
        code: ReplyCode::POLICY_REASON,
        ecode: None,
        text: vec![smtp_message::MaybeUtf8::Utf8(text.into())],
    }
}

#[async_trait]
impl Config for LmtpServer {
    type Protocol = smtp_server::protocol::Lmtp;

    type ConnectionUserMeta = Conn;
    type MailUserMeta = Message;

    fn hostname(&self, _conn_meta: &ConnectionMetadata<Conn>) -> &str {
        &self.hostname
    }

    async fn new_mail(&self, _conn_meta: &mut ConnectionMetadata<Conn>) -> Message {
        Message { to: vec![] }
    }

    async fn tls_accept<IO>(
        &self,
        _io: IO,
        _conn_meta: &mut ConnectionMetadata<Conn>,
    ) -> io::Result<Duplex<Pin<Box<dyn Send + AsyncRead>>, Pin<Box<dyn Send + AsyncWrite>>>>
    where
        IO: Send + AsyncRead + AsyncWrite,
    {
        Err(io::Error::new(
            io::ErrorKind::InvalidInput,
            "TLS not implemented for LMTP server",
        ))
    }

    async fn filter_from(
        &self,
        from: Option<Email>,
        _meta: &mut MailMetadata<Message>,
        _conn_meta: &mut ConnectionMetadata<Conn>,
    ) -> Decision<Option<Email>> {
        Decision::Accept {
            reply: reply::okay_from().convert(),
            res: from,
        }
    }

    async fn filter_to(
        &self,
        to: Email,
        meta: &mut MailMetadata<Message>,
        _conn_meta: &mut ConnectionMetadata<Conn>,
    ) -> Decision<Email> {
        // LMTP delivery suppresses duplicates by default, matching the
        // reference daemon's `duplicatesuppression` config default.
        let recipient = RecipientAddress::parse(&email_to_string(&to), false, true);

        let internal = match silo_mboxname::to_internal(
            &self.namespace,
            "INBOX",
            Some(&recipient.local_part),
        ) {
            Ok(name) => name,
            Err(e) => {
                return Decision::Reject {
                    reply: policy_reject(format!("invalid recipient: {e}")),
                }
            }
        };

        let mut state = self.state.lock().await;
        match state.list.exists(&internal) {
            Ok(true) => {
                meta.user.to.push(recipient);
                Decision::Accept {
                    reply: reply::okay_to().convert(),
                    res: to,
                }
            }
            Ok(false) => Decision::Reject {
                reply: policy_reject("550 5.1.1 user unknown"),
            },
            Err(e) => {
                warn!(error = %e, "mailbox list lookup failed");
                Decision::Reject {
                    reply: policy_reject("451 4.3.0 temporary lookup failure"),
                }
            }
        }
    }

    async fn handle_mail<'resp, R>(
        &'resp self,
        reader: &mut EscapedDataReader<'_, R>,
        meta: MailMetadata<Message>,
        _conn_meta: &'resp mut ConnectionMetadata<Conn>,
    ) -> Pin<Box<dyn futures::Stream<Item = Decision<()>> + Send + 'resp>>
    where
        R: Send + Unpin + AsyncRead,
    {
        let reject_every = |to: Vec<RecipientAddress>, msg: String| {
            Box::pin(stream::iter(to.into_iter()).map(move |_| Decision::Reject {
                reply: policy_reject(msg.clone()),
            })) as Pin<Box<dyn futures::Stream<Item = Decision<()>> + Send>>
        };

        let mut text = Vec::new();
        if reader.read_to_end(&mut text).await.is_err() {
            return reject_every(meta.user.to, "451 4.3.0 i/o error reading message".into());
        }
        reader.complete();

        let body = canonicalize_line_endings(&text);
        let return_path = meta.from.as_ref().map(email_to_string);
        let message = Arc::new(DeliveryMessage::new(return_path, body));

        let server = self;
        Box::pin(stream::iter(meta.user.to.into_iter()).then(move |recipient| {
            let message = message.clone();
            async move {
                let now = silo_duplicate::now_unix();
                let program = server.sieve.program_for(&recipient.local_part);

                let mut state = server.state.lock().await;
                let mut ctx = DispatchContext {
                    paths: &server.paths,
                    namespace: &server.namespace,
                    duplicates: &mut state.duplicates,
                    transport: &*server.transport,
                    hostname: &server.hostname,
                };
                let outcome =
                    dispatch_recipient(&mut ctx, &recipient, &message, program.as_deref(), now);
                drop(state);

                match outcome {
                    DeliveryOutcome::Delivered { .. } | DeliveryOutcome::Discarded => {
                        Decision::Accept {
                            reply: reply::okay_mail().convert(),
                            res: (),
                        }
                    }
                    other => {
                        let (code, ecode, text) = other.lmtp_status();
                        Decision::Reject {
                            reply: policy_reject(format!("{code} {ecode} {text}")),
                        }
                    }
                }
            }
        }))
    }
}
