//! The status-lookup daemon: a single socket answering `<user>|
//! <mailbox>` queries, forwarding to another backend when the target
//! mailbox's location says it lives elsewhere.

use std::io;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use tokio::net::UdpSocket;
use tokio::sync::{watch, Mutex};

use silo_mboxname::{user_owns_mailbox, Namespace};
use silo_store::{Mailbox, MailboxList, SeenStore, SpoolPaths};

use crate::protocol::{StatusRequest, StatusResponse, DEFAULT_PORT};

const PROXY_TIMEOUT: Duration = Duration::from_secs(1);
const MAX_DATAGRAM: usize = 1024;

/// Where a mailbox actually lives, for the cases this deployment needs
/// to proxy a query instead of answering it locally.
pub enum MailboxLocation {
    Local,
    Remote(String),
}

/// Resolves a mailbox's location. The trivial single-backend
/// deployment (`LocalOnly`) never proxies; a multi-backend deployment
/// plugs in a resolver backed by the same mailbox-to-backend mapping
/// the mupdate client maintains.
pub trait LocationResolver: Send + Sync {
    fn locate(&self, internal_name: &str) -> MailboxLocation;
}

pub struct LocalOnly;

impl LocationResolver for LocalOnly {
    fn locate(&self, _internal_name: &str) -> MailboxLocation {
        MailboxLocation::Local
    }
}

pub struct FudServer {
    socket: UdpSocket,
    paths: SpoolPaths,
    namespace: Namespace,
    list: Mutex<MailboxList>,
    locations: Arc<dyn LocationResolver>,
}

impl FudServer {
    pub async fn bind(
        bind_addr: SocketAddr,
        paths: SpoolPaths,
        namespace: Namespace,
        locations: Arc<dyn LocationResolver>,
    ) -> io::Result<Self> {
        let socket = UdpSocket::bind(bind_addr).await?;
        let list = MailboxList::open(paths.mailbox_list_path())
            .map_err(|e| io::Error::new(io::ErrorKind::Other, e.to_string()))?;
        Ok(FudServer {
            socket,
            paths,
            namespace,
            list: Mutex::new(list),
            locations,
        })
    }

    pub fn local_addr(&self) -> io::Result<SocketAddr> {
        self.socket.local_addr()
    }

    /// Serves requests until `must_exit` reports `true`. One datagram
    /// at a time, deliberately — a status lookup is cheap and the
    /// skiplist mailbox-list handle is shared, so there is no benefit
    /// to answering queries concurrently.
    pub async fn run(&self, mut must_exit: watch::Receiver<bool>) -> io::Result<()> {
        let mut buf = [0u8; MAX_DATAGRAM];
        loop {
            tokio::select! {
                changed = must_exit.changed() => {
                    if changed.is_err() || *must_exit.borrow() {
                        tracing::info!("discovery daemon shutting down");
                        return Ok(());
                    }
                }
                recv = self.socket.recv_from(&mut buf) => {
                    let (len, peer) = match recv {
                        Ok(v) => v,
                        Err(e) => {
                            tracing::warn!(error = %e, "recvfrom failed");
                            continue;
                        }
                    };
                    let response = self.handle_datagram(&buf[..len]).await;
                    if let Err(e) = self.socket.send_to(&response.encode(), peer).await {
                        tracing::warn!(error = %e, "send_to failed");
                    }
                }
            }
        }
    }

    async fn handle_datagram(&self, raw: &[u8]) -> StatusResponse {
        match StatusRequest::parse(raw) {
            Ok(request) => self.handle_request(&request).await,
            Err(_) => StatusResponse::Unknown,
        }
    }

    async fn handle_request(&self, request: &StatusRequest) -> StatusResponse {
        let internal = match silo_mboxname::to_internal(&self.namespace, &request.mailbox, Some(&request.userid)) {
            Ok(n) => n,
            Err(_) => return StatusResponse::Unknown,
        };

        if let MailboxLocation::Remote(host) = self.locations.locate(&internal) {
            tracing::debug!(mailbox = %internal, backend = %host, "proxying status request");
            return proxy_request(&host, request).await;
        }

        {
            let mut list = self.list.lock().await;
            match list.exists(&internal) {
                Ok(true) => {}
                Ok(false) | Err(_) => return StatusResponse::Unknown,
            }
        }

        if internal.starts_with("user.") && !user_owns_mailbox(&request.userid, &internal) {
            return StatusResponse::PermissionDenied;
        }

        let mailbox = match Mailbox::open(&self.paths, &internal) {
            Ok(m) => m,
            Err(_) => return StatusResponse::Unknown,
        };
        let records = match mailbox.records() {
            Ok(r) => r,
            Err(_) => return StatusResponse::Unknown,
        };

        let state = match SeenStore::open(self.paths.seen_path(&request.userid)) {
            Ok(seen) => seen.mailbox(&internal),
            Err(_) => Default::default(),
        };
        let num_recent = records.iter().filter(|r| r.uid > state.recent_uid()).count() as u32;

        StatusResponse::Found {
            userid: request.userid.clone(),
            mailbox: request.mailbox.clone(),
            num_recent,
            last_read: state.last_read(),
            last_arrived: mailbox.index_header().last_appenddate,
        }
    }
}

/// Forwards `request` to `backend_host`'s own status daemon and relays
/// whatever comes back, or `Unknown` if it doesn't answer within
/// [`PROXY_TIMEOUT`].
async fn proxy_request(backend_host: &str, request: &StatusRequest) -> StatusResponse {
    let socket = match UdpSocket::bind(("0.0.0.0", 0)).await {
        Ok(s) => s,
        Err(_) => return StatusResponse::Unknown,
    };
    if socket.connect((backend_host, DEFAULT_PORT)).await.is_err() {
        return StatusResponse::Unknown;
    }
    if socket.send(&request.encode()).await.is_err() {
        return StatusResponse::Unknown;
    }

    let mut buf = [0u8; MAX_DATAGRAM];
    match tokio::time::timeout(PROXY_TIMEOUT, socket.recv(&mut buf)).await {
        Ok(Ok(len)) => StatusResponse::decode(&buf[..len]),
        _ => StatusResponse::Unknown,
    }
}
