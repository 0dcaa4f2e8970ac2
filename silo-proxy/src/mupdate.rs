//! Client for the mupdate mailbox-location service: a tagged,
//! line-oriented TCP protocol. `LACTIVATE`/`LUPDATE` register a
//! mailbox's current `(server, acl)`, `LDELETE` removes the entry,
//! `LFIND` resolves one. Every command gets one `OK <text>` / `NO
//! <text>` / `BAD <text>` response line, tagged with the same `X<n>`
//! sequence number the request carried.
//!
//! Unsolicited `MAILBOX <name> <server> <acl>` and `DELETE <name>`
//! lines (a peer master pushing an update it learned from someone
//! else) can arrive between requests; [`MupdateClient::poll_push`]
//! drains and classifies them without blocking on a response.

use std::io;

use thiserror::Error;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::TcpStream;

#[derive(Debug, Error)]
pub enum MupdateError {
    #[error("i/o error: {0}")]
    Io(#[from] io::Error),
    #[error("mupdate server said NO: {0}")]
    No(String),
    #[error("mupdate server said BAD: {0}")]
    Bad(String),
    #[error("malformed response from mupdate server: {0}")]
    Protocol(String),
}

/// One mailbox's location as known to mupdate.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MailboxLocation {
    pub mailbox: String,
    pub server: String,
    pub acl: String,
}

/// An unsolicited push from the mupdate server.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PushUpdate {
    Mailbox(MailboxLocation),
    Delete { mailbox: String },
}

pub struct MupdateClient {
    reader: BufReader<tokio::net::tcp::OwnedReadHalf>,
    writer: tokio::net::tcp::OwnedWriteHalf,
    tag: u64,
}

impl MupdateClient {
    /// Connects and consumes the server's greeting line.
    pub async fn connect(addr: &str) -> Result<Self, MupdateError> {
        let stream = TcpStream::connect(addr).await?;
        let (read_half, write_half) = stream.into_split();
        let mut client = MupdateClient {
            reader: BufReader::new(read_half),
            writer: write_half,
            tag: 1,
        };
        let mut greeting = String::new();
        client.reader.read_line(&mut greeting).await?;
        if !greeting.starts_with("MUPDATE") {
            return Err(MupdateError::Protocol(format!("bad greeting: {greeting:?}")));
        }
        Ok(client)
    }

    async fn roundtrip(&mut self, command: &str, args: &str) -> Result<String, MupdateError> {
        let tag = self.tag;
        self.tag += 1;
        let line = format!("X{tag} {command} {args}\r\n");
        self.writer.write_all(line.as_bytes()).await?;

        let mut response = String::new();
        self.reader.read_line(&mut response).await?;
        let response = response.trim_end_matches(['\r', '\n']);

        let mut parts = response.splitn(3, ' ');
        let got_tag = parts.next().unwrap_or("");
        let status = parts.next().unwrap_or("");
        let text = parts.next().unwrap_or("").to_string();

        if got_tag != format!("X{tag}") {
            return Err(MupdateError::Protocol(format!(
                "response tag {got_tag} does not match request tag X{tag}"
            )));
        }

        match status {
            "OK" => Ok(text),
            "NO" => Err(MupdateError::No(text)),
            "BAD" => Err(MupdateError::Bad(text)),
            other => Err(MupdateError::Protocol(format!("unrecognized status {other}"))),
        }
    }

    pub async fn activate(&mut self, mailbox: &str, server: &str, acl: &str) -> Result<(), MupdateError> {
        self.roundtrip("ACTIVATE", &format!("{mailbox} {server} {acl}")).await?;
        Ok(())
    }

    /// Re-registers an already-activated mailbox under a new
    /// `(server, acl)`, e.g. after a rename or an ACL change. Same
    /// wire command as `activate` — mupdate treats both as "this is
    /// now the authoritative location."
    pub async fn update(&mut self, mailbox: &str, server: &str, acl: &str) -> Result<(), MupdateError> {
        self.activate(mailbox, server, acl).await
    }

    pub async fn delete(&mut self, mailbox: &str) -> Result<(), MupdateError> {
        self.roundtrip("DELETE", mailbox).await?;
        Ok(())
    }

    pub async fn find(&mut self, mailbox: &str) -> Result<Option<MailboxLocation>, MupdateError> {
        match self.roundtrip("FIND", mailbox).await {
            Ok(text) => parse_mailbox_location(mailbox, &text).map(Some),
            Err(MupdateError::No(_)) => Ok(None),
            Err(e) => Err(e),
        }
    }

    /// Reads one pending push line with a caller-supplied timeout,
    /// returning `None` if nothing arrived in time.
    pub async fn poll_push(&mut self, timeout: std::time::Duration) -> Result<Option<PushUpdate>, MupdateError> {
        let mut line = String::new();
        match tokio::time::timeout(timeout, self.reader.read_line(&mut line)).await {
            Err(_) => Ok(None),
            Ok(Ok(0)) => Err(MupdateError::Protocol("connection closed".to_string())),
            Ok(Ok(_)) => parse_push(line.trim_end_matches(['\r', '\n'])).map(Some),
            Ok(Err(e)) => Err(e.into()),
        }
    }
}

fn parse_mailbox_location(mailbox: &str, text: &str) -> Result<MailboxLocation, MupdateError> {
    let mut parts = text.splitn(2, ' ');
    let server = parts
        .next()
        .filter(|s| !s.is_empty())
        .ok_or_else(|| MupdateError::Protocol(format!("FIND reply missing server: {text:?}")))?;
    let acl = parts.next().unwrap_or("").to_string();
    Ok(MailboxLocation {
        mailbox: mailbox.to_string(),
        server: server.to_string(),
        acl,
    })
}

fn parse_push(line: &str) -> Result<PushUpdate, MupdateError> {
    let mut parts = line.splitn(4, ' ');
    let command = parts.next().unwrap_or("").to_ascii_uppercase();
    match command.as_str() {
        "MAILBOX" => {
            let mailbox = parts.next().ok_or_else(|| malformed(line))?;
            let server = parts.next().ok_or_else(|| malformed(line))?;
            let acl = parts.next().unwrap_or("").to_string();
            Ok(PushUpdate::Mailbox(MailboxLocation {
                mailbox: mailbox.to_string(),
                server: server.to_string(),
                acl,
            }))
        }
        "DELETE" => {
            let mailbox = parts.next().ok_or_else(|| malformed(line))?;
            Ok(PushUpdate::Delete {
                mailbox: mailbox.to_string(),
            })
        }
        _ => Err(malformed(line)),
    }
}

fn malformed(line: &str) -> MupdateError {
    MupdateError::Protocol(format!("unrecognized push line: {line:?}"))
}
