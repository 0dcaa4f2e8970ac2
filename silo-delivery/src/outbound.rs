//! Hands Sieve `vacation`/`redirect` actions off to a local MTA. Both
//! actions shell out the same way the reference LMTP daemon's
//! `send_response`/`send_forward` helpers do: spawn `sendmail -i -f
//! <envelope-from> -- <envelope-to>` and write the outgoing message to
//! its stdin.

use std::io::Write;
use std::process::{Command, Stdio};

use tracing::warn;

/// Delivers one outbound message to an external MTA. A trait so tests
/// can substitute a fake that records calls instead of shelling out.
pub trait MailTransport {
    /// `true` iff the MTA accepted the message (exit status 0).
    fn send(&self, envelope_from: &str, envelope_to: &str, body: &[u8]) -> bool;
}

/// Shells out to the system `sendmail` binary.
pub struct Sendmail {
    pub path: String,
}

impl Default for Sendmail {
    fn default() -> Self {
        Sendmail { path: "sendmail".to_string() }
    }
}

impl MailTransport for Sendmail {
    fn send(&self, envelope_from: &str, envelope_to: &str, body: &[u8]) -> bool {
        let from_arg = if envelope_from.is_empty() {
            "<>".to_string()
        } else {
            envelope_from.to_string()
        };

        let mut child = match Command::new(&self.path)
            .args(["-i", "-f", &from_arg, "--", envelope_to])
            .stdin(Stdio::piped())
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .spawn()
        {
            Ok(c) => c,
            Err(e) => {
                warn!(error = %e, path = %self.path, "failed to spawn sendmail");
                return false;
            }
        };

        if let Some(mut stdin) = child.stdin.take() {
            if let Err(e) = stdin.write_all(body) {
                warn!(error = %e, "failed writing message to sendmail stdin");
                return false;
            }
        }

        match child.wait() {
            Ok(status) => status.success(),
            Err(e) => {
                warn!(error = %e, "failed waiting on sendmail");
                false
            }
        }
    }
}

#[cfg(test)]
pub struct RecordingTransport {
    pub sent: std::sync::Mutex<Vec<(String, String, Vec<u8>)>>,
    pub accept: bool,
}

#[cfg(test)]
impl RecordingTransport {
    pub fn new(accept: bool) -> Self {
        RecordingTransport { sent: std::sync::Mutex::new(Vec::new()), accept }
    }
}

#[cfg(test)]
impl MailTransport for RecordingTransport {
    fn send(&self, envelope_from: &str, envelope_to: &str, body: &[u8]) -> bool {
        self.sent
            .lock()
            .unwrap()
            .push((envelope_from.to_string(), envelope_to.to_string(), body.to_vec()));
        self.accept
    }
}
