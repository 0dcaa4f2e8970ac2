//! Wire format for mailbox status lookups: a `<user>|<mailbox>` query
//! answered with `<user>|<mailbox>|<numrecent>|<lastread>|<lastarrived>`
//! on success, the bare string `PERMDENY` when the caller has no rights
//! on someone else's personal mailbox, or `UNKNOWN` for anything else
//! that keeps the lookup from completing (bad request, missing
//! mailbox, I/O error, proxied backend unreachable).

use thiserror::Error;

/// Default UDP port this service listens on and proxies to.
pub const DEFAULT_PORT: u16 = 4201;

const PERMDENY: &[u8] = b"PERMDENY";
const UNKNOWN: &[u8] = b"UNKNOWN";

#[derive(Debug, Error, PartialEq, Eq)]
#[error("malformed status request")]
pub struct RequestParseError;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StatusRequest {
    pub userid: String,
    pub mailbox: String,
}

impl StatusRequest {
    pub fn parse(raw: &[u8]) -> Result<Self, RequestParseError> {
        let text = std::str::from_utf8(raw).map_err(|_| RequestParseError)?;
        let mut parts = text.splitn(2, '|');
        let userid = parts.next().filter(|s| !s.is_empty()).ok_or(RequestParseError)?;
        let mailbox = parts.next().filter(|s| !s.is_empty()).ok_or(RequestParseError)?;
        Ok(StatusRequest {
            userid: userid.to_string(),
            mailbox: mailbox.to_string(),
        })
    }

    pub fn encode(&self) -> Vec<u8> {
        format!("{}|{}", self.userid, self.mailbox).into_bytes()
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StatusResponse {
    Found {
        userid: String,
        mailbox: String,
        num_recent: u32,
        last_read: u32,
        last_arrived: u32,
    },
    PermissionDenied,
    Unknown,
}

impl StatusResponse {
    pub fn encode(&self) -> Vec<u8> {
        match self {
            StatusResponse::Found {
                userid,
                mailbox,
                num_recent,
                last_read,
                last_arrived,
            } => format!("{userid}|{mailbox}|{num_recent}|{last_read}|{last_arrived}").into_bytes(),
            StatusResponse::PermissionDenied => PERMDENY.to_vec(),
            StatusResponse::Unknown => UNKNOWN.to_vec(),
        }
    }

    pub fn decode(raw: &[u8]) -> Self {
        if raw == PERMDENY {
            return StatusResponse::PermissionDenied;
        }
        if raw == UNKNOWN {
            return StatusResponse::Unknown;
        }
        let text = String::from_utf8_lossy(raw);
        let mut parts = text.splitn(5, '|');
        let (Some(userid), Some(mailbox), Some(num_recent), Some(last_read), Some(last_arrived)) = (
            parts.next(),
            parts.next(),
            parts.next(),
            parts.next(),
            parts.next(),
        ) else {
            return StatusResponse::Unknown;
        };
        match (num_recent.parse(), last_read.parse(), last_arrived.parse()) {
            (Ok(num_recent), Ok(last_read), Ok(last_arrived)) => StatusResponse::Found {
                userid: userid.to_string(),
                mailbox: mailbox.to_string(),
                num_recent,
                last_read,
                last_arrived,
            },
            _ => StatusResponse::Unknown,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn request_round_trips() {
        let req = StatusRequest {
            userid: "alice".to_string(),
            mailbox: "INBOX".to_string(),
        };
        assert_eq!(StatusRequest::parse(&req.encode()).unwrap(), req);
    }

    #[test]
    fn request_without_a_separator_is_rejected() {
        assert_eq!(StatusRequest::parse(b"alice"), Err(RequestParseError));
        assert_eq!(StatusRequest::parse(b"|INBOX"), Err(RequestParseError));
        assert_eq!(StatusRequest::parse(b"alice|"), Err(RequestParseError));
    }

    #[test]
    fn found_response_round_trips() {
        let resp = StatusResponse::Found {
            userid: "alice".to_string(),
            mailbox: "INBOX".to_string(),
            num_recent: 3,
            last_read: 1_700_000_000,
            last_arrived: 1_700_000_500,
        };
        assert_eq!(StatusResponse::decode(&resp.encode()), resp);
    }

    #[test]
    fn sentinel_responses_round_trip() {
        assert_eq!(
            StatusResponse::decode(&StatusResponse::PermissionDenied.encode()),
            StatusResponse::PermissionDenied
        );
        assert_eq!(
            StatusResponse::decode(&StatusResponse::Unknown.encode()),
            StatusResponse::Unknown
        );
    }

    #[test]
    fn garbage_decodes_as_unknown() {
        assert_eq!(StatusResponse::decode(b"not a valid reply"), StatusResponse::Unknown);
    }
}
