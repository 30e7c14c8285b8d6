//! Line grammar of the event-juggling sub-protocol.
//!
//! ```text
//!   PING                          keepalive
//!   !<id> OK [payload]            response to one of our events
//!   !<id> ERR <json>              failure response
//!   <id> <opcode> [extra]         request from the peer
//! ```

use base64::Engine;
use base64::engine::general_purpose::STANDARD_NO_PAD;

use crate::error::RemoteError;

/// Prefix that marks a line as a response.
pub const RESPONSE_MARKER: char = '!';

/// Idle keepalive line, written by the output loop and ignored on input.
pub const KEEPALIVE: &str = "PING";

/// Length of an encoded correlation id.
pub const CORRELATION_ID_LEN: usize = 4;

/// Fresh 4-character correlation id: 3 random bytes, unpadded base64.
pub fn correlation_id() -> String {
    let bytes: [u8; 3] = rand::random();
    STANDARD_NO_PAD.encode(bytes)
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Status {
    Ok,
    Err,
}

/// One parsed inbound line.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Inbound {
    Keepalive,
    Response {
        id: String,
        status: Status,
        payload: Option<String>,
    },
    Request {
        id: String,
        opcode: String,
        extra: Option<String>,
    },
}

impl Inbound {
    /// Parse a line. On failure, returns the error and the id when one
    /// could be recovered so the caller can still answer it.
    pub fn parse(line: &str) -> Result<Self, (Option<String>, RemoteError)> {
        if line == KEEPALIVE {
            return Ok(Self::Keepalive);
        }

        if let Some(rest) = line.strip_prefix(RESPONSE_MARKER) {
            let mut parts = rest.splitn(3, ' ');
            let id = parts.next().unwrap_or_default();
            if id.is_empty() {
                return Err((None, RemoteError::Malformed("response without id".into())));
            }
            let status = match parts.next() {
                Some("OK") => Status::Ok,
                Some("ERR") => Status::Err,
                other => {
                    // Never answer a response; the id is not returned.
                    return Err((
                        None,
                        RemoteError::Malformed(format!(
                            "bad response status for {id}: {}",
                            other.unwrap_or("<none>")
                        )),
                    ));
                }
            };
            return Ok(Self::Response {
                id: id.to_string(),
                status,
                payload: parts.next().map(str::to_string),
            });
        }

        let mut parts = line.splitn(3, ' ');
        let id = parts.next().unwrap_or_default();
        if id.is_empty() {
            return Err((None, RemoteError::Malformed("request without id".into())));
        }
        match parts.next() {
            Some(opcode) if !opcode.is_empty() => Ok(Self::Request {
                id: id.to_string(),
                opcode: opcode.to_string(),
                extra: parts.next().map(str::to_string),
            }),
            _ => Err((
                Some(id.to_string()),
                RemoteError::Malformed("request without opcode".into()),
            )),
        }
    }
}

// ── Formatting ───────────────────────────────────────────────────

pub fn format_request(id: &str, payload: &str) -> String {
    format!("{id} {payload}")
}

pub fn format_ok(id: &str, payload: Option<&str>) -> String {
    match payload {
        Some(p) if !p.is_empty() => format!("{RESPONSE_MARKER}{id} OK {p}"),
        _ => format!("{RESPONSE_MARKER}{id} OK"),
    }
}

pub fn format_err(id: &str, error: &RemoteError) -> String {
    format!("{RESPONSE_MARKER}{id} ERR {}", error.to_json_payload())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn correlation_ids_are_four_base64_chars() {
        for _ in 0..64 {
            let id = correlation_id();
            assert_eq!(id.len(), CORRELATION_ID_LEN);
            assert!(
                id.chars()
                    .all(|c| c.is_ascii_alphanumeric() || c == '+' || c == '/')
            );
        }
    }

    #[test]
    fn parses_each_line_kind() {
        assert_eq!(Inbound::parse("PING").unwrap(), Inbound::Keepalive);
        assert_eq!(
            Inbound::parse("!AbC0 OK volume 7").unwrap(),
            Inbound::Response {
                id: "AbC0".into(),
                status: Status::Ok,
                payload: Some("volume 7".into()),
            }
        );
        assert_eq!(
            Inbound::parse("!AbC0 ERR").unwrap(),
            Inbound::Response {
                id: "AbC0".into(),
                status: Status::Err,
                payload: None,
            }
        );
        assert_eq!(
            Inbound::parse("x9Zq KEY 66").unwrap(),
            Inbound::Request {
                id: "x9Zq".into(),
                opcode: "KEY".into(),
                extra: Some("66".into()),
            }
        );
        assert_eq!(
            Inbound::parse("x9Zq TEXT hello world").unwrap(),
            Inbound::Request {
                id: "x9Zq".into(),
                opcode: "TEXT".into(),
                extra: Some("hello world".into()),
            }
        );
    }

    #[test]
    fn malformed_lines_keep_recoverable_id() {
        let (id, err) = Inbound::parse("x9Zq").unwrap_err();
        assert_eq!(id.as_deref(), Some("x9Zq"));
        assert!(matches!(err, RemoteError::Malformed(_)));

        let (id, _) = Inbound::parse("!AbC0 MAYBE").unwrap_err();
        assert_eq!(id, None);
        let (id, _) = Inbound::parse("").unwrap_err();
        assert_eq!(id, None);
    }

    #[test]
    fn formats_responses() {
        assert_eq!(format_request("AbC0", "volume main 7"), "AbC0 volume main 7");
        assert_eq!(format_ok("AbC0", None), "!AbC0 OK");
        assert_eq!(format_ok("AbC0", Some("")), "!AbC0 OK");
        assert_eq!(format_ok("AbC0", Some("done")), "!AbC0 OK done");
        let line = format_err("AbC0", &RemoteError::UnsupportedOperation("FOO".into()));
        assert!(line.starts_with("!AbC0 ERR {"));
        assert!(line.contains("unsupported_operation"));
    }
}
