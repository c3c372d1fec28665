//! HTTP response head parsing
//!
//! The transfer accumulates raw response bytes and hands complete heads
//! (status line plus header lines, terminated by an empty line) to this
//! module.

use super::{Error, Headers, Result, Status, Version};

/// Upper bound on a response head before the reply is considered garbage
pub const MAX_HEAD_SIZE: usize = 64 * 1024;

/// Find the next CRLF in a buffer
fn find_crlf(buf: &[u8]) -> Option<usize> {
    buf.windows(2).position(|w| w == b"\r\n")
}

/// Find the end of a response head
///
/// Returns the offset just past the `\r\n\r\n` terminator.
pub fn find_head_end(buf: &[u8]) -> Option<usize> {
    buf.windows(4).position(|w| w == b"\r\n\r\n").map(|pos| pos + 4)
}

/// Split a complete head into its lines, without line terminators
pub fn head_lines(head: &[u8]) -> impl Iterator<Item = &[u8]> {
    let mut rest = head;
    std::iter::from_fn(move || {
        let pos = find_crlf(rest)?;
        if pos == 0 {
            return None;
        }
        let line = &rest[..pos];
        rest = &rest[pos + 2..];
        Some(line)
    })
}

/// Parse HTTP response status line
///
/// Format: VERSION STATUS REASON\r\n
/// Example: HTTP/1.1 200 OK\r\n
pub fn parse_status_line(line: &str) -> Result<(Version, Status, String)> {
    let parts: Vec<&str> = line.splitn(3, ' ').collect();

    if parts.len() < 2 {
        return Err(Error::Parse(format!(
            "Invalid status line: expected at least 2 parts, got {}",
            parts.len()
        )));
    }

    let version = Version::from_str(parts[0])?;
    let status_code = parts[1]
        .parse::<u16>()
        .map_err(|_| Error::Parse(format!("Invalid status code: {}", parts[1])))?;
    let status = Status::new(status_code)?;
    let reason = if parts.len() == 3 {
        parts[2].to_string()
    } else {
        status.reason_phrase().to_string()
    };

    Ok((version, status, reason))
}

/// Parsed response head
#[derive(Debug, Clone)]
pub struct ResponseHead {
    pub version: Version,
    pub status: Status,
    pub reason: String,
    pub fields: Vec<(String, String)>,
}

impl ResponseHead {
    /// Get the first value for a field (case-insensitive)
    pub fn field(&self, name: &str) -> Option<&str> {
        self.fields
            .iter()
            .find(|(n, _)| n.eq_ignore_ascii_case(name))
            .map(|(_, v)| v.as_str())
    }

    /// Check whether the body uses chunked transfer coding
    pub fn is_chunked(&self) -> bool {
        self.field("Transfer-Encoding")
            .map(|te| {
                te.split(',')
                    .any(|coding| coding.trim().eq_ignore_ascii_case("chunked"))
            })
            .unwrap_or(false)
    }

    /// Declared body length, if any
    pub fn content_length(&self) -> Result<Option<u64>> {
        match self.field("Content-Length") {
            Some(cl) => cl
                .parse::<u64>()
                .map(Some)
                .map_err(|_| Error::Parse(format!("Invalid Content-Length: {}", cl))),
            None => Ok(None),
        }
    }
}

/// Parse a complete response head
pub fn parse_response_head(head: &[u8]) -> Result<ResponseHead> {
    let mut lines = head_lines(head);

    let status_line = lines
        .next()
        .ok_or_else(|| Error::Parse("Empty response head".to_string()))?;
    let (version, status, reason) = parse_status_line(&String::from_utf8_lossy(status_line))?;

    let mut fields = Vec::new();
    for line in lines {
        let (name, value) = Headers::parse_header_line(&String::from_utf8_lossy(line))?;
        fields.push((name, value));
    }

    Ok(ResponseHead {
        version,
        status,
        reason,
        fields,
    })
}
