//! HTTP message types
//!
//! This module defines the request line, status code and version types used
//! by the transfer state machine, plus the serializer for request heads.

use super::headers::entry_name;
use super::{Error, Result, CRLF};
use std::fmt;

/// HTTP methods used by the transport
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Method {
    Get,
    Post,
}

impl Method {
    /// Convert method to string
    pub fn as_str(&self) -> &'static str {
        match self {
            Method::Get => "GET",
            Method::Post => "POST",
        }
    }
}

impl fmt::Display for Method {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// HTTP version
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum Version {
    Http10,
    #[default]
    Http11,
}

impl Version {
    /// Parse version from string
    pub fn from_str(s: &str) -> Result<Self> {
        match s {
            "HTTP/1.0" => Ok(Version::Http10),
            "HTTP/1.1" => Ok(Version::Http11),
            _ => Err(Error::InvalidVersion(s.to_string())),
        }
    }

    /// Convert version to string
    pub fn as_str(&self) -> &'static str {
        match self {
            Version::Http10 => "HTTP/1.0",
            Version::Http11 => "HTTP/1.1",
        }
    }
}

impl fmt::Display for Version {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// HTTP status code
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Status {
    code: u16,
}

impl Status {
    /// Create a new status code
    pub fn new(code: u16) -> Result<Self> {
        if (100..600).contains(&code) {
            Ok(Status { code })
        } else {
            Err(Error::InvalidStatus(format!("Invalid status code: {}", code)))
        }
    }

    /// Get the status code
    pub fn code(&self) -> u16 {
        self.code
    }

    /// Get the canonical reason phrase for this status code
    pub fn reason_phrase(&self) -> &'static str {
        match self.code {
            100 => "Continue",
            200 => "OK",
            204 => "No Content",
            304 => "Not Modified",
            400 => "Bad Request",
            404 => "Not Found",
            413 => "Payload Too Large",
            417 => "Expectation Failed",
            500 => "Internal Server Error",
            502 => "Bad Gateway",
            503 => "Service Unavailable",
            _ => "Unknown",
        }
    }

    /// Check if this is an informational status (1xx)
    pub fn is_informational(&self) -> bool {
        (100..200).contains(&self.code)
    }

    /// Check whether a response with this status can carry a body
    pub fn has_body(&self) -> bool {
        !self.is_informational() && self.code != 204 && self.code != 304
    }

    pub const CONTINUE: Status = Status { code: 100 };
    pub const OK: Status = Status { code: 200 };
    pub const NOT_FOUND: Status = Status { code: 404 };
}

impl fmt::Display for Status {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} {}", self.code, self.reason_phrase())
    }
}

/// Request line plus header entries, ready to be serialized
#[derive(Debug, Clone)]
pub struct RequestHead<'a> {
    pub method: Method,
    pub target: &'a str,
    pub host: &'a str,
    pub entries: &'a [String],
}

impl RequestHead<'_> {
    /// Convert the request head to wire format
    ///
    /// `Host` and `Accept` are added unless an entry names them. Entries
    /// follow transport-library conventions: `"Key:"` with no value suppresses
    /// a default header, `"Key;"` sends it with an empty value, and a bare
    /// `"Key"` is not sent.
    pub fn to_wire(&self) -> Vec<u8> {
        let mut buf = Vec::with_capacity(256);

        buf.extend_from_slice(self.method.as_str().as_bytes());
        buf.push(b' ');
        buf.extend_from_slice(self.target.as_bytes());
        buf.push(b' ');
        buf.extend_from_slice(Version::Http11.as_str().as_bytes());
        buf.extend_from_slice(CRLF.as_bytes());

        let host = format!("Host: {}", self.host);
        for default in [host.as_str(), "Accept: */*"] {
            let name = entry_name(default);
            if !self.entries.iter().any(|e| entry_name(e).eq_ignore_ascii_case(name)) {
                push_line(&mut buf, default);
            }
        }

        for entry in self.entries {
            if let Some((name, value)) = entry.split_once(':') {
                if value.trim().is_empty() {
                    continue;
                }
                push_line(&mut buf, &format!("{}:{}", name, value));
            } else if let Some(name) = entry.strip_suffix(';') {
                push_line(&mut buf, &format!("{}:", name));
            }
        }

        buf.extend_from_slice(CRLF.as_bytes());
        buf
    }
}

fn push_line(buf: &mut Vec<u8>, line: &str) {
    buf.extend_from_slice(line.as_bytes());
    buf.extend_from_slice(CRLF.as_bytes());
}
