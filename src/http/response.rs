//! Response validation
//!
//! Completed transfers are checked in two passes: the transport outcome
//! first, then the HTTP status. A failing status is turned into a
//! `Diagnostic` by scraping the most readable text out of the error body,
//! which may be an HTML page, a JSON document or plain text.

use super::config::Verbosity;
use super::{Error, Result, Session, Transfer, TransferError};
use serde_json::Value;
use std::fmt;
use tracing::debug;

/// Message used when nothing answered at all
pub const NO_LISTENER_MESSAGE: &str =
    "There is no service listening on the host and port specified in the table url";

/// Message used for a 404 answer
pub const NOT_REACHABLE_MESSAGE: &str =
    "remote data service could not be reached. The service is not running at the target address";

/// Hint attached when the service looks down
pub const START_HINT: &str = "Use the service's start command to start the remote data service.";

/// Readable account of a failed response
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct Diagnostic {
    pub message: String,
    pub hint: Option<String>,
    pub trace: Option<String>,
}

impl Diagnostic {
    fn message(message: impl Into<String>) -> Self {
        Diagnostic {
            message: message.into(),
            ..Diagnostic::default()
        }
    }

    fn service_down(message: impl Into<String>) -> Self {
        Diagnostic {
            message: message.into(),
            hint: Some(START_HINT.to_string()),
            trace: None,
        }
    }
}

impl fmt::Display for Diagnostic {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.message)
    }
}

/// Drain the completion queue, failing on the first unsuccessful transfer
pub fn check_transport_status(session: &mut Session) -> Result<()> {
    while let Some(completion) = session.info_read() {
        let code = match completion.result {
            Ok(()) => {
                debug!(id = %completion.id, "transfer done with status OK");
                continue;
            }
            Err(code) => code,
        };

        let transfer = session.transfer(completion.id);
        let peer = transfer.and_then(Transfer::peer_addr);
        let detail = transfer
            .map(Transfer::diagnostics)
            .filter(|text| !text.is_empty())
            .map(str::to_string);

        return Err(Error::Transfer(TransferError { code, peer, detail }));
    }
    Ok(())
}

/// Check the HTTP status of `transfer`
///
/// `body` is whatever response body has been buffered so far. A missing
/// status is only an error once the transfer has stopped.
pub fn check_application_status(
    transfer: &Transfer,
    running: bool,
    body: &[u8],
    verbosity: Verbosity,
) -> Result<()> {
    let status = transfer.response_code();
    debug!(status, "http response code");

    if status == 0 && running {
        debug!("still running, no response yet");
        return Ok(());
    }
    if status == 100 || status == 200 {
        return Ok(());
    }

    let body = String::from_utf8_lossy(body);
    let diagnostic = extract_error_message(status, Some(&body), transfer.diagnostics(), verbosity);
    Err(Error::Status { status, diagnostic })
}

/// Derive a diagnostic from a failing status and its body
///
/// Rules, first match wins: no response, 404, empty body, HTML paragraph,
/// HTML title, JSON fields, raw body.
pub fn extract_error_message(
    status: u16,
    body: Option<&str>,
    diagnostics: &str,
    verbosity: Verbosity,
) -> Diagnostic {
    if status == 0 {
        if diagnostics.is_empty() {
            return Diagnostic::service_down(NO_LISTENER_MESSAGE);
        }
        return Diagnostic::service_down(diagnostics);
    }

    if status == 404 {
        return Diagnostic::service_down(NOT_REACHABLE_MESSAGE);
    }

    let body = match body {
        Some(body) if !body.is_empty() => body,
        _ => {
            return Diagnostic::message(format!(
                "HTTP status code is {} but HTTP response string is empty",
                status
            ))
        }
    };

    if let Some(paragraph) = html_paragraph(body) {
        return Diagnostic::message(paragraph);
    }

    if let Some(title) = html_title(body) {
        return Diagnostic::message(title);
    }

    match serde_json::from_str::<Value>(body) {
        Ok(json) => json_diagnostic(&json, body, verbosity),
        Err(_) => Diagnostic::message(body),
    }
}

/// Text of the first `<p>` inside `<body>`, up to the end of the line
/// holding `</p>`
fn html_paragraph(body: &str) -> Option<String> {
    let body_at = body.find("<body>")?;
    let start = body_at + body[body_at..].find("<p>")? + "<p>".len();
    let close = start + body[start..].find("</p>")?;
    let end = body[close..].find('\n').map_or(close, |nl| close + nl);

    Some(collapse_markup(&body[start..end]))
}

/// Replace each tag span with one space and drop line breaks
///
/// A space that directly follows a tag is merged into the tag's space. An
/// unterminated tag swallows the rest of the text. Surrounding whitespace is
/// kept as found.
fn collapse_markup(text: &str) -> String {
    let mut out = String::with_capacity(text.len());
    let mut in_tag = false;
    let mut after_tag = false;

    for c in text.chars() {
        match c {
            '<' => {
                in_tag = true;
                if !out.ends_with(' ') {
                    out.push(' ');
                }
            }
            '>' => {
                if in_tag {
                    in_tag = false;
                    after_tag = true;
                }
            }
            '\n' | '\r' => {}
            _ if in_tag => {}
            ' ' if after_tag && out.ends_with(' ') => {}
            c => {
                out.push(c);
                after_tag = false;
            }
        }
    }

    out
}

fn html_title(body: &str) -> Option<String> {
    let start = body.find("<title>")? + "<title>".len();
    let len = body[start..].find("</title>")?;
    Some(body[start..start + len].to_string())
}

fn json_diagnostic(json: &Value, raw: &str, verbosity: Verbosity) -> Diagnostic {
    let trace = if verbosity.includes(Verbosity::Log) {
        field_text(json, "trace")
    } else {
        None
    };
    let hint = field_text(json, "hint");

    let message = match field_text(json, "message") {
        Some(message) => match message.split_once('\n') {
            Some((first, _)) => first.to_string(),
            None => message,
        },
        None => raw.to_string(),
    };

    Diagnostic {
        message,
        hint,
        trace,
    }
}

/// Text of an object field; strings unquoted, `null` and absence as `None`
fn field_text(json: &Value, key: &str) -> Option<String> {
    match json.as_object()?.get(key)? {
        Value::Null => None,
        Value::String(s) => Some(s.clone()),
        other => Some(other.to_string()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::http::Endpoint;

    fn extract(status: u16, body: &str) -> Diagnostic {
        extract_error_message(status, Some(body), "", Verbosity::Warning)
    }

    fn answered(status: u16) -> Transfer {
        let endpoint = Endpoint::parse("http://127.0.0.1:5888/pxf/read").unwrap();
        let mut transfer = Transfer::new(endpoint);
        transfer.set_response_code(status);
        transfer
    }

    #[test]
    fn test_no_status_while_running_is_ok() {
        let transfer = answered(0);
        assert!(check_application_status(&transfer, true, b"", Verbosity::Warning).is_ok());
    }

    #[test]
    fn test_no_status_after_stop() {
        let transfer = answered(0);
        match check_application_status(&transfer, false, b"", Verbosity::Warning) {
            Err(Error::Status { status, diagnostic }) => {
                assert_eq!(status, 0);
                assert_eq!(diagnostic.message, NO_LISTENER_MESSAGE);
                assert_eq!(diagnostic.hint.as_deref(), Some(START_HINT));
            }
            other => panic!("unexpected result: {:?}", other),
        }
    }

    #[test]
    fn test_continue_and_ok_pass() {
        for running in [true, false] {
            for status in [100, 200] {
                let transfer = answered(status);
                assert!(
                    check_application_status(&transfer, running, b"", Verbosity::Warning).is_ok(),
                    "status {} running {}",
                    status,
                    running
                );
            }
        }
    }

    #[test]
    fn test_failing_status_uses_body() {
        let transfer = answered(500);
        let body = br#"{"message":"no such table","hint":"check the name"}"#;
        match check_application_status(&transfer, true, body, Verbosity::Warning) {
            Err(Error::Status { status, diagnostic }) => {
                assert_eq!(status, 500);
                assert_eq!(diagnostic.message, "no such table");
                assert_eq!(diagnostic.hint.as_deref(), Some("check the name"));
            }
            other => panic!("unexpected result: {:?}", other),
        }

        let transfer = answered(204);
        let err = check_application_status(&transfer, false, b"", Verbosity::Warning).unwrap_err();
        assert_eq!(
            err.to_string(),
            "remote service error (204): HTTP status code is 204 but HTTP response string is empty"
        );
    }

    #[test]
    fn test_no_response() {
        let diag = extract_error_message(0, None, "", Verbosity::Warning);
        assert_eq!(diag.message, NO_LISTENER_MESSAGE);
        assert!(diag.hint.unwrap().contains("start"));

        let diag = extract_error_message(
            0,
            None,
            "Failed to connect to 127.0.0.1 port 5888: Connection refused",
            Verbosity::Warning,
        );
        assert_eq!(
            diag.message,
            "Failed to connect to 127.0.0.1 port 5888: Connection refused"
        );
    }

    #[test]
    fn test_not_found() {
        let diag = extract(404, "<html><title>ignored</title></html>");
        assert!(diag.message.contains("service could not be reached"));
        assert!(diag.hint.unwrap().contains("start"));
        assert_eq!(diag.trace, None);
    }

    #[test]
    fn test_empty_body() {
        let expected = "HTTP status code is 500 but HTTP response string is empty";
        assert_eq!(extract(500, "").message, expected);
        assert_eq!(
            extract_error_message(500, None, "", Verbosity::Warning).message,
            expected
        );
    }

    #[test]
    fn test_html_paragraph() {
        let diag = extract(500, "<html><body><p>Foo<pre>bar</pre> Baz</p></body></html>");
        assert_eq!(diag.message, "Foo bar Baz");
        assert_eq!(diag.hint, None);
    }

    #[test]
    fn test_html_paragraph_strips_line_breaks() {
        let body = "<html><body><h1>Error</h1><p>type Exception\r\nreport</p>\n</body></html>";
        assert_eq!(extract(500, body).message, "type Exceptionreport ");
    }

    #[test]
    fn test_html_paragraph_takes_rest_of_line() {
        let body = "<body><p>first</p> tail\nnext line</body>";
        assert_eq!(extract(500, body).message, "first tail");
    }

    #[test]
    fn test_html_unterminated_tag() {
        assert_eq!(extract(500, "<body><p>Broken <b unterminated</p>").message, "Broken ");
        assert_eq!(extract(500, "<body><p>a > b</p>").message, "a  b");
    }

    #[test]
    fn test_html_paragraph_keeps_outer_spaces() {
        assert_eq!(extract(500, "<body><p> Foo </p>").message, " Foo ");
        assert_eq!(extract(500, "<body><p><b>Foo</b></p>\n").message, " Foo ");
    }

    #[test]
    fn test_html_paragraph_without_close_falls_through() {
        let body = "<html><title>Oops</title><body><p>never closed</body></html>";
        assert_eq!(extract(500, body).message, "Oops");
    }

    #[test]
    fn test_html_title() {
        let diag = extract(503, "<html><head><title>Service Unavailable</title></head></html>");
        assert_eq!(diag.message, "Service Unavailable");
    }

    #[test]
    fn test_json_fields() {
        let body = r#"{"message":"boom\nmore","trace":"T","hint":"H"}"#;

        let diag = extract_error_message(500, Some(body), "", Verbosity::Warning);
        assert_eq!(diag.message, "boom");
        assert_eq!(diag.hint.as_deref(), Some("H"));
        assert_eq!(diag.trace, None);

        let diag = extract_error_message(500, Some(body), "", Verbosity::Log);
        assert_eq!(diag.trace.as_deref(), Some("T"));

        let diag = extract_error_message(500, Some(body), "", Verbosity::Debug1);
        assert_eq!(diag.trace.as_deref(), Some("T"));
    }

    #[test]
    fn test_json_without_message() {
        let body = r#"{"status":500,"hint":null}"#;
        let diag = extract(500, body);
        assert_eq!(diag.message, body);
        assert_eq!(diag.hint, None);
    }

    #[test]
    fn test_json_non_string_fields() {
        let diag = extract(500, r#"{"message":42,"hint":["a"]}"#);
        assert_eq!(diag.message, "42");
        assert_eq!(diag.hint.as_deref(), Some(r#"["a"]"#));
    }

    #[test]
    fn test_json_array_is_raw() {
        assert_eq!(extract(500, r#"["message"]"#).message, r#"["message"]"#);
    }

    #[test]
    fn test_plain_text() {
        assert_eq!(extract(400, "bad request: no such table").message, "bad request: no such table");
    }

    #[test]
    fn test_diagnostic_display() {
        let diag = Diagnostic {
            message: "boom".to_string(),
            hint: Some("H".to_string()),
            trace: None,
        };
        assert_eq!(diag.to_string(), "boom");
    }
}
