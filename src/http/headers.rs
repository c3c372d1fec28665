//! Request header registry
//!
//! This module provides the ordered header list handed to a transfer. Entries
//! are kept serialized (`"Key: Value"`, or a bare `"Key"`), exactly as they
//! will be looked up and written.

use super::{Error, Result};
use percent_encoding::{utf8_percent_encode, AsciiSet, NON_ALPHANUMERIC};
use std::fmt;
use tracing::debug;

/// Keys under this prefix carry percent-encoded values
pub const ENCODED_KEY_PREFIX: &str = "X-GP-";

/// Ordered request header entries
///
/// Entries are stored in insertion order. Uniqueness is not enforced;
/// `override_entry` and `remove` act on the first entry whose serialized
/// form starts with the lookup key.
#[derive(Debug, Clone, Default)]
pub struct Headers {
    entries: Vec<String>,
}

impl Headers {
    /// Create a new empty registry
    pub fn new() -> Self {
        Headers {
            entries: Vec::new(),
        }
    }

    /// Append a `key: value` entry
    pub fn append(&mut self, key: &str, value: &str) {
        self.push(key, Some(value));
    }

    /// Append a bare `key` entry
    pub fn append_key(&mut self, key: &str) {
        self.push(key, None);
    }

    /// Replace the first entry for `key`, or append it
    ///
    /// A `None` value looks up and writes a bare `key`.
    pub fn override_entry(&mut self, key: &str, value: Option<&str>) {
        let lookup = lookup_key(key, value.is_some());

        match self.position(&lookup) {
            Some(idx) => {
                let entry = build_entry(key, value, ": ");
                debug!(old = %self.entries[idx], new = %entry, "overriding header");
                self.entries[idx] = entry;
            }
            None => self.push(key, value),
        }
    }

    /// Remove the first entry for `key`
    ///
    /// `has_value` selects whether the lookup is `"key:"` or a bare `"key"`.
    /// Returns true when an entry was removed.
    pub fn remove(&mut self, key: &str, has_value: bool) -> bool {
        let lookup = lookup_key(key, has_value);

        match self.position(&lookup) {
            Some(idx) => {
                debug!(entry = %self.entries[idx], key = %lookup, "removing header");
                self.entries.remove(idx);
                true
            }
            None => {
                debug!(key = %lookup, "no header to remove");
                false
            }
        }
    }

    /// Get the value of the first `key: value` entry (case-insensitive)
    pub fn get(&self, key: &str) -> Option<&str> {
        self.entries.iter().find_map(|entry| {
            let (name, value) = entry.split_once(':')?;
            name.trim()
                .eq_ignore_ascii_case(key)
                .then(|| value.trim())
        })
    }

    /// Check whether any entry names `key` (case-insensitive)
    pub fn contains(&self, key: &str) -> bool {
        self.entries
            .iter()
            .any(|entry| entry_name(entry).eq_ignore_ascii_case(key))
    }

    /// Get the number of entries
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Check if there are no entries
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Clear all entries
    pub fn clear(&mut self) {
        self.entries.clear();
    }

    /// Iterate over the serialized entries
    pub fn iter(&self) -> impl Iterator<Item = &str> {
        self.entries.iter().map(String::as_str)
    }

    /// Serialized entries, in order
    pub fn entries(&self) -> &[String] {
        &self.entries
    }

    fn push(&mut self, key: &str, value: Option<&str>) {
        self.entries.push(build_entry(key, value, ": "));
    }

    fn position(&self, lookup: &str) -> Option<usize> {
        self.entries
            .iter()
            .position(|entry| entry.as_bytes().starts_with(lookup.as_bytes()))
    }

    /// Parse a header line into name and value
    pub fn parse_header_line(line: &str) -> Result<(String, String)> {
        if let Some(colon_pos) = line.find(':') {
            let name = line[..colon_pos].trim().to_string();
            let value = line[colon_pos + 1..].trim().to_string();

            if name.is_empty() {
                return Err(Error::InvalidHeader("Empty header name".to_string()));
            }

            Ok((name, value))
        } else {
            Err(Error::InvalidHeader(format!("No colon in header: {}", line)))
        }
    }
}

impl fmt::Display for Headers {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for entry in &self.entries {
            writeln!(f, "{}", entry)?;
        }
        Ok(())
    }
}

impl<'a> FromIterator<(&'a str, &'a str)> for Headers {
    fn from_iter<T: IntoIterator<Item = (&'a str, &'a str)>>(iter: T) -> Self {
        let mut headers = Headers::new();
        for (key, value) in iter {
            headers.append(key, value);
        }
        headers
    }
}

/// Name part of a serialized entry
pub(crate) fn entry_name(entry: &str) -> &str {
    let end = entry.find([':', ';']).unwrap_or(entry.len());
    entry[..end].trim()
}

fn lookup_key(key: &str, has_value: bool) -> String {
    build_entry(key, has_value.then_some(""), ":")
}

fn build_entry(key: &str, value: Option<&str>, separator: &str) -> String {
    let Some(value) = value else {
        return key.to_string();
    };

    if has_encoded_prefix(key) {
        format!("{}{}{}", key, separator, escape(value))
    } else {
        format!("{}{}{}", key, separator, value)
    }
}

fn has_encoded_prefix(key: &str) -> bool {
    key.len() >= ENCODED_KEY_PREFIX.len()
        && key.as_bytes()[..ENCODED_KEY_PREFIX.len()]
            .eq_ignore_ascii_case(ENCODED_KEY_PREFIX.as_bytes())
}

/// Bytes left as-is by `escape`: the unreserved URL characters
const UNRESERVED: &AsciiSet = &NON_ALPHANUMERIC.remove(b'-').remove(b'.').remove(b'_').remove(b'~');

/// Percent-encode everything except unreserved URL characters
pub fn escape(value: &str) -> String {
    utf8_percent_encode(value, UNRESERVED).to_string()
}
