//! Redis-style glob patterns, as used by KEYS and SCAN MATCH. Supports `*`,
//! `?`, `[...]` character classes and `\` escapes, compiled down to a byte
//! regex.

use crate::error::{Error, Result};

/// A compiled glob pattern.
pub struct Pattern {
    regex: regex::bytes::Regex,
    prefix: Vec<u8>,
}

impl Pattern {
    /// Compiles a glob pattern.
    pub fn compile(pattern: &[u8]) -> Result<Self> {
        let mut re = String::from("(?s-u)^");
        let mut chars = pattern.iter().copied().peekable();
        while let Some(b) = chars.next() {
            match b {
                b'*' => re.push_str(".*"),
                b'?' => re.push('.'),
                b'[' => {
                    re.push('[');
                    if chars.peek() == Some(&b'^') {
                        chars.next();
                        re.push('^');
                    }
                    let mut closed = false;
                    for c in chars.by_ref() {
                        if c == b']' {
                            closed = true;
                            break;
                        }
                        push_byte(&mut re, c, true);
                    }
                    if !closed {
                        return Err(Error::InvalidInput("unterminated character class".into()));
                    }
                    re.push(']');
                }
                b'\\' => match chars.next() {
                    Some(c) => push_byte(&mut re, c, false),
                    None => return Err(Error::InvalidInput("trailing backslash".into())),
                },
                c => push_byte(&mut re, c, false),
            }
        }
        re.push('$');
        let regex = regex::bytes::Regex::new(&re)
            .map_err(|err| Error::InvalidInput(format!("invalid pattern: {err}")))?;
        Ok(Self { regex, prefix: literal_prefix(pattern) })
    }

    /// Returns true if the pattern matches the given key.
    pub fn matches(&self, key: &[u8]) -> bool {
        self.regex.is_match(key)
    }

    /// The literal characters up to the first wildcard. Any match must start
    /// with this prefix, which lets scans skip the rest of the keyspace:
    /// best-case patterns like `fixed-prefix-*` scan only their matches.
    pub fn prefix(&self) -> &[u8] {
        &self.prefix
    }

    /// Returns true if the pattern matches every key.
    pub fn matches_all(&self) -> bool {
        self.prefix.is_empty() && self.regex.as_str() == "(?s-u)^.*$"
    }
}

/// Appends a byte to the regex, escaped as needed. Inside character classes
/// the dash is kept verbatim to preserve ranges.
fn push_byte(re: &mut String, b: u8, in_class: bool) {
    match b {
        b'a'..=b'z' | b'A'..=b'Z' | b'0'..=b'9' | b'_' => re.push(b as char),
        b'-' if in_class => re.push('-'),
        b if b.is_ascii() => {
            re.push('\\');
            re.push(b as char);
        }
        b => re.push_str(&format!("\\x{b:02x}")),
    }
}

/// Extracts the literal prefix of a glob pattern.
fn literal_prefix(pattern: &[u8]) -> Vec<u8> {
    let mut prefix = Vec::new();
    let mut chars = pattern.iter().copied();
    while let Some(b) = chars.next() {
        match b {
            b'*' | b'?' | b'[' => break,
            b'\\' => match chars.next() {
                Some(c) => prefix.push(c),
                None => break,
            },
            c => prefix.push(c),
        }
    }
    prefix
}
