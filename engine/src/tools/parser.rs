use std::collections::HashSet;

use tracing::warn;

use super::{ToolCall, ToolKind};

/// A raw bracketed marker lifted out of LLM output: an uppercase name plus
/// `key="value"` arguments.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Marker {
    pub name: String,
    pub args: Vec<(String, String)>,
    /// Byte range of the marker in the scanned text, brackets included.
    pub start: usize,
    pub end: usize,
}

impl Marker {
    pub fn arg(&self, key: &str) -> Option<&str> {
        self.args
            .iter()
            .find(|(k, _)| k == key)
            .map(|(_, v)| v.as_str())
    }
}

/// Scan text for every well-formed `[NAME key="value" ...]` marker.
///
/// One lexer for the whole grammar: tool markers and action tags both come
/// through here. Malformed brackets are skipped, not errors; the text is
/// model output and most brackets are prose.
pub fn scan_markers(text: &str) -> Vec<Marker> {
    let bytes = text.as_bytes();
    let mut markers = Vec::new();
    let mut i = 0;

    while i < bytes.len() {
        if bytes[i] != b'[' {
            i += 1;
            continue;
        }
        match lex_marker(text, i) {
            Some(marker) => {
                i = marker.end;
                markers.push(marker);
            }
            None => i += 1,
        }
    }

    markers
}

/// Try to lex one marker starting at the `[` at byte `start`.
fn lex_marker(text: &str, start: usize) -> Option<Marker> {
    let bytes = text.as_bytes();
    let mut i = start + 1;

    // Marker names are uppercase words; case-sensitive by contract.
    let name_start = i;
    while i < bytes.len() && bytes[i].is_ascii_uppercase() {
        i += 1;
    }
    if i == name_start {
        return None;
    }
    let name = &text[name_start..i];

    let mut args = Vec::new();
    loop {
        while i < bytes.len() && bytes[i] == b' ' {
            i += 1;
        }
        if i >= bytes.len() {
            return None;
        }
        if bytes[i] == b']' {
            return Some(Marker {
                name: name.to_string(),
                args,
                start,
                end: i + 1,
            });
        }

        // key
        let key_start = i;
        while i < bytes.len() && (bytes[i].is_ascii_lowercase() || bytes[i] == b'_') {
            i += 1;
        }
        if i == key_start || i >= bytes.len() || bytes[i] != b'=' {
            return None;
        }
        let key = &text[key_start..i];
        i += 1;

        // ="value" with \" and \\ escapes
        if i >= bytes.len() || bytes[i] != b'"' {
            return None;
        }
        i += 1;
        let mut value = String::new();
        loop {
            if i >= bytes.len() {
                return None;
            }
            match bytes[i] {
                b'"' => {
                    i += 1;
                    break;
                }
                b'\\' if i + 1 < bytes.len() && (bytes[i + 1] == b'"' || bytes[i + 1] == b'\\') => {
                    value.push(bytes[i + 1] as char);
                    i += 2;
                }
                _ => {
                    // Values are arbitrary text; walk char boundaries.
                    let ch = text[i..].chars().next()?;
                    value.push(ch);
                    i += ch.len_utf8();
                }
            }
        }
        args.push((key.to_string(), value));
    }
}

/// Parse the four tool markers out of a response draft.
///
/// The first occurrence of each kind wins; later duplicates are ignored.
/// Markers with missing required arguments are logged and dropped.
pub fn parse_tool_calls(text: &str) -> Vec<ToolCall> {
    let mut seen: HashSet<ToolKind> = HashSet::new();
    let mut calls = Vec::new();

    for marker in scan_markers(text) {
        let Some(kind) = ToolKind::from_label(&marker.name) else {
            continue;
        };
        if seen.contains(&kind) {
            continue;
        }

        let call = match kind {
            ToolKind::Grep => marker.arg("term").map(|term| ToolCall::Grep {
                term: term.to_string(),
            }),
            ToolKind::Squirrel => Some(ToolCall::Squirrel {
                timeframe: marker.arg("timeframe").map(str::to_string),
                back: marker.arg("back").and_then(|raw| raw.parse().ok()),
                search: marker.arg("search").map(str::to_string),
            }),
            ToolKind::Vector => marker.arg("query").map(|query| ToolCall::Vector {
                query: query.to_string(),
            }),
            ToolKind::Episodic => marker.arg("query").map(|query| ToolCall::Episodic {
                query: query.to_string(),
                timeframe: marker.arg("timeframe").map(str::to_string),
            }),
        };

        match call {
            Some(call) => {
                seen.insert(kind);
                calls.push(call);
            }
            None => {
                warn!(marker = %marker.name, "tool marker missing required arguments, ignoring");
            }
        }
    }

    calls
}

/// Incremental marker remover for streamed output.
///
/// Chunks may split a marker anywhere, so a trailing `[` that could still
/// become one is held back until the next push (or flush) resolves it.
#[derive(Default)]
pub struct MarkerStripper {
    pending: String,
}

impl MarkerStripper {
    /// Feed one chunk, get back the displayable prefix with complete markers
    /// removed.
    pub fn push(&mut self, chunk: &str) -> String {
        self.pending.push_str(chunk);
        let (clean, rest) = strip_complete(&self.pending);
        self.pending = rest;
        clean
    }

    /// Flush whatever is held back. An unterminated marker at end of stream
    /// is emitted verbatim; it never became a marker.
    pub fn finish(&mut self) -> String {
        std::mem::take(&mut self.pending)
    }
}

/// Remove complete known markers; return (clean_prefix, held_back_suffix).
fn strip_complete(text: &str) -> (String, String) {
    let mut clean = String::with_capacity(text.len());
    let mut i = 0;
    let bytes = text.as_bytes();

    while i < bytes.len() {
        if bytes[i] == b'[' {
            if let Some(marker) = lex_marker(text, i) {
                if is_known_marker(&marker.name) {
                    i = marker.end;
                    continue;
                }
                // Complete but unknown marker: prose, keep it.
                clean.push_str(&text[i..marker.end]);
                i = marker.end;
                continue;
            }
            // Incomplete bracket: if no closing bracket follows, this could
            // still grow into a marker with the next chunk.
            if !text[i..].contains(']') {
                return (clean, text[i..].to_string());
            }
        }
        let ch = match text[i..].chars().next() {
            Some(ch) => ch,
            None => break,
        };
        clean.push(ch);
        i += ch.len_utf8();
    }

    (clean, String::new())
}

fn is_known_marker(name: &str) -> bool {
    ToolKind::from_label(name).is_some()
        || matches!(name, "REMEMBER" | "REFLECT" | "ESCALATE")
}
