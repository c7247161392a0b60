//! Best-effort text extraction from streamed JSON lines.
//!
//! Workers in streaming mode print one JSON record per line. There is no
//! schema: we look for a text payload in a fixed priority order and fall back to
//! the raw line whenever the record does not look like anything we know.

use std::borrow::Cow;

use serde_json::Value;

/// Top-level string fields checked in order.
const TEXT_FIELDS: [&str; 3] = ["text", "content", "delta"];

/// Extract the text payload from one JSON line, if it carries a nonempty one.
///
/// Checks `text`, `content`, `delta`, then the `delta.content` of the first
/// entry in an OpenAI-style `choices` array that has one.
pub fn extract_text(line: &str) -> Option<String> {
    let value: Value = serde_json::from_str(line).ok()?;
    let record = value.as_object()?;

    for field in TEXT_FIELDS {
        if let Some(text) = record.get(field).and_then(nonempty_str) {
            return Some(text.to_string());
        }
    }

    record.get("choices")?.as_array()?.iter().find_map(|choice| {
        choice
            .get("delta")
            .and_then(|delta| delta.get("content"))
            .and_then(nonempty_str)
            .map(str::to_string)
    })
}

/// Fragment to forward for one raw output line (newline included).
///
/// Extracted text is forwarded as-is; anything else is forwarded verbatim.
pub fn resolve_fragment(line: &str) -> Cow<'_, str> {
    let trimmed = line.trim_end_matches(['\n', '\r']);
    match extract_text(trimmed) {
        Some(text) => Cow::Owned(text),
        None => Cow::Borrowed(line),
    }
}

fn nonempty_str(value: &Value) -> Option<&str> {
    value.as_str().filter(|text| !text.is_empty())
}
