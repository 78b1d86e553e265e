use memchr::memchr;
use once_cell::sync::Lazy;
use regex::Regex;
use serde::Serialize;

use crate::util::ac_for;

/// Default upper bound on a chat message, in characters.
pub const DEFAULT_MAX_LENGTH: usize = 2000;

const DENY_LITERALS: &[&str] = &["<script", "<iframe", "javascript:"];

static EVENT_HANDLER_RE: Lazy<Regex> = Lazy::new(|| {
    Regex::new(
        r"(?i)\bon(?:abort|blur|change|click|dblclick|error|focus|input|keydown|keypress|keyup|load|mousedown|mouseenter|mouseleave|mousemove|mouseout|mouseover|mouseup|pointerdown|pointerup|reset|resize|scroll|select|submit|toggle|unload|wheel)\s*=",
    )
    .unwrap()
});

static SCRIPT_STYLE_RE: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"(?is)<script\b[^>]*>.*?</script\s*>|<style\b[^>]*>.*?</style\s*>").unwrap()
});

/// Result of validating one chat message.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Validation {
    pub valid: bool,
    pub cleaned: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl Validation {
    fn rejected(error: String) -> Self {
        Validation {
            valid: false,
            cleaned: String::new(),
            error: Some(error),
        }
    }

    pub fn into_result(self) -> Result<String, String> {
        match self.error {
            Some(err) => Err(err),
            None => Ok(self.cleaned),
        }
    }
}

/// Strip markup, NUL bytes and surrounding whitespace.
pub fn sanitize(raw: &str) -> String {
    let without_nul = raw.replace('\0', "");
    let without_blocks = SCRIPT_STYLE_RE.replace_all(&without_nul, "");
    strip_tags(&without_blocks).trim().to_string()
}

/// Remove everything between `<` and the next `>`.  A `<` followed by
/// whitespace (or at the very end) is ordinary text; an unterminated tag
/// swallows the rest of the input.
fn strip_tags(input: &str) -> String {
    let bytes = input.as_bytes();
    let mut out = String::with_capacity(input.len());
    let mut pos = 0;
    while let Some(rel) = memchr(b'<', &bytes[pos..]) {
        let lt = pos + rel;
        let next = bytes.get(lt + 1).copied();
        match next {
            Some(c) if !c.is_ascii_whitespace() => {
                out.push_str(&input[pos..lt]);
                match memchr(b'>', &bytes[lt..]) {
                    Some(gt) => pos = lt + gt + 1,
                    None => return out,
                }
            }
            _ => {
                out.push_str(&input[pos..=lt]);
                pos = lt + 1;
            }
        }
    }
    out.push_str(&input[pos..]);
    out
}

fn looks_malicious(text: &str) -> bool {
    ac_for(DENY_LITERALS).is_match(text) || EVENT_HANDLER_RE.is_match(text)
}

/// Sanitize and bounds-check a user message.
///
/// Injection signatures are checked against both the raw input and the
/// cleaned text: tag stripping would otherwise erase the very evidence we
/// reject on.
pub fn validate(raw: &str, max_length: usize) -> Validation {
    let cleaned = sanitize(raw);
    if cleaned.is_empty() {
        return Validation::rejected("Message cannot be empty.".to_string());
    }
    if cleaned.chars().count() > max_length {
        return Validation::rejected(format!(
            "Message exceeds maximum length of {} characters.",
            max_length
        ));
    }
    if looks_malicious(&raw.replace('\0', "")) || looks_malicious(&cleaned) {
        return Validation::rejected("Message contains invalid content.".to_string());
    }
    Validation {
        valid: true,
        cleaned,
        error: None,
    }
}
