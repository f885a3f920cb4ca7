//! Bounds and cleans every externally supplied field before it reaches the
//! presence tracker or the document state.
//!
//! Every function here is total: malformed input maps to a safe default, never a panic.

use regex::Regex;
use std::sync::OnceLock;

/// Largest inbound frame accepted, in bytes
pub const MAX_MESSAGE_BYTES: usize = 1024 * 1024;

/// Display names are cut to this many characters
pub const MAX_NAME_CHARS: usize = 50;

pub const DEFAULT_NAME: &str = "Anonymous";
pub const DEFAULT_COLOR: &str = "#000000";

/// Accepted client clock skew, in milliseconds
pub const MAX_TIMESTAMP_SKEW_MS: i64 = 60 * 60 * 1000;

const MAX_SESSION_ID_LEN: usize = 128;
const MAX_ENTITY_ID_LEN: usize = 512;
const MAX_COORDINATE: f64 = 1.0e7;

static UUID_RE: OnceLock<Regex> = OnceLock::new();
static SESSION_ID_RE: OnceLock<Regex> = OnceLock::new();
static ENTITY_ID_RE: OnceLock<Regex> = OnceLock::new();
static HEX_COLOR_RE: OnceLock<Regex> = OnceLock::new();
static HTML_TAG_RE: OnceLock<Regex> = OnceLock::new();

fn uuid_re() -> &'static Regex {
    UUID_RE.get_or_init(|| {
        Regex::new(r"^[0-9a-fA-F]{8}-[0-9a-fA-F]{4}-[0-9a-fA-F]{4}-[0-9a-fA-F]{4}-[0-9a-fA-F]{12}$")
            .expect("static uuid pattern")
    })
}

fn session_id_re() -> &'static Regex {
    SESSION_ID_RE.get_or_init(|| Regex::new(r"^[A-Za-z0-9_-]+$").expect("static session id pattern"))
}

fn entity_id_re() -> &'static Regex {
    ENTITY_ID_RE.get_or_init(|| Regex::new(r"^[A-Za-z0-9_.:-]+$").expect("static entity id pattern"))
}

fn hex_color_re() -> &'static Regex {
    HEX_COLOR_RE.get_or_init(|| {
        Regex::new(r"^#(?:[0-9a-fA-F]{3}|[0-9a-fA-F]{6})$").expect("static color pattern")
    })
}

fn html_tag_re() -> &'static Regex {
    HTML_TAG_RE.get_or_init(|| Regex::new(r"<[^>]*>").expect("static html tag pattern"))
}

/// Document ids are UUIDs
pub fn is_valid_document_id(id: &str) -> bool {
    uuid_re().is_match(id)
}

pub fn is_valid_session_id(id: &str) -> bool {
    !id.is_empty() && id.len() <= MAX_SESSION_ID_LEN && session_id_re().is_match(id)
}

/// Node and edge ids, e.g. `llmChain_0` or `reactflow__edge-a-b`
pub fn is_valid_entity_id(id: &str) -> bool {
    !id.is_empty() && id.len() <= MAX_ENTITY_ID_LEN && entity_id_re().is_match(id)
}

/// Keep `input` when it is a `#rgb`/`#rrggbb` color, otherwise return `fallback`.
pub fn sanitize_color(input: Option<&str>, fallback: &str) -> String {
    match input.map(str::trim) {
        Some(color) if hex_color_re().is_match(color) => color.to_string(),
        _ => fallback.to_string(),
    }
}

/// Strip markup, trim and truncate a display name. Empty results become `Anonymous`.
pub fn sanitize_user_name(input: Option<&str>) -> String {
    let Some(raw) = input else {
        return DEFAULT_NAME.to_string();
    };

    let stripped = html_tag_re().replace_all(raw, "");
    let cleaned: String = stripped
        .chars()
        .filter(|c| !matches!(c, '<' | '>' | '"' | '\'' | '`') && !c.is_control())
        .collect();
    let trimmed = cleaned.trim();

    if trimmed.is_empty() {
        return DEFAULT_NAME.to_string();
    }
    trimmed.chars().take(MAX_NAME_CHARS).collect::<String>().trim_end().to_string()
}

/// Client timestamps outside `now ± 1h` are replaced with `now`.
pub fn sanitize_timestamp(input: Option<i64>, now_ms: i64) -> i64 {
    match input {
        Some(ts) if (now_ms - MAX_TIMESTAMP_SKEW_MS..=now_ms + MAX_TIMESTAMP_SKEW_MS).contains(&ts) => ts,
        _ => now_ms,
    }
}

/// Non-finite coordinates become 0, the rest are clamped to the canvas bounds.
pub fn sanitize_coordinate(value: f64) -> f64 {
    if value.is_finite() {
        value.clamp(-MAX_COORDINATE, MAX_COORDINATE)
    } else {
        0.0
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SizeCheck {
    pub is_valid: bool,
    pub size: usize,
    pub max_size: usize,
}

pub fn check_message_size(size: usize, max_size: usize) -> SizeCheck {
    SizeCheck {
        is_valid: size <= max_size,
        size,
        max_size,
    }
}
