//! Text shaping for the Telegram adapter.
//!
//! Telegram caps messages at 4096 characters; a busy day's digest can run
//! past that. Long messages are split at line boundaries so no event row is
//! ever torn across two messages.

/// Per-message ceiling. Telegram's hard limit is 4096 characters; 4090
/// leaves headroom for escaping artifacts.
pub const CHUNK_MAX: usize = 4090;

/// Characters MarkdownV2 treats as markup and requires a backslash before.
const V2_SPECIALS: &[char] = &[
    '_', '*', '[', ']', '(', ')', '~', '`', '>', '#', '+', '-', '=', '|', '{', '}', '.', '!',
];

/// Split `text` into messages of at most [`CHUNK_MAX`] characters, breaking
/// between lines. A single line longer than the ceiling is hard-split on the
/// nearest space.
pub fn split_message(text: &str) -> Vec<String> {
    if text.len() <= CHUNK_MAX {
        return vec![text.to_string()];
    }

    let mut out: Vec<String> = Vec::new();
    let mut current = String::new();

    for line in text.split('\n') {
        let joined_len = current.len() + 1 + line.len();
        if !current.is_empty() && joined_len > CHUNK_MAX {
            out.push(std::mem::take(&mut current));
        }
        if !current.is_empty() {
            current.push('\n');
        }
        current.push_str(line);
    }
    if !current.is_empty() {
        out.push(current);
    }

    out.into_iter().flat_map(hard_split).collect()
}

// An accumulated piece still overflows only when one line alone exceeds the
// ceiling. Break it on spaces, or mid-word when there are none.
fn hard_split(piece: String) -> Vec<String> {
    if piece.len() <= CHUNK_MAX {
        return vec![piece];
    }
    let mut parts = Vec::new();
    let mut rest = piece.as_str();
    while rest.len() > CHUNK_MAX {
        let window = &rest[..CHUNK_MAX];
        let cut = window.rfind(' ').unwrap_or(CHUNK_MAX);
        parts.push(rest[..cut].to_string());
        rest = rest[cut..].trim_start();
    }
    if !rest.is_empty() {
        parts.push(rest.to_string());
    }
    parts
}

/// Backslash-escape everything Telegram MarkdownV2 reserves, leaving the
/// visible text unchanged.
pub fn escape_markdown_v2(text: &str) -> String {
    let mut out = String::with_capacity(text.len() + 16);
    for ch in text.chars() {
        if V2_SPECIALS.contains(&ch) {
            out.push('\\');
        }
        out.push(ch);
    }
    out
}
