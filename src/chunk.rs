//! Web-page cleaning and paragraph-boundary chunking.
//!
//! [`clean_web_content`] strips boilerplate left over from HTML-to-markdown
//! extraction. [`chunk_text`] then splits the cleaned text into [`Chunk`]s
//! that respect `max_tokens`, carrying roughly `overlap_tokens` of trailing
//! context from one chunk into the next.
//!
//! Each chunk gets a fresh UUID (also used as its vector key) and a SHA-256
//! hash of its text.

use regex::Regex;
use sha2::{Digest, Sha256};
use std::sync::OnceLock;
use uuid::Uuid;

use crate::models::Chunk;

/// Approximate chars-per-token ratio.
const CHARS_PER_TOKEN: usize = 4;

struct Cleaners {
    blank_lines: Regex,
    inline_space: Regex,
    boilerplate: Regex,
    bare_url: Regex,
}

fn cleaners() -> &'static Cleaners {
    static CLEANERS: OnceLock<Cleaners> = OnceLock::new();
    CLEANERS.get_or_init(|| Cleaners {
        blank_lines: Regex::new(r"\n\s*\n").expect("valid regex"),
        inline_space: Regex::new(r"[ \t]+").expect("valid regex"),
        boilerplate: Regex::new(r"(?i)^(menu|navigation|footer|header|sidebar|breadcrumb)\b")
            .expect("valid regex"),
        bare_url: Regex::new(r"^https?://\S+$").expect("valid regex"),
    })
}

/// Normalizes whitespace and drops navigation boilerplate and bare-URL lines.
pub fn clean_web_content(content: &str) -> String {
    let c = cleaners();
    let normalized = content.replace("\r\n", "\n");
    let collapsed = c.blank_lines.replace_all(&normalized, "\n\n");

    let paragraphs: Vec<String> = collapsed
        .split("\n\n")
        .filter_map(|para| {
            let lines: Vec<String> = para
                .lines()
                .map(|line| c.inline_space.replace_all(line.trim(), " ").into_owned())
                .filter(|line| !line.is_empty() && !c.bare_url.is_match(line))
                .collect();
            let joined = lines.join("\n");
            if joined.is_empty() || c.boilerplate.is_match(&joined) {
                None
            } else {
                Some(joined)
            }
        })
        .collect();

    paragraphs.join("\n\n")
}

/// Split text into chunks on paragraph boundaries, respecting `max_tokens`.
/// Returns chunks with contiguous indices starting at 0.
pub fn chunk_text(
    document_id: &str,
    text: &str,
    max_tokens: usize,
    overlap_tokens: usize,
) -> Vec<Chunk> {
    let max_chars = max_tokens.max(1) * CHARS_PER_TOKEN;
    // Overlap never takes more than half a chunk.
    let overlap_chars = (overlap_tokens * CHARS_PER_TOKEN).min(max_chars / 2);

    let mut pieces: Vec<String> = Vec::new();
    let mut current_buf = String::new();

    for para in text.split("\n\n") {
        let trimmed = para.trim();
        if trimmed.is_empty() {
            continue;
        }

        let would_be = if current_buf.is_empty() {
            trimmed.len()
        } else {
            current_buf.len() + 2 + trimmed.len()
        };

        if would_be > max_chars && !current_buf.is_empty() {
            pieces.push(std::mem::take(&mut current_buf));
        }

        if trimmed.len() > max_chars {
            if !current_buf.is_empty() {
                pieces.push(std::mem::take(&mut current_buf));
            }
            let mut remaining = trimmed;
            while !remaining.is_empty() {
                let split_at = split_point(remaining, max_chars);
                let piece = remaining[..split_at].trim();
                if !piece.is_empty() {
                    pieces.push(piece.to_string());
                }
                remaining = &remaining[split_at..];
            }
        } else {
            if !current_buf.is_empty() {
                current_buf.push_str("\n\n");
            }
            current_buf.push_str(trimmed);
        }
    }

    if !current_buf.is_empty() {
        pieces.push(current_buf);
    }

    if pieces.is_empty() {
        return vec![make_chunk(document_id, 0, text.trim())];
    }

    let mut chunks = Vec::with_capacity(pieces.len());
    for (i, piece) in pieces.iter().enumerate() {
        let body = if i > 0 && overlap_chars > 0 {
            let tail = overlap_tail(&pieces[i - 1], overlap_chars);
            if tail.is_empty() {
                piece.clone()
            } else {
                format!("{}\n\n{}", tail, piece)
            }
        } else {
            piece.clone()
        };
        chunks.push(make_chunk(document_id, i as i64, &body));
    }
    chunks
}

/// Byte offset at most `max_chars` in, preferring a newline or space and
/// always landing on a char boundary.
fn split_point(text: &str, max_chars: usize) -> usize {
    if text.len() <= max_chars {
        return text.len();
    }
    let mut limit = max_chars;
    while !text.is_char_boundary(limit) {
        limit -= 1;
    }
    if limit == 0 {
        // A single char wider than max_chars.
        return text
            .char_indices()
            .nth(1)
            .map(|(i, _)| i)
            .unwrap_or(text.len());
    }
    text[..limit]
        .rfind('\n')
        .or_else(|| text[..limit].rfind(' '))
        .map(|pos| pos + 1)
        .unwrap_or(limit)
}

/// Trailing words of `text` fitting in `max_chars`.
fn overlap_tail(text: &str, max_chars: usize) -> &str {
    if text.len() <= max_chars {
        return text.trim();
    }
    let mut start = text.len() - max_chars;
    while !text.is_char_boundary(start) {
        start += 1;
    }
    let tail = &text[start..];
    if text[..start].ends_with(char::is_whitespace) {
        return tail.trim();
    }
    // Drop the partial leading word.
    match tail.find(char::is_whitespace) {
        Some(pos) => tail[pos..].trim(),
        None => tail.trim(),
    }
}

fn make_chunk(document_id: &str, index: i64, text: &str) -> Chunk {
    let mut hasher = Sha256::new();
    hasher.update(text.as_bytes());
    let hash = format!("{:x}", hasher.finalize());

    Chunk {
        id: Uuid::new_v4().to_string(),
        document_id: document_id.to_string(),
        chunk_index: index,
        text: text.to_string(),
        hash,
    }
}
