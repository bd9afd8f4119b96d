//! Paragraph-boundary chat chunker.
//!
//! Splits every message of a [`Chat`] into [`ChunkRecord`]s that respect a
//! configurable `max_tokens` limit. Splitting occurs on paragraph boundaries
//! (`\n\n`) to preserve semantic coherence within each chunk; paragraphs that
//! are too long on their own are hard-split at a newline or space.
//!
//! Each chunk's hash covers its chat, position and text, so the same chat
//! always yields the same chunk hashes.

use serde::Serialize;

use crate::error::HashingError;
use crate::hashing::identity_hash;
use crate::models::{Chat, ChunkRecord};

/// Approximate chars-per-token ratio.
const CHARS_PER_TOKEN: usize = 4;

/// Split every message of `chat` into chunks. Chunks shorter than
/// `min_chars` are dropped.
pub fn chunk_chat(
    chat: &Chat,
    max_tokens: usize,
    min_chars: usize,
) -> Result<Vec<ChunkRecord>, HashingError> {
    let mut records = Vec::new();
    for (message_index, message) in chat.messages.iter().enumerate() {
        let pieces = split_text(&message.text, max_tokens);
        let mut chunk_index = 0;
        for text in pieces {
            if text.chars().count() < min_chars.max(1) {
                continue;
            }
            records.push(make_chunk(
                chat,
                message_index,
                chunk_index,
                &message.role,
                text,
            )?);
            chunk_index += 1;
        }
    }
    Ok(records)
}

/// Split text into pieces on paragraph boundaries, respecting max_tokens.
pub fn split_text(text: &str, max_tokens: usize) -> Vec<String> {
    let max_chars = max_tokens.max(1) * CHARS_PER_TOKEN;
    let mut pieces = Vec::new();
    let mut current_buf = String::new();

    for para in text.split("\n\n") {
        let trimmed = para.trim();
        if trimmed.is_empty() {
            continue;
        }

        // If adding this paragraph would exceed max, flush current buffer
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
                let split_at = floor_char_boundary(remaining, max_chars);
                // Try to split at a newline or space boundary
                let actual_split = if split_at < remaining.len() {
                    remaining[..split_at]
                        .rfind('\n')
                        .or_else(|| remaining[..split_at].rfind(' '))
                        .map(|pos| pos + 1)
                        .unwrap_or(split_at)
                } else {
                    split_at
                };
                let piece = remaining[..actual_split].trim();
                if !piece.is_empty() {
                    pieces.push(piece.to_string());
                }
                remaining = &remaining[actual_split..];
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
    pieces
}

/// Largest index `<= max` that falls on a char boundary (at least one char).
fn floor_char_boundary(s: &str, max: usize) -> usize {
    if max >= s.len() {
        return s.len();
    }
    let mut idx = max;
    while idx > 0 && !s.is_char_boundary(idx) {
        idx -= 1;
    }
    if idx == 0 {
        s.char_indices().nth(1).map(|(i, _)| i).unwrap_or(s.len())
    } else {
        idx
    }
}

#[derive(Serialize)]
struct ChunkIdentity<'a> {
    chat_hash: &'a str,
    message_index: usize,
    chunk_index: usize,
    text: &'a str,
}

fn make_chunk(
    chat: &Chat,
    message_index: usize,
    chunk_index: usize,
    role: &str,
    text: String,
) -> Result<ChunkRecord, HashingError> {
    let chunk_hash = identity_hash(&ChunkIdentity {
        chat_hash: &chat.chat_hash,
        message_index,
        chunk_index,
        text: &text,
    })?;
    Ok(ChunkRecord {
        chunk_hash,
        chat_hash: chat.chat_hash.clone(),
        chat_title: chat.title.clone(),
        message_index,
        chunk_index,
        role: role.to_string(),
        text,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::Message;

    fn chat(texts: &[&str]) -> Chat {
        Chat {
            chat_hash: "c1".to_string(),
            title: "Test".to_string(),
            source_file: "f.json".to_string(),
            created_at: None,
            messages: texts
                .iter()
                .map(|t| Message {
                    role: "user".to_string(),
                    text: t.to_string(),
                    timestamp: None,
                })
                .collect(),
        }
    }

    #[test]
    fn test_small_text_single_chunk() {
        let pieces = split_text("Hello, world!", 700);
        assert_eq!(pieces, vec!["Hello, world!"]);
    }

    #[test]
    fn test_empty_text() {
        assert!(split_text("", 700).is_empty());
    }

    #[test]
    fn test_multiple_paragraphs_under_limit() {
        let text = "First paragraph.\n\nSecond paragraph.\n\nThird paragraph.";
        let pieces = split_text(text, 700);
        assert_eq!(pieces.len(), 1);
        assert!(pieces[0].contains("Third paragraph."));
    }

    #[test]
    fn test_multiple_paragraphs_exceed_limit() {
        // max_tokens=5 => max_chars=20
        let text = "This is paragraph one.\n\nThis is paragraph two.\n\nThis is paragraph three.";
        let pieces = split_text(text, 5);
        assert!(pieces.len() > 1);
        assert!(pieces.iter().all(|p| p.len() <= 20));
    }

    #[test]
    fn test_multibyte_hard_split() {
        let text = "é".repeat(30);
        let pieces = split_text(&text, 2);
        assert_eq!(pieces.concat(), text);
    }

    #[test]
    fn test_chunk_indices_per_message() {
        let text = (0..20)
            .map(|i| format!("Paragraph number {}.", i))
            .collect::<Vec<_>>()
            .join("\n\n");
        let c = chat(&[&text, "short"]);
        let chunks = chunk_chat(&c, 10, 1).unwrap();
        let first: Vec<usize> = chunks
            .iter()
            .filter(|r| r.message_index == 0)
            .map(|r| r.chunk_index)
            .collect();
        assert_eq!(first, (0..first.len()).collect::<Vec<_>>());
        let last = chunks.last().unwrap();
        assert_eq!((last.message_index, last.chunk_index), (1, 0));
    }

    #[test]
    fn test_min_chars_drops_fragments() {
        let chunks = chunk_chat(&chat(&["ok", "long enough"]), 100, 5).unwrap();
        assert_eq!(chunks.len(), 1);
        assert_eq!(chunks[0].text, "long enough");
    }

    #[test]
    fn test_deterministic() {
        let c = chat(&["Alpha\n\nBeta\n\nGamma\n\nDelta"]);
        let a = chunk_chat(&c, 2, 1).unwrap();
        let b = chunk_chat(&c, 2, 1).unwrap();
        assert_eq!(a, b);
    }
}
