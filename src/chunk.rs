//! Sliding-window text chunker.
//!
//! Splits extracted document text into overlapping chunks with character
//! offsets. The window operates on `char`s rather than bytes so multi-byte
//! UTF-8 sequences are never split. `chunk_code` prefers cutting at
//! declaration boundaries before falling back to the plain algorithm.
//!
//! Both functions are pure: no I/O, no state, identical input gives
//! identical output.

use crate::error::{Error, Result};

/// Chunking parameters. `chunk_overlap` must be in `[0, chunk_size)`.
#[derive(Debug, Clone, Copy)]
pub struct ChunkOptions {
    pub chunk_size: usize,
    pub chunk_overlap: usize,
    pub preserve_words: bool,
}

/// One window of text with character offsets into the source.
#[derive(Debug, Clone, PartialEq)]
pub struct TextChunk {
    pub content: String,
    pub start_char: usize,
    pub end_char: usize,
}

/// How far back from the naive cut point to search for a word boundary.
const BOUNDARY_LOOKBACK: usize = 100;

fn is_boundary_char(c: char) -> bool {
    matches!(c, ' ' | '\n' | '.' | ',' | ';' | ')')
}

fn validate(opts: &ChunkOptions) -> Result<()> {
    if opts.chunk_size == 0 {
        return Err(Error::Configuration(
            "chunk_size must be greater than 0".to_string(),
        ));
    }
    if opts.chunk_overlap >= opts.chunk_size {
        return Err(Error::Configuration(
            "chunk_overlap must be between 0 and chunk_size".to_string(),
        ));
    }
    Ok(())
}

/// Split text into overlapping chunks using a sliding window.
///
/// The window advances by `chunk_size - chunk_overlap` characters per step.
/// With `preserve_words`, a cut that falls inside a word is moved back to the
/// nearest boundary character within [`BOUNDARY_LOOKBACK`] characters; if
/// none is found the naive cut stands.
pub fn chunk_text(text: &str, opts: &ChunkOptions) -> Result<Vec<TextChunk>> {
    validate(opts)?;

    let chars: Vec<char> = text.chars().collect();
    let len = chars.len();
    if len == 0 {
        return Ok(Vec::new());
    }

    let step = opts.chunk_size - opts.chunk_overlap;
    let mut chunks = Vec::new();
    let mut start = 0usize;

    while start < len {
        let mut end = (start + opts.chunk_size).min(len);

        if opts.preserve_words && end < len {
            let search_start = start.max(end.saturating_sub(BOUNDARY_LOOKBACK));
            if let Some(rel) = chars[search_start..end].iter().rposition(|c| is_boundary_char(*c)) {
                // rel == 0 would produce an empty or no-progress cut; keep
                // the naive point in that case.
                if rel > 0 {
                    end = search_start + rel + 1;
                }
            }
        }

        chunks.push(TextChunk {
            content: chars[start..end].iter().collect(),
            start_char: start,
            end_char: end,
        });

        // Force progress to the chunk's end if the step cannot advance.
        let next = start + step;
        start = if next > start { next } else { end };
    }

    Ok(chunks)
}

/// Chunk source code, preferring cuts at declaration boundaries.
///
/// Scans for line starts that look like function/class/method declarations
/// across common languages and cuts at the boundary nearest to, but not
/// after, the naive cut point, recomputing the overlap backward from the
/// boundary. Falls back to [`chunk_text`] when the text fits in one chunk or
/// no boundaries are found.
pub fn chunk_code(code: &str, opts: &ChunkOptions) -> Result<Vec<TextChunk>> {
    validate(opts)?;

    let chars: Vec<char> = code.chars().collect();
    let len = chars.len();
    if len == 0 {
        return Ok(Vec::new());
    }

    let boundaries = declaration_boundaries(&chars);
    if boundaries.len() <= 1 || len <= opts.chunk_size {
        return chunk_text(
            code,
            &ChunkOptions {
                preserve_words: true,
                ..*opts
            },
        );
    }

    let mut chunks = Vec::new();
    let mut start = 0usize;

    while start < len {
        let naive = start + opts.chunk_size;
        let end = if naive < len {
            boundaries
                .iter()
                .copied()
                .filter(|&b| b > start && b <= naive)
                .next_back()
                .unwrap_or(naive)
        } else {
            len
        };

        chunks.push(TextChunk {
            content: chars[start..end].iter().collect(),
            start_char: start,
            end_char: end,
        });

        if end >= len {
            break;
        }

        // Overlap is recomputed backward from the boundary; force progress
        // to the chunk's end when the boundary sits inside the overlap.
        let next = end.saturating_sub(opts.chunk_overlap);
        start = if next > start { next } else { end };
    }

    Ok(chunks)
}

/// Line-start prefixes that mark a structural boundary in common languages.
const DECLARATION_PREFIXES: &[&str] = &[
    "function ",
    "class ",
    "def ",
    "fn ",
    "pub fn ",
    "async fn ",
    "impl ",
    "export function",
    "export class",
    "export const",
    "public class",
    "public interface",
    "public static",
    "public void",
];

/// Character positions of line starts that begin a declaration, always
/// including position 0. Sorted and deduplicated by construction.
fn declaration_boundaries(chars: &[char]) -> Vec<usize> {
    let mut boundaries = vec![0];
    let mut line_start = 0usize;

    for i in 0..=chars.len() {
        let at_line_end = i == chars.len() || chars[i] == '\n';
        if !at_line_end {
            continue;
        }
        if line_start > 0 && line_start < chars.len() {
            let line: String = chars[line_start..i].iter().collect();
            let trimmed = line.trim_start();
            if DECLARATION_PREFIXES.iter().any(|p| trimmed.starts_with(p)) {
                boundaries.push(line_start);
            }
        }
        line_start = i + 1;
    }

    boundaries
}
