//! Deterministic line-window text chunker.
//!
//! Splits document text into overlapping fragments bounded both by a line
//! count and a hard character cap. The window advances over the lines in
//! `step = max(1, max_lines − overlap)` increments; any window that exceeds
//! the character cap (or contains one pathologically long line) falls back
//! to a greedy character split that prefers cutting at whitespace or
//! punctuation near the cap.
//!
//! Two calls with the same input and configuration produce identical
//! sequences, and emitted indices are always dense `0..N-1`.

use serde::Deserialize;

use crate::error::{Error, Result};
use crate::models::Chunk;

/// Fraction of the character cap above which a single line forces the
/// character-split path.
const LONG_LINE_RATIO: f64 = 0.8;

/// Fraction of the cap scanned backwards for a natural cut point.
const CUT_SEARCH_RATIO: f64 = 0.2;

/// Chunker knobs. All defaults are overridable.
#[derive(Debug, Clone, Deserialize)]
pub struct ChunkerConfig {
    /// Maximum lines per window.
    #[serde(default = "default_max_lines")]
    pub max_lines: usize,
    /// Lines shared between consecutive windows. Must stay below `max_lines`.
    #[serde(default = "default_overlap")]
    pub overlap: usize,
    /// Hard cap on emitted chunk length, in characters.
    #[serde(default = "default_max_chunk_size")]
    pub max_chunk_size: usize,
}

fn default_max_lines() -> usize {
    150
}
fn default_overlap() -> usize {
    30
}
fn default_max_chunk_size() -> usize {
    10_000
}

impl Default for ChunkerConfig {
    fn default() -> Self {
        Self {
            max_lines: default_max_lines(),
            overlap: default_overlap(),
            max_chunk_size: default_max_chunk_size(),
        }
    }
}

/// Stateless line chunker. Construction validates the configuration; `split`
/// never fails.
#[derive(Debug, Clone)]
pub struct LineChunker {
    config: ChunkerConfig,
}

impl LineChunker {
    pub fn new(config: ChunkerConfig) -> Result<Self> {
        if config.max_lines == 0 {
            return Err(Error::config("chunker max_lines must be > 0"));
        }
        if config.overlap >= config.max_lines {
            return Err(Error::config(format!(
                "chunker overlap ({}) must be smaller than max_lines ({})",
                config.overlap, config.max_lines
            )));
        }
        if config.max_chunk_size == 0 {
            return Err(Error::config("chunker max_chunk_size must be > 0"));
        }
        Ok(Self { config })
    }

    pub fn config(&self) -> &ChunkerConfig {
        &self.config
    }

    /// Split `text` into ordered chunks with dense indices starting at 0.
    ///
    /// Empty or whitespace-only input yields no chunks.
    pub fn split(&self, text: &str) -> Vec<Chunk> {
        if text.is_empty() {
            return Vec::new();
        }

        let lines: Vec<&str> = text.split('\n').collect();
        let step = (self.config.max_lines - self.config.overlap).max(1);
        let long_line_cap =
            (self.config.max_chunk_size as f64 * LONG_LINE_RATIO).floor() as usize;

        let mut chunks = Vec::new();
        let mut pos = 0usize;
        while pos < lines.len() {
            let end = (pos + self.config.max_lines).min(lines.len());
            let window = lines[pos..end].join("\n");
            let trimmed = window.trim();
            if !trimmed.is_empty() {
                let window_chars = window.chars().count();
                let has_long_line = lines[pos..end]
                    .iter()
                    .any(|l| l.chars().count() > long_line_cap);
                if window_chars > self.config.max_chunk_size || has_long_line {
                    for piece in char_split(&window, self.config.max_chunk_size) {
                        push_chunk(&mut chunks, piece);
                    }
                } else {
                    push_chunk(&mut chunks, trimmed.to_string());
                }
            }
            pos += step;
        }
        chunks
    }
}

fn push_chunk(chunks: &mut Vec<Chunk>, content: String) {
    let index = chunks.len() as i32;
    chunks.push(Chunk { content, index });
}

/// Greedy character split: pieces of up to `max_size` characters, cutting at
/// the last whitespace or punctuation inside the final fifth of the window
/// when one exists, otherwise at the hard cap. Pieces are trimmed; empty
/// pieces are dropped.
fn char_split(text: &str, max_size: usize) -> Vec<String> {
    let chars: Vec<char> = text.chars().collect();
    let search_floor = max_size - (max_size as f64 * CUT_SEARCH_RATIO).floor() as usize;

    let mut pieces = Vec::new();
    let mut start = 0usize;
    while start < chars.len() {
        let remaining = chars.len() - start;
        let take = if remaining <= max_size {
            remaining
        } else {
            let window = &chars[start..start + max_size];
            match window
                .iter()
                .rposition(|&c| c.is_whitespace() || matches!(c, ',' | '.' | ';' | '!' | '?'))
                .filter(|&cut| cut + 1 >= search_floor)
            {
                Some(cut) => cut + 1,
                None => max_size,
            }
        };
        let piece: String = chars[start..start + take].iter().collect();
        let trimmed = piece.trim();
        if !trimmed.is_empty() {
            pieces.push(trimmed.to_string());
        }
        start += take;
    }
    pieces
}

#[cfg(test)]
mod tests {
    use super::*;

    fn chunker(max_lines: usize, overlap: usize, max_chunk_size: usize) -> LineChunker {
        LineChunker::new(ChunkerConfig {
            max_lines,
            overlap,
            max_chunk_size,
        })
        .unwrap()
    }

    #[test]
    fn test_overlapping_windows() {
        let chunks = chunker(3, 1, 100).split("a\nb\nc\nd\ne");
        let contents: Vec<&str> = chunks.iter().map(|c| c.content.as_str()).collect();
        assert_eq!(contents, vec!["a\nb\nc", "c\nd\ne", "e"]);
        let indices: Vec<i32> = chunks.iter().map(|c| c.index).collect();
        assert_eq!(indices, vec![0, 1, 2]);
    }

    #[test]
    fn test_char_cap_split() {
        let input = "a".repeat(250);
        let chunks = chunker(10, 0, 100).split(&input);
        assert!(chunks.len() >= 3);
        for c in &chunks {
            assert!(c.content.chars().count() <= 100);
        }
        let rejoined: String = chunks
            .iter()
            .flat_map(|c| c.content.chars())
            .filter(|c| !c.is_whitespace())
            .collect();
        assert_eq!(rejoined, input);
    }

    #[test]
    fn test_char_split_prefers_word_boundary() {
        // A space falls inside the last 20% of the 20-char window, so the
        // cut lands there instead of mid-word.
        let chunks = chunker(10, 0, 20).split("aaaaaaaaaaaaaaaaa bbbbbbbbbb");
        assert_eq!(chunks[0].content, "aaaaaaaaaaaaaaaaa");
        assert_eq!(chunks[1].content, "bbbbbbbbbb");
    }

    #[test]
    fn test_long_line_routed_through_char_split() {
        // Window total is under the cap, but one line exceeds 80% of it.
        let long = "x".repeat(85);
        let input = format!("{}\nshort", long);
        let chunks = chunker(10, 0, 100).split(&input);
        assert!(chunks.iter().all(|c| c.content.chars().count() <= 100));
        let rejoined: String = chunks
            .iter()
            .flat_map(|c| c.content.chars())
            .filter(|c| !c.is_whitespace())
            .collect();
        assert!(rejoined.contains(&long));
    }

    #[test]
    fn test_empty_input() {
        assert!(chunker(3, 0, 100).split("").is_empty());
    }

    #[test]
    fn test_whitespace_only_input() {
        assert!(chunker(3, 0, 100).split("\n\n\n").is_empty());
        assert!(chunker(2, 0, 100).split("   \n\t\n ").is_empty());
    }

    #[test]
    fn test_chunks_are_trimmed() {
        let chunks = chunker(5, 0, 100).split("  hello  \n  world  ");
        assert_eq!(chunks.len(), 1);
        assert_eq!(chunks[0].content, "hello  \n  world");
    }

    #[test]
    fn test_indices_contiguous() {
        let text = (0..40)
            .map(|i| format!("line number {}", i))
            .collect::<Vec<_>>()
            .join("\n");
        let chunks = chunker(7, 2, 80).split(&text);
        for (i, c) in chunks.iter().enumerate() {
            assert_eq!(c.index, i as i32, "index mismatch at position {}", i);
        }
    }

    #[test]
    fn test_deterministic() {
        let text = "alpha\nbeta\ngamma\ndelta\nepsilon";
        let c = chunker(2, 1, 50);
        assert_eq!(c.split(text), c.split(text));
    }

    #[test]
    fn test_totality_covers_every_character() {
        let text = "fn main() {\n    println!(\"hi\");\n}\n\nmod tests;";
        let chunks = chunker(2, 1, 30).split(text);
        let joined: String = chunks.iter().map(|c| c.content.as_str()).collect();
        for ch in text.chars().filter(|c| !c.is_whitespace()) {
            assert!(joined.contains(ch), "missing character {:?}", ch);
        }
    }

    #[test]
    fn test_invalid_config_rejected() {
        assert!(LineChunker::new(ChunkerConfig {
            max_lines: 0,
            overlap: 0,
            max_chunk_size: 100
        })
        .is_err());
        assert!(LineChunker::new(ChunkerConfig {
            max_lines: 10,
            overlap: 10,
            max_chunk_size: 100
        })
        .is_err());
        assert!(LineChunker::new(ChunkerConfig {
            max_lines: 10,
            overlap: 3,
            max_chunk_size: 0
        })
        .is_err());
    }

    #[test]
    fn test_default_config() {
        let config = ChunkerConfig::default();
        assert_eq!(config.max_lines, 150);
        assert_eq!(config.overlap, 30);
        assert_eq!(config.max_chunk_size, 10_000);
        LineChunker::new(config).unwrap();
    }
}
