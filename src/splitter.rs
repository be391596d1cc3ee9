//! Character text splitter.
//!
//! The text is cut on a separator, then consecutive pieces are merged back
//! (re-joined with the separator) into chunks of at most `chunk_size`
//! characters. Each new chunk starts with up to `chunk_overlap` characters
//! worth of trailing pieces from the previous one. Pieces longer than
//! `chunk_size` are cut into overlapping character windows first, so no chunk
//! ever exceeds the limit. Sizes are counted in `char`s.

use crate::config::Config;
use std::collections::VecDeque;

#[derive(Debug, Clone)]
pub struct SplitterConfig {
    pub separator: String,
    pub chunk_size: usize,
    pub chunk_overlap: usize,
}

impl Default for SplitterConfig {
    fn default() -> Self {
        Self {
            separator: "\n".to_string(),
            chunk_size: 1200,
            chunk_overlap: 100,
        }
    }
}

impl From<&Config> for SplitterConfig {
    fn from(config: &Config) -> Self {
        Self {
            separator: config.separator.clone(),
            chunk_size: config.chunk_size,
            chunk_overlap: config.chunk_overlap,
        }
    }
}

#[derive(Debug, Clone)]
pub struct CharacterSplitter {
    config: SplitterConfig,
}

impl CharacterSplitter {
    #[must_use]
    pub fn new(mut config: SplitterConfig) -> Self {
        config.chunk_size = config.chunk_size.max(1);
        config.chunk_overlap = config.chunk_overlap.min(config.chunk_size - 1);
        Self { config }
    }

    #[must_use]
    pub fn split_text(&self, text: &str) -> Vec<String> {
        let pieces = self.pieces(text);
        self.merge(&pieces)
    }

    fn pieces<'a>(&self, text: &'a str) -> Vec<&'a str> {
        let raw: Vec<&str> = if self.config.separator.is_empty() {
            text.char_indices()
                .map(|(i, c)| &text[i..i + c.len_utf8()])
                .collect()
        } else {
            text.split(self.config.separator.as_str()).collect()
        };

        let mut pieces = Vec::with_capacity(raw.len());
        for piece in raw.into_iter().filter(|p| !p.is_empty()) {
            if piece.chars().count() > self.config.chunk_size {
                pieces.extend(char_windows(
                    piece,
                    self.config.chunk_size,
                    self.config.chunk_overlap,
                ));
            } else {
                pieces.push(piece);
            }
        }
        pieces
    }

    fn merge(&self, pieces: &[&str]) -> Vec<String> {
        let sep = self.config.separator.as_str();
        let sep_len = sep.chars().count();
        let size = self.config.chunk_size;
        let overlap = self.config.chunk_overlap;

        let mut chunks = Vec::new();
        let mut current: VecDeque<&str> = VecDeque::new();
        let mut total = 0usize;

        for piece in pieces {
            let len = piece.chars().count();
            let joiner = |current: &VecDeque<&str>| if current.is_empty() { 0 } else { sep_len };

            if total + len + joiner(&current) > size {
                if !current.is_empty() {
                    push_chunk(&mut chunks, &current, sep);
                    while total > overlap || (total > 0 && total + len + joiner(&current) > size) {
                        let Some(front) = current.pop_front() else {
                            break;
                        };
                        total -= front.chars().count();
                        if !current.is_empty() {
                            total -= sep_len;
                        }
                    }
                }
            }

            total += len + joiner(&current);
            current.push_back(piece);
        }

        if !current.is_empty() {
            push_chunk(&mut chunks, &current, sep);
        }
        chunks
    }
}

fn push_chunk(chunks: &mut Vec<String>, current: &VecDeque<&str>, sep: &str) {
    let joined = current.iter().copied().collect::<Vec<_>>().join(sep);
    let trimmed = joined.trim();
    if !trimmed.is_empty() {
        chunks.push(trimmed.to_string());
    }
}

/// Overlapping windows of `size` chars stepping by `size - overlap`.
fn char_windows(text: &str, size: usize, overlap: usize) -> Vec<&str> {
    let bounds: Vec<usize> = text
        .char_indices()
        .map(|(i, _)| i)
        .chain(std::iter::once(text.len()))
        .collect();
    let n_chars = bounds.len() - 1;
    let step = size.saturating_sub(overlap).max(1);

    let mut windows = Vec::new();
    let mut start = 0;
    loop {
        let end = (start + size).min(n_chars);
        windows.push(&text[bounds[start]..bounds[end]]);
        if end == n_chars {
            break;
        }
        start += step;
    }
    windows
}
