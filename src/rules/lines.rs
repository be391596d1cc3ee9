//! Line-oriented splitting of a linearized bulletin into per-edict records.
//!
//! A bulletin PDF extracted to text is one long stream. [`LineRules`] holds an
//! ordered list of tagged [`LineRule`]s plus a marker pattern that opens a new
//! record. [`LineRules::process`] walks the text line by line:
//!
//! 1. a line matching any [`LineRule::Skip`] is dropped
//! 2. the first matching [`LineRule::Extract`] merges its captures into the
//!    running metadata, and drops the line unless `include_line` is set
//! 3. a marker line closes the open record (if it has text) and opens a new one
//! 4. inside a record, every matching [`LineRule::Cleanup`] rewrites the line
//!    in order before it is appended
//!
//! ```text
//!   SeekingContent ──marker──▶ InContent ──marker──▶ InContent (emit previous)
//! ```
//!
//! A record still open at end of text is dropped unless `flush_on_eof` is set.

use regex::Regex;
use std::collections::BTreeMap;

/// In-place rewrite applied by a [`LineRule::Cleanup`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Cleanup {
    /// Remove the last occurrence of the literal.
    RemoveLast(&'static str),
    /// Trim the line and end it with a single space.
    TrimToSpace,
}

impl Cleanup {
    fn apply(self, line: &str) -> String {
        match self {
            Cleanup::RemoveLast(needle) => match line.rfind(needle) {
                Some(idx) => format!("{}{}", &line[..idx], &line[idx + needle.len()..]),
                None => line.to_string(),
            },
            Cleanup::TrimToSpace => format!("{} ", line.trim()),
        }
    }
}

#[derive(Debug, Clone)]
pub enum LineRule {
    Skip(Regex),
    Extract {
        pattern: Regex,
        /// Metadata key for each capture group, in group order.
        fields: Vec<&'static str>,
        include_line: bool,
    },
    Cleanup { pattern: Regex, action: Cleanup },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LineState {
    SeekingContent,
    InContent,
}

/// One emitted record.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BulletinRecord {
    /// First capture of the marker that opened the record.
    pub marker: Option<String>,
    pub body: String,
    /// Metadata accumulated up to the moment the record was emitted.
    pub metadata: BTreeMap<String, String>,
}

#[derive(Debug, Clone, Default)]
pub struct ProcessedBulletin {
    pub records: Vec<BulletinRecord>,
    /// Text of the record left open at end of input and not emitted.
    pub dropped_tail: Option<String>,
    /// Metadata accumulated over the whole text.
    pub metadata: BTreeMap<String, String>,
}

#[derive(Debug, Clone)]
pub struct LineRules {
    rules: Vec<LineRule>,
    marker: Regex,
}

impl LineRules {
    pub fn new(marker: Regex, rules: Vec<LineRule>) -> Self {
        Self { rules, marker }
    }

    /// Split `text` into records. Lines keep their trailing `\n`.
    pub fn process(&self, text: &str, flush_on_eof: bool) -> ProcessedBulletin {
        let mut state = LineState::SeekingContent;
        let mut metadata = BTreeMap::new();
        let mut body = String::new();
        let mut marker: Option<String> = None;
        let mut records = Vec::new();

        for raw in text.split_inclusive('\n') {
            if self.is_skipped(raw) {
                continue;
            }
            if !self.extract(raw, &mut metadata) {
                continue;
            }

            if let Some(caps) = self.marker.captures(raw) {
                if state == LineState::InContent && !body.is_empty() {
                    records.push(BulletinRecord {
                        marker: marker.take(),
                        body: std::mem::take(&mut body),
                        metadata: metadata.clone(),
                    });
                }
                body.clear();
                marker = caps.get(1).map(|m| m.as_str().to_string());
                state = LineState::InContent;
            }

            if state == LineState::InContent {
                body.push_str(&self.clean(raw));
            }
        }

        let mut dropped_tail = None;
        if state == LineState::InContent && !body.is_empty() {
            if flush_on_eof {
                records.push(BulletinRecord {
                    marker,
                    body,
                    metadata: metadata.clone(),
                });
            } else {
                dropped_tail = Some(body);
            }
        }

        ProcessedBulletin {
            records,
            dropped_tail,
            metadata,
        }
    }

    fn is_skipped(&self, line: &str) -> bool {
        self.rules
            .iter()
            .any(|rule| matches!(rule, LineRule::Skip(p) if p.is_match(line)))
    }

    /// Apply the first matching extractor. Returns whether the line stays in the body.
    fn extract(&self, line: &str, metadata: &mut BTreeMap<String, String>) -> bool {
        for rule in &self.rules {
            if let LineRule::Extract {
                pattern,
                fields,
                include_line,
            } = rule
            {
                if let Some(caps) = pattern.captures(line) {
                    for (i, field) in fields.iter().enumerate() {
                        if let Some(m) = caps.get(i + 1) {
                            metadata.insert(field.to_string(), m.as_str().trim().to_string());
                        }
                    }
                    return *include_line;
                }
            }
        }
        true
    }

    fn clean(&self, line: &str) -> String {
        let mut line = line.to_string();
        for rule in &self.rules {
            if let LineRule::Cleanup { pattern, action } = rule {
                if pattern.is_match(&line) {
                    line = action.apply(&line);
                }
            }
        }
        line
    }
}
