//! Text normalization and classification rules used inside the scrapers.
//!
//! | Module | Contents |
//! |--------|----------|
//! | [`text`] | whitespace cleanup, HTML stripping, PDF text fixes, month names |
//! | [`sections`] | header-prefix section table and per-publisher section filters |
//! | [`lines`] | ordered line rules and the bulletin line state machine |

pub mod lines;
pub mod sections;
pub mod text;
