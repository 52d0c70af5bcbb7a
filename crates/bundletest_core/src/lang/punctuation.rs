//! Punctuation vocabulary.
//!
//! ## Examples
//! ```rust
//! use bundletest_core::lang::punctuation::{self, PunctuationId};
//!
//! assert_eq!(punctuation::from_str(";"), Some(PunctuationId::Semicolon));
//! assert_eq!(punctuation::as_str(PunctuationId::LBrace), "{");
//! ```

/// Stable identifier for punctuation tokens.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum PunctuationId {
    Comma,
    Colon,
    Semicolon,
    Dot,
    FatArrow,
    LParen,
    RParen,
    LBracket,
    RBracket,
    LBrace,
    RBrace,
}

/// Metadata for a punctuation token.
#[derive(Debug, Clone, Copy)]
pub struct PunctuationInfo {
    pub id: PunctuationId,
    pub canonical: &'static str,
    /// Whether this token opens a bracketed region (used for unmatched-bracket diagnostics).
    pub opens: bool,
}

/// Registry of all punctuation.
pub const PUNCTUATION: &[PunctuationInfo] = &[
    p(PunctuationId::Comma, ",", false),
    p(PunctuationId::Colon, ":", false),
    p(PunctuationId::Semicolon, ";", false),
    p(PunctuationId::Dot, ".", false),
    p(PunctuationId::FatArrow, "=>", false),
    p(PunctuationId::LParen, "(", true),
    p(PunctuationId::RParen, ")", false),
    p(PunctuationId::LBracket, "[", true),
    p(PunctuationId::RBracket, "]", false),
    p(PunctuationId::LBrace, "{", true),
    p(PunctuationId::RBrace, "}", false),
];

/// Canonical spelling.
pub fn as_str(id: PunctuationId) -> &'static str {
    info_for(id).canonical
}

/// Full metadata.
///
/// ## Panics
/// - If the registry is missing an entry for `id` (this indicates a programming error).
pub fn info_for(id: PunctuationId) -> &'static PunctuationInfo {
    PUNCTUATION
        .iter()
        .find(|p| p.id == id)
        .expect("punctuation info missing")
}

/// Lookup by spelling.
pub fn from_str(s: &str) -> Option<PunctuationId> {
    PUNCTUATION.iter().find(|p| p.canonical == s).map(|p| p.id)
}

/// The closing delimiter matching an opening one.
pub fn closing(id: PunctuationId) -> Option<PunctuationId> {
    match id {
        PunctuationId::LParen => Some(PunctuationId::RParen),
        PunctuationId::LBracket => Some(PunctuationId::RBracket),
        PunctuationId::LBrace => Some(PunctuationId::RBrace),
        _ => None,
    }
}

const fn p(id: PunctuationId, canonical: &'static str, opens: bool) -> PunctuationInfo {
    PunctuationInfo { id, canonical, opens }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_every_opener_has_a_closer() {
        for info in PUNCTUATION.iter().filter(|p| p.opens) {
            assert!(closing(info.id).is_some(), "{:?}", info.id);
        }
    }
}
