//! Define the reserved keyword vocabulary for the bundle-script language.
//!
//! This module is the single source of truth for reserved words: a stable identifier ([`KeywordId`]) plus a const
//! metadata table ([`KEYWORDS`]) that records canonical spellings, aliases and categories.
//!
//! ## Notes
//! - Lookup via [`from_str`] is **case-sensitive**.
//! - Chunk keywords (`define`, `register`, `entry`) are only legal at the top level of an emitted file; the parser
//!   enforces that, the registry only names them.
//!
//! ## Examples
//! ```rust
//! use bundletest_core::lang::keywords::{self, KeywordId};
//!
//! assert_eq!(keywords::from_str("import"), Some(KeywordId::Import));
//! assert_eq!(keywords::from_str("var"), Some(KeywordId::Let)); // alias
//! assert_eq!(keywords::as_str(KeywordId::Let), "let");
//! ```

/// Stable identifier for every reserved keyword.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum KeywordId {
    // Control flow / statements
    If,
    Else,
    Return,
    Throw,
    Try,
    Catch,
    Await,

    // Bindings / declarations
    Let,
    Const,
    Function,
    New,
    Typeof,

    // Modules
    Import,
    Export,
    From,
    As,
    Default,

    // Chunk items (emitted files only)
    Define,
    Register,
    Entry,

    // Literals
    True,
    False,
    Null,
    Undefined,
}

/// High-level grouping for documentation and diagnostics.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum KeywordCategory {
    ControlFlow,
    Binding,
    Module,
    Chunk,
    Literal,
}

/// Metadata for a keyword.
#[derive(Debug, Clone, Copy)]
pub struct KeywordInfo {
    pub id: KeywordId,
    pub canonical: &'static str,
    pub aliases: &'static [&'static str],
    pub category: KeywordCategory,
}

/// Registry of all keywords.
pub const KEYWORDS: &[KeywordInfo] = &[
    info(KeywordId::If, "if", &[], KeywordCategory::ControlFlow),
    info(KeywordId::Else, "else", &[], KeywordCategory::ControlFlow),
    info(KeywordId::Return, "return", &[], KeywordCategory::ControlFlow),
    info(KeywordId::Throw, "throw", &[], KeywordCategory::ControlFlow),
    info(KeywordId::Try, "try", &[], KeywordCategory::ControlFlow),
    info(KeywordId::Catch, "catch", &[], KeywordCategory::ControlFlow),
    info(KeywordId::Await, "await", &[], KeywordCategory::ControlFlow),
    // `var` is accepted for fixtures written against older output, with `let` semantics.
    info(KeywordId::Let, "let", &["var"], KeywordCategory::Binding),
    info(KeywordId::Const, "const", &[], KeywordCategory::Binding),
    info(KeywordId::Function, "function", &[], KeywordCategory::Binding),
    info(KeywordId::New, "new", &[], KeywordCategory::Binding),
    info(KeywordId::Typeof, "typeof", &[], KeywordCategory::Binding),
    info(KeywordId::Import, "import", &[], KeywordCategory::Module),
    info(KeywordId::Export, "export", &[], KeywordCategory::Module),
    info(KeywordId::From, "from", &[], KeywordCategory::Module),
    info(KeywordId::As, "as", &[], KeywordCategory::Module),
    info(KeywordId::Default, "default", &[], KeywordCategory::Module),
    info(KeywordId::Define, "define", &[], KeywordCategory::Chunk),
    info(KeywordId::Register, "register", &[], KeywordCategory::Chunk),
    info(KeywordId::Entry, "entry", &[], KeywordCategory::Chunk),
    info(KeywordId::True, "true", &[], KeywordCategory::Literal),
    info(KeywordId::False, "false", &[], KeywordCategory::Literal),
    info(KeywordId::Null, "null", &[], KeywordCategory::Literal),
    info(KeywordId::Undefined, "undefined", &[], KeywordCategory::Literal),
];

/// Canonical spelling.
pub fn as_str(id: KeywordId) -> &'static str {
    info_for(id).canonical
}

/// Category.
pub fn category(id: KeywordId) -> KeywordCategory {
    info_for(id).category
}

/// Full metadata.
///
/// ## Panics
/// - If the registry is missing an entry for `id` (this indicates a programming error).
pub fn info_for(id: KeywordId) -> &'static KeywordInfo {
    KEYWORDS.iter().find(|k| k.id == id).expect("keyword info missing")
}

/// Lookup by spelling (canonical or alias).
pub fn from_str(s: &str) -> Option<KeywordId> {
    KEYWORDS
        .iter()
        .find(|k| k.canonical == s || k.aliases.contains(&s))
        .map(|k| k.id)
}

// --- helpers -----------------------------------------------------------------

const fn info(
    id: KeywordId,
    canonical: &'static str,
    aliases: &'static [&'static str],
    category: KeywordCategory,
) -> KeywordInfo {
    KeywordInfo {
        id,
        canonical,
        aliases,
        category,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_every_keyword_resolves_to_itself() {
        for k in KEYWORDS {
            assert_eq!(from_str(k.canonical), Some(k.id), "canonical {:?}", k.canonical);
            for alias in k.aliases {
                assert_eq!(from_str(alias), Some(k.id), "alias {:?}", alias);
            }
        }
    }

    #[test]
    fn test_lookup_is_case_sensitive() {
        assert_eq!(from_str("Import"), None);
        assert_eq!(from_str("IMPORT"), None);
    }

    #[test]
    fn test_chunk_keywords_are_grouped() {
        let chunk: Vec<_> = KEYWORDS
            .iter()
            .filter(|k| k.category == KeywordCategory::Chunk)
            .map(|k| k.canonical)
            .collect();
        assert_eq!(chunk, vec!["define", "register", "entry"]);
    }
}
