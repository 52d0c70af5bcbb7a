//! Operator vocabulary with precedence metadata.
//!
//! ## Notes
//! - `precedence` is relative: higher binds tighter. The parser's precedence climbing reads it from here, so the
//!   table is the only place precedence is decided.
//! - Assignment operators have precedence `0`; they are statement-level in bundle script and never climbed.
//!
//! ## Examples
//! ```rust
//! use bundletest_core::lang::operators::{self, OperatorId};
//!
//! assert_eq!(operators::from_str("==="), Some(OperatorId::StrictEq));
//! assert!(operators::info_for(OperatorId::Star).precedence > operators::info_for(OperatorId::Plus).precedence);
//! ```

/// Define whether an operator is infix (binary) or prefix (unary).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Fixity {
    Infix,
    Prefix,
    Assign,
}

/// Stable identifier for every operator.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum OperatorId {
    // Arithmetic
    Plus,
    Minus,
    Star,
    Slash,
    Percent,

    // Comparison
    EqEq,
    NotEq,
    StrictEq,
    StrictNotEq,
    Lt,
    LtEq,
    Gt,
    GtEq,

    // Logical
    AndAnd,
    OrOr,
    Bang,

    // Assignment
    Eq,
    PlusEq,
    MinusEq,
}

/// Metadata for an operator.
#[derive(Debug, Clone, Copy)]
pub struct OperatorInfo {
    pub id: OperatorId,
    pub spelling: &'static str,
    pub precedence: u8,
    pub fixity: Fixity,
}

/// Registry of all operators.
pub const OPERATORS: &[OperatorInfo] = &[
    op(OperatorId::OrOr, "||", 10, Fixity::Infix),
    op(OperatorId::AndAnd, "&&", 20, Fixity::Infix),
    op(OperatorId::EqEq, "==", 30, Fixity::Infix),
    op(OperatorId::NotEq, "!=", 30, Fixity::Infix),
    op(OperatorId::StrictEq, "===", 30, Fixity::Infix),
    op(OperatorId::StrictNotEq, "!==", 30, Fixity::Infix),
    op(OperatorId::Lt, "<", 40, Fixity::Infix),
    op(OperatorId::LtEq, "<=", 40, Fixity::Infix),
    op(OperatorId::Gt, ">", 40, Fixity::Infix),
    op(OperatorId::GtEq, ">=", 40, Fixity::Infix),
    op(OperatorId::Plus, "+", 50, Fixity::Infix),
    op(OperatorId::Minus, "-", 50, Fixity::Infix),
    op(OperatorId::Star, "*", 60, Fixity::Infix),
    op(OperatorId::Slash, "/", 60, Fixity::Infix),
    op(OperatorId::Percent, "%", 60, Fixity::Infix),
    op(OperatorId::Bang, "!", 70, Fixity::Prefix),
    op(OperatorId::Eq, "=", 0, Fixity::Assign),
    op(OperatorId::PlusEq, "+=", 0, Fixity::Assign),
    op(OperatorId::MinusEq, "-=", 0, Fixity::Assign),
];

/// Return the full metadata entry for an operator.
///
/// ## Panics
/// - If the registry is missing an entry for `id` (this indicates a programming error).
pub fn info_for(id: OperatorId) -> &'static OperatorInfo {
    OPERATORS.iter().find(|o| o.id == id).expect("operator info missing")
}

/// Canonical spelling.
pub fn as_str(id: OperatorId) -> &'static str {
    info_for(id).spelling
}

/// Resolve an operator spelling to its identifier.
pub fn from_str(spelling: &str) -> Option<OperatorId> {
    OPERATORS.iter().find(|o| o.spelling == spelling).map(|o| o.id)
}

/// Binary precedence of an operator, or `None` when it is not infix.
pub fn infix_precedence(id: OperatorId) -> Option<u8> {
    let info = info_for(id);
    (info.fixity == Fixity::Infix).then_some(info.precedence)
}

// --- helpers -----------------------------------------------------------------

const fn op(id: OperatorId, spelling: &'static str, precedence: u8, fixity: Fixity) -> OperatorInfo {
    OperatorInfo {
        id,
        spelling,
        precedence,
        fixity,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_spellings_are_unique() {
        for (i, a) in OPERATORS.iter().enumerate() {
            for b in &OPERATORS[i + 1..] {
                assert_ne!(a.spelling, b.spelling);
            }
        }
    }

    #[test]
    fn test_assignment_is_never_infix() {
        assert_eq!(infix_precedence(OperatorId::Eq), None);
        assert_eq!(infix_precedence(OperatorId::PlusEq), None);
        assert_eq!(infix_precedence(OperatorId::Bang), None);
        assert_eq!(infix_precedence(OperatorId::AndAnd), Some(20));
    }
}
