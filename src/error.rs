//! Error taxonomy.
//!
//! Everything here fails fast at construction time. Runtime hiccups during
//! the search (an unsatisfiable query, a solver timeout, queue exhaustion)
//! are *data*, not errors: see [`SmtResponse`][crate::smt::SmtResponse] and
//! [`Progress`][crate::solver::Progress].

use thiserror::Error;

/// Errors detected while constructing a [`Grammar`][crate::grammar::Grammar].
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum GrammarError {
    /// A rule references a nonterminal that is never defined.
    #[error("undefined nonterminal <{referenced}> in a rule of <{referencing}>")]
    Undefined {
        referenced: String,
        referencing: String,
    },

    /// A defined nonterminal cannot be reached from the start symbol.
    #[error("nonterminal <{0}> is not reachable from the start symbol")]
    Unreachable(String),

    /// The designated start symbol has no rule.
    #[error("start symbol <{0}> is not defined")]
    UndefinedStart(String),

    /// The same nonterminal is defined twice.
    #[error("duplicate definition of <{0}>")]
    Duplicate(String),

    /// An alternative contains an unterminated or empty `<...>` reference.
    #[error("malformed nonterminal reference in {0:?}")]
    MalformedReference(String),
}

/// Errors detected while constructing or validating a
/// [`Formula`][crate::formula::Formula] or a
/// [`MatchPattern`][crate::pattern::MatchPattern].
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum FormulaError {
    /// A variable occurs free without being bound by an enclosing
    /// quantifier or being the top-level constant.
    #[error("variable '{0}' is not bound by any enclosing quantifier")]
    UnboundVariable(String),

    /// A bound variable reuses a name that is already in scope.
    #[error("bound variable '{0}' shadows an outer binding")]
    ShadowedVariable(String),

    /// The same name is used with two different sorts.
    #[error("variable '{0}' is used with conflicting sorts")]
    ConflictingSorts(String),

    /// A variable is typed by a nonterminal the grammar does not define.
    #[error("variable '{name}' has sort <{sort}>, which the grammar does not define")]
    UnknownSort { name: String, sort: String },

    /// A predicate atom names a predicate missing from the signature.
    #[error("unknown predicate '{0}'")]
    UnknownPredicate(String),

    /// A predicate atom has the wrong number of arguments.
    #[error("predicate '{name}' expects {expected} arguments, got {actual}")]
    ArityMismatch {
        name: String,
        expected: usize,
        actual: usize,
    },

    /// A match expression does not parse.
    #[error("malformed match expression {source_text:?}: {reason}")]
    MalformedPattern { source_text: String, reason: String },
}

/// Errors detected while constructing a [`Solver`][crate::solver::Solver].
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum ConfigError {
    /// A numeric option that must be positive is zero.
    #[error("configuration option '{0}' must be positive")]
    ZeroOption(&'static str),

    /// All cost weights are zero, which would make the queue order
    /// degenerate to insertion order.
    #[error("cost weights must not all be zero")]
    DegenerateWeights,

    /// The configured rule order does not mention every transition rule
    /// exactly once.
    #[error("rule order must mention every transition rule exactly once")]
    IncompleteRuleOrder,

    /// The formula does not validate against the grammar and the supplied
    /// predicate signature.
    #[error(transparent)]
    Formula(#[from] FormulaError),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_display() {
        let e = GrammarError::Undefined {
            referenced: "var".to_string(),
            referencing: "assgn".to_string(),
        };
        assert_eq!(
            e.to_string(),
            "undefined nonterminal <var> in a rule of <assgn>"
        );

        let e = FormulaError::ArityMismatch {
            name: "before".to_string(),
            expected: 2,
            actual: 3,
        };
        assert_eq!(e.to_string(), "predicate 'before' expects 2 arguments, got 3");
    }

    #[test]
    fn test_config_wraps_formula() {
        let e: ConfigError = FormulaError::UnboundVariable("v".to_string()).into();
        assert_eq!(e.to_string(), "variable 'v' is not bound by any enclosing quantifier");
    }
}
