//! The constraint formula model.
//!
//! [`Formula`] is a closed tagged-variant set: boolean connectives, SMT
//! (string) atoms, structural and semantic predicate atoms, and the two
//! tree quantifiers. Predicate atoms are resolved against an explicit
//! signature table ([`Predicates`][crate::predicate::Predicates]) supplied
//! to validation, evaluation and solving; there is no global registry.
//!
//! Formulas are plain immutable values. [`Formula::check`] validates the
//! binding structure fail-fast; [`Formula::nnf`] pushes negations down to
//! the atoms (dualizing them) so the search engine never faces a negated
//! connective or quantifier.

use std::collections::{BTreeMap, BTreeSet};
use std::fmt::{Display, Formatter};
use std::rc::Rc;

use crate::error::FormulaError;
use crate::grammar::Grammar;
use crate::pattern::MatchPattern;
use crate::predicate::Predicates;
use crate::smt::{StringAtom, StringTerm};

/// A named placeholder typed by a nonterminal.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Variable {
    pub name: Rc<str>,
    pub sort: Rc<str>,
}

impl Variable {
    pub fn new(name: &str, sort: &str) -> Self {
        Self {
            name: Rc::from(name),
            sort: Rc::from(sort),
        }
    }
}

impl Display for Variable {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}: <{}>", self.name, self.sort)
    }
}

/// A structural predicate atom: a purely tree-positional relation.
#[derive(Debug, Clone)]
pub struct StructuralAtom {
    pub name: Rc<str>,
    pub args: Vec<Variable>,
    pub negated: bool,
}

/// An argument of a semantic predicate: a tree variable or literal text.
#[derive(Debug, Clone)]
pub enum SemArg {
    Var(Variable),
    Text(Rc<str>),
}

/// A semantic predicate atom: a relation over rendered values that may
/// request tree edits during solving.
#[derive(Debug, Clone)]
pub struct SemanticAtom {
    pub name: Rc<str>,
    pub args: Vec<SemArg>,
    pub negated: bool,
}

/// A quantifier: `forall/exists <sort> bound [= pattern] in in_var: body`.
///
/// For universal quantifiers, `matched` records the idents of subtrees
/// whose match has already been instantiated; the solver threads updated
/// copies through its states (the formula value itself is never mutated).
#[derive(Debug, Clone)]
pub struct Quantified {
    pub bound: Variable,
    pub in_var: Variable,
    pub pattern: Option<MatchPattern>,
    pub body: Formula,
    pub matched: BTreeSet<u64>,
}

#[derive(Debug, Clone)]
pub enum Formula {
    Smt(StringAtom),
    Structural(StructuralAtom),
    Semantic(SemanticAtom),
    Not(Box<Formula>),
    And(Vec<Formula>),
    Or(Vec<Formula>),
    Forall(Box<Quantified>),
    Exists(Box<Quantified>),
}

// ---------------------------------------------------------------------------
// Constructors, in the shortcut style used throughout the tests and demos.

pub fn forall(bound: Variable, in_var: Variable, body: Formula) -> Formula {
    Formula::Forall(Box::new(Quantified {
        bound,
        in_var,
        pattern: None,
        body,
        matched: BTreeSet::new(),
    }))
}

pub fn forall_bind(
    pattern: MatchPattern,
    bound: Variable,
    in_var: Variable,
    body: Formula,
) -> Formula {
    Formula::Forall(Box::new(Quantified {
        bound,
        in_var,
        pattern: Some(pattern),
        body,
        matched: BTreeSet::new(),
    }))
}

pub fn exists(bound: Variable, in_var: Variable, body: Formula) -> Formula {
    Formula::Exists(Box::new(Quantified {
        bound,
        in_var,
        pattern: None,
        body,
        matched: BTreeSet::new(),
    }))
}

pub fn exists_bind(
    pattern: MatchPattern,
    bound: Variable,
    in_var: Variable,
    body: Formula,
) -> Formula {
    Formula::Exists(Box::new(Quantified {
        bound,
        in_var,
        pattern: Some(pattern),
        body,
        matched: BTreeSet::new(),
    }))
}

pub fn conj(formulas: impl IntoIterator<Item = Formula>) -> Formula {
    Formula::And(formulas.into_iter().collect())
}

pub fn disj(formulas: impl IntoIterator<Item = Formula>) -> Formula {
    Formula::Or(formulas.into_iter().collect())
}

pub fn neg(formula: Formula) -> Formula {
    Formula::Not(Box::new(formula))
}

pub fn smt_eq(lhs: StringTerm, rhs: StringTerm) -> Formula {
    Formula::Smt(StringAtom::Eq(lhs, rhs))
}

pub fn smt_ne(lhs: StringTerm, rhs: StringTerm) -> Formula {
    Formula::Smt(StringAtom::Ne(lhs, rhs))
}

pub fn structural(name: &str, args: impl IntoIterator<Item = Variable>) -> Formula {
    Formula::Structural(StructuralAtom {
        name: Rc::from(name),
        args: args.into_iter().collect(),
        negated: false,
    })
}

pub fn semantic(name: &str, args: impl IntoIterator<Item = SemArg>) -> Formula {
    Formula::Semantic(SemanticAtom {
        name: Rc::from(name),
        args: args.into_iter().collect(),
        negated: false,
    })
}

// ---------------------------------------------------------------------------

impl Formula {
    /// All variables occurring free in this formula.
    pub fn free_variables(&self) -> BTreeSet<Variable> {
        match self {
            Formula::Smt(atom) => atom
                .variables()
                .into_iter()
                .map(|name| Variable {
                    name,
                    sort: Rc::from(""),
                })
                .collect(),
            Formula::Structural(atom) => atom.args.iter().cloned().collect(),
            Formula::Semantic(atom) => atom
                .args
                .iter()
                .filter_map(|arg| match arg {
                    SemArg::Var(v) => Some(v.clone()),
                    SemArg::Text(_) => None,
                })
                .collect(),
            Formula::Not(inner) => inner.free_variables(),
            Formula::And(items) | Formula::Or(items) => items
                .iter()
                .flat_map(|item| item.free_variables())
                .collect(),
            Formula::Forall(q) | Formula::Exists(q) => {
                let mut free = q.body.free_variables();
                free.retain(|v| v.name != q.bound.name);
                if let Some(pattern) = &q.pattern {
                    for (hole, _) in pattern.holes() {
                        free.retain(|v| &v.name != hole);
                    }
                }
                free.insert(q.in_var.clone());
                free
            }
        }
    }

    /// Validate the binding structure against a grammar, a predicate
    /// signature, and the top-level constant. Fails fast on the first
    /// violation.
    pub fn check(
        &self,
        grammar: &Grammar,
        predicates: &Predicates,
        top: &Variable,
    ) -> Result<(), FormulaError> {
        if !grammar.contains(&top.sort) {
            return Err(FormulaError::UnknownSort {
                name: top.name.to_string(),
                sort: top.sort.to_string(),
            });
        }
        let mut scope = BTreeMap::new();
        scope.insert(Rc::clone(&top.name), Rc::clone(&top.sort));
        self.check_scoped(grammar, predicates, &scope)
    }

    fn check_scoped(
        &self,
        grammar: &Grammar,
        predicates: &Predicates,
        scope: &BTreeMap<Rc<str>, Rc<str>>,
    ) -> Result<(), FormulaError> {
        let check_var = |v: &Variable| -> Result<(), FormulaError> {
            match scope.get(&v.name) {
                None => Err(FormulaError::UnboundVariable(v.name.to_string())),
                Some(sort) if sort != &v.sort => {
                    Err(FormulaError::ConflictingSorts(v.name.to_string()))
                }
                Some(_) => Ok(()),
            }
        };

        match self {
            Formula::Smt(atom) => {
                for name in atom.variables() {
                    if !scope.contains_key(&name) {
                        return Err(FormulaError::UnboundVariable(name.to_string()));
                    }
                }
                Ok(())
            }
            Formula::Structural(atom) => {
                let predicate = predicates
                    .structural(&atom.name)
                    .ok_or_else(|| FormulaError::UnknownPredicate(atom.name.to_string()))?;
                if atom.args.len() != predicate.arity {
                    return Err(FormulaError::ArityMismatch {
                        name: atom.name.to_string(),
                        expected: predicate.arity,
                        actual: atom.args.len(),
                    });
                }
                atom.args.iter().try_for_each(check_var)
            }
            Formula::Semantic(atom) => {
                let predicate = predicates
                    .semantic(&atom.name)
                    .ok_or_else(|| FormulaError::UnknownPredicate(atom.name.to_string()))?;
                if atom.args.len() != predicate.arity {
                    return Err(FormulaError::ArityMismatch {
                        name: atom.name.to_string(),
                        expected: predicate.arity,
                        actual: atom.args.len(),
                    });
                }
                atom.args.iter().try_for_each(|arg| match arg {
                    SemArg::Var(v) => check_var(v),
                    SemArg::Text(_) => Ok(()),
                })
            }
            Formula::Not(inner) => inner.check_scoped(grammar, predicates, scope),
            Formula::And(items) | Formula::Or(items) => items
                .iter()
                .try_for_each(|item| item.check_scoped(grammar, predicates, scope)),
            Formula::Forall(q) | Formula::Exists(q) => {
                check_var(&q.in_var)?;
                let mut inner = scope.clone();
                let mut bind = |name: &Rc<str>, sort: &Rc<str>| -> Result<(), FormulaError> {
                    if !grammar.contains(sort) {
                        return Err(FormulaError::UnknownSort {
                            name: name.to_string(),
                            sort: sort.to_string(),
                        });
                    }
                    if inner.insert(Rc::clone(name), Rc::clone(sort)).is_some() {
                        return Err(FormulaError::ShadowedVariable(name.to_string()));
                    }
                    Ok(())
                };
                bind(&q.bound.name, &q.bound.sort)?;
                if let Some(pattern) = &q.pattern {
                    for (hole, sort) in pattern.holes() {
                        bind(hole, sort)?;
                    }
                }
                q.body.check_scoped(grammar, predicates, &inner)
            }
        }
    }

    /// Negation normal form: negations pushed onto the atoms (dualizing
    /// them), quantifiers and connectives flipped as needed. The result
    /// contains no [`Formula::Not`].
    pub fn nnf(self) -> Formula {
        self.nnf_inner(false)
    }

    fn nnf_inner(self, negate: bool) -> Formula {
        match self {
            Formula::Not(inner) => inner.nnf_inner(!negate),
            Formula::Smt(atom) => Formula::Smt(if negate { atom.negated() } else { atom }),
            Formula::Structural(mut atom) => {
                atom.negated ^= negate;
                Formula::Structural(atom)
            }
            Formula::Semantic(mut atom) => {
                atom.negated ^= negate;
                Formula::Semantic(atom)
            }
            Formula::And(items) => {
                let items = items.into_iter().map(|f| f.nnf_inner(negate)).collect();
                if negate {
                    Formula::Or(items)
                } else {
                    Formula::And(items)
                }
            }
            Formula::Or(items) => {
                let items = items.into_iter().map(|f| f.nnf_inner(negate)).collect();
                if negate {
                    Formula::And(items)
                } else {
                    Formula::Or(items)
                }
            }
            Formula::Forall(q) => {
                let Quantified {
                    bound,
                    in_var,
                    pattern,
                    body,
                    matched,
                } = *q;
                let q = Quantified {
                    bound,
                    in_var,
                    pattern,
                    body: body.nnf_inner(negate),
                    matched: if negate { BTreeSet::new() } else { matched },
                };
                if negate {
                    Formula::Exists(Box::new(q))
                } else {
                    Formula::Forall(Box::new(q))
                }
            }
            Formula::Exists(q) => {
                let Quantified {
                    bound,
                    in_var,
                    pattern,
                    body,
                    ..
                } = *q;
                let q = Quantified {
                    bound,
                    in_var,
                    pattern,
                    body: body.nnf_inner(negate),
                    matched: BTreeSet::new(),
                };
                if negate {
                    Formula::Forall(Box::new(q))
                } else {
                    Formula::Exists(Box::new(q))
                }
            }
        }
    }

    /// Flatten nested conjunctions into a list of conjuncts.
    pub fn into_conjuncts(self) -> Vec<Formula> {
        match self {
            Formula::And(items) => items
                .into_iter()
                .flat_map(|item| item.into_conjuncts())
                .collect(),
            other => vec![other],
        }
    }
}

impl Display for Formula {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        match self {
            Formula::Smt(atom) => write!(f, "{}", atom),
            Formula::Structural(atom) => {
                if atom.negated {
                    write!(f, "¬")?;
                }
                write!(f, "{}(", atom.name)?;
                for (i, arg) in atom.args.iter().enumerate() {
                    if i > 0 {
                        write!(f, ", ")?;
                    }
                    write!(f, "{}", arg.name)?;
                }
                write!(f, ")")
            }
            Formula::Semantic(atom) => {
                if atom.negated {
                    write!(f, "¬")?;
                }
                write!(f, "{}(", atom.name)?;
                for (i, arg) in atom.args.iter().enumerate() {
                    if i > 0 {
                        write!(f, ", ")?;
                    }
                    match arg {
                        SemArg::Var(v) => write!(f, "{}", v.name)?,
                        SemArg::Text(t) => write!(f, "{:?}", t)?,
                    }
                }
                write!(f, ")")
            }
            Formula::Not(inner) => write!(f, "¬({})", inner),
            Formula::And(items) => join(f, items, " ∧ "),
            Formula::Or(items) => join(f, items, " ∨ "),
            Formula::Forall(q) => write_quantified(f, "∀", q),
            Formula::Exists(q) => write_quantified(f, "∃", q),
        }
    }
}

fn join(f: &mut Formatter<'_>, items: &[Formula], sep: &str) -> std::fmt::Result {
    write!(f, "(")?;
    for (i, item) in items.iter().enumerate() {
        if i > 0 {
            write!(f, "{}", sep)?;
        }
        write!(f, "{}", item)?;
    }
    write!(f, ")")
}

fn write_quantified(f: &mut Formatter<'_>, symbol: &str, q: &Quantified) -> std::fmt::Result {
    write!(f, "{} ", symbol)?;
    if let Some(pattern) = &q.pattern {
        write!(f, "\"{}\" = ", pattern)?;
    }
    write!(f, "{} ∈ {}: ({})", q.bound, q.in_var.name, q.body)
}

#[cfg(test)]
mod tests {
    use test_log::test;

    use super::*;
    use crate::grammar::assignment_grammar;

    fn vars() -> (Variable, Variable) {
        (Variable::new("start", "start"), Variable::new("v", "var"))
    }

    #[test]
    fn test_free_variables() {
        let (top, v) = vars();
        let formula = forall(
            v.clone(),
            top.clone(),
            smt_eq(StringTerm::var(&v), StringTerm::lit("x")),
        );
        let free = formula.free_variables();
        assert_eq!(free.len(), 1);
        assert!(free.contains(&top));
    }

    #[test]
    fn test_check_ok() {
        let (top, v) = vars();
        let grammar = assignment_grammar();
        let formula = forall(
            v.clone(),
            top.clone(),
            smt_eq(StringTerm::var(&v), StringTerm::lit("x")),
        );
        formula.check(&grammar, &Predicates::core(), &top).unwrap();
    }

    #[test]
    fn test_check_unbound() {
        let (top, v) = vars();
        let grammar = assignment_grammar();
        let other = Variable::new("loose", "var");
        let formula = forall(
            v,
            top.clone(),
            smt_eq(StringTerm::var(&other), StringTerm::lit("x")),
        );
        assert_eq!(
            formula.check(&grammar, &Predicates::core(), &top),
            Err(FormulaError::UnboundVariable("loose".to_string()))
        );
    }

    #[test]
    fn test_check_shadowing() {
        let (top, v) = vars();
        let grammar = assignment_grammar();
        let formula = forall(
            v.clone(),
            top.clone(),
            exists(
                v.clone(),
                top.clone(),
                smt_eq(StringTerm::var(&v), StringTerm::lit("x")),
            ),
        );
        assert_eq!(
            formula.check(&grammar, &Predicates::core(), &top),
            Err(FormulaError::ShadowedVariable("v".to_string()))
        );
    }

    #[test]
    fn test_check_unknown_sort() {
        let top = Variable::new("start", "start");
        let grammar = assignment_grammar();
        let ghost = Variable::new("g", "ghost");
        let formula = forall(
            ghost.clone(),
            top.clone(),
            smt_eq(StringTerm::var(&ghost), StringTerm::lit("x")),
        );
        assert!(matches!(
            formula.check(&grammar, &Predicates::core(), &top),
            Err(FormulaError::UnknownSort { .. })
        ));
    }

    #[test]
    fn test_check_arity() {
        let (top, v) = vars();
        let grammar = assignment_grammar();
        let formula = forall(
            v.clone(),
            top.clone(),
            structural("before", [v.clone()]),
        );
        assert_eq!(
            formula.check(&grammar, &Predicates::core(), &top),
            Err(FormulaError::ArityMismatch {
                name: "before".to_string(),
                expected: 2,
                actual: 1,
            })
        );
    }

    #[test]
    fn test_nnf_flips_quantifiers() {
        let (top, v) = vars();
        let formula = neg(forall(
            v.clone(),
            top.clone(),
            smt_eq(StringTerm::var(&v), StringTerm::lit("x")),
        ));
        let nnf = formula.nnf();
        match nnf {
            Formula::Exists(q) => match q.body {
                Formula::Smt(StringAtom::Ne(_, _)) => {}
                other => panic!("expected dualized atom, got {}", other),
            },
            other => panic!("expected exists, got {}", other),
        }
    }

    #[test]
    fn test_nnf_de_morgan() {
        let (top, v) = vars();
        let a = smt_eq(StringTerm::var(&v), StringTerm::lit("x"));
        let b = smt_eq(StringTerm::var(&v), StringTerm::lit("y"));
        let formula = forall(v, top, neg(conj([a, b])));
        match formula.nnf() {
            Formula::Forall(q) => assert!(matches!(q.body, Formula::Or(_))),
            other => panic!("expected forall, got {}", other),
        }
    }

    #[test]
    fn test_into_conjuncts() {
        let (_, v) = vars();
        let a = smt_eq(StringTerm::var(&v), StringTerm::lit("x"));
        let b = smt_ne(StringTerm::var(&v), StringTerm::lit("y"));
        let c = smt_eq(StringTerm::var(&v), StringTerm::lit("z"));
        let conjuncts = conj([a, conj([b, c])]).into_conjuncts();
        assert_eq!(conjuncts.len(), 3);
    }
}
