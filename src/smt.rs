//! The string-solver boundary.
//!
//! String constraints over derivation tree variables are collected into an
//! [`SmtQuery`] and discharged through the [`StringSolver`] trait. Two
//! implementations ship with the crate:
//!
//! - [`FallbackSolver`] (this module): a deterministic equality-propagation
//!   solver for the equality/disequality fragment. Always available; the
//!   default. Shapes it cannot decide come back as
//!   [`SmtResponse::Unknown`], which the search engine treats as a prunable
//!   failure, never an error.
//! - [`TextSolver`][crate::smtlib::TextSolver]: pipes SMT-LIB 2 text to an
//!   external solver process.
//!
//! Enumeration of *distinct* models is driven by the caller: each returned
//! model is added to [`SmtQuery::exclude`], which a conforming solver
//! translates to a "differs from all previous models" clause.

use std::collections::BTreeMap;
use std::fmt::{Display, Formatter};
use std::rc::Rc;

use log::{debug, trace};

use crate::formula::Variable;

/// A string-valued term.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StringTerm {
    /// A literal string.
    Lit(Rc<str>),
    /// A free variable, referenced by name.
    Var(Rc<str>),
    /// Concatenation of sub-terms.
    Concat(Vec<StringTerm>),
}

impl StringTerm {
    pub fn lit(text: &str) -> Self {
        StringTerm::Lit(Rc::from(text))
    }

    pub fn var(variable: &Variable) -> Self {
        StringTerm::Var(Rc::clone(&variable.name))
    }

    pub fn concat(terms: impl IntoIterator<Item = StringTerm>) -> Self {
        StringTerm::Concat(terms.into_iter().collect())
    }

    /// Collect the names of all variables in this term, in order.
    pub fn variables(&self, out: &mut Vec<Rc<str>>) {
        match self {
            StringTerm::Lit(_) => {}
            StringTerm::Var(name) => {
                if !out.contains(name) {
                    out.push(Rc::clone(name));
                }
            }
            StringTerm::Concat(terms) => {
                for term in terms {
                    term.variables(out);
                }
            }
        }
    }

    /// Evaluate the term under an assignment; `None` if a variable is
    /// unassigned.
    pub fn value(&self, assignment: &Model) -> Option<String> {
        match self {
            StringTerm::Lit(text) => Some(text.to_string()),
            StringTerm::Var(name) => assignment.get(name).cloned(),
            StringTerm::Concat(terms) => {
                let mut out = String::new();
                for term in terms {
                    out.push_str(&term.value(assignment)?);
                }
                Some(out)
            }
        }
    }

    /// Replace every variable that has a value in `assignment` by the
    /// corresponding literal.
    pub fn substitute(&self, assignment: &Model) -> StringTerm {
        match self {
            StringTerm::Lit(_) => self.clone(),
            StringTerm::Var(name) => match assignment.get(name) {
                Some(value) => StringTerm::Lit(Rc::from(value.as_str())),
                None => self.clone(),
            },
            StringTerm::Concat(terms) => {
                StringTerm::Concat(terms.iter().map(|t| t.substitute(assignment)).collect())
            }
        }
    }
}

impl Display for StringTerm {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        match self {
            StringTerm::Lit(text) => write!(f, "{:?}", text),
            StringTerm::Var(name) => write!(f, "{}", name),
            StringTerm::Concat(terms) => {
                write!(f, "concat(")?;
                for (i, term) in terms.iter().enumerate() {
                    if i > 0 {
                        write!(f, ", ")?;
                    }
                    write!(f, "{}", term)?;
                }
                write!(f, ")")
            }
        }
    }
}

/// An (dis)equality constraint between two string terms.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StringAtom {
    Eq(StringTerm, StringTerm),
    Ne(StringTerm, StringTerm),
}

impl StringAtom {
    /// The dual atom (negation).
    pub fn negated(self) -> Self {
        match self {
            StringAtom::Eq(a, b) => StringAtom::Ne(a, b),
            StringAtom::Ne(a, b) => StringAtom::Eq(a, b),
        }
    }

    pub fn variables(&self) -> Vec<Rc<str>> {
        let (StringAtom::Eq(a, b) | StringAtom::Ne(a, b)) = self;
        let mut out = Vec::new();
        a.variables(&mut out);
        b.variables(&mut out);
        out
    }

    pub fn substitute(&self, assignment: &Model) -> StringAtom {
        match self {
            StringAtom::Eq(a, b) => {
                StringAtom::Eq(a.substitute(assignment), b.substitute(assignment))
            }
            StringAtom::Ne(a, b) => {
                StringAtom::Ne(a.substitute(assignment), b.substitute(assignment))
            }
        }
    }

    /// Ground truth value under an assignment; `None` if some variable is
    /// unassigned.
    pub fn holds(&self, assignment: &Model) -> Option<bool> {
        match self {
            StringAtom::Eq(a, b) => Some(a.value(assignment)? == b.value(assignment)?),
            StringAtom::Ne(a, b) => Some(a.value(assignment)? != b.value(assignment)?),
        }
    }
}

impl Display for StringAtom {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        match self {
            StringAtom::Eq(a, b) => write!(f, "{} == {}", a, b),
            StringAtom::Ne(a, b) => write!(f, "{} != {}", a, b),
        }
    }
}

/// A variable assignment returned by a solver.
pub type Model = BTreeMap<Rc<str>, String>;

/// A declared query variable.
///
/// The sort is the variable's nonterminal; `samples` are strings known to
/// be derivable from it. Both are advisory: the external backend ignores
/// them (the caller re-checks admission on every model anyway), while the
/// fallback solver tries the samples before its generic candidates.
#[derive(Debug, Clone)]
pub struct VarDecl {
    pub name: Rc<str>,
    pub sort: Rc<str>,
    pub samples: Vec<String>,
}

impl VarDecl {
    pub fn new(name: Rc<str>, sort: Rc<str>, samples: Vec<String>) -> Self {
        Self {
            name,
            sort,
            samples,
        }
    }
}

/// One batched query: declarations, asserted atoms, and previously
/// returned models the next model must differ from.
#[derive(Debug, Clone, Default)]
pub struct SmtQuery {
    pub decls: Vec<VarDecl>,
    pub asserts: Vec<StringAtom>,
    pub exclude: Vec<Model>,
}

/// Solver verdict for one query.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SmtResponse {
    Model(Model),
    Unsat,
    /// Could not decide: unsupported fragment, process failure, or timeout.
    Unknown,
}

/// The external string solver boundary.
pub trait StringSolver {
    fn solve(&self, query: &SmtQuery) -> SmtResponse;
}

/// Deterministic fallback solver for the equality/disequality fragment.
///
/// Algorithm: union variables related by `var == var` atoms, force class
/// values from `var == <ground>` atoms, then enumerate candidate values for
/// the remaining free classes (a fixed candidate sequence, so runs are
/// reproducible) until all atoms hold and the assignment differs from every
/// excluded model.
#[derive(Debug, Clone)]
pub struct FallbackSolver {
    /// Candidates tried per free equivalence class before giving up.
    pub candidates_per_class: usize,
    /// Total assignment attempts before answering `Unknown`.
    pub max_attempts: usize,
}

impl Default for FallbackSolver {
    fn default() -> Self {
        Self {
            candidates_per_class: 64,
            max_attempts: 4096,
        }
    }
}

/// The fixed candidate sequence: `a`..`z`, `0`..`9`, then `aa`, `ab`, ...
fn candidate(index: usize) -> String {
    const ALPHABET: &[u8] = b"abcdefghijklmnopqrstuvwxyz0123456789";
    let base = ALPHABET.len();
    let mut index = index;
    let mut len = 1;
    let mut span = base;
    while index >= span {
        index -= span;
        len += 1;
        span = span.saturating_mul(base);
    }
    let mut out = vec![b'a'; len];
    for slot in (0..len).rev() {
        out[slot] = ALPHABET[index % base];
        index /= base;
    }
    String::from_utf8(out).expect("alphabet is ASCII")
}

impl StringSolver for FallbackSolver {
    fn solve(&self, query: &SmtQuery) -> SmtResponse {
        debug!(
            "fallback solve: {} decls, {} asserts, {} excluded",
            query.decls.len(),
            query.asserts.len(),
            query.exclude.len()
        );

        // Union-find over declared variables.
        let names: Vec<Rc<str>> = query.decls.iter().map(|decl| Rc::clone(&decl.name)).collect();
        let position = |name: &Rc<str>| names.iter().position(|n| n == name);
        let mut parent: Vec<usize> = (0..names.len()).collect();
        fn find(parent: &mut Vec<usize>, mut i: usize) -> usize {
            while parent[i] != i {
                parent[i] = parent[parent[i]];
                i = parent[i];
            }
            i
        }

        let ground = |term: &StringTerm| term.value(&Model::new());

        // First pass: unions and forced values.
        let mut forced: Vec<Option<String>> = vec![None; names.len()];
        for atom in &query.asserts {
            if let StringAtom::Eq(a, b) = atom {
                match (a, b) {
                    (StringTerm::Var(x), StringTerm::Var(y)) => {
                        let (Some(i), Some(j)) = (position(x), position(y)) else {
                            return SmtResponse::Unknown;
                        };
                        let (ri, rj) = (find(&mut parent, i), find(&mut parent, j));
                        if ri != rj {
                            // Merge, keeping a forced value if either has one.
                            let value = match (forced[ri].take(), forced[rj].take()) {
                                (Some(a), Some(b)) if a != b => {
                                    debug!("fallback: merged classes force {} vs {}", a, b);
                                    return SmtResponse::Unsat;
                                }
                                (Some(a), _) => Some(a),
                                (None, other) => other,
                            };
                            parent[ri] = rj;
                            forced[rj] = value;
                        }
                    }
                    (StringTerm::Var(x), term) | (term, StringTerm::Var(x)) => {
                        let Some(value) = ground(term) else {
                            // A concat with free variables: out of fragment.
                            return SmtResponse::Unknown;
                        };
                        let Some(i) = position(x) else {
                            return SmtResponse::Unknown;
                        };
                        let root = find(&mut parent, i);
                        match &forced[root] {
                            Some(existing) if *existing != value => {
                                debug!("fallback: conflicting forced values for {}", x);
                                return SmtResponse::Unsat;
                            }
                            _ => forced[root] = Some(value),
                        }
                    }
                    (a, b) => {
                        let (Some(va), Some(vb)) = (ground(a), ground(b)) else {
                            return SmtResponse::Unknown;
                        };
                        if va != vb {
                            return SmtResponse::Unsat;
                        }
                    }
                }
            }
        }
        // Disequalities must be within the fragment too.
        for atom in &query.asserts {
            if let StringAtom::Ne(a, b) = atom {
                for term in [a, b] {
                    match term {
                        StringTerm::Var(_) => {}
                        other if ground(other).is_some() => {}
                        _ => return SmtResponse::Unknown,
                    }
                }
            }
        }

        // Free classes, in first-occurrence order, each with its candidate
        // pool: the samples of every member variable, then the generic
        // sequence.
        let mut free_roots: Vec<usize> = Vec::new();
        for i in 0..names.len() {
            let root = find(&mut parent, i);
            if forced[root].is_none() && !free_roots.contains(&root) {
                free_roots.push(root);
            }
        }
        let mut pools: Vec<Vec<String>> = vec![Vec::new(); free_roots.len()];
        for (i, decl) in query.decls.iter().enumerate() {
            let root = find(&mut parent, i);
            if let Some(slot) = free_roots.iter().position(|&r| r == root) {
                for sample in &decl.samples {
                    if !pools[slot].contains(sample) {
                        pools[slot].push(sample.clone());
                    }
                }
            }
        }
        let pick = |slot: usize, index: usize| -> String {
            let pool = &pools[slot];
            if index < pool.len() {
                pool[index].clone()
            } else {
                candidate(index - pool.len())
            }
        };

        let build_model = |parent: &mut Vec<usize>, choice: &[usize]| -> Model {
            let mut model = Model::new();
            for (i, name) in names.iter().enumerate() {
                let root = find(parent, i);
                let value = match &forced[root] {
                    Some(value) => value.clone(),
                    None => {
                        let slot = free_roots.iter().position(|&r| r == root).unwrap();
                        pick(slot, choice[slot])
                    }
                };
                model.insert(Rc::clone(name), value);
            }
            model
        };

        // Odometer over candidate choices for the free classes.
        let mut choice = vec![0usize; free_roots.len()];
        let mut attempts = 0usize;
        loop {
            attempts += 1;
            if attempts > self.max_attempts {
                debug!("fallback: attempt budget exhausted");
                return SmtResponse::Unknown;
            }

            let model = build_model(&mut parent, &choice);
            let satisfied = query
                .asserts
                .iter()
                .all(|atom| atom.holds(&model) == Some(true));
            let distinct = !query.exclude.contains(&model);
            trace!(
                "fallback attempt {:?}: satisfied={}, distinct={}",
                choice,
                satisfied,
                distinct
            );
            if satisfied && distinct {
                return SmtResponse::Model(model);
            }

            // Advance the odometer.
            let mut slot = 0;
            loop {
                if slot == choice.len() {
                    // All combinations tried. With no free classes the
                    // single assignment was definitively checked.
                    return if free_roots.is_empty() {
                        SmtResponse::Unsat
                    } else {
                        SmtResponse::Unknown
                    };
                }
                choice[slot] += 1;
                if choice[slot] < self.candidates_per_class {
                    break;
                }
                choice[slot] = 0;
                slot += 1;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use test_log::test;

    use super::*;

    fn decl(name: &str) -> VarDecl {
        VarDecl::new(Rc::from(name), Rc::from("var"), vec![])
    }

    fn decl_sampled(name: &str, samples: &[&str]) -> VarDecl {
        VarDecl::new(
            Rc::from(name),
            Rc::from("var"),
            samples.iter().map(|s| s.to_string()).collect(),
        )
    }

    #[test]
    fn test_candidate_sequence() {
        assert_eq!(candidate(0), "a");
        assert_eq!(candidate(25), "z");
        assert_eq!(candidate(26), "0");
        assert_eq!(candidate(35), "9");
        assert_eq!(candidate(36), "aa");
        assert_eq!(candidate(37), "ab");
    }

    #[test]
    fn test_forced_value() {
        let solver = FallbackSolver::default();
        let query = SmtQuery {
            decls: vec![decl("x")],
            asserts: vec![StringAtom::Eq(
                StringTerm::Var(Rc::from("x")),
                StringTerm::lit("hello"),
            )],
            exclude: vec![],
        };
        match solver.solve(&query) {
            SmtResponse::Model(model) => assert_eq!(model["x"], "hello"),
            other => panic!("expected model, got {:?}", other),
        }
    }

    #[test]
    fn test_equality_chain() {
        let solver = FallbackSolver::default();
        let x = StringTerm::Var(Rc::from("x"));
        let y = StringTerm::Var(Rc::from("y"));
        let query = SmtQuery {
            decls: vec![decl("x"), decl("y")],
            asserts: vec![
                StringAtom::Eq(x.clone(), y.clone()),
                StringAtom::Eq(y.clone(), StringTerm::lit("q")),
            ],
            exclude: vec![],
        };
        match solver.solve(&query) {
            SmtResponse::Model(model) => {
                assert_eq!(model["x"], "q");
                assert_eq!(model["y"], "q");
            }
            other => panic!("expected model, got {:?}", other),
        }
    }

    #[test]
    fn test_conflict_unsat() {
        let solver = FallbackSolver::default();
        let x = StringTerm::Var(Rc::from("x"));
        let query = SmtQuery {
            decls: vec![decl("x")],
            asserts: vec![
                StringAtom::Eq(x.clone(), StringTerm::lit("a")),
                StringAtom::Eq(x.clone(), StringTerm::lit("b")),
            ],
            exclude: vec![],
        };
        assert_eq!(solver.solve(&query), SmtResponse::Unsat);
    }

    #[test]
    fn test_disequality() {
        let solver = FallbackSolver::default();
        let x = StringTerm::Var(Rc::from("x"));
        let y = StringTerm::Var(Rc::from("y"));
        let query = SmtQuery {
            decls: vec![decl("x"), decl("y")],
            asserts: vec![StringAtom::Ne(x, y)],
            exclude: vec![],
        };
        match solver.solve(&query) {
            SmtResponse::Model(model) => assert_ne!(model["x"], model["y"]),
            other => panic!("expected model, got {:?}", other),
        }
    }

    #[test]
    fn test_distinct_models() {
        let solver = FallbackSolver::default();
        let query = SmtQuery {
            decls: vec![decl("x")],
            asserts: vec![],
            exclude: vec![],
        };
        let first = match solver.solve(&query) {
            SmtResponse::Model(model) => model,
            other => panic!("expected model, got {:?}", other),
        };
        let query = SmtQuery {
            exclude: vec![first.clone()],
            ..query
        };
        match solver.solve(&query) {
            SmtResponse::Model(second) => assert_ne!(first, second),
            other => panic!("expected model, got {:?}", other),
        }
    }

    #[test]
    fn test_samples_preferred() {
        let solver = FallbackSolver::default();
        let query = SmtQuery {
            decls: vec![decl_sampled("x", &["x", "y", "z"])],
            asserts: vec![],
            exclude: vec![],
        };
        match solver.solve(&query) {
            SmtResponse::Model(model) => assert_eq!(model["x"], "x"),
            other => panic!("expected model, got {:?}", other),
        }

        // Excluding the samples falls through to the generic sequence.
        let exclude = ["x", "y", "z"]
            .iter()
            .map(|v| Model::from([(Rc::from("x"), v.to_string())]))
            .collect();
        let query = SmtQuery {
            decls: vec![decl_sampled("x", &["x", "y", "z"])],
            asserts: vec![],
            exclude,
        };
        match solver.solve(&query) {
            SmtResponse::Model(model) => assert_eq!(model["x"], "a"),
            other => panic!("expected model, got {:?}", other),
        }
    }

    #[test]
    fn test_forced_excluded_is_unsat() {
        let solver = FallbackSolver::default();
        let x = StringTerm::Var(Rc::from("x"));
        let query = SmtQuery {
            decls: vec![decl("x")],
            asserts: vec![StringAtom::Eq(x, StringTerm::lit("a"))],
            exclude: vec![Model::from([(Rc::from("x"), "a".to_string())])],
        };
        assert_eq!(solver.solve(&query), SmtResponse::Unsat);
    }

    #[test]
    fn test_ground_query() {
        let solver = FallbackSolver::default();
        let query = SmtQuery {
            decls: vec![],
            asserts: vec![StringAtom::Eq(StringTerm::lit("a"), StringTerm::lit("a"))],
            exclude: vec![],
        };
        assert!(matches!(solver.solve(&query), SmtResponse::Model(_)));

        let query = SmtQuery {
            decls: vec![],
            asserts: vec![StringAtom::Eq(StringTerm::lit("a"), StringTerm::lit("b"))],
            exclude: vec![],
        };
        assert_eq!(solver.solve(&query), SmtResponse::Unsat);
    }

    #[test]
    fn test_unsupported_fragment() {
        let solver = FallbackSolver::default();
        let x = StringTerm::Var(Rc::from("x"));
        let y = StringTerm::Var(Rc::from("y"));
        let query = SmtQuery {
            decls: vec![decl("x"), decl("y")],
            asserts: vec![StringAtom::Eq(
                x.clone(),
                StringTerm::concat([y, StringTerm::lit("!")]),
            )],
            exclude: vec![],
        };
        assert_eq!(solver.solve(&query), SmtResponse::Unknown);
    }
}
