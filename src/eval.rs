//! The pure satisfaction evaluator.
//!
//! [`evaluate`] maps a *closed* derivation tree and a formula to a boolean.
//! It is a pure function of its inputs: no tree edits, no solver state.
//! Semantic predicates are read-only here (an edit request counts as
//! not-satisfied), and SMT atoms are grounded before being handed to the
//! string solver, so the solver only ever confirms or refutes.

use std::collections::BTreeMap;
use std::rc::Rc;

use log::warn;

use crate::formula::{Formula, Quantified, SemArg};
use crate::grammar::Grammar;
use crate::pattern::MatchPattern;
use crate::predicate::{Predicates, SemInst, SemPredResult};
use crate::smt::{Model, SmtQuery, SmtResponse, StringSolver};
use crate::tree::{NodeId, TreeArena};

/// Binding of variable names to arena nodes.
pub type Env = BTreeMap<Rc<str>, NodeId>;

/// Evaluate `formula` against the closed tree at `root`.
///
/// `env` must bind every free variable of `formula`; conventionally it maps
/// the top-level constant to `root`.
///
/// # Panics
///
/// Panics if the tree at `root` still has open leaves; the evaluator is
/// only defined on closed trees.
pub fn evaluate(
    arena: &TreeArena,
    grammar: &Grammar,
    root: NodeId,
    formula: &Formula,
    env: &Env,
    predicates: &Predicates,
    smt: &dyn StringSolver,
) -> bool {
    assert!(
        arena.is_complete(root),
        "evaluate called on a tree with open leaves"
    );
    eval(arena, grammar, root, formula, env, predicates, smt)
}

fn eval(
    arena: &TreeArena,
    grammar: &Grammar,
    root: NodeId,
    formula: &Formula,
    env: &Env,
    predicates: &Predicates,
    smt: &dyn StringSolver,
) -> bool {
    match formula {
        Formula::Smt(atom) => {
            let mut assignment = Model::new();
            for name in atom.variables() {
                match env.get(&name) {
                    Some(&node) => {
                        assignment.insert(name, arena.render(node));
                    }
                    None => {
                        warn!("smt atom references unbound variable '{}'", name);
                        return false;
                    }
                }
            }
            let query = SmtQuery {
                decls: vec![],
                asserts: vec![atom.substitute(&assignment)],
                exclude: vec![],
            };
            match smt.solve(&query) {
                SmtResponse::Model(_) => true,
                SmtResponse::Unsat => false,
                SmtResponse::Unknown => {
                    warn!("solver could not decide ground atom {}", atom);
                    false
                }
            }
        }
        Formula::Structural(atom) => {
            let predicate = predicates
                .structural(&atom.name)
                .unwrap_or_else(|| panic!("undeclared predicate '{}'", atom.name));
            let mut paths = Vec::with_capacity(atom.args.len());
            for arg in &atom.args {
                let Some(&node) = env.get(&arg.name) else {
                    warn!("structural atom references unbound variable '{}'", arg.name);
                    return false;
                };
                let Some(path) = arena.path_of(root, node) else {
                    warn!("argument '{}' is not part of the context tree", arg.name);
                    return false;
                };
                paths.push(path);
            }
            predicate.evaluate(arena, root, &paths) != atom.negated
        }
        Formula::Semantic(atom) => {
            let predicate = predicates
                .semantic(&atom.name)
                .unwrap_or_else(|| panic!("undeclared predicate '{}'", atom.name));
            let mut args = Vec::with_capacity(atom.args.len());
            for arg in &atom.args {
                match arg {
                    SemArg::Var(v) => match env.get(&v.name) {
                        Some(&node) => args.push(SemInst::Node(node)),
                        None => {
                            warn!("semantic atom references unbound variable '{}'", v.name);
                            return false;
                        }
                    },
                    SemArg::Text(text) => args.push(SemInst::Text(Rc::clone(text))),
                }
            }
            match predicate.evaluate(arena, grammar, &args) {
                SemPredResult::True => !atom.negated,
                SemPredResult::False => atom.negated,
                SemPredResult::NotReady | SemPredResult::Bind { .. } => {
                    warn!(
                        "semantic predicate '{}' undecided on a closed tree",
                        atom.name
                    );
                    false
                }
            }
        }
        Formula::Not(inner) => !eval(arena, grammar, root, inner, env, predicates, smt),
        Formula::And(items) => items
            .iter()
            .all(|item| eval(arena, grammar, root, item, env, predicates, smt)),
        Formula::Or(items) => items
            .iter()
            .any(|item| eval(arena, grammar, root, item, env, predicates, smt)),
        Formula::Forall(q) => quantifier_matches(arena, env, q).into_iter().all(|extended| {
            eval(arena, grammar, root, &q.body, &extended, predicates, smt)
        }),
        Formula::Exists(q) => quantifier_matches(arena, env, q).into_iter().any(|extended| {
            eval(arena, grammar, root, &q.body, &extended, predicates, smt)
        }),
    }
}

/// Enumerate the quantifier's range: every subtree of the bound tree with
/// the declared sort that unifies with the pattern (if present). Each match
/// yields the environment extended with the bound variable and the named
/// pattern holes.
pub(crate) fn quantifier_matches(arena: &TreeArena, env: &Env, q: &Quantified) -> Vec<Env> {
    let Some(&in_node) = env.get(&q.in_var.name) else {
        warn!("quantifier ranges over unbound variable '{}'", q.in_var.name);
        return Vec::new();
    };
    raw_matches(arena, in_node, &q.bound.sort, q.pattern.as_ref())
        .into_iter()
        .map(|(node, holes)| {
            let mut extended = env.clone();
            extended.insert(Rc::clone(&q.bound.name), node);
            for (name, hole) in holes {
                extended.insert(name, hole);
            }
            extended
        })
        .collect()
}

/// The `(node, hole bindings)` matches of a sort/pattern selector below
/// `in_node`, in preorder.
pub(crate) fn raw_matches(
    arena: &TreeArena,
    in_node: NodeId,
    sort: &str,
    pattern: Option<&MatchPattern>,
) -> Vec<(NodeId, Vec<(Rc<str>, NodeId)>)> {
    arena
        .subtrees_with_sort(in_node, sort)
        .into_iter()
        .filter_map(|(_, node)| match pattern {
            None => Some((node, Vec::new())),
            Some(pattern) => pattern.match_at(arena, node).map(|holes| (node, holes)),
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use test_log::test;

    use super::*;
    use crate::formula::{exists, forall, forall_bind, neg, smt_eq, smt_ne, Variable};
    use crate::grammar::assignment_grammar;
    use crate::parse::parse_into;
    use crate::predicate::before;
    use crate::smt::{FallbackSolver, StringTerm};

    struct Fixture {
        arena: TreeArena,
        grammar: Grammar,
        predicates: Predicates,
        smt: FallbackSolver,
        root: NodeId,
        env: Env,
    }

    fn fixture(input: &str) -> Fixture {
        let grammar = assignment_grammar();
        let mut arena = TreeArena::new();
        let root = parse_into(&mut arena, &grammar, "start", input).unwrap();
        let env = Env::from([(Rc::from("start"), root)]);
        Fixture {
            arena,
            grammar,
            predicates: Predicates::core(),
            smt: FallbackSolver::default(),
            root,
            env,
        }
    }

    impl Fixture {
        fn eval(&self, formula: &Formula) -> bool {
            evaluate(
                &self.arena,
                &self.grammar,
                self.root,
                formula,
                &self.env,
                &self.predicates,
                &self.smt,
            )
        }
    }

    fn top() -> Variable {
        Variable::new("start", "start")
    }

    #[test]
    fn test_forall_all_equal() {
        let v = Variable::new("v", "var");
        let formula = forall(
            v.clone(),
            top(),
            smt_eq(StringTerm::var(&v), StringTerm::lit("x")),
        );

        let f = fixture("x := x");
        assert!(f.eval(&formula));

        let f = fixture("x := y");
        assert!(!f.eval(&formula));
    }

    #[test]
    fn test_forall_vacuous() {
        let f = fixture("x := 1");
        let d = Variable::new("d", "digit");
        let v2 = Variable::new("v2", "var");
        // Every <digit> subtree contains zero <var> nodes, so the inner
        // quantifier is vacuously true no matter how absurd its body.
        let absurd = forall(
            v2.clone(),
            d.clone(),
            smt_eq(StringTerm::var(&v2), StringTerm::lit("never")),
        );
        let formula = forall(d, top(), absurd);
        assert!(f.eval(&formula));
    }

    #[test]
    fn test_exists_requires_witness() {
        let f = fixture("x := 1");
        let v = Variable::new("v", "var");
        let formula = exists(
            v.clone(),
            top(),
            smt_eq(StringTerm::var(&v), StringTerm::lit("y")),
        );
        assert!(!f.eval(&formula));

        let formula = exists(
            v.clone(),
            top(),
            smt_eq(StringTerm::var(&v), StringTerm::lit("x")),
        );
        assert!(f.eval(&formula));
    }

    #[test]
    fn test_pattern_bindings() {
        let f = fixture("x := 1 ; y := 2");
        let a = Variable::new("a", "assgn");
        let lhs = Variable::new("lhs", "var");
        let pattern = MatchPattern::parse("{<var> lhs} := {<rhs> r}").unwrap();
        let formula = forall_bind(
            pattern,
            a,
            top(),
            smt_ne(StringTerm::var(&lhs), StringTerm::lit("z")),
        );
        assert!(f.eval(&formula));
    }

    #[test]
    fn test_structural_before() {
        let f = fixture("x := 1 ; y := x");
        let a1 = Variable::new("a1", "assgn");
        let a2 = Variable::new("a2", "assgn");
        // exists a1: exists a2: a1 before a2
        let formula = exists(
            a1.clone(),
            top(),
            exists(a2.clone(), top(), before(a1.clone(), a2.clone())),
        );
        assert!(f.eval(&formula));

        // forall a1: forall a2: a1 before a2 fails (the a2 = a1 case).
        let formula = forall(
            a1.clone(),
            top(),
            forall(a2.clone(), top(), before(a1, a2)),
        );
        assert!(!f.eval(&formula));
    }

    #[test]
    fn test_negation() {
        let f = fixture("x := 1");
        let v = Variable::new("v", "var");
        let formula = neg(exists(
            v.clone(),
            top(),
            smt_eq(StringTerm::var(&v), StringTerm::lit("y")),
        ));
        assert!(f.eval(&formula));
    }

    #[test]
    fn test_evaluation_is_repeatable() {
        let f = fixture("x := 1 ; y := x");
        let v = Variable::new("v", "var");
        let formula = exists(
            v.clone(),
            top(),
            smt_eq(StringTerm::var(&v), StringTerm::lit("y")),
        );
        let first = f.eval(&formula);
        for _ in 0..5 {
            assert_eq!(f.eval(&formula), first);
        }
    }

    #[test]
    #[should_panic(expected = "open leaves")]
    fn test_rejects_open_tree() {
        let grammar = assignment_grammar();
        let mut arena = TreeArena::new();
        let root = arena.open("start");
        let env = Env::from([(Rc::from("start"), root)]);
        let v = Variable::new("v", "var");
        let formula = exists(
            v.clone(),
            top(),
            smt_eq(StringTerm::var(&v), StringTerm::lit("x")),
        );
        evaluate(
            &arena,
            &grammar,
            root,
            &formula,
            &env,
            &Predicates::core(),
            &FallbackSolver::default(),
        );
    }
}
