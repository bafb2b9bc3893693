//! Predicate signatures and the builtin predicate library.
//!
//! Predicates are dispatched through an explicit [`Predicates`] table that
//! the caller passes to validation, evaluation and solving; there is no
//! global registry. Structural predicates are pure relations over node
//! *positions*; semantic predicates see rendered values and may answer with
//! a requested tree edit ([`SemPredResult::Bind`]), which only the search
//! engine acts upon (pure evaluation treats it as not-satisfied).

use std::collections::BTreeMap;
use std::rc::Rc;

use crate::formula::{semantic, structural, Formula, SemArg, Variable};
use crate::grammar::Grammar;
use crate::tree::{path_before, NodeId, Path, TreeArena};

/// Evaluation callback of a structural predicate: the context root and the
/// argument paths below it.
pub type StructuralFn = Rc<dyn Fn(&TreeArena, NodeId, &[Path]) -> bool>;

pub struct StructuralPredicate {
    pub name: Rc<str>,
    pub arity: usize,
    eval: StructuralFn,
}

impl StructuralPredicate {
    pub fn new(name: &str, arity: usize, eval: StructuralFn) -> Self {
        Self {
            name: Rc::from(name),
            arity,
            eval,
        }
    }

    pub fn evaluate(&self, arena: &TreeArena, root: NodeId, paths: &[Path]) -> bool {
        assert_eq!(paths.len(), self.arity, "arity mismatch for '{}'", self.name);
        (self.eval)(arena, root, paths)
    }
}

impl std::fmt::Debug for StructuralPredicate {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StructuralPredicate")
            .field("name", &self.name)
            .field("arity", &self.arity)
            .finish()
    }
}

/// An instantiated semantic predicate argument.
#[derive(Debug, Clone)]
pub enum SemInst {
    Node(NodeId),
    Text(Rc<str>),
}

/// Verdict of a semantic predicate.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SemPredResult {
    True,
    False,
    /// Not decidable yet (e.g. relevant regions still open).
    NotReady,
    /// Satisfiable by replacing `node` with the parse of `value`; only the
    /// search engine applies this.
    Bind { node: NodeId, value: String },
}

/// Evaluation callback of a semantic predicate.
pub type SemanticFn = Rc<dyn Fn(&TreeArena, &Grammar, &[SemInst]) -> SemPredResult>;

pub struct SemanticPredicate {
    pub name: Rc<str>,
    pub arity: usize,
    eval: SemanticFn,
}

impl SemanticPredicate {
    pub fn new(name: &str, arity: usize, eval: SemanticFn) -> Self {
        Self {
            name: Rc::from(name),
            arity,
            eval,
        }
    }

    pub fn evaluate(&self, arena: &TreeArena, grammar: &Grammar, args: &[SemInst]) -> SemPredResult {
        assert_eq!(args.len(), self.arity, "arity mismatch for '{}'", self.name);
        (self.eval)(arena, grammar, args)
    }
}

impl std::fmt::Debug for SemanticPredicate {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SemanticPredicate")
            .field("name", &self.name)
            .field("arity", &self.arity)
            .finish()
    }
}

/// The predicate signature table supplied to the evaluator and the solver.
#[derive(Debug, Default)]
pub struct Predicates {
    structural: BTreeMap<Rc<str>, StructuralPredicate>,
    semantic: BTreeMap<Rc<str>, SemanticPredicate>,
}

impl Predicates {
    /// An empty signature.
    pub fn new() -> Self {
        Self::default()
    }

    /// The builtin library: `before`, `after`, `count`.
    pub fn core() -> Self {
        let mut predicates = Self::new();
        predicates.register_structural(StructuralPredicate::new(
            "before",
            2,
            Rc::new(|_, _, paths| path_before(&paths[0], &paths[1])),
        ));
        predicates.register_structural(StructuralPredicate::new(
            "after",
            2,
            Rc::new(|_, _, paths| path_before(&paths[1], &paths[0])),
        ));
        predicates.register_semantic(SemanticPredicate::new("count", 3, Rc::new(eval_count)));
        predicates
    }

    pub fn register_structural(&mut self, predicate: StructuralPredicate) {
        self.structural.insert(Rc::clone(&predicate.name), predicate);
    }

    pub fn register_semantic(&mut self, predicate: SemanticPredicate) {
        self.semantic.insert(Rc::clone(&predicate.name), predicate);
    }

    pub fn structural(&self, name: &str) -> Option<&StructuralPredicate> {
        self.structural.get(name)
    }

    pub fn semantic(&self, name: &str) -> Option<&SemanticPredicate> {
        self.semantic.get(name)
    }
}

/// `count(tree, needle, num)`: the number of `<needle>` nodes below `tree`
/// equals `num`. When `num` is still an open leaf, answers with a binding
/// instead.
fn eval_count(arena: &TreeArena, grammar: &Grammar, args: &[SemInst]) -> SemPredResult {
    let SemInst::Node(tree) = args[0] else {
        return SemPredResult::False;
    };
    let needle: &str = match &args[1] {
        SemInst::Text(text) => text,
        SemInst::Node(_) => return SemPredResult::False,
    };
    let needle = needle.trim_start_matches('<').trim_end_matches('>');

    // More needle nodes may still appear below an open leaf that derives
    // the needle sort.
    for (_, leaf) in arena.open_leaves(tree) {
        if grammar.derives(arena.symbol(leaf).text(), needle) {
            return SemPredResult::NotReady;
        }
    }
    let actual = arena.subtrees_with_sort(tree, needle).len();

    match &args[2] {
        SemInst::Text(text) => match text.trim().parse::<usize>() {
            Ok(expected) => boolean(actual == expected),
            Err(_) => SemPredResult::False,
        },
        SemInst::Node(num) => {
            if arena.is_open_leaf(*num) {
                return SemPredResult::Bind {
                    node: *num,
                    value: actual.to_string(),
                };
            }
            if !arena.is_complete(*num) {
                return SemPredResult::NotReady;
            }
            match arena.render(*num).trim().parse::<usize>() {
                Ok(expected) => boolean(actual == expected),
                Err(_) => SemPredResult::False,
            }
        }
    }
}

fn boolean(value: bool) -> SemPredResult {
    if value {
        SemPredResult::True
    } else {
        SemPredResult::False
    }
}

// ---------------------------------------------------------------------------
// Formula shortcuts for the builtin predicates.

/// `before(first, second)`: `first` occurs strictly left of `second`.
pub fn before(first: Variable, second: Variable) -> Formula {
    structural("before", [first, second])
}

/// `after(first, second)`: `first` occurs strictly right of `second`.
pub fn after(first: Variable, second: Variable) -> Formula {
    structural("after", [first, second])
}

/// `count(tree, needle, num)` over the builtin semantic predicate.
pub fn count(tree: Variable, needle: &str, num: SemArg) -> Formula {
    semantic(
        "count",
        [SemArg::Var(tree), SemArg::Text(Rc::from(needle)), num],
    )
}

#[cfg(test)]
mod tests {
    use test_log::test;

    use super::*;
    use crate::grammar::assignment_grammar;
    use crate::parse::parse_into;

    #[test]
    fn test_before_after() {
        let predicates = Predicates::core();
        let grammar = assignment_grammar();
        let mut arena = TreeArena::new();
        let root = parse_into(&mut arena, &grammar, "start", "x := 1 ; y := x").unwrap();

        let assgns = arena.subtrees_with_sort(root, "assgn");
        assert_eq!(assgns.len(), 2);
        let first = assgns[0].0.clone();
        let second = assgns[1].0.clone();

        let before = predicates.structural("before").unwrap();
        assert!(before.evaluate(&arena, root, &[first.clone(), second.clone()]));
        assert!(!before.evaluate(&arena, root, &[second.clone(), first.clone()]));

        let after = predicates.structural("after").unwrap();
        assert!(after.evaluate(&arena, root, &[second, first]));
    }

    #[test]
    fn test_count_complete() {
        let predicates = Predicates::core();
        let grammar = assignment_grammar();
        let mut arena = TreeArena::new();
        let root = parse_into(&mut arena, &grammar, "start", "x := 1 ; y := x").unwrap();

        let count = predicates.semantic("count").unwrap();
        let args = [
            SemInst::Node(root),
            SemInst::Text(Rc::from("assgn")),
            SemInst::Text(Rc::from("2")),
        ];
        assert_eq!(count.evaluate(&arena, &grammar, &args), SemPredResult::True);

        let args = [
            SemInst::Node(root),
            SemInst::Text(Rc::from("assgn")),
            SemInst::Text(Rc::from("3")),
        ];
        assert_eq!(count.evaluate(&arena, &grammar, &args), SemPredResult::False);
    }

    #[test]
    fn test_count_not_ready() {
        let predicates = Predicates::core();
        let grammar = assignment_grammar();
        let mut arena = TreeArena::new();

        // An open <stmt> can still grow more assignments.
        let root = arena.open("stmt");
        let count = predicates.semantic("count").unwrap();
        let args = [
            SemInst::Node(root),
            SemInst::Text(Rc::from("assgn")),
            SemInst::Text(Rc::from("1")),
        ];
        assert_eq!(
            count.evaluate(&arena, &grammar, &args),
            SemPredResult::NotReady
        );
    }

    #[test]
    fn test_count_binds_open_num() {
        let predicates = Predicates::core();
        let grammar = assignment_grammar();
        let mut arena = TreeArena::new();
        let root = parse_into(&mut arena, &grammar, "start", "x := 1").unwrap();
        let num = arena.open("digit");

        let count = predicates.semantic("count").unwrap();
        let args = [
            SemInst::Node(root),
            SemInst::Text(Rc::from("assgn")),
            SemInst::Node(num),
        ];
        assert_eq!(
            count.evaluate(&arena, &grammar, &args),
            SemPredResult::Bind {
                node: num,
                value: "1".to_string(),
            }
        );
    }
}
