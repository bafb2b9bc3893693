//! # gramsat: grammar-based input generation under constraints
//!
//! **`gramsat`** generates strings that are *syntactically* valid under a
//! context-free grammar and *semantically* valid under a constraint formula.
//! It is designed for test input generation, grammar-based fuzzing with
//! semantic guarantees, and exploring the inputs of parsers and interpreters.
//!
//! ## What is a constrained input?
//!
//! A grammar alone describes *shape*: `x := y` is a perfectly shaped
//! assignment even if `y` was never assigned. A constraint formula adds
//! *meaning*: quantifiers range over subtrees of the derivation tree,
//! string atoms relate their rendered values, and structural predicates
//! relate their positions. The solver searches for derivation trees that
//! satisfy both at once.
//!
//! ## Key Features
//!
//! - **Persistent trees**: all derivation trees live in a
//!   [`TreeArena`][crate::tree::TreeArena]; edits return new roots that
//!   share every untouched subtree, so search states are cheap snapshots.
//! - **Closed formula model**: quantifiers, connectives, SMT atoms and
//!   predicate atoms as a tagged enum, validated fail-fast against an
//!   explicit predicate signature, never a global registry.
//! - **Constructive existentials**: `exists` obligations are discharged by
//!   *grafting* a synthesized subtree into the tree when no match exists.
//! - **Pluggable string solving**: an external SMT-LIB 2 process
//!   ([`TextSolver`][crate::smtlib::TextSolver]) or the builtin
//!   equality-fragment fallback ([`FallbackSolver`][crate::smt::FallbackSolver]).
//! - **Deterministic search**: the priority queue orders by cost with a
//!   monotone tie-break; identical inputs reproduce identical solution
//!   sequences.
//!
//! ## Basic Usage
//!
//! ```rust
//! use gramsat::formula::{forall, smt_eq, Variable};
//! use gramsat::grammar::Grammar;
//! use gramsat::smt::StringTerm;
//! use gramsat::solver::{top_constant, Solver, SolverConfig};
//!
//! let grammar = Grammar::new(
//!     "start",
//!     [
//!         ("start", vec!["<stmt>"]),
//!         ("stmt", vec!["<assgn>", "<assgn> ; <stmt>"]),
//!         ("assgn", vec!["<var> := <rhs>"]),
//!         ("rhs", vec!["<var>", "<digit>"]),
//!         ("var", vec!["x", "y", "z"]),
//!         ("digit", vec!["0", "1", "2"]),
//!     ],
//! )
//! .unwrap();
//!
//! // forall <var> v in start: v == "x"
//! let v = Variable::new("v", "var");
//! let formula = forall(
//!     v.clone(),
//!     top_constant(&grammar),
//!     smt_eq(StringTerm::var(&v), StringTerm::lit("x")),
//! );
//!
//! let mut solver = Solver::new(grammar, formula, SolverConfig::default()).unwrap();
//! let solution = solver.next_solution().unwrap();
//! assert!(solution.text.contains('x'));
//! ```
//!
//! ## Core Components
//!
//! - **[`grammar`]**: the context-free grammar model.
//! - **[`tree`]**: arena-backed persistent derivation trees.
//! - **[`formula`]** / **[`pattern`]** / **[`predicate`]**: the constraint
//!   language: quantifiers, match expressions, predicate signatures.
//! - **[`eval`]**: the pure satisfaction evaluator.
//! - **[`solver`]**: the priority-queue search engine.
//! - **[`smt`]** / **[`smtlib`]**: the string-solver boundary.
//! - **[`parse`]** / **[`expand`]**: the reference parser and default
//!   expansion used to close unconstrained positions.

pub mod error;
pub mod eval;
pub mod expand;
pub mod formula;
pub mod grammar;
pub mod parse;
pub mod pattern;
pub mod predicate;
pub mod smt;
pub mod smtlib;
pub mod solver;
pub mod tree;
