//! Default ("free") expansion of unconstrained open leaves.
//!
//! When no formula obligation constrains an open leaf, the search engine
//! closes it with a default policy, capped per solution by
//! `max_free_instantiations`. Both policies are deterministic; the counter
//! behind [`ExpansionPolicy::RoundRobin`] lives in the [`Expander`], not in
//! any global state, so identically configured runs repeat exactly.

use std::collections::HashMap;
use std::rc::Rc;

use log::trace;

use crate::grammar::Grammar;
use crate::tree::{NodeId, TreeArena};

/// How to pick an alternative for an unconstrained open leaf.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Default)]
pub enum ExpansionPolicy {
    /// Always the alternative with the smallest complete tree.
    #[default]
    ShortestFirst,
    /// Cycle through the alternatives of each nonterminal in turn; yields
    /// more varied fillers while staying deterministic.
    RoundRobin,
}

/// Stateful alternative chooser.
#[derive(Debug, Default)]
pub struct Expander {
    policy: ExpansionPolicy,
    counters: HashMap<Rc<str>, usize>,
}

impl Expander {
    pub fn new(policy: ExpansionPolicy) -> Self {
        Self {
            policy,
            counters: HashMap::new(),
        }
    }

    /// Pick an alternative index for the nonterminal `name`.
    pub fn choose(&mut self, grammar: &Grammar, name: &str) -> usize {
        let total = grammar.alternatives(name).len();
        assert!(total > 0, "nonterminal <{}> has no alternatives", name);
        let choice = match self.policy {
            ExpansionPolicy::ShortestFirst => grammar.cheapest_alternative(name),
            ExpansionPolicy::RoundRobin => {
                let counter = self.counters.entry(Rc::from(name)).or_insert(0);
                let choice = *counter % total;
                *counter += 1;
                choice
            }
        };
        trace!("expand <{}> with alternative {}", name, choice);
        choice
    }

    /// Close every open leaf below `root`, spending at most `budget`
    /// expansions. Returns the closed root and the number of expansions
    /// used, or `None` when the budget runs out first (a recoverable dead
    /// end for the caller, not an error).
    pub fn close_all(
        &mut self,
        arena: &mut TreeArena,
        grammar: &Grammar,
        root: NodeId,
        budget: usize,
    ) -> Option<(NodeId, usize)> {
        let mut root = root;
        let mut used = 0;
        loop {
            let open = arena.open_leaves(root);
            let Some((path, leaf)) = open.into_iter().next() else {
                return Some((root, used));
            };
            if used == budget {
                trace!("expansion budget exhausted at {}", leaf);
                return None;
            }
            let name = arena.symbol(leaf).text().to_string();
            let alt = self.choose(grammar, &name);
            let (new_root, _) = arena.expand(root, &path, grammar, alt);
            root = new_root;
            used += 1;
        }
    }
}

/// Up to `cap` distinct strings derivable from `sort`: one per top-level
/// alternative, each closed shortest-first. Used to seed the fallback
/// string solver with values that are actually in the sort's language.
pub fn sample_strings(grammar: &Grammar, sort: &str, cap: usize) -> Vec<String> {
    let mut out = Vec::new();
    for alt in 0..grammar.alternatives(sort).len() {
        if out.len() >= cap {
            break;
        }
        let mut arena = TreeArena::new();
        let mut expander = Expander::new(ExpansionPolicy::ShortestFirst);
        let root = arena.open(sort);
        let (root, _) = arena.expand(root, &[], grammar, alt);
        let Some((root, _)) = expander.close_all(&mut arena, grammar, root, 256) else {
            continue;
        };
        let text = arena.render(root);
        if !out.contains(&text) {
            out.push(text);
        }
    }
    out
}

#[cfg(test)]
mod tests {
    use test_log::test;

    use super::*;
    use crate::grammar::assignment_grammar;

    #[test]
    fn test_sample_strings() {
        let grammar = assignment_grammar();
        assert_eq!(sample_strings(&grammar, "var", 8), vec!["x", "y", "z"]);
        assert_eq!(sample_strings(&grammar, "rhs", 8), vec!["x", "0"]);
        assert_eq!(sample_strings(&grammar, "var", 2).len(), 2);
    }

    #[test]
    fn test_shortest_first_closes_minimally() {
        let grammar = assignment_grammar();
        let mut arena = TreeArena::new();
        let mut expander = Expander::new(ExpansionPolicy::ShortestFirst);

        let root = arena.open("start");
        let (root, used) = expander
            .close_all(&mut arena, &grammar, root, 100)
            .unwrap();
        assert!(arena.is_complete(root));
        // start, stmt, assgn, var, rhs, rhs-child: six expansions.
        assert_eq!(used, 6);
        assert_eq!(arena.render(root), "x := x");
    }

    #[test]
    fn test_round_robin_varies() {
        let grammar = assignment_grammar();
        let mut expander = Expander::new(ExpansionPolicy::RoundRobin);
        let choices: Vec<usize> = (0..4).map(|_| expander.choose(&grammar, "rhs")).collect();
        assert_eq!(choices, vec![0, 1, 0, 1]);
    }

    #[test]
    fn test_budget_is_a_dead_end() {
        let grammar = assignment_grammar();
        let mut arena = TreeArena::new();
        let mut expander = Expander::new(ExpansionPolicy::ShortestFirst);

        let root = arena.open("start");
        assert!(expander.close_all(&mut arena, &grammar, root, 2).is_none());
    }

    #[test]
    fn test_deterministic_repetition() {
        let grammar = assignment_grammar();
        let render = |policy| {
            let mut arena = TreeArena::new();
            let mut expander = Expander::new(policy);
            let root = arena.open("start");
            let (root, _) = expander
                .close_all(&mut arena, &grammar, root, 100)
                .unwrap();
            arena.render(root)
        };
        assert_eq!(
            render(ExpansionPolicy::RoundRobin),
            render(ExpansionPolicy::RoundRobin)
        );
    }
}
