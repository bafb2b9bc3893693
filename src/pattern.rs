//! Match expressions: concrete-syntax fragments with embedded holes.
//!
//! A pattern like `"{<var> lhs} := {<rhs> rhs}"` both *selects* which
//! subtrees a quantifier ranges over (only subtrees whose expansion unifies
//! with the pattern) and *binds* the named holes to the matched positions.
//! A bare `<nonterminal>` is an anonymous hole: it must unify but binds
//! nothing.
//!
//! Unification is greedy left-to-right over the target node's expansion,
//! descending into closed nonterminal children when an element does not
//! match them directly. This is deliberately simpler than a backtracking
//! matcher; patterns whose holes align with grammar alternatives (the
//! supported shape, see `tree_prefix`) never need to backtrack.

use std::collections::VecDeque;
use std::fmt::{Display, Formatter};
use std::rc::Rc;

use log::trace;

use crate::error::FormulaError;
use crate::grammar::{Grammar, Symbol};
use crate::tree::{Children, NodeId, Path, TreeArena};

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PatternElem {
    /// Literal text that must be covered by terminal leaves.
    Literal(Rc<str>),
    /// A nonterminal hole; named holes bind the matched node.
    Hole {
        name: Option<Rc<str>>,
        sort: Rc<str>,
    },
}

/// A parsed match expression.
#[derive(Debug, Clone)]
pub struct MatchPattern {
    elems: Vec<PatternElem>,
    source: String,
}

impl MatchPattern {
    /// Parse the concrete syntax: `{<sort> name}` is a named hole,
    /// `<sort>` an anonymous hole, everything else literal text.
    ///
    /// # Examples
    ///
    /// ```
    /// use gramsat::pattern::MatchPattern;
    ///
    /// let pattern = MatchPattern::parse("{<var> lhs} := {<rhs> rhs}").unwrap();
    /// assert_eq!(pattern.holes().count(), 2);
    /// ```
    pub fn parse(text: &str) -> Result<Self, FormulaError> {
        let malformed = |reason: &str| FormulaError::MalformedPattern {
            source_text: text.to_string(),
            reason: reason.to_string(),
        };

        let mut elems = Vec::new();
        let mut rest = text;
        while !rest.is_empty() {
            let split = rest
                .char_indices()
                .find(|&(_, c)| c == '{' || c == '<')
                .map(|(i, c)| (i, c));
            match split {
                None => {
                    elems.push(PatternElem::Literal(Rc::from(rest)));
                    rest = "";
                }
                Some((at, open)) => {
                    if at > 0 {
                        elems.push(PatternElem::Literal(Rc::from(&rest[..at])));
                    }
                    rest = &rest[at..];
                    if open == '{' {
                        let close = rest
                            .find('}')
                            .ok_or_else(|| malformed("unterminated '{'"))?;
                        let inner = rest[1..close].trim();
                        let (sort, name) = inner
                            .split_once(char::is_whitespace)
                            .ok_or_else(|| malformed("expected '{<sort> name}'"))?;
                        let sort = sort
                            .strip_prefix('<')
                            .and_then(|s| s.strip_suffix('>'))
                            .ok_or_else(|| malformed("hole sort must be '<...>'"))?;
                        let name = name.trim();
                        if sort.is_empty() || name.is_empty() {
                            return Err(malformed("empty hole sort or name"));
                        }
                        elems.push(PatternElem::Hole {
                            name: Some(Rc::from(name)),
                            sort: Rc::from(sort),
                        });
                        rest = &rest[close + 1..];
                    } else {
                        let close = rest
                            .find('>')
                            .ok_or_else(|| malformed("unterminated '<'"))?;
                        let sort = &rest[1..close];
                        if sort.is_empty() {
                            return Err(malformed("empty anonymous hole"));
                        }
                        elems.push(PatternElem::Hole {
                            name: None,
                            sort: Rc::from(sort),
                        });
                        rest = &rest[close + 1..];
                    }
                }
            }
        }
        Ok(Self {
            elems,
            source: text.to_string(),
        })
    }

    pub fn elems(&self) -> &[PatternElem] {
        &self.elems
    }

    /// The named holes, in order of occurrence, as `(name, sort)` pairs.
    pub fn holes(&self) -> impl Iterator<Item = (&Rc<str>, &Rc<str>)> {
        self.elems.iter().filter_map(|elem| match elem {
            PatternElem::Hole {
                name: Some(name),
                sort,
            } => Some((name, sort)),
            _ => None,
        })
    }

    /// Unify the pattern against the expansion of `node`. Returns the
    /// bindings of the named holes, or `None` if unification fails (an
    /// unexpanded node never unifies).
    pub fn match_at(
        &self,
        arena: &TreeArena,
        node: NodeId,
    ) -> Option<Vec<(Rc<str>, NodeId)>> {
        let children = match arena.children(node) {
            Children::Inner(children) => children.clone(),
            _ => return None,
        };
        let mut bindings = Vec::new();
        let matched = match_seq(
            arena,
            children.into_iter().collect(),
            &self.elems,
            &mut bindings,
        );
        trace!(
            "match {:?} at {} -> {}",
            self.source,
            node,
            if matched { "ok" } else { "fail" }
        );
        matched.then_some(bindings)
    }

    /// Synthesize the minimal open tree of `sort` realizing the pattern.
    ///
    /// Holes must align with same-sort (or derivable-sort) nonterminal
    /// symbols of one alternative of `sort`, and literals must textually
    /// cover the terminal symbols; the first aligning alternative wins.
    /// Returns the new subtree and the paths of the named holes below it.
    pub fn tree_prefix(
        &self,
        arena: &mut TreeArena,
        grammar: &Grammar,
        sort: &str,
    ) -> Option<(NodeId, Vec<(Rc<str>, Path)>)> {
        'alternatives: for alternative in grammar.alternatives(sort) {
            #[derive(Debug)]
            enum Plan<'p> {
                Terminal(Rc<str>),
                Hole(&'p PatternElem, Rc<str>),
            }

            let mut plans: Vec<Plan> = Vec::with_capacity(alternative.symbols.len());
            let mut elems = self.elems.iter();
            let mut pending: &str = "";
            for symbol in &alternative.symbols {
                match symbol {
                    Symbol::Terminal(text) => {
                        if pending.is_empty() {
                            match elems.next() {
                                Some(PatternElem::Literal(lit)) => pending = lit.as_ref(),
                                _ => continue 'alternatives,
                            }
                        }
                        if let Some(stripped) = pending.strip_prefix(text.as_ref()) {
                            pending = stripped;
                            plans.push(Plan::Terminal(Rc::clone(text)));
                        } else {
                            continue 'alternatives;
                        }
                    }
                    Symbol::Nonterminal(name) => {
                        if !pending.is_empty() {
                            continue 'alternatives;
                        }
                        match elems.next() {
                            Some(elem @ PatternElem::Hole { sort: hole, .. }) => {
                                if hole == name || grammar.derives(name, hole) {
                                    plans.push(Plan::Hole(elem, Rc::clone(name)));
                                } else {
                                    continue 'alternatives;
                                }
                            }
                            _ => continue 'alternatives,
                        }
                    }
                }
            }
            if !pending.is_empty() || elems.next().is_some() {
                continue 'alternatives;
            }

            // The alternative aligns; build the subtree.
            let mut children = Vec::with_capacity(plans.len());
            let mut holes: Vec<(Rc<str>, Path)> = Vec::new();
            for (i, plan) in plans.into_iter().enumerate() {
                match plan {
                    Plan::Terminal(text) => children.push(arena.leaf(&text)),
                    Plan::Hole(elem, symbol_name) => {
                        let (name, hole_sort) = match elem {
                            PatternElem::Hole { name, sort } => (name.clone(), Rc::clone(sort)),
                            PatternElem::Literal(_) => unreachable!(),
                        };
                        let bottom = arena.open(&hole_sort);
                        let child = if hole_sort == symbol_name {
                            bottom
                        } else {
                            arena.materialize_chain(grammar, &symbol_name, &hole_sort, bottom)?
                        };
                        if let Some(name) = name {
                            let mut path = vec![i];
                            path.extend(arena.path_of(child, bottom).unwrap_or_default());
                            holes.push((name, path));
                        }
                        children.push(child);
                    }
                }
            }
            let root = arena.inner(sort, children);
            return Some((root, holes));
        }
        None
    }
}

impl Display for MatchPattern {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.source)
    }
}

/// Greedy left-to-right unification of pattern elements against a node
/// sequence, splicing closed nonterminal expansions in place as needed.
fn match_seq(
    arena: &TreeArena,
    mut nodes: VecDeque<NodeId>,
    elems: &[PatternElem],
    bindings: &mut Vec<(Rc<str>, NodeId)>,
) -> bool {
    let Some(elem) = elems.first() else {
        // Trailing nodes may only carry empty text.
        return nodes
            .iter()
            .all(|&id| arena.is_complete(id) && arena.render(id).is_empty());
    };

    match elem {
        PatternElem::Hole { name, sort } => loop {
            let Some(&front) = nodes.front() else {
                return false;
            };
            match (arena.symbol(front), arena.children(front)) {
                (Symbol::Nonterminal(symbol), _) if symbol == sort => {
                    nodes.pop_front();
                    if let Some(name) = name {
                        bindings.push((Rc::clone(name), front));
                    }
                    return match_seq(arena, nodes, &elems[1..], bindings);
                }
                (_, Children::Inner(children)) => {
                    // Descend: replace the node by its expansion.
                    nodes.pop_front();
                    for &child in children.iter().rev() {
                        nodes.push_front(child);
                    }
                }
                (Symbol::Terminal(text), Children::Leaf) if text.is_empty() => {
                    nodes.pop_front();
                }
                _ => return false,
            }
        },
        PatternElem::Literal(text) => {
            let mut remaining: &str = text;
            loop {
                if remaining.is_empty() {
                    return match_seq(arena, nodes, &elems[1..], bindings);
                }
                let Some(&front) = nodes.front() else {
                    return false;
                };
                match (arena.symbol(front), arena.children(front)) {
                    (Symbol::Terminal(leaf), Children::Leaf) => {
                        if leaf.is_empty() {
                            nodes.pop_front();
                        } else if let Some(stripped) = remaining.strip_prefix(leaf.as_ref()) {
                            remaining = stripped;
                            nodes.pop_front();
                        } else {
                            return false;
                        }
                    }
                    (_, Children::Inner(children)) => {
                        nodes.pop_front();
                        for &child in children.iter().rev() {
                            nodes.push_front(child);
                        }
                    }
                    _ => return false,
                }
            }
        }
    }
}
