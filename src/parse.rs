//! Reference parser: strings back into derivation trees.
//!
//! The search engine needs this to *admit* values returned by the string
//! solver: a model value is only usable for a variable of sort `<A>` if it
//! is derivable from `<A>`. Tests and demos use it to build closed trees
//! from concrete inputs.
//!
//! Plain recursive descent with backtracking across alternatives, tried in
//! definition order; the root parse must consume the whole input. A depth
//! guard rejects runaway (left-recursive) derivations instead of looping.

use crate::grammar::{Grammar, Symbol};
use crate::tree::{NodeId, TreeArena};

/// Candidate cap per nonterminal position; keeps pathological grammars from
/// exploding the backtracking frontier.
const MAX_CANDIDATES: usize = 64;

#[derive(Debug, Clone)]
enum ParseNode {
    Terminal(String),
    Nonterminal(String, Vec<ParseNode>),
}

/// Parse `input` as the nonterminal `sort` and intern the resulting closed
/// tree into `arena`. Returns `None` if `input` is not derivable.
pub fn parse_into(
    arena: &mut TreeArena,
    grammar: &Grammar,
    sort: &str,
    input: &str,
) -> Option<NodeId> {
    let tree = parse_tree(grammar, sort, input)?;
    Some(intern(arena, &tree))
}

/// True iff `input` is derivable from `sort`.
pub fn is_derivable(grammar: &Grammar, sort: &str, input: &str) -> bool {
    parse_tree(grammar, sort, input).is_some()
}

fn parse_tree(grammar: &Grammar, sort: &str, input: &str) -> Option<ParseNode> {
    if !grammar.contains(sort) {
        return None;
    }
    let depth_limit = input.len() + 64;
    parse_nonterminal(grammar, sort, input, 0, depth_limit)
        .into_iter()
        .find(|(_, end)| *end == input.len())
        .map(|(node, _)| node)
}

/// All ways (up to [`MAX_CANDIDATES`]) to parse a prefix of `input[start..]`
/// as `sort`, as `(tree, end offset)` pairs in alternative order.
fn parse_nonterminal(
    grammar: &Grammar,
    sort: &str,
    input: &str,
    start: usize,
    depth: usize,
) -> Vec<(ParseNode, usize)> {
    if depth == 0 {
        return Vec::new();
    }
    let mut candidates = Vec::new();
    for alternative in grammar.alternatives(sort) {
        let mut partials: Vec<(Vec<ParseNode>, usize)> = vec![(Vec::new(), start)];
        for symbol in &alternative.symbols {
            let mut next: Vec<(Vec<ParseNode>, usize)> = Vec::new();
            for (children, at) in partials {
                match symbol {
                    Symbol::Terminal(text) => {
                        if input[at..].starts_with(text.as_ref()) {
                            let mut children = children;
                            children.push(ParseNode::Terminal(text.to_string()));
                            next.push((children, at + text.len()));
                        }
                    }
                    Symbol::Nonterminal(child) => {
                        for (node, end) in
                            parse_nonterminal(grammar, child, input, at, depth - 1)
                        {
                            let mut children = children.clone();
                            children.push(node);
                            next.push((children, end));
                            if next.len() >= MAX_CANDIDATES {
                                break;
                            }
                        }
                    }
                }
            }
            partials = next;
            if partials.is_empty() {
                break;
            }
        }
        for (children, end) in partials {
            candidates.push((ParseNode::Nonterminal(sort.to_string(), children), end));
            if candidates.len() >= MAX_CANDIDATES {
                return candidates;
            }
        }
    }
    candidates
}

fn intern(arena: &mut TreeArena, node: &ParseNode) -> NodeId {
    match node {
        ParseNode::Terminal(text) => arena.leaf(text),
        ParseNode::Nonterminal(name, children) => {
            let children = children.iter().map(|child| intern(arena, child)).collect();
            arena.inner(name, children)
        }
    }
}
