//! Arena-backed persistent derivation trees.
//!
//! All nodes live in a [`TreeArena`] and are addressed by lightweight
//! [`NodeId`] handles. Nodes are immutable once allocated; "mutating"
//! operations ([`TreeArena::expand`], [`TreeArena::replace`]) allocate a new
//! spine from the changed position up to the root and return the new root,
//! structurally sharing every untouched subtree with the old version. The
//! arena is append-only: old tree versions stay valid, which is what lets
//! search states share subtrees without bookkeeping.
//!
//! Besides its arena index, every node carries a stable `ident`. Spine
//! nodes keep their ident when re-allocated, and an expanded leaf passes
//! its ident to the expansion root, so identity-based bookkeeping (e.g.
//! which subtrees a universal quantifier has already matched) survives
//! tree edits. The ident counter is owned by the arena, never global.

use std::fmt::{Display, Formatter};
use std::rc::Rc;

use crate::grammar::{Alternative, Grammar, Symbol};

/// Index of a node in a [`TreeArena`].
#[derive(Debug, Copy, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct NodeId(u32);

impl NodeId {
    pub const fn index(self) -> usize {
        self.0 as usize
    }
}

impl Display for NodeId {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "@{}", self.0)
    }
}

/// A path from a root to a node: the sequence of child indices.
pub type Path = Vec<usize>;

/// The expansion state of a node.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Children {
    /// An unexpanded nonterminal leaf.
    Open,
    /// A closed leaf: a terminal, or an intentionally frozen nonterminal.
    Leaf,
    /// An expanded node with ordered children.
    Inner(Vec<NodeId>),
}

#[derive(Debug, Clone)]
pub struct NodeData {
    pub symbol: Symbol,
    pub ident: u64,
    pub children: Children,
}

/// Append-only storage for derivation tree nodes.
#[derive(Debug, Default)]
pub struct TreeArena {
    nodes: Vec<NodeData>,
    next_ident: u64,
}

/// Mapping from re-allocated [`NodeId`]s to their successors, produced by
/// [`TreeArena::replace`]. Callers remap any outstanding handles through it.
#[derive(Debug, Clone, Default)]
pub struct SpineMap {
    entries: Vec<(NodeId, NodeId)>,
}

impl SpineMap {
    fn push(&mut self, old: NodeId, new: NodeId) {
        self.entries.push((old, new));
    }

    /// Follow the mapping; ids that were not re-allocated map to themselves.
    pub fn resolve(&self, id: NodeId) -> NodeId {
        for &(old, new) in &self.entries {
            if old == id {
                return new;
            }
        }
        id
    }
}

impl TreeArena {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    fn alloc(&mut self, symbol: Symbol, children: Children) -> NodeId {
        let ident = self.next_ident;
        self.next_ident += 1;
        self.alloc_with_ident(symbol, children, ident)
    }

    fn alloc_with_ident(&mut self, symbol: Symbol, children: Children, ident: u64) -> NodeId {
        let id = NodeId(self.nodes.len() as u32);
        self.nodes.push(NodeData {
            symbol,
            ident,
            children,
        });
        id
    }

    /// Allocate an open (unexpanded) nonterminal leaf.
    pub fn open(&mut self, name: &str) -> NodeId {
        self.alloc(Symbol::nonterminal(name), Children::Open)
    }

    /// Allocate a closed terminal leaf.
    pub fn leaf(&mut self, text: &str) -> NodeId {
        self.alloc(Symbol::terminal(text), Children::Leaf)
    }

    /// Allocate an inner node with the given children.
    pub fn inner(&mut self, name: &str, children: Vec<NodeId>) -> NodeId {
        self.alloc(Symbol::nonterminal(name), Children::Inner(children))
    }

    pub fn node(&self, id: NodeId) -> &NodeData {
        &self.nodes[id.index()]
    }

    pub fn symbol(&self, id: NodeId) -> &Symbol {
        &self.node(id).symbol
    }

    pub fn ident(&self, id: NodeId) -> u64 {
        self.node(id).ident
    }

    pub fn children(&self, id: NodeId) -> &Children {
        &self.node(id).children
    }

    pub fn is_open_leaf(&self, id: NodeId) -> bool {
        matches!(self.node(id).children, Children::Open)
    }

    /// The node at `path` below `root`, if the path is valid.
    pub fn subtree(&self, root: NodeId, path: &[usize]) -> Option<NodeId> {
        let mut current = root;
        for &step in path {
            match &self.node(current).children {
                Children::Inner(children) => current = *children.get(step)?,
                _ => return None,
            }
        }
        Some(current)
    }

    /// The path from `root` down to `target`, if `target` occurs below it.
    pub fn path_of(&self, root: NodeId, target: NodeId) -> Option<Path> {
        fn walk(arena: &TreeArena, current: NodeId, target: NodeId, path: &mut Path) -> bool {
            if current == target {
                return true;
            }
            if let Children::Inner(children) = &arena.node(current).children {
                for (i, &child) in children.iter().enumerate() {
                    path.push(i);
                    if walk(arena, child, target, path) {
                        return true;
                    }
                    path.pop();
                }
            }
            false
        }

        let mut path = Vec::new();
        walk(self, root, target, &mut path).then_some(path)
    }

    /// All `(path, node)` pairs below `root` in preorder, root included.
    pub fn paths(&self, root: NodeId) -> Vec<(Path, NodeId)> {
        let mut result = Vec::new();
        let mut stack = vec![(Vec::new(), root)];
        while let Some((path, id)) = stack.pop() {
            if let Children::Inner(children) = &self.node(id).children {
                for (i, &child) in children.iter().enumerate().rev() {
                    let mut child_path = path.clone();
                    child_path.push(i);
                    stack.push((child_path, child));
                }
            }
            result.push((path, id));
        }
        result
    }

    /// All open leaves below `root` in preorder.
    pub fn open_leaves(&self, root: NodeId) -> Vec<(Path, NodeId)> {
        self.paths(root)
            .into_iter()
            .filter(|&(_, id)| self.is_open_leaf(id))
            .collect()
    }

    /// All subtrees below `root` whose root is the nonterminal `sort`,
    /// in preorder, `root` itself included when it matches.
    pub fn subtrees_with_sort(&self, root: NodeId, sort: &str) -> Vec<(Path, NodeId)> {
        self.paths(root)
            .into_iter()
            .filter(|&(_, id)| match self.symbol(id) {
                Symbol::Nonterminal(name) => name.as_ref() == sort,
                Symbol::Terminal(_) => false,
            })
            .collect()
    }

    /// True iff no open leaves remain below `root`.
    pub fn is_complete(&self, root: NodeId) -> bool {
        let mut stack = vec![root];
        while let Some(id) = stack.pop() {
            match &self.node(id).children {
                Children::Open => return false,
                Children::Leaf => {}
                Children::Inner(children) => stack.extend(children.iter().copied()),
            }
        }
        true
    }

    /// Number of nodes below `root`, root included.
    pub fn size(&self, root: NodeId) -> usize {
        let mut count = 0;
        let mut stack = vec![root];
        while let Some(id) = stack.pop() {
            count += 1;
            if let Children::Inner(children) = &self.node(id).children {
                stack.extend(children.iter().copied());
            }
        }
        count
    }

    /// Concatenated terminal leaf values, in order. Open and frozen
    /// nonterminal leaves contribute nothing; on a complete tree the result
    /// is a string derivable from the grammar.
    pub fn render(&self, root: NodeId) -> String {
        let mut out = String::new();
        self.render_into(root, &mut out);
        out
    }

    fn render_into(&self, id: NodeId, out: &mut String) {
        match &self.node(id).children {
            Children::Open => {}
            Children::Leaf => {
                if let Symbol::Terminal(text) = self.symbol(id) {
                    out.push_str(text);
                }
            }
            Children::Inner(children) => {
                for &child in children {
                    self.render_into(child, out);
                }
            }
        }
    }

    /// Diagnostic rendering: like [`render`][Self::render], but open and
    /// frozen nonterminal leaves show as `<name>`.
    pub fn display(&self, root: NodeId) -> String {
        let mut out = String::new();
        self.display_into(root, &mut out);
        out
    }

    fn display_into(&self, id: NodeId, out: &mut String) {
        match &self.node(id).children {
            Children::Open | Children::Leaf => match self.symbol(id) {
                Symbol::Terminal(text) => out.push_str(text),
                Symbol::Nonterminal(name) => {
                    out.push('<');
                    out.push_str(name);
                    out.push('>');
                }
            },
            Children::Inner(children) => {
                for &child in children {
                    self.display_into(child, out);
                }
            }
        }
    }

    /// Replace the node at `path` below `root` with `replacement`.
    ///
    /// Returns the new root and the [`SpineMap`] of re-allocated ids: every
    /// ancestor of the replaced position (keeping its ident) and the
    /// replaced node itself, mapped to `replacement`.
    pub fn replace(&mut self, root: NodeId, path: &[usize], replacement: NodeId) -> (NodeId, SpineMap) {
        let mut spine = SpineMap::default();

        // Collect the ancestor chain.
        let mut chain = Vec::with_capacity(path.len() + 1);
        let mut current = root;
        chain.push(current);
        for &step in path {
            match &self.node(current).children {
                Children::Inner(children) => current = children[step],
                _ => panic!("replace: invalid path {:?} below {}", path, root),
            }
            chain.push(current);
        }

        let replaced = *chain.last().unwrap();
        spine.push(replaced, replacement);

        // Rebuild bottom-up, sharing all siblings.
        let mut new_child = replacement;
        for depth in (0..path.len()).rev() {
            let old_parent = chain[depth];
            let parent = self.node(old_parent).clone();
            let mut children = match parent.children {
                Children::Inner(children) => children,
                _ => unreachable!(),
            };
            children[path[depth]] = new_child;
            let new_parent =
                self.alloc_with_ident(parent.symbol, Children::Inner(children), parent.ident);
            spine.push(old_parent, new_parent);
            new_child = new_parent;
        }

        (new_child, spine)
    }

    /// Expand the open leaf at `path` with alternative `alt` of its
    /// nonterminal: the leaf is replaced by an inner node (keeping the
    /// leaf's ident) whose children realize the alternative, nonterminals
    /// open.
    pub fn expand(
        &mut self,
        root: NodeId,
        path: &[usize],
        grammar: &Grammar,
        alt: usize,
    ) -> (NodeId, SpineMap) {
        let leaf = self
            .subtree(root, path)
            .unwrap_or_else(|| panic!("expand: invalid path {:?} below {}", path, root));
        assert!(self.is_open_leaf(leaf), "expand: {} is not an open leaf", leaf);

        let name = match self.symbol(leaf) {
            Symbol::Nonterminal(name) => Rc::clone(name),
            Symbol::Terminal(_) => unreachable!("open leaf with terminal symbol"),
        };
        let alternative = grammar.alternatives(&name)[alt].clone();
        let ident = self.ident(leaf);
        let expansion = self.realize(&name, &alternative, ident);
        self.replace(root, path, expansion)
    }

    /// Build an inner node for `alternative`, terminal children closed,
    /// nonterminal children open.
    fn realize(&mut self, name: &str, alternative: &Alternative, ident: u64) -> NodeId {
        let children = alternative
            .symbols
            .iter()
            .map(|symbol| match symbol {
                Symbol::Terminal(text) => self.leaf(text),
                Symbol::Nonterminal(child) => self.open(child),
            })
            .collect();
        self.alloc_with_ident(Symbol::nonterminal(name), Children::Inner(children), ident)
    }

    /// Build the chain of expansions `grammar.derivation_chain(from, to)`
    /// with `bottom` placed at the `to` position and every other
    /// nonterminal open. Returns the chain root (equal to `bottom` for
    /// `from == to`).
    pub fn materialize_chain(
        &mut self,
        grammar: &Grammar,
        from: &str,
        to: &str,
        bottom: NodeId,
    ) -> Option<NodeId> {
        let chain = grammar.derivation_chain(from, to)?;
        let mut current = bottom;
        // Walk the chain top-down to learn the nonterminal at each level,
        // then build bottom-up.
        let mut names = Vec::with_capacity(chain.len());
        let mut level: &str = from;
        for &(ai, si) in &chain {
            names.push((level.to_string(), ai, si));
            match &grammar.alternatives(level)[ai].symbols[si] {
                Symbol::Nonterminal(next) => level = next.as_ref(),
                Symbol::Terminal(_) => return None,
            }
        }
        for (name, ai, si) in names.into_iter().rev() {
            let alternative = grammar.alternatives(&name)[ai].clone();
            let children = alternative
                .symbols
                .iter()
                .enumerate()
                .map(|(i, symbol)| {
                    if i == si {
                        current
                    } else {
                        match symbol {
                            Symbol::Terminal(text) => self.leaf(text),
                            Symbol::Nonterminal(child) => self.open(child),
                        }
                    }
                })
                .collect();
            current = self.alloc(Symbol::nonterminal(&name), Children::Inner(children));
        }
        Some(current)
    }
}

/// Left-to-right traversal order on paths: true iff `a` comes strictly
/// before `b` and neither is an ancestor of the other.
pub fn path_before(a: &[usize], b: &[usize]) -> bool {
    for (x, y) in a.iter().zip(b.iter()) {
        if x != y {
            return x < y;
        }
    }
    false
}
