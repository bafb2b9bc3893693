//! Context-free grammar model.
//!
//! A [`Grammar`] maps nonterminal names to ordered lists of alternatives,
//! each an ordered sequence of [`Symbol`]s. Rule and alternative order are
//! semantic: the search engine enumerates them in definition order, which is
//! what makes solution sequences reproducible.
//!
//! Construction validates the grammar (undefined or unreachable nonterminals
//! are rejected) and precomputes two tables the solver relies on:
//!
//! - `min_size`: the size of the smallest complete tree for each
//!   nonterminal, used by shortest-first expansion;
//! - `derivable`: whether a tree rooted at one nonterminal can contain a
//!   node of another, used by guided expansion and subtree insertion.

use std::collections::{HashMap, HashSet, VecDeque};
use std::fmt::{Display, Formatter};
use std::rc::Rc;

use crate::error::GrammarError;

/// A grammar symbol: literal terminal text or a nonterminal reference.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum Symbol {
    Terminal(Rc<str>),
    Nonterminal(Rc<str>),
}

impl Symbol {
    pub fn terminal(text: &str) -> Self {
        Symbol::Terminal(Rc::from(text))
    }

    pub fn nonterminal(name: &str) -> Self {
        Symbol::Nonterminal(Rc::from(name))
    }

    pub fn is_nonterminal(&self) -> bool {
        matches!(self, Symbol::Nonterminal(_))
    }

    /// The raw text: terminal contents, or the nonterminal name without
    /// angle brackets.
    pub fn text(&self) -> &str {
        match self {
            Symbol::Terminal(t) => t,
            Symbol::Nonterminal(n) => n,
        }
    }
}

impl Display for Symbol {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        match self {
            Symbol::Terminal(t) => write!(f, "{}", t),
            Symbol::Nonterminal(n) => write!(f, "<{}>", n),
        }
    }
}

/// One expansion alternative: an ordered sequence of symbols.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Alternative {
    pub symbols: Vec<Symbol>,
}

impl Display for Alternative {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        for symbol in &self.symbols {
            write!(f, "{}", symbol)?;
        }
        Ok(())
    }
}

/// A production rule: a nonterminal and its ordered alternatives.
#[derive(Debug, Clone)]
pub struct Rule {
    pub name: Rc<str>,
    pub alternatives: Vec<Alternative>,
}

/// A validated context-free grammar.
#[derive(Debug, Clone)]
pub struct Grammar {
    start: Rc<str>,
    rules: Vec<Rule>,
    index: HashMap<Rc<str>, usize>,
    /// Per rule: size of the smallest complete tree rooted there.
    min_size: Vec<usize>,
    /// Per rule, per alternative: total minimal subtree size of expanding it.
    alt_cost: Vec<Vec<usize>>,
    /// Per rule: set of nonterminals a tree rooted there can contain
    /// (reflexive-transitive).
    derivable: Vec<HashSet<Rc<str>>>,
}

impl Grammar {
    /// Build and validate a grammar from `(name, alternatives)` pairs.
    ///
    /// Each alternative is a string where nonterminal references are written
    /// in angle brackets, e.g. `"<var> := <rhs>"`.
    ///
    /// # Examples
    ///
    /// ```
    /// use gramsat::grammar::Grammar;
    ///
    /// let grammar = Grammar::new(
    ///     "start",
    ///     [
    ///         ("start", vec!["<stmt>"]),
    ///         ("stmt", vec!["<assgn>", "<assgn> ; <stmt>"]),
    ///         ("assgn", vec!["<var> := <rhs>"]),
    ///         ("rhs", vec!["<var>", "<digit>"]),
    ///         ("var", vec!["x", "y", "z"]),
    ///         ("digit", vec!["0", "1", "2"]),
    ///     ],
    /// )
    /// .unwrap();
    /// assert_eq!(grammar.start(), "start");
    /// assert!(grammar.derives("stmt", "digit"));
    /// ```
    pub fn new<N, A>(
        start: &str,
        definitions: impl IntoIterator<Item = (N, Vec<A>)>,
    ) -> Result<Self, GrammarError>
    where
        N: AsRef<str>,
        A: AsRef<str>,
    {
        let mut rules = Vec::new();
        let mut index = HashMap::new();

        for (name, alternatives) in definitions {
            let name: Rc<str> = Rc::from(name.as_ref());
            if index.contains_key(&name) {
                return Err(GrammarError::Duplicate(name.to_string()));
            }
            let alternatives = alternatives
                .iter()
                .map(|alt| {
                    Ok(Alternative {
                        symbols: parse_alternative(alt.as_ref())?,
                    })
                })
                .collect::<Result<Vec<_>, GrammarError>>()?;
            index.insert(Rc::clone(&name), rules.len());
            rules.push(Rule { name, alternatives });
        }

        let grammar = Self {
            start: Rc::from(start),
            rules,
            index,
            min_size: Vec::new(),
            alt_cost: Vec::new(),
            derivable: Vec::new(),
        };
        grammar.validate()?.precompute()
    }

    fn validate(self) -> Result<Self, GrammarError> {
        if !self.index.contains_key(self.start.as_ref()) {
            return Err(GrammarError::UndefinedStart(self.start.to_string()));
        }

        // Every reference must be defined.
        for rule in &self.rules {
            for alternative in &rule.alternatives {
                for symbol in &alternative.symbols {
                    if let Symbol::Nonterminal(name) = symbol {
                        if !self.index.contains_key(name) {
                            return Err(GrammarError::Undefined {
                                referenced: name.to_string(),
                                referencing: rule.name.to_string(),
                            });
                        }
                    }
                }
            }
        }

        // Every rule must be reachable from the start symbol.
        let mut reached: HashSet<Rc<str>> = HashSet::new();
        let mut queue = VecDeque::from([Rc::clone(&self.start)]);
        while let Some(name) = queue.pop_front() {
            if !reached.insert(Rc::clone(&name)) {
                continue;
            }
            let rule = &self.rules[self.index[&name]];
            for alternative in &rule.alternatives {
                for symbol in &alternative.symbols {
                    if let Symbol::Nonterminal(child) = symbol {
                        queue.push_back(Rc::clone(child));
                    }
                }
            }
        }
        for rule in &self.rules {
            if !reached.contains(&rule.name) {
                return Err(GrammarError::Unreachable(rule.name.to_string()));
            }
        }

        Ok(self)
    }

    /// Fixpoint computation of `min_size`, `alt_cost` and `derivable`.
    fn precompute(mut self) -> Result<Self, GrammarError> {
        let n = self.rules.len();

        // Smallest complete tree sizes, saturating for unproductive rules.
        let mut min_size = vec![usize::MAX; n];
        loop {
            let mut changed = false;
            for (i, rule) in self.rules.iter().enumerate() {
                for alternative in &rule.alternatives {
                    let cost = self.alternative_cost(&min_size, alternative);
                    let candidate = cost.saturating_add(1);
                    if candidate < min_size[i] {
                        min_size[i] = candidate;
                        changed = true;
                    }
                }
            }
            if !changed {
                break;
            }
        }
        let alt_cost = self
            .rules
            .iter()
            .map(|rule| {
                rule.alternatives
                    .iter()
                    .map(|alternative| self.alternative_cost(&min_size, alternative))
                    .collect()
            })
            .collect();

        // Reflexive-transitive containment closure.
        let mut derivable: Vec<HashSet<Rc<str>>> = self
            .rules
            .iter()
            .map(|rule| HashSet::from([Rc::clone(&rule.name)]))
            .collect();
        loop {
            let mut changed = false;
            for i in 0..n {
                let mut additions = HashSet::new();
                for alternative in &self.rules[i].alternatives {
                    for symbol in &alternative.symbols {
                        if let Symbol::Nonterminal(child) = symbol {
                            let j = self.index[child];
                            for name in &derivable[j] {
                                if !derivable[i].contains(name) {
                                    additions.insert(Rc::clone(name));
                                }
                            }
                        }
                    }
                }
                if !additions.is_empty() {
                    derivable[i].extend(additions);
                    changed = true;
                }
            }
            if !changed {
                break;
            }
        }

        self.min_size = min_size;
        self.alt_cost = alt_cost;
        self.derivable = derivable;
        Ok(self)
    }

    fn alternative_cost(&self, min_size: &[usize], alternative: &Alternative) -> usize {
        let mut cost = 0usize;
        for symbol in &alternative.symbols {
            let symbol_cost = match symbol {
                Symbol::Terminal(_) => 1,
                Symbol::Nonterminal(name) => min_size[self.index[name]],
            };
            cost = cost.saturating_add(symbol_cost);
        }
        cost
    }

    pub fn start(&self) -> &str {
        &self.start
    }

    pub fn start_symbol(&self) -> Symbol {
        Symbol::Nonterminal(Rc::clone(&self.start))
    }

    pub fn contains(&self, name: &str) -> bool {
        self.index.contains_key(name)
    }

    pub fn rule(&self, name: &str) -> Option<&Rule> {
        self.index.get(name).map(|&i| &self.rules[i])
    }

    pub fn rules(&self) -> &[Rule] {
        &self.rules
    }

    pub fn alternatives(&self, name: &str) -> &[Alternative] {
        self.rule(name)
            .map(|rule| rule.alternatives.as_slice())
            .unwrap_or(&[])
    }

    /// Size of the smallest complete tree rooted at `name`.
    pub fn min_size(&self, name: &str) -> usize {
        self.index.get(name).map(|&i| self.min_size[i]).unwrap_or(usize::MAX)
    }

    /// Minimal total subtree size of choosing alternative `alt` of `name`.
    pub fn alternative_min_cost(&self, name: &str, alt: usize) -> usize {
        self.index
            .get(name)
            .and_then(|&i| self.alt_cost[i].get(alt).copied())
            .unwrap_or(usize::MAX)
    }

    /// Index of the cheapest alternative of `name` (first on ties).
    pub fn cheapest_alternative(&self, name: &str) -> usize {
        let costs = &self.alt_cost[self.index[name]];
        let mut best = 0;
        for (i, &cost) in costs.iter().enumerate() {
            if cost < costs[best] {
                best = i;
            }
        }
        best
    }

    /// Can a tree rooted at `from` contain a node labeled `to`?
    /// Reflexive: `derives(x, x)` is true for every defined `x`.
    pub fn derives(&self, from: &str, to: &str) -> bool {
        self.index
            .get(from)
            .map(|&i| self.derivable[i].contains(to))
            .unwrap_or(false)
    }

    /// Shortest derivation chain from `from` down to a node of `to`,
    /// as `(alternative index, child position)` steps. Empty for
    /// `from == to`, `None` when `to` is not derivable.
    ///
    /// Deterministic: breadth-first over rules in definition order.
    pub fn derivation_chain(&self, from: &str, to: &str) -> Option<Vec<(usize, usize)>> {
        if !self.contains(from) || !self.contains(to) {
            return None;
        }
        if from == to {
            return Some(Vec::new());
        }

        let mut predecessor: HashMap<Rc<str>, (Rc<str>, usize, usize)> = HashMap::new();
        let mut queue = VecDeque::from([Rc::from(from)]);
        let mut seen: HashSet<Rc<str>> = HashSet::from([Rc::from(from)]);
        while let Some(name) = queue.pop_front() {
            let rule = &self.rules[self.index[&name]];
            for (ai, alternative) in rule.alternatives.iter().enumerate() {
                for (si, symbol) in alternative.symbols.iter().enumerate() {
                    if let Symbol::Nonterminal(child) = symbol {
                        if seen.insert(Rc::clone(child)) {
                            predecessor.insert(Rc::clone(child), (Rc::clone(&name), ai, si));
                            if child.as_ref() == to {
                                // Reconstruct the chain back to `from`.
                                let mut chain = Vec::new();
                                let mut current: Rc<str> = Rc::clone(child);
                                while current.as_ref() != from {
                                    let (parent, ai, si) = predecessor[&current].clone();
                                    chain.push((ai, si));
                                    current = parent;
                                }
                                chain.reverse();
                                return Some(chain);
                            }
                            queue.push_back(Rc::clone(child));
                        }
                    }
                }
            }
        }
        None
    }
}

impl Display for Grammar {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        for rule in &self.rules {
            write!(f, "<{}> ::= ", rule.name)?;
            for (i, alternative) in rule.alternatives.iter().enumerate() {
                if i > 0 {
                    write!(f, " | ")?;
                }
                write!(f, "{}", alternative)?;
            }
            writeln!(f)?;
        }
        Ok(())
    }
}

/// Split alternative text into literal runs and `<...>` references.
fn parse_alternative(text: &str) -> Result<Vec<Symbol>, GrammarError> {
    let mut symbols = Vec::new();
    let mut rest = text;
    while !rest.is_empty() {
        match rest.find('<') {
            None => {
                symbols.push(Symbol::terminal(rest));
                rest = "";
            }
            Some(open) => {
                if open > 0 {
                    symbols.push(Symbol::terminal(&rest[..open]));
                }
                let tail = &rest[open + 1..];
                let close = tail
                    .find('>')
                    .ok_or_else(|| GrammarError::MalformedReference(text.to_string()))?;
                let name = &tail[..close];
                if name.is_empty() || name.contains('<') {
                    return Err(GrammarError::MalformedReference(text.to_string()));
                }
                symbols.push(Symbol::nonterminal(name));
                rest = &tail[close + 1..];
            }
        }
    }
    Ok(symbols)
}

#[cfg(test)]
pub(crate) fn assignment_grammar() -> Grammar {
    Grammar::new(
        "start",
        [
            ("start", vec!["<stmt>"]),
            ("stmt", vec!["<assgn>", "<assgn> ; <stmt>"]),
            ("assgn", vec!["<var> := <rhs>"]),
            ("rhs", vec!["<var>", "<digit>"]),
            ("var", vec!["x", "y", "z"]),
            ("digit", vec!["0", "1", "2"]),
        ],
    )
    .unwrap()
}

#[cfg(test)]
mod tests {
    use test_log::test;

    use super::*;

    #[test]
    fn test_parse_alternative() {
        let symbols = parse_alternative("<var> := <rhs>").unwrap();
        assert_eq!(
            symbols,
            vec![
                Symbol::nonterminal("var"),
                Symbol::terminal(" := "),
                Symbol::nonterminal("rhs"),
            ]
        );
    }

    #[test]
    fn test_parse_alternative_malformed() {
        assert!(matches!(
            parse_alternative("<var"),
            Err(GrammarError::MalformedReference(_))
        ));
        assert!(matches!(
            parse_alternative("a <> b"),
            Err(GrammarError::MalformedReference(_))
        ));
    }

    #[test]
    fn test_undefined_reference() {
        let result = Grammar::new("start", [("start", vec!["<stmt>"])]);
        assert_eq!(
            result.unwrap_err(),
            GrammarError::Undefined {
                referenced: "stmt".to_string(),
                referencing: "start".to_string(),
            }
        );
    }

    #[test]
    fn test_undefined_start() {
        let result = Grammar::new("start", [("stmt", vec!["a"])]);
        assert_eq!(
            result.unwrap_err(),
            GrammarError::UndefinedStart("start".to_string())
        );
    }

    #[test]
    fn test_unreachable() {
        let result = Grammar::new(
            "start",
            [("start", vec!["a"]), ("orphan", vec!["b"])],
        );
        assert_eq!(
            result.unwrap_err(),
            GrammarError::Unreachable("orphan".to_string())
        );
    }

    #[test]
    fn test_min_size() {
        let grammar = assignment_grammar();
        // <var> -> "x" is a 2-node tree.
        assert_eq!(grammar.min_size("var"), 2);
        // <assgn> -> <var> " := " <rhs> with minimal children.
        assert_eq!(grammar.min_size("assgn"), 2 + 1 + 3 + 1);
        // The cheaper <stmt> alternative is the single assignment.
        assert_eq!(grammar.cheapest_alternative("stmt"), 0);
    }

    #[test]
    fn test_derives() {
        let grammar = assignment_grammar();
        assert!(grammar.derives("start", "digit"));
        assert!(grammar.derives("stmt", "stmt"));
        assert!(grammar.derives("rhs", "var"));
        assert!(!grammar.derives("var", "stmt"));
        assert!(!grammar.derives("digit", "var"));
    }

    #[test]
    fn test_derivation_chain() {
        let grammar = assignment_grammar();
        assert_eq!(grammar.derivation_chain("var", "var"), Some(vec![]));

        // start -> stmt -> assgn -> rhs? No: rhs sits at position 2 of the
        // single assgn alternative.
        let chain = grammar.derivation_chain("start", "digit").unwrap();
        assert_eq!(chain, vec![(0, 0), (0, 0), (0, 2), (1, 0)]);

        assert_eq!(grammar.derivation_chain("digit", "var"), None);
    }
}
