//! The search engine.
//!
//! A priority-queue-driven state machine over immutable [`State`]
//! snapshots: the current (possibly open) derivation tree, the obligations
//! still to discharge, and the free-expansion budget already spent. From
//! each popped state, transition rules produce zero or more successor
//! states; a state whose tree is complete and whose obligation set is empty
//! is a solution.
//!
//! The rules, applied in the configurable [`SolverConfig::rule_order`]
//! (first applicable rule wins):
//!
//! 1. **Decompose**: branch disjunctions, check structural atoms.
//! 2. **Existential**: bind an existing match, or graft a synthesized
//!    subtree (constructive insertion) when none exists.
//! 3. **Universal**: instantiate the body for every new match; discharge
//!    once the bound tree is complete.
//! 4. **Semantic**: batch ready SMT atoms into one query, enumerate
//!    distinct models, graft admitted (re-parsed) model values; evaluate
//!    semantic predicates, applying their requested bindings.
//! 5. **Guided**: expand an open leaf some obligation is blocked on, one
//!    successor per grammar alternative.
//! 6. **Free**: default-expand unconstrained leaves, bounded by
//!    `max_free_instantiations`; exceeding the bound prunes the branch.
//!
//! Everything is deterministic: the queue orders by `(cost, seq)` where
//! `seq` is a monotone insertion counter, so identical inputs and
//! configuration reproduce the identical solution sequence.

use std::cmp::Ordering;
use std::collections::{BTreeMap, BTreeSet, BinaryHeap};
use std::rc::Rc;
use std::time::Duration;

use log::{debug, trace, warn};

use crate::error::ConfigError;
use crate::eval::{evaluate, raw_matches, Env};
use crate::expand::{sample_strings, Expander, ExpansionPolicy};
use crate::formula::{Formula, Quantified, SemArg, Variable};
use crate::grammar::{Grammar, Symbol};
use crate::parse::parse_into;
use crate::predicate::{Predicates, SemInst, SemPredResult};
use crate::smt::{
    FallbackSolver, Model, SmtQuery, SmtResponse, StringAtom, StringSolver, StringTerm, VarDecl,
};
use crate::tree::{NodeId, Path, SpineMap, TreeArena};

/// Insertion candidates examined per existential discharge.
const MAX_INSERTIONS: usize = 4;

/// Weights of the state cost function; lower cost is dequeued first.
#[derive(Debug, Clone)]
pub struct CostWeights {
    /// Per tree node.
    pub tree_size: u64,
    /// Per undischarged quantifier obligation.
    pub quantifier: u64,
    /// Per obligation blocked on an open leaf.
    pub blocked: u64,
}

impl Default for CostWeights {
    fn default() -> Self {
        Self {
            tree_size: 1,
            quantifier: 20,
            blocked: 5,
        }
    }
}

/// Transition rule tags, for [`SolverConfig::rule_order`].
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum Rule {
    Decompose,
    Existential,
    Universal,
    Semantic,
    Guided,
    Free,
}

/// The default rule priority; see DESIGN.md for the rationale.
pub const DEFAULT_RULE_ORDER: [Rule; 6] = [
    Rule::Decompose,
    Rule::Existential,
    Rule::Universal,
    Rule::Semantic,
    Rule::Guided,
    Rule::Free,
];

#[derive(Debug, Clone)]
pub struct SolverConfig {
    /// Cap on default expansions per solution.
    pub max_free_instantiations: usize,
    /// Cap on distinct models requested per semantic-solving batch.
    pub max_smt_instantiations: usize,
    pub cost_weights: CostWeights,
    /// Per-query budget for the external solver (informational for
    /// backends without a timeout of their own).
    pub smt_timeout: Duration,
    pub expansion_policy: ExpansionPolicy,
    pub rule_order: Vec<Rule>,
}

impl Default for SolverConfig {
    fn default() -> Self {
        Self {
            max_free_instantiations: 10,
            max_smt_instantiations: 3,
            cost_weights: CostWeights::default(),
            smt_timeout: Duration::from_secs(2),
            expansion_policy: ExpansionPolicy::default(),
            rule_order: DEFAULT_RULE_ORDER.to_vec(),
        }
    }
}

impl SolverConfig {
    fn validate(&self) -> Result<(), ConfigError> {
        if self.max_free_instantiations == 0 {
            return Err(ConfigError::ZeroOption("max_free_instantiations"));
        }
        if self.max_smt_instantiations == 0 {
            return Err(ConfigError::ZeroOption("max_smt_instantiations"));
        }
        let w = &self.cost_weights;
        if w.tree_size == 0 && w.quantifier == 0 && w.blocked == 0 {
            return Err(ConfigError::DegenerateWeights);
        }
        if self.rule_order.len() != DEFAULT_RULE_ORDER.len()
            || DEFAULT_RULE_ORDER
                .iter()
                .any(|rule| !self.rule_order.contains(rule))
        {
            return Err(ConfigError::IncompleteRuleOrder);
        }
        Ok(())
    }
}

/// The top-level constant: the variable conventionally named `start` that
/// denotes the whole derivation tree.
pub fn top_constant(grammar: &Grammar) -> Variable {
    Variable::new("start", grammar.start())
}

/// One yielded solution.
#[derive(Debug, Clone)]
pub struct Solution {
    /// Root of the complete tree in the solver's arena.
    pub root: NodeId,
    /// Its rendered string.
    pub text: String,
}

/// Outcome of a single [`Solver::advance`] step.
#[derive(Debug, Clone)]
pub enum Progress {
    Solution(Solution),
    /// No solution yet; more queue work remains.
    Pending,
    /// The queue is empty; the sequence is permanently exhausted.
    Exhausted,
}

/// One formula still to discharge, with its variable bindings.
#[derive(Debug, Clone)]
struct Obligation {
    formula: Formula,
    env: Env,
}

/// An immutable search snapshot.
#[derive(Debug)]
struct State {
    root: NodeId,
    obligations: Vec<Obligation>,
    free_used: usize,
    cost: u64,
    seq: u64,
}

impl PartialEq for State {
    fn eq(&self, other: &Self) -> bool {
        self.cost == other.cost && self.seq == other.seq
    }
}

impl Eq for State {}

impl PartialOrd for State {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for State {
    fn cmp(&self, other: &Self) -> Ordering {
        // Reversed: BinaryHeap is a max-heap, we want the cheapest state
        // first, ties broken by insertion order.
        other
            .cost
            .cmp(&self.cost)
            .then_with(|| other.seq.cmp(&self.seq))
    }
}

pub struct Solver {
    arena: TreeArena,
    grammar: Grammar,
    predicates: Predicates,
    smt: Box<dyn StringSolver>,
    config: SolverConfig,
    /// The original formula, for final verification of candidates.
    formula: Formula,
    top: Variable,
    expander: Expander,
    queue: BinaryHeap<State>,
    seq: u64,
    exhausted: bool,
}

impl Solver {
    /// A solver over the builtin predicate library and the fallback string
    /// solver.
    pub fn new(grammar: Grammar, formula: Formula, config: SolverConfig) -> Result<Self, ConfigError> {
        Self::with_parts(
            grammar,
            formula,
            Predicates::core(),
            Box::new(FallbackSolver::default()),
            config,
        )
    }

    /// A solver backed by an external `z3` process, using the configured
    /// `smt_timeout` as the per-query budget.
    pub fn with_z3(
        grammar: Grammar,
        formula: Formula,
        config: SolverConfig,
    ) -> Result<Self, ConfigError> {
        let smt = Box::new(crate::smtlib::TextSolver::z3(config.smt_timeout));
        Self::with_parts(grammar, formula, Predicates::core(), smt, config)
    }

    /// A solver with an explicit predicate signature and string solver.
    pub fn with_parts(
        grammar: Grammar,
        formula: Formula,
        predicates: Predicates,
        smt: Box<dyn StringSolver>,
        config: SolverConfig,
    ) -> Result<Self, ConfigError> {
        config.validate()?;
        let top = top_constant(&grammar);
        formula.check(&grammar, &predicates, &top)?;

        let mut arena = TreeArena::new();
        let root = arena.open(grammar.start());
        let env = Env::from([(Rc::clone(&top.name), root)]);
        let obligations = conjunct_obligations(formula.clone().nnf(), &env);

        let expander = Expander::new(config.expansion_policy);
        let mut solver = Self {
            arena,
            grammar,
            predicates,
            smt,
            config,
            formula,
            top,
            expander,
            queue: BinaryHeap::new(),
            seq: 0,
            exhausted: false,
        };
        solver.push_state(root, obligations, 0);
        Ok(solver)
    }

    pub fn arena(&self) -> &TreeArena {
        &self.arena
    }

    pub fn grammar(&self) -> &Grammar {
        &self.grammar
    }

    /// Advance the queue by one state. Returns the found solution, or
    /// [`Progress::Pending`] when more work remains, or
    /// [`Progress::Exhausted`] once the queue has run dry (terminal).
    pub fn advance(&mut self) -> Progress {
        let Some(state) = self.queue.pop() else {
            if !self.exhausted {
                debug!("search space exhausted");
                self.exhausted = true;
            }
            return Progress::Exhausted;
        };
        trace!(
            "pop state #{} (cost {}): tree {:?}, {} obligations",
            state.seq,
            state.cost,
            self.arena.display(state.root),
            state.obligations.len()
        );

        if state.obligations.is_empty() && self.arena.is_complete(state.root) {
            let env = Env::from([(Rc::clone(&self.top.name), state.root)]);
            let holds = evaluate(
                &self.arena,
                &self.grammar,
                state.root,
                &self.formula,
                &env,
                &self.predicates,
                self.smt.as_ref(),
            );
            if holds {
                let text = self.arena.render(state.root);
                debug!("solution: {:?}", text);
                return Progress::Solution(Solution {
                    root: state.root,
                    text,
                });
            }
            warn!(
                "candidate {:?} failed final verification, pruning",
                self.arena.render(state.root)
            );
            return Progress::Pending;
        }

        let successors = self.step(&state);
        trace!("state #{} -> {} successors", state.seq, successors.len());
        for (root, obligations, free_used) in successors {
            self.push_state(root, obligations, free_used);
        }
        Progress::Pending
    }

    /// Drive [`advance`][Self::advance] until the next solution, or `None`
    /// once permanently exhausted.
    pub fn next_solution(&mut self) -> Option<Solution> {
        loop {
            match self.advance() {
                Progress::Solution(solution) => return Some(solution),
                Progress::Pending => {}
                Progress::Exhausted => return None,
            }
        }
    }

    /// The lazy solution sequence.
    pub fn solutions(&mut self) -> Solutions<'_> {
        Solutions { solver: self }
    }

    // -- state management ---------------------------------------------------

    fn push_state(&mut self, root: NodeId, obligations: Vec<Obligation>, free_used: usize) {
        let cost = self.cost_of(root, &obligations);
        let state = State {
            root,
            obligations,
            free_used,
            cost,
            seq: self.seq,
        };
        self.seq += 1;
        self.queue.push(state);
    }

    fn cost_of(&self, root: NodeId, obligations: &[Obligation]) -> u64 {
        let w = &self.config.cost_weights;
        let size = self.arena.size(root) as u64;
        let quantifiers = obligations
            .iter()
            .filter(|o| matches!(o.formula, Formula::Forall(_) | Formula::Exists(_)))
            .count() as u64;
        let blocked = obligations
            .iter()
            .filter(|o| !self.blocked_leaves(root, o).is_empty())
            .count() as u64;
        w.tree_size * size + w.quantifier * quantifiers + w.blocked * blocked
    }

    /// Apply the first rule (in configured order) that fires. `Some(vec![])`
    /// means the rule fired and pruned the state; `None` from every rule
    /// means the state is a dead end.
    fn step(&mut self, state: &State) -> Vec<(NodeId, Vec<Obligation>, usize)> {
        for rule in self.config.rule_order.clone() {
            let fired = match rule {
                Rule::Decompose => self.rule_decompose(state),
                Rule::Existential => self.rule_existential(state),
                Rule::Universal => self.rule_universal(state),
                Rule::Semantic => self.rule_semantic(state),
                Rule::Guided => self.rule_guided(state),
                Rule::Free => self.rule_free(state),
            };
            if let Some(successors) = fired {
                trace!("rule {:?} fired with {} successors", rule, successors.len());
                return successors;
            }
        }
        debug!("no rule applicable, dead end");
        Vec::new()
    }

    // -- rule 1: decomposition ---------------------------------------------

    fn rule_decompose(&mut self, state: &State) -> Option<Vec<(NodeId, Vec<Obligation>, usize)>> {
        for (i, obligation) in state.obligations.iter().enumerate() {
            match &obligation.formula {
                Formula::And(_) => {
                    let mut obligations = without(&state.obligations, i);
                    obligations.extend(conjunct_obligations(
                        obligation.formula.clone(),
                        &obligation.env,
                    ));
                    return Some(vec![(state.root, obligations, state.free_used)]);
                }
                Formula::Or(items) => {
                    // One successor per disjunct.
                    let mut successors = Vec::new();
                    for item in items {
                        let mut obligations = without(&state.obligations, i);
                        obligations.extend(conjunct_obligations(item.clone(), &obligation.env));
                        successors.push((state.root, obligations, state.free_used));
                    }
                    return Some(successors);
                }
                Formula::Structural(atom) => {
                    let holds = self.eval_structural(state.root, atom, &obligation.env);
                    return Some(match holds {
                        Some(true) => {
                            vec![(state.root, without(&state.obligations, i), state.free_used)]
                        }
                        Some(false) | None => {
                            debug!("structural atom {} refuted, pruning", obligation.formula);
                            vec![]
                        }
                    });
                }
                _ => {}
            }
        }
        None
    }

    fn eval_structural(
        &self,
        root: NodeId,
        atom: &crate::formula::StructuralAtom,
        env: &Env,
    ) -> Option<bool> {
        let predicate = self.predicates.structural(&atom.name)?;
        let mut paths = Vec::with_capacity(atom.args.len());
        for arg in &atom.args {
            let node = *env.get(&arg.name)?;
            paths.push(self.arena.path_of(root, node)?);
        }
        Some(predicate.evaluate(&self.arena, root, &paths) != atom.negated)
    }

    // -- rule 2: existential discharge -------------------------------------

    fn rule_existential(&mut self, state: &State) -> Option<Vec<(NodeId, Vec<Obligation>, usize)>> {
        for (i, obligation) in state.obligations.iter().enumerate() {
            let Formula::Exists(q) = &obligation.formula else {
                continue;
            };
            let Some(&in_node) = obligation.env.get(&q.in_var.name) else {
                continue;
            };

            let matches = raw_matches(&self.arena, in_node, &q.bound.sort, q.pattern.as_ref());
            if !matches.is_empty() {
                // Disjunction over the current matches.
                let mut successors = Vec::new();
                for (node, holes) in matches {
                    let mut obligations = without(&state.obligations, i);
                    obligations.extend(instantiate_body(q, &obligation.env, node, &holes));
                    successors.push((state.root, obligations, state.free_used));
                }
                debug!(
                    "existential {} discharged against {} matches",
                    obligation.formula,
                    successors.len()
                );
                return Some(successors);
            }

            let insertions = self.insertions_for(state.root, q, &obligation.env);
            if insertions.is_empty() {
                // The rule does not fire for this obligation; expansion may
                // still create matches later.
                continue;
            }
            debug!(
                "existential {} discharged by {} insertions",
                obligation.formula,
                insertions.len()
            );
            let mut successors = Vec::new();
            for insertion in insertions {
                let mut obligations = remap(&without(&state.obligations, i), &insertion.spine);
                let env = remap_env(&obligation.env, &insertion.spine);
                obligations.extend(instantiate_body(q, &env, insertion.bound, &insertion.holes));
                successors.push((insertion.root, obligations, state.free_used));
            }
            return Some(successors);
        }
        None
    }

    // -- rule 3: universal instantiation -----------------------------------

    fn rule_universal(&mut self, state: &State) -> Option<Vec<(NodeId, Vec<Obligation>, usize)>> {
        let mut fired = false;
        let mut obligations: Vec<Obligation> = Vec::with_capacity(state.obligations.len());
        let mut instantiated: Vec<Obligation> = Vec::new();

        for obligation in &state.obligations {
            let Formula::Forall(q) = &obligation.formula else {
                obligations.push(obligation.clone());
                continue;
            };
            let Some(&in_node) = obligation.env.get(&q.in_var.name) else {
                obligations.push(obligation.clone());
                continue;
            };

            let mut matched = q.matched.clone();
            for (node, holes) in
                raw_matches(&self.arena, in_node, &q.bound.sort, q.pattern.as_ref())
            {
                let ident = self.arena.ident(node);
                if matched.insert(ident) {
                    trace!("universal match at {} (ident {})", node, ident);
                    instantiated.extend(instantiate_body(q, &obligation.env, node, &holes));
                    fired = true;
                }
            }

            if self.arena.is_complete(in_node) {
                // No further matches can appear: the quantifier is spent.
                fired = true;
            } else {
                let mut q = q.clone();
                q.matched = matched;
                obligations.push(Obligation {
                    formula: Formula::Forall(q),
                    env: obligation.env.clone(),
                });
            }
        }

        if !fired {
            return None;
        }
        obligations.extend(instantiated);
        Some(vec![(state.root, obligations, state.free_used)])
    }

    // -- rule 4: semantic solving ------------------------------------------

    fn rule_semantic(&mut self, state: &State) -> Option<Vec<(NodeId, Vec<Obligation>, usize)>> {
        // Semantic predicates first: they may request tree edits.
        for (i, obligation) in state.obligations.iter().enumerate() {
            let Formula::Semantic(atom) = &obligation.formula else {
                continue;
            };
            let mut args = Vec::with_capacity(atom.args.len());
            for arg in &atom.args {
                match arg {
                    SemArg::Var(v) => match obligation.env.get(&v.name) {
                        Some(&node) => args.push(SemInst::Node(node)),
                        None => return Some(vec![]),
                    },
                    SemArg::Text(text) => args.push(SemInst::Text(Rc::clone(text))),
                }
            }
            let predicate = self.predicates.semantic(&atom.name)?;
            match predicate.evaluate(&self.arena, &self.grammar, &args) {
                SemPredResult::True => {
                    if atom.negated {
                        debug!("semantic atom {} refuted, pruning", obligation.formula);
                        return Some(vec![]);
                    }
                    return Some(vec![(
                        state.root,
                        without(&state.obligations, i),
                        state.free_used,
                    )]);
                }
                SemPredResult::False => {
                    if !atom.negated {
                        debug!("semantic atom {} refuted, pruning", obligation.formula);
                        return Some(vec![]);
                    }
                    return Some(vec![(
                        state.root,
                        without(&state.obligations, i),
                        state.free_used,
                    )]);
                }
                SemPredResult::NotReady => {}
                SemPredResult::Bind { node, value } => {
                    if atom.negated {
                        // A negated binding request has no single witness;
                        // wait for the region to close.
                        continue;
                    }
                    let sort = self.arena.symbol(node).text().to_string();
                    let Some(parsed) = parse_into(&mut self.arena, &self.grammar, &sort, &value)
                    else {
                        debug!(
                            "semantic binding {:?} not derivable from <{}>, pruning",
                            value, sort
                        );
                        return Some(vec![]);
                    };
                    let path = self.arena.path_of(state.root, node)?;
                    let (root, spine) = self.arena.replace(state.root, &path, parsed);
                    let obligations = remap(&without(&state.obligations, i), &spine);
                    return Some(vec![(root, obligations, state.free_used)]);
                }
            }
        }

        // Batch all ready SMT atoms into one query. An atom only joins the
        // batch when every one of its variables is bound to a closed
        // subtree (ground) or an open leaf (a free query variable).
        let mut ready: Vec<usize> = Vec::new();
        let mut asserts: Vec<StringAtom> = Vec::new();
        let mut free: BTreeMap<NodeId, (Rc<str>, Rc<str>)> = BTreeMap::new();
        for (i, obligation) in state.obligations.iter().enumerate() {
            let Formula::Smt(atom) = &obligation.formula else {
                continue;
            };
            let mut staged = free.clone();
            let Some(rewritten) = self.rewrite_atom(atom, &obligation.env, &mut staged) else {
                continue;
            };
            free = staged;
            ready.push(i);
            asserts.push(rewritten);
        }
        if ready.is_empty() {
            return None;
        }

        let mut decls: Vec<VarDecl> = Vec::with_capacity(free.len());
        let mut targets: Vec<(NodeId, Rc<str>, Rc<str>)> = Vec::with_capacity(free.len());
        for (&node, (name, sort)) in &free {
            let samples = sample_strings(&self.grammar, sort, 8);
            decls.push(VarDecl::new(Rc::clone(name), Rc::clone(sort), samples));
            targets.push((node, Rc::clone(sort), Rc::clone(name)));
        }

        if decls.is_empty() {
            // Fully ground: a single confirm/refute query.
            let query = SmtQuery {
                decls,
                asserts,
                exclude: vec![],
            };
            return Some(match self.smt.solve(&query) {
                SmtResponse::Model(_) => {
                    let obligations = without_many(&state.obligations, &ready);
                    vec![(state.root, obligations, state.free_used)]
                }
                SmtResponse::Unsat | SmtResponse::Unknown => {
                    debug!("ground smt batch refuted, pruning");
                    vec![]
                }
            });
        }

        let mut successors = Vec::new();
        let mut exclude: Vec<Model> = Vec::new();
        for round in 0..self.config.max_smt_instantiations {
            let query = SmtQuery {
                decls: decls.clone(),
                asserts: asserts.clone(),
                exclude: exclude.clone(),
            };
            let model = match self.smt.solve(&query) {
                SmtResponse::Model(model) => model,
                SmtResponse::Unsat => {
                    debug!("smt batch unsat after {} models", round);
                    break;
                }
                SmtResponse::Unknown => {
                    debug!("smt batch unknown after {} models", round);
                    break;
                }
            };
            exclude.push(model.clone());

            if let Some(successor) = self.graft_model(state, &ready, &targets, &model) {
                successors.push(successor);
            }
        }
        Some(successors)
    }

    /// Rewrite an atom for the batch query: variables over closed subtrees
    /// become literals, variables over open leaves become query variables
    /// named by the leaf's ident. Returns `None` when some variable is
    /// bound to a partially expanded subtree (not ready; guided expansion
    /// will close it).
    fn rewrite_atom(
        &self,
        atom: &StringAtom,
        env: &Env,
        free: &mut BTreeMap<NodeId, (Rc<str>, Rc<str>)>,
    ) -> Option<StringAtom> {
        let mut assignment = Model::new();
        for name in atom.variables() {
            let &node = env.get(&name)?;
            if self.arena.is_complete(node) {
                assignment.insert(name, self.arena.render(node));
            } else if self.arena.is_open_leaf(node) {
                let query_name: Rc<str> = Rc::from(format!("s{}", self.arena.ident(node)));
                let sort = match self.arena.symbol(node) {
                    Symbol::Nonterminal(sort) => Rc::clone(sort),
                    Symbol::Terminal(_) => return None,
                };
                free.entry(node).or_insert((Rc::clone(&query_name), sort));
                // Not a value binding: rename below.
            } else {
                return None;
            }
        }
        // Substitute closed values, then rename open variables.
        let substituted = atom.substitute(&assignment);
        Some(self.rename_open(&substituted, env, free))
    }

    fn rename_open(
        &self,
        atom: &StringAtom,
        env: &Env,
        free: &BTreeMap<NodeId, (Rc<str>, Rc<str>)>,
    ) -> StringAtom {
        let rename = |term: &StringTerm| -> StringTerm {
            rename_term(term, &|name| {
                let node = env.get(name)?;
                free.get(node).map(|(query_name, _)| Rc::clone(query_name))
            })
        };
        match atom {
            StringAtom::Eq(a, b) => StringAtom::Eq(rename(a), rename(b)),
            StringAtom::Ne(a, b) => StringAtom::Ne(rename(a), rename(b)),
        }
    }

    /// Build the successor for one model: parse each value under its
    /// variable's sort and graft it at the open leaf. An un-derivable value
    /// discards the whole model.
    fn graft_model(
        &mut self,
        state: &State,
        discharged: &[usize],
        targets: &[(NodeId, Rc<str>, Rc<str>)],
        model: &Model,
    ) -> Option<(NodeId, Vec<Obligation>, usize)> {
        let mut root = state.root;
        let mut obligations = without_many(&state.obligations, discharged);
        for (node, sort, name) in targets {
            let value = model.get(name)?;
            let Some(parsed) = parse_into(&mut self.arena, &self.grammar, sort, value) else {
                debug!(
                    "model value {:?} not derivable from <{}>, discarding model",
                    value, sort
                );
                return None;
            };
            let path = self.arena.path_of(root, *node)?;
            let (new_root, spine) = self.arena.replace(root, &path, parsed);
            root = new_root;
            obligations = remap(&obligations, &spine);
        }
        Some((root, obligations, state.free_used))
    }

    // -- rule 5: guided expansion ------------------------------------------

    fn rule_guided(&mut self, state: &State) -> Option<Vec<(NodeId, Vec<Obligation>, usize)>> {
        let mut target: Option<Path> = None;
        for obligation in &state.obligations {
            let blocked = self.blocked_leaves(state.root, obligation);
            if let Some(path) = blocked.into_iter().next() {
                target = Some(path);
                break;
            }
        }
        let path = target?;
        let leaf = self.arena.subtree(state.root, &path)?;
        let name = self.arena.symbol(leaf).text().to_string();

        let mut successors = Vec::new();
        for alt in 0..self.grammar.alternatives(&name).len() {
            let (root, spine) = self.arena.expand(state.root, &path, &self.grammar, alt);
            successors.push((root, remap(&state.obligations, &spine), state.free_used));
        }
        debug!(
            "guided expansion of <{}> at {:?}: {} alternatives",
            name,
            path,
            successors.len()
        );
        Some(successors)
    }

    /// Open leaves (paths below `root`, preorder) that `obligation` is
    /// blocked on: leaves that must be expanded before the obligation can
    /// make progress.
    fn blocked_leaves(&self, root: NodeId, obligation: &Obligation) -> Vec<Path> {
        let mut out = Vec::new();
        self.collect_blocked(root, &obligation.formula, &obligation.env, &mut out);
        out.sort();
        out.dedup();
        out
    }

    fn collect_blocked(&self, root: NodeId, formula: &Formula, env: &Env, out: &mut Vec<Path>) {
        match formula {
            Formula::Smt(atom) => {
                for name in atom.variables() {
                    let Some(&node) = env.get(&name) else {
                        continue;
                    };
                    // Open-leaf variables are solved, not expanded; the
                    // blocked case is a partially expanded subtree.
                    if !self.arena.is_open_leaf(node) && !self.arena.is_complete(node) {
                        self.push_open_leaves(root, node, None, out);
                    }
                }
            }
            Formula::Structural(_) => {}
            Formula::Semantic(atom) => {
                for arg in &atom.args {
                    if let SemArg::Var(v) = arg {
                        let Some(&node) = env.get(&v.name) else {
                            continue;
                        };
                        if !self.arena.is_open_leaf(node) && !self.arena.is_complete(node) {
                            self.push_open_leaves(root, node, None, out);
                        }
                    }
                }
            }
            Formula::Forall(q) | Formula::Exists(q) => {
                let Some(&in_node) = env.get(&q.in_var.name) else {
                    return;
                };
                self.push_open_leaves(root, in_node, Some(&q.bound.sort), out);
            }
            Formula::Or(items) | Formula::And(items) => {
                for item in items {
                    self.collect_blocked(root, item, env, out);
                }
            }
            Formula::Not(inner) => self.collect_blocked(root, inner, env, out),
        }
    }

    /// Append the paths (relative to `root`) of open leaves below `node`;
    /// with `sort` given, only leaves from which `sort` is derivable.
    fn push_open_leaves(&self, root: NodeId, node: NodeId, sort: Option<&str>, out: &mut Vec<Path>) {
        let Some(base) = self.arena.path_of(root, node) else {
            return;
        };
        for (sub, leaf) in self.arena.open_leaves(node) {
            let leaf_sort = self.arena.symbol(leaf).text();
            if sort.map_or(true, |sort| self.grammar.derives(leaf_sort, sort)) {
                let mut path = base.clone();
                path.extend(sub);
                out.push(path);
            }
        }
    }

    // -- rule 6: bounded free instantiation --------------------------------

    fn rule_free(&mut self, state: &State) -> Option<Vec<(NodeId, Vec<Obligation>, usize)>> {
        let constrained = self.constrained_leaf_ids(state.root, &state.obligations);

        let mut root = state.root;
        let mut obligations = state.obligations.clone();
        let mut free_used = state.free_used;
        let mut expanded = false;
        loop {
            let next = self
                .arena
                .open_leaves(root)
                .into_iter()
                .find(|&(_, leaf)| !constrained.contains(&self.arena.ident(leaf)));
            let Some((path, leaf)) = next else {
                break;
            };
            if free_used == self.config.max_free_instantiations {
                debug!(
                    "free instantiation budget ({}) exhausted, pruning",
                    self.config.max_free_instantiations
                );
                return Some(vec![]);
            }
            let name = self.arena.symbol(leaf).text().to_string();
            let alt = self.expander.choose(&self.grammar, &name);
            let (new_root, spine) = self.arena.expand(root, &path, &self.grammar, alt);
            root = new_root;
            obligations = remap(&obligations, &spine);
            free_used += 1;
            expanded = true;
        }

        if !expanded {
            return None;
        }
        Some(vec![(root, obligations, free_used)])
    }

    /// Idents of open leaves some obligation cares about: blocked leaves
    /// plus leaves referenced directly as SMT or semantic variables.
    fn constrained_leaf_ids(&self, root: NodeId, obligations: &[Obligation]) -> BTreeSet<u64> {
        let mut out = BTreeSet::new();
        for obligation in obligations {
            for path in self.blocked_leaves(root, obligation) {
                if let Some(node) = self.arena.subtree(root, &path) {
                    out.insert(self.arena.ident(node));
                }
            }
            self.collect_referenced_leaves(&obligation.formula, &obligation.env, &mut out);
        }
        out
    }

    fn collect_referenced_leaves(&self, formula: &Formula, env: &Env, out: &mut BTreeSet<u64>) {
        let mut reference = |name: &Rc<str>| {
            if let Some(&node) = env.get(name) {
                if self.arena.is_open_leaf(node) {
                    out.insert(self.arena.ident(node));
                }
            }
        };
        match formula {
            Formula::Smt(atom) => {
                for name in atom.variables() {
                    reference(&name);
                }
            }
            Formula::Semantic(atom) => {
                for arg in &atom.args {
                    if let SemArg::Var(v) = arg {
                        reference(&v.name);
                    }
                }
            }
            Formula::Structural(_) => {}
            // Quantifier regions are handled through blocked leaves: leaves
            // that can produce matches are guided, all others are free to
            // default-expand (a vacuous universal must not pin its region
            // open forever).
            Formula::Forall(_) | Formula::Exists(_) => {}
            Formula::Or(items) | Formula::And(items) => {
                for item in items {
                    self.collect_referenced_leaves(item, env, out);
                }
            }
            Formula::Not(inner) => self.collect_referenced_leaves(inner, env, out),
        }
    }

    // -- constructive insertion --------------------------------------------

    /// Candidate insertions discharging `exists <A> x [= pattern] in T`:
    /// either grafting a synthesized subtree below an open leaf that
    /// derives `A`, or self-embedding an existing node of a recursive
    /// nonterminal to make room. At most [`MAX_INSERTIONS`] candidates, in
    /// preorder.
    fn insertions_for(&mut self, root: NodeId, q: &Quantified, env: &Env) -> Vec<Insertion> {
        let Some(&in_node) = env.get(&q.in_var.name) else {
            return Vec::new();
        };
        let Some(in_path) = self.arena.path_of(root, in_node) else {
            return Vec::new();
        };
        let sort: &str = &q.bound.sort;
        let mut out = Vec::new();

        // (a) Open leaves that derive the wanted sort.
        for (sub, leaf) in self.arena.open_leaves(in_node) {
            if out.len() >= MAX_INSERTIONS {
                return out;
            }
            let leaf_sort = self.arena.symbol(leaf).text().to_string();
            if !self.grammar.derives(&leaf_sort, sort) {
                continue;
            }
            let Some((synthesized, holes)) = self.synthesize(q) else {
                return out;
            };
            let child = if leaf_sort == sort {
                synthesized
            } else {
                match self
                    .arena
                    .materialize_chain(&self.grammar, &leaf_sort, sort, synthesized)
                {
                    Some(child) => child,
                    None => continue,
                }
            };
            let mut path = in_path.clone();
            path.extend(sub);
            let (new_root, spine) = self.arena.replace(root, &path, child);
            out.push(Insertion {
                root: new_root,
                spine,
                bound: synthesized,
                holes,
            });
        }

        // (b) Self-embedding of a recursive nonterminal.
        for (sub, node) in self.arena.paths(in_node) {
            if out.len() >= MAX_INSERTIONS {
                return out;
            }
            let Symbol::Nonterminal(name) = self.arena.symbol(node).clone() else {
                continue;
            };
            if self.arena.is_open_leaf(node) {
                continue;
            }
            let alternatives = self.grammar.alternatives(&name).to_vec();
            for alternative in alternatives {
                if out.len() >= MAX_INSERTIONS {
                    return out;
                }
                // A slot to re-home the current subtree...
                let host = alternative
                    .symbols
                    .iter()
                    .position(|s| matches!(s, Symbol::Nonterminal(n) if n == &name));
                let Some(host) = host else {
                    continue;
                };
                // ...and a different slot that derives the wanted sort.
                let slot = alternative.symbols.iter().enumerate().position(|(j, s)| {
                    j != host
                        && matches!(s, Symbol::Nonterminal(n) if self.grammar.derives(n, sort))
                });
                let Some(slot) = slot else {
                    continue;
                };

                let Some((synthesized, holes)) = self.synthesize(q) else {
                    return out;
                };
                let mut children = Vec::with_capacity(alternative.symbols.len());
                let mut ok = true;
                for (j, symbol) in alternative.symbols.iter().enumerate() {
                    let child = if j == host {
                        node
                    } else if j == slot {
                        let slot_sort = symbol.text().to_string();
                        if slot_sort == sort {
                            synthesized
                        } else {
                            match self.arena.materialize_chain(
                                &self.grammar,
                                &slot_sort,
                                sort,
                                synthesized,
                            ) {
                                Some(child) => child,
                                None => {
                                    ok = false;
                                    break;
                                }
                            }
                        }
                    } else {
                        match symbol {
                            Symbol::Terminal(text) => {
                                let text = text.to_string();
                                self.arena.leaf(&text)
                            }
                            Symbol::Nonterminal(child_name) => {
                                let child_name = child_name.to_string();
                                self.arena.open(&child_name)
                            }
                        }
                    };
                    children.push(child);
                }
                if !ok {
                    continue;
                }
                let embedded = self.arena.inner(&name, children);
                let mut path = in_path.clone();
                path.extend(sub.clone());
                let (new_root, spine) = self.arena.replace(root, &path, embedded);
                out.push(Insertion {
                    root: new_root,
                    spine,
                    bound: synthesized,
                    holes,
                });
            }
        }

        out
    }

    /// The minimal subtree realizing the existential: the pattern's tree
    /// prefix, or a single open leaf of the bound sort.
    fn synthesize(&mut self, q: &Quantified) -> Option<(NodeId, Vec<(Rc<str>, NodeId)>)> {
        match &q.pattern {
            None => Some((self.arena.open(&q.bound.sort), Vec::new())),
            Some(pattern) => {
                let (node, hole_paths) =
                    pattern.tree_prefix(&mut self.arena, &self.grammar, &q.bound.sort)?;
                let holes = hole_paths
                    .into_iter()
                    .filter_map(|(name, path)| {
                        self.arena.subtree(node, &path).map(|hole| (name, hole))
                    })
                    .collect();
                Some((node, holes))
            }
        }
    }
}

/// One insertion candidate.
struct Insertion {
    root: NodeId,
    spine: SpineMap,
    /// The node the existential's bound variable binds to.
    bound: NodeId,
    holes: Vec<(Rc<str>, NodeId)>,
}

/// Iterator over [`Solver::next_solution`].
pub struct Solutions<'a> {
    solver: &'a mut Solver,
}

impl Iterator for Solutions<'_> {
    type Item = Solution;

    fn next(&mut self) -> Option<Self::Item> {
        self.solver.next_solution()
    }
}

// -- helpers ----------------------------------------------------------------

fn conjunct_obligations(formula: Formula, env: &Env) -> Vec<Obligation> {
    formula
        .into_conjuncts()
        .into_iter()
        .map(|conjunct| Obligation {
            formula: conjunct,
            env: env.clone(),
        })
        .collect()
}

fn instantiate_body(
    q: &Quantified,
    env: &Env,
    node: NodeId,
    holes: &[(Rc<str>, NodeId)],
) -> Vec<Obligation> {
    let mut extended = env.clone();
    extended.insert(Rc::clone(&q.bound.name), node);
    for (name, hole) in holes {
        extended.insert(Rc::clone(name), *hole);
    }
    conjunct_obligations(q.body.clone(), &extended)
}

fn without(obligations: &[Obligation], index: usize) -> Vec<Obligation> {
    obligations
        .iter()
        .enumerate()
        .filter(|&(i, _)| i != index)
        .map(|(_, o)| o.clone())
        .collect()
}

fn without_many(obligations: &[Obligation], indices: &[usize]) -> Vec<Obligation> {
    obligations
        .iter()
        .enumerate()
        .filter(|(i, _)| !indices.contains(i))
        .map(|(_, o)| o.clone())
        .collect()
}

fn remap(obligations: &[Obligation], spine: &SpineMap) -> Vec<Obligation> {
    obligations
        .iter()
        .map(|obligation| Obligation {
            formula: obligation.formula.clone(),
            env: remap_env(&obligation.env, spine),
        })
        .collect()
}

fn remap_env(env: &Env, spine: &SpineMap) -> Env {
    env.iter()
        .map(|(name, &node)| (Rc::clone(name), spine.resolve(node)))
        .collect()
}

fn rename_term(term: &StringTerm, rename: &dyn Fn(&Rc<str>) -> Option<Rc<str>>) -> StringTerm {
    match term {
        StringTerm::Lit(_) => term.clone(),
        StringTerm::Var(name) => match rename(name) {
            Some(new_name) => StringTerm::Var(new_name),
            None => term.clone(),
        },
        StringTerm::Concat(terms) => StringTerm::Concat(
            terms
                .iter()
                .map(|inner| rename_term(inner, rename))
                .collect(),
        ),
    }
}

#[cfg(test)]
mod tests {
    use test_log::test;

    use super::*;
    use crate::formula::{exists, forall, smt_eq};
    use crate::grammar::assignment_grammar;

    fn solver_for(formula: Formula) -> Solver {
        Solver::new(assignment_grammar(), formula, SolverConfig::default()).unwrap()
    }

    #[test]
    fn test_config_validation() {
        let config = SolverConfig {
            max_free_instantiations: 0,
            ..SolverConfig::default()
        };
        assert_eq!(
            config.validate(),
            Err(ConfigError::ZeroOption("max_free_instantiations"))
        );

        let config = SolverConfig {
            rule_order: vec![Rule::Free],
            ..SolverConfig::default()
        };
        assert_eq!(config.validate(), Err(ConfigError::IncompleteRuleOrder));
    }

    #[test]
    fn test_invalid_formula_rejected() {
        let grammar = assignment_grammar();
        let loose = Variable::new("loose", "var");
        let formula = smt_eq(StringTerm::var(&loose), StringTerm::lit("x"));
        assert!(Solver::new(grammar, formula, SolverConfig::default()).is_err());
    }

    #[test]
    fn test_simple_universal() {
        let v = Variable::new("v", "var");
        let top = Variable::new("start", "start");
        let formula = forall(
            v.clone(),
            top,
            smt_eq(StringTerm::var(&v), StringTerm::lit("x")),
        );
        let mut solver = solver_for(formula);

        for _ in 0..5 {
            let solution = solver.next_solution().expect("expected a solution");
            // Every <var> in the solution is "x".
            for c in solution.text.chars() {
                assert!(!"yz".contains(c), "unexpected var in {:?}", solution.text);
            }
        }
    }

    #[test]
    fn test_simple_existential_insertion() {
        let v = Variable::new("v", "var");
        let top = Variable::new("start", "start");
        let formula = exists(
            v.clone(),
            top,
            smt_eq(StringTerm::var(&v), StringTerm::lit("y")),
        );
        let mut solver = solver_for(formula);
        let solution = solver.next_solution().expect("expected a solution");
        assert!(solution.text.contains('y'), "got {:?}", solution.text);
    }

    #[test]
    fn test_determinism() {
        let build = || {
            let v = Variable::new("v", "var");
            let top = Variable::new("start", "start");
            let formula = forall(
                v.clone(),
                top,
                smt_eq(StringTerm::var(&v), StringTerm::lit("x")),
            );
            let mut solver = solver_for(formula);
            (0..5)
                .map(|_| solver.next_solution().unwrap().text)
                .collect::<Vec<_>>()
        };
        assert_eq!(build(), build());
    }

    #[test]
    fn test_unsatisfiable_exhausts_without_error() {
        // A one-character sort can never equal a two-character literal;
        // every branch is pruned and the sequence reports exhaustion.
        let v = Variable::new("v", "var");
        let top = Variable::new("start", "start");
        let formula = forall(
            v.clone(),
            top,
            smt_eq(StringTerm::var(&v), StringTerm::lit("xy")),
        );
        let mut solver = solver_for(formula);
        assert!(solver.next_solution().is_none());
        assert!(matches!(solver.advance(), Progress::Exhausted));
    }

    #[test]
    fn test_solution_roots_are_complete() {
        let v = Variable::new("v", "var");
        let top = Variable::new("start", "start");
        let formula = forall(
            v.clone(),
            top,
            smt_eq(StringTerm::var(&v), StringTerm::lit("z")),
        );
        let mut solver = solver_for(formula);
        let solution = solver.next_solution().unwrap();
        assert!(solver.arena().is_complete(solution.root));
        assert_eq!(solver.arena().render(solution.root), solution.text);
    }
}
