use log::*;

use crate::{
    util::{Duration, HashSet, IndexMap, Instant},
    Analysis, EGraph, Error, Id, Language, RecExpr, Rewrite,
};

/// Facilitates running rewrites over an [`EGraph`] to saturation.
///
/// Since an egraph never "forgets" state when applying a [`Rewrite`],
/// alternatives accumulate until the rules can no longer find new
/// equalities ("saturation") or a budget runs out; at that point the graph
/// compactly represents many equivalent programs and is ready for
/// extraction.
///
/// Each iteration runs three phases:
///
/// 1. *matching*: every rule is tested against the classes touched since
///    the previous iteration (all classes on the first one). This phase is
///    read-only.
/// 2. *applying*: each proposed candidate is added and unioned with its
///    matched class. All mutation is serialized here.
/// 3. *rebuilding*: [`EGraph::rebuild`] restores congruence.
///
/// The runner stops when an iteration performs no unions
/// ([`StopReason::Saturated`], observed through the egraph's version
/// counter) or when the iteration, node, or time budget is exhausted.
///
/// [`Runner`] is configured in the builder-pattern style:
///
/// ```
/// use eqsat::{Runner, SymbolLang};
/// let expr = {
///     let mut e = eqsat::RecExpr::default();
///     let x = e.add(SymbolLang::leaf("x"));
///     e.add(SymbolLang::new("f", vec![x]));
///     e
/// };
/// let runner = Runner::<SymbolLang, ()>::default()
///     .with_iter_limit(8)
///     .with_node_limit(1_000)
///     .with_expr(&expr)
///     .run(&[])
///     .unwrap();
/// assert!(matches!(
///     runner.stop_reason,
///     Some(eqsat::StopReason::Saturated)
/// ));
/// ```
pub struct Runner<L: Language, N: Analysis<L>> {
    /// The [`EGraph`] used.
    pub egraph: EGraph<L, N>,
    /// The roots of expressions added by
    /// [`with_expr`](Runner::with_expr), in insertion order.
    pub roots: Vec<Id>,
    /// Data accumulated over each [`Iteration`].
    pub iterations: Vec<Iteration>,
    /// Why the `Runner` stopped. `None` if it hasn't run yet.
    pub stop_reason: Option<StopReason>,

    // limits
    iter_limit: usize,
    node_limit: usize,
    time_limit: Duration,

    start_time: Option<Instant>,
}

impl<L, N> Default for Runner<L, N>
where
    L: Language,
    N: Analysis<L> + Default,
{
    fn default() -> Self {
        Runner::new(N::default())
    }
}

/// Why a [`Runner`] stopped.
#[derive(Debug, Clone)]
pub enum StopReason {
    /// The egraph saturated: an iteration performed no new unions, so the
    /// rules have nothing left to contribute.
    Saturated,
    /// The iteration limit was hit. The data is the iteration limit.
    IterationLimit(usize),
    /// The enode limit was hit. The data is the enode limit.
    NodeLimit(usize),
    /// The time limit was hit. The data is the time limit in seconds.
    TimeLimit(f64),
    /// Some other reason to stop.
    Other(String),
}

/// Data generated by running a [`Runner`] one iteration.
#[derive(Debug, Clone)]
#[non_exhaustive]
pub struct Iteration {
    /// The number of enodes in the egraph at the start of this iteration.
    pub egraph_nodes: usize,
    /// The number of eclasses in the egraph at the start of this iteration.
    pub egraph_classes: usize,
    /// A map from rule name to number of times it newly changed the egraph
    /// in this iteration.
    pub applied: IndexMap<String, usize>,
    /// Number of classes that were re-matched this iteration.
    pub matched_classes: usize,
    /// Number of congruence unions performed by the rebuild.
    pub rebuild_unions: usize,
    /// Seconds spent searching in this iteration.
    pub search_time: f64,
    /// Seconds spent applying rules in this iteration.
    pub apply_time: f64,
    /// Seconds spent rebuilding in this iteration.
    pub rebuild_time: f64,
}

impl<L, N> Runner<L, N>
where
    L: Language,
    N: Analysis<L>,
{
    /// Create a new `Runner` with the given analysis and default limits.
    pub fn new(analysis: N) -> Self {
        Self {
            iter_limit: 30,
            node_limit: 10_000,
            time_limit: Duration::from_secs(5),

            egraph: EGraph::new(analysis),
            roots: vec![],
            iterations: vec![],
            stop_reason: None,

            start_time: None,
        }
    }

    /// Sets the iteration limit. Default: 30
    pub fn with_iter_limit(self, iter_limit: usize) -> Self {
        Self { iter_limit, ..self }
    }

    /// Sets the egraph size limit (in enodes). Default: 10,000
    pub fn with_node_limit(self, node_limit: usize) -> Self {
        Self { node_limit, ..self }
    }

    /// Sets the runner time limit. Default: 5 seconds
    pub fn with_time_limit(self, time_limit: Duration) -> Self {
        Self { time_limit, ..self }
    }

    /// Add an expression to the egraph to be run.
    ///
    /// The eclass id of this addition will be recorded in the
    /// [`roots`](Runner::roots) field, ordered by insertion order.
    pub fn with_expr(mut self, expr: &RecExpr<L>) -> Self {
        let id = self.egraph.add_expr(expr);
        self.roots.push(id);
        self
    }

    /// Replace the [`EGraph`] of this `Runner`.
    pub fn with_egraph(self, egraph: EGraph<L, N>) -> Self {
        Self { egraph, ..self }
    }

    /// Run this `Runner` until it stops. After this, the
    /// [`stop_reason`](Runner::stop_reason) field is guaranteed to be set.
    ///
    /// A rule failure or a structural inconsistency (checked-type
    /// disagreement) is fatal and returned as an error; limits and
    /// saturation are ordinary stops.
    pub fn run(mut self, rules: &[&dyn Rewrite<L, N>]) -> Result<Self, Error> {
        check_rules(rules);
        self.egraph.rebuild()?;
        loop {
            if let Some(reason) = self.run_one(rules)? {
                info!("stopping: {:?}", reason);
                self.stop_reason = Some(reason);
                return Ok(self);
            }
        }
    }

    fn run_one(&mut self, rules: &[&dyn Rewrite<L, N>]) -> Result<Option<StopReason>, Error> {
        debug_assert!(self.stop_reason.is_none());
        let i = self.iterations.len();
        info!("iteration {}", i);

        self.start_time.get_or_insert_with(Instant::now);
        if let Some(reason) = self.check_limits() {
            return Ok(Some(reason));
        }

        let egraph_nodes = self.egraph.total_size();
        let egraph_classes = self.egraph.number_of_classes();
        let version_before = self.egraph.version();

        // matching: only classes touched since the last iteration can have
        // new matches, except on the first pass. A change deep in a term
        // can enable a match higher up, so the re-match set grows upward
        // through used-by edges.
        let dirty: Vec<Id> = {
            let drained = self.egraph.take_dirty();
            if i == 0 {
                self.egraph.classes().map(|c| c.id).collect()
            } else {
                let mut seen: HashSet<Id> = drained.iter().copied().collect();
                let mut worklist = drained;
                let mut out = vec![];
                while let Some(id) = worklist.pop() {
                    out.push(id);
                    for parent in self.egraph.parent_classes(id) {
                        if seen.insert(parent) {
                            worklist.push(parent);
                        }
                    }
                }
                out
            }
        };

        let search_start = Instant::now();
        let mut proposals = Vec::new();
        for &rule in rules {
            for &id in &dirty {
                if rule.matches(&self.egraph, id) {
                    let candidates = rule.propose(&self.egraph, id)?;
                    if !candidates.is_empty() {
                        proposals.push((rule.name().to_owned(), id, candidates));
                    }
                }
            }
        }
        let search_time = search_start.elapsed().as_secs_f64();

        // applying: commit all proposals serially
        let apply_start = Instant::now();
        let mut applied = IndexMap::default();
        for (name, id, candidates) in proposals {
            for candidate in candidates {
                let added = self.egraph.add_instantiation(&candidate);
                let (_, did_something) = self.egraph.union(id, added)?;
                if did_something {
                    *applied.entry(name.clone()).or_insert(0) += 1;
                }
            }
        }
        let apply_time = apply_start.elapsed().as_secs_f64();

        let rebuild_start = Instant::now();
        let rebuild_unions = self.egraph.rebuild()?;
        let rebuild_time = rebuild_start.elapsed().as_secs_f64();

        let saturated = self.egraph.version() == version_before;

        debug!(
            "iteration {}: {} classes matched, {:?} applied, {} rebuild unions",
            i,
            dirty.len(),
            applied,
            rebuild_unions
        );

        self.iterations.push(Iteration {
            egraph_nodes,
            egraph_classes,
            applied,
            matched_classes: dirty.len(),
            rebuild_unions,
            search_time,
            apply_time,
            rebuild_time,
        });

        Ok(saturated.then(|| StopReason::Saturated))
    }

    fn check_limits(&self) -> Option<StopReason> {
        let elapsed = self.start_time.unwrap().elapsed();
        if elapsed > self.time_limit {
            return Some(StopReason::TimeLimit(elapsed.as_secs_f64()));
        }

        let size = self.egraph.total_size();
        if size > self.node_limit {
            return Some(StopReason::NodeLimit(size));
        }

        if self.iterations.len() >= self.iter_limit {
            return Some(StopReason::IterationLimit(self.iterations.len()));
        }

        None
    }
}

fn check_rules<L: Language, N: Analysis<L>>(rules: &[&dyn Rewrite<L, N>]) {
    let mut name_counts: IndexMap<&str, usize> = IndexMap::default();
    for rule in rules {
        *name_counts.entry(rule.name()).or_default() += 1
    }

    name_counts.retain(|_, count| *count > 1);
    for (name, count) in name_counts {
        warn!("rule '{}' appears {} times", name, count);
    }
}
