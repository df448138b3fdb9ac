use good_lp::*;
use log::*;

use crate::{util::HashMap, Analysis, AstSize, EGraph, Error, Id, Language, RecExpr};

/// A cost function to be used by an [`LpExtractor`].
///
/// Costs are plain `f64` weights on individual enodes; the objective is the
/// weighted sum of the *selected* nodes, so additivity is built into the
/// formulation rather than the trait.
pub trait LpCostFunction<L: Language, N: Analysis<L>> {
    /// Returns the cost of the given enode.
    ///
    /// This function may look at other parts of the egraph to compute the
    /// cost of the given enode.
    fn node_cost(&mut self, egraph: &EGraph<L, N>, eclass: Id, enode: &L) -> f64;
}

impl<L: Language, N: Analysis<L>> LpCostFunction<L, N> for AstSize {
    fn node_cost(&mut self, _egraph: &EGraph<L, N>, _eclass: Id, _enode: &L) -> f64 {
        1.0
    }
}

/** Extracts a single expression from an [`EGraph`] by solving a boolean
selection problem, for the cases where per-class greedy minimization is
unsound because choices share a global resource.

The formulation has one binary selection variable per candidate enode and
an activation plus an ordering variable per class:

- an active class has exactly one member selected;
- a selected node forces each of its children's classes active, so the
  selection is consistent along the edges actually used;
- big-M ordering constraints forbid cyclic selections;
- each [resource limit](LpExtractor::add_resource_limit) contributes one
  linear inequality over the nodes that consume it;
- the objective minimizes the weighted sum of selected node costs.

The problem is handed to a [`good_lp`] backend: [`LpExtractor::solve`]
uses the crate's default solver, and [`LpExtractor::solve_with`] accepts
any other [`good_lp::Solver`], so the engine stays agnostic to the solver
technology. Infeasibility and timeouts come back as the recoverable
[`Error::Infeasible`] / [`Error::SolveTimeout`] rather than panics.
*/
pub struct LpExtractor<'a, L: Language, N: Analysis<L>> {
    egraph: &'a EGraph<L, N>,
    problem: good_lp::variable::UnsolvedProblem,
    vars: HashMap<Id, ClassVars>,
    /// Each entry is one resource row: per-(class, node index) usage plus
    /// the budget the selected usages must stay under.
    limits: Vec<(HashMap<(Id, usize), f64>, f64)>,
}

struct ClassVars {
    active: Variable,
    order: Variable,
    nodes: Vec<Variable>,
}

const MAX_ORDER: f64 = 1e9;

impl<'a, L, N> LpExtractor<'a, L, N>
where
    L: Language,
    N: Analysis<L>,
{
    /// Create an extractor over every class in the egraph.
    pub fn new<CF>(egraph: &'a EGraph<L, N>, cost_function: CF) -> Self
    where
        CF: LpCostFunction<L, N>,
    {
        let all: Vec<Id> = egraph.classes().map(|c| c.id).collect();
        Self::over_classes(egraph, cost_function, all)
    }

    /// Create an extractor restricted to the classes reachable from
    /// `roots`, pruning dead speculative candidates from the problem.
    pub fn rooted<CF>(egraph: &'a EGraph<L, N>, cost_function: CF, roots: &[Id]) -> Self
    where
        CF: LpCostFunction<L, N>,
    {
        let live = egraph.reachable_from(roots);
        debug!(
            "constrained extraction over {} of {} classes",
            live.len(),
            egraph.number_of_classes()
        );
        Self::over_classes(egraph, cost_function, live)
    }

    fn over_classes<CF>(
        egraph: &'a EGraph<L, N>,
        mut cost_function: CF,
        classes: impl IntoIterator<Item = Id>,
    ) -> Self
    where
        CF: LpCostFunction<L, N>,
    {
        assert!(
            egraph.is_clean(),
            "egraph must be rebuilt before extraction"
        );
        let bool_kind = VariableDefinition::new().binary();
        let order_kind = VariableDefinition::new().min(0.0).max(MAX_ORDER);

        let mut problem_vars = ProblemVariables::default();
        let vars: HashMap<Id, ClassVars> = classes
            .into_iter()
            .map(|id| {
                let class = &egraph[id];
                let cvars = ClassVars {
                    active: problem_vars.add(bool_kind.clone()),
                    order: problem_vars.add(order_kind.clone()),
                    nodes: problem_vars.add_vector(bool_kind.clone(), class.len()),
                };
                (class.id, cvars)
            })
            .collect();

        // cost is the weighted sum of the selected nodes
        let mut cost: Expression = 0.into();
        for (&id, cvars) in &vars {
            for (node, &node_active) in egraph[id].iter().zip(&cvars.nodes) {
                cost += node_active * cost_function.node_cost(egraph, id, node);
            }
        }

        let problem = problem_vars.minimise(cost);

        Self {
            egraph,
            problem,
            vars,
            limits: vec![],
        }
    }

    /// Adds one linear resource constraint: the sum of `usage` over all
    /// selected nodes must stay at or under `budget`.
    ///
    /// Call once per bounded resource; the placement pass calls this once
    /// per device with that device's memory budget.
    pub fn add_resource_limit<F>(&mut self, mut usage: F, budget: f64) -> &mut Self
    where
        F: FnMut(&EGraph<L, N>, Id, &L) -> f64,
    {
        let mut row = HashMap::default();
        for &id in self.vars.keys() {
            for (i, node) in self.egraph[id].iter().enumerate() {
                let u = usage(self.egraph, id, node);
                if u != 0.0 {
                    row.insert((id, i), u);
                }
            }
        }
        self.limits.push((row, budget));
        self
    }

    /// Extract a single expression rooted at each of `roots` using the
    /// default solver backend.
    pub fn solve(self, roots: &[Id]) -> Result<(RecExpr<L>, Vec<Id>), Error> {
        self.solve_with(roots, good_lp::default_solver)
    }

    /// Extract a single expression rooted at each of `roots` with a caller
    /// supplied solver backend.
    pub fn solve_with<S>(self, roots: &[Id], solver: S) -> Result<(RecExpr<L>, Vec<Id>), Error>
    where
        S: Solver,
        S::Model: SolverModel<Error = ResolutionError>,
    {
        let egraph = self.egraph;
        let roots: Vec<Id> = roots.iter().map(|&r| egraph.find(r)).collect();
        let mut model = self.problem.using(solver);

        for (&id, class_vars) in &self.vars {
            let active: Expression = class_vars.active.into();
            let sum_nodes: Expression = class_vars.nodes.iter().sum();

            let class_order: Expression = class_vars.order.into();

            // an active class selects exactly one of its nodes
            model.add_constraint(active.clone().leq(sum_nodes.clone()));
            model.add_constraint(sum_nodes.leq(active));

            for (node, &node_var) in egraph[id].iter().zip(&class_vars.nodes) {
                let node_active: Expression = node_var.into();
                for child in node.children() {
                    let child = egraph.find(*child);
                    // choosing a node implies choosing each child
                    model.add_constraint(node_active.clone().leq(self.vars[&child].active));
                    // and this node must be ordered before its children,
                    // which rules out cyclic selections
                    let child_order: Expression = self.vars[&child].order.into();
                    let left: Expression =
                        class_order.clone() + node_active.clone() * MAX_ORDER + 1.0;
                    let right: Expression = child_order + self.vars[&child].active * MAX_ORDER;
                    model.add_constraint(left.leq(right));
                }
            }
        }

        for (row, budget) in &self.limits {
            let mut used: Expression = 0.into();
            for (&(id, i), &u) in row {
                used += self.vars[&id].nodes[i] * u;
            }
            model.add_constraint(used.leq(*budget));
        }

        for root in &roots {
            let root = &self.vars[root];
            model.add_constraint(Expression::from(root.active).eq(1));
            model.add_constraint(Expression::from(root.order).eq(0));
        }

        let solution = model.solve().map_err(resolution_error)?;

        let mut active: Vec<(f64, Id, usize)> = vec![];
        for (&id, v) in &self.vars {
            if solution.value(v.active) > 0.5 {
                let order = solution.value(v.order);
                let node_idx = v
                    .nodes
                    .iter()
                    .position(|&n| solution.value(n) > 0.5)
                    .expect("an active class must have a selected node");
                active.push((order, id, node_idx))
            }
        }

        // children are constrained to higher order values, so sorting by
        // descending order puts them first
        active.sort_by(|a, b| b.0.partial_cmp(&a.0).expect("orders are finite"));

        let mut ids: HashMap<Id, Id> = HashMap::default();
        let mut expr = RecExpr::default();
        for (i, &(_, id, node_idx)) in active.iter().enumerate() {
            ids.insert(id, Id::from(i));
            let node = egraph[id].nodes[node_idx].clone();
            let node = node.map_children(|child| ids[&egraph.find(child)]);
            expr.add(node);
        }

        let root_idxs = roots.iter().map(|root| ids[root]).collect();
        Ok((expr, root_idxs))
    }
}

fn resolution_error(e: ResolutionError) -> Error {
    match e {
        ResolutionError::Infeasible => Error::Infeasible,
        ResolutionError::Unbounded => Error::Solver("the problem is unbounded".into()),
        ResolutionError::Other(msg) => {
            if msg.to_lowercase().contains("time") {
                Error::SolveTimeout
            } else {
                Error::Solver(msg.to_string())
            }
        }
        ResolutionError::Str(msg) => {
            if msg.to_lowercase().contains("time") {
                Error::SolveTimeout
            } else {
                Error::Solver(msg)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{CostFunction, Extractor, SymbolLang as S};

    #[test]
    fn simple_lp_extract() {
        let mut egraph = EGraph::<S, ()>::default();
        let a = egraph.add(S::leaf("a"));
        let plus = egraph.add(S::new("+", vec![a, a]));
        let f = egraph.add(S::new("f", vec![plus]));
        let g = egraph.add(S::new("g", vec![plus]));
        egraph.rebuild().unwrap();

        let ext = LpExtractor::new(&egraph, AstSize);
        let (exp, ids) = ext.solve(&[f, g]).unwrap();
        assert_eq!(exp.as_ref().len(), 4);
        assert_eq!(ids.len(), 2);
    }

    /// Per-node costs for the budget scenario below.
    struct OpCost;

    fn op_cost(node: &S) -> f64 {
        match node.op.as_str() {
            "s1" => 10.0,
            "s2" => 20.0,
            "w" => 5.0,
            _ => 1.0,
        }
    }

    fn op_memory(node: &S) -> f64 {
        match node.op.as_str() {
            "s1" => 100.0,
            "s2" => 40.0,
            "w" => 30.0,
            _ => 0.0,
        }
    }

    impl LpCostFunction<S, ()> for OpCost {
        fn node_cost(&mut self, _egraph: &EGraph<S, ()>, _eclass: Id, node: &S) -> f64 {
            op_cost(node)
        }
    }

    impl CostFunction<S> for OpCost {
        type Cost = ordered_float::NotNan<f64>;
        fn cost<C>(&mut self, node: &S, mut costs: C) -> Self::Cost
        where
            C: FnMut(Id) -> Self::Cost,
        {
            let base = ordered_float::NotNan::new(op_cost(node)).unwrap();
            node.fold(base, |sum, id| sum + costs(id))
        }
    }

    /// One value with a cheap-but-large and a costly-but-small candidate,
    /// another value with a fixed allocation, and a budget that only the
    /// small candidate fits under.
    fn budget_graph() -> (EGraph<S, ()>, Id) {
        let mut egraph = EGraph::<S, ()>::default();
        let s1 = egraph.add(S::leaf("s1"));
        let s2 = egraph.add(S::leaf("s2"));
        egraph.union(s1, s2).unwrap();
        let w = egraph.add(S::leaf("w"));
        let root = egraph.add(S::new("pair", vec![s1, w]));
        egraph.rebuild().unwrap();
        (egraph, root)
    }

    #[test]
    fn budget_forces_the_expensive_candidate() {
        crate::init_logger();
        let (egraph, root) = budget_graph();

        // per-class greedy minimization picks the cheap candidate and
        // blows the budget
        let greedy = Extractor::new(&egraph, OpCost).unwrap();
        let (_, expr) = greedy.find_best(root).unwrap();
        let greedy_usage: f64 = expr.as_ref().iter().map(op_memory).sum();
        assert!(expr.as_ref().iter().any(|n| n.op == "s1".into()));
        assert!(greedy_usage > 80.0);

        // the constrained extractor must switch v1 to the small candidate
        let mut ext = LpExtractor::new(&egraph, OpCost);
        ext.add_resource_limit(|_, _, node| op_memory(node), 80.0);
        let (expr, roots) = ext.solve(&[root]).unwrap();
        assert!(expr.as_ref().iter().any(|n| n.op == "s2".into()));
        assert!(expr.as_ref().iter().all(|n| n.op != "s1".into()));
        let usage: f64 = expr.as_ref().iter().map(op_memory).sum();
        assert!(usage <= 80.0);

        // the extracted program is still rooted at the pair
        assert_eq!(expr[roots[0]].op, "pair".into());
    }

    #[test]
    fn unsatisfiable_budget_is_infeasible() {
        let (egraph, root) = budget_graph();
        let mut ext = LpExtractor::new(&egraph, OpCost);
        ext.add_resource_limit(|_, _, node| op_memory(node), 10.0);
        match ext.solve(&[root]) {
            Err(Error::Infeasible) => {}
            other => panic!(
                "expected infeasibility, got {:?}",
                other.map(|(e, _)| e.to_string())
            ),
        }
    }

    #[test]
    fn solving_twice_is_deterministic() {
        let (egraph, root) = budget_graph();
        let solve = || {
            let mut ext = LpExtractor::new(&egraph, OpCost);
            ext.add_resource_limit(|_, _, node| op_memory(node), 80.0);
            let (expr, _) = ext.solve(&[root]).unwrap();
            expr.to_string()
        };
        assert_eq!(solve(), solve());
    }
}
