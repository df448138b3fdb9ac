use log::*;
use ordered_float::NotNan;

use crate::{
    tensor::{infer_shape, node_flops},
    util::HashMap,
    CostFunction, EGraph, Error, Extractor, Id, Language, Layout, LpCostFunction, LpExtractor,
    RecExpr, Shape, ShapeAnalysis, Symbol, TensorLang,
};

/// One device of the target hardware, with its memory budget in bytes.
#[derive(Debug, Clone)]
pub struct Device {
    /// A name for diagnostics.
    pub name: Symbol,
    /// Memory budget in bytes.
    pub memory: f64,
}

/// The hardware topology a program is being placed onto.
#[derive(Debug, Clone)]
pub struct Topology {
    /// The participating devices.
    pub devices: Vec<Device>,
}

impl Topology {
    /// A topology of `n` identical devices, each with `memory` bytes.
    pub fn homogeneous(n: usize, memory: f64) -> Self {
        let devices = (0..n)
            .map(|i| Device {
                name: format!("dev{}", i).into(),
                memory,
            })
            .collect();
        Self { devices }
    }

    /// Number of devices.
    pub fn len(&self) -> usize {
        self.devices.len()
    }

    /// Whether the topology has no devices at all.
    pub fn is_empty(&self) -> bool {
        self.devices.is_empty()
    }

    /// The layouts this topology supports for a value of the given shape:
    /// a split along every axis divisible by the device count, plus
    /// `Replicated`.
    ///
    /// `Replicated` is always structurally valid, so a value with no
    /// supported split still gets a (degraded, broadcast) candidate. Only
    /// an empty topology yields nothing.
    pub fn candidate_layouts(&self, shape: &Shape) -> Vec<Layout> {
        let parts = self.len();
        if parts == 0 {
            return vec![];
        }
        let mut out = vec![];
        if parts > 1 {
            for (axis, &dim) in shape.dims().iter().enumerate() {
                if dim >= parts && dim % parts == 0 {
                    out.push(Layout::Split { axis, parts });
                }
            }
        }
        out.push(Layout::Replicated);
        out
    }
}

/// Relative weight of a byte moved between devices against a floating
/// point operation.
const COMM_WEIGHT: f64 = 2.0;

/// Cost of producing a value with a given layout: the compute of the
/// wrapped operator scaled by the partitioning, plus the communication the
/// conversion itself causes.
///
/// Replication prices the full computation on every device but no
/// communication when consumed; a split divides the compute across devices
/// but pays resharding traffic proportional to the value's size. That is
/// the classic memory-for-communication trade the constrained extractor
/// arbitrates under the device budgets.
fn conversion_cost(egraph: &EGraph<TensorLang, ShapeAnalysis>, node: &TensorLang) -> f64 {
    let shape_of = |id: Id| egraph[id].data.clone();
    match node {
        TensorLang::Shard(layout, [inner]) => {
            let flops = egraph[*inner]
                .nodes
                .first()
                .map(|n| node_flops(n, shape_of))
                .unwrap_or(0.0);
            let bytes = egraph[*inner].data.bytes();
            match layout {
                Layout::Host => COMM_WEIGHT * bytes,
                Layout::Replicated => flops,
                Layout::Split { parts, .. } => flops / *parts as f64 + COMM_WEIGHT * bytes,
            }
        }
        TensorLang::Gather([inner]) => COMM_WEIGHT * egraph[*inner].data.bytes(),
        // computation is priced on the conversion that materializes it
        _ => 0.0,
    }
}

/// The placement cost model handed to the constrained extractor.
#[derive(Debug, Clone, Copy, Default)]
pub struct PlacementCost;

impl LpCostFunction<TensorLang, ShapeAnalysis> for PlacementCost {
    fn node_cost(
        &mut self,
        egraph: &EGraph<TensorLang, ShapeAnalysis>,
        _eclass: Id,
        enode: &TensorLang,
    ) -> f64 {
        conversion_cost(egraph, enode)
    }
}

/// The same model in additive form, for the greedy fallback extraction.
struct GreedyPlacementCost<'a> {
    egraph: &'a EGraph<TensorLang, ShapeAnalysis>,
}

impl CostFunction<TensorLang> for GreedyPlacementCost<'_> {
    type Cost = NotNan<f64>;
    fn cost<C>(&mut self, enode: &TensorLang, mut costs: C) -> Self::Cost
    where
        C: FnMut(Id) -> Self::Cost,
    {
        let own = NotNan::new(conversion_cost(self.egraph, enode))
            .expect("placement costs are finite");
        enode.fold(own, |sum, id| sum + costs(id))
    }
}

/// The result of a placement pass: a concrete program with resharding
/// conversions only where adjacent layout choices actually disagree.
#[derive(Debug, Clone)]
pub struct Placement {
    /// The placed program, pinned to the host layout by a terminating
    /// `Gather` at the root.
    pub expr: RecExpr<TensorLang>,
    /// Total modeled cost of the chosen program.
    pub cost: f64,
    /// Bytes resident per device under the chosen layouts, in device
    /// order.
    pub device_bytes: Vec<f64>,
    /// Whether constrained extraction failed recoverably and the result
    /// came from the greedy fallback, ignoring memory budgets.
    pub used_fallback: bool,
}

/// Chooses a sharding for every value of a tensor program under per-device
/// memory budgets.
///
/// For every operator of the input program the pass enumerates the output
/// layouts the topology supports, wraps each candidate in an explicit
/// `Shard` conversion so mismatched layouts between producer and consumer
/// stay representable, and unions all candidates for one logical value
/// into a single e-class. The program output is pinned to the host layout
/// by a terminating `Gather`. Classes unreachable from that pinned root
/// (dead speculative candidates) are pruned, and the constrained extractor
/// picks one mutually consistent candidate per class subject to one memory
/// row per device.
///
/// Per-class greedy minimization is unsound here: replicating everything
/// is individually cheapest but the *combination* can exceed a device
/// budget, which is why extraction goes through
/// [`LpExtractor`]. If the solver reports the recoverable
/// [`Error::Infeasible`] or [`Error::SolveTimeout`], the pass logs a
/// diagnostic and falls back to greedy extraction.
pub struct PlacementPass {
    topology: Topology,
}

impl PlacementPass {
    /// A pass targeting the given topology.
    pub fn new(topology: Topology) -> Self {
        Self { topology }
    }

    /// Place `program`, returning the chosen concrete program.
    pub fn run(&self, program: &RecExpr<TensorLang>) -> Result<Placement, Error> {
        let mut egraph = EGraph::<TensorLang, ShapeAnalysis>::default();

        // one merged class of Shard candidates per logical value
        let mut merged: Vec<Id> = Vec::with_capacity(program.len());
        for node in program.as_ref() {
            assert!(
                !node.is_conversion(),
                "input programs must not contain placement conversions"
            );
            let raw_node = node.clone().map_children(|i| merged[usize::from(i)]);
            let raw = egraph.add(raw_node);
            let shape = egraph[raw].data.clone();

            let layouts = self.topology.candidate_layouts(&shape);
            if layouts.is_empty() {
                return Err(Error::NoViableCandidate { class: raw });
            }
            let mut class: Option<Id> = None;
            for layout in layouts {
                let candidate = egraph.add(TensorLang::Shard(layout, [raw]));
                class = Some(match class {
                    None => candidate,
                    Some(c) => egraph.union(c, candidate)?.0,
                });
            }
            merged.push(class.unwrap());
        }

        // pin the output to the unsharded host layout
        let root = *merged.last().expect("placement of an empty program");
        let pinned = egraph.add(TensorLang::Gather([root]));
        egraph.rebuild()?;

        // dead speculative candidates drop out of the problem here
        let mut lp = LpExtractor::rooted(&egraph, PlacementCost, &[pinned]);
        for device in &self.topology.devices {
            lp.add_resource_limit(
                |eg, _id, node| match node {
                    TensorLang::Shard(layout, [inner]) => {
                        layout.bytes_on_device(&eg[*inner].data)
                    }
                    _ => 0.0,
                },
                device.memory,
            );
        }

        let (expr, used_fallback) = match lp.solve(&[pinned]) {
            Ok((expr, roots)) => {
                debug_assert_eq!(roots[0], expr.root());
                (expr, false)
            }
            Err(e @ (Error::Infeasible | Error::SolveTimeout)) => {
                warn!("constrained placement failed ({}); falling back to greedy extraction without memory budgets", e);
                let greedy = Extractor::new(&egraph, GreedyPlacementCost { egraph: &egraph })?;
                let (_, expr) = greedy.find_best(pinned)?;
                (expr, true)
            }
            Err(e) => return Err(e),
        };

        let cost = expr_cost(&expr);
        let device_bytes = self.expr_device_bytes(&expr);
        for (device, &bytes) in self.topology.devices.iter().zip(&device_bytes) {
            if bytes > device.memory {
                warn!(
                    "placement exceeds the memory budget of {}: {} > {}",
                    device.name, bytes, device.memory
                );
            }
        }

        let expr = elide_noop_conversions(&expr);
        info!(
            "placed program with cost {} over {} devices{}",
            cost,
            self.topology.len(),
            if used_fallback { " (greedy fallback)" } else { "" }
        );

        Ok(Placement {
            expr,
            cost,
            device_bytes,
            used_fallback,
        })
    }

    /// Bytes resident on each device under the layouts chosen in `expr`.
    fn expr_device_bytes(&self, expr: &RecExpr<TensorLang>) -> Vec<f64> {
        let shapes = expr_shapes(expr);
        let mut per_device = 0.0;
        for node in expr.as_ref() {
            if let TensorLang::Shard(layout, [inner]) = node {
                per_device += layout.bytes_on_device(&shapes[usize::from(*inner)]);
            }
        }
        // identical layouts put the same number of bytes on every device
        vec![per_device; self.topology.len()]
    }
}

/// Shape of every node in an extracted expression, by index.
fn expr_shapes(expr: &RecExpr<TensorLang>) -> Vec<Shape> {
    let mut shapes: Vec<Shape> = Vec::with_capacity(expr.len());
    for node in expr.as_ref() {
        let shape = infer_shape(node, |id| shapes[usize::from(id)].clone());
        shapes.push(shape);
    }
    shapes
}

/// Total modeled cost of an extracted expression, mirroring
/// [`PlacementCost`] over expression indices.
fn expr_cost(expr: &RecExpr<TensorLang>) -> f64 {
    let shapes = expr_shapes(expr);
    let shape_of = |id: Id| shapes[usize::from(id)].clone();
    let mut total = 0.0;
    for node in expr.as_ref() {
        total += match node {
            TensorLang::Shard(layout, [inner]) => {
                let flops = node_flops(&expr[*inner], shape_of);
                let bytes = shapes[usize::from(*inner)].bytes();
                match layout {
                    Layout::Host => COMM_WEIGHT * bytes,
                    Layout::Replicated => flops,
                    Layout::Split { parts, .. } => flops / *parts as f64 + COMM_WEIGHT * bytes,
                }
            }
            TensorLang::Gather([inner]) => COMM_WEIGHT * shapes[usize::from(*inner)].bytes(),
            _ => 0.0,
        };
    }
    total
}

/// Drops the `Shard` conversions whose layout agrees with the layout of
/// the consuming operator, so resharding nodes remain only where adjacent
/// choices actually disagree. The terminating `Gather` always stays.
fn elide_noop_conversions(expr: &RecExpr<TensorLang>) -> RecExpr<TensorLang> {
    let mut out = RecExpr::default();
    let mut memo = HashMap::default();
    elide(expr, expr.root(), Layout::Host, &mut out, &mut memo);
    out
}

fn elide(
    expr: &RecExpr<TensorLang>,
    id: Id,
    want: Layout,
    out: &mut RecExpr<TensorLang>,
    memo: &mut HashMap<(Id, Layout), Id>,
) -> Id {
    if let Some(&done) = memo.get(&(id, want)) {
        return done;
    }
    let result = match &expr[id] {
        TensorLang::Shard(layout, [inner]) => {
            // the wrapped operator computes in this shard's layout
            let inner = elide(expr, *inner, *layout, out, memo);
            if *layout == want {
                inner
            } else {
                out.add(TensorLang::Shard(*layout, [inner]))
            }
        }
        node => {
            // operands are consumed in this operator's own layout
            let mut children = Vec::with_capacity(node.len());
            for &child in node.children() {
                children.push(elide(expr, child, want, out, memo));
            }
            let mut children = children.into_iter();
            let node = node.clone().map_children(|_| children.next().unwrap());
            out.add(node)
        }
    };
    memo.insert((id, want), result);
    result
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn candidate_layouts_split_divisible_axes() {
        let topo = Topology::homogeneous(2, 1024.0);
        let layouts = topo.candidate_layouts(&Shape::new(vec![4, 3]));
        assert_eq!(
            layouts,
            vec![Layout::Split { axis: 0, parts: 2 }, Layout::Replicated]
        );

        // nothing divides: only the degraded broadcast candidate remains
        let layouts = topo.candidate_layouts(&Shape::new(vec![3, 5]));
        assert_eq!(layouts, vec![Layout::Replicated]);

        // a single device never splits
        let topo = Topology::homogeneous(1, 1024.0);
        let layouts = topo.candidate_layouts(&Shape::new(vec![4, 4]));
        assert_eq!(layouts, vec![Layout::Replicated]);
    }

    #[test]
    fn empty_topology_has_no_candidates() {
        let mut expr = RecExpr::default();
        expr.add(TensorLang::Input("a".into(), Shape::new(vec![2, 2])));
        let pass = PlacementPass::new(Topology::homogeneous(0, 0.0));
        match pass.run(&expr) {
            Err(Error::NoViableCandidate { .. }) => {}
            other => panic!("expected no viable candidate, got {:?}", other.map(|p| p.cost)),
        }
    }

    #[test]
    fn output_is_pinned_by_a_gather() {
        let mut expr = RecExpr::default();
        let a = expr.add(TensorLang::Input("a".into(), Shape::new(vec![4, 4])));
        expr.add(TensorLang::Relu([a]));

        let pass = PlacementPass::new(Topology::homogeneous(2, 1e9));
        let placed = pass.run(&expr).unwrap();
        assert!(matches!(
            placed.expr[placed.expr.root()],
            TensorLang::Gather(_)
        ));
        assert!(!placed.used_fallback);
    }
}
