use eqsat::{Layout, PlacementPass, RecExpr, Shape, TensorLang, Topology};

fn init_logger() {
    let _ = env_logger::builder().is_test(true).try_init();
}

/// An elementwise-only program: relu(a + b) over two 8x8 inputs.
///
/// With no memory pressure, replicating every value is cheapest: each
/// device just recomputes, no traffic. Splitting trades cheaper compute
/// for resharding traffic that outweighs it at this size, so splits only
/// appear when a budget forces them.
fn elementwise_program() -> RecExpr<TensorLang> {
    let mut expr = RecExpr::default();
    let a = expr.add(TensorLang::Input("a".into(), Shape::new(vec![8, 8])));
    let b = expr.add(TensorLang::Input("b".into(), Shape::new(vec![8, 8])));
    let add = expr.add(TensorLang::Add([a, b]));
    expr.add(TensorLang::Relu([add]));
    expr
}

fn shards(expr: &RecExpr<TensorLang>) -> Vec<Layout> {
    expr.as_ref()
        .iter()
        .filter_map(|n| match n {
            TensorLang::Shard(layout, _) => Some(*layout),
            _ => None,
        })
        .collect()
}

#[test]
fn loose_budget_replicates_everything() {
    init_logger();
    let pass = PlacementPass::new(Topology::homogeneous(2, 1e6));
    let placed = pass.run(&elementwise_program()).unwrap();

    assert!(!placed.used_fallback);
    assert!(matches!(
        placed.expr[placed.expr.root()],
        TensorLang::Gather(_)
    ));

    // every value is replicated, and after eliding the agreeing
    // conversions only the one under the output gather remains
    let shards = shards(&placed.expr);
    assert_eq!(shards, vec![Layout::Replicated]);

    // four 8x8 f32 values, one full copy per device
    assert_eq!(placed.device_bytes, vec![1024.0, 1024.0]);
}

#[test]
fn tight_budget_forces_sharding() {
    init_logger();
    // all-replicated needs 1024 bytes per device; greedy per-value
    // minimization would pick exactly that and blow this budget
    let budget = 600.0;
    let pass = PlacementPass::new(Topology::homogeneous(2, budget));
    let placed = pass.run(&elementwise_program()).unwrap();

    assert!(!placed.used_fallback);
    for &bytes in &placed.device_bytes {
        assert!(bytes <= budget, "{} exceeds the budget", bytes);
    }
    assert!(
        shards(&placed.expr)
            .iter()
            .any(|l| matches!(l, Layout::Split { .. })),
        "a budget under the all-replicated footprint must force splits"
    );
}

#[test]
fn impossible_budget_falls_back_to_greedy() {
    init_logger();
    // even fully split, the program needs 512 bytes per device
    let budget = 100.0;
    let pass = PlacementPass::new(Topology::homogeneous(2, budget));
    let placed = pass.run(&elementwise_program()).unwrap();

    assert!(placed.used_fallback);
    assert!(matches!(
        placed.expr[placed.expr.root()],
        TensorLang::Gather(_)
    ));
    // the fallback ignores the budget and reports the overrun
    assert!(placed.device_bytes.iter().all(|&b| b > budget));
}

#[test]
fn matmul_splits_even_without_pressure() {
    init_logger();
    // matmul compute dominates its resharding traffic, so partitioning
    // wins on cost alone
    let mut expr = RecExpr::default();
    let a = expr.add(TensorLang::Input("a".into(), Shape::new(vec![64, 64])));
    let b = expr.add(TensorLang::Input("b".into(), Shape::new(vec![64, 64])));
    expr.add(TensorLang::MatMul([a, b]));

    let pass = PlacementPass::new(Topology::homogeneous(2, 1e9));
    let placed = pass.run(&expr).unwrap();

    assert!(!placed.used_fallback);
    assert!(shards(&placed.expr)
        .iter()
        .any(|l| matches!(l, Layout::Split { .. })));
}

#[test]
fn placement_is_deterministic() {
    init_logger();
    let pass = PlacementPass::new(Topology::homogeneous(2, 600.0));
    let first = pass.run(&elementwise_program()).unwrap();
    let second = pass.run(&elementwise_program()).unwrap();
    assert_eq!(first.expr, second.expr);
    assert_eq!(first.cost, second.cost);
}

#[test]
fn indivisible_values_stay_replicated() {
    init_logger();
    // 3x5 divides across neither axis of a 2-device topology, so the
    // degraded broadcast fallback is the only candidate; placement must
    // still succeed
    let mut expr = RecExpr::default();
    let a = expr.add(TensorLang::Input("a".into(), Shape::new(vec![3, 5])));
    expr.add(TensorLang::Relu([a]));

    let pass = PlacementPass::new(Topology::homogeneous(2, 1e6));
    let placed = pass.run(&expr).unwrap();
    assert_eq!(shards(&placed.expr), vec![Layout::Replicated]);
}
