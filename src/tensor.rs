use std::fmt::{self, Display};

use crate::{Analysis, EGraph, Error, Id, Language, Symbol};

/// Bytes per tensor element; everything is f32-sized for costing purposes.
pub(crate) const ELEM_BYTES: f64 = 4.0;

/// The dimensions of a tensor value. This is the checked type carried on
/// every e-class by [`ShapeAnalysis`].
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Shape(Vec<usize>);

impl Shape {
    /// A shape with the given dimensions.
    pub fn new(dims: Vec<usize>) -> Self {
        Shape(dims)
    }

    /// The shape of a scalar.
    pub fn scalar() -> Self {
        Shape(vec![])
    }

    /// The dimensions.
    pub fn dims(&self) -> &[usize] {
        &self.0
    }

    /// Number of dimensions.
    pub fn rank(&self) -> usize {
        self.0.len()
    }

    /// Total number of elements.
    pub fn size(&self) -> usize {
        self.0.iter().product()
    }

    /// Total size in bytes.
    pub fn bytes(&self) -> f64 {
        self.size() as f64 * ELEM_BYTES
    }
}

impl Display for Shape {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.0.is_empty() {
            return write!(f, "scalar");
        }
        for (i, d) in self.0.iter().enumerate() {
            if i > 0 {
                write!(f, "x")?;
            }
            write!(f, "{}", d)?;
        }
        Ok(())
    }
}

/// How a tensor value is laid out across the device topology.
///
/// `Host` is the unsharded layout values are pinned to at program
/// boundaries; `Replicated` keeps a full copy on every device (always
/// structurally valid, the degraded fallback when nothing better is
/// supported); `Split` partitions one axis evenly across the devices.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum Layout {
    /// Unsharded, resident off-device.
    Host,
    /// A full copy on every device.
    Replicated,
    /// Partitioned along `axis` into `parts` equal slices, one per device.
    Split {
        /// The axis being partitioned.
        axis: usize,
        /// How many slices the axis is cut into.
        parts: usize,
    },
}

impl Layout {
    /// How many bytes of a value with the given shape live on each single
    /// device under this layout.
    pub fn bytes_on_device(&self, shape: &Shape) -> f64 {
        match self {
            Layout::Host => 0.0,
            Layout::Replicated => shape.bytes(),
            Layout::Split { parts, .. } => shape.bytes() / *parts as f64,
        }
    }
}

impl Display for Layout {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Layout::Host => write!(f, "host"),
            Layout::Replicated => write!(f, "rep"),
            Layout::Split { axis, parts } => write!(f, "split({},{})", axis, parts),
        }
    }
}

/// The tensor-operator language the placement pass works over.
///
/// Payload-carrying variants store their payload inline; equality and
/// hashing cover the operator tag, the payload, and the child ids, never
/// the children's structure. `Shard` and `Gather` are the placement
/// operators: `Shard` is the explicit conversion ("boxing") of a value
/// onto a device layout, and `Gather` is the terminating conversion that
/// pins a value back to the unsharded host layout.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum TensorLang {
    /// A named program input with a known shape.
    Input(Symbol, Shape),
    /// An integer scalar constant.
    Scalar(i64),
    /// Elementwise addition.
    Add([Id; 2]),
    /// Elementwise multiplication.
    Mul([Id; 2]),
    /// Rank-2 matrix multiplication.
    MatMul([Id; 2]),
    /// Elementwise rectifier.
    Relu([Id; 1]),
    /// Sum over one axis.
    SumReduce(usize, [Id; 1]),
    /// Reinterpret the element sequence with a new shape.
    Reshape(Shape, [Id; 1]),
    /// Materialize the operand with the given device layout.
    Shard(Layout, [Id; 1]),
    /// Collect the operand back to the unsharded host layout.
    Gather([Id; 1]),
}

impl TensorLang {
    /// Whether this node is one of the placement conversions rather than a
    /// computation.
    pub fn is_conversion(&self) -> bool {
        matches!(self, TensorLang::Shard(..) | TensorLang::Gather(..))
    }
}

impl Language for TensorLang {
    fn matches(&self, other: &Self) -> bool {
        use TensorLang::*;
        match (self, other) {
            (Input(a, s1), Input(b, s2)) => a == b && s1 == s2,
            (Scalar(a), Scalar(b)) => a == b,
            (Add(_), Add(_)) => true,
            (Mul(_), Mul(_)) => true,
            (MatMul(_), MatMul(_)) => true,
            (Relu(_), Relu(_)) => true,
            (Gather(_), Gather(_)) => true,
            (SumReduce(a, _), SumReduce(b, _)) => a == b,
            (Reshape(s1, _), Reshape(s2, _)) => s1 == s2,
            (Shard(l1, _), Shard(l2, _)) => l1 == l2,
            _ => false,
        }
    }

    fn children(&self) -> &[Id] {
        use TensorLang::*;
        match self {
            Input(..) | Scalar(_) => &[],
            Add(ids) | Mul(ids) | MatMul(ids) => ids,
            Relu(ids) | SumReduce(_, ids) | Reshape(_, ids) | Shard(_, ids) | Gather(ids) => ids,
        }
    }

    fn children_mut(&mut self) -> &mut [Id] {
        use TensorLang::*;
        match self {
            Input(..) | Scalar(_) => &mut [],
            Add(ids) | Mul(ids) | MatMul(ids) => ids,
            Relu(ids) | SumReduce(_, ids) | Reshape(_, ids) | Shard(_, ids) | Gather(ids) => ids,
        }
    }
}

impl Display for TensorLang {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        use TensorLang::*;
        match self {
            Input(name, _) => write!(f, "{}", name),
            Scalar(v) => write!(f, "{}", v),
            Add(_) => write!(f, "+"),
            Mul(_) => write!(f, "*"),
            MatMul(_) => write!(f, "matmul"),
            Relu(_) => write!(f, "relu"),
            SumReduce(axis, _) => write!(f, "sum:{}", axis),
            Reshape(shape, _) => write!(f, "reshape:{}", shape),
            Shard(layout, _) => write!(f, "shard:{}", layout),
            Gather(_) => write!(f, "gather"),
        }
    }
}

/// The checked-type analysis: every class carries the [`Shape`] of the
/// value it denotes.
///
/// [`Analysis::make`] is the narrow interface to shape inference; input
/// programs are produced by upstream typed passes, so inference here
/// asserts well-formedness rather than diagnosing it. A merge of two
/// classes with disagreeing shapes is the fatal
/// [`Error::TypeMismatch`]: it means a rewrite equated two values that
/// cannot be the same tensor.
#[derive(Debug, Clone, Default)]
pub struct ShapeAnalysis;

impl Analysis<TensorLang> for ShapeAnalysis {
    type Data = Shape;

    fn make(egraph: &EGraph<TensorLang, Self>, enode: &TensorLang) -> Shape {
        infer_shape(enode, |id| egraph[id].data.clone())
    }

    fn merge(&mut self, to: &mut Shape, from: Shape) -> Result<bool, Error> {
        if *to == from {
            Ok(false)
        } else {
            Err(Error::TypeMismatch {
                to: to.to_string(),
                from: from.to_string(),
            })
        }
    }
}

/// Shape inference for one enode over its operand shapes. Input programs
/// come from upstream typed passes, so well-formedness is asserted rather
/// than diagnosed; the checked-type machinery guards the merges instead.
pub(crate) fn infer_shape(enode: &TensorLang, shape_of: impl Fn(Id) -> Shape) -> Shape {
    use TensorLang::*;
    match enode {
        Input(_, s) => s.clone(),
        Scalar(_) => Shape::scalar(),
        Add([a, b]) | Mul([a, b]) => {
            debug_assert_eq!(shape_of(*a), shape_of(*b), "elementwise operands must agree");
            shape_of(*a)
        }
        MatMul([a, b]) => {
            let (a, b) = (shape_of(*a), shape_of(*b));
            debug_assert!(a.rank() == 2 && b.rank() == 2, "matmul operands must be rank 2");
            debug_assert_eq!(a.dims()[1], b.dims()[0], "matmul inner dimensions must agree");
            Shape::new(vec![a.dims()[0], b.dims()[1]])
        }
        Relu([a]) => shape_of(*a),
        SumReduce(axis, [a]) => {
            let mut dims = shape_of(*a).dims().to_vec();
            debug_assert!(*axis < dims.len(), "reduction axis out of range");
            if *axis < dims.len() {
                dims.remove(*axis);
            }
            Shape::new(dims)
        }
        Reshape(s, [a]) => {
            debug_assert_eq!(s.size(), shape_of(*a).size(), "reshape must preserve size");
            s.clone()
        }
        // conversions change residency, not the logical shape
        Shard(_, [a]) | Gather([a]) => shape_of(*a),
    }
}

/// Floating point operations performed by one enode, given its operand
/// shapes. The placement cost model scales this by the chosen layout.
pub(crate) fn node_flops(node: &TensorLang, shape_of: impl Fn(Id) -> Shape) -> f64 {
    use TensorLang::*;
    match node {
        Input(..) | Scalar(_) | Reshape(..) | Shard(..) | Gather(..) => 0.0,
        Add([a, _]) | Mul([a, _]) => shape_of(*a).size() as f64,
        Relu([a]) => shape_of(*a).size() as f64,
        SumReduce(_, [a]) => shape_of(*a).size() as f64,
        MatMul([a, b]) => {
            let (a, b) = (shape_of(*a), shape_of(*b));
            2.0 * a.dims()[0] as f64 * a.dims()[1] as f64 * b.dims()[1] as f64
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn input(egraph: &mut EGraph<TensorLang, ShapeAnalysis>, name: &str, dims: Vec<usize>) -> Id {
        egraph.add(TensorLang::Input(name.into(), Shape::new(dims)))
    }

    #[test]
    fn shapes_propagate() {
        let mut egraph = EGraph::<TensorLang, ShapeAnalysis>::default();
        let a = input(&mut egraph, "a", vec![2, 3]);
        let b = input(&mut egraph, "b", vec![3, 4]);
        let mm = egraph.add(TensorLang::MatMul([a, b]));
        assert_eq!(egraph[mm].data, Shape::new(vec![2, 4]));

        let relu = egraph.add(TensorLang::Relu([mm]));
        assert_eq!(egraph[relu].data, Shape::new(vec![2, 4]));

        let red = egraph.add(TensorLang::SumReduce(0, [relu]));
        assert_eq!(egraph[red].data, Shape::new(vec![4]));
    }

    #[test]
    fn conversions_keep_the_shape() {
        let mut egraph = EGraph::<TensorLang, ShapeAnalysis>::default();
        let a = input(&mut egraph, "a", vec![4, 4]);
        let sharded = egraph.add(TensorLang::Shard(
            Layout::Split { axis: 0, parts: 2 },
            [a],
        ));
        let gathered = egraph.add(TensorLang::Gather([sharded]));
        assert_eq!(egraph[sharded].data, Shape::new(vec![4, 4]));
        assert_eq!(egraph[gathered].data, Shape::new(vec![4, 4]));
    }

    #[test]
    fn shape_disagreement_is_fatal() {
        let mut egraph = EGraph::<TensorLang, ShapeAnalysis>::default();
        let a = input(&mut egraph, "a", vec![2, 2]);
        let b = input(&mut egraph, "b", vec![4]);
        match egraph.union(a, b) {
            Err(Error::TypeMismatch { to, from }) => {
                assert_ne!(to, from);
            }
            other => panic!("expected a type mismatch, got {:?}", other),
        }
    }

    #[test]
    fn layout_bytes() {
        let shape = Shape::new(vec![8, 4]);
        assert_eq!(shape.bytes(), 128.0);
        assert_eq!(Layout::Replicated.bytes_on_device(&shape), 128.0);
        assert_eq!(
            Layout::Split { axis: 0, parts: 4 }.bytes_on_device(&shape),
            32.0
        );
        assert_eq!(Layout::Host.bytes_on_device(&shape), 0.0);
    }
}
