use std::fmt::{self, Debug, Display};
use std::hash::Hash;

use crate::{EGraph, Error, Id, Symbol};

/// Trait that defines a language whose terms will be in the
/// [`EGraph`](crate::EGraph).
///
/// An enode is a value of the implementing type: an operator tag plus any
/// payload, together with the ordered [`Id`]s of its operand e-classes.
/// Equality and hashing must be derived from exactly (tag, payload,
/// child-id sequence), never from the children's own structure, so that
/// hashconsing over canonical child ids is cheap and sound.
///
/// Implementations should also provide [`Display`] printing just the
/// operator/payload (not the children); [`RecExpr`] uses it for printing
/// whole terms.
#[allow(clippy::len_without_is_empty)]
pub trait Language: Debug + Clone + Eq + Ord + Hash {
    /// Returns true if this enode matches another enode.
    /// This should only consider the operator and payload, not the
    /// children `Id`s.
    fn matches(&self, other: &Self) -> bool;

    /// Return a slice of the children `Id`s.
    fn children(&self) -> &[Id];

    /// Return a mutable slice of the children `Id`s.
    fn children_mut(&mut self) -> &mut [Id];

    /// Runs a given function on each child `Id`.
    fn for_each<F: FnMut(Id)>(&self, f: F) {
        self.children().iter().copied().for_each(f)
    }

    /// Runs a given function on each child `Id`, allowing mutation of that
    /// `Id`.
    fn for_each_mut<F: FnMut(&mut Id)>(&mut self, f: F) {
        self.children_mut().iter_mut().for_each(f)
    }

    /// Returns the number of children this enode has.
    fn len(&self) -> usize {
        self.children().len()
    }

    /// Returns true if this enode has no children.
    fn is_leaf(&self) -> bool {
        self.children().is_empty()
    }

    /// Runs a given function to replace the children.
    fn update_children<F: FnMut(Id) -> Id>(&mut self, mut f: F) {
        self.for_each_mut(|id| *id = f(*id))
    }

    /// Creates a new enode with children determined by the given function.
    fn map_children<F: FnMut(Id) -> Id>(mut self, f: F) -> Self {
        self.update_children(f);
        self
    }

    /// Folds over the children, given an initial accumulator.
    fn fold<F, T>(&self, init: T, mut f: F) -> T
    where
        F: FnMut(T, Id) -> T,
        T: Clone,
    {
        let mut acc = init;
        self.for_each(|id| acc = f(acc.clone(), id));
        acc
    }
}

/// A recursive expression from a user-defined [`Language`].
///
/// This conceptually represents a recursive expression, but it's actually
/// just a list of enodes.
///
/// [`RecExpr`]s must satisfy the invariant that enodes' children must refer
/// to elements that come before them in the list. The last enode is the
/// root of the expression.
#[derive(Debug, PartialEq, Eq, Clone, Hash)]
pub struct RecExpr<L> {
    pub(crate) nodes: Vec<L>,
}

impl<L> Default for RecExpr<L> {
    fn default() -> Self {
        Self { nodes: vec![] }
    }
}

impl<L> AsRef<[L]> for RecExpr<L> {
    fn as_ref(&self) -> &[L] {
        &self.nodes
    }
}

impl<L> std::ops::Index<Id> for RecExpr<L> {
    type Output = L;
    fn index(&self, id: Id) -> &L {
        &self.nodes[usize::from(id)]
    }
}

impl<L: Language> RecExpr<L> {
    /// Adds a given enode to this `RecExpr`.
    /// The enode's children `Id`s must refer to elements already in this
    /// list.
    pub fn add(&mut self, node: L) -> Id {
        debug_assert!(
            node.children()
                .iter()
                .all(|&id| usize::from(id) < self.nodes.len()),
            "node {:?} has children not in this expr: {:?}",
            node,
            self.nodes
        );
        self.nodes.push(node);
        Id::from(self.nodes.len() - 1)
    }

    /// The id of the root (last) enode.
    pub fn root(&self) -> Id {
        assert!(!self.nodes.is_empty(), "empty RecExpr has no root");
        Id::from(self.nodes.len() - 1)
    }

    /// Returns true if this expression contains no enodes.
    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    /// The number of enodes in this expression.
    pub fn len(&self) -> usize {
        self.nodes.len()
    }
}

impl<L: Language + Display> RecExpr<L> {
    fn fmt_rec(&self, f: &mut fmt::Formatter<'_>, id: Id) -> fmt::Result {
        let node = &self[id];
        if node.is_leaf() {
            write!(f, "{}", node)
        } else {
            write!(f, "({}", node)?;
            for &child in node.children() {
                write!(f, " ")?;
                self.fmt_rec(f, child)?;
            }
            write!(f, ")")
        }
    }
}

impl<L: Language + Display> Display for RecExpr<L> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.nodes.is_empty() {
            write!(f, "()")
        } else {
            self.fmt_rec(f, self.root())
        }
    }
}

/** Arbitrary data associated with an [`EClass`](crate::EClass).

`eqsat` allows you to associate data with each eclass; the [`Analysis`]
trait defines how that data behaves across merges. The engine uses it to
carry each class's *checked type*: [`Analysis::make`] is the narrow
interface to external type inference, and [`Analysis::merge`] is where a
disagreement between two merged classes surfaces as the fatal
[`Error::TypeMismatch`].

If you don't care about analyses, `()` implements this trivially.

See [`ShapeAnalysis`](crate::ShapeAnalysis) for the tensor-shape instance
used by the placement pass.
*/
pub trait Analysis<L: Language>: Sized {
    /// The per-[`EClass`](crate::EClass) data for this analysis.
    type Data: Debug + Clone;

    /// Makes a new [`Analysis::Data`] for a given enode, reading the data of
    /// its children classes out of the egraph.
    fn make(egraph: &EGraph<L, Self>, enode: &L) -> Self::Data;

    /// Defines how to merge two `Data`s when their containing
    /// [`EClass`](crate::EClass)es merge.
    ///
    /// Returns whether `to` changed, so the egraph knows to re-make the data
    /// of classes that use it. Merging incompatible data (e.g. two
    /// disagreeing checked types) is an error, which aborts the union and
    /// the surrounding pass.
    fn merge(&mut self, to: &mut Self::Data, from: Self::Data) -> Result<bool, Error>;

    /// A hook that allows the modification of the
    /// [`EGraph`](crate::EGraph) whenever a class's data settles.
    ///
    /// By default this does nothing.
    #[allow(unused_variables)]
    fn modify(egraph: &mut EGraph<L, Self>, id: Id) {}
}

impl<L: Language> Analysis<L> for () {
    type Data = ();
    fn make(_egraph: &EGraph<L, Self>, _enode: &L) -> Self::Data {}
    fn merge(&mut self, _to: &mut Self::Data, _from: Self::Data) -> Result<bool, Error> {
        Ok(false)
    }
}

/// A simple language of symbols and children, mostly used for testing.
#[derive(Debug, Hash, PartialEq, Eq, Clone, PartialOrd, Ord)]
pub struct SymbolLang {
    /// The operator for an enode
    pub op: Symbol,
    /// The enode's children `Id`s
    pub children: Vec<Id>,
}

impl SymbolLang {
    /// Create an enode with the given string and children
    pub fn new(op: impl Into<Symbol>, children: Vec<Id>) -> Self {
        let op = op.into();
        Self { op, children }
    }

    /// Create a childless enode with the given string
    pub fn leaf(op: impl Into<Symbol>) -> Self {
        Self::new(op, vec![])
    }
}

impl Language for SymbolLang {
    fn matches(&self, other: &Self) -> bool {
        self.op == other.op && self.len() == other.len()
    }

    fn children(&self) -> &[Id] {
        &self.children
    }

    fn children_mut(&mut self) -> &mut [Id] {
        &mut self.children
    }
}

impl Display for SymbolLang {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        Display::fmt(&self.op, f)
    }
}
