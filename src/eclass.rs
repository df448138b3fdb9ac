use std::fmt::{self, Debug};
use std::iter::ExactSizeIterator;

use crate::{Id, Language};

/// An equivalence class of enodes.
///
/// A live class owns the enodes that denote it, its analysis data (the
/// checked type), and the *used-by* list: every `(node, owner)` pair in the
/// rest of the graph that takes this class as an operand. The used-by list
/// is what lets [`EGraph::rebuild`](crate::EGraph::rebuild) find the nodes
/// that went stale when this class is merged away.
///
/// A class that loses a union is removed from the egraph's class table
/// (its nodes and used-by entries are drained into the winner), and its id
/// is only meaningful through [`EGraph::find`](crate::EGraph::find)
/// redirection from then on.
#[non_exhaustive]
#[derive(Clone)]
pub struct EClass<L, D> {
    /// This eclass's id.
    pub id: Id,
    /// The equivalent enodes in this equivalence class.
    pub nodes: Vec<L>,
    /// The analysis data (checked type) associated with this eclass.
    pub data: D,
    /// The nodes elsewhere in the graph that use this class as an operand,
    /// paired with the id of the class each of them belongs to.
    pub(crate) parents: Vec<(L, Id)>,
}

impl<L: Language, D: Debug> Debug for EClass<L, D> {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.debug_struct("EClass")
            .field("id", &self.id)
            .field("nodes", &self.nodes)
            .field("data", &self.data)
            .field("parents", &self.parents)
            .finish()
    }
}

impl<L: Language, D> EClass<L, D> {
    /// Returns `true` if the `eclass` is empty.
    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    /// Returns the number of enodes in this eclass.
    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    /// Iterates over the enodes in this eclass.
    pub fn iter(&self) -> impl ExactSizeIterator<Item = &L> {
        self.nodes.iter()
    }

    /// Iterates over the childless enodes in this eclass.
    pub fn leaves(&self) -> impl Iterator<Item = &L> {
        self.nodes.iter().filter(|&n| n.is_leaf())
    }

    /// The number of nodes elsewhere in the graph using this class as an
    /// operand.
    pub fn n_parents(&self) -> usize {
        self.parents.len()
    }
}
