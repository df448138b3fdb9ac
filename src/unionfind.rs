use crate::Id;

/// An index-based union-find over class ids.
///
/// Classes are addressed by dense [`Id`]s, so the parent relation is a plain
/// array rather than pointers between class objects. A root is its own
/// parent. [`UnionFind::union`] takes two *roots*; callers are expected to
/// have canonicalized with [`UnionFind::find_mut`] first, which is what
/// [`EGraph::union`](crate::EGraph::union) does.
#[derive(Debug, Clone, Default)]
pub struct UnionFind {
    parents: Vec<Id>,
}

impl UnionFind {
    pub fn make_set(&mut self) -> Id {
        let id = Id::from(self.parents.len());
        self.parents.push(id);
        id
    }

    pub fn size(&self) -> usize {
        self.parents.len()
    }

    fn parent(&self, query: Id) -> Id {
        self.parents[usize::from(query)]
    }

    fn set_parent(&mut self, query: Id, parent: Id) {
        self.parents[usize::from(query)] = parent
    }

    pub fn find(&self, mut current: Id) -> Id {
        while current != self.parent(current) {
            current = self.parent(current)
        }
        current
    }

    /// Like [`UnionFind::find`], but compresses paths to the root as a side
    /// effect.
    pub fn find_mut(&mut self, mut current: Id) -> Id {
        while current != self.parent(current) {
            let grandparent = self.parent(self.parent(current));
            self.set_parent(current, grandparent);
            current = grandparent;
        }
        current
    }

    /// Given two leader ids, unions the two eclasses making `root1` the
    /// leader.
    pub fn union(&mut self, root1: Id, root2: Id) -> Id {
        debug_assert_eq!(root1, self.parent(root1));
        debug_assert_eq!(root2, self.parent(root2));
        self.set_parent(root2, root1);
        root1
    }
}
