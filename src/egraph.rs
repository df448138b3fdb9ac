use std::fmt::{self, Debug};

use log::*;

use crate::{
    rewrite::ENodeOrClass,
    util::{concat_vecs, HashMap, HashSet, IndexMap},
    Analysis, EClass, Error, Id, Language, RecExpr, UnionFind,
};

/// A data structure to keep track of equalities between expressions.
///
/// The egraph owns every [`EClass`] and the hashcons table mapping each
/// canonical enode to its owning class; classes are addressed by dense
/// integer [`Id`]s backed by an index-based union-find. It is a transient,
/// per-pass working structure: build it, saturate it, extract from it,
/// drop it.
///
/// Mutation goes through three operations:
///
/// - [`EGraph::add`] hashconses a node, so structurally identical
///   sub-expressions share a class even before any rewriting;
/// - [`EGraph::union`] merges two classes, *deferring* congruence repair;
/// - [`EGraph::rebuild`] restores the congruence and hashcons invariants to
///   a fixpoint. It must run before matching, type propagation, or
///   extraction; the driver and the extractors check this.
///
/// The version counter increments on every successful union, so dependent
/// analyses can detect staleness cheaply.
pub struct EGraph<L: Language, N: Analysis<L>> {
    /// The analysis (checked-type computation) attached to this egraph.
    pub analysis: N,
    memo: HashMap<L, Id>,
    unionfind: UnionFind,
    classes: IndexMap<Id, EClass<L, N::Data>>,
    /// Used-by entries whose keys went stale on a union, awaiting
    /// re-canonicalization by `rebuild`.
    pending: Vec<(L, Id)>,
    /// Nodes whose class data may need to be re-made after a data merge.
    analysis_pending: Vec<(L, Id)>,
    /// Classes created or changed since the driver last drained them.
    dirty: Vec<Id>,
    version: u64,
    clean: bool,
}

impl<L: Language, N: Analysis<L> + Default> Default for EGraph<L, N> {
    fn default() -> Self {
        Self::new(N::default())
    }
}

impl<L: Language + Debug, N: Analysis<L>> Debug for EGraph<L, N> {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.debug_struct("EGraph")
            .field("memo", &self.memo)
            .field("classes", &self.classes)
            .finish()
    }
}

impl<L: Language, N: Analysis<L>> EGraph<L, N> {
    /// Creates a new, empty egraph with the given analysis.
    pub fn new(analysis: N) -> Self {
        Self {
            analysis,
            memo: Default::default(),
            unionfind: Default::default(),
            classes: Default::default(),
            pending: Default::default(),
            analysis_pending: Default::default(),
            dirty: Default::default(),
            version: 0,
            clean: true,
        }
    }

    /// Returns an iterator over the live eclasses in the egraph.
    pub fn classes(&self) -> impl ExactSizeIterator<Item = &EClass<L, N::Data>> {
        self.classes.values()
    }

    /// Returns `true` if the egraph is empty.
    pub fn is_empty(&self) -> bool {
        self.memo.is_empty()
    }

    /// The size of the hashcons index, an upper bound on the number of
    /// distinct canonical enodes.
    pub fn total_size(&self) -> usize {
        self.memo.len()
    }

    /// The number of enodes summed over all live classes.
    pub fn total_number_of_nodes(&self) -> usize {
        self.classes().map(|c| c.len()).sum()
    }

    /// The number of live eclasses.
    pub fn number_of_classes(&self) -> usize {
        self.classes.len()
    }

    /// How many successful unions this egraph has performed. Dependent
    /// analyses can compare snapshots of this counter to detect staleness.
    pub fn version(&self) -> u64 {
        self.version
    }

    /// Whether the congruence and hashcons invariants currently hold, i.e.
    /// no unions have happened since the last [`EGraph::rebuild`].
    pub fn is_clean(&self) -> bool {
        self.clean
    }

    /// Canonicalizes an eclass id.
    pub fn find(&self, id: Id) -> Id {
        self.unionfind.find(id)
    }

    /// Drains the list of classes created or touched since the last drain,
    /// canonicalized and deduplicated. The rewrite driver uses this to only
    /// re-match rules against classes that could have new matches.
    pub fn take_dirty(&mut self) -> Vec<Id> {
        let dirty = std::mem::take(&mut self.dirty);
        let mut seen = HashSet::default();
        let mut out = Vec::with_capacity(dirty.len());
        for id in dirty {
            let id = self.unionfind.find_mut(id);
            if self.classes.contains_key(&id) && seen.insert(id) {
                out.push(id);
            }
        }
        out
    }

    /// Adds a whole expression to the egraph, bottom-up, returning the id
    /// of the class containing the root.
    pub fn add_expr(&mut self, expr: &RecExpr<L>) -> Id {
        let nodes = expr.as_ref();
        assert!(!nodes.is_empty(), "cannot add an empty expression");
        let mut ids = Vec::with_capacity(nodes.len());
        for node in nodes {
            let node = node.clone().map_children(|i| ids[usize::from(i)]);
            ids.push(self.add(node));
        }
        *ids.last().unwrap()
    }

    /// Adds a candidate expression whose leaves may refer to classes that
    /// already exist in this egraph. This is how the rewrite driver turns a
    /// rule's proposal into graph nodes.
    pub fn add_instantiation(&mut self, candidate: &RecExpr<ENodeOrClass<L>>) -> Id {
        let nodes = candidate.as_ref();
        assert!(!nodes.is_empty(), "cannot instantiate an empty candidate");
        let mut ids = Vec::with_capacity(nodes.len());
        for node in nodes {
            let id = match node {
                ENodeOrClass::Class(c) => self.find(*c),
                ENodeOrClass::Node(n) => {
                    let n = n.clone().map_children(|i| ids[usize::from(i)]);
                    self.add(n)
                }
            };
            ids.push(id);
        }
        *ids.last().unwrap()
    }

    /// Looks up a node in the hashcons table, resolving it to its live
    /// owning class if present.
    pub fn lookup(&self, mut enode: L) -> Option<Id> {
        enode.update_children(|id| self.find(id));
        self.memo.get(&enode).map(|&id| self.find(id))
    }

    /// Adds an enode to the egraph, returning the id of the class that
    /// contains it.
    ///
    /// If the canonicalized node is already present, the existing class is
    /// returned and nothing changes. Otherwise a fresh singleton class is
    /// allocated, the node is hashconsed, and a used-by link is registered
    /// on each operand class.
    pub fn add(&mut self, mut enode: L) -> Id {
        enode.update_children(|id| self.unionfind.find_mut(id));
        if let Some(&existing) = self.memo.get(&enode) {
            let existing = self.find(existing);
            trace!("adding (hit {existing:?}) {enode:?}");
            return existing;
        }

        let id = self.unionfind.make_set();
        trace!("adding {enode:?} as {id:?}");
        let data = N::make(self, &enode);
        for &child in enode.children() {
            let class = self
                .classes
                .get_mut(&child)
                .expect("operand of an added node must be a live class");
            class.parents.push((enode.clone(), id));
        }
        self.classes.insert(
            id,
            EClass {
                id,
                nodes: vec![enode.clone()],
                data,
                parents: Default::default(),
            },
        );
        let old = self.memo.insert(enode, id);
        debug_assert!(old.is_none());
        self.dirty.push(id);

        N::modify(self, id);
        id
    }

    /// Unions two eclasses, returning the id of the surviving class and
    /// whether anything actually changed.
    ///
    /// If the two ids already share a root this is a no-op returning
    /// `false`. Otherwise the smaller class is merged into the larger one
    /// (its nodes and used-by entries are drained into the winner, and it
    /// disappears from the class table), the analysis data of the two
    /// classes is merged (a disagreement on checked types is the fatal
    /// [`Error::TypeMismatch`]), and the version counter is bumped.
    ///
    /// Congruence is *not* restored here; call [`EGraph::rebuild`] once a
    /// batch of unions is done.
    pub fn union(&mut self, id1: Id, id2: Id) -> Result<(Id, bool), Error> {
        let root1 = self.unionfind.find_mut(id1);
        let root2 = self.unionfind.find_mut(id2);
        if root1 == root2 {
            return Ok((root1, false));
        }

        // size-based tie-break: keep the bigger class as the root
        let (to, from) = if self.classes[&root1].len() >= self.classes[&root2].len() {
            (root1, root2)
        } else {
            (root2, root1)
        };
        trace!("unioning {from:?} into {to:?}");

        self.unionfind.union(to, from);
        self.version += 1;
        self.clean = false;

        let from_class = self
            .classes
            .swap_remove(&from)
            .expect("union of a dead class");
        // every node that used `from` as an operand now has a stale key
        self.pending.extend(from_class.parents.iter().cloned());

        let to_class = self.classes.get_mut(&to).unwrap();
        let data_changed = self.analysis.merge(&mut to_class.data, from_class.data)?;
        if data_changed {
            self.analysis_pending.extend(to_class.parents.iter().cloned());
        }
        concat_vecs(&mut to_class.nodes, from_class.nodes);
        concat_vecs(&mut to_class.parents, from_class.parents);
        self.dirty.push(to);

        N::modify(self, to);
        Ok((to, true))
    }

    /// Restores the egraph invariants after a batch of unions, running to a
    /// fixpoint. Returns the number of unions performed by congruence
    /// closure.
    ///
    /// Every used-by node of a merged-away class is canonicalized and
    /// re-inserted into the hashcons table; when canonicalization reveals
    /// that two previously distinct nodes became identical, their owning
    /// classes are unioned, which can cascade. Analysis data is re-made and
    /// merged upward along used-by edges until nothing changes.
    pub fn rebuild(&mut self) -> Result<usize, Error> {
        let start_version = self.version;
        let n_unions = self.process_unions()?;
        let trimmed = self.rebuild_classes();
        self.clean = true;
        debug!(
            "rebuilt: {} congruence unions (version {} -> {}), {} duplicate nodes trimmed",
            n_unions, start_version, self.version, trimmed
        );
        Ok(n_unions)
    }

    fn process_unions(&mut self) -> Result<usize, Error> {
        let mut n_unions = 0;
        while !self.pending.is_empty() || !self.analysis_pending.is_empty() {
            while let Some((mut node, class)) = self.pending.pop() {
                node.update_children(|id| self.unionfind.find_mut(id));
                let class = self.unionfind.find_mut(class);
                if let Some(memo_class) = self.memo.insert(node, class) {
                    let (_, did_something) = self.union(memo_class, class)?;
                    if did_something {
                        n_unions += 1;
                    }
                }
            }

            while let Some((node, class_id)) = self.analysis_pending.pop() {
                let class_id = self.unionfind.find_mut(class_id);
                let node_data = N::make(self, &node);
                let class = self.classes.get_mut(&class_id).unwrap();
                let did_change = self.analysis.merge(&mut class.data, node_data)?;
                if did_change {
                    self.analysis_pending.extend(class.parents.iter().cloned());
                    N::modify(self, class_id);
                }
            }
        }
        Ok(n_unions)
    }

    /// Canonicalizes and deduplicates every class's member nodes, returning
    /// the number of duplicates trimmed.
    fn rebuild_classes(&mut self) -> usize {
        let mut trimmed = 0;
        let uf = &mut self.unionfind;
        for class in self.classes.values_mut() {
            let old_len = class.nodes.len();
            class
                .nodes
                .iter_mut()
                .for_each(|n| n.update_children(|id| uf.find_mut(id)));
            class.nodes.sort_unstable();
            class.nodes.dedup();
            trimmed += old_len - class.nodes.len();
        }
        trimmed
    }

    /// The classes owning the nodes that use `id` as an operand,
    /// canonicalized and deduplicated.
    pub fn parent_classes(&self, id: Id) -> Vec<Id> {
        let id = self.find(id);
        let mut out: Vec<Id> = self[id]
            .parents
            .iter()
            .map(|(_, owner)| self.find(*owner))
            .collect();
        out.sort_unstable();
        out.dedup();
        out
    }

    /// The set of classes reachable from `roots` by following member
    /// nodes' operand edges. The placement pass uses this to prune dead
    /// speculative candidates before formulating constrained extraction.
    pub fn reachable_from(&self, roots: &[Id]) -> HashSet<Id> {
        let mut seen = HashSet::default();
        let mut stack: Vec<Id> = roots.iter().map(|&r| self.find(r)).collect();
        while let Some(id) = stack.pop() {
            if seen.insert(id) {
                for node in &self[id].nodes {
                    for &child in node.children() {
                        stack.push(self.find(child));
                    }
                }
            }
        }
        seen
    }

    /// Panics if the congruence or hashcons-uniqueness invariants do not
    /// hold. Only meaningful on a clean (rebuilt) egraph; used as a test
    /// oracle.
    pub fn check_invariants(&self) {
        assert!(self.clean, "check_invariants called before rebuild");
        let mut owner: HashMap<L, Id> = HashMap::default();
        for class in self.classes.values() {
            assert_eq!(self.find(class.id), class.id, "stored class is not a root");
            for node in &class.nodes {
                let canon = node.clone().map_children(|id| self.find(id));
                assert_eq!(
                    &canon, node,
                    "member node of class {} has non-canonical operands",
                    class.id
                );
                if let Some(prev) = owner.insert(canon.clone(), class.id) {
                    assert_eq!(
                        prev, class.id,
                        "two live classes share the canonical node {:?}",
                        canon
                    );
                }
                assert_eq!(
                    self.lookup(canon.clone()),
                    Some(class.id),
                    "hashcons does not resolve {:?} to its owner",
                    canon
                );
            }
        }
    }
}

impl<L: Language, N: Analysis<L>> std::ops::Index<Id> for EGraph<L, N> {
    type Output = EClass<L, N::Data>;
    fn index(&self, id: Id) -> &Self::Output {
        let id = self.find(id);
        self.classes
            .get(&id)
            .unwrap_or_else(|| panic!("Invalid id {}", id))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::SymbolLang;

    #[test]
    fn simple_add_shares_structure() {
        crate::init_logger();
        let mut egraph = EGraph::<SymbolLang, ()>::default();

        let x = egraph.add(SymbolLang::leaf("x"));
        let x2 = egraph.add(SymbolLang::leaf("x"));
        assert_eq!(x, x2);

        let plus = egraph.add(SymbolLang::new("+", vec![x, x2]));
        let plus2 = egraph.add(SymbolLang::new("+", vec![x, x]));
        assert_eq!(plus, plus2);
        assert_eq!(egraph.number_of_classes(), 2);
    }

    #[test]
    fn union_is_idempotent() {
        let mut egraph = EGraph::<SymbolLang, ()>::default();
        let x = egraph.add(SymbolLang::leaf("x"));
        let y = egraph.add(SymbolLang::leaf("y"));

        let v0 = egraph.version();
        let (_, did) = egraph.union(x, y).unwrap();
        assert!(did);
        assert_eq!(egraph.version(), v0 + 1);

        let (_, did) = egraph.union(x, y).unwrap();
        assert!(!did);
        assert_eq!(egraph.version(), v0 + 1);

        assert_eq!(egraph.find(x), egraph.find(y));
        assert_eq!(egraph.find(egraph.find(x)), egraph.find(x));
    }

    #[test]
    fn rebuild_restores_congruence() {
        crate::init_logger();
        let mut egraph = EGraph::<SymbolLang, ()>::default();

        let x = egraph.add(SymbolLang::leaf("x"));
        let y = egraph.add(SymbolLang::leaf("y"));
        let fx = egraph.add(SymbolLang::new("f", vec![x]));
        let fy = egraph.add(SymbolLang::new("f", vec![y]));
        assert_ne!(egraph.find(fx), egraph.find(fy));

        egraph.union(x, y).unwrap();
        let n_unions = egraph.rebuild().unwrap();
        assert_eq!(n_unions, 1);
        assert_eq!(egraph.find(fx), egraph.find(fy));
        egraph.check_invariants();

        // rebuilding an already-clean egraph does nothing
        let version = egraph.version();
        assert_eq!(egraph.rebuild().unwrap(), 0);
        assert_eq!(egraph.version(), version);
    }

    #[test]
    fn rebuild_cascades() {
        crate::init_logger();
        let mut egraph = EGraph::<SymbolLang, ()>::default();

        let x = egraph.add(SymbolLang::leaf("x"));
        let y = egraph.add(SymbolLang::leaf("y"));
        let fx = egraph.add(SymbolLang::new("f", vec![x]));
        let fy = egraph.add(SymbolLang::new("f", vec![y]));
        let gfx = egraph.add(SymbolLang::new("g", vec![fx]));
        let gfy = egraph.add(SymbolLang::new("g", vec![fy]));

        egraph.union(x, y).unwrap();
        egraph.rebuild().unwrap();

        assert_eq!(egraph.find(gfx), egraph.find(gfy));
        egraph.check_invariants();
    }

    #[test]
    fn dirty_tracking() {
        let mut egraph = EGraph::<SymbolLang, ()>::default();
        let x = egraph.add(SymbolLang::leaf("x"));
        let y = egraph.add(SymbolLang::leaf("y"));
        egraph.rebuild().unwrap();

        let dirty = egraph.take_dirty();
        assert_eq!(dirty.len(), 2);
        assert!(egraph.take_dirty().is_empty());

        egraph.union(x, y).unwrap();
        egraph.rebuild().unwrap();
        let dirty = egraph.take_dirty();
        assert_eq!(dirty, vec![egraph.find(x)]);
    }
}
