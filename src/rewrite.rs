use std::fmt::{self, Display};

use crate::{Analysis, EGraph, Error, Id, Language, RecExpr};

/// A node in a [`Candidate`] expression: either a brand-new enode or a
/// reference to a class that already exists in the egraph.
///
/// Class references act as leaves, which lets [`RecExpr`] and the normal
/// add path be reused for instantiating rule proposals (see
/// [`EGraph::add_instantiation`]).
#[derive(Debug, Hash, PartialEq, Eq, Clone, PartialOrd, Ord)]
pub enum ENodeOrClass<L> {
    /// A new enode; its children index into the candidate expression.
    Node(L),
    /// An existing eclass in the egraph being rewritten.
    Class(Id),
}

impl<L: Language> Language for ENodeOrClass<L> {
    fn matches(&self, other: &Self) -> bool {
        match (self, other) {
            (ENodeOrClass::Node(a), ENodeOrClass::Node(b)) => a.matches(b),
            (ENodeOrClass::Class(a), ENodeOrClass::Class(b)) => a == b,
            _ => false,
        }
    }

    fn children(&self) -> &[Id] {
        match self {
            ENodeOrClass::Node(n) => n.children(),
            ENodeOrClass::Class(_) => &[],
        }
    }

    fn children_mut(&mut self) -> &mut [Id] {
        match self {
            ENodeOrClass::Node(n) => n.children_mut(),
            ENodeOrClass::Class(_) => &mut [],
        }
    }
}

impl<L: Language + Display> Display for ENodeOrClass<L> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ENodeOrClass::Node(n) => Display::fmt(n, f),
            ENodeOrClass::Class(id) => write!(f, "${}", id),
        }
    }
}

/// A replacement expression proposed by a [`Rewrite`], built bottom-up like
/// any [`RecExpr`]. Leaves may reference existing classes.
pub type Candidate<L> = RecExpr<ENodeOrClass<L>>;

impl<L: Language> Candidate<L> {
    /// Adds a reference to an existing eclass, returning its local id.
    pub fn class(&mut self, id: Id) -> Id {
        self.add(ENodeOrClass::Class(id))
    }

    /// Adds a new enode whose children are local ids, returning its local
    /// id.
    pub fn node(&mut self, node: L) -> Id {
        self.add(ENodeOrClass::Node(node))
    }
}

/// A rewrite rule: a pattern test over one eclass plus a way to propose
/// replacement expressions for a match.
///
/// Rules are held by the caller as plain trait objects in an ordered slice;
/// the [`Runner`](crate::Runner) drives them to saturation. A rule that
/// matches but proposes nothing is an ordinary non-match. A rule returning
/// an error aborts the whole pass.
///
/// Proposing *several* candidates is how deliberately ambiguous rules are
/// written: every candidate is added and unioned with the matched class,
/// so alternatives are merged rather than committed to, and the actual
/// decision is deferred to extraction.
pub trait Rewrite<L: Language, N: Analysis<L>> {
    /// A name for this rule, used in logs and saturation statistics.
    fn name(&self) -> &str;

    /// Tests this rule against one class's member nodes. Must not mutate
    /// anything; the driver may run this phase over many classes before
    /// committing any proposal.
    fn matches(&self, egraph: &EGraph<L, N>, eclass: Id) -> bool;

    /// Given a matched class, returns zero or more replacement expressions
    /// to merge into it.
    fn propose(&self, egraph: &EGraph<L, N>, eclass: Id) -> Result<Vec<Candidate<L>>, Error>;
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::SymbolLang;

    /// (+ a b) => (+ b a)
    struct CommutePlus;

    impl Rewrite<SymbolLang, ()> for CommutePlus {
        fn name(&self) -> &str {
            "commute-plus"
        }

        fn matches(&self, egraph: &EGraph<SymbolLang, ()>, eclass: Id) -> bool {
            egraph[eclass]
                .iter()
                .any(|n| n.op == "+".into() && n.len() == 2)
        }

        fn propose(
            &self,
            egraph: &EGraph<SymbolLang, ()>,
            eclass: Id,
        ) -> Result<Vec<Candidate<SymbolLang>>, Error> {
            let mut candidates = vec![];
            for n in egraph[eclass].iter() {
                if n.op == "+".into() && n.len() == 2 {
                    let mut c = Candidate::default();
                    let b = c.class(n.children[1]);
                    let a = c.class(n.children[0]);
                    c.node(SymbolLang::new("+", vec![b, a]));
                    candidates.push(c);
                }
            }
            Ok(candidates)
        }
    }

    #[test]
    fn propose_and_instantiate() {
        crate::init_logger();
        let mut egraph = EGraph::<SymbolLang, ()>::default();
        let a = egraph.add(SymbolLang::leaf("a"));
        let b = egraph.add(SymbolLang::leaf("b"));
        let ab = egraph.add(SymbolLang::new("+", vec![a, b]));
        egraph.rebuild().unwrap();

        assert!(CommutePlus.matches(&egraph, ab));
        let candidates = CommutePlus.propose(&egraph, ab).unwrap();
        assert_eq!(candidates.len(), 1);

        let ba = egraph.add_instantiation(&candidates[0]);
        assert_ne!(egraph.find(ab), egraph.find(ba));
        egraph.union(ab, ba).unwrap();
        egraph.rebuild().unwrap();
        assert_eq!(egraph.find(ab), egraph.find(ba));
        egraph.check_invariants();
    }
}
