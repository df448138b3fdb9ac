#![warn(missing_docs)]
/*!

`eqsat` is an equality saturation engine built around an e-graph with
congruence closure, a saturating rewrite-rule driver, and two extractors:
a greedy per-class extractor and a globally constrained extractor that
formulates extraction as an integer program when choices interact through
shared resource budgets.

The main consumer shipped with the crate is the auto-distributed tensor
placement pass ([`PlacementPass`]), which builds per-value sharding
alternatives as e-classes and uses the constrained extractor to pick a
mutually consistent combination under per-device memory budgets.

## Logging

Many parts of `eqsat` dump useful logging info using the
[`log`](https://docs.rs/log/) crate. The easiest way to see this info is to
use the [`env_logger`](https://docs.rs/env_logger/) crate in your binary or
test, and set the environment variable `RUST_LOG=eqsat=info` (or `debug` or
`trace` for more).

*/

mod eclass;
mod egraph;
mod extract;
mod language;
mod lp_extract;
mod placement;
mod rewrite;
mod run;
mod tensor;
mod unionfind;
mod util;

/// A key to identify [`EClass`]es within an [`EGraph`].
#[derive(Clone, Copy, Default, Ord, PartialOrd, Eq, PartialEq, Hash)]
pub struct Id(u32);

impl From<usize> for Id {
    fn from(n: usize) -> Id {
        Id(n as u32)
    }
}

impl From<Id> for usize {
    fn from(id: Id) -> usize {
        id.0 as usize
    }
}

impl std::fmt::Debug for Id {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl std::fmt::Display for Id {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// The errors the engine can produce.
///
/// [`Error::Infeasible`] and [`Error::SolveTimeout`] are recoverable
/// outcomes of constrained extraction; callers are expected to either fall
/// back to greedy extraction (as [`PlacementPass`] does) or fail the pass
/// with a clear message. Everything else is fatal to the running pass and
/// should be propagated.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// Two merged e-classes disagree on their checked type. The graph no
    /// longer denotes a well-typed program and the pass must abort.
    #[error("merged classes disagree on checked type: {to} vs {from}")]
    TypeMismatch {
        /// Type recorded on the surviving class.
        to: String,
        /// Type recorded on the class merged into it.
        from: String,
    },

    /// A rewrite rule failed while proposing candidates.
    #[error("rewrite rule '{rule}' failed: {reason}")]
    Rule {
        /// Name of the offending rule.
        rule: String,
        /// What the rule reported.
        reason: String,
    },

    /// Greedy extraction re-entered a class that was still being built on
    /// the current path. Unreachable given a rebuilt graph and a monotone
    /// cost function, so hitting it indicates a cost-model bug.
    #[error("extraction revisited class {class} while it was still in progress")]
    ExtractionCycle {
        /// The class that was revisited.
        class: Id,
    },

    /// Cost relaxation failed to converge within its iteration bound,
    /// which distinguishes a genuine cost cycle from slow convergence.
    #[error(
        "cost relaxation did not converge after {rounds} rounds; the cost model likely admits a cycle"
    )]
    CostCycle {
        /// How many relaxation rounds ran before giving up.
        rounds: usize,
    },

    /// A class ended extraction with no candidate whose cost is known.
    #[error("class {class} has no extractable candidate")]
    NoBestNode {
        /// The class without a best node.
        class: Id,
    },

    /// A program value has zero legal placement candidates.
    #[error("no viable placement candidate for the value in class {class}")]
    NoViableCandidate {
        /// The class of the offending value.
        class: Id,
    },

    /// The constrained extraction problem has no solution under the given
    /// resource limits.
    #[error("constrained extraction is infeasible under the given resource limits")]
    Infeasible,

    /// The constraint solver gave up before finding a solution.
    #[error("constraint solver timed out")]
    SolveTimeout,

    /// Any other constraint solver failure.
    #[error("constraint solver failed: {0}")]
    Solver(String),
}

pub(crate) use unionfind::UnionFind;

pub use {
    eclass::EClass,
    egraph::EGraph,
    extract::{AstSize, CostFunction, Extractor},
    language::{Analysis, Language, RecExpr, SymbolLang},
    lp_extract::{LpCostFunction, LpExtractor},
    placement::{Device, Placement, PlacementCost, PlacementPass, Topology},
    rewrite::{Candidate, ENodeOrClass, Rewrite},
    run::{Iteration, Runner, StopReason},
    tensor::{Layout, Shape, ShapeAnalysis, TensorLang},
    util::Symbol,
};

#[cfg(test)]
fn init_logger() {
    let _ = env_logger::builder().is_test(true).try_init();
}
