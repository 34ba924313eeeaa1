//! # Solving Support
//!
//! The pieces of runtime state the search driver and the embedded-network
//! constraint need: the backtrackable store, the contradiction signal,
//! variable events, and the preprocessing feature flags that event
//! channelling temporarily disables.

use thiserror::Error;

use crate::types::{Value, Var};

pub mod embedded;
pub mod store;

pub use embedded::{EmbedError, Session, WcspConstraint, WcspId};
pub use store::Trail;

/// The non-local failure signal raised when a network becomes infeasible
/// (empty domain, or lower bound reaching the upper bound). Callers unwind
/// with `?`; the raiser has already left the originating network in a
/// consistent state.
#[derive(Error, Debug, Clone, Copy, PartialEq, Eq)]
#[error("contradiction")]
pub struct Contradiction;

/// A change applied to a variable's current domain
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EventKind {
    /// The variable was assigned the value
    Assign(Value),
    /// The value was removed from the domain
    Remove(Value),
    /// The domain lower bound was raised to the value
    Increase(Value),
    /// The domain upper bound was lowered to the value
    Decrease(Value),
}

/// A domain event on a variable, as queued by a network's internal operations
/// and channelled between the networks of an embedded-constraint family
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct VarEvent {
    /// The variable the event happened on
    pub var: Var,
    /// What happened
    pub kind: EventKind,
}

/// Preprocessing and propagation features that are incompatible with
/// cross-network event channelling. While a channelled event is in flight the
/// features are overwritten with their propagation-safe defaults and restored
/// on exit.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Features {
    /// Functional variable elimination level
    pub functional_elim: i32,
    /// Generic variable elimination degree (search)
    pub elim_degree: i32,
    /// Generic variable elimination degree (preprocessing)
    pub elim_degree_preprocessing: i32,
    /// Dead-end elimination level
    pub dead_end_elim: i32,
    /// VAC-integrality based value heuristic
    pub vac_integrality: bool,
    /// Relaxed-augmenting-path singleton tests
    pub rasps: bool,
}

impl Default for Features {
    fn default() -> Self {
        Features {
            functional_elim: 1,
            elim_degree: 2,
            elim_degree_preprocessing: -1,
            dead_end_elim: 0,
            vac_integrality: false,
            rasps: false,
        }
    }
}

impl Features {
    /// The propagation-safe defaults installed while a channelled event is in
    /// flight
    #[must_use]
    pub fn protected() -> Self {
        Features {
            functional_elim: 0,
            elim_degree: -1,
            elim_degree_preprocessing: -1,
            dead_end_elim: 0,
            vac_integrality: false,
            rasps: false,
        }
    }
}
