//! # Embedding Networks as Constraints
//!
//! A [`WcspConstraint`] binds a master network to up to two slave networks
//! so that the master treats "the slave optimum lies in `[lb, ub)`" as a
//! single constraint over channelling variables. The optional negated slave
//! witnesses the upper side of the window through its own lower bound.
//!
//! All the state that coordinates the family lives in a [`Session`]: the
//! networks themselves, the slave-index table locating the owning
//! constraint, the preprocessing feature flags, and the protection guard
//! that disables features incompatible with channelling while an event is
//! in flight. Events (assignments, value removals, domain-bound
//! tightenings) are applied to the originating network first and then
//! forwarded to every other family member in ascending slave order, never
//! re-entering the network they came from.

use std::collections::BTreeMap;

use log::trace;
use thiserror::Error;

use crate::{
    instances::{BuildError, CostFnKind, Wcsp},
    solving::{Contradiction, EventKind, Features, Trail, VarEvent},
    types::{costs::Cost, Value, Var},
};

/// Identifier of a network within a session
pub type WcspId = usize;

/// How many unassigned scope variables remain before the constraint is
/// projected onto a plain cost table
const NARY_PROJECTION_SIZE: usize = 3;

/// Errors raised while posting an embedded-network constraint
#[derive(Error, Debug, PartialEq)]
pub enum EmbedError {
    /// The feasibility window is empty
    #[error("wrong bounds in embedded network constraint: {0} must be below {1}")]
    WrongBounds(Cost, Cost),
    /// The scope does not cover the slave's variables one to one
    #[error("scope of arity {0} does not match the slave's {1} variables")]
    ArityMismatch(usize, usize),
    /// A channelling variable and its slave counterpart differ in domain
    #[error("channelling variable {0} and its slave counterpart have different domain sizes")]
    DomainMismatch(Var),
    /// Two embedded constraints may share a master but never a slave
    #[error("network {0} is already the slave of another embedded constraint")]
    SlaveInUse(WcspId),
    /// The slave network must not itself contain an embedded constraint
    #[error("the slave network contains an embedded constraint itself")]
    SlaveHasEmbedded,
    /// Initial bound tightening found the slave infeasible
    #[error("slave network is infeasible under the requested bounds")]
    Infeasible,
    /// Posting the master-side marker failed
    #[error(transparent)]
    Build(#[from] BuildError),
}

/// An embedded-network constraint: the slave optimum must lie in `[lb, ub)`
#[derive(Debug)]
pub struct WcspConstraint {
    /// Channelling variables in the master, one per slave variable in slave
    /// index order
    scope: Vec<Var>,
    /// The slave witnessing the lower side of the window
    problem: Option<WcspId>,
    /// The negated slave witnessing the upper side
    negproblem: Option<WcspId>,
    lb: Cost,
    ub: Cost,
    /// Sum of the cost shifts of both slaves
    neg_cost: Cost,
    /// Whether every complete assignment has a finite slave cost (or a
    /// redundant master constraint forbids the infinite ones)
    is_finite: bool,
    /// Assume the slave optimum on the remaining variables lies in the
    /// window once all channelling variables are assigned
    strong_duality: bool,
    /// Unassigned scope variables, backtrackable through the session trail
    non_assigned: usize,
    /// Constraint id of the marker inside the master network
    marker: usize,
}

impl WcspConstraint {
    /// The feasibility window's inclusive lower bound
    #[must_use]
    pub fn lb(&self) -> Cost {
        self.lb
    }

    /// The feasibility window's strict upper bound
    #[must_use]
    pub fn ub(&self) -> Cost {
        self.ub
    }

    /// The number of unassigned channelling variables
    #[must_use]
    pub fn non_assigned(&self) -> usize {
        self.non_assigned
    }

    /// The channelling scope
    #[must_use]
    pub fn scope(&self) -> &[Var] {
        &self.scope
    }
}

/// Session-level backtrackable state
#[derive(Debug, Clone)]
enum SessionRestore {
    NonAssigned(usize, usize),
}

/// The solver context owning a family of networks: one master, its embedded
/// constraints and their slaves. Replaces process-wide state so that several
/// sessions can coexist.
#[derive(Debug, Default)]
pub struct Session {
    wcsps: Vec<Wcsp>,
    master: Option<WcspId>,
    constraints: Vec<WcspConstraint>,
    /// Locates the owning constraint from a slave network id, iterated in
    /// ascending order when forwarding events
    by_slave: BTreeMap<WcspId, usize>,
    features: Features,
    saved_features: Option<Features>,
    trail: Trail<SessionRestore>,
}

impl Session {
    /// Creates an empty session with default feature levels
    #[must_use]
    pub fn new() -> Session {
        Session {
            wcsps: vec![],
            master: None,
            constraints: vec![],
            by_slave: BTreeMap::new(),
            features: Features::default(),
            saved_features: None,
            trail: Trail::new(),
        }
    }

    /// Moves a network into the session and returns its id
    pub fn attach(&mut self, mut wcsp: Wcsp) -> WcspId {
        let id = self.wcsps.len();
        wcsp.set_index(id);
        self.wcsps.push(wcsp);
        id
    }

    /// Access to a network
    ///
    /// # Panics
    ///
    /// If the id is not attached.
    #[must_use]
    pub fn wcsp(&self, id: WcspId) -> &Wcsp {
        &self.wcsps[id]
    }

    /// Mutable access to a network
    ///
    /// # Panics
    ///
    /// If the id is not attached.
    pub fn wcsp_mut(&mut self, id: WcspId) -> &mut Wcsp {
        &mut self.wcsps[id]
    }

    /// Access to an embedded constraint
    ///
    /// # Panics
    ///
    /// If the constraint does not exist.
    #[must_use]
    pub fn constraint(&self, cidx: usize) -> &WcspConstraint {
        &self.constraints[cidx]
    }

    /// The current preprocessing feature levels (overwritten while an event
    /// is in flight)
    #[must_use]
    pub fn features(&self) -> &Features {
        &self.features
    }

    /// Sets the preprocessing feature levels
    pub fn set_features(&mut self, features: Features) {
        self.features = features;
    }

    /// Whether the protection guard is currently held
    #[must_use]
    pub fn is_protected(&self) -> bool {
        self.saved_features.is_some()
    }

    /// Whether an embedded constraint is still part of the master's active
    /// network
    ///
    /// # Panics
    ///
    /// If the constraint does not exist.
    #[must_use]
    pub fn connected(&self, cidx: usize) -> bool {
        let constr = &self.constraints[cidx];
        self.master
            .is_some_and(|m| self.wcsps[m].connected(constr.marker))
    }

    // === posting ==========================================================

    /// Posts an embedded-network constraint on the master. The scope lists
    /// the channelling variables in slave index order; `duplicate_hard`
    /// asserts that a redundant master constraint forbids the slave's
    /// infinite assignments.
    ///
    /// # Errors
    ///
    /// [`EmbedError`] on an empty window, mismatched scope, a reused slave,
    /// a slave containing an embedded constraint itself, or infeasible
    /// initial bounds.
    #[allow(clippy::too_many_arguments, clippy::missing_panics_doc)]
    pub fn post_wcsp_constraint(
        &mut self,
        master: WcspId,
        scope: Vec<Var>,
        problem: Option<WcspId>,
        negproblem: Option<WcspId>,
        lb: Cost,
        ub: Cost,
        duplicate_hard: bool,
        strong_duality: bool,
    ) -> Result<usize, EmbedError> {
        if lb >= ub {
            return Err(EmbedError::WrongBounds(lb, ub));
        }
        // a new master invalidates the table of the previous family
        if self.master.is_some_and(|m| m != master) {
            self.constraints.clear();
            self.by_slave.clear();
        }
        self.master = Some(master);

        let mut neg_cost = Cost::ZERO;
        let mut is_finite = true;
        for slave in [problem, negproblem].into_iter().flatten() {
            if self.by_slave.contains_key(&slave) {
                return Err(EmbedError::SlaveInUse(slave));
            }
            let slave_wcsp = &self.wcsps[slave];
            if slave_wcsp.num_variables() != scope.len() {
                return Err(EmbedError::ArityMismatch(
                    scope.len(),
                    slave_wcsp.num_variables(),
                ));
            }
            for (i, &var) in scope.iter().enumerate() {
                let slave_var = Var::new(u32::try_from(i).expect("scope too large"));
                if self.wcsps[master].variable(var).init_size()
                    != slave_wcsp.variable(slave_var).init_size()
                {
                    return Err(EmbedError::DomainMismatch(var));
                }
            }
            if (0..slave_wcsp.num_constraints())
                .any(|c| matches!(slave_wcsp.constraint(c).kind, CostFnKind::Embedded(_)))
            {
                return Err(EmbedError::SlaveHasEmbedded);
            }
            neg_cost += slave_wcsp.neg_cost();
            if !duplicate_hard && !slave_wcsp.is_finite() {
                is_finite = false;
            }
        }

        let cidx = self.constraints.len();
        if let Some(problem) = problem {
            self.by_slave.insert(problem, cidx);
            self.wcsps[problem].update_ub(ub);
            self.wcsps[problem]
                .enforce_ub()
                .map_err(|Contradiction| EmbedError::Infeasible)?;
        }
        if let Some(negproblem) = negproblem {
            self.by_slave.insert(negproblem, cidx);
            self.wcsps[negproblem].update_ub(-lb + neg_cost + Cost::UNIT);
            self.wcsps[negproblem]
                .enforce_ub()
                .map_err(|Contradiction| EmbedError::Infeasible)?;
        }

        let marker = self.wcsps[master].post_embedded_marker(scope.clone(), cidx);
        let non_assigned = scope.len();
        self.constraints.push(WcspConstraint {
            scope,
            problem,
            negproblem,
            lb,
            ub,
            neg_cost,
            is_finite,
            strong_duality,
            non_assigned,
            marker,
        });
        Ok(cidx)
    }

    // === protection guard =================================================

    fn protect(&mut self) {
        debug_assert!(self.saved_features.is_none(), "protection re-entered");
        self.saved_features = Some(self.features);
        self.features = Features::protected();
    }

    fn unprotect(&mut self) {
        if let Some(saved) = self.saved_features.take() {
            self.features = saved;
        }
    }

    /// Runs the closure with the preprocessing features overwritten by their
    /// propagation-safe defaults; the saved features are restored on every
    /// exit path, including contradictions.
    fn with_protection<T>(
        &mut self,
        f: impl FnOnce(&mut Self) -> Result<T, Contradiction>,
    ) -> Result<T, Contradiction> {
        let held = self.is_protected();
        if !held {
            self.protect();
        }
        let res = f(self);
        if !held {
            self.unprotect();
        }
        res
    }

    // === event channelling ================================================

    /// Assigns a variable in a network and channels the event through the
    /// family
    ///
    /// # Errors
    ///
    /// [`Contradiction`] when the assignment or a forwarded operation makes
    /// a family member infeasible; every slave is cleaned up before the
    /// error reaches the caller.
    pub fn assign(&mut self, origin: WcspId, var: Var, val: Value) -> Result<(), Contradiction> {
        self.channel(origin, var, EventKind::Assign(val))
    }

    /// Removes a value in a network and channels the event
    ///
    /// # Errors
    ///
    /// [`Contradiction`] as for [`Session::assign`].
    pub fn remove(&mut self, origin: WcspId, var: Var, val: Value) -> Result<(), Contradiction> {
        self.channel(origin, var, EventKind::Remove(val))
    }

    /// Raises a domain lower bound in a network and channels the event
    ///
    /// # Errors
    ///
    /// [`Contradiction`] as for [`Session::assign`].
    pub fn increase(&mut self, origin: WcspId, var: Var, val: Value) -> Result<(), Contradiction> {
        self.channel(origin, var, EventKind::Increase(val))
    }

    /// Lowers a domain upper bound in a network and channels the event
    ///
    /// # Errors
    ///
    /// [`Contradiction`] as for [`Session::assign`].
    pub fn decrease(&mut self, origin: WcspId, var: Var, val: Value) -> Result<(), Contradiction> {
        self.channel(origin, var, EventKind::Decrease(val))
    }

    fn apply_op(wcsp: &mut Wcsp, var: Var, kind: EventKind) -> Result<(), Contradiction> {
        match kind {
            EventKind::Assign(val) => wcsp.assign_var(var, val),
            EventKind::Remove(val) => wcsp.remove_value(var, val),
            EventKind::Increase(val) => wcsp.increase_inf(var, val),
            EventKind::Decrease(val) => wcsp.decrease_sup(var, val),
        }
    }

    /// Applies an event to the originating network, then forwards the
    /// drained events through the family under protection
    fn channel(&mut self, origin: WcspId, var: Var, kind: EventKind) -> Result<(), Contradiction> {
        self.wcsps[origin].deactivate_propagate();
        let applied = Self::apply_op(&mut self.wcsps[origin], var, kind);
        let res = match applied {
            Err(Contradiction) => Err(Contradiction),
            Ok(()) => {
                let queue: Vec<(WcspId, VarEvent)> = self.wcsps[origin]
                    .drain_events()
                    .into_iter()
                    .map(|ev| (origin, ev))
                    .collect();
                self.with_protection(|session| session.forward_events(queue))
            }
        };
        self.wcsps[origin].reactivate_propagate();
        res
    }

    /// Forwards queued events to every family member except the one each
    /// event came from. Newly triggered events join the queue with their own
    /// origin; domain monotonicity bounds the fan-out.
    fn forward_events(
        &mut self,
        mut queue: Vec<(WcspId, VarEvent)>,
    ) -> Result<(), Contradiction> {
        let Some(master) = self.master else {
            return Ok(());
        };
        while let Some((from, event)) = queue.pop() {
            trace!("EVENT: {}_{from} {:?}", event.var, event.kind);
            // locate the master-side variable of the event
            let master_var = if from == master {
                event.var
            } else {
                let Some(&cidx) = self.by_slave.get(&from) else {
                    continue;
                };
                self.constraints[cidx].scope[event.var.idx()]
            };
            // the master itself is a forward target for slave events
            if from != master {
                Self::apply_forward(&mut self.wcsps[master], master_var, event.kind)
                    .map_err(|Contradiction| {
                        self.wcsps[master].when_contradiction();
                        Contradiction
                    })?;
                queue.extend(
                    self.wcsps[master]
                        .drain_events()
                        .into_iter()
                        .map(|ev| (master, ev)),
                );
            }
            // then every connected constraint concerned by this variable, in
            // ascending slave order
            let order: Vec<usize> = {
                let mut seen = vec![];
                for &cidx in self.by_slave.values() {
                    if !seen.contains(&cidx) {
                        seen.push(cidx);
                    }
                }
                seen
            };
            for cidx in order {
                if !self.connected(cidx) {
                    continue;
                }
                let Some(pos) = self.constraints[cidx].scope_position(master_var) else {
                    continue;
                };
                let slave_var = Var::new(u32::try_from(pos).expect("scope too large"));
                for slave in [self.constraints[cidx].problem, self.constraints[cidx].negproblem]
                    .into_iter()
                    .flatten()
                {
                    if slave == from {
                        continue;
                    }
                    debug_assert!(self.is_protected());
                    if let Err(Contradiction) =
                        Self::apply_forward(&mut self.wcsps[slave], slave_var, event.kind)
                    {
                        self.wcsps[slave].when_contradiction();
                        return Err(Contradiction);
                    }
                    queue.extend(
                        self.wcsps[slave]
                            .drain_events()
                            .into_iter()
                            .map(|ev| (slave, ev)),
                    );
                }
            }
            // master assignments of scope variables update the constraint
            // counters
            if let EventKind::Assign(_) = event.kind {
                if self.wcsps[master].assigned(master_var) {
                    self.constraint_assigned(master_var)?;
                }
            }
        }
        Ok(())
    }

    /// A forwarded operation: the target's bound gap is enforced before the
    /// variable operation is applied
    fn apply_forward(wcsp: &mut Wcsp, var: Var, kind: EventKind) -> Result<(), Contradiction> {
        wcsp.enforce_ub()?;
        Self::apply_op(wcsp, var, kind)
    }

    /// Bookkeeping after a master-side assignment of a channelling variable:
    /// decrements the counter, deconnects universal constraints and projects
    /// small remainders onto plain tables
    fn constraint_assigned(&mut self, master_var: Var) -> Result<(), Contradiction> {
        let Some(master) = self.master else {
            return Ok(());
        };
        for cidx in 0..self.constraints.len() {
            if !self.connected(cidx)
                || self.constraints[cidx].scope_position(master_var).is_none()
            {
                continue;
            }
            // recomputing from the domains keeps the counter idempotent
            // under forwarded echo events
            let now = self.constraints[cidx]
                .scope
                .iter()
                .filter(|&&v| !self.wcsps[master].assigned(v))
                .count();
            let old = self.constraints[cidx].non_assigned;
            if now >= old {
                continue;
            }
            self.trail.push(SessionRestore::NonAssigned(cidx, old));
            self.constraints[cidx].non_assigned = now;

            if self.universal(cidx) {
                self.deconnect(cidx);
                continue;
            }
            let c = &self.constraints[cidx];
            if c.non_assigned <= NARY_PROJECTION_SIZE
                && (!c.strong_duality || c.non_assigned == 0)
            {
                self.deconnect(cidx);
                self.project_nary(cidx)?;
            } else {
                self.propagate_constraint(cidx)?;
            }
        }
        Ok(())
    }

    // === universality and deconnection ====================================

    /// The constraint is universal when both bound witnesses hold: the slave
    /// lower bound has reached `lb` and the negated slave's lower bound
    /// witnesses the strict upper side. A missing sub-problem counts as
    /// witnessed.
    #[must_use]
    pub fn universal(&self, cidx: usize) -> bool {
        let c = &self.constraints[cidx];
        if !c.is_finite {
            return false;
        }
        let lower = c
            .problem
            .map_or(true, |p| self.wcsps[p].lb() >= c.lb);
        let upper = c
            .negproblem
            .map_or(true, |n| self.wcsps[n].lb().raw() > c.neg_cost.raw() - c.ub.raw());
        lower && upper
    }

    /// Whether every remaining unassigned scope variable is connected to
    /// this constraint only
    #[must_use]
    pub fn can_be_deconnected(&self, cidx: usize) -> bool {
        let Some(master) = self.master else {
            return false;
        };
        self.constraints[cidx].scope.iter().all(|&var| {
            self.wcsps[master].assigned(var) || self.wcsps[master].degree(var) <= 1
        })
    }

    /// Removes the constraint from the master's active network,
    /// backtrackably
    pub fn deconnect(&mut self, cidx: usize) {
        if let Some(master) = self.master {
            let marker = self.constraints[cidx].marker;
            self.wcsps[master].deconnect(marker);
        }
    }

    // === propagation ======================================================

    /// Propagates one embedded constraint: synchronises the slave bounds,
    /// forwards pending master assignments, propagates the slaves under
    /// protection, and applies the strong-duality early deconnection.
    ///
    /// # Errors
    ///
    /// [`Contradiction`] after cleaning up both slaves.
    pub fn propagate_constraint(&mut self, cidx: usize) -> Result<(), Contradiction> {
        if !self.connected(cidx) {
            return Ok(());
        }
        if self.universal(cidx) {
            self.deconnect(cidx);
            return Ok(());
        }
        let c = &self.constraints[cidx];
        let (problem, negproblem, ub, lb, neg_cost, strong_duality) = (
            c.problem,
            c.negproblem,
            c.ub,
            c.lb,
            c.neg_cost,
            c.strong_duality,
        );
        // synchronise the slave bounds with the window
        if let Some(p) = problem {
            self.wcsps[p].update_ub(ub);
            self.enforce_slave_ub(p)?;
        }
        if let Some(n) = negproblem {
            self.wcsps[n].update_ub(-lb + neg_cost + Cost::UNIT);
            self.enforce_slave_ub(n)?;
        }
        self.forward_assignments(cidx)?;
        if !self.connected(cidx) {
            return Ok(());
        }
        let res = self.with_protection(|session| {
            if let Some(p) = problem {
                if session.wcsps[p].propagation_enabled() {
                    session.wcsps[p].propagate()?;
                    let queue: Vec<(WcspId, VarEvent)> = session.wcsps[p]
                        .drain_events()
                        .into_iter()
                        .map(|ev| (p, ev))
                        .collect();
                    session.forward_events(queue)?;
                    if strong_duality
                        && session.connected(cidx)
                        && session.can_be_deconnected(cidx)
                    {
                        if session.wcsps[p].lb() < lb {
                            return Err(Contradiction);
                        }
                        session.deconnect(cidx);
                    }
                }
            }
            if session.connected(cidx) {
                if let Some(n) = negproblem {
                    if session.wcsps[n].propagation_enabled() {
                        session.wcsps[n].propagate()?;
                        let queue: Vec<(WcspId, VarEvent)> = session.wcsps[n]
                            .drain_events()
                            .into_iter()
                            .map(|ev| (n, ev))
                            .collect();
                        session.forward_events(queue)?;
                    }
                }
            }
            Ok(())
        });
        if res.is_err() {
            if let Some(p) = problem {
                self.wcsps[p].when_contradiction();
            }
            if let Some(n) = negproblem {
                self.wcsps[n].when_contradiction();
            }
        }
        res
    }

    /// Propagates the whole session: the master's own propagation followed
    /// by every embedded constraint
    ///
    /// # Errors
    ///
    /// [`Contradiction`] as for [`Session::propagate_constraint`].
    pub fn propagate(&mut self) -> Result<(), Contradiction> {
        if let Some(master) = self.master {
            self.wcsps[master].propagate()?;
            let queue: Vec<(WcspId, VarEvent)> = self.wcsps[master]
                .drain_events()
                .into_iter()
                .map(|ev| (master, ev))
                .collect();
            self.with_protection(|session| session.forward_events(queue))?;
        }
        for cidx in 0..self.constraints.len() {
            self.propagate_constraint(cidx)?;
        }
        Ok(())
    }

    fn enforce_slave_ub(&mut self, slave: WcspId) -> Result<(), Contradiction> {
        self.wcsps[slave].enforce_ub().map_err(|Contradiction| {
            self.wcsps[slave].when_contradiction();
            Contradiction
        })
    }

    /// Forwards the master's already-assigned scope variables into the
    /// slaves ("assigns" phase of propagation)
    fn forward_assignments(&mut self, cidx: usize) -> Result<(), Contradiction> {
        let Some(master) = self.master else {
            return Ok(());
        };
        let scope = self.constraints[cidx].scope.clone();
        let (problem, negproblem) =
            (self.constraints[cidx].problem, self.constraints[cidx].negproblem);
        for (i, &var) in scope.iter().enumerate() {
            let Some(val) = self.wcsps[master].value_of(var) else {
                continue;
            };
            let slave_var = Var::new(u32::try_from(i).expect("scope too large"));
            for slave in [problem, negproblem].into_iter().flatten() {
                if self.wcsps[slave].assigned(slave_var) {
                    continue;
                }
                let res = self.with_protection(|session| {
                    Self::apply_forward(&mut session.wcsps[slave], slave_var, EventKind::Assign(val))
                });
                if res.is_err() {
                    self.wcsps[slave].when_contradiction();
                    return res;
                }
                self.wcsps[slave].drain_events();
            }
        }
        Ok(())
    }

    // === projection and probing ===========================================

    /// Projects the constraint onto the remaining unassigned scope variables
    /// (at most [`NARY_PROJECTION_SIZE`]) by probing the slave optimum for
    /// every candidate tuple, posting the result as a plain table in the
    /// master
    fn project_nary(&mut self, cidx: usize) -> Result<(), Contradiction> {
        let Some(master) = self.master else {
            return Ok(());
        };
        let scope = self.constraints[cidx].scope.clone();
        let unassigned: Vec<Var> = scope
            .iter()
            .copied()
            .filter(|&v| !self.wcsps[master].assigned(v))
            .collect();

        // candidate tuples over the current domains of the unassigned vars
        let mut candidates: Vec<Vec<Value>> = vec![vec![]];
        for &var in &unassigned {
            let mut extended = vec![];
            for candidate in &candidates {
                let (inf, sup) = (
                    self.wcsps[master].inf(var).idx32(),
                    self.wcsps[master].sup(var).idx32(),
                );
                for raw in inf..=sup {
                    let val = Value::new(raw);
                    if self.wcsps[master].can_be(var, val) {
                        let mut next = candidate.clone();
                        next.push(val);
                        extended.push(next);
                    }
                }
            }
            candidates = extended;
        }

        let mut forbidden = vec![];
        for candidate in candidates {
            let mut assignment: Vec<(Var, Value)> = vec![];
            for (i, &var) in scope.iter().enumerate() {
                let slave_var = Var::new(u32::try_from(i).expect("scope too large"));
                let val = match self.wcsps[master].value_of(var) {
                    Some(val) => val,
                    None => {
                        let pos = unassigned
                            .iter()
                            .position(|&u| u == var)
                            .expect("unassigned scope variable");
                        candidate[pos]
                    }
                };
                assignment.push((slave_var, val));
            }
            if self.eval(cidx, &assignment).is_top() {
                forbidden.push(candidate);
            }
        }

        if unassigned.is_empty() {
            return if forbidden.is_empty() {
                Ok(())
            } else {
                Err(Contradiction)
            };
        }

        if forbidden.is_empty() {
            return Ok(());
        }
        self.wcsps[master].mark_posted_constraints();
        let sizes: Vec<usize> = unassigned
            .iter()
            .map(|&v| self.wcsps[master].variable(v).init_size() as usize)
            .collect();
        let table_len: usize = sizes.iter().product();
        let mut costs = vec![Cost::ZERO; table_len];
        for tuple in &forbidden {
            let mut idx = 0_usize;
            for (pos, val) in tuple.iter().enumerate() {
                idx = idx * sizes[pos] + val.idx();
            }
            costs[idx] = Cost::TOP;
        }
        let post = match unassigned.len() {
            1 => self.wcsps[master].post_unary(unassigned[0], &costs),
            2 => self.wcsps[master].post_binary(unassigned[0], unassigned[1], &costs),
            _ => self.wcsps[master].post_ternary(
                unassigned[0],
                unassigned[1],
                unassigned[2],
                &costs,
            ),
        };
        post.map_err(|_| Contradiction)?;
        self.wcsps[master].propagate()?;
        let queue: Vec<(WcspId, VarEvent)> = self.wcsps[master]
            .drain_events()
            .into_iter()
            .map(|ev| (master, ev))
            .collect();
        self.with_protection(|session| session.forward_events(queue))
    }

    /// Probes the slave optimum under a complete channelling assignment
    /// without leaving any trace: stores, bulk-assigns, reads the slave
    /// bound, restores. Returns top when the assignment falls outside the
    /// window.
    #[must_use]
    pub fn eval(&mut self, cidx: usize, assignment: &[(Var, Value)]) -> Cost {
        let (problem, negproblem, lb, ub, neg_cost) = {
            let c = &self.constraints[cidx];
            (c.problem, c.negproblem, c.lb, c.ub, c.neg_cost)
        };
        let depth = self.store();
        let held = self.is_protected();
        if !held {
            self.protect();
        }
        let mut unsat = false;
        let probe = if let Some(p) = problem {
            Some((p, false))
        } else {
            negproblem.map(|n| (n, true))
        };
        if let Some((slave, negated)) = probe {
            let was_enabled = self.wcsps[slave].propagation_enabled();
            self.wcsps[slave].reactivate_propagate();
            let res = self.wcsps[slave]
                .enforce_ub()
                .and_then(|()| self.wcsps[slave].assign_ls(assignment));
            match res {
                Ok(()) => {
                    let slave_lb = self.wcsps[slave].lb();
                    if negated {
                        if slave_lb.raw() <= neg_cost.raw() - ub.raw() {
                            unsat = true;
                        }
                    } else if slave_lb < lb {
                        unsat = true;
                    }
                }
                Err(Contradiction) => {
                    self.wcsps[slave].when_contradiction();
                    unsat = true;
                }
            }
            if !was_enabled {
                self.wcsps[slave].deactivate_propagate();
            }
        }
        self.restore(depth);
        if !held {
            self.unprotect();
        }
        if unsat {
            Cost::TOP
        } else {
            Cost::ZERO
        }
    }

    // === store / restore ==================================================

    /// Pushes a save point across the whole family and returns the depth
    pub fn store(&mut self) -> usize {
        for wcsp in &mut self.wcsps {
            wcsp.store();
        }
        self.trail.store()
    }

    /// Restores the whole family to a saved depth
    pub fn restore(&mut self, depth: usize) {
        for wcsp in &mut self.wcsps {
            wcsp.restore(depth);
        }
        let mut trail = std::mem::take(&mut self.trail);
        trail.restore(depth, |event| match event {
            SessionRestore::NonAssigned(cidx, old) => {
                self.constraints[cidx].non_assigned = old;
            }
        });
        self.trail = trail;
    }
}

impl WcspConstraint {
    fn scope_position(&self, var: Var) -> Option<usize> {
        self.scope.iter().position(|&v| v == var)
    }
}

#[cfg(test)]
mod tests {
    use crate::{
        instances::Wcsp,
        solving::Features,
        types::{costs::Cost, Value, Var},
    };

    use super::{EmbedError, Session};

    /// Master with two Booleans; slave with the same two variables and one
    /// binary cost function that is 0 on (0,0) and 1 elsewhere
    fn master_slave() -> (Session, usize, usize, Vec<Var>) {
        let mut master = Wcsp::new("master");
        let x = master.make_enum_var("x", 1).unwrap();
        let y = master.make_enum_var("y", 1).unwrap();
        let mut slave = Wcsp::new("slave");
        let sx = slave.make_enum_var("x", 1).unwrap();
        let sy = slave.make_enum_var("y", 1).unwrap();
        slave
            .post_binary(sx, sy, &[Cost::ZERO, Cost::UNIT, Cost::UNIT, Cost::UNIT])
            .unwrap();
        let mut session = Session::new();
        let master_id = session.attach(master);
        let slave_id = session.attach(slave);
        (session, master_id, slave_id, vec![x, y])
    }

    #[test]
    fn wrong_bounds_rejected() {
        let (mut session, master_id, slave_id, scope) = master_slave();
        assert_eq!(
            session.post_wcsp_constraint(
                master_id,
                scope,
                Some(slave_id),
                None,
                Cost::UNIT,
                Cost::UNIT,
                false,
                false,
            ),
            Err(EmbedError::WrongBounds(Cost::UNIT, Cost::UNIT))
        );
    }

    #[test]
    fn slave_cannot_be_shared() {
        let (mut session, master_id, slave_id, scope) = master_slave();
        session
            .post_wcsp_constraint(
                master_id,
                scope.clone(),
                Some(slave_id),
                None,
                Cost::ZERO,
                Cost::UNIT,
                false,
                false,
            )
            .unwrap();
        assert_eq!(
            session.post_wcsp_constraint(
                master_id,
                scope,
                Some(slave_id),
                None,
                Cost::ZERO,
                Cost::UNIT,
                false,
                false,
            ),
            Err(EmbedError::SlaveInUse(slave_id))
        );
    }

    #[test]
    fn posting_tightens_slave_bound() {
        let (mut session, master_id, slave_id, scope) = master_slave();
        session
            .post_wcsp_constraint(
                master_id,
                scope,
                Some(slave_id),
                None,
                Cost::ZERO,
                Cost::UNIT,
                false,
                false,
            )
            .unwrap();
        assert_eq!(session.wcsp(slave_id).ub(), Cost::UNIT);
    }

    #[test]
    fn universal_constraint_deconnects_without_pruning() {
        let (mut session, master_id, slave_id, scope) = master_slave();
        let cidx = session
            .post_wcsp_constraint(
                master_id,
                scope,
                Some(slave_id),
                None,
                Cost::ZERO,
                Cost::UNIT,
                false,
                false,
            )
            .unwrap();
        session.store();
        session.propagate().unwrap();
        // the slave's zero lower bound witnesses the window
        assert!(session.universal(cidx));
        assert!(!session.connected(cidx));
        // no master value was removed
        for var in [Var::new(0), Var::new(1)] {
            assert_eq!(session.wcsp(master_id).domain_size(var), 2);
        }
    }

    #[test]
    fn master_assignment_forwards_to_slave() {
        let (mut session, master_id, slave_id, scope) = master_slave();
        session
            .post_wcsp_constraint(
                master_id,
                scope,
                Some(slave_id),
                None,
                Cost::ZERO,
                Cost::UNIT,
                false,
                false,
            )
            .unwrap();
        session.store();
        session
            .assign(master_id, Var::new(0), Value::new(1))
            .unwrap();
        // the assignment reached the slave atomically
        assert_eq!(
            session.wcsp(slave_id).value_of(Var::new(0)),
            Some(Value::new(1))
        );
        // the protection guard was released
        assert!(!session.is_protected());
    }

    #[test]
    fn slave_event_forwards_to_master() {
        let (mut session, master_id, slave_id, scope) = master_slave();
        session
            .post_wcsp_constraint(
                master_id,
                scope,
                Some(slave_id),
                None,
                Cost::ZERO,
                Cost::UNIT,
                false,
                false,
            )
            .unwrap();
        session.store();
        session
            .remove(slave_id, Var::new(1), Value::new(0))
            .unwrap();
        assert!(!session.wcsp(master_id).can_be(Var::new(1), Value::new(0)));
        assert!(!session.is_protected());
    }

    #[test]
    fn contradiction_releases_protection() {
        // a slave with a forbidden tuple is never universal, so the
        // constraint stays active until its window is violated
        let mut master = Wcsp::new("master");
        let x = master.make_enum_var("x", 1).unwrap();
        let y = master.make_enum_var("y", 1).unwrap();
        let mut slave = Wcsp::new("slave");
        let sx = slave.make_enum_var("x", 1).unwrap();
        let sy = slave.make_enum_var("y", 1).unwrap();
        slave
            .post_binary(sx, sy, &[Cost::ZERO, Cost::UNIT, Cost::UNIT, Cost::TOP])
            .unwrap();
        let mut session = Session::new();
        let master_id = session.attach(master);
        let slave_id = session.attach(slave);
        session
            .post_wcsp_constraint(
                master_id,
                vec![x, y],
                Some(slave_id),
                None,
                Cost::ZERO,
                Cost::UNIT,
                false,
                false,
            )
            .unwrap();
        session.store();
        let before = *session.features();
        // pushing both variables to one leaves the slave with no assignment
        // below its bound; the contradiction must unwind cleanly
        let errored = session.assign(master_id, x, Value::new(1)).is_err()
            || session.assign(master_id, y, Value::new(1)).is_err();
        assert!(errored);
        assert_eq!(*session.features(), before);
        assert!(!session.is_protected());
    }

    #[test]
    fn probe_eval_restores_depth() {
        let (mut session, master_id, slave_id, scope) = master_slave();
        let cidx = session
            .post_wcsp_constraint(
                master_id,
                scope,
                Some(slave_id),
                None,
                Cost::ZERO,
                Cost::UNIT,
                false,
                false,
            )
            .unwrap();
        session.store();
        let depth_before = session.wcsp(slave_id).depth();
        // (0,0) is inside the window, (1,1) outside
        let ok = session.eval(
            cidx,
            &[(Var::new(0), Value::new(0)), (Var::new(1), Value::new(0))],
        );
        assert_eq!(ok, Cost::ZERO);
        let bad = session.eval(
            cidx,
            &[(Var::new(0), Value::new(1)), (Var::new(1), Value::new(1))],
        );
        assert!(bad.is_top());
        assert_eq!(session.wcsp(slave_id).depth(), depth_before);
        assert!(!session.wcsp(slave_id).assigned(Var::new(0)));
        assert!(!session.is_protected());
    }

    #[test]
    fn features_protected_defaults() {
        let features = Features::protected();
        assert_eq!(features.functional_elim, 0);
        assert_eq!(features.elim_degree, -1);
        assert!(!features.vac_integrality);
        assert!(!features.rasps);
    }
}
