//! # The Cost Function Network Container
//!
//! [`Wcsp`] owns variables, cost functions and bounds, and exposes the
//! posting API all format parsers and global-constraint decompositions emit
//! calls on. It also carries the runtime domain state the embedded-network
//! constraint operates on: current domains, a backtrackable trail, and the
//! assign/remove/increase/decrease operations with their event queue.

use std::fmt;

use log::debug;
use thiserror::Error;

use crate::{
    solving::{Contradiction, EventKind, Trail, VarEvent},
    types::{
        costs::{Cost, CostError},
        RsHashMap, Tuple, Value, Var,
    },
};

use super::Config;

/// A variable of a cost function network
#[derive(Debug, Clone)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub enum Variable {
    /// An enumerated variable with a fixed initial domain `[0, init_size)`
    /// and optional value names
    Enumerated {
        /// The variable name, unique within its network
        name: String,
        /// The immutable initial domain size
        init_size: u32,
        /// Value names, either one per value index or empty
        value_names: Vec<String>,
    },
    /// An interval variable `[0, sup]`; may only appear in arithmetic and
    /// knapsack cost functions
    Interval {
        /// The variable name, unique within its network
        name: String,
        /// The initial domain upper bound
        sup: u32,
    },
}

impl Variable {
    /// The name of the variable
    #[must_use]
    pub fn name(&self) -> &str {
        match self {
            Variable::Enumerated { name, .. } | Variable::Interval { name, .. } => name,
        }
    }

    /// The initial domain size
    #[must_use]
    pub fn init_size(&self) -> u32 {
        match self {
            Variable::Enumerated { init_size, .. } => *init_size,
            Variable::Interval { sup, .. } => sup + 1,
        }
    }

    /// Whether the variable is enumerated
    #[must_use]
    pub fn enumerated(&self) -> bool {
        matches!(self, Variable::Enumerated { .. })
    }
}

/// The current domain of a variable. The initial domain is immutable; the
/// current domain shrinks during propagation and grows back on restore.
#[derive(Debug, Clone)]
struct Domain {
    present: Vec<bool>,
    n_present: u32,
    inf: u32,
    sup: u32,
}

impl Domain {
    fn full(init_size: u32) -> Domain {
        Domain {
            present: vec![true; init_size as usize],
            n_present: init_size,
            inf: 0,
            sup: init_size - 1,
        }
    }

    fn contains(&self, val: Value) -> bool {
        val.idx() < self.present.len() && self.present[val.idx()]
    }

    fn assigned(&self) -> bool {
        self.n_present == 1
    }

    fn single_value(&self) -> Option<Value> {
        if self.assigned() {
            Some(Value::new(self.inf))
        } else {
            None
        }
    }
}

/// Parameters of a linear 0/1 (knapsack) constraint: the selected
/// coefficients must sum to at least the capacity.
#[derive(Debug, Clone, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct KnapsackParams {
    /// Right-hand side of `sum coef >= capacity`
    pub capacity: i64,
    /// Triples of scope position, triggering value and coefficient
    pub terms: Vec<(usize, Value, i64)>,
}

/// Parameters of a clique constraint: at most `rhs` scope variables may take
/// one of their clique values.
#[derive(Debug, Clone, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct CliqueParams {
    /// How many scope variables may take a clique value
    pub rhs: u32,
    /// For every scope position, the values belonging to the clique
    pub values: Vec<Vec<Value>>,
}

/// The arithmetic cost function forms over two variables (interval variables
/// allowed)
#[derive(Debug, Clone, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub enum ArithmeticFn {
    /// Soft `x >= y + cst`: violations are charged one unit each, capped at
    /// `delta`, forbidden beyond
    Sup {
        /// Offset of the inequality
        cst: i64,
        /// Maximum finite violation penalty
        delta: Cost,
    },
    /// Soft disjunction `x >= y + csty or y >= x + cstx` with a flat
    /// violation penalty
    Disjunction {
        /// Offset charged to the first scope variable
        cstx: i64,
        /// Offset charged to the second scope variable
        csty: i64,
        /// Penalty when neither disjunct holds
        penalty: Cost,
    },
    /// Special disjunction with per-variable overflow sentinels and costs
    SpecialDisjunction {
        /// Offset of the first scope variable
        cstx: i64,
        /// Offset of the second scope variable
        csty: i64,
        /// First variable values at or above this sentinel opt out
        xinfty: Value,
        /// Second variable values at or above this sentinel opt out
        yinfty: Value,
        /// Cost of the first variable opting out
        costx: Cost,
        /// Cost of the second variable opting out
        costy: Cost,
    },
    /// Restriction of an interval variable to a set of allowed values, with
    /// a penalty for the others
    IntervalUnary {
        /// The allowed values
        allowed: Vec<Value>,
        /// Penalty for a value outside the allowed set
        penalty: Cost,
    },
}

/// The different kinds of cost functions of a network
#[derive(Debug, Clone)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub enum CostFnKind {
    /// Full unary cost table indexed by value
    Unary(Vec<Cost>),
    /// Full binary table in row-major lexicographic order
    Binary(Vec<Cost>),
    /// Full ternary table in row-major lexicographic order
    Ternary(Vec<Cost>),
    /// Sparse table with a default cost, for arities above three
    Nary {
        /// Cost of every tuple not listed
        default: Cost,
        /// The listed tuples
        tuples: RsHashMap<Tuple, Cost>,
    },
    /// An arithmetic form over two variables
    Arithmetic(ArithmeticFn),
    /// A linear 0/1 constraint
    Knapsack(KnapsackParams),
    /// A clique constraint
    Clique(CliqueParams),
    /// A monolithic global cost function, kept as a parameter payload for an
    /// external propagator
    Global {
        /// The global cost function name
        name: String,
        /// The raw parameter token stream
        params: Vec<String>,
    },
    /// An embedded-network constraint, owned by the
    /// [`Session`](crate::solving::Session) under this id
    Embedded(usize),
}

/// A cost function: an ordered scope and a kind. The `connected` and
/// `folded` flags are runtime state managed backtrackably.
#[derive(Debug, Clone)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct CostFunction {
    /// The ordered scope
    pub scope: Vec<Var>,
    /// The kind and its cost representation
    pub kind: CostFnKind,
    pub(crate) connected: bool,
    pub(crate) folded: bool,
}

impl CostFunction {
    /// The arity of the cost function
    #[must_use]
    pub fn arity(&self) -> usize {
        self.scope.len()
    }

    /// The position of a variable in the scope, if any
    #[must_use]
    pub fn scope_position(&self, var: Var) -> Option<usize> {
        self.scope.iter().position(|&v| v == var)
    }
}

/// Errors raised while building a network
#[derive(Error, Debug, PartialEq)]
pub enum BuildError {
    /// A variable name was declared twice
    #[error("variable '{0}' already exists")]
    VarNameClash(String),
    /// A variable was redeclared with a different domain
    #[error("variable '{0}' redeclared with a different domain")]
    DomainMismatch(String),
    /// A scope refers to a variable index that does not exist
    #[error("unknown variable {0}")]
    UnknownVariable(Var),
    /// A value index is out of the variable's initial domain
    #[error("value {1} out of range for variable {0}")]
    ValueOutOfRange(Var, Value),
    /// A cost table has the wrong number of entries for its scope
    #[error("cost table of length {0} does not match the scope domains ({1} expected)")]
    TableSizeMismatch(usize, usize),
    /// A tuple's length does not match the constraint's arity
    #[error("tuple of length {0} for a constraint of arity {1}")]
    ArityMismatch(usize, usize),
    /// A scope mentions the same variable twice
    #[error("variable {0} appears twice in a scope")]
    DuplicateScopeVar(Var),
    /// The same tuple was listed twice in a sparse table
    #[error("duplicate tuple {0} in sparse cost table")]
    DuplicateTuple(Tuple),
    /// An operation requires an enumerated variable
    #[error("variable {0} is not enumerated")]
    NotEnumerated(Var),
    /// A shared table does not fit the new scope
    #[error("shared cost table '{0}' has incompatible arity or domain sizes")]
    ShareMismatch(String),
    /// A shared table reference points to nothing
    #[error("shared cost table '{0}' not defined")]
    UnknownShared(String),
    /// No open sparse table under this id
    #[error("no open n-ary cost function {0}")]
    NoOpenNary(usize),
    /// The network became infeasible while loading
    #[error("infeasible after bound update: lb {0} >= ub {1}")]
    Infeasible(Cost, Cost),
    /// Cost arithmetic failed
    #[error(transparent)]
    Cost(#[from] CostError),
}

/// A weighted constraint satisfaction problem: variables, cost functions, a
/// global lower bound, a strict global upper bound and the negative-cost
/// shift. The true mathematical cost of any assignment is the computed cost
/// minus the shift.
#[derive(Debug, Clone)]
pub struct Wcsp {
    index: usize,
    name: String,
    precision: u32,
    multiplier: f64,
    vars: Vec<Variable>,
    var_index: RsHashMap<String, Var>,
    constrs: Vec<CostFunction>,
    fn_names: RsHashMap<String, usize>,
    lb: Cost,
    ub: Cost,
    neg_cost: Cost,
    delta_ub: Cost,
    log_shift: f64,
    domains: Vec<Domain>,
    pending: Vec<VarEvent>,
    propagate_enabled: bool,
    sorted: bool,
    open_nary: Option<usize>,
    trail: Trail<Restore>,
}

/// Undo records for the backtrackable state of a network
#[derive(Debug, Clone)]
enum Restore {
    Present(Var, Value),
    Inf(Var, u32),
    Sup(Var, u32),
    Lb(Cost),
    Ub(Cost),
    Folded(usize),
    Connected(usize),
    TruncConstrs(usize),
}

impl Wcsp {
    /// Creates a new empty network with precision 0 and multiplier 1
    #[must_use]
    pub fn new<S: Into<String>>(name: S) -> Wcsp {
        Wcsp {
            index: 0,
            name: name.into(),
            precision: 0,
            multiplier: 1.0,
            vars: vec![],
            var_index: RsHashMap::default(),
            constrs: vec![],
            fn_names: RsHashMap::default(),
            lb: Cost::ZERO,
            ub: Cost::TOP,
            neg_cost: Cost::ZERO,
            delta_ub: Cost::ZERO,
            log_shift: 0.0,
            domains: vec![],
            pending: vec![],
            propagate_enabled: true,
            sorted: false,
            open_nary: None,
            trail: Trail::new(),
        }
    }

    /// The unique index of the network within its session
    #[must_use]
    pub fn index(&self) -> usize {
        self.index
    }

    pub(crate) fn set_index(&mut self, index: usize) {
        self.index = index;
    }

    /// The problem name
    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Renames the problem (the CFN header carries the name)
    pub fn set_name<S: Into<String>>(&mut self, name: S) {
        self.name = name.into();
    }

    /// The declared decimal cost precision
    #[must_use]
    pub fn precision(&self) -> u32 {
        self.precision
    }

    /// Sets the decimal cost precision (CFN derives it from the header)
    pub fn set_precision(&mut self, precision: u32) {
        self.precision = precision;
    }

    /// The global cost multiplier
    #[must_use]
    pub fn multiplier(&self) -> f64 {
        self.multiplier
    }

    /// Sets the global cost multiplier; `-1.0` turns a maximisation problem
    /// into the internal minimisation form
    pub fn set_multiplier(&mut self, multiplier: f64) {
        self.multiplier = multiplier;
    }

    /// The global lower bound
    #[must_use]
    pub fn lb(&self) -> Cost {
        self.lb
    }

    /// The strict global upper bound
    #[must_use]
    pub fn ub(&self) -> Cost {
        self.ub
    }

    /// The negative-cost shift accumulated from shifted tables
    #[must_use]
    pub fn neg_cost(&self) -> Cost {
        self.neg_cost
    }

    /// Adds to the negative-cost shift. Parsers that shift signs themselves
    /// (QPBO, the global templates) record the compensation here.
    pub fn add_neg_cost(&mut self, delta: Cost) {
        self.neg_cost += delta;
    }

    /// The logarithmic shift accumulated while normalising Markov network
    /// probability tables; added back when reporting a solution likelihood
    #[must_use]
    pub fn log_shift(&self) -> f64 {
        self.log_shift
    }

    /// Accumulates onto the logarithmic shift
    pub fn add_log_shift(&mut self, delta: f64) {
        self.log_shift += delta;
    }

    /// The bound below which a solution cost certifies optimality, i.e. the
    /// upper bound with the delta relaxation taken back out
    #[must_use]
    pub fn certified_ub(&self) -> Cost {
        self.ub - self.delta_ub
    }

    /// The number of variables
    #[must_use]
    pub fn num_variables(&self) -> usize {
        self.vars.len()
    }

    /// The number of cost functions
    #[must_use]
    pub fn num_constraints(&self) -> usize {
        self.constrs.len()
    }

    /// Access to a variable
    ///
    /// # Panics
    ///
    /// If the variable does not exist.
    #[must_use]
    pub fn variable(&self, var: Var) -> &Variable {
        &self.vars[var.idx()]
    }

    /// Access to a cost function
    ///
    /// # Panics
    ///
    /// If the constraint id does not exist.
    #[must_use]
    pub fn constraint(&self, cid: usize) -> &CostFunction {
        &self.constrs[cid]
    }

    // === variable registry ===============================================

    /// Creates a new enumerated variable with initial domain `[0, last]`
    ///
    /// # Errors
    ///
    /// [`BuildError::VarNameClash`] if the name is taken.
    pub fn make_enum_var<S: Into<String>>(&mut self, name: S, last: u32) -> Result<Var, BuildError> {
        let name = name.into();
        if self.var_index.contains_key(&name) {
            return Err(BuildError::VarNameClash(name));
        }
        let var = Var::new(u32::try_from(self.vars.len()).expect("too many variables"));
        self.var_index.insert(name.clone(), var);
        self.vars.push(Variable::Enumerated {
            name,
            init_size: last + 1,
            value_names: vec![],
        });
        self.domains.push(Domain::full(last + 1));
        Ok(var)
    }

    /// Creates a new enumerated variable whose domain is given by value
    /// names; the domain size is the number of names
    ///
    /// # Errors
    ///
    /// [`BuildError::VarNameClash`] if the name is taken.
    pub fn make_enum_var_named<S: Into<String>>(
        &mut self,
        name: S,
        value_names: Vec<String>,
    ) -> Result<Var, BuildError> {
        let size = u32::try_from(value_names.len()).expect("domain too large");
        let var = self.make_enum_var(name, size - 1)?;
        if let Variable::Enumerated {
            value_names: names, ..
        } = &mut self.vars[var.idx()]
        {
            *names = value_names;
        }
        Ok(var)
    }

    /// Creates a new interval variable with initial domain `[0, sup]`
    ///
    /// # Errors
    ///
    /// [`BuildError::VarNameClash`] if the name is taken.
    pub fn make_interval_var<S: Into<String>>(
        &mut self,
        name: S,
        sup: u32,
    ) -> Result<Var, BuildError> {
        let name = name.into();
        if self.var_index.contains_key(&name) {
            return Err(BuildError::VarNameClash(name));
        }
        let var = Var::new(u32::try_from(self.vars.len()).expect("too many variables"));
        self.var_index.insert(name.clone(), var);
        self.vars.push(Variable::Interval { name, sup });
        self.domains.push(Domain::full(sup + 1));
        Ok(var)
    }

    /// Returns the index of the variable with the given name, or the current
    /// variable count if the name is unused. Loaders use this to detect
    /// redefinitions.
    #[must_use]
    pub fn var_index<S: AsRef<str>>(&self, name: S) -> usize {
        match self.var_index.get(name.as_ref()) {
            Some(var) => var.idx(),
            None => self.vars.len(),
        }
    }

    /// Looks up a variable by name
    #[must_use]
    pub fn var<S: AsRef<str>>(&self, name: S) -> Option<Var> {
        self.var_index.get(name.as_ref()).copied()
    }

    /// Resolves a value name on an enumerated variable
    #[must_use]
    pub fn value_index(&self, var: Var, value_name: &str) -> Option<Value> {
        match &self.vars[var.idx()] {
            Variable::Enumerated { value_names, .. } => value_names
                .iter()
                .position(|n| n == value_name)
                .map(|i| Value::new(u32::try_from(i).expect("domain too large"))),
            Variable::Interval { .. } => None,
        }
    }

    // === cost scaling =====================================================

    /// Maps a parsed cost through the global multiplier and the medium-cost
    /// rule against the current upper bound. Every parser routes costs
    /// through here before posting.
    ///
    /// # Errors
    ///
    /// [`BuildError::Cost`] if the multiplication overflows.
    pub fn scale_cost(&self, cost: Cost) -> Result<Cost, BuildError> {
        let cost = cost.apply_multiplier(self.multiplier)?;
        Ok(cost.medium_scaled(self.ub))
    }

    /// Parses a decimal token under the network's precision and scales it
    ///
    /// # Errors
    ///
    /// [`BuildError::Cost`] on a malformed token or overflow.
    pub fn read_cost(&self, token: &str) -> Result<Cost, BuildError> {
        let cost = Cost::parse_decimal(token, self.precision)?;
        self.scale_cost(cost)
    }

    // === posting API ======================================================

    fn check_scope(&self, scope: &[Var], enumerated: bool) -> Result<(), BuildError> {
        for (i, &var) in scope.iter().enumerate() {
            if var.idx() >= self.vars.len() {
                return Err(BuildError::UnknownVariable(var));
            }
            if enumerated && !self.vars[var.idx()].enumerated() {
                return Err(BuildError::NotEnumerated(var));
            }
            if scope[..i].contains(&var) {
                return Err(BuildError::DuplicateScopeVar(var));
            }
        }
        Ok(())
    }

    /// Shifts a table so that every entry is non-negative, accumulating the
    /// (negative) minimum into the negative-cost shift.
    fn shift_negative(&mut self, costs: &mut [Cost]) {
        let min = costs.iter().copied().min().unwrap_or(Cost::ZERO);
        if min < Cost::ZERO {
            for c in costs.iter_mut() {
                *c = c.saturating_sub(min);
            }
            self.neg_cost += -min;
            debug!("shifted table minimum {min} into negCost (now {})", self.neg_cost);
        }
    }

    fn push_constr(&mut self, scope: Vec<Var>, kind: CostFnKind) -> usize {
        self.constrs.push(CostFunction {
            scope,
            kind,
            connected: true,
            folded: false,
        });
        self.constrs.len() - 1
    }

    /// Posts a constant cost function: the cost is added to the global lower
    /// bound
    ///
    /// # Errors
    ///
    /// [`BuildError::Infeasible`] if the lower bound reaches the upper
    /// bound.
    pub fn post_zero_ary(&mut self, cost: Cost) -> Result<(), BuildError> {
        self.increase_lb(cost)
    }

    /// Posts a unary cost table over an enumerated variable
    ///
    /// # Errors
    ///
    /// If the variable is unknown or not enumerated, or the table length
    /// does not match the initial domain size.
    pub fn post_unary(&mut self, x: Var, costs: &[Cost]) -> Result<usize, BuildError> {
        self.check_scope(&[x], true)?;
        let size = self.vars[x.idx()].init_size() as usize;
        if costs.len() != size {
            return Err(BuildError::TableSizeMismatch(costs.len(), size));
        }
        let mut costs = costs.to_vec();
        self.shift_negative(&mut costs);
        Ok(self.push_constr(vec![x], CostFnKind::Unary(costs)))
    }

    /// Posts a hard/soft restriction of an interval variable to a set of
    /// allowed values
    ///
    /// # Errors
    ///
    /// If the variable is unknown or a value is out of range.
    pub fn post_unary_interval(
        &mut self,
        x: Var,
        allowed: Vec<Value>,
        penalty: Cost,
    ) -> Result<usize, BuildError> {
        self.check_scope(&[x], false)?;
        for &v in &allowed {
            if v.idx32() >= self.vars[x.idx()].init_size() {
                return Err(BuildError::ValueOutOfRange(x, v));
            }
        }
        Ok(self.push_constr(
            vec![x],
            CostFnKind::Arithmetic(ArithmeticFn::IntervalUnary { allowed, penalty }),
        ))
    }

    /// Posts a binary cost table in row-major lexicographic order
    ///
    /// # Errors
    ///
    /// If a scope variable is unknown, not enumerated or duplicated, or the
    /// table length does not match the product of the initial domain sizes.
    pub fn post_binary(&mut self, x: Var, y: Var, costs: &[Cost]) -> Result<usize, BuildError> {
        self.check_scope(&[x, y], true)?;
        let size = self.vars[x.idx()].init_size() as usize * self.vars[y.idx()].init_size() as usize;
        if costs.len() != size {
            return Err(BuildError::TableSizeMismatch(costs.len(), size));
        }
        let mut costs = costs.to_vec();
        self.shift_negative(&mut costs);
        Ok(self.push_constr(vec![x, y], CostFnKind::Binary(costs)))
    }

    /// Posts a ternary cost table in row-major lexicographic order
    ///
    /// # Errors
    ///
    /// If a scope variable is unknown, not enumerated or duplicated, or the
    /// table length does not match the product of the initial domain sizes.
    pub fn post_ternary(
        &mut self,
        x: Var,
        y: Var,
        z: Var,
        costs: &[Cost],
    ) -> Result<usize, BuildError> {
        self.check_scope(&[x, y, z], true)?;
        let size = self.vars[x.idx()].init_size() as usize
            * self.vars[y.idx()].init_size() as usize
            * self.vars[z.idx()].init_size() as usize;
        if costs.len() != size {
            return Err(BuildError::TableSizeMismatch(costs.len(), size));
        }
        let mut costs = costs.to_vec();
        self.shift_negative(&mut costs);
        Ok(self.push_constr(vec![x, y, z], CostFnKind::Ternary(costs)))
    }

    /// Opens a sparse n-ary cost table with a default cost. Tuples are added
    /// with [`Wcsp::post_nary_tuple`] and the table is closed with
    /// [`Wcsp::post_nary_end`].
    ///
    /// # Errors
    ///
    /// If a scope variable is unknown, not enumerated or duplicated.
    pub fn post_nary_begin(
        &mut self,
        scope: Vec<Var>,
        default: Cost,
        expected: usize,
    ) -> Result<usize, BuildError> {
        self.check_scope(&scope, true)?;
        let mut tuples = RsHashMap::default();
        tuples.reserve(expected);
        let cid = self.push_constr(scope, CostFnKind::Nary { default, tuples });
        self.open_nary = Some(cid);
        Ok(cid)
    }

    /// Adds a tuple to an open sparse table
    ///
    /// # Errors
    ///
    /// [`BuildError::NoOpenNary`] if `cid` is not the open table,
    /// [`BuildError::ArityMismatch`] or [`BuildError::ValueOutOfRange`] on a
    /// malformed tuple, [`BuildError::DuplicateTuple`] if the tuple was
    /// already listed.
    pub fn post_nary_tuple(
        &mut self,
        cid: usize,
        tuple: Tuple,
        cost: Cost,
    ) -> Result<(), BuildError> {
        if self.open_nary != Some(cid) {
            return Err(BuildError::NoOpenNary(cid));
        }
        let scope = self.constrs[cid].scope.clone();
        if tuple.len() != scope.len() {
            return Err(BuildError::ArityMismatch(tuple.len(), scope.len()));
        }
        for (i, &v) in tuple.iter().enumerate() {
            if v.idx32() >= self.vars[scope[i].idx()].init_size() {
                return Err(BuildError::ValueOutOfRange(scope[i], v));
            }
        }
        if let CostFnKind::Nary { tuples, .. } = &mut self.constrs[cid].kind {
            if tuples.insert(tuple.clone(), cost).is_some() {
                return Err(BuildError::DuplicateTuple(tuple));
            }
        }
        Ok(())
    }

    /// Closes an open sparse table, shifting its minimum cost: a negative
    /// minimum goes into the negative-cost shift, a positive minimum over
    /// the whole table is projected into the lower bound.
    ///
    /// # Errors
    ///
    /// [`BuildError::NoOpenNary`] if `cid` is not the open table,
    /// [`BuildError::Infeasible`] if projecting the minimum closes the
    /// bound gap.
    pub fn post_nary_end(&mut self, cid: usize) -> Result<(), BuildError> {
        if self.open_nary.take() != Some(cid) {
            return Err(BuildError::NoOpenNary(cid));
        }
        let min = if let CostFnKind::Nary { default, tuples } = &self.constrs[cid].kind {
            // the default cost applies as soon as some tuple is unlisted
            let size: usize = self.constrs[cid]
                .scope
                .iter()
                .map(|&v| self.vars[v.idx()].init_size() as usize)
                .product();
            let listed_min = tuples.values().copied().min();
            if tuples.len() < size {
                listed_min.map_or(*default, |m| m.min(*default))
            } else {
                listed_min.unwrap_or(*default)
            }
        } else {
            return Err(BuildError::NoOpenNary(cid));
        };
        if min == Cost::ZERO || min.is_top() {
            return Ok(());
        }
        if let CostFnKind::Nary { default, tuples } = &mut self.constrs[cid].kind {
            if min < Cost::ZERO {
                *default = default.saturating_sub(min);
                for c in tuples.values_mut() {
                    *c = c.saturating_sub(min);
                }
                self.neg_cost += -min;
            } else {
                *default = default.saturating_sub(min);
                for c in tuples.values_mut() {
                    *c = c.saturating_sub(min);
                }
                self.increase_lb(min)?;
            }
        }
        Ok(())
    }

    /// Posts a soft `x >= y + cst` with per-unit violation cost capped at
    /// `delta`
    ///
    /// # Errors
    ///
    /// If a scope variable is unknown or duplicated.
    pub fn post_sup_xyc(
        &mut self,
        x: Var,
        y: Var,
        cst: i64,
        delta: Cost,
    ) -> Result<usize, BuildError> {
        self.check_scope(&[x, y], false)?;
        Ok(self.push_constr(
            vec![x, y],
            CostFnKind::Arithmetic(ArithmeticFn::Sup { cst, delta }),
        ))
    }

    /// Posts a soft disjunction `x >= y + csty or y >= x + cstx`
    ///
    /// # Errors
    ///
    /// If a scope variable is unknown or duplicated.
    pub fn post_disjunction(
        &mut self,
        x: Var,
        y: Var,
        cstx: i64,
        csty: i64,
        penalty: Cost,
    ) -> Result<usize, BuildError> {
        self.check_scope(&[x, y], false)?;
        Ok(self.push_constr(
            vec![x, y],
            CostFnKind::Arithmetic(ArithmeticFn::Disjunction { cstx, csty, penalty }),
        ))
    }

    /// Posts a special disjunction with opt-out sentinels
    ///
    /// # Errors
    ///
    /// If a scope variable is unknown or duplicated.
    #[allow(clippy::too_many_arguments)]
    pub fn post_special_disjunction(
        &mut self,
        x: Var,
        y: Var,
        cstx: i64,
        csty: i64,
        xinfty: Value,
        yinfty: Value,
        costx: Cost,
        costy: Cost,
    ) -> Result<usize, BuildError> {
        self.check_scope(&[x, y], false)?;
        Ok(self.push_constr(
            vec![x, y],
            CostFnKind::Arithmetic(ArithmeticFn::SpecialDisjunction {
                cstx,
                csty,
                xinfty,
                yinfty,
                costx,
                costy,
            }),
        ))
    }

    /// Posts a linear 0/1 constraint
    ///
    /// # Errors
    ///
    /// If a scope variable is unknown or duplicated, or a term value is out
    /// of range.
    pub fn post_knapsack(
        &mut self,
        scope: Vec<Var>,
        params: KnapsackParams,
    ) -> Result<usize, BuildError> {
        self.check_scope(&scope, false)?;
        for &(pos, val, _) in &params.terms {
            let var = *scope.get(pos).ok_or(BuildError::ArityMismatch(pos, scope.len()))?;
            if val.idx32() >= self.vars[var.idx()].init_size() {
                return Err(BuildError::ValueOutOfRange(var, val));
            }
        }
        Ok(self.push_constr(scope, CostFnKind::Knapsack(params)))
    }

    /// Posts a clique constraint
    ///
    /// # Errors
    ///
    /// If a scope variable is unknown or duplicated, or the per-variable
    /// value lists do not match the scope.
    pub fn post_clique(
        &mut self,
        scope: Vec<Var>,
        params: CliqueParams,
    ) -> Result<usize, BuildError> {
        self.check_scope(&scope, true)?;
        if params.values.len() != scope.len() {
            return Err(BuildError::ArityMismatch(params.values.len(), scope.len()));
        }
        for (i, vals) in params.values.iter().enumerate() {
            for &v in vals {
                if v.idx32() >= self.vars[scope[i].idx()].init_size() {
                    return Err(BuildError::ValueOutOfRange(scope[i], v));
                }
            }
        }
        Ok(self.push_constr(scope, CostFnKind::Clique(params)))
    }

    /// Posts a monolithic global cost function as a parameter payload for an
    /// external propagator
    ///
    /// # Errors
    ///
    /// If a scope variable is unknown or duplicated.
    pub fn post_global(
        &mut self,
        scope: Vec<Var>,
        name: String,
        params: Vec<String>,
    ) -> Result<usize, BuildError> {
        self.check_scope(&scope, true)?;
        Ok(self.push_constr(scope, CostFnKind::Global { name, params }))
    }

    pub(crate) fn post_embedded_marker(&mut self, scope: Vec<Var>, meta: usize) -> usize {
        self.push_constr(scope, CostFnKind::Embedded(meta))
    }

    // === table sharing ====================================================

    /// Registers a posted cost function under a name so later functions can
    /// share its table
    pub fn register_fn_name<S: Into<String>>(&mut self, name: S, cid: usize) {
        self.fn_names.insert(name.into(), cid);
    }

    /// Reposts the table of a previously named function on a new scope. The
    /// arities and the domain sizes of both scopes must match exactly.
    ///
    /// # Errors
    ///
    /// [`BuildError::UnknownShared`] if the name is not registered,
    /// [`BuildError::ShareMismatch`] if the scopes are incompatible.
    pub fn post_shared(&mut self, name: &str, scope: Vec<Var>) -> Result<usize, BuildError> {
        let &cid = self
            .fn_names
            .get(name)
            .ok_or_else(|| BuildError::UnknownShared(String::from(name)))?;
        self.post_shared_by_id(cid, scope)
            .map_err(|err| match err {
                BuildError::ShareMismatch(_) => BuildError::ShareMismatch(String::from(name)),
                other => other,
            })
    }

    /// Reposts the table of an earlier constraint on a new scope, checking
    /// arity and domain sizes (legacy WCSP shares tables by index)
    ///
    /// # Errors
    ///
    /// [`BuildError::ShareMismatch`] if the scopes are incompatible or the
    /// source is not tabular.
    pub fn post_shared_by_id(&mut self, cid: usize, scope: Vec<Var>) -> Result<usize, BuildError> {
        let mismatch = || BuildError::ShareMismatch(format!("#{cid}"));
        let src_scope = self
            .constrs
            .get(cid)
            .ok_or_else(mismatch)?
            .scope
            .clone();
        if src_scope.len() != scope.len() {
            return Err(mismatch());
        }
        self.check_scope(&scope, true)?;
        for (a, b) in src_scope.iter().zip(&scope) {
            if self.vars[a.idx()].init_size() != self.vars[b.idx()].init_size() {
                return Err(mismatch());
            }
        }
        let kind = self.constrs[cid].kind.clone();
        match kind {
            CostFnKind::Unary(costs) => self.post_unary(scope[0], &costs),
            CostFnKind::Binary(costs) => self.post_binary(scope[0], scope[1], &costs),
            CostFnKind::Ternary(costs) => self.post_ternary(scope[0], scope[1], scope[2], &costs),
            CostFnKind::Nary { default, tuples } => {
                let new = self.post_nary_begin(scope, default, tuples.len())?;
                for (tuple, cost) in tuples {
                    self.post_nary_tuple(new, tuple, cost)?;
                }
                self.post_nary_end(new)?;
                Ok(new)
            }
            _ => Err(mismatch()),
        }
    }

    /// The dense cost table of a tabular constraint, for table reuse by
    /// index (legacy WCSP format)
    #[must_use]
    pub fn table_of(&self, cid: usize) -> Option<&[Cost]> {
        match &self.constrs.get(cid)?.kind {
            CostFnKind::Unary(costs) | CostFnKind::Binary(costs) | CostFnKind::Ternary(costs) => {
                Some(costs)
            }
            _ => None,
        }
    }

    // === bound management =================================================

    /// Adds to the global lower bound
    ///
    /// # Errors
    ///
    /// [`BuildError::Infeasible`] when the lower bound reaches the upper
    /// bound.
    pub fn increase_lb(&mut self, delta: Cost) -> Result<(), BuildError> {
        if delta == Cost::ZERO {
            return Ok(());
        }
        self.trail.push(Restore::Lb(self.lb));
        self.lb += delta;
        debug!("{}: lb raised to {}", self.name, self.lb);
        if self.lb.cuts(self.ub) {
            return Err(BuildError::Infeasible(self.lb, self.ub));
        }
        Ok(())
    }

    /// Lowers the global upper bound. Raising it is a no-op.
    pub fn update_ub(&mut self, new_ub: Cost) {
        if new_ub < self.ub {
            self.trail.push(Restore::Ub(self.ub));
            self.ub = new_ub;
            debug!("{}: ub lowered to {}", self.name, self.ub);
        }
    }

    /// Installs the effective upper bound after loading: the raw file bound
    /// is scaled by the multiplier and shifted by the negative-cost shift,
    /// combined with the configured external bound, and relaxed by the
    /// configured delta.
    ///
    /// # Errors
    ///
    /// [`BuildError::Cost`] if the scaled bound overflows,
    /// [`BuildError::Infeasible`] if the bound drops strictly below the
    /// lower bound.
    pub fn enforce_file_ub(&mut self, bound: Cost, config: &Config) -> Result<(), BuildError> {
        let shifted = bound.apply_multiplier(self.multiplier)?;
        if shifted.raw() > Cost::TOP.raw() - self.neg_cost.raw() {
            return Err(BuildError::Cost(CostError::Overflow(
                bound.raw(),
                self.multiplier,
            )));
        }
        let mut bound = shifted + self.neg_cost;
        if bound < Cost::ZERO {
            bound = Cost::ZERO;
        }
        if let Some(ext) = &config.external_ub {
            let ext = Cost::parse_decimal(ext, self.precision)?;
            bound = bound.min(ext + self.neg_cost);
        }
        self.relax_and_update_ub(bound, config)
    }

    /// Relaxes a working bound by the configured delta and installs it. The
    /// delta is the larger of the absolute relaxation and the relative gap
    /// applied to the working bound; a solution only certifies optimality
    /// below [`Wcsp::certified_ub`].
    ///
    /// A bound that merely closes the gap (a maximisation instance may clamp
    /// to zero) still installs; infeasibility then surfaces through
    /// propagation, not at load.
    ///
    /// # Errors
    ///
    /// [`BuildError::Cost`] on a malformed delta, [`BuildError::Infeasible`]
    /// if the bound drops strictly below the lower bound.
    pub fn relax_and_update_ub(&mut self, mut bound: Cost, config: &Config) -> Result<(), BuildError> {
        let mut delta = Cost::ZERO;
        if let Some(abs) = &config.delta_ub {
            delta = Cost::parse_decimal(abs, self.precision)?.max(Cost::ZERO);
        }
        if config.delta_ub_relative_gap > 0.0 {
            let working = bound.min(self.ub);
            #[allow(clippy::cast_possible_truncation)]
            let rel = Cost::new((config.delta_ub_relative_gap * working.raw() as f64) as i64);
            delta = delta.max(rel);
        }
        if delta > Cost::ZERO {
            self.delta_ub = delta;
            bound += delta;
        }
        self.update_ub(bound);
        if self.lb > self.ub {
            return Err(BuildError::Infeasible(self.lb, self.ub));
        }
        Ok(())
    }

    /// Freezes the network for search
    pub fn sort_constraints(&mut self) {
        self.sorted = true;
    }

    /// Whether the network has been frozen for search
    #[must_use]
    pub fn is_sorted(&self) -> bool {
        self.sorted
    }

    /// Whether any cost table contains the top sentinel, i.e. whether some
    /// complete assignment is forbidden by a table rather than by the bound
    #[must_use]
    pub fn is_finite(&self) -> bool {
        self.constrs.iter().all(|c| match &c.kind {
            CostFnKind::Unary(costs) | CostFnKind::Binary(costs) | CostFnKind::Ternary(costs) => {
                costs.iter().all(|c| !c.is_top())
            }
            CostFnKind::Nary { default, tuples } => {
                !default.is_top() && tuples.values().all(|c| !c.is_top())
            }
            CostFnKind::Arithmetic(_) | CostFnKind::Knapsack(_) | CostFnKind::Clique(_) => true,
            CostFnKind::Global { .. } | CostFnKind::Embedded(_) => true,
        })
    }

    // === evaluation =======================================================

    /// Evaluates a cost function on a tuple over its scope
    ///
    /// # Panics
    ///
    /// If the tuple length does not match the arity.
    #[must_use]
    pub fn eval_constraint(&self, cid: usize, tuple: &[Value]) -> Cost {
        let constr = &self.constrs[cid];
        assert_eq!(tuple.len(), constr.arity(), "tuple does not match arity");
        match &constr.kind {
            CostFnKind::Unary(costs) => costs[tuple[0].idx()],
            CostFnKind::Binary(costs) => {
                let dy = self.vars[constr.scope[1].idx()].init_size() as usize;
                costs[tuple[0].idx() * dy + tuple[1].idx()]
            }
            CostFnKind::Ternary(costs) => {
                let dy = self.vars[constr.scope[1].idx()].init_size() as usize;
                let dz = self.vars[constr.scope[2].idx()].init_size() as usize;
                costs[tuple[0].idx() * dy * dz + tuple[1].idx() * dz + tuple[2].idx()]
            }
            CostFnKind::Nary { default, tuples } => {
                let t: Tuple = tuple.iter().copied().collect();
                tuples.get(&t).copied().unwrap_or(*default)
            }
            CostFnKind::Arithmetic(form) => eval_arithmetic(form, tuple),
            CostFnKind::Knapsack(params) => {
                let sum: i64 = params
                    .terms
                    .iter()
                    .filter(|&&(pos, val, _)| tuple[pos] == val)
                    .map(|&(_, _, coef)| coef)
                    .sum();
                if sum >= params.capacity {
                    Cost::ZERO
                } else {
                    Cost::TOP
                }
            }
            CostFnKind::Clique(params) => {
                let count = params
                    .values
                    .iter()
                    .enumerate()
                    .filter(|(i, vals)| vals.contains(&tuple[*i]))
                    .count();
                if count <= params.rhs as usize {
                    Cost::ZERO
                } else {
                    Cost::TOP
                }
            }
            // evaluated by their external propagator or the session
            CostFnKind::Global { .. } | CostFnKind::Embedded(_) => Cost::ZERO,
        }
    }

    /// Evaluates the whole network on a complete assignment, including the
    /// current lower bound contribution of already folded constraints. The
    /// true mathematical cost is this value minus [`Wcsp::neg_cost`].
    ///
    /// # Panics
    ///
    /// If the assignment does not cover all variables.
    #[must_use]
    pub fn eval_complete(&self, values: &[Value]) -> Cost {
        assert_eq!(values.len(), self.vars.len(), "incomplete assignment");
        let mut total = self.lb;
        let mut tuple = vec![];
        for (cid, constr) in self.constrs.iter().enumerate() {
            if !constr.connected || constr.folded {
                continue;
            }
            tuple.clear();
            tuple.extend(constr.scope.iter().map(|&v| values[v.idx()]));
            total += self.eval_constraint(cid, &tuple);
        }
        total
    }

    // === runtime domain state =============================================

    /// Whether a variable is assigned in the current domain state
    #[must_use]
    pub fn assigned(&self, var: Var) -> bool {
        self.domains[var.idx()].assigned()
    }

    /// The assigned value of a variable, if any
    #[must_use]
    pub fn value_of(&self, var: Var) -> Option<Value> {
        self.domains[var.idx()].single_value()
    }

    /// Whether a value is in the current domain
    #[must_use]
    pub fn can_be(&self, var: Var, val: Value) -> bool {
        self.domains[var.idx()].contains(val)
    }

    /// The current domain size of a variable
    #[must_use]
    pub fn domain_size(&self, var: Var) -> u32 {
        self.domains[var.idx()].n_present
    }

    /// The current domain lower bound
    #[must_use]
    pub fn inf(&self, var: Var) -> Value {
        Value::new(self.domains[var.idx()].inf)
    }

    /// The current domain upper bound
    #[must_use]
    pub fn sup(&self, var: Var) -> Value {
        Value::new(self.domains[var.idx()].sup)
    }

    /// The number of connected cost functions on a variable
    #[must_use]
    pub fn degree(&self, var: Var) -> usize {
        self.constrs
            .iter()
            .filter(|c| c.connected && c.scope.contains(&var))
            .count()
    }

    /// Whether a cost function is still part of the active network
    #[must_use]
    pub fn connected(&self, cid: usize) -> bool {
        self.constrs[cid].connected
    }

    /// Removes a cost function from the active network, backtrackably
    pub fn deconnect(&mut self, cid: usize) {
        if self.constrs[cid].connected {
            self.constrs[cid].connected = false;
            self.trail.push(Restore::Connected(cid));
        }
    }

    /// Drains the queued domain events
    pub fn drain_events(&mut self) -> Vec<VarEvent> {
        std::mem::take(&mut self.pending)
    }

    /// Whether internal propagation is currently enabled
    #[must_use]
    pub fn propagation_enabled(&self) -> bool {
        self.propagate_enabled
    }

    /// Disables internal propagation (used while an event is channelled into
    /// this network)
    pub fn deactivate_propagate(&mut self) {
        self.propagate_enabled = false;
    }

    /// Re-enables internal propagation
    pub fn reactivate_propagate(&mut self) {
        self.propagate_enabled = true;
    }

    fn remove_internal(&mut self, var: Var, val: Value) -> Result<(), Contradiction> {
        let dom = &mut self.domains[var.idx()];
        if !dom.contains(val) {
            return Ok(());
        }
        if dom.n_present == 1 {
            return Err(Contradiction);
        }
        dom.present[val.idx()] = false;
        dom.n_present -= 1;
        self.trail.push(Restore::Present(var, val));
        let dom = &mut self.domains[var.idx()];
        if val.idx32() == dom.inf {
            let old = dom.inf;
            while !dom.present[dom.inf as usize] {
                dom.inf += 1;
            }
            self.trail.push(Restore::Inf(var, old));
        } else if val.idx32() == dom.sup {
            let old = dom.sup;
            while !dom.present[dom.sup as usize] {
                dom.sup -= 1;
            }
            self.trail.push(Restore::Sup(var, old));
        }
        Ok(())
    }

    /// Assigns a variable, removing every other value. A no-op if the
    /// variable is already assigned to the value.
    ///
    /// # Errors
    ///
    /// [`Contradiction`] if the value is not in the current domain.
    pub fn assign_var(&mut self, var: Var, val: Value) -> Result<(), Contradiction> {
        let dom = &self.domains[var.idx()];
        if !dom.contains(val) {
            self.when_contradiction();
            return Err(Contradiction);
        }
        if dom.assigned() {
            return Ok(());
        }
        for v in (self.domains[var.idx()].inf..=self.domains[var.idx()].sup).map(Value::new) {
            if v != val {
                self.remove_internal(var, v)?;
            }
        }
        self.pending.push(VarEvent {
            var,
            kind: EventKind::Assign(val),
        });
        Ok(())
    }

    /// Removes a value from a variable's current domain. A no-op if the
    /// value is already absent.
    ///
    /// # Errors
    ///
    /// [`Contradiction`] if this was the last value.
    pub fn remove_value(&mut self, var: Var, val: Value) -> Result<(), Contradiction> {
        let dom = &self.domains[var.idx()];
        if !dom.contains(val) {
            return Ok(());
        }
        if dom.assigned() {
            self.when_contradiction();
            return Err(Contradiction);
        }
        self.remove_internal(var, val)?;
        self.pending.push(VarEvent {
            var,
            kind: EventKind::Remove(val),
        });
        if let Some(single) = self.domains[var.idx()].single_value() {
            self.pending.push(VarEvent {
                var,
                kind: EventKind::Assign(single),
            });
        }
        Ok(())
    }

    /// Raises the current domain lower bound to `val`. A no-op if the bound
    /// is already at least `val`.
    ///
    /// # Errors
    ///
    /// [`Contradiction`] if the domain empties.
    pub fn increase_inf(&mut self, var: Var, val: Value) -> Result<(), Contradiction> {
        if self.domains[var.idx()].inf >= val.idx32() {
            return Ok(());
        }
        if val.idx32() > self.domains[var.idx()].sup {
            self.when_contradiction();
            return Err(Contradiction);
        }
        for v in (self.domains[var.idx()].inf..val.idx32()).map(Value::new) {
            self.remove_internal(var, v)?;
        }
        self.pending.push(VarEvent {
            var,
            kind: EventKind::Increase(self.inf(var)),
        });
        if let Some(single) = self.domains[var.idx()].single_value() {
            self.pending.push(VarEvent {
                var,
                kind: EventKind::Assign(single),
            });
        }
        Ok(())
    }

    /// Lowers the current domain upper bound to `val`. A no-op if the bound
    /// is already at most `val`.
    ///
    /// # Errors
    ///
    /// [`Contradiction`] if the domain empties.
    pub fn decrease_sup(&mut self, var: Var, val: Value) -> Result<(), Contradiction> {
        if self.domains[var.idx()].sup <= val.idx32() {
            return Ok(());
        }
        if val.idx32() < self.domains[var.idx()].inf {
            self.when_contradiction();
            return Err(Contradiction);
        }
        for v in ((val.idx32() + 1)..=self.domains[var.idx()].sup).map(Value::new) {
            self.remove_internal(var, v)?;
        }
        self.pending.push(VarEvent {
            var,
            kind: EventKind::Decrease(self.sup(var)),
        });
        if let Some(single) = self.domains[var.idx()].single_value() {
            self.pending.push(VarEvent {
                var,
                kind: EventKind::Assign(single),
            });
        }
        Ok(())
    }

    /// Checks that the bound gap is still open
    ///
    /// # Errors
    ///
    /// [`Contradiction`] when `lb >= ub`.
    pub fn enforce_ub(&mut self) -> Result<(), Contradiction> {
        if self.lb.cuts(self.ub) {
            self.when_contradiction();
            return Err(Contradiction);
        }
        Ok(())
    }

    /// Propagates to a local fixpoint: folds fully assigned cost functions
    /// into the lower bound and prunes values whose unary cost can no longer
    /// fit under the upper bound. This is deliberately the weakest useful
    /// propagation level; stronger local consistencies are external.
    ///
    /// # Errors
    ///
    /// [`Contradiction`] on an empty domain or a closed bound gap.
    pub fn propagate(&mut self) -> Result<(), Contradiction> {
        if !self.propagate_enabled {
            return Ok(());
        }
        loop {
            let mut changed = false;
            // fold fully assigned cost functions into the lower bound
            for cid in 0..self.constrs.len() {
                let constr = &self.constrs[cid];
                if !constr.connected
                    || constr.folded
                    || matches!(constr.kind, CostFnKind::Global { .. } | CostFnKind::Embedded(_))
                {
                    continue;
                }
                if !constr.scope.iter().all(|&v| self.assigned(v)) {
                    continue;
                }
                let tuple: Vec<Value> = self.constrs[cid]
                    .scope
                    .iter()
                    .map(|&v| self.value_of(v).expect("assigned"))
                    .collect();
                let cost = self.eval_constraint(cid, &tuple);
                self.constrs[cid].folded = true;
                self.trail.push(Restore::Folded(cid));
                if cost > Cost::ZERO {
                    self.trail.push(Restore::Lb(self.lb));
                    self.lb += cost;
                    if self.lb.cuts(self.ub) {
                        self.when_contradiction();
                        return Err(Contradiction);
                    }
                }
                changed = true;
            }
            // prune values with no unary support under the bound
            for var in (0..self.vars.len()).map(|i| Var::new(u32::try_from(i).expect("too many variables"))) {
                if self.assigned(var) {
                    continue;
                }
                let unaries: Vec<usize> = self
                    .constrs
                    .iter()
                    .enumerate()
                    .filter(|(_, c)| {
                        c.connected
                            && !c.folded
                            && c.scope == [var]
                            && matches!(c.kind, CostFnKind::Unary(_))
                    })
                    .map(|(cid, _)| cid)
                    .collect();
                if unaries.is_empty() {
                    continue;
                }
                let dom = &self.domains[var.idx()];
                let to_remove: Vec<Value> = (dom.inf..=dom.sup)
                    .map(Value::new)
                    .filter(|&v| dom.contains(v))
                    .filter(|&v| {
                        let unary: Cost =
                            unaries.iter().map(|&cid| self.eval_constraint(cid, &[v])).sum();
                        (self.lb + unary).cuts(self.ub)
                    })
                    .collect();
                for v in to_remove {
                    self.remove_value(var, v)?;
                    changed = true;
                }
            }
            if !changed {
                break;
            }
        }
        self.enforce_ub()
    }

    /// Bulk assignment used by the probe evaluation of the embedded
    /// constraint: assigns all pairs, then propagates.
    ///
    /// # Errors
    ///
    /// [`Contradiction`] as soon as an assignment or the final propagation
    /// fails.
    pub fn assign_ls(&mut self, assignment: &[(Var, Value)]) -> Result<(), Contradiction> {
        for &(var, val) in assignment {
            self.assign_var(var, val)?;
        }
        self.propagate()
    }

    /// Cleanup after a contradiction: drops the pending event queue so no
    /// stale event leaks into the next propagation round
    pub fn when_contradiction(&mut self) {
        self.pending.clear();
    }

    // === store / restore ==================================================

    /// Pushes a save point and returns the depth to restore to
    pub fn store(&mut self) -> usize {
        self.trail.store()
    }

    /// The current store depth
    #[must_use]
    pub fn depth(&self) -> usize {
        self.trail.depth()
    }

    /// Restores all backtrackable state to the given depth
    pub fn restore(&mut self, depth: usize) {
        // split borrows: the trail is replayed onto the rest of the state
        let mut trail = std::mem::take(&mut self.trail);
        trail.restore(depth, |event| match event {
            Restore::Present(var, val) => {
                let dom = &mut self.domains[var.idx()];
                dom.present[val.idx()] = true;
                dom.n_present += 1;
            }
            Restore::Inf(var, old) => self.domains[var.idx()].inf = old,
            Restore::Sup(var, old) => self.domains[var.idx()].sup = old,
            Restore::Lb(old) => self.lb = old,
            Restore::Ub(old) => self.ub = old,
            Restore::Folded(cid) => self.constrs[cid].folded = false,
            Restore::Connected(cid) => self.constrs[cid].connected = true,
            Restore::TruncConstrs(len) => self.constrs.truncate(len),
        });
        self.trail = trail;
        self.pending.clear();
    }

    /// Records the current constraint count so constraints posted during
    /// search are dropped again on restore
    pub fn mark_posted_constraints(&mut self) {
        self.trail.push(Restore::TruncConstrs(self.constrs.len()));
    }
}

impl fmt::Display for Wcsp {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} ({} vars, {} cost functions, lb {}, ub {}, negCost {})",
            self.name,
            self.vars.len(),
            self.constrs.len(),
            self.lb,
            self.ub,
            self.neg_cost
        )
    }
}

fn eval_arithmetic(form: &ArithmeticFn, tuple: &[Value]) -> Cost {
    match form {
        ArithmeticFn::Sup { cst, delta } => {
            let x = i64::from(tuple[0].idx32());
            let y = i64::from(tuple[1].idx32());
            let violation = y + cst - x;
            if violation <= 0 {
                Cost::ZERO
            } else if Cost::new(violation) <= *delta {
                Cost::new(violation)
            } else {
                Cost::TOP
            }
        }
        ArithmeticFn::Disjunction { cstx, csty, penalty } => {
            let x = i64::from(tuple[0].idx32());
            let y = i64::from(tuple[1].idx32());
            if x >= y + csty || y >= x + cstx {
                Cost::ZERO
            } else {
                *penalty
            }
        }
        ArithmeticFn::SpecialDisjunction {
            cstx,
            csty,
            xinfty,
            yinfty,
            costx,
            costy,
        } => {
            let x = i64::from(tuple[0].idx32());
            let y = i64::from(tuple[1].idx32());
            let x_out = tuple[0] >= *xinfty;
            let y_out = tuple[1] >= *yinfty;
            if !x_out && !y_out && x + cstx > y && y + csty > x {
                return Cost::TOP;
            }
            let mut cost = Cost::ZERO;
            if x_out {
                cost += *costx;
            }
            if y_out {
                cost += *costy;
            }
            cost
        }
        ArithmeticFn::IntervalUnary { allowed, penalty } => {
            if allowed.contains(&tuple[0]) {
                Cost::ZERO
            } else {
                *penalty
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use crate::{
        solving::EventKind,
        types::{costs::Cost, Value, Var},
        vtuple,
    };

    use super::{BuildError, KnapsackParams, Wcsp};

    fn two_bools() -> (Wcsp, Var, Var) {
        let mut wcsp = Wcsp::new("test");
        let x = wcsp.make_enum_var("x", 1).unwrap();
        let y = wcsp.make_enum_var("y", 1).unwrap();
        (wcsp, x, y)
    }

    #[test]
    fn registry_redeclaration() {
        let (mut wcsp, x, _) = two_bools();
        assert_eq!(wcsp.var_index("x"), x.idx());
        assert_eq!(wcsp.var_index("unused"), 2);
        assert_eq!(
            wcsp.make_enum_var("x", 3),
            Err(BuildError::VarNameClash(String::from("x")))
        );
    }

    #[test]
    fn value_names() {
        let mut wcsp = Wcsp::new("test");
        let x = wcsp
            .make_enum_var_named("x", vec![String::from("a"), String::from("b")])
            .unwrap();
        assert_eq!(wcsp.value_index(x, "b"), Some(Value::new(1)));
        assert_eq!(wcsp.value_index(x, "c"), None);
    }

    #[test]
    fn unary_table_checks() {
        let (mut wcsp, x, _) = two_bools();
        assert!(matches!(
            wcsp.post_unary(x, &[Cost::ZERO]),
            Err(BuildError::TableSizeMismatch(1, 2))
        ));
        assert!(wcsp.post_unary(x, &[Cost::ZERO, Cost::UNIT]).is_ok());
    }

    #[test]
    fn duplicate_scope_rejected() {
        let (mut wcsp, x, _) = two_bools();
        assert!(matches!(
            wcsp.post_binary(x, x, &[Cost::ZERO; 4]),
            Err(BuildError::DuplicateScopeVar(_))
        ));
    }

    #[test]
    fn negative_costs_shift_into_neg_cost() {
        let (mut wcsp, x, y) = two_bools();
        let cid = wcsp
            .post_binary(
                x,
                y,
                &[Cost::new(-3), Cost::ZERO, Cost::new(2), Cost::new(-1)],
            )
            .unwrap();
        assert_eq!(wcsp.neg_cost(), Cost::new(3));
        assert_eq!(
            wcsp.eval_constraint(cid, &[Value::new(0), Value::new(0)]),
            Cost::ZERO
        );
        assert_eq!(
            wcsp.eval_constraint(cid, &[Value::new(1), Value::new(0)]),
            Cost::new(5)
        );
        // true cost of (0,0) is computed cost minus the shift
        assert_eq!(
            wcsp.eval_complete(&[Value::new(0), Value::new(0)]) - wcsp.neg_cost(),
            Cost::new(-3)
        );
    }

    #[test]
    fn nary_duplicate_tuple() {
        let mut wcsp = Wcsp::new("test");
        let scope: Vec<Var> = (0..4)
            .map(|i| wcsp.make_enum_var(format!("x{i}"), 1).unwrap())
            .collect();
        let cid = wcsp.post_nary_begin(scope, Cost::ZERO, 2).unwrap();
        wcsp.post_nary_tuple(cid, vtuple![0, 0, 1, 1], Cost::UNIT)
            .unwrap();
        assert!(matches!(
            wcsp.post_nary_tuple(cid, vtuple![0, 0, 1, 1], Cost::UNIT),
            Err(BuildError::DuplicateTuple(_))
        ));
    }

    #[test]
    fn nary_positive_minimum_projects_to_lb() {
        let mut wcsp = Wcsp::new("test");
        let scope: Vec<Var> = (0..4)
            .map(|i| wcsp.make_enum_var(format!("x{i}"), 1).unwrap())
            .collect();
        let cid = wcsp.post_nary_begin(scope, Cost::new(5), 1).unwrap();
        wcsp.post_nary_tuple(cid, vtuple![1, 1, 1, 1], Cost::new(2))
            .unwrap();
        wcsp.post_nary_end(cid).unwrap();
        assert_eq!(wcsp.lb(), Cost::new(2));
        assert_eq!(
            wcsp.eval_constraint(cid, &[Value::new(1); 4]),
            Cost::ZERO
        );
        assert_eq!(
            wcsp.eval_constraint(cid, &[Value::new(0); 4]),
            Cost::new(3)
        );
    }

    #[test]
    fn sharing_checks_domains() {
        let mut wcsp = Wcsp::new("test");
        let x = wcsp.make_enum_var("x", 1).unwrap();
        let y = wcsp.make_enum_var("y", 1).unwrap();
        let z = wcsp.make_enum_var("z", 2).unwrap();
        let cid = wcsp
            .post_binary(x, y, &[Cost::ZERO, Cost::UNIT, Cost::UNIT, Cost::ZERO])
            .unwrap();
        wcsp.register_fn_name("eq", cid);
        assert!(wcsp.post_shared("eq", vec![y, x]).is_ok());
        assert!(matches!(
            wcsp.post_shared("eq", vec![x, z]),
            Err(BuildError::ShareMismatch(_))
        ));
        assert!(matches!(
            wcsp.post_shared("unknown", vec![x, y]),
            Err(BuildError::UnknownShared(_))
        ));
    }

    #[test]
    fn bound_idempotence() {
        let (mut wcsp, ..) = two_bools();
        wcsp.update_ub(Cost::new(10));
        let ub = wcsp.ub();
        wcsp.update_ub(ub);
        assert_eq!(wcsp.ub(), ub);
        wcsp.increase_lb(Cost::ZERO).unwrap();
        assert_eq!(wcsp.lb(), Cost::ZERO);
    }

    #[test]
    fn lb_reaching_ub_is_infeasible() {
        let (mut wcsp, ..) = two_bools();
        wcsp.update_ub(Cost::new(2));
        assert!(matches!(
            wcsp.increase_lb(Cost::new(2)),
            Err(BuildError::Infeasible(..))
        ));
    }

    #[test]
    fn knapsack_eval() {
        let (mut wcsp, x, y) = two_bools();
        let cid = wcsp
            .post_knapsack(
                vec![x, y],
                KnapsackParams {
                    capacity: 1,
                    terms: vec![(0, Value::new(1), 1), (1, Value::new(1), 1)],
                },
            )
            .unwrap();
        assert_eq!(
            wcsp.eval_constraint(cid, &[Value::new(1), Value::new(0)]),
            Cost::ZERO
        );
        assert!(wcsp
            .eval_constraint(cid, &[Value::new(0), Value::new(0)])
            .is_top());
    }

    #[test]
    fn assign_folds_and_restores() {
        let (mut wcsp, x, y) = two_bools();
        wcsp.update_ub(Cost::new(10));
        wcsp.post_binary(x, y, &[Cost::ZERO, Cost::new(2), Cost::new(2), Cost::ZERO])
            .unwrap();
        let depth = wcsp.store();
        wcsp.assign_var(x, Value::new(0)).unwrap();
        wcsp.assign_var(y, Value::new(1)).unwrap();
        wcsp.propagate().unwrap();
        assert_eq!(wcsp.lb(), Cost::new(2));
        wcsp.restore(depth);
        assert_eq!(wcsp.lb(), Cost::ZERO);
        assert!(!wcsp.assigned(x));
        assert_eq!(wcsp.domain_size(x), 2);
    }

    #[test]
    fn unary_pruning_under_bound() {
        let (mut wcsp, x, _) = two_bools();
        wcsp.update_ub(Cost::new(3));
        wcsp.post_unary(x, &[Cost::ZERO, Cost::new(5)]).unwrap();
        wcsp.store();
        wcsp.propagate().unwrap();
        assert!(!wcsp.can_be(x, Value::new(1)));
        assert_eq!(wcsp.value_of(x), Some(Value::new(0)));
    }

    #[test]
    fn events_queue_in_order() {
        let (mut wcsp, x, _) = two_bools();
        wcsp.assign_var(x, Value::new(1)).unwrap();
        let events = wcsp.drain_events();
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].kind, EventKind::Assign(Value::new(1)));
        // re-assigning the same value is a no-op
        wcsp.assign_var(x, Value::new(1)).unwrap();
        assert!(wcsp.drain_events().is_empty());
    }
}
