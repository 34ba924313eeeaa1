//! # Global Cost Functions
//!
//! The catalogue of global cost function templates understood by the
//! loaders. Each template name maps to a parameter schema written in a small
//! template language:
//!
//! - `K` keyword, `N` integer, `v` value index, `V` variable, `C` signed
//!   cost, `c` non-negative cost
//! - `:tag:` a JSON tag in the tag-qualified CFN form
//! - `[...]+` a variable-length list of records (the canonical stream
//!   carries the record count before the list)
//! - `[...]S` a list with exactly one record per scope variable
//!
//! Three names (`sgrammar`, `sgrammardp`, `ssame`) have irregular layouts
//! and dedicated readers. Monolithic `s*` functions are forwarded to their
//! external propagator as a parameter payload; the decomposed `w*` family is
//! expanded here into networks of table cost functions over auxiliary
//! counter and state variables.

use thiserror::Error;

use crate::types::{costs::Cost, Value, Var};

use super::wcsp::{BuildError, CliqueParams, KnapsackParams, Wcsp};

/// The parameter schema of a global cost function template, or `Special` for
/// the three irregular layouts
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Template {
    /// Schema in the template language
    Schema(&'static str),
    /// Dedicated reader
    Special,
}

/// Looks up the parameter template of a global cost function
#[must_use]
pub fn template_of(name: &str) -> Option<Template> {
    let schema = match name {
        "clique" => ":rhs:N:values:[v+]S",
        "knapsack" => ":capacity:N:weights:[N]S",
        "salldiff" | "salldiffdp" | "walldiff" | "wsame" => ":metric:K:cost:c",
        "sgcc" | "sgccdp" | "wgcc" | "wsamegcc" => ":metric:K:cost:c:bounds:[vNN]+",
        "ssame" | "sgrammar" | "sgrammardp" | "knapsackp" => return Some(Template::Special),
        "sregular" => ":metric:K:cost:c:nb_states:N:starts:[N]+:ends:[N]+:transitions:[NvN]+",
        "sregulardp" => ":metric:K:cost:C:nb_states:N:starts:[N]+:ends:[N]+:transitions:[NvN]+",
        "samong" | "samongdp" => ":metric:K:cost:c:min:N:max:N:values:[v]+",
        "max" | "smaxdp" => ":defaultcost:c:tuples:[Vvc]+",
        "MST" | "smstdp" => "",
        "wregular" => ":nb_states:N:starts:[NC]+:ends:[NC]+:transitions:[NvNC]+",
        "wamong" => ":metric:K:cost:c:values:[v]+:min:N:max:N",
        "wvaramong" => ":metric:K:cost:c:values:[v]+",
        "woverlap" | "wsum" => ":metric:K:cost:c:comparator:K:to:N",
        "wvarsum" => ":metric:K:cost:c:comparator:K",
        "wdiverse" | "whdiverse" | "wtdiverse" => ":distance:N:values:[v]S",
        _ => return None,
    };
    Some(Template::Schema(schema))
}

/// The `sgcc` template is widened when the `wdec` metric is read
pub(crate) const SGCC_WDEC_SCHEMA: &str = ":metric:K:cost:c:bounds:[vNNcc]+";

/// Errors raised while reading or expanding a global cost function
#[derive(Error, Debug, PartialEq)]
pub enum GlobalError {
    /// The name is not in the catalogue
    #[error("unknown global cost function '{0}'")]
    UnknownGlobal(String),
    /// The parameter stream ended early
    #[error("missing parameter for global cost function '{0}'")]
    MissingParameter(&'static str),
    /// A parameter token has the wrong shape
    #[error("invalid parameter '{1}' for global cost function: {0} expected")]
    InvalidParameter(&'static str, String),
    /// The metric keyword is not supported by this function
    #[error("metric '{0}' is not supported by '{1}'")]
    UnsupportedMetric(String, &'static str),
    /// The scope does not fit the function (odd arity for a two-halves
    /// function, arity/list mismatch)
    #[error("scope of length {1} does not fit global cost function '{0}'")]
    ScopeMismatch(&'static str, usize),
    /// Posting an expanded piece failed
    #[error(transparent)]
    Build(#[from] BuildError),
}

/// A source of canonical parameter tokens. The canonical stream is the
/// tag-free whitespace layout of the legacy WCSP format; the CFN loader
/// lowers its tagged form into it before posting.
pub struct ParamStream {
    tokens: Vec<String>,
    pos: usize,
}

impl ParamStream {
    /// Wraps a token list
    #[must_use]
    pub fn new(tokens: Vec<String>) -> Self {
        ParamStream { tokens, pos: 0 }
    }

    fn next(&mut self) -> Result<&str, GlobalError> {
        let token = self
            .tokens
            .get(self.pos)
            .ok_or(GlobalError::MissingParameter("parameter"))?;
        self.pos += 1;
        Ok(token)
    }

    fn next_i64(&mut self) -> Result<i64, GlobalError> {
        let token = self.next()?;
        token
            .parse()
            .map_err(|_| GlobalError::InvalidParameter("integer", String::from(token)))
    }

    fn next_u32(&mut self) -> Result<u32, GlobalError> {
        let token = self.next()?;
        token
            .parse()
            .map_err(|_| GlobalError::InvalidParameter("number", String::from(token)))
    }

    fn next_value(&mut self) -> Result<Value, GlobalError> {
        Ok(Value::new(self.next_u32()?))
    }

    fn next_cost(&mut self) -> Result<Cost, GlobalError> {
        Ok(Cost::new(self.next_i64()?))
    }

    fn next_keyword(&mut self) -> Result<String, GlobalError> {
        Ok(String::from(self.next()?))
    }

    /// The tokens left unconsumed
    #[must_use]
    pub fn rest(self) -> Vec<String> {
        self.tokens[self.pos..].to_vec()
    }
}

/// Reads the canonical (tag-free, count-prefixed) parameter stream of a
/// global cost function from a token source, consuming exactly the tokens
/// the template describes. The legacy WCSP loader reads parameters straight
/// from the file with this; the CFN loader produces the same stream from the
/// tagged form first.
///
/// # Errors
///
/// [`GlobalError`] on an unknown name or malformed parameters.
pub fn read_canonical<F>(
    name: &str,
    scope_len: usize,
    mut next: F,
) -> Result<Vec<String>, GlobalError>
where
    F: FnMut() -> Result<String, GlobalError>,
{
    let template = template_of(name).ok_or_else(|| GlobalError::UnknownGlobal(String::from(name)))?;
    let mut out = vec![];
    match template {
        Template::Special => read_canonical_special(name, scope_len, &mut out, &mut next)?,
        Template::Schema(schema) => {
            let mut chars = schema.chars().peekable();
            while let Some(c) = chars.next() {
                match c {
                    ':' => {
                        // skip the tag name up to its closing colon
                        for t in chars.by_ref() {
                            if t == ':' {
                                break;
                            }
                        }
                        // the next schema symbol follows immediately; handled
                        // by the outer loop except when the tag closes the
                        // schema
                    }
                    'K' => {
                        let token = next()?;
                        // the wdec metric widens the sgcc schema
                        if name == "sgcc" && token == "wdec" {
                            let mut widened = SGCC_WDEC_SCHEMA.chars().peekable();
                            for _ in 0..":metric:K".len() {
                                widened.next();
                            }
                            chars = widened;
                        }
                        out.push(token);
                    }
                    'N' | 'V' | 'v' | 'C' | 'c' => out.push(next()?),
                    '[' => {
                        let mut record = vec![];
                        let mut var_repeat = false;
                        for t in chars.by_ref() {
                            match t {
                                ']' => break,
                                '+' => var_repeat = true,
                                sym => record.push(sym),
                            }
                        }
                        let repeats = match chars.next() {
                            Some('+') => {
                                let count = next()?;
                                let n: usize = count.parse().map_err(|_| {
                                    GlobalError::InvalidParameter("count", count.clone())
                                })?;
                                out.push(count);
                                n
                            }
                            Some('S') => scope_len,
                            other => {
                                return Err(GlobalError::InvalidParameter(
                                    "list marker",
                                    other.map(String::from).unwrap_or_default(),
                                ))
                            }
                        };
                        for _ in 0..repeats {
                            if var_repeat {
                                let count = next()?;
                                let n: usize = count.parse().map_err(|_| {
                                    GlobalError::InvalidParameter("count", count.clone())
                                })?;
                                out.push(count);
                                for _ in 0..n {
                                    for _ in &record {
                                        out.push(next()?);
                                    }
                                }
                            } else {
                                for _ in &record {
                                    out.push(next()?);
                                }
                            }
                        }
                    }
                    _ => (),
                }
            }
        }
    }
    Ok(out)
}

fn read_canonical_special<F>(
    name: &str,
    scope_len: usize,
    out: &mut Vec<String>,
    next: &mut F,
) -> Result<(), GlobalError>
where
    F: FnMut() -> Result<String, GlobalError>,
{
    let count = |token: &str| -> Result<usize, GlobalError> {
        token
            .parse()
            .map_err(|_| GlobalError::InvalidParameter("count", String::from(token)))
    };
    match name {
        // capacity, then per scope variable a count and that many
        // (value, weight) pairs
        "knapsackp" => {
            out.push(next()?);
            for _ in 0..scope_len {
                let n_tok = next()?;
                let n = count(&n_tok)?;
                out.push(n_tok);
                for _ in 0..(2 * n) {
                    out.push(next()?);
                }
            }
        }
        // cost, the two list sizes, then the listed variables
        "ssame" => {
            out.push(next()?);
            let s1_tok = next()?;
            let s1 = count(&s1_tok)?;
            out.push(s1_tok);
            let s2_tok = next()?;
            let s2 = count(&s2_tok)?;
            out.push(s2_tok);
            for _ in 0..(s1 + s2) {
                out.push(next()?);
            }
        }
        // metric, cost, symbol/value counts, start symbol, then tagged
        // rules whose length depends on the leading tag
        "sgrammar" | "sgrammardp" => {
            for _ in 0..5 {
                out.push(next()?);
            }
            let n_tok = next()?;
            let n = count(&n_tok)?;
            out.push(n_tok);
            for _ in 0..n {
                let tag = next()?;
                let fields = match tag.as_str() {
                    "0" => 2,
                    "1" | "2" => 3,
                    "3" => 4,
                    other => {
                        return Err(GlobalError::InvalidParameter(
                            "grammar rule tag",
                            String::from(other),
                        ))
                    }
                };
                out.push(tag);
                for _ in 0..fields {
                    out.push(next()?);
                }
            }
        }
        _ => return Err(GlobalError::UnknownGlobal(String::from(name))),
    }
    Ok(())
}

/// Posts a global cost function from its canonical parameter stream:
/// `clique` and `knapsack` go to their dedicated posts, the `w*` family is
/// decomposed into a network of table cost functions, everything else is
/// forwarded as a monolithic payload.
///
/// # Errors
///
/// [`GlobalError`] on an unknown name, malformed parameters or a failing
/// post.
pub fn post_global_from_stream(
    wcsp: &mut Wcsp,
    name: &str,
    scope: Vec<Var>,
    params: Vec<String>,
) -> Result<(), GlobalError> {
    if template_of(name).is_none() {
        return Err(GlobalError::UnknownGlobal(String::from(name)));
    }
    let mut stream = ParamStream::new(params);
    match name {
        "clique" => {
            let rhs = stream.next_u32()?;
            let mut values = Vec::with_capacity(scope.len());
            for _ in 0..scope.len() {
                let count = stream.next_u32()?;
                let mut vals = Vec::with_capacity(count as usize);
                for _ in 0..count {
                    vals.push(stream.next_value()?);
                }
                values.push(vals);
            }
            wcsp.post_clique(scope, CliqueParams { rhs, values })?;
            Ok(())
        }
        "knapsack" => {
            let capacity = stream.next_i64()?;
            let mut terms = Vec::with_capacity(scope.len());
            for pos in 0..scope.len() {
                terms.push((pos, Value::new(1), stream.next_i64()?));
            }
            wcsp.post_knapsack(scope, KnapsackParams { capacity, terms })?;
            Ok(())
        }
        "knapsackp" => {
            let capacity = stream.next_i64()?;
            let mut terms = vec![];
            for pos in 0..scope.len() {
                let count = stream.next_u32()?;
                for _ in 0..count {
                    let value = stream.next_value()?;
                    let weight = stream.next_i64()?;
                    terms.push((pos, value, weight));
                }
            }
            wcsp.post_knapsack(scope, KnapsackParams { capacity, terms })?;
            Ok(())
        }
        "wregular" => decompose_wregular(wcsp, &scope, &mut stream),
        "walldiff" => decompose_walldiff(wcsp, &scope, &mut stream),
        "wgcc" => decompose_wgcc(wcsp, &scope, &mut stream),
        "wsame" => decompose_wsame(wcsp, &scope, &mut stream, false),
        "wsamegcc" => decompose_wsame(wcsp, &scope, &mut stream, true),
        "wamong" => decompose_wamong(wcsp, &scope, &mut stream),
        "wvaramong" => decompose_wvaramong(wcsp, &scope, &mut stream),
        "woverlap" => decompose_woverlap(wcsp, &scope, &mut stream),
        "wsum" => decompose_wsum(wcsp, &scope, &mut stream),
        "wvarsum" => decompose_wvarsum(wcsp, &scope, &mut stream),
        "wdiverse" | "whdiverse" | "wtdiverse" => decompose_wdiverse(wcsp, &scope, &mut stream),
        // monolithic: keep the parameter payload for the external propagator
        _ => {
            let payload = stream.rest();
            wcsp.post_global(scope, String::from(name), payload)?;
            Ok(())
        }
    }
}

/// The violation metrics of the decomposed family
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Metric {
    /// Flat violation cost
    Hard,
    /// Cost per violation unit
    Var,
}

fn read_metric(stream: &mut ParamStream, name: &'static str) -> Result<Metric, GlobalError> {
    let keyword = stream.next_keyword()?;
    match keyword.as_str() {
        "hard" => Ok(Metric::Hard),
        "var" | "lin" => Ok(Metric::Var),
        _ => Err(GlobalError::UnsupportedMetric(keyword, name)),
    }
}

fn violation_cost(metric: Metric, cost: Cost, units: u32) -> Cost {
    match metric {
        Metric::Hard => {
            if units == 0 {
                Cost::ZERO
            } else {
                cost
            }
        }
        Metric::Var => cost
            .checked_mul(i64::from(units))
            .unwrap_or(Cost::TOP),
    }
}

/// Creates a fresh auxiliary enumerated variable. Auxiliary variables count
/// like any other variable for search; their names stay out of the way of
/// user variables.
fn make_aux(wcsp: &mut Wcsp, prefix: &str, last: u32) -> Result<Var, BuildError> {
    let name = format!("__{prefix}_{}", wcsp.num_variables());
    wcsp.make_enum_var(name, last)
}

/// Builds a counter chain over the scope: auxiliary counter variables
/// `C_0 .. C_n` with domain `[0, clamp]`, `C_0` pinned to zero and
/// `C_{i+1} = min(clamp, C_i + weight(i, x_i))` enforced by ternary tables.
/// Returns the final counter variable.
fn post_counter_chain(
    wcsp: &mut Wcsp,
    prefix: &str,
    scope: &[Var],
    clamp: u32,
    weight: impl Fn(usize, Value) -> u32,
) -> Result<Var, BuildError> {
    let states = clamp + 1;
    let mut prev = make_aux(wcsp, prefix, clamp)?;
    let mut pin = vec![Cost::TOP; states as usize];
    pin[0] = Cost::ZERO;
    wcsp.post_unary(prev, &pin)?;
    for (i, &x) in scope.iter().enumerate() {
        let next = make_aux(wcsp, prefix, clamp)?;
        let dx = wcsp.variable(x).init_size();
        let mut costs = vec![Cost::TOP; (states * dx * states) as usize];
        for c in 0..states {
            for v in 0..dx {
                let target = (c + weight(i, Value::new(v))).min(clamp);
                costs[(c * dx * states + v * states + target) as usize] = Cost::ZERO;
            }
        }
        wcsp.post_ternary(prev, x, next, &costs)?;
        prev = next;
    }
    Ok(prev)
}

/// `wregular`: unrolls a weighted finite automaton over the scope with
/// auxiliary state variables, a unary table for initial states, one ternary
/// transition table per position and a unary table for accepting states.
fn decompose_wregular(
    wcsp: &mut Wcsp,
    scope: &[Var],
    stream: &mut ParamStream,
) -> Result<(), GlobalError> {
    let nb_states = stream.next_u32()?;
    if nb_states == 0 {
        return Err(GlobalError::InvalidParameter(
            "positive state count",
            String::from("0"),
        ));
    }
    let nb_starts = stream.next_u32()?;
    let mut starts = vec![Cost::TOP; nb_states as usize];
    for _ in 0..nb_starts {
        let q = stream.next_u32()?;
        let cost = stream.next_cost()?;
        starts[q as usize] = starts[q as usize].min(cost);
    }
    let nb_ends = stream.next_u32()?;
    let mut ends = vec![Cost::TOP; nb_states as usize];
    for _ in 0..nb_ends {
        let q = stream.next_u32()?;
        let cost = stream.next_cost()?;
        ends[q as usize] = ends[q as usize].min(cost);
    }
    let nb_transitions = stream.next_u32()?;
    let mut transitions = Vec::with_capacity(nb_transitions as usize);
    for _ in 0..nb_transitions {
        let q = stream.next_u32()?;
        let v = stream.next_value()?;
        let q2 = stream.next_u32()?;
        let cost = stream.next_cost()?;
        transitions.push((q, v, q2, cost));
    }

    let mut prev = make_aux(wcsp, "wregular_q", nb_states - 1)?;
    wcsp.post_unary(prev, &starts)?;
    for &x in scope {
        let next = make_aux(wcsp, "wregular_q", nb_states - 1)?;
        let dx = wcsp.variable(x).init_size();
        let mut costs = vec![Cost::TOP; (nb_states * dx * nb_states) as usize];
        for &(q, v, q2, cost) in &transitions {
            if q < nb_states && q2 < nb_states && v.idx32() < dx {
                let idx = (q * dx * nb_states + v.idx32() * nb_states + q2) as usize;
                costs[idx] = costs[idx].min(cost);
            }
        }
        wcsp.post_ternary(prev, x, next, &costs)?;
        prev = next;
    }
    wcsp.post_unary(prev, &ends)?;
    Ok(())
}

/// `walldiff`: pairwise binary decomposition charging the violation cost on
/// every equal pair
fn decompose_walldiff(
    wcsp: &mut Wcsp,
    scope: &[Var],
    stream: &mut ParamStream,
) -> Result<(), GlobalError> {
    let metric = read_metric(stream, "walldiff")?;
    let cost = stream.next_cost()?;
    let penalty = violation_cost(metric, cost, 1);
    for (i, &x) in scope.iter().enumerate() {
        for &y in &scope[i + 1..] {
            let dx = wcsp.variable(x).init_size();
            let dy = wcsp.variable(y).init_size();
            let mut costs = vec![Cost::ZERO; (dx * dy) as usize];
            for v in 0..dx.min(dy) {
                costs[(v * dy + v) as usize] = penalty;
            }
            wcsp.post_binary(x, y, &costs)?;
        }
    }
    Ok(())
}

/// `wamong`: counter chain counting scope variables taking one of the listed
/// values, with the violation charged outside `[min, max]`
fn decompose_wamong(
    wcsp: &mut Wcsp,
    scope: &[Var],
    stream: &mut ParamStream,
) -> Result<(), GlobalError> {
    let metric = read_metric(stream, "wamong")?;
    let cost = stream.next_cost()?;
    let nb_values = stream.next_u32()?;
    let mut values = Vec::with_capacity(nb_values as usize);
    for _ in 0..nb_values {
        values.push(stream.next_value()?);
    }
    let lb = stream.next_u32()?;
    let ub = stream.next_u32()?;
    post_among_chain(wcsp, scope, &values, lb, ub, metric, cost)?;
    Ok(())
}

fn post_among_chain(
    wcsp: &mut Wcsp,
    scope: &[Var],
    values: &[Value],
    lb: u32,
    ub: u32,
    metric: Metric,
    cost: Cost,
) -> Result<(), BuildError> {
    let clamp = u32::try_from(scope.len()).expect("scope too large");
    let counter = post_counter_chain(wcsp, "wamong_c", scope, clamp, |_, v| {
        u32::from(values.contains(&v))
    })?;
    let penalties: Vec<Cost> = (0..=clamp)
        .map(|c| {
            let units = lb.saturating_sub(c).max(c.saturating_sub(ub));
            violation_cost(metric, cost, units)
        })
        .collect();
    wcsp.post_unary(counter, &penalties)?;
    Ok(())
}

/// `wvaramong`: like `wamong` but the last scope variable gives the target
/// count
fn decompose_wvaramong(
    wcsp: &mut Wcsp,
    scope: &[Var],
    stream: &mut ParamStream,
) -> Result<(), GlobalError> {
    let metric = read_metric(stream, "wvaramong")?;
    let cost = stream.next_cost()?;
    let nb_values = stream.next_u32()?;
    let mut values = Vec::with_capacity(nb_values as usize);
    for _ in 0..nb_values {
        values.push(stream.next_value()?);
    }
    let (&target, counted) = scope
        .split_last()
        .ok_or(GlobalError::ScopeMismatch("wvaramong", 0))?;
    let clamp = u32::try_from(counted.len()).expect("scope too large");
    let counter = post_counter_chain(wcsp, "wvaramong_c", counted, clamp, |_, v| {
        u32::from(values.contains(&v))
    })?;
    let dt = wcsp.variable(target).init_size();
    let mut costs = Vec::with_capacity(((clamp + 1) * dt) as usize);
    for c in 0..=clamp {
        for t in 0..dt {
            costs.push(violation_cost(metric, cost, c.abs_diff(t)));
        }
    }
    wcsp.post_binary(counter, target, &costs)?;
    Ok(())
}

fn comparator_units(comparator: &str, sum: u32, rhs: i64) -> Result<u32, GlobalError> {
    let sum = i64::from(sum);
    let units = match comparator {
        "==" => sum.abs_diff(rhs),
        "!=" => u64::from(sum == rhs),
        "<=" => u64::try_from(sum - rhs).unwrap_or(0),
        "<" => u64::try_from(sum - rhs + 1).unwrap_or(0),
        ">=" => u64::try_from(rhs - sum).unwrap_or(0),
        ">" => u64::try_from(rhs - sum + 1).unwrap_or(0),
        other => {
            return Err(GlobalError::InvalidParameter(
                "comparator",
                String::from(other),
            ))
        }
    };
    Ok(u32::try_from(units).unwrap_or(u32::MAX))
}

/// `wsum`: counter chain over the value indices with the comparator applied
/// to the final sum
fn decompose_wsum(
    wcsp: &mut Wcsp,
    scope: &[Var],
    stream: &mut ParamStream,
) -> Result<(), GlobalError> {
    let metric = read_metric(stream, "wsum")?;
    let cost = stream.next_cost()?;
    let comparator = stream.next_keyword()?;
    let rhs = stream.next_i64()?;
    let clamp: u32 = scope
        .iter()
        .map(|&x| wcsp.variable(x).init_size() - 1)
        .sum();
    let counter = post_counter_chain(wcsp, "wsum_c", scope, clamp, |_, v| v.idx32())?;
    let penalties = (0..=clamp)
        .map(|s| Ok(violation_cost(metric, cost, comparator_units(&comparator, s, rhs)?)))
        .collect::<Result<Vec<Cost>, GlobalError>>()?;
    wcsp.post_unary(counter, &penalties)?;
    Ok(())
}

/// `wvarsum`: the comparator is applied between the sum of the first scope
/// variables and the last one
fn decompose_wvarsum(
    wcsp: &mut Wcsp,
    scope: &[Var],
    stream: &mut ParamStream,
) -> Result<(), GlobalError> {
    let metric = read_metric(stream, "wvarsum")?;
    let cost = stream.next_cost()?;
    let comparator = stream.next_keyword()?;
    let (&target, summed) = scope
        .split_last()
        .ok_or(GlobalError::ScopeMismatch("wvarsum", 0))?;
    let clamp: u32 = summed
        .iter()
        .map(|&x| wcsp.variable(x).init_size() - 1)
        .sum();
    let counter = post_counter_chain(wcsp, "wvarsum_c", summed, clamp, |_, v| v.idx32())?;
    let dt = wcsp.variable(target).init_size();
    let mut costs = Vec::with_capacity(((clamp + 1) * dt) as usize);
    for s in 0..=clamp {
        for t in 0..dt {
            costs.push(violation_cost(
                metric,
                cost,
                comparator_units(&comparator, s, i64::from(t))?,
            ));
        }
    }
    wcsp.post_binary(counter, target, &costs)?;
    Ok(())
}

/// `wgcc`: one among chain per bounded value
fn decompose_wgcc(
    wcsp: &mut Wcsp,
    scope: &[Var],
    stream: &mut ParamStream,
) -> Result<(), GlobalError> {
    let metric = read_metric(stream, "wgcc")?;
    let cost = stream.next_cost()?;
    let nb_bounds = stream.next_u32()?;
    for _ in 0..nb_bounds {
        let value = stream.next_value()?;
        let lb = stream.next_u32()?;
        let ub = stream.next_u32()?;
        post_among_chain(wcsp, scope, &[value], lb, ub, metric, cost)?;
    }
    Ok(())
}

/// `wsame` / `wsamegcc`: the two scope halves must use every value equally
/// often; counter chains per value on each half, compared at the end.
/// `wsamegcc` additionally bounds the per-value counts on both halves.
fn decompose_wsame(
    wcsp: &mut Wcsp,
    scope: &[Var],
    stream: &mut ParamStream,
    with_gcc: bool,
) -> Result<(), GlobalError> {
    let metric = read_metric(stream, "wsame")?;
    let cost = stream.next_cost()?;
    if scope.len() % 2 != 0 {
        return Err(GlobalError::ScopeMismatch("wsame", scope.len()));
    }
    let half = scope.len() / 2;
    let (left, right) = scope.split_at(half);
    let clamp = u32::try_from(half).expect("scope too large");
    let max_value = scope
        .iter()
        .map(|&x| wcsp.variable(x).init_size())
        .max()
        .unwrap_or(0);
    let mut counters = Vec::with_capacity(max_value as usize);
    for value in (0..max_value).map(Value::new) {
        let cl = post_counter_chain(wcsp, "wsame_c", left, clamp, |_, v| u32::from(v == value))?;
        let cr = post_counter_chain(wcsp, "wsame_c", right, clamp, |_, v| u32::from(v == value))?;
        let states = clamp + 1;
        let mut costs = Vec::with_capacity((states * states) as usize);
        for a in 0..states {
            for b in 0..states {
                costs.push(violation_cost(metric, cost, a.abs_diff(b)));
            }
        }
        wcsp.post_binary(cl, cr, &costs)?;
        counters.push((cl, cr));
    }
    if with_gcc {
        let nb_bounds = stream.next_u32()?;
        for _ in 0..nb_bounds {
            let value = stream.next_value()?;
            let lb = stream.next_u32()?;
            let ub = stream.next_u32()?;
            if value.idx32() >= max_value {
                continue;
            }
            let (cl, cr) = counters[value.idx()];
            for counter in [cl, cr] {
                let penalties: Vec<Cost> = (0..=clamp)
                    .map(|c| {
                        let units = lb.saturating_sub(c).max(c.saturating_sub(ub));
                        violation_cost(metric, cost, units)
                    })
                    .collect();
                wcsp.post_unary(counter, &penalties)?;
            }
        }
    }
    Ok(())
}

/// `woverlap`: counts the positions where the two halves agree on a non-zero
/// value, compared against the right-hand side
fn decompose_woverlap(
    wcsp: &mut Wcsp,
    scope: &[Var],
    stream: &mut ParamStream,
) -> Result<(), GlobalError> {
    let metric = read_metric(stream, "woverlap")?;
    let cost = stream.next_cost()?;
    let comparator = stream.next_keyword()?;
    let rhs = stream.next_i64()?;
    if scope.len() % 2 != 0 {
        return Err(GlobalError::ScopeMismatch("woverlap", scope.len()));
    }
    let half = scope.len() / 2;
    // one boolean overlap indicator per position pair
    let mut indicators = Vec::with_capacity(half);
    for i in 0..half {
        let x = scope[i];
        let y = scope[half + i];
        let indicator = make_aux(wcsp, "woverlap_o", 1)?;
        let dx = wcsp.variable(x).init_size();
        let dy = wcsp.variable(y).init_size();
        let mut costs = vec![Cost::TOP; (dx * dy * 2) as usize];
        for a in 0..dx {
            for b in 0..dy {
                let overlaps = u32::from(a == b && a != 0);
                costs[(a * dy * 2 + b * 2 + overlaps) as usize] = Cost::ZERO;
            }
        }
        wcsp.post_ternary(x, y, indicator, &costs)?;
        indicators.push(indicator);
    }
    let clamp = u32::try_from(half).expect("scope too large");
    let counter = post_counter_chain(wcsp, "woverlap_c", &indicators, clamp, |_, v| v.idx32())?;
    let penalties = (0..=clamp)
        .map(|s| Ok(violation_cost(metric, cost, comparator_units(&comparator, s, rhs)?)))
        .collect::<Result<Vec<Cost>, GlobalError>>()?;
    wcsp.post_unary(counter, &penalties)?;
    Ok(())
}

/// `wdiverse` family: the Hamming distance to the reference assignment must
/// reach the requested distance
fn decompose_wdiverse(
    wcsp: &mut Wcsp,
    scope: &[Var],
    stream: &mut ParamStream,
) -> Result<(), GlobalError> {
    let distance = stream.next_u32()?;
    let mut reference = Vec::with_capacity(scope.len());
    for _ in 0..scope.len() {
        reference.push(stream.next_value()?);
    }
    let counter = post_counter_chain(wcsp, "wdiverse_c", scope, distance, |i, v| {
        u32::from(v != reference[i])
    })?;
    let mut penalties = vec![Cost::TOP; (distance + 1) as usize];
    penalties[distance as usize] = Cost::ZERO;
    wcsp.post_unary(counter, &penalties)?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use crate::{
        instances::Wcsp,
        types::{costs::Cost, Value, Var},
    };

    use super::{post_global_from_stream, template_of, GlobalError, Template};

    fn stream(tokens: &[&str]) -> Vec<String> {
        tokens.iter().map(|t| String::from(*t)).collect()
    }

    fn booleans(wcsp: &mut Wcsp, n: usize) -> Vec<Var> {
        (0..n)
            .map(|i| wcsp.make_enum_var(format!("x{i}"), 1).unwrap())
            .collect()
    }

    #[test]
    fn catalogue() {
        assert_eq!(
            template_of("walldiff"),
            Some(Template::Schema(":metric:K:cost:c"))
        );
        assert_eq!(template_of("ssame"), Some(Template::Special));
        assert_eq!(template_of("nonsense"), None);
    }

    #[test]
    fn unknown_global_rejected() {
        let mut wcsp = Wcsp::new("test");
        let scope = booleans(&mut wcsp, 2);
        assert!(matches!(
            post_global_from_stream(&mut wcsp, "wfoo", scope, vec![]),
            Err(GlobalError::UnknownGlobal(_))
        ));
    }

    #[test]
    fn knapsack_from_stream() {
        let mut wcsp = Wcsp::new("test");
        let scope = booleans(&mut wcsp, 3);
        post_global_from_stream(&mut wcsp, "knapsack", scope, stream(&["2", "1", "1", "1"]))
            .unwrap();
        assert_eq!(wcsp.num_constraints(), 1);
        // two selected variables satisfy the capacity
        let cost = wcsp.eval_constraint(0, &[Value::new(1), Value::new(1), Value::new(0)]);
        assert_eq!(cost, Cost::ZERO);
        assert!(wcsp
            .eval_constraint(0, &[Value::new(1), Value::new(0), Value::new(0)])
            .is_top());
    }

    #[test]
    fn walldiff_pairwise() {
        let mut wcsp = Wcsp::new("test");
        let scope: Vec<Var> = (0..3)
            .map(|i| wcsp.make_enum_var(format!("x{i}"), 2).unwrap())
            .collect();
        post_global_from_stream(&mut wcsp, "walldiff", scope, stream(&["var", "2"])).unwrap();
        // three pairwise binaries
        assert_eq!(wcsp.num_constraints(), 3);
        assert_eq!(
            wcsp.eval_constraint(0, &[Value::new(1), Value::new(1)]),
            Cost::new(2)
        );
        assert_eq!(
            wcsp.eval_constraint(0, &[Value::new(1), Value::new(2)]),
            Cost::ZERO
        );
    }

    #[test]
    fn wamong_counts_values() {
        let mut wcsp = Wcsp::new("test");
        let scope = booleans(&mut wcsp, 3);
        let n_user = wcsp.num_variables();
        post_global_from_stream(
            &mut wcsp,
            "wamong",
            scope,
            stream(&["var", "1", "1", "1", "1", "2"]),
        )
        .unwrap();
        // four auxiliary counters were added
        assert_eq!(wcsp.num_variables(), n_user + 4);
        // complete assignment (1,1,1) has count 3, one above max 2
        let assignment: Vec<Value> = vec![
            Value::new(1),
            Value::new(1),
            Value::new(1),
            Value::new(0),
            Value::new(1),
            Value::new(2),
            Value::new(3),
        ];
        assert_eq!(wcsp.eval_complete(&assignment), Cost::UNIT);
    }

    #[test]
    fn wregular_accepts_and_rejects() {
        let mut wcsp = Wcsp::new("test");
        let scope = booleans(&mut wcsp, 2);
        // automaton over {0,1} accepting exactly words ending in state 1,
        // reachable only by reading a 1 last
        let params = stream(&[
            "2", // states
            "1", "0", "0", // one start: state 0 cost 0
            "1", "1", "0", // one end: state 1 cost 0
            "3", // transitions
            "0", "0", "0", "0", // 0 --0--> 0
            "0", "1", "1", "0", // 0 --1--> 1
            "1", "1", "1", "0", // 1 --1--> 1
        ]);
        post_global_from_stream(&mut wcsp, "wregular", scope, params).unwrap();
        // q0 x0 q1 x1 q2: accepted word 01 via states 0,0,1
        let accepted = vec![
            Value::new(0),
            Value::new(0),
            Value::new(0),
            Value::new(1),
            Value::new(1),
        ];
        let order = |xs: &[Value]| {
            // user vars come first in eval_complete order
            vec![xs[1], xs[3], xs[0], xs[2], xs[4]]
        };
        assert_eq!(wcsp.eval_complete(&order(&accepted)), Cost::ZERO);
        // word 10 cannot end in state 1 with these transitions
        let rejected = vec![
            Value::new(0),
            Value::new(1),
            Value::new(1),
            Value::new(0),
            Value::new(1),
        ];
        assert!(wcsp.eval_complete(&order(&rejected)).is_top());
    }

    #[test]
    fn wdiverse_enforces_distance() {
        let mut wcsp = Wcsp::new("test");
        let scope = booleans(&mut wcsp, 3);
        post_global_from_stream(&mut wcsp, "wdiverse", scope, stream(&["2", "0", "0", "0"]))
            .unwrap();
        // flipping two of three variables reaches the required distance
        let mut assignment = vec![Value::new(1), Value::new(1), Value::new(0)];
        assignment.extend([Value::new(0), Value::new(1), Value::new(2), Value::new(2)]);
        assert_eq!(wcsp.eval_complete(&assignment), Cost::ZERO);
        let mut assignment = vec![Value::new(1), Value::new(0), Value::new(0)];
        assignment.extend([Value::new(0), Value::new(1), Value::new(1), Value::new(1)]);
        assert!(wcsp.eval_complete(&assignment).is_top());
    }
}
