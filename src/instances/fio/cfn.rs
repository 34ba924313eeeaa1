//! # Parsing and Writing CFN Files
//!
//! Internal module containing functions for parsing the JSON-like CFN
//! format. The format is tag-tolerant: braces `{}` and `[]` are
//! structurally interchangeable, commas and colons are separators, and the
//! tag names (`problem`, `name`, `mustbe`, `variables`, `functions`,
//! `scope`, `defaultcost`, `costs`, `type`, `params`) may be omitted
//! entirely if the positional form is followed consistently.
//!
//! The problem bound is written `<digits[.digits]` for minimisation or
//! `>digits[.digits]` for maximisation; the number of fractional digits of
//! the bound fixes the decimal precision of every cost in the file.
//!
//! ## References
//!
//! - [CFN format](https://forgemia.inra.fr/thomas.schiex/cost-function-library)

use std::io::{BufRead, Write};

use anyhow::Context;
use thiserror::Error;

use crate::{
    instances::{
        fio::TokenReader,
        globals::{self, GlobalError, Template},
        wcsp::{ArithmeticFn, BuildError, CostFnKind, Variable},
        Config, Wcsp,
    },
    types::{
        costs::{Cost, CostError},
        Tuple, Value, Var,
    },
};

/// Errors occurring within the CFN parsing module
#[derive(Error, Debug)]
pub enum Error {
    /// The file ended before the expected content
    #[error("unexpected end of file (line {0})")]
    UnexpectedEof(usize),
    /// An unexpected token was read
    #[error("expected {expected} but read '{token}' at line {line}")]
    InvalidToken {
        /// What the parser was looking for
        expected: &'static str,
        /// The offending token
        token: String,
        /// The line it was found on
        line: usize,
    },
    /// The problem bound misses its comparator
    #[error("global bound '{0}' misses the upper/lower bound comparator at line {1}")]
    MissingComparator(String, usize),
    /// A scope refers to an unknown variable
    #[error("unknown variable '{0}' at line {1}")]
    UnknownVariable(String, usize),
    /// A cost table refers to an unknown value name
    #[error("unknown value name '{0}' for variable '{1}' at line {2}")]
    UnknownValueName(String, String, usize),
    /// A variable was redeclared with a different domain
    #[error("variable '{0}' redeclared with a different domain at line {1}")]
    DomainMismatch(String, usize),
    /// The same tuple was listed twice in a cost table
    #[error("tuple redefined in the cost table of '{0}' at line {1}")]
    TupleRedefined(String, usize),
    /// A function sharing another one's table cannot carry a default cost
    #[error("function '{0}' sharing a cost table cannot have a default cost at line {1}")]
    ShareWithDefault(String, usize),
    /// A unary function over an interval variable needs a non-zero default
    #[error("unary function '{0}' over an interval variable must have a non-zero default cost at line {1}")]
    IntervalDefault(String, usize),
    /// Arithmetic functions need plain integer minimisation problems
    #[error("arithmetic function '{0}' cannot be used with decimal costs or in maximisation mode at line {1}")]
    ArithmeticMode(String, usize),
    /// A global cost function rejects negative costs
    #[error("the global cost function '{0}' cannot accept negative costs at line {1}")]
    NegativeGlobalCost(String, usize),
    /// Cost parsing failed
    #[error(transparent)]
    Cost(#[from] CostError),
    /// Network construction failed
    #[error(transparent)]
    Build(#[from] BuildError),
    /// A global cost function could not be read or expanded
    #[error(transparent)]
    Global(#[from] GlobalError),
    /// IO error while reading
    #[error(transparent)]
    Io(#[from] std::io::Error),
}

fn is_obrace(token: &str) -> bool {
    token == "{" || token == "["
}

fn is_cbrace(token: &str) -> bool {
    token == "}" || token == "]"
}

/// Tests if a token can start a decimal cost
fn is_cost(token: &str) -> bool {
    token.starts_with(|c: char| c.is_ascii_digit() || c == '-' || c == '+' || c == '.')
}

struct Parser<R> {
    tokens: TokenReader<R>,
    json: bool,
}

impl<R: BufRead> Parser<R> {
    /// The next token, transparently dropping `,` and `:` separators
    fn token(&mut self) -> Result<(usize, String), Error> {
        loop {
            let line = self.tokens.line_num();
            let (line, token) = self
                .tokens
                .next_token()?
                .ok_or(Error::UnexpectedEof(line))?;
            if token != "," && token != ":" {
                return Ok((line, token));
            }
        }
    }

    fn peek(&mut self) -> Result<Option<(usize, String)>, Error> {
        loop {
            match self.tokens.peek()? {
                Some((_, token)) if token == "," || token == ":" => {
                    self.tokens.next_token()?;
                }
                other => return Ok(other),
            }
        }
    }

    fn expect_obrace(&mut self) -> Result<(), Error> {
        let (line, token) = self.token()?;
        if is_obrace(&token) {
            Ok(())
        } else {
            Err(Error::InvalidToken {
                expected: "'{' or '['",
                token,
                line,
            })
        }
    }

    fn expect_cbrace(&mut self) -> Result<(), Error> {
        let (line, token) = self.token()?;
        if is_cbrace(&token) {
            Ok(())
        } else {
            Err(Error::InvalidToken {
                expected: "'}' or ']'",
                token,
                line,
            })
        }
    }

    /// In tag-qualified mode, consumes the given tag; a no-op in positional
    /// mode
    fn skip_tag(&mut self, tag: &'static str) -> Result<(), Error> {
        if self.json {
            let (line, token) = self.token()?;
            if token != tag {
                return Err(Error::InvalidToken {
                    expected: tag,
                    token,
                    line,
                });
            }
        }
        Ok(())
    }
}

/// Parses a CFN file into a fresh network
///
/// # Errors
///
/// Parsing errors or [`std::io::Error`].
pub fn parse<R: BufRead>(reader: R, config: &Config) -> anyhow::Result<Wcsp> {
    let mut wcsp = Wcsp::new("unnamed");
    parse_internal(reader, &mut wcsp, config).context("invalid CFN input")?;
    Ok(wcsp)
}

/// Parses a CFN file onto an existing network. Variables already present
/// must be redeclared with the same name, domain size and value names.
///
/// # Errors
///
/// Parsing errors or [`std::io::Error`].
pub fn parse_into<R: BufRead>(
    reader: R,
    wcsp: &mut Wcsp,
    config: &Config,
) -> anyhow::Result<()> {
    parse_internal(reader, wcsp, config).context("invalid CFN input")
}

fn parse_internal<R: BufRead>(
    reader: R,
    wcsp: &mut Wcsp,
    config: &Config,
) -> Result<(), Error> {
    let mut p = Parser {
        tokens: TokenReader::new(reader, true),
        json: false,
    };

    // first file brace, then detect the tag-qualified mode
    p.expect_obrace()?;
    if let Some((_, token)) = p.peek()? {
        if token == "problem" {
            p.json = true;
            p.token()?;
        }
    }
    let bound = read_header(&mut p, wcsp, config)?;
    read_variables(&mut p, wcsp)?;
    read_cost_functions(&mut p, wcsp)?;
    wcsp.enforce_file_ub(bound, config)?;
    wcsp.sort_constraints();
    Ok(())
}

/// Reads the problem header and returns the raw scaled bound; fixes the
/// precision and the optimisation direction
fn read_header<R: BufRead>(
    p: &mut Parser<R>,
    wcsp: &mut Wcsp,
    config: &Config,
) -> Result<Cost, Error> {
    p.expect_obrace()?;
    p.skip_tag("name")?;
    let (_, name) = p.token()?;
    wcsp.set_name(&name);
    p.skip_tag("mustbe")?;
    let (line, bound_token) = p.token()?;
    let comparator = bound_token.chars().next();
    let digits = &bound_token[1..];
    if comparator != Some('<') && comparator != Some('>') {
        return Err(Error::MissingComparator(bound_token.clone(), line));
    }
    let precision = match digits.split_once('.') {
        Some((_, frac)) => u32::try_from(frac.len()).expect("precision overflow"),
        None => 0,
    };
    wcsp.set_precision(precision);
    let mut multiplier = config.cost_multiplier;
    if comparator == Some('>') {
        multiplier *= -1.0;
    }
    wcsp.set_multiplier(multiplier);
    let bound = Cost::parse_decimal(digits, precision)?;
    p.expect_cbrace()?;
    Ok(bound)
}

fn read_variables<R: BufRead>(p: &mut Parser<R>, wcsp: &mut Wcsp) -> Result<(), Error> {
    p.skip_tag("variables")?;
    p.expect_obrace()?;
    let mut i = 0_usize;
    loop {
        let (line, token) = p.token()?;
        if is_cbrace(&token) {
            return Ok(());
        }
        // a nameless variable gets a generated name that cannot clash
        let (name, next) = if is_obrace(&token)
            || token.starts_with(|c: char| c.is_ascii_digit() || c == '-')
        {
            (format!("x{i}"), token)
        } else {
            let (_, next) = p.token()?;
            (token, next)
        };

        let mut value_names = vec![];
        let domain_size: i64 = if is_obrace(&next) {
            loop {
                let (line, token) = p.token()?;
                if is_cbrace(&token) {
                    break;
                }
                if token.starts_with(|c: char| c.is_ascii_digit()) {
                    return Err(Error::InvalidToken {
                        expected: "symbolic value name",
                        token,
                        line,
                    });
                }
                value_names.push(token);
            }
            i64::try_from(value_names.len()).expect("domain too large")
        } else {
            next.parse().map_err(|_| Error::InvalidToken {
                expected: "domain or domain size",
                token: next,
                line,
            })?
        };
        if domain_size == 0 {
            return Err(Error::InvalidToken {
                expected: "non-empty domain",
                token: String::from("0"),
                line,
            });
        }

        match wcsp.var(&name) {
            None => {
                #[allow(clippy::cast_possible_truncation, clippy::cast_sign_loss)]
                if domain_size >= 0 {
                    if value_names.is_empty() {
                        wcsp.make_enum_var(name, domain_size as u32 - 1)?;
                    } else {
                        wcsp.make_enum_var_named(name, value_names)?;
                    }
                } else {
                    wcsp.make_interval_var(name, (-domain_size) as u32 - 1)?;
                }
            }
            Some(var) => {
                // redeclaration must keep the exact same domain
                let known = wcsp.variable(var);
                let same = match known {
                    Variable::Enumerated { init_size, value_names: known_names, .. } => {
                        i64::from(*init_size) == domain_size
                            && (value_names.is_empty() || *known_names == value_names)
                    }
                    Variable::Interval { sup, .. } => -i64::from(sup + 1) == domain_size,
                };
                if !same {
                    return Err(Error::DomainMismatch(name, line));
                }
            }
        }
        i += 1;
    }
}

/// Resolves a value token (a name or a plain index) on a variable
fn value_idx(wcsp: &Wcsp, var: Var, token: &str, line: usize) -> Result<Value, Error> {
    if token.starts_with(|c: char| c.is_ascii_digit()) {
        let idx: u32 = token.parse().map_err(|_| Error::InvalidToken {
            expected: "value index",
            token: String::from(token),
            line,
        })?;
        if idx >= wcsp.variable(var).init_size() {
            return Err(Error::Build(BuildError::ValueOutOfRange(
                var,
                Value::new(idx),
            )));
        }
        return Ok(Value::new(idx));
    }
    wcsp.value_index(var, token).ok_or_else(|| {
        Error::UnknownValueName(
            String::from(token),
            String::from(wcsp.variable(var).name()),
            line,
        )
    })
}

fn read_scope<R: BufRead>(p: &mut Parser<R>, wcsp: &Wcsp) -> Result<Vec<Var>, Error> {
    let mut scope = vec![];
    loop {
        let (line, token) = p.token()?;
        if is_cbrace(&token) {
            return Ok(scope);
        }
        let var = if token.starts_with(|c: char| c.is_ascii_digit()) {
            let idx: usize = token.parse().map_err(|_| Error::InvalidToken {
                expected: "variable index",
                token: token.clone(),
                line,
            })?;
            if idx >= wcsp.num_variables() {
                return Err(Error::UnknownVariable(token, line));
            }
            Var::new(u32::try_from(idx).expect("variable overflow"))
        } else {
            wcsp.var(&token)
                .ok_or(Error::UnknownVariable(token, line))?
        };
        scope.push(var);
    }
}

#[allow(clippy::too_many_lines)]
fn read_cost_functions<R: BufRead>(p: &mut Parser<R>, wcsp: &mut Wcsp) -> Result<(), Error> {
    p.skip_tag("functions")?;
    p.expect_obrace()?;

    loop {
        let (line, token) = p.token()?;
        if is_cbrace(&token) {
            return Ok(());
        }
        // optional function name before the function brace
        let func_name = if is_obrace(&token) {
            None
        } else {
            p.expect_obrace()?;
            Some(token)
        };

        p.skip_tag("scope")?;
        p.expect_obrace()?;
        let scope = read_scope(p, wcsp)?;
        let func_name = func_name.unwrap_or_else(|| {
            let names: Vec<&str> = scope
                .iter()
                .map(|&v| wcsp.variable(v).name())
                .collect();
            format!("f({})", names.join(","))
        });
        let unary_interval =
            scope.len() == 1 && !wcsp.variable(scope[0]).enumerated();

        // optional default cost
        let (mut line, mut token) = p.token()?;
        let mut default_cost = None;
        if p.json {
            if token == "defaultcost" {
                let (l, t) = p.token()?;
                default_cost = Some(Cost::parse_decimal(&t, wcsp.precision()).map_err(|_| {
                    Error::InvalidToken {
                        expected: "default cost",
                        token: t,
                        line: l,
                    }
                })?);
                (line, token) = p.token()?;
            }
        } else if is_cost(&token) {
            default_cost = Some(Cost::parse_decimal(&token, wcsp.precision())?);
            (line, token) = p.token()?;
        }
        if unary_interval && default_cost.unwrap_or(Cost::ZERO) == Cost::ZERO {
            return Err(Error::IntervalDefault(func_name, line));
        }

        // discriminate between a typed block, a shared table and a table
        let mut global_type = None;
        let mut reuse = None;
        if p.json {
            if token == "type" {
                let (_, ty) = p.token()?;
                global_type = Some(ty);
                p.skip_tag("params")?;
                p.expect_obrace()?;
            } else if token == "costs" {
                let (l, t) = p.token()?;
                if is_obrace(&t) {
                    // explicit table, handled below
                } else {
                    if default_cost.is_some() {
                        return Err(Error::ShareWithDefault(func_name, l));
                    }
                    reuse = Some(t);
                }
            } else {
                return Err(Error::InvalidToken {
                    expected: "'costs', 'type' or 'defaultcost'",
                    token,
                    line,
                });
            }
        } else if !is_obrace(&token) {
            // positional: a bare token is a type name (params follow) or a
            // shared table reference (the function ends)
            let (l2, t2) = p.token()?;
            if is_obrace(&t2) {
                global_type = Some(token.clone());
            } else if is_cbrace(&t2) {
                if default_cost.is_some() {
                    return Err(Error::ShareWithDefault(func_name, l2));
                }
                reuse = Some(token);
                // the function closing brace was just consumed
                let cid = wcsp.post_shared(reuse.as_deref().expect("just set"), scope)?;
                wcsp.register_fn_name(func_name, cid);
                continue;
            } else {
                return Err(Error::InvalidToken {
                    expected: "parameters or closing brace",
                    token: t2,
                    line: l2,
                });
            }
        }

        if let Some(src) = reuse {
            let cid = wcsp.post_shared(&src, scope)?;
            wcsp.register_fn_name(func_name, cid);
            p.expect_cbrace()?;
            continue;
        }

        if let Some(ty) = global_type {
            read_global(p, wcsp, &ty, scope, line)?;
            continue;
        }

        // table cost function: the opening brace of the cost list has been
        // consumed in json mode ('costs' tag path), in positional mode the
        // current token is that brace
        if !p.json && !is_obrace(&token) {
            return Err(Error::InvalidToken {
                expected: "cost table",
                token,
                line,
            });
        }
        match scope.len() {
            0 => read_zero_ary(p, wcsp, default_cost)?,
            1 if unary_interval => {
                read_interval_unary(p, wcsp, scope[0], default_cost.expect("checked above"))?;
            }
            1..=3 => {
                let cid = read_dense_table(p, wcsp, &func_name, &scope, default_cost)?;
                wcsp.register_fn_name(func_name, cid);
            }
            _ => {
                let cid = read_nary_table(p, wcsp, &func_name, scope, default_cost)?;
                wcsp.register_fn_name(func_name, cid);
            }
        }
    }
}

/// Reads a 0-ary function: its cost raises the lower bound, a negative cost
/// goes into the shift
fn read_zero_ary<R: BufRead>(
    p: &mut Parser<R>,
    wcsp: &mut Wcsp,
    default_cost: Option<Cost>,
) -> Result<(), Error> {
    let (line, token) = p.token()?;
    let cost = if is_cbrace(&token) {
        default_cost.ok_or(Error::InvalidToken {
            expected: "cost for a 0-ary function",
            token,
            line,
        })?
    } else {
        let cost = wcsp.read_cost(&token)?;
        p.expect_cbrace()?;
        cost
    };
    if cost < Cost::ZERO {
        wcsp.add_neg_cost(-cost);
    } else {
        wcsp.increase_lb(cost)?;
    }
    p.expect_cbrace()?;
    Ok(())
}

/// Reads the list of authorized values of a unary function over an interval
/// variable
fn read_interval_unary<R: BufRead>(
    p: &mut Parser<R>,
    wcsp: &mut Wcsp,
    var: Var,
    default_cost: Cost,
) -> Result<(), Error> {
    let mut allowed = vec![];
    loop {
        let (line, token) = p.token()?;
        if is_cbrace(&token) {
            break;
        }
        allowed.push(value_idx(wcsp, var, &token, line)?);
        let (l, t) = p.token()?;
        let cost = Cost::parse_decimal(&t, wcsp.precision()).map_err(|_| Error::InvalidToken {
            expected: "zero cost",
            token: t.clone(),
            line: l,
        })?;
        if cost != Cost::ZERO {
            return Err(Error::InvalidToken {
                expected: "zero cost for an authorized interval value",
                token: t,
                line: l,
            });
        }
    }
    let penalty = wcsp.scale_cost(default_cost)?;
    wcsp.post_unary_interval(var, allowed, penalty)?;
    p.expect_cbrace()?;
    Ok(())
}

/// Reads a dense or tuple-sparse cost table for arities one to three and
/// posts it; the table minimum is shifted into the negative-cost shift
fn read_dense_table<R: BufRead>(
    p: &mut Parser<R>,
    wcsp: &mut Wcsp,
    func_name: &str,
    scope: &[Var],
    default_cost: Option<Cost>,
) -> Result<usize, Error> {
    let size: usize = scope
        .iter()
        .map(|&v| wcsp.variable(v).init_size() as usize)
        .product();
    let mut costs;
    match default_cost {
        // tuple list with a default for the unlisted ones
        Some(default) => {
            let default = wcsp.scale_cost(default)?;
            costs = vec![default; size];
            let mut seen = vec![false; size];
            'tuples: loop {
                let mut idx = 0_usize;
                for (pos, &var) in scope.iter().enumerate() {
                    let (line, token) = p.token()?;
                    if is_cbrace(&token) {
                        if pos == 0 {
                            break 'tuples;
                        }
                        return Err(Error::InvalidToken {
                            expected: "value completing the tuple",
                            token,
                            line,
                        });
                    }
                    let val = value_idx(wcsp, var, &token, line)?;
                    idx = idx * wcsp.variable(var).init_size() as usize + val.idx();
                }
                let (line, token) = p.token()?;
                let cost = wcsp.read_cost(&token)?;
                if seen[idx] {
                    return Err(Error::TupleRedefined(String::from(func_name), line));
                }
                seen[idx] = true;
                costs[idx] = cost;
            }
        }
        // full lexicographically ordered cost list
        None => {
            costs = Vec::with_capacity(size);
            for _ in 0..size {
                let (_, token) = p.token()?;
                costs.push(wcsp.read_cost(&token)?);
            }
            p.expect_cbrace()?;
        }
    }

    // make all costs non-negative and remember the shift
    let min = costs.iter().copied().min().unwrap_or(Cost::ZERO);
    if min != Cost::ZERO && !min.is_top() {
        for c in &mut costs {
            *c = c.saturating_sub(min);
        }
        wcsp.add_neg_cost(-min);
    }

    let cid = match scope.len() {
        1 => wcsp.post_unary(scope[0], &costs)?,
        2 => wcsp.post_binary(scope[0], scope[1], &costs)?,
        _ => wcsp.post_ternary(scope[0], scope[1], scope[2], &costs)?,
    };
    p.expect_cbrace()?;
    Ok(cid)
}

/// Reads an n-ary cost table (arity at least four) as a sparse tuple list or
/// a full lexicographic list
fn read_nary_table<R: BufRead>(
    p: &mut Parser<R>,
    wcsp: &mut Wcsp,
    func_name: &str,
    scope: Vec<Var>,
    default_cost: Option<Cost>,
) -> Result<usize, Error> {
    let arity = scope.len();
    let card: usize = scope
        .iter()
        .map(|&v| wcsp.variable(v).init_size() as usize)
        .product();

    let mut tuples: Vec<(Tuple, Cost)> = vec![];
    let mut min = Cost::TOP;
    match default_cost {
        Some(_) => loop {
            let mut tuple = Tuple::with_capacity(arity);
            let mut done = false;
            for (pos, &var) in scope.iter().enumerate() {
                let (line, token) = p.token()?;
                if is_cbrace(&token) {
                    if pos == 0 {
                        done = true;
                        break;
                    }
                    return Err(Error::InvalidToken {
                        expected: "value completing the tuple",
                        token,
                        line,
                    });
                }
                tuple.push(value_idx(wcsp, var, &token, line)?);
            }
            if done {
                break;
            }
            let (_, token) = p.token()?;
            let cost = wcsp.read_cost(&token)?;
            min = min.min(cost);
            tuples.push((tuple, cost));
        },
        None => {
            // full table: tuples in lexicographic order
            for idx in 0..card {
                let (_, token) = p.token()?;
                let cost = wcsp.read_cost(&token)?;
                min = min.min(cost);
                let mut tuple = Tuple::with_capacity(arity);
                let mut rest = idx;
                for &var in scope.iter().rev() {
                    let d = wcsp.variable(var).init_size() as usize;
                    tuple.push(Value::new(
                        u32::try_from(rest % d).expect("value overflow"),
                    ));
                    rest /= d;
                }
                let tuple: Tuple = tuple.iter().rev().copied().collect();
                tuples.push((tuple, cost));
            }
            p.expect_cbrace()?;
        }
    }

    let default = match default_cost {
        Some(d) => wcsp.scale_cost(d)?,
        None => Cost::ZERO,
    };
    if tuples.len() < card {
        min = min.min(default);
    }
    if min == Cost::TOP || min == Cost::ZERO {
        min = Cost::ZERO;
    } else {
        wcsp.add_neg_cost(-min);
    }

    let cid = wcsp.post_nary_begin(scope, default.saturating_sub(min), tuples.len())?;
    for (tuple, cost) in tuples {
        wcsp.post_nary_tuple(cid, tuple, cost.saturating_sub(min))
            .map_err(|err| match err {
                BuildError::DuplicateTuple(_) => {
                    Error::TupleRedefined(String::from(func_name), 0)
                }
                other => Error::Build(other),
            })?;
    }
    wcsp.post_nary_end(cid)?;
    p.expect_cbrace()?;
    Ok(cid)
}

/// Reads a global or arithmetic typed block and posts it
fn read_global<R: BufRead>(
    p: &mut Parser<R>,
    wcsp: &mut Wcsp,
    func_name: &str,
    scope: Vec<Var>,
    line: usize,
) -> Result<(), Error> {
    const ARITHMETIC: [&str; 7] = [">=", ">", "<=", "<", "=", "disj", "sdisj"];
    if ARITHMETIC.contains(&func_name) {
        if scope.len() != 2 {
            return Err(Error::InvalidToken {
                expected: "binary scope for an arithmetic function",
                token: String::from(func_name),
                line,
            });
        }
        #[allow(clippy::float_cmp)]
        if wcsp.multiplier() != 1.0 || wcsp.precision() != 0 {
            return Err(Error::ArithmeticMode(String::from(func_name), line));
        }
        let mut params = vec![];
        loop {
            let (_, token) = p.token()?;
            if is_cbrace(&token) {
                break;
            }
            params.push(token);
        }
        post_arithmetic(wcsp, func_name, &scope, &params, line)?;
        p.expect_cbrace()?;
        return Ok(());
    }

    let stream = read_global_params(p, wcsp, func_name, scope.len())?;
    globals::post_global_from_stream(wcsp, func_name, scope, stream)?;
    Ok(())
}

fn int_param(params: &[String], i: usize, line: usize) -> Result<i64, Error> {
    params
        .get(i)
        .and_then(|t| t.parse().ok())
        .ok_or(Error::InvalidToken {
            expected: "integer parameter",
            token: params.get(i).cloned().unwrap_or_default(),
            line,
        })
}

fn post_arithmetic(
    wcsp: &mut Wcsp,
    func_name: &str,
    scope: &[Var],
    params: &[String],
    line: usize,
) -> Result<(), Error> {
    let (x, y) = (scope[0], scope[1]);
    match func_name {
        ">=" | ">" | "<=" | "<" | "=" => {
            let cst = int_param(params, 0, line)?;
            let delta = Cost::new(int_param(params, 1, line)?);
            match func_name {
                ">=" => {
                    wcsp.post_sup_xyc(x, y, cst, delta)?;
                }
                ">" => {
                    wcsp.post_sup_xyc(x, y, cst + 1, delta)?;
                }
                "<=" => {
                    wcsp.post_sup_xyc(y, x, -cst, delta)?;
                }
                "<" => {
                    wcsp.post_sup_xyc(y, x, -cst + 1, delta)?;
                }
                _ => {
                    wcsp.post_sup_xyc(x, y, cst, delta)?;
                    wcsp.post_sup_xyc(y, x, -cst, delta)?;
                }
            }
        }
        "disj" => {
            let cstx = int_param(params, 0, line)?;
            let csty = int_param(params, 1, line)?;
            let penalty = wcsp.read_cost(params.get(2).map_or("", String::as_str))?;
            wcsp.post_disjunction(x, y, cstx, csty, penalty)?;
        }
        _ => {
            let cstx = int_param(params, 0, line)?;
            let csty = int_param(params, 1, line)?;
            let xinfty = Value::new(u32::try_from(int_param(params, 2, line)?).unwrap_or(0));
            let yinfty = Value::new(u32::try_from(int_param(params, 3, line)?).unwrap_or(0));
            let costx = wcsp.read_cost(params.get(4).map_or("", String::as_str))?;
            let costy = wcsp.read_cost(params.get(5).map_or("", String::as_str))?;
            wcsp.post_special_disjunction(x, y, cstx, csty, xinfty, yinfty, costx, costy)?;
        }
    }
    Ok(())
}

/// Reads the tagged parameter block of a global cost function and lowers it
/// into the canonical parameter stream, shifting signed costs so the
/// decomposition only sees non-negative ones
#[allow(clippy::too_many_lines)]
fn read_global_params<R: BufRead>(
    p: &mut Parser<R>,
    wcsp: &mut Wcsp,
    func_name: &str,
    scope_len: usize,
) -> Result<Vec<String>, Error> {
    let template = globals::template_of(func_name)
        .ok_or_else(|| GlobalError::UnknownGlobal(String::from(func_name)))?;

    let mut items: Vec<ReadItem> = vec![];

    match template {
        Template::Special => {
            read_special_params(p, wcsp, func_name, &mut items)?;
        }
        Template::Schema(schema) => {
            let mut chars = schema.chars().peekable();
            loop {
                let Some(c) = chars.next() else { break };
                match c {
                    ':' => {
                        let tag: String =
                            chars.by_ref().take_while(|&t| t != ':').collect();
                        if p.json {
                            let (l, token) = p.token()?;
                            if token != tag {
                                return Err(Error::InvalidToken {
                                    expected: "global parameter tag",
                                    token,
                                    line: l,
                                });
                            }
                        }
                    }
                    'K' => {
                        let (_, token) = p.token()?;
                        // the wdec metric widens the sgcc schema
                        if func_name == "sgcc" && token == "wdec" {
                            let mut widened = globals::SGCC_WDEC_SCHEMA.chars().peekable();
                            for _ in 0..":metric:K".len() {
                                widened.next();
                            }
                            chars = widened;
                        }
                        items.push(ReadItem::Plain(token));
                    }
                    'N' | 'v' | 'V' => {
                        let (l, token) = p.token()?;
                        items.push(ReadItem::Plain(resolve_param(wcsp, c, &token, l)?));
                    }
                    'C' | 'c' => {
                        let (l, token) = p.token()?;
                        let cost = Cost::parse_decimal(&token, wcsp.precision())?;
                        if c == 'c' && cost < Cost::ZERO {
                            return Err(Error::NegativeGlobalCost(
                                String::from(func_name),
                                l,
                            ));
                        }
                        items.push(ReadItem::SignedCost(wcsp.scale_cost(cost)?));
                    }
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
                        let marker = chars.next();
                        read_repeated(
                            p,
                            wcsp,
                            func_name,
                            &record,
                            var_repeat,
                            marker,
                            scope_len,
                            &mut items,
                        )?;
                    }
                    _ => (),
                }
            }
            // end of params, end of function
            p.expect_cbrace()?;
            p.expect_cbrace()?;
        }
    }

    // subtract the minimum signed cost from every cost and remember the
    // shift; the state unrolling of wregular multiplies it per position
    let min = items
        .iter()
        .filter_map(|item| match item {
            ReadItem::SignedCost(c) => Some(*c),
            ReadItem::Plain(_) => None,
        })
        .min()
        .unwrap_or(Cost::ZERO)
        .min(Cost::ZERO);
    if min < Cost::ZERO {
        let factor = if func_name == "wregular" {
            i64::try_from(scope_len + 2).expect("scope too large")
        } else {
            1
        };
        wcsp.add_neg_cost((-min).checked_mul(factor)?);
    }
    Ok(items
        .into_iter()
        .map(|item| match item {
            ReadItem::Plain(token) => token,
            ReadItem::SignedCost(cost) => (cost - min).raw().to_string(),
        })
        .collect())
}

/// Resolves a single template parameter token: `V` maps variable names to
/// indices, `v` and `N` check the token shape
fn resolve_param(wcsp: &Wcsp, symbol: char, token: &str, line: usize) -> Result<String, Error> {
    match symbol {
        'V' => {
            if token.starts_with(|c: char| c.is_ascii_digit()) {
                Ok(String::from(token))
            } else {
                wcsp.var(token)
                    .map(|v| v.idx().to_string())
                    .ok_or_else(|| Error::UnknownVariable(String::from(token), line))
            }
        }
        'v' => {
            if token.bytes().all(|b| b.is_ascii_digit()) {
                Ok(String::from(token))
            } else {
                Err(Error::InvalidToken {
                    expected: "value index",
                    token: String::from(token),
                    line,
                })
            }
        }
        _ => {
            if token.bytes().all(|b| b.is_ascii_digit() || b == b'-') {
                Ok(String::from(token))
            } else {
                Err(Error::InvalidToken {
                    expected: "integer",
                    token: String::from(token),
                    line,
                })
            }
        }
    }
}

/// Reads a repeated template section `[...]+` or `[...]S`, inserting record
/// counts the way the canonical stream carries them
#[allow(clippy::too_many_arguments)]
fn read_repeated<R: BufRead>(
    p: &mut Parser<R>,
    wcsp: &mut Wcsp,
    func_name: &str,
    record: &[char],
    var_repeat: bool,
    marker: Option<char>,
    scope_len: usize,
    items: &mut Vec<ReadItem>,
) -> Result<(), Error> {
    let braced_records = record.len() > 1 || var_repeat;
    p.expect_obrace()?;
    let mut records: Vec<Vec<ReadItem>> = vec![];
    loop {
        let (line, token) = p.token()?;
        if is_cbrace(&token) {
            break;
        }
        let mut rec = vec![];
        let mut first = Some((line, token));
        if braced_records {
            let (l, t) = first.take().expect("just set");
            if !is_obrace(&t) {
                return Err(Error::InvalidToken {
                    expected: "'[' opening a parameter tuple",
                    token: t,
                    line: l,
                });
            }
        }
        if var_repeat {
            // a variable-length inner tuple, read to its closing brace
            loop {
                let (l, t) = match first.take() {
                    Some(lt) => lt,
                    None => p.token()?,
                };
                if is_cbrace(&t) {
                    break;
                }
                rec.push(read_one(p, wcsp, func_name, record[0], Some((l, t)))?);
            }
            let len = rec.len().to_string();
            rec.insert(0, ReadItem::Plain(len));
        } else {
            for (i, &sym) in record.iter().enumerate() {
                let lt = if i == 0 { first.take() } else { None };
                rec.push(read_one(p, wcsp, func_name, sym, lt)?);
            }
            if braced_records {
                p.expect_cbrace()?;
            }
        }
        records.push(rec);
    }
    if marker == Some('S') && records.len() != scope_len {
        return Err(Error::InvalidToken {
            expected: "one parameter tuple per scope variable",
            token: records.len().to_string(),
            line: p.tokens.line_num(),
        });
    }
    if marker == Some('+') {
        items.push(ReadItem::Plain(records.len().to_string()));
    }
    for rec in records {
        items.extend(rec);
    }
    Ok(())
}

/// A typed parameter item: signed costs stay typed until the final min
/// shift of the whole parameter block
enum ReadItem {
    Plain(String),
    SignedCost(Cost),
}

fn read_one<R: BufRead>(
    p: &mut Parser<R>,
    wcsp: &mut Wcsp,
    func_name: &str,
    symbol: char,
    first: Option<(usize, String)>,
) -> Result<ReadItem, Error> {
    let (line, token) = match first {
        Some(lt) => lt,
        None => p.token()?,
    };
    match symbol {
        'C' | 'c' => {
            let cost = Cost::parse_decimal(&token, wcsp.precision())?;
            if symbol == 'c' && cost < Cost::ZERO {
                return Err(Error::NegativeGlobalCost(String::from(func_name), line));
            }
            Ok(ReadItem::SignedCost(wcsp.scale_cost(cost)?))
        }
        sym => Ok(ReadItem::Plain(resolve_param(wcsp, sym, &token, line)?)),
    }
}

/// Reads the irregular parameter layouts (`ssame`, `sgrammar`,
/// `sgrammardp`) into canonical items
fn read_special_params<R: BufRead>(
    p: &mut Parser<R>,
    wcsp: &mut Wcsp,
    func_name: &str,
    items: &mut Vec<ReadItem>,
) -> Result<(), Error> {
    match func_name {
        "ssame" => {
            p.skip_tag("cost")?;
            let (_, token) = p.token()?;
            let cost = wcsp.read_cost(&token)?;
            let mut lists: [Vec<String>; 2] = [vec![], vec![]];
            for (i, tag) in ["vars1", "vars2"].into_iter().enumerate() {
                p.skip_tag(tag)?;
                p.expect_obrace()?;
                loop {
                    let (line, token) = p.token()?;
                    if is_cbrace(&token) {
                        break;
                    }
                    lists[i].push(resolve_param(wcsp, 'V', &token, line)?);
                }
            }
            items.push(ReadItem::Plain(cost.raw().to_string()));
            items.push(ReadItem::Plain(lists[0].len().to_string()));
            items.push(ReadItem::Plain(lists[1].len().to_string()));
            for list in lists {
                items.extend(list.into_iter().map(ReadItem::Plain));
            }
        }
        _ => {
            // sgrammar / sgrammardp
            p.skip_tag("metric")?;
            let (line, metric) = p.token()?;
            if metric != "var" && metric != "weight" {
                return Err(Error::InvalidToken {
                    expected: "metric 'var' or 'weight'",
                    token: metric,
                    line,
                });
            }
            p.skip_tag("cost")?;
            let (_, token) = p.token()?;
            let cost = wcsp.read_cost(&token)?;
            p.skip_tag("nb_symbols")?;
            let nb_symbols = p.token()?.1;
            p.skip_tag("nb_values")?;
            let nb_values = p.token()?.1;
            p.skip_tag("start")?;
            let start = p.token()?.1;

            let weighted = metric == "weight";
            let mut rules: Vec<Vec<String>> = vec![];
            for (tag, base, fields) in [("terminals", 0_u8, 2), ("non_terminals", 1, 3)] {
                p.skip_tag(tag)?;
                p.expect_obrace()?;
                loop {
                    let (line, token) = p.token()?;
                    if is_cbrace(&token) {
                        break;
                    }
                    if !is_obrace(&token) {
                        return Err(Error::InvalidToken {
                            expected: "'[' opening a rule",
                            token,
                            line,
                        });
                    }
                    let mut rule = vec![(base + if weighted { 2 } else { 0 }).to_string()];
                    for _ in 0..fields {
                        rule.push(p.token()?.1);
                    }
                    if weighted {
                        let (_, t) = p.token()?;
                        rule.push(wcsp.read_cost(&t)?.raw().to_string());
                    }
                    p.expect_cbrace()?;
                    rules.push(rule);
                }
            }
            items.push(ReadItem::Plain(metric));
            items.push(ReadItem::Plain(cost.raw().to_string()));
            items.push(ReadItem::Plain(nb_symbols));
            items.push(ReadItem::Plain(nb_values));
            items.push(ReadItem::Plain(start));
            items.push(ReadItem::Plain(rules.len().to_string()));
            for rule in rules {
                items.extend(rule.into_iter().map(ReadItem::Plain));
            }
        }
    }
    // end of params, end of function
    p.expect_cbrace()?;
    p.expect_cbrace()?;
    Ok(())
}

/// Writes a network back in tag-qualified CFN. Round-tripping a parsed file
/// through this writer yields an equivalent network.
///
/// # Errors
///
/// [`std::io::Error`] on a failing writer.
pub fn write_cfn<W: Write>(wcsp: &Wcsp, writer: &mut W) -> std::io::Result<()> {
    let precision = wcsp.precision();
    // costs at or above the bound are forbidden either way; clamping keeps
    // the emitted file parsable
    let bound = wcsp.ub().min(Cost::new(Cost::TOP.raw() - 1));
    let clamp = |c: Cost| c.min(bound);
    writeln!(
        writer,
        "{{\"problem\": {{\"name\": \"{}\", \"mustbe\": \"<{}\"}},",
        wcsp.name(),
        bound.to_decimal(precision)
    )?;
    writeln!(writer, " \"variables\": {{")?;
    for i in 0..wcsp.num_variables() {
        let var = Var::new(u32::try_from(i).expect("variable overflow"));
        let sep = if i + 1 < wcsp.num_variables() { "," } else { "" };
        match wcsp.variable(var) {
            Variable::Enumerated {
                name,
                init_size,
                value_names,
            } => {
                if value_names.is_empty() {
                    writeln!(writer, "  \"{name}\": {init_size}{sep}")?;
                } else {
                    let names: Vec<String> =
                        value_names.iter().map(|n| format!("\"{n}\"")).collect();
                    writeln!(writer, "  \"{name}\": [{}]{sep}", names.join(", "))?;
                }
            }
            Variable::Interval { name, sup } => {
                writeln!(writer, "  \"{name}\": -{}{sep}", sup + 1)?;
            }
        }
    }
    writeln!(writer, " }},")?;
    writeln!(writer, " \"functions\": {{")?;
    let mut first = true;
    if wcsp.lb() > Cost::ZERO {
        write!(
            writer,
            "  \"f0\": {{\"scope\": [], \"costs\": [{}]}}",
            wcsp.lb().to_decimal(precision)
        )?;
        first = false;
    }
    for cid in 0..wcsp.num_constraints() {
        let constr = wcsp.constraint(cid);
        let scope_names: Vec<String> = constr
            .scope
            .iter()
            .map(|&v| format!("\"{}\"", wcsp.variable(v).name()))
            .collect();
        let costs = match &constr.kind {
            CostFnKind::Unary(costs) | CostFnKind::Binary(costs) | CostFnKind::Ternary(costs) => {
                costs
                    .iter()
                    .map(|&c| clamp(c).to_decimal(precision))
                    .collect::<Vec<_>>()
                    .join(", ")
            }
            CostFnKind::Nary { default, tuples } => {
                let mut parts = vec![];
                for (tuple, cost) in tuples {
                    let vals: Vec<String> =
                        tuple.iter().map(std::string::ToString::to_string).collect();
                    parts.push(format!(
                        "{} {}",
                        vals.join(" "),
                        clamp(*cost).to_decimal(precision)
                    ));
                }
                if !first {
                    writeln!(writer, ",")?;
                }
                first = false;
                write!(
                    writer,
                    "  \"f{cid}\": {{\"scope\": [{}], \"defaultcost\": {}, \"costs\": [{}]}}",
                    scope_names.join(", "),
                    clamp(*default).to_decimal(precision),
                    parts.join(", ")
                )?;
                continue;
            }
            CostFnKind::Arithmetic(ArithmeticFn::Sup { cst, delta }) => {
                if !first {
                    writeln!(writer, ",")?;
                }
                first = false;
                write!(
                    writer,
                    "  \"f{cid}\": {{\"scope\": [{}], \"type\": \">=\", \"params\": [{cst}, {delta}]}}",
                    scope_names.join(", ")
                )?;
                continue;
            }
            // knapsack, clique, other arithmetic forms and globals are not
            // written back; the writer covers the tabular core
            _ => continue,
        };
        if !first {
            writeln!(writer, ",")?;
        }
        first = false;
        write!(
            writer,
            "  \"f{cid}\": {{\"scope\": [{}], \"costs\": [{costs}]}}",
            scope_names.join(", ")
        )?;
    }
    writeln!(writer)?;
    writeln!(writer, " }}}}")?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use std::io::Cursor;

    use crate::{
        instances::Config,
        types::{costs::Cost, Value},
    };

    use super::{parse, write_cfn};

    #[test]
    fn tag_qualified_header() {
        let input = r#"{"problem": {"name": "tiny", "mustbe": "<10.5"},
            "variables": {"x": 2, "y": ["a", "b"]},
            "functions": {"fx": {"scope": ["x"], "costs": [0.0, 1.5]}}}"#;
        let wcsp = parse(Cursor::new(input), &Config::default()).unwrap();
        assert_eq!(wcsp.name(), "tiny");
        assert_eq!(wcsp.precision(), 1);
        assert_eq!(wcsp.num_variables(), 2);
        assert_eq!(wcsp.ub(), Cost::new(105));
        assert_eq!(wcsp.eval_constraint(0, &[Value::new(1)]), Cost::new(15));
    }

    #[test]
    fn positional_form() {
        let input = "{ { tiny <10 }\n{ x 2 y 2 }\n{ { {x y} 0 { 0 0 1 } } } }";
        let wcsp = parse(Cursor::new(input), &Config::default()).unwrap();
        assert_eq!(wcsp.num_variables(), 2);
        assert_eq!(wcsp.num_constraints(), 1);
        assert_eq!(
            wcsp.eval_constraint(0, &[Value::new(0), Value::new(0)]),
            Cost::UNIT
        );
        assert_eq!(
            wcsp.eval_constraint(0, &[Value::new(1), Value::new(0)]),
            Cost::ZERO
        );
    }

    #[test]
    fn value_names_resolved() {
        let input = r#"{"problem": {"name": "n", "mustbe": "<10"},
            "variables": {"x": ["a", "b"]},
            "functions": {"fx": {"scope": ["x"], "defaultcost": 0, "costs": ["b", 2]}}}"#;
        let wcsp = parse(Cursor::new(input), &Config::default()).unwrap();
        assert_eq!(wcsp.eval_constraint(0, &[Value::new(1)]), Cost::new(2));
        assert_eq!(wcsp.eval_constraint(0, &[Value::new(0)]), Cost::ZERO);
    }

    #[test]
    fn maximisation_flips_multiplier() {
        let input = r#"{"problem": {"name": "n", "mustbe": ">5"},
            "variables": {"x": 2},
            "functions": {"fx": {"scope": ["x"], "costs": [0, 3]}}}"#;
        let wcsp = parse(Cursor::new(input), &Config::default()).unwrap();
        // costs are negated and shifted: value one becomes the cheap one
        assert_eq!(wcsp.eval_constraint(0, &[Value::new(1)]), Cost::ZERO);
        assert_eq!(wcsp.eval_constraint(0, &[Value::new(0)]), Cost::new(3));
        assert_eq!(wcsp.neg_cost(), Cost::new(3));
        // the unreachable bound clamps to zero rather than failing the load
        assert_eq!(wcsp.ub(), Cost::ZERO);
    }

    #[test]
    fn table_sharing_by_name() {
        let input = r#"{"problem": {"name": "n", "mustbe": "<10"},
            "variables": {"x": 2, "y": 2, "z": 2},
            "functions": {
              "eq": {"scope": ["x", "y"], "costs": [0, 1, 1, 0]},
              "eq2": {"scope": ["y", "z"], "costs": "eq"}}}"#;
        let wcsp = parse(Cursor::new(input), &Config::default()).unwrap();
        assert_eq!(wcsp.num_constraints(), 2);
        assert_eq!(
            wcsp.eval_constraint(1, &[Value::new(0), Value::new(1)]),
            Cost::UNIT
        );
    }

    #[test]
    fn sharing_with_mismatched_domain_rejected() {
        let input = r#"{"problem": {"name": "n", "mustbe": "<10"},
            "variables": {"x": 2, "y": 2, "z": 3},
            "functions": {
              "eq": {"scope": ["x", "y"], "costs": [0, 1, 1, 0]},
              "eq2": {"scope": ["y", "z"], "costs": "eq"}}}"#;
        assert!(parse(Cursor::new(input), &Config::default()).is_err());
    }

    #[test]
    fn duplicate_tuple_rejected() {
        let input = r#"{"problem": {"name": "n", "mustbe": "<10"},
            "variables": {"x": 2},
            "functions": {"fx": {"scope": ["x"], "defaultcost": 0,
                                 "costs": [0, 1, 0, 2]}}}"#;
        assert!(parse(Cursor::new(input), &Config::default()).is_err());
    }

    #[test]
    fn negative_costs_shift() {
        let input = r#"{"problem": {"name": "n", "mustbe": "<10"},
            "variables": {"x": 2},
            "functions": {"fx": {"scope": ["x"], "costs": [-2, 1]}}}"#;
        let wcsp = parse(Cursor::new(input), &Config::default()).unwrap();
        assert_eq!(wcsp.neg_cost(), Cost::new(2));
        assert_eq!(wcsp.eval_constraint(0, &[Value::new(0)]), Cost::ZERO);
        assert_eq!(wcsp.eval_constraint(0, &[Value::new(1)]), Cost::new(3));
        // the effective bound absorbs the shift
        assert_eq!(wcsp.ub(), Cost::new(12));
    }

    #[test]
    fn global_function_parsed() {
        let input = r#"{"problem": {"name": "n", "mustbe": "<10"},
            "variables": {"x": 2, "y": 2, "z": 2},
            "functions": {"ad": {"scope": ["x", "y", "z"], "type": "walldiff",
                                 "params": {"metric": "var", "cost": 1}}}}"#;
        let wcsp = parse(Cursor::new(input), &Config::default()).unwrap();
        // three pairwise difference functions
        assert_eq!(wcsp.num_constraints(), 3);
    }

    #[test]
    fn zero_ary_function_raises_lb() {
        let input = r#"{"problem": {"name": "n", "mustbe": "<10"},
            "variables": {"x": 2},
            "functions": {"f0": {"scope": [], "costs": [3]}}}"#;
        let wcsp = parse(Cursor::new(input), &Config::default()).unwrap();
        assert_eq!(wcsp.lb(), Cost::new(3));
    }

    #[test]
    fn round_trip_equivalent() {
        let input = r#"{"problem": {"name": "rt", "mustbe": "<9.5"},
            "variables": {"x": 2, "y": 2},
            "functions": {
              "fx": {"scope": ["x"], "costs": [0.5, 0.0]},
              "fxy": {"scope": ["x", "y"], "costs": [0.0, 1.5, 1.5, 0.0]}}}"#;
        let first = parse(Cursor::new(input), &Config::default()).unwrap();
        let mut emitted = Vec::new();
        write_cfn(&first, &mut emitted).unwrap();
        let second = parse(Cursor::new(emitted), &Config::default()).unwrap();
        assert_eq!(first.num_variables(), second.num_variables());
        assert_eq!(first.num_constraints(), second.num_constraints());
        assert_eq!(first.ub(), second.ub());
        for a in 0..2_u32 {
            for b in 0..2_u32 {
                let assignment = [Value::new(a), Value::new(b)];
                assert_eq!(
                    first.eval_complete(&assignment),
                    second.eval_complete(&assignment)
                );
            }
        }
    }
}
