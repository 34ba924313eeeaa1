//! # Parsing Legacy WCSP Files
//!
//! Internal module containing functions for parsing the whitespace-separated
//! legacy WCSP format. The approach is to accept input instances, even if
//! they are not technically in spec, as long as the input is still
//! reasonable.
//!
//! The format: a header line `<name> <N> <maxDomain> <C> <UB>`, a line of N
//! domain sizes (negative sizes declare interval variables), then C cost
//! function blocks. Each block carries its arity (negative: the table is
//! shared and may be reused later), the scope, a default cost and a tuple
//! count (negative: reuse shared table number `-count - 1`). A default cost
//! of `-1` introduces a typed block whose name follows: an arithmetic form,
//! a knapsack/clique, or a global cost function.

use std::io::BufRead;

use anyhow::Context;
use log::warn;
use thiserror::Error;

use crate::{
    instances::{
        fio::TokenReader,
        globals::{self, GlobalError},
        wcsp::BuildError,
        Config, Wcsp,
    },
    types::{costs::Cost, Tuple, Value, Var},
};

/// Errors occurring within the legacy WCSP parsing module
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
    /// A shared table reference points past the defined shared tables
    #[error("shared cost function number {0} not already defined (line {1})")]
    UnknownSharedIndex(usize, usize),
    /// A unary block on an interval variable carries a non-zero tuple cost
    #[error("unary cost function on an interval variable with non-zero tuple cost at line {0}")]
    IntervalUnaryCost(usize),
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

struct Parser<R> {
    tokens: TokenReader<R>,
}

impl<R: BufRead> Parser<R> {
    fn token(&mut self) -> Result<(usize, String), Error> {
        let line = self.tokens.line_num();
        self.tokens
            .next_token()?
            .ok_or(Error::UnexpectedEof(line))
    }

    fn int(&mut self, expected: &'static str) -> Result<(usize, i64), Error> {
        let (line, token) = self.token()?;
        let val = token.parse().map_err(|_| Error::InvalidToken {
            expected,
            token,
            line,
        })?;
        Ok((line, val))
    }

    fn uint(&mut self, expected: &'static str) -> Result<(usize, usize), Error> {
        let (line, val) = self.int(expected)?;
        let val = usize::try_from(val).map_err(|_| Error::InvalidToken {
            expected,
            token: val.to_string(),
            line,
        })?;
        Ok((line, val))
    }

    fn value(&mut self, wcsp: &Wcsp, var: Var) -> Result<Value, Error> {
        let (line, raw) = self.int("value index")?;
        let val = u32::try_from(raw).map_err(|_| Error::InvalidToken {
            expected: "non-negative value index",
            token: raw.to_string(),
            line,
        })?;
        if val >= wcsp.variable(var).init_size() {
            return Err(Error::Build(BuildError::ValueOutOfRange(
                var,
                Value::new(val),
            )));
        }
        Ok(Value::new(val))
    }

    fn cost(&mut self, wcsp: &Wcsp) -> Result<Cost, Error> {
        let (_, raw) = self.int("cost")?;
        Ok(wcsp.scale_cost(Cost::new(raw))?)
    }
}

/// Parses a legacy WCSP file into a network
///
/// # Errors
///
/// Parsing errors or [`std::io::Error`].
pub fn parse<R: BufRead>(reader: R, config: &Config) -> anyhow::Result<Wcsp> {
    parse_internal(reader, config).context("invalid legacy WCSP input")
}

#[allow(clippy::too_many_lines)]
fn parse_internal<R: BufRead>(reader: R, config: &Config) -> Result<Wcsp, Error> {
    let mut p = Parser {
        tokens: TokenReader::new(reader, false),
    };

    let (_, name) = p.token()?;
    let (_, nbvar) = p.uint("variable count")?;
    let (_, _maxdomain) = p.uint("maximum domain size")?;
    let (_, nbconstr) = p.uint("cost function count")?;
    let (_, top_raw) = p.int("global upper bound")?;

    let mut wcsp = Wcsp::new(name);
    wcsp.set_multiplier(config.cost_multiplier);
    let mut top = Cost::new(top_raw)
        .apply_multiplier(config.cost_multiplier)
        .unwrap_or(Cost::TOP);
    if top < Cost::ZERO {
        top = Cost::TOP;
    }
    if let Some(ext) = &config.external_ub {
        let ext = Cost::parse_decimal(ext, 0).map_err(BuildError::from)?;
        top = top.min(ext);
    }
    wcsp.relax_and_update_ub(top, config)?;

    for i in 0..nbvar {
        let (line, domsize) = p.int("domain size")?;
        let varname = format!("x{i}");
        if domsize == 0 {
            return Err(Error::InvalidToken {
                expected: "non-zero domain size",
                token: domsize.to_string(),
                line,
            });
        }
        if domsize > 0 {
            #[allow(clippy::cast_possible_truncation, clippy::cast_sign_loss)]
            wcsp.make_enum_var(varname, domsize as u32 - 1)?;
        } else {
            #[allow(clippy::cast_possible_truncation, clippy::cast_sign_loss)]
            wcsp.make_interval_var(varname, (-domsize) as u32 - 1)?;
        }
    }

    // indices of the cost functions whose tables may be reused later
    let mut shared: Vec<usize> = vec![];
    let mut inc_lower_bound = Cost::ZERO;

    for _ in 0..nbconstr {
        let (_, signed_arity) = match p.int("arity") {
            Ok(res) => res,
            Err(Error::UnexpectedEof(_)) => {
                warn!("EOF reached before reading all the cost functions (initial number of cost functions too large?)");
                break;
            }
            Err(err) => return Err(err),
        };
        let is_shared = signed_arity < 0;
        let arity = usize::try_from(signed_arity.abs()).expect("arity overflow");

        let mut scope = Vec::with_capacity(arity);
        for _ in 0..arity {
            let (line, idx) = p.uint("scope variable index")?;
            if idx >= wcsp.num_variables() {
                return Err(Error::InvalidToken {
                    expected: "declared variable index",
                    token: idx.to_string(),
                    line,
                });
            }
            scope.push(Var::new(u32::try_from(idx).expect("variable overflow")));
        }

        match arity {
            0 => {
                let (_, defval) = p.int("constant cost")?;
                let (line, ntuples) = p.uint("tuple count")?;
                if ntuples > 1 {
                    return Err(Error::InvalidToken {
                        expected: "at most one tuple for a constant block",
                        token: ntuples.to_string(),
                        line,
                    });
                }
                let raw = if ntuples == 1 {
                    p.int("constant cost")?.1
                } else {
                    defval
                };
                inc_lower_bound += wcsp.scale_cost(Cost::new(raw))?;
            }
            1 => {
                let x = scope[0];
                if wcsp.variable(x).enumerated() {
                    let (_, defval) = p.int("default cost")?;
                    if defval == -1 {
                        read_typed_block(&mut p, &mut wcsp, scope)?;
                    } else {
                        let size = wcsp.variable(x).init_size() as usize;
                        let cid =
                            read_dense_table(&mut p, &mut wcsp, &scope, defval, size, &shared)?;
                        if let Some(cid) = cid {
                            if is_shared {
                                shared.push(cid);
                            }
                        }
                    }
                } else {
                    // interval variable: list of allowed values at zero cost
                    let (line, defval) = p.int("default cost")?;
                    if defval == 0 {
                        return Err(Error::InvalidToken {
                            expected: "non-zero penalty cost",
                            token: defval.to_string(),
                            line,
                        });
                    }
                    let (_, ntuples) = p.uint("tuple count")?;
                    let mut allowed = Vec::with_capacity(ntuples);
                    for _ in 0..ntuples {
                        allowed.push(p.value(&wcsp, x)?);
                        let (line, cost) = p.int("zero tuple cost")?;
                        if cost != 0 {
                            return Err(Error::IntervalUnaryCost(line));
                        }
                    }
                    let penalty = wcsp.scale_cost(Cost::new(defval))?;
                    wcsp.post_unary_interval(x, allowed, penalty)?;
                }
            }
            2 | 3 => {
                let (_, defval) = p.int("default cost")?;
                if defval == -1 {
                    read_typed_block(&mut p, &mut wcsp, scope)?;
                } else {
                    let size: usize = scope
                        .iter()
                        .map(|&v| wcsp.variable(v).init_size() as usize)
                        .product();
                    let cid =
                        read_dense_table(&mut p, &mut wcsp, &scope, defval, size, &shared)?;
                    if let Some(cid) = cid {
                        if is_shared {
                            shared.push(cid);
                        }
                    }
                }
            }
            _ => {
                let (_, defval) = p.int("default cost")?;
                if defval == -1 {
                    read_typed_block(&mut p, &mut wcsp, scope)?;
                } else {
                    let (line, ntuples) = p.int("tuple count")?;
                    if ntuples < 0 {
                        let reused = usize::try_from(-ntuples - 1).expect("index overflow");
                        let &src = shared
                            .get(reused)
                            .ok_or(Error::UnknownSharedIndex(reused, line))?;
                        wcsp.post_shared_by_id(src, scope)?;
                    } else {
                        let default = wcsp.scale_cost(Cost::new(defval))?;
                        #[allow(clippy::cast_sign_loss)]
                        let ntuples = ntuples as usize;
                        let cid = wcsp.post_nary_begin(scope.clone(), default, ntuples)?;
                        for _ in 0..ntuples {
                            let mut tuple = Tuple::with_capacity(arity);
                            for &var in &scope {
                                tuple.push(p.value(&wcsp, var)?);
                            }
                            let cost = p.cost(&wcsp)?;
                            wcsp.post_nary_tuple(cid, tuple, cost)?;
                        }
                        wcsp.post_nary_end(cid)?;
                        if is_shared {
                            shared.push(cid);
                        }
                    }
                }
            }
        }
    }

    if p.tokens.next_token()?.is_some() {
        warn!("EOF not reached after reading all the cost functions (initial number of cost functions too small?)");
    }

    wcsp.increase_lb(inc_lower_bound)?;
    wcsp.sort_constraints();
    Ok(wcsp)
}

/// Reads a dense unary/binary/ternary block: either a reuse marker or a
/// default-filled table overwritten by the listed tuples. Returns the posted
/// constraint id, or `None` when the block reused a shared table.
fn read_dense_table<R: BufRead>(
    p: &mut Parser<R>,
    wcsp: &mut Wcsp,
    scope: &[Var],
    defval: i64,
    size: usize,
    shared: &[usize],
) -> Result<Option<usize>, Error> {
    let (line, ntuples) = p.int("tuple count")?;
    if ntuples < 0 {
        let reused = usize::try_from(-ntuples - 1).expect("index overflow");
        let &src = shared
            .get(reused)
            .ok_or(Error::UnknownSharedIndex(reused, line))?;
        wcsp.post_shared_by_id(src, scope.to_vec())?;
        return Ok(None);
    }
    let default = wcsp.scale_cost(Cost::new(defval))?;
    let mut costs = vec![default; size];
    #[allow(clippy::cast_sign_loss)]
    for _ in 0..(ntuples as usize) {
        let mut idx = 0_usize;
        for &var in scope {
            let val = p.value(wcsp, var)?;
            idx = idx * wcsp.variable(var).init_size() as usize + val.idx();
        }
        costs[idx] = p.cost(wcsp)?;
    }
    let cid = match scope.len() {
        1 => wcsp.post_unary(scope[0], &costs)?,
        2 => wcsp.post_binary(scope[0], scope[1], &costs)?,
        _ => wcsp.post_ternary(scope[0], scope[1], scope[2], &costs)?,
    };
    Ok(Some(cid))
}

/// Reads a typed block (default cost `-1`): an arithmetic form for binary
/// scopes, or a named global cost function
fn read_typed_block<R: BufRead>(
    p: &mut Parser<R>,
    wcsp: &mut Wcsp,
    scope: Vec<Var>,
) -> Result<(), Error> {
    let (line, funcname) = p.token()?;
    match funcname.as_str() {
        ">=" | ">" | "<=" | "<" | "=" => {
            let (_, cst) = p.int("offset")?;
            let (_, delta) = p.int("violation cap")?;
            let delta = Cost::new(delta);
            let (x, y) = binary_scope(&scope, &funcname, line)?;
            match funcname.as_str() {
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
            let (x, y) = binary_scope(&scope, "disj", line)?;
            let (_, cstx) = p.int("offset")?;
            let (_, csty) = p.int("offset")?;
            let penalty = p.cost(wcsp)?;
            wcsp.post_disjunction(x, y, cstx, csty, penalty)?;
        }
        "sdisj" => {
            let (x, y) = binary_scope(&scope, "sdisj", line)?;
            let (_, cstx) = p.int("offset")?;
            let (_, csty) = p.int("offset")?;
            let xinfty = p.value(wcsp, x)?;
            let yinfty = p.value(wcsp, y)?;
            let costx = p.cost(wcsp)?;
            let costy = p.cost(wcsp)?;
            wcsp.post_special_disjunction(x, y, cstx, csty, xinfty, yinfty, costx, costy)?;
        }
        _ => {
            let params = globals::read_canonical(&funcname, scope.len(), || {
                p.token()
                    .map(|(_, t)| t)
                    .map_err(|_| GlobalError::MissingParameter("global parameter"))
            })?;
            globals::post_global_from_stream(wcsp, &funcname, scope, params)?;
        }
    }
    Ok(())
}

fn binary_scope(scope: &[Var], func: &str, line: usize) -> Result<(Var, Var), Error> {
    if scope.len() == 2 {
        Ok((scope[0], scope[1]))
    } else {
        Err(Error::InvalidToken {
            expected: "binary scope for arithmetic function",
            token: String::from(func),
            line,
        })
    }
}

#[cfg(test)]
mod tests {
    use std::io::Cursor;

    use crate::{
        instances::Config,
        types::{costs::Cost, Value},
    };

    use super::parse;

    #[test]
    fn parse_header_and_unary() {
        let input = "test 2 2 1 10\n2 2\n1 0 0 1 1 3\n";
        let wcsp = parse(Cursor::new(input), &Config::default()).unwrap();
        assert_eq!(wcsp.num_variables(), 2);
        assert_eq!(wcsp.num_constraints(), 1);
        assert_eq!(wcsp.ub(), Cost::new(10));
        assert_eq!(wcsp.eval_constraint(0, &[Value::new(1)]), Cost::new(3));
        assert_eq!(wcsp.eval_constraint(0, &[Value::new(0)]), Cost::ZERO);
    }

    #[test]
    fn parse_binary_default_cost() {
        // binary block with default cost 1 and a single zero tuple
        let input = "test 2 2 1 10\n2 2\n2 0 1 1 1\n0 0 0\n";
        let wcsp = parse(Cursor::new(input), &Config::default()).unwrap();
        assert_eq!(
            wcsp.eval_constraint(0, &[Value::new(0), Value::new(0)]),
            Cost::ZERO
        );
        assert_eq!(
            wcsp.eval_constraint(0, &[Value::new(0), Value::new(1)]),
            Cost::UNIT
        );
    }

    #[test]
    fn shared_table_reuse() {
        // first block shared (negative arity), second block reuses it
        let input = "test 3 2 2 10\n2 2 2\n-2 0 1 0 2\n0 0 1\n1 1 1\n2 1 2 0 -1\n";
        let wcsp = parse(Cursor::new(input), &Config::default()).unwrap();
        assert_eq!(wcsp.num_constraints(), 2);
        assert_eq!(
            wcsp.eval_constraint(0, &[Value::new(1), Value::new(1)]),
            wcsp.eval_constraint(1, &[Value::new(1), Value::new(1)])
        );
    }

    #[test]
    fn unknown_shared_index_rejected() {
        let input = "test 2 2 1 10\n2 2\n2 0 1 0 -3\n";
        assert!(parse(Cursor::new(input), &Config::default()).is_err());
    }

    #[test]
    fn zero_ary_block_raises_lb() {
        let input = "test 1 2 2 10\n2\n0 3 0\n1 0 0 1 1 1\n";
        let wcsp = parse(Cursor::new(input), &Config::default()).unwrap();
        assert_eq!(wcsp.lb(), Cost::new(3));
    }

    #[test]
    fn interval_variable_declared_negative() {
        let input = "test 1 5 0 10\n-5\n";
        let wcsp = parse(Cursor::new(input), &Config::default()).unwrap();
        assert!(!wcsp.variable(crate::types::Var::new(0)).enumerated());
        assert_eq!(wcsp.variable(crate::types::Var::new(0)).init_size(), 5);
    }

    #[test]
    fn arithmetic_block() {
        let input = "test 2 5 1 100\n-5 -5\n2 0 1 -1 >= 1 2\n";
        let wcsp = parse(Cursor::new(input), &Config::default()).unwrap();
        assert_eq!(wcsp.num_constraints(), 1);
        // x >= y + 1: (3, 1) fine, (1, 3) violated by 3 > delta 2
        assert_eq!(
            wcsp.eval_constraint(0, &[Value::new(3), Value::new(1)]),
            Cost::ZERO
        );
        assert!(wcsp
            .eval_constraint(0, &[Value::new(1), Value::new(3)])
            .is_top());
    }

    #[test]
    fn nary_sparse_block() {
        let input = "test 4 2 1 10\n2 2 2 2\n4 0 1 2 3 0 1\n1 1 1 1 5\n";
        let wcsp = parse(Cursor::new(input), &Config::default()).unwrap();
        assert_eq!(
            wcsp.eval_constraint(0, &[Value::new(1); 4]),
            Cost::new(5)
        );
        assert_eq!(
            wcsp.eval_constraint(0, &[Value::new(0); 4]),
            Cost::ZERO
        );
    }
}
