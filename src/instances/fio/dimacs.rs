//! # Parsing DIMACS WCNF and CNF Files
//!
//! Internal module containing functions for parsing DIMACS files into cost
//! function networks. The approach is to accept input instances, even if
//! they are not technically in spec, as long as the input is still
//! reasonable.
//!
//! Every clause becomes a cost function charging the clause weight on its
//! single falsifying tuple. Plain CNF uses unit weights and an upper bound
//! of `nbclauses + 1`; WCNF headers may carry a `top` weight activating
//! weighted-partial mode.
//!
//! ## References
//!
//! - [DIMACS CNF](http://www.satcompetition.org/2011/format-benchmarks2011.html)
//! - [DIMACS WCNF pre-22](https://maxsat-evaluations.github.io/2017/rules.html#input)

use std::io::BufRead;

use anyhow::Context;
use log::info;
use thiserror::Error;

use winnow::{
    ascii::{dec_int, dec_uint, space0, space1},
    combinator::{alt, opt, preceded, repeat, terminated},
    ModalResult, Parser as _,
};

use crate::{
    instances::{wcsp::BuildError, Config, Wcsp},
    types::{costs::Cost, Tuple, Value, Var},
};

/// Errors occurring within the DIMACS parsing module
#[derive(Error, Debug)]
pub enum Error {
    /// Encountered an invalid line
    #[error("invalid line {0}: '{1}'")]
    InvalidLine(usize, String),
    /// The p-line is missing or malformed
    #[error("missing or malformed p-line")]
    MissingPLine,
    /// A clause mentions a variable beyond the declared count
    #[error("literal {0} out of the declared variable range")]
    LitOutOfRange(i64),
    /// Network construction failed
    #[error(transparent)]
    Build(#[from] BuildError),
    /// IO error while reading
    #[error(transparent)]
    Io(#[from] std::io::Error),
}

/// The data of a DIMACS p-line
#[derive(Debug, PartialEq, Eq)]
struct PLine {
    weighted: bool,
    n_vars: u32,
    n_clauses: usize,
    top: Option<i64>,
}

fn p_line(input: &mut &str) -> ModalResult<PLine> {
    let _ = ("p", space1).parse_next(input)?;
    let weighted = alt(("wcnf".value(true), "cnf".value(false))).parse_next(input)?;
    let n_vars = preceded(space1, dec_uint).parse_next(input)?;
    let n_clauses = preceded(space1, dec_uint).parse_next(input)?;
    let top = if weighted {
        opt(preceded(space1, dec_int)).parse_next(input)?
    } else {
        None
    };
    space0.parse_next(input)?;
    Ok(PLine {
        weighted,
        n_vars,
        n_clauses,
        top,
    })
}

/// A clause line: an optional weight (weighted mode) and literals terminated
/// by `0`
fn clause_line(weighted: bool) -> impl FnMut(&mut &str) -> ModalResult<(i64, Vec<i64>)> {
    move |input| {
        let weight = if weighted {
            preceded(space0, dec_int).parse_next(input)?
        } else {
            1
        };
        let lits: Vec<i64> =
            repeat(0.., preceded(space0, dec_int::<_, i64, _>.verify(|&l: &i64| l != 0)))
                .parse_next(input)?;
        let _ = terminated(preceded(space0, "0"), space0).parse_next(input)?;
        Ok((weight, lits))
    }
}

/// Parses a DIMACS WCNF file into a network
///
/// # Errors
///
/// Parsing errors or [`std::io::Error`].
pub fn parse_wcnf<R: BufRead>(reader: R, name: &str, config: &Config) -> anyhow::Result<Wcsp> {
    parse_dimacs(reader, name, config, true).context("invalid WCNF input")
}

/// Parses a DIMACS CNF file into a Max-SAT network with unit clause weights
///
/// # Errors
///
/// Parsing errors or [`std::io::Error`].
pub fn parse_cnf<R: BufRead>(reader: R, name: &str, config: &Config) -> anyhow::Result<Wcsp> {
    parse_dimacs(reader, name, config, false).context("invalid CNF input")
}

fn parse_dimacs<R: BufRead>(
    mut reader: R,
    name: &str,
    config: &Config,
    weighted: bool,
) -> Result<Wcsp, Error> {
    let mut wcsp = Wcsp::new(name);
    wcsp.set_multiplier(config.cost_multiplier);
    // keep headroom below top until the header bound is known
    wcsp.update_ub(Cost::new(
        (Cost::TOP.raw() - 1) / crate::types::costs::MEDIUM_MULT / crate::types::costs::MEDIUM_MULT,
    ));

    let mut buffer = String::new();
    let mut line_num = 0_usize;
    let header = loop {
        buffer.clear();
        if reader.read_line(&mut buffer)? == 0 {
            return Err(Error::MissingPLine);
        }
        line_num += 1;
        let line = buffer.trim();
        if line.is_empty() || line.starts_with('c') {
            continue;
        }
        if line.starts_with('p') {
            break p_line
                .parse(line)
                .map_err(|_| Error::MissingPLine)?;
        }
        return Err(Error::InvalidLine(line_num, String::from(line)));
    };
    if header.weighted != weighted {
        return Err(Error::MissingPLine);
    }

    let mult = config.cost_multiplier;
    let hard_weight = match header.top {
        Some(top) if top > 0 => {
            let top = Cost::new(top).apply_multiplier(mult).unwrap_or(Cost::TOP);
            wcsp.relax_and_update_ub(top, config)?;
            info!("(weighted) partial Max-SAT input");
            header.top
        }
        _ => {
            if !weighted {
                let top = Cost::new(i64::try_from(header.n_clauses).expect("clause overflow") + 1)
                    .apply_multiplier(mult)
                    .unwrap_or(Cost::TOP);
                wcsp.relax_and_update_ub(top, config)?;
            }
            None
        }
    };

    for i in 0..header.n_vars {
        wcsp.make_enum_var(format!("x{i}"), 1)?;
    }

    let mut inc_lower_bound = Cost::ZERO;
    let mut n_clauses = 0_usize;
    let mut n_tautologies = 0_usize;
    while n_clauses + n_tautologies < header.n_clauses {
        buffer.clear();
        if reader.read_line(&mut buffer)? == 0 {
            log::warn!("EOF reached before reading all the clauses (initial number of clauses too large?)");
            break;
        }
        line_num += 1;
        let line = buffer.trim();
        if line.is_empty() || line.starts_with('c') {
            continue;
        }
        let (weight, lits) = clause_line(weighted)
            .parse(line)
            .map_err(|_| Error::InvalidLine(line_num, String::from(line)))?;

        // deduplicate literals; opposite polarities make the clause a
        // tautology
        let mut scope: Vec<Var> = vec![];
        let mut tuple = Tuple::new();
        let mut tautology = false;
        for lit in lits {
            let var_idx = u32::try_from(lit.unsigned_abs() - 1)
                .ok()
                .filter(|&i| i < header.n_vars)
                .ok_or(Error::LitOutOfRange(lit))?;
            let var = Var::new(var_idx);
            let falsifying = Value::new(u32::from(lit < 0));
            if let Some(pos) = scope.iter().position(|&v| v == var) {
                if tuple[pos] != falsifying {
                    tautology = true;
                    break;
                }
                continue;
            }
            scope.push(var);
            tuple.push(falsifying);
        }
        if tautology {
            n_tautologies += 1;
            continue;
        }
        n_clauses += 1;

        let cost = match hard_weight {
            Some(top) if weight >= top => Cost::TOP,
            _ => Cost::new(weight)
                .apply_multiplier(mult)
                .map_err(BuildError::from)?,
        };
        post_falsifying_tuple(&mut wcsp, &scope, &tuple, cost, &mut inc_lower_bound)?;
    }
    if n_tautologies > 0 {
        info!("skipped {n_tautologies} tautological clauses, {n_clauses} effective clauses");
    }

    wcsp.increase_lb(inc_lower_bound)?;
    wcsp.sort_constraints();
    Ok(wcsp)
}

/// Posts the cost of a single falsifying tuple: a dense table below arity
/// four, a sparse n-ary table above
fn post_falsifying_tuple(
    wcsp: &mut Wcsp,
    scope: &[Var],
    tuple: &Tuple,
    cost: Cost,
    inc_lower_bound: &mut Cost,
) -> Result<(), BuildError> {
    match scope.len() {
        0 => {
            *inc_lower_bound += cost;
        }
        1 => {
            let mut costs = [Cost::ZERO; 2];
            costs[tuple[0].idx()] = cost;
            wcsp.post_unary(scope[0], &costs)?;
        }
        2 => {
            let mut costs = [Cost::ZERO; 4];
            costs[tuple[0].idx() * 2 + tuple[1].idx()] = cost;
            wcsp.post_binary(scope[0], scope[1], &costs)?;
        }
        3 => {
            let mut costs = [Cost::ZERO; 8];
            costs[tuple[0].idx() * 4 + tuple[1].idx() * 2 + tuple[2].idx()] = cost;
            wcsp.post_ternary(scope[0], scope[1], scope[2], &costs)?;
        }
        _ => {
            let cid = wcsp.post_nary_begin(scope.to_vec(), Cost::ZERO, 1)?;
            wcsp.post_nary_tuple(cid, tuple.clone(), cost)?;
            wcsp.post_nary_end(cid)?;
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use std::io::Cursor;

    use winnow::Parser as _;

    use crate::{
        instances::Config,
        types::{costs::Cost, Value},
    };

    use super::{clause_line, p_line, parse_cnf, parse_wcnf, PLine};

    #[test]
    fn parse_p_line_pass() {
        assert_eq!(
            p_line.parse("p cnf 23 42"),
            Ok(PLine {
                weighted: false,
                n_vars: 23,
                n_clauses: 42,
                top: None
            })
        );
        assert_eq!(
            p_line.parse("p wcnf 3 2 10"),
            Ok(PLine {
                weighted: true,
                n_vars: 3,
                n_clauses: 2,
                top: Some(10)
            })
        );
    }

    #[test]
    fn parse_p_line_fail() {
        assert!(p_line.parse("a cnf 23 42").is_err());
        assert!(p_line.parse("p abc 23 42").is_err());
        assert!(p_line.parse("p cnf ab").is_err());
    }

    #[test]
    fn parse_clause_line_pass() {
        assert_eq!(
            clause_line(false).parse("1 -2 3 0"),
            Ok((1, vec![1, -2, 3]))
        );
        assert_eq!(clause_line(true).parse("5 -1 0"), Ok((5, vec![-1])));
    }

    #[test]
    fn parse_clause_line_fail() {
        assert!(clause_line(false).parse("1 -2 3").is_err());
        assert!(clause_line(false).parse("1 a 0").is_err());
    }

    #[test]
    fn cnf_sets_clause_bound() {
        let input = "c comment\np cnf 2 2\n1 2 0\n-1 -2 0\n";
        let wcsp = parse_cnf(Cursor::new(input), "test", &Config::default()).unwrap();
        assert_eq!(wcsp.num_variables(), 2);
        assert_eq!(wcsp.num_constraints(), 2);
        // top is nbclauses + 1
        assert_eq!(wcsp.ub(), Cost::new(3));
        // clause (x1 | x2) costs 1 when both are false
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
    fn tautological_clause_skipped() {
        let input = "p cnf 1 2\n1 -1 0\n1 0\n";
        let wcsp = parse_cnf(Cursor::new(input), "test", &Config::default()).unwrap();
        // only the unit clause is effective
        assert_eq!(wcsp.num_constraints(), 1);
        assert_eq!(wcsp.eval_constraint(0, &[Value::new(1)]), Cost::ZERO);
        assert_eq!(wcsp.eval_constraint(0, &[Value::new(0)]), Cost::UNIT);
    }

    #[test]
    fn wcnf_hard_clauses_forbidden() {
        let input = "p wcnf 2 2 10\n10 1 2 0\n3 -1 0\n";
        let wcsp = parse_wcnf(Cursor::new(input), "test", &Config::default()).unwrap();
        assert_eq!(wcsp.ub(), Cost::new(10));
        // weight equal to top makes the falsifying tuple forbidden
        assert!(wcsp
            .eval_constraint(0, &[Value::new(0), Value::new(0)])
            .is_top());
        assert_eq!(wcsp.eval_constraint(1, &[Value::new(1)]), Cost::new(3));
    }

    #[test]
    fn duplicate_literal_collapsed() {
        let input = "p cnf 1 1\n1 1 0\n";
        let wcsp = parse_cnf(Cursor::new(input), "test", &Config::default()).unwrap();
        assert_eq!(wcsp.num_constraints(), 1);
        assert_eq!(wcsp.eval_constraint(0, &[Value::new(0)]), Cost::UNIT);
    }
}
