//! # Parsing QPBO Files
//!
//! Internal module containing functions for parsing quadratic pseudo-Boolean
//! optimisation files: a signed variable count (negative: domains are
//! `{1, -1}` instead of `{0, 1}`), a signed matrix-entry count (negative:
//! maximise instead of minimise), then the non-zero triangle matrix entries
//! `i j coefficient` with 1-based indices and `i <= j`. Diagonal entries are
//! linear terms, off-diagonal entries quadratic ones; the quadratic
//! coefficient multiplier symmetrises the matrix.
//!
//! Coefficients are floats scaled by `10^precision`; negative contributions
//! are shifted into the network's negative-cost shift so stored costs stay
//! non-negative.

use std::io::{BufRead, Read};

use anyhow::Context;
use log::warn;
use nom::{
    character::complete::{i64 as int64, multispace0},
    number::complete::double,
    sequence::preceded,
    IResult,
};
use thiserror::Error;

use crate::{
    instances::{wcsp::BuildError, Config, Wcsp},
    types::{costs::Cost, Var},
};

/// Errors occurring within the QPBO parsing module
#[derive(Error, Debug)]
pub enum Error {
    /// The input could not be tokenised as QPBO
    #[error("invalid QPBO input near '{0}'")]
    InvalidInput(String),
    /// A matrix entry refers to a variable beyond the declared count
    #[error("variable index {0} out of the declared range")]
    IdxOutOfRange(i64),
    /// A matrix entry has `i > j`
    #[error("matrix entry ({0}, {1}) below the diagonal")]
    BelowDiagonal(i64, i64),
    /// The requested precision cannot be represented
    #[error("precision {0} overflows the cost range for this input")]
    Resolution(u32),
    /// Network construction failed
    #[error(transparent)]
    Build(#[from] BuildError),
    /// IO error while reading
    #[error(transparent)]
    Io(#[from] std::io::Error),
}

fn int(input: &str) -> IResult<&str, i64> {
    preceded(multispace0, int64)(input)
}

fn flt(input: &str) -> IResult<&str, f64> {
    preceded(multispace0, double)(input)
}

fn invalid(input: &str) -> Error {
    Error::InvalidInput(input.chars().take(24).collect())
}

/// Parses a QPBO file into a network
///
/// # Errors
///
/// Parsing errors or [`std::io::Error`].
pub fn parse<R: BufRead>(mut reader: R, name: &str, config: &Config) -> anyhow::Result<Wcsp> {
    let mut input = String::new();
    reader.read_to_string(&mut input)?;
    parse_str(&input, name, config).context("invalid QPBO input")
}

#[allow(clippy::too_many_lines, clippy::cast_possible_truncation)]
fn parse_str(mut input: &str, name: &str, config: &Config) -> Result<Wcsp, Error> {
    let (rest, n_signed) = int(input).map_err(|_| invalid(input))?;
    input = rest;
    let booldom = n_signed >= 0;
    let n = usize::try_from(n_signed.abs()).expect("variable overflow");
    let (rest, m_signed) = int(input).map_err(|_| invalid(input))?;
    input = rest;
    let minimize = m_signed >= 0;
    let m = usize::try_from(m_signed.abs()).expect("entry overflow");

    let mut wcsp = Wcsp::new(name);
    wcsp.set_precision(config.precision);
    if n == 0 || m == 0 {
        return Ok(wcsp);
    }

    let mut entries = Vec::with_capacity(m);
    for _ in 0..m {
        let Ok((rest, i)) = int(input) else {
            warn!("EOF reached before reading all the cost sparse matrix (number of nonzero costs too large?)");
            break;
        };
        input = rest;
        let (rest, j) = int(input).map_err(|_| invalid(input))?;
        input = rest;
        let (rest, coef) = flt(input).map_err(|_| invalid(input))?;
        input = rest;
        if i < 1 || i64::try_from(n).expect("variable overflow") < i {
            return Err(Error::IdxOutOfRange(i));
        }
        if j < 1 || i64::try_from(n).expect("variable overflow") < j {
            return Err(Error::IdxOutOfRange(j));
        }
        if i > j {
            return Err(Error::BelowDiagonal(i, j));
        }
        entries.push((i as usize - 1, j as usize - 1, coef));
    }
    if !input.trim().is_empty() {
        warn!("EOF not reached after reading all the cost sparse matrix (number of nonzero costs too small?)");
    }

    for i in 0..n {
        let varname = format!("x{i}");
        if booldom {
            wcsp.make_enum_var(varname, 1)?;
        } else {
            wcsp.make_enum_var_named(varname, vec![String::from("1"), String::from("-1")])?;
        }
    }

    // scale factor for the float coefficients and overall optimisation sign
    let multiplier = 10_f64.powi(i32::try_from(config.precision).expect("precision overflow"));
    wcsp.set_multiplier(if minimize { multiplier } else { -multiplier });
    let sumcost: f64 = entries.iter().map(|&(.., c)| 2.0 * c.abs()).sum();
    if multiplier * sumcost >= Cost::TOP.raw() as f64 {
        return Err(Error::Resolution(config.precision));
    }
    let top = Cost::new((multiplier * sumcost) as i64 + 1);
    wcsp.relax_and_update_ub(top, config)?;

    let quad = config.qpbo_mult;
    let scaled = |coef: f64| Cost::new((multiplier * coef) as i64);
    let mut unary0 = vec![Cost::ZERO; n];
    let mut unary1 = vec![Cost::ZERO; n];

    for &(i, j, coef) in &entries {
        if i != j {
            // quadratic term: a binary table with the sign folded into the
            // negative-cost shift where needed
            let mut costs = [Cost::ZERO; 4];
            if booldom {
                let val = scaled(quad * coef.abs());
                if (coef > 0.0) == minimize {
                    costs[3] = val;
                } else {
                    costs[0] = val;
                    costs[1] = val;
                    costs[2] = val;
                    wcsp.add_neg_cost(val);
                }
            } else {
                let val = scaled(quad * 2.0 * coef.abs());
                if (coef > 0.0) == minimize {
                    costs[0] = val;
                    costs[3] = val;
                } else {
                    costs[1] = val;
                    costs[2] = val;
                }
                wcsp.add_neg_cost(scaled(quad * coef.abs()));
            }
            let x = Var::new(u32::try_from(i).expect("variable overflow"));
            let y = Var::new(u32::try_from(j).expect("variable overflow"));
            wcsp.post_binary(x, y, &costs)?;
        } else if booldom {
            // linear term on a {0,1} variable
            let val = scaled(coef.abs());
            if (coef > 0.0) == minimize {
                unary1[i] += val;
            } else {
                unary0[i] += val;
                wcsp.add_neg_cost(val);
            }
        } else {
            // diagonal entries on {1,-1} variables are linear terms
            let val = scaled(2.0 * coef.abs());
            if (coef > 0.0) == minimize {
                unary0[i] += val;
            } else {
                unary1[i] += val;
            }
            wcsp.add_neg_cost(scaled(coef.abs()));
        }
    }

    for i in 0..n {
        if unary0[i] > Cost::ZERO || unary1[i] > Cost::ZERO {
            let x = Var::new(u32::try_from(i).expect("variable overflow"));
            wcsp.post_unary(x, &[unary0[i], unary1[i]])?;
        }
    }
    wcsp.sort_constraints();
    Ok(wcsp)
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
    fn boolean_minimisation() {
        // minimise 2 x1 x2 + 3 x1 over {0,1}
        let input = "2\n2\n1 2 2\n1 1 3\n";
        let wcsp = parse(Cursor::new(input), "test", &Config::default()).unwrap();
        assert_eq!(wcsp.num_variables(), 2);
        assert_eq!(wcsp.neg_cost(), Cost::ZERO);
        // both zero: no cost
        assert_eq!(
            wcsp.eval_complete(&[Value::new(0), Value::new(0)]),
            Cost::ZERO
        );
        // both one: quadratic (doubled) plus linear
        assert_eq!(
            wcsp.eval_complete(&[Value::new(1), Value::new(1)]),
            Cost::new(2 * 2 + 3)
        );
    }

    #[test]
    fn below_diagonal_rejected() {
        let input = "2\n1\n2 1 1.0\n";
        assert!(parse(Cursor::new(input), "test", &Config::default()).is_err());
    }

    #[test]
    fn plus_minus_one_maximisation_shifts() {
        // the declared count -2 reads two matrix entries; the trailing
        // diagonal line is ignored with a warning
        let input = "-2\n-2\n1 1 -3\n1 2 2\n2 2 -1\n";
        let wcsp = parse(Cursor::new(input), "test", &Config::default()).unwrap();
        // maximise -3 x1 + 4 x1 x2 over {1,-1}: the diagonal shifts 3, the
        // symmetrised quadratic term 2 * qpbo_mult
        assert_eq!(wcsp.neg_cost(), Cost::new(7));
        assert_eq!(wcsp.ub(), Cost::new(11));
        // the maximising assignment (-1, -1) has internal cost zero
        assert_eq!(
            wcsp.eval_complete(&[Value::new(1), Value::new(1)]),
            Cost::ZERO
        );
        // (1, 1) pays the shifted linear term
        assert_eq!(
            wcsp.eval_complete(&[Value::new(0), Value::new(0)]),
            Cost::new(6)
        );
    }
}
