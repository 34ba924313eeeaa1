//! # Parsing UAI and LG Files
//!
//! Internal module containing functions for parsing UAI Markov and Bayesian
//! network files. Probabilities are converted to costs via
//! `-log(p / maxp) * norm_factor`; for Markov networks the per-factor
//! `log(maxp)` normalisation is accumulated in the network's logarithmic
//! shift and added back when reporting a solution likelihood. `.LG` tables
//! carry log probabilities directly.
//!
//! ## References
//!
//! - [UAI competition format](https://uaicompetition.github.io/uci-2022/file-formats/model-format/)

use std::{io::BufRead, path::Path};

use anyhow::Context;
use itertools::Itertools;
use log::warn;
use thiserror::Error;

use crate::{
    instances::{fio::TokenReader, wcsp::BuildError, Config, Wcsp},
    solving::Contradiction,
    types::{costs::Cost, Tuple, Value, Var},
};

/// Errors occurring within the UAI parsing module
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
    /// A factor table where every probability is zero
    #[error("factor {0} has no tuple with non-zero probability")]
    EmptyFactor(usize),
    /// The requested precision cannot be represented
    #[error("precision {0} overflows the cost range for this input")]
    Resolution(u32),
    /// The evidence file makes the problem infeasible
    #[error("evidence assignment is infeasible")]
    InfeasibleEvidence(#[from] Contradiction),
    /// Network construction failed
    #[error(transparent)]
    Build(#[from] BuildError),
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
        self.tokens.next_token()?.ok_or(Error::UnexpectedEof(line))
    }

    fn uint(&mut self, expected: &'static str) -> Result<usize, Error> {
        let (line, token) = self.token()?;
        token.parse().map_err(|_| Error::InvalidToken {
            expected,
            token,
            line,
        })
    }

    fn float(&mut self, expected: &'static str) -> Result<f64, Error> {
        let (line, token) = self.token()?;
        token.parse().map_err(|_| Error::InvalidToken {
            expected,
            token,
            line,
        })
    }
}

/// The resolution driving the probability normalisation; UAI inputs need a
/// non-trivial precision to tell close likelihoods apart
fn resolution(config: &Config) -> u32 {
    if config.precision == 0 {
        7
    } else {
        config.precision
    }
}

/// Parses a UAI (`log_domain = false`) or LG (`log_domain = true`) file
///
/// # Errors
///
/// Parsing errors or [`std::io::Error`].
pub fn parse<R: BufRead>(
    reader: R,
    name: &str,
    log_domain: bool,
    config: &Config,
) -> anyhow::Result<Wcsp> {
    let mut wcsp =
        parse_internal(reader, name, log_domain, config).context("invalid UAI input")?;
    if let Some(path) = &config.evidence {
        apply_evidence_path(&mut wcsp, path).context("invalid UAI evidence")?;
    }
    Ok(wcsp)
}

#[allow(clippy::too_many_lines, clippy::cast_possible_truncation)]
fn parse_internal<R: BufRead>(
    reader: R,
    name: &str,
    log_domain: bool,
    config: &Config,
) -> Result<Wcsp, Error> {
    let mut p = Parser {
        tokens: TokenReader::new(reader, false),
    };

    let (line, uaitype) = p.token()?;
    let markov = match uaitype.as_str() {
        "MARKOV" => true,
        "BAYES" => false,
        _ => {
            return Err(Error::InvalidToken {
                expected: "MARKOV or BAYES preamble",
                token: uaitype,
                line,
            })
        }
    };

    let res = resolution(config);
    // captures a probability difference of (1 - 10^-res) as one cost unit
    let norm_factor = config
        .norm_factor
        .unwrap_or_else(|| -1.0 / f64::ln_1p(-(10.0_f64.powi(-i32::try_from(res).expect("precision overflow")))));
    if !norm_factor.is_finite() || norm_factor * f64::from(res) >= Cost::TOP.raw() as f64 {
        return Err(Error::Resolution(res));
    }

    let mut wcsp = Wcsp::new(name);
    wcsp.set_precision(res);

    let nbvar = p.uint("variable count")?;
    for i in 0..nbvar {
        let d = p.uint("domain size")?;
        if d == 0 {
            return Err(Error::InvalidToken {
                expected: "positive domain size",
                token: String::from("0"),
                line: p.tokens.line_num(),
            });
        }
        wcsp.make_enum_var(format!("x{i}"), u32::try_from(d - 1).expect("domain too large"))?;
    }

    let nbfactors = p.uint("factor count")?;
    let mut scopes = Vec::with_capacity(nbfactors);
    for _ in 0..nbfactors {
        let arity = p.uint("factor arity")?;
        let mut scope = Vec::with_capacity(arity);
        for _ in 0..arity {
            let idx = p.uint("factor scope variable")?;
            if idx >= nbvar {
                return Err(Error::InvalidToken {
                    expected: "declared variable index",
                    token: idx.to_string(),
                    line: p.tokens.line_num(),
                });
            }
            scope.push(Var::new(u32::try_from(idx).expect("variable overflow")));
        }
        scopes.push(scope);
    }

    // convert every factor table, tracking the worst finite cost to derive
    // the upper bound before posting
    let mut tables = Vec::with_capacity(nbfactors);
    let mut upperbound = Cost::UNIT;
    let mut inc_lower_bound = Cost::ZERO;
    for (ictr, scope) in scopes.iter().enumerate() {
        let ntuples = match p.uint("factor table size") {
            Ok(n) => n,
            Err(Error::UnexpectedEof(_)) => {
                warn!("EOF reached before reading all the factor tables (initial number of factors too large?)");
                break;
            }
            Err(err) => return Err(err),
        };
        let expected: usize = scope
            .iter()
            .map(|&v| wcsp.variable(v).init_size() as usize)
            .product();
        if ntuples != expected {
            return Err(Error::InvalidToken {
                expected: "factor table matching the scope domains",
                token: ntuples.to_string(),
                line: p.tokens.line_num(),
            });
        }
        let mut probs = Vec::with_capacity(ntuples);
        for _ in 0..ntuples {
            probs.push(p.float("probability")?);
        }
        let maxp = probs.iter().copied().fold(f64::NEG_INFINITY, f64::max);
        if (!log_domain && maxp <= 0.0) || (log_domain && maxp < -1e38) {
            return Err(Error::EmptyFactor(ictr));
        }

        let mut costs: Vec<Cost> = probs
            .iter()
            .map(|&prob| {
                let logratio = if log_domain {
                    if markov {
                        prob - maxp
                    } else {
                        prob
                    }
                } else if prob <= 0.0 {
                    return Cost::TOP;
                } else if markov {
                    (prob / maxp).ln()
                } else {
                    prob.ln()
                };
                let cost = (-logratio * norm_factor).round();
                if cost >= Cost::TOP.raw() as f64 {
                    Cost::TOP
                } else {
                    Cost::new(cost as i64)
                }
            })
            .collect();
        // project the table minimum into the lower bound
        let minc = costs.iter().copied().min().unwrap_or(Cost::ZERO);
        if minc > Cost::ZERO && !minc.is_top() {
            for c in &mut costs {
                *c = c.saturating_sub(minc);
            }
            inc_lower_bound += minc;
        }
        let maxc = costs
            .iter()
            .copied()
            .filter(|c| !c.is_top())
            .max()
            .unwrap_or(Cost::ZERO);
        upperbound += maxc;

        if markov {
            wcsp.add_log_shift(if log_domain { maxp } else { maxp.ln() });
        }
        tables.push(costs);
    }
    if p.tokens.next_token()?.is_some() {
        warn!("EOF not reached after reading all the factor tables (initial number of factors too small?)");
    }

    wcsp.relax_and_update_ub(upperbound + inc_lower_bound, config)?;

    for (scope, mut costs) in scopes.into_iter().zip(tables) {
        for c in &mut costs {
            // keep locally prohibitive entries distinguishable from top
            if c.cuts(wcsp.ub()) && !c.is_top() {
                *c = wcsp.ub().checked_mul(crate::types::costs::MEDIUM_MULT).unwrap_or(Cost::TOP);
            }
        }
        match scope.len() {
            0 => inc_lower_bound += costs[0],
            1 => {
                wcsp.post_unary(scope[0], &costs)?;
            }
            2 => {
                wcsp.post_binary(scope[0], scope[1], &costs)?;
            }
            3 => {
                wcsp.post_ternary(scope[0], scope[1], scope[2], &costs)?;
            }
            _ => {
                let cid = wcsp.post_nary_begin(scope.clone(), Cost::ZERO, costs.len())?;
                let ranges = scope
                    .iter()
                    .map(|&v| 0..wcsp.variable(v).init_size())
                    .collect_vec();
                for (k, vals) in ranges.into_iter().multi_cartesian_product().enumerate() {
                    let tuple: Tuple = vals.into_iter().map(Value::new).collect();
                    wcsp.post_nary_tuple(cid, tuple, costs[k])?;
                }
                wcsp.post_nary_end(cid)?;
            }
        }
    }

    wcsp.increase_lb(inc_lower_bound)?;
    wcsp.sort_constraints();
    Ok(wcsp)
}

/// Applies a UAI evidence file: a count followed by (variable, value) pairs
/// assigned before search
fn apply_evidence_path(wcsp: &mut Wcsp, path: &Path) -> Result<(), Error> {
    let reader = std::io::BufReader::new(super::open_compressed_uncompressed_read(path)?);
    apply_evidence(wcsp, reader)
}

fn apply_evidence<R: BufRead>(wcsp: &mut Wcsp, reader: R) -> Result<(), Error> {
    let mut p = Parser {
        tokens: TokenReader::new(reader, false),
    };
    let count = p.uint("evidence count")?;
    for _ in 0..count {
        let var = p.uint("evidence variable")?;
        let val = p.uint("evidence value")?;
        let var = Var::new(u32::try_from(var).expect("variable overflow"));
        wcsp.assign_var(var, Value::new(u32::try_from(val).expect("value overflow")))?;
    }
    wcsp.propagate()?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use std::io::Cursor;

    use crate::{
        instances::Config,
        types::{costs::Cost, Value},
    };

    use super::{apply_evidence, parse};

    fn grid2() -> &'static str {
        // two Boolean variables, one unary factor and one binary factor
        "MARKOV\n2\n2 2\n2\n1 0\n2 0 1\n\n2\n 0.4 0.6\n\n4\n 0.9 0.1 0.1 0.9\n"
    }

    #[test]
    fn markov_preamble_and_factors() {
        let wcsp = parse(Cursor::new(grid2()), "grid", false, &Config::default()).unwrap();
        assert_eq!(wcsp.num_variables(), 2);
        assert_eq!(wcsp.num_constraints(), 2);
        // the most likely tuple of each factor costs zero
        assert_eq!(wcsp.eval_constraint(0, &[Value::new(1)]), Cost::ZERO);
        assert_eq!(
            wcsp.eval_constraint(1, &[Value::new(0), Value::new(0)]),
            Cost::ZERO
        );
        // the shift records both factor maxima
        let expected = 0.6_f64.ln() + 0.9_f64.ln();
        assert!((wcsp.log_shift() - expected).abs() < 1e-9);
        // less likely tuples cost more
        assert!(
            wcsp.eval_constraint(1, &[Value::new(0), Value::new(1)])
                > wcsp.eval_constraint(1, &[Value::new(0), Value::new(0)])
        );
    }

    #[test]
    fn zero_probability_is_forbidden() {
        let input = "MARKOV\n1\n2\n1\n1 0\n\n2\n0.0 1.0\n";
        let wcsp = parse(Cursor::new(input), "test", false, &Config::default()).unwrap();
        assert!(wcsp.eval_constraint(0, &[Value::new(0)]).is_top());
        assert_eq!(wcsp.eval_constraint(0, &[Value::new(1)]), Cost::ZERO);
    }

    #[test]
    fn all_zero_factor_rejected() {
        let input = "MARKOV\n1\n2\n1\n1 0\n\n2\n0.0 0.0\n";
        assert!(parse(Cursor::new(input), "test", false, &Config::default()).is_err());
    }

    #[test]
    fn log_domain_tables() {
        // .LG tables carry log probabilities; maxima shift to cost zero
        let input = "MARKOV\n1\n2\n1\n1 0\n\n2\n-1.0 0.0\n";
        let wcsp = parse(Cursor::new(input), "test", true, &Config::default()).unwrap();
        assert_eq!(wcsp.eval_constraint(0, &[Value::new(1)]), Cost::ZERO);
        assert!(wcsp.eval_constraint(0, &[Value::new(0)]) > Cost::ZERO);
    }

    #[test]
    fn evidence_assigns_variables() {
        let mut wcsp = parse(Cursor::new(grid2()), "grid", false, &Config::default()).unwrap();
        apply_evidence(&mut wcsp, Cursor::new("1\n0 1\n")).unwrap();
        assert_eq!(
            wcsp.value_of(crate::types::Var::new(0)),
            Some(Value::new(1))
        );
    }
}
