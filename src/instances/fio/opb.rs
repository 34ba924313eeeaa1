//! # Parsing OPB Files
//!
//! Internal module containing functions for parsing linear pseudo-Boolean
//! OPB files. The approach is to accept input instances, even if they are
//! not technically in spec, as long as the input is still reasonable.
//!
//! The objective (`min:`/`max:`) becomes unary/binary/ternary/n-ary cost
//! functions whose only non-default tuple is all-ones; linear constraints
//! become knapsack constraints, with `=` encoded as two knapsacks of
//! opposite sign. Variables are Boolean and defined implicitly on first use.
//!
//! ## References
//!
//! - [OPB](https://www.cril.univ-artois.fr/PB12/format.pdf)

use std::io::{BufRead, Read};

use anyhow::Context;
use nom::{
    branch::alt,
    bytes::complete::{tag, take_while, take_while1},
    character::complete::{char as nom_char, i64 as int64, multispace0},
    combinator::{map, opt, recognize, verify},
    multi::many1,
    sequence::{pair, preceded, terminated, tuple},
    IResult,
};
use thiserror::Error;

use crate::{
    instances::{
        wcsp::{BuildError, KnapsackParams},
        Config, Wcsp,
    },
    types::{
        costs::{Cost, CostError},
        Tuple as VTuple, Value, Var,
    },
};

/// Errors occurring within the OPB parsing module
#[derive(Error, Debug)]
pub enum Error {
    /// The input could not be parsed as OPB
    #[error("invalid OPB input near '{0}'")]
    InvalidInput(String),
    /// The requested precision cannot be represented
    #[error("precision {0} overflows the cost range for this input")]
    Resolution(u32),
    /// Cost arithmetic failed
    #[error(transparent)]
    Cost(#[from] CostError),
    /// Network construction failed
    #[error(transparent)]
    Build(#[from] BuildError),
    /// IO error while reading
    #[error(transparent)]
    Io(#[from] std::io::Error),
}

/// A product term of the objective: a scaled coefficient and the multiplied
/// variables
#[derive(Debug, PartialEq)]
struct ObjTerm {
    coef: Cost,
    vars: Vec<String>,
}

/// A linear constraint: terms, a relational operator and a right-hand side
#[derive(Debug, PartialEq)]
struct Constr {
    terms: Vec<(i64, String)>,
    op: OpbOperator,
    rhs: i64,
}

/// Possible relational operators
#[derive(Debug, PartialEq, Eq, Clone, Copy)]
enum OpbOperator {
    /// `<=`
    LE,
    /// `>=`
    GE,
    /// `=`
    EQ,
}

fn ws<'inp, O>(
    inner: impl FnMut(&'inp str) -> IResult<&'inp str, O>,
) -> impl FnMut(&'inp str) -> IResult<&'inp str, O> {
    preceded(multispace0, inner)
}

/// An OPB variable name: a letter or underscore followed by name characters
fn variable(input: &str) -> IResult<&str, &str> {
    ws(recognize(pair(
        verify(take_while1(is_name_char), |s: &str| {
            !s.starts_with(|c: char| c.is_ascii_digit())
        }),
        take_while(is_name_char),
    )))(input)
}

fn is_name_char(c: char) -> bool {
    c.is_ascii_alphanumeric() || c == '_' || c == '[' || c == ']'
}

/// A decimal objective coefficient with optional sign
fn decimal_token(input: &str) -> IResult<&str, &str> {
    ws(recognize(tuple((
        opt(alt((nom_char('+'), nom_char('-')))),
        take_while1(|c: char| c.is_ascii_digit()),
        opt(pair(nom_char('.'), take_while(|c: char| c.is_ascii_digit()))),
    ))))(input)
}

fn operator(input: &str) -> IResult<&str, OpbOperator> {
    ws(alt((
        map(tag("<="), |_| OpbOperator::LE),
        map(tag(">="), |_| OpbOperator::GE),
        map(tag("="), |_| OpbOperator::EQ),
    )))(input)
}

/// One objective product term: an optional coefficient and the multiplied
/// variables (a bare coefficient is a constant term)
fn obj_term<'inp>(
    precision: u32,
) -> impl FnMut(&'inp str) -> IResult<&'inp str, (Option<Cost>, Vec<String>)> {
    move |input| {
        let (input, coef) = opt(nom::combinator::map_res(decimal_token, |tok| {
            Cost::parse_decimal(tok, precision)
        }))(input)?;
        let (input, vars) = if coef.is_some() {
            nom::multi::many0(map(variable, String::from))(input)?
        } else {
            many1(map(variable, String::from))(input)?
        };
        Ok((input, (coef, vars)))
    }
}

fn constr_term(input: &str) -> IResult<&str, (i64, String)> {
    let (input, coef) = opt(ws(int64))(input)?;
    let (input, name) = map(variable, String::from)(input)?;
    Ok((input, (coef.unwrap_or(1), name)))
}

fn semicolon(input: &str) -> IResult<&str, char> {
    ws(nom_char(';'))(input)
}

/// Strips `*` comment lines
fn strip_comments(input: &str) -> String {
    input
        .lines()
        .filter(|line| !line.trim_start().starts_with('*'))
        .collect::<Vec<_>>()
        .join("\n")
}

/// Parses an OPB file into a network
///
/// # Errors
///
/// Parsing errors or [`std::io::Error`].
pub fn parse<R: BufRead>(mut reader: R, name: &str, config: &Config) -> anyhow::Result<Wcsp> {
    let mut input = String::new();
    reader.read_to_string(&mut input)?;
    parse_str(&input, name, config).context("invalid OPB input")
}

fn invalid(input: &str) -> Error {
    Error::InvalidInput(input.trim_start().chars().take(24).collect())
}

#[allow(clippy::cast_possible_truncation)]
fn parse_str(raw: &str, name: &str, config: &Config) -> Result<Wcsp, Error> {
    let stripped = strip_comments(raw);
    let mut input = stripped.as_str();

    let mut wcsp = Wcsp::new(name);
    wcsp.set_precision(config.precision);
    // keep headroom below top until the whole objective is known
    wcsp.update_ub(Cost::new(
        (Cost::TOP.raw() - 1) / crate::types::costs::MEDIUM_MULT / crate::types::costs::MEDIUM_MULT,
    ));
    let scale = 10_f64.powi(i32::try_from(config.precision).expect("precision overflow"));

    let mut inc_lower_bound = Cost::ZERO;
    let (rest, direction) = opt(ws(alt((
        map(tag("min:"), |_| 1.0),
        map(tag("max:"), |_| -1.0),
    ))))(input)
    .map_err(|_: nom::Err<nom::error::Error<&str>>| invalid(input))?;
    input = rest;

    match direction {
        Some(sign) => {
            wcsp.set_multiplier(sign * scale);
            // read the objective terms up to the closing semicolon
            loop {
                if let Ok((rest, _)) = semicolon(input) {
                    input = rest;
                    break;
                }
                let (rest, (coef, vars)) =
                    obj_term(config.precision)(input).map_err(|_| invalid(input))?;
                input = rest;
                let coef = coef.unwrap_or(Cost::new(
                    10_i64.pow(config.precision),
                ));
                check_headroom(coef)?;
                let coef = if sign < 0.0 { -coef } else { coef };
                post_objective_term(&mut wcsp, coef, &vars, &mut inc_lower_bound)?;
            }
        }
        None => {
            // pure satisfaction problem
            wcsp.set_multiplier(scale);
            wcsp.update_ub(Cost::new(scale as i64));
        }
    }

    // linear constraints
    loop {
        if multispace0::<_, nom::error::Error<&str>>(input)
            .map(|(rest, _)| rest.is_empty())
            .unwrap_or(true)
        {
            break;
        }
        let (rest, constr) = linear_constraint(input).map_err(|_| invalid(input))?;
        input = rest;
        post_linear_constraint(&mut wcsp, constr)?;
    }

    if inc_lower_bound < Cost::ZERO {
        wcsp.add_neg_cost(-inc_lower_bound);
    } else {
        wcsp.increase_lb(inc_lower_bound)?;
    }
    wcsp.sort_constraints();
    Ok(wcsp)
}

fn linear_constraint(input: &str) -> IResult<&str, Constr> {
    let (input, terms) = nom::multi::many0(constr_term)(input)?;
    let (input, op) = operator(input)?;
    let (input, rhs) = ws(int64)(input)?;
    let (input, _) = terminated(multispace0, nom_char(';'))(input)?;
    Ok((input, Constr { terms, op, rhs }))
}

/// Rejects objective coefficients that would leave no headroom for the
/// medium-cost rule
fn check_headroom(coef: Cost) -> Result<(), Error> {
    let medium = crate::types::costs::MEDIUM_MULT;
    let limit = (Cost::TOP.raw() - 1) / medium / medium / medium / medium;
    if coef.raw().abs() >= limit {
        return Err(Error::Resolution(0));
    }
    Ok(())
}

fn var_of(wcsp: &mut Wcsp, name: &str) -> Result<Var, BuildError> {
    match wcsp.var(name) {
        Some(var) => Ok(var),
        None => wcsp.make_enum_var_named(name, vec![String::from("v0"), String::from("v1")]),
    }
}

/// Posts one objective product term: the scaled coefficient on the all-ones
/// tuple, shifted into the negative-cost shift when negative
fn post_objective_term(
    wcsp: &mut Wcsp,
    coef: Cost,
    var_names: &[String],
    inc_lower_bound: &mut Cost,
) -> Result<(), BuildError> {
    let mut scope: Vec<Var> = vec![];
    for name in var_names {
        let var = var_of(wcsp, name)?;
        if !scope.contains(&var) {
            scope.push(var);
        }
    }
    let negative = coef < Cost::ZERO;
    let default = if negative { -coef } else { Cost::ZERO };
    let ones = if negative { Cost::ZERO } else { coef };
    match scope.len() {
        0 => {
            *inc_lower_bound += coef;
            return Ok(());
        }
        1 => {
            wcsp.post_unary(scope[0], &[default, ones])?;
        }
        2 => {
            let mut costs = [default; 4];
            costs[3] = ones;
            wcsp.post_binary(scope[0], scope[1], &costs)?;
        }
        3 => {
            let mut costs = [default; 8];
            costs[7] = ones;
            wcsp.post_ternary(scope[0], scope[1], scope[2], &costs)?;
        }
        _ => {
            let arity = scope.len();
            let cid = wcsp.post_nary_begin(scope, default, 1)?;
            let tuple: VTuple = (0..arity).map(|_| Value::new(1)).collect();
            wcsp.post_nary_tuple(cid, tuple, ones)?;
            wcsp.post_nary_end(cid)?;
        }
    }
    if negative {
        wcsp.add_neg_cost(-coef);
    }
    Ok(())
}

/// Posts a linear constraint as one or two knapsacks (`=` splits into `>=`
/// and `<=`)
fn post_linear_constraint(wcsp: &mut Wcsp, constr: Constr) -> Result<(), BuildError> {
    let mut scope: Vec<Var> = vec![];
    let mut coefs: Vec<i64> = vec![];
    for (coef, name) in constr.terms {
        let var = var_of(wcsp, &name)?;
        if let Some(pos) = scope.iter().position(|&v| v == var) {
            coefs[pos] += coef;
        } else {
            scope.push(var);
            coefs.push(coef);
        }
    }
    if matches!(constr.op, OpbOperator::GE | OpbOperator::EQ) {
        let terms = coefs
            .iter()
            .enumerate()
            .map(|(pos, &c)| (pos, Value::new(1), c))
            .collect();
        wcsp.post_knapsack(
            scope.clone(),
            KnapsackParams {
                capacity: constr.rhs,
                terms,
            },
        )?;
    }
    if matches!(constr.op, OpbOperator::LE | OpbOperator::EQ) {
        let terms = coefs
            .iter()
            .enumerate()
            .map(|(pos, &c)| (pos, Value::new(1), -c))
            .collect();
        wcsp.post_knapsack(
            scope,
            KnapsackParams {
                capacity: -constr.rhs,
                terms,
            },
        )?;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use std::io::Cursor;

    use crate::{
        instances::Config,
        types::{costs::Cost, Value},
    };

    use super::{operator, parse, variable, OpbOperator};

    #[test]
    fn parse_variable_pass() {
        assert_eq!(variable(" x1 rest"), Ok((" rest", "x1")));
        assert_eq!(variable("y_2;"), Ok((";", "y_2")));
        assert!(variable("2x").is_err());
    }

    #[test]
    fn parse_operator_pass() {
        assert_eq!(operator(" >= 2"), Ok((" 2", OpbOperator::GE)));
        assert_eq!(operator("<= 2"), Ok((" 2", OpbOperator::LE)));
        assert_eq!(operator("= 2"), Ok((" 2", OpbOperator::EQ)));
    }

    #[test]
    fn objective_terms_posted() {
        let input = "* comment\nmin: 2 x1 +3 x2 ;\n";
        let wcsp = parse(Cursor::new(input), "test", &Config::default()).unwrap();
        assert_eq!(wcsp.num_variables(), 2);
        assert_eq!(wcsp.num_constraints(), 2);
        assert_eq!(wcsp.eval_constraint(0, &[Value::new(1)]), Cost::new(2));
        assert_eq!(wcsp.eval_constraint(1, &[Value::new(1)]), Cost::new(3));
        assert_eq!(wcsp.eval_constraint(0, &[Value::new(0)]), Cost::ZERO);
    }

    #[test]
    fn negative_objective_coefficient_shifts() {
        let input = "min: -2 x1 ;\n";
        let wcsp = parse(Cursor::new(input), "test", &Config::default()).unwrap();
        assert_eq!(wcsp.neg_cost(), Cost::new(2));
        // value one is now free, value zero pays the shift
        assert_eq!(wcsp.eval_constraint(0, &[Value::new(0)]), Cost::new(2));
        assert_eq!(wcsp.eval_constraint(0, &[Value::new(1)]), Cost::ZERO);
    }

    #[test]
    fn nonlinear_objective_term() {
        let input = "min: 4 x1 x2 x3 ;\n";
        let wcsp = parse(Cursor::new(input), "test", &Config::default()).unwrap();
        assert_eq!(wcsp.num_variables(), 3);
        assert_eq!(wcsp.num_constraints(), 1);
        assert_eq!(
            wcsp.eval_constraint(0, &[Value::new(1); 3]),
            Cost::new(4)
        );
        assert_eq!(
            wcsp.eval_constraint(0, &[Value::new(1), Value::new(1), Value::new(0)]),
            Cost::ZERO
        );
    }

    #[test]
    fn equality_becomes_two_knapsacks() {
        let input = "min: x1 ;\nx1 + x2 = 1 ;\n";
        let wcsp = parse(Cursor::new(input), "test", &Config::default()).unwrap();
        // one objective unary plus two knapsacks
        assert_eq!(wcsp.num_constraints(), 3);
        // exactly-one satisfied
        assert_eq!(
            wcsp.eval_constraint(1, &[Value::new(1), Value::new(0)]),
            Cost::ZERO
        );
        assert_eq!(
            wcsp.eval_constraint(2, &[Value::new(1), Value::new(0)]),
            Cost::ZERO
        );
        // both ones violate the <= half
        assert!(wcsp
            .eval_constraint(2, &[Value::new(1), Value::new(1)])
            .is_top());
    }

    #[test]
    fn maximisation_flips_sign() {
        let input = "max: 2 x1 ;\n";
        let wcsp = parse(Cursor::new(input), "test", &Config::default()).unwrap();
        // maximising 2 x1 charges value zero after the shift
        assert_eq!(wcsp.neg_cost(), Cost::new(2));
        assert_eq!(wcsp.eval_constraint(0, &[Value::new(0)]), Cost::new(2));
        assert_eq!(wcsp.eval_constraint(0, &[Value::new(1)]), Cost::ZERO);
    }

    #[test]
    fn satisfaction_without_objective() {
        let input = "x1 + x2 >= 1 ;\n";
        let wcsp = parse(Cursor::new(input), "test", &Config::default()).unwrap();
        assert_eq!(wcsp.num_constraints(), 1);
        assert_eq!(wcsp.ub(), Cost::UNIT);
    }
}
