//! # Cost Function Network Representations
//!
//! The [`Wcsp`] type owns the variables, cost functions and bounds of a
//! weighted constraint satisfaction problem. Networks are either built
//! programmatically through the posting API or loaded from one of the
//! supported file formats through [`fio`].

use std::path::PathBuf;

pub mod fio;
pub mod globals;

mod wcsp;
pub use wcsp::{
    ArithmeticFn, BuildError, CliqueParams, CostFnKind, CostFunction, KnapsackParams, Variable,
    Wcsp,
};

/// Loader configuration. Everything external that affects how a file is
/// turned into a network: the cost precision, the optimisation direction,
/// externally supplied bounds and the bound relaxation.
///
/// A default `Config` loads the file as written: precision as declared by
/// the format, minimisation, no external bound, no relaxation.
#[derive(Debug, Clone, PartialEq)]
pub struct Config {
    /// Number of fractional digits for decimal costs in formats that do not
    /// declare one themselves (UAI, OPB objectives with the relevant
    /// options); CFN derives it from the `mustbe` bound instead
    pub precision: u32,
    /// Global cost multiplier; `-1.0` flips minimisation and maximisation
    pub cost_multiplier: f64,
    /// Externally supplied upper bound as a decimal string, combined with
    /// the file bound by taking the minimum
    pub external_ub: Option<String>,
    /// Absolute upper-bound relaxation as a decimal string
    pub delta_ub: Option<String>,
    /// Relative upper-bound relaxation as a fraction of the working bound
    pub delta_ub_relative_gap: f64,
    /// Multiplier applied to quadratic coefficients when reading QPBO files;
    /// the default of 2 turns the triangle matrix into its symmetric form
    pub qpbo_mult: f64,
    /// Normalisation factor for UAI probability-to-cost conversion; `None`
    /// uses `10^precision`
    pub norm_factor: Option<f64>,
    /// Path to a UAI evidence file applied after loading
    pub evidence: Option<PathBuf>,
}

impl Default for Config {
    fn default() -> Self {
        Config {
            precision: 0,
            cost_multiplier: 1.0,
            external_ub: None,
            delta_ub: None,
            delta_ub_relative_gap: 0.0,
            qpbo_mult: 2.0,
            norm_factor: None,
            evidence: None,
        }
    }
}
