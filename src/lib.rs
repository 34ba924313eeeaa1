//! # RustWCSP - A Weighted CSP Library for Rust
//!
//! RustWCSP is a collection of types and parsers for working with weighted
//! constraint satisfaction problems (also called cost function networks) in
//! Rust. The library covers loading problems from the common surface formats,
//! building cost function networks programmatically, and embedding whole
//! networks as constraints inside a master network.
//!
//! ## Example
//!
//! ```
//! # use rustwcsp::{instances::Wcsp, types::costs::Cost};
//! let mut wcsp = Wcsp::new("example");
//! let x = wcsp.make_enum_var("x", 1).unwrap();
//! let y = wcsp.make_enum_var("y", 1).unwrap();
//! wcsp.post_unary(x, &[Cost::ZERO, Cost::UNIT]).unwrap();
//! wcsp.post_binary(x, y, &[Cost::ZERO, Cost::UNIT, Cost::UNIT, Cost::ZERO])
//!     .unwrap();
//! assert_eq!(wcsp.num_variables(), 2);
//! ```
//!
//! ## Features
//!
//! | Feature name | Description |
//! | --- | --- |
//! | `compression` | Enable parsing compressed (gzip, bzip2) input files. |
//! | `fxhash` | Use the faster firefox hash function from `rustc-hash`. |
//! | `serde` | Add [`serde::Serialize`](https://docs.rs/serde/latest/serde/trait.Serialize.html) and [`serde::Deserialize`](https://docs.rs/serde/latest/serde/trait.Deserialize.html) implementations for many library types. |
//!
//! ## File Formats
//!
//! The loader understands six surface syntaxes: CFN (JSON-like cost function
//! networks), the legacy WCSP format, UAI/LG Markov and Bayesian networks,
//! DIMACS WCNF/CNF, QPBO quadratic pseudo-Boolean, and OPB linear
//! pseudo-Boolean files. All of them are normalised into the same internal
//! network representation, see [`instances`].
//!
//! ## Minimum Supported Rust Version (MSRV)
//!
//! Currently, the MSRV of RustWCSP is 1.74.0, the plan is to always support
//! an MSRV that is at least a year old.
//!
//! Bumps in the MSRV will _not_ be considered breaking changes. If you need a
//! specific MSRV, make sure to pin a precise version of RustWCSP.

#![cfg_attr(docsrs, feature(doc_auto_cfg))]
#![warn(clippy::pedantic)]
#![warn(missing_docs)]

pub mod instances;
pub mod solving;
pub mod types;
