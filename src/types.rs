//! # Common Types for Weighted CSPs
//!
//! Common types used throughout the library to guarantee type safety.

use std::{fmt, ops};

use thiserror::Error;

pub mod costs;
pub use costs::Cost;

/// The hash map to use throughout the library
#[cfg(feature = "fxhash")]
pub type RsHashMap<K, V> = rustc_hash::FxHashMap<K, V>;
/// The hash map to use throughout the library
#[cfg(not(feature = "fxhash"))]
pub type RsHashMap<K, V> = std::collections::HashMap<K, V>;

/// The hash set to use throughout the library
#[cfg(feature = "fxhash")]
pub type RsHashSet<V> = rustc_hash::FxHashSet<V>;
/// The hash set to use throughout the library
#[cfg(not(feature = "fxhash"))]
pub type RsHashSet<V> = std::collections::HashSet<V>;

/// Type representing variables of a weighted CSP. Variable indexing starts
/// from 0 and indices are dense within their owning network. The memory
/// representation of variables is `u32`.
#[derive(Hash, Eq, PartialEq, PartialOrd, Clone, Copy, Ord)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
#[repr(transparent)]
pub struct Var {
    idx: u32,
}

impl Var {
    /// The maximum index that can be represented.
    pub const MAX_IDX: u32 = u32::MAX - 1;

    /// Creates a new variable with a given index.
    /// Indices start from 0.
    ///
    /// # Panics
    ///
    /// If `idx > Var::MAX_IDX`.
    #[must_use]
    pub const fn new(idx: u32) -> Var {
        assert!(idx <= Var::MAX_IDX, "variable index too high");
        Var { idx }
    }

    /// Creates a new variable with a given index.
    /// Indices start from 0.
    ///
    /// # Errors
    ///
    /// `TypeError::IdxTooHigh(idx, Var::MAX_IDX)` if `idx > Var::MAX_IDX`.
    pub fn new_with_error(idx: u32) -> Result<Var, TypeError> {
        if idx > Var::MAX_IDX {
            return Err(TypeError::IdxTooHigh(idx, Var::MAX_IDX));
        }
        Ok(Var { idx })
    }

    /// Returns the index of the variable. This is a `usize` to enable easier
    /// indexing of data structures like vectors, even though the internal
    /// representation of a variable is `u32`. For the 32 bit index use
    /// [`Var::idx32`].
    #[inline]
    #[must_use]
    pub fn idx(self) -> usize {
        self.idx as usize
    }

    /// Returns the 32 bit index of the variable.
    #[inline]
    #[must_use]
    pub fn idx32(self) -> u32 {
        self.idx
    }
}

/// Incrementing variables
impl ops::Add<u32> for Var {
    type Output = Var;

    fn add(self, rhs: u32) -> Self::Output {
        let idx = self.idx + rhs;
        debug_assert!(idx <= Var::MAX_IDX, "variable index overflow");
        Var { idx }
    }
}

/// Variables can be printed with the [`Display`](std::fmt::Display) trait
impl fmt::Display for Var {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "x{}", self.idx)
    }
}

impl fmt::Debug for Var {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "x{}", self.idx)
    }
}

/// Type representing a value index of an enumerated variable. A value index
/// is always strictly smaller than the initial domain size of the variable it
/// belongs to; external value names are resolved to value indices at parse
/// time. For interval variables, value indices are the values themselves.
#[derive(Hash, Eq, PartialEq, PartialOrd, Clone, Copy, Ord, Default)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
#[repr(transparent)]
pub struct Value {
    idx: u32,
}

impl Value {
    /// Creates a new value index
    #[must_use]
    pub const fn new(idx: u32) -> Value {
        Value { idx }
    }

    /// Returns the value index as a `usize` for indexing cost tables
    #[inline]
    #[must_use]
    pub fn idx(self) -> usize {
        self.idx as usize
    }

    /// Returns the 32 bit value index
    #[inline]
    #[must_use]
    pub fn idx32(self) -> u32 {
        self.idx
    }
}

impl ops::Add<u32> for Value {
    type Output = Value;

    fn add(self, rhs: u32) -> Self::Output {
        Value {
            idx: self.idx + rhs,
        }
    }
}

impl ops::Sub<u32> for Value {
    type Output = Value;

    fn sub(self, rhs: u32) -> Self::Output {
        Value {
            idx: self.idx - rhs,
        }
    }
}

impl fmt::Display for Value {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.idx)
    }
}

impl fmt::Debug for Value {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.idx)
    }
}

/// An ordered list of value indices, one per scope position of a cost
/// function. Wrapper around a std collection to allow for changing the data
/// structure.
#[derive(Hash, Eq, PartialEq, PartialOrd, Ord, Clone, Default)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct Tuple {
    vals: Vec<Value>,
}

impl Tuple {
    /// Creates a new empty tuple
    #[must_use]
    pub fn new() -> Tuple {
        Tuple::default()
    }

    /// Creates a new empty tuple with at least the specified capacity
    #[must_use]
    pub fn with_capacity(capacity: usize) -> Tuple {
        Tuple {
            vals: Vec::with_capacity(capacity),
        }
    }

    /// Returns the length (arity) of the tuple
    #[inline]
    #[must_use]
    pub fn len(&self) -> usize {
        self.vals.len()
    }

    /// Checks whether the tuple is empty
    #[inline]
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.vals.is_empty()
    }

    /// Appends a value to the tuple
    pub fn push(&mut self, val: Value) {
        self.vals.push(val);
    }

    /// Iterates over the values of the tuple
    pub fn iter(&self) -> std::slice::Iter<'_, Value> {
        self.vals.iter()
    }
}

impl ops::Index<usize> for Tuple {
    type Output = Value;

    fn index(&self, index: usize) -> &Self::Output {
        &self.vals[index]
    }
}

impl ops::IndexMut<usize> for Tuple {
    fn index_mut(&mut self, index: usize) -> &mut Self::Output {
        &mut self.vals[index]
    }
}

impl From<Vec<Value>> for Tuple {
    fn from(vals: Vec<Value>) -> Self {
        Tuple { vals }
    }
}

impl FromIterator<Value> for Tuple {
    fn from_iter<T: IntoIterator<Item = Value>>(iter: T) -> Self {
        Tuple {
            vals: iter.into_iter().collect(),
        }
    }
}

impl<'slf> IntoIterator for &'slf Tuple {
    type Item = &'slf Value;
    type IntoIter = std::slice::Iter<'slf, Value>;

    fn into_iter(self) -> Self::IntoIter {
        self.vals.iter()
    }
}

impl fmt::Display for Tuple {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "(")?;
        for (i, v) in self.vals.iter().enumerate() {
            if i > 0 {
                write!(f, ",")?;
            }
            write!(f, "{v}")?;
        }
        write!(f, ")")
    }
}

impl fmt::Debug for Tuple {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{self}")
    }
}

/// Creates a [`Tuple`] from a list of value indices
///
/// ```
/// # use rustwcsp::{vtuple, types::{Tuple, Value}};
/// let t = vtuple![0, 2, 1];
/// assert_eq!(t.len(), 3);
/// assert_eq!(t[1], Value::new(2));
/// ```
#[macro_export]
macro_rules! vtuple {
    ( $($v:expr),* ) => {
        {
            let mut t = $crate::types::Tuple::new();
            $(
                t.push($crate::types::Value::new($v));
            )*
            t
        }
    };
}

/// Errors related to types
#[derive(Error, Debug, PartialEq, Eq)]
pub enum TypeError {
    /// The requested index is too high.
    /// Contains the requested and the maximum index.
    #[error("index {0} is too high (maximum {1})")]
    IdxTooHigh(u32, u32),
}

#[cfg(test)]
mod tests {
    use super::{Value, Var};

    #[test]
    fn var_index() {
        let var = Var::new(5);
        assert_eq!(var.idx(), 5);
        assert_eq!(var.idx32(), 5);
        assert_eq!((var + 2).idx(), 7);
    }

    #[test]
    fn var_index_error() {
        assert!(Var::new_with_error(u32::MAX).is_err());
        assert!(Var::new_with_error(42).is_ok());
    }

    #[test]
    fn tuple_macro() {
        let t = vtuple![1, 0, 3];
        assert_eq!(t.len(), 3);
        assert_eq!(t[0], Value::new(1));
        assert_eq!(t[2], Value::new(3));
    }

    #[test]
    fn tuple_ordering() {
        assert!(vtuple![0, 1] < vtuple![1, 0]);
        assert_eq!(vtuple![2, 2], vtuple![2, 2]);
    }
}
