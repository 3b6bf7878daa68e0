//! Sparse parameter matrices.
//!
//! Inter-module adjacency is typically well under 5% dense, so parameter
//! matrices store only their nonzero entries. Each matrix fixes its element
//! type when it is created; later writes of a different type are rejected.

use std::collections::BTreeMap;

use crate::error::CoreError;

// ── Values ───────────────────────────────────────────────────────────

/// Element type of a parameter matrix.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ParamType {
    Int,
    Float,
}

impl ParamType {
    /// The zero value of this type.
    pub fn zero(self) -> ParamValue {
        match self {
            ParamType::Int => ParamValue::Int(0),
            ParamType::Float => ParamValue::Float(0.0),
        }
    }
}

/// A single parameter value.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum ParamValue {
    Int(i64),
    Float(f64),
}

impl ParamValue {
    pub fn param_type(self) -> ParamType {
        match self {
            ParamValue::Int(_) => ParamType::Int,
            ParamValue::Float(_) => ParamType::Float,
        }
    }

    pub fn is_zero(self) -> bool {
        match self {
            ParamValue::Int(v) => v == 0,
            ParamValue::Float(v) => v == 0.0,
        }
    }
}

impl From<i64> for ParamValue {
    fn from(v: i64) -> Self {
        ParamValue::Int(v)
    }
}

impl From<f64> for ParamValue {
    fn from(v: f64) -> Self {
        ParamValue::Float(v)
    }
}

// ── Matrix ───────────────────────────────────────────────────────────

/// A sparse 2-D matrix holding only nonzero entries.
///
/// Writing a zero removes the entry; reading an absent entry returns the
/// typed zero. Entries iterate in row-major order.
#[derive(Debug, Clone, PartialEq)]
pub struct SparseMatrix {
    rows: usize,
    cols: usize,
    dtype: ParamType,
    entries: BTreeMap<(usize, usize), ParamValue>,
}

impl SparseMatrix {
    pub fn new(rows: usize, cols: usize, dtype: ParamType) -> Self {
        Self {
            rows,
            cols,
            dtype,
            entries: BTreeMap::new(),
        }
    }

    pub fn rows(&self) -> usize {
        self.rows
    }

    pub fn cols(&self) -> usize {
        self.cols
    }

    pub fn dtype(&self) -> ParamType {
        self.dtype
    }

    /// Number of stored (nonzero) entries.
    pub fn nnz(&self) -> usize {
        self.entries.len()
    }

    fn check_bounds(&self, row: usize, col: usize) -> Result<(), CoreError> {
        if row >= self.rows || col >= self.cols {
            return Err(CoreError::InvalidShape(format!(
                "index ({row}, {col}) out of range for {}x{} matrix",
                self.rows, self.cols
            )));
        }
        Ok(())
    }

    pub fn get(&self, row: usize, col: usize) -> Result<ParamValue, CoreError> {
        self.check_bounds(row, col)?;
        Ok(self
            .entries
            .get(&(row, col))
            .copied()
            .unwrap_or_else(|| self.dtype.zero()))
    }

    pub fn set(&mut self, row: usize, col: usize, val: ParamValue) -> Result<(), CoreError> {
        self.check_bounds(row, col)?;
        if val.param_type() != self.dtype {
            return Err(CoreError::TypeMismatch(format!(
                "cannot store {:?} in a {:?} matrix",
                val.param_type(),
                self.dtype
            )));
        }
        if val.is_zero() {
            self.entries.remove(&(row, col));
        } else {
            self.entries.insert((row, col), val);
        }
        Ok(())
    }

    /// Iterate over stored entries as `(row, col, value)`.
    pub fn entries(&self) -> impl Iterator<Item = (usize, usize, ParamValue)> + '_ {
        self.entries.iter().map(|(&(r, c), &v)| (r, c, v))
    }

    /// A fresh matrix with rows and columns swapped.
    pub fn transpose(&self) -> SparseMatrix {
        let mut out = SparseMatrix::new(self.cols, self.rows, self.dtype);
        for (&(r, c), &v) in &self.entries {
            out.entries.insert((c, r), v);
        }
        out
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn absent_entries_read_as_typed_zero() {
        let m = SparseMatrix::new(2, 3, ParamType::Float);
        assert_eq!(m.get(1, 2).unwrap(), ParamValue::Float(0.0));
        assert_eq!(m.nnz(), 0);
    }

    #[test]
    fn writing_zero_removes_the_entry() {
        let mut m = SparseMatrix::new(2, 2, ParamType::Int);
        m.set(0, 1, ParamValue::Int(5)).unwrap();
        assert_eq!(m.nnz(), 1);
        m.set(0, 1, ParamValue::Int(0)).unwrap();
        assert_eq!(m.nnz(), 0);
    }

    #[test]
    fn out_of_range_is_invalid_shape() {
        let m = SparseMatrix::new(2, 2, ParamType::Int);
        assert!(matches!(m.get(2, 0), Err(CoreError::InvalidShape(_))));
    }

    #[test]
    fn wrong_element_type_is_rejected() {
        let mut m = SparseMatrix::new(2, 2, ParamType::Int);
        let err = m.set(0, 0, ParamValue::Float(1.5)).unwrap_err();
        assert!(matches!(err, CoreError::TypeMismatch(_)));
    }

    #[test]
    fn transpose_round_trip() {
        let mut m = SparseMatrix::new(2, 3, ParamType::Float);
        m.set(0, 2, ParamValue::Float(1.5)).unwrap();
        m.set(1, 0, ParamValue::Float(-2.0)).unwrap();
        let t = m.transpose();
        assert_eq!(t.rows(), 3);
        assert_eq!(t.cols(), 2);
        assert_eq!(t.get(2, 0).unwrap(), ParamValue::Float(1.5));
        assert_eq!(t.transpose(), m);
    }

    #[test]
    fn entries_iterate_row_major() {
        let mut m = SparseMatrix::new(3, 3, ParamType::Int);
        m.set(2, 0, ParamValue::Int(1)).unwrap();
        m.set(0, 1, ParamValue::Int(2)).unwrap();
        m.set(0, 0, ParamValue::Int(3)).unwrap();
        let coords: Vec<(usize, usize)> = m.entries().map(|(r, c, _)| (r, c)).collect();
        assert_eq!(coords, vec![(0, 0), (0, 1), (2, 0)]);
    }
}
