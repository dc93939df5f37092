//! Sparse-format conversion.
//!
//! [`SparseBuilder`] is an explicit conversion context: callers create one,
//! feed it `(row, col, value)` triplets in any order, and finish it into a
//! compressed-sparse-column array. All scratch state lives in the builder
//! itself — there is no hidden per-thread storage, so builders can be used
//! from any thread or pooled by the caller if conversion is hot.

use crate::array::{Dims, MatArray};
use crate::error::{MatError, Result};

/// Accumulates coordinate-form triplets into a sparse double matrix.
#[derive(Debug)]
pub struct SparseBuilder {
    rows: i32,
    cols: i32,
    triplets: Vec<(i32, i32, f64)>,
}

impl SparseBuilder {
    /// A builder for a `rows × cols` matrix.
    pub fn new(rows: i32, cols: i32) -> Result<Self> {
        if rows < 0 || cols < 0 {
            return Err(MatError::bounds("negative sparse dimensions"));
        }
        Ok(Self {
            rows,
            cols,
            triplets: Vec::new(),
        })
    }

    /// Adds one entry. Duplicate coordinates accumulate by summation.
    pub fn push(&mut self, row: i32, col: i32, value: f64) -> Result<()> {
        if row < 0 || row >= self.rows || col < 0 || col >= self.cols {
            return Err(MatError::bounds(format!(
                "entry ({row}, {col}) outside {}×{}",
                self.rows, self.cols
            )));
        }
        self.triplets.push((row, col, value));
        Ok(())
    }

    /// Number of triplets accumulated so far (before duplicate merging).
    pub fn len(&self) -> usize {
        self.triplets.len()
    }

    /// True when no triplets have been added.
    pub fn is_empty(&self) -> bool {
        self.triplets.is_empty()
    }

    /// Converts the triplets into compressed-sparse-column form.
    ///
    /// Entries are ordered column-major, duplicates summed, and exact
    /// zeros produced by summation are dropped. An all-zero result keeps
    /// the single placeholder row index the wire format requires.
    pub fn finish(mut self) -> Result<MatArray> {
        self.triplets
            .sort_by(|a, b| (a.1, a.0).cmp(&(b.1, b.0)));

        let mut row_indices = Vec::new();
        let mut values: Vec<f64> = Vec::new();
        let mut merged: Vec<(i32, i32, f64)> = Vec::new();
        for (row, col, value) in self.triplets.drain(..) {
            match merged.last_mut() {
                Some((r, c, v)) if *r == row && *c == col => *v += value,
                _ => merged.push((row, col, value)),
            }
        }

        let mut col_ptrs = vec![0i32; self.cols as usize + 1];
        for (row, col, value) in merged {
            if value == 0.0 {
                continue;
            }
            row_indices.push(row);
            values.push(value);
            col_ptrs[col as usize + 1] += 1;
        }
        for i in 1..col_ptrs.len() {
            col_ptrs[i] += col_ptrs[i - 1];
        }
        if row_indices.is_empty() {
            row_indices.push(0);
        }

        MatArray::sparse(
            Dims::matrix(self.rows, self.cols),
            row_indices,
            col_ptrs,
            values,
        )
    }
}
