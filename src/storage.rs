//! In-memory matrix storage.
//!
//! A fixed 3x3 grid of `i32` cells, zeroed at startup. The event loop owns
//! the matrix and passes it by `&mut` to request processing, so no locking
//! is needed: every operation runs to completion on the loop thread before
//! its response is written.

use thiserror::Error;
use tracing::{info, trace};

/// Number of rows and columns.
pub const DIM: usize = 3;

/// A coordinate outside `[0, DIM)`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
#[error("cell ({row}, {col}) is outside the {dim}x{dim} matrix", dim = DIM)]
pub struct IndexError {
    pub row: i32,
    pub col: i32,
}

/// The shared matrix.
#[derive(Debug, Default)]
pub struct Matrix {
    cells: [[i32; DIM]; DIM],
}

impl Matrix {
    /// Create a zeroed matrix
    pub fn new() -> Self {
        info!(rows = DIM, cols = DIM, "Initializing matrix");
        Self::default()
    }

    /// Read the cell at (row, col).
    pub fn get(&self, row: i32, col: i32) -> Result<i32, IndexError> {
        let (r, c) = Self::index(row, col)?;
        Ok(self.cells[r][c])
    }

    /// Store `value` at (row, col) and return the stored value.
    pub fn set(&mut self, row: i32, col: i32, value: i32) -> Result<i32, IndexError> {
        let (r, c) = Self::index(row, col)?;
        trace!(row, col, value, "Cell updated");
        self.cells[r][c] = value;
        Ok(self.cells[r][c])
    }

    /// Sum of all cells with 32-bit two's-complement wraparound.
    pub fn sum(&self) -> i32 {
        self.cells
            .iter()
            .flatten()
            .fold(0i32, |acc, &cell| acc.wrapping_add(cell))
    }

    fn index(row: i32, col: i32) -> Result<(usize, usize), IndexError> {
        let check = |i: i32| usize::try_from(i).ok().filter(|&i| i < DIM);
        match (check(row), check(col)) {
            (Some(r), Some(c)) => Ok((r, c)),
            _ => Err(IndexError { row, col }),
        }
    }
}
