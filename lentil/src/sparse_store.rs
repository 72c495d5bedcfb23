//! Sparse interaction store.
//!
//! Non-zero `(row, column, value)` triples are coalesced into one CSR
//! matrix. A column-major index points back into the CSR value array, so
//! every value is stored once:
//!
//! ```text
//! row-major:    row_offsets[u]..row_offsets[u+1] -> (col_indices[e], values[e])
//! column-major: col_ptr[i]..col_ptr[i+1]         -> (row_idx[p], values[col_entry[p]])
//! ```

use crate::entity::Role;
use crate::error::{HpfError, Result};
use matrix_param::ParamFloat;
use matrix_util::traits::MatTriplets;
use nalgebra_sparse::{CooMatrix, CsrMatrix};
use ndarray::Array2;

/// What to do when the same `(row, column)` pair appears more than once
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum DuplicatePolicy {
    /// Add up the values
    #[default]
    Sum,
    /// Fail with `InvalidObservation`
    Reject,
}

/// Read-only sparse count matrix with row-major and column-major access
#[derive(Debug, Clone)]
pub struct SparseTriplets<T> {
    csr: CsrMatrix<T>,
    col_ptr: Vec<usize>,
    col_entry: Vec<usize>,
    row_idx: Vec<usize>,
}

impl<T: ParamFloat> SparseTriplets<T> {
    /// Build the store, taking the shape from the largest indexes.
    ///
    /// * `triplets` - `(row, column, value)` with non-negative finite values
    /// * `policy` - how to handle duplicated `(row, column)` pairs
    pub fn from_triplets<I>(triplets: I, policy: DuplicatePolicy) -> Result<Self>
    where
        I: IntoIterator<Item = (usize, usize, T)>,
    {
        let triplets: Vec<_> = triplets.into_iter().collect();
        let nrows = triplets.iter().map(|&(r, _, _)| r + 1).max().unwrap_or(0);
        let ncols = triplets.iter().map(|&(_, c, _)| c + 1).max().unwrap_or(0);
        Self::from_triplets_with_shape(nrows, ncols, triplets, policy)
    }

    /// Build the store from a dense matrix, keeping entries above 1e-6
    pub fn from_dense(dense: &Array2<T>) -> Result<Self> {
        let (nrows, ncols, triplets) = dense
            .to_nonzero_triplets()
            .map_err(|e| HpfError::config(format!("failed to read dense matrix: {}", e)))?;
        Self::from_triplets_with_shape(nrows, ncols, triplets, DuplicatePolicy::Sum)
    }

    /// Build the store for an `nrows x ncols` matrix. Rows and columns
    /// without any triple are kept as empty lanes.
    pub fn from_triplets_with_shape<I>(
        nrows: usize,
        ncols: usize,
        triplets: I,
        policy: DuplicatePolicy,
    ) -> Result<Self>
    where
        I: IntoIterator<Item = (usize, usize, T)>,
    {
        let triplets: Vec<(usize, usize, T)> = triplets.into_iter().collect();

        for &(row, column, value) in triplets.iter() {
            check_observation(row, column, value)?;
            if row >= nrows || column >= ncols {
                return Err(HpfError::InvalidObservation {
                    row,
                    column,
                    reason: format!("outside of the {} x {} matrix", nrows, ncols),
                });
            }
        }

        if policy == DuplicatePolicy::Reject {
            let mut keys: Vec<(usize, usize)> =
                triplets.iter().map(|&(r, c, _)| (r, c)).collect();
            keys.sort_unstable();
            if let Some(w) = keys.windows(2).find(|w| w[0] == w[1]) {
                let (row, column) = w[0];
                return Err(HpfError::InvalidObservation {
                    row,
                    column,
                    reason: "duplicated entry".to_string(),
                });
            }
        }

        // duplicates are summed in the conversion
        let mut coo = CooMatrix::new(nrows, ncols);
        for (row, column, value) in triplets {
            coo.push(row, column, value);
        }
        let csr = CsrMatrix::from(&coo);

        for (row, column, &value) in csr.triplet_iter() {
            check_observation(row, column, value)?;
        }

        // counting sort by column; rows stay ascending within each column
        let nnz = csr.nnz();
        let mut col_ptr = vec![0_usize; ncols + 1];
        for &column in csr.col_indices() {
            col_ptr[column + 1] += 1;
        }
        for i in 0..ncols {
            col_ptr[i + 1] += col_ptr[i];
        }

        let mut next = col_ptr.clone();
        let mut col_entry = vec![0_usize; nnz];
        let mut row_idx = vec![0_usize; nnz];
        let offsets = csr.row_offsets();
        for row in 0..nrows {
            for e in offsets[row]..offsets[row + 1] {
                let column = csr.col_indices()[e];
                let p = next[column];
                col_entry[p] = e;
                row_idx[p] = row;
                next[column] += 1;
            }
        }

        Ok(SparseTriplets {
            csr,
            col_ptr,
            col_entry,
            row_idx,
        })
    }

    /// Number of rows
    pub fn nrows(&self) -> usize {
        self.csr.nrows()
    }

    /// Number of columns
    pub fn ncols(&self) -> usize {
        self.csr.ncols()
    }

    /// Number of stored (non-zero) entries
    pub fn nnz(&self) -> usize {
        self.csr.nnz()
    }

    /// Number of rows or columns, depending on the side
    pub fn len_of(&self, role: Role) -> usize {
        match role {
            Role::Row => self.nrows(),
            Role::Column => self.ncols(),
        }
    }

    /// Sorted column indexes observed in row `u`
    pub fn row_columns(&self, u: usize) -> &[usize] {
        let offsets = self.csr.row_offsets();
        &self.csr.col_indices()[offsets[u]..offsets[u + 1]]
    }

    /// `(column, value)` pairs of row `u`
    pub fn row(&self, u: usize) -> impl Iterator<Item = (usize, T)> + '_ {
        let offsets = self.csr.row_offsets();
        let range = offsets[u]..offsets[u + 1];
        self.csr.col_indices()[range.clone()]
            .iter()
            .copied()
            .zip(self.csr.values()[range].iter().copied())
    }

    /// `(row, value)` pairs of column `i`
    pub fn column(&self, i: usize) -> impl Iterator<Item = (usize, T)> + '_ {
        let range = self.col_ptr[i]..self.col_ptr[i + 1];
        let values = self.csr.values();
        self.row_idx[range.clone()]
            .iter()
            .copied()
            .zip(self.col_entry[range].iter().map(move |&e| values[e]))
    }

    /// Visit the `(partner index, value)` pairs of one row or column
    /// without allocating.
    #[inline]
    pub fn for_each_in_lane<F>(&self, role: Role, index: usize, mut visit: F)
    where
        F: FnMut(usize, T),
    {
        let values = self.csr.values();
        match role {
            Role::Row => {
                let offsets = self.csr.row_offsets();
                let columns = self.csr.col_indices();
                for e in offsets[index]..offsets[index + 1] {
                    visit(columns[e], values[e]);
                }
            }
            Role::Column => {
                for p in self.col_ptr[index]..self.col_ptr[index + 1] {
                    visit(self.row_idx[p], values[self.col_entry[p]]);
                }
            }
        }
    }

    /// All entries in row-major order
    pub fn iter(&self) -> impl Iterator<Item = (usize, usize, T)> + '_ {
        (0..self.nrows()).flat_map(move |u| self.row(u).map(move |(i, x)| (u, i, x)))
    }
}

fn check_observation<T: ParamFloat>(row: usize, column: usize, value: T) -> Result<()> {
    if !value.is_finite() {
        return Err(HpfError::InvalidObservation {
            row,
            column,
            reason: format!("non-finite value {}", value),
        });
    }
    if value < T::zero() {
        return Err(HpfError::InvalidObservation {
            row,
            column,
            reason: format!("negative value {}", value),
        });
    }
    Ok(())
}

impl<T: ParamFloat> MatTriplets for SparseTriplets<T> {
    type Mat = Self;
    type Scalar = T;

    fn from_nonzero_triplets<I>(
        nrow: usize,
        ncol: usize,
        triplets: Vec<(I, I, Self::Scalar)>,
    ) -> anyhow::Result<Self::Mat>
    where
        I: TryInto<usize> + Copy,
        <I as TryInto<usize>>::Error: std::fmt::Debug,
    {
        let triplets = triplets
            .into_iter()
            .map(|(ii, jj, x)| -> anyhow::Result<(usize, usize, T)> {
                let ii: usize = ii
                    .try_into()
                    .map_err(|e| anyhow::anyhow!("invalid row index: {:?}", e))?;
                let jj: usize = jj
                    .try_into()
                    .map_err(|e| anyhow::anyhow!("invalid column index: {:?}", e))?;
                Ok((ii, jj, x))
            })
            .collect::<anyhow::Result<Vec<_>>>()?;

        Ok(Self::from_triplets_with_shape(
            nrow,
            ncol,
            triplets,
            DuplicatePolicy::Sum,
        )?)
    }

    fn to_nonzero_triplets(
        &self,
    ) -> anyhow::Result<(usize, usize, Vec<(usize, usize, Self::Scalar)>)> {
        Ok((self.nrows(), self.ncols(), self.iter().collect()))
    }
}
