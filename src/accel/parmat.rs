//! Distributed dense-matrix products.
//!
//! The quasi-Newton histories are block-row distributed over the participant
//! group. Products with a replicated result go through one allreduce;
//! products whose result is itself block-row distributed (building the dense
//! inverse-Jacobian approximation) pipeline the right operand's blocks
//! around the cyclic slave ring so no rank ever holds the whole matrix.

use crate::com::group::GroupComm;
use crate::com::ring::SlaveRing;
use crate::error::Result;
use nalgebra::{DMatrix, DVector};

/// Collect a block-row distributed vector on every rank.
pub fn allgather_vector(
    local: &DVector<f64>,
    offsets: &[usize],
    group: &GroupComm,
) -> Result<DVector<f64>> {
    if group.size() == 1 {
        return Ok(local.clone());
    }
    let gathered = group.gather_f64s(local.as_slice())?;
    let total = offsets[offsets.len() - 1];
    let full = if group.is_master() {
        gathered
    } else {
        vec![0.0; total]
    };
    let full = group.broadcast_f64s(full)?;
    Ok(DVector::from_vec(full))
}

/// Collect a block-row distributed matrix on every rank, column count `k`
/// replicated.
pub fn allgather_matrix(
    local: &DMatrix<f64>,
    offsets: &[usize],
    group: &GroupComm,
) -> Result<DMatrix<f64>> {
    if group.size() == 1 {
        return Ok(local.clone());
    }
    let k = local.ncols();
    let total_rows = offsets[offsets.len() - 1];
    let mut full = DMatrix::zeros(total_rows, k);
    for c in 0..k {
        let col = allgather_vector(&local.column(c).clone_owned(), offsets, group)?;
        full.set_column(c, &col);
    }
    Ok(full)
}

/// Element-wise allreduce of a small replicated matrix (each rank holds a
/// partial sum).
pub fn allreduce_matrix(partial: DMatrix<f64>, group: &GroupComm) -> Result<DMatrix<f64>> {
    if group.size() == 1 {
        return Ok(partial);
    }
    let (rows, cols) = partial.shape();
    let summed = group.allreduce_sum_f64s(partial.as_slice().to_vec())?;
    Ok(DMatrix::from_vec(rows, cols, summed))
}

/// `AᵀB` for two block-row distributed matrices; the small result is
/// replicated on every rank.
pub fn transpose_product(
    a: &DMatrix<f64>,
    b: &DMatrix<f64>,
    group: &GroupComm,
) -> Result<DMatrix<f64>> {
    allreduce_matrix(a.transpose() * b, group)
}

/// `A · B` where `A` is block-row distributed (`n_local × k`) and `B` is
/// block-column distributed (`k × n_local`). The result (`n_local × n_global`)
/// is block-row distributed; `B`'s blocks travel once around the ring.
pub fn pipelined_product(
    a: &DMatrix<f64>,
    b: &DMatrix<f64>,
    offsets: &[usize],
    ring: Option<&SlaveRing>,
    group: &GroupComm,
) -> Result<DMatrix<f64>> {
    let n_local = a.nrows();
    let k = a.ncols();
    let n_global = offsets[offsets.len() - 1];
    let size = group.size();
    let rank = group.rank();
    let mut result = DMatrix::zeros(n_local, n_global);
    if size == 1 {
        result.view_mut((0, 0), (n_local, n_global)).copy_from(&(a * b));
        return Ok(result);
    }
    let ring = ring.expect("pipelined products in a distributed group need the slave ring");

    let mut block = b.clone();
    for step in 0..size {
        let owner = (rank + size - step) % size;
        let cols = offsets[owner + 1] - offsets[owner];
        debug_assert_eq!(block.ncols(), cols);
        result
            .view_mut((0, offsets[owner]), (n_local, cols))
            .copy_from(&(a * &block));
        if step + 1 < size {
            let next_owner = (rank + size - step - 1) % size;
            let incoming = k * (offsets[next_owner + 1] - offsets[next_owner]);
            let rotated = ring.rotate_f64s(block.as_slice().to_vec(), incoming)?;
            block = DMatrix::from_vec(k, incoming / k.max(1), rotated);
        }
    }
    Ok(result)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn single_rank_pipelined_product_is_a_local_multiply() {
        let group = GroupComm::single();
        let a = DMatrix::from_column_slice(2, 1, &[1.0, 2.0]);
        let b = DMatrix::from_column_slice(1, 2, &[3.0, 4.0]);
        let j = pipelined_product(&a, &b, &[0, 2], None, &group).unwrap();
        assert_eq!(j, DMatrix::from_column_slice(2, 2, &[3.0, 6.0, 4.0, 8.0]));
    }

    #[test]
    fn transpose_product_matches_local_algebra() {
        let group = GroupComm::single();
        let a = DMatrix::from_column_slice(3, 2, &[1.0, 0.0, 2.0, 0.0, 1.0, 1.0]);
        let b = DMatrix::from_column_slice(3, 1, &[1.0, 2.0, 3.0]);
        let p = transpose_product(&a, &b, &group).unwrap();
        assert_eq!(p, a.transpose() * b);
    }
}
