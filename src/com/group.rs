//! Master-slave coordination within one participant group.
//!
//! Every participant group has one master rank (rank 0) and any number of
//! slave ranks. The master holds one accepting channel that fans out to all
//! slaves; each slave holds the requesting end. All collectives here are
//! blocking for the whole group, and the master is the linearization point:
//! its value is what everyone observes.
//!
//! A [`GroupComm`] is an explicit handle, created once per process by the
//! facade and passed into every scheme and acceleration that needs
//! collectives. A group of size one degenerates to local no-ops, which is
//! what makes a serial solver behave exactly like a distributed one with a
//! single rank.

use super::{ChannelFactory, CommChannel};
use crate::error::{Error, Result};
use nalgebra::DVector;

/// Collectives over one participant group.
pub struct GroupComm {
    rank: usize,
    size: usize,
    com: Option<Box<dyn CommChannel>>,
}

impl GroupComm {
    /// A coordinator for a group of size one. No channels are opened.
    pub fn single() -> Self {
        Self {
            rank: 0,
            size: 1,
            com: None,
        }
    }

    /// Connect the intra-group channels: rank 0 accepts, all other ranks
    /// request. Blocks until the whole group is wired up.
    pub fn connect(
        participant: &str,
        rank: usize,
        size: usize,
        factory: &ChannelFactory,
    ) -> Result<Self> {
        if size == 0 {
            return Err(Error::config("participant group must have at least one rank"));
        }
        if rank >= size {
            return Err(Error::config(format!(
                "rank {rank} outside group of size {size}"
            )));
        }
        if size == 1 {
            return Ok(Self::single());
        }
        let master_name = format!("{participant}/master");
        let slaves_name = format!("{participant}/slaves");
        let mut com = factory.create();
        if rank == 0 {
            com.accept(&master_name, &slaves_name)?;
        } else {
            com.request(&slaves_name, &master_name, rank, size - 1)?;
        }
        Ok(Self {
            rank,
            size,
            com: Some(com),
        })
    }

    pub fn rank(&self) -> usize {
        self.rank
    }

    pub fn size(&self) -> usize {
        self.size
    }

    pub fn is_master(&self) -> bool {
        self.rank == 0
    }

    fn com(&self) -> &dyn CommChannel {
        self.com.as_deref().expect("group of size one has no channel")
    }

    fn slave_ranks(&self) -> std::ops::Range<usize> {
        1..self.size
    }

    /// Close the intra-group channels. Idempotent.
    pub fn close(&mut self) {
        if let Some(com) = self.com.as_mut() {
            com.close();
        }
        self.com = None;
    }

    // --- broadcast ---------------------------------------------------------

    /// Master's value is distributed to every rank and returned everywhere.
    pub fn broadcast_f64(&self, value: f64) -> Result<f64> {
        if self.size == 1 {
            return Ok(value);
        }
        if self.is_master() {
            for r in self.slave_ranks() {
                self.com().send_f64(value, r)?;
            }
            Ok(value)
        } else {
            self.com().receive_f64(0)
        }
    }

    pub fn broadcast_i64(&self, value: i64) -> Result<i64> {
        if self.size == 1 {
            return Ok(value);
        }
        if self.is_master() {
            for r in self.slave_ranks() {
                self.com().send_i64(value, r)?;
            }
            Ok(value)
        } else {
            self.com().receive_i64(0)
        }
    }

    pub fn broadcast_bool(&self, value: bool) -> Result<bool> {
        if self.size == 1 {
            return Ok(value);
        }
        if self.is_master() {
            for r in self.slave_ranks() {
                self.com().send_bool(value, r)?;
            }
            Ok(value)
        } else {
            self.com().receive_bool(0)
        }
    }

    /// Array broadcast; every rank must pass a buffer of the same length.
    pub fn broadcast_f64s(&self, values: Vec<f64>) -> Result<Vec<f64>> {
        if self.size == 1 {
            return Ok(values);
        }
        if self.is_master() {
            for r in self.slave_ranks() {
                self.com().send_f64s(&values, r)?;
            }
            Ok(values)
        } else {
            self.com().receive_f64s(values.len(), 0)
        }
    }

    pub fn broadcast_i64s(&self, values: Vec<i64>) -> Result<Vec<i64>> {
        if self.size == 1 {
            return Ok(values);
        }
        if self.is_master() {
            for r in self.slave_ranks() {
                self.com().send_i64s(&values, r)?;
            }
            Ok(values)
        } else {
            self.com().receive_i64s(values.len(), 0)
        }
    }

    // --- reductions --------------------------------------------------------

    /// Sum over the group; the result is meaningful on the master only.
    pub fn reduce_sum_f64(&self, value: f64) -> Result<f64> {
        if self.size == 1 {
            return Ok(value);
        }
        if self.is_master() {
            let mut sum = value;
            for r in self.slave_ranks() {
                sum += self.com().receive_f64(r)?;
            }
            Ok(sum)
        } else {
            self.com().send_f64(value, 0)?;
            Ok(value)
        }
    }

    /// Sum over the group; the result is meaningful on the master only.
    pub fn reduce_sum_i64(&self, value: i64) -> Result<i64> {
        if self.size == 1 {
            return Ok(value);
        }
        if self.is_master() {
            let mut sum = value;
            for r in self.slave_ranks() {
                sum += self.com().receive_i64(r)?;
            }
            Ok(sum)
        } else {
            self.com().send_i64(value, 0)?;
            Ok(value)
        }
    }

    /// Element-wise sum of equal-length arrays; meaningful on the master only.
    pub fn reduce_sum_f64s(&self, values: Vec<f64>) -> Result<Vec<f64>> {
        if self.size == 1 {
            return Ok(values);
        }
        if self.is_master() {
            let mut sum = values;
            for r in self.slave_ranks() {
                let part = self.com().receive_f64s(sum.len(), r)?;
                for (s, p) in sum.iter_mut().zip(part) {
                    *s += p;
                }
            }
            Ok(sum)
        } else {
            self.com().send_f64s(&values, 0)?;
            Ok(values)
        }
    }

    /// Sum over the group, distributed back to every rank.
    pub fn allreduce_sum_f64(&self, value: f64) -> Result<f64> {
        let sum = self.reduce_sum_f64(value)?;
        self.broadcast_f64(sum)
    }

    /// Sum over the group, distributed back to every rank.
    pub fn allreduce_sum_i64(&self, value: i64) -> Result<i64> {
        let sum = self.reduce_sum_i64(value)?;
        self.broadcast_i64(sum)
    }

    /// Element-wise array sum, distributed back to every rank.
    pub fn allreduce_sum_f64s(&self, values: Vec<f64>) -> Result<Vec<f64>> {
        let sum = self.reduce_sum_f64s(values)?;
        self.broadcast_f64s(sum)
    }

    /// Maximum over the group, distributed back to every rank.
    pub fn allreduce_max_f64(&self, value: f64) -> Result<f64> {
        if self.size == 1 {
            return Ok(value);
        }
        let max = if self.is_master() {
            let mut max = value;
            for r in self.slave_ranks() {
                max = max.max(self.com().receive_f64(r)?);
            }
            max
        } else {
            self.com().send_f64(value, 0)?;
            value
        };
        self.broadcast_f64(max)
    }

    // --- partition bookkeeping ---------------------------------------------

    /// Gather every rank's local count and return the prefix-sum offset map
    /// `[0, n0, n0+n1, ...]` of length `size + 1` on every rank. Entry `r`
    /// is the global index where rank `r`'s block starts.
    pub fn offsets(&self, local_count: usize) -> Result<Vec<usize>> {
        if self.size == 1 {
            return Ok(vec![0, local_count]);
        }
        let counts = if self.is_master() {
            let mut counts = vec![0i64; self.size];
            counts[0] = local_count as i64;
            for r in self.slave_ranks() {
                counts[r] = self.com().receive_i64(r)?;
            }
            counts
        } else {
            self.com().send_i64(local_count as i64, 0)?;
            vec![0i64; self.size]
        };
        let counts = self.broadcast_i64s(counts)?;
        let mut offsets = Vec::with_capacity(self.size + 1);
        offsets.push(0usize);
        for c in counts {
            offsets.push(offsets.last().unwrap() + c as usize);
        }
        Ok(offsets)
    }

    /// Master collects each rank's block into one vector ordered by rank;
    /// the result is meaningful on the master only.
    pub fn gather_f64s(&self, local: &[f64]) -> Result<Vec<f64>> {
        if self.size == 1 {
            return Ok(local.to_vec());
        }
        if self.is_master() {
            let mut all = local.to_vec();
            for r in self.slave_ranks() {
                let n = self.com().receive_i64(r)? as usize;
                all.extend(self.com().receive_f64s(n, r)?);
            }
            Ok(all)
        } else {
            self.com().send_i64(local.len() as i64, 0)?;
            self.com().send_f64s(local, 0)?;
            Ok(Vec::new())
        }
    }

    /// Master scatters consecutive blocks back to the ranks; `counts[r]`
    /// entries go to rank `r`. Every rank receives its own block.
    pub fn scatter_f64s(&self, all: &[f64], counts: &[usize]) -> Result<Vec<f64>> {
        if self.size == 1 {
            return Ok(all.to_vec());
        }
        if self.is_master() {
            let mut offset = counts[0];
            for r in self.slave_ranks() {
                self.com().send_f64s(&all[offset..offset + counts[r]], r)?;
                offset += counts[r];
            }
            Ok(all[..counts[0]].to_vec())
        } else {
            self.com().receive_f64s(counts[self.rank], 0)
        }
    }

    // --- global norms ------------------------------------------------------

    /// Globally reduced dot product of two equally partitioned vectors.
    pub fn dot(&self, a: &DVector<f64>, b: &DVector<f64>) -> Result<f64> {
        self.allreduce_sum_f64(a.dot(b))
    }

    /// Globally reduced Euclidean norm of a partitioned vector.
    pub fn l2_norm(&self, v: &DVector<f64>) -> Result<f64> {
        Ok(self.allreduce_sum_f64(v.norm_squared())?.sqrt())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::com::direct::Hub;
    use std::sync::Arc;
    use std::thread;

    fn run_group<F>(size: usize, f: F)
    where
        F: Fn(GroupComm) + Send + Sync + 'static,
    {
        let hub = Hub::new();
        let f = Arc::new(f);
        let mut handles = Vec::new();
        for rank in 0..size {
            let factory = ChannelFactory::Direct(Arc::clone(&hub));
            let f = Arc::clone(&f);
            handles.push(thread::spawn(move || {
                let group = GroupComm::connect("Solver", rank, size, &factory).unwrap();
                f(group);
            }));
        }
        for h in handles {
            h.join().unwrap();
        }
    }

    #[test]
    fn size_one_group_is_local() {
        let group = GroupComm::single();
        assert_eq!(group.allreduce_sum_f64(2.5).unwrap(), 2.5);
        assert_eq!(group.offsets(4).unwrap(), vec![0, 4]);
    }

    #[test]
    fn collectives_across_three_ranks() {
        run_group(3, |group| {
            let rank = group.rank() as f64;
            assert_eq!(group.allreduce_sum_f64(rank + 1.0).unwrap(), 6.0);
            let v = group.broadcast_f64(if group.is_master() { 7.0 } else { 0.0 }).unwrap();
            assert_eq!(v, 7.0);
            // Ranks own 1, 2, 3 vertices respectively.
            let offsets = group.offsets(group.rank() + 1).unwrap();
            assert_eq!(offsets, vec![0, 1, 3, 6]);
        });
    }

    #[test]
    fn gather_scatter_roundtrip() {
        run_group(2, |group| {
            let local = vec![group.rank() as f64; group.rank() + 1];
            let gathered = group.gather_f64s(&local).unwrap();
            if group.is_master() {
                assert_eq!(gathered, vec![0.0, 1.0, 1.0]);
            }
            let back = group.scatter_f64s(&gathered, &[1, 2]).unwrap();
            assert_eq!(back, local);
        });
    }

    #[test]
    fn empty_local_block_survives_collectives() {
        run_group(2, |group| {
            // Rank 1 owns zero vertices.
            let local = if group.is_master() { vec![1.0, 2.0] } else { vec![] };
            let gathered = group.gather_f64s(&local).unwrap();
            if group.is_master() {
                assert_eq!(gathered, vec![1.0, 2.0]);
            }
            let offsets = group.offsets(local.len()).unwrap();
            assert_eq!(offsets, vec![0, 2, 2]);
            let norm = group.l2_norm(&DVector::from_vec(local)).unwrap();
            assert!((norm - 5.0f64.sqrt()).abs() < 1e-14);
        });
    }
}
