//! Cyclic ring of channels between neighbouring ranks of one group.
//!
//! Rank `r` accepts a connection from its left neighbour `(r + n - 1) % n`
//! and requests one to its right neighbour `(r + 1) % n`. Even ranks accept
//! first, odd ranks request first, which breaks the symmetry so connection
//! setup cannot deadlock for any group size.
//!
//! The ring only exists for the pipelined block products of the multi-vector
//! quasi-Newton method; its lifetime is bound to the acceleration that needs
//! it, and restart modes never open one.

use super::{ChannelFactory, CommChannel, Message};
use crate::error::Result;

/// Ring endpoints of one rank.
pub struct SlaveRing {
    rank: usize,
    size: usize,
    /// Channel accepted from the left neighbour.
    left: Option<Box<dyn CommChannel>>,
    /// Channel requested to the right neighbour.
    right: Option<Box<dyn CommChannel>>,
    left_rank: usize,
}

impl SlaveRing {
    /// Connect both neighbour channels. `tag` distinguishes independent
    /// rings in the same run. For a group of size one the ring is a no-op
    /// loopback.
    pub fn connect(tag: &str, rank: usize, size: usize, factory: &ChannelFactory) -> Result<Self> {
        let left_rank = (rank + size - 1) % size;
        let right_rank = (rank + 1) % size;
        if size <= 1 {
            return Ok(Self {
                rank,
                size,
                left: None,
                right: None,
                left_rank,
            });
        }
        let name = |r: usize| format!("{tag}/ring/{r}");
        let mut left = factory.create();
        let mut right = factory.create();
        if rank % 2 == 0 {
            left.accept(&name(rank), &name(left_rank))?;
            right.request(&name(rank), &name(right_rank), rank, 1)?;
        } else {
            right.request(&name(rank), &name(right_rank), rank, 1)?;
            left.accept(&name(rank), &name(left_rank))?;
        }
        Ok(Self {
            rank,
            size,
            left: Some(left),
            right: Some(right),
            left_rank,
        })
    }

    pub fn rank(&self) -> usize {
        self.rank
    }

    pub fn size(&self) -> usize {
        self.size
    }

    /// Pass a message to the right neighbour.
    pub fn send_right(&self, message: Message) -> Result<()> {
        match &self.right {
            Some(right) => right.send(message, 0),
            None => Ok(()), // loopback, nothing to do
        }
    }

    /// Take the next message from the left neighbour.
    pub fn receive_left(&self) -> Result<Message> {
        match &self.left {
            Some(left) => left.receive(self.left_rank),
            None => unreachable!("loopback rings never receive"),
        }
    }

    /// Shift an array one position around the ring: everyone sends theirs to
    /// the right and receives the left neighbour's. Identity for size one.
    pub fn rotate_f64s(&self, values: Vec<f64>, incoming_len: usize) -> Result<Vec<f64>> {
        if self.size <= 1 {
            return Ok(values);
        }
        self.send_right(Message::DoubleArray(values))?;
        match self.receive_left()? {
            Message::DoubleArray(v) if v.len() == incoming_len => Ok(v),
            Message::DoubleArray(v) => Err(crate::error::Error::Protocol(format!(
                "ring block length mismatch: expected {incoming_len}, got {}",
                v.len()
            ))),
            other => Err(crate::error::Error::Protocol(format!(
                "unexpected {} message on ring",
                other.kind()
            ))),
        }
    }

    pub fn close(&mut self) {
        if let Some(mut left) = self.left.take() {
            left.close();
        }
        if let Some(mut right) = self.right.take() {
            right.close();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::com::direct::Hub;
    use std::sync::Arc;
    use std::thread;

    fn ring_of(size: usize) -> Vec<thread::JoinHandle<()>> {
        let hub = Hub::new();
        (0..size)
            .map(|rank| {
                let factory = ChannelFactory::Direct(Arc::clone(&hub));
                thread::spawn(move || {
                    let mut ring = SlaveRing::connect("qn", rank, size, &factory).unwrap();
                    // Rotate each rank's value all the way around.
                    let mut block = vec![rank as f64];
                    for _ in 0..size {
                        block = ring.rotate_f64s(block, 1).unwrap();
                    }
                    assert_eq!(block, vec![rank as f64]);
                    ring.close();
                })
            })
            .collect()
    }

    #[test]
    fn full_rotation_returns_own_block() {
        for size in [2, 3, 5] {
            for h in ring_of(size) {
                h.join().unwrap();
            }
        }
    }

    #[test]
    fn single_rank_ring_is_loopback() {
        let hub = Hub::new();
        let factory = ChannelFactory::Direct(hub);
        let ring = SlaveRing::connect("qn", 0, 1, &factory).unwrap();
        assert_eq!(ring.rotate_f64s(vec![1.0, 2.0], 2).unwrap(), vec![1.0, 2.0]);
    }
}
