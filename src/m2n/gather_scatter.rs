//! Gather-scatter data path: all field data funnels through the two masters.

use crate::com::CommChannel;
use crate::com::group::GroupComm;
use crate::error::{Error, Result};

/// Vertex data exchange over the master-to-master channel.
///
/// The sending group gathers every rank's block at its master in rank order
/// (which is global vertex order), the master ships one concatenated vector,
/// and the receiving master scatters it back out. Ranks with zero vertices
/// contribute and receive empty blocks.
pub struct GatherScatter {
    /// Prefix-sum vertex offsets of the local group, length `size + 1`.
    offsets: Vec<usize>,
}

impl GatherScatter {
    pub fn new(offsets: Vec<usize>) -> Self {
        Self { offsets }
    }

    fn check_local_len(&self, len: usize, dims: usize, group: &GroupComm) -> Result<()> {
        let local = (self.offsets[group.rank() + 1] - self.offsets[group.rank()]) * dims;
        if len != local {
            return Err(Error::usage(format!(
                "field block has {len} entries, expected {local}"
            )));
        }
        Ok(())
    }

    pub fn send(
        &self,
        values: &[f64],
        dims: usize,
        group: &GroupComm,
        master: Option<&dyn CommChannel>,
    ) -> Result<()> {
        self.check_local_len(values.len(), dims, group)?;
        let all = group.gather_f64s(values)?;
        if group.is_master() {
            let channel =
                master.ok_or_else(|| Error::usage("master rank without master channel"))?;
            channel.send_f64s(&all, 0)?;
        }
        Ok(())
    }

    pub fn receive(
        &self,
        values: &mut [f64],
        dims: usize,
        group: &GroupComm,
        master: Option<&dyn CommChannel>,
    ) -> Result<()> {
        self.check_local_len(values.len(), dims, group)?;
        let total = self.offsets[group.size()] * dims;
        let all = if group.is_master() {
            let channel =
                master.ok_or_else(|| Error::usage("master rank without master channel"))?;
            channel.receive_f64s(total, 0)?
        } else {
            Vec::new()
        };
        let counts: Vec<usize> = (0..group.size())
            .map(|r| (self.offsets[r + 1] - self.offsets[r]) * dims)
            .collect();
        let own = group.scatter_f64s(&all, &counts)?;
        values.copy_from_slice(&own);
        Ok(())
    }
}
