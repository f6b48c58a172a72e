//! Point-to-point data path: every rank talks directly to the peer ranks
//! that own overlapping vertex ranges.
//!
//! Global vertex indices are the rank-concatenation order of each group, so
//! a rank's ownership is one contiguous interval and the overlap with any
//! peer rank is an interval intersection. The two masters swap the offset
//! maps, each group broadcasts the peer map internally, and then each rank
//! opens one channel per overlapping peer.

use crate::com::group::GroupComm;
use crate::com::{ChannelFactory, CommChannel};
use crate::error::{Error, Result};
use crate::mesh::MeshId;
use tracing::debug;

struct Link {
    remote_rank: usize,
    /// First overlapped vertex, as an index into this rank's local block.
    local_start: usize,
    /// Overlap length in vertices.
    len: usize,
    channel: Box<dyn CommChannel>,
}

/// Direct per-rank channels for one mesh.
pub struct PointToPoint {
    offsets: Vec<usize>,
    links: Vec<Link>,
}

impl PointToPoint {
    pub fn new(offsets: Vec<usize>) -> Self {
        Self {
            offsets,
            links: Vec::new(),
        }
    }

    #[allow(clippy::too_many_arguments)]
    pub fn connect(
        &mut self,
        mesh_id: MeshId,
        acceptor: bool,
        local_name: &str,
        peer_name: &str,
        group: &GroupComm,
        master: Option<&dyn CommChannel>,
        factory: &ChannelFactory,
    ) -> Result<()> {
        // Swap offset maps master-to-master, acceptor sends first, then
        // fan the peer map out to the local group.
        let own: Vec<i64> = self.offsets.iter().map(|&o| o as i64).collect();
        let remote = if group.is_master() {
            let channel =
                master.ok_or_else(|| Error::usage("master rank without master channel"))?;
            let remote;
            if acceptor {
                channel.send_i64(own.len() as i64, 0)?;
                channel.send_i64s(&own, 0)?;
                let n = channel.receive_i64(0)? as usize;
                remote = channel.receive_i64s(n, 0)?;
            } else {
                let n = channel.receive_i64(0)? as usize;
                remote = channel.receive_i64s(n, 0)?;
                channel.send_i64(own.len() as i64, 0)?;
                channel.send_i64s(&own, 0)?;
            }
            remote
        } else {
            Vec::new()
        };
        let n = group.broadcast_i64(remote.len() as i64)? as usize;
        let mut padded = remote;
        padded.resize(n, 0);
        let remote: Vec<usize> = group
            .broadcast_i64s(padded)?
            .into_iter()
            .map(|o| o as usize)
            .collect();

        // One channel per peer rank with a non-empty interval intersection.
        let rank = group.rank();
        let (my_lo, my_hi) = (self.offsets[rank], self.offsets[rank + 1]);
        let (acc_name, req_name) = if acceptor {
            (local_name, peer_name)
        } else {
            (peer_name, local_name)
        };
        for q in 0..remote.len().saturating_sub(1) {
            let lo = my_lo.max(remote[q]);
            let hi = my_hi.min(remote[q + 1]);
            if lo >= hi {
                continue;
            }
            let (acc_rank, req_rank) = if acceptor { (rank, q) } else { (q, rank) };
            let acc_endpoint = format!("p2p:{acc_name}:{req_name}:mesh{mesh_id}:a{acc_rank}:q{req_rank}");
            let req_endpoint = format!("p2p:{req_name}:{acc_name}:mesh{mesh_id}:q{req_rank}:a{acc_rank}");
            let mut channel = factory.create();
            if acceptor {
                channel.accept(&acc_endpoint, &req_endpoint)?;
            } else {
                channel.request(&req_endpoint, &acc_endpoint, 0, 1)?;
            }
            debug!(mesh = mesh_id, rank, peer = q, overlap = hi - lo, "point-to-point link up");
            self.links.push(Link {
                remote_rank: q,
                local_start: lo - my_lo,
                len: hi - lo,
                channel,
            });
        }
        self.links.sort_by_key(|l| l.remote_rank);
        Ok(())
    }

    pub fn send(&self, values: &[f64], dims: usize) -> Result<()> {
        for link in &self.links {
            let lo = link.local_start * dims;
            let hi = lo + link.len * dims;
            link.channel.send_f64s(&values[lo..hi], 0)?;
        }
        Ok(())
    }

    pub fn receive(&self, values: &mut [f64], dims: usize) -> Result<()> {
        for link in &self.links {
            let lo = link.local_start * dims;
            let hi = lo + link.len * dims;
            let block = link.channel.receive_f64s(hi - lo, 0)?;
            values[lo..hi].copy_from_slice(&block);
        }
        Ok(())
    }

    pub fn close(&mut self) {
        for link in &mut self.links {
            link.channel.close();
        }
        self.links.clear();
    }
}
