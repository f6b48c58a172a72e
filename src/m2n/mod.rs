//! The many-to-many channel between two participant groups.
//!
//! An [`M2N`] wraps one master-to-master [`CommChannel`] for control traffic
//! and a distributed data path for the vertex-indexed field data. The data
//! path is either
//!
//! - **gather-scatter**: every rank funnels its block through its group's
//!   master, and the master channel carries the concatenated vector in
//!   global vertex order, or
//! - **point-to-point**: every rank holds direct channels to exactly the
//!   peer ranks whose vertex ranges overlap its own.
//!
//! Lifecycle: created disconnected; one side accepts, the other requests;
//! `close` releases everything. Data sends and receives are collective over
//! the local group and totally ordered per endpoint.

mod gather_scatter;
mod point_to_point;

pub use gather_scatter::GatherScatter;
pub use point_to_point::PointToPoint;

use crate::com::group::GroupComm;
use crate::com::{ChannelFactory, CommChannel};
use crate::error::{Error, Result};
use crate::mesh::MeshId;
use std::collections::BTreeMap;
use std::sync::Arc;
use tracing::debug;

/// Which distributed data path an M2N uses.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum DistributionKind {
    GatherScatter,
    PointToPoint,
}

enum MeshTransport {
    GatherScatter(GatherScatter),
    PointToPoint(PointToPoint),
}

/// A logical link between the local participant group and a peer group.
pub struct M2N {
    group: Arc<GroupComm>,
    factory: ChannelFactory,
    local_name: String,
    peer_name: String,
    kind: DistributionKind,
    /// Master-to-master channel; present on the master rank once connected.
    master: Option<Box<dyn CommChannel>>,
    meshes: BTreeMap<MeshId, MeshTransport>,
    connected: bool,
}

impl M2N {
    pub fn new(
        local_name: &str,
        peer_name: &str,
        kind: DistributionKind,
        group: Arc<GroupComm>,
        factory: ChannelFactory,
    ) -> Self {
        Self {
            group,
            factory,
            local_name: local_name.to_string(),
            peer_name: peer_name.to_string(),
            kind,
            master: None,
            meshes: BTreeMap::new(),
            connected: false,
        }
    }

    fn endpoint_name(a: &str, b: &str) -> String {
        format!("m2n:{a}:{b}")
    }

    /// Accept the master-to-master link. Collective over the local group;
    /// only the master rank opens a channel.
    pub fn accept_master_connection(&mut self) -> Result<()> {
        if self.connected {
            return Err(Error::usage("M2N is already connected"));
        }

        if self.group.is_master() {
            let mut channel = self.factory.create();
            channel.accept(
                &Self::endpoint_name(&self.local_name, &self.peer_name),
                &Self::endpoint_name(&self.peer_name, &self.local_name),
            )?;
            self.master = Some(channel);
        }
        self.connected = true;
        debug!(local = %self.local_name, peer = %self.peer_name, "M2N master link accepted");
        Ok(())
    }

    /// Request the master-to-master link. Collective over the local group.
    pub fn request_master_connection(&mut self) -> Result<()> {
        if self.connected {
            return Err(Error::usage("M2N is already connected"));
        }

        if self.group.is_master() {
            let mut channel = self.factory.create();
            channel.request(
                &Self::endpoint_name(&self.local_name, &self.peer_name),
                &Self::endpoint_name(&self.peer_name, &self.local_name),
                0,
                1,
            )?;
            self.master = Some(channel);
        }
        self.connected = true;
        debug!(local = %self.local_name, peer = %self.peer_name, "M2N master link requested");
        Ok(())
    }

    /// Register an interface mesh on this link. Must be called on every rank
    /// (collective) before the slaves connection is established.
    pub fn register_mesh(&mut self, mesh_id: MeshId, local_vertex_count: usize) -> Result<()> {
        let offsets = self.group.offsets(local_vertex_count)?;
        let transport = match self.kind {
            DistributionKind::GatherScatter => {
                MeshTransport::GatherScatter(GatherScatter::new(offsets))
            }
            DistributionKind::PointToPoint => {
                MeshTransport::PointToPoint(PointToPoint::new(offsets))
            }
        };
        self.meshes.insert(mesh_id, transport);
        Ok(())
    }

    /// Establish the distributed data path, accepting side. Collective.
    pub fn accept_slaves_connection(&mut self) -> Result<()> {
        self.connect_slaves(true)
    }

    /// Establish the distributed data path, requesting side. Collective.
    pub fn request_slaves_connection(&mut self) -> Result<()> {
        self.connect_slaves(false)
    }

    fn connect_slaves(&mut self, acceptor: bool) -> Result<()> {
        if !self.connected {
            return Err(Error::usage(
                "slaves connection requires an established master connection",
            ));
        }
        for (mesh_id, transport) in self.meshes.iter_mut() {
            match transport {
                // Gather-scatter rides on the master channel; nothing to open.
                MeshTransport::GatherScatter(_) => {}
                MeshTransport::PointToPoint(p2p) => p2p.connect(
                    *mesh_id,
                    acceptor,
                    &self.local_name,
                    &self.peer_name,
                    &self.group,
                    self.master.as_deref(),
                    &self.factory,
                )?,
            }
        }
        Ok(())
    }

    pub fn is_connected(&self) -> bool {
        self.connected
    }

    /// Send this rank's block of a field. Collective over the local group;
    /// the matched receive on the peer side sees global vertex order.
    pub fn send(&self, values: &[f64], mesh_id: MeshId, data_dimensions: usize) -> Result<()> {
        match self.mesh(mesh_id)? {
            MeshTransport::GatherScatter(gs) => gs.send(
                values,
                data_dimensions,
                &self.group,
                self.master.as_deref(),
            ),
            MeshTransport::PointToPoint(p2p) => p2p.send(values, data_dimensions),
        }
    }

    /// Receive this rank's block of a field. Collective over the local group.
    pub fn receive(
        &self,
        values: &mut [f64],
        mesh_id: MeshId,
        data_dimensions: usize,
    ) -> Result<()> {
        match self.mesh(mesh_id)? {
            MeshTransport::GatherScatter(gs) => gs.receive(
                values,
                data_dimensions,
                &self.group,
                self.master.as_deref(),
            ),
            MeshTransport::PointToPoint(p2p) => p2p.receive(values, data_dimensions),
        }
    }

    /// Control-path scalar exchange, master rank only. Schemes broadcast the
    /// result through their group coordinator.
    pub fn send_bool(&self, value: bool) -> Result<()> {
        self.master_channel()?.send_bool(value, 0)
    }

    pub fn receive_bool(&self) -> Result<bool> {
        self.master_channel()?.receive_bool(0)
    }

    pub fn send_f64(&self, value: f64) -> Result<()> {
        self.master_channel()?.send_f64(value, 0)
    }

    pub fn receive_f64(&self) -> Result<f64> {
        self.master_channel()?.receive_f64(0)
    }

    fn master_channel(&self) -> Result<&dyn CommChannel> {
        self.master
            .as_deref()
            .ok_or_else(|| Error::usage("control traffic goes through the master rank only"))
    }

    fn mesh(&self, mesh_id: MeshId) -> Result<&MeshTransport> {
        self.meshes
            .get(&mesh_id)
            .ok_or_else(|| Error::usage(format!("mesh {mesh_id} is not registered on this M2N")))
    }

    /// Release all channels. Idempotent.
    pub fn close(&mut self) {
        if let Some(master) = self.master.as_mut() {
            master.close();
        }
        self.master = None;
        for transport in self.meshes.values_mut() {
            if let MeshTransport::PointToPoint(p2p) = transport {
                p2p.close();
            }
        }
        self.connected = false;
    }
}

impl Drop for M2N {
    fn drop(&mut self) {
        debug_assert!(
            !self.connected || std::thread::panicking(),
            "M2N dropped while still connected; call close or finalize first"
        );
    }
}
