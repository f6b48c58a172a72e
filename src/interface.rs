//! The solver-facing facade.
//!
//! One [`CouplingInterface`] per solver process is the single entry point to
//! the library: declare meshes and data, then drive the configured coupling
//! scheme through `initialize` / `advance` / `finalize` while reading and
//! writing field data between the calls.
//!
//! ```no_run
//! use tandem::{CouplingInterface, com::ChannelFactory};
//! # use anyhow::Result;
//!
//! # fn main() -> Result<()> {
//! let factory = ChannelFactory::Sockets("./exchange".into());
//! let mut interface = CouplingInterface::new("Fluid", 0, 1, factory);
//! interface.configure("coupling.xml")?;
//!
//! let mesh = interface.mesh_id("Surface")?;
//! let vertex = interface.set_mesh_vertex(mesh, &[0.0, 0.0])?;
//! let forces = interface.data_id("Forces", mesh)?;
//!
//! let mut dt = interface.initialize()?;
//! while interface.is_coupling_ongoing() {
//!     // solve the own physics for dt, then:
//!     interface.write_vector_data(forces, vertex, &[1.0, 0.0])?;
//!     dt = interface.advance(dt)?;
//! }
//! interface.finalize()?;
//! # Ok(())
//! # }
//! ```

use crate::accel::{
    Acceleration, AitkenRelaxation, ConstantRelaxation, Filter, HierarchicalAitken, Imvj, IqnIls,
    Preconditioner, QnCore, RestartMode, Weighting,
};
use crate::actions;
use crate::com::ChannelFactory;
use crate::com::group::GroupComm;
use crate::config::{
    AccelerationConfig, AccelerationKind, Config, Distribution, FilterKind, MeasureKind,
    PreconditionerKind, RestartKind, SchemeConfig, SchemeKind, Transport, parse_factors,
};
use crate::error::{Error, Result};
use crate::m2n::{DistributionKind, M2N};
use crate::mesh::{DataField, DataId, Mesh, MeshId, VertexId};
use crate::scheme::{
    CompositionalCouplingScheme, ConvergenceMeasure, CouplingData, CouplingMode, CouplingScheme,
    MeasureEntry, MultiCouplingScheme, ParallelCouplingScheme, PartnerLink, SchemeCore,
    SerialCouplingScheme,
};
use std::collections::BTreeMap;
use std::path::PathBuf;
use std::rc::Rc;
use std::sync::Arc;
use tracing::{debug, info};

/// Tolerance for matching queried positions onto declared vertices.
const POSITION_TOLERANCE: f64 = 1e-8;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum State {
    Created,
    Configured,
    Initialized,
    Finalized,
}

/// The per-process facade of the coupling library.
pub struct CouplingInterface {
    participant: String,
    rank: usize,
    size: usize,
    factory: ChannelFactory,
    state: State,
    config: Option<Config>,
    dimensions: usize,
    meshes: Vec<Mesh>,
    fields: BTreeMap<DataId, (MeshId, Rc<DataField>)>,
    scheme: Option<Box<dyn CouplingScheme>>,
}

impl CouplingInterface {
    /// `rank` and `size` describe this participant's process group; a serial
    /// solver passes `0, 1`.
    pub fn new(participant: &str, rank: usize, size: usize, factory: ChannelFactory) -> Self {
        Self {
            participant: participant.to_string(),
            rank,
            size,
            factory,
            state: State::Created,
            config: None,
            dimensions: 0,
            meshes: Vec::new(),
            fields: BTreeMap::new(),
            scheme: None,
        }
    }

    /// Load the configuration and create the declared meshes and fields.
    pub fn configure(&mut self, path: impl AsRef<std::path::Path>) -> Result<()> {
        if self.state != State::Created {
            return Err(Error::usage("configure can only be called once"));
        }
        let config = Config::load(path)?;
        self.apply_config(config)
    }

    /// Like [`configure`](Self::configure), from an in-memory string.
    pub fn configure_from_str(&mut self, text: &str) -> Result<()> {
        if self.state != State::Created {
            return Err(Error::usage("configure can only be called once"));
        }
        let config = Config::parse(text)?;
        self.apply_config(config)
    }

    fn apply_config(&mut self, config: Config) -> Result<()> {
        if !config.participants.iter().any(|p| p.name == self.participant) {
            return Err(Error::config(format!(
                "participant \"{}\" does not appear in the configuration",
                self.participant
            )));
        }
        self.dimensions = config.dimensions;
        let mut next_data_id: DataId = 0;
        for (index, mesh_config) in config.meshes.iter().enumerate() {
            let mut mesh = Mesh::new(index as MeshId, &mesh_config.name, config.dimensions);
            for data in &mesh_config.data {
                let field = mesh.create_data(next_data_id, &data.name, data.dimensions)?;
                self.fields.insert(next_data_id, (mesh.id(), field));
                next_data_id += 1;
            }
            self.meshes.push(mesh);
        }
        self.config = Some(config);
        self.state = State::Configured;
        Ok(())
    }

    pub fn dimensions(&self) -> usize {
        self.dimensions
    }

    // --- mesh declaration ---------------------------------------------------

    pub fn has_mesh(&self, name: &str) -> bool {
        self.meshes.iter().any(|m| m.name() == name)
    }

    pub fn mesh_id(&self, name: &str) -> Result<MeshId> {
        self.meshes
            .iter()
            .find(|m| m.name() == name)
            .map(Mesh::id)
            .ok_or_else(|| Error::usage(format!("unknown mesh \"{name}\"")))
    }

    fn mesh(&self, id: MeshId) -> Result<&Mesh> {
        self.meshes
            .get(id as usize)
            .ok_or_else(|| Error::usage(format!("unknown mesh ID {id}")))
    }

    fn mesh_mut(&mut self, id: MeshId) -> Result<&mut Mesh> {
        if self.state == State::Initialized {
            return Err(Error::usage("the mesh cannot change after initialize"));
        }
        self.meshes
            .get_mut(id as usize)
            .ok_or_else(|| Error::usage(format!("unknown mesh ID {id}")))
    }

    pub fn set_mesh_vertex(&mut self, mesh_id: MeshId, position: &[f64]) -> Result<VertexId> {
        if position.len() != self.dimensions {
            return Err(Error::usage(format!(
                "vertex position has {} coordinates, the coupling runs in {}D",
                position.len(),
                self.dimensions
            )));
        }
        Ok(self.mesh_mut(mesh_id)?.create_vertex(position))
    }

    /// Declare several vertices at once; `positions` is vertex-major.
    pub fn set_mesh_vertices(&mut self, mesh_id: MeshId, positions: &[f64]) -> Result<Vec<VertexId>> {
        let dims = self.dimensions;
        if !positions.len().is_multiple_of(dims) {
            return Err(Error::usage(
                "vertex positions do not divide into coordinate tuples",
            ));
        }
        let mesh = self.mesh_mut(mesh_id)?;
        Ok(positions
            .chunks(dims)
            .map(|chunk| mesh.create_vertex(chunk))
            .collect())
    }

    pub fn mesh_vertex_size(&self, mesh_id: MeshId) -> Result<usize> {
        Ok(self.mesh(mesh_id)?.vertex_count())
    }

    /// Match positions back onto declared vertices; every position must hit
    /// a vertex within a small tolerance.
    pub fn mesh_vertex_ids_from_positions(
        &self,
        mesh_id: MeshId,
        positions: &[f64],
    ) -> Result<Vec<VertexId>> {
        let mesh = self.mesh(mesh_id)?;
        positions
            .chunks(self.dimensions)
            .map(|chunk| {
                mesh.vertex_id_at(chunk, POSITION_TOLERANCE).ok_or_else(|| {
                    Error::usage(format!(
                        "no vertex of mesh \"{}\" at position {chunk:?}",
                        mesh.name()
                    ))
                })
            })
            .collect()
    }

    pub fn set_mesh_edge(&mut self, mesh_id: MeshId, a: VertexId, b: VertexId) -> Result<()> {
        self.mesh_mut(mesh_id)?.add_edge(a, b)
    }

    pub fn set_mesh_triangle(
        &mut self,
        mesh_id: MeshId,
        a: VertexId,
        b: VertexId,
        c: VertexId,
    ) -> Result<()> {
        self.mesh_mut(mesh_id)?.add_triangle([a, b, c])
    }

    /// Triangle declaration that creates the three edges alongside.
    pub fn set_mesh_triangle_with_edges(
        &mut self,
        mesh_id: MeshId,
        a: VertexId,
        b: VertexId,
        c: VertexId,
    ) -> Result<()> {
        let mesh = self.mesh_mut(mesh_id)?;
        mesh.add_edge(a, b)?;
        mesh.add_edge(b, c)?;
        mesh.add_edge(c, a)?;
        mesh.add_triangle([a, b, c])
    }

    pub fn set_mesh_quad(
        &mut self,
        mesh_id: MeshId,
        a: VertexId,
        b: VertexId,
        c: VertexId,
        d: VertexId,
    ) -> Result<()> {
        self.mesh_mut(mesh_id)?.add_quad([a, b, c, d])
    }

    /// Quad declaration that creates the four edges alongside.
    pub fn set_mesh_quad_with_edges(
        &mut self,
        mesh_id: MeshId,
        a: VertexId,
        b: VertexId,
        c: VertexId,
        d: VertexId,
    ) -> Result<()> {
        let mesh = self.mesh_mut(mesh_id)?;
        mesh.add_edge(a, b)?;
        mesh.add_edge(b, c)?;
        mesh.add_edge(c, d)?;
        mesh.add_edge(d, a)?;
        mesh.add_quad([a, b, c, d])
    }

    // --- data access --------------------------------------------------------

    pub fn has_data(&self, name: &str, mesh_id: MeshId) -> bool {
        self.mesh(mesh_id)
            .map(|m| m.data_by_name(name).is_some())
            .unwrap_or(false)
    }

    pub fn data_id(&self, name: &str, mesh_id: MeshId) -> Result<DataId> {
        self.mesh(mesh_id)?
            .data_by_name(name)
            .map(|field| field.id)
            .ok_or_else(|| {
                Error::usage(format!("unknown data \"{name}\" on mesh ID {mesh_id}"))
            })
    }

    fn field(&self, data_id: DataId) -> Result<&Rc<DataField>> {
        self.fields
            .get(&data_id)
            .map(|(_, field)| field)
            .ok_or_else(|| Error::usage(format!("unknown data ID {data_id}")))
    }

    fn check_vertex_entry(&self, field: &DataField, vertex: VertexId) -> Result<usize> {
        let index = usize::try_from(vertex)
            .ok()
            .map(|v| v * field.dimensions)
            .filter(|index| index + field.dimensions <= field.values.borrow().len());
        index.ok_or_else(|| {
            Error::usage(format!(
                "vertex {vertex} is outside data \"{}\"",
                field.name
            ))
        })
    }

    pub fn write_scalar_data(&self, data_id: DataId, vertex: VertexId, value: f64) -> Result<()> {
        let field = self.field(data_id)?;
        if field.dimensions != 1 {
            return Err(Error::usage(format!(
                "data \"{}\" is not scalar",
                field.name
            )));
        }
        let index = self.check_vertex_entry(field, vertex)?;
        field.values.borrow_mut()[index] = value;
        Ok(())
    }

    pub fn read_scalar_data(&self, data_id: DataId, vertex: VertexId) -> Result<f64> {
        let field = self.field(data_id)?;
        if field.dimensions != 1 {
            return Err(Error::usage(format!(
                "data \"{}\" is not scalar",
                field.name
            )));
        }
        let index = self.check_vertex_entry(field, vertex)?;
        Ok(field.values.borrow()[index])
    }

    pub fn write_vector_data(&self, data_id: DataId, vertex: VertexId, value: &[f64]) -> Result<()> {
        let field = self.field(data_id)?;
        if value.len() != field.dimensions {
            return Err(Error::usage(format!(
                "data \"{}\" has {} components, got {}",
                field.name,
                field.dimensions,
                value.len()
            )));
        }
        let index = self.check_vertex_entry(field, vertex)?;
        field.values.borrow_mut().as_mut_slice()[index..index + value.len()]
            .copy_from_slice(value);
        Ok(())
    }

    pub fn read_vector_data(&self, data_id: DataId, vertex: VertexId) -> Result<Vec<f64>> {
        let field = self.field(data_id)?;
        let index = self.check_vertex_entry(field, vertex)?;
        Ok(field.values.borrow().as_slice()[index..index + field.dimensions].to_vec())
    }

    /// Block writes take `(vertex IDs, values)` with the component layout
    /// `(d0x, d0y[, d0z], d1x, ...)`; the z component is omitted in 2-D.
    pub fn write_block_vector_data(
        &self,
        data_id: DataId,
        vertices: &[VertexId],
        values: &[f64],
    ) -> Result<()> {
        let field = self.field(data_id)?;
        if values.len() != vertices.len() * field.dimensions {
            return Err(Error::usage("block size does not match the vertex count"));
        }
        for (i, &vertex) in vertices.iter().enumerate() {
            let index = self.check_vertex_entry(field, vertex)?;
            let dims = field.dimensions;
            field.values.borrow_mut().as_mut_slice()[index..index + dims]
                .copy_from_slice(&values[i * dims..(i + 1) * dims]);
        }
        Ok(())
    }

    pub fn read_block_vector_data(
        &self,
        data_id: DataId,
        vertices: &[VertexId],
    ) -> Result<Vec<f64>> {
        let field = self.field(data_id)?;
        let mut out = Vec::with_capacity(vertices.len() * field.dimensions);
        for &vertex in vertices {
            let index = self.check_vertex_entry(field, vertex)?;
            out.extend_from_slice(
                &field.values.borrow().as_slice()[index..index + field.dimensions],
            );
        }
        Ok(out)
    }

    pub fn write_block_scalar_data(
        &self,
        data_id: DataId,
        vertices: &[VertexId],
        values: &[f64],
    ) -> Result<()> {
        let field = self.field(data_id)?;
        if field.dimensions != 1 {
            return Err(Error::usage(format!(
                "data \"{}\" is not scalar",
                field.name
            )));
        }
        if values.len() != vertices.len() {
            return Err(Error::usage("block size does not match the vertex count"));
        }
        for (&vertex, &value) in vertices.iter().zip(values) {
            let index = self.check_vertex_entry(field, vertex)?;
            field.values.borrow_mut()[index] = value;
        }
        Ok(())
    }

    pub fn read_block_scalar_data(
        &self,
        data_id: DataId,
        vertices: &[VertexId],
    ) -> Result<Vec<f64>> {
        let field = self.field(data_id)?;
        if field.dimensions != 1 {
            return Err(Error::usage(format!(
                "data \"{}\" is not scalar",
                field.name
            )));
        }
        vertices
            .iter()
            .map(|&vertex| {
                let index = self.check_vertex_entry(field, vertex)?;
                Ok(field.values.borrow()[index])
            })
            .collect()
    }

    // --- lifecycle ----------------------------------------------------------

    /// Connect the communication fabric, build the configured coupling
    /// scheme, and perform its initial handshakes. Returns the maximum
    /// length of the first solver step.
    pub fn initialize(&mut self) -> Result<f64> {
        if self.state != State::Configured {
            return Err(Error::usage("initialize requires a configured interface"));
        }
        for mesh in &mut self.meshes {
            mesh.allocate_data_values();
        }
        let group = Arc::new(GroupComm::connect(
            &self.participant,
            self.rank,
            self.size,
            &self.factory,
        )?);

        let config = self.config.take().expect("configured state implies a config");
        let mut schemes = Vec::new();
        for scheme_config in &config.schemes {
            if self.involves_me(scheme_config) {
                schemes.push(self.build_scheme(&config, scheme_config, &group)?);
            }
        }
        self.config = Some(config);
        if schemes.is_empty() {
            return Err(Error::config(format!(
                "participant \"{}\" takes part in no coupling scheme",
                self.participant
            )));
        }
        let mut scheme: Box<dyn CouplingScheme> = if schemes.len() == 1 {
            schemes.pop().unwrap()
        } else {
            let mut composition = CompositionalCouplingScheme::new();
            for sub in schemes {
                composition.add_coupling_scheme(sub);
            }
            Box::new(composition)
        };
        scheme.initialize(0.0, 1)?;
        info!(participant = %self.participant, "coupling initialized");
        let dt = scheme.next_timestep_max_length();
        self.scheme = Some(scheme);
        self.state = State::Initialized;
        Ok(dt)
    }

    /// Exchange configured initial data. Required between `initialize` and
    /// the first `advance` whenever an exchange carries `initialize="true"`.
    pub fn initialize_data(&mut self) -> Result<()> {
        self.scheme_mut()?.initialize_data()
    }

    /// Advance the coupling by the solver's computed time. Returns the
    /// maximum length of the next solver step.
    pub fn advance(&mut self, computed_dt: f64) -> Result<f64> {
        let scheme = self.scheme_mut()?;
        scheme.add_computed_time(computed_dt)?;
        scheme.advance()?;
        Ok(scheme.next_timestep_max_length())
    }

    /// Close every channel. Idempotent after a completed run.
    pub fn finalize(&mut self) -> Result<()> {
        if self.state == State::Finalized {
            return Ok(());
        }
        if let Some(scheme) = self.scheme.as_mut() {
            scheme.finalize()?;
        }
        self.scheme = None;
        self.state = State::Finalized;
        debug!(participant = %self.participant, "coupling finalized");
        Ok(())
    }

    // --- status and actions -------------------------------------------------

    pub fn is_coupling_ongoing(&self) -> bool {
        self.scheme
            .as_ref()
            .map(|s| s.is_coupling_ongoing())
            .unwrap_or(false)
    }

    pub fn is_timestep_complete(&self) -> bool {
        self.scheme
            .as_ref()
            .map(|s| s.is_coupling_timestep_complete())
            .unwrap_or(false)
    }

    pub fn is_read_data_available(&self) -> bool {
        self.scheme
            .as_ref()
            .map(|s| s.has_data_been_exchanged())
            .unwrap_or(false)
    }

    pub fn is_write_data_required(&self, computed_dt: f64) -> bool {
        self.scheme
            .as_ref()
            .map(|s| s.will_data_be_exchanged(computed_dt))
            .unwrap_or(false)
    }

    pub fn is_action_required(&self, action: &str) -> bool {
        self.scheme
            .as_ref()
            .map(|s| s.is_action_required(action))
            .unwrap_or(false)
    }

    pub fn fulfilled_action(&mut self, action: &str) -> Result<()> {
        self.scheme_mut()?.performed_action(action)
    }

    /// Surrogate-model evaluation is not part of this library; solvers
    /// always evaluate their fine model.
    pub fn has_to_evaluate_surrogate_model(&self) -> bool {
        false
    }

    pub fn has_to_evaluate_fine_model(&self) -> bool {
        true
    }

    fn scheme_mut(&mut self) -> Result<&mut Box<dyn CouplingScheme>> {
        if self.state != State::Initialized {
            return Err(Error::usage("the coupling is not initialized"));
        }
        Ok(self.scheme.as_mut().expect("initialized state implies a scheme"))
    }

    // --- scheme construction ------------------------------------------------

    fn involves_me(&self, scheme: &SchemeConfig) -> bool {
        match scheme.kind {
            SchemeKind::Multi => {
                scheme.controller.as_deref() == Some(self.participant.as_str())
                    || scheme
                        .exchanges
                        .iter()
                        .any(|e| e.from == self.participant || e.to == self.participant)
            }
            _ => {
                scheme.first.as_deref() == Some(self.participant.as_str())
                    || scheme.second.as_deref() == Some(self.participant.as_str())
            }
        }
    }

    fn transport_factory(&self, config: &Config, a: &str, b: &str) -> Result<ChannelFactory> {
        let m2n = config
            .m2ns
            .iter()
            .find(|m| (m.from == a && m.to == b) || (m.from == b && m.to == a))
            .ok_or_else(|| {
                Error::config(format!("no m2n configured between \"{a}\" and \"{b}\""))
            })?;
        match m2n.transport {
            Transport::Direct => match &self.factory {
                ChannelFactory::Direct(_) => Ok(self.factory.clone()),
                ChannelFactory::Sockets(_) => Err(Error::config(
                    "the direct transport requires participants launched in one process",
                )),
            },
            Transport::Sockets => {
                let dir = m2n
                    .exchange_directory
                    .clone()
                    .unwrap_or_else(|| ".".to_string());
                Ok(ChannelFactory::Sockets(PathBuf::from(dir)))
            }
        }
    }

    fn distribution_kind(&self, config: &Config, a: &str, b: &str) -> DistributionKind {
        let distribution = config
            .m2ns
            .iter()
            .find(|m| (m.from == a && m.to == b) || (m.from == b && m.to == a))
            .map(|m| m.distribution)
            .unwrap_or(Distribution::GatherScatter);
        match distribution {
            Distribution::GatherScatter => DistributionKind::GatherScatter,
            Distribution::PointToPoint => DistributionKind::PointToPoint,
        }
    }

    /// Wire one M2N link to a peer; the given side accepts.
    fn connect_m2n(
        &self,
        config: &Config,
        peer: &str,
        accept: bool,
        mesh_ids: &[MeshId],
        group: &Arc<GroupComm>,
    ) -> Result<M2N> {
        let factory = self.transport_factory(config, &self.participant, peer)?;
        let kind = self.distribution_kind(config, &self.participant, peer);
        let mut m2n = M2N::new(&self.participant, peer, kind, Arc::clone(group), factory);
        if accept {
            m2n.accept_master_connection()?;
        } else {
            m2n.request_master_connection()?;
        }
        for &mesh_id in mesh_ids {
            let count = self.mesh(mesh_id)?.vertex_count();
            m2n.register_mesh(mesh_id, count)?;
        }
        if accept {
            m2n.accept_slaves_connection()?;
        } else {
            m2n.request_slaves_connection()?;
        }
        Ok(m2n)
    }

    fn resolve_field(&self, mesh_name: &str, data_name: &str) -> Result<(MeshId, Rc<DataField>)> {
        let mesh = self
            .meshes
            .iter()
            .find(|m| m.name() == mesh_name)
            .ok_or_else(|| Error::config(format!("unknown mesh \"{mesh_name}\"")))?;
        let field = mesh
            .data_by_name(data_name)
            .ok_or_else(|| {
                Error::config(format!("mesh \"{mesh_name}\" carries no data \"{data_name}\""))
            })?;
        Ok((mesh.id(), field))
    }

    fn build_measures(&self, scheme_config: &SchemeConfig) -> Result<Vec<MeasureEntry>> {
        let mut entries = Vec::new();
        for measure in &scheme_config.measures {
            // The measure references the data by name; resolve it through
            // the exchanges of this scheme.
            let exchange = scheme_config
                .exchanges
                .iter()
                .find(|e| e.data == measure.data)
                .ok_or_else(|| {
                    Error::config(format!(
                        "convergence measure references data \"{}\" which this scheme \
                         does not exchange",
                        measure.data
                    ))
                })?;
            let (_, field) = self.resolve_field(&exchange.mesh, &measure.data)?;
            let kind = match measure.measure {
                MeasureKind::Absolute => ConvergenceMeasure::Absolute {
                    limit: measure.limit.unwrap_or(0.0),
                },
                MeasureKind::Relative => ConvergenceMeasure::Relative {
                    limit: measure.limit.unwrap_or(0.0),
                },
                MeasureKind::ResidualRelative => ConvergenceMeasure::ResidualRelative {
                    limit: measure.limit.unwrap_or(0.0),
                },
                MeasureKind::MinIterations => ConvergenceMeasure::MinIterations {
                    count: measure.min_iterations.unwrap_or(1),
                },
            };
            entries.push(MeasureEntry::new(field.id, measure.suffices, kind));
        }
        Ok(entries)
    }

    fn build_acceleration(
        &self,
        acceleration: &AccelerationConfig,
        group: &Arc<GroupComm>,
    ) -> Result<Acceleration> {
        let mut data_ids = Vec::new();
        for entry in &acceleration.data {
            let (_, field) = self.resolve_field(&entry.mesh, &entry.name)?;
            data_ids.push(field.id);
        }
        let omega = acceleration.initial_relaxation.unwrap_or(0.1);
        let built = match acceleration.kind {
            AccelerationKind::ConstantRelaxation => {
                Acceleration::Constant(ConstantRelaxation::new(omega, data_ids)?)
            }
            AccelerationKind::Aitken => Acceleration::Aitken(AitkenRelaxation::new(
                omega,
                data_ids,
                Arc::clone(group),
            )?),
            AccelerationKind::HierarchicalAitken => {
                Acceleration::HierarchicalAitken(HierarchicalAitken::new(omega, data_ids)?)
            }
            AccelerationKind::IqnIls | AccelerationKind::Imvj => {
                let weighting = match acceleration.preconditioner.as_ref() {
                    None => Weighting::ResidualSum,
                    Some(p) => match p.kind {
                        PreconditionerKind::Constant => Weighting::Constant {
                            factors: parse_factors(p.factors.as_deref().unwrap_or("1.0"))?,
                        },
                        PreconditionerKind::Value => Weighting::Value,
                        PreconditionerKind::Residual => Weighting::Residual,
                        PreconditionerKind::ResidualSum => Weighting::ResidualSum,
                    },
                };
                let max_non_const = acceleration
                    .preconditioner
                    .as_ref()
                    .map(|p| p.max_non_const_timesteps)
                    .unwrap_or(-1);
                let preconditioner =
                    Preconditioner::new(weighting, max_non_const, Arc::clone(group));
                let filter = match acceleration.filter.unwrap_or(FilterKind::NoFilter) {
                    FilterKind::NoFilter => Filter::None,
                    FilterKind::Qr1 => Filter::Qr1,
                    FilterKind::Qr2 => Filter::Qr2,
                };
                let core = QnCore::new(
                    omega,
                    acceleration.force_initial_relaxation,
                    acceleration.max_used_iterations.unwrap_or(50),
                    acceleration.timesteps_reused.unwrap_or(0),
                    filter,
                    acceleration.singularity_limit.unwrap_or(1e-16),
                    data_ids,
                    preconditioner,
                    Arc::clone(group),
                )?;
                if acceleration.kind == AccelerationKind::IqnIls {
                    Acceleration::IqnIls(IqnIls::new(core))
                } else {
                    let restart = match acceleration
                        .imvj_restart_type
                        .unwrap_or(RestartKind::NoRestart)
                    {
                        RestartKind::NoRestart => RestartMode::NoRestart,
                        RestartKind::Zero => RestartMode::Zero,
                        RestartKind::LeastSquares => RestartMode::LeastSquares,
                        RestartKind::Svd => RestartMode::Svd,
                        RestartKind::Slide => RestartMode::Slide,
                    };
                    Acceleration::Imvj(Imvj::new(
                        core,
                        acceleration.always_build_jacobian,
                        restart,
                        acceleration.chunk_size.unwrap_or(8),
                        acceleration.rsls_reused_timesteps.unwrap_or(8),
                        acceleration.svd_truncation_eps.unwrap_or(0.0),
                        Some(self.factory.clone()),
                    )?)
                }
            }
        };
        Ok(built)
    }

    fn build_scheme(
        &self,
        config: &Config,
        scheme_config: &SchemeConfig,
        group: &Arc<GroupComm>,
    ) -> Result<Box<dyn CouplingScheme>> {
        if scheme_config.kind == SchemeKind::Multi {
            return self.build_multi_scheme(config, scheme_config, group);
        }
        let first = scheme_config.first.as_deref().expect("validated");
        let second = scheme_config.second.as_deref().expect("validated");
        let peer = if self.participant == first { second } else { first };
        let accept = self.participant == second;

        let mut mesh_ids: Vec<MeshId> = Vec::new();
        for exchange in &scheme_config.exchanges {
            let (mesh_id, _) = self.resolve_field(&exchange.mesh, &exchange.data)?;
            if !mesh_ids.contains(&mesh_id) {
                mesh_ids.push(mesh_id);
            }
        }
        let m2n = self.connect_m2n(config, peer, accept, &mesh_ids, group)?;

        let mode = if scheme_config.kind.is_implicit() {
            CouplingMode::Implicit
        } else {
            CouplingMode::Explicit
        };
        let mut core = SchemeCore::new(
            scheme_config.max_time.unwrap_or(f64::INFINITY),
            scheme_config.max_timesteps.unwrap_or(usize::MAX),
            scheme_config.timestep_length,
            first,
            second,
            &self.participant,
            m2n,
            mode,
            scheme_config.max_iterations,
            Arc::clone(group),
        )?;
        core.extrapolation_order = scheme_config.extrapolation_order;

        for exchange in &scheme_config.exchanges {
            let (mesh_id, field) = self.resolve_field(&exchange.mesh, &exchange.data)?;
            let data = CouplingData::new(
                Rc::clone(&field.values),
                field.dimensions,
                exchange.initialize,
            );
            if exchange.from == self.participant {
                core.add_data_to_send(data, field.id, mesh_id);
            } else if exchange.to == self.participant {
                core.add_data_to_receive(data, field.id, mesh_id);
            } else {
                return Err(Error::config(format!(
                    "exchange of \"{}\" involves neither scheme participant",
                    exchange.data
                )));
            }
        }

        if core.is_controller() {
            for entry in self.build_measures(scheme_config)? {
                core.add_convergence_measure(entry);
            }
            if let Some(acceleration) = &scheme_config.acceleration {
                core.set_acceleration(self.build_acceleration(acceleration, group)?);
            }
        }

        Ok(match scheme_config.kind {
            SchemeKind::SerialExplicit | SchemeKind::SerialImplicit => {
                Box::new(SerialCouplingScheme::new(core))
            }
            _ => Box::new(ParallelCouplingScheme::new(core)),
        })
    }

    fn build_multi_scheme(
        &self,
        config: &Config,
        scheme_config: &SchemeConfig,
        group: &Arc<GroupComm>,
    ) -> Result<Box<dyn CouplingScheme>> {
        let controller = scheme_config.controller.as_deref().expect("validated");
        let is_controller = controller == self.participant;

        // Partners in first-appearance order of the exchanges.
        let mut partners: Vec<&str> = Vec::new();
        for exchange in &scheme_config.exchanges {
            for name in [exchange.from.as_str(), exchange.to.as_str()] {
                if name != controller && !partners.contains(&name) {
                    partners.push(name);
                }
            }
        }

        let mut core = SchemeCore::new_multi(
            scheme_config.max_time.unwrap_or(f64::INFINITY),
            scheme_config.max_timesteps.unwrap_or(usize::MAX),
            scheme_config.timestep_length,
            &self.participant,
            is_controller,
            scheme_config.max_iterations,
            Arc::clone(group),
        )?;
        core.extrapolation_order = scheme_config.extrapolation_order;
        if is_controller {
            for entry in self.build_measures(scheme_config)? {
                core.add_convergence_measure(entry);
            }
            if let Some(acceleration) = &scheme_config.acceleration {
                core.set_acceleration(self.build_acceleration(acceleration, group)?);
            }
        }

        let link_peers: Vec<&str> = if is_controller {
            partners.clone()
        } else {
            vec![controller]
        };
        let mut links = Vec::new();
        let mut link_index = BTreeMap::new();
        for peer in &link_peers {
            // Both endpoints of a link must register the same mesh set: the
            // meshes of the exchanges between exactly this pair.
            let me = self.participant.as_str();
            let pair_of = |e: &crate::config::ExchangeConfig| {
                (e.from == *peer && e.to == me) || (e.to == *peer && e.from == me)
            };
            let mut mesh_ids: Vec<MeshId> = Vec::new();
            for exchange in scheme_config.exchanges.iter().filter(|e| pair_of(e)) {
                let (mesh_id, _) = self.resolve_field(&exchange.mesh, &exchange.data)?;
                if !mesh_ids.contains(&mesh_id) {
                    mesh_ids.push(mesh_id);
                }
            }
            let m2n = self.connect_m2n(config, peer, is_controller, &mesh_ids, group)?;
            link_index.insert(peer.to_string(), links.len());
            links.push(PartnerLink::new(m2n));
        }

        let mut scheme = MultiCouplingScheme::new(core, links, is_controller)?;
        for exchange in &scheme_config.exchanges {
            if exchange.from != self.participant && exchange.to != self.participant {
                continue;
            }
            let peer = if exchange.from == self.participant {
                &exchange.to
            } else {
                &exchange.from
            };
            let link = if is_controller {
                *link_index.get(peer).ok_or_else(|| {
                    Error::config(format!("no link to participant \"{peer}\""))
                })?
            } else {
                0
            };
            let (mesh_id, field) = self.resolve_field(&exchange.mesh, &exchange.data)?;
            let data = CouplingData::new(
                Rc::clone(&field.values),
                field.dimensions,
                exchange.initialize,
            );
            if exchange.from == self.participant {
                scheme.add_data_to_send(link, data, field.id, mesh_id);
            } else {
                scheme.add_data_to_receive(link, data, field.id, mesh_id);
            }
        }
        Ok(Box::new(scheme))
    }
}

/// Re-exported action names for solver loops.
pub use actions::{READ_ITERATION_CHECKPOINT, WRITE_INITIAL_DATA, WRITE_ITERATION_CHECKPOINT};
