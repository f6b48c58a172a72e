//! The configuration surface.
//!
//! A coupled run is described by one XML file shared by all participants:
//! who participates, which meshes and fields exist, how the participant
//! groups connect, and which coupling schemes with which acceleration and
//! convergence settings drive the run. Parsing uses serde through
//! `quick-xml`; everything beyond shape (value domains, cross references,
//! contradictory options) is rejected by [`Config::validate`] with a
//! configuration error.
//!
//! ```xml
//! <coupling dimensions="2">
//!   <participant name="Fluid"/>
//!   <participant name="Structure"/>
//!   <mesh name="Surface">
//!     <data name="Forces" dimensions="2"/>
//!     <data name="Displacements" dimensions="2"/>
//!   </mesh>
//!   <m2n from="Fluid" to="Structure" transport="sockets" distribution="gather-scatter"/>
//!   <scheme type="serial-implicit" first="Fluid" second="Structure"
//!           max-timesteps="10" timestep-length="0.1" max-iterations="30">
//!     <exchange data="Forces" mesh="Surface" from="Fluid" to="Structure"/>
//!     <exchange data="Displacements" mesh="Surface" from="Structure" to="Fluid"/>
//!     <convergence-measure data="Displacements" measure="relative" limit="1e-4"/>
//!     <acceleration type="IQN-ILS" initial-relaxation="0.1"
//!                   max-used-iterations="50" timesteps-reused="8"
//!                   filter="QR1" singularity-limit="1e-10">
//!       <acceleration-data name="Displacements" mesh="Surface"/>
//!       <preconditioner type="residual-sum"/>
//!     </acceleration>
//!   </scheme>
//! </coupling>
//! ```

use crate::error::{Error, Result};
use serde::Deserialize;
use std::path::Path;

fn default_one() -> usize {
    1
}

fn default_max_iterations() -> usize {
    100
}

fn default_minus_one() -> i64 {
    -1
}

#[derive(Debug, Deserialize)]
#[serde(rename = "coupling", deny_unknown_fields)]
pub struct Config {
    #[serde(rename = "@dimensions")]
    pub dimensions: usize,
    #[serde(rename = "participant", default)]
    pub participants: Vec<ParticipantConfig>,
    #[serde(rename = "mesh", default)]
    pub meshes: Vec<MeshConfig>,
    #[serde(rename = "m2n", default)]
    pub m2ns: Vec<M2nConfig>,
    #[serde(rename = "scheme", default)]
    pub schemes: Vec<SchemeConfig>,
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ParticipantConfig {
    #[serde(rename = "@name")]
    pub name: String,
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct MeshConfig {
    #[serde(rename = "@name")]
    pub name: String,
    #[serde(rename = "data", default)]
    pub data: Vec<DataConfig>,
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct DataConfig {
    #[serde(rename = "@name")]
    pub name: String,
    /// Components per vertex; 1 for scalar fields.
    #[serde(rename = "@dimensions", default = "default_one")]
    pub dimensions: usize,
}

#[derive(Clone, Copy, Debug, Deserialize, PartialEq, Eq)]
pub enum Transport {
    /// In-process rendezvous; all participants share one launcher.
    #[serde(rename = "direct")]
    Direct,
    /// TCP with address publication in an exchange directory.
    #[serde(rename = "sockets")]
    Sockets,
}

#[derive(Clone, Copy, Debug, Deserialize, PartialEq, Eq)]
pub enum Distribution {
    #[serde(rename = "gather-scatter")]
    GatherScatter,
    #[serde(rename = "point-to-point")]
    PointToPoint,
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct M2nConfig {
    #[serde(rename = "@from")]
    pub from: String,
    #[serde(rename = "@to")]
    pub to: String,
    #[serde(rename = "@transport", default = "default_transport")]
    pub transport: Transport,
    #[serde(rename = "@distribution", default = "default_distribution")]
    pub distribution: Distribution,
    /// Exchange directory for the sockets transport.
    #[serde(rename = "@exchange-directory", default)]
    pub exchange_directory: Option<String>,
}

fn default_transport() -> Transport {
    Transport::Sockets
}

fn default_distribution() -> Distribution {
    Distribution::GatherScatter
}

#[derive(Clone, Copy, Debug, Deserialize, PartialEq, Eq)]
pub enum SchemeKind {
    #[serde(rename = "serial-explicit")]
    SerialExplicit,
    #[serde(rename = "serial-implicit")]
    SerialImplicit,
    #[serde(rename = "parallel-explicit")]
    ParallelExplicit,
    #[serde(rename = "parallel-implicit")]
    ParallelImplicit,
    #[serde(rename = "multi")]
    Multi,
}

impl SchemeKind {
    pub fn is_implicit(self) -> bool {
        !matches!(self, SchemeKind::SerialExplicit | SchemeKind::ParallelExplicit)
    }
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct SchemeConfig {
    #[serde(rename = "@type")]
    pub kind: SchemeKind,
    /// First participant for two-party schemes; unused for `multi`.
    #[serde(rename = "@first", default)]
    pub first: Option<String>,
    /// Second participant (the controller) for two-party schemes.
    #[serde(rename = "@second", default)]
    pub second: Option<String>,
    /// Controller participant of a `multi` scheme.
    #[serde(rename = "@controller", default)]
    pub controller: Option<String>,
    #[serde(rename = "@max-time", default)]
    pub max_time: Option<f64>,
    #[serde(rename = "@max-timesteps", default)]
    pub max_timesteps: Option<usize>,
    #[serde(rename = "@timestep-length")]
    pub timestep_length: f64,
    #[serde(rename = "@max-iterations", default = "default_max_iterations")]
    pub max_iterations: usize,
    #[serde(rename = "@extrapolation-order", default)]
    pub extrapolation_order: usize,
    #[serde(rename = "exchange", default)]
    pub exchanges: Vec<ExchangeConfig>,
    #[serde(rename = "convergence-measure", default)]
    pub measures: Vec<MeasureConfig>,
    #[serde(rename = "acceleration", default)]
    pub acceleration: Option<AccelerationConfig>,
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ExchangeConfig {
    #[serde(rename = "@data")]
    pub data: String,
    #[serde(rename = "@mesh")]
    pub mesh: String,
    #[serde(rename = "@from")]
    pub from: String,
    #[serde(rename = "@to")]
    pub to: String,
    #[serde(rename = "@initialize", default)]
    pub initialize: bool,
}

#[derive(Clone, Copy, Debug, Deserialize, PartialEq, Eq)]
pub enum MeasureKind {
    #[serde(rename = "absolute")]
    Absolute,
    #[serde(rename = "relative")]
    Relative,
    #[serde(rename = "residual-relative")]
    ResidualRelative,
    #[serde(rename = "min-iterations")]
    MinIterations,
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct MeasureConfig {
    #[serde(rename = "@data")]
    pub data: String,
    #[serde(rename = "@measure")]
    pub measure: MeasureKind,
    #[serde(rename = "@limit", default)]
    pub limit: Option<f64>,
    #[serde(rename = "@min-iterations", default)]
    pub min_iterations: Option<usize>,
    #[serde(rename = "@suffices", default)]
    pub suffices: bool,
}

#[derive(Clone, Copy, Debug, Deserialize, PartialEq, Eq)]
pub enum AccelerationKind {
    #[serde(rename = "constant-relaxation")]
    ConstantRelaxation,
    #[serde(rename = "aitken")]
    Aitken,
    #[serde(rename = "hierarchical-aitken")]
    HierarchicalAitken,
    #[serde(rename = "IQN-ILS")]
    IqnIls,
    #[serde(rename = "IQN-IMVJ")]
    Imvj,
}

#[derive(Clone, Copy, Debug, Deserialize, PartialEq, Eq)]
pub enum FilterKind {
    #[serde(rename = "NO_FILTER")]
    NoFilter,
    #[serde(rename = "QR1")]
    Qr1,
    #[serde(rename = "QR2")]
    Qr2,
}

#[derive(Clone, Copy, Debug, Deserialize, PartialEq, Eq)]
pub enum RestartKind {
    #[serde(rename = "NO_RESTART")]
    NoRestart,
    #[serde(rename = "RS_ZERO")]
    Zero,
    #[serde(rename = "RS_LS")]
    LeastSquares,
    #[serde(rename = "RS_SVD")]
    Svd,
    #[serde(rename = "RS_SLIDE")]
    Slide,
}

#[derive(Clone, Copy, Debug, Deserialize, PartialEq, Eq)]
pub enum PreconditionerKind {
    #[serde(rename = "constant")]
    Constant,
    #[serde(rename = "value")]
    Value,
    #[serde(rename = "residual")]
    Residual,
    #[serde(rename = "residual-sum")]
    ResidualSum,
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct PreconditionerConfig {
    #[serde(rename = "@type")]
    pub kind: PreconditionerKind,
    /// One factor per accelerated field, constant weighting only.
    #[serde(rename = "@factors", default)]
    pub factors: Option<String>,
    /// -1 keeps the weights updating for the whole run.
    #[serde(rename = "@max-non-const-timesteps", default = "default_minus_one")]
    pub max_non_const_timesteps: i64,
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct AccelerationConfig {
    #[serde(rename = "@type")]
    pub kind: AccelerationKind,
    #[serde(rename = "@initial-relaxation", default)]
    pub initial_relaxation: Option<f64>,
    #[serde(rename = "@force-initial-relaxation", default)]
    pub force_initial_relaxation: bool,
    #[serde(rename = "@max-used-iterations", default)]
    pub max_used_iterations: Option<usize>,
    #[serde(rename = "@timesteps-reused", default)]
    pub timesteps_reused: Option<usize>,
    #[serde(rename = "@filter", default)]
    pub filter: Option<FilterKind>,
    #[serde(rename = "@singularity-limit", default)]
    pub singularity_limit: Option<f64>,
    #[serde(rename = "@always-build-jacobian", default)]
    pub always_build_jacobian: bool,
    #[serde(rename = "@imvj-restart-type", default)]
    pub imvj_restart_type: Option<RestartKind>,
    #[serde(rename = "@chunk-size", default)]
    pub chunk_size: Option<usize>,
    #[serde(rename = "@rsls-reused-timesteps", default)]
    pub rsls_reused_timesteps: Option<usize>,
    #[serde(rename = "@svd-truncation-eps", default)]
    pub svd_truncation_eps: Option<f64>,
    #[serde(rename = "acceleration-data", default)]
    pub data: Vec<AccelerationDataConfig>,
    #[serde(rename = "preconditioner", default)]
    pub preconditioner: Option<PreconditionerConfig>,
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct AccelerationDataConfig {
    #[serde(rename = "@name")]
    pub name: String,
    #[serde(rename = "@mesh")]
    pub mesh: String,
}

impl Config {
    /// Load and validate a configuration file.
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let text = std::fs::read_to_string(path.as_ref()).map_err(|e| {
            Error::config(format!(
                "cannot read configuration file {}: {e}",
                path.as_ref().display()
            ))
        })?;
        Self::parse(&text)
    }

    /// Parse and validate a configuration from a string.
    pub fn parse(text: &str) -> Result<Self> {
        let config: Config = quick_xml::de::from_str(text)
            .map_err(|e| Error::config(format!("malformed configuration: {e}")))?;
        config.validate()?;
        Ok(config)
    }

    fn has_participant(&self, name: &str) -> bool {
        self.participants.iter().any(|p| p.name == name)
    }

    fn mesh(&self, name: &str) -> Option<&MeshConfig> {
        self.meshes.iter().find(|m| m.name == name)
    }

    pub fn validate(&self) -> Result<()> {
        if self.dimensions != 2 && self.dimensions != 3 {
            return Err(Error::config("dimensions has to be 2 or 3"));
        }
        if self.participants.len() < 2 {
            return Err(Error::config("a coupled run needs at least two participants"));
        }
        for scheme in &self.schemes {
            self.validate_scheme(scheme)?;
        }
        for m2n in &self.m2ns {
            for name in [&m2n.from, &m2n.to] {
                if !self.has_participant(name) {
                    return Err(Error::config(format!("unknown participant \"{name}\" in m2n")));
                }
            }
        }
        Ok(())
    }

    fn validate_scheme(&self, scheme: &SchemeConfig) -> Result<()> {
        match scheme.kind {
            SchemeKind::Multi => {
                let controller = scheme.controller.as_deref().ok_or_else(|| {
                    Error::config("a multi coupling scheme needs a controller participant")
                })?;
                if !self.has_participant(controller) {
                    return Err(Error::config(format!(
                        "unknown controller participant \"{controller}\""
                    )));
                }
            }
            _ => {
                let first = scheme
                    .first
                    .as_deref()
                    .ok_or_else(|| Error::config("coupling scheme needs a first participant"))?;
                let second = scheme
                    .second
                    .as_deref()
                    .ok_or_else(|| Error::config("coupling scheme needs a second participant"))?;
                if first == second {
                    return Err(Error::config(
                        "first and second participant of a coupling scheme must differ",
                    ));
                }
                for name in [first, second] {
                    if !self.has_participant(name) {
                        return Err(Error::config(format!("unknown participant \"{name}\"")));
                    }
                }
            }
        }
        if scheme.max_time.is_none() && scheme.max_timesteps.is_none() {
            return Err(Error::config(
                "a coupling scheme needs max-time or max-timesteps",
            ));
        }
        if scheme.timestep_length <= 0.0 {
            return Err(Error::config("timestep-length has to be positive"));
        }
        for exchange in &scheme.exchanges {
            let mesh = self.mesh(&exchange.mesh).ok_or_else(|| {
                Error::config(format!("unknown mesh \"{}\" in exchange", exchange.mesh))
            })?;
            if !mesh.data.iter().any(|d| d.name == exchange.data) {
                return Err(Error::config(format!(
                    "mesh \"{}\" carries no data \"{}\"",
                    exchange.mesh, exchange.data
                )));
            }
            if exchange.from == exchange.to {
                return Err(Error::config("exchange from and to must differ"));
            }
        }
        if scheme.kind.is_implicit() {
            if scheme.max_iterations < 1 {
                return Err(Error::config("max-iterations has to be at least 1"));
            }
            if scheme.measures.is_empty() {
                return Err(Error::config(
                    "an implicit coupling scheme needs at least one convergence measure",
                ));
            }
        } else if scheme.acceleration.is_some() {
            return Err(Error::config(
                "acceleration requires an implicit coupling scheme",
            ));
        }
        for measure in &scheme.measures {
            match measure.measure {
                MeasureKind::MinIterations => {
                    if measure.min_iterations.is_none() {
                        return Err(Error::config(
                            "a min-iterations measure needs min-iterations",
                        ));
                    }
                }
                _ => {
                    let limit = measure.limit.ok_or_else(|| {
                        Error::config("a norm-based convergence measure needs a limit")
                    })?;
                    if limit <= 0.0 {
                        return Err(Error::config("convergence limit has to be positive"));
                    }
                }
            }
        }
        if let Some(acceleration) = &scheme.acceleration {
            self.validate_acceleration(acceleration)?;
        }
        Ok(())
    }

    fn validate_acceleration(&self, acceleration: &AccelerationConfig) -> Result<()> {
        if let Some(omega) = acceleration.initial_relaxation {
            if !(omega > 0.0 && omega <= 1.0) {
                return Err(Error::config("initial-relaxation has to be in (0, 1]"));
            }
        }
        if acceleration.data.is_empty() {
            return Err(Error::config("acceleration needs at least one data field"));
        }
        for data in &acceleration.data {
            let mesh = self.mesh(&data.mesh).ok_or_else(|| {
                Error::config(format!("unknown mesh \"{}\" in acceleration", data.mesh))
            })?;
            if !mesh.data.iter().any(|d| d.name == data.name) {
                return Err(Error::config(format!(
                    "mesh \"{}\" carries no data \"{}\"",
                    data.mesh, data.name
                )));
            }
        }
        let quasi_newton = matches!(
            acceleration.kind,
            AccelerationKind::IqnIls | AccelerationKind::Imvj
        );
        if quasi_newton {
            if acceleration.max_used_iterations.is_none_or(|m| m < 1) {
                return Err(Error::config("max-used-iterations has to be at least 1"));
            }
            if let Some(limit) = acceleration.singularity_limit {
                if limit < 0.0 {
                    return Err(Error::config("singularity-limit has to be non-negative"));
                }
            }
        }
        if acceleration.kind == AccelerationKind::Imvj {
            let restart = acceleration.imvj_restart_type.unwrap_or(RestartKind::NoRestart);
            if restart != RestartKind::NoRestart && acceleration.chunk_size.is_none_or(|c| c < 1)
            {
                return Err(Error::config("chunk-size has to be at least 1"));
            }
            if let Some(eps) = acceleration.svd_truncation_eps {
                if eps < 0.0 {
                    return Err(Error::config("svd-truncation-eps has to be non-negative"));
                }
            }
        }
        if let Some(preconditioner) = &acceleration.preconditioner {
            if preconditioner.kind == PreconditionerKind::Constant {
                let factors = preconditioner.factors.as_deref().ok_or_else(|| {
                    Error::config("a constant preconditioner needs factors")
                })?;
                let parsed = parse_factors(factors)?;
                if parsed.len() != acceleration.data.len() {
                    return Err(Error::config(format!(
                        "constant preconditioner has {} factors for {} accelerated fields",
                        parsed.len(),
                        acceleration.data.len()
                    )));
                }
            }
        }
        Ok(())
    }
}

/// Comma-separated factor list of the constant preconditioner.
pub fn parse_factors(text: &str) -> Result<Vec<f64>> {
    text.split(',')
        .map(|part| {
            part.trim()
                .parse::<f64>()
                .map_err(|_| Error::config(format!("malformed preconditioner factor \"{part}\"")))
        })
        .collect()
}
