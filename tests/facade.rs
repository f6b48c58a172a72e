//! A full implicit coupled run through the solver-facing facade: two
//! solvers iterate a contractive fixed point to convergence with constant
//! under-relaxation and iteration checkpoints.

use tandem::CouplingInterface;
use tandem::com::ChannelFactory;
use tandem::interface::{READ_ITERATION_CHECKPOINT, WRITE_ITERATION_CHECKPOINT};
use tandem::testing::run_participants;

const CONFIG: &str = r#"
    <coupling dimensions="2">
      <participant name="Fluid"/>
      <participant name="Structure"/>
      <mesh name="Surface">
        <data name="Forces" dimensions="1"/>
        <data name="Displacements" dimensions="1"/>
      </mesh>
      <m2n from="Fluid" to="Structure" transport="direct"/>
      <scheme type="serial-implicit" first="Fluid" second="Structure"
              max-timesteps="2" timestep-length="1.0" max-iterations="60">
        <exchange data="Forces" mesh="Surface" from="Fluid" to="Structure"/>
        <exchange data="Displacements" mesh="Surface" from="Structure" to="Fluid"/>
        <convergence-measure data="Displacements" measure="absolute" limit="1e-10"/>
        <acceleration type="constant-relaxation" initial-relaxation="0.8">
          <acceleration-data name="Displacements" mesh="Surface"/>
        </acceleration>
      </scheme>
    </coupling>"#;

/// The fluid side: forces are twice the received displacements.
fn fluid(factory: ChannelFactory) -> anyhow::Result<()> {
    let mut interface = CouplingInterface::new("Fluid", 0, 1, factory);
    interface.configure_from_str(CONFIG)?;
    let mesh = interface.mesh_id("Surface")?;
    let vertices = interface.set_mesh_vertices(mesh, &[0.0, 0.0, 1.0, 0.0])?;
    let forces = interface.data_id("Forces", mesh)?;
    let displacements = interface.data_id("Displacements", mesh)?;

    let mut dt = interface.initialize()?;
    let mut last_seen = vec![0.0; vertices.len()];
    while interface.is_coupling_ongoing() {
        if interface.is_action_required(WRITE_ITERATION_CHECKPOINT) {
            interface.fulfilled_action(WRITE_ITERATION_CHECKPOINT)?;
        }
        let d = interface.read_block_scalar_data(displacements, &vertices)?;
        let f: Vec<f64> = d.iter().map(|x| 2.0 * x).collect();
        interface.write_block_scalar_data(forces, &vertices, &f)?;
        dt = interface.advance(dt)?;
        if interface.is_action_required(READ_ITERATION_CHECKPOINT) {
            interface.fulfilled_action(READ_ITERATION_CHECKPOINT)?;
        } else {
            last_seen = interface.read_block_scalar_data(displacements, &vertices)?;
        }
    }
    interface.finalize()?;
    // Fixed point of x = 0.25 · (2x) + 1.
    for value in last_seen {
        assert!((value - 2.0).abs() < 1e-6, "fluid saw {value}");
    }
    Ok(())
}

/// The structure side: displacements respond to a quarter of the forces
/// plus a unit offset. Its state is checkpointed and restored around
/// repeated iterations.
fn structure(factory: ChannelFactory) -> anyhow::Result<()> {
    let mut interface = CouplingInterface::new("Structure", 0, 1, factory);
    interface.configure_from_str(CONFIG)?;
    let mesh = interface.mesh_id("Surface")?;
    let vertices = interface.set_mesh_vertices(mesh, &[0.0, 0.0, 1.0, 0.0])?;
    let forces = interface.data_id("Forces", mesh)?;
    let displacements = interface.data_id("Displacements", mesh)?;

    let mut dt = interface.initialize()?;
    let mut state = vec![0.0; vertices.len()];
    let mut checkpoint = state.clone();
    let mut completed = 0;
    while interface.is_coupling_ongoing() {
        if interface.is_action_required(WRITE_ITERATION_CHECKPOINT) {
            checkpoint = state.clone();
            interface.fulfilled_action(WRITE_ITERATION_CHECKPOINT)?;
        }
        let f = interface.read_block_scalar_data(forces, &vertices)?;
        state = f.iter().map(|x| 0.25 * x + 1.0).collect();
        interface.write_block_scalar_data(displacements, &vertices, &state)?;
        dt = interface.advance(dt)?;
        if interface.is_action_required(READ_ITERATION_CHECKPOINT) {
            state = checkpoint.clone();
            interface.fulfilled_action(READ_ITERATION_CHECKPOINT)?;
        } else {
            completed += 1;
        }
    }
    interface.finalize()?;
    assert_eq!(completed, 2);
    for value in state {
        assert!((value - 2.0).abs() < 1e-6, "structure ended at {value}");
    }
    Ok(())
}

#[test]
fn serial_implicit_fixed_point_converges_through_the_facade() {
    run_participants(vec![
        Box::new(fluid) as Box<dyn FnOnce(ChannelFactory) -> anyhow::Result<()> + Send>,
        Box::new(structure),
    ]);
}
