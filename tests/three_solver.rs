//! Three solvers coupled pairwise: the middle participant drives a
//! composition of two serial-explicit schemes through the facade.

use tandem::CouplingInterface;
use tandem::com::ChannelFactory;
use tandem::testing::run_participants;

const CONFIG: &str = r#"
    <coupling dimensions="3">
      <participant name="Participant0"/>
      <participant name="Participant1"/>
      <participant name="Participant2"/>
      <mesh name="Surface">
        <data name="Data0" dimensions="1"/>
        <data name="Data1" dimensions="1"/>
        <data name="Data2" dimensions="1"/>
      </mesh>
      <m2n from="Participant0" to="Participant1" transport="direct"/>
      <m2n from="Participant1" to="Participant2" transport="direct"/>
      <scheme type="serial-explicit" first="Participant0" second="Participant1"
              max-timesteps="10" timestep-length="0.1">
        <exchange data="Data0" mesh="Surface" from="Participant0" to="Participant1"/>
        <exchange data="Data1" mesh="Surface" from="Participant1" to="Participant0"/>
      </scheme>
      <scheme type="serial-explicit" first="Participant1" second="Participant2"
              max-timesteps="10" timestep-length="0.1">
        <exchange data="Data1" mesh="Surface" from="Participant1" to="Participant2"/>
        <exchange data="Data2" mesh="Surface" from="Participant2" to="Participant1"/>
      </scheme>
    </coupling>"#;

fn participant(name: &'static str) -> impl FnOnce(ChannelFactory) -> anyhow::Result<()> + Send {
    move |factory| {
        let mut interface = CouplingInterface::new(name, 0, 1, factory);
        interface.configure_from_str(CONFIG)?;
        let mesh = interface.mesh_id("Surface")?;
        interface.set_mesh_vertices(
            mesh,
            &[
                1.0, 1.0, 1.0, //
                2.0, 1.0, -1.0, //
                3.0, 1.0, 1.0, //
                4.0, 1.0, -1.0,
            ],
        )?;

        let mut dt = interface.initialize()?;
        let mut computed_timesteps = 0;
        while interface.is_coupling_ongoing() {
            assert!((dt - 0.1).abs() < 1e-12);
            dt = interface.advance(dt)?;
            if interface.is_timestep_complete() {
                computed_timesteps += 1;
            }
        }
        interface.finalize()?;
        assert_eq!(computed_timesteps, 10);
        assert!(!interface.is_coupling_ongoing());
        assert!(dt > 0.0);
        Ok(())
    }
}

#[test]
fn three_solvers_advance_ten_steps_in_lockstep() {
    run_participants(vec![
        Box::new(participant("Participant0"))
            as Box<dyn FnOnce(ChannelFactory) -> anyhow::Result<()> + Send>,
        Box::new(participant("Participant1")),
        Box::new(participant("Participant2")),
    ]);
}
