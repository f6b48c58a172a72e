//! The parallel coupling fabric: distributed participant groups exchanging
//! vertex-indexed data over both data paths and both transports.

use std::sync::Arc;
use tandem::com::ChannelFactory;
use tandem::com::group::GroupComm;
use tandem::m2n::{DistributionKind, M2N};
use tandem::testing::{assert_slices_approx_eq, run_participants};

struct RankSpec {
    participant: &'static str,
    rank: usize,
    size: usize,
    vertices: usize,
    accept: bool,
}

/// Both participant groups exchange one two-component field over the given
/// data path; every rank checks the block it owns.
fn exchange_between_groups(kind: DistributionKind, a_parts: &[usize], b_parts: &[usize]) {
    let total: usize = a_parts.iter().sum();
    assert_eq!(total, b_parts.iter().sum::<usize>());

    let mut specs = Vec::new();
    for (rank, &vertices) in a_parts.iter().enumerate() {
        specs.push(RankSpec {
            participant: "Left",
            rank,
            size: a_parts.len(),
            vertices,
            accept: false,
        });
    }
    for (rank, &vertices) in b_parts.iter().enumerate() {
        specs.push(RankSpec {
            participant: "Right",
            rank,
            size: b_parts.len(),
            vertices,
            accept: true,
        });
    }

    let bodies: Vec<Box<dyn FnOnce(ChannelFactory) -> anyhow::Result<()> + Send>> = specs
        .into_iter()
        .map(|spec| {
            Box::new(move |factory: ChannelFactory| -> anyhow::Result<()> {
                let group = Arc::new(GroupComm::connect(
                    spec.participant,
                    spec.rank,
                    spec.size,
                    &factory,
                )?);
                let peer = if spec.participant == "Left" { "Right" } else { "Left" };
                let mut m2n = M2N::new(spec.participant, peer, kind, Arc::clone(&group), factory);
                if spec.accept {
                    m2n.accept_master_connection()?;
                } else {
                    m2n.request_master_connection()?;
                }
                m2n.register_mesh(7, spec.vertices)?;
                if spec.accept {
                    m2n.accept_slaves_connection()?;
                } else {
                    m2n.request_slaves_connection()?;
                }

                // Global vertex index determines the payload, so both sides
                // can verify ordering regardless of their partitioning.
                let offset: usize = group.offsets(spec.vertices)?[spec.rank];
                let dims = 2;
                let payload: Vec<f64> = (0..spec.vertices * dims)
                    .map(|i| (offset * dims + i) as f64)
                    .collect();

                if spec.participant == "Left" {
                    m2n.send(&payload, 7, dims)?;
                    let mut back = vec![0.0; payload.len()];
                    m2n.receive(&mut back, 7, dims)?;
                    let expected: Vec<f64> = payload.iter().map(|v| v * 3.0).collect();
                    assert_slices_approx_eq(&back, &expected);
                } else {
                    let mut received = vec![0.0; payload.len()];
                    m2n.receive(&mut received, 7, dims)?;
                    assert_slices_approx_eq(&received, &payload);
                    let tripled: Vec<f64> = received.iter().map(|v| v * 3.0).collect();
                    m2n.send(&tripled, 7, dims)?;
                }
                m2n.close();
                Ok(())
            }) as Box<dyn FnOnce(ChannelFactory) -> anyhow::Result<()> + Send>
        })
        .collect();
    run_participants(bodies);
}

#[test]
fn gather_scatter_roundtrip_across_distributed_groups() {
    exchange_between_groups(DistributionKind::GatherScatter, &[2, 1], &[1, 2]);
}

#[test]
fn gather_scatter_with_empty_ranks() {
    exchange_between_groups(DistributionKind::GatherScatter, &[3, 0], &[0, 3]);
}

#[test]
fn point_to_point_roundtrip_across_distributed_groups() {
    exchange_between_groups(DistributionKind::PointToPoint, &[2, 1], &[1, 2]);
}

#[test]
fn point_to_point_with_empty_ranks() {
    exchange_between_groups(DistributionKind::PointToPoint, &[3, 0], &[0, 3]);
}

#[test]
fn point_to_point_matching_partitions() {
    exchange_between_groups(DistributionKind::PointToPoint, &[2, 2], &[2, 2]);
}

#[test]
fn gather_scatter_single_rank_groups() {
    exchange_between_groups(DistributionKind::GatherScatter, &[4], &[4]);
}

/// The ports-based transport publishes its address on disk; two single-rank
/// participants find each other without a shared launcher.
#[test]
fn sockets_transport_between_jobs() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().to_path_buf();
    let mut threads = Vec::new();
    for accept in [true, false] {
        let factory = ChannelFactory::Sockets(path.clone());
        threads.push(std::thread::spawn(move || {
            let name = if accept { "Right" } else { "Left" };
            let peer = if accept { "Left" } else { "Right" };
            let group = Arc::new(GroupComm::single());
            let mut m2n = M2N::new(
                name,
                peer,
                DistributionKind::GatherScatter,
                Arc::clone(&group),
                factory,
            );
            if accept {
                m2n.accept_master_connection().unwrap();
            } else {
                m2n.request_master_connection().unwrap();
            }
            m2n.register_mesh(0, 3).unwrap();
            if accept {
                m2n.accept_slaves_connection().unwrap();
            } else {
                m2n.request_slaves_connection().unwrap();
            }
            if accept {
                let mut values = vec![0.0; 3];
                m2n.receive(&mut values, 0, 1).unwrap();
                assert_slices_approx_eq(&values, &[0.25, 0.5, 0.75]);
                m2n.send(&values, 0, 1).unwrap();
            } else {
                m2n.send(&[0.25, 0.5, 0.75], 0, 1).unwrap();
                let mut values = vec![0.0; 3];
                m2n.receive(&mut values, 0, 1).unwrap();
            }
            m2n.close();
        }));
    }
    for thread in threads {
        thread.join().unwrap();
    }
}
