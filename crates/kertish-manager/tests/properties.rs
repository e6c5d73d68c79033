//! Property tests for space accounting and balancing.

mod common;

use std::collections::HashMap;

use common::TestEnv;
use kertish_manager::operations::OperationState;
use kertish_manager::{ClusterId, ManagerError};
use proptest::prelude::*;

fn runtime() -> tokio::runtime::Runtime {
    tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()
        .unwrap()
}

#[derive(Debug, Clone, Copy)]
enum Outcome {
    Commit,
    Discard,
    KeepOpen,
}

fn any_outcome() -> impl Strategy<Value = Outcome> {
    prop_oneof![
        Just(Outcome::Commit),
        Just(Outcome::Discard),
        Just(Outcome::KeepOpen),
    ]
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(32))]

    /// Used bytes always equal committed bytes plus open reservations, and no
    /// cluster is ever filled past its size.
    #[test]
    fn reservations_conserve_space(
        sizes in proptest::collection::vec(100u64..600, 1..4),
        requests in proptest::collection::vec((1u64..400, any_outcome()), 1..20),
    ) {
        runtime().block_on(async {
            let env = TestEnv::with_config(|c| c.placement.chunk_size = 64);
            let mut ids = Vec::new();
            for (i, size) in sizes.iter().enumerate() {
                let address = format!("10.0.{i}.1:9430");
                let (cluster, _) = env.cluster(&[address.as_str()], *size).await;
                ids.push(cluster.id);
            }
            let total_size: u64 = sizes.iter().sum();
            let used = |env: &TestEnv| -> u64 { ids.iter().map(|id| env.record(id).used).sum() };

            let mut expected = 0u64;
            for (size, outcome) in requests {
                let before = used(&env);
                let map = match env.manager.reserve(size).await {
                    Ok(map) => map,
                    Err(ManagerError::NoDiskSpace { .. }) => {
                        prop_assert_eq!(used(&env), before);
                        continue;
                    }
                    Err(e) => return Err(TestCaseError::fail(e.to_string())),
                };
                let mut per_cluster: HashMap<ClusterId, u64> = HashMap::new();
                for entry in &map.clusters {
                    *per_cluster.entry(entry.cluster_id.clone()).or_default() += entry.chunk.size;
                }
                prop_assert_eq!(per_cluster.values().sum::<u64>(), size);

                match outcome {
                    Outcome::Commit => {
                        env.manager.commit(&map.id, &per_cluster).await.unwrap();
                        expected += size;
                    }
                    Outcome::Discard => env.manager.discard(&map.id).await.unwrap(),
                    Outcome::KeepOpen => expected += size,
                }
                prop_assert_eq!(used(&env), expected);
                prop_assert!(used(&env) <= total_size);
                for id in &ids {
                    let cluster = env.record(id);
                    prop_assert!(cluster.used <= cluster.size);
                }
            }
            Ok(())
        })?;
    }

    /// With chunks smaller than the threshold, a finished balance leaves the
    /// clusters' weights within the threshold of each other.
    #[test]
    fn balance_converges(
        layout in proptest::collection::vec(
            proptest::collection::vec(10u64..=20, 0..12),
            2..5,
        ),
    ) {
        runtime().block_on(async {
            let env = TestEnv::new();
            let mut ids = Vec::new();
            let mut fill = 0u8;
            for (i, chunks) in layout.iter().enumerate() {
                let address = format!("10.0.{i}.1:9430");
                let (cluster, nodes) = env.cluster(&[address.as_str()], 1000).await;
                for size in chunks {
                    fill += 1;
                    nodes[0].put(&vec![fill; *size as usize]);
                }
                env.sync(&cluster.id).await;
                ids.push(cluster.id);
            }
            let total: u64 = ids.iter().map(|id| env.record(id).used).sum();

            let op = env.manager.balance(&[]).unwrap();
            prop_assert_eq!(env.wait(op).await.state, OperationState::Complete);

            let weights: Vec<f64> = ids.iter().map(|id| env.record(id).weight()).collect();
            let max = weights.iter().cloned().fold(f64::MIN, f64::max);
            let min = weights.iter().cloned().fold(f64::MAX, f64::min);
            prop_assert!(max - min < 0.05, "weights {:?}", weights);
            prop_assert_eq!(ids.iter().map(|id| env.record(id).used).sum::<u64>(), total);
            Ok(())
        })?;
    }
}
