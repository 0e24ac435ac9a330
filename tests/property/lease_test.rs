// tests/property/lease_test.rs

//! The lease discipline under arbitrary interleavings of acquire, refresh,
//! release and expiry from competing agents, checked against a sequential
//! model: at any point at most one agent owns the lease, an acquisition
//! succeeds exactly when the slot is vacant, and a refresh succeeds exactly
//! for the current owner.

use proptest::prelude::*;
use std::time::Duration;

use steward::core::dcs::DcsClient;

use crate::support::MockDcs;

const AGENTS: [&str; 3] = ["a", "b", "c"];
const TTL: Duration = Duration::from_secs(30);

#[derive(Debug, Clone)]
enum LeaseOp {
    Acquire(usize),
    Refresh(usize),
    Release(usize),
    Expire,
}

fn lease_op() -> impl Strategy<Value = LeaseOp> {
    prop_oneof![
        (0..AGENTS.len()).prop_map(LeaseOp::Acquire),
        (0..AGENTS.len()).prop_map(LeaseOp::Refresh),
        (0..AGENTS.len()).prop_map(LeaseOp::Release),
        Just(LeaseOp::Expire),
    ]
}

proptest! {
    #[test]
    fn at_most_one_agent_owns_the_lease(ops in proptest::collection::vec(lease_op(), 0..64)) {
        let rt = tokio::runtime::Builder::new_current_thread()
            .enable_all()
            .build()
            .unwrap();
        rt.block_on(async {
            let dcs = MockDcs::new();
            let mut owner: Option<&str> = None;

            for op in &ops {
                match op {
                    LeaseOp::Acquire(i) => {
                        let name = AGENTS[*i];
                        let won = dcs.attempt_to_acquire_leader(name, TTL).await.unwrap();
                        assert_eq!(won, owner.is_none(), "acquire by {name} with owner {owner:?}");
                        if won {
                            owner = Some(name);
                        }
                    }
                    LeaseOp::Refresh(i) => {
                        let name = AGENTS[*i];
                        let kept = dcs.update_leader(name, TTL).await.unwrap();
                        assert_eq!(kept, owner == Some(name), "refresh by {name} with owner {owner:?}");
                    }
                    LeaseOp::Release(i) => {
                        let name = AGENTS[*i];
                        dcs.delete_leader(name).await.unwrap();
                        if owner == Some(name) {
                            owner = None;
                        }
                    }
                    LeaseOp::Expire => {
                        dcs.expire_leader();
                        owner = None;
                    }
                }
                // The store never disagrees with the sequential model.
                assert_eq!(dcs.leader().as_deref(), owner);
            }
        });
    }

    #[test]
    fn the_initialize_marker_is_write_once(
        winners in proptest::collection::vec(0..AGENTS.len(), 1..16)
    ) {
        let rt = tokio::runtime::Builder::new_current_thread()
            .enable_all()
            .build()
            .unwrap();
        rt.block_on(async {
            let dcs = MockDcs::new();
            let mut first: Option<&str> = None;

            for i in &winners {
                let name = AGENTS[*i];
                let won = dcs.race("initialize", name).await.unwrap();
                match first {
                    None => {
                        assert!(won, "the first race must be won");
                        first = Some(name);
                    }
                    Some(_) => assert!(!won, "a second racer must never win"),
                }
                assert_eq!(dcs.initialize().as_deref(), first);
            }
        });
    }
}
