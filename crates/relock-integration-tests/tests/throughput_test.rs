//! Lock cycle throughput smoke test
//!
//! Five hundred concurrent owners cycle through ten hot keys across two
//! manager instances sharing one store. Exercises the full contended
//! path (acquire, coalesced wait, release notification, retry) under a
//! realistic fan-in, and catches lost wake-ups as a hang or a timeout.

use std::time::{Duration, Instant};

use futures::future::join_all;
use relock_core::OwnerToken;
use relock_integration_tests::{shared_store, started_manager_on, unique_key};

const KEYS: usize = 10;
const OWNERS_PER_KEY: usize = 50;

#[tokio::test]
async fn bench_contended_lock_cycle_throughput() {
    let store = shared_store();
    let managers = [
        started_manager_on(&store).await,
        started_manager_on(&store).await,
    ];

    let run = unique_key("bench");
    let start = Instant::now();

    let mut handles = Vec::with_capacity(KEYS * OWNERS_PER_KEY);
    for key_index in 0..KEYS {
        for owner_index in 0..OWNERS_PER_KEY {
            let manager = managers[owner_index % managers.len()].clone();
            let key = format!("{}_{}", run, key_index);
            handles.push(tokio::spawn(async move {
                let owner = OwnerToken::generate();
                let acquired = manager
                    .acquire(
                        &key,
                        &owner,
                        Duration::from_secs(180),
                        Duration::from_secs(30),
                    )
                    .await
                    .unwrap();
                if acquired {
                    manager.release(&key, &owner).await.unwrap();
                }
                acquired
            }));
        }
    }

    let outcomes = join_all(handles).await;
    let elapsed = start.elapsed();

    let acquired = outcomes
        .into_iter()
        .filter(|r| *r.as_ref().unwrap())
        .count();
    assert_eq!(acquired, KEYS * OWNERS_PER_KEY, "no owner should time out");

    let throughput = (KEYS * OWNERS_PER_KEY) as f64 / elapsed.as_secs_f64();
    println!("Lock cycle throughput: {:.2} cycles/sec", throughput);
    assert!(throughput > 50.0, "Should complete at least 50 cycles/sec");

    for manager in managers {
        manager.stop().await;
    }
}
