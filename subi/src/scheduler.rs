// Copyright 2019-2022 Subi Platform developers
// SPDX-License-Identifier: Apache-2.0, MIT

use crate::TierNode;
use log::info;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::time::MissedTickBehavior;

/// Drive the tier's periodic work until `shutdown` flips. Dumps are
/// written on the way out; message dispatch runs on the caller's threads.
pub async fn run_scheduler(node: Arc<TierNode>, shutdown: Arc<AtomicBool>) {
    let mut second = tokio::time::interval(Duration::from_secs(1));
    second.set_missed_tick_behavior(MissedTickBehavior::Delay);
    let mut minute = tokio::time::interval(Duration::from_secs(60));
    minute.set_missed_tick_behavior(MissedTickBehavior::Delay);

    info!("tier scheduler started");
    loop {
        tokio::select! {
            _ = second.tick() => {
                if shutdown.load(Ordering::SeqCst) {
                    break;
                }
                node.second_tick();
            }
            _ = minute.tick() => {
                if shutdown.load(Ordering::SeqCst) {
                    break;
                }
                node.minute_tick();
            }
        }
    }
    info!("tier scheduler stopping, writing dumps");
    node.save_dumps();
}

#[cfg(test)]
mod scheduler_tests {
    use super::*;

    #[tokio::test]
    async fn scheduler_stops_on_shutdown() {
        let dir = tempfile::tempdir().unwrap();
        let node = Arc::new(crate::tests::test_node(dir.path()));
        let shutdown = Arc::new(AtomicBool::new(false));

        let handle = tokio::spawn(run_scheduler(node.clone(), shutdown.clone()));
        tokio::time::sleep(Duration::from_millis(50)).await;
        shutdown.store(true, Ordering::SeqCst);
        tokio::time::timeout(Duration::from_secs(5), handle)
            .await
            .expect("scheduler exits promptly")
            .unwrap();

        // Dumps were written on the way out.
        assert!(dir.path().join("subinodes.dat").exists());
        assert!(dir.path().join("payments.dat").exists());
    }
}
