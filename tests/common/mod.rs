//! Common utilities for isoprobe integration tests.
#![allow(dead_code)]

use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

use isoprobe::{ConcurrencyControl, HarnessConfig, Store, StoreConfig, StoreProfile};

/// Helper function to create a store with the given backend behavior.
pub fn setup_store(concurrency_control: ConcurrencyControl) -> Arc<Store> {
    setup_store_with_profile(StoreProfile::Hibernate, concurrency_control)
}

pub fn setup_store_with_profile(
    profile: StoreProfile,
    concurrency_control: ConcurrencyControl,
) -> Arc<Store> {
    let config = StoreConfig {
        lock_poll_interval: Duration::from_millis(5),
        ..StoreConfig::for_profile(profile).with_concurrency_control(concurrency_control)
    };
    Arc::new(Store::new(config))
}

/// Harness timings short enough for a test run; the join bound stays generous
/// so a loaded CI machine does not flake.
pub fn fast_harness_config() -> HarnessConfig {
    HarnessConfig {
        observation_window: Duration::from_millis(300),
        join_timeout: Duration::from_secs(2),
        eventual_timeout: Duration::from_secs(5),
        settle_delay: Duration::from_secs(2),
        prompt_read_bound: Duration::from_secs(1),
        poll_interval: Duration::from_millis(10),
    }
}

/// Polls `condition` until it holds or two seconds pass.
pub fn wait_until<F: Fn() -> bool>(condition: F) -> bool {
    let deadline = Instant::now() + Duration::from_secs(2);
    while !condition() {
        if Instant::now() >= deadline {
            return false;
        }
        thread::sleep(Duration::from_millis(2));
    }
    true
}
