//! Shared helpers for integration tests

#![allow(dead_code)]

use std::time::Duration;
use workload_worker::test_helpers::FakeCall;

/// Poll `condition` until it holds, advancing time in small steps.
///
/// Panics after 2000 polls so a broken test fails instead of hanging.
pub async fn wait_until(mut condition: impl FnMut() -> bool) {
    for _ in 0..2_000 {
        if condition() {
            return;
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
    panic!("condition not reached");
}

/// Scale calls in order, as `(workload, replicas)`
pub fn scale_calls(calls: &[FakeCall]) -> Vec<(String, i32)> {
    calls
        .iter()
        .filter_map(|call| match call {
            FakeCall::ScaleWorkload { name, replicas, .. } => Some((name.clone(), *replicas)),
            _ => None,
        })
        .collect()
}

pub fn created_workloads(calls: &[FakeCall]) -> Vec<String> {
    calls
        .iter()
        .filter_map(|call| match call {
            FakeCall::CreateWorkload { name, .. } => Some(name.clone()),
            _ => None,
        })
        .collect()
}
