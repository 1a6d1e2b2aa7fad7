//! The three reconcilers plus helpers shared across them.
//!
//! Each submodule follows the same shape: a `run(client, ready)` entry point
//! that builds a `kube_runtime::Controller` and drives it with `.for_each()`,
//! a pure `reconcile()`/`error_policy()` pair, and decision helpers factored
//! out so they're unit-testable without a live API server — `reconcile()`
//! itself is never unit-tested directly, only the pure helpers it calls.

pub mod claim;
pub mod sandbox;
pub mod warmpool;

use k8s_openapi::api::core::v1::PodTemplateSpec;
use rand::Rng;

/// Container ports declared on a pod template, used to build `NetworkPolicy`
/// ingress rules and headless-service ports.
pub fn pod_ports(template: &PodTemplateSpec) -> Vec<i32> {
    template
        .spec
        .as_ref()
        .into_iter()
        .flat_map(|s| s.containers.iter())
        .flat_map(|c| c.ports.iter().flatten())
        .map(|p| p.container_port)
        .collect()
}

const SUFFIX_ALPHABET: &[u8] = b"abcdefghijklmnopqrstuvwxyz0123456789";
const SUFFIX_LEN: usize = 5;

/// A 5-character lowercase-alphanumeric suffix for new warm-pool pod names.
pub fn random_suffix() -> String {
    let mut rng = rand::thread_rng();
    (0..SUFFIX_LEN)
        .map(|_| SUFFIX_ALPHABET[rng.gen_range(0..SUFFIX_ALPHABET.len())] as char)
        .collect()
}
