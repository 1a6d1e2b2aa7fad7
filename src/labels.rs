//! Persisted label, annotation, and finalizer keys.
//!
//! These strings are a stability contract: once written onto a pod, service,
//! or PVC they must never change shape, since external code (HPA selectors,
//! adoption lookups) depends on them.

use std::collections::BTreeMap;

/// Binds a headless service's selector to its sandbox's pod.
pub const SANDBOX_NAME_HASH: &str = "agents.x-k8s.io/sandbox-name-hash";

/// Pool membership, placed on warm-pool pods and their PVCs.
pub const POOL: &str = "agents.x-k8s.io/pool";

/// Template identity, placed on warm-pool pods to make adoption queryable.
pub const SANDBOX_TEMPLATE_REF_HASH: &str = "agents.x-k8s.io/sandbox-template-ref-hash";

/// Names an externally-supplied pod a `Sandbox` must adopt instead of creating one.
pub const POD_NAME_ANNOTATION: &str = "agents.x-k8s.io/pod-name";

/// Selected by the shared pod-disruption budget.
pub const DISRUPTION_POLICY: &str = "extensions.agents.x-k8s.io/sandbox-disruption-policy";

/// Autoscaler hint injected alongside `DISRUPTION_POLICY`.
pub const SAFE_TO_EVICT_ANNOTATION: &str = "cluster-autoscaler.kubernetes.io/safe-to-evict";

/// Guards the one-time `sandbox_creation_latency` observation per sandbox.
pub const READINESS_OBSERVED_ANNOTATION: &str = "agents.x-k8s.io/readiness-observed";

/// Gates last-writer cleanup of the shared PDB.
pub const PDB_CLEANUP_FINALIZER: &str = "sandboxclaim.agents.x-k8s.io/pdb-cleanup";

/// Name of the namespace-shared pod disruption budget.
pub const SHARED_PDB_NAME: &str = "sandbox-highly-available";

/// Field manager used for all server-side-apply / merge patches this crate issues.
pub const FIELD_MANAGER: &str = "sandbox-operator";

/// Merge `template` labels with `injected` key/value pairs, `injected` winning
/// on conflicting keys.
pub fn merge_labels(
    template: Option<&BTreeMap<String, String>>,
    injected: &[(&str, &str)],
) -> BTreeMap<String, String> {
    let mut merged = template.cloned().unwrap_or_default();
    for (k, v) in injected {
        merged.insert((*k).to_string(), (*v).to_string());
    }
    merged
}

/// The PVC name derived from a volume-claim template name and a pod name:
/// `<templateName>-<podName>`.
pub fn pvc_name(template_name: &str, pod_name: &str) -> String {
    format!("{template_name}-{pod_name}")
}

/// Label-selector string form of the sandbox-name-hash binding, written to
/// `status.selector` for scale-subresource semantics.
pub fn sandbox_selector_string(name_hash: &str) -> String {
    format!("{SANDBOX_NAME_HASH}={name_hash}")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn injected_wins_on_conflict() {
        let mut template = BTreeMap::new();
        template.insert("app".to_string(), "from-template".to_string());
        template.insert("keep".to_string(), "yes".to_string());

        let merged = merge_labels(Some(&template), &[("app", "from-injected")]);

        assert_eq!(merged.get("app"), Some(&"from-injected".to_string()));
        assert_eq!(merged.get("keep"), Some(&"yes".to_string()));
    }

    #[test]
    fn merge_with_no_template_labels() {
        let merged = merge_labels(None, &[(SANDBOX_NAME_HASH, "abcd1234")]);
        assert_eq!(merged.len(), 1);
        assert_eq!(merged.get(SANDBOX_NAME_HASH), Some(&"abcd1234".to_string()));
    }

    #[test]
    fn pvc_name_format() {
        assert_eq!(pvc_name("workspaces", "s"), "workspaces-s");
    }

    #[test]
    fn selector_string_format() {
        assert_eq!(
            sandbox_selector_string("ab179450"),
            "agents.x-k8s.io/sandbox-name-hash=ab179450"
        );
    }
}
