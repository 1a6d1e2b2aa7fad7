//! Pod materialization from a `podTemplate`: label merging, PVC-volume
//! injection, and the PVC-name convention shared by the Sandbox and
//! WarmPool reconcilers.
//!
//! Builds typed `PodSpec`/`Container` values with struct-update syntax
//! rather than `serde_json::json!` templating.

use std::collections::BTreeMap;

use k8s_openapi::api::core::v1::{
    PersistentVolumeClaim, Pod, PodTemplateSpec, Volume, VolumePersistentVolumeClaimSource,
};
use k8s_openapi::apimachinery::pkg::apis::meta::v1::{ObjectMeta, OwnerReference};

use crate::labels::{self, pvc_name};

/// Build the pod that a `Sandbox`/warm-pool entry materializes, merging the
/// template's labels/annotations with the sandbox/pool's injected labels
/// (injected wins on conflict) and attaching a volume for each PVC template
/// so the container spec can mount it by name.
pub fn materialize_pod(
    pod_name: &str,
    namespace: &str,
    template: &PodTemplateSpec,
    volume_claim_templates: &[PersistentVolumeClaim],
    injected_labels: &[(&str, &str)],
    owner: OwnerReference,
) -> Pod {
    let template_meta = template.metadata.clone().unwrap_or_default();
    let merged_labels = labels::merge_labels(template_meta.labels.as_ref(), injected_labels);

    let mut spec = template.spec.clone().unwrap_or_default();
    for vct in volume_claim_templates {
        let vct_name = vct.metadata.name.clone().unwrap_or_default();
        let claim_name = pvc_name(&vct_name, pod_name);
        spec.volumes.get_or_insert_with(Vec::new).push(Volume {
            name: vct_name,
            persistent_volume_claim: Some(VolumePersistentVolumeClaimSource {
                claim_name,
                read_only: Some(false),
            }),
            ..Default::default()
        });
    }

    Pod {
        metadata: ObjectMeta {
            name: Some(pod_name.to_string()),
            namespace: Some(namespace.to_string()),
            labels: Some(merged_labels),
            annotations: template_meta.annotations.clone(),
            owner_references: Some(vec![owner]),
            ..Default::default()
        },
        spec: Some(spec),
        status: None,
    }
}

/// Build the PVC for one volume-claim template entry.
pub fn materialize_pvc(
    vct: &PersistentVolumeClaim,
    pod_name: &str,
    namespace: &str,
    injected_labels: &[(&str, &str)],
    owner: OwnerReference,
) -> PersistentVolumeClaim {
    let vct_name = vct.metadata.name.clone().unwrap_or_default();
    let name = pvc_name(&vct_name, pod_name);
    let merged_labels = labels::merge_labels(vct.metadata.labels.as_ref(), injected_labels);

    PersistentVolumeClaim {
        metadata: ObjectMeta {
            name: Some(name),
            namespace: Some(namespace.to_string()),
            labels: Some(merged_labels),
            annotations: vct.metadata.annotations.clone(),
            owner_references: Some(vec![owner]),
            ..Default::default()
        },
        spec: vct.spec.clone(),
        status: None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use k8s_openapi::api::core::v1::{Container, PersistentVolumeClaimSpec, PodSpec};

    fn owner(uid: &str) -> OwnerReference {
        OwnerReference {
            api_version: "agents.x-k8s.io/v1alpha1".to_string(),
            kind: "Sandbox".to_string(),
            name: "s".to_string(),
            uid: uid.to_string(),
            controller: Some(true),
            block_owner_deletion: Some(true),
        }
    }

    fn pvc_template(name: &str) -> PersistentVolumeClaim {
        PersistentVolumeClaim {
            metadata: ObjectMeta {
                name: Some(name.to_string()),
                ..Default::default()
            },
            spec: Some(PersistentVolumeClaimSpec::default()),
            ..Default::default()
        }
    }

    fn template_with_labels(labels: &[(&str, &str)]) -> PodTemplateSpec {
        let mut map = BTreeMap::new();
        for (k, v) in labels {
            map.insert(k.to_string(), v.to_string());
        }
        PodTemplateSpec {
            metadata: Some(ObjectMeta {
                labels: Some(map),
                ..Default::default()
            }),
            spec: Some(PodSpec {
                containers: vec![Container {
                    name: "main".to_string(),
                    image: Some("busybox".to_string()),
                    ..Default::default()
                }],
                ..Default::default()
            }),
        }
    }

    #[test]
    fn pod_gets_injected_label_and_owner() {
        let template = template_with_labels(&[("app", "x")]);
        let pod = materialize_pod("s", "ns", &template, &[], &[("agents.x-k8s.io/sandbox-name-hash", "ab179450")], owner("uid-1"));

        let meta = pod.metadata;
        assert_eq!(meta.name.as_deref(), Some("s"));
        assert_eq!(meta.namespace.as_deref(), Some("ns"));
        let labels = meta.labels.unwrap();
        assert_eq!(labels.get("app"), Some(&"x".to_string()));
        assert_eq!(
            labels.get("agents.x-k8s.io/sandbox-name-hash"),
            Some(&"ab179450".to_string())
        );
        assert_eq!(meta.owner_references.unwrap()[0].uid, "uid-1");
    }

    #[test]
    fn injected_label_wins_over_template_label_conflict() {
        let template = template_with_labels(&[("agents.x-k8s.io/sandbox-name-hash", "stale")]);
        let pod = materialize_pod("s", "ns", &template, &[], &[("agents.x-k8s.io/sandbox-name-hash", "fresh")], owner("uid-1"));
        let labels = pod.metadata.labels.unwrap();
        assert_eq!(
            labels.get("agents.x-k8s.io/sandbox-name-hash"),
            Some(&"fresh".to_string())
        );
    }

    #[test]
    fn pvc_volume_is_injected_per_template() {
        let template = template_with_labels(&[]);
        let vcts = vec![pvc_template("workspace"), pvc_template("cache")];
        let pod = materialize_pod("s", "ns", &template, &vcts, &[], owner("uid-1"));

        let volumes = pod.spec.unwrap().volumes.unwrap();
        assert_eq!(volumes.len(), 2);
        assert_eq!(volumes[0].name, "workspace");
        assert_eq!(
            volumes[0]
                .persistent_volume_claim
                .as_ref()
                .unwrap()
                .claim_name,
            "workspace-s"
        );
        assert_eq!(volumes[1].name, "cache");
        assert_eq!(
            volumes[1]
                .persistent_volume_claim
                .as_ref()
                .unwrap()
                .claim_name,
            "cache-s"
        );
    }

    #[test]
    fn materialized_pvc_name_and_owner() {
        let vct = pvc_template("workspace");
        let pvc = materialize_pvc(&vct, "s", "ns", &[("agents.x-k8s.io/pool", "deadbeef")], owner("pool-uid"));
        assert_eq!(pvc.metadata.name.as_deref(), Some("workspace-s"));
        assert_eq!(pvc.metadata.namespace.as_deref(), Some("ns"));
        assert_eq!(pvc.metadata.owner_references.unwrap()[0].uid, "pool-uid");
        assert_eq!(
            pvc.metadata.labels.unwrap().get("agents.x-k8s.io/pool"),
            Some(&"deadbeef".to_string())
        );
    }

    #[test]
    fn no_volume_claim_templates_means_no_extra_volumes() {
        let template = template_with_labels(&[]);
        let pod = materialize_pod("s", "ns", &template, &[], &[], owner("uid-1"));
        assert!(pod.spec.unwrap().volumes.is_none());
    }
}
