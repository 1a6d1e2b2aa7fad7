use k8s_openapi::api::core::v1::{
    Container, PersistentVolumeClaim, PersistentVolumeClaimSpec, PodSpec, PodTemplateSpec,
};
use k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta;

use sandbox_operator::crd::{
    SandboxClaim, SandboxClaimSpec, SandboxTemplate, SandboxTemplateRef, SandboxTemplateSpec,
    SandboxWarmPool, SandboxWarmPoolSpec, ShutdownPolicy,
};

pub fn pod_template(image: &str) -> PodTemplateSpec {
    PodTemplateSpec {
        metadata: Some(ObjectMeta::default()),
        spec: Some(PodSpec {
            containers: vec![Container {
                name: "main".to_string(),
                image: Some(image.to_string()),
                ..Default::default()
            }],
            ..Default::default()
        }),
    }
}

pub fn volume_claim_template(name: &str) -> PersistentVolumeClaim {
    PersistentVolumeClaim {
        metadata: ObjectMeta {
            name: Some(name.to_string()),
            ..Default::default()
        },
        spec: Some(PersistentVolumeClaimSpec::default()),
        ..Default::default()
    }
}

pub fn sandbox_template(name: &str) -> SandboxTemplate {
    SandboxTemplate::new(
        name,
        SandboxTemplateSpec {
            pod_template: pod_template("agent-runtime:latest"),
            volume_claim_templates: vec![volume_claim_template("workspace")],
            shutdown_time: None,
            enable_disruption_control: false,
            network_policy: None,
        },
    )
}

pub fn sandbox_claim(name: &str, template_name: &str) -> SandboxClaim {
    SandboxClaim::new(
        name,
        SandboxClaimSpec {
            sandbox_template_ref: SandboxTemplateRef { name: template_name.to_string() },
            shutdown_time: None,
        },
    )
}

pub fn warm_pool(name: &str, template_name: &str, replicas: i32) -> SandboxWarmPool {
    SandboxWarmPool::new(
        name,
        SandboxWarmPoolSpec {
            replicas,
            sandbox_template_ref: SandboxTemplateRef { name: template_name.to_string() },
        },
    )
}

#[allow(dead_code)]
pub const RETAIN: ShutdownPolicy = ShutdownPolicy::Retain;
#[allow(dead_code)]
pub const DELETE: ShutdownPolicy = ShutdownPolicy::Delete;
