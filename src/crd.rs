//! Custom resource definitions: `Sandbox`, `SandboxClaim`, `SandboxTemplate`,
//! `SandboxWarmPool`.
//!
//! `#[derive(CustomResource)]` structs, `camelCase` wire format,
//! `Option<T>` + `skip_serializing_if` for optional fields, and a
//! `#[cfg(test)]` module exercising CRD-shape and serialization-roundtrip
//! invariants directly.

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use k8s_openapi::api::core::v1::{PersistentVolumeClaim, PodTemplateSpec};
use kube::CustomResource;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

use crate::conditions::Condition;

pub const GROUP: &str = "agents.x-k8s.io";
pub const VERSION: &str = "v1alpha1";

/* ============================= SHARED ============================= */

/// A reference to a `SandboxTemplate` by name, in the same namespace.
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct SandboxTemplateRef {
    pub name: String,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, JsonSchema, PartialEq, Eq, Default)]
pub enum ShutdownPolicy {
    #[default]
    Retain,
    Delete,
}

fn default_replicas_one() -> i32 {
    1
}

/* ============================= NETWORK POLICY INTENT ============================= */

/// A namespace + pod label selector pair, used by ingress/egress intent to
/// describe peers without hand-authoring a raw `NetworkPolicyPeer`.
#[derive(Debug, Clone, Default, Serialize, Deserialize, JsonSchema, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct NamespacedPodSelector {
    #[serde(default)]
    pub namespace_labels: BTreeMap<String, String>,
    #[serde(default)]
    pub pod_labels: BTreeMap<String, String>,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, JsonSchema, PartialEq, Eq, Default)]
#[serde(rename_all = "UPPERCASE")]
pub enum Protocol {
    #[default]
    Tcp,
    Udp,
}

/// One CIDR block, with an optional list of excluded sub-ranges.
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct IpBlockIntent {
    pub cidr: String,
    #[serde(default)]
    pub except: Vec<String>,
}

/// One `additionalEgressRules` entry: exactly one of `ip_block` or
/// `namespace_selector` should be set.
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct EgressRuleIntent {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ip_block: Option<IpBlockIntent>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub namespace_selector: Option<NamespacedPodSelector>,
    pub port: i32,
    #[serde(default)]
    pub protocol: Protocol,
}

/// Abstract network-policy intent carried on a `SandboxTemplate`, translated
/// by the Claim reconciler into a concrete `NetworkPolicy`.
#[derive(Debug, Clone, Default, Serialize, Deserialize, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct SandboxNetworkPolicy {
    #[serde(default)]
    pub enabled: bool,
    #[serde(default)]
    pub ingress_controller_selectors: Vec<NamespacedPodSelector>,
    #[serde(default)]
    pub ingress_from_ip_blocks: Vec<String>,
    #[serde(default)]
    pub additional_ingress_rules: Vec<NamespacedPodSelector>,
    #[serde(default)]
    pub additional_egress_rules: Vec<EgressRuleIntent>,
}

/* ============================= SANDBOX ============================= */

#[derive(CustomResource, Debug, Clone, Serialize, Deserialize, JsonSchema)]
#[kube(
    group = "agents.x-k8s.io",
    version = "v1alpha1",
    kind = "Sandbox",
    plural = "sandboxes",
    status = "SandboxStatus",
    namespaced
)]
#[serde(rename_all = "camelCase")]
pub struct SandboxSpec {
    pub pod_template: PodTemplateSpec,

    /// Ordered list of PVC templates; each `.metadata.name` must be unique
    /// within the sandbox. Modeled directly as `PersistentVolumeClaim`, the
    /// same convention `StatefulSetSpec` uses for `volumeClaimTemplates`.
    #[serde(default)]
    pub volume_claim_templates: Vec<PersistentVolumeClaim>,

    /// Constrained to `{0, 1}`.
    #[serde(default = "default_replicas_one")]
    pub replicas: i32,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub shutdown_time: Option<DateTime<Utc>>,

    #[serde(default)]
    pub shutdown_policy: ShutdownPolicy,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct SandboxStatus {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub service: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub service_fqdn: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub replicas: Option<i32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub selector: Option<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub conditions: Vec<Condition>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub first_ready_time: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub shutdown_at: Option<DateTime<Utc>>,
}

/* ============================= SANDBOX TEMPLATE ============================= */

#[derive(CustomResource, Debug, Clone, Serialize, Deserialize, JsonSchema)]
#[kube(
    group = "agents.x-k8s.io",
    version = "v1alpha1",
    kind = "SandboxTemplate",
    plural = "sandboxtemplates",
    namespaced
)]
#[serde(rename_all = "camelCase")]
pub struct SandboxTemplateSpec {
    pub pod_template: PodTemplateSpec,

    #[serde(default)]
    pub volume_claim_templates: Vec<PersistentVolumeClaim>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub shutdown_time: Option<DateTime<Utc>>,

    #[serde(default)]
    pub enable_disruption_control: bool,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub network_policy: Option<SandboxNetworkPolicy>,
}

/* ============================= SANDBOX CLAIM ============================= */

#[derive(CustomResource, Debug, Clone, Serialize, Deserialize, JsonSchema)]
#[kube(
    group = "agents.x-k8s.io",
    version = "v1alpha1",
    kind = "SandboxClaim",
    plural = "sandboxclaims",
    status = "SandboxClaimStatus",
    namespaced
)]
#[serde(rename_all = "camelCase")]
pub struct SandboxClaimSpec {
    pub sandbox_template_ref: SandboxTemplateRef,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub shutdown_time: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct SandboxRef {
    pub name: String,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct SandboxClaimStatus {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sandbox_status: Option<SandboxRef>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub conditions: Vec<Condition>,
}

/* ============================= SANDBOX WARM POOL ============================= */

#[derive(CustomResource, Debug, Clone, Serialize, Deserialize, JsonSchema)]
#[kube(
    group = "agents.x-k8s.io",
    version = "v1alpha1",
    kind = "SandboxWarmPool",
    plural = "sandboxwarmpools",
    status = "SandboxWarmPoolStatus",
    namespaced
)]
#[serde(rename_all = "camelCase")]
pub struct SandboxWarmPoolSpec {
    /// Non-negative desired pool size.
    pub replicas: i32,

    pub sandbox_template_ref: SandboxTemplateRef,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct SandboxWarmPoolStatus {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub replicas: Option<i32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ready_replicas: Option<i32>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub conditions: Vec<Condition>,
}

/* ============================= TESTS ============================= */
