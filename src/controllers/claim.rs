//! Claim reconciler: materializes one `Sandbox` per claim, maintains the
//! namespace-shared disruption budget, and translates template
//! network-policy intent into a concrete `NetworkPolicy`.
//!
//! Follows a `has_finalizer`/`add_finalizer`/`remove_finalizer`/
//! `handle_deletion` finalizer lifecycle, generalized from a single cleanup
//! finalizer to a shared-PDB last-writer-cleanup rule.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use futures::StreamExt;
use k8s_openapi::api::core::v1::{Pod, PodTemplateSpec};
use k8s_openapi::api::networking::v1::NetworkPolicy;
use k8s_openapi::api::policy::v1::{PodDisruptionBudget, PodDisruptionBudgetSpec};
use k8s_openapi::apimachinery::pkg::apis::meta::v1::{LabelSelector, Time};
use k8s_openapi::apimachinery::pkg::util::intstr::IntOrString;
use kube::api::{Api, ListParams, Patch, PatchParams};
use kube::runtime::controller::{Action, Controller};
use kube::{Client, Resource, ResourceExt};
use tracing::{info, warn};

use crate::conditions::{self, Condition};
use crate::controllers::pod_ports;
use crate::crd::{Sandbox, SandboxClaim, SandboxSpec, SandboxTemplate, ShutdownPolicy};
use crate::error::{Error, ErrorAccumulator, TerminalError, TransientError};
use crate::labels::{self, FIELD_MANAGER, PDB_CLEANUP_FINALIZER, SHARED_PDB_NAME};
use crate::metrics;
use crate::networkpolicy;
use crate::ownership::{self, Ownership};

struct Ctx {
    client: Client,
    requeue_interval: Duration,
}

pub async fn run(client: Client, ready: Arc<AtomicBool>, requeue_interval: Duration) {
    let claims: Api<SandboxClaim> = Api::all(client.clone());
    let sandboxes: Api<Sandbox> = Api::all(client.clone());

    let ctx = Arc::new(Ctx { client, requeue_interval });

    Controller::new(claims, Default::default())
        .owns(sandboxes, Default::default())
        .run(reconcile, error_policy, ctx)
        .for_each(|result| {
            ready.store(true, Ordering::Relaxed);
            async move {
                if let Err(e) = result {
                    warn!(error = %e, "claim_reconcile_dispatch_error");
                }
            }
        })
        .await;
}

fn error_policy(_claim: Arc<SandboxClaim>, _error: &Error, ctx: Arc<Ctx>) -> Action {
    metrics::CLAIM_RECONCILE_ERRORS.inc();
    Action::requeue(ctx.requeue_interval)
}

async fn reconcile(claim: Arc<SandboxClaim>, ctx: Arc<Ctx>) -> Result<Action, Error> {
    let name = claim.name_any();
    let namespace = claim.namespace().unwrap_or_default();
    let client = &ctx.client;

    let claims_api: Api<SandboxClaim> = Api::namespaced(client.clone(), &namespace);

    if claim.metadata.deletion_timestamp.is_some() {
        if has_finalizer(&claim) {
            cleanup_shared_pdb(client, &namespace, &name).await?;
            remove_finalizer(&claims_api, &name).await?;
        }
        return Ok(Action::await_change());
    }

    metrics::CLAIM_RECONCILE_TOTAL.inc();
    info!(claim = %name, namespace = %namespace, "claim_reconcile_start");

    let mut errors = ErrorAccumulator::new();
    let previous_status = claim.status.clone().unwrap_or_default();
    let mut status = previous_status.clone();

    let templates_api: Api<SandboxTemplate> = Api::namespaced(client.clone(), &namespace);
    let template = match templates_api.get_opt(&claim.spec.sandbox_template_ref.name).await {
        Ok(Some(t)) => t,
        Ok(None) => {
            let err = TerminalError::TemplateNotFound(claim.spec.sandbox_template_ref.name.clone());
            errors.push_terminal(err.clone());
            let now = chrono::Utc::now();
            status.conditions = conditions::sorted(vec![Condition::ready(
                false,
                "TemplateNotFound",
                err.to_string(),
                claim.metadata.generation,
                Condition::find(&previous_status.conditions, conditions::READY),
                now,
            )]);
            patch_status_if_changed(&claims_api, &name, &status, &previous_status).await?;
            return Err(Error::Terminal(err));
        }
        Err(e) => return Err(Error::Kube(e)),
    };

    if template.spec.enable_disruption_control && !has_finalizer(&claim) {
        add_finalizer(&claims_api, &name).await?;
        return Ok(Action::requeue(Duration::from_millis(0)));
    }

    let sandboxes_api: Api<Sandbox> = Api::namespaced(client.clone(), &namespace);
    let owner = claim.controller_owner_ref(&()).expect("SandboxClaim has a uid");

    let sandbox = match get_or_create_sandbox(client, &sandboxes_api, &claim, &template, owner, &mut errors).await {
        Some(s) => s,
        None => {
            let action = finish(
                &claims_api,
                &name,
                &mut status,
                &previous_status,
                None,
                &mut errors,
                ctx.requeue_interval,
            )
            .await?;
            return Ok(action);
        }
    };

    status.sandbox_status = Some(crate::crd::SandboxRef { name: name.clone() });

    if template.spec.enable_disruption_control {
        ensure_shared_pdb(client, &namespace).await?;
    }

    if let Some(policy) = &template.spec.network_policy {
        if policy.enabled {
            let policy_owner = claim.controller_owner_ref(&()).expect("SandboxClaim has a uid");
            apply_network_policy(client, &namespace, &name, &sandbox, policy, policy_owner, &mut errors).await;
        }
    }

    let sandbox_ready = Condition::find(&sandbox.status.as_ref().map(|s| s.conditions.clone()).unwrap_or_default(), conditions::READY)
        .is_some_and(Condition::is_true);

    finish(
        &claims_api,
        &name,
        &mut status,
        &previous_status,
        Some(sandbox_ready),
        &mut errors,
        ctx.requeue_interval,
    )
    .await
}

async fn finish(
    claims_api: &Api<SandboxClaim>,
    name: &str,
    status: &mut crate::crd::SandboxClaimStatus,
    previous_status: &crate::crd::SandboxClaimStatus,
    sandbox_ready: Option<bool>,
    errors: &mut ErrorAccumulator,
    requeue_interval: Duration,
) -> Result<Action, Error> {
    let now = chrono::Utc::now();
    let previous_ready = Condition::find(&previous_status.conditions, conditions::READY);
    let (ready, reason, message) = match sandbox_ready {
        Some(true) => (true, "SandboxReady", "sandbox is ready".to_string()),
        Some(false) => (false, "SandboxNotReady", "sandbox is not yet ready".to_string()),
        None => (false, "ReconcilerError", "failed to reconcile the derived sandbox".to_string()),
    };
    status.conditions = conditions::sorted(vec![Condition::ready(ready, reason, message, None, previous_ready, now)]);

    patch_status_if_changed(claims_api, name, status, previous_status).await?;

    match std::mem::take(errors).into_requeue_error() {
        Some(e) => Err(e),
        None => Ok(Action::requeue(requeue_interval)),
    }
}

async fn patch_status_if_changed(
    claims_api: &Api<SandboxClaim>,
    name: &str,
    status: &crate::crd::SandboxClaimStatus,
    previous: &crate::crd::SandboxClaimStatus,
) -> Result<(), Error> {
    if status == previous {
        return Ok(());
    }
    let patch = serde_json::json!({ "status": status });
    claims_api
        .patch_status(name, &PatchParams::apply(FIELD_MANAGER), &Patch::Merge(&patch))
        .await
        .map_err(Error::Kube)?;
    Ok(())
}

async fn get_or_create_sandbox(
    client: &Client,
    sandboxes_api: &Api<Sandbox>,
    claim: &SandboxClaim,
    template: &SandboxTemplate,
    owner: k8s_openapi::apimachinery::pkg::apis::meta::v1::OwnerReference,
    errors: &mut ErrorAccumulator,
) -> Option<Sandbox> {
    let name = claim.name_any();
    match sandboxes_api.get_opt(&name).await {
        Ok(Some(existing)) => {
            let claim_uid = claim.uid().unwrap_or_default();
            let ownership = ownership::classify(existing.metadata.owner_references.as_ref(), &claim_uid);
            if ownership.is_owned_by(&claim_uid) {
                Some(existing)
            } else {
                errors.push_transient(TransientError::SandboxOwnershipConflict {
                    sandbox: name.clone(),
                    claim: claim.name_any(),
                });
                None
            }
        }
        Ok(None) => {
            let namespace = claim.namespace().unwrap_or_default();
            let spec = build_sandbox_spec(claim, template);
            let mut sandbox = Sandbox::new(&name, spec);
            sandbox.metadata.owner_references = Some(vec![owner]);

            match select_warm_pool_pod(client, &namespace, &claim.spec.sandbox_template_ref.name).await {
                Ok(Some(pod_name)) => {
                    orphan_pool_pod(client, &namespace, &pod_name, errors).await;
                    sandbox
                        .metadata
                        .annotations
                        .get_or_insert_with(Default::default)
                        .insert(labels::POD_NAME_ANNOTATION.to_string(), pod_name);
                    metrics::CLAIM_ADOPTIONS_TOTAL.with_label_values(&[&namespace]).inc();
                }
                Ok(None) => {}
                Err(e) => errors.push_kube(e),
            }

            match sandboxes_api.create(&Default::default(), &sandbox).await {
                Ok(created) => Some(created),
                Err(e) => {
                    errors.push_kube(e);
                    None
                }
            }
        }
        Err(e) => {
            errors.push_kube(e);
            None
        }
    }
}

/// A warm-pool pod's adoption-relevant state, decoupled from the live `Pod`
/// so the selection order is unit-testable without a cluster.
#[derive(Debug, Clone, PartialEq, Eq)]
struct PoolPodCandidate {
    name: String,
    ready: bool,
    creation_timestamp: Option<Time>,
}

/// Pick the best pool pod to adopt: a `Ready` pod over a not-yet-ready one,
/// and among equally-ready pods the oldest — it has had the most time to
/// warm up.
fn pick_pool_pod(mut candidates: Vec<PoolPodCandidate>) -> Option<String> {
    candidates.sort_by_key(|c| (!c.ready, c.creation_timestamp.clone()));
    candidates.into_iter().next().map(|c| c.name)
}

/// Find a pod belonging to some `SandboxWarmPool` built from this claim's
/// template — identified by the `sandbox-template-ref-hash` label warm-pool
/// pods carry for exactly this lookup — and not already being deleted.
async fn select_warm_pool_pod(
    client: &Client,
    namespace: &str,
    template_name: &str,
) -> Result<Option<String>, kube::Error> {
    let template_hash = crate::hash::name_hash(template_name);
    let pods_api: Api<Pod> = Api::namespaced(client.clone(), namespace);
    let list_params =
        ListParams::default().labels(&format!("{}={template_hash}", labels::SANDBOX_TEMPLATE_REF_HASH));

    let pods = pods_api.list(&list_params).await?;
    let candidates = pods
        .items
        .into_iter()
        .filter(|p| p.metadata.deletion_timestamp.is_none())
        .filter(|p| {
            p.metadata
                .owner_references
                .as_ref()
                .is_some_and(|refs| refs.iter().any(|r| r.controller == Some(true)))
        })
        .map(|p| PoolPodCandidate {
            ready: super::warmpool::pod_ready(&p),
            creation_timestamp: p.metadata.creation_timestamp.clone(),
            name: p.name_any(),
        })
        .collect();

    Ok(pick_pool_pod(candidates))
}

/// Strip the selected pod's warm-pool controller reference and pool label so
/// the WarmPool reconciler stops counting it toward its population and
/// replenishes, before the Sandbox reconciler adopts it on its next pass.
async fn orphan_pool_pod(client: &Client, namespace: &str, pod_name: &str, errors: &mut ErrorAccumulator) {
    let pods_api: Api<Pod> = Api::namespaced(client.clone(), namespace);
    let patch = serde_json::json!({
        "metadata": {
            "ownerReferences": serde_json::Value::Null,
            "labels": { labels::POOL: serde_json::Value::Null },
        }
    });
    if let Err(e) = pods_api
        .patch(pod_name, &PatchParams::apply(FIELD_MANAGER), &Patch::Merge(&patch))
        .await
    {
        errors.push_kube(e);
    }
}

/// Build the derived `Sandbox` spec from a claim + its template, overriding
/// `shutdownTime` (claim wins) and injecting the disruption-control label
/// and autoscaler annotation when the template enables it.
pub fn build_sandbox_spec(claim: &SandboxClaim, template: &SandboxTemplate) -> SandboxSpec {
    let mut pod_template = template.spec.pod_template.clone();
    if template.spec.enable_disruption_control {
        inject_disruption_control(&mut pod_template);
    }
    SandboxSpec {
        pod_template,
        volume_claim_templates: template.spec.volume_claim_templates.clone(),
        replicas: 1,
        shutdown_time: claim.spec.shutdown_time.or(template.spec.shutdown_time),
        shutdown_policy: ShutdownPolicy::Retain,
    }
}

fn inject_disruption_control(pod_template: &mut PodTemplateSpec) {
    let meta = pod_template.metadata.get_or_insert_with(Default::default);
    meta.labels
        .get_or_insert_with(Default::default)
        .insert(labels::DISRUPTION_POLICY.to_string(), "true".to_string());
    meta.annotations
        .get_or_insert_with(Default::default)
        .insert(labels::SAFE_TO_EVICT_ANNOTATION.to_string(), "false".to_string());
}

async fn ensure_shared_pdb(client: &Client, namespace: &str) -> Result<(), Error> {
    let pdbs_api: Api<PodDisruptionBudget> = Api::namespaced(client.clone(), namespace);
    if pdbs_api.get_opt(SHARED_PDB_NAME).await.map_err(Error::Kube)?.is_some() {
        return Ok(());
    }

    let mut selector_labels = std::collections::BTreeMap::new();
    selector_labels.insert(labels::DISRUPTION_POLICY.to_string(), "true".to_string());

    let pdb = PodDisruptionBudget {
        metadata: k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta {
            name: Some(SHARED_PDB_NAME.to_string()),
            namespace: Some(namespace.to_string()),
            ..Default::default()
        },
        spec: Some(PodDisruptionBudgetSpec {
            max_unavailable: Some(IntOrString::Int(0)),
            selector: Some(LabelSelector {
                match_labels: Some(selector_labels),
                ..Default::default()
            }),
            ..Default::default()
        }),
        status: None,
    };

    match pdbs_api.create(&Default::default(), &pdb).await {
        Ok(_) | Err(kube::Error::Api(kube::error::ErrorResponse { code: 409, .. })) => Ok(()),
        Err(e) => Err(Error::Kube(e)),
    }
}

/// Delete the shared PDB iff no other claim in the namespace still holds the
/// pdb-cleanup finalizer.
async fn cleanup_shared_pdb(client: &Client, namespace: &str, deleting_claim: &str) -> Result<(), Error> {
    let claims_api: Api<SandboxClaim> = Api::namespaced(client.clone(), namespace);
    let others_hold_finalizer = claims_api
        .list(&Default::default())
        .await
        .map_err(Error::Kube)?
        .items
        .into_iter()
        .any(|c| {
            c.name_any() != deleting_claim
                && c.metadata.deletion_timestamp.is_none()
                && has_finalizer(&c)
        });

    if others_hold_finalizer {
        return Ok(());
    }

    let pdbs_api: Api<PodDisruptionBudget> = Api::namespaced(client.clone(), namespace);
    match pdbs_api.delete(SHARED_PDB_NAME, &Default::default()).await {
        Ok(_) | Err(kube::Error::Api(kube::error::ErrorResponse { code: 404, .. })) => Ok(()),
        Err(e) => Err(Error::Kube(e)),
    }
}

/// Builds the `<claim>-network-policy` owned by the claim itself, not the
/// derived sandbox, so its lifecycle follows the claim's.
async fn apply_network_policy(
    client: &Client,
    namespace: &str,
    claim_name: &str,
    sandbox: &Sandbox,
    intent: &crate::crd::SandboxNetworkPolicy,
    owner: k8s_openapi::apimachinery::pkg::apis::meta::v1::OwnerReference,
    errors: &mut ErrorAccumulator,
) {
    let policy_name = format!("{claim_name}-network-policy");
    let name_hash = crate::hash::name_hash(claim_name);
    let ports = pod_ports(&sandbox.spec.pod_template);

    let Some(policy) = networkpolicy::build(&policy_name, namespace, &name_hash, intent, &ports, owner) else {
        return;
    };

    let policies_api: Api<NetworkPolicy> = Api::namespaced(client.clone(), namespace);
    match policies_api.get_opt(&policy_name).await {
        Ok(None) => {
            if let Err(e) = policies_api.create(&Default::default(), &policy).await {
                errors.push_kube(e);
            }
        }
        Ok(Some(_)) => {
            let patch = serde_json::json!({ "spec": policy.spec });
            if let Err(e) = policies_api
                .patch(&policy_name, &PatchParams::apply(FIELD_MANAGER), &Patch::Merge(&patch))
                .await
            {
                errors.push_kube(e);
            }
        }
        Err(e) => errors.push_kube(e),
    }
}

fn has_finalizer(claim: &SandboxClaim) -> bool {
    claim
        .metadata
        .finalizers
        .as_ref()
        .is_some_and(|f| f.iter().any(|s| s == PDB_CLEANUP_FINALIZER))
}

async fn add_finalizer(claims_api: &Api<SandboxClaim>, name: &str) -> Result<(), Error> {
    let patch = serde_json::json!({ "metadata": { "finalizers": [PDB_CLEANUP_FINALIZER] } });
    claims_api
        .patch(name, &PatchParams::apply(FIELD_MANAGER), &Patch::Merge(&patch))
        .await
        .map_err(Error::Kube)?;
    Ok(())
}

async fn remove_finalizer(claims_api: &Api<SandboxClaim>, name: &str) -> Result<(), Error> {
    let patch = serde_json::json!({ "metadata": { "finalizers": [] } });
    claims_api
        .patch(name, &PatchParams::apply(FIELD_MANAGER), &Patch::Merge(&patch))
        .await
        .map_err(Error::Kube)?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;
    use k8s_openapi::api::core::v1::{Container, PodSpec};
    use kube::core::ObjectMeta;

    fn template(enable_disruption: bool) -> SandboxTemplate {
        SandboxTemplate::new(
            "t",
            crate::crd::SandboxTemplateSpec {
                pod_template: PodTemplateSpec {
                    metadata: Some(ObjectMeta::default()),
                    spec: Some(PodSpec {
                        containers: vec![Container {
                            name: "c".to_string(),
                            image: Some("i".to_string()),
                            ..Default::default()
                        }],
                        ..Default::default()
                    }),
                },
                volume_claim_templates: vec![],
                shutdown_time: None,
                enable_disruption_control: enable_disruption,
                network_policy: None,
            },
        )
    }

    fn claim(shutdown_time: Option<chrono::DateTime<chrono::Utc>>) -> SandboxClaim {
        SandboxClaim::new(
            "c",
            crate::crd::SandboxClaimSpec {
                sandbox_template_ref: crate::crd::SandboxTemplateRef { name: "t".to_string() },
                shutdown_time,
            },
        )
    }

    #[test]
    fn sandbox_spec_replicas_always_one() {
        let spec = build_sandbox_spec(&claim(None), &template(false));
        assert_eq!(spec.replicas, 1);
    }

    #[test]
    fn claim_shutdown_time_wins_over_template() {
        let claim_time = chrono::Utc::now();
        let c = claim(Some(claim_time));
        let spec = build_sandbox_spec(&c, &template(false));
        assert_eq!(spec.shutdown_time, Some(claim_time));
    }

    #[test]
    fn template_shutdown_time_used_when_claim_has_none() {
        let mut t = template(false);
        let template_time = chrono::Utc::now();
        t.spec.shutdown_time = Some(template_time);
        let spec = build_sandbox_spec(&claim(None), &t);
        assert_eq!(spec.shutdown_time, Some(template_time));
    }

    #[test]
    fn disruption_control_injects_label_and_annotation() {
        let spec = build_sandbox_spec(&claim(None), &template(true));
        let meta = spec.pod_template.metadata.unwrap();
        assert_eq!(
            meta.labels.unwrap().get(labels::DISRUPTION_POLICY),
            Some(&"true".to_string())
        );
        assert_eq!(
            meta.annotations.unwrap().get(labels::SAFE_TO_EVICT_ANNOTATION),
            Some(&"false".to_string())
        );
    }

    #[test]
    fn no_disruption_control_leaves_pod_template_untouched() {
        let spec = build_sandbox_spec(&claim(None), &template(false));
        let meta = spec.pod_template.metadata.unwrap_or_default();
        assert!(meta.labels.unwrap_or_default().is_empty());
    }

    #[test]
    fn has_finalizer_detects_presence() {
        let mut c = claim(None);
        assert!(!has_finalizer(&c));
        c.metadata.finalizers = Some(vec![PDB_CLEANUP_FINALIZER.to_string()]);
        assert!(has_finalizer(&c));
    }

    fn candidate(name: &str, ready: bool, secs: i64) -> PoolPodCandidate {
        PoolPodCandidate {
            name: name.to_string(),
            ready,
            creation_timestamp: Some(Time(chrono::Utc.timestamp_opt(secs, 0).unwrap())),
        }
    }

    #[test]
    fn no_candidates_picks_nothing() {
        assert_eq!(pick_pool_pod(vec![]), None);
    }

    #[test]
    fn ready_pod_preferred_over_not_ready() {
        let candidates = vec![candidate("not-ready", false, 100), candidate("ready", true, 200)];
        assert_eq!(pick_pool_pod(candidates), Some("ready".to_string()));
    }

    #[test]
    fn among_ready_pods_oldest_wins() {
        let candidates = vec![candidate("newer", true, 200), candidate("older", true, 100)];
        assert_eq!(pick_pool_pod(candidates), Some("older".to_string()));
    }

    #[test]
    fn single_candidate_is_picked() {
        let candidates = vec![candidate("only", false, 50)];
        assert_eq!(pick_pool_pod(candidates), Some("only".to_string()));
    }
}
