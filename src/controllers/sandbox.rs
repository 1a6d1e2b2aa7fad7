//! Sandbox reconciler: maintains exactly one-or-zero pod, one headless
//! service, and the sandbox's PVCs; enforces TTL; adopts an
//! externally-named pod when annotated.
//!
//! `Controller::new(...).owns(...).run(reconcile, error_policy, ctx)` driven
//! via `.for_each()` against `tokio::select!`/`signal::ctrl_c()`, JSON-merge
//! `Patch`es applied with `PatchParams::apply(FIELD_MANAGER)`, and a
//! status-semantic-diff guard before `patch_status`.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use futures::StreamExt;
use k8s_openapi::api::core::v1::{Pod, Service, ServicePort, ServiceSpec};
use kube::api::{Api, Patch, PatchParams};
use kube::runtime::controller::{Action, Controller};
use kube::{Client, Resource, ResourceExt};
use tracing::{info, warn};

use crate::conditions::{self, Condition};
use crate::crd::Sandbox;
use crate::error::{Error, ErrorAccumulator, TransientError};
use crate::labels::{self, FIELD_MANAGER};
use crate::metrics;
use crate::ownership::{self, Ownership};
use crate::podspec;

const POD_NAME_ANNOTATION: &str = crate::labels::POD_NAME_ANNOTATION;
const MIN_TTL_REQUEUE: Duration = Duration::from_secs(2);

struct Ctx {
    client: Client,
    requeue_interval: Duration,
}

pub async fn run(client: Client, ready: Arc<AtomicBool>, requeue_interval: Duration) {
    let sandboxes: Api<Sandbox> = Api::all(client.clone());
    let pods: Api<Pod> = Api::all(client.clone());
    let services: Api<Service> = Api::all(client.clone());

    let ctx = Arc::new(Ctx { client, requeue_interval });

    Controller::new(sandboxes, Default::default())
        .owns(pods, Default::default())
        .owns(services, Default::default())
        .run(reconcile, error_policy, ctx)
        .for_each(|result| {
            ready.store(true, Ordering::Relaxed);
            async move {
                if let Err(e) = result {
                    warn!(error = %e, "sandbox_reconcile_dispatch_error");
                }
            }
        })
        .await;
}

fn error_policy(_sandbox: Arc<Sandbox>, _error: &Error, ctx: Arc<Ctx>) -> Action {
    metrics::SANDBOX_RECONCILE_ERRORS.inc();
    Action::requeue(ctx.requeue_interval)
}

async fn reconcile(sandbox: Arc<Sandbox>, ctx: Arc<Ctx>) -> Result<Action, Error> {
    let name = sandbox.name_any();
    let namespace = sandbox.namespace().unwrap_or_default();

    if sandbox.metadata.deletion_timestamp.is_some() {
        return Ok(Action::await_change());
    }

    metrics::SANDBOX_RECONCILE_TOTAL.inc();
    info!(sandbox = %name, namespace = %namespace, "sandbox_reconcile_start");

    let client = &ctx.client;
    let name_hash = crate::hash::name_hash(&name);
    let uid = sandbox.uid().unwrap_or_default();
    let owner = sandbox.controller_owner_ref(&()).expect("Sandbox has a uid");

    let mut errors = ErrorAccumulator::new();
    let previous_status = sandbox.status.clone().unwrap_or_default();
    let mut status = previous_status.clone();

    let pods_api: Api<Pod> = Api::namespaced(client.clone(), &namespace);
    let services_api: Api<Service> = Api::namespaced(client.clone(), &namespace);
    let pvcs_api: Api<k8s_openapi::api::core::v1::PersistentVolumeClaim> =
        Api::namespaced(client.clone(), &namespace);

    let annotation = sandbox
        .metadata
        .annotations
        .as_ref()
        .and_then(|a| a.get(POD_NAME_ANNOTATION))
        .cloned();

    let pod = if sandbox.spec.replicas == 0 {
        reconcile_zero_replicas(client, &pods_api, &name, &namespace, annotation.as_deref(), &mut errors).await;
        None
    } else {
        let target_name = target_pod_name(&name, annotation.as_deref());
        match reconcile_pod(
            &pods_api,
            &target_name,
            &namespace,
            &sandbox,
            &name_hash,
            &uid,
            owner.clone(),
            annotation.is_some(),
            &mut errors,
        )
        .await
        {
            Ok(p) => p,
            Err(_) => None,
        }
    };

    reconcile_service(&services_api, &name, &namespace, &name_hash, owner.clone(), &mut status, &mut errors)
        .await;

    reconcile_pvcs(&pvcs_api, &sandbox, &name, &namespace, owner.clone(), &mut errors).await;

    status.replicas = Some(if pod.is_some() { 1 } else { 0 });

    let (ready, reason, message) = ready_decision(
        errors.has_errors(),
        status.service.is_some(),
        pod.as_ref().map(pod_observed_state),
    );

    let now = Utc::now();
    let previous_ready = Condition::find(&previous_status.conditions, conditions::READY).cloned();
    let ready_condition = Condition::ready(
        ready,
        reason,
        message,
        sandbox.metadata.generation,
        previous_ready.as_ref(),
        now,
    );
    let was_ready = previous_ready.as_ref().is_some_and(Condition::is_true);
    status.conditions = conditions::sorted(vec![ready_condition]);

    if ready && !was_ready {
        status.first_ready_time.get_or_insert(now);
        observe_creation_latency(client, &namespace, &sandbox, now, &mut errors).await;
    }

    let ttl = ttl_decision(
        sandbox.spec.shutdown_time,
        now,
        sandbox.spec.shutdown_policy == crate::crd::ShutdownPolicy::Delete,
    );
    if let TtlDecision::ExpireRetain = ttl {
        status.shutdown_at = Some(now);
    }

    if status != previous_status {
        let patch = serde_json::json!({ "status": status });
        if let Err(e) = Api::<Sandbox>::namespaced(client.clone(), &namespace)
            .patch_status(&name, &PatchParams::apply(FIELD_MANAGER), &Patch::Merge(&patch))
            .await
        {
            errors.push_kube(e);
        }
    }

    match ttl {
        TtlDecision::ExpireDelete => {
            match Api::<Sandbox>::namespaced(client.clone(), &namespace)
                .delete(&name, &Default::default())
                .await
            {
                Ok(_) | Err(kube::Error::Api(kube::error::ErrorResponse { code: 404, .. })) => {
                    return Ok(Action::await_change());
                }
                Err(e) => errors.push_kube(e),
            }
        }
        TtlDecision::RequeueAfter(d) => return Ok(Action::requeue(d)),
        TtlDecision::NoShutdownTime | TtlDecision::ExpireRetain => {}
    }

    match errors.into_requeue_error() {
        Some(e) => Err(e),
        None => Ok(Action::requeue(ctx.requeue_interval)),
    }
}

/// The pod name a `Sandbox` targets: the adoption annotation if present,
/// otherwise the sandbox's own name.
pub fn target_pod_name(sandbox_name: &str, annotation: Option<&str>) -> String {
    annotation.unwrap_or(sandbox_name).to_string()
}

/// On `replicas=0`: delete the target pod (sandbox-named, or the
/// annotation's pod if adoption was used), then clear the adoption
/// annotation so it no longer refers to a pod this reconcile just removed.
/// Re-adoption after scaling back up requires the annotation to be
/// re-supplied.
async fn reconcile_zero_replicas(
    client: &Client,
    pods_api: &Api<Pod>,
    sandbox_name: &str,
    namespace: &str,
    annotation: Option<&str>,
    errors: &mut ErrorAccumulator,
) {
    let target = target_pod_name(sandbox_name, annotation);
    match pods_api.delete(&target, &Default::default()).await {
        Ok(_) | Err(kube::Error::Api(kube::error::ErrorResponse { code: 404, .. })) => {}
        Err(e) => {
            errors.push_kube(e);
            return;
        }
    }

    if annotation.is_some() {
        let patch = serde_json::json!({
            "metadata": { "annotations": { POD_NAME_ANNOTATION: serde_json::Value::Null } }
        });
        let sandboxes: Api<Sandbox> = Api::namespaced(client.clone(), namespace);
        if let Err(e) = sandboxes
            .patch(sandbox_name, &PatchParams::apply(FIELD_MANAGER), &Patch::Merge(&patch))
            .await
        {
            errors.push_kube(e);
        }
    }
}

#[allow(clippy::too_many_arguments)]
async fn reconcile_pod(
    pods_api: &Api<Pod>,
    target_name: &str,
    namespace: &str,
    sandbox: &Sandbox,
    name_hash: &str,
    sandbox_uid: &str,
    owner: k8s_openapi::apimachinery::pkg::apis::meta::v1::OwnerReference,
    is_adoption: bool,
    errors: &mut ErrorAccumulator,
) -> Result<Option<Pod>, ()> {
    match pods_api.get_opt(target_name).await {
        Ok(Some(existing)) => {
            let ownership = ownership::classify(existing.metadata.owner_references.as_ref(), sandbox_uid);
            if matches!(ownership, Ownership::None) {
                let patch = serde_json::json!({
                    "metadata": {
                        "labels": { labels::SANDBOX_NAME_HASH: name_hash },
                        "ownerReferences": [owner],
                    }
                });
                if let Err(e) = pods_api
                    .patch(target_name, &PatchParams::apply(FIELD_MANAGER), &Patch::Merge(&patch))
                    .await
                {
                    errors.push_kube(e);
                }
            } else if ownership.is_foreign() {
                warn!(pod = %target_name, namespace = %namespace, "pod_owned_by_foreign_controller");
            }
            Ok(Some(existing))
        }
        Ok(None) if is_adoption => {
            errors.push_transient(TransientError::AdoptionTargetMissing(target_name.to_string()));
            Err(())
        }
        Ok(None) => {
            let injected = [(labels::SANDBOX_NAME_HASH, name_hash)];
            let pod = podspec::materialize_pod(
                target_name,
                namespace,
                &sandbox.spec.pod_template,
                &sandbox.spec.volume_claim_templates,
                &injected,
                owner,
            );
            match pods_api.create(&Default::default(), &pod).await {
                Ok(created) => Ok(Some(created)),
                Err(e) => {
                    errors.push_kube(e);
                    Err(())
                }
            }
        }
        Err(e) => {
            errors.push_kube(e);
            Err(())
        }
    }
}

async fn reconcile_service(
    services_api: &Api<Service>,
    name: &str,
    namespace: &str,
    name_hash: &str,
    owner: k8s_openapi::apimachinery::pkg::apis::meta::v1::OwnerReference,
    status: &mut crate::crd::SandboxStatus,
    errors: &mut ErrorAccumulator,
) {
    match services_api.get_opt(name).await {
        Ok(Some(_)) => {}
        Ok(None) => {
            let mut selector = std::collections::BTreeMap::new();
            selector.insert(labels::SANDBOX_NAME_HASH.to_string(), name_hash.to_string());
            let service = Service {
                metadata: k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta {
                    name: Some(name.to_string()),
                    namespace: Some(namespace.to_string()),
                    owner_references: Some(vec![owner]),
                    ..Default::default()
                },
                spec: Some(ServiceSpec {
                    cluster_ip: Some("None".to_string()),
                    selector: Some(selector),
                    ports: Some(vec![ServicePort {
                        port: 80,
                        ..Default::default()
                    }]),
                    ..Default::default()
                }),
                status: None,
            };
            if let Err(e) = services_api.create(&Default::default(), &service).await {
                errors.push_kube(e);
                return;
            }
        }
        Err(e) => {
            errors.push_kube(e);
            return;
        }
    }
    status.service = Some(name.to_string());
    status.service_fqdn = Some(format!("{name}.{namespace}.svc.cluster.local"));
    status.selector = Some(labels::sandbox_selector_string(name_hash));
}

async fn reconcile_pvcs(
    pvcs_api: &Api<k8s_openapi::api::core::v1::PersistentVolumeClaim>,
    sandbox: &Sandbox,
    sandbox_name: &str,
    namespace: &str,
    owner: k8s_openapi::apimachinery::pkg::apis::meta::v1::OwnerReference,
    errors: &mut ErrorAccumulator,
) {
    for vct in &sandbox.spec.volume_claim_templates {
        let vct_name = vct.metadata.name.clone().unwrap_or_default();
        let pvc_name = labels::pvc_name(&vct_name, sandbox_name);
        match pvcs_api.get_opt(&pvc_name).await {
            Ok(Some(_)) => continue,
            Ok(None) => {
                let pvc = podspec::materialize_pvc(vct, sandbox_name, namespace, &[], owner.clone());
                if let Err(kube::Error::Api(e)) = pvcs_api.create(&Default::default(), &pvc).await {
                    if e.code != 409 {
                        errors.push_kube(kube::Error::Api(e));
                    }
                }
            }
            Err(e) => errors.push_kube(e),
        }
    }
}

struct PodObservedState {
    running: bool,
    ready: bool,
}

fn pod_observed_state(pod: &Pod) -> PodObservedState {
    let status = pod.status.as_ref();
    let running = status.and_then(|s| s.phase.as_deref()) == Some("Running");
    let ready = status
        .and_then(|s| s.conditions.as_ref())
        .into_iter()
        .flatten()
        .any(|c| c.type_ == "Ready" && c.status == "True");
    PodObservedState { running, ready }
}

/// The Ready-condition decision table.
pub fn ready_decision(
    has_error: bool,
    service_exists: bool,
    pod: Option<&PodObservedState>,
) -> (bool, &'static str, String) {
    if has_error {
        return (false, "ReconcilerError", "a reconcile error occurred".to_string());
    }
    if !service_exists {
        return (false, "DependenciesNotReady", "service not yet created".to_string());
    }
    match pod {
        None => (false, "DependenciesNotReady", "pod not yet created".to_string()),
        Some(p) if p.running && p.ready => {
            (true, "DependenciesReady", "pod is running and ready".to_string())
        }
        Some(_) => (false, "DependenciesNotReady", "pod not yet running and ready".to_string()),
    }
}

async fn observe_creation_latency(
    client: &Client,
    namespace: &str,
    sandbox: &Sandbox,
    now: DateTime<Utc>,
    errors: &mut ErrorAccumulator,
) {
    let already_observed = sandbox
        .metadata
        .annotations
        .as_ref()
        .is_some_and(|a| a.contains_key(labels::READINESS_OBSERVED_ANNOTATION));
    if already_observed {
        return;
    }
    if let Some(created) = sandbox.metadata.creation_timestamp.as_ref() {
        let millis = (now - created.0).num_milliseconds().max(0) as f64;
        metrics::SANDBOX_CREATION_LATENCY.observe(millis);
    }

    let patch = serde_json::json!({
        "metadata": { "annotations": { labels::READINESS_OBSERVED_ANNOTATION: "true" } }
    });
    let sandboxes: Api<Sandbox> = Api::namespaced(client.clone(), namespace);
    if let Err(e) = sandboxes
        .patch(&sandbox.name_any(), &PatchParams::apply(FIELD_MANAGER), &Patch::Merge(&patch))
        .await
    {
        errors.push_kube(e);
    }
}

/// TTL disposition.
#[derive(Debug, Clone, PartialEq)]
pub enum TtlDecision {
    NoShutdownTime,
    RequeueAfter(Duration),
    ExpireDelete,
    ExpireRetain,
}

pub fn ttl_decision(shutdown_time: Option<DateTime<Utc>>, now: DateTime<Utc>, delete_on_expiry: bool) -> TtlDecision {
    let Some(t) = shutdown_time else {
        return TtlDecision::NoShutdownTime;
    };
    if t <= now {
        return if delete_on_expiry {
            TtlDecision::ExpireDelete
        } else {
            TtlDecision::ExpireRetain
        };
    }
    let remaining = (t - now).to_std().unwrap_or_default();
    TtlDecision::RequeueAfter(std::cmp::max(remaining / 2, MIN_TTL_REQUEUE))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn target_pod_name_uses_sandbox_name_without_annotation() {
        assert_eq!(target_pod_name("s", None), "s");
    }

    #[test]
    fn target_pod_name_uses_annotation_when_present() {
        assert_eq!(target_pod_name("s", Some("adopted-pod")), "adopted-pod");
    }

    #[test]
    fn ready_decision_error_takes_priority() {
        let (ready, reason, _) = ready_decision(true, true, Some(&PodObservedState { running: true, ready: true }));
        assert!(!ready);
        assert_eq!(reason, "ReconcilerError");
    }

    #[test]
    fn ready_decision_no_service_is_not_ready() {
        let (ready, reason, _) = ready_decision(false, false, None);
        assert!(!ready);
        assert_eq!(reason, "DependenciesNotReady");
    }

    #[test]
    fn ready_decision_service_present_no_pod_is_not_ready() {
        let (ready, reason, _) = ready_decision(false, true, None);
        assert!(!ready);
        assert_eq!(reason, "DependenciesNotReady");
    }

    #[test]
    fn ready_decision_running_and_ready_pod_is_ready() {
        let (ready, reason, _) = ready_decision(false, true, Some(&PodObservedState { running: true, ready: true }));
        assert!(ready);
        assert_eq!(reason, "DependenciesReady");
    }

    #[test]
    fn ready_decision_running_but_not_ready_pod_is_not_ready() {
        let (ready, reason, _) = ready_decision(false, true, Some(&PodObservedState { running: true, ready: false }));
        assert!(!ready);
        assert_eq!(reason, "DependenciesNotReady");
    }

    #[test]
    fn ttl_decision_without_shutdown_time_is_skip() {
        let now = Utc::now();
        assert_eq!(ttl_decision(None, now, false), TtlDecision::NoShutdownTime);
    }

    #[test]
    fn ttl_decision_past_with_delete_policy_expires_delete() {
        let now = Utc::now();
        let past = now - chrono::Duration::seconds(10);
        assert_eq!(ttl_decision(Some(past), now, true), TtlDecision::ExpireDelete);
    }

    #[test]
    fn ttl_decision_past_with_retain_policy_expires_retain() {
        let now = Utc::now();
        let past = now - chrono::Duration::seconds(10);
        assert_eq!(ttl_decision(Some(past), now, false), TtlDecision::ExpireRetain);
    }

    #[test]
    fn ttl_decision_future_requeues_at_half_remaining() {
        let now = Utc::now();
        let future = now + chrono::Duration::seconds(100);
        match ttl_decision(Some(future), now, false) {
            TtlDecision::RequeueAfter(d) => {
                assert!(d.as_secs() >= 49 && d.as_secs() <= 51);
            }
            other => panic!("expected RequeueAfter, got {other:?}"),
        }
    }

    #[test]
    fn ttl_decision_future_requeue_floor_is_two_seconds() {
        let now = Utc::now();
        let soon = now + chrono::Duration::seconds(1);
        assert_eq!(ttl_decision(Some(soon), now, false), TtlDecision::RequeueAfter(MIN_TTL_REQUEUE));
    }
}
