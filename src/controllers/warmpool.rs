//! WarmPool reconciler: maintains a population of owned pods (each with its
//! PVCs) sized to `spec.replicas`, guarded against replica explosion,
//! adopting orphans and deleting excess newest-first.
//!
//! Pod/PVC materialization reuses `podspec`'s typed struct-literal
//! construction over `serde_json::json!` templating.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use futures::StreamExt;
use k8s_openapi::api::core::v1::{PersistentVolumeClaim, Pod};
use kube::api::{Api, ListParams, Patch, PatchParams};
use kube::runtime::controller::{Action, Controller};
use kube::{Client, Resource, ResourceExt};
use tracing::{info, warn};

use crate::crd::{SandboxTemplate, SandboxWarmPool};
use crate::error::{Error, ErrorAccumulator};
use crate::labels::{self, FIELD_MANAGER};
use crate::metrics;
use crate::ownership::{self, Ownership};
use crate::podspec;

struct Ctx {
    client: Client,
    requeue_interval: Duration,
}

pub async fn run(client: Client, ready: Arc<AtomicBool>, requeue_interval: Duration) {
    let pools: Api<SandboxWarmPool> = Api::all(client.clone());
    let pods: Api<Pod> = Api::all(client.clone());
    let pvcs: Api<PersistentVolumeClaim> = Api::all(client.clone());

    let ctx = Arc::new(Ctx { client, requeue_interval });

    Controller::new(pools, Default::default())
        .owns(pods, Default::default())
        .owns(pvcs, Default::default())
        .run(reconcile, error_policy, ctx)
        .for_each(|result| {
            ready.store(true, Ordering::Relaxed);
            async move {
                if let Err(e) = result {
                    warn!(error = %e, "warmpool_reconcile_dispatch_error");
                }
            }
        })
        .await;
}

fn error_policy(_pool: Arc<SandboxWarmPool>, _error: &Error, ctx: Arc<Ctx>) -> Action {
    metrics::WARMPOOL_RECONCILE_ERRORS.inc();
    Action::requeue(ctx.requeue_interval)
}

async fn reconcile(pool: Arc<SandboxWarmPool>, ctx: Arc<Ctx>) -> Result<Action, Error> {
    let name = pool.name_any();
    let namespace = pool.namespace().unwrap_or_default();

    if pool.metadata.deletion_timestamp.is_some() {
        return Ok(Action::await_change());
    }

    metrics::WARMPOOL_RECONCILE_TOTAL.inc();
    info!(pool = %name, namespace = %namespace, "warmpool_reconcile_start");

    let client = &ctx.client;
    let uid = pool.uid().unwrap_or_default();
    let owner = pool.controller_owner_ref(&()).expect("SandboxWarmPool has a uid");
    let pool_hash = crate::hash::name_hash(&name);

    let pods_api: Api<Pod> = Api::namespaced(client.clone(), &namespace);
    let pvcs_api: Api<PersistentVolumeClaim> = Api::namespaced(client.clone(), &namespace);

    let mut errors = ErrorAccumulator::new();
    let list_params = ListParams::default().labels(&format!("{}={pool_hash}", labels::POOL));

    let all_pods = pods_api.list(&list_params).await.map_err(Error::Kube)?;
    let all_pvcs = pvcs_api.list(&list_params).await.map_err(Error::Kube)?;

    let classified = classify_pods(&all_pods.items, &uid);
    let mut active: Vec<&Pod> = classified
        .owned
        .iter()
        .chain(classified.orphaned.iter())
        .copied()
        .collect();
    active.sort_by_key(|p| p.metadata.creation_timestamp.clone());

    for orphan in &classified.orphaned {
        adopt_pod(&pods_api, orphan, owner.clone(), &mut errors).await;
    }

    let owned_pvc_count = all_pvcs
        .items
        .iter()
        .filter(|pvc| ownership::classify(pvc.metadata.owner_references.as_ref(), &uid).is_owned_by(&uid))
        .count();

    let desired = pool.spec.replicas.max(0) as usize;
    let decision = population_decision(desired, active.len(), owned_pvc_count);

    match decision {
        PopulationDecision::CreateSuffixesFor(count) => {
            metrics::WARMPOOL_READY_REPLICAS
                .with_label_values(&[&namespace, &name])
                .set(active.iter().filter(|p| pod_ready(p)).count() as i64);
            create_pods(
                &pods_api,
                &pvcs_api,
                client,
                &pool,
                &namespace,
                &pool_hash,
                owner.clone(),
                count,
                &mut errors,
            )
            .await;
        }
        PopulationDecision::DeleteNewest(count) => {
            delete_newest(&pods_api, &active, count, &mut errors).await;
        }
        PopulationDecision::ExplosionGuardSuppressed => {
            metrics::WARMPOOL_EXPLOSION_GUARD_TRIGGERED
                .with_label_values(&[&namespace, &name])
                .inc();
            warn!(pool = %name, namespace = %namespace, "warmpool_explosion_guard_suppressed_create");
        }
        PopulationDecision::Noop => {}
    }

    let ready_replicas = active.iter().filter(|p| pod_ready(p)).count() as i32;
    let mut status = pool.status.clone().unwrap_or_default();
    status.replicas = Some(active.len() as i32);
    status.ready_replicas = Some(ready_replicas);

    if Some(&status) != pool.status.as_ref() {
        let patch = serde_json::json!({ "status": status });
        if let Err(e) = Api::<SandboxWarmPool>::namespaced(client.clone(), &namespace)
            .patch_status(&name, &PatchParams::apply(FIELD_MANAGER), &Patch::Merge(&patch))
            .await
        {
            errors.push_kube(e);
        }
    }

    match errors.into_requeue_error() {
        Some(e) => Err(e),
        None => Ok(Action::requeue(ctx.requeue_interval)),
    }
}

struct Classified<'a> {
    owned: Vec<&'a Pod>,
    orphaned: Vec<&'a Pod>,
}

fn classify_pods<'a>(pods: &'a [Pod], pool_uid: &str) -> Classified<'a> {
    let mut owned = Vec::new();
    let mut orphaned = Vec::new();
    for pod in pods {
        if pod.metadata.deletion_timestamp.is_some() {
            continue;
        }
        match ownership::classify(pod.metadata.owner_references.as_ref(), pool_uid) {
            Ownership::ControlledBy(_) => owned.push(pod),
            Ownership::None => orphaned.push(pod),
            Ownership::ForeignController(_) => {}
        }
    }
    Classified { owned, orphaned }
}

async fn adopt_pod(pods_api: &Api<Pod>, pod: &Pod, owner: k8s_openapi::apimachinery::pkg::apis::meta::v1::OwnerReference, errors: &mut ErrorAccumulator) {
    let name = pod.name_any();
    let patch = serde_json::json!({ "metadata": { "ownerReferences": [owner] } });
    if let Err(e) = pods_api
        .patch(&name, &PatchParams::apply(FIELD_MANAGER), &Patch::Merge(&patch))
        .await
    {
        errors.push_kube(e);
    }
}

/// Whether to create, delete, or do nothing this pass.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PopulationDecision {
    CreateSuffixesFor(usize),
    DeleteNewest(usize),
    ExplosionGuardSuppressed,
    Noop,
}

pub fn population_decision(desired: usize, active: usize, owned_pvcs: usize) -> PopulationDecision {
    if active < desired {
        if owned_pvcs > active {
            return PopulationDecision::ExplosionGuardSuppressed;
        }
        return PopulationDecision::CreateSuffixesFor(desired - active);
    }
    if active > desired {
        return PopulationDecision::DeleteNewest(active - desired);
    }
    PopulationDecision::Noop
}

pub(crate) fn pod_ready(pod: &Pod) -> bool {
    pod.status
        .as_ref()
        .and_then(|s| s.conditions.as_ref())
        .into_iter()
        .flatten()
        .any(|c| c.type_ == "Ready" && c.status == "True")
}

#[allow(clippy::too_many_arguments)]
async fn create_pods(
    pods_api: &Api<Pod>,
    pvcs_api: &Api<PersistentVolumeClaim>,
    client: &Client,
    pool: &SandboxWarmPool,
    namespace: &str,
    pool_hash: &str,
    owner: k8s_openapi::apimachinery::pkg::apis::meta::v1::OwnerReference,
    count: usize,
    errors: &mut ErrorAccumulator,
) {
    let templates_api: Api<SandboxTemplate> = Api::namespaced(client.clone(), namespace);
    let template = match templates_api.get_opt(&pool.spec.sandbox_template_ref.name).await {
        Ok(Some(t)) => t,
        Ok(None) => {
            errors.push_terminal(crate::error::TerminalError::TemplateNotFound(
                pool.spec.sandbox_template_ref.name.clone(),
            ));
            return;
        }
        Err(e) => {
            errors.push_kube(e);
            return;
        }
    };
    let template_hash = crate::hash::name_hash(&pool.spec.sandbox_template_ref.name);

    for _ in 0..count {
        let pod_name = format!("{}-{}", pool.name_any(), super::random_suffix());
        let injected = [
            (labels::POOL, pool_hash),
            (labels::SANDBOX_TEMPLATE_REF_HASH, template_hash.as_str()),
        ];

        for vct in &template.spec.volume_claim_templates {
            let pvc = podspec::materialize_pvc(vct, &pod_name, namespace, &injected, owner.clone());
            match pvcs_api.create(&Default::default(), &pvc).await {
                Ok(_) => {}
                Err(kube::Error::Api(e)) if e.code == 409 => {}
                Err(e) => {
                    errors.push_kube(e);
                    continue;
                }
            }
        }

        let pod = podspec::materialize_pod(
            &pod_name,
            namespace,
            &template.spec.pod_template,
            &template.spec.volume_claim_templates,
            &injected,
            owner.clone(),
        );
        if let Err(e) = pods_api.create(&Default::default(), &pod).await {
            errors.push_kube(e);
        }
    }
}

async fn delete_newest(pods_api: &Api<Pod>, active: &[&Pod], count: usize, errors: &mut ErrorAccumulator) {
    let mut by_age = active.to_vec();
    by_age.sort_by_key(|p| std::cmp::Reverse(p.metadata.creation_timestamp.clone()));
    for pod in by_age.into_iter().take(count) {
        let name = pod.name_any();
        match pods_api.delete(&name, &Default::default()).await {
            Ok(_) | Err(kube::Error::Api(kube::error::ErrorResponse { code: 404, .. })) => {}
            Err(e) => errors.push_kube(e),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn steady_state_is_noop() {
        assert_eq!(population_decision(3, 3, 3), PopulationDecision::Noop);
    }

    #[test]
    fn below_desired_with_matching_pvcs_creates() {
        assert_eq!(population_decision(3, 1, 1), PopulationDecision::CreateSuffixesFor(2));
    }

    #[test]
    fn below_desired_with_excess_pvcs_suppresses_create() {
        assert_eq!(population_decision(1, 0, 1), PopulationDecision::ExplosionGuardSuppressed);
    }

    #[test]
    fn above_desired_deletes_excess() {
        assert_eq!(population_decision(1, 3, 3), PopulationDecision::DeleteNewest(2));
    }

    #[test]
    fn zero_desired_with_none_active_is_noop() {
        assert_eq!(population_decision(0, 0, 0), PopulationDecision::Noop);
    }

    #[test]
    fn explosion_guard_only_fires_when_pvcs_strictly_exceed_active() {
        assert_eq!(population_decision(2, 1, 1), PopulationDecision::CreateSuffixesFor(1));
    }
}
