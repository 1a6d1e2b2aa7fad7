use anyhow::Context;
use kube::api::ListParams;
use kube::{Api, Client, ResourceExt};

use sandbox_operator::conditions::{self, Condition};
use sandbox_operator::crd::{Sandbox, SandboxClaim, SandboxWarmPool};

pub async fn run(resource: String) -> anyhow::Result<()> {
    let client = Client::try_default()
        .await
        .context("Failed to connect to Kubernetes cluster. Is your kubeconfig valid?")?;

    match resource.as_str() {
        "sandboxes" => list_sandboxes(client).await,
        "claims" => list_claims(client).await,
        "warmpools" => list_warmpools(client).await,
        other => anyhow::bail!("Unsupported resource '{other}'. Supported: sandboxes, claims, warmpools"),
    }
}

fn ready_column(conditions: &[Condition]) -> &'static str {
    match Condition::find(conditions, conditions::READY) {
        Some(c) if c.is_true() => "True",
        Some(_) => "False",
        None => "Unknown",
    }
}

async fn list_sandboxes(client: Client) -> anyhow::Result<()> {
    let api: Api<Sandbox> = Api::all(client);
    let list = api
        .list(&ListParams::default())
        .await
        .context("Failed to list sandboxes. Check RBAC permissions.")?;

    let mut rows: Vec<(String, String, String, String, String)> = list
        .into_iter()
        .map(|s| {
            let namespace = s.namespace().unwrap_or_default();
            let name = s.name_any();
            let replicas = s
                .status
                .as_ref()
                .and_then(|st| st.replicas)
                .map(|r| r.to_string())
                .unwrap_or_else(|| "?".to_string());
            let service = s.status.as_ref().and_then(|st| st.service.clone()).unwrap_or_default();
            let ready = s
                .status
                .as_ref()
                .map(|st| ready_column(&st.conditions))
                .unwrap_or("Unknown")
                .to_string();
            (namespace, name, replicas, service, ready)
        })
        .collect();
    rows.sort_by(|a, b| a.0.cmp(&b.0).then(a.1.cmp(&b.1)));

    println!("{:<20} {:<30} {:<10} {:<30} {:<10}", "NAMESPACE", "NAME", "REPLICAS", "SERVICE", "READY");
    println!("{}", "-".repeat(102));
    for (ns, name, replicas, service, ready) in &rows {
        println!("{ns:<20} {name:<30} {replicas:<10} {service:<30} {ready:<10}");
    }
    println!("\nTotal: {} sandboxes", rows.len());
    Ok(())
}

async fn list_claims(client: Client) -> anyhow::Result<()> {
    let api: Api<SandboxClaim> = Api::all(client);
    let list = api
        .list(&ListParams::default())
        .await
        .context("Failed to list sandbox claims. Check RBAC permissions.")?;

    let mut rows: Vec<(String, String, String, String)> = list
        .into_iter()
        .map(|c| {
            let namespace = c.namespace().unwrap_or_default();
            let name = c.name_any();
            let sandbox = c
                .status
                .as_ref()
                .and_then(|st| st.sandbox_status.as_ref())
                .map(|r| r.name.clone())
                .unwrap_or_default();
            let ready = c
                .status
                .as_ref()
                .map(|st| ready_column(&st.conditions))
                .unwrap_or("Unknown")
                .to_string();
            (namespace, name, sandbox, ready)
        })
        .collect();
    rows.sort_by(|a, b| a.0.cmp(&b.0).then(a.1.cmp(&b.1)));

    println!("{:<20} {:<30} {:<30} {:<10}", "NAMESPACE", "NAME", "SANDBOX", "READY");
    println!("{}", "-".repeat(92));
    for (ns, name, sandbox, ready) in &rows {
        println!("{ns:<20} {name:<30} {sandbox:<30} {ready:<10}");
    }
    println!("\nTotal: {} claims", rows.len());
    Ok(())
}

async fn list_warmpools(client: Client) -> anyhow::Result<()> {
    let api: Api<SandboxWarmPool> = Api::all(client);
    let list = api
        .list(&ListParams::default())
        .await
        .context("Failed to list sandbox warm pools. Check RBAC permissions.")?;

    let mut rows: Vec<(String, String, String, String)> = list
        .into_iter()
        .map(|p| {
            let namespace = p.namespace().unwrap_or_default();
            let name = p.name_any();
            let desired = p.spec.replicas.to_string();
            let ready = p
                .status
                .as_ref()
                .and_then(|st| st.ready_replicas)
                .map(|r| r.to_string())
                .unwrap_or_else(|| "?".to_string());
            (namespace, name, desired, ready)
        })
        .collect();
    rows.sort_by(|a, b| a.0.cmp(&b.0).then(a.1.cmp(&b.1)));

    println!("{:<20} {:<30} {:<10} {:<10}", "NAMESPACE", "NAME", "DESIRED", "READY");
    println!("{}", "-".repeat(72));
    for (ns, name, desired, ready) in &rows {
        println!("{ns:<20} {name:<30} {desired:<10} {ready:<10}");
    }
    println!("\nTotal: {} warm pools", rows.len());
    Ok(())
}
