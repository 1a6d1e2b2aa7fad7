use anyhow::Result;
use kube::CustomResourceExt;

use sandbox_operator::crd::{Sandbox, SandboxClaim, SandboxTemplate, SandboxWarmPool};

/// Print the four CRD manifests to stdout for `kubectl apply -f -`.
pub fn generate() -> Result<()> {
    for yaml in crd_yamls()? {
        println!("---");
        println!("{yaml}");
    }
    Ok(())
}

/// Apply the four CRDs directly to the connected cluster.
pub async fn install() -> Result<()> {
    use k8s_openapi::apiextensions_apiserver::pkg::apis::apiextensions::v1::CustomResourceDefinition;
    use kube::{Api, Client};

    let client = Client::try_default().await?;
    let crds: Api<CustomResourceDefinition> = Api::all(client);

    for crd in [
        Sandbox::crd(),
        SandboxClaim::crd(),
        SandboxTemplate::crd(),
        SandboxWarmPool::crd(),
    ] {
        let name = crd.metadata.name.clone().unwrap_or_default();
        match crds.create(&Default::default(), &crd).await {
            Ok(_) => println!("CRD '{name}' installed successfully"),
            Err(kube::Error::Api(err)) if err.code == 409 => {
                println!("CRD '{name}' already exists - skipping");
            }
            Err(e) => return Err(e.into()),
        }
    }

    Ok(())
}

fn crd_yamls() -> Result<Vec<String>> {
    Ok(vec![
        serde_yaml::to_string(&Sandbox::crd())?,
        serde_yaml::to_string(&SandboxClaim::crd())?,
        serde_yaml::to_string(&SandboxTemplate::crd())?,
        serde_yaml::to_string(&SandboxWarmPool::crd())?,
    ])
}
