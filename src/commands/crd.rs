use anyhow::Result;
use kube::CustomResourceExt;

use pac_quota_controller::crd::ClusterResourceQuota;

/// Print the ClusterResourceQuota CRD YAML to stdout for `kubectl apply -f`.
pub fn generate() -> Result<()> {
    let crd = ClusterResourceQuota::crd();
    let yaml = serde_yaml::to_string(&crd)?;
    println!("{yaml}");
    Ok(())
}

/// Apply the ClusterResourceQuota CRD directly to the connected cluster.
pub async fn install() -> Result<()> {
    use k8s_openapi::apiextensions_apiserver::pkg::apis::apiextensions::v1::CustomResourceDefinition;
    use kube::{Api, Client};

    let client = Client::try_default().await?;
    let crds: Api<CustomResourceDefinition> = Api::all(client);

    let crd = ClusterResourceQuota::crd();
    let name = crd.metadata.name.clone().unwrap_or_default();

    match crds.create(&Default::default(), &crd).await {
        Ok(_) => {
            println!("CRD '{name}' installed successfully");
        }
        Err(kube::Error::Api(err)) if err.code == 409 => {
            println!("CRD '{name}' already exists - skipping");
        }
        Err(e) => return Err(e.into()),
    }

    Ok(())
}
