//! Store abstraction used by the policy engine
//!
//! Every read and write the reconcile pipeline performs goes through
//! [`PolicyKubeClient`], so tests can swap in a mock or an in-memory store.

use std::collections::BTreeMap;

use async_trait::async_trait;
use kube::api::{Api, DeleteParams, ListParams, Patch, PatchParams, PostParams};
use kube::core::DynamicObject;
use kube::Client;
#[cfg(test)]
use mockall::automock;
use tracing::debug;

use gwtls_common::crd::{
    Certificate, CertificateSpec, Condition, Gateway, IssuerKind, TLSPolicy, TLSPolicyStatus,
};
use gwtls_common::kube_utils::issuer_api_resource;
use gwtls_common::{
    Error, PolicyKey, FIELD_MANAGER, POLICY_FINALIZER, POLICY_NAMESPACE_LABEL, POLICY_NAME_LABEL,
};

/// Trait abstracting the object store for the TLS policy controller
#[cfg_attr(test, automock)]
#[async_trait]
pub trait PolicyKubeClient: Send + Sync {
    /// Get a TLSPolicy by name and namespace
    async fn get_policy(&self, name: &str, namespace: &str) -> Result<Option<TLSPolicy>, Error>;

    /// Patch the status of a TLSPolicy
    async fn patch_policy_status(
        &self,
        name: &str,
        namespace: &str,
        status: &TLSPolicyStatus,
    ) -> Result<(), Error>;

    /// Add the cleanup finalizer to a TLSPolicy
    async fn add_policy_finalizer(&self, policy: &TLSPolicy) -> Result<(), Error>;

    /// Remove the cleanup finalizer from a TLSPolicy
    async fn remove_policy_finalizer(&self, policy: &TLSPolicy) -> Result<(), Error>;

    /// Get a Gateway by name and namespace
    async fn get_gateway(&self, name: &str, namespace: &str) -> Result<Option<Gateway>, Error>;

    /// List Gateways in a namespace
    async fn list_gateways(&self, namespace: &str) -> Result<Vec<Gateway>, Error>;

    /// Merge-patch Gateway annotations, guarded by `resource_version`
    ///
    /// A `None` value removes the annotation. Fails with a 409 conflict when
    /// the stored object has moved past `resource_version`.
    async fn patch_gateway_annotations(
        &self,
        name: &str,
        namespace: &str,
        resource_version: Option<String>,
        annotations: BTreeMap<String, Option<String>>,
    ) -> Result<Gateway, Error>;

    /// Replace the Gateway's status conditions, guarded by `resource_version`
    async fn patch_gateway_conditions(
        &self,
        name: &str,
        namespace: &str,
        resource_version: Option<String>,
        conditions: Vec<Condition>,
    ) -> Result<(), Error>;

    /// Whether a cert-manager issuer exists
    ///
    /// `Issuer` is looked up in `namespace`; `ClusterIssuer` is cluster-scoped.
    async fn issuer_exists(
        &self,
        kind: IssuerKind,
        name: &str,
        namespace: &str,
    ) -> Result<bool, Error>;

    /// List Certificates labelled as owned by a policy
    async fn list_certificates(&self, owner: &PolicyKey) -> Result<Vec<Certificate>, Error>;

    /// Create a Certificate
    async fn create_certificate(&self, certificate: &Certificate) -> Result<(), Error>;

    /// Replace a Certificate's spec in place
    async fn patch_certificate_spec(
        &self,
        name: &str,
        namespace: &str,
        spec: &CertificateSpec,
    ) -> Result<(), Error>;

    /// Delete a Certificate; an already-absent certificate is not an error
    async fn delete_certificate(&self, name: &str, namespace: &str) -> Result<(), Error>;
}

/// Real Kubernetes client implementation
pub struct PolicyKubeClientImpl {
    client: Client,
}

impl PolicyKubeClientImpl {
    /// Create a new PolicyKubeClientImpl wrapping the given client
    pub fn new(client: Client) -> Self {
        Self { client }
    }

    async fn patch_policy_finalizers(
        &self,
        policy: &TLSPolicy,
        finalizers: Vec<String>,
    ) -> Result<(), Error> {
        let key = policy.key();
        let api: Api<TLSPolicy> = Api::namespaced(self.client.clone(), &key.namespace);
        let patch = serde_json::json!({
            "metadata": {
                "finalizers": finalizers
            }
        });
        api.patch(
            &key.name,
            &PatchParams::apply(FIELD_MANAGER),
            &Patch::Merge(&patch),
        )
        .await?;
        Ok(())
    }
}

/// Label selector matching the Certificates owned by `owner`
fn owner_selector(owner: &PolicyKey) -> String {
    format!(
        "{}={},{}={}",
        POLICY_NAME_LABEL, owner.name, POLICY_NAMESPACE_LABEL, owner.namespace
    )
}

fn not_found_as_none<T>(result: Result<T, kube::Error>) -> Result<Option<T>, Error> {
    match result {
        Ok(obj) => Ok(Some(obj)),
        Err(kube::Error::Api(ae)) if ae.code == 404 => Ok(None),
        Err(e) => Err(e.into()),
    }
}

#[async_trait]
impl PolicyKubeClient for PolicyKubeClientImpl {
    async fn get_policy(&self, name: &str, namespace: &str) -> Result<Option<TLSPolicy>, Error> {
        let api: Api<TLSPolicy> = Api::namespaced(self.client.clone(), namespace);
        not_found_as_none(api.get(name).await)
    }

    async fn patch_policy_status(
        &self,
        name: &str,
        namespace: &str,
        status: &TLSPolicyStatus,
    ) -> Result<(), Error> {
        let api: Api<TLSPolicy> = Api::namespaced(self.client.clone(), namespace);
        let status_patch = serde_json::json!({ "status": status });

        api.patch_status(
            name,
            &PatchParams::apply(FIELD_MANAGER),
            &Patch::Merge(&status_patch),
        )
        .await?;

        Ok(())
    }

    async fn add_policy_finalizer(&self, policy: &TLSPolicy) -> Result<(), Error> {
        let mut finalizers = policy.metadata.finalizers.clone().unwrap_or_default();
        if finalizers.iter().any(|f| f == POLICY_FINALIZER) {
            return Ok(());
        }
        finalizers.push(POLICY_FINALIZER.to_string());
        self.patch_policy_finalizers(policy, finalizers).await
    }

    async fn remove_policy_finalizer(&self, policy: &TLSPolicy) -> Result<(), Error> {
        let finalizers: Vec<String> = policy
            .metadata
            .finalizers
            .iter()
            .flatten()
            .filter(|f| f.as_str() != POLICY_FINALIZER)
            .cloned()
            .collect();
        match self.patch_policy_finalizers(policy, finalizers).await {
            Err(e) if e.is_not_found() => Ok(()),
            other => other,
        }
    }

    async fn get_gateway(&self, name: &str, namespace: &str) -> Result<Option<Gateway>, Error> {
        let api: Api<Gateway> = Api::namespaced(self.client.clone(), namespace);
        not_found_as_none(api.get(name).await)
    }

    async fn list_gateways(&self, namespace: &str) -> Result<Vec<Gateway>, Error> {
        let api: Api<Gateway> = Api::namespaced(self.client.clone(), namespace);
        let list = api.list(&ListParams::default()).await?;
        Ok(list.items)
    }

    async fn patch_gateway_annotations(
        &self,
        name: &str,
        namespace: &str,
        resource_version: Option<String>,
        annotations: BTreeMap<String, Option<String>>,
    ) -> Result<Gateway, Error> {
        let api: Api<Gateway> = Api::namespaced(self.client.clone(), namespace);
        // resourceVersion in a merge patch turns it into a compare-and-swap
        let patch = serde_json::json!({
            "metadata": {
                "resourceVersion": resource_version,
                "annotations": annotations
            }
        });
        let gateway = api
            .patch(
                name,
                &PatchParams::apply(FIELD_MANAGER),
                &Patch::Merge(&patch),
            )
            .await?;
        debug!(gateway = %name, namespace = %namespace, "patched back-reference annotations");
        Ok(gateway)
    }

    async fn patch_gateway_conditions(
        &self,
        name: &str,
        namespace: &str,
        resource_version: Option<String>,
        conditions: Vec<Condition>,
    ) -> Result<(), Error> {
        let api: Api<Gateway> = Api::namespaced(self.client.clone(), namespace);
        let patch = serde_json::json!({
            "metadata": { "resourceVersion": resource_version },
            "status": { "conditions": conditions }
        });
        api.patch_status(
            name,
            &PatchParams::apply(FIELD_MANAGER),
            &Patch::Merge(&patch),
        )
        .await?;
        Ok(())
    }

    async fn issuer_exists(
        &self,
        kind: IssuerKind,
        name: &str,
        namespace: &str,
    ) -> Result<bool, Error> {
        let ar = issuer_api_resource(kind);
        let api: Api<DynamicObject> = if kind.is_namespaced() {
            Api::namespaced_with(self.client.clone(), namespace, &ar)
        } else {
            Api::all_with(self.client.clone(), &ar)
        };
        Ok(not_found_as_none(api.get(name).await)?.is_some())
    }

    async fn list_certificates(&self, owner: &PolicyKey) -> Result<Vec<Certificate>, Error> {
        // owned certificates are only ever created next to their policy
        let api: Api<Certificate> = Api::namespaced(self.client.clone(), &owner.namespace);
        let list = api
            .list(&ListParams::default().labels(&owner_selector(owner)))
            .await?;
        Ok(list.items)
    }

    async fn create_certificate(&self, certificate: &Certificate) -> Result<(), Error> {
        let namespace = certificate
            .metadata
            .namespace
            .as_deref()
            .ok_or_else(|| Error::validation_for("Certificate", "namespace is required"))?;
        let api: Api<Certificate> = Api::namespaced(self.client.clone(), namespace);
        api.create(
            &PostParams {
                field_manager: Some(FIELD_MANAGER.to_string()),
                ..Default::default()
            },
            certificate,
        )
        .await?;
        Ok(())
    }

    async fn patch_certificate_spec(
        &self,
        name: &str,
        namespace: &str,
        spec: &CertificateSpec,
    ) -> Result<(), Error> {
        let api: Api<Certificate> = Api::namespaced(self.client.clone(), namespace);
        let patch = serde_json::json!({
            "spec": {
                "dnsNames": spec.dns_names,
                "issuerRef": spec.issuer_ref,
            }
        });
        api.patch(
            name,
            &PatchParams::apply(FIELD_MANAGER),
            &Patch::Merge(&patch),
        )
        .await?;
        Ok(())
    }

    async fn delete_certificate(&self, name: &str, namespace: &str) -> Result<(), Error> {
        let api: Api<Certificate> = Api::namespaced(self.client.clone(), namespace);
        match api.delete(name, &DeleteParams::default()).await {
            Ok(_) => Ok(()),
            Err(kube::Error::Api(ae)) if ae.code == 404 => Ok(()),
            Err(e) => Err(e.into()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn owner_selector_pins_name_and_namespace() {
        let owner = PolicyKey {
            namespace: "ns".to_string(),
            name: "p1".to_string(),
        };
        let selector = owner_selector(&owner);
        assert!(selector.contains(&format!("{}=p1", POLICY_NAME_LABEL)));
        assert!(selector.contains(&format!("{}=ns", POLICY_NAMESPACE_LABEL)));
    }
}
