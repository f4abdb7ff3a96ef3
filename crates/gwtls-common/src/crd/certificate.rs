//! cert-manager Certificate, as produced by the controller
//!
//! This is the certificate-request contract handed to the issuance backend:
//! a secret name, the DNS names it must cover and the issuer to sign with.
//! The controller never reads the signed material.

use kube::CustomResource;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

use super::tls_policy::IssuerReference;
use crate::kube_utils::PolicyKey;
use crate::{POLICY_NAMESPACE_LABEL, POLICY_NAME_LABEL};

/// Certificate spec
#[derive(CustomResource, Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
#[kube(
    group = "cert-manager.io",
    version = "v1",
    kind = "Certificate",
    plural = "certificates",
    namespaced
)]
#[serde(rename_all = "camelCase")]
pub struct CertificateSpec {
    /// Name of the Secret to store the certificate
    pub secret_name: String,
    /// DNS names for the certificate, sorted and deduplicated
    #[serde(default)]
    pub dns_names: Vec<String>,
    /// Reference to the issuer
    pub issuer_ref: IssuerReference,
}

impl Certificate {
    /// Policy recorded in the ownership labels, if both labels are present
    pub fn owning_policy(&self) -> Option<PolicyKey> {
        let labels = self.metadata.labels.as_ref()?;
        let name = labels.get(POLICY_NAME_LABEL)?;
        let namespace = labels.get(POLICY_NAMESPACE_LABEL)?;
        Some(PolicyKey::new(namespace.clone(), name.clone()))
    }
}
