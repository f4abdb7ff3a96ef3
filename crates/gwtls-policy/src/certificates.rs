//! Certificate synchronizer
//!
//! Computes one Certificate per distinct listener secret and converges the
//! policy's owned Certificates to that set. Cleanup is always explicit: an
//! owned Certificate whose secret no listener references is deleted here, not
//! left to cascading garbage collection.

use std::collections::{BTreeMap, BTreeSet};

use kube::api::ObjectMeta;
use kube::{Resource, ResourceExt};
use tracing::{debug, info};

use gwtls_common::crd::{Certificate, CertificateSpec, IssuerReference, Listener, TLSPolicy};
use gwtls_common::{
    LABEL_MANAGED_BY, LABEL_MANAGED_BY_GWTLS, POLICY_NAMESPACE_LABEL, POLICY_NAME_LABEL,
};

use crate::client::PolicyKubeClient;
use crate::error::{PolicyError, Step};

/// Desired Certificate specs keyed by secret name
pub type DesiredCertificates = BTreeMap<String, CertificateSpec>;

/// Group TLS-terminating listeners by secret into Certificate specs
///
/// DNS names are the sorted, deduplicated hostnames of every listener sharing
/// a secret. Listeners without TLS, or in passthrough mode, are ignored. A
/// terminating listener without a hostname, or whose Secret lives outside the
/// gateway `namespace`, rejects the whole set so nothing is half-applied.
pub fn desired_certificates(
    listeners: &[Listener],
    namespace: &str,
    issuer: &IssuerReference,
) -> Result<DesiredCertificates, PolicyError> {
    let mut hosts: BTreeMap<String, BTreeSet<String>> = BTreeMap::new();

    for listener in listeners {
        let Some(cert_ref) = listener.certificate_ref() else {
            continue;
        };
        let secret = cert_ref.name.as_str();
        if !cert_ref.is_in_namespace(namespace) {
            return Err(PolicyError::CertificateSyncFailed {
                message: format!(
                    "listener '{}' references secret '{}' in namespace '{}'; certificates are only issued into the gateway namespace '{}'",
                    listener.name,
                    secret,
                    cert_ref.namespace.as_deref().unwrap_or_default(),
                    namespace
                ),
                retryable: false,
            });
        }
        let hostname = listener
            .hostname
            .as_deref()
            .filter(|h| !h.is_empty())
            .ok_or_else(|| PolicyError::CertificateSyncFailed {
                message: format!(
                    "listener '{}' terminates TLS with secret '{}' but has no hostname",
                    listener.name, secret
                ),
                retryable: false,
            })?;
        hosts
            .entry(secret.to_string())
            .or_default()
            .insert(hostname.to_string());
    }

    Ok(hosts
        .into_iter()
        .map(|(secret, names)| {
            let spec = CertificateSpec {
                secret_name: secret.clone(),
                dns_names: names.into_iter().collect(),
                issuer_ref: issuer.clone(),
            };
            (secret, spec)
        })
        .collect())
}

/// Operations that converge observed Certificates to the desired set
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct SyncPlan {
    /// Secrets to create Certificates for
    pub create: Vec<String>,
    /// Certificates whose spec drifted
    pub update: Vec<String>,
    /// Certificates no listener needs any more
    pub delete: Vec<String>,
}

impl SyncPlan {
    /// Whether the plan does nothing
    pub fn is_empty(&self) -> bool {
        self.create.is_empty() && self.update.is_empty() && self.delete.is_empty()
    }
}

/// Diff the desired set against the observed owned Certificates
pub fn plan(desired: &DesiredCertificates, observed: &[Certificate]) -> SyncPlan {
    let observed: BTreeMap<String, &Certificate> =
        observed.iter().map(|c| (c.name_any(), c)).collect();

    let mut plan = SyncPlan::default();
    for (secret, spec) in desired {
        match observed.get(secret) {
            None => plan.create.push(secret.clone()),
            Some(cert)
                if cert.spec.dns_names != spec.dns_names
                    || cert.spec.issuer_ref != spec.issuer_ref =>
            {
                plan.update.push(secret.clone())
            }
            Some(_) => {}
        }
    }
    plan.delete = observed
        .keys()
        .filter(|name| !desired.contains_key(*name))
        .cloned()
        .collect();
    plan
}

/// What a synchronization pass did
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct SyncSummary {
    /// Certificates created
    pub created: usize,
    /// Certificates updated in place
    pub updated: usize,
    /// Certificates deleted
    pub deleted: usize,
    /// Certificates in the desired set
    pub reconciled: usize,
}

impl SyncSummary {
    /// Whether anything was written
    pub fn changed(&self) -> bool {
        self.created + self.updated + self.deleted > 0
    }
}

fn owned_certificate(policy: &TLSPolicy, namespace: &str, spec: &CertificateSpec) -> Certificate {
    let key = policy.key();
    let labels = BTreeMap::from([
        (POLICY_NAME_LABEL.to_string(), key.name),
        (POLICY_NAMESPACE_LABEL.to_string(), key.namespace),
        (
            LABEL_MANAGED_BY.to_string(),
            LABEL_MANAGED_BY_GWTLS.to_string(),
        ),
    ]);
    Certificate {
        metadata: ObjectMeta {
            name: Some(spec.secret_name.clone()),
            namespace: Some(namespace.to_string()),
            labels: Some(labels),
            owner_references: policy.controller_owner_ref(&()).map(|r| vec![r]),
            ..Default::default()
        },
        spec: spec.clone(),
    }
}

/// Converge the policy's owned Certificates in `namespace` to `desired`
///
/// Safe to re-run at any point: every pass starts from a fresh listing.
pub async fn synchronize(
    kube: &dyn PolicyKubeClient,
    policy: &TLSPolicy,
    namespace: &str,
    desired: &DesiredCertificates,
) -> Result<SyncSummary, PolicyError> {
    let key = policy.key();
    let observed = kube
        .list_certificates(&key)
        .await
        .map_err(PolicyError::store(Step::Synchronizing))?;
    let plan = plan(desired, &observed);
    let mut summary = SyncSummary {
        reconciled: desired.len(),
        ..Default::default()
    };
    if plan.is_empty() {
        debug!(policy = %key, certificates = desired.len(), "certificates already converged");
        return Ok(summary);
    }

    for secret in &plan.create {
        let Some(spec) = desired.get(secret) else {
            continue;
        };
        let cert = owned_certificate(policy, namespace, spec);
        match kube.create_certificate(&cert).await {
            Ok(()) => {
                info!(policy = %key, secret = %secret, dns_names = ?spec.dns_names, "created certificate");
                summary.created += 1;
            }
            Err(e) if e.is_already_exists() => {
                return Err(PolicyError::CertificateSyncFailed {
                    message: format!(
                        "certificate '{}' already exists and is not owned by this policy",
                        secret
                    ),
                    retryable: true,
                });
            }
            Err(e) => return Err(PolicyError::store(Step::Synchronizing)(e)),
        }
    }

    for secret in &plan.update {
        let Some(spec) = desired.get(secret) else {
            continue;
        };
        kube.patch_certificate_spec(secret, namespace, spec)
            .await
            .map_err(PolicyError::store(Step::Synchronizing))?;
        info!(policy = %key, secret = %secret, dns_names = ?spec.dns_names, "updated certificate");
        summary.updated += 1;
    }

    for cert in observed.iter().filter(|c| plan.delete.contains(&c.name_any())) {
        let cert_ns = cert.namespace().unwrap_or_else(|| namespace.to_string());
        kube.delete_certificate(&cert.name_any(), &cert_ns)
            .await
            .map_err(PolicyError::store(Step::Synchronizing))?;
        info!(policy = %key, secret = %cert.name_any(), "deleted certificate");
        summary.deleted += 1;
    }

    Ok(summary)
}
