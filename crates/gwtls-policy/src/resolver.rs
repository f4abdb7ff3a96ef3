//! Target and issuer resolution
//!
//! Pure lookups: nothing here mutates the store.

use tracing::debug;

use gwtls_common::crd::{Gateway, IssuerKind, TLSPolicy, TargetKind};

use crate::client::PolicyKubeClient;
use crate::error::{PolicyError, Step};

/// Locate the Gateway a policy targets
///
/// The target always lives in the policy's namespace. Listener content is
/// returned verbatim and validated later by the certificate synchronizer.
pub async fn resolve_target(
    kube: &dyn PolicyKubeClient,
    policy: &TLSPolicy,
) -> Result<Gateway, PolicyError> {
    let target = &policy.spec.target_ref;
    let Some(TargetKind::Gateway) = target.target_kind() else {
        return Err(PolicyError::TargetKindUnsupported {
            group: target.group.clone(),
            kind: target.kind.clone(),
        });
    };

    let namespace = policy.key().namespace;
    let gateway = kube
        .get_gateway(&target.name, &namespace)
        .await
        .map_err(PolicyError::store(Step::Resolving))?
        .ok_or_else(|| PolicyError::TargetNotFound {
            kind: target.kind.clone(),
            name: target.name.clone(),
        })?;

    debug!(
        gateway = %target.name,
        namespace = %namespace,
        listeners = gateway.listeners().len(),
        "resolved target"
    );
    Ok(gateway)
}

/// Classify the policy's issuer reference and check that it exists
///
/// Existence is only checked for cert-manager's own issuer kinds; issuers from
/// other groups are handed to the issuance backend unchecked.
pub async fn resolve_issuer(
    kube: &dyn PolicyKubeClient,
    policy: &TLSPolicy,
) -> Result<(), PolicyError> {
    let issuer = &policy.spec.issuer_ref;
    if issuer.name.is_empty() {
        return Err(PolicyError::InvalidIssuerReference(
            "issuer name must not be empty".to_string(),
        ));
    }
    if !issuer.is_cert_manager() {
        // external issuers define their own kinds
        return Ok(());
    }

    let kind = issuer
        .issuer_kind()
        .map_err(PolicyError::InvalidIssuerReference)?;

    let namespace = policy.key().namespace;
    let exists = kube
        .issuer_exists(kind, &issuer.name, &namespace)
        .await
        .map_err(PolicyError::store(Step::Resolving))?;
    if !exists {
        return Err(PolicyError::IssuerNotFound {
            kind: kind.to_string(),
            name: issuer.name.clone(),
        });
    }
    Ok(())
}
