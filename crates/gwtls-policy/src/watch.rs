//! Change routing: which policies to reconcile when a related object changes

use kube::core::DynamicObject;
use kube::runtime::reflector::ObjectRef;
use kube::ResourceExt;

use gwtls_common::crd::{Certificate, Gateway, IssuerKind, TLSPolicy};

use crate::backref::BackRefs;

/// Policies affected by a Gateway change
///
/// Both the policies recorded in the gateway's back-references and every
/// policy that targets it, so a newly created gateway wakes policies that were
/// waiting for it and a stale annotation is still cleaned up.
pub fn policies_for_gateway<'a>(
    policies: impl IntoIterator<Item = &'a TLSPolicy>,
    gateway: &Gateway,
) -> Vec<ObjectRef<TLSPolicy>> {
    let name = gateway.name_any();
    let namespace = gateway.namespace().unwrap_or_default();
    let refs = BackRefs::from_gateway(gateway);

    let mut keys = refs.all;
    keys.extend(refs.effective);
    keys.extend(
        policies
            .into_iter()
            .filter(|p| p.namespace().as_deref() == Some(namespace.as_str()))
            .filter(|p| p.targets_gateway(&name))
            .map(TLSPolicy::key),
    );

    keys.into_iter()
        .map(|k| ObjectRef::new(&k.name).within(&k.namespace))
        .collect()
}

/// Policy owning a Certificate, read from its labels
pub fn policy_for_certificate(certificate: &Certificate) -> Option<ObjectRef<TLSPolicy>> {
    certificate
        .owning_policy()
        .map(|k| ObjectRef::new(&k.name).within(&k.namespace))
}

/// Policies referencing a cert-manager issuer
///
/// A namespaced `Issuer` only matches policies in its own namespace.
pub fn policies_for_issuer<'a>(
    policies: impl IntoIterator<Item = &'a TLSPolicy>,
    kind: IssuerKind,
    issuer: &DynamicObject,
) -> Vec<ObjectRef<TLSPolicy>> {
    let name = issuer.name_any();
    let namespace = issuer.namespace();

    policies
        .into_iter()
        .filter(|p| {
            let issuer_ref = &p.spec.issuer_ref;
            issuer_ref.is_cert_manager()
                && issuer_ref.name == name
                && issuer_ref.issuer_kind() == Ok(kind)
                && (!kind.is_namespaced() || p.namespace() == namespace)
        })
        .map(ObjectRef::from_obj)
        .collect()
}
