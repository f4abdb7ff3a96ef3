//! Back-reference ledger on the Gateway
//!
//! Two annotations on the gateway record which policies reference it:
//!
//! - `gwtls.dev/tlspolicies`: sorted JSON array of every attached policy
//! - `gwtls.dev/tlspolicy`: the single policy in effect
//!
//! Both are a pure function of the live policies that target the gateway, so
//! every writer computes the same result from the same snapshot. Writes are a
//! read-modify-write guarded by the gateway's resourceVersion and retried on
//! conflict with a fresh read.

use std::collections::{BTreeMap, BTreeSet};

use chrono::{DateTime, Utc};
use tracing::{debug, info, warn};

use gwtls_common::crd::{Gateway, TLSPolicy};
use gwtls_common::retry::{retry_with_backoff_if, RetryConfig};
use gwtls_common::{Error, PolicyKey, POLICIES_BACK_REF_ANNOTATION, POLICY_BACK_REF_ANNOTATION};
use kube::ResourceExt;

use crate::client::PolicyKubeClient;
use crate::error::{PolicyError, Step};

/// Outcome of attaching a policy to its gateway
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Attachment {
    /// The policy is the one in effect
    Effective,
    /// Another policy won the tie-break
    Conflicted {
        /// Policy in effect
        effective: PolicyKey,
    },
}

/// Back-references as stored on a gateway
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct BackRefs {
    /// Policy in effect
    pub effective: Option<PolicyKey>,
    /// Every attached policy
    pub all: BTreeSet<PolicyKey>,
}

impl BackRefs {
    /// Read the back-reference annotations of a gateway
    pub fn from_gateway(gateway: &Gateway) -> Self {
        let effective = gateway.policy_back_ref().and_then(|raw| match raw.parse() {
            Ok(key) => Some(key),
            Err(e) => {
                warn!(gateway = %gateway.name_any(), value = raw, error = %e, "ignoring malformed policy back-reference");
                None
            }
        });
        Self {
            effective,
            all: decode_policy_refs(gateway.policies_back_ref()),
        }
    }

    /// Whether the policy appears in either annotation
    pub fn mentions(&self, key: &PolicyKey) -> bool {
        self.all.contains(key) || self.effective.as_ref() == Some(key)
    }
}

/// Decode the multi-policy annotation
///
/// A malformed value is treated as empty; the next write rebuilds it from the
/// live policies.
pub fn decode_policy_refs(raw: Option<&str>) -> BTreeSet<PolicyKey> {
    let Some(raw) = raw.filter(|r| !r.trim().is_empty()) else {
        return BTreeSet::new();
    };
    match serde_json::from_str::<Vec<PolicyKey>>(raw) {
        Ok(keys) => keys.into_iter().collect(),
        Err(e) => {
            warn!(value = raw, error = %e, "ignoring malformed policy back-reference set");
            BTreeSet::new()
        }
    }
}

/// Encode the multi-policy annotation as a sorted JSON array
pub fn encode_policy_refs(refs: &BTreeSet<PolicyKey>) -> Result<String, Error> {
    Ok(serde_json::to_string(&refs.iter().collect::<Vec<_>>())?)
}

/// A policy competing for a gateway
#[derive(Clone, Debug)]
pub struct Candidate {
    /// Policy identity
    pub key: PolicyKey,
    /// Creation time, unknown sorts last
    pub created: Option<DateTime<Utc>>,
}

impl Candidate {
    /// Candidate entry for a policy object
    pub fn of(policy: &TLSPolicy) -> Self {
        Self {
            key: policy.key(),
            created: policy.creation_timestamp().map(|t| t.0),
        }
    }
}

/// Pick the policy in effect: earliest creation time, then `namespace/name`
///
/// Pure and order-independent so concurrent writers converge.
pub fn effective_policy(candidates: &[Candidate]) -> Option<PolicyKey> {
    candidates
        .iter()
        .min_by(|a, b| {
            (a.created.is_none(), a.created, &a.key).cmp(&(b.created.is_none(), b.created, &b.key))
        })
        .map(|c| c.key.clone())
}

/// Annotation changes needed to move `gateway` to `desired`, `None` if already there
pub fn annotation_patch(
    gateway: &Gateway,
    desired: &BackRefs,
) -> Result<Option<BTreeMap<String, Option<String>>>, Error> {
    let (single, set) = if desired.all.is_empty() {
        (None, None)
    } else {
        (
            desired.effective.as_ref().map(ToString::to_string),
            Some(encode_policy_refs(&desired.all)?),
        )
    };

    let current = gateway.annotations();
    let mut patch = BTreeMap::new();
    for (key, value) in [
        (POLICY_BACK_REF_ANNOTATION, single),
        (POLICIES_BACK_REF_ANNOTATION, set),
    ] {
        if current.get(key) != value.as_ref() {
            patch.insert(key.to_string(), value);
        }
    }
    Ok((!patch.is_empty()).then_some(patch))
}

/// Live candidates among `members`, dropping stale entries
///
/// An entry is stale when its policy is gone, being deleted, lives in another
/// namespace, or no longer targets this gateway. `current` is used as-is
/// instead of being re-read.
async fn live_candidates(
    kube: &dyn PolicyKubeClient,
    gateway: &Gateway,
    members: &BTreeSet<PolicyKey>,
    current: Option<&TLSPolicy>,
) -> Result<Vec<Candidate>, PolicyError> {
    let gateway_name = gateway.name_any();
    let gateway_ns = gateway.namespace().unwrap_or_default();
    let mut candidates = Vec::with_capacity(members.len());

    for key in members {
        if key.namespace != gateway_ns {
            continue;
        }
        let policy = match current.filter(|p| &p.key() == key) {
            Some(p) => Some(p.clone()),
            None => kube
                .get_policy(&key.name, &key.namespace)
                .await
                .map_err(PolicyError::store(Step::Attaching))?,
        };
        match policy {
            Some(p) if !p.is_deleting() && p.targets_gateway(&gateway_name) => {
                candidates.push(Candidate::of(&p));
            }
            _ => debug!(policy = %key, gateway = %gateway_name, "pruning stale back-reference"),
        }
    }
    Ok(candidates)
}

/// Write `desired` onto the gateway if it differs, returning the stored gateway
async fn write_back_refs(
    kube: &dyn PolicyKubeClient,
    gateway: Gateway,
    desired: &BackRefs,
) -> Result<Gateway, PolicyError> {
    let Some(patch) =
        annotation_patch(&gateway, desired).map_err(PolicyError::store(Step::Attaching))?
    else {
        return Ok(gateway);
    };
    let name = gateway.name_any();
    let namespace = gateway.namespace().unwrap_or_default();
    kube.patch_gateway_annotations(&name, &namespace, gateway.resource_version(), patch)
        .await
        .map_err(PolicyError::store(Step::Attaching))
}

async fn attach_once(
    kube: &dyn PolicyKubeClient,
    policy: &TLSPolicy,
    gateway_name: &str,
) -> Result<(Attachment, Gateway), PolicyError> {
    let key = policy.key();
    let gateway = kube
        .get_gateway(gateway_name, &key.namespace)
        .await
        .map_err(PolicyError::store(Step::Attaching))?
        .ok_or_else(|| PolicyError::TargetNotFound {
            kind: "Gateway".to_string(),
            name: gateway_name.to_string(),
        })?;

    let mut members = BackRefs::from_gateway(&gateway).all;
    members.insert(key.clone());

    let candidates = live_candidates(kube, &gateway, &members, Some(policy)).await?;
    let effective = effective_policy(&candidates).unwrap_or_else(|| key.clone());
    let desired = BackRefs {
        effective: Some(effective.clone()),
        all: candidates.into_iter().map(|c| c.key).collect(),
    };

    let gateway = write_back_refs(kube, gateway, &desired).await?;
    let attachment = if effective == key {
        Attachment::Effective
    } else {
        Attachment::Conflicted { effective }
    };
    Ok((attachment, gateway))
}

/// Record the policy on its gateway and decide which policy is in effect
///
/// A gateway that disappeared mid-way surfaces as `TargetNotFound`.
pub async fn attach(
    kube: &dyn PolicyKubeClient,
    policy: &TLSPolicy,
    gateway_name: &str,
) -> Result<(Attachment, Gateway), PolicyError> {
    let (attachment, gateway) = retry_with_backoff_if(
        &RetryConfig::conflict(),
        "attach_policy",
        PolicyError::is_store_conflict,
        || attach_once(kube, policy, gateway_name),
    )
    .await?;

    if let Attachment::Conflicted { effective } = &attachment {
        info!(policy = %policy.key(), gateway = %gateway_name, effective = %effective, "policy conflicts with the policy in effect");
    }
    Ok((attachment, gateway))
}

async fn detach_once(
    kube: &dyn PolicyKubeClient,
    key: &PolicyKey,
    gateway_name: &str,
) -> Result<Option<Gateway>, PolicyError> {
    let Some(gateway) = kube
        .get_gateway(gateway_name, &key.namespace)
        .await
        .map_err(PolicyError::store(Step::Attaching))?
    else {
        return Ok(None);
    };

    let refs = BackRefs::from_gateway(&gateway);
    if !refs.mentions(key) {
        return Ok(Some(gateway));
    }

    let mut members = refs.all;
    members.remove(key);
    let candidates = live_candidates(kube, &gateway, &members, None).await?;
    let desired = BackRefs {
        effective: effective_policy(&candidates),
        all: candidates.into_iter().map(|c| c.key).collect(),
    };
    write_back_refs(kube, gateway, &desired).await.map(Some)
}

/// Remove the policy from a gateway's back-references
///
/// Idempotent: an absent entry or a missing gateway is a no-op. Returns the
/// stored gateway, `None` when it no longer exists.
pub async fn detach(
    kube: &dyn PolicyKubeClient,
    key: &PolicyKey,
    gateway_name: &str,
) -> Result<Option<Gateway>, PolicyError> {
    retry_with_backoff_if(
        &RetryConfig::conflict(),
        "detach_policy",
        PolicyError::is_store_conflict,
        || detach_once(kube, key, gateway_name),
    )
    .await
}

/// Detach the policy from every gateway in its namespace that still lists it,
/// except `keep`
///
/// Covers a changed `targetRef` and policy deletion. Returns the gateways
/// whose back-references changed.
pub async fn detach_from_others(
    kube: &dyn PolicyKubeClient,
    key: &PolicyKey,
    keep: Option<&str>,
) -> Result<Vec<Gateway>, PolicyError> {
    let gateways = kube
        .list_gateways(&key.namespace)
        .await
        .map_err(PolicyError::store(Step::Attaching))?;

    let mut changed = Vec::new();
    for gateway in gateways {
        let name = gateway.name_any();
        if Some(name.as_str()) == keep || !BackRefs::from_gateway(&gateway).mentions(key) {
            continue;
        }
        info!(policy = %key, gateway = %name, "detaching policy from gateway");
        if let Some(updated) = detach(kube, key, &name).await? {
            changed.push(updated);
        }
    }
    Ok(changed)
}
