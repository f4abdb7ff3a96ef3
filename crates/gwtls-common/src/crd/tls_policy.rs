//! TLSPolicy Custom Resource Definition
//!
//! A TLSPolicy attaches to a Gateway in its own namespace and names the
//! cert-manager issuer that should sign certificates for the gateway's
//! TLS-terminating listeners.
//!
//! ```yaml
//! apiVersion: gwtls.dev/v1alpha1
//! kind: TLSPolicy
//! metadata:
//!   name: web-tls
//!   namespace: default
//! spec:
//!   targetRef:
//!     group: gateway.networking.k8s.io
//!     kind: Gateway
//!     name: public
//!   issuerRef:
//!     group: cert-manager.io
//!     kind: ClusterIssuer
//!     name: letsencrypt
//! ```

use std::str::FromStr;

use kube::{CustomResource, ResourceExt};
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

use super::types::Condition;
use super::{CERT_MANAGER_GROUP, GATEWAY_API_GROUP};
use crate::kube_utils::PolicyKey;
use crate::POLICY_FINALIZER;

/// Kinds a TLSPolicy may target
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum TargetKind {
    /// `gateway.networking.k8s.io/Gateway`
    Gateway,
}

impl TargetKind {
    /// Classify a `(group, kind)` pair, `None` when unsupported
    pub fn classify(group: &str, kind: &str) -> Option<Self> {
        let group = if group.is_empty() {
            GATEWAY_API_GROUP
        } else {
            group
        };
        match (group, kind) {
            (GATEWAY_API_GROUP, "Gateway") => Some(Self::Gateway),
            _ => None,
        }
    }
}

/// Kinds of cert-manager issuer a policy may reference
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum IssuerKind {
    /// Namespaced `Issuer`, looked up in the policy namespace
    Issuer,
    /// Cluster-scoped `ClusterIssuer`
    ClusterIssuer,
}

impl IssuerKind {
    /// Kind string as written in resources
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Issuer => "Issuer",
            Self::ClusterIssuer => "ClusterIssuer",
        }
    }

    /// Whether the issuer lives in a namespace
    pub fn is_namespaced(&self) -> bool {
        matches!(self, Self::Issuer)
    }
}

impl FromStr for IssuerKind {
    type Err = String;

    /// Empty kind defaults to `Issuer`, matching cert-manager
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "" | "Issuer" => Ok(Self::Issuer),
            "ClusterIssuer" => Ok(Self::ClusterIssuer),
            other => Err(format!(
                "unsupported issuer kind '{}', expected Issuer or ClusterIssuer",
                other
            )),
        }
    }
}

impl std::fmt::Display for IssuerKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

fn default_target_group() -> String {
    GATEWAY_API_GROUP.to_string()
}

/// Reference to the object a policy attaches to (same namespace as the policy)
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct PolicyTargetReference {
    /// API group of the target (defaults to gateway.networking.k8s.io)
    #[serde(default = "default_target_group")]
    pub group: String,
    /// Kind of the target (Gateway)
    pub kind: String,
    /// Name of the target
    pub name: String,
}

impl PolicyTargetReference {
    /// Classify the target kind
    pub fn target_kind(&self) -> Option<TargetKind> {
        TargetKind::classify(&self.group, &self.kind)
    }
}

/// Reference to a cert-manager issuer
///
/// Passed verbatim into every Certificate the policy produces.
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct IssuerReference {
    /// Issuer name
    pub name: String,
    /// Issuer kind (Issuer or ClusterIssuer, empty means Issuer)
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub kind: String,
    /// API group of the issuer (empty means cert-manager.io)
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub group: String,
}

impl IssuerReference {
    /// Parse the issuer kind
    pub fn issuer_kind(&self) -> Result<IssuerKind, String> {
        self.kind.parse()
    }

    /// Whether the issuer is served by cert-manager itself
    pub fn is_cert_manager(&self) -> bool {
        self.group.is_empty() || self.group == CERT_MANAGER_GROUP
    }
}

/// Specification for a TLSPolicy
#[derive(CustomResource, Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
#[kube(
    group = "gwtls.dev",
    version = "v1alpha1",
    kind = "TLSPolicy",
    plural = "tlspolicies",
    shortname = "tlsp",
    namespaced,
    status = "TLSPolicyStatus",
    printcolumn = r#"{"name":"Target","type":"string","jsonPath":".spec.targetRef.name"}"#,
    printcolumn = r#"{"name":"Issuer","type":"string","jsonPath":".spec.issuerRef.name"}"#,
    printcolumn = r#"{"name":"Ready","type":"string","jsonPath":".status.conditions[?(@.type==\"Ready\")].status"}"#,
    printcolumn = r#"{"name":"Age","type":"date","jsonPath":".metadata.creationTimestamp"}"#
)]
#[serde(rename_all = "camelCase")]
pub struct TLSPolicySpec {
    /// Gateway this policy applies to
    pub target_ref: PolicyTargetReference,

    /// Issuer that signs certificates for the target's listeners
    pub issuer_ref: IssuerReference,
}

/// Observed state of a TLSPolicy
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct TLSPolicyStatus {
    /// Current conditions (Ready)
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub conditions: Vec<Condition>,

    /// Generation of the policy last processed by the controller
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub observed_generation: Option<i64>,
}

impl TLSPolicy {
    /// `namespace/name` identity of this policy
    pub fn key(&self) -> PolicyKey {
        PolicyKey::new(self.namespace().unwrap_or_default(), self.name_any())
    }

    /// Whether the policy carries a deletion marker
    pub fn is_deleting(&self) -> bool {
        self.metadata.deletion_timestamp.is_some()
    }

    /// Whether the controller's finalizer is present
    pub fn has_finalizer(&self) -> bool {
        self.finalizers().iter().any(|f| f == POLICY_FINALIZER)
    }

    /// Whether this policy targets the named gateway
    pub fn targets_gateway(&self, name: &str) -> bool {
        self.spec.target_ref.target_kind() == Some(TargetKind::Gateway)
            && self.spec.target_ref.name == name
    }
}
