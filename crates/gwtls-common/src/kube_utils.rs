//! Kubernetes helpers shared by the controller crates
//!
//! - [`PolicyKey`]: the `namespace/name` identity written into back-reference
//!   annotations and used as the tie-break key between competing policies.
//! - [`build_api_resource`]: `ApiResource` construction for types we only
//!   touch dynamically (cert-manager issuers).

use std::fmt;
use std::str::FromStr;

use kube::discovery::ApiResource;
use serde::{Deserialize, Serialize};

use crate::crd::{IssuerKind, CERT_MANAGER_API_VERSION};
use crate::Error;

/// Namespace-qualified policy identity, rendered as `namespace/name`
#[derive(Clone, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct PolicyKey {
    /// Policy namespace
    pub namespace: String,
    /// Policy name
    pub name: String,
}

impl PolicyKey {
    /// Create a key from its parts
    pub fn new(namespace: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            namespace: namespace.into(),
            name: name.into(),
        }
    }
}

impl fmt::Display for PolicyKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.namespace, self.name)
    }
}

impl FromStr for PolicyKey {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.split_once('/') {
            Some((ns, name)) if !ns.is_empty() && !name.is_empty() && !name.contains('/') => {
                Ok(Self::new(ns, name))
            }
            _ => Err(Error::serialization_for_kind(
                "PolicyKey",
                format!("expected 'namespace/name', got '{}'", s),
            )),
        }
    }
}

impl TryFrom<String> for PolicyKey {
    type Error = Error;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        value.parse()
    }
}

impl From<PolicyKey> for String {
    fn from(key: PolicyKey) -> Self {
        key.to_string()
    }
}

/// Build an ApiResource from an apiVersion and kind.
///
/// ```ignore
/// let ar = build_api_resource("cert-manager.io/v1", "ClusterIssuer");
/// let api: Api<DynamicObject> = Api::all_with(client, &ar);
/// ```
pub fn build_api_resource(api_version: &str, kind: &str) -> ApiResource {
    let (group, version) = parse_api_version(api_version);
    ApiResource {
        group,
        version,
        kind: kind.to_string(),
        api_version: api_version.to_string(),
        plural: pluralize_kind(kind),
    }
}

/// Split an apiVersion into `(group, version)`; core resources have an empty group
pub fn parse_api_version(api_version: &str) -> (String, String) {
    match api_version.split_once('/') {
        Some((group, version)) => (group.to_string(), version.to_string()),
        None => (String::new(), api_version.to_string()),
    }
}

/// Pluralize a Kubernetes resource kind using the API server's default rules
pub fn pluralize_kind(kind: &str) -> String {
    let lower = kind.to_lowercase();
    if lower.ends_with('s') || lower.ends_with("ch") || lower.ends_with("sh") {
        format!("{}es", lower)
    } else if lower.ends_with('y') && !lower.ends_with("ay") && !lower.ends_with("ey") {
        format!("{}ies", &lower[..lower.len() - 1])
    } else {
        format!("{}s", lower)
    }
}

/// ApiResource for a cert-manager issuer kind
pub fn issuer_api_resource(kind: IssuerKind) -> ApiResource {
    build_api_resource(CERT_MANAGER_API_VERSION, kind.as_str())
}
