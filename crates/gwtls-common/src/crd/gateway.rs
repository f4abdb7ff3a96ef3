//! Gateway API Gateway, as consumed by the controller
//!
//! Only the fields the controller reads are modelled. The controller never
//! writes the spec; it merge-patches annotations and the status conditions
//! list, so fields absent here are left untouched on the server.

use kube::{CustomResource, ResourceExt};
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

use super::types::Condition;
use crate::{POLICIES_BACK_REF_ANNOTATION, POLICY_BACK_REF_ANNOTATION};

/// TLS mode for a listener that terminates TLS at the gateway
pub const TLS_MODE_TERMINATE: &str = "Terminate";

/// TLS mode for a listener that forwards the TLS stream untouched
pub const TLS_MODE_PASSTHROUGH: &str = "Passthrough";

/// Gateway spec
#[derive(CustomResource, Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
#[kube(
    group = "gateway.networking.k8s.io",
    version = "v1",
    kind = "Gateway",
    plural = "gateways",
    namespaced,
    status = "GatewayStatus"
)]
#[serde(rename_all = "camelCase")]
pub struct GatewaySpec {
    /// GatewayClass name
    pub gateway_class_name: String,
    /// Listener configurations
    #[serde(default)]
    pub listeners: Vec<Listener>,
}

/// Gateway listener
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct Listener {
    /// Listener name
    pub name: String,
    /// Hostname the listener serves
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub hostname: Option<String>,
    /// Port number
    pub port: i32,
    /// Protocol (HTTP, HTTPS, TLS, ...)
    pub protocol: String,
    /// TLS configuration
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tls: Option<GatewayTlsConfig>,
}

impl Listener {
    /// Secret this listener terminates TLS with, if any
    ///
    /// Passthrough listeners and listeners without a TLS block have none. The
    /// first certificate ref pointing at a core Secret wins.
    pub fn secret_name(&self) -> Option<&str> {
        self.certificate_ref().map(|r| r.name.as_str())
    }

    /// The Secret reference [`Listener::secret_name`] is read from
    pub fn certificate_ref(&self) -> Option<&SecretObjectReference> {
        let tls = self.tls.as_ref()?;
        if tls.mode.as_deref() == Some(TLS_MODE_PASSTHROUGH) {
            return None;
        }
        tls.certificate_refs.iter().find(|r| r.is_secret())
    }
}

/// Listener TLS configuration
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct GatewayTlsConfig {
    /// TLS mode (Terminate, Passthrough); unset means Terminate
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub mode: Option<String>,
    /// Certificate references
    #[serde(default)]
    pub certificate_refs: Vec<SecretObjectReference>,
}

/// Reference to a certificate secret
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct SecretObjectReference {
    /// API group (empty for core)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub group: Option<String>,
    /// Resource kind (default: Secret)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub kind: Option<String>,
    /// Secret name
    pub name: String,
    /// Secret namespace (defaults to the gateway's)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub namespace: Option<String>,
}

impl SecretObjectReference {
    /// Whether this reference points at a core Secret
    pub fn is_secret(&self) -> bool {
        self.group.as_deref().unwrap_or_default().is_empty()
            && self.kind.as_deref().unwrap_or("Secret") == "Secret"
    }

    /// Whether the Secret lives in `namespace`; an unset namespace means the gateway's
    pub fn is_in_namespace(&self, namespace: &str) -> bool {
        self.namespace.as_deref().map_or(true, |ns| ns == namespace)
    }
}

/// Gateway status (only conditions are read or written)
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct GatewayStatus {
    /// Gateway conditions
    #[serde(default)]
    pub conditions: Vec<Condition>,
}

impl Gateway {
    /// Listener set, verbatim
    pub fn listeners(&self) -> &[Listener] {
        &self.spec.listeners
    }

    /// Current status conditions
    pub fn conditions(&self) -> &[Condition] {
        self.status
            .as_ref()
            .map(|s| s.conditions.as_slice())
            .unwrap_or_default()
    }

    /// Value of the single-policy back-reference annotation
    pub fn policy_back_ref(&self) -> Option<&str> {
        self.annotations()
            .get(POLICY_BACK_REF_ANNOTATION)
            .map(String::as_str)
            .filter(|v| !v.is_empty())
    }

    /// Raw value of the multi-policy back-reference annotation
    pub fn policies_back_ref(&self) -> Option<&str> {
        self.annotations()
            .get(POLICIES_BACK_REF_ANNOTATION)
            .map(String::as_str)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn tls_listener(mode: Option<&str>, refs: Vec<SecretObjectReference>) -> Listener {
        Listener {
            name: "https".to_string(),
            hostname: Some("a.example.com".to_string()),
            port: 443,
            protocol: "HTTPS".to_string(),
            tls: Some(GatewayTlsConfig {
                mode: mode.map(String::from),
                certificate_refs: refs,
            }),
        }
    }

    fn secret_ref(name: &str) -> SecretObjectReference {
        SecretObjectReference {
            name: name.to_string(),
            ..Default::default()
        }
    }

    #[test]
    fn http_listener_has_no_secret() {
        let listener = Listener {
            name: "http".to_string(),
            hostname: Some("a.example.com".to_string()),
            port: 80,
            protocol: "HTTP".to_string(),
            tls: None,
        };
        assert_eq!(listener.secret_name(), None);
    }

    #[test]
    fn terminate_listener_uses_first_secret_ref() {
        let listener = tls_listener(
            Some(TLS_MODE_TERMINATE),
            vec![secret_ref("s1"), secret_ref("s2")],
        );
        assert_eq!(listener.secret_name(), Some("s1"));
    }

    #[test]
    fn unset_mode_terminates() {
        let listener = tls_listener(None, vec![secret_ref("s1")]);
        assert_eq!(listener.secret_name(), Some("s1"));
    }

    #[test]
    fn passthrough_listener_needs_no_certificate() {
        let listener = tls_listener(Some(TLS_MODE_PASSTHROUGH), vec![secret_ref("s1")]);
        assert_eq!(listener.secret_name(), None);
    }

    #[test]
    fn non_secret_refs_are_skipped() {
        let configmap = SecretObjectReference {
            kind: Some("ConfigMap".to_string()),
            name: "bundle".to_string(),
            ..Default::default()
        };
        let listener = tls_listener(None, vec![configmap, secret_ref("s1")]);
        assert_eq!(listener.secret_name(), Some("s1"));
    }

    #[test]
    fn certificate_ref_namespace_defaults_to_gateway() {
        let local = secret_ref("s1");
        assert!(local.is_in_namespace("ns"));

        let foreign = SecretObjectReference {
            namespace: Some("certs".to_string()),
            ..secret_ref("s1")
        };
        assert!(!foreign.is_in_namespace("ns"));
        assert!(foreign.is_in_namespace("certs"));

        let listener = tls_listener(None, vec![foreign]);
        assert_eq!(
            listener.certificate_ref().and_then(|r| r.namespace.as_deref()),
            Some("certs")
        );
    }

    #[test]
    fn deserializes_upstream_gateway() {
        let gw: Gateway = serde_json::from_value(serde_json::json!({
            "apiVersion": "gateway.networking.k8s.io/v1",
            "kind": "Gateway",
            "metadata": {
                "name": "g1",
                "namespace": "ns",
                "annotations": {"gwtls.dev/tlspolicy": "ns/p1"}
            },
            "spec": {
                "gatewayClassName": "istio",
                "addresses": [{"value": "10.0.0.1"}],
                "listeners": [{
                    "name": "https",
                    "hostname": "a.example.com",
                    "port": 443,
                    "protocol": "HTTPS",
                    "tls": {"mode": "Terminate", "certificateRefs": [{"name": "s1", "kind": "Secret"}]}
                }]
            }
        }))
        .unwrap();
        assert_eq!(gw.listeners().len(), 1);
        assert_eq!(gw.listeners()[0].secret_name(), Some("s1"));
        assert_eq!(gw.policy_back_ref(), Some("ns/p1"));
        assert!(gw.conditions().is_empty());
    }
}
