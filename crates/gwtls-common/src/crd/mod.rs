//! Custom resources used by the controller
//!
//! `TLSPolicy` is our own CRD. `Gateway` and `Certificate` are third-party
//! resources modelled with just the fields the controller touches.

mod certificate;
mod gateway;
mod tls_policy;
mod types;

pub use certificate::{Certificate, CertificateSpec};
pub use gateway::{
    Gateway, GatewaySpec, GatewayStatus, GatewayTlsConfig, Listener, SecretObjectReference,
    TLS_MODE_PASSTHROUGH, TLS_MODE_TERMINATE,
};
pub use tls_policy::{
    IssuerKind, IssuerReference, PolicyTargetReference, TLSPolicy, TLSPolicySpec,
    TLSPolicyStatus, TargetKind,
};
pub use types::{find_condition, set_condition, Condition, ConditionStatus};

/// API group of the Gateway API
pub const GATEWAY_API_GROUP: &str = "gateway.networking.k8s.io";

/// API group of cert-manager
pub const CERT_MANAGER_GROUP: &str = "cert-manager.io";

/// API version served for cert-manager issuers
pub const CERT_MANAGER_API_VERSION: &str = "cert-manager.io/v1";
