//! Common types for gwtls: CRDs, errors, and utilities
//!
//! gwtls binds `TLSPolicy` resources to Gateway API listeners and keeps one
//! cert-manager `Certificate` per listener secret in sync with them.

#![deny(missing_docs)]

pub mod crd;
pub mod error;
pub mod events;
pub mod kube_utils;
pub mod retry;
pub mod telemetry;

pub use error::Error;
pub use kube_utils::PolicyKey;

/// Result type alias using our custom Error type
pub type Result<T> = std::result::Result<T, Error>;

/// API group of the gwtls CRDs
pub const API_GROUP: &str = "gwtls.dev";

/// Field manager used for every patch issued by the controller
pub const FIELD_MANAGER: &str = "gwtls-controller";

/// Gateway annotation naming the single policy in effect (`namespace/name`)
pub const POLICY_BACK_REF_ANNOTATION: &str = "gwtls.dev/tlspolicy";

/// Gateway annotation listing every policy targeting the gateway (JSON array)
pub const POLICIES_BACK_REF_ANNOTATION: &str = "gwtls.dev/tlspolicies";

/// Finalizer that holds a TLSPolicy until its certificates and back-references are gone
pub const POLICY_FINALIZER: &str = "gwtls.dev/tls-policy";

/// Label on Certificates carrying the owning policy's name
pub const POLICY_NAME_LABEL: &str = "gwtls.dev/policy-name";

/// Label on Certificates carrying the owning policy's namespace
pub const POLICY_NAMESPACE_LABEL: &str = "gwtls.dev/policy-namespace";

/// Standard Kubernetes managed-by label key
pub const LABEL_MANAGED_BY: &str = "app.kubernetes.io/managed-by";

/// Value for the managed-by label on resources created by gwtls
pub const LABEL_MANAGED_BY_GWTLS: &str = "gwtls";
