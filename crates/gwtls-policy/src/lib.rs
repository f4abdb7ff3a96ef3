//! TLSPolicy reconciliation engine
//!
//! - **Resolver**: finds the policy's Gateway and validates its issuer reference
//! - **Back-reference ledger**: keeps the Gateway's policy annotations convergent
//! - **Certificate synchronizer**: converges owned Certificates to the listener set
//! - **Conditions**: derives `Ready` and `PolicyAffected` from reconcile outcomes
//! - **Controller**: the reconcile state machine tying the above together

#![deny(missing_docs)]

pub mod backoff;
pub mod backref;
pub mod certificates;
pub mod client;
pub mod conditions;
pub mod controller;
pub mod error;
pub mod resolver;
pub mod watch;

pub use client::{PolicyKubeClient, PolicyKubeClientImpl};
pub use controller::{error_policy, reconcile, Context};
pub use error::{PolicyError, Step};
