//! Classified reconcile failures
//!
//! Every component returns a [`PolicyError`]; only the controller decides what
//! to do with it. Each variant maps to the stable `reason` string written into
//! the policy's `Ready` condition.

use gwtls_common::{Error, PolicyKey};
use thiserror::Error;

/// Stage of the reconcile state machine
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Step {
    /// Locating the target and its listeners
    Resolving,
    /// Updating back-references on the target
    Attaching,
    /// Converging owned certificates
    Synchronizing,
    /// Writing status
    Reporting,
    /// Cleaning up before the policy is removed
    Deleting,
}

impl Step {
    /// Condition reason used when a store call fails during this step
    pub fn failure_reason(&self) -> &'static str {
        match self {
            Step::Resolving => "TargetResolutionFailed",
            Step::Attaching => "BackReferenceFailed",
            Step::Synchronizing => "CertificateSyncFailed",
            Step::Reporting => "StatusUpdateFailed",
            Step::Deleting => "CleanupFailed",
        }
    }
}

impl std::fmt::Display for Step {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Step::Resolving => "resolving",
            Step::Attaching => "attaching",
            Step::Synchronizing => "synchronizing",
            Step::Reporting => "reporting",
            Step::Deleting => "deleting",
        };
        f.write_str(s)
    }
}

/// Reconcile failure, classified by cause
#[derive(Debug, Error)]
pub enum PolicyError {
    /// The target does not exist (yet)
    #[error("target {kind} '{name}' not found")]
    TargetNotFound {
        /// Target kind
        kind: String,
        /// Target name
        name: String,
    },

    /// The target reference names a kind we cannot attach to
    #[error("target kind '{kind}' in group '{group}' is not supported, expected Gateway")]
    TargetKindUnsupported {
        /// Referenced group
        group: String,
        /// Referenced kind
        kind: String,
    },

    /// The referenced cert-manager issuer does not exist (yet)
    #[error("{kind} '{name}' not found")]
    IssuerNotFound {
        /// Issuer kind
        kind: String,
        /// Issuer name
        name: String,
    },

    /// The issuer reference cannot be classified
    #[error("invalid issuer reference: {0}")]
    InvalidIssuerReference(String),

    /// Another policy is in effect for the same target
    #[error("target '{target}' is already governed by policy {effective}")]
    Conflicted {
        /// Policy currently in effect
        effective: PolicyKey,
        /// Target name
        target: String,
    },

    /// Certificates could not be converged
    #[error("certificate sync failed: {message}")]
    CertificateSyncFailed {
        /// What went wrong
        message: String,
        /// Whether retrying can help
        retryable: bool,
    },

    /// A store call failed
    #[error("{step} failed: {source}")]
    Store {
        /// Step the call belonged to
        step: Step,
        /// Underlying error
        #[source]
        source: Error,
    },
}

impl PolicyError {
    /// Wrap a store error with the step it happened in
    pub fn store(step: Step) -> impl FnOnce(Error) -> Self {
        move |source| Self::Store { step, source }
    }

    /// Stable condition reason
    pub fn reason(&self) -> &'static str {
        match self {
            Self::TargetNotFound { .. } => "TargetNotFound",
            Self::TargetKindUnsupported { .. } => "TargetKindUnsupported",
            Self::IssuerNotFound { .. } => "IssuerNotFound",
            Self::InvalidIssuerReference(_) => "InvalidIssuerReference",
            Self::Conflicted { .. } => "Conflicted",
            Self::CertificateSyncFailed { .. } => "CertificateSyncFailed",
            Self::Store { step, .. } => step.failure_reason(),
        }
    }

    /// Whether a timed retry can resolve this failure
    ///
    /// Configuration failures (unsupported kind, bad issuer, conflicting
    /// policies) are re-evaluated only when a watched object changes.
    pub fn is_retryable(&self) -> bool {
        match self {
            Self::TargetNotFound { .. } => true,
            Self::TargetKindUnsupported { .. } => false,
            Self::IssuerNotFound { .. } => true,
            Self::InvalidIssuerReference(_) => false,
            Self::Conflicted { .. } => false,
            Self::CertificateSyncFailed { retryable, .. } => *retryable,
            Self::Store { source, .. } => source.is_retryable(),
        }
    }

    /// True for optimistic-concurrency conflicts from the store
    pub fn is_store_conflict(&self) -> bool {
        matches!(self, Self::Store { source, .. } if source.is_conflict())
    }

    /// True when the policy has no gateway whose listeners could claim its
    /// certificates: the target is absent or of an unsupported kind
    pub fn is_target_missing(&self) -> bool {
        matches!(
            self,
            Self::TargetNotFound { .. } | Self::TargetKindUnsupported { .. }
        )
    }
}
