//! Kubernetes Events on TLSPolicies
//!
//! Reconcile outcomes are published as Events so they show up in
//! `kubectl describe tlspolicy`. Publishing is fire-and-forget: a failed
//! Event is logged and otherwise ignored.

use async_trait::async_trait;
use k8s_openapi::api::core::v1::ObjectReference;
use kube::runtime::events::{Event, EventType, Recorder, Reporter};
use kube::Client;
use tracing::warn;

/// Sink for Kubernetes Events
#[async_trait]
pub trait EventPublisher: Send + Sync {
    /// Publish an Event about `regarding`; `reason` is one of [`reasons`] or a
    /// failure reason, `action` one of [`actions`]
    async fn publish(
        &self,
        regarding: &ObjectReference,
        type_: EventType,
        reason: &str,
        action: &str,
        note: Option<String>,
    );
}

/// Publisher backed by the API server
pub struct KubeEventPublisher {
    recorder: Recorder,
}

impl KubeEventPublisher {
    /// Report as `controller_name`, with the pod name as instance when set
    pub fn new(client: Client, controller_name: &str) -> Self {
        let reporter = Reporter {
            controller: controller_name.to_string(),
            instance: std::env::var("POD_NAME").ok(),
        };
        Self {
            recorder: Recorder::new(client, reporter),
        }
    }
}

#[async_trait]
impl EventPublisher for KubeEventPublisher {
    async fn publish(
        &self,
        regarding: &ObjectReference,
        type_: EventType,
        reason: &str,
        action: &str,
        note: Option<String>,
    ) {
        let event = Event {
            type_,
            reason: reason.to_string(),
            note,
            action: action.to_string(),
            secondary: None,
        };
        if let Err(e) = self.recorder.publish(&event, regarding).await {
            let object = regarding.name.as_deref().unwrap_or_default();
            warn!(object, reason, error = %e, "event not recorded");
        }
    }
}

/// Drops every Event; used where no API server is available
pub struct NoopEventPublisher;

#[async_trait]
impl EventPublisher for NoopEventPublisher {
    async fn publish(
        &self,
        _regarding: &ObjectReference,
        _type_: EventType,
        _reason: &str,
        _action: &str,
        _note: Option<String>,
    ) {
    }
}

/// Event reasons for successful outcomes; failures use the error reason
pub mod reasons {
    /// Policy converged and is in effect
    pub const READY: &str = "Ready";
    /// Certificates were created, updated or deleted
    pub const CERTIFICATES_SYNCED: &str = "CertificatesSynced";
    /// Policy cleanup finished, finalizer removed
    pub const CLEANUP_COMPLETE: &str = "CleanupComplete";
}

/// Event actions
pub mod actions {
    /// Regular reconciliation
    pub const RECONCILE: &str = "Reconcile";
    /// Deletion/finalization
    pub const FINALIZE: &str = "Finalize";
}
