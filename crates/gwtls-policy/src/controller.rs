//! TLSPolicy reconcile state machine
//!
//! `Resolving -> Attaching -> Synchronizing -> Reporting`, plus a `Deleting`
//! branch while the policy carries a deletion timestamp. Every step converges
//! from a fresh read, so restarting from the top always reaches the same end
//! state. The failing step's error is written into the `Ready` condition here
//! and nowhere else; [`error_policy`] then decides when to run again.

use std::sync::Arc;

use kube::runtime::controller::Action;
use kube::runtime::events::EventType;
use kube::{Client, Resource, ResourceExt};
use tracing::{debug, info, instrument, warn};

use gwtls_common::crd::TLSPolicy;
use gwtls_common::events::{actions, reasons, EventPublisher, KubeEventPublisher};
use gwtls_common::retry::{retry_with_backoff_if, RetryConfig};

use crate::backoff::{ControllerSettings, RetryTracker};
use crate::backref::{self, Attachment};
use crate::certificates::{self, DesiredCertificates, SyncSummary};
use crate::client::{PolicyKubeClient, PolicyKubeClientImpl};
use crate::conditions;
use crate::error::{PolicyError, Step};
use crate::resolver;

/// Controller name reported on Kubernetes Events
pub const CONTROLLER_NAME: &str = "gwtls-policy-controller";

/// Shared state for TLSPolicy reconciliation
pub struct Context {
    /// Object store
    pub kube: Arc<dyn PolicyKubeClient>,
    /// Event publisher for emitting Kubernetes Events
    pub events: Arc<dyn EventPublisher>,
    /// Consecutive failures per policy
    pub retries: RetryTracker,
    /// Requeue tuning
    pub settings: ControllerSettings,
}

impl Context {
    /// Create a context from explicit dependencies
    pub fn new(
        kube: Arc<dyn PolicyKubeClient>,
        events: Arc<dyn EventPublisher>,
        settings: ControllerSettings,
    ) -> Self {
        Self {
            kube,
            events,
            retries: RetryTracker::new(),
            settings,
        }
    }

    /// Create a context backed by the Kubernetes API
    pub fn from_client(client: Client, settings: ControllerSettings) -> Self {
        let events = Arc::new(KubeEventPublisher::new(client.clone(), CONTROLLER_NAME));
        Self::new(
            Arc::new(PolicyKubeClientImpl::new(client)),
            events,
            settings,
        )
    }

    /// Create a context for unit tests with a no-op event publisher
    #[cfg(test)]
    pub fn for_testing(kube: Arc<dyn PolicyKubeClient>) -> Self {
        Self::new(
            kube,
            Arc::new(gwtls_common::events::NoopEventPublisher),
            ControllerSettings::default(),
        )
    }
}

/// Reconcile a TLSPolicy
///
/// Returns `Err` for every failed reconcile after its `Ready` condition has
/// been written, so [`error_policy`] is the single place that picks the
/// requeue.
#[instrument(skip(policy, ctx), fields(policy = %policy.key()))]
pub async fn reconcile(policy: Arc<TLSPolicy>, ctx: Arc<Context>) -> Result<Action, PolicyError> {
    if policy.is_deleting() {
        return handle_deletion(&policy, &ctx).await;
    }

    if !policy.has_finalizer() {
        info!("adding finalizer");
        ctx.kube
            .add_policy_finalizer(&policy)
            .await
            .map_err(PolicyError::store(Step::Resolving))?;
    }

    let outcome = run_pipeline(&policy, &ctx).await;
    report(&policy, &ctx, &outcome).await?;

    match outcome {
        Ok(summary) => {
            ctx.retries.reset(&policy.key());
            debug!(certificates = summary.reconciled, "policy converged");
            Ok(Action::requeue(ctx.settings.resync_interval))
        }
        Err(e) => Err(e),
    }
}

/// Resolving, Attaching and Synchronizing
async fn run_pipeline(policy: &TLSPolicy, ctx: &Context) -> Result<SyncSummary, PolicyError> {
    let kube = ctx.kube.as_ref();
    let key = policy.key();
    let target = &policy.spec.target_ref;

    let resolved = resolver::resolve_target(kube, policy).await;

    // A changed targetRef leaves the policy recorded on its previous gateway
    let keep = target.target_kind().map(|_| target.name.as_str());
    for gateway in backref::detach_from_others(kube, &key, keep).await? {
        refresh_gateway_condition(kube, &gateway.name_any(), &key.namespace).await?;
    }
    if let Err(e) = resolved {
        return Err(release_without_target(kube, policy, e).await);
    }

    let (attachment, gateway) = match backref::attach(kube, policy, &target.name).await {
        Ok(attached) => attached,
        Err(e) => return Err(release_without_target(kube, policy, e).await),
    };
    refresh_gateway_condition(kube, &gateway.name_any(), &key.namespace).await?;

    if let Attachment::Conflicted { effective } = attachment {
        // secret names belong to the policy in effect
        certificates::synchronize(kube, policy, &key.namespace, &DesiredCertificates::new())
            .await?;
        return Err(PolicyError::Conflicted {
            effective,
            target: target.name.clone(),
        });
    }

    resolver::resolve_issuer(kube, policy).await?;
    let desired =
        certificates::desired_certificates(gateway.listeners(), &key.namespace, &policy.spec.issuer_ref)?;
    let summary = certificates::synchronize(kube, policy, &key.namespace, &desired).await?;

    if summary.changed() {
        ctx.events
            .publish(
                &policy.object_ref(&()),
                EventType::Normal,
                reasons::CERTIFICATES_SYNCED,
                actions::RECONCILE,
                Some(format!(
                    "{} created, {} updated, {} deleted",
                    summary.created, summary.updated, summary.deleted
                )),
            )
            .await;
    }
    Ok(summary)
}

/// Delete every Certificate the policy owns when it has no resolvable target
///
/// No listener can reference those secrets any more, and keeping them would
/// block the policy now in effect on the previous gateway from creating its
/// own. Returns the error to report: `cause`, or the cleanup failure.
async fn release_without_target(
    kube: &dyn PolicyKubeClient,
    policy: &TLSPolicy,
    cause: PolicyError,
) -> PolicyError {
    if !cause.is_target_missing() {
        return cause;
    }
    let namespace = policy.namespace().unwrap_or_default();
    match certificates::synchronize(kube, policy, &namespace, &DesiredCertificates::new()).await {
        Ok(summary) => {
            if summary.deleted > 0 {
                info!(
                    deleted = summary.deleted,
                    reason = cause.reason(),
                    "released certificates of unresolved target"
                );
            }
            cause
        }
        Err(cleanup) => cleanup,
    }
}

/// Re-derive the gateway's `PolicyAffected` condition from its stored
/// back-references and write it if it changed
async fn refresh_gateway_condition(
    kube: &dyn PolicyKubeClient,
    name: &str,
    namespace: &str,
) -> Result<(), PolicyError> {
    retry_with_backoff_if(
        &RetryConfig::conflict(),
        "update_gateway_condition",
        PolicyError::is_store_conflict,
        || async move {
            let Some(gateway) = kube
                .get_gateway(name, namespace)
                .await
                .map_err(PolicyError::store(Step::Reporting))?
            else {
                return Ok(());
            };
            let Some(conditions) = conditions::gateway_conditions(&gateway) else {
                return Ok(());
            };
            kube.patch_gateway_conditions(name, namespace, gateway.resource_version(), conditions)
                .await
                .map_err(PolicyError::store(Step::Reporting))
        },
    )
    .await
}

/// Write the policy's `Ready` condition, skipping the write when unchanged
async fn report(
    policy: &TLSPolicy,
    ctx: &Context,
    outcome: &Result<SyncSummary, PolicyError>,
) -> Result<(), PolicyError> {
    let generation = policy.metadata.generation;
    let ready = conditions::ready_condition(outcome, generation);
    let Some(status) = conditions::policy_status(policy.status.as_ref(), ready, generation) else {
        debug!("status unchanged, skipping update");
        return Ok(());
    };

    let key = policy.key();
    ctx.kube
        .patch_policy_status(&key.name, &key.namespace, &status)
        .await
        .map_err(PolicyError::store(Step::Reporting))?;

    let (type_, reason, note) = match outcome {
        Ok(summary) => (
            EventType::Normal,
            reasons::READY,
            format!("{} certificate(s) reconciled", summary.reconciled),
        ),
        Err(e) => (EventType::Warning, e.reason(), e.to_string()),
    };
    ctx.events
        .publish(
            &policy.object_ref(&()),
            type_,
            reason,
            actions::RECONCILE,
            Some(note),
        )
        .await;
    Ok(())
}

/// Remove back-references and owned certificates, then release the finalizer
async fn handle_deletion(policy: &TLSPolicy, ctx: &Context) -> Result<Action, PolicyError> {
    if !policy.has_finalizer() {
        return Ok(Action::await_change());
    }

    let kube = ctx.kube.as_ref();
    let key = policy.key();
    info!("cleaning up deleted policy");

    for gateway in backref::detach_from_others(kube, &key, None).await? {
        refresh_gateway_condition(kube, &gateway.name_any(), &key.namespace).await?;
    }
    let summary =
        certificates::synchronize(kube, policy, &key.namespace, &DesiredCertificates::new())
            .await?;

    kube.remove_policy_finalizer(policy)
        .await
        .map_err(PolicyError::store(Step::Deleting))?;
    ctx.retries.reset(&key);
    info!(deleted = summary.deleted, "cleanup complete, finalizer removed");

    ctx.events
        .publish(
            &policy.object_ref(&()),
            EventType::Normal,
            reasons::CLEANUP_COMPLETE,
            actions::FINALIZE,
            Some(format!("{} certificate(s) deleted", summary.deleted)),
        )
        .await;
    Ok(Action::await_change())
}

/// Requeue decision for a failed reconcile
///
/// Configuration errors wait for a change to the policy or a related object.
/// Transient errors back off exponentially until the retry budget is spent,
/// after which the reported condition stands until something changes. A
/// deleting policy is always retried so it cannot leave orphans behind.
pub fn error_policy(policy: Arc<TLSPolicy>, error: &PolicyError, ctx: Arc<Context>) -> Action {
    let key = policy.key();

    if policy.is_deleting() {
        let delay = ctx.retries.next_delay(&key, &ctx.settings);
        warn!(policy = %key, error = %error, ?delay, "cleanup failed, retrying");
        return Action::requeue(delay);
    }

    if !error.is_retryable() {
        warn!(
            policy = %key,
            reason = error.reason(),
            error = %error,
            "reconcile failed, waiting for a change"
        );
        return Action::await_change();
    }

    let action = ctx.retries.next_action(&key, &ctx.settings);
    if action == Action::await_change() {
        warn!(
            policy = %key,
            reason = error.reason(),
            attempts = ctx.retries.attempts(&key),
            "retry budget exhausted, waiting for a change"
        );
    } else {
        warn!(policy = %key, reason = error.reason(), error = %error, "reconcile failed, will retry");
    }
    action
}
