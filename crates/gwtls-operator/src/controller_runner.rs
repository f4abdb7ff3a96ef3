//! Controller runner - builds the TLSPolicy controller future
//!
//! The kube runtime `Controller` is the work queue: one in-flight reconcile
//! per policy, distinct policies in parallel. Related objects are mapped back
//! to the policies they affect through [`gwtls_policy::watch`].

use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;

use futures::StreamExt;
use kube::core::DynamicObject;
use kube::runtime::watcher::Config as WatcherConfig;
use kube::runtime::Controller;
use kube::{Api, Client, Resource};

use gwtls_common::crd::{Certificate, Gateway, IssuerKind, TLSPolicy};
use gwtls_common::kube_utils::issuer_api_resource;
use gwtls_policy::backoff::ControllerSettings;
use gwtls_policy::watch::{policies_for_gateway, policies_for_issuer, policy_for_certificate};
use gwtls_policy::{error_policy, reconcile, Context};

/// Watcher timeout (seconds) - must be less than client read_timeout (30s)
///
/// Forces the API server to close idle watches before the client times out.
const WATCH_TIMEOUT_SECS: u32 = 25;

fn watcher_config() -> WatcherConfig {
    WatcherConfig::default().timeout(WATCH_TIMEOUT_SECS)
}

/// Namespaced resources are watched in one namespace or cluster-wide
fn scoped_api<K>(client: &Client, namespace: Option<&str>) -> Api<K>
where
    K: Resource<Scope = k8s_openapi::NamespaceResourceScope, DynamicType = ()>,
{
    match namespace {
        Some(ns) => Api::namespaced(client.clone(), ns),
        None => Api::all(client.clone()),
    }
}

fn issuer_api(client: &Client, kind: IssuerKind, namespace: Option<&str>) -> Api<DynamicObject> {
    let ar = issuer_api_resource(kind);
    match namespace {
        Some(ns) if kind.is_namespaced() => Api::namespaced_with(client.clone(), ns, &ar),
        _ => Api::all_with(client.clone(), &ar),
    }
}

/// Build the TLSPolicy controller future
pub fn build_policy_controller(
    client: Client,
    namespace: Option<&str>,
    settings: ControllerSettings,
) -> Pin<Box<dyn Future<Output = ()> + Send>> {
    let ctx = Arc::new(Context::from_client(client.clone(), settings));

    let controller = Controller::new(scoped_api::<TLSPolicy>(&client, namespace), watcher_config());
    let policies = controller.store();

    let gateway_policies = policies.clone();
    let issuer_policies = policies.clone();
    let cluster_issuer_policies = policies;

    let controller = controller
        .watches(
            scoped_api::<Gateway>(&client, namespace),
            watcher_config(),
            move |gateway| {
                let state = gateway_policies.state();
                let affected = policies_for_gateway(state.iter().map(Arc::as_ref), &gateway);
                tracing::debug!(
                    gateway = %gateway.metadata.name.as_deref().unwrap_or_default(),
                    affected_count = affected.len(),
                    "Gateway changed, re-reconciling policies"
                );
                affected
            },
        )
        .watches(
            scoped_api::<Certificate>(&client, namespace),
            watcher_config(),
            |certificate| policy_for_certificate(&certificate),
        )
        .watches_with(
            issuer_api(&client, IssuerKind::Issuer, namespace),
            issuer_api_resource(IssuerKind::Issuer),
            watcher_config(),
            move |issuer| {
                let state = issuer_policies.state();
                policies_for_issuer(state.iter().map(Arc::as_ref), IssuerKind::Issuer, &issuer)
            },
        )
        .watches_with(
            issuer_api(&client, IssuerKind::ClusterIssuer, namespace),
            issuer_api_resource(IssuerKind::ClusterIssuer),
            watcher_config(),
            move |issuer| {
                let state = cluster_issuer_policies.state();
                policies_for_issuer(
                    state.iter().map(Arc::as_ref),
                    IssuerKind::ClusterIssuer,
                    &issuer,
                )
            },
        );

    tracing::info!(
        namespace = namespace.unwrap_or("<all>"),
        "- TLSPolicy controller"
    );

    Box::pin(
        controller
            .shutdown_on_signal()
            .run(reconcile, error_policy, ctx)
            .for_each(log_reconcile_result("TLSPolicy")),
    )
}

fn log_reconcile_result<T: std::fmt::Debug, E: std::fmt::Debug>(
    controller_name: &'static str,
) -> impl Fn(Result<T, E>) -> std::future::Ready<()> {
    move |result| {
        match result {
            Ok(action) => tracing::debug!(?action, "{} reconciliation completed", controller_name),
            Err(e) => tracing::error!(error = ?e, "{} reconciliation error", controller_name),
        }
        std::future::ready(())
    }
}
