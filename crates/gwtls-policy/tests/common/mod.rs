//! In-memory object store for end-to-end reconcile scenarios
//!
//! Behaves like the API server where the controller depends on it:
//! resourceVersion compare-and-swap on gateway writes, `AlreadyExists` on
//! duplicate creates, and deletion that completes once the last finalizer is
//! gone.

#![allow(dead_code)]

use std::collections::{BTreeMap, HashSet};
use std::sync::atomic::{AtomicU32, AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use chrono::{TimeZone, Utc};
use k8s_openapi::apimachinery::pkg::apis::meta::v1::Time;
use kube::runtime::controller::Action;
use kube::ResourceExt;

use gwtls_common::crd::{
    Certificate, CertificateSpec, Condition, Gateway, GatewaySpec, GatewayStatus,
    GatewayTlsConfig, IssuerKind, IssuerReference, Listener, PolicyTargetReference,
    SecretObjectReference, TLSPolicy, TLSPolicySpec, TLSPolicyStatus,
};
use gwtls_common::error::api_error;
use gwtls_common::events::NoopEventPublisher;
use gwtls_common::{Error, PolicyKey, POLICY_FINALIZER};
use gwtls_policy::backoff::ControllerSettings;
use gwtls_policy::{reconcile, Context, PolicyError, PolicyKubeClient};

type Key = (String, String);

fn key_of(namespace: &str, name: &str) -> Key {
    (namespace.to_string(), name.to_string())
}

#[derive(Default)]
struct Objects {
    policies: BTreeMap<Key, TLSPolicy>,
    gateways: BTreeMap<Key, Gateway>,
    certificates: BTreeMap<Key, Certificate>,
    issuers: HashSet<(IssuerKind, String, String)>,
}

/// Store shared by every reconcile in a scenario
#[derive(Default)]
pub struct MemoryStore {
    objects: Mutex<Objects>,
    revision: AtomicU64,
    uids: AtomicU64,
    writes: AtomicUsize,
    gateway_conflicts: AtomicU32,
}

impl MemoryStore {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    fn next_revision(&self) -> Option<String> {
        Some((self.revision.fetch_add(1, Ordering::SeqCst) + 1).to_string())
    }

    fn write(&self) {
        self.writes.fetch_add(1, Ordering::SeqCst);
    }

    /// Number of mutating calls so far
    pub fn writes(&self) -> usize {
        self.writes.load(Ordering::SeqCst)
    }

    /// Make the next `n` gateway writes fail with a 409 conflict
    pub fn inject_gateway_conflicts(&self, n: u32) {
        self.gateway_conflicts.store(n, Ordering::SeqCst);
    }

    fn take_injected_conflict(&self) -> bool {
        self.gateway_conflicts
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok()
    }

    pub fn insert_policy(&self, mut policy: TLSPolicy) {
        let ns = policy.namespace().unwrap_or_default();
        let uid = self.uids.fetch_add(1, Ordering::SeqCst);
        policy.metadata.uid.get_or_insert_with(|| format!("uid-{}", uid));
        policy.metadata.generation.get_or_insert(1);
        policy.metadata.resource_version = self.next_revision();
        self.objects
            .lock()
            .unwrap()
            .policies
            .insert(key_of(&ns, &policy.name_any()), policy);
    }

    /// Replace a policy's spec as a user edit would, bumping its generation
    pub fn update_policy_spec(&self, namespace: &str, name: &str, spec: TLSPolicySpec) {
        let mut objects = self.objects.lock().unwrap();
        let policy = objects
            .policies
            .get_mut(&key_of(namespace, name))
            .expect("policy exists");
        policy.spec = spec;
        policy.metadata.generation = Some(policy.metadata.generation.unwrap_or(0) + 1);
        policy.metadata.resource_version = self.next_revision();
    }

    /// Delete a policy as `kubectl delete` would
    pub fn delete_policy(&self, namespace: &str, name: &str) {
        let mut objects = self.objects.lock().unwrap();
        let key = key_of(namespace, name);
        let Some(policy) = objects.policies.get_mut(&key) else {
            return;
        };
        if policy.finalizers().is_empty() {
            objects.policies.remove(&key);
        } else {
            policy.metadata.deletion_timestamp = Some(Time(Utc::now()));
        }
    }

    pub fn insert_gateway(&self, mut gateway: Gateway) {
        let ns = gateway.namespace().unwrap_or_default();
        gateway.metadata.generation.get_or_insert(1);
        gateway.metadata.resource_version = self.next_revision();
        self.objects
            .lock()
            .unwrap()
            .gateways
            .insert(key_of(&ns, &gateway.name_any()), gateway);
    }

    /// Delete a gateway outright
    pub fn remove_gateway(&self, namespace: &str, name: &str) {
        self.objects
            .lock()
            .unwrap()
            .gateways
            .remove(&key_of(namespace, name));
    }

    /// Replace a gateway's listeners, bumping its generation
    pub fn set_listeners(&self, namespace: &str, name: &str, listeners: Vec<Listener>) {
        let mut objects = self.objects.lock().unwrap();
        let gateway = objects
            .gateways
            .get_mut(&key_of(namespace, name))
            .expect("gateway exists");
        gateway.spec.listeners = listeners;
        gateway.metadata.generation = Some(gateway.metadata.generation.unwrap_or(0) + 1);
        gateway.metadata.resource_version = self.next_revision();
    }

    pub fn insert_issuer(&self, kind: IssuerKind, namespace: &str, name: &str) {
        let namespace = if kind.is_namespaced() { namespace } else { "" };
        self.objects.lock().unwrap().issuers.insert((
            kind,
            namespace.to_string(),
            name.to_string(),
        ));
    }

    pub fn insert_certificate(&self, mut certificate: Certificate) {
        let ns = certificate.namespace().unwrap_or_default();
        certificate.metadata.resource_version = self.next_revision();
        self.objects
            .lock()
            .unwrap()
            .certificates
            .insert(key_of(&ns, &certificate.name_any()), certificate);
    }

    pub fn policy(&self, namespace: &str, name: &str) -> Option<TLSPolicy> {
        self.objects
            .lock()
            .unwrap()
            .policies
            .get(&key_of(namespace, name))
            .cloned()
    }

    pub fn gateway(&self, namespace: &str, name: &str) -> Gateway {
        self.objects
            .lock()
            .unwrap()
            .gateways
            .get(&key_of(namespace, name))
            .cloned()
            .expect("gateway exists")
    }

    /// Certificates in a namespace, ordered by name
    pub fn certificates(&self, namespace: &str) -> Vec<Certificate> {
        self.objects
            .lock()
            .unwrap()
            .certificates
            .iter()
            .filter(|((ns, _), _)| ns == namespace)
            .map(|(_, c)| c.clone())
            .collect()
    }
}

#[async_trait]
impl PolicyKubeClient for MemoryStore {
    async fn get_policy(&self, name: &str, namespace: &str) -> Result<Option<TLSPolicy>, Error> {
        Ok(self.policy(namespace, name))
    }

    async fn patch_policy_status(
        &self,
        name: &str,
        namespace: &str,
        status: &TLSPolicyStatus,
    ) -> Result<(), Error> {
        self.write();
        let mut objects = self.objects.lock().unwrap();
        let policy = objects
            .policies
            .get_mut(&key_of(namespace, name))
            .ok_or_else(|| api_error(404, "NotFound"))?;
        policy.status = Some(status.clone());
        policy.metadata.resource_version = self.next_revision();
        Ok(())
    }

    async fn add_policy_finalizer(&self, policy: &TLSPolicy) -> Result<(), Error> {
        self.write();
        let key = policy.key();
        let mut objects = self.objects.lock().unwrap();
        let stored = objects
            .policies
            .get_mut(&key_of(&key.namespace, &key.name))
            .ok_or_else(|| api_error(404, "NotFound"))?;
        let finalizers = stored.metadata.finalizers.get_or_insert_with(Vec::new);
        if !finalizers.iter().any(|f| f == POLICY_FINALIZER) {
            finalizers.push(POLICY_FINALIZER.to_string());
        }
        stored.metadata.resource_version = self.next_revision();
        Ok(())
    }

    async fn remove_policy_finalizer(&self, policy: &TLSPolicy) -> Result<(), Error> {
        self.write();
        let key = policy.key();
        let id = key_of(&key.namespace, &key.name);
        let mut objects = self.objects.lock().unwrap();
        let Some(stored) = objects.policies.get_mut(&id) else {
            return Ok(());
        };
        if let Some(finalizers) = stored.metadata.finalizers.as_mut() {
            finalizers.retain(|f| f != POLICY_FINALIZER);
        }
        if stored.is_deleting() && stored.finalizers().is_empty() {
            objects.policies.remove(&id);
        }
        Ok(())
    }

    async fn get_gateway(&self, name: &str, namespace: &str) -> Result<Option<Gateway>, Error> {
        Ok(self
            .objects
            .lock()
            .unwrap()
            .gateways
            .get(&key_of(namespace, name))
            .cloned())
    }

    async fn list_gateways(&self, namespace: &str) -> Result<Vec<Gateway>, Error> {
        Ok(self
            .objects
            .lock()
            .unwrap()
            .gateways
            .iter()
            .filter(|((ns, _), _)| ns == namespace)
            .map(|(_, g)| g.clone())
            .collect())
    }

    async fn patch_gateway_annotations(
        &self,
        name: &str,
        namespace: &str,
        resource_version: Option<String>,
        annotations: BTreeMap<String, Option<String>>,
    ) -> Result<Gateway, Error> {
        self.write();
        if self.take_injected_conflict() {
            return Err(api_error(409, "Conflict"));
        }
        let mut objects = self.objects.lock().unwrap();
        let gateway = objects
            .gateways
            .get_mut(&key_of(namespace, name))
            .ok_or_else(|| api_error(404, "NotFound"))?;
        if resource_version.is_some() && resource_version != gateway.metadata.resource_version {
            return Err(api_error(409, "Conflict"));
        }
        let stored = gateway.metadata.annotations.get_or_insert_with(BTreeMap::new);
        for (key, value) in annotations {
            match value {
                Some(v) => stored.insert(key, v),
                None => stored.remove(&key),
            };
        }
        gateway.metadata.resource_version = self.next_revision();
        Ok(gateway.clone())
    }

    async fn patch_gateway_conditions(
        &self,
        name: &str,
        namespace: &str,
        resource_version: Option<String>,
        conditions: Vec<Condition>,
    ) -> Result<(), Error> {
        self.write();
        let mut objects = self.objects.lock().unwrap();
        let gateway = objects
            .gateways
            .get_mut(&key_of(namespace, name))
            .ok_or_else(|| api_error(404, "NotFound"))?;
        if resource_version.is_some() && resource_version != gateway.metadata.resource_version {
            return Err(api_error(409, "Conflict"));
        }
        gateway.status = Some(GatewayStatus { conditions });
        gateway.metadata.resource_version = self.next_revision();
        Ok(())
    }

    async fn issuer_exists(
        &self,
        kind: IssuerKind,
        name: &str,
        namespace: &str,
    ) -> Result<bool, Error> {
        let namespace = if kind.is_namespaced() { namespace } else { "" };
        Ok(self.objects.lock().unwrap().issuers.contains(&(
            kind,
            namespace.to_string(),
            name.to_string(),
        )))
    }

    async fn list_certificates(&self, owner: &PolicyKey) -> Result<Vec<Certificate>, Error> {
        Ok(self
            .objects
            .lock()
            .unwrap()
            .certificates
            .values()
            .filter(|c| c.owning_policy().as_ref() == Some(owner))
            .cloned()
            .collect())
    }

    async fn create_certificate(&self, certificate: &Certificate) -> Result<(), Error> {
        self.write();
        let id = key_of(
            &certificate.namespace().unwrap_or_default(),
            &certificate.name_any(),
        );
        let mut objects = self.objects.lock().unwrap();
        if objects.certificates.contains_key(&id) {
            return Err(api_error(409, "AlreadyExists"));
        }
        let mut created = certificate.clone();
        created.metadata.resource_version = self.next_revision();
        objects.certificates.insert(id, created);
        Ok(())
    }

    async fn patch_certificate_spec(
        &self,
        name: &str,
        namespace: &str,
        spec: &CertificateSpec,
    ) -> Result<(), Error> {
        self.write();
        let mut objects = self.objects.lock().unwrap();
        let cert = objects
            .certificates
            .get_mut(&key_of(namespace, name))
            .ok_or_else(|| api_error(404, "NotFound"))?;
        cert.spec.dns_names = spec.dns_names.clone();
        cert.spec.issuer_ref = spec.issuer_ref.clone();
        cert.metadata.resource_version = self.next_revision();
        Ok(())
    }

    async fn delete_certificate(&self, name: &str, namespace: &str) -> Result<(), Error> {
        self.write();
        self.objects
            .lock()
            .unwrap()
            .certificates
            .remove(&key_of(namespace, name));
        Ok(())
    }
}

// =============================================================================
// Fixtures
// =============================================================================

pub const NS: &str = "ns";

pub fn cluster_issuer() -> IssuerReference {
    IssuerReference {
        name: "letsencrypt".to_string(),
        kind: "ClusterIssuer".to_string(),
        group: "cert-manager.io".to_string(),
    }
}

pub fn policy_spec(gateway: &str, issuer: IssuerReference) -> TLSPolicySpec {
    TLSPolicySpec {
        target_ref: PolicyTargetReference {
            group: "gateway.networking.k8s.io".to_string(),
            kind: "Gateway".to_string(),
            name: gateway.to_string(),
        },
        issuer_ref: issuer,
    }
}

/// Policy in [`NS`] created `created_secs` after the epoch
pub fn policy(name: &str, gateway: &str, created_secs: i64) -> TLSPolicy {
    let mut policy = TLSPolicy::new(name, policy_spec(gateway, cluster_issuer()));
    policy.metadata.namespace = Some(NS.to_string());
    policy.metadata.creation_timestamp = Utc.timestamp_opt(created_secs, 0).single().map(Time);
    policy
}

pub fn gateway(name: &str, listeners: Vec<Listener>) -> Gateway {
    let mut gateway = Gateway::new(
        name,
        GatewaySpec {
            gateway_class_name: "istio".to_string(),
            listeners,
        },
    );
    gateway.metadata.namespace = Some(NS.to_string());
    gateway
}

pub fn https(name: &str, host: &str, secret: &str) -> Listener {
    Listener {
        name: name.to_string(),
        hostname: Some(host.to_string()),
        port: 443,
        protocol: "HTTPS".to_string(),
        tls: Some(GatewayTlsConfig {
            mode: Some("Terminate".to_string()),
            certificate_refs: vec![SecretObjectReference {
                kind: Some("Secret".to_string()),
                name: secret.to_string(),
                ..Default::default()
            }],
        }),
    }
}

pub fn http(name: &str, host: &str) -> Listener {
    Listener {
        name: name.to_string(),
        hostname: Some(host.to_string()),
        port: 80,
        protocol: "HTTP".to_string(),
        tls: None,
    }
}

/// Store with the cluster issuer installed
pub fn store_with_issuer() -> Arc<MemoryStore> {
    let store = MemoryStore::new();
    store.insert_issuer(IssuerKind::ClusterIssuer, "", "letsencrypt");
    store
}

pub fn context(store: &Arc<MemoryStore>) -> Arc<Context> {
    Arc::new(Context::new(
        store.clone(),
        Arc::new(NoopEventPublisher),
        ControllerSettings::default(),
    ))
}

/// Reconcile the stored version of a policy, as a watch event would
pub async fn reconcile_policy(
    store: &Arc<MemoryStore>,
    ctx: &Arc<Context>,
    name: &str,
) -> Result<Action, PolicyError> {
    let policy = store.policy(NS, name).expect("policy exists");
    reconcile(Arc::new(policy), ctx.clone()).await
}

/// Reconcile each named policy in turn, ignoring failures
pub async fn reconcile_all(store: &Arc<MemoryStore>, ctx: &Arc<Context>, names: &[&str]) {
    for name in names {
        if store.policy(NS, name).is_some() {
            let _ = reconcile_policy(store, ctx, name).await;
        }
    }
}

/// `Ready` condition of a stored policy as `(status, reason)`
pub fn ready(store: &MemoryStore, name: &str) -> (String, String) {
    let policy = store.policy(NS, name).expect("policy exists");
    let status = policy.status.unwrap_or_default();
    let cond = status
        .conditions
        .iter()
        .find(|c| c.type_ == "Ready")
        .expect("Ready condition");
    (cond.status.to_string(), cond.reason.clone())
}

/// Certificates in [`NS`] as `(name, dnsNames)`
pub fn certificate_names(store: &MemoryStore) -> Vec<(String, Vec<String>)> {
    store
        .certificates(NS)
        .into_iter()
        .map(|c| (c.name_any(), c.spec.dns_names))
        .collect()
}
