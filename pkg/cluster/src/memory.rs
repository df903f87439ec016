//! In-process cluster used by tests and local runs.
//!
//! Service-account mutations are recorded in a sequenced event log; a watch
//! replays the events after its resource version and then receives live
//! events, so list-then-watch never misses a change.

use async_trait::async_trait;
use futures_util::StreamExt;
use pkg_types::identity::{IdentityEvent, IdentityKey, Scope};
use pkg_types::secret::SecretObject;
use std::collections::{BTreeMap, BTreeSet};
use std::sync::{Arc, Mutex, MutexGuard};
use tokio::sync::mpsc;
use tokio_stream::wrappers::UnboundedReceiverStream;

use crate::client::{ClusterClient, IdentityList, IdentityStream};
use crate::error::ClusterError;

const DEFAULT_MAX_EVENTS: usize = 1024;

/// Write counters, used by tests to assert idempotence.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ClusterStats {
    pub secret_creates: u64,
    pub secret_updates: u64,
    pub secret_deletes: u64,
}

impl ClusterStats {
    pub fn writes(&self) -> u64 {
        self.secret_creates + self.secret_updates + self.secret_deletes
    }
}

struct Watcher {
    scope: Scope,
    sender: mpsc::UnboundedSender<Result<IdentityEvent, ClusterError>>,
}

struct Inner {
    seq: u64,
    /// Recent service-account events (capped).
    events: Vec<(u64, IdentityEvent)>,
    max_events: usize,
    service_accounts: BTreeSet<IdentityKey>,
    watchers: Vec<Watcher>,
    secrets: BTreeMap<(String, String), SecretObject>,
    secret_version: u64,
    stats: ClusterStats,
    fail_next: u32,
    conflict_next_update: u32,
}

impl Inner {
    fn emit(&mut self, event: IdentityEvent) {
        self.seq += 1;
        if self.events.len() >= self.max_events {
            self.events.remove(0);
        }
        self.events.push((self.seq, event.clone()));
        // Closed receivers are dropped here.
        self.watchers.retain(|w| {
            !w.scope.contains(event.key()) || w.sender.send(Ok(event.clone())).is_ok()
        });
    }

    fn injected_failure(&mut self) -> Result<(), ClusterError> {
        if self.fail_next > 0 {
            self.fail_next -= 1;
            return Err(ClusterError::Transient("injected failure".to_string()));
        }
        Ok(())
    }

    fn store(&mut self, mut secret: SecretObject) -> SecretObject {
        self.secret_version += 1;
        secret.resource_version = Some(self.secret_version.to_string());
        self.secrets.insert(
            (secret.namespace.clone(), secret.name.clone()),
            secret.clone(),
        );
        secret
    }
}

/// Cluster state held in memory. Cheap to clone; clones share state.
#[derive(Clone)]
pub struct MemoryCluster {
    inner: Arc<Mutex<Inner>>,
}

impl Default for MemoryCluster {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryCluster {
    pub fn new() -> Self {
        Self::with_capacity(DEFAULT_MAX_EVENTS)
    }

    /// Create a cluster retaining at most `max_events` watch events for replay.
    pub fn with_capacity(max_events: usize) -> Self {
        Self {
            inner: Arc::new(Mutex::new(Inner {
                seq: 0,
                events: Vec::with_capacity(max_events),
                max_events,
                service_accounts: BTreeSet::new(),
                watchers: Vec::new(),
                secrets: BTreeMap::new(),
                secret_version: 0,
                stats: ClusterStats::default(),
                fail_next: 0,
                conflict_next_update: 0,
            })),
        }
    }

    fn lock(&self) -> MutexGuard<'_, Inner> {
        self.inner.lock().unwrap_or_else(|e| e.into_inner())
    }

    pub fn add_service_account(&self, key: IdentityKey) {
        let mut inner = self.lock();
        if inner.service_accounts.insert(key.clone()) {
            inner.emit(IdentityEvent::Added(key));
        }
    }

    pub fn remove_service_account(&self, key: &IdentityKey) {
        let mut inner = self.lock();
        if inner.service_accounts.remove(key) {
            inner.emit(IdentityEvent::Deleted(key.clone()));
        }
    }

    /// Change service accounts without notifying watchers, as if the events
    /// were lost while the watch connection was down.
    pub fn add_service_account_silently(&self, key: IdentityKey) {
        let mut inner = self.lock();
        inner.service_accounts.insert(key);
    }

    pub fn remove_service_account_silently(&self, key: &IdentityKey) {
        let mut inner = self.lock();
        inner.service_accounts.remove(key);
    }

    /// End every open watch stream.
    pub fn disconnect_watches(&self) {
        self.lock().watchers.clear();
    }

    pub fn watcher_count(&self) -> usize {
        let mut inner = self.lock();
        inner.watchers.retain(|w| !w.sender.is_closed());
        inner.watchers.len()
    }

    /// Fail the next `n` API calls with a transient error.
    pub fn fail_next_requests(&self, n: u32) {
        self.lock().fail_next = n;
    }

    /// Reject the next update with a conflict, as if another writer raced it.
    pub fn conflict_next_update(&self) {
        self.lock().conflict_next_update += 1;
    }

    /// Write a secret directly, bypassing stats and failure injection.
    pub fn put_secret_raw(&self, secret: SecretObject) -> SecretObject {
        self.lock().store(secret)
    }

    pub fn secret(&self, namespace: &str, name: &str) -> Option<SecretObject> {
        self.lock()
            .secrets
            .get(&(namespace.to_string(), name.to_string()))
            .cloned()
    }

    pub fn secret_count(&self) -> usize {
        self.lock().secrets.len()
    }

    pub fn stats(&self) -> ClusterStats {
        self.lock().stats
    }
}

#[async_trait]
impl ClusterClient for MemoryCluster {
    async fn list_identities(&self, scope: &Scope) -> Result<IdentityList, ClusterError> {
        let mut inner = self.lock();
        inner.injected_failure()?;
        Ok(IdentityList {
            identities: inner
                .service_accounts
                .iter()
                .filter(|k| scope.contains(k))
                .cloned()
                .collect(),
            resource_version: inner.seq.to_string(),
        })
    }

    async fn watch_identities(
        &self,
        scope: &Scope,
        resource_version: &str,
    ) -> Result<IdentityStream, ClusterError> {
        let mut inner = self.lock();
        inner.injected_failure()?;
        let from_seq: u64 = resource_version.parse().map_err(|_| ClusterError::Api {
            code: 400,
            message: format!("invalid resource version '{}'", resource_version),
        })?;
        if let Some((oldest, _)) = inner.events.first() {
            if from_seq + 1 < *oldest {
                return Err(ClusterError::Api {
                    code: 410,
                    message: format!("resource version {} is too old", from_seq),
                });
            }
        }

        let (sender, receiver) = mpsc::unbounded_channel();
        for (_, event) in inner
            .events
            .iter()
            .filter(|(seq, e)| *seq > from_seq && scope.contains(e.key()))
        {
            let _ = sender.send(Ok(event.clone()));
        }
        inner.watchers.push(Watcher {
            scope: scope.clone(),
            sender,
        });
        Ok(UnboundedReceiverStream::new(receiver).boxed())
    }

    async fn get_secret(
        &self,
        namespace: &str,
        name: &str,
    ) -> Result<Option<SecretObject>, ClusterError> {
        let mut inner = self.lock();
        inner.injected_failure()?;
        Ok(inner
            .secrets
            .get(&(namespace.to_string(), name.to_string()))
            .cloned())
    }

    async fn create_secret(&self, secret: &SecretObject) -> Result<SecretObject, ClusterError> {
        let mut inner = self.lock();
        inner.injected_failure()?;
        let id = (secret.namespace.clone(), secret.name.clone());
        if inner.secrets.contains_key(&id) {
            return Err(ClusterError::AlreadyExists);
        }
        inner.stats.secret_creates += 1;
        Ok(inner.store(secret.clone()))
    }

    async fn update_secret(&self, secret: &SecretObject) -> Result<SecretObject, ClusterError> {
        let mut inner = self.lock();
        inner.injected_failure()?;
        if inner.conflict_next_update > 0 {
            inner.conflict_next_update -= 1;
            return Err(ClusterError::Conflict("injected conflict".to_string()));
        }
        let id = (secret.namespace.clone(), secret.name.clone());
        let stored = inner.secrets.get(&id).ok_or(ClusterError::NotFound)?;
        if stored.resource_version != secret.resource_version {
            return Err(ClusterError::Conflict(format!(
                "secret {}/{} has been modified",
                secret.namespace, secret.name
            )));
        }
        inner.stats.secret_updates += 1;
        Ok(inner.store(secret.clone()))
    }

    async fn delete_secret(&self, namespace: &str, name: &str) -> Result<(), ClusterError> {
        let mut inner = self.lock();
        inner.injected_failure()?;
        match inner
            .secrets
            .remove(&(namespace.to_string(), name.to_string()))
        {
            Some(_) => {
                inner.stats.secret_deletes += 1;
                Ok(())
            }
            None => Err(ClusterError::NotFound),
        }
    }
}
