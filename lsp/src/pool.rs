//! Connection pool that shares connected clients across callers.
//!
//! Clients are keyed by (workspace root, launch command). Each entry carries
//! a last-used timestamp and an in-flight lease count; the idle sweep evicts
//! an entry only when both say it is safe, deciding under the same lock that
//! leases are taken under.

use std::collections::HashMap;
use std::future::Future;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, Weak};

use futures_util::future::join_all;
use tokio::sync::OnceCell;
use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior};

use crate::client::{ClientSettings, LspClient};
use crate::error::LspError;
use crate::protocol;
use crate::registry::{ServerDescriptor, ServerRegistry};
use crate::types::{LspConfig, PoolConfig};

/// A client the pool can hold.
pub trait PooledClient: Send + Sync + 'static {
    /// `false` once the connection has left its ready state for good.
    fn is_alive(&self) -> bool;

    fn disconnect(&self) -> impl Future<Output = Result<(), LspError>> + Send;
}

/// Creates connected clients on a pool miss.
pub trait Connector: Send + Sync + 'static {
    type Client: PooledClient;

    fn connect(
        &self,
        descriptor: &ServerDescriptor,
        root: &Path,
    ) -> impl Future<Output = Result<Self::Client, LspError>> + Send;
}

impl PooledClient for LspClient {
    fn is_alive(&self) -> bool {
        self.is_ready()
    }

    fn disconnect(&self) -> impl Future<Output = Result<(), LspError>> + Send {
        LspClient::disconnect(self)
    }
}

/// Spawns a real analyzer process per client.
#[derive(Debug, Clone, Default)]
pub struct ProcessConnector {
    settings: ClientSettings,
}

impl ProcessConnector {
    #[must_use]
    pub fn new(settings: ClientSettings) -> Self {
        Self { settings }
    }
}

impl Connector for ProcessConnector {
    type Client = LspClient;

    fn connect(
        &self,
        descriptor: &ServerDescriptor,
        root: &Path,
    ) -> impl Future<Output = Result<LspClient, LspError>> + Send {
        let client = LspClient::new(descriptor.clone(), root.to_path_buf(), self.settings);
        async move {
            client.connect().await?;
            Ok(client)
        }
    }
}

type PoolKey = (PathBuf, String);

/// The client behind one pool entry. Leases and pending connects hold the
/// slot itself, so they never act on a newer entry that reuses the key.
struct Slot<T> {
    /// Initialized once the connect handshake succeeds. Concurrent callers
    /// for the same key wait on the same cell instead of spawning twice.
    client: OnceCell<Arc<T>>,
    /// Set when the pool dropped the entry while it was still connecting.
    retired: AtomicBool,
}

impl<T> Slot<T> {
    fn is_retired(&self) -> bool {
        self.retired.load(Ordering::SeqCst)
    }
}

struct PoolEntry<T> {
    slot: Arc<Slot<T>>,
    last_used: Instant,
    in_flight: usize,
}

impl<T> PoolEntry<T> {
    fn new() -> Self {
        Self {
            slot: Arc::new(Slot {
                client: OnceCell::new(),
                retired: AtomicBool::new(false),
            }),
            last_used: Instant::now(),
            in_flight: 0,
        }
    }

    fn client(&self) -> Option<&Arc<T>> {
        self.slot.client.get()
    }

    fn holds(&self, slot: &Arc<Slot<T>>) -> bool {
        Arc::ptr_eq(&self.slot, slot)
    }
}

struct PoolInner<C: Connector> {
    connector: C,
    registry: Arc<dyn ServerRegistry>,
    config: PoolConfig,
    entries: Mutex<HashMap<PoolKey, PoolEntry<C::Client>>>,
}

pub struct LspPool<C: Connector = ProcessConnector> {
    inner: Arc<PoolInner<C>>,
    sweeper: Mutex<Option<JoinHandle<()>>>,
}

impl LspPool<ProcessConnector> {
    /// Pool of real analyzer processes configured from `config`.
    #[must_use]
    pub fn new(config: &LspConfig, registry: Arc<dyn ServerRegistry>) -> Self {
        Self::with_connector(
            ProcessConnector::new(ClientSettings::from(config)),
            registry,
            config.pool.clone(),
        )
    }
}

impl<C: Connector> LspPool<C> {
    #[must_use]
    pub fn with_connector(connector: C, registry: Arc<dyn ServerRegistry>, config: PoolConfig) -> Self {
        Self {
            inner: Arc::new(PoolInner {
                connector,
                registry,
                config,
                entries: Mutex::new(HashMap::new()),
            }),
            sweeper: Mutex::new(None),
        }
    }

    /// Connected client for `path`, or `None` when no analyzer handles it.
    ///
    /// The returned client is not leased; prefer
    /// [`run_with_client_lease`](Self::run_with_client_lease) so the idle
    /// sweep cannot disconnect it mid-operation.
    pub async fn get_client_for_file(&self, path: &Path) -> Result<Option<Arc<C::Client>>, LspError> {
        let Some((key, descriptor)) = self.inner.resolve(path) else {
            return Ok(None);
        };
        let slot = self.inner.reserve(&key, false).await;
        match self.inner.initialize(&slot, &descriptor, &key).await {
            Ok(client) => Ok(Some(client)),
            Err(e) => {
                self.inner.discard_unconnected(&key, &slot);
                Err(e)
            }
        }
    }

    /// Run `op` against the client for `path` while holding an in-flight
    /// lease on it. The lease is released on every exit path, including a
    /// failed connect or a cancelled future.
    ///
    /// Returns `Ok(None)` without calling `op` when no analyzer handles the
    /// file.
    pub async fn run_with_client_lease<F, Fut, T, E>(&self, path: &Path, op: F) -> Result<Option<T>, E>
    where
        F: FnOnce(Arc<C::Client>) -> Fut,
        Fut: Future<Output = Result<T, E>>,
        E: From<LspError>,
    {
        let Some((key, descriptor)) = self.inner.resolve(path) else {
            return Ok(None);
        };
        let slot = self.inner.reserve(&key, true).await;
        let _lease = Lease {
            inner: &self.inner,
            key: key.clone(),
            slot: slot.clone(),
        };
        let client = self.inner.initialize(&slot, &descriptor, &key).await?;
        op(client).await.map(Some)
    }

    /// Disconnect and remove every entry idle past the threshold with no
    /// leases. Returns how many entries were evicted.
    pub async fn sweep_idle(&self) -> usize {
        self.inner.sweep_idle().await
    }

    /// Run [`sweep_idle`](Self::sweep_idle) on the configured interval until
    /// [`disconnect_all`](Self::disconnect_all) or drop. Idempotent.
    pub fn start_idle_sweep(&self) {
        let mut sweeper = self.sweeper.lock().unwrap_or_else(PoisonError::into_inner);
        if sweeper.as_ref().is_some_and(|task| !task.is_finished()) {
            return;
        }

        let period = self.inner.config.sweep_interval();
        let inner: Weak<PoolInner<C>> = Arc::downgrade(&self.inner);
        *sweeper = Some(tokio::spawn(async move {
            let mut ticker = tokio::time::interval_at(Instant::now() + period, period);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            loop {
                ticker.tick().await;
                let Some(inner) = inner.upgrade() else { break };
                inner.sweep_idle().await;
            }
        }));
    }

    /// Stop the idle sweep and disconnect every client. Each disconnect is
    /// independent; failures are logged and the pool is left empty either
    /// way.
    ///
    /// Entries still connecting are retired: their connect is disconnected
    /// as soon as it finishes and its callers get `Disconnected`. The pool
    /// stays usable; later lookups start fresh entries.
    pub async fn disconnect_all(&self) {
        if let Some(task) = self
            .sweeper
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take()
        {
            task.abort();
        }

        let entries = std::mem::take(&mut *self.inner.lock_entries());
        let clients: Vec<(PoolKey, Arc<C::Client>)> = entries
            .into_iter()
            .filter_map(|(key, entry)| {
                entry.slot.retired.store(true, Ordering::SeqCst);
                entry.client().cloned().map(|client| (key, client))
            })
            .collect();
        disconnect_each(clients, "shutdown").await;
    }

    /// Number of pooled entries, connected or connecting.
    pub fn len(&self) -> usize {
        self.inner.lock_entries().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl<C: Connector> Drop for LspPool<C> {
    fn drop(&mut self) {
        if let Some(task) = self
            .sweeper
            .get_mut()
            .unwrap_or_else(PoisonError::into_inner)
            .take()
        {
            task.abort();
        }
    }
}

impl<C: Connector> PoolInner<C> {
    fn lock_entries(&self) -> MutexGuard<'_, HashMap<PoolKey, PoolEntry<C::Client>>> {
        self.entries.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn resolve(&self, path: &Path) -> Option<(PoolKey, ServerDescriptor)> {
        let descriptor = self.registry.server_for(path)?;
        let path = protocol::absolute_path(path);
        let root = find_workspace_root(&path, &descriptor.root_markers);
        Some(((root, descriptor.command.clone()), descriptor))
    }

    /// Find or create the entry for `key`, refresh it, and optionally take a
    /// lease, all under one lock. A dead client with no leases is replaced
    /// here; it is disconnected after the lock is released.
    async fn reserve(&self, key: &PoolKey, lease: bool) -> Arc<Slot<C::Client>> {
        let (slot, stale) = {
            let mut entries = self.lock_entries();
            let dead = entries.get(key).is_some_and(|entry| {
                entry.in_flight == 0 && entry.client().is_some_and(|client| !client.is_alive())
            });
            let stale = if dead {
                entries.remove(key).and_then(|entry| entry.client().cloned())
            } else {
                None
            };
            let entry = entries.entry(key.clone()).or_insert_with(PoolEntry::new);
            entry.last_used = Instant::now();
            if lease {
                entry.in_flight += 1;
            }
            (entry.slot.clone(), stale)
        };

        if let Some(stale) = stale {
            tracing::info!(root = %key.0.display(), command = %key.1, "Replacing dead language server");
            if let Err(e) = stale.disconnect().await {
                tracing::warn!(root = %key.0.display(), command = %key.1, error = %e, "Failed to clean up dead language server");
            }
        }
        slot
    }

    async fn initialize(
        &self,
        slot: &Arc<Slot<C::Client>>,
        descriptor: &ServerDescriptor,
        key: &PoolKey,
    ) -> Result<Arc<C::Client>, LspError> {
        let client = slot
            .client
            .get_or_try_init(|| async {
                if slot.is_retired() {
                    return Err(pool_closed(key));
                }
                let client = self.connector.connect(descriptor, &key.0).await?;
                if slot.is_retired() {
                    tracing::info!(root = %key.0.display(), command = %key.1, "Pool shut down during connect");
                    disconnect_each(vec![(key.clone(), Arc::new(client))], "shutdown").await;
                    return Err(pool_closed(key));
                }
                Ok(Arc::new(client))
            })
            .await?
            .clone();
        self.touch(key, slot);
        Ok(client)
    }

    fn touch(&self, key: &PoolKey, slot: &Arc<Slot<C::Client>>) {
        if let Some(entry) = self.lock_entries().get_mut(key)
            && entry.holds(slot)
        {
            entry.last_used = Instant::now();
        }
    }

    /// Return a lease on `slot`. A lease on an entry that has since been
    /// removed or replaced is a no-op.
    fn release(&self, key: &PoolKey, slot: &Arc<Slot<C::Client>>) {
        let mut entries = self.lock_entries();
        if let Some(entry) = entries.get_mut(key)
            && entry.holds(slot)
        {
            entry.in_flight = entry.in_flight.saturating_sub(1);
            entry.last_used = Instant::now();
            if entry.in_flight == 0 && !entry.slot.client.initialized() {
                entries.remove(key);
            }
        }
    }

    /// Drop an entry whose connect failed so the next caller retries.
    fn discard_unconnected(&self, key: &PoolKey, slot: &Arc<Slot<C::Client>>) {
        let mut entries = self.lock_entries();
        if entries.get(key).is_some_and(|entry| {
            entry.holds(slot) && entry.in_flight == 0 && !entry.slot.client.initialized()
        }) {
            entries.remove(key);
        }
    }

    async fn sweep_idle(&self) -> usize {
        let idle_timeout = self.config.idle_timeout();
        let evicted: Vec<(PoolKey, Arc<C::Client>)> = {
            let mut entries = self.lock_entries();
            let now = Instant::now();
            let expired: Vec<PoolKey> = entries
                .iter()
                .filter(|(_, entry)| {
                    entry.in_flight == 0
                        && entry.slot.client.initialized()
                        && now.duration_since(entry.last_used) > idle_timeout
                })
                .map(|(key, _)| key.clone())
                .collect();
            expired
                .into_iter()
                .filter_map(|key| {
                    let client = entries.remove(&key)?.client().cloned()?;
                    Some((key, client))
                })
                .collect()
        };

        let count = evicted.len();
        disconnect_each(evicted, "eviction").await;
        count
    }
}

/// Disconnect clients concurrently. Failures are logged, never returned.
async fn disconnect_each<T: PooledClient>(clients: Vec<(PoolKey, Arc<T>)>, reason: &str) {
    let results = join_all(clients.iter().map(|(_, client)| client.disconnect())).await;
    for ((root, command), result) in clients.iter().map(|(key, _)| key).zip(results) {
        match result {
            Ok(()) => {
                tracing::info!(root = %root.display(), command = %command, reason, "Disconnected language server");
            }
            Err(e) => {
                tracing::warn!(root = %root.display(), command = %command, reason, error = %e, "Failed to disconnect language server");
            }
        }
    }
}

fn pool_closed(key: &PoolKey) -> LspError {
    LspError::disconnected(format!(
        "pool shut down while connecting `{}` for {}",
        key.1,
        key.0.display()
    ))
}

/// Releases an in-flight lease on the entry it was taken on when dropped.
struct Lease<'a, C: Connector> {
    inner: &'a PoolInner<C>,
    key: PoolKey,
    slot: Arc<Slot<C::Client>>,
}

impl<C: Connector> Drop for Lease<'_, C> {
    fn drop(&mut self) {
        self.inner.release(&self.key, &self.slot);
    }
}

/// Walk up from the file's directory to the first directory containing any
/// of `markers`. Falls back to the file's own directory.
#[must_use]
pub fn find_workspace_root(file: &Path, markers: &[String]) -> PathBuf {
    let start = file
        .parent()
        .map_or_else(|| file.to_path_buf(), Path::to_path_buf);
    let mut dir = start.as_path();
    loop {
        if markers.iter().any(|marker| dir.join(marker).exists()) {
            return dir.to_path_buf();
        }
        match dir.parent() {
            Some(parent) if parent != dir => dir = parent,
            _ => return start,
        }
    }
}
