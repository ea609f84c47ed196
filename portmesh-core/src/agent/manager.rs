//! Tunnel lifecycle: one retry task per local port
//!
//! `connect` runs one synchronous attempt and makes sure a retry task tracks
//! the port afterwards, so tunnels that drop are dialed again and
//! `disconnect` has something to tear down. Connect, disconnect and every
//! retry attempt for a port are serialized through a per-port lock.

use super::pool::{ConnectionPool, DialRequest};
use super::resolve::{LocalAddresses, Resolver, SystemInterfaces, SystemResolver};
use super::spec::{ConnectionKey, TunnelSpec};
use crate::connection::ConnectionOptions;
use crate::events::{EventSink, TunnelEvent};
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use portmesh_common::{Result, DEFAULT_RETRY_INTERVAL_SECS, DEFAULT_SERVER_PORT, DEFAULT_SHARED_SECRET};
use std::net::SocketAddr;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// Settings shared by every tunnel the manager opens
#[derive(Debug, Clone)]
pub struct ManagerConfig {
    /// Port of the forward server on every resolved host
    pub server_port: u16,
    pub credential: String,
    pub retry_interval: Duration,
    /// Listen host sent in `tcpip-forward`; the resolved IP when unset
    pub forward_bind_host: Option<String>,
}

impl Default for ManagerConfig {
    fn default() -> Self {
        Self {
            server_port: DEFAULT_SERVER_PORT,
            credential: DEFAULT_SHARED_SECRET.to_string(),
            retry_interval: Duration::from_secs(DEFAULT_RETRY_INTERVAL_SECS),
            forward_bind_host: None,
        }
    }
}

#[derive(Debug, Clone)]
struct Registration {
    spec: TunnelSpec,
    remote_port: u16,
}

type Registrations = Arc<Mutex<Vec<Registration>>>;

enum Removal {
    Untracked,
    One,
    Last,
}

struct TaskSlot {
    cancel: CancellationToken,
    join: JoinHandle<()>,
    registrations: Registrations,
}

/// Owns the retry tasks and the connection pool of an agent
///
/// Cloning is cheap; clones share all state.
#[derive(Clone)]
pub struct TunnelManager {
    config: Arc<ManagerConfig>,
    pool: ConnectionPool,
    resolver: Arc<dyn Resolver>,
    local: Arc<dyn LocalAddresses>,
    events: Arc<dyn EventSink>,
    tasks: Arc<DashMap<u16, TaskSlot>>,
    locks: Arc<DashMap<u16, Arc<tokio::sync::Mutex<()>>>>,
}

impl std::fmt::Debug for TunnelManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TunnelManager")
            .field("config", &self.config)
            .field("tasks", &self.tasks.len())
            .field("pool", &self.pool)
            .finish_non_exhaustive()
    }
}

impl TunnelManager {
    /// Create a manager that resolves through DNS and skips the host's own
    /// interface addresses
    pub fn new(config: ManagerConfig, options: ConnectionOptions, events: Arc<dyn EventSink>) -> Self {
        Self {
            config: Arc::new(config),
            pool: ConnectionPool::new(options, events.clone()),
            resolver: Arc::new(SystemResolver),
            local: Arc::new(SystemInterfaces),
            events,
            tasks: Arc::new(DashMap::new()),
            locks: Arc::new(DashMap::new()),
        }
    }

    /// Replace the resolver used for remote hosts
    #[must_use]
    pub fn with_resolver(mut self, resolver: Arc<dyn Resolver>) -> Self {
        self.resolver = resolver;
        self
    }

    /// Replace the source of addresses treated as this host
    #[must_use]
    pub fn with_local_addresses(mut self, local: Arc<dyn LocalAddresses>) -> Self {
        self.local = local;
        self
    }

    /// Live tunnels, keyed by connection key
    pub fn pool(&self) -> &ConnectionPool {
        &self.pool
    }

    /// Connect every static spec that names a concrete local port
    ///
    /// Wildcard specs wait for port events. Failures are logged; their retry
    /// tasks keep going.
    pub async fn start(&self, specs: &[TunnelSpec]) {
        for spec in specs {
            let Some(local_port) = spec.local_port().fixed() else {
                debug!(%spec, "waiting for port events");
                continue;
            };
            let remote_port = spec.remote_port().fixed().unwrap_or(0);
            if let Err(e) = self.connect(spec, local_port, remote_port).await {
                warn!(%spec, "initial connect failed, retrying in background: {}", e);
            }
        }
    }

    /// One synchronous attempt for `spec` at `local_port`
    ///
    /// Returns the remote port in use. On error a retry task is still left
    /// tracking the port.
    pub async fn connect(&self, spec: &TunnelSpec, local_port: u16, remote_port: u16) -> Result<u16> {
        let lock = self.port_lock(local_port);
        let _guard = lock.lock().await;

        let mut remote_port = remote_port;
        if remote_port == 0 {
            if let Some(known) = self.registered_port(spec, local_port) {
                remote_port = known;
            }
        }

        let result = self.connect_all(spec, local_port, &mut remote_port).await;
        if !matches!(&result, Err(e) if !e.is_retryable()) {
            self.ensure_task(spec, local_port, remote_port);
        }
        self.release_lock(local_port);
        result.map(|()| remote_port)
    }

    /// Stop the retry task for `local_port` and tear down its tunnels
    ///
    /// No-op when the port is not tracked. Returns once teardown finished.
    pub async fn disconnect(&self, local_port: u16) {
        let lock = self.port_lock(local_port);
        let _guard = lock.lock().await;
        self.disconnect_locked(local_port).await;
        self.release_lock(local_port);
    }

    /// Drop one spec from the task for `local_port`
    ///
    /// Used to roll back a partially applied batch. The task stops when its
    /// last registration goes.
    pub async fn disconnect_spec(&self, spec: &TunnelSpec, local_port: u16) {
        let lock = self.port_lock(local_port);
        let _guard = lock.lock().await;

        let removal = match self.tasks.get(&local_port) {
            None => Removal::Untracked,
            Some(slot) => {
                let mut registrations = lock_registrations(&slot.registrations);
                let remaining = registrations.iter().filter(|r| r.spec != *spec).count();
                if remaining == registrations.len() {
                    Removal::Untracked
                } else if remaining == 0 {
                    Removal::Last
                } else {
                    registrations.retain(|r| r.spec != *spec);
                    Removal::One
                }
            }
        };

        match removal {
            Removal::Untracked => {}
            Removal::One => self.teardown_spec(spec, local_port).await,
            Removal::Last => self.disconnect_locked(local_port).await,
        }
        self.release_lock(local_port);
    }

    /// Caller holds the port lock
    async fn disconnect_locked(&self, local_port: u16) {
        let Some((_, slot)) = self.tasks.remove(&local_port) else {
            debug!(local_port, "disconnect for untracked port");
            return;
        };
        slot.cancel.cancel();
        if let Err(e) = slot.join.await {
            warn!(local_port, "retry task ended abnormally: {}", e);
        }
    }

    /// Stop every retry task
    pub async fn shutdown(&self) {
        let ports: Vec<u16> = self.tasks.iter().map(|slot| *slot.key()).collect();
        for port in ports {
            self.disconnect(port).await;
        }
    }

    /// Whether a retry task exists for `local_port`
    pub fn is_tracking(&self, local_port: u16) -> bool {
        self.tasks.contains_key(&local_port)
    }

    /// Number of running retry tasks
    pub fn task_count(&self) -> usize {
        self.tasks.len()
    }

    /// Remote port remembered for `spec` at `local_port`
    pub fn remote_port(&self, spec: &TunnelSpec, local_port: u16) -> Option<u16> {
        self.registered_port(spec, local_port)
    }

    fn registered_port(&self, spec: &TunnelSpec, local_port: u16) -> Option<u16> {
        let slot = self.tasks.get(&local_port)?;
        let registrations = lock_registrations(&slot.registrations);
        registrations
            .iter()
            .find(|r| r.spec == *spec)
            .map(|r| r.remote_port)
            .filter(|port| *port != 0)
    }

    fn port_lock(&self, local_port: u16) -> Arc<tokio::sync::Mutex<()>> {
        self.locks.entry(local_port).or_default().clone()
    }

    /// Forget the lock of an untracked port
    ///
    /// Called by the guard holder. The entry stays while anyone else holds a
    /// clone, so a waiter and a later caller always share one mutex.
    fn release_lock(&self, local_port: u16) {
        self.locks.remove_if(&local_port, |_, lock| {
            Arc::strong_count(lock) <= 2 && !self.tasks.contains_key(&local_port)
        });
    }

    fn ensure_task(&self, spec: &TunnelSpec, local_port: u16, remote_port: u16) {
        match self.tasks.entry(local_port) {
            Entry::Occupied(slot) => {
                let mut registrations = lock_registrations(&slot.get().registrations);
                match registrations.iter_mut().find(|r| r.spec == *spec) {
                    Some(existing) if remote_port != 0 => existing.remote_port = remote_port,
                    Some(_) => {}
                    None => registrations.push(Registration {
                        spec: spec.clone(),
                        remote_port,
                    }),
                }
            }
            Entry::Vacant(vacant) => {
                let registrations: Registrations = Arc::new(Mutex::new(vec![Registration {
                    spec: spec.clone(),
                    remote_port,
                }]));
                let cancel = CancellationToken::new();
                let join = tokio::spawn(self.clone().retry_loop(
                    local_port,
                    cancel.clone(),
                    registrations.clone(),
                ));
                debug!(local_port, "retry task started");
                vacant.insert(TaskSlot {
                    cancel,
                    join,
                    registrations,
                });
            }
        }
    }

    async fn retry_loop(self, local_port: u16, cancel: CancellationToken, registrations: Registrations) {
        let lock = self.port_lock(local_port);
        loop {
            tokio::select! {
                biased;
                () = cancel.cancelled() => break,
                () = tokio::time::sleep(self.config.retry_interval) => {}
            }
            // disconnect holds the lock while it waits for this task
            let _guard = tokio::select! {
                biased;
                () = cancel.cancelled() => break,
                guard = lock.lock() => guard,
            };

            let snapshot = lock_registrations(&registrations).clone();
            for registration in snapshot {
                let mut remote_port = registration.remote_port;
                if let Err(e) = self
                    .connect_all(&registration.spec, local_port, &mut remote_port)
                    .await
                {
                    debug!(spec = %registration.spec, local_port, "retry attempt failed: {}", e);
                }
                if remote_port != registration.remote_port {
                    let mut current = lock_registrations(&registrations);
                    if let Some(r) = current.iter_mut().find(|r| r.spec == registration.spec) {
                        r.remote_port = remote_port;
                    }
                }
            }
        }

        let snapshot = lock_registrations(&registrations).clone();
        for registration in snapshot {
            self.teardown_spec(&registration.spec, local_port).await;
        }
        self.events.emit(TunnelEvent::RetryStopped { local_port });
    }

    /// Connect `spec` to every resolved, non-local address of its remote host
    ///
    /// Per-address failures do not stop the loop; the first one is returned.
    /// `remote_port` is updated to the port the server bound so later
    /// addresses and retries reuse it.
    async fn connect_all(&self, spec: &TunnelSpec, local_port: u16, remote_port: &mut u16) -> Result<()> {
        let ips = match self.resolver.resolve(spec.remote_host()).await {
            Ok(ips) => ips,
            Err(e) => {
                self.events.emit(TunnelEvent::ResolutionFailed {
                    host: spec.remote_host().to_string(),
                    reason: e.to_string(),
                });
                return Err(e);
            }
        };
        let own = self.local.addresses();

        let mut first_error = None;
        for ip in ips {
            let key = ConnectionKey::new(spec, local_port, ip);
            if own.contains(&ip) {
                self.events.emit(TunnelEvent::SelfConnectionSkipped {
                    key: key.to_string(),
                });
                continue;
            }
            if self.pool.is_connected(&key) {
                if *remote_port == 0 {
                    if let Some(port) = self.pool.remote_port(&key) {
                        *remote_port = port;
                    }
                }
                continue;
            }

            info!(%key, remote_port = *remote_port, "connecting");
            let request = DialRequest {
                key: key.clone(),
                server: SocketAddr::from((ip, self.config.server_port)),
                principal: spec.identity(),
                credential: self.config.credential.clone(),
                bind_host: self
                    .config
                    .forward_bind_host
                    .clone()
                    .unwrap_or_else(|| ip.to_string()),
                remote_port: *remote_port,
                local_target: spec.local_target(local_port),
                owner: owner_label(spec, local_port),
            };
            match self.pool.connect(request).await {
                Ok(bound) => *remote_port = bound,
                Err(e) => {
                    self.events.emit(TunnelEvent::DialFailed {
                        key: key.to_string(),
                        reason: e.to_string(),
                    });
                    first_error.get_or_insert(e);
                }
            }
        }
        first_error.map_or(Ok(()), Err)
    }

    /// Best-effort teardown of every tunnel `spec` opened at `local_port`
    async fn teardown_spec(&self, spec: &TunnelSpec, local_port: u16) {
        let mut keys = self.pool.keys_owned_by(&owner_label(spec, local_port));
        match self.resolver.resolve(spec.remote_host()).await {
            Ok(ips) => {
                for ip in ips {
                    let key = ConnectionKey::new(spec, local_port, ip);
                    if !keys.contains(&key) {
                        keys.push(key);
                    }
                }
            }
            Err(e) => debug!(%spec, "re-resolving for teardown failed: {}", e),
        }

        for key in keys {
            if let Err(e) = self.pool.disconnect(&key).await {
                self.events.emit(TunnelEvent::TeardownFailed {
                    key: key.to_string(),
                    reason: e.to_string(),
                });
            }
        }
    }
}

fn owner_label(spec: &TunnelSpec, local_port: u16) -> String {
    format!("{spec}#{local_port}")
}

fn lock_registrations(registrations: &Registrations) -> std::sync::MutexGuard<'_, Vec<Registration>> {
    registrations.lock().unwrap_or_else(PoisonError::into_inner)
}
