//! Principal to lifecycle-callback registry

use dashmap::DashMap;
use serde::Serialize;
use std::any::Any;
use std::fmt;
use std::sync::Arc;

/// Opaque per-user state handed back to the callbacks
pub type UserContext = Arc<dyn Any + Send + Sync>;

/// Fired when a forward owned by the principal is created or deleted
pub type ForwardCallback = Arc<dyn Fn(&UserContext, &ForwardInfo) + Send + Sync>;

/// Metadata describing one forward, passed to the callbacks
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ForwardInfo {
    pub principal: String,
    /// Host named in the `tcpip-forward` request
    pub local_host: String,
    /// Port the listener is bound to
    pub local_port: u16,
    /// IPv4 address of the peer that requested the forward
    pub remote_ip: String,
    pub remote_port: u16,
}

#[derive(Clone)]
pub struct UserRecord {
    pub principal: String,
    pub on_create: ForwardCallback,
    pub on_delete: ForwardCallback,
    pub context: UserContext,
}

impl fmt::Debug for UserRecord {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("UserRecord")
            .field("principal", &self.principal)
            .finish_non_exhaustive()
    }
}

impl UserRecord {
    pub fn fire_create(&self, info: &ForwardInfo) {
        (self.on_create)(&self.context, info);
    }

    pub fn fire_delete(&self, info: &ForwardInfo) {
        (self.on_delete)(&self.context, info);
    }
}

/// Thread-safe user registry
#[derive(Debug, Clone, Default)]
pub struct UserRegistry {
    users: Arc<DashMap<String, UserRecord>>,
}

impl UserRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register callbacks for `principal`, replacing any previous record
    pub fn register(
        &self,
        principal: impl Into<String>,
        on_create: ForwardCallback,
        on_delete: ForwardCallback,
        context: UserContext,
    ) {
        let principal = principal.into();
        tracing::debug!(%principal, "registering user");
        self.users.insert(
            principal.clone(),
            UserRecord {
                principal,
                on_create,
                on_delete,
                context,
            },
        );
    }

    /// Register a principal without callbacks
    pub fn register_principal(&self, principal: impl Into<String>) {
        let noop: ForwardCallback = Arc::new(|_, _| {});
        self.register(principal, noop.clone(), noop, Arc::new(()));
    }

    pub fn lookup(&self, principal: &str) -> Option<UserRecord> {
        self.users.get(principal).map(|r| r.value().clone())
    }

    pub fn contains(&self, principal: &str) -> bool {
        self.users.contains_key(principal)
    }

    pub fn len(&self) -> usize {
        self.users.len()
    }

    pub fn is_empty(&self) -> bool {
        self.users.is_empty()
    }
}
