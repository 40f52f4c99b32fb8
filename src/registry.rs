use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use tokio::sync::{Mutex, RwLock};
use tokio_util::sync::CancellationToken;

use crate::upstream::UpstreamSpec;

/// Concurrent username -> upstream route table.
///
/// Routing lookups vastly outnumber admin writes, so reads go through a
/// read-write lock. Entries are stored behind `Arc` and replaced wholesale;
/// a lookup racing an update observes either the old or the new value.
pub struct RouteTable {
    routes: RwLock<HashMap<String, Arc<UpstreamSpec>>>,
    fallback: Arc<UpstreamSpec>,
}

impl RouteTable {
    pub fn new() -> Self {
        Self {
            routes: RwLock::new(HashMap::new()),
            fallback: Arc::new(UpstreamSpec::direct()),
        }
    }

    /// Replace the stored route for a user. Last write wins.
    pub async fn set(&self, user: &str, spec: UpstreamSpec) {
        let mut routes = self.routes.write().await;
        routes.insert(user.to_string(), Arc::new(spec));
    }

    /// Current route for a user. Users with no stored entry go direct.
    pub async fn get(&self, user: &str) -> Arc<UpstreamSpec> {
        let routes = self.routes.read().await;
        routes
            .get(user)
            .cloned()
            .unwrap_or_else(|| self.fallback.clone())
    }
}

impl Default for RouteTable {
    fn default() -> Self {
        Self::new()
    }
}

/// Handle to one registered tunnel.
///
/// The token is watched by the tunnel's relay loop; cancelling it is the
/// force-close. The id deregisters exactly this tunnel when it ends on its
/// own, regardless of what invalidation did in between.
pub struct TunnelHandle {
    pub id: u64,
    pub token: CancellationToken,
}

/// Tracks each user's live tunnels so a routing update can shut them down.
///
/// Both registration and invalidation mutate the map, so access is exclusive.
/// A user's empty set is pruned as soon as its last tunnel goes away.
pub struct TunnelRegistry {
    tunnels: Mutex<HashMap<String, HashMap<u64, CancellationToken>>>,
    next_id: AtomicU64,
}

impl TunnelRegistry {
    pub fn new() -> Self {
        Self {
            tunnels: Mutex::new(HashMap::new()),
            next_id: AtomicU64::new(1),
        }
    }

    /// Register a new tunnel for a user and hand back its cancellation handle.
    pub async fn register(&self, user: &str) -> TunnelHandle {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let token = CancellationToken::new();

        let mut tunnels = self.tunnels.lock().await;
        tunnels
            .entry(user.to_string())
            .or_default()
            .insert(id, token.clone());

        TunnelHandle { id, token }
    }

    /// Remove one tunnel when it ends naturally. A tunnel already removed by
    /// invalidation is a no-op.
    pub async fn deregister(&self, user: &str, id: u64) {
        let mut tunnels = self.tunnels.lock().await;
        if let Some(set) = tunnels.get_mut(user) {
            set.remove(&id);
            if set.is_empty() {
                tunnels.remove(user);
            }
        }
    }

    /// Take every tunnel currently registered for a user and force-close it.
    /// Returns how many tunnels were closed.
    pub async fn invalidate(&self, user: &str) -> usize {
        let taken = {
            let mut tunnels = self.tunnels.lock().await;
            tunnels.remove(user)
        };

        match taken {
            Some(set) => {
                let count = set.len();
                for token in set.into_values() {
                    token.cancel();
                }
                count
            }
            None => 0,
        }
    }

    /// Number of live tunnels across all users
    pub async fn active_count(&self) -> usize {
        let tunnels = self.tunnels.lock().await;
        tunnels.values().map(HashMap::len).sum()
    }
}

impl Default for TunnelRegistry {
    fn default() -> Self {
        Self::new()
    }
}

/// Shared gateway state: the route table plus live tunnel tracking.
///
/// The two registries share no lock. A routing update writes the route table
/// first and drains the tunnel registry second, while a new tunnel registers
/// itself before its routing lookup; either interleaving leaves the tunnel
/// on the new route or cancelled.
pub struct AppState {
    pub routes: RouteTable,
    pub tunnels: TunnelRegistry,
}

impl AppState {
    pub fn new() -> Self {
        Self {
            routes: RouteTable::new(),
            tunnels: TunnelRegistry::new(),
        }
    }
}

impl Default for AppState {
    fn default() -> Self {
        Self::new()
    }
}
