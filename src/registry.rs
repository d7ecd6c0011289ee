//! Live route set, keyed by alias
//!
//! One map-level lock guards every insert and removal, which is what makes
//! "at most one live route per alias" hold across providers.

use crate::health::HealthSnapshot;
use crate::idlewatcher::IdleWatcher;
use crate::route::{Route, RouteSnapshot, Scheme};
use parking_lot::RwLock;
use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;

#[derive(Default)]
pub struct RouteRegistry {
    routes: RwLock<HashMap<String, Arc<Route>>>,
}

impl RouteRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Reserve `route.alias()`. First writer wins; on collision the route
    /// already holding the alias is returned.
    pub fn register(&self, route: Arc<Route>) -> Result<(), Arc<Route>> {
        let mut routes = self.routes.write();
        if let Some(existing) = routes.get(route.alias()) {
            return Err(Arc::clone(existing));
        }
        routes.insert(route.alias().to_string(), route);
        Ok(())
    }

    /// Remove the entry only if it is this very route, so a stale teardown
    /// never evicts its replacement.
    pub fn deregister(&self, route: &Arc<Route>) -> bool {
        let mut routes = self.routes.write();
        match routes.get(route.alias()) {
            Some(current) if Arc::ptr_eq(current, route) => {
                routes.remove(route.alias());
                true
            }
            _ => false,
        }
    }

    pub fn get(&self, alias: &str) -> Option<Arc<Route>> {
        self.routes.read().get(alias).cloned()
    }

    /// Resolve an HTTP route from a `Host` header value.
    ///
    /// The port is ignored. An exact alias match wins, then the first DNS
    /// label (`app.example.com` serves alias `app`).
    pub fn find_http(&self, host: &str) -> Option<Arc<Route>> {
        let host = strip_port(host).to_ascii_lowercase();
        let routes = self.routes.read();
        let http = |alias: &str| {
            routes
                .get(alias)
                .filter(|r| r.scheme() == Scheme::Http)
                .cloned()
        };
        http(&host).or_else(|| {
            let (label, _) = host.split_once('.')?;
            http(label)
        })
    }

    /// Health of every route, keyed by alias
    pub fn health_map(&self) -> BTreeMap<String, HealthSnapshot> {
        self.routes
            .read()
            .iter()
            .map(|(alias, route)| (alias.clone(), route.snapshot().health))
            .collect()
    }

    /// Snapshots of every route, sorted by alias
    pub fn snapshots(&self) -> Vec<RouteSnapshot> {
        let mut snapshots: Vec<_> = self.routes.read().values().map(|r| r.snapshot()).collect();
        snapshots.sort_by(|a, b| a.alias.cmp(&b.alias));
        snapshots
    }

    pub fn idle_watchers(&self) -> Vec<Arc<IdleWatcher>> {
        self.routes
            .read()
            .values()
            .filter_map(|r| r.idle_watcher().cloned())
            .collect()
    }

    pub fn aliases(&self) -> Vec<String> {
        let mut aliases: Vec<_> = self.routes.read().keys().cloned().collect();
        aliases.sort();
        aliases
    }

    pub fn len(&self) -> usize {
        self.routes.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.routes.read().is_empty()
    }

    /// Drop every entry. Used once the task tree has shut down.
    pub fn clear(&self) {
        self.routes.write().clear();
    }
}

fn strip_port(host: &str) -> &str {
    if let Some(rest) = host.strip_prefix('[') {
        // [::1]:8080
        return rest.split(']').next().unwrap_or(rest);
    }
    match host.rsplit_once(':') {
        Some((name, port)) if !name.contains(':') && port.chars().all(|c| c.is_ascii_digit()) => name,
        _ => host,
    }
}
