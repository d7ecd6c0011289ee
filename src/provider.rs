//! Route providers
//!
//! A provider owns the routes of one discovery source. Source-specific work
//! (reading a file, listing containers, watching for changes) lives behind
//! [`ProviderImpl`]; [`Provider`] validates what the source produced and keeps
//! the live routes in step with it.

use crate::config::RouteDefaults;
use crate::error::{ErrorList, ProviderError, RouteError};
use crate::events::{Event, EventKind, EventQueue};
use crate::route::{Route, RouteConfig, RouteContext};
use crate::task::{FinishReason, Task};
use async_trait::async_trait;
use futures::future::join_all;
use parking_lot::RwLock;
use serde::Serialize;
use std::collections::{HashMap, HashSet};
use std::sync::{Arc, OnceLock};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

/// One route as produced by a source, before validation.
///
/// `Err` carries a source-level problem with that alias (e.g. a bad label).
pub type RouteCandidate = (String, Result<RouteConfig, String>);

pub type ProviderWatch = (
    mpsc::UnboundedReceiver<Event>,
    mpsc::UnboundedReceiver<ProviderError>,
);

/// A discovery source
#[async_trait]
pub trait ProviderImpl: Send + Sync {
    /// Unique name, e.g. `file:routes.toml`
    fn name(&self) -> &str;

    fn short_name(&self) -> &str;

    fn kind(&self) -> EventKind;

    /// Whether the source is reachable at all
    async fn check(&self) -> Result<(), ProviderError> {
        Ok(())
    }

    /// Read the current route set. An `Err` means the source as a whole
    /// could not be read.
    async fn load_routes(&self) -> Result<Vec<RouteCandidate>, ProviderError>;

    /// Change notifications until `cancel` fires
    fn watch(&self, cancel: CancellationToken) -> ProviderWatch;
}

pub struct Provider {
    imp: Arc<dyn ProviderImpl>,
    ctx: RouteContext,
    defaults: RouteDefaults,
    routes: Arc<RwLock<HashMap<String, Arc<Route>>>>,
    reconcile_lock: tokio::sync::Mutex<()>,
    task: OnceLock<Task>,
}

impl Provider {
    pub fn new(imp: Arc<dyn ProviderImpl>, ctx: RouteContext, defaults: RouteDefaults) -> Arc<Self> {
        Arc::new(Self {
            imp,
            ctx,
            defaults,
            routes: Arc::new(RwLock::new(HashMap::new())),
            reconcile_lock: tokio::sync::Mutex::new(()),
            task: OnceLock::new(),
        })
    }

    pub fn name(&self) -> &str {
        self.imp.name()
    }

    pub fn short_name(&self) -> &str {
        self.imp.short_name()
    }

    pub fn kind(&self) -> EventKind {
        self.imp.kind()
    }

    pub fn task(&self) -> Option<&Task> {
        self.task.get()
    }

    pub fn num_routes(&self) -> usize {
        self.routes.read().len()
    }

    pub fn route(&self, alias: &str) -> Option<Arc<Route>> {
        self.routes.read().get(alias).cloned()
    }

    /// Load and validate the source's routes.
    ///
    /// Returns every valid route plus the errors of the invalid ones; a bad
    /// alias never discards the good ones.
    pub async fn load_routes(&self) -> Result<(HashMap<String, RouteConfig>, ErrorList), ProviderError> {
        let candidates = self.imp.load_routes().await?;
        let mut routes = HashMap::new();
        let mut errors = ErrorList::new(format!("provider {}", self.name()));
        let mut seen = HashSet::new();

        for (alias, candidate) in candidates {
            let alias = alias.to_ascii_lowercase();
            if !seen.insert(alias.clone()) {
                routes.remove(&alias);
                errors.add(&alias, "alias is defined more than once");
                continue;
            }

            let mut config = match candidate {
                Ok(config) => config,
                Err(e) => {
                    errors.add(&alias, e);
                    continue;
                }
            };
            config.alias = alias.clone();
            config.provider = self.name().to_string();

            if config.exclude {
                debug!(provider = %self.name(), alias, "Route excluded");
                continue;
            }

            self.defaults.apply(&mut config);
            match config.validate() {
                Ok(()) => {
                    routes.insert(alias, config);
                }
                Err(e) => errors.add(&alias, e),
            }
        }

        Ok((routes, errors))
    }

    /// Start the provider on a `provider.<name>` child of `parent`: start
    /// every known route, then follow the source for changes.
    pub async fn start(self: &Arc<Self>, parent: &Task) {
        let task = parent.subtask(format!("provider.{}", self.name()), true);
        if self.task.set(task.clone()).is_err() {
            warn!(provider = %self.name(), "Provider already started");
            return;
        }

        if let Err(e) = self.imp.check().await {
            warn!(provider = %self.name(), error = %e, "Source not reachable");
        }

        match self.load_routes().await {
            Ok((routes, errors)) => {
                if !errors.is_empty() {
                    warn!(provider = %self.name(), "{}", errors);
                }
                let mut started = Vec::new();
                for config in routes.into_values() {
                    if let Some(route) = self.start_route(&task, config).await {
                        started.push(route);
                    }
                }
                *self.routes.write() = started
                    .iter()
                    .map(|route| (route.alias().to_string(), Arc::clone(route)))
                    .collect();
                for route in &started {
                    self.evict_when_finished(route);
                }
            }
            Err(e) => error!(provider = %self.name(), error = %e, "Failed to load routes"),
        }

        info!(provider = %self.name(), routes = self.num_routes(), "Provider started");
        self.start_watcher(&task);
    }

    fn start_watcher(self: &Arc<Self>, task: &Task) {
        let queue_task = task.subtask("event_queue", true);
        let (events, errors) = self.imp.watch(queue_task.token());

        let this = Arc::clone(self);
        let name = self.name().to_string();
        EventQueue::new(
            queue_task,
            self.defaults.event_flush_interval,
            move |batch: Vec<Event>| {
                let this = Arc::clone(&this);
                async move {
                    debug!(provider = %this.name(), events = batch.len(), "Processing events");
                    this.reload().await;
                }
            },
            move |err| warn!(provider = %name, error = %err, "Watcher error"),
        )
        .start(events, errors);
    }

    /// Drop `route` from the map once its task finishes on its own (accept
    /// failure, panic). Must be called after the route is in the map.
    fn evict_when_finished(&self, route: &Arc<Route>) {
        let Some(task) = route.task() else {
            return;
        };
        let routes = Arc::clone(&self.routes);
        let route = Arc::downgrade(route);
        let provider = self.name().to_string();
        task.on_finished("provider.evict", move || {
            let Some(route) = route.upgrade() else {
                return;
            };
            let mut routes = routes.write();
            if routes
                .get(route.alias())
                .is_some_and(|current| Arc::ptr_eq(current, &route))
            {
                routes.remove(route.alias());
                debug!(provider = %provider, alias = %route.alias(), "Finished route dropped");
            }
        });
    }

    async fn start_route(&self, task: &Task, config: RouteConfig) -> Option<Arc<Route>> {
        let route = Route::new(config);
        match route.start(task, &self.ctx).await {
            Ok(()) => Some(route),
            Err(RouteError::Cancelled) => None,
            Err(e) => {
                warn!(provider = %self.name(), alias = %route.alias(), error = %e, "Route not started");
                None
            }
        }
    }

    /// Reload the source and reconcile the live routes with it.
    ///
    /// Reloads never overlap. A source that fails to load leaves every
    /// route untouched.
    pub async fn reload(&self) {
        let _guard = self.reconcile_lock.lock().await;
        let Some(task) = self.task.get() else {
            return;
        };
        if task.is_cancelled() {
            return;
        }

        match self.load_routes().await {
            Ok((routes, errors)) => {
                if !errors.is_empty() {
                    warn!(provider = %self.name(), "{}", errors);
                }
                self.reconcile(task, routes, &errors).await;
            }
            Err(e) => {
                error!(provider = %self.name(), error = %e, "Failed to reload routes, keeping current routes");
            }
        }
    }

    async fn reconcile(&self, task: &Task, mut wanted: HashMap<String, RouteConfig>, errors: &ErrorList) {
        let current = self.routes.read().clone();
        let mut next = HashMap::new();
        let mut to_stop = Vec::new();
        let mut to_start = Vec::new();

        for (alias, route) in current {
            match wanted.remove(&alias) {
                Some(config) if &config == route.config() && !route.is_finished() => {
                    next.insert(alias, route);
                }
                Some(config) => {
                    debug!(provider = %self.name(), alias, "Route changed");
                    to_stop.push(route);
                    to_start.push(config);
                }
                None if errors.contains(&alias) => {
                    warn!(provider = %self.name(), alias, "Keeping previous route, new definition is invalid");
                    next.insert(alias, route);
                }
                None => {
                    info!(provider = %self.name(), alias, "Route removed");
                    to_stop.push(route);
                }
            }
        }
        to_start.extend(wanted.into_values());

        join_all(
            to_stop
                .iter()
                .map(|route| route.stop(FinishReason::cancelled("route removed or changed"))),
        )
        .await;

        let mut started = Vec::new();
        for config in to_start {
            if let Some(route) = self.start_route(task, config).await {
                next.insert(route.alias().to_string(), Arc::clone(&route));
                started.push(route);
            }
        }

        next.retain(|_, route| !route.is_finished());
        *self.routes.write() = next;
        for route in &started {
            self.evict_when_finished(route);
        }
    }

    pub fn snapshot(&self) -> ProviderSnapshot {
        let mut routes: Vec<String> = self.routes.read().keys().cloned().collect();
        routes.sort();
        ProviderSnapshot {
            name: self.name().to_string(),
            short_name: self.short_name().to_string(),
            kind: self.kind(),
            num_routes: routes.len(),
            routes,
        }
    }
}

/// Admin view of a provider
#[derive(Debug, Clone, Serialize)]
pub struct ProviderSnapshot {
    pub name: String,
    pub short_name: String,
    pub kind: EventKind,
    pub num_routes: usize,
    pub routes: Vec<String>,
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::events::EventAction;
    use crate::route::tests::test_context;
    use parking_lot::Mutex;
    use std::time::Duration;

    /// Source whose contents and events are driven by the test
    struct FakeSource {
        routes: Mutex<Result<Vec<RouteCandidate>, String>>,
        events: Mutex<Option<mpsc::UnboundedSender<Event>>>,
    }

    impl FakeSource {
        fn new(routes: Vec<RouteCandidate>) -> Arc<Self> {
            Arc::new(Self {
                routes: Mutex::new(Ok(routes)),
                events: Mutex::new(None),
            })
        }

        fn set(&self, routes: Vec<RouteCandidate>) {
            *self.routes.lock() = Ok(routes);
        }

        fn fail(&self, message: &str) {
            *self.routes.lock() = Err(message.to_string());
        }

        fn notify(&self) {
            if let Some(tx) = self.events.lock().as_ref() {
                let _ = tx.send(Event::file(EventAction::Modify, "routes.toml"));
            }
        }
    }

    #[async_trait]
    impl ProviderImpl for FakeSource {
        fn name(&self) -> &str {
            "fake:test"
        }

        fn short_name(&self) -> &str {
            "test"
        }

        fn kind(&self) -> EventKind {
            EventKind::File
        }

        async fn load_routes(&self) -> Result<Vec<RouteCandidate>, ProviderError> {
            self.routes.lock().clone().map_err(|message| ProviderError::Parse {
                path: "routes.toml".into(),
                message,
            })
        }

        fn watch(&self, _cancel: CancellationToken) -> ProviderWatch {
            let (tx, rx) = mpsc::unbounded_channel();
            let (_err_tx, err_rx) = mpsc::unbounded_channel();
            *self.events.lock() = Some(tx);
            (rx, err_rx)
        }
    }

    fn http(alias: &str, port: u16) -> RouteCandidate {
        let mut config = RouteConfig::http(alias, "127.0.0.1", port);
        config.healthcheck.disable = true;
        (alias.to_string(), Ok(config))
    }

    fn defaults() -> RouteDefaults {
        RouteDefaults {
            event_flush_interval: Duration::from_millis(20),
            ..Default::default()
        }
    }

    async fn eventually(mut cond: impl FnMut() -> bool) {
        for _ in 0..200 {
            if cond() {
                return;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        panic!("condition not reached");
    }

    #[tokio::test]
    async fn test_load_routes_keeps_valid_routes() {
        let source = FakeSource::new(vec![
            http("app", 3000),
            http("bad", 0),
            ("broken".into(), Err("unparsable label".into())),
            http("Dup", 3001),
            http("dup", 3002),
        ]);
        let provider = Provider::new(source, test_context(), defaults());
        let (routes, errors) = provider.load_routes().await.unwrap();

        assert_eq!(routes.len(), 1);
        let app = &routes["app"];
        assert_eq!(app.provider, "fake:test");
        assert_eq!(app.healthcheck.interval, Some(Duration::from_secs(5)));

        assert_eq!(errors.len(), 3);
        assert!(errors.contains("bad"));
        assert!(errors.contains("broken"));
        assert!(errors.contains("dup"));
    }

    #[tokio::test]
    async fn test_excluded_routes_are_skipped() {
        let (alias, config) = http("hidden", 3000);
        let mut config = config.unwrap();
        config.exclude = true;
        let source = FakeSource::new(vec![(alias, Ok(config)), http("app", 3001)]);
        let provider = Provider::new(source, test_context(), defaults());
        let (routes, errors) = provider.load_routes().await.unwrap();
        assert!(errors.is_empty());
        assert_eq!(routes.keys().collect::<Vec<_>>(), vec!["app"]);
    }

    #[tokio::test]
    async fn test_reconcile_add_remove_change() {
        let ctx = test_context();
        let source = FakeSource::new(vec![http("a", 3000), http("b", 3001)]);
        let provider = Provider::new(source.clone(), ctx.clone(), defaults());
        let root = Task::root("test");
        provider.start(&root).await;
        assert_eq!(provider.num_routes(), 2);
        assert_eq!(ctx.registry.len(), 2);

        let b_before = provider.route("b").unwrap();
        source.set(vec![http("b", 3002), http("c", 3003)]);
        source.notify();

        eventually(|| provider.route("c").is_some() && provider.route("a").is_none()).await;
        let b_after = provider.route("b").unwrap();
        assert!(!Arc::ptr_eq(&b_before, &b_after));
        assert!(b_before.is_finished());
        assert_eq!(b_after.config().port, 3002);
        assert_eq!(ctx.registry.aliases(), vec!["b", "c"]);

        root.finish(FinishReason::Done).await;
        assert!(ctx.registry.is_empty());
    }

    #[tokio::test]
    async fn test_invalid_update_keeps_previous_route() {
        let source = FakeSource::new(vec![http("a", 3000), http("b", 3001)]);
        let provider = Provider::new(source.clone(), test_context(), defaults());
        let root = Task::root("test");
        provider.start(&root).await;
        let a = provider.route("a").unwrap();

        source.set(vec![http("a", 0)]);
        provider.reload().await;

        assert!(Arc::ptr_eq(&provider.route("a").unwrap(), &a));
        assert!(provider.route("b").is_none());
        root.finish(FinishReason::Done).await;
    }

    #[tokio::test]
    async fn test_failed_load_keeps_all_routes() {
        let source = FakeSource::new(vec![http("a", 3000), http("b", 3001)]);
        let provider = Provider::new(source.clone(), test_context(), defaults());
        let root = Task::root("test");
        provider.start(&root).await;

        source.fail("unexpected token");
        provider.reload().await;
        assert_eq!(provider.num_routes(), 2);
        root.finish(FinishReason::Done).await;
    }

    #[tokio::test]
    async fn test_burst_of_events_reloads_once_per_batch() {
        let source = FakeSource::new(vec![http("a", 3000)]);
        let provider = Provider::new(source.clone(), test_context(), defaults());
        let root = Task::root("test");
        provider.start(&root).await;

        source.set(vec![http("a", 3000), http("b", 3001)]);
        for _ in 0..10 {
            source.notify();
        }
        eventually(|| provider.num_routes() == 2).await;
        root.finish(FinishReason::Done).await;
    }

    #[tokio::test]
    async fn test_collision_between_providers() {
        let ctx = test_context();
        let root = Task::root("test");
        let first = Provider::new(FakeSource::new(vec![http("app", 3000)]), ctx.clone(), defaults());
        first.start(&root).await;

        struct Other(Arc<FakeSource>);
        #[async_trait]
        impl ProviderImpl for Other {
            fn name(&self) -> &str {
                "fake:other"
            }
            fn short_name(&self) -> &str {
                "other"
            }
            fn kind(&self) -> EventKind {
                EventKind::File
            }
            async fn load_routes(&self) -> Result<Vec<RouteCandidate>, ProviderError> {
                self.0.load_routes().await
            }
            fn watch(&self, cancel: CancellationToken) -> ProviderWatch {
                self.0.watch(cancel)
            }
        }

        let second = Provider::new(
            Arc::new(Other(FakeSource::new(vec![http("app", 4000), http("web", 4001)]))),
            ctx.clone(),
            defaults(),
        );
        second.start(&root).await;

        assert_eq!(ctx.registry.get("app").unwrap().provider(), "fake:test");
        assert_eq!(second.num_routes(), 1);
        assert!(second.route("web").is_some());
        root.finish(FinishReason::Done).await;
    }

    #[tokio::test]
    async fn test_cancel_provider_finishes_routes() {
        let ctx = test_context();
        let source = FakeSource::new(vec![http("a", 3000), http("b", 3001)]);
        let provider = Provider::new(source, ctx.clone(), defaults());
        let root = Task::root("test");
        provider.start(&root).await;

        let a = provider.route("a").unwrap();
        let task = provider.task().unwrap().clone();
        task.cancel("shutdown");
        task.wait_finished().await;

        assert!(a.is_finished());
        assert!(ctx.registry.is_empty());
        assert!(matches!(task.finish_reason(), Some(FinishReason::Cancelled(_))));
        assert_eq!(provider.snapshot().num_routes, 0);
        assert!(provider.route("a").is_none());
    }

    #[tokio::test]
    async fn test_route_that_fails_on_its_own_leaves_the_map() {
        let ctx = test_context();
        let source = FakeSource::new(vec![http("a", 3000), http("b", 3001)]);
        let provider = Provider::new(source.clone(), ctx.clone(), defaults());
        let root = Task::root("test");
        provider.start(&root).await;
        assert_eq!(provider.num_routes(), 2);

        let a = provider.route("a").unwrap();
        let a_task = a.task().unwrap().clone();
        a_task.finish(FinishReason::error("accept: too many open files")).await;

        assert!(provider.route("a").is_none());
        assert!(provider.route("b").is_some());
        assert_eq!(provider.snapshot().routes, vec!["b".to_string()]);
        assert!(ctx.registry.get("a").is_none());

        // The next reload brings it back as a fresh route
        provider.reload().await;
        let restarted = provider.route("a").unwrap();
        assert!(!Arc::ptr_eq(&a, &restarted));
        assert!(!restarted.is_finished());
        assert!(ctx.registry.get("a").is_some());

        root.finish(FinishReason::Done).await;
    }
}
