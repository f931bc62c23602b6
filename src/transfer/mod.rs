//! Transfer engine: one async task per in-flight request, streaming decoded
//! bytes into the shared [`ObjectStore`](crate::store::ObjectStore).
//!
//! Fetches for a key that is already being transferred attach to the running
//! task instead of opening a second connection. The task is aborted once the
//! last attached [`Connection`] cancels or is dropped.

use std::collections::HashMap;
use std::num::NonZeroUsize;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use bytes::Bytes;
use http::Method;
use parking_lot::Mutex;
use tokio::sync::watch;
use tokio::task::AbortHandle;
use tracing::debug;

mod body;
mod codec;
mod collab;
mod connect;
mod driver;
mod error;
mod pool;
mod request;
mod response;
mod state;

pub use body::{BodyDecoder, BodyPlan};
pub use codec::{HeaderLine, ProtocolError, ResponseHead};
pub use collab::{
    CookieJar, CredentialStore, MemoryCookieJar, MemoryCredentials, Resolver, SystemResolver,
};
pub use error::{FetchError, FetchErrorKind};
pub use request::{PostBody, RequestProfile};
pub use response::resolve_location;
pub use state::{FetchOutcome, FetchState};

use crate::settings::Settings;
use crate::store::{CacheKey, PinGuard, SharedStore, StatsQuery, StoreStats, normalize_url};

use self::pool::IdlePool;

/// How a fetch may use what is already cached.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, clap::ValueEnum)]
pub enum CacheDirective {
    /// Serve a complete, fresh entry without touching the network.
    #[default]
    UseCache,
    /// Ask the server whether the cached copy is still current.
    Revalidate,
    /// Fetch from scratch, bypassing intermediate caches.
    ForceReload,
}

impl CacheDirective {
    pub fn as_str(&self) -> &'static str {
        match self {
            CacheDirective::UseCache => "use-cache",
            CacheDirective::Revalidate => "revalidate",
            CacheDirective::ForceReload => "force-reload",
        }
    }
}

/// Ordered from most to least urgent.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default)]
pub enum Priority {
    #[default]
    Main,
    Frame,
    NeedImage,
    Image,
    Preload,
}

impl Priority {
    pub fn as_str(&self) -> &'static str {
        match self {
            Priority::Main => "main",
            Priority::Frame => "frame",
            Priority::NeedImage => "need-image",
            Priority::Image => "image",
            Priority::Preload => "preload",
        }
    }
}

#[derive(Debug, Clone)]
pub struct FetchRequest {
    pub url: String,
    pub body: Option<PostBody>,
    pub priority: Priority,
    pub directive: CacheDirective,
    /// Page the request originates from, for the `real` referer policy.
    pub referer: Option<String>,
}

impl FetchRequest {
    pub fn get(url: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            body: None,
            priority: Priority::Main,
            directive: CacheDirective::UseCache,
            referer: None,
        }
    }

    pub fn post(url: impl Into<String>, body: PostBody) -> Self {
        Self {
            body: Some(body),
            ..Self::get(url)
        }
    }

    pub fn priority(mut self, priority: Priority) -> Self {
        self.priority = priority;
        self
    }

    pub fn directive(mut self, directive: CacheDirective) -> Self {
        self.directive = directive;
        self
    }

    pub fn referer(mut self, referer: impl Into<String>) -> Self {
        self.referer = Some(referer.into());
        self
    }

    pub fn method(&self) -> Method {
        if self.body.is_some() {
            Method::POST
        } else {
            Method::GET
        }
    }
}

#[derive(Debug, Clone)]
pub struct EngineConfig {
    pub request: RequestProfile,
    pub connect_timeout: Duration,
    pub io_timeout: Duration,
    pub max_tries: u32,
    pub max_header_size: usize,
    pub keepalive_capacity: NonZeroUsize,
    pub keepalive_timeout: Duration,
}

impl EngineConfig {
    pub fn from_settings(settings: &Settings) -> Self {
        Self {
            request: settings.request_profile(),
            connect_timeout: settings.connect_timeout(),
            io_timeout: settings.io_timeout(),
            max_tries: settings.max_tries.max(1),
            max_header_size: settings.max_header_size,
            keepalive_capacity: NonZeroUsize::new(settings.keepalive_pool_capacity)
                .unwrap_or(NonZeroUsize::MIN),
            keepalive_timeout: settings.keepalive_timeout(),
        }
    }
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self::from_settings(&Settings::default())
    }
}

struct Inflight {
    id: u64,
    priority: Priority,
    state: watch::Receiver<FetchState>,
    abort: AbortHandle,
    attached: usize,
}

pub(crate) struct EngineInner {
    config: EngineConfig,
    store: SharedStore,
    pool: Mutex<IdlePool>,
    resolver: Arc<dyn Resolver>,
    credentials: Arc<dyn CredentialStore>,
    cookies: Arc<dyn CookieJar>,
    registry: Mutex<HashMap<String, Inflight>>,
    next_id: AtomicU64,
}

impl EngineInner {
    /// Detaches one handle; the last one out aborts the task.
    fn detach(&self, key: &str, id: u64) {
        let abort = {
            let mut registry = self.registry.lock();
            let Some(inflight) = registry.get_mut(key).filter(|inflight| inflight.id == id) else {
                return;
            };
            inflight.attached = inflight.attached.saturating_sub(1);
            if inflight.attached > 0 {
                return;
            }
            registry.remove(key).map(|inflight| inflight.abort)
        };
        if let Some(abort) = abort {
            debug!(key, "last handle detached; aborting transfer");
            abort.abort();
        }
    }
}

/// Removes the registry slot of a transfer when its task ends or is aborted.
struct RegistrySlot {
    inner: Arc<EngineInner>,
    key: String,
    id: u64,
}

impl Drop for RegistrySlot {
    fn drop(&mut self) {
        let mut registry = self.inner.registry.lock();
        if registry
            .get(&self.key)
            .is_some_and(|inflight| inflight.id == self.id)
        {
            registry.remove(&self.key);
        }
    }
}

pub struct EngineBuilder {
    config: EngineConfig,
    store: SharedStore,
    resolver: Option<Arc<dyn Resolver>>,
    credentials: Option<Arc<dyn CredentialStore>>,
    cookies: Option<Arc<dyn CookieJar>>,
}

impl EngineBuilder {
    pub fn resolver(mut self, resolver: Arc<dyn Resolver>) -> Self {
        self.resolver = Some(resolver);
        self
    }

    pub fn credentials(mut self, credentials: Arc<dyn CredentialStore>) -> Self {
        self.credentials = Some(credentials);
        self
    }

    pub fn cookies(mut self, cookies: Arc<dyn CookieJar>) -> Self {
        self.cookies = Some(cookies);
        self
    }

    pub fn build(self) -> Engine {
        let resolver = self
            .resolver
            .unwrap_or_else(|| Arc::new(SystemResolver::new(self.config.connect_timeout)));
        let pool = IdlePool::new(
            self.config.keepalive_capacity,
            self.config.keepalive_timeout,
        );
        Engine {
            inner: Arc::new(EngineInner {
                config: self.config,
                store: self.store,
                pool: Mutex::new(pool),
                resolver,
                credentials: self
                    .credentials
                    .unwrap_or_else(|| Arc::new(MemoryCredentials::new())),
                cookies: self
                    .cookies
                    .unwrap_or_else(|| Arc::new(MemoryCookieJar::new())),
                registry: Mutex::new(HashMap::new()),
                next_id: AtomicU64::new(1),
            }),
        }
    }
}

#[derive(Clone)]
pub struct Engine {
    inner: Arc<EngineInner>,
}

impl Engine {
    pub fn new(config: EngineConfig, store: SharedStore) -> Self {
        Self::builder(config, store).build()
    }

    pub fn builder(config: EngineConfig, store: SharedStore) -> EngineBuilder {
        EngineBuilder {
            config,
            store,
            resolver: None,
            credentials: None,
            cookies: None,
        }
    }

    pub fn config(&self) -> &EngineConfig {
        &self.inner.config
    }

    pub fn store(&self) -> &SharedStore {
        &self.inner.store
    }

    pub fn fetch(
        &self,
        url: &str,
        priority: Priority,
        directive: CacheDirective,
    ) -> Result<Connection, FetchError> {
        self.submit(
            FetchRequest::get(url)
                .priority(priority)
                .directive(directive),
        )
    }

    /// Starts a transfer, or attaches to the one already running for the
    /// same cache key. Must be called from within a tokio runtime.
    pub fn submit(&self, request: FetchRequest) -> Result<Connection, FetchError> {
        let uri = normalize_url(&request.url)
            .map_err(|err| FetchError::unsupported(format!("{err:#}")))?;
        let key = match &request.body {
            Some(body) => CacheKey::for_post(&request.url, &body.data),
            None => CacheKey::for_url(&request.url),
        }
        .map_err(|err| FetchError::unsupported(format!("{err:#}")))?
        .into_string();

        let mut registry = self.inner.registry.lock();
        if let Some(inflight) = registry.get_mut(&key) {
            inflight.attached += 1;
            inflight.priority = inflight.priority.min(request.priority);
            debug!(key = %key, attached = inflight.attached, "attached to in-flight transfer");
            return Ok(Connection {
                inner: self.inner.clone(),
                key,
                id: inflight.id,
                state: inflight.state.clone(),
                detached: false,
            });
        }

        let id = self.inner.next_id.fetch_add(1, Ordering::Relaxed);
        let (state_tx, state_rx) = watch::channel(FetchState::Queued);
        let job = driver::Job::new(key.clone(), uri, request);
        let priority = job.priority();
        let slot = RegistrySlot {
            inner: self.inner.clone(),
            key: key.clone(),
            id,
        };
        let inner = self.inner.clone();
        let handle = tokio::spawn(async move {
            let _slot = slot;
            driver::run(inner, job, state_tx).await;
        });
        registry.insert(
            key.clone(),
            Inflight {
                id,
                priority,
                state: state_rx.clone(),
                abort: handle.abort_handle(),
                attached: 1,
            },
        );
        debug!(key = %key, priority = priority.as_str(), "transfer queued");
        Ok(Connection {
            inner: self.inner.clone(),
            key,
            id,
            state: state_rx,
            detached: false,
        })
    }

    /// Returns the contiguous bytes cached for `key` from offset 0.
    pub fn read_available(&self, key: &str) -> Option<(Bytes, std::ops::Range<u64>)> {
        self.inner.store.lock().read_available(key)
    }

    pub fn pin(&self, key: &str) -> Option<PinGuard> {
        self.inner.store.lock().pin(key)
    }

    pub fn stat(&self, query: StatsQuery) -> u64 {
        self.inner.store.lock().stat(query)
    }

    pub fn stats(&self) -> StoreStats {
        self.inner.store.lock().stats()
    }

    pub fn in_flight(&self) -> usize {
        self.inner.registry.lock().len()
    }

    /// Cancels every preload transfer regardless of attached handles.
    pub fn abort_background(&self) -> usize {
        let aborted: Vec<(String, AbortHandle)> = {
            let mut registry = self.inner.registry.lock();
            let keys: Vec<String> = registry
                .iter()
                .filter(|(_, inflight)| inflight.priority == Priority::Preload)
                .map(|(key, _)| key.clone())
                .collect();
            keys.into_iter()
                .filter_map(|key| registry.remove(&key).map(|inflight| (key, inflight.abort)))
                .collect()
        };
        for (key, abort) in &aborted {
            debug!(key = %key, "aborting background transfer");
            abort.abort();
        }
        aborted.len()
    }

    /// Aborts everything in flight and closes idle sockets.
    pub async fn shutdown(&self) {
        let aborts: Vec<AbortHandle> = self
            .inner
            .registry
            .lock()
            .drain()
            .map(|(_, inflight)| inflight.abort)
            .collect();
        for abort in aborts {
            abort.abort();
        }
        let idle = self.inner.pool.lock().drain();
        pool::shutdown_all(idle, Duration::from_secs(1)).await;
    }
}

/// A caller's handle on a transfer.
pub struct Connection {
    inner: Arc<EngineInner>,
    key: String,
    id: u64,
    state: watch::Receiver<FetchState>,
    detached: bool,
}

impl Connection {
    pub fn key(&self) -> &str {
        &self.key
    }

    pub fn state(&self) -> FetchState {
        self.state.borrow().clone()
    }

    /// Waits for the transfer to finish. A transfer torn down before it
    /// published a result reports [`FetchErrorKind::Cancelled`].
    pub async fn wait(&mut self) -> Result<FetchOutcome, FetchError> {
        loop {
            let finished = match &*self.state.borrow_and_update() {
                FetchState::Finished(result) => Some(result.clone()),
                _ => None,
            };
            if let Some(result) = finished {
                return result;
            }
            if self.state.changed().await.is_err() {
                return match &*self.state.borrow() {
                    FetchState::Finished(result) => result.clone(),
                    _ => Err(FetchError::cancelled()),
                };
            }
        }
    }

    /// Detaches from the transfer, aborting it if nobody else is attached.
    pub fn cancel(mut self) {
        self.detach();
    }

    fn detach(&mut self) {
        if !self.detached {
            self.detached = true;
            self.inner.detach(&self.key, self.id);
        }
    }
}

impl Drop for Connection {
    fn drop(&mut self) {
        self.detach();
    }
}

impl std::fmt::Debug for Connection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Connection")
            .field("key", &self.key)
            .field("id", &self.id)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::ObjectStore;

    fn engine() -> Engine {
        Engine::new(
            EngineConfig::default(),
            SharedStore::new(ObjectStore::new(1 << 20, 75)),
        )
    }

    #[test]
    fn priorities_order_from_most_urgent() {
        assert!(Priority::Main < Priority::Frame);
        assert!(Priority::Image < Priority::Preload);
        assert_eq!(Priority::default(), Priority::Main);
    }

    #[test]
    fn post_requests_use_post_method() {
        let request = FetchRequest::post("http://example.com/form", PostBody::form("a=1"));
        assert_eq!(request.method(), Method::POST);
        assert_eq!(FetchRequest::get("http://example.com/").method(), Method::GET);
    }

    #[tokio::test]
    async fn invalid_url_is_rejected_up_front() {
        let err = engine()
            .fetch("not a url", Priority::Main, CacheDirective::UseCache)
            .expect_err("invalid URL");
        assert_eq!(err.kind(), FetchErrorKind::Unsupported);
    }

    #[tokio::test]
    async fn https_is_unsupported() -> anyhow::Result<()> {
        let engine = engine();
        let mut conn = engine.fetch(
            "https://example.com/",
            Priority::Main,
            CacheDirective::UseCache,
        )?;
        let err = conn.wait().await.expect_err("https");
        assert_eq!(err.kind(), FetchErrorKind::Unsupported);
        Ok(())
    }

    #[tokio::test]
    async fn same_key_attaches_to_running_transfer() -> anyhow::Result<()> {
        let engine = engine();
        let first = engine.fetch(
            "http://127.0.0.1:9/slow",
            Priority::Preload,
            CacheDirective::UseCache,
        )?;
        let second = engine.fetch(
            "http://127.0.0.1:9/slow#frag",
            Priority::Image,
            CacheDirective::UseCache,
        )?;
        assert_eq!(first.key(), second.key());
        assert_eq!(engine.in_flight(), 1);

        // The second handle raised the priority above preload.
        assert_eq!(engine.abort_background(), 0);
        first.cancel();
        assert_eq!(engine.in_flight(), 1);
        second.cancel();
        assert_eq!(engine.in_flight(), 0);
        Ok(())
    }

    #[tokio::test]
    async fn abort_background_cancels_preloads() -> anyhow::Result<()> {
        let engine = engine();
        let mut conn = engine.fetch(
            "http://127.0.0.1:9/preload",
            Priority::Preload,
            CacheDirective::UseCache,
        )?;
        assert_eq!(engine.abort_background(), 1);
        let err = conn.wait().await.expect_err("aborted");
        assert_eq!(err.kind(), FetchErrorKind::Cancelled);
        Ok(())
    }
}
