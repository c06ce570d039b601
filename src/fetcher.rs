//! Cached, deduplicated fetching of ERDDAP JSON responses.
//!
//! [Fetcher] combines a [Transport] with a [ResponseCache]. At most one transport call is
//! outstanding per URL: callers arriving while a request is in flight receive a clone of the
//! same [SharedFetch], and the in-flight entry is removed exactly once when that request
//! settles, whatever the outcome.

use crate::error::ErddapError;
use crate::metrics::{CACHE_LOOKUPS, CACHE_WRITE_FAILURES};
use crate::response_cache::{CacheEntry, Clock, MemoryResponseCache, ResponseCache, SystemClock};
use crate::transport::{HttpTransport, Transport};

use futures::future::{BoxFuture, FutureExt, Shared};
use hashbrown::HashMap;
use serde_json::Value;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

/// A pending fetch that any number of callers may await.
pub type SharedFetch = Shared<BoxFuture<'static, Result<Value, ErddapError>>>;

/// Default time a cached response stays fresh.
pub const DEFAULT_TTL: Duration = Duration::from_secs(600);

/// Default transport timeout.
pub const DEFAULT_TIMEOUT: Duration = Duration::from_secs(30);

/// Fetcher configuration.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct FetcherSettings {
    /// Age below which a cached response is used instead of the network
    pub ttl: Duration,
    /// Transport timeout
    pub timeout: Duration,
}

impl Default for FetcherSettings {
    fn default() -> Self {
        FetcherSettings {
            ttl: DEFAULT_TTL,
            timeout: DEFAULT_TIMEOUT,
        }
    }
}

struct InFlight {
    generation: u64,
    fetch: SharedFetch,
}

type InFlightMap = Arc<Mutex<HashMap<String, InFlight>>>;

/// Response cache plus request deduplication in front of a transport.
pub struct Fetcher {
    transport: Arc<dyn Transport>,
    cache: Arc<dyn ResponseCache>,
    clock: Arc<dyn Clock>,
    settings: FetcherSettings,
    in_flight: InFlightMap,
    generation: AtomicU64,
}

impl Fetcher {
    /// Create a fetcher from its collaborators.
    ///
    /// # Arguments
    ///
    /// * `transport`: Performs the network requests
    /// * `cache`: Stores successful responses
    /// * `clock`: Time source for cache freshness
    /// * `settings`: Default TTL and timeout
    pub fn new(
        transport: Arc<dyn Transport>,
        cache: Arc<dyn ResponseCache>,
        clock: Arc<dyn Clock>,
        settings: FetcherSettings,
    ) -> Self {
        Fetcher {
            transport,
            cache,
            clock,
            settings,
            in_flight: Arc::new(Mutex::new(HashMap::new())),
            generation: AtomicU64::new(0),
        }
    }

    /// A fetcher using HTTP and an in-memory cache.
    pub fn http(settings: FetcherSettings) -> Self {
        Self::new(
            Arc::new(HttpTransport::new()),
            Arc::new(MemoryResponseCache::new()),
            Arc::new(SystemClock),
            settings,
        )
    }

    pub fn settings(&self) -> &FetcherSettings {
        &self.settings
    }

    /// Number of URLs with a request in flight.
    pub fn in_flight(&self) -> usize {
        self.in_flight.lock().map(|m| m.len()).unwrap_or_default()
    }

    /// Fetch a URL with the default TTL and timeout.
    pub async fn fetch_json(&self, url: &str) -> Result<Value, ErddapError> {
        self.get_or_fetch(url, self.settings.ttl).await
    }

    /// Fetch a URL, answering from the cache when an entry younger than `ttl` exists.
    pub async fn get_or_fetch(&self, url: &str, ttl: Duration) -> Result<Value, ErddapError> {
        self.request(url, ttl, self.settings.timeout).await
    }

    /// Start (or join) the request for a URL.
    ///
    /// The returned future is already running; dropping it does not cancel the request.
    ///
    /// # Arguments
    ///
    /// * `url`: Exact URL, including the query string
    /// * `ttl`: Maximum age of a usable cache entry
    /// * `timeout`: Transport timeout, if a transport call is needed
    pub fn request(&self, url: &str, ttl: Duration, timeout: Duration) -> SharedFetch {
        let mut in_flight = match self.in_flight.lock() {
            Ok(map) => map,
            Err(poisoned) => poisoned.into_inner(),
        };
        if let Some(pending) = in_flight.get(url) {
            tracing::trace!(url, "joining in-flight request");
            return pending.fetch.clone();
        }

        let generation = self.generation.fetch_add(1, Ordering::Relaxed);
        let task = tokio::spawn(resolve_and_release(
            self.transport.clone(),
            self.cache.clone(),
            self.clock.clone(),
            self.in_flight.clone(),
            url.to_string(),
            generation,
            ttl,
            timeout,
        ));
        let task_url = url.to_string();
        let fetch = async move {
            match task.await {
                Ok(result) => result,
                Err(err) => Err(ErddapError::Network {
                    url: task_url,
                    error: format!("fetch task failed: {}", err),
                }),
            }
        }
        .boxed()
        .shared();
        // The lock is still held, so the task cannot release its entry before it exists.
        in_flight.insert(
            url.to_string(),
            InFlight {
                generation,
                fetch: fetch.clone(),
            },
        );
        fetch
    }
}

#[allow(clippy::too_many_arguments)]
async fn resolve_and_release(
    transport: Arc<dyn Transport>,
    cache: Arc<dyn ResponseCache>,
    clock: Arc<dyn Clock>,
    in_flight: InFlightMap,
    url: String,
    generation: u64,
    ttl: Duration,
    timeout: Duration,
) -> Result<Value, ErddapError> {
    let result = resolve(&*transport, &*cache, &*clock, &url, ttl, timeout).await;
    let mut map = match in_flight.lock() {
        Ok(map) => map,
        Err(poisoned) => poisoned.into_inner(),
    };
    // A newer request for the URL may already own the slot.
    if map.get(&url).map(|f| f.generation) == Some(generation) {
        map.remove(&url);
    }
    result
}

#[tracing::instrument(level = "DEBUG", skip(transport, cache, clock, ttl, timeout))]
async fn resolve(
    transport: &dyn Transport,
    cache: &dyn ResponseCache,
    clock: &dyn Clock,
    url: &str,
    ttl: Duration,
    timeout: Duration,
) -> Result<Value, ErddapError> {
    match cache.get(url) {
        Ok(Some(entry)) if entry.is_fresh(clock.now_millis(), ttl) => {
            CACHE_LOOKUPS.with_label_values(&["hit"]).inc();
            return Ok(entry.payload);
        }
        Ok(Some(_)) => CACHE_LOOKUPS.with_label_values(&["stale"]).inc(),
        Ok(None) => CACHE_LOOKUPS.with_label_values(&["miss"]).inc(),
        Err(err) => {
            CACHE_LOOKUPS.with_label_values(&["error"]).inc();
            tracing::warn!("cache problem, fetching {}: {}", url, err);
        }
    }

    let payload = transport.fetch(url, timeout).await?;

    let entry = CacheEntry {
        url: url.to_string(),
        timestamp: clock.now_millis(),
        payload: payload.clone(),
    };
    if let Err(err) = cache.put(entry) {
        CACHE_WRITE_FAILURES.inc();
        tracing::warn!("failed to cache response for {}: {}", url, err);
    }
    Ok(payload)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_utils::{FailingCache, ManualClock, MockTransport};

    use serde_json::json;

    fn fetcher(transport: &Arc<MockTransport>, clock: &Arc<ManualClock>) -> Fetcher {
        Fetcher::new(
            transport.clone(),
            Arc::new(MemoryResponseCache::new()),
            clock.clone(),
            FetcherSettings::default(),
        )
    }

    #[tokio::test(start_paused = true)]
    async fn concurrent_requests_share_one_transport_call() {
        let transport = Arc::new(MockTransport::new().with_delay(Duration::from_millis(50)));
        transport.respond("http://a/x.json", json!({"n": 1}));
        let fetcher = fetcher(&transport, &Arc::new(ManualClock::new(0)));

        let first = fetcher.request("http://a/x.json", DEFAULT_TTL, DEFAULT_TIMEOUT);
        let second = fetcher.request("http://a/x.json", DEFAULT_TTL, DEFAULT_TIMEOUT);
        assert!(first.ptr_eq(&second));
        let rest = futures::future::join_all(
            (0..8).map(|_| fetcher.get_or_fetch("http://a/x.json", DEFAULT_TTL)),
        );
        let (a, b, rest) = tokio::join!(first, second, rest);

        assert_eq!(1, transport.calls_to("http://a/x.json"));
        assert_eq!(json!({"n": 1}), a.unwrap());
        assert_eq!(json!({"n": 1}), b.unwrap());
        assert!(rest.into_iter().all(|r| r.unwrap() == json!({"n": 1})));
        assert_eq!(0, fetcher.in_flight());
    }

    #[tokio::test(start_paused = true)]
    async fn request_while_settling_starts_new_generation() {
        let transport = Arc::new(MockTransport::new().with_delay(Duration::from_millis(50)));
        transport.respond("http://a/x.json", json!(1));
        let fetcher = fetcher(&transport, &Arc::new(ManualClock::new(0)));

        let first = fetcher.request("http://a/x.json", DEFAULT_TTL, DEFAULT_TIMEOUT);
        // The transport call is over and its entry released, but nobody has awaited it yet.
        tokio::time::sleep(Duration::from_millis(60)).await;
        assert_eq!(0, fetcher.in_flight());

        transport.respond("http://a/x.json", json!(2));
        let second = fetcher.request("http://a/x.json", Duration::ZERO, DEFAULT_TIMEOUT);
        assert!(!first.ptr_eq(&second));
        assert_eq!(1, fetcher.in_flight());

        assert_eq!(json!(1), first.await.unwrap());
        assert_eq!(1, fetcher.in_flight());
        assert_eq!(json!(2), second.await.unwrap());
        assert_eq!(0, fetcher.in_flight());
        assert_eq!(2, transport.calls_to("http://a/x.json"));
    }

    #[tokio::test]
    async fn release_keeps_newer_entry() {
        let transport = Arc::new(MockTransport::new());
        transport.respond("http://a/x.json", json!(1));
        let in_flight: InFlightMap = Arc::new(Mutex::new(HashMap::new()));
        let newer: SharedFetch = futures::future::ready(Ok(json!(2))).boxed().shared();
        in_flight.lock().unwrap().insert(
            "http://a/x.json".to_string(),
            InFlight {
                generation: 7,
                fetch: newer.clone(),
            },
        );

        let result = resolve_and_release(
            transport.clone(),
            Arc::new(MemoryResponseCache::new()),
            Arc::new(ManualClock::new(0)),
            in_flight.clone(),
            "http://a/x.json".to_string(),
            6,
            DEFAULT_TTL,
            DEFAULT_TIMEOUT,
        )
        .await;
        assert_eq!(json!(1), result.unwrap());
        let map = in_flight.lock().unwrap();
        assert!(map["http://a/x.json"].fetch.ptr_eq(&newer));
        assert_eq!(1, transport.calls_to("http://a/x.json"));
    }

    #[tokio::test]
    async fn cache_freshness() {
        let transport = Arc::new(MockTransport::new());
        transport.respond("http://a/x.json", json!([1]));
        let clock = Arc::new(ManualClock::new(1_000_000));
        let fetcher = fetcher(&transport, &clock);

        fetcher.fetch_json("http://a/x.json").await.unwrap();
        assert_eq!(1, transport.calls_to("http://a/x.json"));

        clock.advance(Duration::from_secs(599));
        fetcher.fetch_json("http://a/x.json").await.unwrap();
        assert_eq!(1, transport.calls_to("http://a/x.json"));

        clock.advance(Duration::from_secs(2));
        fetcher.fetch_json("http://a/x.json").await.unwrap();
        assert_eq!(2, transport.calls_to("http://a/x.json"));
    }

    #[tokio::test]
    async fn failure_rejects_and_clears_in_flight() {
        let transport = Arc::new(MockTransport::new());
        let fetcher = fetcher(&transport, &Arc::new(ManualClock::new(0)));

        let err = fetcher.fetch_json("http://a/missing.json").await.unwrap_err();
        assert!(matches!(err, ErddapError::Network { .. }));
        assert_eq!(0, fetcher.in_flight());

        // A later call re-attempts the transport.
        transport.respond("http://a/missing.json", json!(true));
        assert_eq!(json!(true), fetcher.fetch_json("http://a/missing.json").await.unwrap());
        assert_eq!(2, transport.calls_to("http://a/missing.json"));
    }

    #[tokio::test(start_paused = true)]
    async fn timeout_clears_in_flight() {
        let transport = Arc::new(MockTransport::new().with_delay(Duration::from_secs(60)));
        transport.respond("http://a/slow.json", json!(1));
        let fetcher = fetcher(&transport, &Arc::new(ManualClock::new(0)));

        let err = fetcher
            .request("http://a/slow.json", DEFAULT_TTL, Duration::from_secs(1))
            .await
            .unwrap_err();
        assert_eq!(
            ErddapError::Timeout {
                url: "http://a/slow.json".to_string()
            },
            err
        );
        assert_eq!(0, fetcher.in_flight());
    }

    #[tokio::test]
    async fn cache_errors_are_not_fatal() {
        let transport = Arc::new(MockTransport::new());
        transport.respond("http://a/x.json", json!({"ok": true}));
        let fetcher = Fetcher::new(
            transport.clone(),
            Arc::new(FailingCache),
            Arc::new(ManualClock::new(0)),
            FetcherSettings::default(),
        );

        assert_eq!(json!({"ok": true}), fetcher.fetch_json("http://a/x.json").await.unwrap());
        assert_eq!(json!({"ok": true}), fetcher.fetch_json("http://a/x.json").await.unwrap());
        assert_eq!(2, transport.calls_to("http://a/x.json"));
    }
}
