use crate::app_state::AppState;
use crate::error::ErddapError;
use crate::fetcher::{Fetcher, FetcherSettings};
use crate::response_cache::{CacheEntry, Clock, MemoryResponseCache, ResponseCache};
use crate::server_flags::MemoryServerFlags;
use crate::transport::Transport;

use async_trait::async_trait;
use serde_json::{json, Value};
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

/// Scripted transport.
///
/// Answers exact URLs first, then the longest matching prefix; anything else fails with a
/// network error. Every call is logged.
#[derive(Default)]
pub(crate) struct MockTransport {
    exact: Mutex<Vec<(String, Result<Value, ErddapError>)>>,
    prefixes: Mutex<Vec<(String, Result<Value, ErddapError>)>>,
    delays: Mutex<Vec<(String, Duration)>>,
    delay: Duration,
    calls: Mutex<Vec<String>>,
    active: AtomicUsize,
    max_active: AtomicUsize,
}

impl MockTransport {
    pub(crate) fn new() -> Self {
        Self::default()
    }

    /// Delay every response by a fixed duration.
    pub(crate) fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = delay;
        self
    }

    /// Delay responses for URLs starting with a prefix.
    pub(crate) fn delay_prefix(&self, prefix: &str, delay: Duration) {
        self.delays
            .lock()
            .unwrap()
            .push((prefix.to_string(), delay));
    }

    pub(crate) fn respond(&self, url: &str, value: Value) {
        self.exact.lock().unwrap().push((url.to_string(), Ok(value)));
    }

    pub(crate) fn respond_prefix(&self, prefix: &str, value: Value) {
        self.prefixes
            .lock()
            .unwrap()
            .push((prefix.to_string(), Ok(value)));
    }

    pub(crate) fn fail_prefix(&self, prefix: &str, error: ErddapError) {
        self.prefixes
            .lock()
            .unwrap()
            .push((prefix.to_string(), Err(error)));
    }

    pub(crate) fn calls(&self) -> Vec<String> {
        self.calls.lock().unwrap().clone()
    }

    pub(crate) fn calls_to(&self, url: &str) -> usize {
        self.calls().iter().filter(|c| *c == url).count()
    }

    pub(crate) fn calls_starting(&self, prefix: &str) -> Vec<String> {
        self.calls()
            .into_iter()
            .filter(|c| c.starts_with(prefix))
            .collect()
    }

    /// Highest number of calls observed in progress at once.
    pub(crate) fn max_active(&self) -> usize {
        self.max_active.load(Ordering::SeqCst)
    }

    fn lookup(&self, url: &str) -> Result<Value, ErddapError> {
        // Later registrations win so tests can change an answer.
        if let Some((_, result)) = self.exact.lock().unwrap().iter().rev().find(|(u, _)| u == url)
        {
            return result.clone();
        }
        self.prefixes
            .lock()
            .unwrap()
            .iter()
            .filter(|(p, _)| url.starts_with(p.as_str()))
            .max_by_key(|(p, _)| p.len())
            .map(|(_, result)| result.clone())
            .unwrap_or_else(|| {
                Err(ErddapError::Network {
                    url: url.to_string(),
                    error: "no route".to_string(),
                })
            })
    }

    fn delay_for(&self, url: &str) -> Duration {
        self.delays
            .lock()
            .unwrap()
            .iter()
            .filter(|(p, _)| url.starts_with(p.as_str()))
            .max_by_key(|(p, _)| p.len())
            .map(|(_, d)| *d)
            .unwrap_or(self.delay)
    }
}

#[async_trait]
impl Transport for MockTransport {
    async fn fetch(&self, url: &str, timeout: Duration) -> Result<Value, ErddapError> {
        self.calls.lock().unwrap().push(url.to_string());
        let active = self.active.fetch_add(1, Ordering::SeqCst) + 1;
        self.max_active.fetch_max(active, Ordering::SeqCst);
        let delay = self.delay_for(url);
        let result = if delay > timeout {
            tokio::time::sleep(timeout).await;
            Err(ErddapError::Timeout {
                url: url.to_string(),
            })
        } else {
            if !delay.is_zero() {
                tokio::time::sleep(delay).await;
            }
            self.lookup(url)
        };
        self.active.fetch_sub(1, Ordering::SeqCst);
        result
    }
}

/// Clock under test control.
pub(crate) struct ManualClock {
    now: AtomicU64,
}

impl ManualClock {
    pub(crate) fn new(now: u64) -> Self {
        ManualClock {
            now: AtomicU64::new(now),
        }
    }

    pub(crate) fn advance(&self, by: Duration) {
        self.now.fetch_add(by.as_millis() as u64, Ordering::SeqCst);
    }
}

impl Clock for ManualClock {
    fn now_millis(&self) -> u64 {
        self.now.load(Ordering::SeqCst)
    }
}

/// Cache whose every operation fails.
pub(crate) struct FailingCache;

impl ResponseCache for FailingCache {
    fn get(&self, _url: &str) -> Result<Option<CacheEntry>, ErddapError> {
        Err(ErddapError::CacheError {
            error: "cannot read".to_string(),
        })
    }

    fn put(&self, _entry: CacheEntry) -> Result<(), ErddapError> {
        Err(ErddapError::CacheError {
            error: "quota exceeded".to_string(),
        })
    }
}

/// Isolated application state over a mock transport.
pub(crate) fn test_state(transport: &Arc<MockTransport>) -> Arc<AppState> {
    let fetcher = Arc::new(Fetcher::new(
        transport.clone(),
        Arc::new(MemoryResponseCache::new()),
        Arc::new(ManualClock::new(0)),
        FetcherSettings::default(),
    ));
    Arc::new(AppState::from_parts(
        fetcher,
        1,
        Duration::from_secs(5),
        Arc::new(MemoryServerFlags::new()),
    ))
}

/// A `{table: {columnNames, rows}}` response.
pub(crate) fn table(columns: &[&str], rows: Vec<Vec<Value>>) -> Value {
    json!({"table": {"columnNames": columns, "rows": rows}})
}

/// A search response listing dataset ids with titles.
pub(crate) fn search_response(endpoint: &str, datasets: &[(&str, &str)]) -> Value {
    table(
        &["griddap", "tabledap", "Title", "Info", "Institution", "Dataset ID"],
        datasets
            .iter()
            .map(|(id, title)| {
                vec![
                    json!(""),
                    json!(format!("{}/tabledap/{}", endpoint, id)),
                    json!(title),
                    json!(format!("{}/info/{}/index.json", endpoint, id)),
                    json!("Marine Institute"),
                    json!(id),
                ]
            })
            .collect(),
    )
}

/// An `info` row.
pub(crate) fn info_row(
    row_type: &str,
    variable: &str,
    attribute: &str,
    data_type: &str,
    value: &str,
) -> Vec<Value> {
    vec![
        json!(row_type),
        json!(variable),
        json!(attribute),
        json!(data_type),
        json!(value),
    ]
}

/// An `info` response.
pub(crate) fn info_response(rows: Vec<Vec<Value>>) -> Value {
    table(
        &[
            "Row Type",
            "Variable Name",
            "Attribute Name",
            "Data Type",
            "Value",
        ],
        rows,
    )
}
