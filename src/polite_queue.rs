//! Politeness queue.
//!
//! Bulk metadata prefetches go through a FIFO queue drained by a bounded number of workers
//! (one by default), so that a long result list does not flood the servers with requests.
//! Each URL is fetched through the [Fetcher], so cache and deduplication rules still apply.

use crate::error::ErddapError;
use crate::fetcher::{Fetcher, SharedFetch};
use crate::metrics::POLITE_QUEUE_DEPTH;

use futures::future::FutureExt;
use hashbrown::HashMap;
use std::collections::VecDeque;
use std::sync::{Arc, Mutex};
use tokio::sync::oneshot;

/// Default number of requests the queue keeps in flight.
pub const DEFAULT_CONCURRENCY: usize = 1;

struct Pending {
    fetch: SharedFetch,
    sender: Option<oneshot::Sender<Result<serde_json::Value, ErddapError>>>,
}

#[derive(Default)]
struct QueueState {
    queue: VecDeque<String>,
    /// Queued or processing URLs.
    pending: HashMap<String, Pending>,
    workers: usize,
}

/// Serial (or bounded-concurrency) fetch queue.
pub struct PoliteQueue {
    fetcher: Arc<Fetcher>,
    concurrency: usize,
    state: Arc<Mutex<QueueState>>,
}

impl PoliteQueue {
    /// Create a queue.
    ///
    /// # Arguments
    ///
    /// * `fetcher`: Performs each request
    /// * `concurrency`: Maximum number of requests in flight, at least one
    pub fn new(fetcher: Arc<Fetcher>, concurrency: usize) -> Self {
        PoliteQueue {
            fetcher,
            concurrency: concurrency.max(1),
            state: Arc::new(Mutex::new(QueueState::default())),
        }
    }

    /// Number of URLs queued or being processed.
    pub fn len(&self) -> usize {
        self.lock().pending.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, QueueState> {
        match self.state.lock() {
            Ok(state) => state,
            Err(poisoned) => poisoned.into_inner(),
        }
    }

    /// Queue a URL, or join the pending request if it is already queued or processing.
    pub fn enqueue(&self, url: &str) -> SharedFetch {
        let mut state = self.lock();
        if let Some(pending) = state.pending.get(url) {
            return pending.fetch.clone();
        }

        let (sender, receiver) = oneshot::channel();
        let fetch = receiver
            .map(|received| received.unwrap_or(Err(ErddapError::QueueClosed)))
            .boxed()
            .shared();
        state.pending.insert(
            url.to_string(),
            Pending {
                fetch: fetch.clone(),
                sender: Some(sender),
            },
        );
        state.queue.push_back(url.to_string());
        POLITE_QUEUE_DEPTH.inc();

        if state.workers < self.concurrency {
            state.workers += 1;
            tokio::spawn(drain(self.fetcher.clone(), self.state.clone()));
        }
        fetch
    }
}

/// Worker loop: take URLs in FIFO order until the queue is empty.
async fn drain(fetcher: Arc<Fetcher>, state: Arc<Mutex<QueueState>>) {
    loop {
        // Yield first so a burst of enqueues completes before processing starts.
        tokio::task::yield_now().await;

        let next = {
            let mut state = match state.lock() {
                Ok(state) => state,
                Err(poisoned) => poisoned.into_inner(),
            };
            match state.queue.pop_front() {
                Some(url) => {
                    let sender = state
                        .pending
                        .get_mut(&url)
                        .and_then(|pending| pending.sender.take());
                    Some((url, sender))
                }
                None => {
                    state.workers -= 1;
                    None
                }
            }
        };
        let Some((url, sender)) = next else {
            return;
        };
        POLITE_QUEUE_DEPTH.dec();

        tracing::debug!("polite fetch {}", url);
        let result = fetcher.fetch_json(&url).await;
        if let Err(err) = &result {
            tracing::info!("polite fetch of {} failed: {}", url, err);
        }
        {
            let mut state = match state.lock() {
                Ok(state) => state,
                Err(poisoned) => poisoned.into_inner(),
            };
            state.pending.remove(&url);
        }
        if let Some(sender) = sender {
            // The receiver lives inside the shared future; nobody awaiting is fine.
            let _ = sender.send(result);
        }
    }
}
