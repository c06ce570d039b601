//! Server registry and multi-server search.
//!
//! [ErddapClients] fans one logical search out to every connected, enabled server and merges
//! the results into a single [SearchStream]. Each search is tagged with a generation number;
//! starting a new search supersedes the previous one, whose late results are dropped before
//! they reach the stream.

use crate::app_state::SharedAppState;
use crate::client::{ErddapClient, DEFAULT_ITEMS_PER_PAGE};
use crate::error::ErddapError;
use crate::index::DatasetsIndex;
use crate::metrics::SEARCHES;
use crate::models::{SearchHit, ServerConfig};

use futures::future::join_all;
use hashbrown::HashSet;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::time::Instant;
use tokio_stream::wrappers::UnboundedReceiverStream;

/// Connectivity test progress.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct ConnectProgress {
    pub total: usize,
    pub remaining: usize,
}

/// Parameters of a multi-server search.
#[derive(Clone, Debug, Default)]
pub struct SearchOptions {
    /// ERDDAP search terms
    pub query: String,
    /// Queue each hit's metadata for prefetch through the politeness queue
    pub fetch_metadata: bool,
}

impl SearchOptions {
    pub fn new(query: &str) -> Self {
        SearchOptions {
            query: query.to_string(),
            fetch_metadata: false,
        }
    }
}

/// Aggregate search status, reported after each server settles.
#[derive(Clone, Debug, PartialEq)]
pub struct SearchStatus {
    /// Servers taking part, including late joiners
    pub nerddaps: usize,
    /// Servers yet to answer
    pub awaiting: usize,
    /// Servers that returned at least one hit
    pub results: usize,
    /// Hits so far
    pub hits: usize,
    /// Failure of the server that just settled, if any
    pub err: Option<ErddapError>,
    pub search_time: Duration,
    pub finished: bool,
}

/// Item of a [SearchStream].
#[derive(Clone, Debug, PartialEq)]
pub enum SearchEvent {
    Hit(SearchHit),
    Status(SearchStatus),
}

/// Events of one search. Ends once the search is superseded and its pending server calls
/// have returned.
pub type SearchStream = UnboundedReceiverStream<SearchEvent>;

#[derive(Default)]
struct Tally {
    nerddaps: usize,
    awaiting: usize,
    results: usize,
    hits: usize,
    endpoints: HashSet<String>,
}

struct ActiveSearch {
    id: u64,
    query: String,
    fetch_metadata: bool,
    started: Instant,
    sender: mpsc::UnboundedSender<SearchEvent>,
    tally: Mutex<Tally>,
}

impl ActiveSearch {
    fn lock(&self) -> std::sync::MutexGuard<'_, Tally> {
        match self.tally.lock() {
            Ok(tally) => tally,
            Err(poisoned) => poisoned.into_inner(),
        }
    }

    /// Count a server in, unless it already takes part.
    fn join(&self, endpoint: &str) -> bool {
        let mut tally = self.lock();
        if !tally.endpoints.insert(endpoint.to_string()) {
            return false;
        }
        tally.nerddaps += 1;
        tally.awaiting += 1;
        true
    }

    fn settle(&self, hits: usize) {
        let mut tally = self.lock();
        tally.awaiting = tally.awaiting.saturating_sub(1);
        tally.hits += hits;
        if hits > 0 {
            tally.results += 1;
        }
    }

    fn is_current(&self, search_id: &AtomicU64) -> bool {
        self.id == search_id.load(Ordering::SeqCst)
    }

    fn is_finished(&self) -> bool {
        self.lock().awaiting == 0
    }

    fn report(&self, err: Option<ErddapError>) {
        let status = {
            let tally = self.lock();
            SearchStatus {
                nerddaps: tally.nerddaps,
                awaiting: tally.awaiting,
                results: tally.results,
                hits: tally.hits,
                err,
                search_time: self.started.elapsed(),
                finished: tally.awaiting == 0,
            }
        };
        // A dropped stream only means nobody is listening.
        let _ = self.sender.send(SearchEvent::Status(status));
    }
}

/// Set of ERDDAP servers searched together.
pub struct ErddapClients {
    state: SharedAppState,
    clients: Vec<Arc<ErddapClient>>,
    search_id: Arc<AtomicU64>,
    active: Mutex<Option<Arc<ActiveSearch>>>,
}

impl ErddapClients {
    /// Create a client per configuration. Configurations resolving to an endpoint already
    /// present are skipped.
    pub fn new(configs: impl IntoIterator<Item = ServerConfig>, state: SharedAppState) -> Self {
        let mut clients: Vec<Arc<ErddapClient>> = vec![];
        for config in configs {
            let endpoint = config.endpoint();
            if clients.iter().any(|c| c.endpoint() == endpoint) {
                tracing::debug!("skipping duplicate server {}", endpoint);
                continue;
            }
            clients.push(Arc::new(ErddapClient::new(config, state.clone())));
        }
        ErddapClients {
            state,
            clients,
            search_id: Arc::new(AtomicU64::new(0)),
            active: Mutex::new(None),
        }
    }

    pub fn clients(&self) -> &[Arc<ErddapClient>] {
        &self.clients
    }

    pub fn state(&self) -> &SharedAppState {
        &self.state
    }

    /// Client for an endpoint, if configured.
    pub fn get(&self, endpoint: &str) -> Option<Arc<ErddapClient>> {
        let endpoint = crate::models::normalize_endpoint(endpoint);
        self.clients
            .iter()
            .find(|c| c.endpoint() == endpoint)
            .cloned()
    }

    fn lock_active(&self) -> std::sync::MutexGuard<'_, Option<Arc<ActiveSearch>>> {
        match self.active.lock() {
            Ok(active) => active,
            Err(poisoned) => poisoned.into_inner(),
        }
    }

    /// Probe every server concurrently.
    ///
    /// `on_progress` is called as each probe settles. A server that comes up while a search
    /// is active joins that search. Never fails; the returned configurations carry each
    /// server's `connected` flag.
    pub async fn test_connect<F>(&self, on_progress: F) -> Vec<ServerConfig>
    where
        F: Fn(ConnectProgress),
    {
        let total = self.clients.len();
        let remaining = AtomicUsize::new(total);
        join_all(self.clients.iter().map(|client| {
            let remaining = &remaining;
            let on_progress = &on_progress;
            async move {
                client.test_connect().await;
                let left = remaining.fetch_sub(1, Ordering::SeqCst) - 1;
                on_progress(ConnectProgress {
                    total,
                    remaining: left,
                });
                if client.is_searchable() {
                    self.late_join(client);
                }
            }
        }))
        .await;
        self.clients.iter().map(|c| c.config()).collect()
    }

    fn late_join(&self, client: &Arc<ErddapClient>) {
        let Some(search) = self.lock_active().clone() else {
            return;
        };
        if !search.is_current(&self.search_id) || !search.join(client.endpoint()) {
            return;
        }
        tracing::debug!("{} joined search {}", client.endpoint(), search.id);
        spawn_server_search(self.search_id.clone(), search, client.clone());
    }

    /// Search every connected, enabled server.
    ///
    /// Hits arrive in each server's page order; no order holds between servers. A status
    /// event follows each server's hits. With no searchable server a single finished status
    /// is emitted.
    pub fn search(&self, options: SearchOptions) -> SearchStream {
        let id = self.search_id.fetch_add(1, Ordering::SeqCst) + 1;
        SEARCHES.with_label_values(&["started"]).inc();
        let (sender, receiver) = mpsc::unbounded_channel();
        let search = Arc::new(ActiveSearch {
            id,
            query: options.query,
            fetch_metadata: options.fetch_metadata,
            started: Instant::now(),
            sender,
            tally: Mutex::new(Tally::default()),
        });
        if let Some(previous) = self.lock_active().replace(search.clone()) {
            if !previous.is_finished() {
                SEARCHES.with_label_values(&["superseded"]).inc();
                tracing::debug!("search {} superseded by {}", previous.id, id);
            }
        }

        let searchable: Vec<_> = self
            .clients
            .iter()
            .filter(|c| c.is_searchable() && search.join(c.endpoint()))
            .cloned()
            .collect();
        tracing::info!(
            "search {} for {:?} on {} servers",
            id,
            search.query,
            searchable.len()
        );
        if searchable.is_empty() {
            search.report(None);
        }
        for client in searchable {
            spawn_server_search(self.search_id.clone(), search.clone(), client);
        }
        UnboundedReceiverStream::new(receiver)
    }

    /// Composite index over every server with a `datasetsIndex`; `None` if no server has one.
    pub async fn load_datasets_index(&self) -> Option<Arc<DatasetsIndex>> {
        let leaves = join_all(self.clients.iter().map(|c| c.load_datasets_index())).await;
        let composite = DatasetsIndex::composite();
        for leaf in leaves.into_iter().flatten() {
            composite.add(leaf).ok()?;
        }
        if composite.is_empty() {
            None
        } else {
            Some(Arc::new(composite))
        }
    }
}

fn spawn_server_search(
    search_id: Arc<AtomicU64>,
    search: Arc<ActiveSearch>,
    client: Arc<ErddapClient>,
) {
    tokio::spawn(async move {
        let result = client
            .search(&search.query, 1, DEFAULT_ITEMS_PER_PAGE)
            .await;
        if !search.is_current(&search_id) {
            return;
        }
        let (hits, err) = match result {
            Ok(hits) => (hits, None),
            Err(err) => {
                if err.is_transport() {
                    tracing::info!("search of {} failed: {}", client.endpoint(), err);
                } else {
                    tracing::warn!("bad search response from {}: {}", client.endpoint(), err);
                }
                (vec![], Some(err))
            }
        };
        let count = hits.len();
        for hit in hits {
            // One hit per turn so a large page does not starve other tasks.
            tokio::task::yield_now().await;
            if !search.is_current(&search_id) {
                return;
            }
            if search.fetch_metadata {
                let _ = client.state().polite_queue.enqueue(&hit.info_url());
            }
            let _ = search.sender.send(SearchEvent::Hit(hit));
        }
        // Settled only once every hit is out, so a finished status follows all hits.
        search.settle(count);
        if search.is_current(&search_id) {
            search.report(err);
        }
    });
}
