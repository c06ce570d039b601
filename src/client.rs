//! Client for a single ERDDAP server.

use crate::app_state::SharedAppState;
use crate::dataset::{DatasetMeta, ErddapDataset};
use crate::error::ErddapError;
use crate::index::DatasetsIndex;
use crate::models::{SearchHit, ServerConfig};
use crate::table::Table;

use hashbrown::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

/// Page size used when none is given; large enough to return every hit of most servers.
pub const DEFAULT_ITEMS_PER_PAGE: usize = 10000;

/// Well-known list of public ERDDAP servers.
pub const AWESOME_ERDDAPS_URL: &str =
    "https://irishmarineinstitute.github.io/awesome-erddap/erddaps.json";

/// Search URL of an endpoint.
pub fn search_url(endpoint: &str, query: &str, page: usize, items_per_page: usize) -> String {
    let params = url::form_urlencoded::Serializer::new(String::new())
        .append_pair("searchFor", query)
        .append_pair("page", &page.to_string())
        .append_pair("itemsPerPage", &items_per_page.to_string())
        .finish();
    format!("{}/search/index.json?{}", endpoint, params)
}

/// Search an endpoint without a client handle.
pub(crate) async fn search_endpoint(
    state: &SharedAppState,
    endpoint: &str,
    query: &str,
    page: usize,
    items_per_page: usize,
) -> Result<Vec<SearchHit>, ErddapError> {
    let timeout = state.fetcher.settings().timeout;
    search_endpoint_with_timeout(state, endpoint, query, page, items_per_page, timeout).await
}

async fn search_endpoint_with_timeout(
    state: &SharedAppState,
    endpoint: &str,
    query: &str,
    page: usize,
    items_per_page: usize,
    timeout: Duration,
) -> Result<Vec<SearchHit>, ErddapError> {
    let url = search_url(endpoint, query, page, items_per_page);
    let ttl = state.fetcher.settings().ttl;
    let value = state.fetcher.request(&url, ttl, timeout).await?;
    let table = Table::from_json(&url, &value)?;
    Ok(table
        .records()
        .into_iter()
        .map(|record| SearchHit::from_record(endpoint, record))
        .collect())
}

/// Client for one ERDDAP server.
pub struct ErddapClient {
    state: SharedAppState,
    endpoint: String,
    config: Mutex<ServerConfig>,
    datasets: Mutex<HashMap<String, Arc<ErddapDataset>>>,
}

impl std::fmt::Debug for ErddapClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ErddapClient")
            .field("endpoint", &self.endpoint)
            .finish()
    }
}

impl ErddapClient {
    /// Create a client.
    ///
    /// The disabled flag is restored from the state's flag store.
    ///
    /// # Arguments
    ///
    /// * `config`: Server configuration
    /// * `state`: Shared fetcher, queue and flag store
    pub fn new(config: ServerConfig, state: SharedAppState) -> Self {
        let endpoint = config.endpoint();
        let mut config = config;
        config.url = endpoint.clone();
        config.disabled = state.flags.is_disabled(&endpoint);
        ErddapClient {
            state,
            endpoint,
            config: Mutex::new(config),
            datasets: Mutex::new(HashMap::new()),
        }
    }

    /// Normalized base URL.
    pub fn endpoint(&self) -> &str {
        &self.endpoint
    }

    pub fn state(&self) -> &SharedAppState {
        &self.state
    }

    fn lock_config(&self) -> std::sync::MutexGuard<'_, ServerConfig> {
        match self.config.lock() {
            Ok(config) => config,
            Err(poisoned) => poisoned.into_inner(),
        }
    }

    /// Snapshot of the configuration and status.
    pub fn config(&self) -> ServerConfig {
        self.lock_config().clone()
    }

    pub fn is_connected(&self) -> bool {
        self.lock_config().connected
    }

    pub fn is_disabled(&self) -> bool {
        self.lock_config().disabled
    }

    /// True if the server should take part in searches.
    pub fn is_searchable(&self) -> bool {
        let config = self.lock_config();
        config.connected && !config.disabled
    }

    /// User toggle; the flag is persisted.
    pub fn set_disabled(&self, disabled: bool) -> Result<(), ErddapError> {
        self.lock_config().disabled = disabled;
        self.state.flags.set_disabled(&self.endpoint, disabled)
    }

    /// Search the server's full text index.
    ///
    /// # Arguments
    ///
    /// * `query`: ERDDAP search terms
    /// * `page`: 1-based page number
    /// * `items_per_page`: Page size
    pub async fn search(
        &self,
        query: &str,
        page: usize,
        items_per_page: usize,
    ) -> Result<Vec<SearchHit>, ErddapError> {
        search_endpoint(&self.state, &self.endpoint, query, page, items_per_page).await
    }

    /// All datasets matching a filter (default `NC_GLOBAL`, i.e. every dataset), sorted by id.
    pub async fn list_datasets(&self, filter: Option<&str>) -> Result<Vec<SearchHit>, ErddapError> {
        let mut hits = self
            .search(filter.unwrap_or("NC_GLOBAL"), 1, DEFAULT_ITEMS_PER_PAGE)
            .await?;
        hits.sort_by(|a, b| a.id.cmp(&b.id));
        Ok(hits)
    }

    /// Probe the server with a one-item search and record whether it answered.
    ///
    /// Never fails; the outcome is returned and kept in [ServerConfig::connected].
    #[tracing::instrument(level = "DEBUG", skip(self), fields(endpoint = %self.endpoint))]
    pub async fn test_connect(&self) -> bool {
        self.lock_config().connected = false;
        let result = search_endpoint_with_timeout(
            &self.state,
            &self.endpoint,
            "time",
            1,
            1,
            self.state.probe_timeout,
        )
        .await;
        let connected = match result {
            Ok(_) => true,
            Err(err) => {
                tracing::info!("{} not reachable: {}", self.endpoint, err);
                false
            }
        };
        self.lock_config().connected = connected;
        connected
    }

    /// Handle on a dataset, created on first use and kept for the client's lifetime.
    pub fn dataset(&self, dataset_id: &str) -> Arc<ErddapDataset> {
        let mut datasets = match self.datasets.lock() {
            Ok(d) => d,
            Err(poisoned) => poisoned.into_inner(),
        };
        datasets
            .entry(dataset_id.to_string())
            .or_insert_with(|| {
                Arc::new(ErddapDataset::new(
                    self.state.clone(),
                    &self.endpoint,
                    dataset_id,
                ))
            })
            .clone()
    }

    /// Load this server's `datasetsIndex`, or `None` if it has none.
    pub async fn load_datasets_index(self: &Arc<Self>) -> Option<Arc<DatasetsIndex>> {
        let index = DatasetsIndex::leaf(self.clone());
        match index.load().await {
            Ok(()) => Some(Arc::new(index)),
            Err(err) => {
                tracing::info!("datasetsIndex not loaded for {}: {}", self.endpoint, err);
                None
            }
        }
    }

    /// Resolve metadata from a dataset URL of the form `{endpoint}/info/{dataset_id}`.
    pub async fn fetch_dataset(
        state: SharedAppState,
        dataset_url: &str,
    ) -> Result<Arc<DatasetMeta>, ErddapError> {
        let (endpoint, rest) =
            dataset_url
                .split_once("/info/")
                .ok_or_else(|| ErddapError::UnknownDataset {
                    dataset_id: dataset_url.to_string(),
                })?;
        let dataset_id = rest.split('/').next().unwrap_or_default();
        ErddapClient::new(ServerConfig::new(endpoint), state)
            .dataset(dataset_id)
            .fetch_metadata()
            .await
    }
}

/// The public server list, fetched once per application state.
///
/// Each caller receives its own copy.
pub async fn fetch_awesome_erddaps(
    state: &SharedAppState,
) -> Result<Vec<ServerConfig>, ErddapError> {
    state
        .awesome_erddaps
        .get_or_init(|| async {
            let value = state.fetcher.fetch_json(AWESOME_ERDDAPS_URL).await?;
            serde_json::from_value::<Vec<ServerConfig>>(value).map_err(|e| {
                ErddapError::InvalidResponse {
                    url: AWESOME_ERDDAPS_URL.to_string(),
                    error: e.to_string(),
                }
            })
        })
        .await
        .clone()
}
