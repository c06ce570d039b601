use crate::cli::CommandLineArgs;
use crate::error::ErddapError;
use crate::fetcher::{Fetcher, FetcherSettings};
use crate::models::ServerConfig;
use crate::polite_queue::{PoliteQueue, DEFAULT_CONCURRENCY};
use crate::response_cache::{
    DiskResponseCache, MemoryResponseCache, ResponseCache, SystemClock,
};
use crate::server_flags::{DiskServerFlags, MemoryServerFlags, ServerFlags};
use crate::transport::HttpTransport;

use lazy_static::lazy_static;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::OnceCell;

/// Default connectivity probe timeout.
pub const DEFAULT_PROBE_TIMEOUT: Duration = Duration::from_secs(5);

lazy_static! {
    static ref GLOBAL: SharedAppState = Arc::new(AppState::from_parts(
        Arc::new(Fetcher::http(FetcherSettings::default())),
        DEFAULT_CONCURRENCY,
        DEFAULT_PROBE_TIMEOUT,
        Arc::new(MemoryServerFlags::new()),
    ));
}

/// State shared by every client, index and explorer.
pub struct AppState {
    /// Cached, deduplicated fetching.
    pub fetcher: Arc<Fetcher>,

    /// Serial queue for bulk metadata prefetch.
    pub polite_queue: PoliteQueue,

    /// Persisted per-server flags.
    pub flags: Arc<dyn ServerFlags>,

    /// Timeout of the connectivity probe.
    pub probe_timeout: Duration,

    // Public server list, fetched at most once.
    pub(crate) awesome_erddaps: OnceCell<Result<Vec<ServerConfig>, ErddapError>>,
}

impl AppState {
    /// Create and return an [AppState] configured from the command line.
    pub fn new(args: &CommandLineArgs) -> Result<Self, ErddapError> {
        let settings = FetcherSettings {
            ttl: Duration::from_secs(args.cache_ttl),
            timeout: Duration::from_millis(args.timeout),
        };
        let (cache, flags): (Arc<dyn ResponseCache>, Arc<dyn ServerFlags>) = if args.use_disk_cache
        {
            let path = PathBuf::from(expanduser::expanduser(&args.cache_path).map_err(|e| {
                ErddapError::CacheError {
                    error: e.to_string(),
                }
            })?);
            std::fs::create_dir_all(&path).map_err(|e| ErddapError::CacheError {
                error: e.to_string(),
            })?;
            (
                Arc::new(DiskResponseCache::new(&path)?),
                Arc::new(DiskServerFlags::new(&path)?),
            )
        } else {
            (
                Arc::new(MemoryResponseCache::new()),
                Arc::new(MemoryServerFlags::new()),
            )
        };
        let fetcher = Arc::new(Fetcher::new(
            Arc::new(HttpTransport::new()),
            cache,
            Arc::new(SystemClock),
            settings,
        ));
        Ok(Self::from_parts(
            fetcher,
            args.polite_concurrency,
            Duration::from_millis(args.probe_timeout),
            flags,
        ))
    }

    /// Assemble a state from explicit collaborators.
    pub fn from_parts(
        fetcher: Arc<Fetcher>,
        polite_concurrency: usize,
        probe_timeout: Duration,
        flags: Arc<dyn ServerFlags>,
    ) -> Self {
        Self {
            polite_queue: PoliteQueue::new(fetcher.clone(), polite_concurrency),
            fetcher,
            flags,
            probe_timeout,
            awesome_erddaps: OnceCell::new(),
        }
    }

    /// Process-wide default state: HTTP transport, in-memory cache, default settings.
    pub fn global() -> SharedAppState {
        GLOBAL.clone()
    }
}

/// AppState wrapped in an Atomic Reference Count (Arc) to allow multiple references.
pub type SharedAppState = Arc<AppState>;
