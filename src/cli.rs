//! Command Line Interface (CLI) arguments.

use clap::Parser;

/// ERDDAP multi-server search command line interface
#[derive(Clone, Debug, Parser)]
pub struct CommandLineArgs {
    /// ERDDAP server URL to search (repeatable)
    #[arg(long = "server", env = "ERDDAP_SERVERS", value_delimiter = ',')]
    pub servers: Vec<String>,
    /// Search the well-known list of public ERDDAP servers
    #[arg(long, default_value_t = false, env = "ERDDAP_AWESOME")]
    pub awesome: bool,
    /// Search terms
    #[arg(long, default_value = "", env = "ERDDAP_QUERY")]
    pub query: String,
    /// Seconds a cached response stays fresh
    #[arg(long, default_value_t = 600, env = "ERDDAP_CACHE_TTL")]
    pub cache_ttl: u64,
    /// Request timeout in milliseconds
    #[arg(long, default_value_t = 30000, env = "ERDDAP_TIMEOUT")]
    pub timeout: u64,
    /// Connectivity probe timeout in milliseconds
    #[arg(long, default_value_t = 5000, env = "ERDDAP_PROBE_TIMEOUT")]
    pub probe_timeout: u64,
    /// Maximum concurrent requests of the politeness queue
    #[arg(long, default_value_t = 1, env = "ERDDAP_POLITE_CONCURRENCY")]
    pub polite_concurrency: usize,
    /// Whether to persist responses on disk between runs
    #[arg(long, default_value_t = false, env = "ERDDAP_USE_DISK_CACHE")]
    pub use_disk_cache: bool,
    /// Directory of the disk cache
    #[arg(long, default_value = "~/.cache/erddap-explorer", env = "ERDDAP_CACHE_PATH")]
    pub cache_path: String,
    /// Prefetch the metadata of every hit through the politeness queue
    #[arg(long, default_value_t = false, env = "ERDDAP_FETCH_METADATA")]
    pub fetch_metadata: bool,
    /// Print Prometheus metrics on exit
    #[arg(long, default_value_t = false, env = "ERDDAP_PRINT_METRICS")]
    pub print_metrics: bool,
}

/// Returns parsed command line arguments.
pub fn parse() -> CommandLineArgs {
    CommandLineArgs::parse()
}
