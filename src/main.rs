//! This file defines the erddap-search binary entry point.

use erddap_explorer::app_state::AppState;
use erddap_explorer::cli;
use erddap_explorer::client::fetch_awesome_erddaps;
use erddap_explorer::metrics;
use erddap_explorer::models::ServerConfig;
use erddap_explorer::search::{ErddapClients, SearchEvent, SearchOptions};
use erddap_explorer::tracing;

use std::sync::Arc;
use std::time::Duration;
use tokio_stream::StreamExt;

/// Application entry point
#[tokio::main]
async fn main() {
    let args = cli::parse();
    tracing::init_tracing();
    metrics::register_metrics();
    let state = match AppState::new(&args) {
        Ok(state) => Arc::new(state),
        Err(err) => {
            ::tracing::error!("failed to initialise: {}", err);
            std::process::exit(1);
        }
    };

    let mut configs: Vec<ServerConfig> = args.servers.iter().map(|s| s.as_str().into()).collect();
    if args.awesome {
        match fetch_awesome_erddaps(&state).await {
            Ok(awesome) => configs.extend(awesome),
            Err(err) => ::tracing::warn!("public server list unavailable: {}", err),
        }
    }
    if configs.is_empty() {
        configs.push(ServerConfig::default());
    }

    let clients = ErddapClients::new(configs, state.clone());
    let servers = clients
        .test_connect(|progress| {
            ::tracing::info!(
                "connectivity test: {} of {} remaining",
                progress.remaining,
                progress.total
            )
        })
        .await;
    ::tracing::info!(
        "{} of {} servers connected",
        servers.iter().filter(|s| s.connected).count(),
        servers.len()
    );

    let mut stream = clients.search(SearchOptions {
        query: args.query.clone(),
        fetch_metadata: args.fetch_metadata,
    });
    while let Some(event) = stream.next().await {
        match event {
            SearchEvent::Hit(hit) => {
                println!("{}\t{}\t{}", hit.id, hit.title().unwrap_or_default(), hit.url)
            }
            SearchEvent::Status(status) => {
                if let Some(err) = &status.err {
                    ::tracing::warn!("{}", err);
                }
                ::tracing::info!(
                    "{} hits from {} of {} servers, {} awaiting, {:?}",
                    status.hits,
                    status.results,
                    status.nerddaps,
                    status.awaiting,
                    status.search_time
                );
                if status.finished {
                    break;
                }
            }
        }
    }

    while !state.polite_queue.is_empty() {
        tokio::time::sleep(Duration::from_millis(100)).await;
    }
    if args.print_metrics {
        print!("{}", metrics::gather_metrics());
    }
}
