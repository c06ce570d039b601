//! This crate provides a client library for searching and exploring the datasets published by
//! [ERDDAP](https://coastwatch.pfeg.noaa.gov/erddap/information.html) servers, the
//! query-string driven data servers widely used for oceanographic and environmental data.
//!
//! A single logical search is fanned out to any number of independently configured servers and
//! their out-of-order answers are merged into one live result stream. Responses are cached with
//! an expiry, concurrent requests for the same URL share one network call, and bulk metadata
//! prefetches go through a politeness queue so that servers are not flooded. On top of this an
//! in-memory index of years, IOOS categories, variables and spatial bounds supports interactive
//! filtering without going back to the network.
//!
//! The library is built on top of a number of open source components.
//!
//! * [Tokio](tokio), the most popular asynchronous Rust runtime.
//! * [reqwest] performs HTTP requests against the servers.
//! * [Serde](serde) performs (de)serialisation of the JSON responses.
//! * [cached] provides the optional on-disk response cache.
//! * [Prometheus](prometheus) metrics and [tracing] logs describe what the library is doing.

pub mod app_state;
pub mod cli;
pub mod client;
pub mod dataset;
pub mod encoding;
pub mod error;
pub mod events;
pub mod explorer;
pub mod fetcher;
pub mod index;
pub mod metrics;
pub mod models;
pub mod polite_queue;
pub mod response_cache;
pub mod search;
pub mod server_flags;
pub mod table;
#[cfg(test)]
pub mod test_utils;
pub mod tracing;
pub mod transport;
