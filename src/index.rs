//! Spatial/temporal datasets index.
//!
//! Servers that publish a `datasetsIndex` meta-dataset (columns `year`, `dataset_id`,
//! `latitude`, `longitude`, `altitude`) can answer "which datasets have data in which year
//! inside this box" with a single distinct query. A leaf index wraps one such server; a
//! composite index unions the answers of several leaves.

use crate::client::ErddapClient;
use crate::error::ErddapError;
use crate::models::{BoundsBuilder, ElevationRange, GeoBounds, LatLngBounds, Record};

use futures::future::{join_all, BoxFuture, FutureExt};
use serde_json::Value;
use std::collections::BTreeMap;
use std::sync::{Arc, Mutex};

/// Id of the meta-dataset holding the index.
pub const INDEX_DATASET_ID: &str = "datasetsIndex";

/// Dataset URLs (`{endpoint}/info/{id}/index.json`) per year.
pub type YearMap = BTreeMap<i32, Vec<String>>;

/// Load status of an index.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum IndexStatus {
    Unloaded,
    Loaded,
    /// The years could not be fetched; the index is unavailable for its server.
    Error,
}

enum Kind {
    Leaf(Arc<ErddapClient>),
    Composite(Mutex<Vec<Arc<DatasetsIndex>>>),
}

#[derive(Debug)]
struct IndexState {
    status: IndexStatus,
    years: Vec<i32>,
    yearmap: YearMap,
    /// Bumped on every filter change; results of older filters are not stored.
    revision: u64,
    bounds: Option<LatLngBounds>,
    elevations: Option<ElevationRange>,
}

/// Leaf or composite datasets index.
pub struct DatasetsIndex {
    kind: Kind,
    state: Mutex<IndexState>,
}

/// Normalize a longitude into [-180, 180].
pub fn fix_lon_range(lon: f64) -> f64 {
    let mut lon = lon;
    while lon < -180.0 {
        lon += 360.0;
    }
    while lon > 180.0 {
        lon -= 360.0;
    }
    lon
}

/// Convert a bounding box into DAP constraint fragments.
///
/// A box crossing the antimeridian (west longitude greater than east after normalization)
/// becomes two fragments, `[west, 180]` and `[-180, east]`, both inclusive of ±180.
/// No box yields a single empty fragment.
pub fn bounds_to_dap(bounds: Option<&LatLngBounds>) -> Result<Vec<String>, ErddapError> {
    let Some(bounds) = bounds else {
        return Ok(vec![String::new()]);
    };
    let swlat = bounds.southwest.lat;
    let swlon = fix_lon_range(bounds.southwest.lon);
    let nelat = bounds.northeast.lat;
    let nelon = fix_lon_range(bounds.northeast.lon);
    let valid = |lat: f64| (-90.0..=90.0).contains(&lat);
    if !valid(swlat) || !valid(nelat) || swlat > nelat {
        return Err(ErddapError::OutOfBoundsLatitude {
            south: swlat,
            north: nelat,
        });
    }
    let latdap = format!("latitude>={}&latitude<={}", swlat, nelat);
    if swlon <= nelon {
        Ok(vec![format!(
            "&{}&longitude>={}&longitude<={}",
            latdap, swlon, nelon
        )])
    } else {
        Ok(vec![
            format!("&{}&longitude>={}&longitude<=180", latdap, swlon),
            format!("&{}&longitude>=-180&longitude<={}", latdap, nelon),
        ])
    }
}

/// DAP constraint fragment for an elevation range.
pub fn elevations_to_dap(elevations: Option<&ElevationRange>) -> String {
    match elevations {
        Some(e) => format!("&altitude>={}&altitude<={}", e.min, e.max),
        None => String::new(),
    }
}

fn parse_year(value: Option<&Value>) -> Option<i32> {
    match value? {
        Value::Number(n) => n
            .as_i64()
            .or_else(|| n.as_f64().map(|f| f as i64))
            .map(|y| y as i32),
        Value::String(s) => s.trim().parse().ok(),
        _ => None,
    }
}

fn parse_f64(value: Option<&Value>) -> Option<f64> {
    match value? {
        Value::Number(n) => n.as_f64(),
        Value::String(s) => s.trim().parse().ok(),
        _ => None,
    }
}

fn empty_yearmap(years: &[i32]) -> YearMap {
    years.iter().map(|year| (*year, vec![])).collect()
}

fn push_unique(urls: &mut Vec<String>, url: &str) {
    if !urls.iter().any(|u| u == url) {
        urls.push(url.to_string());
    }
}

impl DatasetsIndex {
    fn with_kind(kind: Kind) -> Self {
        DatasetsIndex {
            kind,
            state: Mutex::new(IndexState {
                status: IndexStatus::Unloaded,
                years: vec![],
                yearmap: YearMap::new(),
                revision: 0,
                bounds: None,
                elevations: None,
            }),
        }
    }

    /// Index bound to one server. Call [Self::load] before use.
    pub fn leaf(client: Arc<ErddapClient>) -> Self {
        Self::with_kind(Kind::Leaf(client))
    }

    /// Empty composite index. Add loaded leaves with [Self::add].
    pub fn composite() -> Self {
        let index = Self::with_kind(Kind::Composite(Mutex::new(vec![])));
        index.lock().status = IndexStatus::Loaded;
        index
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, IndexState> {
        match self.state.lock() {
            Ok(state) => state,
            Err(poisoned) => poisoned.into_inner(),
        }
    }

    fn children(&self) -> Vec<Arc<DatasetsIndex>> {
        match &self.kind {
            Kind::Composite(children) => match children.lock() {
                Ok(c) => c.clone(),
                Err(poisoned) => poisoned.into_inner().clone(),
            },
            Kind::Leaf(_) => vec![],
        }
    }

    pub fn is_composite(&self) -> bool {
        matches!(self.kind, Kind::Composite(_))
    }

    pub fn status(&self) -> IndexStatus {
        self.lock().status
    }

    /// Sorted distinct years with data.
    pub fn years(&self) -> Vec<i32> {
        self.lock().years.clone()
    }

    /// Result of the most recent filter passed to [Self::set_bounds] or
    /// [Self::set_elevations]. A late answer to an earlier filter never replaces it.
    pub fn yearmap(&self) -> YearMap {
        self.lock().yearmap.clone()
    }

    /// Number of leaves of a composite index.
    pub fn len(&self) -> usize {
        self.children().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Fetch the distinct years of a leaf index.
    #[tracing::instrument(level = "DEBUG", skip(self))]
    pub async fn load(&self) -> Result<(), ErddapError> {
        let Kind::Leaf(client) = &self.kind else {
            return Err(ErddapError::NotLeafIndex);
        };
        let result = client
            .dataset(INDEX_DATASET_ID)
            .fetch_data("year&distinct()")
            .await;
        let mut state = self.lock();
        match result {
            Ok(records) => {
                let mut years: Vec<i32> = records
                    .iter()
                    .filter_map(|r| parse_year(r.get("year")))
                    .collect();
                years.sort_unstable();
                years.dedup();
                state.yearmap = empty_yearmap(&years);
                state.years = years;
                state.status = IndexStatus::Loaded;
                Ok(())
            }
            Err(err) => {
                state.status = IndexStatus::Error;
                Err(err)
            }
        }
    }

    /// Add a child to a composite index, merging its years.
    pub fn add(&self, child: Arc<DatasetsIndex>) -> Result<(), ErddapError> {
        let Kind::Composite(children) = &self.kind else {
            return Err(ErddapError::NotCompositeIndex);
        };
        let child_years = child.years();
        match children.lock() {
            Ok(mut c) => c.push(child),
            Err(poisoned) => poisoned.into_inner().push(child),
        }
        let mut state = self.lock();
        let mut years = state.years.clone();
        years.extend(child_years);
        years.sort_unstable();
        years.dedup();
        state.yearmap = empty_yearmap(&years);
        state.years = years;
        Ok(())
    }

    /// Restrict the index to a bounding box (`None` for the whole globe) and return the
    /// datasets per year.
    pub async fn set_bounds(
        &self,
        bounds: Option<LatLngBounds>,
    ) -> Result<YearMap, ErddapError> {
        // Validate before storing, so a bad box leaves the previous one in place.
        bounds_to_dap(bounds.as_ref())?;
        self.store(&|state: &mut IndexState| {
            state.bounds = bounds;
            state.revision += 1;
        });
        self.query().await
    }

    /// Restrict the index to an elevation range (`None` for all) and return the datasets per
    /// year. Any bounding box set earlier still applies.
    pub async fn set_elevations(
        &self,
        elevations: Option<ElevationRange>,
    ) -> Result<YearMap, ErddapError> {
        self.store(&|state: &mut IndexState| {
            state.elevations = elevations;
            state.revision += 1;
        });
        self.query().await
    }

    /// Apply a filter change to this index and every descendant.
    fn store(&self, update: &dyn Fn(&mut IndexState)) {
        update(&mut *self.lock());
        for child in self.children() {
            child.store(update);
        }
    }

    fn query(&self) -> BoxFuture<'_, Result<YearMap, ErddapError>> {
        async move {
            match &self.kind {
                Kind::Leaf(client) => self.query_leaf(client).await,
                Kind::Composite(_) => {
                    let revision = self.lock().revision;
                    let children = self.children();
                    let maps = join_all(children.iter().map(|child| child.query())).await;
                    Ok(self.union(maps, revision))
                }
            }
        }
        .boxed()
    }

    async fn query_leaf(&self, client: &Arc<ErddapClient>) -> Result<YearMap, ErddapError> {
        let (bounds, elevations, years, revision) = {
            let state = self.lock();
            (state.bounds, state.elevations, state.years.clone(), state.revision)
        };
        let elevation_dap = elevations_to_dap(elevations.as_ref());
        let index = client.dataset(INDEX_DATASET_ID);
        let queries = bounds_to_dap(bounds.as_ref())?
            .into_iter()
            .map(|dap| format!("year,dataset_id{}{}&distinct()", dap, elevation_dap))
            .collect::<Vec<_>>();
        let results = join_all(queries.iter().map(|q| index.fetch_data(q))).await;

        let mut yearmap = empty_yearmap(&years);
        for records in results {
            for row in records? {
                let (Some(year), Some(Value::String(dataset_id))) =
                    (parse_year(row.get("year")), row.get("dataset_id"))
                else {
                    continue;
                };
                let url = format!("{}/index.json", client.dataset(dataset_id).dataset_url());
                push_unique(yearmap.entry(year).or_default(), &url);
            }
        }
        self.keep_yearmap(revision, &yearmap);
        Ok(yearmap)
    }

    fn keep_yearmap(&self, revision: u64, yearmap: &YearMap) {
        let mut state = self.lock();
        if state.revision == revision {
            state.yearmap = yearmap.clone();
        } else {
            tracing::debug!("not keeping yearmap of superseded filter {}", revision);
        }
    }

    fn union(&self, maps: Vec<Result<YearMap, ErddapError>>, revision: u64) -> YearMap {
        let mut yearmap = empty_yearmap(&self.years());
        for map in maps {
            match map {
                Ok(map) => {
                    for (year, urls) in map {
                        let entry = yearmap.entry(year).or_default();
                        for url in urls {
                            push_unique(entry, &url);
                        }
                    }
                }
                Err(err) => tracing::info!("datasets index query failed: {}", err),
            }
        }
        self.keep_yearmap(revision, &yearmap);
        yearmap
    }

    /// Spatial bounds per year of one dataset, from whichever leaf serves it.
    ///
    /// # Arguments
    ///
    /// * `dataset_url`: `{endpoint}/info/{dataset_id}` with or without `/index.json`
    pub fn get_bounds<'a>(
        &'a self,
        dataset_url: &'a str,
    ) -> BoxFuture<'a, Result<BTreeMap<i32, GeoBounds>, ErddapError>> {
        async move {
            match &self.kind {
                Kind::Leaf(client) => {
                    let prefix = format!("{}/info/", client.endpoint());
                    let Some(rest) = dataset_url.strip_prefix(&prefix) else {
                        return Ok(BTreeMap::new());
                    };
                    let dataset_id = rest.split('/').next().unwrap_or_default();
                    let records = client
                        .dataset(INDEX_DATASET_ID)
                        .fetch_data(&format!(
                            "year,latitude,longitude&dataset_id=\"{}\"&distinct()",
                            dataset_id
                        ))
                        .await?;
                    Ok(fold_bounds(&records))
                }
                Kind::Composite(_) => {
                    for child in self.children() {
                        match child.get_bounds(dataset_url).await {
                            Ok(bounds) if !bounds.is_empty() => return Ok(bounds),
                            Ok(_) => {}
                            Err(err) => {
                                tracing::info!("bounds of {} unavailable: {}", dataset_url, err)
                            }
                        }
                    }
                    Ok(BTreeMap::new())
                }
            }
        }
        .boxed()
    }
}

fn fold_bounds(records: &[Record]) -> BTreeMap<i32, GeoBounds> {
    let mut builders: BTreeMap<i32, BoundsBuilder> = BTreeMap::new();
    for row in records {
        if let (Some(year), Some(lat), Some(lon)) = (
            parse_year(row.get("year")),
            parse_f64(row.get("latitude")),
            parse_f64(row.get("longitude")),
        ) {
            builders.entry(year).or_default().add(lat, lon);
        }
    }
    builders
        .into_iter()
        .filter_map(|(year, builder)| builder.build().map(|b| (year, b)))
        .collect()
}
