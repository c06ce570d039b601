//! Faceted exploration of datasets found by a search.
//!
//! The explorer keeps the datasets the user is looking at, derives IOOS category, variable and
//! year facets from their metadata and the datasets index, and filters dataset URLs by the
//! facet states. Facets are rebuilt from scratch whenever metadata changes; their states are
//! carried across rebuilds by identity.

use crate::app_state::SharedAppState;
use crate::error::ErddapError;
use crate::events::{EventBus, EventKind};
use crate::index::{bounds_to_dap, DatasetsIndex, YearMap};
use crate::models::{ElevationRange, GeoBounds, LatLngBounds};
use crate::search::ErddapClients;
use crate::table::{InfoRow, Table};

use hashbrown::HashMap;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

/// Delay coalescing repeated bounds or elevation changes.
pub const REQUEST_DEBOUNCE: Duration = Duration::from_millis(100);

/// Tri-state facet selection.
#[derive(Clone, Copy, Debug, Default, Deserialize, Eq, Hash, PartialEq, Serialize)]
pub enum FacetState {
    Exclude,
    #[default]
    Neutral,
    Include,
}

impl From<FacetState> for i8 {
    fn from(state: FacetState) -> i8 {
        match state {
            FacetState::Exclude => -1,
            FacetState::Neutral => 0,
            FacetState::Include => 1,
        }
    }
}

impl From<i8> for FacetState {
    fn from(value: i8) -> Self {
        match value {
            v if v < 0 => FacetState::Exclude,
            0 => FacetState::Neutral,
            _ => FacetState::Include,
        }
    }
}

/// A variable within an IOOS category.
#[derive(Clone, Debug, PartialEq)]
pub struct Variable {
    pub name: String,
    pub data_type: String,
    /// Lowercase name
    pub value: String,
    pub state: FacetState,
    pub dataset_urls: Vec<String>,
}

/// An IOOS category facet.
#[derive(Clone, Debug, PartialEq)]
pub struct IoosCategory {
    pub value: String,
    pub state: FacetState,
    pub variables: Vec<Variable>,
    pub dataset_urls: Vec<String>,
}

/// A year facet. Included by default.
#[derive(Clone, Debug, PartialEq)]
pub struct Year {
    pub year: i32,
    pub state: FacetState,
    pub dataset_urls: Vec<String>,
}

/// Spatial bounds of a dataset.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct DatasetBounds {
    pub overall: Option<GeoBounds>,
    pub year: BTreeMap<i32, GeoBounds>,
}

/// A dataset under exploration.
#[derive(Clone, Debug, PartialEq)]
pub struct ExplorerDataset {
    /// `{endpoint}/info/{dataset_id}/index.json`
    pub dataset_url: String,
    /// `info` rows; `None` until fetched, empty if the fetch failed
    pub metadata: Option<Vec<InfoRow>>,
    pub bounds: DatasetBounds,
    /// Years with data as collapsed ranges, e.g. `["2001-2003", "2005"]`
    pub display_years: Vec<String>,
    pub pinned: bool,
}

impl ExplorerDataset {
    fn new(dataset_url: &str) -> Self {
        ExplorerDataset {
            dataset_url: dataset_url.to_string(),
            metadata: None,
            bounds: DatasetBounds::default(),
            display_years: vec![],
            pinned: false,
        }
    }
}

/// Payloads delivered to explorer listeners.
#[derive(Clone)]
pub enum ExplorerEvent {
    CategoriesChanged(Vec<IoosCategory>),
    DatasetsIndexLoaded(Arc<DatasetsIndex>),
    DatasetsIndexUpdated(Option<Arc<DatasetsIndex>>),
    SelectedYearsChanged(Vec<i32>),
    Searching,
}

impl ExplorerEvent {
    pub fn kind(&self) -> EventKind {
        match self {
            Self::CategoriesChanged(_) => EventKind::CategoriesChanged,
            Self::DatasetsIndexLoaded(_) => EventKind::DatasetsIndexLoaded,
            Self::DatasetsIndexUpdated(_) => EventKind::DatasetsIndexUpdated,
            Self::SelectedYearsChanged(_) => EventKind::SelectedYearsChanged,
            Self::Searching => EventKind::Searching,
        }
    }
}

#[derive(Default)]
struct ExplorerState {
    clients: Option<Arc<ErddapClients>>,
    index: Option<Arc<DatasetsIndex>>,
    datasets: HashMap<String, ExplorerDataset>,
    categories: BTreeMap<String, IoosCategory>,
    /// Keyed `category:variable`, lowercase
    variable_states: HashMap<String, FacetState>,
    years: Vec<Year>,
    yearmap_applied: bool,
    bounds: Option<LatLngBounds>,
    elevations: Option<ElevationRange>,
}

/// Explorer over the datasets of a set of servers.
pub struct ErddapExplorer {
    state: SharedAppState,
    events: EventBus<ExplorerEvent>,
    inner: Mutex<ExplorerState>,
    /// Issue counter of bounds/elevation requests; only the latest result is applied.
    data_request: AtomicU64,
    bounds_debounce: AtomicU64,
    elevations_debounce: AtomicU64,
    bounds_primed: AtomicBool,
}

fn variable_key(category: &str, variable: &str) -> String {
    format!("{}:{}", category, variable).to_lowercase()
}

fn push_unique(urls: &mut Vec<String>, url: &str) {
    if !urls.iter().any(|u| u == url) {
        urls.push(url.to_string());
    }
}

/// Overall bounds from NC_GLOBAL `geospatial_{lat,lon}_{min,max}`; all four are required.
pub fn global_bounds(rows: &[InfoRow]) -> Option<GeoBounds> {
    let mut values: HashMap<&str, f64> = HashMap::new();
    for row in rows.iter().filter(|r| r.variable_name == "NC_GLOBAL") {
        let key = row.attribute_name.as_str();
        if matches!(
            key,
            "geospatial_lat_min" | "geospatial_lat_max" | "geospatial_lon_min" | "geospatial_lon_max"
        ) {
            if let Ok(v) = row.value.trim().parse::<f64>() {
                values.insert(key, v);
            }
        }
    }
    Some(GeoBounds {
        lat: crate::models::Extent {
            min: *values.get("geospatial_lat_min")?,
            max: *values.get("geospatial_lat_max")?,
        },
        lon: crate::models::Extent {
            min: *values.get("geospatial_lon_min")?,
            max: *values.get("geospatial_lon_max")?,
        },
    })
}

/// Collapse years into ranges of consecutive years.
pub fn display_years(years: impl IntoIterator<Item = i32>) -> Vec<String> {
    let mut years: Vec<i32> = years.into_iter().collect();
    years.sort_unstable();
    years.dedup();
    let mut out = vec![];
    let mut iter = years.into_iter();
    let Some(first) = iter.next() else {
        return out;
    };
    let (mut start, mut prev) = (first, first);
    let mut push = |start: i32, end: i32| {
        if start == end {
            out.push(start.to_string());
        } else {
            out.push(format!("{}-{}", start, end));
        }
    };
    for year in iter {
        if year != prev + 1 {
            push(start, prev);
            start = year;
        }
        prev = year;
    }
    push(start, prev);
    out
}

/// Rebuild category facets from dataset metadata, carrying states over from the previous
/// categories and the variable state map.
pub fn build_categories<'a>(
    datasets: impl IntoIterator<Item = &'a ExplorerDataset>,
    previous: &BTreeMap<String, IoosCategory>,
    variable_states: &HashMap<String, FacetState>,
) -> BTreeMap<String, IoosCategory> {
    let mut categories: BTreeMap<String, IoosCategory> = BTreeMap::new();
    for dataset in datasets {
        let Some(rows) = &dataset.metadata else {
            continue;
        };
        let mut data_types: HashMap<&str, &str> = HashMap::new();
        for row in rows {
            if row.attribute_name.is_empty() {
                data_types.insert(&row.variable_name, &row.data_type);
            } else if row.attribute_name == "ioos_category" {
                let category = categories
                    .entry(row.value.clone())
                    .or_insert_with(|| IoosCategory {
                        value: row.value.clone(),
                        state: previous
                            .get(&row.value)
                            .map(|c| c.state)
                            .unwrap_or_default(),
                        variables: vec![],
                        dataset_urls: vec![],
                    });
                let value = row.variable_name.to_lowercase();
                let index = match category.variables.iter().position(|v| v.value == value) {
                    Some(index) => index,
                    None => {
                        category.variables.push(Variable {
                            name: row.variable_name.clone(),
                            data_type: data_types
                                .get(row.variable_name.as_str())
                                .map(|t| t.to_string())
                                .unwrap_or_default(),
                            value,
                            state: variable_states
                                .get(&variable_key(&row.value, &row.variable_name))
                                .copied()
                                .unwrap_or_default(),
                            dataset_urls: vec![],
                        });
                        category.variables.len() - 1
                    }
                };
                push_unique(&mut category.variables[index].dataset_urls, &dataset.dataset_url);
                push_unique(&mut category.dataset_urls, &dataset.dataset_url);
            }
        }
    }
    categories
}

/// True if a dataset passes the category and variable facets.
pub fn matches_categories<'a>(
    categories: impl IntoIterator<Item = &'a IoosCategory>,
    dataset_url: &str,
) -> bool {
    let contains = |urls: &[String]| urls.iter().any(|u| u == dataset_url);
    for category in categories {
        match category.state {
            FacetState::Neutral => {}
            FacetState::Exclude => {
                if contains(&category.dataset_urls) {
                    return false;
                }
            }
            FacetState::Include => {
                if !contains(&category.dataset_urls) {
                    return false;
                }
                for variable in &category.variables {
                    match variable.state {
                        FacetState::Neutral => {}
                        FacetState::Exclude if contains(&variable.dataset_urls) => return false,
                        FacetState::Include if !contains(&variable.dataset_urls) => return false,
                        _ => {}
                    }
                }
            }
        }
    }
    true
}

impl ErddapExplorer {
    pub fn new(state: SharedAppState) -> Arc<Self> {
        Arc::new(ErddapExplorer {
            state,
            events: EventBus::default(),
            inner: Mutex::new(ExplorerState::default()),
            data_request: AtomicU64::new(0),
            bounds_debounce: AtomicU64::new(0),
            elevations_debounce: AtomicU64::new(0),
            bounds_primed: AtomicBool::new(false),
        })
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, ExplorerState> {
        match self.inner.lock() {
            Ok(inner) => inner,
            Err(poisoned) => poisoned.into_inner(),
        }
    }

    fn trigger(&self, event: ExplorerEvent) {
        self.events.trigger(event.kind(), event);
    }

    /// Register an event listener.
    pub fn on<F>(&self, kind: EventKind, listener: F)
    where
        F: Fn(ExplorerEvent) + Send + Sync + 'static,
    {
        self.events.on(kind, listener);
    }

    pub fn clients(&self) -> Option<Arc<ErddapClients>> {
        self.lock().clients.clone()
    }

    pub fn datasets_index(&self) -> Option<Arc<DatasetsIndex>> {
        self.lock().index.clone()
    }

    /// Use a set of servers and load their composite datasets index.
    ///
    /// Year facets are rebuilt from the index (states kept per year) and the current bounds
    /// are queried straight away.
    pub async fn set_clients(self: &Arc<Self>, clients: Arc<ErddapClients>) {
        self.lock().clients = Some(clients.clone());
        let Some(index) = clients.load_datasets_index().await else {
            tracing::info!("datasetsIndex not loaded");
            return;
        };
        let bounds = {
            let mut inner = self.lock();
            let previous: HashMap<i32, FacetState> =
                inner.years.iter().map(|y| (y.year, y.state)).collect();
            inner.years = index
                .years()
                .into_iter()
                .map(|year| Year {
                    year,
                    state: previous.get(&year).copied().unwrap_or(FacetState::Include),
                    dataset_urls: vec![],
                })
                .collect();
            inner.index = Some(index.clone());
            inner.bounds
        };
        self.bounds_primed.store(false, Ordering::SeqCst);
        if let Err(err) = self.set_bounds(bounds) {
            tracing::warn!("stored bounds rejected: {}", err);
        }
        self.trigger(ExplorerEvent::DatasetsIndexLoaded(index));
    }

    /// Restrict the year facets to a bounding box.
    ///
    /// The first call after the index loads is queried immediately, later calls are
    /// debounced. Fails without side effects on a malformed box.
    pub fn set_bounds(self: &Arc<Self>, bounds: Option<LatLngBounds>) -> Result<(), ErddapError> {
        bounds_to_dap(bounds.as_ref())?;
        let index = {
            let mut inner = self.lock();
            inner.bounds = bounds;
            inner.index.clone()
        };
        let Some(index) = index else {
            return Ok(());
        };
        self.trigger(ExplorerEvent::Searching);
        let request = self.data_request.fetch_add(1, Ordering::SeqCst) + 1;
        let debounce = self.bounds_debounce.fetch_add(1, Ordering::SeqCst) + 1;
        let delay = if self.bounds_primed.swap(true, Ordering::SeqCst) {
            REQUEST_DEBOUNCE
        } else {
            Duration::ZERO
        };
        let explorer = self.clone();
        tokio::spawn(async move {
            if !delay.is_zero() {
                tokio::time::sleep(delay).await;
            }
            if explorer.bounds_debounce.load(Ordering::SeqCst) != debounce {
                return;
            }
            let bounds = explorer.lock().bounds;
            match index.set_bounds(bounds).await {
                Ok(yearmap) => explorer.apply_yearmap(request, yearmap),
                Err(err) => tracing::warn!("bounds query failed: {}", err),
            }
        });
        Ok(())
    }

    /// Restrict the year facets to an elevation range. Always debounced.
    pub fn set_elevations(self: &Arc<Self>, elevations: Option<ElevationRange>) {
        let index = {
            let mut inner = self.lock();
            inner.elevations = elevations;
            inner.index.clone()
        };
        let Some(index) = index else {
            return;
        };
        self.trigger(ExplorerEvent::Searching);
        let request = self.data_request.fetch_add(1, Ordering::SeqCst) + 1;
        let debounce = self.elevations_debounce.fetch_add(1, Ordering::SeqCst) + 1;
        let explorer = self.clone();
        tokio::spawn(async move {
            tokio::time::sleep(REQUEST_DEBOUNCE).await;
            if explorer.elevations_debounce.load(Ordering::SeqCst) != debounce {
                return;
            }
            let elevations = explorer.lock().elevations;
            match index.set_elevations(elevations).await {
                Ok(yearmap) => explorer.apply_yearmap(request, yearmap),
                Err(err) => tracing::warn!("elevation query failed: {}", err),
            }
        });
    }

    fn apply_yearmap(&self, request: u64, yearmap: YearMap) {
        if request != self.data_request.load(Ordering::SeqCst) {
            tracing::debug!("discarding result of superseded request {}", request);
            return;
        }
        let index = {
            let mut inner = self.lock();
            for year in inner.years.iter_mut() {
                year.dataset_urls = yearmap.get(&year.year).cloned().unwrap_or_default();
            }
            inner.yearmap_applied = true;
            inner.index.clone()
        };
        self.trigger(ExplorerEvent::DatasetsIndexUpdated(index));
    }

    /// Add a dataset, or return the existing one.
    ///
    /// Its `info` rows are fetched through the politeness queue; a failed fetch leaves it
    /// with empty metadata. Per-year bounds come from the datasets index, if loaded.
    pub async fn add_dataset(&self, dataset_url: &str) -> ExplorerDataset {
        {
            let mut inner = self.lock();
            if let Some(existing) = inner.datasets.get(dataset_url) {
                return existing.clone();
            }
            inner
                .datasets
                .insert(dataset_url.to_string(), ExplorerDataset::new(dataset_url));
        }
        self.trigger(ExplorerEvent::Searching);

        let rows = match self.fetch_info_rows(dataset_url).await {
            Ok(rows) => rows,
            Err(err) => {
                tracing::info!("no metadata for {}: {}", dataset_url, err);
                vec![]
            }
        };
        let overall = global_bounds(&rows);
        {
            let mut inner = self.lock();
            let Some(dataset) = inner.datasets.get_mut(dataset_url) else {
                return ExplorerDataset::new(dataset_url);
            };
            dataset.metadata = Some(rows);
            dataset.bounds.overall = overall;
        }
        self.update_categories();

        let index = self.lock().index.clone();
        if let Some(index) = index {
            match index.get_bounds(dataset_url).await {
                Ok(year_bounds) => self.apply_year_bounds(dataset_url, year_bounds),
                Err(err) => tracing::info!("no year bounds for {}: {}", dataset_url, err),
            }
        }
        self.get_dataset(dataset_url)
            .unwrap_or_else(|| ExplorerDataset::new(dataset_url))
    }

    async fn fetch_info_rows(&self, dataset_url: &str) -> Result<Vec<InfoRow>, ErddapError> {
        let value = self.state.polite_queue.enqueue(dataset_url).await?;
        let table = Table::from_json(dataset_url, &value)?;
        Ok(table.rows.iter().map(|row| InfoRow::from_row(row)).collect())
    }

    fn apply_year_bounds(&self, dataset_url: &str, year_bounds: BTreeMap<i32, GeoBounds>) {
        let index = {
            let mut inner = self.lock();
            let Some(dataset) = inner.datasets.get_mut(dataset_url) else {
                return;
            };
            if dataset.bounds.overall.is_none() {
                dataset.bounds.overall = year_bounds.values().fold(None, |acc, b| {
                    let mut acc = acc.unwrap_or(*b);
                    acc.union(b);
                    Some(acc)
                });
            }
            dataset.display_years = display_years(year_bounds.keys().copied());
            dataset.bounds.year = year_bounds;
            inner.index.clone()
        };
        self.trigger(ExplorerEvent::DatasetsIndexUpdated(index));
    }

    pub fn get_dataset(&self, dataset_url: &str) -> Option<ExplorerDataset> {
        self.lock().datasets.get(dataset_url).cloned()
    }

    /// URLs of every dataset under exploration.
    pub fn dataset_urls(&self) -> Vec<String> {
        let mut urls: Vec<String> = self.lock().datasets.keys().cloned().collect();
        urls.sort();
        urls
    }

    pub fn remove_dataset(&self, dataset_url: &str) -> Option<ExplorerDataset> {
        let (removed, index) = {
            let mut inner = self.lock();
            (inner.datasets.remove(dataset_url), inner.index.clone())
        };
        if removed.is_some() {
            self.trigger(ExplorerEvent::DatasetsIndexUpdated(index));
            self.update_categories();
        }
        removed
    }

    fn set_pinned(&self, dataset_url: &str, pinned: bool) -> bool {
        match self.lock().datasets.get_mut(dataset_url) {
            Some(dataset) => {
                dataset.pinned = pinned;
                true
            }
            None => false,
        }
    }

    /// Protect a dataset from [Self::clear]. Returns false for an unknown dataset.
    pub fn pin(&self, dataset_url: &str) -> bool {
        self.set_pinned(dataset_url, true)
    }

    pub fn unpin(&self, dataset_url: &str) -> bool {
        self.set_pinned(dataset_url, false)
    }

    /// Drop every unpinned dataset and reset variable facet states.
    pub fn clear(&self) {
        {
            let mut inner = self.lock();
            inner.datasets.retain(|_, dataset| dataset.pinned);
            inner.variable_states.clear();
        }
        self.update_categories();
    }

    /// Rebuild category facets from the current metadata.
    pub fn update_categories(&self) {
        let categories = {
            let mut inner = self.lock();
            let categories =
                build_categories(inner.datasets.values(), &inner.categories, &inner.variable_states);
            inner.categories = categories;
            inner.categories.values().cloned().collect::<Vec<_>>()
        };
        self.trigger(ExplorerEvent::CategoriesChanged(categories));
    }

    pub fn categories(&self) -> Vec<IoosCategory> {
        self.lock().categories.values().cloned().collect()
    }

    pub fn years(&self) -> Vec<Year> {
        self.lock().years.clone()
    }

    /// Set a category facet. Returns false for an unknown category.
    pub fn set_category_state(&self, category: &str, state: FacetState) -> bool {
        match self.lock().categories.get_mut(category) {
            Some(c) => {
                c.state = state;
                true
            }
            None => false,
        }
    }

    /// Set a variable facet within a category. The state outlives rebuilds until
    /// [Self::clear].
    pub fn set_variable_state(&self, category: &str, variable: &str, state: FacetState) -> bool {
        let mut inner = self.lock();
        inner
            .variable_states
            .insert(variable_key(category, variable), state);
        let value = variable.to_lowercase();
        match inner
            .categories
            .get_mut(category)
            .and_then(|c| c.variables.iter_mut().find(|v| v.value == value))
        {
            Some(v) => {
                v.state = state;
                true
            }
            None => false,
        }
    }

    /// Set a year facet and announce the selected years.
    pub fn set_year_state(&self, year: i32, state: FacetState) -> bool {
        let selected = {
            let mut inner = self.lock();
            let Some(y) = inner.years.iter_mut().find(|y| y.year == year) else {
                return false;
            };
            y.state = state;
            inner
                .years
                .iter()
                .filter(|y| y.state == FacetState::Include)
                .map(|y| y.year)
                .collect()
        };
        self.trigger(ExplorerEvent::SelectedYearsChanged(selected));
        true
    }

    /// True if a dataset passes every facet.
    ///
    /// The year facet applies once a yearmap has been applied, and only to datasets the index
    /// knows about: such a dataset must appear in some included year.
    pub fn matches(&self, dataset_url: &str) -> bool {
        let inner = self.lock();
        if !matches_categories(inner.categories.values(), dataset_url) {
            return false;
        }
        let indexed = inner
            .datasets
            .get(dataset_url)
            .map(|d| !d.bounds.year.is_empty())
            .unwrap_or(false);
        if !inner.yearmap_applied || !indexed {
            return true;
        }
        inner
            .years
            .iter()
            .filter(|y| y.state == FacetState::Include)
            .any(|y| y.dataset_urls.iter().any(|u| u == dataset_url))
    }

    /// The URLs passing every facet, in input order.
    pub fn filter<'a>(&self, dataset_urls: impl IntoIterator<Item = &'a str>) -> Vec<String> {
        dataset_urls
            .into_iter()
            .filter(|url| self.matches(url))
            .map(|url| url.to_string())
            .collect()
    }
}
