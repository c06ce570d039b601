//! Dataset metadata resolution.
//!
//! An [ErddapDataset] is a handle on one dataset of one server. Its metadata is resolved once,
//! on first use, from the server's search results and the dataset's `info` table, and kept for
//! the lifetime of the handle.

use crate::app_state::SharedAppState;
use crate::client;
use crate::encoding::{EncodeContext, Encoder, Param, ValueType};
use crate::error::ErddapError;
use crate::models::{Record, SearchHit};
use crate::table::{Info, Table};

use hashbrown::HashMap;
use serde_json::Value;
use std::sync::{Arc, Mutex};
use tokio::sync::OnceCell;

/// Resolved metadata of a dataset.
#[derive(Clone, Debug, PartialEq)]
pub struct DatasetMeta {
    pub id: String,
    pub endpoint: String,
    /// URL of the `info` table in JSON
    pub url: String,
    pub title: Option<String>,
    pub institution: Option<String>,
    /// Dimensions then variables, in declaration order
    pub fieldnames: Vec<String>,
    pub types: HashMap<String, ValueType>,
    /// Present when the dataset declares dimensions: variable to the dimensions it spans
    pub dimensions: Option<HashMap<String, Vec<String>>>,
    pub time_dimension: Option<String>,
    pub lat_dimension: Option<String>,
    pub lon_dimension: Option<String>,
    pub subset_variables: Vec<String>,
    pub encoders: HashMap<String, Encoder>,
    pub summary: Option<SearchHit>,
    pub info: Info,
}

impl DatasetMeta {
    /// Derive metadata from a dataset's folded `info` table.
    ///
    /// Fails with [ErddapError::UnknownType] if any dimension or variable has a data type
    /// without an encoder.
    pub fn from_info(endpoint: &str, dataset_id: &str, info: Info) -> Result<Self, ErddapError> {
        let mut meta = DatasetMeta {
            id: dataset_id.to_string(),
            endpoint: endpoint.to_string(),
            url: format!("{}/info/{}/index.json", endpoint, dataset_id),
            title: info.attribute("NC_GLOBAL", "title").map(str::to_string),
            institution: info
                .attribute("NC_GLOBAL", "institution")
                .map(str::to_string),
            fieldnames: vec![],
            types: HashMap::new(),
            dimensions: None,
            time_dimension: None,
            lat_dimension: None,
            lon_dimension: None,
            subset_variables: info
                .attribute("NC_GLOBAL", "subsetVariables")
                .map(|s| {
                    s.split(',')
                        .map(|x| x.trim().to_string())
                        .filter(|x| !x.is_empty())
                        .collect()
                })
                .unwrap_or_default(),
            encoders: HashMap::new(),
            summary: None,
            info: Info::default(),
        };

        let has_dimensions = info.has("dimension");
        for row_type in ["dimension", "variable"] {
            if !info.has(row_type) {
                continue;
            }
            if row_type == "dimension" {
                meta.dimensions = Some(HashMap::new());
            }
            for key in info.names(row_type) {
                meta.fieldnames.push(key.clone());
                let declaration = info.get(row_type, key, "").cloned().unwrap_or_default();
                let value_type = ValueType::from_erddap(&declaration.data_type).ok_or_else(|| {
                    ErddapError::UnknownType {
                        dataset_id: dataset_id.to_string(),
                        variable: key.clone(),
                        type_name: declaration.data_type.clone(),
                    }
                })?;
                meta.types.insert(key.clone(), value_type);
                meta.encoders
                    .insert(key.clone(), Encoder::for_type(value_type));

                match info.attribute(key, "_CoordinateAxisType") {
                    Some("Time") => meta.bind_time(key),
                    Some("Lat") => meta.lat_dimension = Some(key.clone()),
                    Some("Lon") => meta.lon_dimension = Some(key.clone()),
                    _ => {}
                }

                if row_type == "variable" && has_dimensions && !declaration.value.is_empty() {
                    let spans = declaration
                        .value
                        .split([' ', ','])
                        .filter(|d| !d.is_empty())
                        .map(str::to_string)
                        .collect();
                    if let Some(dimensions) = meta.dimensions.as_mut() {
                        dimensions.insert(key.clone(), spans);
                    }
                }
                if key == "time" {
                    meta.bind_time(key);
                }
            }
        }
        meta.info = info;
        Ok(meta)
    }

    fn bind_time(&mut self, key: &str) {
        self.time_dimension = Some(key.to_string());
        self.types.insert(key.to_string(), ValueType::Time);
        for name in [key, "since", "until"] {
            self.encoders.insert(name.to_string(), Encoder::Time);
        }
    }

    /// Encode one variable's value in a given context.
    pub fn encode_value(
        &self,
        variable: &str,
        value: &Param,
        context: EncodeContext,
    ) -> Result<String, ErddapError> {
        self.encoders
            .get(variable)
            .map(|encoder| encoder.encode(value, context))
            .ok_or_else(|| ErddapError::UnknownVariable {
                dataset_id: self.id.clone(),
                variable: variable.to_string(),
            })
    }

    /// Build a constraint such as `time>=(2020-01-01T00:00:00Z)`.
    ///
    /// # Arguments
    ///
    /// * `variable`: Variable name
    /// * `operator`: DAP comparison operator, e.g. `>=` or `=~`
    /// * `value`: Value to compare against
    pub fn encode(
        &self,
        variable: &str,
        operator: &str,
        value: &Param,
    ) -> Result<String, ErddapError> {
        let encoded = self.encode_value(variable, value, EncodeContext::Constraint)?;
        Ok(format!("{}{}{}", variable, operator, encoded))
    }

    /// Variable names (not dimensions) in declaration order.
    pub fn variables(&self) -> &[String] {
        self.info.names("variable")
    }
}

/// Handle on one dataset of one server.
pub struct ErddapDataset {
    state: SharedAppState,
    endpoint: String,
    dataset_id: String,
    meta: OnceCell<Result<Arc<DatasetMeta>, ErddapError>>,
    subsets: Arc<Mutex<HashMap<String, Option<Vec<Value>>>>>,
}

impl ErddapDataset {
    pub(crate) fn new(state: SharedAppState, endpoint: &str, dataset_id: &str) -> Self {
        ErddapDataset {
            state,
            endpoint: endpoint.to_string(),
            dataset_id: dataset_id.to_string(),
            meta: OnceCell::new(),
            subsets: Arc::new(Mutex::new(HashMap::new())),
        }
    }

    pub fn dataset_id(&self) -> &str {
        &self.dataset_id
    }

    /// `{endpoint}/info/{dataset_id}`
    pub fn dataset_url(&self) -> String {
        format!("{}/info/{}", self.endpoint, self.dataset_id)
    }

    /// Tabledap URL for a response format, ready for a query string.
    pub fn data_url(&self, format_extension: &str) -> String {
        format!(
            "{}/tabledap/{}{}?",
            self.endpoint, self.dataset_id, format_extension
        )
    }

    /// Run a tabledap query and return its rows as records.
    ///
    /// # Arguments
    ///
    /// * `dap`: Query string, e.g. `year&distinct()`
    pub async fn fetch_data(&self, dap: &str) -> Result<Vec<Record>, ErddapError> {
        let url = format!("{}{}", self.data_url(".json"), dap);
        let value = self.state.fetcher.fetch_json(&url).await?;
        Ok(Table::from_json(&url, &value)?.records())
    }

    /// Resolve (once) and return the dataset's metadata.
    pub async fn fetch_metadata(&self) -> Result<Arc<DatasetMeta>, ErddapError> {
        self.meta
            .get_or_init(|| async {
                let result = self.resolve().await;
                if let Err(err) = &result {
                    tracing::warn!("metadata for {} unavailable: {}", self.dataset_url(), err);
                }
                result
            })
            .await
            .clone()
    }

    /// Metadata if it has already been resolved successfully.
    pub fn metadata(&self) -> Option<Arc<DatasetMeta>> {
        self.meta.get().and_then(|m| m.as_ref().ok().cloned())
    }

    #[tracing::instrument(level = "DEBUG", skip(self), fields(dataset = %self.dataset_id))]
    async fn resolve(&self) -> Result<Arc<DatasetMeta>, ErddapError> {
        let query = format!("datasetID={}", self.dataset_id);
        let hits = client::search_endpoint(
            &self.state,
            &self.endpoint,
            &query,
            1,
            client::DEFAULT_ITEMS_PER_PAGE,
        )
        .await?;
        let summary = hits
            .into_iter()
            .find(|hit| hit.id == self.dataset_id)
            .ok_or_else(|| ErddapError::UnknownDataset {
                dataset_id: self.dataset_id.clone(),
            })?;

        let url = format!("{}/index.json", self.dataset_url());
        let value = self.state.fetcher.fetch_json(&url).await?;
        let table = Table::from_json(&url, &value)?;
        let mut meta =
            DatasetMeta::from_info(&self.endpoint, &self.dataset_id, Info::from_rows(&table.rows))?;
        meta.summary = Some(summary);
        Ok(Arc::new(meta))
    }

    /// Start fetching the distinct values of a subset variable, unless already started.
    pub fn prepare_subset(&self, variable: &str) {
        {
            let mut subsets = match self.subsets.lock() {
                Ok(s) => s,
                Err(poisoned) => poisoned.into_inner(),
            };
            if subsets.contains_key(variable) {
                return;
            }
            subsets.insert(variable.to_string(), None);
        }
        let url = format!("{}{}&distinct()", self.data_url(".json"), variable);
        let fetcher = self.state.fetcher.clone();
        let subsets = self.subsets.clone();
        let variable = variable.to_string();
        tokio::spawn(async move {
            let values = fetcher
                .fetch_json(&url)
                .await
                .and_then(|value| Table::from_json(&url, &value));
            match values {
                Ok(table) => {
                    let values = table
                        .records()
                        .into_iter()
                        .filter_map(|mut r| r.remove(&variable))
                        .collect();
                    if let Ok(mut subsets) = subsets.lock() {
                        subsets.insert(variable, Some(values));
                    }
                }
                Err(err) => tracing::info!("subset {} unavailable: {}", url, err),
            }
        });
    }

    /// Distinct values of a subset variable, once [Self::prepare_subset] has completed.
    pub fn subset(&self, variable: &str) -> Option<Vec<Value>> {
        self.subsets
            .lock()
            .ok()
            .and_then(|s| s.get(variable).cloned().flatten())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_utils::{info_response, info_row, search_response, test_state, MockTransport};

    use serde_json::json;

    const ENDPOINT: &str = "http://a/erddap";

    fn info_rows() -> Vec<Vec<Value>> {
        vec![
            info_row("attribute", "NC_GLOBAL", "title", "String", "Buoy"),
            info_row("attribute", "NC_GLOBAL", "institution", "String", "MI"),
            info_row("attribute", "NC_GLOBAL", "subsetVariables", "String", "station_id, depth"),
            info_row("variable", "station_id", "", "String", ""),
            info_row("variable", "time", "", "double", ""),
            info_row("attribute", "time", "_CoordinateAxisType", "String", "Time"),
            info_row("variable", "latitude", "", "double", ""),
            info_row("attribute", "latitude", "_CoordinateAxisType", "String", "Lat"),
            info_row("variable", "longitude", "", "double", ""),
            info_row("attribute", "longitude", "_CoordinateAxisType", "String", "Lon"),
            info_row("variable", "depth", "", "float", ""),
            info_row("variable", "count", "", "int", ""),
        ]
    }

    fn mock(rows: Vec<Vec<Value>>) -> Arc<MockTransport> {
        let transport = Arc::new(MockTransport::new());
        transport.respond_prefix(
            &format!("{}/search/index.json?searchFor=datasetID%3Dbuoy", ENDPOINT),
            search_response(ENDPOINT, &[("buoy", "Buoy")]),
        );
        transport.respond(
            &format!("{}/info/buoy/index.json", ENDPOINT),
            info_response(rows),
        );
        transport
    }

    #[test]
    fn meta_from_info() {
        let info = Info::from_rows(&info_rows());
        let meta = DatasetMeta::from_info(ENDPOINT, "buoy", info).unwrap();
        assert_eq!(Some("Buoy".to_string()), meta.title);
        assert_eq!(Some("MI".to_string()), meta.institution);
        assert_eq!(vec!["station_id", "depth"], meta.subset_variables);
        assert_eq!(
            vec!["station_id", "time", "latitude", "longitude", "depth", "count"],
            meta.fieldnames
        );
        assert_eq!(Some(&ValueType::Time), meta.types.get("time"));
        assert_eq!(Some(&ValueType::Integer), meta.types.get("count"));
        assert_eq!(Some(&ValueType::String), meta.types.get("station_id"));
        assert_eq!(Some("time".to_string()), meta.time_dimension);
        assert_eq!(Some("latitude".to_string()), meta.lat_dimension);
        assert_eq!(Some("longitude".to_string()), meta.lon_dimension);
        assert_eq!(None, meta.dimensions);
        assert_eq!(Some(&Encoder::Time), meta.encoders.get("since"));
        assert_eq!(Some(&Encoder::Time), meta.encoders.get("until"));
    }

    #[test]
    fn meta_encoding() {
        let meta = DatasetMeta::from_info(ENDPOINT, "buoy", Info::from_rows(&info_rows())).unwrap();
        assert_eq!("depth>=12.5", meta.encode("depth", ">=", &12.5_f64.into()).unwrap());
        assert_eq!("depth>=null", meta.encode("depth", ">=", &f64::NAN.into()).unwrap());
        assert_eq!("station_id=\"abc\"", meta.encode("station_id", "=", &"abc".into()).unwrap());
        assert_eq!(
            "since>=(2020-01-01T00:00:00Z)",
            meta.encode("since", ">=", &"2020-01-01".into()).unwrap()
        );
        assert!(matches!(
            meta.encode("nope", "=", &"x".into()),
            Err(ErddapError::UnknownVariable { .. })
        ));
    }

    #[test]
    fn meta_dimensions() {
        let rows = vec![
            info_row("dimension", "time", "", "double", "nValues=10"),
            info_row("dimension", "depth", "", "float", "nValues=3"),
            info_row("variable", "temp", "", "float", "time, depth"),
        ];
        let meta = DatasetMeta::from_info(ENDPOINT, "grid", Info::from_rows(&rows)).unwrap();
        let dimensions = meta.dimensions.unwrap();
        assert_eq!(Some(&vec!["time".to_string(), "depth".to_string()]), dimensions.get("temp"));
        assert_eq!(Some("time".to_string()), meta.time_dimension);
    }

    #[test]
    fn meta_unknown_type() {
        let mut rows = info_rows();
        rows.push(info_row("variable", "shape", "", "geometry", ""));
        let err = DatasetMeta::from_info(ENDPOINT, "buoy", Info::from_rows(&rows)).unwrap_err();
        assert_eq!(
            ErddapError::UnknownType {
                dataset_id: "buoy".to_string(),
                variable: "shape".to_string(),
                type_name: "geometry".to_string(),
            },
            err
        );
    }

    #[tokio::test]
    async fn fetch_metadata_memoized() {
        let transport = mock(info_rows());
        let state = test_state(&transport);
        let dataset = ErddapDataset::new(state, ENDPOINT, "buoy");

        let (a, b) = tokio::join!(dataset.fetch_metadata(), dataset.fetch_metadata());
        let a = a.unwrap();
        assert!(Arc::ptr_eq(&a, &b.unwrap()));
        assert_eq!(Some("Buoy".to_string()), a.summary.as_ref().and_then(|s| s.title()));
        assert_eq!(1, transport.calls_to(&format!("{}/info/buoy/index.json", ENDPOINT)));
        assert!(dataset.metadata().is_some());
    }

    #[tokio::test]
    async fn fetch_metadata_unknown_dataset() {
        let transport = mock(info_rows());
        let state = test_state(&transport);
        let dataset = ErddapDataset::new(state, ENDPOINT, "buoy2");
        transport.respond_prefix(
            &format!("{}/search/index.json?searchFor=datasetID%3Dbuoy2", ENDPOINT),
            search_response(ENDPOINT, &[("buoy22", "Other")]),
        );

        let err = dataset.fetch_metadata().await.unwrap_err();
        assert_eq!(
            ErddapError::UnknownDataset {
                dataset_id: "buoy2".to_string()
            },
            err
        );
        assert!(dataset.metadata().is_none());
    }

    #[tokio::test]
    async fn fetch_metadata_unknown_type() {
        let mut rows = info_rows();
        rows.push(info_row("variable", "shape", "", "geometry", ""));
        let transport = mock(rows);
        let dataset = ErddapDataset::new(test_state(&transport), ENDPOINT, "buoy");

        assert!(matches!(
            dataset.fetch_metadata().await,
            Err(ErddapError::UnknownType { .. })
        ));
    }

    #[tokio::test]
    async fn fetch_data_records() {
        let transport = Arc::new(MockTransport::new());
        transport.respond(
            &format!("{}/tabledap/buoy.json?depth&distinct()", ENDPOINT),
            json!({"table": {"columnNames": ["depth"], "rows": [[1.0], [5.0]]}}),
        );
        let dataset = ErddapDataset::new(test_state(&transport), ENDPOINT, "buoy");

        let records = dataset.fetch_data("depth&distinct()").await.unwrap();
        assert_eq!(2, records.len());
        assert_eq!(Some(&json!(5.0)), records[1].get("depth"));
    }

    #[tokio::test]
    async fn subsets() {
        let transport = Arc::new(MockTransport::new());
        transport.respond(
            &format!("{}/tabledap/buoy.json?station_id&distinct()", ENDPOINT),
            json!({"table": {"columnNames": ["station_id"], "rows": [["M2"], ["M3"]]}}),
        );
        let dataset = ErddapDataset::new(test_state(&transport), ENDPOINT, "buoy");

        assert_eq!(None, dataset.subset("station_id"));
        dataset.prepare_subset("station_id");
        dataset.prepare_subset("station_id");
        for _ in 0..100 {
            if dataset.subset("station_id").is_some() {
                break;
            }
            tokio::task::yield_now().await;
        }
        assert_eq!(Some(vec![json!("M2"), json!("M3")]), dataset.subset("station_id"));
        assert_eq!(1, transport.calls().len());
    }
}
