//! Data types and associated functions and methods

use hashbrown::HashMap;
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Default ERDDAP endpoint used when a configuration omits the URL.
pub const DEFAULT_ENDPOINT: &str = "https://coastwatch.pfeg.noaa.gov/erddap";

/// Configuration and connection status of one ERDDAP server.
///
/// Identity is the normalized URL, see [normalize_endpoint].
#[derive(Clone, Debug, Default, Deserialize, PartialEq, Serialize)]
pub struct ServerConfig {
    /// Base URL of the server, e.g. `https://erddap.marine.ie/erddap`
    #[serde(default)]
    pub url: String,
    /// Optional human readable name
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    /// Set by the user to exclude the server from searches
    #[serde(default)]
    pub disabled: bool,
    /// Set by the connectivity test
    #[serde(default)]
    pub connected: bool,
}

impl ServerConfig {
    /// Create a configuration for a URL.
    pub fn new(url: &str) -> Self {
        ServerConfig {
            url: url.to_string(),
            ..Default::default()
        }
    }

    /// Returns the normalized endpoint of this server.
    pub fn endpoint(&self) -> String {
        if self.url.is_empty() {
            DEFAULT_ENDPOINT.to_string()
        } else {
            normalize_endpoint(&self.url)
        }
    }
}

impl From<&str> for ServerConfig {
    fn from(url: &str) -> Self {
        ServerConfig::new(url)
    }
}

/// Strip trailing slashes from an ERDDAP URL.
pub fn normalize_endpoint(url: &str) -> String {
    url.trim_end_matches('/').to_string()
}

/// A row of a table response keyed by column name.
pub type Record = HashMap<String, Value>;

/// One dataset returned by a server's search endpoint.
#[derive(Clone, Debug, PartialEq)]
pub struct SearchHit {
    /// Value of the `Dataset ID` column
    pub id: String,
    /// `{endpoint}/info/{id}`
    pub url: String,
    /// All columns of the search result row
    pub fields: Record,
}

impl SearchHit {
    /// Build a hit from a search result row.
    pub fn from_record(endpoint: &str, fields: Record) -> Self {
        let id = fields
            .get("Dataset ID")
            .map(value_to_string)
            .unwrap_or_default();
        let url = format!("{}/info/{}", endpoint, id);
        SearchHit { id, url, fields }
    }

    /// Returns a column of the row rendered as text, if present.
    pub fn get(&self, column: &str) -> Option<String> {
        self.fields.get(column).map(value_to_string)
    }

    /// Dataset title, when the server reports one.
    pub fn title(&self) -> Option<String> {
        self.get("Title")
    }

    /// URL of the dataset's `info` table in JSON.
    pub fn info_url(&self) -> String {
        self.get("Info")
            .filter(|info| !info.is_empty())
            .map(|info| info.replace("/index.htmlTable", "/index.json"))
            .unwrap_or_else(|| format!("{}/index.json", self.url))
    }
}

/// Render a JSON cell as text without quoting strings.
pub fn value_to_string(value: &Value) -> String {
    match value {
        Value::String(s) => s.clone(),
        Value::Null => String::new(),
        other => other.to_string(),
    }
}

/// Latitude/longitude pair in degrees.
#[derive(Clone, Copy, Debug, Deserialize, PartialEq, Serialize)]
pub struct LatLng {
    pub lat: f64,
    pub lon: f64,
}

impl LatLng {
    pub fn new(lat: f64, lon: f64) -> Self {
        LatLng { lat, lon }
    }
}

/// Geographic bounding box given by its south-west and north-east corners.
#[derive(Clone, Copy, Debug, Deserialize, PartialEq, Serialize)]
pub struct LatLngBounds {
    pub southwest: LatLng,
    pub northeast: LatLng,
}

impl LatLngBounds {
    pub fn new(southwest: LatLng, northeast: LatLng) -> Self {
        LatLngBounds {
            southwest,
            northeast,
        }
    }
}

/// Inclusive elevation range in metres.
#[derive(Clone, Copy, Debug, Deserialize, PartialEq, Serialize)]
pub struct ElevationRange {
    pub min: f64,
    pub max: f64,
}

/// Closed numeric interval.
#[derive(Clone, Copy, Debug, Deserialize, PartialEq, Serialize)]
pub struct Extent {
    pub min: f64,
    pub max: f64,
}

impl Extent {
    /// Grow the interval to include another.
    pub fn union(&mut self, other: &Extent) {
        if other.min < self.min {
            self.min = other.min;
        }
        if other.max > self.max {
            self.max = other.max;
        }
    }

    fn include(extent: &mut Option<Extent>, value: f64) {
        match extent {
            Some(e) => e.union(&Extent {
                min: value,
                max: value,
            }),
            None => {
                *extent = Some(Extent {
                    min: value,
                    max: value,
                })
            }
        }
    }
}

/// Spatial extent of a dataset, overall or for one year.
#[derive(Clone, Copy, Debug, Deserialize, PartialEq, Serialize)]
pub struct GeoBounds {
    pub lat: Extent,
    pub lon: Extent,
}

impl GeoBounds {
    /// Grow these bounds to include another.
    pub fn union(&mut self, other: &GeoBounds) {
        self.lat.union(&other.lat);
        self.lon.union(&other.lon);
    }
}

/// Accumulates points into [GeoBounds].
#[derive(Debug, Default)]
pub(crate) struct BoundsBuilder {
    lat: Option<Extent>,
    lon: Option<Extent>,
}

impl BoundsBuilder {
    pub(crate) fn add(&mut self, lat: f64, lon: f64) {
        Extent::include(&mut self.lat, lat);
        Extent::include(&mut self.lon, lon);
    }

    pub(crate) fn build(self) -> Option<GeoBounds> {
        match (self.lat, self.lon) {
            (Some(lat), Some(lon)) => Some(GeoBounds { lat, lon }),
            _ => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn endpoint_strips_trailing_slashes() {
        let config = ServerConfig::new("https://erddap.marine.ie/erddap//");
        assert_eq!("https://erddap.marine.ie/erddap", config.endpoint());
    }

    #[test]
    fn endpoint_default() {
        let config = ServerConfig::default();
        assert_eq!(DEFAULT_ENDPOINT, config.endpoint());
    }

    #[test]
    fn server_config_deserialise() {
        let config: ServerConfig =
            serde_json::from_value(json!({"url": "http://a/erddap/", "name": "A"})).unwrap();
        assert_eq!("http://a/erddap/", config.url);
        assert_eq!(Some("A".to_string()), config.name);
        assert!(!config.disabled);
        assert!(!config.connected);
    }

    #[test]
    fn search_hit_from_record() {
        let mut fields = Record::new();
        fields.insert("Dataset ID".to_string(), json!("IMI_CONN_2D"));
        fields.insert("Title".to_string(), json!("Connemara"));
        let hit = SearchHit::from_record("http://a/erddap", fields);
        assert_eq!("IMI_CONN_2D", hit.id);
        assert_eq!("http://a/erddap/info/IMI_CONN_2D", hit.url);
        assert_eq!(Some("Connemara".to_string()), hit.title());
        assert_eq!("http://a/erddap/info/IMI_CONN_2D/index.json", hit.info_url());
    }

    #[test]
    fn search_hit_info_url_from_column() {
        let mut fields = Record::new();
        fields.insert("Dataset ID".to_string(), json!("x"));
        fields.insert(
            "Info".to_string(),
            json!("http://a/erddap/info/x/index.htmlTable"),
        );
        let hit = SearchHit::from_record("http://a/erddap", fields);
        assert_eq!("http://a/erddap/info/x/index.json", hit.info_url());
    }

    #[test]
    fn bounds_builder() {
        let mut builder = BoundsBuilder::default();
        assert_eq!(None, BoundsBuilder::default().build());
        builder.add(52.0, -10.0);
        builder.add(54.5, -6.0);
        builder.add(53.0, -12.0);
        let bounds = builder.build().unwrap();
        assert_eq!(Extent { min: 52.0, max: 54.5 }, bounds.lat);
        assert_eq!(Extent { min: -12.0, max: -6.0 }, bounds.lon);
    }
}
