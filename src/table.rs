//! ERDDAP JSON table responses.
//!
//! Every `.json` endpoint used here answers with the same columnar shape:
//!
//! ```json
//! {"table": {"columnNames": ["a", "b"], "rows": [[1, "x"], [2, "y"]]}}
//! ```

use crate::error::ErddapError;
use crate::models::{value_to_string, Record};

use hashbrown::HashMap;
use serde::Deserialize;
use serde_json::Value;

/// A columnar table response.
#[derive(Clone, Debug, Default, Deserialize, PartialEq)]
pub struct Table {
    #[serde(rename = "columnNames")]
    pub column_names: Vec<String>,
    #[serde(default)]
    pub rows: Vec<Vec<Value>>,
}

#[derive(Deserialize)]
struct TableResponse {
    table: Table,
}

impl Table {
    /// Decode a table from a JSON response.
    ///
    /// # Arguments
    ///
    /// * `url`: URL the response came from, used in error messages
    /// * `value`: Parsed JSON body
    pub fn from_json(url: &str, value: &Value) -> Result<Self, ErddapError> {
        TableResponse::deserialize(value)
            .map(|response| response.table)
            .map_err(|err| ErddapError::InvalidResponse {
                url: url.to_string(),
                error: err.to_string(),
            })
    }

    /// Transpose rows into records keyed by column name.
    ///
    /// Short rows leave trailing columns absent.
    pub fn records(&self) -> Vec<Record> {
        self.rows
            .iter()
            .map(|row| {
                self.column_names
                    .iter()
                    .zip(row.iter())
                    .map(|(name, value)| (name.clone(), value.clone()))
                    .collect()
            })
            .collect()
    }
}

/// One row of a dataset `info` table.
#[derive(Clone, Debug, PartialEq)]
pub struct InfoRow {
    pub row_type: String,
    pub variable_name: String,
    pub attribute_name: String,
    pub data_type: String,
    pub value: String,
}

impl InfoRow {
    /// Read the five positional columns of an `info` row.
    pub fn from_row(row: &[Value]) -> Self {
        let cell = |i: usize| row.get(i).map(value_to_string).unwrap_or_default();
        InfoRow {
            row_type: cell(0),
            variable_name: cell(1),
            attribute_name: cell(2),
            data_type: cell(3),
            value: cell(4),
        }
    }
}

/// Type and value of one attribute.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct Attribute {
    pub data_type: String,
    pub value: String,
}

/// Attributes of one variable keyed by attribute name.
///
/// The empty attribute name holds the declaration of the variable itself.
pub type Attributes = HashMap<String, Attribute>;

/// Dataset `info` folded into `row_type -> variable -> attribute -> {type, value}`.
///
/// Declaration order of variables is kept alongside, since it determines field order.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct Info {
    entries: HashMap<String, HashMap<String, Attributes>>,
    order: HashMap<String, Vec<String>>,
}

impl Info {
    /// Fold `info` rows into the nested map.
    pub fn from_rows<'a>(rows: impl IntoIterator<Item = &'a Vec<Value>>) -> Self {
        let mut info = Info::default();
        for row in rows {
            info.insert(InfoRow::from_row(row));
        }
        info
    }

    fn insert(&mut self, row: InfoRow) {
        let variables = self.entries.entry(row.row_type.clone()).or_default();
        if !variables.contains_key(&row.variable_name) {
            self.order
                .entry(row.row_type.clone())
                .or_default()
                .push(row.variable_name.clone());
        }
        variables.entry(row.variable_name).or_default().insert(
            row.attribute_name,
            Attribute {
                data_type: row.data_type,
                value: row.value,
            },
        );
    }

    /// Variables of a row type (`dimension`, `variable`, `attribute`) in declaration order.
    pub fn names(&self, row_type: &str) -> &[String] {
        self.order.get(row_type).map(Vec::as_slice).unwrap_or(&[])
    }

    /// All attributes of one entry.
    pub fn attributes(&self, row_type: &str, variable: &str) -> Option<&Attributes> {
        self.entries.get(row_type)?.get(variable)
    }

    /// One attribute of one entry.
    pub fn get(&self, row_type: &str, variable: &str, attribute: &str) -> Option<&Attribute> {
        self.attributes(row_type, variable)?.get(attribute)
    }

    /// Shorthand for an `attribute` row value, e.g. `("NC_GLOBAL", "title")`.
    pub fn attribute(&self, variable: &str, attribute: &str) -> Option<&str> {
        self.get("attribute", variable, attribute)
            .map(|a| a.value.as_str())
    }

    /// Returns true if the row type has any entries.
    pub fn has(&self, row_type: &str) -> bool {
        self.entries.contains_key(row_type)
    }
}
