//! Encoding of constraint values for DAP queries.

use serde::{Deserialize, Serialize};
use strum_macros::Display;
use time::format_description::well_known::Rfc3339;
use time::macros::format_description;
use time::{Date, OffsetDateTime, PrimitiveDateTime, UtcOffset};

/// Semantic type of a dataset field.
#[derive(Clone, Copy, Debug, Deserialize, Display, Eq, Hash, PartialEq, Serialize)]
pub enum ValueType {
    String,
    Number,
    Integer,
    Time,
}

impl ValueType {
    /// Map an ERDDAP data type name onto a semantic type.
    ///
    /// Returns `None` for types with no encoder.
    pub fn from_erddap(data_type: &str) -> Option<Self> {
        match data_type {
            "float" | "double" => Some(Self::Number),
            "int" | "long" | "short" | "byte" => Some(Self::Integer),
            "String" | "char" => Some(Self::String),
            _ => None,
        }
    }
}

/// A value to be placed in a constraint.
#[derive(Clone, Debug, PartialEq)]
pub enum Param {
    Number(f64),
    Text(String),
    Time(OffsetDateTime),
}

impl From<f64> for Param {
    fn from(value: f64) -> Self {
        Param::Number(value)
    }
}

impl From<i64> for Param {
    fn from(value: i64) -> Self {
        Param::Number(value as f64)
    }
}

impl From<&str> for Param {
    fn from(value: &str) -> Self {
        Param::Text(value.to_string())
    }
}

impl From<String> for Param {
    fn from(value: String) -> Self {
        Param::Text(value)
    }
}

impl From<OffsetDateTime> for Param {
    fn from(value: OffsetDateTime) -> Self {
        Param::Time(value)
    }
}

/// Where an encoded value will be used.
#[derive(Clone, Copy, Debug, Default, Eq, PartialEq)]
pub enum EncodeContext {
    /// Constraint expressions, where times are wrapped in parentheses
    #[default]
    Constraint,
    /// Bare tabledap values
    Tabledap,
}

/// Per-variable value encoder.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum Encoder {
    Number,
    Integer,
    Text,
    Time,
}

impl Encoder {
    /// The encoder for a semantic type.
    pub fn for_type(value_type: ValueType) -> Self {
        match value_type {
            ValueType::Number => Encoder::Number,
            ValueType::Integer => Encoder::Integer,
            ValueType::String => Encoder::Text,
            ValueType::Time => Encoder::Time,
        }
    }

    /// Render a value as DAP constraint text.
    ///
    /// Numeric encoders pass valid numbers through and render anything else as `null`.
    /// The text encoder double quotes. The time encoder renders ISO-8601 and passes
    /// unparseable text through unchanged.
    pub fn encode(&self, value: &Param, context: EncodeContext) -> String {
        match self {
            Encoder::Number | Encoder::Integer => encode_number(value),
            Encoder::Text => quote(&match value {
                Param::Number(n) => format_number(*n),
                Param::Text(s) => s.clone(),
                Param::Time(t) => format_time(*t),
            }),
            Encoder::Time => {
                let time = match value {
                    Param::Time(t) => Some(*t),
                    Param::Number(ms) => time_from_millis(*ms),
                    Param::Text(s) => parse_time(s),
                };
                match (time, context) {
                    (Some(t), EncodeContext::Constraint) => format!("({})", format_time(t)),
                    (Some(t), EncodeContext::Tabledap) => format_time(t),
                    (None, _) => match value {
                        Param::Text(s) => s.clone(),
                        Param::Number(n) => format_number(*n),
                        Param::Time(_) => "null".to_string(),
                    },
                }
            }
        }
    }
}

fn encode_number(value: &Param) -> String {
    match value {
        Param::Number(n) if n.is_finite() => format_number(*n),
        Param::Text(s) => match s.trim().parse::<f64>() {
            Ok(n) if n.is_finite() => s.trim().to_string(),
            _ => "null".to_string(),
        },
        _ => "null".to_string(),
    }
}

fn format_number(n: f64) -> String {
    format!("{}", n)
}

fn quote(s: &str) -> String {
    format!("\"{}\"", s.replace('\\', "\\\\").replace('"', "\\\""))
}

/// Render a time as `YYYY-MM-DDTHH:MM:SSZ` in UTC.
pub fn format_time(time: OffsetDateTime) -> String {
    let format = format_description!("[year]-[month]-[day]T[hour]:[minute]:[second]Z");
    time.to_offset(UtcOffset::UTC)
        .format(&format)
        .unwrap_or_else(|_| time.to_string())
}

fn time_from_millis(ms: f64) -> Option<OffsetDateTime> {
    if !ms.is_finite() {
        return None;
    }
    OffsetDateTime::from_unix_timestamp_nanos((ms as i128) * 1_000_000).ok()
}

/// Parse RFC 3339, `YYYY-MM-DDTHH:MM:SS` (taken as UTC) or a plain date.
pub fn parse_time(text: &str) -> Option<OffsetDateTime> {
    let text = text.trim();
    if let Ok(t) = OffsetDateTime::parse(text, &Rfc3339) {
        return Some(t);
    }
    let date_time = format_description!("[year]-[month]-[day]T[hour]:[minute]:[second]");
    if let Ok(t) = PrimitiveDateTime::parse(text, &date_time) {
        return Some(t.assume_utc());
    }
    let date = format_description!("[year]-[month]-[day]");
    Date::parse(text, &date)
        .ok()
        .map(|d| d.midnight().assume_utc())
}

#[cfg(test)]
mod tests {
    use super::*;
    use time::macros::datetime;

    #[test]
    fn value_types() {
        assert_eq!(Some(ValueType::Number), ValueType::from_erddap("double"));
        assert_eq!(Some(ValueType::Number), ValueType::from_erddap("float"));
        assert_eq!(Some(ValueType::Integer), ValueType::from_erddap("byte"));
        assert_eq!(Some(ValueType::String), ValueType::from_erddap("char"));
        assert_eq!(None, ValueType::from_erddap("geometry"));
        assert_eq!("Integer", ValueType::Integer.to_string());
    }

    #[test]
    fn number_encoding() {
        let c = EncodeContext::Constraint;
        assert_eq!("12.5", Encoder::Number.encode(&12.5_f64.into(), c));
        assert_eq!("null", Encoder::Number.encode(&f64::NAN.into(), c));
        assert_eq!("null", Encoder::Number.encode(&"abc".into(), c));
        assert_eq!("7", Encoder::Integer.encode(&" 7 ".into(), c));
        assert_eq!("-3", Encoder::Integer.encode(&(-3_i64).into(), c));
    }

    #[test]
    fn text_encoding() {
        let c = EncodeContext::Constraint;
        assert_eq!("\"abc\"", Encoder::Text.encode(&"abc".into(), c));
        assert_eq!("\"12.5\"", Encoder::Text.encode(&12.5_f64.into(), c));
        assert_eq!("\"a\\\"b\"", Encoder::Text.encode(&"a\"b".into(), c));
    }

    #[test]
    fn time_encoding() {
        let t = datetime!(2020-01-02 03:04:05 UTC);
        assert_eq!(
            "(2020-01-02T03:04:05Z)",
            Encoder::Time.encode(&t.into(), EncodeContext::Constraint)
        );
        assert_eq!(
            "2020-01-02T03:04:05Z",
            Encoder::Time.encode(&t.into(), EncodeContext::Tabledap)
        );
        assert_eq!(
            "(2020-01-02T00:00:00Z)",
            Encoder::Time.encode(&"2020-01-02".into(), EncodeContext::Constraint)
        );
        assert_eq!(
            "2021-06-01T12:00:00Z",
            Encoder::Time.encode(&"2021-06-01T13:00:00+01:00".into(), EncodeContext::Tabledap)
        );
        assert_eq!(
            "now-1day",
            Encoder::Time.encode(&"now-1day".into(), EncodeContext::Constraint)
        );
    }

    #[test]
    fn time_from_epoch_millis() {
        assert_eq!(
            "1970-01-01T00:00:01Z",
            Encoder::Time.encode(&1000.0_f64.into(), EncodeContext::Tabledap)
        );
    }
}
