//! Error handling.

use thiserror::Error;

/// ERDDAP explorer error type
///
/// This type encapsulates the various errors that may occur while talking to ERDDAP servers and
/// deriving indices from their responses. The type is [Clone] so that the outcome of a single
/// shared request can be handed to every caller waiting on it.
#[derive(Clone, Debug, Error, PartialEq)]
pub enum ErddapError {
    /// Error reading or writing the response cache
    #[error("response cache error: {error}")]
    CacheError { error: String },

    /// Server responded with a non-success status code
    #[error("request to {url} failed with status {status}")]
    HttpStatus { url: String, status: u16 },

    /// Response body was not the JSON shape expected
    #[error("invalid response from {url}: {error}")]
    InvalidResponse { url: String, error: String },

    /// Transport failed to load the URL
    #[error("network error requesting {url}: {error}")]
    Network { url: String, error: String },

    /// Composite-only operation called on a leaf index
    #[error("operation requires a composite datasets index")]
    NotCompositeIndex,

    /// Leaf-only operation called on a composite index
    #[error("operation requires a datasets index bound to an ERDDAP client")]
    NotLeafIndex,

    /// Malformed latitude range in a bounding box
    #[error("out of bounds lat range {south}-{north}")]
    OutOfBoundsLatitude { south: f64, north: f64 },

    /// The politeness queue dropped a request before completing it
    #[error("politeness queue closed before request completed")]
    QueueClosed,

    /// Transport did not complete within the configured interval
    #[error("timeout requesting {url}")]
    Timeout { url: String },

    /// Requested dataset is absent from the server's search results
    #[error("Unknown dataset: [{dataset_id}]")]
    UnknownDataset { dataset_id: String },

    /// Constraint requested on a variable the dataset does not declare
    #[error("Unknown variable [{variable}] for {dataset_id}")]
    UnknownVariable {
        dataset_id: String,
        variable: String,
    },

    /// Variable declared with a data type that has no encoder
    #[error("Unknown type [{type_name}] for {dataset_id}.{variable}")]
    UnknownType {
        dataset_id: String,
        variable: String,
        type_name: String,
    },
}

impl ErddapError {
    /// Returns true for failures of the transport itself.
    pub fn is_transport(&self) -> bool {
        matches!(
            self,
            Self::Timeout { .. } | Self::Network { .. } | Self::HttpStatus { .. }
        )
    }
}

/// Result type alias used throughout the crate.
pub type Result<T, E = ErddapError> = std::result::Result<T, E>;

#[cfg(test)]
mod tests {
    use super::*;

    fn test_message(error: ErddapError, message: &str) {
        assert_eq!(message, error.to_string());
    }

    #[test]
    fn timeout() {
        let error = ErddapError::Timeout {
            url: "http://example.com/erddap".to_string(),
        };
        assert!(error.is_transport());
        test_message(error, "timeout requesting http://example.com/erddap");
    }

    #[test]
    fn http_status() {
        let error = ErddapError::HttpStatus {
            url: "http://example.com".to_string(),
            status: 404,
        };
        assert!(error.is_transport());
        test_message(error, "request to http://example.com failed with status 404");
    }

    #[test]
    fn unknown_dataset() {
        let error = ErddapError::UnknownDataset {
            dataset_id: "foo".to_string(),
        };
        assert!(!error.is_transport());
        test_message(error, "Unknown dataset: [foo]");
    }

    #[test]
    fn unknown_type() {
        let error = ErddapError::UnknownType {
            dataset_id: "foo".to_string(),
            variable: "bar".to_string(),
            type_name: "geometry".to_string(),
        };
        test_message(error, "Unknown type [geometry] for foo.bar");
    }

    #[test]
    fn out_of_bounds_latitude() {
        let error = ErddapError::OutOfBoundsLatitude {
            south: 50.0,
            north: 10.0,
        };
        test_message(error, "out of bounds lat range 50-10");
    }

    #[test]
    fn cache_error() {
        let error = ErddapError::CacheError {
            error: "quota exceeded".to_string(),
        };
        assert!(!error.is_transport());
        test_message(error, "response cache error: quota exceeded");
    }
}
