use std::time::Duration;
use thiserror::Error;

/// Failures establishing or using the link to the mesh node.
#[derive(Debug, Error)]
pub enum ConnectionError {
    /// Host name did not resolve to any address.
    #[error("could not resolve {endpoint}: {detail}")]
    Resolve { endpoint: String, detail: String },

    #[error("connection to {endpoint} refused")]
    Refused { endpoint: String },

    /// Socket connect or radio handshake exceeded the configured timeout.
    #[error("connection to {endpoint} timed out after {}ms", timeout.as_millis())]
    TimedOut { endpoint: String, timeout: Duration },

    #[error("connection to {endpoint} reset: {detail}")]
    Reset { endpoint: String, detail: String },

    #[error("not connected to a mesh node")]
    NotConnected,

    /// A disconnect raced the connect and won.
    #[error("connect cancelled by disconnect")]
    Cancelled,

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    /// Blocking worker running the operation failed (panic or runtime shutdown).
    #[error("connection worker failed: {0}")]
    Worker(String),
}

impl ConnectionError {
    /// Classify a driver I/O error for the given endpoint.
    pub fn from_io(endpoint: &str, timeout: Duration, err: std::io::Error) -> Self {
        use std::io::ErrorKind;
        let endpoint = endpoint.to_string();
        match err.kind() {
            ErrorKind::ConnectionRefused => ConnectionError::Refused { endpoint },
            ErrorKind::TimedOut | ErrorKind::WouldBlock => {
                ConnectionError::TimedOut { endpoint, timeout }
            }
            ErrorKind::ConnectionReset
            | ErrorKind::ConnectionAborted
            | ErrorKind::BrokenPipe
            | ErrorKind::UnexpectedEof => ConnectionError::Reset {
                endpoint,
                detail: err.to_string(),
            },
            ErrorKind::NotFound | ErrorKind::InvalidInput => ConnectionError::Resolve {
                endpoint,
                detail: err.to_string(),
            },
            ErrorKind::NotConnected => ConnectionError::NotConnected,
            _ => ConnectionError::Io(err),
        }
    }
}

/// A driver notification that could not be turned into a domain value.
#[derive(Debug, Error)]
pub enum TranslationFault {
    #[error("{what} carries no node identifier")]
    MissingNodeId { what: &'static str },

    #[error("malformed node id '{0}'")]
    BadNodeId(String),

    #[error("packet 0x{0:08x} has no decoded payload")]
    Undecoded(u32),

    #[error("text payload is not valid UTF-8: {0}")]
    InvalidUtf8(#[from] std::str::Utf8Error),

    #[error("position out of range: lat={lat} lon={lon}")]
    PositionOutOfRange { lat: f64, lon: f64 },

    #[error("acknowledgment without a request id")]
    MissingRequestId,

    #[error("channel index {0} out of range")]
    BadChannelIndex(i32),

    #[error("translation panicked: {0}")]
    Panicked(String),
}

/// Failures of the local state store.
#[derive(Debug, Error)]
pub enum StorageError {
    #[error("sqlite error: {0}")]
    Sqlite(#[from] rusqlite::Error),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    /// Lock contention outlasted the retry budget.
    #[error("database busy after {attempts} attempts: {source}")]
    Busy {
        attempts: u32,
        #[source]
        source: rusqlite::Error,
    },

    /// A stored value could not be mapped back into the domain model.
    #[error("corrupt row: {0}")]
    Corrupt(String),
}

/// Errors surfaced by the consumer façade.
#[derive(Debug, Error)]
pub enum ClientError {
    #[error(transparent)]
    Connection(#[from] ConnectionError),

    #[error(transparent)]
    Storage(#[from] StorageError),

    #[error("invalid message: {0}")]
    InvalidMessage(String),
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::{Error, ErrorKind};

    #[test]
    fn io_errors_are_classified() {
        let t = Duration::from_millis(500);
        assert!(matches!(
            ConnectionError::from_io("h:1", t, Error::from(ErrorKind::ConnectionRefused)),
            ConnectionError::Refused { .. }
        ));
        assert!(matches!(
            ConnectionError::from_io("h:1", t, Error::from(ErrorKind::TimedOut)),
            ConnectionError::TimedOut { .. }
        ));
        assert!(matches!(
            ConnectionError::from_io("h:1", t, Error::from(ErrorKind::BrokenPipe)),
            ConnectionError::Reset { .. }
        ));
        let msg = ConnectionError::from_io("h:1", t, Error::from(ErrorKind::TimedOut)).to_string();
        assert!(msg.contains("500ms"), "{}", msg);
    }
}
