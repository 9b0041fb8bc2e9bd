/*!
 * Error taxonomy for the session manager
 */

use thiserror::Error;

pub type Result<T> = std::result::Result<T, Error>;

#[derive(Debug, Error)]
pub enum Error {
    /// Not Linux, or not a board exposing a device-tree model.
    #[error("unsupported host: {0}")]
    UnsupportedHost(String),

    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    #[error("adapter operation failed: {0}")]
    Adapter(#[source] AdapterError),

    #[error("pairing agent registration failed: {0}")]
    AgentRegistration(String),

    /// Device enumeration failed mid-sampling; the partial snapshot is dropped.
    #[error("device sampling failed: {0}")]
    Sample(#[source] AdapterError),

    #[error("i/o error: {0}")]
    Io(#[from] std::io::Error),

    #[error("process error: {0}")]
    Process(String),

    #[error("a discoverability session is already running")]
    Busy,
}

impl From<AdapterError> for Error {
    fn from(err: AdapterError) -> Self {
        Error::Adapter(err)
    }
}

#[derive(Debug, Error)]
pub enum AdapterError {
    #[error("D-Bus call failed: {0}")]
    Bus(#[from] dbus::Error),

    #[error("no Bluetooth adapter found")]
    NotFound,

    #[error("adapter property {0} missing or mistyped")]
    Property(&'static str),

    #[error("adapter is powered off")]
    NotPowered,

    #[error("alias cannot be empty")]
    EmptyAlias,

    #[error("{0}")]
    Backend(String),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn adapter_errors_convert_into_adapter_variant() {
        let err: Error = AdapterError::NotPowered.into();
        assert!(matches!(err, Error::Adapter(AdapterError::NotPowered)));
        assert_eq!(err.to_string(), "adapter operation failed: adapter is powered off");
    }

    #[test]
    fn sample_error_keeps_its_cause() {
        let err = Error::Sample(AdapterError::Backend("bus went away".into()));
        let source = std::error::Error::source(&err).map(|s| s.to_string());
        assert_eq!(source.as_deref(), Some("bus went away"));
    }
}
