use thiserror::Error;

use crate::validation::ValidationError;

#[derive(Error, Debug)]
pub enum Error {
    /// Malformed request input; never retried
    #[error("Validation error: {0}")]
    Validation(String),

    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Duplicate endpoint: {0}")]
    DuplicateEndpoint(String),

    /// Discovery found no usable endpoint for the service
    #[error("No endpoints available for network service \"{0}\"")]
    NoEndpointsAvailable(String),

    /// The caller refers to a generation that has been superseded
    #[error("Stale generation: {0}")]
    StaleGeneration(String),

    #[error("Persistence error: {0}")]
    Persistence(String),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("RPC error: {0}")]
    Rpc(String),

    #[error("Timeout: {0}")]
    Timeout(String),

    #[error("Configuration error: {0}")]
    Configuration(String),

    #[error("Internal error: {0}")]
    Internal(String),
}

impl From<ValidationError> for Error {
    fn from(err: ValidationError) -> Self {
        Self::Validation(err.to_string())
    }
}

impl From<Error> for tonic::Status {
    fn from(err: Error) -> Self {
        match err {
            Error::Validation(msg) => Self::invalid_argument(msg),
            Error::NotFound(msg) => Self::not_found(msg),
            Error::DuplicateEndpoint(msg) => Self::already_exists(msg),
            err @ Error::NoEndpointsAvailable(_) => Self::unavailable(err.to_string()),
            Error::StaleGeneration(msg) => Self::failed_precondition(msg),
            Error::Timeout(msg) => Self::deadline_exceeded(msg),
            other => {
                tracing::error!("Internal error: {other}");
                Self::internal("Internal error")
            }
        }
    }
}

impl From<tonic::Status> for Error {
    fn from(status: tonic::Status) -> Self {
        let msg = status.message().to_string();
        match status.code() {
            tonic::Code::InvalidArgument => Self::Validation(msg),
            tonic::Code::NotFound => Self::NotFound(msg),
            tonic::Code::AlreadyExists => Self::DuplicateEndpoint(msg),
            tonic::Code::Unavailable => Self::NoEndpointsAvailable(msg),
            tonic::Code::FailedPrecondition => Self::StaleGeneration(msg),
            tonic::Code::DeadlineExceeded => Self::Timeout(msg),
            code => Self::Rpc(format!("{code:?}: {msg}")),
        }
    }
}

pub type Result<T> = std::result::Result<T, Error>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_status_mapping() {
        let status: tonic::Status = Error::Validation("bad".to_string()).into();
        assert_eq!(status.code(), tonic::Code::InvalidArgument);

        let status: tonic::Status = Error::NotFound("e1".to_string()).into();
        assert_eq!(status.code(), tonic::Code::NotFound);

        let status: tonic::Status = Error::DuplicateEndpoint("e1".to_string()).into();
        assert_eq!(status.code(), tonic::Code::AlreadyExists);

        let status: tonic::Status = Error::NoEndpointsAvailable("icmp".to_string()).into();
        assert_eq!(status.code(), tonic::Code::Unavailable);
        assert!(status.message().contains("icmp"));

        let status: tonic::Status = Error::StaleGeneration("gen 0".to_string()).into();
        assert_eq!(status.code(), tonic::Code::FailedPrecondition);

        let status: tonic::Status = Error::Persistence("redis down".to_string()).into();
        assert_eq!(status.code(), tonic::Code::Internal);
        assert_eq!(status.message(), "Internal error");
    }

    #[test]
    fn test_status_round_trip_keeps_kind() {
        let err: Error = tonic::Status::not_found("endpoint e1").into();
        assert!(matches!(err, Error::NotFound(msg) if msg == "endpoint e1"));

        let err: Error = tonic::Status::permission_denied("nope").into();
        assert!(matches!(err, Error::Rpc(_)));
    }

    #[test]
    fn test_validation_error_conversion() {
        let err: Error = ValidationError::Multiple("a; b".to_string()).into();
        assert!(matches!(err, Error::Validation(msg) if msg.contains("a; b")));
    }
}
