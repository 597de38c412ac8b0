//! Error types for the compose-post service.
//!
//! This module defines the central `Error` enum, which captures all
//! reportable error cases at the gRPC boundary. It implements `From<Error>`
//! for `tonic::Status` to propagate failures to clients with appropriate
//! status codes and messages.
//!
//! ## Error Cases
//! - `Core`: A failure inside the `warble` write path (component buffer,
//!   id generation, broker, pool, or storage).
//! - `InvalidRequest`: The client request was malformed or exceeded bounds.
//! - `ServiceShutdown`: A request arrived while the service was shutting
//!   down.

use tonic::Status;

pub type Result<T> = core::result::Result<T, Error>;

/// Unified error type for the compose-post service.
#[derive(Clone, thiserror::Error, Debug)]
pub enum Error {
    /// A compose, id-generation, broker, or storage failure.
    #[error("Compose error: {0}")]
    Core(#[from] warble::Error),

    /// The client request was invalid or exceeded constraints.
    #[error("Invalid request: {reason}")]
    InvalidRequest { reason: String },

    /// The service is in the process of shutting down.
    #[error("Service is shutting down")]
    ServiceShutdown,
}

impl From<Error> for Status {
    fn from(err: Error) -> Self {
        match err {
            Error::Core(core) => core_status(core),
            Error::InvalidRequest { reason } => Status::invalid_argument(reason),
            Error::ServiceShutdown => Status::unavailable("Service is shutting down"),
        }
    }
}

/// Maps core write-path failures onto gRPC status codes. Anything the
/// client can fix is a precondition or argument problem; infrastructure
/// failures surface as unavailable so clients know to retry elsewhere.
fn core_status(err: warble::Error) -> Status {
    use warble::Error as Core;
    match &err {
        Core::MissingComponent { .. }
        | Core::NonMonotonicClock { .. }
        | Core::ClockBeforeEpoch { .. } => Status::failed_precondition(err.to_string()),
        Core::InvalidMachineId { .. } => Status::invalid_argument(err.to_string()),
        Core::PoolTimeout { .. } => Status::resource_exhausted(err.to_string()),
        Core::StoreUnavailable { .. }
        | Core::PoolClosed
        | Core::BrokerClosed
        | Core::ChannelClosed => Status::unavailable(err.to_string()),
        _ => Status::internal(err.to_string()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn core_errors_map_to_useful_status_codes() {
        let missing = Error::Core(warble::Error::MissingComponent {
            req_id: 7,
            field: warble::ComponentField::PostId,
        });
        assert_eq!(
            Status::from(missing).code(),
            tonic::Code::FailedPrecondition
        );

        let timeout = Error::Core(warble::Error::PoolTimeout { waited_ms: 5000 });
        assert_eq!(Status::from(timeout).code(), tonic::Code::ResourceExhausted);

        let closed = Error::Core(warble::Error::BrokerClosed);
        assert_eq!(Status::from(closed).code(), tonic::Code::Unavailable);
    }

    #[test]
    fn request_errors_blame_the_client() {
        let invalid = Error::InvalidRequest {
            reason: "unknown post type code 9".to_owned(),
        };
        assert_eq!(Status::from(invalid).code(), tonic::Code::InvalidArgument);

        assert_eq!(
            Status::from(Error::ServiceShutdown).code(),
            tonic::Code::Unavailable
        );
    }
}
