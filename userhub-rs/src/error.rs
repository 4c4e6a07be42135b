//! Contains the errors surfaced by the [UserService](crate::service::UserService).
//!
//! Each component reports failures in its own terms ([StoreError], [CoalesceError] or a
//! [Rejection] of the rate limiter). These are mapped to a [ServiceError] which is then turned
//! into an HTTP response by [response](crate::response).
//!
//! Note that any **anyhow::Error** can be converted into a [ServiceError] and will then be
//! treated as internal error.
use std::fmt::{Display, Formatter};

use crate::coalescer::CoalesceError;
use crate::limiter::Rejection;
use crate::store::StoreError;

/// Enumerates the error kinds of the request pipeline.
#[derive(Debug)]
pub enum ServiceError {
    /// The request itself was malformed (e.g. an id which isn't a positive integer).
    InvalidRequest(String),
    /// The client exceeded one of its rate limits.
    RateLimited(Rejection),
    /// The requested user doesn't exist.
    NotFound(u64),
    /// The request waited for a fetch which has been reclaimed as stale.
    Timeout,
    /// Something unexpected went wrong.
    Internal(anyhow::Error),
}

impl ServiceError {
    /// Returns a short machine readable name of the error kind.
    pub fn kind(&self) -> &'static str {
        match self {
            ServiceError::InvalidRequest(_) => "invalid_request",
            ServiceError::RateLimited(_) => "rate_limited",
            ServiceError::NotFound(_) => "not_found",
            ServiceError::Timeout => "timeout",
            ServiceError::Internal(_) => "internal_error",
        }
    }
}

impl Display for ServiceError {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        match self {
            ServiceError::InvalidRequest(message) => write!(f, "{}", message),
            ServiceError::RateLimited(rejection) => write!(
                f,
                "Rate limit exceeded ({} tier). Retry after {}s.",
                rejection.tier, rejection.retry_after_s
            ),
            ServiceError::NotFound(id) => write!(f, "User {} not found", id),
            ServiceError::Timeout => write!(f, "The request timed out"),
            ServiceError::Internal(error) => write!(f, "Internal error: {}", error),
        }
    }
}

impl std::error::Error for ServiceError {}

/// Provides a simple way of creating a **ServiceError** which represents an invalid request.
///
/// # Example
///
/// ```
/// # use userhub::error::ServiceError;
/// let error = userhub::invalid_request!("Invalid user id: {}", "abc");
/// assert_eq!(error.to_string(), "Invalid user id: abc");
/// assert_eq!(error.kind(), "invalid_request");
/// ```
#[macro_export]
macro_rules! invalid_request {
    ($fmt:expr $(, $arg:expr)* $(,)?) => {
        $crate::error::ServiceError::InvalidRequest(format!($fmt $(, $arg)*))
    };
}

/// Provides a simple way of creating a **ServiceError** which represents an internal error.
///
/// # Example
///
/// ```
/// let error = userhub::internal_error!("The store is gone");
/// assert_eq!(error.kind(), "internal_error");
/// ```
#[macro_export]
macro_rules! internal_error {
    ($err:expr $(,)?) => ({
        $crate::error::ServiceError::Internal(anyhow::anyhow!($err))
    });
    ($fmt:expr, $($arg:tt)*) => {
        $crate::error::ServiceError::Internal(anyhow::anyhow!($fmt, $($arg)*))
    };
}

impl From<anyhow::Error> for ServiceError {
    fn from(error: anyhow::Error) -> Self {
        ServiceError::Internal(error)
    }
}

impl From<StoreError> for ServiceError {
    fn from(error: StoreError) -> Self {
        match error {
            StoreError::NotFound(id) => ServiceError::NotFound(id),
            StoreError::Failure(message) => ServiceError::Internal(anyhow::anyhow!(message)),
        }
    }
}

impl From<CoalesceError<StoreError>> for ServiceError {
    fn from(error: CoalesceError<StoreError>) -> Self {
        match error {
            CoalesceError::Failed(error) => error.into(),
            CoalesceError::Timeout => ServiceError::Timeout,
            CoalesceError::Abandoned => {
                ServiceError::Internal(anyhow::anyhow!("The fetch was abandoned"))
            }
        }
    }
}

/// Represents the outcome of a service operation.
pub type ServiceResult<T> = std::result::Result<T, ServiceError>;

#[cfg(test)]
mod tests {
    use crate::coalescer::CoalesceError;
    use crate::error::ServiceError;
    use crate::store::StoreError;

    #[test]
    fn coalescer_errors_are_mapped() {
        let error: ServiceError = CoalesceError::Failed(StoreError::NotFound(999)).into();
        assert_eq!(error.kind(), "not_found");
        assert_eq!(error.to_string(), "User 999 not found");

        let error: ServiceError =
            CoalesceError::Failed(StoreError::Failure("disk on fire".to_owned())).into();
        assert_eq!(error.kind(), "internal_error");

        let error: ServiceError = CoalesceError::<StoreError>::Timeout.into();
        assert_eq!(error.kind(), "timeout");

        let error: ServiceError = CoalesceError::<StoreError>::Abandoned.into();
        assert_eq!(error.kind(), "internal_error");
    }
}
