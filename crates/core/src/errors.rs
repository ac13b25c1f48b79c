use thiserror::Error;

use crate::domain::reservation::{ReservationId, ReservationStatus};

#[derive(Clone, Debug, Error, PartialEq, Eq)]
pub enum KeyError {
    #[error("malformed key `{key}`: {reason}")]
    Malformed { key: String, reason: &'static str },
}

#[derive(Clone, Debug, Error, PartialEq, Eq)]
pub enum DomainError {
    #[error("invalid reservation transition from {from} to {to}")]
    InvalidTransition { from: ReservationStatus, to: ReservationStatus },
    #[error("validation failed: {0}")]
    Validation(String),
}

#[derive(Clone, Debug, Error, PartialEq, Eq)]
pub enum ReservationError {
    #[error("validation failed: {0}")]
    Validation(String),
    #[error("reservation {0} was not found")]
    NotFound(ReservationId),
    #[error("invalid reservation transition from {from} to {to}")]
    InvalidTransition { from: ReservationStatus, to: ReservationStatus },
    #[error("capacity exceeded for {date} {time}: requested {requested}, available {available}")]
    CapacityExceeded { date: String, time: String, requested: u32, available: u32 },
    #[error("reservation {0} is already cancelled")]
    AlreadyCancelled(ReservationId),
    #[error("reservation store unavailable: {0}")]
    StoreUnavailable(String),
    #[error(transparent)]
    MalformedKey(#[from] KeyError),
}

impl ReservationError {
    pub fn is_transient(&self) -> bool {
        matches!(self, Self::StoreUnavailable(_))
    }
}

impl From<DomainError> for ReservationError {
    fn from(value: DomainError) -> Self {
        match value {
            DomainError::InvalidTransition { from, to } => Self::InvalidTransition { from, to },
            DomainError::Validation(message) => Self::Validation(message),
        }
    }
}

#[derive(Clone, Debug, Error, PartialEq, Eq)]
pub enum SessionError {
    #[error("session store unavailable: {0}")]
    StoreUnavailable(String),
    #[error(transparent)]
    MalformedKey(#[from] KeyError),
    #[error("session {user_id} kept changing underneath {attempts} write attempts")]
    Conflict { user_id: String, attempts: u32 },
}

#[derive(Clone, Debug, Error, PartialEq, Eq)]
pub enum InterfaceError {
    #[error("bad request: {message}")]
    BadRequest { message: String, correlation_id: String },
    #[error("not found: {message}")]
    NotFound { message: String, correlation_id: String },
    #[error("service unavailable: {message}")]
    ServiceUnavailable { message: String, correlation_id: String },
    #[error("internal error: {message}")]
    Internal { message: String, correlation_id: String },
}

impl InterfaceError {
    pub fn user_message(&self) -> &'static str {
        match self {
            Self::BadRequest { .. } => {
                "The request could not be processed. Check inputs and try again."
            }
            Self::NotFound { .. } => "The requested resource was not found.",
            Self::ServiceUnavailable { .. } => {
                "The service is temporarily unavailable. Please retry shortly."
            }
            Self::Internal { .. } => "An unexpected internal error occurred.",
        }
    }

    pub fn status_code(&self) -> u16 {
        match self {
            Self::BadRequest { .. } => 400,
            Self::NotFound { .. } => 404,
            Self::ServiceUnavailable { .. } => 503,
            Self::Internal { .. } => 500,
        }
    }

    pub fn correlation_id(&self) -> &str {
        match self {
            Self::BadRequest { correlation_id, .. }
            | Self::NotFound { correlation_id, .. }
            | Self::ServiceUnavailable { correlation_id, .. }
            | Self::Internal { correlation_id, .. } => correlation_id,
        }
    }

    pub fn with_correlation(mut self, correlation_id: impl Into<String>) -> Self {
        match &mut self {
            Self::BadRequest { correlation_id: id, .. }
            | Self::NotFound { correlation_id: id, .. }
            | Self::ServiceUnavailable { correlation_id: id, .. }
            | Self::Internal { correlation_id: id, .. } => *id = correlation_id.into(),
        }
        self
    }
}

impl From<ReservationError> for InterfaceError {
    fn from(value: ReservationError) -> Self {
        let correlation_id = "unassigned".to_owned();
        match value {
            ReservationError::NotFound(id) => {
                Self::NotFound { message: format!("reservation {id}"), correlation_id }
            }
            ReservationError::Validation(_)
            | ReservationError::InvalidTransition { .. }
            | ReservationError::CapacityExceeded { .. }
            | ReservationError::AlreadyCancelled(_) => {
                Self::BadRequest { message: value.to_string(), correlation_id }
            }
            ReservationError::StoreUnavailable(message) => {
                Self::ServiceUnavailable { message, correlation_id }
            }
            ReservationError::MalformedKey(error) => {
                Self::ServiceUnavailable { message: error.to_string(), correlation_id }
            }
        }
    }
}

impl From<SessionError> for InterfaceError {
    fn from(value: SessionError) -> Self {
        Self::ServiceUnavailable { message: value.to_string(), correlation_id: "unassigned".into() }
    }
}

#[cfg(test)]
mod tests {
    use crate::domain::reservation::{ReservationId, ReservationStatus};
    use crate::errors::{DomainError, InterfaceError, KeyError, ReservationError, SessionError};

    #[test]
    fn domain_error_maps_to_bad_request_interface_error() {
        let interface = InterfaceError::from(ReservationError::from(
            DomainError::InvalidTransition {
                from: ReservationStatus::Cancelled,
                to: ReservationStatus::Confirmed,
            },
        ))
        .with_correlation("req-1");

        assert!(matches!(
            interface,
            InterfaceError::BadRequest { ref correlation_id, .. } if correlation_id == "req-1"
        ));
        assert_eq!(interface.status_code(), 400);
        assert_eq!(
            interface.user_message(),
            "The request could not be processed. Check inputs and try again."
        );
    }

    #[test]
    fn not_found_maps_to_404() {
        let interface =
            InterfaceError::from(ReservationError::NotFound(ReservationId("RES-X".to_string())));
        assert_eq!(interface.status_code(), 404);
    }

    #[test]
    fn storage_failures_map_to_service_unavailable() {
        let unavailable =
            InterfaceError::from(ReservationError::StoreUnavailable("timed out".to_owned()));
        assert!(matches!(unavailable, InterfaceError::ServiceUnavailable { .. }));
        assert_eq!(unavailable.status_code(), 503);

        let malformed = InterfaceError::from(ReservationError::from(KeyError::Malformed {
            key: "X|Y".to_string(),
            reason: "unknown partition prefix",
        }));
        assert_eq!(malformed.status_code(), 503);

        let session = InterfaceError::from(SessionError::Conflict {
            user_id: "u".to_string(),
            attempts: 3,
        });
        assert_eq!(
            session.user_message(),
            "The service is temporarily unavailable. Please retry shortly."
        );
    }
}
