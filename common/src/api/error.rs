// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Error handling facilities for the copy-on-write VM control plane
//!
//! For HTTP-level error handling, see Dropshot.

use dropshot::ClientErrorStatusCode;
use dropshot::HttpError;
use serde::Deserialize;
use serde::Serialize;
use std::fmt::Display;
use uuid::Uuid;

/// The kinds of objects an [`Error::ObjectNotFound`] can refer to
#[derive(
    Clone,
    Copy,
    Debug,
    Deserialize,
    Eq,
    PartialEq,
    Serialize,
    strum::Display,
)]
#[strum(serialize_all = "kebab-case")]
pub enum ResourceType {
    Instance,
    Host,
    Artifact,
    Network,
}

/// An error that can be generated within a control plane component
///
/// These may be generated while handling a client request or as part of
/// background operation.  When generated as part of an HTTP request, an
/// `Error` will be converted into an HTTP error as one of the last steps in
/// processing the request.  This allows most of the system to remain agnostic
/// to the transport with which the system communicates with clients.
#[derive(Clone, Debug, Deserialize, thiserror::Error, PartialEq, Serialize)]
pub enum Error {
    /// An object needed as part of this operation was not found.
    #[error("Object (of type {lookup_type:?}) not found: {type_name}")]
    ObjectNotFound { type_name: ResourceType, lookup_type: LookupType },
    /// The request was well-formed, but the operation cannot be completed given
    /// the current state of the system.
    #[error("Invalid Request: {message}")]
    InvalidRequest { message: String },
    /// A quota or other resource limit would be exceeded.
    #[error("Insufficient Capacity: {message}")]
    InsufficientCapacity { message: String },
    /// The operation conflicts with one already in progress on the object.
    #[error("Conflict: {message}")]
    Conflict { message: String },

    /// The system encountered an unhandled operational error.
    #[error("Internal Error: {internal_message}")]
    InternalError { internal_message: String },
    /// The system (or part of it) is unavailable.
    #[error("Service Unavailable: {internal_message}")]
    ServiceUnavailable { internal_message: String },
}

/// Indicates how an object was looked up (for an `ObjectNotFound` error)
#[derive(Clone, Debug, Deserialize, PartialEq, Serialize)]
pub enum LookupType {
    /// a specific id was requested
    ById(Uuid),
}

impl LookupType {
    /// Returns an ObjectNotFound error appropriate for the case where this
    /// lookup failed
    pub fn into_not_found(self, type_name: ResourceType) -> Error {
        Error::ObjectNotFound { type_name, lookup_type: self }
    }
}

impl From<Uuid> for LookupType {
    fn from(uuid: Uuid) -> Self {
        LookupType::ById(uuid)
    }
}

impl Error {
    /// Returns whether the error is likely transient and could reasonably be
    /// retried
    pub fn retryable(&self) -> bool {
        match self {
            Error::ServiceUnavailable { .. } => true,

            Error::ObjectNotFound { .. }
            | Error::InvalidRequest { .. }
            | Error::InsufficientCapacity { .. }
            | Error::Conflict { .. }
            | Error::InternalError { .. } => false,
        }
    }

    /// Generates an [`Error::ObjectNotFound`] error for a lookup by object id.
    pub fn not_found_by_id(type_name: ResourceType, id: &Uuid) -> Error {
        LookupType::ById(*id).into_not_found(type_name)
    }

    /// Generates an [`Error::InternalError`] error with the specific message
    ///
    /// InternalError should be used for operational conditions that should not
    /// happen but that we cannot reasonably handle at runtime (e.g., a
    /// hypervisor command failing, or finding a malformed metadata tag).
    pub fn internal_error(internal_message: &str) -> Error {
        Error::InternalError { internal_message: internal_message.to_owned() }
    }

    /// Generates an [`Error::InvalidRequest`] error with the specific message
    ///
    /// This should be used for failures due possibly to invalid client input
    /// or requests made against an instance in the wrong state.
    pub fn invalid_request(message: &str) -> Error {
        Error::InvalidRequest { message: message.to_owned() }
    }

    /// Generates an [`Error::ServiceUnavailable`] error with the specific
    /// message
    ///
    /// This should be used for transient failures where the caller might be
    /// expected to retry.  Logic errors or other problems indicating that a
    /// retry would not work should probably be an InternalError (if it's a
    /// server problem) or InvalidRequest (if it's a client problem) instead.
    pub fn unavail(message: &str) -> Error {
        Error::ServiceUnavailable { internal_message: message.to_owned() }
    }

    /// Generates an [`Error::Conflict`] error with the specific message
    pub fn conflict(message: &str) -> Error {
        Error::Conflict { message: message.to_owned() }
    }

    /// Generates an [`Error::InsufficientCapacity`] error with the specific
    /// message
    pub fn insufficient_capacity(message: &str) -> Error {
        Error::InsufficientCapacity { message: message.to_owned() }
    }

    /// Given an [`Error`] with an internal message, return the same error with
    /// `context` prepended to it to provide more context
    ///
    /// If the error has no internal message, then it is returned unchanged.
    pub fn internal_context<C>(self, context: C) -> Error
    where
        C: Display + Send + Sync + 'static,
    {
        match self {
            Error::ObjectNotFound { .. }
            | Error::InvalidRequest { .. }
            | Error::InsufficientCapacity { .. }
            | Error::Conflict { .. } => self,
            Error::InternalError { internal_message } => Error::InternalError {
                internal_message: format!("{}: {}", context, internal_message),
            },
            Error::ServiceUnavailable { internal_message } => {
                Error::ServiceUnavailable {
                    internal_message: format!(
                        "{}: {}",
                        context, internal_message
                    ),
                }
            }
        }
    }
}

/// Result of a create operation for the specified type
pub type CreateResult<T> = Result<T, Error>;
/// Result of a delete operation for the specified type
pub type DeleteResult = Result<(), Error>;
/// Result of a list operation that returns a vector
pub type ListResultVec<T> = Result<Vec<T>, Error>;
/// Result of a lookup operation for the specified type
pub type LookupResult<T> = Result<T, Error>;
/// Result of an update operation for the specified type
pub type UpdateResult<T> = Result<T, Error>;

impl From<Error> for HttpError {
    /// Converts an `Error` error into an `HttpError`.  This defines how
    /// errors that are represented internally using `Error` are ultimately
    /// exposed to clients over HTTP.
    fn from(error: Error) -> HttpError {
        match error {
            Error::ObjectNotFound { type_name: t, lookup_type: lt } => {
                let LookupType::ById(id) = lt;
                let message = format!("not found: {} with id \"{}\"", t, id);
                HttpError::for_client_error(
                    Some(String::from("ObjectNotFound")),
                    ClientErrorStatusCode::NOT_FOUND,
                    message,
                )
            }

            Error::InvalidRequest { message } => HttpError::for_bad_request(
                Some(String::from("InvalidRequest")),
                message,
            ),

            // Quota failures have historically been reported as "request
            // entity too large" by this API.
            Error::InsufficientCapacity { message } => {
                HttpError::for_client_error(
                    Some(String::from("InstanceLimitExceeded")),
                    ClientErrorStatusCode::PAYLOAD_TOO_LARGE,
                    message,
                )
            }

            Error::Conflict { message } => HttpError::for_client_error(
                Some(String::from("Conflict")),
                ClientErrorStatusCode::CONFLICT,
                message,
            ),

            Error::InternalError { internal_message } => {
                HttpError::for_internal_error(internal_message)
            }

            Error::ServiceUnavailable { internal_message } => {
                HttpError::for_unavail(
                    Some(String::from("ServiceNotAvailable")),
                    internal_message,
                )
            }
        }
    }
}

impl From<serde_json::Error> for Error {
    fn from(e: serde_json::Error) -> Self {
        Error::internal_error(&e.to_string())
    }
}

#[cfg(test)]
mod test {
    use super::Error;
    use super::ResourceType;
    use dropshot::HttpError;
    use uuid::Uuid;

    #[test]
    fn test_context() {
        match Error::internal_error("boom").internal_context("uh-oh") {
            Error::InternalError { internal_message } => {
                assert_eq!(internal_message, "uh-oh: boom");
            }
            _ => panic!("returned wrong type"),
        };

        match Error::unavail("boom").internal_context(format!("#{}", 2)) {
            Error::ServiceUnavailable { internal_message } => {
                assert_eq!(internal_message, "#2: boom");
            }
            _ => panic!("returned wrong type"),
        };

        // Precondition failures carry no internal message to extend.
        assert_eq!(
            Error::invalid_request("nope").internal_context("foo"),
            Error::invalid_request("nope")
        );
    }

    #[test]
    fn test_http_status_codes() {
        let cases = [
            (
                Error::not_found_by_id(ResourceType::Instance, &Uuid::new_v4()),
                404,
            ),
            (Error::invalid_request("wrong state"), 400),
            (Error::insufficient_capacity("quota"), 413),
            (Error::conflict("already migrating"), 409),
            (Error::unavail("timed out"), 503),
            (Error::internal_error("boom"), 500),
        ];
        for (error, status) in cases {
            let http_error = HttpError::from(error.clone());
            assert_eq!(
                http_error.status_code.as_u16(),
                status,
                "wrong status for {error}"
            );
        }
    }

    #[test]
    fn test_retryable() {
        assert!(Error::unavail("transient").retryable());
        assert!(!Error::invalid_request("bad").retryable());
        assert!(!Error::conflict("busy").retryable());
    }
}
