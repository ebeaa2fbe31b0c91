use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
};
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Errors thay may occur in this library.
#[derive(Debug, Clone, Error, Serialize, Deserialize, PartialEq, Eq)]
pub enum Error {
    /// The device could not be opened.
    /// Missing, busy, or no permission.
    #[error("Could not open device `{device}`. Problem: {problem}")]
    Open {
        /// The device name.
        device: String,

        /// What the operating system (or mock) said.
        problem: String,
    },

    /// The device is already open.
    #[error("The device `{0}` is already connected")]
    AlreadyConnected(String),

    /// No open device has this name.
    #[error("{0} not found")]
    NotFound(String),

    /// Reading from the device failed.
    /// The device is considered gone after this.
    #[error("Reading from `{device}` failed. Problem: {problem}")]
    Read {
        /// The device name.
        device: String,

        /// The underlying problem.
        problem: String,
    },

    /// Writing to the device failed, or the device is no longer accepting writes.
    #[error("Writing to `{device}` failed. Problem: {problem}")]
    Write {
        /// The device name.
        device: String,

        /// The underlying problem.
        problem: String,
    },

    /// The web server could not start or stopped unexpectedly.
    #[error("Server problem: {0}")]
    Server(String),

    /// The configuration could not be parsed or is not valid.
    #[error("Bad config. Problem: {0}")]
    BadConfig(String),
}

impl Error {
    /// Get the problem description if this was a bad config error.
    pub fn try_into_bad_config(self) -> Result<String, Self> {
        if let Self::BadConfig(problem) = self {
            Ok(problem)
        } else {
            Err(self)
        }
    }
}

impl IntoResponse for Error {
    fn into_response(self) -> Response {
        let status = match &self {
            Error::NotFound(_) => StatusCode::NOT_FOUND,
            Error::AlreadyConnected(_) => StatusCode::CONFLICT,
            Error::BadConfig(_) => StatusCode::BAD_REQUEST,
            Error::Open { .. } | Error::Read { .. } | Error::Write { .. } | Error::Server(_) => {
                StatusCode::INTERNAL_SERVER_ERROR
            }
        };

        (status, self.to_string()).into_response()
    }
}
